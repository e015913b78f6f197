//! Refinement Terminator
//!
//! Early-stops iterative refinement loops once quality plateaus, so a
//! session that converged at round 3 does not pay for rounds 4 and 5.

use serde::{Deserialize, Serialize};
use tracing::debug;

const EPSILON: f64 = 1e-9;

/// Termination policy for a refinement session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefinementConfig {
    /// Rounds always run before termination is considered
    pub min_rounds: usize,
    /// Hard ceiling on rounds per session
    pub max_rounds: usize,
    /// Relative improvement below which the session has plateaued
    pub improvement_threshold: f64,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            min_rounds: 2,
            max_rounds: 4,
            improvement_threshold: 0.05,
        }
    }
}

/// Score produced by one refinement round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementRound {
    pub round: usize,
    pub score: f64,
}

/// What to do after the round that just completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationDecision {
    Continue,
    StopPlateau,
    StopMaxRounds,
}

impl TerminationDecision {
    pub fn is_stop(&self) -> bool {
        !matches!(self, TerminationDecision::Continue)
    }
}

/// Savings report comparing actual rounds against an always-max baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementSavings {
    pub sessions: usize,
    pub baseline_rounds: usize,
    pub actual_rounds: usize,
    pub savings: f64,
    pub savings_percent: f64,
}

/// Decides when a refinement loop should stop.
#[derive(Debug, Clone, Default)]
pub struct RefinementTerminator {
    config: RefinementConfig,
}

impl RefinementTerminator {
    pub fn new(config: RefinementConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RefinementConfig {
        &self.config
    }

    /// Decide after round `rounds.len()` whether to continue refining.
    ///
    /// The plateau rule only applies from `min_rounds` onward, and never
    /// overrides the `max_rounds` ceiling.
    pub fn decide(&self, rounds: &[RefinementRound]) -> TerminationDecision {
        let completed = rounds.len();
        if completed < self.config.min_rounds {
            return TerminationDecision::Continue;
        }
        if completed >= self.config.max_rounds {
            return TerminationDecision::StopMaxRounds;
        }

        if completed >= 2 {
            let current = rounds[completed - 1].score;
            let previous = rounds[completed - 2].score;
            let delta = (current - previous) / previous.max(EPSILON);
            debug!(
                "refinement round {}: score {:.3} -> {:.3} (delta {:.4})",
                completed, previous, current, delta
            );
            if delta < self.config.improvement_threshold {
                return TerminationDecision::StopPlateau;
            }
        }

        TerminationDecision::Continue
    }

    /// Compare actual refinement rounds against running every session to
    /// `max_rounds`, at a fixed cost per round.
    pub fn estimate_cost_savings(
        &self,
        sessions: &[Vec<RefinementRound>],
        cost_per_round: f64,
    ) -> RefinementSavings {
        let actual_rounds: usize = sessions.iter().map(|s| s.len()).sum();
        let baseline_rounds = sessions.len() * self.config.max_rounds;
        let saved_rounds = baseline_rounds.saturating_sub(actual_rounds);
        let savings = saved_rounds as f64 * cost_per_round;
        let savings_percent = if baseline_rounds > 0 {
            (saved_rounds as f64 / baseline_rounds as f64) * 100.0
        } else {
            0.0
        };

        RefinementSavings {
            sessions: sessions.len(),
            baseline_rounds,
            actual_rounds,
            savings,
            savings_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rounds(scores: &[f64]) -> Vec<RefinementRound> {
        scores
            .iter()
            .enumerate()
            .map(|(i, &score)| RefinementRound { round: i + 1, score })
            .collect()
    }

    #[test]
    fn test_continues_before_min_rounds() {
        let term = RefinementTerminator::default();
        assert_eq!(term.decide(&rounds(&[0.1])), TerminationDecision::Continue);
    }

    #[test]
    fn test_plateau_detection() {
        let term = RefinementTerminator::new(RefinementConfig {
            min_rounds: 2,
            max_rounds: 5,
            improvement_threshold: 0.05,
        });

        // 0.60 -> 0.80 is a 33% jump, keep going
        assert_eq!(
            term.decide(&rounds(&[0.60, 0.80])),
            TerminationDecision::Continue
        );

        // 0.80 -> 0.82 is 2.5%, below threshold
        assert_eq!(
            term.decide(&rounds(&[0.60, 0.80, 0.82])),
            TerminationDecision::StopPlateau
        );
    }

    #[test]
    fn test_max_rounds_ceiling() {
        let term = RefinementTerminator::default();
        // Strong improvement at the ceiling still stops
        assert_eq!(
            term.decide(&rounds(&[0.1, 0.3, 0.6, 0.9])),
            TerminationDecision::StopMaxRounds
        );
    }

    #[test]
    fn test_large_improvement_never_plateaus() {
        let term = RefinementTerminator::new(RefinementConfig {
            min_rounds: 2,
            max_rounds: 10,
            improvement_threshold: 0.05,
        });
        assert_eq!(
            term.decide(&rounds(&[0.2, 0.4, 0.8])),
            TerminationDecision::Continue
        );
    }

    #[test]
    fn test_zero_previous_score_is_guarded() {
        let term = RefinementTerminator::default();
        // Division by zero would otherwise poison the delta
        assert_eq!(
            term.decide(&rounds(&[0.0, 0.5])),
            TerminationDecision::Continue
        );
    }

    #[test]
    fn test_cost_savings_report() {
        let term = RefinementTerminator::new(RefinementConfig {
            min_rounds: 2,
            max_rounds: 5,
            improvement_threshold: 0.05,
        });

        let sessions = vec![rounds(&[0.60, 0.80, 0.82])];
        let savings = term.estimate_cost_savings(&sessions, 0.001);

        assert_eq!(savings.sessions, 1);
        assert_eq!(savings.baseline_rounds, 5);
        assert_eq!(savings.actual_rounds, 3);
        assert!((savings.savings - 0.002).abs() < 1e-12);
        assert!((savings.savings_percent - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_cost_savings_empty() {
        let term = RefinementTerminator::default();
        let savings = term.estimate_cost_savings(&[], 0.001);
        assert_eq!(savings.sessions, 0);
        assert_eq!(savings.savings_percent, 0.0);
    }
}
