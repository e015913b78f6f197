use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Profile of a specialist agent in the population.
///
/// Agents are data, not subclasses: behavior comes from composing the
/// shared runtime with the profile's instructions and tool set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentProfile {
    /// Unique agent name (e.g. "builder", "qa", "marketing")
    pub name: String,
    /// Capability tags used for cross-agent pattern sharing
    pub capabilities: BTreeSet<String>,
    /// System instructions injected into every prompt
    pub instructions: String,
    /// Names of tools this agent may invoke
    pub tool_set: Vec<String>,
}

impl AgentProfile {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: BTreeSet::new(),
            instructions: instructions.into(),
            tool_set: Vec::new(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool_set = tools.into_iter().map(Into::into).collect();
        self
    }

    /// Fraction of this agent's capabilities shared with another profile.
    ///
    /// Used by the evolution engine to decide whether a cross-agent
    /// pattern is applicable.
    pub fn capability_overlap(&self, other: &AgentProfile) -> f64 {
        if self.capabilities.is_empty() || other.capabilities.is_empty() {
            return 0.0;
        }
        let shared = self.capabilities.intersection(&other.capabilities).count();
        let union = self.capabilities.union(&other.capabilities).count();
        shared as f64 / union as f64
    }
}

/// Registry resolving agent names to profiles.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    profiles: HashMap<String, AgentProfile>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, profile: AgentProfile) {
        self.profiles.insert(profile.name.clone(), profile);
    }

    pub fn get(&self, name: &str) -> Option<&AgentProfile> {
        self.profiles.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_overlap() {
        let qa = AgentProfile::new("qa", "validate")
            .with_capabilities(["code_analysis", "validation", "testing"]);
        let legal = AgentProfile::new("legal", "review")
            .with_capabilities(["validation", "compliance"]);

        let overlap = qa.capability_overlap(&legal);
        assert!(overlap > 0.0 && overlap < 1.0);

        let unrelated = AgentProfile::new("seo", "rank").with_capabilities(["keywords"]);
        assert_eq!(qa.capability_overlap(&unrelated), 0.0);
    }

    #[test]
    fn test_registry_resolution() {
        let mut registry = AgentRegistry::new();
        registry.register(AgentProfile::new("builder", "build things"));
        registry.register(AgentProfile::new("support", "help users"));

        assert_eq!(registry.len(), 2);
        assert!(registry.get("builder").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["builder", "support"]);
    }
}
