//! Vendor capability cache
//!
//! Read-mostly cache of payment capabilities per vendor (accepted
//! tokens, preferred chain), merged into micro-payment metadata.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Payment hints a vendor advertises.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VendorCapabilities {
    pub accepted_tokens: Vec<String>,
    pub preferred_chain: String,
}

/// Vendor capability lookup.
pub trait VendorCache: Send + Sync {
    fn lookup(&self, vendor: &str) -> Option<VendorCapabilities>;
}

/// In-memory vendor cache seeded at startup; updates are monotonic.
#[derive(Default)]
pub struct StaticVendorCache {
    vendors: std::sync::RwLock<HashMap<String, VendorCapabilities>>,
}

impl StaticVendorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, vendor: impl Into<String>, capabilities: VendorCapabilities) {
        if let Ok(mut vendors) = self.vendors.write() {
            vendors.insert(vendor.into(), capabilities);
        }
    }
}

impl VendorCache for StaticVendorCache {
    fn lookup(&self, vendor: &str) -> Option<VendorCapabilities> {
        self.vendors.read().ok()?.get(vendor).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_hit_and_miss() {
        let cache = StaticVendorCache::new();
        cache.insert(
            "email-delivery-api",
            VendorCapabilities {
                accepted_tokens: vec!["USDC".to_string()],
                preferred_chain: "base".to_string(),
            },
        );

        let hit = cache.lookup("email-delivery-api").unwrap();
        assert_eq!(hit.preferred_chain, "base");
        assert!(cache.lookup("unknown-vendor").is_none());
    }
}
