//! Per-scenario user identities
//!
//! Each scenario gets a UUID-shaped id derived from a fixed namespace, the
//! scenario id and a random salt, so concurrent scenarios never share rows.

use std::collections::HashMap;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// Namespace mixed into every generated identity
const NAMESPACE: &str = "agent-eval/user-isolation/v1";

/// Hands out cached, per-scenario user ids
#[derive(Debug)]
pub struct UserIsolationManager {
    enabled: bool,
    default_user_id: String,
    assigned: Mutex<HashMap<String, String>>,
}

impl UserIsolationManager {
    pub fn new(enabled: bool, default_user_id: &str) -> Self {
        Self {
            enabled,
            default_user_id: default_user_id.to_string(),
            assigned: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Identity for a scenario
    ///
    /// The first call for an id generates and caches a fresh identity; later
    /// calls return the cached value. With isolation disabled every scenario
    /// gets the shared default.
    pub fn get_user_id(&self, scenario_id: &str) -> String {
        if !self.enabled {
            return self.default_user_id.clone();
        }
        self.assigned
            .lock()
            .entry(scenario_id.to_string())
            .or_insert_with(|| generate_user_id(scenario_id, rand::random::<u64>()))
            .clone()
    }

    /// Snapshot of every assigned identity, keyed by scenario id
    pub fn assignments(&self) -> HashMap<String, String> {
        self.assigned.lock().clone()
    }
}

/// Hash namespace, scenario id and salt into a version 4 style UUID string
pub fn generate_user_id(scenario_id: &str, salt: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(NAMESPACE.as_bytes());
    hasher.update([0]);
    hasher.update(scenario_id.as_bytes());
    hasher.update([0]);
    hasher.update(salt.to_le_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use std::collections::HashSet;

    #[test]
    fn test_uuid_shape() {
        let re = Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
            .unwrap();
        for salt in 0..50 {
            assert!(re.is_match(&generate_user_id("scenario", salt)));
        }
    }

    #[test]
    fn test_cached_per_scenario() {
        let manager = UserIsolationManager::new(true, "default");
        let first = manager.get_user_id("a");
        assert_eq!(manager.get_user_id("a"), first);
        assert_ne!(manager.get_user_id("b"), first);
        assert_ne!(first, "default");
        assert_eq!(manager.assignments().len(), 2);
    }

    #[test]
    fn test_distinct_ids_are_distinct() {
        let manager = UserIsolationManager::new(true, "default");
        let ids: HashSet<String> = (0..500)
            .map(|i| manager.get_user_id(&format!("scenario-{}", i)))
            .collect();
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn test_salt_changes_identity() {
        assert_ne!(generate_user_id("a", 1), generate_user_id("a", 2));
        assert_eq!(generate_user_id("a", 1), generate_user_id("a", 1));
    }

    #[test]
    fn test_disabled_returns_default_without_caching() {
        let manager = UserIsolationManager::new(false, "shared");
        assert_eq!(manager.get_user_id("a"), "shared");
        assert_eq!(manager.get_user_id("b"), "shared");
        assert!(manager.assignments().is_empty());
    }
}
