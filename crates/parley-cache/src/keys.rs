//! Redis key builders for the expert status mirror
//!
//! # Key Patterns
//!
//! - `expert_busy:{expert_id}` - `"1"` while the expert's slot is held
//! - `expert_session:{expert_id}` - id of the session bound to the slot
//! - `expert_remaining_intervals:{expert_id}` - intervals the payer can still afford
//!
//! # Example
//!
//! ```
//! use parley_cache::keys;
//!
//! assert_eq!(keys::expert_busy_key("e1"), "expert_busy:e1");
//! ```

/// Format: `expert_busy:{expert_id}`
pub const EXPERT_BUSY_PREFIX: &str = "expert_busy";

/// Format: `expert_session:{expert_id}`
pub const EXPERT_SESSION_PREFIX: &str = "expert_session";

/// Format: `expert_remaining_intervals:{expert_id}`
pub const EXPERT_REMAINING_PREFIX: &str = "expert_remaining_intervals";

/// Safety TTL for mirrored keys (12 hours)
///
/// Keys are deleted explicitly when the slot frees; the TTL only bounds
/// leftovers from a crashed process.
pub const STATUS_TTL_SECS: u64 = 43200;

pub fn expert_busy_key(expert_id: &str) -> String {
    format!("{}:{}", EXPERT_BUSY_PREFIX, expert_id)
}

pub fn expert_session_key(expert_id: &str) -> String {
    format!("{}:{}", EXPERT_SESSION_PREFIX, expert_id)
}

pub fn expert_remaining_key(expert_id: &str) -> String {
    format!("{}:{}", EXPERT_REMAINING_PREFIX, expert_id)
}

/// Every key mirrored for one expert
pub fn expert_keys(expert_id: &str) -> [String; 3] {
    [
        expert_busy_key(expert_id),
        expert_session_key(expert_id),
        expert_remaining_key(expert_id),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_formats() {
        assert_eq!(expert_busy_key("e1"), "expert_busy:e1");
        assert_eq!(expert_session_key("e1"), "expert_session:e1");
        assert_eq!(
            expert_remaining_key("e1"),
            "expert_remaining_intervals:e1"
        );
    }

    #[test]
    fn test_expert_keys_are_distinct() {
        let keys = expert_keys("abc");
        assert_eq!(keys.len(), 3);
        assert_ne!(keys[0], keys[1]);
        assert_ne!(keys[1], keys[2]);
        assert!(keys.iter().all(|k| k.ends_with(":abc")));
    }
}
