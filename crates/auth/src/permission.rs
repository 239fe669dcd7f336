//! Permission evaluation with colon-segment wildcards.
//!
//! `model:*` grants `model:read` and `model:write`; `*` grants
//! everything. Matching is exact otherwise.

use std::collections::BTreeSet;

/// Whether a single granted permission satisfies a required one.
pub fn permission_matches(granted: &str, required: &str) -> bool {
    if granted == "*" || granted == required {
        return true;
    }
    if let Some(prefix) = granted.strip_suffix(":*") {
        return required
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with(':'));
    }
    false
}

/// Whether any granted permission satisfies the required one.
pub fn has_permission(granted: &BTreeSet<String>, required: &str) -> bool {
    granted.iter().any(|g| permission_matches(g, required))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perms(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exact_match() {
        assert!(has_permission(&perms(&["model:read"]), "model:read"));
        assert!(!has_permission(&perms(&["model:read"]), "model:write"));
    }

    #[test]
    fn segment_wildcard() {
        let granted = perms(&["model:*"]);
        assert!(has_permission(&granted, "model:read"));
        assert!(has_permission(&granted, "model:write"));
        assert!(!has_permission(&granted, "keys:read"));
    }

    #[test]
    fn global_wildcard() {
        let granted = perms(&["*"]);
        assert!(has_permission(&granted, "model:read"));
        assert!(has_permission(&granted, "anything:at:all"));
    }

    #[test]
    fn wildcard_does_not_match_its_own_prefix() {
        // "model:*" grants operations under model, not the bare segment
        assert!(!permission_matches("model:*", "model"));
        // And not lookalike prefixes
        assert!(!permission_matches("model:*", "models:read"));
    }

    #[test]
    fn empty_grants_nothing() {
        assert!(!has_permission(&BTreeSet::new(), "model:read"));
    }
}
