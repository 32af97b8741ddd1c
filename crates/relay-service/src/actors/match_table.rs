//! Symmetric partner table.
//!
//! Invariants maintained by every mutation:
//! - if `a -> b` then `b -> a`
//! - an identity appears at most once as a key
//! - no identity is paired with itself

use std::collections::HashMap;

/// Identity -> partner identity.
#[derive(Debug, Default)]
pub struct MatchTable {
    partners: HashMap<String, String>,
}

impl MatchTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair two unmatched identities.
    ///
    /// Returns `false` and leaves the table unchanged if `a == b` or either
    /// side already has a partner.
    pub fn pair(&mut self, a: &str, b: &str) -> bool {
        if a == b || self.partners.contains_key(a) || self.partners.contains_key(b) {
            return false;
        }
        self.partners.insert(a.to_string(), b.to_string());
        self.partners.insert(b.to_string(), a.to_string());
        true
    }

    /// Remove `identity` and its partner from the table.
    ///
    /// Returns the former partner, or `None` if `identity` was unmatched.
    pub fn unpair(&mut self, identity: &str) -> Option<String> {
        let partner = self.partners.remove(identity)?;
        self.partners.remove(&partner);
        Some(partner)
    }

    #[must_use]
    pub fn partner_of(&self, identity: &str) -> Option<&str> {
        self.partners.get(identity).map(String::as_str)
    }

    #[must_use]
    pub fn is_matched(&self, identity: &str) -> bool {
        self.partners.contains_key(identity)
    }

    /// Number of pairs.
    #[must_use]
    pub fn pair_count(&self) -> usize {
        self.partners.len() / 2
    }

    /// Number of identities with a partner.
    #[must_use]
    pub fn matched_count(&self) -> usize {
        self.partners.len()
    }

    /// Iterate `(identity, partner)` entries; each pair appears twice.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.partners
            .iter()
            .map(|(identity, partner)| (identity.as_str(), partner.as_str()))
    }

    /// Remove every pair.
    pub fn clear(&mut self) {
        self.partners.clear();
    }
}
