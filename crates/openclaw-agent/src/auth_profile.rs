//! Auth-profile store — rotatable API credentials with per-profile cooldown.
//!
//! Generalizes [`crate::router::ProviderRouter`]'s provider-level retry slots
//! into credential-level rotation: several profiles can share one provider,
//! each with its own usage/cooldown bookkeeping, selected by
//! [`AuthProfileStore::select`] the way [`crate::run_loop`] needs for §4.3
//! step 1 and step 6 of the run loop.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// How an auth profile was chosen for the current attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileSource {
    /// Explicitly requested by the caller (a user pin). Bypasses cooldown
    /// on selection; cooldown is cleared on success, never rotated away.
    User,
    /// Chosen automatically: least-recently-used profile not in cooldown.
    Auto,
}

/// A single stored credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthProfile {
    pub id: String,
    pub provider: String,
    pub credential: String,
}

/// Usage bookkeeping for one profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageStats {
    pub last_used_ms: Option<i64>,
    pub cooldown_until_ms: Option<i64>,
}

/// Why no profile could be selected.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SelectError {
    #[error("no auth profile registered for provider '{provider}'")]
    NoProfileForProvider { provider: String },
    #[error("profile '{id}' is unknown")]
    UnknownProfile { id: String },
    #[error("all profiles for provider '{provider}' are in cooldown")]
    AllInCooldown { provider: String },
}

/// Default cooldown applied after a rate-limit hit, per §4.3 step 6.
pub const DEFAULT_COOLDOWN_MS: i64 = 60 * 60 * 1000;

/// Map of profile-id → (provider, credential), plus per-profile usage stats.
///
/// Mirrors [`crate::health::HealthTracker`]'s shape (a `RwLock`-guarded map
/// updated from real call outcomes) but keyed by profile rather than
/// provider, since several profiles can share one provider.
pub struct AuthProfileStore {
    profiles: RwLock<HashMap<String, AuthProfile>>,
    usage: RwLock<HashMap<String, UsageStats>>,
}

impl AuthProfileStore {
    pub fn new(profiles: Vec<AuthProfile>) -> Self {
        let map = profiles.into_iter().map(|p| (p.id.clone(), p)).collect();
        Self {
            profiles: RwLock::new(map),
            usage: RwLock::new(HashMap::new()),
        }
    }

    pub fn profiles_for(&self, provider: &str) -> Vec<AuthProfile> {
        self.profiles
            .read()
            .unwrap()
            .values()
            .filter(|p| p.provider == provider)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<AuthProfile> {
        self.profiles.read().unwrap().get(id).cloned()
    }

    fn usage_of(&self, id: &str) -> UsageStats {
        self.usage.read().unwrap().get(id).cloned().unwrap_or_default()
    }

    fn is_in_cooldown(&self, id: &str, now_ms: i64) -> bool {
        self.usage_of(id).cooldown_until_ms.map(|until| until > now_ms).unwrap_or(false)
    }

    /// §4.3 step 1. `pinned` is `Some(id)` when the caller (a user) asked
    /// for a specific profile by id; `None` selects automatically.
    pub fn select(
        &self,
        provider: &str,
        pinned: Option<&str>,
        now_ms: i64,
    ) -> Result<(AuthProfile, ProfileSource), SelectError> {
        if let Some(id) = pinned {
            let profile = self
                .get(id)
                .ok_or_else(|| SelectError::UnknownProfile { id: id.to_string() })?;
            // A user pin is used even in cooldown — it bypasses cooldown on
            // its own turn, per the spec's AuthProfileStore invariant.
            return Ok((profile, ProfileSource::User));
        }

        let mut candidates = self.profiles_for(provider);
        if candidates.is_empty() {
            return Err(SelectError::NoProfileForProvider { provider: provider.to_string() });
        }
        candidates.retain(|p| !self.is_in_cooldown(&p.id, now_ms));
        if candidates.is_empty() {
            return Err(SelectError::AllInCooldown { provider: provider.to_string() });
        }
        // Least-recently-used: profiles never used sort first (None < Some).
        candidates.sort_by_key(|p| self.usage_of(&p.id).last_used_ms.unwrap_or(0));
        Ok((candidates.remove(0), ProfileSource::Auto))
    }

    /// Record a successful use. Clears cooldown — including for a pinned
    /// profile that was used while in cooldown, per the spec's decision to
    /// only clear on success (see SPEC_FULL.md §9 Open Question 1).
    pub fn record_success(&self, id: &str, now_ms: i64) {
        let mut usage = self.usage.write().unwrap();
        let entry = usage.entry(id.to_string()).or_default();
        entry.last_used_ms = Some(now_ms);
        entry.cooldown_until_ms = None;
    }

    /// Record a rate-limit hit: bump `last_used_ms` and arm a cooldown.
    /// A failure on a *pinned* profile never touches its cooldown — pins
    /// never rotate away from themselves (§4.3 step 6).
    pub fn record_rate_limit(&self, id: &str, now_ms: i64, cooldown_ms: i64) {
        let mut usage = self.usage.write().unwrap();
        let entry = usage.entry(id.to_string()).or_default();
        entry.last_used_ms = Some(now_ms);
        entry.cooldown_until_ms = Some(now_ms + cooldown_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str, provider: &str) -> AuthProfile {
        AuthProfile { id: id.to_string(), provider: provider.to_string(), credential: "k".to_string() }
    }

    #[test]
    fn auto_select_prefers_least_recently_used() {
        let store = AuthProfileStore::new(vec![profile("p1", "openai"), profile("p2", "openai")]);
        store.record_success("p1", 1000);
        let (chosen, source) = store.select("openai", None, 2000).unwrap();
        assert_eq!(chosen.id, "p2");
        assert_eq!(source, ProfileSource::Auto);
    }

    #[test]
    fn cooled_down_profile_excluded_from_auto_selection() {
        let store = AuthProfileStore::new(vec![profile("p1", "openai"), profile("p2", "openai")]);
        store.record_rate_limit("p1", 1000, DEFAULT_COOLDOWN_MS);
        let (chosen, _) = store.select("openai", None, 1500).unwrap();
        assert_eq!(chosen.id, "p2");
    }

    #[test]
    fn all_in_cooldown_rejects_selection() {
        let store = AuthProfileStore::new(vec![profile("p1", "openai")]);
        store.record_rate_limit("p1", 1000, DEFAULT_COOLDOWN_MS);
        let err = store.select("openai", None, 1500).unwrap_err();
        assert!(matches!(err, SelectError::AllInCooldown { .. }));
    }

    #[test]
    fn user_pin_bypasses_cooldown() {
        let store = AuthProfileStore::new(vec![profile("p1", "openai")]);
        store.record_rate_limit("p1", 1000, DEFAULT_COOLDOWN_MS);
        let (chosen, source) = store.select("openai", Some("p1"), 1001).unwrap();
        assert_eq!(chosen.id, "p1");
        assert_eq!(source, ProfileSource::User);
    }

    #[test]
    fn success_clears_cooldown() {
        let store = AuthProfileStore::new(vec![profile("p1", "openai")]);
        store.record_rate_limit("p1", 1000, DEFAULT_COOLDOWN_MS);
        store.record_success("p1", 1001);
        assert!(store.select("openai", None, 1002).is_ok());
    }
}
