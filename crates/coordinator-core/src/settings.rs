//! Versioned settings storage with atomic-rollback validation (§4.G
//! "Settings write").

use model::{RuntimeSettings, SettingsError};

/// Holds the single current, validated [`RuntimeSettings`] value.
pub struct SettingsStore {
    current: RuntimeSettings,
}

impl SettingsStore {
    /// Seeds the store with an already-valid initial value.
    #[must_use]
    pub fn new(initial: RuntimeSettings) -> Self {
        Self { current: initial }
    }

    /// A clone of the currently active settings.
    #[must_use]
    pub fn current(&self) -> RuntimeSettings {
        self.current.clone()
    }

    /// Validates `candidate` (per-field ranges, then cross-field
    /// constraints) and, only if both pass, commits it with its version
    /// bumped to `current.version + 1`. Any failure leaves the stored
    /// settings untouched and bumps no version (§8 invariant 9).
    pub fn update(&mut self, mut candidate: RuntimeSettings) -> Result<RuntimeSettings, SettingsError> {
        candidate.version = self.current.version;
        candidate.validate_all()?;
        candidate.version = self.current.version + 1;
        self.current = candidate.clone();
        Ok(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_update_bumps_version() {
        let mut store = SettingsStore::new(RuntimeSettings::default());
        let mut candidate = store.current();
        candidate.token_bucket_rate = 10.0;
        let applied = store.update(candidate).expect("valid update");
        assert_eq!(applied.version, 2);
        assert_eq!(store.current().token_bucket_rate, 10.0);
    }

    #[test]
    fn invalid_update_rolls_back_and_keeps_version() {
        let mut store = SettingsStore::new(RuntimeSettings::default());
        let before = store.current();
        let mut candidate = before.clone();
        candidate.min_concurrency = 20;
        candidate.initial_concurrency = 5;
        assert!(store.update(candidate).is_err());
        let after = store.current();
        assert_eq!(after.version, before.version);
        assert_eq!(after.min_concurrency, before.min_concurrency);
    }
}
