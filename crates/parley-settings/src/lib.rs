//! # parley-settings
//!
//! Configuration for the Parley gateway, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`ParleySettings::default()`]
//! 2. **Settings file**: `~/.parley/settings.json` or an explicit path (deep-merged over defaults)
//! 3. **Environment variables**: `PARLEY_*` overrides (highest priority)
//!
//! Library components never read the global; they are handed the values they
//! need when the binary builds its application context.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<ParleySettings> = OnceLock::new();

/// Get the global settings, loading them from the default path on first use.
/// Falls back to compiled defaults if loading fails.
pub fn get_settings() -> &'static ParleySettings {
    SETTINGS.get_or_init(|| load_settings().unwrap_or_default())
}

/// Initialize the global settings with a specific value.
///
/// Returns the settings back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: ParleySettings) -> std::result::Result<(), ParleySettings> {
    SETTINGS.set(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_match_documented_values() {
        let settings = ParleySettings::default();
        assert_eq!(settings.server.port, 8090);
        assert_eq!(settings.server.ws_path, "/ws");
        assert_eq!(settings.limits.max_devices_per_user, 5);
        assert_eq!(settings.limits.max_total_connections, 10_000);
        assert_eq!(settings.presence.ttl_secs, 60);
        assert_eq!(settings.fanout.backend, FanoutBackend::Memory);
        assert_eq!(settings.calls.ring_timeout_secs, 60);
    }

    #[test]
    fn re_exports_work() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"b": 2}));
        assert_eq!(merged["a"], 1);
        assert!(settings_path().ends_with("settings.json"));
    }
}
