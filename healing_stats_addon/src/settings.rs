// User-facing relay options.
//
// The host's settings UI writes these as JSON next to the addon. Every key
// is optional; missing keys take the defaults below, and unknown keys are
// ignored so older addons can read newer files.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddonSettings {
    /// `host` or `host:port`. Empty disables connecting.
    pub relay_endpoint: String,
    pub relay_enabled: bool,
    pub budget_mode: bool,
    pub disable_encryption: bool,
    /// PEM bundle of trusted roots, re-read on every connection attempt.
    pub root_certificates_path: Option<PathBuf>,
    pub reconnect_interval_ms: u64,
    pub max_queued_events: usize,
}

impl Default for AddonSettings {
    fn default() -> Self {
        Self {
            relay_endpoint: String::new(),
            relay_enabled: true,
            budget_mode: false,
            disable_encryption: false,
            root_certificates_path: None,
            reconnect_interval_ms: 5000,
            max_queued_events: 5000,
        }
    }
}

impl AddonSettings {
    pub fn from_json_str(json: &str) -> Result<Self, SettingsError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, SettingsError> {
        let text = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String, SettingsError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_take_defaults() {
        let settings =
            AddonSettings::from_json_str(r#"{ "relay_endpoint": "relay.example.com" }"#).unwrap();
        assert_eq!(settings.relay_endpoint, "relay.example.com");
        assert!(settings.relay_enabled);
        assert_eq!(settings.reconnect_interval(), Duration::from_secs(5));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let settings = AddonSettings::from_json_str(r#"{ "theme": "dark" }"#).unwrap();
        assert_eq!(settings, AddonSettings::default());
    }

    #[test]
    fn saved_settings_load_back() {
        let settings = AddonSettings {
            budget_mode: true,
            root_certificates_path: Some("roots.pem".into()),
            ..AddonSettings::default()
        };
        let json = settings.to_json_string().unwrap();
        assert_eq!(AddonSettings::from_json_str(&json).unwrap(), settings);
    }

    #[test]
    fn unreadable_file_names_the_path() {
        let err = AddonSettings::from_json_file(Path::new("/nonexistent/settings.json"))
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/settings.json"));
    }
}
