//! C2S engine configuration.

use std::collections::HashSet;

use serde::Deserialize;

use crate::transport::CompressionLevel;

/// Policy applied when a bind request collides with an already-bound
/// resource on the same account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResourceConflictPolicy {
    /// Reject the bind with a `<conflict/>` stanza error
    #[default]
    Disallow,
    /// Mint a server-generated resource instead
    Override,
    /// Disconnect the previously bound stream, then accept
    Replace,
}

/// Stream compression settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub level: CompressionLevel,
}

/// Roster module settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RosterConfig {
    /// Advertise roster versioning in the authenticated features
    pub versioning: bool,
}

/// Offline message module settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Maximum number of queued messages per user
    pub queue_size: usize,
    /// Whether chat and groupchat messages with a body are archived
    pub archive_chat: bool,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            queue_size: 2048,
            archive_chat: true,
        }
    }
}

/// In-band registration settings (XEP-0077).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub allow_registration: bool,
    pub allow_cancellation: bool,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            allow_registration: true,
            allow_cancellation: false,
        }
    }
}

/// Software version module settings (XEP-0092).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VersionConfig {
    pub show_os: bool,
}

/// Ping module settings (XEP-0199).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    /// Whether the server probes idle clients
    pub send: bool,
    /// Idle seconds before a probe, and probe-to-timeout window
    pub send_interval: u64,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            send: false,
            send_interval: 60,
        }
    }
}

/// Feature module configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    /// Enabled module tags: registration, last_activity, private, vcard,
    /// version, blocking_command, ping, offline
    pub enabled: HashSet<String>,
    pub roster: RosterConfig,
    pub offline: OfflineConfig,
    pub registration: RegistrationConfig,
    pub version: VersionConfig,
    pub ping: PingConfig,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            enabled: [
                "registration",
                "last_activity",
                "private",
                "vcard",
                "version",
                "blocking_command",
                "ping",
                "offline",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            roster: RosterConfig::default(),
            offline: OfflineConfig::default(),
            registration: RegistrationConfig::default(),
            version: VersionConfig::default(),
            ping: PingConfig::default(),
        }
    }
}

impl ModulesConfig {
    pub fn is_enabled(&self, tag: &str) -> bool {
        self.enabled.contains(tag)
    }
}

/// Per-stream engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct C2sConfig {
    /// Maximum size in bytes of a single stanza (0 = unlimited)
    pub max_stanza_size: usize,
    /// Seconds to wait for the initial stream open (0 = no timeout)
    pub connect_timeout: u64,
    pub resource_conflict: ResourceConflictPolicy,
    /// SASL mechanisms offered, in advertisement order: plain, digest_md5,
    /// scram_sha_1, scram_sha_256
    pub sasl: Vec<String>,
    pub compression: CompressionConfig,
    pub modules: ModulesConfig,
}

impl Default for C2sConfig {
    fn default() -> Self {
        Self {
            max_stanza_size: 32 * 1024,
            connect_timeout: 5,
            resource_conflict: ResourceConflictPolicy::default(),
            sasl: vec![
                "scram_sha_256".to_string(),
                "scram_sha_1".to_string(),
                "digest_md5".to_string(),
                "plain".to_string(),
            ],
            compression: CompressionConfig::default(),
            modules: ModulesConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = C2sConfig::default();
        assert_eq!(cfg.max_stanza_size, 32 * 1024);
        assert_eq!(cfg.resource_conflict, ResourceConflictPolicy::Disallow);
        assert!(cfg.modules.is_enabled("ping"));
        assert!(cfg.modules.offline.archive_chat);
        assert_eq!(cfg.sasl.first().map(String::as_str), Some("scram_sha_256"));
    }

    #[test]
    fn test_deserialize_partial() {
        let cfg: C2sConfig = serde_json::from_str(
            r#"{"max_stanza_size": 100, "resource_conflict": "replace"}"#,
        )
        .unwrap();
        assert_eq!(cfg.max_stanza_size, 100);
        assert_eq!(cfg.resource_conflict, ResourceConflictPolicy::Replace);
        // untouched fields keep their defaults
        assert_eq!(cfg.connect_timeout, 5);
    }
}
