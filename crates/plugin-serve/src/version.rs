//! Version information for plugin-serve.

use crate::handshake::{CORE_PROTOCOL_VERSION, WIRE_PROTOCOL};

/// plugin-serve version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Reported by the built-in `PluginController.Ping` method.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VersionInfo {
    pub version: String,
    /// Handshake line format version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core_protocol: Option<u32>,
    /// Wire protocol token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            version: VERSION.to_string(),
            core_protocol: Some(CORE_PROTOCOL_VERSION),
            protocol: Some(WIRE_PROTOCOL.to_string()),
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }
}
