//! Serving configuration.
//!
//! Built from defaults plus `with_*` overrides, or from the environment the
//! host sets when it spawns the plugin (`ServeConfig::from_env`).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::bridge::transport::NetworkType;
use crate::error::ServeError;

pub const ENV_PROTOCOL_VERSIONS: &str = "PLUGIN_PROTOCOL_VERSIONS";
pub const ENV_NETWORK: &str = "PLUGIN_NETWORK";
pub const ENV_UNIX_SOCKET_DIR: &str = "PLUGIN_UNIX_SOCKET_DIR";
pub const ENV_MIN_PORT: &str = "PLUGIN_MIN_PORT";
pub const ENV_MAX_PORT: &str = "PLUGIN_MAX_PORT";
pub const ENV_GRACE_PERIOD_MS: &str = "PLUGIN_GRACE_PERIOD_MS";

pub const DEFAULT_MAGIC_COOKIE_KEY: &str = "PLUGIN_MAGIC_COOKIE";
pub const DEFAULT_MAGIC_COOKIE_VALUE: &str =
    "7c4e0f5c1b9a2d8e3f60a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8091a2b3c";

const DEFAULT_PORT_RANGE: (u16, u16) = (10000, 25000);
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

const NOT_LAUNCHED_BY_HOST: &str = "This binary is a plugin. These are not meant to be executed \
     directly. Please execute the program that consumes these plugins, which will load any \
     plugins automatically";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Values shared with the host ahead of time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    pub core_protocol_version: u32,
    pub app_protocol_version: u32,
    /// Empty key disables the cookie check.
    pub magic_cookie_key: String,
    pub magic_cookie_value: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            core_protocol_version: crate::handshake::CORE_PROTOCOL_VERSION,
            app_protocol_version: 1,
            magic_cookie_key: DEFAULT_MAGIC_COOKIE_KEY.to_string(),
            magic_cookie_value: DEFAULT_MAGIC_COOKIE_VALUE.to_string(),
        }
    }
}

impl HandshakeConfig {
    /// Check that the host set the magic cookie. `lookup` reads one
    /// environment variable.
    pub fn verify_magic_cookie<F>(&self, lookup: F) -> Result<(), ServeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.magic_cookie_key.is_empty() {
            return Ok(());
        }
        match lookup(&self.magic_cookie_key) {
            Some(value) if value == self.magic_cookie_value => Ok(()),
            _ => Err(ServeError::NotLaunchedByHost(NOT_LAUNCHED_BY_HOST.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub handshake: HandshakeConfig,
    /// App protocol versions this plugin speaks.
    pub supported_versions: Vec<u32>,
    /// Versions offered by the host, if it announced any.
    pub host_versions: Option<Vec<u32>>,
    pub network: NetworkType,
    pub socket_dir: Option<PathBuf>,
    pub port_range: (u16, u16),
    pub grace_period: Duration,
    pub ignore_interrupt: bool,
    pub isolate_stdout: bool,
}

impl Default for ServeConfig {
    fn default() -> Self {
        let handshake = HandshakeConfig::default();
        Self {
            supported_versions: vec![handshake.app_protocol_version],
            handshake,
            host_versions: None,
            network: NetworkType::platform_default(),
            socket_dir: None,
            port_range: DEFAULT_PORT_RANGE,
            grace_period: DEFAULT_GRACE_PERIOD,
            ignore_interrupt: true,
            isolate_stdout: false,
        }
    }
}

impl ServeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or empty keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self {
            isolate_stdout: true,
            ..Self::default()
        };

        if let Some(raw) = get(ENV_PROTOCOL_VERSIONS) {
            config.host_versions = Some(parse_versions(&raw)?);
        }

        if let Some(raw) = get(ENV_NETWORK) {
            config.network = NetworkType::from_str(raw.trim()).map_err(|e| ConfigError::Invalid {
                key: ENV_NETWORK,
                value: raw.clone(),
                reason: e.to_string(),
            })?;
        }

        if let Some(dir) = get(ENV_UNIX_SOCKET_DIR) {
            config.socket_dir = Some(PathBuf::from(dir));
        }

        let min_port = match get(ENV_MIN_PORT) {
            Some(raw) => parse_number::<u16>(ENV_MIN_PORT, &raw)?,
            None => DEFAULT_PORT_RANGE.0,
        };
        let max_port = match get(ENV_MAX_PORT) {
            Some(raw) => parse_number::<u16>(ENV_MAX_PORT, &raw)?,
            None => DEFAULT_PORT_RANGE.1,
        };
        if min_port > max_port {
            return Err(ConfigError::Invalid {
                key: ENV_MIN_PORT,
                value: min_port.to_string(),
                reason: format!("greater than {ENV_MAX_PORT} ({max_port})"),
            });
        }
        config.port_range = (min_port, max_port);

        if let Some(raw) = get(ENV_GRACE_PERIOD_MS) {
            let ms = parse_number::<u64>(ENV_GRACE_PERIOD_MS, &raw)?;
            config.grace_period = Duration::from_millis(ms);
        }

        Ok(config)
    }

    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.supported_versions = vec![handshake.app_protocol_version];
        self.handshake = handshake;
        self
    }

    pub fn with_magic_cookie(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.handshake.magic_cookie_key = key.into();
        self.handshake.magic_cookie_value = value.into();
        self
    }

    /// Skip the magic cookie check.
    pub fn without_magic_cookie(self) -> Self {
        self.with_magic_cookie("", "")
    }

    pub fn with_supported_versions(mut self, versions: impl Into<Vec<u32>>) -> Self {
        self.supported_versions = versions.into();
        self
    }

    pub fn with_host_versions(mut self, versions: impl Into<Vec<u32>>) -> Self {
        self.host_versions = Some(versions.into());
        self
    }

    pub fn with_network(mut self, network: NetworkType) -> Self {
        self.network = network;
        self
    }

    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = Some(dir.into());
        self
    }

    pub fn with_port_range(mut self, min: u16, max: u16) -> Self {
        self.port_range = (min, max);
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_ignore_interrupt(mut self, ignore: bool) -> Self {
        self.ignore_interrupt = ignore;
        self
    }

    pub fn with_isolate_stdout(mut self, isolate: bool) -> Self {
        self.isolate_stdout = isolate;
        self
    }

    /// App protocol version to announce.
    ///
    /// Without a host offer this is the configured app version. Otherwise the
    /// highest version both sides support.
    pub fn negotiate_version(&self) -> Result<u32, ServeError> {
        let Some(offered) = &self.host_versions else {
            return Ok(self.handshake.app_protocol_version);
        };
        offered
            .iter()
            .filter(|v| self.supported_versions.contains(v))
            .max()
            .copied()
            .ok_or_else(|| ServeError::NoCompatibleVersion {
                supported: self.supported_versions.clone(),
                offered: offered.clone(),
            })
    }
}

fn parse_number<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_versions(raw: &str) -> Result<Vec<u32>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_number::<u32>(ENV_PROTOCOL_VERSIONS, s))
        .collect()
}
