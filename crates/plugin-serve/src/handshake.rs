//! The one-line readiness announcement written to stdout.
//!
//! Format: `CORE|APP|NETWORK|ADDRESS|PROTOCOL[|CERT]`, newline terminated.
//! The host reads exactly one line from the child's stdout and connects to
//! the address it names.

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use crate::bridge::transport::NetworkType;

/// Version of the handshake line format itself.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Wire protocol token: length-delimited JSON frames.
pub const WIRE_PROTOCOL: &str = "jsonframe";

const DELIMITER: char = '|';

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake write failed: {0}")]
    Write(#[source] io::Error),

    #[error("malformed handshake line: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRecord {
    pub core_protocol_version: u32,
    pub app_protocol_version: u32,
    pub network: NetworkType,
    pub address: String,
    pub protocol: String,
    /// Server certificate fingerprint, when the session is TLS-protected.
    pub server_cert: Option<String>,
}

impl HandshakeRecord {
    pub fn new(
        app_protocol_version: u32,
        network: NetworkType,
        address: impl Into<String>,
    ) -> Self {
        Self {
            core_protocol_version: CORE_PROTOCOL_VERSION,
            app_protocol_version,
            network,
            address: address.into(),
            protocol: WIRE_PROTOCOL.to_string(),
            server_cert: None,
        }
    }

    pub fn with_core_protocol_version(mut self, version: u32) -> Self {
        self.core_protocol_version = version;
        self
    }

    /// Render without the trailing newline.
    ///
    /// Fails if a free-form field would break the line format.
    pub fn to_line(&self) -> Result<String, HandshakeError> {
        check_field("address", &self.address)?;
        check_field("protocol", &self.protocol)?;
        if let Some(cert) = &self.server_cert {
            check_field("server certificate", cert)?;
        }
        Ok(self.to_string())
    }

    pub fn parse(line: &str) -> Result<Self, HandshakeError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let fields: Vec<&str> = line.split(DELIMITER).collect();
        if !(5..=6).contains(&fields.len()) {
            return Err(HandshakeError::Malformed(format!(
                "expected 5 or 6 fields, got {}",
                fields.len()
            )));
        }

        let version = |name: &str, raw: &str| {
            raw.parse::<u32>()
                .map_err(|e| HandshakeError::Malformed(format!("{name} version {raw:?}: {e}")))
        };
        let network = fields[2]
            .parse::<NetworkType>()
            .map_err(|e| HandshakeError::Malformed(e.to_string()))?;
        if fields[3].is_empty() {
            return Err(HandshakeError::Malformed("empty address".to_string()));
        }

        Ok(Self {
            core_protocol_version: version("core", fields[0])?,
            app_protocol_version: version("app", fields[1])?,
            network,
            address: fields[3].to_string(),
            protocol: fields[4].to_string(),
            server_cert: fields.get(5).map(|s| s.to_string()),
        })
    }
}

fn check_field(name: &str, value: &str) -> Result<(), HandshakeError> {
    if value.contains(DELIMITER) || value.contains(['\n', '\r']) {
        return Err(HandshakeError::Malformed(format!(
            "{name} contains a delimiter or line break: {value:?}"
        )));
    }
    Ok(())
}

impl fmt::Display for HandshakeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.core_protocol_version,
            self.app_protocol_version,
            self.network,
            self.address,
            self.protocol
        )?;
        if let Some(cert) = &self.server_cert {
            write!(f, "|{cert}")?;
        }
        Ok(())
    }
}

impl FromStr for HandshakeRecord {
    type Err = HandshakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Writes the handshake line exactly once.
pub struct HandshakeEmitter<W: Write> {
    out: W,
}

impl HandshakeEmitter<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> HandshakeEmitter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Write the line and flush. Consumes the emitter.
    pub fn emit(mut self, record: &HandshakeRecord) -> Result<(), HandshakeError> {
        let line = record.to_line()?;
        writeln!(self.out, "{line}").map_err(HandshakeError::Write)?;
        self.out.flush().map_err(HandshakeError::Write)?;
        tracing::debug!(handshake = %line, "Handshake emitted");
        Ok(())
    }
}
