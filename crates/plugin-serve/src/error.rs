//! Fatal serving errors.

use std::io;

use crate::bridge::transport::TransportError;
use crate::config::ConfigError;
use crate::handshake::HandshakeError;
use crate::registry::RegistryError;

/// Why `serve_plugin` failed. Any of these maps to exit status 1.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    NotLaunchedByHost(String),

    #[error(
        "no compatible protocol version: plugin supports {supported:?}, host offered {offered:?}"
    )]
    NoCompatibleVersion { supported: Vec<u32>, offered: Vec<u32> },

    #[error("capability registration failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("listener closed before the host connected")]
    ListenerClosed,

    #[error("failed to write handshake: {0}")]
    HandshakeWriteFailed(#[source] io::Error),

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl From<TransportError> for ServeError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ListenerClosed => ServeError::ListenerClosed,
            TransportError::Unavailable(msg) => ServeError::TransportUnavailable(msg),
            other => ServeError::TransportUnavailable(other.to_string()),
        }
    }
}

impl From<HandshakeError> for ServeError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Write(e) => ServeError::HandshakeWriteFailed(e),
            HandshakeError::Malformed(msg) => {
                ServeError::HandshakeWriteFailed(io::Error::new(io::ErrorKind::InvalidInput, msg))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_convert() {
        let err: ServeError = TransportError::ListenerClosed.into();
        assert!(matches!(err, ServeError::ListenerClosed));

        let err: ServeError = TransportError::Unavailable("no dir".to_string()).into();
        assert_eq!(err.to_string(), "transport unavailable: no dir");
    }

    #[test]
    fn handshake_write_error_converts() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "stdout closed");
        let err: ServeError = HandshakeError::Write(io_err).into();
        assert!(matches!(err, ServeError::HandshakeWriteFailed(_)));
        assert_eq!(err.to_string(), "failed to write handshake: stdout closed");
    }

    #[test]
    fn unrenderable_handshake_is_a_handshake_failure() {
        let err: ServeError =
            HandshakeError::Malformed("address contains a delimiter".to_string()).into();
        match &err {
            ServeError::HandshakeWriteFailed(e) => {
                assert_eq!(e.kind(), io::ErrorKind::InvalidInput);
            }
            other => panic!("expected HandshakeWriteFailed, got {other:?}"),
        }
        assert_eq!(
            err.to_string(),
            "failed to write handshake: address contains a delimiter"
        );
    }

    #[test]
    fn registry_error_converts() {
        let err: ServeError = RegistryError::DuplicateCapability("HostPlugin".to_string()).into();
        assert_eq!(
            err.to_string(),
            "capability registration failed: capability already registered: HostPlugin"
        );
    }
}
