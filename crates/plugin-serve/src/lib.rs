//! plugin-serve: expose capability objects to a host process over a local
//! socket, announced by a one-line handshake on stdout.

mod call;
mod error;
mod stdio;
mod version;

pub mod bridge;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod handshake;
pub mod lifecycle;
pub mod logging;
pub mod registry;
pub mod server;

pub use bridge::protocol::{CallEnvelope, CallId, ErrorKind, Request, Response};
pub use bridge::transport::{Listener, ListenerHandle, NetworkType, Session, TransportError};
pub use call::{CallContext, CallError};
pub use client::{ClientError, PendingCall, PluginClient};
pub use config::{ConfigError, HandshakeConfig, ServeConfig};
pub use dispatcher::{DispatchSummary, Dispatcher};
pub use error::ServeError;
pub use handshake::{HandshakeEmitter, HandshakeError, HandshakeRecord};
pub use lifecycle::{Lifecycle, LifecycleState, StopReason};
pub use registry::{BoundMethod, Capability, CapabilityBuilder, Registry, RegistryError};
pub use server::{CONTROLLER_CAPABILITY, Plugin, PluginServer, serve_plugin, serve_plugin_with};
pub use stdio::isolate_stdout;
pub use version::{VERSION, VersionInfo};
