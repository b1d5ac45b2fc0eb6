//! Session transport for host-plugin IPC.
//!
//! The plugin side binds a fresh local endpoint, announces it in the handshake,
//! and accepts exactly one connection from the host:
//! - **Unix**: socket file in a private temp directory (removed on drop)
//! - **Tcp**: first free loopback port in the configured range

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::ServeConfig;

/// Socket file name inside the private directory.
const SOCKET_NAME: &str = "plugin.sock";

/// Network type as written in the handshake line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkType {
    #[serde(rename = "unix")]
    Unix,
    #[serde(rename = "npipe")]
    NamedPipe,
    #[serde(rename = "tcp")]
    Tcp,
}

impl NetworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unix => "unix",
            Self::NamedPipe => "npipe",
            Self::Tcp => "tcp",
        }
    }

    /// Unix sockets where the platform has them, loopback TCP elsewhere.
    pub fn platform_default() -> Self {
        if cfg!(unix) { Self::Unix } else { Self::Tcp }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkType {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unix" => Ok(Self::Unix),
            "npipe" => Ok(Self::NamedPipe),
            "tcp" => Ok(Self::Tcp),
            other => Err(TransportError::UnknownNetwork(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("listener closed before a client connected")]
    ListenerClosed,

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("connect to {address} failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("unknown network type: {0}")]
    UnknownNetwork(String),
}

pub type SessionReader = Box<dyn AsyncRead + Send + Unpin>;
pub type SessionWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The single live connection between host and plugin.
pub struct Session {
    reader: SessionReader,
    writer: SessionWriter,
    peer: String,
}

impl Session {
    pub fn new<R, W>(reader: R, writer: W, peer: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer: peer.into(),
        }
    }

    #[cfg(unix)]
    pub fn from_unix(stream: tokio::net::UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self::new(read_half, write_half, "unix")
    }

    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "tcp".to_string());
        let (read_half, write_half) = stream.into_split();
        Self::new(read_half, write_half, peer)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Returns owned halves so reads and writes can proceed independently.
    pub fn into_split(self) -> (SessionReader, SessionWriter) {
        (self.reader, self.writer)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("peer", &self.peer).finish()
    }
}

enum Bound {
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
    Tcp(TcpListener),
}

impl Bound {
    async fn accept(&self) -> io::Result<Session> {
        match self {
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Session::from_unix(stream))
            }
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Session::from_tcp(stream))
            }
        }
    }
}

/// Cloneable close handle, usable while `accept_once` is pending.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    closed: CancellationToken,
}

impl ListenerHandle {
    /// Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Listener for the single host connection.
pub struct Listener {
    network: NetworkType,
    address: String,
    bound: Option<Bound>,
    closed: CancellationToken,
    // Dropping the directory removes the socket file with it.
    dir: Option<tempfile::TempDir>,
}

impl Listener {
    /// Bind a fresh endpoint according to `config`.
    pub async fn open(config: &ServeConfig) -> Result<Self, TransportError> {
        match config.network {
            NetworkType::Unix => Self::open_unix(config.socket_dir.as_deref()),
            NetworkType::Tcp => Self::open_tcp(config.port_range).await,
            NetworkType::NamedPipe => Err(TransportError::Unavailable(
                "named pipes are not supported by this build".to_string(),
            )),
        }
    }

    #[cfg(unix)]
    fn open_unix(socket_dir: Option<&Path>) -> Result<Self, TransportError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("plugin");
        let dir = match socket_dir {
            Some(base) => builder.tempdir_in(base),
            None => builder.tempdir(),
        }
        .map_err(|e| TransportError::Unavailable(format!("failed to create socket dir: {e}")))?;

        let path = dir.path().join(SOCKET_NAME);
        let listener = tokio::net::UnixListener::bind(&path).map_err(|e| {
            TransportError::Unavailable(format!("failed to bind {}: {e}", path.display()))
        })?;

        tracing::debug!(transport_type = "unix", path = %path.display(), "Bound plugin socket");

        Ok(Self {
            network: NetworkType::Unix,
            address: path.display().to_string(),
            bound: Some(Bound::Unix(listener)),
            closed: CancellationToken::new(),
            dir: Some(dir),
        })
    }

    #[cfg(not(unix))]
    fn open_unix(_socket_dir: Option<&Path>) -> Result<Self, TransportError> {
        Err(TransportError::Unavailable(
            "unix sockets are not supported on this platform".to_string(),
        ))
    }

    async fn open_tcp((min_port, max_port): (u16, u16)) -> Result<Self, TransportError> {
        for port in min_port..=max_port {
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => {
                    let addr = listener.local_addr().map_err(|e| {
                        TransportError::Unavailable(format!("failed to read bound address: {e}"))
                    })?;
                    tracing::debug!(transport_type = "tcp", %addr, "Bound plugin socket");
                    return Ok(Self {
                        network: NetworkType::Tcp,
                        address: addr.to_string(),
                        bound: Some(Bound::Tcp(listener)),
                        closed: CancellationToken::new(),
                        dir: None,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    tracing::trace!(port, "Port in use");
                }
                Err(e) => {
                    return Err(TransportError::Unavailable(format!(
                        "failed to bind 127.0.0.1:{port}: {e}"
                    )));
                }
            }
        }
        Err(TransportError::Unavailable(format!(
            "no free port in range {min_port}-{max_port}"
        )))
    }

    pub fn network(&self) -> NetworkType {
        self.network
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn handle(&self) -> ListenerHandle {
        ListenerHandle {
            closed: self.closed.clone(),
        }
    }

    /// Wait for the host to connect, then stop listening.
    ///
    /// Fails with `ListenerClosed` if the listener is closed first, or if a
    /// connection was already accepted.
    pub async fn accept_once(&mut self) -> Result<Session, TransportError> {
        if self.closed.is_cancelled() {
            self.bound = None;
            return Err(TransportError::ListenerClosed);
        }
        let bound = self.bound.take().ok_or(TransportError::ListenerClosed)?;

        tracing::trace!(address = %self.address, "Waiting for host connection");
        let session = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(TransportError::ListenerClosed),
            accepted = bound.accept() => accepted.map_err(TransportError::Accept)?,
        };
        // `bound` drops here: no further connections are accepted.
        tracing::debug!(peer = %session.peer(), "Host connected");
        Ok(session)
    }

    /// Idempotent.
    pub fn close(&mut self) {
        self.closed.cancel();
        self.bound = None;
    }

    pub fn socket_dir(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.path().to_path_buf())
    }
}

/// Connect to an announced endpoint (host side).
pub async fn connect(network: NetworkType, address: &str) -> Result<Session, TransportError> {
    let connect_err = |source| TransportError::Connect {
        address: address.to_string(),
        source,
    };
    match network {
        #[cfg(unix)]
        NetworkType::Unix => {
            let stream = tokio::net::UnixStream::connect(address)
                .await
                .map_err(connect_err)?;
            Ok(Session::from_unix(stream))
        }
        NetworkType::Tcp => {
            let stream = TcpStream::connect(address).await.map_err(connect_err)?;
            Ok(Session::from_tcp(stream))
        }
        other => Err(TransportError::Unavailable(format!(
            "cannot connect over {other} from this build"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unix_config(dir: &Path) -> ServeConfig {
        ServeConfig::default()
            .with_network(NetworkType::Unix)
            .with_socket_dir(dir)
    }

    #[test]
    fn network_type_parses_handshake_names() {
        assert_eq!("unix".parse::<NetworkType>().unwrap(), NetworkType::Unix);
        assert_eq!("npipe".parse::<NetworkType>().unwrap(), NetworkType::NamedPipe);
        assert_eq!("tcp".parse::<NetworkType>().unwrap(), NetworkType::Tcp);
        assert!(matches!(
            "udp".parse::<NetworkType>(),
            Err(TransportError::UnknownNetwork(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_listener_accepts_exactly_one_client() {
        let tmp = tempfile::tempdir().unwrap();
        let mut listener = Listener::open(&unix_config(tmp.path())).await.unwrap();

        assert_eq!(listener.network(), NetworkType::Unix);
        assert!(listener.address().starts_with(tmp.path().to_str().unwrap()));
        assert!(listener.address().ends_with(SOCKET_NAME));

        let address = listener.address().to_string();
        let client = tokio::spawn(async move { connect(NetworkType::Unix, &address).await });

        let session = listener.accept_once().await.unwrap();
        assert_eq!(session.peer(), "unix");
        client.await.unwrap().unwrap();

        // Single-client contract: the listener is spent.
        assert!(matches!(
            listener.accept_once().await,
            Err(TransportError::ListenerClosed)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn close_before_connect_fails_accept() {
        let tmp = tempfile::tempdir().unwrap();
        let mut listener = Listener::open(&unix_config(tmp.path())).await.unwrap();

        listener.close();
        listener.close();

        assert!(matches!(
            listener.accept_once().await,
            Err(TransportError::ListenerClosed)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn handle_close_interrupts_pending_accept() {
        let tmp = tempfile::tempdir().unwrap();
        let mut listener = Listener::open(&unix_config(tmp.path())).await.unwrap();
        let handle = listener.handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.close();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), listener.accept_once())
            .await
            .expect("accept should be interrupted");
        assert!(matches!(result, Err(TransportError::ListenerClosed)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn socket_dir_removed_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let listener = Listener::open(&unix_config(tmp.path())).await.unwrap();
        let dir = listener.socket_dir().unwrap();
        assert!(dir.exists());

        drop(listener);
        assert!(!dir.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn each_open_gets_a_fresh_endpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let a = Listener::open(&unix_config(tmp.path())).await.unwrap();
        let b = Listener::open(&unix_config(tmp.path())).await.unwrap();
        assert_ne!(a.address(), b.address());
    }

    #[tokio::test]
    async fn missing_socket_dir_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let config = unix_config(&tmp.path().join("does-not-exist"));

        let result = Listener::open(&config).await;
        assert!(matches!(result, Err(TransportError::Unavailable(_))));
    }

    #[tokio::test]
    async fn tcp_listener_binds_loopback_in_range() {
        let config = ServeConfig::default()
            .with_network(NetworkType::Tcp)
            .with_port_range(20000, 30000);
        let mut listener = Listener::open(&config).await.unwrap();

        assert_eq!(listener.network(), NetworkType::Tcp);
        let addr: std::net::SocketAddr = listener.address().parse().unwrap();
        assert!(addr.ip().is_loopback());
        assert!((20000..=30000).contains(&addr.port()));

        let address = listener.address().to_string();
        let client = tokio::spawn(async move { connect(NetworkType::Tcp, &address).await });
        listener.accept_once().await.unwrap();
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn named_pipe_is_unavailable() {
        let config = ServeConfig::default().with_network(NetworkType::NamedPipe);
        assert!(matches!(
            Listener::open(&config).await,
            Err(TransportError::Unavailable(_))
        ));
    }
}
