//! Plugin server: ties registry, listener, handshake, dispatcher and
//! lifecycle together into one `serve` call.
//!
//! Startup order:
//! 1. Verify the magic cookie and negotiate the app protocol version
//! 2. Open the listener
//! 3. Emit the handshake line, then isolate stdout
//! 4. Accept the host's single connection and mark the lifecycle `Serving`
//! 5. Dispatch until a stop condition, then drain and mark `Stopped`

use std::io::Write;
use std::sync::Arc;

use serde_json::Value;

use crate::bridge::transport::Listener;
use crate::call::{CallContext, CallError};
use crate::config::ServeConfig;
use crate::dispatcher::{DispatchSummary, Dispatcher};
use crate::error::ServeError;
use crate::handshake::{HandshakeEmitter, HandshakeRecord};
use crate::lifecycle::{Lifecycle, StopReason};
use crate::registry::{Capability, Registry};
use crate::version::VersionInfo;

/// Name of the capability every plugin exposes for liveness checks.
pub const CONTROLLER_CAPABILITY: &str = "PluginController";

/// An implementation object that exposes one or more capabilities.
pub trait Plugin: Send + Sync + 'static {
    fn capabilities(self: Arc<Self>) -> Vec<Capability>;
}

struct Controller;

fn controller_capability() -> Capability {
    Capability::builder(CONTROLLER_CAPABILITY, Arc::new(Controller))
        .method(
            "Ping",
            |_this: Arc<Controller>, _req: Value, _ctx: CallContext| async move {
                Ok::<_, CallError>(VersionInfo::new())
            },
        )
        .build()
}

type HandshakeSink = Box<dyn Write + Send>;
type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub struct PluginServer {
    config: ServeConfig,
    registry: Registry,
    lifecycle: Lifecycle,
    handshake_out: Option<HandshakeSink>,
    env: EnvLookup,
}

impl PluginServer {
    pub fn new(config: ServeConfig) -> Self {
        let mut registry = Registry::new();
        // Registry is empty, so this cannot collide.
        let _ = registry.register(controller_capability());
        Self {
            config,
            registry,
            lifecycle: Lifecycle::new(),
            handshake_out: None,
            env: Box::new(|key: &str| std::env::var(key).ok()),
        }
    }

    /// Write the handshake somewhere other than stdout.
    pub fn with_handshake_output<W: Write + Send + 'static>(mut self, out: W) -> Self {
        self.handshake_out = Some(Box::new(out));
        self
    }

    /// Read the magic cookie through `lookup` instead of the process environment.
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Box::new(lookup);
        self
    }

    pub fn register(&mut self, capability: Capability) -> Result<(), ServeError> {
        self.registry.register(capability)?;
        Ok(())
    }

    pub fn register_plugin<P: Plugin>(&mut self, plugin: Arc<P>) -> Result<(), ServeError> {
        for capability in plugin.capabilities() {
            self.register(capability)?;
        }
        Ok(())
    }

    /// Handle for stopping the server from outside, or observing its state.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.clone()
    }

    pub async fn serve(self) -> Result<DispatchSummary, ServeError> {
        let PluginServer {
            config,
            registry,
            lifecycle,
            handshake_out,
            env,
        } = self;

        let result = serve_inner(&config, registry, &lifecycle, handshake_out, env).await;

        if let Err(e) = &result {
            lifecycle.request_stop(StopReason::Fatal(e.to_string()));
            lifecycle.mark_stopped();
        }
        result
    }
}

async fn serve_inner(
    config: &ServeConfig,
    registry: Registry,
    lifecycle: &Lifecycle,
    handshake_out: Option<HandshakeSink>,
    env: EnvLookup,
) -> Result<DispatchSummary, ServeError> {
    config.handshake.verify_magic_cookie(&*env)?;
    let app_version = config.negotiate_version()?;

    let registry = Arc::new(registry);
    tracing::info!(capabilities = ?registry.names(), app_version, "Starting plugin");

    let mut listener = Listener::open(config).await?;
    let signals = lifecycle
        .spawn_signal_watcher(config.ignore_interrupt)
        .map_err(|e| ServeError::Runtime(format!("failed to install signal handlers: {e}")))?;

    // Stop before a session exists closes the listener and fails accept.
    let handle = listener.handle();
    let stop = lifecycle.stop_token();
    let closer = tokio::spawn(async move {
        stop.cancelled().await;
        handle.close();
    });

    let outcome = run_session(
        config,
        registry,
        lifecycle,
        &mut listener,
        handshake_out,
        app_version,
    )
    .await;

    closer.abort();
    signals.abort();
    drop(listener);
    outcome
}

async fn run_session(
    config: &ServeConfig,
    registry: Arc<Registry>,
    lifecycle: &Lifecycle,
    listener: &mut Listener,
    handshake_out: Option<HandshakeSink>,
    app_version: u32,
) -> Result<DispatchSummary, ServeError> {
    let record = HandshakeRecord::new(app_version, listener.network(), listener.address())
        .with_core_protocol_version(config.handshake.core_protocol_version);
    match handshake_out {
        Some(out) => HandshakeEmitter::new(out).emit(&record)?,
        None => {
            HandshakeEmitter::stdout().emit(&record)?;
            if config.isolate_stdout
                && let Err(e) = crate::stdio::isolate_stdout()
            {
                tracing::warn!(error = %e, "Failed to isolate stdout");
            }
        }
    }

    let session = match listener.accept_once().await {
        Ok(session) => session,
        Err(e) => {
            // Signal or host request while waiting is an orderly stop.
            if matches!(
                lifecycle.stop_reason(),
                Some(StopReason::Signal(_) | StopReason::Requested)
            ) {
                tracing::info!("Stopped before the host connected");
                lifecycle.mark_stopped();
                return Ok(DispatchSummary::default());
            }
            return Err(ServeError::from(e));
        }
    };

    if !lifecycle.mark_serving() {
        tracing::info!("Stop requested during startup");
    }

    let summary = Dispatcher::new(registry, lifecycle.clone())
        .with_grace_period(config.grace_period)
        .serve(session)
        .await;
    Ok(summary)
}

/// Serve `plugin` with configuration from the environment.
pub async fn serve_plugin<P: Plugin>(plugin: P) -> Result<(), ServeError> {
    let config = ServeConfig::from_env()?;
    serve_plugin_with(plugin, config).await
}

pub async fn serve_plugin_with<P: Plugin>(
    plugin: P,
    config: ServeConfig,
) -> Result<(), ServeError> {
    let mut server = PluginServer::new(config);
    server.register_plugin(Arc::new(plugin))?;
    server.serve().await?;
    Ok(())
}
