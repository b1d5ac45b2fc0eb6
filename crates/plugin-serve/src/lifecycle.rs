//! Lifecycle controller: `Starting -> Serving -> Stopping -> Stopped`.
//!
//! Every stop trigger (host request, broken session, signal, fatal error)
//! funnels through [`Lifecycle::request_stop`]. The first one wins; later
//! triggers are no-ops. Entering `Stopping` cancels the stop token, which is
//! the parent of every in-flight call's token.

use std::io;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Serving,
    Stopping,
    Stopped,
}

impl LifecycleState {
    pub fn is_stopping_or_stopped(&self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The host sent a shutdown request, or the embedding code asked.
    Requested,
    /// The host closed the session.
    PeerDisconnected,
    /// The session failed mid-stream.
    TransportFault(String),
    /// Termination signal, by name.
    Signal(&'static str),
    /// Serving cannot continue.
    Fatal(String),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => f.write_str("stop requested"),
            Self::PeerDisconnected => f.write_str("host disconnected"),
            Self::TransportFault(e) => write!(f, "transport fault: {e}"),
            Self::Signal(name) => write!(f, "received {name}"),
            Self::Fatal(e) => write!(f, "fatal: {e}"),
        }
    }
}

struct Inner {
    state: watch::Sender<LifecycleState>,
    reason: Mutex<Option<StopReason>>,
    stop: CancellationToken,
}

/// Cloneable handle to the process lifecycle.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &self.state())
            .field("stop_reason", &self.stop_reason())
            .finish()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState::Starting);
        Self {
            inner: Arc::new(Inner {
                state,
                reason: Mutex::new(None),
                stop: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    /// `Starting -> Serving`. Returns false if a stop already happened.
    pub fn mark_serving(&self) -> bool {
        let moved = self.inner.state.send_if_modified(|state| {
            if *state == LifecycleState::Starting {
                *state = LifecycleState::Serving;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::info!("Plugin serving");
        }
        moved
    }

    /// Enter `Stopping`. Safe to call any number of times from anywhere;
    /// only the first call records its reason and returns true.
    pub fn request_stop(&self, reason: StopReason) -> bool {
        let mut reason = Some(reason);
        let moved = self.inner.state.send_if_modified(|state| match state {
            LifecycleState::Starting | LifecycleState::Serving => {
                *state = LifecycleState::Stopping;
                if let Ok(mut slot) = self.inner.reason.lock() {
                    *slot = reason.take();
                }
                true
            }
            LifecycleState::Stopping | LifecycleState::Stopped => false,
        });
        if moved {
            self.inner.stop.cancel();
            match self.stop_reason() {
                Some(StopReason::Fatal(e)) => tracing::error!(error = %e, "Plugin stopping"),
                Some(reason) => tracing::info!(%reason, "Plugin stopping"),
                None => tracing::info!("Plugin stopping"),
            }
        } else if let Some(reason) = reason {
            tracing::trace!(%reason, "Stop already in progress");
        }
        moved
    }

    /// `Stopping -> Stopped`. Returns false from any other state.
    pub fn mark_stopped(&self) -> bool {
        let moved = self.inner.state.send_if_modified(|state| {
            if *state == LifecycleState::Stopping {
                *state = LifecycleState::Stopped;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::info!("Plugin stopped");
        } else {
            tracing::warn!(state = ?self.state(), "Ignoring stop completion outside Stopping");
        }
        moved
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.inner.reason.lock().ok().and_then(|r| r.clone())
    }

    /// Cancelled on entering `Stopping`.
    pub fn stop_token(&self) -> CancellationToken {
        self.inner.stop.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    pub async fn stop_requested(&self) {
        self.inner.stop.cancelled().await
    }

    pub async fn stopped(&self) {
        let mut rx = self.subscribe();
        // Sender lives in `self`, so wait_for cannot fail here.
        let _ = rx.wait_for(|s| *s == LifecycleState::Stopped).await;
    }

    /// Install termination signal handlers and stop on the first signal.
    ///
    /// Handlers are registered before this returns, so a signal sent right
    /// after the handshake is not missed.
    pub fn spawn_signal_watcher(&self, ignore_interrupt: bool) -> io::Result<JoinHandle<()>> {
        let mut signals = TerminationSignals::install(ignore_interrupt)?;
        let lifecycle = self.clone();
        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = lifecycle.stop_requested() => {}
                name = signals.recv() => {
                    tracing::info!(signal = name, "Termination signal received");
                    lifecycle.request_stop(StopReason::Signal(name));
                }
            }
        }))
    }
}

/// Registered termination signal handlers.
///
/// With `ignore_interrupt`, SIGINT is still consumed (so the default
/// disposition does not kill the process) but never ends [`recv`].
///
/// [`recv`]: TerminationSignals::recv
pub struct TerminationSignals {
    ignore_interrupt: bool,
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl TerminationSignals {
    #[cfg(unix)]
    pub fn install(ignore_interrupt: bool) -> io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            ignore_interrupt,
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install(ignore_interrupt: bool) -> io::Result<Self> {
        Ok(Self { ignore_interrupt })
    }

    /// Resolves with the name of the first signal that ends serving.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> &'static str {
        loop {
            tokio::select! {
                Some(()) = self.interrupt.recv() => {
                    if self.ignore_interrupt {
                        tracing::debug!("Ignoring SIGINT, the host owns terminal interrupts");
                        continue;
                    }
                    return "SIGINT";
                }
                Some(()) = self.terminate.recv() => return "SIGTERM",
                else => std::future::pending::<()>().await,
            }
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> &'static str {
        loop {
            match tokio::signal::ctrl_c().await {
                Ok(()) if self.ignore_interrupt => {
                    tracing::debug!("Ignoring interrupt, the host owns terminal interrupts");
                }
                Ok(()) => return "SIGINT",
                Err(e) => {
                    tracing::warn!(error = %e, "Interrupt handler unavailable");
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn starts_in_starting() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), LifecycleState::Starting);
        assert!(lifecycle.stop_reason().is_none());
        assert!(!lifecycle.stop_token().is_cancelled());
    }

    #[test]
    fn full_transition_sequence() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.mark_serving());
        assert_eq!(lifecycle.state(), LifecycleState::Serving);

        assert!(lifecycle.request_stop(StopReason::PeerDisconnected));
        assert_eq!(lifecycle.state(), LifecycleState::Stopping);
        assert!(lifecycle.stop_token().is_cancelled());

        assert!(lifecycle.mark_stopped());
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[test]
    fn first_stop_reason_wins() {
        let lifecycle = Lifecycle::new();
        lifecycle.mark_serving();

        assert!(lifecycle.request_stop(StopReason::Signal("SIGTERM")));
        assert!(!lifecycle.request_stop(StopReason::PeerDisconnected));
        assert!(!lifecycle.request_stop(StopReason::Requested));

        assert_eq!(lifecycle.stop_reason(), Some(StopReason::Signal("SIGTERM")));
    }

    #[test]
    fn stop_before_serving_skips_serving() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.request_stop(StopReason::Requested));
        assert!(!lifecycle.mark_serving());
        assert_eq!(lifecycle.state(), LifecycleState::Stopping);
    }

    #[test]
    fn stopped_only_reachable_through_stopping() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.mark_stopped());
        assert_eq!(lifecycle.state(), LifecycleState::Starting);

        lifecycle.mark_serving();
        assert!(!lifecycle.mark_stopped());
        assert_eq!(lifecycle.state(), LifecycleState::Serving);
    }

    #[test]
    fn stopped_is_terminal() {
        let lifecycle = Lifecycle::new();
        lifecycle.request_stop(StopReason::Requested);
        lifecycle.mark_stopped();

        assert!(!lifecycle.mark_serving());
        assert!(!lifecycle.request_stop(StopReason::PeerDisconnected));
        assert!(!lifecycle.mark_stopped());
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
        assert_eq!(lifecycle.stop_reason(), Some(StopReason::Requested));
    }

    #[tokio::test]
    async fn concurrent_stop_triggers_collapse() {
        let lifecycle = Lifecycle::new();
        lifecycle.mark_serving();

        let mut handles = Vec::new();
        for i in 0..16 {
            let lc = lifecycle.clone();
            handles.push(tokio::spawn(async move {
                lc.request_stop(StopReason::Fatal(format!("trigger {i}")))
            }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(matches!(lifecycle.stop_reason(), Some(StopReason::Fatal(_))));
    }

    #[tokio::test]
    async fn stopped_future_resolves() {
        let lifecycle = Lifecycle::new();
        let waiter = {
            let lc = lifecycle.clone();
            tokio::spawn(async move { lc.stopped().await })
        };

        lifecycle.mark_serving();
        lifecycle.request_stop(StopReason::Requested);
        lifecycle.mark_stopped();

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("stopped() should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn subscribers_observe_transitions() {
        let lifecycle = Lifecycle::new();
        let mut rx = lifecycle.subscribe();

        lifecycle.mark_serving();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), LifecycleState::Serving);

        lifecycle.request_stop(StopReason::PeerDisconnected);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), LifecycleState::Stopping);
    }

    #[tokio::test]
    async fn signal_watcher_exits_when_stopping() {
        let lifecycle = Lifecycle::new();
        let watcher = lifecycle.spawn_signal_watcher(true).unwrap();

        lifecycle.request_stop(StopReason::Requested);
        tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .expect("watcher should exit")
            .unwrap();
        assert_eq!(lifecycle.stop_reason(), Some(StopReason::Requested));
    }
}
