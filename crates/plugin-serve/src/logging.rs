//! Tracing setup for plugin processes.
//!
//! Logs go to stderr. Stdout belongs to the handshake.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Level-only knob used when `RUST_LOG` is unset.
pub const ENV_PLUGIN_LOG: &str = "PLUGIN_LOG";

/// Initialize tracing with `RUST_LOG`, `PLUGIN_LOG` and `LOG_FORMAT` support.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_directives(
            std::env::var(ENV_PLUGIN_LOG).ok().as_deref(),
        ))
    };
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");
    init_with_filter(filter, use_json);
}

pub fn init_with_filter(filter: EnvFilter, use_json: bool) {
    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn default_directives(level: Option<&str>) -> String {
    let level = match level {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("plugin_serve={level},boundary_plugin_google={level},echo_plugin={level}")
}
