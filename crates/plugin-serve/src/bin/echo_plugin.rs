//! Minimal plugin used to exercise the serving runtime end to end.
//!
//! Capability `EchoPlugin`:
//! - `Echo`: returns the payload unchanged
//! - `Sleep`: waits `{"ms": N}` unless cancelled first
//! - `Fail`: fails with `{"message": S}`

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use plugin_serve::{CallContext, CallError, Capability, Plugin};
use serde::{Deserialize, Serialize};
use serde_json::Value;

struct EchoPlugin;

#[derive(Deserialize)]
struct SleepRequest {
    ms: u64,
}

#[derive(Serialize)]
struct SleepResponse {
    slept_ms: u64,
}

#[derive(Deserialize)]
struct FailRequest {
    message: String,
}

impl Plugin for EchoPlugin {
    fn capabilities(self: Arc<Self>) -> Vec<Capability> {
        vec![
            Capability::builder("EchoPlugin", self)
                .method("Echo", |_this, payload: Value, _ctx| async move {
                    Ok::<_, CallError>(payload)
                })
                .method("Sleep", |_this, req: SleepRequest, ctx: CallContext| async move {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(req.ms)) => {
                            Ok(SleepResponse { slept_ms: req.ms })
                        }
                        _ = ctx.cancelled() => Err(CallError::cancelled()),
                    }
                })
                .method("Fail", |_this, req: FailRequest, _ctx| async move {
                    Err::<Value, _>(CallError::execution(req.message))
                })
                .build(),
        ]
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    plugin_serve::logging::init();

    match plugin_serve::serve_plugin(EchoPlugin).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error serving plugin {e}");
            ExitCode::FAILURE
        }
    }
}
