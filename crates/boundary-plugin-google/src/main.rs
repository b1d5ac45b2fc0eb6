use std::process::ExitCode;

use boundary_plugin_google::GooglePlugin;

#[tokio::main]
async fn main() -> ExitCode {
    plugin_serve::logging::init();

    match plugin_serve::serve_plugin(GooglePlugin::new()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error serving plugin {e}");
            ExitCode::FAILURE
        }
    }
}
