use std::process::ExitCode;
use std::sync::Arc;

use lumen::app::{TerminalShell, connect};
use lumen::settings::SettingsStore;
use tracing_subscriber::EnvFilter;

/// Application entry point.
///
/// Loads settings, opens the provider session (or the unconfigured fallback),
/// then hands stdin/stdout to the terminal shell.
#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so the transcript on stdout stays readable.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let settings_store = match SettingsStore::load() {
        Ok(store) => store,
        Err(error) => {
            tracing::error!(error = %error, "failed to load settings");
            return ExitCode::FAILURE;
        }
    };
    let settings = settings_store.settings();
    if !settings.is_valid() {
        tracing::warn!(
            "no API key configured; set LUMEN_API_KEY or edit {:?}",
            settings_store.config_path()
        );
    }

    let reconciler = Arc::new(connect(&settings).await);
    match TerminalShell::new(reconciler).run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "terminal shell stopped");
            ExitCode::FAILURE
        }
    }
}
