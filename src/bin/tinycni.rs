use std::fs::OpenOptions;
use std::sync::Mutex;
use tinycni::commands::run_cni;
use tinycni::config::PluginSettings;
use tinycni::types::ErrorDocument;
use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Stdout carries the protocol, so logs go to the configured file or stderr.
fn init_tracing(settings: &PluginSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.as_str()));
    let builder = FmtSubscriber::builder().with_env_filter(filter);

    let log_file = settings.log_file.as_ref().and_then(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| eprintln!("cannot open log file {}: {}", path.display(), err))
            .ok()
    });

    let _ = match log_file {
        Some(file) => tracing::subscriber::set_global_default(
            builder.with_ansi(false).with_writer(Mutex::new(file)).finish(),
        ),
        None => tracing::subscriber::set_global_default(
            builder.with_writer(std::io::stderr).finish(),
        ),
    };
}

fn main() {
    let settings = match PluginSettings::load() {
        Ok(settings) => settings,
        Err(err) => {
            // Without settings there is nowhere else to log; still answer the runtime.
            let _ = ErrorDocument::from_error(&err).print(&mut std::io::stdout());
            std::process::exit(1);
        }
    };
    init_tracing(&settings);

    let status = run_cni(&settings);
    if status != 0 {
        error!("CNI plugin exited with status {}", status);
    }
    std::process::exit(status);
}
