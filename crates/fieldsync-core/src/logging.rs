use crate::config::LoggingSettings;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset: `level` for everything, with the
/// HTTP middleware held at warn.
fn default_filter(level: &str) -> String {
    let level = match level.trim() {
        "" => "info",
        level => level,
    };
    format!("{level},tower_http=warn,hyper=warn")
}

/// Log to stdout and to `<log_dir>/<file_name>`. Keep the returned guard
/// alive until exit or buffered file output is lost.
pub fn init_logging(log_dir: &Path, settings: &LoggingSettings) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let appender = tracing_appender::rolling::never(log_dir, &settings.file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter(&settings.level))?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(true),
        )
        .with(fmt::layer().with_writer(std::io::stdout).with_target(false))
        .try_init()?;

    tracing::debug!(dir = %log_dir.display(), file = %settings.file_name, "Logging initialised");
    Ok(guard)
}
