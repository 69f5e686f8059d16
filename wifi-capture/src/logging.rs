use std::io::ErrorKind;
use tokio::fs::create_dir;
use tracing::level_filters;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

const LOG_FOLDER: &str = "log";

/// Set up stdout logging plus a daily rolling log file. The returned guard must
/// be held for the lifetime of the process or buffered log lines are lost.
pub async fn configure_logging() -> WorkerGuard {
    let stdout_log = tracing_subscriber::fmt::layer()
        .with_ansi(false);

    let log_folder = create_dir(LOG_FOLDER).await;
    match log_folder {
        Ok(_) => {}
        Err(err) => match err.kind() {
            ErrorKind::AlreadyExists => {}
            _ => {
                eprintln!("could not create log folder: {err}");
            }
        },
    }

    let file_appender = tracing_appender::rolling::daily(LOG_FOLDER, "wifi-capture.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    #[cfg(debug_assertions)]
    let log_level = level_filters::LevelFilter::DEBUG;
    #[cfg(not(debug_assertions))]
    let log_level = level_filters::LevelFilter::INFO;

    let file_log = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking)
        .with_filter(log_level);

    tracing_subscriber::registry()
        .with(stdout_log.with_filter(log_level).and_then(file_log))
        .init();
    guard
}
