use std::sync::Once;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static INIT: Once = Once::new();

/// Stdout plus an hourly JSON log under `logs/`. Later calls are no-ops.
pub fn setup_telemetry() {
    INIT.call_once(|| {
        let file_appender = match RollingFileAppender::builder()
            .rotation(Rotation::HOURLY)
            .filename_prefix("session-runner")
            .filename_suffix("log")
            .max_log_files(24)
            .build("logs")
        {
            Ok(appender) => Some(appender),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to create log file appender: {}. Logging to stdout only.",
                    e
                );
                None
            }
        };

        let stdout_layer = fmt::Layer::new()
            .with_writer(std::io::stdout)
            .with_target(false)
            .with_filter(default_filter("info"));

        let file_layer = file_appender.map(|appender| {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            // The guard flushes on drop; the runner logs until exit.
            std::mem::forget(guard);
            fmt::Layer::new()
                .json()
                .with_writer(non_blocking)
                .with_filter(default_filter("info,typing_sync_client=debug"))
        });

        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .init();
    });
}

fn default_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}
