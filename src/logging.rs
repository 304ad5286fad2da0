//! Tracing subscriber setup
//!
//! Records go to a rolling file through a non-blocking writer. Text output is
//! mirrored to stdout while developing; JSON output keeps the target so the
//! `TRANSFER`, `PROVISION`, `WORKER` and `MAIL` streams can be split apart.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::AppConfig;

/// Dependencies that are chatty at info/debug
const NOISY_CRATES: [&str; 4] = ["sqlx", "redis", "reqwest", "hyper"];

/// Install the global tracing subscriber
///
/// The returned guard flushes the file writer on drop and must be held for
/// the lifetime of the process. `RUST_LOG` overrides the configured filter.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let file_appender = RollingFileAppender::new(
        rotation(&config.rotation),
        &config.log_dir,
        &config.log_file,
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stdout_layer = config
            .is_development()
            .then(|| fmt::layer().with_target(false).with_ansi(true));
        registry.with(file_layer).with(stdout_layer).init();
    }

    guard
}

fn rotation(name: &str) -> Rotation {
    match name {
        "minutely" => Rotation::MINUTELY,
        "hourly" => Rotation::HOURLY,
        "daily" => Rotation::DAILY,
        _ => Rotation::NEVER,
    }
}

/// Base level, noisy dependencies capped at warn, muted targets off
fn filter_directives(config: &AppConfig) -> String {
    let mut directives = vec![config.log_level.clone()];
    directives.extend(NOISY_CRATES.iter().map(|krate| format!("{krate}=warn")));
    directives.extend(config.muted_targets.iter().map(|target| format!("{target}=off")));
    directives.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml_extra: &str) -> AppConfig {
        let yaml = format!(
            "log_level: debug\nlog_dir: ./logs\nlog_file: bank.log\nuse_json: false\n\
             rotation: daily\ndatabase:\n  url: postgresql://localhost/bank\n  \
             max_connections: 2\n  acquire_timeout_secs: 1\nredis_url: redis://localhost\n\
             {yaml_extra}"
        );
        AppConfig::from_yaml(&yaml).unwrap()
    }

    #[test]
    fn test_filter_caps_dependencies() {
        let directives = filter_directives(&config(""));
        assert_eq!(
            directives,
            "debug,sqlx=warn,redis=warn,reqwest=warn,hyper=warn"
        );
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn test_filter_mutes_targets() {
        let directives = filter_directives(&config("muted_targets: [MAIL, WORKER]\n"));
        assert!(directives.ends_with(",MAIL=off,WORKER=off"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn test_rotation_names() {
        assert_eq!(rotation("hourly"), Rotation::HOURLY);
        assert_eq!(rotation("daily"), Rotation::DAILY);
        assert_eq!(rotation("minutely"), Rotation::MINUTELY);
        assert_eq!(rotation("never"), Rotation::NEVER);
        assert_eq!(rotation("weekly"), Rotation::NEVER);
    }
}
