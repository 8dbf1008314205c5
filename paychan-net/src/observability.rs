use std::error::Error;
use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/** create a non blocking tracing file appender writing `<datadir>/<who>.log` */
pub fn setup_file_appender<P: AsRef<Path>>(datadir: P, who: &str) -> (NonBlocking, WorkerGuard) {
    let file_appender = rolling::never(datadir.as_ref(), format!("{}.log", who));

    tracing_appender::non_blocking(file_appender)
}

/** create a RUST_LOG env based log filter, defaulting to `level` */
pub fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::builder().with_default_directive(level.into()).from_env_lossy()
}

/**
 * Initialize tracing-subscriber with a filter from RUST_LOG, falling back to `level`.
 * The fmt layer prints to stdout, a second fmt layer writes the log file in datadir.
 * `log` records from the library crates are forwarded by the tracing-log bridge.
 */
pub fn init_tracing_subscriber<P: AsRef<Path>>(
    datadir: P,
    who: &str,
    level: Level,
) -> Result<WorkerGuard, Box<dyn Error>> {
    let (file_writer, file_guard) = setup_file_appender(datadir, who);

    let format = fmt::format()
        .with_level(true)
        .with_ansi(true)
        .with_target(false)
        .with_source_location(true)
        .compact();

    let stdout_layer = fmt::layer().event_format(format.clone()).with_writer(std::io::stdout);
    let file_layer = fmt::layer().event_format(format.with_ansi(false)).with_writer(file_writer);

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .with(env_filter(level))
        .try_init()?;
    Ok(file_guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_level_applies_without_env() {
        std::env::remove_var("RUST_LOG");
        let filter = env_filter(Level::DEBUG);
        assert_eq!(filter.max_level_hint(), Some(Level::DEBUG.into()));
    }
}
