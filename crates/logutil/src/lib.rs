//! Utilities for logging.
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Environment variable consulted for filter directives, e.g.
/// `SNOWFLAKE_LOG=snowflake_connector=trace`.
pub const LOG_ENV: &str = "SNOWFLAKE_LOG";

/// Initialize logging for tests.
///
/// Output goes through the test writer so it's only shown for failing tests.
pub fn init_test() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::DEBUG.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    let _ = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
