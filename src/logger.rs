//! Tracing subscriber setup.
//!
//! The level string comes from `[tutor] log_level`, `TUTOR_LOG_LEVEL` or the
//! CLI `-v` tiers. [`check_level`] runs during config loading so a typo fails
//! startup with a config error instead of silently logging at the wrong level.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::error::AppError;

/// Accepts a bare level (`off`, `error` … `trace`) or an `EnvFilter`
/// directive list such as `lite_tutor=debug,tower_http=warn`.
///
/// Bare words must be real levels: `EnvFilter` would read `"loud"` as a
/// target name and enable everything under it.
pub fn check_level(level: &str) -> Result<(), AppError> {
    let level = level.trim();
    if level.is_empty() {
        return Err(AppError::Logger("log level is empty".into()));
    }
    if level.contains('=') || level.contains(',') {
        return EnvFilter::try_new(level)
            .map(|_| ())
            .map_err(|e| AppError::Logger(format!("bad filter directive '{level}': {e}")));
    }
    level
        .parse::<LevelFilter>()
        .map(|_| ())
        .map_err(|_| AppError::Logger(format!("unknown log level '{level}'")))
}

fn filter_for(level: &str, cli_forced: bool) -> Result<EnvFilter, AppError> {
    let from_level = || {
        EnvFilter::try_new(level).map_err(|e| AppError::Logger(format!("bad log level '{level}': {e}")))
    };
    // RUST_LOG wins unless the operator passed -v on the command line.
    if cli_forced {
        return from_level();
    }
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => from_level(),
    }
}

/// Install the global subscriber, writing to stderr. Call once.
pub fn init(level: &str, cli_forced: bool) -> Result<(), AppError> {
    let filter = filter_for(level, cli_forced)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| AppError::Logger(format!("subscriber already installed: {e}")))
}
