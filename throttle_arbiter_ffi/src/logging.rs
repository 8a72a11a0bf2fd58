use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("global subscriber already installed")]
    AlreadyInstalled,
}

/// Install a global fmt subscriber filtered by `filter`
/// (e.g. "info", "throttle_arbiter_core=debug,warn").
pub fn init_logging(filter: &str, json: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_new(filter)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let res = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    res.map_err(|_| LoggingError::AlreadyInstalled)
}
