//! Logging helpers built on `tracing`.
//!
//! `log_error!` records an error together with its chain of sources at a
//! chosen level; `as_error!` wraps it in a closure suitable for
//! `Result::inspect_err`.
use std::fmt::Write;

use tracing::{Level, Subscriber};
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, EnvFilter, Layer};

pub const ERROR: Level = Level::ERROR;
pub const WARN: Level = Level::WARN;
pub const INFO: Level = Level::INFO;
pub const DEBUG: Level = Level::DEBUG;

/// The error type returned when building a subscriber.
#[derive(Debug, thiserror::Error)]
pub enum BuildSubscriberError {
    #[error("failed to parse filtering directive")]
    Parse(#[from] tracing_subscriber::filter::ParseError),
}

/// Build a tracing subscriber.
///
/// The filter is read from `RUST_LOG` and falls back to `info`.
pub fn build_subscriber() -> Result<impl Subscriber, BuildSubscriberError> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    Ok(tracing_subscriber::registry().with(fmt_layer.with_filter(env_filter)))
}

/// Render the `source()` chain of an error as `a: b: c`.
///
/// The error itself is not included, only what caused it.
pub fn format_sources(error: &dyn std::error::Error) -> String {
    let mut out = String::new();
    let mut source = error.source();
    while let Some(cause) = source {
        if !out.is_empty() {
            out.push_str(": ");
        }
        let _ = write!(out, "{}", cause);
        source = cause.source();
    }
    out
}

/// Emit an event for an error at the given level.
///
/// ```ignore
/// log_error!(WARN, error, "failed to fetch cutouts for {}", candid);
/// ```
#[macro_export]
macro_rules! log_error {
    ($level:expr, $error:expr, $($arg:tt)+) => {
        ::tracing::event!(
            $level,
            error.message = %$error,
            error.sources = %$crate::utils::o11y::logging::format_sources(&$error),
            $($arg)+
        )
    };
    ($level:expr, $error:expr $(,)?) => {
        $crate::log_error!($level, $error, "an error occurred")
    };
}

/// Build a closure that logs an error at `ERROR` level, for use with
/// `inspect_err`.
#[macro_export]
macro_rules! as_error {
    () => {
        |error| $crate::log_error!($crate::utils::o11y::logging::ERROR, error)
    };
    ($($arg:tt)+) => {
        |error| $crate::log_error!($crate::utils::o11y::logging::ERROR, error, $($arg)+)
    };
}

pub use crate::{as_error, log_error};

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] Inner);

    #[derive(Debug, thiserror::Error)]
    #[error("inner")]
    struct Inner;

    #[test]
    fn test_format_sources() {
        let error = Outer(Inner);
        assert_eq!(format_sources(&error), "inner");
        assert_eq!(format_sources(&Inner), "");
    }

    #[test]
    fn test_as_error_passes_error_through() {
        let result: Result<(), Outer> = Err(Outer(Inner));
        let result = result.inspect_err(as_error!("failed with {}", 42));
        assert!(result.is_err());
    }
}
