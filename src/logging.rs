//! Optional tracing bootstrap.
//!
//! The engine logs through `tracing` and works with whatever subscriber the
//! host installs. Hosts that don't install one can pick a [`LoggingMode`],
//! which maps to a filter over this crate's subsystems: `socket` and the
//! correlator in `protocol` log per-datagram detail, `dispatch` logs
//! fan-out and drops, `controller` logs lifecycle transitions.

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// How much of the engine to log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Install nothing; the host owns the subscriber.
    Silent,
    /// Lifecycle transitions, reconnects, and warnings.
    Engine,
    /// Everything down to individual datagrams and ack correlation.
    Wire,
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize tracing subscriber: {0}")]
    TracingInit(String),
}

/// Install a stderr subscriber for the given mode. Call once, early.
///
/// The `EMOTIVA_LOG` environment variable, when set, is used as the filter
/// directive verbatim and overrides the mode.
pub fn init_logging(mode: LoggingMode) -> Result<(), LoggingError> {
    let Some(filter) = resolve_filter(mode) else {
        return Ok(());
    };
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .map_err(|e| LoggingError::TracingInit(e.to_string()))
}

fn resolve_filter(mode: LoggingMode) -> Option<EnvFilter> {
    if let Ok(spec) = std::env::var("EMOTIVA_LOG") {
        return Some(EnvFilter::new(spec));
    }
    Some(EnvFilter::new(match mode {
        LoggingMode::Silent => return None,
        LoggingMode::Engine => "warn,emotiva_control=info",
        LoggingMode::Wire => "info,emotiva_control=debug",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_mode_installs_nothing() {
        assert!(resolve_filter(LoggingMode::Silent).is_none());
        assert!(init_logging(LoggingMode::Silent).is_ok());
    }

    #[test]
    fn test_modes_map_to_crate_filters() {
        assert!(resolve_filter(LoggingMode::Engine).is_some());
        assert!(resolve_filter(LoggingMode::Wire).is_some());
    }

    #[test]
    fn test_env_override_beats_mode() {
        std::env::set_var("EMOTIVA_LOG", "emotiva_control::socket=trace");
        let filter = resolve_filter(LoggingMode::Silent);
        std::env::remove_var("EMOTIVA_LOG");
        assert!(filter.is_some(), "EMOTIVA_LOG must override Silent");
    }
}
