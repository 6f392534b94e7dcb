//! Logging infrastructure - structured tracing throughout the runtime
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable log levels via environment
//! - Zero-cost when disabled
//! - Structured events for the teardown path

use once_cell::sync::OnceCell;
use std::io;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

pub use tracing::{debug, error, info, trace, warn};

/// Global logging state
static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // NYX_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("NYX_LOG_LEVEL") {
            config.level = match level_str.to_lowercase().as_str() {
                "trace" => Level::TRACE,
                "debug" => Level::DEBUG,
                "info" => Level::INFO,
                "warn" => Level::WARN,
                "error" => Level::ERROR,
                _ => Level::INFO,
            };
        }

        // NYX_LOG_JSON: enable JSON format
        config.json_format = std::env::var("NYX_LOG_JSON").is_ok();

        // NYX_LOG_SPANS: show span events
        config.show_spans = std::env::var("NYX_LOG_SPANS").is_ok();

        config
    }
}

/// Initialize logging with default configuration
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "nyx_runtime={}",
                config.level.as_str().to_lowercase()
            ))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(io::stdout)
                    .with_span_events(span_events)
                    .with_target(true)
                    .with_thread_ids(cfg!(debug_assertions))
                    .with_line_number(cfg!(debug_assertions)),
            )
            .init();
    });
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// ============================================================================
// Teardown-path logging functions
// ============================================================================

/// Log a completed force-free
#[inline]
pub fn log_force_free(slot: u32, kind: &'static str) {
    debug!(event = "force_free", slot, kind, "object force-freed");
}

/// Log conversion of a record to deferred finalization
pub fn log_deferred(slot: u32, kind: &'static str) {
    debug!(
        event = "deferred",
        slot,
        kind,
        "record converted to deferred finalization"
    );
}

/// Log a slot handed back to the free list
#[inline]
pub fn log_recycle(slot: u32) {
    trace!(event = "recycle", slot, "slot recycled");
}

/// Log method-resolution cache invalidation for a class teardown
pub fn log_cache_invalidated(class_slot: u32, removed: usize) {
    debug!(
        event = "cache_invalidated",
        class = class_slot,
        removed,
        "method-resolution cache invalidated"
    );
}

/// Log one deferred-finalization pass
pub fn log_deferred_pass(finalized: usize) {
    debug!(
        event = "deferred_pass",
        finalized, "deferred finalization pass complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_creation() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(!config.json_format);
    }

    #[test]
    fn test_init_idempotent() {
        init();
        init(); // Should not panic
        assert!(is_initialized());
    }
}
