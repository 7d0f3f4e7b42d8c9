//! Logging infrastructure - structured tracing for bridge diagnostics
//!
//! Design: diagnostics are advisory. Nothing here feeds back into control
//! flow; a disabled subscriber makes every helper a no-op.

use crate::object::{ClassHandle, NativeHandle};
use once_cell::sync::OnceCell;
use std::io;
use tracing::{debug, error, trace, warn, Level};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // NSBRIDGE_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("NSBRIDGE_LOG_LEVEL") {
            config.level = parse_level(&level_str).unwrap_or(Level::WARN);
        }

        config.json_format = std::env::var("NSBRIDGE_LOG_JSON").is_ok();
        config.show_spans = std::env::var("NSBRIDGE_LOG_SPANS").is_ok();

        config
    }

    /// Verbose config for debugging marshaling problems
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            json_format: false,
            show_spans: true,
        }
    }
}

fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Initialize logging with configuration from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging once; later calls are ignored
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("nsbridge={}", config.level.as_str().to_lowercase()))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let layer = if config.json_format {
            fmt::layer()
                .json()
                .with_writer(io::stderr)
                .with_span_events(span_events)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(io::stderr)
                .with_span_events(span_events)
                .with_target(true)
                .with_thread_ids(cfg!(debug_assertions))
                .boxed()
        };

        // Another subscriber may already be installed by the host
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .try_init();
    });
}

pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// ============================================================================
// Bridge-specific logging functions
// ============================================================================

/// Log a wrapper created for a native handle
#[inline]
pub fn log_wrapper_created(handle: NativeHandle, type_name: &str) {
    trace!(
        event = "wrapper_created",
        handle = %handle,
        wrapper = type_name,
        "Wrapper created"
    );
}

/// Log a fallback to the requested type
pub fn log_type_fallback(handle: NativeHandle, class_name: Option<&str>, fallback: &str, loud: bool) {
    let class_name = class_name.unwrap_or("<unknown>");
    if loud {
        warn!(
            event = "type_fallback",
            handle = %handle,
            class = class_name,
            fallback = fallback,
            "Cannot find wrapper type for native class, using fallback"
        );
    } else {
        debug!(
            event = "type_fallback",
            handle = %handle,
            class = class_name,
            fallback = fallback,
            "Cannot find wrapper type for native class, using fallback"
        );
    }
}

/// Log a registry entry dropped because its wrapper no longer fits the handle
pub fn log_stale_handle(handle: NativeHandle, found: &str, requested: &str) {
    debug!(
        event = "stale_handle",
        handle = %handle,
        found = found,
        requested = requested,
        "Registered wrapper has incompatible type, treating handle as recycled"
    );
}

/// Log a proxy class refined through its description
pub fn log_proxy_refined(handle: NativeHandle, candidate: &str, accepted: bool) {
    debug!(
        event = "proxy_refined",
        handle = %handle,
        candidate = candidate,
        accepted = accepted,
        "Proxy class refinement attempted"
    );
}

/// Log a class registered in the wrapper table
#[inline]
pub fn log_class_registered(class: ClassHandle, type_name: &str) {
    trace!(
        event = "class_registered",
        class = class.addr(),
        wrapper = type_name,
        "Native class mapped to wrapper type"
    );
}

/// Log a newly generated adapter
pub fn log_adapter_generated(selector: &str, encoding: &str) {
    debug!(
        event = "adapter_generated",
        selector = selector,
        encoding = encoding,
        "Adapter generated"
    );
}

/// Log a packaged block
#[inline]
pub fn log_block_created(block: *const u8) {
    trace!(
        event = "block_created",
        address = ?block,
        "Block record created"
    );
}

/// Log a failure inside a native entry point (cannot propagate across FFI)
pub fn log_dispatch_error(selector: &str, error: &str) {
    error!(
        event = "dispatch_error",
        selector = selector,
        error = error,
        "Native entry point failed"
    );
}
