//! Switchable logging macros for the agent's hot loops.
//!
//! The tracker, overlay and health loops run every few seconds for the whole
//! life of the process. Each of those modules declares its own flag so its
//! per-tick chatter can be silenced without touching the global `RUST_LOG`:
//!
//! ```ignore
//! const ENABLE_LOGS: bool = true;
//!
//! use crate::{log_debug, log_info, log_warn, log_error};
//!
//! log_info!("tracker tick attributed {}s", secs);
//! ```
//!
//! The macros are exported at the crate root and forward to the `log` facade.

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::debug!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

/// Warnings describe a skipped sub-operation (trigger, surface, refresh) and
/// should name which one.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}
