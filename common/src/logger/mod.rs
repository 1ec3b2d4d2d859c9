// Copyright (c) 2023-2025 The Mesh Foundation

//! Mesh logging.
//!
//! A thin façade over slog: long-lived objects take a `Logger` by value at
//! construction and log through the `log::info!(logger, ...)` macro family.

use slog::Drain;

/// Expose the standard crit! debug! error! etc macros from slog
/// (those are the ones that accept a Logger instance)
pub mod log {
    pub use slog::{crit, debug, error, info, trace, warn};
}

/// Expose slog and select useful primitives.
pub use slog;
pub use slog::{o, Logger};

/// Create a logger that discards everything.
pub fn create_null_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Create a terminal logger suitable for a long-running service: an async
/// drain over a full-format terminal decorator.
pub fn create_app_logger<T>(values: slog::OwnedKV<T>) -> Logger
where
    T: slog::SendSyncRefUnwindSafeKV + 'static,
{
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .thread_name("slog-async".into())
        .build()
        .fuse();
    Logger::root(drain, values)
}
