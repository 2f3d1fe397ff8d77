//! Diagnostic logging plumbing. Re-exports the `slog` surface used by the
//! rest of the crate so components only ever depend on this module, and
//! builds the root terminal logger.
//!
//! The per-day MUD text log is a user-facing feature and lives in
//! [`crate::mudlog`]; nothing there goes through these loggers.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};
pub use sloggers::types::Severity;

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::Build;

/// Build the root logger. All components derive child loggers from this
/// one with `log.new(o!(...))`.
pub fn init(level: Severity) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);

    builder.build().expect("Terminal logger construction failed")
}

/// A logger that swallows everything. Used in tests and by components
/// constructed without a parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
