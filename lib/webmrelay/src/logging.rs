//! Thin wrapper around the slog ecosystem. Components take a `Logger` and
//! attach their own context with `log.new(o!(...))`.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds the root terminal logger. All output goes to stderr so the
/// relay can be piped without mixing in log lines.
pub fn init() -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);

    builder.build().expect("terminal logger setup failed")
}

/// A logger that drops everything. Used by tests and by components
/// constructed without a parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
