//! Operator diagnostics plus the decision audit trail: hash-chained JSONL
//! (authoritative) and an optional SQLite mirror with graceful degradation.

pub mod dual;
pub mod jsonl;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use env_logger::{Builder, Env};
use log::{LevelFilter, SetLoggerError};

/// Environment variable holding the `env_logger` filter directives.
pub const LOG_ENV: &str = "CFN_LOG";

fn builder(var: &str, default: LevelFilter) -> Builder {
    let mut builder = Builder::from_env(Env::new().filter_or(var, default.as_str()));
    builder.format_timestamp_millis();
    builder
}

/// Install the stderr logger. `CFN_LOG` (e.g. `debug` or
/// `content_funnel::arbitration=trace`) overrides `default`.
///
/// # Errors
/// Fails if a logger is already installed in this process.
pub fn init(default: LevelFilter) -> Result<(), SetLoggerError> {
    builder(LOG_ENV, default).try_init()
}
