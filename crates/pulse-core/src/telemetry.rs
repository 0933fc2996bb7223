//! Log output for the `pulse` and `pulsed` binaries.
//!
//! Every log line goes to stderr. Stdout belongs to command output such as
//! `pulse status --json`, so it can be piped without filtering. `RUST_LOG`
//! takes precedence over the level a binary derives from its flags.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Install the global subscriber, as JSON lines when `json` is set.
///
/// A subscriber installed earlier in the process stays in place.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback_filter(level));
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let layer = if json { stderr.json().boxed() } else { stderr.boxed() };
    let _ = tracing_subscriber::registry().with(filter).with(layer).try_init();
}

fn fallback_filter(level: Level) -> EnvFilter {
    EnvFilter::new(level.as_str())
}
