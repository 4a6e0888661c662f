//! Tracing setup for the evaluator binary.
//!
//! Filter precedence: `LEADERBOARD_LOG`, then `RUST_LOG`, then the level passed in.
//! Repeated initialisation is ignored.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding an evaluator-specific filter directive.
pub const LOG_ENV: &str = "LEADERBOARD_LOG";

/// Build the filter for `level` unless the environment overrides it.
pub fn log_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Install the global subscriber. `json` switches to one JSON object per log line.
///
/// Log lines go to stderr so stdout stays reserved for the final summary.
pub fn init_tracing(json: bool, level: Level) {
    let filter = log_filter(level);
    // Show module targets when debugging; they are noise otherwise.
    let with_target = level >= Level::DEBUG;

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(with_target)
                    .json(),
            )
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(with_target),
            )
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing(false, Level::INFO);
        init_tracing(true, Level::DEBUG);
        tracing::info!("still logging");
    }
}
