//! Opt-in tracing initialization for host programs.
//!
//! The library itself only emits `tracing` events; hosts that want them on
//! stderr call [`init`] once. The `LOG` environment variable overrides the
//! verbosity-derived default filter.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install a compact stderr subscriber. Returns false if a global
/// subscriber was already installed.
pub fn init(verbosity: u8) -> bool {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .with_env_var("LOG")
        .from_env_lossy();

    let fmt = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(true);

    tracing_subscriber::registry()
        .with(fmt)
        .with(filter)
        .try_init()
        .is_ok()
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::ERROR,
        1 => tracing::metadata::LevelFilter::INFO,
        _ => tracing::metadata::LevelFilter::DEBUG,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(level_from_verbosity(0), tracing::metadata::LevelFilter::ERROR);
        assert_eq!(level_from_verbosity(1), tracing::metadata::LevelFilter::INFO);
        assert_eq!(level_from_verbosity(9), tracing::metadata::LevelFilter::DEBUG);
    }
}
