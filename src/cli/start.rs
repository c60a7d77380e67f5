use crate::cli::{actions::Action, commands, dispatch::handler, telemetry};
use anyhow::Result;
use std::path::Path;
use tracing::{Level, info};

/// `-v` count to log level. Without `-v` only errors are logged.
const fn verbosity(count: u8) -> Option<Level> {
    match count {
        0 => None,
        1 => Some(Level::INFO),
        2 => Some(Level::DEBUG),
        _ => Some(Level::TRACE),
    }
}

/// Parse the command line, set up logging and return the action to run.
///
/// # Errors
///
/// Returns an error if telemetry initialization or flag validation fails
pub fn start() -> Result<Action> {
    let matches = commands::new().get_matches();

    telemetry::init(
        verbosity(matches.get_count("verbose")),
        matches.get_one::<String>("log-file").map(Path::new),
    )?;

    let action = handler(&matches)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = crate::exporter::GIT_COMMIT_HASH,
        "starting"
    );

    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(verbosity(0), None);
        assert_eq!(verbosity(1), Some(Level::INFO));
        assert_eq!(verbosity(2), Some(Level::DEBUG));
        assert_eq!(verbosity(3), Some(Level::TRACE));
    }

    #[test]
    fn test_verbosity_saturates() {
        assert_eq!(verbosity(4), Some(Level::TRACE));
        assert_eq!(verbosity(u8::MAX), Some(Level::TRACE));
    }
}
