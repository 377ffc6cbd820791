//! Logging configuration built on tracing_subscriber.

use std::{io::IsTerminal, sync::Once};

use tracing_subscriber::{EnvFilter, filter::LevelFilter};

static TALLY_LOG_ENV_VAR: &str = "TALLY_LOG";

/// Workspace crates covered by the `TALLY_LOG` default level.
const TALLY_CRATES: &[&str] = &[
    "ads_client",
    "commerce_client",
    "monitoring",
    "ops_api",
    "tally_config",
    "tallyd",
    "warehouse_db",
    "worker",
];

/// Initializes a tracing subscriber for logging.
///
/// `TALLY_LOG` sets the level for workspace crates (default `info`);
/// `RUST_LOG` directives win per crate. Safe to call more than once — tests
/// lean on that.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .init();
    });
}

fn env_filter() -> EnvFilter {
    // Parse directives from RUST_LOG
    let log_filter = EnvFilter::builder().with_default_directive(LevelFilter::ERROR.into());
    let directive_string = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let mut env_filter = log_filter.parse_lossy(&directive_string);

    let log_level = std::env::var(TALLY_LOG_ENV_VAR).unwrap_or_else(|_| "info".to_string());

    for crate_name in TALLY_CRATES {
        // Add directives for each workspace crate, unless RUST_LOG overrides
        if !directive_string.contains(&format!("{crate_name}=")) {
            if let Ok(directive) = format!("{crate_name}={log_level}").parse() {
                env_filter = env_filter.add_directive(directive);
            }
        }
    }

    env_filter
}

/// Collect the error source chain as a vector of strings for tracing.
///
/// Walks the `.source()` chain of the provided error and collects each
/// source's Display representation. Returns an empty vector if the error has
/// no source chain.
pub fn error_source(err: &dyn std::error::Error) -> tracing::field::DebugValue<Vec<String>> {
    let mut sources = Vec::new();
    let mut current = err.source();

    while let Some(curr) = current {
        sources.push(curr.to_string());
        current = curr.source();
    }

    tracing::field::debug(sources)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_source_collects_the_chain_in_order() {
        //* Given
        #[derive(Debug, thiserror::Error)]
        #[error("connection refused")]
        struct ConnectError;

        #[derive(Debug, thiserror::Error)]
        #[error("claim failed")]
        struct ClaimError(#[source] ConnectError);

        #[derive(Debug, thiserror::Error)]
        #[error("run terminated")]
        struct RunError(#[source] ClaimError);

        let error = RunError(ClaimError(ConnectError));

        //* When
        let sources = error_source(&error);

        //* Then
        assert_eq!(
            format!("{sources:?}"),
            r#"["claim failed", "connection refused"]"#
        );
    }

    #[test]
    fn error_source_is_empty_without_a_chain() {
        //* Given
        #[derive(Debug, thiserror::Error)]
        #[error("standalone failure")]
        struct Standalone;

        //* When
        let sources = error_source(&Standalone);

        //* Then
        assert_eq!(format!("{sources:?}"), "[]");
    }
}
