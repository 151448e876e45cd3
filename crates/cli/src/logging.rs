//! Subscriber setup for the binary. Library crates only emit events.

use tracing_subscriber::{fmt, EnvFilter};

/// Filter directives read before `RUST_LOG`
pub const LOG_ENV: &str = "KILN_LOG";

/// Pick the filter directives: `KILN_LOG`, then `RUST_LOG`, then a level
/// derived from the verbosity flags
pub fn filter_directives(
    kiln_log: Option<String>,
    rust_log: Option<String>,
    verbose: u8,
    quiet: bool,
) -> String {
    let explicit = kiln_log
        .filter(|d| !d.trim().is_empty())
        .or_else(|| rust_log.filter(|d| !d.trim().is_empty()));
    if let Some(directives) = explicit {
        return directives;
    }

    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    level.to_string()
}

/// Install the global fmt subscriber writing to stderr. Stdout is reserved
/// for command output.
pub fn init(verbose: u8, quiet: bool) {
    let directives = filter_directives(
        std::env::var(LOG_ENV).ok(),
        std::env::var("RUST_LOG").ok(),
        verbose,
        quiet,
    );
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"));

    // a second init (tests) keeps the first subscriber
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
