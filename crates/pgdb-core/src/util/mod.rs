//! Shared ambient utilities: logging setup used by every binary crate.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber at a level derived from
/// `-v`/`-q` counts, scoping directives to the given crate names so a
/// relay's `RUST_LOG` doesn't also light up unrelated dependencies.
pub fn init_logging(verbose: u8, quiet: bool, crates: &[&str]) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for name in crates {
        filter = filter.add_directive(format!("{name}={level}").parse().expect("valid directive"));
    }

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
