//! Tracing subscriber setup for the command-line tool.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;

/// Install the global subscriber.
///
/// `RUST_LOG` is honoured; `level` applies to this crate and everything
/// else logs warnings only. Calling this twice is harmless.
pub fn init(level: &str, use_color: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_ansi(use_color)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn filter(level: &str) -> EnvFilter {
    let mut filter = EnvFilter::from_default_env();
    for directive in [format!("sqltunnel={}", level), "warn".to_string()] {
        match directive.parse::<Directive>() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Ignoring log directive {:?}: {}", directive, e),
        }
    }
    filter
}
