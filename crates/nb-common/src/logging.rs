//! Structured Logging Configuration
//!
//! JSON output when LOG_FORMAT=json (for log aggregation), plain text
//! otherwise. Level filtering comes from RUST_LOG, defaulting to info.
//! Safe to call more than once; later calls are no-ops so library
//! tests and embedding services do not fight over the global
//! subscriber.

use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber for the given service.
pub fn init_logging(service_name: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json_output = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if json_output {
        builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .try_init()
            .is_ok()
    } else {
        builder.with_ansi(true).try_init().is_ok()
    };

    if installed {
        debug!(
            service = %service_name,
            json = json_output,
            "Logging initialized"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_harmless() {
        init_logging("nanobus-test");
        init_logging("nanobus-test");
    }
}
