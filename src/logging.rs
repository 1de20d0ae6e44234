use std::sync::Once;

use env_logger::Builder;
use log::LevelFilter;

static LOG_ONCE: Once = Once::new();

const LOG_ENV: &str = "WXSTATION_LOG";

/// Filter directives from the environment: `WXSTATION_LOG` wins over `RUST_LOG`.
fn env_filters(own: Option<String>, rust: Option<String>) -> String {
    own.or(rust).unwrap_or_else(|| "info".to_string())
}

fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.parse::<LevelFilter>().ok())
}

fn builder(level: Option<&str>) -> Builder {
    let mut builder = Builder::new();
    match parse_level(level) {
        Some(level) => {
            builder.filter_level(level);
        }
        None => {
            let filters = env_filters(std::env::var(LOG_ENV).ok(), std::env::var("RUST_LOG").ok());
            builder.parse_filters(&filters);
        }
    }
    builder
        .format_timestamp_millis()
        .format_module_path(true)
        .format_target(true);
    builder
}

/// Initialize stderr logging based on `WXSTATION_LOG`/`RUST_LOG`.
pub fn init_logging() {
    init_logging_with(None);
}

/// Initialize stderr logging. An explicit level string (e.g. from the CLI)
/// replaces whatever the environment asks for. Safe to call multiple times;
/// only the first call installs the logger.
pub fn init_logging_with(level: Option<&str>) {
    LOG_ONCE.call_once(|| {
        let _ = builder(level).try_init();
    });
}
