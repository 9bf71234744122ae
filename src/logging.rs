// Logging setup
// Installs a tracing-subscriber fmt subscriber that also receives `log` records

use std::sync::Once;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

static INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter directives used when `RUST_LOG` is not set
    pub filter: String,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: if cfg!(debug_assertions) {
                "frame_relay=debug,wgpu_core=warn,info".to_string()
            } else {
                "info".to_string()
            },
            ansi: true,
        }
    }
}

/// Installs the global subscriber. Later calls are ignored, as is a subscriber
/// installed by the host application.
pub fn init_logging(config: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));
        let result = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(config.ansi)
            .with_thread_names(true)
            .with_target(true)
            .finish()
            .try_init();
        if let Err(e) = result {
            eprintln!("Logging already initialized: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice() {
        let config = LoggingConfig {
            filter: "debug".to_string(),
            ansi: false,
        };
        init_logging(&config);
        init_logging(&config);
        log::debug!("logging initialized");
    }
}
