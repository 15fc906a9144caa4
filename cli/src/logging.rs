//! Logging setup

use tracing_subscriber::{prelude::*, EnvFilter};

/// Verbosity selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingLevel {
    // warn for everything
    Default,

    // info for everything
    Verbose,

    // debug for the kernel, info for the rest
    Debug,
}

impl LoggingLevel {
    /// `-v` selects Verbose, `-vv` or more selects Debug.
    pub fn new(num_verbose: u8) -> Self {
        match num_verbose {
            0 => Self::Default,
            1 => Self::Verbose,
            _ => Self::Debug,
        }
    }

    fn directives(self) -> &'static str {
        match self {
            Self::Default => "warn",
            Self::Verbose => "info",
            Self::Debug => "info,tidewater_kernel=debug,tidewater=debug",
        }
    }

    /// Install a stderr subscriber. `RUST_LOG` wins over `-v` when set.
    pub fn setup_logging(self) {
        let filter = match std::env::var("RUST_LOG") {
            Ok(directives) => {
                if self != Self::Default {
                    eprintln!(
                        "WARNING: Using RUST_LOG='{directives}' environment, ignoring -v command line"
                    );
                }
                EnvFilter::new(directives)
            }
            Err(_) => EnvFilter::new(self.directives()),
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
