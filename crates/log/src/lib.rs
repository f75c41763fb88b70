use std::fs::OpenOptions;
use std::path::Path;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{filter, EnvFilter, Layer};

mod bus;
mod sink;

pub use bus::{LogBus, Subscription, SubscriptionEvent};
pub use sink::{BusSink, NullSink, StepSink};

/// Output format of the daemon's console log. The `daemon.log` tee always
/// stays plain text so it remains tailable.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable text layout.
    #[default]
    Full,
    /// One JSON object per line, for machine consumption.
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Json => f.write_str("json"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to parse environment filter: {0}")]
    EnvFilterParse(#[from] filter::ParseError),

    #[error("failed to set global dispatcher: {0}")]
    SetGlobalDefault(#[from] TryInitError),

    #[error("failed to open daemon log file: {0}")]
    OpenLogFile(#[from] std::io::Error),
}

/// Initializes the daemon's tracing subscriber.
///
/// Console output follows `format`; a parallel plain layer is teed into
/// `daemon_log` (when set) so the file stays tailable regardless of what the
/// console renders. `RUST_LOG` overrides the default filter.
pub fn init(format: LogFormat, dev_log: bool, daemon_log: Option<&Path>) -> Result<(), Error> {
    const DEFAULT_LOG_FILTER: &str = "info,controller=debug,provisioner=debug,builder=debug,\
                                      runtime=debug,health=info,rpc=debug,tasks=debug,\
                                      hyper=off,jsonrpsee_server=off";

    let filter = if dev_log {
        format!("{DEFAULT_LOG_FILTER},trace")
    } else {
        DEFAULT_LOG_FILTER.to_string()
    };

    // If the user has set the `RUST_LOG` environment variable, then we prioritize it.
    let filter = EnvFilter::try_from_default_env().or(EnvFilter::try_new(&filter))?;

    let file_layer = match daemon_log {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Arc::new(file))
                .boxed();
            Some(layer)
        }
        None => None,
    };

    let fmt = match format {
        LogFormat::Full => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };

    tracing_subscriber::registry().with(filter).with(file_layer).with(fmt).try_init()?;

    Ok(())
}
