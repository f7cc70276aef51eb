use color_eyre::eyre::eyre;
use color_eyre::eyre::WrapErr;
pub use color_eyre::eyre::{Error, Result};
use tracing_subscriber::EnvFilter;

use crate::cli::LogFormat;

pub mod cli;

pub mod client;
pub mod keep_alive;
pub mod packet_id;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod transport;

pub use client::{ClientError, EventHooks, MqttClient, NoHooks};
pub use protocol::QoS;
pub use settings::Settings;

pub fn bootstrap(log_format: LogFormat) -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        // Don't die if the file doesn't exist.
        if !e.not_found() {
            return Err(e).context("error reading `.env` file");
        }
    }

    // Enables capturing backtraces on stable and adds color codes.
    color_eyre::install()?;

    let builder = tracing_subscriber::fmt::fmt().with_env_filter(EnvFilter::from_default_env());

    match log_format {
        // These all result in different typestate
        LogFormat::Full => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| eyre!(e))?;

    Ok(())
}
