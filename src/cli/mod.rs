use std::path::PathBuf;

use clap::Parser;

use publish::PubArgs;
use subscribe::SubArgs;

use crate::settings::{self, Settings, TlsSettings};

pub mod publish;

pub mod subscribe;

/// A command-line MQTT 3.1.1 client.
#[derive(clap::Parser, Debug)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Clone, Debug)]
pub enum Command {
    /// Publish a single message to a broker.
    Pub(PubArgs),
    /// Subscribe to one or more topics and print incoming messages.
    ///
    /// Messages are printed one per line as `<topic> <payload>` until the
    /// process is interrupted.
    Sub(SubArgs),
}

#[derive(clap::ValueEnum, Debug, Copy, Clone)]
pub enum LogFormat {
    /// Emit human-readable single line logs for each event.
    Full,
    /// A variant of full, optimized for shorter line lengths.
    Compact,
    /// Format events in multi-line very "prettified" form.
    Pretty,
    /// Emit JSON-lines formatted events.
    Json,
}

/// Connection options shared by the subcommands. Flags override whatever
/// the settings file provides.
#[derive(clap::Args, Clone, Debug)]
pub struct BrokerArgs {
    /// Read client settings from a TOML file; `-` reads standard input.
    #[clap(short = 'F', long)]
    pub settings_file: Option<PathBuf>,

    /// Broker host.
    #[clap(short = 'H', long)]
    pub host: Option<String>,

    /// Broker port. Defaults to 1883, or 8883 with `--tls-ca`.
    #[clap(short = 'P', long)]
    pub port: Option<u16>,

    /// Client identifier sent in CONNECT.
    #[clap(short = 'i', long)]
    pub client_id: Option<String>,

    /// User name for authentication.
    #[clap(short, long, env = "MQTT_USER")]
    pub user_name: Option<String>,

    /// Password for authentication.
    #[clap(long, env = "MQTT_PASSWORD")]
    pub password: Option<String>,

    /// PINGREQ interval in seconds; 0 disables keep alive.
    #[clap(short, long)]
    pub keep_alive: Option<u16>,

    /// Automatic reconnect delay in seconds; 0 disables reconnecting.
    #[clap(long)]
    pub reconnect: Option<u16>,

    /// Connect over TLS, trusting the root certificate(s) in this PEM file.
    #[clap(long)]
    pub tls_ca: Option<PathBuf>,
}

impl BrokerArgs {
    /// NOTE: uses blocking I/O internally if a settings file was given.
    pub fn settings(&self) -> crate::Result<Settings> {
        let mut settings = match &self.settings_file {
            Some(path) => settings::read(path)?,
            None => Settings::default(),
        };

        if let Some(host) = &self.host {
            settings.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.port = Some(port);
        }
        if let Some(client_id) = &self.client_id {
            settings.client_id = client_id.clone();
        }
        if let Some(user_name) = &self.user_name {
            settings.user_name = user_name.clone();
        }
        if let Some(password) = &self.password {
            settings.password = password.clone();
        }
        if let Some(keep_alive) = self.keep_alive {
            settings.keep_alive_s = keep_alive;
        }
        if let Some(reconnect) = self.reconnect {
            settings.reconnect_s = reconnect;
        }
        if let Some(ca_file) = &self.tls_ca {
            settings.tls = Some(TlsSettings {
                ca_file: ca_file.clone(),
                server_name: None,
            });
        }

        Ok(settings)
    }
}

impl Args {
    pub fn log_format(&self) -> LogFormat {
        match &self.command {
            Command::Pub(args) => args.log,
            Command::Sub(args) => args.log,
        }
    }
}

pub fn main() -> crate::Result<()> {
    let args = Args::parse();

    crate::bootstrap(args.log_format())?;

    tracing::debug!("Parsed arguments: {args:?}");

    match args.command {
        Command::Pub(args) => publish::main(args),
        Command::Sub(args) => subscribe::main(args),
    }
}
