use std::time::Duration;

use color_eyre::eyre::{self, WrapErr};

use crate::cli::{BrokerArgs, LogFormat};
use crate::client::{EventHooks, MqttClient};
use crate::protocol::{self, Publish, SubAck};

#[derive(clap::Args, Clone, Debug)]
pub struct SubArgs {
    /// Set the format of log output.
    #[clap(short, long, default_value = "full")]
    pub log: LogFormat,

    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Maximum quality of service to request: 0, 1, or 2.
    #[clap(short, long, default_value = "0")]
    pub qos: u8,

    /// Topic filters to subscribe to.
    #[clap(required = true)]
    pub topics: Vec<String>,
}

struct PrintHooks;

impl EventHooks for PrintHooks {
    fn on_publish(&self, publish: &Publish) {
        println!(
            "{} {}",
            publish.topic,
            String::from_utf8_lossy(&publish.payload)
        );
    }

    fn on_suback(&self, suback: &SubAck) {
        tracing::info!(return_codes = ?suback.return_codes, "subscribed");
    }

    fn on_disconnect(&self) {
        tracing::warn!("disconnected from broker");
    }
}

pub fn main(args: SubArgs) -> crate::Result<()> {
    main_async(args)
}

#[tokio::main]
async fn main_async(args: SubArgs) -> crate::Result<()> {
    let qos = protocol::qos(args.qos).wrap_err("invalid --qos")?;
    let settings = args.broker.settings()?;

    let client = MqttClient::with_hooks(settings, PrintHooks);
    client.connect().await?;
    wait_connected(&client, Duration::from_secs(10)).await?;

    let topics: Vec<&str> = args.topics.iter().map(String::as_str).collect();
    client.subscribe(&topics, qos).await?;

    tokio::signal::ctrl_c()
        .await
        .wrap_err("error from ctrl_c() handler")?;

    client.disconnect().await;
    Ok(())
}

async fn wait_connected(client: &MqttClient, timeout: Duration) -> crate::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;

    while !client.connected() {
        if tokio::time::Instant::now() >= deadline {
            eyre::bail!("timed out waiting for the broker to accept the connection");
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    Ok(())
}
