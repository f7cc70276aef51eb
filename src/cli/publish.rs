use std::io::Read;
use std::time::Duration;

use color_eyre::eyre::{self, WrapErr};

use crate::cli::{BrokerArgs, LogFormat};
use crate::client::MqttClient;
use crate::protocol;

#[derive(clap::Args, Clone, Debug)]
pub struct PubArgs {
    /// Set the format of log output.
    #[clap(short, long, default_value = "full")]
    pub log: LogFormat,

    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Quality of service: 0, 1, or 2.
    #[clap(short, long, default_value = "0")]
    pub qos: u8,

    /// Ask the broker to retain the message for future subscribers.
    #[clap(short, long)]
    pub retain: bool,

    /// How long to wait for the acknowledgment handshake, in seconds.
    #[clap(long, default_value = "10")]
    pub timeout: u64,

    /// Topic to publish to.
    pub topic: String,

    /// Payload. Read from standard input when omitted.
    pub message: Option<String>,
}

pub fn main(args: PubArgs) -> crate::Result<()> {
    let qos = protocol::qos(args.qos).wrap_err("invalid --qos")?;

    let payload = match &args.message {
        Some(message) => message.clone().into_bytes(),
        None => {
            let mut payload = Vec::new();
            std::io::stdin()
                .lock()
                .read_to_end(&mut payload)
                .wrap_err("error reading payload from stdin")?;
            payload
        }
    };

    main_async(args, qos, payload)
}

// `#[tokio::main]` doesn't have to be attached to the actual `main()`, and it can accept args
#[tokio::main]
async fn main_async(args: PubArgs, qos: protocol::QoS, payload: Vec<u8>) -> crate::Result<()> {
    let settings = args.broker.settings()?;
    let client = MqttClient::new(settings);

    client.connect().await?;

    let queued = client.publish(args.topic, payload, qos, args.retain).await?;
    eyre::ensure!(queued, "send queue is full, message was dropped");

    drain(&client, Duration::from_secs(args.timeout)).await?;
    client.disconnect().await;

    Ok(())
}

/// Wait until the publish (and its handshake, for QoS 1/2) has fully left
/// the session.
async fn drain(client: &MqttClient, timeout: Duration) -> crate::Result<()> {
    let session = client.session();
    let deadline = tokio::time::Instant::now() + timeout;

    while !(session.send.is_empty() && session.inflight.is_empty()) {
        if tokio::time::Instant::now() >= deadline {
            eyre::bail!("timed out waiting for the broker to acknowledge the publish");
        }

        let _ = tokio::time::timeout(Duration::from_millis(100), session.inflight.wait()).await;
    }

    Ok(())
}
