use std::path::{Path, PathBuf};
use std::{fs, io};

use color_eyre::eyre::WrapErr;

use crate::keep_alive::KeepAlive;

/// Client configuration.
///
/// Every field has a default, so a `Settings::default()` connects to a
/// plaintext broker on localhost.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Settings {
    /// Broker address.
    pub host: String,

    /// Broker port. Defaults to 1883, or 8883 when TLS is configured.
    pub port: Option<u16>,

    /// Identifier sent in CONNECT. If empty, the host name (or a random
    /// identifier) is used instead.
    pub client_id: String,

    /// Credentials. No credentials are sent when `user_name` is empty.
    pub user_name: String,
    pub password: String,

    /// How long an unacknowledged QoS 1/2 PUBLISH may sit in flight before
    /// it is retransmitted with the DUP flag.
    pub retry_delay_ms: u32,

    /// How many transmissions (including the first) a QoS 1/2 PUBLISH gets
    /// before the connection is considered dead.
    pub retry_attempts: u32,

    /// Ask the broker to discard prior session state, and discard our own
    /// queues on reconnect.
    pub clean_session: bool,

    /// Capacity of the outbound queue.
    pub send_queue_size: usize,

    /// Capacity of the in-flight queue.
    pub inflight_queue_size: usize,

    /// PINGREQ interval in seconds; 0 disables keep alive.
    pub keep_alive_s: u16,

    /// Automatic reconnect delay in seconds; 0 disables reconnecting.
    pub reconnect_s: u16,

    /// Message the broker publishes if this connection dies without a
    /// DISCONNECT.
    pub will: Option<WillSettings>,

    /// Connect over TLS instead of plain TCP.
    pub tls: Option<TlsSettings>,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct WillSettings {
    pub topic: String,
    pub message: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct TlsSettings {
    /// PEM file with the root certificate(s) to trust.
    pub ca_file: PathBuf,

    /// Name presented for SNI and certificate verification. Defaults to
    /// `host`.
    #[serde(default)]
    pub server_name: Option<String>,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            host: "127.0.0.1".into(),
            port: None,
            client_id: "vibe-mqtt".into(),
            user_name: String::new(),
            password: String::new(),
            retry_delay_ms: 10_000,
            retry_attempts: 3,
            clean_session: true,
            send_queue_size: 1000,
            inflight_queue_size: 10,
            keep_alive_s: 0,
            reconnect_s: 0,
            will: None,
            tls: None,
        }
    }
}

impl Settings {
    pub fn port(&self) -> u16 {
        self.port
            .unwrap_or(if self.tls.is_some() { 8883 } else { 1883 })
    }

    pub fn keep_alive(&self) -> KeepAlive {
        KeepAlive::from_seconds(self.keep_alive_s)
    }
}

/// NOTE: uses blocking I/O internally.
pub fn read(path: &Path) -> crate::Result<Settings> {
    let settings_toml = if path == Path::new("-") {
        io::read_to_string(io::stdin().lock()).wrap_err("error reading from stdin")?
    } else {
        fs::read_to_string(path)
            .wrap_err_with(|| format!("error reading from {}", path.display()))?
    };

    toml::from_str(&settings_toml).wrap_err("error parsing settings from TOML")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.host, "127.0.0.1");
        assert_eq!(settings.port(), 1883);
        assert_eq!(settings.client_id, "vibe-mqtt");
        assert_eq!(settings.send_queue_size, 1000);
        assert_eq!(settings.inflight_queue_size, 10);
        assert!(settings.clean_session);
        assert!(settings.keep_alive().is_zero());
    }

    #[test]
    fn tls_switches_default_port() {
        let settings: Settings = toml::from_str(
            r#"
            host = "broker.example"

            [tls]
            ca_file = "ca.pem"
            "#,
        )
        .unwrap();

        assert_eq!(settings.port(), 8883);
        assert_eq!(settings.tls.unwrap().ca_file, PathBuf::from("ca.pem"));

        let settings: Settings = toml::from_str("port = 1884").unwrap();
        assert_eq!(settings.port(), 1884);
    }

    #[test]
    fn parses_will_and_credentials() {
        let settings: Settings = toml::from_str(
            r#"
            user_name = "user"
            password = "secret"
            keep_alive_s = 30

            [will]
            topic = "clients/vibe/status"
            message = "offline"
            qos = 1
            retain = true
            "#,
        )
        .unwrap();

        assert_eq!(settings.user_name, "user");
        assert_eq!(settings.keep_alive().as_seconds(), 30);
        let will = settings.will.unwrap();
        assert_eq!(will.topic, "clients/vibe/status");
        assert_eq!(will.qos, 1);
        assert!(will.retain);
    }
}
