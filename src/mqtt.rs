use anyhow::{Context, Result};
use rumqttc::{Client, Connection, MqttOptions, QoS};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    host: String,
    #[serde(default = "MqttConfig::default_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "MqttConfig::default_topic")]
    topic: String,
    #[serde(default)]
    qos: u8,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(
        default = "MqttConfig::default_keep_alive_interval",
        with = "humantime_serde"
    )]
    keep_alive_interval: Duration,
    #[serde(
        default = "MqttConfig::default_reconnect_interval",
        with = "humantime_serde"
    )]
    reconnect_interval: Duration,
}

impl MqttConfig {
    pub const DEFAULT_CONFIG_FILE: &str = "mqtt.yaml";

    fn default_port() -> u16 {
        1883
    }

    fn default_topic() -> String {
        "ltc-afe".into()
    }

    fn default_client_id() -> String {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        format!("ltc-afe-{suffix}")
    }

    fn default_keep_alive_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_reconnect_interval() -> Duration {
        Duration::from_secs(5)
    }

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    fn quality_of_service(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive_interval);
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username, password);
        }
        options
    }
}

/// Drives the connection event loop; rumqttc only sends while it is polled.
fn spawn_event_loop(mut connection: Connection, reconnect_interval: Duration) -> Result<()> {
    std::thread::Builder::new()
        .name("mqtt-event-loop".into())
        .spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(event) => log::trace!("MQTT event: {event:?}"),
                    Err(e) => {
                        log::warn!("MQTT connection error: {e}, retrying in {reconnect_interval:?}");
                        std::thread::sleep(reconnect_interval);
                    }
                }
            }
        })
        .with_context(|| "Cannot start MQTT event loop thread")?;
    Ok(())
}

pub struct MqttPublisher {
    client: Client,
    config: MqttConfig,
}

impl MqttPublisher {
    pub fn new(config: MqttConfig) -> Result<Self> {
        log::info!(
            "Connecting to MQTT broker {}:{} with client_id: {}",
            config.host,
            config.port,
            config.client_id
        );
        let (client, connection) = Client::new(config.options(), 64);
        spawn_event_loop(connection, config.reconnect_interval)?;
        Ok(Self { client, config })
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    pub fn publish(&mut self, topic: &str, payload: &str) -> Result<()> {
        let qos = self.config.quality_of_service();
        log::debug!("Publishing to MQTT: Topic='{topic}', Payload='{payload}', QoS={qos:?}");
        self.client
            .publish(topic, qos, false, payload.as_bytes().to_vec())
            .with_context(|| format!("Failed to publish message to MQTT topic: {topic}"))?;
        Ok(())
    }
}
