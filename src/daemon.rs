use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use ltc_afe_lib::{RequestKind, StateRequest};
use serde_json::json;
use std::time::{Duration, Instant};

use crate::{commandline, mqtt, serve, Driver};

/// Measurements selectable on the command line, with their snapshot field.
const METRICS: [(&str, &str); 11] = [
    ("cell-voltages", "cell_voltages"),
    ("cell-temperatures", "cell_temperatures"),
    ("gpio-voltages", "gpio_voltages"),
    ("mux-voltages", "mux_voltages"),
    ("balancing-feedback", "balancing_feedback"),
    ("balancing-control", "balancing_control"),
    ("open-wire", "open_wire"),
    ("io-expander-inputs", "io_expander_inputs"),
    ("eeprom", "eeprom_data"),
    ("board-temperatures", "board_temperatures"),
    ("voltage-updates", "voltage_updates"),
];

fn select_fields(metrics: &[String]) -> Result<Vec<(&'static str, &'static str)>> {
    if metrics.iter().any(|m| m == "all") {
        return Ok(METRICS.to_vec());
    }
    metrics
        .iter()
        .map(|name| match METRICS.iter().find(|(metric, _)| metric == name) {
            Some(entry) => Ok(*entry),
            None => bail!("Unknown metric name '{}'", name),
        })
        .collect()
}

/// Selected metrics of every string, keyed `string<n>/<metric>`.
fn collect(
    driver: &Driver,
    fields: &[(&'static str, &'static str)],
) -> Result<serde_json::Map<String, serde_json::Value>> {
    let mut collected = serde_json::Map::new();
    for (string, snapshot) in driver.store().snapshots().iter().enumerate() {
        let value = serde_json::to_value(snapshot)
            .with_context(|| format!("Cannot serialize string {string}"))?;
        for (metric, field) in fields {
            if let Some(v) = value.get(field) {
                collected.insert(format!("string{string}/{metric}"), v.clone());
            }
        }
    }
    Ok(collected)
}

fn publish_simple_format(
    publisher: &mut mqtt::MqttPublisher,
    topic: &str,
    value: &serde_json::Value,
) {
    let payload = match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                publish_simple_format(publisher, &format!("{topic}/{k}"), v);
            }
            return;
        }
        serde_json::Value::Array(arr) => {
            for (i, v) in arr.iter().enumerate() {
                publish_simple_format(publisher, &format!("{topic}/{i}"), v);
            }
            return;
        }
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        // invalid entries stay unpublished
        serde_json::Value::Null => return,
    };
    if let Err(e) = publisher.publish(topic, &payload) {
        error!("Failed to publish message to topic {topic}: {e}");
    }
}

/// Triggers the driver at its trigger period for `interval`.
fn run_for(driver: &mut Driver, interval: Duration) {
    let period = driver.config().trigger_period;
    let deadline = Instant::now() + interval;
    while Instant::now() < deadline {
        driver.trigger();
        std::thread::sleep(period);
    }
}

pub fn run(
    mut driver: Driver,
    output: commandline::DaemonOutput,
    interval: Duration,
    metrics: Vec<String>,
    open_wire_every: Option<u32>,
    max_triggers: usize,
) -> Result<()> {
    info!(
        "Starting daemon mode: output={output:?}, interval={interval:?}, metrics={metrics:?}"
    );
    let fields = select_fields(&metrics)?;

    let mut mqtt_publisher: Option<mqtt::MqttPublisher> = None;
    if let commandline::DaemonOutput::Mqtt { config_file, .. } = &output {
        let config = mqtt::MqttConfig::load(config_file)
            .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
        info!("Loaded MQTT config from {config_file}: {config:?}");
        mqtt_publisher =
            Some(mqtt::MqttPublisher::new(config).with_context(|| "Failed to create MQTT publisher")?);
    }

    let mut outputs: u32 = 0;
    loop {
        run_for(&mut driver, interval);
        outputs = outputs.wrapping_add(1);

        if open_wire_every.is_some_and(|every| every > 0 && outputs % every == 0) {
            for string in 0..driver.config().strings {
                let request = StateRequest::new(RequestKind::OpenWireCheck, string);
                if let Err(e) = serve(&mut driver, request, max_triggers) {
                    warn!("Open wire check on string {string} failed: {e:#}");
                }
            }
        }

        let collected = collect(&driver, &fields)?;
        match &output {
            commandline::DaemonOutput::Console => {
                println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
                for (name, value) in &collected {
                    println!("{name}: {value}");
                }
                println!("--------------------------");
            }
            commandline::DaemonOutput::Mqtt { format, .. } => {
                let Some(publisher) = mqtt_publisher.as_mut() else {
                    warn!("MQTT output selected, but publisher is not initialized. Skipping publish.");
                    continue;
                };
                match format {
                    commandline::MqttFormat::Json => {
                        let mut payload = collected;
                        payload.insert(
                            "timestamp".to_string(),
                            json!(chrono::Utc::now().to_rfc3339()),
                        );
                        let topic = publisher.topic().to_string();
                        match serde_json::to_string(&payload) {
                            Ok(json_payload) => {
                                if let Err(e) = publisher.publish(&topic, &json_payload) {
                                    error!("Failed to publish data to MQTT: {e:?}");
                                }
                            }
                            Err(e) => error!("Failed to serialize data to JSON string: {e}"),
                        }
                    }
                    commandline::MqttFormat::Simple => {
                        let base_topic = publisher.topic().to_string();
                        for (name, value) in &collected {
                            publish_simple_format(publisher, &format!("{base_topic}/{name}"), value);
                        }
                    }
                }
            }
        }
    }
}
