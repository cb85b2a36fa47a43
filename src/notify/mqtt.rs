//! MQTT publishing of sweep results.
//!
//! The topic template selects the layout:
//! - contains `<NAME>`: one message per sensor,
//! - contains `<GROUP>`: one JSON object per sensor group,
//! - otherwise one JSON object with every sensor on the fixed topic.

use crate::config::MqttConfig;
use crate::models::telemetry::Reading;
use log::{debug, info, warn};
use rumqttc::{Client, MqttOptions, QoS};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicStyle {
    PerSensor,
    PerGroup,
    Single,
}

impl TopicStyle {
    pub fn from_topic(topic: &str) -> Self {
        if topic.contains("<NAME>") {
            TopicStyle::PerSensor
        } else if topic.contains("<GROUP>") {
            TopicStyle::PerGroup
        } else {
            TopicStyle::Single
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
}

fn reading_json(r: &Reading) -> Value {
    json!({
        "value": r.value,
        "text": r.text,
        "unit": r.unit,
        "title": r.title,
        "type": r.kind,
        "address": r.address,
        "time": r.time.to_rfc3339(),
    })
}

/// Lays out `readings` on topics derived from `template`.
pub fn build_messages(template: &str, readings: &[Reading]) -> Vec<MqttMessage> {
    match TopicStyle::from_topic(template) {
        TopicStyle::PerSensor => readings
            .iter()
            .map(|r| MqttMessage {
                topic: template.replace("<NAME>", &r.name.to_lowercase()),
                payload: reading_json(r).to_string(),
            })
            .collect(),
        TopicStyle::PerGroup => {
            let mut groups: BTreeMap<i32, Map<String, Value>> = BTreeMap::new();
            for r in readings {
                groups
                    .entry(r.group_id.unwrap_or(0))
                    .or_default()
                    .insert(r.name.clone(), reading_json(r));
            }
            groups
                .into_iter()
                .map(|(group, object)| MqttMessage {
                    topic: template.replace("<GROUP>", &group.to_string()),
                    payload: Value::Object(object).to_string(),
                })
                .collect()
        }
        TopicStyle::Single => {
            let object = readings
                .iter()
                .map(|r| (r.name.clone(), reading_json(r)))
                .collect::<Map<_, _>>();
            vec![MqttMessage {
                topic: template.to_string(),
                payload: Value::Object(object).to_string(),
            }]
        }
    }
}

/// Splits `tcp://host:port`, `mqtt://host:port`, `host:port` or `host`.
pub fn parse_broker(url: &str) -> Result<(String, u16), String> {
    let rest = url
        .trim()
        .trim_start_matches("tcp://")
        .trim_start_matches("mqtt://")
        .trim_end_matches('/');
    if rest.is_empty() {
        return Err("MQTT_URL is empty".to_string());
    }
    match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("invalid MQTT port in '{}'", url))?;
            Ok((host.to_string(), port))
        }
        None => Ok((rest.to_string(), 1883)),
    }
}

pub struct MqttPublisher {
    client: Client,
    topic: String,
}

impl MqttPublisher {
    /// `Ok(None)` when no broker or topic is configured.
    pub fn connect(cfg: &MqttConfig) -> Result<Option<Self>, String> {
        if cfg.url.trim().is_empty() || cfg.data_topic.trim().is_empty() {
            info!("MQTT publishing disabled (no MQTT_URL or MQTT_DATA_TOPIC)");
            return Ok(None);
        }
        let (host, port) = parse_broker(&cfg.url)?;
        let mut options = MqttOptions::new(format!("pellet-telemetry-{}", std::process::id()), host.clone(), port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some(user) = cfg.user.as_ref() {
            options.set_credentials(user.clone(), cfg.password.clone().unwrap_or_default());
        }

        let (client, mut connection) = Client::new(options, 64);
        thread::Builder::new()
            .name("mqtt".to_string())
            .spawn(move || {
                for notification in connection.iter() {
                    match notification {
                        Ok(event) => debug!("MQTT: {:?}", event),
                        Err(e) => {
                            warn!("MQTT connection error: {}", e);
                            thread::sleep(Duration::from_secs(5));
                        }
                    }
                }
            })
            .map_err(|e| format!("starting MQTT thread failed: {}", e))?;

        info!("MQTT publishing to {}:{} on '{}'", host, port, cfg.data_topic);
        Ok(Some(MqttPublisher {
            client,
            topic: cfg.data_topic.clone(),
        }))
    }

    pub fn publish(&mut self, readings: &[Reading]) {
        for message in build_messages(&self.topic, readings) {
            if let Err(e) = self
                .client
                .try_publish(message.topic.clone(), QoS::AtMostOnce, false, message.payload)
            {
                warn!("MQTT publish to '{}' failed: {}", message.topic, e);
            }
        }
    }
}
