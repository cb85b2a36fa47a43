//! Outbound notification paths: mail, MQTT and client broadcast.
//!
//! Every path is fire-and-forget. A path that is not configured is skipped
//! silently.

pub mod mail;
pub mod mqtt;

use crate::models::device::DeviceStatus;
use crate::models::telemetry::{DeviceErrorRecord, Reading};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use mail::MailScript;
use mqtt::MqttPublisher;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq)]
pub struct Mail {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub mime: String,
}

impl Mail {
    pub fn html(to: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Mail {
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            mime: "text/html".to_string(),
        }
    }
}

/// Structured payloads pushed to connected clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "object", rename_all = "camelCase")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    DaemonState {
        version: String,
        last_sweep: Option<DateTime<Utc>>,
        next_sweep: DateTime<Utc>,
    },
    DeviceState(DeviceStatus),
    Values(Vec<Reading>),
    Errors(Vec<DeviceErrorRecord>),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::DaemonState { .. } => "daemonState",
            Event::DeviceState(_) => "deviceState",
            Event::Values(_) => "values",
            Event::Errors(_) => "errors",
        }
    }
}

pub trait Broadcaster: Send {
    fn broadcast(&self, event: &Event);
}

/// Writes every event as one JSON line to the `events` log target.
pub struct LogBroadcaster;

impl Broadcaster for LogBroadcaster {
    fn broadcast(&self, event: &Event) {
        match serde_json::to_string(event) {
            Ok(json) => debug!(target: "events", "{}", json),
            Err(e) => warn!("Encoding {} event failed: {}", event.name(), e),
        }
    }
}

pub trait Notifier {
    /// Whether mails can be delivered at all (mail enabled, script configured).
    fn mail_ready(&self) -> bool;
    /// Returns false when the mail was not handed to the transport.
    fn send_mail(&mut self, mail: Mail) -> bool;
    fn publish(&mut self, readings: &[Reading]);
    fn broadcast(&mut self, event: &Event);
}

/// Production [`Notifier`] wiring the configured transports together.
pub struct Dispatcher {
    mail: Option<MailScript>,
    mqtt: Option<MqttPublisher>,
    broadcasters: Vec<Box<dyn Broadcaster>>,
}

impl Dispatcher {
    pub fn new(mail: Option<MailScript>, mqtt: Option<MqttPublisher>) -> Self {
        Dispatcher {
            mail,
            mqtt,
            broadcasters: Vec::new(),
        }
    }

    pub fn add_broadcaster(&mut self, broadcaster: Box<dyn Broadcaster>) {
        self.broadcasters.push(broadcaster);
    }
}

impl Notifier for Dispatcher {
    fn mail_ready(&self) -> bool {
        self.mail.is_some()
    }

    fn send_mail(&mut self, mail: Mail) -> bool {
        let Some(script) = self.mail.as_ref() else {
            return false;
        };
        if mail.to.trim().is_empty() {
            debug!("Mail '{}' dropped, no recipient", mail.subject);
            return false;
        }
        match script.send(&mail) {
            Ok(()) => true,
            Err(e) => {
                warn!("Sending mail '{}' to '{}' failed: {}", mail.subject, mail.to, e);
                false
            }
        }
    }

    fn publish(&mut self, readings: &[Reading]) {
        if let Some(mqtt) = self.mqtt.as_mut() {
            mqtt.publish(readings);
        }
    }

    fn broadcast(&mut self, event: &Event) {
        for b in &self.broadcasters {
            b.broadcast(event);
        }
    }
}
