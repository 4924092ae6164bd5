use crate::{
    error::DecodeError,
    messages::telemetry::{camera::FrameMessage, esp::EspMessage, pi::PiMessage},
    state::Reading,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};
use uuid::Uuid;

/// Number of payload bytes included in a rejected message log line.
const PREVIEW_BYTES: usize = 200;

/// Producers that publish onto the transport.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum TelemetrySource {
    /// Temperature and light bundle from the Pi host.
    Pi,
    /// CO2, humidity and soil moisture record from the microcontroller.
    Esp,
    /// Vision counter with an attached frame.
    Camera,
}

/// Topic names for each producer.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct TopicConfig {
    #[serde(default = "TopicConfig::default_pi")]
    pub pi: String,
    #[serde(default = "TopicConfig::default_esp")]
    pub esp: String,
    #[serde(default = "TopicConfig::default_camera")]
    pub camera: String,
}

impl TopicConfig {
    fn default_pi() -> String {
        String::from("/iot/data")
    }

    fn default_esp() -> String {
        String::from("iot/esp/data")
    }

    fn default_camera() -> String {
        String::from("iot/camera")
    }

    pub fn topic(&self, source: TelemetrySource) -> &str {
        match source {
            TelemetrySource::Pi => &self.pi,
            TelemetrySource::Esp => &self.esp,
            TelemetrySource::Camera => &self.camera,
        }
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            pi: Self::default_pi(),
            esp: Self::default_esp(),
            camera: Self::default_camera(),
        }
    }
}

/// Result of decoding one inbound message.
#[derive(Debug, PartialEq)]
pub enum Routed {
    /// Channel readings taken from one message. May be empty when a
    /// message carried none of its optional fields.
    Readings(Vec<Reading>),
    /// A frame for the archive, never seen by the controller.
    Frame(FrameMessage),
}

/// Classifies messages by topic and decodes them into typed readings or
/// frames. The router holds no state beyond its topic table, so one
/// instance is shared by every delivery task.
#[derive(Debug, Clone)]
pub struct TelemetryRouter {
    uuid: Uuid,
    topics: TopicConfig,
}

impl TelemetryRouter {
    pub fn new(topics: TopicConfig) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            topics,
        }
    }

    pub fn get_uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn topics(&self) -> &TopicConfig {
        &self.topics
    }

    /// Find the producer that publishes on `topic`.
    pub fn classify(&self, topic: &str) -> Option<TelemetrySource> {
        if topic == self.topics.pi {
            Some(TelemetrySource::Pi)
        } else if topic == self.topics.esp {
            Some(TelemetrySource::Esp)
        } else if topic == self.topics.camera {
            Some(TelemetrySource::Camera)
        } else {
            None
        }
    }

    /// Decode a message into readings or a frame.
    ///
    /// * `topic`: topic the message was delivered on.
    /// * `payload`: raw bytes as received.
    /// * `observed_at`: local receipt time stamped onto every reading.
    pub fn decode(
        &self,
        topic: &str,
        payload: &[u8],
        observed_at: DateTime<Utc>,
    ) -> Result<Routed, DecodeError> {
        let source = self
            .classify(topic)
            .ok_or_else(|| DecodeError::UnknownTopic(topic.to_string()))?;

        match source {
            TelemetrySource::Pi => {
                let message = PiMessage::from_slice(payload)?;
                Ok(Routed::Readings(message.readings(observed_at)?))
            }
            TelemetrySource::Esp => {
                let message = EspMessage::from_slice(payload)?;
                Ok(Routed::Readings(message.readings(observed_at)))
            }
            TelemetrySource::Camera => Ok(Routed::Frame(FrameMessage::from_slice(
                payload,
                observed_at,
            )?)),
        }
    }

    /// Decode a message, logging and dropping anything malformed. Never
    /// fails, so one bad message cannot stall its delivery task.
    pub fn route(&self, topic: &str, payload: &[u8], observed_at: DateTime<Utc>) -> Option<Routed> {
        match self.decode(topic, payload, observed_at) {
            Ok(routed) => Some(routed),
            Err(e) => {
                tracing::warn!(
                    router = %self.uuid,
                    topic,
                    error = %e,
                    payload = %preview(payload),
                    "Dropped malformed message"
                );
                None
            }
        }
    }
}

/// Lossy, truncated rendering of a payload for log lines.
fn preview(payload: &[u8]) -> String {
    let end = payload.len().min(PREVIEW_BYTES);
    let mut text = String::from_utf8_lossy(&payload[..end]).into_owned();
    if payload.len() > PREVIEW_BYTES {
        text.push_str("...");
    }
    text
}
