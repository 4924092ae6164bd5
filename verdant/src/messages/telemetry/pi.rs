use crate::{
    error::DecodeError,
    state::{Channel, Reading},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Sensor group nested under the `pi` key. Either field may be missing
/// in a given message, which means no update for that channel.
#[derive(Deserialize, Debug, Default, PartialEq)]
pub struct PiSensors {
    /// Degrees celsius.
    pub temperature: Option<f64>,
    /// Lux.
    pub light: Option<f64>,
}

/// Message published by the Pi host.
#[derive(Deserialize, Debug, PartialEq)]
pub struct PiMessage {
    /// A null or missing group is treated as empty.
    #[serde(default)]
    pub pi: Option<PiSensors>,
}

impl PiMessage {
    pub fn from_slice(payload: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(payload).map_err(|e| DecodeError::Json(e.to_string()))
    }

    /// Readings for the fields present in this message. Present but
    /// non-finite values reject the message.
    pub fn readings(&self, observed_at: DateTime<Utc>) -> Result<Vec<Reading>, DecodeError> {
        let Some(ref sensors) = self.pi else {
            return Ok(Vec::new());
        };
        let fields = [
            (Channel::Temperature, "temperature", sensors.temperature),
            (Channel::Light, "light", sensors.light),
        ];

        let mut readings = Vec::with_capacity(fields.len());
        for (channel, field, value) in fields {
            if let Some(value) = value {
                if !value.is_finite() {
                    return Err(DecodeError::NonFinite { field });
                }
                readings.push(Reading::new(channel, value, observed_at));
            }
        }
        Ok(readings)
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(r#"{"pi": {"temperature": 23.5, "light": 410.0}}"#, 2)]
    #[case(r#"{"pi": {"temperature": 23.5}}"#, 1)]
    #[case(r#"{"pi": {"light": 12}}"#, 1)]
    #[case(r#"{"pi": {}}"#, 0)]
    #[case(r#"{"pi": null}"#, 0)]
    #[case(r#"{"host": "greenhouse-pi"}"#, 0)]
    fn test_parse_pi_message(#[case] raw_string: &str, #[case] expected: usize) {
        let parsed = PiMessage::from_slice(raw_string.as_bytes()).unwrap();
        let readings = parsed.readings(Utc::now()).unwrap();
        assert_eq!(readings.len(), expected, "Unexpected channel count");
    }

    #[test]
    fn test_missing_field_is_not_reported() {
        let parsed = PiMessage::from_slice(br#"{"pi": {"light": 250.0}}"#).unwrap();
        let readings = parsed.readings(Utc::now()).unwrap();
        assert_eq!(readings[0].channel(), Channel::Light);
        assert_eq!(readings[0].value(), 250.0);
        assert!(readings.iter().all(|r| r.channel() != Channel::Temperature));
    }

    #[rstest]
    #[case(r#"{"pi": {"temperature": "warm"}}"#)]
    #[case(r#"{"pi": {"temperature": 23.5"#)]
    #[case("not json")]
    fn test_malformed_pi_message(#[case] raw_string: &str) {
        assert!(matches!(
            PiMessage::from_slice(raw_string.as_bytes()),
            Err(DecodeError::Json(_))
        ));
    }
}
