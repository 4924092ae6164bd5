use crate::{
    error::DecodeError,
    state::{Channel, Reading},
};
use chrono::{DateTime, Utc};

/// Field order of the microcontroller record.
const FIELDS: [(Channel, &str); 3] = [
    (Channel::Co2, "co2"),
    (Channel::Humidity, "humidity"),
    (Channel::SoilMoisture, "soil_moisture"),
];

/// Comma delimited record published by the microcontroller, e.g.
/// `612.0,55.2,41.0`. The three values form one logical sample and
/// are accepted or rejected together.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EspMessage {
    /// Parts per million.
    pub co2: f64,
    /// Relative humidity percent.
    pub humidity: f64,
    /// Soil moisture percent.
    pub soil_moisture: f64,
}

impl EspMessage {
    pub fn from_slice(payload: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(payload).map_err(|_| DecodeError::Utf8)?;
        let parts: Vec<&str> = text.trim().split(',').collect();
        if parts.len() != FIELDS.len() {
            return Err(DecodeError::Arity {
                expected: FIELDS.len(),
                found: parts.len(),
            });
        }

        let mut values = [0.0; 3];
        for (slot, (raw, (_, field))) in values.iter_mut().zip(parts.iter().zip(FIELDS)) {
            let value = raw.trim().parse::<f64>().map_err(|_| DecodeError::Number {
                field,
                raw: (*raw).to_string(),
            })?;
            if !value.is_finite() {
                return Err(DecodeError::NonFinite { field });
            }
            *slot = value;
        }

        Ok(Self {
            co2: values[0],
            humidity: values[1],
            soil_moisture: values[2],
        })
    }

    pub fn readings(&self, observed_at: DateTime<Utc>) -> Vec<Reading> {
        [self.co2, self.humidity, self.soil_moisture]
            .into_iter()
            .zip(FIELDS)
            .map(|(value, (channel, _))| Reading::new(channel, value, observed_at))
            .collect()
    }
}
