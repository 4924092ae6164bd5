use crate::error::DecodeError;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Metadata produced by the vision pipeline alongside each frame.
/// Every field is optional on the wire and archived as NULL when absent.
#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
pub struct CameraMetadata {
    /// Number of detections in the frame.
    pub chili_count: Option<i64>,
    /// Capture rate reported by the camera host.
    pub fps: Option<f64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
}

/// Wire envelope published by the camera host.
#[derive(Deserialize, Debug)]
struct CameraEnvelope {
    #[serde(default)]
    camera: Option<CameraMetadata>,
    /// Older publishers send the frame under `img`.
    #[serde(default, alias = "img")]
    image: Option<String>,
}

/// A decoded frame, ready to be archived.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMessage {
    pub captured_at: DateTime<Utc>,
    pub metadata: CameraMetadata,
    /// Raw encoded image as sent by the producer.
    pub payload: Vec<u8>,
}

impl FrameMessage {
    /// Decode a camera envelope. A missing, empty or invalid image
    /// rejects the whole message.
    pub fn from_slice(payload: &[u8], captured_at: DateTime<Utc>) -> Result<Self, DecodeError> {
        let envelope: CameraEnvelope =
            serde_json::from_slice(payload).map_err(|e| DecodeError::Json(e.to_string()))?;

        let encoded = envelope
            .image
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(DecodeError::MissingImage)?;

        let payload = STANDARD
            .decode(encoded)
            .map_err(|e| DecodeError::Base64(e.to_string()))?;

        Ok(Self {
            captured_at,
            metadata: envelope.camera.unwrap_or_default(),
            payload,
        })
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use rstest::rstest;

    // "hello" as a stand in for encoded jpeg bytes.
    const FRAME_B64: &str = "aGVsbG8=";

    #[rstest]
    #[case(format!(r#"{{"camera": {{"chili_count": 4, "fps": 9.5, "width": 640, "height": 480}}, "image": "{FRAME_B64}"}}"#))]
    #[case(format!(r#"{{"camera": {{"chili_count": 4, "fps": 9.5, "width": 640, "height": 480}}, "img": "{FRAME_B64}"}}"#))]
    #[case(format!(r#"{{"image": "  {FRAME_B64}\n"}}"#))]
    fn test_parse_camera_message(#[case] raw_string: String) {
        let frame = FrameMessage::from_slice(raw_string.as_bytes(), Utc::now()).unwrap();
        assert_eq!(frame.payload, b"hello");
    }

    #[test]
    fn test_parse_and_compare_metadata() {
        let raw = format!(
            r#"{{"camera": {{"chili_count": 7, "fps": 12.0, "width": 640}}, "image": "{FRAME_B64}"}}"#
        );
        let frame = FrameMessage::from_slice(raw.as_bytes(), Utc::now()).unwrap();
        assert_eq!(
            frame.metadata,
            CameraMetadata {
                chili_count: Some(7),
                fps: Some(12.0),
                width: Some(640),
                height: None,
            }
        );
    }

    #[rstest]
    #[case(r#"{"camera": {"chili_count": 1}}"#)]
    #[case(r#"{"camera": {"chili_count": 1}, "image": ""}"#)]
    #[case(r#"{"image": null}"#)]
    fn test_missing_image_is_rejected(#[case] raw_string: &str) {
        assert_eq!(
            FrameMessage::from_slice(raw_string.as_bytes(), Utc::now()),
            Err(DecodeError::MissingImage)
        );
    }

    #[rstest]
    #[case(r#"{"image": "not base64!!"}"#)]
    #[case(r#"{"image": "aGVsbG8"}"#)]
    #[case(r#"{"image": "aGVs bG8="}"#)]
    fn test_invalid_base64_is_rejected(#[case] raw_string: &str) {
        assert!(matches!(
            FrameMessage::from_slice(raw_string.as_bytes(), Utc::now()),
            Err(DecodeError::Base64(_))
        ));
    }
}
