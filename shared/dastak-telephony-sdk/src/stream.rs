//! Audio stream framing
//!
//! The Telephony Provider streams call audio over a WebSocket as JSON
//! text frames: `start`/`stop` bracket the stream, `media` carries base64
//! mu-law payload, `mark` acknowledges playback positions. Media is
//! telephony-standard mu-law at 8 kHz in 20 ms frames (160 bytes).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Result, TelephonyError};

/// Sample rate of stream audio
pub const SAMPLE_RATE_HZ: u32 = 8_000;
/// Duration of one media frame
pub const FRAME_MS: u32 = 20;
/// mu-law bytes per 20 ms frame at 8 kHz
pub const FRAME_BYTES: usize = 160;

/// One control or media frame on the audio stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamFrame {
    Start {
        #[serde(rename = "streamId")]
        stream_id: String,
        #[serde(rename = "callId")]
        call_id: String,
    },
    Media {
        /// base64 mu-law payload
        payload: String,
    },
    Stop,
    Mark {
        name: String,
    },
}

impl StreamFrame {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| TelephonyError::BadFrame(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("stream frames serialize")
    }

    /// Decode the payload of a media frame.
    pub fn media_bytes(&self) -> Result<Bytes> {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
        match self {
            Self::Media { payload } => BASE64
                .decode(payload)
                .map(Bytes::from)
                .map_err(|e| TelephonyError::BadFrame(format!("bad media payload: {e}"))),
            _ => Err(TelephonyError::BadFrame("not a media frame".to_string())),
        }
    }

    /// Split a synthesized clip into 20 ms media frames, in order.
    pub fn media_frames(audio: &Bytes) -> Vec<StreamFrame> {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
        audio
            .chunks(FRAME_BYTES)
            .map(|chunk| StreamFrame::Media {
                payload: BASE64.encode(chunk),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_control_frames() {
        let frame = StreamFrame::parse(r#"{"event":"start","streamId":"S-1","callId":"C-1"}"#)
            .unwrap();
        assert_eq!(
            frame,
            StreamFrame::Start {
                stream_id: "S-1".to_string(),
                call_id: "C-1".to_string()
            }
        );
        assert_eq!(StreamFrame::parse(r#"{"event":"stop"}"#).unwrap(), StreamFrame::Stop);
    }

    #[test]
    fn media_frames_preserve_order_and_size() {
        let audio = Bytes::from(vec![0u8; FRAME_BYTES * 3 + 10]);
        let frames = StreamFrame::media_frames(&audio);
        assert_eq!(frames.len(), 4);

        let mut reassembled = Vec::new();
        for frame in &frames {
            reassembled.extend_from_slice(&frame.media_bytes().unwrap());
        }
        assert_eq!(reassembled, audio.to_vec());
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(StreamFrame::parse("not json").is_err());
        assert!(StreamFrame::parse(r#"{"event":"teleport"}"#).is_err());
    }
}
