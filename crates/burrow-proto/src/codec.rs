//! JSON text codec for control channel frames

use crate::messages::ControlMessage;
use crate::MAX_FRAME_SIZE;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Encode error: {0}")]
    Encode(String),
}

/// Encodes and decodes [`ControlMessage`] envelopes as JSON text frames
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlCodec;

impl ControlCodec {
    pub fn encode(message: &ControlMessage) -> Result<String, CodecError> {
        let text =
            serde_json::to_string(message).map_err(|e| CodecError::Encode(e.to_string()))?;

        if text.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge {
                size: text.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        Ok(text)
    }

    pub fn decode(text: &str) -> Result<ControlMessage, CodecError> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge {
                size: text.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        serde_json::from_str(text).map_err(|e| CodecError::MalformedFrame(e.to_string()))
    }
}
