use base64::Engine;

/// Format of the raw PCM carried inside each chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    pub const fn mono(sample_rate: u32) -> Self {
        Self { sample_rate, channels: 1 }
    }

    fn frame_bytes(&self) -> usize {
        usize::from(self.channels) * 2
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(String),
    #[error("payload of {len} bytes is not a whole number of {frame}-byte frames")]
    PartialFrame { len: usize, frame: usize },
    #[error("empty payload")]
    Empty,
}

/// Decoded chunk: interleaved samples in [-1, 1).
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedChunk {
    pub format: PcmFormat,
    pub samples: Vec<f32>,
}

impl DecodedChunk {
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.format.channels.max(1))
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / f64::from(self.format.sample_rate)
    }
}

/// base64 → little-endian i16 → f32 normalised by 32768.
pub fn decode_chunk(payload: &str, format: PcmFormat) -> Result<DecodedChunk, DecodeError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| DecodeError::Base64(e.to_string()))?;
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    let frame = format.frame_bytes();
    if frame == 0 || bytes.len() % frame != 0 {
        return Err(DecodeError::PartialFrame { len: bytes.len(), frame });
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
        .collect();
    Ok(DecodedChunk { format, samples })
}
