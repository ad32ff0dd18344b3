//! Streamed synthetic-voice playback: decode base64 PCM chunks and lay them
//! out gaplessly on one output clock.

mod output;
mod pcm;
mod scheduler;

pub use output::ClockOutput;
#[cfg(feature = "voice-output")]
pub use output::RodioOutput;
#[cfg(test)]
pub use pcm::decode_chunk;
pub use pcm::PcmFormat;
pub use scheduler::{VoiceOutput, VoicePlayer};
