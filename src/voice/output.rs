use super::scheduler::{ScheduledChunk, VoiceOutput};
use std::time::Instant;
use tracing::debug;

/// Output with a real monotonic clock and no audio device; records what would play.
#[derive(Debug)]
pub struct ClockOutput {
    origin: Instant,
    chunks: u64,
    scheduled_until: f64,
}

impl ClockOutput {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            chunks: 0,
            scheduled_until: 0.0,
        }
    }
}

impl Default for ClockOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl VoiceOutput for ClockOutput {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn enqueue(&mut self, scheduled: ScheduledChunk) {
        self.chunks += 1;
        self.scheduled_until = scheduled.start + scheduled.duration;
        debug!(
            start = scheduled.start,
            duration = scheduled.duration,
            samples = scheduled.chunk.samples.len(),
            queued = self.chunks,
            until = self.scheduled_until,
            "voice chunk (no audio device)"
        );
    }
}

#[cfg(feature = "voice-output")]
pub use device::RodioOutput;

#[cfg(feature = "voice-output")]
mod device {
    use super::*;
    use anyhow::{Context, Result};
    use rodio::buffer::SamplesBuffer;
    use rodio::{OutputStream, OutputStreamHandle, Sink};

    /// Plays chunks through one rodio sink, which queues sources gaplessly.
    pub struct RodioOutput {
        _stream: OutputStream,
        _handle: OutputStreamHandle,
        sink: Sink,
        origin: Instant,
    }

    impl RodioOutput {
        pub fn try_default() -> Result<Self> {
            let (stream, handle) = OutputStream::try_default().context("No audio output device")?;
            let sink = Sink::try_new(&handle).context("Failed to create audio sink")?;
            Ok(Self {
                _stream: stream,
                _handle: handle,
                sink,
                origin: Instant::now(),
            })
        }

    }

    impl VoiceOutput for RodioOutput {
        fn now(&self) -> f64 {
            self.origin.elapsed().as_secs_f64()
        }

        fn enqueue(&mut self, scheduled: ScheduledChunk) {
            let format = scheduled.chunk.format;
            self.sink.append(SamplesBuffer::new(
                format.channels,
                format.sample_rate,
                scheduled.chunk.samples,
            ));
        }

        fn set_gain(&mut self, gain: f32) {
            self.sink.set_volume(gain);
        }
    }
}
