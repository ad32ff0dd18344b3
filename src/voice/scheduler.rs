use super::pcm::{decode_chunk, DecodeError, DecodedChunk, PcmFormat};
use tracing::{debug, warn};

/// Cursor that lays chunks back to back on the output clock.
#[derive(Debug, Clone, Default)]
pub struct ChunkScheduler {
    next_available: f64,
}

impl ChunkScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_available(&self) -> f64 {
        self.next_available
    }

    /// Returns the start time for a chunk of `duration` seconds and advances the cursor.
    pub fn schedule(&mut self, duration: f64, now: f64) -> f64 {
        let start = self.next_available.max(now);
        self.next_available = start + duration.max(0.0);
        start
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledChunk {
    pub start: f64,
    pub duration: f64,
    pub chunk: DecodedChunk,
}

/// The shared output node chunks are played on.
pub trait VoiceOutput {
    /// Current time of the output clock, in seconds.
    fn now(&self) -> f64;

    fn enqueue(&mut self, scheduled: ScheduledChunk);

    fn set_gain(&mut self, _gain: f32) {}
}

impl<T: VoiceOutput + ?Sized> VoiceOutput for Box<T> {
    fn now(&self) -> f64 {
        (**self).now()
    }

    fn enqueue(&mut self, scheduled: ScheduledChunk) {
        (**self).enqueue(scheduled)
    }

    fn set_gain(&mut self, gain: f32) {
        (**self).set_gain(gain)
    }
}

/// Decodes incoming base64 chunks and schedules them in arrival order.
pub struct VoicePlayer<O> {
    format: PcmFormat,
    scheduler: ChunkScheduler,
    output: O,
    dropped: u64,
}

impl<O: VoiceOutput> VoicePlayer<O> {
    pub fn new(format: PcmFormat, output: O) -> Self {
        Self {
            format,
            scheduler: ChunkScheduler::new(),
            output,
            dropped: 0,
        }
    }

    #[cfg(test)]
    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.output.set_gain(gain);
    }

    /// Schedules one chunk. A malformed chunk is dropped and leaves the cursor untouched.
    pub fn push(&mut self, payload: &str) -> Result<f64, DecodeError> {
        let chunk = match decode_chunk(payload, self.format) {
            Ok(c) => c,
            Err(e) => {
                self.dropped += 1;
                warn!(error = %e, dropped = self.dropped, "dropping malformed voice chunk");
                return Err(e);
            }
        };
        let duration = chunk.duration();
        let start = self.scheduler.schedule(duration, self.output.now());
        debug!(start, duration, "scheduled voice chunk");
        self.output.enqueue(ScheduledChunk { start, duration, chunk });
        Ok(start)
    }

    /// Pushes every chunk of one utterance; returns how many were scheduled.
    pub fn push_all<I, S>(&mut self, payloads: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        payloads
            .into_iter()
            .filter(|p| self.push(p.as_ref()).is_ok())
            .count()
    }
}
