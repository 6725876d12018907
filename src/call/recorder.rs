use crate::Result;
use bytes::Bytes;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::io::Cursor;
use std::time::Duration;

pub const SAMPLE_RATE: u32 = 24_000;
pub const WAV_CONTENT_TYPE: &str = "audio/wav";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Track {
    /// The caller's microphone.
    Local,
    /// Assistant speech from the provider.
    Remote,
}

/// Finalized recording of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBlob {
    pub bytes: Bytes,
    pub content_type: &'static str,
    pub duration: Duration,
}

/// Mono PCM16 mixdown of both sides of the call.
///
/// Each track writes at its own cursor. Remote audio arrives in bursts ahead of
/// real time, so a remote chunk never starts before the local cursor; where
/// the tracks overlap the samples are summed with saturation. Samples past the
/// ceiling are dropped.
#[derive(Debug)]
pub struct AudioBuffer {
    samples: Vec<i16>,
    local_cursor: usize,
    remote_cursor: usize,
    local_carry: Option<u8>,
    remote_carry: Option<u8>,
    max_samples: usize,
    sample_rate: u32,
    truncated: bool,
}

impl AudioBuffer {
    #[must_use]
    pub fn new(sample_rate: u32, ceiling: Duration) -> Self {
        let max_samples = usize::try_from(
            ceiling.as_millis().saturating_mul(u128::from(sample_rate)) / 1000,
        )
        .unwrap_or(usize::MAX);
        Self {
            samples: Vec::new(),
            local_cursor: 0,
            remote_cursor: 0,
            local_carry: None,
            remote_carry: None,
            max_samples,
            sample_rate,
            truncated: false,
        }
    }

    /// Mix little-endian PCM16 bytes into the given track. An odd trailing byte
    /// is held back and joined with the next chunk of the same track.
    pub fn append_pcm16(&mut self, track: Track, bytes: &[u8]) {
        let carry = match track {
            Track::Local => self.local_carry.take(),
            Track::Remote => self.remote_carry.take(),
        };

        let mut joined;
        let data: &[u8] = if let Some(first) = carry {
            joined = Vec::with_capacity(bytes.len() + 1);
            joined.push(first);
            joined.extend_from_slice(bytes);
            &joined
        } else {
            bytes
        };

        let chunks = data.chunks_exact(2);
        let leftover = chunks.remainder().first().copied();
        let samples: Vec<i16> = chunks.map(|pair| i16::from_le_bytes([pair[0], pair[1]])).collect();
        match track {
            Track::Local => self.local_carry = leftover,
            Track::Remote => self.remote_carry = leftover,
        }
        self.mix(track, &samples);
    }

    fn mix(&mut self, track: Track, samples: &[i16]) {
        let start = match track {
            Track::Local => self.local_cursor,
            Track::Remote => self.remote_cursor.max(self.local_cursor),
        };
        let room = self.max_samples.saturating_sub(start);
        let take = samples.len().min(room);
        if take < samples.len() && !self.truncated {
            self.truncated = true;
            tracing::warn!("Recording reached the call ceiling, dropping further audio");
        }

        let end = start + take;
        if self.samples.len() < end {
            self.samples.resize(end, 0);
        }
        for (slot, sample) in self.samples[start..end].iter_mut().zip(samples) {
            *slot = slot.saturating_add(*sample);
        }

        match track {
            Track::Local => self.local_cursor = end,
            Track::Remote => self.remote_cursor = end,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        let samples = u64::try_from(self.samples.len()).unwrap_or(u64::MAX);
        Duration::from_millis(samples.saturating_mul(1000) / u64::from(self.sample_rate.max(1)))
    }

    /// Encode the mixdown as a WAV file.
    ///
    /// # Errors
    /// Returns an error if WAV encoding fails.
    #[allow(clippy::result_large_err)]
    pub fn finalize(self) -> Result<AudioBlob> {
        let spec = WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };

        let duration = self.duration();
        let mut cursor = Cursor::new(Vec::with_capacity(self.samples.len() * 2 + 44));
        {
            let mut writer = WavWriter::new(&mut cursor, spec)?;
            let mut samples = writer.get_i16_writer(u32::try_from(self.samples.len()).unwrap_or(u32::MAX));
            for sample in &self.samples {
                samples.write_sample(*sample);
            }
            samples.flush()?;
            writer.finalize()?;
        }

        tracing::debug!("Finalized {} samples ({duration:?}) of call audio", self.samples.len());

        Ok(AudioBlob {
            bytes: Bytes::from(cursor.into_inner()),
            content_type: WAV_CONTENT_TYPE,
            duration,
        })
    }
}
