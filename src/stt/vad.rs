//! Frame-based voice activity detection.
//!
//! Energy thresholding over fixed-duration PCM frames. Aggressiveness maps
//! to an RMS threshold: higher values require louder speech, reducing false
//! positives in noisy rooms at the cost of clipping quiet speakers.

use crate::error::{Result, UmebotError};

/// Per-frame energy classifier.
#[derive(Debug)]
pub struct VoiceActivityDetector {
    threshold: f32,
    frame_bytes: usize,
}

/// RMS thresholds (normalized i16) indexed by aggressiveness 0..=3.
const THRESHOLDS: [f32; 4] = [0.005, 0.0075, 0.01, 0.02];

impl VoiceActivityDetector {
    /// Create a detector for the given frame duration and sample rate.
    ///
    /// # Errors
    ///
    /// Returns an error for an aggressiveness above 3 or a frame duration
    /// other than 10, 20 or 30 ms.
    pub fn new(aggressiveness: u8, frame_ms: u32, sample_rate: u32) -> Result<Self> {
        if aggressiveness > 3 {
            return Err(UmebotError::Config(format!(
                "VAD aggressiveness {aggressiveness} out of range 0..=3"
            )));
        }
        if !matches!(frame_ms, 10 | 20 | 30) {
            return Err(UmebotError::Config(format!(
                "VAD frame duration {frame_ms}ms must be 10, 20 or 30"
            )));
        }
        let frame_bytes = (sample_rate as usize * frame_ms as usize / 1000) * 2;
        Ok(Self {
            threshold: THRESHOLDS[aggressiveness as usize],
            frame_bytes,
        })
    }

    /// Bytes per classification frame at the configured rate.
    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Classify one frame of i16 LE PCM as speech or silence.
    pub fn is_speech(&self, frame: &[u8]) -> bool {
        if frame.len() < 2 {
            return false;
        }
        let mut sum_sq = 0.0f64;
        let mut count = 0usize;
        for sample_bytes in frame.chunks_exact(2) {
            let sample = i16::from_le_bytes([sample_bytes[0], sample_bytes[1]]) as f64
                / i16::MAX as f64;
            sum_sq += sample * sample;
            count += 1;
        }
        let rms = (sum_sq / count as f64).sqrt() as f32;
        rms > self.threshold
    }
}
