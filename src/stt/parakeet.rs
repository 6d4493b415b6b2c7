//! Parakeet TDT adapter for the streaming recognizer surface.
//!
//! Parakeet is a batch engine: chunks are buffered and transcription runs on
//! flush. Partials are therefore always empty and segmentation comes entirely
//! from the pipeline's VAD silence timeout.

use crate::error::{Result, UmebotError};
use crate::stt::StreamingRecognizer;
use parakeet_rs::{ParakeetTDT, TimestampMode, Transcriber};
use std::path::Path;
use tracing::{info, warn};

/// Skip transcription for utterances shorter than this.
const MIN_UTTERANCE_SECS: f32 = 0.25;

/// Batch Parakeet engine buffered behind the chunk-fed surface.
pub struct ParakeetRecognizer {
    model: ParakeetTDT,
    sample_rate: u32,
    buffer: Vec<f32>,
}

impl ParakeetRecognizer {
    /// Load the model files from `model_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is missing or the model fails to
    /// load; a missing model is a startup configuration error.
    pub fn load(model_dir: &Path, sample_rate: u32) -> Result<Self> {
        if !model_dir.is_dir() {
            return Err(UmebotError::Config(format!(
                "recognizer model directory not found: {}",
                model_dir.display()
            )));
        }
        info!("loading recognizer model from {}", model_dir.display());
        let model = ParakeetTDT::from_pretrained(model_dir, None)
            .map_err(|e| UmebotError::Stt(format!("failed to load Parakeet TDT: {e}")))?;
        info!("recognizer model loaded");
        Ok(Self {
            model,
            sample_rate,
            buffer: Vec::new(),
        })
    }

    fn transcribe_buffered(&mut self) -> String {
        let samples = std::mem::take(&mut self.buffer);
        let duration = samples.len() as f32 / self.sample_rate as f32;
        if duration < MIN_UTTERANCE_SECS {
            return String::new();
        }

        match self.model.transcribe_samples(
            samples,
            self.sample_rate,
            1, // mono
            Some(TimestampMode::Sentences),
        ) {
            Ok(result) => {
                info!("transcribed {duration:.1}s utterance: \"{}\"", result.text);
                result.text
            }
            Err(e) => {
                warn!("transcription failed: {e}");
                String::new()
            }
        }
    }
}

impl StreamingRecognizer for ParakeetRecognizer {
    fn accept(&mut self, pcm: &[u8]) -> Result<bool> {
        self.buffer.reserve(pcm.len() / 2);
        for sample_bytes in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([sample_bytes[0], sample_bytes[1]]);
            self.buffer.push(sample as f32 / i16::MAX as f32);
        }
        // Batch engine: no intrinsic segmentation.
        Ok(false)
    }

    fn partial(&mut self) -> String {
        String::new()
    }

    fn segment_text(&mut self) -> String {
        String::new()
    }

    fn finalize(&mut self) -> String {
        self.transcribe_buffered()
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }
}
