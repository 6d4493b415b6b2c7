//! Audio source multiplexer.
//!
//! Owns the local microphone capture and the robot TCP ingestion paths and
//! exposes a single chunk stream to the recognition pipeline. On a source
//! change the active path is drained and deactivated before the next one is
//! activated, so the output channel never interleaves samples from two
//! sources.

pub mod capture;
pub mod robot_stream;

use crate::config::{AudioConfig, AudioSourceKind, RobotAudioConfig};
use crate::error::{Result, UmebotError};
use capture::LocalMicCapture;
use robot_stream::RobotAudioServer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{info, warn};

/// Size of the multiplexer output channel.
const OUTPUT_CHANNEL_SIZE: usize = 64;

/// One chunk of 16-bit signed little-endian PCM mono at the pipeline rate.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub pcm: Vec<u8>,
    pub captured_at: Instant,
}

impl AudioChunk {
    pub fn new(pcm: Vec<u8>) -> Self {
        Self {
            pcm,
            captured_at: Instant::now(),
        }
    }
}

/// Items on the multiplexer output channel.
#[derive(Debug, Clone)]
pub enum AudioEvent {
    Chunk(AudioChunk),
    /// The active stream ended (robot client disconnected); downstream should
    /// finalize the in-progress utterance promptly.
    StreamEnd,
}

/// Multiplexer over the local-mic and robot-TCP audio paths.
pub struct AudioMultiplexer {
    audio_config: AudioConfig,
    out_tx: crossbeam_channel::Sender<AudioEvent>,
    source: Mutex<AudioSourceKind>,
    local: Mutex<Option<LocalMicCapture>>,
    robot: Mutex<Option<RobotAudioServer>>,
    robot_gate: Arc<AtomicBool>,
    started: AtomicBool,
}

impl AudioMultiplexer {
    /// Create the multiplexer and its output channel.
    ///
    /// `robot_gate` is the robot-audio-permitted gate owned by the
    /// orchestrator; the robot path only accepts a connection while it is set.
    pub fn new(
        audio_config: AudioConfig,
        robot_gate: Arc<AtomicBool>,
    ) -> (Self, crossbeam_channel::Receiver<AudioEvent>) {
        let (out_tx, out_rx) = crossbeam_channel::bounded(OUTPUT_CHANNEL_SIZE);
        (
            Self {
                audio_config,
                out_tx,
                source: Mutex::new(AudioSourceKind::None),
                local: Mutex::new(None),
                robot: Mutex::new(None),
                robot_gate,
                started: AtomicBool::new(false),
            },
            out_rx,
        )
    }

    /// Bind the robot ingestion listener and start its workers. Idempotent.
    ///
    /// The initial source is activated separately with
    /// [`set_source`](Self::set_source) so a mic failure can degrade to
    /// `None` while a port-bind failure aborts startup.
    ///
    /// # Errors
    ///
    /// Returns an error if the robot listener port cannot be bound.
    pub fn start(&self, robot_config: &RobotAudioConfig) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let server = RobotAudioServer::start(
            robot_config.clone(),
            self.audio_config.target_sample_rate,
            Arc::clone(&self.robot_gate),
            self.out_tx.clone(),
        )?;
        if let Ok(mut robot) = self.robot.lock() {
            *robot = Some(server);
        }
        Ok(())
    }

    /// Currently active source.
    pub fn get_source(&self) -> AudioSourceKind {
        self.source
            .lock()
            .map(|guard| *guard)
            .unwrap_or(AudioSourceKind::None)
    }

    /// Switch the active source.
    ///
    /// The current source is drained and deactivated before the new one is
    /// activated. Blocking (local device open may retry); run off the
    /// orchestrator loop. On failure the source is left at `None`.
    ///
    /// # Errors
    ///
    /// Returns an error when the requested source cannot be activated.
    pub fn set_source(&self, requested: AudioSourceKind) -> Result<()> {
        let current = self.get_source();
        if current == requested {
            return Ok(());
        }
        info!("audio source change: {} -> {}", current.as_str(), requested.as_str());

        // Deactivate and drain the current path first.
        match current {
            AudioSourceKind::Local => {
                if let Ok(mut local) = self.local.lock() {
                    if let Some(capture) = local.take() {
                        capture.stop();
                    }
                }
            }
            AudioSourceKind::Robot => {
                if let Ok(robot) = self.robot.lock() {
                    if let Some(server) = robot.as_ref() {
                        server.deactivate();
                    }
                }
            }
            AudioSourceKind::None => {}
        }
        if let Ok(mut source) = self.source.lock() {
            *source = AudioSourceKind::None;
        }

        match requested {
            AudioSourceKind::Local => {
                let capture =
                    LocalMicCapture::start(self.audio_config.clone(), self.out_tx.clone())?;
                if let Ok(mut local) = self.local.lock() {
                    *local = Some(capture);
                }
            }
            AudioSourceKind::Robot => {
                let Ok(robot) = self.robot.lock() else {
                    return Err(UmebotError::Audio("robot path lock poisoned".to_owned()));
                };
                let Some(server) = robot.as_ref() else {
                    return Err(UmebotError::Audio(
                        "robot ingestion not started".to_owned(),
                    ));
                };
                server.activate();
            }
            AudioSourceKind::None => {}
        }

        if let Ok(mut source) = self.source.lock() {
            *source = requested;
        }
        Ok(())
    }

    /// Stop both paths. Idempotent.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut local) = self.local.lock() {
            if let Some(capture) = local.take() {
                capture.stop();
            }
        }
        if let Ok(mut robot) = self.robot.lock() {
            if let Some(server) = robot.take() {
                server.stop();
            }
        }
        if let Ok(mut source) = self.source.lock() {
            *source = AudioSourceKind::None;
        }
        info!("audio multiplexer stopped");
    }
}

/// Average interleaved multi-channel samples down to mono.
pub(crate) fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler.
///
/// Sufficient for speech: energy above 8 kHz does not matter to the
/// recognizer, so no anti-alias filter is applied.
pub(crate) fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };
        output.push(sample as f32);
    }
    output
}

/// Scale f32 samples in [-1, 1] to 16-bit signed little-endian bytes.
pub(crate) fn to_i16_le(samples: &[f32]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let scaled = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        pcm.extend_from_slice(&scaled.to_le_bytes());
    }
    pcm
}

/// Publish a chunk, logging (rate-limited by the caller) when the channel is
/// full. Returns false when the channel is closed.
pub(crate) fn publish(
    tx: &crossbeam_channel::Sender<AudioEvent>,
    event: AudioEvent,
    dropped: &mut u64,
) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(crossbeam_channel::TrySendError::Full(_)) => {
            *dropped += 1;
            true
        }
        Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
            warn!("audio output channel closed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_averages_channels() {
        let stereo = [0.5, -0.5, 1.0, 0.0];
        let mono = to_mono(&stereo, 2);
        assert_eq!(mono, vec![0.0, 0.5]);
    }

    #[test]
    fn resample_halves_length_for_double_rate() {
        let samples: Vec<f32> = (0..100).map(|n| n as f32 / 100.0).collect();
        let out = resample(&samples, 32_000, 16_000);
        assert_eq!(out.len(), 50);
    }

    #[test]
    fn i16_scaling_clamps() {
        let pcm = to_i16_le(&[1.5, -1.5, 0.0]);
        assert_eq!(pcm.len(), 6);
        assert_eq!(i16::from_le_bytes([pcm[0], pcm[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([pcm[2], pcm[3]]), -i16::MAX);
        assert_eq!(i16::from_le_bytes([pcm[4], pcm[5]]), 0);
    }
}
