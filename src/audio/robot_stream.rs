//! Robot-streamed audio ingestion over TCP.
//!
//! The robot pushes raw interleaved i16 LE PCM with no framing. A reader
//! thread accepts a single connection (only while the permission gate is
//! set) and accumulates half-second segments; a decode worker wraps each
//! segment in an in-memory WAV container, decodes, downmixes, resamples and
//! publishes pipeline chunks. A client disconnect emits a stream-end
//! sentinel so the recognizer can finalize promptly.

use crate::audio::{publish, resample, to_i16_le, to_mono, AudioChunk, AudioEvent};
use crate::config::RobotAudioConfig;
use crate::error::{Result, UmebotError};
use std::collections::VecDeque;
use std::io::{Cursor, Read};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Socket read timeout; bounds reaction time to gate/stop changes.
const READ_TIMEOUT: Duration = Duration::from_millis(200);
/// Poll interval while waiting for a connection.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Items handed from the reader to the decode worker.
enum SegmentMsg {
    Data(Vec<u8>),
    StreamEnd,
}

struct Intake {
    segments: Mutex<VecDeque<SegmentMsg>>,
    available: Condvar,
}

/// TCP ingestion server for robot-streamed audio.
pub struct RobotAudioServer {
    stop: Arc<AtomicBool>,
    /// Whether this path is the active multiplexer source. Publishes are
    /// guarded by this lock so a source switch can never interleave.
    active: Arc<Mutex<bool>>,
    intake: Arc<Intake>,
    local_addr: std::net::SocketAddr,
    reader_thread: Option<JoinHandle<()>>,
    worker_thread: Option<JoinHandle<()>>,
}

impl RobotAudioServer {
    /// Bind the listener and start the reader and decode workers.
    ///
    /// The path starts deactivated; [`activate`](Self::activate) routes its
    /// output to the multiplexer channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the port cannot be bound.
    pub fn start(
        config: RobotAudioConfig,
        target_rate: u32,
        gate: Arc<AtomicBool>,
        out_tx: crossbeam_channel::Sender<AudioEvent>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.port)).map_err(|e| {
            UmebotError::Audio(format!("cannot bind robot audio port {}: {e}", config.port))
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|e| UmebotError::Audio(format!("listener setup failed: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| UmebotError::Audio(e.to_string()))?;
        info!("robot audio listener on {local_addr}");

        let stop = Arc::new(AtomicBool::new(false));
        let active = Arc::new(Mutex::new(false));
        let intake = Arc::new(Intake {
            segments: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        });

        let reader_stop = Arc::clone(&stop);
        let reader_intake = Arc::clone(&intake);
        let reader_config = config.clone();
        let reader_thread = std::thread::Builder::new()
            .name("robot-audio-reader".to_owned())
            .spawn(move || {
                reader_loop(&listener, &reader_config, &gate, &reader_stop, &reader_intake);
            })
            .map_err(|e| UmebotError::Audio(format!("cannot spawn reader thread: {e}")))?;

        let worker_stop = Arc::clone(&stop);
        let worker_active = Arc::clone(&active);
        let worker_intake = Arc::clone(&intake);
        let worker_thread = std::thread::Builder::new()
            .name("robot-audio-decode".to_owned())
            .spawn(move || {
                decode_loop(
                    &worker_intake,
                    &worker_stop,
                    &worker_active,
                    &out_tx,
                    config.incoming_sample_rate,
                    config.incoming_channels,
                    target_rate,
                );
            })
            .map_err(|e| UmebotError::Audio(format!("cannot spawn decode thread: {e}")))?;

        Ok(Self {
            stop,
            active,
            intake,
            local_addr,
            reader_thread: Some(reader_thread),
            worker_thread: Some(worker_thread),
        })
    }

    /// Address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Route decoded chunks to the multiplexer output.
    pub fn activate(&self) {
        if let Ok(mut active) = self.active.lock() {
            *active = true;
        }
        info!("robot audio path active");
    }

    /// Stop routing and drain queued segments.
    pub fn deactivate(&self) {
        if let Ok(mut active) = self.active.lock() {
            *active = false;
        }
        if let Ok(mut segments) = self.intake.segments.lock() {
            segments.clear();
        }
        info!("robot audio path drained and inactive");
    }

    /// Stop all threads. Idempotent.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.intake.available.notify_all();
        if let Some(thread) = self.reader_thread.take() {
            if thread.join().is_err() {
                warn!("robot audio reader panicked");
            }
        }
        if let Some(thread) = self.worker_thread.take() {
            if thread.join().is_err() {
                warn!("robot audio decoder panicked");
            }
        }
        info!("robot audio ingestion stopped");
    }
}

fn reader_loop(
    listener: &TcpListener,
    config: &RobotAudioConfig,
    gate: &Arc<AtomicBool>,
    stop: &Arc<AtomicBool>,
    intake: &Arc<Intake>,
) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if !gate.load(Ordering::SeqCst) {
                    debug!("rejecting robot audio connection from {peer}: gate closed");
                    drop(stream);
                    continue;
                }
                info!("robot audio client connected: {peer}");
                serve_connection(stream, config, gate, stop, intake);
                info!("robot audio client gone: {peer}");
                push_segment(intake, config.intake_queue_segments, SegmentMsg::StreamEnd);
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!("robot audio accept failed: {e}");
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn serve_connection(
    mut stream: TcpStream,
    config: &RobotAudioConfig,
    gate: &Arc<AtomicBool>,
    stop: &Arc<AtomicBool>,
    intake: &Arc<Intake>,
) {
    if stream.set_read_timeout(Some(READ_TIMEOUT)).is_err() {
        warn!("cannot set read timeout on robot audio socket");
        return;
    }

    let segment_bytes = config.segment_bytes().max(2);
    let mut pending: Vec<u8> = Vec::with_capacity(segment_bytes * 2);
    let mut buf = [0u8; 4096];

    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        if !gate.load(Ordering::SeqCst) {
            info!("robot audio gate cleared, closing connection");
            return;
        }

        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                while pending.len() >= segment_bytes {
                    let segment: Vec<u8> = pending.drain(..segment_bytes).collect();
                    push_segment(intake, config.intake_queue_segments, SegmentMsg::Data(segment));
                }
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!("robot audio read failed: {e}");
                return;
            }
        }
    }
}

fn push_segment(intake: &Arc<Intake>, queue_cap: usize, msg: SegmentMsg) {
    if let Ok(mut segments) = intake.segments.lock() {
        if matches!(msg, SegmentMsg::Data(_)) {
            // Drop-oldest data on overflow; sentinels always get through.
            while segments.len() >= queue_cap.max(1) {
                let dropped = segments.pop_front();
                if matches!(dropped, Some(SegmentMsg::StreamEnd)) {
                    segments.push_front(SegmentMsg::StreamEnd);
                    break;
                }
                debug!("robot audio intake full, dropped oldest segment");
            }
        }
        segments.push_back(msg);
    }
    intake.available.notify_one();
}

/// Wrap a raw PCM segment in a WAV container in memory and decode it back.
///
/// Round-tripping through the container validates the segment framing and
/// yields normalized f32 samples per channel slot.
fn decode_segment(raw: &[u8], sample_rate: u32, channels: u16) -> Result<Vec<f32>> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut container = Cursor::new(Vec::with_capacity(raw.len() + 64));
    {
        let mut writer = hound::WavWriter::new(&mut container, spec)
            .map_err(|e| UmebotError::Audio(format!("WAV wrap failed: {e}")))?;
        for sample_bytes in raw.chunks_exact(2) {
            let sample = i16::from_le_bytes([sample_bytes[0], sample_bytes[1]]);
            writer
                .write_sample(sample)
                .map_err(|e| UmebotError::Audio(format!("WAV write failed: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| UmebotError::Audio(format!("WAV finalize failed: {e}")))?;
    }

    container.set_position(0);
    let mut reader = hound::WavReader::new(container)
        .map_err(|e| UmebotError::Audio(format!("WAV decode failed: {e}")))?;
    let samples: Vec<f32> = reader
        .samples::<i16>()
        .map(|sample| sample.map(|s| s as f32 / i16::MAX as f32))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| UmebotError::Audio(format!("WAV sample read failed: {e}")))?;
    Ok(samples)
}

#[allow(clippy::too_many_arguments)]
fn decode_loop(
    intake: &Arc<Intake>,
    stop: &Arc<AtomicBool>,
    active: &Arc<Mutex<bool>>,
    out_tx: &crossbeam_channel::Sender<AudioEvent>,
    incoming_rate: u32,
    incoming_channels: u16,
    target_rate: u32,
) {
    let mut dropped: u64 = 0;
    let mut last_report = Instant::now();

    loop {
        let msg = {
            let Ok(guard) = intake.segments.lock() else {
                return;
            };
            let Ok(mut guard) = intake
                .available
                .wait_timeout_while(guard, READ_TIMEOUT, |segments| {
                    segments.is_empty() && !stop.load(Ordering::SeqCst)
                })
            else {
                return;
            };
            if stop.load(Ordering::SeqCst) {
                return;
            }
            guard.0.pop_front()
        };

        let Some(msg) = msg else {
            continue;
        };

        let event = match msg {
            SegmentMsg::StreamEnd => Some(AudioEvent::StreamEnd),
            SegmentMsg::Data(raw) => match decode_segment(&raw, incoming_rate, incoming_channels) {
                Ok(samples) => {
                    let mono = to_mono(&samples, incoming_channels);
                    let resampled = resample(&mono, incoming_rate, target_rate);
                    let pcm = to_i16_le(&resampled);
                    if pcm.is_empty() {
                        None
                    } else {
                        Some(AudioEvent::Chunk(AudioChunk::new(pcm)))
                    }
                }
                Err(e) => {
                    // A bad segment is dropped; the stream continues.
                    warn!("robot audio segment decode failed: {e}");
                    None
                }
            },
        };

        if let Some(event) = event {
            // Publish only while this path is the active source; holding the
            // lock across the send keeps source switches interleave-free.
            let Ok(active_guard) = active.lock() else {
                return;
            };
            if *active_guard && !publish(out_tx, event, &mut dropped) {
                return;
            }
        }

        if dropped > 0 && last_report.elapsed() >= Duration::from_secs(2) {
            debug!("audio output channel full, dropped {dropped} robot chunks (last 2s)");
            dropped = 0;
            last_report = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn wav_round_trip_preserves_interleaved_samples() {
        // Two stereo frames: (100, -100), (2000, -2000).
        let mut raw = Vec::new();
        for sample in [100i16, -100, 2000, -2000] {
            raw.extend_from_slice(&sample.to_le_bytes());
        }
        let samples = decode_segment(&raw, 16_000, 2).unwrap();
        assert_eq!(samples.len(), 4);
        assert!((samples[0] - 100.0 / i16::MAX as f32).abs() < 1e-6);
        assert!((samples[3] + 2000.0 / i16::MAX as f32).abs() < 1e-6);
    }

    #[test]
    fn decode_then_downmix_yields_mono() {
        let mut raw = Vec::new();
        for sample in [1000i16, 3000, 1000, 3000] {
            raw.extend_from_slice(&sample.to_le_bytes());
        }
        let samples = decode_segment(&raw, 16_000, 2).unwrap();
        let mono = to_mono(&samples, 2);
        assert_eq!(mono.len(), 2);
        let expected = (1000.0 + 3000.0) / 2.0 / i16::MAX as f32;
        assert!((mono[0] - expected).abs() < 1e-6);
    }
}
