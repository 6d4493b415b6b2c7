//! Local microphone capture via cpal.
//!
//! Capture runs on a dedicated thread because the stream handle must stay on
//! one thread; the audio callback only enqueues raw frames. A second worker
//! downmixes, resamples to the pipeline rate, and publishes int16 chunks.

use crate::audio::{publish, resample, to_i16_le, to_mono, AudioEvent};
use crate::config::AudioConfig;
use crate::error::{Result, UmebotError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Poll interval for the capture thread's stop flag.
const STOP_POLL: Duration = Duration::from_millis(100);

struct Intake {
    frames: Mutex<VecDeque<Vec<f32>>>,
    available: Condvar,
    /// Frames discarded by drop-oldest; reported rate-limited off the
    /// callback thread.
    overflowed: AtomicU64,
}

/// Running local-mic capture (stream thread + resampler worker).
pub struct LocalMicCapture {
    stop: Arc<AtomicBool>,
    intake: Arc<Intake>,
    capture_thread: Option<JoinHandle<()>>,
    worker_thread: Option<JoinHandle<()>>,
}

/// Parameters reported by the capture thread once a stream is open.
struct OpenedStream {
    native_rate: u32,
    native_channels: u16,
}

impl LocalMicCapture {
    /// Discover a device, open a capture stream and start publishing chunks.
    ///
    /// Device opening retries a bounded number of times with a fixed delay;
    /// exhaustion returns the last error and nothing keeps running.
    ///
    /// # Errors
    ///
    /// Returns an error when no acceptable device/stream could be opened.
    pub fn start(
        config: AudioConfig,
        out_tx: crossbeam_channel::Sender<AudioEvent>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let intake = Arc::new(Intake {
            frames: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            overflowed: AtomicU64::new(0),
        });

        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<OpenedStream>>();
        let capture_stop = Arc::clone(&stop);
        let capture_intake = Arc::clone(&intake);
        let capture_config = config.clone();
        let capture_thread = std::thread::Builder::new()
            .name("mic-capture".to_owned())
            .spawn(move || {
                capture_loop(&capture_config, &capture_intake, &capture_stop, &ready_tx);
            })
            .map_err(|e| UmebotError::Audio(format!("cannot spawn capture thread: {e}")))?;

        // The capture thread retries internally; this wait is bounded by
        // attempts x delay plus slack.
        let wait = Duration::from_secs(
            (config.open_retry_attempts as u64 + 1) * config.open_retry_delay_secs + 10,
        );
        let opened = match ready_rx.recv_timeout(wait) {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                stop.store(true, Ordering::SeqCst);
                let _ = capture_thread.join();
                return Err(e);
            }
            Err(_) => {
                stop.store(true, Ordering::SeqCst);
                let _ = capture_thread.join();
                return Err(UmebotError::Audio(
                    "timed out waiting for capture stream".to_owned(),
                ));
            }
        };

        let worker_stop = Arc::clone(&stop);
        let worker_intake = Arc::clone(&intake);
        let target_rate = config.target_sample_rate;
        let worker_thread = std::thread::Builder::new()
            .name("mic-resample".to_owned())
            .spawn(move || {
                resample_loop(
                    &worker_intake,
                    &worker_stop,
                    &out_tx,
                    opened.native_rate,
                    opened.native_channels,
                    target_rate,
                );
            })
            .map_err(|e| UmebotError::Audio(format!("cannot spawn resampler thread: {e}")))?;

        Ok(Self {
            stop,
            intake,
            capture_thread: Some(capture_thread),
            worker_thread: Some(worker_thread),
        })
    }

    /// Stop capture, drain the intake and join both threads.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.intake.available.notify_all();
        if let Some(thread) = self.capture_thread.take() {
            if thread.join().is_err() {
                warn!("mic capture thread panicked");
            }
        }
        if let Some(thread) = self.worker_thread.take() {
            if thread.join().is_err() {
                warn!("mic resampler thread panicked");
            }
        }
        if let Ok(mut frames) = self.intake.frames.lock() {
            frames.clear();
        }
        info!("local mic capture stopped");
    }
}

fn find_device(config: &AudioConfig) -> Result<cpal::Device> {
    let host = cpal::default_host();
    if let Some(ref fragment) = config.input_device_substring {
        let matched = host
            .input_devices()
            .map_err(|e| UmebotError::Audio(format!("cannot enumerate devices: {e}")))?
            .find(|device| match device.description() {
                Ok(description) => description.name().contains(fragment.as_str()),
                Err(_) => false,
            });
        if let Some(device) = matched {
            return Ok(device);
        }
        warn!("no input device matching '{fragment}', falling back to default");
    }
    host.default_input_device()
        .ok_or_else(|| UmebotError::Audio("no default input device".to_owned()))
}

/// Candidate rates, most preferred first: configured preference, pipeline
/// target, device default, then the common hardware rates.
fn candidate_rates(config: &AudioConfig, device_default: u32) -> Vec<u32> {
    let mut rates = Vec::with_capacity(5);
    if let Some(preferred) = config.preferred_sample_rate {
        rates.push(preferred);
    }
    for rate in [config.target_sample_rate, device_default, 48_000, 44_100] {
        if !rates.contains(&rate) {
            rates.push(rate);
        }
    }
    rates
}

fn capture_loop(
    config: &AudioConfig,
    intake: &Arc<Intake>,
    stop: &Arc<AtomicBool>,
    ready_tx: &std::sync::mpsc::Sender<Result<OpenedStream>>,
) {
    let mut last_error = UmebotError::Audio("no capture attempt made".to_owned());
    let attempts = config.open_retry_attempts.max(1);

    for attempt in 1..=attempts {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        match open_stream(config, intake, stop) {
            Ok((stream, opened)) => {
                let _ = ready_tx.send(Ok(opened));
                // Keep the stream alive on this thread until asked to stop.
                while !stop.load(Ordering::SeqCst) {
                    std::thread::sleep(STOP_POLL);
                }
                drop(stream);
                return;
            }
            Err(e) => {
                warn!("capture open attempt {attempt}/{attempts} failed: {e}");
                last_error = e;
                if attempt < attempts {
                    std::thread::sleep(Duration::from_secs(config.open_retry_delay_secs));
                }
            }
        }
    }
    let _ = ready_tx.send(Err(last_error));
}

fn open_stream(
    config: &AudioConfig,
    intake: &Arc<Intake>,
    stop: &Arc<AtomicBool>,
) -> Result<(cpal::Stream, OpenedStream)> {
    let device = find_device(config)?;
    let device_name = device
        .description()
        .map(|description| description.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".to_owned());

    let default_config = device
        .default_input_config()
        .map_err(|e| UmebotError::Audio(format!("no default input config: {e}")))?;
    let native_channels = default_config.channels();
    let device_default_rate = default_config.sample_rate();

    let queue_cap = config.intake_queue_frames.max(1);
    let mut last_error = UmebotError::Audio("no rate candidates".to_owned());

    for rate in candidate_rates(config, device_default_rate) {
        let stream_config = StreamConfig {
            channels: native_channels,
            sample_rate: rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let callback_intake = Arc::clone(intake);
        let callback_stop = Arc::clone(stop);
        let built = device.build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                if callback_stop.load(Ordering::Relaxed) {
                    return;
                }
                // Never block the audio callback: drop-oldest on overflow.
                if let Ok(mut frames) = callback_intake.frames.lock() {
                    if frames.len() >= queue_cap {
                        let _ = frames.pop_front();
                        callback_intake.overflowed.fetch_add(1, Ordering::Relaxed);
                    }
                    frames.push_back(data.to_vec());
                }
                callback_intake.available.notify_one();
            },
            move |err| {
                warn!("audio input stream error: {err}");
            },
            None,
        );

        match built {
            Ok(stream) => {
                stream
                    .play()
                    .map_err(|e| UmebotError::Audio(format!("failed to start stream: {e}")))?;
                info!(
                    "capture open on '{device_name}': {rate}Hz, {native_channels} channels"
                );
                return Ok((
                    stream,
                    OpenedStream {
                        native_rate: rate,
                        native_channels,
                    },
                ));
            }
            Err(e) => {
                debug!("device rejected {rate}Hz: {e}");
                last_error = UmebotError::Audio(format!("device rejected {rate}Hz: {e}"));
            }
        }
    }
    Err(last_error)
}

fn resample_loop(
    intake: &Arc<Intake>,
    stop: &Arc<AtomicBool>,
    out_tx: &crossbeam_channel::Sender<AudioEvent>,
    native_rate: u32,
    native_channels: u16,
    target_rate: u32,
) {
    let mut dropped: u64 = 0;
    let mut last_report = Instant::now();

    loop {
        let frame = {
            let Ok(guard) = intake.frames.lock() else {
                return;
            };
            let Ok(mut guard) = intake
                .available
                .wait_timeout_while(guard, STOP_POLL, |frames| {
                    frames.is_empty() && !stop.load(Ordering::SeqCst)
                })
            else {
                return;
            };
            if stop.load(Ordering::SeqCst) {
                return;
            }
            guard.0.pop_front()
        };

        let Some(frame) = frame else {
            continue;
        };

        let mono = to_mono(&frame, native_channels);
        let resampled = resample(&mono, native_rate, target_rate);
        let pcm = to_i16_le(&resampled);
        if pcm.is_empty() {
            continue;
        }
        if !publish(
            out_tx,
            AudioEvent::Chunk(crate::audio::AudioChunk::new(pcm)),
            &mut dropped,
        ) {
            return;
        }

        if last_report.elapsed() >= Duration::from_secs(2) {
            let overflowed = intake.overflowed.swap(0, Ordering::Relaxed);
            if overflowed > 0 {
                warn!("capture intake overflow, dropped {overflowed} oldest frames (last 2s)");
            }
            if dropped > 0 {
                debug!("audio output channel full, dropped {dropped} chunks (last 2s)");
                dropped = 0;
            }
            last_report = Instant::now();
        }
    }
}
