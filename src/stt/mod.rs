//! Recognition pipeline: chunk stream in, transcripts out.
//!
//! One dedicated worker thread feeds the recognizer chunk by chunk, slices
//! VAD frames for speech-state tracking, and enforces silence-timeout
//! finalization. The recognizer is never called concurrently.

pub mod parakeet;
pub mod vad;

use crate::audio::AudioEvent;
use crate::config::SttConfig;
use crate::error::Result;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vad::VoiceActivityDetector;

/// Worker loop tick; bounds silence-timeout detection latency.
const TICK: Duration = Duration::from_millis(50);

/// Chunk-fed streaming recognizer surface.
///
/// Implementations accept i16 LE mono PCM at the configured sample rate.
pub trait StreamingRecognizer: Send {
    /// Feed one chunk. Returns true when the engine closed a segment on its
    /// own (intrinsic finalization).
    ///
    /// # Errors
    ///
    /// Chunk errors are recoverable; the pipeline logs and skips them.
    fn accept(&mut self, pcm: &[u8]) -> Result<bool>;

    /// Current in-progress hypothesis (may repeat between calls).
    fn partial(&mut self) -> String;

    /// Text of the segment the engine just closed.
    fn segment_text(&mut self) -> String;

    /// Flush the current utterance and return its text.
    fn finalize(&mut self) -> String;

    /// Drop all buffered state.
    fn reset(&mut self);
}

/// Transcript and speech-state events emitted by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEvent {
    /// In-progress hypothesis. Emitted only when it differs from the last
    /// one; an empty partial is emitted once when a hypothesis is cleared.
    Partial(String),
    /// Committed utterance text, always non-empty.
    Final(String),
    /// VAD speech-state edge.
    SpeakingChanged(bool),
}

/// Control messages for the worker.
enum PipelineControl {
    Pause,
    Resume,
    SourceChanged,
    Stop,
}

/// Streaming recognition pipeline (C2).
pub struct RecognitionPipeline {
    config: SttConfig,
    ctrl_tx: Mutex<Option<crossbeam_channel::Sender<PipelineControl>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RecognitionPipeline {
    pub fn new(config: SttConfig) -> Self {
        Self {
            config,
            ctrl_tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Start the worker over an audio stream. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the VAD configuration is invalid.
    pub fn start(
        &self,
        audio_rx: crossbeam_channel::Receiver<AudioEvent>,
        recognizer: Box<dyn StreamingRecognizer>,
        events: mpsc::UnboundedSender<SttEvent>,
        sample_rate: u32,
    ) -> Result<()> {
        let Ok(mut worker) = self.worker.lock() else {
            return Ok(());
        };
        if worker.is_some() {
            debug!("recognition pipeline already running");
            return Ok(());
        }

        let detector = if self.config.vad_enabled {
            Some(VoiceActivityDetector::new(
                self.config.vad_aggressiveness,
                self.config.vad_frame_ms,
                sample_rate,
            )?)
        } else {
            info!("VAD disabled, using audio-arrival silence timeout");
            None
        };

        let (ctrl_tx, ctrl_rx) = crossbeam_channel::unbounded();
        let silence_timeout = Duration::from_secs_f32(self.config.silence_timeout_secs.max(0.1));
        let handle = std::thread::Builder::new()
            .name("recognition".to_owned())
            .spawn(move || {
                let mut state = WorkerState::new(recognizer, detector, events, silence_timeout);
                worker_loop(&mut state, &audio_rx, &ctrl_rx);
            })
            .map_err(|e| crate::error::UmebotError::Stt(format!("cannot spawn worker: {e}")))?;

        *worker = Some(handle);
        if let Ok(mut ctrl) = self.ctrl_tx.lock() {
            *ctrl = Some(ctrl_tx);
        }
        info!(
            "recognition pipeline started (VAD {})",
            if self.config.vad_enabled { "on" } else { "off" }
        );
        Ok(())
    }

    fn send_ctrl(&self, msg: PipelineControl) {
        if let Ok(ctrl) = self.ctrl_tx.lock() {
            if let Some(tx) = ctrl.as_ref() {
                let _ = tx.send(msg);
            }
        }
    }

    /// Discard chunks until resumed (self-hearing guard).
    pub fn pause(&self) {
        self.send_ctrl(PipelineControl::Pause);
    }

    /// Resume feeding chunks to the recognizer.
    pub fn resume(&self) {
        self.send_ctrl(PipelineControl::Resume);
    }

    /// Flush the current utterance and reset for a new audio source.
    pub fn notify_source_change(&self) {
        self.send_ctrl(PipelineControl::SourceChanged);
    }

    /// Whether the worker is running.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .map(|worker| worker.is_some())
            .unwrap_or(false)
    }

    /// Stop the worker. Idempotent.
    pub fn stop(&self) {
        self.send_ctrl(PipelineControl::Stop);
        if let Ok(mut ctrl) = self.ctrl_tx.lock() {
            *ctrl = None;
        }
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                if handle.join().is_err() {
                    warn!("recognition worker panicked");
                }
            }
        }
        info!("recognition pipeline stopped");
    }
}

struct WorkerState {
    recognizer: Box<dyn StreamingRecognizer>,
    detector: Option<VoiceActivityDetector>,
    events: mpsc::UnboundedSender<SttEvent>,
    silence_timeout: Duration,
    paused: bool,
    vad_buffer: Vec<u8>,
    currently_speaking: bool,
    last_voice: Instant,
    last_audio: Instant,
    fed_since_final: bool,
    last_partial: String,
}

impl WorkerState {
    fn new(
        recognizer: Box<dyn StreamingRecognizer>,
        detector: Option<VoiceActivityDetector>,
        events: mpsc::UnboundedSender<SttEvent>,
        silence_timeout: Duration,
    ) -> Self {
        Self {
            recognizer,
            detector,
            events,
            silence_timeout,
            paused: false,
            vad_buffer: Vec::new(),
            currently_speaking: false,
            last_voice: Instant::now(),
            last_audio: Instant::now(),
            fed_since_final: false,
            last_partial: String::new(),
        }
    }

    fn emit(&self, event: SttEvent) {
        let _ = self.events.send(event);
    }

    fn set_speaking(&mut self, speaking: bool) {
        if speaking != self.currently_speaking {
            self.currently_speaking = speaking;
            self.emit(SttEvent::SpeakingChanged(speaking));
        }
    }

    fn maybe_emit_partial(&mut self, partial: String) {
        if partial != self.last_partial {
            self.emit(SttEvent::Partial(partial.clone()));
            self.last_partial = partial;
        }
    }

    /// Commit a segment: non-empty text becomes a final; an empty result
    /// clears any lingering hypothesis on the GUI side.
    fn commit_final(&mut self, text: String) {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            self.emit(SttEvent::Final(trimmed.to_owned()));
        } else if !self.last_partial.is_empty() {
            self.emit(SttEvent::Partial(String::new()));
        }
        self.last_partial.clear();
        self.fed_since_final = false;
    }

    fn handle_chunk(&mut self, pcm: &[u8]) {
        if self.paused || pcm.is_empty() {
            return;
        }
        self.last_audio = Instant::now();
        self.fed_since_final = true;

        if self.detector.is_some() {
            self.vad_buffer.extend_from_slice(pcm);
            let frame_bytes = self.detector.as_ref().unwrap().frame_bytes();
            while self.vad_buffer.len() >= frame_bytes {
                let frame: Vec<u8> = self.vad_buffer.drain(..frame_bytes).collect();
                let is_speech = self.detector.as_ref().unwrap().is_speech(&frame);
                if is_speech {
                    self.last_voice = Instant::now();
                }
                self.set_speaking(is_speech);
            }
        }

        match self.recognizer.accept(pcm) {
            Ok(true) => {
                let text = self.recognizer.segment_text();
                self.commit_final(text);
            }
            Ok(false) => {
                let partial = self.recognizer.partial();
                self.maybe_emit_partial(partial);
            }
            Err(e) => {
                // The worker survives chunk errors.
                warn!("recognizer chunk error, skipping: {e}");
            }
        }
    }

    fn check_silence(&mut self) {
        if self.detector.is_some() {
            if self.currently_speaking && self.last_voice.elapsed() > self.silence_timeout {
                debug!("silence timeout, forcing finalization");
                let text = self.recognizer.finalize();
                self.commit_final(text);
                self.set_speaking(false);
                self.vad_buffer.clear();
                self.last_voice = Instant::now();
            }
        } else if self.fed_since_final
            && self.last_audio.elapsed() > self.silence_timeout.mul_f32(1.5)
        {
            debug!("audio-arrival timeout, forcing finalization");
            let text = self.recognizer.finalize();
            self.commit_final(text);
        }
    }

    /// Flush for a source change or stream end: finalize, reset, clear state.
    fn flush(&mut self, reason: &str) {
        debug!("flushing recognition state ({reason})");
        let text = self.recognizer.finalize();
        self.commit_final(text);
        self.recognizer.reset();
        self.vad_buffer.clear();
        self.set_speaking(false);
    }
}

fn worker_loop(
    state: &mut WorkerState,
    audio_rx: &crossbeam_channel::Receiver<AudioEvent>,
    ctrl_rx: &crossbeam_channel::Receiver<PipelineControl>,
) {
    let mut audio_rx = audio_rx.clone();
    loop {
        crossbeam_channel::select! {
            recv(ctrl_rx) -> msg => match msg {
                Ok(PipelineControl::Pause) => {
                    state.paused = true;
                    debug!("recognition paused");
                }
                Ok(PipelineControl::Resume) => {
                    state.paused = false;
                    debug!("recognition resumed");
                }
                Ok(PipelineControl::SourceChanged) => state.flush("source change"),
                Ok(PipelineControl::Stop) | Err(_) => {
                    state.flush("stop");
                    return;
                }
            },
            recv(audio_rx) -> event => match event {
                Ok(AudioEvent::Chunk(chunk)) => state.handle_chunk(&chunk.pcm),
                Ok(AudioEvent::StreamEnd) => state.flush("stream end"),
                Err(_) => {
                    // Upstream closed; keep serving control messages.
                    audio_rx = crossbeam_channel::never();
                }
            },
            default(TICK) => {}
        }
        state.check_silence();
    }
}
