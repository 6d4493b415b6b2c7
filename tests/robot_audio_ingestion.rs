//! Robot audio ingestion over a real localhost TCP connection: the
//! permission gate, half-second segmentation, downmix to the pipeline
//! format, and the disconnect sentinel.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use umebot_backend::audio::robot_stream::RobotAudioServer;
use umebot_backend::audio::AudioEvent;
use umebot_backend::config::RobotAudioConfig;

fn config() -> RobotAudioConfig {
    RobotAudioConfig {
        port: 0,
        incoming_sample_rate: 16_000,
        incoming_channels: 2,
        intake_queue_segments: 16,
    }
}

/// One half-second stereo segment of a square wave (both channels in phase,
/// so the downmix stays non-silent).
fn one_segment(config: &RobotAudioConfig) -> Vec<u8> {
    let mut raw = Vec::with_capacity(config.segment_bytes());
    let mut frame = 0usize;
    while raw.len() < config.segment_bytes() {
        let sample: i16 = if frame % 2 == 0 { 6_000 } else { -6_000 };
        for _ in 0..config.incoming_channels {
            raw.extend_from_slice(&sample.to_le_bytes());
        }
        frame += 1;
    }
    raw
}

fn collect_events(
    rx: &crossbeam_channel::Receiver<AudioEvent>,
    deadline: Duration,
) -> Vec<AudioEvent> {
    let mut events = Vec::new();
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if let Ok(event) = rx.recv_timeout(Duration::from_millis(50)) {
            events.push(event);
        }
    }
    events
}

#[test]
fn segments_are_decoded_and_disconnect_emits_sentinel() {
    let config = config();
    let gate = Arc::new(AtomicBool::new(true));
    let (tx, rx) = crossbeam_channel::bounded(64);
    let server = RobotAudioServer::start(config.clone(), 16_000, gate, tx).unwrap();
    server.activate();

    {
        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client.write_all(&one_segment(&config)).unwrap();
        client.write_all(&one_segment(&config)).unwrap();
        client.flush().unwrap();
        std::thread::sleep(Duration::from_millis(300));
    } // drop closes the connection

    let events = collect_events(&rx, Duration::from_secs(1));
    let chunks: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            AudioEvent::Chunk(chunk) => Some(chunk),
            AudioEvent::StreamEnd => None,
        })
        .collect();
    assert_eq!(chunks.len(), 2, "one chunk per half-second segment");

    // Stereo 16 kHz in, mono 16 kHz out: half a second is 8000 samples.
    assert_eq!(chunks[0].pcm.len(), 16_000);
    // The constant-amplitude signal survives the downmix audibly non-silent.
    let rms: f64 = chunks[0]
        .pcm
        .chunks_exact(2)
        .map(|b| {
            let s = i16::from_le_bytes([b[0], b[1]]) as f64 / i16::MAX as f64;
            s * s
        })
        .sum::<f64>()
        / (chunks[0].pcm.len() / 2) as f64;
    assert!(rms.sqrt() > 0.01);

    assert!(
        events
            .iter()
            .any(|event| matches!(event, AudioEvent::StreamEnd)),
        "disconnect must emit the stream-end sentinel"
    );

    server.stop();
}

#[test]
fn closed_gate_rejects_connections() {
    let config = config();
    let gate = Arc::new(AtomicBool::new(false));
    let (tx, rx) = crossbeam_channel::bounded(64);
    let server = RobotAudioServer::start(config.clone(), 16_000, Arc::clone(&gate), tx).unwrap();
    server.activate();

    {
        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        // The write may succeed into the OS buffer, but nothing is ingested.
        let _ = client.write_all(&one_segment(&config));
        std::thread::sleep(Duration::from_millis(300));
    }

    let events = collect_events(&rx, Duration::from_millis(500));
    assert!(
        events
            .iter()
            .all(|event| !matches!(event, AudioEvent::Chunk(_))),
        "gated-off path must not publish chunks"
    );

    server.stop();
}

#[test]
fn deactivated_path_publishes_nothing() {
    let config = config();
    let gate = Arc::new(AtomicBool::new(true));
    let (tx, rx) = crossbeam_channel::bounded(64);
    let server = RobotAudioServer::start(config.clone(), 16_000, gate, tx).unwrap();
    // Never activated: decoded segments are dropped, not published.

    {
        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client.write_all(&one_segment(&config)).unwrap();
        std::thread::sleep(Duration::from_millis(300));
    }

    let events = collect_events(&rx, Duration::from_millis(500));
    assert!(events.is_empty());

    server.stop();
}
