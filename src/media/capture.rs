//! Capture sources feeding the local audio track.
//!
//! The silence source runs everywhere. Microphone capture uses cpal and
//! Opus and is only built with the `audio` feature; the capture thread and
//! the track pump both stop when the session's `running` flag drops.

use super::track::LocalTrack;
use bytes::Bytes;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Opus TOC byte for a 20 ms silence frame plus two padding bytes
pub const OPUS_SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

/// Every capture source produces 20 ms frames
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Microphone capture parameters
#[derive(Debug, Clone)]
pub struct AudioCaptureConfig {
    /// Sample rate (Hz)
    pub sample_rate: u32,
    /// Channel count (1 or 2)
    pub channels: u16,
    /// Target bitrate (bps)
    pub bitrate: u32,
}

/// Encoded audio packet
#[derive(Debug, Clone)]
pub struct AudioPacket {
    pub data: Vec<u8>,
}

/// Feed Opus silence into `track` until capture is released.
pub async fn pump_silence(track: Arc<LocalTrack>, running: Arc<AtomicBool>) {
    let mut ticker = tokio::time::interval(FRAME_DURATION);
    info!("Silence capture started on track {}", track.id());
    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        if track
            .write_sample(Bytes::from_static(&OPUS_SILENCE_FRAME), FRAME_DURATION)
            .await
            .is_err()
            && track.is_stopped()
        {
            break;
        }
    }
    debug!("Silence capture stopped on track {}", track.id());
}

/// Forward encoded packets from a capture thread into `track`.
pub async fn pump_packets(
    track: Arc<LocalTrack>,
    mut packets: broadcast::Receiver<AudioPacket>,
    running: Arc<AtomicBool>,
) {
    info!("Audio forward loop started on track {}", track.id());
    while running.load(Ordering::Relaxed) {
        match packets.recv().await {
            Ok(packet) => {
                if let Err(e) = track.write_sample(Bytes::from(packet.data), FRAME_DURATION).await {
                    if track.is_stopped() {
                        break;
                    }
                    debug!("Track {} audio write error: {}", track.id(), e);
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Track {} audio receiver lagged by {}", track.id(), n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                info!("Track {} audio channel closed", track.id());
                break;
            }
        }
    }
}

/// Name of the default input device, or why there is none.
#[cfg(feature = "audio")]
pub fn probe_input_device() -> Result<String, String> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| "no default input device".to_string())?;
    device
        .default_input_config()
        .map_err(|e| format!("input device not usable: {}", e))?;
    Ok(device.name().unwrap_or_else(|_| "default".to_string()))
}

/// Capture the default microphone, encode 20 ms Opus frames and broadcast them.
/// Blocks until `running` is cleared.
#[cfg(feature = "audio")]
pub fn run_microphone_capture(
    config: AudioCaptureConfig,
    sender: broadcast::Sender<AudioPacket>,
    running: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use opus::{Application, Bitrate, Channels, Encoder};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or("No default input device")?;
    let supported_config = {
        let mut selected = None;
        if let Ok(configs) = device.supported_input_configs() {
            for cfg in configs {
                if cfg.channels() == config.channels {
                    let min_rate = cfg.min_sample_rate().0;
                    let max_rate = cfg.max_sample_rate().0;
                    if config.sample_rate >= min_rate && config.sample_rate <= max_rate {
                        selected = Some(cfg.with_sample_rate(cpal::SampleRate(config.sample_rate)));
                        break;
                    }
                }
            }
        }
        match selected {
            Some(cfg) => cfg,
            None => device.default_input_config()?,
        }
    };

    let sample_rate = supported_config.sample_rate().0;
    let channel_count = supported_config.channels();
    let channels = match channel_count {
        1 => Channels::Mono,
        2 => Channels::Stereo,
        _ => return Err("Unsupported channel count".into()),
    };

    let mut encoder = Encoder::new(sample_rate, channels, Application::Voip)?;
    encoder.set_bitrate(Bitrate::Bits(config.bitrate as i32))?;
    let encoder = Arc::new(Mutex::new(encoder));

    let frame_size = (sample_rate / 50) as usize; // 20ms
    let samples_per_frame = frame_size * channel_count as usize;
    let buffer = Arc::new(Mutex::new(VecDeque::<i16>::new()));

    let stream = match supported_config.sample_format() {
        cpal::SampleFormat::F32 => {
            let buffer = buffer.clone();
            let sender = sender.clone();
            let running = running.clone();
            let encoder = encoder.clone();
            device.build_input_stream(
                &supported_config.config(),
                move |data: &[f32], _| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    let mut buf = buffer.lock();
                    for sample in data {
                        buf.push_back((sample * 32767.0).clamp(-32768.0, 32767.0) as i16);
                    }
                    encode_ready_frames(&mut encoder.lock(), &mut buf, samples_per_frame, &sender);
                },
                |err| warn!("Microphone stream error: {:?}", err),
                None,
            )?
        }
        cpal::SampleFormat::I16 => {
            let buffer = buffer.clone();
            let sender = sender.clone();
            let running = running.clone();
            let encoder = encoder.clone();
            device.build_input_stream(
                &supported_config.config(),
                move |data: &[i16], _| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    let mut buf = buffer.lock();
                    buf.extend(data.iter().copied());
                    encode_ready_frames(&mut encoder.lock(), &mut buf, samples_per_frame, &sender);
                },
                |err| warn!("Microphone stream error: {:?}", err),
                None,
            )?
        }
        cpal::SampleFormat::U16 => {
            let buffer = buffer.clone();
            let sender = sender.clone();
            let running = running.clone();
            let encoder = encoder.clone();
            device.build_input_stream(
                &supported_config.config(),
                move |data: &[u16], _| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    let mut buf = buffer.lock();
                    for sample in data {
                        buf.push_back((*sample as i32 - 32768) as i16);
                    }
                    encode_ready_frames(&mut encoder.lock(), &mut buf, samples_per_frame, &sender);
                },
                |err| warn!("Microphone stream error: {:?}", err),
                None,
            )?
        }
        other => return Err(format!("Unsupported sample format {:?}", other).into()),
    };

    stream.play()?;
    info!("Microphone capture running at {} Hz, {} channel(s)", sample_rate, channel_count);
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }
    drop(stream);
    info!("Microphone capture stopped");

    Ok(())
}

#[cfg(feature = "audio")]
fn encode_ready_frames(
    encoder: &mut opus::Encoder,
    buffer: &mut std::collections::VecDeque<i16>,
    samples_per_frame: usize,
    sender: &broadcast::Sender<AudioPacket>,
) {
    while buffer.len() >= samples_per_frame {
        let frame: Vec<i16> = buffer.drain(..samples_per_frame).collect();
        let mut out = vec![0u8; 4000];
        if let Ok(len) = encoder.encode(&frame, &mut out) {
            out.truncate(len);
            let _ = sender.send(AudioPacket { data: out });
        }
    }
}
