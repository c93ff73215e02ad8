//! Native Mikrofon-Capture (Feature `native-audio`)
//!
//! Verwendet cpal für Cross-Platform Audio Input. Der Capture-Callback
//! liest das Enabled-Flag des geteilten Audio-Tracks, ein Mute greift
//! daher sofort.

use super::media::{LocalMediaStream, MediaConstraints, MediaDevices, MediaError, MediaTrack};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz, wie Opus)
pub const SAMPLE_RATE: u32 = 48000;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Buffer Size für den Capture-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Access to audio input denied: {0}")]
    PermissionDenied(String),

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

impl From<AudioError> for MediaError {
    fn from(err: AudioError) -> Self {
        match err {
            AudioError::NoInputDevice => MediaError::NotFound(err.to_string()),
            AudioError::PermissionDenied(msg) => MediaError::NotAllowed(msg),
            other => MediaError::Other(other.to_string()),
        }
    }
}

fn classify_build_error(err: BuildStreamError) -> AudioError {
    match err {
        BuildStreamError::DeviceNotAvailable => AudioError::NoInputDevice,
        BuildStreamError::BackendSpecific { err } => {
            let description = err.description.to_lowercase();
            if description.contains("permission")
                || description.contains("denied")
                || description.contains("not allowed")
            {
                AudioError::PermissionDenied(err.description)
            } else {
                AudioError::StreamBuildError(err.description)
            }
        }
        other => AudioError::StreamBuildError(other.to_string()),
    }
}

// ============================================================================
// CAPTURE
// ============================================================================

/// cpal Stream ist nicht Send; er wird nur gehalten und beim Stop gedroppt
struct CaptureStream(Stream);

unsafe impl Send for CaptureStream {}

/// Lesezugriff auf das aufgenommene Audio (Raw PCM, mono, 48kHz).
///
/// Einziger Konsument des Ring Buffers ist der Aufrufer: Frames lesen,
/// nach Opus kodieren und über `WebRtcPeerFactory::write_audio_sample` an
/// die Peers geben. Ohne Konsument läuft der Buffer voll und neue Samples
/// werden verworfen.
#[derive(Clone)]
pub struct CaptureTap {
    buffer: Arc<Mutex<HeapRb<f32>>>,
    input_level: Arc<Mutex<f32>>,
}

impl CaptureTap {
    fn new() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
            input_level: Arc::new(Mutex::new(0.0)),
        }
    }

    /// Liest einen Frame von aufgenommenem Audio
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.buffer.lock();
        if buffer.occupied_len() < FRAME_SIZE {
            return None;
        }
        let mut frame = Vec::with_capacity(FRAME_SIZE);
        for _ in 0..FRAME_SIZE {
            if let Some(sample) = buffer.try_pop() {
                frame.push(sample);
            }
        }
        Some(frame)
    }

    /// Eingangspegel (0.0 - 1.0) für Visualisierung
    pub fn input_level(&self) -> f32 {
        *self.input_level.lock()
    }
}

/// Mikrofon über cpal; Kameras werden nicht unterstützt
pub struct NativeMediaDevices {
    tap: Mutex<Option<CaptureTap>>,
}

impl NativeMediaDevices {
    pub fn new() -> Self {
        Self {
            tap: Mutex::new(None),
        }
    }

    /// Tap der zuletzt gestarteten Capture, Einstieg für den Sende-Pfad
    pub fn tap(&self) -> Option<CaptureTap> {
        self.tap.lock().clone()
    }

    fn start_capture(&self, track: &MediaTrack) -> Result<(CaptureStream, CaptureTap), AudioError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(AudioError::NoInputDevice)?;

        // Beste Konfiguration finden
        let config = find_best_input_config(&device)?;
        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let tap = CaptureTap::new();
        let capture_buffer = Arc::clone(&tap.buffer);
        let input_level = Arc::clone(&tap.input_level);
        let track = track.clone();
        let channels = config.channels as usize;
        let source_sample_rate = config.sample_rate.0;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono = downmix(data, channels);
                    *input_level.lock() = rms(&mono).min(1.0);

                    if !track.is_enabled() || track.is_stopped() {
                        return;
                    }

                    let samples = resample_linear(&mono, source_sample_rate, SAMPLE_RATE);
                    let mut buffer = capture_buffer.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(classify_build_error)?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok((CaptureStream(stream), tap))
    }
}

impl Default for NativeMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for NativeMediaDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaStream, MediaError> {
        if constraints.video {
            return Err(MediaError::NotFound(
                "camera capture is not available on this platform".to_string(),
            ));
        }
        if !constraints.audio {
            return Err(MediaError::Other("no tracks requested".to_string()));
        }

        let track = MediaTrack::audio("default microphone");
        let (capture, tap) = self.start_capture(&track)?;
        *self.tap.lock() = Some(tap);

        Ok(LocalMediaStream::new(vec![track]).with_stop_hook(move || {
            drop(capture);
            tracing::info!("Audio capture stopped");
        }))
    }
}

// ============================================================================
// SIGNALVERARBEITUNG
// ============================================================================

/// Mittelt interleaved Kanäle zu Mono
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

fn rms(data: &[f32]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt()
}

/// Einfaches Linear-Resampling
fn resample_linear(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || data.is_empty() {
        return data.to_vec();
    }
    let ratio = target_rate as f32 / source_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

fn find_best_input_config(device: &Device) -> Result<StreamConfig, AudioError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Wählt die beste Konfiguration: 48kHz bevorzugt, nur F32
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, AudioError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);
    let supports_target =
        |c: &SupportedStreamConfigRange| c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate;

    let f32_configs = || configs.iter().filter(|c| c.sample_format() == SampleFormat::F32);

    if let Some(config) = f32_configs().find(|c| supports_target(c)) {
        return Ok(config.clone().with_sample_rate(target_rate).into());
    }

    // Der Callback verarbeitet nur f32
    if let Some(config) = f32_configs().next() {
        return Ok(config.clone().with_max_sample_rate().into());
    }

    Err(AudioError::UnsupportedConfig(
        "No f32 audio input configuration found".to_string(),
    ))
}
