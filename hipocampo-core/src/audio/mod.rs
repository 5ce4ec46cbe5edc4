//! Audio capture for voice messages.
//!
//! The recorder state machine talks to the platform through three
//! capabilities: `MediaDevices` hands out a `CaptureStream` (acquire),
//! the stream reports its frequency spectrum (sample) and turns what it
//! captured into a `Blob` (finalize) before giving the device back
//! (release). `PlaybackSink` plays a finished recording.

pub mod recorder;
pub mod spectrum;

#[cfg(feature = "microphone")]
pub mod cpal_backend;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::Blob;

pub use recorder::{AudioRecorder, Meter, RecorderError, RecorderState};
pub use spectrum::{summarize_spectrum, FrequencyAnalyser};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("No audio device available")]
    NoDevice,

    #[error("Audio backend error: {0}")]
    Backend(String),
}

/// Source of capture streams (the microphone).
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open the microphone and start recording.
    async fn acquire(&self) -> Result<Box<dyn CaptureStream>, DeviceError>;
}

/// A live recording.
#[async_trait]
pub trait CaptureStream: Send {
    /// Current byte frequency spectrum, 0..=255 per bin.
    fn sample(&mut self) -> Vec<u8>;

    /// Stop recording and join everything captured into one blob.
    async fn finalize(&mut self) -> Result<Blob, DeviceError>;

    /// Give the device back. Safe to call more than once.
    fn release(&mut self);
}

/// Plays one loaded recording at a time.
pub trait PlaybackSink: Send {
    fn load(&mut self, blob: &Blob) -> Result<(), DeviceError>;
    /// Start, or resume after `pause`.
    fn play(&mut self) -> Result<(), DeviceError>;
    fn pause(&mut self);
    /// Stop and unload.
    fn stop(&mut self);
    /// True once playback ran to the end of the recording.
    fn has_ended(&self) -> bool;
}

/// Devices for builds without a capture backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableDevices;

#[async_trait]
impl MediaDevices for UnavailableDevices {
    async fn acquire(&self) -> Result<Box<dyn CaptureStream>, DeviceError> {
        Err(DeviceError::NoDevice)
    }
}

/// Playback for builds without an output backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentPlayback;

impl PlaybackSink for SilentPlayback {
    fn load(&mut self, _blob: &Blob) -> Result<(), DeviceError> {
        Ok(())
    }

    fn play(&mut self) -> Result<(), DeviceError> {
        Err(DeviceError::NoDevice)
    }

    fn pause(&mut self) {}

    fn stop(&mut self) {}

    fn has_ended(&self) -> bool {
        true
    }
}
