//! Recording state machine: idle → recording → previewing → idle.
//!
//! While recording, two background tasks run: a sampler that turns the
//! stream's spectrum into level bars once per display frame, and a
//! one-second duration counter. Both stop (and are joined) before the
//! capture stream is finalized or released.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{summarize_spectrum, CaptureStream, DeviceError, MediaDevices, PlaybackSink};
use crate::api::AgentApi;
use crate::chat::{ChatSession, SendOutcome, SkipReason};
use crate::config::AudioConfig;
use crate::models::{Blob, ObjectUrls};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecorderError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Already recording")]
    AlreadyRecording,

    #[error("Not recording")]
    NotRecording,

    #[error("No recording to preview")]
    NothingToPreview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    Previewing,
}

/// What a level-meter UI shows.
#[derive(Debug, Clone, PartialEq)]
pub struct Meter {
    pub levels: Vec<f32>,
    pub duration_secs: u64,
}

impl Meter {
    fn silent(bars: usize) -> Self {
        Self {
            levels: vec![0.0; bars],
            duration_secs: 0,
        }
    }
}

type SharedStream = Arc<Mutex<Box<dyn CaptureStream>>>;

struct Capture {
    stream: SharedStream,
    cancel: CancellationToken,
    sampler: JoinHandle<()>,
    ticker: JoinHandle<()>,
}

struct Preview {
    blob: Blob,
    url: String,
}

pub struct AudioRecorder {
    devices: Arc<dyn MediaDevices>,
    playback: Box<dyn PlaybackSink>,
    object_urls: Arc<ObjectUrls>,
    bars: usize,
    frame_period: Duration,
    state: RecorderState,
    capture: Option<Capture>,
    preview: Option<Preview>,
    meter: watch::Sender<Meter>,
    playing: bool,
}

impl AudioRecorder {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        playback: Box<dyn PlaybackSink>,
        config: &AudioConfig,
    ) -> Self {
        let bars = config.bars;
        let (meter, _) = watch::channel(Meter::silent(bars));
        Self {
            devices,
            playback,
            object_urls: Arc::new(ObjectUrls::new()),
            bars,
            frame_period: Duration::from_secs_f64(1.0 / f64::from(config.frame_rate_hz.max(1))),
            state: RecorderState::Idle,
            capture: None,
            preview: None,
            meter,
            playing: false,
        }
    }

    pub fn with_object_urls(mut self, object_urls: Arc<ObjectUrls>) -> Self {
        self.object_urls = object_urls;
        self
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == RecorderState::Recording
    }

    pub fn levels(&self) -> Vec<f32> {
        self.meter.borrow().levels.clone()
    }

    pub fn duration_seconds(&self) -> u64 {
        self.meter.borrow().duration_secs
    }

    /// Follow meter updates (levels every frame, duration every second).
    pub fn subscribe(&self) -> watch::Receiver<Meter> {
        self.meter.subscribe()
    }

    pub fn preview_url(&self) -> Option<&str> {
        self.preview.as_ref().map(|p| p.url.as_str())
    }

    pub fn preview_blob(&self) -> Option<&Blob> {
        self.preview.as_ref().map(|p| &p.blob)
    }

    /// Open the microphone and start recording. A previous preview is
    /// discarded. On a device error the recorder stays idle.
    pub async fn start_recording(&mut self) -> Result<(), RecorderError> {
        if self.state == RecorderState::Recording {
            return Err(RecorderError::AlreadyRecording);
        }
        self.discard_preview();

        let stream = self.devices.acquire().await.map_err(|e| {
            tracing::warn!(error = %e, "Could not start recording");
            e
        })?;
        let stream: SharedStream = Arc::new(Mutex::new(stream));

        self.meter.send_replace(Meter::silent(self.bars));
        let cancel = CancellationToken::new();
        let sampler = tokio::spawn(sample_levels(
            stream.clone(),
            self.meter.clone(),
            self.bars,
            self.frame_period,
            cancel.clone(),
        ));
        let ticker = tokio::spawn(count_seconds(self.meter.clone(), cancel.clone()));

        self.capture = Some(Capture {
            stream,
            cancel,
            sampler,
            ticker,
        });
        self.state = RecorderState::Recording;
        tracing::info!("Recording started");
        Ok(())
    }

    /// Finish recording and move to preview with the captured blob.
    pub async fn stop_recording(&mut self) -> Result<(), RecorderError> {
        let Some(capture) = self.capture.take() else {
            return Err(RecorderError::NotRecording);
        };
        let mut stream = match halt(capture).await {
            Ok(stream) => stream,
            Err(e) => {
                self.reset();
                return Err(e.into());
            }
        };
        let finalized = stream.finalize().await;
        stream.release();
        self.meter.send_modify(|m| m.levels = vec![0.0; self.bars]);

        let blob = match finalized {
            Ok(blob) => blob,
            Err(e) => {
                tracing::warn!(error = %e, "Recording could not be finalized");
                self.reset();
                return Err(e.into());
            }
        };

        if let Err(e) = self.playback.load(&blob) {
            tracing::warn!(error = %e, "Preview playback unavailable");
        }
        let url = self.object_urls.create(blob.clone());
        tracing::info!(
            bytes = blob.len(),
            duration_secs = self.duration_seconds(),
            "Recording stopped"
        );
        self.preview = Some(Preview { blob, url });
        self.state = RecorderState::Previewing;
        Ok(())
    }

    /// Throw away the current recording or preview and return to idle.
    pub async fn cancel_recording(&mut self) {
        if let Some(capture) = self.capture.take() {
            if let Ok(mut stream) = halt(capture).await {
                stream.release();
            }
        }
        self.reset();
        tracing::info!("Recording cancelled");
    }

    pub fn play(&mut self) -> Result<(), RecorderError> {
        if self.preview.is_none() {
            return Err(RecorderError::NothingToPreview);
        }
        self.playback.play()?;
        self.playing = true;
        Ok(())
    }

    pub fn pause(&mut self) {
        self.playback.pause();
        self.playing = false;
    }

    /// Also notices playback that reached the end on its own.
    pub fn is_playing(&mut self) -> bool {
        if self.playing && self.playback.has_ended() {
            self.playing = false;
        }
        self.playing
    }

    /// Send the previewed recording through `chat`, then return to idle.
    /// If the chat is busy with another send the preview is kept.
    pub async fn send<A: AgentApi + ?Sized>(
        &mut self,
        chat: &ChatSession<A>,
        caption: &str,
    ) -> Result<SendOutcome, RecorderError> {
        let Some(preview) = self.preview.as_ref() else {
            return Err(RecorderError::NothingToPreview);
        };
        let blob = preview.blob.clone();
        let outcome = chat.send_audio(blob, caption).await;
        if !matches!(outcome, SendOutcome::Skipped(SkipReason::Busy)) {
            self.reset();
        }
        Ok(outcome)
    }

    fn discard_preview(&mut self) {
        if let Some(preview) = self.preview.take() {
            self.object_urls.revoke(&preview.url);
        }
        self.playback.stop();
        self.playing = false;
    }

    fn reset(&mut self) {
        self.discard_preview();
        self.meter.send_replace(Meter::silent(self.bars));
        self.state = RecorderState::Idle;
    }
}

impl Drop for AudioRecorder {
    fn drop(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.cancel.cancel();
            capture.sampler.abort();
            capture.ticker.abort();
            // The sampler checks the token under this lock, so it cannot
            // sample once the device is released.
            lock_stream(&capture.stream).release();
        }
        if let Some(preview) = self.preview.take() {
            self.object_urls.revoke(&preview.url);
        }
        self.playback.stop();
    }
}

/// Stop the background tasks and take the stream back.
async fn halt(capture: Capture) -> Result<Box<dyn CaptureStream>, DeviceError> {
    capture.cancel.cancel();
    let _ = capture.sampler.await;
    let _ = capture.ticker.await;
    match Arc::try_unwrap(capture.stream) {
        Ok(stream) => Ok(stream.into_inner().unwrap_or_else(|p| p.into_inner())),
        Err(shared) => {
            // Still shared: release in place so the device is not left open.
            lock_stream(&shared).release();
            Err(DeviceError::Backend("capture stream still in use".into()))
        }
    }
}

fn lock_stream(stream: &SharedStream) -> MutexGuard<'_, Box<dyn CaptureStream>> {
    stream.lock().unwrap_or_else(|p| p.into_inner())
}

async fn sample_levels(
    stream: SharedStream,
    meter: watch::Sender<Meter>,
    bars: usize,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut frames = interval(period);
    frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = frames.tick() => {
                let spectrum = {
                    let mut stream = lock_stream(&stream);
                    if cancel.is_cancelled() {
                        break;
                    }
                    stream.sample()
                };
                let levels = summarize_spectrum(&spectrum, bars);
                meter.send_modify(|m| m.levels = levels);
            }
        }
    }
}

async fn count_seconds(meter: watch::Sender<Meter>, cancel: CancellationToken) {
    let second = Duration::from_secs(1);
    let mut ticks = interval_at(Instant::now() + second, second);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticks.tick() => meter.send_modify(|m| m.duration_secs += 1),
        }
    }
}
