//! Microphone capture and speaker playback via cpal.
//!
//! cpal streams are not `Send` on every host, so each stream lives on its
//! own thread and is torn down by dropping the thread's stop channel.
//! Recordings are delivered as 16-bit mono WAV.

use std::io::Cursor;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use super::{CaptureStream, DeviceError, FrequencyAnalyser, MediaDevices, PlaybackSink};
use crate::config::AudioConfig;
use crate::models::Blob;

pub const WAV_MIME_TYPE: &str = "audio/wav";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// The default system microphone.
pub struct CpalDevices {
    fft_size: usize,
}

impl CpalDevices {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            fft_size: config.fft_size,
        }
    }
}

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn acquire(&self) -> Result<Box<dyn CaptureStream>, DeviceError> {
        let samples = Arc::new(Mutex::new(Vec::new()));
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let buffer = samples.clone();
        let thread = std::thread::Builder::new()
            .name("hipocampo-capture".into())
            .spawn(move || run_capture(buffer, ready_tx, stop_rx))
            .map_err(|e| DeviceError::Backend(format!("cannot spawn capture thread: {e}")))?;

        let sample_rate = match ready_rx.await {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(DeviceError::Backend("capture thread exited".into()));
            }
        };

        Ok(Box::new(CpalStream {
            samples,
            sample_rate,
            analyser: FrequencyAnalyser::new(self.fft_size),
            stop: Some(stop_tx),
            thread: Some(thread),
        }))
    }
}

fn run_capture(
    samples: Arc<Mutex<Vec<f32>>>,
    ready: oneshot::Sender<Result<u32, DeviceError>>,
    stop: mpsc::Receiver<()>,
) {
    let stream = match open_input(samples) {
        Ok((stream, rate)) => {
            let _ = ready.send(Ok(rate));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    // Blocks until a stop message arrives or the sender is dropped.
    let _ = stop.recv();
    drop(stream);
    debug!("capture thread finished");
}

fn open_input(samples: Arc<Mutex<Vec<f32>>>) -> Result<(cpal::Stream, u32), DeviceError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(DeviceError::NoDevice)?;
    let default_config = device
        .default_input_config()
        .map_err(|e| DeviceError::Backend(format!("no default input config: {e}")))?;

    let channels = default_config.channels();
    let sample_rate = default_config.sample_rate();
    let stream_config = StreamConfig {
        channels,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mut buf = lock(&samples);
                if channels > 1 {
                    buf.extend(to_mono(data, channels));
                } else {
                    buf.extend_from_slice(data);
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
            },
            None,
        )
        .map_err(map_build_error)?;

    stream
        .play()
        .map_err(|e| DeviceError::Backend(format!("failed to start input stream: {e}")))?;

    info!(sample_rate, channels, "Microphone opened");
    Ok((stream, sample_rate))
}

fn map_build_error(e: cpal::BuildStreamError) -> DeviceError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => DeviceError::NoDevice,
        other => DeviceError::Backend(format!("failed to build stream: {other}")),
    }
}

struct CpalStream {
    samples: Arc<Mutex<Vec<f32>>>,
    sample_rate: u32,
    analyser: FrequencyAnalyser,
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalStream {
    fn stop_capture(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("capture thread panicked");
            }
        }
    }
}

#[async_trait]
impl CaptureStream for CpalStream {
    fn sample(&mut self) -> Vec<u8> {
        let n = self.analyser.fft_size();
        let recent: Vec<f32> = {
            let buf = lock(&self.samples);
            buf[buf.len().saturating_sub(n)..].to_vec()
        };
        self.analyser.analyse(&recent)
    }

    async fn finalize(&mut self) -> Result<Blob, DeviceError> {
        self.stop_capture();
        let samples = std::mem::take(&mut *lock(&self.samples));
        let wav = encode_wav(&samples, self.sample_rate)?;
        Ok(Blob::new(WAV_MIME_TYPE, wav))
    }

    fn release(&mut self) {
        self.stop_capture();
        self.analyser.reset();
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.stop_capture();
    }
}

/// Default system speakers.
#[derive(Default)]
pub struct CpalPlayback {
    loaded: Option<Arc<Clip>>,
    active: Option<ActivePlayback>,
}

struct Clip {
    samples: Vec<f32>,
    sample_rate: u32,
}

struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    paused: bool,
    finished: bool,
}

struct ActivePlayback {
    buffer: Arc<Mutex<PlaybackBuffer>>,
    stop: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl ActivePlayback {
    fn finished(&self) -> bool {
        lock(&self.buffer).finished
    }

    fn shutdown(self) {
        drop(self.stop);
        if self.thread.join().is_err() {
            error!("playback thread panicked");
        }
    }
}

impl CpalPlayback {
    pub fn new() -> Self {
        Self::default()
    }

    fn start(&mut self, clip: Arc<Clip>) -> Result<(), DeviceError> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let buffer = Arc::new(Mutex::new(PlaybackBuffer {
            samples: Vec::new(),
            position: 0,
            paused: false,
            finished: false,
        }));

        let shared = buffer.clone();
        let thread = std::thread::Builder::new()
            .name("hipocampo-playback".into())
            .spawn(move || run_playback(clip, shared, ready_tx, stop_rx))
            .map_err(|e| DeviceError::Backend(format!("cannot spawn playback thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.active = Some(ActivePlayback {
                    buffer,
                    stop: stop_tx,
                    thread,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(DeviceError::Backend("playback thread exited".into()))
            }
        }
    }
}

impl PlaybackSink for CpalPlayback {
    fn load(&mut self, blob: &Blob) -> Result<(), DeviceError> {
        if let Some(active) = self.active.take() {
            active.shutdown();
        }
        let (samples, sample_rate) = decode_wav(blob.data.as_ref())?;
        self.loaded = Some(Arc::new(Clip {
            samples,
            sample_rate,
        }));
        Ok(())
    }

    fn play(&mut self) -> Result<(), DeviceError> {
        match &self.active {
            Some(active) if !active.finished() => {
                lock(&active.buffer).paused = false;
                Ok(())
            }
            _ => {
                if let Some(active) = self.active.take() {
                    active.shutdown();
                }
                let clip = self.loaded.clone().ok_or(DeviceError::NoDevice)?;
                self.start(clip)
            }
        }
    }

    fn pause(&mut self) {
        if let Some(active) = &self.active {
            lock(&active.buffer).paused = true;
        }
    }

    fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            active.shutdown();
        }
        self.loaded = None;
    }

    fn has_ended(&self) -> bool {
        self.active.as_ref().map_or(true, ActivePlayback::finished)
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.shutdown();
        }
    }
}

fn run_playback(
    clip: Arc<Clip>,
    buffer: Arc<Mutex<PlaybackBuffer>>,
    ready: mpsc::Sender<Result<(), DeviceError>>,
    stop: mpsc::Receiver<()>,
) {
    match open_output(&clip, buffer) {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            let _ = stop.recv();
            drop(stream);
        }
        Err(e) => {
            let _ = ready.send(Err(e));
        }
    }
}

fn open_output(
    clip: &Clip,
    buffer: Arc<Mutex<PlaybackBuffer>>,
) -> Result<cpal::Stream, DeviceError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(DeviceError::NoDevice)?;
    let default_config = device
        .default_output_config()
        .map_err(|e| DeviceError::Backend(format!("no default output config: {e}")))?;

    let channels = default_config.channels();
    let sample_rate = default_config.sample_rate();
    let stream_config = StreamConfig {
        channels,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let mono = resample_linear(&clip.samples, clip.sample_rate, sample_rate);
    lock(&buffer).samples = mono;

    let frame = usize::from(channels.max(1));
    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let mut buf = lock(&buffer);
                for out in data.chunks_mut(frame) {
                    let value = if buf.paused || buf.finished {
                        0.0
                    } else if buf.position < buf.samples.len() {
                        let v = buf.samples[buf.position];
                        buf.position += 1;
                        v
                    } else {
                        buf.finished = true;
                        0.0
                    };
                    out.iter_mut().for_each(|s| *s = value);
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(map_build_error)?;

    stream
        .play()
        .map_err(|e| DeviceError::Backend(format!("failed to start output stream: {e}")))?;
    Ok(stream)
}

/// Average interleaved channels into one.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = usize::from(channels);
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

fn resample_linear(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || from == 0 || to == 0 || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = f64::from(from) / f64::from(to);
    let out_len = (samples.len() as f64 / ratio) as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            let frac = pos - idx as f64;
            match (samples.get(idx), samples.get(idx + 1)) {
                (Some(&a), Some(&b)) => (f64::from(a) * (1.0 - frac) + f64::from(b) * frac) as f32,
                (Some(&a), None) => a,
                _ => samples[samples.len() - 1],
            }
        })
        .collect()
}

fn wav_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, DeviceError> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, wav_spec(sample_rate))
            .map_err(|e| DeviceError::Backend(format!("failed to create wav writer: {e}")))?;
        for &s in samples {
            let v = (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)).round() as i16;
            writer
                .write_sample(v)
                .map_err(|e| DeviceError::Backend(format!("failed to write wav sample: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| DeviceError::Backend(format!("failed to finalize wav: {e}")))?;
    }
    Ok(cursor.into_inner())
}

fn decode_wav(data: &[u8]) -> Result<(Vec<f32>, u32), DeviceError> {
    let mut reader = hound::WavReader::new(Cursor::new(data))
        .map_err(|e| DeviceError::Backend(format!("unreadable recording: {e}")))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max))
                .collect::<Result<_, _>>()
        }
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>(),
    }
    .map_err(|e| DeviceError::Backend(format!("wav read error: {e}")))?;

    let mono = if spec.channels > 1 {
        to_mono(&samples, spec.channels)
    } else {
        samples
    };
    Ok((mono, spec.sample_rate))
}
