//! Frequency analysis for the recording level meter.
//!
//! `FrequencyAnalyser` follows the usual analyser-node conventions so the
//! meter behaves the same on every backend:
//! - Blackman window over the most recent `fft_size` samples
//! - magnitudes scaled by `1/fft_size`, smoothed over time (0.8)
//! - decibels mapped from [-100 dB, -30 dB] onto bytes 0..=255
//!
//! `summarize_spectrum` reduces a spectrum to a fixed number of bars.

use std::sync::Arc;

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

pub const MIN_DECIBELS: f32 = -100.0;
pub const MAX_DECIBELS: f32 = -30.0;
pub const SMOOTHING: f32 = 0.8;

/// Average contiguous buckets of `spectrum` into `bars` levels in 0.0..=1.0.
///
/// Buckets are `len / bars` bins wide; trailing bins that do not fill a
/// bucket are ignored. A spectrum shorter than `bars` maps one bin per bar.
pub fn summarize_spectrum(spectrum: &[u8], bars: usize) -> Vec<f32> {
    if bars == 0 {
        return Vec::new();
    }
    if spectrum.is_empty() {
        return vec![0.0; bars];
    }

    let step = spectrum.len() / bars;
    (0..bars)
        .map(|i| {
            let bucket = if step > 0 {
                &spectrum[i * step..(i + 1) * step]
            } else {
                let j = i * spectrum.len() / bars;
                &spectrum[j..j + 1]
            };
            let sum: f32 = bucket.iter().map(|&b| f32::from(b)).sum();
            sum / (bucket.len() as f32 * 255.0)
        })
        .collect()
}

pub struct FrequencyAnalyser {
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    buf: Vec<Complex32>,
}

impl FrequencyAnalyser {
    /// `fft_size` is rounded up to a power of two, minimum 32.
    pub fn new(fft_size: usize) -> Self {
        let fft_size = fft_size.max(32).next_power_of_two();
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);
        Self {
            fft_size,
            fft,
            window: blackman_window(fft_size),
            smoothed: vec![0.0; fft_size / 2],
            buf: vec![Complex32::new(0.0, 0.0); fft_size],
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Analyse the newest `fft_size` samples (zero-padded in front when
    /// fewer are available) and return one byte per frequency bin.
    pub fn analyse(&mut self, samples: &[f32]) -> Vec<u8> {
        let n = self.fft_size;
        let take = samples.len().min(n);
        let pad = n - take;
        let recent = &samples[samples.len() - take..];

        for (i, c) in self.buf.iter_mut().enumerate() {
            let s = if i < pad { 0.0 } else { recent[i - pad] };
            *c = Complex32::new(s * self.window[i], 0.0);
        }
        self.fft.process(&mut self.buf);

        let scale = 1.0 / n as f32;
        self.smoothed
            .iter_mut()
            .zip(&self.buf)
            .map(|(prev, x)| {
                let magnitude = x.norm() * scale;
                *prev = SMOOTHING * *prev + (1.0 - SMOOTHING) * magnitude;
                to_byte(*prev)
            })
            .collect()
    }

    pub fn reset(&mut self) {
        self.smoothed.iter_mut().for_each(|v| *v = 0.0);
    }
}

fn to_byte(magnitude: f32) -> u8 {
    if magnitude <= 0.0 {
        return 0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = 255.0 * (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS);
    scaled.clamp(0.0, 255.0) as u8
}

fn blackman_window(n: usize) -> Vec<f32> {
    let (a0, a1, a2) = (0.42f32, 0.5f32, 0.08f32);
    (0..n)
        .map(|i| {
            let x = 2.0 * std::f32::consts::PI * i as f32 / n as f32;
            a0 - a1 * x.cos() + a2 * (2.0 * x).cos()
        })
        .collect()
}
