use ndarray::{s, Array2};
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

use crate::config::{FeatureConfig, FeatureKind};

const AMIN: f32 = 1e-10;
const MIN_MAX_EPS: f32 = 1e-6;

/// `bands × frames` features for one window.
pub type FeatureTensor = Array2<f32>;

/// Must reproduce the preprocessing the classifier was trained with.
pub struct Preprocessor {
    config: FeatureConfig,
    fft: Arc<dyn Fft<f32>>,
    hann: Vec<f32>,
    filter_bank: Array2<f32>, // [mel][fft bin]
    dct: Option<Array2<f32>>, // [coeff][mel]
}

impl Preprocessor {
    pub fn new(sample_rate: u32, config: &FeatureConfig) -> Self {
        let n_fft = config.n_fft;
        let fft = FftPlanner::<f32>::new().plan_fft_forward(n_fft);

        // Periodic Hann, as used for spectral analysis
        let hann = (0..n_fft)
            .map(|n| 0.5 - 0.5 * (2.0 * PI * n as f32 / n_fft as f32).cos())
            .collect();

        let filter_bank = mel_filter_bank(sample_rate, n_fft, config.n_mels);
        let dct = match config.kind {
            FeatureKind::LogMel => None,
            FeatureKind::Mfcc => Some(dct_matrix(config.n_mfcc, config.n_mels)),
        };

        Self {
            config: config.clone(),
            fft,
            hann,
            filter_bank,
            dct,
        }
    }

    /// Output shape `(bands, frames)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.config.bands(), self.config.frames)
    }

    /// Deterministic: identical input yields bit-identical output.
    pub fn extract(&self, window: &[f32]) -> FeatureTensor {
        let audio = if self.config.peak_normalize {
            peak_normalize(window)
        } else {
            window.to_vec()
        };

        let power = self.power_spectrogram(&audio);
        let mel = self.filter_bank.dot(&power);

        let mut features = match &self.dct {
            None => power_to_db(&mel, max_value(&mel), self.config.top_db),
            Some(dct) => dct.dot(&power_to_db(&mel, 1.0, self.config.top_db)),
        };

        if self.config.min_max_normalize {
            min_max_normalize(&mut features);
        }

        fit_frames(&features, self.config.frames)
    }

    /// Centred STFT power, `(n_fft/2 + 1) × n_frames`.
    fn power_spectrogram(&self, audio: &[f32]) -> Array2<f32> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let pad = n_fft / 2;

        let mut padded = vec![0.0f32; audio.len() + 2 * pad];
        padded[pad..pad + audio.len()].copy_from_slice(audio);

        let n_frames = 1 + (padded.len() - n_fft) / hop;
        let n_bins = n_fft / 2 + 1;
        let mut power = Array2::<f32>::zeros((n_bins, n_frames));
        let mut buf = vec![Complex32::new(0.0, 0.0); n_fft];

        for frame in 0..n_frames {
            let start = frame * hop;
            for (dst, (&x, &w)) in buf
                .iter_mut()
                .zip(padded[start..start + n_fft].iter().zip(&self.hann))
            {
                *dst = Complex32::new(x * w, 0.0);
            }
            self.fft.process(&mut buf);
            for (bin, c) in buf.iter().take(n_bins).enumerate() {
                power[[bin, frame]] = c.norm_sqr();
            }
        }

        power
    }
}

fn peak_normalize(samples: &[f32]) -> Vec<f32> {
    let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    if peak > 0.0 {
        samples.iter().map(|s| s / peak).collect()
    } else {
        samples.to_vec()
    }
}

fn max_value(a: &Array2<f32>) -> f32 {
    a.iter().copied().fold(0.0f32, f32::max)
}

fn power_to_db(s: &Array2<f32>, reference: f32, top_db: Option<f32>) -> Array2<f32> {
    let ref_db = 10.0 * reference.max(AMIN).log10();
    let mut db = s.mapv(|v| 10.0 * v.max(AMIN).log10() - ref_db);
    if let Some(top) = top_db {
        let floor = db.iter().copied().fold(f32::NEG_INFINITY, f32::max) - top;
        db.mapv_inplace(|v| v.max(floor));
    }
    db
}

fn min_max_normalize(a: &mut Array2<f32>) {
    let (min, max) = a
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if min.is_finite() && max.is_finite() {
        a.mapv_inplace(|v| (v - min) / (max - min + MIN_MAX_EPS));
    }
}

/// Zero pad or truncate the time axis.
fn fit_frames(features: &Array2<f32>, frames: usize) -> Array2<f32> {
    let (bands, have) = features.dim();
    let keep = have.min(frames);
    let mut out = Array2::<f32>::zeros((bands, frames));
    out.slice_mut(s![.., ..keep])
        .assign(&features.slice(s![.., ..keep]));
    out
}


const F_SP: f32 = 200.0 / 3.0;
const MIN_LOG_HZ: f32 = 1000.0;
const MIN_LOG_MEL: f32 = MIN_LOG_HZ / F_SP;

fn log_step() -> f32 {
    6.4f32.ln() / 27.0
}

/// Slaney mel scale: linear below 1 kHz, logarithmic above.
fn hz_to_mel(hz: f32) -> f32 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f32) -> f32 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        F_SP * mel
    }
}

/// Triangular filters from 0 Hz to Nyquist, area-normalised.
fn mel_filter_bank(sample_rate: u32, n_fft: usize, n_mels: usize) -> Array2<f32> {
    let n_bins = n_fft / 2 + 1;
    let nyquist = sample_rate as f32 / 2.0;
    let mel_max = hz_to_mel(nyquist);

    let hz_points: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_max * i as f32 / (n_mels + 1) as f32))
        .collect();
    let bin_hz: Vec<f32> = (0..n_bins)
        .map(|k| k as f32 * sample_rate as f32 / n_fft as f32)
        .collect();

    let mut bank = Array2::<f32>::zeros((n_mels, n_bins));
    for m in 0..n_mels {
        let (left, center, right) = (hz_points[m], hz_points[m + 1], hz_points[m + 2]);
        let enorm = 2.0 / (right - left);
        for (k, &f) in bin_hz.iter().enumerate() {
            let lower = (f - left) / (center - left);
            let upper = (right - f) / (right - center);
            bank[[m, k]] = lower.min(upper).max(0.0) * enorm;
        }
    }
    bank
}

/// Orthonormal DCT-II, first `n_coeffs` rows.
fn dct_matrix(n_coeffs: usize, n_mels: usize) -> Array2<f32> {
    let n = n_mels as f32;
    Array2::from_shape_fn((n_coeffs, n_mels), |(k, m)| {
        let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
        scale * (PI * k as f32 * (2.0 * m as f32 + 1.0) / (2.0 * n)).cos()
    })
}
