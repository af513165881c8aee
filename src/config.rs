use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::alert::AlertLevel;
use crate::error::ConfigError;
use crate::{
    CHUNK_MS, DEBOUNCE_TICKS, HEARTBEAT_TICKS, HOP_LENGTH, MEL_BANDS, MODEL_FRAMES, N_FFT,
    SAMPLE_RATE, THRESHOLD, WINDOW_MS,
};

/// Immutable process configuration, built once at startup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub audio: AudioConfig,
    pub features: FeatureConfig,
    pub model: ModelConfig,
    pub smoother: SmootherConfig,
    pub dispatch: DispatchConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub chunk_ms: u32,
    pub window_ms: u32,
    /// A push arriving later than this after the previous one marks the window stale.
    pub stale_after_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            chunk_ms: CHUNK_MS,
            window_ms: WINDOW_MS,
            stale_after_ms: CHUNK_MS + CHUNK_MS / 2,
        }
    }
}

impl AudioConfig {
    pub fn chunk_size(&self) -> usize {
        (self.sample_rate as u64 * self.chunk_ms as u64 / 1000) as usize
    }

    pub fn window_size(&self) -> usize {
        (self.sample_rate as u64 * self.window_ms as u64 / 1000) as usize
    }

    pub fn chunk_duration(&self) -> Duration {
        Duration::from_millis(self.chunk_ms as u64)
    }

    pub fn window_duration(&self) -> Duration {
        Duration::from_millis(self.window_ms as u64)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    LogMel,
    Mfcc,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeatureConfig {
    pub kind: FeatureKind,
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub n_mfcc: usize,
    /// Time frames the model expects; shorter audio is zero padded, longer truncated.
    pub frames: usize,
    pub top_db: Option<f32>,
    pub peak_normalize: bool,
    pub min_max_normalize: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            kind: FeatureKind::LogMel,
            n_fft: N_FFT,
            hop_length: HOP_LENGTH,
            n_mels: MEL_BANDS,
            n_mfcc: 40,
            frames: MODEL_FRAMES,
            top_db: Some(80.0),
            peak_normalize: true,
            min_max_normalize: true,
        }
    }
}

impl FeatureConfig {
    /// Rows of the feature tensor.
    pub fn bands(&self) -> usize {
        match self.kind {
            FeatureKind::LogMel => self.n_mels,
            FeatureKind::Mfcc => self.n_mfcc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Logits,
    Probabilities,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Quantization {
    pub scale: f32,
    pub zero_point: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    pub path: PathBuf,
    pub input_shape: Vec<usize>,
    pub labels: Vec<String>,
    pub output: OutputKind,
    pub input_quantization: Option<Quantization>,
    pub output_quantization: Option<Quantization>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("models/safety_3class.onnx"),
            input_shape: vec![1, 1, MEL_BANDS, MODEL_FRAMES],
            labels: vec!["neutral".into(), "fear".into(), "angry".into()],
            output: OutputKind::Logits,
            input_quantization: None,
            output_quantization: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SmootherConfig {
    pub threshold: f32,
    pub debounce_ticks: usize,
    /// Re-send the current level after this many ticks without a dispatch. `None` disables it.
    pub heartbeat_ticks: Option<u32>,
    /// Class label to alert level. Unlisted labels count as SAFE.
    pub levels: BTreeMap<String, AlertLevel>,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        let levels = [
            ("neutral", AlertLevel::Safe),
            ("fear", AlertLevel::Danger),
            ("angry", AlertLevel::Caution),
        ]
        .into_iter()
        .map(|(label, level)| (label.to_string(), level))
        .collect();

        Self {
            threshold: THRESHOLD,
            debounce_ticks: DEBOUNCE_TICKS,
            heartbeat_ticks: Some(HEARTBEAT_TICKS),
            levels,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub topic: String,
    pub client_prefix: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Total time one command may spend on reconnect attempts before it is dropped.
    pub reconnect_budget_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            broker_host: "broker.hivemq.com".into(),
            broker_port: 1883,
            topic: "distress-relay/badge".into(),
            client_prefix: "distress-relay".into(),
            keep_alive_secs: 30,
            connect_timeout_ms: 1500,
            backoff_initial_ms: 100,
            backoff_max_ms: 1000,
            reconnect_budget_ms: 2000,
        }
    }
}

impl DispatchConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_budget(&self) -> Duration {
        Duration::from_millis(self.reconnect_budget_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    pub device_id: Option<String>,
    /// JSON lines file. Records go to the log when unset.
    pub path: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Check everything that can be checked before a model is loaded.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let chunk = self.audio.chunk_size();
        let window = self.audio.window_size();
        if chunk == 0 || window < chunk {
            return Err(ConfigError::Window { window, chunk });
        }

        let f = &self.features;
        if f.n_fft < 2 || f.hop_length == 0 || f.frames == 0 || f.n_mels == 0 {
            return Err(ConfigError::Features("n_fft, hop_length, frames and n_mels must be positive"));
        }
        if f.kind == FeatureKind::Mfcc && (f.n_mfcc == 0 || f.n_mfcc > f.n_mels) {
            return Err(ConfigError::Features("n_mfcc must lie in 1..=n_mels"));
        }
        check_input_shape(&self.model.input_shape, f.bands(), f.frames)?;

        for q in [self.model.input_quantization, self.model.output_quantization]
            .into_iter()
            .flatten()
        {
            if !(q.scale.is_finite() && q.scale > 0.0) {
                return Err(ConfigError::Quantization);
            }
        }

        if self.model.labels.is_empty() {
            return Err(ConfigError::NoLabels);
        }
        if let Some(label) = self
            .smoother
            .levels
            .keys()
            .find(|label| !self.model.labels.contains(label))
        {
            return Err(ConfigError::UnknownLabel(label.clone()));
        }

        let t = self.smoother.threshold;
        if !(0.0..1.0).contains(&t) {
            return Err(ConfigError::Threshold(t));
        }
        if self.smoother.debounce_ticks == 0 {
            return Err(ConfigError::Debounce);
        }
        Ok(())
    }

    /// Alert level for each class index, in model output order.
    pub fn level_table(&self) -> Vec<AlertLevel> {
        self.model
            .labels
            .iter()
            .map(|label| self.smoother.levels.get(label).copied().unwrap_or_default())
            .collect()
    }
}

/// The declared model input, with unit (batch/channel) axes removed, must be `[bands, frames]`.
pub fn check_input_shape(declared: &[usize], bands: usize, frames: usize) -> Result<(), ConfigError> {
    let squeezed: Vec<usize> = declared.iter().copied().filter(|&d| d != 1).collect();
    let expected: Vec<usize> = [bands, frames].into_iter().filter(|&d| d != 1).collect();
    if squeezed == expected && declared.iter().product::<usize>() == bands * frames {
        Ok(())
    } else {
        Err(ConfigError::ShapeMismatch {
            declared: declared.iter().map(|&d| d as i64).collect(),
            bands,
            frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.audio.chunk_size(), 8000);
        assert_eq!(config.audio.window_size(), 32768);
        assert_eq!(
            config.level_table(),
            vec![AlertLevel::Safe, AlertLevel::Danger, AlertLevel::Caution]
        );
    }

    #[test]
    fn test_toml_overrides() {
        let config: Config = toml::from_str(
            r#"
            [audio]
            sample_rate = 22050
            window_ms = 3000

            [features]
            kind = "mfcc"
            n_mfcc = 40
            n_mels = 128
            n_fft = 2048
            frames = 130
            min_max_normalize = false

            [model]
            input_shape = [1, 40, 130, 1]
            labels = ["angry", "fear", "neutral", "sad"]

            [smoother]
            threshold = 0.7
            debounce_ticks = 2
            levels = { angry = "caution", fear = "danger" }
            "#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.audio.window_size(), 66150);
        assert_eq!(config.features.bands(), 40);
        assert_eq!(
            config.level_table(),
            vec![
                AlertLevel::Caution,
                AlertLevel::Danger,
                AlertLevel::Safe,
                AlertLevel::Safe
            ]
        );
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("[smoother]\nthreshhold = 0.5\n").is_err());
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        let mut config = Config::default();
        config.model.input_shape = vec![1, 1, 64, 32];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ShapeMismatch { .. })
        ));

        assert!(check_input_shape(&[1, 40, 130, 1], 40, 130).is_ok());
        assert!(check_input_shape(&[1, 130, 40, 1], 40, 130).is_err());
    }

    #[test]
    fn test_invalid_smoother_settings() {
        let mut config = Config::default();
        config.smoother.threshold = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Threshold(_))));

        let mut config = Config::default();
        config.smoother.debounce_ticks = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Debounce)));

        let mut config = Config::default();
        config.smoother.levels.insert("sad".into(), AlertLevel::Caution);
        assert!(matches!(config.validate(), Err(ConfigError::UnknownLabel(l)) if l == "sad"));
    }

    #[test]
    fn test_window_must_hold_a_chunk() {
        let mut config = Config::default();
        config.audio.window_ms = 250;
        assert!(matches!(config.validate(), Err(ConfigError::Window { .. })));
    }
}
