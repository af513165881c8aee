use thiserror::Error;

/// Startup configuration problems. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("model input shape {declared:?} does not match feature tensor [{bands}, {frames}]")]
    ShapeMismatch {
        declared: Vec<i64>,
        bands: usize,
        frames: usize,
    },
    #[error("model returns {got} classes but {expected} labels are configured")]
    ClassCountMismatch { expected: usize, got: usize },
    #[error("level table names unknown label '{0}'")]
    UnknownLabel(String),
    #[error("model {tensor} is {found}, expected {expected}")]
    ElementType {
        tensor: &'static str,
        expected: ort::tensor::TensorElementType,
        found: ort::tensor::TensorElementType,
    },
    #[error("model {0} is not a single tensor")]
    NotATensor(&'static str),
    #[error("no class labels configured")]
    NoLabels,
    #[error("confidence threshold {0} must lie in [0, 1)")]
    Threshold(f32),
    #[error("debounce must be at least one tick")]
    Debounce,
    #[error("window ({window} samples) must hold at least one chunk ({chunk} samples)")]
    Window { window: usize, chunk: usize },
    #[error("invalid feature setting: {0}")]
    Features(&'static str),
    #[error("audio file is {found} Hz, pipeline runs at {expected} Hz")]
    SampleRate { expected: u32, found: u32 },
    #[error("quantization scale must be positive and finite")]
    Quantization,
}

/// A single inference failed; the tick is skipped.
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("inference runtime: {0}")]
    Runtime(#[from] ort::Error),
    #[error("tensor layout: {0}")]
    Layout(#[from] ndarray::ShapeError),
    #[error("model produced {got} scores, expected {expected}")]
    OutputLength { expected: usize, got: usize },
    #[error("model produced non-finite scores")]
    NonFinite,
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("not connected")]
    NotConnected,
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),
    #[error("connection lost: {0}")]
    Lost(String),
    #[error("publish rejected: {0}")]
    Publish(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("broker unreachable after {attempts} attempts")]
    Unreachable { attempts: u32 },
    #[error("superseded by a newer alert level")]
    Superseded,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("expected a single byte payload, got {0} bytes")]
    Length(usize),
    #[error("unknown command byte 0x{0:02x}")]
    Unknown(u8),
}
