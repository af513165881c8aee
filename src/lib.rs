pub mod actuator;
pub mod alert;
pub mod audio;
pub mod classifier;
pub mod config;
pub mod detector;
pub mod dispatch;
pub mod error;
pub mod link;
pub mod logging;
pub mod preprocessing;
pub mod smoother;
pub mod telemetry;
pub mod window;

// Defaults - must match the preprocessing the classifier was trained with
pub const SAMPLE_RATE: u32 = 16000;
pub const CHUNK_MS: u32 = 500;
pub const WINDOW_MS: u32 = 2048; // MODEL_FRAMES hops of HOP_LENGTH
pub const N_FFT: usize = 1024;
pub const HOP_LENGTH: usize = 512;
pub const MEL_BANDS: usize = 64;
pub const MODEL_FRAMES: usize = 64;

// Smoother defaults
pub const THRESHOLD: f32 = 0.6;
pub const DEBOUNCE_TICKS: usize = 3;
pub const HEARTBEAT_TICKS: u32 = 20;

pub use alert::AlertLevel;
pub use config::Config;
pub use detector::DistressDetector;
