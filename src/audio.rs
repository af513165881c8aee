use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AudioConfig;
use crate::error::ConfigError;

/// Chunks waiting between the capture callback and the tick loop.
/// Beyond this the oldest waiting chunk is overwritten.
const CAPTURE_BACKLOG: usize = 2;

/// Block of mono samples in [-1.0, 1.0].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    samples: Vec<f32>,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    pub fn from_i16(pcm: &[i16]) -> Self {
        Self::new(pcm.iter().map(|&s| s as f32 / 32768.0).collect())
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}

pub trait AudioSource {
    /// Next chunk, or `None` once the stream has ended.
    fn next_chunk(&mut self) -> Result<Option<AudioChunk>>;
}

/// Bounded hand-off from the capture callback. When full, the oldest chunk
/// is evicted so the tick loop always sees the freshest audio.
pub struct ChunkQueue {
    state: Mutex<Backlog>,
    ready: Condvar,
}

struct Backlog {
    chunks: VecDeque<AudioChunk>,
    capacity: usize,
    evicted: u64,
}

impl ChunkQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(Backlog {
                chunks: VecDeque::with_capacity(capacity),
                capacity,
                evicted: 0,
            }),
            ready: Condvar::new(),
        }
    }

    /// Never blocks. Returns `true` when an older chunk had to make room.
    pub fn push(&self, chunk: AudioChunk) -> bool {
        let mut state = self.state.lock();
        let full = state.chunks.len() >= state.capacity;
        if full {
            state.chunks.pop_front();
            state.evicted += 1;
        }
        state.chunks.push_back(chunk);
        drop(state);
        self.ready.notify_one();
        full
    }

    /// Oldest waiting chunk, blocking until one arrives.
    pub fn pop(&self) -> AudioChunk {
        let mut state = self.state.lock();
        loop {
            if let Some(chunk) = state.chunks.pop_front() {
                return chunk;
            }
            self.ready.wait(&mut state);
        }
    }

    /// Chunks overwritten so far.
    pub fn evicted(&self) -> u64 {
        self.state.lock().evicted
    }
}

/// Default input device, captured as f32 and cut into fixed-size chunks.
pub struct MicSource {
    _stream: Stream,
    queue: Arc<ChunkQueue>,
    reported: u64,
}

impl MicSource {
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .context("No input device available")?;

        let chunk_size = config.chunk_size();
        let stream_config = StreamConfig {
            channels: 1,
            sample_rate: SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let queue = Arc::new(ChunkQueue::new(CAPTURE_BACKLOG));
        let stream = Self::build_stream(&device, &stream_config, chunk_size, queue.clone())?;
        stream.play().context("Failed to start audio stream")?;

        Ok(Self {
            _stream: stream,
            queue,
            reported: 0,
        })
    }

    fn build_stream(
        device: &cpal::Device,
        config: &StreamConfig,
        chunk_size: usize,
        queue: Arc<ChunkQueue>,
    ) -> Result<Stream> {
        let err_fn = |err| log::error!("Audio stream error: {}", err);
        let mut pending: Vec<f32> = Vec::with_capacity(chunk_size * 2);

        let stream = device.build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                pending.extend(data.iter().map(|s| s.clamp(-1.0, 1.0)));

                // Send complete chunks
                while pending.len() >= chunk_size {
                    queue.push(AudioChunk::new(pending.drain(..chunk_size).collect()));
                }
            },
            err_fn,
            None,
        )?;

        Ok(stream)
    }
}

impl AudioSource for MicSource {
    fn next_chunk(&mut self) -> Result<Option<AudioChunk>> {
        let chunk = self.queue.pop();
        let evicted = self.queue.evicted();
        if evicted > self.reported {
            log::warn!(
                "Dropped {} stale audio chunks, tick loop is falling behind",
                evicted - self.reported
            );
            self.reported = evicted;
        }
        Ok(Some(chunk))
    }
}

/// Replays a WAV file as if it were arriving from a microphone.
pub struct WavSource {
    samples: Vec<f32>,
    position: usize,
    chunk_size: usize,
    pace: Option<Duration>,
}

impl WavSource {
    pub fn open(path: &Path, config: &AudioConfig) -> Result<Self> {
        let reader = hound::WavReader::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let spec = reader.spec();

        if spec.sample_rate != config.sample_rate {
            return Err(ConfigError::SampleRate {
                expected: config.sample_rate,
                found: spec.sample_rate,
            }
            .into());
        }

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<_, _>>()
                .context("Failed to decode float samples")?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()
                    .context("Failed to decode integer samples")?
            }
        };

        let channels = spec.channels.max(1) as usize;
        let samples = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();

        Ok(Self::from_samples(samples, config.chunk_size()))
    }

    pub fn from_samples(samples: Vec<f32>, chunk_size: usize) -> Self {
        Self {
            samples,
            position: 0,
            chunk_size,
            pace: None,
        }
    }

    /// Sleep this long before handing out each chunk.
    pub fn paced(mut self, interval: Duration) -> Self {
        self.pace = Some(interval);
        self
    }

    pub fn duration_samples(&self) -> usize {
        self.samples.len()
    }
}

impl AudioSource for WavSource {
    fn next_chunk(&mut self) -> Result<Option<AudioChunk>> {
        if self.position >= self.samples.len() {
            return Ok(None);
        }
        if let Some(interval) = self.pace {
            std::thread::sleep(interval);
        }

        let end = (self.position + self.chunk_size).min(self.samples.len());
        let mut block = self.samples[self.position..end].to_vec();
        block.resize(self.chunk_size, 0.0);
        self.position = end;

        Ok(Some(AudioChunk::new(block)))
    }
}
