use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;

use distress_relay::audio::{AudioSource, MicSource, WavSource};
use distress_relay::classifier::OnnxClassifier;
use distress_relay::detector::{DistressDetector, Tick};
use distress_relay::dispatch::{AlertSink, DispatchWorker, Dispatcher, LogAlertSink};
use distress_relay::link::{Endpoint, MqttLink};
use distress_relay::telemetry::{JsonLinesSink, LogSink, TelemetrySink};
use distress_relay::{logging, Config};

#[derive(Parser)]
#[command(name = "distress-relay")]
#[command(about = "Listens for distress in speech and relays alert levels over MQTT")]
struct Args {
    /// TOML config file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Replay a WAV file instead of capturing from the microphone
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Replay the WAV file in real time
    #[arg(long)]
    pace: bool,

    /// ONNX model path
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Confidence threshold (0.0 - 1.0)
    #[arg(short, long)]
    threshold: Option<f32>,

    #[arg(long)]
    broker: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    topic: Option<String>,

    /// Log alerts instead of publishing them
    #[arg(long)]
    dry_run: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(model) = &self.model {
            config.model.path = model.clone();
        }
        if let Some(threshold) = self.threshold {
            config.smoother.threshold = threshold;
        }
        if let Some(broker) = &self.broker {
            config.dispatch.broker_host = broker.clone();
        }
        if let Some(port) = self.port {
            config.dispatch.broker_port = port;
        }
        if let Some(topic) = &self.topic {
            config.dispatch.topic = topic.clone();
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    println!("distress-relay");
    println!("==============");
    println!("Model: {}", config.model.path.display());
    println!("Threshold: {}", config.smoother.threshold);
    println!("Debounce: {} ticks", config.smoother.debounce_ticks);
    if args.dry_run {
        println!("Broker: none (dry run)");
    } else {
        println!(
            "Broker: {}:{} topic {}",
            config.dispatch.broker_host, config.dispatch.broker_port, config.dispatch.topic
        );
    }
    println!();

    print!("Loading model...");
    let start = Instant::now();
    let classifier = OnnxClassifier::load(&config.model, &config.features)?;
    println!(" done ({:.2}s)", start.elapsed().as_secs_f32());

    if args.dry_run {
        run(&args, &config, classifier, LogAlertSink)
    } else {
        let link = MqttLink::new(Endpoint::from_config(&config.dispatch));
        let worker = DispatchWorker::spawn(Dispatcher::new(link, &config.dispatch))
            .context("Failed to start dispatch thread")?;
        run(&args, &config, classifier, worker)
    }
}

fn run<A: AlertSink>(args: &Args, config: &Config, classifier: OnnxClassifier, alerts: A) -> Result<()> {
    let telemetry: Box<dyn TelemetrySink> = match &config.telemetry.path {
        Some(path) => Box::new(JsonLinesSink::create(path)?),
        None => Box::new(LogSink),
    };
    let mut detector = DistressDetector::new(config, classifier, alerts).with_telemetry(telemetry);

    let mut source: Box<dyn AudioSource> = match &args.input {
        Some(path) => {
            let wav = WavSource::open(path, &config.audio)?;
            println!(
                "Replaying {} ({:.1}s)",
                path.display(),
                wav.duration_samples() as f32 / config.audio.sample_rate as f32
            );
            if args.pace {
                Box::new(wav.paced(config.audio.chunk_duration()))
            } else {
                Box::new(wav)
            }
        }
        None => {
            let mic = MicSource::new(&config.audio)?;
            println!("Listening... (Ctrl+C to quit)");
            Box::new(mic)
        }
    };
    println!();

    while let Some(chunk) = source.next_chunk()? {
        if let Tick::Classified(report) = detector.push(chunk) {
            log::debug!(
                "tick {}: {} {:.2} -> {}",
                detector.tick_count(),
                report.decision.class,
                report.decision.confidence,
                report.decision.level
            );
        }
    }

    println!(
        "Done: {} ticks, {} skipped, final level {}",
        detector.tick_count(),
        detector.skipped(),
        detector.level()
    );
    Ok(())
}
