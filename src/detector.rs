use chrono::Utc;
use std::time::{Duration, Instant};

use crate::alert::AlertLevel;
use crate::audio::AudioChunk;
use crate::classifier::Classifier;
use crate::config::Config;
use crate::dispatch::AlertSink;
use crate::preprocessing::Preprocessor;
use crate::smoother::{Decision, DecisionSmoother, Emit};
use crate::telemetry::{TelemetrySink, TickRecord};
use crate::window::{Push, RollingWindow};

/// What one chunk did to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    /// Window not filled yet.
    Pending,
    /// Inference failed; the previous level stands.
    Skipped,
    Classified(TickReport),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub decision: Decision,
    pub dispatched: Option<AlertLevel>,
    pub stale: bool,
    pub latency: Duration,
}

/// Buffer → features → classifier → smoother → dispatch, one tick per chunk.
pub struct DistressDetector<C, A> {
    window: RollingWindow,
    preprocessor: Preprocessor,
    classifier: C,
    smoother: DecisionSmoother,
    alerts: A,
    telemetry: Option<Box<dyn TelemetrySink>>,
    session: String,
    device: String,
    budget: Duration,
    tick_count: u64,
    skipped: u64,
}

impl<C: Classifier, A: AlertSink> DistressDetector<C, A> {
    pub fn new(config: &Config, classifier: C, alerts: A) -> Self {
        let session = uuid::Uuid::new_v4().to_string();
        let device = config
            .telemetry
            .device_id
            .clone()
            .unwrap_or_else(|| session[..8].to_string());

        Self {
            window: RollingWindow::new(&config.audio),
            preprocessor: Preprocessor::new(config.audio.sample_rate, &config.features),
            classifier,
            smoother: DecisionSmoother::new(&config.smoother, config.level_table()),
            alerts,
            telemetry: None,
            session,
            device,
            budget: config.audio.chunk_duration(),
            tick_count: 0,
            skipped: 0,
        }
    }

    pub fn with_telemetry(mut self, sink: Box<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn push(&mut self, chunk: AudioChunk) -> Tick {
        self.push_at(chunk, Instant::now())
    }

    /// Runs one full tick to completion.
    pub fn push_at(&mut self, chunk: AudioChunk, now: Instant) -> Tick {
        let started = Instant::now();

        // 1. Window update
        let (features, stale) = match self.window.push_at(chunk, now) {
            Push::Pending { .. } => return Tick::Pending,
            Push::Ready(window) => {
                if window.stale {
                    log::warn!("Classifying a stale window (audio arrived late)");
                }
                // 2. Features
                (self.preprocessor.extract(window.samples), window.stale)
            }
        };

        // 3. Inference
        let probs = match self.classifier.classify(&features) {
            Ok(probs) => probs,
            Err(err) => {
                self.skipped += 1;
                log::warn!("Skipping tick, inference failed: {}", err);
                return Tick::Skipped;
            }
        };

        // 4. Smoothing
        let decision = self.smoother.update(&probs);

        // 5. Dispatch
        let mut dispatched = None;
        if let Some(emit) = decision.emit {
            match emit {
                Emit::Edge => log::info!(
                    "Alert level -> {} ({} {:.2})",
                    decision.level,
                    self.label(decision.class),
                    decision.confidence
                ),
                Emit::Heartbeat => log::debug!("Re-asserting {}", decision.level),
            }
            self.alerts.send(decision.level);
            dispatched = Some(decision.level);
        }

        let latency = started.elapsed();
        if latency > self.budget {
            log::warn!(
                "Tick took {:.0} ms, over the {:.0} ms chunk budget",
                latency.as_secs_f32() * 1000.0,
                self.budget.as_secs_f32() * 1000.0
            );
        }

        self.tick_count += 1;
        if let Some(sink) = self.telemetry.as_mut() {
            let record = TickRecord {
                id: self.tick_count,
                session: self.session.clone(),
                device: self.device.clone(),
                timestamp: Utc::now(),
                label: self.classifier.labels().get(decision.class).cloned().unwrap_or_default(),
                confidence: decision.confidence,
                level: decision.level,
                dispatched,
                stale,
                latency_ms: latency.as_secs_f32() * 1000.0,
            };
            sink.record(&record);
        }

        Tick::Classified(TickReport {
            decision,
            dispatched,
            stale,
            latency,
        })
    }

    fn label(&self, class: usize) -> &str {
        self.classifier
            .labels()
            .get(class)
            .map(String::as_str)
            .unwrap_or("?")
    }

    pub fn level(&self) -> AlertLevel {
        self.smoother.level()
    }

    /// Classified ticks so far.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn alerts(&self) -> &A {
        &self.alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClassProbabilities;
    use crate::error::ClassifyError;
    use crate::preprocessing::FeatureTensor;
    use std::collections::VecDeque;

    /// Replays a fixed sequence of outcomes, one per call.
    struct Scripted {
        labels: Vec<String>,
        script: VecDeque<Option<Vec<f32>>>,
    }

    impl Scripted {
        fn new(script: Vec<Option<Vec<f32>>>) -> Self {
            Self {
                labels: vec!["neutral".into(), "fear".into(), "angry".into()],
                script: script.into(),
            }
        }
    }

    impl Classifier for Scripted {
        fn classify(&mut self, _: &FeatureTensor) -> Result<ClassProbabilities, ClassifyError> {
            match self.script.pop_front().flatten() {
                Some(p) => Ok(ClassProbabilities::from_scores(&p)),
                None => Err(ClassifyError::NonFinite),
            }
        }

        fn labels(&self) -> &[String] {
            &self.labels
        }
    }

    /// One second window so every chunk after the first produces a tick.
    fn config() -> Config {
        let mut config = Config::default();
        config.audio.window_ms = 1000;
        config
    }

    fn chunk() -> AudioChunk {
        AudioChunk::new(vec![0.01; Config::default().audio.chunk_size()])
    }

    const FEAR: [f32; 3] = [0.05, 0.9, 0.05];

    #[test]
    fn test_first_chunk_is_pending() {
        let mut detector = DistressDetector::new(&config(), Scripted::new(vec![]), Vec::new());
        assert_eq!(detector.push(chunk()), Tick::Pending);
        assert_eq!(detector.tick_count(), 0);
    }

    #[test]
    fn test_inference_error_keeps_level() {
        let mut config = config();
        config.smoother.debounce_ticks = 1;
        config.smoother.heartbeat_ticks = None;
        let script = vec![Some(FEAR.to_vec()), None, Some(FEAR.to_vec())];
        let mut detector = DistressDetector::new(&config, Scripted::new(script), Vec::new());

        let t0 = Instant::now();
        let step = Duration::from_millis(500);
        detector.push_at(chunk(), t0);
        assert!(matches!(detector.push_at(chunk(), t0 + step), Tick::Classified(_)));
        assert_eq!(detector.level(), AlertLevel::Danger);

        assert_eq!(detector.push_at(chunk(), t0 + step * 2), Tick::Skipped);
        assert_eq!(detector.level(), AlertLevel::Danger);
        assert_eq!(detector.skipped(), 1);

        // Same level again: no second dispatch
        detector.push_at(chunk(), t0 + step * 3);
        assert_eq!(detector.alerts(), &vec![AlertLevel::Danger]);
    }

    #[test]
    fn test_telemetry_rows() {
        let mut config = config();
        config.telemetry.device_id = Some("badge-7".into());
        let script = vec![Some(FEAR.to_vec()); 2];

        struct Shared(std::rc::Rc<std::cell::RefCell<Vec<TickRecord>>>);
        impl TelemetrySink for Shared {
            fn record(&mut self, record: &TickRecord) {
                self.0.borrow_mut().push(record.clone());
            }
        }
        let rows = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));

        let mut detector = DistressDetector::new(&config, Scripted::new(script), Vec::new())
            .with_telemetry(Box::new(Shared(rows.clone())));
        let t0 = Instant::now();
        for i in 0..3 {
            detector.push_at(chunk(), t0 + Duration::from_millis(500 * i));
        }

        let rows = rows.borrow();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, 1);
        assert_eq!(rows[1].id, 2);
        assert_eq!(rows[0].label, "fear");
        assert_eq!(rows[0].device, "badge-7");
        assert_eq!(rows[0].session, rows[1].session);
        assert!(rows.iter().all(|r| r.dispatched.is_none()));
    }

    #[test]
    fn test_late_chunk_flags_stale_tick() {
        let script = vec![Some(FEAR.to_vec()); 2];
        let mut detector = DistressDetector::new(&config(), Scripted::new(script), Vec::new());
        let t0 = Instant::now();
        detector.push_at(chunk(), t0);
        match detector.push_at(chunk(), t0 + Duration::from_millis(500)) {
            Tick::Classified(report) => assert!(!report.stale),
            other => panic!("unexpected {other:?}"),
        }
        match detector.push_at(chunk(), t0 + Duration::from_millis(1300)) {
            Tick::Classified(report) => assert!(report.stale),
            other => panic!("unexpected {other:?}"),
        }
    }
}
