use std::collections::VecDeque;

use crate::alert::AlertLevel;
use crate::classifier::ClassProbabilities;
use crate::config::SmootherConfig;

/// Why a level should go out on the wire this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emit {
    /// The accepted level changed.
    Edge,
    /// Periodic re-assertion of an unchanged level.
    Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub level: AlertLevel,
    pub emit: Option<Emit>,
    /// Arg-max class and probability for this tick.
    pub class: usize,
    pub confidence: f32,
}

/// Debounced class → alert level state machine.
///
/// Each tick contributes one history entry: the arg-max class when its
/// probability clears the threshold, otherwise nothing. A level is adopted
/// only once the last `debounce` entries all name the same class.
pub struct DecisionSmoother {
    levels: Vec<AlertLevel>,
    threshold: f32,
    debounce: usize,
    heartbeat: Option<u32>,
    history: VecDeque<Option<usize>>,
    level: AlertLevel,
    since_emit: u32,
}

impl DecisionSmoother {
    /// `levels[i]` is the alert level for class `i`.
    pub fn new(config: &SmootherConfig, levels: Vec<AlertLevel>) -> Self {
        let debounce = config.debounce_ticks.max(1);
        Self {
            levels,
            threshold: config.threshold,
            debounce,
            heartbeat: config.heartbeat_ticks.filter(|&n| n > 0),
            history: VecDeque::with_capacity(debounce),
            level: AlertLevel::Safe,
            since_emit: 0,
        }
    }

    pub fn update(&mut self, probs: &ClassProbabilities) -> Decision {
        let (class, confidence) = probs.argmax().unwrap_or((0, 0.0));

        if self.history.len() >= self.debounce {
            self.history.pop_front();
        }
        self.history
            .push_back((confidence > self.threshold).then_some(class));

        let previous = self.level;
        self.level = self.accepted().unwrap_or(previous);

        let emit = if self.level != previous {
            Some(Emit::Edge)
        } else if self.heartbeat.is_some_and(|n| self.since_emit + 1 >= n) {
            Some(Emit::Heartbeat)
        } else {
            None
        };

        if emit.is_some() {
            self.since_emit = 0;
        } else {
            self.since_emit += 1;
        }

        Decision {
            level: self.level,
            emit,
            class,
            confidence,
        }
    }

    /// Level agreed on by a full, unanimous, confident history.
    fn accepted(&self) -> Option<AlertLevel> {
        if self.history.len() < self.debounce {
            return None;
        }
        let first = (*self.history.front()?)?;
        self.history
            .iter()
            .all(|entry| *entry == Some(first))
            .then(|| self.levels.get(first).copied().unwrap_or_default())
    }

    pub fn level(&self) -> AlertLevel {
        self.level
    }
}
