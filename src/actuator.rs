use std::time::Duration;

use crate::alert::AlertLevel;

pub const FLASHES: usize = 3;
pub const FLASH_ON: Duration = Duration::from_millis(150);
pub const FLASH_OFF: Duration = Duration::from_millis(150);
pub const TONE_HZ: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Indicator {
    Safe,
    Caution,
    Danger,
}

pub trait Outputs {
    fn set(&mut self, indicator: Indicator, on: bool);

    /// `Some(hz)` starts the buzzer, `None` silences it.
    fn tone(&mut self, hz: Option<u32>);
}

pub trait Delay {
    fn delay(&mut self, duration: Duration);
}

pub struct ThreadDelay;

impl Delay for ThreadDelay {
    fn delay(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Prints output changes, standing in for real pins.
#[derive(Default)]
pub struct ConsolePanel;

impl Outputs for ConsolePanel {
    fn set(&mut self, indicator: Indicator, on: bool) {
        log::info!("{:?} indicator {}", indicator, if on { "ON" } else { "off" });
    }

    fn tone(&mut self, hz: Option<u32>) {
        match hz {
            Some(hz) => log::info!("Buzzer {} Hz", hz),
            None => log::debug!("Buzzer off"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Unparseable payload, state untouched.
    Ignored,
    /// Same state as before, nothing played.
    Unchanged,
    Changed(AlertLevel),
}

/// Badge state machine. Patterns block, so a command arriving mid-pattern
/// waits for it to finish. There is no timeout back to SAFE.
pub struct Actuator {
    state: AlertLevel,
}

impl Actuator {
    /// Power-on: SAFE with the steady indicator lit.
    pub fn boot(outputs: &mut impl Outputs) -> Self {
        let actuator = Self {
            state: AlertLevel::Safe,
        };
        play(AlertLevel::Safe, outputs, &mut NoDelay);
        actuator
    }

    pub fn state(&self) -> AlertLevel {
        self.state
    }

    /// Handle one message payload, playing the new state's pattern to completion.
    pub fn receive(
        &mut self,
        payload: &[u8],
        outputs: &mut impl Outputs,
        delay: &mut impl Delay,
    ) -> Reaction {
        match AlertLevel::decode(payload) {
            Ok(level) => self.apply(level, outputs, delay),
            Err(err) => {
                log::warn!("Ignoring payload {:?}: {}", payload, err);
                Reaction::Ignored
            }
        }
    }

    pub fn apply(
        &mut self,
        level: AlertLevel,
        outputs: &mut impl Outputs,
        delay: &mut impl Delay,
    ) -> Reaction {
        if level == self.state {
            return Reaction::Unchanged;
        }
        log::info!("{} -> {}", self.state, level);
        self.state = level;
        play(level, outputs, delay);
        Reaction::Changed(level)
    }

    /// Back to the boot default after the broker session is re-established.
    pub fn on_reconnect(&mut self, outputs: &mut impl Outputs, delay: &mut impl Delay) -> Reaction {
        self.apply(AlertLevel::Safe, outputs, delay)
    }
}

struct NoDelay;

impl Delay for NoDelay {
    fn delay(&mut self, _: Duration) {}
}

/// Drive the fixed output pattern for `level`. Blocks for its full length.
pub fn play(level: AlertLevel, outputs: &mut impl Outputs, delay: &mut impl Delay) {
    outputs.tone(None);
    let flashing = match level {
        AlertLevel::Safe => {
            outputs.set(Indicator::Caution, false);
            outputs.set(Indicator::Danger, false);
            outputs.set(Indicator::Safe, true);
            return;
        }
        AlertLevel::Caution => Indicator::Caution,
        AlertLevel::Danger => Indicator::Danger,
    };

    for indicator in [Indicator::Safe, Indicator::Caution, Indicator::Danger] {
        outputs.set(indicator, false);
    }
    for _ in 0..FLASHES {
        outputs.set(flashing, true);
        outputs.tone(Some(TONE_HZ));
        delay.delay(FLASH_ON);
        outputs.set(flashing, false);
        outputs.tone(None);
        delay.delay(FLASH_OFF);
    }
}

/// Total blocking time of a pattern.
pub fn pattern_duration(level: AlertLevel) -> Duration {
    match level {
        AlertLevel::Safe => Duration::ZERO,
        AlertLevel::Caution | AlertLevel::Danger => (FLASH_ON + FLASH_OFF) * FLASHES as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Out {
        On(Indicator),
        Off(Indicator),
        Tone(u32),
        Quiet,
        Wait(u64),
    }

    type Timeline = Rc<RefCell<Vec<Out>>>;

    /// Pins plus a timeline shared with [`Clock`], so delays interleave with output changes.
    #[derive(Default)]
    struct Panel {
        timeline: Timeline,
        pins: HashMap<Indicator, bool>,
    }

    impl Panel {
        fn lit(&self) -> Vec<Indicator> {
            [Indicator::Safe, Indicator::Caution, Indicator::Danger]
                .into_iter()
                .filter(|i| self.pins.get(i).copied().unwrap_or(false))
                .collect()
        }

        fn clock(&self) -> Clock {
            Clock(self.timeline.clone())
        }

        /// Everything recorded since the last call.
        fn drain(&self) -> Vec<Out> {
            std::mem::take(&mut *self.timeline.borrow_mut())
        }
    }

    impl Outputs for Panel {
        fn set(&mut self, indicator: Indicator, on: bool) {
            self.pins.insert(indicator, on);
            self.timeline
                .borrow_mut()
                .push(if on { Out::On(indicator) } else { Out::Off(indicator) });
        }

        fn tone(&mut self, hz: Option<u32>) {
            self.timeline.borrow_mut().push(hz.map_or(Out::Quiet, Out::Tone));
        }
    }

    struct Clock(Timeline);

    impl Delay for Clock {
        fn delay(&mut self, duration: Duration) {
            self.0.borrow_mut().push(Out::Wait(duration.as_millis() as u64));
        }
    }

    fn booted() -> (Actuator, Panel) {
        let mut panel = Panel::default();
        let actuator = Actuator::boot(&mut panel);
        panel.drain();
        (actuator, panel)
    }

    /// Feed one payload, returning the reaction and the outputs it produced.
    fn feed(actuator: &mut Actuator, panel: &mut Panel, payload: &[u8]) -> (Reaction, Vec<Out>) {
        let mut clock = panel.clock();
        let reaction = actuator.receive(payload, panel, &mut clock);
        (reaction, panel.drain())
    }

    fn count(out: &[Out], what: Out) -> usize {
        out.iter().filter(|o| **o == what).count()
    }

    fn waited(out: &[Out]) -> Duration {
        out.iter()
            .map(|o| match o {
                Out::Wait(ms) => Duration::from_millis(*ms),
                _ => Duration::ZERO,
            })
            .sum()
    }

    #[test]
    fn test_boots_safe() {
        let mut panel = Panel::default();
        let actuator = Actuator::boot(&mut panel);
        assert_eq!(actuator.state(), AlertLevel::Safe);
        assert_eq!(panel.lit(), vec![Indicator::Safe]);
        let out = panel.drain();
        assert_eq!(count(&out, Out::Tone(TONE_HZ)), 0);
        assert_eq!(waited(&out), Duration::ZERO);
    }

    #[test]
    fn test_safe_danger_safe_sequence() {
        let (mut actuator, mut panel) = booted();

        let (reaction, _) = feed(&mut actuator, &mut panel, b"S");
        assert_eq!(reaction, Reaction::Unchanged);
        assert_eq!(panel.lit(), vec![Indicator::Safe]);

        let (reaction, danger) = feed(&mut actuator, &mut panel, b"D");
        assert_eq!(reaction, Reaction::Changed(AlertLevel::Danger));
        assert_eq!(count(&danger, Out::On(Indicator::Danger)), 3);
        assert_eq!(count(&danger, Out::On(Indicator::Caution)), 0);
        assert_eq!(count(&danger, Out::Tone(TONE_HZ)), 3);
        assert_eq!(waited(&danger), Duration::from_millis(900));

        // Tone only sounds while the indicator is on
        let flash = &danger[danger.len() - 6..];
        assert_eq!(
            flash,
            &[
                Out::On(Indicator::Danger),
                Out::Tone(TONE_HZ),
                Out::Wait(150),
                Out::Off(Indicator::Danger),
                Out::Quiet,
                Out::Wait(150),
            ]
        );

        // Pattern ends dark; state stays DANGER
        assert!(panel.lit().is_empty());
        assert_eq!(actuator.state(), AlertLevel::Danger);

        let (reaction, safe) = feed(&mut actuator, &mut panel, b"S");
        assert_eq!(reaction, Reaction::Changed(AlertLevel::Safe));
        assert_eq!(panel.lit(), vec![Indicator::Safe]);
        assert_eq!(waited(&safe), Duration::ZERO);
    }

    #[test]
    fn test_duplicate_command_is_noop() {
        let (mut actuator, mut panel) = booted();

        let (first, played) = feed(&mut actuator, &mut panel, b"D");
        let (second, replay) = feed(&mut actuator, &mut panel, b"D");
        assert_eq!(first, Reaction::Changed(AlertLevel::Danger));
        assert_eq!(count(&played, Out::On(Indicator::Danger)), 3);
        assert_eq!(second, Reaction::Unchanged);
        assert!(replay.is_empty());
    }

    #[test]
    fn test_caution_differs_only_by_indicator() {
        let (mut actuator, mut panel) = booted();
        let (_, caution) = feed(&mut actuator, &mut panel, b"C");
        let (_, danger) = feed(&mut actuator, &mut panel, b"D");

        assert_eq!(count(&caution, Out::On(Indicator::Caution)), 3);
        assert_eq!(waited(&caution), waited(&danger));

        let swap = |o: &Out| match *o {
            Out::On(Indicator::Caution) => Out::On(Indicator::Danger),
            Out::Off(Indicator::Caution) => Out::Off(Indicator::Danger),
            other => other,
        };
        let flashes = |out: &[Out]| out.iter().skip_while(|o| !matches!(o, Out::On(_))).copied().collect::<Vec<_>>();
        let caution_as_danger: Vec<Out> = flashes(&caution).iter().map(swap).collect();
        assert_eq!(caution_as_danger, flashes(&danger));
    }

    #[test]
    fn test_garbage_is_ignored() {
        let (mut actuator, mut panel) = booted();
        feed(&mut actuator, &mut panel, b"C");

        for payload in [&b"X"[..], b"", b"SD", b"c", b"\n"] {
            let (reaction, out) = feed(&mut actuator, &mut panel, payload);
            assert_eq!(reaction, Reaction::Ignored);
            assert!(out.is_empty());
        }
        assert_eq!(actuator.state(), AlertLevel::Caution);
    }

    #[test]
    fn test_reconnect_returns_to_safe() {
        let (mut actuator, mut panel) = booted();
        feed(&mut actuator, &mut panel, b"D");

        let mut clock = panel.clock();
        let reaction = actuator.on_reconnect(&mut panel, &mut clock);
        assert_eq!(reaction, Reaction::Changed(AlertLevel::Safe));
        assert_eq!(panel.lit(), vec![Indicator::Safe]);

        let mut clock = panel.clock();
        assert_eq!(actuator.on_reconnect(&mut panel, &mut clock), Reaction::Unchanged);
    }

    #[test]
    fn test_pattern_duration() {
        assert_eq!(pattern_duration(AlertLevel::Danger), Duration::from_millis(900));
        assert_eq!(pattern_duration(AlertLevel::Safe), Duration::ZERO);
    }
}
