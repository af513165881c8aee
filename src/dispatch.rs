use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::alert::AlertLevel;
use crate::config::DispatchConfig;
use crate::error::{DispatchError, LinkError};
use crate::link::{Backoff, Link};

/// Where accepted alert levels go.
pub trait AlertSink {
    fn send(&mut self, level: AlertLevel);
}

/// Logs alerts instead of publishing them (`--dry-run`).
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn send(&mut self, level: AlertLevel) {
        log::info!("Alert {} ('{}') not published (dry run)", level, level.command() as char);
    }
}

impl AlertSink for Vec<AlertLevel> {
    fn send(&mut self, level: AlertLevel) {
        self.push(level);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    Disconnected,
    Connected,
}

impl Connection {
    pub fn on_connect(self, result: &Result<(), LinkError>) -> Self {
        if result.is_ok() {
            Connection::Connected
        } else {
            Connection::Disconnected
        }
    }

    pub fn on_publish(self, result: &Result<(), LinkError>) -> Self {
        match (self, result) {
            (Connection::Connected, Ok(())) => Connection::Connected,
            _ => Connection::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub level: AlertLevel,
    /// Connect or publish attempts spent, 1 when the session was already up.
    pub attempts: u32,
}

/// Interruptible wait between reconnect attempts.
pub trait Pause {
    /// Returns `true` when the wait was cut short by a newer request.
    fn pause(&self, duration: Duration) -> bool;
}

pub struct Sleep;

impl Pause for Sleep {
    fn pause(&self, duration: Duration) -> bool {
        thread::sleep(duration);
        false
    }
}

pub struct Dispatcher<L> {
    link: L,
    state: Connection,
    backoff: Backoff,
    budget: Duration,
}

impl<L: Link> Dispatcher<L> {
    pub fn new(link: L, config: &DispatchConfig) -> Self {
        Self::with_policy(link, Backoff::from_config(config), config.reconnect_budget())
    }

    pub fn with_policy(link: L, backoff: Backoff, budget: Duration) -> Self {
        Self {
            link,
            state: Connection::Disconnected,
            backoff,
            budget,
        }
    }

    pub fn state(&self) -> Connection {
        self.state
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn dispatch(&mut self, level: AlertLevel) -> Result<Ack, DispatchError> {
        self.dispatch_with(level, &Sleep)
    }

    /// Publish one command byte, reconnecting with backoff if needed.
    /// Connect attempts and backoff waits together never outlast the reconnect budget.
    pub fn dispatch_with(&mut self, level: AlertLevel, pause: &impl Pause) -> Result<Ack, DispatchError> {
        let deadline = Instant::now() + self.budget;
        let payload = [level.command()];
        let mut attempts = 0u32;

        loop {
            if self.state == Connection::Disconnected {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(DispatchError::Unreachable { attempts });
                }
                attempts += 1;
                let result = self.link.connect(remaining);
                if let Err(err) = &result {
                    log::warn!("Broker connect attempt {} failed: {}", attempts, err);
                }
                self.state = self.state.on_connect(&result);
            } else {
                attempts += 1;
            }

            if self.state == Connection::Connected {
                let result = self.link.publish(&payload);
                self.state = self.state.on_publish(&result);
                match result {
                    Ok(()) => {
                        log::debug!("Published '{}' ({})", payload[0] as char, level);
                        return Ok(Ack { level, attempts });
                    }
                    Err(err) => {
                        log::warn!("Publish of {} failed: {}", level, err);
                        self.link.disconnect();
                    }
                }
            }

            let delay = self.backoff.delay(attempts - 1);
            if Instant::now() + delay >= deadline {
                return Err(DispatchError::Unreachable { attempts });
            }
            if pause.pause(delay) {
                return Err(DispatchError::Superseded);
            }
        }
    }
}

/// Single-slot, overwrite-on-post hand-off between two threads.
pub struct Mailbox<T> {
    slot: Mutex<Slot<T>>,
    signal: Condvar,
}

struct Slot<T> {
    value: Option<T>,
    closed: bool,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                closed: false,
            }),
            signal: Condvar::new(),
        }
    }

    /// Store `value`, replacing anything not yet taken. Returns the replaced value.
    pub fn post(&self, value: T) -> Option<T> {
        let replaced = self.slot.lock().value.replace(value);
        self.signal.notify_one();
        replaced
    }

    /// Block until a value is available. `None` once closed and drained.
    pub fn take(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.value.take() {
                return Some(value);
            }
            if slot.closed {
                return None;
            }
            self.signal.wait(&mut slot);
        }
    }

    pub fn try_take(&self) -> Option<T> {
        self.slot.lock().value.take()
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().value.is_some()
    }

    pub fn close(&self) {
        self.slot.lock().closed = true;
        self.signal.notify_all();
    }
}

impl<T> Pause for Mailbox<T> {
    fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut slot = self.slot.lock();
        while slot.value.is_none() && !slot.closed {
            if self.signal.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.value.is_some() || slot.closed
    }
}

/// Runs a [`Dispatcher`] on a background thread fed by a [`Mailbox`].
pub struct DispatchWorker {
    mailbox: Arc<Mailbox<AlertLevel>>,
    handle: Option<JoinHandle<()>>,
}

impl DispatchWorker {
    pub fn spawn<L: Link + Send + 'static>(mut dispatcher: Dispatcher<L>) -> std::io::Result<Self> {
        let mailbox = Arc::new(Mailbox::new());
        let inbox = mailbox.clone();

        let handle = thread::Builder::new()
            .name("alert-dispatch".into())
            .spawn(move || {
                while let Some(level) = inbox.take() {
                    match dispatcher.dispatch_with(level, inbox.as_ref()) {
                        Ok(ack) if ack.attempts > 1 => {
                            log::info!("Delivered {} after {} attempts", level, ack.attempts)
                        }
                        Ok(_) => {}
                        Err(DispatchError::Superseded) => {
                            log::debug!("{} superseded before delivery", level)
                        }
                        Err(err) => log::warn!("Dropped {}: {}", level, err),
                    }
                }
                dispatcher.link.disconnect();
            })?;

        Ok(Self {
            mailbox,
            handle: Some(handle),
        })
    }

    /// Never blocks. An undelivered older level is overwritten.
    pub fn post(&self, level: AlertLevel) {
        if let Some(old) = self.mailbox.post(level) {
            log::debug!("{} replaced undelivered {}", level, old);
        }
    }
}

impl AlertSink for DispatchWorker {
    fn send(&mut self, level: AlertLevel) {
        self.post(level);
    }
}

impl Drop for DispatchWorker {
    fn drop(&mut self) {
        self.mailbox.close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
