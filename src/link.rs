use rumqttc::{Client, Connection, Event, MqttOptions, Packet, QoS};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::DispatchConfig;
use crate::error::LinkError;

/// Requests rumqttc may buffer between the client handle and its event loop.
const REQUEST_CAPACITY: usize = 10;

/// Publishing side of the transport.
pub trait Link {
    /// Give up once `timeout` has passed without the broker accepting the session.
    fn connect(&mut self, timeout: Duration) -> Result<(), LinkError>;

    /// Fire-and-forget; returns once the message is handed to the transport.
    fn publish(&mut self, payload: &[u8]) -> Result<(), LinkError>;

    fn disconnect(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Up,
    Down(String),
    Message(Vec<u8>),
}

/// Exponential reconnect delay with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_initial_ms),
            Duration::from_millis(config.backoff_max_ms),
        )
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Broker address and session settings shared by publisher and subscriber.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_prefix: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

impl Endpoint {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            host: config.broker_host.clone(),
            port: config.broker_port,
            topic: config.topic.clone(),
            client_prefix: config.client_prefix.clone(),
            keep_alive: config.keep_alive(),
            connect_timeout: config.connect_timeout(),
        }
    }

    /// A fresh client id per connection, so the broker never resumes a ghost session.
    fn options(&self) -> MqttOptions {
        let id = format!("{}-{}", self.client_prefix, uuid::Uuid::new_v4().simple());
        let mut options = MqttOptions::new(id, self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options
    }
}

/// One live broker connection. The event loop runs on its own thread and
/// exits on the first error; reconnecting means opening a new session.
struct Session {
    client: Client,
    events: Receiver<LinkEvent>,
    _driver: JoinHandle<()>,
}

impl Session {
    fn open(endpoint: &Endpoint, timeout: Duration) -> Result<Self, LinkError> {
        let (client, connection) = Client::new(endpoint.options(), REQUEST_CAPACITY);
        let (sender, events) = mpsc::channel();
        let driver = thread::Builder::new()
            .name("mqtt-link".into())
            .spawn(move || drive(connection, sender))
            .map_err(|e| LinkError::Lost(e.to_string()))?;

        let session = Self {
            client,
            events,
            _driver: driver,
        };

        let timeout = timeout.min(endpoint.connect_timeout);
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match session.events.recv_timeout(remaining) {
                Ok(LinkEvent::Up) => return Ok(session),
                Ok(LinkEvent::Down(reason)) => return Err(LinkError::Lost(reason)),
                Ok(LinkEvent::Message(_)) => continue,
                Err(RecvTimeoutError::Timeout) => {
                    session.close();
                    return Err(LinkError::ConnectTimeout(timeout));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(LinkError::Lost("event loop exited".into()))
                }
            }
        }
    }

    /// First pending `Down`, if the event loop has reported one.
    fn take_down(&self) -> Option<String> {
        loop {
            match self.events.try_recv() {
                Ok(LinkEvent::Down(reason)) => return Some(reason),
                Ok(_) => continue,
                Err(mpsc::TryRecvError::Empty) => return None,
                Err(mpsc::TryRecvError::Disconnected) => return Some("event loop exited".into()),
            }
        }
    }

    fn close(self) {
        let _ = self.client.try_disconnect();
    }
}

fn drive(mut connection: Connection, events: Sender<LinkEvent>) {
    for notification in connection.iter() {
        let event = match notification {
            Ok(Event::Incoming(Packet::ConnAck(_))) => LinkEvent::Up,
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                LinkEvent::Message(publish.payload.to_vec())
            }
            Ok(_) => continue,
            Err(err) => {
                let _ = events.send(LinkEvent::Down(err.to_string()));
                break;
            }
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

/// Publishing link used by the dispatcher. QoS 0, no retain.
pub struct MqttLink {
    endpoint: Endpoint,
    session: Option<Session>,
}

impl MqttLink {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            session: None,
        }
    }
}

impl Link for MqttLink {
    fn connect(&mut self, timeout: Duration) -> Result<(), LinkError> {
        self.disconnect();
        self.session = Some(Session::open(&self.endpoint, timeout)?);
        log::info!(
            "Connected to {}:{} (topic {})",
            self.endpoint.host,
            self.endpoint.port,
            self.endpoint.topic
        );
        Ok(())
    }

    fn publish(&mut self, payload: &[u8]) -> Result<(), LinkError> {
        let session = self.session.as_ref().ok_or(LinkError::NotConnected)?;

        if let Some(reason) = session.take_down() {
            self.session = None;
            return Err(LinkError::Lost(reason));
        }

        session
            .client
            .try_publish(self.endpoint.topic.as_str(), QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|e| LinkError::Publish(e.to_string()))
    }

    fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
    }
}

/// Subscribing side, used by the remote actuator.
pub struct MqttSubscriber {
    endpoint: Endpoint,
    session: Option<Session>,
}

impl MqttSubscriber {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            session: None,
        }
    }

    pub fn connect(&mut self) -> Result<(), LinkError> {
        if let Some(session) = self.session.take() {
            session.close();
        }
        let session = Session::open(&self.endpoint, self.endpoint.connect_timeout)?;
        session
            .client
            .try_subscribe(self.endpoint.topic.as_str(), QoS::AtMostOnce)
            .map_err(|e| LinkError::Lost(e.to_string()))?;
        self.session = Some(session);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Wait up to `timeout` for the next event. `None` on timeout or when
    /// not connected.
    pub fn poll(&mut self, timeout: Duration) -> Option<LinkEvent> {
        let session = self.session.as_ref()?;
        match session.events.recv_timeout(timeout) {
            Ok(LinkEvent::Down(reason)) => {
                self.session = None;
                Some(LinkEvent::Down(reason))
            }
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.session = None;
                Some(LinkEvent::Down("event loop exited".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        let delays: Vec<u64> = (0..6).map(|n| backoff.delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_client_ids_are_unique() {
        let endpoint = Endpoint::from_config(&DispatchConfig::default());
        let a = endpoint.options();
        let b = endpoint.options();
        assert_ne!(a.client_id(), b.client_id());
        assert!(a.client_id().starts_with("distress-relay-"));
    }
}
