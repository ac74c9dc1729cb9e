//! The seam between the producer and the MQTT client
//!
//! The producer never awaits anything. It tells a [`MqttTransport`] what to
//! do and learns about the outcome through [`MqttEvent`]s fed back by the
//! owner of the tree. Timers go through the same seam so the whole state
//! machine can be driven step by step in tests.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::Credentials;
use crate::error::{MqttError, Result};

/// Named one-shot timers of the producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    Reconnect,
    KeepAlive,
    ReadyFallback,
    Heartbeat,
    FailedCooldown,
}

/// What the client reports back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttEvent {
    /// The WebSocket below MQTT is open
    TransportConnected,
    /// The broker accepted the session
    Connected,
    Disconnected { reason: String },
    Message { topic: String, payload: Vec<u8> },
    Timer(Timer),
}

pub trait MqttTransport: Send {
    /// Start a new session; completion is reported as [`MqttEvent::Connected`]
    fn connect(&mut self, credentials: Option<Credentials>) -> Result<()>;
    fn disconnect(&mut self);
    fn subscribe(&mut self, topic: &str) -> Result<()>;
    fn unsubscribe(&mut self, topic: &str) -> Result<()>;
    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()>;
    /// (Re)arm a timer; it fires once as [`MqttEvent::Timer`]
    fn start_timer(&mut self, timer: Timer, after: Duration);
    fn stop_timer(&mut self, timer: Timer);
}

/// Work for the client task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Connect { credentials: Option<Credentials> },
    Disconnect,
    Subscribe(String),
    Unsubscribe(String),
    Publish { topic: String, payload: Vec<u8> },
    StartTimer(Timer, Duration),
    StopTimer(Timer),
}

/// Transport that queues commands for the client task
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    commands: mpsc::UnboundedSender<TransportCommand>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportCommand>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        (Self { commands }, receiver)
    }

    fn send(&self, command: TransportCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| MqttError::TransportClosed)
    }
}

impl MqttTransport for ChannelTransport {
    fn connect(&mut self, credentials: Option<Credentials>) -> Result<()> {
        self.send(TransportCommand::Connect { credentials })
    }

    fn disconnect(&mut self) {
        let _ = self.send(TransportCommand::Disconnect);
    }

    fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.send(TransportCommand::Subscribe(topic.to_string()))
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        self.send(TransportCommand::Unsubscribe(topic.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.send(TransportCommand::Publish {
            topic: topic.to_string(),
            payload,
        })
    }

    fn start_timer(&mut self, timer: Timer, after: Duration) {
        let _ = self.send(TransportCommand::StartTimer(timer, after));
    }

    fn stop_timer(&mut self, timer: Timer) {
        let _ = self.send(TransportCommand::StopTimer(timer));
    }
}
