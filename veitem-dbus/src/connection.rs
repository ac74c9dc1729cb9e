//! Outbound side of the bus

use tokio::sync::mpsc;
use tracing::trace;

use crate::error::DbusError;
use crate::message::{MethodCall, Serial, Signal};

/// What a producer or exporter needs from the bus
///
/// Implementations only enqueue; replies come back as
/// [`BusEvent`](crate::BusEvent)s.
pub trait BusConnection: Send {
    /// Send a method call, returning the serial its reply will carry
    fn call(&mut self, call: MethodCall) -> Result<Serial, DbusError>;

    /// Emit a signal from the given bus name
    fn emit(&mut self, sender: &str, signal: Signal) -> Result<(), DbusError>;

    fn request_name(&mut self, name: &str) -> Result<(), DbusError>;

    fn release_name(&mut self, name: &str) -> Result<(), DbusError>;
}

/// A message waiting to be put on the bus
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Call { serial: Serial, call: MethodCall },
    Signal { sender: String, signal: Signal },
    RequestName(String),
    ReleaseName(String),
}

/// [`BusConnection`] that hands messages to a channel
///
/// The receiving end is drained by the task owning the real bus binding.
#[derive(Debug)]
pub struct ChannelConnection {
    tx: mpsc::UnboundedSender<Outbound>,
    next_serial: Serial,
}

impl ChannelConnection {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, next_serial: 1 }, rx)
    }

    fn send(&self, message: Outbound) -> Result<(), DbusError> {
        trace!("outbound {:?}", message);
        self.tx
            .send(message)
            .map_err(|_| DbusError::Send("bus channel closed".to_string()))
    }
}

impl BusConnection for ChannelConnection {
    fn call(&mut self, call: MethodCall) -> Result<Serial, DbusError> {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1).max(1);
        self.send(Outbound::Call { serial, call })?;
        Ok(serial)
    }

    fn emit(&mut self, sender: &str, signal: Signal) -> Result<(), DbusError> {
        self.send(Outbound::Signal {
            sender: sender.to_string(),
            signal,
        })
    }

    fn request_name(&mut self, name: &str) -> Result<(), DbusError> {
        self.send(Outbound::RequestName(name.to_string()))
            .map_err(|_| DbusError::NameRequest(name.to_string()))
    }

    fn release_name(&mut self, name: &str) -> Result<(), DbusError> {
        self.send(Outbound::ReleaseName(name.to_string()))
    }
}
