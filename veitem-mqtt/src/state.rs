//! Connection and heartbeat state
//!
//! The connection state only moves along the edges listed in
//! [`is_transition_allowed`]. Transport callbacks arrive asynchronously, so a
//! late `Connected` after the producer was closed, or a second `Disconnected`
//! for the same drop, must not move the state machine.
//!
//! ```text
//! Idle ─▶ WaitingToConnect ─▶ [TransportConnecting ─▶ TransportConnected] ─▶ Connecting
//!                                                                              │
//!   Ready ◀─ Initializing ◀─ Identified ◀─ Connected ◀──────────────────────────┘
//!                                              ▲
//! Disconnected ─▶ WaitingToReconnect ─▶ [TransportReconnecting ─▶ TransportReconnected] ─▶ Reconnecting
//!      │
//!      └─▶ Failed ─(cooldown)─▶ WaitingToConnect
//! ```
//!
//! The `Transport*` states are only used when MQTT runs over a WebSocket.

/// Connection state of an MQTT producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    WaitingToConnect,
    TransportConnecting,
    TransportConnected,
    Connecting,
    Connected,
    /// The portal id is known
    Identified,
    /// Waiting for the broker to finish republishing everything
    Initializing,
    Ready,
    Disconnected,
    WaitingToReconnect,
    TransportReconnecting,
    TransportReconnected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Whether the MQTT session is up
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::Identified
                | ConnectionState::Initializing
                | ConnectionState::Ready
        )
    }
}

/// The allow-list of state transitions
pub fn is_transition_allowed(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;

    match (from, to) {
        (from, to) if from == to => false,
        // close() is valid from anywhere
        (_, Idle) => true,
        (Idle | Disconnected | Failed, Disconnected) => false,
        (_, Disconnected) => true,
        (Idle, WaitingToConnect) | (Failed, WaitingToConnect) => true,
        (WaitingToConnect, TransportConnecting) | (WaitingToConnect, Connecting) => true,
        (TransportConnecting, TransportConnected) | (TransportConnected, Connecting) => true,
        (Connecting, Connected) | (Reconnecting, Connected) => true,
        (Connected, Identified) | (Identified, Initializing) | (Initializing, Ready) => true,
        (Disconnected, WaitingToReconnect) | (Disconnected, Failed) => true,
        (WaitingToReconnect, TransportReconnecting) | (WaitingToReconnect, Reconnecting) => true,
        (TransportReconnecting, TransportReconnected) | (TransportReconnected, Reconnecting) => true,
        _ => false,
    }
}

/// Liveness of the device behind the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatState {
    Active,
    /// Two heartbeats in a row did not arrive
    Missing,
    #[default]
    Inactive,
}

/// Counts heartbeat intervals without a heartbeat
#[derive(Debug, Default)]
pub struct HeartbeatTracker {
    missed: u32,
    state: HeartbeatState,
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> HeartbeatState {
        self.state
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// A heartbeat arrived
    pub fn beat(&mut self) -> HeartbeatState {
        self.missed = 0;
        self.state = HeartbeatState::Active;
        self.state
    }

    /// An interval passed; returns the new state
    pub fn tick(&mut self) -> HeartbeatState {
        self.missed = self.missed.saturating_add(1);
        self.state = match self.missed {
            0 | 1 => self.state,
            2 => HeartbeatState::Missing,
            _ => HeartbeatState::Inactive,
        };
        self.state
    }

    /// Start counting afresh, assuming the device is alive
    pub fn reset(&mut self) {
        self.missed = 0;
        self.state = HeartbeatState::Active;
    }
}
