//! Configuration for the MQTT producer and its client task

use std::time::Duration;

use crate::backoff::{default_delays, ReconnectBackoff};

/// Username and password for the broker
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How the client reaches the broker
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Tcp,
    /// MQTT tunnelled through a WebSocket, e.g. `ws://venus.local:9001/websocket-mqtt`
    WebSocket { url: String },
}

impl TransportKind {
    pub fn is_websocket(&self) -> bool {
        matches!(self, TransportKind::WebSocket { .. })
    }
}

/// Configuration for an MQTT producer
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker host
    /// Default: "localhost"
    pub host: String,

    /// Default: 1883
    pub port: u16,

    /// Default: "veitem-" followed by a random suffix
    pub client_id: String,

    pub credentials: Option<Credentials>,

    pub transport: TransportKind,

    /// Park before every connect until credentials are supplied
    /// Default: false
    pub wait_for_credentials: bool,

    /// Interval of the republish-suppressing keepalive
    /// Default: 30 seconds
    pub keepalive_interval: Duration,

    /// Time to wait for `full_publish_completed` before assuming `Ready`
    /// Default: 5 seconds
    pub ready_fallback: Duration,

    /// Interval at which missing heartbeats are counted
    /// Default: 5 seconds
    pub heartbeat_interval: Duration,

    /// Delay before each reconnect attempt
    /// Default: 250ms, 1s, 2s, 5s, 10s, 30s
    pub reconnect_delays: Vec<Duration>,

    /// Default: 6
    pub max_reconnect_attempts: u32,

    /// Upper bound of the random delay added to each reconnect delay
    /// Default: 500ms
    pub reconnect_jitter: Duration,

    /// Time spent in `Failed` before connecting again
    /// Default: 60 seconds
    pub failed_cooldown: Duration,

    /// MQTT protocol keep alive
    /// Default: 60 seconds
    pub mqtt_keep_alive: Duration,

    /// Capacity of the client's request queue
    /// Default: 100
    pub channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: format!("veitem-{:08x}", rand::random::<u32>()),
            credentials: None,
            transport: TransportKind::Tcp,
            wait_for_credentials: false,
            keepalive_interval: Duration::from_secs(30),
            ready_fallback: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            reconnect_delays: default_delays(),
            max_reconnect_attempts: 6,
            reconnect_jitter: Duration::from_millis(500),
            failed_cooldown: Duration::from_secs(60),
            mqtt_keep_alive: Duration::from_secs(60),
            channel_capacity: 100,
        }
    }
}

impl MqttConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Configuration for MQTT over a WebSocket
    pub fn websocket(url: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::WebSocket { url: url.into() },
            ..Default::default()
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    pub fn with_wait_for_credentials(mut self, enabled: bool) -> Self {
        self.wait_for_credentials = enabled;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_ready_fallback(mut self, timeout: Duration) -> Self {
        self.ready_fallback = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reconnect(mut self, delays: Vec<Duration>, max_attempts: u32, jitter: Duration) -> Self {
        self.reconnect_delays = delays;
        self.max_reconnect_attempts = max_attempts;
        self.reconnect_jitter = jitter;
        self
    }

    pub fn with_failed_cooldown(mut self, cooldown: Duration) -> Self {
        self.failed_cooldown = cooldown;
        self
    }

    pub fn backoff(&self) -> ReconnectBackoff {
        ReconnectBackoff::new(
            self.reconnect_delays.clone(),
            self.reconnect_jitter,
            self.max_reconnect_attempts,
        )
    }
}
