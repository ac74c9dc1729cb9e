//! Items mirrored from a Venus device over MQTT
//!
//! Every notification `N/<portal>/<path>` becomes the item `<path>` below
//! the producer root. The portal id is not configured; it is learned from
//! the first `N/<portal>/system/0/Serial` message after connecting, and
//! only then is the full `N/<portal>/#` subscription made.
//!
//! After identification a keepalive asks the device to republish
//! everything and to echo a token once done. The echo (or the ready fallback
//! timer) moves the producer to [`ConnectionState::Ready`]. Periodic
//! keepalives afterwards suppress the republish.
//!
//! Lost connections are retried with [`ReconnectBackoff`]; once it runs out
//! the producer sits in `Failed` for a cooldown, with every item
//! `Invalid`/`Offline`, and then starts over.

use tokio::sync::watch;
use tracing::{debug, info, trace, warn};
use veitem::item::{DEFAULT, MAX, MIN};
use veitem::{ItemId, ItemTree, Items, Producer, ProducerId, State, Value};

use crate::backoff::ReconnectBackoff;
use crate::config::{Credentials, MqttConfig};
use crate::error::MqttError;
use crate::payload::{self, Notification};
use crate::state::{is_transition_allowed, ConnectionState, HeartbeatState, HeartbeatTracker};
use crate::topic;
use crate::transport::{MqttEvent, MqttTransport, Timer};

const ALL_TIMERS: [Timer; 5] = [
    Timer::Reconnect,
    Timer::KeepAlive,
    Timer::ReadyFallback,
    Timer::Heartbeat,
    Timer::FailedCooldown,
];

/// Producer for the items of one MQTT broker
pub struct MqttProducer {
    config: MqttConfig,
    transport: Box<dyn MqttTransport>,
    root: Option<ItemId>,
    state: ConnectionState,
    portal_id: String,
    credentials: Option<Credentials>,
    /// A connect attempt is held back until credentials arrive
    parked: bool,
    backoff: ReconnectBackoff,
    heartbeat: HeartbeatTracker,
    /// Token of the keepalive whose republish is still running
    echo: Option<String>,
    state_tx: watch::Sender<ConnectionState>,
    heartbeat_tx: watch::Sender<HeartbeatState>,
}

impl std::fmt::Debug for MqttProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttProducer")
            .field("state", &self.state)
            .field("portal_id", &self.portal_id)
            .field("reconnect_attempts", &self.backoff.attempts())
            .finish()
    }
}

impl MqttProducer {
    pub fn new(transport: impl MqttTransport + 'static, config: MqttConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (heartbeat_tx, _) = watch::channel(HeartbeatState::Inactive);
        Self {
            credentials: config.credentials.clone(),
            backoff: config.backoff(),
            config,
            transport: Box::new(transport),
            root: None,
            state: ConnectionState::Idle,
            portal_id: String::new(),
            parked: false,
            heartbeat: HeartbeatTracker::new(),
            echo: None,
            state_tx,
            heartbeat_tx,
        }
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    /// Portal id, once learned from the device
    pub fn portal_id(&self) -> Option<&str> {
        (!self.portal_id.is_empty()).then_some(self.portal_id.as_str())
    }

    pub fn heartbeat_state(&self) -> HeartbeatState {
        self.heartbeat.state()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.backoff.attempts()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn watch_heartbeat(&self) -> watch::Receiver<HeartbeatState> {
        self.heartbeat_tx.subscribe()
    }

    /// A connect attempt waits for [`continue_connect`](Self::continue_connect)
    pub fn is_waiting_for_credentials(&self) -> bool {
        self.parked
    }

    /// Start connecting; `false` if the producer is not idle
    pub fn open(&mut self, items: &mut Items) -> bool {
        if !self.transition(ConnectionState::WaitingToConnect) {
            return false;
        }
        self.backoff.reset();
        self.begin_connect(items);
        true
    }

    /// Drop the connection and return to `Idle`
    pub fn close(&mut self, items: &mut Items) {
        if self.state == ConnectionState::Idle {
            return;
        }
        self.transport.disconnect();
        for timer in ALL_TIMERS {
            self.transport.stop_timer(timer);
        }
        self.parked = false;
        self.echo = None;
        self.portal_id.clear();
        self.take_in_flight_offline(items);
        self.transition(ConnectionState::Idle);
    }

    /// Credentials for the next connect attempt
    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = Some(credentials);
    }

    /// Resume a connect attempt parked for credentials
    pub fn continue_connect(&mut self, items: &mut Items) -> bool {
        if !self.parked {
            return false;
        }
        self.parked = false;
        self.connect_now(items);
        true
    }

    /// Feed something the client task reported
    pub fn handle_event(&mut self, items: &mut Items, event: MqttEvent) {
        match event {
            MqttEvent::TransportConnected => self.transport_connected(),
            MqttEvent::Connected => self.connected(),
            MqttEvent::Disconnected { reason } => self.connection_lost(items, &reason),
            MqttEvent::Message { topic, payload } => self.message_received(items, &topic, &payload),
            MqttEvent::Timer(timer) => self.timer_fired(items, timer),
        }
    }

    /// Publish a write for an item; `false` when it can not be sent
    pub fn publish_value(&mut self, items: &Items, item: ItemId, value: &Value) -> bool {
        if !self.state.is_connected() || self.portal_id.is_empty() {
            debug!("not connected, dropping write to {:?}", items.unique_id(item));
            return false;
        }
        let Some(path) = self.item_path(items, item) else {
            return false;
        };
        match self.transport.publish(&topic::write(&self.portal_id, &path), payload::write_payload(value)) {
            Ok(()) => true,
            Err(err) => {
                warn!("could not publish write to {}: {}", path, err);
                false
            }
        }
    }

    // ========================================================================
    // Connection state
    // ========================================================================

    fn transition(&mut self, to: ConnectionState) -> bool {
        let from = self.state;
        if !is_transition_allowed(from, to) {
            warn!("rejecting connection state change {:?} -> {:?}", from, to);
            return false;
        }
        debug!("connection state {:?} -> {:?}", from, to);
        self.state = to;
        self.state_tx.send_replace(to);
        true
    }

    fn begin_connect(&mut self, items: &mut Items) {
        if self.config.wait_for_credentials {
            debug!("waiting for credentials before connecting");
            self.parked = true;
            return;
        }
        self.connect_now(items);
    }

    fn connect_now(&mut self, items: &mut Items) {
        let reconnecting = self.state == ConnectionState::WaitingToReconnect;
        let next = match (reconnecting, self.config.transport.is_websocket()) {
            (false, false) => ConnectionState::Connecting,
            (false, true) => ConnectionState::TransportConnecting,
            (true, false) => ConnectionState::Reconnecting,
            (true, true) => ConnectionState::TransportReconnecting,
        };
        if !self.transition(next) {
            return;
        }
        if let Err(err) = self.transport.connect(self.credentials.clone()) {
            self.connection_lost(items, &err.to_string());
        }
    }

    fn transport_connected(&mut self) {
        let (transport_state, next) = match self.state {
            ConnectionState::TransportConnecting => {
                (ConnectionState::TransportConnected, ConnectionState::Connecting)
            }
            ConnectionState::TransportReconnecting => {
                (ConnectionState::TransportReconnected, ConnectionState::Reconnecting)
            }
            other => {
                warn!("ignoring transport connect in state {:?}", other);
                return;
            }
        };
        if self.transition(transport_state) {
            self.transition(next);
        }
    }

    fn connected(&mut self) {
        if !self.transition(ConnectionState::Connected) {
            return;
        }
        self.backoff.reset();
        info!("connected to MQTT broker {}:{}", self.config.host, self.config.port);
        if self.portal_id.is_empty() {
            if let Err(err) = self.transport.subscribe(topic::DISCOVERY) {
                warn!("could not subscribe to {}: {}", topic::DISCOVERY, err);
            }
        } else {
            self.identified();
        }
    }

    fn identified(&mut self) {
        if !self.transition(ConnectionState::Identified) {
            return;
        }
        let portal_id = self.portal_id.clone();
        if let Err(err) = self.transport.subscribe(&topic::notifications(&portal_id)) {
            warn!("could not subscribe to notifications of {}: {}", portal_id, err);
        }

        let token = format!("{:08x}", rand::random::<u32>());
        if let Err(err) = self
            .transport
            .publish(&topic::keepalive(&portal_id), payload::keepalive_with_echo(&token))
        {
            warn!("could not send keepalive: {}", err);
        }
        self.echo = Some(token);
        self.transition(ConnectionState::Initializing);

        self.transport.start_timer(Timer::ReadyFallback, self.config.ready_fallback);
        self.transport.start_timer(Timer::KeepAlive, self.config.keepalive_interval);
        self.heartbeat.reset();
        self.publish_heartbeat_state();
        self.transport.start_timer(Timer::Heartbeat, self.config.heartbeat_interval);
    }

    fn ready(&mut self) {
        if !self.transition(ConnectionState::Ready) {
            return;
        }
        self.echo = None;
        self.transport.stop_timer(Timer::ReadyFallback);
        info!("portal {} ready", self.portal_id);
    }

    fn connection_lost(&mut self, items: &mut Items, reason: &str) {
        if !self.transition(ConnectionState::Disconnected) {
            return;
        }
        warn!("MQTT connection lost: {}", reason);
        for timer in [Timer::KeepAlive, Timer::ReadyFallback, Timer::Heartbeat] {
            self.transport.stop_timer(timer);
        }
        self.echo = None;
        self.parked = false;
        self.take_in_flight_offline(items);

        match self.backoff.next_delay() {
            Some(delay) => {
                self.transition(ConnectionState::WaitingToReconnect);
                debug!("reconnect attempt {} in {:?}", self.backoff.attempts(), delay);
                self.transport.start_timer(Timer::Reconnect, delay);
            }
            None => {
                self.transition(ConnectionState::Failed);
                warn!(
                    "giving up after {} reconnect attempts, retrying in {:?}",
                    self.backoff.attempts(),
                    self.config.failed_cooldown
                );
                self.invalidate_all(items);
                self.transport.start_timer(Timer::FailedCooldown, self.config.failed_cooldown);
            }
        }
    }

    fn timer_fired(&mut self, items: &mut Items, timer: Timer) {
        match timer {
            Timer::Reconnect if self.state == ConnectionState::WaitingToReconnect => {
                self.begin_connect(items);
            }
            Timer::KeepAlive if self.is_identified() => {
                let topic = topic::keepalive(&self.portal_id);
                if let Err(err) = self.transport.publish(&topic, payload::keepalive_suppress_republish()) {
                    warn!("could not send keepalive: {}", err);
                }
                self.transport.start_timer(Timer::KeepAlive, self.config.keepalive_interval);
            }
            Timer::ReadyFallback if self.state == ConnectionState::Initializing => {
                debug!("no full_publish_completed, assuming ready");
                self.ready();
            }
            Timer::Heartbeat if self.is_identified() => {
                self.heartbeat.tick();
                self.publish_heartbeat_state();
                self.transport.start_timer(Timer::Heartbeat, self.config.heartbeat_interval);
            }
            Timer::FailedCooldown if self.state == ConnectionState::Failed => {
                if self.transition(ConnectionState::WaitingToConnect) {
                    self.backoff.reset();
                    self.begin_connect(items);
                }
            }
            timer => trace!("stale {:?} timer in state {:?}", timer, self.state),
        }
    }

    fn is_identified(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Identified | ConnectionState::Initializing | ConnectionState::Ready
        )
    }

    fn publish_heartbeat_state(&mut self) {
        let state = self.heartbeat.state();
        if *self.heartbeat_tx.borrow() != state {
            debug!("heartbeat {:?}", state);
            self.heartbeat_tx.send_replace(state);
        }
    }

    // ========================================================================
    // Messages
    // ========================================================================

    fn message_received(&mut self, items: &mut Items, topic: &str, payload: &[u8]) {
        if self.portal_id.is_empty() {
            self.discovery_message(topic, payload);
            return;
        }
        let Some(path) = topic::notification_path(topic, &self.portal_id) else {
            trace!("ignoring message on {}", topic);
            return;
        };
        match path {
            topic::KEEPALIVE => {}
            topic::HEARTBEAT => {
                self.heartbeat.beat();
                self.publish_heartbeat_state();
            }
            topic::FULL_PUBLISH_COMPLETED => {
                let echo = payload::publish_completed_echo(payload);
                if self.state == ConnectionState::Initializing && echo.is_some() && echo == self.echo {
                    self.ready();
                } else {
                    trace!("ignoring full_publish_completed {:?}", echo);
                }
            }
            path => self.notification(items, path, payload),
        }
    }

    fn discovery_message(&mut self, topic: &str, payload: &[u8]) {
        let Some(portal_id) = topic::serial_portal(topic) else {
            trace!("ignoring {} before identification", topic);
            return;
        };
        if payload::string_value(payload).as_deref() != Some(portal_id) {
            warn!("portal id mismatch: {} -> {}", topic, String::from_utf8_lossy(payload));
            return;
        }
        if self.state != ConnectionState::Connected {
            debug!("ignoring portal id {} in state {:?}", portal_id, self.state);
            return;
        }
        info!("identified portal {}", portal_id);
        self.portal_id = portal_id.to_string();
        if let Err(err) = self.transport.unsubscribe(topic::DISCOVERY) {
            warn!("could not unsubscribe from {}: {}", topic::DISCOVERY, err);
        }
        self.identified();
    }

    fn notification(&mut self, items: &mut Items, path: &str, payload: &[u8]) {
        let Some(root) = self.root else {
            return;
        };
        let Some(item) = items.item_get_or_create_untrusted(root, path, true) else {
            return;
        };

        match payload::parse_notification(payload) {
            Ok(Notification::Removed) => {
                trace!("{} removed", path);
                items.produce_value(item, Value::Invalid, State::Offline);
                items.produce_text(item, "", State::Offline);
            }
            Ok(Notification::Update(update)) => {
                let text = update.value.to_text();
                items.produce_value(item, update.value, State::Synchronized);
                items.produce_text(item, text, State::Synchronized);
                for (name, value) in [(MIN, update.min), (MAX, update.max), (DEFAULT, update.default)] {
                    if let Some(value) = value {
                        items.produce_property(item, name, value, State::Synchronized);
                    }
                }
            }
            Err(err) => {
                warn!("malformed payload on {}: {}", path, err);
                items.produce_value(item, Value::Invalid, State::Offline);
            }
        }
    }

    // ========================================================================
    // Items
    // ========================================================================

    /// Path of an item below the producer root, without leading slash
    fn item_path(&self, items: &Items, item: ItemId) -> Option<String> {
        let rel = items.rel_id(item, self.root?);
        let path = rel.strip_prefix('/')?;
        (!path.is_empty()).then(|| path.to_string())
    }

    fn take_in_flight_offline(&mut self, items: &mut Items) {
        let Some(root) = self.root else { return };
        for id in items.descendants(root) {
            let Some(item) = items.get(id) else { continue };
            let (state, text_state) = (item.state(), item.text_state());
            if matches!(state, State::Requested | State::Storing) {
                items.set_state(id, State::Offline);
            }
            if text_state == State::Requested {
                items.set_text_state(id, State::Offline);
            }
        }
    }

    fn invalidate_all(&mut self, items: &mut Items) {
        let Some(root) = self.root else { return };
        for id in items.descendants(root) {
            items.produce_value(id, Value::Invalid, State::Offline);
            items.produce_text(id, "", State::Offline);
        }
    }
}

impl Producer for MqttProducer {
    fn attached(&mut self, _items: &mut Items, root: ItemId) {
        self.root = Some(root);
    }

    fn get_value(&mut self, items: &mut Items, item: ItemId, force: bool) -> Value {
        let Some(current) = items.get(item) else {
            return Value::Invalid;
        };
        let state = current.state();
        let value = current.value().clone();
        if !(force || state == State::Idle) || matches!(state, State::Requested | State::Preview) {
            return value;
        }
        if !self.is_identified() {
            return value;
        }
        let Some(path) = self.item_path(items, item) else {
            return value;
        };
        match self.transport.publish(&topic::read(&self.portal_id, &path), Vec::new()) {
            Ok(()) => items.set_state(item, State::Requested),
            Err(err) => warn!("could not request {}: {}", path, err),
        }
        value
    }

    fn set_value(&mut self, items: &mut Items, item: ItemId, value: Value) -> i32 {
        if !self.publish_value(items, item, &value) {
            return -1;
        }
        items.set_state(item, State::Storing);
        0
    }
}

/// An [`MqttProducer`] registered with an [`ItemTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MqttHandle {
    pid: ProducerId,
    root: ItemId,
}

impl MqttHandle {
    /// Register an MQTT producer under `parent`; call [`open`](Self::open) to connect
    pub fn attach(
        tree: &mut ItemTree,
        parent: ItemId,
        id: &str,
        transport: impl MqttTransport + 'static,
        config: MqttConfig,
    ) -> Result<Self, MqttError> {
        let (pid, root) = tree.add_producer(parent, id, MqttProducer::new(transport, config))?;
        Ok(Self { pid, root })
    }

    pub fn producer_id(&self) -> ProducerId {
        self.pid
    }

    /// Item below which the portal's items appear
    pub fn root(&self) -> ItemId {
        self.root
    }

    pub fn open(&self, tree: &mut ItemTree) -> bool {
        self.with(tree, |producer, items| producer.open(items)).unwrap_or(false)
    }

    pub fn close(&self, tree: &mut ItemTree) {
        self.with(tree, |producer, items| producer.close(items));
    }

    pub fn set_credentials(&self, tree: &mut ItemTree, credentials: Credentials) {
        self.with(tree, |producer, _| producer.set_credentials(credentials));
    }

    pub fn continue_connect(&self, tree: &mut ItemTree) -> bool {
        self.with(tree, |producer, items| producer.continue_connect(items))
            .unwrap_or(false)
    }

    pub fn handle_event(&self, tree: &mut ItemTree, event: MqttEvent) {
        self.with(tree, |producer, items| producer.handle_event(items, event));
    }

    pub fn connection_state(&self, tree: &mut ItemTree) -> ConnectionState {
        self.with(tree, |producer, _| producer.connection_state())
            .unwrap_or_default()
    }

    pub fn watch_connection_state(&self, tree: &mut ItemTree) -> Option<watch::Receiver<ConnectionState>> {
        self.with(tree, |producer, _| producer.watch_connection_state())
    }

    pub fn watch_heartbeat(&self, tree: &mut ItemTree) -> Option<watch::Receiver<HeartbeatState>> {
        self.with(tree, |producer, _| producer.watch_heartbeat())
    }

    /// Run `f` against the producer
    pub fn with<R>(&self, tree: &mut ItemTree, f: impl FnOnce(&mut MqttProducer, &mut Items) -> R) -> Option<R> {
        tree.with_producer::<MqttProducer, _>(self.pid, f)
    }
}
