//! Client task driving rumqttc
//!
//! [`MqttClient::spawn`] starts a task that owns the rumqttc event loop and
//! the producer's timers. It executes [`TransportCommand`]s queued through
//! the returned [`ChannelTransport`] and reports back with [`MqttEvent`]s.
//! The owner of the tree forwards those to
//! [`MqttHandle::handle_event`](crate::MqttHandle::handle_event).
//!
//! rumqttc reconnects on its own when polled after an error. The task drops
//! the event loop instead so the producer decides when to try again.

use std::collections::HashMap;

use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::{Credentials, MqttConfig, TransportKind};
use crate::error::{MqttError, Result};
use crate::transport::{ChannelTransport, MqttEvent, Timer, TransportCommand};

/// Spawns the client task
pub struct MqttClient;

impl MqttClient {
    /// Start the client task on the current tokio runtime
    ///
    /// The task ends when the transport is dropped or the event receiver
    /// is closed.
    pub fn spawn(config: MqttConfig) -> (ChannelTransport, mpsc::UnboundedReceiver<MqttEvent>, JoinHandle<()>) {
        let (transport, commands) = ChannelTransport::new();
        let (events_tx, events) = mpsc::unbounded_channel();
        let driver = Driver {
            config,
            commands,
            events: events_tx,
            session: None,
            timers: HashMap::new(),
        };
        let task = tokio::spawn(driver.run());
        (transport, events, task)
    }
}

struct Session {
    client: AsyncClient,
    eventloop: EventLoop,
}

enum Step {
    Command(Option<TransportCommand>),
    Polled(std::result::Result<Event, ConnectionError>),
    Timer(Timer),
}

struct Driver {
    config: MqttConfig,
    commands: mpsc::UnboundedReceiver<TransportCommand>,
    events: mpsc::UnboundedSender<MqttEvent>,
    session: Option<Session>,
    timers: HashMap<Timer, Instant>,
}

impl Driver {
    async fn run(mut self) {
        debug!("MQTT client task started for {}:{}", self.config.host, self.config.port);
        loop {
            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                polled = poll_session(&mut self.session) => Step::Polled(polled),
                timer = next_timer(&self.timers) => Step::Timer(timer),
            };

            let events = match step {
                Step::Command(None) => break,
                Step::Command(Some(command)) => self.execute(command),
                Step::Polled(Ok(event)) => self.translate(event),
                Step::Polled(Err(err)) => {
                    self.session = None;
                    vec![MqttEvent::Disconnected {
                        reason: err.to_string(),
                    }]
                }
                Step::Timer(timer) => {
                    self.timers.remove(&timer);
                    vec![MqttEvent::Timer(timer)]
                }
            };

            if events.into_iter().any(|event| self.events.send(event).is_err()) {
                break;
            }
        }
        if let Some(session) = self.session.take() {
            let _ = session.client.try_disconnect();
        }
        debug!("MQTT client task stopped");
    }

    fn execute(&mut self, command: TransportCommand) -> Vec<MqttEvent> {
        match command {
            TransportCommand::Connect { credentials } => {
                self.drop_session();
                match connect(&self.config, credentials) {
                    Ok(session) => self.session = Some(session),
                    Err(err) => {
                        return vec![MqttEvent::Disconnected {
                            reason: err.to_string(),
                        }]
                    }
                }
            }
            TransportCommand::Disconnect => self.drop_session(),
            TransportCommand::StartTimer(timer, after) => {
                self.timers.insert(timer, Instant::now() + after);
            }
            TransportCommand::StopTimer(timer) => {
                self.timers.remove(&timer);
            }
            TransportCommand::Subscribe(topic) => {
                self.with_client(&topic, |client| client.try_subscribe(topic.as_str(), QoS::AtMostOnce));
            }
            TransportCommand::Unsubscribe(topic) => {
                self.with_client(&topic, |client| client.try_unsubscribe(topic.as_str()));
            }
            TransportCommand::Publish { topic, payload } => {
                self.with_client(&topic, |client| {
                    client.try_publish(topic.as_str(), QoS::AtMostOnce, false, payload)
                });
            }
        }
        Vec::new()
    }

    fn with_client(
        &self,
        topic: &str,
        request: impl FnOnce(&AsyncClient) -> std::result::Result<(), rumqttc::ClientError>,
    ) {
        let Some(session) = &self.session else {
            debug!("dropping request for {}: {}", topic, MqttError::NotConnected);
            return;
        };
        if let Err(err) = request(&session.client) {
            warn!("MQTT request for {} failed: {}", topic, MqttError::from(err));
        }
    }

    fn drop_session(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.client.try_disconnect();
        }
    }

    fn translate(&self, event: Event) -> Vec<MqttEvent> {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                if self.config.transport.is_websocket() {
                    vec![MqttEvent::TransportConnected, MqttEvent::Connected]
                } else {
                    vec![MqttEvent::Connected]
                }
            }
            Event::Incoming(Packet::Publish(publish)) => vec![MqttEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            }],
            other => {
                trace!("MQTT event {:?}", other);
                Vec::new()
            }
        }
    }
}

async fn poll_session(session: &mut Option<Session>) -> std::result::Result<Event, ConnectionError> {
    match session {
        Some(session) => session.eventloop.poll().await,
        None => std::future::pending().await,
    }
}

async fn next_timer(timers: &HashMap<Timer, Instant>) -> Timer {
    match timers.iter().min_by_key(|(_, deadline)| **deadline) {
        Some((timer, deadline)) => {
            tokio::time::sleep_until(*deadline).await;
            *timer
        }
        None => std::future::pending().await,
    }
}

fn connect(config: &MqttConfig, credentials: Option<Credentials>) -> Result<Session> {
    let options = mqtt_options(config, credentials)?;
    debug!("connecting to MQTT broker as {}", config.client_id);
    let (client, eventloop) = AsyncClient::new(options, config.channel_capacity);
    Ok(Session { client, eventloop })
}

/// rumqttc options for a connect attempt
pub fn mqtt_options(config: &MqttConfig, credentials: Option<Credentials>) -> Result<MqttOptions> {
    let mut options = match &config.transport {
        TransportKind::Tcp => MqttOptions::new(config.client_id.as_str(), config.host.as_str(), config.port),
        TransportKind::WebSocket { url } => websocket_options(config, url)?,
    };
    options.set_keep_alive(config.mqtt_keep_alive);
    options.set_clean_session(true);
    if let Some(credentials) = credentials {
        options.set_credentials(credentials.username, credentials.password);
    }
    Ok(options)
}

#[cfg(feature = "websocket")]
fn websocket_options(config: &MqttConfig, url: &str) -> Result<MqttOptions> {
    let mut options = MqttOptions::new(config.client_id.as_str(), url, config.port);
    options.set_transport(rumqttc::Transport::Ws);
    Ok(options)
}

#[cfg(not(feature = "websocket"))]
fn websocket_options(_config: &MqttConfig, url: &str) -> Result<MqttOptions> {
    Err(MqttError::Client(format!(
        "cannot reach {}: built without the websocket feature",
        url
    )))
}
