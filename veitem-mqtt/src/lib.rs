//! MQTT transport for the veitem item tree
//!
//! [`MqttProducer`] mirrors the notifications of a Venus device into the
//! tree. It discovers the portal id, subscribes to `N/<portal>/#`, keeps
//! the notifications flowing with keepalives and turns writes into `W/`
//! publishes. The connection follows the [`ConnectionState`] machine and is
//! retried with a jittered backoff.
//!
//! The producer is synchronous. It hands its requests to an
//! [`MqttTransport`] and reacts to [`MqttEvent`]s. [`MqttClient`] is the
//! rumqttc based task on the other side of that seam.
//!
//! # Example
//!
//! ```rust,ignore
//! use veitem::ItemTree;
//! use veitem_mqtt::{MqttClient, MqttConfig, MqttHandle};
//!
//! let config = MqttConfig::new("venus.local", 1883);
//! let (transport, mut events, _task) = MqttClient::spawn(config.clone());
//!
//! let mut tree = ItemTree::new();
//! let root = tree.root();
//! let mqtt = MqttHandle::attach(&mut tree, root, "mqtt", transport, config)?;
//! mqtt.open(&mut tree);
//!
//! while let Some(event) = events.recv().await {
//!     mqtt.handle_event(&mut tree, event);
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod payload;
pub mod producer;
pub mod state;
pub mod topic;
pub mod transport;

pub use backoff::ReconnectBackoff;
pub use client::MqttClient;
pub use config::{Credentials, MqttConfig, TransportKind};
pub use error::{MqttError, Result};
pub use producer::{MqttHandle, MqttProducer};
pub use state::{ConnectionState, HeartbeatState, HeartbeatTracker};
pub use transport::{ChannelTransport, MqttEvent, MqttTransport, Timer, TransportCommand};
