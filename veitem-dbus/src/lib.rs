//! D-Bus transport for the veitem item tree
//!
//! Two roles:
//!
//! - [`DbusProducer`] mirrors remote `com.victronenergy.*` services into the
//!   tree. Values are fetched lazily or in bulk, writes go out as `SetValue`,
//!   and a service leaving the bus takes all of its items `Offline`.
//! - [`ExportedServices`] publishes a local subtree: each online child of the
//!   exported item becomes a service answering `GetValue`, `SetValue`,
//!   `GetItems` and friends, with changes batched into `ItemsChanged`.
//!
//! Neither role owns a socket. Outgoing messages go through a
//! [`BusConnection`]; replies and signals are fed back as [`BusEvent`]s by
//! the task that owns the real bus binding.
//!
//! # Example
//!
//! ```rust,ignore
//! use veitem::ItemTree;
//! use veitem_dbus::{ChannelConnection, DbusConfig, DbusHandle};
//!
//! let mut tree = ItemTree::new();
//! let root = tree.root();
//! let (connection, mut outbound) = ChannelConnection::new();
//! let dbus = DbusHandle::attach(&mut tree, root, "dbus", connection, DbusConfig::default())?;
//!
//! // forward `outbound` to the bus, and feed what comes back:
//! dbus.handle_event(&mut tree, event);
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod export;
pub mod message;
pub mod producer;
pub mod service;
pub mod settings;
pub mod wire;

pub use config::DbusConfig;
pub use connection::{BusConnection, ChannelConnection, Outbound};
pub use error::{BusError, DbusError};
pub use export::ExportedServices;
pub use message::{BusEvent, IncomingCall, MethodCall, Serial, Signal};
pub use producer::{DbusHandle, DbusProducer};
pub use service::ServiceBinding;
pub use wire::{denormalize, normalize, ItemMap, PropertyMap, WireValue};
