//! Observable item tree
//!
//! A hierarchical, path-addressed key-value tree used to mirror the state of
//! remote services. Every item carries a value and a text, each with its own
//! synchronization [`State`], a set of named side properties and a preview
//! overlay for staging unconfirmed writes.
//!
//! # Architecture
//!
//! ```text
//! transport events ──▶ Producer ──produce_value──▶ Item ──ItemEvent──▶ observers
//!                          ▲                                              │
//!                          └──────────────── set_value / get_value ◀──────┘
//! ```
//!
//! Items are created by [`Producer`]s. The producer of an item decides what
//! `get_value` and `set_value` do: the in-process [`LocalProducer`] applies
//! writes immediately, transport producers (D-Bus, MQTT) issue remote calls
//! and report back through `produce_value`.
//!
//! # Quick Start
//!
//! ```rust
//! use veitem::{ItemTree, LocalProducer, State, Value};
//!
//! let mut tree = ItemTree::new();
//! let root = tree.root();
//! let (_, local) = tree.add_producer(root, "local", LocalProducer::new()).unwrap();
//!
//! let soc = tree.item_get_or_create(local, "Battery/Soc", true).unwrap();
//! let observer = tree.subscribe(soc).unwrap();
//!
//! tree.produce_value(soc, 55, State::Synchronized);
//! assert_eq!(tree.get_value(soc, false), Value::from(55));
//! assert_eq!(observer.drain().len(), 3); // seen, state, value
//! ```

pub mod command;
pub mod error;
pub mod event;
pub mod global;
pub mod item;
pub mod item_tree;
pub mod logging;
pub mod observer;
pub mod producer;
pub mod settings;
pub mod state;
pub mod tree;
pub mod value;

pub use command::{CommandSender, TreeCommand};
pub use error::{Result, TreeError};
pub use event::{EventMask, ItemEvent};
pub use item::{Item, Property};
pub use item_tree::ItemTree;
pub use observer::{ItemObserver, SubscriptionId};
pub use producer::{LocalProducer, Producer, ProducerId};
pub use settings::{SettingInfo, Settings, SettingsInfo};
pub use state::{Facets, State};
pub use tree::{ItemId, Items};
pub use value::Value;
