//! The item node

use std::collections::HashMap;
use std::sync::mpsc;

use indexmap::IndexMap;

use crate::event::{EventMask, ItemEvent};
use crate::observer::SubscriptionId;
use crate::producer::ProducerId;
use crate::state::State;
use crate::tree::ItemId;
use crate::value::Value;

/// Property name of the minimum allowed value
pub const MIN: &str = "min";
/// Property name of the maximum allowed value
pub const MAX: &str = "max";
/// Property name of the default value
pub const DEFAULT: &str = "defaultValue";

/// A named side property of an item with its own sync state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Property {
    pub value: Value,
    pub state: State,
}

/// Value and state captured when the item entered preview
#[derive(Debug, Clone)]
pub(crate) struct PreviewSlot<T> {
    pub(crate) saved: T,
    pub(crate) state: State,
    /// Latest update produced while previewing; never applied
    pub(crate) buffered: Option<(T, State)>,
}

#[derive(Debug)]
pub(crate) struct Subscriber {
    pub(crate) id: SubscriptionId,
    pub(crate) mask: EventMask,
    pub(crate) tx: mpsc::Sender<ItemEvent>,
}

/// A node of the item tree
///
/// Items are owned by their [`ItemTree`](crate::ItemTree) and addressed by
/// [`ItemId`]. This type only exposes reads; every mutation goes through the
/// tree so that notifications are emitted consistently.
#[derive(Debug)]
pub struct Item {
    pub(crate) id: String,
    pub(crate) uid: String,
    pub(crate) parent: Option<ItemId>,
    pub(crate) children: IndexMap<String, ItemId>,
    pub(crate) producer: Option<ProducerId>,
    pub(crate) is_leaf: bool,

    pub(crate) value: Value,
    pub(crate) last_valid_value: Value,
    pub(crate) state: State,
    pub(crate) text: String,
    pub(crate) last_valid_text: String,
    pub(crate) text_state: State,
    pub(crate) seen: bool,
    pub(crate) preview: Option<PreviewSlot<Value>>,
    pub(crate) text_preview: Option<PreviewSlot<String>>,

    pub(crate) properties: HashMap<String, Property>,
    pub(crate) subscribers: Vec<Subscriber>,

    pub(crate) proxy_source: Option<ItemId>,
    pub(crate) proxies: Vec<ItemId>,
}

impl Item {
    pub(crate) fn new(producer: Option<ProducerId>, is_leaf: bool) -> Self {
        Self {
            id: String::new(),
            uid: String::new(),
            parent: None,
            children: IndexMap::new(),
            producer,
            is_leaf,
            value: Value::Invalid,
            last_valid_value: Value::Invalid,
            state: State::Idle,
            text: String::new(),
            last_valid_text: String::new(),
            text_state: State::Idle,
            seen: false,
            preview: None,
            text_preview: None,
            properties: HashMap::new(),
            subscribers: Vec::new(),
            proxy_source: None,
            proxies: Vec::new(),
        }
    }

    /// Path segment of this item under its parent
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Full path from the root, without leading slash
    pub fn unique_id(&self) -> &str {
        &self.uid
    }

    pub fn parent(&self) -> Option<ItemId> {
        self.parent
    }

    pub fn producer(&self) -> Option<ProducerId> {
        self.producer
    }

    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    /// Current value, without requesting anything
    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn last_valid_value(&self) -> &Value {
        &self.last_valid_value
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Current text, empty until one has been produced
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn last_valid_text(&self) -> &str {
        &self.last_valid_text
    }

    pub fn text_state(&self) -> State {
        self.text_state
    }

    /// Whether a synchronized value was ever received
    pub fn seen(&self) -> bool {
        self.seen
    }

    /// Whether at least one live subscription is interested in the value
    pub fn is_watched(&self) -> bool {
        self.subscribers
            .iter()
            .any(|s| s.mask.intersects(EventMask::VALUE))
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> impl Iterator<Item = (&str, &Property)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Child ids with their path segments, in insertion order
    pub fn children(&self) -> impl Iterator<Item = (&str, ItemId)> {
        self.children.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Source item if this is a proxy
    pub fn proxy_source(&self) -> Option<ItemId> {
        self.proxy_source
    }
}
