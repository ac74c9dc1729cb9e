//! Change notifications emitted by items

use std::ops::BitOr;

use crate::state::State;
use crate::tree::ItemId;
use crate::value::Value;

/// A change notification emitted by an item
///
/// Every event names the item that emitted it. For structural events that is
/// the parent; the affected child is carried separately.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemEvent {
    ValueChanged { item: ItemId, value: Value },
    TextChanged { item: ItemId, text: String },
    StateChanged { item: ItemId, state: State },
    TextStateChanged { item: ItemId, state: State },
    /// The item received its first synchronized value
    SeenChanged { item: ItemId },
    PropertyChanged { item: ItemId, name: String, value: Value },
    ChildAboutToBeAdded { item: ItemId, child: ItemId },
    ChildAdded { item: ItemId, child: ItemId },
    ChildAboutToBeRemoved { item: ItemId, child: ItemId },
    ChildRemoved { item: ItemId, child: ItemId },
}

impl ItemEvent {
    /// The item that emitted the event
    pub fn item(&self) -> ItemId {
        match self {
            ItemEvent::ValueChanged { item, .. }
            | ItemEvent::TextChanged { item, .. }
            | ItemEvent::StateChanged { item, .. }
            | ItemEvent::TextStateChanged { item, .. }
            | ItemEvent::SeenChanged { item }
            | ItemEvent::PropertyChanged { item, .. }
            | ItemEvent::ChildAboutToBeAdded { item, .. }
            | ItemEvent::ChildAdded { item, .. }
            | ItemEvent::ChildAboutToBeRemoved { item, .. }
            | ItemEvent::ChildRemoved { item, .. } => *item,
        }
    }

    /// The interest class this event belongs to
    pub fn kind(&self) -> EventMask {
        match self {
            ItemEvent::ValueChanged { .. } => EventMask::VALUE,
            ItemEvent::TextChanged { .. } => EventMask::TEXT,
            ItemEvent::StateChanged { .. }
            | ItemEvent::TextStateChanged { .. }
            | ItemEvent::SeenChanged { .. } => EventMask::STATE,
            ItemEvent::PropertyChanged { .. } => EventMask::PROPERTY,
            ItemEvent::ChildAboutToBeAdded { .. }
            | ItemEvent::ChildAdded { .. }
            | ItemEvent::ChildAboutToBeRemoved { .. }
            | ItemEvent::ChildRemoved { .. } => EventMask::CHILDREN,
        }
    }

    /// Copy of this event as if emitted by another item
    ///
    /// Used by proxies to re-emit the changes of their source.
    pub(crate) fn reemitted_by(&self, proxy: ItemId) -> Option<ItemEvent> {
        let event = match self {
            ItemEvent::ValueChanged { value, .. } => ItemEvent::ValueChanged {
                item: proxy,
                value: value.clone(),
            },
            ItemEvent::TextChanged { text, .. } => ItemEvent::TextChanged {
                item: proxy,
                text: text.clone(),
            },
            ItemEvent::StateChanged { state, .. } => ItemEvent::StateChanged {
                item: proxy,
                state: *state,
            },
            ItemEvent::TextStateChanged { state, .. } => ItemEvent::TextStateChanged {
                item: proxy,
                state: *state,
            },
            ItemEvent::PropertyChanged { name, value, .. } => ItemEvent::PropertyChanged {
                item: proxy,
                name: name.clone(),
                value: value.clone(),
            },
            _ => return None,
        };
        Some(event)
    }
}

/// Interest filter for an item subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventMask(u8);

impl EventMask {
    pub const VALUE: EventMask = EventMask(1);
    pub const TEXT: EventMask = EventMask(2);
    pub const STATE: EventMask = EventMask(4);
    pub const PROPERTY: EventMask = EventMask(8);
    pub const CHILDREN: EventMask = EventMask(16);
    pub const ALL: EventMask = EventMask(31);

    pub fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl Default for EventMask {
    fn default() -> Self {
        EventMask::ALL
    }
}
