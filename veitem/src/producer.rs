//! The producer seam between transports and the tree
//!
//! A producer creates the items of one subtree and decides how they are
//! fetched and written. Items remember the producer that created them and
//! children inherit it, so the tree can route `get_value`/`set_value` to the
//! right transport without the item knowing about it.
//!
//! Every hook has a default that implements the transport independent base
//! behavior, so a producer only overrides what its transport changes.

use std::any::Any;

use crate::state::State;
use crate::tree::{ItemId, Items};
use crate::value::Value;

/// Identifies a producer registered with an [`ItemTree`](crate::ItemTree)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProducerId(u32);

impl ProducerId {
    pub(crate) fn new(id: u32) -> Self {
        Self(id)
    }
}

/// Downcasting support for producers
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Transport specific item behavior
///
/// # Example
///
/// ```rust,ignore
/// struct Echo;
///
/// impl Producer for Echo {
///     fn set_value(&mut self, items: &mut Items, item: ItemId, value: Value) -> i32 {
///         items.produce_value(item, value, State::Synchronized);
///         0
///     }
/// }
/// ```
pub trait Producer: AsAny + Send {
    /// Called once the producer's root item is attached to the tree
    fn attached(&mut self, _items: &mut Items, _root: ItemId) {}

    /// Called after an item created by this producer was attached
    fn item_added(&mut self, _items: &mut Items, _item: ItemId) {}

    /// Called after an item created by this producer was deleted
    fn item_removed(&mut self, _item: ItemId) {}

    /// Request the value; returns what is known right now
    fn get_value(&mut self, items: &mut Items, item: ItemId, force: bool) -> Value {
        items.request_value(item, force)
    }

    /// Request the text; returns what is known right now
    fn get_text(&mut self, items: &mut Items, item: ItemId, force: bool) -> String {
        items.request_text(item, force)
    }

    /// Write a value; a negative status means the write was rejected
    fn set_value(&mut self, _items: &mut Items, _item: ItemId, _value: Value) -> i32 {
        0
    }

    /// Request a named property; returns what is known right now
    fn item_property(&mut self, items: &mut Items, item: ItemId, name: &str, _force: bool) -> Value {
        items.request_property(item, name)
    }

    /// The watched flag of an item of this producer flipped
    fn watched_changed(&mut self, _items: &mut Items, _item: ItemId, _watched: bool) {}
}

/// Producer of in-process items
///
/// Writes apply immediately and the text is the value rendered as a string.
#[derive(Debug, Default)]
pub struct LocalProducer;

impl LocalProducer {
    pub fn new() -> Self {
        Self
    }
}

impl Producer for LocalProducer {
    fn get_text(&mut self, items: &mut Items, item: ItemId, force: bool) -> String {
        self.get_value(items, item, force).to_text()
    }

    fn set_value(&mut self, items: &mut Items, item: ItemId, value: Value) -> i32 {
        items.produce_value(item, value, State::Synchronized);
        0
    }
}
