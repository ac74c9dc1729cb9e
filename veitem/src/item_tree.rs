//! The item tree: items plus the producers that own them
//!
//! [`ItemTree`] is the single owner of a tree. It routes the operations
//! whose outcome depends on the transport (`get_value`, `get_text`,
//! `set_value`, `item_property`) to the producer of the addressed item,
//! follows proxy links, and tells producers about items they created being
//! attached or deleted.
//!
//! Producers themselves only see [`Items`] while one of their hooks runs,
//! which keeps every mutation on the owning thread.

use std::collections::HashMap;
use std::sync::mpsc;

use tracing::{debug, warn};

use crate::command::{CommandSender, TreeCommand};
use crate::error::{Result, TreeError};
use crate::event::{EventMask, ItemEvent};
use crate::item::Item;
use crate::observer::{ItemObserver, SubscriptionId};
use crate::producer::{Producer, ProducerId};
use crate::state::State;
use crate::tree::{ItemId, Items};
use crate::value::Value;

struct ProducerSlot {
    producer: Box<dyn Producer>,
    root: ItemId,
}

/// A tree of items with its producers
pub struct ItemTree {
    items: Items,
    producers: HashMap<ProducerId, ProducerSlot>,
    next_producer: u32,
    commands_tx: mpsc::Sender<TreeCommand>,
    commands_rx: mpsc::Receiver<TreeCommand>,
}

impl Default for ItemTree {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ItemTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemTree")
            .field("items", &self.items.len())
            .field("producers", &self.producers.len())
            .finish()
    }
}

impl ItemTree {
    pub fn new() -> Self {
        let (commands_tx, commands_rx) = mpsc::channel();
        Self {
            items: Items::new(),
            producers: HashMap::new(),
            next_producer: 0,
            commands_tx,
            commands_rx,
        }
    }

    pub fn root(&self) -> ItemId {
        self.items.root()
    }

    pub fn items(&self) -> &Items {
        &self.items
    }

    /// Direct access to the arena
    ///
    /// Producer hooks for items created through this handle run on the next
    /// tree operation.
    pub fn items_mut(&mut self) -> &mut Items {
        &mut self.items
    }

    pub fn item(&self, id: ItemId) -> Option<&Item> {
        self.items.get(id)
    }

    // ========================================================================
    // Producers
    // ========================================================================

    /// Register a producer and attach its root item under `parent`
    ///
    /// Items created below the returned root are created by this producer.
    pub fn add_producer<P: Producer>(&mut self, parent: ItemId, id: &str, producer: P) -> Result<(ProducerId, ItemId)> {
        self.flush_hooks();
        let pid = ProducerId::new(self.next_producer);
        let root = self.items.create_item(Some(pid), false);
        if let Err(err) = self.items.add_child(parent, id, root) {
            let _ = self.items.delete(root);
            self.items.take_removed();
            return Err(err);
        }
        self.next_producer += 1;
        // The producer learns about its root through `attached`
        self.items.take_created();

        let mut slot = ProducerSlot {
            producer: Box::new(producer),
            root,
        };
        slot.producer.attached(&mut self.items, root);
        self.producers.insert(pid, slot);
        debug!("producer {:?} attached at {:?}", pid, self.items.unique_id(root));
        self.flush_hooks();
        Ok((pid, root))
    }

    /// Delete a producer's subtree and drop the producer
    pub fn remove_producer(&mut self, pid: ProducerId) -> Result<()> {
        let root = self
            .producers
            .get(&pid)
            .map(|slot| slot.root)
            .ok_or(TreeError::ProducerNotFound(pid))?;
        let result = self.items.delete(root);
        self.flush_hooks();
        self.producers.remove(&pid);
        result
    }

    /// Root item of a producer
    pub fn producer_root(&self, pid: ProducerId) -> Option<ItemId> {
        self.producers.get(&pid).map(|slot| slot.root)
    }

    /// Run `f` with mutable access to a producer of concrete type `P`
    ///
    /// Returns `None` if the producer does not exist or is of another type.
    pub fn with_producer<P: Producer, R>(&mut self, pid: ProducerId, f: impl FnOnce(&mut P, &mut Items) -> R) -> Option<R> {
        self.flush_hooks();
        let slot = self.producers.get_mut(&pid)?;
        let producer: &mut dyn Producer = &mut *slot.producer;
        let producer = producer.as_any_mut().downcast_mut::<P>()?;
        let result = f(producer, &mut self.items);
        self.flush_hooks();
        Some(result)
    }

    /// Tell producers about attached, deleted and no longer watched items
    fn flush_hooks(&mut self) {
        loop {
            let created = self.items.take_created();
            let removed = self.items.take_removed();
            let unwatched = self.items.take_unwatched();
            if created.is_empty() && removed.is_empty() && unwatched.is_empty() {
                break;
            }
            for id in created {
                let Some(pid) = self.items.get(id).and_then(|item| item.producer()) else {
                    continue;
                };
                if let Some(slot) = self.producers.get_mut(&pid) {
                    slot.producer.item_added(&mut self.items, id);
                }
            }
            for (pid, id) in removed {
                if let Some(slot) = self.producers.get_mut(&pid) {
                    slot.producer.item_removed(id);
                }
            }
            for id in unwatched {
                // Watched again by now, and the producer was told then
                if self.items.get(id).map_or(true, Item::is_watched) {
                    continue;
                }
                if let Some(slot) = self.producer_of(id).and_then(|pid| self.producers.get_mut(&pid)) {
                    slot.producer.watched_changed(&mut self.items, id, false);
                }
            }
        }
    }

    fn producer_of(&self, id: ItemId) -> Option<ProducerId> {
        self.items.get(id).and_then(|item| item.producer())
    }

    // ========================================================================
    // Transport dependent operations
    // ========================================================================

    /// Request the value of an item
    ///
    /// If `force` is set or the item is idle the producer starts a fetch and
    /// the item moves to `Requested`. The value known right now is returned;
    /// the fetched one arrives later as a `ValueChanged` event.
    pub fn get_value(&mut self, id: ItemId, force: bool) -> Value {
        self.flush_hooks();
        let target = self.items.resolve_proxy(id);
        let value = match self.producer_of(target).and_then(|pid| self.producers.get_mut(&pid)) {
            Some(slot) => slot.producer.get_value(&mut self.items, target, force),
            None => self.items.request_value(target, force),
        };
        self.flush_hooks();
        value
    }

    /// Request the text of an item, independent of its value
    pub fn get_text(&mut self, id: ItemId, force: bool) -> String {
        self.flush_hooks();
        let target = self.items.resolve_proxy(id);
        let text = match self.producer_of(target).and_then(|pid| self.producers.get_mut(&pid)) {
            Some(slot) => slot.producer.get_text(&mut self.items, target, force),
            None => self.items.request_text(target, force),
        };
        self.flush_hooks();
        text
    }

    /// Write a value through the item's producer
    ///
    /// Returns a negative status when the write was rejected, e.g. because
    /// the remote side is unreachable. A rejected write of a previewing item
    /// restores the value it had before the preview.
    pub fn set_value(&mut self, id: ItemId, value: impl Into<Value>) -> i32 {
        self.flush_hooks();
        let target = self.items.resolve_proxy(id);
        if !self.items.contains(target) {
            warn!("set_value on stale item {:?}", id);
            return -1;
        }
        let value = value.into();
        let preview = self.items.begin_preview_write(target);
        let status = match self.producer_of(target).and_then(|pid| self.producers.get_mut(&pid)) {
            Some(slot) => slot.producer.set_value(&mut self.items, target, value),
            None => 0,
        };
        if let Some(preview) = preview {
            self.items.finish_preview_write(target, preview, status >= 0);
        }
        self.flush_hooks();
        status
    }

    /// Request a named property (`min`, `max`, `defaultValue`, ..)
    pub fn item_property(&mut self, id: ItemId, name: &str, force: bool) -> Value {
        self.flush_hooks();
        let target = self.items.resolve_proxy(id);
        let value = match self.producer_of(target).and_then(|pid| self.producers.get_mut(&pid)) {
            Some(slot) => slot.producer.item_property(&mut self.items, target, name, force),
            None => self.items.request_property(target, name),
        };
        self.flush_hooks();
        value
    }

    /// Write the previewed value, ending preview
    ///
    /// Does nothing unless the item is previewing.
    pub fn commit_preview(&mut self, id: ItemId) -> i32 {
        let target = self.items.resolve_proxy(id);
        let Some(item) = self.items.get(target) else {
            return -1;
        };
        if item.state() != State::Preview {
            return 0;
        }
        let value = item.value().clone();
        self.set_value(target, value)
    }

    /// Abandon a preview and restore the pre-preview value, state and text
    pub fn discard_preview(&mut self, id: ItemId) {
        let target = self.items.resolve_proxy(id);
        self.items.discard_preview(target);
        self.flush_hooks();
    }

    // ========================================================================
    // Production and local reads
    // ========================================================================

    pub fn produce_value(&mut self, id: ItemId, value: impl Into<Value>, state: State) {
        let target = self.items.resolve_proxy(id);
        self.items.produce_value(target, value.into(), state);
        self.flush_hooks();
    }

    pub fn produce_text(&mut self, id: ItemId, text: impl Into<String>, state: State) {
        let target = self.items.resolve_proxy(id);
        self.items.produce_text(target, text, state);
        self.flush_hooks();
    }

    pub fn produce_property(&mut self, id: ItemId, name: &str, value: impl Into<Value>, state: State) {
        let target = self.items.resolve_proxy(id);
        self.items.produce_property(target, name, value.into(), state);
        self.flush_hooks();
    }

    /// Current value without requesting anything
    pub fn local_value(&self, id: ItemId) -> Value {
        self.items
            .get(self.items.resolve_proxy(id))
            .map(|item| item.value().clone())
            .unwrap_or_default()
    }

    /// Current text without requesting anything
    pub fn local_text(&self, id: ItemId) -> String {
        self.items
            .get(self.items.resolve_proxy(id))
            .map(|item| item.text().to_string())
            .unwrap_or_default()
    }

    pub fn state(&self, id: ItemId) -> Option<State> {
        self.items.get(self.items.resolve_proxy(id)).map(|item| item.state())
    }

    pub fn text_state(&self, id: ItemId) -> Option<State> {
        self.items
            .get(self.items.resolve_proxy(id))
            .map(|item| item.text_state())
    }

    // ========================================================================
    // Structure
    // ========================================================================

    pub fn item_get(&self, from: ItemId, path: &str) -> Option<ItemId> {
        self.items.item_get(from, path)
    }

    pub fn item_get_or_create(&mut self, from: ItemId, path: &str, is_leaf: bool) -> Result<ItemId> {
        let result = self.items.item_get_or_create(from, path, is_leaf);
        self.flush_hooks();
        result
    }

    pub fn item_get_or_create_untrusted(&mut self, from: ItemId, path: &str, is_leaf: bool) -> Option<ItemId> {
        let result = self.items.item_get_or_create_untrusted(from, path, is_leaf);
        self.flush_hooks();
        result
    }

    pub fn item_get_or_create_and_produce(&mut self, from: ItemId, path: &str, value: impl Into<Value>) -> Result<ItemId> {
        let result = self.items.item_get_or_create_and_produce(from, path, value.into());
        self.flush_hooks();
        result
    }

    pub fn create_child(&mut self, parent: ItemId, id: &str, is_leaf: bool) -> Result<ItemId> {
        let result = self.items.create_child(parent, id, is_leaf);
        self.flush_hooks();
        result
    }

    pub fn add_child(&mut self, parent: ItemId, id: &str, child: ItemId) -> Result<()> {
        let result = self.items.add_child(parent, id, child);
        self.flush_hooks();
        result
    }

    pub fn add_proxy(&mut self, parent: ItemId, id: &str, source: ItemId) -> Result<ItemId> {
        self.items.add_proxy(parent, id, source)
    }

    pub fn detach(&mut self, id: ItemId) -> Result<()> {
        self.items.detach(id)
    }

    /// Delete an item and its subtree, children first
    pub fn delete(&mut self, id: ItemId) -> Result<()> {
        let result = self.items.delete(id);
        self.flush_hooks();
        result
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// Subscribe to every event of one item
    pub fn subscribe(&mut self, id: ItemId) -> Result<ItemObserver> {
        self.subscribe_with(id, EventMask::ALL)
    }

    /// Subscribe to the events of one item matching `mask`
    pub fn subscribe_with(&mut self, id: ItemId, mask: EventMask) -> Result<ItemObserver> {
        let (tx, rx) = mpsc::channel();
        let sub = self.subscribe_sender(id, mask, tx)?;
        Ok(ItemObserver::new(sub, Some(id), rx))
    }

    /// Subscribe an existing channel, so one receiver can follow many items
    pub fn subscribe_sender(&mut self, id: ItemId, mask: EventMask, tx: mpsc::Sender<ItemEvent>) -> Result<SubscriptionId> {
        let (sub, flipped) = self.items.add_subscriber(id, mask, tx)?;
        if flipped {
            self.notify_watched(id);
        }
        Ok(sub)
    }

    /// Subscribe and get the current value in one step
    ///
    /// The value is requested (not forced) after subscribing, so a fetch it
    /// triggers is observed on the returned observer.
    pub fn subscribe_value_and_changes(&mut self, id: ItemId) -> Result<(Value, ItemObserver)> {
        let observer = self.subscribe(id)?;
        let value = self.get_value(id, false);
        Ok((value, observer))
    }

    pub fn unsubscribe(&mut self, id: ItemId, sub: SubscriptionId) {
        if self.items.remove_subscriber(id, sub) {
            self.notify_watched(id);
        }
    }

    /// Subscribe to every event of every item
    pub fn subscribe_all(&mut self) -> ItemObserver {
        let (tx, rx) = mpsc::channel();
        let sub = self.items.add_global_subscriber(tx);
        ItemObserver::new(sub, None, rx)
    }

    pub fn unsubscribe_all(&mut self, sub: SubscriptionId) {
        self.items.remove_global_subscriber(sub);
    }

    fn notify_watched(&mut self, id: ItemId) {
        let watched = self.items.get(id).map(Item::is_watched).unwrap_or(false);
        if let Some(slot) = self.producer_of(id).and_then(|pid| self.producers.get_mut(&pid)) {
            slot.producer.watched_changed(&mut self.items, id, watched);
        }
        self.flush_hooks();
    }

    // ========================================================================
    // Command inbox
    // ========================================================================

    /// Sender for mutation requests from other threads
    pub fn command_sender(&self) -> CommandSender {
        CommandSender::new(self.commands_tx.clone())
    }

    /// Apply all queued commands, returning how many were processed
    pub fn drain_commands(&mut self) -> usize {
        let mut count = 0;
        while let Ok(command) = self.commands_rx.try_recv() {
            count += 1;
            self.apply_command(command);
        }
        count
    }

    fn apply_command(&mut self, command: TreeCommand) {
        let root = self.root();
        match command {
            TreeCommand::SetValue { path, value } => match self.item_get(root, &path) {
                Some(id) => {
                    if self.set_value(id, value) < 0 {
                        debug!("queued write to {} rejected", path);
                    }
                }
                None => warn!("queued write to unknown item {}", path),
            },
            TreeCommand::ProduceValue { path, value, state } => {
                if let Some(id) = self.item_get_or_create_untrusted(root, &path, true) {
                    self.produce_value(id, value, state);
                }
            }
            TreeCommand::ProduceText { path, text, state } => {
                if let Some(id) = self.item_get_or_create_untrusted(root, &path, true) {
                    self.produce_text(id, text, state);
                }
            }
            TreeCommand::GetOrCreate { path, is_leaf } => {
                self.item_get_or_create_untrusted(root, &path, is_leaf);
            }
            TreeCommand::Delete { path } => match self.item_get(root, &path) {
                Some(id) => {
                    if let Err(err) = self.delete(id) {
                        warn!("queued delete of {} failed: {}", path, err);
                    }
                }
                None => debug!("queued delete of unknown item {}", path),
            },
        }
    }
}
