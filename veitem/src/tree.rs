//! Item storage and the base item operations
//!
//! [`Items`] is a generational arena holding every node of one tree. Nodes
//! own their children through an insertion-ordered map of ids and keep a
//! plain back-index to their parent; nothing is reference counted. Ids of
//! deleted items never resolve again, which lets transports recognise late
//! replies for items that are gone.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────┐
//!                 │   ItemTree   │  producers, dispatch, command inbox
//!                 └──────┬───────┘
//!                        │ owns
//!                 ┌──────▼───────┐
//!                 │    Items     │  arena, structure, produce/preview,
//!                 └──────┬───────┘  subscriptions
//!                        │
//!          ┌─────────────┼─────────────┐
//!      ┌───▼───┐     ┌───▼───┐     ┌───▼───┐
//!      │ Item  │ ... │ Item  │ ... │ Item  │
//!      └───────┘     └───────┘     └───────┘
//! ```
//!
//! Everything here is the transport independent behavior. Operations whose
//! outcome depends on the producer of an item (`get_value`, `set_value`, ..)
//! live on [`ItemTree`](crate::ItemTree).

use std::fmt;
use std::sync::mpsc;

use tracing::{trace, warn};

use crate::error::{Result, TreeError};
use crate::event::{EventMask, ItemEvent};
use crate::item::{Item, PreviewSlot, Property, Subscriber};
use crate::observer::SubscriptionId;
use crate::producer::ProducerId;
use crate::state::State;
use crate::value::Value;

/// Handle to an item in an [`Items`] arena
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId {
    index: u32,
    generation: u32,
}

impl ItemId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemId({}v{})", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    item: Option<Item>,
}

/// Arena of all items of one tree
#[derive(Debug)]
pub struct Items {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: ItemId,
    global: Vec<(SubscriptionId, mpsc::Sender<ItemEvent>)>,
    /// Attached items whose producer has not been told yet
    created: Vec<ItemId>,
    /// Deleted items whose producer has not been told yet
    removed: Vec<(ProducerId, ItemId)>,
    /// Items that lost their last observer to a closed channel
    unwatched: Vec<ItemId>,
}

/// A preview being written, see [`Items::begin_preview_write`]
#[derive(Debug)]
pub(crate) struct PreviewWrite {
    value: PreviewSlot<Value>,
    text: Option<PreviewSlot<String>>,
}

impl Default for Items {
    fn default() -> Self {
        Self::new()
    }
}

/// Join a parent unique id and a child segment
fn compose_uid(parent_uid: &str, id: &str) -> String {
    if parent_uid.is_empty() {
        id.to_string()
    } else {
        format!("{}/{}", parent_uid, id)
    }
}

fn check_segment(id: &str) -> Result<()> {
    if id.is_empty() || id.contains('/') {
        return Err(TreeError::InvalidSegment(id.to_string()));
    }
    Ok(())
}

/// Split a relative path, tolerating a single leading slash
fn split_path(path: &str) -> Result<Vec<&str>> {
    let path = path.strip_prefix('/').unwrap_or(path);
    if path.is_empty() {
        return Err(TreeError::InvalidPath(path.to_string()));
    }
    let segments: Vec<&str> = path.split('/').collect();
    for segment in &segments {
        check_segment(segment)?;
    }
    Ok(segments)
}

impl Items {
    /// Create an arena containing only a root item
    pub fn new() -> Self {
        let mut items = Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: ItemId::new(0, 0),
            global: Vec::new(),
            created: Vec::new(),
            removed: Vec::new(),
            unwatched: Vec::new(),
        };
        items.root = items.alloc(Item::new(None, false));
        items
    }

    // ========================================================================
    // Storage
    // ========================================================================

    fn alloc(&mut self, item: Item) -> ItemId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.item = Some(item);
            ItemId::new(index, slot.generation)
        } else {
            self.slots.push(Slot {
                generation: 0,
                item: Some(item),
            });
            ItemId::new((self.slots.len() - 1) as u32, 0)
        }
    }

    fn release(&mut self, id: ItemId) -> Option<Item> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let item = slot.item.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(item)
    }

    /// The root item
    pub fn root(&self) -> ItemId {
        self.root
    }

    pub fn get(&self, id: ItemId) -> Option<&Item> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.item.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: ItemId) -> Option<&mut Item> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.item.as_mut())
    }

    fn existing(&self, id: ItemId) -> Result<&Item> {
        self.get(id).ok_or(TreeError::StaleItem(id))
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live items, including the root and detached items
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.item.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a detached item
    ///
    /// The item becomes part of the tree once attached with
    /// [`add_child`](Self::add_child); until then it is only reachable
    /// through the returned id.
    pub fn create_item(&mut self, producer: Option<ProducerId>, is_leaf: bool) -> ItemId {
        self.alloc(Item::new(producer, is_leaf))
    }

    pub(crate) fn take_created(&mut self) -> Vec<ItemId> {
        std::mem::take(&mut self.created)
    }

    pub(crate) fn take_removed(&mut self) -> Vec<(ProducerId, ItemId)> {
        std::mem::take(&mut self.removed)
    }

    pub(crate) fn take_unwatched(&mut self) -> Vec<ItemId> {
        std::mem::take(&mut self.unwatched)
    }

    // ========================================================================
    // Navigation
    // ========================================================================

    pub fn parent(&self, id: ItemId) -> Option<ItemId> {
        self.get(id)?.parent
    }

    /// Direct child by path segment
    pub fn child(&self, id: ItemId, name: &str) -> Option<ItemId> {
        self.get(id)?.children.get(name).copied()
    }

    /// Direct child by position in insertion order
    pub fn child_at(&self, id: ItemId, n: usize) -> Option<ItemId> {
        self.get(id)?.children.get_index(n).map(|(_, child)| *child)
    }

    /// Direct children in insertion order
    pub fn children(&self, id: ItemId) -> Vec<ItemId> {
        self.get(id)
            .map(|item| item.children.values().copied().collect())
            .unwrap_or_default()
    }

    /// Position of the item among its siblings
    pub fn index(&self, id: ItemId) -> Option<usize> {
        let item = self.get(id)?;
        let parent = self.get(item.parent?)?;
        parent.children.get_index_of(item.id.as_str())
    }

    /// Topmost ancestor (the tree root for attached items)
    pub fn item_root(&self, id: ItemId) -> ItemId {
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            current = parent;
        }
        current
    }

    pub fn is_ancestor(&self, ancestor: ItemId, id: ItemId) -> bool {
        let mut current = self.parent(id);
        while let Some(item) = current {
            if item == ancestor {
                return true;
            }
            current = self.parent(item);
        }
        false
    }

    pub fn unique_id(&self, id: ItemId) -> Option<&str> {
        self.get(id).map(|item| item.uid.as_str())
    }

    /// Path of `id` relative to `ancestor`
    ///
    /// `"/"` for the ancestor itself, `"/a/b"` for descendants and an empty
    /// string when `ancestor` is not an ancestor of `id`.
    pub fn rel_id(&self, id: ItemId, ancestor: ItemId) -> String {
        if id == ancestor {
            return "/".to_string();
        }
        let mut segments = Vec::new();
        let mut current = id;
        loop {
            let Some(item) = self.get(current) else {
                return String::new();
            };
            segments.push(item.id.as_str());
            match item.parent {
                Some(parent) if parent == ancestor => break,
                Some(parent) => current = parent,
                None => return String::new(),
            }
        }
        segments.reverse();
        format!("/{}", segments.join("/"))
    }

    // ========================================================================
    // Structure
    // ========================================================================

    /// Attach a detached item under `parent` with path segment `id`
    ///
    /// Emits `ChildAboutToBeAdded` and `ChildAdded` on the parent around the
    /// mutation and recomputes the unique ids of the attached subtree.
    pub fn add_child(&mut self, parent: ItemId, id: &str, child: ItemId) -> Result<()> {
        check_segment(id)?;
        let parent_item = self.existing(parent)?;
        if parent_item.is_leaf {
            return Err(TreeError::LeafParent {
                parent,
                id: id.to_string(),
            });
        }
        if parent_item.children.contains_key(id) {
            return Err(TreeError::DuplicateChild {
                parent,
                id: id.to_string(),
            });
        }
        let child_item = self.existing(child)?;
        if child == self.root || child_item.parent.is_some() {
            return Err(TreeError::AlreadyAttached(child));
        }
        if child == parent || self.is_ancestor(child, parent) {
            return Err(TreeError::InvalidPath(id.to_string()));
        }

        self.emit(parent, ItemEvent::ChildAboutToBeAdded { item: parent, child });

        if let Some(item) = self.get_mut(child) {
            item.id = id.to_string();
            item.parent = Some(parent);
        }
        if let Some(item) = self.get_mut(parent) {
            item.children.insert(id.to_string(), child);
        }
        self.update_uids(child);
        if self.get(child).and_then(|item| item.producer).is_some() {
            self.created.push(child);
        }

        self.emit(parent, ItemEvent::ChildAdded { item: parent, child });
        Ok(())
    }

    /// Recompute cached unique ids of a subtree
    fn update_uids(&mut self, top: ItemId) {
        let mut stack = vec![top];
        while let Some(id) = stack.pop() {
            let parent_uid = self
                .parent(id)
                .and_then(|parent| self.unique_id(parent))
                .unwrap_or("")
                .to_string();
            if let Some(item) = self.get_mut(id) {
                item.uid = compose_uid(&parent_uid, &item.id);
                stack.extend(item.children.values().copied());
            }
        }
    }

    /// Create a child through the parent's producer
    pub fn create_child(&mut self, parent: ItemId, id: &str, is_leaf: bool) -> Result<ItemId> {
        check_segment(id)?;
        let producer = self.existing(parent)?.producer.ok_or(TreeError::NoProducer {
            parent,
            id: id.to_string(),
        })?;
        let child = self.create_item(Some(producer), is_leaf);
        if let Err(err) = self.add_child(parent, id, child) {
            self.release(child);
            return Err(err);
        }
        Ok(child)
    }

    /// Create a leaf child holding a synchronized value
    pub fn create_child_with_value(&mut self, parent: ItemId, id: &str, value: Value) -> Result<ItemId> {
        let child = self.create_child(parent, id, true)?;
        self.produce_value(child, value, State::Synchronized);
        Ok(child)
    }

    /// Look up an item by relative path, never creating anything
    pub fn item_get(&self, from: ItemId, path: &str) -> Option<ItemId> {
        let segments = split_path(path).ok()?;
        let mut current = from;
        for segment in segments {
            current = self.child(current, segment)?;
        }
        Some(current)
    }

    /// Resolve a relative path, creating missing items
    ///
    /// Intermediate items are created as non-leaf items, the last one with
    /// `is_leaf`. Calling this twice with the same path returns the same
    /// item and creates nothing the second time.
    pub fn item_get_or_create(&mut self, from: ItemId, path: &str, is_leaf: bool) -> Result<ItemId> {
        let segments = split_path(path)?;
        self.existing(from)?;
        let last = segments.len() - 1;
        let mut current = from;
        for (n, segment) in segments.into_iter().enumerate() {
            current = match self.child(current, segment) {
                Some(child) => child,
                None => self.create_child(current, segment, n == last && is_leaf)?,
            };
        }
        Ok(current)
    }

    /// Variant of [`item_get_or_create`](Self::item_get_or_create) for paths
    /// that come from outside, e.g. a protocol message
    ///
    /// Failures are logged and yield `None` instead of an error.
    pub fn item_get_or_create_untrusted(&mut self, from: ItemId, path: &str, is_leaf: bool) -> Option<ItemId> {
        match self.item_get_or_create(from, path, is_leaf) {
            Ok(id) => Some(id),
            Err(err) => {
                warn!("rejected item path {:?}: {}", path, err);
                None
            }
        }
    }

    /// Resolve or create a leaf item and produce a synchronized value on it
    pub fn item_get_or_create_and_produce(&mut self, from: ItemId, path: &str, value: Value) -> Result<ItemId> {
        let id = self.item_get_or_create(from, path, true)?;
        self.produce_value(id, value, State::Synchronized);
        Ok(id)
    }

    /// Detach an item from its parent without destroying it
    ///
    /// The subtree stays alive and can be attached somewhere else with
    /// [`add_child`](Self::add_child) or destroyed with
    /// [`delete`](Self::delete).
    pub fn detach(&mut self, id: ItemId) -> Result<()> {
        if id == self.root {
            return Err(TreeError::RootItem);
        }
        let Some(parent) = self.existing(id)?.parent else {
            return Ok(());
        };

        self.emit(parent, ItemEvent::ChildAboutToBeRemoved { item: parent, child: id });

        let name = self.get(id).map(|item| item.id.clone()).unwrap_or_default();
        if let Some(item) = self.get_mut(parent) {
            item.children.shift_remove(&name);
        }
        if let Some(item) = self.get_mut(id) {
            item.parent = None;
        }
        self.update_uids(id);

        self.emit(parent, ItemEvent::ChildRemoved { item: parent, child: id });
        Ok(())
    }

    /// Destroy an item and its whole subtree
    ///
    /// Children are deleted before their parent, so removal notifications
    /// for the deepest items arrive strictly before those of their
    /// ancestors. This is the only way items leave the tree for good.
    pub fn delete(&mut self, id: ItemId) -> Result<()> {
        if id == self.root {
            return Err(TreeError::RootItem);
        }
        let children: Vec<ItemId> = self.existing(id)?.children.values().copied().collect();
        for child in children {
            self.delete(child)?;
        }
        self.detach(id)?;

        let Some(item) = self.release(id) else {
            return Err(TreeError::StaleItem(id));
        };
        trace!("deleted item {:?} ({})", id, item.uid);
        if let Some(source) = item.proxy_source {
            if let Some(source) = self.get_mut(source) {
                source.proxies.retain(|proxy| *proxy != id);
            }
        }
        for proxy in item.proxies {
            if let Some(proxy) = self.get_mut(proxy) {
                proxy.proxy_source = None;
            }
        }
        self.created.retain(|created| *created != id);
        if let Some(producer) = item.producer {
            self.removed.push((producer, id));
        }
        Ok(())
    }

    // ========================================================================
    // Traversal
    // ========================================================================

    fn collect_parent_first(&self, id: ItemId, out: &mut Vec<ItemId>) {
        if let Some(item) = self.get(id) {
            out.push(id);
            for child in item.children.values() {
                self.collect_parent_first(*child, out);
            }
        }
    }

    fn collect_child_first(&self, id: ItemId, out: &mut Vec<ItemId>) {
        if let Some(item) = self.get(id) {
            for child in item.children.values() {
                self.collect_child_first(*child, out);
            }
            out.push(id);
        }
    }

    /// All items below `id`, parent first, excluding `id` itself
    pub fn descendants(&self, id: ItemId) -> Vec<ItemId> {
        let mut out = Vec::new();
        self.collect_parent_first(id, &mut out);
        if !out.is_empty() {
            out.remove(0);
        }
        out
    }

    /// Visit `id` and its subtree, children before their parent
    pub fn foreach_child_first(&self, id: ItemId, mut f: impl FnMut(ItemId, &Item)) {
        let mut order = Vec::new();
        self.collect_child_first(id, &mut order);
        for id in order {
            if let Some(item) = self.get(id) {
                f(id, item);
            }
        }
    }

    /// Visit `id` and its subtree, parents before their children
    pub fn foreach_parent_first(&self, id: ItemId, mut f: impl FnMut(ItemId, &Item)) {
        let mut order = Vec::new();
        self.collect_parent_first(id, &mut order);
        for id in order {
            if let Some(item) = self.get(id) {
                f(id, item);
            }
        }
    }

    /// Visit every descendant of `id`, parents first
    pub fn for_all_children(&self, id: ItemId, mut f: impl FnMut(ItemId, &Item)) {
        for id in self.descendants(id) {
            if let Some(item) = self.get(id) {
                f(id, item);
            }
        }
    }

    /// Mutating child-first traversal over a snapshot of the subtree
    ///
    /// Items deleted by the callback are skipped when their turn comes.
    pub fn foreach_child_first_safe(&mut self, id: ItemId, mut f: impl FnMut(&mut Items, ItemId)) {
        let mut order = Vec::new();
        self.collect_child_first(id, &mut order);
        for id in order {
            if self.contains(id) {
                f(self, id);
            }
        }
    }

    /// Mutating parent-first traversal over a snapshot of the subtree
    pub fn foreach_parent_first_safe(&mut self, id: ItemId, mut f: impl FnMut(&mut Items, ItemId)) {
        let mut order = Vec::new();
        self.collect_parent_first(id, &mut order);
        for id in order {
            if self.contains(id) {
                f(self, id);
            }
        }
    }

    /// Mutating traversal of all descendants over a snapshot
    pub fn for_all_children_safe(&mut self, id: ItemId, mut f: impl FnMut(&mut Items, ItemId)) {
        for id in self.descendants(id) {
            if self.contains(id) {
                f(self, id);
            }
        }
    }

    // ========================================================================
    // Value and text
    // ========================================================================

    /// Set the value state, emitting `StateChanged` when it differs
    pub fn set_state(&mut self, id: ItemId, state: State) {
        let Some(item) = self.get_mut(id) else { return };
        if item.state == state {
            return;
        }
        item.state = state;
        self.emit(id, ItemEvent::StateChanged { item: id, state });
    }

    /// Set the text state, emitting `TextStateChanged` when it differs
    pub fn set_text_state(&mut self, id: ItemId, state: State) {
        let Some(item) = self.get_mut(id) else { return };
        if item.text_state == state {
            return;
        }
        item.text_state = state;
        self.emit(id, ItemEvent::TextStateChanged { item: id, state });
    }

    /// Authoritatively update the value from below
    pub fn produce_value(&mut self, id: ItemId, value: Value, state: State) {
        self.produce_value_with(id, value, state, false);
    }

    /// Update the value, optionally emitting `ValueChanged` even when equal
    ///
    /// While the item is previewing the update is buffered instead of
    /// applied. Producing a `Preview` state is only accepted on a
    /// synchronized item; it snapshots the current value, state and text so
    /// [`discard_preview`](Self::discard_preview) can restore them.
    pub fn produce_value_with(&mut self, id: ItemId, value: Value, state: State, force_changed: bool) {
        let Some(item) = self.get_mut(id) else { return };

        if item.state == State::Preview {
            if let Some(slot) = item.preview.as_mut() {
                slot.buffered = Some((value, state));
            }
            return;
        }

        if state == State::Preview {
            if item.state != State::Synchronized {
                trace!("ignoring preview of unsynchronized item {:?}", id);
                return;
            }
            let text = value.to_text();
            self.produce_text(id, text, State::Preview);
            let Some(item) = self.get_mut(id) else { return };
            item.preview = Some(PreviewSlot {
                saved: item.value.clone(),
                state: item.state,
                buffered: None,
            });
        }

        let Some(item) = self.get_mut(id) else { return };
        let value_changed = force_changed || item.value != value;
        let state_changed = item.state != state;
        let seen_changed = !item.seen && state == State::Synchronized;

        if value.is_valid() && state != State::Preview {
            item.last_valid_value = value.clone();
        }
        if value_changed {
            item.value = value.clone();
        }
        item.state = state;
        if seen_changed {
            item.seen = true;
        }

        if seen_changed {
            self.emit(id, ItemEvent::SeenChanged { item: id });
        }
        if state_changed {
            self.emit(id, ItemEvent::StateChanged { item: id, state });
        }
        if value_changed {
            self.emit(id, ItemEvent::ValueChanged { item: id, value });
        }
    }

    /// Authoritatively update the text from below
    ///
    /// Independent of the value: its own state, preview slot and last valid
    /// copy.
    pub fn produce_text(&mut self, id: ItemId, text: impl Into<String>, state: State) {
        let text = text.into();
        let Some(item) = self.get_mut(id) else { return };

        if item.text_state == State::Preview {
            if let Some(slot) = item.text_preview.as_mut() {
                slot.buffered = Some((text, state));
            }
            return;
        }

        if state == State::Preview {
            item.text_preview = Some(PreviewSlot {
                saved: item.text.clone(),
                state: item.text_state,
                buffered: None,
            });
        }

        let text_changed = item.text != text;
        let state_changed = item.text_state != state;
        if !text.is_empty() && state != State::Preview {
            item.last_valid_text = text.clone();
        }
        item.text_state = state;
        if text_changed {
            item.text = text.clone();
        }

        if state_changed {
            self.emit(id, ItemEvent::TextStateChanged { item: id, state });
        }
        if text_changed {
            self.emit(id, ItemEvent::TextChanged { item: id, text });
        }
    }

    /// Base value request: move an idle item to `Requested`
    ///
    /// Returns the value known right now. An item already `Requested` is
    /// left alone, so a second forced request does not start another fetch.
    pub fn request_value(&mut self, id: ItemId, force: bool) -> Value {
        let Some(item) = self.get(id) else {
            return Value::Invalid;
        };
        let state = item.state;
        let value = item.value.clone();
        if (force || state == State::Idle) && !matches!(state, State::Requested | State::Preview) {
            self.set_state(id, State::Requested);
        }
        value
    }

    /// Base text request, the text analogue of [`request_value`](Self::request_value)
    pub fn request_text(&mut self, id: ItemId, force: bool) -> String {
        let Some(item) = self.get(id) else {
            return String::new();
        };
        let state = item.text_state;
        let text = item.text.clone();
        if (force || state == State::Idle) && !matches!(state, State::Requested | State::Preview) {
            self.set_text_state(id, State::Requested);
        }
        text
    }

    /// Leave preview for a write, without telling observers yet
    ///
    /// The value and text states fall back to the ones captured when
    /// preview began, so the producer judges the write against them.
    /// Observers keep seeing `Preview` until
    /// [`finish_preview_write`](Self::finish_preview_write) settles it.
    pub(crate) fn begin_preview_write(&mut self, id: ItemId) -> Option<PreviewWrite> {
        let item = self.get_mut(id)?;
        if item.state != State::Preview {
            return None;
        }
        let value = item.preview.take()?;
        let text = item.text_preview.take();
        item.state = value.state;
        if let Some(slot) = &text {
            if item.text_state == State::Preview {
                item.text_state = slot.state;
            }
        }
        Some(PreviewWrite { value, text })
    }

    /// Settle a write started by [`begin_preview_write`](Self::begin_preview_write)
    ///
    /// An accepted write keeps the previewed value and announces whatever
    /// state the producer left the item in; updates buffered while
    /// previewing are superseded by the write. A rejected write restores
    /// the pre-preview value, text and states and then applies the buffered
    /// updates, so nothing unconfirmed stays behind.
    pub(crate) fn finish_preview_write(&mut self, id: ItemId, write: PreviewWrite, accepted: bool) {
        let PreviewWrite { value, text } = write;
        if !accepted {
            let text_buffered = text.as_ref().and_then(|slot| slot.buffered.clone());
            let value_buffered = value.buffered.clone();
            self.restore_preview(id, value, text);
            if let Some((value, state)) = value_buffered {
                self.produce_value(id, value, state);
            }
            if let Some((text, state)) = text_buffered {
                self.produce_text(id, text, state);
            }
            return;
        }

        let Some(item) = self.get_mut(id) else { return };
        // A state the producer did not change was never announced
        if item.state == value.state {
            let state = item.state;
            self.emit(id, ItemEvent::StateChanged { item: id, state });
        }
        let Some(slot) = text else { return };
        let Some(item) = self.get_mut(id) else { return };
        if item.text_state == slot.state {
            item.text_state = State::Idle;
            self.emit(id, ItemEvent::TextStateChanged { item: id, state: State::Idle });
        }
    }

    /// Abandon a preview, restoring value, state, text and text state
    ///
    /// All four change notifications are emitted. Updates that arrived while
    /// previewing are dropped with the preview.
    pub fn discard_preview(&mut self, id: ItemId) {
        let Some(item) = self.get_mut(id) else { return };
        if item.state != State::Preview {
            return;
        }
        let Some(value) = item.preview.take() else { return };
        let text = item.text_preview.take();
        self.restore_preview(id, value, text);
    }

    fn restore_preview(&mut self, id: ItemId, value: PreviewSlot<Value>, text: Option<PreviewSlot<String>>) {
        let Some(item) = self.get_mut(id) else { return };
        item.value = value.saved;
        item.state = value.state;
        if let Some(slot) = text {
            item.text = slot.saved;
            item.text_state = slot.state;
        }

        let value = item.value.clone();
        let state = item.state;
        let text = item.text.clone();
        let text_state = item.text_state;
        self.emit(id, ItemEvent::StateChanged { item: id, state });
        self.emit(id, ItemEvent::ValueChanged { item: id, value });
        self.emit(id, ItemEvent::TextStateChanged { item: id, state: text_state });
        self.emit(id, ItemEvent::TextChanged { item: id, text });
    }

    // ========================================================================
    // Properties
    // ========================================================================

    /// Base property request: an idle property becomes `Requested`
    pub fn request_property(&mut self, id: ItemId, name: &str) -> Value {
        let Some(item) = self.get_mut(id) else {
            return Value::Invalid;
        };
        let property = item.properties.entry(name.to_string()).or_default();
        if property.state == State::Idle {
            property.state = State::Requested;
        }
        property.value.clone()
    }

    pub fn set_property_state(&mut self, id: ItemId, name: &str, state: State) {
        if let Some(item) = self.get_mut(id) {
            item.properties.entry(name.to_string()).or_default().state = state;
        }
    }

    /// Authoritatively update a named property
    pub fn produce_property(&mut self, id: ItemId, name: &str, value: Value, state: State) {
        let Some(item) = self.get_mut(id) else { return };
        let property = item.properties.entry(name.to_string()).or_insert_with(Property::default);
        property.state = state;
        if property.value == value {
            return;
        }
        property.value = value.clone();
        self.emit(
            id,
            ItemEvent::PropertyChanged {
                item: id,
                name: name.to_string(),
                value,
            },
        );
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Register a subscriber on one item
    ///
    /// Returns the subscription and whether the watched flag flipped.
    pub(crate) fn add_subscriber(
        &mut self,
        id: ItemId,
        mask: EventMask,
        tx: mpsc::Sender<ItemEvent>,
    ) -> Result<(SubscriptionId, bool)> {
        let item = self.get_mut(id).ok_or(TreeError::StaleItem(id))?;
        let was_watched = item.is_watched();
        let sub = SubscriptionId::next();
        item.subscribers.push(Subscriber { id: sub, mask, tx });
        Ok((sub, was_watched != item.is_watched()))
    }

    /// Remove a subscriber, returning whether the watched flag flipped
    pub(crate) fn remove_subscriber(&mut self, id: ItemId, sub: SubscriptionId) -> bool {
        let Some(item) = self.get_mut(id) else {
            return false;
        };
        let was_watched = item.is_watched();
        item.subscribers.retain(|s| s.id != sub);
        was_watched != item.is_watched()
    }

    pub(crate) fn add_global_subscriber(&mut self, tx: mpsc::Sender<ItemEvent>) -> SubscriptionId {
        let sub = SubscriptionId::next();
        self.global.push((sub, tx));
        sub
    }

    pub(crate) fn remove_global_subscriber(&mut self, sub: SubscriptionId) {
        self.global.retain(|(id, _)| *id != sub);
    }

    /// Deliver an event to the item's subscribers, the tree-wide
    /// subscribers and the item's proxies
    ///
    /// Subscribers whose receiving end is gone are dropped. An item losing
    /// its last observer that way is queued for
    /// [`take_unwatched`](Self::take_unwatched).
    pub(crate) fn emit(&mut self, id: ItemId, event: ItemEvent) {
        let kind = event.kind();
        let mut unwatched = false;
        let proxies = match self.get_mut(id) {
            Some(item) => {
                let was_watched = item.is_watched();
                item.subscribers
                    .retain(|s| !s.mask.intersects(kind) || s.tx.send(event.clone()).is_ok());
                unwatched = was_watched && !item.is_watched();
                item.proxies.clone()
            }
            None => Vec::new(),
        };
        if unwatched {
            self.unwatched.push(id);
        }
        self.global.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        for proxy in proxies {
            if let Some(event) = event.reemitted_by(proxy) {
                self.emit(proxy, event);
            }
        }
    }

    // ========================================================================
    // Proxies
    // ========================================================================

    /// Attach a leaf under `parent` mirroring `source`
    ///
    /// The proxy re-emits value, text, state and property changes of the
    /// source as its own; reads and writes on the tree are forwarded.
    pub fn add_proxy(&mut self, parent: ItemId, id: &str, source: ItemId) -> Result<ItemId> {
        self.existing(source)?;
        let proxy = self.create_item(None, true);
        if let Some(item) = self.get_mut(proxy) {
            item.proxy_source = Some(source);
        }
        if let Err(err) = self.add_child(parent, id, proxy) {
            self.release(proxy);
            return Err(err);
        }
        if let Some(item) = self.get_mut(source) {
            item.proxies.push(proxy);
        }
        Ok(proxy)
    }

    /// Follow proxy links to the item that actually holds the data
    pub fn resolve_proxy(&self, id: ItemId) -> ItemId {
        let mut current = id;
        while let Some(source) = self.get(current).and_then(|item| item.proxy_source) {
            current = source;
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn tree_with_producer() -> (Items, ItemId) {
        let mut items = Items::new();
        let root = items.root();
        let top = items.create_item(Some(ProducerId::new(0)), false);
        items.add_child(root, "pub", top).unwrap();
        (items, top)
    }

    #[test]
    fn test_root_has_empty_uid() {
        let items = Items::new();
        assert_eq!(items.unique_id(items.root()), Some(""));
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn test_uid_composition() {
        let (mut items, top) = tree_with_producer();
        let soc = items.item_get_or_create(top, "Battery/Soc", true).unwrap();
        assert_eq!(items.unique_id(top), Some("pub"));
        assert_eq!(items.unique_id(soc), Some("pub/Battery/Soc"));
        assert!(items.get(soc).unwrap().is_leaf());
        let battery = items.parent(soc).unwrap();
        assert!(!items.get(battery).unwrap().is_leaf());
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let (mut items, top) = tree_with_producer();
        let first = items.item_get_or_create(top, "/a/b/c", true).unwrap();
        let count = items.len();
        let second = items.item_get_or_create(top, "a/b/c", true).unwrap();
        assert_eq!(first, second);
        assert_eq!(items.len(), count);
    }

    #[test]
    fn test_item_get_never_creates() {
        let (mut items, top) = tree_with_producer();
        assert_eq!(items.item_get(top, "x/y"), None);
        assert_eq!(items.len(), 2);
        let y = items.item_get_or_create(top, "x/y", true).unwrap();
        assert_eq!(items.item_get(top, "/x/y"), Some(y));
        assert_eq!(items.item_get(items.root(), "pub/x/y"), Some(y));
    }

    #[test]
    fn test_create_without_producer_fails() {
        let mut items = Items::new();
        let root = items.root();
        let err = items.item_get_or_create(root, "a", true).unwrap_err();
        assert!(matches!(err, TreeError::NoProducer { .. }));
        assert_eq!(items.item_get_or_create_untrusted(root, "a", true), None);
    }

    #[rstest]
    #[case::empty_segment("a//b")]
    #[case::empty_path("")]
    #[case::only_slash("/")]
    #[case::trailing_slash("a/")]
    fn test_invalid_paths_rejected(#[case] path: &str) {
        let (mut items, top) = tree_with_producer();
        assert!(items.item_get_or_create(top, path, true).is_err());
        assert_eq!(items.item_get_or_create_untrusted(top, path, true), None);
        assert_eq!(items.item_get(top, path), None);
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_leaf_rejects_children() {
        let (mut items, top) = tree_with_producer();
        let leaf = items.item_get_or_create(top, "leaf", true).unwrap();
        let err = items.create_child(leaf, "x", true).unwrap_err();
        assert!(matches!(err, TreeError::LeafParent { .. }));
        assert_eq!(items.item_get_or_create_untrusted(top, "leaf/x", true), None);
    }

    #[test]
    fn test_rel_id() {
        let (mut items, top) = tree_with_producer();
        let soc = items.item_get_or_create(top, "Battery/Soc", true).unwrap();
        let other = items.item_get_or_create(top, "Other", true).unwrap();
        assert_eq!(items.rel_id(soc, top), "/Battery/Soc");
        assert_eq!(items.rel_id(top, top), "/");
        assert_eq!(items.rel_id(soc, other), "");
    }

    #[test]
    fn test_children_keep_insertion_order() {
        let (mut items, top) = tree_with_producer();
        for name in ["z", "a", "m"] {
            items.create_child(top, name, true).unwrap();
        }
        let names: Vec<String> = items
            .get(top)
            .unwrap()
            .children()
            .map(|(name, _)| name.to_string())
            .collect();
        assert_eq!(names, vec!["z", "a", "m"]);
        let a = items.child(top, "a").unwrap();
        assert_eq!(items.index(a), Some(1));
        assert_eq!(items.child_at(top, 2), items.child(top, "m"));
    }

    #[test]
    fn test_reparent_recomputes_uids() {
        let (mut items, top) = tree_with_producer();
        let a = items.item_get_or_create(top, "a/x", true).unwrap();
        let a_parent = items.parent(a).unwrap();
        let b = items.create_child(top, "b", false).unwrap();

        items.detach(a_parent).unwrap();
        assert_eq!(items.item_get(top, "a"), None);
        assert_eq!(items.unique_id(a), Some("a/x"));

        items.add_child(b, "moved", a_parent).unwrap();
        assert_eq!(items.unique_id(a), Some("pub/b/moved/x"));
    }

    #[test]
    fn test_cannot_attach_into_own_subtree() {
        let (mut items, top) = tree_with_producer();
        let leaf = items.item_get_or_create(top, "a/b/c", true).unwrap();
        let a = items.child(top, "a").unwrap();
        let b = items.parent(leaf).unwrap();
        items.detach(a).unwrap();
        assert!(items.add_child(b, "loop", a).is_err());
    }

    #[test]
    fn test_delete_removes_subtree_and_invalidates_ids() {
        let (mut items, top) = tree_with_producer();
        let c = items.item_get_or_create(top, "a/b/c", true).unwrap();
        let a = items.child(top, "a").unwrap();
        let before = items.len();

        items.delete(a).unwrap();
        assert!(!items.contains(a));
        assert!(!items.contains(c));
        assert_eq!(items.len(), before - 3);
        assert_eq!(items.item_get(top, "a"), None);

        // Slots are reused with a new generation
        let again = items.item_get_or_create(top, "a", true).unwrap();
        assert!(!items.contains(c));
        assert!(items.contains(again));
    }

    #[test]
    fn test_delete_root_is_rejected() {
        let mut items = Items::new();
        let root = items.root();
        assert_eq!(items.delete(root), Err(TreeError::RootItem));
    }

    #[test]
    fn test_traversal_orders() {
        let (mut items, top) = tree_with_producer();
        items.item_get_or_create(top, "a/b", true).unwrap();
        items.item_get_or_create(top, "c", true).unwrap();

        let mut parent_first = Vec::new();
        items.foreach_parent_first(top, |_, item| parent_first.push(item.id().to_string()));
        assert_eq!(parent_first, vec!["pub", "a", "b", "c"]);

        let mut child_first = Vec::new();
        items.foreach_child_first(top, |_, item| child_first.push(item.id().to_string()));
        assert_eq!(child_first, vec!["b", "a", "c", "pub"]);

        let mut all = Vec::new();
        items.for_all_children(top, |_, item| all.push(item.id().to_string()));
        assert_eq!(all, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_safe_traversal_tolerates_deletion() {
        let (mut items, top) = tree_with_producer();
        items.item_get_or_create(top, "a/b", true).unwrap();
        items.item_get_or_create(top, "c", true).unwrap();

        let mut visited = 0;
        items.foreach_parent_first_safe(top, |items, id| {
            visited += 1;
            if items.get(id).map(|item| item.id() == "a").unwrap_or(false) {
                items.delete(id).unwrap();
            }
        });
        // pub, a, c; b went away with a
        assert_eq!(visited, 3);
        assert_eq!(items.descendants(top).len(), 1);
    }

    #[test]
    fn test_request_value_marks_requested_once() {
        let (mut items, top) = tree_with_producer();
        let leaf = items.create_child(top, "v", true).unwrap();
        assert_eq!(items.request_value(leaf, false), Value::Invalid);
        assert_eq!(items.get(leaf).unwrap().state(), State::Requested);

        items.produce_value(leaf, Value::from(3), State::Synchronized);
        assert_eq!(items.request_value(leaf, false), Value::from(3));
        assert_eq!(items.get(leaf).unwrap().state(), State::Synchronized);
        items.request_value(leaf, true);
        assert_eq!(items.get(leaf).unwrap().state(), State::Requested);
    }

    #[test]
    fn test_property_production() {
        let (mut items, top) = tree_with_producer();
        let leaf = items.create_child(top, "v", true).unwrap();
        assert_eq!(items.request_property(leaf, crate::item::MAX), Value::Invalid);
        assert_eq!(
            items.get(leaf).unwrap().property(crate::item::MAX).unwrap().state,
            State::Requested
        );
        items.produce_property(leaf, crate::item::MAX, Value::from(100), State::Synchronized);
        let prop = items.get(leaf).unwrap().property(crate::item::MAX).unwrap();
        assert_eq!(prop.value, Value::from(100));
        assert_eq!(prop.state, State::Synchronized);
    }
}
