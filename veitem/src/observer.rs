//! Blocking and non-blocking consumption of item events
//!
//! Subscriptions deliver [`ItemEvent`]s over `std::sync::mpsc`, so observers
//! can live on any thread while the tree stays single-owner:
//! - Blocking: `recv()`, `for event in observer`
//! - Non-blocking: `try_recv()`, `try_iter()`, `drain()`
//! - Timeout: `recv_timeout()`, `timeout_iter()`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use crate::event::ItemEvent;
use crate::tree::ItemId;

/// Handle identifying one subscription, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SubscriptionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Receiving end of an item (or tree-wide) subscription
///
/// # Example
///
/// ```rust,ignore
/// let observer = tree.subscribe(item);
/// tree.produce_value(item, 42.into(), State::Synchronized);
///
/// for event in observer.try_iter() {
///     println!("{:?}", event);
/// }
/// ```
pub struct ItemObserver {
    id: SubscriptionId,
    item: Option<ItemId>,
    rx: mpsc::Receiver<ItemEvent>,
}

impl ItemObserver {
    pub(crate) fn new(id: SubscriptionId, item: Option<ItemId>, rx: mpsc::Receiver<ItemEvent>) -> Self {
        Self { id, item, rx }
    }

    /// The subscription handle
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The observed item, `None` for tree-wide subscriptions
    pub fn item(&self) -> Option<ItemId> {
        self.item
    }

    /// Block until the next event is available
    ///
    /// Returns `None` once the subscription is gone.
    pub fn recv(&self) -> Option<ItemEvent> {
        self.rx.recv().ok()
    }

    /// Block until the next event or timeout expires
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ItemEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&self) -> Option<ItemEvent> {
        self.rx.try_recv().ok()
    }

    /// Non-blocking iterator over currently queued events
    pub fn try_iter(&self) -> TryIter<'_> {
        TryIter { inner: self }
    }

    /// Collect all currently queued events
    pub fn drain(&self) -> Vec<ItemEvent> {
        self.try_iter().collect()
    }

    /// Blocking iterator that stops after `timeout` without events
    pub fn timeout_iter(&self, timeout: Duration) -> TimeoutIter<'_> {
        TimeoutIter {
            inner: self,
            timeout,
        }
    }
}

impl Iterator for ItemObserver {
    type Item = ItemEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

/// Non-blocking iterator over currently available events
pub struct TryIter<'a> {
    inner: &'a ItemObserver,
}

impl<'a> Iterator for TryIter<'a> {
    type Item = ItemEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.try_recv()
    }
}

/// Blocking iterator with timeout
pub struct TimeoutIter<'a> {
    inner: &'a ItemObserver,
    timeout: Duration,
}

impl<'a> Iterator for TimeoutIter<'a> {
    type Item = ItemEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.recv_timeout(self.timeout)
    }
}
