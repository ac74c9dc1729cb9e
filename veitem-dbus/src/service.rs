//! Binding between a bus name and its service item

use veitem::ItemId;

/// What the producer knows about one remote service
///
/// `owner` is the unique connection name currently owning the service's
/// well-known name; empty while the service is not registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceBinding {
    pub name: String,
    pub owner: String,
    /// The service item, once one is attached under the producer root
    pub root: Option<ItemId>,
    /// A bulk `GetItems` is in flight
    pub get_items_active: bool,
}

impl ServiceBinding {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: String::new(),
            root: None,
            get_items_active: false,
        }
    }

    pub fn is_registered(&self) -> bool {
        !self.owner.is_empty()
    }

    /// Signals may name either the well-known name or the unique owner
    pub fn is_sender(&self, sender: &str) -> bool {
        sender == self.name || (!self.owner.is_empty() && sender == self.owner)
    }
}
