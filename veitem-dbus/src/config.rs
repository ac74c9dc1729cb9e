//! Producer configuration
//!
//! Which bus to talk to is up to the task owning the bus binding; the
//! producer only sees a [`BusConnection`](crate::BusConnection).

/// Prefix of the services mirrored by default
pub const VICTRON_PREFIX: &str = "com.victronenergy.";

/// Configuration for [`DbusProducer`](crate::DbusProducer)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbusConfig {
    /// List the bus on attach and follow services with `service_prefix`
    pub find_victron_services: bool,
    /// Fetch all items of a service with one `GetItems` on registration
    pub bulk_init: bool,
    /// Create items for paths reported by a service that are not in the tree
    pub auto_create_items: bool,
    pub service_prefix: String,
}

impl Default for DbusConfig {
    fn default() -> Self {
        Self {
            find_victron_services: true,
            bulk_init: true,
            auto_create_items: true,
            service_prefix: VICTRON_PREFIX.to_string(),
        }
    }
}

impl DbusConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_find_victron_services(mut self, enabled: bool) -> Self {
        self.find_victron_services = enabled;
        self
    }

    pub fn with_bulk_init(mut self, enabled: bool) -> Self {
        self.bulk_init = enabled;
        self
    }

    pub fn with_auto_create_items(mut self, enabled: bool) -> Self {
        self.auto_create_items = enabled;
        self
    }

    pub fn with_service_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.service_prefix = prefix.into();
        self
    }

    /// Whether a bus name is one of the services this producer follows
    pub fn is_followed(&self, name: &str) -> bool {
        name.starts_with(&self.service_prefix)
    }
}
