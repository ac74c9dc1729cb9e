//! Messages exchanged with the bus
//!
//! The producer never talks to a socket. It hands [`MethodCall`]s and
//! [`Signal`]s to a [`BusConnection`](crate::BusConnection) and is fed
//! [`BusEvent`]s by whoever owns the real bus binding.

use crate::error::BusError;
use crate::wire::{ItemMap, PropertyMap, WireValue};

/// Interface of every exported item
pub const BUS_ITEM_INTERFACE: &str = "com.victronenergy.BusItem";
/// Interface of the settings service
pub const SETTINGS_INTERFACE: &str = "com.victronenergy.Settings";
/// Well-known name of the settings service
pub const SETTINGS_SERVICE: &str = "com.victronenergy.settings";
/// Object path of the settings service's `AddSettings`
pub const SETTINGS_PATH: &str = "/Settings";

pub const DBUS_SERVICE: &str = "org.freedesktop.DBus";
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";

/// Signal carrying changes of many items of a service, emitted on `/`
pub const ITEMS_CHANGED: &str = "ItemsChanged";
/// Signal carrying changes of one item, emitted on the item's path
pub const PROPERTIES_CHANGED: &str = "PropertiesChanged";

/// Serial assigned to an outgoing method call, echoed by its reply
pub type Serial = u32;

/// An outgoing method call
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub destination: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub args: Vec<WireValue>,
}

impl MethodCall {
    pub fn new(destination: impl Into<String>, path: impl Into<String>, interface: &str, member: &str) -> Self {
        Self {
            destination: destination.into(),
            path: path.into(),
            interface: interface.to_string(),
            member: member.to_string(),
            args: Vec::new(),
        }
    }

    /// A call on a `com.victronenergy.BusItem` object
    pub fn bus_item(destination: impl Into<String>, path: impl Into<String>, member: &str) -> Self {
        Self::new(destination, path, BUS_ITEM_INTERFACE, member)
    }

    /// A call to the bus daemon itself
    pub fn daemon(member: &str) -> Self {
        Self::new(DBUS_SERVICE, DBUS_PATH, DBUS_INTERFACE, member)
    }

    pub fn with_arg(mut self, arg: WireValue) -> Self {
        self.args.push(arg);
        self
    }
}

/// An outgoing signal
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub path: String,
    pub interface: String,
    pub member: String,
    pub args: Vec<WireValue>,
}

/// A method call received by an exported service
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingCall {
    /// Bus name the call was addressed to
    pub destination: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub args: Vec<WireValue>,
}

impl IncomingCall {
    pub fn new(destination: impl Into<String>, path: impl Into<String>, interface: &str, member: &str) -> Self {
        Self {
            destination: destination.into(),
            path: path.into(),
            interface: interface.to_string(),
            member: member.to_string(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: WireValue) -> Self {
        self.args.push(arg);
        self
    }
}

/// Something the bus delivered to the producer
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// Reply to a call sent with the given serial
    Reply {
        serial: Serial,
        result: Result<Vec<WireValue>, BusError>,
    },
    /// `org.freedesktop.DBus.NameOwnerChanged`
    NameOwnerChanged {
        name: String,
        old_owner: String,
        new_owner: String,
    },
    /// `ItemsChanged` emitted by a service
    ItemsChanged { sender: String, items: ItemMap },
    /// `PropertiesChanged` emitted by one item of a service
    PropertiesChanged {
        sender: String,
        path: String,
        changes: PropertyMap,
    },
}

impl BusEvent {
    pub fn reply(serial: Serial, args: Vec<WireValue>) -> Self {
        BusEvent::Reply {
            serial,
            result: Ok(args),
        }
    }

    pub fn error_reply(serial: Serial, error: BusError) -> Self {
        BusEvent::Reply {
            serial,
            result: Err(error),
        }
    }
}
