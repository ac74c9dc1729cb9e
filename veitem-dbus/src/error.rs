//! Error types for the veitem-dbus crate.

use veitem::TreeError;

/// Errors raised by the D-Bus producer and exporter.
#[derive(Debug, thiserror::Error)]
pub enum DbusError {
    /// A tree operation failed
    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    /// The bus refused a name request
    #[error("Could not request bus name {0}")]
    NameRequest(String),

    /// A message could not be handed to the bus
    #[error("Failed to send message: {0}")]
    Send(String),

    /// A method call had the wrong arguments
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    /// No object at the requested path
    #[error("Unknown object: {0}")]
    UnknownObject(String),

    /// The object does not implement the method
    #[error("Unknown method: {0}")]
    UnknownMethod(String),
}

/// An error reply received from or sent to a remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusError {
    /// D-Bus error name, e.g. `org.freedesktop.DBus.Error.UnknownObject`
    pub name: String,
    pub message: String,
}

impl BusError {
    pub const UNKNOWN_OBJECT: &'static str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_METHOD: &'static str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const INVALID_ARGS: &'static str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const NAME_HAS_NO_OWNER: &'static str = "org.freedesktop.DBus.Error.NameHasNoOwner";

    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn unknown_object(path: &str) -> Self {
        Self::new(Self::UNKNOWN_OBJECT, format!("No object at {}", path))
    }

    pub fn unknown_method(member: &str) -> Self {
        Self::new(Self::UNKNOWN_METHOD, format!("No method {}", member))
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_ARGS, message)
    }

    /// Paths that are not (yet) present are expected and not logged
    pub fn is_unknown_object(&self) -> bool {
        self.name == Self::UNKNOWN_OBJECT
    }
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for BusError {}

impl From<&DbusError> for BusError {
    fn from(err: &DbusError) -> Self {
        match err {
            DbusError::InvalidArgs(msg) => BusError::invalid_args(msg.clone()),
            DbusError::UnknownObject(path) => BusError::unknown_object(path),
            DbusError::UnknownMethod(member) => BusError::unknown_method(member),
            other => BusError::new("org.freedesktop.DBus.Error.Failed", other.to_string()),
        }
    }
}
