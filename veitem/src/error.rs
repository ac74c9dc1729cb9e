//! Error types for the veitem crate.
//!
//! Only synchronous, structural misuse of the tree is reported through
//! [`TreeError`]. Transport failures never show up here: they are delivered
//! as [`State::Offline`](crate::State::Offline) transitions on the affected
//! items.

use crate::tree::ItemId;

/// Result type for tree operations
pub type Result<T> = std::result::Result<T, TreeError>;

/// Errors raised by structural tree operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    /// A path could not be resolved to an item
    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    /// A single path segment is empty or contains a separator
    #[error("Invalid path segment: {0:?}")]
    InvalidSegment(String),

    /// Creating a child requires the parent to have a producer
    #[error("No producer to create child {id:?} under {parent:?}")]
    NoProducer {
        /// The parent without producer
        parent: ItemId,
        /// The id of the child that was requested
        id: String,
    },

    /// Leaf items can not have children
    #[error("Cannot add child {id:?} to leaf item {parent:?}")]
    LeafParent {
        /// The leaf item
        parent: ItemId,
        /// The rejected child id
        id: String,
    },

    /// A sibling with the same id already exists
    #[error("Duplicate child id {id:?} under {parent:?}")]
    DuplicateChild {
        /// The parent item
        parent: ItemId,
        /// The duplicated id
        id: String,
    },

    /// The item already has a parent
    #[error("Item {0:?} is already attached to a parent")]
    AlreadyAttached(ItemId),

    /// The item id no longer refers to a live item
    #[error("Item {0:?} does not exist")]
    StaleItem(ItemId),

    /// The operation is not allowed on the root item
    #[error("Operation not allowed on the root item")]
    RootItem,

    /// No producer with this id is registered
    #[error("Producer {0:?} not found")]
    ProducerNotFound(crate::producer::ProducerId),

    /// The tree owning the command inbox was dropped
    #[error("Item tree closed")]
    Closed,
}
