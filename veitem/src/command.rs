//! Cross-thread inbox for tree mutations
//!
//! The tree has a single owner. Other threads request mutations by sending
//! a [`TreeCommand`] through a [`CommandSender`]; the owner applies them in
//! order with [`ItemTree::drain_commands`](crate::ItemTree::drain_commands)
//! once per turn of its loop.

use std::sync::mpsc;

use crate::error::TreeError;
use crate::state::State;
use crate::value::Value;

/// A mutation requested from another thread
///
/// Paths are relative to the tree root and treated as untrusted input.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeCommand {
    /// Write a value through the item's producer
    SetValue { path: String, value: Value },
    /// Produce a value, creating the item if needed
    ProduceValue { path: String, value: Value, state: State },
    /// Produce a text, creating the item if needed
    ProduceText { path: String, text: String, state: State },
    /// Make sure an item exists
    GetOrCreate { path: String, is_leaf: bool },
    /// Delete an item and its subtree
    Delete { path: String },
}

impl TreeCommand {
    pub fn path(&self) -> &str {
        match self {
            TreeCommand::SetValue { path, .. }
            | TreeCommand::ProduceValue { path, .. }
            | TreeCommand::ProduceText { path, .. }
            | TreeCommand::GetOrCreate { path, .. }
            | TreeCommand::Delete { path } => path,
        }
    }
}

/// Cloneable sending half of a tree's command inbox
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<TreeCommand>,
}

impl CommandSender {
    pub(crate) fn new(tx: mpsc::Sender<TreeCommand>) -> Self {
        Self { tx }
    }

    /// Queue a command for the tree owner
    pub fn send(&self, command: TreeCommand) -> Result<(), TreeError> {
        self.tx.send(command).map_err(|_| TreeError::Closed)
    }

    pub fn set_value(&self, path: impl Into<String>, value: impl Into<Value>) -> Result<(), TreeError> {
        self.send(TreeCommand::SetValue {
            path: path.into(),
            value: value.into(),
        })
    }

    pub fn produce_value(&self, path: impl Into<String>, value: impl Into<Value>) -> Result<(), TreeError> {
        self.send(TreeCommand::ProduceValue {
            path: path.into(),
            value: value.into(),
            state: State::Synchronized,
        })
    }
}
