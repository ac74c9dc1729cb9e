//! Settings with defaults and ranges
//!
//! A settings subtree holds configurable values below a `Settings` item.
//! Each setting is declared with a default and an optional range; declaring
//! it produces the default unless a value is already present.

use tracing::debug;

use crate::error::Result;
use crate::item::{DEFAULT, MAX, MIN};
use crate::item_tree::ItemTree;
use crate::producer::LocalProducer;
use crate::state::State;
use crate::tree::ItemId;
use crate::value::Value;

/// Path prefix under which settings live
pub const SETTINGS_PREFIX: &str = "Settings";

/// Property flagging settings whose changes should not be logged
pub const SILENT: &str = "silent";

/// Declaration of one setting
#[derive(Debug, Clone, PartialEq)]
pub struct SettingInfo {
    /// Path relative to the settings prefix
    pub path: String,
    pub default: Value,
    pub min: Value,
    pub max: Value,
    pub silent: bool,
}

impl SettingInfo {
    pub fn new(path: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            path: path.into(),
            default: default.into(),
            min: Value::Invalid,
            max: Value::Invalid,
            silent: false,
        }
    }

    pub fn with_range(mut self, min: impl Into<Value>, max: impl Into<Value>) -> Self {
        self.min = min.into();
        self.max = max.into();
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Full item path including the settings prefix
    pub fn item_path(&self) -> String {
        format!("{}/{}", SETTINGS_PREFIX, self.path.trim_start_matches('/'))
    }
}

/// A list of setting declarations
pub type SettingsInfo = Vec<SettingInfo>;

/// Handle to a settings subtree
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    root: ItemId,
}

impl Settings {
    /// Settings kept in process, under a new local producer at `parent/id`
    pub fn local(tree: &mut ItemTree, parent: ItemId, id: &str) -> Result<Self> {
        let (_, root) = tree.add_producer(parent, id, LocalProducer::new())?;
        Ok(Self { root })
    }

    /// Settings below an existing item, e.g. a bound settings service
    pub fn at(root: ItemId) -> Self {
        Self { root }
    }

    pub fn root(&self) -> ItemId {
        self.root
    }

    /// Declare one setting and return its item
    ///
    /// An item that already has a value keeps it; only the range and
    /// default properties are refreshed.
    pub fn add(&self, tree: &mut ItemTree, info: &SettingInfo) -> Result<ItemId> {
        let item = tree.item_get_or_create(self.root, &info.item_path(), true)?;
        let has_value = tree.item(item).map(|i| i.value().is_valid()).unwrap_or(false);
        if !has_value {
            debug!("setting {} defaults to {}", info.path, info.default);
            tree.produce_value(item, info.default.clone(), State::Synchronized);
        }
        tree.produce_property(item, DEFAULT, info.default.clone(), State::Synchronized);
        if info.min.is_valid() {
            tree.produce_property(item, MIN, info.min.clone(), State::Synchronized);
        }
        if info.max.is_valid() {
            tree.produce_property(item, MAX, info.max.clone(), State::Synchronized);
        }
        if info.silent {
            tree.produce_property(item, SILENT, true, State::Synchronized);
        }
        Ok(item)
    }

    /// Declare a batch of settings
    pub fn add_settings(&self, tree: &mut ItemTree, infos: &[SettingInfo]) -> Result<Vec<ItemId>> {
        infos.iter().map(|info| self.add(tree, info)).collect()
    }

    /// Look up a declared setting by its path without the prefix
    pub fn get(&self, tree: &ItemTree, path: &str) -> Option<ItemId> {
        tree.item_get(self.root, &format!("{}/{}", SETTINGS_PREFIX, path.trim_start_matches('/')))
    }
}
