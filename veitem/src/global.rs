//! Process-wide item tree
//!
//! Created on first access and kept until the process exits. There is no
//! teardown; embedders that need one should own an [`ItemTree`] instead.

use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::item_tree::ItemTree;

static ROOT: OnceLock<Mutex<ItemTree>> = OnceLock::new();

/// The process-wide tree
///
/// # Example
///
/// ```rust,ignore
/// let mut tree = veitem::global::root().lock();
/// let root = tree.root();
/// tree.add_producer(root, "pub", LocalProducer::new())?;
/// ```
pub fn root() -> &'static Mutex<ItemTree> {
    ROOT.get_or_init(|| Mutex::new(ItemTree::new()))
}
