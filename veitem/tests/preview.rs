//! Preview overlay: staging, commit and discard

use veitem::{EventMask, ItemEvent, ItemId, ItemTree, LocalProducer, Producer, State, Value};

/// A producer whose writes are confirmed later, like a remote transport
#[derive(Default)]
struct DeferredProducer {
    pending: Vec<(ItemId, Value)>,
}

impl Producer for DeferredProducer {
    fn set_value(&mut self, items: &mut veitem::Items, item: ItemId, value: Value) -> i32 {
        items.set_state(item, State::Storing);
        self.pending.push((item, value));
        0
    }
}

/// A producer whose remote side is gone
struct UnreachableProducer;

impl Producer for UnreachableProducer {
    fn set_value(&mut self, _items: &mut veitem::Items, _item: ItemId, _value: Value) -> i32 {
        -1
    }
}

fn synchronized_item(tree: &mut ItemTree, parent: ItemId, value: i32) -> ItemId {
    let item = tree.item_get_or_create(parent, "Ac/Setpoint", true).unwrap();
    tree.produce_value(item, value, State::Synchronized);
    tree.produce_text(item, format!("{} W", value), State::Synchronized);
    item
}

#[test]
fn test_discard_restores_pre_preview_values() {
    let mut tree = ItemTree::new();
    let root = tree.root();
    let (_, local) = tree.add_producer(root, "local", LocalProducer::new()).unwrap();
    let item = synchronized_item(&mut tree, local, 10);
    let observer = tree.subscribe(item).unwrap();

    tree.produce_value(item, 20, State::Preview);
    assert_eq!(tree.state(item), Some(State::Preview));
    assert_eq!(tree.local_value(item), Value::from(20));
    assert_eq!(tree.local_text(item), "20");
    assert_eq!(tree.text_state(item), Some(State::Preview));

    tree.discard_preview(item);
    assert_eq!(tree.local_value(item), Value::from(10));
    assert_eq!(tree.state(item), Some(State::Synchronized));
    assert_eq!(tree.local_text(item), "10 W");
    assert_eq!(tree.text_state(item), Some(State::Synchronized));
    assert_eq!(tree.item(item).unwrap().last_valid_value(), &Value::from(10));
    assert_eq!(tree.item(item).unwrap().last_valid_text(), "10 W");

    // The previewed value was only ever seen together with the Preview state
    let mut state = State::Synchronized;
    for event in observer.drain() {
        match event {
            ItemEvent::StateChanged { state: s, .. } => state = s,
            ItemEvent::ValueChanged { value, .. } if value == Value::from(20) => {
                assert_eq!(state, State::Preview)
            }
            _ => {}
        }
    }
}

#[test]
fn test_updates_while_previewing_are_buffered() {
    let mut tree = ItemTree::new();
    let root = tree.root();
    let (_, local) = tree.add_producer(root, "local", LocalProducer::new()).unwrap();
    let item = synchronized_item(&mut tree, local, 10);

    tree.produce_value(item, 20, State::Preview);
    let observer = tree.subscribe_with(item, EventMask::VALUE).unwrap();
    tree.produce_value(item, 30, State::Synchronized);
    assert_eq!(tree.local_value(item), Value::from(20));
    assert!(observer.drain().is_empty());

    tree.discard_preview(item);
    assert_eq!(tree.local_value(item), Value::from(10));
}

#[test]
fn test_preview_requires_synchronized_item() {
    let mut tree = ItemTree::new();
    let root = tree.root();
    let (_, local) = tree.add_producer(root, "local", LocalProducer::new()).unwrap();
    let item = tree.item_get_or_create(local, "x", true).unwrap();

    tree.produce_value(item, 1, State::Preview);
    assert_eq!(tree.state(item), Some(State::Idle));
    assert_eq!(tree.local_value(item), Value::Invalid);
}

#[test]
fn test_commit_on_local_item_applies_value() {
    let mut tree = ItemTree::new();
    let root = tree.root();
    let (_, local) = tree.add_producer(root, "local", LocalProducer::new()).unwrap();
    let item = synchronized_item(&mut tree, local, 10);

    tree.produce_value(item, 20, State::Preview);
    assert_eq!(tree.commit_preview(item), 0);
    assert_eq!(tree.local_value(item), Value::from(20));
    assert_eq!(tree.state(item), Some(State::Synchronized));
    assert_eq!(tree.item(item).unwrap().last_valid_value(), &Value::from(20));
}

#[test]
fn test_commit_on_remote_item_stores_then_synchronizes() {
    let mut tree = ItemTree::new();
    let root = tree.root();
    let (pid, remote) = tree.add_producer(root, "remote", DeferredProducer::default()).unwrap();
    let item = synchronized_item(&mut tree, remote, 10);
    let observer = tree.subscribe_with(item, EventMask::STATE).unwrap();

    tree.produce_value(item, 20, State::Preview);
    tree.commit_preview(item);
    assert_eq!(tree.state(item), Some(State::Storing));
    assert_eq!(tree.local_value(item), Value::from(20));

    let pending = tree
        .with_producer::<DeferredProducer, _>(pid, |p, _| std::mem::take(&mut p.pending))
        .unwrap();
    assert_eq!(pending, vec![(item, Value::from(20))]);

    tree.produce_value(item, 20, State::Synchronized);
    assert_eq!(tree.state(item), Some(State::Synchronized));

    let states: Vec<State> = observer
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            ItemEvent::StateChanged { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![State::Preview, State::Storing, State::Synchronized]
    );
}

#[test]
fn test_commit_without_preview_does_nothing() {
    let mut tree = ItemTree::new();
    let root = tree.root();
    let (pid, remote) = tree.add_producer(root, "remote", DeferredProducer::default()).unwrap();
    let item = synchronized_item(&mut tree, remote, 10);

    assert_eq!(tree.commit_preview(item), 0);
    let pending = tree
        .with_producer::<DeferredProducer, _>(pid, |p, _| p.pending.len())
        .unwrap();
    assert_eq!(pending, 0);
}

#[test]
fn test_rejected_commit_restores_pre_preview_values() {
    let mut tree = ItemTree::new();
    let root = tree.root();
    let (_, remote) = tree.add_producer(root, "remote", UnreachableProducer).unwrap();
    let item = synchronized_item(&mut tree, remote, 10);
    let observer = tree.subscribe(item).unwrap();

    tree.produce_value(item, 20, State::Preview);
    assert_eq!(tree.commit_preview(item), -1);
    assert_eq!(tree.local_value(item), Value::from(10));
    assert_eq!(tree.state(item), Some(State::Synchronized));
    assert_eq!(tree.local_text(item), "10 W");
    assert_eq!(tree.text_state(item), Some(State::Synchronized));
    assert_eq!(tree.item(item).unwrap().last_valid_value(), &Value::from(10));

    let mut state = State::Synchronized;
    for event in observer.drain() {
        match event {
            ItemEvent::StateChanged { state: s, .. } => state = s,
            ItemEvent::ValueChanged { value, .. } if value == Value::from(20) => {
                assert_eq!(state, State::Preview)
            }
            _ => {}
        }
    }
}

#[test]
fn test_rejected_commit_applies_buffered_update() {
    let mut tree = ItemTree::new();
    let root = tree.root();
    let (_, remote) = tree.add_producer(root, "remote", UnreachableProducer).unwrap();
    let item = synchronized_item(&mut tree, remote, 10);

    tree.produce_value(item, 20, State::Preview);
    tree.produce_value(item, Value::Invalid, State::Offline);
    assert_eq!(tree.state(item), Some(State::Preview));

    assert_eq!(tree.commit_preview(item), -1);
    assert_eq!(tree.state(item), Some(State::Offline));
    assert_eq!(tree.local_value(item), Value::Invalid);
    assert_eq!(tree.item(item).unwrap().last_valid_value(), &Value::from(10));
}

#[test]
fn test_accepted_commit_drops_buffered_update() {
    let mut tree = ItemTree::new();
    let root = tree.root();
    let (_, local) = tree.add_producer(root, "local", LocalProducer::new()).unwrap();
    let item = synchronized_item(&mut tree, local, 10);

    tree.produce_value(item, 20, State::Preview);
    tree.produce_value(item, 30, State::Synchronized);
    assert_eq!(tree.commit_preview(item), 0);
    assert_eq!(tree.local_value(item), Value::from(20));
    assert_eq!(tree.state(item), Some(State::Synchronized));
    assert_eq!(tree.text_state(item), Some(State::Idle));
}
