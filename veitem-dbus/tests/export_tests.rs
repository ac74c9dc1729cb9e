//! Publishing a local subtree as D-Bus services

mod mock_bus;

use mock_bus::MockBus;
use veitem::{Facets, ItemId, ItemTree, LocalProducer, State, Value};
use veitem_dbus::message::{BUS_ITEM_INTERFACE, INTROSPECTABLE_INTERFACE};
use veitem_dbus::wire::item_map_from_wire;
use veitem_dbus::{BusError, ExportedServices, IncomingCall, WireValue};

const SERVICE: &str = "com.victronenergy.test";

struct Fixture {
    tree: ItemTree,
    local: ItemId,
    service: ItemId,
    voltage: ItemId,
    bus: MockBus,
    exporter: ExportedServices,
}

/// One online service with a single voltage item, exported and opened
fn fixture() -> Fixture {
    let mut tree = ItemTree::new();
    let root = tree.root();
    let (_, local) = tree.add_producer(root, "pub", LocalProducer::new()).unwrap();
    let service = tree.item_get_or_create(local, SERVICE, false).unwrap();
    tree.items_mut().set_state(service, State::Synchronized);
    let voltage = tree.item_get_or_create(service, "Dc/0/Voltage", true).unwrap();
    tree.produce_value(voltage, 12.5, State::Synchronized);
    tree.produce_text(voltage, "12.5V", State::Synchronized);

    let bus = MockBus::new();
    let mut exporter = ExportedServices::new(&mut tree, local, bus.clone());
    exporter.open(&tree);
    Fixture {
        tree,
        local,
        service,
        voltage,
        bus,
        exporter,
    }
}

fn call(path: &str, member: &str) -> IncomingCall {
    IncomingCall::new(SERVICE, path, BUS_ITEM_INTERFACE, member)
}

#[test]
fn test_services_follow_online_state() {
    let mut f = fixture();
    assert_eq!(f.bus.names(), vec![SERVICE.to_string()]);

    let idle = f.tree.item_get_or_create(f.local, "com.victronenergy.idle", false).unwrap();
    f.exporter.poll(&f.tree);
    assert!(!f.exporter.is_exported("com.victronenergy.idle"));

    f.tree.items_mut().set_state(idle, State::Synchronized);
    f.exporter.poll(&f.tree);
    assert_eq!(f.exporter.service_names(), vec!["com.victronenergy.idle", SERVICE]);

    f.tree.items_mut().set_state(f.service, State::Offline);
    f.exporter.poll(&f.tree);
    assert!(!f.exporter.is_exported(SERVICE));
    assert_eq!(f.bus.names(), vec!["com.victronenergy.idle".to_string()]);
}

#[test]
fn test_service_flapping_between_polls_touches_no_names() {
    let mut f = fixture();
    let flapping = f.tree.item_get_or_create(f.local, "com.victronenergy.flap", false).unwrap();
    f.exporter.poll(&f.tree);

    f.tree.items_mut().set_state(flapping, State::Synchronized);
    f.tree.items_mut().set_state(flapping, State::Offline);
    f.tree.items_mut().set_state(f.service, State::Offline);
    f.tree.items_mut().set_state(f.service, State::Synchronized);
    f.exporter.poll(&f.tree);

    assert!(!f.exporter.is_exported("com.victronenergy.flap"));
    assert!(f.exporter.is_exported(SERVICE));
    assert_eq!(f.bus.name_log(), vec![format!("request {}", SERVICE)]);
}

#[test]
fn test_changes_are_coalesced_per_item() {
    let mut f = fixture();
    f.bus.take_signals();

    f.tree.produce_value(f.voltage, 12.6, State::Synchronized);
    f.tree.produce_value(f.voltage, 12.7, State::Synchronized);
    f.tree.produce_text(f.voltage, "12.7V", State::Synchronized);
    f.tree.produce_property(f.voltage, "max", 15.0, State::Synchronized);
    let current = f.tree.item_get_or_create(f.service, "Dc/0/Current", true).unwrap();
    f.tree.produce_value(current, 3, State::Synchronized);

    f.exporter.process_events(&f.tree);
    assert_eq!(
        f.exporter.pending_facets(SERVICE, "/Dc/0/Voltage"),
        Some(Facets::VALUE | Facets::TEXT | Facets::MAX)
    );
    assert!(f.bus.take_signals().is_empty());

    f.exporter.flush();
    let signals = f.bus.take_signals();
    assert_eq!(signals.len(), 1);
    let (sender, signal) = &signals[0];
    assert_eq!(sender, SERVICE);
    assert_eq!(signal.path, "/");
    assert_eq!(signal.member, "ItemsChanged");

    let changes = item_map_from_wire(&signal.args[0]).unwrap();
    assert_eq!(changes.len(), 2);
    let voltage = &changes["/Dc/0/Voltage"];
    assert_eq!(voltage.get("Value"), Some(&WireValue::variant(WireValue::Double(12.7))));
    assert_eq!(voltage.get("Text"), Some(&WireValue::variant(WireValue::from("12.7V"))));
    assert_eq!(voltage.get("Max"), Some(&WireValue::variant(WireValue::Double(15.0))));
    assert_eq!(
        changes["/Dc/0/Current"].get("Value"),
        Some(&WireValue::variant(WireValue::Int32(3)))
    );

    f.exporter.flush();
    assert!(f.bus.take_signals().is_empty());
}

#[test]
fn test_pending_changes_sent_before_removal() {
    let mut f = fixture();
    f.tree.produce_value(f.voltage, 13.0, State::Synchronized);
    f.tree.delete(f.service).unwrap();
    f.exporter.process_events(&f.tree);

    let signals = f.bus.take_signals();
    assert_eq!(signals.len(), 1);
    let changes = item_map_from_wire(&signals[0].1.args[0]).unwrap();
    assert_eq!(
        changes["/Dc/0/Voltage"].get("Value"),
        Some(&WireValue::variant(WireValue::Double(13.0)))
    );
    assert!(f.bus.names().is_empty());
    assert!(f.exporter.service_names().is_empty());
}

#[test]
fn test_get_value_and_text() {
    let mut f = fixture();

    let value = f.exporter.handle_call(&mut f.tree, &call("/Dc/0/Voltage", "GetValue"));
    assert_eq!(value, Ok(vec![WireValue::variant(WireValue::Double(12.5))]));

    let text = f.exporter.handle_call(&mut f.tree, &call("/Dc/0/Voltage", "GetText"));
    assert_eq!(text, Ok(vec![WireValue::from("12.5V")]));

    // Items with children answer with their subtree
    let subtree = f.exporter.handle_call(&mut f.tree, &call("/Dc", "GetValue")).unwrap();
    let WireValue::Dict(entries) = subtree[0].unwrap_variant() else {
        panic!("expected a dict, got {:?}", subtree);
    };
    assert_eq!(entries.len(), 1);
    assert_eq!(entries["0/Voltage"], WireValue::variant(WireValue::Double(12.5)));
}

#[test]
fn test_get_items_lists_leaves() {
    let mut f = fixture();
    f.tree.produce_property(f.voltage, "min", 10, State::Synchronized);

    let reply = f.exporter.handle_call(&mut f.tree, &call("/", "GetItems")).unwrap();
    let items = item_map_from_wire(&reply[0]).unwrap();
    assert_eq!(items.len(), 1);
    let voltage = &items["/Dc/0/Voltage"];
    assert_eq!(voltage.get("Value"), Some(&WireValue::variant(WireValue::Double(12.5))));
    assert_eq!(voltage.get("Text"), Some(&WireValue::variant(WireValue::from("12.5V"))));
    assert_eq!(voltage.get("Min"), Some(&WireValue::variant(WireValue::Int32(10))));
    assert!(!voltage.contains_key("Max"));
}

#[test]
fn test_set_value() {
    let mut f = fixture();

    let missing = f.exporter.handle_call(&mut f.tree, &call("/Dc/0/Voltage", "SetValue"));
    assert_eq!(missing, Err(BusError::invalid_args("Expected 1 argument")));

    let write = call("/Dc/0/Voltage", "SetValue").with_arg(WireValue::variant(WireValue::Int32(13)));
    let status = f.exporter.handle_call(&mut f.tree, &write);
    assert_eq!(status, Ok(vec![WireValue::Int32(0)]));
    assert_eq!(f.tree.local_value(f.voltage), Value::from(13));

    let on_branch = call("/Dc", "SetValue").with_arg(WireValue::variant(WireValue::Int32(1)));
    let error = f.exporter.handle_call(&mut f.tree, &on_branch).unwrap_err();
    assert_eq!(error.name, BusError::UNKNOWN_METHOD);
}

#[test]
fn test_unknown_objects() {
    let mut f = fixture();

    let error = f.exporter.handle_call(&mut f.tree, &call("/Nope", "GetValue")).unwrap_err();
    assert!(error.is_unknown_object());

    let elsewhere = IncomingCall::new("com.victronenergy.other", "/", BUS_ITEM_INTERFACE, "GetValue");
    let error = f.exporter.handle_call(&mut f.tree, &elsewhere).unwrap_err();
    assert!(error.is_unknown_object());
}

#[test]
fn test_introspection_lists_children() {
    let mut f = fixture();

    let introspect = IncomingCall::new(SERVICE, "/Dc", INTROSPECTABLE_INTERFACE, "Introspect");
    let reply = f.exporter.handle_call(&mut f.tree, &introspect).unwrap();
    let xml = reply[0].as_str().unwrap();
    assert!(xml.contains("<node name=\"0\"/>"));
    assert!(xml.contains(BUS_ITEM_INTERFACE));
}
