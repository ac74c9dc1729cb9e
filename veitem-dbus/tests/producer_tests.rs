//! D-Bus producer against a recording bus

mod mock_bus;

use std::collections::BTreeMap;

use mock_bus::MockBus;
use rstest::rstest;
use veitem::{ItemId, ItemTree, SettingInfo, State, Value};
use veitem_dbus::wire::item_map_to_wire;
use veitem_dbus::{BusError, BusEvent, DbusConfig, DbusHandle, ItemMap, PropertyMap, Serial, WireValue};

const BATTERY: &str = "com.victronenergy.battery.ttyO1";
const OWNER: &str = ":1.5";

fn setup(config: DbusConfig) -> (ItemTree, DbusHandle, MockBus) {
    let mut tree = ItemTree::new();
    let root = tree.root();
    let bus = MockBus::new();
    let dbus = DbusHandle::attach(&mut tree, root, "dbus", bus.clone(), config).unwrap();
    (tree, dbus, bus)
}

/// Producer with the battery service registered and the setup calls cleared
fn registered_battery(config: DbusConfig) -> (ItemTree, DbusHandle, MockBus, ItemId) {
    let (mut tree, dbus, bus) = setup(config);
    bus.take_calls();
    owner_changed(&mut tree, &dbus, BATTERY, "", OWNER);
    let service = dbus.service_item(&tree, BATTERY).expect("service item");
    (tree, dbus, bus, service)
}

fn owner_changed(tree: &mut ItemTree, dbus: &DbusHandle, name: &str, old: &str, new: &str) {
    dbus.handle_event(
        tree,
        BusEvent::NameOwnerChanged {
            name: name.to_string(),
            old_owner: old.to_string(),
            new_owner: new.to_string(),
        },
    );
}

fn reply(tree: &mut ItemTree, dbus: &DbusHandle, serial: Serial, args: Vec<WireValue>) {
    dbus.handle_event(tree, BusEvent::reply(serial, args));
}

fn properties(entries: &[(&str, WireValue)]) -> PropertyMap {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), WireValue::variant(value.clone())))
        .collect()
}

fn voltage_items() -> ItemMap {
    let mut map = ItemMap::new();
    map.insert(
        "/Dc/0/Voltage".to_string(),
        properties(&[("Value", WireValue::Double(12.5)), ("Text", WireValue::from("12.5V"))]),
    );
    map
}

#[test]
fn test_list_names_attaches_followed_services() {
    let (mut tree, dbus, bus) = setup(DbusConfig::default());
    let (serial, call) = bus.single("ListNames");
    assert_eq!(call.destination, "org.freedesktop.DBus");
    bus.take_calls();

    let names = vec![BATTERY.into(), "org.freedesktop.DBus".into(), ":1.3".into()];
    reply(&mut tree, &dbus, serial, vec![WireValue::Array(names)]);

    let service = dbus.service_item(&tree, BATTERY).expect("service item");
    assert_eq!(tree.items().children(dbus.root()), vec![service]);
    assert_eq!(tree.items().unique_id(service), Some("dbus/com.victronenergy.battery.ttyO1"));

    let (serial, call) = bus.single("GetNameOwner");
    assert_eq!(call.args, vec![WireValue::from(BATTERY)]);
    bus.take_calls();

    reply(&mut tree, &dbus, serial, vec![WireValue::from(OWNER)]);
    assert_eq!(tree.state(service), Some(State::Synchronized));
    let (_, call) = bus.single("GetItems");
    assert_eq!(call.destination, OWNER);
    assert_eq!(call.path, "/");
}

#[test]
fn test_bulk_fetch_defers_individual_requests() {
    let (mut tree, dbus, bus, service) = registered_battery(DbusConfig::default());
    let (items_serial, _) = bus.single("GetItems");

    let voltage = tree.item_get_or_create(service, "Dc/0/Voltage", true).unwrap();
    let missing = tree.item_get_or_create(service, "Missing", true).unwrap();
    assert_eq!(tree.get_value(voltage, true), Value::Invalid);
    assert_eq!(tree.get_value(voltage, true), Value::Invalid);
    tree.get_value(missing, true);
    assert!(bus.calls_to("GetValue").is_empty());

    reply(&mut tree, &dbus, items_serial, vec![item_map_to_wire(&voltage_items())]);

    assert_eq!(tree.local_value(voltage), Value::from(12.5));
    assert_eq!(tree.local_text(voltage), "12.5V");
    assert_eq!(tree.state(voltage), Some(State::Synchronized));

    // Only the item the bulk reply did not cover is fetched individually
    let requests = bus.calls_to("GetValue");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].1.path, "/Missing");
    assert_eq!(tree.state(missing), Some(State::Requested));
}

#[test]
fn test_deregistration_takes_items_offline() {
    let (mut tree, dbus, bus, service) = registered_battery(DbusConfig::default());
    let (items_serial, _) = bus.single("GetItems");
    reply(&mut tree, &dbus, items_serial, vec![item_map_to_wire(&voltage_items())]);
    let voltage = tree.item_get(service, "Dc/0/Voltage").unwrap();

    owner_changed(&mut tree, &dbus, BATTERY, OWNER, "");
    assert_eq!(tree.state(voltage), Some(State::Offline));
    assert_eq!(tree.text_state(voltage), Some(State::Offline));
    assert_eq!(tree.local_value(voltage), Value::Invalid);
    assert_eq!(tree.item(voltage).unwrap().last_valid_value(), &Value::from(12.5));
    assert_eq!(tree.state(service), Some(State::Offline));

    assert_eq!(tree.set_value(voltage, 13.0), -1);
    assert!(bus.calls_to("SetValue").is_empty());

    bus.take_calls();
    owner_changed(&mut tree, &dbus, BATTERY, "", ":1.8");
    assert_eq!(tree.state(service), Some(State::Synchronized));
    assert_eq!(tree.state(voltage), Some(State::Idle));
    assert_eq!(bus.single("GetItems").1.destination, ":1.8");
}

#[test]
fn test_commit_after_deregistration_keeps_item_offline() {
    let (mut tree, dbus, bus, service) = registered_battery(DbusConfig::default());
    let (items_serial, _) = bus.single("GetItems");
    reply(&mut tree, &dbus, items_serial, vec![item_map_to_wire(&voltage_items())]);
    let voltage = tree.item_get(service, "Dc/0/Voltage").unwrap();
    bus.take_calls();

    tree.produce_value(voltage, 99.0, State::Preview);
    owner_changed(&mut tree, &dbus, BATTERY, OWNER, "");
    assert_eq!(tree.state(voltage), Some(State::Preview));

    assert_eq!(tree.commit_preview(voltage), -1);
    assert!(bus.calls_to("SetValue").is_empty());
    assert_eq!(tree.state(voltage), Some(State::Offline));
    assert_eq!(tree.local_value(voltage), Value::Invalid);
    assert_eq!(tree.text_state(voltage), Some(State::Offline));
    assert_eq!(tree.item(voltage).unwrap().last_valid_value(), &Value::from(12.5));
}

#[test]
fn test_reply_from_previous_owner_is_dropped() {
    let (mut tree, dbus, bus, service) = registered_battery(DbusConfig::default().with_bulk_init(false));
    assert!(bus.calls_to("GetItems").is_empty());

    let soc = tree.item_get_or_create(service, "Soc", true).unwrap();
    tree.get_value(soc, false);
    let (serial, call) = bus.single("GetValue");
    assert_eq!(call.path, "/Soc");
    assert_eq!(call.interface, "com.victronenergy.BusItem");
    assert_eq!(tree.state(soc), Some(State::Requested));

    owner_changed(&mut tree, &dbus, BATTERY, OWNER, ":1.9");
    reply(&mut tree, &dbus, serial, vec![WireValue::variant(WireValue::Int32(99))]);

    assert_eq!(tree.local_value(soc), Value::Invalid);
    assert_eq!(tree.state(soc), Some(State::Idle));
}

#[test]
fn test_forced_request_in_flight_is_not_repeated() {
    let (mut tree, _dbus, bus, service) = registered_battery(DbusConfig::default().with_bulk_init(false));
    let soc = tree.item_get_or_create(service, "Soc", true).unwrap();

    tree.get_value(soc, true);
    tree.get_value(soc, true);
    assert_eq!(bus.calls_to("GetValue").len(), 1);
}

#[test]
fn test_reply_for_deleted_item_is_dropped() {
    let (mut tree, dbus, bus, service) = registered_battery(DbusConfig::default().with_bulk_init(false));
    let soc = tree.item_get_or_create(service, "Soc", true).unwrap();
    tree.get_value(soc, false);
    let (serial, _) = bus.single("GetValue");

    let pending = dbus.with(&mut tree, |producer, _| producer.pending_calls()).unwrap();
    tree.delete(soc).unwrap();
    reply(&mut tree, &dbus, serial, vec![WireValue::variant(WireValue::Int32(99))]);
    assert!(tree.item_get(service, "Soc").is_none());
    assert_eq!(dbus.with(&mut tree, |producer, _| producer.pending_calls()), Some(pending - 1));
}

#[test]
fn test_unknown_object_reply_goes_offline() {
    let (mut tree, dbus, bus, service) = registered_battery(DbusConfig::default().with_bulk_init(false));
    let soc = tree.item_get_or_create(service, "Soc", true).unwrap();
    tree.get_value(soc, false);
    tree.get_text(soc, false);
    let (value_serial, _) = bus.single("GetValue");
    let (text_serial, _) = bus.single("GetText");

    dbus.handle_event(&mut tree, BusEvent::error_reply(value_serial, BusError::unknown_object("/Soc")));
    dbus.handle_event(&mut tree, BusEvent::error_reply(text_serial, BusError::unknown_object("/Soc")));

    assert_eq!(tree.state(soc), Some(State::Offline));
    assert_eq!(tree.text_state(soc), Some(State::Offline));
    assert_eq!(tree.local_value(soc), Value::Invalid);
}

fn synchronized_soc(tree: &mut ItemTree, dbus: &DbusHandle, bus: &MockBus, service: ItemId) -> ItemId {
    let soc = tree.item_get_or_create(service, "Soc", true).unwrap();
    tree.get_value(soc, false);
    let (serial, _) = bus.single("GetValue");
    reply(tree, dbus, serial, vec![WireValue::variant(WireValue::Int32(50))]);
    bus.take_calls();
    soc
}

#[test]
fn test_write_is_confirmed_by_reply() {
    let (mut tree, dbus, bus, service) = registered_battery(DbusConfig::default().with_bulk_init(false));
    let soc = synchronized_soc(&mut tree, &dbus, &bus, service);
    assert_eq!(tree.state(soc), Some(State::Synchronized));

    assert_eq!(tree.set_value(soc, 60), 0);
    assert_eq!(tree.state(soc), Some(State::Storing));
    let (serial, call) = bus.single("SetValue");
    assert_eq!(call.path, "/Soc");
    assert_eq!(call.args, vec![WireValue::variant(WireValue::Int32(60))]);

    // Writing the pending value again is a no-op
    assert_eq!(tree.set_value(soc, 60), 0);
    assert_eq!(bus.calls_to("SetValue").len(), 1);

    reply(&mut tree, &dbus, serial, vec![WireValue::Int32(0)]);
    assert_eq!(tree.state(soc), Some(State::Synchronized));
    assert_eq!(tree.local_value(soc), Value::from(60));
}

#[test]
fn test_invalid_is_written_as_empty_int_array() {
    let (mut tree, dbus, bus, service) = registered_battery(DbusConfig::default().with_bulk_init(false));
    let soc = synchronized_soc(&mut tree, &dbus, &bus, service);

    tree.set_value(soc, Value::Invalid);
    let (_, call) = bus.single("SetValue");
    assert_eq!(call.args, vec![WireValue::variant(WireValue::IntArray(vec![]))]);
}

#[rstest]
#[case::error_reply(Err(BusError::new("com.victronenergy.BusItem.Error", "read only")))]
#[case::non_zero_status(Ok(vec![WireValue::Int32(1)]))]
fn test_failed_write_refetches(#[case] result: Result<Vec<WireValue>, BusError>) {
    let (mut tree, dbus, bus, service) = registered_battery(DbusConfig::default().with_bulk_init(false));
    let soc = synchronized_soc(&mut tree, &dbus, &bus, service);

    tree.set_value(soc, 60);
    let (serial, _) = bus.single("SetValue");
    dbus.handle_event(&mut tree, BusEvent::Reply { serial, result });

    assert_eq!(bus.calls_to("GetValue").len(), 1);
    assert_eq!(tree.state(soc), Some(State::Requested));
    assert_eq!(tree.local_value(soc), Value::from(50));
}

#[test]
fn test_watched_items_fetch_on_registration() {
    let config = DbusConfig::default()
        .with_find_victron_services(false)
        .with_bulk_init(false);
    let (mut tree, dbus, bus) = setup(config);
    assert!(bus.take_calls().is_empty());

    let service = tree
        .item_get_or_create(dbus.root(), "com.victronenergy.system", false)
        .unwrap();
    let (serial, _) = bus.single("GetNameOwner");
    bus.take_calls();

    let relay = tree.item_get_or_create(service, "Relay/0/State", true).unwrap();
    assert_eq!(tree.set_value(relay, 1), -1);
    let _observer = tree.subscribe(relay).unwrap();

    dbus.handle_event(
        &mut tree,
        BusEvent::error_reply(serial, BusError::new(BusError::NAME_HAS_NO_OWNER, "no owner")),
    );
    assert_eq!(tree.state(service), Some(State::Offline));

    owner_changed(&mut tree, &dbus, "com.victronenergy.system", "", ":1.7");
    assert_eq!(tree.state(service), Some(State::Synchronized));
    let (_, value_call) = bus.single("GetValue");
    let (_, text_call) = bus.single("GetText");
    assert_eq!(value_call.destination, ":1.7");
    assert_eq!(value_call.path, "/Relay/0/State");
    assert_eq!(text_call.path, "/Relay/0/State");
}

#[test]
fn test_properties_requested_while_offline_are_reissued() {
    let (mut tree, dbus, bus) = setup(DbusConfig::default().with_find_victron_services(false));
    let service = tree
        .item_get_or_create(dbus.root(), "com.victronenergy.system", false)
        .unwrap();
    let relay = tree.item_get_or_create(service, "Relay/0/State", true).unwrap();

    assert_eq!(tree.item_property(relay, "max", false), Value::Invalid);
    let state = tree.item(relay).unwrap().property("max").map(|p| p.state);
    assert_eq!(state, Some(State::Offline));
    assert!(bus.calls_to("GetMax").is_empty());

    owner_changed(&mut tree, &dbus, "com.victronenergy.system", "", ":1.7");
    let (serial, call) = bus.single("GetMax");
    assert_eq!(call.path, "/Relay/0/State");

    reply(&mut tree, &dbus, serial, vec![WireValue::variant(WireValue::Int32(1))]);
    let max = tree.item(relay).unwrap().property("max").cloned().unwrap();
    assert_eq!(max.value, Value::from(1));
    assert_eq!(max.state, State::Synchronized);
}

#[test]
fn test_signals_update_items() {
    let (mut tree, dbus, _bus, service) = registered_battery(DbusConfig::default());

    let mut changes = ItemMap::new();
    changes.insert(
        "/Soc".to_string(),
        properties(&[("Value", WireValue::Double(80.0)), ("Max", WireValue::Int32(100))]),
    );
    dbus.handle_event(
        &mut tree,
        BusEvent::ItemsChanged {
            sender: BATTERY.to_string(),
            items: changes,
        },
    );
    let soc = tree.item_get(service, "Soc").expect("created by ItemsChanged");
    assert_eq!(tree.local_value(soc), Value::from(80.0));
    assert_eq!(
        tree.item(soc).unwrap().property("max").map(|p| p.value.clone()),
        Some(Value::from(100))
    );

    dbus.handle_event(
        &mut tree,
        BusEvent::PropertiesChanged {
            sender: OWNER.to_string(),
            path: "/Soc".to_string(),
            changes: properties(&[("Value", WireValue::Double(81.0)), ("Text", WireValue::from("81 %"))]),
        },
    );
    assert_eq!(tree.local_value(soc), Value::from(81.0));
    assert_eq!(tree.local_text(soc), "81 %");
}

#[test]
fn test_unknown_paths_ignored_without_auto_create() {
    let (mut tree, dbus, _bus, service) = registered_battery(DbusConfig::default().with_auto_create_items(false));

    dbus.handle_event(
        &mut tree,
        BusEvent::ItemsChanged {
            sender: OWNER.to_string(),
            items: voltage_items(),
        },
    );
    assert!(tree.item_get(service, "Dc").is_none());
}

#[test]
fn test_add_settings_produces_current_values() {
    let (mut tree, dbus, bus) = setup(DbusConfig::default());
    bus.take_calls();

    let infos = [SettingInfo::new("Gui/Brightness", 50).with_range(0, 100)];
    dbus.add_settings(&mut tree, &infos).unwrap();
    let (serial, call) = bus.single("AddSettings");
    assert_eq!(call.destination, "com.victronenergy.settings");
    let settings = dbus
        .service_item(&tree, "com.victronenergy.settings")
        .expect("settings service item");

    let mut entry = BTreeMap::new();
    entry.insert("error".to_string(), WireValue::variant(WireValue::Int32(0)));
    entry.insert("path".to_string(), WireValue::variant(WireValue::from("Gui/Brightness")));
    entry.insert("value".to_string(), WireValue::variant(WireValue::Int32(70)));
    reply(&mut tree, &dbus, serial, vec![WireValue::Array(vec![WireValue::Dict(entry)])]);

    let brightness = tree
        .item_get(settings, "Settings/Gui/Brightness")
        .expect("setting item");
    assert_eq!(tree.local_value(brightness), Value::from(70));
    assert_eq!(tree.state(brightness), Some(State::Synchronized));
}
