//! Publish a local subtree as D-Bus services
//!
//! Every direct child of the exported root becomes a service named after
//! the child's id once it is online (not `Idle` or `Offline`), and is
//! unregistered again when it goes offline or leaves the tree. Items below
//! a service are objects at their relative path implementing
//! `com.victronenergy.BusItem`.
//!
//! Changes are not signalled one by one. They are collected per service,
//! coalesced per item, and sent as one `ItemsChanged` signal on `/` when
//! [`flush`](ExportedServices::flush) runs, normally once per turn of the
//! owner's event loop.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info, warn};
use veitem::item::{DEFAULT, MAX, MIN};
use veitem::{Facets, ItemEvent, ItemId, ItemObserver, ItemTree, Items, Value};

use crate::connection::BusConnection;
use crate::error::BusError;
use crate::message::{IncomingCall, Signal, BUS_ITEM_INTERFACE, INTROSPECTABLE_INTERFACE, ITEMS_CHANGED};
use crate::wire::{denormalize, item_map_to_wire, normalize, ItemMap, PropertyMap, WireValue};

const INTROSPECT_HEADER: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";

/// Changes of one item waiting for the next flush
#[derive(Debug, Default, Clone)]
struct PendingChange {
    facets: Facets,
    properties: PropertyMap,
}

#[derive(Debug)]
struct ExportedService {
    name: String,
    /// Keyed by path relative to the service item
    pending: BTreeMap<String, PendingChange>,
}

/// Where an exported item lives
#[derive(Debug, Clone)]
struct ItemPath {
    service: ItemId,
    path: String,
}

/// Exporter for the children of one item
pub struct ExportedServices {
    root: ItemId,
    connection: Box<dyn BusConnection>,
    observer: ItemObserver,
    services: HashMap<ItemId, ExportedService>,
    paths: HashMap<ItemId, ItemPath>,
}

impl std::fmt::Debug for ExportedServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportedServices")
            .field("root", &self.root)
            .field("services", &self.service_names())
            .finish()
    }
}

fn is_online(items: &Items, item: ItemId) -> bool {
    items.get(item).map(|i| i.state().is_online()).unwrap_or(false)
}

/// Name of the exported key and facet of a well-known property
fn property_key(name: &str) -> Option<(&'static str, Facets)> {
    match name {
        MIN => Some(("Min", Facets::MIN)),
        MAX => Some(("Max", Facets::MAX)),
        DEFAULT => Some(("Default", Facets::DEFAULT)),
        _ => None,
    }
}

impl ExportedServices {
    /// Start watching `root`; call [`open`](Self::open) to export what is
    /// already there
    pub fn new(tree: &mut ItemTree, root: ItemId, connection: impl BusConnection + 'static) -> Self {
        Self {
            root,
            connection: Box::new(connection),
            observer: tree.subscribe_all(),
            services: HashMap::new(),
            paths: HashMap::new(),
        }
    }

    /// Export every child of the root that is online right now
    pub fn open(&mut self, tree: &ItemTree) {
        for child in tree.items().children(self.root) {
            if is_online(tree.items(), child) {
                self.add_service(tree.items(), child);
            }
        }
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.values().map(|s| s.name.clone()).collect();
        names.sort();
        names
    }

    pub fn is_exported(&self, name: &str) -> bool {
        self.services.values().any(|s| s.name == name)
    }

    /// Facets of an item changed since the last flush
    pub fn pending_facets(&self, service: &str, path: &str) -> Option<Facets> {
        self.services
            .values()
            .find(|s| s.name == service)
            .and_then(|s| s.pending.get(path))
            .map(|change| change.facets)
    }

    /// Process tree events, then signal the collected changes
    pub fn poll(&mut self, tree: &ItemTree) {
        self.process_events(tree);
        self.flush();
    }

    /// Apply the tree events received since the last call
    pub fn process_events(&mut self, tree: &ItemTree) {
        for event in self.observer.drain() {
            self.handle_event(tree.items(), event);
        }
    }

    /// Send one `ItemsChanged` per service with pending changes
    pub fn flush(&mut self) {
        let services: Vec<ItemId> = self.services.keys().copied().collect();
        for service in services {
            self.flush_service(service);
        }
    }

    // ========================================================================
    // Services
    // ========================================================================

    fn add_service(&mut self, items: &Items, item: ItemId) {
        if self.services.contains_key(&item) {
            return;
        }
        let Some(name) = items.get(item).map(|i| i.id().to_string()) else {
            return;
        };
        if let Err(err) = self.connection.request_name(&name) {
            warn!("could not export {}: {}", name, err);
            return;
        }
        info!("exporting service {}", name);
        self.services.insert(
            item,
            ExportedService {
                name,
                pending: BTreeMap::new(),
            },
        );
        self.track(items, item, item);
    }

    fn remove_service(&mut self, item: ItemId) {
        self.flush_service(item);
        let Some(service) = self.services.remove(&item) else {
            return;
        };
        self.paths.retain(|_, path| path.service != item);
        info!("service {} no longer exported", service.name);
        if let Err(err) = self.connection.release_name(&service.name) {
            warn!("could not release {}: {}", service.name, err);
        }
    }

    fn flush_service(&mut self, item: ItemId) {
        let Some(service) = self.services.get_mut(&item) else {
            return;
        };
        if service.pending.is_empty() {
            return;
        }
        let changes: ItemMap = std::mem::take(&mut service.pending)
            .into_iter()
            .map(|(path, change)| (path, change.properties))
            .collect();
        debug!("{} items changed on {}", changes.len(), service.name);
        let signal = Signal {
            path: "/".to_string(),
            interface: BUS_ITEM_INTERFACE.to_string(),
            member: ITEMS_CHANGED.to_string(),
            args: vec![item_map_to_wire(&changes)],
        };
        if let Err(err) = self.connection.emit(&service.name, signal) {
            warn!("could not signal changes of {}: {}", service.name, err);
        }
    }

    /// Remember the paths of a subtree of an exported service
    fn track(&mut self, items: &Items, service: ItemId, top: ItemId) {
        let paths = &mut self.paths;
        items.foreach_parent_first(top, |id, _| {
            let path = items.rel_id(id, service);
            if !path.is_empty() {
                paths.insert(id, ItemPath { service, path });
            }
        });
    }

    fn untrack(&mut self, items: &Items, top: ItemId) {
        self.paths.remove(&top);
        for id in items.descendants(top) {
            self.paths.remove(&id);
        }
    }

    fn handle_event(&mut self, items: &Items, event: ItemEvent) {
        match event {
            ItemEvent::ChildAdded { item, child } => {
                if item == self.root {
                    if is_online(items, child) {
                        self.add_service(items, child);
                    }
                } else if let Some(service) = self.paths.get(&item).map(|p| p.service) {
                    self.track(items, service, child);
                }
            }
            ItemEvent::ChildAboutToBeRemoved { item, child } => {
                if item == self.root {
                    self.remove_service(child);
                } else if let Some(service) = self.paths.get(&item).map(|p| p.service) {
                    self.flush_service(service);
                }
            }
            ItemEvent::ChildRemoved { item, child } if item != self.root => self.untrack(items, child),
            ItemEvent::StateChanged { item, .. } => {
                if items.parent(item) != Some(self.root) {
                    return;
                }
                // Events are drained late; go by the state the item has now
                if is_online(items, item) {
                    self.add_service(items, item);
                } else {
                    self.remove_service(item);
                }
            }
            ItemEvent::ValueChanged { item, value } => {
                self.record(item, Facets::VALUE, "Value", WireValue::variant(denormalize(&value)));
            }
            ItemEvent::TextChanged { item, text } => {
                self.record(item, Facets::TEXT, "Text", WireValue::variant(WireValue::Str(text)));
            }
            ItemEvent::PropertyChanged { item, name, value } => {
                if let Some((key, facet)) = property_key(&name) {
                    self.record(item, facet, key, WireValue::variant(denormalize(&value)));
                }
            }
            _ => {}
        }
    }

    fn record(&mut self, item: ItemId, facet: Facets, key: &str, value: WireValue) {
        let Some(location) = self.paths.get(&item) else {
            return;
        };
        let Some(service) = self.services.get_mut(&location.service) else {
            return;
        };
        let change = service.pending.entry(location.path.clone()).or_default();
        change.facets |= facet;
        change.properties.insert(key.to_string(), value);
    }

    // ========================================================================
    // Incoming calls
    // ========================================================================

    /// Answer a method call addressed to one of the exported services
    pub fn handle_call(&mut self, tree: &mut ItemTree, call: &IncomingCall) -> Result<Vec<WireValue>, BusError> {
        let service = self
            .services
            .iter()
            .find(|(_, s)| s.name == call.destination)
            .map(|(item, _)| *item)
            .ok_or_else(|| BusError::unknown_object(&call.path))?;
        let item = if call.path == "/" {
            Some(service)
        } else {
            tree.item_get(service, &call.path)
        };
        let item = item.ok_or_else(|| BusError::unknown_object(&call.path))?;

        if call.interface == INTROSPECTABLE_INTERFACE && call.member == "Introspect" {
            let xml = introspect_xml(tree.items(), item, call.path == "/");
            return Ok(vec![WireValue::Str(xml)]);
        }

        let has_children = tree.item(item).map(|i| i.has_children()).unwrap_or(false);
        match call.member.as_str() {
            "GetValue" if has_children => Ok(vec![WireValue::variant(WireValue::Dict(build_tree(tree.items(), item, false)))]),
            "GetValue" => Ok(vec![WireValue::variant(denormalize(&tree.local_value(item)))]),
            "GetText" if has_children => Ok(vec![WireValue::variant(WireValue::Dict(build_tree(tree.items(), item, true)))]),
            "GetText" => Ok(vec![WireValue::Str(tree.local_text(item))]),
            "GetItems" if call.path == "/" => Ok(vec![item_map_to_wire(&get_items(tree.items(), service))]),
            _ if has_children => Err(BusError::unknown_method(&call.member)),
            "SetValue" => {
                let [value] = call.args.as_slice() else {
                    return Err(BusError::invalid_args("Expected 1 argument"));
                };
                let status = tree.set_value(item, normalize(value));
                Ok(vec![WireValue::Int32(status)])
            }
            "GetMin" => Ok(vec![property_reply(tree, item, MIN)]),
            "GetMax" => Ok(vec![property_reply(tree, item, MAX)]),
            "GetDefault" => Ok(vec![property_reply(tree, item, DEFAULT)]),
            _ => Err(BusError::unknown_method(&call.member)),
        }
    }
}

fn property_reply(tree: &mut ItemTree, item: ItemId, name: &str) -> WireValue {
    WireValue::variant(denormalize(&tree.item_property(item, name, false)))
}

/// Values (or texts) of all childless items below `item`, keyed by their
/// path relative to it
fn build_tree(items: &Items, item: ItemId, text: bool) -> BTreeMap<String, WireValue> {
    let mut tree = BTreeMap::new();
    items.for_all_children(item, |id, child| {
        if child.has_children() {
            return;
        }
        let key = items.rel_id(id, item).trim_start_matches('/').to_string();
        let value = if text {
            WireValue::variant(WireValue::Str(child.text().to_string()))
        } else {
            WireValue::variant(denormalize(child.value()))
        };
        tree.insert(key, value);
    });
    tree
}

/// Everything known about the childless items of a service
fn get_items(items: &Items, service: ItemId) -> ItemMap {
    let mut map = ItemMap::new();
    items.foreach_parent_first(service, |id, item| {
        if item.has_children() {
            return;
        }
        let mut properties = PropertyMap::new();
        properties.insert("Value".to_string(), WireValue::variant(denormalize(item.value())));
        properties.insert("Text".to_string(), WireValue::variant(WireValue::Str(item.text().to_string())));
        for (name, key) in [(MIN, "Min"), (MAX, "Max"), (DEFAULT, "Default")] {
            let value = item.property(name).map(|p| &p.value).unwrap_or(&Value::Invalid);
            if value.is_valid() {
                properties.insert(key.to_string(), WireValue::variant(denormalize(value)));
            }
        }
        map.insert(items.rel_id(id, service), properties);
    });
    map
}

fn method(name: &str, args: &[(&str, &str, &str)]) -> String {
    let mut xml = format!("  <method name=\"{}\">\n", name);
    for (arg, direction, signature) in args {
        if arg.is_empty() {
            xml.push_str(&format!("   <arg direction=\"{}\" type=\"{}\"/>\n", direction, signature));
        } else {
            xml.push_str(&format!(
                "   <arg name=\"{}\" direction=\"{}\" type=\"{}\"/>\n",
                arg, direction, signature
            ));
        }
    }
    xml.push_str("  </method>\n");
    xml
}

fn introspect_xml(items: &Items, item: ItemId, is_service_root: bool) -> String {
    let has_children = items.get(item).map(|i| i.has_children()).unwrap_or(false);

    let mut xml = String::from(INTROSPECT_HEADER);
    xml.push_str("<node>\n");
    xml.push_str(&format!(" <interface name=\"{}\">\n", INTROSPECTABLE_INTERFACE));
    xml.push_str(&method("Introspect", &[("data", "out", "s")]));
    xml.push_str(" </interface>\n");

    xml.push_str(&format!(" <interface name=\"{}\">\n", BUS_ITEM_INTERFACE));
    xml.push_str(&method("GetValue", &[("", "out", "v")]));
    xml.push_str(&method("GetText", &[("", "out", "s")]));
    if !has_children {
        xml.push_str(&method("SetValue", &[("", "in", "v"), ("retval", "out", "i")]));
        xml.push_str(&method("GetMin", &[("", "out", "v")]));
        xml.push_str(&method("GetMax", &[("", "out", "v")]));
        xml.push_str(&method("GetDefault", &[("", "out", "v")]));
    }
    if is_service_root {
        xml.push_str(&method("GetItems", &[("", "out", "a{sa{sv}}")]));
        xml.push_str(&format!(
            "  <signal name=\"{}\">\n   <arg type=\"a{{sa{{sv}}}}\" name=\"changes\"/>\n  </signal>\n",
            ITEMS_CHANGED
        ));
    }
    xml.push_str(" </interface>\n");

    if let Some(item) = items.get(item) {
        for (name, _) in item.children() {
            xml.push_str(&format!(" <node name=\"{}\"/>\n", name));
        }
    }
    xml.push_str("</node>\n");
    xml
}
