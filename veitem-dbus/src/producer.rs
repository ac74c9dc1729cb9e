//! Mirror remote D-Bus services into the item tree
//!
//! Every service shows up as one item directly below the producer root,
//! named after its well-known bus name. Items below it map to object paths
//! of that service (`com.victronenergy.battery.ttyO1/Dc/0/Voltage` is
//! `/Dc/0/Voltage` on `com.victronenergy.battery.ttyO1`).
//!
//! # Lifecycle
//!
//! ```text
//! NameOwnerChanged / ListNames ──▶ service item ──GetNameOwner──▶ registered
//!                                                                    │
//!        GetItems (bulk) ◀──────────────────────────────────────────┘
//!              │ reply
//!              ▼
//!      items Synchronized, deferred per-item requests released
//! ```
//!
//! While a service is not registered or a bulk fetch is in flight, value,
//! text and property requests are remembered per item and issued once the
//! service can answer them.

use std::collections::HashMap;

use tracing::{debug, info, trace, warn};
use veitem::item::{DEFAULT, MAX, MIN};
use veitem::settings::SETTINGS_PREFIX;
use veitem::{Facets, ItemId, ItemTree, Items, Producer, ProducerId, SettingInfo, State, TreeError, Value};

use crate::config::DbusConfig;
use crate::connection::BusConnection;
use crate::error::{BusError, DbusError};
use crate::message::{BusEvent, MethodCall, Serial, SETTINGS_SERVICE};
use crate::service::ServiceBinding;
use crate::settings::{add_settings_call, parse_add_settings_reply};
use crate::wire::{denormalize, item_map_from_wire, normalize, ItemMap, PropertyMap, WireValue};

#[derive(Debug, Clone, PartialEq)]
enum CallKind {
    ListNames,
    GetNameOwner,
    GetItems,
    GetValue,
    GetText,
    Property(&'static str),
    SetValue(Value),
    AddSettings,
}

/// A call waiting for its reply
#[derive(Debug, Clone)]
struct PendingCall {
    kind: CallKind,
    service: String,
    /// Owner the call was sent to; a reply from an older owner is stale
    owner: String,
    item: Option<ItemId>,
}

/// Bus method and item property name of the fetchable properties
fn property_method(name: &str) -> Option<(&'static str, &'static str)> {
    match name {
        MIN => Some(("GetMin", MIN)),
        MAX => Some(("GetMax", MAX)),
        DEFAULT => Some(("GetDefault", DEFAULT)),
        _ => None,
    }
}

fn text_of(wire: &WireValue) -> String {
    match wire.as_str() {
        Some(text) => text.to_string(),
        None => normalize(wire).to_text(),
    }
}

/// Producer for the items of remote D-Bus services
pub struct DbusProducer {
    config: DbusConfig,
    connection: Box<dyn BusConnection>,
    root: Option<ItemId>,
    services: HashMap<String, ServiceBinding>,
    pending: HashMap<Serial, PendingCall>,
    /// Requests to issue once the service can answer them
    deferred: HashMap<ItemId, Facets>,
    /// Value of the last write per item still in `Storing`
    storing: HashMap<ItemId, Value>,
}

impl std::fmt::Debug for DbusProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbusProducer")
            .field("config", &self.config)
            .field("services", &self.services.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl DbusProducer {
    pub fn new(connection: impl BusConnection + 'static, config: DbusConfig) -> Self {
        Self {
            config,
            connection: Box::new(connection),
            root: None,
            services: HashMap::new(),
            pending: HashMap::new(),
            deferred: HashMap::new(),
            storing: HashMap::new(),
        }
    }

    pub fn config(&self) -> &DbusConfig {
        &self.config
    }

    pub fn service(&self, name: &str) -> Option<&ServiceBinding> {
        self.services.get(name)
    }

    /// Number of calls still waiting for a reply
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Feed something the bus delivered
    pub fn handle_event(&mut self, items: &mut Items, event: BusEvent) {
        match event {
            BusEvent::Reply { serial, result } => self.handle_reply(items, serial, result),
            BusEvent::NameOwnerChanged {
                name,
                old_owner,
                new_owner,
            } => self.name_owner_changed(items, &name, &old_owner, &new_owner),
            BusEvent::ItemsChanged { sender, items: changes } => {
                if let Some(root) = self.root_for_sender(&sender) {
                    self.apply_item_map(items, root, &changes);
                }
            }
            BusEvent::PropertiesChanged { sender, path, changes } => {
                let Some(root) = self.root_for_sender(&sender) else {
                    return;
                };
                let target = if path == "/" { Some(root) } else { items.item_get(root, &path) };
                if let Some(item) = target {
                    self.apply_properties(items, item, &changes);
                }
            }
        }
    }

    /// Declare settings on the settings service
    ///
    /// The current value of every accepted setting is produced below
    /// `Settings/` of the settings service item once the reply arrives.
    pub fn add_settings(&mut self, items: &mut Items, infos: &[SettingInfo]) -> Result<(), DbusError> {
        let item = self.service_item(items, SETTINGS_SERVICE);
        let serial = self.connection.call(add_settings_call(infos))?;
        self.pending.insert(
            serial,
            PendingCall {
                kind: CallKind::AddSettings,
                service: SETTINGS_SERVICE.to_string(),
                owner: String::new(),
                item,
            },
        );
        Ok(())
    }

    // ========================================================================
    // Services
    // ========================================================================

    fn send(&mut self, call: MethodCall, pending: PendingCall) -> bool {
        match self.connection.call(call) {
            Ok(serial) => {
                self.pending.insert(serial, pending);
                true
            }
            Err(err) => {
                warn!("could not send call for {}: {}", pending.service, err);
                false
            }
        }
    }

    /// The service item for a bus name, created when missing
    fn service_item(&mut self, items: &mut Items, name: &str) -> Option<ItemId> {
        let root = self.root?;
        if let Some(item) = items.child(root, name) {
            return Some(item);
        }
        match items.create_child(root, name, false) {
            Ok(item) => Some(item),
            Err(err) => {
                warn!("could not create service item {}: {}", name, err);
                None
            }
        }
    }

    /// Bind a service item to its bus name and find out whether it is online
    fn attach_service(&mut self, items: &mut Items, item: ItemId, name: &str) {
        let binding = self
            .services
            .entry(name.to_string())
            .or_insert_with(|| ServiceBinding::new(name));
        if binding.root == Some(item) {
            return;
        }
        binding.root = Some(item);
        debug!("attached service {}", name);

        if binding.is_registered() {
            self.registration_changed(items, name, true);
            return;
        }
        let call = MethodCall::daemon("GetNameOwner").with_arg(WireValue::from(name));
        let pending = PendingCall {
            kind: CallKind::GetNameOwner,
            service: name.to_string(),
            owner: String::new(),
            item: Some(item),
        };
        if !self.send(call, pending) {
            items.set_state(item, State::Offline);
        }
    }

    fn name_owner_changed(&mut self, items: &mut Items, name: &str, old_owner: &str, new_owner: &str) {
        let followed = self.config.find_victron_services && self.config.is_followed(name);
        if !followed && !self.services.contains_key(name) {
            return;
        }
        debug!("owner of {} changed from {:?} to {:?}", name, old_owner, new_owner);

        let needs_item = self
            .services
            .entry(name.to_string())
            .or_insert_with(|| ServiceBinding::new(name))
            .root
            .is_none();
        if followed && needs_item && !new_owner.is_empty() {
            let item = self.service_item(items, name);
            if let Some(binding) = self.services.get_mut(name) {
                binding.root = item;
            }
        }
        self.owner_changed(items, name, old_owner, new_owner);
    }

    fn owner_changed(&mut self, items: &mut Items, name: &str, old_owner: &str, new_owner: &str) {
        let Some(binding) = self.services.get_mut(name) else {
            return;
        };
        binding.owner = new_owner.to_string();
        binding.get_items_active = false;
        if binding.root.is_none() {
            return;
        }
        if !old_owner.is_empty() {
            info!("service {} left the bus", name);
            self.registration_changed(items, name, false);
        }
        if !new_owner.is_empty() {
            info!("service {} registered as {}", name, new_owner);
            self.registration_changed(items, name, true);
        }
    }

    fn registration_changed(&mut self, items: &mut Items, name: &str, registered: bool) {
        let Some(root) = self.services.get(name).and_then(|binding| binding.root) else {
            return;
        };
        self.item_registration_changed(items, name, root, root, registered);
        if registered {
            self.get_items(items, name);
        }
        for item in items.descendants(root) {
            if items.contains(item) {
                self.item_registration_changed(items, name, root, item, registered);
            }
        }
    }

    fn item_registration_changed(&mut self, items: &mut Items, name: &str, root: ItemId, item: ItemId, registered: bool) {
        let Some(current) = items.get(item) else { return };
        let is_leaf = current.is_leaf();
        let watched = current.is_watched();

        if !registered {
            self.storing.remove(&item);
            items.produce_value(item, Value::Invalid, State::Offline);
            items.produce_text(item, "", State::Offline);
            return;
        }

        if is_leaf {
            if watched {
                self.defer(item, Facets::VALUE | Facets::TEXT);
            }
            if !self.is_get_items_active(name) {
                if self.take_deferred(item, Facets::VALUE) {
                    self.fetch_value(items, item, true);
                }
                if self.take_deferred(item, Facets::TEXT) {
                    self.fetch_text(items, item, true);
                }
            }
            for property in [MIN, MAX, DEFAULT] {
                if self.take_deferred(item, Facets::for_property(property)) {
                    self.fetch_property(items, item, property, true);
                }
            }
        }

        if item == root {
            items.set_state(item, State::Synchronized);
            return;
        }
        if items.get(item).map(|i| i.state()) == Some(State::Offline) {
            items.set_state(item, State::Idle);
        }
        if items.get(item).map(|i| i.text_state()) == Some(State::Offline) {
            items.set_text_state(item, State::Idle);
        }
    }

    fn is_get_items_active(&self, name: &str) -> bool {
        self.services
            .get(name)
            .map(|binding| binding.get_items_active)
            .unwrap_or(false)
    }

    /// Start a bulk fetch of all items of a service
    fn get_items(&mut self, items: &mut Items, name: &str) {
        if !self.config.bulk_init {
            return;
        }
        let Some(binding) = self.services.get_mut(name) else {
            return;
        };
        if !binding.is_registered() || binding.get_items_active {
            return;
        }
        binding.get_items_active = true;
        let owner = binding.owner.clone();
        let root = binding.root;

        let call = MethodCall::bus_item(owner.clone(), "/", "GetItems");
        let pending = PendingCall {
            kind: CallKind::GetItems,
            service: name.to_string(),
            owner,
            item: root,
        };
        if !self.send(call, pending) {
            if let Some(binding) = self.services.get_mut(name) {
                binding.get_items_active = false;
            }
            if let Some(root) = root {
                self.release_deferred(items, root);
            }
        }
    }

    /// Service item and service name of an item of this producer
    fn service_of(&self, items: &Items, item: ItemId) -> Option<(String, ItemId)> {
        let root = self.root?;
        let mut current = item;
        loop {
            let parent = items.parent(current)?;
            if parent == root {
                break;
            }
            current = parent;
        }
        let name = items.get(current)?.id();
        let binding = self.services.get(name)?;
        (binding.root == Some(current)).then(|| (name.to_string(), current))
    }

    fn root_for_sender(&self, sender: &str) -> Option<ItemId> {
        self.services
            .values()
            .find(|binding| binding.is_sender(sender))
            .and_then(|binding| binding.root)
    }

    // ========================================================================
    // Deferred requests
    // ========================================================================

    fn defer(&mut self, item: ItemId, facets: Facets) {
        *self.deferred.entry(item).or_default() |= facets;
    }

    fn take_deferred(&mut self, item: ItemId, facet: Facets) -> bool {
        let Some(flags) = self.deferred.get_mut(&item) else {
            return false;
        };
        let had = flags.remove(facet);
        if flags.is_empty() {
            self.deferred.remove(&item);
        }
        had
    }

    /// Issue the value and text requests held back during a bulk fetch
    fn release_deferred(&mut self, items: &mut Items, root: ItemId) {
        for item in items.descendants(root) {
            if self.take_deferred(item, Facets::VALUE) {
                self.fetch_value(items, item, true);
            }
            if self.take_deferred(item, Facets::TEXT) {
                self.fetch_text(items, item, true);
            }
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    fn fetch_value(&mut self, items: &mut Items, item: ItemId, force: bool) -> Value {
        let Some(current) = items.get(item) else {
            return Value::Invalid;
        };
        let state = current.state();
        let value = current.value().clone();
        if !(force || state == State::Idle) || matches!(state, State::Requested | State::Preview) {
            return value;
        }
        let Some((name, root)) = self.service_of(items, item) else {
            return items.request_value(item, force);
        };
        let Some(binding) = self.services.get(&name) else {
            return value;
        };
        let (registered, bulk_active) = (binding.is_registered(), binding.get_items_active);
        let owner = binding.owner.clone();
        if !registered {
            self.defer(item, Facets::VALUE);
            items.set_state(item, State::Offline);
            return Value::Invalid;
        }
        if bulk_active {
            self.defer(item, Facets::VALUE);
            return Value::Invalid;
        }

        let call = MethodCall::bus_item(owner.clone(), items.rel_id(item, root), "GetValue");
        items.set_state(item, State::Requested);
        let pending = PendingCall {
            kind: CallKind::GetValue,
            service: name,
            owner,
            item: Some(item),
        };
        if !self.send(call, pending) {
            items.set_state(item, State::Offline);
        }
        value
    }

    fn fetch_text(&mut self, items: &mut Items, item: ItemId, force: bool) -> String {
        let Some(current) = items.get(item) else {
            return String::new();
        };
        let state = current.text_state();
        let text = current.text().to_string();
        if !(force || state == State::Idle) || matches!(state, State::Requested | State::Preview) {
            return text;
        }
        let Some((name, root)) = self.service_of(items, item) else {
            return items.request_text(item, force);
        };
        let Some(binding) = self.services.get(&name) else {
            return text;
        };
        let (registered, bulk_active) = (binding.is_registered(), binding.get_items_active);
        let owner = binding.owner.clone();
        if !registered {
            self.defer(item, Facets::TEXT);
            items.set_text_state(item, State::Offline);
            return String::new();
        }
        if bulk_active {
            self.defer(item, Facets::TEXT);
            return String::new();
        }

        let call = MethodCall::bus_item(owner.clone(), items.rel_id(item, root), "GetText");
        items.set_text_state(item, State::Requested);
        let pending = PendingCall {
            kind: CallKind::GetText,
            service: name,
            owner,
            item: Some(item),
        };
        if !self.send(call, pending) {
            items.set_text_state(item, State::Offline);
        }
        text
    }

    fn fetch_property(&mut self, items: &mut Items, item: ItemId, name: &str, force: bool) -> Value {
        let Some((method, key)) = property_method(name) else {
            return items.request_property(item, name);
        };
        let Some(current) = items.get(item) else {
            return Value::Invalid;
        };
        let (value, state) = current
            .property(key)
            .map(|property| (property.value.clone(), property.state))
            .unwrap_or((Value::Invalid, State::Idle));
        if !(force || state == State::Idle) || state == State::Requested {
            return value;
        }
        let Some((service, root)) = self.service_of(items, item) else {
            return items.request_property(item, key);
        };
        let Some(binding) = self.services.get(&service) else {
            return value;
        };
        if !binding.is_registered() {
            self.defer(item, Facets::for_property(key));
            items.set_property_state(item, key, State::Offline);
            return Value::Invalid;
        }
        let owner = binding.owner.clone();
        let call = MethodCall::bus_item(owner.clone(), items.rel_id(item, root), method);
        items.set_property_state(item, key, State::Requested);
        let pending = PendingCall {
            kind: CallKind::Property(key),
            service,
            owner,
            item: Some(item),
        };
        if !self.send(call, pending) {
            items.set_property_state(item, key, State::Offline);
        }
        value
    }

    fn store_value(&mut self, items: &mut Items, item: ItemId, value: Value) -> i32 {
        let Some((name, root)) = self.service_of(items, item) else {
            return -1;
        };
        let Some(binding) = self.services.get(&name) else {
            return -1;
        };
        let state = items.get(item).map(|i| i.state()).unwrap_or(State::Offline);
        if !binding.is_registered() || state == State::Offline {
            debug!(
                "ignoring write of {} to {:?}: not online",
                value,
                items.unique_id(item)
            );
            return -1;
        }
        if state == State::Storing && self.storing.get(&item) == Some(&value) {
            return 0;
        }

        let owner = binding.owner.clone();
        let call = MethodCall::bus_item(owner.clone(), items.rel_id(item, root), "SetValue")
            .with_arg(WireValue::variant(denormalize(&value)));
        self.storing.insert(item, value.clone());
        items.set_state(item, State::Storing);
        let pending = PendingCall {
            kind: CallKind::SetValue(value),
            service: name,
            owner,
            item: Some(item),
        };
        if !self.send(call, pending) {
            self.storing.remove(&item);
            items.set_state(item, state);
            return -1;
        }
        0
    }

    // ========================================================================
    // Incoming data
    // ========================================================================

    fn produce_value(&mut self, items: &mut Items, item: ItemId, value: Value) {
        self.take_deferred(item, Facets::VALUE);
        self.storing.remove(&item);
        items.produce_value(item, value, State::Synchronized);
    }

    fn produce_text(&mut self, items: &mut Items, item: ItemId, text: String) {
        self.take_deferred(item, Facets::TEXT);
        items.produce_text(item, text, State::Synchronized);
    }

    fn produce_property(&mut self, items: &mut Items, item: ItemId, name: &str, value: Value) {
        self.take_deferred(item, Facets::for_property(name));
        items.produce_property(item, name, value, State::Synchronized);
    }

    fn apply_properties(&mut self, items: &mut Items, item: ItemId, properties: &PropertyMap) {
        for (key, value) in properties {
            match key.as_str() {
                "Value" => self.produce_value(items, item, normalize(value)),
                "Text" => self.produce_text(items, item, text_of(value)),
                "Min" => self.produce_property(items, item, MIN, normalize(value)),
                "Max" => self.produce_property(items, item, MAX, normalize(value)),
                "Default" => self.produce_property(items, item, DEFAULT, normalize(value)),
                other => trace!("ignoring item property {}", other),
            }
        }
    }

    fn apply_item_map(&mut self, items: &mut Items, root: ItemId, changes: &ItemMap) {
        for (path, properties) in changes {
            let item = if self.config.auto_create_items {
                items.item_get_or_create_untrusted(root, path, true)
            } else {
                items.item_get(root, path)
            };
            if let Some(item) = item {
                self.apply_properties(items, item, properties);
            }
        }
    }

    // ========================================================================
    // Replies
    // ========================================================================

    fn handle_reply(&mut self, items: &mut Items, serial: Serial, result: Result<Vec<WireValue>, BusError>) {
        let Some(call) = self.pending.remove(&serial) else {
            trace!("reply to unknown serial {}", serial);
            return;
        };

        match call.kind {
            CallKind::ListNames => return self.names_listed(items, result),
            CallKind::GetNameOwner => return self.name_owner_obtained(items, &call, result),
            CallKind::AddSettings => return self.settings_added(items, &call, result),
            _ => {}
        }

        if !self.is_current(items, &call) {
            debug!("dropping stale {:?} reply for {}", call.kind, call.service);
            return;
        }
        let Some(item) = call.item else { return };

        match call.kind {
            CallKind::GetItems => self.items_obtained(items, &call.service, item, result),
            CallKind::GetValue => match result {
                Ok(args) => {
                    let value = args.first().map(normalize).unwrap_or(Value::Invalid);
                    self.produce_value(items, item, value);
                }
                Err(error) => {
                    log_reply_error(items, item, &error);
                    items.produce_value(item, Value::Invalid, State::Offline);
                }
            },
            CallKind::GetText => match result {
                Ok(args) => {
                    let text = args.first().map(text_of).unwrap_or_default();
                    self.produce_text(items, item, text);
                }
                Err(error) => {
                    log_reply_error(items, item, &error);
                    items.produce_text(item, "", State::Offline);
                }
            },
            CallKind::Property(name) => match result {
                Ok(args) => {
                    let value = args.first().map(normalize).unwrap_or(Value::Invalid);
                    self.produce_property(items, item, name, value);
                }
                Err(error) => {
                    log_reply_error(items, item, &error);
                    items.produce_property(item, name, Value::Invalid, State::Offline);
                }
            },
            CallKind::SetValue(value) => self.value_stored(items, item, value, result),
            CallKind::ListNames | CallKind::GetNameOwner | CallKind::AddSettings => {}
        }
    }

    /// A reply still applies if the service has the owner it was sent to
    /// and the item was not deleted meanwhile
    fn is_current(&self, items: &Items, call: &PendingCall) -> bool {
        let owner_matches = self
            .services
            .get(&call.service)
            .map(|binding| binding.owner == call.owner)
            .unwrap_or(false);
        owner_matches && call.item.map(|item| items.contains(item)).unwrap_or(true)
    }

    fn names_listed(&mut self, items: &mut Items, result: Result<Vec<WireValue>, BusError>) {
        let args = match result {
            Ok(args) => args,
            Err(error) => {
                warn!("listing bus names failed: {}", error);
                return;
            }
        };
        let Some(WireValue::Array(names)) = args.first().map(WireValue::unwrap_variant) else {
            warn!("unexpected ListNames reply");
            return;
        };
        let names: Vec<String> = names
            .iter()
            .filter_map(|name| name.as_str())
            .filter(|name| self.config.is_followed(name))
            .map(str::to_string)
            .collect();
        for name in names {
            if let Some(item) = self.service_item(items, &name) {
                self.attach_service(items, item, &name);
            }
        }
    }

    fn name_owner_obtained(&mut self, items: &mut Items, call: &PendingCall, result: Result<Vec<WireValue>, BusError>) {
        let Some(binding) = self.services.get(&call.service) else {
            return;
        };
        if binding.root != call.item || binding.is_registered() {
            return;
        }
        match result {
            Ok(args) => {
                let owner = args.first().and_then(WireValue::as_str).unwrap_or("").to_string();
                self.owner_changed(items, &call.service, "", &owner);
            }
            Err(error) => {
                debug!("{} has no owner: {}", call.service, error);
                if let Some(item) = call.item {
                    items.set_state(item, State::Offline);
                }
            }
        }
    }

    fn items_obtained(&mut self, items: &mut Items, name: &str, root: ItemId, result: Result<Vec<WireValue>, BusError>) {
        if let Some(binding) = self.services.get_mut(name) {
            binding.get_items_active = false;
        }
        match result {
            Ok(args) => match args.first().and_then(item_map_from_wire) {
                Some(changes) => {
                    debug!("{} reported {} items", name, changes.len());
                    self.apply_item_map(items, root, &changes);
                }
                None => warn!("unexpected GetItems reply from {}", name),
            },
            Err(error) if error.name == BusError::UNKNOWN_METHOD => {
                debug!("{} does not support GetItems", name);
            }
            Err(error) => log_reply_error(items, root, &error),
        }
        self.release_deferred(items, root);
    }

    fn value_stored(&mut self, items: &mut Items, item: ItemId, value: Value, result: Result<Vec<WireValue>, BusError>) {
        let status = match &result {
            Ok(args) => args.first().and_then(WireValue::as_i64).unwrap_or(0),
            Err(_) => -1,
        };
        let still_pending = self.storing.get(&item) == Some(&value);
        if status == 0 {
            let storing = items.get(item).map(|i| i.state()) == Some(State::Storing);
            if still_pending && storing {
                self.produce_value(items, item, value);
            }
            return;
        }

        match result {
            Err(error) => log_reply_error(items, item, &error),
            Ok(_) => warn!("write to {:?} rejected with {}", items.unique_id(item), status),
        }
        if still_pending {
            self.storing.remove(&item);
        }
        self.fetch_value(items, item, true);
    }

    fn settings_added(&mut self, items: &mut Items, call: &PendingCall, result: Result<Vec<WireValue>, BusError>) {
        let args = match result {
            Ok(args) => args,
            Err(error) => {
                warn!("AddSettings failed: {}", error);
                return;
            }
        };
        let Some(service) = call.item.filter(|item| items.contains(*item)) else {
            return;
        };
        for (path, value) in parse_add_settings_reply(&args) {
            let path = format!("{}/{}", SETTINGS_PREFIX, path);
            if let Err(err) = items.item_get_or_create_and_produce(service, &path, value) {
                warn!("could not produce setting {}: {}", path, err);
            }
        }
    }
}

fn log_reply_error(items: &Items, item: ItemId, error: &BusError) {
    // Paths that do not exist (yet) are normal
    if !error.is_unknown_object() {
        warn!("error reply for {:?}: {}", items.unique_id(item), error);
    }
}

impl Producer for DbusProducer {
    fn attached(&mut self, _items: &mut Items, root: ItemId) {
        self.root = Some(root);
        if !self.config.find_victron_services {
            return;
        }
        let pending = PendingCall {
            kind: CallKind::ListNames,
            service: String::new(),
            owner: String::new(),
            item: None,
        };
        self.send(MethodCall::daemon("ListNames"), pending);
    }

    fn item_added(&mut self, items: &mut Items, item: ItemId) {
        if self.root.is_none() || items.parent(item) != self.root {
            return;
        }
        let Some(name) = items.get(item).map(|i| i.id().to_string()) else {
            return;
        };
        self.attach_service(items, item, &name);
    }

    fn item_removed(&mut self, item: ItemId) {
        self.deferred.remove(&item);
        self.storing.remove(&item);
        for binding in self.services.values_mut() {
            if binding.root == Some(item) {
                binding.root = None;
                binding.get_items_active = false;
            }
        }
    }

    fn get_value(&mut self, items: &mut Items, item: ItemId, force: bool) -> Value {
        self.fetch_value(items, item, force)
    }

    fn get_text(&mut self, items: &mut Items, item: ItemId, force: bool) -> String {
        self.fetch_text(items, item, force)
    }

    fn set_value(&mut self, items: &mut Items, item: ItemId, value: Value) -> i32 {
        self.store_value(items, item, value)
    }

    fn item_property(&mut self, items: &mut Items, item: ItemId, name: &str, force: bool) -> Value {
        self.fetch_property(items, item, name, force)
    }
}

/// A [`DbusProducer`] registered with an [`ItemTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbusHandle {
    pid: ProducerId,
    root: ItemId,
}

impl DbusHandle {
    /// Register a D-Bus producer under `parent`
    pub fn attach(
        tree: &mut ItemTree,
        parent: ItemId,
        id: &str,
        connection: impl BusConnection + 'static,
        config: DbusConfig,
    ) -> Result<Self, DbusError> {
        let (pid, root) = tree.add_producer(parent, id, DbusProducer::new(connection, config))?;
        Ok(Self { pid, root })
    }

    pub fn producer_id(&self) -> ProducerId {
        self.pid
    }

    /// Item below which services appear
    pub fn root(&self) -> ItemId {
        self.root
    }

    pub fn service_item(&self, tree: &ItemTree, name: &str) -> Option<ItemId> {
        tree.items().child(self.root, name)
    }

    pub fn handle_event(&self, tree: &mut ItemTree, event: BusEvent) {
        tree.with_producer::<DbusProducer, _>(self.pid, |producer, items| producer.handle_event(items, event));
    }

    pub fn add_settings(&self, tree: &mut ItemTree, infos: &[SettingInfo]) -> Result<(), DbusError> {
        tree.with_producer::<DbusProducer, _>(self.pid, |producer, items| producer.add_settings(items, infos))
            .unwrap_or(Err(DbusError::Tree(TreeError::ProducerNotFound(self.pid))))
    }

    /// Run `f` against the producer
    pub fn with<R>(&self, tree: &mut ItemTree, f: impl FnOnce(&mut DbusProducer, &mut Items) -> R) -> Option<R> {
        tree.with_producer::<DbusProducer, _>(self.pid, f)
    }
}
