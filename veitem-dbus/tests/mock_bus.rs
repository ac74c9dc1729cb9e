//! Recording bus connection for tests.
//!
//! `MockBus` is cheap to clone: the producer owns one clone, the test keeps
//! another and inspects what was sent.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use veitem_dbus::{BusConnection, DbusError, MethodCall, Serial, Signal};

#[derive(Debug, Default)]
struct MockState {
    next_serial: Serial,
    calls: Vec<(Serial, MethodCall)>,
    signals: Vec<(String, Signal)>,
    names: Vec<String>,
    /// Every request and release, in order
    name_log: Vec<String>,
    failing: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<MockState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following call fail to send
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    /// Remove and return everything sent so far
    pub fn take_calls(&self) -> Vec<(Serial, MethodCall)> {
        std::mem::take(&mut self.state.lock().unwrap().calls)
    }

    /// Calls to one method, without removing them
    pub fn calls_to(&self, member: &str) -> Vec<(Serial, MethodCall)> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(_, call)| call.member == member)
            .cloned()
            .collect()
    }

    /// Serial of the only call to `member`; panics otherwise
    pub fn single(&self, member: &str) -> (Serial, MethodCall) {
        let calls = self.calls_to(member);
        assert_eq!(calls.len(), 1, "expected one {} call, got {:?}", member, calls);
        calls.into_iter().next().unwrap()
    }

    pub fn take_signals(&self) -> Vec<(String, Signal)> {
        std::mem::take(&mut self.state.lock().unwrap().signals)
    }

    /// Bus names currently held
    pub fn names(&self) -> Vec<String> {
        self.state.lock().unwrap().names.clone()
    }

    /// `request <name>` and `release <name>` entries, in order
    pub fn name_log(&self) -> Vec<String> {
        self.state.lock().unwrap().name_log.clone()
    }
}

impl BusConnection for MockBus {
    fn call(&mut self, call: MethodCall) -> Result<Serial, DbusError> {
        let mut state = self.state.lock().unwrap();
        if state.failing {
            return Err(DbusError::Send("mock bus failing".to_string()));
        }
        state.next_serial += 1;
        let serial = state.next_serial;
        state.calls.push((serial, call));
        Ok(serial)
    }

    fn emit(&mut self, sender: &str, signal: Signal) -> Result<(), DbusError> {
        self.state.lock().unwrap().signals.push((sender.to_string(), signal));
        Ok(())
    }

    fn request_name(&mut self, name: &str) -> Result<(), DbusError> {
        let mut state = self.state.lock().unwrap();
        state.names.push(name.to_string());
        state.name_log.push(format!("request {}", name));
        Ok(())
    }

    fn release_name(&mut self, name: &str) -> Result<(), DbusError> {
        let mut state = self.state.lock().unwrap();
        state.names.retain(|held| held != name);
        state.name_log.push(format!("release {}", name));
        Ok(())
    }
}
