//! Shared fixtures for bridge integration tests
//!
//! `MockBus` answers `Introspect` from registered XML and every other call
//! from closures keyed by (bus, path, interface, method). All calls are
//! recorded. `RecordingSession` keeps everything the bridge publishes.

#![allow(dead_code)]

use async_trait::async_trait;
use dbus_bridge_core::connection::INTROSPECTABLE_INTERFACE;
use dbus_bridge_core::signature::{decode, encode};
use dbus_bridge_core::zvariant::{OwnedValue, Value};
use dbus_bridge_core::{
    AgentSession, BridgeError, BusConnection, DataObject, DynamicValue, Event, Result, Schema,
    SignalMessage,
};
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const SERVER: &str = "com.example.Server";
pub const CALC: &str = "com.example.Calc";
pub const FOO: &str = "com.example.Foo";

pub const CALC_XML: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
 "http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node>
  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect">
      <arg name="xml_data" type="s" direction="out"/>
    </method>
  </interface>
  <interface name="com.example.Calc">
    <method name="Add">
      <arg name="a" type="i" direction="in"/>
      <arg name="b" type="i" direction="in"/>
      <arg name="result" type="i" direction="out"/>
    </method>
    <method name="Split">
      <arg name="text" type="s" direction="in"/>
      <arg name="head" type="s" direction="out"/>
      <arg name="tail" type="s" direction="out"/>
    </method>
    <signal name="Overflow">
      <arg name="operation" type="s"/>
      <arg name="value" type="x"/>
    </signal>
  </interface>
</node>"#;

pub const FOO_XML: &str = r#"<node>
  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect">
      <arg name="xml_data" type="s" direction="out"/>
    </method>
  </interface>
  <interface name="org.freedesktop.DBus.Properties">
    <method name="GetAll">
      <arg name="interface_name" type="s" direction="in"/>
      <arg name="props" type="a{sv}" direction="out"/>
    </method>
  </interface>
  <interface name="com.example.Foo">
    <method name="Ping"/>
    <property name="Level" type="i" access="read"/>
    <property name="Secret" type="s" access="readwrite"/>
  </interface>
</node>"#;

pub const DBUS_XML: &str = r#"<node>
  <interface name="org.freedesktop.DBus">
    <method name="ListNames">
      <arg direction="out" type="as"/>
    </method>
    <method name="ListActivatableNames">
      <arg direction="out" type="as"/>
    </method>
  </interface>
</node>"#;

pub const ROOT_XML: &str = r#"<node>
  <node name="calc"/>
  <node name="empty"/>
  <node name="missing"/>
</node>"#;

pub const EMPTY_XML: &str = "<node/>";

type Handler = Box<dyn Fn(&[DynamicValue]) -> Result<Vec<Value<'static>>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub destination: String,
    pub path: String,
    pub interface: String,
    pub method: String,
    pub args: Vec<DynamicValue>,
}

/// In-memory D-Bus
#[derive(Default)]
pub struct MockBus {
    objects: Mutex<HashMap<(String, String), String>>,
    handlers: Mutex<HashMap<(String, String, String, String), Handler>>,
    calls: Mutex<Vec<RecordedCall>>,
    subscribers: Mutex<Vec<(String, mpsc::UnboundedSender<SignalMessage>)>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_object(&self, bus: &str, path: &str, xml: &str) {
        self.objects
            .lock()
            .unwrap()
            .insert((bus.to_string(), path.to_string()), xml.to_string());
    }

    pub fn on_call<F>(&self, bus: &str, path: &str, interface: &str, method: &str, handler: F)
    where
        F: Fn(&[DynamicValue]) -> Result<Vec<Value<'static>>> + Send + Sync + 'static,
    {
        self.handlers.lock().unwrap().insert(
            (
                bus.to_string(),
                path.to_string(),
                interface.to_string(),
                method.to_string(),
            ),
            Box::new(handler),
        );
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.method == method)
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscribers
            .lock()
            .unwrap()
            .iter()
            .map(|(interface, _)| interface.clone())
            .collect()
    }

    /// Deliver a signal to every subscriber of `interface`
    pub fn emit_signal(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        args: &[(DynamicValue, &str)],
    ) -> usize {
        let subscribers = self.subscribers.lock().unwrap();
        let mut delivered = 0;
        for (subscribed, sender) in subscribers.iter() {
            if subscribed != interface {
                continue;
            }
            let message = signal(path, interface, member, args);
            if sender.unbounded_send(message).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

#[async_trait]
impl BusConnection for MockBus {
    async fn call_method(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        method: &str,
        args: Vec<Value<'static>>,
    ) -> Result<Vec<OwnedValue>> {
        let args: Vec<DynamicValue> = args.iter().map(decode).collect();
        self.calls.lock().unwrap().push(RecordedCall {
            destination: destination.to_string(),
            path: path.to_string(),
            interface: interface.to_string(),
            method: method.to_string(),
            args: args.clone(),
        });

        if interface == INTROSPECTABLE_INTERFACE && method == "Introspect" {
            let objects = self.objects.lock().unwrap();
            return match objects.get(&(destination.to_string(), path.to_string())) {
                Some(xml) => Ok(vec![owned(Value::from(xml.clone()))]),
                None => Err(BridgeError::Wire(format!(
                    "org.freedesktop.DBus.Error.ServiceUnknown: {}{}",
                    destination, path
                ))),
            };
        }

        let handlers = self.handlers.lock().unwrap();
        let key = (
            destination.to_string(),
            path.to_string(),
            interface.to_string(),
            method.to_string(),
        );
        match handlers.get(&key) {
            Some(handler) => Ok(handler(&args)?.into_iter().map(owned).collect()),
            None => Err(BridgeError::Wire(format!(
                "org.freedesktop.DBus.Error.UnknownMethod: {}.{}",
                interface, method
            ))),
        }
    }

    async fn subscribe_signals(&self, interface: &str) -> Result<BoxStream<'static, SignalMessage>> {
        let (sender, receiver) = mpsc::unbounded();
        self.subscribers
            .lock()
            .unwrap()
            .push((interface.to_string(), sender));
        Ok(receiver.boxed())
    }
}

pub fn owned(value: Value<'static>) -> OwnedValue {
    OwnedValue::try_from(value).unwrap()
}

pub fn signal(
    path: &str,
    interface: &str,
    member: &str,
    args: &[(DynamicValue, &str)],
) -> SignalMessage {
    SignalMessage {
        sender: Some(":1.7".to_string()),
        path: path.to_string(),
        interface: interface.to_string(),
        member: member.to_string(),
        args: args
            .iter()
            .map(|(value, signature)| owned(encode(value, signature).unwrap()))
            .collect(),
    }
}

/// Management session keeping every published item
#[derive(Default)]
pub struct RecordingSession {
    pub schemas: Mutex<Vec<Schema>>,
    pub data: Mutex<Vec<DataObject>>,
    pub events: Mutex<Vec<Event>>,
    fail_events: AtomicBool,
    fail_data: AtomicBool,
}

impl RecordingSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_events(&self) {
        self.fail_events.store(true, Ordering::SeqCst);
    }

    /// Make `add_data` fail until called again with `false`
    pub fn fail_data(&self, fail: bool) {
        self.fail_data.store(fail, Ordering::SeqCst);
    }

    pub fn schemas(&self) -> Vec<Schema> {
        self.schemas.lock().unwrap().clone()
    }

    pub fn data(&self) -> Vec<DataObject> {
        self.data.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Poll until at least `count` events arrived or one second passed
    pub async fn wait_for_events(&self, count: usize) -> Vec<Event> {
        for _ in 0..100 {
            if self.events.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.events()
    }
}

impl AgentSession for RecordingSession {
    fn register_schema(&self, schema: Schema) -> Result<()> {
        self.schemas.lock().unwrap().push(schema);
        Ok(())
    }

    fn add_data(&self, object: DataObject) -> Result<()> {
        if self.fail_data.load(Ordering::SeqCst) {
            return Err(BridgeError::Session("broker unavailable".to_string()));
        }
        self.data.lock().unwrap().push(object);
        Ok(())
    }

    fn raise_event(&self, event: Event) -> Result<()> {
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(BridgeError::Session("broker unavailable".to_string()));
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}
