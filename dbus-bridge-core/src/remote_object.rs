//! Introspected remote D-Bus objects
//!
//! A [`RemoteObject`] is created from one `Introspect` round-trip and is
//! immutable afterward, apart from its one-time registration with the
//! management session. It knows how to:
//!
//! - find methods, signals and properties by name
//! - call a method, encoding arguments against their declared signatures
//! - publish itself as a data object, with an event schema per signal
//! - turn matching D-Bus signals into management events
//!
//! Objects are identified by an [`ObjectKey`], rendered as
//! `bus_name@object_path@interface`.

use crate::connection::{
    BusConnection, SignalMessage, INTROSPECTABLE_INTERFACE, PROPERTIES_INTERFACE,
};
use crate::error::{BridgeError, Result};
use crate::introspection::{
    ArgumentDescriptor, InterfaceModel, IntrospectionNode, MethodDescriptor, SignalDescriptor,
};
use crate::session::{
    AgentSession, DataObject, Event, Schema, SchemaId, SchemaMethod, SchemaProperty, Severity,
};
use crate::signature::{decode, encode};
use crate::value::DynamicValue;
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zbus::zvariant::Value;

/// Identity of a remote object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub bus_name: String,
    pub object_path: String,
    pub interface: Option<String>,
}

impl ObjectKey {
    /// Key covering every interface of the object
    pub fn new(bus_name: impl Into<String>, object_path: impl Into<String>) -> Self {
        Self {
            bus_name: bus_name.into(),
            object_path: object_path.into(),
            interface: None,
        }
    }

    /// Key restricted to one interface
    pub fn with_interface(
        bus_name: impl Into<String>,
        object_path: impl Into<String>,
        interface: impl Into<String>,
    ) -> Self {
        Self {
            interface: Some(interface.into()),
            ..Self::new(bus_name, object_path)
        }
    }

    /// Parse an object-level address `bus_name@object_path@interface`
    ///
    /// ```
    /// use dbus_bridge_core::ObjectKey;
    ///
    /// let key = ObjectKey::parse("com.example.Server@/calc@com.example.Calc").unwrap();
    /// assert_eq!(key.object_path, "/calc");
    /// assert_eq!(key.interface.as_deref(), Some("com.example.Calc"));
    ///
    /// assert!(ObjectKey::parse("com.example.Server@/calc").is_err());
    /// ```
    pub fn parse(address: &str) -> Result<Self> {
        let mut parts = address.splitn(3, '@');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(bus), Some(path), Some(interface))
                if !bus.is_empty() && path.starts_with('/') && !interface.is_empty() =>
            {
                Ok(Self::with_interface(bus, path, interface))
            }
            _ => Err(BridgeError::InvalidAddress(address.to_string())),
        }
    }

    /// Schema package shared by the object and its events
    pub fn package(&self) -> String {
        format!("{}@{}", self.bus_name, self.object_path)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.bus_name, self.object_path)?;
        if let Some(interface) = &self.interface {
            write!(f, "@{}", interface)?;
        }
        Ok(())
    }
}

/// A method together with the interface declaring it
#[derive(Debug, Clone, Copy)]
pub struct MethodRef<'a> {
    pub interface: &'a InterfaceModel,
    pub method: &'a MethodDescriptor,
}

/// A D-Bus object known through introspection
pub struct RemoteObject {
    connection: Arc<dyn BusConnection>,
    key: ObjectKey,
    interfaces: Vec<InterfaceModel>,
    listen_for_signals: bool,
    registered: AtomicBool,
    session: OnceLock<Arc<dyn AgentSession>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    /// Schemas the session already accepted, kept across failed registrations
    published: Mutex<BTreeSet<SchemaId>>,
}

impl RemoteObject {
    /// Introspect the object named by `key`
    ///
    /// With an interface in the key, only that interface is kept.
    ///
    /// # Errors
    ///
    /// - `Introspection` if the call fails or the object exposes no interface
    /// - `UnknownInterface` if the requested interface is not exposed
    pub async fn introspect(
        connection: Arc<dyn BusConnection>,
        key: ObjectKey,
        listen_for_signals: bool,
    ) -> Result<Self> {
        let node = introspect_node(connection.as_ref(), &key.bus_name, &key.object_path).await?;

        let interfaces = match &key.interface {
            Some(name) => {
                let interface = node
                    .interfaces
                    .into_iter()
                    .find(|i| &i.name == name)
                    .ok_or_else(|| BridgeError::UnknownInterface(name.clone()))?;
                vec![interface]
            }
            None => node.interfaces,
        };

        if interfaces.is_empty() {
            return Err(BridgeError::Introspection(format!(
                "no interfaces found for {}",
                key
            )));
        }

        debug!("Introspected {} ({} interfaces)", key, interfaces.len());

        Ok(Self {
            connection,
            key,
            interfaces,
            listen_for_signals,
            registered: AtomicBool::new(false),
            session: OnceLock::new(),
            listeners: Mutex::new(Vec::new()),
            published: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    pub fn interfaces(&self) -> &[InterfaceModel] {
        &self.interfaces
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn listens_for_signals(&self) -> bool {
        self.listen_for_signals
    }

    pub fn method(&self, name: &str) -> Option<MethodRef<'_>> {
        self.interfaces.iter().find_map(|interface| {
            interface
                .method(name)
                .map(|method| MethodRef { interface, method })
        })
    }

    /// Method lookup restricted to one interface
    pub fn method_on(&self, interface: &str, name: &str) -> Option<MethodRef<'_>> {
        self.interfaces
            .iter()
            .filter(|i| i.name == interface)
            .find_map(|interface| {
                interface
                    .method(name)
                    .map(|method| MethodRef { interface, method })
            })
    }

    pub fn signal(
        &self,
        interface: &str,
        name: &str,
    ) -> Option<(&InterfaceModel, &SignalDescriptor)> {
        self.interfaces
            .iter()
            .filter(|i| i.name == interface)
            .find_map(|i| i.signal(name).map(|signal| (i, signal)))
    }

    pub fn property(&self, name: &str) -> Option<&ArgumentDescriptor> {
        self.interfaces.iter().find_map(|i| i.property(name))
    }

    /// Call `method` with positional arguments
    ///
    /// The argument count is checked against the IN arguments before
    /// anything is sent. Every value present in the reply is decoded; the
    /// reply count is not checked here.
    pub async fn call(
        &self,
        method: MethodRef<'_>,
        args: &[DynamicValue],
    ) -> Result<Vec<DynamicValue>> {
        let expected = method.method.in_count();
        if args.len() != expected {
            return Err(BridgeError::ArgumentCount {
                expected,
                found: args.len(),
            });
        }

        let encoded = method
            .method
            .in_args()
            .zip(args)
            .enumerate()
            .map(|(index, (arg, value))| {
                encode(value, &arg.signature).map_err(|e| e.for_argument(index, &arg.name))
            })
            .collect::<Result<Vec<Value<'static>>>>()?;

        debug!(
            "Calling {}.{} on {}",
            method.interface.name, method.method.name, self.key
        );

        let reply = self
            .connection
            .call_method(
                &self.key.bus_name,
                &self.key.object_path,
                &method.interface.name,
                &method.method.name,
                encoded,
            )
            .await?;

        Ok(reply.iter().map(|value| decode(value)).collect())
    }

    /// Publish this object to the management session
    ///
    /// Registers one data schema with every method and property, an event
    /// schema per signal when listening for signals, and one data object
    /// named after the key. Property values are seeded from `GetAll` when
    /// that call succeeds. Properties named in `blacklist` are skipped.
    ///
    /// Calling this again after a successful registration does nothing.
    /// After a failed one, schemas the session already accepted are not
    /// sent a second time.
    pub async fn add_to_schema(
        self: &Arc<Self>,
        session: Arc<dyn AgentSession>,
        blacklist: &[String],
    ) -> Result<()> {
        if self.is_registered() {
            return Ok(());
        }

        let mut subscriptions = Vec::new();
        if self.listen_for_signals {
            for interface in self.interfaces.iter().filter(|i| !i.signals.is_empty()) {
                subscriptions.push(self.connection.subscribe_signals(&interface.name).await?);
            }
        }

        let package = self.key.package();
        let schema_id = SchemaId::new(package.clone(), self.schema_class());
        let mut schema = Schema::data(schema_id.clone());
        let mut events = Vec::new();

        for interface in &self.interfaces {
            schema
                .methods
                .extend(interface.methods.iter().map(|method| SchemaMethod {
                    name: method.name.clone(),
                    arguments: method.all_args().iter().map(SchemaProperty::from).collect(),
                }));
            schema.properties.extend(
                interface
                    .properties
                    .iter()
                    .filter(|p| !blacklist.contains(&p.name))
                    .map(SchemaProperty::from),
            );

            if self.listen_for_signals {
                for signal in &interface.signals {
                    let mut event = Schema::event(SchemaId::new(
                        package.clone(),
                        format!("{}.{}", interface.name, signal.name),
                    ));
                    event.properties = signal.args.iter().map(SchemaProperty::from).collect();
                    events.push(event);
                }
            }
        }

        let properties = self.fetch_properties(blacklist).await;

        for schema in std::iter::once(schema).chain(events) {
            self.publish_schema(session.as_ref(), schema)?;
        }
        session.add_data(DataObject {
            schema: schema_id,
            name: self.key.to_string(),
            properties,
        })?;

        let _ = self.session.set(session);
        self.registered.store(true, Ordering::SeqCst);

        for mut stream in subscriptions {
            let object = Arc::downgrade(self);
            let task = tokio::spawn(async move {
                while let Some(signal) = stream.next().await {
                    let Some(object) = object.upgrade() else {
                        break;
                    };
                    object.signal_received(&signal);
                }
            });
            self.listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(task);
        }

        info!("Registered DBus object {}", self.key);
        Ok(())
    }

    /// Register `schema` unless an earlier attempt already did
    fn publish_schema(&self, session: &dyn AgentSession, schema: Schema) -> Result<()> {
        let mut published = self
            .published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if published.contains(&schema.id) {
            return Ok(());
        }

        let id = schema.id.clone();
        session.register_schema(schema)?;
        published.insert(id);
        Ok(())
    }

    fn schema_class(&self) -> String {
        match &self.key.interface {
            Some(interface) => interface.clone(),
            None => self
                .interfaces
                .iter()
                .map(|i| i.name.as_str())
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    /// One-shot `GetAll` per interface; failures only warn
    async fn fetch_properties(&self, blacklist: &[String]) -> BTreeMap<String, DynamicValue> {
        let mut values = BTreeMap::new();

        for interface in self.interfaces.iter().filter(|i| !i.properties.is_empty()) {
            let reply = self
                .connection
                .call_method(
                    &self.key.bus_name,
                    &self.key.object_path,
                    PROPERTIES_INTERFACE,
                    "GetAll",
                    vec![Value::from(interface.name.clone())],
                )
                .await;

            let reply = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(
                        "Unable to fetch properties of {} on {}: {}",
                        interface.name, self.key, e
                    );
                    continue;
                }
            };

            let Some(DynamicValue::List(pairs)) = reply.first().map(|v| decode(v)) else {
                warn!("GetAll on {} returned no property list", self.key);
                continue;
            };

            for pair in pairs {
                if let DynamicValue::List(mut entry) = pair {
                    if entry.len() != 2 {
                        continue;
                    }
                    let value = entry.pop().unwrap_or_default();
                    if let Some(DynamicValue::String(name)) = entry.pop() {
                        if !blacklist.contains(&name) {
                            values.insert(name, value);
                        }
                    }
                }
            }
        }

        values
    }

    /// Route a D-Bus signal to the management session
    ///
    /// Returns `true` when the signal belongs to this object and was turned
    /// into an event. Failures to raise the event are logged only.
    pub fn signal_received(&self, message: &SignalMessage) -> bool {
        if !self.listen_for_signals || message.path != self.key.object_path {
            return false;
        }

        let Some((interface, signal)) = self.signal(&message.interface, &message.member) else {
            return false;
        };

        let Some(session) = self.session.get() else {
            return false;
        };

        if message.args.len() < signal.args.len() {
            error!(
                "Signal {}.{} from {} carries {} arguments, {} declared",
                interface.name,
                signal.name,
                self.key,
                message.args.len(),
                signal.args.len()
            );
            return false;
        }

        let properties = signal
            .args
            .iter()
            .zip(&message.args)
            .map(|(arg, value)| (arg.name.clone(), decode(value)))
            .collect();

        let event = Event {
            schema: SchemaId::new(
                self.key.package(),
                format!("{}.{}", interface.name, signal.name),
            ),
            severity: Severity::Critical,
            properties,
        };

        if let Err(e) = session.raise_event(event) {
            error!(
                "Failed to raise event for signal {}.{}: {}",
                interface.name, signal.name, e
            );
        }

        true
    }

    /// Introspect, look up and call without caching the object
    pub async fn call_once(
        connection: Arc<dyn BusConnection>,
        key: ObjectKey,
        method: &str,
        args: &[DynamicValue],
    ) -> Result<Vec<DynamicValue>> {
        let object = Self::introspect(connection, key, false).await?;
        let method_ref = object
            .method(method)
            .ok_or_else(|| BridgeError::UnknownMethod {
                method: method.to_string(),
                interface: object.schema_class(),
            })?;
        object.call(method_ref, args).await
    }

    /// Every path under `root` that exposes at least one interface
    ///
    /// Nodes that fail to introspect are skipped along with their subtree.
    pub async fn object_paths(
        connection: &dyn BusConnection,
        bus_name: &str,
        root: &str,
    ) -> Vec<String> {
        let mut paths = Vec::new();
        let mut pending = vec![root.to_string()];

        while let Some(path) = pending.pop() {
            let node = match introspect_node(connection, bus_name, &path).await {
                Ok(node) => node,
                Err(e) => {
                    debug!("Skipping {}{}: {}", bus_name, path, e);
                    continue;
                }
            };

            pending.extend(node.children.iter().rev().map(|child| child_path(&path, child)));
            if !node.interfaces.is_empty() {
                paths.push(path);
            }
        }

        paths
    }

    /// Sorted interface names at one path, empty when introspection fails
    pub async fn interface_names(
        connection: &dyn BusConnection,
        bus_name: &str,
        path: &str,
    ) -> Vec<String> {
        match introspect_node(connection, bus_name, path).await {
            Ok(node) => {
                let mut names = node.interface_names();
                names.sort();
                names
            }
            Err(e) => {
                debug!("Unable to list interfaces of {}{}: {}", bus_name, path, e);
                Vec::new()
            }
        }
    }
}

impl Drop for RemoteObject {
    fn drop(&mut self) {
        let listeners = self
            .listeners
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for listener in listeners.drain(..) {
            listener.abort();
        }
    }
}

fn child_path(parent: &str, child: &str) -> String {
    if child.starts_with('/') {
        child.to_string()
    } else if parent.ends_with('/') {
        format!("{}{}", parent, child)
    } else {
        format!("{}/{}", parent, child)
    }
}

async fn introspect_node(
    connection: &dyn BusConnection,
    bus_name: &str,
    path: &str,
) -> Result<IntrospectionNode> {
    let reply = connection
        .call_method(bus_name, path, INTROSPECTABLE_INTERFACE, "Introspect", Vec::new())
        .await
        .map_err(|e| BridgeError::Introspection(format!("{}{}: {}", bus_name, path, e)))?;

    let xml = match reply.first().map(|v| decode(v)) {
        Some(DynamicValue::String(xml)) => xml,
        _ => {
            return Err(BridgeError::Introspection(format!(
                "{}{}: Introspect returned no XML",
                bus_name, path
            )))
        }
    };

    IntrospectionNode::parse(&xml)
}
