//! Inbound method dispatch
//!
//! The management bus invokes methods either on the bridge itself or on an
//! object the bridge published earlier. [`InboundCall::parse`] decides which
//! once, from the target address:
//!
//! - the bridge name (default `DBusBridge`) selects a [`BridgeOperation`]
//! - `bus_name@object_path@interface` selects an [`ObjectMethodCall`]
//!
//! [`BridgeDispatcher`] then resolves the remote object, through its
//! [`ObjectCache`], and performs the call.
//!
//! ## Bridge Operations
//!
//! | Method              | Arguments                                        | Returns        |
//! |---------------------|--------------------------------------------------|----------------|
//! | `call`              | bus_name, object_path, interface, method_name, args | `results`   |
//! | `list_dbus_objects` | only_well_known                                  | `dbus_objects` |
//! | `list_object_paths` | bus_name                                         | `object_paths` |
//! | `list_interfaces`   | bus_name, object_path                            | `interfaces`   |
//! | `add_dbus_object`   | bus_name, object_path, interface                 | nothing        |

use crate::connection::{
    BusConnection, DBUS_INTERFACE, DBUS_PATH, DBUS_SERVICE, INTROSPECTABLE_INTERFACE,
    PROPERTIES_INTERFACE,
};
use crate::error::{BridgeError, Result};
use crate::introspection::Direction;
use crate::remote_object::{ObjectKey, RemoteObject};
use crate::session::{
    AgentSession, DataObject, Schema, SchemaDataType, SchemaId, SchemaMethod, SchemaProperty,
};
use crate::value::DynamicValue;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Schema package of the bridge data object
pub const BRIDGE_PACKAGE: &str = "org.dbusbridge";

/// Default name of the bridge data object
pub const DEFAULT_BRIDGE_NAME: &str = "DBusBridge";

/// Default number of unregistered objects kept by the cache
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Named return values of one method invocation
pub type ReturnArguments = BTreeMap<String, DynamicValue>;

/// One inbound method invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodRequest {
    /// Bridge name or `bus_name@object_path@interface`
    pub address: String,
    pub method: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, DynamicValue>,
}

impl MethodRequest {
    pub fn new(address: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            method: method.into(),
            arguments: BTreeMap::new(),
        }
    }

    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<DynamicValue>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }
}

/// Operations on the bridge itself
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeOperation {
    Call {
        key: ObjectKey,
        method: String,
        args: Vec<DynamicValue>,
    },
    ListDbusObjects {
        only_well_known: bool,
    },
    ListObjectPaths {
        bus_name: String,
    },
    ListInterfaces {
        bus_name: String,
        object_path: String,
    },
    AddDbusObject {
        bus_name: String,
        object_path: String,
        interface: Option<String>,
    },
}

/// A method call on a published object, arguments by name
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMethodCall {
    pub key: ObjectKey,
    pub method: String,
    pub arguments: BTreeMap<String, DynamicValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundCall {
    Bridge(BridgeOperation),
    Object(ObjectMethodCall),
}

impl InboundCall {
    /// Classify a request by its address
    ///
    /// # Errors
    ///
    /// - `NotImplemented` for an unknown bridge method
    /// - `MissingArgument` or `Conversion` for malformed bridge arguments
    /// - `InvalidAddress` for an object address without an interface
    pub fn parse(request: MethodRequest, bridge_name: &str) -> Result<Self> {
        if request.address != bridge_name {
            return Ok(Self::Object(ObjectMethodCall {
                key: ObjectKey::parse(&request.address)?,
                method: request.method,
                arguments: request.arguments,
            }));
        }

        let args = &request.arguments;
        let operation = match request.method.as_str() {
            "call" => {
                let bus_name = string_arg(args, "bus_name")?;
                let object_path = string_arg(args, "object_path")?;
                let key = match optional_string_arg(args, "interface")? {
                    Some(interface) => ObjectKey::with_interface(bus_name, object_path, interface),
                    None => ObjectKey::new(bus_name, object_path),
                };
                BridgeOperation::Call {
                    key,
                    method: string_arg(args, "method_name")?,
                    args: match args.get("args") {
                        Some(value) => value.as_list()?.to_vec(),
                        None => Vec::new(),
                    },
                }
            }
            "list_dbus_objects" => BridgeOperation::ListDbusObjects {
                only_well_known: match args.get("only_well_known") {
                    Some(value) => value.as_bool()?,
                    None => false,
                },
            },
            "list_object_paths" => BridgeOperation::ListObjectPaths {
                bus_name: string_arg(args, "bus_name")?,
            },
            "list_interfaces" => BridgeOperation::ListInterfaces {
                bus_name: string_arg(args, "bus_name")?,
                object_path: string_arg(args, "object_path")?,
            },
            "add_dbus_object" => BridgeOperation::AddDbusObject {
                bus_name: string_arg(args, "bus_name")?,
                object_path: string_arg(args, "object_path")?,
                interface: optional_string_arg(args, "interface")?,
            },
            other => return Err(BridgeError::NotImplemented(other.to_string())),
        };

        Ok(Self::Bridge(operation))
    }
}

fn string_arg(args: &BTreeMap<String, DynamicValue>, name: &str) -> Result<String> {
    let value = args
        .get(name)
        .ok_or_else(|| BridgeError::MissingArgument(name.to_string()))?;
    Ok(value.as_str()?.to_string())
}

/// Absent and empty strings both mean "not given"
fn optional_string_arg(args: &BTreeMap<String, DynamicValue>, name: &str) -> Result<Option<String>> {
    match args.get(name) {
        None | Some(DynamicValue::Void) => Ok(None),
        Some(value) => {
            let value = value.as_str()?;
            Ok((!value.is_empty()).then(|| value.to_string()))
        }
    }
}

/// Remote objects by key
///
/// Objects published to the session stay for the life of the bridge.
/// Objects created only to serve calls are kept in least-recently-used
/// order and evicted beyond `capacity` (0 keeps them all).
pub struct ObjectCache {
    registered: HashMap<ObjectKey, Arc<RemoteObject>>,
    transient: IndexMap<ObjectKey, Arc<RemoteObject>>,
    capacity: usize,
}

impl ObjectCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            registered: HashMap::new(),
            transient: IndexMap::new(),
            capacity,
        }
    }

    /// Look up an object, refreshing its recency if it is transient
    pub fn get(&mut self, key: &ObjectKey) -> Option<Arc<RemoteObject>> {
        if let Some(object) = self.registered.get(key) {
            return Some(object.clone());
        }

        let object = self.transient.shift_remove(key)?;
        self.transient.insert(key.clone(), object.clone());
        Some(object)
    }

    pub fn get_registered(&self, key: &ObjectKey) -> Option<Arc<RemoteObject>> {
        self.registered.get(key).cloned()
    }

    /// Store an object; registered objects replace any transient entry
    pub fn insert(&mut self, object: Arc<RemoteObject>) {
        let key = object.key().clone();
        if object.is_registered() {
            self.transient.shift_remove(&key);
            self.registered.insert(key, object);
            return;
        }

        self.transient.insert(key, object);
        while self.capacity > 0 && self.transient.len() > self.capacity {
            if let Some((evicted, _)) = self.transient.shift_remove_index(0) {
                debug!("Evicted {} from object cache", evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.registered.len() + self.transient.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.registered.clear();
        self.transient.clear();
    }
}

/// Dispatcher settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOptions {
    pub bridge_name: String,
    pub listen_for_signals: bool,
    /// Properties skipped when every interface of an object is registered
    pub property_blacklist: Vec<String>,
    pub object_cache_capacity: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            bridge_name: DEFAULT_BRIDGE_NAME.to_string(),
            listen_for_signals: true,
            property_blacklist: Vec::new(),
            object_cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Front controller for inbound management calls
pub struct BridgeDispatcher {
    connection: Arc<dyn BusConnection>,
    session: Arc<dyn AgentSession>,
    options: BridgeOptions,
    cache: Mutex<ObjectCache>,
}

impl BridgeDispatcher {
    pub fn new(
        connection: Arc<dyn BusConnection>,
        session: Arc<dyn AgentSession>,
        options: BridgeOptions,
    ) -> Self {
        let cache = ObjectCache::new(options.object_cache_capacity);
        Self {
            connection,
            session,
            options,
            cache: Mutex::new(cache),
        }
    }

    /// Publish the bridge schema and the bridge data object
    pub fn register_bridge(&self, uuid: &str, hostname: &str) -> Result<()> {
        let id = SchemaId::new(BRIDGE_PACKAGE, self.options.bridge_name.clone());
        let mut schema = Schema::data(id.clone());
        schema.methods = bridge_methods();
        schema.properties = vec![
            SchemaProperty::new("uuid", SchemaDataType::String, Direction::Out),
            SchemaProperty::new("hostname", SchemaDataType::String, Direction::Out),
        ];
        self.session.register_schema(schema)?;

        let mut properties = BTreeMap::new();
        properties.insert("uuid".to_string(), DynamicValue::from(uuid));
        properties.insert("hostname".to_string(), DynamicValue::from(hostname));
        self.session.add_data(DataObject {
            schema: id,
            name: self.options.bridge_name.clone(),
            properties,
        })?;

        info!("Bridge {} registered", self.options.bridge_name);
        Ok(())
    }

    /// Handle one inbound method invocation
    pub async fn handle(&self, request: MethodRequest) -> Result<ReturnArguments> {
        debug!("Method {} called on {}", request.method, request.address);

        match InboundCall::parse(request, &self.options.bridge_name)? {
            InboundCall::Bridge(operation) => self.handle_bridge(operation).await,
            InboundCall::Object(call) => self.handle_object(call).await,
        }
    }

    async fn handle_bridge(&self, operation: BridgeOperation) -> Result<ReturnArguments> {
        let mut returns = ReturnArguments::new();

        match operation {
            BridgeOperation::Call { key, method, args } => {
                let object = self.resolve(&key).await?;
                let method_ref = match &key.interface {
                    Some(interface) => object.method_on(interface, &method),
                    None => object.method(&method),
                }
                .ok_or_else(|| BridgeError::UnknownMethod {
                    method: method.clone(),
                    interface: key.interface.clone().unwrap_or_default(),
                })?;

                let results = object.call(method_ref, &args).await?;
                returns.insert("results".to_string(), DynamicValue::List(results));
            }
            BridgeOperation::ListDbusObjects { only_well_known } => {
                let names = self.list_bus_names(only_well_known).await?;
                returns.insert("dbus_objects".to_string(), DynamicValue::from(names));
            }
            BridgeOperation::ListObjectPaths { bus_name } => {
                let paths =
                    RemoteObject::object_paths(self.connection.as_ref(), &bus_name, "/").await;
                returns.insert("object_paths".to_string(), DynamicValue::from(paths));
            }
            BridgeOperation::ListInterfaces {
                bus_name,
                object_path,
            } => {
                let names =
                    RemoteObject::interface_names(self.connection.as_ref(), &bus_name, &object_path)
                        .await;
                returns.insert("interfaces".to_string(), DynamicValue::from(names));
            }
            BridgeOperation::AddDbusObject {
                bus_name,
                object_path,
                interface,
            } => match interface {
                Some(interface) => {
                    let key = ObjectKey::with_interface(bus_name, object_path, interface);
                    self.register_object(key, &[]).await?;
                }
                None => self.register_all_interfaces(&bus_name, &object_path).await?,
            },
        }

        Ok(returns)
    }

    async fn handle_object(&self, call: ObjectMethodCall) -> Result<ReturnArguments> {
        let object = self.resolve(&call.key).await?;
        let interface = call.key.interface.as_deref().unwrap_or_default();
        let method_ref = object
            .method_on(interface, &call.method)
            .ok_or_else(|| {
                BridgeError::NotImplemented(format!("{} on {}", call.method, call.key))
            })?;

        let args = method_ref
            .method
            .in_args()
            .map(|arg| {
                call.arguments
                    .get(&arg.name)
                    .cloned()
                    .ok_or_else(|| BridgeError::MissingArgument(arg.name.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        let results = object.call(method_ref, &args).await?;

        let expected = method_ref.method.out_count();
        if results.len() != expected {
            return Err(BridgeError::ReplyCount {
                expected,
                found: results.len(),
            });
        }

        Ok(method_ref
            .method
            .out_args()
            .zip(results)
            .map(|(arg, value)| (arg.name.clone(), value))
            .collect())
    }

    /// Cached object for `key`, introspecting it on first use
    async fn resolve(&self, key: &ObjectKey) -> Result<Arc<RemoteObject>> {
        if let Some(object) = self.cache.lock().await.get(key) {
            return Ok(object);
        }

        let object =
            Arc::new(RemoteObject::introspect(self.connection.clone(), key.clone(), false).await?);
        self.cache.lock().await.insert(object.clone());
        Ok(object)
    }

    async fn register_object(&self, key: ObjectKey, blacklist: &[String]) -> Result<()> {
        if self.cache.lock().await.get_registered(&key).is_some() {
            debug!("{} is already registered", key);
            return Ok(());
        }

        let object = Arc::new(
            RemoteObject::introspect(
                self.connection.clone(),
                key,
                self.options.listen_for_signals,
            )
            .await?,
        );
        object.add_to_schema(self.session.clone(), blacklist).await?;
        self.cache.lock().await.insert(object);
        Ok(())
    }

    async fn register_all_interfaces(&self, bus_name: &str, object_path: &str) -> Result<()> {
        let interfaces =
            RemoteObject::interface_names(self.connection.as_ref(), bus_name, object_path).await;
        if interfaces.is_empty() {
            return Err(BridgeError::Introspection(format!(
                "no interfaces found for {}@{}",
                bus_name, object_path
            )));
        }

        for interface in interfaces
            .into_iter()
            .filter(|i| i != INTROSPECTABLE_INTERFACE && i != PROPERTIES_INTERFACE)
        {
            let key = ObjectKey::with_interface(bus_name, object_path, interface);
            self.register_object(key, &self.options.property_blacklist)
                .await?;
        }
        Ok(())
    }

    async fn list_bus_names(&self, only_well_known: bool) -> Result<Vec<String>> {
        let key = ObjectKey::with_interface(DBUS_SERVICE, DBUS_PATH, DBUS_INTERFACE);
        let mut names = BTreeSet::new();

        for method in ["ListNames", "ListActivatableNames"] {
            let reply =
                RemoteObject::call_once(self.connection.clone(), key.clone(), method, &[]).await?;
            for value in reply {
                let DynamicValue::List(items) = value else {
                    continue;
                };
                names.extend(items.into_iter().filter_map(|item| match item {
                    DynamicValue::String(name) if !(only_well_known && name.starts_with(':')) => {
                        Some(name)
                    }
                    _ => None,
                }));
            }
        }

        Ok(names.into_iter().collect())
    }

    /// Number of cached objects, registered and transient
    pub async fn cached_objects(&self) -> usize {
        self.cache.lock().await.len()
    }

    /// Drop every cached object, stopping their signal listeners
    pub async fn shutdown(&self) {
        let mut cache = self.cache.lock().await;
        info!("Releasing {} DBus objects", cache.len());
        cache.clear();
    }
}

fn bridge_methods() -> Vec<SchemaMethod> {
    use Direction::{In, Out};
    use SchemaDataType::{Bool, List, String as Text};
    let arg = |name: &str, data_type, direction| SchemaProperty::new(name, data_type, direction);

    vec![
        SchemaMethod {
            name: "call".to_string(),
            arguments: vec![
                arg("bus_name", Text, In),
                arg("object_path", Text, In),
                arg("interface", Text, In),
                arg("method_name", Text, In),
                arg("args", List, In),
                arg("results", List, Out),
            ],
        },
        SchemaMethod {
            name: "list_dbus_objects".to_string(),
            arguments: vec![arg("only_well_known", Bool, In), arg("dbus_objects", List, Out)],
        },
        SchemaMethod {
            name: "list_object_paths".to_string(),
            arguments: vec![arg("bus_name", Text, In), arg("object_paths", List, Out)],
        },
        SchemaMethod {
            name: "list_interfaces".to_string(),
            arguments: vec![
                arg("bus_name", Text, In),
                arg("object_path", Text, In),
                arg("interfaces", List, Out),
            ],
        },
        SchemaMethod {
            name: "add_dbus_object".to_string(),
            arguments: vec![
                arg("bus_name", Text, In),
                arg("object_path", Text, In),
                arg("interface", Text, In),
            ],
        },
    ]
}
