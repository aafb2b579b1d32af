//! Management session seam
//!
//! The bridge publishes what it learns about D-Bus objects to a
//! schema-driven management bus. That bus is reached only through the
//! [`AgentSession`] trait: schemas are registered once, data objects are
//! published under a name, and events are raised against an event schema.
//!
//! Inbound method invocations flow the other way, through
//! [`BridgeDispatcher::handle`](crate::BridgeDispatcher::handle).

use crate::error::Result;
use crate::introspection::{Access, ArgumentDescriptor, Direction};
use crate::value::DynamicValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Schema type of a property or argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaDataType {
    Void,
    Bool,
    Int,
    Float,
    String,
    List,
    Map,
}

impl SchemaDataType {
    /// Schema type for a D-Bus signature, chosen by its first code
    ///
    /// ```
    /// use dbus_bridge_core::SchemaDataType;
    ///
    /// assert_eq!(SchemaDataType::from_signature("u"), SchemaDataType::Int);
    /// assert_eq!(SchemaDataType::from_signature("a{sv}"), SchemaDataType::List);
    /// assert_eq!(SchemaDataType::from_signature("v"), SchemaDataType::String);
    /// ```
    pub fn from_signature(signature: &str) -> Self {
        match signature.chars().next() {
            Some('b') => Self::Bool,
            Some('y' | 'n' | 'q' | 'i' | 'u' | 'x' | 't') => Self::Int,
            Some('d') => Self::Float,
            Some('s' | 'o' | 'g' | 'v') => Self::String,
            Some('a' | '(') => Self::List,
            Some('{') => Self::Map,
            _ => {
                warn!("Unknown DBus type signature '{}'", signature);
                Self::Void
            }
        }
    }
}

/// Whether a schema describes data objects or events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaKind {
    Data,
    Event,
}

/// Package and class naming one schema
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaId {
    pub package: String,
    pub class: String,
}

impl SchemaId {
    pub fn new(package: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            class: class.into(),
        }
    }
}

impl std::fmt::Display for SchemaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.package, self.class)
    }
}

/// Property, method argument or event argument of a schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaProperty {
    pub name: String,
    pub data_type: SchemaDataType,
    pub access: Access,
    pub direction: Direction,
}

impl SchemaProperty {
    pub fn new(name: impl Into<String>, data_type: SchemaDataType, direction: Direction) -> Self {
        Self {
            name: name.into(),
            data_type,
            access: Access::ReadWrite,
            direction,
        }
    }
}

impl From<&ArgumentDescriptor> for SchemaProperty {
    fn from(argument: &ArgumentDescriptor) -> Self {
        Self {
            name: argument.name.clone(),
            data_type: argument.data_type(),
            access: argument.access,
            direction: argument.direction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMethod {
    pub name: String,
    pub arguments: Vec<SchemaProperty>,
}

/// A data or event schema published to the management bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub kind: SchemaKind,
    pub id: SchemaId,
    pub methods: Vec<SchemaMethod>,
    pub properties: Vec<SchemaProperty>,
}

impl Schema {
    pub fn data(id: SchemaId) -> Self {
        Self {
            kind: SchemaKind::Data,
            id,
            methods: Vec::new(),
            properties: Vec::new(),
        }
    }

    pub fn event(id: SchemaId) -> Self {
        Self {
            kind: SchemaKind::Event,
            ..Self::data(id)
        }
    }
}

/// One published instance of a data schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataObject {
    pub schema: SchemaId,
    pub name: String,
    pub properties: BTreeMap<String, DynamicValue>,
}

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    Debug,
}

/// One raised instance of an event schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub schema: SchemaId,
    pub severity: Severity,
    pub properties: BTreeMap<String, DynamicValue>,
}

/// Outbound half of the management bus
///
/// Calls are fire-and-forget from the bridge's point of view: an error
/// means the request was refused and nothing was published.
pub trait AgentSession: Send + Sync {
    fn register_schema(&self, schema: Schema) -> Result<()>;

    fn add_data(&self, object: DataObject) -> Result<()>;

    fn raise_event(&self, event: Event) -> Result<()>;
}
