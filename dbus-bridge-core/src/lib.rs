//! D-Bus Bridge Core
//!
//! This library exposes arbitrary D-Bus objects through a schema-driven
//! management bus, without prior knowledge of their interfaces. Objects are
//! introspected at runtime, their methods become callable management
//! methods and their signals become management events.
//!
//! The D-Bus side is reached through [`BusConnection`] and the management
//! side through [`AgentSession`], so the whole bridge can be driven without
//! a live bus.

pub mod connection;
pub mod dispatcher;
pub mod introspection;
pub mod packet;
pub mod remote_object;
pub mod session;
pub mod signature;
pub mod value;

mod error;

pub use connection::{BusConnection, SignalMessage, ZbusConnection, CALL_TIMEOUT};
pub use dispatcher::{
    BridgeDispatcher, BridgeOperation, BridgeOptions, InboundCall, MethodRequest,
    ObjectCache, ObjectMethodCall, ReturnArguments, DEFAULT_BRIDGE_NAME,
};
pub use error::{BridgeError, ConversionError, ErrorCategory, Result};
pub use introspection::{
    Access, ArgumentDescriptor, Direction, InterfaceModel, IntrospectionNode, MethodDescriptor,
    SignalDescriptor,
};
pub use packet::{current_timestamp, Packet};
pub use remote_object::{MethodRef, ObjectKey, RemoteObject};
pub use session::{
    AgentSession, DataObject, Event, Schema, SchemaDataType, SchemaId, SchemaKind, SchemaMethod,
    SchemaProperty, Severity,
};
pub use value::DynamicValue;

/// Re-exported so callers can build and inspect wire values
pub use zbus::zvariant;
