//! Bus connection seam
//!
//! Every D-Bus round-trip the bridge makes goes through [`BusConnection`].
//! The production implementation, [`ZbusConnection`], wraps a shared
//! `zbus::Connection` and bounds each call with a timeout. Tests supply an
//! in-memory implementation instead.
//!
//! Arguments are passed as already-encoded `zvariant` values and replies
//! come back as owned values, one per reply argument. No assumption is made
//! about how many values a reply carries.

use crate::error::{BridgeError, Result};
use crate::signature::split_items;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, warn};
use zbus::zvariant::{OwnedValue, Structure, StructureBuilder, Value};
use zbus::{MatchRule, Message, MessageStream};

/// Default bound on every outbound D-Bus call
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

pub const DBUS_SERVICE: &str = "org.freedesktop.DBus";
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Signal messages buffered per subscription before the oldest are dropped
const SIGNAL_QUEUE_SIZE: usize = 256;

/// Header field code carrying the body signature
const SIGNATURE_FIELD: u8 = 8;

/// Offset of the first header field, after the fixed header and the array length
const HEADER_FIELDS_START: usize = 16;

/// A received D-Bus signal, body already split into arguments
#[derive(Debug)]
pub struct SignalMessage {
    pub sender: Option<String>,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub args: Vec<OwnedValue>,
}

/// Access to a D-Bus bus
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// Call `interface.method` on `destination` at `path` and wait for the reply
    async fn call_method(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        method: &str,
        args: Vec<Value<'static>>,
    ) -> Result<Vec<OwnedValue>>;

    /// Install `type='signal',interface='<interface>'` and stream the matches
    async fn subscribe_signals(&self, interface: &str) -> Result<BoxStream<'static, SignalMessage>>;
}

/// [`BusConnection`] over a live `zbus` connection
#[derive(Clone)]
pub struct ZbusConnection {
    connection: zbus::Connection,
    timeout: Duration,
}

impl ZbusConnection {
    pub fn new(connection: zbus::Connection) -> Self {
        Self {
            connection,
            timeout: CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn system() -> Result<Self> {
        Ok(Self::new(zbus::Connection::system().await?))
    }

    pub async fn session() -> Result<Self> {
        Ok(Self::new(zbus::Connection::session().await?))
    }
}

/// Body signature exactly as written in the raw message header
///
/// zvariant parses `ii` and `(ii)` into the same `Signature`, so the number
/// of top-level arguments can only be read from the header bytes. Returns an
/// empty string when the header has no signature field, `None` when the
/// header cannot be walked.
fn header_signature(bytes: &[u8]) -> Option<&str> {
    let read_u32 = |at: usize| -> Option<usize> {
        let raw: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
        let value = match bytes.first()? {
            b'l' => u32::from_le_bytes(raw),
            b'B' => u32::from_be_bytes(raw),
            _ => return None,
        };
        usize::try_from(value).ok()
    };

    let end = HEADER_FIELDS_START.checked_add(read_u32(12)?)?;
    let mut position = HEADER_FIELDS_START;
    while position < end {
        position = position.next_multiple_of(8);
        let code = *bytes.get(position)?;
        let kind_length = usize::from(*bytes.get(position + 1)?);
        let kind = bytes.get(position + 2..position + 2 + kind_length)?;
        // code, variant signature length, variant signature, nul
        position += 3 + kind_length;

        match kind {
            b"g" => {
                let length = usize::from(*bytes.get(position)?);
                if code == SIGNATURE_FIELD {
                    let value = bytes.get(position + 1..position + 1 + length)?;
                    return std::str::from_utf8(value).ok();
                }
                position += length + 2;
            }
            b"s" | b"o" => {
                position = position.next_multiple_of(4);
                position += 4 + read_u32(position)? + 1;
            }
            b"u" => position = position.next_multiple_of(4) + 4,
            _ => return None,
        }
    }

    Some("")
}

/// Split a message body into one owned value per argument
///
/// A body whose only argument is a struct comes back as that one struct,
/// not as the struct's fields.
fn body_values(message: &Message) -> Result<Vec<OwnedValue>> {
    let body = message.body();
    if body.signature().to_string().is_empty() {
        return Ok(Vec::new());
    }

    let lone_struct = header_signature(message.data().bytes()).is_some_and(|signature| {
        let items = split_items(signature);
        items.len() == 1 && items[0].starts_with('(')
    });

    let structure: Structure<'_> = body.deserialize()?;
    if lone_struct {
        return Ok(vec![OwnedValue::try_from(Value::Structure(structure))?]);
    }

    structure
        .into_fields()
        .into_iter()
        .map(|field| OwnedValue::try_from(field).map_err(BridgeError::from))
        .collect()
}

fn signal_message(message: &Message) -> Result<SignalMessage> {
    let header = message.header();
    Ok(SignalMessage {
        sender: header.sender().map(|s| s.to_string()),
        path: header.path().map(|p| p.to_string()).unwrap_or_default(),
        interface: header.interface().map(|i| i.to_string()).unwrap_or_default(),
        member: header.member().map(|m| m.to_string()).unwrap_or_default(),
        args: body_values(message)?,
    })
}

#[async_trait]
impl BusConnection for ZbusConnection {
    async fn call_method(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        method: &str,
        args: Vec<Value<'static>>,
    ) -> Result<Vec<OwnedValue>> {
        debug!(
            "DBus call {}.{} on {}{} ({} args)",
            interface,
            method,
            destination,
            path,
            args.len()
        );

        let body = if args.is_empty() {
            None
        } else {
            let builder = args
                .into_iter()
                .fold(StructureBuilder::new(), |builder, arg| builder.append_field(arg));
            Some(builder.build()?)
        };

        let call = async {
            match &body {
                Some(body) => {
                    self.connection
                        .call_method(Some(destination), path, Some(interface), method, body)
                        .await
                }
                None => {
                    self.connection
                        .call_method(Some(destination), path, Some(interface), method, &())
                        .await
                }
            }
        };

        let reply = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| {
                BridgeError::Timeout(format!(
                    "{}.{} on {}{} after {:?}",
                    interface, method, destination, path, self.timeout
                ))
            })??;

        body_values(&reply)
    }

    async fn subscribe_signals(&self, interface: &str) -> Result<BoxStream<'static, SignalMessage>> {
        let rule = MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .interface(interface.to_string())?
            .build();

        let stream = MessageStream::for_match_rule(rule, &self.connection, Some(SIGNAL_QUEUE_SIZE))
            .await?;

        debug!("Listening for signals on interface {}", interface);

        let signals = stream.filter_map(|message| async move {
            match message {
                Ok(message) => match signal_message(&message) {
                    Ok(signal) => Some(signal),
                    Err(e) => {
                        warn!("Failed to read signal body: {}", e);
                        None
                    }
                },
                Err(e) => {
                    warn!("Error receiving DBus message: {}", e);
                    None
                }
            }
        });

        Ok(signals.boxed())
    }
}
