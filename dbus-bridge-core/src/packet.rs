//! Management wire packet
//!
//! The daemon speaks to the management bus with newline-terminated JSON
//! packets. Each packet contains:
//!
//! - `id`: UNIX epoch timestamp in milliseconds
//! - `type`: one of the `bridge.*` packet types below
//! - `body`: JSON object with type-specific fields
//!
//! ## Packet Types
//!
//! | Type                        | Direction | Body                                       |
//! |-----------------------------|-----------|--------------------------------------------|
//! | `bridge.method`             | inbound   | `address`, `method`, `arguments`           |
//! | `bridge.method.response`    | outbound  | `request_id`, `arguments`                  |
//! | `bridge.method.exception`   | outbound  | `request_id`, `message`, `category`        |
//! | `bridge.schema`             | outbound  | a schema                                   |
//! | `bridge.data`               | outbound  | a data object                              |
//! | `bridge.event`              | outbound  | `package`, `class`, `severity`, `properties` |

use crate::dispatcher::{MethodRequest, ReturnArguments};
use crate::error::{BridgeError, Result};
use crate::session::{DataObject, Event, Schema};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const PACKET_TYPE_METHOD: &str = "bridge.method";
pub const PACKET_TYPE_METHOD_RESPONSE: &str = "bridge.method.response";
pub const PACKET_TYPE_METHOD_EXCEPTION: &str = "bridge.method.exception";
pub const PACKET_TYPE_SCHEMA: &str = "bridge.schema";
pub const PACKET_TYPE_DATA: &str = "bridge.data";
pub const PACKET_TYPE_EVENT: &str = "bridge.event";

/// One management wire packet
///
/// # Examples
///
/// ```
/// use dbus_bridge_core::Packet;
/// use serde_json::json;
///
/// let packet = Packet::new(
///     "bridge.method",
///     json!({
///         "address": "DBusBridge",
///         "method": "list_dbus_objects",
///         "arguments": { "only_well_known": true }
///     }),
/// );
///
/// let bytes = packet.to_bytes().unwrap();
/// let parsed = Packet::from_bytes(&bytes).unwrap();
/// let request = parsed.method_request().unwrap();
/// assert_eq!(request.method, "list_dbus_objects");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    /// Accepted as a number or a numeric string, always written as a number
    #[serde(deserialize_with = "deserialize_id", serialize_with = "serialize_id")]
    pub id: i64,

    #[serde(rename = "type")]
    pub packet_type: String,

    #[serde(default)]
    pub body: Value,
}

impl Packet {
    /// Create a packet stamped with the current time
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self::with_id(current_timestamp(), packet_type, body)
    }

    /// Create a packet with an explicit id
    pub fn with_id(id: i64, packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id,
            packet_type: packet_type.into(),
            body,
        }
    }

    /// Successful reply to the `bridge.method` packet `request_id`
    pub fn method_response(request_id: i64, arguments: &ReturnArguments) -> Result<Self> {
        Ok(Self::new(
            PACKET_TYPE_METHOD_RESPONSE,
            json!({
                "request_id": request_id,
                "arguments": serde_json::to_value(arguments)?,
            }),
        ))
    }

    /// Failure reply to the `bridge.method` packet `request_id`
    pub fn method_exception(request_id: i64, error: &BridgeError) -> Self {
        Self::new(
            PACKET_TYPE_METHOD_EXCEPTION,
            json!({
                "request_id": request_id,
                "message": error.to_string(),
                "category": error.category().as_str(),
            }),
        )
    }

    pub fn schema(schema: &Schema) -> Result<Self> {
        Ok(Self::new(PACKET_TYPE_SCHEMA, serde_json::to_value(schema)?))
    }

    pub fn data(object: &DataObject) -> Result<Self> {
        Ok(Self::new(PACKET_TYPE_DATA, serde_json::to_value(object)?))
    }

    pub fn event(event: &Event) -> Result<Self> {
        Ok(Self::new(
            PACKET_TYPE_EVENT,
            json!({
                "package": event.schema.package,
                "class": event.schema.class,
                "severity": event.severity,
                "properties": serde_json::to_value(&event.properties)?,
            }),
        ))
    }

    /// Serialize with a trailing newline
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Json` if serialization fails
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_string(self)?;
        let mut bytes = json.into_bytes();
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Deserialize one packet, with or without a `\n` or `\r\n` terminator
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let trimmed = data
            .strip_suffix(b"\r\n")
            .or_else(|| data.strip_suffix(b"\n"))
            .unwrap_or(data);

        Ok(serde_json::from_slice(trimmed)?)
    }

    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Get a field from the body as a specific type
    pub fn get_body_field<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Body of a `bridge.method` packet
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::NotImplemented` for any other packet type and
    /// `BridgeError::Json` for a malformed body.
    pub fn method_request(&self) -> Result<MethodRequest> {
        if !self.is_type(PACKET_TYPE_METHOD) {
            return Err(BridgeError::NotImplemented(format!(
                "packet type {}",
                self.packet_type
            )));
        }
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value: Value = Deserialize::deserialize(deserializer)?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::custom("Invalid number for id")),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| Error::custom("Invalid string for id")),
        _ => Err(Error::custom("id must be a number or string")),
    }
}

fn serialize_id<S>(id: &i64, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_i64(*id)
}

/// Current UNIX timestamp in milliseconds
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SchemaId, Severity};
    use crate::DynamicValue;
    use std::collections::BTreeMap;

    #[test]
    fn test_packet_terminated_by_newline() {
        let packet = Packet::new(PACKET_TYPE_METHOD, json!({}));
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert!(packet.id > 0);
    }

    #[test]
    fn test_packet_deserialization_terminators() {
        let json_data = r#"{"id":1234567890,"type":"bridge.method","body":{}}"#;
        for data in [
            json_data.to_string(),
            format!("{}\n", json_data),
            format!("{}\r\n", json_data),
        ] {
            let packet = Packet::from_bytes(data.as_bytes()).unwrap();
            assert_eq!(packet.id, 1234567890);
            assert!(packet.is_type(PACKET_TYPE_METHOD));
        }
    }

    #[test]
    fn test_id_as_string() {
        let json_data = r#"{"id":"42","type":"bridge.method","body":{}}"#;
        assert_eq!(Packet::from_bytes(json_data.as_bytes()).unwrap().id, 42);
    }

    #[test]
    fn test_invalid_packet() {
        assert!(matches!(
            Packet::from_bytes(b"not json data"),
            Err(BridgeError::Json(_))
        ));
    }

    #[test]
    fn test_method_request() {
        let packet = Packet::with_id(
            7,
            PACKET_TYPE_METHOD,
            json!({
                "address": "org.foo@/bar@org.foo.Baz",
                "method": "Frob",
                "arguments": { "count": 2, "names": ["a", "b"] }
            }),
        );

        let request = packet.method_request().unwrap();
        assert_eq!(request.address, "org.foo@/bar@org.foo.Baz");
        assert_eq!(request.arguments["count"], DynamicValue::from(2));

        let other = Packet::new(PACKET_TYPE_EVENT, json!({}));
        assert!(matches!(
            other.method_request(),
            Err(BridgeError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_response_and_exception() {
        let mut arguments = ReturnArguments::new();
        arguments.insert(
            "results".to_string(),
            DynamicValue::List(vec![DynamicValue::from(5)]),
        );

        let response = Packet::method_response(7, &arguments).unwrap();
        assert!(response.is_type(PACKET_TYPE_METHOD_RESPONSE));
        assert_eq!(response.get_body_field::<i64>("request_id"), Some(7));
        assert_eq!(response.body["arguments"]["results"], json!([5]));

        let error = BridgeError::ArgumentCount {
            expected: 2,
            found: 1,
        };
        let exception = Packet::method_exception(7, &error);
        assert_eq!(
            exception.get_body_field::<String>("category"),
            Some("argument_shape".to_string())
        );
        assert_eq!(
            exception.get_body_field::<String>("message"),
            Some(error.to_string())
        );
    }

    #[test]
    fn test_event_packet() {
        let mut properties = BTreeMap::new();
        properties.insert("name".to_string(), DynamicValue::from("eth0"));
        let event = Event {
            schema: SchemaId::new("org.foo@/bar", "org.foo.Baz.LinkUp"),
            severity: Severity::Critical,
            properties,
        };

        let packet = Packet::event(&event).unwrap();
        assert_eq!(packet.body["class"], "org.foo.Baz.LinkUp");
        assert_eq!(packet.body["severity"], "critical");
        assert_eq!(packet.body["properties"]["name"], "eth0");
    }
}
