//! Signature-driven conversion between [`DynamicValue`] and D-Bus values
//!
//! D-Bus values are written against a type signature, one complete type per
//! argument. This module walks those signatures and converts each
//! [`DynamicValue`] into the `zvariant::Value` the signature demands, and
//! back again for replies and signal bodies.
//!
//! ## Signature Grammar
//!
//! - `a` prefixes exactly one following complete type (array)
//! - `(`...`)` encloses one or more complete types (struct)
//! - `{`...`}` encloses a basic key type and one value type (dict entry)
//! - `v` is a variant
//! - any other code is a basic type
//!
//! ## Encoding Rules
//!
//! | Code                     | Accepted value                         |
//! |--------------------------|----------------------------------------|
//! | `b`                      | `Bool`                                 |
//! | `y n q i u x t`          | any integer, cast to the target width  |
//! | `d`                      | `Double` or any integer                |
//! | `s o g`                  | `String`                               |
//! | `a`                      | `List` (or `Map` for `a{..}`)          |
//! | `(..)` `{..}`            | `List`, members matched by position    |
//! | `v`                      | `Bool`, integer, `Double` or `String`  |
//!
//! Narrowing casts truncate. Inside a variant every integer is written as
//! a 64-bit signed integer (`x`), whatever width it was held at.
//!
//! # Examples
//!
//! ```
//! use dbus_bridge_core::{signature, DynamicValue};
//!
//! let value = DynamicValue::from(vec![DynamicValue::from(3), DynamicValue::from(-4)]);
//! let wire = signature::encode(&value, "(ii)").unwrap();
//! assert_eq!(signature::decode(&wire), value);
//! ```

use crate::error::{BridgeError, Result};
use crate::value::DynamicValue;
use tracing::warn;
use zbus::zvariant::{Array, Dict, ObjectPath, Signature, StructureBuilder, Value};

/// Deepest container nesting accepted by [`validate_signature`]
pub const MAX_NESTING: usize = 64;

const BASIC_CODES: &[u8] = b"ybnqiuxtdsogh";

/// Number of characters taken by the first complete type in `signature`
///
/// Brackets are matched by counting only brackets of the same kind as the
/// opening one. A struct holding a dict entry (or the reverse) is sliced
/// correctly only when the nesting is well formed; use
/// [`validate_signature`] to reject anything else first.
///
/// An empty signature has length 0. An unterminated container runs to the
/// end of the string.
///
/// ```
/// use dbus_bridge_core::signature::item_length;
///
/// assert_eq!(item_length("ii"), 1);
/// assert_eq!(item_length("a(is)s"), 5);
/// assert_eq!(item_length("a{sv}"), 5);
/// assert_eq!(item_length(""), 0);
/// ```
pub fn item_length(signature: &str) -> usize {
    let bytes = signature.as_bytes();
    match bytes.first() {
        None => 0,
        Some(b'a') => 1 + item_length(&signature[1..]),
        Some(&open @ (b'(' | b'{')) => {
            let close = if open == b'(' { b')' } else { b'}' };
            let mut depth = 0usize;
            for (index, &code) in bytes.iter().enumerate() {
                if code == open {
                    depth += 1;
                } else if code == close {
                    depth -= 1;
                    if depth == 0 {
                        return index + 1;
                    }
                }
            }
            bytes.len()
        }
        Some(_) => 1,
    }
}

/// Split a signature into its sequence of complete types
///
/// ```
/// use dbus_bridge_core::signature::split_items;
///
/// assert_eq!(split_items("ia{sv}(ii)"), vec!["i", "a{sv}", "(ii)"]);
/// ```
pub fn split_items(signature: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut rest = signature;
    while !rest.is_empty() {
        let length = item_length(rest).max(1);
        let (item, tail) = rest.split_at(length.min(rest.len()));
        items.push(item);
        rest = tail;
    }
    items
}

/// Check that `signature` is a non-empty sequence of well-formed complete types
///
/// Brackets of both kinds are tracked on one stack, so `({i)}` is rejected
/// even though each bracket kind on its own is balanced.
pub fn validate_signature(signature: &str) -> Result<()> {
    let bytes = signature.as_bytes();
    if bytes.is_empty() {
        return Err(BridgeError::InvalidSignature(signature.to_string()));
    }

    let mut position = 0;
    while position < bytes.len() {
        position = complete_type_end(bytes, position, 0)
            .ok_or_else(|| BridgeError::InvalidSignature(signature.to_string()))?;
    }
    Ok(())
}

fn complete_type_end(bytes: &[u8], position: usize, depth: usize) -> Option<usize> {
    if depth > MAX_NESTING {
        return None;
    }

    match *bytes.get(position)? {
        b'a' => complete_type_end(bytes, position + 1, depth + 1),
        b'(' => {
            let mut cursor = position + 1;
            if *bytes.get(cursor)? == b')' {
                return None;
            }
            while *bytes.get(cursor)? != b')' {
                cursor = complete_type_end(bytes, cursor, depth + 1)?;
            }
            Some(cursor + 1)
        }
        b'{' => {
            if !BASIC_CODES.contains(bytes.get(position + 1)?) {
                return None;
            }
            let end = complete_type_end(bytes, position + 2, depth + 1)?;
            (*bytes.get(end)? == b'}').then_some(end + 1)
        }
        b'v' => Some(position + 1),
        code if BASIC_CODES.contains(&code) => Some(position + 1),
        _ => None,
    }
}

/// Encode one value against one complete type signature
///
/// # Errors
///
/// - `InvalidSignature` if `signature` is not exactly one well-formed type
/// - `Conversion` or `Encode` if the value kind does not fit its position
/// - `MissingMembers` if a struct or dict entry list is too short
pub fn encode(value: &DynamicValue, signature: &str) -> Result<Value<'static>> {
    validate_signature(signature)?;
    if item_length(signature) != signature.len() {
        return Err(BridgeError::InvalidSignature(signature.to_string()));
    }
    encode_item(value, signature)
}

fn encode_item(value: &DynamicValue, signature: &str) -> Result<Value<'static>> {
    match signature.as_bytes().first() {
        Some(b'a') => encode_array(value, &signature[1..]),
        Some(b'(') | Some(b'{') => encode_members(value, signature),
        Some(b'v') => encode_variant(value),
        Some(&code) => encode_basic(value, code as char),
        None => Err(BridgeError::InvalidSignature(String::new())),
    }
}

fn encode_array(value: &DynamicValue, element: &str) -> Result<Value<'static>> {
    if element.starts_with('{') {
        return encode_dict(value, element);
    }

    let items = value.as_list()?;
    let mut array = Array::new(&parse_signature(element)?);
    for item in items {
        array.append(encode_item(item, element)?)?;
    }
    Ok(Value::Array(array))
}

fn encode_dict(value: &DynamicValue, entry: &str) -> Result<Value<'static>> {
    // entry is "{kV}" with a single-character basic key
    let key_signature = &entry[1..2];
    let value_signature = &entry[2..entry.len() - 1];
    let key_code = key_signature.as_bytes()[0] as char;

    let mut dict = Dict::new(
        &parse_signature(key_signature)?,
        &parse_signature(value_signature)?,
    );

    match value {
        DynamicValue::Map(map) => {
            for (key, item) in map {
                let key = encode_basic(&map_key(key, key_code), key_code)?;
                dict.append(key, encode_item(item, value_signature)?)?;
            }
        }
        other => {
            for pair in other.as_list()? {
                let members = pair.as_list()?;
                if members.len() < 2 {
                    return Err(BridgeError::MissingMembers {
                        signature: entry.to_string(),
                        expected: 2,
                        found: members.len(),
                    });
                }
                let key = encode_basic(&members[0], key_code)?;
                dict.append(key, encode_item(&members[1], value_signature)?)?;
            }
        }
    }
    Ok(Value::Dict(dict))
}

/// Map keys are always strings; non-string key types read them as JSON
fn map_key(key: &str, code: char) -> DynamicValue {
    if matches!(code, 's' | 'o' | 'g') {
        return DynamicValue::from(key);
    }
    serde_json::from_str::<serde_json::Value>(key)
        .map(DynamicValue::from)
        .unwrap_or_else(|_| DynamicValue::from(key))
}

fn encode_members(value: &DynamicValue, signature: &str) -> Result<Value<'static>> {
    let members = split_items(&signature[1..signature.len() - 1]);
    let items = value.as_list()?;
    if items.len() < members.len() {
        return Err(BridgeError::MissingMembers {
            signature: signature.to_string(),
            expected: members.len(),
            found: items.len(),
        });
    }

    let mut builder = StructureBuilder::new();
    for (item, member) in items.iter().zip(members) {
        builder = builder.append_field(encode_item(item, member)?);
    }
    Ok(Value::Structure(builder.build()?))
}

fn encode_variant(value: &DynamicValue) -> Result<Value<'static>> {
    let inner = match value {
        DynamicValue::Bool(v) => Value::Bool(*v),
        DynamicValue::Double(v) => Value::F64(*v),
        DynamicValue::String(v) => Value::from(v.clone()),
        other => match other.as_integer() {
            Ok(v) => Value::I64(v as i64),
            Err(_) => {
                return Err(BridgeError::Encode {
                    code: 'v',
                    found: other.kind(),
                })
            }
        },
    };
    Ok(Value::Value(Box::new(inner)))
}

fn encode_basic(value: &DynamicValue, code: char) -> Result<Value<'static>> {
    Ok(match code {
        'b' => Value::Bool(value.as_bool()?),
        'y' => Value::U8(value.as_integer()? as u8),
        'n' => Value::I16(value.as_integer()? as i16),
        'q' => Value::U16(value.as_integer()? as u16),
        'i' => Value::I32(value.as_integer()? as i32),
        'u' => Value::U32(value.as_integer()? as u32),
        'x' => Value::I64(value.as_integer()? as i64),
        't' => Value::U64(value.as_integer()? as u64),
        'd' => Value::F64(value.as_f64()?),
        's' => Value::from(value.as_str()?.to_string()),
        'o' => Value::ObjectPath(ObjectPath::try_from(value.as_str()?.to_string())?),
        'g' => Value::Signature(parse_signature(value.as_str()?)?),
        _ => {
            return Err(BridgeError::Encode {
                code,
                found: value.kind(),
            })
        }
    })
}

fn parse_signature(signature: &str) -> Result<Signature> {
    Signature::try_from(signature)
        .map_err(|e| BridgeError::InvalidSignature(format!("{}: {}", signature, e)))
}

/// Convert a D-Bus value into its dynamic form
///
/// Variants are unwrapped. Arrays and structs become lists; dictionaries
/// become lists of `[key, value]` lists. File descriptors and any other
/// unsupported type decode to `Void`.
pub fn decode(value: &Value<'_>) -> DynamicValue {
    match value {
        Value::Bool(v) => DynamicValue::Bool(*v),
        Value::U8(v) => DynamicValue::U8(*v),
        Value::I16(v) => DynamicValue::I16(*v),
        Value::U16(v) => DynamicValue::U16(*v),
        Value::I32(v) => DynamicValue::I32(*v),
        Value::U32(v) => DynamicValue::U32(*v),
        Value::I64(v) => DynamicValue::I64(*v),
        Value::U64(v) => DynamicValue::U64(*v),
        Value::F64(v) => DynamicValue::Double(*v),
        Value::Str(v) => DynamicValue::String(v.to_string()),
        Value::ObjectPath(v) => DynamicValue::String(v.to_string()),
        Value::Signature(v) => DynamicValue::String(v.to_string()),
        Value::Value(inner) => decode(inner),
        Value::Array(array) => DynamicValue::List(array.iter().map(decode).collect()),
        Value::Dict(dict) => DynamicValue::List(
            dict.iter()
                .map(|(k, v)| DynamicValue::List(vec![decode(k), decode(v)]))
                .collect(),
        ),
        Value::Structure(structure) => {
            DynamicValue::List(structure.fields().iter().map(decode).collect())
        }
        #[allow(unreachable_patterns)]
        other => {
            warn!("Unsupported DBus value {:?}, decoding as void", other);
            DynamicValue::Void
        }
    }
}
