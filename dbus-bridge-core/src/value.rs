//! Dynamically typed values carried across the bridge boundary
//!
//! [`DynamicValue`] is the management-side view of any D-Bus value. D-Bus
//! structs and dict entries have no dedicated variant: they are carried as
//! ordered lists, with position giving the field (or key then value).
//!
//! Conversions are explicit. Asking for a kind that the held variant cannot
//! provide yields a [`ConversionError`] instead of a silent default.
//!
//! ## JSON Mapping
//!
//! Values are serialized through `serde_json::Value`:
//!
//! | JSON     | DynamicValue                    |
//! |----------|---------------------------------|
//! | null     | `Void`                          |
//! | boolean  | `Bool`                          |
//! | integer  | `I64` (or `U64` above `i64::MAX`) |
//! | float    | `Double`                        |
//! | string   | `String`                        |
//! | array    | `List`                          |
//! | object   | `Map`                           |

use crate::error::ConversionError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// A value of statically unknown type
///
/// Integer variants compare by numeric value, so `I32(5) == I64(5)`.
///
/// # Examples
///
/// ```
/// use dbus_bridge_core::DynamicValue;
///
/// let value = DynamicValue::from(vec![DynamicValue::from(3), DynamicValue::from(-4)]);
/// assert_eq!(value.as_list().unwrap().len(), 2);
/// assert_eq!(DynamicValue::I32(5), DynamicValue::U8(5));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "JsonValue", into = "JsonValue")]
pub enum DynamicValue {
    #[default]
    Void,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Double(f64),
    String(String),
    List(Vec<DynamicValue>),
    Map(BTreeMap<String, DynamicValue>),
}

impl DynamicValue {
    /// Short name of the held kind, used in conversion errors
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Bool(_) => "bool",
            Self::I8(_) | Self::I16(_) | Self::I32(_) | Self::I64(_) => "int",
            Self::U8(_) | Self::U16(_) | Self::U32(_) | Self::U64(_) => "uint",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    fn integer(&self) -> Option<i128> {
        match *self {
            Self::I8(v) => Some(v.into()),
            Self::I16(v) => Some(v.into()),
            Self::I32(v) => Some(v.into()),
            Self::I64(v) => Some(v.into()),
            Self::U8(v) => Some(v.into()),
            Self::U16(v) => Some(v.into()),
            Self::U32(v) => Some(v.into()),
            Self::U64(v) => Some(v.into()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Result<bool, ConversionError> {
        match self {
            Self::Bool(v) => Ok(*v),
            other => Err(ConversionError::new("bool", other.kind())),
        }
    }

    /// Any integer variant, widened without loss
    ///
    /// Callers narrow with `as`, which truncates.
    pub fn as_integer(&self) -> Result<i128, ConversionError> {
        self.integer()
            .ok_or_else(|| ConversionError::new("int", self.kind()))
    }

    /// Doubles as-is, integers cast to double
    pub fn as_f64(&self) -> Result<f64, ConversionError> {
        match self {
            Self::Double(v) => Ok(*v),
            other => other
                .integer()
                .map(|v| v as f64)
                .ok_or_else(|| ConversionError::new("double", other.kind())),
        }
    }

    pub fn as_str(&self) -> Result<&str, ConversionError> {
        match self {
            Self::String(v) => Ok(v),
            other => Err(ConversionError::new("string", other.kind())),
        }
    }

    pub fn as_list(&self) -> Result<&[DynamicValue], ConversionError> {
        match self {
            Self::List(v) => Ok(v),
            other => Err(ConversionError::new("list", other.kind())),
        }
    }
}

impl PartialEq for DynamicValue {
    fn eq(&self, other: &Self) -> bool {
        if let (Some(a), Some(b)) = (self.integer(), other.integer()) {
            return a == b;
        }
        match (self, other) {
            (Self::Void, Self::Void) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            _ => false,
        }
    }
}

macro_rules! impl_from_primitive {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for DynamicValue {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

impl_from_primitive!(
    bool => Bool,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f64 => Double,
    String => String,
    Vec<DynamicValue> => List,
    BTreeMap<String, DynamicValue> => Map,
);

impl From<&str> for DynamicValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<Vec<String>> for DynamicValue {
    fn from(values: Vec<String>) -> Self {
        Self::List(values.into_iter().map(Self::String).collect())
    }
}

impl From<JsonValue> for DynamicValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Void,
            JsonValue::Bool(v) => Self::Bool(v),
            JsonValue::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Self::I64(v)
                } else if let Some(v) = n.as_u64() {
                    Self::U64(v)
                } else {
                    Self::Double(n.as_f64().unwrap_or_default())
                }
            }
            JsonValue::String(v) => Self::String(v),
            JsonValue::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            JsonValue::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<DynamicValue> for JsonValue {
    fn from(value: DynamicValue) -> Self {
        match value {
            DynamicValue::Void => JsonValue::Null,
            DynamicValue::Bool(v) => v.into(),
            DynamicValue::I8(v) => v.into(),
            DynamicValue::I16(v) => v.into(),
            DynamicValue::I32(v) => v.into(),
            DynamicValue::I64(v) => v.into(),
            DynamicValue::U8(v) => v.into(),
            DynamicValue::U16(v) => v.into(),
            DynamicValue::U32(v) => v.into(),
            DynamicValue::U64(v) => v.into(),
            // NaN and infinities have no JSON form
            DynamicValue::Double(v) => serde_json::Number::from_f64(v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            DynamicValue::String(v) => v.into(),
            DynamicValue::List(items) => {
                JsonValue::Array(items.into_iter().map(JsonValue::from).collect())
            }
            DynamicValue::Map(map) => {
                JsonValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strict_conversions() {
        assert!(DynamicValue::Bool(true).as_bool().unwrap());
        assert_eq!(DynamicValue::U16(7).as_integer().unwrap(), 7);
        assert_eq!(DynamicValue::I8(-3).as_f64().unwrap(), -3.0);
        assert_eq!(DynamicValue::from("abc").as_str().unwrap(), "abc");

        let err = DynamicValue::from("5").as_integer().unwrap_err();
        assert_eq!(err, ConversionError::new("int", "string"));
        assert!(DynamicValue::Double(1.5).as_integer().is_err());
        assert!(DynamicValue::I32(1).as_bool().is_err());
        assert!(DynamicValue::Void.as_list().is_err());
    }

    #[test]
    fn test_integer_equality_across_widths() {
        assert_eq!(DynamicValue::I32(5), DynamicValue::U64(5));
        assert_eq!(DynamicValue::I64(-4), DynamicValue::I16(-4));
        assert_ne!(DynamicValue::I64(-1), DynamicValue::U64(u64::MAX));
        assert_ne!(DynamicValue::I32(1), DynamicValue::Double(1.0));
        assert_ne!(DynamicValue::I32(1), DynamicValue::Bool(true));
    }

    #[test]
    fn test_json_conversion() {
        let value = DynamicValue::from(json!({
            "name": "org.foo",
            "count": 3,
            "big": u64::MAX,
            "ratio": 0.5,
            "tags": ["a", null],
        }));

        let DynamicValue::Map(map) = &value else {
            panic!("expected a map, got {}", value.kind());
        };
        assert_eq!(map["name"], DynamicValue::from("org.foo"));
        assert!(matches!(map["count"], DynamicValue::I64(3)));
        assert!(matches!(map["big"], DynamicValue::U64(u64::MAX)));
        assert_eq!(map["ratio"], DynamicValue::Double(0.5));
        assert_eq!(
            map["tags"],
            DynamicValue::List(vec![DynamicValue::from("a"), DynamicValue::Void])
        );

        let back = JsonValue::from(value);
        assert_eq!(back["count"], json!(3));
        assert_eq!(back["tags"], json!(["a", null]));
    }

    #[test]
    fn test_serde_through_json() {
        let value: DynamicValue = serde_json::from_str(r#"[1, "two", true]"#).unwrap();
        assert_eq!(
            value,
            DynamicValue::List(vec![
                DynamicValue::I64(1),
                DynamicValue::from("two"),
                DynamicValue::Bool(true),
            ])
        );
        assert_eq!(serde_json::to_string(&value).unwrap(), r#"[1,"two",true]"#);
    }

    #[test]
    fn test_non_finite_double_serializes_as_null() {
        assert_eq!(JsonValue::from(DynamicValue::Double(f64::NAN)), JsonValue::Null);
    }
}
