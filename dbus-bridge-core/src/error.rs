//! Error handling for the D-Bus bridge
//!
//! This module provides the error type shared by every bridge operation.
//! Errors from the underlying libraries (`zbus`, `zvariant`, `quick-xml`,
//! `serde_json`) are converted automatically using `thiserror`.
//!
//! ## Error Handling Patterns
//!
//! ### Basic Usage
//!
//! ```rust
//! use dbus_bridge_core::Result;
//!
//! fn parse_body(data: &[u8]) -> Result<String> {
//!     let value: serde_json::Value = serde_json::from_slice(data)?;
//!     Ok(value.to_string())
//! }
//! ```
//!
//! ### Error Matching
//!
//! ```rust
//! use dbus_bridge_core::{BridgeError, ErrorCategory};
//!
//! let error = BridgeError::UnknownMethod {
//!     method: "Frobnicate".to_string(),
//!     interface: "com.example.Calc".to_string(),
//! };
//! assert_eq!(error.category(), ErrorCategory::UnknownTarget);
//! ```
//!
//! ## Error Categories
//!
//! Every error belongs to exactly one [`ErrorCategory`]:
//!
//! - **Introspection**: bus unreachable, no reply, malformed or empty XML
//! - **UnknownTarget**: interface, method, signal or property not found
//! - **ArgumentShape**: wrong argument count, or a value that cannot be
//!   converted to the wire type demanded by its signature position
//! - **Wire**: the D-Bus call itself failed or timed out
//! - **NotImplemented**: unrecognized bridge operation or object method
//! - **Session**: the management session refused a schema, data or event
//!
//! None of these abort the bridge. A failure while handling one inbound
//! event is reported back on that event only.

use thiserror::Error;

/// Result type for bridge operations
///
/// ```rust
/// use dbus_bridge_core::Result;
///
/// fn example() -> Result<()> {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failure to convert a [`DynamicValue`](crate::DynamicValue) to a requested kind
///
/// ```rust
/// use dbus_bridge_core::DynamicValue;
///
/// let err = DynamicValue::from("text").as_bool().unwrap_err();
/// assert_eq!(err.to_string(), "Cannot convert string to bool");
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cannot convert {found} to {expected}")]
pub struct ConversionError {
    /// Kind that was requested
    pub expected: &'static str,
    /// Kind actually held by the value
    pub found: &'static str,
}

impl ConversionError {
    pub fn new(expected: &'static str, found: &'static str) -> Self {
        Self { expected, found }
    }
}

/// Errors that can occur while bridging D-Bus objects
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Introspection of a remote object failed
    ///
    /// The object could not be reached, did not answer the `Introspect`
    /// call, or answered with XML that cannot be used.
    #[error("Introspection failed: {0}")]
    Introspection(String),

    /// The requested interface is not exposed by the object
    ///
    /// ```rust
    /// use dbus_bridge_core::BridgeError;
    ///
    /// let error = BridgeError::UnknownInterface("com.example.Bad".to_string());
    /// assert_eq!(error.to_string(), "Unknown interface com.example.Bad");
    /// ```
    #[error("Unknown interface {0}")]
    UnknownInterface(String),

    /// The requested method is not declared on the interface
    #[error("Unknown method {method} on interface {interface}")]
    UnknownMethod { method: String, interface: String },

    /// Object-level address could not be parsed
    ///
    /// Addresses have the form `bus_name@object_path@interface`.
    #[error("Invalid object address '{0}' (expected \"bus_name@object_path@interface\")")]
    InvalidAddress(String),

    /// A required argument of a bridge operation is missing
    #[error("Missing argument '{0}'")]
    MissingArgument(String),

    /// Wrong number of input arguments for a method call
    ///
    /// ```rust
    /// use dbus_bridge_core::BridgeError;
    ///
    /// let error = BridgeError::ArgumentCount { expected: 2, found: 1 };
    /// assert_eq!(
    ///     error.to_string(),
    ///     "Wrong number of arguments (expected: 2, found: 1)"
    /// );
    /// ```
    #[error("Wrong number of arguments (expected: {expected}, found: {found})")]
    ArgumentCount { expected: usize, found: usize },

    /// Reply carried a different number of values than declared OUT arguments
    #[error("Method returns different number of return arguments (expected: {expected}, got: {found})")]
    ReplyCount { expected: usize, found: usize },

    /// One argument could not be marshaled against its signature
    #[error("Invalid argument {index} ('{name}'): {source}")]
    InvalidArgument {
        index: usize,
        name: String,
        #[source]
        source: Box<BridgeError>,
    },

    /// Value kind does not fit the requested wire type
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// Value cannot be written for this signature code
    #[error("Cannot encode {found} as '{code}'")]
    Encode { code: char, found: &'static str },

    /// A struct or dict entry value has fewer members than its signature
    #[error("Value for signature {signature} has {found} members, {expected} required")]
    MissingMembers {
        signature: String,
        expected: usize,
        found: usize,
    },

    /// Signature is empty, unbalanced or otherwise not well formed
    #[error("Invalid signature '{0}'")]
    InvalidSignature(String),

    /// zvariant refused to build a wire value
    #[error("Marshaling error: {0}")]
    Marshal(#[from] zbus::zvariant::Error),

    /// D-Bus call failed
    #[error("Unable to call DBus method: {0}")]
    Wire(String),

    /// D-Bus call did not complete in time
    #[error("DBus call timed out: {0}")]
    Timeout(String),

    /// Unrecognized bridge operation
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Management session rejected a request
    #[error("Session error: {0}")]
    Session(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<zbus::Error> for BridgeError {
    fn from(error: zbus::Error) -> Self {
        match error {
            zbus::Error::Variant(e) => BridgeError::Marshal(e),
            other => BridgeError::Wire(other.to_string()),
        }
    }
}

impl From<quick_xml::Error> for BridgeError {
    fn from(error: quick_xml::Error) -> Self {
        BridgeError::Introspection(format!("malformed XML: {}", error))
    }
}

/// Classification of [`BridgeError`] values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Introspection,
    UnknownTarget,
    ArgumentShape,
    Wire,
    NotImplemented,
    Session,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Introspection => "introspection",
            Self::UnknownTarget => "unknown_target",
            Self::ArgumentShape => "argument_shape",
            Self::Wire => "wire",
            Self::NotImplemented => "not_implemented",
            Self::Session => "session",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BridgeError {
    /// Category of this error, following the bridge error taxonomy
    pub fn category(&self) -> ErrorCategory {
        match self {
            BridgeError::Introspection(_) => ErrorCategory::Introspection,
            BridgeError::UnknownInterface(_)
            | BridgeError::UnknownMethod { .. }
            | BridgeError::InvalidAddress(_) => ErrorCategory::UnknownTarget,
            BridgeError::MissingArgument(_)
            | BridgeError::ArgumentCount { .. }
            | BridgeError::ReplyCount { .. }
            | BridgeError::InvalidArgument { .. }
            | BridgeError::Conversion(_)
            | BridgeError::Encode { .. }
            | BridgeError::MissingMembers { .. }
            | BridgeError::InvalidSignature(_)
            | BridgeError::Marshal(_) => ErrorCategory::ArgumentShape,
            BridgeError::Wire(_) | BridgeError::Timeout(_) => ErrorCategory::Wire,
            BridgeError::NotImplemented(_) => ErrorCategory::NotImplemented,
            BridgeError::Session(_) => ErrorCategory::Session,
            BridgeError::Json(_) | BridgeError::Io(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error means the addressed target does not exist
    pub fn is_not_found(&self) -> bool {
        self.category() == ErrorCategory::UnknownTarget
    }

    /// Tag an encoding failure with the position and name of the argument
    pub fn for_argument(self, index: usize, name: impl Into<String>) -> Self {
        BridgeError::InvalidArgument {
            index,
            name: name.into(),
            source: Box::new(self),
        }
    }
}
