//! Structured payload values carried in form appendices.
//!
//! [`Value`] is the universal data type exchanged between peers: the usual
//! scalar/sequence/mapping shapes plus [`Fault`], a typed command failure.
//! Faults travel either inside the appendix (when the codec can encode
//! them) or as `name`/`message` body lines of an error form, in which case
//! the name is resolved against the closed [`FaultKind`] set.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A structured value transported in a form appendix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating-point number.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Ordered sequence of values.
    List(Vec<Value>),
    /// Named mapping of values.
    Map(BTreeMap<String, Value>),
    /// A captured command failure.
    Fault(Fault),
}

impl Value {
    /// Human-readable tag for the value's type, used in result-form
    /// diagnostics. The receiver never enforces it.
    #[must_use]
    pub const fn type_tag(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Fault(_) => "fault",
        }
    }

    /// Borrow the value as a list, if it is one.
    #[must_use]
    pub const fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow the value as a mapping, if it is one.
    #[must_use]
    pub const fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Borrow the value as text, if it is text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Return the value as an integer, if it is one.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Return the value as a float, widening integers.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// Whether the value is, or contains, a fault anywhere in its tree.
    #[must_use]
    pub fn contains_fault(&self) -> bool {
        match self {
            Self::Fault(_) => true,
            Self::List(items) => items.iter().any(Value::contains_fault),
            Self::Map(entries) => entries.values().any(Value::contains_fault),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self { Self::Bool(v) }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Self::Int(v) }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self { Self::Float(v) }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self { Self::Text(v.to_owned()) }
}

impl From<String> for Value {
    fn from(v: String) -> Self { Self::Text(v) }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self { Self::List(v) }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self { Self::Map(v) }
}

impl From<Fault> for Value {
    fn from(v: Fault) -> Self { Self::Fault(v) }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Map(entries) => {
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                f.write_str("}")
            }
            Self::Fault(fault) => write!(f, "{fault}"),
        }
    }
}

/// The fixed set of fault kinds either peer may name on the wire.
///
/// A name outside this set fails error-form parsing; received names are
/// never interpreted as anything but a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// Arithmetic failure such as division by zero.
    Arithmetic,
    /// A value had the right type but an unusable content.
    Value,
    /// A value had the wrong type.
    Type,
    /// A mapping key was absent.
    Key,
    /// A sequence index was out of range.
    Index,
    /// Generic runtime failure.
    Runtime,
    /// An operation exceeded its time budget.
    Timeout,
    /// The command name was not in the handler's registry.
    UnknownCommand,
}

impl FaultKind {
    /// Wire name of the kind, as carried in the error form's `name` line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Arithmetic => "ArithmeticError",
            Self::Value => "ValueError",
            Self::Type => "TypeError",
            Self::Key => "KeyError",
            Self::Index => "IndexError",
            Self::Runtime => "RuntimeError",
            Self::Timeout => "TimeoutError",
            Self::UnknownCommand => "UnknownCommand",
        }
    }

    /// Resolve a wire name against the allow-list.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ArithmeticError" => Some(Self::Arithmetic),
            "ValueError" => Some(Self::Value),
            "TypeError" => Some(Self::Type),
            "KeyError" => Some(Self::Key),
            "IndexError" => Some(Self::Index),
            "RuntimeError" => Some(Self::Runtime),
            "TimeoutError" => Some(Self::Timeout),
            "UnknownCommand" => Some(Self::UnknownCommand),
            _ => None,
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// A command failure raised on the handler and rethrown on the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct Fault {
    /// Which kind of failure occurred.
    pub kind: FaultKind,
    /// Single-line human-readable detail.
    pub message: String,
}

impl Fault {
    /// Create a fault of the given kind.
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Fault reported when a command lookup misses the registry.
    #[must_use]
    pub fn unknown_command(name: &str) -> Self {
        Self::new(
            FaultKind::UnknownCommand,
            format!("no command named {name:?} is registered"),
        )
    }
}
