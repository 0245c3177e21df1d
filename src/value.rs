//! The dynamically typed value model used for message bodies and header
//! fields.

use std::fmt;

use crate::object_path::{ObjectPath, OwnedObjectPath};
use crate::signature::{OwnedSignature, Signature};

/// A single D-Bus value of any complete type.
///
/// Containers know their own element signatures, so empty arrays and
/// dictionaries still marshal unambiguously.
///
/// # Examples
///
/// ```
/// use minibus::{Signature, Value};
///
/// let value = Value::from("hello");
/// assert_eq!(*value.signature(), *Signature::STRING);
///
/// let value = Value::Struct(vec![Value::Uint32(1), Value::from("x")]);
/// assert_eq!(value.signature().as_str(), "(us)");
/// ```
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    String(String),
    ObjectPath(OwnedObjectPath),
    Signature(OwnedSignature),
    Array(Array),
    Dict(Dict),
    Struct(Vec<Value>),
    Variant(Box<Value>),
    /// An index into the file descriptor list accompanying the message.
    UnixFd(u32),
}

impl Value {
    /// The signature of this value.
    pub fn signature(&self) -> OwnedSignature {
        let mut out = String::new();
        self.write_signature(&mut out);
        OwnedSignature::from_string_unchecked(out)
    }

    fn write_signature(&self, out: &mut String) {
        match self {
            Value::Byte(..) => out.push('y'),
            Value::Bool(..) => out.push('b'),
            Value::Int16(..) => out.push('n'),
            Value::Uint16(..) => out.push('q'),
            Value::Int32(..) => out.push('i'),
            Value::Uint32(..) => out.push('u'),
            Value::Int64(..) => out.push('x'),
            Value::Uint64(..) => out.push('t'),
            Value::Double(..) => out.push('d'),
            Value::String(..) => out.push('s'),
            Value::ObjectPath(..) => out.push('o'),
            Value::Signature(..) => out.push('g'),
            Value::Array(array) => {
                out.push('a');
                out.push_str(array.element.as_str());
            }
            Value::Dict(dict) => {
                out.push_str("a{");
                out.push_str(dict.key.as_str());
                out.push_str(dict.value.as_str());
                out.push('}');
            }
            Value::Struct(fields) => {
                out.push('(');

                for field in fields {
                    field.write_signature(out);
                }

                out.push(')');
            }
            Value::Variant(..) => out.push('v'),
            Value::UnixFd(..) => out.push('h'),
        }
    }

    /// Get the value as a string slice, if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as a `u32`, if it is one.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Uint32(n) => Some(*n),
            _ => None,
        }
    }

    /// Get the value as a `bool`, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Unwrap one level of variant, if the value is one.
    pub fn as_variant(&self) -> Option<&Value> {
        match self {
            Value::Variant(inner) => Some(inner),
            _ => None,
        }
    }

    /// Get the value as an array, if it is one.
    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(array) => Some(array),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => s.fmt(f),
            Value::ObjectPath(p) => p.fmt(f),
            other => write!(f, "{other:?}"),
        }
    }
}

impl From<u8> for Value {
    fn from(value: u8) -> Self {
        Value::Byte(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i16> for Value {
    fn from(value: i16) -> Self {
        Value::Int16(value)
    }
}

impl From<u16> for Value {
    fn from(value: u16) -> Self {
        Value::Uint16(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int32(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Uint32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int64(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Uint64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<&ObjectPath> for Value {
    fn from(value: &ObjectPath) -> Self {
        Value::ObjectPath(value.to_owned())
    }
}

impl From<&Signature> for Value {
    fn from(value: &Signature) -> Self {
        Value::Signature(value.to_owned())
    }
}

/// A homogeneous array of values.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    pub(crate) element: OwnedSignature,
    pub(crate) items: Vec<Value>,
}

impl Array {
    /// Construct an empty array with the given element signature.
    pub fn new(element: &Signature) -> Self {
        Self {
            element: element.to_owned(),
            items: Vec::new(),
        }
    }

    /// Construct an array of strings.
    pub fn of_strings<I>(items: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            element: Signature::STRING.to_owned(),
            items: items
                .into_iter()
                .map(|item| Value::String(item.into()))
                .collect(),
        }
    }

    /// Append a value to the array.
    pub fn push(&mut self, value: Value) {
        self.items.push(value);
    }

    /// The element signature of the array.
    pub fn element(&self) -> &Signature {
        &self.element
    }

    /// The values in the array.
    pub fn items(&self) -> &[Value] {
        &self.items
    }

    /// The number of elements in the array.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Test if the array is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<'a> IntoIterator for &'a Array {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// An ordered dictionary, marshalled as an array of dict entries.
#[derive(Debug, Clone, PartialEq)]
pub struct Dict {
    pub(crate) key: OwnedSignature,
    pub(crate) value: OwnedSignature,
    pub(crate) entries: Vec<(Value, Value)>,
}

impl Dict {
    /// Construct an empty dictionary with the given key and value
    /// signatures.
    pub fn new(key: &Signature, value: &Signature) -> Self {
        Self {
            key: key.to_owned(),
            value: value.to_owned(),
            entries: Vec::new(),
        }
    }

    /// Insert an entry.
    pub fn insert(&mut self, key: Value, value: Value) {
        self.entries.push((key, value));
    }

    /// The entries in insertion order.
    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }
}
