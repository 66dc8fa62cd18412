//! Argument values and the comparable signatures derived from them.
//!
//! Two requests are considered the same when their sources match and their
//! [`Signature`]s are [`equal`]. Signatures are computed once, when the
//! request is built, by [`normalize`]:
//!
//! - Trailing [`Arg::Undefined`] values are trimmed, so `f(1, 2, undefined)`
//!   and `f(1, 2)` are the same request.
//! - Primitives and [`Arg::Handle`]s are compared strictly: by value for
//!   primitives, by reference for handles.
//! - [`Arg::Canonical`] values are replaced by their serialized text, so two
//!   distinct values that serialize identically are equal.
//! - [`Arg::Object`] and [`Arg::Array`] are compared *shallowly*: the same
//!   reference, or the same keys (or length) with every member strictly
//!   equal. Nested objects are compared by reference only.

use std::{
    any::Any,
    collections::BTreeMap,
    fmt::{self, Debug, Formatter},
    sync::Arc,
};

use serde::Serialize;

use crate::error::Result;

/// An identity-compared reference to something opaque, such as a function
/// or a connection handle. Clones of a `Handle` are equal to each other;
/// two separately created handles never are.
#[derive(Clone)]
pub struct Handle(Arc<dyn Any + Send + Sync>);

impl Handle {
    pub fn new(value: impl Any + Send + Sync) -> Self {
        Handle(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }

    pub fn ptr_eq(&self, other: &Handle) -> bool {
        self.addr() == other.addr()
    }
}

impl Debug for Handle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:p})", self.addr())
    }
}

/// A single raw argument, as supplied by a caller.
#[derive(Debug, Clone)]
pub enum Arg {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    /// An integer, kept exact. Compares equal to a `Number` holding the same
    /// integral value.
    Int(i128),
    Str(Arc<str>),
    Handle(Handle),
    /// A value that was reduced to its canonical serialized form when it was
    /// constructed. See [`Arg::canonical`].
    Canonical(Arc<str>),
    Object(Arc<BTreeMap<String, Arg>>),
    Array(Arc<Vec<Arg>>),
}

impl Arg {
    /// Serialize a value to its canonical JSON text. Signatures compare the
    /// text, not the original value.
    pub fn canonical(value: &impl Serialize) -> Result<Self> {
        let text = serde_json::to_string(value)?;
        Ok(Arg::Canonical(text.into()))
    }

    pub fn handle(value: impl Any + Send + Sync) -> Self {
        Arg::Handle(Handle::new(value))
    }

    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, Arg)>) -> Self {
        Arg::Object(Arc::new(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        ))
    }

    pub fn array(items: impl IntoIterator<Item = Arg>) -> Self {
        Arg::Array(Arc::new(items.into_iter().collect()))
    }

    #[inline]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Arg::Undefined)
    }

    /// The numeric value as a float. Integers beyond 2^53 lose precision;
    /// use [`Arg::as_int`] for exact access.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Arg::Number(value) => Some(value),
            Arg::Int(value) => Some(value as f64),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i128> {
        match *self {
            Arg::Int(value) => Some(value),
            Arg::Number(value) if integral(value) => Some(value as i128),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Arg::Bool(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::Str(value) | Arg::Canonical(value) => Some(value),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Arg> {
        match self {
            Arg::Object(entries) => entries.get(key),
            _ => None,
        }
    }
}

impl From<bool> for Arg {
    fn from(value: bool) -> Self {
        Arg::Bool(value)
    }
}

macro_rules! int_from {
    ($($ty:ty),*) => {$(
        impl From<$ty> for Arg {
            fn from(value: $ty) -> Self {
                Arg::Int(value as i128)
            }
        }
    )*};
}

int_from!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl From<f32> for Arg {
    fn from(value: f32) -> Self {
        Arg::Number(value.into())
    }
}

impl From<f64> for Arg {
    fn from(value: f64) -> Self {
        Arg::Number(value)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Str(value.into())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Str(value.into())
    }
}

impl From<Handle> for Arg {
    fn from(value: Handle) -> Self {
        Arg::Handle(value)
    }
}

impl<T: Into<Arg>> From<Option<T>> for Arg {
    fn from(value: Option<T>) -> Self {
        value.map_or(Arg::Undefined, Into::into)
    }
}

impl From<serde_json::Value> for Arg {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Arg::Null,
            Value::Bool(value) => Arg::Bool(value),
            Value::Number(value) => match (value.as_i64(), value.as_u64()) {
                (Some(int), _) => Arg::Int(int.into()),
                (None, Some(uint)) => Arg::Int(uint.into()),
                (None, None) => value.as_f64().map_or(Arg::Null, Arg::Number),
            },
            Value::String(value) => Arg::Str(value.into()),
            Value::Array(items) => Arg::array(items.into_iter().map(Arg::from)),
            Value::Object(entries) => {
                Arg::object(entries.into_iter().map(|(key, value)| (key, Arg::from(value))))
            }
        }
    }
}

// NaN is treated as equal to itself so that signature equality stays
// reflexive.
fn number_eq(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

fn integral(value: f64) -> bool {
    value.is_finite() && value.fract() == 0.0
}

// Exact: 2^53 + 1 does not equal the float 2^53 it would round to.
fn int_number_eq(int: i128, number: f64) -> bool {
    integral(number) && number as i128 == int && int as f64 == number
}

/// Strict (`===`-style) equality: primitives by value, everything else by
/// reference.
fn strict_eq(a: &Arg, b: &Arg) -> bool {
    match (a, b) {
        (Arg::Undefined, Arg::Undefined) | (Arg::Null, Arg::Null) => true,
        (Arg::Bool(a), Arg::Bool(b)) => a == b,
        (Arg::Number(a), Arg::Number(b)) => number_eq(*a, *b),
        (Arg::Int(a), Arg::Int(b)) => a == b,
        (Arg::Int(int), Arg::Number(number)) | (Arg::Number(number), Arg::Int(int)) => {
            int_number_eq(*int, *number)
        }
        (Arg::Str(a), Arg::Str(b)) => a == b,
        (Arg::Handle(a), Arg::Handle(b)) => a.ptr_eq(b),
        (Arg::Canonical(a), Arg::Canonical(b)) => Arc::ptr_eq(a, b),
        (Arg::Object(a), Arg::Object(b)) => Arc::ptr_eq(a, b),
        (Arg::Array(a), Arg::Array(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

#[derive(Debug, Clone)]
enum Comparable {
    Strict(Arg),
    ShallowObject(Arc<BTreeMap<String, Arg>>),
    ShallowArray(Arc<Vec<Arg>>),
}

impl Comparable {
    fn from_arg(arg: &Arg) -> Self {
        match arg {
            Arg::Canonical(text) => Comparable::Strict(Arg::Str(text.clone())),
            Arg::Object(entries) => Comparable::ShallowObject(entries.clone()),
            Arg::Array(items) => Comparable::ShallowArray(items.clone()),
            other => Comparable::Strict(other.clone()),
        }
    }

    fn is_equal(&self, other: &Comparable) -> bool {
        match (self, other) {
            (Comparable::Strict(a), Comparable::Strict(b)) => strict_eq(a, b),
            (Comparable::ShallowObject(a), Comparable::ShallowObject(b)) => {
                Arc::ptr_eq(a, b)
                    || (a.len() == b.len()
                        && a.iter().all(|(key, value)| match b.get(key) {
                            Some(other) => strict_eq(value, other),
                            None => false,
                        }))
            }
            (Comparable::ShallowArray(a), Comparable::ShallowArray(b)) => {
                Arc::ptr_eq(a, b)
                    || (a.len() == b.len()
                        && a.iter().zip(b.iter()).all(|(a, b)| strict_eq(a, b)))
            }
            _ => false,
        }
    }
}

/// The normalized, comparable form of an argument list.
#[derive(Debug, Clone)]
pub struct Signature {
    items: Vec<Comparable>,
}

impl Signature {
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        equal(self, other)
    }
}

/// Convert raw arguments into their comparable signature.
pub fn normalize(args: &[Arg]) -> Signature {
    let end = args
        .iter()
        .rposition(|arg| !arg.is_undefined())
        .map_or(0, |index| index + 1);

    Signature {
        items: args[..end].iter().map(Comparable::from_arg).collect(),
    }
}

/// Test two signatures for equality: equal length and pairwise equal items.
pub fn equal(a: &Signature, b: &Signature) -> bool {
    a.items.len() == b.items.len()
        && a
            .items
            .iter()
            .zip(b.items.iter())
            .all(|(a, b)| a.is_equal(b))
}
