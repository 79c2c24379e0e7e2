//! In-memory values that can cross a channel.
//!
//! Containers share their contents: cloning an [`Array`] clones a handle to
//! the same list, and identity is what the serializer preserves. Reference
//! cycles between containers are never collected.

use std::{
    any::{Any, TypeId},
    fmt,
    future::Future,
    mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, ready};
use tether_core::HandleId;

use crate::channel::WriteChannel;

/// Dynamically typed value.
#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    BigInt(i128),
    String(String),
    Function(Function),
    Handle(RemoteHandle),
    Channel(WriteChannel),
    RegExp(RegExp),
    Date(DateTime<Utc>),
    Error(ErrorValue),
    Array(Array),
    Set(Set),
    Object(Object),
    Map(Map),
    /// Value owned by the embedding host, opaque to the serializer.
    Host(HostObject),
}

type NativeFn = dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, Value>> + Send + Sync;

/// Callable value together with its source text.
///
/// Only the source crosses the wire; the receiving host turns it back into a
/// callable with [`Host::compile`](crate::Host::compile).
#[derive(Clone)]
pub struct Function {
    source: Arc<str>,
    call: Arc<NativeFn>,
}

impl Function {
    /// Wraps an async body. An `Err` is the thrown value.
    pub fn new<F, Fut>(source: impl Into<String>, body: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Value>> + Send + 'static,
    {
        Self {
            source: Arc::from(source.into()),
            call: Arc::new(move |args| body(args).boxed()),
        }
    }

    /// Wraps a body that runs to completion when called.
    pub fn sync<F>(source: impl Into<String>, body: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, Value> + Send + Sync + 'static,
    {
        Self {
            source: Arc::from(source.into()),
            call: Arc::new(move |args| ready(body(args)).boxed()),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Starts a call. Synchronous bodies have already run when this returns.
    pub fn call(&self, args: Vec<Value>) -> BoxFuture<'static, Result<Value, Value>> {
        (self.call)(args)
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.call, &other.call)
    }
}

/// Reference to a value pinned in some context's handle registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteHandle {
    pub category: String,
    pub handle_id: HandleId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegExp {
    pub pattern: String,
    pub flags: String,
}

/// Fields of an error value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorData {
    /// Constructor name such as `TypeError`.
    pub kind: String,
    pub message: String,
    pub line_number: Option<i64>,
    pub column_number: Option<i64>,
    pub file_name: Option<String>,
    pub stack: Option<String>,
}

/// Shared, immutable error value.
#[derive(Debug, Clone)]
pub struct ErrorValue(Arc<ErrorData>);

impl ErrorValue {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::from(ErrorData {
            kind: kind.into(),
            message: message.into(),
            ..ErrorData::default()
        })
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn data(&self) -> &ErrorData {
        &self.0
    }

    pub fn kind(&self) -> &str {
        &self.0.kind
    }

    pub fn message(&self) -> &str {
        &self.0.message
    }

    pub fn ptr_eq(&self, other: &ErrorValue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl From<ErrorData> for ErrorValue {
    fn from(data: ErrorData) -> Self {
        Self(Arc::new(data))
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.message.is_empty() {
            f.write_str(&self.0.kind)
        } else {
            write!(f, "{}: {}", self.0.kind, self.0.message)
        }
    }
}

/// Host-owned value, classified by the host but never serialized.
#[derive(Clone)]
pub struct HostObject(Arc<dyn Any + Send + Sync>);

impl HostObject {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }

    /// Type id of the wrapped value.
    pub fn value_type_id(&self) -> TypeId {
        (*self.0).type_id()
    }

    pub fn ptr_eq(&self, other: &HostObject) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

macro_rules! shared_container {
    ($(#[$meta:meta])* $name:ident, $item:ty) => {
        $(#[$meta])*
        #[derive(Clone, Default)]
        pub struct $name(Arc<Mutex<Vec<$item>>>);

        impl $name {
            pub fn len(&self) -> usize {
                self.lock().len()
            }

            pub fn is_empty(&self) -> bool {
                self.lock().is_empty()
            }

            /// True if both handles refer to the same container.
            pub fn ptr_eq(&self, other: &$name) -> bool {
                Arc::ptr_eq(&self.0, &other.0)
            }

            pub(crate) fn identity(&self) -> usize {
                Arc::as_ptr(&self.0) as usize
            }

            fn lock(&self) -> MutexGuard<'_, Vec<$item>> {
                self.0.lock().unwrap_or_else(PoisonError::into_inner)
            }
        }

        // Nested containers are torn down with an explicit stack.
        impl Drop for $name {
            fn drop(&mut self) {
                let mut pending = Vec::new();
                take_exclusive(&mut self.0, &mut pending);
                while let Some(mut value) = pending.pop() {
                    value.detach_children(&mut pending);
                }
            }
        }
    };
}

shared_container!(
    /// Ordered list.
    Array,
    Value
);
shared_container!(
    /// Insertion-ordered set of distinct values (SameValueZero).
    Set,
    Value
);
shared_container!(
    /// String-keyed members in insertion order.
    Object,
    (String, Value)
);
shared_container!(
    /// Insertion-ordered map with arbitrary keys (SameValueZero).
    Map,
    (Value, Value)
);

impl Array {
    pub fn new(items: Vec<Value>) -> Self {
        Self(Arc::new(Mutex::new(items)))
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.lock().get(index).cloned()
    }

    pub fn push(&self, value: Value) {
        self.lock().push(value);
    }

    /// Snapshot of the current items.
    pub fn items(&self) -> Vec<Value> {
        self.lock().clone()
    }
}

impl Set {
    pub fn new(items: Vec<Value>) -> Self {
        let set = Self::default();
        for item in items {
            set.add(item);
        }
        set
    }

    /// Adds `value` unless an equal one is present. Returns true if added.
    pub fn add(&self, value: Value) -> bool {
        let mut items = self.lock();
        if items.iter().any(|item| same_value_zero(item, &value)) {
            return false;
        }
        items.push(value);
        true
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.lock().iter().any(|item| same_value_zero(item, value))
    }

    pub fn items(&self) -> Vec<Value> {
        self.lock().clone()
    }
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a member; an existing key keeps its position.
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut fields = self.lock();
        match fields.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => *slot = value,
            None => fields.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock()
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().iter().map(|(key, _)| key.clone()).collect()
    }

    pub fn entries(&self) -> Vec<(String, Value)> {
        self.lock().clone()
    }
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an entry; an existing key keeps its position.
    pub fn insert(&self, key: Value, value: Value) {
        let mut entries = self.lock();
        match entries
            .iter_mut()
            .find(|(existing, _)| same_value_zero(existing, &key))
        {
            Some((_, slot)) => *slot = value,
            None => entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        self.lock()
            .iter()
            .find(|(existing, _)| same_value_zero(existing, key))
            .map(|(_, value)| value.clone())
    }

    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.lock().clone()
    }
}

/// Moves the contents out of a container nobody else references.
fn take_exclusive<T>(cell: &mut Arc<Mutex<Vec<T>>>, out: &mut Vec<Value>)
where
    T: IntoValues,
{
    if let Some(lock) = Arc::get_mut(cell) {
        let items = mem::take(lock.get_mut().unwrap_or_else(PoisonError::into_inner));
        for item in items {
            item.into_values(out);
        }
    }
}

trait IntoValues {
    fn into_values(self, out: &mut Vec<Value>);
}

impl IntoValues for Value {
    fn into_values(self, out: &mut Vec<Value>) {
        out.push(self);
    }
}

impl IntoValues for (String, Value) {
    fn into_values(self, out: &mut Vec<Value>) {
        out.push(self.1);
    }
}

impl IntoValues for (Value, Value) {
    fn into_values(self, out: &mut Vec<Value>) {
        out.push(self.0);
        out.push(self.1);
    }
}

impl Value {
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Array::new(items))
    }

    pub fn set(items: Vec<Value>) -> Self {
        Value::Set(Set::new(items))
    }

    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, Value)>) -> Self {
        let object = Object::new();
        for (key, value) in fields {
            object.insert(key, value);
        }
        Value::Object(object)
    }

    pub fn map(entries: impl IntoIterator<Item = (Value, Value)>) -> Self {
        let map = Map::new();
        for (key, value) in entries {
            map.insert(key, value);
        }
        Value::Map(map)
    }

    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Value::Error(ErrorValue::new(kind, message))
    }

    pub fn regexp(pattern: impl Into<String>, flags: impl Into<String>) -> Self {
        Value::RegExp(RegExp {
            pattern: pattern.into(),
            flags: flags.into(),
        })
    }

    pub fn host<T: Any + Send + Sync>(value: T) -> Self {
        Value::Host(HostObject::new(value))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<i128> {
        match self {
            Value::BigInt(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(function) => Some(function),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<&RemoteHandle> {
        match self {
            Value::Handle(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn as_channel(&self) -> Option<&WriteChannel> {
        match self {
            Value::Channel(channel) => Some(channel),
            _ => None,
        }
    }

    pub fn as_regexp(&self) -> Option<&RegExp> {
        match self {
            Value::RegExp(regexp) => Some(regexp),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<&DateTime<Utc>> {
        match self {
            Value::Date(date) => Some(date),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorValue> {
        match self {
            Value::Error(error) => Some(error),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&Set> {
        match self {
            Value::Set(set) => Some(set),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_host(&self) -> Option<&HostObject> {
        match self {
            Value::Host(object) => Some(object),
            _ => None,
        }
    }

    /// Named property of an error or object value.
    pub fn property(&self, key: &str) -> Option<Value> {
        match self {
            Value::Object(object) => object.get(key),
            Value::Error(error) => {
                let data = error.data();
                match key {
                    "name" => Some(Value::String(data.kind.clone())),
                    "message" => Some(Value::String(data.message.clone())),
                    "lineNumber" => data.line_number.map(|line| Value::Number(line as f64)),
                    "columnNumber" => data.column_number.map(|column| Value::Number(column as f64)),
                    "fileName" => data.file_name.clone().map(Value::String),
                    "stack" => data.stack.clone().map(Value::String),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Moves the children of an otherwise unreferenced container into `out`.
    fn detach_children(&mut self, out: &mut Vec<Value>) {
        match self {
            Value::Array(array) => take_exclusive(&mut array.0, out),
            Value::Set(set) => take_exclusive(&mut set.0, out),
            Value::Object(object) => take_exclusive(&mut object.0, out),
            Value::Map(map) => take_exclusive(&mut map.0, out),
            _ => {}
        }
    }
}

/// SameValueZero: NaN equals NaN, zeros are equal, containers compare by
/// identity.
pub fn same_value_zero(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
        (Value::BigInt(a), Value::BigInt(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
        (Value::Handle(a), Value::Handle(b)) => a == b,
        (Value::Channel(a), Value::Channel(b)) => a.ptr_eq(b),
        (Value::RegExp(a), Value::RegExp(b)) => a == b,
        (Value::Date(a), Value::Date(b)) => a == b,
        (Value::Error(a), Value::Error(b)) => a.ptr_eq(b),
        (Value::Array(a), Value::Array(b)) => a.ptr_eq(b),
        (Value::Set(a), Value::Set(b)) => a.ptr_eq(b),
        (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
        (Value::Map(a), Value::Map(b)) => a.ptr_eq(b),
        (Value::Host(a), Value::Host(b)) => a.ptr_eq(b),
        _ => false,
    }
}

/// String conversion used for exception text.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Null => f.write_str("null"),
            Value::Bool(value) => write!(f, "{value}"),
            Value::Number(value) => format_number(*value, f),
            Value::BigInt(value) => write!(f, "{value}"),
            Value::String(value) => f.write_str(value),
            Value::Function(function) => f.write_str(function.source()),
            Value::Handle(handle) => write!(f, "[remote {}]", handle.category),
            Value::Channel(channel) => write!(f, "[channel {}]", channel.endpoint()),
            Value::RegExp(regexp) => write!(f, "/{}/{}", regexp.pattern, regexp.flags),
            Value::Date(date) => write!(f, "{}", date.to_rfc2822()),
            Value::Error(error) => write!(f, "{error}"),
            Value::Array(_) => f.write_str("[object Array]"),
            Value::Set(_) => f.write_str("[object Set]"),
            Value::Object(_) => f.write_str("[object Object]"),
            Value::Map(_) => f.write_str("[object Map]"),
            Value::Host(_) => f.write_str("[object]"),
        }
    }
}

fn format_number(value: f64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if value.is_nan() {
        f.write_str("NaN")
    } else if value.is_infinite() {
        f.write_str(if value > 0.0 { "Infinity" } else { "-Infinity" })
    } else if value == 0.0 {
        f.write_str("0")
    } else {
        write!(f, "{value}")
    }
}

// Shallow: containers may be cyclic.
impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("Undefined"),
            Value::Null => f.write_str("Null"),
            Value::Bool(value) => f.debug_tuple("Bool").field(value).finish(),
            Value::Number(value) => f.debug_tuple("Number").field(value).finish(),
            Value::BigInt(value) => f.debug_tuple("BigInt").field(value).finish(),
            Value::String(value) => f.debug_tuple("String").field(value).finish(),
            Value::Function(function) => f.debug_tuple("Function").field(&function.source()).finish(),
            Value::Handle(handle) => f.debug_tuple("Handle").field(handle).finish(),
            Value::Channel(channel) => f.debug_tuple("Channel").field(channel.endpoint()).finish(),
            Value::RegExp(regexp) => f.debug_tuple("RegExp").field(regexp).finish(),
            Value::Date(date) => f.debug_tuple("Date").field(date).finish(),
            Value::Error(error) => f.debug_tuple("Error").field(error.data()).finish(),
            Value::Array(array) => write!(f, "Array(len={})", array.len()),
            Value::Set(set) => write!(f, "Set(len={})", set.len()),
            Value::Object(object) => write!(f, "Object(keys={:?})", object.keys()),
            Value::Map(map) => write!(f, "Map(len={})", map.len()),
            Value::Host(_) => f.write_str("Host(..)"),
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Function").field(&self.source()).finish()
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostObject(..)")
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(f64::from(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Function> for Value {
    fn from(value: Function) -> Self {
        Value::Function(value)
    }
}

impl From<RemoteHandle> for Value {
    fn from(value: RemoteHandle) -> Self {
        Value::Handle(value)
    }
}

impl From<WriteChannel> for Value {
    fn from(value: WriteChannel) -> Self {
        Value::Channel(value)
    }
}

impl From<ErrorValue> for Value {
    fn from(value: ErrorValue) -> Self {
        Value::Error(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Date(value)
    }
}
