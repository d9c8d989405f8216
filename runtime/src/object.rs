use std::{fmt, sync::Arc};

use crate::{Method, Module, RuntimeError, Selector, Shape, ShapeId};

#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Integer(i64),
    Str(Arc<str>),
    Symbol(Selector),
    Object(Arc<Instance>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Str(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::Object(_) => "object",
        }
    }

    pub fn as_integer(&self) -> Result<i64, RuntimeError> {
        match self {
            Value::Integer(i) => Ok(*i),
            other => Err(RuntimeError::TypeError {
                expected: "integer",
                got: other.type_name(),
            }),
        }
    }

}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Symbol(s) => write!(f, ":{s}"),
            Value::Object(o) => write!(f, "#<{}>", o.class().name()),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(Arc::from(value))
    }
}

/// Heap object. Dispatch only needs its class.
pub struct Instance {
    class: Arc<Module>,
}

impl Instance {
    pub fn new(class: Arc<Module>) -> Self {
        Self { class }
    }

    pub fn class(&self) -> &Arc<Module> {
        &self.class
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("class", &self.class.name())
            .finish()
    }
}

/// How the receiver was named at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// `recv.name`: only public methods are callable.
    Public,
    /// `name` on implicit self: private and protected are callable too.
    Functional,
}

/// Result of a full lookup: the bound method and the shape it is valid for.
///
/// The shape is the receiver class shape read under the lookup, so a
/// mutation racing with the lookup leaves `shape` already invalid.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub shape: Shape,
    pub method: Arc<Method>,
}

/// Collaborator the dispatch cache asks for shapes and lookups.
pub trait ObjectModel: Send + Sync {
    /// Current shape of the receiver's method table. Must be cheap.
    fn current_shape(&self, receiver: &Value) -> ShapeId;

    /// Uncached lookup of `selector` on the receiver.
    fn resolve(
        &self,
        receiver: &Value,
        selector: &Selector,
        kind: CallKind,
    ) -> Result<Resolution, RuntimeError>;
}
