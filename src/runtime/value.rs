use std::{cell::RefCell, fmt, rc::Rc};

use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use thiserror::Error;

use super::interp::{Interp, Scope, Throw};
use crate::compiler::target::Function;

pub type Props = RefCell<IndexMap<Rc<str>, Value, FxBuildHasher>>;

/// Runtime classes the host knows about. Everything the generated code
/// creates with `{}` is `Plain`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Class {
    Plain,
    Symbol,
    Cons,
    BlockNlx,
    CatchNlx,
    TagNlx,
    Condition,
}

pub struct Object {
    pub class: Class,
    pub props: Props,
}

pub struct Array {
    pub items: RefCell<Vec<Value>>,
    pub props: Props,
}

pub struct Closure {
    pub function: Rc<Function>,
    pub scope: Scope,
    pub props: Props,
}

pub type NativeFn = fn(&mut Interp, &[Value]) -> Result<Value, Throw>;

pub struct Native {
    pub name: &'static str,
    pub func: NativeFn,
    /// Set for natives usable with `new`; `instanceof` compares against it.
    pub class: Option<Class>,
    pub props: Props,
}

#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Object(Rc<Object>),
    Array(Rc<Array>),
    Function(Rc<Closure>),
    Native(Rc<Native>),
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(Rc::from(s))
    }

    pub fn object(class: Class, props: impl IntoIterator<Item = (&'static str, Value)>) -> Value {
        let map = props
            .into_iter()
            .map(|(k, v)| (Rc::from(k), v))
            .collect::<IndexMap<_, _, FxBuildHasher>>();
        Value::Object(Rc::new(Object {
            class,
            props: RefCell::new(map),
        }))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(Array {
            items: RefCell::new(items),
            props: RefCell::default(),
        }))
    }

    pub fn native(name: &'static str, func: NativeFn) -> Value {
        Value::Native(Rc::new(Native {
            name,
            func,
            class: None,
            props: RefCell::default(),
        }))
    }

    pub fn constructor(name: &'static str, func: NativeFn, class: Class) -> Value {
        Value::Native(Rc::new(Native {
            name,
            func,
            class: Some(class),
            props: RefCell::default(),
        }))
    }

    pub fn class(&self) -> Option<Class> {
        match self {
            Value::Object(obj) => Some(obj.class),
            _ => None,
        }
    }

    pub fn is_class(&self, class: Class) -> bool {
        self.class() == Some(class)
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Value::Function(_) | Value::Native(_))
    }

    pub fn props(&self) -> Option<&Props> {
        match self {
            Value::Object(obj) => Some(&obj.props),
            Value::Array(arr) => Some(&arr.props),
            Value::Function(f) => Some(&f.props),
            Value::Native(n) => Some(&n.props),
            _ => None,
        }
    }

    /// Own property lookup; arrays and strings also answer `length` and
    /// numeric indices.
    pub fn get(&self, key: &str) -> Value {
        match self {
            Value::Array(arr) => {
                if key == "length" {
                    return Value::Number(arr.items.borrow().len() as f64);
                }
                if let Ok(index) = key.parse::<usize>() {
                    return arr.items.borrow().get(index).cloned().unwrap_or(Value::Undefined);
                }
            }
            Value::Str(s) => {
                if key == "length" {
                    return Value::Number(s.chars().count() as f64);
                }
                if let Ok(index) = key.parse::<usize>() {
                    return s
                        .chars()
                        .nth(index)
                        .map(|c| Value::str(&c.to_string()))
                        .unwrap_or(Value::Undefined);
                }
            }
            _ => {}
        }
        self.props()
            .and_then(|props| props.borrow().get(key).cloned())
            .unwrap_or(Value::Undefined)
    }

    pub fn has(&self, key: &str) -> bool {
        match self {
            Value::Array(arr) => {
                if key == "length" {
                    return true;
                }
                if let Ok(index) = key.parse::<usize>() {
                    return index < arr.items.borrow().len();
                }
            }
            Value::Str(_) if key == "length" => return true,
            _ => {}
        }
        self.props()
            .is_some_and(|props| props.borrow().contains_key(key))
    }

    /// Stores a property. Returns false when the value cannot hold
    /// properties.
    pub fn set(&self, key: &str, value: Value) -> bool {
        if let Value::Array(arr) = self {
            if key == "length" {
                if let Value::Number(n) = value {
                    arr.items.borrow_mut().resize(n.max(0.0) as usize, Value::Undefined);
                    return true;
                }
            }
            if let Ok(index) = key.parse::<usize>() {
                let mut items = arr.items.borrow_mut();
                if index >= items.len() {
                    items.resize(index + 1, Value::Undefined);
                }
                items[index] = value;
                return true;
            }
        }
        match self.props() {
            Some(props) => {
                props.borrow_mut().insert(Rc::from(key), value);
                true
            }
            None => false,
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::Str(x), Value::Str(y)) => x == y,
            (Value::Object(x), Value::Object(y)) => Rc::ptr_eq(x, y),
            (Value::Array(x), Value::Array(y)) => Rc::ptr_eq(x, y),
            (Value::Function(x), Value::Function(y)) => Rc::ptr_eq(x, y),
            (Value::Native(x), Value::Native(y)) => Rc::ptr_eq(x, y),
            _ => false,
        }
    }

    pub fn loose_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
            _ => self.strict_equals(other),
        }
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null | Value::Object(_) | Value::Array(_) => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Function(_) | Value::Native(_) => "function",
        }
    }

    /// The property key a value denotes when used in `object[key]`.
    pub fn to_key(&self) -> Rc<str> {
        match self {
            Value::Str(s) => s.clone(),
            _ => Rc::from(self.to_string()),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::Object(x) => Some(Rc::as_ptr(x) as usize),
            Value::Array(x) => Some(Rc::as_ptr(x) as usize),
            Value::Function(x) => Some(Rc::as_ptr(x) as usize),
            Value::Native(x) => Some(Rc::as_ptr(x) as usize),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => write!(f, "{}", *n as i64),
            Value::Number(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s),
            Value::Object(obj) => match obj.class {
                Class::Symbol => write!(f, "{}", self.get("name")),
                Class::Cons => {
                    write!(f, "(")?;
                    let mut list = self.clone();
                    let mut first = true;
                    while list.is_class(Class::Cons) {
                        if !first {
                            write!(f, " ")?;
                        }
                        first = false;
                        write!(f, "{}", list.get("car"))?;
                        list = list.get("cdr");
                    }
                    let nil = list.is_class(Class::Symbol)
                        && list.get("name").strict_equals(&Value::str("NIL"));
                    if !nil {
                        write!(f, " . {}", list)?;
                    }
                    write!(f, ")")
                }
                Class::Condition => write!(f, "#<condition {}>", self.get("message")),
                _ => write!(f, "#<object>"),
            },
            Value::Array(arr) => {
                write!(f, "#(")?;
                for (i, item) in arr.items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Value::Function(closure) => match &closure.function.name {
                Some(name) => write!(f, "#<function {}>", name),
                None => write!(f, "#<function>"),
            },
            Value::Native(native) => write!(f, "#<native {}>", native.name),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Lisp conditions signalled by generated code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionKind {
    UnboundVariable,
    UndefinedFunction,
    ArgumentCount,
    OddKeywords,
    UnknownKeyword,
    OutOfRange,
    TypeError,
    SimpleError,
    ReferenceError,
}

impl ConditionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnboundVariable => "unbound-variable",
            Self::UndefinedFunction => "undefined-function",
            Self::ArgumentCount => "argument-count",
            Self::OddKeywords => "odd-keywords",
            Self::UnknownKeyword => "unknown-keyword",
            Self::OutOfRange => "out-of-range",
            Self::TypeError => "type-error",
            Self::SimpleError => "simple-error",
            Self::ReferenceError => "reference-error",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "unbound-variable" => Self::UnboundVariable,
            "undefined-function" => Self::UndefinedFunction,
            "argument-count" => Self::ArgumentCount,
            "odd-keywords" => Self::OddKeywords,
            "unknown-keyword" => Self::UnknownKeyword,
            "out-of-range" => Self::OutOfRange,
            "type-error" => Self::TypeError,
            "simple-error" => Self::SimpleError,
            "reference-error" => Self::ReferenceError,
            _ => return None,
        })
    }
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HostError {
    #[error("{kind}: {message}")]
    Condition { kind: ConditionKind, message: String },

    #[error("uncaught throw: {0}")]
    Uncaught(String),

    #[error("cannot convert {0} to a datum")]
    Unconvertible(String),
}

impl HostError {
    pub fn kind(&self) -> Option<ConditionKind> {
        match self {
            HostError::Condition { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
