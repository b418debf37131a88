//! Runtime values of the symbolic interpreter.
//!
//! Values are immutable; "mutation" always produces a new value stored back
//! into the heap at the same or a new address. Numeric/boolean/string
//! payloads are symbolic expressions (constants are just `Const` leaves).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use argus_ir::{Source, Stmt};
use argus_sym::{BoolRef, ExpBool, ExpNum, ExpString, NumRef, ShapeRef, StrRef};

use crate::heap::{Addr, ShEnv};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Log,
    Warning,
    Error,
}

impl LogLevel {
    pub fn label(&self) -> &'static str {
        match self {
            LogLevel::Log => "log",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// An error carried as a value, not a host exception.
#[derive(Clone, Debug, PartialEq)]
pub struct ShError {
    pub reason: Rc<str>,
    pub level: LogLevel,
    pub source: Source,
}

impl ShError {
    pub fn error(reason: impl Into<Rc<str>>, source: Source) -> Self {
        ShError {
            reason: reason.into(),
            level: LogLevel::Error,
            source,
        }
    }

    pub fn warning(reason: impl Into<Rc<str>>, source: Source) -> Self {
        ShError {
            reason: reason.into(),
            level: LogLevel::Warning,
            source,
        }
    }
}

/// An object: attributes, sparse integer indices, string keys, an optional
/// tensor shape, and a back-reference to its own heap address. An object
/// whose `shape` is populated is a sized value (tensor / size tuple).
#[derive(Clone, Debug, PartialEq)]
pub struct ShObj {
    pub addr: Addr,
    pub attrs: Rc<HashMap<Rc<str>, ShValue>>,
    pub indices: Rc<BTreeMap<i64, ShValue>>,
    pub key_values: Rc<HashMap<Rc<str>, ShValue>>,
    pub shape: Option<ShapeRef>,
}

impl ShObj {
    pub fn new(addr: Addr) -> Self {
        ShObj {
            addr,
            attrs: Rc::new(HashMap::new()),
            indices: Rc::new(BTreeMap::new()),
            key_values: Rc::new(HashMap::new()),
            shape: None,
        }
    }

    pub fn get_attr(&self, name: &str) -> Option<&ShValue> {
        self.attrs.get(name)
    }

    pub fn set_attr(&self, name: impl Into<Rc<str>>, value: ShValue) -> Self {
        let mut next = self.clone();
        Rc::make_mut(&mut next.attrs).insert(name.into(), value);
        next
    }

    pub fn get_index(&self, index: i64) -> Option<&ShValue> {
        self.indices.get(&index)
    }

    pub fn set_index(&self, index: i64, value: ShValue) -> Self {
        let mut next = self.clone();
        Rc::make_mut(&mut next.indices).insert(index, value);
        next
    }

    pub fn get_key_val(&self, key: &str) -> Option<&ShValue> {
        self.key_values.get(key)
    }

    pub fn set_key_val(&self, key: impl Into<Rc<str>>, value: ShValue) -> Self {
        let mut next = self.clone();
        Rc::make_mut(&mut next.key_values).insert(key.into(), value);
        next
    }

    pub fn with_shape(&self, shape: ShapeRef) -> Self {
        let mut next = self.clone();
        next.shape = Some(shape);
        next
    }

    /// Number of consecutive indices starting at 0 (list-like length).
    pub fn seq_len(&self) -> i64 {
        let mut len = 0;
        while self.indices.contains_key(&len) {
            len += 1;
        }
        len
    }
}

/// Parameter list carried by a function value. Defaults are already
/// evaluated (definition-time semantics).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FuncParams {
    pub names: Vec<Rc<str>>,
    pub defaults: Vec<(Rc<str>, ShValue)>,
    pub vararg: Option<Rc<str>>,
    pub kwvararg: Option<Rc<str>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ShFunc {
    pub name: Rc<str>,
    pub params: FuncParams,
    pub body: Rc<Stmt>,
    /// Captured definition environment.
    pub env: ShEnv,
    /// Whether the body can capture the frame (nested definitions). Frames
    /// of closure-free functions are freed region-style after the call.
    pub has_closure: bool,
    pub bound_self: Option<Addr>,
    pub source: Source,
}

impl ShFunc {
    /// A copy with the receiver prepended, i.e. a bound method.
    pub fn bound(&self, self_addr: Addr) -> ShFunc {
        let mut next = self.clone();
        next.bound_self = Some(self_addr);
        next
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ShValue {
    Int(NumRef),
    Float(NumRef),
    Bool(BoolRef),
    Str(StrRef),
    Obj(ShObj),
    Func(Rc<ShFunc>),
    Addr(Addr),
    None,
    NotImpl,
    Undef,
    Error(ShError),
}

impl ShValue {
    pub fn int_const(value: i64, source: Source) -> ShValue {
        ShValue::Int(ExpNum::constant(value as f64, source))
    }

    pub fn float_const(value: f64, source: Source) -> ShValue {
        ShValue::Float(ExpNum::constant(value, source))
    }

    pub fn bool_const(value: bool, source: Source) -> ShValue {
        ShValue::Bool(ExpBool::constant(value, source))
    }

    pub fn str_const(value: impl Into<Rc<str>>, source: Source) -> ShValue {
        ShValue::Str(ExpString::constant(value, source))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ShValue::Error(_))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ShValue::Int(_) => "int",
            ShValue::Float(_) => "float",
            ShValue::Bool(_) => "bool",
            ShValue::Str(_) => "str",
            ShValue::Obj(_) => "object",
            ShValue::Func(_) => "function",
            ShValue::Addr(_) => "address",
            ShValue::None => "None",
            ShValue::NotImpl => "NotImplemented",
            ShValue::Undef => "undefined",
            ShValue::Error(_) => "error",
        }
    }

    pub fn as_num(&self) -> Option<&NumRef> {
        match self {
            ShValue::Int(n) | ShValue::Float(n) => Some(n),
            _ => None,
        }
    }

    /// Shift every embedded address by `offset`; used when a bootstrap heap
    /// is moved into the negative default space.
    pub fn shift_addr(&self, offset: i64) -> ShValue {
        match self {
            ShValue::Addr(addr) => ShValue::Addr(addr.shifted(offset)),
            ShValue::Obj(obj) => {
                let mut next = ShObj::new(obj.addr.shifted(offset));
                next.attrs = Rc::new(
                    obj.attrs
                        .iter()
                        .map(|(k, v)| (k.clone(), v.shift_addr(offset)))
                        .collect(),
                );
                next.indices = Rc::new(
                    obj.indices
                        .iter()
                        .map(|(k, v)| (*k, v.shift_addr(offset)))
                        .collect(),
                );
                next.key_values = Rc::new(
                    obj.key_values
                        .iter()
                        .map(|(k, v)| (k.clone(), v.shift_addr(offset)))
                        .collect(),
                );
                next.shape = obj.shape.clone();
                ShValue::Obj(next)
            }
            ShValue::Func(func) => {
                let mut next = (**func).clone();
                next.env = func.env.shift_addr(offset);
                next.bound_self = func.bound_self.map(|a| a.shifted(offset));
                ShValue::Func(Rc::new(next))
            }
            other => other.clone(),
        }
    }
}

impl fmt::Display for ShValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShValue::Int(n) | ShValue::Float(n) => write!(f, "{n}"),
            ShValue::Bool(b) => write!(f, "{b}"),
            ShValue::Str(s) => write!(f, "{s}"),
            ShValue::Obj(obj) => match &obj.shape {
                Some(shape) => write!(f, "tensor{shape}@{}", obj.addr),
                None => write!(f, "object@{}", obj.addr),
            },
            ShValue::Func(func) => write!(f, "function {}", func.name),
            ShValue::Addr(addr) => write!(f, "&{addr}"),
            ShValue::None => write!(f, "None"),
            ShValue::NotImpl => write!(f, "NotImplemented"),
            ShValue::Undef => write!(f, "undef"),
            ShValue::Error(err) => write!(f, "{}: {}", err.level.label(), err.reason),
        }
    }
}
