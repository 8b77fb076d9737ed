// File: src/value.rs
//
// JavaScript value and object model for the NanoJS VM.
// JsValue is a tagged sum over the primitive types plus a shared object
// reference; objects carry a class kind, a prototype link, and an
// insertion-ordered property table.

use crate::bytecode::FunctionTemplate;
use crate::errors::JsError;
use crate::regex::RegexEngine;
use crate::vm::VarRef;
use ahash::RandomState;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

pub type ObjectRef = Rc<RefCell<JsObject>>;

#[derive(Clone)]
pub enum JsValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    /// Fixed-width bigint; arbitrary precision is a library concern
    BigInt(i128),
    String(Rc<str>),
    Symbol(Rc<JsSymbol>),
    Object(ObjectRef),
    /// Engine-internal TDZ sentinel stored in not-yet-initialised let/const
    /// slots; the *_CHECK opcodes turn reads of it into ReferenceErrors and
    /// it never escapes the VM
    Uninitialized,
}

#[derive(Debug)]
pub struct JsSymbol {
    pub description: Option<String>,
    pub id: u64,
}

static NEXT_SYMBOL_ID: AtomicU64 = AtomicU64::new(1);

impl JsSymbol {
    pub fn new(description: Option<String>) -> Rc<JsSymbol> {
        Rc::new(JsSymbol { description, id: NEXT_SYMBOL_ID.fetch_add(1, Ordering::Relaxed) })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    String(Rc<str>),
    /// Symbols compare by identity; the id is allocation-unique
    Symbol(u64),
}

impl PropertyKey {
    pub fn string(s: &str) -> Self {
        PropertyKey::String(Rc::from(s))
    }

    pub fn from_value(value: &JsValue) -> Self {
        match value {
            JsValue::Symbol(sym) => PropertyKey::Symbol(sym.id),
            other => PropertyKey::String(Rc::from(other.to_js_string().as_str())),
        }
    }
}

#[derive(Clone)]
pub struct Property {
    pub value: JsValue,
    pub getter: Option<JsValue>,
    pub setter: Option<JsValue>,
    pub enumerable: bool,
    pub writable: bool,
    pub configurable: bool,
}

impl Property {
    pub fn data(value: JsValue) -> Self {
        Self {
            value,
            getter: None,
            setter: None,
            enumerable: true,
            writable: true,
            configurable: true,
        }
    }

    pub fn hidden(value: JsValue) -> Self {
        Self { enumerable: false, ..Self::data(value) }
    }

    pub fn accessor(getter: Option<JsValue>, setter: Option<JsValue>) -> Self {
        Self {
            value: JsValue::Undefined,
            getter,
            setter,
            enumerable: true,
            writable: true,
            configurable: true,
        }
    }

    pub fn is_accessor(&self) -> bool {
        self.getter.is_some() || self.setter.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorType {
    Error,
    TypeError,
    RangeError,
    ReferenceError,
    SyntaxError,
    EvalError,
    UriError,
}

impl ErrorType {
    pub fn name(self) -> &'static str {
        match self {
            ErrorType::Error => "Error",
            ErrorType::TypeError => "TypeError",
            ErrorType::RangeError => "RangeError",
            ErrorType::ReferenceError => "ReferenceError",
            ErrorType::SyntaxError => "SyntaxError",
            ErrorType::EvalError => "EvalError",
            ErrorType::UriError => "URIError",
        }
    }
}

#[derive(Clone, Debug)]
pub enum PromiseState {
    Pending,
    Fulfilled(JsValue),
    Rejected(JsValue),
}

/// Constructor-type tag carried by every object
pub enum ObjectKind {
    Plain,
    /// Dense element storage; `length` is derived
    Array(Vec<JsValue>),
    Function(Box<FunctionData>),
    Error(ErrorType),
    Promise(PromiseState),
    Proxy {
        target: ObjectRef,
        handler: ObjectRef,
    },
    RegExp(Rc<RegexEngine>),
    Date(f64),
    Map,
    Set,
    WeakMap,
    WeakSet,
    WeakRef,
    FinalizationRegistry,
    TypedArray(TypedArrayKind),
    /// Auto-boxed primitive; holds the [[PrimitiveValue]] slot
    Boxed(JsValue),
    /// Generator object with its resumable continuation
    Generator(Box<crate::vm::GeneratorState>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypedArrayKind {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
    BigInt64,
    BigUint64,
}

/// Native function entry point: context, the function object itself (for
/// bound state in `captured_values`), the receiver, and the arguments
pub type NativeFn = fn(
    &mut crate::context::Context,
    &JsValue,
    &JsValue,
    &[JsValue],
) -> Result<JsValue, JsError>;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ConstructorKind {
    /// Not constructible (arrows, methods, most natives)
    None,
    Base,
    /// Class with an `extends` clause
    Derived,
}

pub enum Callable {
    Native(NativeFn),
    Bytecode(Rc<FunctionTemplate>),
}

/// Built-in constructors dispatch through their factory instead of an
/// ordinary [[Construct]]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuiltinCtor {
    Object,
    Array,
    Error(ErrorType),
    Boolean,
    Number,
    String,
    Promise,
    Proxy,
    RegExp,
}

pub struct FunctionData {
    pub name: String,
    pub callable: Callable,
    /// Shared closure cells, present for reference-based capture
    pub var_refs: Vec<VarRef>,
    /// Snapshot capture alternative; used when the template asks for values
    pub captured_values: Vec<JsValue>,
    /// `this` frozen at closure creation (arrow functions)
    pub captured_this: Option<JsValue>,
    pub is_generator: bool,
    pub is_async: bool,
    pub constructor_kind: ConstructorKind,
    /// Prototype of the superclass constructor, for `super` dispatch
    pub home_object: Option<ObjectRef>,
    pub builtin: Option<BuiltinCtor>,
}

impl FunctionData {
    pub fn native(name: &str, f: NativeFn) -> Self {
        Self {
            name: name.to_string(),
            callable: Callable::Native(f),
            var_refs: Vec::new(),
            captured_values: Vec::new(),
            captured_this: None,
            is_generator: false,
            is_async: false,
            constructor_kind: ConstructorKind::None,
            home_object: None,
            builtin: None,
        }
    }

    pub fn builtin_ctor(name: &str, f: NativeFn, builtin: BuiltinCtor) -> Self {
        Self {
            constructor_kind: ConstructorKind::Base,
            builtin: Some(builtin),
            ..Self::native(name, f)
        }
    }
}

pub struct JsObject {
    pub kind: ObjectKind,
    pub properties: IndexMap<PropertyKey, Property, RandomState>,
    pub prototype: Option<ObjectRef>,
    pub extensible: bool,
}

impl JsObject {
    pub fn new(kind: ObjectKind, prototype: Option<ObjectRef>) -> ObjectRef {
        Rc::new(RefCell::new(JsObject {
            kind,
            properties: IndexMap::default(),
            prototype,
            extensible: true,
        }))
    }

    pub fn plain(prototype: Option<ObjectRef>) -> ObjectRef {
        Self::new(ObjectKind::Plain, prototype)
    }

    pub fn array(elements: Vec<JsValue>, prototype: Option<ObjectRef>) -> ObjectRef {
        Self::new(ObjectKind::Array(elements), prototype)
    }

    pub fn is_callable(&self) -> bool {
        matches!(self.kind, ObjectKind::Function(_))
            || matches!(self.kind, ObjectKind::Proxy { .. })
    }

    pub fn class_name(&self) -> &'static str {
        match self.kind {
            ObjectKind::Plain => "Object",
            ObjectKind::Array(_) => "Array",
            ObjectKind::Function(_) => "Function",
            ObjectKind::Error(_) => "Error",
            ObjectKind::Promise(_) => "Promise",
            ObjectKind::Proxy { .. } => "Proxy",
            ObjectKind::RegExp(_) => "RegExp",
            ObjectKind::Date(_) => "Date",
            ObjectKind::Map => "Map",
            ObjectKind::Set => "Set",
            ObjectKind::WeakMap => "WeakMap",
            ObjectKind::WeakSet => "WeakSet",
            ObjectKind::WeakRef => "WeakRef",
            ObjectKind::FinalizationRegistry => "FinalizationRegistry",
            ObjectKind::TypedArray(_) => "TypedArray",
            ObjectKind::Boxed(_) => "Object",
            ObjectKind::Generator(_) => "Generator",
        }
    }

    /// Own property only; prototype chain walking lives in lookup()
    pub fn own_property(&self, key: &PropertyKey) -> Option<Property> {
        if let ObjectKind::Array(ref elements) = self.kind {
            if let PropertyKey::String(s) = key {
                if s.as_ref() == "length" {
                    return Some(Property::hidden(JsValue::Number(elements.len() as f64)));
                }
                if let Some(index) = array_index(s) {
                    return elements.get(index).map(|v| Property::data(v.clone()));
                }
            }
        }
        self.properties.get(key).cloned()
    }

    pub fn set_own(&mut self, key: PropertyKey, value: JsValue) {
        if let ObjectKind::Array(ref mut elements) = self.kind {
            if let PropertyKey::String(ref s) = key {
                if s.as_ref() == "length" {
                    if let JsValue::Number(n) = value {
                        let len = n.max(0.0) as usize;
                        elements.resize(len, JsValue::Undefined);
                        return;
                    }
                }
                if let Some(index) = array_index(s) {
                    if index >= elements.len() {
                        elements.resize(index + 1, JsValue::Undefined);
                    }
                    elements[index] = value;
                    return;
                }
            }
        }
        match self.properties.get_mut(&key) {
            Some(prop) if !prop.is_accessor() => prop.value = value,
            Some(_) => {}
            None => {
                self.properties.insert(key, Property::data(value));
            }
        }
    }

    pub fn delete_own(&mut self, key: &PropertyKey) -> bool {
        if let ObjectKind::Array(ref mut elements) = self.kind {
            if let PropertyKey::String(s) = key {
                if let Some(index) = array_index(s) {
                    if index < elements.len() {
                        elements[index] = JsValue::Undefined;
                        return true;
                    }
                }
            }
        }
        match self.properties.get(key) {
            Some(prop) if !prop.configurable => false,
            Some(_) => {
                self.properties.shift_remove(key);
                true
            }
            None => true,
        }
    }

    pub fn function_data(&self) -> Option<&FunctionData> {
        match self.kind {
            ObjectKind::Function(ref data) => Some(data),
            _ => None,
        }
    }
}

fn array_index(s: &str) -> Option<usize> {
    if s.is_empty() || (s.len() > 1 && s.starts_with('0')) {
        return None;
    }
    s.parse::<usize>().ok()
}

/// Walk the prototype chain for a property
pub fn lookup_property(obj: &ObjectRef, key: &PropertyKey) -> Option<Property> {
    let mut current = obj.clone();
    loop {
        if let Some(prop) = current.borrow().own_property(key) {
            return Some(prop);
        }
        let next = current.borrow().prototype.clone();
        match next {
            Some(proto) => current = proto,
            None => return None,
        }
    }
}

pub fn has_property(obj: &ObjectRef, key: &PropertyKey) -> bool {
    lookup_property(obj, key).is_some()
}

impl JsValue {
    pub fn string(s: &str) -> Self {
        JsValue::String(Rc::from(s))
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            JsValue::Undefined | JsValue::Uninitialized => "undefined",
            JsValue::Null => "object",
            JsValue::Bool(_) => "boolean",
            JsValue::Number(_) => "number",
            JsValue::BigInt(_) => "bigint",
            JsValue::String(_) => "string",
            JsValue::Symbol(_) => "symbol",
            JsValue::Object(obj) => {
                if obj.borrow().is_callable() {
                    "function"
                } else {
                    "object"
                }
            }
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, JsValue::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, JsValue::Null)
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, JsValue::Undefined | JsValue::Null)
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            JsValue::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn to_boolean(&self) -> bool {
        match self {
            JsValue::Undefined | JsValue::Null | JsValue::Uninitialized => false,
            JsValue::Bool(b) => *b,
            JsValue::Number(n) => *n != 0.0 && !n.is_nan(),
            JsValue::BigInt(n) => *n != 0,
            JsValue::String(s) => !s.is_empty(),
            JsValue::Symbol(_) => true,
            JsValue::Object(_) => true,
        }
    }

    /// ToNumber over the primitive cases; objects use their primitive value
    /// when boxed and NaN otherwise (full ToPrimitive is a library concern)
    pub fn to_number(&self) -> f64 {
        match self {
            JsValue::Undefined | JsValue::Uninitialized => f64::NAN,
            JsValue::Null => 0.0,
            JsValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            JsValue::Number(n) => *n,
            JsValue::BigInt(n) => *n as f64,
            JsValue::String(s) => {
                let t = s.trim();
                if t.is_empty() {
                    0.0
                } else if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
                    i64::from_str_radix(hex, 16).map(|v| v as f64).unwrap_or(f64::NAN)
                } else {
                    t.parse().unwrap_or(f64::NAN)
                }
            }
            JsValue::Symbol(_) => f64::NAN,
            JsValue::Object(obj) => match obj.borrow().kind {
                ObjectKind::Boxed(ref inner) => inner.to_number(),
                ObjectKind::Array(ref elements) if elements.is_empty() => 0.0,
                ObjectKind::Array(ref elements) if elements.len() == 1 => {
                    elements[0].to_number()
                }
                _ => f64::NAN,
            },
        }
    }

    pub fn to_int32(&self) -> i32 {
        let n = self.to_number();
        if !n.is_finite() {
            return 0;
        }
        n as i64 as i32
    }

    pub fn to_uint32(&self) -> u32 {
        self.to_int32() as u32
    }

    /// Host-facing string conversion; does not run user toString methods
    pub fn to_js_string(&self) -> String {
        match self {
            JsValue::Undefined | JsValue::Uninitialized => "undefined".to_string(),
            JsValue::Null => "null".to_string(),
            JsValue::Bool(b) => b.to_string(),
            JsValue::Number(n) => format_number(*n),
            JsValue::BigInt(n) => n.to_string(),
            JsValue::String(s) => s.to_string(),
            JsValue::Symbol(sym) => {
                format!("Symbol({})", sym.description.as_deref().unwrap_or(""))
            }
            JsValue::Object(obj) => {
                let obj = obj.borrow();
                match obj.kind {
                    ObjectKind::Array(ref elements) => elements
                        .iter()
                        .map(|v| {
                            if v.is_nullish() {
                                String::new()
                            } else {
                                v.to_js_string()
                            }
                        })
                        .collect::<Vec<_>>()
                        .join(","),
                    ObjectKind::Function(ref data) => {
                        format!("function {}() {{ [native code] }}", data.name)
                    }
                    ObjectKind::Error(error_type) => {
                        let message = obj
                            .own_property(&PropertyKey::string("message"))
                            .map(|p| p.value.to_js_string())
                            .unwrap_or_default();
                        if message.is_empty() {
                            error_type.name().to_string()
                        } else {
                            format!("{}: {}", error_type.name(), message)
                        }
                    }
                    ObjectKind::Boxed(ref inner) => inner.to_js_string(),
                    _ => "[object Object]".to_string(),
                }
            }
        }
    }

    pub fn strict_equals(&self, other: &JsValue) -> bool {
        match (self, other) {
            (JsValue::Undefined, JsValue::Undefined) => true,
            (JsValue::Null, JsValue::Null) => true,
            (JsValue::Bool(a), JsValue::Bool(b)) => a == b,
            (JsValue::Number(a), JsValue::Number(b)) => a == b,
            (JsValue::BigInt(a), JsValue::BigInt(b)) => a == b,
            (JsValue::String(a), JsValue::String(b)) => a == b,
            (JsValue::Symbol(a), JsValue::Symbol(b)) => a.id == b.id,
            (JsValue::Object(a), JsValue::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Abstract equality (`==`)
    pub fn loose_equals(&self, other: &JsValue) -> bool {
        match (self, other) {
            (JsValue::Undefined | JsValue::Null, JsValue::Undefined | JsValue::Null) => true,
            (JsValue::Number(_), JsValue::Number(_))
            | (JsValue::String(_), JsValue::String(_))
            | (JsValue::Bool(_), JsValue::Bool(_))
            | (JsValue::BigInt(_), JsValue::BigInt(_))
            | (JsValue::Symbol(_), JsValue::Symbol(_))
            | (JsValue::Object(_), JsValue::Object(_)) => self.strict_equals(other),
            (JsValue::Number(a), JsValue::String(_)) => *a == other.to_number(),
            (JsValue::String(_), JsValue::Number(b)) => self.to_number() == *b,
            (JsValue::BigInt(a), JsValue::Number(b)) => *a as f64 == *b,
            (JsValue::Number(a), JsValue::BigInt(b)) => *a == *b as f64,
            (JsValue::BigInt(a), JsValue::String(s)) => {
                s.trim().parse::<i128>().map(|v| v == *a).unwrap_or(false)
            }
            (JsValue::String(s), JsValue::BigInt(b)) => {
                s.trim().parse::<i128>().map(|v| v == *b).unwrap_or(false)
            }
            (JsValue::Bool(_), _) => JsValue::Number(self.to_number()).loose_equals(other),
            (_, JsValue::Bool(_)) => self.loose_equals(&JsValue::Number(other.to_number())),
            (JsValue::Object(obj), JsValue::Number(_) | JsValue::String(_))
            | (JsValue::Object(obj), JsValue::BigInt(_)) => {
                // ToPrimitive simplified to the boxed value / join string
                let primitive = match obj.borrow().kind {
                    ObjectKind::Boxed(ref inner) => inner.clone(),
                    _ => JsValue::string(&self.to_js_string()),
                };
                primitive.loose_equals(other)
            }
            (JsValue::Number(_) | JsValue::String(_) | JsValue::BigInt(_), JsValue::Object(_)) => {
                other.loose_equals(self)
            }
            _ => false,
        }
    }
}

/// Number formatting following the engine-visible conventions: integers
/// print without a fraction, NaN/Infinity by name
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Debug for JsValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JsValue::String(s) => write!(f, "\"{}\"", s),
            JsValue::Object(obj) => write!(f, "[{}]", obj.borrow().class_name()),
            other => write!(f, "{}", other.to_js_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typeof_categories() {
        assert_eq!(JsValue::Undefined.type_of(), "undefined");
        assert_eq!(JsValue::Null.type_of(), "object");
        assert_eq!(JsValue::Number(1.0).type_of(), "number");
        assert_eq!(JsValue::BigInt(1).type_of(), "bigint");
        assert_eq!(JsValue::string("x").type_of(), "string");
        let obj = JsObject::plain(None);
        assert_eq!(JsValue::Object(obj).type_of(), "object");
    }

    #[test]
    fn test_truthiness() {
        assert!(!JsValue::Number(0.0).to_boolean());
        assert!(!JsValue::Number(f64::NAN).to_boolean());
        assert!(!JsValue::string("").to_boolean());
        assert!(JsValue::string("0").to_boolean());
        assert!(JsValue::Object(JsObject::plain(None)).to_boolean());
    }

    #[test]
    fn test_loose_equality_coercions() {
        assert!(JsValue::Null.loose_equals(&JsValue::Undefined));
        assert!(JsValue::Number(1.0).loose_equals(&JsValue::string("1")));
        assert!(JsValue::Bool(true).loose_equals(&JsValue::Number(1.0)));
        assert!(!JsValue::Null.loose_equals(&JsValue::Number(0.0)));
        assert!(JsValue::BigInt(5).loose_equals(&JsValue::Number(5.0)));
    }

    #[test]
    fn test_array_element_access() {
        let arr = JsObject::array(vec![JsValue::Number(1.0), JsValue::Number(2.0)], None);
        let len = arr.borrow().own_property(&PropertyKey::string("length")).unwrap();
        assert!(matches!(len.value, JsValue::Number(n) if n == 2.0));
        let first = arr.borrow().own_property(&PropertyKey::string("0")).unwrap();
        assert!(matches!(first.value, JsValue::Number(n) if n == 1.0));
        arr.borrow_mut().set_own(PropertyKey::string("5"), JsValue::Bool(true));
        let len = arr.borrow().own_property(&PropertyKey::string("length")).unwrap();
        assert!(matches!(len.value, JsValue::Number(n) if n == 6.0));
    }

    #[test]
    fn test_prototype_chain_lookup() {
        let proto = JsObject::plain(None);
        proto
            .borrow_mut()
            .set_own(PropertyKey::string("shared"), JsValue::Number(7.0));
        let obj = JsObject::plain(Some(proto));
        let found = lookup_property(&obj, &PropertyKey::string("shared")).unwrap();
        assert!(matches!(found.value, JsValue::Number(n) if n == 7.0));
        assert!(lookup_property(&obj, &PropertyKey::string("missing")).is_none());
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(format_number(42.0), "42");
        assert_eq!(format_number(1.5), "1.5");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(f64::INFINITY), "Infinity");
    }
}
