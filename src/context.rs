// File: src/context.rs
//
// Host context consumed by the VM: the global object and prototype set,
// the microtask queue, the pending-exception slot, and the throw helpers.
// One context owns one VM; the engine is single-threaded per context.

use crate::builtins;
use crate::errors::{find_closest_match, JsError};
use crate::value::{
    ErrorType, JsObject, JsSymbol, JsValue, NativeFn, ObjectKind, ObjectRef, Property, PropertyKey,
};
use std::collections::VecDeque;
use std::rc::Rc;

/// A queued host callback: a callable JS value plus its arguments, run by
/// the VM's microtask pump in FIFO order
pub struct Microtask {
    pub callback: JsValue,
    pub args: Vec<JsValue>,
}

pub struct Context {
    pub global: ObjectRef,
    pub object_prototype: ObjectRef,
    pub function_prototype: ObjectRef,
    pub array_prototype: ObjectRef,
    pub string_prototype: ObjectRef,
    pub number_prototype: ObjectRef,
    pub boolean_prototype: ObjectRef,
    pub bigint_prototype: ObjectRef,
    pub symbol_prototype: ObjectRef,
    pub promise_prototype: ObjectRef,
    pub regexp_prototype: ObjectRef,
    pub error_prototypes: Vec<(ErrorType, ObjectRef)>,

    pub symbol_iterator: Rc<JsSymbol>,
    pub symbol_async_iterator: Rc<JsSymbol>,

    pub microtasks: VecDeque<Microtask>,
    pub pending_exception: Option<JsValue>,
    /// Converts an awaited rejection into a catchable exception; None means
    /// rejections terminate the VM call
    pub promise_reject_callback: Option<NativeFn>,
    pub strict: bool,
    pub trace: bool,

    /// The VM value stack; interleaves values and catch markers
    pub stack: Vec<crate::vm::StackValue>,
    /// Best-effort property-access trail for TypeError diagnostics
    pub prop_chain: String,
    pub prop_chain_lock: bool,
    pub generator_prototype: ObjectRef,
}

impl Context {
    pub fn new() -> Self {
        let object_prototype = JsObject::plain(None);
        let function_prototype = JsObject::plain(Some(object_prototype.clone()));
        let array_prototype = JsObject::plain(Some(object_prototype.clone()));
        let string_prototype = JsObject::plain(Some(object_prototype.clone()));
        let number_prototype = JsObject::plain(Some(object_prototype.clone()));
        let boolean_prototype = JsObject::plain(Some(object_prototype.clone()));
        let bigint_prototype = JsObject::plain(Some(object_prototype.clone()));
        let symbol_prototype = JsObject::plain(Some(object_prototype.clone()));
        let promise_prototype = JsObject::plain(Some(object_prototype.clone()));
        let regexp_prototype = JsObject::plain(Some(object_prototype.clone()));

        let error_prototypes = [
            ErrorType::Error,
            ErrorType::TypeError,
            ErrorType::RangeError,
            ErrorType::ReferenceError,
            ErrorType::SyntaxError,
            ErrorType::EvalError,
            ErrorType::UriError,
        ]
        .iter()
        .map(|&t| (t, JsObject::plain(Some(object_prototype.clone()))))
        .collect();

        let global = JsObject::plain(Some(object_prototype.clone()));
        let generator_prototype = JsObject::plain(Some(object_prototype.clone()));

        let mut ctx = Context {
            global,
            object_prototype,
            function_prototype,
            array_prototype,
            string_prototype,
            number_prototype,
            boolean_prototype,
            bigint_prototype,
            symbol_prototype,
            promise_prototype,
            regexp_prototype,
            error_prototypes,
            symbol_iterator: JsSymbol::new(Some("Symbol.iterator".to_string())),
            symbol_async_iterator: JsSymbol::new(Some("Symbol.asyncIterator".to_string())),
            microtasks: VecDeque::new(),
            pending_exception: None,
            promise_reject_callback: Some(builtins::default_reject_callback),
            strict: false,
            trace: std::env::var("NANOJS_TRACE").is_ok(),
            stack: Vec::new(),
            prop_chain: String::new(),
            prop_chain_lock: false,
            generator_prototype,
        };
        builtins::install(&mut ctx);
        ctx
    }

    pub fn error_prototype(&self, error_type: ErrorType) -> ObjectRef {
        self.error_prototypes
            .iter()
            .find(|(t, _)| *t == error_type)
            .map(|(_, p)| p.clone())
            .expect("all error prototypes are installed")
    }

    /// Prototype used when auto-boxing a primitive receiver
    pub fn prototype_for(&self, value: &JsValue) -> Option<ObjectRef> {
        match value {
            JsValue::String(_) => Some(self.string_prototype.clone()),
            JsValue::Number(_) => Some(self.number_prototype.clone()),
            JsValue::Bool(_) => Some(self.boolean_prototype.clone()),
            JsValue::BigInt(_) => Some(self.bigint_prototype.clone()),
            JsValue::Symbol(_) => Some(self.symbol_prototype.clone()),
            _ => None,
        }
    }

    pub fn create_array(&self, elements: Vec<JsValue>) -> JsValue {
        JsValue::Object(JsObject::array(elements, Some(self.array_prototype.clone())))
    }

    pub fn create_array_with_capacity(&self, len: usize, capacity: usize) -> JsValue {
        let mut elements = Vec::with_capacity(capacity.max(len));
        elements.resize(len, JsValue::Undefined);
        self.create_array(elements)
    }

    pub fn create_error(&self, error_type: ErrorType, message: &str) -> JsValue {
        let obj = JsObject::new(
            ObjectKind::Error(error_type),
            Some(self.error_prototype(error_type)),
        );
        obj.borrow_mut().properties.insert(
            PropertyKey::string("message"),
            Property::hidden(JsValue::string(message)),
        );
        obj.borrow_mut().properties.insert(
            PropertyKey::string("name"),
            Property::hidden(JsValue::string(error_type.name())),
        );
        JsValue::Object(obj)
    }

    /// Build a TypeError, set it pending, and hand it back
    pub fn throw_type_error(&mut self, message: &str) -> JsValue {
        let error = self.create_error(ErrorType::TypeError, message);
        self.pending_exception = Some(error.clone());
        error
    }

    pub fn throw_range_error(&mut self, message: &str) -> JsValue {
        let error = self.create_error(ErrorType::RangeError, message);
        self.pending_exception = Some(error.clone());
        error
    }

    pub fn throw_reference_error(&mut self, message: &str) -> JsValue {
        let error = self.create_error(ErrorType::ReferenceError, message);
        self.pending_exception = Some(error.clone());
        error
    }

    pub fn enqueue_microtask(&mut self, callback: JsValue, args: Vec<JsValue>) {
        self.microtasks.push_back(Microtask { callback, args });
    }

    pub fn global_get(&self, name: &str) -> Option<JsValue> {
        self.global
            .borrow()
            .own_property(&PropertyKey::string(name))
            .map(|p| p.value)
    }

    pub fn global_set(&self, name: &str, value: JsValue) {
        self.global.borrow_mut().set_own(PropertyKey::string(name), value);
    }

    /// ReferenceError for an unresolved global, with a spelling suggestion
    /// when a close global name exists
    pub fn unresolved_reference(&self, name: &str) -> JsError {
        let candidates: Vec<String> = self
            .global
            .borrow()
            .properties
            .keys()
            .filter_map(|k| match k {
                PropertyKey::String(s) => Some(s.to_string()),
                PropertyKey::Symbol(_) => None,
            })
            .collect();
        let mut err = JsError::reference_error(format!("{} is not defined", name));
        if let Some(suggestion) = find_closest_match(name, &candidates) {
            err = err.with_suggestion(suggestion.to_string());
        }
        err
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_bootstrap_has_core_names() {
        let ctx = Context::new();
        assert!(ctx.global_get("globalThis").is_some());
        assert!(ctx.global_get("print").is_some());
        assert!(ctx.global_get("Error").is_some());
        assert!(ctx.global_get("TypeError").is_some());
        assert!(ctx.global_get("Promise").is_some());
        assert!(ctx.global_get("NaN").is_some());
    }

    #[test]
    fn test_throw_helpers_set_pending_exception() {
        let mut ctx = Context::new();
        assert!(ctx.pending_exception.is_none());
        let err = ctx.throw_type_error("x is not a function");
        assert!(ctx.pending_exception.is_some());
        assert!(err.to_js_string().contains("x is not a function"));
    }

    #[test]
    fn test_unresolved_reference_suggests_close_name() {
        let ctx = Context::new();
        let err = ctx.unresolved_reference("prin");
        assert_eq!(err.suggestion.as_deref(), Some("print"));
    }

    #[test]
    fn test_array_factory_tracks_length() {
        let ctx = Context::new();
        let arr = ctx.create_array_with_capacity(3, 8);
        let obj = arr.as_object().unwrap();
        let len = obj.borrow().own_property(&PropertyKey::string("length")).unwrap();
        assert!(matches!(len.value, JsValue::Number(n) if n == 3.0));
    }
}
