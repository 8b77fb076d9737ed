// File: src/builtins.rs
//
// Native functions installed on the global object. Deliberately minimal:
// enough built-in surface for programs to exercise the VM (arrays,
// strings, errors, promises, console), not a standard library.

use crate::context::Context;
use crate::errors::JsError;
use crate::value::{
    lookup_property, BuiltinCtor, ErrorType, FunctionData, JsObject, JsValue, ObjectKind,
    ObjectRef, Property, PropertyKey, PromiseState,
};
use crate::vm;
use std::rc::Rc;

/// Wrap a native fn into a function object
pub fn native_function(ctx: &Context, name: &str, f: crate::value::NativeFn) -> JsValue {
    let data = FunctionData::native(name, f);
    let obj = JsObject::new(
        ObjectKind::Function(Box::new(data)),
        Some(ctx.function_prototype.clone()),
    );
    JsValue::Object(obj)
}

fn bound_native(
    ctx: &Context,
    name: &str,
    f: crate::value::NativeFn,
    captured: Vec<JsValue>,
) -> JsValue {
    let mut data = FunctionData::native(name, f);
    data.captured_values = captured;
    let obj = JsObject::new(
        ObjectKind::Function(Box::new(data)),
        Some(ctx.function_prototype.clone()),
    );
    JsValue::Object(obj)
}

fn ctor_function(
    ctx: &Context,
    name: &str,
    f: crate::value::NativeFn,
    builtin: BuiltinCtor,
    prototype: &ObjectRef,
) -> JsValue {
    let data = FunctionData::builtin_ctor(name, f, builtin);
    let obj = JsObject::new(
        ObjectKind::Function(Box::new(data)),
        Some(ctx.function_prototype.clone()),
    );
    obj.borrow_mut().properties.insert(
        PropertyKey::string("prototype"),
        Property::hidden(JsValue::Object(prototype.clone())),
    );
    prototype.borrow_mut().properties.insert(
        PropertyKey::string("constructor"),
        Property::hidden(JsValue::Object(obj.clone())),
    );
    JsValue::Object(obj)
}

fn define_method(target: &ObjectRef, ctx: &Context, name: &str, f: crate::value::NativeFn) {
    let func = native_function(ctx, name, f);
    target
        .borrow_mut()
        .properties
        .insert(PropertyKey::string(name), Property::hidden(func));
}

/// Populate the global object and the prototype set
pub fn install(ctx: &mut Context) {
    let global = ctx.global.clone();

    global.borrow_mut().set_own(
        PropertyKey::string("globalThis"),
        JsValue::Object(global.clone()),
    );
    global
        .borrow_mut()
        .set_own(PropertyKey::string("NaN"), JsValue::Number(f64::NAN));
    global
        .borrow_mut()
        .set_own(PropertyKey::string("Infinity"), JsValue::Number(f64::INFINITY));
    global
        .borrow_mut()
        .set_own(PropertyKey::string("undefined"), JsValue::Undefined);

    let print = native_function(ctx, "print", js_print);
    global.borrow_mut().set_own(PropertyKey::string("print"), print.clone());

    let console = JsObject::plain(Some(ctx.object_prototype.clone()));
    console
        .borrow_mut()
        .set_own(PropertyKey::string("log"), print.clone());
    console.borrow_mut().set_own(PropertyKey::string("error"), print);
    global
        .borrow_mut()
        .set_own(PropertyKey::string("console"), JsValue::Object(console));

    global.borrow_mut().set_own(
        PropertyKey::string("queueMicrotask"),
        native_function(ctx, "queueMicrotask", js_queue_microtask),
    );

    // Constructors
    let object_proto = ctx.object_prototype.clone();
    let array_proto = ctx.array_prototype.clone();
    let string_proto = ctx.string_prototype.clone();
    let number_proto = ctx.number_prototype.clone();
    let boolean_proto = ctx.boolean_prototype.clone();
    let promise_proto = ctx.promise_prototype.clone();
    let regexp_proto = ctx.regexp_prototype.clone();

    let object_ctor = ctor_function(ctx, "Object", js_object_ctor, BuiltinCtor::Object, &object_proto);
    global.borrow_mut().set_own(PropertyKey::string("Object"), object_ctor);
    let array_ctor = ctor_function(ctx, "Array", js_array_ctor, BuiltinCtor::Array, &array_proto);
    global.borrow_mut().set_own(PropertyKey::string("Array"), array_ctor);
    let string_ctor =
        ctor_function(ctx, "String", js_string_ctor, BuiltinCtor::String, &string_proto);
    global.borrow_mut().set_own(PropertyKey::string("String"), string_ctor);
    let number_ctor =
        ctor_function(ctx, "Number", js_number_ctor, BuiltinCtor::Number, &number_proto);
    global.borrow_mut().set_own(PropertyKey::string("Number"), number_ctor);
    let boolean_ctor =
        ctor_function(ctx, "Boolean", js_boolean_ctor, BuiltinCtor::Boolean, &boolean_proto);
    global.borrow_mut().set_own(PropertyKey::string("Boolean"), boolean_ctor);
    let regexp_ctor =
        ctor_function(ctx, "RegExp", js_regexp_ctor, BuiltinCtor::RegExp, &regexp_proto);
    global.borrow_mut().set_own(PropertyKey::string("RegExp"), regexp_ctor);

    for &error_type in &[
        ErrorType::Error,
        ErrorType::TypeError,
        ErrorType::RangeError,
        ErrorType::ReferenceError,
        ErrorType::SyntaxError,
        ErrorType::EvalError,
        ErrorType::UriError,
    ] {
        let proto = ctx.error_prototype(error_type);
        let ctor = ctor_function(
            ctx,
            error_type.name(),
            js_error_ctor,
            BuiltinCtor::Error(error_type),
            &proto,
        );
        global
            .borrow_mut()
            .set_own(PropertyKey::string(error_type.name()), ctor);
    }

    let promise_ctor =
        ctor_function(ctx, "Promise", js_promise_ctor, BuiltinCtor::Promise, &promise_proto);
    if let JsValue::Object(ref ctor_obj) = promise_ctor {
        let resolve = native_function(ctx, "resolve", js_promise_resolve);
        let reject = native_function(ctx, "reject", js_promise_reject);
        ctor_obj
            .borrow_mut()
            .properties
            .insert(PropertyKey::string("resolve"), Property::hidden(resolve));
        ctor_obj
            .borrow_mut()
            .properties
            .insert(PropertyKey::string("reject"), Property::hidden(reject));
    }
    global
        .borrow_mut()
        .set_own(PropertyKey::string("Promise"), promise_ctor);

    // Proxies take their prototype from the target; the constructor still
    // needs a placeholder prototype object of its own
    let proxy_proto = JsObject::plain(Some(ctx.object_prototype.clone()));
    let proxy_ctor = ctor_function(ctx, "Proxy", js_proxy_ctor, BuiltinCtor::Proxy, &proxy_proto);
    global.borrow_mut().set_own(PropertyKey::string("Proxy"), proxy_ctor);

    // Symbol namespace exposing the well-known symbols
    let symbol_ns = JsObject::plain(Some(ctx.object_prototype.clone()));
    symbol_ns.borrow_mut().properties.insert(
        PropertyKey::string("iterator"),
        Property::hidden(JsValue::Symbol(ctx.symbol_iterator.clone())),
    );
    symbol_ns.borrow_mut().properties.insert(
        PropertyKey::string("asyncIterator"),
        Property::hidden(JsValue::Symbol(ctx.symbol_async_iterator.clone())),
    );
    global
        .borrow_mut()
        .set_own(PropertyKey::string("Symbol"), JsValue::Object(symbol_ns));

    // Math, minimal
    let math = JsObject::plain(Some(ctx.object_prototype.clone()));
    define_method(&math, ctx, "floor", js_math_floor);
    define_method(&math, ctx, "abs", js_math_abs);
    define_method(&math, ctx, "max", js_math_max);
    define_method(&math, ctx, "min", js_math_min);
    global
        .borrow_mut()
        .set_own(PropertyKey::string("Math"), JsValue::Object(math));

    // Array.prototype
    define_method(&array_proto, ctx, "push", js_array_push);
    define_method(&array_proto, ctx, "pop", js_array_pop);
    define_method(&array_proto, ctx, "map", js_array_map);
    define_method(&array_proto, ctx, "forEach", js_array_for_each);
    define_method(&array_proto, ctx, "join", js_array_join);
    define_method(&array_proto, ctx, "values", js_array_values);
    let values = lookup_property(&array_proto, &PropertyKey::string("values"))
        .expect("values installed above")
        .value;
    array_proto.borrow_mut().properties.insert(
        PropertyKey::Symbol(ctx.symbol_iterator.id),
        Property::hidden(values),
    );

    // String.prototype
    define_method(&string_proto, ctx, "charAt", js_string_char_at);
    define_method(&string_proto, ctx, "charCodeAt", js_string_char_code_at);
    define_method(&string_proto, ctx, "indexOf", js_string_index_of);
    define_method(&string_proto, ctx, "slice", js_string_slice);
    define_method(&string_proto, ctx, "split", js_string_split);
    let string_iter = native_function(ctx, "[Symbol.iterator]", js_string_values);
    string_proto.borrow_mut().properties.insert(
        PropertyKey::Symbol(ctx.symbol_iterator.id),
        Property::hidden(string_iter),
    );

    // Function.prototype
    let function_proto = ctx.function_prototype.clone();
    define_method(&function_proto, ctx, "call", js_function_call);
    define_method(&function_proto, ctx, "apply", js_function_apply);

    // RegExp.prototype
    define_method(&regexp_proto, ctx, "exec", js_regexp_exec);
    define_method(&regexp_proto, ctx, "test", js_regexp_test);

    // Generator protocol
    let generator_proto = ctx.generator_prototype.clone();
    define_method(&generator_proto, ctx, "next", js_generator_next);
    define_method(&generator_proto, ctx, "return", js_generator_return);
    let self_iter = native_function(ctx, "[Symbol.iterator]", js_generator_self);
    generator_proto.borrow_mut().properties.insert(
        PropertyKey::Symbol(ctx.symbol_iterator.id),
        Property::hidden(self_iter),
    );
}

fn js_generator_next(
    ctx: &mut Context,
    _func: &JsValue,
    this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    vm::execute_generator(ctx, this, arg(args, 0))
}

fn js_generator_return(
    ctx: &mut Context,
    _func: &JsValue,
    this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    vm::generator_return(ctx, this, arg(args, 0))
}

fn js_generator_self(
    _ctx: &mut Context,
    _func: &JsValue,
    this: &JsValue,
    _args: &[JsValue],
) -> Result<JsValue, JsError> {
    Ok(this.clone())
}

/// Installed as the default promise-reject callback: surfaces an awaited
/// rejection as a catchable pending exception
pub fn default_reject_callback(
    ctx: &mut Context,
    _func: &JsValue,
    _this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let reason = args.first().cloned().unwrap_or(JsValue::Undefined);
    ctx.pending_exception = Some(reason);
    Ok(JsValue::Undefined)
}

fn arg(args: &[JsValue], index: usize) -> JsValue {
    args.get(index).cloned().unwrap_or(JsValue::Undefined)
}

fn js_print(
    _ctx: &mut Context,
    _func: &JsValue,
    _this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let line: Vec<String> = args.iter().map(|v| v.to_js_string()).collect();
    println!("{}", line.join(" "));
    Ok(JsValue::Undefined)
}

fn js_queue_microtask(
    ctx: &mut Context,
    _func: &JsValue,
    _this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let callback = arg(args, 0);
    if !matches!(callback, JsValue::Object(ref o) if o.borrow().is_callable()) {
        return Err(JsError::type_error("queueMicrotask expects a function"));
    }
    ctx.enqueue_microtask(callback, Vec::new());
    Ok(JsValue::Undefined)
}

fn js_object_ctor(
    ctx: &mut Context,
    _func: &JsValue,
    _this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    match args.first() {
        Some(JsValue::Object(obj)) => Ok(JsValue::Object(obj.clone())),
        _ => Ok(JsValue::Object(JsObject::plain(Some(ctx.object_prototype.clone())))),
    }
}

fn js_array_ctor(
    ctx: &mut Context,
    _func: &JsValue,
    _this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    if args.len() == 1 {
        if let JsValue::Number(n) = args[0] {
            if n < 0.0 || n.fract() != 0.0 {
                return Err(JsError::range_error("invalid array length"));
            }
            return Ok(ctx.create_array_with_capacity(n as usize, n as usize));
        }
    }
    Ok(ctx.create_array(args.to_vec()))
}

fn js_string_ctor(
    _ctx: &mut Context,
    _func: &JsValue,
    _this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    Ok(JsValue::string(&arg(args, 0).to_js_string()))
}

fn js_number_ctor(
    _ctx: &mut Context,
    _func: &JsValue,
    _this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    Ok(JsValue::Number(arg(args, 0).to_number()))
}

fn js_boolean_ctor(
    _ctx: &mut Context,
    _func: &JsValue,
    _this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    Ok(JsValue::Bool(arg(args, 0).to_boolean()))
}

fn js_regexp_ctor(
    ctx: &mut Context,
    _func: &JsValue,
    _this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let pattern = arg(args, 0).to_js_string();
    let flags = match args.get(1) {
        Some(JsValue::Undefined) | None => String::new(),
        Some(other) => other.to_js_string(),
    };
    let bytecode = crate::regex::compile(&pattern, &flags)?;
    let engine = crate::regex::RegexEngine::new(bytecode);
    let obj = JsObject::new(
        ObjectKind::RegExp(Rc::new(engine)),
        Some(ctx.regexp_prototype.clone()),
    );
    obj.borrow_mut().properties.insert(
        PropertyKey::string("source"),
        Property::hidden(JsValue::string(&pattern)),
    );
    obj.borrow_mut().properties.insert(
        PropertyKey::string("flags"),
        Property::hidden(JsValue::string(&flags)),
    );
    obj.borrow_mut().properties.insert(
        PropertyKey::string("lastIndex"),
        Property::data(JsValue::Number(0.0)),
    );
    Ok(JsValue::Object(obj))
}

fn js_error_ctor(
    ctx: &mut Context,
    func: &JsValue,
    _this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let error_type = func
        .as_object()
        .and_then(|o| {
            o.borrow().function_data().and_then(|d| match d.builtin {
                Some(BuiltinCtor::Error(t)) => Some(t),
                _ => None,
            })
        })
        .unwrap_or(ErrorType::Error);
    let message = match args.first() {
        Some(JsValue::Undefined) | None => String::new(),
        Some(v) => v.to_js_string(),
    };
    Ok(ctx.create_error(error_type, &message))
}

fn new_promise(ctx: &Context, state: PromiseState) -> ObjectRef {
    JsObject::new(ObjectKind::Promise(state), Some(ctx.promise_prototype.clone()))
}

fn js_promise_ctor(
    ctx: &mut Context,
    _func: &JsValue,
    _this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let executor = arg(args, 0);
    let promise = new_promise(ctx, PromiseState::Pending);
    let value = JsValue::Object(promise.clone());
    if matches!(executor, JsValue::Object(ref o) if o.borrow().is_callable()) {
        let resolve = bound_native(ctx, "resolve", js_promise_settle_fulfil, vec![value.clone()]);
        let reject = bound_native(ctx, "reject", js_promise_settle_reject, vec![value.clone()]);
        vm::call_function(ctx, &executor, &JsValue::Undefined, &[resolve, reject])?;
    }
    Ok(value)
}

fn settle(func: &JsValue, settled: PromiseState) {
    let Some(func_obj) = func.as_object() else { return };
    let target = func_obj
        .borrow()
        .function_data()
        .and_then(|d| d.captured_values.first().cloned());
    if let Some(JsValue::Object(promise)) = target {
        let mut promise = promise.borrow_mut();
        if matches!(promise.kind, ObjectKind::Promise(PromiseState::Pending)) {
            promise.kind = ObjectKind::Promise(settled);
        }
    }
}

fn js_promise_settle_fulfil(
    _ctx: &mut Context,
    func: &JsValue,
    _this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    settle(func, PromiseState::Fulfilled(arg(args, 0)));
    Ok(JsValue::Undefined)
}

fn js_promise_settle_reject(
    _ctx: &mut Context,
    func: &JsValue,
    _this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    settle(func, PromiseState::Rejected(arg(args, 0)));
    Ok(JsValue::Undefined)
}

fn js_promise_resolve(
    ctx: &mut Context,
    _func: &JsValue,
    _this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let value = arg(args, 0);
    if let JsValue::Object(ref obj) = value {
        if matches!(obj.borrow().kind, ObjectKind::Promise(_)) {
            return Ok(value);
        }
    }
    Ok(JsValue::Object(new_promise(ctx, PromiseState::Fulfilled(value))))
}

fn js_promise_reject(
    ctx: &mut Context,
    _func: &JsValue,
    _this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    Ok(JsValue::Object(new_promise(ctx, PromiseState::Rejected(arg(args, 0)))))
}

fn js_proxy_ctor(
    _ctx: &mut Context,
    _func: &JsValue,
    _this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let (target, handler) = match (args.first(), args.get(1)) {
        (Some(JsValue::Object(t)), Some(JsValue::Object(h))) => (t.clone(), h.clone()),
        _ => return Err(JsError::type_error("Cannot create proxy with a non-object as target or handler")),
    };
    let proto = target.borrow().prototype.clone();
    Ok(JsValue::Object(JsObject::new(ObjectKind::Proxy { target, handler }, proto)))
}

fn js_math_floor(
    _ctx: &mut Context,
    _func: &JsValue,
    _this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    Ok(JsValue::Number(arg(args, 0).to_number().floor()))
}

fn js_math_abs(
    _ctx: &mut Context,
    _func: &JsValue,
    _this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    Ok(JsValue::Number(arg(args, 0).to_number().abs()))
}

fn js_math_max(
    _ctx: &mut Context,
    _func: &JsValue,
    _this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let mut best = f64::NEG_INFINITY;
    for a in args {
        let n = a.to_number();
        if n.is_nan() {
            return Ok(JsValue::Number(f64::NAN));
        }
        best = best.max(n);
    }
    Ok(JsValue::Number(best))
}

fn js_math_min(
    _ctx: &mut Context,
    _func: &JsValue,
    _this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let mut best = f64::INFINITY;
    for a in args {
        let n = a.to_number();
        if n.is_nan() {
            return Ok(JsValue::Number(f64::NAN));
        }
        best = best.min(n);
    }
    Ok(JsValue::Number(best))
}

fn this_array(this: &JsValue) -> Result<ObjectRef, JsError> {
    match this {
        JsValue::Object(obj) if matches!(obj.borrow().kind, ObjectKind::Array(_)) => {
            Ok(obj.clone())
        }
        _ => Err(JsError::type_error("receiver is not an array")),
    }
}

fn js_array_push(
    _ctx: &mut Context,
    _func: &JsValue,
    this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let arr = this_array(this)?;
    let mut arr = arr.borrow_mut();
    if let ObjectKind::Array(ref mut elements) = arr.kind {
        elements.extend_from_slice(args);
        Ok(JsValue::Number(elements.len() as f64))
    } else {
        unreachable!()
    }
}

fn js_array_pop(
    _ctx: &mut Context,
    _func: &JsValue,
    this: &JsValue,
    _args: &[JsValue],
) -> Result<JsValue, JsError> {
    let arr = this_array(this)?;
    let mut arr = arr.borrow_mut();
    if let ObjectKind::Array(ref mut elements) = arr.kind {
        Ok(elements.pop().unwrap_or(JsValue::Undefined))
    } else {
        unreachable!()
    }
}

fn js_array_map(
    ctx: &mut Context,
    _func: &JsValue,
    this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let arr = this_array(this)?;
    let callback = arg(args, 0);
    let elements = match arr.borrow().kind {
        ObjectKind::Array(ref elements) => elements.clone(),
        _ => unreachable!(),
    };
    let mut mapped = Vec::with_capacity(elements.len());
    for (index, element) in elements.into_iter().enumerate() {
        let result = vm::call_function(
            ctx,
            &callback,
            &JsValue::Undefined,
            &[element, JsValue::Number(index as f64), this.clone()],
        )?;
        mapped.push(result);
    }
    Ok(ctx.create_array(mapped))
}

fn js_array_for_each(
    ctx: &mut Context,
    _func: &JsValue,
    this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let arr = this_array(this)?;
    let callback = arg(args, 0);
    let elements = match arr.borrow().kind {
        ObjectKind::Array(ref elements) => elements.clone(),
        _ => unreachable!(),
    };
    for (index, element) in elements.into_iter().enumerate() {
        vm::call_function(
            ctx,
            &callback,
            &JsValue::Undefined,
            &[element, JsValue::Number(index as f64), this.clone()],
        )?;
    }
    Ok(JsValue::Undefined)
}

fn js_array_join(
    _ctx: &mut Context,
    _func: &JsValue,
    this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let arr = this_array(this)?;
    let separator = match args.first() {
        Some(JsValue::Undefined) | None => ",".to_string(),
        Some(v) => v.to_js_string(),
    };
    let arr = arr.borrow();
    if let ObjectKind::Array(ref elements) = arr.kind {
        let parts: Vec<String> = elements
            .iter()
            .map(|v| if v.is_nullish() { String::new() } else { v.to_js_string() })
            .collect();
        Ok(JsValue::string(&parts.join(&separator)))
    } else {
        unreachable!()
    }
}

/// Shared shape for array and string iterators: the iterator object holds
/// its target and cursor in hidden slots and a `next` method
fn make_iterator(ctx: &Context, target: JsValue, next: crate::value::NativeFn) -> JsValue {
    let iter = JsObject::plain(Some(ctx.object_prototype.clone()));
    iter.borrow_mut()
        .properties
        .insert(PropertyKey::string("__target"), Property::hidden(target));
    iter.borrow_mut().properties.insert(
        PropertyKey::string("__index"),
        Property::hidden(JsValue::Number(0.0)),
    );
    let next = native_function(ctx, "next", next);
    iter.borrow_mut()
        .properties
        .insert(PropertyKey::string("next"), Property::hidden(next));
    JsValue::Object(iter)
}

pub fn iteration_result(ctx: &Context, value: JsValue, done: bool) -> JsValue {
    let result = JsObject::plain(Some(ctx.object_prototype.clone()));
    result.borrow_mut().set_own(PropertyKey::string("value"), value);
    result
        .borrow_mut()
        .set_own(PropertyKey::string("done"), JsValue::Bool(done));
    JsValue::Object(result)
}

fn js_array_values(
    ctx: &mut Context,
    _func: &JsValue,
    this: &JsValue,
    _args: &[JsValue],
) -> Result<JsValue, JsError> {
    Ok(make_iterator(ctx, this.clone(), js_array_iterator_next))
}

fn js_array_iterator_next(
    ctx: &mut Context,
    _func: &JsValue,
    this: &JsValue,
    _args: &[JsValue],
) -> Result<JsValue, JsError> {
    let iter = this
        .as_object()
        .ok_or_else(|| JsError::type_error("iterator state missing"))?;
    let target = iter
        .borrow()
        .own_property(&PropertyKey::string("__target"))
        .map(|p| p.value)
        .unwrap_or(JsValue::Undefined);
    let index = iter
        .borrow()
        .own_property(&PropertyKey::string("__index"))
        .map(|p| p.value.to_number() as usize)
        .unwrap_or(0);

    let element = match target.as_object() {
        Some(obj) => match obj.borrow().kind {
            ObjectKind::Array(ref elements) => elements.get(index).cloned(),
            _ => None,
        },
        None => None,
    };
    match element {
        Some(value) => {
            iter.borrow_mut().set_own(
                PropertyKey::string("__index"),
                JsValue::Number((index + 1) as f64),
            );
            Ok(iteration_result(ctx, value, false))
        }
        None => Ok(iteration_result(ctx, JsValue::Undefined, true)),
    }
}

fn js_string_values(
    ctx: &mut Context,
    _func: &JsValue,
    this: &JsValue,
    _args: &[JsValue],
) -> Result<JsValue, JsError> {
    Ok(make_iterator(ctx, this.clone(), js_string_iterator_next))
}

fn js_string_iterator_next(
    ctx: &mut Context,
    _func: &JsValue,
    this: &JsValue,
    _args: &[JsValue],
) -> Result<JsValue, JsError> {
    let iter = this
        .as_object()
        .ok_or_else(|| JsError::type_error("iterator state missing"))?;
    let target = iter
        .borrow()
        .own_property(&PropertyKey::string("__target"))
        .map(|p| p.value)
        .unwrap_or(JsValue::Undefined);
    let index = iter
        .borrow()
        .own_property(&PropertyKey::string("__index"))
        .map(|p| p.value.to_number() as usize)
        .unwrap_or(0);

    let text = target.to_js_string();
    match text.chars().nth(index) {
        Some(c) => {
            iter.borrow_mut().set_own(
                PropertyKey::string("__index"),
                JsValue::Number((index + 1) as f64),
            );
            Ok(iteration_result(ctx, JsValue::string(&c.to_string()), false))
        }
        None => Ok(iteration_result(ctx, JsValue::Undefined, true)),
    }
}

fn this_string(this: &JsValue) -> String {
    match this {
        JsValue::Object(obj) => match obj.borrow().kind {
            ObjectKind::Boxed(ref inner) => inner.to_js_string(),
            _ => this.to_js_string(),
        },
        other => other.to_js_string(),
    }
}

fn js_string_char_at(
    _ctx: &mut Context,
    _func: &JsValue,
    this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let s = this_string(this);
    let index = arg(args, 0).to_number() as usize;
    Ok(JsValue::string(
        &s.chars().nth(index).map(|c| c.to_string()).unwrap_or_default(),
    ))
}

fn js_string_char_code_at(
    _ctx: &mut Context,
    _func: &JsValue,
    this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let s: Vec<u16> = this_string(this).encode_utf16().collect();
    let index = arg(args, 0).to_number() as usize;
    Ok(match s.get(index) {
        Some(&unit) => JsValue::Number(unit as f64),
        None => JsValue::Number(f64::NAN),
    })
}

fn js_string_index_of(
    _ctx: &mut Context,
    _func: &JsValue,
    this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let s = this_string(this);
    let needle = arg(args, 0).to_js_string();
    let found = s.find(&needle).map(|byte| s[..byte].chars().count() as f64);
    Ok(JsValue::Number(found.unwrap_or(-1.0)))
}

fn js_string_slice(
    _ctx: &mut Context,
    _func: &JsValue,
    this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let chars: Vec<char> = this_string(this).chars().collect();
    let len = chars.len() as f64;
    let clamp = |v: f64| -> usize {
        let v = if v < 0.0 { len + v } else { v };
        v.clamp(0.0, len) as usize
    };
    let start = clamp(arg(args, 0).to_number());
    let end = match args.get(1) {
        Some(JsValue::Undefined) | None => chars.len(),
        Some(v) => clamp(v.to_number()),
    };
    let out: String = if start < end { chars[start..end].iter().collect() } else { String::new() };
    Ok(JsValue::string(&out))
}

fn js_string_split(
    ctx: &mut Context,
    _func: &JsValue,
    this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let s = this_string(this);
    let parts: Vec<JsValue> = match args.first() {
        Some(JsValue::Undefined) | None => vec![JsValue::string(&s)],
        Some(sep) => {
            let sep = sep.to_js_string();
            if sep.is_empty() {
                s.chars().map(|c| JsValue::string(&c.to_string())).collect()
            } else {
                s.split(&sep as &str).map(JsValue::string).collect()
            }
        }
    };
    Ok(ctx.create_array(parts))
}

fn js_function_call(
    ctx: &mut Context,
    _func: &JsValue,
    this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let receiver = arg(args, 0);
    let rest = if args.len() > 1 { &args[1..] } else { &[] };
    vm::call_function(ctx, this, &receiver, rest)
}

fn js_function_apply(
    ctx: &mut Context,
    _func: &JsValue,
    this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let receiver = arg(args, 0);
    let spread = match args.get(1) {
        Some(JsValue::Object(obj)) => match obj.borrow().kind {
            ObjectKind::Array(ref elements) => elements.clone(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    vm::call_function(ctx, this, &receiver, &spread)
}

fn this_regexp(this: &JsValue) -> Result<Rc<crate::regex::RegexEngine>, JsError> {
    match this {
        JsValue::Object(obj) => match obj.borrow().kind {
            ObjectKind::RegExp(ref engine) => Ok(engine.clone()),
            _ => Err(JsError::type_error("receiver is not a RegExp")),
        },
        _ => Err(JsError::type_error("receiver is not a RegExp")),
    }
}

fn js_regexp_exec(
    ctx: &mut Context,
    _func: &JsValue,
    this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let engine = this_regexp(this)?;
    let input = arg(args, 0).to_js_string();
    match engine.exec(&input, 0) {
        None => Ok(JsValue::Null),
        Some(result) => {
            let captures: Vec<JsValue> = result
                .captures
                .iter()
                .map(|c| match c {
                    Some(s) => JsValue::string(s),
                    None => JsValue::Undefined,
                })
                .collect();
            let array = ctx.create_array(captures);
            if let JsValue::Object(ref obj) = array {
                obj.borrow_mut().set_own(
                    PropertyKey::string("index"),
                    JsValue::Number(result.start_index as f64),
                );
                obj.borrow_mut()
                    .set_own(PropertyKey::string("input"), JsValue::string(&input));
            }
            Ok(array)
        }
    }
}

fn js_regexp_test(
    _ctx: &mut Context,
    _func: &JsValue,
    this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let engine = this_regexp(this)?;
    Ok(JsValue::Bool(engine.test(&arg(args, 0).to_js_string())))
}
