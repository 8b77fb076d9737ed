// File: src/vm.rs
//
// Bytecode virtual machine for NanoJS.
// A stack interpreter over the Op set in bytecode.rs: closure capture via
// shared VarRef cells, exception unwinding through in-stack catch markers,
// generators with saved continuations, await with microtask draining, and
// proxy apply/construct trap dispatch.

use crate::builtins::iteration_result;
use crate::bytecode::{Bytecode, CaptureSource, Constant, FunctionTemplate, Op};
use crate::context::Context;
use crate::errors::{ErrorKind, JsError};
use crate::value::{
    lookup_property, Callable, ConstructorKind, ErrorType, FunctionData, JsObject, JsValue,
    ObjectKind, ObjectRef, PromiseState, Property, PropertyKey,
};
use std::cell::RefCell;
use std::rc::Rc;

/// A slot of the VM value stack: either an ordinary value or the typed
/// catch marker the unwinder searches for
pub enum StackValue {
    Value(JsValue),
    CatchOffset(usize),
}

/// Shared mutable closure cell. While attached, reads and writes go through
/// a frame's locals storage; close() freezes the current value into owned
/// storage so later writes to the frame slot no longer propagate.
#[derive(Clone)]
pub struct VarRef(Rc<RefCell<VarRefState>>);

enum VarRefState {
    Attached {
        storage: Rc<RefCell<Vec<JsValue>>>,
        index: usize,
    },
    Closed {
        value: JsValue,
    },
}

impl VarRef {
    pub fn attached(storage: Rc<RefCell<Vec<JsValue>>>, index: usize) -> Self {
        VarRef(Rc::new(RefCell::new(VarRefState::Attached { storage, index })))
    }

    pub fn get(&self) -> JsValue {
        match &*self.0.borrow() {
            VarRefState::Attached { storage, index } => storage.borrow()[*index].clone(),
            VarRefState::Closed { value } => value.clone(),
        }
    }

    pub fn set(&self, value: JsValue) {
        match &mut *self.0.borrow_mut() {
            VarRefState::Attached { storage, index } => storage.borrow_mut()[*index] = value,
            VarRefState::Closed { value: slot } => *slot = value,
        }
    }

    /// Idempotent: closing an already-closed cell keeps its frozen value
    pub fn close(&self) {
        let frozen = self.get();
        let mut state = self.0.borrow_mut();
        if matches!(*state, VarRefState::Attached { .. }) {
            *state = VarRefState::Closed { value: frozen };
        }
    }
}

/// Activation record for one bytecode function invocation
pub struct Frame {
    pub function: JsValue,
    pub this_arg: JsValue,
    /// Original arguments, addressed by the *_ARG opcodes
    pub args: Vec<JsValue>,
    /// Locals storage; shared so VarRefs can attach to slots
    pub locals: Rc<RefCell<Vec<JsValue>>>,
    /// One lazily created cell per captured local
    local_var_refs: Vec<Option<VarRef>>,
    /// Inherited closure cells
    pub var_refs: Vec<VarRef>,
    /// Value-based capture alternative
    pub captured_values: Vec<JsValue>,
}

impl Frame {
    fn new(
        function: JsValue,
        this_arg: JsValue,
        args: &[JsValue],
        template: &FunctionTemplate,
    ) -> Frame {
        let local_count = template.bytecode.local_count.max(template.param_count);
        let mut locals = vec![JsValue::Undefined; local_count];
        // Parameters occupy the first slots; the rest start undefined.
        // Surplus arguments stay reachable through the *_ARG opcodes only.
        for (slot, value) in
            locals.iter_mut().zip(args.iter()).take(template.param_count)
        {
            *slot = value.clone();
        }
        let (var_refs, captured_values) = match function.as_object() {
            Some(obj) => match obj.borrow().function_data() {
                Some(data) => (data.var_refs.clone(), data.captured_values.clone()),
                None => (Vec::new(), Vec::new()),
            },
            None => (Vec::new(), Vec::new()),
        };
        Frame {
            function,
            this_arg,
            args: args.to_vec(),
            local_var_refs: vec![None; local_count],
            locals: Rc::new(RefCell::new(locals)),
            var_refs,
            captured_values,
        }
    }

    pub fn get_or_create_local_var_ref(&mut self, index: usize) -> VarRef {
        if let Some(ref existing) = self.local_var_refs[index] {
            return existing.clone();
        }
        let cell = VarRef::attached(self.locals.clone(), index);
        self.local_var_refs[index] = Some(cell.clone());
        cell
    }

    /// CLOSE_LOC: freeze the captured cell and free the slot for the next
    /// iteration of an enclosing loop
    pub fn close_local(&mut self, index: usize) {
        if let Some(cell) = self.local_var_refs[index].take() {
            cell.close();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorStatus {
    SuspendedStart,
    SuspendedYield,
    Executing,
    Completed,
}

/// Resumable generator continuation: the frame, the stack segment above the
/// frame's saved stack top, and the program counter to continue from
pub struct GeneratorState {
    pub function: JsValue,
    pub this_arg: JsValue,
    pub args: Vec<JsValue>,
    pub status: GeneratorStatus,
    pub yield_count: u32,
    frame: Option<Frame>,
    saved_stack: Vec<StackValue>,
    resume_pc: usize,
}

impl GeneratorState {
    pub fn new(function: JsValue, this_arg: JsValue, args: Vec<JsValue>) -> Self {
        GeneratorState {
            function,
            this_arg,
            args,
            status: GeneratorStatus::SuspendedStart,
            yield_count: 0,
            frame: None,
            saved_stack: Vec::new(),
            resume_pc: 0,
        }
    }
}

enum FrameResult {
    Return(JsValue),
    Yield { value: JsValue, resume_pc: usize },
}

/// Convert a pending exception value into a host-facing error without
/// clearing it, so outer frames keep unwinding
fn pending_error(ctx: &Context) -> JsError {
    match ctx.pending_exception {
        Some(ref value) => value_to_error(value),
        None => JsError::internal("exception propagation without a pending exception"),
    }
}

/// An Error instance propagates structured; anything else stringifies
pub fn value_to_error(value: &JsValue) -> JsError {
    if let JsValue::Object(ref obj) = value {
        if let ObjectKind::Error(error_type) = obj.borrow().kind {
            let message = obj
                .borrow()
                .own_property(&PropertyKey::string("message"))
                .map(|p| p.value.to_js_string())
                .unwrap_or_default();
            let kind = match error_type {
                ErrorType::TypeError => ErrorKind::TypeError,
                ErrorType::RangeError => ErrorKind::RangeError,
                ErrorType::ReferenceError => ErrorKind::ReferenceError,
                ErrorType::SyntaxError => ErrorKind::SyntaxError,
                _ => ErrorKind::Uncaught,
            };
            return JsError::new(kind, message, crate::errors::SourceLocation::unknown());
        }
    }
    JsError::new(
        ErrorKind::Uncaught,
        value.to_js_string(),
        crate::errors::SourceLocation::unknown(),
    )
}

fn pop_value(ctx: &mut Context) -> Result<JsValue, JsError> {
    match ctx.stack.pop() {
        Some(StackValue::Value(v)) => Ok(v),
        Some(StackValue::CatchOffset(_)) => {
            Err(JsError::internal("catch marker where a value was expected"))
        }
        None => Err(JsError::internal("value stack underflow")),
    }
}

fn peek_value(ctx: &Context, depth: usize) -> Result<JsValue, JsError> {
    let len = ctx.stack.len();
    match ctx.stack.get(len.wrapping_sub(1 + depth)) {
        Some(StackValue::Value(v)) => Ok(v.clone()),
        _ => Err(JsError::internal("value stack underflow")),
    }
}

fn push(ctx: &mut Context, value: JsValue) {
    ctx.stack.push(StackValue::Value(value));
}

/// Entry point: run any callable to completion
pub fn execute(
    ctx: &mut Context,
    func: &JsValue,
    this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let Some(obj) = func.as_object() else {
        return Err(not_a_function_error(ctx, func));
    };

    // Proxy apply trap, or forward to the target
    let proxy_parts = match obj.borrow().kind {
        ObjectKind::Proxy { ref target, ref handler } => {
            Some((target.clone(), handler.clone()))
        }
        _ => None,
    };
    if let Some((target, handler)) = proxy_parts {
        let trap = handler
            .borrow()
            .own_property(&PropertyKey::string("apply"))
            .map(|p| p.value);
        match trap {
            Some(trap) if matches!(trap, JsValue::Object(ref t) if t.borrow().is_callable()) => {
                let args_array = ctx.create_array(args.to_vec());
                return execute(
                    ctx,
                    &trap,
                    &JsValue::Object(handler),
                    &[JsValue::Object(target), this.clone(), args_array],
                );
            }
            _ => return execute(ctx, &JsValue::Object(target), this, args),
        }
    }

    enum Plan {
        Native(crate::value::NativeFn),
        Bytecode {
            template: Rc<FunctionTemplate>,
            this_arg: JsValue,
        },
        Generator,
    }

    let plan = {
        let borrowed = obj.borrow();
        let Some(data) = borrowed.function_data() else {
            drop(borrowed);
            return Err(not_a_function_error(ctx, func));
        };
        match data.callable {
            Callable::Native(f) => Plan::Native(f),
            Callable::Bytecode(ref template) => {
                if data.is_generator {
                    Plan::Generator
                } else {
                    let this_arg = data.captured_this.clone().unwrap_or_else(|| this.clone());
                    Plan::Bytecode { template: template.clone(), this_arg }
                }
            }
        }
    };

    match plan {
        Plan::Native(f) => f(ctx, func, this, args),
        Plan::Generator => {
            let state = GeneratorState::new(func.clone(), this.clone(), args.to_vec());
            let gen = JsObject::new(
                ObjectKind::Generator(Box::new(state)),
                Some(ctx.generator_prototype.clone()),
            );
            Ok(JsValue::Object(gen))
        }
        Plan::Bytecode { template, this_arg } => {
            let is_async = template.is_async;
            let result = run_function(ctx, func.clone(), &template, this_arg, args);
            if !is_async {
                return result;
            }
            // Async call wrapper: box the outcome into a settled promise
            match result {
                Ok(value) => {
                    if let JsValue::Object(ref o) = value {
                        if matches!(o.borrow().kind, ObjectKind::Promise(_)) {
                            return Ok(value);
                        }
                    }
                    Ok(JsValue::Object(JsObject::new(
                        ObjectKind::Promise(PromiseState::Fulfilled(value)),
                        Some(ctx.promise_prototype.clone()),
                    )))
                }
                Err(err) => {
                    let reason = match ctx.pending_exception.take() {
                        Some(v) => v,
                        None => return Err(err),
                    };
                    Ok(JsValue::Object(JsObject::new(
                        ObjectKind::Promise(PromiseState::Rejected(reason)),
                        Some(ctx.promise_prototype.clone()),
                    )))
                }
            }
        }
    }
}

/// Alias used by natives that re-enter the VM
pub fn call_function(
    ctx: &mut Context,
    func: &JsValue,
    this: &JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    execute(ctx, func, this, args)
}

fn run_function(
    ctx: &mut Context,
    function: JsValue,
    template: &Rc<FunctionTemplate>,
    this_arg: JsValue,
    args: &[JsValue],
) -> Result<JsValue, JsError> {
    let bytecode = template.bytecode.clone();
    let mut frame = Frame::new(function, this_arg, args, template);
    let saved_stack_top = ctx.stack.len();
    let saved_strict = ctx.strict;
    ctx.strict = ctx.strict || bytecode.strict;

    let result = run_frame(ctx, &bytecode, &mut frame, 0, saved_stack_top);

    ctx.stack.truncate(saved_stack_top);
    ctx.strict = saved_strict;

    match result {
        Ok(FrameResult::Return(value)) => Ok(value),
        Ok(FrameResult::Yield { .. }) => {
            Err(JsError::internal("yield outside a generator frame"))
        }
        Err(err) => Err(err),
    }
}

/// Run a whole compiled program against the context's global scope
pub fn execute_program(ctx: &mut Context, bytecode: Rc<Bytecode>) -> Result<JsValue, JsError> {
    let template = Rc::new(FunctionTemplate {
        name: "<main>".to_string(),
        bytecode,
        param_count: 0,
        is_generator: false,
        is_async: false,
        is_arrow: false,
        is_method: false,
        is_derived_ctor: false,
        captures: Vec::new(),
    });
    let data = FunctionData {
        name: "<main>".to_string(),
        callable: Callable::Bytecode(template.clone()),
        var_refs: Vec::new(),
        captured_values: Vec::new(),
        captured_this: None,
        is_generator: false,
        is_async: false,
        constructor_kind: ConstructorKind::None,
        home_object: None,
        builtin: None,
    };
    let func = JsValue::Object(JsObject::new(
        ObjectKind::Function(Box::new(data)),
        Some(ctx.function_prototype.clone()),
    ));
    let this = JsValue::Object(ctx.global.clone());
    let result = run_function(ctx, func, &template, this, &[]);
    if result.is_err() {
        ctx.pending_exception = None;
    }
    result
}

/// Resume (or start) a generator with a sent value; returns an iteration
/// result object
pub fn execute_generator(
    ctx: &mut Context,
    gen: &JsValue,
    sent: JsValue,
) -> Result<JsValue, JsError> {
    let Some(gen_obj) = gen.as_object() else {
        return Err(JsError::type_error("next called on a non-generator"));
    };

    // Take the state out while the body runs
    let mut state = {
        let mut borrowed = gen_obj.borrow_mut();
        match borrowed.kind {
            ObjectKind::Generator(ref mut boxed) => {
                let placeholder = GeneratorState::new(
                    JsValue::Undefined,
                    JsValue::Undefined,
                    Vec::new(),
                );
                std::mem::replace(&mut **boxed, placeholder)
            }
            _ => return Err(JsError::type_error("next called on a non-generator")),
        }
    };

    let outcome = match state.status {
        GeneratorStatus::Completed => Ok(iteration_result(ctx, JsValue::Undefined, true)),
        GeneratorStatus::Executing => {
            Err(JsError::type_error("generator is already running"))
        }
        GeneratorStatus::SuspendedStart | GeneratorStatus::SuspendedYield => {
            let starting = state.status == GeneratorStatus::SuspendedStart;
            state.status = GeneratorStatus::Executing;

            let Some(template) = generator_template(&state.function) else {
                state.status = GeneratorStatus::Completed;
                if let ObjectKind::Generator(ref mut boxed) = gen_obj.borrow_mut().kind {
                    **boxed = state;
                }
                return Err(JsError::internal("generator without a bytecode template"));
            };
            let bytecode = template.bytecode.clone();
            let saved_stack_top = ctx.stack.len();
            let saved_strict = ctx.strict;
            ctx.strict = ctx.strict || bytecode.strict;

            let (mut frame, resume_pc) = if starting {
                (
                    Frame::new(
                        state.function.clone(),
                        state.this_arg.clone(),
                        &state.args.clone(),
                        &template,
                    ),
                    0,
                )
            } else {
                let frame = state.frame.take().expect("suspended generator keeps its frame");
                ctx.stack.append(&mut state.saved_stack);
                if !starting {
                    push(ctx, sent.clone());
                }
                (frame, state.resume_pc)
            };

            let result = run_frame(ctx, &bytecode, &mut frame, resume_pc, saved_stack_top);
            ctx.strict = saved_strict;

            match result {
                Ok(FrameResult::Yield { value, resume_pc }) => {
                    state.status = GeneratorStatus::SuspendedYield;
                    state.yield_count += 1;
                    state.saved_stack = ctx.stack.split_off(saved_stack_top);
                    state.frame = Some(frame);
                    state.resume_pc = resume_pc;
                    Ok(iteration_result(ctx, value, false))
                }
                Ok(FrameResult::Return(value)) => {
                    state.status = GeneratorStatus::Completed;
                    ctx.stack.truncate(saved_stack_top);
                    Ok(iteration_result(ctx, value, true))
                }
                Err(err) => {
                    state.status = GeneratorStatus::Completed;
                    ctx.stack.truncate(saved_stack_top);
                    Err(err)
                }
            }
        }
    };

    if let ObjectKind::Generator(ref mut boxed) = gen_obj.borrow_mut().kind {
        **boxed = state;
    }
    outcome
}

pub fn generator_return(
    ctx: &mut Context,
    gen: &JsValue,
    value: JsValue,
) -> Result<JsValue, JsError> {
    if let Some(gen_obj) = gen.as_object() {
        if let ObjectKind::Generator(ref mut state) = gen_obj.borrow_mut().kind {
            state.status = GeneratorStatus::Completed;
            state.frame = None;
            state.saved_stack.clear();
        }
    }
    Ok(iteration_result(ctx, value, true))
}

fn generator_template(func: &JsValue) -> Option<Rc<FunctionTemplate>> {
    let obj = func.as_object()?;
    let borrowed = obj.borrow();
    let data = borrowed.function_data()?;
    match data.callable {
        Callable::Bytecode(ref template) => Some(template.clone()),
        Callable::Native(_) => None,
    }
}

/// Construct an instance: proxy construct trap, builtin factory, or an
/// ordinary [[Construct]] over a bytecode function
pub fn construct(ctx: &mut Context, ctor: &JsValue, args: &[JsValue]) -> Result<JsValue, JsError> {
    let Some(obj) = ctor.as_object() else {
        ctx.throw_type_error(&format!("{} is not a constructor", ctor.to_js_string()));
        return Err(pending_error(ctx));
    };

    let proxy_parts = match obj.borrow().kind {
        ObjectKind::Proxy { ref target, ref handler } => {
            Some((target.clone(), handler.clone()))
        }
        _ => None,
    };
    if let Some((target, handler)) = proxy_parts {
        let trap = handler
            .borrow()
            .own_property(&PropertyKey::string("construct"))
            .map(|p| p.value);
        match trap {
            Some(trap) if matches!(trap, JsValue::Object(ref t) if t.borrow().is_callable()) => {
                let args_array = ctx.create_array(args.to_vec());
                let result = execute(
                    ctx,
                    &trap,
                    &JsValue::Object(handler),
                    &[JsValue::Object(target), args_array],
                )?;
                if result.as_object().is_none() {
                    ctx.throw_type_error("proxy construct trap must return an object");
                    return Err(pending_error(ctx));
                }
                return Ok(result);
            }
            _ => return construct(ctx, &JsValue::Object(target), args),
        }
    }

    let (builtin, constructible, is_bytecode) = {
        let borrowed = obj.borrow();
        match borrowed.function_data() {
            Some(data) => (
                data.builtin,
                data.constructor_kind != ConstructorKind::None,
                matches!(data.callable, Callable::Bytecode(_)),
            ),
            None => {
                drop(borrowed);
                ctx.throw_type_error(&format!("{} is not a constructor", ctor.to_js_string()));
                return Err(pending_error(ctx));
            }
        }
    };

    if builtin.is_some() {
        // Built-in factories produce the instance themselves
        return execute(ctx, ctor, &JsValue::Undefined, args);
    }
    if !constructible || !is_bytecode {
        let name = obj
            .borrow()
            .function_data()
            .map(|d| d.name.clone())
            .unwrap_or_default();
        ctx.throw_type_error(&format!("{} is not a constructor", name));
        return Err(pending_error(ctx));
    }

    let proto = match lookup_property(obj, &PropertyKey::string("prototype")) {
        Some(p) => match p.value {
            JsValue::Object(proto) => proto,
            _ => ctx.object_prototype.clone(),
        },
        None => ctx.object_prototype.clone(),
    };
    let instance = JsObject::plain(Some(proto));
    let result = execute(ctx, ctor, &JsValue::Object(instance.clone()), args)?;
    // An explicitly returned object wins over the fresh instance
    Ok(match result {
        JsValue::Object(returned) => JsValue::Object(returned),
        _ => JsValue::Object(instance),
    })
}

fn not_a_function_error(ctx: &mut Context, callee: &JsValue) -> JsError {
    let description = if ctx.prop_chain.is_empty() {
        callee.to_js_string()
    } else {
        ctx.prop_chain.clone()
    };
    ctx.prop_chain.clear();
    ctx.prop_chain_lock = false;
    ctx.throw_type_error(&format!("{} is not a function", description));
    pending_error(ctx)
}

// === The interpreter ===

fn run_frame(
    ctx: &mut Context,
    bytecode: &Rc<Bytecode>,
    frame: &mut Frame,
    start_pc: usize,
    saved_stack_top: usize,
) -> Result<FrameResult, JsError> {
    let mut pc = start_pc;

    loop {
        // The unwinder runs before the next fetch whenever an exception is
        // pending: pop to the nearest catch marker or give up the frame
        if ctx.pending_exception.is_some() {
            loop {
                if ctx.stack.len() <= saved_stack_top {
                    return Err(pending_error(ctx));
                }
                match ctx.stack.pop().unwrap() {
                    StackValue::CatchOffset(target) => {
                        let exception = ctx.pending_exception.take().unwrap();
                        push(ctx, exception);
                        pc = target;
                        break;
                    }
                    StackValue::Value(_) => {}
                }
            }
            continue;
        }

        if pc >= bytecode.instructions.len() {
            return Ok(FrameResult::Return(JsValue::Undefined));
        }
        let op = Op::from_u8(bytecode.instructions[pc])
            .ok_or_else(|| JsError::internal(format!("invalid opcode {}", bytecode.instructions[pc])))?;
        if ctx.trace {
            eprintln!("[vm] {:5} {:?} depth={}", pc, op, ctx.stack.len());
        }
        let operand_at = pc + 1;
        pc += op.size();

        match op {
            // === Push / literals ===
            Op::PushI32 => push(ctx, JsValue::Number(bytecode.read_i32(operand_at) as f64)),
            Op::PushI8 => push(ctx, JsValue::Number(bytecode.read_i8(operand_at) as f64)),
            Op::PushI16 => push(ctx, JsValue::Number(bytecode.read_i16(operand_at) as f64)),
            Op::PushBigIntI32 => {
                push(ctx, JsValue::BigInt(bytecode.read_i32(operand_at) as i128))
            }
            Op::PushConst => {
                let value = constant_to_value(ctx, bytecode, bytecode.read_u16(operand_at))?;
                push(ctx, value);
            }
            Op::PushAtomValue => {
                let atom = bytecode.atom_str(bytecode.read_u16(operand_at)).to_string();
                push(ctx, JsValue::string(&atom));
            }
            Op::Undefined => push(ctx, JsValue::Undefined),
            Op::Null => push(ctx, JsValue::Null),
            Op::PushThis => push(ctx, frame.this_arg.clone()),
            Op::PushTrue => push(ctx, JsValue::Bool(true)),
            Op::PushFalse => push(ctx, JsValue::Bool(false)),
            Op::Object => {
                let obj = JsValue::Object(JsObject::plain(Some(ctx.object_prototype.clone())));
                push(ctx, obj);
            }
            Op::ArrayNew => {
                let arr = ctx.create_array(Vec::new());
                push(ctx, arr);
            }
            Op::PushEmptyString => push(ctx, JsValue::string("")),
            Op::PushMinus1 => push(ctx, JsValue::Number(-1.0)),
            Op::Push0 => push(ctx, JsValue::Number(0.0)),
            Op::Push1 => push(ctx, JsValue::Number(1.0)),
            Op::Push2 => push(ctx, JsValue::Number(2.0)),
            Op::Push3 => push(ctx, JsValue::Number(3.0)),
            Op::Push4 => push(ctx, JsValue::Number(4.0)),
            Op::Push5 => push(ctx, JsValue::Number(5.0)),
            Op::Push6 => push(ctx, JsValue::Number(6.0)),
            Op::Push7 => push(ctx, JsValue::Number(7.0)),

            // === Stack manipulation ===
            Op::Drop => {
                // Admits catch markers: Drop also discards an unused handler
                ctx.stack.pop();
            }
            Op::Nip => {
                let top = pop_value(ctx)?;
                pop_value(ctx)?;
                push(ctx, top);
            }
            Op::Nip1 => {
                let c = pop_value(ctx)?;
                let b = pop_value(ctx)?;
                pop_value(ctx)?;
                push(ctx, b);
                push(ctx, c);
            }
            Op::Dup => {
                let top = peek_value(ctx, 0)?;
                push(ctx, top);
            }
            Op::Dup1 => {
                let b = pop_value(ctx)?;
                let a = pop_value(ctx)?;
                push(ctx, a.clone());
                push(ctx, a);
                push(ctx, b);
            }
            Op::Dup2 => {
                let b = peek_value(ctx, 0)?;
                let a = peek_value(ctx, 1)?;
                push(ctx, a);
                push(ctx, b);
            }
            Op::Dup3 => {
                let c = peek_value(ctx, 0)?;
                let b = peek_value(ctx, 1)?;
                let a = peek_value(ctx, 2)?;
                push(ctx, a);
                push(ctx, b);
                push(ctx, c);
            }
            Op::Insert2 => {
                let b = pop_value(ctx)?;
                let a = pop_value(ctx)?;
                push(ctx, b.clone());
                push(ctx, a);
                push(ctx, b);
            }
            Op::Insert3 => {
                let c = pop_value(ctx)?;
                let b = pop_value(ctx)?;
                let a = pop_value(ctx)?;
                push(ctx, c.clone());
                push(ctx, a);
                push(ctx, b);
                push(ctx, c);
            }
            Op::Insert4 => {
                let d = pop_value(ctx)?;
                let c = pop_value(ctx)?;
                let b = pop_value(ctx)?;
                let a = pop_value(ctx)?;
                push(ctx, d.clone());
                push(ctx, a);
                push(ctx, b);
                push(ctx, c);
                push(ctx, d);
            }
            Op::Perm3 => {
                let c = pop_value(ctx)?;
                let b = pop_value(ctx)?;
                let a = pop_value(ctx)?;
                push(ctx, b);
                push(ctx, a);
                push(ctx, c);
            }
            Op::Perm4 => {
                let d = pop_value(ctx)?;
                let c = pop_value(ctx)?;
                let b = pop_value(ctx)?;
                let a = pop_value(ctx)?;
                push(ctx, b);
                push(ctx, a);
                push(ctx, c);
                push(ctx, d);
            }
            Op::Perm5 => {
                let e = pop_value(ctx)?;
                let d = pop_value(ctx)?;
                let c = pop_value(ctx)?;
                let b = pop_value(ctx)?;
                let a = pop_value(ctx)?;
                push(ctx, b);
                push(ctx, a);
                push(ctx, c);
                push(ctx, d);
                push(ctx, e);
            }
            Op::Swap => {
                let b = pop_value(ctx)?;
                let a = pop_value(ctx)?;
                push(ctx, b);
                push(ctx, a);
                // Argument evaluation after a method-call swap must not
                // overwrite the recorded callee chain
                ctx.prop_chain_lock = true;
            }
            Op::Swap2 => {
                let d = pop_value(ctx)?;
                let c = pop_value(ctx)?;
                let b = pop_value(ctx)?;
                let a = pop_value(ctx)?;
                push(ctx, c);
                push(ctx, d);
                push(ctx, a);
                push(ctx, b);
            }
            Op::Rot3L => {
                let c = pop_value(ctx)?;
                let b = pop_value(ctx)?;
                let a = pop_value(ctx)?;
                push(ctx, b);
                push(ctx, c);
                push(ctx, a);
            }
            Op::Rot3R => {
                let c = pop_value(ctx)?;
                let b = pop_value(ctx)?;
                let a = pop_value(ctx)?;
                push(ctx, c);
                push(ctx, a);
                push(ctx, b);
            }
            Op::Rot4L => {
                let d = pop_value(ctx)?;
                let c = pop_value(ctx)?;
                let b = pop_value(ctx)?;
                let a = pop_value(ctx)?;
                push(ctx, b);
                push(ctx, c);
                push(ctx, d);
                push(ctx, a);
            }
            Op::Rot5L => {
                let e = pop_value(ctx)?;
                let d = pop_value(ctx)?;
                let c = pop_value(ctx)?;
                let b = pop_value(ctx)?;
                let a = pop_value(ctx)?;
                push(ctx, b);
                push(ctx, c);
                push(ctx, d);
                push(ctx, e);
                push(ctx, a);
            }

            // === Variable access ===
            Op::GetVar => {
                let name = bytecode.atom_str(bytecode.read_u16(operand_at)).to_string();
                if !ctx.prop_chain_lock {
                    ctx.prop_chain = name.clone();
                }
                let global = ctx.global.clone();
                match lookup_property(&global, &PropertyKey::string(&name)) {
                    Some(prop) => {
                        let receiver = JsValue::Object(global);
                        let value = property_value(ctx, &receiver, &prop)?;
                        push(ctx, value);
                    }
                    None => {
                        let err = ctx.unresolved_reference(&name);
                        let error_value =
                            ctx.create_error(ErrorType::ReferenceError, &err.message);
                        ctx.pending_exception = Some(error_value);
                        push(ctx, JsValue::Undefined);
                    }
                }
            }
            Op::GetVarUndef => {
                let name = bytecode.atom_str(bytecode.read_u16(operand_at)).to_string();
                let value = lookup_property(&ctx.global.clone(), &PropertyKey::string(&name))
                    .map(|p| p.value)
                    .unwrap_or(JsValue::Undefined);
                push(ctx, value);
            }
            Op::PutVar => {
                let name = bytecode.atom_str(bytecode.read_u16(operand_at)).to_string();
                let value = pop_value(ctx)?;
                let declared = crate::value::has_property(
                    &ctx.global.clone(),
                    &PropertyKey::string(&name),
                );
                if ctx.strict && !declared {
                    let err = ctx.unresolved_reference(&name);
                    let error_value = ctx.create_error(ErrorType::ReferenceError, &err.message);
                    ctx.pending_exception = Some(error_value);
                } else {
                    ctx.global.clone().borrow_mut().set_own(PropertyKey::string(&name), value);
                }
            }
            Op::SetVar => {
                let name = bytecode.atom_str(bytecode.read_u16(operand_at)).to_string();
                let value = pop_value(ctx)?;
                ctx.global.clone().borrow_mut().set_own(PropertyKey::string(&name), value);
            }

            Op::GetLoc | Op::GetLoc0 | Op::GetLoc1 | Op::GetLoc2 | Op::GetLoc3 => {
                let slot = match op {
                    Op::GetLoc => bytecode.read_u16(operand_at) as usize,
                    Op::GetLoc0 => 0,
                    Op::GetLoc1 => 1,
                    Op::GetLoc2 => 2,
                    _ => 3,
                };
                let value = frame.locals.borrow()[slot].clone();
                push(ctx, value);
            }
            Op::PutLoc | Op::PutLoc0 | Op::PutLoc1 | Op::PutLoc2 | Op::PutLoc3 => {
                let slot = match op {
                    Op::PutLoc => bytecode.read_u16(operand_at) as usize,
                    Op::PutLoc0 => 0,
                    Op::PutLoc1 => 1,
                    Op::PutLoc2 => 2,
                    _ => 3,
                };
                let value = pop_value(ctx)?;
                frame.locals.borrow_mut()[slot] = value;
            }
            Op::SetLoc | Op::SetLoc0 | Op::SetLoc1 | Op::SetLoc2 | Op::SetLoc3 => {
                let slot = match op {
                    Op::SetLoc => bytecode.read_u16(operand_at) as usize,
                    Op::SetLoc0 => 0,
                    Op::SetLoc1 => 1,
                    Op::SetLoc2 => 2,
                    _ => 3,
                };
                let value = peek_value(ctx, 0)?;
                frame.locals.borrow_mut()[slot] = value;
            }
            Op::GetLocCheck => {
                let slot = bytecode.read_u16(operand_at) as usize;
                let value = frame.locals.borrow()[slot].clone();
                if matches!(value, JsValue::Uninitialized) {
                    tdz_error(ctx, bytecode, slot);
                    push(ctx, JsValue::Undefined);
                } else {
                    push(ctx, value);
                }
            }
            Op::PutLocCheck => {
                let slot = bytecode.read_u16(operand_at) as usize;
                let value = pop_value(ctx)?;
                let current = frame.locals.borrow()[slot].clone();
                if matches!(current, JsValue::Uninitialized) {
                    tdz_error(ctx, bytecode, slot);
                } else {
                    frame.locals.borrow_mut()[slot] = value;
                }
            }
            Op::SetLocUninitialized => {
                let slot = bytecode.read_u16(operand_at) as usize;
                frame.locals.borrow_mut()[slot] = JsValue::Uninitialized;
            }
            Op::CloseLoc => {
                let slot = bytecode.read_u16(operand_at) as usize;
                frame.close_local(slot);
            }

            Op::GetArg | Op::GetArg0 | Op::GetArg1 | Op::GetArg2 | Op::GetArg3 => {
                let index = match op {
                    Op::GetArg => bytecode.read_u16(operand_at) as usize,
                    Op::GetArg0 => 0,
                    Op::GetArg1 => 1,
                    Op::GetArg2 => 2,
                    _ => 3,
                };
                push(ctx, frame.args.get(index).cloned().unwrap_or(JsValue::Undefined));
            }
            Op::PutArg => {
                let index = bytecode.read_u16(operand_at) as usize;
                let value = pop_value(ctx)?;
                if index < frame.args.len() {
                    frame.args[index] = value;
                }
            }
            Op::SetArg => {
                let index = bytecode.read_u16(operand_at) as usize;
                let value = peek_value(ctx, 0)?;
                if index < frame.args.len() {
                    frame.args[index] = value;
                }
            }

            Op::GetVarRef | Op::GetVarRef0 | Op::GetVarRef1 | Op::GetVarRef2
            | Op::GetVarRef3 => {
                let slot = match op {
                    Op::GetVarRef => bytecode.read_u16(operand_at) as usize,
                    Op::GetVarRef0 => 0,
                    Op::GetVarRef1 => 1,
                    Op::GetVarRef2 => 2,
                    _ => 3,
                };
                let value = if slot < frame.var_refs.len() {
                    frame.var_refs[slot].get()
                } else {
                    frame
                        .captured_values
                        .get(slot)
                        .cloned()
                        .unwrap_or(JsValue::Undefined)
                };
                push(ctx, value);
            }
            Op::PutVarRef => {
                let slot = bytecode.read_u16(operand_at) as usize;
                let value = pop_value(ctx)?;
                if slot < frame.var_refs.len() {
                    frame.var_refs[slot].set(value);
                } else {
                    return Err(JsError::internal("write to a value-captured slot"));
                }
            }
            Op::SetVarRef => {
                let slot = bytecode.read_u16(operand_at) as usize;
                let value = peek_value(ctx, 0)?;
                if slot < frame.var_refs.len() {
                    frame.var_refs[slot].set(value);
                } else {
                    return Err(JsError::internal("write to a value-captured slot"));
                }
            }
            Op::GetVarRefCheck => {
                let slot = bytecode.read_u16(operand_at) as usize;
                let value = if slot < frame.var_refs.len() {
                    frame.var_refs[slot].get()
                } else {
                    JsValue::Undefined
                };
                if matches!(value, JsValue::Uninitialized) {
                    let error_value = ctx.create_error(
                        ErrorType::ReferenceError,
                        "cannot access a binding before initialization",
                    );
                    ctx.pending_exception = Some(error_value);
                    push(ctx, JsValue::Undefined);
                } else {
                    push(ctx, value);
                }
            }
            Op::PutVarRefCheck => {
                let slot = bytecode.read_u16(operand_at) as usize;
                let value = pop_value(ctx)?;
                let current = if slot < frame.var_refs.len() {
                    frame.var_refs[slot].get()
                } else {
                    JsValue::Undefined
                };
                if matches!(current, JsValue::Uninitialized) {
                    let error_value = ctx.create_error(
                        ErrorType::ReferenceError,
                        "cannot access a binding before initialization",
                    );
                    ctx.pending_exception = Some(error_value);
                } else if slot < frame.var_refs.len() {
                    frame.var_refs[slot].set(value);
                }
            }

            // === Property access ===
            Op::GetField | Op::GetField2 => {
                let name = bytecode.atom_str(bytecode.read_u16(operand_at)).to_string();
                let keep = op == Op::GetField2;
                let obj = if keep { peek_value(ctx, 0)? } else { pop_value(ctx)? };
                if !ctx.prop_chain_lock {
                    if ctx.prop_chain.is_empty() {
                        ctx.prop_chain = name.clone();
                    } else {
                        ctx.prop_chain.push('.');
                        ctx.prop_chain.push_str(&name);
                    }
                }
                let value = get_member(ctx, &obj, &PropertyKey::string(&name))?;
                push(ctx, value);
            }
            Op::GetArrayEl | Op::GetArrayEl2 => {
                let key_value = pop_value(ctx)?;
                let keep = op == Op::GetArrayEl2;
                let obj = if keep { peek_value(ctx, 0)? } else { pop_value(ctx)? };
                let key = PropertyKey::from_value(&key_value);
                if !ctx.prop_chain_lock {
                    let rendered = match key_value {
                        JsValue::Symbol(ref sym) => format!(
                            "[Symbol({})]",
                            sym.description.as_deref().unwrap_or("")
                        ),
                        ref other => format!(".{}", other.to_js_string()),
                    };
                    if ctx.prop_chain.is_empty() {
                        ctx.prop_chain = rendered.trim_start_matches('.').to_string();
                    } else {
                        ctx.prop_chain.push_str(&rendered);
                    }
                }
                let value = get_member(ctx, &obj, &key)?;
                push(ctx, value);
            }
            Op::PutField => {
                let name = bytecode.atom_str(bytecode.read_u16(operand_at)).to_string();
                let value = pop_value(ctx)?;
                let obj = pop_value(ctx)?;
                set_member(ctx, &obj, PropertyKey::string(&name), value)?;
            }
            Op::PutArrayEl => {
                let value = pop_value(ctx)?;
                let key_value = pop_value(ctx)?;
                let obj = pop_value(ctx)?;
                set_member(ctx, &obj, PropertyKey::from_value(&key_value), value)?;
            }
            Op::DefineField => {
                let name = bytecode.atom_str(bytecode.read_u16(operand_at)).to_string();
                let value = pop_value(ctx)?;
                let obj = peek_value(ctx, 0)?;
                if let JsValue::Object(ref target) = obj {
                    target.borrow_mut().set_own(PropertyKey::string(&name), value);
                }
            }
            Op::DefineProp => {
                let value = pop_value(ctx)?;
                let key_value = pop_value(ctx)?;
                let obj = peek_value(ctx, 0)?;
                if let JsValue::Object(ref target) = obj {
                    target
                        .borrow_mut()
                        .set_own(PropertyKey::from_value(&key_value), value);
                }
            }
            Op::DefineMethod | Op::DefineGetter | Op::DefineSetter => {
                let name = bytecode.atom_str(bytecode.read_u16(operand_at)).to_string();
                let func = pop_value(ctx)?;
                let obj = peek_value(ctx, 0)?;
                define_class_member(&obj, PropertyKey::string(&name), func, op)?;
            }
            Op::DefineMethodComputed => {
                let func = pop_value(ctx)?;
                let key_value = pop_value(ctx)?;
                let obj = peek_value(ctx, 0)?;
                define_class_member(
                    &obj,
                    PropertyKey::from_value(&key_value),
                    func,
                    Op::DefineMethod,
                )?;
            }
            Op::Append => {
                let value = pop_value(ctx)?;
                let arr = peek_value(ctx, 0)?;
                if let JsValue::Object(ref target) = arr {
                    if let ObjectKind::Array(ref mut elements) = target.borrow_mut().kind {
                        elements.push(value);
                    }
                }
            }
            Op::AppendSpread => {
                let iterable = pop_value(ctx)?;
                let arr = peek_value(ctx, 0)?;
                let items = collect_iterable(ctx, &iterable)?;
                if let JsValue::Object(ref target) = arr {
                    if let ObjectKind::Array(ref mut elements) = target.borrow_mut().kind {
                        elements.extend(items);
                    }
                }
            }
            Op::CopyDataProperties => {
                let source = pop_value(ctx)?;
                let target = peek_value(ctx, 0)?;
                if let (JsValue::Object(ref target), JsValue::Object(ref source)) =
                    (&target, &source)
                {
                    let copies: Vec<(PropertyKey, JsValue)> = {
                        let source = source.borrow();
                        let mut copies = Vec::new();
                        if let ObjectKind::Array(ref elements) = source.kind {
                            for (i, v) in elements.iter().enumerate() {
                                copies.push((PropertyKey::string(&i.to_string()), v.clone()));
                            }
                        }
                        for (key, prop) in source.properties.iter() {
                            if prop.enumerable {
                                copies.push((key.clone(), prop.value.clone()));
                            }
                        }
                        copies
                    };
                    let mut target = target.borrow_mut();
                    for (key, value) in copies {
                        target.set_own(key, value);
                    }
                }
            }
            Op::SetProto => {
                let proto = pop_value(ctx)?;
                let obj = peek_value(ctx, 0)?;
                if let JsValue::Object(ref target) = obj {
                    target.borrow_mut().prototype = match proto {
                        JsValue::Object(p) => Some(p),
                        _ => None,
                    };
                }
            }
            Op::PushSuperCtor => {
                let parent = frame
                    .function
                    .as_object()
                    .and_then(|o| o.borrow().prototype.clone());
                match parent {
                    Some(parent) => push(ctx, JsValue::Object(parent)),
                    None => push(ctx, JsValue::Undefined),
                }
            }
            Op::PushHomeProto => {
                let home = frame.function.as_object().and_then(|o| {
                    o.borrow().function_data().and_then(|d| d.home_object.clone())
                });
                let proto = home.and_then(|h| h.borrow().prototype.clone());
                match proto {
                    Some(proto) => push(ctx, JsValue::Object(proto)),
                    None => push(ctx, JsValue::Undefined),
                }
            }

            // === Arithmetic / comparison / logic ===
            Op::Add => {
                let b = pop_value(ctx)?;
                let a = pop_value(ctx)?;
                match js_add(&a, &b) {
                    Ok(v) => push(ctx, v),
                    Err(msg) => {
                        ctx.throw_type_error(&msg);
                        push(ctx, JsValue::Undefined);
                    }
                }
            }
            Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::Exp => {
                let b = pop_value(ctx)?;
                let a = pop_value(ctx)?;
                match js_numeric_binop(op, &a, &b) {
                    Ok(v) => push(ctx, v),
                    Err(err) => {
                        let error_value = match err.kind {
                            ErrorKind::RangeError => {
                                ctx.create_error(ErrorType::RangeError, &err.message)
                            }
                            _ => ctx.create_error(ErrorType::TypeError, &err.message),
                        };
                        ctx.pending_exception = Some(error_value);
                        push(ctx, JsValue::Undefined);
                    }
                }
            }
            Op::Plus => {
                let v = pop_value(ctx)?;
                if matches!(v, JsValue::BigInt(_)) {
                    ctx.throw_type_error("cannot convert a BigInt to a number");
                    push(ctx, JsValue::Undefined);
                } else {
                    push(ctx, JsValue::Number(v.to_number()));
                }
            }
            Op::Neg => {
                let v = pop_value(ctx)?;
                match v {
                    JsValue::BigInt(n) => push(ctx, JsValue::BigInt(-n)),
                    other => push(ctx, JsValue::Number(-other.to_number())),
                }
            }
            Op::Inc => {
                let v = pop_value(ctx)?;
                match v {
                    JsValue::BigInt(n) => push(ctx, JsValue::BigInt(n + 1)),
                    other => push(ctx, JsValue::Number(other.to_number() + 1.0)),
                }
            }
            Op::Dec => {
                let v = pop_value(ctx)?;
                match v {
                    JsValue::BigInt(n) => push(ctx, JsValue::BigInt(n - 1)),
                    other => push(ctx, JsValue::Number(other.to_number() - 1.0)),
                }
            }
            Op::PostInc | Op::PostDec => {
                let v = pop_value(ctx)?;
                let delta = if op == Op::PostInc { 1.0 } else { -1.0 };
                match v {
                    JsValue::BigInt(n) => {
                        push(ctx, JsValue::BigInt(n));
                        push(ctx, JsValue::BigInt(n + delta as i128));
                    }
                    other => {
                        let n = other.to_number();
                        push(ctx, JsValue::Number(n));
                        push(ctx, JsValue::Number(n + delta));
                    }
                }
            }
            Op::BitAnd | Op::BitOr | Op::BitXor | Op::Shl | Op::Sar | Op::Shr => {
                let b = pop_value(ctx)?;
                let a = pop_value(ctx)?;
                match js_bit_binop(op, &a, &b) {
                    Ok(v) => push(ctx, v),
                    Err(msg) => {
                        ctx.throw_type_error(&msg);
                        push(ctx, JsValue::Undefined);
                    }
                }
            }
            Op::BitNot => {
                let v = pop_value(ctx)?;
                match v {
                    JsValue::BigInt(n) => push(ctx, JsValue::BigInt(!n)),
                    other => push(ctx, JsValue::Number(!other.to_int32() as f64)),
                }
            }
            Op::LogicalNot => {
                let v = pop_value(ctx)?;
                push(ctx, JsValue::Bool(!v.to_boolean()));
            }
            Op::Eq | Op::Neq => {
                let b = pop_value(ctx)?;
                let a = pop_value(ctx)?;
                let eq = a.loose_equals(&b);
                push(ctx, JsValue::Bool(if op == Op::Eq { eq } else { !eq }));
            }
            Op::StrictEq | Op::StrictNeq => {
                let b = pop_value(ctx)?;
                let a = pop_value(ctx)?;
                let eq = a.strict_equals(&b);
                push(ctx, JsValue::Bool(if op == Op::StrictEq { eq } else { !eq }));
            }
            Op::Lt | Op::Lte | Op::Gt | Op::Gte => {
                let b = pop_value(ctx)?;
                let a = pop_value(ctx)?;
                push(ctx, JsValue::Bool(js_compare(op, &a, &b)));
            }
            Op::InstanceOf => {
                let ctor = pop_value(ctx)?;
                let value = pop_value(ctx)?;
                match instance_of(ctx, &value, &ctor) {
                    Ok(result) => push(ctx, JsValue::Bool(result)),
                    Err(()) => {
                        ctx.throw_type_error("right-hand side of instanceof is not callable");
                        push(ctx, JsValue::Undefined);
                    }
                }
            }
            Op::In => {
                let object = pop_value(ctx)?;
                let key_value = pop_value(ctx)?;
                match object {
                    JsValue::Object(ref obj) => {
                        let key = PropertyKey::from_value(&key_value);
                        push(ctx, JsValue::Bool(crate::value::has_property(obj, &key)));
                    }
                    _ => {
                        ctx.throw_type_error(
                            "cannot use 'in' operator to search in a non-object",
                        );
                        push(ctx, JsValue::Undefined);
                    }
                }
            }
            Op::LogicalAnd => {
                let b = pop_value(ctx)?;
                let a = pop_value(ctx)?;
                push(ctx, if a.to_boolean() { b } else { a });
            }
            Op::LogicalOr => {
                let b = pop_value(ctx)?;
                let a = pop_value(ctx)?;
                push(ctx, if a.to_boolean() { a } else { b });
            }
            Op::NullishCoalesce => {
                let b = pop_value(ctx)?;
                let a = pop_value(ctx)?;
                push(ctx, if a.is_nullish() { b } else { a });
            }

            // === Control flow ===
            Op::IfFalse | Op::IfTrue => {
                let offset = bytecode.read_i32(operand_at);
                let cond = pop_value(ctx)?.to_boolean();
                if cond == (op == Op::IfTrue) {
                    pc = offset_pc(pc, offset);
                }
            }
            Op::IfFalse8 | Op::IfTrue8 => {
                let offset = bytecode.read_i8(operand_at) as i32;
                let cond = pop_value(ctx)?.to_boolean();
                if cond == (op == Op::IfTrue8) {
                    pc = offset_pc(pc, offset);
                }
            }
            Op::Goto => pc = offset_pc(pc, bytecode.read_i32(operand_at)),
            Op::Goto8 => pc = offset_pc(pc, bytecode.read_i8(operand_at) as i32),
            Op::Goto16 => pc = offset_pc(pc, bytecode.read_i16(operand_at) as i32),
            Op::Catch => {
                let offset = bytecode.read_i32(operand_at);
                let target = offset_pc(pc, offset);
                ctx.stack.push(StackValue::CatchOffset(target));
            }
            Op::NipCatch => {
                let top = pop_value(ctx)?;
                match ctx.stack.pop() {
                    Some(StackValue::CatchOffset(_)) => {}
                    _ => {
                        return Err(JsError::internal(
                            "NipCatch without a catch marker beneath the top value",
                        ))
                    }
                }
                push(ctx, top);
            }

            // === Calls ===
            Op::Call | Op::CallMethod | Op::Call0 | Op::Call1 | Op::Call2 | Op::Call3 => {
                let argc = match op {
                    Op::Call | Op::CallMethod => bytecode.read_u16(operand_at) as usize,
                    Op::Call0 => 0,
                    Op::Call1 => 1,
                    Op::Call2 => 2,
                    _ => 3,
                };
                do_call(ctx, argc, false)?;
            }
            Op::TailCall | Op::TailCallMethod => {
                let argc = bytecode.read_u16(operand_at) as usize;
                if let Some(value) = do_call(ctx, argc, true)? {
                    return Ok(FrameResult::Return(value));
                }
            }
            Op::CallConstructor => {
                let argc = bytecode.read_u16(operand_at) as usize;
                let mut args = Vec::with_capacity(argc);
                for _ in 0..argc {
                    args.push(pop_value(ctx)?);
                }
                args.reverse();
                pop_value(ctx)?; // receiver slot
                let ctor = pop_value(ctx)?;
                match construct(ctx, &ctor, &args) {
                    Ok(value) => {
                        ctx.prop_chain.clear();
                        ctx.prop_chain_lock = false;
                        push(ctx, value);
                    }
                    Err(err) => {
                        if ctx.pending_exception.is_none() {
                            return Err(err);
                        }
                        push(ctx, JsValue::Undefined);
                    }
                }
            }
            Op::ApplyConstructor => {
                let spread = pop_value(ctx)?;
                let ctor = pop_value(ctx)?;
                let args = match spread {
                    JsValue::Object(ref obj) => match obj.borrow().kind {
                        ObjectKind::Array(ref elements) => elements.clone(),
                        _ => Vec::new(),
                    },
                    _ => Vec::new(),
                };
                match construct(ctx, &ctor, &args) {
                    Ok(value) => push(ctx, value),
                    Err(err) => {
                        if ctx.pending_exception.is_none() {
                            return Err(err);
                        }
                        push(ctx, JsValue::Undefined);
                    }
                }
            }
            Op::Rest => {
                let first = bytecode.read_u16(operand_at) as usize;
                let rest: Vec<JsValue> = frame.args.iter().skip(first).cloned().collect();
                let arr = ctx.create_array(rest);
                push(ctx, arr);
            }
            Op::Apply | Op::ApplyEval => {
                let spread = pop_value(ctx)?;
                let this = pop_value(ctx)?;
                let func = pop_value(ctx)?;
                let args = match spread {
                    JsValue::Object(ref obj) => match obj.borrow().kind {
                        ObjectKind::Array(ref elements) => elements.clone(),
                        _ => Vec::new(),
                    },
                    _ => Vec::new(),
                };
                match execute(ctx, &func, &this, &args) {
                    Ok(value) => {
                        ctx.prop_chain.clear();
                        ctx.prop_chain_lock = false;
                        push(ctx, value);
                    }
                    Err(err) => {
                        if ctx.pending_exception.is_none() {
                            return Err(err);
                        }
                        push(ctx, JsValue::Undefined);
                    }
                }
            }
            Op::Return | Op::ReturnAsync => {
                let value = pop_value(ctx)?;
                return Ok(FrameResult::Return(value));
            }
            Op::ReturnUndef => return Ok(FrameResult::Return(JsValue::Undefined)),

            // === Exceptions ===
            Op::Throw => {
                let value = pop_value(ctx)?;
                ctx.pending_exception = Some(value);
            }
            Op::ThrowError => {
                let atom = bytecode.read_u16(operand_at);
                let type_byte = bytecode.read_u8(operand_at + 2);
                let message = bytecode.atom_str(atom).to_string();
                let error_type = match type_byte {
                    1 => ErrorType::RangeError,
                    2 => ErrorType::ReferenceError,
                    3 => ErrorType::SyntaxError,
                    _ => ErrorType::TypeError,
                };
                let error_value = ctx.create_error(error_type, &message);
                ctx.pending_exception = Some(error_value);
            }

            // === Type queries ===
            Op::TypeOf => {
                let v = pop_value(ctx)?;
                push(ctx, JsValue::string(v.type_of()));
            }
            Op::Delete => {
                let key_value = pop_value(ctx)?;
                let object = pop_value(ctx)?;
                let ok = match object {
                    JsValue::Object(ref obj) => {
                        obj.borrow_mut().delete_own(&PropertyKey::from_value(&key_value))
                    }
                    _ => true,
                };
                push(ctx, JsValue::Bool(ok));
            }
            Op::IsUndefined => {
                let v = pop_value(ctx)?;
                push(ctx, JsValue::Bool(v.is_undefined()));
            }
            Op::IsNull => {
                let v = pop_value(ctx)?;
                push(ctx, JsValue::Bool(v.is_null()));
            }
            Op::IsUndefinedOrNull => {
                let v = pop_value(ctx)?;
                push(ctx, JsValue::Bool(v.is_nullish()));
            }
            Op::TypeofIsUndefined => {
                let v = pop_value(ctx)?;
                push(ctx, JsValue::Bool(v.type_of() == "undefined"));
            }
            Op::TypeofIsFunction => {
                let v = pop_value(ctx)?;
                push(ctx, JsValue::Bool(v.type_of() == "function"));
            }

            // === Iteration ===
            Op::ForOfStart | Op::ForAwaitOfStart => {
                let iterable = pop_value(ctx)?;
                match start_iterator(ctx, &iterable, op == Op::ForAwaitOfStart) {
                    Ok((iterator, next)) => {
                        push(ctx, iterator);
                        push(ctx, next);
                        push(ctx, JsValue::Undefined); // catch-offset placeholder
                    }
                    Err(err) => {
                        if ctx.pending_exception.is_none() {
                            return Err(err);
                        }
                        push(ctx, JsValue::Undefined);
                        push(ctx, JsValue::Undefined);
                        push(ctx, JsValue::Undefined);
                    }
                }
            }
            Op::ForOfNext => {
                let iterator = peek_value(ctx, 2)?;
                let next = peek_value(ctx, 1)?;
                match execute(ctx, &next, &iterator, &[]) {
                    Ok(result) => {
                        let value = get_member(ctx, &result, &PropertyKey::string("value"))?;
                        let done = get_member(ctx, &result, &PropertyKey::string("done"))?;
                        push(ctx, value);
                        push(ctx, JsValue::Bool(done.to_boolean()));
                    }
                    Err(err) => {
                        if ctx.pending_exception.is_none() {
                            return Err(err);
                        }
                        push(ctx, JsValue::Undefined);
                        push(ctx, JsValue::Undefined);
                    }
                }
            }
            Op::ForAwaitOfNext => {
                let iterator = peek_value(ctx, 2)?;
                let next = peek_value(ctx, 1)?;
                match execute(ctx, &next, &iterator, &[]) {
                    Ok(result) => push(ctx, result),
                    Err(err) => {
                        if ctx.pending_exception.is_none() {
                            return Err(err);
                        }
                        push(ctx, JsValue::Undefined);
                    }
                }
            }
            Op::ForInStart => {
                let object = pop_value(ctx)?;
                let keys = enumerate_keys(&object);
                let keys: Vec<JsValue> = keys.into_iter().map(|k| JsValue::string(&k)).collect();
                let keys = ctx.create_array(keys);
                push(ctx, keys);
                push(ctx, JsValue::Number(0.0));
            }
            Op::ForInNext => {
                let index = peek_value(ctx, 0)?.to_number() as usize;
                let keys = peek_value(ctx, 1)?;
                let key = match keys {
                    JsValue::Object(ref obj) => match obj.borrow().kind {
                        ObjectKind::Array(ref elements) => elements.get(index).cloned(),
                        _ => None,
                    },
                    _ => None,
                };
                match key {
                    Some(key) => {
                        let len = ctx.stack.len();
                        ctx.stack[len - 1] = StackValue::Value(JsValue::Number((index + 1) as f64));
                        push(ctx, key);
                        push(ctx, JsValue::Bool(false));
                    }
                    None => {
                        push(ctx, JsValue::Undefined);
                        push(ctx, JsValue::Bool(true));
                    }
                }
            }
            Op::ForInEnd => {
                pop_value(ctx)?;
                pop_value(ctx)?;
            }

            // === Generators / async ===
            Op::InitialYield => {
                // Fires once at generator construction; nothing suspends here
            }
            Op::Yield => {
                let value = pop_value(ctx)?;
                return Ok(FrameResult::Yield { value, resume_pc: pc });
            }
            Op::Await => {
                let value = pop_value(ctx)?;
                match do_await(ctx, value) {
                    Ok(Some(resolved)) => push(ctx, resolved),
                    Ok(None) => push(ctx, JsValue::Undefined),
                    Err(err) => return Err(err),
                }
            }

            // === Closures / classes ===
            Op::Fclosure => {
                let index = bytecode.read_u16(operand_at);
                let template = match bytecode.constants.get(index as usize) {
                    Some(Constant::Function(template)) => template.clone(),
                    _ => return Err(JsError::internal("FCLOSURE constant is not a function")),
                };
                let closure = instantiate_closure(ctx, &template, frame, None);
                push(ctx, closure);
            }
            Op::DefineClass => {
                let index = bytecode.read_u16(operand_at);
                let has_super = bytecode.read_u8(operand_at + 2) != 0;
                let template = match bytecode.constants.get(index as usize) {
                    Some(Constant::Function(template)) => template.clone(),
                    _ => return Err(JsError::internal("DefineClass constant is not a function")),
                };
                let parent = if has_super { Some(pop_value(ctx)?) } else { None };
                match define_class(ctx, &template, frame, parent) {
                    Ok((ctor, proto)) => {
                        push(ctx, ctor);
                        push(ctx, proto);
                    }
                    Err(err) => {
                        if ctx.pending_exception.is_none() {
                            return Err(err);
                        }
                        push(ctx, JsValue::Undefined);
                        push(ctx, JsValue::Undefined);
                    }
                }
            }

            Op::Nop => {}
        }
    }
}

fn offset_pc(pc: usize, offset: i32) -> usize {
    (pc as i64 + offset as i64) as usize
}

fn tdz_error(ctx: &mut Context, bytecode: &Bytecode, slot: usize) {
    let name = bytecode
        .local_names
        .get(slot)
        .cloned()
        .unwrap_or_else(|| "binding".to_string());
    let error_value = ctx.create_error(
        ErrorType::ReferenceError,
        &format!("cannot access '{}' before initialization", name),
    );
    ctx.pending_exception = Some(error_value);
}

/// Call with stack layout [callee, receiver, args...]; pushes the result.
/// Returns Some(value) instead for tail calls.
fn do_call(
    ctx: &mut Context,
    argc: usize,
    tail: bool,
) -> Result<Option<JsValue>, JsError> {
    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
        args.push(pop_value(ctx)?);
    }
    args.reverse();
    let receiver = pop_value(ctx)?;
    let callee = pop_value(ctx)?;

    let callable = matches!(callee, JsValue::Object(ref o) if o.borrow().is_callable());
    if !callable {
        // Sets the pending TypeError named after the access chain
        not_a_function_error(ctx, &callee);
        push(ctx, JsValue::Undefined);
        return Ok(None);
    }

    match execute(ctx, &callee, &receiver, &args) {
        Ok(value) => {
            // A successful call resets the diagnostic chain
            ctx.prop_chain.clear();
            ctx.prop_chain_lock = false;
            if tail {
                Ok(Some(value))
            } else {
                push(ctx, value);
                Ok(None)
            }
        }
        Err(err) => {
            if ctx.pending_exception.is_none() {
                return Err(err);
            }
            push(ctx, JsValue::Undefined);
            Ok(None)
        }
    }
}

fn constant_to_value(
    ctx: &mut Context,
    bytecode: &Bytecode,
    index: u16,
) -> Result<JsValue, JsError> {
    match bytecode.constants.get(index as usize) {
        Some(Constant::Number(n)) => Ok(JsValue::Number(*n)),
        Some(Constant::String(s)) => Ok(JsValue::String(s.clone())),
        Some(Constant::BigInt(n)) => Ok(JsValue::BigInt(*n)),
        Some(Constant::Regex(regex)) => {
            // Each evaluation of a regex literal yields a fresh object
            let engine = crate::regex::RegexEngine::new((**regex).clone());
            let obj = JsObject::new(
                ObjectKind::RegExp(Rc::new(engine)),
                Some(ctx.regexp_prototype.clone()),
            );
            obj.borrow_mut().properties.insert(
                PropertyKey::string("lastIndex"),
                Property::data(JsValue::Number(0.0)),
            );
            Ok(JsValue::Object(obj))
        }
        Some(Constant::Function(_)) => {
            Err(JsError::internal("function template pushed as a plain constant"))
        }
        None => Err(JsError::internal("constant pool index out of range")),
    }
}

/// Property read with accessor dispatch and primitive auto-boxing
fn get_member(ctx: &mut Context, value: &JsValue, key: &PropertyKey) -> Result<JsValue, JsError> {
    match value {
        JsValue::Object(obj) => {
            // Proxies forward reads to their target
            let target = match obj.borrow().kind {
                ObjectKind::Proxy { ref target, .. } => Some(target.clone()),
                _ => None,
            };
            if let Some(target) = target {
                return get_member(ctx, &JsValue::Object(target), key);
            }
            match lookup_property(obj, key) {
                Some(prop) => property_value(ctx, value, &prop),
                None => Ok(JsValue::Undefined),
            }
        }
        JsValue::String(s) => {
            if let PropertyKey::String(name) = key {
                if name.as_ref() == "length" {
                    return Ok(JsValue::Number(s.encode_utf16().count() as f64));
                }
                if let Ok(index) = name.parse::<usize>() {
                    return Ok(match s.chars().nth(index) {
                        Some(c) => JsValue::string(&c.to_string()),
                        None => JsValue::Undefined,
                    });
                }
            }
            let boxed = auto_box(ctx, value);
            match lookup_property(&boxed, key) {
                Some(prop) => property_value(ctx, value, &prop),
                None => Ok(JsValue::Undefined),
            }
        }
        JsValue::Number(_) | JsValue::Bool(_) | JsValue::BigInt(_) | JsValue::Symbol(_) => {
            let boxed = auto_box(ctx, value);
            match lookup_property(&boxed, key) {
                Some(prop) => property_value(ctx, value, &prop),
                None => Ok(JsValue::Undefined),
            }
        }
        // Reads off nullish values yield undefined; the TypeError surfaces
        // later if the result is called
        JsValue::Undefined | JsValue::Null | JsValue::Uninitialized => Ok(JsValue::Undefined),
    }
}

/// Wrap a primitive in a fresh object carrying the [[PrimitiveValue]] slot
fn auto_box(ctx: &Context, value: &JsValue) -> ObjectRef {
    JsObject::new(ObjectKind::Boxed(value.clone()), ctx.prototype_for(value))
}

fn property_value(
    ctx: &mut Context,
    receiver: &JsValue,
    prop: &Property,
) -> Result<JsValue, JsError> {
    if let Some(ref getter) = prop.getter {
        return match execute(ctx, getter, receiver, &[]) {
            Ok(value) => Ok(value),
            Err(err) => {
                // Accessor failures become the VM's pending exception; the
                // unwinder takes over on the next iteration
                if ctx.pending_exception.is_none() {
                    return Err(err);
                }
                Ok(JsValue::Undefined)
            }
        };
    }
    if prop.is_accessor() {
        return Ok(JsValue::Undefined);
    }
    Ok(prop.value.clone())
}

fn set_member(
    ctx: &mut Context,
    object: &JsValue,
    key: PropertyKey,
    value: JsValue,
) -> Result<(), JsError> {
    match object {
        JsValue::Object(obj) => {
            let target = match obj.borrow().kind {
                ObjectKind::Proxy { ref target, .. } => Some(target.clone()),
                _ => None,
            };
            if let Some(target) = target {
                return set_member(ctx, &JsValue::Object(target), key, value);
            }
            let setter = lookup_property(obj, &key).and_then(|p| p.setter);
            if let Some(setter) = setter {
                match execute(ctx, &setter, object, &[value]) {
                    Ok(_) => return Ok(()),
                    Err(err) => {
                        if ctx.pending_exception.is_none() {
                            return Err(err);
                        }
                        return Ok(());
                    }
                }
            }
            obj.borrow_mut().set_own(key, value);
            Ok(())
        }
        JsValue::Undefined | JsValue::Null => {
            ctx.throw_type_error(&format!(
                "cannot set properties of {}",
                object.to_js_string()
            ));
            Ok(())
        }
        _ => {
            // Writes to primitives silently vanish outside strict mode
            if ctx.strict {
                ctx.throw_type_error("cannot create property on a primitive value");
            }
            Ok(())
        }
    }
}

fn define_class_member(
    obj: &JsValue,
    key: PropertyKey,
    func: JsValue,
    op: Op,
) -> Result<(), JsError> {
    let Some(target) = obj.as_object() else {
        return Err(JsError::internal("class member defined on a non-object"));
    };
    if let Some(func_obj) = func.as_object() {
        if let ObjectKind::Function(ref mut data) = func_obj.borrow_mut().kind {
            data.home_object = Some(target.clone());
        }
    }
    let mut target = target.borrow_mut();
    match op {
        Op::DefineGetter | Op::DefineSetter => {
            let existing = target.properties.get_mut(&key);
            match existing {
                Some(prop) if prop.is_accessor() => {
                    if op == Op::DefineGetter {
                        prop.getter = Some(func);
                    } else {
                        prop.setter = Some(func);
                    }
                }
                _ => {
                    let mut prop = if op == Op::DefineGetter {
                        Property::accessor(Some(func), None)
                    } else {
                        Property::accessor(None, Some(func))
                    };
                    prop.enumerable = false;
                    target.properties.insert(key, prop);
                }
            }
        }
        _ => {
            target.properties.insert(key, Property::hidden(func));
        }
    }
    Ok(())
}

fn instance_of(ctx: &mut Context, value: &JsValue, ctor: &JsValue) -> Result<bool, ()> {
    let Some(ctor_obj) = ctor.as_object() else { return Err(()) };
    if !ctor_obj.borrow().is_callable() {
        return Err(());
    }
    let proto = lookup_property(ctor_obj, &PropertyKey::string("prototype")).map(|p| p.value);
    let Some(JsValue::Object(proto)) = proto else { return Ok(false) };
    let _ = ctx;
    let mut current = match value {
        JsValue::Object(obj) => obj.borrow().prototype.clone(),
        _ => None,
    };
    while let Some(link) = current {
        if Rc::ptr_eq(&link, &proto) {
            return Ok(true);
        }
        current = link.borrow().prototype.clone();
    }
    Ok(false)
}

fn js_add(a: &JsValue, b: &JsValue) -> Result<JsValue, String> {
    let a = to_primitive(a);
    let b = to_primitive(b);
    if matches!(a, JsValue::String(_)) || matches!(b, JsValue::String(_)) {
        let mut s = a.to_js_string();
        s.push_str(&b.to_js_string());
        return Ok(JsValue::string(&s));
    }
    match (&a, &b) {
        (JsValue::BigInt(x), JsValue::BigInt(y)) => x
            .checked_add(*y)
            .map(JsValue::BigInt)
            .ok_or_else(|| "BigInt overflow".to_string()),
        (JsValue::BigInt(_), _) | (_, JsValue::BigInt(_)) => {
            Err("cannot mix BigInt and other types".to_string())
        }
        _ => Ok(JsValue::Number(a.to_number() + b.to_number())),
    }
}

fn js_numeric_binop(op: Op, a: &JsValue, b: &JsValue) -> Result<JsValue, JsError> {
    match (a, b) {
        (JsValue::BigInt(x), JsValue::BigInt(y)) => {
            let result = match op {
                Op::Sub => x.checked_sub(*y),
                Op::Mul => x.checked_mul(*y),
                Op::Div => {
                    if *y == 0 {
                        return Err(JsError::range_error("division by zero"));
                    }
                    x.checked_div(*y)
                }
                Op::Mod => {
                    if *y == 0 {
                        return Err(JsError::range_error("division by zero"));
                    }
                    x.checked_rem(*y)
                }
                Op::Exp => {
                    if *y < 0 {
                        return Err(JsError::range_error("BigInt negative exponent"));
                    }
                    x.checked_pow((*y).min(u32::MAX as i128) as u32)
                }
                _ => None,
            };
            result
                .map(JsValue::BigInt)
                .ok_or_else(|| JsError::range_error("BigInt overflow"))
        }
        (JsValue::BigInt(_), _) | (_, JsValue::BigInt(_)) => {
            Err(JsError::type_error("cannot mix BigInt and other types"))
        }
        _ => {
            let x = a.to_number();
            let y = b.to_number();
            let result = match op {
                Op::Sub => x - y,
                Op::Mul => x * y,
                Op::Div => x / y,
                Op::Mod => x % y,
                Op::Exp => x.powf(y),
                _ => f64::NAN,
            };
            Ok(JsValue::Number(result))
        }
    }
}

fn js_bit_binop(op: Op, a: &JsValue, b: &JsValue) -> Result<JsValue, String> {
    if let (JsValue::BigInt(x), JsValue::BigInt(y)) = (a, b) {
        let result = match op {
            Op::BitAnd => x & y,
            Op::BitOr => x | y,
            Op::BitXor => x ^ y,
            Op::Shl => x << (*y).clamp(0, 127),
            Op::Sar => x >> (*y).clamp(0, 127),
            Op::Shr => return Err(">>> is not defined for BigInt".to_string()),
            _ => 0,
        };
        return Ok(JsValue::BigInt(result));
    }
    if matches!(a, JsValue::BigInt(_)) || matches!(b, JsValue::BigInt(_)) {
        return Err("cannot mix BigInt and other types".to_string());
    }
    let x = a.to_int32();
    let shift = (b.to_uint32() & 31) as u32;
    Ok(JsValue::Number(match op {
        Op::BitAnd => (x & b.to_int32()) as f64,
        Op::BitOr => (x | b.to_int32()) as f64,
        Op::BitXor => (x ^ b.to_int32()) as f64,
        Op::Shl => x.wrapping_shl(shift) as f64,
        Op::Sar => x.wrapping_shr(shift) as f64,
        Op::Shr => (a.to_uint32().wrapping_shr(shift)) as f64,
        _ => f64::NAN,
    }))
}

fn js_compare(op: Op, a: &JsValue, b: &JsValue) -> bool {
    let a = to_primitive(a);
    let b = to_primitive(b);
    if let (JsValue::String(x), JsValue::String(y)) = (&a, &b) {
        return match op {
            Op::Lt => x < y,
            Op::Lte => x <= y,
            Op::Gt => x > y,
            _ => x >= y,
        };
    }
    let x = a.to_number();
    let y = b.to_number();
    if x.is_nan() || y.is_nan() {
        return false;
    }
    match op {
        Op::Lt => x < y,
        Op::Lte => x <= y,
        Op::Gt => x > y,
        _ => x >= y,
    }
}

/// ToPrimitive simplified: boxed objects unwrap, other objects stringify
fn to_primitive(value: &JsValue) -> JsValue {
    match value {
        JsValue::Object(obj) => match obj.borrow().kind {
            ObjectKind::Boxed(ref inner) => inner.clone(),
            _ => JsValue::string(&value.to_js_string()),
        },
        other => other.clone(),
    }
}

/// Resolve the iteration protocol on a value: returns (iterator, next)
fn start_iterator(
    ctx: &mut Context,
    iterable: &JsValue,
    prefer_async: bool,
) -> Result<(JsValue, JsValue), JsError> {
    let mut method = JsValue::Undefined;
    if prefer_async {
        let key = PropertyKey::Symbol(ctx.symbol_async_iterator.id);
        method = get_member(ctx, iterable, &key)?;
    }
    if method.is_nullish() {
        let key = PropertyKey::Symbol(ctx.symbol_iterator.id);
        method = get_member(ctx, iterable, &key)?;
    }
    if !matches!(method, JsValue::Object(ref o) if o.borrow().is_callable()) {
        ctx.throw_type_error(&format!("{} is not iterable", iterable.to_js_string()));
        return Err(pending_error(ctx));
    }
    let iterator = execute(ctx, &method, iterable, &[])?;
    let next = get_member(ctx, &iterator, &PropertyKey::string("next"))?;
    Ok((iterator, next))
}

/// Materialise an iterable into a vector (spread)
fn collect_iterable(ctx: &mut Context, iterable: &JsValue) -> Result<Vec<JsValue>, JsError> {
    // Fast path for arrays
    if let JsValue::Object(ref obj) = iterable {
        if let ObjectKind::Array(ref elements) = obj.borrow().kind {
            return Ok(elements.clone());
        }
    }
    let (iterator, next) = start_iterator(ctx, iterable, false)?;
    let mut items = Vec::new();
    loop {
        let result = execute(ctx, &next, &iterator, &[])?;
        let done = get_member(ctx, &result, &PropertyKey::string("done"))?;
        if done.to_boolean() {
            return Ok(items);
        }
        items.push(get_member(ctx, &result, &PropertyKey::string("value"))?);
    }
}

/// Own + inherited enumerable string keys, shadow-aware, for for-in
fn enumerate_keys(value: &JsValue) -> Vec<String> {
    let mut keys = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut current = match value {
        JsValue::Object(obj) => Some(obj.clone()),
        _ => None,
    };
    while let Some(obj) = current {
        let borrowed = obj.borrow();
        if let ObjectKind::Array(ref elements) = borrowed.kind {
            for i in 0..elements.len() {
                let key = i.to_string();
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }
        for (key, prop) in borrowed.properties.iter() {
            if let PropertyKey::String(s) = key {
                if seen.insert(s.to_string()) && prop.enumerable {
                    keys.push(s.to_string());
                }
            }
        }
        current = borrowed.prototype.clone();
    }
    keys
}

/// AWAIT: drain the microtask queue until the promise settles.
/// Ok(Some(v)) on fulfilment; Ok(None) when a rejection was converted into
/// the pending exception.
fn do_await(ctx: &mut Context, value: JsValue) -> Result<Option<JsValue>, JsError> {
    let promise = match value {
        JsValue::Object(ref obj) if matches!(obj.borrow().kind, ObjectKind::Promise(_)) => {
            obj.clone()
        }
        other => return Ok(Some(other)),
    };

    loop {
        let state = match promise.borrow().kind {
            ObjectKind::Promise(ref state) => state.clone(),
            _ => PromiseState::Pending,
        };
        match state {
            PromiseState::Fulfilled(resolved) => return Ok(Some(resolved)),
            PromiseState::Rejected(reason) => {
                return match ctx.promise_reject_callback {
                    Some(callback) => {
                        let func = JsValue::Undefined;
                        callback(ctx, &func, &JsValue::Undefined, &[reason])?;
                        Ok(None)
                    }
                    None => Err(JsError::new(
                        ErrorKind::UnhandledRejection,
                        reason.to_js_string(),
                        crate::errors::SourceLocation::unknown(),
                    )),
                };
            }
            PromiseState::Pending => match ctx.microtasks.pop_front() {
                Some(task) => {
                    execute(ctx, &task.callback, &JsValue::Undefined, &task.args)?;
                }
                None => {
                    return Err(JsError::internal(
                        "deadlock: awaited promise is pending and the microtask queue is empty",
                    ))
                }
            },
        }
    }
}

/// FCLOSURE: resolve the template's captures against the current frame
fn instantiate_closure(
    ctx: &mut Context,
    template: &Rc<FunctionTemplate>,
    frame: &mut Frame,
    ctor_kind: Option<ConstructorKind>,
) -> JsValue {
    let var_refs: Vec<VarRef> = template
        .captures
        .iter()
        .map(|source| match source {
            CaptureSource::ParentLocal(i) => frame.get_or_create_local_var_ref(*i as usize),
            CaptureSource::ParentCapture(i) => frame.var_refs[*i as usize].clone(),
        })
        .collect();

    let constructor_kind = ctor_kind.unwrap_or({
        if template.is_arrow || template.is_method || template.is_generator || template.is_async {
            ConstructorKind::None
        } else {
            ConstructorKind::Base
        }
    });

    let data = FunctionData {
        name: template.name.clone(),
        callable: Callable::Bytecode(template.clone()),
        var_refs,
        captured_values: Vec::new(),
        captured_this: if template.is_arrow { Some(frame.this_arg.clone()) } else { None },
        is_generator: template.is_generator,
        is_async: template.is_async,
        constructor_kind,
        home_object: None,
        builtin: None,
    };
    let func = JsObject::new(
        ObjectKind::Function(Box::new(data)),
        Some(ctx.function_prototype.clone()),
    );

    if constructor_kind != ConstructorKind::None {
        let proto = JsObject::plain(Some(ctx.object_prototype.clone()));
        proto.borrow_mut().properties.insert(
            PropertyKey::string("constructor"),
            Property::hidden(JsValue::Object(func.clone())),
        );
        func.borrow_mut().properties.insert(
            PropertyKey::string("prototype"),
            Property::hidden(JsValue::Object(proto)),
        );
    }

    JsValue::Object(func)
}

/// DEFINE_CLASS: constructor closure plus its wired prototype object
fn define_class(
    ctx: &mut Context,
    template: &Rc<FunctionTemplate>,
    frame: &mut Frame,
    parent: Option<JsValue>,
) -> Result<(JsValue, JsValue), JsError> {
    let parent_obj = match parent {
        Some(JsValue::Object(ref obj)) if obj.borrow().is_callable() => Some(obj.clone()),
        Some(ref other) if !other.is_nullish() => {
            ctx.throw_type_error("class heritage is not a constructor");
            return Err(pending_error(ctx));
        }
        _ => None,
    };

    let parent_proto = match parent_obj {
        Some(ref parent) => {
            match lookup_property(parent, &PropertyKey::string("prototype")).map(|p| p.value) {
                Some(JsValue::Object(proto)) => proto,
                _ => ctx.object_prototype.clone(),
            }
        }
        None => ctx.object_prototype.clone(),
    };
    let proto = JsObject::plain(Some(parent_proto));

    let ctor_kind = if template.is_derived_ctor {
        ConstructorKind::Derived
    } else {
        ConstructorKind::Base
    };
    let ctor = instantiate_closure(ctx, template, frame, Some(ctor_kind));

    if let JsValue::Object(ref ctor_obj) = ctor {
        // Static side inherits from the parent constructor
        if let Some(parent) = parent_obj {
            ctor_obj.borrow_mut().prototype = Some(parent);
        }
        ctor_obj.borrow_mut().properties.insert(
            PropertyKey::string("prototype"),
            Property::hidden(JsValue::Object(proto.clone())),
        );
        if let ObjectKind::Function(ref mut data) = ctor_obj.borrow_mut().kind {
            data.home_object = Some(proto.clone());
        }
        proto.borrow_mut().properties.insert(
            PropertyKey::string("constructor"),
            Property::hidden(ctor.clone()),
        );
    }

    Ok((ctor, JsValue::Object(proto)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Op;
    use crate::compiler::compile_program;
    use crate::parser::parse;

    /// Helper to run source through the full pipeline against a fresh
    /// context, returning the context too for state assertions
    fn run_code(code: &str) -> (Context, Result<JsValue, JsError>) {
        let mut ctx = Context::new();
        let result = parse(code, false, false)
            .and_then(|program| compile_program(&program))
            .and_then(|bytecode| execute_program(&mut ctx, bytecode));
        (ctx, result)
    }

    #[test]
    fn test_stack_restored_after_execution() {
        let (ctx, result) = run_code("let a = 1 + 2; a * 3");
        assert!(matches!(result, Ok(JsValue::Number(n)) if n == 9.0));
        assert!(ctx.stack.is_empty(), "stack pointer must return to its pre-call value");
    }

    #[test]
    fn test_stack_restored_after_thrown_exception() {
        let (ctx, result) = run_code("let x = [1, 2, 3]; throw new Error(\"out\");");
        assert!(result.is_err());
        assert!(ctx.stack.is_empty());
        assert!(ctx.pending_exception.is_none(), "top-level run clears the pending slot");
    }

    #[test]
    fn test_strict_mode_restored_around_calls() {
        let (ctx, result) = run_code(
            "function s() { 'use strict'; return 1; } s(); 2",
        );
        assert!(matches!(result, Ok(JsValue::Number(n)) if n == 2.0));
        assert!(!ctx.strict);
    }

    #[test]
    fn test_var_ref_attached_and_closed() {
        let storage = Rc::new(RefCell::new(vec![JsValue::Number(1.0), JsValue::Number(2.0)]));
        let cell = VarRef::attached(storage.clone(), 1);
        assert!(matches!(cell.get(), JsValue::Number(n) if n == 2.0));

        // Writes through the cell land in the shared storage
        cell.set(JsValue::Number(5.0));
        assert!(matches!(storage.borrow()[1], JsValue::Number(n) if n == 5.0));

        // close() freezes the current value
        cell.close();
        storage.borrow_mut()[1] = JsValue::Number(99.0);
        assert!(matches!(cell.get(), JsValue::Number(n) if n == 5.0));

        // Idempotent with respect to observed values
        cell.close();
        assert!(matches!(cell.get(), JsValue::Number(n) if n == 5.0));

        // Writes after close stay in the owned slot
        cell.set(JsValue::Number(7.0));
        assert!(matches!(cell.get(), JsValue::Number(n) if n == 7.0));
        assert!(matches!(storage.borrow()[1], JsValue::Number(n) if n == 99.0));
    }

    #[test]
    fn test_cloned_var_refs_share_state() {
        let storage = Rc::new(RefCell::new(vec![JsValue::Number(0.0)]));
        let a = VarRef::attached(storage, 0);
        let b = a.clone();
        a.set(JsValue::Number(3.0));
        assert!(matches!(b.get(), JsValue::Number(n) if n == 3.0));
        b.close();
        a.set(JsValue::Number(4.0));
        assert!(matches!(b.get(), JsValue::Number(n) if n == 4.0));
    }

    #[test]
    fn test_invalid_opcode_is_an_internal_error() {
        let mut ctx = Context::new();
        let mut bytecode = Bytecode::new();
        bytecode.instructions.push(250);
        let err = execute_program(&mut ctx, Rc::new(bytecode)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InternalError);
    }

    #[test]
    fn test_hand_assembled_catch_marker_unwind() {
        // CATCH +off; THROW pushes and unwinds to the marker; the handler
        // returns the exception value
        let mut ctx = Context::new();
        let mut bc = Bytecode::new();
        bc.emit_op(Op::Catch);
        let patch = bc.here();
        bc.emit_i32(0);
        bc.emit_op(Op::PushI8);
        bc.emit_u8(42);
        bc.emit_op(Op::Throw);
        // Unreachable: would return 0
        bc.emit_op(Op::Push0);
        bc.emit_op(Op::Return);
        let handler = bc.here();
        bc.patch_i32(patch, handler as i32 - (patch as i32 + 4));
        bc.emit_op(Op::Return);
        let result = execute_program(&mut ctx, Rc::new(bc)).unwrap();
        assert!(matches!(result, JsValue::Number(n) if n == 42.0));
    }

    #[test]
    fn test_short_jump_opcodes() {
        // IF_TRUE8 and GOTO8 carry single-byte signed offsets
        let mut ctx = Context::new();
        let mut bc = Bytecode::new();
        bc.emit_op(Op::PushTrue);
        bc.emit_op(Op::IfTrue8);
        bc.emit_u8(2); // skip the Push0/Return below
        bc.emit_op(Op::Push0);
        bc.emit_op(Op::Return);
        bc.emit_op(Op::Push1);
        bc.emit_op(Op::Goto8);
        bc.emit_u8(1); // over the Push2
        bc.emit_op(Op::Push2);
        bc.emit_op(Op::Return);
        let result = execute_program(&mut ctx, Rc::new(bc)).unwrap();
        assert!(matches!(result, JsValue::Number(n) if n == 1.0));

        let mut ctx = Context::new();
        let mut bc = Bytecode::new();
        bc.emit_op(Op::Goto16);
        bc.emit_i16(2);
        bc.emit_op(Op::Push0);
        bc.emit_op(Op::Return);
        bc.emit_op(Op::Push7);
        bc.emit_op(Op::Return);
        let result = execute_program(&mut ctx, Rc::new(bc)).unwrap();
        assert!(matches!(result, JsValue::Number(n) if n == 7.0));
    }

    #[test]
    fn test_stack_permutation_opcodes() {
        let (_, result) = run_code("let o = { n: 1 }; o.n += 4; o.n");
        assert!(matches!(result, Ok(JsValue::Number(n)) if n == 5.0));
        let (_, result) = run_code("let xs = [10]; xs[0] += 5; xs[0]");
        assert!(matches!(result, Ok(JsValue::Number(n)) if n == 15.0));
    }

    #[test]
    fn test_generator_state_transitions() {
        let (mut ctx, result) = run_code("function* g() { yield 1; } g()");
        let generator = result.unwrap();
        let obj = generator.as_object().unwrap().clone();
        assert!(matches!(
            obj.borrow().kind,
            ObjectKind::Generator(ref state)
                if state.status == GeneratorStatus::SuspendedStart
        ));

        execute_generator(&mut ctx, &generator, JsValue::Undefined).unwrap();
        assert!(matches!(
            obj.borrow().kind,
            ObjectKind::Generator(ref state)
                if state.status == GeneratorStatus::SuspendedYield && state.yield_count == 1
        ));

        execute_generator(&mut ctx, &generator, JsValue::Undefined).unwrap();
        assert!(matches!(
            obj.borrow().kind,
            ObjectKind::Generator(ref state)
                if state.status == GeneratorStatus::Completed
        ));

        // Completed generators keep answering done
        let result = execute_generator(&mut ctx, &generator, JsValue::Undefined).unwrap();
        let done = get_member(&mut ctx, &result, &PropertyKey::string("done")).unwrap();
        assert!(done.to_boolean());
        let value = get_member(&mut ctx, &result, &PropertyKey::string("value")).unwrap();
        assert!(value.is_undefined());
    }

    #[test]
    fn test_await_of_settled_promise_returns_value() {
        let mut ctx = Context::new();
        let resolved = do_await(&mut ctx, JsValue::Number(5.0)).unwrap();
        assert!(matches!(resolved, Some(JsValue::Number(n)) if n == 5.0));

        let promise = JsObject::new(
            ObjectKind::Promise(PromiseState::Fulfilled(JsValue::Number(9.0))),
            Some(ctx.promise_prototype.clone()),
        );
        let resolved = do_await(&mut ctx, JsValue::Object(promise)).unwrap();
        assert!(matches!(resolved, Some(JsValue::Number(n)) if n == 9.0));
    }

    #[test]
    fn test_primitive_auto_boxing_reaches_prototypes() {
        let (_, result) = run_code("(5).constructor === Number");
        assert!(matches!(result, Ok(JsValue::Bool(true))));
        let (_, result) = run_code("\"s\".constructor === String");
        assert!(matches!(result, Ok(JsValue::Bool(true))));
    }

    #[test]
    fn test_nullish_member_read_is_undefined_until_called() {
        // Reads off undefined produce undefined; only the call raises
        let (_, result) = run_code("let u; let v = u.missing; typeof v");
        assert!(matches!(result, Ok(JsValue::String(ref s)) if s.as_ref() == "undefined"));
        let (_, result) = run_code("let u; u.missing()");
        assert!(matches!(result, Err(ref e) if e.kind == ErrorKind::TypeError));
    }
}
