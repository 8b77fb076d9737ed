// File: src/compiler.rs
//
// Lowers the parsed AST to VM bytecode: scope tracking with local slot
// allocation, free-variable capture resolution through enclosing
// functions, per-iteration let rebinding (CLOSE_LOC), try/catch/finally
// through in-stack markers, iteration protocols, generators and async
// bodies, and class construction.

use crate::ast::*;
use crate::bytecode::{Bytecode, CaptureSource, Constant, FunctionTemplate, Op};
use crate::errors::JsError;
use std::rc::Rc;

pub fn compile_program(program: &Program) -> Result<Rc<Bytecode>, JsError> {
    let mut compiler = Compiler::new();
    compiler.push_function(0);
    compiler.current().bytecode.strict = program.strict;

    compiler.hoist_declarations(&program.body)?;
    for (index, stmt) in program.body.iter().enumerate() {
        let last = index + 1 == program.body.len();
        if last {
            // The completion value of a trailing expression statement is
            // the program's result (REPL behaviour)
            if let StmtKind::Expr(ref expr) = stmt.kind {
                compiler.compile_expr(expr)?;
                compiler.emit(Op::Return);
                continue;
            }
        }
        compiler.compile_stmt(stmt)?;
    }
    compiler.emit(Op::ReturnUndef);

    let ctx = compiler.functions.pop().expect("top-level function context");
    Ok(Rc::new(finish_bytecode(ctx)))
}

fn finish_bytecode(mut ctx: FunctionCtx) -> Bytecode {
    ctx.bytecode.local_count = ctx.max_slots as usize;
    ctx.bytecode.local_names = ctx.slot_names;
    ctx.bytecode
}

/// How a function template is being defined; constructors are compiled by
/// their own routine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Function,
    Arrow,
    Method,
}

/// Where an identifier resolves to
#[derive(Debug, Clone, Copy)]
enum Binding {
    Local { slot: u16, kind: VarKind },
    Capture { slot: u16, kind: VarKind },
    Global,
}

struct ScopeVar {
    name: String,
    slot: u16,
    kind: VarKind,
}

struct Scope {
    vars: Vec<ScopeVar>,
}

/// Stack-slot bookkeeping for break/continue/return paths
enum CleanupItem {
    /// An active catch marker (try body)
    Marker,
    /// Loop iteration state occupying this many stack slots
    IterState(usize),
    /// A finally block to inline on early exits
    Finalizer(Rc<Vec<Stmt>>),
}

struct LoopScope {
    label: Option<String>,
    is_loop: bool,
    cleanup_len: usize,
    break_patches: Vec<usize>,
    continue_patches: Vec<usize>,
    /// Slot of a per-iteration let binding to close before each new turn
    close_slot: Option<u16>,
}

struct FunctionCtx {
    bytecode: Bytecode,
    scopes: Vec<Scope>,
    next_slot: u16,
    max_slots: u16,
    slot_names: Vec<String>,
    /// name -> (source in parent, original declaration kind)
    captures: Vec<(String, CaptureSource, VarKind)>,
    cleanup: Vec<CleanupItem>,
    loops: Vec<LoopScope>,
    pending_label: Option<String>,
    is_generator: bool,
    is_async: bool,
}

pub struct Compiler {
    functions: Vec<FunctionCtx>,
}

impl Compiler {
    pub fn new() -> Self {
        Compiler { functions: Vec::new() }
    }

    fn push_function(&mut self, param_count: usize) {
        let mut ctx = FunctionCtx {
            bytecode: Bytecode::new(),
            scopes: vec![Scope { vars: Vec::new() }],
            next_slot: 0,
            max_slots: 0,
            slot_names: Vec::new(),
            captures: Vec::new(),
            cleanup: Vec::new(),
            loops: Vec::new(),
            pending_label: None,
            is_generator: false,
            is_async: false,
        };
        ctx.bytecode.arg_count = param_count;
        self.functions.push(ctx);
    }

    fn current(&mut self) -> &mut FunctionCtx {
        self.functions.last_mut().expect("active function context")
    }

    fn emit(&mut self, op: Op) -> usize {
        self.current().bytecode.emit_op(op)
    }

    fn emit_u16(&mut self, v: u16) {
        self.current().bytecode.emit_u16(v);
    }

    fn emit_u8(&mut self, v: u8) {
        self.current().bytecode.emit_u8(v);
    }

    fn here(&mut self) -> usize {
        self.current().bytecode.here()
    }

    fn atom(&mut self, name: &str) -> u16 {
        self.current().bytecode.atom(name)
    }

    /// Emit a jump with a to-be-patched 32-bit offset; returns the operand
    /// position for patch_jump
    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit(op);
        let at = self.here();
        self.current().bytecode.emit_i32(0);
        at
    }

    fn patch_jump(&mut self, operand_at: usize) {
        let target = self.here();
        let offset = target as i32 - (operand_at as i32 + 4);
        self.current().bytecode.patch_i32(operand_at, offset);
    }

    /// Backward jump to a known target
    fn emit_jump_back(&mut self, op: Op, target: usize) {
        self.emit(op);
        let at = self.here();
        let offset = target as i32 - (at as i32 + 4);
        self.current().bytecode.emit_i32(offset);
    }

    fn error(&self, message: impl Into<String>, span: Span) -> JsError {
        JsError::syntax(message, span.location())
    }

    // === Scopes and bindings ===

    fn declare(&mut self, name: &str, kind: VarKind) -> u16 {
        // `var` redeclares into the function-level scope
        let ctx = self.current();
        let scope_index = if kind == VarKind::Var { 0 } else { ctx.scopes.len() - 1 };
        if let Some(existing) = ctx.scopes[scope_index].vars.iter().find(|v| v.name == name) {
            return existing.slot;
        }
        let slot = ctx.next_slot;
        ctx.next_slot += 1;
        ctx.max_slots = ctx.max_slots.max(ctx.next_slot);
        if ctx.slot_names.len() <= slot as usize {
            ctx.slot_names.resize(slot as usize + 1, String::new());
        }
        ctx.slot_names[slot as usize] = name.to_string();
        ctx.scopes[scope_index].vars.push(ScopeVar { name: name.to_string(), slot, kind });
        slot
    }

    fn lookup_in_function(ctx: &FunctionCtx, name: &str) -> Option<(u16, VarKind)> {
        for scope in ctx.scopes.iter().rev() {
            if let Some(var) = scope.vars.iter().rev().find(|v| v.name == name) {
                return Some((var.slot, var.kind));
            }
        }
        None
    }

    /// The capture-resolver chain: free variables thread a VarRef capture
    /// through every enclosing function between the use and the declaration
    fn resolve(&mut self, name: &str) -> Binding {
        let depth = self.functions.len();
        if let Some((slot, kind)) = Self::lookup_in_function(self.current(), name) {
            return Binding::Local { slot, kind };
        }

        // Find the declaring ancestor
        let mut declaring = None;
        for level in (0..depth.saturating_sub(1)).rev() {
            if let Some((slot, kind)) = Self::lookup_in_function(&self.functions[level], name) {
                declaring = Some((level, slot, kind));
                break;
            }
            // An ancestor that already captures the name re-exports it
            if let Some(index) =
                self.functions[level].captures.iter().position(|(n, _, _)| n == name)
            {
                let kind = self.functions[level].captures[index].2;
                let mut capture_index = index as u16;
                for level in level + 1..depth {
                    capture_index = Self::add_capture(
                        &mut self.functions[level],
                        name,
                        CaptureSource::ParentCapture(capture_index),
                        kind,
                    );
                }
                return Binding::Capture { slot: capture_index, kind };
            }
        }

        let Some((declaring_level, slot, kind)) = declaring else {
            return Binding::Global;
        };

        let mut capture_index = 0u16;
        for level in declaring_level + 1..depth {
            let source = if level == declaring_level + 1 {
                CaptureSource::ParentLocal(slot)
            } else {
                CaptureSource::ParentCapture(capture_index)
            };
            capture_index = Self::add_capture(&mut self.functions[level], name, source, kind);
        }
        Binding::Capture { slot: capture_index, kind }
    }

    fn add_capture(
        ctx: &mut FunctionCtx,
        name: &str,
        source: CaptureSource,
        kind: VarKind,
    ) -> u16 {
        if let Some(index) = ctx.captures.iter().position(|(n, _, _)| n == name) {
            return index as u16;
        }
        ctx.captures.push((name.to_string(), source, kind));
        (ctx.captures.len() - 1) as u16
    }

    fn load_binding(&mut self, name: &str) {
        match self.resolve(name) {
            Binding::Local { slot, kind } => {
                if kind == VarKind::Var {
                    self.emit_get_loc(slot);
                } else {
                    self.emit(Op::GetLocCheck);
                    self.emit_u16(slot);
                }
            }
            Binding::Capture { slot, kind } => {
                if kind == VarKind::Var {
                    self.emit_get_var_ref(slot);
                } else {
                    self.emit(Op::GetVarRefCheck);
                    self.emit_u16(slot);
                }
            }
            Binding::Global => {
                let atom = self.atom(name);
                self.emit(Op::GetVar);
                self.emit_u16(atom);
            }
        }
    }

    /// Store the top of stack into a binding, popping it
    fn store_binding(&mut self, name: &str, span: Span, is_decl_init: bool) -> Result<(), JsError> {
        match self.resolve(name) {
            Binding::Local { slot, kind } => {
                if kind == VarKind::Const && !is_decl_init {
                    return Err(self.error(
                        format!("assignment to constant variable '{}'", name),
                        span,
                    ));
                }
                if kind == VarKind::Var || is_decl_init {
                    self.emit_put_loc(slot);
                } else {
                    self.emit(Op::PutLocCheck);
                    self.emit_u16(slot);
                }
            }
            Binding::Capture { slot, kind } => {
                if kind == VarKind::Const && !is_decl_init {
                    return Err(self.error(
                        format!("assignment to constant variable '{}'", name),
                        span,
                    ));
                }
                if kind == VarKind::Var || is_decl_init {
                    self.emit(Op::PutVarRef);
                    self.emit_u16(slot);
                } else {
                    self.emit(Op::PutVarRefCheck);
                    self.emit_u16(slot);
                }
            }
            Binding::Global => {
                let atom = self.atom(name);
                self.emit(Op::PutVar);
                self.emit_u16(atom);
            }
        }
        Ok(())
    }

    fn emit_get_loc(&mut self, slot: u16) {
        match slot {
            0 => {
                self.emit(Op::GetLoc0);
            }
            1 => {
                self.emit(Op::GetLoc1);
            }
            2 => {
                self.emit(Op::GetLoc2);
            }
            3 => {
                self.emit(Op::GetLoc3);
            }
            _ => {
                self.emit(Op::GetLoc);
                self.emit_u16(slot);
            }
        }
    }

    fn emit_put_loc(&mut self, slot: u16) {
        match slot {
            0 => {
                self.emit(Op::PutLoc0);
            }
            1 => {
                self.emit(Op::PutLoc1);
            }
            2 => {
                self.emit(Op::PutLoc2);
            }
            3 => {
                self.emit(Op::PutLoc3);
            }
            _ => {
                self.emit(Op::PutLoc);
                self.emit_u16(slot);
            }
        }
    }

    fn emit_get_var_ref(&mut self, slot: u16) {
        match slot {
            0 => {
                self.emit(Op::GetVarRef0);
            }
            1 => {
                self.emit(Op::GetVarRef1);
            }
            2 => {
                self.emit(Op::GetVarRef2);
            }
            3 => {
                self.emit(Op::GetVarRef3);
            }
            _ => {
                self.emit(Op::GetVarRef);
                self.emit_u16(slot);
            }
        }
    }

    // === Declaration hoisting ===

    /// Function declarations materialise before any statement runs; let and
    /// const slots enter their dead zone
    fn hoist_declarations(&mut self, stmts: &[Stmt]) -> Result<(), JsError> {
        for stmt in stmts {
            match stmt.kind {
                StmtKind::VarDecl { kind, ref declarations } if kind != VarKind::Var => {
                    for (name, _) in declarations {
                        let slot = self.declare(name, kind);
                        self.emit(Op::SetLocUninitialized);
                        self.emit_u16(slot);
                    }
                }
                StmtKind::VarDecl { ref declarations, .. } => {
                    for (name, _) in declarations {
                        self.declare(name, VarKind::Var);
                    }
                }
                _ => {}
            }
        }
        for stmt in stmts {
            if let StmtKind::FunctionDecl(ref def) = stmt.kind {
                let name = def.name.clone().unwrap_or_default();
                let slot = self.declare(&name, VarKind::Var);
                let index = self.compile_function(def, FunctionKind::Function)?;
                self.emit(Op::Fclosure);
                self.emit_u16(index);
                self.emit_put_loc(slot);
            }
        }
        Ok(())
    }

    // === Statements ===

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), JsError> {
        match stmt.kind {
            StmtKind::Expr(ref expr) => {
                self.compile_expr(expr)?;
                self.emit(Op::Drop);
            }
            StmtKind::VarDecl { kind, ref declarations } => {
                for (name, init) in declarations {
                    self.declare(name, kind);
                    match init {
                        Some(expr) => {
                            self.compile_expr(expr)?;
                            self.store_binding(name, stmt.span, true)?;
                        }
                        None if kind == VarKind::Let => {
                            self.emit(Op::Undefined);
                            self.store_binding(name, stmt.span, true)?;
                        }
                        None => {}
                    }
                }
            }
            StmtKind::FunctionDecl(_) => {
                // Installed by the hoisting pass
            }
            StmtKind::ClassDecl(ref def) => {
                let name = def.name.clone().unwrap_or_default();
                self.declare(&name, VarKind::Let);
                self.compile_class(def, Some((&name, stmt.span)))?;
                self.store_binding(&name, stmt.span, true)?;
            }
            StmtKind::Return(ref value) => {
                match value {
                    Some(expr) => {
                        // A simple `return f(...)` lowers to a tail call
                        if self.can_tail_call(expr) {
                            self.compile_tail_call(expr)?;
                            return Ok(());
                        }
                        self.compile_expr(expr)?;
                    }
                    None => {
                        self.emit(Op::Undefined);
                    }
                }
                self.run_finalizers_for_return()?;
                let is_async = self.current().is_async;
                self.emit(if is_async { Op::ReturnAsync } else { Op::Return });
            }
            StmtKind::If { ref test, ref consequent, ref alternate } => {
                self.compile_expr(test)?;
                let to_else = self.emit_jump(Op::IfFalse);
                self.compile_stmt(consequent)?;
                match alternate {
                    Some(alternate) => {
                        let to_end = self.emit_jump(Op::Goto);
                        self.patch_jump(to_else);
                        self.compile_stmt(alternate)?;
                        self.patch_jump(to_end);
                    }
                    None => self.patch_jump(to_else),
                }
            }
            StmtKind::While { ref test, ref body } => {
                let start = self.here();
                self.compile_expr(test)?;
                let to_end = self.emit_jump(Op::IfFalse);
                self.enter_loop(true, 0, None);
                self.compile_stmt(body)?;
                self.patch_continues_to(start);
                self.emit_jump_back(Op::Goto, start);
                self.patch_jump(to_end);
                self.exit_loop();
            }
            StmtKind::DoWhile { ref body, ref test } => {
                let start = self.here();
                self.enter_loop(true, 0, None);
                self.compile_stmt(body)?;
                let test_at = self.here();
                self.patch_continues_to(test_at);
                self.compile_expr(test)?;
                self.emit_jump_back(Op::IfTrue, start);
                self.exit_loop();
            }
            StmtKind::For { ref init, ref test, ref update, ref body } => {
                self.push_scope();
                let mut close_slot = None;
                if let Some(init) = init {
                    if let StmtKind::VarDecl { kind: VarKind::Let, ref declarations } = init.kind
                    {
                        // Per-iteration binding: remember the slot so each
                        // turn closes the captured cell
                        if declarations.len() == 1 {
                            let slot = self.declare(&declarations[0].0, VarKind::Let);
                            self.emit(Op::SetLocUninitialized);
                            self.emit_u16(slot);
                            close_slot = Some(slot);
                        }
                    }
                    self.compile_stmt(init)?;
                }
                let test_at = self.here();
                let to_end = match test {
                    Some(test) => {
                        self.compile_expr(test)?;
                        Some(self.emit_jump(Op::IfFalse))
                    }
                    None => None,
                };
                self.enter_loop(true, 0, close_slot);
                self.compile_stmt(body)?;
                let continue_at = self.here();
                self.patch_continues_to(continue_at);
                if let Some(slot) = close_slot {
                    self.emit(Op::CloseLoc);
                    self.emit_u16(slot);
                }
                if let Some(update) = update {
                    self.compile_expr(update)?;
                    self.emit(Op::Drop);
                }
                self.emit_jump_back(Op::Goto, test_at);
                if let Some(to_end) = to_end {
                    self.patch_jump(to_end);
                }
                self.exit_loop();
                self.pop_scope();
            }
            StmtKind::ForOf { ref head, ref iterable, ref body, is_await } => {
                self.compile_for_of(head, iterable, body, is_await, stmt.span)?;
            }
            StmtKind::ForIn { ref head, ref object, ref body } => {
                self.compile_for_in(head, object, body, stmt.span)?;
            }
            StmtKind::Block(ref stmts) => {
                self.push_scope();
                self.hoist_declarations(stmts)?;
                for s in stmts {
                    self.compile_stmt(s)?;
                }
                self.pop_scope();
            }
            StmtKind::Break(ref label) => self.compile_break(label.as_deref(), stmt.span)?,
            StmtKind::Continue(ref label) => {
                self.compile_continue(label.as_deref(), stmt.span)?
            }
            StmtKind::Labeled { ref label, ref body } => {
                self.current().pending_label = Some(label.clone());
                match body.kind {
                    StmtKind::While { .. }
                    | StmtKind::DoWhile { .. }
                    | StmtKind::For { .. }
                    | StmtKind::ForIn { .. }
                    | StmtKind::ForOf { .. } => self.compile_stmt(body)?,
                    _ => {
                        // Labeled plain statement: breakable, not continuable
                        self.enter_loop(false, 0, None);
                        self.compile_stmt(body)?;
                        self.exit_loop();
                    }
                }
            }
            StmtKind::Throw(ref expr) => {
                self.compile_expr(expr)?;
                self.emit(Op::Throw);
            }
            StmtKind::Try { ref block, ref handler, ref finalizer } => {
                self.compile_try(block, handler.as_ref(), finalizer.as_ref())?;
            }
            StmtKind::Switch { ref discriminant, ref cases } => {
                self.compile_switch(discriminant, cases)?;
            }
            StmtKind::Empty => {}
            StmtKind::Debugger => {
                self.emit(Op::Nop);
            }
        }
        Ok(())
    }

    fn push_scope(&mut self) {
        self.current().scopes.push(Scope { vars: Vec::new() });
    }

    fn pop_scope(&mut self) {
        self.current().scopes.pop();
    }

    fn enter_loop(&mut self, is_loop: bool, iter_slots: usize, close_slot: Option<u16>) {
        let label = self.current().pending_label.take();
        if iter_slots > 0 {
            self.current().cleanup.push(CleanupItem::IterState(iter_slots));
        }
        let cleanup_len =
            self.current().cleanup.len() - if iter_slots > 0 { 1 } else { 0 };
        self.current().loops.push(LoopScope {
            label,
            is_loop,
            cleanup_len,
            break_patches: Vec::new(),
            continue_patches: Vec::new(),
            close_slot,
        });
    }

    fn exit_loop(&mut self) {
        let scope = self.current().loops.pop().expect("loop scope");
        // Had iteration state been registered it is removed with the loop
        while self.current().cleanup.len() > scope.cleanup_len {
            self.current().cleanup.pop();
        }
        for patch in scope.break_patches {
            self.patch_jump(patch);
        }
    }

    fn patch_continues_to(&mut self, target: usize) {
        let patches: Vec<usize> = self
            .current()
            .loops
            .last_mut()
            .map(|l| std::mem::take(&mut l.continue_patches))
            .unwrap_or_default();
        for at in patches {
            let offset = target as i32 - (at as i32 + 4);
            self.current().bytecode.patch_i32(at, offset);
        }
    }

    fn find_loop(&mut self, label: Option<&str>, need_loop: bool) -> Option<usize> {
        let loops = &self.current().loops;
        for (index, scope) in loops.iter().enumerate().rev() {
            let label_matches = match label {
                Some(l) => scope.label.as_deref() == Some(l),
                None => true,
            };
            if label_matches && (!need_loop || scope.is_loop) {
                return Some(index);
            }
        }
        None
    }

    /// Emit the drops/finalizers needed to unwind from the current point to
    /// the loop at `target_index` (inclusive of its own iteration state)
    fn emit_cleanup_to(&mut self, cleanup_len: usize, run_finalizers: bool) -> Result<(), JsError> {
        let items: Vec<CleanupSnapshot> = self.current().cleanup[cleanup_len..]
            .iter()
            .rev()
            .map(|item| match item {
                CleanupItem::Marker => CleanupSnapshot::Drop(1),
                CleanupItem::IterState(n) => CleanupSnapshot::Drop(*n),
                CleanupItem::Finalizer(stmts) => CleanupSnapshot::Finalizer(stmts.clone()),
            })
            .collect();
        for item in items {
            match item {
                CleanupSnapshot::Drop(n) => {
                    for _ in 0..n {
                        self.emit(Op::Drop);
                    }
                }
                CleanupSnapshot::Finalizer(stmts) => {
                    // The finally handler's own catch marker goes first
                    self.emit(Op::Drop);
                    if run_finalizers {
                        for s in stmts.iter() {
                            self.compile_stmt(s)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn compile_break(&mut self, label: Option<&str>, span: Span) -> Result<(), JsError> {
        let Some(index) = self.find_loop(label, false) else {
            return Err(self.error("illegal break statement", span));
        };
        let cleanup_len = self.current().loops[index].cleanup_len;
        self.emit_cleanup_to(cleanup_len, true)?;
        let patch = self.emit_jump(Op::Goto);
        self.current().loops[index].break_patches.push(patch);
        Ok(())
    }

    fn compile_continue(&mut self, label: Option<&str>, span: Span) -> Result<(), JsError> {
        let Some(index) = self.find_loop(label, true) else {
            return Err(self.error("illegal continue statement", span));
        };
        // Keep the target loop's own iteration state on the stack
        let (keep, close_slot) = {
            let ctx = self.current();
            let scope = &ctx.loops[index];
            let own_state = matches!(
                ctx.cleanup.get(scope.cleanup_len),
                Some(CleanupItem::IterState(_))
            );
            (scope.cleanup_len + if own_state { 1 } else { 0 }, scope.close_slot)
        };
        self.emit_cleanup_to(keep, true)?;
        if let Some(slot) = close_slot {
            self.emit(Op::CloseLoc);
            self.emit_u16(slot);
        }
        let patch = self.emit_jump(Op::Goto);
        self.current().loops[index].continue_patches.push(patch);
        Ok(())
    }

    fn run_finalizers_for_return(&mut self) -> Result<(), JsError> {
        let finalizers: Vec<Rc<Vec<Stmt>>> = self
            .current()
            .cleanup
            .iter()
            .rev()
            .filter_map(|item| match item {
                CleanupItem::Finalizer(stmts) => Some(stmts.clone()),
                _ => None,
            })
            .collect();
        for stmts in finalizers {
            for s in stmts.iter() {
                self.compile_stmt(s)?;
            }
        }
        Ok(())
    }

    fn compile_for_of(
        &mut self,
        head: &ForHead,
        iterable: &Expr,
        body: &Stmt,
        is_await: bool,
        span: Span,
    ) -> Result<(), JsError> {
        self.push_scope();
        let close_slot = self.declare_for_head(head)?;

        self.compile_expr(iterable)?;
        self.emit(if is_await { Op::ForAwaitOfStart } else { Op::ForOfStart });

        let next_at = self.here();
        let to_done;
        if is_await {
            self.emit(Op::ForAwaitOfNext);
            self.emit(Op::Await);
            self.emit(Op::Dup);
            let done_atom = self.atom("done");
            self.emit(Op::GetField);
            self.emit_u16(done_atom);
            to_done = self.emit_jump(Op::IfTrue);
            let value_atom = self.atom("value");
            self.emit(Op::GetField);
            self.emit_u16(value_atom);
        } else {
            self.emit(Op::ForOfNext);
            to_done = self.emit_jump(Op::IfTrue);
        }

        self.bind_for_head(head, span)?;
        self.enter_loop(true, 3, close_slot);
        self.compile_stmt(body)?;
        let continue_at = self.here();
        self.patch_continues_to(continue_at);
        if let Some(slot) = close_slot {
            self.emit(Op::CloseLoc);
            self.emit_u16(slot);
        }
        self.emit_jump_back(Op::Goto, next_at);

        self.patch_jump(to_done);
        // [iter, next, offset, value]
        for _ in 0..4 {
            self.emit(Op::Drop);
        }
        self.exit_loop();
        self.pop_scope();
        Ok(())
    }

    fn compile_for_in(
        &mut self,
        head: &ForHead,
        object: &Expr,
        body: &Stmt,
        span: Span,
    ) -> Result<(), JsError> {
        self.push_scope();
        let close_slot = self.declare_for_head(head)?;

        self.compile_expr(object)?;
        self.emit(Op::ForInStart);

        let next_at = self.here();
        self.emit(Op::ForInNext);
        let to_done = self.emit_jump(Op::IfTrue);
        self.bind_for_head(head, span)?;
        self.enter_loop(true, 2, close_slot);
        self.compile_stmt(body)?;
        let continue_at = self.here();
        self.patch_continues_to(continue_at);
        if let Some(slot) = close_slot {
            self.emit(Op::CloseLoc);
            self.emit_u16(slot);
        }
        self.emit_jump_back(Op::Goto, next_at);

        self.patch_jump(to_done);
        self.emit(Op::Drop); // leftover key slot
        self.emit(Op::ForInEnd);
        self.exit_loop();
        self.pop_scope();
        Ok(())
    }

    fn declare_for_head(&mut self, head: &ForHead) -> Result<Option<u16>, JsError> {
        match head {
            ForHead::Decl(kind, name) => {
                let slot = self.declare(name, *kind);
                if *kind != VarKind::Var {
                    self.emit(Op::SetLocUninitialized);
                    self.emit_u16(slot);
                    return Ok(Some(slot));
                }
                Ok(None)
            }
            ForHead::Target(_) => Ok(None),
        }
    }

    fn bind_for_head(&mut self, head: &ForHead, span: Span) -> Result<(), JsError> {
        match head {
            ForHead::Decl(_, name) => self.store_binding(name, span, true),
            ForHead::Target(expr) => self.compile_assign_to(expr, span),
        }
    }

    fn compile_try(
        &mut self,
        block: &[Stmt],
        handler: Option<&CatchClause>,
        finalizer: Option<&Vec<Stmt>>,
    ) -> Result<(), JsError> {
        let finalizer = finalizer.map(|stmts| Rc::new(stmts.clone()));

        // try/finally wraps try/catch
        let fin_catch = match finalizer {
            Some(ref stmts) => {
                let patch = self.emit_jump(Op::Catch);
                self.current().cleanup.push(CleanupItem::Finalizer(stmts.clone()));
                Some(patch)
            }
            None => None,
        };

        match handler {
            Some(handler) => {
                let to_handler = self.emit_jump(Op::Catch);
                self.current().cleanup.push(CleanupItem::Marker);
                self.push_scope();
                self.hoist_declarations(block)?;
                for s in block {
                    self.compile_stmt(s)?;
                }
                self.pop_scope();
                self.current().cleanup.pop();
                self.emit(Op::Drop); // unused catch marker
                let to_after = self.emit_jump(Op::Goto);

                self.patch_jump(to_handler);
                // [exception]
                self.push_scope();
                match handler.param {
                    Some(ref name) => {
                        self.declare(name, VarKind::Let);
                        let span = Span::zero();
                        self.store_binding(name, span, true)?;
                    }
                    None => {
                        self.emit(Op::Drop);
                    }
                }
                self.hoist_declarations(&handler.body)?;
                for s in &handler.body {
                    self.compile_stmt(s)?;
                }
                self.pop_scope();
                self.patch_jump(to_after);
            }
            None => {
                for s in block {
                    self.compile_stmt(s)?;
                }
            }
        }

        if let Some(fin_catch) = fin_catch {
            let stmts = match self.current().cleanup.pop() {
                Some(CleanupItem::Finalizer(stmts)) => stmts,
                _ => unreachable!("finalizer cleanup pushed above"),
            };
            self.emit(Op::Drop); // finally marker, normal path
            for s in stmts.iter() {
                self.compile_stmt(s)?;
            }
            let to_end = self.emit_jump(Op::Goto);

            self.patch_jump(fin_catch);
            // [exception]: run the finalizer, then rethrow
            for s in stmts.iter() {
                self.compile_stmt(s)?;
            }
            self.emit(Op::Throw);
            self.patch_jump(to_end);
        }
        Ok(())
    }

    fn compile_switch(&mut self, discriminant: &Expr, cases: &[SwitchCase]) -> Result<(), JsError> {
        self.push_scope();
        let temp = self.declare("<switch>", VarKind::Var);
        self.compile_expr(discriminant)?;
        self.emit_put_loc(temp);

        let mut body_patches = Vec::with_capacity(cases.len());
        let mut default_index = None;
        for (index, case) in cases.iter().enumerate() {
            match case.test {
                Some(ref test) => {
                    self.emit_get_loc(temp);
                    self.compile_expr(test)?;
                    self.emit(Op::StrictEq);
                    body_patches.push(Some(self.emit_jump(Op::IfTrue)));
                }
                None => {
                    default_index = Some(index);
                    body_patches.push(None);
                }
            }
        }
        let to_default = self.emit_jump(Op::Goto);

        self.enter_loop(false, 0, None);
        let mut body_starts = Vec::with_capacity(cases.len());
        for case in cases {
            body_starts.push(self.here());
            for s in &case.body {
                self.compile_stmt(s)?;
            }
        }
        let end_if_no_default = self.here();
        for (patch, start) in body_patches.iter().zip(&body_starts) {
            if let Some(at) = patch {
                let offset = *start as i32 - (*at as i32 + 4);
                self.current().bytecode.patch_i32(*at, offset);
            }
        }
        let default_target = match default_index {
            Some(index) => body_starts[index],
            None => end_if_no_default,
        };
        let offset = default_target as i32 - (to_default as i32 + 4);
        self.current().bytecode.patch_i32(to_default, offset);
        self.exit_loop();
        self.pop_scope();
        Ok(())
    }

    // === Functions and classes ===

    fn compile_function(
        &mut self,
        def: &FunctionDef,
        kind: FunctionKind,
    ) -> Result<u16, JsError> {
        self.push_function(def.params.len());
        {
            let ctx = self.current();
            ctx.is_generator = def.is_generator;
            ctx.is_async = def.is_async;
            ctx.bytecode.strict = def.strict;
        }

        // Parameters occupy the first local slots
        for param in &def.params {
            self.declare(&param.name, VarKind::Var);
        }
        for (index, param) in def.params.iter().enumerate() {
            if param.rest {
                self.emit(Op::Rest);
                self.emit_u16(index as u16);
                self.emit_put_loc(index as u16);
            } else if let Some(ref default) = param.default {
                self.emit_get_loc(index as u16);
                self.emit(Op::IsUndefined);
                let skip = self.emit_jump(Op::IfFalse);
                self.compile_expr(default)?;
                self.emit_put_loc(index as u16);
                self.patch_jump(skip);
            }
        }

        if def.is_generator {
            self.emit(Op::InitialYield);
        }

        self.hoist_declarations(&def.body)?;
        for stmt in &def.body {
            self.compile_stmt(stmt)?;
        }
        if self.current().is_async {
            self.emit(Op::Undefined);
            self.emit(Op::ReturnAsync);
        } else {
            self.emit(Op::ReturnUndef);
        }

        let ctx = self.functions.pop().expect("function context");
        let captures: Vec<CaptureSource> =
            ctx.captures.iter().map(|(_, source, _)| *source).collect();
        let template = FunctionTemplate {
            name: def.name.clone().unwrap_or_default(),
            param_count: def.params.len(),
            is_generator: def.is_generator,
            is_async: def.is_async,
            is_arrow: def.is_arrow,
            is_method: matches!(kind, FunctionKind::Method),
            is_derived_ctor: false,
            captures,
            bytecode: Rc::new(finish_bytecode(ctx)),
        };
        Ok(self
            .current()
            .bytecode
            .add_constant(Constant::Function(Rc::new(template))))
    }

    /// Lower a class into [ctor] on the stack. For declarations the name
    /// binding initialises right after the constructor is wired, so static
    /// blocks and static field initialisers can already reference it.
    fn compile_class(
        &mut self,
        def: &ClassDef,
        binding: Option<(&str, Span)>,
    ) -> Result<(), JsError> {
        let has_super = def.superclass.is_some();
        if let Some(ref superclass) = def.superclass {
            self.compile_expr(superclass)?;
        }

        // The constructor template carries instance field initialisers in
        // its prologue
        let fields: Vec<&ClassElement> = def
            .elements
            .iter()
            .filter(|e| matches!(e, ClassElement::Field { is_static: false, .. }))
            .collect();
        let explicit_ctor = def.elements.iter().find_map(|e| match e {
            ClassElement::Method { kind: MethodKind::Constructor, func, .. } => Some(func),
            _ => None,
        });
        let ctor_index =
            self.compile_constructor(def, explicit_ctor.map(|f| &**f), &fields, has_super)?;

        self.emit(Op::DefineClass);
        self.emit_u16(ctor_index);
        self.emit_u8(if has_super { 1 } else { 0 });
        // [ctor, proto]

        if let Some((name, span)) = binding {
            self.emit(Op::Swap);
            self.emit(Op::Dup);
            // [proto, ctor, ctor]
            self.store_binding(name, span, true)?;
            self.emit(Op::Swap);
            // [ctor, proto]
        }

        for element in &def.elements {
            match element {
                ClassElement::Method { kind: MethodKind::Constructor, .. } => {}
                ClassElement::Method { key, func, kind, is_static } => {
                    self.compile_class_method(key, func, *kind, *is_static)?;
                }
                ClassElement::Field { is_static: false, .. } => {
                    // Initialised in the constructor prologue
                }
                ClassElement::Field { key, value, is_static: true } => {
                    // [ctor, proto] -> define on the constructor
                    self.emit(Op::Swap);
                    self.emit(Op::Dup);
                    self.compile_keyed_define(key, value.as_ref())?;
                    self.emit(Op::Drop);
                    self.emit(Op::Swap);
                }
                ClassElement::StaticBlock(stmts) => {
                    let block_def = FunctionDef {
                        name: None,
                        params: Vec::new(),
                        body: stmts.clone(),
                        is_async: false,
                        is_generator: false,
                        is_arrow: false,
                        strict: true,
                        span: def.span,
                    };
                    let index = self.compile_function(&block_def, FunctionKind::Method)?;
                    // [ctor, proto]: call the block with this = ctor
                    self.emit(Op::Swap); // [proto, ctor]
                    self.emit(Op::Fclosure);
                    self.emit_u16(index); // [proto, ctor, fn]
                    self.emit(Op::Swap); // [proto, fn, ctor]
                    self.emit(Op::Call0); // [proto, result]
                    self.emit(Op::Drop); // [proto]
                    // The ctor reference was consumed; restore the layout
                    let ctor_atom = self.atom("constructor");
                    self.emit(Op::Dup); // [proto, proto]
                    self.emit(Op::GetField);
                    self.emit_u16(ctor_atom); // [proto, ctor]
                    self.emit(Op::Swap); // [ctor, proto]
                }
            }
        }

        self.emit(Op::Drop); // proto
        Ok(())
    }

    fn compile_constructor(
        &mut self,
        def: &ClassDef,
        explicit: Option<&FunctionDef>,
        fields: &[&ClassElement],
        has_super: bool,
    ) -> Result<u16, JsError> {
        let (params, body) = match explicit {
            Some(f) => (f.params.clone(), f.body.clone()),
            None => (Vec::new(), Vec::new()),
        };

        self.push_function(params.len());
        {
            let ctx = self.current();
            ctx.bytecode.strict = true;
        }
        for param in &params {
            self.declare(&param.name, VarKind::Var);
        }
        for (index, param) in params.iter().enumerate() {
            if param.rest {
                self.emit(Op::Rest);
                self.emit_u16(index as u16);
                self.emit_put_loc(index as u16);
            } else if let Some(ref default) = param.default {
                self.emit_get_loc(index as u16);
                self.emit(Op::IsUndefined);
                let skip = self.emit_jump(Op::IfFalse);
                self.compile_expr(default)?;
                self.emit_put_loc(index as u16);
                self.patch_jump(skip);
            }
        }

        // Implicit derived constructor forwards its arguments to super
        if explicit.is_none() && has_super {
            self.emit(Op::PushSuperCtor);
            self.emit(Op::PushThis);
            self.emit(Op::Rest);
            self.emit_u16(0);
            self.emit(Op::Apply);
            self.emit(Op::Drop);
        }

        // Field initialisers run in the prologue; a derived constructor
        // opening with super(...) gets them right after that call instead
        let leading_super = has_super
            && body.first().map(is_super_call_stmt).unwrap_or(false);
        let mut remaining: &[Stmt] = &body;
        if leading_super {
            self.compile_stmt(&body[0])?;
            remaining = &body[1..];
        }
        for field in fields {
            if let ClassElement::Field { key, value, .. } = field {
                self.emit(Op::PushThis);
                self.compile_keyed_define(key, value.as_ref())?;
                self.emit(Op::Drop);
            }
        }

        self.hoist_declarations(remaining)?;
        for stmt in remaining {
            self.compile_stmt(stmt)?;
        }
        self.emit(Op::ReturnUndef);

        let ctx = self.functions.pop().expect("constructor context");
        let captures: Vec<CaptureSource> =
            ctx.captures.iter().map(|(_, source, _)| *source).collect();
        let template = FunctionTemplate {
            name: def.name.clone().unwrap_or_default(),
            param_count: params.len(),
            is_generator: false,
            is_async: false,
            is_arrow: false,
            is_method: false,
            is_derived_ctor: has_super,
            captures,
            bytecode: Rc::new(finish_bytecode(ctx)),
        };
        Ok(self
            .current()
            .bytecode
            .add_constant(Constant::Function(Rc::new(template))))
    }

    fn compile_class_method(
        &mut self,
        key: &PropertyKey,
        func: &FunctionDef,
        kind: MethodKind,
        is_static: bool,
    ) -> Result<(), JsError> {
        let index = self.compile_function(func, FunctionKind::Method)?;

        // [ctor, proto]: bring the target on top, restore the layout after
        if is_static {
            self.emit(Op::Swap); // [proto, ctor]
        }
        self.emit(Op::Dup);
        // [.., target, target]
        match key {
            PropertyKey::Computed(ref expr) => {
                if kind != MethodKind::Method {
                    return Err(self.error(
                        "computed accessor names are not supported",
                        func.span,
                    ));
                }
                self.compile_expr(expr)?;
                self.emit(Op::Fclosure);
                self.emit_u16(index);
                // [.., target, target, key, fn]
                self.emit(Op::DefineMethodComputed);
            }
            _ => {
                self.emit(Op::Fclosure);
                self.emit_u16(index);
                let atom = self.property_key_atom(key)?;
                let op = match kind {
                    MethodKind::Get => Op::DefineGetter,
                    MethodKind::Set => Op::DefineSetter,
                    _ => Op::DefineMethod,
                };
                self.emit(op);
                self.emit_u16(atom);
            }
        }
        // [.., target, target]
        self.emit(Op::Drop);
        if is_static {
            self.emit(Op::Swap); // back to [ctor, proto]
        }
        Ok(())
    }

    fn property_key_atom(&mut self, key: &PropertyKey) -> Result<u16, JsError> {
        let name = match key {
            PropertyKey::Identifier(name) => name.clone(),
            PropertyKey::Str(s) => s.clone(),
            PropertyKey::Number(n) => crate::value::format_number(*n),
            PropertyKey::Private(name) => format!("#{}", name),
            PropertyKey::Computed(_) => {
                return Err(JsError::syntax(
                    "computed key where a literal key is required",
                    crate::errors::SourceLocation::unknown(),
                ))
            }
        };
        Ok(self.atom(&name))
    }

    /// With the target object on top of the stack, evaluate the key (when
    /// computed) and the value and define the property; the object stays
    fn compile_keyed_define(
        &mut self,
        key: &PropertyKey,
        value: Option<&Expr>,
    ) -> Result<(), JsError> {
        match key {
            PropertyKey::Computed(ref key_expr) => {
                self.compile_expr(key_expr)?;
                match value {
                    Some(value) => self.compile_expr(value)?,
                    None => {
                        self.emit(Op::Undefined);
                    }
                }
                self.emit(Op::DefineProp);
            }
            _ => {
                match value {
                    Some(value) => self.compile_expr(value)?,
                    None => {
                        self.emit(Op::Undefined);
                    }
                }
                let atom = self.property_key_atom(key)?;
                self.emit(Op::DefineField);
                self.emit_u16(atom);
            }
        }
        Ok(())
    }

    // === Expressions ===

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), JsError> {
        match expr.kind {
            ExprKind::Number(n) => self.emit_number(n),
            ExprKind::BigInt(ref digits) => {
                match digits.parse::<i32>() {
                    Ok(small) => {
                        self.emit(Op::PushBigIntI32);
                        self.current().bytecode.emit_i32(small);
                    }
                    Err(_) => {
                        let value: i128 = digits.parse().map_err(|_| {
                            self.error("BigInt literal out of range", expr.span)
                        })?;
                        let index = self.current().bytecode.add_constant(Constant::BigInt(value));
                        self.emit(Op::PushConst);
                        self.emit_u16(index);
                    }
                }
            }
            ExprKind::Str(ref s) => {
                if s.is_empty() {
                    self.emit(Op::PushEmptyString);
                } else {
                    let index =
                        self.current().bytecode.add_constant(Constant::String(Rc::from(&**s)));
                    self.emit(Op::PushConst);
                    self.emit_u16(index);
                }
            }
            ExprKind::Bool(true) => {
                self.emit(Op::PushTrue);
            }
            ExprKind::Bool(false) => {
                self.emit(Op::PushFalse);
            }
            ExprKind::Null => {
                self.emit(Op::Null);
            }
            ExprKind::Identifier(ref name) => match name.as_str() {
                "undefined" => {
                    self.emit(Op::Undefined);
                }
                "NaN" => {
                    let index = self.current().bytecode.add_constant(Constant::Number(f64::NAN));
                    self.emit(Op::PushConst);
                    self.emit_u16(index);
                }
                _ => self.load_binding(name),
            },
            ExprKind::This => {
                self.emit(Op::PushThis);
            }
            ExprKind::Regex { ref pattern, ref flags } => {
                let bytecode = crate::regex::compile(pattern, flags)?;
                let index = self
                    .current()
                    .bytecode
                    .add_constant(Constant::Regex(Rc::new(bytecode)));
                self.emit(Op::PushConst);
                self.emit_u16(index);
            }
            ExprKind::TemplateLiteral { ref quasis, ref expressions } => {
                self.compile_template(quasis, expressions, expr.span)?;
            }
            ExprKind::TaggedTemplate { ref tag, ref quasis, ref expressions } => {
                self.compile_tagged_template(tag, quasis, expressions)?;
            }
            ExprKind::Array(ref elements) => {
                self.emit(Op::ArrayNew);
                for element in elements {
                    match element.kind {
                        ExprKind::Spread(ref inner) => {
                            self.compile_expr(inner)?;
                            self.emit(Op::AppendSpread);
                        }
                        ExprKind::Elision => {
                            self.emit(Op::Undefined);
                            self.emit(Op::Append);
                        }
                        _ => {
                            self.compile_expr(element)?;
                            self.emit(Op::Append);
                        }
                    }
                }
            }
            ExprKind::Elision => {
                self.emit(Op::Undefined);
            }
            ExprKind::Object(ref properties) => self.compile_object_literal(properties)?,
            ExprKind::Function(ref def) => {
                let kind =
                    if def.is_arrow { FunctionKind::Arrow } else { FunctionKind::Function };
                let index = self.compile_function(def, kind)?;
                self.emit(Op::Fclosure);
                self.emit_u16(index);
            }
            ExprKind::Class(ref def) => self.compile_class(def, None)?,
            ExprKind::Unary { ref op, ref argument } => {
                self.compile_unary(op, argument, expr.span)?;
            }
            ExprKind::Update { ref op, prefix, ref argument } => {
                self.compile_update(op, prefix, argument, expr.span)?;
            }
            ExprKind::Binary { ref op, ref left, ref right } => {
                self.compile_binary(op, left, right)?;
            }
            ExprKind::Assign { ref op, ref target, ref value } => {
                self.compile_assign(op, target, value, expr.span)?;
            }
            ExprKind::Conditional { ref test, ref consequent, ref alternate } => {
                self.compile_expr(test)?;
                let to_else = self.emit_jump(Op::IfFalse);
                self.compile_expr(consequent)?;
                let to_end = self.emit_jump(Op::Goto);
                self.patch_jump(to_else);
                self.compile_expr(alternate)?;
                self.patch_jump(to_end);
            }
            ExprKind::Sequence(ref exprs) => {
                for (index, e) in exprs.iter().enumerate() {
                    self.compile_expr(e)?;
                    if index + 1 < exprs.len() {
                        self.emit(Op::Drop);
                    }
                }
            }
            ExprKind::Member { .. } => self.compile_member_read(expr, false)?,
            ExprKind::Call { .. } => self.compile_call(expr, false)?,
            ExprKind::New { ref callee, ref args } => {
                self.compile_expr(callee)?;
                if args.iter().any(|a| matches!(a.kind, ExprKind::Spread(_))) {
                    self.spread_args_array(args)?;
                    self.emit(Op::ApplyConstructor);
                } else {
                    self.emit(Op::Undefined);
                    for arg in args {
                        self.compile_expr(arg)?;
                    }
                    self.emit(Op::CallConstructor);
                    self.emit_u16(args.len() as u16);
                }
            }
            ExprKind::Await(ref inner) => {
                self.compile_expr(inner)?;
                self.emit(Op::Await);
            }
            ExprKind::Yield { ref argument, delegate } => {
                if delegate {
                    self.compile_yield_star(argument.as_deref(), expr.span)?;
                } else {
                    match argument {
                        Some(inner) => self.compile_expr(inner)?,
                        None => {
                            self.emit(Op::Undefined);
                        }
                    }
                    self.emit(Op::Yield);
                }
            }
            ExprKind::Super => {
                return Err(self.error("'super' is only valid in calls and member access", expr.span))
            }
            ExprKind::Spread(_) => {
                return Err(self.error("unexpected spread element", expr.span))
            }
            ExprKind::PrivateName(ref name) => {
                // `#x in obj` pushes the private key as a value
                let atom = self.atom(&format!("#{}", name));
                self.emit(Op::PushAtomValue);
                self.emit_u16(atom);
            }
        }
        Ok(())
    }

    fn emit_number(&mut self, n: f64) {
        if n == 0.0 && n.is_sign_negative() {
            let index = self.current().bytecode.add_constant(Constant::Number(n));
            self.emit(Op::PushConst);
            self.emit_u16(index);
            return;
        }
        if n.fract() == 0.0 && !n.is_sign_negative() && (0.0..=7.0).contains(&n) {
            let op = match n as i64 {
                0 => Op::Push0,
                1 => Op::Push1,
                2 => Op::Push2,
                3 => Op::Push3,
                4 => Op::Push4,
                5 => Op::Push5,
                6 => Op::Push6,
                _ => Op::Push7,
            };
            self.emit(op);
        } else if n == -1.0 {
            self.emit(Op::PushMinus1);
        } else if n.fract() == 0.0 && (i8::MIN as f64..=i8::MAX as f64).contains(&n) {
            self.emit(Op::PushI8);
            self.emit_u8(n as i8 as u8);
        } else if n.fract() == 0.0 && (i16::MIN as f64..=i16::MAX as f64).contains(&n) {
            self.emit(Op::PushI16);
            self.current().bytecode.emit_i16(n as i16);
        } else if n.fract() == 0.0 && (i32::MIN as f64..=i32::MAX as f64).contains(&n) {
            self.emit(Op::PushI32);
            self.current().bytecode.emit_i32(n as i32);
        } else {
            let index = self.current().bytecode.add_constant(Constant::Number(n));
            self.emit(Op::PushConst);
            self.emit_u16(index);
        }
    }

    fn compile_template(
        &mut self,
        quasis: &[TemplateQuasi],
        expressions: &[Expr],
        span: Span,
    ) -> Result<(), JsError> {
        let cooked0 = quasis
            .first()
            .and_then(|q| q.cooked.clone())
            .ok_or_else(|| self.error("invalid escape in template literal", span))?;
        if cooked0.is_empty() {
            self.emit(Op::PushEmptyString);
        } else {
            let index = self
                .current()
                .bytecode
                .add_constant(Constant::String(Rc::from(cooked0.as_str())));
            self.emit(Op::PushConst);
            self.emit_u16(index);
        }
        for (i, expr) in expressions.iter().enumerate() {
            self.compile_expr(expr)?;
            self.emit(Op::Add);
            if let Some(quasi) = quasis.get(i + 1) {
                let cooked = quasi
                    .cooked
                    .clone()
                    .ok_or_else(|| self.error("invalid escape in template literal", span))?;
                if !cooked.is_empty() {
                    let index = self
                        .current()
                        .bytecode
                        .add_constant(Constant::String(Rc::from(cooked.as_str())));
                    self.emit(Op::PushConst);
                    self.emit_u16(index);
                    self.emit(Op::Add);
                }
            }
        }
        Ok(())
    }

    fn compile_tagged_template(
        &mut self,
        tag: &Expr,
        quasis: &[TemplateQuasi],
        expressions: &[Expr],
    ) -> Result<(), JsError> {
        // tag(strings, ...expressions) where strings carries .raw
        match tag.kind {
            ExprKind::Member { .. } => self.compile_member_read(tag, true)?,
            _ => {
                self.compile_expr(tag)?;
                self.emit(Op::Undefined);
            }
        }
        // [tag, receiver]: build the cooked strings array
        self.emit(Op::ArrayNew);
        for quasi in quasis {
            match quasi.cooked {
                Some(ref cooked) => {
                    let index = self
                        .current()
                        .bytecode
                        .add_constant(Constant::String(Rc::from(cooked.as_str())));
                    self.emit(Op::PushConst);
                    self.emit_u16(index);
                }
                None => {
                    self.emit(Op::Undefined);
                }
            }
            self.emit(Op::Append);
        }
        // Attach .raw
        self.emit(Op::ArrayNew);
        for quasi in quasis {
            let index = self
                .current()
                .bytecode
                .add_constant(Constant::String(Rc::from(quasi.raw.as_str())));
            self.emit(Op::PushConst);
            self.emit_u16(index);
            self.emit(Op::Append);
        }
        let raw_atom = self.atom("raw");
        self.emit(Op::DefineField);
        self.emit_u16(raw_atom);
        // [tag, receiver, strings]
        for expr in expressions {
            self.compile_expr(expr)?;
        }
        self.emit(Op::CallMethod);
        self.emit_u16(1 + expressions.len() as u16);
        Ok(())
    }

    fn compile_object_literal(&mut self, properties: &[Property]) -> Result<(), JsError> {
        self.emit(Op::Object);
        for property in properties {
            match property.kind {
                PropertyKind::Spread => {
                    self.compile_expr(&property.value)?;
                    self.emit(Op::CopyDataProperties);
                }
                PropertyKind::Get | PropertyKind::Set => {
                    let func = match property.value.kind {
                        ExprKind::Function(ref def) => def.clone(),
                        _ => {
                            return Err(self.error("accessor must be a function", property.span))
                        }
                    };
                    let index = self.compile_function(&func, FunctionKind::Method)?;
                    self.emit(Op::Fclosure);
                    self.emit_u16(index);
                    let atom = self.property_key_atom(&property.key)?;
                    self.emit(if property.kind == PropertyKind::Get {
                        Op::DefineGetter
                    } else {
                        Op::DefineSetter
                    });
                    self.emit_u16(atom);
                }
                PropertyKind::Method => {
                    let func = match property.value.kind {
                        ExprKind::Function(ref def) => def.clone(),
                        _ => return Err(self.error("method must be a function", property.span)),
                    };
                    let index = self.compile_function(&func, FunctionKind::Method)?;
                    if let PropertyKey::Computed(ref key_expr) = property.key {
                        self.compile_expr(key_expr)?;
                        self.emit(Op::Fclosure);
                        self.emit_u16(index);
                        self.emit(Op::DefineMethodComputed);
                    } else {
                        self.emit(Op::Fclosure);
                        self.emit_u16(index);
                        let atom = self.property_key_atom(&property.key)?;
                        self.emit(Op::DefineMethod);
                        self.emit_u16(atom);
                    }
                }
                PropertyKind::Init | PropertyKind::Shorthand => {
                    if let PropertyKey::Computed(ref key_expr) = property.key {
                        self.compile_expr(key_expr)?;
                        self.compile_expr(&property.value)?;
                        self.emit(Op::DefineProp);
                    } else {
                        self.compile_expr(&property.value)?;
                        let atom = self.property_key_atom(&property.key)?;
                        self.emit(Op::DefineField);
                        self.emit_u16(atom);
                    }
                }
            }
        }
        Ok(())
    }

    /// Compile a member read. With `keep_object` the receiver stays beneath
    /// the value (method call protocol).
    fn compile_member_read(&mut self, expr: &Expr, keep_object: bool) -> Result<(), JsError> {
        let ExprKind::Member { ref object, ref property, computed, optional } = expr.kind else {
            unreachable!("caller matched a member expression");
        };

        // super.x reads through the home object's prototype
        if matches!(object.kind, ExprKind::Super) {
            self.emit(Op::PushHomeProto);
            if keep_object {
                // Receiver for super calls is `this`
                self.emit(Op::PushThis);
                self.emit(Op::Swap);
                // [this, proto]
                self.emit_member_access(property, computed)?;
                // [this, value] -> [value, this] call layout
                self.emit(Op::Swap);
            } else {
                self.emit_member_access(property, computed)?;
            }
            return Ok(());
        }

        self.compile_expr(object)?;
        let mut to_end = None;
        if optional {
            self.emit(Op::Dup);
            self.emit(Op::IsUndefinedOrNull);
            let short = self.emit_jump(Op::IfFalse);
            self.emit(Op::Drop);
            self.emit(Op::Undefined);
            if keep_object {
                self.emit(Op::Dup);
            }
            to_end = Some(self.emit_jump(Op::Goto));
            self.patch_jump(short);
        }
        if keep_object {
            self.emit_member_access_keep(property, computed)?;
            // [obj, value] -> [value, obj] call layout
            self.emit(Op::Swap);
        } else {
            self.emit_member_access(property, computed)?;
        }
        if let Some(to_end) = to_end {
            self.patch_jump(to_end);
        }
        Ok(())
    }

    fn emit_member_access(&mut self, property: &Expr, computed: bool) -> Result<(), JsError> {
        if computed {
            self.compile_expr(property)?;
            self.emit(Op::GetArrayEl);
        } else {
            let atom = self.member_atom(property)?;
            self.emit(Op::GetField);
            self.emit_u16(atom);
        }
        Ok(())
    }

    fn emit_member_access_keep(&mut self, property: &Expr, computed: bool) -> Result<(), JsError> {
        if computed {
            self.compile_expr(property)?;
            self.emit(Op::GetArrayEl2);
        } else {
            let atom = self.member_atom(property)?;
            self.emit(Op::GetField2);
            self.emit_u16(atom);
        }
        Ok(())
    }

    fn member_atom(&mut self, property: &Expr) -> Result<u16, JsError> {
        match property.kind {
            ExprKind::Identifier(ref name) => Ok(self.atom(name)),
            ExprKind::PrivateName(ref name) => Ok(self.atom(&format!("#{}", name))),
            ExprKind::Str(ref s) => Ok(self.atom(s)),
            _ => Err(self.error("invalid member access", property.span)),
        }
    }

    fn spread_args_array(&mut self, args: &[Expr]) -> Result<(), JsError> {
        self.emit(Op::ArrayNew);
        for arg in args {
            match arg.kind {
                ExprKind::Spread(ref inner) => {
                    self.compile_expr(inner)?;
                    self.emit(Op::AppendSpread);
                }
                _ => {
                    self.compile_expr(arg)?;
                    self.emit(Op::Append);
                }
            }
        }
        Ok(())
    }

    fn compile_call(&mut self, expr: &Expr, tail: bool) -> Result<(), JsError> {
        let ExprKind::Call { ref callee, ref args, optional } = expr.kind else {
            unreachable!("caller matched a call expression");
        };
        let has_spread = args.iter().any(|a| matches!(a.kind, ExprKind::Spread(_)));

        // super(...) invokes the parent constructor on the current `this`
        if matches!(callee.kind, ExprKind::Super) {
            self.emit(Op::PushSuperCtor);
            self.emit(Op::PushThis);
            if has_spread {
                self.spread_args_array(args)?;
                self.emit(Op::Apply);
            } else {
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit(Op::CallMethod);
                self.emit_u16(args.len() as u16);
            }
            return Ok(());
        }

        let is_method = matches!(callee.kind, ExprKind::Member { .. });
        if is_method {
            self.compile_member_read(callee, true)?;
            // [callee, receiver]
        } else {
            self.compile_expr(callee)?;
            self.emit(Op::Undefined);
        }

        let mut to_end = None;
        if optional {
            // [callee, receiver]: skip the call when the callee is nullish
            self.emit(Op::Swap);
            self.emit(Op::Dup);
            self.emit(Op::IsUndefinedOrNull);
            let do_call = self.emit_jump(Op::IfFalse);
            self.emit(Op::Drop);
            self.emit(Op::Drop);
            self.emit(Op::Undefined);
            to_end = Some(self.emit_jump(Op::Goto));
            self.patch_jump(do_call);
            self.emit(Op::Swap);
        }

        if has_spread {
            self.spread_args_array(args)?;
            self.emit(Op::Apply);
        } else {
            for arg in args {
                self.compile_expr(arg)?;
            }
            let argc = args.len();
            if tail {
                self.emit(if is_method { Op::TailCallMethod } else { Op::TailCall });
                self.emit_u16(argc as u16);
            } else if is_method {
                self.emit(Op::CallMethod);
                self.emit_u16(argc as u16);
            } else {
                match argc {
                    0 => {
                        self.emit(Op::Call0);
                    }
                    1 => {
                        self.emit(Op::Call1);
                    }
                    2 => {
                        self.emit(Op::Call2);
                    }
                    3 => {
                        self.emit(Op::Call3);
                    }
                    _ => {
                        self.emit(Op::Call);
                        self.emit_u16(argc as u16);
                    }
                }
            }
        }
        if let Some(to_end) = to_end {
            self.patch_jump(to_end);
        }
        Ok(())
    }

    fn can_tail_call(&mut self, expr: &Expr) -> bool {
        if self.current().is_async || self.current().is_generator {
            return false;
        }
        let in_protected_region = self
            .current()
            .cleanup
            .iter()
            .any(|item| !matches!(item, CleanupItem::IterState(_)));
        if in_protected_region {
            return false;
        }
        match expr.kind {
            ExprKind::Call { optional, ref args, ref callee, .. } => {
                !optional
                    && !matches!(callee.kind, ExprKind::Super)
                    && !args.iter().any(|a| matches!(a.kind, ExprKind::Spread(_)))
            }
            _ => false,
        }
    }

    fn compile_tail_call(&mut self, expr: &Expr) -> Result<(), JsError> {
        self.compile_call(expr, true)
    }

    fn compile_unary(&mut self, op: &str, argument: &Expr, span: Span) -> Result<(), JsError> {
        match op {
            "typeof" => {
                // typeof of an unresolved global must not throw
                if let ExprKind::Identifier(ref name) = argument.kind {
                    if matches!(self.resolve(name), Binding::Global) {
                        let atom = self.atom(name);
                        self.emit(Op::GetVarUndef);
                        self.emit_u16(atom);
                        self.emit(Op::TypeOf);
                        return Ok(());
                    }
                }
                self.compile_expr(argument)?;
                self.emit(Op::TypeOf);
            }
            "delete" => match argument.kind {
                ExprKind::Member { ref object, ref property, computed, .. } => {
                    self.compile_expr(object)?;
                    if computed {
                        self.compile_expr(property)?;
                    } else {
                        let atom = self.member_atom(property)?;
                        self.emit(Op::PushAtomValue);
                        self.emit_u16(atom);
                    }
                    self.emit(Op::Delete);
                }
                _ => {
                    // Bindings are not deletable
                    self.compile_expr(argument)?;
                    self.emit(Op::Drop);
                    self.emit(Op::PushFalse);
                }
            },
            "void" => {
                self.compile_expr(argument)?;
                self.emit(Op::Drop);
                self.emit(Op::Undefined);
            }
            "-" => {
                self.compile_expr(argument)?;
                self.emit(Op::Neg);
            }
            "+" => {
                self.compile_expr(argument)?;
                self.emit(Op::Plus);
            }
            "!" => {
                self.compile_expr(argument)?;
                self.emit(Op::LogicalNot);
            }
            "~" => {
                self.compile_expr(argument)?;
                self.emit(Op::BitNot);
            }
            _ => return Err(self.error(format!("unknown unary operator '{}'", op), span)),
        }
        Ok(())
    }

    fn compile_update(
        &mut self,
        op: &str,
        prefix: bool,
        argument: &Expr,
        span: Span,
    ) -> Result<(), JsError> {
        let inc = op == "++";
        match argument.kind {
            ExprKind::Identifier(ref name) => {
                self.load_binding(name);
                if prefix {
                    self.emit(if inc { Op::Inc } else { Op::Dec });
                    self.emit(Op::Dup);
                    self.store_binding(name, span, false)?;
                } else {
                    self.emit(if inc { Op::PostInc } else { Op::PostDec });
                    self.store_binding(name, span, false)?;
                }
            }
            ExprKind::Member { ref object, ref property, computed, .. } => {
                self.compile_expr(object)?;
                if computed {
                    // [obj] -> [obj, key, old]
                    self.compile_expr(property)?;
                    self.emit(Op::Dup2);
                    self.emit(Op::GetArrayEl);
                    if prefix {
                        self.emit(if inc { Op::Inc } else { Op::Dec });
                        // [obj, key, new] -> [new, obj, key, new]
                        self.emit(Op::Insert3);
                        self.emit(Op::PutArrayEl);
                    } else {
                        self.emit(if inc { Op::PostInc } else { Op::PostDec });
                        // [obj, key, old, new] -> [old, obj, key, new]
                        self.emit(Op::Rot4L);
                        self.emit(Op::Rot4L);
                        self.emit(Op::Rot3L);
                        self.emit(Op::PutArrayEl);
                    }
                } else {
                    let atom = self.member_atom(property)?;
                    self.emit(Op::Dup);
                    self.emit(Op::GetField);
                    self.emit_u16(atom);
                    if prefix {
                        self.emit(if inc { Op::Inc } else { Op::Dec });
                        // [obj, new] -> [new, obj, new]
                        self.emit(Op::Insert2);
                        self.emit(Op::PutField);
                        self.emit_u16(atom);
                    } else {
                        self.emit(if inc { Op::PostInc } else { Op::PostDec });
                        // [obj, old, new] -> [old, obj, new]
                        self.emit(Op::Perm3);
                        self.emit(Op::PutField);
                        self.emit_u16(atom);
                    }
                }
            }
            _ => return Err(self.error("invalid update expression target", span)),
        }
        Ok(())
    }

    fn compile_binary(&mut self, op: &str, left: &Expr, right: &Expr) -> Result<(), JsError> {
        // Short-circuit forms; simple right-hand sides use the dedicated
        // non-branching opcodes
        if matches!(op, "&&" | "||" | "??") {
            if is_effect_free(right) {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(match op {
                    "&&" => Op::LogicalAnd,
                    "||" => Op::LogicalOr,
                    _ => Op::NullishCoalesce,
                });
                return Ok(());
            }
            self.compile_expr(left)?;
            self.emit(Op::Dup);
            let skip = match op {
                "&&" => self.emit_jump(Op::IfFalse),
                "||" => self.emit_jump(Op::IfTrue),
                _ => {
                    self.emit(Op::IsUndefinedOrNull);
                    self.emit(Op::LogicalNot);
                    self.emit_jump(Op::IfFalse)
                }
            };
            self.emit(Op::Drop);
            self.compile_expr(right)?;
            self.patch_jump(skip);
            return Ok(());
        }

        self.compile_expr(left)?;
        self.compile_expr(right)?;
        let opcode = match op {
            "+" => Op::Add,
            "-" => Op::Sub,
            "*" => Op::Mul,
            "/" => Op::Div,
            "%" => Op::Mod,
            "**" => Op::Exp,
            "&" => Op::BitAnd,
            "|" => Op::BitOr,
            "^" => Op::BitXor,
            "<<" => Op::Shl,
            ">>" => Op::Sar,
            ">>>" => Op::Shr,
            "==" => Op::Eq,
            "!=" => Op::Neq,
            "===" => Op::StrictEq,
            "!==" => Op::StrictNeq,
            "<" => Op::Lt,
            "<=" => Op::Lte,
            ">" => Op::Gt,
            ">=" => Op::Gte,
            "instanceof" => Op::InstanceOf,
            "in" => Op::In,
            other => {
                return Err(JsError::syntax(
                    format!("unknown binary operator '{}'", other),
                    left.span.location(),
                ))
            }
        };
        self.emit(opcode);
        Ok(())
    }

    fn compile_assign(
        &mut self,
        op: &str,
        target: &Expr,
        value: &Expr,
        span: Span,
    ) -> Result<(), JsError> {
        // Logical assignment only stores when the short-circuit admits it
        if matches!(op, "&&=" | "||=" | "??=") {
            let ExprKind::Identifier(ref name) = target.kind else {
                return Err(self.error("unsupported logical assignment target", span));
            };
            self.load_binding(name);
            self.emit(Op::Dup);
            let skip = match op {
                "&&=" => self.emit_jump(Op::IfFalse),
                "||=" => self.emit_jump(Op::IfTrue),
                _ => {
                    self.emit(Op::IsUndefinedOrNull);
                    self.emit(Op::LogicalNot);
                    self.emit_jump(Op::IfFalse)
                }
            };
            self.emit(Op::Drop);
            self.compile_expr(value)?;
            self.emit(Op::Dup);
            self.store_binding(name, span, false)?;
            self.patch_jump(skip);
            return Ok(());
        }

        let compound = op
            .strip_suffix('=')
            .filter(|prefix| !prefix.is_empty() && !matches!(*prefix, "=" | "!" | "<" | ">"));

        match target.kind {
            ExprKind::Identifier(ref name) => {
                match compound {
                    Some(binop) => {
                        self.load_binding(name);
                        self.compile_expr(value)?;
                        self.emit_compound_op(binop, span)?;
                    }
                    None => self.compile_expr(value)?,
                }
                self.emit(Op::Dup);
                self.store_binding(name, span, false)?;
            }
            ExprKind::Member { ref object, ref property, computed, .. } => {
                if matches!(object.kind, ExprKind::Super) {
                    return Err(self.error("assignment to super properties is not supported", span));
                }
                self.compile_expr(object)?;
                if computed {
                    self.compile_expr(property)?;
                    match compound {
                        Some(binop) => {
                            self.emit(Op::Dup2);
                            self.emit(Op::GetArrayEl);
                            self.compile_expr(value)?;
                            self.emit_compound_op(binop, span)?;
                        }
                        None => self.compile_expr(value)?,
                    }
                    // [obj, key, v] -> [v, obj, key, v]
                    self.emit(Op::Insert3);
                    self.emit(Op::PutArrayEl);
                }
                else {
                    let atom = self.member_atom(property)?;
                    match compound {
                        Some(binop) => {
                            self.emit(Op::Dup);
                            self.emit(Op::GetField);
                            self.emit_u16(atom);
                            self.compile_expr(value)?;
                            self.emit_compound_op(binop, span)?;
                        }
                        None => self.compile_expr(value)?,
                    }
                    // [obj, v] -> [v, obj, v]
                    self.emit(Op::Insert2);
                    self.emit(Op::PutField);
                    self.emit_u16(atom);
                }
            }
            _ => return Err(self.error("invalid assignment target", span)),
        }
        Ok(())
    }

    fn emit_compound_op(&mut self, op: &str, span: Span) -> Result<(), JsError> {
        let opcode = match op {
            "+" => Op::Add,
            "-" => Op::Sub,
            "*" => Op::Mul,
            "/" => Op::Div,
            "%" => Op::Mod,
            "**" => Op::Exp,
            "&" => Op::BitAnd,
            "|" => Op::BitOr,
            "^" => Op::BitXor,
            "<<" => Op::Shl,
            ">>" => Op::Sar,
            ">>>" => Op::Shr,
            other => {
                return Err(self.error(format!("unknown compound assignment '{}='", other), span))
            }
        };
        self.emit(opcode);
        Ok(())
    }

    /// Assign the value on top of the stack to an expression target (for-in
    /// and for-of heads)
    fn compile_assign_to(&mut self, target: &Expr, span: Span) -> Result<(), JsError> {
        match target.kind {
            ExprKind::Identifier(ref name) => self.store_binding(name, span, false),
            ExprKind::Member { ref object, ref property, computed, .. } => {
                // [value]: rearrange to the store layout, consuming it
                self.compile_expr(object)?;
                if computed {
                    self.compile_expr(property)?;
                    // [value, obj, key] -> [obj, key, value]
                    self.emit(Op::Rot3L);
                    self.emit(Op::PutArrayEl);
                    Ok(())
                } else {
                    let atom = self.member_atom(property)?;
                    self.emit(Op::Swap);
                    self.emit(Op::PutField);
                    self.emit_u16(atom);
                    Ok(())
                }
            }
            _ => Err(self.error("invalid loop binding target", span)),
        }
    }

    fn compile_yield_star(&mut self, argument: Option<&Expr>, span: Span) -> Result<(), JsError> {
        match argument {
            Some(expr) => self.compile_expr(expr)?,
            None => return Err(self.error("yield* requires an iterable argument", span)),
        }
        self.emit(Op::ForOfStart);
        // [iter, next, off]
        let loop_start = self.here();
        self.emit(Op::ForOfNext);
        // [iter, next, off, value, done]
        let to_done = self.emit_jump(Op::IfTrue);
        self.emit(Op::Yield);
        // Resumption pushes the sent value; delegation discards it
        self.emit(Op::Drop);
        self.emit_jump_back(Op::Goto, loop_start);
        self.patch_jump(to_done);
        // [iter, next, off, value]: the delegated return value is the result
        self.emit(Op::Rot4L);
        self.emit(Op::Drop);
        self.emit(Op::Rot3L);
        self.emit(Op::Drop);
        self.emit(Op::Swap);
        self.emit(Op::Drop);
        Ok(())
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

enum CleanupSnapshot {
    Drop(usize),
    Finalizer(Rc<Vec<Stmt>>),
}

fn is_super_call_stmt(stmt: &Stmt) -> bool {
    matches!(
        stmt.kind,
        StmtKind::Expr(Expr { kind: ExprKind::Call { ref callee, .. }, .. })
            if matches!(callee.kind, ExprKind::Super)
    )
}

/// Literal-only right-hand sides can use the non-branching logical opcodes
fn is_effect_free(expr: &Expr) -> bool {
    matches!(
        expr.kind,
        ExprKind::Number(_)
            | ExprKind::Str(_)
            | ExprKind::Bool(_)
            | ExprKind::Null
            | ExprKind::This
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn compile(src: &str) -> Rc<Bytecode> {
        let program = parse(src, false, false).expect("parse error");
        compile_program(&program).expect("compile error")
    }

    fn listing(src: &str) -> String {
        compile(src).disassemble()
    }

    #[test]
    fn test_simple_expression_lowering() {
        let out = listing("1 + 2");
        assert!(out.contains("Push1"));
        assert!(out.contains("Push2"));
        assert!(out.contains("Add"));
        assert!(out.contains("Return"));
    }

    #[test]
    fn test_small_int_opcodes_selected() {
        let out = listing("let a = 100; let b = 1000; let c = 100000; let d = 1.5;");
        assert!(out.contains("PushI8"));
        assert!(out.contains("PushI16"));
        assert!(out.contains("PushI32"));
        assert!(out.contains("PushConst"));
    }

    #[test]
    fn test_let_gets_tdz_sentinel_and_checked_reads() {
        let out = listing("let a = 1; a");
        assert!(out.contains("SetLocUninitialized"));
        assert!(out.contains("GetLocCheck"));
        let out = listing("var a = 1; a");
        assert!(!out.contains("SetLocUninitialized"));
    }

    #[test]
    fn test_per_iteration_let_emits_close_loc() {
        let out = listing("for (let i = 0; i < 3; i++) { i; }");
        assert!(out.contains("CloseLoc"));
        let out = listing("for (var i = 0; i < 3; i++) { i; }");
        assert!(!out.contains("CloseLoc"));
    }

    #[test]
    fn test_capture_resolution_chain() {
        // x flows: outer local -> mid capture -> inner capture
        let bytecode = compile(
            "function outer() { let x = 1; return function mid() { return function inner() { return x; }; }; }",
        );
        let Constant::Function(ref outer) = bytecode.constants[0] else {
            panic!("expected outer template");
        };
        let Some(Constant::Function(mid)) = outer
            .bytecode
            .constants
            .iter()
            .find(|c| matches!(c, Constant::Function(_)))
        else {
            panic!("expected mid template");
        };
        assert_eq!(mid.captures.len(), 1);
        assert!(matches!(mid.captures[0], CaptureSource::ParentLocal(_)));
        let Some(Constant::Function(inner)) = mid
            .bytecode
            .constants
            .iter()
            .find(|c| matches!(c, Constant::Function(_)))
        else {
            panic!("expected inner template");
        };
        assert_eq!(inner.captures.len(), 1);
        assert!(matches!(inner.captures[0], CaptureSource::ParentCapture(0)));
    }

    #[test]
    fn test_return_call_becomes_tail_call() {
        let bytecode = compile("function f() { return g(); }");
        let Constant::Function(ref f) = bytecode.constants[0] else { panic!() };
        let out = f.bytecode.disassemble();
        assert!(out.contains("TailCall"), "{}", out);

        // Inside try the finalizer machinery forbids tail position
        let bytecode = compile("function f() { try { return g(); } finally { h(); } }");
        let Constant::Function(ref f) = bytecode.constants[0] else { panic!() };
        let out = f.bytecode.disassemble();
        assert!(!out.contains("TailCall"), "{}", out);
    }

    #[test]
    fn test_try_catch_uses_markers() {
        let out = listing("try { f(); } catch (e) { g(); }");
        assert!(out.contains("Catch"));
        assert!(out.contains("Drop"));
    }

    #[test]
    fn test_method_calls_keep_receiver() {
        let out = listing("a.b(1)");
        assert!(out.contains("GetField2"));
        assert!(out.contains("CallMethod"));
        let out = listing("a[k](1)");
        assert!(out.contains("GetArrayEl2"));
    }

    #[test]
    fn test_generator_body_starts_with_initial_yield() {
        let bytecode = compile("function* g() { yield 1; }");
        let Constant::Function(ref g) = bytecode.constants[0] else { panic!() };
        assert!(g.is_generator);
        assert_eq!(Op::from_u8(g.bytecode.instructions[0]), Some(Op::InitialYield));
        assert!(g.bytecode.disassemble().contains("Yield"));
    }

    #[test]
    fn test_async_body_returns_async() {
        let bytecode = compile("async function f() { return await p; }");
        let Constant::Function(ref f) = bytecode.constants[0] else { panic!() };
        assert!(f.is_async);
        let out = f.bytecode.disassemble();
        assert!(out.contains("Await"));
        assert!(out.contains("ReturnAsync"));
    }

    #[test]
    fn test_class_lowering_shape() {
        let out = listing("class A { m() {} static s() {} get g() { return 1; } }");
        assert!(out.contains("DefineClass"));
        assert!(out.contains("DefineMethod"));
        assert!(out.contains("DefineGetter"));
    }

    #[test]
    fn test_for_of_uses_iteration_opcodes() {
        let out = listing("for (const x of xs) { x; }");
        assert!(out.contains("ForOfStart"));
        assert!(out.contains("ForOfNext"));
        let out = listing("for (const k in o) { k; }");
        assert!(out.contains("ForInStart"));
        assert!(out.contains("ForInNext"));
        assert!(out.contains("ForInEnd"));
    }

    #[test]
    fn test_spread_call_goes_through_apply() {
        let out = listing("f(...xs)");
        assert!(out.contains("AppendSpread"));
        assert!(out.contains("Apply"));
        let out = listing("new F(...xs)");
        assert!(out.contains("ApplyConstructor"));
    }

    #[test]
    fn test_const_reassignment_rejected() {
        let program = parse("const a = 1; a = 2;", false, false).unwrap();
        let err = compile_program(&program).unwrap_err();
        assert!(err.message.contains("constant"));
    }

    #[test]
    fn test_regex_literal_compiles_at_lowering_time() {
        let program = parse("let re = /a(/;", false, false).unwrap();
        assert!(compile_program(&program).is_err());
        assert!(listing("let re = /a+/;").contains("PushConst"));
    }

    #[test]
    fn test_typeof_unresolved_uses_undef_variant() {
        let out = listing("typeof nothing");
        assert!(out.contains("GetVarUndef"));
        let out = listing("let x = 1; typeof x");
        assert!(!out.contains("GetVarUndef"));
    }
}
