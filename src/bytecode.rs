// File: src/bytecode.rs
//
// Bytecode instruction definitions and containers for the NanoJS VM.
// Instructions are raw bytes: one opcode byte followed by big-endian
// immediates. Defines the Op enum, the Bytecode container with its
// constant and atom pools, and the function template used by FCLOSURE.

use crate::regex::RegexBytecode;
use std::rc::Rc;

/// Bytecode instruction opcodes for the NanoJS VM.
/// Stack-based; operand widths are fixed per opcode (see `operand_size`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    // === Push / literals ===
    /// Push a 32-bit integer as a number. Operand: i32
    PushI32 = 0,
    /// Push an entry from the constant pool. Operand: u16 index
    PushConst,
    /// Push an atom-pool string as a value. Operand: u16 index
    PushAtomValue,
    Undefined,
    Null,
    PushThis,
    PushTrue,
    PushFalse,
    /// Push a fresh empty object
    Object,
    /// Push a fresh empty array
    ArrayNew,
    PushEmptyString,
    PushMinus1,
    Push0,
    Push1,
    Push2,
    Push3,
    Push4,
    Push5,
    Push6,
    Push7,
    /// Operand: i8
    PushI8,
    /// Operand: i16
    PushI16,
    /// Push a bigint from a 32-bit immediate. Operand: i32
    PushBigIntI32,

    // === Stack manipulation ===
    /// [a] -> []
    Drop,
    /// [a, b] -> [b]
    Nip,
    /// [a, b, c] -> [b, c]
    Nip1,
    /// [a] -> [a, a]
    Dup,
    /// [a, b] -> [a, a, b]
    Dup1,
    /// [a, b] -> [a, b, a, b]
    Dup2,
    /// [a, b, c] -> [a, b, c, a, b, c]
    Dup3,
    /// [a, b] -> [b, a, b]
    Insert2,
    /// [a, b, c] -> [c, a, b, c]
    Insert3,
    /// [a, b, c, d] -> [d, a, b, c, d]
    Insert4,
    /// [a, b, c] -> [b, a, c]
    Perm3,
    /// [a, b, c, d] -> [b, a, c, d]
    Perm4,
    /// [a, b, c, d, e] -> [b, a, c, d, e]
    Perm5,
    /// [a, b] -> [b, a]
    Swap,
    /// [a, b, c, d] -> [c, d, a, b]
    Swap2,
    /// [a, b, c] -> [b, c, a]
    Rot3L,
    /// [a, b, c] -> [c, a, b]
    Rot3R,
    /// [a, b, c, d] -> [b, c, d, a]
    Rot4L,
    /// [a, b, c, d, e] -> [b, c, d, e, a]
    Rot5L,

    // === Variable access ===
    /// Read a global by atom; ReferenceError when unresolved. Operand: u16
    GetVar,
    /// Read a global by atom; undefined when unresolved (typeof). Operand: u16
    GetVarUndef,
    /// Assign a global by atom (creates on the global object). Operand: u16
    PutVar,
    /// Define a global binding (var declaration). Operand: u16
    SetVar,
    /// Operand: u16 local slot
    GetLoc,
    /// Pop into a local slot. Operand: u16
    PutLoc,
    /// Store top of stack into a local slot without popping. Operand: u16
    SetLoc,
    GetLoc0,
    GetLoc1,
    GetLoc2,
    GetLoc3,
    PutLoc0,
    PutLoc1,
    PutLoc2,
    PutLoc3,
    SetLoc0,
    SetLoc1,
    SetLoc2,
    SetLoc3,
    /// Operand: u16 argument index
    GetArg,
    PutArg,
    SetArg,
    GetArg0,
    GetArg1,
    GetArg2,
    GetArg3,
    /// Read a closure cell. Operand: u16 capture slot
    GetVarRef,
    PutVarRef,
    SetVarRef,
    GetVarRef0,
    GetVarRef1,
    GetVarRef2,
    GetVarRef3,
    /// TDZ-checked reads/writes; ReferenceError on the uninitialised
    /// sentinel. Operand: u16
    GetLocCheck,
    PutLocCheck,
    GetVarRefCheck,
    PutVarRefCheck,
    /// Store the TDZ sentinel into a local slot. Operand: u16
    SetLocUninitialized,
    /// Detach the shared cell for a local (per-iteration let). Operand: u16
    CloseLoc,

    // === Property access ===
    /// [obj] -> [value]. Operand: u16 atom
    GetField,
    /// [obj] -> [obj, value]. Operand: u16 atom
    GetField2,
    /// [obj, value] -> []. Operand: u16 atom
    PutField,
    /// [obj, value] -> [obj]; define own data property. Operand: u16 atom
    DefineField,
    /// [obj, key] -> [value]
    GetArrayEl,
    /// [obj, key] -> [obj, value]
    GetArrayEl2,
    /// [obj, key, value] -> []
    PutArrayEl,
    /// [obj, key, value] -> [obj]; define own data property
    DefineProp,
    /// [obj, func] -> [obj]; also records the home object. Operand: u16 atom
    DefineMethod,
    /// [obj, key, func] -> [obj]
    DefineMethodComputed,
    /// [obj, func] -> [obj]. Operand: u16 atom
    DefineGetter,
    /// [obj, func] -> [obj]. Operand: u16 atom
    DefineSetter,
    /// [arr, value] -> [arr]; append to an array literal
    Append,
    /// [arr, iterable] -> [arr]; append all elements (spread)
    AppendSpread,
    /// [target, source] -> [target]; own enumerable copy (object spread)
    CopyDataProperties,
    /// [obj, proto] -> [obj]
    SetProto,
    /// Push the prototype of the current function object (super ctor)
    PushSuperCtor,
    /// Push the prototype of the home object (super.x base)
    PushHomeProto,

    // === Arithmetic / comparison / logic ===
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Exp,
    /// Unary plus (ToNumber)
    Plus,
    Neg,
    Inc,
    Dec,
    /// [v] -> [old, new]; numeric post-increment pair
    PostInc,
    PostDec,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    Shl,
    /// Arithmetic right shift
    Sar,
    /// Unsigned right shift
    Shr,
    LogicalNot,
    Eq,
    Neq,
    StrictEq,
    StrictNeq,
    Lt,
    Lte,
    Gt,
    Gte,
    InstanceOf,
    In,
    /// [l, r] -> [l or r]; no coercion of the result
    LogicalAnd,
    LogicalOr,
    NullishCoalesce,

    // === Control flow ===
    /// Operand: i32 relative offset
    IfFalse,
    IfTrue,
    Goto,
    /// Operand: i8
    IfFalse8,
    IfTrue8,
    Goto8,
    /// Operand: i16
    Goto16,
    /// Push a catch-offset marker. Operand: i32 relative handler offset
    Catch,
    /// Remove the catch marker under the top value
    NipCatch,

    // === Calls and constructors ===
    /// [callee, this, args...] -> [result]. Operand: u16 argc
    Call,
    CallMethod,
    TailCall,
    TailCallMethod,
    /// [ctor, this?, args...] -> [instance]. Operand: u16 argc
    CallConstructor,
    Call0,
    Call1,
    Call2,
    Call3,
    /// [func, this, args_array] -> [result]
    Apply,
    ApplyEval,
    /// [ctor, args_array] -> [instance]; spread construction
    ApplyConstructor,
    /// Push an array of the arguments from an index on. Operand: u16
    Rest,
    Return,
    ReturnUndef,
    /// Return from an async body; the call wrapper boxes the promise
    ReturnAsync,

    // === Exceptions ===
    Throw,
    /// Construct and throw an error. Operands: u16 message atom, u8 type
    ThrowError,

    // === Type queries ===
    TypeOf,
    /// [obj, key] -> [ok]
    Delete,
    IsUndefined,
    IsNull,
    IsUndefinedOrNull,
    TypeofIsUndefined,
    TypeofIsFunction,

    // === Iteration ===
    /// [iterable] -> [iter, next, catch_offset]
    ForOfStart,
    /// [iter, next, off] -> [iter, next, off, value, done]
    ForOfNext,
    ForAwaitOfStart,
    /// Like ForOfNext but leaves the raw promise from next()
    ForAwaitOfNext,
    /// [obj] -> [keys, index]
    ForInStart,
    /// [keys, index] -> [keys, index', key, done]
    ForInNext,
    /// Drop the for-in state
    ForInEnd,

    // === Generators / async ===
    /// Fires once at generator construction
    InitialYield,
    /// [v] -> suspended; resume pushes the sent value
    Yield,
    /// [v] -> [awaited]
    Await,

    // === Closures / classes ===
    /// Materialise a closure from a constant-pool template. Operand: u16
    Fclosure,
    /// Build a class: constructor closure plus wired prototype object.
    /// Operands: u16 constructor template index, u8 has-superclass flag.
    /// [parent?] -> [ctor, proto]
    DefineClass,

    Nop,
}

pub const OP_COUNT: u8 = Op::Nop as u8 + 1;

impl Op {
    pub fn from_u8(byte: u8) -> Option<Op> {
        if byte < OP_COUNT {
            // SAFETY: Op is repr(u8) with contiguous discriminants from 0
            Some(unsafe { std::mem::transmute::<u8, Op>(byte) })
        } else {
            None
        }
    }

    /// Operand byte count following the opcode byte
    pub fn operand_size(self) -> usize {
        match self {
            Op::PushI32 | Op::PushBigIntI32 => 4,
            Op::PushI8 => 1,
            Op::PushI16 => 2,
            Op::PushConst | Op::PushAtomValue => 2,
            Op::GetVar | Op::GetVarUndef | Op::PutVar | Op::SetVar => 2,
            Op::GetLoc | Op::PutLoc | Op::SetLoc => 2,
            Op::GetArg | Op::PutArg | Op::SetArg => 2,
            Op::GetVarRef | Op::PutVarRef | Op::SetVarRef => 2,
            Op::GetLocCheck
            | Op::PutLocCheck
            | Op::GetVarRefCheck
            | Op::PutVarRefCheck
            | Op::SetLocUninitialized
            | Op::CloseLoc => 2,
            Op::GetField
            | Op::GetField2
            | Op::PutField
            | Op::DefineField
            | Op::DefineMethod
            | Op::DefineGetter
            | Op::DefineSetter => 2,
            Op::IfFalse | Op::IfTrue | Op::Goto | Op::Catch => 4,
            Op::IfFalse8 | Op::IfTrue8 | Op::Goto8 => 1,
            Op::Goto16 => 2,
            Op::Call
            | Op::CallMethod
            | Op::TailCall
            | Op::TailCallMethod
            | Op::CallConstructor => 2,
            Op::ThrowError => 3,
            Op::Fclosure => 2,
            Op::DefineClass => 3,
            Op::Rest => 2,
            _ => 0,
        }
    }

    pub fn size(self) -> usize {
        1 + self.operand_size()
    }
}

/// Constant-pool entry
#[derive(Debug, Clone)]
pub enum Constant {
    Number(f64),
    String(Rc<str>),
    BigInt(i128),
    Regex(Rc<RegexBytecode>),
    Function(Rc<FunctionTemplate>),
}

/// Where an FCLOSURE capture comes from, resolved at compile time by the
/// capture-resolver chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    /// A local slot of the enclosing frame
    ParentLocal(u16),
    /// An existing cell in the enclosing function's captures
    ParentCapture(u16),
}

/// A compiled function body plus the metadata FCLOSURE needs
#[derive(Debug)]
pub struct FunctionTemplate {
    pub name: String,
    pub bytecode: Rc<Bytecode>,
    pub param_count: usize,
    pub is_generator: bool,
    pub is_async: bool,
    pub is_arrow: bool,
    /// Method shorthand / class method: not constructible, carries a home
    /// object for `super`
    pub is_method: bool,
    /// Class constructor whose class has an `extends` clause
    pub is_derived_ctor: bool,
    pub captures: Vec<CaptureSource>,
}

/// A compiled bytecode unit: raw instructions plus its pools
#[derive(Debug, Default)]
pub struct Bytecode {
    pub instructions: Vec<u8>,
    pub constants: Vec<Constant>,
    pub atoms: Vec<Rc<str>>,
    pub local_count: usize,
    /// Parallel to the local slots, for diagnostics
    pub local_names: Vec<String>,
    pub arg_count: usize,
    pub strict: bool,
}

impl Bytecode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn here(&self) -> usize {
        self.instructions.len()
    }

    pub fn emit_op(&mut self, op: Op) -> usize {
        let at = self.instructions.len();
        self.instructions.push(op as u8);
        at
    }

    pub fn emit_u8(&mut self, v: u8) {
        self.instructions.push(v);
    }

    pub fn emit_u16(&mut self, v: u16) {
        self.instructions.extend_from_slice(&v.to_be_bytes());
    }

    pub fn emit_i16(&mut self, v: i16) {
        self.instructions.extend_from_slice(&v.to_be_bytes());
    }

    pub fn emit_i32(&mut self, v: i32) {
        self.instructions.extend_from_slice(&v.to_be_bytes());
    }

    pub fn emit_u32(&mut self, v: u32) {
        self.instructions.extend_from_slice(&v.to_be_bytes());
    }

    /// Patch a previously emitted i32 operand
    pub fn patch_i32(&mut self, at: usize, v: i32) {
        self.instructions[at..at + 4].copy_from_slice(&v.to_be_bytes());
    }

    pub fn read_u8(&self, at: usize) -> u8 {
        self.instructions[at]
    }

    pub fn read_u16(&self, at: usize) -> u16 {
        u16::from_be_bytes([self.instructions[at], self.instructions[at + 1]])
    }

    pub fn read_i16(&self, at: usize) -> i16 {
        self.read_u16(at) as i16
    }

    pub fn read_i32(&self, at: usize) -> i32 {
        i32::from_be_bytes([
            self.instructions[at],
            self.instructions[at + 1],
            self.instructions[at + 2],
            self.instructions[at + 3],
        ])
    }

    pub fn read_i8(&self, at: usize) -> i8 {
        self.instructions[at] as i8
    }

    /// Intern a string into the atom pool
    pub fn atom(&mut self, s: &str) -> u16 {
        if let Some(found) = self.atoms.iter().position(|a| a.as_ref() == s) {
            return found as u16;
        }
        self.atoms.push(Rc::from(s));
        (self.atoms.len() - 1) as u16
    }

    pub fn atom_str(&self, index: u16) -> &str {
        &self.atoms[index as usize]
    }

    pub fn add_constant(&mut self, constant: Constant) -> u16 {
        let index = self.constants.len();
        self.constants.push(constant);
        index as u16
    }

    /// Human-readable listing, used by `--dump-bytecode`
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let mut pc = 0usize;
        while pc < self.instructions.len() {
            let byte = self.instructions[pc];
            let op = match Op::from_u8(byte) {
                Some(op) => op,
                None => {
                    out.push_str(&format!("{:5}  <bad opcode {}>\n", pc, byte));
                    break;
                }
            };
            out.push_str(&format!("{:5}  {:?}", pc, op));
            match op.operand_size() {
                0 => {}
                1 => out.push_str(&format!(" {}", self.read_i8(pc + 1))),
                2 => out.push_str(&format!(" {}", self.read_u16(pc + 1))),
                3 => out.push_str(&format!(
                    " {} {}",
                    self.read_u16(pc + 1),
                    self.read_u8(pc + 3)
                )),
                4 => out.push_str(&format!(" {}", self.read_i32(pc + 1))),
                _ => {}
            }
            match op {
                Op::GetVar | Op::PutVar | Op::SetVar | Op::GetField | Op::GetField2
                | Op::PutField | Op::DefineField | Op::PushAtomValue | Op::DefineMethod
                | Op::DefineGetter | Op::DefineSetter => {
                    let atom = self.read_u16(pc + 1);
                    out.push_str(&format!("  ; '{}'", self.atom_str(atom)));
                }
                _ => {}
            }
            out.push('\n');
            pc += op.size();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for byte in 0..OP_COUNT {
            let op = Op::from_u8(byte).expect("valid opcode byte");
            assert_eq!(op as u8, byte);
        }
        assert!(Op::from_u8(OP_COUNT).is_none());
    }

    #[test]
    fn test_big_endian_operands() {
        let mut bc = Bytecode::new();
        bc.emit_op(Op::PushI32);
        bc.emit_i32(0x0102_0304);
        assert_eq!(&bc.instructions[1..5], &[1, 2, 3, 4]);
        assert_eq!(bc.read_i32(1), 0x0102_0304);
        bc.patch_i32(1, -1);
        assert_eq!(bc.read_i32(1), -1);
    }

    #[test]
    fn test_atom_interning_dedupes() {
        let mut bc = Bytecode::new();
        let a = bc.atom("foo");
        let b = bc.atom("bar");
        let c = bc.atom("foo");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(bc.atom_str(b), "bar");
    }

    #[test]
    fn test_disassemble_walks_operands() {
        let mut bc = Bytecode::new();
        let atom = bc.atom("x");
        bc.emit_op(Op::GetVar);
        bc.emit_u16(atom);
        bc.emit_op(Op::Push1);
        bc.emit_op(Op::Add);
        bc.emit_op(Op::Return);
        let listing = bc.disassemble();
        assert!(listing.contains("GetVar"));
        assert!(listing.contains("'x'"));
        assert!(listing.contains("Return"));
    }
}
