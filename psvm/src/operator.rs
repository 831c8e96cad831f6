//! Multiple dispatch over runtime operand types.
//!
//! Every name owns an ordered list of signatures stored in the global memory.
//! Dispatch tries them in registration order and invokes the first one whose
//! pattern matches the top of the operand stack.
use std::{collections::HashMap, io::Write};

use ahash::RandomState;
use log::{trace, warn};

use crate::{
    Bank, Context, ContextHost, EntityId, EntityKind, EntityTag, Memory, NameId, Names, Object,
    OpResult, SegmentedStack, Type, VmError, VmSettings,
};

pub const MAX_ARITY: usize = 8;

const ENTRY_SIZE: u32 = 12;
const SIGNATURE_SIZE: u32 = 16;
const INITIAL_ENTRIES: u32 = 32;
const INITIAL_SIGNATURES: u32 = 2;

/// Handle of a registered operator name.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Opcode(pub u32);

/// A native operator body. Arguments are passed deepest operand first.
#[derive(Copy, Clone)]
pub enum NativeFn {
    Arity0(fn(&mut OpContext<'_>) -> OpResult),
    Arity1(fn(&mut OpContext<'_>, Object) -> OpResult),
    Arity2(fn(&mut OpContext<'_>, Object, Object) -> OpResult),
    Arity3(fn(&mut OpContext<'_>, Object, Object, Object) -> OpResult),
    Arity4(fn(&mut OpContext<'_>, Object, Object, Object, Object) -> OpResult),
    Arity5(fn(&mut OpContext<'_>, Object, Object, Object, Object, Object) -> OpResult),
    Arity6(fn(&mut OpContext<'_>, Object, Object, Object, Object, Object, Object) -> OpResult),
    Arity7(
        fn(&mut OpContext<'_>, Object, Object, Object, Object, Object, Object, Object) -> OpResult,
    ),
    #[allow(clippy::type_complexity)]
    Arity8(
        fn(
            &mut OpContext<'_>,
            Object,
            Object,
            Object,
            Object,
            Object,
            Object,
            Object,
            Object,
        ) -> OpResult,
    ),
}

impl NativeFn {
    pub fn arity(&self) -> usize {
        match self {
            NativeFn::Arity0(_) => 0,
            NativeFn::Arity1(_) => 1,
            NativeFn::Arity2(_) => 2,
            NativeFn::Arity3(_) => 3,
            NativeFn::Arity4(_) => 4,
            NativeFn::Arity5(_) => 5,
            NativeFn::Arity6(_) => 6,
            NativeFn::Arity7(_) => 7,
            NativeFn::Arity8(_) => 8,
        }
    }

    fn call(self, ctx: &mut OpContext<'_>, a: &[Object]) -> OpResult {
        debug_assert_eq!(a.len(), self.arity());
        match self {
            NativeFn::Arity0(f) => f(ctx),
            NativeFn::Arity1(f) => f(ctx, a[0]),
            NativeFn::Arity2(f) => f(ctx, a[0], a[1]),
            NativeFn::Arity3(f) => f(ctx, a[0], a[1], a[2]),
            NativeFn::Arity4(f) => f(ctx, a[0], a[1], a[2], a[3]),
            NativeFn::Arity5(f) => f(ctx, a[0], a[1], a[2], a[3], a[4]),
            NativeFn::Arity6(f) => f(ctx, a[0], a[1], a[2], a[3], a[4], a[5]),
            NativeFn::Arity7(f) => f(ctx, a[0], a[1], a[2], a[3], a[4], a[5], a[6]),
            NativeFn::Arity8(f) => f(ctx, a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7]),
        }
    }
}

impl std::fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeFn/{}", self.arity())
    }
}

/// One element of a signature's type pattern.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Pattern {
    Type(Type),
    Any,
    /// integer or real, left as is
    Number,
    /// integer or real, integers are promoted in place
    Float,
    /// executable array
    Proc,
}

impl Pattern {
    const ANY: u8 = 0xf0;
    const NUMBER: u8 = 0xf1;
    const FLOAT: u8 = 0xf2;
    const PROC: u8 = 0xf3;
    const UNUSED: u8 = 0xff;

    fn encode(self) -> u8 {
        match self {
            Pattern::Type(ty) => ty as u8,
            Pattern::Any => Self::ANY,
            Pattern::Number => Self::NUMBER,
            Pattern::Float => Self::FLOAT,
            Pattern::Proc => Self::PROC,
        }
    }

    fn decode(byte: u8) -> Option<Self> {
        match byte {
            Self::ANY => Some(Pattern::Any),
            Self::NUMBER => Some(Pattern::Number),
            Self::FLOAT => Some(Pattern::Float),
            Self::PROC => Some(Pattern::Proc),
            other => Type::from_u8(other).map(Pattern::Type),
        }
    }

    #[inline]
    pub fn accepts(self, obj: &Object) -> bool {
        match self {
            Pattern::Type(ty) => obj.ty() == ty,
            Pattern::Any => true,
            Pattern::Number | Pattern::Float => obj.ty().is_number(),
            Pattern::Proc => obj.is_proc(),
        }
    }

    #[inline]
    fn promotes(self, obj: &Object) -> bool {
        self == Pattern::Float && obj.ty() == Type::Integer
    }
}

/// Precomputed checks for the most common patterns.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum FastCheck {
    None = 0,
    Any1 = 1,
    Any2 = 2,
    Int2 = 3,
    Float2 = 4,
    Proc1 = 5,
}

impl FastCheck {
    fn for_pattern(pattern: &[Pattern]) -> Self {
        const INT: Pattern = Pattern::Type(Type::Integer);
        match pattern {
            [Pattern::Any] => FastCheck::Any1,
            [Pattern::Any, Pattern::Any] => FastCheck::Any2,
            [INT, INT] => FastCheck::Int2,
            [Pattern::Float, Pattern::Float] => FastCheck::Float2,
            [Pattern::Proc] => FastCheck::Proc1,
            _ => FastCheck::None,
        }
    }

    fn from_u8(byte: u8) -> Self {
        match byte {
            1 => FastCheck::Any1,
            2 => FastCheck::Any2,
            3 => FastCheck::Int2,
            4 => FastCheck::Float2,
            5 => FastCheck::Proc1,
            _ => FastCheck::None,
        }
    }

    /// Validate the top of the stack. Promotion is left to the invocation.
    fn check(self, operands: &SegmentedStack) -> bool {
        let first = operands.topdown_fetch(0);
        let second = operands.topdown_fetch(1);
        match (self, first, second) {
            (FastCheck::None, ..) => false,
            (FastCheck::Any1, Some(_), _) => true,
            (FastCheck::Any2, Some(_), Some(_)) => true,
            (FastCheck::Int2, Some(a), Some(b)) => {
                a.ty() == Type::Integer && b.ty() == Type::Integer
            }
            (FastCheck::Proc1, Some(a), _) => a.is_proc(),
            (FastCheck::Float2, Some(a), Some(b)) => a.ty().is_number() && b.ty().is_number(),
            _ => false,
        }
    }
}

/// A decoded signature record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Signature {
    patterns: [u8; MAX_ARITY],
    pub in_arity: u8,
    pub out_arity: u8,
    fast: u8,
    native: u32,
}

impl Signature {
    pub fn pattern(&self, index: usize) -> Option<Pattern> {
        if index >= self.in_arity as usize {
            return None;
        }
        Pattern::decode(self.patterns[index])
    }

    fn encode(&self) -> [u8; SIGNATURE_SIZE as usize] {
        let mut out = [0u8; SIGNATURE_SIZE as usize];
        out[..MAX_ARITY].copy_from_slice(&self.patterns);
        out[8] = self.in_arity;
        out[9] = self.out_arity;
        out[10] = self.fast;
        out[12..16].copy_from_slice(&self.native.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut patterns = [0u8; MAX_ARITY];
        patterns.copy_from_slice(&bytes[..MAX_ARITY]);
        Self {
            patterns,
            in_arity: bytes[8],
            out_arity: bytes[9],
            fast: bytes[10],
            native: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        }
    }

    fn matches(&self, operands: &SegmentedStack) -> Match {
        let need = self.in_arity as usize;
        if operands.count() < need {
            return Match::Short;
        }
        for depth in 0..need {
            let accepted = match (operands.topdown_fetch(depth), self.pattern(need - 1 - depth)) {
                (Some(obj), Some(pattern)) => pattern.accepts(&obj),
                _ => false,
            };
            if !accepted {
                return Match::Type;
            }
        }
        Match::Full
    }

    fn promote(&self, operands: &mut SegmentedStack) -> Result<(), VmError> {
        let need = self.in_arity as usize;
        for depth in 0..need {
            let fetched = operands.topdown_fetch(depth);
            let (Some(obj), Some(pattern)) = (fetched, self.pattern(need - 1 - depth)) else {
                continue;
            };
            if pattern.promotes(&obj) {
                operands.topdown_replace(depth, obj.promoted())?;
            }
        }
        Ok(())
    }
}

enum Match {
    Full,
    /// fewer operands than the signature takes
    Short,
    Type,
}

#[derive(Debug, Copy, Clone)]
struct Entry {
    name: NameId,
    signatures: EntityId,
    count: u32,
}

impl Entry {
    fn encode(&self) -> [u8; ENTRY_SIZE as usize] {
        let mut out = [0u8; ENTRY_SIZE as usize];
        out[0..4].copy_from_slice(&self.name.0.to_le_bytes());
        out[4..8].copy_from_slice(&self.signatures.0.to_le_bytes());
        out[8..12].copy_from_slice(&self.count.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Self {
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        Self {
            name: NameId(word(0)),
            signatures: EntityId(word(4)),
            count: word(8),
        }
    }
}

/// Operators the context machinery refers to directly.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SystemOps {
    pub zombie: Opcode,
    pub free: Opcode,
    pub join: Opcode,
}

/// Everything a native operator may touch.
pub struct OpContext<'a> {
    pub global: &'a mut Memory,
    pub names: &'a Names,
    pub operators: &'a OperatorTable,
    pub system: SystemOps,
    pub settings: &'a VmSettings,
    pub context: &'a mut Context,
    pub host: &'a mut dyn ContextHost,
    pub out: &'a mut dyn Write,
}

impl OpContext<'_> {
    #[inline]
    pub fn push(&mut self, obj: Object) -> OpResult {
        self.context.stacks.operands.push(obj)
    }

    #[inline]
    pub fn pop(&mut self) -> Result<Object, VmError> {
        self.context
            .stacks
            .operands
            .pop()
            .ok_or(VmError::StackUnderflow)
    }

    pub fn memory(&self, bank: Bank) -> &Memory {
        match bank {
            Bank::Global => &*self.global,
            Bank::Local => &self.context.local,
        }
    }

    pub fn memory_mut(&mut self, bank: Bank) -> &mut Memory {
        match bank {
            Bank::Global => &mut *self.global,
            Bank::Local => &mut self.context.local,
        }
    }

    /// A literal name object.
    pub fn name(&self, value: &str) -> Object {
        Object::name(self.names.intern(value))
    }
}

/// Registry of operator names and their signatures.
///
/// Entries and signature lists live in `System` entities of the global
/// memory and are looked up there on every dispatch. Only the native
/// function pointers and the name index stay on the Rust side.
pub struct OperatorTable {
    entries: EntityId,
    len: u32,
    natives: Vec<NativeFn>,
    by_name: HashMap<NameId, Opcode, RandomState>,
}

impl std::fmt::Debug for OperatorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorTable")
            .field("entries", &self.len)
            .field("natives", &self.natives.len())
            .finish()
    }
}

impl OperatorTable {
    pub fn new(global: &mut Memory) -> Result<Self, VmError> {
        let entries = global.allocate_without_gc(
            INITIAL_ENTRIES * ENTRY_SIZE,
            EntityTag::new(EntityKind::System),
        )?;
        Ok(Self {
            entries,
            len: 0,
            natives: Vec::new(),
            by_name: HashMap::with_hasher(RandomState::new()),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn lookup(&self, name: NameId) -> Option<Opcode> {
        self.by_name.get(&name).copied()
    }

    /// Find or create the entry for `name`. A fresh entry has no signatures.
    pub fn declare(&mut self, global: &mut Memory, name: NameId) -> Result<Opcode, VmError> {
        if let Some(opcode) = self.lookup(name) {
            return Ok(opcode);
        }
        let needed = (self.len + 1)
            .checked_mul(ENTRY_SIZE)
            .ok_or(VmError::LimitCheck)?;
        let size = global.get_size(self.entries)?;
        if needed > size {
            let grown = size.saturating_mul(2).max(needed);
            self.entries = global.realloc_without_gc(self.entries, grown)?;
        }
        let opcode = Opcode(self.len);
        let entry = Entry {
            name,
            signatures: EntityId::FREE_HEAD,
            count: 0,
        };
        self.write_entry(global, opcode, entry)?;
        self.len += 1;
        self.by_name.insert(name, opcode);
        Ok(opcode)
    }

    /// Append a signature to `name`, creating the entry if needed. Input arity
    /// is the length of `pattern` and has to match the native function.
    pub fn cons(
        &mut self,
        global: &mut Memory,
        name: NameId,
        native: NativeFn,
        out_arity: u8,
        pattern: &[Pattern],
    ) -> Result<Opcode, VmError> {
        if pattern.len() > MAX_ARITY || native.arity() != pattern.len() {
            warn!(
                "signature of arity {} does not fit a native of arity {}",
                pattern.len(),
                native.arity()
            );
            return Err(VmError::InvalidSignature);
        }
        let opcode = self.declare(global, name)?;
        let mut entry = self.entry(global, opcode)?;

        let needed = (entry.count + 1) * SIGNATURE_SIZE;
        if entry.signatures == EntityId::FREE_HEAD {
            entry.signatures = global.allocate_without_gc(
                INITIAL_SIGNATURES * SIGNATURE_SIZE,
                EntityTag::new(EntityKind::System),
            )?;
        } else {
            let size = global.get_size(entry.signatures)?;
            if needed > size {
                entry.signatures = global.realloc_without_gc(entry.signatures, size * 2)?;
            }
        }

        let mut patterns = [Pattern::UNUSED; MAX_ARITY];
        for (slot, element) in patterns.iter_mut().zip(pattern) {
            *slot = element.encode();
        }
        let signature = Signature {
            patterns,
            in_arity: pattern.len() as u8,
            out_arity,
            fast: FastCheck::for_pattern(pattern) as u8,
            native: self.natives.len() as u32,
        };
        global.put(
            entry.signatures,
            entry.count * SIGNATURE_SIZE,
            &signature.encode(),
        )?;
        self.natives.push(native);
        entry.count += 1;
        self.write_entry(global, opcode, entry)?;
        trace!("cons {opcode:?} signature #{} {pattern:?}", entry.count);
        Ok(opcode)
    }

    /// The executable operator object for `opcode`.
    pub fn cons_opcode(&self, opcode: Opcode) -> Object {
        Object::operator(opcode)
    }

    pub fn name_of(&self, global: &Memory, opcode: Opcode) -> Result<NameId, VmError> {
        Ok(self.entry(global, opcode)?.name)
    }

    pub fn signatures(&self, global: &Memory, opcode: Opcode) -> Result<Vec<Signature>, VmError> {
        let entry = self.entry(global, opcode)?;
        (0..entry.count)
            .map(|index| self.signature(global, entry.signatures, index))
            .collect()
    }

    fn entry(&self, global: &Memory, opcode: Opcode) -> Result<Entry, VmError> {
        if opcode.0 >= self.len {
            return Err(VmError::Unregistered);
        }
        let bytes = global.bytes_at(self.entries, opcode.0 * ENTRY_SIZE, ENTRY_SIZE)?;
        Ok(Entry::decode(bytes))
    }

    fn write_entry(&self, global: &mut Memory, opcode: Opcode, entry: Entry) -> OpResult {
        global.put(self.entries, opcode.0 * ENTRY_SIZE, &entry.encode())
    }

    fn signature(&self, global: &Memory, list: EntityId, index: u32) -> Result<Signature, VmError> {
        let bytes = global.bytes_at(list, index * SIGNATURE_SIZE, SIGNATURE_SIZE)?;
        Ok(Signature::decode(bytes))
    }

    /// Dispatch `opcode` against the current operand stack.
    pub fn exec(&self, opcode: Opcode, ctx: &mut OpContext<'_>) -> OpResult {
        ctx.context.restore_arity = None;
        let entry = self.entry(ctx.global, opcode)?;
        if entry.count == 0 {
            return Err(VmError::Unregistered);
        }
        let mut error = VmError::TypeCheck;
        let mut chosen = None;
        for index in 0..entry.count {
            let signature = self.signature(ctx.global, entry.signatures, index)?;
            let operands = &ctx.context.stacks.operands;
            if FastCheck::from_u8(signature.fast).check(operands) {
                chosen = Some(signature);
                break;
            }
            match signature.matches(operands) {
                Match::Full => {
                    chosen = Some(signature);
                    break;
                }
                Match::Short => error = VmError::StackUnderflow,
                Match::Type => {}
            }
        }
        match chosen {
            Some(signature) => self.invoke(opcode, signature, ctx),
            None => {
                trace!("dispatch of {opcode:?} failed: {error}");
                Err(error)
            }
        }
    }

    fn invoke(&self, opcode: Opcode, signature: Signature, ctx: &mut OpContext<'_>) -> OpResult {
        let need = signature.in_arity as usize;
        let stacks = &mut ctx.context.stacks;
        let after = stacks.operands.count() - need + signature.out_arity as usize;
        if after > stacks.operands.limit() {
            return Err(VmError::StackOverflow);
        }
        if stacks.hold.count() + need > stacks.hold.limit() {
            return Err(VmError::LimitCheck);
        }
        signature.promote(&mut stacks.operands)?;
        let mut args = [Object::NULL; MAX_ARITY];
        for slot in args[..need].iter_mut().rev() {
            *slot = stacks.operands.pop().ok_or(VmError::StackUnderflow)?;
        }
        for arg in &args[..need] {
            stacks.hold.push(*arg)?;
        }
        ctx.context.restore_arity =
            (ctx.context.current.as_opcode() == Some(opcode)).then_some(need as u8);

        let native = self
            .natives
            .get(signature.native as usize)
            .copied()
            .ok_or(VmError::Unregistered)?;
        let result = native.call(ctx, &args[..need]);

        let keep_for_handler = matches!(&result, Err(err) if !err.is_control_signal())
            && ctx.context.restore_arity.is_some();
        if !keep_for_handler {
            ctx.context.stacks.hold.drop_top(need)?;
        }
        result
    }
}
