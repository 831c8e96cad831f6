use std::fmt;

use bitflags::bitflags;

use crate::{Bank, ContextId, EntityId, NameId, Opcode, SaveLevel, VmError};

/// Size of an encoded [`Object`] inside an array or dict entity.
pub const OBJECT_SIZE: u32 = 16;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Null = 0,
    Integer = 1,
    Real = 2,
    Boolean = 3,
    Mark = 4,
    Operator = 5,
    Context = 6,
    Name = 7,
    Save = 8,
    String = 9,
    Array = 10,
    Dict = 11,
    File = 12,
}

impl Type {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Type::Null,
            1 => Type::Integer,
            2 => Type::Real,
            3 => Type::Boolean,
            4 => Type::Mark,
            5 => Type::Operator,
            6 => Type::Context,
            7 => Type::Name,
            8 => Type::Save,
            9 => Type::String,
            10 => Type::Array,
            11 => Type::Dict,
            12 => Type::File,
            _ => return None,
        })
    }

    /// Composite objects refer to entity storage instead of carrying their value.
    #[inline]
    pub fn is_composite(self) -> bool {
        matches!(self, Type::String | Type::Array | Type::Dict | Type::File)
    }

    #[inline]
    pub fn is_number(self) -> bool {
        matches!(self, Type::Integer | Type::Real)
    }

    /// Name as reported by the `type` operator.
    pub fn name(self) -> &'static str {
        match self {
            Type::Null => "nulltype",
            Type::Integer => "integertype",
            Type::Real => "realtype",
            Type::Boolean => "booleantype",
            Type::Mark => "marktype",
            Type::Operator => "operatortype",
            Type::Context => "contexttype",
            Type::Name => "nametype",
            Type::Save => "savetype",
            Type::String => "stringtype",
            Type::Array => "arraytype",
            Type::Dict => "dicttype",
            Type::File => "filetype",
        }
    }
}

/// Access level of an object. Encoded so that zeroed storage decodes as
/// unlimited, the default for fresh objects.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Access {
    Unlimited = 0,
    ReadOnly = 1,
    ExecuteOnly = 2,
    None = 3,
}

impl Access {
    const MASK: u8 = 0b11;

    fn from_bits(bits: u8) -> Self {
        match bits & Self::MASK {
            0 => Access::Unlimited,
            1 => Access::ReadOnly,
            2 => Access::ExecuteOnly,
            _ => Access::None,
        }
    }

    /// Higher is more permissive.
    #[inline]
    pub fn rank(self) -> u8 {
        Self::MASK - self as u8
    }

    /// The more restrictive of the two levels.
    #[inline]
    pub fn lowered_to(self, other: Access) -> Access {
        if other.rank() < self.rank() { other } else { self }
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Attributes: u8 {
        const EXECUTABLE = 1 << 2;
        /// storage lives in the shared global memory
        const GLOBAL = 1 << 3;
    }
}

/// A fixed size tagged value.
///
/// Immediates keep their payload in `value`. Composites keep the id of the
/// entity holding their storage in `value`, the byte offset into that entity
/// in `offset` and the element count in `length`.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Object {
    ty: Type,
    access: Access,
    attrs: Attributes,
    value: u32,
    offset: u32,
    length: u32,
}

impl Default for Object {
    fn default() -> Self {
        Self::NULL
    }
}

impl Object {
    pub const NULL: Object = Object::immediate(Type::Null, 0);

    #[inline]
    const fn immediate(ty: Type, value: u32) -> Self {
        Self {
            ty,
            access: Access::Unlimited,
            attrs: Attributes::empty(),
            value,
            offset: 0,
            length: 0,
        }
    }

    #[inline]
    pub const fn int(value: i32) -> Self {
        Self::immediate(Type::Integer, value as u32)
    }

    #[inline]
    pub fn real(value: f32) -> Self {
        Self::immediate(Type::Real, value.to_bits())
    }

    #[inline]
    pub const fn boolean(value: bool) -> Self {
        Self::immediate(Type::Boolean, value as u32)
    }

    #[inline]
    pub const fn mark() -> Self {
        Self::immediate(Type::Mark, 0)
    }

    /// Operators are executable when created.
    #[inline]
    pub fn operator(opcode: Opcode) -> Self {
        Self::immediate(Type::Operator, opcode.0).cvx()
    }

    #[inline]
    pub const fn context(id: ContextId) -> Self {
        Self::immediate(Type::Context, id.0)
    }

    #[inline]
    pub const fn name(id: NameId) -> Self {
        Self::immediate(Type::Name, id.0)
    }

    #[inline]
    pub fn executable_name(id: NameId) -> Self {
        Self::name(id).cvx()
    }

    #[inline]
    pub const fn save(level: SaveLevel) -> Self {
        Self::immediate(Type::Save, level.0)
    }

    pub fn composite(ty: Type, bank: Bank, entity: EntityId, offset: u32, length: u32) -> Self {
        debug_assert!(ty.is_composite(), "{ty:?} is not a composite type");
        let attrs = match bank {
            Bank::Global => Attributes::GLOBAL,
            Bank::Local => Attributes::empty(),
        };
        Self {
            ty,
            access: Access::Unlimited,
            attrs,
            value: entity.0,
            offset,
            length,
        }
    }

    #[inline]
    pub fn ty(&self) -> Type {
        self.ty
    }

    #[inline]
    pub fn access(&self) -> Access {
        self.access
    }

    #[inline]
    pub fn is_composite(&self) -> bool {
        self.ty.is_composite()
    }

    #[inline]
    pub fn is_executable(&self) -> bool {
        self.attrs.contains(Attributes::EXECUTABLE)
    }

    /// An executable array.
    #[inline]
    pub fn is_proc(&self) -> bool {
        self.ty == Type::Array && self.is_executable()
    }

    #[inline]
    pub fn bank(&self) -> Bank {
        if self.attrs.contains(Attributes::GLOBAL) {
            Bank::Global
        } else {
            Bank::Local
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        (self.ty == Type::Integer).then_some(self.value as i32)
    }

    pub fn as_real(&self) -> Option<f32> {
        (self.ty == Type::Real).then(|| f32::from_bits(self.value))
    }

    /// Either numeric type widened to `f64`.
    pub fn as_number(&self) -> Option<f64> {
        match self.ty {
            Type::Integer => Some(self.value as i32 as f64),
            Type::Real => Some(f32::from_bits(self.value) as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        (self.ty == Type::Boolean).then_some(self.value != 0)
    }

    pub fn as_opcode(&self) -> Option<Opcode> {
        (self.ty == Type::Operator).then_some(Opcode(self.value))
    }

    pub fn as_context(&self) -> Option<ContextId> {
        (self.ty == Type::Context).then_some(ContextId(self.value))
    }

    pub fn as_name(&self) -> Option<NameId> {
        (self.ty == Type::Name).then_some(NameId(self.value))
    }

    pub fn as_save(&self) -> Option<SaveLevel> {
        (self.ty == Type::Save).then_some(SaveLevel(self.value))
    }

    pub fn entity(&self) -> Option<EntityId> {
        self.is_composite().then_some(EntityId(self.value))
    }

    #[inline]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    #[inline]
    pub fn length(&self) -> u32 {
        self.length
    }

    /// The same composite narrowed to `length` elements starting `skip`
    /// elements in, where an element is `stride` bytes wide.
    pub fn interval(&self, skip: u32, length: u32, stride: u32) -> Result<Self, VmError> {
        let end = skip.checked_add(length).ok_or(VmError::RangeCheck)?;
        if !self.is_composite() || end > self.length {
            return Err(VmError::RangeCheck);
        }
        let offset = skip
            .checked_mul(stride)
            .and_then(|bytes| self.offset.checked_add(bytes))
            .ok_or(VmError::RangeCheck)?;
        Ok(Self {
            offset,
            length,
            ..*self
        })
    }

    /// The same view onto a different entity of the same bank.
    pub fn rebased(self, entity: EntityId) -> Self {
        debug_assert!(self.is_composite());
        Self {
            value: entity.0,
            ..self
        }
    }

    /// Integers become the equivalent real, everything else is left alone.
    pub fn promoted(self) -> Self {
        match self.as_int() {
            Some(value) => Self {
                ty: Type::Real,
                value: (value as f32).to_bits(),
                ..self
            },
            None => self,
        }
    }

    #[inline]
    pub fn cvlit(self) -> Self {
        Self {
            attrs: self.attrs - Attributes::EXECUTABLE,
            ..self
        }
    }

    #[inline]
    pub fn cvx(self) -> Self {
        Self {
            attrs: self.attrs | Attributes::EXECUTABLE,
            ..self
        }
    }

    #[inline]
    pub fn xcheck(&self) -> bool {
        self.is_executable()
    }

    /// Lower the access level. Raising is silently ignored.
    #[inline]
    pub fn restrict(self, access: Access) -> Self {
        Self {
            access: self.access.lowered_to(access),
            ..self
        }
    }

    #[inline]
    pub fn rcheck(&self) -> bool {
        self.access.rank() >= Access::ReadOnly.rank()
    }

    #[inline]
    pub fn wcheck(&self) -> bool {
        self.access == Access::Unlimited
    }

    /// Identity used for dictionary keys: type and payload, ignoring attributes.
    pub fn same(&self, other: &Object) -> bool {
        self.ty == other.ty
            && self.value == other.value
            && self.offset == other.offset
            && self.length == other.length
    }

    /// ```text
    ///  0    | 1              | 2..4     | 4..8  | 8..12  | 12..16
    ///  type | access + attrs | reserved | value | offset | length
    /// ```
    pub fn encode(&self) -> [u8; OBJECT_SIZE as usize] {
        let mut out = [0u8; OBJECT_SIZE as usize];
        out[0] = self.ty as u8;
        out[1] = self.access as u8 | self.attrs.bits();
        out[4..8].copy_from_slice(&self.value.to_le_bytes());
        out[8..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; OBJECT_SIZE as usize]) -> Result<Self, VmError> {
        let ty = Type::from_u8(bytes[0]).ok_or(VmError::TypeCheck)?;
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        Ok(Self {
            ty,
            access: Access::from_bits(bytes[1]),
            attrs: Attributes::from_bits_truncate(bytes[1]),
            value: word(4),
            offset: word(8),
            length: word(12),
        })
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Object");
        s.field("ty", &self.ty);
        if self.is_executable() {
            s.field("exec", &true);
        }
        if self.access != Access::Unlimited {
            s.field("access", &self.access);
        }
        if self.is_composite() {
            s.field("bank", &self.bank())
                .field("entity", &self.value)
                .field("offset", &self.offset)
                .field("length", &self.length);
        } else {
            s.field("value", &format_args!("{self}"));
        }
        s.finish()
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ty {
            Type::Null => f.write_str("null"),
            Type::Integer => write!(f, "{}", self.value as i32),
            Type::Real => write!(f, "{:?}", f32::from_bits(self.value)),
            Type::Boolean => write!(f, "{}", self.value != 0),
            Type::Mark => f.write_str("-mark-"),
            Type::Operator => write!(f, "--op{}--", self.value),
            Type::Context => write!(f, "-context{}-", self.value),
            Type::Name if self.is_executable() => write!(f, "name{}", self.value),
            Type::Name => write!(f, "/name{}", self.value),
            Type::Save => write!(f, "-save{}-", self.value),
            Type::String => f.write_str("-string-"),
            Type::Array if self.is_executable() => f.write_str("-proc-"),
            Type::Array => f.write_str("-array-"),
            Type::Dict => f.write_str("-dict-"),
            Type::File => f.write_str("-file-"),
        }
    }
}
