use std::fmt;

/// Index into an entity table. Ids are dense and never reused for a
/// different table, id 0 is the free list head of every memory.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EntityId(pub u32);

impl EntityId {
    pub const FREE_HEAD: EntityId = EntityId(0);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EntityKind {
    Free = 0,
    /// bookkeeping storage, never collected
    System = 1,
    String = 2,
    Array = 3,
    Dict = 4,
    /// owns a slot in the resource table
    File = 5,
}

impl EntityKind {
    /// Kinds the collector is allowed to reclaim.
    #[inline]
    pub fn is_collectable(self) -> bool {
        matches!(
            self,
            EntityKind::String | EntityKind::Array | EntityKind::Dict | EntityKind::File
        )
    }

    /// Kinds whose storage is a sequence of encoded objects.
    #[inline]
    pub fn holds_objects(self) -> bool {
        matches!(self, EntityKind::Array | EntityKind::Dict)
    }
}

/// Type word of an entity. The low byte is the [`EntityKind`], the rest is free
/// for the owner of the entity.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct EntityTag(pub u32);

impl EntityTag {
    pub const FREE: EntityTag = EntityTag(0);

    #[inline]
    pub const fn new(kind: EntityKind) -> Self {
        Self(kind as u32)
    }

    #[inline]
    pub fn kind(self) -> EntityKind {
        match self.0 & 0xff {
            1 => EntityKind::System,
            2 => EntityKind::String,
            3 => EntityKind::Array,
            4 => EntityKind::Dict,
            5 => EntityKind::File,
            _ => EntityKind::Free,
        }
    }

    #[inline]
    pub fn owns_resource(self) -> bool {
        self.kind() == EntityKind::File
    }
}

impl From<EntityKind> for EntityTag {
    fn from(kind: EntityKind) -> Self {
        Self::new(kind)
    }
}

/// Packed mark word.
///
/// ```text
///  31 | 30..24   | 23..12        | 11..0
///  gc | refcount | created level | snapshot level
/// ```
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Mark(pub u32);

impl Mark {
    const GC_BIT: u32 = 1 << 31;
    const REFCOUNT_SHIFT: u32 = 24;
    const REFCOUNT_MASK: u32 = 0x7f;
    const CREATED_SHIFT: u32 = 12;
    const LEVEL_MASK: u32 = 0xfff;

    pub const MAX_LEVEL: u32 = Self::LEVEL_MASK;
    pub const MAX_REFCOUNT: u32 = Self::REFCOUNT_MASK;

    #[inline]
    pub fn created_at(level: u32) -> Self {
        Self(0).with_created(level).with_snapshot(level)
    }

    #[inline]
    pub fn is_marked(self) -> bool {
        self.0 & Self::GC_BIT != 0
    }

    #[inline]
    pub fn with_marked(self, marked: bool) -> Self {
        if marked {
            Self(self.0 | Self::GC_BIT)
        } else {
            Self(self.0 & !Self::GC_BIT)
        }
    }

    #[inline]
    pub fn refcount(self) -> u32 {
        (self.0 >> Self::REFCOUNT_SHIFT) & Self::REFCOUNT_MASK
    }

    #[inline]
    pub fn with_refcount(self, count: u32) -> Self {
        let cleared = self.0 & !(Self::REFCOUNT_MASK << Self::REFCOUNT_SHIFT);
        Self(cleared | ((count & Self::REFCOUNT_MASK) << Self::REFCOUNT_SHIFT))
    }

    /// Save level that was current when the entity was allocated.
    #[inline]
    pub fn created(self) -> u32 {
        (self.0 >> Self::CREATED_SHIFT) & Self::LEVEL_MASK
    }

    #[inline]
    pub fn with_created(self, level: u32) -> Self {
        let cleared = self.0 & !(Self::LEVEL_MASK << Self::CREATED_SHIFT);
        Self(cleared | ((level & Self::LEVEL_MASK) << Self::CREATED_SHIFT))
    }

    /// Highest save level that already holds a snapshot of this entity.
    #[inline]
    pub fn snapshot(self) -> u32 {
        self.0 & Self::LEVEL_MASK
    }

    #[inline]
    pub fn with_snapshot(self, level: u32) -> Self {
        Self((self.0 & !Self::LEVEL_MASK) | (level & Self::LEVEL_MASK))
    }
}

/// One row of the entity table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Entity {
    pub address: u32,
    pub size: u32,
    pub mark: Mark,
    pub tag: EntityTag,
}

impl Entity {
    #[inline]
    pub fn is_free(&self) -> bool {
        self.tag.kind() == EntityKind::Free
    }
}
