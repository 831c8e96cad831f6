//! Entity table on top of an [`Arena`].
//!
//! Everything stored in a memory is reached through an [`EntityId`]. The
//! arena may move whenever it grows, so addresses are looked up from the
//! table at the moment of use and never kept across an allocating call.
use log::{debug, error, trace, warn};

use crate::{
    Arena, ArenaBacking, EntityId, EntityKind, EntityTag, FreeListAllocFn, FreeListResult,
    GarbageCollector, Object, ResourceTable, RootProvider, VmError, VmSettings,
    arena::{ARENA_ALIGN, align_up},
    entity::{Entity, Mark},
    object::OBJECT_SIZE,
    save::SaveRecord,
};

/// Which memory a composite object's storage lives in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Bank {
    /// private to one context
    Local,
    /// shared by every context
    Global,
}

pub struct Memory {
    pub(crate) arena: Arena,
    pub(crate) entities: Vec<Entity>,
    max_entities: usize,
    bank: Bank,
    pub(crate) free_list_alloc: FreeListAllocFn,
    collector: Option<Box<dyn GarbageCollector>>,
    pub(crate) gc_period: u32,
    pub(crate) gc_countdown: u32,
    pub(crate) saves: Vec<SaveRecord>,
    pub(crate) resources: ResourceTable,
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("bank", &self.bank)
            .field("entities", &self.entities.len())
            .field("used", &self.arena.used())
            .field("max", &self.arena.max())
            .field("level", &self.saves.len())
            .finish()
    }
}

impl Memory {
    pub fn new(bank: Bank, settings: &VmSettings) -> Result<Self, VmError> {
        Self::with_backing(bank, ArenaBacking::Anonymous, settings)
    }

    pub fn with_backing(
        bank: Bank,
        backing: ArenaBacking,
        settings: &VmSettings,
    ) -> Result<Self, VmError> {
        let arena = Arena::init(
            backing,
            settings.initial_arena_size,
            settings.page_size,
            settings.max_arena_size,
        )?;
        let mut entities = Vec::with_capacity(settings.initial_entities);
        // free list head: zero sized, so the collector never sees it
        entities.push(Entity {
            address: 0,
            size: 0,
            mark: Mark::created_at(0),
            tag: EntityTag::new(EntityKind::System),
        });
        Ok(Self {
            arena,
            entities,
            max_entities: settings.max_entities,
            bank,
            free_list_alloc: Memory::first_fit,
            collector: None,
            gc_period: settings.gc_period,
            gc_countdown: settings.gc_period,
            saves: Vec::new(),
            resources: ResourceTable::new(),
        })
    }

    /// Release the arena. The memory reports [`VmError::Uninitialized`] afterwards.
    pub fn exit(&mut self) {
        for id in 0..self.entities.len() {
            self.release_resource_of(EntityId(id as u32));
        }
        self.entities.truncate(1);
        self.saves.clear();
        self.arena.exit();
    }

    #[inline]
    pub fn bank(&self) -> Bank {
        self.bank
    }

    #[inline]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    #[inline]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn register_free_list_alloc(&mut self, alloc: FreeListAllocFn) {
        self.free_list_alloc = alloc;
    }

    pub fn register_garbage_collector(&mut self, collector: Box<dyn GarbageCollector>) {
        self.collector = Some(collector);
    }

    pub fn entity(&self, id: EntityId) -> Result<&Entity, VmError> {
        self.entities.get(id.index()).ok_or_else(|| {
            error!(
                "{:?} memory: entity {id} out of range ({} entities)",
                self.bank,
                self.entities.len()
            );
            VmError::InvalidEntity(id.0)
        })
    }

    fn entity_mut(&mut self, id: EntityId) -> Result<&mut Entity, VmError> {
        self.entity(id)?;
        Ok(&mut self.entities[id.index()])
    }

    /// Bump allocate a fresh entity, bypassing the free list.
    pub fn table_alloc(&mut self, size: u32, tag: EntityTag) -> Result<EntityId, VmError> {
        let size = if size == 0 {
            0
        } else {
            align_up(size, ARENA_ALIGN).ok_or(VmError::VmFull)?
        };
        self.reserve_entity()?;
        let address = if size == 0 {
            self.arena.used()
        } else {
            self.arena.alloc(size)?
        };
        let id = EntityId(self.entities.len() as u32);
        self.entities.push(Entity {
            address,
            size,
            mark: Mark::created_at(self.level()),
            tag,
        });
        trace!("{:?} table alloc {id}: {size} bytes at {address}", self.bank);
        Ok(id)
    }

    fn reserve_entity(&mut self) -> Result<(), VmError> {
        let len = self.entities.len();
        if len >= self.max_entities {
            warn!("{:?} memory: entity table full at {len}", self.bank);
            return Err(VmError::VmFull);
        }
        if len < self.entities.capacity() {
            return Ok(());
        }
        let target = (len * 2).clamp(len + 1, self.max_entities);
        self.entities.reserve_exact(target - len);
        debug!("{:?} entity table grew from {len} to {target}", self.bank);
        Ok(())
    }

    /// Allocate through the free list, collecting once when it asks for it,
    /// then fall back to fresh bump allocation.
    ///
    /// `roots` must cover every object the caller still needs that is not
    /// reachable from storage in this memory.
    pub fn allocate(
        &mut self,
        size: u32,
        tag: EntityTag,
        roots: &dyn RootProvider,
    ) -> Result<EntityId, VmError> {
        match (self.free_list_alloc)(self, size, tag)? {
            FreeListResult::Entity(id) => return Ok(id),
            FreeListResult::NeedGc => {
                match self.collect(roots, true, false) {
                    Ok(bytes) => trace!("{:?} allocation collected {bytes} bytes", self.bank),
                    Err(err) => warn!("{:?} collection failed: {err}", self.bank),
                }
                if let FreeListResult::Entity(id) = (self.free_list_alloc)(self, size, tag)? {
                    return Ok(id);
                }
            }
            FreeListResult::Miss => {}
        }
        self.table_alloc(size, tag)
    }

    /// Like [`Memory::allocate`] but never runs the collector. Used while the
    /// caller holds references nothing else can report as roots.
    pub fn allocate_without_gc(&mut self, size: u32, tag: EntityTag) -> Result<EntityId, VmError> {
        match (self.free_list_alloc)(self, size, tag)? {
            FreeListResult::Entity(id) => Ok(id),
            FreeListResult::NeedGc | FreeListResult::Miss => self.table_alloc(size, tag),
        }
    }

    /// Run the registered collector. Without one nothing is reclaimed.
    pub fn collect(
        &mut self,
        roots: &dyn RootProvider,
        sweep: bool,
        mark_all: bool,
    ) -> Result<usize, VmError> {
        let Some(mut collector) = self.collector.take() else {
            debug!("{:?} memory has no collector registered", self.bank);
            return Ok(0);
        };
        let result = collector.collect(self, roots, sweep, mark_all);
        self.collector = Some(collector);
        result
    }

    /// Move an entity's contents into a new entity of `new_size` bytes and
    /// free the old one. The caller must switch to the returned id.
    pub fn realloc(
        &mut self,
        id: EntityId,
        new_size: u32,
        roots: &dyn RootProvider,
    ) -> Result<EntityId, VmError> {
        let old = self.movable(id)?;
        let fresh = self.allocate(new_size, old.tag, roots)?;
        self.move_contents(id, old.size, fresh, new_size)
    }

    /// [`Memory::realloc`] for bookkeeping tables that are grown while no
    /// roots are at hand. Never runs the collector.
    pub fn realloc_without_gc(&mut self, id: EntityId, new_size: u32) -> Result<EntityId, VmError> {
        let old = self.movable(id)?;
        let fresh = self.allocate_without_gc(new_size, old.tag)?;
        self.move_contents(id, old.size, fresh, new_size)
    }

    fn movable(&self, id: EntityId) -> Result<Entity, VmError> {
        let old = *self.entity(id)?;
        if old.is_free() || old.tag.owns_resource() {
            return Err(VmError::InvalidAccess);
        }
        Ok(old)
    }

    fn move_contents(
        &mut self,
        id: EntityId,
        old_size: u32,
        fresh: EntityId,
        new_size: u32,
    ) -> Result<EntityId, VmError> {
        let keep = old_size.min(new_size);
        if keep > 0 {
            // both addresses looked up again, the allocation may have moved the arena
            let from = self.entity(id)?.address;
            let to = self.entity(fresh)?.address;
            self.arena.copy_within(from, to, keep)?;
        }
        self.free(id)?;
        trace!("{:?} realloc {id} -> {fresh}: {old_size} -> {new_size} bytes", self.bank);
        Ok(fresh)
    }

    pub fn get_addr(&self, id: EntityId) -> Result<u32, VmError> {
        Ok(self.entity(id)?.address)
    }

    pub fn get_size(&self, id: EntityId) -> Result<u32, VmError> {
        Ok(self.entity(id)?.size)
    }

    pub fn get_mark(&self, id: EntityId) -> Result<Mark, VmError> {
        Ok(self.entity(id)?.mark)
    }

    pub fn get_tag(&self, id: EntityId) -> Result<EntityTag, VmError> {
        Ok(self.entity(id)?.tag)
    }

    pub fn set_addr(&mut self, id: EntityId, address: u32) -> Result<(), VmError> {
        self.touch(id)?;
        self.entity_mut(id)?.address = address;
        Ok(())
    }

    pub fn set_size(&mut self, id: EntityId, size: u32) -> Result<(), VmError> {
        self.touch(id)?;
        self.entity_mut(id)?.size = size;
        Ok(())
    }

    /// Marks are collector state and are not part of save snapshots.
    pub fn set_mark(&mut self, id: EntityId, mark: Mark) -> Result<(), VmError> {
        self.entity_mut(id)?.mark = mark;
        Ok(())
    }

    pub fn set_tag(&mut self, id: EntityId, tag: EntityTag) -> Result<(), VmError> {
        self.touch(id)?;
        self.entity_mut(id)?.tag = tag;
        Ok(())
    }

    /// Pin an entity so the collector treats it as a root.
    pub fn retain(&mut self, id: EntityId) -> Result<(), VmError> {
        let mark = self.get_mark(id)?;
        if mark.refcount() == Mark::MAX_REFCOUNT {
            return Err(VmError::LimitCheck);
        }
        self.set_mark(id, mark.with_refcount(mark.refcount() + 1))
    }

    pub fn release(&mut self, id: EntityId) -> Result<(), VmError> {
        let mark = self.get_mark(id)?;
        if mark.refcount() == 0 {
            warn!("{:?} memory: release of unpinned {id}", self.bank);
            return Err(VmError::RangeCheck);
        }
        self.set_mark(id, mark.with_refcount(mark.refcount() - 1))
    }

    /// Copy `out.len()` bytes starting at `offset` of the entity's storage.
    pub fn get(&self, id: EntityId, offset: u32, out: &mut [u8]) -> Result<(), VmError> {
        let bytes = self.bytes_at(id, offset, span_len(out.len())?)?;
        out.copy_from_slice(bytes);
        Ok(())
    }

    pub fn put(&mut self, id: EntityId, offset: u32, input: &[u8]) -> Result<(), VmError> {
        let address = self.checked_address(id, offset, span_len(input.len())?)?;
        self.touch(id)?;
        self.arena
            .bytes_mut(address, input.len() as u32)?
            .copy_from_slice(input);
        Ok(())
    }

    /// Borrow part of an entity's storage. The borrow ends before the next
    /// allocation can move the arena.
    pub fn bytes_at(&self, id: EntityId, offset: u32, len: u32) -> Result<&[u8], VmError> {
        let address = self.checked_address(id, offset, len)?;
        self.arena.bytes(address, len)
    }

    pub fn bytes(&self, id: EntityId) -> Result<&[u8], VmError> {
        let size = self.entity(id)?.size;
        self.bytes_at(id, 0, size)
    }

    fn checked_address(&self, id: EntityId, offset: u32, len: u32) -> Result<u32, VmError> {
        let entity = self.entity(id)?;
        let end = offset.checked_add(len).ok_or(VmError::RangeCheck)?;
        if end > entity.size {
            return Err(VmError::RangeCheck);
        }
        Ok(entity.address + offset)
    }

    pub fn read_object(&self, id: EntityId, offset: u32) -> Result<Object, VmError> {
        let mut buf = [0u8; OBJECT_SIZE as usize];
        self.get(id, offset, &mut buf)?;
        Object::decode(&buf)
    }

    pub fn write_object(&mut self, id: EntityId, offset: u32, obj: Object) -> Result<(), VmError> {
        self.put(id, offset, &obj.encode())
    }

    /// Visit every object stored in the entity, slot by slot.
    pub fn for_each_slot(
        &self,
        id: EntityId,
        visitor: &mut dyn FnMut(Object),
    ) -> Result<(), VmError> {
        let bytes = self.bytes(id)?;
        for chunk in bytes.chunks_exact(OBJECT_SIZE as usize) {
            let mut slot = [0u8; OBJECT_SIZE as usize];
            slot.copy_from_slice(chunk);
            if let Ok(obj) = Object::decode(&slot) {
                visitor(obj);
            }
        }
        Ok(())
    }

    /// Every composite reference stored in live arrays and dicts.
    pub fn visit_stored_objects(&self, visitor: &mut dyn FnMut(Object)) {
        for (index, entity) in self.entities.iter().enumerate() {
            if entity.is_free() || !entity.tag.kind().holds_objects() {
                continue;
            }
            let _ = self.for_each_slot(EntityId(index as u32), &mut |obj| {
                if obj.is_composite() {
                    visitor(obj);
                }
            });
        }
    }

    /// Write through to the arena without taking a snapshot.
    pub(crate) fn write_raw(&mut self, id: EntityId, offset: u32, input: &[u8]) -> Result<(), VmError> {
        let address = self.checked_address(id, offset, span_len(input.len())?)?;
        self.arena
            .bytes_mut(address, input.len() as u32)?
            .copy_from_slice(input);
        Ok(())
    }

    pub(crate) fn release_resource_of(&mut self, id: EntityId) {
        let Ok(entity) = self.entity(id).copied() else {
            return;
        };
        if entity.is_free() || !entity.tag.owns_resource() {
            return;
        }
        match self.resource_id(id) {
            Ok(resource) => {
                self.resources.release(resource);
            }
            Err(err) => warn!("{:?} memory: {id} has no readable resource slot: {err}", self.bank),
        }
    }
}

#[inline]
fn span_len(len: usize) -> Result<u32, VmError> {
    u32::try_from(len).map_err(|_| VmError::RangeCheck)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MarkSweep, NoRoots, Type};

    fn memory() -> Memory {
        Memory::new(Bank::Local, &VmSettings::default()).expect("memory")
    }

    fn string_tag() -> EntityTag {
        EntityTag::new(EntityKind::String)
    }

    #[test]
    fn put_then_get_returns_the_same_bytes() {
        let mut m = memory();
        let id = m.table_alloc(24, string_tag()).unwrap();
        let data: Vec<u8> = (0..24).map(|i| i * 3).collect();
        m.put(id, 0, &data).unwrap();
        let mut out = vec![0u8; 24];
        m.get(id, 0, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn get_and_put_are_bounds_checked() {
        let mut m = memory();
        let id = m.table_alloc(8, string_tag()).unwrap();
        assert_eq!(m.put(id, 4, &[0; 5]), Err(VmError::RangeCheck));
        let mut out = [0u8; 2];
        assert_eq!(m.get(id, 7, &mut out), Err(VmError::RangeCheck));
        assert_eq!(m.get(id, u32::MAX, &mut out), Err(VmError::RangeCheck));
        assert!(m.get(id, 6, &mut out).is_ok());
    }

    #[test]
    fn unknown_entity_is_reported() {
        let m = memory();
        assert_eq!(m.get_size(EntityId(99)), Err(VmError::InvalidEntity(99)));
    }

    #[test]
    fn sizes_round_to_arena_alignment() {
        let mut m = memory();
        let a = m.table_alloc(3, string_tag()).unwrap();
        let empty = m.table_alloc(0, string_tag()).unwrap();
        assert_eq!(m.get_size(a).unwrap(), 8);
        assert_eq!(m.get_size(empty).unwrap(), 0);
    }

    #[test]
    fn data_survives_arena_growth() {
        let settings = VmSettings {
            initial_arena_size: 4096,
            ..VmSettings::default()
        };
        let mut m = Memory::new(Bank::Local, &settings).unwrap();
        let id = m.table_alloc(64, string_tag()).unwrap();
        let pattern: Vec<u8> = (0..64).rev().collect();
        m.put(id, 0, &pattern).unwrap();

        let before = m.arena().max();
        m.table_alloc(64 * 1024, string_tag()).unwrap();
        assert!(m.arena().max() > before, "arena should have grown");
        assert_eq!(m.bytes(id).unwrap(), pattern.as_slice());
    }

    #[test]
    fn entity_table_grows_by_doubling() {
        let settings = VmSettings {
            initial_entities: 2,
            ..VmSettings::default()
        };
        let mut m = Memory::new(Bank::Local, &settings).unwrap();
        for _ in 0..9 {
            m.table_alloc(8, string_tag()).unwrap();
        }
        assert_eq!(m.entity_count(), 10);
        assert!(m.entities.capacity() >= 10);
    }

    #[test]
    fn entity_limit_is_enforced() {
        let settings = VmSettings {
            initial_entities: 2,
            max_entities: 3,
            ..VmSettings::default()
        };
        let mut m = Memory::new(Bank::Local, &settings).unwrap();
        m.table_alloc(8, string_tag()).unwrap();
        m.table_alloc(8, string_tag()).unwrap();
        assert_eq!(m.table_alloc(8, string_tag()), Err(VmError::VmFull));
    }

    #[test]
    fn objects_roundtrip_through_slots() {
        let mut m = memory();
        let id = m.table_alloc(32, EntityTag::new(EntityKind::Array)).unwrap();
        m.write_object(id, 16, Object::real(2.5)).unwrap();
        assert_eq!(m.read_object(id, 16).unwrap(), Object::real(2.5));
        assert_eq!(m.read_object(id, 0).unwrap(), Object::NULL);
    }

    #[test]
    fn realloc_moves_contents_to_a_new_entity() {
        let mut m = memory();
        let id = m.table_alloc(8, EntityTag::new(EntityKind::System)).unwrap();
        m.put(id, 0, b"abcdefgh").unwrap();
        let grown = m.realloc(id, 32, &NoRoots).unwrap();
        assert_ne!(grown, id);
        assert_eq!(&m.bytes(grown).unwrap()[..8], b"abcdefgh");
        assert!(m.entity(id).unwrap().is_free());
    }

    #[test]
    fn bookkeeping_realloc_never_collects() {
        let settings = VmSettings {
            gc_period: 1,
            ..VmSettings::default()
        };
        let mut m = Memory::new(Bank::Local, &settings).unwrap();
        m.register_garbage_collector(Box::new(MarkSweep::new()));
        let unrooted = m.table_alloc(16, string_tag()).unwrap();
        let table = m.table_alloc(8, EntityTag::new(EntityKind::System)).unwrap();

        let grown = m.realloc_without_gc(table, 64).unwrap();
        assert!(!m.entity(unrooted).unwrap().is_free(), "no collection may run");
        assert!(m.entity(table).unwrap().is_free());
        assert_eq!(m.get_size(grown).unwrap(), 64);
    }

    #[test]
    fn allocation_collects_and_reuses_when_the_free_list_asks() {
        let settings = VmSettings {
            gc_period: 1,
            ..VmSettings::default()
        };
        let mut m = Memory::new(Bank::Local, &settings).unwrap();
        m.register_garbage_collector(Box::new(MarkSweep::new()));

        let garbage = m.table_alloc(32, string_tag()).unwrap();
        let kept = m.table_alloc(32, string_tag()).unwrap();
        let kept_obj = Object::composite(Type::String, Bank::Local, kept, 0, 32);
        let used = m.arena().used();

        // the first miss asks for a collection, which frees `garbage`, and
        // the retry hands it back
        let again = m.allocate(32, string_tag(), &[kept_obj]).unwrap();
        assert_eq!(again, garbage);
        assert_eq!(m.arena().used(), used, "nothing new was bumped");
        assert!(!m.entity(kept).unwrap().is_free());
    }

    #[test]
    fn exit_leaves_memory_unusable() {
        let mut m = memory();
        let id = m.table_alloc(8, string_tag()).unwrap();
        m.exit();
        assert_eq!(m.get_size(id), Err(VmError::InvalidEntity(id.0)));
        assert_eq!(m.table_alloc(8, string_tag()), Err(VmError::Uninitialized));
    }
}
