use log::{error, trace};

use crate::{
    EntityId, EntityTag, Memory, VmError,
    arena::{ARENA_ALIGN, align_up},
    entity::Mark,
};

/// Outcome of a free list lookup.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FreeListResult {
    Entity(EntityId),
    /// enough misses in a row, collect and try again
    NeedGc,
    Miss,
}

/// Signature of a pluggable free list policy.
pub type FreeListAllocFn = fn(&mut Memory, u32, EntityTag) -> Result<FreeListResult, VmError>;

const LINK_SIZE: u32 = 4;

impl Memory {
    /// First entity on the free list that is at least `size` bytes, spliced out
    /// and retagged. The default [`FreeListAllocFn`].
    pub fn first_fit(
        memory: &mut Memory,
        size: u32,
        tag: EntityTag,
    ) -> Result<FreeListResult, VmError> {
        let wanted = align_up(size, ARENA_ALIGN).ok_or(VmError::VmFull)?;
        let mut prev = EntityId::FREE_HEAD;
        let mut cursor = memory.free_head()?;
        let mut steps = 0usize;
        while cursor != 0 {
            steps += 1;
            if steps > memory.entity_count() {
                error!("{:?} free list does not terminate", memory.bank());
                return Err(VmError::InvalidEntity(cursor));
            }
            let id = EntityId(cursor);
            let size_here = memory.entity(id)?.size;
            let next = memory.read_link(id)?;
            if size_here >= wanted {
                memory.write_link(prev, next)?;
                memory.reuse(id, tag)?;
                memory.gc_countdown = memory.gc_period;
                trace!("{:?} free list hit {id} for {size} bytes", memory.bank());
                return Ok(FreeListResult::Entity(id));
            }
            prev = id;
            cursor = next;
        }

        memory.gc_countdown = memory.gc_countdown.saturating_sub(1);
        if memory.gc_countdown == 0 {
            memory.gc_countdown = memory.gc_period;
            trace!("{:?} free list asks for a collection", memory.bank());
            return Ok(FreeListResult::NeedGc);
        }
        Ok(FreeListResult::Miss)
    }

    /// Release the entity's resource, clear its tag and push it on the free list.
    pub fn free(&mut self, id: EntityId) -> Result<(), VmError> {
        let entity = *self.entity(id)?;
        if id == EntityId::FREE_HEAD || entity.size < LINK_SIZE {
            error!("{:?} memory: {id} cannot be freed", self.bank());
            return Err(VmError::InvalidAccess);
        }
        if entity.is_free() {
            error!("{:?} memory: double free of {id}", self.bank());
            return Err(VmError::InvalidAccess);
        }
        self.release_resource_of(id);
        let head = self.free_head()?;
        self.set_tag(id, EntityTag::FREE)?;
        self.put(id, 0, &head.to_le_bytes())?;
        self.set_mark(id, entity.mark.with_marked(false).with_refcount(0))?;
        self.set_addr(EntityId::FREE_HEAD, id.0)?;
        trace!("{:?} freed {id} ({} bytes)", self.bank(), entity.size);
        Ok(())
    }

    /// Ids on the free list, head first.
    pub fn free_entities(&self) -> Result<Vec<EntityId>, VmError> {
        let mut out = Vec::new();
        let mut cursor = self.free_head()?;
        while cursor != 0 && out.len() < self.entity_count() {
            out.push(EntityId(cursor));
            cursor = self.read_link(EntityId(cursor))?;
        }
        Ok(out)
    }

    /// The head id lives in the address field of the reserved head entity.
    fn free_head(&self) -> Result<u32, VmError> {
        self.get_addr(EntityId::FREE_HEAD)
    }

    fn read_link(&self, id: EntityId) -> Result<u32, VmError> {
        let mut link = [0u8; LINK_SIZE as usize];
        self.get(id, 0, &mut link)?;
        Ok(u32::from_le_bytes(link))
    }

    fn write_link(&mut self, prev: EntityId, next: u32) -> Result<(), VmError> {
        if prev == EntityId::FREE_HEAD {
            self.set_addr(EntityId::FREE_HEAD, next)
        } else {
            self.put(prev, 0, &next.to_le_bytes())
        }
    }

    /// Hand a spliced out entity to a new owner with zeroed storage.
    fn reuse(&mut self, id: EntityId, tag: EntityTag) -> Result<(), VmError> {
        self.set_tag(id, tag)?;
        let size = self.get_size(id)?;
        let zeroes = vec![0u8; size as usize];
        self.put(id, 0, &zeroes)?;
        self.set_mark(id, Mark::created_at(self.level()))
    }
}
