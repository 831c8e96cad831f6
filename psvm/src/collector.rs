use log::{debug, trace};

use crate::{EntityId, Memory, Object, VmError};

/// Anything that holds objects the collector must treat as live.
pub trait RootProvider {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Object));
}

pub struct NoRoots;

impl RootProvider for NoRoots {
    fn visit_roots(&self, _visitor: &mut dyn FnMut(Object)) {}
}

impl<const N: usize> RootProvider for [Object; N] {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Object)) {
        self.iter().copied().for_each(visitor);
    }
}

impl RootProvider for Vec<Object> {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Object)) {
        self.iter().copied().for_each(visitor);
    }
}

/// Two root sets visited one after the other.
pub struct Chain<'a>(pub &'a dyn RootProvider, pub &'a dyn RootProvider);

impl RootProvider for Chain<'_> {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Object)) {
        self.0.visit_roots(visitor);
        self.1.visit_roots(visitor);
    }
}

/// Collection hook registered on a [`Memory`].
pub trait GarbageCollector {
    /// Returns the number of bytes handed back to the free list.
    /// With `sweep` unset only marking happens, with `mark_all` every live
    /// entity is marked without tracing.
    fn collect(
        &mut self,
        memory: &mut Memory,
        roots: &dyn RootProvider,
        sweep: bool,
        mark_all: bool,
    ) -> Result<usize, VmError>;
}

/// Non-moving mark and sweep over one memory.
///
/// Only references into the collected memory's own bank are followed, and
/// only collectable kinds are swept. Entities with a non zero refcount are
/// roots on their own.
#[derive(Debug, Default)]
pub struct MarkSweep {
    worklist: Vec<EntityId>,
    pub collections: usize,
}

impl MarkSweep {
    pub fn new() -> Self {
        Self::default()
    }

    fn mark(&mut self, memory: &mut Memory, roots: &dyn RootProvider) -> Result<usize, VmError> {
        let bank = memory.bank();
        let worklist = &mut self.worklist;
        worklist.clear();
        roots.visit_roots(&mut |obj| match obj.entity() {
            Some(id) if obj.bank() == bank => worklist.push(id),
            _ => {}
        });
        for index in 1..memory.entity_count() {
            let id = EntityId(index as u32);
            let entity = memory.entity(id)?;
            if !entity.is_free() && entity.mark.refcount() > 0 {
                self.worklist.push(id);
            }
        }

        let mut marked = 0;
        let mut children = Vec::new();
        while let Some(id) = self.worklist.pop() {
            // stale references into discarded entities are not our problem here
            let Ok(entity) = memory.entity(id).copied() else {
                continue;
            };
            if entity.is_free() || entity.mark.is_marked() {
                continue;
            }
            memory.set_mark(id, entity.mark.with_marked(true))?;
            marked += 1;
            if entity.tag.kind().holds_objects() {
                children.clear();
                memory.for_each_slot(id, &mut |obj| match obj.entity() {
                    Some(child) if obj.bank() == bank => children.push(child),
                    _ => {}
                })?;
                self.worklist.extend_from_slice(&children);
            }
        }
        Ok(marked)
    }

    fn mark_everything(memory: &mut Memory) -> Result<usize, VmError> {
        let mut marked = 0;
        for index in 1..memory.entity_count() {
            let id = EntityId(index as u32);
            let entity = *memory.entity(id)?;
            if !entity.is_free() {
                memory.set_mark(id, entity.mark.with_marked(true))?;
                marked += 1;
            }
        }
        Ok(marked)
    }

    fn sweep(memory: &mut Memory) -> Result<usize, VmError> {
        let mut reclaimed = 0usize;
        for index in 1..memory.entity_count() {
            let id = EntityId(index as u32);
            let entity = *memory.entity(id)?;
            if entity.is_free() || entity.size == 0 || !entity.tag.kind().is_collectable() {
                continue;
            }
            if !entity.mark.is_marked() {
                trace!("sweeping {id} ({} bytes)", entity.size);
                memory.free(id)?;
                reclaimed += entity.size as usize;
            }
        }
        Ok(reclaimed)
    }

    fn clear_marks(memory: &mut Memory) -> Result<(), VmError> {
        for index in 1..memory.entity_count() {
            let id = EntityId(index as u32);
            let mark = memory.entity(id)?.mark;
            if mark.is_marked() {
                memory.set_mark(id, mark.with_marked(false))?;
            }
        }
        Ok(())
    }
}

impl GarbageCollector for MarkSweep {
    fn collect(
        &mut self,
        memory: &mut Memory,
        roots: &dyn RootProvider,
        sweep: bool,
        mark_all: bool,
    ) -> Result<usize, VmError> {
        let marked = if mark_all {
            Self::mark_everything(memory)?
        } else {
            self.mark(memory, roots)?
        };
        let reclaimed = if sweep { Self::sweep(memory)? } else { 0 };
        Self::clear_marks(memory)?;
        self.collections += 1;
        debug!(
            "{:?} collection #{}: {marked} live, {reclaimed} bytes reclaimed",
            memory.bank(),
            self.collections
        );
        Ok(reclaimed)
    }
}
