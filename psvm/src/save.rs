use log::debug;

use crate::{
    EntityId, Memory, VmError,
    entity::{Entity, Mark},
};

/// Depth of the save stack right after a `save`, starting at 1.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SaveLevel(pub u32);

/// Entity state as it was before its first write at some save level.
#[derive(Debug)]
pub(crate) struct Snapshot {
    id: EntityId,
    entity: Entity,
    bytes: Box<[u8]>,
}

#[derive(Debug)]
pub(crate) struct SaveRecord {
    next_entity: usize,
    used: u32,
    snapshots: Vec<Snapshot>,
}

impl Memory {
    /// Current save depth, 0 when nothing is saved.
    #[inline]
    pub fn level(&self) -> u32 {
        self.saves.len() as u32
    }

    pub fn save(&mut self) -> Result<SaveLevel, VmError> {
        if self.level() >= Mark::MAX_LEVEL {
            return Err(VmError::LimitCheck);
        }
        self.saves.push(SaveRecord {
            next_entity: self.entity_count(),
            used: self.arena.used(),
            snapshots: Vec::new(),
        });
        debug!("{:?} save, level {}", self.bank(), self.level());
        Ok(SaveLevel(self.level()))
    }

    /// Undo every change made since the matching `save`, including the saves
    /// nested inside it. Levels must be restored innermost first.
    pub fn restore(&mut self, level: SaveLevel) -> Result<(), VmError> {
        if level.0 == 0 || level.0 > self.level() {
            return Err(VmError::InvalidRestore);
        }
        while self.level() >= level.0 {
            let Some(record) = self.saves.pop() else {
                break;
            };
            let replayed = record.snapshots.len();
            for snapshot in record.snapshots.into_iter().rev() {
                if snapshot.entity.size > 0 {
                    self.arena
                        .bytes_mut(snapshot.entity.address, snapshot.entity.size)?
                        .copy_from_slice(&snapshot.bytes);
                }
                self.entities[snapshot.id.index()] = snapshot.entity;
            }
            let discarded = self.entity_count().saturating_sub(record.next_entity);
            for index in record.next_entity..self.entity_count() {
                self.release_resource_of(EntityId(index as u32));
            }
            self.entities.truncate(record.next_entity);
            self.arena.truncate(record.used)?;
            debug!(
                "{:?} restore to level {}: {replayed} entities rolled back, {discarded} discarded",
                self.bank(),
                self.level()
            );
        }
        Ok(())
    }

    /// Whether `id` was created after `level` was saved and would vanish on restore.
    pub fn created_after(&self, id: EntityId, level: SaveLevel) -> bool {
        match level.0.checked_sub(1).and_then(|i| self.saves.get(i as usize)) {
            Some(record) => id.index() >= record.next_entity,
            None => false,
        }
    }

    /// Snapshot an entity before its first mutation at the current level.
    pub(crate) fn touch(&mut self, id: EntityId) -> Result<(), VmError> {
        let level = self.level();
        if level == 0 {
            return Ok(());
        }
        let entity = *self.entity(id)?;
        if entity.mark.created() >= level || entity.mark.snapshot() >= level {
            return Ok(());
        }
        let bytes: Box<[u8]> = if entity.size == 0 {
            Box::default()
        } else {
            self.arena.bytes(entity.address, entity.size)?.into()
        };
        if let Some(record) = self.saves.last_mut() {
            record.snapshots.push(Snapshot { id, entity, bytes });
        }
        self.entities[id.index()].mark = entity.mark.with_snapshot(level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Bank, EntityKind, EntityTag, NoRoots, VmSettings};

    fn memory() -> Memory {
        Memory::new(Bank::Local, &VmSettings::default()).expect("memory")
    }

    fn word(m: &Memory, id: EntityId) -> u32 {
        let mut buf = [0u8; 4];
        m.get(id, 0, &mut buf).unwrap();
        u32::from_le_bytes(buf)
    }

    fn set_word(m: &mut Memory, id: EntityId, value: u32) {
        m.put(id, 0, &value.to_le_bytes()).unwrap();
    }

    #[test]
    fn nested_restores_undo_one_level_at_a_time() {
        let mut m = memory();
        let x = m.table_alloc(8, EntityTag::new(EntityKind::String)).unwrap();
        set_word(&mut m, x, 1);

        let outer = m.save().unwrap();
        set_word(&mut m, x, 2);
        let inner = m.save().unwrap();
        set_word(&mut m, x, 3);
        assert_eq!((outer, inner), (SaveLevel(1), SaveLevel(2)));

        m.restore(inner).unwrap();
        assert_eq!(word(&m, x), 2, "inner restore undoes only the second write");
        m.restore(outer).unwrap();
        assert_eq!(word(&m, x), 1, "outer restore brings back the original");
        assert_eq!(m.level(), 0);
    }

    #[test]
    fn restore_discards_entities_and_arena_space() {
        let mut m = memory();
        let before = (m.entity_count(), m.arena().used());
        let level = m.save().unwrap();
        let fresh = m.table_alloc(64, EntityTag::new(EntityKind::String)).unwrap();
        assert!(m.created_after(fresh, level));
        m.restore(level).unwrap();
        assert_eq!((m.entity_count(), m.arena().used()), before);
        assert!(m.entity(fresh).is_err());
    }

    #[test]
    fn restoring_an_outer_level_pops_inner_ones() {
        let mut m = memory();
        let x = m.table_alloc(8, EntityTag::new(EntityKind::String)).unwrap();
        let outer = m.save().unwrap();
        set_word(&mut m, x, 5);
        m.save().unwrap();
        set_word(&mut m, x, 6);
        m.restore(outer).unwrap();
        assert_eq!(word(&m, x), 0);
        assert_eq!(m.restore(outer), Err(VmError::InvalidRestore));
    }

    #[test]
    fn frees_after_a_save_are_undone() {
        let mut m = memory();
        let a = m.allocate(16, EntityTag::new(EntityKind::String), &NoRoots).unwrap();
        set_word(&mut m, a, 77);
        let level = m.save().unwrap();
        m.free(a).unwrap();
        let reused = m.allocate(16, EntityTag::new(EntityKind::Array), &NoRoots).unwrap();
        assert_eq!(reused, a);

        m.restore(level).unwrap();
        assert_eq!(m.get_tag(a).unwrap(), EntityTag::new(EntityKind::String));
        assert_eq!(word(&m, a), 77);
        assert!(m.free_entities().unwrap().is_empty(), "free list is back to empty");
    }

    #[test]
    fn invalid_levels_are_rejected() {
        let mut m = memory();
        assert_eq!(m.restore(SaveLevel(0)), Err(VmError::InvalidRestore));
        assert_eq!(m.restore(SaveLevel(1)), Err(VmError::InvalidRestore));
    }
}
