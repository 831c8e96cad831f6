use std::fs::File;

use log::{debug, warn};

use crate::VmError;

#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId(pub u32);

/// External handles owned by one memory, referenced from `File` entities.
#[derive(Debug, Default)]
pub struct ResourceTable {
    slots: Vec<Option<File>>,
    vacant: Vec<u32>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, file: File) -> ResourceId {
        match self.vacant.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(file);
                ResourceId(slot)
            }
            None => {
                self.slots.push(Some(file));
                ResourceId(self.slots.len() as u32 - 1)
            }
        }
    }

    pub fn get(&self, id: ResourceId) -> Result<&File, VmError> {
        self.slots
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(VmError::InvalidFileAccess)
    }

    pub fn get_mut(&mut self, id: ResourceId) -> Result<&mut File, VmError> {
        self.slots
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(VmError::InvalidFileAccess)
    }

    /// Close the handle. Returns false if the slot was already empty.
    pub fn release(&mut self, id: ResourceId) -> bool {
        match self.slots.get_mut(id.0 as usize).and_then(Option::take) {
            Some(file) => {
                drop(file);
                self.vacant.push(id.0);
                debug!("released resource {}", id.0);
                true
            }
            None => {
                warn!("resource {} released twice", id.0);
                false
            }
        }
    }

    /// A second handle to the same open file, for another table.
    pub fn duplicate(&self, id: ResourceId) -> Result<File, VmError> {
        self.get(id)?
            .try_clone()
            .map_err(|_| VmError::InvalidFileAccess)
    }

    pub fn live(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}
