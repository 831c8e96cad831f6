use std::{collections::HashMap, sync::Arc};

use ahash::RandomState;
use parking_lot::RwLock;

/// Dense id of an interned name.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NameId(pub u32);

struct NamesImpl {
    ids: HashMap<Arc<str>, NameId, RandomState>,
    strings: Vec<Arc<str>>,
}

impl NamesImpl {
    fn new() -> Self {
        Self {
            ids: HashMap::with_hasher(RandomState::new()),
            strings: Vec::new(),
        }
    }

    fn get_or_add(&mut self, value: &str) -> NameId {
        if let Some(&id) = self.ids.get(value) {
            return id;
        }
        let id = NameId(self.strings.len() as u32);
        let interned = Arc::<str>::from(value);
        self.strings.push(interned.clone());
        self.ids.insert(interned, id);
        id
    }
}

/// Shared name table. Clones hand out the same table.
#[derive(Clone)]
pub struct Names(Arc<RwLock<NamesImpl>>);

impl Default for Names {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Names {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Names").field("len", &self.len()).finish()
    }
}

impl Names {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(NamesImpl::new())))
    }

    pub fn intern(&self, value: &str) -> NameId {
        if let Some(&id) = self.0.read().ids.get(value) {
            return id;
        }
        self.0.write().get_or_add(value)
    }

    pub fn lookup(&self, value: &str) -> Option<NameId> {
        self.0.read().ids.get(value).copied()
    }

    pub fn resolve(&self, id: NameId) -> Option<Arc<str>> {
        self.0.read().strings.get(id.0 as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.0.read().strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
