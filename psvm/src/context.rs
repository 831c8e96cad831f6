//! Cooperative execution contexts.
//!
//! A context owns a private local memory and its four stacks. Contexts never
//! run concurrently, a host decides which one runs next whenever an operator
//! returns [`VmError::ContextSwitch`].
use std::{collections::HashMap, fmt};

use ahash::RandomState;
use log::debug;

use crate::{
    Bank, EntityId, MarkSweep, Memory, Object, RootProvider, SegmentedStack, VmError,
    VmSettings, object::OBJECT_SIZE,
};

#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u32);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContextState {
    Run,
    /// blocked in `join` until its target finishes
    Wait,
    /// finished, operands kept for a `join`
    Zombie,
    /// ready to be reclaimed by the host
    Free,
}

#[derive(Debug, Clone)]
pub struct Stacks {
    pub operands: SegmentedStack,
    pub exec: SegmentedStack,
    pub dicts: SegmentedStack,
    /// arguments of the running native operator
    pub hold: SegmentedStack,
}

impl Stacks {
    pub fn new(settings: &VmSettings) -> Self {
        let segment = settings.segment_size;
        Self {
            operands: SegmentedStack::new(
                segment,
                settings.operand_stack_limit,
                VmError::StackOverflow,
            ),
            exec: SegmentedStack::new(segment, settings.exec_stack_limit, VmError::ExecStackOverflow),
            dicts: SegmentedStack::new(segment, settings.dict_stack_limit, VmError::DictStackOverflow),
            hold: SegmentedStack::new(segment, settings.operand_stack_limit, VmError::LimitCheck),
        }
    }
}

impl RootProvider for Stacks {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Object)) {
        self.operands.visit_roots(visitor);
        self.exec.visit_roots(visitor);
        self.dicts.visit_roots(visitor);
        self.hold.visit_roots(visitor);
    }
}

#[derive(Debug)]
pub struct Context {
    pub id: ContextId,
    pub state: ContextState,
    pub local: Memory,
    pub stacks: Stacks,
    /// object the interpreter is executing right now
    pub current: Object,
    /// operands the running operator consumed, if a failure should give them back
    pub restore_arity: Option<u8>,
    pub waiting_on: Option<ContextId>,
}

impl Context {
    pub fn new(id: ContextId, settings: &VmSettings) -> Result<Self, VmError> {
        let mut local = Memory::new(Bank::Local, settings)?;
        local.register_garbage_collector(Box::new(MarkSweep::new()));
        debug!("context {id} created");
        Ok(Self {
            id,
            state: ContextState::Run,
            local,
            stacks: Stacks::new(settings),
            current: Object::NULL,
            restore_arity: None,
            waiting_on: None,
        })
    }

    /// Collect the local memory, rooted in this context's stacks.
    pub fn collect_local(&mut self) -> Result<usize, VmError> {
        self.local.collect(&self.stacks, true, false)
    }
}

/// Global roots held by a context: its stacks and whatever its local
/// storage refers to.
impl RootProvider for Context {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Object)) {
        self.stacks.visit_roots(visitor);
        self.local.visit_stored_objects(visitor);
    }
}

/// What the core needs from whoever schedules contexts. The core keeps no
/// registry of its own.
pub trait ContextHost {
    fn allocate_id(&mut self) -> ContextId;
    /// Take ownership of a freshly forked context.
    fn adopt(&mut self, context: Context);
    /// Every context except the one currently running.
    fn resolve(&mut self, id: ContextId) -> Option<&mut Context>;
    /// Roots of every context the host holds.
    fn visit_roots(&self, visitor: &mut dyn FnMut(Object));
}

pub struct HostRoots<'a>(pub &'a dyn ContextHost);

impl RootProvider for HostRoots<'_> {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Object)) {
        self.0.visit_roots(visitor);
    }
}

/// Deep copy of local composites from one local memory into another.
///
/// Global objects pass through untouched. Sharing and cycles among the
/// copied entities are preserved. Target allocations never trigger a
/// collection since the copies are not reachable from any root yet.
#[derive(Default)]
pub struct Transfer {
    copied: HashMap<EntityId, EntityId, RandomState>,
    pending: Vec<EntityId>,
}

impl Transfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn copy(&mut self, obj: Object, from: &Memory, to: &mut Memory) -> Result<Object, VmError> {
        let result = self.map(obj, from, to)?;
        while let Some(fresh) = self.pending.pop() {
            let size = to.get_size(fresh)?;
            for offset in (0..size).step_by(OBJECT_SIZE as usize) {
                let slot = to.read_object(fresh, offset)?;
                if slot.bank() == Bank::Local && slot.is_composite() {
                    let mapped = self.map(slot, from, to)?;
                    to.write_object(fresh, offset, mapped)?;
                }
            }
        }
        Ok(result)
    }

    fn map(&mut self, obj: Object, from: &Memory, to: &mut Memory) -> Result<Object, VmError> {
        let Some(old) = obj.entity() else {
            return Ok(obj);
        };
        if obj.bank() == Bank::Global {
            return Ok(obj);
        }
        if let Some(&fresh) = self.copied.get(&old) {
            return Ok(obj.rebased(fresh));
        }
        let entity = *from.entity(old)?;
        let fresh = to.allocate_without_gc(entity.size, entity.tag)?;
        if entity.tag.owns_resource() {
            let file = from.resources.duplicate(from.resource_id(old)?)?;
            let resource = to.resources.insert(file);
            to.put(fresh, 0, &resource.0.to_le_bytes())?;
        } else if entity.size > 0 {
            to.put(fresh, 0, from.bytes(old)?)?;
        }
        self.copied.insert(old, fresh);
        if entity.tag.kind().holds_objects() {
            self.pending.push(fresh);
        }
        Ok(obj.rebased(fresh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NoRoots, Type};

    fn memory() -> Memory {
        Memory::new(Bank::Local, &VmSettings::default()).expect("memory")
    }

    #[test]
    fn transfer_copies_nested_local_composites() {
        let mut from = memory();
        let mut to = memory();
        let text = from.new_string(b"payload", &NoRoots).unwrap();
        let outer = from.new_array(2, &NoRoots).unwrap();
        from.array_put(&outer, 0, text).unwrap();
        from.array_put(&outer, 1, Object::int(4)).unwrap();

        let copied = Transfer::new().copy(outer, &from, &mut to).unwrap();
        assert_eq!(copied.ty(), Type::Array);
        let inner = to.array_get(&copied, 0).unwrap();
        assert_eq!(to.string_bytes(&inner).unwrap(), b"payload");
        assert_eq!(to.array_get(&copied, 1).unwrap(), Object::int(4));
    }

    #[test]
    fn transfer_preserves_sharing_and_cycles() {
        let mut from = memory();
        let mut to = memory();
        let a = from.new_array(2, &NoRoots).unwrap();
        let shared = from.new_string(b"x", &NoRoots).unwrap();
        from.array_put(&a, 0, a).unwrap();
        from.array_put(&a, 1, shared).unwrap();

        let mut transfer = Transfer::new();
        let copy = transfer.copy(a, &from, &mut to).unwrap();
        let again = transfer.copy(shared, &from, &mut to).unwrap();
        assert_eq!(to.array_get(&copy, 0).unwrap(), copy, "self reference is kept");
        assert_eq!(to.array_get(&copy, 1).unwrap(), again, "shared string copied once");
    }

    #[test]
    fn global_objects_pass_through() {
        let from = memory();
        let mut to = memory();
        let global = Object::composite(Type::String, Bank::Global, EntityId(7), 0, 3);
        assert_eq!(Transfer::new().copy(global, &from, &mut to).unwrap(), global);
        assert_eq!(Transfer::new().copy(Object::int(1), &from, &mut to).unwrap(), Object::int(1));
    }

    #[test]
    fn context_roots_cover_stacks_and_stored_globals() {
        let mut context = Context::new(ContextId(1), &VmSettings::default()).unwrap();
        let global = Object::composite(Type::String, Bank::Global, EntityId(3), 0, 1);
        let arr = context.local.new_array(1, &NoRoots).unwrap();
        context.local.array_put(&arr, 0, global).unwrap();
        context.stacks.operands.push(Object::int(1)).unwrap();

        let mut seen = Vec::new();
        context.visit_roots(&mut |obj| seen.push(obj));
        assert!(seen.contains(&Object::int(1)));
        assert!(seen.contains(&global));
    }

    #[test]
    fn local_collection_is_rooted_in_the_stacks() {
        let mut context = Context::new(ContextId(1), &VmSettings::default()).unwrap();
        let kept = context.local.new_string(b"kept", &NoRoots).unwrap();
        context.local.new_string(b"gone", &NoRoots).unwrap();
        context.stacks.operands.push(kept).unwrap();
        assert_eq!(context.collect_local().unwrap(), 8);
    }
}
