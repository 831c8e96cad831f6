//! A round-robin host for cooperative contexts.
use std::{
    collections::{HashMap, VecDeque},
    io::Write,
};

use ahash::RandomState;
use log::{debug, error, info};

use crate::{
    Context, ContextHost, ContextId, ContextState, Object, RootProvider, Turn, Vm, VmError,
};

#[derive(Debug)]
pub struct Scheduler {
    contexts: HashMap<ContextId, Context, RandomState>,
    queue: VecDeque<ContextId>,
    next_id: u32,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            contexts: HashMap::with_hasher(RandomState::new()),
            queue: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Queue a new context that runs `program` and becomes a zombie afterwards.
    /// `program` has to be global or simple, a fresh context has no local
    /// storage yet.
    pub fn spawn(&mut self, vm: &Vm, program: Object) -> Result<ContextId, VmError> {
        let mut context = vm.new_context(self)?;
        context
            .stacks
            .exec
            .push(Object::operator(vm.system.zombie))?;
        context.stacks.exec.push(program)?;
        let id = context.id;
        self.adopt(context);
        info!("spawned {id}");
        Ok(id)
    }

    pub fn context(&self, id: ContextId) -> Option<&Context> {
        self.contexts.get(&id)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Run until no context can make progress. Zombies that were never
    /// joined stay behind for [`Scheduler::context`].
    pub fn run(&mut self, vm: &mut Vm, out: &mut dyn Write) -> Result<(), VmError> {
        while let Some(id) = self.next_runnable()? {
            let Some(mut context) = self.contexts.remove(&id) else {
                continue;
            };
            // a waiting context retries its join
            context.state = ContextState::Run;
            match vm.run_turn(&mut context, self, out) {
                Turn::Switched => {}
                Turn::Finished => context.state = ContextState::Zombie,
                Turn::Failed(err) => debug!("{id} retired after {err}"),
            }
            match context.state {
                ContextState::Run | ContextState::Wait => self.queue.push_back(id),
                ContextState::Zombie | ContextState::Free => {}
            }
            self.contexts.insert(id, context);
            self.reap();
        }
        Ok(())
    }

    fn next_runnable(&mut self) -> Result<Option<ContextId>, VmError> {
        let mut blocked = 0;
        while let Some(id) = self.queue.pop_front() {
            let Some(context) = self.contexts.get(&id) else {
                continue;
            };
            match context.state {
                ContextState::Run => return Ok(Some(id)),
                ContextState::Wait => {
                    let ready = context
                        .waiting_on
                        .and_then(|target| self.contexts.get(&target))
                        .is_none_or(|target| {
                            !matches!(target.state, ContextState::Run | ContextState::Wait)
                        });
                    if ready {
                        return Ok(Some(id));
                    }
                    self.queue.push_back(id);
                    blocked += 1;
                    if blocked > self.queue.len() {
                        error!("deadlock: {} contexts wait on each other", self.queue.len());
                        return Err(VmError::InvalidContext);
                    }
                }
                ContextState::Zombie | ContextState::Free => {}
            }
        }
        Ok(None)
    }

    fn reap(&mut self) {
        self.contexts.retain(|id, context| {
            let keep = context.state != ContextState::Free;
            if !keep {
                debug!("reaping {id}");
            }
            keep
        });
    }
}

impl ContextHost for Scheduler {
    fn allocate_id(&mut self) -> ContextId {
        let id = ContextId(self.next_id);
        self.next_id += 1;
        id
    }

    fn adopt(&mut self, context: Context) {
        let id = context.id;
        self.contexts.insert(id, context);
        self.queue.push_back(id);
    }

    fn resolve(&mut self, id: ContextId) -> Option<&mut Context> {
        self.contexts.get_mut(&id)
    }

    fn visit_roots(&self, visitor: &mut dyn FnMut(Object)) {
        for context in self.contexts.values() {
            RootProvider::visit_roots(context, visitor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NoRoots, VmCreateInfo};

    fn vm() -> Vm {
        Vm::new(&VmCreateInfo::default()).unwrap()
    }

    fn program(vm: &mut Vm, words: &[&str], prefix: &[Object]) -> Object {
        let mut elements = prefix.to_vec();
        elements.extend(words.iter().map(|word| vm.word(word)));
        vm.global.new_proc(&elements, &NoRoots).unwrap()
    }

    fn operands(host: &Scheduler, id: ContextId) -> Vec<Object> {
        host.context(id).unwrap().stacks.operands.iter().collect()
    }

    #[test]
    fn forked_operands_come_back_in_order() {
        let mut vm = vm();
        let body = vm.global.new_proc(&[], &NoRoots).unwrap();
        let mark = vm.word("mark");
        let fork = vm.word("fork");
        let join = vm.word("join");
        let root = vm
            .global
            .new_proc(
                &[mark, Object::int(1), Object::int(2), Object::int(3), body, fork, join],
                &NoRoots,
            )
            .unwrap();

        let mut host = Scheduler::new();
        let id = host.spawn(&vm, root).unwrap();
        host.run(&mut vm, &mut Vec::new()).unwrap();

        assert_eq!(
            operands(&host, id),
            vec![Object::mark(), Object::int(1), Object::int(2), Object::int(3)]
        );
        assert_eq!(host.context(id).unwrap().state, ContextState::Zombie);
        assert_eq!(host.len(), 1, "the joined child has been reaped");
    }

    #[test]
    fn children_compute_while_the_parent_waits() {
        let mut vm = vm();
        let body = program(&mut vm, &["add", "yield", "add"], &[]);
        let mut elements = vec![vm.word("mark")];
        elements.extend([Object::int(1), Object::int(2), Object::int(3), body]);
        elements.extend([vm.word("fork"), vm.word("join")]);
        let root = vm.global.new_proc(&elements, &NoRoots).unwrap();

        let mut host = Scheduler::new();
        let id = host.spawn(&vm, root).unwrap();
        host.run(&mut vm, &mut Vec::new()).unwrap();
        assert_eq!(operands(&host, id), vec![Object::mark(), Object::int(6)]);
    }

    #[test]
    fn detached_children_are_reaped() {
        let mut vm = vm();
        let body = vm.global.new_proc(&[Object::int(1)], &NoRoots).unwrap();
        let mut elements = vec![vm.word("mark"), body, vm.word("fork"), vm.word("detach")];
        elements.push(Object::int(7));
        let root = vm.global.new_proc(&elements, &NoRoots).unwrap();

        let mut host = Scheduler::new();
        let id = host.spawn(&vm, root).unwrap();
        host.run(&mut vm, &mut Vec::new()).unwrap();
        assert_eq!(operands(&host, id), vec![Object::int(7)]);
        assert_eq!(host.len(), 1);
    }

    #[test]
    fn mutual_joins_are_a_deadlock() {
        let mut vm = vm();
        let body = program(&mut vm, &["join"], &[]);
        let mut elements = vec![vm.word("mark"), vm.word("currentcontext"), body];
        elements.extend([vm.word("fork"), vm.word("join")]);
        let root = vm.global.new_proc(&elements, &NoRoots).unwrap();

        let mut host = Scheduler::new();
        host.spawn(&vm, root).unwrap();
        assert_eq!(host.run(&mut vm, &mut Vec::new()), Err(VmError::InvalidContext));
    }

    #[test]
    fn failures_stop_only_the_failing_context() {
        let mut vm = vm();
        let bad = program(&mut vm, &["add"], &[Object::boolean(true)]);
        let good = program(&mut vm, &["add"], &[Object::int(1), Object::int(1)]);

        let mut host = Scheduler::new();
        let bad_id = host.spawn(&vm, bad).unwrap();
        let good_id = host.spawn(&vm, good).unwrap();
        host.run(&mut vm, &mut Vec::new()).unwrap();

        let underflow = Object::name(vm.names.intern("stackunderflow"));
        assert_eq!(operands(&host, bad_id), vec![Object::boolean(true), underflow]);
        assert_eq!(operands(&host, good_id), vec![Object::int(2)]);
    }

    #[test]
    fn output_goes_to_the_given_writer() {
        let mut vm = vm();
        let root = program(&mut vm, &["add", "=="], &[Object::int(20), Object::int(22)]);
        let mut host = Scheduler::new();
        host.spawn(&vm, root).unwrap();
        let mut out = Vec::new();
        host.run(&mut vm, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "42\n");
    }
}
