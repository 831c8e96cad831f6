use std::io::Write;

use log::{error, info, trace, warn};

use crate::{
    Bank, Context, ContextHost, ContextState, MarkSweep, Memory, Names, Object, OpContext,
    OpResult, Opcode, OperatorTable, SystemOps, Type, VmCreateInfo, VmError, VmSettings,
    object::OBJECT_SIZE, ops,
};

/// How a turn of a context ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Turn {
    /// an operator asked to hand control to another context
    Switched,
    /// the exec stack ran dry
    Finished,
    Failed(VmError),
}

/// State shared by every context: the global memory, the name table and the
/// operator registry.
pub struct Vm {
    pub settings: VmSettings,
    pub global: Memory,
    pub names: Names,
    pub operators: OperatorTable,
    pub system: SystemOps,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("global", &self.global)
            .field("names", &self.names)
            .field("operators", &self.operators)
            .finish()
    }
}

impl Vm {
    pub fn new(info: &VmCreateInfo) -> Result<Self, VmError> {
        let settings = VmSettings::from_info(info).map_err(|reason| {
            error!("invalid vm settings: {reason}");
            VmError::LimitCheck
        })?;
        let mut global = Memory::new(Bank::Global, &settings)?;
        global.register_garbage_collector(Box::new(MarkSweep::new()));

        let names = Names::new();
        let mut operators = OperatorTable::new(&mut global)?;
        ops::register(&mut operators, &mut global, &names)?;

        let system_op = |name: &str| {
            names
                .lookup(name)
                .and_then(|id| operators.lookup(id))
                .ok_or(VmError::Unregistered)
        };
        let system = SystemOps {
            zombie: system_op(".zombie")?,
            free: system_op(".free")?,
            join: system_op("join")?,
        };
        info!(
            "vm started with {} operators, global arena {} bytes",
            operators.len(),
            global.arena().max()
        );
        Ok(Self {
            settings,
            global,
            names,
            operators,
            system,
        })
    }

    /// A fresh context whose id comes from `host`. The caller decides who owns it.
    pub fn new_context(&self, host: &mut dyn ContextHost) -> Result<Context, VmError> {
        Context::new(host.allocate_id(), &self.settings)
    }

    pub fn opcode(&self, name: &str) -> Option<Opcode> {
        self.names
            .lookup(name)
            .and_then(|id| self.operators.lookup(id))
    }

    /// An executable name object, resolved through the operator table when run.
    pub fn word(&self, name: &str) -> Object {
        Object::executable_name(self.names.intern(name))
    }

    /// Dispatch one operator on `context`.
    pub fn dispatch(
        &mut self,
        opcode: Opcode,
        context: &mut Context,
        host: &mut dyn ContextHost,
        out: &mut dyn Write,
    ) -> OpResult {
        let Vm {
            settings,
            global,
            names,
            operators,
            system,
        } = self;
        let mut ctx = OpContext {
            global,
            names,
            operators,
            system: *system,
            settings,
            context,
            host,
            out,
        };
        operators.exec(opcode, &mut ctx)
    }

    /// Run `context` until it switches, runs out of work or fails.
    pub fn run_turn(
        &mut self,
        context: &mut Context,
        host: &mut dyn ContextHost,
        out: &mut dyn Write,
    ) -> Turn {
        loop {
            let Some(obj) = context.stacks.exec.pop() else {
                return Turn::Finished;
            };
            match self.execute(obj, context, host, out) {
                Ok(()) => {}
                Err(err) if err.is_control_signal() => return Turn::Switched,
                Err(err) => {
                    self.fail(context, err);
                    return Turn::Failed(err);
                }
            }
        }
    }

    fn execute(
        &mut self,
        obj: Object,
        context: &mut Context,
        host: &mut dyn ContextHost,
        out: &mut dyn Write,
    ) -> OpResult {
        if !obj.is_executable() {
            return context.stacks.operands.push(obj);
        }
        match obj.ty() {
            Type::Operator => {
                let opcode = obj.as_opcode().ok_or(VmError::TypeCheck)?;
                context.current = obj;
                self.dispatch(opcode, context, host, out)
            }
            Type::Name => {
                let opcode = obj
                    .as_name()
                    .and_then(|id| self.operators.lookup(id))
                    .ok_or(VmError::Unregistered)?;
                context.current = Object::operator(opcode);
                self.dispatch(opcode, context, host, out)
            }
            Type::Array => self.step(obj, context),
            Type::Null => Ok(()),
            _ => context.stacks.operands.push(obj),
        }
    }

    /// Run the first element of a procedure and schedule the rest.
    fn step(&self, proc: Object, context: &mut Context) -> OpResult {
        if proc.length() == 0 {
            return Ok(());
        }
        let memory = match proc.bank() {
            Bank::Global => &self.global,
            Bank::Local => &context.local,
        };
        let first = memory.array_get(&proc, 0)?;
        if proc.length() > 1 {
            let rest = proc.interval(1, proc.length() - 1, OBJECT_SIZE)?;
            context.stacks.exec.push(rest)?;
        }
        // procedures met inside a procedure are data
        if first.is_proc() || !first.is_executable() {
            context.stacks.operands.push(first)
        } else {
            context.stacks.exec.push(first)
        }
    }

    /// Give back the failed operator's operands, report the error and retire
    /// the context.
    fn fail(&self, context: &mut Context, err: VmError) {
        let stacks = &mut context.stacks;
        if let Some(arity) = context.restore_arity.take() {
            for depth in (0..arity as usize).rev() {
                let Some(obj) = stacks.hold.topdown_fetch(depth) else {
                    continue;
                };
                if stacks.operands.push(obj).is_err() {
                    break;
                }
            }
        }
        stacks.hold.clear();

        let name = Object::name(self.names.intern(err.name()));
        if stacks.operands.push(name).is_err() {
            trace!("{} has no room for the error name", context.id);
        }
        warn!("{} failed: {err} in {}", context.id, context.current);

        let free = Object::operator(self.system.free);
        context.state = if stacks.exec.bottomup_fetch(0) == Some(free) {
            ContextState::Free
        } else {
            ContextState::Zombie
        };
        stacks.exec.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NoRoots, Scheduler};

    fn setup() -> (Vm, Context, Scheduler) {
        let vm = Vm::new(&VmCreateInfo::default()).unwrap();
        let mut host = Scheduler::new();
        let context = vm.new_context(&mut host).unwrap();
        (vm, context, host)
    }

    #[test]
    fn invalid_settings_are_a_limitcheck() {
        let info = VmCreateInfo {
            segment_size: Some(0),
            ..Default::default()
        };
        assert_eq!(Vm::new(&info).err(), Some(VmError::LimitCheck));
    }

    #[test]
    fn procedures_run_element_by_element() {
        let (mut vm, mut context, mut host) = setup();
        let add = vm.word("add");
        let program = vm
            .global
            .new_proc(&[Object::int(2), Object::int(3), add], &NoRoots)
            .unwrap();
        context.stacks.exec.push(program).unwrap();
        let turn = vm.run_turn(&mut context, &mut host, &mut Vec::new());
        assert_eq!(turn, Turn::Finished);
        assert_eq!(context.stacks.operands.pop(), Some(Object::int(5)));
    }

    #[test]
    fn nested_procedures_are_pushed_not_run() {
        let (mut vm, mut context, mut host) = setup();
        let add = vm.word("add");
        let inner = vm.global.new_proc(&[add], &NoRoots).unwrap();
        let program = vm.global.new_proc(&[inner], &NoRoots).unwrap();
        context.stacks.exec.push(program).unwrap();
        vm.run_turn(&mut context, &mut host, &mut Vec::new());
        assert_eq!(context.stacks.operands.pop(), Some(inner));
    }

    #[test]
    fn unknown_words_are_unregistered() {
        let (mut vm, mut context, mut host) = setup();
        context.stacks.exec.push(vm.word("nosuchop")).unwrap();
        let turn = vm.run_turn(&mut context, &mut host, &mut Vec::new());
        assert_eq!(turn, Turn::Failed(VmError::Unregistered));
        assert_eq!(context.state, ContextState::Zombie);
    }

    #[test]
    fn failure_gives_back_the_operands_and_names_the_error() {
        let (mut vm, mut context, mut host) = setup();
        let add = vm.word("add");
        let program = vm
            .global
            .new_proc(&[Object::int(1), Object::boolean(true), add, Object::int(9)], &NoRoots)
            .unwrap();
        context.stacks.exec.push(program).unwrap();
        let turn = vm.run_turn(&mut context, &mut host, &mut Vec::new());
        assert_eq!(turn, Turn::Failed(VmError::TypeCheck));
        let typecheck = Object::name(vm.names.intern("typecheck"));
        let operands: Vec<_> = context.stacks.operands.iter().collect();
        assert_eq!(operands, vec![Object::int(1), Object::boolean(true), typecheck]);
        assert!(context.stacks.exec.is_empty(), "the rest of the program is dropped");
        assert_eq!(context.stacks.hold.count(), 0);
    }

    #[test]
    fn consumed_operands_come_back_after_a_failing_native() {
        let (mut vm, mut context, mut host) = setup();
        let index = vm.word("index");
        let program = vm.global.new_proc(&[Object::int(-1), index], &NoRoots).unwrap();
        context.stacks.exec.push(program).unwrap();
        let turn = vm.run_turn(&mut context, &mut host, &mut Vec::new());
        assert_eq!(turn, Turn::Failed(VmError::RangeCheck));
        let operands: Vec<_> = context.stacks.operands.iter().collect();
        assert_eq!(operands, vec![Object::int(-1), Object::name(vm.names.intern("rangecheck"))]);
    }
}
