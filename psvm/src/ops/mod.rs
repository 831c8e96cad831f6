//! Builtin operators registered when a [`Vm`](crate::Vm) starts.
use log::debug;

use crate::{Memory, Names, NativeFn, OperatorTable, Pattern, Type, VmError};

mod access;
mod arith;
mod context;
mod print;
mod stack;
mod vm;

/// One signature of a builtin. Several defs may share a name, they are
/// consed in table order so earlier ones win ties.
#[derive(Debug, Copy, Clone)]
pub struct OperatorDef {
    pub name: &'static str,
    pub native: NativeFn,
    pub out_arity: u8,
    pub pattern: &'static [Pattern],
}

impl OperatorDef {
    pub const fn new(
        name: &'static str,
        native: NativeFn,
        out_arity: u8,
        pattern: &'static [Pattern],
    ) -> Self {
        Self {
            name,
            native,
            out_arity,
            pattern,
        }
    }
}

const INT: Pattern = Pattern::Type(Type::Integer);

const NONE: &[Pattern] = &[];
const ANY: &[Pattern] = &[Pattern::Any];
const ANY2: &[Pattern] = &[Pattern::Any, Pattern::Any];
const INT1: &[Pattern] = &[INT];
const INT2: &[Pattern] = &[INT, INT];
const FLOAT1: &[Pattern] = &[Pattern::Float];
const FLOAT2: &[Pattern] = &[Pattern::Float, Pattern::Float];
const PROC: &[Pattern] = &[Pattern::Proc];
const SAVE: &[Pattern] = &[Pattern::Type(Type::Save)];
const CONTEXT: &[Pattern] = &[Pattern::Type(Type::Context)];

use NativeFn::{Arity0, Arity1, Arity2};

pub const OPERATORS: &[OperatorDef] = &[
    OperatorDef::new("pop", Arity1(stack::pop), 0, ANY),
    OperatorDef::new("exch", Arity2(stack::exch), 2, ANY2),
    OperatorDef::new("dup", Arity1(stack::dup), 2, ANY),
    OperatorDef::new("clear", Arity0(stack::clear), 0, NONE),
    OperatorDef::new("count", Arity0(stack::count), 1, NONE),
    OperatorDef::new("mark", Arity0(stack::mark), 1, NONE),
    OperatorDef::new("cleartomark", Arity0(stack::cleartomark), 0, NONE),
    OperatorDef::new("counttomark", Arity0(stack::counttomark), 1, NONE),
    OperatorDef::new("index", Arity1(stack::index), 1, INT1),
    OperatorDef::new("add", Arity2(arith::int_add), 1, INT2),
    OperatorDef::new("add", Arity2(arith::real_add), 1, FLOAT2),
    OperatorDef::new("sub", Arity2(arith::int_sub), 1, INT2),
    OperatorDef::new("sub", Arity2(arith::real_sub), 1, FLOAT2),
    OperatorDef::new("mul", Arity2(arith::int_mul), 1, INT2),
    OperatorDef::new("mul", Arity2(arith::real_mul), 1, FLOAT2),
    OperatorDef::new("neg", Arity1(arith::int_neg), 1, INT1),
    OperatorDef::new("neg", Arity1(arith::real_neg), 1, FLOAT1),
    OperatorDef::new("cvlit", Arity1(access::cvlit), 1, ANY),
    OperatorDef::new("cvx", Arity1(access::cvx), 1, ANY),
    OperatorDef::new("xcheck", Arity1(access::xcheck), 1, ANY),
    OperatorDef::new("executeonly", Arity1(access::executeonly), 1, ANY),
    OperatorDef::new("noaccess", Arity1(access::noaccess), 1, ANY),
    OperatorDef::new("readonly", Arity1(access::readonly), 1, ANY),
    OperatorDef::new("rcheck", Arity1(access::rcheck), 1, ANY),
    OperatorDef::new("wcheck", Arity1(access::wcheck), 1, ANY),
    OperatorDef::new("save", Arity0(vm::save), 1, NONE),
    OperatorDef::new("restore", Arity1(vm::restore), 0, SAVE),
    OperatorDef::new("vmstatus", Arity0(vm::vmstatus), 3, NONE),
    OperatorDef::new("vmreclaim", Arity1(vm::vmreclaim), 0, INT1),
    OperatorDef::new("fork", Arity1(context::fork), 1, PROC),
    OperatorDef::new("join", Arity1(context::join), 0, CONTEXT),
    OperatorDef::new("yield", Arity0(context::yield_now), 0, NONE),
    OperatorDef::new("detach", Arity1(context::detach), 0, CONTEXT),
    OperatorDef::new("currentcontext", Arity0(context::currentcontext), 1, NONE),
    OperatorDef::new(".zombie", Arity0(context::zombie), 0, NONE),
    OperatorDef::new(".free", Arity0(context::free), 0, NONE),
    OperatorDef::new("==", Arity1(print::print), 0, ANY),
];

/// Cons every builtin signature into `table`.
pub fn register(
    table: &mut OperatorTable,
    global: &mut Memory,
    names: &Names,
) -> Result<(), VmError> {
    for def in OPERATORS {
        let name = names.intern(def.name);
        table.cons(global, name, def.native, def.out_arity, def.pattern)?;
    }
    debug!(
        "registered {} builtin signatures under {} names",
        OPERATORS.len(),
        table.len()
    );
    Ok(())
}

#[cfg(test)]
pub(crate) mod harness {
    use crate::{Context, Object, OpResult, Scheduler, Vm, VmCreateInfo};

    /// A VM with one context that is not owned by the scheduler.
    pub struct Harness {
        pub vm: Vm,
        pub context: Context,
        pub host: Scheduler,
        pub out: Vec<u8>,
    }

    impl Harness {
        pub fn new() -> Self {
            let vm = Vm::new(&VmCreateInfo::default()).expect("vm");
            let mut host = Scheduler::new();
            let context = vm.new_context(&mut host).expect("context");
            Self {
                vm,
                context,
                host,
                out: Vec::new(),
            }
        }

        pub fn push(&mut self, obj: Object) {
            self.context.stacks.operands.push(obj).expect("push");
        }

        /// Dispatch `name` the way the interpreter does, as the current object.
        pub fn call(&mut self, name: &str) -> OpResult {
            let opcode = self.vm.opcode(name).expect("builtin");
            self.context.current = Object::operator(opcode);
            self.vm
                .dispatch(opcode, &mut self.context, &mut self.host, &mut self.out)
        }

        pub fn operands(&self) -> Vec<Object> {
            self.context.stacks.operands.iter().collect()
        }

        pub fn output(&self) -> String {
            String::from_utf8_lossy(&self.out).into_owned()
        }
    }
}
