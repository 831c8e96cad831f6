//! Cooperative context operators.
//!
//! Everything that needs another context to make progress reports
//! [`VmError::ContextSwitch`] and leaves the rest to the host.
use log::info;

use crate::{Context, ContextState, Object, OpContext, OpResult, Transfer, VmError};

/// `mark obj1 .. objn proc fork context`
///
/// A missing mark is reported as `unmatchedmark` rather than switching.
pub fn fork(ctx: &mut OpContext<'_>, proc: Object) -> OpResult {
    let count = ctx.context.stacks.operands.count_to_mark()?;
    let id = ctx.host.allocate_id();
    let mut child = Context::new(id, ctx.settings)?;

    let parent = &mut *ctx.context;
    let mut transfer = Transfer::new();
    for depth in (0..count).rev() {
        let obj = parent
            .stacks
            .operands
            .topdown_fetch(depth)
            .ok_or(VmError::StackUnderflow)?;
        let copied = transfer.copy(obj, &parent.local, &mut child.local)?;
        child.stacks.operands.push(copied)?;
    }
    let body = transfer.copy(proc, &parent.local, &mut child.local)?;
    child.stacks.exec.push(Object::operator(ctx.system.zombie))?;
    child.stacks.exec.push(body)?;

    parent.stacks.operands.drop_top(count + 1)?;
    parent.stacks.operands.push(Object::context(id))?;
    info!("{} forked {id} with {count} operands", parent.id);
    ctx.host.adopt(child);
    Err(VmError::ContextSwitch)
}

/// `context join mark obj1 .. objn`
///
/// Unknown or already freed contexts are reported as `invalidcontext`
/// rather than switching.
pub fn join(ctx: &mut OpContext<'_>, handle: Object) -> OpResult {
    let id = handle.as_context().ok_or(VmError::TypeCheck)?;
    let target = ctx.host.resolve(id).ok_or(VmError::InvalidContext)?;
    match target.state {
        ContextState::Zombie => {
            let caller = &mut *ctx.context;
            let needed = caller.stacks.operands.count() + 1 + target.stacks.operands.count();
            if needed > caller.stacks.operands.limit() {
                return Err(VmError::StackOverflow);
            }
            caller.stacks.operands.push(Object::mark())?;
            let mut transfer = Transfer::new();
            for obj in target.stacks.operands.iter() {
                let copied = transfer.copy(obj, &target.local, &mut caller.local)?;
                caller.stacks.operands.push(copied)?;
            }
            target.stacks.operands.clear();
            target.state = ContextState::Free;
            caller.waiting_on = None;
            info!("{} joined {id}", caller.id);
            Ok(())
        }
        ContextState::Free => Err(VmError::InvalidContext),
        ContextState::Run | ContextState::Wait => {
            // retried once the host resumes us
            let caller = &mut *ctx.context;
            caller.stacks.exec.push(Object::operator(ctx.system.join))?;
            caller.stacks.exec.push(handle)?;
            caller.state = ContextState::Wait;
            caller.waiting_on = Some(id);
            Err(VmError::ContextSwitch)
        }
    }
}

pub fn yield_now(_ctx: &mut OpContext<'_>) -> OpResult {
    Err(VmError::ContextSwitch)
}

/// Let `context` free itself when it finishes instead of waiting for a join.
///
/// A context that is unknown, freed or already detached is reported as
/// `invalidcontext`.
pub fn detach(ctx: &mut OpContext<'_>, handle: Object) -> OpResult {
    let id = handle.as_context().ok_or(VmError::TypeCheck)?;
    let target = if id == ctx.context.id {
        &mut *ctx.context
    } else {
        ctx.host.resolve(id).ok_or(VmError::InvalidContext)?
    };
    match target.state {
        ContextState::Zombie => {
            target.state = ContextState::Free;
            Ok(())
        }
        ContextState::Free => Err(VmError::InvalidContext),
        ContextState::Run | ContextState::Wait => {
            let sentinel = Object::operator(ctx.system.zombie);
            if target.stacks.exec.bottomup_fetch(0) != Some(sentinel) {
                return Err(VmError::InvalidContext);
            }
            target
                .stacks
                .exec
                .bottomup_replace(0, Object::operator(ctx.system.free))?;
            info!("{id} detached");
            Ok(())
        }
    }
}

pub fn currentcontext(ctx: &mut OpContext<'_>) -> OpResult {
    let id = ctx.context.id;
    ctx.push(Object::context(id))
}

/// Sentinel at the bottom of a forked context's exec stack.
pub fn zombie(ctx: &mut OpContext<'_>) -> OpResult {
    ctx.context.state = ContextState::Zombie;
    info!("{} finished", ctx.context.id);
    Err(VmError::ContextSwitch)
}

/// Sentinel of a detached context.
pub fn free(ctx: &mut OpContext<'_>) -> OpResult {
    ctx.context.state = ContextState::Free;
    info!("{} finished detached", ctx.context.id);
    Err(VmError::ContextSwitch)
}
