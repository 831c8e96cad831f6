use log::debug;

use crate::{Bank, Chain, HostRoots, Object, OpContext, OpResult, RootProvider, VmError};

pub fn save(ctx: &mut OpContext<'_>) -> OpResult {
    let level = ctx.context.local.save()?;
    ctx.push(Object::save(level))
}

/// Local composites on the stacks must not outlive the level being restored.
pub fn restore(ctx: &mut OpContext<'_>, save: Object) -> OpResult {
    let level = save.as_save().ok_or(VmError::TypeCheck)?;
    let local = &ctx.context.local;
    if level.0 == 0 || level.0 > local.level() {
        return Err(VmError::InvalidRestore);
    }
    let mut dangling = false;
    ctx.context.stacks.visit_roots(&mut |obj| {
        if obj.bank() != Bank::Local {
            return;
        }
        if let Some(id) = obj.entity() {
            dangling |= local.created_after(id, level);
        }
    });
    if dangling {
        debug!("{} cannot restore to level {}", ctx.context.id, level.0);
        return Err(VmError::InvalidRestore);
    }
    ctx.context.local.restore(level)
}

fn clamp(value: u32) -> Object {
    Object::int(i32::try_from(value).unwrap_or(i32::MAX))
}

/// `-- level used maximum`
pub fn vmstatus(ctx: &mut OpContext<'_>) -> OpResult {
    let local = &ctx.context.local;
    let status = [
        clamp(local.level()),
        clamp(local.arena().used()),
        clamp(local.arena().max()),
    ];
    for obj in status {
        ctx.push(obj)?;
    }
    Ok(())
}

/// `1` collects the local memory, `2` the global one as well. Values from
/// `-2` to `0` only change the automatic collection mode and are accepted as
/// no-ops.
pub fn vmreclaim(ctx: &mut OpContext<'_>, mode: Object) -> OpResult {
    match mode.as_int() {
        Some(-2..=0) => Ok(()),
        Some(1) => {
            let reclaimed = ctx.context.collect_local()?;
            debug!("{} reclaimed {reclaimed} local bytes", ctx.context.id);
            Ok(())
        }
        Some(2) => {
            ctx.context.collect_local()?;
            let others = HostRoots(&*ctx.host);
            let roots = Chain(&*ctx.context, &others);
            let reclaimed = ctx.global.collect(&roots, true, false)?;
            debug!("{} reclaimed {reclaimed} global bytes", ctx.context.id);
            Ok(())
        }
        _ => Err(VmError::RangeCheck),
    }
}

#[cfg(test)]
mod tests {
    use crate::{Bank, NoRoots, Object, Type, VmError, ops::harness::Harness};

    #[test]
    fn save_and_restore_undo_local_writes() {
        let mut h = Harness::new();
        let array = h.context.local.new_array(1, &NoRoots).unwrap();
        h.context.local.array_put(&array, 0, Object::int(1)).unwrap();

        h.call("save").unwrap();
        let save = h.context.stacks.operands.peek().unwrap();
        assert_eq!(save.ty(), Type::Save);
        h.context.local.array_put(&array, 0, Object::int(2)).unwrap();

        h.call("restore").unwrap();
        assert_eq!(h.context.local.array_get(&array, 0).unwrap(), Object::int(1));
        assert_eq!(h.context.local.level(), 0);
    }

    #[test]
    fn restore_refuses_to_drop_objects_still_on_the_stack() {
        let mut h = Harness::new();
        h.call("save").unwrap();
        let save = h.context.stacks.operands.pop().unwrap();
        let fresh = h.context.local.new_string(b"young", &NoRoots).unwrap();
        h.push(fresh);
        h.push(save);
        assert_eq!(h.call("restore"), Err(VmError::InvalidRestore));
        assert_eq!(h.context.local.level(), 1);

        h.context.stacks.operands.clear();
        h.push(save);
        h.call("restore").unwrap();
        h.push(save);
        assert_eq!(h.call("restore"), Err(VmError::InvalidRestore), "level is gone");
    }

    #[test]
    fn vmstatus_reports_the_local_arena() {
        let mut h = Harness::new();
        h.call("vmstatus").unwrap();
        let status = h.operands();
        assert_eq!(status.len(), 3);
        assert_eq!(status[0], Object::int(0));
        let used = status[1].as_int().unwrap();
        let max = status[2].as_int().unwrap();
        assert!(used <= max);
    }

    #[test]
    fn vmreclaim_collects_unreachable_local_storage() {
        let mut h = Harness::new();
        h.context.local.new_string(b"garbage!", &NoRoots).unwrap();
        let kept = h.context.local.new_string(b"kept", &NoRoots).unwrap();
        h.push(kept);
        h.push(Object::int(1));
        h.call("vmreclaim").unwrap();
        assert_eq!(h.context.local.free_entities().unwrap().len(), 1);

        let global = h.vm.global.new_string(b"global", &NoRoots).unwrap();
        assert_eq!(global.bank(), Bank::Global);
        h.push(Object::int(2));
        h.call("vmreclaim").unwrap();
        let freed = h.vm.global.free_entities().unwrap();
        assert!(freed.contains(&global.entity().unwrap()));

        h.push(Object::int(3));
        assert_eq!(h.call("vmreclaim"), Err(VmError::RangeCheck));
    }
}
