use crate::{Object, OpContext, OpResult, VmError};

macro_rules! shuffle {
    (
        $(
            $(#[$doc:meta])* $name:ident : $($in:ident)* -- $($out:ident)*
        );* $(;)?
    ) => {
        $(
            $(#[$doc])*
            #[allow(unused_variables)]
            pub fn $name(ctx: &mut OpContext<'_>, $($in: Object),*) -> OpResult {
                $(ctx.push($out)?;)*
                Ok(())
            }
        )*
    };
}

shuffle! {
    pop: x -- ;

    exch: x y -- y x ;

    dup: x -- x x ;
}

pub fn clear(ctx: &mut OpContext<'_>) -> OpResult {
    ctx.context.stacks.operands.clear();
    Ok(())
}

pub fn count(ctx: &mut OpContext<'_>) -> OpResult {
    let count = ctx.context.stacks.operands.count();
    ctx.push(Object::int(i32::try_from(count).map_err(|_| VmError::LimitCheck)?))
}

pub fn mark(ctx: &mut OpContext<'_>) -> OpResult {
    ctx.push(Object::mark())
}

pub fn cleartomark(ctx: &mut OpContext<'_>) -> OpResult {
    let operands = &mut ctx.context.stacks.operands;
    let depth = operands.count_to_mark()?;
    operands.drop_top(depth + 1)
}

pub fn counttomark(ctx: &mut OpContext<'_>) -> OpResult {
    let depth = ctx.context.stacks.operands.count_to_mark()?;
    ctx.push(Object::int(i32::try_from(depth).map_err(|_| VmError::LimitCheck)?))
}

/// `anyn .. any0 n index anyn .. any0 anyn`
pub fn index(ctx: &mut OpContext<'_>, n: Object) -> OpResult {
    let depth = n
        .as_int()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or(VmError::RangeCheck)?;
    let picked = ctx
        .context
        .stacks
        .operands
        .topdown_fetch(depth)
        .ok_or(VmError::RangeCheck)?;
    ctx.push(picked)
}
