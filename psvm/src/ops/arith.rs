use crate::{Object, OpContext, OpResult, VmError};

// integer overflow falls back to the real result
type IntBinop = fn(i32, i32) -> Option<i32>;
type RealBinop = fn(f64, f64) -> f64;

fn int_binop(
    ctx: &mut OpContext<'_>,
    a: Object,
    b: Object,
    op: IntBinop,
    wide: RealBinop,
) -> OpResult {
    let (Some(x), Some(y)) = (a.as_int(), b.as_int()) else {
        return Err(VmError::TypeCheck);
    };
    let result = match op(x, y) {
        Some(value) => Object::int(value),
        None => Object::real(wide(x as f64, y as f64) as f32),
    };
    ctx.push(result)
}

fn real_binop(ctx: &mut OpContext<'_>, a: Object, b: Object, op: RealBinop) -> OpResult {
    let (Some(x), Some(y)) = (a.as_real(), b.as_real()) else {
        return Err(VmError::TypeCheck);
    };
    ctx.push(Object::real(op(x as f64, y as f64) as f32))
}

pub fn int_add(ctx: &mut OpContext<'_>, a: Object, b: Object) -> OpResult {
    int_binop(ctx, a, b, i32::checked_add, |x, y| x + y)
}

pub fn real_add(ctx: &mut OpContext<'_>, a: Object, b: Object) -> OpResult {
    real_binop(ctx, a, b, |x, y| x + y)
}

pub fn int_sub(ctx: &mut OpContext<'_>, a: Object, b: Object) -> OpResult {
    int_binop(ctx, a, b, i32::checked_sub, |x, y| x - y)
}

pub fn real_sub(ctx: &mut OpContext<'_>, a: Object, b: Object) -> OpResult {
    real_binop(ctx, a, b, |x, y| x - y)
}

pub fn int_mul(ctx: &mut OpContext<'_>, a: Object, b: Object) -> OpResult {
    int_binop(ctx, a, b, i32::checked_mul, |x, y| x * y)
}

pub fn real_mul(ctx: &mut OpContext<'_>, a: Object, b: Object) -> OpResult {
    real_binop(ctx, a, b, |x, y| x * y)
}

pub fn int_neg(ctx: &mut OpContext<'_>, a: Object) -> OpResult {
    let value = a.as_int().ok_or(VmError::TypeCheck)?;
    ctx.push(match value.checked_neg() {
        Some(negated) => Object::int(negated),
        None => Object::real(-(value as f32)),
    })
}

pub fn real_neg(ctx: &mut OpContext<'_>, a: Object) -> OpResult {
    let value = a.as_real().ok_or(VmError::TypeCheck)?;
    ctx.push(Object::real(-value))
}
