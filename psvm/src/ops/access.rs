use crate::{Access, Object, OpContext, OpResult, VmError};

macro_rules! convert {
    (
        $(
            $(#[$doc:meta])* $name:ident ( $obj:ident ) => $body:expr
        );* $(;)?
    ) => {
        $(
            $(#[$doc])*
            pub fn $name(ctx: &mut OpContext<'_>, $obj: Object) -> OpResult {
                let result: Result<Object, VmError> = $body;
                ctx.push(result?)
            }
        )*
    };
}

fn composite(obj: Object) -> Result<Object, VmError> {
    if obj.is_composite() {
        Ok(obj)
    } else {
        Err(VmError::TypeCheck)
    }
}

convert! {
    cvlit(obj) => Ok(obj.cvlit());

    cvx(obj) => Ok(obj.cvx());

    xcheck(obj) => Ok(Object::boolean(obj.xcheck()));

    /// Access is only ever lowered, asking for more is a no-op.
    executeonly(obj) => composite(obj).map(|obj| obj.restrict(Access::ExecuteOnly));

    noaccess(obj) => composite(obj).map(|obj| obj.restrict(Access::None));

    readonly(obj) => composite(obj).map(|obj| obj.restrict(Access::ReadOnly));

    rcheck(obj) => composite(obj).map(|obj| Object::boolean(obj.rcheck()));

    wcheck(obj) => composite(obj).map(|obj| Object::boolean(obj.wcheck()));
}

#[cfg(test)]
mod tests {
    use crate::{Access, NoRoots, Object, VmError, ops::harness::Harness};

    fn apply(h: &mut Harness, name: &str, obj: Object) -> Object {
        h.push(obj);
        h.call(name).unwrap();
        h.context.stacks.operands.pop().unwrap()
    }

    #[test]
    fn executable_bit_round_trips() {
        let mut h = Harness::new();
        let x = apply(&mut h, "cvx", Object::int(3));
        assert_eq!(apply(&mut h, "xcheck", x), Object::boolean(true));
        let lit = apply(&mut h, "cvlit", x);
        assert_eq!(apply(&mut h, "xcheck", lit), Object::boolean(false));
    }

    #[test]
    fn access_only_goes_down() {
        let mut h = Harness::new();
        let s = h.context.local.new_string(b"abc", &NoRoots).unwrap();
        assert_eq!(apply(&mut h, "wcheck", s), Object::boolean(true));

        let ro = apply(&mut h, "readonly", s);
        assert_eq!(ro.access(), Access::ReadOnly);
        assert_eq!(apply(&mut h, "rcheck", ro), Object::boolean(true));
        assert_eq!(apply(&mut h, "wcheck", ro), Object::boolean(false));

        let none = apply(&mut h, "noaccess", ro);
        assert_eq!(apply(&mut h, "readonly", none).access(), Access::None);
        assert_eq!(apply(&mut h, "rcheck", none), Object::boolean(false));
    }

    #[test]
    fn access_of_simple_objects_is_a_typecheck() {
        let mut h = Harness::new();
        h.push(Object::int(1));
        assert_eq!(h.call("readonly"), Err(VmError::TypeCheck));
    }
}
