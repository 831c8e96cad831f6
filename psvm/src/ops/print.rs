use std::io::Write;

use log::warn;

use crate::{Object, OpContext, OpResult, Type, VmError};

const MAX_DEPTH: usize = 8;

/// `any ==`, writes a syntactic description followed by a newline.
pub fn print(ctx: &mut OpContext<'_>, obj: Object) -> OpResult {
    let mut text = String::new();
    describe(ctx, obj, 0, &mut text);
    writeln!(ctx.out, "{text}").map_err(|err| {
        warn!("{} could not write output: {err}", ctx.context.id);
        VmError::InvalidFileAccess
    })
}

fn describe(ctx: &OpContext<'_>, obj: Object, depth: usize, out: &mut String) {
    match obj.ty() {
        Type::Name => match obj.as_name().and_then(|id| ctx.names.resolve(id)) {
            Some(name) if obj.is_executable() => out.push_str(&name),
            Some(name) => {
                out.push('/');
                out.push_str(&name);
            }
            None => out.push_str(&obj.to_string()),
        },
        Type::Operator => {
            let name = obj
                .as_opcode()
                .and_then(|opcode| ctx.operators.name_of(&*ctx.global, opcode).ok())
                .and_then(|id| ctx.names.resolve(id));
            match name {
                Some(name) => {
                    out.push_str("--");
                    out.push_str(&name);
                    out.push_str("--");
                }
                None => out.push_str(&obj.to_string()),
            }
        }
        Type::String => match ctx.memory(obj.bank()).string_bytes(&obj) {
            Ok(bytes) => {
                out.push('(');
                out.push_str(&String::from_utf8_lossy(bytes));
                out.push(')');
            }
            Err(_) => out.push_str(&obj.to_string()),
        },
        Type::Array if depth < MAX_DEPTH => {
            let Ok(elements) = ctx.memory(obj.bank()).array_elements(&obj) else {
                out.push_str(&obj.to_string());
                return;
            };
            let (open, close) = if obj.is_executable() { ('{', '}') } else { ('[', ']') };
            out.push(open);
            for (index, element) in elements.into_iter().enumerate() {
                if index > 0 {
                    out.push(' ');
                }
                describe(ctx, element, depth + 1, out);
            }
            out.push(close);
        }
        _ => out.push_str(&obj.to_string()),
    }
}
