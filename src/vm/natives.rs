//! Native-function contract and the small prelude every VM starts with.
//!
//! A native receives its arguments as a slice and returns a value or a
//! failure description. It gets the heap (to read or allocate objects) and
//! the output buffer through [`NativeContext`], never registers or frames.
//! The collector does not run while a native is executing.

use super::heap::{Heap, ObjKind};
use super::value::Value;

/// Signature of a host function callable from bytecode.
pub type NativeFn = fn(&mut NativeContext<'_>, &[Value]) -> Result<Value, String>;

/// What a native function may touch.
pub struct NativeContext<'a> {
    pub heap: &'a mut Heap,
    pub output: &'a mut Vec<String>,
}

/// Built-in natives registered by `Vm::new`: (name, arity, function).
pub fn prelude() -> Vec<(&'static str, Option<usize>, NativeFn)> {
    vec![
        ("print", None, native_print),
        ("len", Some(1), native_len),
        ("type_of", Some(1), native_type_of),
        ("str", Some(1), native_str),
        ("push", Some(2), native_push),
    ]
}

fn native_print(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    let line = args
        .iter()
        .map(|v| ctx.heap.display(v))
        .collect::<Vec<_>>()
        .join(" ");
    ctx.output.push(line);
    Ok(Value::Null)
}

fn native_len(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    let len = match args[0] {
        Value::Obj(r) => match ctx.heap.kind(r) {
            Some(ObjKind::String(s)) => s.chars().count(),
            Some(ObjKind::Array(items)) => items.len(),
            Some(ObjKind::Map(map)) => map.len(),
            _ => return Err(format!("len() not supported for {}", ctx.heap.type_name(&args[0]))),
        },
        other => return Err(format!("len() not supported for {}", ctx.heap.type_name(&other))),
    };
    Ok(Value::Int(len as i64))
}

fn native_type_of(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    let name = ctx.heap.type_name(&args[0]);
    Ok(ctx.heap.alloc_string(name))
}

fn native_str(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    if ctx.heap.as_str(&args[0]).is_some() {
        return Ok(args[0]);
    }
    let text = ctx.heap.display(&args[0]);
    Ok(ctx.heap.alloc_string(text))
}

fn native_push(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    let type_name = ctx.heap.type_name(&args[0]);
    match ctx.heap.obj_mut(&args[0]) {
        Some(ObjKind::Array(items)) => {
            items.push(args[1]);
            Ok(args[0])
        }
        _ => Err(format!("push() expects an Array, got {}", type_name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn call(
        name: &str,
        heap: &mut Heap,
        output: &mut Vec<String>,
        args: &[Value],
    ) -> Result<Value, String> {
        let (_, _, func) = prelude()
            .into_iter()
            .find(|(n, _, _)| *n == name)
            .expect("native exists");
        let mut ctx = NativeContext { heap, output };
        func(&mut ctx, args)
    }

    #[test]
    fn test_print_joins_with_spaces() {
        let mut heap = Heap::new();
        let mut output = Vec::new();
        let s = heap.alloc_string("total:");
        call("print", &mut heap, &mut output, &[s, Value::Int(3)]).unwrap();
        assert_eq!(output, vec!["total: 3".to_string()]);
    }

    #[test]
    fn test_len_and_push() {
        let mut heap = Heap::new();
        let mut output = Vec::new();
        let arr = heap.alloc_array(vec![Value::Int(1)]);
        call("push", &mut heap, &mut output, &[arr, Value::Int(2)]).unwrap();
        let len = call("len", &mut heap, &mut output, &[arr]).unwrap();
        assert_eq!(len, Value::Int(2));

        let err = call("len", &mut heap, &mut output, &[Value::Int(4)]).unwrap_err();
        assert_eq!(err, "len() not supported for Int");
    }

    #[test]
    fn test_type_of() {
        let mut heap = Heap::new();
        let mut output = Vec::new();
        let name = call("type_of", &mut heap, &mut output, &[Value::Float(1.5)]).unwrap();
        assert_eq!(heap.as_str(&name), Some("Float"));
    }
}
