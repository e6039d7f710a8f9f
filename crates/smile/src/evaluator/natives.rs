//! Native arithmetic, comparison, and equality helpers for the evaluator
//! (design note §4.5 "native external function").
//!
//! Grounded on `original_source/smilelib/src/eval/eval_fn_ext.c`'s argument
//! marshaling contract (`INVOKE_DECL`/`DO_MIN_CHECK`/`DO_TYPE_CHECK`): a
//! native receives a flat argument slice and either returns a value or
//! raises a `native_method_error`-kind exception. Unlike the C original,
//! which dispatches through a `SmileFunction` vtable populated by a
//! `Smile_SetExternalFunction`-style registration call at startup, these are
//! plain Rust functions matched directly on the operator's fixed known-symbol
//! id (see `intern::KNOWN_SYMBOLS`) in `Evaluator::call_native` — there is no
//! user-facing registration API yet, since design note's Non-goals exclude a
//! standard library and these dozen operators are the only natives the core
//! language itself depends on.

use crate::error::{ErrorKind, SmileError};
use crate::heap::{Heap, HeapId};
use crate::resource::ResourceTracker;
use crate::value::{HeapObject, RangeValue, Value};

/// Numeric rank used to decide whether an arithmetic/comparison op promotes
/// its operands to `i64` or falls back to `f64`.
fn as_i64(v: &Value) -> Option<i64> {
    match *v {
        Value::Byte(b) => Some(i64::from(b)),
        Value::Int16(n) => Some(i64::from(n)),
        Value::Int32(n) => Some(i64::from(n)),
        Value::Int64(n) => Some(n),
        _ => None,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match *v {
        Value::Float32(f) => Some(f64::from(f)),
        Value::Float64(f) => Some(f),
        Value::Real32(f) => Some(f64::from(f)),
        Value::Real64(f) => Some(f),
        _ => as_i64(v).map(|i| i as f64),
    }
}

fn type_error(op: &str, a: &Value, b: &Value) -> SmileError {
    SmileError::new(
        ErrorKind::NativeMethodError,
        format!("'{op}' cannot operate on a {} and a {}", a.kind_name(), b.kind_name()),
    )
}

/// `+ - * /` (known symbol ids 55-58). Integer operands promote to `Int64`
/// results; any float/real operand promotes the whole operation to `Float64`.
pub fn arith(op: &str, a: &Value, b: &Value) -> Result<Value, SmileError> {
    if let (Some(x), Some(y)) = (as_i64(a), as_i64(b)) {
        let result = match op {
            "+" => x.checked_add(y),
            "-" => x.checked_sub(y),
            "*" => x.checked_mul(y),
            "/" => {
                if y == 0 {
                    return Err(SmileError::new(ErrorKind::DivideByZero, "division by zero"));
                }
                x.checked_div(y)
            }
            _ => unreachable!("arith called with non-arithmetic operator"),
        };
        return result.map(Value::Int64).ok_or_else(|| SmileError::new(ErrorKind::NativeMethodError, "integer overflow"));
    }
    let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) else {
        return Err(type_error(op, a, b));
    };
    let result = match op {
        "+" => x + y,
        "-" => x - y,
        "*" => x * y,
        "/" => x / y,
        _ => unreachable!("arith called with non-arithmetic operator"),
    };
    Ok(Value::Float64(result))
}

/// `< > <= >=` (known symbol ids 51-54). Numeric-only; comparing anything
/// else raises a native-method-error rather than silently ordering by
/// discriminant.
pub fn compare(op: &str, a: &Value, b: &Value) -> Result<Value, SmileError> {
    let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) else {
        return Err(type_error(op, a, b));
    };
    let result = match op {
        "<" => x < y,
        ">" => x > y,
        "<=" => x <= y,
        ">=" => x >= y,
        _ => unreachable!("compare called with non-comparison operator"),
    };
    Ok(Value::Bool(result))
}

/// `== !=` (known symbol ids 49-50): structural equality, recursing into
/// heap objects. `=== !==` use `Value::super_eq` instead (reference identity
/// for `Ref`s), handled directly by `Evaluator` without going through here.
///
/// Cycles are terminated with a set of already-visited `(HeapId, HeapId)`
/// pairs rather than a recursion-depth cap, so two distinct but
/// identically-shaped cyclic structures still compare equal instead of
/// falling back to reference identity once some arbitrary depth is reached.
pub fn structural_eq<T: ResourceTracker>(heap: &Heap<T>, a: &Value, b: &Value) -> bool {
    let mut visited = ahash::AHashSet::new();
    structural_eq_visited(heap, a, b, &mut visited)
}

fn structural_eq_visited<T: ResourceTracker>(
    heap: &Heap<T>,
    a: &Value,
    b: &Value,
    visited: &mut ahash::AHashSet<(HeapId, HeapId)>,
) -> bool {
    match (a, b) {
        (Value::Ref(ra), Value::Ref(rb)) => {
            if ra == rb {
                return true;
            }
            if !visited.insert((*ra, *rb)) {
                // Already comparing this pair of cells further up the call
                // stack: their fields form a cycle back to here. Nothing
                // found unequal on the way down, so the cycle itself can't
                // make them unequal either.
                return true;
            }
            match (heap.get(*ra), heap.get(*rb)) {
                (HeapObject::Str(x), HeapObject::Str(y)) => x == y,
                (HeapObject::Pair { left: la, right: ra2 }, HeapObject::Pair { left: lb, right: rb2 }) => {
                    structural_eq_visited(heap, la, lb, visited) && structural_eq_visited(heap, ra2, rb2, visited)
                }
                (HeapObject::List { a: aa, d: ad, .. }, HeapObject::List { a: ba, d: bd, .. }) => {
                    structural_eq_visited(heap, aa, ba, visited) && structural_eq_visited(heap, ad, bd, visited)
                }
                (HeapObject::Range(x), HeapObject::Range(y)) => range_eq(x, y),
                (HeapObject::ByteArray(x), HeapObject::ByteArray(y)) => x == y,
                _ => false,
            }
        }
        _ => a == b,
    }
}

fn range_eq(a: &RangeValue, b: &RangeValue) -> bool {
    match (a, b) {
        (RangeValue::Int { start: s1, end: e1, step: t1 }, RangeValue::Int { start: s2, end: e2, step: t2 }) => {
            s1 == s2 && e1 == e2 && t1 == t2
        }
        (RangeValue::Char { start: s1, end: e1 }, RangeValue::Char { start: s2, end: e2 }) => s1 == s2 && e1 == e2,
        (RangeValue::Uni { start: s1, end: e1 }, RangeValue::Uni { start: s2, end: e2 }) => s1 == s2 && e1 == e2,
        _ => false,
    }
}
