//! Cooperative state-machine external functions (design note §4.5 "State-machine
//! external functions"; design note §F.4).
//!
//! Grounded on `original_source/smilelib/include/smile/eval/closure.h`'s
//! `ClosureStateMachineStruct`: a native that needs to call back into the
//! interpreter more than once (the design's own example: "iterating a
//! collection with a user predicate") doesn't recurse the host call stack
//! once per element. Instead it hands the evaluator a two-phase object —
//! `start` runs once, `body` runs on every re-entry — and the evaluator
//! drives it from its own frame stack, the same way it drives ordinary
//! bytecode frames. The original's inline `state: [u8; N]` buffer plus a
//! pair of raw function pointers becomes a trait object here, per design note
//! §9's note that this should be "a trait object pair" in an idiomatic
//! target-language port.

use crate::value::Value;

/// What a state machine wants to happen next.
pub enum IterationAction {
    /// Call `func` with `args`; once it returns, feed the result back to
    /// this same state machine's [`NativeIterator::body`].
    Invoke { func: Value, args: Vec<Value> },
    /// The iteration is complete; `value` is the native call's overall result.
    Done(Value),
}

/// The two-phase start/resume contract a cooperative native iteration
/// implements. `start` corresponds to `stateMachineStart`, `body` to
/// `stateMachineBody` in the reference implementation.
pub trait NativeIterator: std::fmt::Debug {
    fn start(&mut self) -> IterationAction;
    fn body(&mut self, returned: Value) -> IterationAction;
}

/// Drives `each(list, fn)`: calls `fn` once per element of a well-formed
/// list, left to right, for side effects. Elements are collected up front
/// (design note §3 "List well-formedness" — the whole point of the check is to
/// guarantee this terminates), so only the callback invocations themselves
/// are cooperative re-entries.
#[derive(Debug)]
pub struct EachIterator {
    elements: std::vec::IntoIter<Value>,
    func: Value,
}

impl EachIterator {
    #[must_use]
    pub fn new(elements: Vec<Value>, func: Value) -> Self {
        Self {
            elements: elements.into_iter(),
            func,
        }
    }

    fn advance(&mut self) -> IterationAction {
        match self.elements.next() {
            Some(element) => IterationAction::Invoke { func: self.func, args: vec![element] },
            None => IterationAction::Done(Value::Null),
        }
    }
}

impl NativeIterator for EachIterator {
    fn start(&mut self) -> IterationAction {
        self.advance()
    }

    fn body(&mut self, _returned: Value) -> IterationAction {
        self.advance()
    }
}
