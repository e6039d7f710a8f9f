//! Bytecode evaluator (design note §4.5).
//!
//! Grounded on `original_source/SmileC/smilelib/include/smile/eval/opcode.h`
//! for per-opcode stack-effect/operand contracts, on
//! `original_source/smilelib/include/smile/eval/closure.h` for the
//! global/local closure split (`CLOSURE_KIND_GLOBAL`/`CLOSURE_KIND_LOCAL`),
//! and on `original_source/smilelib/src/eval/eval_fn_ext.c` for the
//! native-function argument-count/type-check contract. The dispatch loop
//! itself is new: the original's `eval.c` main loop wasn't part of the
//! retrieved sources, so this is a conventional fetch-decode-dispatch VM
//! shaped the way `opcode.h`'s stack-effect comments describe, with an
//! explicit Rust-level frame stack (`Evaluator::frames`) standing in for the
//! `Closure`/`returnClosure` continuation chain so `CallTail` can replace the
//! top frame in place rather than recursing through Rust's own call stack
//! (design note §4.5's "the host call-stack depth does not grow" property for
//! tail calls).
//!
//! Till-escape is simplified from the original's design: there, every flag
//! shares one heap-allocated escape-continuation object, loaded across
//! function boundaries like any other local variable and consumed by
//! `Op_TillEsc` (see `compile_variable.c`'s `Compiler_CompileTillFlag`). This
//! evaluator instead resolves escapes purely from compile-time data (see
//! `compiler::compile_var` and `UserFunctionInfo::till_exits`) — no
//! continuation object is allocated at all, since a till's landing point is
//! static once compiled; only *which* ancestor frame to land in is dynamic.

mod natives;
mod state_machine;

use std::rc::Rc;

use crate::bytecode::{ByteCode, CompiledTables, Opcode, Operand};
use crate::error::{ErrorKind, EvalResult, Exception, SmileError, StackFrame};
use crate::heap::{Heap, HeapId};
use crate::intern::{Symbol, SymbolTable};
use crate::resource::ResourceTracker;
use crate::value::{FunctionValue, HeapObject, SecurityFlags, Value};
use state_machine::{EachIterator, IterationAction, NativeIterator};

/// One `try`'s handler: the absolute pc to resume at, and the operand-stack
/// depth to unwind back to before pushing the caught value (design note §4.5
/// "Try/EndTry").
#[derive(Debug, Clone, Copy)]
struct TryHandler {
    handler_pc: usize,
    stack_depth: usize,
}

/// A single call activation: a `LocalClosure` heap object plus the
/// instruction pointer and operand stack for that call. Distinct from the
/// *closure* (which is a heap value other closures can capture as a parent);
/// a frame is purely this evaluator's bookkeeping for one in-flight call.
#[derive(Debug)]
struct Frame {
    function_index: u32,
    closure: HeapId,
    pc: usize,
    /// Argument count actually supplied by the caller, for `Args`'s minimum
    /// check (design note §6 `Op_Args`: "construct missing args with null").
    argc: u16,
    /// Next unused local-variable slot offset, for `LocalAlloc`/`LocalFree`.
    locals_top: u16,
    stack: Vec<Value>,
    handlers: Vec<TryHandler>,
    /// `Some` iff this frame is a cooperative native iteration rather than a
    /// bytecode call (design note §4.5 "state-machine external functions"): the
    /// main loop drives it through `NativeIterator::start`/`body` instead of
    /// fetching instructions, and `function_index`/`pc` are unused.
    state_machine: Option<Box<dyn NativeIterator>>,
}

/// What one dispatched instruction did to control flow.
enum Step {
    /// Fall through to the next instruction.
    Next,
    /// Unconditional absolute jump within the current frame.
    Jump(usize),
    /// The current frame returned `value`; the main loop pops it and resumes
    /// the caller (or finishes, if this was the outermost frame).
    Return(Value),
    /// A non-tail call: push a new frame on top.
    PushFrame(Box<Frame>),
    /// A tail call: replace the current (topmost) frame in place.
    TailFrame(Box<Frame>),
    /// A till-escape already applied its own frame truncation and pc change;
    /// the main loop has nothing further to do.
    Applied,
}

/// The bytecode evaluator (design note §4.5). Owns the heap, the compiled
/// program's constant tables, and the single global closure all functions in
/// this compilation unit close over.
pub struct Evaluator<T: ResourceTracker> {
    heap: Heap<T>,
    tables: CompiledTables,
    symbols: SymbolTable,
    global: HeapId,
    string_objects: Vec<HeapId>,
    heap_object_literals: Vec<HeapId>,
    frames: Vec<Frame>,
}

impl<T: ResourceTracker> Evaluator<T> {
    /// Builds a fresh evaluator over a compiled program: pre-allocates every
    /// string/object-table literal once (so repeated `LdStr`/`LdObj` of the
    /// same constant are reference-identical under `===`), and seeds the
    /// global closure with the dozen arithmetic/comparison/equality natives
    /// the core language depends on (design note §1's "Out of scope: a standard
    /// library" means there is no broader builtin surface than this).
    #[must_use]
    pub fn new(tables: CompiledTables, symbols: SymbolTable, tracker: T) -> Self {
        let mut heap = Heap::new(tracker);

        let string_objects = tables
            .strings
            .iter()
            .map(|s| heap.alloc(HeapObject::Str(s.clone())).expect("initial literal allocation cannot fail"))
            .collect();
        let heap_object_literals = tables
            .heap_objects
            .iter()
            .map(|obj| heap.alloc(obj.clone()).expect("initial literal allocation cannot fail"))
            .collect();

        let mut symbols = symbols;
        let mut global_vars = indexmap::IndexMap::new();
        for &raw in NATIVE_OPERATOR_SYMBOLS {
            let sym = Symbol::from_raw(raw);
            let function_id = heap
                .alloc(HeapObject::Function(FunctionValue::Native(sym)))
                .expect("initial native registration cannot fail");
            global_vars.insert(sym, Value::Ref(function_id));
        }
        // `throw` (design note §4.5 "exceptions") isn't a fixed-id known symbol
        // (it's not in `knownsymbols.h`'s 1..94 block, only the dynamically
        // assigned type-name family), so it's interned here like any other
        // identifier and bound as a native the same way the operators are.
        let throw_sym = symbols.get_symbol("throw");
        let throw_id = heap
            .alloc(HeapObject::Function(FunctionValue::Native(throw_sym)))
            .expect("initial native registration cannot fail");
        global_vars.insert(throw_sym, Value::Ref(throw_id));

        // `each` (design note §4.5 "state-machine external functions"): bound as
        // a native the same way, but `call_value`/`invoke` recognize its
        // name and route it through `start_each_iteration` instead of
        // `call_native`, since it must call back into the interpreter.
        let each_sym = symbols.get_symbol("each");
        let each_id = heap
            .alloc(HeapObject::Function(FunctionValue::Native(each_sym)))
            .expect("initial native registration cannot fail");
        global_vars.insert(each_sym, Value::Ref(each_id));

        // `string-concat` backs `"...{expr}..."` interpolation (design note
        // §4.2 "dynamic (with escape sequences and `{…}` interpolation)"):
        // the compiler lowers an interpolated string to a call of this
        // fixed native over the literal/embedded-expression pieces, coercing
        // each to a string per design note §3/§9's "coerce-to-string" vtable
        // method. Not a symbol users are expected to call directly, but
        // nothing stops them; it's an ordinary global binding like `each`.
        let string_concat_sym = symbols.get_symbol("string-concat");
        let string_concat_id = heap
            .alloc(HeapObject::Function(FunctionValue::Native(string_concat_sym)))
            .expect("initial native registration cannot fail");
        global_vars.insert(string_concat_sym, Value::Ref(string_concat_id));

        let global = heap.alloc(HeapObject::GlobalClosure { vars: global_vars }).expect("initial global closure cannot fail");

        Self {
            heap,
            tables,
            symbols,
            global,
            string_objects,
            heap_object_literals,
            frames: Vec::new(),
        }
    }

    #[must_use]
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn symbols_mut(&mut self) -> &mut SymbolTable {
        &mut self.symbols
    }

    #[must_use]
    pub fn heap_stats(&self) -> crate::heap::HeapStats {
        self.heap.stats()
    }

    /// The top-level global closure's name-indexed variable dictionary
    /// (design note §3 `Closure` "Global closures carry a `VarDict`"). Used by
    /// the module system (design note §4.6) to read a module's exported
    /// bindings once it has been evaluated.
    #[must_use]
    pub fn global_vars(&self) -> &indexmap::IndexMap<Symbol, Value> {
        let HeapObject::GlobalClosure { vars } = self.heap.get(self.global) else {
            unreachable!("global is always a GlobalClosure")
        };
        vars
    }

    /// Renders `value` for diagnostic/CLI output: unboxes strings and
    /// symbols to their natural text instead of printing a heap id, and
    /// falls back to `{:?}` for everything else. Used both by hosts like
    /// `smile-cli` that need to show a result, and by [`Self::coerce_to_string`]
    /// for `"...{expr}..."` string interpolation (design note §3/§9's
    /// "coerce-to-string" vtable method).
    #[must_use]
    pub fn display_value(&self, value: Value) -> String {
        match value {
            Value::Null => "null".to_owned(),
            Value::Bool(b) => b.to_string(),
            Value::Byte(n) => n.to_string(),
            Value::Int16(n) => n.to_string(),
            Value::Int32(n) => n.to_string(),
            Value::Int64(n) => n.to_string(),
            Value::Float32(f) => float_repr_f32(f),
            Value::Float64(f) => float_repr_f64(f),
            Value::Real32(f) => float_repr_f32(f),
            Value::Real64(f) => float_repr_f64(f),
            Value::Char(c) => (c as char).to_string(),
            Value::Uni(c) => c.to_string(),
            Value::Symbol(symbol) => format!("`{}", self.symbols.get_name(symbol)),
            Value::Ref(id) => match self.heap.get(id) {
                HeapObject::Str(s) => s.clone(),
                other => format!("{other:?}"),
            },
        }
    }

    /// Runs `entry_function_index` (normally the top-level program's
    /// `UserFunctionInfo`, added to `tables.functions` by whoever compiled
    /// it) to completion with no arguments.
    pub fn eval_entry(&mut self, entry_function_index: u32) -> EvalResult {
        let closure = match self.make_closure(entry_function_index, None, Vec::new()) {
            Ok(id) => id,
            Err(exception) => return EvalResult::RuntimeError(exception),
        };
        self.frames.push(Frame {
            function_index: entry_function_index,
            closure,
            pc: 0,
            argc: 0,
            locals_top: 0,
            stack: Vec::new(),
            handlers: Vec::new(),
            state_machine: None,
        });
        self.run_until(0)
    }

    /// The fetch-decode-dispatch loop. Runs until the frame stack unwinds
    /// back down to `floor` frames, either by a `Ret` producing the overall
    /// result or by an uncaught exception.
    fn run_until(&mut self, floor: usize) -> EvalResult {
        loop {
            let idx = self.frames.len() - 1;
            let step_result = if self.frames[idx].state_machine.is_some() {
                self.step_state_machine(idx)
            } else {
                let function_index = self.frames[idx].function_index;
                let pc = self.frames[idx].pc;
                let ByteCode { opcode, operand } = self.tables.functions[function_index as usize].segment.instructions[pc].clone();
                self.execute(idx, pc, opcode, operand)
            };

            match step_result {
                Ok(Step::Next) => self.frames[idx].pc += 1,
                Ok(Step::Jump(target)) => self.frames[idx].pc = target,
                Ok(Step::Applied) => {}
                Ok(Step::Return(value)) => {
                    self.frames.pop();
                    if self.frames.len() == floor {
                        return EvalResult::Ok { value };
                    }
                    let caller = self.frames.len() - 1;
                    self.frames[caller].stack.push(value);
                }
                Ok(Step::PushFrame(frame)) => self.frames.push(*frame),
                Ok(Step::TailFrame(frame)) => {
                    let top = self.frames.len() - 1;
                    self.frames[top] = *frame;
                }
                Err(exception) => {
                    if let Some(result) = self.unwind(floor, exception) {
                        return result;
                    }
                }
            }
        }
    }

    /// Advances the state machine at frame `idx` by one step (design note §4.5).
    /// Reuses `Frame::stack` as a one-slot mailbox rather than adding a
    /// dedicated field: a state-machine frame never executes bytecode, so
    /// its `stack` is otherwise idle, and `Step::Return`'s ordinary handling
    /// already pushes a finished callee's result onto its caller's `stack` —
    /// exactly the delivery a resumed state machine needs. An empty mailbox
    /// means this is the frame's first visit, so `start` runs; a filled one
    /// means a call it requested just returned, so that value feeds `body`.
    fn step_state_machine(&mut self, idx: usize) -> Result<Step, Exception> {
        let returned = self.frames[idx].stack.pop();
        let machine = self.frames[idx].state_machine.as_mut().expect("caller checked state_machine.is_some()");
        let action = match returned {
            Some(returned) => machine.body(returned),
            None => machine.start(),
        };
        match action {
            IterationAction::Done(value) => Ok(Step::Return(value)),
            IterationAction::Invoke { func, args } => self.invoke(idx, func, args, false),
        }
    }

    /// Searches for the nearest enclosing `try` handler, starting at the
    /// current (topmost) frame and unwinding frames outward. Returns `None`
    /// if a handler was found and dispatch should resume there; `Some` if
    /// the exception escaped all the way to `floor` (caller should return
    /// that result).
    fn unwind(&mut self, floor: usize, exception: Exception) -> Option<EvalResult> {
        tracing::debug!(kind = exception.kind.as_str(), frames = self.frames.len(), "unwinding exception");
        let heap_id = match self.heap.alloc(HeapObject::Exception(exception.clone())) {
            Ok(id) => id,
            Err(_) => return Some(EvalResult::RuntimeError(exception)),
        };
        let thrown = Value::Ref(heap_id);
        loop {
            let top = self.frames.len() - 1;
            if let Some(handler) = self.frames[top].handlers.pop() {
                tracing::trace!(frame = top, "caught by try handler");
                self.frames[top].stack.truncate(handler.stack_depth);
                self.frames[top].stack.push(thrown);
                self.frames[top].pc = handler.handler_pc;
                return None;
            }
            if self.frames.len() == floor {
                tracing::debug!("exception escaped to top level uncaught");
                return Some(EvalResult::RuntimeError(exception));
            }
            self.frames.pop();
        }
    }

    fn pop_n(&mut self, idx: usize, n: usize) -> Vec<Value> {
        let stack = &mut self.frames[idx].stack;
        let at = stack.len() - n;
        stack.split_off(at)
    }

    fn make_closure(&mut self, function_index: u32, parent: Option<HeapId>, args: Vec<Value>) -> Result<HeapId, Exception> {
        let info = Rc::clone(&self.tables.functions[function_index as usize].closure_info);
        let num_args = info.num_args as usize;
        let num_locals = info.num_variables as usize;
        let mut slots: smallvec::SmallVec<[Value; 8]> = smallvec::smallvec![Value::Null; num_args + num_locals];
        for (slot, value) in slots[..num_args].iter_mut().zip(args) {
            *slot = value;
        }
        self.heap
            .alloc(HeapObject::LocalClosure { info, parent, slots })
            .map_err(|e| Exception::new(ErrorKind::EvalError.to_string(), e.to_string()))
    }

    /// Walks `depth` closure-`parent` hops from `closure` (design note §4.4's
    /// function-boundary-crossing count, also used by `LdArg`/`LdLoc`).
    fn closure_at_depth(&self, mut closure: HeapId, depth: u32) -> Result<HeapId, Exception> {
        for _ in 0..depth {
            closure = match self.heap.get(closure) {
                HeapObject::LocalClosure { parent: Some(p), .. } => *p,
                _ => return Err(Exception::new(ErrorKind::EvalError.to_string(), "variable reference depth exceeds closure chain")),
            };
        }
        Ok(closure)
    }

    fn arg_slot(&self, closure: HeapId, index: u32) -> Value {
        match self.heap.get(closure) {
            HeapObject::LocalClosure { slots, .. } => slots[index as usize],
            other => panic!("argument load against non-closure {other:?}"),
        }
    }

    fn set_arg_slot(&mut self, closure: HeapId, index: u32, value: Value) {
        match self.heap.get_mut(closure) {
            HeapObject::LocalClosure { slots, .. } => slots[index as usize] = value,
            other => panic!("argument store against non-closure {other:?}"),
        }
    }

    fn local_slot(&self, closure: HeapId, index: u32) -> Value {
        match self.heap.get(closure) {
            HeapObject::LocalClosure { info, slots, .. } => slots[info.num_args as usize + index as usize],
            other => panic!("local load against non-closure {other:?}"),
        }
    }

    fn set_local_slot(&mut self, closure: HeapId, index: u32, value: Value) {
        match self.heap.get_mut(closure) {
            HeapObject::LocalClosure { info, slots, .. } => {
                let base = info.num_args as usize;
                slots[base + index as usize] = value;
            }
            other => panic!("local store against non-closure {other:?}"),
        }
    }

    fn call_native(&mut self, sym: Symbol, args: &[Value]) -> Result<Value, Exception> {
        let arity_error = || Exception::new(ErrorKind::NativeMethodError.to_string(), format!("'{}' called with {} arguments", self.symbols.get_name(sym), args.len()));
        match sym.raw() {
            55..=58 if args.len() == 2 => {
                let op = self.symbols.get_name(sym);
                natives::arith(op, &args[0], &args[1]).map_err(smile_error_to_exception)
            }
            51..=54 if args.len() == 2 => {
                let op = self.symbols.get_name(sym);
                natives::compare(op, &args[0], &args[1]).map_err(smile_error_to_exception)
            }
            49 if args.len() == 2 => Ok(Value::Bool(natives::structural_eq(&self.heap, &args[0], &args[1]))),
            50 if args.len() == 2 => Ok(Value::Bool(!natives::structural_eq(&self.heap, &args[0], &args[1]))),
            47 if args.len() == 2 => Ok(Value::Bool(args[0].super_eq(&args[1]))),
            48 if args.len() == 2 => Ok(Value::Bool(!args[0].super_eq(&args[1]))),
            47..=58 => Err(arity_error()),
            _ if self.symbols.get_name(sym) == "throw" => Err(self.build_thrown_exception(args.first().copied().unwrap_or(Value::Null))),
            _ if self.symbols.get_name(sym) == "string-concat" => {
                let joined: String = args.iter().map(|v| self.coerce_to_string(*v)).collect();
                let id = self.heap.alloc(HeapObject::Str(joined)).map_err(|e| Exception::new(ErrorKind::EvalError.to_string(), e.to_string()))?;
                Ok(Value::Ref(id))
            }
            _ => Err(Exception::new(ErrorKind::PropertyError.to_string(), format!("no such native function (symbol #{})", sym.raw()))),
        }
    }

    /// Coerces any value to its string form (design note §3/§9's "coerce-to-string"
    /// vtable method): strings pass through unchanged, other kinds render the
    /// way [`Evaluator::display_value`] does for host-facing output, since
    /// interpolation and printing share the same "how does this look as
    /// text" contract.
    fn coerce_to_string(&self, value: Value) -> String {
        self.display_value(value)
    }

    /// Builds the `Exception` a `throw` call raises (design note §4.5), reading
    /// `kind`/`message` fields off a `UserObject` argument the way
    /// `new {message: "oops"}` produces one; anything else becomes a plain
    /// `UserException` whose message is the argument's debug rendering.
    fn build_thrown_exception(&self, arg: Value) -> Exception {
        if let Value::Ref(id) = arg
            && let HeapObject::UserObject { fields, .. } = self.heap.get(id)
        {
            let kind = self
                .symbols
                .get_symbol_no_create("kind")
                .and_then(|sym| fields.get(&sym))
                .and_then(|value| self.field_as_string(*value))
                .unwrap_or_else(|| ErrorKind::UserException.to_string());
            let message = self
                .symbols
                .get_symbol_no_create("message")
                .and_then(|sym| fields.get(&sym))
                .and_then(|value| self.field_as_string(*value))
                .unwrap_or_default();
            return Exception::new(kind, message);
        }
        Exception::new(ErrorKind::UserException.to_string(), format!("{arg:?}"))
    }

    fn field_as_string(&self, value: Value) -> Option<String> {
        match value {
            Value::Ref(id) => match self.heap.get(id) {
                HeapObject::Str(s) => Some(s.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Calls `func` with `args` to completion, recursing through a nested
    /// `run_until` rather than the explicit `Call`/`CallTail` opcode path.
    /// Used for method dispatch (`Met`), which (unlike `Call`) this compiler
    /// never places in tail position, so a bounded amount of genuine Rust
    /// stack growth per nesting level is an accepted limitation here.
    fn call_value(&mut self, func: Value, args: &[Value]) -> Result<Value, Exception> {
        let Value::Ref(fn_id) = func else {
            return Err(Exception::new(ErrorKind::PropertyError.to_string(), format!("a {} is not callable", func.kind_name())));
        };
        let function_value = match self.heap.get(fn_id) {
            HeapObject::Function(f) => f.clone(),
            other => return Err(Exception::new(ErrorKind::PropertyError.to_string(), format!("a {} is not callable", other.kind_name()))),
        };
        match function_value {
            FunctionValue::Native(sym) if self.symbols.get_name(sym) == "each" => {
                let frame = self.start_each_iteration(args.to_vec())?;
                let floor = self.frames.len();
                self.frames.push(*frame);
                match self.run_until(floor) {
                    EvalResult::Ok { value } => Ok(value),
                    EvalResult::RuntimeError(exception) => Err(exception),
                    EvalResult::ParseErrors(_) => unreachable!("run_until never produces parse errors"),
                }
            }
            FunctionValue::Native(sym) => self.call_native(sym, args),
            FunctionValue::Closure { function_index, parent } => {
                self.heap
                    .tracker()
                    .check_recursion_depth(self.frames.len())
                    .map_err(|e| Exception::new(ErrorKind::EvalError.to_string(), e.to_string()))?;
                let argc = u16::try_from(args.len()).unwrap_or(u16::MAX);
                let closure = self.make_closure(function_index, parent, args.to_vec())?;
                let floor = self.frames.len();
                self.frames.push(Frame { function_index, closure, pc: 0, argc, locals_top: 0, stack: Vec::new(), handlers: Vec::new(), state_machine: None });
                match self.run_until(floor) {
                    EvalResult::Ok { value } => Ok(value),
                    EvalResult::RuntimeError(exception) => Err(exception),
                    EvalResult::ParseErrors(_) => unreachable!("run_until never produces parse errors"),
                }
            }
        }
    }

    /// Builds the cooperative-iteration frame for `each(list, fn)`: the
    /// first concrete state-machine native (design note §4.5). `list` must be a
    /// well-formed list (design note §3); its elements are collected up front,
    /// one `fn` call per element is then driven lazily by the main loop.
    fn start_each_iteration(&mut self, args: Vec<Value>) -> Result<Box<Frame>, Exception> {
        let [list, func] = <[Value; 2]>::try_from(args).map_err(|args| {
            Exception::new(ErrorKind::NativeMethodError.to_string(), format!("'each' requires 2 arguments (a list and a function), got {}", args.len()))
        })?;
        let elements = self
            .heap
            .collect_well_formed_list(list)
            .ok_or_else(|| Exception::new(ErrorKind::TypeAssertion.to_string(), "'each' requires a well-formed list as its first argument"))?;
        Ok(Box::new(Frame {
            function_index: u32::MAX,
            closure: self.global,
            pc: 0,
            argc: 0,
            locals_top: 0,
            stack: Vec::new(),
            handlers: Vec::new(),
            state_machine: Some(Box::new(EachIterator::new(elements, func))),
        }))
    }

    /// Method dispatch for `Op_Met` (design note §6): look up `property` among
    /// `this`'s fields (a user-defined method, self passed as the first
    /// argument), falling back to the dozen native operators when invoked
    /// method-style (`5 .+ 3`). Anything else is "does not understand"
    /// (design note glossary).
    fn dispatch_method(&mut self, this: Value, property: Symbol, args: Vec<Value>) -> Result<Value, Exception> {
        if let Value::Ref(id) = this
            && let HeapObject::UserObject { fields, .. } = self.heap.get(id)
            && let Some(method) = fields.get(&property).copied()
        {
            let mut full_args = Vec::with_capacity(args.len() + 1);
            full_args.push(this);
            full_args.extend(args);
            return self.call_value(method, &full_args);
        }
        if (47..=58).contains(&property.raw()) {
            let mut full_args = Vec::with_capacity(args.len() + 1);
            full_args.push(this);
            full_args.extend(args);
            return self.call_native(property, &full_args);
        }
        Err(Exception::new(
            ErrorKind::PropertyError.to_string(),
            format!("a {} does not understand '{}'", this.kind_name(), self.symbols.get_name(property)),
        ))
    }

    fn invoke(&mut self, idx: usize, func: Value, args: Vec<Value>, tail: bool) -> Result<Step, Exception> {
        let Value::Ref(fn_id) = func else {
            return Err(Exception::new(ErrorKind::PropertyError.to_string(), format!("a {} is not callable", func.kind_name())));
        };
        let function_value = match self.heap.get(fn_id) {
            HeapObject::Function(f) => f.clone(),
            other => return Err(Exception::new(ErrorKind::PropertyError.to_string(), format!("a {} is not callable", other.kind_name()))),
        };
        match function_value {
            FunctionValue::Native(sym) if self.symbols.get_name(sym) == "each" => {
                let frame = self.start_each_iteration(args)?;
                Ok(if tail { Step::TailFrame(frame) } else { Step::PushFrame(frame) })
            }
            FunctionValue::Native(sym) => {
                let value = self.call_native(sym, &args)?;
                if tail {
                    Ok(Step::Return(value))
                } else {
                    self.frames[idx].stack.push(value);
                    Ok(Step::Next)
                }
            }
            FunctionValue::Closure { function_index, parent } => {
                if !tail {
                    self.heap
                        .tracker()
                        .check_recursion_depth(self.frames.len())
                        .map_err(|e| Exception::new(ErrorKind::EvalError.to_string(), e.to_string()))?;
                }
                let argc = u16::try_from(args.len()).unwrap_or(u16::MAX);
                let closure = self.make_closure(function_index, parent, args)?;
                let frame = Box::new(Frame { function_index, closure, pc: 0, argc, locals_top: 0, stack: Vec::new(), handlers: Vec::new(), state_machine: None });
                Ok(if tail { Step::TailFrame(frame) } else { Step::PushFrame(frame) })
            }
        }
    }

    #[expect(clippy::too_many_lines, reason = "one opcode per match arm reads better flat than split across helpers")]
    fn execute(&mut self, idx: usize, pc: usize, opcode: Opcode, operand: Operand) -> Result<Step, Exception> {
        self.heap.tracker_mut().check_time().map_err(|e| Exception::new(ErrorKind::EvalError.to_string(), e.to_string()))?;
        let closure = self.frames[idx].closure;

        match opcode {
            Opcode::Nop | Opcode::Brk => Ok(Step::Next),
            Opcode::Dup1 => {
                let top = *self.frames[idx].stack.last().expect("Dup1 needs a value on the stack");
                self.frames[idx].stack.push(top);
                Ok(Step::Next)
            }
            Opcode::Pop1 => {
                self.frames[idx].stack.pop();
                Ok(Step::Next)
            }
            Opcode::Pop => {
                let Operand::Index(n) = operand else { unreachable!("Pop operand") };
                let new_len = self.frames[idx].stack.len() - n as usize;
                self.frames[idx].stack.truncate(new_len);
                Ok(Step::Next)
            }

            Opcode::LdNull => {
                self.frames[idx].stack.push(Value::Null);
                Ok(Step::Next)
            }
            Opcode::LdBool(b) => {
                self.frames[idx].stack.push(Value::Bool(b));
                Ok(Step::Next)
            }
            Opcode::LdChar => {
                let Operand::Byte(c) = operand else { unreachable!("LdChar operand") };
                self.frames[idx].stack.push(Value::Char(c));
                Ok(Step::Next)
            }
            Opcode::LdUni => {
                let Operand::Int32(c) = operand else { unreachable!("LdUni operand") };
                let c = char::from_u32(u32::try_from(c).unwrap_or(0)).unwrap_or('\u{FFFD}');
                self.frames[idx].stack.push(Value::Uni(c));
                Ok(Step::Next)
            }
            Opcode::LdStr => {
                let Operand::Index(i) = operand else { unreachable!("LdStr operand") };
                self.frames[idx].stack.push(Value::Ref(self.string_objects[i as usize]));
                Ok(Step::Next)
            }
            Opcode::LdSym => {
                let Operand::Symbol(s) = operand else { unreachable!("LdSym operand") };
                self.frames[idx].stack.push(Value::Symbol(s));
                Ok(Step::Next)
            }
            Opcode::LdObj => {
                let Operand::Index(i) = operand else { unreachable!("LdObj operand") };
                self.frames[idx].stack.push(self.tables.objects[i as usize]);
                Ok(Step::Next)
            }
            Opcode::Ld8 => {
                let Operand::Byte(b) = operand else { unreachable!("Ld8 operand") };
                self.frames[idx].stack.push(Value::Byte(b));
                Ok(Step::Next)
            }
            Opcode::Ld16 => {
                let Operand::Int16(v) = operand else { unreachable!("Ld16 operand") };
                self.frames[idx].stack.push(Value::Int16(v));
                Ok(Step::Next)
            }
            Opcode::Ld32 => {
                let Operand::Int32(v) = operand else { unreachable!("Ld32 operand") };
                self.frames[idx].stack.push(Value::Int32(v));
                Ok(Step::Next)
            }
            Opcode::Ld64 => {
                let Operand::Int64(v) = operand else { unreachable!("Ld64 operand") };
                self.frames[idx].stack.push(Value::Int64(v));
                Ok(Step::Next)
            }
            Opcode::LdR64 => {
                let Operand::Real64Bits(bits) = operand else { unreachable!("LdR64 operand") };
                self.frames[idx].stack.push(Value::Real64(f64::from_bits(bits)));
                Ok(Step::Next)
            }
            Opcode::LdF64 => {
                let Operand::Float64(v) = operand else { unreachable!("LdF64 operand") };
                self.frames[idx].stack.push(Value::Float64(v));
                Ok(Step::Next)
            }
            Opcode::LdR32 | Opcode::LdF32 | Opcode::LdR128 | Opcode::LdF128 => Err(Exception::new(
                ErrorKind::EvalError.to_string(),
                format!("{opcode} is not emitted by this compiler and has no runtime representation yet"),
            )),

            Opcode::LdArg => {
                let Operand::Pair(depth, index) = operand else { unreachable!("LdArg operand") };
                let target = self.closure_at_depth(closure, u32::try_from(depth).unwrap())?;
                self.frames[idx].stack.push(self.arg_slot(target, u32::try_from(index).unwrap()));
                Ok(Step::Next)
            }
            Opcode::LdArgFast(depth) => {
                let Operand::Index(index) = operand else { unreachable!("LdArgFast operand") };
                let target = self.closure_at_depth(closure, u32::from(depth))?;
                self.frames[idx].stack.push(self.arg_slot(target, index));
                Ok(Step::Next)
            }
            Opcode::StArg | Opcode::StpArg => {
                let Operand::Pair(depth, index) = operand else { unreachable!("StArg operand") };
                let value = if matches!(opcode, Opcode::StpArg) {
                    self.frames[idx].stack.pop().expect("StpArg needs a value")
                } else {
                    *self.frames[idx].stack.last().expect("StArg needs a value")
                };
                let target = self.closure_at_depth(closure, u32::try_from(depth).unwrap())?;
                self.set_arg_slot(target, u32::try_from(index).unwrap(), value);
                Ok(Step::Next)
            }
            Opcode::StArgFast(depth) => {
                let Operand::Index(index) = operand else { unreachable!("StArgFast operand") };
                let value = self.frames[idx].stack.pop().expect("StArgFast needs a value");
                let target = self.closure_at_depth(closure, u32::from(depth))?;
                self.set_arg_slot(target, index, value);
                Ok(Step::Next)
            }
            Opcode::LdLoc => {
                let Operand::Pair(depth, index) = operand else { unreachable!("LdLoc operand") };
                let target = self.closure_at_depth(closure, u32::try_from(depth).unwrap())?;
                self.frames[idx].stack.push(self.local_slot(target, u32::try_from(index).unwrap()));
                Ok(Step::Next)
            }
            Opcode::LdLocFast(depth) => {
                let Operand::Index(index) = operand else { unreachable!("LdLocFast operand") };
                let target = self.closure_at_depth(closure, u32::from(depth))?;
                self.frames[idx].stack.push(self.local_slot(target, index));
                Ok(Step::Next)
            }
            Opcode::StLoc | Opcode::StpLoc => {
                let Operand::Pair(depth, index) = operand else { unreachable!("StLoc operand") };
                let value = if matches!(opcode, Opcode::StpLoc) {
                    self.frames[idx].stack.pop().expect("StpLoc needs a value")
                } else {
                    *self.frames[idx].stack.last().expect("StLoc needs a value")
                };
                let target = self.closure_at_depth(closure, u32::try_from(depth).unwrap())?;
                self.set_local_slot(target, u32::try_from(index).unwrap(), value);
                Ok(Step::Next)
            }
            Opcode::StLocFast(depth) => {
                let Operand::Index(index) = operand else { unreachable!("StLocFast operand") };
                let value = self.frames[idx].stack.pop().expect("StLocFast needs a value");
                let target = self.closure_at_depth(closure, u32::from(depth))?;
                self.set_local_slot(target, index, value);
                Ok(Step::Next)
            }

            Opcode::LdX => {
                let Operand::Symbol(sym) = operand else { unreachable!("LdX operand") };
                let HeapObject::GlobalClosure { vars } = self.heap.get(self.global) else { unreachable!("global is always a GlobalClosure") };
                let value = vars.get(&sym).copied().ok_or_else(|| {
                    Exception::new(ErrorKind::EvalError.to_string(), format!("'{}' is not defined", self.symbols.get_name(sym)))
                })?;
                self.frames[idx].stack.push(value);
                Ok(Step::Next)
            }
            Opcode::StX | Opcode::StpX => {
                let Operand::Symbol(sym) = operand else { unreachable!("StX operand") };
                let value = if matches!(opcode, Opcode::StpX) {
                    self.frames[idx].stack.pop().expect("StpX needs a value")
                } else {
                    *self.frames[idx].stack.last().expect("StX needs a value")
                };
                let HeapObject::GlobalClosure { vars } = self.heap.get_mut(self.global) else { unreachable!("global is always a GlobalClosure") };
                vars.insert(sym, value);
                Ok(Step::Next)
            }

            Opcode::LdProp => {
                let Operand::Symbol(sym) = operand else { unreachable!("LdProp operand") };
                let obj = self.frames[idx].stack.pop().expect("LdProp needs an object");
                // Two passes: first decide (without mutating the heap) whether this
                // is an ordinary field read or an exception's `kind`/`message`
                // string that still needs allocating, then act on that decision —
                // keeps the borrow of `self.heap.get(id)` from overlapping the
                // `self.heap.alloc` call a string read requires.
                enum Read {
                    Value(Value),
                    ExceptionText(String),
                }
                let read = match obj {
                    Value::Ref(id) => match self.heap.get(id) {
                        HeapObject::UserObject { fields, security, .. } => {
                            if !security.readable {
                                return Err(Exception::new(ErrorKind::ObjectSecurityError.to_string(), "property is not readable"));
                            }
                            Read::Value(fields.get(&sym).copied().unwrap_or(Value::Null))
                        }
                        // A caught exception (design note §4.5) exposes `kind`/`message`
                        // as plain string-valued properties, not a general `fields` map.
                        HeapObject::Exception(exception) => match self.symbols.get_name(sym) {
                            "kind" => Read::ExceptionText(exception.kind.clone()),
                            "message" => Read::ExceptionText(exception.message.clone()),
                            _ => Read::Value(Value::Null),
                        },
                        _ => Read::Value(Value::Null),
                    },
                    _ => Read::Value(Value::Null),
                };
                let value = match read {
                    Read::Value(value) => value,
                    Read::ExceptionText(text) => {
                        let str_id = self
                            .heap
                            .alloc(HeapObject::Str(text))
                            .map_err(|e| Exception::new(ErrorKind::EvalError.to_string(), e.to_string()))?;
                        Value::Ref(str_id)
                    }
                };
                self.frames[idx].stack.push(value);
                Ok(Step::Next)
            }
            Opcode::StProp => {
                let Operand::Symbol(sym) = operand else { unreachable!("StProp operand") };
                let obj = self.frames[idx].stack.pop().expect("StProp needs an object");
                let value = *self.frames[idx].stack.last().expect("StProp needs a value below the object");
                if let Value::Ref(id) = obj {
                    match self.heap.get_mut(id) {
                        HeapObject::UserObject { fields, security, .. } => {
                            if !security.writable {
                                return Err(Exception::new(ErrorKind::ObjectSecurityError.to_string(), "property is not writable"));
                            }
                            fields.insert(sym, value);
                        }
                        other => return Err(Exception::new(ErrorKind::PropertyError.to_string(), format!("a {} has no settable properties", other.kind_name()))),
                    }
                }
                Ok(Step::Next)
            }
            Opcode::LdMember => {
                let member = self.frames[idx].stack.pop().expect("LdMember needs a member name");
                let obj = self.frames[idx].stack.pop().expect("LdMember needs an object");
                let get_member = Symbol::from_raw(92);
                let value = self.dispatch_method(obj, get_member, vec![member])?;
                self.frames[idx].stack.push(value);
                Ok(Step::Next)
            }
            Opcode::StMember => {
                let value = self.frames[idx].stack.pop().expect("StMember needs a value");
                let member = self.frames[idx].stack.pop().expect("StMember needs a member name");
                let obj = self.frames[idx].stack.pop().expect("StMember needs an object");
                let set_member = Symbol::from_raw(93);
                let result = self.dispatch_method(obj, set_member, vec![member, value])?;
                self.frames[idx].stack.push(result);
                Ok(Step::Next)
            }

            Opcode::Jmp => {
                let Operand::BranchTarget(offset) = operand else { unreachable!("Jmp operand") };
                Ok(Step::Jump(absolute(pc, offset)))
            }
            Opcode::Bt | Opcode::Bf => {
                let Operand::BranchTarget(offset) = operand else { unreachable!("Bt/Bf operand") };
                let cond = self.frames[idx].stack.pop().expect("Bt/Bf needs a condition").is_truthy();
                let take = if matches!(opcode, Opcode::Bt) { cond } else { !cond };
                Ok(if take { Step::Jump(absolute(pc, offset)) } else { Step::Next })
            }

            Opcode::Met | Opcode::Met0 | Opcode::Met1 | Opcode::Met2 | Opcode::Met3 | Opcode::Met4 | Opcode::Met5 | Opcode::Met6 | Opcode::Met7 => {
                let (sym_raw, argc) = match (opcode, operand) {
                    (Opcode::Met, Operand::Pair(s, n)) => (s, n as usize),
                    (Opcode::Met0, Operand::Index(s)) => (i32::try_from(s).unwrap(), 0),
                    (Opcode::Met1, Operand::Index(s)) => (i32::try_from(s).unwrap(), 1),
                    (Opcode::Met2, Operand::Index(s)) => (i32::try_from(s).unwrap(), 2),
                    (Opcode::Met3, Operand::Index(s)) => (i32::try_from(s).unwrap(), 3),
                    (Opcode::Met4, Operand::Index(s)) => (i32::try_from(s).unwrap(), 4),
                    (Opcode::Met5, Operand::Index(s)) => (i32::try_from(s).unwrap(), 5),
                    (Opcode::Met6, Operand::Index(s)) => (i32::try_from(s).unwrap(), 6),
                    (Opcode::Met7, Operand::Index(s)) => (i32::try_from(s).unwrap(), 7),
                    _ => unreachable!("Met-family operand"),
                };
                let args = self.pop_n(idx, argc);
                let this = self.frames[idx].stack.pop().expect("Met needs a target object");
                let sym = Symbol::from_raw(u32::try_from(sym_raw).unwrap());
                let result = self.dispatch_method(this, sym, args)?;
                self.frames[idx].stack.push(result);
                Ok(Step::Next)
            }

            Opcode::Call | Opcode::CallTail => {
                let n = match operand {
                    Operand::Index(n) => n as usize,
                    other => unreachable!("Call/CallTail operand {other:?}"),
                };
                let args = self.pop_n(idx, n);
                let func = self.frames[idx].stack.pop().expect("Call needs a function");
                let tail = matches!(opcode, Opcode::CallTail);
                if !tail {
                    self.frames[idx].pc += 1;
                }
                let step = self.invoke(idx, func, args, tail)?;
                if tail {
                    Ok(step)
                } else {
                    // pc already advanced; PushFrame doesn't touch it further.
                    match step {
                        Step::Next => Ok(Step::Applied),
                        other => Ok(other),
                    }
                }
            }
            Opcode::Call0 | Opcode::Call1 | Opcode::Call2 | Opcode::Call3 | Opcode::Call4 | Opcode::Call5 | Opcode::Call6 | Opcode::Call7 => {
                let n = match opcode {
                    Opcode::Call0 => 0,
                    Opcode::Call1 => 1,
                    Opcode::Call2 => 2,
                    Opcode::Call3 => 3,
                    Opcode::Call4 => 4,
                    Opcode::Call5 => 5,
                    Opcode::Call6 => 6,
                    Opcode::Call7 => 7,
                    _ => unreachable!(),
                };
                let args = self.pop_n(idx, n);
                let func = self.frames[idx].stack.pop().expect("Call needs a function");
                self.frames[idx].pc += 1;
                match self.invoke(idx, func, args, false)? {
                    Step::Next => Ok(Step::Applied),
                    other => Ok(other),
                }
            }
            Opcode::CallEsc => Err(Exception::new(
                ErrorKind::EvalError.to_string(),
                "CallEsc is not emitted by this compiler (escape continuations are carried solely by till-flags)",
            )),

            Opcode::LocalAlloc => {
                let Operand::Index(n) = operand else { unreachable!("LocalAlloc operand") };
                let base = self.frames[idx].locals_top;
                for i in 0..u16::try_from(n).unwrap() {
                    self.set_local_slot(closure, u32::from(base + i), Value::Null);
                }
                self.frames[idx].locals_top += u16::try_from(n).unwrap();
                Ok(Step::Next)
            }
            Opcode::LocalFree => {
                let Operand::Index(n) = operand else { unreachable!("LocalFree operand") };
                self.frames[idx].locals_top -= u16::try_from(n).unwrap();
                Ok(Step::Next)
            }
            Opcode::Args => {
                let Operand::Index(min) = operand else { unreachable!("Args operand") };
                if u32::from(self.frames[idx].argc) < min {
                    return Err(Exception::new(
                        ErrorKind::NativeMethodError.to_string(),
                        format!("function requires at least {min} arguments, called with {}", self.frames[idx].argc),
                    ));
                }
                Ok(Step::Next)
            }
            Opcode::Ret => {
                let value = self.frames[idx].stack.pop().expect("Ret needs a value");
                Ok(Step::Return(value))
            }

            Opcode::Begin | Opcode::End => Err(Exception::new(
                ErrorKind::EvalError.to_string(),
                format!("{opcode} is not emitted by this compiler (LocalAlloc/LocalFree are used instead)"),
            )),
            Opcode::Try => {
                let Operand::BranchTarget(offset) = operand else { unreachable!("Try operand") };
                self.frames[idx].handlers.push(TryHandler {
                    handler_pc: absolute(pc, offset),
                    stack_depth: self.frames[idx].stack.len(),
                });
                Ok(Step::Next)
            }
            Opcode::EndTry => {
                self.frames[idx].handlers.pop();
                Ok(Step::Next)
            }
            Opcode::JmpEsc | Opcode::Esc => Err(Exception::new(
                ErrorKind::EvalError.to_string(),
                format!("{opcode} is not emitted by this compiler (till-escapes use TillEsc directly)"),
            )),
            Opcode::TillEsc => {
                let Operand::TillEscape { depth, till_id, flag } = operand else { unreachable!("TillEsc operand") };
                let escape_value = self.frames[idx].stack.pop().expect("TillEsc needs the escaping value");
                let target_closure = self.closure_at_depth(closure, depth)?;
                let owner = self
                    .frames
                    .iter()
                    .enumerate()
                    .rev()
                    .find(|(_, frame)| frame.closure == target_closure)
                    .map(|(i, _)| i)
                    .ok_or_else(|| Exception::new(ErrorKind::EvalError.to_string(), "till-escape target frame is no longer on the stack"))?;
                let owner_function = self.frames[owner].function_index;
                let exit = self.tables.functions[owner_function as usize]
                    .till_exits
                    .iter()
                    .find(|e| e.till_id == till_id && e.flag == flag)
                    .copied()
                    .ok_or_else(|| Exception::new(ErrorKind::EvalError.to_string(), "no matching till exit"))?;
                self.frames.truncate(owner + 1);
                self.frames[owner].stack.push(escape_value);
                self.frames[owner].pc = exit.pc as usize;
                Ok(Step::Applied)
            }

            Opcode::SuperEq => {
                let b = self.frames[idx].stack.pop().expect("SuperEq needs two values");
                let a = self.frames[idx].stack.pop().expect("SuperEq needs two values");
                self.frames[idx].stack.push(Value::Bool(a.super_eq(&b)));
                Ok(Step::Next)
            }
            Opcode::SuperNe => {
                let b = self.frames[idx].stack.pop().expect("SuperNe needs two values");
                let a = self.frames[idx].stack.pop().expect("SuperNe needs two values");
                self.frames[idx].stack.push(Value::Bool(!a.super_eq(&b)));
                Ok(Step::Next)
            }
            Opcode::Not => {
                let v = self.frames[idx].stack.pop().expect("Not needs a value");
                self.frames[idx].stack.push(Value::Bool(!v.is_truthy()));
                Ok(Step::Next)
            }
            Opcode::Bool => {
                let v = self.frames[idx].stack.pop().expect("Bool needs a value");
                self.frames[idx].stack.push(Value::Bool(v.is_truthy()));
                Ok(Step::Next)
            }
            Opcode::Is => {
                let type_name = self.frames[idx].stack.pop().expect("Is needs a type name");
                let value = self.frames[idx].stack.pop().expect("Is needs a value");
                let matches = match type_name {
                    Value::Symbol(sym) => self.symbols.get_name(sym).eq_ignore_ascii_case(value.kind_name()),
                    _ => false,
                };
                self.frames[idx].stack.push(Value::Bool(matches));
                Ok(Step::Next)
            }
            Opcode::TypeOf => {
                let value = self.frames[idx].stack.pop().expect("TypeOf needs a value");
                let name = value.kind_name().to_owned();
                let sym = self.symbols.get_symbol(&name);
                self.frames[idx].stack.push(Value::Symbol(sym));
                Ok(Step::Next)
            }

            Opcode::Cons => {
                let d = self.frames[idx].stack.pop().expect("Cons needs two values");
                let a = self.frames[idx].stack.pop().expect("Cons needs two values");
                let id = self.heap.alloc(HeapObject::List { a, d, pos: None }).map_err(resource_error_to_exception)?;
                self.frames[idx].stack.push(Value::Ref(id));
                Ok(Step::Next)
            }
            Opcode::Car => {
                let list = self.frames[idx].stack.pop().expect("Car needs a list");
                let Value::Ref(id) = list else {
                    return Err(Exception::new(ErrorKind::TypeAssertion.to_string(), "car of a non-List"));
                };
                let HeapObject::List { a, .. } = self.heap.get(id) else {
                    return Err(Exception::new(ErrorKind::TypeAssertion.to_string(), "car of a non-List"));
                };
                self.frames[idx].stack.push(*a);
                Ok(Step::Next)
            }
            Opcode::Cdr => {
                let list = self.frames[idx].stack.pop().expect("Cdr needs a list");
                let Value::Ref(id) = list else {
                    return Err(Exception::new(ErrorKind::TypeAssertion.to_string(), "cdr of a non-List"));
                };
                let HeapObject::List { d, .. } = self.heap.get(id) else {
                    return Err(Exception::new(ErrorKind::TypeAssertion.to_string(), "cdr of a non-List"));
                };
                self.frames[idx].stack.push(*d);
                Ok(Step::Next)
            }
            Opcode::NewPair => {
                let right = self.frames[idx].stack.pop().expect("NewPair needs two values");
                let left = self.frames[idx].stack.pop().expect("NewPair needs two values");
                let id = self.heap.alloc(HeapObject::Pair { left, right }).map_err(resource_error_to_exception)?;
                self.frames[idx].stack.push(Value::Ref(id));
                Ok(Step::Next)
            }
            Opcode::Left => {
                let pair = self.frames[idx].stack.pop().expect("Left needs a pair");
                let Value::Ref(id) = pair else {
                    return Err(Exception::new(ErrorKind::TypeAssertion.to_string(), "left of a non-Pair"));
                };
                let HeapObject::Pair { left, .. } = self.heap.get(id) else {
                    return Err(Exception::new(ErrorKind::TypeAssertion.to_string(), "left of a non-Pair"));
                };
                self.frames[idx].stack.push(*left);
                Ok(Step::Next)
            }
            Opcode::Right => {
                let pair = self.frames[idx].stack.pop().expect("Right needs a pair");
                let Value::Ref(id) = pair else {
                    return Err(Exception::new(ErrorKind::TypeAssertion.to_string(), "right of a non-Pair"));
                };
                let HeapObject::Pair { right, .. } = self.heap.get(id) else {
                    return Err(Exception::new(ErrorKind::TypeAssertion.to_string(), "right of a non-Pair"));
                };
                self.frames[idx].stack.push(*right);
                Ok(Step::Next)
            }
            Opcode::NewFn => {
                let Operand::Index(function_index) = operand else { unreachable!("NewFn operand") };
                let id = self
                    .heap
                    .alloc(HeapObject::Function(FunctionValue::Closure { function_index, parent: Some(closure) }))
                    .map_err(resource_error_to_exception)?;
                self.frames[idx].stack.push(Value::Ref(id));
                Ok(Step::Next)
            }
            Opcode::NewObj => {
                let Operand::Index(n) = operand else { unreachable!("NewObj operand") };
                let n = n as usize;
                let mut fields = indexmap::IndexMap::new();
                for _ in 0..n {
                    let value = self.frames[idx].stack.pop().expect("NewObj needs a value per member");
                    let name = self.frames[idx].stack.pop().expect("NewObj needs a symbol per member");
                    let Value::Symbol(sym) = name else {
                        return Err(Exception::new(ErrorKind::EvalError.to_string(), "NewObj member name must be a symbol"));
                    };
                    fields.insert(sym, value);
                }
                let base = self.frames[idx].stack.pop().expect("NewObj needs a base value");
                let class_name = match base {
                    Value::Symbol(sym) => Some(sym),
                    _ => None,
                };
                let id = self
                    .heap
                    .alloc(HeapObject::UserObject { class_name, fields, security: SecurityFlags::open() })
                    .map_err(resource_error_to_exception)?;
                self.frames[idx].stack.push(Value::Ref(id));
                Ok(Step::Next)
            }
            Opcode::NewRange => {
                let end = self.frames[idx].stack.pop().expect("NewRange needs two values");
                let start = self.frames[idx].stack.pop().expect("NewRange needs two values");
                let range = match (start, end) {
                    (Value::Int32(s), Value::Int32(e)) => crate::value::RangeValue::Int { start: i64::from(s), end: i64::from(e), step: 1 },
                    (Value::Int64(s), Value::Int64(e)) => crate::value::RangeValue::Int { start: s, end: e, step: 1 },
                    (Value::Char(s), Value::Char(e)) => crate::value::RangeValue::Char { start: s, end: e },
                    (Value::Uni(s), Value::Uni(e)) => crate::value::RangeValue::Uni { start: s, end: e },
                    _ => return Err(Exception::new(ErrorKind::TypeAssertion.to_string(), "range endpoints must be the same orderable type")),
                };
                let id = self.heap.alloc(HeapObject::Range(range)).map_err(resource_error_to_exception)?;
                self.frames[idx].stack.push(Value::Ref(id));
                Ok(Step::Next)
            }

            Opcode::Label => unreachable!("Label is compiler-internal and never reaches a linearized segment"),
        }
    }
}

/// Absolute target for a relative `BranchTarget`: the branch instruction's
/// own address plus the signed offset (matches `compiler::ir::linearize`,
/// which computes the offset the same way).
fn absolute(pc: usize, offset: i32) -> usize {
    (i64::from(i32::try_from(pc).expect("segment longer than i32::MAX")) + i64::from(offset)) as usize
}

fn smile_error_to_exception(error: SmileError) -> Exception {
    let mut exception = Exception::new(error.kind.to_string(), error.message);
    if let Some(position) = error.position {
        exception.push_frame(StackFrame { function_name: None, line: position.line });
    }
    exception
}

fn resource_error_to_exception(error: crate::resource::ResourceError) -> Exception {
    Exception::new(ErrorKind::EvalError.to_string(), error.to_string())
}

/// The dozen operator known-symbol ids (design note §9 known-symbol table) that
/// the global closure pre-populates as natives — every other name in
/// `intern::KNOWN_SYMBOLS` is a keyword, punctuation token, or syntax-class
/// nonterminal the parser/compiler consume directly, not a callable value.
const NATIVE_OPERATOR_SYMBOLS: &[u32] = &[47, 48, 49, 50, 51, 52, 53, 54, 55, 56, 57, 58];

/// Shortest decimal string that round-trips through `f64` parsing
/// (design note §8 round-trip "Numeric literals: parse then print ... returns a
/// semantically-equal value"), via the `ryu` crate rather than
/// `f64::to_string` (whose output isn't guaranteed minimal).
fn float_repr_f64(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_owned();
    }
    if f.is_infinite() {
        return if f.is_sign_negative() { "-inf".to_owned() } else { "inf".to_owned() };
    }
    let mut buffer = ryu::Buffer::new();
    fix_ryu_exponent(buffer.format(f))
}

/// `f32` counterpart of [`float_repr_f64`] — formats at `f32` precision
/// rather than widening to `f64` first, so e.g. `1.1f32` still prints its
/// own shortest round-tripping form instead of `f64`'s.
fn float_repr_f32(f: f32) -> String {
    if f.is_nan() {
        return "nan".to_owned();
    }
    if f.is_infinite() {
        return if f.is_sign_negative() { "-inf".to_owned() } else { "inf".to_owned() };
    }
    let mut buffer = ryu::Buffer::new();
    fix_ryu_exponent(buffer.format(f))
}

/// `ryu` emits `1e20`; Smile source syntax (and this renderer) uses `1e+20`
/// for non-negative exponents, and always keeps a decimal point.
fn fix_ryu_exponent(s: &str) -> String {
    if let Some(e_pos) = s.find('e') {
        let (mantissa, exp_part) = s.split_at(e_pos);
        let exp = &exp_part[1..];
        return if exp.starts_with('-') { s.to_owned() } else { format!("{mantissa}e+{exp}") };
    }
    if s.contains('.') { s.to_owned() } else { format!("{s}.0") }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::parser::ast::{Expr, Param};
    use crate::resource::NO_LIMIT_TRACKER;
    use crate::value::Value as V;

    #[test]
    fn float_repr_round_trips_through_f64_parsing() {
        for f in [0.1_f64, 1.0, -2.5, 3.0, 100.0, 1e20, 1e-20, -0.0] {
            let text = float_repr_f64(f);
            assert_eq!(text.parse::<f64>().unwrap().to_bits(), f.to_bits(), "{text} did not round-trip");
        }
    }

    #[test]
    fn float_repr_formats_special_values_and_exponents() {
        assert_eq!(float_repr_f64(f64::NAN), "nan");
        assert_eq!(float_repr_f64(f64::INFINITY), "inf");
        assert_eq!(float_repr_f64(f64::NEG_INFINITY), "-inf");
        assert_eq!(float_repr_f64(3.0), "3.0");
        assert_eq!(float_repr_f64(1e20), "1e+20");
        assert_eq!(float_repr_f64(1e-20), "1e-20");
    }

    #[test]
    fn float_repr_f32_uses_f32_precision_not_f64() {
        let third: f32 = 1.0 / 3.0;
        let text = float_repr_f32(third);
        assert_eq!(text.parse::<f32>().unwrap().to_bits(), third.to_bits());
    }

    fn run_program(mut symbols: SymbolTable, expr: &Expr) -> EvalResult {
        let compiler = Compiler::new(&mut symbols);
        let (entry_index, tables) = compiler.compile_program(expr);
        let mut evaluator = Evaluator::new(tables, symbols, NO_LIMIT_TRACKER);
        evaluator.eval_entry(entry_index)
    }

    #[test]
    fn evaluates_arithmetic_with_precedence() {
        let mut symbols = SymbolTable::new();
        let plus = symbols.get_symbol("+");
        let star = symbols.get_symbol("*");
        // 1 + 2 * 3
        let expr = Expr::Call {
            func: Box::new(Expr::Var(plus)),
            args: vec![
                Expr::Literal(V::Int32(1)),
                Expr::Call {
                    func: Box::new(Expr::Var(star)),
                    args: vec![Expr::Literal(V::Int32(2)), Expr::Literal(V::Int32(3))],
                },
            ],
        };
        match run_program(symbols, &expr) {
            EvalResult::Ok { value: V::Int64(n) } => assert_eq!(n, 7),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn calls_a_user_defined_function() {
        let mut symbols = SymbolTable::new();
        let x = symbols.get_symbol("x");
        let plus = symbols.get_symbol("+");
        let one_arg_fn = Expr::Fn {
            params: vec![Param { name: x, type_expr: None, default: None, rest: false }],
            body: Box::new(Expr::Call { func: Box::new(Expr::Var(plus)), args: vec![Expr::Var(x), Expr::Literal(V::Int32(1))] }),
        };
        let expr = Expr::Call { func: Box::new(one_arg_fn), args: vec![Expr::Literal(V::Int32(41))] };
        match run_program(symbols, &expr) {
            EvalResult::Ok { value: V::Int64(n) } => assert_eq!(n, 42),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn till_escapes_through_a_nested_function_call() {
        // till { done: } do { (fn |x| x done 99) 0 }
        // The nested function invokes `done` from inside its own call frame,
        // escaping the enclosing till across that function boundary with 99
        // rather than returning normally to its own caller.
        let mut symbols = SymbolTable::new();
        let done = symbols.get_symbol("done");
        let x = symbols.get_symbol("x");
        let nested_fn = Expr::Fn {
            params: vec![Param { name: x, type_expr: None, default: None, rest: false }],
            body: Box::new(Expr::Call { func: Box::new(Expr::Var(done)), args: vec![Expr::Literal(V::Int32(99))] }),
        };
        let body = Expr::Call { func: Box::new(nested_fn), args: vec![Expr::Literal(V::Int32(0))] };
        let expr = Expr::Till { flags: vec![done], body: Box::new(body), when_clauses: vec![] };
        match run_program(symbols, &expr) {
            EvalResult::Ok { value: V::Int32(n) } => assert_eq!(n, 99),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn uncaught_exception_unwinds_to_the_top_level() {
        let mut symbols = SymbolTable::new();
        let div = symbols.get_symbol("/");
        let expr = Expr::Call {
            func: Box::new(Expr::Var(div)),
            args: vec![Expr::Literal(V::Int32(1)), Expr::Literal(V::Int32(0))],
        };
        match run_program(symbols, &expr) {
            EvalResult::RuntimeError(exception) => assert_eq!(exception.kind, "DivideByZero"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn catch_recovers_from_a_thrown_exception() {
        let mut symbols = SymbolTable::new();
        let div = symbols.get_symbol("/");
        let e = symbols.get_symbol("e");
        let expr = Expr::Catch {
            body: Box::new(Expr::Call {
                func: Box::new(Expr::Var(div)),
                args: vec![Expr::Literal(V::Int32(1)), Expr::Literal(V::Int32(0))],
            }),
            param: e,
            handler: Box::new(Expr::Literal(V::Int32(7))),
        };
        match run_program(symbols, &expr) {
            EvalResult::Ok { value: V::Int32(n) } => assert_eq!(n, 7),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn deep_tail_recursion_does_not_grow_the_frame_stack() {
        // countdown = fn |n| if n <= 0 then n else countdown(n - 1)
        // Bound via $set into the global closure so the recursive call
        // resolves through `LdX`/`Call` rather than a self-reference the
        // parser/compiler don't support inside `Expr::Fn` directly.
        let mut symbols = SymbolTable::new();
        let countdown = symbols.get_symbol("countdown");
        let n = symbols.get_symbol("n");
        let le = symbols.get_symbol("<=");
        let minus = symbols.get_symbol("-");
        let body = Expr::If {
            cond: Box::new(Expr::Call { func: Box::new(Expr::Var(le)), args: vec![Expr::Var(n), Expr::Literal(V::Int32(0))] }),
            then_branch: Box::new(Expr::Var(n)),
            else_branch: Some(Box::new(Expr::Call {
                func: Box::new(Expr::Var(countdown)),
                args: vec![Expr::Call { func: Box::new(Expr::Var(minus)), args: vec![Expr::Var(n), Expr::Literal(V::Int32(1))] }],
            })),
        };
        let def = Expr::Set {
            target: Box::new(Expr::Var(countdown)),
            value: Box::new(Expr::Fn { params: vec![Param { name: n, type_expr: None, default: None, rest: false }], body: Box::new(body) }),
        };
        let call = Expr::Call { func: Box::new(Expr::Var(countdown)), args: vec![Expr::Literal(V::Int32(1_000_000))] };
        let expr = Expr::Progn(vec![def, call]);
        match run_program(symbols, &expr) {
            EvalResult::Ok { value: V::Int32(n) } => assert_eq!(n, 0),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    /// `each(list, fn)` (design note §4.5 "state-machine external functions"):
    /// builds a quoted list `(1 2 3 4)` and a callback that accumulates each
    /// element into a module-global `total`, the way `countdown` above
    /// recurses through a module-global self-reference rather than a local
    /// closure slot.
    #[test]
    fn each_calls_the_function_once_per_element_in_order() {
        let mut symbols = SymbolTable::new();
        let total = symbols.get_symbol("total");
        let plus = symbols.get_symbol("+");
        let x = symbols.get_symbol("x");
        let each = symbols.get_symbol("each");

        let list_expr = Expr::Quote(Box::new(Expr::Call {
            func: Box::new(Expr::Literal(V::Int32(1))),
            args: vec![Expr::Literal(V::Int32(2)), Expr::Literal(V::Int32(3)), Expr::Literal(V::Int32(4))],
        }));
        let accumulate = Expr::Fn {
            params: vec![Param { name: x, type_expr: None, default: None, rest: false }],
            body: Box::new(Expr::Set {
                target: Box::new(Expr::Var(total)),
                value: Box::new(Expr::Call { func: Box::new(Expr::Var(plus)), args: vec![Expr::Var(total), Expr::Var(x)] }),
            }),
        };
        let init = Expr::Set { target: Box::new(Expr::Var(total)), value: Box::new(Expr::Literal(V::Int32(0))) };
        let run_each = Expr::Call { func: Box::new(Expr::Var(each)), args: vec![list_expr, accumulate] };
        let expr = Expr::Progn(vec![init, run_each, Expr::Var(total)]);

        match run_program(symbols, &expr) {
            EvalResult::Ok { value: V::Int64(n) } => assert_eq!(n, 10),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn each_over_an_empty_list_never_invokes_the_function() {
        let mut symbols = SymbolTable::new();
        let each = symbols.get_symbol("each");
        let throw = symbols.get_symbol("throw");
        let x = symbols.get_symbol("x");

        let explode = Expr::Fn {
            params: vec![Param { name: x, type_expr: None, default: None, rest: false }],
            body: Box::new(Expr::Call { func: Box::new(Expr::Var(throw)), args: vec![Expr::Var(x)] }),
        };
        let expr = Expr::Call { func: Box::new(Expr::Var(each)), args: vec![Expr::Literal(V::Null), explode] };

        match run_program(symbols, &expr) {
            EvalResult::Ok { value: V::Null } => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    /// A longer list than any reasonable host call-stack depth, to confirm
    /// iteration is driven by the evaluator's own frame `Vec` (`run_until`'s
    /// loop) rather than by Rust-level recursion per element.
    #[test]
    fn each_handles_many_elements_without_recursing_the_host_stack() {
        let mut symbols = SymbolTable::new();
        let total = symbols.get_symbol("total");
        let plus = symbols.get_symbol("+");
        let x = symbols.get_symbol("x");
        let each = symbols.get_symbol("each");

        let count: i32 = 50_000;
        let mut elements: Vec<Expr> = (1..=count).map(|n| Expr::Literal(V::Int32(n))).collect();
        let func = elements.remove(0);
        let list_expr = Expr::Quote(Box::new(Expr::Call { func: Box::new(func), args: elements }));
        let accumulate = Expr::Fn {
            params: vec![Param { name: x, type_expr: None, default: None, rest: false }],
            body: Box::new(Expr::Set {
                target: Box::new(Expr::Var(total)),
                value: Box::new(Expr::Call { func: Box::new(Expr::Var(plus)), args: vec![Expr::Var(total), Expr::Var(x)] }),
            }),
        };
        let init = Expr::Set { target: Box::new(Expr::Var(total)), value: Box::new(Expr::Literal(V::Int32(0))) };
        let run_each = Expr::Call { func: Box::new(Expr::Var(each)), args: vec![list_expr, accumulate] };
        let expr = Expr::Progn(vec![init, run_each, Expr::Var(total)]);

        let expected = i64::from(count) * (i64::from(count) + 1) / 2;
        match run_program(symbols, &expr) {
            EvalResult::Ok { value: V::Int64(n) } => assert_eq!(n, expected),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
