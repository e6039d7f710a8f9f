//! Compiler: parsed `Expr` + compile-time scope → `ByteCodeSegment` plus
//! constant tables (design note §4.4).
//!
//! Grounded on `original_source/.../eval/compiler/{compile_expr.c,
//! compile_variable.c, compile_while.c}` for the per-node-kind compilation
//! rules, and on `ouros`'s `bytecode::builder::CodeBuilder` for the
//! emit-then-linearize shape (here split into `compiler::ir::CompiledBlock`
//! + `compiler::ir::linearize`, design note's own "Intermediate → bytecode"
//! split rather than `ouros`'s single-pass byte encoder, since design note
//! explicitly calls for two distinct representations).

pub mod ir;

use ahash::AHashMap;

use crate::bytecode::{ClosureInfo, CompiledTables, Opcode};
use crate::intern::{Symbol, SymbolTable};
use crate::parser::ast::{Expr, Param, TillExit, UserFunctionInfo};
use ir::{CompiledBlock, IrOperand, linearize};

/// Compile-time flags threaded downward through every compile step
/// (design note §4.4 "Compile flags").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileFlags {
    pub no_result: bool,
    pub tail_position: bool,
}

impl CompileFlags {
    #[must_use]
    pub const fn require_result() -> Self {
        Self { no_result: false, tail_position: false }
    }

    #[must_use]
    pub const fn no_result() -> Self {
        Self { no_result: true, tail_position: false }
    }

    #[must_use]
    pub const fn with_tail(self, tail: bool) -> Self {
        Self { tail_position: tail, ..self }
    }

    #[must_use]
    pub const fn with_result_required(self, required: bool) -> Self {
        Self { no_result: !required, ..self }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    Argument(u16),
    Local(u16),
    TillFlag { label: u32, depth_marker: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Function,
    Block,
}

#[derive(Debug, Default)]
struct CompileFrame {
    kind: Option<FrameKind>,
    bindings: AHashMap<Symbol, Binding>,
}

/// Per-function bookkeeping: how many argument/local slots have been
/// allocated, the current/maximum operand-stack depth, and debug names.
#[derive(Debug)]
struct FunctionState {
    num_args: u16,
    num_locals: u16,
    variable_names: Vec<Symbol>,
    current_temp: i32,
    max_temp: u16,
    /// Till-ids directly declared by a `till` lexically inside this function
    /// body (not inside a nested `Fn`). Carried onto the resulting
    /// `UserFunctionInfo` so the evaluator can recognize, when a `TillEsc`
    /// bubbles up from a call it made, whether it is the frame that owns the
    /// escaping flag (design note §4.4 "till-flag").
    declared_till_ids: Vec<u32>,
    /// `(till_id, flag, label_id)` for every till-flag this function
    /// directly declares, resolved to addresses once this function's own
    /// block is linearized (see `UserFunctionInfo::till_exits`).
    till_exit_labels: Vec<(u32, Symbol, u32)>,
}

impl FunctionState {
    fn new() -> Self {
        Self {
            num_args: 0,
            num_locals: 0,
            variable_names: Vec::new(),
            current_temp: 0,
            max_temp: 0,
            declared_till_ids: Vec::new(),
            till_exit_labels: Vec::new(),
        }
    }

    fn note_stack_delta(&mut self, delta: i32) {
        self.current_temp += delta;
        if self.current_temp > i32::from(self.max_temp) {
            self.max_temp = u16::try_from(self.current_temp).unwrap_or(u16::MAX);
        }
    }
}

/// Resolves a function's declared till-flag labels to addresses within its
/// own just-linearized segment (see `UserFunctionInfo::till_exits`).
fn resolve_till_exits(labels: &[(u32, Symbol, u32)], addresses: &AHashMap<u32, u32>) -> Vec<TillExit> {
    labels
        .iter()
        .map(|(till_id, flag, label)| TillExit {
            till_id: *till_id,
            flag: *flag,
            pc: *addresses.get(label).expect("till exit label resolved during linearization"),
        })
        .collect()
}

/// Lowers parsed expressions into bytecode (design note §4.4).
pub struct Compiler<'a> {
    symbols: &'a mut SymbolTable,
    tables: CompiledTables,
    frames: Vec<CompileFrame>,
    functions: Vec<FunctionState>,
    next_label: u32,
    next_till_id: u32,
}

impl<'a> Compiler<'a> {
    #[must_use]
    pub fn new(symbols: &'a mut SymbolTable) -> Self {
        let mut compiler = Self {
            symbols,
            tables: CompiledTables::new(),
            frames: Vec::new(),
            functions: vec![FunctionState::new()],
            next_label: 0,
            next_till_id: 0,
        };
        compiler.frames.push(CompileFrame {
            kind: Some(FrameKind::Function),
            bindings: AHashMap::new(),
        });
        compiler
    }

    fn fresh_label(&mut self) -> u32 {
        let id = self.next_label;
        self.next_label += 1;
        id
    }

    fn current_fn(&mut self) -> &mut FunctionState {
        self.functions.last_mut().expect("compiler always has a current function")
    }

    /// Compiles a top-level program (design note §4 "Compiler" inputs: a parsed
    /// expression and a starting global `ClosureInfo`) into a
    /// `UserFunctionInfo` registered in the returned `CompiledTables`
    /// (alongside every nested `Fn` the body declared), plus that entry
    /// function's index. Nested closures are registered into
    /// `self.tables.functions` as they're compiled (see `compile_fn`), so the
    /// tables must be returned together with the entry — returning the bare
    /// `UserFunctionInfo` alone, as an earlier version of this function did,
    /// silently dropped every nested function it had compiled.
    #[must_use]
    pub fn compile_program(mut self, expr: &Expr) -> (u32, CompiledTables) {
        let mut block = CompiledBlock::new();
        block.push(Opcode::Args, IrOperand::Index(0), 0);
        block.append(self.compile(expr, CompileFlags::require_result().with_tail(true)));
        block.push(Opcode::Ret, IrOperand::None, -1);
        let (segment, till_addrs) = linearize(&block);
        let state = self.functions.pop().expect("top-level function state");
        let till_exits = resolve_till_exits(&state.till_exit_labels, &till_addrs);
        let info = UserFunctionInfo {
            name: None,
            params: Vec::new(),
            return_type: None,
            body: Box::new(expr.clone()),
            segment,
            closure_info: std::rc::Rc::new(ClosureInfo::local(0, state.num_locals, state.max_temp, state.variable_names)),
            declared_till_ids: state.declared_till_ids,
            till_exits,
        };
        let index = self.tables.add_function(info);
        (index, self.tables)
    }

    fn declare(&mut self, symbol: Symbol, binding: Binding) {
        self.frames.last_mut().expect("scope stack never empty").bindings.insert(symbol, binding);
    }

    /// Walks the frame stack innermost-out. Returns the binding and how many
    /// function boundaries were crossed (0 = same function).
    fn resolve(&self, symbol: Symbol) -> Option<(Binding, u32)> {
        let mut depth = 0;
        for frame in self.frames.iter().rev() {
            if let Some(binding) = frame.bindings.get(&symbol) {
                return Some((*binding, depth));
            }
            if frame.kind == Some(FrameKind::Function) {
                depth += 1;
            }
        }
        None
    }

    fn push_block(&mut self) {
        self.frames.push(CompileFrame {
            kind: Some(FrameKind::Block),
            bindings: AHashMap::new(),
        });
    }

    fn pop_frame(&mut self) {
        self.frames.pop();
    }

    fn compile(&mut self, expr: &Expr, flags: CompileFlags) -> CompiledBlock {
        match expr {
            Expr::Literal(value) => self.compile_literal(value, flags),
            Expr::StringLiteral(s) => self.compile_string(s, flags),
            Expr::Var(sym) => self.compile_var(*sym, flags),
            Expr::Call { func, args } => self.compile_call(func, args, flags),
            Expr::PropertyAccess { obj, property } => self.compile_property_access(obj, *property, flags),
            Expr::MethodCall { obj, method, args } => self.compile_method_call(obj, *method, args, flags),
            Expr::If { cond, then_branch, else_branch } => self.compile_if(cond, then_branch, else_branch.as_deref(), flags),
            Expr::While { pre_cond, body, post_cond } => self.compile_while(pre_cond.as_deref(), body, post_cond.as_deref(), flags),
            Expr::Till { flags: till_flags, body, when_clauses } => self.compile_till(till_flags, body, when_clauses, flags),
            Expr::Set { target, value } => self.compile_set(target, value, flags),
            Expr::OpSet { op, target, value } => self.compile_opset(*op, target, value, flags),
            Expr::Fn { params, body } => self.compile_fn(params, body, flags),
            Expr::Scope { vars, body } => self.compile_scope(vars, body, flags),
            Expr::Progn(exprs) => self.compile_progn(exprs, flags),
            Expr::Prog1(exprs) => self.compile_prog1(exprs, flags),
            Expr::Return(value) => self.compile_return(value.as_deref()),
            Expr::Catch { body, param, handler } => self.compile_catch(body, *param, handler, flags),
            Expr::Quote(inner) => self.compile_quote(inner, flags),
            Expr::And(exprs) => self.compile_and_or(exprs, true, flags),
            Expr::Or(exprs) => self.compile_and_or(exprs, false, flags),
            Expr::Not(inner) => self.compile_not(inner, flags),
            Expr::New { base, members } => self.compile_new(base, members, flags),
            Expr::Is { value, type_expr } => self.compile_binary_op(value, type_expr, Opcode::Is, flags),
            Expr::TypeOf(inner) => self.compile_unary_op(inner, Opcode::TypeOf, flags),
        }
    }

    fn maybe_drop_result(&mut self, mut block: CompiledBlock, flags: CompileFlags) -> CompiledBlock {
        if flags.no_result && block.final_stack_delta > 0 {
            self.current_fn().note_stack_delta(-1);
            block.push(Opcode::Pop1, IrOperand::None, -1);
        }
        block
    }

    fn compile_literal(&mut self, value: &crate::value::Value, flags: CompileFlags) -> CompiledBlock {
        let mut block = CompiledBlock::new();
        if flags.no_result {
            return block;
        }
        self.current_fn().note_stack_delta(1);
        let op = match value {
            crate::value::Value::Null => (Opcode::LdNull, IrOperand::None),
            crate::value::Value::Bool(b) => (Opcode::LdBool(*b), IrOperand::Bool(*b)),
            crate::value::Value::Byte(b) => (Opcode::Ld8, IrOperand::Byte(*b)),
            crate::value::Value::Int16(v) => (Opcode::Ld16, IrOperand::Int16(*v)),
            crate::value::Value::Int32(v) => (Opcode::Ld32, IrOperand::Int32(*v)),
            crate::value::Value::Int64(v) => (Opcode::Ld64, IrOperand::Int64(*v)),
            crate::value::Value::Float64(v) => (Opcode::LdF64, IrOperand::Float64(*v)),
            crate::value::Value::Float32(v) => (Opcode::LdF64, IrOperand::Float64(f64::from(*v))),
            crate::value::Value::Real64(v) => (Opcode::LdR64, IrOperand::Real64Bits(v.to_bits())),
            crate::value::Value::Real32(v) => (Opcode::LdR64, IrOperand::Real64Bits(f64::from(*v).to_bits())),
            crate::value::Value::Char(c) => (Opcode::LdChar, IrOperand::Byte(*c)),
            crate::value::Value::Uni(c) => (Opcode::LdUni, IrOperand::Int32(*c as i32)),
            crate::value::Value::Symbol(s) => (Opcode::LdSym, IrOperand::Symbol(*s)),
            crate::value::Value::Ref(_) => {
                let index = self.tables.add_object(*value);
                (Opcode::LdObj, IrOperand::Index(index))
            }
        };
        block.push(op.0, op.1, 1);
        block
    }

    fn compile_string(&mut self, s: &str, flags: CompileFlags) -> CompiledBlock {
        let mut block = CompiledBlock::new();
        if flags.no_result {
            return block;
        }
        let index = self.tables.add_string(s.to_owned());
        self.current_fn().note_stack_delta(1);
        block.push(Opcode::LdStr, IrOperand::Index(index), 1);
        block
    }

    fn compile_var(&mut self, symbol: Symbol, flags: CompileFlags) -> CompiledBlock {
        let mut block = CompiledBlock::new();
        match self.resolve(symbol) {
            Some((Binding::Argument(index), depth)) => {
                if flags.no_result {
                    return block;
                }
                self.current_fn().note_stack_delta(1);
                if depth <= 7 {
                    block.push(Opcode::LdArgFast(u8::try_from(depth).unwrap()), IrOperand::Index(u32::from(index)), 1);
                } else {
                    block.push(Opcode::LdArg, IrOperand::Pair(i32::try_from(depth).unwrap(), i32::from(index)), 1);
                }
            }
            Some((Binding::Local(index), depth)) => {
                if flags.no_result {
                    return block;
                }
                self.current_fn().note_stack_delta(1);
                if depth <= 7 {
                    block.push(Opcode::LdLocFast(u8::try_from(depth).unwrap()), IrOperand::Index(u32::from(index)), 1);
                } else {
                    block.push(Opcode::LdLoc, IrOperand::Pair(i32::try_from(depth).unwrap(), i32::from(index)), 1);
                }
            }
            Some((Binding::TillFlag { label, depth_marker }, depth)) => {
                // Flagged exit: jump directly within the same function, or
                // escape through a continuation captured from a nested one
                // (design note §4.4 "till-flag"). The cross-function case can't
                // be a relative branch — the landing point is in an
                // ancestor's segment — so it carries the hop count plus
                // enough identity (till-id, flag) for the evaluator to look
                // the landing address up in that ancestor's `till_exits`.
                if depth == 0 {
                    block.jump(Opcode::Jmp, label, 0);
                } else {
                    block.push(Opcode::TillEsc, IrOperand::TillEscape { depth, till_id: depth_marker, flag: symbol }, 0);
                }
            }
            None => {
                if symbol == self.symbols.get_symbol("true") {
                    return self.compile_literal(&crate::value::Value::Bool(true), flags);
                }
                if symbol == self.symbols.get_symbol("false") {
                    return self.compile_literal(&crate::value::Value::Bool(false), flags);
                }
                if symbol == self.symbols.get_symbol("null") {
                    return self.compile_literal(&crate::value::Value::Null, flags);
                }
                if flags.no_result {
                    return block;
                }
                self.current_fn().note_stack_delta(1);
                block.push(Opcode::LdX, IrOperand::Symbol(symbol), 1);
            }
        }
        block
    }

    fn compile_assign_target(&mut self, symbol: Symbol, pop_after: bool) -> CompiledBlock {
        let mut block = CompiledBlock::new();
        match self.resolve(symbol) {
            Some((Binding::Argument(index), depth)) => {
                let opcode = if pop_after { Opcode::StpArg } else { Opcode::StArg };
                if depth <= 7 && pop_after {
                    block.push(Opcode::StArgFast(u8::try_from(depth).unwrap()), IrOperand::Index(u32::from(index)), -1);
                } else {
                    let delta = i32::from(!pop_after);
                    block.push(opcode, IrOperand::Pair(i32::try_from(depth).unwrap(), i32::from(index)), delta - 1);
                }
            }
            Some((Binding::Local(index), depth)) => {
                let opcode = if pop_after { Opcode::StpLoc } else { Opcode::StLoc };
                if depth <= 7 && pop_after {
                    block.push(Opcode::StLocFast(u8::try_from(depth).unwrap()), IrOperand::Index(u32::from(index)), -1);
                } else {
                    let delta = i32::from(!pop_after);
                    block.push(opcode, IrOperand::Pair(i32::try_from(depth).unwrap(), i32::from(index)), delta - 1);
                }
            }
            Some((Binding::TillFlag { .. }, _)) => {
                // Till flags aren't assignable; fall through as a global
                // store so a misuse surfaces as an evaluator-time error
                // rather than a silent no-op.
                let opcode = if pop_after { Opcode::StpX } else { Opcode::StX };
                block.push(opcode, IrOperand::Symbol(symbol), i32::from(!pop_after) - 1);
            }
            None => {
                let opcode = if pop_after { Opcode::StpX } else { Opcode::StX };
                block.push(opcode, IrOperand::Symbol(symbol), i32::from(!pop_after) - 1);
            }
        }
        self.current_fn().note_stack_delta(-1);
        if !pop_after {
            self.current_fn().note_stack_delta(1);
        }
        block
    }

    fn compile_set(&mut self, target: &Expr, value: &Expr, flags: CompileFlags) -> CompiledBlock {
        let mut block = self.compile(value, CompileFlags::require_result());
        match target {
            Expr::Var(sym) => block.append(self.compile_assign_target(*sym, flags.no_result)),
            Expr::PropertyAccess { obj, property } => {
                block.append(self.compile(obj, CompileFlags::require_result()));
                self.current_fn().note_stack_delta(1);
                block.push(Opcode::StProp, IrOperand::Symbol(*property), -1);
                if flags.no_result {
                    self.current_fn().note_stack_delta(-1);
                    block.push(Opcode::Pop1, IrOperand::None, -1);
                }
            }
            _ => {
                // Best-effort: anything else resolves at runtime via the
                // generic member-store path.
                block.append(self.compile(target, CompileFlags::require_result()));
                self.current_fn().note_stack_delta(1);
                block.push(Opcode::StMember, IrOperand::None, -1);
                if flags.no_result {
                    self.current_fn().note_stack_delta(-1);
                    block.push(Opcode::Pop1, IrOperand::None, -1);
                }
            }
        }
        block
    }

    fn compile_opset(&mut self, op: Symbol, target: &Expr, value: &Expr, flags: CompileFlags) -> CompiledBlock {
        // `x += y` desugars to `x = x + y` (design note names `$opset` as a
        // special form but leaves its exact lowering to the implementation).
        let combined = Expr::Call {
            func: Box::new(Expr::Var(op)),
            args: vec![target.clone(), value.clone()],
        };
        self.compile_set(target, &combined, flags)
    }

    fn compile_call(&mut self, func: &Expr, args: &[Expr], flags: CompileFlags) -> CompiledBlock {
        if let Expr::Var(sym) = func
            && matches!(self.resolve(*sym), Some((Binding::TillFlag { .. }, _)))
        {
            // Invoking a till-flag escapes with the call's single argument
            // (or `null` if bare) as the till's result (design note §4.4
            // "till-flag"); the flag reference itself never leaves a value,
            // so the escaped value must be pushed before the jump.
            let mut block = match args.first() {
                Some(arg) => self.compile(arg, CompileFlags::require_result()),
                None => self.compile_literal(&crate::value::Value::Null, CompileFlags::require_result()),
            };
            block.append(self.compile(func, CompileFlags::require_result()));
            return block;
        }

        if let Expr::PropertyAccess { obj, property } = func {
            // Property-call syntax (`obj.Name args`) always dispatches
            // through `Met`. Spec.md §9's Open Question about giving bare
            // uppercase-first-letter identifiers special static-type
            // treatment is resolved here as: no special treatment —
            // `compile_var` always emits an ordinary `LdX` for an unresolved
            // bare name regardless of case, and `Is`/`TypeOf` consumers pass
            // type names as plain symbol values (see DESIGN.md).
            let mut block = self.compile(obj, CompileFlags::require_result());
            for arg in args {
                block.append(self.compile(arg, CompileFlags::require_result()));
            }
            let n = i32::try_from(args.len()).unwrap();
            self.current_fn().note_stack_delta(-(n + 1) + 1);
            block.push(Opcode::Met, IrOperand::Pair(i32::from(property.raw()), n), 0);
            return self.maybe_drop_result(block, flags);
        }

        let mut block = self.compile(func, CompileFlags::require_result());
        for arg in args {
            block.append(self.compile(arg, CompileFlags::require_result()));
        }
        let n = args.len();
        let opcode = if flags.tail_position { Opcode::CallTail } else { self.call_opcode_for(n) };
        self.current_fn().note_stack_delta(-(i32::try_from(n).unwrap() + 1) + 1);
        match opcode {
            Opcode::Call0 | Opcode::Call1 | Opcode::Call2 | Opcode::Call3 | Opcode::Call4 | Opcode::Call5 | Opcode::Call6 | Opcode::Call7 => {
                block.push(opcode, IrOperand::None, 0);
            }
            _ => block.push(opcode, IrOperand::Index(u32::try_from(n).unwrap()), 0),
        }
        self.maybe_drop_result(block, flags)
    }

    fn call_opcode_for(&self, n: usize) -> Opcode {
        match n {
            0 => Opcode::Call0,
            1 => Opcode::Call1,
            2 => Opcode::Call2,
            3 => Opcode::Call3,
            4 => Opcode::Call4,
            5 => Opcode::Call5,
            6 => Opcode::Call6,
            7 => Opcode::Call7,
            _ => Opcode::Call,
        }
    }

    fn compile_property_access(&mut self, obj: &Expr, property: Symbol, flags: CompileFlags) -> CompiledBlock {
        if flags.no_result {
            return self.compile(obj, CompileFlags::no_result());
        }
        let mut block = self.compile(obj, CompileFlags::require_result());
        block.push(Opcode::LdProp, IrOperand::Symbol(property), 0);
        block
    }

    fn compile_method_call(&mut self, obj: &Expr, method: Symbol, args: &[Expr], flags: CompileFlags) -> CompiledBlock {
        let mut block = self.compile(obj, CompileFlags::require_result());
        for arg in args {
            block.append(self.compile(arg, CompileFlags::require_result()));
        }
        let n = i32::try_from(args.len()).unwrap();
        self.current_fn().note_stack_delta(-(n + 1) + 1);
        block.push(Opcode::Met, IrOperand::Pair(i32::from(method.raw()), n), 0);
        self.maybe_drop_result(block, flags)
    }

    fn compile_if(&mut self, cond: &Expr, then_branch: &Expr, else_branch: Option<&Expr>, flags: CompileFlags) -> CompiledBlock {
        let else_label = self.fresh_label();
        let end_label = self.fresh_label();
        let mut block = self.compile(cond, CompileFlags::require_result());
        self.current_fn().note_stack_delta(-1);
        block.jump(Opcode::Bf, else_label, -1);
        block.append(self.compile(then_branch, flags.with_tail(flags.tail_position)));
        block.jump(Opcode::Jmp, end_label, 0);
        block.label(else_label);
        match else_branch {
            Some(e) => block.append(self.compile(e, flags.with_tail(flags.tail_position))),
            None => block.append(self.compile_literal(&crate::value::Value::Null, flags)),
        }
        block.label(end_label);
        block
    }

    fn compile_while(&mut self, pre_cond: Option<&Expr>, body: &Expr, post_cond: Option<&Expr>, flags: CompileFlags) -> CompiledBlock {
        let start = self.fresh_label();
        let end = self.fresh_label();
        let mut block = CompiledBlock::new();
        if !flags.no_result {
            self.current_fn().note_stack_delta(1);
            block.push(Opcode::LdNull, IrOperand::None, 1);
        }
        block.label(start);
        if let Some(pre) = pre_cond {
            block.append(self.compile(pre, CompileFlags::require_result()));
            self.current_fn().note_stack_delta(-1);
            block.jump(Opcode::Bf, end, -1);
        }
        if !flags.no_result {
            self.current_fn().note_stack_delta(-1);
            block.push(Opcode::Pop1, IrOperand::None, -1);
        }
        block.append(self.compile(body, flags.with_result_required(!flags.no_result).with_tail(false)));
        if let Some(post) = post_cond {
            block.append(self.compile(post, CompileFlags::require_result()));
            self.current_fn().note_stack_delta(-1);
            block.jump(Opcode::Bt, start, -1);
        } else {
            block.jump(Opcode::Jmp, start, 0);
        }
        block.label(end);
        block
    }

    fn compile_till(&mut self, flag_symbols: &[Symbol], body: &Expr, when_clauses: &[(Symbol, Expr)], flags: CompileFlags) -> CompiledBlock {
        let till_id = self.next_till_id;
        self.next_till_id += 1;
        self.current_fn().declared_till_ids.push(till_id);
        let loop_start = self.fresh_label();
        let end_label = self.fresh_label();

        self.push_block();
        let mut flag_labels = AHashMap::new();
        for sym in flag_symbols {
            let label = self.fresh_label();
            flag_labels.insert(*sym, label);
            self.declare(*sym, Binding::TillFlag { label, depth_marker: till_id });
            self.current_fn().till_exit_labels.push((till_id, *sym, label));
        }

        let mut block = CompiledBlock::new();
        if !flags.no_result {
            self.current_fn().note_stack_delta(1);
            block.push(Opcode::LdNull, IrOperand::None, 1);
        }
        block.label(loop_start);
        if !flags.no_result {
            self.current_fn().note_stack_delta(-1);
            block.push(Opcode::Pop1, IrOperand::None, -1);
        }
        block.append(self.compile(body, CompileFlags::no_result()));
        block.jump(Opcode::Jmp, loop_start, 0);

        // Every flag invocation (see `compile_call`'s till-flag branch) pushes
        // the escaped value before jumping here, regardless of whether this
        // flag has a `when` clause. `Expr::Till::when_clauses` carries no
        // parameter binder for that value (just a flag symbol and a body
        // expression), so a clause runs purely for effect — the escaped
        // value itself remains the till's result — and is popped instead
        // only when the till's own result isn't wanted.
        for (flag, label) in &flag_labels {
            block.label(*label);
            if let Some((_, clause)) = when_clauses.iter().find(|(f, _)| f == flag) {
                block.append(self.compile(clause, CompileFlags::no_result()));
            }
            if flags.no_result {
                self.current_fn().note_stack_delta(-1);
                block.push(Opcode::Pop1, IrOperand::None, -1);
            }
            block.jump(Opcode::Jmp, end_label, 0);
        }
        block.label(end_label);
        self.pop_frame();
        block
    }

    fn compile_fn(&mut self, params: &[Param], body: &Expr, flags: CompileFlags) -> CompiledBlock {
        self.frames.push(CompileFrame {
            kind: Some(FrameKind::Function),
            bindings: AHashMap::new(),
        });
        self.functions.push(FunctionState::new());

        for (i, param) in params.iter().enumerate() {
            let index = u16::try_from(i).expect("too many parameters");
            self.declare(param.name, Binding::Argument(index));
            self.current_fn().num_args += 1;
            self.current_fn().variable_names.push(param.name);
        }

        let mut fn_block = CompiledBlock::new();
        let min_args = params.iter().take_while(|p| p.default.is_none() && !p.rest).count();
        fn_block.push(Opcode::Args, IrOperand::Index(u32::try_from(min_args).unwrap()), 0);
        fn_block.append(self.compile(body, CompileFlags::require_result().with_tail(true)));
        fn_block.push(Opcode::Ret, IrOperand::None, -1);
        let (segment, till_addrs) = linearize(&fn_block);

        let state = self.functions.pop().expect("pushed function state");
        self.pop_frame();
        let till_exits = resolve_till_exits(&state.till_exit_labels, &till_addrs);

        let info = UserFunctionInfo {
            name: None,
            params: params.to_vec(),
            return_type: None,
            body: Box::new(body.clone()),
            segment,
            closure_info: std::rc::Rc::new(ClosureInfo::local(state.num_args, state.num_locals, state.max_temp, state.variable_names)),
            declared_till_ids: state.declared_till_ids,
            till_exits,
        };
        let index = self.tables.add_function(info);

        let mut block = CompiledBlock::new();
        if flags.no_result {
            return block;
        }
        self.current_fn().note_stack_delta(1);
        block.push(Opcode::NewFn, IrOperand::Index(index), 1);
        block
    }

    /// True while compiling a `Scope` node spliced directly into the
    /// program's own top-level body (not inside any `Fn` or nested `{...}`
    /// block). `var`/`const` declared here become the module's exports
    /// (design note §4.4 "Global closure layout precomputation", §4.6).
    fn at_module_top_level(&self) -> bool {
        self.functions.len() == 1 && self.frames.len() == 1
    }

    fn compile_scope(&mut self, vars: &[Symbol], body: &[Expr], flags: CompileFlags) -> CompiledBlock {
        if self.at_module_top_level() {
            // Leave `vars` undeclared in the compile frame: references fall
            // through `resolve`'s `None` arm and compile to `LdX`/`StX`
            // (named global load/store) instead of indexed local slots, so
            // the bindings land in the module's `GlobalClosure` dict where
            // `modules::ModuleInfo::exported_value` can find them after
            // evaluation, rather than vanishing with the entry frame.
            return self.compile_progn(body, flags);
        }
        self.push_block();
        let base = self.current_fn().num_locals;
        for (i, var) in vars.iter().enumerate() {
            let index = base + u16::try_from(i).expect("too many locals");
            self.declare(*var, Binding::Local(index));
            self.current_fn().variable_names.push(*var);
        }
        self.current_fn().num_locals += u16::try_from(vars.len()).unwrap();

        let mut block = CompiledBlock::new();
        if !vars.is_empty() {
            block.push(Opcode::LocalAlloc, IrOperand::Index(u32::try_from(vars.len()).unwrap()), 0);
        }
        block.append(self.compile_progn(body, flags));
        if !vars.is_empty() {
            block.push(Opcode::LocalFree, IrOperand::Index(u32::try_from(vars.len()).unwrap()), 0);
        }
        self.pop_frame();
        block
    }

    fn compile_progn(&mut self, exprs: &[Expr], flags: CompileFlags) -> CompiledBlock {
        let mut block = CompiledBlock::new();
        if exprs.is_empty() {
            return self.compile_literal(&crate::value::Value::Null, flags);
        }
        for (i, e) in exprs.iter().enumerate() {
            let is_last = i + 1 == exprs.len();
            let sub_flags = if is_last { flags } else { CompileFlags::no_result() };
            block.append(self.compile(e, sub_flags));
        }
        block
    }

    fn compile_prog1(&mut self, exprs: &[Expr], flags: CompileFlags) -> CompiledBlock {
        let mut block = CompiledBlock::new();
        if exprs.is_empty() {
            return self.compile_literal(&crate::value::Value::Null, flags);
        }
        block.append(self.compile(&exprs[0], flags.with_result_required(!flags.no_result).with_tail(false)));
        for e in &exprs[1..] {
            block.append(self.compile(e, CompileFlags::no_result()));
        }
        block
    }

    fn compile_return(&mut self, value: Option<&Expr>) -> CompiledBlock {
        let mut block = match value {
            Some(v) => self.compile(v, CompileFlags::require_result()),
            None => self.compile_literal(&crate::value::Value::Null, CompileFlags::require_result()),
        };
        block.push(Opcode::Ret, IrOperand::None, -1);
        self.current_fn().note_stack_delta(-1);
        block
    }

    fn compile_catch(&mut self, body: &Expr, param: Symbol, handler: &Expr, flags: CompileFlags) -> CompiledBlock {
        let handler_label = self.fresh_label();
        let end_label = self.fresh_label();
        let mut block = CompiledBlock::new();
        block.jump(Opcode::Try, handler_label, 0);
        block.append(self.compile(body, flags.with_tail(false)));
        block.push(Opcode::EndTry, IrOperand::None, 0);
        block.jump(Opcode::Jmp, end_label, 0);

        block.label(handler_label);
        self.push_block();
        self.declare(param, Binding::Local(self.current_fn().num_locals));
        self.current_fn().variable_names.push(param);
        self.current_fn().num_locals += 1;
        block.push(Opcode::LocalAlloc, IrOperand::Index(1), 0);
        block.push(Opcode::StpLoc, IrOperand::Pair(0, i32::from(self.current_fn().num_locals - 1)), -1);
        block.append(self.compile(handler, flags.with_tail(false)));
        block.push(Opcode::LocalFree, IrOperand::Index(1), 0);
        self.pop_frame();
        block.label(end_label);
        block
    }

    /// `$quote` emits code that *builds* the quoted form at runtime out of
    /// `LdSym`/`LdStr`/`Cons` rather than fabricating a heap value at compile
    /// time (the compiler has no live heap to allocate into — only the
    /// evaluator does). A quoted call form `[f a b]` becomes the list
    /// `(f . (a . (b . ())))`, built innermost-out.
    fn compile_quote(&mut self, inner: &Expr, flags: CompileFlags) -> CompiledBlock {
        if flags.no_result {
            return CompiledBlock::new();
        }
        self.compile_quoted_form(inner)
    }

    fn compile_quoted_form(&mut self, expr: &Expr) -> CompiledBlock {
        match expr {
            Expr::Literal(value) => self.compile_literal(value, CompileFlags::require_result()),
            Expr::StringLiteral(s) => self.compile_string(s, CompileFlags::require_result()),
            Expr::Var(sym) => {
                let mut block = CompiledBlock::new();
                self.current_fn().note_stack_delta(1);
                block.push(Opcode::LdSym, IrOperand::Symbol(*sym), 1);
                block
            }
            Expr::Call { func, args } => {
                let mut block = CompiledBlock::new();
                self.current_fn().note_stack_delta(1);
                block.push(Opcode::LdNull, IrOperand::None, 1);
                for arg in std::iter::once(func.as_ref()).chain(args.iter()).rev() {
                    block.append(self.compile_quoted_form(arg));
                    self.current_fn().note_stack_delta(-1);
                    block.push(Opcode::Cons, IrOperand::None, -1);
                }
                block
            }
            other => self.compile(other, CompileFlags::require_result()),
        }
    }

    fn compile_and_or(&mut self, exprs: &[Expr], is_and: bool, flags: CompileFlags) -> CompiledBlock {
        if exprs.is_empty() {
            return self.compile_literal(&crate::value::Value::Bool(is_and), flags);
        }
        let end_label = self.fresh_label();
        let mut block = CompiledBlock::new();
        for (i, e) in exprs.iter().enumerate() {
            block.append(self.compile(e, CompileFlags::require_result()));
            if i + 1 < exprs.len() {
                block.push(Opcode::Dup1, IrOperand::None, 1);
                self.current_fn().note_stack_delta(1);
                let branch = if is_and { Opcode::Bf } else { Opcode::Bt };
                block.jump(branch, end_label, -1);
                self.current_fn().note_stack_delta(-1);
                block.push(Opcode::Pop1, IrOperand::None, -1);
                self.current_fn().note_stack_delta(-1);
            }
        }
        block.label(end_label);
        self.maybe_drop_result(block, flags)
    }

    fn compile_not(&mut self, inner: &Expr, flags: CompileFlags) -> CompiledBlock {
        let mut block = self.compile(inner, CompileFlags::require_result());
        block.push(Opcode::Not, IrOperand::None, 0);
        self.maybe_drop_result(block, flags)
    }

    fn compile_unary_op(&mut self, inner: &Expr, opcode: Opcode, flags: CompileFlags) -> CompiledBlock {
        let mut block = self.compile(inner, CompileFlags::require_result());
        block.push(opcode, IrOperand::None, 0);
        self.maybe_drop_result(block, flags)
    }

    fn compile_binary_op(&mut self, lhs: &Expr, rhs: &Expr, opcode: Opcode, flags: CompileFlags) -> CompiledBlock {
        let mut block = self.compile(lhs, CompileFlags::require_result());
        block.append(self.compile(rhs, CompileFlags::require_result()));
        self.current_fn().note_stack_delta(-1);
        block.push(opcode, IrOperand::None, -1);
        self.maybe_drop_result(block, flags)
    }

    fn compile_new(&mut self, base: &Expr, members: &[(Symbol, Expr)], flags: CompileFlags) -> CompiledBlock {
        let mut block = self.compile(base, CompileFlags::require_result());
        for (name, value) in members {
            self.current_fn().note_stack_delta(1);
            block.push(Opcode::LdSym, IrOperand::Symbol(*name), 1);
            block.append(self.compile(value, CompileFlags::require_result()));
        }
        let n = i32::try_from(members.len()).unwrap();
        self.current_fn().note_stack_delta(-(n * 2 + 1) + 1);
        block.push(Opcode::NewObj, IrOperand::Index(u32::try_from(members.len()).unwrap()), 0);
        self.maybe_drop_result(block, flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn compiles_arithmetic_into_a_call_chain() {
        let mut symbols = SymbolTable::new();
        let plus = symbols.get_symbol("+");
        let star = symbols.get_symbol("*");
        // 1 + 2 * 3
        let expr = Expr::Call {
            func: Box::new(Expr::Var(plus)),
            args: vec![
                Expr::Literal(Value::Int32(1)),
                Expr::Call {
                    func: Box::new(Expr::Var(star)),
                    args: vec![Expr::Literal(Value::Int32(2)), Expr::Literal(Value::Int32(3))],
                },
            ],
        };
        let compiler = Compiler::new(&mut symbols);
        let (entry_index, tables) = compiler.compile_program(&expr);
        let info = &tables.functions[entry_index as usize];
        assert!(!info.segment.is_empty());
        assert!(info.segment.instructions.iter().any(|bc| matches!(bc.opcode, Opcode::Call2)));
    }

    #[test]
    fn argument_reference_resolves_to_fast_load() {
        let mut symbols = SymbolTable::new();
        let x = symbols.get_symbol("x");
        let y = symbols.get_symbol("y");
        let plus = symbols.get_symbol("+");
        let expr = Expr::Fn {
            params: vec![
                Param { name: x, type_expr: None, default: None, rest: false },
                Param { name: y, type_expr: None, default: None, rest: false },
            ],
            body: Box::new(Expr::Call {
                func: Box::new(Expr::Var(plus)),
                args: vec![Expr::Var(x), Expr::Var(y)],
            }),
        };
        let mut compiler = Compiler::new(&mut symbols);
        let block = compiler.compile(&expr, CompileFlags::require_result());
        assert!(block.instructions.iter().any(|i| matches!(i.opcode, Opcode::NewFn)));
    }
}
