//! Parsed expression tree (design note §4.3 "Output shape").
//!
//! The C original represents all of this as actual `List`/`Pair` runtime
//! objects walking through the same heap the evaluator uses, so quoting
//! (`$quote`) is "free" — a quoted form is just the AST subtree. Here the
//! compiler consumes a dedicated `Expr` enum instead (clearer pattern
//! matching, no heap round-trip for every AST node), and `$quote` converts
//! its operand into heap `List`/`Pair` values explicitly (see
//! `compiler::compile_quote`) rather than sharing representations.

use crate::intern::Symbol;
use crate::value::Value;

#[derive(Debug, Clone)]
pub enum Expr {
    /// A literal unboxed or simple heap value (numbers, strings, chars, booleans, null).
    Literal(Value),
    StringLiteral(String),
    /// A bare variable reference.
    Var(Symbol),
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
    },
    /// `(obj . symbol)` property access.
    PropertyAccess {
        obj: Box<Expr>,
        property: Symbol,
    },
    /// `[(obj . method) arg ...]` method call.
    MethodCall {
        obj: Box<Expr>,
        method: Symbol,
        args: Vec<Expr>,
    },
    If {
        cond: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Option<Box<Expr>>,
    },
    /// `$while`: up to three of {pre-condition, post-condition} combined with
    /// a body, per design note §4.4's "pre-body/cond/post-body, all three
    /// combinations".
    While {
        pre_cond: Option<Box<Expr>>,
        body: Box<Expr>,
        post_cond: Option<Box<Expr>>,
    },
    Till {
        flags: Vec<Symbol>,
        body: Box<Expr>,
        when_clauses: Vec<(Symbol, Expr)>,
    },
    Set {
        target: Box<Expr>,
        value: Box<Expr>,
    },
    OpSet {
        op: Symbol,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Fn {
        params: Vec<Param>,
        body: Box<Expr>,
    },
    Scope {
        vars: Vec<Symbol>,
        body: Vec<Expr>,
    },
    Progn(Vec<Expr>),
    Prog1(Vec<Expr>),
    Return(Option<Box<Expr>>),
    /// `try { body } catch |param| handler`.
    Catch {
        body: Box<Expr>,
        param: Symbol,
        handler: Box<Expr>,
    },
    Quote(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    New {
        base: Box<Expr>,
        members: Vec<(Symbol, Expr)>,
    },
    Is {
        value: Box<Expr>,
        type_expr: Box<Expr>,
    },
    TypeOf(Box<Expr>),
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: Symbol,
    pub type_expr: Option<Box<Expr>>,
    pub default: Option<Box<Expr>>,
    pub rest: bool,
}

/// A compiled user function (design note §3 `UserFunctionInfo`): the parsed
/// argument descriptors and body alongside the segment the compiler
/// produced from them. Lives in `CompiledTables::functions`, referenced by
/// index from `Opcode::NewFn`.
#[derive(Debug, Clone)]
pub struct UserFunctionInfo {
    pub name: Option<Symbol>,
    pub params: Vec<Param>,
    pub return_type: Option<Box<Expr>>,
    pub body: Box<Expr>,
    pub segment: crate::bytecode::ByteCodeSegment,
    pub closure_info: std::rc::Rc<crate::bytecode::ClosureInfo>,
    /// Till-ids declared directly inside this function body (not inside a
    /// nested `Fn`), so the evaluator can recognize a `TillEsc` unwinding
    /// from a call it made as one of its own escape points.
    pub declared_till_ids: Vec<u32>,
    /// Landing addresses, within this function's own `segment`, for each
    /// till-flag this function directly declares. A nested closure's
    /// `TillEsc` carries a `(depth, till_id, flag)` triple (see
    /// `bytecode::Operand::TillEscape`); the evaluator walks `depth`
    /// closure-parent hops to find the owning frame, then looks up the
    /// landing `pc` here.
    pub till_exits: Vec<TillExit>,
}

/// One resolved `till`-flag landing point (see `UserFunctionInfo::till_exits`).
#[derive(Debug, Clone, Copy)]
pub struct TillExit {
    pub till_id: u32,
    pub flag: Symbol,
    pub pc: u32,
}
