#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "bytecode operand widths are checked at emission time")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts mirror the reference interpreter's C arithmetic")]
#![expect(clippy::cast_possible_wrap, reason = "wrap behavior mirrors the reference interpreter")]
#![expect(clippy::too_many_lines, reason = "the fetch-decode-dispatch loop and compile() match are naturally large")]

mod bytecode;
mod compiler;
mod error;
mod evaluator;
mod heap;
mod intern;
mod lexer;
mod modules;
mod parser;
mod resource;
mod value;

pub use crate::{
    bytecode::{ByteCode, ByteCodeSegment, ClosureInfo, ClosureKind, CompiledTables, Opcode, Operand},
    compiler::{CompileFlags, Compiler},
    error::{ErrorKind, EvalResult, Exception, ParseMessage, Severity, SmileError, StackFrame},
    evaluator::Evaluator,
    heap::{Heap, HeapId, HeapStats},
    intern::{KNOWN_SYMBOLS, Symbol, SymbolTable},
    lexer::{Lexer, StringSegment, Token, TokenData, TokenKind},
    modules::{ModuleInfo, ModuleRegistry},
    parser::{
        Parser,
        ast::{Expr, Param, TillExit, UserFunctionInfo},
        loanword::{Loanword, LoanwordId, LoanwordTable},
        parse_program,
        scope::{DeclKind, ParseDecl, ParseScopeStack, ScopeKind},
        syntax::{PatternElem, SyntaxClass, SyntaxClassId, SyntaxRule, SyntaxTable},
    },
    resource::{
        DEFAULT_MAX_RECURSION_DEPTH, LimitedTracker, MAX_DATA_RECURSION_DEPTH, NO_LIMIT_TRACKER, NoLimitTracker,
        ResourceError, ResourceLimits, ResourceTracker,
    },
    value::{FunctionValue, HeapObject, LexerPosition, RangeValue, SecurityFlags, Value},
};

/// Parses and evaluates `source` to completion: the single external entry
/// point design note §6's command-line surface describes,
/// `parse_and_eval(source, filename) -> EvalResult`. Returns the result
/// together with the `SymbolTable` used throughout, so a REPL-style caller
/// can feed it back into a follow-up call sharing interned symbols.
///
/// The returned `EvalResult::Ok` value may be a `Value::Ref` pointing into
/// the evaluator's heap, which this function drops — callers that need to
/// inspect a heap-allocated result (a string, a list) should call
/// [`eval_source_with_evaluator`] instead and read the value back through
/// the live `Evaluator`.
pub fn eval_source<T: ResourceTracker>(
    source: &str,
    filename: &str,
    symbols: SymbolTable,
    tracker: T,
) -> (EvalResult, SymbolTable) {
    let (result, evaluator) = eval_source_with_evaluator(source, filename, symbols, tracker);
    match evaluator {
        Some(mut evaluator) => (result, std::mem::replace(evaluator.symbols_mut(), SymbolTable::new())),
        None => (result, SymbolTable::new()),
    }
}

/// Like [`eval_source`], but on a successful parse returns the `Evaluator`
/// that produced `result` instead of discarding it, so the caller can
/// render a heap-allocated result with [`Evaluator::display_value`] or
/// inspect the heap further. Returns `None` for the evaluator when parsing
/// failed before compilation ever ran.
pub fn eval_source_with_evaluator<T: ResourceTracker>(
    source: &str,
    filename: &str,
    mut symbols: SymbolTable,
    tracker: T,
) -> (EvalResult, Option<Evaluator<T>>) {
    let (expr, _exports, messages) = parse_program(source, filename, &mut symbols);
    if messages.iter().any(|m| matches!(m.severity, Severity::Error | Severity::Fatal)) {
        return (EvalResult::ParseErrors(messages), None);
    }

    let compiler = Compiler::new(&mut symbols);
    let (entry, tables) = compiler.compile_program(&expr);
    let mut evaluator = Evaluator::new(tables, symbols, tracker);
    let result = evaluator.eval_entry(entry);
    (result, Some(evaluator))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_source_runs_arithmetic_end_to_end() {
        let (result, _symbols) = eval_source("1 + 2 * 3", "<test>", SymbolTable::new(), NoLimitTracker);
        match result {
            EvalResult::Ok { value: Value::Int64(n) } => assert_eq!(n, 7),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn eval_source_runs_string_interpolation_end_to_end() {
        let (result, mut evaluator) = eval_source_with_evaluator(r#""count: {1 + 2} items""#, "<test>", SymbolTable::new(), NoLimitTracker);
        let evaluator = evaluator.as_mut().expect("parse should have succeeded");
        match result {
            EvalResult::Ok { value } => assert_eq!(evaluator.display_value(value), "count: 3 items"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn eval_source_reports_parse_errors_instead_of_running() {
        let (result, _symbols) = eval_source("[ unterminated", "<test>", SymbolTable::new(), NoLimitTracker);
        assert!(matches!(result, EvalResult::ParseErrors(_)), "unterminated input should fail to parse, not evaluate");
    }
}
