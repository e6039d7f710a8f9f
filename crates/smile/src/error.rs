//! Error handling design (design note §7), grounded on `ouros`'s
//! `exception_private.rs` idiom: an error-kind enum driven by `strum` so it
//! carries a `Display`/`EnumString` impl for free, matching `ouros`'s
//! `ExcType`.

use crate::intern::Symbol;
use crate::value::LexerPosition;

/// The fourteen error kinds from design note §7 (parser and runtime combined).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, strum::IntoStaticStr)]
pub enum ErrorKind {
    SyntaxError,
    LexError,
    LoadError,
    EvalError,
    PropertyError,
    TypeAssertion,
    NativeMethodError,
    ObjectSecurityError,
    DivideByZero,
    SqrtDomain,
    LogDomain,
    CompileError,
    ConfigurationError,
    UserException,
}

/// A single error or exception: a kind, a human-readable message, and an
/// optional source position.
#[derive(Debug, Clone)]
pub struct SmileError {
    pub kind: ErrorKind,
    pub message: String,
    pub position: Option<LexerPosition>,
}

impl SmileError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            position: None,
        }
    }

    #[must_use]
    pub fn at(mut self, position: LexerPosition) -> Self {
        self.position = Some(position);
        self
    }
}

impl std::fmt::Display for SmileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for SmileError {}

/// Parser diagnostic severities (design note §7). Parsing accumulates a list of
/// these; `Error` lets compilation proceed best-effort, `Fatal` aborts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

#[derive(Debug, Clone)]
pub struct ParseMessage {
    pub severity: Severity,
    pub error: SmileError,
}

impl ParseMessage {
    #[must_use]
    pub fn new(severity: Severity, error: SmileError) -> Self {
        Self { severity, error }
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }
}

/// A thrown runtime exception. Conventionally a `UserObject` shape
/// (`kind`, `message`, `stack-trace`) per design note §7; modeled directly as a
/// struct here rather than through the generic `UserObject` machinery, since
/// every exception needs these three fields regardless of how it was raised.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Exception {
    pub kind: String,
    pub message: String,
    pub stack_trace: Vec<StackFrame>,
}

impl Exception {
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack_trace: Vec::new(),
        }
    }

    pub fn push_frame(&mut self, frame: StackFrame) {
        self.stack_trace.push(frame);
    }
}

impl std::fmt::Display for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Exception {}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StackFrame {
    pub function_name: Option<Symbol>,
    pub line: u32,
}

/// Result of evaluating a module's top-level expression (design note §4.6).
#[derive(Debug, Clone)]
pub enum EvalResult {
    Ok { value: crate::value::Value },
    ParseErrors(Vec<ParseMessage>),
    RuntimeError(Exception),
}
