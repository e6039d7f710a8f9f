//! The Smile value model (design note §3).
//!
//! Grounded on `ouros`'s `value.rs` tagged-enum-with-heap-`Ref` idiom,
//! but unified the way design note §9 "Design notes" explicitly invites: the C
//! original carries a dual representation (`SmileObject` for boxed objects,
//! `SmileArg` for a boxed-pointer-plus-raw-union unboxed slot); here a single
//! `enum Value` variant per primitive kind does the job, and heap objects are
//! addressed through one `HeapId` variant rather than a family of object
//! pointer types.
//!
//! `ouros`'s `Value` carries manual reference-counting obligations
//! (`clone_with_heap`/`clone_immediate`, an optional panic-on-drop check)
//! because CPython-style semantics need precise refcounts even under a
//! tracing collector. Smile's GC is specified as an external conservative
//! tracing collector (design note §1) that the language core only calls through
//! `alloc`/`alloc_atomic`/`realloc`; our in-repo stand-in (`heap::Heap`) is a
//! simple slot arena with no generational collection, so `Value` derives
//! `Clone` directly — there is no refcount to get wrong.

use smallvec::SmallVec;

use crate::heap::HeapId;
use crate::intern::Symbol;

/// A single Smile value: an unboxed primitive, or a reference to a heap
/// object. See design note §3 for the full list of heap `kind`s a `Ref` may
/// point at (`String`, `List`, `Pair`, `UserObject`, `Function`, `Handle`,
/// `ByteArray`, `Syntax`, `Loanword`, `Nonterminal`, `Range`, `Exception`,
/// the `Null` singleton).
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(u8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    /// IEEE-754 binary floating point. `Float128` is boxed (see `HeapObject::Float128`)
    /// since Rust has no native 128-bit float.
    Float32(f32),
    Float64(f64),
    /// Decimal ("real") floating point. Decimal arithmetic itself is out of
    /// scope (design note §1); these slots carry the bit pattern produced by the
    /// (external) decimal library without the core interpreting it. `Real32`
    /// and `Real64` store the pattern inline as `f32`/`f64` bits for parity
    /// with the binary-float path; `Real128` is boxed like `Float128`.
    Real32(f32),
    Real64(f64),
    /// An 8-bit "narrow" character.
    Char(u8),
    /// A full Unicode scalar value.
    Uni(char),
    Symbol(Symbol),
    Ref(HeapId),
}

impl Value {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Truthiness per design note's `Bool` opcode contract: only `false` and
    /// `Null` are falsy; every other value, including `0`, is truthy (Smile
    /// has no C-style falsy-zero rule).
    #[must_use]
    pub const fn is_truthy(&self) -> bool {
        !matches!(self, Self::Null | Self::Bool(false))
    }

    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "Null",
            Self::Bool(_) => "Bool",
            Self::Byte(_) => "Byte",
            Self::Int16(_) => "Int16",
            Self::Int32(_) => "Int32",
            Self::Int64(_) => "Int64",
            Self::Float32(_) => "Float32",
            Self::Float64(_) => "Float64",
            Self::Real32(_) => "Real32",
            Self::Real64(_) => "Real64",
            Self::Char(_) => "Char",
            Self::Uni(_) => "Uni",
            Self::Symbol(_) => "Symbol",
            Self::Ref(_) => "Ref",
        }
    }

    /// `SuperEq`/`SuperNe` per design note §4.5: identical-reference-or-identical-
    /// unboxed-value only. Polymorphic `==` goes through
    /// `evaluator::natives::structural_eq` instead, which recurses into heap
    /// objects rather than comparing `Ref`s by identity.
    #[must_use]
    pub fn super_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Ref(a), Self::Ref(b)) => a == b,
            _ => self == other,
        }
    }
}

/// Security flags on a `UserObject`'s fields, per design note §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct SecurityFlags {
    pub readable: bool,
    pub writable: bool,
    pub appendable: bool,
}

impl SecurityFlags {
    #[must_use]
    pub const fn open() -> Self {
        Self {
            readable: true,
            writable: true,
            appendable: true,
        }
    }
}

/// A list cons cell's optional attached source position, carried via a
/// distinct kind-bit per design note §3 so position-bearing and position-less
/// cells coexist without bloating every cell with an `Option`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LexerPosition {
    pub filename: Symbol,
    pub line: u32,
    pub column: u32,
    pub line_start_offset: u32,
    pub length: u32,
}

/// Heap-allocated object kinds (design note §3). Addressed only through
/// `Value::Ref(HeapId)`; never constructed directly by evaluator code except
/// through `heap::Heap::alloc`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum HeapObject {
    /// Immutable byte string.
    Str(String),
    /// A cons cell: `a`/`d` fields, optionally carrying a source position.
    List {
        a: Value,
        d: Value,
        pos: Option<LexerPosition>,
    },
    Pair {
        left: Value,
        right: Value,
    },
    UserObject {
        class_name: Option<Symbol>,
        fields: indexmap::IndexMap<Symbol, Value>,
        security: SecurityFlags,
    },
    /// A callable: either a bytecode closure (index into the function table)
    /// or a native function registered by the host.
    Function(FunctionValue),
    /// Opaque host-provided handle (design note §3's `Handle`); the core never
    /// interprets its contents.
    Handle(u64),
    ByteArray(Vec<u8>),
    Syntax(crate::parser::syntax::SyntaxClassId),
    Loanword(crate::parser::syntax::LoanwordId),
    Nonterminal(Symbol),
    Range(RangeValue),
    Exception(crate::error::Exception),
    Real128([u8; 16]),
    Float128([u8; 16]),
    /// A runtime activation record: the live argument/local slot array for
    /// one call, linked to its lexically enclosing activation (design note §3
    /// `Closure`). Distinct from `Function(FunctionValue::Closure)`, which is
    /// just the static `(code, captured-parent)` pair produced by `NewFn` —
    /// this is what gets allocated each time that pair is actually *called*,
    /// per `original_source`'s `closure.h` kind-0/kind-1 split.
    LocalClosure {
        info: std::rc::Rc<crate::bytecode::ClosureInfo>,
        parent: Option<HeapId>,
        /// Inline capacity 8 matches the bytecode's fast-path opcodes
        /// (`LdArgFast`/`LdLocFast`/.../depth 7), which is the slot count
        /// most call frames need.
        slots: SmallVec<[Value; 8]>,
    },
    /// The single module-level activation record: name-indexed rather than
    /// index-indexed, since top-level bindings are referenced by symbol
    /// (`LdX`/`StX`) rather than a fixed slot number.
    GlobalClosure {
        vars: indexmap::IndexMap<Symbol, Value>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum RangeValue {
    Int { start: i64, end: i64, step: i64 },
    Char { start: u8, end: u8 },
    Uni { start: char, end: char },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum FunctionValue {
    /// Index into `CompiledTables::functions` (a `UserFunctionInfo`), plus
    /// the captured lexical parent closure.
    Closure {
        function_index: u32,
        parent: Option<HeapId>,
    },
    /// A host-registered native function, looked up by name at call time
    /// (design note §4.5 "native external function").
    Native(Symbol),
}

impl HeapObject {
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "String",
            Self::List { .. } => "List",
            Self::Pair { .. } => "Pair",
            Self::UserObject { .. } => "UserObject",
            Self::Function(_) => "Function",
            Self::Handle(_) => "Handle",
            Self::ByteArray(_) => "ByteArray",
            Self::Syntax(_) => "Syntax",
            Self::Loanword(_) => "Loanword",
            Self::Nonterminal(_) => "Nonterminal",
            Self::Range(_) => "Range",
            Self::Exception(_) => "Exception",
            Self::Real128(_) => "Real128",
            Self::Float128(_) => "Float128",
            Self::LocalClosure { .. } => "Closure",
            Self::GlobalClosure { .. } => "Closure",
        }
    }

    /// Approximate heap size in bytes, for `ResourceTracker::on_allocate`.
    #[must_use]
    pub fn approx_size(&self) -> usize {
        let base = std::mem::size_of::<Self>();
        base + match self {
            Self::Str(s) => s.len(),
            Self::ByteArray(b) => b.len(),
            Self::UserObject { fields, .. } => fields.len() * std::mem::size_of::<(Symbol, Value)>(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_matches_spec() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Int32(0).is_truthy(), "Smile has no falsy-zero rule");
    }

    #[test]
    fn super_eq_is_reference_identity_for_refs() {
        let a = Value::Ref(HeapId::from_raw(1));
        let b = Value::Ref(HeapId::from_raw(1));
        let c = Value::Ref(HeapId::from_raw(2));
        assert!(a.super_eq(&b));
        assert!(!a.super_eq(&c));
    }
}
