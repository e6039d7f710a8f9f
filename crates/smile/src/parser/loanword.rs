//! User-defined `#loanword` rules (design note §4.3 "User loanword rules").
//!
//! Grounded on `original_source/.../parsing/parser/parseloanword.c`: a
//! loanword binds a name to a pre-compiled regex plus a replacement
//! template. When the lexer hands the parser a `LoanwordCustom` token, the
//! parser looks the name up in the current scope's `LoanwordTable`, skips
//! whitespace up to and including the next newline, then matches the regex
//! against the remaining input; captures become template variables.

use std::collections::HashMap;

use crate::intern::Symbol;
use crate::parser::ast::Expr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoanwordId(pub u32);

/// A single `#loanword name: regex => template` rule.
#[derive(Debug, Clone)]
pub struct Loanword {
    pub name: Symbol,
    pub regex: regex::Regex,
    pub template: Box<Expr>,
    /// Named capture groups referenced by the template, in the order the
    /// regex declares them (design note: "Regex captures (numbered `$0..$n` and
    /// named) are bound as template variables").
    pub capture_names: Vec<String>,
}

/// Per-scope mapping name → loanword rule (design note §3 "Loanword table").
#[derive(Debug, Clone, Default)]
pub struct LoanwordTable {
    rules: HashMap<Symbol, Loanword>,
    next_id: u32,
}

impl LoanwordTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, loanword: Loanword) -> LoanwordId {
        let id = self.next_id;
        self.next_id += 1;
        self.rules.insert(loanword.name, loanword);
        LoanwordId(id)
    }

    #[must_use]
    pub fn get(&self, name: Symbol) -> Option<&Loanword> {
        self.rules.get(&name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::SymbolTable;

    #[test]
    fn defines_and_looks_up_a_loanword() {
        let mut symbols = SymbolTable::new();
        let name = symbols.get_symbol("hex");
        let mut table = LoanwordTable::new();
        table.define(Loanword {
            name,
            regex: regex::Regex::new(r"^[0-9a-fA-F]+").unwrap(),
            template: Box::new(Expr::Literal(crate::value::Value::Null)),
            capture_names: Vec::new(),
        });
        assert!(table.get(name).is_some());
    }
}
