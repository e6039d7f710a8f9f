//! Symbol interning.
//!
//! Mirrors `ouros`'s `StringId` idiom: a dense, non-zero integer handle
//! into a process-wide table, with a fixed block of ids preassigned at
//! startup for names the compiler and parser need to switch on directly.
//! Unlike `ouros` (which leaks `&'static str` for a small ASCII block
//! and reserves numeric ranges for statics vs. interned text), Smile's known
//! symbols are a single flat table seeded with exactly the ids the original
//! C implementation assigns them, because bytecode switches on these numbers.

use ahash::AHashMap;

/// An interned identifier: a dense, non-zero 32-bit id. Stable for the
/// lifetime of the process once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Symbol(u32);

impl Symbol {
    #[must_use]
    pub const fn from_raw(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Process-wide `name <-> id` mapping. New interns are rare after startup;
/// lookups that must not allocate a new id use [`SymbolTable::get_no_create`].
#[derive(Debug)]
pub struct SymbolTable {
    names: Vec<String>,
    ids: AHashMap<String, Symbol>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        let mut table = Self {
            names: vec![String::new()], // index 0 is never a valid symbol
            ids: AHashMap::new(),
        };
        for (name, id) in KNOWN_SYMBOLS {
            table.register_known(name, *id);
        }
        table
    }

    fn register_known(&mut self, name: &str, id: u32) {
        debug_assert_eq!(self.names.len(), id as usize, "known symbol ids must be assigned in order");
        self.names.push(name.to_owned());
        self.ids.insert(name.to_owned(), Symbol(id));
    }

    /// Returns the existing id for `name`, or allocates a new one.
    pub fn get_symbol(&mut self, name: &str) -> Symbol {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = Symbol(u32::try_from(self.names.len()).expect("symbol table overflow"));
        self.names.push(name.to_owned());
        self.ids.insert(name.to_owned(), id);
        id
    }

    /// Looks up `name` without interning it. Used by pure reads against
    /// global closures, which must not pollute the table.
    #[must_use]
    pub fn get_symbol_no_create(&self, name: &str) -> Option<Symbol> {
        self.ids.get(name).copied()
    }

    #[must_use]
    pub fn get_name(&self, id: Symbol) -> &str {
        &self.names[id.raw() as usize]
    }
}

/// Fixed-id special forms, keywords, operators, punctuation, and syntax-class
/// nonterminals, transcribed from the reference implementation's
/// `knownsymbols.h` so bytecode and the parser can switch on these numbers
/// exactly as the original does. IDs above 94 (e.g. the `String_`/`Integer64_`
/// type-name family) are assigned dynamically the first time a typename is
/// referenced; they are not preregistered here.
pub const KNOWN_SYMBOLS: &[(&str, u32)] = &[
    ("$set", 1),
    ("$opset", 2),
    ("$include", 3),
    ("$if", 4),
    ("$while", 5),
    ("$till", 6),
    ("$fn", 7),
    ("$quote", 8),
    ("$scope", 9),
    ("$prog1", 10),
    ("$progn", 11),
    ("$return", 12),
    ("$catch", 13),
    ("$not", 14),
    ("$or", 15),
    ("$and", 16),
    ("$eq", 17),
    ("$ne", 18),
    ("$new", 19),
    ("$dot", 20),
    ("$index", 21),
    ("$is", 22),
    ("$typeof", 23),
    ("$brk", 24),
    ("var", 25),
    ("const", 26),
    ("auto", 27),
    ("keyword", 28),
    ("if", 29),
    ("unless", 30),
    ("then", 31),
    ("else", 32),
    ("do", 33),
    ("while", 34),
    ("until", 35),
    ("till", 36),
    ("when", 37),
    ("return", 38),
    ("try", 39),
    ("catch", 40),
    ("not", 41),
    ("or", 42),
    ("and", 43),
    ("new", 44),
    ("is", 45),
    ("typeof", 46),
    ("===", 47),
    ("!==", 48),
    ("==", 49),
    ("!=", 50),
    ("<", 51),
    (">", 52),
    ("<=", 53),
    (">=", 54),
    ("+", 55),
    ("-", 56),
    ("*", 57),
    ("/", 58),
    ("(", 59),
    (")", 60),
    ("[", 61),
    ("]", 62),
    ("{", 63),
    ("}", 64),
    (",", 65),
    (";", 66),
    (":", 67),
    ("?", 68),
    ("=>", 69),
    ("^", 70),
    ("@", 71),
    ("<<", 72),
    (">>", 73),
    ("<<<", 74),
    (">>>", 75),
    ("<<<<", 76),
    (">>>>", 77),
    ("STMT", 78),
    ("EXPR", 79),
    ("CMPEXPR", 80),
    ("ADDEXPR", 81),
    ("MULEXPR", 82),
    ("BINARYEXPR", 83),
    ("COLONEXPR", 84),
    ("RANGEEXPR", 85),
    ("PREFIXEXPR", 86),
    ("POSTFIXEXPR", 87),
    ("CONSEXPR", 88),
    ("DOTEXPR", 89),
    ("TERM", 90),
    ("NAME", 91),
    ("get-member", 92),
    ("set-member", 93),
    ("as", 94),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_symbols_keep_fixed_ids() {
        let table = SymbolTable::new();
        assert_eq!(table.get_symbol_no_create("$if"), Some(Symbol(4)));
        assert_eq!(table.get_symbol_no_create("$fn"), Some(Symbol(7)));
        assert_eq!(table.get_symbol_no_create("try"), Some(Symbol(39)));
        assert_eq!(table.get_name(Symbol(55)), "+");
    }

    #[test]
    fn round_trips_new_interns() {
        let mut table = SymbolTable::new();
        let id = table.get_symbol("frobnicate");
        assert_eq!(table.get_name(id), "frobnicate");
        assert_eq!(table.get_symbol("frobnicate"), id);
        assert_eq!(table.get_symbol_no_create("never-interned"), None);
    }
}
