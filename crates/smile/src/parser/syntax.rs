//! User-defined `#syntax` rules (design note §4.3 "User syntax rules").
//!
//! Grounded on `original_source/.../parsing/parser/parsesyntax.c` (rule
//! parsing) and `applysyntax.c` (trie matching at parse time). A pattern is
//! a sequence of terminals (symbols/punctuation) and nonterminal
//! placeholders; patterns for one syntax class share a trie so the parser
//! can try the longest match first (shift/reduce conflicts resolve in favor
//! of shift, per design note).

use std::collections::HashMap;

use crate::intern::Symbol;
use crate::parser::ast::Expr;

/// A per-scope-unique handle for a user syntax class, stored in
/// `HeapObject::Syntax` when a syntax rule's template needs to reference it
/// reflectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyntaxClassId(pub u32);

/// One element of a syntax pattern.
#[derive(Debug, Clone)]
pub enum PatternElem {
    /// A literal terminal: a keyword, punctuation, or operator symbol.
    Terminal(Symbol),
    /// `[classname name]` — parse one instance of `classname`, bind it to `name`.
    Nonterminal { class: Symbol, name: Symbol },
    /// `[classname name ,]` — repeat, separated by the given terminal.
    Repeat { class: Symbol, name: Symbol, separator: Symbol },
    /// `[classname? name]` — optionally parse one instance.
    Optional { class: Symbol, name: Symbol },
}

/// A single `#syntax` rule: pattern plus replacement template.
#[derive(Debug, Clone)]
pub struct SyntaxRule {
    pub pattern: Vec<PatternElem>,
    /// The template AST; each `Expr::Var(name)` matching a pattern binding
    /// is substituted with the parsed subtree for that binding at apply time.
    pub template: Box<Expr>,
}

/// Trie node for one syntax class: edges keyed by terminal symbol, plus a
/// list of nonterminal-led continuations (these can't be indexed by a single
/// key since any parseable subexpression might match), and an optional leaf
/// rule completed at this node. Fields are `pub(crate)` so `parser::mod`'s
/// rule applier can walk the trie directly while matching input tokens.
#[derive(Debug, Clone, Default)]
pub struct TrieNode {
    pub(crate) terminal_edges: HashMap<Symbol, Box<TrieNode>>,
    pub(crate) nonterminal_edges: Vec<(PatternElem, Box<TrieNode>)>,
    pub(crate) rule: Option<SyntaxRule>,
}

impl TrieNode {
    fn insert(&mut self, pattern: &[PatternElem], rule: SyntaxRule) {
        let Some((head, rest)) = pattern.split_first() else {
            self.rule = Some(rule);
            return;
        };
        match head {
            PatternElem::Terminal(sym) => {
                self.terminal_edges.entry(*sym).or_default().insert(rest, rule);
            }
            other => {
                // Nonterminal-led edges aren't deduplicated: each rule gets its
                // own continuation node, since two different bindings can't
                // share trie structure without a parsed value to key on.
                let mut node = Box::new(TrieNode::default());
                node.insert(rest, rule);
                self.nonterminal_edges.push((other.clone(), node));
            }
        }
    }
}

/// A named syntax class (one of the nine built-ins, or user-introduced),
/// holding all rules registered for it in this scope as a shared trie.
#[derive(Debug, Clone, Default)]
pub struct SyntaxClass {
    root: TrieNode,
}

impl SyntaxClass {
    pub fn add_rule(&mut self, rule: SyntaxRule) {
        let pattern = rule.pattern.clone();
        self.root.insert(&pattern, rule);
    }

    /// Returns the first (terminal or nonterminal) matchable element each
    /// currently-registered rule could start with, for the parser to probe
    /// against the next token before committing to a trie walk.
    #[must_use]
    pub fn starting_terminals(&self) -> impl Iterator<Item = Symbol> + '_ {
        self.root.terminal_edges.keys().copied()
    }

    #[must_use]
    pub fn has_nonterminal_start(&self) -> bool {
        !self.root.nonterminal_edges.is_empty()
    }

    #[must_use]
    pub fn root(&self) -> &TrieNode {
        &self.root
    }
}

impl TrieNode {
    #[must_use]
    pub fn rule(&self) -> Option<&SyntaxRule> {
        self.rule.as_ref()
    }

    #[must_use]
    pub fn terminal_edge(&self, symbol: Symbol) -> Option<&Self> {
        self.terminal_edges.get(&symbol).map(std::convert::AsRef::as_ref)
    }

    #[must_use]
    pub fn nonterminal_edges(&self) -> &[(PatternElem, Box<TrieNode>)] {
        &self.nonterminal_edges
    }
}

/// Per-scope table of user syntax classes, keyed by nonterminal symbol
/// (design note §3 "Syntax table").
#[derive(Debug, Clone, Default)]
pub struct SyntaxTable {
    classes: HashMap<Symbol, SyntaxClass>,
    next_id: u32,
}

impl SyntaxTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_rule(&mut self, class_name: Symbol, rule: SyntaxRule) -> SyntaxClassId {
        let id = self.next_id;
        self.next_id += 1;
        tracing::trace!(class = class_name.raw(), rule_id = id, "registering #syntax rule");
        self.classes.entry(class_name).or_default().add_rule(rule);
        SyntaxClassId(id)
    }

    #[must_use]
    pub fn class(&self, class_name: Symbol) -> Option<&SyntaxClass> {
        self.classes.get(&class_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::SymbolTable;

    #[test]
    fn registers_and_looks_up_a_rule() {
        let mut symbols = SymbolTable::new();
        let unless = symbols.get_symbol("unless");
        let then = symbols.get_symbol("then");
        let stmt = symbols.get_symbol_no_create("STMT").unwrap();
        let x = symbols.get_symbol("x");
        let y = symbols.get_symbol("y");
        let expr = symbols.get_symbol_no_create("EXPR").unwrap();

        let mut table = SyntaxTable::new();
        table.define_rule(
            stmt,
            SyntaxRule {
                pattern: vec![
                    PatternElem::Terminal(unless),
                    PatternElem::Nonterminal { class: expr, name: x },
                    PatternElem::Terminal(then),
                    PatternElem::Nonterminal { class: stmt, name: y },
                ],
                template: Box::new(Expr::Var(x)),
            },
        );

        let class = table.class(stmt).expect("STMT class registered");
        let edge = class.root().terminal_edge(unless).expect("unless edge present");
        assert!(edge.rule().is_none(), "rule completes later in the pattern");
    }
}
