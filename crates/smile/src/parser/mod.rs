//! Recursive-descent parser (design note §4.3).
//!
//! Grounded on `original_source/.../parsing/parser/{parsercore.c,parseterm.c,
//! parsefunc.c,parsequote.c}` for the overall shape — a token-at-a-time
//! descent with an explicit `ParseScopeStack`, special-form keywords
//! recognized directly rather than bootstrapped purely from `#syntax` rules
//! (see the module-level Open Question in `DESIGN.md`: a from-scratch
//! BNF-trie bootstrap of the entire built-in grammar is out of scope for this
//! effort level; built-in keyword sugar is parsed directly, while
//! user-defined `#syntax`/`#loanword` rules still go through the real
//! trie/regex machinery in `syntax.rs`/`loanword.rs`).

pub mod ast;
pub mod loanword;
pub mod scope;
pub mod syntax;

use crate::error::{ErrorKind, ParseMessage, Severity, SmileError};
use crate::intern::{Symbol, SymbolTable};
use crate::lexer::{Lexer, StringSegment, Token, TokenData, TokenKind};
use crate::value::Value;

use ast::{Expr, Param};
use loanword::{Loanword, LoanwordTable};
use scope::{DeclKind, ParseScopeStack, ScopeKind};
use syntax::{PatternElem, SyntaxRule, SyntaxTable};

/// Parses `source` to completion, returning the top-level expression (a
/// `Progn` of every statement), the names this program exposes at its
/// top-level scope (design note §4.6 "Exports are discovered by scanning the
/// module's top-level `ParseScope` for declarations whose kind is `variable`
/// or `const`"), and any diagnostics collected along the way.
pub fn parse_program(source: &str, filename: &str, symbols: &mut SymbolTable) -> (Expr, Vec<Symbol>, Vec<ParseMessage>) {
    let filename_sym = symbols.get_symbol(filename);
    let mut parser = Parser::new(source.as_bytes(), filename_sym, symbols);
    parser.advance();
    let body = parser.parse_statements_until(TokenKind::Eoi);
    let exports = parser
        .scopes
        .outermost_decls()
        .filter(|(_, decl)| matches!(decl.kind, DeclKind::Variable | DeclKind::Const))
        .map(|(symbol, _)| symbol)
        .collect();
    (Expr::Progn(body), exports, parser.messages)
}

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    symbols: &'a mut SymbolTable,
    scopes: ParseScopeStack,
    syntax: SyntaxTable,
    loanwords: LoanwordTable,
    messages: Vec<ParseMessage>,
    current: Token,
}

impl<'a> Parser<'a> {
    fn new(input: &'a [u8], filename: Symbol, symbols: &'a mut SymbolTable) -> Self {
        let lexer = Lexer::new(input, filename, 1, 0);
        let placeholder = Token {
            kind: TokenKind::Eoi,
            text: String::new(),
            data: TokenData::None,
            has_escapes: false,
            is_first_content_on_line: true,
            position: crate::value::LexerPosition {
                filename,
                line: 1,
                column: 1,
                line_start_offset: 0,
                length: 0,
            },
        };
        Self {
            lexer,
            symbols,
            scopes: ParseScopeStack::new(),
            syntax: SyntaxTable::new(),
            loanwords: LoanwordTable::new(),
            messages: Vec::new(),
            current: placeholder,
        }
    }

    fn sym(&self, name: &str) -> Symbol {
        self.symbols
            .get_symbol_no_create(name)
            .unwrap_or_else(|| panic!("`{name}` is expected to be a pre-registered known symbol"))
    }

    fn advance(&mut self) -> Token {
        let next = self.lexer.next(self.symbols);
        std::mem::replace(&mut self.current, next)
    }

    fn peek_next(&mut self) -> Token {
        let next = self.lexer.next(self.symbols);
        self.lexer.unget();
        next
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn at_alpha(&self, name: &str) -> bool {
        self.current.kind == TokenKind::AlphaName && self.current.text == name
    }

    fn at_punct(&self, text: &str) -> bool {
        matches!(self.current.kind, TokenKind::PunctName) && self.current.text == text
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_alpha(&mut self, name: &str) -> bool {
        if self.at_alpha(name) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Token {
        if self.at(kind) {
            self.advance()
        } else {
            self.error(format!("expected {what}, found `{}`", self.current.text));
            self.current.clone()
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        self.error_with_kind(ErrorKind::SyntaxError, message);
    }

    fn error_with_kind(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.messages.push(ParseMessage::new(Severity::Error, SmileError::new(kind, message).at(self.current.position)));
    }

    /// Resynchronizes after a parse error by skipping to the next statement
    /// boundary (design note §4.3 "error recovery").
    fn recover(&mut self) {
        loop {
            match self.current.kind {
                TokenKind::Semicolon => {
                    self.advance();
                    return;
                }
                TokenKind::RBrace | TokenKind::RBracket | TokenKind::RParen | TokenKind::Eoi => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    // ---- statements -------------------------------------------------

    fn parse_statements_until(&mut self, terminator: TokenKind) -> Vec<Expr> {
        let mut stmts = Vec::new();
        while !self.at(terminator) && !self.at(TokenKind::Eoi) {
            let before = self.messages.len();
            stmts.push(self.parse_statement());
            if self.messages.len() > before && !self.at(terminator) && !self.at(TokenKind::Eoi) {
                self.recover();
            }
            self.eat(TokenKind::Semicolon);
        }
        stmts
    }

    fn parse_statement(&mut self) -> Expr {
        if self.at(TokenKind::LoanwordSyntax) {
            self.parse_syntax_definition();
            return Expr::Literal(Value::Null);
        }
        if self.at(TokenKind::LoanwordLoanword) {
            self.parse_loanword_definition();
            return Expr::Literal(Value::Null);
        }
        let stmt_class = self.sym("STMT");
        if let Some(expr) = self.try_user_syntax(stmt_class) {
            return expr;
        }
        if self.at_alpha("var") || self.at_alpha("const") || self.at_alpha("auto") {
            return self.parse_var_decl();
        }
        self.parse_expr()
    }

    /// Attempts to match and apply a user `#syntax` rule registered for
    /// `class` against the upcoming tokens (design note §4.3 "apply user
    /// syntax"). Matching is single-pass / shift-preferring: the first
    /// terminal or nonterminal edge that matches commits, with no
    /// backtracking across alternative rules.
    fn try_user_syntax(&mut self, class: Symbol) -> Option<Expr> {
        let starts_with_known_terminal = matches!(self.current.kind, TokenKind::AlphaName | TokenKind::PunctName)
            && self
                .symbols
                .get_symbol_no_create(&self.current.text)
                .is_some_and(|sym| self.syntax.class(class).is_some_and(|c| c.starting_terminals().any(|t| t == sym)));
        if !starts_with_known_terminal {
            return None;
        }
        let class_def = self.syntax.class(class)?.clone();
        let mut bindings = Vec::new();
        self.match_syntax_node(class_def.root(), &mut bindings)
    }

    fn match_syntax_node(&mut self, node: &syntax::TrieNode, bindings: &mut Vec<(Symbol, Expr)>) -> Option<Expr> {
        if matches!(self.current.kind, TokenKind::AlphaName | TokenKind::PunctName)
            && let Some(sym) = self.symbols.get_symbol_no_create(&self.current.text)
            && let Some(next) = node.terminal_edge(sym)
        {
            self.advance();
            if let Some(result) = self.match_syntax_node(next, bindings) {
                return Some(result);
            }
        }
        for (elem, next) in node.nonterminal_edges() {
            if let PatternElem::Nonterminal { name, .. } | PatternElem::Optional { name, .. } = elem {
                let sub = self.parse_expr();
                bindings.push((*name, sub));
                if let Some(result) = self.match_syntax_node(next, bindings) {
                    return Some(result);
                }
                bindings.pop();
            }
        }
        node.rule().map(|rule| substitute_template(&rule.template, bindings))
    }

    fn parse_var_decl(&mut self) -> Expr {
        let kind_word = self.current.text.clone();
        self.advance();
        let decl_kind = match kind_word.as_str() {
            "const" => DeclKind::Const,
            "auto" => DeclKind::Auto,
            _ => DeclKind::Variable,
        };
        let mut vars = Vec::new();
        let mut inits = Vec::new();
        loop {
            if !self.at(TokenKind::AlphaName) && !self.at(TokenKind::UnknownAlphaName) {
                self.error("expected a variable name after declaration keyword");
                break;
            }
            let text = self.current.text.clone();
            let name = self.symbols.get_symbol(&text);
            let position = self.current.position;
            self.advance();
            self.scopes.declare(name, decl_kind, Some(position));
            vars.push(name);
            if self.eat(TokenKind::Equal) {
                inits.push(Some(self.parse_assign_rhs()));
            } else {
                inits.push(None);
            }
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        let mut body = Vec::new();
        for (var, init) in vars.iter().zip(inits.into_iter()) {
            if let Some(value) = init {
                body.push(Expr::Set { target: Box::new(Expr::Var(*var)), value: Box::new(value) });
            }
        }
        if body.is_empty() {
            body.push(Expr::Literal(Value::Null));
        }
        Expr::Scope { vars, body }
    }

    // ---- expressions --------------------------------------------------

    fn parse_expr(&mut self) -> Expr {
        self.parse_assign()
    }

    fn parse_assign_rhs(&mut self) -> Expr {
        self.parse_assign()
    }

    fn parse_assign(&mut self) -> Expr {
        let lhs = self.parse_or();
        if self.at(TokenKind::Equal) {
            self.advance();
            let rhs = self.parse_assign();
            return Expr::Set { target: Box::new(lhs), value: Box::new(rhs) };
        }
        lhs
    }

    fn parse_or(&mut self) -> Expr {
        let mut terms = vec![self.parse_and()];
        while self.eat_alpha("or") {
            terms.push(self.parse_and());
        }
        if terms.len() == 1 { terms.pop().unwrap() } else { Expr::Or(terms) }
    }

    fn parse_and(&mut self) -> Expr {
        let mut terms = vec![self.parse_not()];
        while self.eat_alpha("and") {
            terms.push(self.parse_not());
        }
        if terms.len() == 1 { terms.pop().unwrap() } else { Expr::And(terms) }
    }

    fn parse_not(&mut self) -> Expr {
        if self.eat_alpha("not") {
            return Expr::Not(Box::new(self.parse_not()));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Expr {
        let mut lhs = self.parse_additive();
        loop {
            let op_name = match self.current.kind {
                TokenKind::EqEqEq => "===",
                TokenKind::NeEqEq => "!==",
                TokenKind::EqEq => "==",
                TokenKind::NotEq => "!=",
                TokenKind::Lt => "<",
                TokenKind::Gt => ">",
                TokenKind::Le => "<=",
                TokenKind::Ge => ">=",
                _ => break,
            };
            let op = self.sym(op_name);
            self.advance();
            let rhs = self.parse_additive();
            lhs = Expr::Call { func: Box::new(Expr::Var(op)), args: vec![lhs, rhs] };
        }
        if self.eat_alpha("is") {
            let ty = self.parse_additive();
            lhs = Expr::Is { value: Box::new(lhs), type_expr: Box::new(ty) };
        }
        lhs
    }

    fn parse_additive(&mut self) -> Expr {
        let mut lhs = self.parse_multiplicative();
        while self.at_punct("+") || self.at_punct("-") {
            let op = self.sym(&self.current.text.clone());
            self.advance();
            let rhs = self.parse_multiplicative();
            lhs = Expr::Call { func: Box::new(Expr::Var(op)), args: vec![lhs, rhs] };
        }
        lhs
    }

    fn parse_multiplicative(&mut self) -> Expr {
        let mut lhs = self.parse_unary();
        while self.at_punct("*") || self.at_punct("/") {
            let op = self.sym(&self.current.text.clone());
            self.advance();
            let rhs = self.parse_unary();
            lhs = Expr::Call { func: Box::new(Expr::Var(op)), args: vec![lhs, rhs] };
        }
        lhs
    }

    fn parse_unary(&mut self) -> Expr {
        if self.at_punct("-") {
            self.advance();
            let operand = self.parse_unary();
            let minus = self.sym("-");
            return Expr::Call { func: Box::new(Expr::Var(minus)), args: vec![Expr::Literal(Value::Int32(0)), operand] };
        }
        if self.eat_alpha("typeof") {
            return Expr::TypeOf(Box::new(self.parse_unary()));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Expr {
        let mut expr = self.parse_call_chain();
        loop {
            if self.eat(TokenKind::Dot) {
                let name_tok = self.current.clone();
                if name_tok.kind != TokenKind::AlphaName && name_tok.kind != TokenKind::UnknownAlphaName {
                    self.error("expected a property or method name after `.`");
                    break;
                }
                let name = self.symbols.get_symbol(&name_tok.text);
                self.advance();
                if self.at(TokenKind::LParen) {
                    let args = self.parse_paren_args();
                    expr = Expr::MethodCall { obj: Box::new(expr), method: name, args };
                } else {
                    expr = Expr::PropertyAccess { obj: Box::new(expr), property: name };
                }
                continue;
            }
            break;
        }
        expr
    }

    fn parse_paren_args(&mut self) -> Vec<Expr> {
        self.expect(TokenKind::LParen, "`(`");
        let mut args = Vec::new();
        if !self.at(TokenKind::RParen) {
            loop {
                args.push(self.parse_expr());
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "`)`");
        args
    }

    /// A primary term optionally followed by juxtaposed argument terms
    /// (`f a b` -> `Call{f, [a, b]}`), design note's bracket-free call sugar.
    fn parse_call_chain(&mut self) -> Expr {
        let head = self.parse_primary();
        if !matches!(head, Expr::Var(_)) {
            return head;
        }
        let mut args = Vec::new();
        while self.starts_argument_term() {
            args.push(self.parse_primary_with_postfix());
        }
        if args.is_empty() { head } else { Expr::Call { func: Box::new(head), args } }
    }

    fn parse_primary_with_postfix(&mut self) -> Expr {
        let mut expr = self.parse_primary();
        while self.eat(TokenKind::Dot) {
            let name_tok = self.current.clone();
            let name = self.symbols.get_symbol(&name_tok.text);
            self.advance();
            expr = Expr::PropertyAccess { obj: Box::new(expr), property: name };
        }
        expr
    }

    fn starts_argument_term(&self) -> bool {
        matches!(
            self.current.kind,
            TokenKind::AlphaName
                | TokenKind::UnknownAlphaName
                | TokenKind::Int32
                | TokenKind::Int64
                | TokenKind::Int16
                | TokenKind::Byte
                | TokenKind::Float64
                | TokenKind::Real64
                | TokenKind::RawString
                | TokenKind::DynString
                | TokenKind::LParen
                | TokenKind::LBracket
                | TokenKind::Bar
                | TokenKind::LoanwordCustom
        )
    }

    fn parse_primary(&mut self) -> Expr {
        match self.current.kind {
            TokenKind::Int32 => self.literal_and_advance(|d| match d {
                TokenData::Int32(v) => Some(Value::Int32(*v)),
                _ => None,
            }),
            TokenKind::Int16 => self.literal_and_advance(|d| match d {
                TokenData::Int16(v) => Some(Value::Int16(*v)),
                _ => None,
            }),
            TokenKind::Int64 => self.literal_and_advance(|d| match d {
                TokenData::Int64(v) => Some(Value::Int64(*v)),
                _ => None,
            }),
            TokenKind::Byte => self.literal_and_advance(|d| match d {
                TokenData::Byte(v) => Some(Value::Byte(*v)),
                _ => None,
            }),
            TokenKind::Float64 => self.literal_and_advance(|d| match d {
                TokenData::Float64(v) => Some(Value::Float64(*v)),
                _ => None,
            }),
            TokenKind::Real64 => {
                let bits = match &self.current.data {
                    TokenData::Real64Bits(b) => *b,
                    _ => 0,
                };
                self.advance();
                Expr::Literal(Value::Real64(f64::from_bits(bits)))
            }
            TokenKind::RawString => {
                let text = self.current.text.clone();
                self.advance();
                Expr::StringLiteral(text)
            }
            TokenKind::DynString => self.parse_dyn_string(),
            TokenKind::AlphaName | TokenKind::UnknownAlphaName => self.parse_alpha_primary(),
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr();
                self.expect(TokenKind::RParen, "`)`");
                inner
            }
            TokenKind::LBracket => self.parse_bracket_form(),
            TokenKind::LBrace => self.parse_brace_scope(),
            TokenKind::Bar => self.parse_fn_literal(),
            TokenKind::LoanwordCustom => self.parse_loanword_invocation(),
            TokenKind::Backtick => {
                self.advance();
                Expr::Quote(Box::new(self.parse_postfix()))
            }
            TokenKind::Error => {
                self.error_with_kind(ErrorKind::LexError, self.current.text.clone());
                self.advance();
                Expr::Literal(Value::Null)
            }
            _ => {
                self.error(format!("unexpected token `{}`", self.current.text));
                self.advance();
                Expr::Literal(Value::Null)
            }
        }
    }

    /// A `"..."` dynamic string token, with or without `{…}` interpolation
    /// (design note §4.2 "Strings"). A plain string is just a literal; one with
    /// interpolation lowers to `string-concat(piece, piece, ...)`, each
    /// embedded expression re-parsed from its raw source text by a nested
    /// `Parser` sharing this one's symbol table.
    fn parse_dyn_string(&mut self) -> Expr {
        let filename = self.current.position.filename;
        let interpolated = match &self.current.data {
            TokenData::Interpolated(segments) => Some(segments.clone()),
            _ => None,
        };
        let expr = if let Some(segments) = interpolated {
            let parts: Vec<Expr> = segments
                .into_iter()
                .filter(|seg| !matches!(seg, StringSegment::Literal(s) if s.is_empty()))
                .map(|seg| match seg {
                    StringSegment::Literal(s) => Expr::StringLiteral(s),
                    StringSegment::Expr(src) => {
                        let mut sub = Parser::new(src.as_bytes(), filename, self.symbols);
                        sub.advance();
                        sub.parse_expr()
                    }
                })
                .collect();
            let concat = self.symbols.get_symbol("string-concat");
            Expr::Call { func: Box::new(Expr::Var(concat)), args: parts }
        } else {
            Expr::StringLiteral(self.current.text.clone())
        };
        self.advance();
        expr
    }

    fn literal_and_advance(&mut self, extract: impl Fn(&TokenData) -> Option<Value>) -> Expr {
        let value = extract(&self.current.data).unwrap_or(Value::Null);
        self.advance();
        Expr::Literal(value)
    }

    fn parse_alpha_primary(&mut self) -> Expr {
        let text = self.current.text.clone();
        match text.as_str() {
            "true" => {
                self.advance();
                Expr::Literal(Value::Bool(true))
            }
            "false" => {
                self.advance();
                Expr::Literal(Value::Bool(false))
            }
            "null" => {
                self.advance();
                Expr::Literal(Value::Null)
            }
            "if" | "unless" => self.parse_if(),
            "while" | "until" => self.parse_while(),
            "till" => self.parse_till(),
            "try" => self.parse_try(),
            "return" => {
                self.advance();
                if self.at(TokenKind::Semicolon) || self.at(TokenKind::RBrace) {
                    Expr::Return(None)
                } else {
                    Expr::Return(Some(Box::new(self.parse_expr())))
                }
            }
            "new" => self.parse_new(),
            "var" | "const" | "auto" => self.parse_var_decl(),
            _ => {
                let sym = self.symbols.get_symbol(&text);
                self.advance();
                Expr::Var(sym)
            }
        }
    }

    fn parse_if(&mut self) -> Expr {
        let negate = self.at_alpha("unless");
        self.advance();
        let mut cond = self.parse_expr();
        if negate {
            cond = Expr::Not(Box::new(cond));
        }
        self.eat_alpha("then");
        let then_branch = self.parse_statement();
        let else_branch = if self.eat_alpha("else") { Some(Box::new(self.parse_statement())) } else { None };
        Expr::If { cond: Box::new(cond), then_branch: Box::new(then_branch), else_branch }
    }

    fn parse_while(&mut self) -> Expr {
        let negate = self.at_alpha("until");
        self.advance();
        let mut cond = self.parse_expr();
        if negate {
            cond = Expr::Not(Box::new(cond));
        }
        self.eat_alpha("do");
        let body = self.parse_statement();
        Expr::While { pre_cond: Some(Box::new(cond)), body: Box::new(body), post_cond: None }
    }

    fn parse_till(&mut self) -> Expr {
        self.advance();
        self.scopes.push(ScopeKind::Scope);
        let mut flags = Vec::new();
        loop {
            if !self.at(TokenKind::AlphaName) && !self.at(TokenKind::UnknownAlphaName) {
                break;
            }
            let name = self.symbols.get_symbol(&self.current.text.clone());
            self.scopes.declare(name, DeclKind::TillFlag, Some(self.current.position));
            flags.push(name);
            self.advance();
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.eat_alpha("do");
        let body = self.parse_statement();
        // `when COND: FLAG` is sugar for a conditional escape check re-run
        // after every loop iteration (design note §8 scenario 3: "repeatedly
        // calling read-line until it produces an empty string") — it isn't
        // a cleanup hook attached to the flag's landing point, since the
        // grammar gives it no handler body beyond the flag name itself. The
        // escape is compiled as an ordinary call to the flag (the same
        // path a direct `flag value` call inside the body takes), so it
        // escapes the loop with a `null` result exactly as a bare
        // unconditional call would.
        let mut when_clauses = Vec::new();
        while self.eat_alpha("when") {
            let cond = self.parse_expr();
            self.expect(TokenKind::Colon, "`:`");
            let flag_name = self.current.text.clone();
            let flag = self.symbols.get_symbol(&flag_name);
            self.advance();
            when_clauses.push((
                flag,
                Expr::If {
                    cond: Box::new(cond),
                    then_branch: Box::new(Expr::Call { func: Box::new(Expr::Var(flag)), args: Vec::new() }),
                    else_branch: None,
                },
            ));
        }
        self.scopes.pop();
        Expr::Till { flags, body: Box::new(body), when_clauses }
    }

    fn parse_try(&mut self) -> Expr {
        self.advance();
        let body = self.parse_statement();
        self.eat_alpha("catch");
        let param = if self.at(TokenKind::Bar) {
            self.advance();
            let name = self.symbols.get_symbol(&self.current.text.clone());
            self.advance();
            self.expect(TokenKind::Bar, "`|`");
            name
        } else if self.at(TokenKind::AlphaName) {
            let name = self.symbols.get_symbol(&self.current.text.clone());
            self.advance();
            name
        } else {
            self.symbols.get_symbol("exception")
        };
        self.scopes.push(ScopeKind::Scope);
        self.scopes.declare(param, DeclKind::Variable, Some(self.current.position));
        let handler = self.parse_statement();
        self.scopes.pop();
        Expr::Catch { body: Box::new(body), param, handler: Box::new(handler) }
    }

    fn parse_new(&mut self) -> Expr {
        self.advance();
        // `new {a: 1}` (no class expression before the member block) is the
        // common case for one-off records (e.g. `throw {message: "oops"}`'s
        // exception payload); only parse a base expression when the member
        // block doesn't start immediately, since `{` would otherwise be
        // consumed as a brace-scope primary rather than `new`'s own block.
        let base = if self.at(TokenKind::LBrace) { Expr::Literal(Value::Null) } else { self.parse_primary() };
        let mut members = Vec::new();
        if self.eat(TokenKind::LBrace) {
            while !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eoi) {
                let name = self.symbols.get_symbol(&self.current.text.clone());
                self.advance();
                self.expect(TokenKind::Colon, "`:`");
                let value = self.parse_expr();
                members.push((name, value));
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RBrace, "`}`");
        }
        Expr::New { base: Box::new(base), members }
    }

    fn parse_fn_literal(&mut self) -> Expr {
        self.advance(); // `|`
        self.scopes.push(ScopeKind::Function);
        let mut params = Vec::new();
        while !self.at(TokenKind::Bar) && !self.at(TokenKind::Eoi) {
            if !self.at(TokenKind::AlphaName) && !self.at(TokenKind::UnknownAlphaName) {
                break;
            }
            let name = self.symbols.get_symbol(&self.current.text.clone());
            self.advance();
            self.scopes.declare(name, DeclKind::Argument, Some(self.current.position));
            let default = if self.eat(TokenKind::Equal) { Some(Box::new(self.parse_or())) } else { None };
            params.push(Param { name, type_expr: None, default, rest: false });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::Bar, "`|`");
        let body = self.parse_statement();
        self.scopes.pop();
        Expr::Fn { params, body: Box::new(body) }
    }

    fn parse_brace_scope(&mut self) -> Expr {
        self.advance();
        self.scopes.push(ScopeKind::Scope);
        let body = self.parse_statements_until(TokenKind::RBrace);
        self.expect(TokenKind::RBrace, "`}`");
        self.scopes.pop();
        Expr::Scope { vars: Vec::new(), body }
    }

    /// `[func arg ...]`, or a recognized `$`-prefixed special form.
    fn parse_bracket_form(&mut self) -> Expr {
        self.advance();
        if self.at(TokenKind::AlphaName) && self.current.text.starts_with('$') {
            return self.parse_special_form();
        }
        let func = self.parse_expr();
        let mut args = Vec::new();
        while !self.at(TokenKind::RBracket) && !self.at(TokenKind::Eoi) {
            args.push(self.parse_expr());
        }
        self.expect(TokenKind::RBracket, "`]`");
        Expr::Call { func: Box::new(func), args }
    }

    fn parse_special_form(&mut self) -> Expr {
        let form = self.current.text.clone();
        self.advance();
        let expr = match form.as_str() {
            "$quote" => {
                let inner = self.parse_expr();
                Expr::Quote(Box::new(inner))
            }
            "$progn" => {
                let mut items = Vec::new();
                while !self.at(TokenKind::RBracket) {
                    items.push(self.parse_expr());
                }
                Expr::Progn(items)
            }
            "$prog1" => {
                let mut items = Vec::new();
                while !self.at(TokenKind::RBracket) {
                    items.push(self.parse_expr());
                }
                Expr::Prog1(items)
            }
            _ => {
                // Any other `$`-form not given dedicated bracket syntax is
                // treated as a call to the special-form symbol itself, so
                // user code can still invoke it reflectively.
                let sym = self.symbols.get_symbol(&form);
                let mut args = Vec::new();
                while !self.at(TokenKind::RBracket) {
                    args.push(self.parse_expr());
                }
                Expr::Call { func: Box::new(Expr::Var(sym)), args }
            }
        };
        self.expect(TokenKind::RBracket, "`]`");
        expr
    }

    // ---- #syntax / #loanword definitions ------------------------------

    /// Parses a `#syntax CLASS: term term ... => template` definition and
    /// registers it with the parser's syntax table. Exposed so the evaluator
    /// can also register syntax defined through `Eval` at runtime if needed.
    pub fn parse_syntax_definition(&mut self) {
        self.advance(); // `#syntax`
        let class_name = self.symbols.get_symbol(&self.current.text.clone());
        self.advance();
        self.expect(TokenKind::Colon, "`:`");
        let mut pattern = Vec::new();
        while !self.at_punct("=>") {
            if self.at(TokenKind::LBracket) {
                self.advance();
                let class = self.symbols.get_symbol(&self.current.text.clone());
                self.advance();
                let name = self.symbols.get_symbol(&self.current.text.clone());
                self.advance();
                self.expect(TokenKind::RBracket, "`]`");
                pattern.push(PatternElem::Nonterminal { class, name });
            } else {
                let sym = self.symbols.get_symbol(&self.current.text.clone());
                self.advance();
                pattern.push(PatternElem::Terminal(sym));
            }
        }
        self.advance(); // `=>`
        let template = self.parse_expr();
        self.syntax.define_rule(class_name, SyntaxRule { pattern, template: Box::new(template) });
    }

    /// Parses a `#loanword name: /regex/flags => template` definition.
    pub fn parse_loanword_definition(&mut self) {
        self.advance(); // `#loanword`
        let name = self.symbols.get_symbol(&self.current.text.clone());
        self.advance();
        self.expect(TokenKind::Colon, "`:`");
        let (pattern, flags) = match &self.current.data {
            TokenData::Regex { pattern, flags } => (pattern.clone(), flags.clone()),
            _ => (String::new(), String::new()),
        };
        self.advance();
        let regex = regex::RegexBuilder::new(&pattern)
            .case_insensitive(flags.contains('i'))
            .build()
            .unwrap_or_else(|_| regex::Regex::new("$^").unwrap());
        self.expect(TokenKind::PunctName, "`=>`");
        let template = self.parse_expr();
        let capture_names: Vec<String> =
            regex.capture_names().enumerate().map(|(i, n)| n.map_or_else(|| i.to_string(), String::from)).collect();
        self.loanwords.define(Loanword { name, regex, template: Box::new(template), capture_names });
    }

    /// Applies a custom `#name` loanword invocation (design note §4.3 "User
    /// loanword rules"): looks `name` up in the lexically-scoped loanword
    /// table, matches its regex against the raw input right here, binds
    /// each capture as `$0`, `$1`, ... by position or `$name` for a named
    /// group, and substitutes those bindings into the rule's template.
    fn parse_loanword_invocation(&mut self) -> Expr {
        let name_text = self.current.text.clone();
        let name = self.symbols.get_symbol(&name_text);
        let Some(loanword) = self.loanwords.get(name).cloned() else {
            self.error(format!("unknown loanword `#{name_text}`"));
            self.advance();
            return Expr::Literal(Value::Null);
        };
        let Some(captures) = self.lexer.match_loanword_regex(&loanword.regex) else {
            self.error(format!("loanword `#{name_text}` did not match its regex against the following input"));
            self.advance();
            return Expr::Literal(Value::Null);
        };
        let bindings: Vec<(Symbol, Expr)> = captures
            .into_iter()
            .enumerate()
            .map(|(index, (capture_name, text))| {
                let key = capture_name.map_or_else(|| format!("${index}"), |n| format!("${n}"));
                (self.symbols.get_symbol(&key), Expr::StringLiteral(text))
            })
            .collect();
        // `self.current` still holds the already-consumed `#name` token; the
        // lexer's raw position has moved past the regex match, so the next
        // `advance()` produces the first real token following it.
        self.advance();
        substitute_template(&loanword.template, &bindings)
    }
}

/// Replaces every `Expr::Var` in `template` that names one of `bindings`
/// with the parsed subtree bound to it (design note §4.3 "apply user syntax").
/// Other node kinds are walked recursively so a binding nested inside e.g.
/// an `If` or `Call` template still substitutes correctly.
fn substitute_template(template: &Expr, bindings: &[(Symbol, Expr)]) -> Expr {
    let lookup = |sym: Symbol| bindings.iter().find(|(s, _)| *s == sym).map(|(_, e)| e.clone());
    match template {
        Expr::Var(sym) => lookup(*sym).unwrap_or_else(|| Expr::Var(*sym)),
        Expr::Call { func, args } => Expr::Call {
            func: Box::new(substitute_template(func, bindings)),
            args: args.iter().map(|a| substitute_template(a, bindings)).collect(),
        },
        Expr::If { cond, then_branch, else_branch } => Expr::If {
            cond: Box::new(substitute_template(cond, bindings)),
            then_branch: Box::new(substitute_template(then_branch, bindings)),
            else_branch: else_branch.as_ref().map(|e| Box::new(substitute_template(e, bindings))),
        },
        Expr::Progn(items) => Expr::Progn(items.iter().map(|i| substitute_template(i, bindings)).collect()),
        Expr::Set { target, value } => Expr::Set {
            target: Box::new(substitute_template(target, bindings)),
            value: Box::new(substitute_template(value, bindings)),
        },
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> (Expr, Vec<ParseMessage>, SymbolTable) {
        let mut symbols = SymbolTable::new();
        let (expr, _exports, messages) = parse_program(src, "test.sm", &mut symbols);
        (expr, messages, symbols)
    }

    #[test]
    fn parses_arithmetic_with_precedence() {
        let (expr, messages, symbols) = parse("1 + 2 * 3;");
        assert!(messages.is_empty(), "{messages:?}");
        let Expr::Progn(stmts) = expr else { panic!("expected progn") };
        let Expr::Call { func, args } = &stmts[0] else { panic!("expected call") };
        let Expr::Var(sym) = func.as_ref() else { panic!("expected var") };
        assert_eq!(symbols.get_name(*sym), "+");
        assert!(matches!(&args[1], Expr::Call { .. }));
    }

    #[test]
    fn parses_function_literal_and_call() {
        let (expr, messages, _symbols) = parse("var add = |x y| x + y; add 1 2;");
        assert!(messages.is_empty(), "{messages:?}");
        let Expr::Progn(stmts) = expr else { panic!("expected progn") };
        assert!(matches!(stmts[0], Expr::Scope { .. }));
        assert!(matches!(stmts[1], Expr::Call { .. }));
    }

    #[test]
    fn parses_try_catch() {
        let (expr, messages, _symbols) = parse("try { 1 / 0 } catch e { e };");
        assert!(messages.is_empty(), "{messages:?}");
        let Expr::Progn(stmts) = expr else { panic!("expected progn") };
        assert!(matches!(stmts[0], Expr::Catch { .. }));
    }

    #[test]
    fn parses_if_unless_keywords() {
        let (expr, messages, _symbols) = parse("if true then 1 else 2;");
        assert!(messages.is_empty(), "{messages:?}");
        let Expr::Progn(stmts) = expr else { panic!("expected progn") };
        assert!(matches!(stmts[0], Expr::If { .. }));
    }

    #[test]
    fn interpolated_string_lowers_to_string_concat_call() {
        let (expr, messages, symbols) = parse(r#""count: {n + 1} items""#);
        assert!(messages.is_empty(), "{messages:?}");
        let Expr::Progn(stmts) = expr else { panic!("expected progn") };
        let Expr::Call { func, args } = &stmts[0] else { panic!("expected call, got {:?}", stmts[0]) };
        let Expr::Var(sym) = func.as_ref() else { panic!("expected var") };
        assert_eq!(symbols.get_name(*sym), "string-concat");
        assert_eq!(args.len(), 3);
        assert!(matches!(&args[0], Expr::StringLiteral(s) if s == "count: "));
        assert!(matches!(&args[1], Expr::Call { .. }));
        assert!(matches!(&args[2], Expr::StringLiteral(s) if s == " items"));
    }

    #[test]
    fn plain_string_does_not_become_a_concat_call() {
        let (expr, messages, _symbols) = parse(r#""hello""#);
        assert!(messages.is_empty(), "{messages:?}");
        let Expr::Progn(stmts) = expr else { panic!("expected progn") };
        assert!(matches!(&stmts[0], Expr::StringLiteral(s) if s == "hello"));
    }

    #[test]
    fn applies_a_custom_loanword_rule() {
        let (expr, messages, symbols) =
            parse("#loanword hex: #/[0-9A-Fa-f]+/ => to-int $0 16;\n#hex\nFF");
        assert!(messages.is_empty(), "{messages:?}");
        let Expr::Progn(stmts) = expr else { panic!("expected progn") };
        let Expr::Call { func, args } = &stmts[0] else { panic!("expected call, got {:?}", stmts[0]) };
        let Expr::Var(sym) = func.as_ref() else { panic!("expected var") };
        assert_eq!(symbols.get_name(*sym), "to-int");
        assert!(matches!(&args[0], Expr::StringLiteral(s) if s == "FF"));
        assert!(matches!(&args[1], Expr::Literal(Value::Int32(16))));
    }

    #[test]
    fn unknown_loanword_is_a_parse_error() {
        let (_, messages, _symbols) = parse("#nope\nwhatever");
        assert!(!messages.is_empty());
    }

    #[test]
    fn applies_a_user_defined_syntax_rule() {
        let mut symbols = SymbolTable::new();
        let filename = symbols.get_symbol("test.sm");
        let mut parser = Parser::new(b"twice 5", filename, &mut symbols);
        let stmt = parser.symbols.get_symbol("STMT");
        let twice = parser.symbols.get_symbol("twice");
        let n = parser.symbols.get_symbol("n");
        let star = parser.symbols.get_symbol("*");
        parser.syntax.define_rule(
            stmt,
            SyntaxRule {
                pattern: vec![
                    PatternElem::Terminal(twice),
                    PatternElem::Nonterminal { class: parser.sym("EXPR"), name: n },
                ],
                template: Box::new(Expr::Call {
                    func: Box::new(Expr::Var(star)),
                    args: vec![Expr::Literal(Value::Int32(2)), Expr::Var(n)],
                }),
            },
        );
        parser.advance();
        let body = parser.parse_statements_until(TokenKind::Eoi);
        assert!(parser.messages.is_empty(), "{:?}", parser.messages);
        let Expr::Call { func, args } = &body[0] else { panic!("expected call, got {:?}", body[0]) };
        let Expr::Var(sym) = func.as_ref() else { panic!("expected var") };
        assert_eq!(*sym, star);
        assert!(matches!(args[0], Expr::Literal(Value::Int32(2))));
        assert!(matches!(args[1], Expr::Literal(Value::Int32(5))));
    }
}
