//! Module system (design note §4.6).
//!
//! Grounded on `original_source/smilelib/src/env/modules.c`'s
//! `ModuleInfo`/`ModuleInfo_Register`/`ModuleInfo_InitForReal`/
//! `ModuleInfo_GetExposedValue` quartet. The C original keeps a process-wide
//! `ModuleArray` indexed by a monotonically increasing id plus a
//! `StringDict` from name to `ModuleInfo`, and precomputes a module's export
//! `VarDict` from its parsed `ParseScope` *before* ever evaluating it, so a
//! dependent module can compile references to these exports without forcing
//! evaluation. Here that two-step split — "parse scope knows the export
//! names" vs. "evaluating the module supplies their values" — is kept
//! exactly (see `parser::parse_program`'s third return value and
//! `compiler::Compiler::at_module_top_level`), but the process-wide
//! singleton registry is replaced with an explicitly owned
//! [`ModuleRegistry`], per design note §9's note that ambient global state
//! should become explicitly passed context in a target-language port.

use crate::compiler::Compiler;
use crate::error::{EvalResult, ParseMessage};
use crate::intern::{Symbol, SymbolTable};
use crate::parser::ast::Expr;
use crate::resource::ResourceTracker;
use crate::value::Value;

/// One loaded module: its parsed body, the names it exposes, and (once
/// evaluated) the cached result. Mirrors `ModuleInfoStruct` from
/// `modules.c`, minus the GC-managed `SmileObject expr` / `ParseScope`
/// pointers, which become owned Rust values here.
pub struct ModuleInfo {
    id: u32,
    name: String,
    body: Expr,
    /// Names declared `var`/`const` at this module's top level
    /// (design note §4.6), known from parsing alone, before any evaluation.
    exported_names: Vec<Symbol>,
    parse_messages: Vec<ParseMessage>,
    /// Set once `init_for_real` has run this module's top-level `Progn` to
    /// completion; `None` means "not yet evaluated".
    result: Option<EvalResult>,
    /// The evaluated module's bindings, used by `exported_value` once
    /// `result` is `Some(EvalResult::Ok { .. })`.
    exported_values: Option<indexmap::IndexMap<Symbol, Value>>,
}

impl ModuleInfo {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether parsing produced at least one `Error`/`Fatal` diagnostic
    /// (design note §4.6's `loadedSuccessfully`).
    #[must_use]
    pub fn loaded_successfully(&self) -> bool {
        !self
            .parse_messages
            .iter()
            .any(|m| matches!(m.severity, crate::error::Severity::Error | crate::error::Severity::Fatal))
    }

    #[must_use]
    pub fn parse_messages(&self) -> &[ParseMessage] {
        &self.parse_messages
    }

    /// `ModuleInfo_GetExposedSymbols`: the names this module exports,
    /// known without evaluating it.
    #[must_use]
    pub fn exposed_symbols(&self) -> &[Symbol] {
        &self.exported_names
    }

    /// `ModuleInfo_IsExposedSymbol`.
    #[must_use]
    pub fn is_exposed_symbol(&self, symbol: Symbol) -> bool {
        self.exported_names.contains(&symbol)
    }

    /// Guarantees this module has been evaluated exactly once
    /// (`ModuleInfo_InitForReal`): the first call runs it to completion and
    /// caches the result; every later call returns the cached `EvalResult`
    /// without re-running any side effects.
    pub fn init_for_real<T: ResourceTracker>(&mut self, symbols: &mut SymbolTable, tracker: T) -> EvalResult {
        if let Some(cached) = &self.result {
            return cached.clone();
        }

        if !self.loaded_successfully() {
            let result = EvalResult::ParseErrors(self.parse_messages.clone());
            self.result = Some(result.clone());
            return result;
        }

        tracing::debug!(module = self.name.as_str(), "evaluating module");
        let compiler = Compiler::new(symbols);
        let (entry, tables) = compiler.compile_program(&self.body);
        let mut evaluator = crate::evaluator::Evaluator::new(tables, std::mem::replace(symbols, SymbolTable::new()), tracker);
        let result = evaluator.eval_entry(entry);
        *symbols = std::mem::replace(evaluator.symbols_mut(), SymbolTable::new());

        if matches!(result, EvalResult::Ok { .. }) {
            self.exported_values = Some(evaluator.global_vars().clone());
        }
        tracing::debug!(module = self.name.as_str(), ok = matches!(result, EvalResult::Ok { .. }), "module evaluated");
        self.result = Some(result.clone());
        result
    }

    /// `ModuleInfo_GetExposedValue`: the value bound to `symbol` in this
    /// module's top-level scope, or `Value::Null` if `symbol` isn't exposed
    /// or the module hasn't been (successfully) evaluated yet.
    #[must_use]
    pub fn exported_value(&self, symbol: Symbol) -> Value {
        if !self.is_exposed_symbol(symbol) {
            return Value::Null;
        }
        self.exported_values
            .as_ref()
            .and_then(|vars| vars.get(&symbol))
            .copied()
            .unwrap_or(Value::Null)
    }
}

/// Owns the set of loaded modules, keyed by name, with a monotonically
/// increasing id assigned at registration (`ModuleInfo_Register`). Not
/// `Sync`; design note §5 notes the module registry "is not safe for concurrent
/// mutation mid-execution".
#[derive(Default)]
pub struct ModuleRegistry {
    by_name: indexmap::IndexMap<String, ModuleInfo>,
    next_id: u32,
}

impl ModuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: indexmap::IndexMap::new(),
            next_id: 1,
        }
    }

    /// Parses `source` and registers it under `name`. Panics if `name` is
    /// already registered, matching `ModuleInfo_Register`'s
    /// `Smile_Abort_FatalError` on duplicate registration — this is a
    /// host/build-time programming error, not a recoverable runtime one.
    pub fn register(&mut self, name: impl Into<String>, source: &str, symbols: &mut SymbolTable) -> u32 {
        let name = name.into();
        assert!(!self.by_name.contains_key(&name), "cannot register duplicate module \"{name}\"");

        let filename = format!("<module {name}>");
        let (body, exported_names, parse_messages) = crate::parser::parse_program(source, &filename, symbols);
        tracing::debug!(module = name.as_str(), exports = exported_names.len(), "module registered");

        let id = self.next_id;
        self.next_id += 1;
        self.by_name.insert(
            name.clone(),
            ModuleInfo {
                id,
                name,
                body,
                exported_names,
                parse_messages,
                result: None,
                exported_values: None,
            },
        );
        id
    }

    /// `ModuleInfo_Unregister`.
    pub fn unregister(&mut self, name: &str) {
        self.by_name.shift_remove(name);
    }

    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<&ModuleInfo> {
        self.by_name.get(name)
    }

    pub fn get_by_name_mut(&mut self, name: &str) -> Option<&mut ModuleInfo> {
        self.by_name.get_mut(name)
    }

    /// `ModuleInfo_GetModuleById`, O(1) as the original documents — but over
    /// an `IndexMap` rather than a raw id-indexed array, since our ids are
    /// not guaranteed contiguous once modules are unregistered.
    #[must_use]
    pub fn get_by_id(&self, id: u32) -> Option<&ModuleInfo> {
        self.by_name.values().find(|m| m.id == id)
    }

    /// `ModuleInfo_GetAllModules`.
    pub fn all_modules(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.by_name.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NO_LIMIT_TRACKER;

    #[test]
    fn registers_and_evaluates_a_module_exactly_once() {
        let mut symbols = SymbolTable::new();
        let mut registry = ModuleRegistry::new();
        registry.register("counter", "var calls = 0\ncalls = calls + 1\ncalls", &mut symbols);

        let module = registry.get_by_name_mut("counter").unwrap();
        let first = module.init_for_real(&mut symbols, NO_LIMIT_TRACKER);
        let second = module.init_for_real(&mut symbols, NO_LIMIT_TRACKER);

        match (first, second) {
            (EvalResult::Ok { value: a }, EvalResult::Ok { value: b }) => {
                assert_eq!(a, Value::Int64(1));
                assert_eq!(b, Value::Int64(1), "second init_for_real must return the cached result, not re-run");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn exposes_top_level_var_and_const_but_not_locals() {
        let mut symbols = SymbolTable::new();
        let mut registry = ModuleRegistry::new();
        registry.register(
            "lib",
            "var exported = 42\nconst also_exported = 99\n{ var hidden = 7\n hidden }",
            &mut symbols,
        );

        let module = registry.get_by_name_mut("lib").unwrap();
        module.init_for_real(&mut symbols, NO_LIMIT_TRACKER);

        let exported = symbols.get_symbol("exported");
        let also_exported = symbols.get_symbol("also_exported");
        let hidden = symbols.get_symbol("hidden");

        assert!(module.is_exposed_symbol(exported));
        assert!(module.is_exposed_symbol(also_exported));
        assert!(!module.is_exposed_symbol(hidden), "braced-block locals are not module exports");
        assert_eq!(module.exported_value(exported), Value::Int64(42));
        assert_eq!(module.exported_value(also_exported), Value::Int64(99));
        assert_eq!(module.exported_value(hidden), Value::Null);
    }

    #[test]
    fn registering_a_duplicate_name_panics() {
        let mut symbols = SymbolTable::new();
        let mut registry = ModuleRegistry::new();
        registry.register("dup", "1", &mut symbols);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            registry.register("dup", "2", &mut symbols);
        }));
        assert!(result.is_err());
    }
}
