//! Derived-rate calculation
//!
//! This module provides:
//! - The `RateCalculator` contract used by the coordinator
//! - A strategy registry keyed by formula language
//! - `DefaultRateCalculator`, preloaded with the native cross rates
//!
//! Formula languages form a closed set resolved at compile time:
//! - `native`: a built-in formula selected by key (see `builtin`)
//! - `expr`:   a sandboxed arithmetic expression (see `expr`)

pub mod builtin;
pub mod expr;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info, warn};

use crate::config::DerivedConfig;
use crate::errors::{ConfigError, FormulaError};
use crate::schema::Quote;
use crate::util;

use expr::ExprFormula;

/// Pure function from a target name plus its inputs to a derived quote.
///
/// CONTRACT:
/// - No cache or network access; all inputs are supplied
/// - Returns `None` when an input is missing or the result is unusable
pub trait RateCalculator: Send + Sync {
    fn calculate(&self, target: &str, deps: &HashMap<String, Quote>) -> Option<Quote>;
}

/// A compiled formula: `(bid, ask)` or `None` when an input is missing.
pub trait Formula: Send + Sync {
    fn evaluate(&self, deps: &HashMap<String, Quote>) -> Option<(f64, f64)>;
}

/// Compiles formula source text of one language.
pub trait FormulaStrategy: Send + Sync {
    fn language(&self) -> &'static str;

    fn compile(&self, source: &str) -> Result<Arc<dyn Formula>, FormulaError>;
}

// ------------------------------------------------------------
// Native strategy
// ------------------------------------------------------------

struct NativeFormula(builtin::NativeFn);

impl Formula for NativeFormula {
    fn evaluate(&self, deps: &HashMap<String, Quote>) -> Option<(f64, f64)> {
        (self.0)(deps)
    }
}

pub struct NativeStrategy;

impl FormulaStrategy for NativeStrategy {
    fn language(&self) -> &'static str {
        "native"
    }

    fn compile(&self, source: &str) -> Result<Arc<dyn Formula>, FormulaError> {
        let key = source.trim();
        builtin::native(key)
            .map(|f| Arc::new(NativeFormula(f)) as Arc<dyn Formula>)
            .ok_or_else(|| FormulaError::UnknownNative(key.to_string()))
    }
}

// ------------------------------------------------------------
// Expression strategy
// ------------------------------------------------------------

impl Formula for ExprFormula {
    fn evaluate(&self, deps: &HashMap<String, Quote>) -> Option<(f64, f64)> {
        ExprFormula::evaluate(self, deps)
    }
}

pub struct ExprStrategy;

impl FormulaStrategy for ExprStrategy {
    fn language(&self) -> &'static str {
        "expr"
    }

    fn compile(&self, source: &str) -> Result<Arc<dyn Formula>, FormulaError> {
        Ok(Arc::new(ExprFormula::parse(source)?))
    }
}

/// Returns every supported formula strategy.
///
/// Keeps strategy registration in one place, the same way
/// connector kinds are resolved in `collector::registry`.
pub fn strategies() -> Vec<Box<dyn FormulaStrategy>> {
    vec![Box::new(NativeStrategy), Box::new(ExprStrategy)]
}

// ------------------------------------------------------------
// Default calculator
// ------------------------------------------------------------

/// Calculator backed by a per-target formula table.
///
/// Starts with native formulas for `USDTRY`, `EURTRY` and `GBPTRY`.
/// Formulas may be replaced or removed at any time; `calculate`
/// always sees a complete formula or none.
pub struct DefaultRateCalculator {
    strategies: HashMap<&'static str, Box<dyn FormulaStrategy>>,
    formulas: DashMap<String, Arc<dyn Formula>>,
}

impl Default for DefaultRateCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultRateCalculator {
    pub fn new() -> Self {
        let calculator = Self::empty();

        for key in ["USDTRY", "EURTRY", "GBPTRY"] {
            if let Some(f) = builtin::native(key) {
                calculator
                    .formulas
                    .insert(key.to_string(), Arc::new(NativeFormula(f)));
            }
        }

        calculator
    }

    /// A calculator with no formulas registered.
    pub fn empty() -> Self {
        Self {
            strategies: strategies()
                .into_iter()
                .map(|s| (s.language(), s))
                .collect(),
            formulas: DashMap::new(),
        }
    }

    /// Compiles `source` with the strategy for `language` and binds it
    /// to `target`, replacing any previous formula.
    pub fn register_formula(
        &self,
        target: &str,
        language: &str,
        source: &str,
    ) -> Result<(), FormulaError> {
        let strategy = self
            .strategies
            .get(language)
            .ok_or_else(|| FormulaError::UnsupportedLanguage(language.to_string()))?;

        let formula = strategy.compile(source)?;
        self.formulas.insert(target.to_string(), formula);

        info!("Registered {} formula for {}", language, target);
        Ok(())
    }

    /// Native formulas plus every configured formula, compiled up front.
    pub fn from_config(derived: &[DerivedConfig]) -> Result<Self, ConfigError> {
        let calculator = Self::new();

        for d in derived {
            let Some(formula) = &d.formula else {
                continue;
            };

            calculator
                .register_formula(&d.name, &formula.language, &formula.source)
                .map_err(|source| ConfigError::Formula {
                    target: d.name.clone(),
                    source,
                })?;
        }

        Ok(calculator)
    }

    pub fn unregister_formula(&self, target: &str) -> bool {
        let removed = self.formulas.remove(target).is_some();
        if removed {
            info!("Unregistered formula for {}", target);
        }
        removed
    }

    pub fn has_formula(&self, target: &str) -> bool {
        self.formulas.contains_key(target)
    }
}

impl RateCalculator for DefaultRateCalculator {
    fn calculate(&self, target: &str, deps: &HashMap<String, Quote>) -> Option<Quote> {
        // clone the Arc so the shard lock is not held during evaluation
        let Some(formula) = self.formulas.get(target).map(|f| f.value().clone()) else {
            warn!("No formula registered for {}", target);
            return None;
        };

        let Some((bid, ask)) = formula.evaluate(deps) else {
            debug!("Missing inputs for {} (have: {:?})", target, deps.keys());
            return None;
        };

        if !bid.is_finite() || !ask.is_finite() {
            warn!("Formula for {} produced non-finite bid={} ask={}", target, bid, ask);
            return None;
        }

        Some(Quote::derived(target, bid, ask, util::now()))
    }
}
