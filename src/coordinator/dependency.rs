use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::errors::ConfigError;

/// Built-in dependency table for the native cross rates.
pub fn builtin_rules() -> BTreeMap<String, BTreeSet<String>> {
    let rule = |target: &str, deps: &[&str]| {
        (
            target.to_string(),
            deps.iter().map(|d| d.to_string()).collect::<BTreeSet<_>>(),
        )
    };

    BTreeMap::from([
        rule("USDTRY", &["PF1_USDTRY", "PF2_USDTRY"]),
        rule("EURTRY", &["PF1_EURUSD", "PF2_EURUSD", "PF1_USDTRY", "PF2_USDTRY"]),
        rule("GBPTRY", &["PF1_GBPUSD", "PF2_GBPUSD", "PF1_USDTRY", "PF2_USDTRY"]),
    ])
}

/// Static dependency graph for derived instruments.
///
/// Built once at startup and read-only afterwards.
///
/// A derived instrument may depend on raw instruments or on other
/// derived instruments; `downstream` returns every affected target in
/// an order where each target follows all of its derived inputs.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    rules: BTreeMap<String, BTreeSet<String>>,

    /// Every derived target, topologically sorted
    order: Vec<String>,

    /// instrument -> derived targets that read it directly
    dependents: HashMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Validates the rule table and precomputes the evaluation order.
    ///
    /// Rejects:
    /// - rules without dependencies
    /// - self-dependencies
    /// - dependency cycles
    pub fn new(rules: BTreeMap<String, BTreeSet<String>>) -> Result<Self, ConfigError> {
        for (target, deps) in &rules {
            if deps.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "derived instrument {} has no dependencies",
                    target
                )));
            }
            if deps.contains(target) {
                return Err(ConfigError::DependencyCycle(target.clone()));
            }
        }

        let mut dependents: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (target, deps) in &rules {
            for dep in deps {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(target.clone());
            }
        }

        let order = topological_order(&rules)?;

        Ok(Self {
            rules,
            order,
            dependents,
        })
    }

    pub fn builtin() -> Self {
        // the built-in table is acyclic
        Self::new(builtin_rules()).unwrap_or_default()
    }

    pub fn dependencies(&self, target: &str) -> Option<&BTreeSet<String>> {
        self.rules.get(target)
    }

    pub fn is_derived(&self, instrument: &str) -> bool {
        self.rules.contains_key(instrument)
    }

    /// Every derived target, dependencies first.
    pub fn targets(&self) -> &[String] {
        &self.order
    }

    /// Derived targets affected (directly or transitively) by a change
    /// of `instrument`, in evaluation order.
    pub fn downstream(&self, instrument: &str) -> Vec<String> {
        let mut affected = BTreeSet::new();
        let mut stack = vec![instrument];

        while let Some(current) = stack.pop() {
            if let Some(targets) = self.dependents.get(current) {
                for t in targets {
                    if affected.insert(t.as_str()) {
                        stack.push(t.as_str());
                    }
                }
            }
        }

        self.order
            .iter()
            .filter(|t| affected.contains(t.as_str()))
            .cloned()
            .collect()
    }
}

// Kahn's algorithm restricted to derived targets; raw inputs have no
// rule and are treated as already available.
fn topological_order(rules: &BTreeMap<String, BTreeSet<String>>) -> Result<Vec<String>, ConfigError> {
    let mut pending: BTreeMap<&str, usize> = rules
        .iter()
        .map(|(target, deps)| {
            let derived_inputs = deps.iter().filter(|d| rules.contains_key(*d)).count();
            (target.as_str(), derived_inputs)
        })
        .collect();

    let mut ready: Vec<&str> = pending
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(t, _)| *t)
        .collect();

    let mut order = Vec::with_capacity(rules.len());

    while let Some(target) = ready.pop() {
        order.push(target.to_string());

        for (other, deps) in rules {
            if deps.contains(target) {
                if let Some(n) = pending.get_mut(other.as_str()) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push(other.as_str());
                    }
                }
            }
        }
    }

    if order.len() != rules.len() {
        let stuck = pending
            .iter()
            .find(|(_, n)| **n > 0)
            .map(|(t, _)| t.to_string())
            .unwrap_or_default();
        return Err(ConfigError::DependencyCycle(stuck));
    }

    Ok(order)
}
