//! Statically compiled cross-rate formulas, selected by key.

use std::collections::HashMap;

use crate::schema::Quote;

/// A native formula: `(bid, ask)` from the dependency quotes,
/// or `None` when an input is missing.
pub type NativeFn = fn(&HashMap<String, Quote>) -> Option<(f64, f64)>;

/// Resolves a native formula by key.
pub fn native(key: &str) -> Option<NativeFn> {
    match key {
        "USDTRY" => Some(usdtry),
        "EURTRY" => Some(eurtry),
        "GBPTRY" => Some(gbptry),
        _ => None,
    }
}

pub fn is_builtin(key: &str) -> bool {
    native(key).is_some()
}

fn pair<'a>(
    deps: &'a HashMap<String, Quote>,
    first: &str,
    second: &str,
) -> Option<(&'a Quote, &'a Quote)> {
    Some((deps.get(first)?, deps.get(second)?))
}

fn mean(a: f64, b: f64) -> f64 {
    (a + b) / 2.0
}

// USDTRY = mean of both feeds, bid and ask independently
fn usdtry(deps: &HashMap<String, Quote>) -> Option<(f64, f64)> {
    let (pf1, pf2) = pair(deps, "PF1_USDTRY", "PF2_USDTRY")?;

    Some((mean(pf1.bid, pf2.bid), mean(pf1.ask, pf2.ask)))
}

// XXXTRY = mean USDTRY mid * mean XXXUSD side
fn via_usd(deps: &HashMap<String, Quote>, base: &str) -> Option<(f64, f64)> {
    let (usd1, usd2) = pair(deps, "PF1_USDTRY", "PF2_USDTRY")?;
    let (x1, x2) = pair(deps, &format!("PF1_{}USD", base), &format!("PF2_{}USD", base))?;

    let usd_mid = mean(usd1.mid(), usd2.mid());

    Some((usd_mid * mean(x1.bid, x2.bid), usd_mid * mean(x1.ask, x2.ask)))
}

fn eurtry(deps: &HashMap<String, Quote>) -> Option<(f64, f64)> {
    via_usd(deps, "EUR")
}

fn gbptry(deps: &HashMap<String, Quote>) -> Option<(f64, f64)> {
    via_usd(deps, "GBP")
}
