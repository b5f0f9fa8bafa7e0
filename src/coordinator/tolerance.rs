use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::schema::Quote;

/// Outcome of running a candidate quote through the filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// No prior accepted value for the key.
    First,

    /// Both relative changes are within the threshold.
    Accepted,

    /// The prior value had a zero bid or ask; the change is not checked.
    Unchecked,

    /// Change exceeds the threshold; the prior value stays in force.
    Rejected { bid_change: f64, ask_change: f64 },
}

impl Verdict {
    pub fn is_accepted(self) -> bool {
        !matches!(self, Verdict::Rejected { .. })
    }
}

/// Anomaly gate bounding the relative change between consecutive
/// accepted quotes for the same fully-qualified key.
///
/// DESIGN NOTES:
/// - State per key is the last *accepted* quote only
/// - Check and update happen under the key's entry lock, so two
///   concurrent candidates for one key are judged one after the other
/// - Entries are never removed; the map is bounded by instrument count
pub struct ToleranceFilter {
    threshold: f64,
    accepted: DashMap<String, Quote>,
}

impl ToleranceFilter {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            accepted: DashMap::new(),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Judges `candidate` against the last accepted value for `key` and
    /// records it when accepted.
    pub fn check(&self, key: &str, candidate: &Quote) -> Verdict {
        match self.accepted.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(candidate.clone());
                Verdict::First
            }
            Entry::Occupied(mut occupied) => {
                let previous = occupied.get();

                let verdict = if previous.bid == 0.0 || previous.ask == 0.0 {
                    Verdict::Unchecked
                } else {
                    let bid_change = ((candidate.bid - previous.bid) / previous.bid).abs();
                    let ask_change = ((candidate.ask - previous.ask) / previous.ask).abs();

                    if bid_change <= self.threshold && ask_change <= self.threshold {
                        Verdict::Accepted
                    } else {
                        Verdict::Rejected { bid_change, ask_change }
                    }
                };

                if verdict.is_accepted() {
                    occupied.insert(candidate.clone());
                }

                verdict
            }
        }
    }

    /// Last accepted quote for `key`.
    pub fn last_accepted(&self, key: &str) -> Option<Quote> {
        self.accepted.get(key).map(|q| q.value().clone())
    }
}
