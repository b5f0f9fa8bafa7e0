use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::debug;

use super::RateCache;
use crate::errors::CacheResult;
use crate::schema::Quote;

/// Both lookup paths for one instrument, stored under a single map key
/// so a mutation never leaves one path dangling.
#[derive(Debug, Clone)]
struct Slot {
    resolved: Quote,
    sources: HashMap<String, Quote>,
}

/// In-process cache backend.
///
/// DESIGN NOTES:
/// - One `DashMap` shard lock guards each instrument's slot
/// - Never fails; every method returns `Ok`
#[derive(Default)]
pub struct LocalRateCache {
    slots: DashMap<String, Slot>,
}

impl LocalRateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[async_trait]
impl RateCache for LocalRateCache {
    async fn put(&self, quote: &Quote) -> CacheResult<()> {
        let platform = quote.source_platform.clone();

        match self.slots.entry(quote.instrument_name.clone()) {
            Entry::Occupied(mut slot) => {
                let slot = slot.get_mut();
                slot.resolved = quote.clone();
                if !platform.is_empty() {
                    slot.sources.insert(platform, quote.clone());
                }
            }
            Entry::Vacant(vacant) => {
                let mut sources = HashMap::new();
                if !platform.is_empty() {
                    sources.insert(platform, quote.clone());
                }
                vacant.insert(Slot {
                    resolved: quote.clone(),
                    sources,
                });
            }
        }

        debug!("Cached {}", quote);
        Ok(())
    }

    async fn get(&self, instrument: &str) -> CacheResult<Option<Quote>> {
        Ok(self.slots.get(instrument).map(|slot| slot.resolved.clone()))
    }

    async fn get_from(&self, platform: &str, instrument: &str) -> CacheResult<Option<Quote>> {
        Ok(self
            .slots
            .get(instrument)
            .and_then(|slot| slot.sources.get(platform).cloned()))
    }

    async fn remove(&self, instrument: &str) -> CacheResult<bool> {
        Ok(self.slots.remove(instrument).is_some())
    }

    async fn remove_from(&self, platform: &str, instrument: &str) -> CacheResult<bool> {
        let Entry::Occupied(mut entry) = self.slots.entry(instrument.to_string()) else {
            return Ok(false);
        };

        let slot = entry.get_mut();
        if slot.sources.remove(platform).is_none() {
            return Ok(false);
        }

        // the resolved value stays while any platform still reports
        if slot.sources.is_empty() && slot.resolved.source_platform == platform {
            entry.remove();
        }

        debug!("Removed {} from platform {}", instrument, platform);
        Ok(true)
    }

    async fn instrument_names(&self) -> CacheResult<BTreeSet<String>> {
        Ok(self.slots.iter().map(|slot| slot.key().clone()).collect())
    }

    async fn clear(&self) -> CacheResult<()> {
        self.slots.clear();
        Ok(())
    }
}
