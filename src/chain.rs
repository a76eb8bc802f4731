use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::error::{Result, TapError};
use crate::filter::{Filter, FilterId};
use crate::frame::TaggedFrame;
use crate::rules::{RuleId, RuleTable};
use crate::stats::{CounterSnapshot, Statistics, Verdict};

/// Named list of filters, evaluated in insertion order.
#[derive(Debug)]
pub struct Chain {
    pub name: String,
    filters: Vec<Arc<Filter>>,
}

impl Chain {
    fn new(name: &str) -> Self {
        Chain {
            name: name.to_string(),
            filters: Vec::new(),
        }
    }

    pub fn filters(&self) -> &[Arc<Filter>] {
        &self.filters
    }
}

/// First filter that accepted a frame.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub chain: String,
    pub filter: Arc<Filter>,
}

#[derive(Debug, Clone)]
pub struct FilterSnapshot {
    pub chain: String,
    pub id: FilterId,
    pub description: String,
    pub rule: RuleId,
    pub matches: u64,
    pub counters: CounterSnapshot,
}

/// Owns every chain and classifies frames against them.
///
/// Chains sit behind a single lock that is only held while walking the
/// filters. The matching filter is cloned out before the lock drops, so rule
/// lookup and the action itself run unlocked.
#[derive(Debug)]
pub struct ChainEngine {
    chains: Mutex<Vec<Chain>>,
    rules: Arc<RuleTable>,
    stats: Arc<Statistics>,
}

impl ChainEngine {
    pub fn new(rules: Arc<RuleTable>, stats: Arc<Statistics>) -> Self {
        ChainEngine {
            chains: Mutex::new(Vec::new()),
            rules,
            stats,
        }
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    /// Creates the chain unless it already exists.
    pub fn add_chain(&self, name: &str) -> Result<()> {
        let name = valid_name(name)?;
        let mut chains = self.chains.lock();
        if !chains.iter().any(|c| c.name == name) {
            chains.push(Chain::new(name));
            info!("Added chain '{}'", name);
        }
        Ok(())
    }

    /// Removes the chain together with its filters.
    pub fn remove_chain(&self, name: &str) -> Result<()> {
        let removed = {
            let mut chains = self.chains.lock();
            let pos = chains.iter().position(|c| c.name == name);
            pos.map(|pos| chains.remove(pos))
        };
        match removed {
            Some(chain) => {
                info!("Removed chain '{}' ({} filters)", chain.name, chain.filters.len());
                Ok(())
            }
            None => Err(TapError::not_found("chain", name)),
        }
    }

    /// Drops every filter of a chain but keeps the chain.
    pub fn clear_chain(&self, name: &str) -> Result<()> {
        let drained = {
            let mut chains = self.chains.lock();
            let chain = chains
                .iter_mut()
                .find(|c| c.name == name)
                .ok_or_else(|| TapError::not_found("chain", name))?;
            std::mem::take(&mut chain.filters)
        };
        info!("Cleared chain '{}' ({} filters)", name, drained.len());
        Ok(())
    }

    pub fn clear(&self) {
        let old = std::mem::take(&mut *self.chains.lock());
        info!("Cleared {} chains", old.len());
    }

    /// Adds `filter` to `chain`, creating the chain on first reference.
    ///
    /// The rule must exist. An id already used in the same chain is
    /// replaced in place; an id used by another chain is rejected.
    pub fn add_filter(&self, chain: &str, filter: Filter) -> Result<()> {
        let chain_name = valid_name(chain)?;
        if !self.rules.contains(filter.rule) {
            return Err(TapError::invalid(format!(
                "filter {} references unknown rule {}",
                filter.id, filter.rule
            )));
        }

        let id = filter.id;
        let filter = Arc::new(filter);
        let replaced = {
            let mut chains = self.chains.lock();
            if let Some(other) = chains
                .iter()
                .find(|c| c.name != chain_name && c.filters.iter().any(|f| f.id == id))
            {
                return Err(TapError::invalid(format!(
                    "filter {} already belongs to chain '{}'",
                    id, other.name
                )));
            }

            let pos = match chains.iter().position(|c| c.name == chain_name) {
                Some(pos) => pos,
                None => {
                    chains.push(Chain::new(chain_name));
                    chains.len() - 1
                }
            };
            let filters = &mut chains[pos].filters;
            match filters.iter_mut().find(|f| f.id == id) {
                Some(slot) => Some(std::mem::replace(slot, Arc::clone(&filter))),
                None => {
                    filters.push(Arc::clone(&filter));
                    None
                }
            }
        };

        info!(
            "{} filter {} in chain '{}': {:?} -> rule {}",
            if replaced.is_some() { "Replaced" } else { "Added" },
            id,
            chain_name,
            filter.predicate,
            filter.rule
        );
        Ok(())
    }

    pub fn remove_filter(&self, chain: &str, id: FilterId) -> Result<()> {
        let removed = {
            let mut chains = self.chains.lock();
            let chain = chains
                .iter_mut()
                .find(|c| c.name == chain)
                .ok_or_else(|| TapError::not_found("chain", chain))?;
            let pos = chain
                .filters
                .iter()
                .position(|f| f.id == id)
                .ok_or_else(|| TapError::not_found("filter", id))?;
            chain.filters.remove(pos)
        };
        info!("Removed filter {} from chain '{}'", removed.id, chain);
        Ok(())
    }

    /// Zeroes the statistics of a filter, wherever it lives.
    pub fn reset_statistics(&self, id: FilterId) -> Result<()> {
        let chains = self.chains.lock();
        let filter = chains
            .iter()
            .flat_map(|c| c.filters.iter())
            .find(|f| f.id == id)
            .ok_or_else(|| TapError::not_found("filter", id))?;
        filter.reset();
        Ok(())
    }

    pub fn chain_names(&self) -> Vec<String> {
        self.chains.lock().iter().map(|c| c.name.clone()).collect()
    }

    pub fn snapshot(&self) -> Vec<FilterSnapshot> {
        let chains = self.chains.lock();
        chains
            .iter()
            .flat_map(|c| {
                c.filters.iter().map(move |f| FilterSnapshot {
                    chain: c.name.clone(),
                    id: f.id,
                    description: format!("{:?}", f.predicate),
                    rule: f.rule,
                    matches: f.match_count(),
                    counters: f.counters(),
                })
            })
            .collect()
    }

    /// Finds the first filter, across chains in creation order, whose
    /// predicate accepts `frame`.
    pub fn evaluate(&self, frame: &TaggedFrame) -> Option<MatchResult> {
        let chains = self.chains.lock();
        for chain in chains.iter() {
            if let Some(filter) = chain.filters.iter().find(|f| f.matches(frame)) {
                return Some(MatchResult {
                    chain: chain.name.clone(),
                    filter: Arc::clone(filter),
                });
            }
        }
        None
    }

    /// Classifies `frame` and runs the matched rule. Failures are logged and
    /// counted here; nothing propagates back to the worker.
    pub fn process(&self, frame: &TaggedFrame) -> Verdict {
        let Some(found) = self.evaluate(frame) else {
            debug!("packet {} matched no filter, dropping", frame.header().packet_id);
            self.stats.record(Verdict::Unmatched);
            return Verdict::Unmatched;
        };

        let filter = &found.filter;
        filter.record_match();

        let verdict = match self.rules.get(filter.rule) {
            Some(rule) => match rule.apply(frame, self.rules.listeners()) {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!("filter {} (chain '{}'): {}", filter.id, found.chain, e);
                    Verdict::Failed
                }
            },
            None => {
                warn!("filter {} references missing rule {}", filter.id, filter.rule);
                Verdict::Failed
            }
        };

        filter.record(verdict);
        self.stats.record(verdict);
        verdict
    }
}

fn valid_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(TapError::invalid(format!("bad chain name '{}'", name)));
    }
    Ok(name)
}
