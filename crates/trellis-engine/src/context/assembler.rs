use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use trellis_core::config::EngineSettings;
use trellis_core::error::Result;
use trellis_core::types::{
    chronological_cmp, recency_cmp, ContextItem, ContextPackage, Scope, SourceBreakdown,
};
use trellis_memory::{ItemFilter, MemoryHub, ScopeKey};

use super::profile::ContextProfile;
use crate::tokens::TokenCounter;

struct Candidate {
    item: ContextItem,
    tokens: usize,
    source: usize,
    chosen: bool,
}

/// Builds budgeted context packages from the memory tiers.
///
/// Assembly is synchronous and never mutates memory, apart from bumping the
/// project store's last-accessed time when a profile reads it.
pub struct ContextAssembler {
    memory: Arc<MemoryHub>,
    counter: Arc<dyn TokenCounter>,
    head_fraction: f64,
    tail_fraction: f64,
}

impl ContextAssembler {
    pub fn new(memory: Arc<MemoryHub>, counter: Arc<dyn TokenCounter>) -> Self {
        let defaults = EngineSettings::default();
        Self {
            memory,
            counter,
            head_fraction: defaults.head_fraction,
            tail_fraction: defaults.tail_fraction,
        }
    }

    /// Override the head/tail reservation fractions (clamped to `0.0..=1.0`).
    pub fn with_fractions(mut self, head: f64, tail: f64) -> Self {
        self.head_fraction = head.clamp(0.0, 1.0);
        self.tail_fraction = tail.clamp(0.0, 1.0);
        self
    }

    pub fn memory(&self) -> &Arc<MemoryHub> {
        &self.memory
    }

    /// Build the package `key` sees under `profile`. No profile means an empty package.
    pub fn build(
        &self,
        key: &ScopeKey,
        profile: Option<&ContextProfile>,
    ) -> Result<ContextPackage> {
        let profile = match profile {
            Some(p) => p,
            None => return Ok(ContextPackage::empty()),
        };

        let mut candidates = self.gather(key, profile)?;
        let tokens_total: usize = candidates.iter().map(|c| c.tokens).sum();

        if tokens_total <= profile.max_tokens {
            candidates.iter_mut().for_each(|c| c.chosen = true);
        } else {
            self.compress(profile, &mut candidates);
        }

        let mut breakdown: Vec<SourceBreakdown> = profile
            .sources
            .iter()
            .map(|s| SourceBreakdown {
                scope: s.scope,
                candidates: 0,
                selected: 0,
                tokens_used: 0,
            })
            .collect();
        for c in &candidates {
            let entry = &mut breakdown[c.source];
            entry.candidates += 1;
            if c.chosen {
                entry.selected += 1;
                entry.tokens_used += c.tokens;
            }
        }

        let tokens_used: usize = candidates.iter().filter(|c| c.chosen).map(|c| c.tokens).sum();
        let mut items: Vec<ContextItem> = candidates
            .into_iter()
            .filter(|c| c.chosen)
            .map(|c| c.item)
            .collect();
        items.sort_by(|a, b| chronological_cmp(a, b).then_with(|| a.scope.cmp(&b.scope)));

        debug!(
            profile_id = %profile.id,
            task_id = %key.task,
            items = items.len(),
            tokens_used,
            tokens_total,
            "Context assembled"
        );

        Ok(ContextPackage::assembled(
            profile.id.clone(),
            items,
            tokens_used,
            tokens_total,
            breakdown,
        ))
    }

    /// Query every source, newest first within each source. An item reachable
    /// through several sources is attributed to the first.
    fn gather(&self, key: &ScopeKey, profile: &ContextProfile) -> Result<Vec<Candidate>> {
        let mut seen: HashSet<(Scope, String)> = HashSet::new();
        let mut candidates = Vec::new();

        for (idx, source) in profile.sources.iter().enumerate() {
            let filters: Vec<ItemFilter> = source
                .tags
                .as_ref()
                .map(|tags| vec![ItemFilter::TagsAny(tags.clone())])
                .unwrap_or_default();

            let items = self.memory.query(source.scope, key, &filters, None)?;
            if source.scope == Scope::Project {
                self.memory.projects.touch(&key.project)?;
            }

            for item in items {
                if !seen.insert((item.scope, item.id.clone())) {
                    continue;
                }
                let tokens = self.counter.count(&item.content);
                candidates.push(Candidate {
                    item,
                    tokens,
                    source: idx,
                    chosen: false,
                });
            }
        }
        Ok(candidates)
    }

    /// Head/tail compression per source share, then spend whatever the
    /// sources left unused on the remaining items in global recency order.
    fn compress(&self, profile: &ContextProfile, candidates: &mut [Candidate]) {
        let shares = source_shares(profile);
        let mut used = 0;

        for (idx, share) in shares.iter().enumerate() {
            let mut positions: Vec<usize> = candidates
                .iter()
                .enumerate()
                .filter(|(_, c)| c.source == idx)
                .map(|(i, _)| i)
                .collect();
            positions.sort_by(|&a, &b| recency_cmp(&candidates[a].item, &candidates[b].item));
            used += self.select_head_tail(candidates, &positions, *share);
        }

        let mut rest: Vec<usize> = (0..candidates.len())
            .filter(|&i| !candidates[i].chosen)
            .collect();
        rest.sort_by(|&a, &b| {
            recency_cmp(&candidates[a].item, &candidates[b].item)
                .then_with(|| candidates[a].item.scope.cmp(&candidates[b].item.scope))
        });
        for i in rest {
            if used + candidates[i].tokens <= profile.max_tokens {
                candidates[i].chosen = true;
                used += candidates[i].tokens;
            }
        }
    }

    /// Select within one source. `positions` index into `candidates`, newest
    /// first. Returns the tokens spent.
    fn select_head_tail(
        &self,
        candidates: &mut [Candidate],
        positions: &[usize],
        budget: usize,
    ) -> usize {
        let mut used = 0;
        let tail_budget = (budget as f64 * self.tail_fraction).floor() as usize;
        let head_budget = (budget as f64 * self.head_fraction).floor() as usize;

        // Tail: the newest item may use the whole budget, later ones the tail reserve.
        for (rank, &i) in positions.iter().enumerate() {
            let limit = if rank == 0 { budget } else { tail_budget };
            if used + candidates[i].tokens > limit {
                break;
            }
            candidates[i].chosen = true;
            used += candidates[i].tokens;
        }

        // Head: a contiguous run of the oldest items.
        let mut head_used = 0;
        for &i in positions.iter().rev() {
            let tokens = candidates[i].tokens;
            if candidates[i].chosen || head_used + tokens > head_budget || used + tokens > budget {
                break;
            }
            candidates[i].chosen = true;
            used += tokens;
            head_used += tokens;
        }

        // Middle: greedy in recency order, skipping whatever overflows.
        for &i in positions {
            if !candidates[i].chosen && used + candidates[i].tokens <= budget {
                candidates[i].chosen = true;
                used += candidates[i].tokens;
            }
        }

        used
    }
}

/// Split `max_tokens` across sources by weight (default weight 1.0).
fn source_shares(profile: &ContextProfile) -> Vec<usize> {
    let weights: Vec<f64> = profile
        .sources
        .iter()
        .map(|s| s.weight.unwrap_or(1.0))
        .collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return vec![0; weights.len()];
    }
    weights
        .iter()
        .map(|w| (profile.max_tokens as f64 * w / total).floor() as usize)
        .collect()
}
