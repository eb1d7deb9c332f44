//! Branch resolution: selectors and search adapters.
//!
//! A `branch` decision carries candidate decisions; before the engine can
//! act, exactly one must win. The default [`BranchSelector`] picks
//! deterministically; a [`Search`] adapter runs the full
//! expand/score/prune/select/backtrack cycle, with [`DynamicTreeSearch`]
//! keeping a bounded frontier of unselected candidates across steps.

use serde_json::{json, Value};

use crate::decision::Decision;
use crate::error::RuntimeError;
use crate::state::StateSchema;

/// Picks one decision out of branch candidates.
pub trait BranchSelector: Send + Sync {
    fn select(
        &self,
        candidates: &[Decision],
        state: &StateSchema,
        observation: &Value,
    ) -> Result<Decision, RuntimeError>;
}

/// Deterministic default: the first candidate wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstCandidateSelector;

impl BranchSelector for FirstCandidateSelector {
    fn select(
        &self,
        candidates: &[Decision],
        _state: &StateSchema,
        _observation: &Value,
    ) -> Result<Decision, RuntimeError> {
        candidates
            .first()
            .cloned()
            .ok_or_else(|| RuntimeError::System("branch selector received empty candidates".into()))
    }
}

/// Search adapter: expand a seed branch into candidates, score, prune,
/// select one, and backtrack state when the candidate set empties.
pub trait Search: Send + Sync {
    fn expand(
        &mut self,
        state: &StateSchema,
        observation: &Value,
        seed: &Decision,
    ) -> Vec<Decision>;

    fn score(
        &self,
        state: &StateSchema,
        observation: &Value,
        candidates: &[Decision],
    ) -> Vec<f64>;

    fn prune(&mut self, candidates: Vec<Decision>, scores: &[f64]) -> Vec<Decision>;

    fn select(&self, candidates: &[Decision], scores: &[f64]) -> Option<Decision>;

    fn backtrack(&self, state: &mut StateSchema);

    /// Called after a candidate wins; adapters may record bookkeeping in
    /// state metadata.
    fn mark_selected(&self, _state: &mut StateSchema, _selected: &Decision) {}
}

fn meta_score(candidate: &Decision, key: &str) -> Option<f64> {
    candidate.meta().get(key).and_then(Value::as_f64)
}

fn rank_desc(candidates: Vec<Decision>, scores: &[f64]) -> Vec<(f64, Decision)> {
    let mut ranked: Vec<(f64, Decision)> = scores
        .iter()
        .copied()
        .zip(candidates)
        .collect();
    ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    ranked
}

fn argmax(scores: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, score) in scores.iter().enumerate() {
        match best {
            Some((_, current)) if *score <= current => {}
            _ => best = Some((idx, *score)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// Greedy adapter: meta score when present, reverse insertion order
/// otherwise; optional top-k pruning; no backtracking state.
pub struct GreedySearch {
    top_k: Option<usize>,
}

impl GreedySearch {
    pub fn new(top_k: Option<usize>) -> Self {
        Self { top_k }
    }
}

impl Search for GreedySearch {
    fn expand(
        &mut self,
        _state: &StateSchema,
        _observation: &Value,
        seed: &Decision,
    ) -> Vec<Decision> {
        seed.candidates().to_vec()
    }

    fn score(
        &self,
        _state: &StateSchema,
        _observation: &Value,
        candidates: &[Decision],
    ) -> Vec<f64> {
        candidates
            .iter()
            .enumerate()
            .map(|(idx, candidate)| {
                meta_score(candidate, "score").unwrap_or((candidates.len() - idx) as f64)
            })
            .collect()
    }

    fn prune(&mut self, candidates: Vec<Decision>, scores: &[f64]) -> Vec<Decision> {
        let ranked = rank_desc(candidates, scores);
        let keep = self.top_k.unwrap_or(ranked.len());
        ranked
            .into_iter()
            .take(keep)
            .map(|(_, candidate)| candidate)
            .collect()
    }

    fn select(&self, candidates: &[Decision], scores: &[f64]) -> Option<Decision> {
        argmax(scores).and_then(|idx| candidates.get(idx).cloned())
    }

    fn backtrack(&self, _state: &mut StateSchema) {}
}

/// Tree-style adapter with a bounded frontier and a novelty bonus
/// `exploration_bonus / (1 + visits)` on top of the base score. Visit counts
/// and frontier size live in state metadata so they survive across steps.
pub struct DynamicTreeSearch {
    top_k: usize,
    max_frontier: usize,
    score_key: String,
    exploration_bonus: f64,
    frontier: Vec<Decision>,
}

impl Default for DynamicTreeSearch {
    fn default() -> Self {
        Self::new(3, 64, 0.25)
    }
}

impl DynamicTreeSearch {
    pub fn new(top_k: usize, max_frontier: usize, exploration_bonus: f64) -> Self {
        Self {
            top_k: top_k.max(1),
            max_frontier,
            score_key: "score".into(),
            exploration_bonus,
            frontier: Vec::new(),
        }
    }

    pub fn frontier_len(&self) -> usize {
        self.frontier.len()
    }

    fn candidate_key(candidate: &Decision, idx: usize) -> String {
        if let Some(id) = candidate.meta().get("id") {
            return id.to_string();
        }
        if let Some(answer) = candidate.final_text() {
            let prefix: String = answer.chars().take(64).collect();
            return format!("final::{prefix}");
        }
        if let Some(action) = candidate.actions().first() {
            let rendered = serde_json::to_string(action).unwrap_or_default();
            let prefix: String = rendered.chars().take(96).collect();
            return format!("act::{prefix}");
        }
        format!("candidate::{idx}")
    }

    fn visit_count(state: &StateSchema, key: &str) -> u64 {
        state
            .metadata
            .get("tree_visits")
            .and_then(Value::as_object)
            .and_then(|visits| visits.get(key))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }
}

impl Search for DynamicTreeSearch {
    fn expand(
        &mut self,
        _state: &StateSchema,
        _observation: &Value,
        seed: &Decision,
    ) -> Vec<Decision> {
        let mut combined = std::mem::take(&mut self.frontier);
        combined.extend(seed.candidates().iter().cloned());
        combined
    }

    fn score(
        &self,
        state: &StateSchema,
        _observation: &Value,
        candidates: &[Decision],
    ) -> Vec<f64> {
        candidates
            .iter()
            .enumerate()
            .map(|(idx, candidate)| {
                let base = meta_score(candidate, &self.score_key)
                    .unwrap_or((candidates.len() - idx) as f64);
                let visits = Self::visit_count(state, &Self::candidate_key(candidate, idx));
                base + self.exploration_bonus / (1.0 + visits as f64)
            })
            .collect()
    }

    fn prune(&mut self, candidates: Vec<Decision>, scores: &[f64]) -> Vec<Decision> {
        let ranked = rank_desc(candidates, scores);
        let mut kept = Vec::new();
        for (idx, (_, candidate)) in ranked.into_iter().enumerate() {
            if idx < self.top_k {
                kept.push(candidate);
            } else if self.frontier.len() < self.max_frontier {
                self.frontier.push(candidate);
            }
        }
        kept
    }

    fn select(&self, candidates: &[Decision], scores: &[f64]) -> Option<Decision> {
        argmax(scores).and_then(|idx| candidates.get(idx).cloned())
    }

    fn backtrack(&self, state: &mut StateSchema) {
        state.metadata.insert("tree_backtrack".into(), json!(true));
        state
            .metadata
            .insert("frontier_size".into(), json!(self.frontier.len()));
    }

    fn mark_selected(&self, state: &mut StateSchema, selected: &Decision) {
        let key = Self::candidate_key(selected, 0);
        let mut visits = state
            .metadata
            .get("tree_visits")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let count = visits.get(&key).and_then(Value::as_u64).unwrap_or(0);
        visits.insert(key, json!(count + 1));
        state.metadata.insert("tree_visits".into(), Value::Object(visits));
        state
            .metadata
            .insert("frontier_size".into(), json!(self.frontier.len()));
        state.metadata.insert("tree_backtrack".into(), json!(false));
    }
}
