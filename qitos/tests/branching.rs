//! Branch decisions resolved through the engine: selector default, search
//! adapters and backtracking.

mod common;

use serde_json::{json, Map};

use common::{add_action, registry_with_add, ScriptedAgent};
use qitos::{
    Decision, DynamicTreeSearch, Engine, GreedySearch, RuntimeBudget, Search, StateSchema,
    StopReason,
};

fn scored(decision: Decision, score: f64) -> Decision {
    let mut meta = Map::new();
    meta.insert("score".into(), json!(score));
    decision.with_meta(meta)
}

/// With no search configured, the default selector executes the first
/// candidate.
#[tokio::test]
async fn branch_defaults_to_first_candidate() {
    let branch = Decision::branch(vec![
        Decision::final_answer("first"),
        Decision::final_answer("second"),
    ]);
    let agent = ScriptedAgent::new(vec![Some(branch)]);

    let mut engine = Engine::new(agent).with_budget(RuntimeBudget::with_max_steps(3));
    let result = engine.run("pick one").await.unwrap();

    assert_eq!(result.final_result(), Some("first"));
    assert_eq!(result.state.base.stop_reason, Some(StopReason::Final));
}

/// Greedy search selects the best-scored candidate instead.
#[tokio::test]
async fn branch_with_greedy_search() {
    let branch = Decision::branch(vec![
        scored(Decision::final_answer("weak"), 0.1),
        scored(Decision::act(vec![add_action(40, 2)]), 0.9),
        scored(Decision::final_answer("mid"), 0.5),
    ]);
    let agent = ScriptedAgent::new(vec![Some(branch), Some(Decision::final_answer("42"))])
        .with_registry(registry_with_add());

    let mut engine = Engine::new(agent)
        .with_budget(RuntimeBudget::with_max_steps(5))
        .with_search(Box::new(GreedySearch::new(Some(2))));
    let result = engine.run("search").await.unwrap();

    // The act candidate won step 0; its result is in the record.
    assert_eq!(result.records[0].action_results, vec![json!(42)]);
    assert_eq!(result.final_result(), Some("42"));
}

/// A search whose prune empties the candidate set backtracks and yields a
/// wait decision for the step.
#[tokio::test]
async fn branch_backtrack_yields_wait() {
    struct PruneAll;

    impl Search for PruneAll {
        fn expand(
            &mut self,
            _state: &StateSchema,
            _obs: &serde_json::Value,
            seed: &Decision,
        ) -> Vec<Decision> {
            seed.candidates().to_vec()
        }

        fn score(
            &self,
            _state: &StateSchema,
            _obs: &serde_json::Value,
            candidates: &[Decision],
        ) -> Vec<f64> {
            vec![0.0; candidates.len()]
        }

        fn prune(&mut self, _candidates: Vec<Decision>, _scores: &[f64]) -> Vec<Decision> {
            Vec::new()
        }

        fn select(&self, _candidates: &[Decision], _scores: &[f64]) -> Option<Decision> {
            None
        }

        fn backtrack(&self, state: &mut StateSchema) {
            state.metadata.insert("backtracked".into(), json!(true));
        }
    }

    let branch = Decision::branch(vec![Decision::final_answer("unreachable")]);
    let agent = ScriptedAgent::new(vec![Some(branch), Some(Decision::final_answer("after"))]);

    let mut engine = Engine::new(agent)
        .with_budget(RuntimeBudget::with_max_steps(5))
        .with_search(Box::new(PruneAll));
    let result = engine.run("dead end").await.unwrap();

    assert_eq!(result.final_result(), Some("after"));
    assert_eq!(result.state.base.metadata["backtracked"], json!(true));
    let step0 = result.records[0].decision.as_ref().unwrap();
    assert_eq!(step0.mode(), "wait");
    assert_eq!(step0.rationale(), Some("search backtrack"));
}

/// Dynamic tree search records visit counts in state metadata as branches
/// resolve across steps.
#[tokio::test]
async fn tree_search_tracks_visits() {
    let candidate = scored(Decision::act(vec![add_action(1, 1)]), 0.9);
    let branch = || {
        Decision::branch(vec![
            candidate.clone(),
            scored(Decision::act(vec![add_action(2, 2)]), 0.2),
        ])
    };
    let agent = ScriptedAgent::new(vec![
        Some(branch()),
        Some(branch()),
        Some(Decision::final_answer("done")),
    ])
    .with_registry(registry_with_add());

    let mut engine = Engine::new(agent)
        .with_budget(RuntimeBudget::with_max_steps(5))
        .with_search(Box::new(DynamicTreeSearch::new(1, 8, 0.25)));
    let result = engine.run("explore").await.unwrap();

    assert_eq!(result.final_result(), Some("done"));
    let visits = result.state.base.metadata["tree_visits"].as_object().unwrap();
    let total: u64 = visits.values().filter_map(|count| count.as_u64()).sum();
    assert_eq!(total, 2);
    assert_eq!(result.state.base.metadata["tree_backtrack"], json!(false));
}
