//! Stateless engine variant
//!
//! Treats every operation as a pure function `(state, event) -> (state,
//! emitted work items, lifecycle delta)`. Persistence is the caller's
//! responsibility, and callers serialise events per case. Sub-cases live
//! inside the state blob, so the whole case tree travels with it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::case::{Case, CaseId, CaseLifecycle, ParentLink};
use crate::config::EngineConfig;
use crate::error::{WorkflowError, WorkflowResult};
use crate::events::{EventKind, ExternalEvent, LifecycleEvent};
use crate::item::WorkItem;
use crate::runner::NetRunner;
use crate::spec::types::{Specification, SpecificationId};
use crate::spec::SpecCache;

/// The caller-held state: the root case and every live or settled sub-case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatelessState {
    /// Root case id
    pub root: CaseId,
    /// All cases in the tree, root included
    pub cases: BTreeMap<CaseId, Case>,
}

impl StatelessState {
    /// Decode from caller-held bytes
    pub fn decode(bytes: &[u8]) -> WorkflowResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| WorkflowError::StatePersistence(e.to_string()))
    }

    /// Encode for the caller to hold
    pub fn encode(&self) -> WorkflowResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| WorkflowError::StatePersistence(e.to_string()))
    }

    /// The root case
    pub fn root_case(&self) -> WorkflowResult<&Case> {
        self.cases
            .get(&self.root)
            .ok_or_else(|| WorkflowError::InvariantBroken("root case missing from state".to_string()))
    }
}

/// Result of one stateless operation
#[derive(Debug)]
pub struct StatelessOutcome {
    /// The new state, to be persisted by the caller
    pub state: Vec<u8>,
    /// Root-case lifecycle after the operation
    pub lifecycle: CaseLifecycle,
    /// Work items that became Enabled during the operation
    pub emitted_items: Vec<WorkItem>,
    /// Lifecycle notifications, in order
    pub notifications: Vec<LifecycleEvent>,
}

enum Work {
    Launch,
    Event(ExternalEvent),
    SubTerminal { child: CaseId },
}

/// The stateless variant: no owned case state, no allocator, no log
pub struct StatelessEngine {
    specs: Arc<SpecCache>,
    config: EngineConfig,
}

impl StatelessEngine {
    /// Create over a shared specification cache
    pub fn new(specs: Arc<SpecCache>, config: EngineConfig) -> Self {
        Self { specs, config }
    }

    fn runner<'a>(&self, spec: &'a Specification) -> NetRunner<'a> {
        NetRunner::new(
            spec,
            self.config.lease_default_ttl_ms,
            self.config.max_attempts,
        )
    }

    /// Launch a new case tree; returns the root id and the initial state
    pub fn launch(
        &self,
        spec_id: &SpecificationId,
        data: serde_json::Value,
        selection_reason: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> WorkflowResult<(CaseId, StatelessOutcome)> {
        let spec = self.specs.resolve(spec_id)?;
        let net = spec
            .get_net(&spec.root_net)
            .ok_or_else(|| WorkflowError::InvariantBroken("root net vanished".to_string()))?;
        let mut case =
            Case::new(spec.id.clone(), &spec.root_net, &net.input_condition, data, now);
        case.engine_used = Some(crate::spec::PreferredEngine::Stateless);
        case.selection_reason = Some(selection_reason.to_string());
        let root = case.id;

        let mut state = StatelessState {
            root,
            cases: BTreeMap::new(),
        };
        state.cases.insert(root, case);

        let outcome = self.run(&spec, state, VecDeque::from([(root, Work::Launch)]), now)?;
        Ok((root, outcome))
    }

    /// Apply one event to caller-held state
    pub fn apply(
        &self,
        state_bytes: &[u8],
        event: &ExternalEvent,
        now: chrono::DateTime<chrono::Utc>,
    ) -> WorkflowResult<StatelessOutcome> {
        let state = StatelessState::decode(state_bytes)?;
        let spec = self.specs.resolve(&state.root_case()?.spec_id)?;
        let target = self.route_event(&state, &event.kind)?;
        self.run(
            &spec,
            state,
            VecDeque::from([(target, Work::Event(event.clone()))]),
            now,
        )
    }

    /// Find the case inside the tree an event addresses
    fn route_event(&self, state: &StatelessState, kind: &EventKind) -> WorkflowResult<CaseId> {
        let item_id = match kind {
            EventKind::CompleteWorkItem { item_id, .. }
            | EventKind::FailWorkItem { item_id, .. }
            | EventKind::CancelWorkItem { item_id }
            | EventKind::DelegateWorkItem { item_id, .. }
            | EventKind::LeaseExpired { item_id }
            | EventKind::OfferItem { item_id }
            | EventKind::CheckoutItem { item_id, .. }
            | EventKind::StartItem { item_id, .. }
            | EventKind::CheckinItem { item_id, .. }
            | EventKind::HeartbeatItem { item_id, .. } => Some(*item_id),
            EventKind::TimerFired { task_id } => {
                return state
                    .cases
                    .values()
                    .find(|c| c.items.values().any(|i| i.task_id == *task_id && i.is_live()))
                    .map(|c| c.id)
                    .ok_or_else(|| {
                        WorkflowError::PreconditionViolated(format!(
                            "no live work item for timer task {task_id}"
                        ))
                    });
            }
            EventKind::SubcaseSettled { child, .. } => {
                return Ok(state
                    .cases
                    .values()
                    .find(|c| c.subcases.contains_key(child))
                    .map(|c| c.id)
                    .unwrap_or(state.root));
            }
            EventKind::CancelCase
            | EventKind::SuspendCase
            | EventKind::ResumeCase
            | EventKind::AttachSubcase { .. } => return Ok(state.root),
        };
        let Some(item_id) = item_id else {
            return Ok(state.root);
        };
        state
            .cases
            .values()
            .find(|c| c.items.contains_key(&item_id))
            .map(|c| c.id)
            .ok_or_else(|| WorkflowError::ItemNotFound(item_id.to_string()))
    }

    fn run(
        &self,
        spec: &Specification,
        mut state: StatelessState,
        mut queue: VecDeque<(CaseId, Work)>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> WorkflowResult<StatelessOutcome> {
        let runner = self.runner(spec);
        let mut notifications = Vec::new();
        let mut emitted = Vec::new();

        while let Some((case_id, work)) = queue.pop_front() {
            let missing = || WorkflowError::CaseNotFound(case_id.to_string());
            let advance = match work {
                Work::Launch => {
                    let case = state.cases.get_mut(&case_id).ok_or_else(missing)?;
                    runner.launch(case, now)?
                }
                Work::Event(event) => {
                    let case = state.cases.get_mut(&case_id).ok_or_else(missing)?;
                    runner.apply_event(case, &event, now)?
                }
                Work::SubTerminal { child } => {
                    let (lifecycle, data) = match state.cases.get(&child) {
                        Some(child_case) => (child_case.lifecycle, child_case.data.clone()),
                        None => continue,
                    };
                    let case = state.cases.get_mut(&case_id).ok_or_else(missing)?;
                    runner.subcase_terminal(case, child, lifecycle, data, now)?
                }
            };

            notifications.extend(advance.notifications.iter().cloned());
            {
                let case = state.cases.get(&case_id).ok_or_else(|| {
                    WorkflowError::CaseNotFound(case_id.to_string())
                })?;
                for item_id in &advance.new_items {
                    if let Some(item) = case.items.get(item_id) {
                        emitted.push(item.clone());
                    }
                }
            }

            // Launch requested sub-cases inline: the whole tree lives in
            // this state blob.
            for request in &advance.subcase_requests {
                let net = spec.get_net(&request.net).ok_or_else(|| {
                    WorkflowError::InvariantBroken(format!("child net {} vanished", request.net))
                })?;
                let task_id = state
                    .cases
                    .get(&case_id)
                    .and_then(|c| c.busy.get(&request.firing))
                    .map(|b| b.task_id.clone())
                    .unwrap_or_default();
                let mut child = Case::new(
                    spec.id.clone(),
                    &request.net,
                    &net.input_condition,
                    request.data.clone(),
                    now,
                );
                child.id = CaseId::derived(case_id, request.firing);
                child.parent = Some(ParentLink {
                    case_id,
                    firing: request.firing,
                    task_id,
                });
                let child_id = child.id;
                state.cases.insert(child_id, child);
                let parent = state.cases.get_mut(&case_id).ok_or_else(|| {
                    WorkflowError::CaseNotFound(case_id.to_string())
                })?;
                runner.attach_subcase(parent, request.firing, child_id)?;
                queue.push_back((child_id, Work::Launch));
            }

            for child in &advance.cancel_subcases {
                queue.push_back((
                    *child,
                    Work::Event(ExternalEvent::new(
                        format!("cascade-cancel-{child}"),
                        EventKind::CancelCase,
                    )),
                ));
            }

            // A settled case reports back to its parent.
            let case = state.cases.get(&case_id).ok_or_else(|| {
                WorkflowError::CaseNotFound(case_id.to_string())
            })?;
            if case.lifecycle.is_terminal() {
                if let Some(parent) = &case.parent {
                    if state
                        .cases
                        .get(&parent.case_id)
                        .is_some_and(|p| p.subcases.contains_key(&case_id))
                    {
                        queue.push_back((parent.case_id, Work::SubTerminal { child: case_id }));
                    }
                }
            }
        }

        let lifecycle = state.root_case()?.lifecycle;
        Ok(StatelessOutcome {
            state: state.encode()?,
            lifecycle,
            emitted_items: emitted,
            notifications,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache_with(doc: serde_json::Value) -> Arc<SpecCache> {
        let cache = Arc::new(SpecCache::new(8));
        cache.register(doc.to_string().as_bytes()).unwrap();
        cache
    }

    fn sequential_doc() -> serde_json::Value {
        json!({
            "id": {"id": "seq", "version": "1"},
            "root_net": "main",
            "nets": {"main": {
                "name": "main",
                "input_condition": "start",
                "output_condition": "end",
                "tasks": {"a": {"id": "a"}, "b": {"id": "b"}},
                "flows": [
                    {"source": "start", "target": "a"},
                    {"source": "a", "target": "b"},
                    {"source": "b", "target": "end"}
                ]
            }}
        })
    }

    #[test]
    fn launch_apply_cycle_is_pure() {
        let specs = cache_with(sequential_doc());
        let engine = StatelessEngine::new(specs, EngineConfig::default());
        let now = chrono::Utc::now();

        let (_, outcome) = engine
            .launch(&SpecificationId::new("seq", "1"), json!({}), "preferred-stateless", now)
            .unwrap();
        assert_eq!(outcome.lifecycle, CaseLifecycle::Executing);
        assert_eq!(outcome.emitted_items.len(), 1);

        // Applying the same event to the same bytes gives the same bytes.
        let event = ExternalEvent::new(
            "e-1",
            EventKind::CompleteWorkItem {
                item_id: outcome.emitted_items[0].id,
                outputs: json!({}),
            },
        );
        let first = engine.apply(&outcome.state, &event, now).unwrap();
        let second = engine.apply(&outcome.state, &event, now).unwrap();
        assert_eq!(first.state, second.state);
        assert_eq!(first.emitted_items.len(), 1);
    }

    #[test]
    fn runs_to_completion() {
        let specs = cache_with(sequential_doc());
        let engine = StatelessEngine::new(specs, EngineConfig::default());
        let now = chrono::Utc::now();

        let (_, mut outcome) = engine
            .launch(&SpecificationId::new("seq", "1"), json!({}), "preferred-stateless", now)
            .unwrap();
        let mut n = 0;
        while outcome.lifecycle != CaseLifecycle::Completed {
            n += 1;
            let item = outcome.emitted_items[0].id;
            outcome = engine
                .apply(
                    &outcome.state,
                    &ExternalEvent::new(
                        format!("e-{n}"),
                        EventKind::CompleteWorkItem {
                            item_id: item,
                            outputs: json!({}),
                        },
                    ),
                    now,
                )
                .unwrap();
        }
        assert_eq!(n, 2);
    }

    #[test]
    fn composite_task_expands_inside_the_state_blob() {
        let doc = json!({
            "id": {"id": "nested", "version": "1"},
            "root_net": "outer",
            "nets": {
                "outer": {
                    "name": "outer",
                    "input_condition": "start",
                    "output_condition": "end",
                    "tasks": {"sub": {"id": "sub", "kind": "composite", "decomposition": "inner"}},
                    "flows": [
                        {"source": "start", "target": "sub"},
                        {"source": "sub", "target": "end"}
                    ]
                },
                "inner": {
                    "name": "inner",
                    "input_condition": "in_start",
                    "output_condition": "in_end",
                    "tasks": {"work": {"id": "work"}},
                    "flows": [
                        {"source": "in_start", "target": "work"},
                        {"source": "work", "target": "in_end"}
                    ]
                }
            }
        });
        let specs = cache_with(doc);
        let engine = StatelessEngine::new(specs, EngineConfig::default());
        let now = chrono::Utc::now();

        let (root, outcome) = engine
            .launch(&SpecificationId::new("nested", "1"), json!({}), "preferred-stateless", now)
            .unwrap();
        // The sub-case launched inline and enabled its inner item.
        assert_eq!(outcome.emitted_items.len(), 1);
        assert_eq!(outcome.emitted_items[0].task_id, "work");
        let state = StatelessState::decode(&outcome.state).unwrap();
        assert_eq!(state.cases.len(), 2);

        // Completing the inner item settles the sub-case and the root.
        let outcome = engine
            .apply(
                &outcome.state,
                &ExternalEvent::new(
                    "done",
                    EventKind::CompleteWorkItem {
                        item_id: outcome.emitted_items[0].id,
                        outputs: json!({}),
                    },
                ),
                now,
            )
            .unwrap();
        assert_eq!(outcome.lifecycle, CaseLifecycle::Completed);
        let state = StatelessState::decode(&outcome.state).unwrap();
        assert_eq!(state.root, root);
        assert!(state.cases.values().all(|c| c.lifecycle == CaseLifecycle::Completed));
    }
}
