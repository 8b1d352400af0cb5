//! Engine facade
//!
//! The public launch/query/cancel API. The selector routes each launch to
//! the stateful or stateless variant; both run the same net-runner
//! semantics, so callers see one uniform case view either way.

pub mod selector;
pub mod stateful;
pub mod stateless;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::allocator::ResourceAllocator;
use crate::case::{Case, CaseId, CaseLifecycle};
use crate::config::EngineConfig;
use crate::error::{WorkflowError, WorkflowResult};
use crate::events::{EventKind, EventSink, ExternalEvent};
use crate::item::{ItemId, Lease, WorkItem};
use crate::spec::types::{PreferredEngine, Specification, SpecificationId};
use crate::spec::SpecCache;
use crate::state::CasePersistence;

pub use selector::{EngineChoice, EngineOverride, SelectionReason};
pub use stateful::StatefulEngine;
pub use stateless::{StatelessEngine, StatelessOutcome, StatelessState};

/// Receipt returned by `launch_case`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchReceipt {
    /// The new case
    pub case_id: CaseId,
    /// Variant that owns it
    pub engine_used: PreferredEngine,
    /// Why the selector chose that variant
    pub selection_reason: SelectionReason,
}

/// Canonical, engine-independent case view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseView {
    /// Case id
    pub case_id: CaseId,
    /// Specification
    pub spec_id: SpecificationId,
    /// Lifecycle state
    pub lifecycle: CaseLifecycle,
    /// Marked conditions with token counts
    pub marking: Vec<(String, u32)>,
    /// Case data
    pub data: serde_json::Value,
    /// Live work items
    pub live_items: Vec<WorkItem>,
    /// Which variant owns the case
    pub engine_used: Option<PreferredEngine>,
    /// Why it was chosen
    pub selection_reason: Option<String>,
    /// Failure message, when failed
    pub error: Option<String>,
}

impl CaseView {
    /// Project a case into the canonical view
    pub fn of(case: &Case) -> Self {
        Self {
            case_id: case.id,
            spec_id: case.spec_id.clone(),
            lifecycle: case.lifecycle,
            marking: case
                .marking
                .marked_conditions()
                .map(|(c, n)| (c.to_string(), n))
                .collect(),
            data: case.data.clone(),
            live_items: case.live_items().cloned().collect(),
            engine_used: case.engine_used,
            selection_reason: case.selection_reason.clone(),
            error: case.error.clone(),
        }
    }
}

/// The facade: one public API over both engine variants
///
/// Instantiable (per tenant, per test); holds no process-global state.
pub struct Engine {
    config: EngineConfig,
    specs: Arc<SpecCache>,
    allocator: Arc<ResourceAllocator>,
    stateful: StatefulEngine,
    stateless: StatelessEngine,
    /// Facade-held custody of stateless case blobs, serialised per case
    stateless_states: DashMap<CaseId, Arc<Mutex<Vec<u8>>>>,
}

impl Engine {
    /// Assemble a facade over a persistence backend
    pub fn new(config: EngineConfig, store: Arc<dyn CasePersistence>, sink: EventSink) -> Self {
        let specs = Arc::new(SpecCache::new(config.spec_cache_capacity));
        let allocator = Arc::new(ResourceAllocator::new());
        let stateful = StatefulEngine::new(
            Arc::clone(&specs),
            config.clone(),
            store,
            Arc::clone(&allocator),
            sink,
        );
        let stateless = StatelessEngine::new(Arc::clone(&specs), config.clone());
        Self {
            config,
            specs,
            allocator,
            stateful,
            stateless,
            stateless_states: DashMap::new(),
        }
    }

    /// The shared specification cache
    pub fn specs(&self) -> &Arc<SpecCache> {
        &self.specs
    }

    /// The shared resource allocator
    pub fn allocator(&self) -> &Arc<ResourceAllocator> {
        &self.allocator
    }

    /// The stateful variant, for recovery and sweeping
    pub fn stateful(&self) -> &StatefulEngine {
        &self.stateful
    }

    /// Load, validate and intern a specification document
    pub fn register_spec(&self, bytes: &[u8]) -> WorkflowResult<Arc<Specification>> {
        self.specs.register(bytes)
    }

    /// Launch a case; the selector picks the variant
    pub async fn launch_case(
        &self,
        spec_id: &SpecificationId,
        data: serde_json::Value,
        requested: Option<EngineOverride>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<LaunchReceipt> {
        let spec = self.specs.resolve(spec_id)?;
        let choice = selector::select(&spec, &self.config, requested.as_ref())?;
        match choice.engine {
            PreferredEngine::Stateful => {
                let case_id = self
                    .stateful
                    .launch_case(spec_id, data, &choice.reason.to_string(), now)
                    .await?;
                Ok(LaunchReceipt {
                    case_id,
                    engine_used: PreferredEngine::Stateful,
                    selection_reason: choice.reason,
                })
            }
            PreferredEngine::Stateless => {
                let (case_id, outcome) =
                    self.stateless
                        .launch(spec_id, data, &choice.reason.to_string(), now)?;
                self.stateless_states
                    .insert(case_id, Arc::new(Mutex::new(outcome.state)));
                Ok(LaunchReceipt {
                    case_id,
                    engine_used: PreferredEngine::Stateless,
                    selection_reason: choice.reason,
                })
            }
        }
    }

    fn stateless_slot(&self, case_id: CaseId) -> Option<Arc<Mutex<Vec<u8>>>> {
        self.stateless_states
            .get(&case_id)
            .map(|entry| Arc::clone(&entry))
    }

    /// Canonical case view, whichever variant owns the case
    pub async fn get_case(&self, case_id: CaseId) -> WorkflowResult<CaseView> {
        if let Ok(case) = self.stateful.case_state(case_id).await {
            return Ok(CaseView::of(&case));
        }
        if let Some(slot) = self.stateless_slot(case_id) {
            let bytes = slot.lock().await;
            let state = StatelessState::decode(&bytes)?;
            return Ok(CaseView::of(state.root_case()?));
        }
        Err(WorkflowError::CaseNotFound(case_id.to_string()))
    }

    /// Apply one external event to a case
    pub async fn apply_event(
        &self,
        case_id: CaseId,
        event: &ExternalEvent,
        now: DateTime<Utc>,
    ) -> WorkflowResult<CaseLifecycle> {
        if self.stateful.case_state(case_id).await.is_ok() {
            return self.stateful.apply_event(case_id, event, now).await;
        }
        let Some(slot) = self.stateless_slot(case_id) else {
            return Err(WorkflowError::CaseNotFound(case_id.to_string()));
        };
        let mut bytes = slot.lock().await;
        let outcome = self.stateless.apply(&bytes, event, now)?;
        *bytes = outcome.state;
        Ok(outcome.lifecycle)
    }

    /// Cancel a case
    pub async fn cancel_case(
        &self,
        case_id: CaseId,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> WorkflowResult<CaseLifecycle> {
        self.apply_event(
            case_id,
            &ExternalEvent::new(event_id, EventKind::CancelCase),
            now,
        )
        .await
    }

    /// Suspend a case
    pub async fn suspend_case(
        &self,
        case_id: CaseId,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> WorkflowResult<CaseLifecycle> {
        self.apply_event(
            case_id,
            &ExternalEvent::new(event_id, EventKind::SuspendCase),
            now,
        )
        .await
    }

    /// Resume a suspended case
    pub async fn resume_case(
        &self,
        case_id: CaseId,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> WorkflowResult<CaseLifecycle> {
        self.apply_event(
            case_id,
            &ExternalEvent::new(event_id, EventKind::ResumeCase),
            now,
        )
        .await
    }

    /// Live work items across both variants
    pub async fn list_live_work_items(
        &self,
        case_id: Option<CaseId>,
    ) -> WorkflowResult<Vec<WorkItem>> {
        match case_id {
            Some(case_id) => {
                if let Ok(items) = self.stateful.live_items(Some(case_id)).await {
                    return Ok(items);
                }
                let Some(slot) = self.stateless_slot(case_id) else {
                    return Err(WorkflowError::CaseNotFound(case_id.to_string()));
                };
                let bytes = slot.lock().await;
                let state = StatelessState::decode(&bytes)?;
                Ok(state
                    .cases
                    .values()
                    .flat_map(|case| case.live_items().cloned())
                    .collect())
            }
            None => {
                let mut items = self.stateful.live_items(None).await?;
                let slots: Vec<Arc<Mutex<Vec<u8>>>> = self
                    .stateless_states
                    .iter()
                    .map(|entry| Arc::clone(&entry))
                    .collect();
                for slot in slots {
                    let bytes = slot.lock().await;
                    let state = StatelessState::decode(&bytes)?;
                    items.extend(
                        state
                            .cases
                            .values()
                            .flat_map(|case| case.live_items().cloned()),
                    );
                }
                Ok(items)
            }
        }
    }

    /// All known cases with lifecycle and specification
    pub async fn list_cases(
        &self,
        spec_id: Option<&SpecificationId>,
    ) -> WorkflowResult<Vec<(CaseId, CaseLifecycle, SpecificationId)>> {
        let mut cases = self.stateful.list_cases().await;
        let slots: Vec<Arc<Mutex<Vec<u8>>>> = self
            .stateless_states
            .iter()
            .map(|entry| Arc::clone(&entry))
            .collect();
        for slot in slots {
            let bytes = slot.lock().await;
            let state = StatelessState::decode(&bytes)?;
            let root = state.root_case()?;
            cases.push((root.id, root.lifecycle, root.spec_id.clone()));
        }
        if let Some(spec_id) = spec_id {
            cases.retain(|(_, _, id)| id == spec_id);
        }
        cases.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(cases)
    }

    /// Worker host API: check an offered item out (stateful cases only)
    pub async fn checkout(
        &self,
        item_id: ItemId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> WorkflowResult<(serde_json::Value, Lease)> {
        self.stateful.checkout(item_id, worker_id, now).await
    }

    /// Worker host API: acknowledge a checked-out item
    pub async fn start_item(
        &self,
        item_id: ItemId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        let case_id = self.stateful.case_of_item(&item_id)?;
        let event = ExternalEvent::new(
            format!("start-{item_id}-{}", now.timestamp_millis()),
            EventKind::StartItem {
                item_id,
                worker_id: worker_id.to_string(),
            },
        );
        self.stateful.apply_event(case_id, &event, now).await?;
        Ok(())
    }

    /// Worker host API: renew the lease
    pub async fn heartbeat(
        &self,
        item_id: ItemId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Lease> {
        self.stateful.heartbeat(item_id, worker_id, now).await
    }

    /// Worker host API: check in with outputs
    ///
    /// Validation failures burn the item's retry budget per task
    /// configuration rather than rejecting the call.
    pub async fn checkin_complete(
        &self,
        item_id: ItemId,
        worker_id: &str,
        outputs: serde_json::Value,
        now: DateTime<Utc>,
    ) -> WorkflowResult<CaseLifecycle> {
        let case_id = self.stateful.case_of_item(&item_id)?;
        let event = ExternalEvent::new(
            format!("checkin-{item_id}-{}", uuid::Uuid::new_v4()),
            EventKind::CheckinItem {
                item_id,
                worker_id: worker_id.to_string(),
                outputs,
            },
        );
        self.stateful.apply_event(case_id, &event, now).await
    }

    /// Worker host API: report failure
    pub async fn checkin_failed(
        &self,
        item_id: ItemId,
        error: serde_json::Value,
        now: DateTime<Utc>,
    ) -> WorkflowResult<CaseLifecycle> {
        let case_id = self.stateful.case_of_item(&item_id)?;
        let event = ExternalEvent::new(
            format!("fail-{item_id}-{}", uuid::Uuid::new_v4()),
            EventKind::FailWorkItem { item_id, error },
        );
        self.stateful.apply_event(case_id, &event, now).await
    }

    /// Worker host API: delegate an allocated item
    pub async fn delegate(
        &self,
        item_id: ItemId,
        from_worker: &str,
        to_worker: &str,
        now: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        let case_id = self.stateful.case_of_item(&item_id)?;
        let event = ExternalEvent::new(
            format!("delegate-{item_id}-{}", uuid::Uuid::new_v4()),
            EventKind::DelegateWorkItem {
                item_id,
                from_worker: from_worker.to_string(),
                to_worker: to_worker.to_string(),
            },
        );
        self.stateful.apply_event(case_id, &event, now).await?;
        Ok(())
    }

    /// One sweep pass over leases, timers and deadlines
    pub async fn sweep(&self, now: DateTime<Utc>) -> WorkflowResult<()> {
        self.stateful.sweep(now).await
    }

    /// Recover persisted stateful cases after a restart
    pub async fn recover(&self, now: DateTime<Utc>) -> WorkflowResult<usize> {
        self.stateful.recover(now).await
    }
}
