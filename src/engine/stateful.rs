//! Stateful engine variant
//!
//! Owns case state durably: every case-altering operation appends to the
//! log and flushes before it is acknowledged. Cases are advanced under a
//! per-case lock; cross-case work (sub-case launches, cascading cancels,
//! allocator dispatches, parent settlement) is deferred to a follow-up
//! queue so no two case locks are ever held at once.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::allocator::{ReleaseOutcome, ResourceAllocator};
use crate::case::{Case, CaseId, CaseLifecycle, ParentLink};
use crate::config::EngineConfig;
use crate::error::{WorkflowError, WorkflowResult};
use crate::events::{EventKind, EventSink, ExternalEvent, LifecycleEvent};
use crate::item::{ItemId, Lease, WorkItem, WorkItemState};
use crate::runner::{Advance, NetRunner};
use crate::spec::types::{Specification, SpecificationId};
use crate::spec::SpecCache;
use crate::state::{CasePersistence, LogEntry};

/// Entries between snapshots
const SNAPSHOT_EVERY: u64 = 32;

/// Follow-up budget per external operation
const MAX_FOLLOWUPS: usize = 10_000;

struct CaseSlot {
    case: Case,
    seq: u64,
    since_snapshot: u64,
}

enum Followup {
    /// Launch an already-created case
    Run { case_id: CaseId },
    /// Apply a cascade event
    Event { case_id: CaseId, event: ExternalEvent },
    /// Offer a newly Enabled item to the allocator
    Offer { case_id: CaseId, item_id: ItemId },
    /// Bind an allocator-decided reservation onto the case
    Dispatch {
        case_id: CaseId,
        item_id: ItemId,
        worker_id: String,
    },
}

/// The durable engine variant
pub struct StatefulEngine {
    specs: Arc<SpecCache>,
    config: EngineConfig,
    store: Arc<dyn CasePersistence>,
    allocator: Arc<ResourceAllocator>,
    sink: EventSink,
    cases: DashMap<CaseId, Arc<Mutex<CaseSlot>>>,
    item_index: DashMap<ItemId, CaseId>,
}

impl StatefulEngine {
    /// Create over shared collaborators
    pub fn new(
        specs: Arc<SpecCache>,
        config: EngineConfig,
        store: Arc<dyn CasePersistence>,
        allocator: Arc<ResourceAllocator>,
        sink: EventSink,
    ) -> Self {
        Self {
            specs,
            config,
            store,
            allocator,
            sink,
            cases: DashMap::new(),
            item_index: DashMap::new(),
        }
    }

    fn slot(&self, case_id: CaseId) -> WorkflowResult<Arc<Mutex<CaseSlot>>> {
        self.cases
            .get(&case_id)
            .map(|entry| Arc::clone(&entry))
            .ok_or_else(|| WorkflowError::CaseNotFound(case_id.to_string()))
    }

    fn runner<'a>(&self, spec: &'a Specification) -> NetRunner<'a> {
        NetRunner::new(
            spec,
            self.config.lease_default_ttl_ms,
            self.config.max_attempts,
        )
    }

    /// The case currently owning an item
    pub fn case_of_item(&self, item_id: &ItemId) -> WorkflowResult<CaseId> {
        self.item_index
            .get(item_id)
            .map(|entry| *entry)
            .ok_or_else(|| WorkflowError::ItemNotFound(item_id.to_string()))
    }

    /// Launch a new case; durable before return
    pub async fn launch_case(
        &self,
        spec_id: &SpecificationId,
        data: serde_json::Value,
        selection_reason: &str,
        now: DateTime<Utc>,
    ) -> WorkflowResult<CaseId> {
        let spec = self.specs.resolve(spec_id)?;
        let net = spec
            .get_net(&spec.root_net)
            .ok_or_else(|| WorkflowError::InvariantBroken("root net vanished".to_string()))?;
        let mut case = Case::new(spec.id.clone(), &spec.root_net, &net.input_condition, data, now);
        case.engine_used = Some(crate::spec::PreferredEngine::Stateful);
        case.selection_reason = Some(selection_reason.to_string());
        case.deadline = self
            .config
            .case_deadline_default_ms
            .map(|ms| now + chrono::Duration::milliseconds(ms as i64));
        let case_id = case.id;
        self.cases.insert(
            case_id,
            Arc::new(Mutex::new(CaseSlot {
                case,
                seq: 0,
                since_snapshot: 0,
            })),
        );
        self.process(VecDeque::from([Followup::Run { case_id }]), now)
            .await?;
        Ok(case_id)
    }

    /// Apply one external event; caller errors leave everything untouched
    pub async fn apply_event(
        &self,
        case_id: CaseId,
        event: &ExternalEvent,
        now: DateTime<Utc>,
    ) -> WorkflowResult<CaseLifecycle> {
        let slot = self.slot(case_id)?;
        let mut queue = VecDeque::new();
        let lifecycle;
        {
            let mut guard = slot.lock().await;
            let spec = self.specs.resolve(&guard.case.spec_id)?;
            let runner = self.runner(&spec);
            let advance = runner.apply_event(&mut guard.case, event, now)?;
            self.commit(case_id, &mut guard, Some(event.clone()), now).await?;
            self.after_step(case_id, &mut guard, advance, &mut queue, now)
                .await?;
            lifecycle = guard.case.lifecycle;
        }
        self.process(queue, now).await?;
        Ok(lifecycle)
    }

    /// Append the entry (if any) and snapshot per policy
    async fn commit(
        &self,
        case_id: CaseId,
        guard: &mut CaseSlot,
        event: Option<ExternalEvent>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        let force_snapshot = event.is_none();
        if let Some(event) = event {
            guard.seq += 1;
            let entry = LogEntry {
                seq: guard.seq,
                at: now,
                event,
            };
            self.store.append(case_id, &entry).await?;
            guard.since_snapshot += 1;
        }
        if force_snapshot
            || guard.since_snapshot >= SNAPSHOT_EVERY
            || guard.case.lifecycle.is_terminal()
        {
            let bytes = guard.case.snapshot()?;
            self.store.snapshot(case_id, guard.seq, &bytes).await?;
            guard.since_snapshot = 0;
        }
        Ok(())
    }

    /// Translate one runner step's effects into follow-ups
    async fn after_step(
        &self,
        case_id: CaseId,
        guard: &mut CaseSlot,
        advance: Advance,
        queue: &mut VecDeque<Followup>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        for notification in &advance.notifications {
            match notification {
                LifecycleEvent::ItemCreated { item_id, .. } => {
                    self.item_index.insert(*item_id, case_id);
                }
                LifecycleEvent::ItemStateChanged { item_id, state, .. } => {
                    // A settled or reclaimed item frees allocator capacity.
                    let release = match state {
                        WorkItemState::Completed => Some(ReleaseOutcome::Completed),
                        WorkItemState::Failed => Some(ReleaseOutcome::Failed),
                        WorkItemState::Cancelled | WorkItemState::Withdrawn => {
                            Some(ReleaseOutcome::Cancelled)
                        }
                        WorkItemState::Enabled => Some(ReleaseOutcome::Failed),
                        _ => None,
                    };
                    if let Some(outcome) = release {
                        for dispatch in self.allocator.release(item_id, outcome) {
                            queue.push_back(Followup::Dispatch {
                                case_id: dispatch.case_id,
                                item_id: dispatch.item_id,
                                worker_id: dispatch.worker_id,
                            });
                        }
                    }
                }
                _ => {}
            }
        }
        self.sink.publish_all(advance.notifications.clone()).await;

        let spec = self.specs.resolve(&guard.case.spec_id)?;
        for item_id in &advance.new_items {
            let offerable = guard
                .case
                .items
                .get(item_id)
                .filter(|item| item.state == WorkItemState::Enabled)
                .map(|item| item.task_id.clone())
                .and_then(|task_id| {
                    spec.get_net(&guard.case.net_name)
                        .and_then(|net| net.tasks.get(&task_id))
                })
                // Timer items wait for their TimerFired event instead.
                .is_some_and(|task| task.timer.is_none());
            if offerable {
                queue.push_back(Followup::Offer {
                    case_id,
                    item_id: *item_id,
                });
            }
        }

        for request in &advance.subcase_requests {
            let net = spec.get_net(&request.net).ok_or_else(|| {
                WorkflowError::InvariantBroken(format!("child net {} vanished", request.net))
            })?;
            let child_id = CaseId::derived(case_id, request.firing);
            let mut child = Case::new(
                spec.id.clone(),
                &request.net,
                &net.input_condition,
                request.data.clone(),
                now,
            );
            child.id = child_id;
            child.parent = Some(ParentLink {
                case_id,
                firing: request.firing,
                task_id: guard
                    .case
                    .busy
                    .get(&request.firing)
                    .map(|b| b.task_id.clone())
                    .unwrap_or_default(),
            });
            child.engine_used = guard.case.engine_used;
            child.selection_reason = guard.case.selection_reason.clone();
            child.deadline = guard.case.deadline;
            self.cases.insert(
                child_id,
                Arc::new(Mutex::new(CaseSlot {
                    case: child,
                    seq: 0,
                    since_snapshot: 0,
                })),
            );

            // The link is itself a logged event so parent replay re-derives
            // the same tree.
            let attach = ExternalEvent::new(
                format!("attach-{child_id}"),
                EventKind::AttachSubcase {
                    firing: request.firing,
                    child: child_id,
                },
            );
            let runner = self.runner(&spec);
            runner.apply_event(&mut guard.case, &attach, now)?;
            self.commit(case_id, guard, Some(attach), now).await?;
            queue.push_back(Followup::Run { case_id: child_id });
        }

        for child in &advance.cancel_subcases {
            queue.push_back(Followup::Event {
                case_id: *child,
                event: ExternalEvent::new(
                    format!("cascade-cancel-{child}"),
                    EventKind::CancelCase,
                ),
            });
        }

        if guard.case.lifecycle.is_terminal() {
            if let Some(parent) = guard.case.parent.clone() {
                queue.push_back(Followup::Event {
                    case_id: parent.case_id,
                    event: ExternalEvent::new(
                        format!("subcase-settled-{}", guard.case.id),
                        EventKind::SubcaseSettled {
                            child: guard.case.id,
                            lifecycle: guard.case.lifecycle,
                            data: guard.case.data.clone(),
                        },
                    ),
                });
            }
        }
        Ok(())
    }

    /// Drain the follow-up queue; one case lock at a time
    async fn process(
        &self,
        mut queue: VecDeque<Followup>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        let mut handled = 0usize;
        while let Some(followup) = queue.pop_front() {
            handled += 1;
            if handled > MAX_FOLLOWUPS {
                return Err(WorkflowError::InvariantBroken(
                    "follow-up budget exhausted".to_string(),
                ));
            }
            match followup {
                Followup::Run { case_id } => {
                    let slot = self.slot(case_id)?;
                    let mut guard = slot.lock().await;
                    let spec = self.specs.resolve(&guard.case.spec_id)?;
                    let runner = self.runner(&spec);
                    let advance = runner.launch(&mut guard.case, now)?;
                    self.commit(case_id, &mut guard, None, now).await?;
                    self.after_step(case_id, &mut guard, advance, &mut queue, now)
                        .await?;
                }
                Followup::Event { case_id, event } => {
                    let Ok(slot) = self.slot(case_id) else { continue };
                    let mut guard = slot.lock().await;
                    let spec = self.specs.resolve(&guard.case.spec_id)?;
                    let runner = self.runner(&spec);
                    match runner.apply_event(&mut guard.case, &event, now) {
                        Ok(advance) => {
                            self.commit(case_id, &mut guard, Some(event), now).await?;
                            self.after_step(case_id, &mut guard, advance, &mut queue, now)
                                .await?;
                        }
                        Err(err) => {
                            tracing::warn!(case_id = %case_id, %err, "cascade event rejected");
                        }
                    }
                }
                Followup::Offer { case_id, item_id } => {
                    self.offer_followup(case_id, item_id, &mut queue, now).await?;
                }
                Followup::Dispatch {
                    case_id,
                    item_id,
                    worker_id,
                } => {
                    self.dispatch_followup(case_id, item_id, &worker_id, &mut queue, now)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn offer_followup(
        &self,
        case_id: CaseId,
        item_id: ItemId,
        queue: &mut VecDeque<Followup>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        let Ok(slot) = self.slot(case_id) else {
            return Ok(());
        };
        let (rule, urgent) = {
            let mut guard = slot.lock().await;
            let spec = self.specs.resolve(&guard.case.spec_id)?;
            let Some(item) = guard.case.items.get(&item_id) else {
                return Ok(());
            };
            if item.state != WorkItemState::Enabled {
                return Ok(());
            }
            let attempt = item.attempt;
            let task_id = item.task_id.clone();
            let Some(task) = spec
                .get_net(&guard.case.net_name)
                .and_then(|net| net.tasks.get(&task_id))
            else {
                return Ok(());
            };
            if task.timer.is_some() {
                // Timer items wait for TimerFired, never for a worker.
                return Ok(());
            }
            let rule = task.allocation.clone().unwrap_or_default();
            let urgent = task.urgent;

            let offer = ExternalEvent::new(
                format!("offer-{item_id}-a{attempt}"),
                EventKind::OfferItem { item_id },
            );
            let runner = self.runner(&spec);
            match runner.apply_event(&mut guard.case, &offer, now) {
                Ok(advance) => {
                    self.commit(case_id, &mut guard, Some(offer), now).await?;
                    self.after_step(case_id, &mut guard, advance, queue, now)
                        .await?;
                }
                Err(err) => {
                    tracing::warn!(case_id = %case_id, item_id = %item_id, %err, "offer rejected");
                    return Ok(());
                }
            }
            (rule, urgent)
        };

        match self.allocator.offer(item_id, case_id, &rule, urgent) {
            Ok((_, dispatches)) => {
                for dispatch in dispatches {
                    queue.push_back(Followup::Dispatch {
                        case_id: dispatch.case_id,
                        item_id: dispatch.item_id,
                        worker_id: dispatch.worker_id,
                    });
                }
            }
            Err(err) => {
                tracing::warn!(item_id = %item_id, %err, "allocator offer failed");
            }
        }
        Ok(())
    }

    async fn dispatch_followup(
        &self,
        case_id: CaseId,
        item_id: ItemId,
        worker_id: &str,
        queue: &mut VecDeque<Followup>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        let Ok(slot) = self.slot(case_id) else {
            self.allocator.release(&item_id, ReleaseOutcome::Cancelled);
            return Ok(());
        };
        let mut guard = slot.lock().await;
        let spec = self.specs.resolve(&guard.case.spec_id)?;
        let attempt = guard
            .case
            .items
            .get(&item_id)
            .map(|i| i.attempt)
            .unwrap_or(0);
        let checkout = ExternalEvent::new(
            format!("checkout-{item_id}-a{attempt}"),
            EventKind::CheckoutItem {
                item_id,
                worker_id: worker_id.to_string(),
            },
        );
        let runner = self.runner(&spec);
        match runner.apply_event(&mut guard.case, &checkout, now) {
            Ok(advance) => {
                self.commit(case_id, &mut guard, Some(checkout), now).await?;
                self.after_step(case_id, &mut guard, advance, queue, now)
                    .await?;
            }
            Err(err) => {
                tracing::warn!(case_id = %case_id, item_id = %item_id, %err, "dispatch checkout rejected");
                drop(guard);
                for dispatch in self.allocator.release(&item_id, ReleaseOutcome::Cancelled) {
                    queue.push_back(Followup::Dispatch {
                        case_id: dispatch.case_id,
                        item_id: dispatch.item_id,
                        worker_id: dispatch.worker_id,
                    });
                }
            }
        }
        Ok(())
    }

    /// Worker checkout: reserve atomically, then bind the item
    pub async fn checkout(
        &self,
        item_id: ItemId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> WorkflowResult<(serde_json::Value, Lease)> {
        let case_id = self.case_of_item(&item_id)?;
        self.allocator.reserve(&item_id, worker_id)?;

        let slot = self.slot(case_id)?;
        let mut queue = VecDeque::new();
        let result = {
            let mut guard = slot.lock().await;
            let spec = self.specs.resolve(&guard.case.spec_id)?;
            let attempt = guard
                .case
                .items
                .get(&item_id)
                .map(|i| i.attempt)
                .unwrap_or(0);
            let checkout = ExternalEvent::new(
                format!("checkout-{item_id}-a{attempt}"),
                EventKind::CheckoutItem {
                    item_id,
                    worker_id: worker_id.to_string(),
                },
            );
            let runner = self.runner(&spec);
            match runner.apply_event(&mut guard.case, &checkout, now) {
                Ok(advance) => {
                    self.commit(case_id, &mut guard, Some(checkout), now).await?;
                    self.after_step(case_id, &mut guard, advance, &mut queue, now)
                        .await?;
                    let item = guard.case.item(&item_id)?;
                    let lease = item.lease.clone().ok_or_else(|| {
                        WorkflowError::InvariantBroken(format!(
                            "item {item_id} allocated without a lease"
                        ))
                    })?;
                    Ok((item.data.clone(), lease))
                }
                Err(err) => {
                    self.allocator.release(&item_id, ReleaseOutcome::Cancelled);
                    Err(err)
                }
            }
        };
        self.process(queue, now).await?;
        result
    }

    /// Worker heartbeat: renew the lease
    pub async fn heartbeat(
        &self,
        item_id: ItemId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Lease> {
        let case_id = self.case_of_item(&item_id)?;
        let event = ExternalEvent::new(
            format!("heartbeat-{item_id}-{}", now.timestamp_millis()),
            EventKind::HeartbeatItem {
                item_id,
                worker_id: worker_id.to_string(),
            },
        );
        self.apply_event(case_id, &event, now).await?;
        let slot = self.slot(case_id)?;
        let guard = slot.lock().await;
        guard
            .case
            .item(&item_id)?
            .lease
            .clone()
            .ok_or_else(|| WorkflowError::PreconditionViolated(format!("item {item_id} holds no lease")))
    }

    /// One sweep pass: expired leases, due timers, overdue case deadlines
    ///
    /// Normally driven by a periodic caller; tests call it directly with a
    /// synthetic clock.
    pub async fn sweep(&self, now: DateTime<Utc>) -> WorkflowResult<()> {
        let case_ids: Vec<CaseId> = self.cases.iter().map(|entry| *entry.key()).collect();
        let mut queue = VecDeque::new();
        for case_id in case_ids {
            let Ok(slot) = self.slot(case_id) else { continue };
            let guard = slot.lock().await;
            let case = &guard.case;
            if case.lifecycle.is_terminal() {
                continue;
            }
            if let Some(deadline) = case.deadline {
                if now >= deadline {
                    queue.push_back(Followup::Event {
                        case_id,
                        event: ExternalEvent::new(
                            format!("deadline-{case_id}"),
                            EventKind::CancelCase,
                        ),
                    });
                    continue;
                }
            }
            let spec = self.specs.resolve(&case.spec_id)?;
            let net = spec.get_net(&case.net_name);
            for item in case.items.values() {
                match item.state {
                    WorkItemState::Allocated | WorkItemState::Started => {
                        if let Some(lease) = &item.lease {
                            if lease.is_expired(now) {
                                queue.push_back(Followup::Event {
                                    case_id,
                                    event: ExternalEvent::new(
                                        format!(
                                            "lease-{}-{}",
                                            item.id,
                                            lease.expires_at.timestamp_millis()
                                        ),
                                        EventKind::LeaseExpired { item_id: item.id },
                                    ),
                                });
                            }
                        }
                    }
                    WorkItemState::Enabled => {
                        let due_timer = net
                            .and_then(|net| net.tasks.get(&item.task_id))
                            .and_then(|task| task.timer.as_deref())
                            .and_then(crate::spec::types::parse_iso8601_duration)
                            .is_some_and(|duration| now >= item.enabled_at + duration);
                        if due_timer {
                            queue.push_back(Followup::Event {
                                case_id,
                                event: ExternalEvent::new(
                                    format!("timer-{}", item.id),
                                    EventKind::TimerFired {
                                        task_id: item.task_id.clone(),
                                    },
                                ),
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
        self.process(queue, now).await
    }

    /// Restore every persisted case: snapshot plus replayed entries
    pub async fn recover(&self, now: DateTime<Utc>) -> WorkflowResult<usize> {
        let case_ids = self.store.list_cases().await?;
        let mut recovered = 0usize;
        let mut queue = VecDeque::new();

        for case_id in case_ids {
            let Some((snapshot, entries)) = self.store.read(case_id).await? else {
                continue;
            };
            let Some(snapshot) = snapshot else {
                tracing::error!(case_id = %case_id, "log entries without a snapshot; skipping case");
                continue;
            };
            let mut case = Case::restore(&snapshot.state)?;
            let spec = self.specs.resolve(&case.spec_id)?;
            let runner = self.runner(&spec);
            let mut seq = snapshot.seq;
            for entry in entries {
                seq = entry.seq;
                if let Err(err) = runner.apply_event(&mut case, &entry.event, entry.at) {
                    tracing::warn!(case_id = %case_id, seq = entry.seq, %err, "replay entry rejected");
                }
            }

            for item in case.items.values() {
                self.item_index.insert(item.id, case_id);
                // Rebuild soft allocator state for items mid-offer.
                if item.state == WorkItemState::Offered {
                    let rule = spec
                        .get_net(&case.net_name)
                        .and_then(|net| net.tasks.get(&item.task_id))
                        .and_then(|task| task.allocation.clone())
                        .unwrap_or_default();
                    let _ = self.allocator.offer(item.id, case_id, &rule, item.urgent);
                } else if item.state == WorkItemState::Enabled {
                    queue.push_back(Followup::Offer {
                        case_id,
                        item_id: item.id,
                    });
                }
            }

            self.cases.insert(
                case_id,
                Arc::new(Mutex::new(CaseSlot {
                    case,
                    seq,
                    since_snapshot: 0,
                })),
            );
            recovered += 1;
        }

        self.process(queue, now).await?;
        tracing::info!(recovered, "case recovery complete");
        Ok(recovered)
    }

    /// A consistent clone of one case
    pub async fn case_state(&self, case_id: CaseId) -> WorkflowResult<Case> {
        let slot = self.slot(case_id)?;
        let guard = slot.lock().await;
        Ok(guard.case.clone())
    }

    /// Live work items, optionally restricted to one case
    pub async fn live_items(&self, case_id: Option<CaseId>) -> WorkflowResult<Vec<WorkItem>> {
        let case_ids: Vec<CaseId> = match case_id {
            Some(id) => vec![id],
            None => self.cases.iter().map(|entry| *entry.key()).collect(),
        };
        let mut items = Vec::new();
        for id in case_ids {
            let slot = self.slot(id)?;
            let guard = slot.lock().await;
            items.extend(guard.case.live_items().cloned());
        }
        Ok(items)
    }

    /// All known cases as (id, lifecycle, specification)
    pub async fn list_cases(&self) -> Vec<(CaseId, CaseLifecycle, SpecificationId)> {
        let mut out = Vec::new();
        let case_ids: Vec<CaseId> = self.cases.iter().map(|entry| *entry.key()).collect();
        for id in case_ids {
            if let Ok(slot) = self.slot(id) {
                let guard = slot.lock().await;
                out.push((id, guard.case.lifecycle, guard.case.spec_id.clone()));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}
