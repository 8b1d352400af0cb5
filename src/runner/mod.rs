//! Net runner
//!
//! Advances a case by firing enabled transitions until no further progress
//! is possible without external input. The runner is pure and synchronous:
//! both engine variants wrap these same functions, which is what keeps the
//! firing semantics identical across them. Timestamps are injected so
//! replaying a persisted event history reproduces case state exactly.

pub mod enablement;
pub mod firing;

use chrono::{DateTime, Utc};

use crate::case::{BusyTask, Case, CaseId, CaseLifecycle};
use crate::error::{WorkflowError, WorkflowResult};
use crate::events::{EventKind, ExternalEvent, LifecycleEvent};
use crate::item::lifecycle::{LeaseTick, WorkItemManager};
use crate::item::multi_instance::{self, MiProgress};
use crate::item::{ItemId, WorkItemState};
use crate::spec::types::{CreationMode, Net, Specification, Task, TaskKind};

/// Firings per advance pass before the runner assumes a livelock
const MAX_FIRINGS_PER_ADVANCE: u32 = 10_000;

/// Request to launch a sub-case for a fired composite task
#[derive(Debug, Clone, PartialEq)]
pub struct SubcaseRequest {
    /// Firing awaiting the sub-case
    pub firing: u64,
    /// Child net name
    pub net: String,
    /// Input data for the child case
    pub data: serde_json::Value,
}

/// Effects of one runner invocation
///
/// The caller (engine variant) owns delivery: it offers new items to the
/// allocator, launches or cancels sub-cases, and forwards notifications.
#[derive(Debug, Default)]
pub struct Advance {
    /// Lifecycle notifications, in emission order
    pub notifications: Vec<LifecycleEvent>,
    /// Items now Enabled and awaiting offer
    pub new_items: Vec<ItemId>,
    /// Sub-cases to launch
    pub subcase_requests: Vec<SubcaseRequest>,
    /// Sub-cases to cancel (cascading cancellation)
    pub cancel_subcases: Vec<CaseId>,
}

/// The token-game state machine for one specification
pub struct NetRunner<'a> {
    spec: &'a Specification,
    lease_ttl_ms: u64,
    max_attempts: u32,
}

impl<'a> NetRunner<'a> {
    /// Create a runner over a loaded specification
    pub fn new(spec: &'a Specification, lease_ttl_ms: u64, max_attempts: u32) -> Self {
        Self {
            spec,
            lease_ttl_ms,
            max_attempts,
        }
    }

    fn manager(&self) -> WorkItemManager<'a> {
        WorkItemManager::new(self.spec, self.lease_ttl_ms, self.max_attempts)
    }

    fn net(&self, case: &Case) -> WorkflowResult<&'a Net> {
        self.spec.get_net(&case.net_name).ok_or_else(|| {
            WorkflowError::InvariantBroken(format!(
                "net {} missing from specification {}",
                case.net_name, self.spec.id
            ))
        })
    }

    fn task(&self, case: &Case, task_id: &str) -> WorkflowResult<&'a Task> {
        self.net(case)?.tasks.get(task_id).ok_or_else(|| {
            WorkflowError::InvariantBroken(format!(
                "task {task_id} missing from net {}",
                case.net_name
            ))
        })
    }

    /// Start a freshly created case and fire until quiescent
    pub fn launch(&self, case: &mut Case, now: DateTime<Utc>) -> WorkflowResult<Advance> {
        let mut out = Advance::default();
        case.start()?;
        case.record_audit("launched", None, now);
        out.notifications.push(LifecycleEvent::CaseLaunched {
            case_id: case.id,
            spec_id: case.spec_id.clone(),
        });
        tracing::info!(case_id = %case.id, spec_id = %case.spec_id, "case launched");
        self.advance_into(case, now, &mut out)?;
        Ok(out)
    }

    /// Fire enabled transitions until quiescent, then check termination
    pub fn advance(&self, case: &mut Case, now: DateTime<Utc>) -> WorkflowResult<Advance> {
        let mut out = Advance::default();
        self.advance_into(case, now, &mut out)?;
        Ok(out)
    }

    fn advance_into(
        &self,
        case: &mut Case,
        now: DateTime<Utc>,
        out: &mut Advance,
    ) -> WorkflowResult<()> {
        if case.lifecycle != CaseLifecycle::Executing {
            return Ok(());
        }
        let mut fired: u32 = 0;
        loop {
            let net = self.net(case)?;
            let next = enablement::enabled_tasks(net, &case.marking)
                .first()
                .map(|t| t.id.clone());
            let Some(task_id) = next else { break };

            fired += 1;
            if fired > MAX_FIRINGS_PER_ADVANCE {
                self.fail_case(
                    case,
                    "livelock: firing budget exhausted in one advance pass".to_string(),
                    now,
                    out,
                );
                return Ok(());
            }
            if let Err(err) = self.fire_task(case, &task_id, now, out) {
                // A firing is atomic: the scratch marking was discarded, so
                // only the case lifecycle is left to settle.
                self.fail_case(case, err.to_string(), now, out);
                return Ok(());
            }
            if case.lifecycle != CaseLifecycle::Executing {
                return Ok(());
            }
        }
        self.check_termination(case, now, out)
    }

    fn fire_task(
        &self,
        case: &mut Case,
        task_id: &str,
        now: DateTime<Utc>,
        out: &mut Advance,
    ) -> WorkflowResult<()> {
        let net = self.net(case)?;
        let task = net.tasks.get(task_id).ok_or_else(|| {
            WorkflowError::InvariantBroken(format!("task {task_id} vanished from net"))
        })?;

        let places = enablement::consumption_places(net, task, &case.marking);
        if places.is_empty() {
            return Err(WorkflowError::InvariantBroken(format!(
                "task {task_id} fired with no marked sources"
            )));
        }
        let mut scratch = case.marking.clone();
        for place in &places {
            scratch.consume(place, 1)?;
        }

        let firing = case.next_firing;
        let manager = self.manager();

        match task.kind {
            TaskKind::Composite => {
                let child_net = task.decomposition.clone().ok_or_else(|| {
                    WorkflowError::InvariantBroken(format!(
                        "composite task {task_id} has no decomposition"
                    ))
                })?;
                case.marking = scratch;
                case.next_firing += 1;
                case.busy.insert(
                    firing,
                    BusyTask {
                        task_id: task.id.clone(),
                        items: Vec::new(),
                        mi: None,
                        subcase: None,
                    },
                );
                out.subcase_requests.push(SubcaseRequest {
                    firing,
                    net: child_net,
                    data: WorkItemManager::materialise_inputs(task, &case.data),
                });
            }
            TaskKind::Atomic => {
                if let Some(mi) = &task.multi_instance {
                    let fragments = match mi.creation_mode {
                        CreationMode::Static => multi_instance::expand_static(mi, &case.data)?,
                        CreationMode::Dynamic => {
                            multi_instance::expand_dynamic_initial(mi, &case.data)?
                        }
                    };
                    case.marking = scratch;
                    case.next_firing += 1;
                    let progress = MiProgress::new(mi, fragments.len());
                    let mut item_ids = Vec::with_capacity(fragments.len());
                    for (index, fragment) in fragments.iter().enumerate() {
                        let inputs = instance_inputs(task, &case.data, fragment, index);
                        let item_id = manager.create_item(
                            case,
                            task,
                            inputs,
                            Some(index),
                            &format!("item:{firing}:{index}"),
                            now,
                        );
                        out.new_items.push(item_id);
                        out.notifications.push(LifecycleEvent::ItemCreated {
                            case_id: case.id,
                            item_id,
                            task_id: task.id.clone(),
                        });
                        item_ids.push(item_id);
                    }
                    case.busy.insert(
                        firing,
                        BusyTask {
                            task_id: task.id.clone(),
                            items: item_ids,
                            mi: Some(progress),
                            subcase: None,
                        },
                    );
                } else {
                    case.marking = scratch;
                    case.next_firing += 1;
                    let inputs = WorkItemManager::materialise_inputs(task, &case.data);
                    let item_id =
                        manager.create_item(case, task, inputs, None, &format!("item:{firing}"), now);
                    case.busy.insert(
                        firing,
                        BusyTask {
                            task_id: task.id.clone(),
                            items: vec![item_id],
                            mi: None,
                            subcase: None,
                        },
                    );
                    out.new_items.push(item_id);
                    out.notifications.push(LifecycleEvent::ItemCreated {
                        case_id: case.id,
                        item_id,
                        task_id: task.id.clone(),
                    });
                }
            }
        }

        case.record_audit(format!("fired:{task_id}"), None, now);
        out.notifications.push(LifecycleEvent::TaskFired {
            case_id: case.id,
            task_id: task_id.to_string(),
            firing,
        });
        tracing::debug!(case_id = %case.id, task_id, firing, "task fired");

        // A multi-instance task whose threshold is already met (min = 0)
        // completes in the same pass.
        self.maybe_complete_mi(case, firing, now, out)
    }

    /// Link a launched sub-case to its awaiting firing
    pub fn attach_subcase(
        &self,
        case: &mut Case,
        firing: u64,
        child: CaseId,
    ) -> WorkflowResult<()> {
        let busy = case.busy.get_mut(&firing).ok_or_else(|| {
            WorkflowError::InvariantBroken(format!("firing {firing} not awaiting a sub-case"))
        })?;
        busy.subcase = Some(child);
        case.subcases.insert(child, firing);
        Ok(())
    }

    /// Apply one external event, then fire until quiescent
    ///
    /// Replaying an `event_id` the case has already applied is a no-op.
    /// Caller errors (unknown item, precondition, validation) leave the
    /// case untouched; internal errors fail the case.
    pub fn apply_event(
        &self,
        case: &mut Case,
        event: &ExternalEvent,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Advance> {
        let mut out = Advance::default();

        if case.lifecycle.is_terminal() {
            // Cancelling a terminal case is a no-op returning the same
            // state; anything else is refused.
            if matches!(event.kind, EventKind::CancelCase)
                || case.seen_events.contains(&event.event_id)
            {
                return Ok(out);
            }
            return Err(WorkflowError::PreconditionViolated(format!(
                "case {} is {}; no further events accepted",
                case.id, case.lifecycle
            )));
        }
        if case.seen_events.contains(&event.event_id) {
            return Ok(out);
        }
        if case.lifecycle == CaseLifecycle::Suspended
            && !matches!(event.kind, EventKind::CancelCase | EventKind::ResumeCase)
        {
            return Err(WorkflowError::PreconditionViolated(format!(
                "case {} is suspended",
                case.id
            )));
        }

        match self.dispatch(case, &event.kind, now, &mut out) {
            Ok(()) => {}
            Err(err) if is_caller_error(&err) => return Err(err),
            Err(err) => {
                self.fail_case(case, err.to_string(), now, &mut out);
                case.register_event(&event.event_id);
                return Ok(out);
            }
        }

        case.register_event(&event.event_id);
        case.record_audit(
            format!("event:{}", event_name(&event.kind)),
            Some(&event.event_id),
            now,
        );
        self.advance_into(case, now, &mut out)?;
        Ok(out)
    }

    fn dispatch(
        &self,
        case: &mut Case,
        kind: &EventKind,
        now: DateTime<Utc>,
        out: &mut Advance,
    ) -> WorkflowResult<()> {
        match kind {
            EventKind::CompleteWorkItem { item_id, outputs } => {
                self.complete_work_item(case, item_id, outputs.clone(), now, out)
            }
            EventKind::FailWorkItem { item_id, error } => {
                self.fail_work_item(case, item_id, error.clone(), now, out)
            }
            EventKind::CancelWorkItem { item_id } => {
                self.cancel_work_item(case, item_id, now, out)
            }
            EventKind::DelegateWorkItem {
                item_id,
                from_worker,
                to_worker,
            } => {
                self.manager()
                    .delegate(case, item_id, from_worker, to_worker, now)?;
                out.notifications.push(LifecycleEvent::ItemStateChanged {
                    case_id: case.id,
                    item_id: *item_id,
                    state: WorkItemState::Allocated,
                });
                Ok(())
            }
            EventKind::CancelCase => self.cancel_case(case, now, out),
            EventKind::SuspendCase => {
                case.suspend()?;
                out.notifications
                    .push(LifecycleEvent::CaseSuspended { case_id: case.id });
                Ok(())
            }
            EventKind::ResumeCase => {
                case.resume()?;
                out.notifications
                    .push(LifecycleEvent::CaseResumed { case_id: case.id });
                Ok(())
            }
            EventKind::TimerFired { task_id } => self.timer_fired(case, task_id, now, out),
            EventKind::LeaseExpired { item_id } => self.lease_expired(case, item_id, now, out),
            EventKind::OfferItem { item_id } => {
                self.manager().offer(case, item_id, now)?;
                out.notifications.push(LifecycleEvent::ItemStateChanged {
                    case_id: case.id,
                    item_id: *item_id,
                    state: WorkItemState::Offered,
                });
                Ok(())
            }
            EventKind::CheckoutItem { item_id, worker_id } => {
                self.manager().checkout(case, item_id, worker_id, now)?;
                out.notifications.push(LifecycleEvent::ItemStateChanged {
                    case_id: case.id,
                    item_id: *item_id,
                    state: WorkItemState::Allocated,
                });
                Ok(())
            }
            EventKind::CheckinItem {
                item_id,
                worker_id,
                outputs,
            } => self.checkin_item(case, item_id, worker_id, outputs.clone(), now, out),
            EventKind::StartItem { item_id, worker_id } => {
                self.manager().start(case, item_id, worker_id, now)?;
                out.notifications.push(LifecycleEvent::ItemStateChanged {
                    case_id: case.id,
                    item_id: *item_id,
                    state: WorkItemState::Started,
                });
                Ok(())
            }
            EventKind::HeartbeatItem { item_id, worker_id } => {
                self.manager().heartbeat(case, item_id, worker_id, now)?;
                Ok(())
            }
            EventKind::AttachSubcase { firing, child } => self.attach_subcase(case, *firing, *child),
            EventKind::SubcaseSettled {
                child,
                lifecycle,
                data,
            } => self.settle_subcase(case, *child, *lifecycle, data.clone(), now, out),
        }
    }

    fn complete_work_item(
        &self,
        case: &mut Case,
        item_id: &ItemId,
        outputs: serde_json::Value,
        now: DateTime<Utc>,
        out: &mut Advance,
    ) -> WorkflowResult<()> {
        let item = case.item(item_id)?;
        if !item.is_live() {
            return Err(WorkflowError::PreconditionViolated(format!(
                "item {item_id} is {} and cannot complete",
                item.state
            )));
        }
        let task_id = item.task_id.clone();
        let instance_index = item.instance_index;
        let actor = item.assignee.clone().unwrap_or_else(|| "engine".to_string());
        let task = self.task(case, &task_id)?;

        crate::item::lifecycle::validate_outputs(task, &outputs).map_err(|message| {
            WorkflowError::OutputValidationFailed {
                item_id: item_id.to_string(),
                message,
            }
        })?;

        let firing = case.firing_of_item(item_id);
        force_item_terminal(
            case,
            item_id,
            WorkItemState::Completed,
            Some(outputs.clone()),
            &actor,
            now,
        )?;
        out.notifications.push(LifecycleEvent::ItemStateChanged {
            case_id: case.id,
            item_id: *item_id,
            state: WorkItemState::Completed,
        });
        self.resume_after_completion(case, item_id, instance_index, firing, outputs, now, out)
    }

    /// Resume the enclosing firing once an item's outputs are consumed
    fn resume_after_completion(
        &self,
        case: &mut Case,
        item_id: &ItemId,
        instance_index: Option<usize>,
        firing: Option<u64>,
        outputs: serde_json::Value,
        now: DateTime<Utc>,
        out: &mut Advance,
    ) -> WorkflowResult<()> {
        let Some(firing) = firing else {
            // Compensation items stand outside any firing.
            return Ok(());
        };

        let is_mi = case
            .busy
            .get(&firing)
            .is_some_and(|busy| busy.mi.is_some());
        if is_mi {
            let index = instance_index.ok_or_else(|| {
                WorkflowError::InvariantBroken(format!(
                    "item {item_id} in a multi-instance firing has no instance index"
                ))
            })?;
            if let Some(busy) = case.busy.get_mut(&firing) {
                if let Some(mi) = busy.mi.as_mut() {
                    mi.record_completed(index, outputs);
                }
            }
            self.maybe_create_dynamic_instance(case, firing, now, out)?;
            self.maybe_complete_mi(case, firing, now, out)
        } else {
            self.complete_firing(case, firing, &outputs, now, out)
        }
    }

    /// Worker checkin with outputs: validation failures burn the item's
    /// retry budget per the checkout/checkin contract
    fn checkin_item(
        &self,
        case: &mut Case,
        item_id: &ItemId,
        worker_id: &str,
        outputs: serde_json::Value,
        now: DateTime<Utc>,
        out: &mut Advance,
    ) -> WorkflowResult<()> {
        let instance_index = case.item(item_id)?.instance_index;
        let firing = case.firing_of_item(item_id);
        let outcome = self
            .manager()
            .checkin_complete(case, item_id, worker_id, outputs.clone(), now)?;
        match outcome {
            crate::item::CheckinOutcome::Completed => {
                out.notifications.push(LifecycleEvent::ItemStateChanged {
                    case_id: case.id,
                    item_id: *item_id,
                    state: WorkItemState::Completed,
                });
                self.resume_after_completion(
                    case,
                    item_id,
                    instance_index,
                    firing,
                    outputs,
                    now,
                    out,
                )
            }
            crate::item::CheckinOutcome::RetryValidation { message } => {
                tracing::info!(case_id = %case.id, item_id = %item_id, %message, "checkin outputs rejected, retry granted");
                out.notifications.push(LifecycleEvent::ItemStateChanged {
                    case_id: case.id,
                    item_id: *item_id,
                    state: WorkItemState::Allocated,
                });
                Ok(())
            }
            crate::item::CheckinOutcome::Failed { message } => {
                out.notifications.push(LifecycleEvent::ItemStateChanged {
                    case_id: case.id,
                    item_id: *item_id,
                    state: WorkItemState::Failed,
                });
                match firing {
                    Some(firing) => self.handle_item_failure(
                        case,
                        firing,
                        serde_json::json!({"reason": "output-validation", "message": message}),
                        now,
                        out,
                    ),
                    None => Ok(()),
                }
            }
        }
    }

    fn maybe_create_dynamic_instance(
        &self,
        case: &mut Case,
        firing: u64,
        now: DateTime<Utc>,
        out: &mut Advance,
    ) -> WorkflowResult<()> {
        let Some(busy) = case.busy.get(&firing) else {
            return Ok(());
        };
        let task = self.task(case, &busy.task_id)?;
        let Some(mi_spec) = &task.multi_instance else {
            return Ok(());
        };
        let Some(progress) = &busy.mi else {
            return Ok(());
        };
        if !progress.can_create_more() || progress.threshold_met() {
            return Ok(());
        }
        let create = mi_spec
            .creation_predicate
            .as_ref()
            .is_some_and(|p| p.evaluate(&case.data));
        if !create {
            return Ok(());
        }

        let index = progress.created;
        let fragment = multi_instance::dynamic_fragment(mi_spec, &case.data, index);
        let inputs = instance_inputs(task, &case.data, &fragment, index);
        let item_id = self
            .manager()
            .create_item(case, task, inputs, Some(index), &format!("item:{firing}:{index}"), now);
        if let Some(busy) = case.busy.get_mut(&firing) {
            busy.items.push(item_id);
            if let Some(mi) = busy.mi.as_mut() {
                mi.created += 1;
            }
        }
        out.new_items.push(item_id);
        out.notifications.push(LifecycleEvent::ItemCreated {
            case_id: case.id,
            item_id,
            task_id: task.id.clone(),
        });
        Ok(())
    }

    fn maybe_complete_mi(
        &self,
        case: &mut Case,
        firing: u64,
        now: DateTime<Utc>,
        out: &mut Advance,
    ) -> WorkflowResult<()> {
        let Some(busy) = case.busy.get(&firing) else {
            return Ok(());
        };
        let Some(progress) = busy.mi.clone() else {
            return Ok(());
        };
        if !progress.threshold_met() {
            return Ok(());
        }
        let task_id = busy.task_id.clone();
        let outstanding: Vec<ItemId> = busy
            .items
            .iter()
            .filter(|id| case.items.get(id).is_some_and(|i| i.is_live()))
            .copied()
            .collect();

        let task = self.task(case, &task_id)?;
        let compensate = task.compensate_past_threshold;
        let manager = self.manager();
        for id in outstanding {
            if let Some(comp) = manager.cancel_item(case, &id, "threshold-met", compensate, now)? {
                out.new_items.push(comp);
                out.notifications.push(LifecycleEvent::ItemCreated {
                    case_id: case.id,
                    item_id: comp,
                    task_id: case.item(&comp)?.task_id.clone(),
                });
            }
            if let Ok(item) = case.item(&id) {
                out.notifications.push(LifecycleEvent::ItemStateChanged {
                    case_id: case.id,
                    item_id: id,
                    state: item.state,
                });
            }
        }

        // Completion data: per out-parameter, the ordered list of completed
        // instance values.
        let task = self.task(case, &task_id)?;
        let ordered = progress.ordered_outputs();
        let mut aggregated = serde_json::Map::new();
        for param in task.output_parameters() {
            let values: Vec<serde_json::Value> = ordered
                .iter()
                .map(|o| o.get(&param.name).cloned().unwrap_or(serde_json::Value::Null))
                .collect();
            aggregated.insert(param.name.clone(), serde_json::Value::Array(values));
        }
        self.complete_firing(case, firing, &serde_json::Value::Object(aggregated), now, out)
    }

    fn complete_firing(
        &self,
        case: &mut Case,
        firing: u64,
        outputs: &serde_json::Value,
        now: DateTime<Utc>,
        out: &mut Advance,
    ) -> WorkflowResult<()> {
        let busy = case.busy.remove(&firing).ok_or_else(|| {
            WorkflowError::InvariantBroken(format!("firing {firing} already completed"))
        })?;
        let net = self.net(case)?;
        let task = net.tasks.get(&busy.task_id).ok_or_else(|| {
            WorkflowError::InvariantBroken(format!("task {} vanished from net", busy.task_id))
        })?;

        firing::apply_outputs(&mut case.data, task, outputs);
        let flows = firing::select_split_flows(net, task, &case.data)?;
        for flow in flows {
            case.marking.produce(&net.target_place(flow), 1);
        }
        self.apply_cancellation_region(case, task, now, out)?;

        case.record_audit(format!("completed:{}", busy.task_id), None, now);
        out.notifications.push(LifecycleEvent::TaskCompleted {
            case_id: case.id,
            task_id: busy.task_id.clone(),
            firing,
        });
        tracing::debug!(case_id = %case.id, task_id = %busy.task_id, firing, "firing completed");
        Ok(())
    }

    fn apply_cancellation_region(
        &self,
        case: &mut Case,
        task: &Task,
        now: DateTime<Utc>,
        out: &mut Advance,
    ) -> WorkflowResult<()> {
        if task.cancellation_region.is_empty() {
            return Ok(());
        }
        let net = self.net(case)?;
        let manager = self.manager();
        for element in &task.cancellation_region {
            if net.tasks.contains_key(element) {
                // Cancel live items of the task and abandon its firings.
                let ids: Vec<ItemId> = case
                    .items
                    .values()
                    .filter(|i| i.task_id == *element && i.is_live())
                    .map(|i| i.id)
                    .collect();
                for id in ids {
                    if let Some(comp) =
                        manager.cancel_item(case, &id, "region-cancel", true, now)?
                    {
                        out.new_items.push(comp);
                        out.notifications.push(LifecycleEvent::ItemCreated {
                            case_id: case.id,
                            item_id: comp,
                            task_id: element.clone(),
                        });
                    }
                    if let Ok(item) = case.item(&id) {
                        out.notifications.push(LifecycleEvent::ItemStateChanged {
                            case_id: case.id,
                            item_id: id,
                            state: item.state,
                        });
                    }
                }
                let firings: Vec<u64> = case
                    .busy
                    .iter()
                    .filter(|(_, b)| b.task_id == *element)
                    .map(|(f, _)| *f)
                    .collect();
                for f in firings {
                    if let Some(busy) = case.busy.remove(&f) {
                        if let Some(child) = busy.subcase {
                            case.subcases.remove(&child);
                            out.cancel_subcases.push(child);
                        }
                    }
                }
            } else {
                let drained = case.marking.drain(element);
                if drained > 0 {
                    tracing::debug!(case_id = %case.id, condition = %element, drained, "cancellation region drained tokens");
                }
            }
        }
        case.record_audit(format!("region:{}", task.id), None, now);
        Ok(())
    }

    fn fail_work_item(
        &self,
        case: &mut Case,
        item_id: &ItemId,
        error: serde_json::Value,
        now: DateTime<Utc>,
        out: &mut Advance,
    ) -> WorkflowResult<()> {
        let item = case.item(item_id)?;
        if !item.is_live() {
            return Err(WorkflowError::PreconditionViolated(format!(
                "item {item_id} is {} and cannot fail",
                item.state
            )));
        }
        let actor = item.assignee.clone().unwrap_or_else(|| "engine".to_string());
        let firing = case.firing_of_item(item_id);
        force_item_terminal(case, item_id, WorkItemState::Failed, None, &actor, now)?;
        out.notifications.push(LifecycleEvent::ItemStateChanged {
            case_id: case.id,
            item_id: *item_id,
            state: WorkItemState::Failed,
        });

        let Some(firing) = firing else {
            // A failed compensation item has no firing to resume; it is
            // logged and the case carries on.
            tracing::warn!(case_id = %case.id, item_id = %item_id, "compensation item failed");
            return Ok(());
        };
        self.handle_item_failure(case, firing, error, now, out)
    }

    fn handle_item_failure(
        &self,
        case: &mut Case,
        firing: u64,
        error: serde_json::Value,
        now: DateTime<Utc>,
        out: &mut Advance,
    ) -> WorkflowResult<()> {
        let Some(busy) = case.busy.get_mut(&firing) else {
            return Ok(());
        };
        if let Some(mi) = busy.mi.as_mut() {
            mi.record_failed();
            if !mi.threshold_unreachable() {
                return Ok(());
            }
            return self.fail_mi_firing(case, firing, error, now, out);
        }
        self.fail_firing(case, firing, error, now, out)
    }

    /// Cancel a failed multi-instance firing's survivors, then fail it
    fn fail_mi_firing(
        &self,
        case: &mut Case,
        firing: u64,
        error: serde_json::Value,
        now: DateTime<Utc>,
        out: &mut Advance,
    ) -> WorkflowResult<()> {
        let live: Vec<ItemId> = case
            .busy
            .get(&firing)
            .map(|busy| {
                busy.items
                    .iter()
                    .filter(|id| case.items.get(id).is_some_and(|i| i.is_live()))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        let manager = self.manager();
        for id in live {
            manager.cancel_item(case, &id, "threshold-unreachable", false, now)?;
            if let Ok(item) = case.item(&id) {
                out.notifications.push(LifecycleEvent::ItemStateChanged {
                    case_id: case.id,
                    item_id: id,
                    state: item.state,
                });
            }
        }
        self.fail_firing(case, firing, error, now, out)
    }

    /// Route a failed firing through its error arcs, or fail the case
    fn fail_firing(
        &self,
        case: &mut Case,
        firing: u64,
        error: serde_json::Value,
        now: DateTime<Utc>,
        out: &mut Advance,
    ) -> WorkflowResult<()> {
        let Some(busy) = case.busy.remove(&firing) else {
            return Ok(());
        };
        let net = self.net(case)?;
        let task = net.tasks.get(&busy.task_id).ok_or_else(|| {
            WorkflowError::InvariantBroken(format!("task {} vanished from net", busy.task_id))
        })?;

        let error_flows = firing::select_error_flows(net, task, &case.data, &error);
        if error_flows.is_empty() {
            self.fail_case(
                case,
                format!("work item of task {} failed with no error arc", busy.task_id),
                now,
                out,
            );
            return Ok(());
        }

        for flow in error_flows {
            case.marking.produce(&net.target_place(flow), 1);
        }
        self.apply_cancellation_region(case, task, now, out)?;
        case.record_audit(format!("error-arc:{}", busy.task_id), None, now);
        out.notifications.push(LifecycleEvent::TaskCompleted {
            case_id: case.id,
            task_id: busy.task_id.clone(),
            firing,
        });
        tracing::info!(case_id = %case.id, task_id = %busy.task_id, "firing resumed along error arc");
        Ok(())
    }

    fn cancel_work_item(
        &self,
        case: &mut Case,
        item_id: &ItemId,
        now: DateTime<Utc>,
        out: &mut Advance,
    ) -> WorkflowResult<()> {
        let item = case.item(item_id)?;
        if !item.is_live() {
            // Cancelling a settled item is benign.
            return Ok(());
        }
        let firing = case.firing_of_item(item_id);
        let manager = self.manager();
        if let Some(comp) = manager.cancel_item(case, item_id, "cancel-item", true, now)? {
            out.new_items.push(comp);
            out.notifications.push(LifecycleEvent::ItemCreated {
                case_id: case.id,
                item_id: comp,
                task_id: case.item(&comp)?.task_id.clone(),
            });
        }
        if let Ok(item) = case.item(item_id) {
            out.notifications.push(LifecycleEvent::ItemStateChanged {
                case_id: case.id,
                item_id: *item_id,
                state: item.state,
            });
        }

        let Some(firing) = firing else {
            return Ok(());
        };
        let is_mi = case
            .busy
            .get(&firing)
            .is_some_and(|busy| busy.mi.is_some());
        if is_mi {
            let mut unreachable = false;
            if let Some(busy) = case.busy.get_mut(&firing) {
                if let Some(mi) = busy.mi.as_mut() {
                    mi.record_cancelled();
                    unreachable = mi.threshold_unreachable();
                }
            }
            if unreachable {
                return self.fail_mi_firing(
                    case,
                    firing,
                    serde_json::json!({"reason": "threshold-unreachable"}),
                    now,
                    out,
                );
            }
            Ok(())
        } else {
            // A single-instance firing without its item is abandoned; the
            // consumed tokens stay consumed (cancel-task semantics).
            case.busy.remove(&firing);
            Ok(())
        }
    }

    fn cancel_case(
        &self,
        case: &mut Case,
        now: DateTime<Utc>,
        out: &mut Advance,
    ) -> WorkflowResult<()> {
        let manager = self.manager();
        let live: Vec<ItemId> = case.live_items().map(|i| i.id).collect();
        for id in live {
            // Case-level cancellation does not compensate: the case is
            // terminal and compensation items would never run.
            manager.cancel_item(case, &id, "case-cancel", false, now)?;
            if let Ok(item) = case.item(&id) {
                out.notifications.push(LifecycleEvent::ItemStateChanged {
                    case_id: case.id,
                    item_id: id,
                    state: item.state,
                });
            }
        }
        for child in case.subcases.keys().copied().collect::<Vec<_>>() {
            out.cancel_subcases.push(child);
        }
        case.subcases.clear();
        case.busy.clear();
        case.cancel(now)?;
        case.record_audit("cancelled", None, now);
        out.notifications
            .push(LifecycleEvent::CaseCancelled { case_id: case.id });
        tracing::info!(case_id = %case.id, "case cancelled");
        Ok(())
    }

    fn timer_fired(
        &self,
        case: &mut Case,
        task_id: &str,
        now: DateTime<Utc>,
        out: &mut Advance,
    ) -> WorkflowResult<()> {
        let item_id = case
            .items
            .values()
            .find(|i| i.task_id == task_id && i.is_live())
            .map(|i| i.id)
            .ok_or_else(|| {
                WorkflowError::PreconditionViolated(format!(
                    "no live work item for timer task {task_id}"
                ))
            })?;
        // Timer tasks complete with empty outputs; their cancellation
        // region does the real work.
        self.complete_work_item(
            case,
            &item_id,
            serde_json::Value::Object(serde_json::Map::new()),
            now,
            out,
        )
    }

    fn lease_expired(
        &self,
        case: &mut Case,
        item_id: &ItemId,
        now: DateTime<Utc>,
        out: &mut Advance,
    ) -> WorkflowResult<()> {
        let manager = self.manager();
        match manager.lease_tick(case, item_id, now)? {
            LeaseTick::Current | LeaseTick::Missed(_) => Ok(()),
            LeaseTick::Reclaimed => {
                out.new_items.push(*item_id);
                out.notifications.push(LifecycleEvent::ItemStateChanged {
                    case_id: case.id,
                    item_id: *item_id,
                    state: WorkItemState::Enabled,
                });
                Ok(())
            }
            LeaseTick::Exhausted => {
                out.notifications.push(LifecycleEvent::ItemStateChanged {
                    case_id: case.id,
                    item_id: *item_id,
                    state: WorkItemState::Failed,
                });
                match case.firing_of_item(item_id) {
                    Some(firing) => self.handle_item_failure(
                        case,
                        firing,
                        serde_json::json!({"reason": "lease-expired"}),
                        now,
                        out,
                    ),
                    None => Ok(()),
                }
            }
        }
    }

    /// Settle a sub-case's terminal state into its parent
    pub fn subcase_terminal(
        &self,
        parent: &mut Case,
        child: CaseId,
        lifecycle: CaseLifecycle,
        child_data: serde_json::Value,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Advance> {
        let mut out = Advance::default();
        self.settle_subcase(parent, child, lifecycle, child_data, now, &mut out)?;
        self.advance_into(parent, now, &mut out)?;
        Ok(out)
    }

    fn settle_subcase(
        &self,
        parent: &mut Case,
        child: CaseId,
        lifecycle: CaseLifecycle,
        child_data: serde_json::Value,
        now: DateTime<Utc>,
        out: &mut Advance,
    ) -> WorkflowResult<()> {
        let Some(firing) = parent.subcases.remove(&child) else {
            return Ok(());
        };
        if parent.lifecycle.is_terminal() {
            return Ok(());
        }
        match lifecycle {
            CaseLifecycle::Completed => {
                if let Err(err) = self.complete_firing(parent, firing, &child_data, now, out) {
                    self.fail_case(parent, err.to_string(), now, out);
                }
                Ok(())
            }
            CaseLifecycle::Cancelled | CaseLifecycle::Failed => {
                let reason = serde_json::json!({"reason": format!("subcase-{lifecycle}")});
                self.handle_item_failure(parent, firing, reason, now, out)
            }
            other => Err(WorkflowError::InvariantBroken(format!(
                "sub-case {child} reported non-terminal lifecycle {other}"
            ))),
        }
    }

    fn check_termination(
        &self,
        case: &mut Case,
        now: DateTime<Utc>,
        out: &mut Advance,
    ) -> WorkflowResult<()> {
        if case.lifecycle != CaseLifecycle::Executing {
            return Ok(());
        }
        let net = self.net(case)?;
        let live = case.live_items().count();
        let quiescent = live == 0 && case.busy.is_empty() && case.subcases.is_empty();

        if quiescent && case.marking.is_exactly(&net.output_condition) {
            case.complete(now)?;
            case.record_audit("completed", None, now);
            out.notifications
                .push(LifecycleEvent::CaseCompleted { case_id: case.id });
            tracing::info!(case_id = %case.id, "case completed");
            return Ok(());
        }

        if quiescent && enablement::enabled_tasks(net, &case.marking).is_empty() {
            self.fail_case(
                case,
                "deadlock: no enabled transitions and no pending work".to_string(),
                now,
                out,
            );
        }
        Ok(())
    }

    fn fail_case(&self, case: &mut Case, error: String, now: DateTime<Utc>, out: &mut Advance) {
        if case.lifecycle.is_terminal() {
            return;
        }
        let manager = self.manager();
        let live: Vec<ItemId> = case.live_items().map(|i| i.id).collect();
        for id in live {
            if manager.cancel_item(case, &id, "case-failed", false, now).is_ok() {
                if let Ok(item) = case.item(&id) {
                    out.notifications.push(LifecycleEvent::ItemStateChanged {
                        case_id: case.id,
                        item_id: id,
                        state: item.state,
                    });
                }
            }
        }
        for child in case.subcases.keys().copied().collect::<Vec<_>>() {
            out.cancel_subcases.push(child);
        }
        case.subcases.clear();
        case.busy.clear();
        if case.fail(error.clone(), now).is_ok() {
            case.record_audit("failed", None, now);
            out.notifications.push(LifecycleEvent::CaseFailed {
                case_id: case.id,
                error: error.clone(),
            });
        }
        tracing::error!(case_id = %case.id, %error, "case failed");
    }
}

/// Per-instance inputs: the task's in-parameters plus the selector fragment
fn instance_inputs(
    task: &Task,
    data: &serde_json::Value,
    fragment: &serde_json::Value,
    index: usize,
) -> serde_json::Value {
    let mut inputs = match WorkItemManager::materialise_inputs(task, data) {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    inputs.insert("instance".to_string(), fragment.clone());
    inputs.insert("instance_index".to_string(), serde_json::json!(index));
    serde_json::Value::Object(inputs)
}

/// Walk an item through the legal chain to a terminal state
///
/// External events may settle items that never went through the allocator
/// (automated flows, the stateless variant); the walk keeps the history
/// complete and the transition table authoritative.
fn force_item_terminal(
    case: &mut Case,
    item_id: &ItemId,
    target: WorkItemState,
    outputs: Option<serde_json::Value>,
    actor: &str,
    now: DateTime<Utc>,
) -> WorkflowResult<()> {
    let item = case.item_mut(item_id)?;
    if let Some(outputs) = outputs {
        item.outputs = Some(outputs);
    }
    let mut guard = 0;
    while item.state != target {
        let next = match item.state {
            WorkItemState::Enabled => WorkItemState::Offered,
            WorkItemState::Offered => WorkItemState::Allocated,
            WorkItemState::Delegated => WorkItemState::Allocated,
            WorkItemState::Allocated => WorkItemState::Started,
            WorkItemState::Started => target,
            terminal => {
                return Err(WorkflowError::PreconditionViolated(format!(
                    "item {item_id} is {terminal} and cannot reach {target}"
                )))
            }
        };
        item.transition(next, actor, now)?;
        if next == WorkItemState::Allocated && item.assignee.is_none() {
            item.assignee = Some(actor.to_string());
        }
        guard += 1;
        if guard > 8 {
            return Err(WorkflowError::InvariantBroken(format!(
                "item {item_id} transition walk did not converge"
            )));
        }
    }
    Ok(())
}

fn is_caller_error(err: &WorkflowError) -> bool {
    matches!(
        err,
        WorkflowError::CaseNotFound(_)
            | WorkflowError::ItemNotFound(_)
            | WorkflowError::PreconditionViolated(_)
            | WorkflowError::OutputValidationFailed { .. }
            | WorkflowError::RoutingRejected(_)
    )
}

fn event_name(kind: &EventKind) -> &'static str {
    match kind {
        EventKind::CompleteWorkItem { .. } => "complete_work_item",
        EventKind::FailWorkItem { .. } => "fail_work_item",
        EventKind::CancelWorkItem { .. } => "cancel_work_item",
        EventKind::DelegateWorkItem { .. } => "delegate_work_item",
        EventKind::CancelCase => "cancel_case",
        EventKind::SuspendCase => "suspend_case",
        EventKind::ResumeCase => "resume_case",
        EventKind::TimerFired { .. } => "timer_fired",
        EventKind::LeaseExpired { .. } => "lease_expired",
        EventKind::OfferItem { .. } => "offer_item",
        EventKind::CheckoutItem { .. } => "checkout_item",
        EventKind::CheckinItem { .. } => "checkin_item",
        EventKind::StartItem { .. } => "start_item",
        EventKind::HeartbeatItem { .. } => "heartbeat_item",
        EventKind::AttachSubcase { .. } => "attach_subcase",
        EventKind::SubcaseSettled { .. } => "subcase_settled",
    }
}
