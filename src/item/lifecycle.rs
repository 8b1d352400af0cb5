//! Work item lifecycle manager
//!
//! Mediates between the net runner and the resource allocator: materialises
//! inputs, enforces the checkout/checkin contract, validates outputs,
//! manages leases and retry budgets, and creates compensation items.

use chrono::{DateTime, Utc};

use crate::case::Case;
use crate::error::{WorkflowError, WorkflowResult};
use crate::item::{ItemId, Lease, WorkItem, WorkItemState};
use crate::spec::types::{Specification, Task};

/// Outcome of a checkin carrying outputs
#[derive(Debug, Clone, PartialEq)]
pub enum CheckinOutcome {
    /// Outputs validated; the item is Completed and the runner may resume
    Completed,
    /// Validation failed within the retry budget; item back to Allocated
    /// under the same assignee with an error payload
    RetryValidation { message: String },
    /// Retry budget exhausted; item Failed
    Failed { message: String },
}

/// Outcome of a lease sweep tick on one item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseTick {
    /// Lease still current
    Current,
    /// One heartbeat missed; lease extended to detect the second miss
    Missed(u32),
    /// Two misses: item reclaimed to Enabled with attempt incremented
    Reclaimed,
    /// Attempts exhausted: item Failed
    Exhausted,
}

/// Per-case work item operations
///
/// Holds the specification and the engine-level defaults; all mutable
/// state lives on the case.
pub struct WorkItemManager<'a> {
    spec: &'a Specification,
    default_lease_ttl_ms: u64,
    default_max_attempts: u32,
}

impl<'a> WorkItemManager<'a> {
    /// Create a manager for one specification
    pub fn new(spec: &'a Specification, default_lease_ttl_ms: u64, default_max_attempts: u32) -> Self {
        Self {
            spec,
            default_lease_ttl_ms,
            default_max_attempts,
        }
    }

    fn task(&self, case: &Case, task_id: &str) -> WorkflowResult<&'a Task> {
        self.spec
            .get_net(&case.net_name)
            .and_then(|net| net.tasks.get(task_id))
            .ok_or_else(|| {
                WorkflowError::InvariantBroken(format!(
                    "task {task_id} missing from net {}",
                    case.net_name
                ))
            })
    }

    fn lease_ttl_ms(&self, task: &Task) -> u64 {
        task.lease_ttl_ms.unwrap_or(self.default_lease_ttl_ms)
    }

    fn max_attempts(&self, task: &Task) -> u32 {
        task.max_attempts.unwrap_or(self.default_max_attempts)
    }

    /// Create an Enabled item for a fired atomic task
    ///
    /// `seed` makes the id replay-stable: the same firing recreates the
    /// same item id during log replay.
    pub fn create_item(
        &self,
        case: &mut Case,
        task: &Task,
        inputs: serde_json::Value,
        instance_index: Option<usize>,
        seed: &str,
        now: DateTime<Utc>,
    ) -> ItemId {
        let mut item = WorkItem::enabled(case.id, &task.id, inputs, now);
        item.id = ItemId::derived(case.id, seed);
        item.instance_index = instance_index;
        item.urgent = task.urgent;
        let item_id = item.id;
        tracing::debug!(case_id = %case.id, item_id = %item_id, task_id = %task.id, "work item enabled");
        case.items.insert(item_id, item);
        item_id
    }

    /// Materialise a task's input parameters from case data
    pub fn materialise_inputs(task: &Task, data: &serde_json::Value) -> serde_json::Value {
        let mut inputs = serde_json::Map::new();
        for param in task.input_parameters() {
            if let Some(value) = data.get(&param.name) {
                inputs.insert(param.name.clone(), value.clone());
            }
        }
        serde_json::Value::Object(inputs)
    }

    /// Mark an Enabled item as Offered
    pub fn offer(&self, case: &mut Case, item_id: &ItemId, now: DateTime<Utc>) -> WorkflowResult<()> {
        case.item_mut(item_id)?
            .transition(WorkItemState::Offered, "engine", now)
    }

    /// Checkout: Offered -> Allocated under `worker` with a fresh lease
    ///
    /// Returns the item's inputs and the issued lease.
    pub fn checkout(
        &self,
        case: &mut Case,
        item_id: &ItemId,
        worker: &str,
        now: DateTime<Utc>,
    ) -> WorkflowResult<(serde_json::Value, Lease)> {
        let task_id = case.item(item_id)?.task_id.clone();
        let task = self.task(case, &task_id)?;
        let ttl = self.lease_ttl_ms(task);

        let item = case.item_mut(item_id)?;
        match item.state {
            WorkItemState::Offered => {}
            WorkItemState::Allocated => {
                return Err(WorkflowError::PreconditionViolated(format!(
                    "item {item_id} is already allocated"
                )))
            }
            other => {
                return Err(WorkflowError::PreconditionViolated(format!(
                    "item {item_id} is {other}, not offered"
                )))
            }
        }
        item.transition(WorkItemState::Allocated, worker, now)?;
        item.assignee = Some(worker.to_string());
        let lease = Lease::issue(worker, ttl, now);
        item.lease = Some(lease.clone());
        tracing::debug!(case_id = %case.id, item_id = %item_id, worker, "work item allocated");
        Ok((case.item(item_id)?.data.clone(), lease))
    }

    /// Worker acknowledgement: Allocated -> Started
    pub fn start(
        &self,
        case: &mut Case,
        item_id: &ItemId,
        worker: &str,
        now: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        let item = case.item_mut(item_id)?;
        item.require_assignee(worker)?;
        item.transition(WorkItemState::Started, worker, now)
    }

    /// Checkin with outputs: validate and complete, or burn a retry
    pub fn checkin_complete(
        &self,
        case: &mut Case,
        item_id: &ItemId,
        worker: &str,
        outputs: serde_json::Value,
        now: DateTime<Utc>,
    ) -> WorkflowResult<CheckinOutcome> {
        let task_id = case.item(item_id)?.task_id.clone();
        let task = self.task(case, &task_id)?;
        let max_retries = self.max_attempts(task);
        let validation = validate_outputs(task, &outputs);

        let item = case.item_mut(item_id)?;
        item.require_assignee(worker)?;
        if !matches!(item.state, WorkItemState::Allocated | WorkItemState::Started) {
            return Err(WorkflowError::PreconditionViolated(format!(
                "item {item_id} is {}, not allocated or started",
                item.state
            )));
        }

        match validation {
            Ok(()) => {
                // Started is the normal path; checkin straight from
                // Allocated is legal per the contract.
                if item.state == WorkItemState::Allocated {
                    item.transition(WorkItemState::Started, worker, now)?;
                }
                item.outputs = Some(outputs);
                item.transition(WorkItemState::Completed, worker, now)?;
                tracing::debug!(case_id = %case.id, item_id = %item_id, "work item completed");
                Ok(CheckinOutcome::Completed)
            }
            Err(message) => {
                item.validation_retries += 1;
                if item.validation_retries >= max_retries {
                    item.transition(WorkItemState::Failed, worker, now)?;
                    tracing::warn!(case_id = %case.id, item_id = %item_id, %message, "output validation exhausted retries");
                    Ok(CheckinOutcome::Failed { message })
                } else {
                    if item.state == WorkItemState::Started {
                        item.transition(WorkItemState::Allocated, worker, now)?;
                        item.assignee = Some(worker.to_string());
                    }
                    if let Some(lease) = item.lease.as_mut() {
                        lease.renew(now);
                    }
                    Ok(CheckinOutcome::RetryValidation { message })
                }
            }
        }
    }

    /// Checkin reporting failure: item Failed, runner consults error arcs
    pub fn checkin_failed(
        &self,
        case: &mut Case,
        item_id: &ItemId,
        worker: &str,
        now: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        let item = case.item_mut(item_id)?;
        item.require_assignee(worker)?;
        if item.state == WorkItemState::Allocated {
            item.transition(WorkItemState::Started, worker, now)?;
        }
        item.transition(WorkItemState::Failed, worker, now)
    }

    /// Delegate: move the assignee atomically, lease resets
    pub fn delegate(
        &self,
        case: &mut Case,
        item_id: &ItemId,
        from_worker: &str,
        to_worker: &str,
        now: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        let task_id = case.item(item_id)?.task_id.clone();
        let task = self.task(case, &task_id)?;
        let ttl = self.lease_ttl_ms(task);

        let item = case.item_mut(item_id)?;
        item.require_assignee(from_worker)?;
        if item.state != WorkItemState::Allocated {
            return Err(WorkflowError::PreconditionViolated(format!(
                "item {item_id} is {}, only allocated items delegate",
                item.state
            )));
        }
        // History records both actors: from-worker hands off, to-worker picks up.
        item.transition(WorkItemState::Delegated, from_worker, now)?;
        item.transition(WorkItemState::Allocated, to_worker, now)?;
        item.assignee = Some(to_worker.to_string());
        item.lease = Some(Lease::issue(to_worker, ttl, now));
        tracing::debug!(case_id = %case.id, item_id = %item_id, from_worker, to_worker, "work item delegated");
        Ok(())
    }

    /// Renew the lease on a worker heartbeat
    pub fn heartbeat(
        &self,
        case: &mut Case,
        item_id: &ItemId,
        worker: &str,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Lease> {
        let item = case.item_mut(item_id)?;
        item.require_assignee(worker)?;
        let lease = item.lease.as_mut().ok_or_else(|| {
            WorkflowError::PreconditionViolated(format!("item {item_id} holds no lease"))
        })?;
        lease.renew(now);
        Ok(lease.clone())
    }

    /// Sweep one item's lease against the clock
    ///
    /// A first expiry counts a missed heartbeat and re-arms the lease; the
    /// second consecutive miss reclaims the item (Enabled, attempt + 1) or
    /// fails it once attempts are exhausted.
    pub fn lease_tick(
        &self,
        case: &mut Case,
        item_id: &ItemId,
        now: DateTime<Utc>,
    ) -> WorkflowResult<LeaseTick> {
        let task_id = case.item(item_id)?.task_id.clone();
        let task = self.task(case, &task_id)?;
        let max_attempts = self.max_attempts(task);

        let item = case.item_mut(item_id)?;
        if !matches!(item.state, WorkItemState::Allocated | WorkItemState::Started) {
            return Ok(LeaseTick::Current);
        }
        let Some(lease) = item.lease.as_mut() else {
            return Ok(LeaseTick::Current);
        };
        if !lease.is_expired(now) {
            return Ok(LeaseTick::Current);
        }

        lease.missed_heartbeats += 1;
        if lease.missed_heartbeats < 2 {
            let missed = lease.missed_heartbeats;
            lease.expires_at = now + chrono::Duration::milliseconds(lease.ttl_ms as i64);
            return Ok(LeaseTick::Missed(missed));
        }

        let worker = lease.worker_id.clone();
        item.attempt += 1;
        if item.attempt >= max_attempts {
            // Reclaim path from Started passes through Allocated.
            if item.state == WorkItemState::Started {
                item.transition(WorkItemState::Allocated, "engine", now)?;
            }
            item.transition(WorkItemState::Failed, "engine", now)?;
            tracing::warn!(case_id = %case.id, item_id = %item_id, worker, "lease attempts exhausted");
            Ok(LeaseTick::Exhausted)
        } else {
            if item.state == WorkItemState::Started {
                item.transition(WorkItemState::Allocated, "engine", now)?;
            }
            item.transition(WorkItemState::Enabled, "engine", now)?;
            let attempt = item.attempt;
            tracing::info!(case_id = %case.id, item_id = %item_id, worker, attempt, "work item reclaimed after lease expiry");
            Ok(LeaseTick::Reclaimed)
        }
    }

    /// Cancel or withdraw a live item
    ///
    /// Offered items are Withdrawn; everything else live is Cancelled. When
    /// the task declares a compensation task and `compensate` is true, a
    /// fresh item is created in the compensating region.
    pub fn cancel_item(
        &self,
        case: &mut Case,
        item_id: &ItemId,
        actor: &str,
        compensate: bool,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Option<ItemId>> {
        let task_id = case.item(item_id)?.task_id.clone();
        let task = self.task(case, &task_id)?;
        let compensation_task = task.compensation_task.clone();

        let item = case.item_mut(item_id)?;
        if !item.is_live() {
            return Ok(None);
        }
        let target = match item.state {
            WorkItemState::Offered => WorkItemState::Withdrawn,
            _ => WorkItemState::Cancelled,
        };
        if item.state == WorkItemState::Delegated {
            // Mid-delegation items land back in Allocated first.
            item.transition(WorkItemState::Allocated, actor, now)?;
        }
        item.transition(target, actor, now)?;
        let cancelled_inputs = item.data.clone();

        if !compensate {
            return Ok(None);
        }
        let Some(comp_task_id) = compensation_task else {
            return Ok(None);
        };
        let comp_task = self.task(case, &comp_task_id)?;
        let comp_id = self.create_item(
            case,
            comp_task,
            cancelled_inputs,
            None,
            &format!("comp:{item_id}"),
            now,
        );
        if let Ok(comp_item) = case.item_mut(&comp_id) {
            comp_item.compensation_for = Some(*item_id);
        }
        tracing::info!(case_id = %case.id, item_id = %item_id, compensation = %comp_id, "compensation item created");
        Ok(Some(comp_id))
    }
}

/// Check collected outputs against the task's out-parameter declarations
pub fn validate_outputs(task: &Task, outputs: &serde_json::Value) -> Result<(), String> {
    if !outputs.is_object() {
        return Err("outputs must be a JSON object".to_string());
    }
    for param in task.output_parameters() {
        match outputs.get(&param.name) {
            None => return Err(format!("missing output parameter {}", param.name)),
            Some(value) if !param.param_type.accepts(value) => {
                return Err(format!(
                    "output parameter {} has wrong type (expected {:?})",
                    param.name, param.param_type
                ))
            }
            Some(_) => {}
        }
    }
    Ok(())
}
