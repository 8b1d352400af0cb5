//! Work items
//!
//! The externally observable unit of work produced by firing an atomic
//! task. Each item owns a state machine with an explicit legal-transition
//! table; every transition appends a history row.

pub mod lifecycle;
pub mod multi_instance;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::case::CaseId;
use crate::error::{WorkflowError, WorkflowResult};

pub use lifecycle::{CheckinOutcome, WorkItemManager};
pub use multi_instance::{expand_static, MiProgress};

/// Unique identifier for a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(#[serde(with = "uuid::serde::compact")] pub Uuid);

impl ItemId {
    /// Generate a new item ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derive a replay-stable item ID from its case and a creation seed
    ///
    /// Firing numbers and instance indexes are deterministic, so items
    /// recreated during log replay keep their original ids.
    pub fn derived(case_id: crate::case::CaseId, seed: &str) -> Self {
        Self(Uuid::new_v5(&case_id.0, seed.as_bytes()))
    }

    /// Parse from string
    pub fn parse_str(s: &str) -> WorkflowResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| WorkflowError::Parse(format!("invalid item ID: {e}")))
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Work item state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkItemState {
    /// Created when its task fired; inputs materialised, no assignee
    Enabled,
    /// Visible to one or more workers per the allocator's matching rule
    Offered,
    /// Reserved by exactly one worker under a lease
    Allocated,
    /// Worker acknowledged; output collection in progress
    Started,
    /// Mid-reassignment; returns to Allocated under the new assignee
    Delegated,
    /// Outputs validated and consumed by the runner
    Completed,
    /// Externally cancelled; terminal for the item
    Cancelled,
    /// Worker failure, exhausted lease retries, or fatal validation failure
    Failed,
    /// Offered but recalled before any worker allocated
    Withdrawn,
}

impl WorkItemState {
    /// Whether the state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkItemState::Completed
                | WorkItemState::Cancelled
                | WorkItemState::Failed
                | WorkItemState::Withdrawn
        )
    }

    /// Whether the transition `self -> to` is legal
    pub fn can_transition_to(&self, to: WorkItemState) -> bool {
        use WorkItemState::*;
        matches!(
            (self, to),
            (Enabled, Offered)
                | (Enabled, Cancelled)
                | (Offered, Allocated)
                | (Offered, Withdrawn)
                | (Offered, Cancelled)
                | (Allocated, Started)
                | (Allocated, Delegated)
                | (Allocated, Completed)
                | (Allocated, Failed)
                | (Allocated, Cancelled)
                | (Allocated, Enabled)
                | (Delegated, Allocated)
                | (Started, Completed)
                | (Started, Failed)
                | (Started, Cancelled)
                | (Started, Allocated)
        )
    }
}

impl std::fmt::Display for WorkItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkItemState::Enabled => "enabled",
            WorkItemState::Offered => "offered",
            WorkItemState::Allocated => "allocated",
            WorkItemState::Started => "started",
            WorkItemState::Delegated => "delegated",
            WorkItemState::Completed => "completed",
            WorkItemState::Cancelled => "cancelled",
            WorkItemState::Failed => "failed",
            WorkItemState::Withdrawn => "withdrawn",
        };
        write!(f, "{name}")
    }
}

/// Time-bounded reservation of a work item by a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Holder
    pub worker_id: String,
    /// Issue timestamp
    pub issued_at: DateTime<Utc>,
    /// Expiry timestamp; heartbeats push it forward
    pub expires_at: DateTime<Utc>,
    /// TTL in milliseconds
    pub ttl_ms: u64,
    /// Consecutive heartbeats missed; two reclaim the item
    pub missed_heartbeats: u32,
}

impl Lease {
    /// Issue a fresh lease
    pub fn issue(worker_id: &str, ttl_ms: u64, now: DateTime<Utc>) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            issued_at: now,
            expires_at: now + chrono::Duration::milliseconds(ttl_ms as i64),
            ttl_ms,
            missed_heartbeats: 0,
        }
    }

    /// Renew on heartbeat
    pub fn renew(&mut self, now: DateTime<Utc>) {
        self.expires_at = now + chrono::Duration::milliseconds(self.ttl_ms as i64);
        self.missed_heartbeats = 0;
    }

    /// Whether the lease has expired at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Optional soft/hard deadlines on an item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deadlines {
    /// Soft deadline: logged when passed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft: Option<DateTime<Utc>>,
    /// Hard deadline: item is cancelled when passed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard: Option<DateTime<Utc>>,
}

/// One history row per state transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// State before
    pub from: WorkItemState,
    /// State after
    pub to: WorkItemState,
    /// Who drove the transition (worker id, `engine`, or `case-cancel`)
    pub actor: String,
    /// When
    pub at: DateTime<Utc>,
}

/// A work item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Opaque, stable identifier, unique within the case
    pub id: ItemId,
    /// Owning case, referenced by identifier
    pub case_id: CaseId,
    /// Task that produced the item
    pub task_id: String,
    /// Instance index for multi-instance expansions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_index: Option<usize>,
    /// Current state
    pub state: WorkItemState,
    /// Inputs materialised at enablement
    pub data: serde_json::Value,
    /// Collected outputs; set at completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<serde_json::Value>,
    /// Current assignee; set while Allocated/Delegated/Started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    /// Current lease
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    /// Delivery attempt counter, incremented on lease reclaim
    #[serde(default)]
    pub attempt: u32,
    /// Output-validation retries consumed
    #[serde(default)]
    pub validation_retries: u32,
    /// Deadlines
    #[serde(default)]
    pub deadlines: Deadlines,
    /// Urgent items jump allocator queues
    #[serde(default)]
    pub urgent: bool,
    /// The cancelled item this one compensates, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_for: Option<ItemId>,
    /// Append-only transition log
    pub history: Vec<TransitionRecord>,
    /// Enablement timestamp
    pub enabled_at: DateTime<Utc>,
}

impl WorkItem {
    /// Create a fresh Enabled item
    pub fn enabled(
        case_id: CaseId,
        task_id: &str,
        data: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ItemId::new(),
            case_id,
            task_id: task_id.to_string(),
            instance_index: None,
            state: WorkItemState::Enabled,
            data,
            outputs: None,
            assignee: None,
            lease: None,
            attempt: 0,
            validation_retries: 0,
            deadlines: Deadlines::default(),
            urgent: false,
            compensation_for: None,
            history: Vec::new(),
            enabled_at: now,
        }
    }

    /// Whether the item is live (not terminal)
    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Apply a transition, enforcing the legality table
    pub fn transition(
        &mut self,
        to: WorkItemState,
        actor: &str,
        now: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(WorkflowError::PreconditionViolated(format!(
                "item {}: illegal transition {} -> {}",
                self.id, self.state, to
            )));
        }
        self.history.push(TransitionRecord {
            from: self.state,
            to,
            actor: actor.to_string(),
            at: now,
        });
        self.state = to;
        match to {
            WorkItemState::Enabled
            | WorkItemState::Completed
            | WorkItemState::Cancelled
            | WorkItemState::Failed
            | WorkItemState::Withdrawn => {
                self.assignee = None;
                self.lease = None;
            }
            _ => {}
        }
        Ok(())
    }

    /// Enforce that `worker` currently holds the item
    pub fn require_assignee(&self, worker: &str) -> WorkflowResult<()> {
        match self.assignee.as_deref() {
            Some(current) if current == worker => Ok(()),
            Some(current) => Err(WorkflowError::PreconditionViolated(format!(
                "item {} is held by {current}, not {worker}",
                self.id
            ))),
            None => Err(WorkflowError::PreconditionViolated(format!(
                "item {} has no assignee",
                self.id
            ))),
        }
    }
}
