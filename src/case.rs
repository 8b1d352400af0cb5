//! Workflow cases
//!
//! A case is one running instance of a specification: its marking, its
//! data variables, its work items, and its in-flight firings. Case state
//! is a pure function of the ordered history of firings applied to the
//! initial marking, which is what makes snapshots and log replay exact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::error::{WorkflowError, WorkflowResult};
use crate::item::{ItemId, MiProgress, WorkItem};
use crate::marking::Marking;
use crate::spec::{PreferredEngine, SpecificationId};

/// Unique identifier for a workflow case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(#[serde(with = "uuid::serde::compact")] pub Uuid);

impl CaseId {
    /// Generate a new case ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derive a replay-stable sub-case ID from the parent and its firing
    pub fn derived(parent: CaseId, firing: u64) -> Self {
        Self(Uuid::new_v5(&parent.0, format!("subcase:{firing}").as_bytes()))
    }

    /// Parse from string
    pub fn parse_str(s: &str) -> WorkflowResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| WorkflowError::Parse(format!("invalid case ID: {e}")))
    }
}

impl Default for CaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Case lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseLifecycle {
    /// Created; initial marking laid down, no firing yet
    Launching,
    /// Advancing through firings and external events
    Executing,
    /// Paused; work-item events are rejected, cancel is accepted
    Suspended,
    /// Terminal marking reached, outstanding instances draining
    Completing,
    /// Exactly one token in the output condition, nothing live
    Completed,
    /// Externally cancelled
    Cancelled,
    /// A fatal error was raised during firing
    Failed,
}

impl CaseLifecycle {
    /// Whether the lifecycle is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CaseLifecycle::Completed | CaseLifecycle::Cancelled | CaseLifecycle::Failed
        )
    }
}

impl std::fmt::Display for CaseLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CaseLifecycle::Launching => "launching",
            CaseLifecycle::Executing => "executing",
            CaseLifecycle::Suspended => "suspended",
            CaseLifecycle::Completing => "completing",
            CaseLifecycle::Completed => "completed",
            CaseLifecycle::Cancelled => "cancelled",
            CaseLifecycle::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Link from a sub-case back to the enclosing firing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    /// Enclosing case
    pub case_id: CaseId,
    /// Firing of the composite task inside the enclosing case
    pub firing: u64,
    /// The composite task id
    pub task_id: String,
}

/// An in-flight firing: tokens consumed, split not yet produced
///
/// The runner pauses here awaiting work-item completion or sub-case
/// termination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusyTask {
    /// The fired task
    pub task_id: String,
    /// Items created by this firing (one, or one per multi-instance)
    #[serde(default)]
    pub items: Vec<ItemId>,
    /// Multi-instance progress, when the task is multi-instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mi: Option<MiProgress>,
    /// Sub-case launched by this firing, for composite tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcase: Option<CaseId>,
}

/// Append-only audit row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When
    pub at: DateTime<Utc>,
    /// What happened (`launched`, `fired:<task>`, `event:<kind>`, ...)
    pub action: String,
    /// External event id, for idempotence-sensitive entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// A workflow case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    /// Unique case identifier
    pub id: CaseId,
    /// Specification this case instantiates
    pub spec_id: SpecificationId,
    /// Net this case runs (root net, or a child net for sub-cases)
    pub net_name: String,
    /// Lifecycle state
    pub lifecycle: CaseLifecycle,
    /// Token marking
    pub marking: Marking,
    /// Case-scoped data variables (always a JSON object)
    pub data: serde_json::Value,
    /// Work items by id
    pub items: BTreeMap<ItemId, WorkItem>,
    /// In-flight firings by firing number
    pub busy: BTreeMap<u64, BusyTask>,
    /// Next firing number
    pub next_firing: u64,
    /// Parent link for sub-cases
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentLink>,
    /// Live sub-cases mapped to the firing awaiting them
    #[serde(default)]
    pub subcases: BTreeMap<CaseId, u64>,
    /// External event ids already applied (idempotence)
    #[serde(default)]
    pub seen_events: BTreeSet<String>,
    /// Append-only audit trail
    #[serde(default)]
    pub audit: Vec<AuditEntry>,
    /// Engine variant that owns this case
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_used: Option<PreferredEngine>,
    /// Why the selector chose that variant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_reason: Option<String>,
    /// Hard deadline; elapsing forces cancellation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// Failure message when lifecycle is Failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Terminal timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Case {
    /// Create a new case with the initial marking of `net`
    pub fn new(
        spec_id: SpecificationId,
        net_name: &str,
        input_condition: &str,
        data: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        let data = if data.is_object() {
            data
        } else {
            serde_json::Value::Object(serde_json::Map::new())
        };
        Self {
            id: CaseId::new(),
            spec_id,
            net_name: net_name.to_string(),
            lifecycle: CaseLifecycle::Launching,
            marking: Marking::initial(input_condition),
            data,
            items: BTreeMap::new(),
            busy: BTreeMap::new(),
            next_firing: 0,
            parent: None,
            subcases: BTreeMap::new(),
            seen_events: BTreeSet::new(),
            audit: Vec::new(),
            engine_used: None,
            selection_reason: None,
            deadline: None,
            error: None,
            created_at: now,
            completed_at: None,
        }
    }

    /// Live (non-terminal) work items in deterministic order
    pub fn live_items(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.values().filter(|i| i.is_live())
    }

    /// Look up a work item
    pub fn item(&self, item_id: &ItemId) -> WorkflowResult<&WorkItem> {
        self.items
            .get(item_id)
            .ok_or_else(|| WorkflowError::ItemNotFound(item_id.to_string()))
    }

    /// Look up a work item mutably
    pub fn item_mut(&mut self, item_id: &ItemId) -> WorkflowResult<&mut WorkItem> {
        self.items
            .get_mut(item_id)
            .ok_or_else(|| WorkflowError::ItemNotFound(item_id.to_string()))
    }

    /// The firing awaiting a given item, if any
    pub fn firing_of_item(&self, item_id: &ItemId) -> Option<u64> {
        self.busy
            .iter()
            .find(|(_, busy)| busy.items.contains(item_id))
            .map(|(firing, _)| *firing)
    }

    /// Record an external event id; false when already seen
    pub fn register_event(&mut self, event_id: &str) -> bool {
        self.seen_events.insert(event_id.to_string())
    }

    /// Append an audit row
    pub fn record_audit(
        &mut self,
        action: impl Into<String>,
        event_id: Option<&str>,
        now: DateTime<Utc>,
    ) {
        self.audit.push(AuditEntry {
            at: now,
            action: action.into(),
            event_id: event_id.map(str::to_string),
        });
    }

    /// Move from Launching into Executing
    pub fn start(&mut self) -> WorkflowResult<()> {
        match self.lifecycle {
            CaseLifecycle::Launching => {
                self.lifecycle = CaseLifecycle::Executing;
                Ok(())
            }
            other => Err(transition_error(other, CaseLifecycle::Executing)),
        }
    }

    /// Suspend an executing case
    pub fn suspend(&mut self) -> WorkflowResult<()> {
        match self.lifecycle {
            CaseLifecycle::Executing => {
                self.lifecycle = CaseLifecycle::Suspended;
                Ok(())
            }
            other => Err(transition_error(other, CaseLifecycle::Suspended)),
        }
    }

    /// Resume a suspended case
    pub fn resume(&mut self) -> WorkflowResult<()> {
        match self.lifecycle {
            CaseLifecycle::Suspended => {
                self.lifecycle = CaseLifecycle::Executing;
                Ok(())
            }
            other => Err(transition_error(other, CaseLifecycle::Executing)),
        }
    }

    /// Mark the case completed
    pub fn complete(&mut self, now: DateTime<Utc>) -> WorkflowResult<()> {
        match self.lifecycle {
            CaseLifecycle::Executing | CaseLifecycle::Completing => {
                self.lifecycle = CaseLifecycle::Completed;
                self.completed_at = Some(now);
                Ok(())
            }
            other => Err(transition_error(other, CaseLifecycle::Completed)),
        }
    }

    /// Cancel the case; legal from any non-terminal state
    pub fn cancel(&mut self, now: DateTime<Utc>) -> WorkflowResult<()> {
        if self.lifecycle.is_terminal() {
            return Err(transition_error(self.lifecycle, CaseLifecycle::Cancelled));
        }
        self.lifecycle = CaseLifecycle::Cancelled;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Fail the case; legal from any non-terminal state
    pub fn fail(&mut self, error: String, now: DateTime<Utc>) -> WorkflowResult<()> {
        if self.lifecycle.is_terminal() {
            return Err(transition_error(self.lifecycle, CaseLifecycle::Failed));
        }
        self.lifecycle = CaseLifecycle::Failed;
        self.error = Some(error);
        self.completed_at = Some(now);
        Ok(())
    }

    /// Serialize to a byte-exact snapshot
    pub fn snapshot(&self) -> WorkflowResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| WorkflowError::StatePersistence(e.to_string()))
    }

    /// Restore from a snapshot; inverse of [`Case::snapshot`]
    pub fn restore(bytes: &[u8]) -> WorkflowResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| WorkflowError::StatePersistence(e.to_string()))
    }
}

fn transition_error(from: CaseLifecycle, to: CaseLifecycle) -> WorkflowError {
    WorkflowError::PreconditionViolated(format!("illegal case transition {from} -> {to}"))
}
