//! External events and lifecycle notifications
//!
//! External events drive a case between firings; every event carries an
//! `event_id` and replaying the same id is a no-op. Lifecycle notifications
//! flow out-of-band to observers through an mpsc channel.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::case::CaseId;
use crate::item::{ItemId, WorkItemState};
use crate::spec::SpecificationId;

/// External event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// A worker submitted outputs for an item
    CompleteWorkItem {
        item_id: ItemId,
        outputs: serde_json::Value,
    },
    /// A worker reported failure for an item
    FailWorkItem {
        item_id: ItemId,
        error: serde_json::Value,
    },
    /// Cancel one work item
    CancelWorkItem { item_id: ItemId },
    /// Re-assign an allocated item
    DelegateWorkItem {
        item_id: ItemId,
        from_worker: String,
        to_worker: String,
    },
    /// Cancel the whole case
    CancelCase,
    /// Suspend the case; work-item events are rejected until resume
    SuspendCase,
    /// Resume a suspended case
    ResumeCase,
    /// A declared task timer elapsed
    TimerFired { task_id: String },
    /// A lease sweep found an expired lease on an item
    LeaseExpired { item_id: ItemId },
    /// The allocator made an item visible to workers
    OfferItem { item_id: ItemId },
    /// A worker checked an item out (reservation already held)
    CheckoutItem { item_id: ItemId, worker_id: String },
    /// A worker acknowledged a checked-out item
    StartItem { item_id: ItemId, worker_id: String },
    /// A worker checked an item in with outputs; validation failures burn
    /// the retry budget instead of rejecting the event
    CheckinItem {
        item_id: ItemId,
        worker_id: String,
        outputs: serde_json::Value,
    },
    /// A worker heartbeat renewing its lease
    HeartbeatItem { item_id: ItemId, worker_id: String },
    /// A launched sub-case was linked to its awaiting firing
    AttachSubcase { firing: u64, child: CaseId },
    /// A sub-case reached a terminal state; settle it into this case
    SubcaseSettled {
        child: CaseId,
        lifecycle: crate::case::CaseLifecycle,
        data: serde_json::Value,
    },
}

/// An external event envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEvent {
    /// Idempotence key; the same id applied twice is a no-op
    pub event_id: String,
    /// Payload
    pub kind: EventKind,
}

impl ExternalEvent {
    /// Convenience constructor
    pub fn new(event_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            event_id: event_id.into(),
            kind,
        }
    }
}

/// Out-of-band lifecycle notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Case created and advancing
    CaseLaunched {
        case_id: CaseId,
        spec_id: SpecificationId,
    },
    /// Case reached its terminal marking
    CaseCompleted { case_id: CaseId },
    /// Case cancelled
    CaseCancelled { case_id: CaseId },
    /// Case failed
    CaseFailed { case_id: CaseId, error: String },
    /// Case suspended
    CaseSuspended { case_id: CaseId },
    /// Case resumed
    CaseResumed { case_id: CaseId },
    /// A task fired (tokens consumed)
    TaskFired {
        case_id: CaseId,
        task_id: String,
        firing: u64,
    },
    /// A firing completed (split produced)
    TaskCompleted {
        case_id: CaseId,
        task_id: String,
        firing: u64,
    },
    /// A work item was created
    ItemCreated {
        case_id: CaseId,
        item_id: ItemId,
        task_id: String,
    },
    /// A work item changed state
    ItemStateChanged {
        case_id: CaseId,
        item_id: ItemId,
        state: WorkItemState,
    },
}

/// Publisher handle for lifecycle notifications
///
/// Cloneable; a full channel back-pressures the publisher but observers
/// never influence case semantics.
#[derive(Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<LifecycleEvent>>,
}

impl EventSink {
    /// A sink wired to a channel
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Publish one notification; errors (closed channel) are swallowed
    /// after a warning, observers are advisory
    pub async fn publish(&self, event: LifecycleEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).await.is_err() {
                tracing::warn!("lifecycle observer channel closed");
            }
        }
    }

    /// Publish a batch in order
    pub async fn publish_all(&self, events: impl IntoIterator<Item = LifecycleEvent>) {
        for event in events {
            self.publish(event).await;
        }
    }
}
