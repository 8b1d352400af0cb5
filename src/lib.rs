//! Workflow execution engine with YAWL-style semantics
//!
//! This crate provides a complete workflow engine that:
//! - Loads and validates workflow specifications (nets, AND/OR/XOR joins
//!   and splits, cancellation regions, multi-instance and composite tasks)
//! - Advances cases token-by-token with a deterministic net runner
//! - Manages the full work-item lifecycle, leases and compensation
//! - Allocates work items to workers fairly and under capacity
//! - Runs the same firing semantics in a durable stateful variant and a
//!   pure stateless variant behind one facade

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod allocator;
pub mod case;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod item;
pub mod marking;
pub mod runner;
pub mod spec;
pub mod state;

pub use allocator::{ResourceAllocator, Worker};
pub use case::{Case, CaseId, CaseLifecycle};
pub use config::EngineConfig;
pub use engine::{CaseView, Engine, EngineOverride, LaunchReceipt, SelectionReason};
pub use error::{WorkflowError, WorkflowResult};
pub use events::{EventKind, EventSink, ExternalEvent, LifecycleEvent};
pub use item::{ItemId, WorkItem, WorkItemState};
pub use marking::Marking;
pub use runner::NetRunner;
pub use spec::{SpecCache, Specification, SpecificationId};
pub use state::{CasePersistence, SledStore};
