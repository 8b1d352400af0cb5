//! Specification model
//!
//! Immutable in-memory representation of workflow specifications, the flow
//! predicate language, load-time validation, and the interning cache.

pub mod expr;
pub mod loader;
pub mod types;
pub mod validate;

pub use expr::Expr;
pub use loader::{load, SpecCache};
pub use types::{
    AllocationMode, AllocationRule, Condition, CreationMode, ExecutionProfile, Flow, JoinType,
    MultiInstance, Net, ParamDirection, ParamType, Parameter, PreferredEngine, Specification,
    SpecificationId, SplitType, Task, TaskKind,
};
