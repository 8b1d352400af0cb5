//! Workflow specification types
//!
//! Core types for workflow specifications: nets, tasks, conditions, flows,
//! join/split codes, cancellation regions, data parameters, and
//! multi-instance parameters. Specifications are immutable after load.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::spec::expr::Expr;

/// Unique identifier for a workflow specification: (identifier, version)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpecificationId {
    /// Specification identifier
    pub id: String,
    /// Specification version
    pub version: String,
}

impl SpecificationId {
    /// Create a new specification ID
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }

    /// Parse from an `id:version` string
    pub fn parse_str(s: &str) -> Option<Self> {
        let (id, version) = s.split_once(':')?;
        if id.is_empty() || version.is_empty() {
            return None;
        }
        Some(Self::new(id, version))
    }
}

impl std::fmt::Display for SpecificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.id, self.version)
    }
}

/// Split code (AND, XOR, OR)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SplitType {
    /// AND-split: every outgoing flow fires
    #[default]
    And,
    /// XOR-split: first flow (by priority) whose predicate holds fires
    Xor,
    /// OR-split: every flow whose predicate holds fires
    Or,
}

/// Join code (AND, XOR, OR)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    /// AND-join: wait for a token on every incoming source
    #[default]
    And,
    /// XOR-join: a token on any single incoming source suffices
    Xor,
    /// OR-join: wait until no further tokens can arrive (non-local)
    Or,
}

/// Parameter direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamDirection {
    /// Input only: materialised from case data at enablement
    In,
    /// Output only: collected from the worker at completion
    Out,
    /// Both directions
    InOut,
}

/// Parameter value type, checked on work-item checkin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    /// UTF-8 string
    String,
    /// Any JSON number
    Number,
    /// Integral number
    Integer,
    /// Boolean
    Boolean,
    /// Ordered sequence
    Array,
    /// Unordered mapping
    Object,
    /// No type check
    Any,
}

impl ParamType {
    /// Whether a JSON value satisfies this type
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
            ParamType::Any => true,
        }
    }
}

/// Named typed input/output slot on a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter name (also the case-data variable it maps to)
    pub name: String,
    /// Parameter type
    #[serde(rename = "type")]
    pub param_type: ParamType,
    /// Direction
    pub direction: ParamDirection,
}

impl Parameter {
    /// Whether this parameter is read at enablement
    pub fn is_input(&self) -> bool {
        matches!(self.direction, ParamDirection::In | ParamDirection::InOut)
    }

    /// Whether this parameter is collected at completion
    pub fn is_output(&self) -> bool {
        matches!(self.direction, ParamDirection::Out | ParamDirection::InOut)
    }
}

/// Multi-instance creation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreationMode {
    /// Evaluate the selector once at firing; one instance per element
    Static,
    /// Create `min` instances, then more while the creation predicate holds
    Dynamic,
}

/// Multi-instance parameters for a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiInstance {
    /// Minimum instance count
    pub min: usize,
    /// Maximum instance count
    pub max: usize,
    /// Completed-instance count at which the task completes
    pub threshold: usize,
    /// Creation mode
    pub creation_mode: CreationMode,
    /// Case-data variable holding the per-instance input sequence
    pub selector: String,
    /// Predicate evaluated after each completion in dynamic mode; true
    /// creates another instance up to `max`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_predicate: Option<Expr>,
}

/// Task kind: a closed set, one runner handler per variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Atomic task: firing produces a work item
    #[default]
    Atomic,
    /// Composite task: firing launches a sub-case of the named child net
    Composite,
}

/// Allocation mode for matching work items to workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationMode {
    /// Broadcast to all matching workers; first to check out wins
    #[default]
    OfferAll,
    /// Allocator picks one worker deterministically
    SinglePick,
    /// FIFO queue per capability tag
    Queue,
}

/// Per-task matching rule for the resource allocator
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AllocationRule {
    /// Capabilities a worker must hold to be eligible
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Allocation mode
    #[serde(default)]
    pub mode: AllocationMode,
    /// Preferred workers, tried first under `single-pick`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preference: Vec<String>,
}

/// Workflow task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier, unique within its net
    pub id: String,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Task kind (atomic or composite)
    #[serde(default)]
    pub kind: TaskKind,
    /// Join code on incoming flows
    #[serde(default)]
    pub join: JoinType,
    /// Split code on outgoing flows
    #[serde(default)]
    pub split: SplitType,
    /// For composite tasks: the child net; for atomic tasks: the external
    /// work identifier handed to workers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decomposition: Option<String>,
    /// Input/output parameter slots
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    /// Multi-instance parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_instance: Option<MultiInstance>,
    /// Elements (conditions and tasks) cleared when this task fires
    #[serde(default)]
    pub cancellation_region: Vec<String>,
    /// Timer duration (ISO-8601), fired through the `TimerFired` event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer: Option<String>,
    /// Whether the task requires a human participant
    #[serde(default)]
    pub human: bool,
    /// Urgent items jump to the head of allocator queues
    #[serde(default)]
    pub urgent: bool,
    /// Matching rule for the resource allocator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<AllocationRule>,
    /// Compensating task created when an item of this task is cancelled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_task: Option<String>,
    /// Whether cancelled-past-threshold multi-instance items still compensate
    #[serde(default)]
    pub compensate_past_threshold: bool,
    /// Lease TTL override in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_ttl_ms: Option<u64>,
    /// Maximum delivery attempts before the item fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl Task {
    /// Input parameters in declaration order
    pub fn input_parameters(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.iter().filter(|p| p.is_input())
    }

    /// Output parameters in declaration order
    pub fn output_parameters(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.iter().filter(|p| p.is_output())
    }
}

/// Intermediate place between tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Condition identifier, unique within its net
    pub id: String,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
}

/// Directed edge between net elements
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    /// Source element id (condition or task)
    pub source: String,
    /// Target element id (condition or task)
    pub target: String,
    /// Predicate over case data; `None` means always true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<Expr>,
    /// Priority for XOR/OR split ordering (lower fires first)
    #[serde(default)]
    pub priority: u32,
    /// Default arc: fires when no other outgoing predicate matched
    #[serde(default)]
    pub is_default: bool,
    /// Error arc: evaluated against the failure payload of the task
    #[serde(default)]
    pub error_arc: bool,
}

/// A single net: one input condition, one output condition, tasks,
/// intermediate conditions and flows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Net {
    /// Net name, unique within the specification
    pub name: String,
    /// Unique entry place; holds the initial token
    pub input_condition: String,
    /// Unique exit place; a token here (and nothing else live) ends the case
    pub output_condition: String,
    /// Intermediate conditions by id
    #[serde(default)]
    pub conditions: BTreeMap<String, Condition>,
    /// Tasks by id
    pub tasks: BTreeMap<String, Task>,
    /// Directed flows
    pub flows: Vec<Flow>,
}

impl Net {
    /// Whether `id` names a declared element of this net
    pub fn has_element(&self, id: &str) -> bool {
        id == self.input_condition
            || id == self.output_condition
            || self.conditions.contains_key(id)
            || self.tasks.contains_key(id)
    }

    /// Incoming flows of an element, in declaration order
    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Flow> + 'a {
        self.flows.iter().filter(move |f| f.target == id)
    }

    /// Outgoing flows of an element, in declaration order
    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Flow> + 'a {
        self.flows.iter().filter(move |f| f.source == id)
    }

    /// The place a token waits in before travelling a flow into a task
    ///
    /// Directly connected tasks get an implicit condition named
    /// `source->target`.
    pub fn source_place(&self, flow: &Flow) -> String {
        if self.tasks.contains_key(&flow.source) {
            format!("{}->{}", flow.source, flow.target)
        } else {
            flow.source.clone()
        }
    }

    /// The place a token lands in after travelling a flow out of a task
    pub fn target_place(&self, flow: &Flow) -> String {
        if self.tasks.contains_key(&flow.target) {
            format!("{}->{}", flow.source, flow.target)
        } else {
            flow.target.clone()
        }
    }
}

/// Preferred engine variant declared on a specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferredEngine {
    /// Durable, state-owning variant
    Stateful,
    /// Pure `(state, event) -> state` variant
    Stateless,
}

/// Execution profile: routing hints for the engine selector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionProfile {
    /// Preferred variant
    pub preferred: PreferredEngine,
    /// Expected maximum case duration (ISO-8601), compared against the
    /// stateless duration hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<String>,
    /// Whether human tasks are acceptable under the preferred variant
    #[serde(default = "default_true")]
    pub allow_human_tasks: bool,
    /// Fall back to stateful when the stateless runtime is unavailable
    #[serde(default)]
    pub fallback_to_stateful: bool,
}

fn default_true() -> bool {
    true
}

/// Immutable workflow specification: a closed set of nets with one root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Specification {
    /// Globally unique (identifier, version)
    pub id: SpecificationId,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Name of the root net
    pub root_net: String,
    /// Nets by name
    pub nets: BTreeMap<String, Net>,
    /// Routing hints for the engine selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_profile: Option<ExecutionProfile>,
}

impl Specification {
    /// O(1) net lookup
    pub fn get_net(&self, name: &str) -> Option<&Net> {
        self.nets.get(name)
    }

    /// The root net
    pub fn root(&self) -> &Net {
        // Validated at load: root_net always resolves.
        self.nets
            .get(&self.root_net)
            .unwrap_or_else(|| panic!("root net {} missing after validation", self.root_net))
    }

    /// Whether any task in any net is a human task
    pub fn has_human_tasks(&self) -> bool {
        self.nets
            .values()
            .any(|net| net.tasks.values().any(|t| t.human))
    }

    /// Longest declared task timer, if any
    pub fn longest_timer(&self) -> Option<chrono::Duration> {
        self.nets
            .values()
            .flat_map(|net| net.tasks.values())
            .filter_map(|t| t.timer.as_deref())
            .filter_map(parse_iso8601_duration)
            .max()
    }

    /// Serialize back to JSON; `load ∘ to_json` preserves semantics
    pub fn to_json(&self) -> crate::error::WorkflowResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| crate::error::WorkflowError::Parse(e.to_string()))
    }
}

/// Parse a subset of ISO-8601 durations (`PnDTnHnMnS`, `PTnS`, ...)
pub fn parse_iso8601_duration(s: &str) -> Option<chrono::Duration> {
    let s = s.trim();
    let rest = s.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, t),
        None => (rest, ""),
    };

    let mut total = chrono::Duration::zero();
    let mut read = |part: &str, units: &[(char, i64)]| -> Option<()> {
        let mut num = String::new();
        for ch in part.chars() {
            if ch.is_ascii_digit() {
                num.push(ch);
            } else {
                let scale = units.iter().find(|(u, _)| *u == ch)?.1;
                let n: i64 = num.parse().ok()?;
                total = total + chrono::Duration::seconds(n.checked_mul(scale)?);
                num.clear();
            }
        }
        if num.is_empty() {
            Some(())
        } else {
            None
        }
    };

    read(date_part, &[('D', 86_400)])?;
    read(time_part, &[('H', 3_600), ('M', 60), ('S', 1)])?;
    Some(total)
}
