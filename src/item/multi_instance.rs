//! Multi-instance expansion
//!
//! When a multi-instance task fires, the selector expression yields the
//! per-instance input fragments and the firing tracks completion against
//! the declared threshold. Completion data is the ordered list of
//! completed-instance outputs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{WorkflowError, WorkflowResult};
use crate::spec::types::{CreationMode, MultiInstance};

/// Evaluate a static selector: one instance per element of the sequence
///
/// The selector names a case-data variable holding an array. `min ≤ N ≤ max`
/// is enforced; violation fails the firing.
pub fn expand_static(
    mi: &MultiInstance,
    data: &serde_json::Value,
) -> WorkflowResult<Vec<serde_json::Value>> {
    let sequence = selector_sequence(mi, data)?;
    let n = sequence.len();
    if n < mi.min || n > mi.max {
        return Err(WorkflowError::PreconditionViolated(format!(
            "multi-instance selector {} yielded {} element(s), outside [{}, {}]",
            mi.selector, n, mi.min, mi.max
        )));
    }
    Ok(sequence)
}

/// Initial inputs for a dynamic expansion: the first `min` fragments
pub fn expand_dynamic_initial(
    mi: &MultiInstance,
    data: &serde_json::Value,
) -> WorkflowResult<Vec<serde_json::Value>> {
    let sequence = selector_sequence(mi, data).unwrap_or_default();
    Ok((0..mi.min)
        .map(|i| sequence.get(i).cloned().unwrap_or(serde_json::Value::Null))
        .collect())
}

/// Input fragment for a dynamically created instance
pub fn dynamic_fragment(mi: &MultiInstance, data: &serde_json::Value, index: usize) -> serde_json::Value {
    selector_sequence(mi, data)
        .ok()
        .and_then(|seq| seq.get(index).cloned())
        .unwrap_or(serde_json::Value::Null)
}

fn selector_sequence(
    mi: &MultiInstance,
    data: &serde_json::Value,
) -> WorkflowResult<Vec<serde_json::Value>> {
    match data.get(&mi.selector) {
        Some(serde_json::Value::Array(items)) => Ok(items.clone()),
        Some(other) => Err(WorkflowError::PreconditionViolated(format!(
            "multi-instance selector {} is {}, expected an array",
            mi.selector,
            json_kind(other)
        ))),
        None => Err(WorkflowError::PreconditionViolated(format!(
            "multi-instance selector {} not present in case data",
            mi.selector
        ))),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Per-firing multi-instance progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiProgress {
    /// Completed-instance count at which the task completes
    pub threshold: usize,
    /// Maximum instance count
    pub max: usize,
    /// Creation mode
    pub creation_mode: CreationMode,
    /// Instances created so far
    pub created: usize,
    /// Outputs of completed instances, keyed by instance index
    pub completed: BTreeMap<usize, serde_json::Value>,
    /// Instances cancelled or withdrawn
    pub cancelled: usize,
    /// Instances failed
    pub failed: usize,
}

impl MiProgress {
    /// Track a fresh expansion of `created` instances
    pub fn new(mi: &MultiInstance, created: usize) -> Self {
        Self {
            threshold: mi.threshold,
            max: mi.max,
            creation_mode: mi.creation_mode,
            created,
            completed: BTreeMap::new(),
            cancelled: 0,
            failed: 0,
        }
    }

    /// Record one completed instance
    pub fn record_completed(&mut self, index: usize, outputs: serde_json::Value) {
        self.completed.insert(index, outputs);
    }

    /// Record one cancelled or withdrawn instance
    pub fn record_cancelled(&mut self) {
        self.cancelled += 1;
    }

    /// Record one failed instance
    pub fn record_failed(&mut self) {
        self.failed += 1;
    }

    /// Whether enough instances completed
    pub fn threshold_met(&self) -> bool {
        self.completed.len() >= self.threshold
    }

    /// Whether the threshold can no longer be reached
    ///
    /// Remaining potential = completions so far + live instances + instances
    /// still creatable in dynamic mode.
    pub fn threshold_unreachable(&self) -> bool {
        let live = self.created - self.completed.len() - self.cancelled - self.failed;
        let creatable = match self.creation_mode {
            CreationMode::Static => 0,
            CreationMode::Dynamic => self.max.saturating_sub(self.created),
        };
        self.completed.len() + live + creatable < self.threshold
    }

    /// Whether another dynamic instance may be created
    pub fn can_create_more(&self) -> bool {
        self.creation_mode == CreationMode::Dynamic && self.created < self.max
    }

    /// Ordered list of completed-instance outputs
    pub fn ordered_outputs(&self) -> Vec<serde_json::Value> {
        self.completed.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mi(min: usize, max: usize, threshold: usize, mode: CreationMode) -> MultiInstance {
        MultiInstance {
            min,
            max,
            threshold,
            creation_mode: mode,
            selector: "orders".to_string(),
            creation_predicate: None,
        }
    }

    #[test]
    fn static_expansion_uses_selector_elements() {
        let mi = mi(1, 5, 2, CreationMode::Static);
        let fragments =
            expand_static(&mi, &json!({"orders": [1, 2, 3]})).unwrap();
        assert_eq!(fragments, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn static_expansion_enforces_bounds() {
        let mi = mi(2, 2, 2, CreationMode::Static);
        let err = expand_static(&mi, &json!({"orders": [1, 2, 3]})).unwrap_err();
        assert!(matches!(err, WorkflowError::PreconditionViolated(_)));

        let err = expand_static(&mi, &json!({"orders": "oops"})).unwrap_err();
        assert!(matches!(err, WorkflowError::PreconditionViolated(_)));
    }

    #[test]
    fn zero_min_expansion_is_legal() {
        let mi = mi(0, 3, 0, CreationMode::Static);
        let fragments = expand_static(&mi, &json!({"orders": []})).unwrap();
        assert!(fragments.is_empty());

        let progress = MiProgress::new(&mi, 0);
        assert!(progress.threshold_met());
        assert!(progress.ordered_outputs().is_empty());
    }

    #[test]
    fn threshold_tracking() {
        let mi = mi(3, 3, 2, CreationMode::Static);
        let mut progress = MiProgress::new(&mi, 3);
        progress.record_completed(1, json!({"r": "b"}));
        assert!(!progress.threshold_met());
        progress.record_completed(0, json!({"r": "a"}));
        assert!(progress.threshold_met());
        // Ordered by instance index, not completion order.
        assert_eq!(
            progress.ordered_outputs(),
            vec![json!({"r": "a"}), json!({"r": "b"})]
        );
    }

    #[test]
    fn threshold_unreachable_after_cancellations() {
        let mi = mi(3, 3, 3, CreationMode::Static);
        let mut progress = MiProgress::new(&mi, 3);
        progress.record_completed(0, json!(null));
        progress.record_cancelled();
        assert!(progress.threshold_unreachable());
    }

    #[test]
    fn dynamic_mode_counts_creatable_instances() {
        let mi = mi(1, 4, 3, CreationMode::Dynamic);
        let mut progress = MiProgress::new(&mi, 1);
        progress.record_failed();
        // 0 live, but three more can still be created.
        assert!(!progress.threshold_unreachable());
        assert!(progress.can_create_more());
    }
}
