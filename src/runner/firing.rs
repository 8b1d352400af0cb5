//! Firing mechanics
//!
//! Split-flow selection, token production, and cancellation-region
//! application. A firing is atomic: all marking deltas are computed on a
//! scratch copy and committed only when every step succeeds.

use crate::error::{WorkflowError, WorkflowResult};
use crate::spec::expr::Expr;
use crate::spec::types::{Flow, Net, SplitType, Task};

fn is_default_arc(flow: &Flow) -> bool {
    flow.is_default || flow.predicate.as_ref().is_none_or(Expr::is_default)
}

fn arc_matches(flow: &Flow, data: &serde_json::Value) -> bool {
    flow.predicate
        .as_ref()
        .is_some_and(|p| !p.is_default() && p.evaluate(data))
}

/// Outgoing flows in split evaluation order: priority, then target place
pub fn ordered_outgoing<'a>(net: &'a Net, task: &'a Task) -> Vec<&'a Flow> {
    let mut flows: Vec<&Flow> = net
        .outgoing(&task.id)
        .filter(|f| !f.error_arc)
        .collect();
    flows.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| net.target_place(a).cmp(&net.target_place(b)))
    });
    flows
}

/// Select the outgoing flows that carry tokens when `task` fires
pub fn select_split_flows<'a>(
    net: &'a Net,
    task: &'a Task,
    data: &serde_json::Value,
) -> WorkflowResult<Vec<&'a Flow>> {
    let flows = ordered_outgoing(net, task);
    if flows.is_empty() {
        return Err(WorkflowError::InvariantBroken(format!(
            "task {} has no outgoing flows",
            task.id
        )));
    }
    match task.split {
        SplitType::And => Ok(flows),
        SplitType::Xor => {
            let chosen = flows
                .iter()
                .find(|f| arc_matches(f, data))
                .or_else(|| flows.iter().find(|f| is_default_arc(f)));
            match chosen {
                Some(flow) => Ok(vec![flow]),
                None => Err(WorkflowError::InvariantBroken(format!(
                    "XOR split {} matched no flow and has no default arc",
                    task.id
                ))),
            }
        }
        SplitType::Or => {
            let matched: Vec<&Flow> = flows
                .iter()
                .copied()
                .filter(|f| arc_matches(f, data))
                .collect();
            if !matched.is_empty() {
                return Ok(matched);
            }
            match flows.iter().find(|f| is_default_arc(f)) {
                Some(flow) => Ok(vec![flow]),
                None => Err(WorkflowError::InvariantBroken(format!(
                    "OR split {} matched no flow and has no default arc",
                    task.id
                ))),
            }
        }
    }
}

/// Error arcs that fire for a given failure payload
///
/// The payload is visible to predicates under the `error` key, layered
/// over the case data. An unpredicated error arc always fires.
pub fn select_error_flows<'a>(
    net: &'a Net,
    task: &'a Task,
    data: &serde_json::Value,
    error_payload: &serde_json::Value,
) -> Vec<&'a Flow> {
    let merged = merge_error_payload(data, error_payload);
    let mut flows: Vec<&Flow> = net
        .outgoing(&task.id)
        .filter(|f| f.error_arc)
        .filter(|f| {
            f.predicate
                .as_ref()
                .is_none_or(|p| p.is_default() || p.evaluate(&merged))
        })
        .collect();
    flows.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| net.target_place(a).cmp(&net.target_place(b)))
    });
    flows
}

fn merge_error_payload(
    data: &serde_json::Value,
    error_payload: &serde_json::Value,
) -> serde_json::Value {
    let mut merged = match data {
        serde_json::Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    merged.insert("error".to_string(), error_payload.clone());
    serde_json::Value::Object(merged)
}

/// Apply a task's out-parameter mappings to case data
pub fn apply_outputs(data: &mut serde_json::Value, task: &Task, outputs: &serde_json::Value) {
    if !data.is_object() {
        *data = serde_json::Value::Object(serde_json::Map::new());
    }
    if let (Some(map), Some(out)) = (data.as_object_mut(), outputs.as_object()) {
        for param in task.output_parameters() {
            if let Some(value) = out.get(&param.name) {
                map.insert(param.name.clone(), value.clone());
            }
        }
    }
}
