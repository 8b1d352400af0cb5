//! Load-time specification validation
//!
//! Runs every structural invariant once, at load. A specification that
//! passes validation is never re-checked at runtime. Errors name the
//! violated rule so callers can surface actionable messages.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{WorkflowError, WorkflowResult};
use crate::spec::types::{Net, Specification, SplitType, TaskKind};

fn violation(rule: &'static str, message: String) -> WorkflowError {
    WorkflowError::InvalidSpecification { rule, message }
}

/// Validate a parsed specification against all structural invariants
pub fn validate(spec: &Specification) -> WorkflowResult<()> {
    if !spec.nets.contains_key(&spec.root_net) {
        return Err(violation(
            "root-net-unresolved",
            format!("root net {} is not declared", spec.root_net),
        ));
    }

    for net in spec.nets.values() {
        validate_net(net)?;
        validate_decompositions(spec, net)?;
    }

    validate_decomposition_acyclic(spec)?;
    Ok(())
}

fn validate_net(net: &Net) -> WorkflowResult<()> {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for id in [net.input_condition.as_str(), net.output_condition.as_str()]
        .into_iter()
        .chain(net.conditions.keys().map(String::as_str))
        .chain(net.tasks.keys().map(String::as_str))
    {
        if !seen.insert(id) {
            return Err(violation(
                "duplicate-element-id",
                format!("net {}: element id {} declared twice", net.name, id),
            ));
        }
    }

    for flow in &net.flows {
        for endpoint in [&flow.source, &flow.target] {
            if !net.has_element(endpoint) {
                return Err(violation(
                    "flow-endpoint-unresolved",
                    format!(
                        "net {}: flow {} -> {} references undeclared element {}",
                        net.name, flow.source, flow.target, endpoint
                    ),
                ));
            }
        }
        if flow.target == net.input_condition {
            return Err(violation(
                "input-condition-incoming",
                format!("net {}: input condition has an incoming flow", net.name),
            ));
        }
        if flow.source == net.output_condition {
            return Err(violation(
                "output-condition-outgoing",
                format!("net {}: output condition has an outgoing flow", net.name),
            ));
        }
        let source_is_condition = !net.tasks.contains_key(&flow.source);
        let target_is_condition = !net.tasks.contains_key(&flow.target);
        if source_is_condition && target_is_condition {
            return Err(violation(
                "condition-to-condition-flow",
                format!(
                    "net {}: flow {} -> {} connects two conditions",
                    net.name, flow.source, flow.target
                ),
            ));
        }
        if source_is_condition && flow.predicate.is_some() {
            return Err(violation(
                "condition-flow-predicate",
                format!(
                    "net {}: flow out of condition {} carries a predicate",
                    net.name, flow.source
                ),
            ));
        }
    }

    for task in net.tasks.values() {
        let incoming = net.incoming(&task.id).count();
        let outgoing: Vec<_> = net.outgoing(&task.id).collect();
        if incoming == 0 || outgoing.is_empty() {
            return Err(violation(
                "task-flow-degree",
                format!(
                    "net {}: task {} needs at least one incoming and one outgoing flow",
                    net.name, task.id
                ),
            ));
        }

        // Error arcs fire on the failure path and stay out of split checks.
        let outgoing: Vec<_> = outgoing.into_iter().filter(|f| !f.error_arc).collect();
        match task.split {
            SplitType::Xor if outgoing.len() > 1 => {
                let mut priorities = BTreeSet::new();
                for flow in &outgoing {
                    if !priorities.insert(flow.priority) {
                        return Err(violation(
                            "xor-split-priority-order",
                            format!(
                                "net {}: XOR split {} has duplicate flow priority {}",
                                net.name, task.id, flow.priority
                            ),
                        ));
                    }
                }
                ensure_default_arc(net, &task.id, &outgoing, "xor-split-default-arc")?;
            }
            SplitType::Or if outgoing.len() > 1 => {
                ensure_default_arc(net, &task.id, &outgoing, "or-split-default-arc")?;
            }
            _ => {}
        }

        if let Some(mi) = &task.multi_instance {
            if mi.min > mi.max || mi.threshold > mi.max {
                return Err(violation(
                    "multi-instance-bounds",
                    format!(
                        "net {}: task {} multi-instance bounds violated (min {} max {} threshold {})",
                        net.name, task.id, mi.min, mi.max, mi.threshold
                    ),
                ));
            }
        }

        for element in &task.cancellation_region {
            if !net.has_element(element) && !is_implicit_condition(net, element) {
                return Err(violation(
                    "cancellation-region-unresolved",
                    format!(
                        "net {}: task {} cancellation region names undeclared element {}",
                        net.name, task.id, element
                    ),
                ));
            }
        }

        if let Some(comp) = &task.compensation_task {
            if !net.tasks.contains_key(comp) {
                return Err(violation(
                    "compensation-task-unresolved",
                    format!(
                        "net {}: task {} names undeclared compensation task {}",
                        net.name, task.id, comp
                    ),
                ));
            }
        }
    }

    Ok(())
}

fn ensure_default_arc(
    net: &Net,
    task_id: &str,
    outgoing: &[&crate::spec::types::Flow],
    rule: &'static str,
) -> WorkflowResult<()> {
    let has_default = outgoing.iter().any(|f| {
        f.is_default || f.predicate.as_ref().is_none_or(|p| p.is_default())
    });
    if has_default {
        Ok(())
    } else {
        Err(violation(
            rule,
            format!("net {}: split {} has no default arc", net.name, task_id),
        ))
    }
}

/// Implicit conditions stand between directly connected tasks and may be
/// named in cancellation regions as `source->target`.
fn is_implicit_condition(net: &Net, element: &str) -> bool {
    match element.split_once("->") {
        Some((source, target)) => net
            .flows
            .iter()
            .any(|f| f.source == source && f.target == target),
        None => false,
    }
}

fn validate_decompositions(spec: &Specification, net: &Net) -> WorkflowResult<()> {
    for task in net.tasks.values() {
        if task.kind == TaskKind::Composite {
            match &task.decomposition {
                Some(child) if spec.nets.contains_key(child) => {}
                Some(child) => {
                    return Err(violation(
                        "decomposition-unresolved",
                        format!(
                            "net {}: composite task {} references undeclared net {}",
                            net.name, task.id, child
                        ),
                    ));
                }
                None => {
                    return Err(violation(
                        "decomposition-missing",
                        format!(
                            "net {}: composite task {} declares no child net",
                            net.name, task.id
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Decomposition references must form a DAG over nets
fn validate_decomposition_acyclic(spec: &Specification) -> WorkflowResult<()> {
    let mut edges: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for net in spec.nets.values() {
        let children = net
            .tasks
            .values()
            .filter(|t| t.kind == TaskKind::Composite)
            .filter_map(|t| t.decomposition.as_deref())
            .collect();
        edges.insert(net.name.as_str(), children);
    }

    // Colours: 0 unvisited, 1 on stack, 2 done.
    let mut colour: BTreeMap<&str, u8> = BTreeMap::new();
    let mut stack: Vec<(&str, usize)> = Vec::new();
    for &start in edges.keys() {
        if colour.get(start).copied().unwrap_or(0) != 0 {
            continue;
        }
        colour.insert(start, 1);
        stack.push((start, 0));
        while let Some((node, idx)) = stack.pop() {
            let children = edges.get(node).map(Vec::as_slice).unwrap_or(&[]);
            if idx < children.len() {
                stack.push((node, idx + 1));
                let child = children[idx];
                match colour.get(child).copied().unwrap_or(0) {
                    0 => {
                        colour.insert(child, 1);
                        stack.push((child, 0));
                    }
                    1 => {
                        return Err(violation(
                            "decomposition-cycle",
                            format!("net {} participates in a decomposition cycle", child),
                        ));
                    }
                    _ => {}
                }
            } else {
                colour.insert(node, 2);
            }
        }
    }
    Ok(())
}
