//! Task enablement
//!
//! Computes which tasks a marking enables, including the non-local OR-join
//! analysis, and fixes the deterministic firing order.

use std::collections::BTreeSet;

use crate::marking::Marking;
use crate::spec::types::{JoinType, Net, Task};

/// Whether `task` is enabled by `marking` under its join code
pub fn is_enabled(net: &Net, task: &Task, marking: &Marking) -> bool {
    let sources: Vec<String> = net
        .incoming(&task.id)
        .map(|f| net.source_place(f))
        .collect();
    if sources.is_empty() {
        return false;
    }
    match task.join {
        JoinType::And => sources.iter().all(|p| marking.is_marked(p)),
        JoinType::Xor => sources.iter().any(|p| marking.is_marked(p)),
        JoinType::Or => {
            if !sources.iter().any(|p| marking.is_marked(p)) {
                return false;
            }
            // Non-local semantics: enabled only when no unmarked source can
            // still receive a token from the residual net.
            !sources
                .iter()
                .filter(|p| !marking.is_marked(p))
                .any(|p| or_join_source_pending(net, task, marking, p))
        }
    }
}

/// Forward reachability on the residual net (the OR-join task removed)
///
/// Over-approximates coverage: a place is reachable when some other task
/// whose join could be satisfied from reachable places names it as a split
/// target. Predicates are data-dependent, so every split target counts.
/// The approximation errs toward "pending", which delays the join rather
/// than firing it early.
fn or_join_source_pending(net: &Net, join_task: &Task, marking: &Marking, source: &str) -> bool {
    let mut reachable: BTreeSet<String> = marking
        .marked_conditions()
        .map(|(place, _)| place.to_string())
        .collect();

    loop {
        let mut grew = false;
        for task in net.tasks.values() {
            if task.id == join_task.id {
                continue;
            }
            let task_sources: Vec<String> = net
                .incoming(&task.id)
                .map(|f| net.source_place(f))
                .collect();
            if task_sources.is_empty() {
                continue;
            }
            let could_fire = match task.join {
                JoinType::And => task_sources.iter().all(|p| reachable.contains(p)),
                JoinType::Xor | JoinType::Or => {
                    task_sources.iter().any(|p| reachable.contains(p))
                }
            };
            if !could_fire {
                continue;
            }
            for flow in net.outgoing(&task.id) {
                if reachable.insert(net.target_place(flow)) {
                    grew = true;
                }
            }
        }
        if !grew {
            break;
        }
    }

    // The source itself is unmarked; pending iff the closure can mark it.
    reachable.contains(source)
}

/// Enabled tasks in firing order
///
/// Cancellation firings (non-empty region) come first; ties break by
/// lexicographic task id. Deterministic given marking and data.
pub fn enabled_tasks<'a>(net: &'a Net, marking: &Marking) -> Vec<&'a Task> {
    let mut enabled: Vec<&Task> = net
        .tasks
        .values()
        .filter(|t| is_enabled(net, t, marking))
        .collect();
    enabled.sort_by(|a, b| {
        let a_cancel = a.cancellation_region.is_empty();
        let b_cancel = b.cancellation_region.is_empty();
        a_cancel.cmp(&b_cancel).then_with(|| a.id.cmp(&b.id))
    });
    enabled
}

/// The source places an enabled task consumes from, per its join code
pub fn consumption_places(net: &Net, task: &Task, marking: &Marking) -> Vec<String> {
    let flows: Vec<&crate::spec::types::Flow> = {
        let mut flows: Vec<_> = net.incoming(&task.id).collect();
        flows.sort_by_key(|f| (f.priority, net.source_place(f)));
        flows
    };
    match task.join {
        // AND consumes one token from every source.
        JoinType::And => flows.iter().map(|f| net.source_place(f)).collect(),
        // XOR consumes from the highest-priority marked source.
        JoinType::Xor => flows
            .iter()
            .map(|f| net.source_place(f))
            .find(|p| marking.is_marked(p))
            .into_iter()
            .collect(),
        // OR consumes one token from every marked source.
        JoinType::Or => flows
            .iter()
            .map(|f| net.source_place(f))
            .filter(|p| marking.is_marked(p))
            .collect(),
    }
}
