//! Token-game scenario tests
//!
//! Exercises the net runner's join/split semantics, multi-instance
//! expansion, cancellation regions and boundary behaviours against small
//! hand-built specifications.

use chrono::Utc;
use serde_json::json;

use caseweave::case::{Case, CaseLifecycle};
use caseweave::events::{EventKind, ExternalEvent};
use caseweave::item::{ItemId, WorkItemState};
use caseweave::runner::NetRunner;
use caseweave::spec::{load, Specification};

fn spec(doc: serde_json::Value) -> Specification {
    load(doc.to_string().as_bytes()).unwrap()
}

fn new_case(spec: &Specification, data: serde_json::Value) -> Case {
    let net = spec.root();
    Case::new(
        spec.id.clone(),
        &spec.root_net,
        &net.input_condition,
        data,
        Utc::now(),
    )
}

fn complete_item(
    runner: &NetRunner<'_>,
    case: &mut Case,
    item_id: ItemId,
    outputs: serde_json::Value,
    event_id: &str,
) -> Vec<ItemId> {
    runner
        .apply_event(
            case,
            &ExternalEvent::new(event_id, EventKind::CompleteWorkItem { item_id, outputs }),
            Utc::now(),
        )
        .unwrap()
        .new_items
}

mod xor_branching {
    use super::*;

    fn branching_spec() -> Specification {
        spec(json!({
            "id": {"id": "branch", "version": "1"},
            "root_net": "main",
            "nets": {"main": {
                "name": "main",
                "input_condition": "start",
                "output_condition": "end",
                "conditions": {"b_in": {"id": "b_in"}, "c_in": {"id": "c_in"}},
                "tasks": {
                    "a": {"id": "a", "split": "xor"},
                    "b": {"id": "b"},
                    "c": {"id": "c"}
                },
                "flows": [
                    {"source": "start", "target": "a"},
                    {"source": "a", "target": "b_in", "predicate": "x > 0", "priority": 0},
                    {"source": "a", "target": "c_in", "predicate": "default", "priority": 1},
                    {"source": "b_in", "target": "b"},
                    {"source": "c_in", "target": "c"},
                    {"source": "b", "target": "end"},
                    {"source": "c", "target": "end"}
                ]
            }}
        }))
    }

    #[test]
    fn positive_predicate_takes_the_b_branch() {
        let spec = branching_spec();
        let runner = NetRunner::new(&spec, 30_000, 3);
        let mut case = new_case(&spec, json!({"x": 5}));

        let adv = runner.launch(&mut case, Utc::now()).unwrap();
        let items = complete_item(&runner, &mut case, adv.new_items[0], json!({}), "done-a");

        // Only b's item exists; c's source never received a token.
        assert_eq!(items.len(), 1);
        assert_eq!(case.item(&items[0]).unwrap().task_id, "b");
        assert!(!case.marking.is_marked("c_in"));
        assert!(case.items.values().all(|i| i.task_id != "c"));

        complete_item(&runner, &mut case, items[0], json!({}), "done-b");
        assert_eq!(case.lifecycle, CaseLifecycle::Completed);
    }

    #[test]
    fn no_match_takes_the_default_arc() {
        let spec = branching_spec();
        let runner = NetRunner::new(&spec, 30_000, 3);
        let mut case = new_case(&spec, json!({"x": -3}));

        let adv = runner.launch(&mut case, Utc::now()).unwrap();
        let items = complete_item(&runner, &mut case, adv.new_items[0], json!({}), "done-a");
        assert_eq!(case.item(&items[0]).unwrap().task_id, "c");
        assert!(!case.marking.is_marked("b_in"));
    }
}

mod parallel_and {
    use super::*;

    fn diamond_spec() -> Specification {
        spec(json!({
            "id": {"id": "diamond", "version": "1"},
            "root_net": "main",
            "nets": {"main": {
                "name": "main",
                "input_condition": "start",
                "output_condition": "end",
                "tasks": {
                    "a": {"id": "a", "split": "and"},
                    "b": {"id": "b"},
                    "c": {"id": "c"},
                    "d": {"id": "d"},
                    "e": {"id": "e", "join": "and"}
                },
                "flows": [
                    {"source": "start", "target": "a"},
                    {"source": "a", "target": "b"},
                    {"source": "a", "target": "c"},
                    {"source": "a", "target": "d"},
                    {"source": "b", "target": "e"},
                    {"source": "c", "target": "e"},
                    {"source": "d", "target": "e"},
                    {"source": "e", "target": "end"}
                ]
            }}
        }))
    }

    fn run_permutation(order: [&str; 3]) {
        let spec = diamond_spec();
        let runner = NetRunner::new(&spec, 30_000, 3);
        let mut case = new_case(&spec, json!({}));

        let adv = runner.launch(&mut case, Utc::now()).unwrap();
        let items = complete_item(&runner, &mut case, adv.new_items[0], json!({}), "done-a");
        assert_eq!(items.len(), 3);

        // Complete b, c, d in the given order; e must fire exactly once,
        // only after the last completion.
        let mut n = 0;
        for task in order {
            let item_id = case
                .items
                .values()
                .find(|i| i.task_id == task && i.is_live())
                .map(|i| i.id)
                .unwrap();
            n += 1;
            let new_items =
                complete_item(&runner, &mut case, item_id, json!({}), &format!("done-{n}"));
            let e_count = case.items.values().filter(|i| i.task_id == "e").count();
            if n < 3 {
                assert!(new_items.is_empty());
                assert_eq!(e_count, 0, "e fired before all branches completed");
            } else {
                assert_eq!(e_count, 1);
            }
        }

        let e_item = case
            .items
            .values()
            .find(|i| i.task_id == "e" && i.is_live())
            .map(|i| i.id)
            .unwrap();
        complete_item(&runner, &mut case, e_item, json!({}), "done-e");
        assert_eq!(case.lifecycle, CaseLifecycle::Completed);
    }

    #[test]
    fn join_fires_once_regardless_of_completion_order() {
        run_permutation(["b", "c", "d"]);
        run_permutation(["d", "b", "c"]);
        run_permutation(["c", "d", "b"]);
    }
}

mod multi_instance {
    use super::*;

    fn mi_spec(min: usize, threshold: usize) -> Specification {
        spec(json!({
            "id": {"id": "mi", "version": "1"},
            "root_net": "main",
            "nets": {"main": {
                "name": "main",
                "input_condition": "start",
                "output_condition": "end",
                "tasks": {
                    "x": {
                        "id": "x",
                        "parameters": [
                            {"name": "result", "type": "number", "direction": "out"}
                        ],
                        "multi_instance": {
                            "min": min, "max": 5, "threshold": threshold,
                            "creation_mode": "static", "selector": "orders"
                        }
                    }
                },
                "flows": [
                    {"source": "start", "target": "x"},
                    {"source": "x", "target": "end"}
                ]
            }}
        }))
    }

    #[test]
    fn threshold_completion_withdraws_the_rest() {
        let spec = mi_spec(1, 2);
        let runner = NetRunner::new(&spec, 30_000, 3);
        let mut case = new_case(&spec, json!({"orders": [1, 2, 3]}));

        let adv = runner.launch(&mut case, Utc::now()).unwrap();
        assert_eq!(adv.new_items.len(), 3);

        // Instance inputs carry the selector fragments in index order.
        let fragments: Vec<i64> = adv
            .new_items
            .iter()
            .map(|id| case.item(id).unwrap().data["instance"].as_i64().unwrap())
            .collect();
        assert_eq!(fragments, vec![1, 2, 3]);

        complete_item(&runner, &mut case, adv.new_items[0], json!({"result": 10}), "i0");
        assert_eq!(case.lifecycle, CaseLifecycle::Executing);
        complete_item(&runner, &mut case, adv.new_items[1], json!({"result": 20}), "i1");

        // Threshold met: the case advanced and the third instance was
        // withdrawn, not completed.
        assert_eq!(case.lifecycle, CaseLifecycle::Completed);
        let third = case.item(&adv.new_items[2]).unwrap();
        assert_eq!(third.state, WorkItemState::Cancelled);
        assert_eq!(case.data["result"], json!([10, 20]));
    }

    #[test]
    fn zero_min_completes_immediately() {
        let spec = mi_spec(0, 0);
        let runner = NetRunner::new(&spec, 30_000, 3);
        let mut case = new_case(&spec, json!({"orders": []}));

        let adv = runner.launch(&mut case, Utc::now()).unwrap();
        assert!(adv.new_items.is_empty());
        assert_eq!(case.lifecycle, CaseLifecycle::Completed);
        assert_eq!(case.data["result"], json!([]));
    }

    #[test]
    fn selector_out_of_bounds_fails_the_firing() {
        let spec = mi_spec(2, 2);
        let runner = NetRunner::new(&spec, 30_000, 3);
        let mut case = new_case(&spec, json!({"orders": [1]}));

        runner.launch(&mut case, Utc::now()).unwrap();
        assert_eq!(case.lifecycle, CaseLifecycle::Failed);
    }

    #[test]
    fn cancellation_below_threshold_fails_the_task() {
        let spec = mi_spec(1, 3);
        let runner = NetRunner::new(&spec, 30_000, 3);
        let mut case = new_case(&spec, json!({"orders": [1, 2, 3]}));

        let adv = runner.launch(&mut case, Utc::now()).unwrap();
        complete_item(&runner, &mut case, adv.new_items[0], json!({"result": 1}), "i0");

        // Cancelling one instance leaves only two possible completions of
        // a threshold of three: the task, and with no error arc the case,
        // fails.
        runner
            .apply_event(
                &mut case,
                &ExternalEvent::new(
                    "cancel-i1",
                    EventKind::CancelWorkItem {
                        item_id: adv.new_items[1],
                    },
                ),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(case.lifecycle, CaseLifecycle::Failed);
    }
}

mod cancellation_region {
    use super::*;

    /// A(split AND) -> {B, timer}; the timer's region covers B's source
    /// condition and B itself.
    fn region_spec() -> Specification {
        spec(json!({
            "id": {"id": "region", "version": "1"},
            "root_net": "main",
            "nets": {"main": {
                "name": "main",
                "input_condition": "start",
                "output_condition": "end",
                "conditions": {"b_in": {"id": "b_in"}},
                "tasks": {
                    "a": {"id": "a", "split": "and"},
                    "b": {"id": "b"},
                    "escalate": {
                        "id": "escalate",
                        "timer": "PT1M",
                        "cancellation_region": ["b_in", "b"]
                    },
                    "finish": {"id": "finish", "join": "xor"}
                },
                "flows": [
                    {"source": "start", "target": "a"},
                    {"source": "a", "target": "b_in"},
                    {"source": "a", "target": "escalate"},
                    {"source": "b_in", "target": "b"},
                    {"source": "b", "target": "finish"},
                    {"source": "escalate", "target": "finish"},
                    {"source": "finish", "target": "end"}
                ]
            }}
        }))
    }

    #[test]
    fn timer_firing_cancels_the_region_and_continues() {
        let spec = region_spec();
        let runner = NetRunner::new(&spec, 30_000, 3);
        let mut case = new_case(&spec, json!({}));

        let adv = runner.launch(&mut case, Utc::now()).unwrap();
        let a_item = adv.new_items[0];
        let adv = runner
            .apply_event(
                &mut case,
                &ExternalEvent::new(
                    "done-a",
                    EventKind::CompleteWorkItem {
                        item_id: a_item,
                        outputs: json!({}),
                    },
                ),
                Utc::now(),
            )
            .unwrap();

        // Both branches armed: b's item and the timer's item exist.
        let b_item = case
            .items
            .values()
            .find(|i| i.task_id == "b" && i.is_live())
            .map(|i| i.id)
            .unwrap();
        assert_eq!(adv.new_items.len(), 2);

        let adv = runner
            .apply_event(
                &mut case,
                &ExternalEvent::new(
                    "timer-pop",
                    EventKind::TimerFired {
                        task_id: "escalate".to_string(),
                    },
                ),
                Utc::now(),
            )
            .unwrap();

        // The region cancelled b's work item and drained its source.
        assert_eq!(
            case.item(&b_item).unwrap().state,
            WorkItemState::Cancelled
        );
        assert!(!case.marking.is_marked("b_in"));

        // The case continues along the timer arc through finish.
        let finish = adv
            .new_items
            .iter()
            .find(|id| case.item(id).unwrap().task_id == "finish")
            .copied()
            .unwrap();
        complete_item(&runner, &mut case, finish, json!({}), "done-finish");
        assert_eq!(case.lifecycle, CaseLifecycle::Completed);
    }

    #[test]
    fn region_containing_the_task_itself_cancels_nothing_extra() {
        let doc = json!({
            "id": {"id": "selfregion", "version": "1"},
            "root_net": "main",
            "nets": {"main": {
                "name": "main",
                "input_condition": "start",
                "output_condition": "end",
                "tasks": {
                    "a": {"id": "a", "cancellation_region": ["a", "start"]}
                },
                "flows": [
                    {"source": "start", "target": "a"},
                    {"source": "a", "target": "end"}
                ]
            }}
        });
        let spec = spec(doc);
        let runner = NetRunner::new(&spec, 30_000, 3);
        let mut case = new_case(&spec, json!({}));

        let adv = runner.launch(&mut case, Utc::now()).unwrap();
        complete_item(&runner, &mut case, adv.new_items[0], json!({}), "done-a");

        // Firing consumed a's token already; the region removed nothing
        // extra and the case completed normally.
        assert_eq!(case.lifecycle, CaseLifecycle::Completed);
        assert_eq!(
            case.items
                .values()
                .filter(|i| i.state == WorkItemState::Cancelled)
                .count(),
            0
        );
    }
}

mod or_join_boundaries {
    use super::*;

    /// An OR-join fed by a branch that loops back through a region the
    /// join's sibling cancels: once the region is cleared, "further tokens
    /// can arrive" must evaluate false and the join must fire.
    #[test]
    fn or_join_fires_after_cancelled_region_removes_feedback() {
        let doc = json!({
            "id": {"id": "orloop", "version": "1"},
            "root_net": "main",
            "nets": {"main": {
                "name": "main",
                "input_condition": "start",
                "output_condition": "end",
                "conditions": {
                    "j1": {"id": "j1"},
                    "j2": {"id": "j2"},
                    "loop_in": {"id": "loop_in"}
                },
                "tasks": {
                    "seed": {"id": "seed", "split": "and",
                             "cancellation_region": ["loop_in"]},
                    "feeder": {"id": "feeder"},
                    "merge": {"id": "merge", "join": "or"}
                },
                "flows": [
                    {"source": "start", "target": "seed"},
                    {"source": "seed", "target": "j1"},
                    {"source": "seed", "target": "loop_in"},
                    {"source": "loop_in", "target": "feeder"},
                    {"source": "feeder", "target": "j2"},
                    {"source": "j1", "target": "merge"},
                    {"source": "j2", "target": "merge"},
                    {"source": "merge", "target": "end"}
                ]
            }}
        });
        let spec = spec(doc);
        let runner = NetRunner::new(&spec, 30_000, 3);
        let mut case = new_case(&spec, json!({}));

        let adv = runner.launch(&mut case, Utc::now()).unwrap();
        let adv = runner
            .apply_event(
                &mut case,
                &ExternalEvent::new(
                    "done-seed",
                    EventKind::CompleteWorkItem {
                        item_id: adv.new_items[0],
                        outputs: json!({}),
                    },
                ),
                Utc::now(),
            )
            .unwrap();

        // seed produced j1 and loop_in, then its region drained loop_in:
        // nothing can reach j2 any more, so the OR-join fired on j1 alone.
        assert!(!case.marking.is_marked("loop_in"));
        let merge_item = adv
            .new_items
            .iter()
            .find(|id| case.item(id).unwrap().task_id == "merge")
            .copied()
            .expect("merge enabled despite empty second source");

        complete_item(&runner, &mut case, merge_item, json!({}), "done-merge");
        assert_eq!(case.lifecycle, CaseLifecycle::Completed);
    }
}

mod composite_tasks {
    use super::*;
    use caseweave::case::ParentLink;

    #[test]
    fn subcase_roundtrip_applies_out_parameters() {
        let doc = json!({
            "id": {"id": "nested", "version": "1"},
            "root_net": "outer",
            "nets": {
                "outer": {
                    "name": "outer",
                    "input_condition": "start",
                    "output_condition": "end",
                    "tasks": {"review": {
                        "id": "review",
                        "kind": "composite",
                        "decomposition": "inner",
                        "parameters": [
                            {"name": "doc", "type": "string", "direction": "in"},
                            {"name": "verdict", "type": "boolean", "direction": "out"}
                        ]
                    }},
                    "flows": [
                        {"source": "start", "target": "review"},
                        {"source": "review", "target": "end"}
                    ]
                },
                "inner": {
                    "name": "inner",
                    "input_condition": "in_start",
                    "output_condition": "in_end",
                    "tasks": {"judge": {
                        "id": "judge",
                        "parameters": [
                            {"name": "verdict", "type": "boolean", "direction": "out"}
                        ]
                    }},
                    "flows": [
                        {"source": "in_start", "target": "judge"},
                        {"source": "judge", "target": "in_end"}
                    ]
                }
            }
        });
        let spec = spec(doc);
        let runner = NetRunner::new(&spec, 30_000, 3);
        let mut parent = new_case(&spec, json!({"doc": "d-7"}));

        let adv = runner.launch(&mut parent, Utc::now()).unwrap();
        assert_eq!(adv.subcase_requests.len(), 1);
        let request = &adv.subcase_requests[0];
        assert_eq!(request.net, "inner");
        assert_eq!(request.data, json!({"doc": "d-7"}));

        // Drive the child net by hand, the way an engine variant would.
        let inner_net = spec.get_net("inner").unwrap();
        let mut child = Case::new(
            spec.id.clone(),
            "inner",
            &inner_net.input_condition,
            request.data.clone(),
            Utc::now(),
        );
        child.parent = Some(ParentLink {
            case_id: parent.id,
            firing: request.firing,
            task_id: "review".to_string(),
        });
        runner
            .attach_subcase(&mut parent, request.firing, child.id)
            .unwrap();

        let adv = runner.launch(&mut child, Utc::now()).unwrap();
        complete_item(
            &runner,
            &mut child,
            adv.new_items[0],
            json!({"verdict": true}),
            "done-judge",
        );
        assert_eq!(child.lifecycle, CaseLifecycle::Completed);

        runner
            .subcase_terminal(
                &mut parent,
                child.id,
                child.lifecycle,
                child.data.clone(),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(parent.lifecycle, CaseLifecycle::Completed);
        assert_eq!(parent.data["verdict"], json!(true));
    }
}
