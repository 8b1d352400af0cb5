//! Engine-level integration tests
//!
//! Drives the facade end-to-end over a sled-backed stateful engine and the
//! stateless variant: worker checkout/checkin, lease expiry, idempotent
//! cancellation, engine selection, and crash recovery via log replay.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;

use caseweave::allocator::Worker;
use caseweave::case::CaseLifecycle;
use caseweave::engine::EngineOverride;
use caseweave::events::{EventKind, EventSink, ExternalEvent};
use caseweave::item::WorkItemState;
use caseweave::spec::types::PreferredEngine;
use caseweave::{Engine, EngineConfig, SledStore, SpecificationId};

fn sequential_doc() -> String {
    json!({
        "id": {"id": "seq", "version": "1"},
        "root_net": "main",
        "nets": {"main": {
            "name": "main",
            "input_condition": "start",
            "output_condition": "end",
            "tasks": {
                "a": {
                    "id": "a",
                    "allocation": {"required_capabilities": ["review"]},
                    "parameters": [
                        {"name": "verdict", "type": "boolean", "direction": "out"}
                    ]
                },
                "b": {"id": "b", "allocation": {"required_capabilities": ["review"]}},
                "c": {"id": "c", "allocation": {"required_capabilities": ["review"]}}
            },
            "flows": [
                {"source": "start", "target": "a"},
                {"source": "a", "target": "b"},
                {"source": "b", "target": "c"},
                {"source": "c", "target": "end"}
            ]
        }}
    })
    .to_string()
}

fn engine_at(path: &std::path::Path) -> Engine {
    let store = Arc::new(SledStore::open(path).unwrap());
    Engine::new(EngineConfig::default(), store, EventSink::disabled())
}

async fn offered_item(engine: &Engine, case_id: caseweave::CaseId) -> caseweave::WorkItem {
    engine
        .list_live_work_items(Some(case_id))
        .await
        .unwrap()
        .into_iter()
        .find(|i| i.state == WorkItemState::Offered)
        .expect("an offered item")
}

#[tokio::test]
async fn worker_path_drives_a_case_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());
    engine.register_spec(sequential_doc().as_bytes()).unwrap();
    engine
        .allocator()
        .register_worker(Worker::new("w1", vec!["review".to_string()], 4));

    let now = Utc::now();
    let receipt = engine
        .launch_case(&SpecificationId::new("seq", "1"), json!({}), None, now)
        .await
        .unwrap();
    assert_eq!(receipt.engine_used, PreferredEngine::Stateful);

    // a -> b -> c, each through the full worker contract.
    for step in 0..3 {
        let item = offered_item(&engine, receipt.case_id).await;
        let (inputs, lease) = engine.checkout(item.id, "w1", now).await.unwrap();
        assert_eq!(lease.worker_id, "w1");
        if step == 0 {
            assert_eq!(inputs, json!({}));
        }
        assert_eq!(engine.allocator().worker_load("w1"), Some(1));

        engine.start_item(item.id, "w1", now).await.unwrap();
        engine
            .checkin_complete(item.id, "w1", json!({"verdict": true}), now)
            .await
            .unwrap();
        assert_eq!(engine.allocator().worker_load("w1"), Some(0));
    }

    let view = engine.get_case(receipt.case_id).await.unwrap();
    assert_eq!(view.lifecycle, CaseLifecycle::Completed);
    assert_eq!(view.marking, vec![("end".to_string(), 1)]);
    assert_eq!(view.data["verdict"], json!(true));
    assert!(view.live_items.is_empty());
}

#[tokio::test]
async fn checkin_validation_burns_retries_then_fails() {
    let doc = json!({
        "id": {"id": "strict", "version": "1"},
        "root_net": "main",
        "nets": {"main": {
            "name": "main",
            "input_condition": "start",
            "output_condition": "end",
            "tasks": {"a": {
                "id": "a",
                "max_attempts": 2,
                "parameters": [{"name": "count", "type": "integer", "direction": "out"}]
            }},
            "flows": [
                {"source": "start", "target": "a"},
                {"source": "a", "target": "end"}
            ]
        }}
    });
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());
    engine.register_spec(doc.to_string().as_bytes()).unwrap();
    engine
        .allocator()
        .register_worker(Worker::new("w1", Vec::new(), 1));

    let now = Utc::now();
    let receipt = engine
        .launch_case(&SpecificationId::new("strict", "1"), json!({}), None, now)
        .await
        .unwrap();
    let item = offered_item(&engine, receipt.case_id).await;
    engine.checkout(item.id, "w1", now).await.unwrap();

    // First bad checkin: retry granted, item back with the same assignee.
    engine
        .checkin_complete(item.id, "w1", json!({"count": "three"}), now)
        .await
        .unwrap();
    let view = engine.get_case(receipt.case_id).await.unwrap();
    let live = &view.live_items[0];
    assert_eq!(live.state, WorkItemState::Allocated);
    assert_eq!(live.assignee.as_deref(), Some("w1"));

    // Second bad checkin exhausts the budget; no error arc, case fails.
    engine
        .checkin_complete(item.id, "w1", json!({}), now)
        .await
        .unwrap();
    let view = engine.get_case(receipt.case_id).await.unwrap();
    assert_eq!(view.lifecycle, CaseLifecycle::Failed);
}

#[tokio::test]
async fn lease_expiry_reclaims_then_fails_the_case() {
    let doc = json!({
        "id": {"id": "leases", "version": "1"},
        "root_net": "main",
        "nets": {"main": {
            "name": "main",
            "input_condition": "start",
            "output_condition": "end",
            "tasks": {"a": {"id": "a", "lease_ttl_ms": 1000, "max_attempts": 2}},
            "flows": [
                {"source": "start", "target": "a"},
                {"source": "a", "target": "end"}
            ]
        }}
    });
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());
    engine.register_spec(doc.to_string().as_bytes()).unwrap();
    engine
        .allocator()
        .register_worker(Worker::new("w1", Vec::new(), 1));

    let t0 = Utc::now();
    let receipt = engine
        .launch_case(&SpecificationId::new("leases", "1"), json!({}), None, t0)
        .await
        .unwrap();
    let item = offered_item(&engine, receipt.case_id).await;
    engine.checkout(item.id, "w1", t0).await.unwrap();

    // No heartbeats: the first TTL counts a miss, the second reclaims.
    let t1 = t0 + Duration::milliseconds(1100);
    engine.sweep(t1).await.unwrap();
    let t2 = t1 + Duration::milliseconds(1100);
    engine.sweep(t2).await.unwrap();

    let view = engine.get_case(receipt.case_id).await.unwrap();
    let reclaimed = view
        .live_items
        .iter()
        .find(|i| i.id == item.id)
        .expect("item still live");
    assert_eq!(reclaimed.attempt, 1);
    // Reclaimed items are re-offered automatically.
    assert_eq!(reclaimed.state, WorkItemState::Offered);

    // Second allocation, second double-expiry: attempts exhausted, the
    // item fails and with no error arc the case fails.
    engine.checkout(item.id, "w1", t2).await.unwrap();
    let t3 = t2 + Duration::milliseconds(1100);
    engine.sweep(t3).await.unwrap();
    let t4 = t3 + Duration::milliseconds(1100);
    engine.sweep(t4).await.unwrap();

    let view = engine.get_case(receipt.case_id).await.unwrap();
    assert_eq!(view.lifecycle, CaseLifecycle::Failed);
}

#[tokio::test]
async fn heartbeats_keep_the_lease_alive() {
    let doc = json!({
        "id": {"id": "beats", "version": "1"},
        "root_net": "main",
        "nets": {"main": {
            "name": "main",
            "input_condition": "start",
            "output_condition": "end",
            "tasks": {"a": {"id": "a", "lease_ttl_ms": 1000}},
            "flows": [
                {"source": "start", "target": "a"},
                {"source": "a", "target": "end"}
            ]
        }}
    });
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());
    engine.register_spec(doc.to_string().as_bytes()).unwrap();
    engine
        .allocator()
        .register_worker(Worker::new("w1", Vec::new(), 1));

    let t0 = Utc::now();
    let receipt = engine
        .launch_case(&SpecificationId::new("beats", "1"), json!({}), None, t0)
        .await
        .unwrap();
    let item = offered_item(&engine, receipt.case_id).await;
    engine.checkout(item.id, "w1", t0).await.unwrap();

    let mut now = t0;
    for _ in 0..5 {
        now = now + Duration::milliseconds(800);
        let lease = engine.heartbeat(item.id, "w1", now).await.unwrap();
        assert!(lease.expires_at > now);
        engine.sweep(now).await.unwrap();
    }

    let view = engine.get_case(receipt.case_id).await.unwrap();
    assert_eq!(view.lifecycle, CaseLifecycle::Executing);
    assert_eq!(view.live_items[0].state, WorkItemState::Allocated);
}

#[tokio::test]
async fn cancel_case_is_idempotent_across_event_ids() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());
    engine.register_spec(sequential_doc().as_bytes()).unwrap();

    let now = Utc::now();
    let receipt = engine
        .launch_case(&SpecificationId::new("seq", "1"), json!({}), None, now)
        .await
        .unwrap();

    engine.cancel_case(receipt.case_id, "E1", now).await.unwrap();
    let first = engine.stateful().case_state(receipt.case_id).await.unwrap();
    assert_eq!(first.lifecycle, CaseLifecycle::Cancelled);

    // Replaying the same id and sending a fresh one are both no-ops.
    engine.cancel_case(receipt.case_id, "E1", now).await.unwrap();
    let second = engine.stateful().case_state(receipt.case_id).await.unwrap();
    assert_eq!(first.snapshot().unwrap(), second.snapshot().unwrap());

    engine.cancel_case(receipt.case_id, "E2", now).await.unwrap();
    let third = engine.stateful().case_state(receipt.case_id).await.unwrap();
    assert_eq!(first.snapshot().unwrap(), third.snapshot().unwrap());

    let audits = first
        .audit
        .iter()
        .filter(|entry| entry.action == "cancelled")
        .count();
    assert_eq!(audits, 1);
}

#[tokio::test]
async fn stateless_profile_routes_through_the_facade() {
    let doc = json!({
        "id": {"id": "light", "version": "1"},
        "root_net": "main",
        "execution_profile": {"preferred": "stateless"},
        "nets": {"main": {
            "name": "main",
            "input_condition": "start",
            "output_condition": "end",
            "tasks": {"a": {"id": "a"}},
            "flows": [
                {"source": "start", "target": "a"},
                {"source": "a", "target": "end"}
            ]
        }}
    });
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());
    engine.register_spec(doc.to_string().as_bytes()).unwrap();

    let now = Utc::now();
    let receipt = engine
        .launch_case(&SpecificationId::new("light", "1"), json!({}), None, now)
        .await
        .unwrap();
    assert_eq!(receipt.engine_used, PreferredEngine::Stateless);

    let view = engine.get_case(receipt.case_id).await.unwrap();
    assert_eq!(view.engine_used, Some(PreferredEngine::Stateless));
    assert_eq!(view.live_items.len(), 1);

    let item_id = view.live_items[0].id;
    let lifecycle = engine
        .apply_event(
            receipt.case_id,
            &ExternalEvent::new(
                "done-a",
                EventKind::CompleteWorkItem {
                    item_id,
                    outputs: json!({}),
                },
            ),
            now,
        )
        .await
        .unwrap();
    assert_eq!(lifecycle, CaseLifecycle::Completed);
}

#[tokio::test]
async fn human_tasks_under_stateless_override_are_rejected() {
    let doc = json!({
        "id": {"id": "manual", "version": "1"},
        "root_net": "main",
        "nets": {"main": {
            "name": "main",
            "input_condition": "start",
            "output_condition": "end",
            "tasks": {"approve": {"id": "approve", "human": true}},
            "flows": [
                {"source": "start", "target": "approve"},
                {"source": "approve", "target": "end"}
            ]
        }}
    });
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());
    engine.register_spec(doc.to_string().as_bytes()).unwrap();

    let err = engine
        .launch_case(
            &SpecificationId::new("manual", "1"),
            json!({}),
            Some(EngineOverride {
                engine: PreferredEngine::Stateless,
                role: "engine-admin".to_string(),
            }),
            Utc::now(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 4);
}

#[tokio::test]
async fn recovery_replays_the_log_byte_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();
    let case_id;
    let before;
    {
        let engine = engine_at(dir.path());
        engine.register_spec(sequential_doc().as_bytes()).unwrap();
        engine
            .allocator()
            .register_worker(Worker::new("w1", vec!["review".to_string()], 4));

        let receipt = engine
            .launch_case(&SpecificationId::new("seq", "1"), json!({}), None, now)
            .await
            .unwrap();
        case_id = receipt.case_id;

        let item = offered_item(&engine, case_id).await;
        engine.checkout(item.id, "w1", now).await.unwrap();
        engine.start_item(item.id, "w1", now).await.unwrap();
        engine
            .checkin_complete(item.id, "w1", json!({"verdict": false}), now)
            .await
            .unwrap();

        before = engine
            .stateful()
            .case_state(case_id)
            .await
            .unwrap()
            .snapshot()
            .unwrap();
    }

    // A fresh engine over the same store must reconstruct the case from
    // the snapshot and the replayed entries, byte for byte.
    let engine = engine_at(dir.path());
    engine.register_spec(sequential_doc().as_bytes()).unwrap();
    engine
        .allocator()
        .register_worker(Worker::new("w1", vec!["review".to_string()], 4));
    let recovered = engine.recover(now).await.unwrap();
    assert_eq!(recovered, 1);

    let after = engine
        .stateful()
        .case_state(case_id)
        .await
        .unwrap()
        .snapshot()
        .unwrap();
    assert_eq!(before, after);

    // The recovered case keeps working: finish it.
    let item = offered_item(&engine, case_id).await;
    engine.checkout(item.id, "w1", now).await.unwrap();
    engine
        .checkin_complete(item.id, "w1", json!({}), now)
        .await
        .unwrap();
    let item = offered_item(&engine, case_id).await;
    engine.checkout(item.id, "w1", now).await.unwrap();
    engine
        .checkin_complete(item.id, "w1", json!({}), now)
        .await
        .unwrap();
    let view = engine.get_case(case_id).await.unwrap();
    assert_eq!(view.lifecycle, CaseLifecycle::Completed);
}

#[tokio::test]
async fn case_deadline_forces_cancellation() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SledStore::open(dir.path()).unwrap());
    let config = EngineConfig {
        case_deadline_default_ms: Some(5_000),
        ..EngineConfig::default()
    };
    let engine = Engine::new(config, store, EventSink::disabled());
    engine.register_spec(sequential_doc().as_bytes()).unwrap();

    let t0 = Utc::now();
    let receipt = engine
        .launch_case(&SpecificationId::new("seq", "1"), json!({}), None, t0)
        .await
        .unwrap();

    engine.sweep(t0 + Duration::milliseconds(4_000)).await.unwrap();
    let view = engine.get_case(receipt.case_id).await.unwrap();
    assert_eq!(view.lifecycle, CaseLifecycle::Executing);

    engine.sweep(t0 + Duration::milliseconds(5_001)).await.unwrap();
    let view = engine.get_case(receipt.case_id).await.unwrap();
    assert_eq!(view.lifecycle, CaseLifecycle::Cancelled);
    assert!(view.live_items.is_empty());
}

#[tokio::test]
async fn timers_fire_through_the_sweeper() {
    let doc = json!({
        "id": {"id": "timed", "version": "1"},
        "root_net": "main",
        "nets": {"main": {
            "name": "main",
            "input_condition": "start",
            "output_condition": "end",
            "conditions": {"b_in": {"id": "b_in"}},
            "tasks": {
                "fan": {"id": "fan", "split": "and"},
                "b": {"id": "b"},
                "escalate": {
                    "id": "escalate",
                    "timer": "PT2S",
                    "cancellation_region": ["b_in", "b"]
                },
                "finish": {"id": "finish", "join": "xor"}
            },
            "flows": [
                {"source": "start", "target": "fan"},
                {"source": "fan", "target": "b_in"},
                {"source": "fan", "target": "escalate"},
                {"source": "b_in", "target": "b"},
                {"source": "b", "target": "finish"},
                {"source": "escalate", "target": "finish"},
                {"source": "finish", "target": "end"}
            ]
        }}
    });
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());
    engine.register_spec(doc.to_string().as_bytes()).unwrap();

    let t0: DateTime<Utc> = Utc::now();
    let receipt = engine
        .launch_case(&SpecificationId::new("timed", "1"), json!({}), None, t0)
        .await
        .unwrap();

    // Complete fan so both branches arm.
    let view = engine.get_case(receipt.case_id).await.unwrap();
    let fan = view.live_items[0].id;
    engine
        .apply_event(
            receipt.case_id,
            &ExternalEvent::new(
                "done-fan",
                EventKind::CompleteWorkItem {
                    item_id: fan,
                    outputs: json!({}),
                },
            ),
            t0,
        )
        .await
        .unwrap();

    // The timer has not elapsed yet.
    engine.sweep(t0 + Duration::seconds(1)).await.unwrap();
    let view = engine.get_case(receipt.case_id).await.unwrap();
    assert!(view
        .live_items
        .iter()
        .any(|i| i.task_id == "b" && i.is_live()));

    // Elapsed: the region cancels b and the case advances to finish.
    engine.sweep(t0 + Duration::seconds(3)).await.unwrap();
    let view = engine.get_case(receipt.case_id).await.unwrap();
    assert!(view.live_items.iter().all(|i| i.task_id != "b"));
    assert!(view.live_items.iter().any(|i| i.task_id == "finish"));
}
