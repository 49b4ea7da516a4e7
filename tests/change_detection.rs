mod common;

use common::{create_test, create_variable, ingest, memory_engine, relative_difference, t};
use serde_json::json;
use tm_engine::{Engine, EngineEvent, MemorySink, ValidUpTo};
use tm_store::{Fingerprint, Variable};

/// t=1..4 at 10, t=5 at 20
async fn step_series(engine: &Engine) -> Variable {
    let test = create_test(engine, "step", &[]);
    let variable = create_variable(engine, test.id, "v", vec![relative_difference(1, 0.1, 1)]);
    for at in 1..=4 {
        ingest(engine, test.id, t(at), json!({"v": 10})).await;
    }
    ingest(engine, test.id, t(5), json!({"v": 20})).await;
    variable
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn detects_single_step_change() {
    let sink = MemorySink::new();
    let engine = memory_engine(&sink);
    let variable = step_series(&engine).await;

    let changes = engine.list_changes(variable.id, None).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].timestamp, t(5));
    assert!(!changes[0].confirmed);
    assert!(changes[0].description.contains("100.00% higher"));
    assert_eq!(
        engine.marker(variable.id, &Fingerprint::none()),
        Some(ValidUpTo::settled(t(5)))
    );

    let created = sink.of_kind("change_created");
    assert_eq!(created.len(), 1);
    let EngineEvent::ChangeCreated {
        test_name,
        dataset,
        notify,
        ..
    } = &created[0]
    else {
        panic!("expected change event");
    };
    assert_eq!(test_name, "step");
    assert_eq!(dataset.id, changes[0].dataset_id);
    assert!(*notify);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn earlier_point_invalidates_unconfirmed_changes() {
    let sink = MemorySink::new();
    let engine = memory_engine(&sink);
    let variable = step_series(&engine).await;
    let original = engine.list_changes(variable.id, None).unwrap();

    // Late arrival at t=3 with a different level
    ingest(&engine, variable.test_id, t(3), json!({"v": 20})).await;

    let changes = engine.list_changes(variable.id, None).unwrap();
    assert!(changes.iter().all(|c| c.id != original[0].id));
    let timestamps: Vec<_> = changes.iter().map(|c| c.timestamp).collect();
    assert_eq!(timestamps, vec![t(3), t(4), t(5)]);
    assert_eq!(
        engine.marker(variable.id, &Fingerprint::none()),
        Some(ValidUpTo::settled(t(5)))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn confirmed_change_survives_invalidation() {
    let engine = memory_engine(&MemorySink::new());
    let variable = step_series(&engine).await;
    let change = engine.list_changes(variable.id, None).unwrap().remove(0);
    assert!(engine.confirm_change(change.id, true).unwrap());

    ingest(&engine, variable.test_id, t(3), json!({"v": 10})).await;

    let changes = engine.list_changes(variable.id, None).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].id, change.id);
    assert!(changes[0].confirmed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn point_exactly_at_marker_is_reprocessed() {
    let engine = memory_engine(&MemorySink::new());
    let variable = step_series(&engine).await;
    let original = engine.list_changes(variable.id, None).unwrap().remove(0);

    let late = ingest(&engine, variable.test_id, t(5), json!({"v": 10})).await;

    let changes = engine.list_changes(variable.id, None).unwrap();
    assert!(changes.iter().all(|c| c.id != original.id));
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].dataset_id, late.id);
    assert_eq!(changes[0].timestamp, t(5));
    assert_eq!(
        engine.marker(variable.id, &Fingerprint::none()),
        Some(ValidUpTo::settled(t(5)))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rerun_without_new_data_is_idempotent() {
    let engine = memory_engine(&MemorySink::new());
    let variable = step_series(&engine).await;
    let before = engine.list_changes(variable.id, None).unwrap();
    let marker = engine.marker(variable.id, &Fingerprint::none());

    let summary = engine
        .run_detection(variable.id, Fingerprint::none(), true)
        .await
        .unwrap();

    assert_eq!(summary.passes, 0);
    assert!(summary.changes.is_empty());
    assert_eq!(engine.list_changes(variable.id, None).unwrap(), before);
    assert_eq!(engine.marker(variable.id, &Fingerprint::none()), marker);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fingerprints_partition_state() {
    let engine = memory_engine(&MemorySink::new());
    let test = create_test(&engine, "multi", &["arch"]);
    let variable = create_variable(&engine, test.id, "v", vec![relative_difference(1, 0.1, 1)]);

    for at in 1..=5 {
        let a = if at == 5 { 20 } else { 10 };
        ingest(&engine, test.id, t(at), json!({"v": a, "arch": "a"})).await;
        ingest(&engine, test.id, t(at), json!({"v": 10, "arch": "b"})).await;
    }

    let fp_a = Fingerprint::new(json!("a"));
    let fp_b = Fingerprint::new(json!("b"));
    assert_eq!(engine.list_changes(variable.id, Some(&fp_a)).unwrap().len(), 1);
    assert!(engine.list_changes(variable.id, Some(&fp_b)).unwrap().is_empty());

    // A late point in one partition leaves the other's marker alone
    ingest(&engine, test.id, t(2), json!({"v": 10, "arch": "a"})).await;
    assert_eq!(engine.marker(variable.id, &fp_b), Some(ValidUpTo::settled(t(5))));
    assert_eq!(engine.marker(variable.id, &fp_a), Some(ValidUpTo::settled(t(5))));
    assert!(engine.list_changes(variable.id, Some(&fp_b)).unwrap().is_empty());

    let latest = engine
        .last_datapoint_timestamps(Some(&fp_b), &[variable.id])
        .unwrap();
    assert_eq!(latest, vec![(variable.id, t(5))]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deleting_variable_drops_markers_and_changes() {
    let engine = memory_engine(&MemorySink::new());
    let variable = step_series(&engine).await;

    assert!(engine.delete_variable(variable.id).unwrap());
    assert!(engine.marker(variable.id, &Fingerprint::none()).is_none());
    assert!(engine.list_changes(variable.id, None).unwrap().is_empty());
    assert!(!engine.delete_variable(variable.id).unwrap());
}
