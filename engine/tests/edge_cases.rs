//! Edge case tests for tether-engine
//!
//! These tests cover boundary conditions and unusual inputs.

use serde_json::json;
use tether_engine::{
    ActionStatus, ConflictResolver, Error, Fields, ManualClock, MergeStrategy, Module,
    ModuleSnapshot, Mutation, MutationQueue, QueueSnapshot, Record, Resolution, Schema, Store,
};

fn fields(value: serde_json::Value) -> Fields {
    value.as_object().cloned().unwrap_or_default()
}

// ============================================================================
// String Edge Cases
// ============================================================================

#[test]
fn empty_string_fields() {
    let clock = ManualClock::new(1000);
    let mut store = Store::new(Schema::dashboard());

    let record = store
        .create(Module::Customers, fields(json!({"name": ""})), &clock)
        .unwrap();

    assert_eq!(store.get(Module::Customers, &record.id).unwrap().fields["name"], "");
}

#[test]
fn unicode_strings() {
    let clock = ManualClock::new(1000);
    let mut store = Store::new(Schema::dashboard());

    let titles = [
        "日本語テスト",
        "Привет мир",
        "مرحبا بالعالم",
        "🎉🚀💯",
        "Hello\nWorld\tTab",
        "Null\0Test",
    ];

    for (i, title) in titles.iter().enumerate() {
        let id = format!("task_{i}");
        store
            .create_with_id(Module::Tasks, id.clone(), fields(json!({"title": title})), &clock)
            .unwrap();
        assert_eq!(store.get(Module::Tasks, &id).unwrap().fields["title"], *title);
    }
}

#[test]
fn very_long_strings() {
    let clock = ManualClock::new(1000);
    let mut store = Store::new(Schema::dashboard());
    let long = "x".repeat(1_000_000);

    let record = store
        .create(Module::Notifications, fields(json!({"title": long})), &clock)
        .unwrap();

    let snapshot = store.export_module(Module::Notifications);
    let restored = ModuleSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
    assert_eq!(restored.get_record(&record.id).unwrap(), &record);
}

// ============================================================================
// JSON Edge Cases
// ============================================================================

#[test]
fn deeply_nested_json() {
    let clock = ManualClock::new(1000);
    let mut store = Store::new(Schema::dashboard());

    let mut nested = json!({"value": "deep"});
    for _ in 0..50 {
        nested = json!({"inner": nested});
    }

    let record = store
        .create(
            Module::Okrs,
            fields(json!({"objective": "Grow", "keyResults": nested})),
            &clock,
        )
        .unwrap();
    assert_eq!(record.fields["keyResults"], nested);
}

#[test]
fn unknown_fields_are_kept() {
    let clock = ManualClock::new(1000);
    let mut store = Store::new(Schema::dashboard());

    let record = store
        .create(
            Module::Invoices,
            fields(json!({
                "number": "INV-9",
                "amount": 0,
                "lines": [{"sku": "A", "qty": 2}],
                "field-with.special_chars": true
            })),
            &clock,
        )
        .unwrap();

    assert_eq!(record.fields["lines"][0]["qty"], 2);
    assert_eq!(record.fields["field-with.special_chars"], true);
}

// ============================================================================
// Timestamp Edge Cases
// ============================================================================

#[test]
fn rapid_updates_same_record() {
    let clock = ManualClock::new(1000);
    let mut store = Store::new(Schema::dashboard());
    let task = store
        .create(Module::Tasks, fields(json!({"title": "v0"})), &clock)
        .unwrap();

    // Clock never moves; updated_at must still increase
    let mut last = task.updated_at;
    for i in 1..=100 {
        let updated = store
            .update(Module::Tasks, &task.id, &fields(json!({"title": format!("v{i}")})), &clock)
            .unwrap();
        assert!(updated.updated_at > last);
        last = updated.updated_at;
    }

    let record = store.get(Module::Tasks, &task.id).unwrap();
    assert_eq!(record.fields["title"], "v100");
    assert_eq!(record.created_at, 1000);
}

#[test]
fn clock_stepping_backwards() {
    let clock = ManualClock::new(5000);
    let mut store = Store::new(Schema::dashboard());
    let task = store
        .create(Module::Tasks, fields(json!({"title": "t"})), &clock)
        .unwrap();

    clock.set(10);
    let updated = store
        .update(Module::Tasks, &task.id, &fields(json!({"completed": true})), &clock)
        .unwrap();
    assert_eq!(updated.updated_at, 5001);
}

// ============================================================================
// Store Error Edge Cases
// ============================================================================

#[test]
fn remove_missing_record_is_not_found() {
    let mut store = Store::new(Schema::dashboard());
    assert_eq!(
        store.remove(Module::Users, "ghost"),
        Err(Error::NotFound {
            module: Module::Users,
            id: "ghost".into()
        })
    );
}

#[test]
fn batch_create_is_all_or_nothing() {
    let clock = ManualClock::new(1000);
    let mut store = Store::new(Schema::dashboard());

    let result = store.batch_create(
        Module::Users,
        vec![
            fields(json!({"name": "Ana", "email": "ana@example.com"})),
            fields(json!({"name": "Bo"})),
        ],
        &clock,
    );

    assert_eq!(result, Err(Error::MissingRequiredField("email".into())));
    assert_eq!(store.count(Module::Users), 0);
}

#[test]
fn empty_batch_create() {
    let clock = ManualClock::new(1000);
    let mut store = Store::new(Schema::dashboard());
    assert!(store.batch_create(Module::Tasks, Vec::new(), &clock).unwrap().is_empty());
}

// ============================================================================
// Queue Edge Cases
// ============================================================================

#[test]
fn dequeue_from_empty_queue() {
    let clock = ManualClock::new(1000);
    let mut queue = MutationQueue::new();
    assert!(queue.dequeue_next(&clock).is_none());
    assert!(!queue.mark_done(1));
}

#[test]
fn create_then_update_same_record_stay_ordered() {
    let clock = ManualClock::new(1000);
    let mut store = Store::new(Schema::dashboard());
    let mut queue = MutationQueue::new();

    let task = store
        .create(Module::Tasks, fields(json!({"title": "draft"})), &clock)
        .unwrap();
    let create = queue.enqueue(Mutation::create(&task).unwrap(), &clock).unwrap();
    let patch = fields(json!({"title": "final"}));
    let update = queue
        .enqueue(Mutation::update(Module::Tasks, &task.id, &patch).unwrap(), &clock)
        .unwrap();

    assert_eq!(queue.dequeue_next(&clock).unwrap().id, create);
    // The update waits for the create
    assert!(queue.dequeue_next(&clock).is_none());
    queue.mark_done(create);
    assert_eq!(queue.dequeue_next(&clock).unwrap().id, update);
}

#[test]
fn queue_snapshot_survives_reload_with_in_flight_entries() {
    let clock = ManualClock::new(1000);
    let mut queue = MutationQueue::new();
    queue.enqueue(Mutation::delete(Module::Invoices, "i-1"), &clock).unwrap();
    queue.dequeue_next(&clock).unwrap();

    let json = queue.export().to_json().unwrap();
    let mut reloaded = MutationQueue::from_snapshot(QueueSnapshot::from_json(&json).unwrap(), None).unwrap();
    assert_eq!(reloaded.recover_in_flight(), 1);

    let action = reloaded.dequeue_next(&clock).unwrap();
    assert_eq!(action.attempts, 2);
    assert_eq!(action.status, ActionStatus::InFlight);
}

// ============================================================================
// Conflict Edge Cases
// ============================================================================

#[test]
fn conflict_between_empty_records() {
    let mut local = Record::new("7", Module::Tasks, Fields::new(), 0);
    local.updated_at = 0;
    let remote = local.clone();

    let case = ConflictResolver::default().resolve(&local, &remote);
    assert_eq!(case.outcome, Resolution::Remote);
}

#[test]
fn field_merge_with_disjoint_fields() {
    let resolver = ConflictResolver::new(MergeStrategy::FieldMerge);
    let local = Record::new("c", Module::Customers, fields(json!({"email": "a@x"})), 10);
    let remote = Record::new("c", Module::Customers, fields(json!({"name": "Acme"})), 20);

    let case = resolver.resolve(&local, &remote);
    assert_eq!(case.outcome, Resolution::Merged);
    assert_eq!(case.winner().fields.len(), 2);
    assert_eq!(case.winner().updated_at, 20);
}

// ============================================================================
// Snapshot Edge Cases
// ============================================================================

#[test]
fn snapshot_empty_module() {
    let store = Store::new(Schema::dashboard());
    let snapshot = store.export_module(Module::Users);

    let mut restored = Store::new(Schema::dashboard());
    restored.import_module(snapshot).unwrap();
    assert_eq!(restored.count(Module::Users), 0);
}

#[test]
fn garbage_snapshot_is_rejected() {
    assert!(matches!(
        ModuleSnapshot::from_json("not json"),
        Err(Error::InvalidSnapshot(_))
    ));
    assert!(matches!(
        QueueSnapshot::from_json(r#"{"formatVersion": 2, "lastId": 0, "entries": []}"#),
        Err(Error::InvalidSnapshot(_))
    ));
}
