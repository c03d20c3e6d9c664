//! Object lifetime across the host/script boundary

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{const_mutex, Mutex};
use tether_core::{
    share, BridgeError, Engine, EngineOptions, HandleError, HeapOptions, HostType, Isolate, LifetimeState, TypeBuilder,
};

const WAIT: Duration = Duration::from_secs(5);

fn isolated_engine() -> (Arc<Isolate>, Engine) {
    isolated_engine_with(EngineOptions::default())
}

fn isolated_engine_with(options: EngineOptions) -> (Arc<Isolate>, Engine) {
    let isolate = Arc::new(Isolate::new(&HeapOptions::default()));
    let engine = Engine::with_native(isolate.clone(), options).unwrap();
    (isolate, engine)
}

fn settle(engine: &Engine) {
    assert!(engine.coordinator().flush(WAIT), "coordinator did not drain");
}

fn collect(engine: &Engine) {
    engine.collect_garbage().unwrap();
    settle(engine);
}

// ============================================================================
// Host types
// ============================================================================

struct Node {
    value: i32,
}

impl HostType for Node {
    const NAME: &'static str = "Node";

    fn describe(ty: &mut TypeBuilder<Self>) {
        ty.field("value", |n| n.value, |n, v| n.value = v);
    }
}

static TEARDOWN_LOG: Mutex<Vec<String>> = const_mutex(Vec::new());

struct Resource {
    name: String,
}

impl HostType for Resource {
    const NAME: &'static str = "Resource";

    fn describe(ty: &mut TypeBuilder<Self>) {
        ty.field("name", |r| r.name.clone(), |r, v| r.name = v);
        ty.on_teardown(|r| TEARDOWN_LOG.lock().push(format!("resource {}", r.name)));
    }
}

struct File {
    resource: Resource,
}

impl HostType for File {
    const NAME: &'static str = "File";

    fn describe(ty: &mut TypeBuilder<Self>) {
        ty.base::<Resource>(|f| &f.resource, |f| &mut f.resource);
        ty.on_teardown(|f| TEARDOWN_LOG.lock().push(format!("file {}", f.resource.name)));
    }
}

fn teardowns_of(name: &str) -> Vec<String> {
    TEARDOWN_LOG
        .lock()
        .iter()
        .filter(|entry| entry.ends_with(name))
        .cloned()
        .collect()
}

static DISPOSE_TEARDOWNS: AtomicUsize = AtomicUsize::new(0);

struct Session;

impl HostType for Session {
    const NAME: &'static str = "Session";

    fn describe(ty: &mut TypeBuilder<Self>) {
        ty.on_teardown(|_| {
            DISPOSE_TEARDOWNS.fetch_add(1, Ordering::SeqCst);
        });
    }
}

struct Slow;

impl HostType for Slow {
    const NAME: &'static str = "Slow";

    fn describe(ty: &mut TypeBuilder<Self>) {
        ty.on_teardown(|_| thread::sleep(Duration::from_millis(800)));
    }
}

// ============================================================================
// Handles
// ============================================================================

#[test]
fn test_handle_reference_counts() {
    let (isolate, engine) = isolated_engine();
    let handle = engine.create_value("text").unwrap();
    let slot = handle.slot().unwrap();
    assert_eq!(isolate.slot_ref_count(slot), Some(1));

    let copy = handle.clone();
    assert_eq!(isolate.slot_ref_count(slot), Some(2));
    drop(copy);
    assert_eq!(isolate.slot_ref_count(slot), Some(1));
    drop(handle);
    assert_eq!(isolate.slot_ref_count(slot), None);
}

#[test]
fn test_freed_slots_are_reused_with_new_generation() {
    let (isolate, engine) = isolated_engine();
    let first = engine.create_value(1).unwrap();
    let old = first.slot().unwrap();
    drop(first);

    let second = engine.create_value(2).unwrap();
    let new = second.slot().unwrap();
    assert_eq!(new.index(), old.index());
    assert_ne!(new.generation(), old.generation());
    assert_eq!(isolate.slot_ref_count(old), None);
    assert_eq!(second.as_i32().unwrap(), 2);
}

#[test]
fn test_handle_set_moves_reference() {
    let (isolate, engine) = isolated_engine();
    let mut target = engine.create_value(1).unwrap();
    let source = engine.create_value(2).unwrap();
    let old = target.slot().unwrap();

    target.set(&source).unwrap();
    assert_eq!(target, source);
    assert_eq!(isolate.slot_ref_count(old), None);
    assert_eq!(isolate.slot_ref_count(source.slot().unwrap()), Some(2));
}

// ============================================================================
// Script-owned objects
// ============================================================================

#[test]
fn test_bound_object_is_finalized_after_collection() {
    let (isolate, engine) = isolated_engine();
    let handle = engine.bind(Node { value: 1 }).unwrap();
    let object = engine.tracked(&handle).unwrap();
    let (id, slot) = (object.id(), object.slot());

    settle(&engine);
    assert_eq!(object.state(), LifetimeState::Weak);
    assert!(isolate.is_weak(slot));
    assert_eq!(isolate.slot_anchor(slot), Some(id));
    assert!(engine.lookup(id).is_some(), "weak objects stay registered");

    drop(handle);
    collect(&engine);
    assert_eq!(object.state(), LifetimeState::Finalized);
    assert!(engine.lookup(id).is_none());
    assert_eq!(isolate.slot_ref_count(slot), None);
    assert_eq!(engine.stats().tracked_objects, 0);
    assert!(engine.stats().coordinator.finalized >= 1);

    // Freed ids are handed out again
    let next = engine.bind(Node { value: 2 }).unwrap();
    assert_eq!(engine.tracked(&next).unwrap().id(), id);
}

#[test]
fn test_last_handle_drop_leaves_anchored_slot_to_collection() {
    let (isolate, engine) = isolated_engine();
    let handle = engine.bind(Node { value: 1 }).unwrap();
    let object = engine.tracked(&handle).unwrap();
    let slot = object.slot();
    let copy = handle.clone();

    drop(handle);
    drop(copy);
    settle(&engine);
    assert_eq!(object.state(), LifetimeState::Weak);
    assert!(isolate.slot_ref_count(slot).is_some(), "anchored slot outlives its handles");
    assert!(engine.lookup(object.id()).is_some());

    collect(&engine);
    assert_eq!(object.state(), LifetimeState::Finalized);
    assert_eq!(isolate.slot_ref_count(slot), None);
}

#[test]
fn test_reachable_weak_object_survives_collection() {
    let (_isolate, engine) = isolated_engine();
    let global = engine.global().unwrap();
    let handle = engine.bind(Node { value: 5 }).unwrap();
    let object = engine.tracked(&handle).unwrap();
    engine.set_property(&global, "kept", handle.value().unwrap()).unwrap();

    settle(&engine);
    drop(handle);
    collect(&engine);
    assert_eq!(object.state(), LifetimeState::Weak);

    let again = engine.get_property(&global, "kept").unwrap();
    assert_eq!(engine.get_property(&again, "value").unwrap().as_i32().unwrap(), 5);
    assert_eq!(engine.tracked(&again).unwrap().id(), object.id());
}

#[test]
fn test_rebinding_after_finalize_creates_new_object() {
    let (_isolate, engine) = isolated_engine();
    let cell = share(Node { value: 3 });
    let handle = engine.bind_shared(&cell).unwrap();
    let first = engine.tracked(&handle).unwrap();

    settle(&engine);
    drop(handle);
    collect(&engine);
    assert_eq!(first.state(), LifetimeState::Finalized);

    let handle = engine.bind_shared(&cell).unwrap();
    let second = engine.tracked(&handle).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(engine.get_property(&handle, "value").unwrap().as_i32().unwrap(), 3);
}

// ============================================================================
// Host-owned objects
// ============================================================================

#[test]
fn test_host_ref_keeps_object_strong() {
    let (_isolate, engine) = isolated_engine();
    let node = engine.create_object(Node { value: 1 }).unwrap();
    let id = node.id();

    let handle = node.handle().unwrap();
    engine.set_property(&handle, "value", 9).unwrap();
    drop(handle);
    collect(&engine);

    assert_eq!(node.state(), LifetimeState::Strong);
    assert!(engine.lookup(id).is_some());
    assert_eq!(node.read().value, 9);

    let object = node.object().clone();
    drop(node);
    settle(&engine);
    assert_eq!(object.state(), LifetimeState::Weak);

    collect(&engine);
    assert_eq!(object.state(), LifetimeState::Finalized);
    assert!(engine.lookup(id).is_none());
}

#[test]
fn test_wrap_object_resurrects_weak_object() {
    let (isolate, engine) = isolated_engine();
    let handle = engine.bind(Node { value: 4 }).unwrap();
    settle(&engine);
    let object = engine.tracked(&handle).unwrap();
    assert_eq!(object.state(), LifetimeState::Weak);

    let node = engine.wrap_object::<Node>(&handle).unwrap();
    assert_eq!(node.state(), LifetimeState::Strong);
    assert!(!isolate.is_weak(object.slot()));
    assert_eq!(object.host_ref_count(), 1);

    drop(handle);
    collect(&engine);
    assert_eq!(node.state(), LifetimeState::Strong);

    node.write().value = 40;
    let handle = node.handle().unwrap();
    assert_eq!(engine.get_property(&handle, "value").unwrap().as_i32().unwrap(), 40);
}

#[test]
fn test_wrap_object_type_mismatch() {
    let (_isolate, engine) = isolated_engine();
    let handle = engine.bind(Node { value: 4 }).unwrap();
    let err = engine.wrap_object::<Session>(&handle).unwrap_err();
    assert_eq!(
        err,
        BridgeError::TypeMismatch {
            expected: "Session",
            actual: "Node",
        }
    );

    let plain = engine.create_value(3).unwrap();
    assert!(matches!(engine.wrap_object::<Node>(&plain), Err(BridgeError::NotBound(_))));
}

#[test]
fn test_adopt_shares_tracked_object() {
    let (_isolate, engine) = isolated_engine();
    let cell = share(Node { value: 1 });
    let first = engine.adopt(&cell).unwrap();
    let second = engine.adopt(&cell).unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(first.object().host_ref_count(), 2);

    drop(first);
    settle(&engine);
    assert_eq!(second.state(), LifetimeState::Strong);
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn test_teardown_runs_most_derived_first() {
    let (_isolate, engine) = isolated_engine();
    let handle = engine
        .bind(File {
            resource: Resource {
                name: "log.txt".to_string(),
            },
        })
        .unwrap();
    let object = engine.tracked(&handle).unwrap();
    settle(&engine);
    assert!(teardowns_of("log.txt").is_empty());

    drop(handle);
    collect(&engine);
    assert_eq!(object.state(), LifetimeState::Finalized);
    assert_eq!(teardowns_of("log.txt"), vec!["file log.txt", "resource log.txt"]);
}

#[test]
fn test_teardown_not_run_for_strong_objects() {
    let (_isolate, engine) = isolated_engine();
    let resource = engine
        .create_object(Resource {
            name: "pinned".to_string(),
        })
        .unwrap();
    collect(&engine);
    assert!(teardowns_of("pinned").is_empty());
    assert_eq!(resource.state(), LifetimeState::Strong);
}

// ============================================================================
// Coordinator
// ============================================================================

#[test]
fn test_overflowed_requests_are_processed() {
    let mut options = EngineOptions::default();
    options.coordinator.queue_capacity = 1;
    let (_isolate, engine) = isolated_engine_with(options);

    assert!(engine.coordinator().pause(WAIT));
    let handles: Vec<_> = (0..20).map(|value| engine.bind(Node { value }).unwrap()).collect();
    assert_eq!(engine.stats().coordinator.overflowed, 19);

    engine.coordinator().resume();
    settle(&engine);
    for handle in &handles {
        assert_eq!(engine.tracked(handle).unwrap().state(), LifetimeState::Weak);
    }
    assert_eq!(engine.stats().weak_objects, 20);
}

// ============================================================================
// Dispose
// ============================================================================

#[test]
fn test_dispose_invalidates_everything() {
    let (_isolate, engine) = isolated_engine();
    let handle = engine.bind(Session).unwrap();
    let object = engine.tracked(&handle).unwrap();
    settle(&engine);
    let held = engine.create_object(Session).unwrap();

    engine.dispose();
    assert!(engine.is_disposed());
    assert!(!engine.coordinator().is_running());
    assert_eq!(object.state(), LifetimeState::Finalized);
    assert_eq!(held.state(), LifetimeState::Finalized);
    assert_eq!(DISPOSE_TEARDOWNS.load(Ordering::SeqCst), 0);

    assert_eq!(handle.value().unwrap_err(), HandleError::EngineDisposed);
    assert_eq!(engine.get_property(&handle, "x").unwrap_err(), BridgeError::Disposed);
    assert!(matches!(engine.bind(Session), Err(BridgeError::Disposed)));
    assert!(matches!(held.handle(), Err(BridgeError::Disposed)));

    // Second dispose and late drops are no-ops
    engine.dispose();
    drop(handle);
    drop(held);
}

#[test]
fn test_stuck_teardown_does_not_block_dispose() {
    let mut options = EngineOptions::default();
    options.coordinator.terminate_timeout_ms = 100;
    let (_isolate, engine) = isolated_engine_with(options);

    let handle = engine.bind(Slow).unwrap();
    let object = engine.tracked(&handle).unwrap();
    settle(&engine);
    drop(handle);
    engine.collect_garbage().unwrap();

    let deadline = Instant::now() + WAIT;
    while object.state() != LifetimeState::PendingFinalize {
        assert!(Instant::now() < deadline, "finalize never started");
        thread::sleep(Duration::from_millis(1));
    }

    let started = Instant::now();
    engine.dispose();
    assert!(started.elapsed() < Duration::from_millis(600));
    assert!(engine.is_disposed());
}
