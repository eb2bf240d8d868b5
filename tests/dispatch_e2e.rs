use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use engine_gate::{
    DurableStore, EngineGate, EngineHandle, GateConfig, GateError, GateResult, LockCoordinator, MemoryEngineFactory,
    NativeValue, ProcessLockCoordinator, TransactionEnvelope, TransactionError, DEFAULT_LOCK_NAME,
};

const WAIT: Duration = Duration::from_secs(10);

fn gate_with(coordinator: &ProcessLockCoordinator) -> EngineGate {
    EngineGate::builder(Arc::new(MemoryEngineFactory::new(DurableStore::new())))
        .coordinator(Arc::new(coordinator.clone()))
        .build()
        .unwrap()
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn units_run_in_admission_order_under_concurrent_enqueue() {
    let gate = Arc::new(gate_with(&ProcessLockCoordinator::new()));
    let executed = Arc::new(Mutex::new(Vec::new()));

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let gate = Arc::clone(&gate);
            let executed = Arc::clone(&executed);
            thread::spawn(move || {
                (0..25)
                    .map(|_| {
                        let executed = Arc::clone(&executed);
                        let (tx, rx) = std::sync::mpsc::channel::<u64>();
                        let ticket = gate.enqueue(
                            move |_, _| {
                                let sequence = rx.recv().map_err(|_| GateError::operation("no sequence"))?;
                                executed.lock().unwrap().push(sequence);
                                Ok(())
                            },
                            Vec::new(),
                        );
                        tx.send(ticket.sequence()).unwrap();
                        ticket
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for producer in producers {
        for ticket in producer.join().unwrap() {
            ticket.join_timeout(WAIT).unwrap();
        }
    }

    let executed = executed.lock().unwrap().clone();
    assert_eq!(executed.len(), 100);
    let mut sorted = executed.clone();
    sorted.sort_unstable();
    assert_eq!(executed, sorted);
}

#[test]
fn unit_executions_never_overlap() {
    let gate = gate_with(&ProcessLockCoordinator::new());
    let inside = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let tickets: Vec<_> = (0..20)
        .map(|_| {
            let inside = Arc::clone(&inside);
            let overlaps = Arc::clone(&overlaps);
            gate.enqueue(
                move |_, _| {
                    if inside.swap(true, Ordering::SeqCst) {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(1));
                    inside.store(false, Ordering::SeqCst);
                    Ok(())
                },
                Vec::new(),
            )
        })
        .collect();

    for ticket in tickets {
        ticket.join_timeout(WAIT).unwrap();
    }
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[test]
fn gates_sharing_a_coordinator_never_overlap() {
    let coordinator = ProcessLockCoordinator::new();
    let gates = [gate_with(&coordinator), gate_with(&coordinator)];
    let inside = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let mut tickets = Vec::new();
    for round in 0..10 {
        for gate in &gates {
            let inside = Arc::clone(&inside);
            let overlaps = Arc::clone(&overlaps);
            tickets.push(gate.enqueue(
                move |_, _| {
                    if inside.swap(true, Ordering::SeqCst) {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(1));
                    inside.store(false, Ordering::SeqCst);
                    Ok(round)
                },
                Vec::new(),
            ));
        }
    }

    for ticket in tickets {
        ticket.join_timeout(WAIT).unwrap();
    }
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[test]
fn failing_unit_does_not_affect_the_next() {
    let gate = gate_with(&ProcessLockCoordinator::new());

    let a = gate.enqueue(|_, _| -> GateResult<i64> { Err(GateError::operation("unit A failed")) }, Vec::new());
    let b = gate.enqueue(|_, args| Ok(args[0].as_int().unwrap_or_default()), vec![NativeValue::Int(42)]);

    let err = a.join_timeout(WAIT).unwrap_err();
    assert!(err.to_string().contains("unit A failed"));
    assert_eq!(b.join_timeout(WAIT).unwrap(), 42);
}

#[test]
fn panicking_unit_is_contained() {
    let gate = gate_with(&ProcessLockCoordinator::new());

    let a = gate.enqueue(|_, _| -> GateResult<()> { panic!("engine trapped") }, Vec::new());
    let b = gate.enqueue(|_, _| Ok("still running"), Vec::new());

    assert!(a.join_timeout(WAIT).unwrap_err().is_execution());
    assert_eq!(b.join_timeout(WAIT).unwrap(), "still running");
    assert_eq!(gate.stats().units_failed, 1);
}

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<String>>,
}

impl EventLog {
    fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    fn snapshot(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl TransactionEnvelope for EventLog {
    fn begin(&self, _engine: &EngineHandle) -> GateResult<()> {
        self.push("begin");
        Ok(())
    }

    fn commit(&self, _engine: &EngineHandle) -> GateResult<()> {
        self.push("commit");
        Ok(())
    }
}

#[test]
fn auto_transaction_wraps_the_batch() {
    let coordinator = ProcessLockCoordinator::new();
    let log = Arc::new(EventLog::default());
    let mut config = GateConfig::default();
    config.auto_transaction = true;
    let gate = EngineGate::builder(Arc::new(MemoryEngineFactory::new(DurableStore::new())))
        .config(config)
        .coordinator(Arc::new(coordinator.clone()))
        .transaction(Arc::clone(&log) as Arc<dyn TransactionEnvelope>)
        .build()
        .unwrap();

    // Queue all three while the lock is held elsewhere so they form one batch.
    let guard = coordinator.acquire(DEFAULT_LOCK_NAME).unwrap();
    let tickets: Vec<_> = (0..3)
        .map(|i| {
            let log = Arc::clone(&log);
            gate.enqueue(
                move |_, _| {
                    log.push(format!("unit:{i}"));
                    Ok(())
                },
                Vec::new(),
            )
        })
        .collect();
    drop(guard);

    for ticket in tickets {
        ticket.join_timeout(WAIT).unwrap();
    }
    wait_until(|| gate.stats().drains >= 1);

    assert_eq!(log.snapshot(), vec!["begin", "unit:0", "unit:1", "unit:2", "commit"]);
}

/// Rejects the first commit, then behaves.
#[derive(Default)]
struct FlakyCommit {
    commits: AtomicUsize,
}

impl TransactionEnvelope for FlakyCommit {
    fn begin(&self, _engine: &EngineHandle) -> GateResult<()> {
        Ok(())
    }

    fn commit(&self, _engine: &EngineHandle) -> GateResult<()> {
        if self.commits.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(TransactionError::Commit {
                message: "journal is read-only".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[test]
fn commit_failure_keeps_unit_results() {
    let coordinator = ProcessLockCoordinator::new();
    let envelope = Arc::new(FlakyCommit::default());
    let mut config = GateConfig::default();
    config.auto_transaction = true;
    let gate = EngineGate::builder(Arc::new(MemoryEngineFactory::new(DurableStore::new())))
        .config(config)
        .coordinator(Arc::new(coordinator.clone()))
        .transaction(Arc::clone(&envelope) as Arc<dyn TransactionEnvelope>)
        .build()
        .unwrap();

    let guard = coordinator.acquire(DEFAULT_LOCK_NAME).unwrap();
    let tickets: Vec<_> = (0..3i64).map(|i| gate.enqueue(move |_, _| Ok(i), Vec::new())).collect();
    drop(guard);

    let values: Vec<i64> = tickets.into_iter().map(|t| t.join_timeout(WAIT).unwrap()).collect();
    assert_eq!(values, vec![0, 1, 2]);
    wait_until(|| gate.stats().drain_failures == 1);
    assert!(gate.last_drain_failure().unwrap().contains("journal is read-only"));
    assert_eq!(gate.stats().drains, 0);

    assert_eq!(gate.enqueue(|_, _| Ok(3), Vec::new()).join_timeout(WAIT).unwrap(), 3);
    wait_until(|| gate.stats().drains == 1);
    assert_eq!(gate.stats().drain_failures, 1);
    assert_eq!(envelope.commits.load(Ordering::SeqCst), 2);
}

#[test]
fn manual_mode_never_calls_the_envelope() {
    let log = Arc::new(EventLog::default());
    let gate = EngineGate::builder(Arc::new(MemoryEngineFactory::new(DurableStore::new())))
        .coordinator(Arc::new(ProcessLockCoordinator::new()))
        .transaction(Arc::clone(&log) as Arc<dyn TransactionEnvelope>)
        .build()
        .unwrap();

    gate.enqueue(|_, _| Ok(()), Vec::new()).join_timeout(WAIT).unwrap();
    wait_until(|| gate.stats().drains >= 1);
    assert!(log.snapshot().is_empty());
}

#[test]
fn drain_releases_lock_after_linger() {
    let coordinator = ProcessLockCoordinator::new();
    let gate = gate_with(&coordinator);

    gate.enqueue(|_, _| Ok(()), Vec::new()).join_timeout(WAIT).unwrap();
    wait_until(|| gate.stats().drains >= 1);
    // `drains` is counted just before the guard drops.
    thread::sleep(Duration::from_millis(20));

    let guard = coordinator.try_acquire(DEFAULT_LOCK_NAME).unwrap();
    assert!(guard.is_some());
    assert!(!gate.stats().draining);
}

#[test]
fn late_unit_joins_running_drain() {
    let gate = gate_with(&ProcessLockCoordinator::new());

    let (started_tx, started_rx) = std::sync::mpsc::channel();
    let first = gate.enqueue(
        move |_, _| {
            started_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(5));
            Ok(1)
        },
        Vec::new(),
    );
    started_rx.recv_timeout(WAIT).unwrap();
    let second = gate.enqueue(|_, _| Ok(2), Vec::new());

    assert_eq!(first.join_timeout(WAIT).unwrap(), 1);
    assert_eq!(second.join_timeout(WAIT).unwrap(), 2);
    wait_until(|| !gate.stats().draining);
    assert_eq!(gate.stats().drains, 1);
}
