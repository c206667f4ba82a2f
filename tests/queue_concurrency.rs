//! Session start/end notifications under concurrent queue churn.

use std::sync::{Arc, Barrier};
use std::thread;

use gpudbg_session::test_utils::{RecordingRegistrar, RegistrarCall};
use gpudbg_session::CommandQueueLifecycleTracker;
use proptest::prelude::*;

fn assert_alternating(events: &[RegistrarCall]) {
    let mut open: Option<u32> = None;
    for call in events {
        match (call, open) {
            (RegistrarCall::SessionStart(token), None) => open = Some(*token),
            (RegistrarCall::SessionEnd(token), Some(current)) => {
                assert_eq!(*token, current, "end for a session that is not open");
                open = None;
            }
            _ => panic!("notifications out of order: {events:?}"),
        }
    }
    assert_eq!(open, None, "session left open: {events:?}");
}

/// Runs `per_thread[i]` queue lifetimes on thread `i`. A lifetime of `n` creates `n` queues and
/// then destroys them.
fn run(per_thread: &[Vec<u8>], root: bool) -> RecordingRegistrar {
    let registrar = RecordingRegistrar::supported();
    let tracker = Arc::new(CommandQueueLifecycleTracker::new(Arc::new(registrar.clone())));
    let barrier = Arc::new(Barrier::new(per_thread.len()));

    if root {
        tracker.on_queue_created();
    }
    let threads: Vec<_> = per_thread
        .iter()
        .cloned()
        .map(|lifetimes| {
            let tracker = tracker.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for n in lifetimes {
                    for _ in 0..n {
                        tracker.on_queue_created();
                    }
                    for _ in 0..n {
                        tracker.on_queue_destroyed();
                    }
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    if root {
        tracker.on_queue_destroyed();
    }

    assert_eq!(tracker.queue_count(), 0);
    assert_eq!(tracker.session_token(), None);
    registrar
}

#[test]
fn root_queue_pins_a_single_session() {
    let schedule = vec![vec![1, 2, 3, 1]; 8];
    for _ in 0..20 {
        let registrar = run(&schedule, true);
        assert_eq!(registrar.session_starts(), 1);
        assert_eq!(registrar.session_ends(), 1);
        assert_alternating(&registrar.session_events());
    }
}

#[test]
fn unpinned_churn_always_alternates() {
    let schedule = vec![vec![1; 200]; 8];
    for _ in 0..10 {
        let registrar = run(&schedule, false);
        assert!(registrar.session_starts() >= 1);
        assert_eq!(registrar.session_starts(), registrar.session_ends());
        assert_alternating(&registrar.session_events());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn any_schedule_balances(
        per_thread in prop::collection::vec(prop::collection::vec(0u8..4, 0..32), 1..6),
        root in any::<bool>(),
    ) {
        let registrar = run(&per_thread, root);
        let starts = registrar.session_starts();
        prop_assert_eq!(starts, registrar.session_ends());
        if root {
            prop_assert_eq!(starts, 1);
        }
        assert_alternating(&registrar.session_events());
    }
}
