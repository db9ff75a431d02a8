//! Waits, signal semantics, APC delivery, and connection-loss behavior.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axon_client::{Connection, Status, ACCESS_ALL};
use systest::start_broker;

#[test]
fn zero_timeout_alertable_wait_on_unsignaled_event_times_out() {
    let broker = start_broker();
    let conn = broker.connect();
    let ctx = conn.register_thread();

    let event = conn.create_event(ACCESS_ALL, false, false).unwrap();
    let status = conn
        .wait(&ctx, event, Some(Duration::ZERO), true)
        .unwrap();

    assert_eq!(status, Status::Timeout);
    assert!(!conn.query_object(event).unwrap().signaled);
    assert_eq!(ctx.queued_apcs(), 0);
}

#[test]
fn set_event_wakes_a_blocked_waiter_and_auto_resets() {
    let broker = start_broker();
    let conn = broker.connect();

    let event = conn.create_event(ACCESS_ALL, false, false).unwrap();
    let waiter = {
        let conn = conn.clone();
        std::thread::spawn(move || {
            let ctx = conn.register_thread();
            conn.wait(&ctx, event, None, false).unwrap()
        })
    };

    std::thread::sleep(Duration::from_millis(50));
    conn.set_event(event).unwrap();
    assert_eq!(waiter.join().unwrap(), Status::Ok);
    // Auto-reset: the wake consumed the signal.
    assert!(!conn.query_object(event).unwrap().signaled);
}

#[test]
fn manual_reset_event_wakes_every_waiter() {
    let broker = start_broker();
    let conn = broker.connect();

    let event = conn.create_event(ACCESS_ALL, true, false).unwrap();
    let spawn_waiter = || {
        let conn = conn.clone();
        std::thread::spawn(move || {
            let ctx = conn.register_thread();
            conn.wait(&ctx, event, None, false).unwrap()
        })
    };
    let a = spawn_waiter();
    let b = spawn_waiter();

    std::thread::sleep(Duration::from_millis(50));
    conn.set_event(event).unwrap();
    assert_eq!(a.join().unwrap(), Status::Ok);
    assert_eq!(b.join().unwrap(), Status::Ok);
    assert!(conn.query_object(event).unwrap().signaled);
}

#[test]
fn an_expired_wait_reports_timeout_and_mutates_nothing() {
    let broker = start_broker();
    let conn = broker.connect();
    let ctx = conn.register_thread();

    let event = conn.create_event(ACCESS_ALL, false, false).unwrap();
    let start = Instant::now();
    let status = conn
        .wait(&ctx, event, Some(Duration::from_millis(60)), false)
        .unwrap();

    assert_eq!(status, Status::Timeout);
    assert!(start.elapsed() >= Duration::from_millis(60));
    assert!(!conn.query_object(event).unwrap().signaled);
}

#[test]
fn mutex_recursion_and_foreign_release() {
    let broker = start_broker();
    let conn = broker.connect();
    let ctx = conn.register_thread();

    let mutex = conn.create_mutex(&ctx, ACCESS_ALL, true).unwrap();
    // Recursive acquisition by the owner succeeds immediately.
    assert_eq!(conn.wait(&ctx, mutex, Some(Duration::ZERO), false), Ok(Status::Ok));

    let other = {
        let conn = conn.clone();
        std::thread::spawn(move || {
            let ctx = conn.register_thread();
            conn.release_mutex(&ctx, mutex)
        })
    };
    assert_eq!(other.join().unwrap(), Err(Status::NotOwner));

    // Two releases to drop the recursion count to zero.
    conn.release_mutex(&ctx, mutex).unwrap();
    assert!(!conn.query_object(mutex).unwrap().signaled);
    conn.release_mutex(&ctx, mutex).unwrap();
    assert!(conn.query_object(mutex).unwrap().signaled);
}

#[test]
fn a_mutex_held_by_a_dead_process_is_granted_abandoned() {
    let broker = start_broker();
    let parent = broker.connect();
    let ctx = parent.register_thread();

    let mutex = parent.create_mutex(&ctx, ACCESS_ALL, false).unwrap();
    let spec = parent.create_child(false).unwrap();
    parent
        .duplicate_to(
            axon_client::Handle::SELF,
            mutex,
            spec.handle,
            0,
            false,
            axon_client::DUP_SAME_ACCESS | axon_client::DUP_SAME_VALUE,
        )
        .unwrap();

    {
        let child = Connection::connect_child(&broker.path, spec.pid, spec.token).unwrap();
        let child_ctx = child.register_thread();
        child.adopt(mutex).unwrap();
        assert_eq!(
            child.wait(&child_ctx, mutex, Some(Duration::ZERO), false),
            Ok(Status::Ok)
        );
        // The child dies holding the mutex.
    }

    assert_eq!(
        parent.wait(&ctx, mutex, Some(Duration::from_secs(5)), false),
        Ok(Status::Abandoned)
    );
    // Abandonment reports once; ownership is clean afterwards.
    parent.release_mutex(&ctx, mutex).unwrap();
    assert_eq!(
        parent.wait(&ctx, mutex, Some(Duration::ZERO), false),
        Ok(Status::Ok)
    );
}

#[test]
fn semaphore_counts_grants_and_rejects_overflow() {
    let broker = start_broker();
    let conn = broker.connect();
    let ctx = conn.register_thread();

    let sem = conn.create_semaphore(ACCESS_ALL, 2, 2).unwrap();
    assert_eq!(conn.wait(&ctx, sem, Some(Duration::ZERO), false), Ok(Status::Ok));
    assert_eq!(conn.wait(&ctx, sem, Some(Duration::ZERO), false), Ok(Status::Ok));
    assert_eq!(
        conn.wait(&ctx, sem, Some(Duration::ZERO), false),
        Ok(Status::Timeout)
    );

    assert_eq!(conn.release_semaphore(sem, 1), Ok(0));
    assert_eq!(conn.release_semaphore(sem, 2), Err(Status::InvalidArgument));
    assert_eq!(conn.release_semaphore(sem, 1), Ok(1));
}

#[test]
fn released_semaphore_grants_exactly_as_many_waiters() {
    let broker = start_broker();
    let conn = broker.connect();

    let sem = conn.create_semaphore(ACCESS_ALL, 0, 4).unwrap();
    let spawn_waiter = || {
        let conn = conn.clone();
        std::thread::spawn(move || {
            let ctx = conn.register_thread();
            conn.wait(&ctx, sem, Some(Duration::from_millis(400)), false)
                .unwrap()
        })
    };
    let a = spawn_waiter();
    let b = spawn_waiter();
    let c = spawn_waiter();

    std::thread::sleep(Duration::from_millis(50));
    conn.release_semaphore(sem, 2).unwrap();

    let mut results = vec![a.join().unwrap(), b.join().unwrap(), c.join().unwrap()];
    results.sort();
    assert_eq!(results, vec![Status::Ok, Status::Ok, Status::Timeout]);
}

#[test]
fn queued_apcs_run_only_at_alertable_points_on_the_owning_thread() {
    let broker = start_broker();
    let conn = broker.connect();
    let ctx = conn.register_thread();

    let ran = Arc::new(AtomicBool::new(false));
    let ran_on = Arc::new(Mutex::new(None));

    let flag = ran.clone();
    let on = ran_on.clone();
    conn.queue_apc(
        ctx.id(),
        Box::new(move |args| {
            assert_eq!(args, [7, 8, 9]);
            flag.store(true, Ordering::SeqCst);
            *on.lock().unwrap() = Some(std::thread::current().id());
        }),
        [7, 8, 9],
    )
    .unwrap();

    // Queueing never executes, even with target == caller.
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(ctx.queued_apcs(), 1);

    // A non-alertable sleep does not deliver.
    assert_eq!(
        conn.sleep(&ctx, Some(Duration::from_millis(20)), false),
        Status::Timeout
    );
    assert!(!ran.load(Ordering::SeqCst));

    // An alertable one does, on this thread.
    assert_eq!(conn.sleep(&ctx, Some(Duration::from_secs(5)), true), Status::Interrupted);
    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(*ran_on.lock().unwrap(), Some(std::thread::current().id()));
}

#[test]
fn an_apc_interrupts_an_alertable_wait_on_its_thread() {
    let broker = start_broker();
    let conn = broker.connect();

    let event = conn.create_event(ACCESS_ALL, false, false).unwrap();
    let ran_on = Arc::new(Mutex::new(None));

    let (id_tx, id_rx) = std::sync::mpsc::channel();
    let waiter = {
        let conn = conn.clone();
        std::thread::spawn(move || {
            let ctx = conn.register_thread();
            id_tx.send(ctx.id()).unwrap();
            let status = conn.wait(&ctx, event, Some(Duration::from_secs(5)), true);
            (status, std::thread::current().id())
        })
    };

    let target = id_rx.recv().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    let on = ran_on.clone();
    conn.queue_apc(
        target,
        Box::new(move |_| {
            *on.lock().unwrap() = Some(std::thread::current().id());
        }),
        [0; 3],
    )
    .unwrap();

    let (status, waiter_thread) = waiter.join().unwrap();
    assert_eq!(status, Ok(Status::Interrupted));
    assert_eq!(*ran_on.lock().unwrap(), Some(waiter_thread));
    // The event itself was untouched.
    assert!(!conn.query_object(event).unwrap().signaled);
}

#[test]
fn apcs_queued_during_a_drain_wait_for_the_next_alertable_point() {
    let broker = start_broker();
    let conn = broker.connect();
    let ctx = conn.register_thread();

    let second_ran = Arc::new(AtomicUsize::new(0));

    let inner_counter = second_ran.clone();
    let inner_conn = conn.clone();
    let ctx_id = ctx.id();
    conn.queue_apc(
        ctx_id,
        Box::new(move |_| {
            // Queued mid-drain; must not run in this pass.
            let counter = inner_counter.clone();
            inner_conn
                .queue_apc(
                    ctx_id,
                    Box::new(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                    [0; 3],
                )
                .unwrap();
        }),
        [0; 3],
    )
    .unwrap();

    assert_eq!(conn.sleep(&ctx, Some(Duration::from_millis(50)), true), Status::Interrupted);
    assert_eq!(second_ran.load(Ordering::SeqCst), 0);

    assert_eq!(conn.sleep(&ctx, Some(Duration::from_millis(50)), true), Status::Interrupted);
    assert_eq!(second_ran.load(Ordering::SeqCst), 1);
}

#[test]
fn waiting_on_a_child_process_object_reports_its_exit() {
    let broker = start_broker();
    let parent = broker.connect();
    let ctx = parent.register_thread();

    let spec = parent.create_child(false).unwrap();
    assert_eq!(
        parent.wait(&ctx, spec.handle, Some(Duration::ZERO), false),
        Ok(Status::Timeout)
    );

    {
        let child = Connection::connect_child(&broker.path, spec.pid, spec.token).unwrap();
        child.exit_process(42).unwrap();
    }

    assert_eq!(
        parent.wait(&ctx, spec.handle, Some(Duration::from_secs(5)), false),
        Ok(Status::Ok)
    );
    let info = parent.query_object(spec.handle).unwrap();
    assert!(info.signaled);
    assert_eq!(info.extra, 42);
}

#[test]
fn a_lost_connection_fails_outstanding_and_future_requests() {
    let broker = start_broker();
    let conn = broker.connect();

    let event = conn.create_event(ACCESS_ALL, false, false).unwrap();
    let waiter = {
        let conn = conn.clone();
        std::thread::spawn(move || {
            let ctx = conn.register_thread();
            conn.wait(&ctx, event, None, false)
        })
    };
    std::thread::sleep(Duration::from_millis(50));

    broker.handle.shutdown();

    assert_eq!(waiter.join().unwrap(), Err(Status::ConnectionLost));
    assert_eq!(
        conn.create_event(ACCESS_ALL, false, false),
        Err(Status::ConnectionLost)
    );
    assert!(conn.is_lost());
}
