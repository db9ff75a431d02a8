//! Asynchronous pipe I/O: deferred completion, cancellation races,
//! completion-routine APCs, end-of-stream, and backpressure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axon_client::Status;
use systest::start_broker;

#[test]
fn write_then_read_round_trip() {
    let broker = start_broker();
    let conn = broker.connect();
    let ctx = conn.register_thread();

    let (read, write) = conn.create_pipe(0).unwrap();
    assert_eq!(conn.write(&ctx, write, b"hello broker", None).unwrap(), 12);
    assert_eq!(
        conn.read(&ctx, read, 64, None).unwrap(),
        b"hello broker".to_vec()
    );
}

#[test]
fn an_async_read_completes_when_data_arrives() {
    let broker = start_broker();
    let conn = broker.connect();
    let ctx = conn.register_thread();

    let (read, write) = conn.create_pipe(0).unwrap();
    let io = conn.read_async(&ctx, read, 64, None).unwrap();
    assert!(!io.status.is_finished());
    assert_eq!(ctx.pending_ops(), 1);

    conn.write(&ctx, write, b"deferred", None).unwrap();
    assert_eq!(conn.wait_io(&ctx, &io, Some(Duration::from_secs(5)), false), Ok(Status::Ok));

    let res = io.status.result().unwrap();
    assert_eq!(res.status, Status::Ok);
    assert_eq!(res.data, b"deferred".to_vec());
    assert_eq!(res.transferred, 8);
    assert_eq!(ctx.pending_ops(), 0);
}

#[test]
fn cancellation_writes_exactly_one_terminal_status() {
    let broker = start_broker();
    let conn = broker.connect();
    let ctx = conn.register_thread();

    let (read, _write) = conn.create_pipe(0).unwrap();
    let io = conn.read_async(&ctx, read, 64, None).unwrap();

    assert_eq!(conn.cancel_io(&io), Ok(true));
    assert_eq!(conn.wait_io(&ctx, &io, Some(Duration::from_secs(5)), false), Ok(Status::Cancelled));
    assert_eq!(io.status.result().unwrap().status, Status::Cancelled);

    // A second cancel finds nothing; the first result stands.
    assert_eq!(conn.cancel_io(&io), Ok(false));
    assert_eq!(io.status.result().unwrap().status, Status::Cancelled);
}

#[test]
fn closing_the_submitting_handle_cancels_without_a_double_finish() {
    let broker = start_broker();
    let conn = broker.connect();
    let ctx = conn.register_thread();

    let fired = Arc::new(AtomicUsize::new(0));
    let (read, write) = conn.create_pipe(0).unwrap();

    let counter = fired.clone();
    let io = conn
        .read_async(
            &ctx,
            read,
            64,
            Some(Box::new(move |res| {
                assert_eq!(res.status, Status::Cancelled);
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

    conn.close(read).unwrap();
    // The write lands after the cancel; it must not resurrect the op.
    let _ = conn.write(&ctx, write, b"too late", None);

    assert_eq!(conn.wait_io(&ctx, &io, Some(Duration::from_secs(5)), false), Ok(Status::Cancelled));
    assert_eq!(io.status.result().unwrap().status, Status::Cancelled);

    // Drain the completion APC; it fires exactly once.
    assert_eq!(conn.sleep(&ctx, Some(Duration::from_millis(50)), true), Status::Interrupted);
    assert_eq!(conn.sleep(&ctx, Some(Duration::from_millis(50)), true), Status::Timeout);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn completion_routines_run_as_apcs_on_the_owning_thread() {
    let broker = start_broker();
    let conn = broker.connect();

    let (read, write) = conn.create_pipe(0).unwrap();
    let seen = Arc::new(Mutex::new(None));

    let worker = {
        let conn = conn.clone();
        let seen = seen.clone();
        std::thread::spawn(move || {
            let ctx = conn.register_thread();
            let recorded = seen.clone();
            let io = conn
                .read_async(
                    &ctx,
                    read,
                    64,
                    Some(Box::new(move |res| {
                        *recorded.lock().unwrap() =
                            Some((std::thread::current().id(), res.data.clone()));
                    })),
                )
                .unwrap();

            // Alertable wait: the interrupt delivers the completion APC.
            let status = conn.wait_io(&ctx, &io, Some(Duration::from_secs(5)), true);
            assert_eq!(status, Ok(Status::Interrupted));
            assert_eq!(io.status.result().unwrap().status, Status::Ok);
            std::thread::current().id()
        })
    };

    std::thread::sleep(Duration::from_millis(50));
    let ctx = conn.register_thread();
    conn.write(&ctx, write, b"payload", None).unwrap();

    let owner = worker.join().unwrap();
    let (ran_on, data) = seen.lock().unwrap().clone().unwrap();
    assert_eq!(ran_on, owner);
    assert_eq!(data, b"payload".to_vec());
}

#[test]
fn closing_the_last_writer_is_end_of_stream() {
    let broker = start_broker();
    let conn = broker.connect();
    let ctx = conn.register_thread();

    let (read, write) = conn.create_pipe(0).unwrap();
    conn.write(&ctx, write, b"tail", None).unwrap();
    conn.close(write).unwrap();

    assert_eq!(conn.read(&ctx, read, 64, None).unwrap(), b"tail".to_vec());
    // Buffered data gone, no writers left: zero-byte read.
    assert_eq!(conn.read(&ctx, read, 64, None).unwrap(), Vec::<u8>::new());
}

#[test]
fn eof_wakes_an_already_pending_read() {
    let broker = start_broker();
    let conn = broker.connect();
    let ctx = conn.register_thread();

    let (read, write) = conn.create_pipe(0).unwrap();
    let io = conn.read_async(&ctx, read, 64, None).unwrap();

    conn.close(write).unwrap();
    assert_eq!(conn.wait_io(&ctx, &io, Some(Duration::from_secs(5)), false), Ok(Status::Ok));
    assert_eq!(io.status.result().unwrap().transferred, 0);
}

#[test]
fn writing_with_no_readers_is_a_broken_pipe() {
    let broker = start_broker();
    let conn = broker.connect();
    let ctx = conn.register_thread();

    let (read, write) = conn.create_pipe(0).unwrap();
    conn.close(read).unwrap();
    assert_eq!(
        conn.write_async(&ctx, write, b"nobody", None).err(),
        Some(Status::BrokenPipe)
    );
    // The failed submission was rolled back locally.
    assert_eq!(ctx.pending_ops(), 0);
}

#[test]
fn a_large_write_drains_under_backpressure() {
    let broker = start_broker();
    let conn = broker.connect();
    let ctx = conn.register_thread();

    let (read, write) = conn.create_pipe(16).unwrap();
    let payload: Vec<u8> = (0..64_u8).collect();
    let io = conn.write_async(&ctx, write, &payload, None).unwrap();
    assert!(!io.status.is_finished());

    let mut received = Vec::new();
    while received.len() < payload.len() {
        let chunk = conn
            .read(&ctx, read, 16, Some(Duration::from_secs(5)))
            .unwrap();
        assert!(!chunk.is_empty());
        received.extend_from_slice(&chunk);
    }

    assert_eq!(conn.wait_io(&ctx, &io, Some(Duration::from_secs(5)), false), Ok(Status::Ok));
    assert_eq!(io.status.result().unwrap().transferred, 64);
    assert_eq!(received, payload);
}

#[test]
fn racing_cancel_and_completion_resolve_to_one_status() {
    let broker = start_broker();
    let conn = broker.connect();

    for round in 0..32 {
        let ctx = conn.register_thread();
        let (read, write) = conn.create_pipe(0).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let io = conn
            .read_async(
                &ctx,
                read,
                64,
                Some(Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

        let writer = {
            let conn = conn.clone();
            std::thread::spawn(move || {
                let ctx = conn.register_thread();
                let _ = conn.write(&ctx, write, b"race", Some(Duration::from_secs(5)));
                conn.deregister_thread(&ctx);
            })
        };
        if round % 2 == 0 {
            std::thread::yield_now();
        }
        let _ = conn.cancel_io(&io);
        writer.join().unwrap();

        // Whichever side won, there is exactly one terminal status and
        // exactly one completion APC.
        assert_eq!(conn.wait_io(&ctx, &io, Some(Duration::from_secs(5)), false), Ok(io.status.result().unwrap().status));
        let status = io.status.result().unwrap().status;
        assert!(
            status == Status::Ok || status == Status::Cancelled,
            "unexpected terminal status {status:?}"
        );
        while conn.sleep(&ctx, Some(Duration::from_millis(10)), true) == Status::Interrupted {}
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        conn.close(read).unwrap();
        conn.deregister_thread(&ctx);
    }
}

#[test]
fn slot_exhaustion_reports_before_anything_is_sent() {
    let broker = start_broker();
    let conn = broker.connect();
    let ctx = conn.register_thread();

    let (read, _write) = conn.create_pipe(0).unwrap();
    let mut ops = Vec::new();
    loop {
        match conn.read_async(&ctx, read, 16, None) {
            Ok(io) => ops.push(io),
            Err(status) => {
                assert_eq!(status, Status::OutOfResources);
                break;
            }
        }
        assert!(ops.len() <= 4096, "per-thread op cap never engaged");
    }
    // Everything the broker accepted is still exactly-once cancellable.
    conn.close(read).unwrap();
    for io in &ops {
        assert_eq!(conn.wait_io(&ctx, io, Some(Duration::from_secs(5)), false), Ok(Status::Cancelled));
    }
}
