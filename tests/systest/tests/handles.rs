//! Handle table and duplication semantics: reference-count round trips,
//! close-source duplication, access masks, per-handle flags, and
//! handle inheritance into child processes.

use axon_client::{
    Connection, Handle, Status, ACCESS_ALL, ACCESS_SYNCHRONIZE, DUP_CLOSE_SOURCE, DUP_SAME_ACCESS,
    HANDLE_FLAG_INHERIT, HANDLE_FLAG_PROTECT_FROM_CLOSE,
};
use systest::start_broker;

#[test]
fn dup_then_close_leaves_refcount_unchanged() {
    let broker = start_broker();
    let conn = broker.connect();

    let event = conn.create_event(ACCESS_ALL, false, false).unwrap();
    let before = conn.query_object(event).unwrap().refcount;
    assert_eq!(before, 1);

    let dup = conn.duplicate(event, 0, false, DUP_SAME_ACCESS).unwrap();
    assert_ne!(dup, event);
    assert_eq!(conn.query_object(event).unwrap().refcount, before + 1);

    conn.close(dup).unwrap();
    assert_eq!(conn.query_object(event).unwrap().refcount, before);
}

#[test]
fn closing_an_unknown_handle_is_reported() {
    let broker = start_broker();
    let conn = broker.connect();

    assert_eq!(conn.close(Handle::from_u32(4242)), Err(Status::InvalidHandle));

    let event = conn.create_event(ACCESS_ALL, false, false).unwrap();
    conn.close(event).unwrap();
    // The broker acknowledged the close; the value no longer names
    // anything.
    assert_eq!(conn.close(event), Err(Status::InvalidHandle));
}

#[test]
fn dup_close_source_invalidates_the_source_only() {
    let broker = start_broker();
    let conn = broker.connect();

    let event = conn.create_event(ACCESS_ALL, false, false).unwrap();
    let dup = conn
        .duplicate(event, 0, false, DUP_SAME_ACCESS | DUP_CLOSE_SOURCE)
        .unwrap();

    assert_eq!(conn.close(event), Err(Status::InvalidHandle));
    conn.set_event(dup).unwrap();
    assert!(conn.query_object(dup).unwrap().signaled);
    assert_eq!(conn.query_object(dup).unwrap().refcount, 1);
}

#[test]
fn duplicating_a_closed_handle_fails() {
    let broker = start_broker();
    let conn = broker.connect();

    let event = conn.create_event(ACCESS_ALL, false, false).unwrap();
    let keep = conn.duplicate(event, 0, false, DUP_SAME_ACCESS).unwrap();
    conn.close(event).unwrap();

    assert_eq!(
        conn.duplicate(event, 0, false, DUP_SAME_ACCESS),
        Err(Status::InvalidHandle)
    );
    // The object itself is alive through the other handle.
    assert_eq!(conn.query_object(keep).unwrap().refcount, 1);
}

#[test]
fn operations_beyond_the_granted_mask_are_denied() {
    let broker = start_broker();
    let conn = broker.connect();
    let ctx = conn.register_thread();

    let event = conn.create_event(ACCESS_ALL, false, false).unwrap();
    let weak = conn.duplicate(event, ACCESS_SYNCHRONIZE, false, 0).unwrap();

    assert_eq!(conn.set_event(weak), Err(Status::AccessDenied));
    assert_eq!(conn.query_object(weak), Err(Status::AccessDenied));
    // The granted bit still works.
    assert_eq!(
        conn.wait(&ctx, weak, Some(std::time::Duration::ZERO), false),
        Ok(Status::Timeout)
    );
}

#[test]
fn protect_from_close_blocks_close_until_cleared() {
    let broker = start_broker();
    let conn = broker.connect();

    let event = conn.create_event(ACCESS_ALL, false, false).unwrap();
    conn.set_handle_info(
        event,
        HANDLE_FLAG_PROTECT_FROM_CLOSE,
        HANDLE_FLAG_PROTECT_FROM_CLOSE,
    )
    .unwrap();

    assert_eq!(conn.close(event), Err(Status::InvalidArgument));
    let (_, flags) = conn.get_handle_info(event).unwrap();
    assert_ne!(flags & HANDLE_FLAG_PROTECT_FROM_CLOSE, 0);

    conn.set_handle_info(event, HANDLE_FLAG_PROTECT_FROM_CLOSE, 0)
        .unwrap();
    conn.close(event).unwrap();
}

#[test]
fn handle_flags_do_not_touch_the_refcount() {
    let broker = start_broker();
    let conn = broker.connect();

    let event = conn.create_event(ACCESS_ALL, false, false).unwrap();
    let before = conn.query_object(event).unwrap().refcount;

    conn.set_handle_info(event, HANDLE_FLAG_INHERIT, HANDLE_FLAG_INHERIT)
        .unwrap();
    let (access, flags) = conn.get_handle_info(event).unwrap();
    assert_eq!(access, ACCESS_ALL);
    assert_eq!(flags, HANDLE_FLAG_INHERIT);
    assert_eq!(conn.query_object(event).unwrap().refcount, before);
}

#[test]
fn inheritance_duplicates_marked_handles_preserving_values() {
    let broker = start_broker();
    let parent = broker.connect();

    let inherited = parent.create_event(ACCESS_ALL, true, false).unwrap();
    parent
        .set_handle_info(inherited, HANDLE_FLAG_INHERIT, HANDLE_FLAG_INHERIT)
        .unwrap();
    let private = parent.create_event(ACCESS_ALL, true, false).unwrap();

    let spec = parent.create_child(true).unwrap();
    let child = Connection::connect_child(&broker.path, spec.pid, spec.token).unwrap();

    // The child addresses the inherited handle by the parent's value.
    child.adopt(inherited).unwrap();
    child.set_event(inherited).unwrap();
    assert!(parent.query_object(inherited).unwrap().signaled);
    assert_eq!(parent.query_object(inherited).unwrap().refcount, 2);

    // The unmarked handle did not cross.
    assert_eq!(child.adopt(private), Err(Status::InvalidHandle));
}

#[test]
fn concurrent_duplications_into_two_processes_bump_by_exactly_two() {
    let broker = start_broker();
    let conn = broker.connect();

    let event = conn.create_event(ACCESS_ALL, false, false).unwrap();
    let before = conn.query_object(event).unwrap().refcount;

    let spec_a = conn.create_child(false).unwrap();
    let spec_b = conn.create_child(false).unwrap();

    let t1 = {
        let conn = conn.clone();
        std::thread::spawn(move || {
            conn.duplicate_to(Handle::SELF, event, spec_a.handle, 0, false, DUP_SAME_ACCESS)
                .unwrap()
        })
    };
    let t2 = {
        let conn = conn.clone();
        std::thread::spawn(move || {
            conn.duplicate_to(Handle::SELF, event, spec_b.handle, 0, false, DUP_SAME_ACCESS)
                .unwrap()
        })
    };
    t1.join().unwrap();
    t2.join().unwrap();

    assert_eq!(conn.query_object(event).unwrap().refcount, before + 2);
}

#[test]
fn a_fresh_duplicate_observes_current_object_state() {
    let broker = start_broker();
    let conn = broker.connect();
    let ctx = conn.register_thread();

    let event = conn.create_event(ACCESS_ALL, true, false).unwrap();
    conn.set_event(event).unwrap();

    // The new handle sees the state as of the duplication reply.
    let dup = conn.duplicate(event, 0, false, DUP_SAME_ACCESS).unwrap();
    assert_eq!(
        conn.wait(&ctx, dup, Some(std::time::Duration::ZERO), false),
        Ok(Status::Ok)
    );
}
