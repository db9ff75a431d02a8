//! The per-process connection to the broker.
//!
//! Two unix streams: a request channel driven as strict RPC under a
//! mutex held across the round trip, and a notification channel drained
//! by a dedicated reader thread that routes wakes and completions to the
//! owning thread's context. Any transport failure is fatal to the
//! connection: everything outstanding fails with `ConnectionLost`, and
//! nothing is retried.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use axon_wire::{
    read_frame, write_frame, Handle, Hello, Notification, Reply, ReplyBody, Request, Result,
    Status, HELLO_NOTIFY, HELLO_REQUEST, TIMEOUT_INFINITE,
};

use crate::thread_io::{Apc, ApcArgs, ApcRoutine, IoResult, ThreadIoContext};

/// Pending-operation slots per registered thread.
const MAX_PENDING_OPS: usize = 256;

struct Rpc {
    stream: UnixStream,
    seq: u64,
}

/// Client-side bookkeeping for one table entry; the broker's table is
/// authoritative.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LocalEntry {
    pub access: u32,
    pub flags: u32,
}

pub(crate) struct Inner {
    rpc: Mutex<Rpc>,
    notify: UnixStream,
    pid: u64,
    token: u64,
    pub(crate) threads: Mutex<HashMap<u64, Arc<ThreadIoContext>>>,
    pub(crate) handles: Mutex<HashMap<u32, LocalEntry>>,
    next_thread: AtomicU64,
    next_cookie: AtomicU64,
    lost: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Unblocks the notification reader and tells the broker this
        // process is gone.
        let _ = self.notify.shutdown(std::net::Shutdown::Both);
        if let Ok(rpc) = self.rpc.get_mut() {
            let _ = rpc.stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

impl Inner {
    fn fail(&self) {
        if self.lost.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("connection to broker lost (pid {})", self.pid);
        let threads = self.threads.lock().unwrap();
        for ctx in threads.values() {
            ctx.fail_all_ops();
        }
    }
}

/// A child process record returned by `create_child`: the identity the
/// child presents in `connect_child`, plus a process handle the creator
/// can wait on or duplicate into.
#[derive(Clone, Copy, Debug)]
pub struct ChildSpec {
    pub pid: u64,
    pub token: u64,
    pub handle: Handle,
}

/// A process's connection to the broker. `Clone` shares the underlying
/// channel; the connection dies with the last clone.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<Inner>,
}

impl Connection {
    /// Connect as a fresh process.
    pub fn connect(path: impl AsRef<Path>) -> Result<Connection> {
        Self::connect_as(path, 0, 0)
    }

    /// Attach to a record pre-created by the parent's `create_child`.
    /// The inherited handle table is already populated when this returns.
    pub fn connect_child(path: impl AsRef<Path>, pid: u64, token: u64) -> Result<Connection> {
        Self::connect_as(path, pid, token)
    }

    fn connect_as(path: impl AsRef<Path>, pid: u64, token: u64) -> Result<Connection> {
        let path = path.as_ref();
        let mut rpc_stream = handshake(path, HELLO_REQUEST, pid, token)?;

        let frame = read_frame(&mut rpc_stream).map_err(|_| Status::ConnectionLost)?;
        let reply = Reply::decode(&frame, 0)?;
        reply.status.check()?;
        let ReplyBody::Session { pid, token } = reply.body else {
            return Err(Status::ProtocolError);
        };

        let mut notify_stream = handshake(path, HELLO_NOTIFY, pid, token)?;
        let frame = read_frame(&mut notify_stream).map_err(|_| Status::ConnectionLost)?;
        Reply::decode(&frame, 0)?.status.check()?;

        let reader_stream = notify_stream
            .try_clone()
            .map_err(|_| Status::ConnectionLost)?;

        let inner = Arc::new(Inner {
            rpc: Mutex::new(Rpc {
                stream: rpc_stream,
                seq: 0,
            }),
            notify: notify_stream,
            pid,
            token,
            threads: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            next_thread: AtomicU64::new(1),
            next_cookie: AtomicU64::new(1),
            lost: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        std::thread::Builder::new()
            .name("axon-client:notify".to_owned())
            .spawn(move || notify_loop(reader_stream, weak))
            .map_err(|_| Status::OutOfResources)?;

        Ok(Connection { inner })
    }

    pub fn pid(&self) -> u64 {
        self.inner.pid
    }

    pub fn token(&self) -> u64 {
        self.inner.token
    }

    pub fn is_lost(&self) -> bool {
        self.inner.lost.load(Ordering::Acquire)
    }

    /// Register the calling thread (or any logical thread) for waits,
    /// async I/O and APC delivery. The returned context is passed by
    /// reference into every such call.
    pub fn register_thread(&self) -> Arc<ThreadIoContext> {
        let id = self.inner.next_thread.fetch_add(1, Ordering::Relaxed);
        let ctx = ThreadIoContext::new(id, MAX_PENDING_OPS);
        self.inner.threads.lock().unwrap().insert(id, ctx.clone());
        ctx
    }

    /// Remove a thread's context. Pending state is dropped; the thread
    /// must have no in-flight operations.
    pub fn deregister_thread(&self, ctx: &ThreadIoContext) {
        self.inner.threads.lock().unwrap().remove(&ctx.id());
    }

    pub(crate) fn next_cookie(&self) -> u64 {
        self.inner.next_cookie.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn find_thread(&self, id: u64) -> Option<Arc<ThreadIoContext>> {
        self.inner.threads.lock().unwrap().get(&id).cloned()
    }

    /// One synchronous round trip. Concurrent callers from other threads
    /// queue on the channel mutex; replies can never be misattributed.
    pub(crate) fn call(&self, req: Request) -> Result<Reply> {
        if self.is_lost() {
            return Err(Status::ConnectionLost);
        }

        let cmd = req.cmd();
        let mut rpc = self.inner.rpc.lock().unwrap();
        let seq = rpc.seq;
        rpc.seq += 1;

        if write_frame(&mut rpc.stream, &req.encode(seq)).is_err() {
            drop(rpc);
            return Err(self.fail());
        }
        let frame = match read_frame(&mut rpc.stream) {
            Ok(frame) => frame,
            Err(_) => {
                drop(rpc);
                return Err(self.fail());
            }
        };
        drop(rpc);

        let reply = match Reply::decode(&frame, cmd) {
            Ok(reply) => reply,
            Err(_) => return Err(self.fail()),
        };
        if reply.seq != seq {
            log::error!("reply out of sequence: got {}, want {seq}", reply.seq);
            return Err(self.fail());
        }
        Ok(reply)
    }

    /// `call`, demanding `Status::Ok`.
    pub(crate) fn call_ok(&self, req: Request) -> Result<ReplyBody> {
        let reply = self.call(req)?;
        reply.status.check()?;
        Ok(reply.body)
    }

    fn fail(&self) -> Status {
        self.inner.fail();
        Status::ConnectionLost
    }

    /// Queue a user APC to a registered thread. The routine never runs
    /// here, even when the target is the calling thread; it runs the next
    /// time the target reaches an alertable point.
    pub fn queue_apc(&self, thread: u64, routine: ApcRoutine, args: ApcArgs) -> Result<()> {
        let ctx = self.find_thread(thread).ok_or(Status::NotFound)?;
        ctx.push_apc(Apc::User { routine, args });
        Ok(())
    }

    /// Block until the handle is signaled, the timeout elapses, or —
    /// when `alertable` — queued APCs interrupt the wait.
    ///
    /// `Ok(Status::Ok)` signaled, `Ok(Status::Abandoned)` a mutex granted
    /// after its owner died, `Ok(Status::Timeout)`, or
    /// `Ok(Status::Interrupted)` after draining APCs.
    pub fn wait(
        &self,
        ctx: &ThreadIoContext,
        handle: Handle,
        timeout: Option<Duration>,
        alertable: bool,
    ) -> Result<Status> {
        if alertable && ctx.has_apcs() {
            ctx.drain_apcs();
            return Ok(Status::Interrupted);
        }

        let timeout_ms = match timeout {
            None => TIMEOUT_INFINITE,
            Some(d) if d.is_zero() => 0,
            Some(d) => (d.as_millis().clamp(1, (TIMEOUT_INFINITE - 1) as u128)) as u32,
        };
        let cookie = self.next_cookie();
        let reply = self.call(Request::Wait {
            handle,
            timeout_ms,
            cookie,
            thread: ctx.id(),
        })?;

        match reply.status {
            Status::Ok | Status::Abandoned | Status::Timeout => Ok(reply.status),
            Status::Pending => self.block_on_cookie(ctx, cookie, timeout, alertable),
            other => Err(other),
        }
    }

    /// Park the thread. With `alertable`, returns `Interrupted` as soon
    /// as APCs are (or become) queued, after running them.
    pub fn sleep(
        &self,
        ctx: &ThreadIoContext,
        timeout: Option<Duration>,
        alertable: bool,
    ) -> Status {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut state = ctx.lock_state();
        loop {
            if alertable && state.has_apcs() {
                drop(state);
                ctx.drain_apcs();
                return Status::Interrupted;
            }
            if self.is_lost() {
                return Status::ConnectionLost;
            }
            match deadline {
                None => state = ctx.cv().wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Status::Timeout;
                    }
                    state = ctx.cv().wait_timeout(state, deadline - now).unwrap().0;
                }
            }
        }
    }

    /// A broker-registered wait went pending; block on the thread
    /// context until its wake note arrives, the deadline passes, or APCs
    /// interrupt it. Cancellation races are settled by the broker: if
    /// `CancelWait` reports the waiter already gone, a wake is in flight
    /// and its status wins.
    fn block_on_cookie(
        &self,
        ctx: &ThreadIoContext,
        cookie: u64,
        timeout: Option<Duration>,
        alertable: bool,
    ) -> Result<Status> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut state = ctx.lock_state();
        loop {
            if let Some(status) = state.wake_for(cookie) {
                return Ok(status);
            }
            if self.is_lost() {
                return Err(Status::ConnectionLost);
            }
            if alertable && state.has_apcs() {
                drop(state);
                return match self.call(Request::CancelWait { cookie }) {
                    Ok(reply) => match reply.status {
                        Status::Ok => {
                            ctx.drain_apcs();
                            Ok(Status::Interrupted)
                        }
                        // Wake in flight: the wait was satisfied first, so
                        // its status stands; the APCs wait for the next
                        // alertable point.
                        Status::NotFound => self.consume_wake(ctx, cookie),
                        other => Err(other),
                    },
                    Err(err) => Err(err),
                };
            }
            match deadline {
                None => state = ctx.cv().wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        drop(state);
                        return match self.call(Request::CancelWait { cookie }) {
                            Ok(reply) => match reply.status {
                                Status::Ok => Ok(Status::Timeout),
                                Status::NotFound => self.consume_wake(ctx, cookie),
                                other => Err(other),
                            },
                            Err(err) => Err(err),
                        };
                    }
                    state = ctx.cv().wait_timeout(state, deadline - now).unwrap().0;
                }
            }
        }
    }

    fn consume_wake(&self, ctx: &ThreadIoContext, cookie: u64) -> Result<Status> {
        let mut state = ctx.lock_state();
        loop {
            if let Some(status) = state.wake_for(cookie) {
                return Ok(status);
            }
            if self.is_lost() {
                return Err(Status::ConnectionLost);
            }
            state = ctx.cv().wait(state).unwrap();
        }
    }
}

fn handshake(path: &Path, kind: u16, pid: u64, token: u64) -> Result<UnixStream> {
    let mut stream = UnixStream::connect(path).map_err(|_| Status::ConnectionLost)?;
    let hello = Hello { kind, pid, token };
    write_frame(&mut stream, &hello.encode()).map_err(|_| Status::ConnectionLost)?;
    Ok(stream)
}

fn notify_loop(mut stream: UnixStream, inner: Weak<Inner>) {
    loop {
        let frame = match read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(_) => break,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let note = match Notification::decode(&frame) {
            Ok(note) => note,
            Err(_) => break,
        };
        match note {
            Notification::Wake {
                thread,
                cookie,
                status,
            } => match inner.threads.lock().unwrap().get(&thread).cloned() {
                Some(ctx) => ctx.push_wake(cookie, status),
                None => log::debug!("wake for unregistered thread {thread}"),
            },
            Notification::IoComplete {
                thread,
                op,
                status,
                transferred,
                data,
            } => match inner.threads.lock().unwrap().get(&thread).cloned() {
                Some(ctx) => {
                    ctx.finish_op(
                        op,
                        IoResult {
                            status,
                            transferred: transferred as usize,
                            data,
                        },
                    );
                }
                None => log::debug!("completion for unregistered thread {thread}"),
            },
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.fail();
    }
}
