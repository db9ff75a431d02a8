//! The broker runtime: an accept thread performing the handshake, one
//! reader thread per request channel, and a single state thread that
//! owns every object and handle table. All mutation funnels through the
//! state thread's mailbox, so each request is one atomic unit with
//! respect to every other request.

use std::collections::HashMap;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};

use axon_wire::{
    read_frame, write_frame, Handle, Hello, Notification, Reply, ReplyBody, Request, Status,
    ACCESS_ALL, ACCESS_DUP, ACCESS_MODIFY, ACCESS_QUERY, ACCESS_READ, ACCESS_SYNCHRONIZE,
    ACCESS_WRITE, DUP_CLOSE_SOURCE, DUP_SAME_ACCESS, DUP_SAME_VALUE, HANDLE_FLAG_ALL,
    HANDLE_FLAG_INHERIT, HANDLE_FLAG_PROTECT_FROM_CLOSE, HELLO_NOTIFY, HELLO_REQUEST,
    MAX_IO_BYTES,
};

use crate::config::Config;
use crate::objects::{IoDone, IoKind, ObjId, Payload, PendingIo, Pipe, Store, Waiter};
use crate::process::{HandleEntry, Process};

const MAX_PIPE_CAPACITY: usize = 1 << 20;

/// A note to be written to one process's notification channel.
type Note = (u64, Notification);

pub(crate) enum Mail {
    Attach { stream: UnixStream, hello: Hello },
    Request { pid: u64, seq: u64, req: Request },
    Hangup { pid: u64 },
    Shutdown,
}

/// Running broker instance. Dropping (or `shutdown`) stops it and
/// removes the socket.
pub struct BrokerHandle {
    tx: Sender<Mail>,
    path: PathBuf,
    stopped: Arc<AtomicBool>,
    state_join: Option<JoinHandle<()>>,
    accept_join: Option<JoinHandle<()>>,
}

impl BrokerHandle {
    pub fn socket_path(&self) -> &std::path::Path {
        &self.path
    }

    /// Block on the state thread; the broker binary never returns from
    /// this.
    pub fn wait(mut self) {
        if let Some(join) = self.state_join.take() {
            let _ = join.join();
        }
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.tx.send(Mail::Shutdown);
        // Unblock the accept thread.
        let _ = UnixStream::connect(&self.path);
        if let Some(join) = self.state_join.take() {
            let _ = join.join();
        }
        if let Some(join) = self.accept_join.take() {
            let _ = join.join();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        if self.state_join.is_some() {
            self.stop();
        }
    }
}

/// Bind the socket and spawn the broker threads.
pub fn start(config: Config) -> std::io::Result<BrokerHandle> {
    let path = config.socket_path.clone();
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;

    let (tx, rx) = crossbeam::channel::unbounded();
    let stopped = Arc::new(AtomicBool::new(false));

    let accept_tx = tx.clone();
    let accept_stopped = stopped.clone();
    let accept_join = std::thread::Builder::new()
        .name("axon-broker:accept".to_owned())
        .spawn(move || accept_loop(listener, accept_tx, accept_stopped))?;

    let broker = Broker::new(config, tx.clone());
    let state_join = std::thread::Builder::new()
        .name("axon-broker:state".to_owned())
        .spawn(move || broker.run(rx))?;

    Ok(BrokerHandle {
        tx,
        path,
        stopped,
        state_join: Some(state_join),
        accept_join: Some(accept_join),
    })
}

fn accept_loop(listener: UnixListener, tx: Sender<Mail>, stopped: Arc<AtomicBool>) {
    loop {
        let mut stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) => {
                if stopped.load(Ordering::Acquire) {
                    break;
                }
                log::warn!("accept failed: {err}");
                continue;
            }
        };
        if stopped.load(Ordering::Acquire) {
            break;
        }

        // A peer that never sends its hello must not stall the accept
        // loop.
        let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
        let hello = match read_frame(&mut stream) {
            Ok(frame) => match Hello::decode(&frame) {
                Ok(hello) => hello,
                Err(_) => {
                    log::info!("dropping connection: bad hello");
                    continue;
                }
            },
            Err(_) => {
                log::info!("dropping connection: no hello");
                continue;
            }
        };
        if tx.send(Mail::Attach { stream, hello }).is_err() {
            break;
        }
    }
}

fn reader_loop(pid: u64, mut stream: UnixStream, tx: Sender<Mail>) {
    loop {
        let frame = match read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(_) => break,
        };
        match Request::decode(&frame) {
            Ok((seq, req)) => {
                if tx.send(Mail::Request { pid, seq, req }).is_err() {
                    return;
                }
            }
            Err(_) => {
                log::info!("dropping connection {pid}: bad request frame");
                break;
            }
        }
    }
    let _ = tx.send(Mail::Hangup { pid });
}

struct Broker {
    config: Config,
    store: Store,
    processes: HashMap<u64, Process>,
    next_pid: u64,
    tx: Sender<Mail>,
    /// Connections whose channel died mid-write; torn down after the
    /// current message.
    dead: Vec<u64>,
}

impl Broker {
    fn new(config: Config, tx: Sender<Mail>) -> Broker {
        let store = Store::new(config.max_objects);
        Broker {
            config,
            store,
            processes: HashMap::new(),
            next_pid: 2, // pid 1 is the broker itself
            tx,
            dead: Vec::new(),
        }
    }

    fn run(mut self, rx: Receiver<Mail>) {
        log::debug!("broker state thread running");
        loop {
            let Ok(mail) = rx.recv() else { break };
            let mut notes = Vec::new();
            match mail {
                Mail::Attach { stream, hello } => self.handle_attach(stream, hello),
                Mail::Request { pid, seq, req } => {
                    let reply = match self.dispatch(pid, req, &mut notes) {
                        Ok((status, body)) => Reply::new(seq, status, body),
                        Err(status) => Reply::error(seq, status),
                    };
                    self.send_reply(pid, reply);
                }
                Mail::Hangup { pid } => self.drop_connection(pid, &mut notes),
                Mail::Shutdown => break,
            }
            self.flush_notes(notes);
            while let Some(pid) = self.dead.pop() {
                let mut notes = Vec::new();
                self.drop_connection(pid, &mut notes);
                self.flush_notes(notes);
            }
        }

        // Shut the sockets down, not just drop our clones: the reader
        // threads hold their own, and clients must observe the loss
        // instead of hanging on a reply that will never come.
        for proc in self.processes.values_mut() {
            if let Some(stream) = proc.request_tx.take() {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
            if let Some(stream) = proc.notify_tx.take() {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
        }
        log::debug!("broker state thread exiting");
    }

    // ----------------------- connection lifecycle -----------------------

    fn handle_attach(&mut self, mut stream: UnixStream, hello: Hello) {
        let _ = stream.set_read_timeout(None);
        if let Err(status) = self.try_attach(&mut stream, hello) {
            log::info!("rejecting connection: {status}");
            let _ = write_frame(&mut stream, &Reply::error(0, status).encode());
        }
    }

    fn try_attach(&mut self, stream: &mut UnixStream, hello: Hello) -> Result<(), Status> {
        match hello.kind {
            HELLO_REQUEST => {
                let pid = if hello.pid == 0 {
                    let connected = self.processes.values().filter(|p| p.connected).count();
                    if connected >= self.config.max_connections {
                        return Err(Status::OutOfResources);
                    }
                    self.new_process_record()?
                } else {
                    let proc = self
                        .processes
                        .get(&hello.pid)
                        .ok_or(Status::ProtocolError)?;
                    if proc.token != hello.token || proc.attached {
                        return Err(Status::ProtocolError);
                    }
                    hello.pid
                };

                let reader = stream.try_clone().map_err(|_| Status::OutOfResources)?;
                let writer = stream.try_clone().map_err(|_| Status::OutOfResources)?;

                let proc = self.processes.get_mut(&pid).unwrap();
                proc.attached = true;
                proc.connected = true;
                proc.request_tx = Some(writer);
                let token = proc.token;

                let reply = Reply::new(0, Status::Ok, ReplyBody::Session { pid, token });
                if write_frame(stream, &reply.encode()).is_err() {
                    self.dead.push(pid);
                    return Ok(());
                }

                let tx = self.tx.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("axon-broker:conn-{pid}"))
                    .spawn(move || reader_loop(pid, reader, tx));
                if spawned.is_err() {
                    self.dead.push(pid);
                }
                log::debug!("new connection {pid}");
                Ok(())
            }
            HELLO_NOTIFY => {
                let proc = self
                    .processes
                    .get_mut(&hello.pid)
                    .ok_or(Status::ProtocolError)?;
                if proc.token != hello.token || !proc.connected || proc.notify_tx.is_some() {
                    return Err(Status::ProtocolError);
                }
                let reply = Reply::new(
                    0,
                    Status::Ok,
                    ReplyBody::Session {
                        pid: proc.pid,
                        token: proc.token,
                    },
                );
                if write_frame(stream, &reply.encode()).is_err() {
                    self.dead.push(hello.pid);
                    return Ok(());
                }
                proc.notify_tx = Some(stream.try_clone().map_err(|_| Status::OutOfResources)?);
                Ok(())
            }
            _ => Err(Status::ProtocolError),
        }
    }

    fn new_process_record(&mut self) -> Result<u64, Status> {
        let pid = self.next_pid;
        self.next_pid += 1;
        let token: u64 = rand::random();
        let object = self.store.insert(Payload::Process {
            pid,
            exited: false,
            exit_code: 0,
        })?;
        // The record pins its own process object so late opens and waits
        // keep working after exit.
        self.store.grab(object);
        self.processes
            .insert(pid, Process::new(pid, token, object, self.config.max_handles));
        Ok(pid)
    }

    /// Tear down a client: cancel its pending I/O, unregister its waits,
    /// close its handles, abandon its mutexes, and signal its process
    /// object. Effects on other processes (EOFs, abandoned grants) go
    /// out as notifications.
    fn drop_connection(&mut self, pid: u64, notes: &mut Vec<Note>) {
        let (pending_ops, pending_waits, handles, object) = {
            let Some(proc) = self.processes.get_mut(&pid) else {
                return;
            };
            if !proc.connected {
                return;
            }
            proc.connected = false;
            if let Some(stream) = proc.request_tx.take() {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
            if let Some(stream) = proc.notify_tx.take() {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
            (
                std::mem::take(&mut proc.pending_ops),
                std::mem::take(&mut proc.pending_waits),
                proc.handles.drain(),
                proc.object,
            )
        };
        log::debug!("dropping connection {pid}");

        // Nobody is left to report these to.
        for ((thread, op), id) in pending_ops {
            if let Some(obj) = self.store.get_mut(id) {
                if let Payload::Pipe(pipe) = &mut obj.payload {
                    pipe.cancel(pid, thread, op);
                }
            }
        }

        for (cookie, id) in pending_waits {
            if let Some(obj) = self.store.get_mut(id) {
                obj.waiters.retain(|w| !(w.pid == pid && w.cookie == cookie));
            }
            self.release_object(id);
        }

        for (handle, entry) in handles {
            self.close_entry(pid, handle, entry, notes);
        }

        for id in self.store.mutexes_owned_by(pid) {
            if let Some(obj) = self.store.get_mut(id) {
                if let Payload::Mutex {
                    owner,
                    count,
                    abandoned,
                } = &mut obj.payload
                {
                    *owner = None;
                    *count = 0;
                    *abandoned = true;
                }
            }
            self.signal_object(id, notes);
        }

        if let Some(obj) = self.store.get_mut(object) {
            if let Payload::Process { exited, .. } = &mut obj.payload {
                *exited = true;
            }
        }
        self.signal_object(object, notes);
    }

    fn send_reply(&mut self, pid: u64, reply: Reply) {
        let Some(proc) = self.processes.get_mut(&pid) else {
            return;
        };
        let Some(stream) = proc.request_tx.as_mut() else {
            return;
        };
        if write_frame(stream, &reply.encode()).is_err() {
            self.dead.push(pid);
        }
    }

    fn flush_notes(&mut self, notes: Vec<Note>) {
        for (pid, note) in notes {
            let Some(proc) = self.processes.get_mut(&pid) else {
                continue;
            };
            let Some(stream) = proc.notify_tx.as_mut() else {
                continue;
            };
            if write_frame(stream, &note.encode()).is_err() {
                log::debug!("notify write failed for {pid}");
                self.dead.push(pid);
            }
        }
    }

    // --------------------------- dispatch ---------------------------

    fn dispatch(
        &mut self,
        pid: u64,
        req: Request,
        notes: &mut Vec<Note>,
    ) -> Result<(Status, ReplyBody), Status> {
        // Requests can still be queued behind a connection drop; they
        // must not register new state for a torn-down process.
        if !self.processes.get(&pid).is_some_and(|p| p.connected) {
            return Err(Status::ConnectionLost);
        }
        match req {
            Request::Noop => Ok((Status::Ok, ReplyBody::None)),
            Request::CreateEvent {
                access,
                manual_reset,
                signaled,
            } => {
                let handle = self.create_object(
                    pid,
                    Payload::Event {
                        manual_reset,
                        signaled,
                    },
                    access,
                )?;
                Ok((Status::Ok, ReplyBody::Handle { handle }))
            }
            Request::CreateMutex {
                access,
                owned,
                thread,
            } => {
                let handle = self.create_object(
                    pid,
                    Payload::Mutex {
                        owner: owned.then_some((pid, thread)),
                        count: owned as u32,
                        abandoned: false,
                    },
                    access,
                )?;
                Ok((Status::Ok, ReplyBody::Handle { handle }))
            }
            Request::CreateSemaphore {
                access,
                initial,
                max,
            } => {
                if max == 0 || initial > max {
                    return Err(Status::InvalidArgument);
                }
                let handle = self.create_object(
                    pid,
                    Payload::Semaphore {
                        count: initial,
                        max,
                    },
                    access,
                )?;
                Ok((Status::Ok, ReplyBody::Handle { handle }))
            }
            Request::CreatePipe { capacity } => self.create_pipe(pid, capacity),
            Request::OpenProcess { pid: target, access } => {
                let object = self
                    .processes
                    .get(&target)
                    .ok_or(Status::NotFound)?
                    .object;
                let proc = self.processes.get_mut(&pid).ok_or(Status::InvalidHandle)?;
                let handle = proc.handles.alloc(HandleEntry {
                    obj: object,
                    access,
                    flags: 0,
                })?;
                self.store.grab(object);
                Ok((Status::Ok, ReplyBody::Handle { handle }))
            }
            Request::NewProcess => self.new_process(pid),
            Request::ExitProcess { code } => {
                let object = self.processes.get(&pid).ok_or(Status::InvalidHandle)?.object;
                if let Some(obj) = self.store.get_mut(object) {
                    if let Payload::Process { exit_code, .. } = &mut obj.payload {
                        *exit_code = code;
                    }
                }
                Ok((Status::Ok, ReplyBody::None))
            }
            Request::Close { handle } => {
                let proc = self.processes.get_mut(&pid).ok_or(Status::InvalidHandle)?;
                let entry = proc.handles.get(handle).ok_or(Status::InvalidHandle)?;
                if entry.flags & HANDLE_FLAG_PROTECT_FROM_CLOSE != 0 {
                    return Err(Status::InvalidArgument);
                }
                let entry = proc.handles.remove(handle).unwrap();
                self.close_entry(pid, handle, entry, notes);
                Ok((Status::Ok, ReplyBody::None))
            }
            Request::Duplicate {
                src_process,
                src_handle,
                dst_process,
                access,
                inherit,
                options,
            } => self.duplicate(
                pid,
                src_process,
                src_handle,
                dst_process,
                access,
                inherit,
                options,
                notes,
            ),
            Request::GetHandleInfo { handle } => {
                let (_, entry) = self.lookup(pid, handle, 0)?;
                Ok((
                    Status::Ok,
                    ReplyBody::HandleInfo {
                        access: entry.access,
                        flags: entry.flags,
                    },
                ))
            }
            Request::SetHandleInfo {
                handle,
                mask,
                flags,
            } => {
                if mask & !HANDLE_FLAG_ALL != 0 || flags & !HANDLE_FLAG_ALL != 0 {
                    return Err(Status::InvalidArgument);
                }
                let proc = self.processes.get_mut(&pid).ok_or(Status::InvalidHandle)?;
                let entry = proc.handles.get_mut(handle).ok_or(Status::InvalidHandle)?;
                entry.flags = (entry.flags & !mask) | (flags & mask);
                Ok((Status::Ok, ReplyBody::None))
            }
            Request::SetEvent { handle } => {
                let (id, _) = self.lookup(pid, handle, ACCESS_MODIFY)?;
                let obj = self.store.get_mut(id).ok_or(Status::InvalidHandle)?;
                let Payload::Event { signaled, .. } = &mut obj.payload else {
                    return Err(Status::InvalidArgument);
                };
                *signaled = true;
                self.signal_object(id, notes);
                Ok((Status::Ok, ReplyBody::None))
            }
            Request::ResetEvent { handle } => {
                let (id, _) = self.lookup(pid, handle, ACCESS_MODIFY)?;
                let obj = self.store.get_mut(id).ok_or(Status::InvalidHandle)?;
                let Payload::Event { signaled, .. } = &mut obj.payload else {
                    return Err(Status::InvalidArgument);
                };
                *signaled = false;
                Ok((Status::Ok, ReplyBody::None))
            }
            Request::ReleaseMutex { handle, thread } => {
                let (id, _) = self.lookup(pid, handle, ACCESS_MODIFY)?;
                let obj = self.store.get_mut(id).ok_or(Status::InvalidHandle)?;
                let Payload::Mutex { owner, count, .. } = &mut obj.payload else {
                    return Err(Status::InvalidArgument);
                };
                if *owner != Some((pid, thread)) {
                    return Err(Status::NotOwner);
                }
                *count -= 1;
                if *count > 0 {
                    return Ok((Status::Ok, ReplyBody::None));
                }
                *owner = None;
                self.signal_object(id, notes);
                Ok((Status::Ok, ReplyBody::None))
            }
            Request::ReleaseSemaphore { handle, count } => {
                let (id, _) = self.lookup(pid, handle, ACCESS_MODIFY)?;
                let obj = self.store.get_mut(id).ok_or(Status::InvalidHandle)?;
                let Payload::Semaphore { count: cur, max } = &mut obj.payload else {
                    return Err(Status::InvalidArgument);
                };
                if count == 0 {
                    return Err(Status::InvalidArgument);
                }
                let prev = *cur;
                match cur.checked_add(count) {
                    Some(next) if next <= *max => *cur = next,
                    _ => return Err(Status::InvalidArgument),
                }
                self.signal_object(id, notes);
                Ok((Status::Ok, ReplyBody::Prev { prev }))
            }
            Request::Wait {
                handle,
                timeout_ms,
                cookie,
                thread,
            } => self.wait(pid, handle, timeout_ms, cookie, thread),
            Request::CancelWait { cookie } => {
                let proc = self.processes.get_mut(&pid).ok_or(Status::InvalidHandle)?;
                let Some(id) = proc.pending_waits.remove(&cookie) else {
                    // Already woken; the wake note is in flight.
                    return Err(Status::NotFound);
                };
                if let Some(obj) = self.store.get_mut(id) {
                    obj.waiters.retain(|w| !(w.pid == pid && w.cookie == cookie));
                }
                self.release_object(id);
                Ok((Status::Ok, ReplyBody::None))
            }
            Request::Read {
                handle,
                len,
                op,
                thread,
            } => self.read(pid, handle, len as usize, op, thread, notes),
            Request::Write {
                handle,
                op,
                thread,
                data,
            } => self.write(pid, handle, op, thread, data, notes),
            Request::CancelIo { handle: _, op, thread } => self.cancel_io(pid, op, thread, notes),
            Request::QueryObject { handle } => {
                let (id, _) = self.lookup(pid, handle, ACCESS_QUERY)?;
                let obj = self.store.get(id).ok_or(Status::InvalidHandle)?;
                let extra = match &obj.payload {
                    Payload::Event { .. } => 0,
                    Payload::Mutex { count, .. } => *count as u64,
                    Payload::Semaphore { count, .. } => *count as u64,
                    Payload::Pipe(pipe) => pipe.buffered() as u64,
                    Payload::Process { exit_code, .. } => *exit_code as u32 as u64,
                };
                Ok((
                    Status::Ok,
                    ReplyBody::Query {
                        obj_type: obj.obj_type(),
                        refcount: obj.refcount,
                        signaled: obj.signaled(),
                        id,
                        extra,
                    },
                ))
            }
        }
    }

    // ----------------------- handles & objects -----------------------

    fn lookup(&self, pid: u64, handle: Handle, access: u32) -> Result<(ObjId, HandleEntry), Status> {
        let proc = self.processes.get(&pid).ok_or(Status::InvalidHandle)?;
        let entry = proc.handles.get(handle).ok_or(Status::InvalidHandle)?;
        if entry.access & access != access {
            return Err(Status::AccessDenied);
        }
        Ok((entry.obj, *entry))
    }

    fn create_object(&mut self, pid: u64, payload: Payload, access: u32) -> Result<Handle, Status> {
        let id = self.store.insert(payload)?;
        let proc = self.processes.get_mut(&pid).ok_or(Status::InvalidHandle)?;
        match proc.handles.alloc(HandleEntry {
            obj: id,
            access,
            flags: 0,
        }) {
            Ok(handle) => {
                self.store.grab(id);
                Ok(handle)
            }
            Err(err) => {
                self.store.forget(id);
                Err(err)
            }
        }
    }

    fn create_pipe(&mut self, pid: u64, capacity: u32) -> Result<(Status, ReplyBody), Status> {
        let capacity = if capacity == 0 {
            self.config.pipe_capacity
        } else {
            (capacity as usize).clamp(16, MAX_PIPE_CAPACITY)
        };

        let read_access = ACCESS_READ | ACCESS_SYNCHRONIZE | ACCESS_DUP | ACCESS_QUERY;
        let write_access = ACCESS_WRITE | ACCESS_SYNCHRONIZE | ACCESS_DUP | ACCESS_QUERY;

        let id = self.store.insert(Payload::Pipe(Pipe::new(capacity)))?;
        let proc = self.processes.get_mut(&pid).ok_or(Status::InvalidHandle)?;
        let read = match proc.handles.alloc(HandleEntry {
            obj: id,
            access: read_access,
            flags: 0,
        }) {
            Ok(handle) => handle,
            Err(err) => {
                self.store.forget(id);
                return Err(err);
            }
        };
        let write = match proc.handles.alloc(HandleEntry {
            obj: id,
            access: write_access,
            flags: 0,
        }) {
            Ok(handle) => handle,
            Err(err) => {
                proc.handles.remove(read);
                self.store.forget(id);
                return Err(err);
            }
        };
        self.store.grab(id);
        self.store.grab(id);
        self.pipe_attach(id, read_access);
        self.pipe_attach(id, write_access);
        Ok((Status::Ok, ReplyBody::HandlePair { read, write }))
    }

    fn new_process(&mut self, pid: u64) -> Result<(Status, ReplyBody), Status> {
        let child = self.new_process_record()?;
        let (object, token) = {
            let rec = self.processes.get(&child).unwrap();
            (rec.object, rec.token)
        };
        let creator = self.processes.get_mut(&pid).ok_or(Status::InvalidHandle)?;
        match creator.handles.alloc(HandleEntry {
            obj: object,
            access: ACCESS_ALL,
            flags: 0,
        }) {
            Ok(handle) => {
                self.store.grab(object);
                Ok((
                    Status::Ok,
                    ReplyBody::Process {
                        pid: child,
                        token,
                        handle,
                    },
                ))
            }
            Err(err) => {
                self.processes.remove(&child);
                self.release_object(object);
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn duplicate(
        &mut self,
        pid: u64,
        src_process: Handle,
        src_handle: Handle,
        dst_process: Handle,
        access: u32,
        inherit: bool,
        options: u32,
        notes: &mut Vec<Note>,
    ) -> Result<(Status, ReplyBody), Status> {
        if options & !(DUP_SAME_ACCESS | DUP_CLOSE_SOURCE | DUP_SAME_VALUE) != 0 {
            return Err(Status::InvalidArgument);
        }
        let src_pid = self.resolve_process(pid, src_process)?;
        let dst_pid = self.resolve_process(pid, dst_process)?;

        let src_entry = *self
            .processes
            .get(&src_pid)
            .ok_or(Status::InvalidHandle)?
            .handles
            .get(src_handle)
            .ok_or(Status::InvalidHandle)?;
        if options & DUP_CLOSE_SOURCE != 0
            && src_entry.flags & HANDLE_FLAG_PROTECT_FROM_CLOSE != 0
        {
            return Err(Status::InvalidArgument);
        }

        let granted = if options & DUP_SAME_ACCESS != 0 {
            src_entry.access
        } else {
            access & ACCESS_ALL
        };
        let new_entry = HandleEntry {
            obj: src_entry.obj,
            access: granted,
            flags: if inherit { HANDLE_FLAG_INHERIT } else { 0 },
        };

        let dst = self.processes.get_mut(&dst_pid).ok_or(Status::InvalidHandle)?;
        let new_handle = if options & DUP_SAME_VALUE != 0 {
            dst.handles.alloc_value(src_handle, new_entry)?;
            src_handle
        } else {
            dst.handles.alloc(new_entry)?
        };

        // Increment strictly before the optional source decrement: the
        // count never transiently reaches zero.
        self.store.grab(src_entry.obj);
        self.pipe_attach(src_entry.obj, granted);

        if options & DUP_CLOSE_SOURCE != 0 {
            let removed = self
                .processes
                .get_mut(&src_pid)
                .unwrap()
                .handles
                .remove(src_handle);
            if let Some(entry) = removed {
                self.close_entry(src_pid, src_handle, entry, notes);
            }
        }

        Ok((Status::Ok, ReplyBody::Handle { handle: new_handle }))
    }

    fn resolve_process(&self, pid: u64, handle: Handle) -> Result<u64, Status> {
        if handle == Handle::SELF {
            return Ok(pid);
        }
        let entry = self
            .processes
            .get(&pid)
            .ok_or(Status::InvalidHandle)?
            .handles
            .get(handle)
            .ok_or(Status::InvalidHandle)?;
        if entry.access & ACCESS_DUP == 0 {
            return Err(Status::AccessDenied);
        }
        match self.store.get(entry.obj).map(|o| &o.payload) {
            Some(Payload::Process { pid: target, .. }) => Ok(*target),
            _ => Err(Status::InvalidArgument),
        }
    }

    /// Remove one table reference: cancel the handle's pending pipe
    /// operations, retire its pipe end, and drop the object reference.
    fn close_entry(&mut self, pid: u64, handle: Handle, entry: HandleEntry, notes: &mut Vec<Note>) {
        let removed = match self.store.get_mut(entry.obj) {
            Some(obj) => match &mut obj.payload {
                Payload::Pipe(pipe) => pipe.cancel_for_handle(pid, handle),
                _ => Vec::new(),
            },
            None => Vec::new(),
        };
        for io in removed {
            if let Some(proc) = self.processes.get_mut(&io.pid) {
                proc.pending_ops.remove(&(io.thread, io.op));
            }
            let written = match &io.kind {
                IoKind::Write { written, .. } => *written as u32,
                IoKind::Read { .. } => 0,
            };
            notes.push((
                io.pid,
                Notification::IoComplete {
                    thread: io.thread,
                    op: io.op,
                    status: Status::Cancelled,
                    transferred: written,
                    data: Vec::new(),
                },
            ));
        }

        self.pipe_detach(entry.obj, entry.access);
        self.pump_pipe(entry.obj, notes, None);
        self.release_object(entry.obj);
    }

    fn pipe_attach(&mut self, id: ObjId, access: u32) {
        if let Some(obj) = self.store.get_mut(id) {
            if let Payload::Pipe(pipe) = &mut obj.payload {
                if access & ACCESS_READ != 0 {
                    pipe.readers += 1;
                }
                if access & ACCESS_WRITE != 0 {
                    pipe.writers += 1;
                }
            }
        }
    }

    fn pipe_detach(&mut self, id: ObjId, access: u32) {
        if let Some(obj) = self.store.get_mut(id) {
            if let Payload::Pipe(pipe) = &mut obj.payload {
                if access & ACCESS_READ != 0 {
                    pipe.readers -= 1;
                }
                if access & ACCESS_WRITE != 0 {
                    pipe.writers -= 1;
                }
            }
        }
    }

    fn release_object(&mut self, id: ObjId) {
        if let Some(obj) = self.store.release(id) {
            debug_assert!(obj.waiters.is_empty());
            if let Payload::Pipe(pipe) = &obj.payload {
                debug_assert!(pipe.pending_reads.is_empty());
                debug_assert!(pipe.pending_writes.is_empty());
            }
            log::debug!("object {} destroyed", obj.id);
        }
    }

    /// Wake registered waiters for as long as the object keeps granting:
    /// one waiter per auto-reset signal or semaphore count, every waiter
    /// for manual-reset events, readable pipes and exited processes.
    fn signal_object(&mut self, id: ObjId, notes: &mut Vec<Note>) {
        loop {
            let woken = {
                let Some(obj) = self.store.get_mut(id) else {
                    break;
                };
                let Some(waiter) = obj.waiters.front().copied() else {
                    break;
                };
                match obj.try_acquire(waiter.pid, waiter.thread) {
                    Some(status) => {
                        obj.waiters.pop_front();
                        Some((waiter, status))
                    }
                    None => None,
                }
            };
            let Some((waiter, status)) = woken else {
                break;
            };
            if let Some(proc) = self.processes.get_mut(&waiter.pid) {
                proc.pending_waits.remove(&waiter.cookie);
            }
            notes.push((
                waiter.pid,
                Notification::Wake {
                    thread: waiter.thread,
                    cookie: waiter.cookie,
                    status,
                },
            ));
            // The registration's pin.
            self.release_object(id);
        }
    }

    // ----------------------------- waits -----------------------------

    fn wait(
        &mut self,
        pid: u64,
        handle: Handle,
        timeout_ms: u32,
        cookie: u64,
        thread: u64,
    ) -> Result<(Status, ReplyBody), Status> {
        let (id, _) = self.lookup(pid, handle, ACCESS_SYNCHRONIZE)?;
        let obj = self.store.get_mut(id).ok_or(Status::InvalidHandle)?;
        if let Some(status) = obj.try_acquire(pid, thread) {
            return Ok((status, ReplyBody::None));
        }
        if timeout_ms == 0 {
            return Ok((Status::Timeout, ReplyBody::None));
        }
        obj.waiters.push_back(Waiter {
            pid,
            thread,
            cookie,
        });
        self.store.grab(id);
        let proc = self.processes.get_mut(&pid).ok_or(Status::InvalidHandle)?;
        if proc.pending_waits.insert(cookie, id).is_some() {
            log::warn!("duplicate wait cookie {cookie} from {pid}");
        }
        Ok((Status::Pending, ReplyBody::None))
    }

    // --------------------------- pipe I/O ----------------------------

    /// Run the pipe to fixpoint. Completions for `take`'s own operation
    /// are returned (the submission replies synchronously); everything
    /// else goes out as notifications. A newly readable pipe also wakes
    /// its waiters.
    fn pump_pipe(
        &mut self,
        id: ObjId,
        notes: &mut Vec<Note>,
        take: Option<(u64, u64, u64)>,
    ) -> Option<IoDone> {
        let (dones, readable) = match self.store.get_mut(id) {
            Some(obj) => match &mut obj.payload {
                Payload::Pipe(pipe) => {
                    let dones = pipe.pump();
                    (dones, pipe.readable())
                }
                _ => return None,
            },
            None => return None,
        };

        let mut mine = None;
        for done in dones {
            if take == Some((done.pid, done.thread, done.op)) && mine.is_none() {
                mine = Some(done);
                continue;
            }
            if let Some(proc) = self.processes.get_mut(&done.pid) {
                proc.pending_ops.remove(&(done.thread, done.op));
            }
            notes.push((
                done.pid,
                Notification::IoComplete {
                    thread: done.thread,
                    op: done.op,
                    status: done.status,
                    transferred: done.transferred,
                    data: done.data,
                },
            ));
        }
        if readable {
            self.signal_object(id, notes);
        }
        mine
    }

    fn read(
        &mut self,
        pid: u64,
        handle: Handle,
        len: usize,
        op: u64,
        thread: u64,
        notes: &mut Vec<Note>,
    ) -> Result<(Status, ReplyBody), Status> {
        let (id, _) = self.lookup(pid, handle, ACCESS_READ)?;
        let len = len.min(MAX_IO_BYTES);
        {
            let obj = self.store.get_mut(id).ok_or(Status::InvalidHandle)?;
            let Payload::Pipe(pipe) = &mut obj.payload else {
                return Err(Status::InvalidArgument);
            };
            if len == 0 {
                return Ok((Status::Ok, ReplyBody::Data { data: Vec::new() }));
            }
            if op == 0 && !pipe.readable() {
                return Ok((Status::Pending, ReplyBody::None));
            }
            pipe.pending_reads.push_back(PendingIo {
                pid,
                thread,
                op,
                handle,
                kind: IoKind::Read { len },
            });
        }

        match self.pump_pipe(id, notes, Some((pid, thread, op))) {
            Some(done) => Ok((Status::Ok, ReplyBody::Data { data: done.data })),
            None if op == 0 => {
                // Readable flipped away under us is impossible on one
                // thread; keep the table consistent regardless.
                if let Some(obj) = self.store.get_mut(id) {
                    if let Payload::Pipe(pipe) = &mut obj.payload {
                        pipe.cancel(pid, thread, op);
                    }
                }
                Ok((Status::Pending, ReplyBody::None))
            }
            None => {
                self.processes
                    .get_mut(&pid)
                    .ok_or(Status::InvalidHandle)?
                    .pending_ops
                    .insert((thread, op), id);
                Ok((Status::Pending, ReplyBody::None))
            }
        }
    }

    fn write(
        &mut self,
        pid: u64,
        handle: Handle,
        op: u64,
        thread: u64,
        data: Vec<u8>,
        notes: &mut Vec<Note>,
    ) -> Result<(Status, ReplyBody), Status> {
        let (id, _) = self.lookup(pid, handle, ACCESS_WRITE)?;
        if data.len() > MAX_IO_BYTES {
            return Err(Status::InvalidArgument);
        }
        {
            let obj = self.store.get_mut(id).ok_or(Status::InvalidHandle)?;
            let Payload::Pipe(pipe) = &mut obj.payload else {
                return Err(Status::InvalidArgument);
            };
            if pipe.readers == 0 {
                return Err(Status::BrokenPipe);
            }
            if data.is_empty() {
                return Ok((Status::Ok, ReplyBody::Written { len: 0 }));
            }
            if op == 0 && (pipe.space() < data.len() || !pipe.pending_writes.is_empty()) {
                return Ok((Status::Pending, ReplyBody::None));
            }
            pipe.pending_writes.push_back(PendingIo {
                pid,
                thread,
                op,
                handle,
                kind: IoKind::Write { data, written: 0 },
            });
        }

        match self.pump_pipe(id, notes, Some((pid, thread, op))) {
            Some(done) if done.status == Status::Ok => Ok((
                Status::Ok,
                ReplyBody::Written {
                    len: done.transferred,
                },
            )),
            Some(done) => Ok((done.status, ReplyBody::None)),
            None if op == 0 => {
                if let Some(obj) = self.store.get_mut(id) {
                    if let Payload::Pipe(pipe) = &mut obj.payload {
                        pipe.cancel(pid, thread, op);
                    }
                }
                Ok((Status::Pending, ReplyBody::None))
            }
            None => {
                self.processes
                    .get_mut(&pid)
                    .ok_or(Status::InvalidHandle)?
                    .pending_ops
                    .insert((thread, op), id);
                Ok((Status::Pending, ReplyBody::None))
            }
        }
    }

    /// Authoritative cancel: either the operation is still pending here
    /// and its single completion goes out as `Cancelled`, or it already
    /// completed and the natural result stands (`NotFound`).
    fn cancel_io(
        &mut self,
        pid: u64,
        op: u64,
        thread: u64,
        notes: &mut Vec<Note>,
    ) -> Result<(Status, ReplyBody), Status> {
        let proc = self.processes.get_mut(&pid).ok_or(Status::InvalidHandle)?;
        let Some(id) = proc.pending_ops.remove(&(thread, op)) else {
            return Err(Status::NotFound);
        };
        let removed = match self.store.get_mut(id) {
            Some(obj) => match &mut obj.payload {
                Payload::Pipe(pipe) => pipe.cancel(pid, thread, op),
                _ => None,
            },
            None => None,
        };
        match removed {
            Some(io) => {
                let written = match &io.kind {
                    IoKind::Write { written, .. } => *written as u32,
                    IoKind::Read { .. } => 0,
                };
                notes.push((
                    pid,
                    Notification::IoComplete {
                        thread,
                        op,
                        status: Status::Cancelled,
                        transferred: written,
                        data: Vec::new(),
                    },
                ));
            }
            None => log::warn!("pending op {op:#x} of {pid} missing from its pipe"),
        }
        Ok((Status::Ok, ReplyBody::None))
    }
}
