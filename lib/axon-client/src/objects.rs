//! Typed operations on broker objects: creation, signaling, handle
//! management, duplication/inheritance, and asynchronous pipe I/O.

use std::time::Duration;

use axon_wire::{
    Handle, ObjType, ReplyBody, Request, Result, Status, ACCESS_ALL, DUP_SAME_ACCESS,
    DUP_SAME_VALUE, HANDLE_FLAG_INHERIT, MAX_IO_BYTES,
};

use crate::connection::{ChildSpec, Connection, LocalEntry};
use crate::thread_io::{AsyncIo, CompletionRoutine, ThreadIoContext};

/// What `query_object` reports about a live object.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ObjectInfo {
    pub obj_type: ObjType,
    pub refcount: u32,
    pub signaled: bool,
    pub id: u64,
    /// Type-specific: exit code for processes, current count for
    /// semaphores, recursion depth for mutexes, buffered bytes for
    /// pipes.
    pub extra: u64,
}

impl Connection {
    fn expect_handle(&self, body: ReplyBody, access: u32, flags: u32) -> Result<Handle> {
        let ReplyBody::Handle { handle } = body else {
            return Err(Status::ProtocolError);
        };
        self.inner
            .handles
            .lock()
            .unwrap()
            .insert(handle.as_u32(), LocalEntry { access, flags });
        Ok(handle)
    }

    pub fn ping(&self) -> Result<()> {
        self.call_ok(Request::Noop).map(|_| ())
    }

    pub fn create_event(&self, access: u32, manual_reset: bool, signaled: bool) -> Result<Handle> {
        let body = self.call_ok(Request::CreateEvent {
            access,
            manual_reset,
            signaled,
        })?;
        self.expect_handle(body, access, 0)
    }

    pub fn set_event(&self, handle: Handle) -> Result<()> {
        self.call_ok(Request::SetEvent { handle }).map(|_| ())
    }

    pub fn reset_event(&self, handle: Handle) -> Result<()> {
        self.call_ok(Request::ResetEvent { handle }).map(|_| ())
    }

    /// `owned` grants initial ownership to the calling thread.
    pub fn create_mutex(&self, ctx: &ThreadIoContext, access: u32, owned: bool) -> Result<Handle> {
        let body = self.call_ok(Request::CreateMutex {
            access,
            owned,
            thread: ctx.id(),
        })?;
        self.expect_handle(body, access, 0)
    }

    pub fn release_mutex(&self, ctx: &ThreadIoContext, handle: Handle) -> Result<()> {
        self.call_ok(Request::ReleaseMutex {
            handle,
            thread: ctx.id(),
        })
        .map(|_| ())
    }

    pub fn create_semaphore(&self, access: u32, initial: u32, max: u32) -> Result<Handle> {
        let body = self.call_ok(Request::CreateSemaphore {
            access,
            initial,
            max,
        })?;
        self.expect_handle(body, access, 0)
    }

    /// Returns the count before the release.
    pub fn release_semaphore(&self, handle: Handle, count: u32) -> Result<u32> {
        match self.call_ok(Request::ReleaseSemaphore { handle, count })? {
            ReplyBody::Prev { prev } => Ok(prev),
            _ => Err(Status::ProtocolError),
        }
    }

    /// One pipe object, two handles: read side, write side.
    /// `capacity == 0` uses the broker default.
    pub fn create_pipe(&self, capacity: u32) -> Result<(Handle, Handle)> {
        match self.call_ok(Request::CreatePipe { capacity })? {
            ReplyBody::HandlePair { read, write } => {
                let mut handles = self.inner.handles.lock().unwrap();
                handles.insert(
                    read.as_u32(),
                    LocalEntry {
                        access: axon_wire::ACCESS_READ
                            | axon_wire::ACCESS_SYNCHRONIZE
                            | axon_wire::ACCESS_DUP
                            | axon_wire::ACCESS_QUERY,
                        flags: 0,
                    },
                );
                handles.insert(
                    write.as_u32(),
                    LocalEntry {
                        access: axon_wire::ACCESS_WRITE
                            | axon_wire::ACCESS_SYNCHRONIZE
                            | axon_wire::ACCESS_DUP
                            | axon_wire::ACCESS_QUERY,
                        flags: 0,
                    },
                );
                Ok((read, write))
            }
            _ => Err(Status::ProtocolError),
        }
    }

    pub fn open_process(&self, pid: u64, access: u32) -> Result<Handle> {
        let body = self.call_ok(Request::OpenProcess { pid, access })?;
        self.expect_handle(body, access, 0)
    }

    /// Record this process's exit code; the process object signals when
    /// the connection actually goes away.
    pub fn exit_process(&self, code: i32) -> Result<()> {
        self.call_ok(Request::ExitProcess { code }).map(|_| ())
    }

    /// Pre-create a child process record and, when `inherit` is set,
    /// duplicate every inheritable handle into it — one duplication per
    /// handle, preserving values, exactly the loop the process-creation
    /// collaborator runs before the child starts executing.
    pub fn create_child(&self, inherit: bool) -> Result<ChildSpec> {
        let ReplyBody::Process { pid, token, handle } = self.call_ok(Request::NewProcess)? else {
            return Err(Status::ProtocolError);
        };
        self.inner.handles.lock().unwrap().insert(
            handle.as_u32(),
            LocalEntry {
                access: ACCESS_ALL,
                flags: 0,
            },
        );

        if inherit {
            for src in self.inheritable_handles() {
                self.duplicate_to(
                    Handle::SELF,
                    src,
                    handle,
                    0,
                    true,
                    DUP_SAME_ACCESS | DUP_SAME_VALUE,
                )?;
            }
        }

        Ok(ChildSpec { pid, token, handle })
    }

    /// Handles this process marked inheritable, per the local mirror.
    pub fn inheritable_handles(&self) -> Vec<Handle> {
        let handles = self.inner.handles.lock().unwrap();
        let mut out: Vec<Handle> = handles
            .iter()
            .filter(|(_, e)| e.flags & HANDLE_FLAG_INHERIT != 0)
            .map(|(h, _)| Handle::from_u32(*h))
            .collect();
        out.sort();
        out
    }

    /// Close a handle. The broker drops the object reference (destroying
    /// the object at zero) and cancels this handle's pending async
    /// operations. Closing an unknown handle reports `InvalidHandle`.
    pub fn close(&self, handle: Handle) -> Result<()> {
        self.call_ok(Request::Close { handle })?;
        self.inner.handles.lock().unwrap().remove(&handle.as_u32());
        Ok(())
    }

    /// Duplicate within this process's table.
    pub fn duplicate(
        &self,
        src_handle: Handle,
        access: u32,
        inherit: bool,
        options: u32,
    ) -> Result<Handle> {
        self.duplicate_to(Handle::SELF, src_handle, Handle::SELF, access, inherit, options)
    }

    /// Duplicate a handle between process tables in one broker
    /// transaction: the reference count is bumped before the optional
    /// close-source drop, so it never transiently reaches zero.
    /// `src_process`/`dst_process` are process handles, or `Handle::SELF`.
    pub fn duplicate_to(
        &self,
        src_process: Handle,
        src_handle: Handle,
        dst_process: Handle,
        access: u32,
        inherit: bool,
        options: u32,
    ) -> Result<Handle> {
        let src_local = {
            let handles = self.inner.handles.lock().unwrap();
            handles.get(&src_handle.as_u32()).copied()
        };

        let ReplyBody::Handle { handle } = self.call_ok(Request::Duplicate {
            src_process,
            src_handle,
            dst_process,
            access,
            inherit,
            options,
        })?
        else {
            return Err(Status::ProtocolError);
        };

        let mut handles = self.inner.handles.lock().unwrap();
        if options & axon_wire::DUP_CLOSE_SOURCE != 0 && src_process == Handle::SELF {
            handles.remove(&src_handle.as_u32());
        }
        if dst_process == Handle::SELF {
            let access = if options & DUP_SAME_ACCESS != 0 {
                src_local.map(|e| e.access).unwrap_or(access)
            } else {
                access
            };
            handles.insert(
                handle.as_u32(),
                LocalEntry {
                    access,
                    flags: if inherit { HANDLE_FLAG_INHERIT } else { 0 },
                },
            );
        }
        Ok(handle)
    }

    pub fn get_handle_info(&self, handle: Handle) -> Result<(u32, u32)> {
        match self.call_ok(Request::GetHandleInfo { handle })? {
            ReplyBody::HandleInfo { access, flags } => Ok((access, flags)),
            _ => Err(Status::ProtocolError),
        }
    }

    /// Toggle the flag bits selected by `mask`; the object's reference
    /// count is untouched.
    pub fn set_handle_info(&self, handle: Handle, mask: u32, flags: u32) -> Result<()> {
        self.call_ok(Request::SetHandleInfo {
            handle,
            mask,
            flags,
        })?;
        let mut handles = self.inner.handles.lock().unwrap();
        if let Some(entry) = handles.get_mut(&handle.as_u32()) {
            entry.flags = (entry.flags & !mask) | (flags & mask);
        }
        Ok(())
    }

    /// Record a handle this process learned out of band (an inherited
    /// value, typically) in the local mirror.
    pub fn adopt(&self, handle: Handle) -> Result<()> {
        let (access, flags) = self.get_handle_info(handle)?;
        self.inner
            .handles
            .lock()
            .unwrap()
            .insert(handle.as_u32(), LocalEntry { access, flags });
        Ok(())
    }

    pub fn query_object(&self, handle: Handle) -> Result<ObjectInfo> {
        match self.call_ok(Request::QueryObject { handle })? {
            ReplyBody::Query {
                obj_type,
                refcount,
                signaled,
                id,
                extra,
            } => Ok(ObjectInfo {
                obj_type,
                refcount,
                signaled,
                id,
                extra,
            }),
            _ => Err(Status::ProtocolError),
        }
    }

    /// Submit an asynchronous read. The slot is reserved before the
    /// request is sent, so local exhaustion reports `OutOfResources`
    /// with no broker-side effect; an error reply rolls the slot back.
    /// If the broker completes the read synchronously the operation
    /// finishes here (the completion routine is still deferred to an APC
    /// on this thread); otherwise exactly one completion notification
    /// finishes it later.
    pub fn read_async(
        &self,
        ctx: &ThreadIoContext,
        handle: Handle,
        len: usize,
        routine: Option<CompletionRoutine>,
    ) -> Result<AsyncIo> {
        if len > MAX_IO_BYTES {
            return Err(Status::InvalidArgument);
        }
        let io = ctx.prepare_op(handle, routine)?;
        let reply = match self.call(Request::Read {
            handle,
            len: len as u32,
            op: io.op,
            thread: ctx.id(),
        }) {
            Ok(reply) => reply,
            Err(err) => {
                ctx.rollback_op(io.op);
                return Err(err);
            }
        };

        match reply.status {
            Status::Ok => {
                let ReplyBody::Data { data } = reply.body else {
                    ctx.rollback_op(io.op);
                    return Err(Status::ProtocolError);
                };
                ctx.finish_op(
                    io.op,
                    crate::IoResult {
                        status: Status::Ok,
                        transferred: data.len(),
                        data,
                    },
                );
                Ok(io)
            }
            Status::Pending => Ok(io),
            other => {
                ctx.rollback_op(io.op);
                Err(other)
            }
        }
    }

    /// Submit an asynchronous write; same slot discipline as
    /// `read_async`.
    pub fn write_async(
        &self,
        ctx: &ThreadIoContext,
        handle: Handle,
        data: &[u8],
        routine: Option<CompletionRoutine>,
    ) -> Result<AsyncIo> {
        if data.len() > MAX_IO_BYTES {
            return Err(Status::InvalidArgument);
        }
        let io = ctx.prepare_op(handle, routine)?;
        let reply = match self.call(Request::Write {
            handle,
            op: io.op,
            thread: ctx.id(),
            data: data.to_vec(),
        }) {
            Ok(reply) => reply,
            Err(err) => {
                ctx.rollback_op(io.op);
                return Err(err);
            }
        };

        match reply.status {
            Status::Ok => {
                let ReplyBody::Written { len } = reply.body else {
                    ctx.rollback_op(io.op);
                    return Err(Status::ProtocolError);
                };
                ctx.finish_op(
                    io.op,
                    crate::IoResult {
                        status: Status::Ok,
                        transferred: len as usize,
                        data: Vec::new(),
                    },
                );
                Ok(io)
            }
            Status::Pending => Ok(io),
            other => {
                ctx.rollback_op(io.op);
                Err(other)
            }
        }
    }

    /// Best-effort cancel. `Ok(true)`: the operation was still pending
    /// and its (single) completion will report `Cancelled`. `Ok(false)`:
    /// it already completed and the natural result stands.
    pub fn cancel_io(&self, io: &AsyncIo) -> Result<bool> {
        let reply = self.call(Request::CancelIo {
            handle: io.handle,
            op: io.op,
            thread: io.thread,
        })?;
        match reply.status {
            Status::Ok => Ok(true),
            Status::NotFound => Ok(false),
            other => Err(other),
        }
    }

    /// Block until an operation finishes; the blocked thread is woken by
    /// whichever thread observes the completion. Returns the operation's
    /// terminal status.
    pub fn wait_io(
        &self,
        ctx: &ThreadIoContext,
        io: &AsyncIo,
        timeout: Option<Duration>,
        alertable: bool,
    ) -> Result<Status> {
        let deadline = timeout.map(|d| std::time::Instant::now() + d);
        let mut state = ctx.lock_state();
        loop {
            // APC delivery outranks the primary condition: a completion
            // routine queued by the finish of this very operation
            // interrupts the wait rather than silently satisfying it.
            if alertable && state.has_apcs() {
                drop(state);
                ctx.drain_apcs();
                return Ok(Status::Interrupted);
            }
            if let Some(res) = io.status.result() {
                return Ok(res.status);
            }
            if self.is_lost() {
                return Err(Status::ConnectionLost);
            }
            match deadline {
                None => state = ctx.cv().wait(state).unwrap(),
                Some(deadline) => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return Ok(Status::Timeout);
                    }
                    state = ctx.cv().wait_timeout(state, deadline - now).unwrap().0;
                }
            }
        }
    }

    /// Synchronous read: the asynchronous path plus a wait on the status
    /// block. There is no separate blocking path in the broker.
    pub fn read(
        &self,
        ctx: &ThreadIoContext,
        handle: Handle,
        len: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let io = self.read_async(ctx, handle, len, None)?;
        match self.wait_io(ctx, &io, timeout, false)? {
            Status::Timeout => {
                self.cancel_io(&io)?;
                // The terminal report is in flight either way; consume it.
                self.wait_io(ctx, &io, None, false)?;
                let res = io.status.result().ok_or(Status::ProtocolError)?;
                if res.status == Status::Ok {
                    Ok(res.data)
                } else {
                    Err(Status::Timeout)
                }
            }
            _ => {
                let res = io.status.result().ok_or(Status::ProtocolError)?;
                res.status.check()?;
                Ok(res.data)
            }
        }
    }

    /// Synchronous write; returns bytes written.
    pub fn write(
        &self,
        ctx: &ThreadIoContext,
        handle: Handle,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let io = self.write_async(ctx, handle, data, None)?;
        match self.wait_io(ctx, &io, timeout, false)? {
            Status::Timeout => {
                self.cancel_io(&io)?;
                self.wait_io(ctx, &io, None, false)?;
                let res = io.status.result().ok_or(Status::ProtocolError)?;
                if res.status == Status::Ok {
                    Ok(res.transferred)
                } else {
                    Err(Status::Timeout)
                }
            }
            _ => {
                let res = io.status.result().ok_or(Status::ProtocolError)?;
                res.status.check()?;
                Ok(res.transferred)
            }
        }
    }
}
