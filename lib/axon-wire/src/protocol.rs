//! Typed request/reply/notification messages and their opcode-indexed
//! encodings.
//!
//! A request frame is `seq:u64, cmd:u16, payload`; the matching reply is
//! `seq:u64, status:u16, payload` where the payload shape is fixed by the
//! request's opcode and present only on `Status::Ok`. Notification frames
//! (broker to client, on the notification channel) are `kind:u16,
//! payload`. Decoding validates every field once; a failure is a protocol
//! violation and the peer is dropped.

use crate::codec::{put_bool, put_bytes, put_u16, put_u32, put_u64, put_u8, Cursor};
use crate::{Handle, ObjType, Result, Status};

// Opcodes. A closed set: an unknown value is a protocol violation.
pub const CMD_NOOP: u16 = 1;
pub const CMD_CREATE_EVENT: u16 = 2;
pub const CMD_CREATE_MUTEX: u16 = 3;
pub const CMD_CREATE_SEMAPHORE: u16 = 4;
pub const CMD_CREATE_PIPE: u16 = 5;
pub const CMD_OPEN_PROCESS: u16 = 6;
pub const CMD_NEW_PROCESS: u16 = 7;
pub const CMD_EXIT_PROCESS: u16 = 8;
pub const CMD_CLOSE: u16 = 9;
pub const CMD_DUP_HANDLE: u16 = 10;
pub const CMD_GET_HANDLE_INFO: u16 = 11;
pub const CMD_SET_HANDLE_INFO: u16 = 12;
pub const CMD_SET_EVENT: u16 = 13;
pub const CMD_RESET_EVENT: u16 = 14;
pub const CMD_RELEASE_MUTEX: u16 = 15;
pub const CMD_RELEASE_SEMAPHORE: u16 = 16;
pub const CMD_WAIT: u16 = 17;
pub const CMD_CANCEL_WAIT: u16 = 18;
pub const CMD_READ: u16 = 19;
pub const CMD_WRITE: u16 = 20;
pub const CMD_CANCEL_IO: u16 = 21;
pub const CMD_QUERY_OBJECT: u16 = 22;

// Notification kinds.
const NOTE_WAKE: u16 = 1;
const NOTE_IO_COMPLETE: u16 = 2;

// Hello kinds.
pub const HELLO_REQUEST: u16 = 1;
pub const HELLO_NOTIFY: u16 = 2;

/// First frame on every stream: binds it to a process record.
///
/// `pid == 0` on a request stream asks for a fresh record; a nonzero
/// `pid` plus the matching `token` attaches to a pre-created one (the
/// child side of process creation). Notification streams always carry
/// the pid/token returned by the request-stream handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hello {
    pub kind: u16,
    pub pid: u64,
    pub token: u64,
}

impl Hello {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(18);
        put_u16(&mut buf, self.kind);
        put_u64(&mut buf, self.pid);
        put_u64(&mut buf, self.token);
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Hello> {
        let mut cur = Cursor::new(body);
        let kind = cur.get_u16()?;
        if kind != HELLO_REQUEST && kind != HELLO_NOTIFY {
            return Err(Status::ProtocolError);
        }
        let pid = cur.get_u64()?;
        let token = cur.get_u64()?;
        cur.finish()?;
        Ok(Hello { kind, pid, token })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Noop,
    CreateEvent {
        access: u32,
        manual_reset: bool,
        signaled: bool,
    },
    CreateMutex {
        access: u32,
        owned: bool,
        thread: u64,
    },
    CreateSemaphore {
        access: u32,
        initial: u32,
        max: u32,
    },
    CreatePipe {
        capacity: u32,
    },
    OpenProcess {
        pid: u64,
        access: u32,
    },
    NewProcess,
    ExitProcess {
        code: i32,
    },
    Close {
        handle: Handle,
    },
    Duplicate {
        src_process: Handle,
        src_handle: Handle,
        dst_process: Handle,
        access: u32,
        inherit: bool,
        options: u32,
    },
    GetHandleInfo {
        handle: Handle,
    },
    SetHandleInfo {
        handle: Handle,
        mask: u32,
        flags: u32,
    },
    SetEvent {
        handle: Handle,
    },
    ResetEvent {
        handle: Handle,
    },
    ReleaseMutex {
        handle: Handle,
        thread: u64,
    },
    ReleaseSemaphore {
        handle: Handle,
        count: u32,
    },
    Wait {
        handle: Handle,
        timeout_ms: u32,
        cookie: u64,
        thread: u64,
    },
    CancelWait {
        cookie: u64,
    },
    Read {
        handle: Handle,
        len: u32,
        op: u64,
        thread: u64,
    },
    Write {
        handle: Handle,
        op: u64,
        thread: u64,
        data: Vec<u8>,
    },
    CancelIo {
        handle: Handle,
        op: u64,
        thread: u64,
    },
    QueryObject {
        handle: Handle,
    },
}

impl Request {
    pub fn cmd(&self) -> u16 {
        match self {
            Request::Noop => CMD_NOOP,
            Request::CreateEvent { .. } => CMD_CREATE_EVENT,
            Request::CreateMutex { .. } => CMD_CREATE_MUTEX,
            Request::CreateSemaphore { .. } => CMD_CREATE_SEMAPHORE,
            Request::CreatePipe { .. } => CMD_CREATE_PIPE,
            Request::OpenProcess { .. } => CMD_OPEN_PROCESS,
            Request::NewProcess => CMD_NEW_PROCESS,
            Request::ExitProcess { .. } => CMD_EXIT_PROCESS,
            Request::Close { .. } => CMD_CLOSE,
            Request::Duplicate { .. } => CMD_DUP_HANDLE,
            Request::GetHandleInfo { .. } => CMD_GET_HANDLE_INFO,
            Request::SetHandleInfo { .. } => CMD_SET_HANDLE_INFO,
            Request::SetEvent { .. } => CMD_SET_EVENT,
            Request::ResetEvent { .. } => CMD_RESET_EVENT,
            Request::ReleaseMutex { .. } => CMD_RELEASE_MUTEX,
            Request::ReleaseSemaphore { .. } => CMD_RELEASE_SEMAPHORE,
            Request::Wait { .. } => CMD_WAIT,
            Request::CancelWait { .. } => CMD_CANCEL_WAIT,
            Request::Read { .. } => CMD_READ,
            Request::Write { .. } => CMD_WRITE,
            Request::CancelIo { .. } => CMD_CANCEL_IO,
            Request::QueryObject { .. } => CMD_QUERY_OBJECT,
        }
    }

    pub fn encode(&self, seq: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        put_u64(&mut buf, seq);
        put_u16(&mut buf, self.cmd());
        match self {
            Request::Noop | Request::NewProcess => {}
            Request::CreateEvent {
                access,
                manual_reset,
                signaled,
            } => {
                put_u32(&mut buf, *access);
                put_bool(&mut buf, *manual_reset);
                put_bool(&mut buf, *signaled);
            }
            Request::CreateMutex {
                access,
                owned,
                thread,
            } => {
                put_u32(&mut buf, *access);
                put_bool(&mut buf, *owned);
                put_u64(&mut buf, *thread);
            }
            Request::CreateSemaphore {
                access,
                initial,
                max,
            } => {
                put_u32(&mut buf, *access);
                put_u32(&mut buf, *initial);
                put_u32(&mut buf, *max);
            }
            Request::CreatePipe { capacity } => put_u32(&mut buf, *capacity),
            Request::OpenProcess { pid, access } => {
                put_u64(&mut buf, *pid);
                put_u32(&mut buf, *access);
            }
            Request::ExitProcess { code } => put_u32(&mut buf, *code as u32),
            Request::Close { handle }
            | Request::GetHandleInfo { handle }
            | Request::SetEvent { handle }
            | Request::ResetEvent { handle }
            | Request::QueryObject { handle } => put_u32(&mut buf, handle.as_u32()),
            Request::Duplicate {
                src_process,
                src_handle,
                dst_process,
                access,
                inherit,
                options,
            } => {
                put_u32(&mut buf, src_process.as_u32());
                put_u32(&mut buf, src_handle.as_u32());
                put_u32(&mut buf, dst_process.as_u32());
                put_u32(&mut buf, *access);
                put_bool(&mut buf, *inherit);
                put_u32(&mut buf, *options);
            }
            Request::SetHandleInfo {
                handle,
                mask,
                flags,
            } => {
                put_u32(&mut buf, handle.as_u32());
                put_u32(&mut buf, *mask);
                put_u32(&mut buf, *flags);
            }
            Request::ReleaseMutex { handle, thread } => {
                put_u32(&mut buf, handle.as_u32());
                put_u64(&mut buf, *thread);
            }
            Request::ReleaseSemaphore { handle, count } => {
                put_u32(&mut buf, handle.as_u32());
                put_u32(&mut buf, *count);
            }
            Request::Wait {
                handle,
                timeout_ms,
                cookie,
                thread,
            } => {
                put_u32(&mut buf, handle.as_u32());
                put_u32(&mut buf, *timeout_ms);
                put_u64(&mut buf, *cookie);
                put_u64(&mut buf, *thread);
            }
            Request::CancelWait { cookie } => put_u64(&mut buf, *cookie),
            Request::Read {
                handle,
                len,
                op,
                thread,
            } => {
                put_u32(&mut buf, handle.as_u32());
                put_u32(&mut buf, *len);
                put_u64(&mut buf, *op);
                put_u64(&mut buf, *thread);
            }
            Request::Write {
                handle,
                op,
                thread,
                data,
            } => {
                put_u32(&mut buf, handle.as_u32());
                put_u64(&mut buf, *op);
                put_u64(&mut buf, *thread);
                put_bytes(&mut buf, data);
            }
            Request::CancelIo { handle, op, thread } => {
                put_u32(&mut buf, handle.as_u32());
                put_u64(&mut buf, *op);
                put_u64(&mut buf, *thread);
            }
        }
        buf
    }

    pub fn decode(body: &[u8]) -> Result<(u64, Request)> {
        let mut cur = Cursor::new(body);
        let seq = cur.get_u64()?;
        let cmd = cur.get_u16()?;
        let req = match cmd {
            CMD_NOOP => Request::Noop,
            CMD_NEW_PROCESS => Request::NewProcess,
            CMD_CREATE_EVENT => Request::CreateEvent {
                access: cur.get_u32()?,
                manual_reset: cur.get_bool()?,
                signaled: cur.get_bool()?,
            },
            CMD_CREATE_MUTEX => Request::CreateMutex {
                access: cur.get_u32()?,
                owned: cur.get_bool()?,
                thread: cur.get_u64()?,
            },
            CMD_CREATE_SEMAPHORE => Request::CreateSemaphore {
                access: cur.get_u32()?,
                initial: cur.get_u32()?,
                max: cur.get_u32()?,
            },
            CMD_CREATE_PIPE => Request::CreatePipe {
                capacity: cur.get_u32()?,
            },
            CMD_OPEN_PROCESS => Request::OpenProcess {
                pid: cur.get_u64()?,
                access: cur.get_u32()?,
            },
            CMD_EXIT_PROCESS => Request::ExitProcess {
                code: cur.get_u32()? as i32,
            },
            CMD_CLOSE => Request::Close {
                handle: cur.get_u32()?.into(),
            },
            CMD_DUP_HANDLE => Request::Duplicate {
                src_process: cur.get_u32()?.into(),
                src_handle: cur.get_u32()?.into(),
                dst_process: cur.get_u32()?.into(),
                access: cur.get_u32()?,
                inherit: cur.get_bool()?,
                options: cur.get_u32()?,
            },
            CMD_GET_HANDLE_INFO => Request::GetHandleInfo {
                handle: cur.get_u32()?.into(),
            },
            CMD_SET_HANDLE_INFO => Request::SetHandleInfo {
                handle: cur.get_u32()?.into(),
                mask: cur.get_u32()?,
                flags: cur.get_u32()?,
            },
            CMD_SET_EVENT => Request::SetEvent {
                handle: cur.get_u32()?.into(),
            },
            CMD_RESET_EVENT => Request::ResetEvent {
                handle: cur.get_u32()?.into(),
            },
            CMD_RELEASE_MUTEX => Request::ReleaseMutex {
                handle: cur.get_u32()?.into(),
                thread: cur.get_u64()?,
            },
            CMD_RELEASE_SEMAPHORE => Request::ReleaseSemaphore {
                handle: cur.get_u32()?.into(),
                count: cur.get_u32()?,
            },
            CMD_WAIT => Request::Wait {
                handle: cur.get_u32()?.into(),
                timeout_ms: cur.get_u32()?,
                cookie: cur.get_u64()?,
                thread: cur.get_u64()?,
            },
            CMD_CANCEL_WAIT => Request::CancelWait {
                cookie: cur.get_u64()?,
            },
            CMD_READ => Request::Read {
                handle: cur.get_u32()?.into(),
                len: cur.get_u32()?,
                op: cur.get_u64()?,
                thread: cur.get_u64()?,
            },
            CMD_WRITE => Request::Write {
                handle: cur.get_u32()?.into(),
                op: cur.get_u64()?,
                thread: cur.get_u64()?,
                data: cur.get_bytes()?,
            },
            CMD_CANCEL_IO => Request::CancelIo {
                handle: cur.get_u32()?.into(),
                op: cur.get_u64()?,
                thread: cur.get_u64()?,
            },
            CMD_QUERY_OBJECT => Request::QueryObject {
                handle: cur.get_u32()?.into(),
            },
            _ => {
                log::warn!("request decode: unknown opcode {cmd}");
                return Err(Status::ProtocolError);
            }
        };
        cur.finish()?;
        Ok((seq, req))
    }
}

/// The typed payload of a successful reply. Its shape is fixed by the
/// request opcode; error replies never carry one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyBody {
    None,
    Handle {
        handle: Handle,
    },
    HandlePair {
        read: Handle,
        write: Handle,
    },
    /// NewProcess: the pre-created record the child attaches to.
    Process {
        pid: u64,
        token: u64,
        handle: Handle,
    },
    HandleInfo {
        access: u32,
        flags: u32,
    },
    /// ReleaseSemaphore: the count before the release.
    Prev {
        prev: u32,
    },
    /// A read that completed synchronously.
    Data {
        data: Vec<u8>,
    },
    /// A write that completed synchronously.
    Written {
        len: u32,
    },
    Query {
        obj_type: ObjType,
        refcount: u32,
        signaled: bool,
        id: u64,
        extra: u64,
    },
    /// Handshake reply carrying the session identity.
    Session {
        pid: u64,
        token: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub seq: u64,
    pub status: Status,
    pub body: ReplyBody,
}

impl Reply {
    pub fn new(seq: u64, status: Status, body: ReplyBody) -> Reply {
        debug_assert!(status == Status::Ok || matches!(body, ReplyBody::None));
        Reply { seq, status, body }
    }

    pub fn error(seq: u64, status: Status) -> Reply {
        Reply::new(seq, status, ReplyBody::None)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        put_u64(&mut buf, self.seq);
        put_u16(&mut buf, self.status.as_u16());
        match &self.body {
            ReplyBody::None => {}
            ReplyBody::Handle { handle } => put_u32(&mut buf, handle.as_u32()),
            ReplyBody::HandlePair { read, write } => {
                put_u32(&mut buf, read.as_u32());
                put_u32(&mut buf, write.as_u32());
            }
            ReplyBody::Process { pid, token, handle } => {
                put_u64(&mut buf, *pid);
                put_u64(&mut buf, *token);
                put_u32(&mut buf, handle.as_u32());
            }
            ReplyBody::HandleInfo { access, flags } => {
                put_u32(&mut buf, *access);
                put_u32(&mut buf, *flags);
            }
            ReplyBody::Prev { prev } => put_u32(&mut buf, *prev),
            ReplyBody::Data { data } => put_bytes(&mut buf, data),
            ReplyBody::Written { len } => put_u32(&mut buf, *len),
            ReplyBody::Query {
                obj_type,
                refcount,
                signaled,
                id,
                extra,
            } => {
                put_u8(&mut buf, *obj_type as u8);
                put_u32(&mut buf, *refcount);
                put_bool(&mut buf, *signaled);
                put_u64(&mut buf, *id);
                put_u64(&mut buf, *extra);
            }
            ReplyBody::Session { pid, token } => {
                put_u64(&mut buf, *pid);
                put_u64(&mut buf, *token);
            }
        }
        buf
    }

    /// Decode a reply to a request with opcode `cmd` (`0` for the
    /// handshake, whose body is `Session`).
    pub fn decode(body: &[u8], cmd: u16) -> Result<Reply> {
        let mut cur = Cursor::new(body);
        let seq = cur.get_u64()?;
        let status = Status::from_u16(cur.get_u16()?).ok_or(Status::ProtocolError)?;

        let body = if status != Status::Ok {
            ReplyBody::None
        } else {
            match cmd {
                0 => ReplyBody::Session {
                    pid: cur.get_u64()?,
                    token: cur.get_u64()?,
                },
                CMD_CREATE_EVENT | CMD_CREATE_MUTEX | CMD_CREATE_SEMAPHORE | CMD_OPEN_PROCESS
                | CMD_DUP_HANDLE => ReplyBody::Handle {
                    handle: cur.get_u32()?.into(),
                },
                CMD_CREATE_PIPE => ReplyBody::HandlePair {
                    read: cur.get_u32()?.into(),
                    write: cur.get_u32()?.into(),
                },
                CMD_NEW_PROCESS => ReplyBody::Process {
                    pid: cur.get_u64()?,
                    token: cur.get_u64()?,
                    handle: cur.get_u32()?.into(),
                },
                CMD_GET_HANDLE_INFO => ReplyBody::HandleInfo {
                    access: cur.get_u32()?,
                    flags: cur.get_u32()?,
                },
                CMD_RELEASE_SEMAPHORE => ReplyBody::Prev {
                    prev: cur.get_u32()?,
                },
                CMD_READ => ReplyBody::Data {
                    data: cur.get_bytes()?,
                },
                CMD_WRITE => ReplyBody::Written {
                    len: cur.get_u32()?,
                },
                CMD_QUERY_OBJECT => ReplyBody::Query {
                    obj_type: ObjType::from_u8(cur.get_u8()?).ok_or(Status::ProtocolError)?,
                    refcount: cur.get_u32()?,
                    signaled: cur.get_bool()?,
                    id: cur.get_u64()?,
                    extra: cur.get_u64()?,
                },
                CMD_NOOP | CMD_EXIT_PROCESS | CMD_CLOSE | CMD_SET_HANDLE_INFO | CMD_SET_EVENT
                | CMD_RESET_EVENT | CMD_RELEASE_MUTEX | CMD_WAIT | CMD_CANCEL_WAIT
                | CMD_CANCEL_IO => ReplyBody::None,
                _ => return Err(Status::ProtocolError),
            }
        };
        cur.finish()?;
        Ok(Reply { seq, status, body })
    }
}

/// Unsolicited broker-to-client messages on the notification channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    /// A registered wait was satisfied (or the object was abandoned).
    Wake {
        thread: u64,
        cookie: u64,
        status: Status,
    },
    /// The single terminal report for an async operation that went
    /// pending: natural completion, error, or cancellation.
    IoComplete {
        thread: u64,
        op: u64,
        status: Status,
        transferred: u32,
        data: Vec<u8>,
    },
}

impl Notification {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        match self {
            Notification::Wake {
                thread,
                cookie,
                status,
            } => {
                put_u16(&mut buf, NOTE_WAKE);
                put_u64(&mut buf, *thread);
                put_u64(&mut buf, *cookie);
                put_u16(&mut buf, status.as_u16());
            }
            Notification::IoComplete {
                thread,
                op,
                status,
                transferred,
                data,
            } => {
                put_u16(&mut buf, NOTE_IO_COMPLETE);
                put_u64(&mut buf, *thread);
                put_u64(&mut buf, *op);
                put_u16(&mut buf, status.as_u16());
                put_u32(&mut buf, *transferred);
                put_bytes(&mut buf, data);
            }
        }
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Notification> {
        let mut cur = Cursor::new(body);
        let note = match cur.get_u16()? {
            NOTE_WAKE => Notification::Wake {
                thread: cur.get_u64()?,
                cookie: cur.get_u64()?,
                status: Status::from_u16(cur.get_u16()?).ok_or(Status::ProtocolError)?,
            },
            NOTE_IO_COMPLETE => Notification::IoComplete {
                thread: cur.get_u64()?,
                op: cur.get_u64()?,
                status: Status::from_u16(cur.get_u16()?).ok_or(Status::ProtocolError)?,
                transferred: cur.get_u32()?,
                data: cur.get_bytes()?,
            },
            kind => {
                log::warn!("notification decode: unknown kind {kind}");
                return Err(Status::ProtocolError);
            }
        };
        cur.finish()?;
        Ok(note)
    }
}
