//! Wire protocol shared by the Axon broker and its client library.
//!
//! Everything that crosses the process boundary is defined here: the
//! status-code space, the frame codec, and the typed request/reply/
//! notification messages. Payloads are validated once, at decode time;
//! nothing downstream reinterprets raw bytes.

mod codec;
mod error;
mod protocol;

pub use codec::{read_frame, write_frame, MAX_FRAME};
pub use error::{Result, Status};
pub use protocol::{
    Hello, Notification, Reply, ReplyBody, Request, HELLO_NOTIFY, HELLO_REQUEST,
};

/// A process-local capability naming one broker-side object.
///
/// Small nonzero integers, allocated by the broker per connection. The
/// value space is never shared between processes; only duplication moves
/// an object from one table to another.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct Handle(u32);

impl Handle {
    pub const NONE: Handle = Handle(0);
    /// Pseudo-handle meaning "the calling process" in duplication requests.
    pub const SELF: Handle = Handle(u32::MAX);

    pub const fn from_u32(val: u32) -> Self {
        Handle(val)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for Handle {
    fn from(val: u32) -> Self {
        Handle(val)
    }
}

impl From<Handle> for u32 {
    fn from(val: Handle) -> u32 {
        val.0
    }
}

// Access mask bits. An operation whose required bit is absent from the
// handle's mask fails with Status::AccessDenied.
pub const ACCESS_SYNCHRONIZE: u32 = 1 << 0;
pub const ACCESS_MODIFY: u32 = 1 << 1;
pub const ACCESS_READ: u32 = 1 << 2;
pub const ACCESS_WRITE: u32 = 1 << 3;
pub const ACCESS_DUP: u32 = 1 << 4;
pub const ACCESS_QUERY: u32 = 1 << 5;
pub const ACCESS_ALL: u32 = 0x3f;

// Per-handle flags, toggled via set_handle_info without touching the
// object's reference count.
pub const HANDLE_FLAG_INHERIT: u32 = 1 << 0;
pub const HANDLE_FLAG_PROTECT_FROM_CLOSE: u32 = 1 << 1;
pub const HANDLE_FLAG_ALL: u32 = 0x3;

// Duplication options.
pub const DUP_SAME_ACCESS: u32 = 1 << 0;
pub const DUP_CLOSE_SOURCE: u32 = 1 << 1;
/// Allocate the same numeric value in the destination table. Used by the
/// handle-inheritance loop so a child addresses inherited handles by the
/// creator's values.
pub const DUP_SAME_VALUE: u32 = 1 << 2;

/// Object type tag, as reported by query_object.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ObjType {
    Event = 1,
    Mutex = 2,
    Semaphore = 3,
    Pipe = 4,
    Process = 5,
}

impl ObjType {
    pub fn from_u8(val: u8) -> Option<ObjType> {
        match val {
            1 => Some(ObjType::Event),
            2 => Some(ObjType::Mutex),
            3 => Some(ObjType::Semaphore),
            4 => Some(ObjType::Pipe),
            5 => Some(ObjType::Process),
            _ => None,
        }
    }
}

/// Largest read/write the broker accepts in a single operation.
pub const MAX_IO_BYTES: usize = 64 * 1024;

/// Wait forever.
pub const TIMEOUT_INFINITE: u32 = u32::MAX;
