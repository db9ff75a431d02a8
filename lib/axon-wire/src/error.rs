//! The closed status-code space of the broker protocol.

pub type Result<T> = core::result::Result<T, Status>;

/// Every outcome a request, wait, or async operation can report.
///
/// The broker never coerces one code into another; the client library maps
/// transport failures to `ConnectionLost` and passes everything else
/// through unchanged.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(u16)]
pub enum Status {
    Ok = 0,
    /// The asynchronous path was taken; the result arrives later.
    Pending = 1,
    Timeout = 2,
    /// An alertable wait returned early to deliver queued APCs.
    Interrupted = 3,
    Cancelled = 4,
    /// A mutex was granted after its previous owner died holding it.
    Abandoned = 5,
    InvalidHandle = 6,
    AccessDenied = 7,
    NotOwner = 8,
    InvalidArgument = 9,
    NotFound = 10,
    OutOfResources = 11,
    BrokenPipe = 12,
    ProtocolError = 13,
    ConnectionLost = 14,
}

impl Status {
    pub fn from_u16(val: u16) -> Option<Status> {
        Some(match val {
            0 => Status::Ok,
            1 => Status::Pending,
            2 => Status::Timeout,
            3 => Status::Interrupted,
            4 => Status::Cancelled,
            5 => Status::Abandoned,
            6 => Status::InvalidHandle,
            7 => Status::AccessDenied,
            8 => Status::NotOwner,
            9 => Status::InvalidArgument,
            10 => Status::NotFound,
            11 => Status::OutOfResources,
            12 => Status::BrokenPipe,
            13 => Status::ProtocolError,
            14 => Status::ConnectionLost,
            _ => return None,
        })
    }

    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// `Ok(())` for `Status::Ok`, `Err(self)` otherwise.
    pub fn check(self) -> Result<()> {
        if self == Status::Ok {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl core::fmt::Display for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}
