//! The canonical object store: every live kernel object, its reference
//! count, its signal state, and its type payload. Only the broker state
//! thread ever touches it, so each request mutates objects as one atomic
//! unit without locks.

use std::collections::{HashMap, VecDeque};

use axon_wire::{Handle, ObjType, Status};

pub type ObjId = u64;

/// A registered wait, parked until the object signals. The registration
/// pins the object (one reference) for as long as it is queued.
#[derive(Clone, Copy, Debug)]
pub struct Waiter {
    pub pid: u64,
    pub thread: u64,
    pub cookie: u64,
}

#[derive(Debug)]
pub enum IoKind {
    Read { len: usize },
    Write { data: Vec<u8>, written: usize },
}

/// A queued pipe operation that could not complete at submission.
#[derive(Debug)]
pub struct PendingIo {
    pub pid: u64,
    pub thread: u64,
    pub op: u64,
    pub handle: Handle,
    pub kind: IoKind,
}

/// A finished pipe operation, ready to be reported to its submitter.
#[derive(Debug)]
pub struct IoDone {
    pub pid: u64,
    pub thread: u64,
    pub op: u64,
    pub status: Status,
    pub transferred: u32,
    pub data: Vec<u8>,
}

impl IoDone {
    fn from_io(io: &PendingIo, status: Status, transferred: u32, data: Vec<u8>) -> IoDone {
        IoDone {
            pid: io.pid,
            thread: io.thread,
            op: io.op,
            status,
            transferred,
            data,
        }
    }
}

/// Byte-stream pipe state. `readers`/`writers` count live handles with
/// the respective access bit, across all processes.
#[derive(Debug)]
pub struct Pipe {
    buf: VecDeque<u8>,
    capacity: usize,
    pub readers: u32,
    pub writers: u32,
    pub pending_reads: VecDeque<PendingIo>,
    pub pending_writes: VecDeque<PendingIo>,
}

impl Pipe {
    pub fn new(capacity: usize) -> Pipe {
        Pipe {
            buf: VecDeque::new(),
            capacity,
            readers: 0,
            writers: 0,
            pending_reads: VecDeque::new(),
            pending_writes: VecDeque::new(),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn space(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Readable means a wait on the pipe does not block: data is
    /// buffered, or end-of-stream is reached.
    pub fn readable(&self) -> bool {
        !self.buf.is_empty() || self.writers == 0
    }

    /// Move bytes until nothing progresses: queued writes drain into the
    /// buffer, buffered bytes satisfy queued reads (a read completes with
    /// at least one byte, or zero bytes at end-of-stream), and writes
    /// with no remaining readers fail. Returns every operation that
    /// reached its terminal state.
    pub fn pump(&mut self) -> Vec<IoDone> {
        let mut done = Vec::new();
        loop {
            let mut progress = false;

            while self.buf.len() < self.capacity {
                let Some(io) = self.pending_writes.front_mut() else {
                    break;
                };
                let IoKind::Write { data, written } = &mut io.kind else {
                    unreachable!("read queued on the write list");
                };
                let n = (self.capacity - self.buf.len()).min(data.len() - *written);
                if n > 0 {
                    self.buf.extend(&data[*written..*written + n]);
                    *written += n;
                    progress = true;
                }
                if *written == data.len() {
                    let total = data.len() as u32;
                    let io = self.pending_writes.pop_front().unwrap();
                    done.push(IoDone::from_io(&io, Status::Ok, total, Vec::new()));
                } else {
                    break;
                }
            }

            while let Some(io) = self.pending_reads.front() {
                let IoKind::Read { len } = io.kind else {
                    unreachable!("write queued on the read list");
                };
                if !self.buf.is_empty() {
                    let n = len.min(self.buf.len());
                    let data: Vec<u8> = self.buf.drain(..n).collect();
                    let io = self.pending_reads.pop_front().unwrap();
                    done.push(IoDone::from_io(&io, Status::Ok, n as u32, data));
                    progress = true;
                } else if self.writers == 0 && self.pending_writes.is_empty() {
                    // End of stream: zero-byte completion.
                    let io = self.pending_reads.pop_front().unwrap();
                    done.push(IoDone::from_io(&io, Status::Ok, 0, Vec::new()));
                } else {
                    break;
                }
            }

            if !progress {
                break;
            }
        }

        if self.readers == 0 {
            for io in self.pending_writes.drain(..) {
                let written = match &io.kind {
                    IoKind::Write { written, .. } => *written as u32,
                    IoKind::Read { .. } => 0,
                };
                done.push(IoDone::from_io(&io, Status::BrokenPipe, written, Vec::new()));
            }
        }

        done
    }

    /// Remove one queued operation; `true` if it was still pending.
    pub fn cancel(&mut self, pid: u64, thread: u64, op: u64) -> Option<PendingIo> {
        let matches =
            |io: &PendingIo| io.pid == pid && io.thread == thread && io.op == op;
        if let Some(pos) = self.pending_reads.iter().position(matches) {
            return self.pending_reads.remove(pos);
        }
        if let Some(pos) = self.pending_writes.iter().position(matches) {
            return self.pending_writes.remove(pos);
        }
        None
    }

    /// Remove every operation a process submitted through one handle;
    /// used when that handle is closed.
    pub fn cancel_for_handle(&mut self, pid: u64, handle: Handle) -> Vec<PendingIo> {
        let mut removed = Vec::new();
        let keep = |io: &PendingIo| !(io.pid == pid && io.handle == handle);
        for list in [&mut self.pending_reads, &mut self.pending_writes] {
            let mut kept = VecDeque::new();
            for io in list.drain(..) {
                if keep(&io) {
                    kept.push_back(io);
                } else {
                    removed.push(io);
                }
            }
            *list = kept;
        }
        removed
    }

    /// Remove every operation a process submitted; used when the process
    /// dies (nobody is left to report to).
    pub fn cancel_for_pid(&mut self, pid: u64) {
        self.pending_reads.retain(|io| io.pid != pid);
        self.pending_writes.retain(|io| io.pid != pid);
    }
}

#[derive(Debug)]
pub enum Payload {
    Event {
        manual_reset: bool,
        signaled: bool,
    },
    Mutex {
        owner: Option<(u64, u64)>,
        count: u32,
        abandoned: bool,
    },
    Semaphore {
        count: u32,
        max: u32,
    },
    Pipe(Pipe),
    Process {
        pid: u64,
        exited: bool,
        exit_code: i32,
    },
}

#[derive(Debug)]
pub struct Object {
    pub id: ObjId,
    pub refcount: u32,
    pub payload: Payload,
    pub waiters: VecDeque<Waiter>,
}

impl Object {
    pub fn obj_type(&self) -> ObjType {
        match self.payload {
            Payload::Event { .. } => ObjType::Event,
            Payload::Mutex { .. } => ObjType::Mutex,
            Payload::Semaphore { .. } => ObjType::Semaphore,
            Payload::Pipe(_) => ObjType::Pipe,
            Payload::Process { .. } => ObjType::Process,
        }
    }

    /// Non-consuming signal-state view, for queries.
    pub fn signaled(&self) -> bool {
        match &self.payload {
            Payload::Event { signaled, .. } => *signaled,
            Payload::Mutex { owner, .. } => owner.is_none(),
            Payload::Semaphore { count, .. } => *count > 0,
            Payload::Pipe(pipe) => pipe.readable(),
            Payload::Process { exited, .. } => *exited,
        }
    }

    /// Try to satisfy a wait by `(pid, thread)` right now, consuming the
    /// signal per type semantics. `None` means the waiter must block.
    pub fn try_acquire(&mut self, pid: u64, thread: u64) -> Option<Status> {
        match &mut self.payload {
            Payload::Event {
                manual_reset,
                signaled,
            } => {
                if !*signaled {
                    return None;
                }
                if !*manual_reset {
                    *signaled = false;
                }
                Some(Status::Ok)
            }
            Payload::Mutex {
                owner,
                count,
                abandoned,
            } => match owner {
                None => {
                    *owner = Some((pid, thread));
                    *count = 1;
                    if *abandoned {
                        *abandoned = false;
                        Some(Status::Abandoned)
                    } else {
                        Some(Status::Ok)
                    }
                }
                Some(cur) if *cur == (pid, thread) => {
                    *count += 1;
                    Some(Status::Ok)
                }
                Some(_) => None,
            },
            Payload::Semaphore { count, .. } => {
                if *count == 0 {
                    return None;
                }
                *count -= 1;
                Some(Status::Ok)
            }
            Payload::Pipe(pipe) => pipe.readable().then_some(Status::Ok),
            Payload::Process { exited, .. } => exited.then_some(Status::Ok),
        }
    }
}

pub struct Store {
    objects: HashMap<ObjId, Object>,
    next_id: ObjId,
    max_objects: usize,
}

impl Store {
    pub fn new(max_objects: usize) -> Store {
        Store {
            objects: HashMap::new(),
            next_id: 1,
            max_objects,
        }
    }

    /// Insert with a zero reference count; the caller grabs references
    /// as it hands out handles (or pins).
    pub fn insert(&mut self, payload: Payload) -> Result<ObjId, Status> {
        if self.objects.len() >= self.max_objects {
            return Err(Status::OutOfResources);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.objects.insert(
            id,
            Object {
                id,
                refcount: 0,
                payload,
                waiters: VecDeque::new(),
            },
        );
        Ok(id)
    }

    /// Drop an object nothing ever referenced (creation rollback).
    pub fn forget(&mut self, id: ObjId) {
        if let Some(obj) = self.objects.remove(&id) {
            debug_assert_eq!(obj.refcount, 0);
        }
    }

    pub fn get(&self, id: ObjId) -> Option<&Object> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjId) -> Option<&mut Object> {
        self.objects.get_mut(&id)
    }

    pub fn grab(&mut self, id: ObjId) {
        self.objects
            .get_mut(&id)
            .expect("grab of a dead object")
            .refcount += 1;
    }

    /// Drop one reference; returns the object if that was the last one.
    pub fn release(&mut self, id: ObjId) -> Option<Object> {
        let obj = self.objects.get_mut(&id).expect("release of a dead object");
        debug_assert!(obj.refcount > 0);
        obj.refcount -= 1;
        if obj.refcount == 0 {
            self.objects.remove(&id)
        } else {
            None
        }
    }

    /// Object ids of every mutex currently owned by a thread of `pid`.
    pub fn mutexes_owned_by(&self, pid: u64) -> Vec<ObjId> {
        self.objects
            .values()
            .filter(|obj| {
                matches!(obj.payload, Payload::Mutex { owner: Some((p, _)), .. } if p == pid)
            })
            .map(|obj| obj.id)
            .collect()
    }
}
