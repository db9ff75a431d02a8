//! Per-thread I/O state: the pending-operation slot table and the APC
//! queue, plus the status-block types shared with callers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use slab::Slab;

use axon_wire::{Handle, Result, Status};

/// Scalar arguments carried by a user APC.
pub type ApcArgs = [u64; 3];

/// A deferred callback queued to a specific thread. Runs only when that
/// thread reaches an alertable point, never on the queueing thread.
pub type ApcRoutine = Box<dyn FnOnce(ApcArgs) + Send + 'static>;

/// Invoked from APC context with the finished operation's result.
pub type CompletionRoutine = Box<dyn FnOnce(&IoResult) + Send + 'static>;

pub(crate) enum Apc {
    User { routine: ApcRoutine, args: ApcArgs },
    Io {
        routine: CompletionRoutine,
        iosb: Arc<IoStatusBlock>,
    },
}

/// The terminal report of one asynchronous operation.
#[derive(Clone, Debug)]
pub struct IoResult {
    pub status: Status,
    pub transferred: usize,
    pub data: Vec<u8>,
}

/// Caller-owned completion record, written at most once per submission.
///
/// `result()` is `None` until the operation finishes; afterwards it is
/// the one terminal status the operation resolved to, under any
/// interleaving of completion and cancellation.
#[derive(Default)]
pub struct IoStatusBlock {
    result: Mutex<Option<IoResult>>,
}

impl IoStatusBlock {
    pub fn result(&self) -> Option<IoResult> {
        self.result.lock().unwrap().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.result.lock().unwrap().is_some()
    }

    fn set(&self, res: IoResult) {
        let mut guard = self.result.lock().unwrap();
        if guard.is_some() {
            // The generation guard upstream makes this unreachable; if it
            // ever fires, the first result stands.
            log::error!("status block written twice (op status {:?})", res.status);
            return;
        }
        *guard = Some(res);
    }
}

/// An in-flight asynchronous operation, as returned by submission.
pub struct AsyncIo {
    pub handle: Handle,
    pub op: u64,
    pub thread: u64,
    pub status: Arc<IoStatusBlock>,
}

struct OpSlot {
    generation: u32,
    handle: Handle,
    iosb: Arc<IoStatusBlock>,
    routine: Option<CompletionRoutine>,
}

pub(crate) struct ThreadState {
    apcs: VecDeque<Apc>,
    wakes: HashMap<u64, Status>,
    ops: Slab<OpSlot>,
    // Parallel to slab indices; bumped when a slot is released so a stale
    // op id can never address a recycled slot.
    generations: Vec<u32>,
    max_ops: usize,
}

/// Per-thread context for waits, asynchronous I/O, and APC delivery.
///
/// Owned by the thread's runtime handle and passed by reference into the
/// connection APIs. The owning thread is the only thread APCs queued here
/// ever run on; other threads (including the notification reader) only
/// enqueue state and wake the condvar.
pub struct ThreadIoContext {
    id: u64,
    state: Mutex<ThreadState>,
    cv: Condvar,
}

const OP_INDEX_MASK: u64 = 0xffff_ffff;

// The low word is the slot index plus one: op id 0 is the wire's "no
// operation registered" sentinel and must never be produced.
fn op_id(index: usize, generation: u32) -> u64 {
    ((generation as u64) << 32) | (index as u64 + 1)
}

fn op_parts(op: u64) -> Option<(usize, u32)> {
    let index = (op & OP_INDEX_MASK) as usize;
    if index == 0 {
        return None;
    }
    Some((index - 1, (op >> 32) as u32))
}

impl ThreadIoContext {
    pub(crate) fn new(id: u64, max_ops: usize) -> Arc<ThreadIoContext> {
        Arc::new(ThreadIoContext {
            id,
            state: Mutex::new(ThreadState {
                apcs: VecDeque::new(),
                wakes: HashMap::new(),
                ops: Slab::new(),
                generations: Vec::new(),
                max_ops,
            }),
            cv: Condvar::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pending_ops(&self) -> usize {
        self.state.lock().unwrap().ops.len()
    }

    pub fn queued_apcs(&self) -> usize {
        self.state.lock().unwrap().apcs.len()
    }

    /// Reserve a slot for a submission. Fails with `OutOfResources`
    /// before anything reaches the broker.
    pub(crate) fn prepare_op(
        &self,
        handle: Handle,
        routine: Option<CompletionRoutine>,
    ) -> Result<AsyncIo> {
        let mut state = self.state.lock().unwrap();
        if state.ops.len() >= state.max_ops {
            return Err(Status::OutOfResources);
        }

        let iosb = Arc::new(IoStatusBlock::default());
        let index = state.ops.insert(OpSlot {
            generation: 0, // patched below once the index is known
            handle,
            iosb: iosb.clone(),
            routine,
        });
        if index >= state.generations.len() {
            state.generations.resize(index + 1, 0);
        }
        let generation = state.generations[index];
        state.ops[index].generation = generation;

        Ok(AsyncIo {
            handle,
            op: op_id(index, generation),
            thread: self.id,
            status: iosb,
        })
    }

    /// Undo a reservation whose request never reached the broker. The
    /// status block stays unwritten.
    pub(crate) fn rollback_op(&self, op: u64) {
        let mut state = self.state.lock().unwrap();
        let Some((index, generation)) = op_parts(op) else {
            log::error!("rollback of malformed op id {op:#x}");
            return;
        };
        match state.ops.get(index) {
            Some(slot) if slot.generation == generation => {
                state.ops.remove(index);
                state.generations[index] += 1;
            }
            _ => log::error!("rollback of unknown op {op:#x}"),
        }
    }

    /// The exactly-once terminal transition of an operation: unlink the
    /// slot, retire its generation, write the status block, then either
    /// queue the completion-routine APC or wake a synchronous waiter.
    ///
    /// A second call for the same op observes a generation mismatch and
    /// mutates nothing.
    pub(crate) fn finish_op(&self, op: u64, result: IoResult) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some((index, generation)) = op_parts(op) else {
            return false;
        };
        match state.ops.get(index) {
            Some(slot) if slot.generation == generation => {}
            _ => return false,
        }

        let slot = state.ops.remove(index);
        state.generations[index] += 1;
        slot.iosb.set(result);
        if let Some(routine) = slot.routine {
            state.apcs.push_back(Apc::Io {
                routine,
                iosb: slot.iosb,
            });
        }
        drop(state);
        self.cv.notify_all();
        true
    }

    /// Fail every pending operation; used when the connection is lost.
    pub(crate) fn fail_all_ops(&self) {
        let mut state = self.state.lock().unwrap();
        let ops: Vec<usize> = state.ops.iter().map(|(idx, _)| idx).collect();
        for index in ops {
            let slot = state.ops.remove(index);
            state.generations[index] += 1;
            slot.iosb.set(IoResult {
                status: Status::ConnectionLost,
                transferred: 0,
                data: Vec::new(),
            });
            if let Some(routine) = slot.routine {
                state.apcs.push_back(Apc::Io {
                    routine,
                    iosb: slot.iosb,
                });
            }
        }
        drop(state);
        self.cv.notify_all();
    }

    pub(crate) fn push_apc(&self, apc: Apc) {
        self.state.lock().unwrap().apcs.push_back(apc);
        self.cv.notify_all();
    }

    pub(crate) fn push_wake(&self, cookie: u64, status: Status) {
        self.state.lock().unwrap().wakes.insert(cookie, status);
        self.cv.notify_all();
    }

    pub(crate) fn has_apcs(&self) -> bool {
        !self.state.lock().unwrap().apcs.is_empty()
    }

    /// Run queued APCs, FIFO. Only the snapshot taken at drain start is
    /// executed; APCs queued while draining wait for the next alertable
    /// point. Returns how many ran.
    pub(crate) fn drain_apcs(&self) -> usize {
        let batch = std::mem::take(&mut self.state.lock().unwrap().apcs);
        let count = batch.len();
        for apc in batch {
            match apc {
                Apc::User { routine, args } => routine(args),
                Apc::Io { routine, iosb } => {
                    // The status block was written before the APC was
                    // queued, so the result is always present.
                    match iosb.result() {
                        Some(res) => routine(&res),
                        None => log::error!("completion APC with unwritten status block"),
                    }
                }
            }
        }
        count
    }

    pub(crate) fn lock_state(&self) -> std::sync::MutexGuard<'_, ThreadState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn cv(&self) -> &Condvar {
        &self.cv
    }
}

impl ThreadState {
    pub(crate) fn wake_for(&mut self, cookie: u64) -> Option<Status> {
        self.wakes.remove(&cookie)
    }

    pub(crate) fn has_apcs(&self) -> bool {
        !self.apcs.is_empty()
    }
}
