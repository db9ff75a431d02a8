//! Per-process broker state: the authoritative handle table and the
//! channels back to the client.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;

use axon_wire::{Handle, Status};

use crate::objects::ObjId;

#[derive(Clone, Copy, Debug)]
pub struct HandleEntry {
    pub obj: ObjId,
    pub access: u32,
    pub flags: u32,
}

/// Handle values are small nonzero integers. A freed value is recycled
/// only after its close request completed, which holds by construction:
/// close removes the entry before the reply is sent.
pub struct HandleTable {
    slots: HashMap<u32, HandleEntry>,
    free: Vec<u32>,
    next: u32,
    cap: usize,
}

impl HandleTable {
    pub fn new(cap: usize) -> HandleTable {
        HandleTable {
            slots: HashMap::new(),
            free: Vec::new(),
            next: 1,
            cap,
        }
    }

    pub fn alloc(&mut self, entry: HandleEntry) -> Result<Handle, Status> {
        if self.slots.len() >= self.cap {
            return Err(Status::OutOfResources);
        }
        let value = match self.free.pop() {
            Some(value) => value,
            None => {
                let value = self.next;
                self.next += 1;
                value
            }
        };
        self.slots.insert(value, entry);
        Ok(Handle::from_u32(value))
    }

    /// Allocate a specific value (handle inheritance preserves the
    /// creator's values). Fails if the value is unusable or taken.
    pub fn alloc_value(&mut self, handle: Handle, entry: HandleEntry) -> Result<(), Status> {
        let value = handle.as_u32();
        if value == 0 || value == u32::MAX {
            return Err(Status::InvalidArgument);
        }
        if self.slots.len() >= self.cap {
            return Err(Status::OutOfResources);
        }
        if self.slots.contains_key(&value) {
            return Err(Status::InvalidArgument);
        }
        if value >= self.next {
            for gap in self.next..value {
                self.free.push(gap);
            }
            self.next = value + 1;
        } else {
            self.free.retain(|v| *v != value);
        }
        self.slots.insert(value, entry);
        Ok(())
    }

    pub fn get(&self, handle: Handle) -> Option<&HandleEntry> {
        self.slots.get(&handle.as_u32())
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut HandleEntry> {
        self.slots.get_mut(&handle.as_u32())
    }

    pub fn remove(&mut self, handle: Handle) -> Option<HandleEntry> {
        let entry = self.slots.remove(&handle.as_u32())?;
        self.free.push(handle.as_u32());
        Some(entry)
    }

    pub fn drain(&mut self) -> Vec<(Handle, HandleEntry)> {
        let out = self
            .slots
            .drain()
            .map(|(v, e)| (Handle::from_u32(v), e))
            .collect();
        self.free.clear();
        self.next = 1;
        out
    }
}

/// One client process, attached or pre-created for attachment.
pub struct Process {
    pub pid: u64,
    pub token: u64,
    /// Its own process object (pinned by this record for the broker's
    /// lifetime, so late opens and waits keep working after exit).
    pub object: ObjId,
    pub handles: HandleTable,
    /// True between attach and hangup.
    pub connected: bool,
    pub attached: bool,
    pub request_tx: Option<UnixStream>,
    pub notify_tx: Option<UnixStream>,
    /// (thread, op) of every pending async operation, for cancellation
    /// and teardown.
    pub pending_ops: HashMap<(u64, u64), ObjId>,
    /// Registered waits by cookie, for cancellation and teardown.
    pub pending_waits: HashMap<u64, ObjId>,
}

impl Process {
    pub fn new(pid: u64, token: u64, object: ObjId, max_handles: usize) -> Process {
        Process {
            pid,
            token,
            object,
            handles: HandleTable::new(max_handles),
            connected: false,
            attached: false,
            request_tx: None,
            notify_tx: None,
            pending_ops: HashMap::new(),
            pending_waits: HashMap::new(),
        }
    }
}
