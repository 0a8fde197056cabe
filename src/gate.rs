//! Keyed, reentrant write gate.
//!
//! The gate serializes writes to the outbound stream. Ownership is keyed by
//! an identifier instead of a thread, since a multi-step Bind holds the gate
//! across several writes, possibly made from different threads on behalf of
//! the same exchange.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Condvar, Mutex};

use crate::RequestId;

#[derive(Debug, Default)]
struct GateState {
    owner: RequestId,
    count: u32,
}

/// Counting mutual exclusion keyed by message ID.
///
/// An owner of zero means the gate is free. Positive owners are protocol
/// message IDs; negative ones are handed out by [`acquire(0)`](#method.acquire)
/// and never collide with message IDs.
#[derive(Debug, Default)]
pub struct WriteGate {
    state: Mutex<GateState>,
    freed: Condvar,
    ephemeral: AtomicI32,
}

impl WriteGate {
    pub fn new() -> WriteGate {
        WriteGate::default()
    }

    fn next_ephemeral(&self) -> RequestId {
        let prev = self
            .ephemeral
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                Some(if id == i32::MIN + 1 { 0 } else { id - 1 })
            })
            .unwrap_or(0);
        if prev == i32::MIN + 1 {
            -1
        } else {
            prev - 1
        }
    }

    /// Take the gate for `id`, blocking until it's free or already held by `id`.
    ///
    /// If `id` is zero, a fresh negative identifier is generated. Returns the
    /// identifier under which the gate is now held.
    pub fn acquire(&self, id: RequestId) -> RequestId {
        let id = if id == 0 { self.next_ephemeral() } else { id };
        let mut state = self.state.lock().expect("write gate lock");
        while state.owner != 0 && state.owner != id {
            state = self.freed.wait(state).expect("write gate lock");
        }
        state.owner = id;
        state.count += 1;
        id
    }

    /// Drop one hold of the gate owned by `id`.
    ///
    /// When the last hold goes away the gate becomes free and all waiters
    /// are woken.
    ///
    /// # Panics
    ///
    /// Releasing an unowned gate, or a gate owned by another identifier,
    /// is a programming error and panics.
    pub fn release(&self, id: RequestId) {
        let mut state = self.state.lock().expect("write gate lock");
        assert!(state.owner != 0, "write gate release by {} while unowned", id);
        assert!(
            state.owner == id,
            "write gate release by {} while owned by {}",
            id,
            state.owner
        );
        state.count -= 1;
        if state.count == 0 {
            state.owner = 0;
            self.freed.notify_all();
        }
    }

    /// Current owner, or zero if the gate is free.
    pub fn owner(&self) -> RequestId {
        self.state.lock().expect("write gate lock").owner
    }

    /// Take the gate for the lifetime of the returned lease.
    pub fn lease(&self, id: RequestId) -> WriteLease<'_> {
        let id = self.acquire(id);
        WriteLease { gate: self, id }
    }
}

/// Proof of holding a [`WriteGate`](struct.WriteGate.html).
///
/// Operations which must not run while another thread writes, such as swapping
/// the transport for TLS, take a lease as a parameter. The gate is released when
/// the lease is dropped.
#[derive(Debug)]
pub struct WriteLease<'a> {
    gate: &'a WriteGate,
    id: RequestId,
}

impl WriteLease<'_> {
    /// Identifier under which the gate is held.
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub(crate) fn is_for(&self, gate: &WriteGate) -> bool {
        std::ptr::eq(self.gate, gate)
    }
}

impl Drop for WriteLease<'_> {
    fn drop(&mut self) {
        self.gate.release(self.id);
    }
}
