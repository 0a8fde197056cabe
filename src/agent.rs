use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::conn::Connection;
use crate::ldap::BindProperties;
use crate::message::{MessageState, Reply};
use crate::protocol::{LdapMessage, LdapRequest};
use crate::result::{LdapError, Result};
use crate::RequestId;

#[derive(Debug, Default)]
pub(crate) struct AgentInner {
    states: Vec<Arc<MessageState>>,
    // Round-robin cursor for "any ID" retrieval.
    next: usize,
}

enum Taken {
    Reply(Reply),
    Wait,
    Gone,
}

impl AgentInner {
    fn position(&self, id: RequestId) -> Option<usize> {
        self.states.iter().position(|s| s.id() == id)
    }

    fn remove_at(&mut self, idx: usize) -> Arc<MessageState> {
        let state = self.states.remove(idx);
        if self.next > idx {
            self.next -= 1;
        }
        if self.next >= self.states.len() {
            self.next = 0;
        }
        state
    }

    fn take_for(&mut self, id: RequestId) -> Taken {
        let Some(idx) = self.position(id) else {
            return Taken::Gone;
        };
        let state = self.states[idx].clone();
        let (reply, finished) = state.take_reply();
        if finished {
            self.remove_at(idx);
            state.deregister();
        }
        match reply {
            Some(reply) => Taken::Reply(reply),
            None if finished => Taken::Gone,
            None => Taken::Wait,
        }
    }

    fn take_any(&mut self) -> Taken {
        let mut scanned = 0;
        while scanned < self.states.len() {
            if self.next >= self.states.len() {
                self.next = 0;
            }
            let idx = self.next;
            let state = self.states[idx].clone();
            let (reply, finished) = state.take_reply();
            if finished {
                // the cursor now points at the entry which slid into this slot
                self.remove_at(idx);
                state.deregister();
            } else {
                self.next = idx + 1;
                scanned += 1;
            }
            if let Some(reply) = reply {
                return Taken::Reply(reply);
            }
        }
        if self.states.is_empty() {
            Taken::Gone
        } else {
            Taken::Wait
        }
    }
}

/// Shared part of a [`MessageAgent`](struct.MessageAgent.html), referenced weakly by its states.
#[derive(Debug, Default)]
pub(crate) struct AgentShared {
    inner: Mutex<AgentInner>,
    cond: Condvar,
}

impl AgentShared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, AgentInner> {
        self.inner.lock().expect("agent lock")
    }

    pub(crate) fn wake_all(&self) {
        self.cond.notify_all();
    }
}

impl Drop for AgentShared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        for state in inner.states.drain(..) {
            state.abandon(None);
            state.deregister();
        }
    }
}

/// Group of outstanding requests read by one consumer.
///
/// Every request sent through an agent stays with it until its replies are drained.
/// Replies can be retrieved for a particular message ID, or from whichever request
/// has one ready, in round-robin order. Clones of an agent share the same requests.
///
/// Dropping the last clone abandons whatever is still outstanding, without telling
/// the server.
#[derive(Clone, Debug, Default)]
pub struct MessageAgent {
    shared: Arc<AgentShared>,
}

impl MessageAgent {
    pub fn new() -> MessageAgent {
        MessageAgent::default()
    }

    /// Send `request` over `conn`, tracking it in this agent.
    ///
    /// A non-zero `timeout_ms` arms a timer which cuts the request off with a
    /// timeout fault. `bind` marks a Bind request; it holds the write gate under
    /// its message ID until the response arrives.
    pub fn send(
        &self,
        conn: &Arc<Connection>,
        request: LdapRequest,
        timeout_ms: u64,
        bind: Option<BindProperties>,
    ) -> Result<RequestId> {
        self.send_inner(conn, request, timeout_ms, bind, None)
    }

    /// Send `request` through a gate already held under `gate_id`.
    ///
    /// Used for the steps of a SASL exchange, which hold the gate under the
    /// connection's bind semaphore, and for requests sent under a lease.
    pub(crate) fn send_held(
        &self,
        conn: &Arc<Connection>,
        request: LdapRequest,
        timeout_ms: u64,
        bind: Option<BindProperties>,
        gate_id: RequestId,
    ) -> Result<RequestId> {
        self.send_inner(conn, request, timeout_ms, bind, Some(gate_id))
    }

    fn send_inner(
        &self,
        conn: &Arc<Connection>,
        request: LdapRequest,
        timeout_ms: u64,
        bind: Option<BindProperties>,
        held: Option<RequestId>,
    ) -> Result<RequestId> {
        let id = request.id();
        let is_bind = bind.is_some();
        let gate_id = held.unwrap_or(id);
        let state = MessageState::new(request, gate_id, timeout_ms, conn, &self.shared, bind);
        conn.register(&state)?;
        self.shared.lock().states.push(state.clone());
        if is_bind && held.is_none() {
            // held until the response arrives, released by the state
            conn.gate().acquire(gate_id);
        }
        if let Err(e) = conn.write_message(&state) {
            state.abandon(None);
            self.remove(id);
            return Err(e);
        }
        if state.request().expects_reply() {
            state.start_timer();
        } else {
            state.abandon(None);
            self.remove(id);
        }
        Ok(id)
    }

    fn remove(&self, id: RequestId) -> Option<Arc<MessageState>> {
        let state = {
            let mut inner = self.shared.lock();
            let idx = inner.position(id)?;
            inner.remove_at(idx)
        };
        state.deregister();
        Some(state)
    }

    /// Wait for the next reply.
    ///
    /// With `Some(id)`, only replies to that message are considered. With `None`,
    /// the first available reply of any request is returned, visiting requests in
    /// turn. `Ok(None)` means nothing more will arrive: the message is unknown or
    /// finished, or the agent has no requests left. A fault which cut the request
    /// off is returned as [`LdapError::Interrupted`](../result/enum.LdapError.html).
    pub fn get_message(&self, id: Option<RequestId>) -> Result<Option<LdapMessage>> {
        let mut inner = self.shared.lock();
        loop {
            let taken = match id {
                Some(id) => inner.take_for(id),
                None => inner.take_any(),
            };
            match taken {
                Taken::Reply(Ok(msg)) => {
                    trace!("reply to message {} taken", msg.id);
                    return Ok(Some(msg));
                }
                Taken::Reply(Err(fault)) => return Err(LdapError::from(fault)),
                Taken::Gone => return Ok(None),
                Taken::Wait => {
                    inner = self.shared.cond.wait(inner).expect("agent lock");
                }
            }
        }
    }

    /// Stop tracking message `id` and drop further replies to it.
    ///
    /// The server is sent an Abandon request if the operation was still in
    /// progress. Returns false if the message isn't tracked by this agent.
    pub fn abandon(&self, id: RequestId) -> bool {
        let Some(state) = self.remove(id) else {
            return false;
        };
        Self::abandon_state(&state);
        true
    }

    /// Abandon every request of this agent.
    pub fn abandon_all(&self) {
        let states = {
            let mut inner = self.shared.lock();
            inner.next = 0;
            std::mem::take(&mut inner.states)
        };
        for state in states {
            state.deregister();
            Self::abandon_state(&state);
        }
        self.shared.wake_all();
    }

    fn abandon_state(state: &MessageState) {
        if state.abandon(None) {
            if let Some(conn) = state.connection() {
                conn.send_abandon(state.id());
            }
        }
    }

    /// Move all requests of `other` into this agent.
    ///
    /// Waiters on this agent are woken for the moved requests; waiters on `other`
    /// find it empty.
    pub fn merge(&self, other: &MessageAgent) {
        if Arc::ptr_eq(&self.shared, &other.shared) {
            return;
        }
        // lock in address order, so that crosswise merges can't deadlock
        let self_first = Arc::as_ptr(&self.shared) < Arc::as_ptr(&other.shared);
        let (first, second) = if self_first {
            (&self.shared, &other.shared)
        } else {
            (&other.shared, &self.shared)
        };
        let mut a = first.lock();
        let mut b = second.lock();
        let (mine, theirs) = if self_first {
            (&mut *a, &mut *b)
        } else {
            (&mut *b, &mut *a)
        };
        let moved = std::mem::take(&mut theirs.states);
        theirs.next = 0;
        let weak = Arc::downgrade(&self.shared);
        for state in &moved {
            state.set_agent(weak.clone());
        }
        let count = moved.len();
        mine.states.extend(moved);
        match count {
            0 => (),
            1 => self.shared.cond.notify_one(),
            _ => self.shared.cond.notify_all(),
        }
        other.shared.cond.notify_all();
    }

    /// IDs of the requests tracked by this agent.
    pub fn message_ids(&self) -> Vec<RequestId> {
        self.shared.lock().states.iter().map(|s| s.id()).collect()
    }

    /// True if a reply is waiting, for message `id` or for any message.
    pub fn is_response_received(&self, id: Option<RequestId>) -> bool {
        let inner = self.shared.lock();
        match id {
            Some(id) => inner
                .position(id)
                .is_some_and(|idx| inner.states[idx].has_replies()),
            None => inner.states.iter().any(|s| s.has_replies()),
        }
    }

    /// True if the final response to message `id` has arrived, or the message
    /// is no longer tracked.
    pub fn is_complete(&self, id: RequestId) -> bool {
        let inner = self.shared.lock();
        match inner.position(id) {
            Some(idx) => inner.states[idx].is_complete(),
            None => true,
        }
    }

    /// Number of requests tracked by this agent.
    pub fn count(&self) -> usize {
        self.shared.lock().states.len()
    }

    /// True if no tracked request can receive more replies.
    pub fn is_idle(&self) -> bool {
        self.shared.lock().states.iter().all(|s| !s.is_accepting())
    }
}
