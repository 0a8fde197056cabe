use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::agent::AgentShared;
use crate::conn::Connection;
use crate::dispatch::Timer;
use crate::ldap::BindProperties;
use crate::protocol::{LdapMessage, LdapRequest};
use crate::result::{Fault, SASL_BIND_IN_PROGRESS};
use crate::RequestId;

/// A server reply, or the fault which replaced it.
pub(crate) type Reply = std::result::Result<LdapMessage, Fault>;

#[derive(Debug)]
struct StateInner {
    replies: VecDeque<Reply>,
    accepting: bool,
    complete: bool,
    bind: Option<BindProperties>,
    // The write gate is still held on behalf of this bind.
    bind_pending: bool,
    timer: Option<Timer>,
}

/// Bookkeeping for one outstanding request.
///
/// Replies are queued here by the reader and taken out by the owning agent.
/// Once the state stops accepting replies it stays reachable until its queue
/// is drained, so a final reply racing with abandonment isn't lost.
#[derive(Debug)]
pub(crate) struct MessageState {
    id: RequestId,
    request: LdapRequest,
    gate_id: RequestId,
    timeout: Duration,
    conn: Weak<Connection>,
    agent: Mutex<Weak<AgentShared>>,
    inner: Mutex<StateInner>,
}

impl MessageState {
    pub(crate) fn new(
        request: LdapRequest,
        gate_id: RequestId,
        timeout_ms: u64,
        conn: &Arc<Connection>,
        agent: &Arc<AgentShared>,
        bind: Option<BindProperties>,
    ) -> Arc<MessageState> {
        Arc::new(MessageState {
            id: request.id,
            gate_id,
            timeout: Duration::from_millis(timeout_ms),
            conn: Arc::downgrade(conn),
            agent: Mutex::new(Arc::downgrade(agent)),
            inner: Mutex::new(StateInner {
                replies: VecDeque::new(),
                accepting: true,
                complete: false,
                bind_pending: bind.is_some(),
                bind,
                timer: None,
            }),
            request,
        })
    }

    pub(crate) fn id(&self) -> RequestId {
        self.id
    }

    pub(crate) fn request(&self) -> &LdapRequest {
        &self.request
    }

    /// Identifier under which this request writes through the gate.
    pub(crate) fn gate_id(&self) -> RequestId {
        self.gate_id
    }

    pub(crate) fn connection(&self) -> Option<Arc<Connection>> {
        self.conn.upgrade()
    }

    pub(crate) fn set_agent(&self, agent: Weak<AgentShared>) {
        *self.agent.lock().expect("state agent lock") = agent;
    }

    fn inner(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().expect("message state lock")
    }

    /// Run `f` on the state with the owning agent locked, then wake the agent's waiters.
    ///
    /// Waiters check for replies under the agent lock, so every change they could be
    /// waiting for has to happen under it too. The agent may change under a concurrent
    /// merge; the pointer is rechecked once its lock is held.
    fn with_agent<R>(&self, f: impl FnOnce(&mut StateInner) -> R) -> R {
        loop {
            let agent = self.agent.lock().expect("state agent lock").upgrade();
            let Some(agent) = agent else {
                return f(&mut self.inner());
            };
            let guard = agent.lock();
            let current = self.agent.lock().expect("state agent lock").as_ptr();
            if current != Arc::as_ptr(&agent) {
                continue;
            }
            let res = f(&mut self.inner());
            agent.wake_all();
            drop(guard);
            return res;
        }
    }

    /// Queue a reply from the server. Returns false if the state no longer accepts replies.
    pub(crate) fn put_reply(&self, msg: LdapMessage) -> bool {
        self.with_agent(|inner| {
            if !inner.accepting {
                return false;
            }
            let finished = !msg.is_intermediate();
            let bind_rc = if finished && inner.bind_pending {
                Some(msg.result_ext().map(|ext| ext.0.rc).unwrap_or(u32::MAX))
            } else {
                None
            };
            inner.replies.push_back(Ok(msg));
            if !finished {
                return true;
            }
            inner.complete = true;
            inner.accepting = false;
            if let Some(timer) = inner.timer.take() {
                timer.cancel();
            }
            if let Some(rc) = bind_rc {
                inner.bind_pending = false;
                // A SASL exchange keeps the gate between steps; it's held under
                // the connection's bind semaphore, not the message ID.
                if rc != SASL_BIND_IN_PROGRESS || self.gate_id == self.id {
                    if let Some(conn) = self.conn.upgrade() {
                        let props = if rc == 0 { inner.bind.clone() } else { None };
                        conn.set_bind_properties(props);
                        conn.release_bind_gate(self.gate_id);
                    }
                }
            }
            true
        })
    }

    /// Stop accepting replies, queueing `fault` for the waiter if given.
    ///
    /// A bind still holding the write gate releases it here. Returns true if the
    /// request was in flight and the server should be told to abandon it.
    pub(crate) fn abandon(&self, fault: Option<Fault>) -> bool {
        self.with_agent(|inner| {
            if !inner.accepting {
                return false;
            }
            inner.accepting = false;
            if let Some(timer) = inner.timer.take() {
                timer.cancel();
            }
            if inner.bind_pending {
                inner.bind_pending = false;
                if let Some(conn) = self.conn.upgrade() {
                    conn.release_bind_gate(self.gate_id);
                }
            }
            if let Some(fault) = fault {
                inner.replies.push_back(Err(fault));
            }
            !inner.complete && inner.bind.is_none()
        })
    }

    /// Timer expiry: cut the request off with a timeout fault.
    pub(crate) fn time_out(&self) {
        debug!("message {} timed out", self.id);
        if self.abandon(Some(Fault::Timeout(self.id))) {
            if let Some(conn) = self.conn.upgrade() {
                conn.send_abandon(self.id);
            }
        }
    }

    pub(crate) fn start_timer(self: &Arc<Self>) {
        if self.timeout.is_zero() || !self.request.expects_reply() {
            return;
        }
        let weak = Arc::downgrade(self);
        let timer = match Timer::start(self.timeout, move || {
            if let Some(state) = weak.upgrade() {
                state.time_out();
            }
        }) {
            Ok(timer) => timer,
            Err(e) => {
                warn!("cannot start timer for message {}: {}", self.id, e);
                return;
            }
        };
        let mut inner = self.inner();
        if inner.accepting {
            inner.timer = Some(timer);
        } else {
            timer.cancel();
        }
    }

    /// Take the next queued reply. The flag is true once nothing more will arrive.
    ///
    /// Must be called with the owning agent locked.
    pub(crate) fn take_reply(&self) -> (Option<Reply>, bool) {
        let mut inner = self.inner();
        let reply = inner.replies.pop_front();
        let finished = !inner.accepting && inner.replies.is_empty();
        (reply, finished)
    }

    pub(crate) fn has_replies(&self) -> bool {
        !self.inner().replies.is_empty()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.inner().complete
    }

    pub(crate) fn is_accepting(&self) -> bool {
        self.inner().accepting
    }

    /// Remove the state from its connection's registry.
    pub(crate) fn deregister(&self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.remove_message(self);
        }
    }
}
