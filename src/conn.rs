use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crate::dispatch;
use crate::gate::{WriteGate, WriteLease};
use crate::ldap::BindProperties;
use crate::message::MessageState;
use crate::protocol::{LdapCodec, LdapMessage, LdapRequest, NOTICE_OF_DISCONNECTION_OID, UNSOLICITED_ID};
use crate::reader::{self, ReaderMode, ReaderSlot, SharedInput, UnsolicitedListener};
use crate::request;
use crate::result::{Fault, LdapError, Result};
use crate::transport::{LdapConnSettings, Transport};
use crate::RequestId;

use bytes::BytesMut;
use tokio_util::codec::Encoder;

type SharedOutput = Arc<Mutex<Box<dyn Write + Send>>>;

/// The stream pair and the transport it came from, replaced together.
#[derive(Default)]
struct Streams {
    transport: Option<Arc<dyn Transport>>,
    input: Option<SharedInput>,
    output: Option<SharedOutput>,
}

/// Physical connection to a directory server, shared by any number of handles.
///
/// The connection owns the socket, the write gate serializing access to it, the
/// registry of outstanding requests, and the reader thread which routes replies
/// to them. It's normally used through [`LdapConnection`](struct.LdapConnection.html)
/// handles; the methods here are the lower layer those handles are built on.
///
/// A connection is not closed when the last `Arc` goes away while the reader is
/// running, since the reader holds a reference of its own. It must be shut down
/// explicitly, which dropping the last handle does.
pub struct Connection {
    settings: LdapConnSettings,
    gate: WriteGate,
    endpoint: Mutex<Option<(String, u16)>>,
    io: Mutex<Streams>,
    tls_backup: Mutex<Option<Arc<dyn Transport>>>,
    client_active: AtomicBool,
    server_shutdown: AtomicBool,
    reader: Mutex<ReaderSlot>,
    clones: Mutex<u32>,
    bind: Mutex<Option<BindProperties>>,
    bind_semaphore: Mutex<Option<RequestId>>,
    messages: Mutex<HashMap<RequestId, Arc<MessageState>>>,
    listeners: Mutex<Vec<Arc<dyn UnsolicitedListener>>>,
    handshake_problems: Mutex<Vec<String>>,
    active_referral: Mutex<Option<String>>,
    dropped_frames: AtomicU64,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &*lock(&self.endpoint))
            .field("active", &self.is_connected())
            .field("bound", &self.is_bound())
            .field("clones", &*lock(&self.clones))
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().expect("connection lock")
}

impl Connection {
    /// Create an unconnected instance.
    pub fn new(settings: LdapConnSettings) -> Arc<Connection> {
        Arc::new(Connection {
            settings,
            gate: WriteGate::new(),
            endpoint: Mutex::new(None),
            io: Mutex::new(Streams::default()),
            tls_backup: Mutex::new(None),
            client_active: AtomicBool::new(false),
            server_shutdown: AtomicBool::new(false),
            reader: Mutex::new(ReaderSlot::default()),
            clones: Mutex::new(0),
            bind: Mutex::new(None),
            bind_semaphore: Mutex::new(None),
            messages: Mutex::new(HashMap::new()),
            listeners: Mutex::new(vec![]),
            handshake_problems: Mutex::new(vec![]),
            active_referral: Mutex::new(None),
            dropped_frames: AtomicU64::new(0),
        })
    }

    pub fn settings(&self) -> &LdapConnSettings {
        &self.settings
    }

    /// Gate serializing writes to the socket.
    pub fn gate(&self) -> &WriteGate {
        &self.gate
    }

    pub fn host(&self) -> Option<String> {
        lock(&self.endpoint).as_ref().map(|(host, _)| host.clone())
    }

    pub fn port(&self) -> Option<u16> {
        lock(&self.endpoint).as_ref().map(|&(_, port)| port)
    }

    fn endpoint(&self) -> (String, u16) {
        lock(&self.endpoint).clone().unwrap_or_default()
    }

    pub(crate) fn endpoint_name(&self) -> String {
        let (host, port) = self.endpoint();
        format!("{}:{}", host, port)
    }

    /// True between a successful connect and shutdown.
    pub fn is_connected(&self) -> bool {
        self.client_active.load(Ordering::SeqCst)
    }

    /// True if the last Bind succeeded.
    pub fn is_bound(&self) -> bool {
        lock(&self.bind).is_some()
    }

    pub fn is_tls(&self) -> bool {
        lock(&self.io)
            .transport
            .as_ref()
            .is_some_and(|t| t.is_tls())
    }

    /// Identity established by the last successful Bind.
    pub fn bind_properties(&self) -> Option<BindProperties> {
        lock(&self.bind).clone()
    }

    pub(crate) fn set_bind_properties(&self, props: Option<BindProperties>) {
        *lock(&self.bind) = props;
    }

    /// Number of frames discarded because no request was waiting for them.
    ///
    /// These are normally late replies to abandoned or timed out requests.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Referral URL this connection was opened to follow, if any.
    pub fn active_referral(&self) -> Option<String> {
        lock(&self.active_referral).clone()
    }

    pub(crate) fn set_active_referral(&self, url: Option<String>) {
        *lock(&self.active_referral) = url;
    }

    /// Note a problem met while negotiating TLS, reported if a Bind then fails.
    pub(crate) fn record_handshake_problem(&self, problem: String) {
        lock(&self.handshake_problems).push(problem);
    }

    // Bind semaphore

    /// Identifier under which an ongoing SASL exchange holds the gate.
    pub fn bind_semaphore(&self) -> Option<RequestId> {
        *lock(&self.bind_semaphore)
    }

    /// Take the gate for a multi-step Bind, returning the identifier it's held under.
    pub(crate) fn begin_sasl_bind(&self) -> RequestId {
        let sem = self.gate.acquire(0);
        *lock(&self.bind_semaphore) = Some(sem);
        sem
    }

    /// Let go of the gate held by a multi-step Bind, if it's still held.
    pub(crate) fn end_sasl_bind(&self, sem: RequestId) {
        let held = {
            let mut current = lock(&self.bind_semaphore);
            if *current == Some(sem) {
                *current = None;
                true
            } else {
                false
            }
        };
        if held {
            self.gate.release(sem);
        }
    }

    /// Release a gate hold taken for a Bind, ending the SASL exchange it belonged to.
    pub(crate) fn release_bind_gate(&self, gate_id: RequestId) {
        let semaphore = {
            let mut current = lock(&self.bind_semaphore);
            if *current == Some(gate_id) {
                *current = None;
                true
            } else {
                false
            }
        };
        // A semaphore (always negative) that's no longer current was released
        // by shutdown.
        if semaphore || gate_id > 0 {
            self.gate.release(gate_id);
        }
    }

    // Clones

    /// Record one more handle sharing this connection.
    pub fn add_clone(&self) {
        *lock(&self.clones) += 1;
    }

    /// Number of handles beyond the first.
    pub fn clone_count(&self) -> u32 {
        *lock(&self.clones)
    }

    /// Give up one handle's share of the connection.
    ///
    /// While other handles remain, only the count goes down. Then, for an explicit
    /// disconnect (`api_call`), the caller gets a fresh unconnected instance to keep
    /// using, and otherwise nothing. When this was the last handle, the connection
    /// is shut down and returned.
    pub fn destroy_clone(self: &Arc<Self>, api_call: bool) -> Option<Arc<Connection>> {
        let remaining = {
            let mut clones = lock(&self.clones);
            if *clones > 0 {
                *clones -= 1;
                true
            } else {
                false
            }
        };
        if remaining {
            if !api_call {
                return None;
            }
            let fresh = Connection::new(self.settings.clone());
            *lock(&fresh.endpoint) = lock(&self.endpoint).clone();
            return Some(fresh);
        }
        self.shutdown("last handle released", 0, None);
        Some(self.clone())
    }

    // Registry

    pub(crate) fn register(&self, state: &Arc<MessageState>) -> Result<()> {
        let mut messages = lock(&self.messages);
        if messages.contains_key(&state.id()) {
            return Err(LdapError::DuplicateMessageId(state.id()));
        }
        messages.insert(state.id(), state.clone());
        Ok(())
    }

    pub(crate) fn remove_message(&self, state: &MessageState) {
        let mut messages = lock(&self.messages);
        if messages
            .get(&state.id())
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), state))
        {
            messages.remove(&state.id());
        }
    }

    /// True if no registered request can receive more replies.
    pub fn messages_complete(&self) -> bool {
        lock(&self.messages).values().all(|s| !s.is_accepting())
    }

    /// Number of requests in the registry.
    pub fn outstanding(&self) -> usize {
        lock(&self.messages).len()
    }

    // Listeners

    pub fn add_unsolicited_listener(&self, listener: Arc<dyn UnsolicitedListener>) {
        lock(&self.listeners).push(listener);
    }

    /// Remove a listener previously added. Returns false if it wasn't registered.
    pub fn remove_unsolicited_listener(&self, listener: &Arc<dyn UnsolicitedListener>) -> bool {
        let target = Arc::as_ptr(listener) as *const ();
        let mut listeners = lock(&self.listeners);
        match listeners
            .iter()
            .position(|l| Arc::as_ptr(l) as *const () == target)
        {
            Some(idx) => {
                listeners.remove(idx);
                true
            }
            None => false,
        }
    }

    // Connect and shutdown

    /// Open the connection to `host:port`, or port 389 if `port` is zero.
    ///
    /// The gate is held under `sem_id` while the socket is set up; zero means a
    /// fresh identifier.
    pub fn connect(self: &Arc<Self>, host: &str, port: u16, sem_id: RequestId) -> Result<()> {
        if self.is_connected() {
            self.shutdown("reconnect", sem_id, None);
        }
        self.wait_for_reader();
        self.server_shutdown.store(false, Ordering::SeqCst);
        let gate_id = self.gate.acquire(sem_id);
        let res = self.open(host, port);
        self.gate.release(gate_id);
        res
    }

    fn open(self: &Arc<Self>, host: &str, port: u16) -> Result<()> {
        let port = if port == 0 {
            self.settings.default_port()
        } else {
            port
        };
        let transport = self
            .settings
            .connector()
            .connect(host, port, &self.settings)
            .map_err(|source| LdapError::Connect {
                host: host.to_owned(),
                port,
                source,
            })?;
        let (input, output) = match transport.split() {
            Ok(pair) => pair,
            Err(e) => {
                let _ = transport.close();
                return Err(LdapError::from(e));
            }
        };
        *lock(&self.endpoint) = Some((host.to_owned(), port));
        self.install(transport, input, output);
        self.client_active.store(true, Ordering::SeqCst);
        if let Err(e) = self.start_reader() {
            self.client_active.store(false, Ordering::SeqCst);
            self.close_streams();
            return Err(e);
        }
        debug!("connected to {}:{}", host, port);
        Ok(())
    }

    fn install(
        &self,
        transport: Arc<dyn Transport>,
        input: Box<dyn Read + Send>,
        output: Box<dyn Write + Send>,
    ) {
        *lock(&self.io) = Streams {
            transport: Some(transport),
            input: Some(Arc::new(Mutex::new(input))),
            output: Some(Arc::new(Mutex::new(output))),
        };
    }

    fn close_streams(&self) {
        let streams = std::mem::take(&mut *lock(&self.io));
        if let Some(transport) = streams.transport {
            if let Err(e) = transport.close() {
                debug!("closing transport: {}", e);
            }
        }
        if let Some(backup) = lock(&self.tls_backup).take() {
            if let Err(e) = backup.close() {
                debug!("closing plain transport under TLS: {}", e);
            }
        }
    }

    /// Close the connection, failing every outstanding request with `fault`.
    ///
    /// Only the first call after a connect does anything; the return value tells
    /// whether this was it. A bound connection is sent an Unbind first, on a best
    /// effort basis.
    pub fn shutdown(&self, reason: &str, sem_id: RequestId, fault: Option<Fault>) -> bool {
        if !self.client_active.swap(false, Ordering::SeqCst) {
            return false;
        }
        debug!("shutting down {}: {}", self.endpoint_name(), reason);
        self.fail_outstanding(&fault);
        // A SASL exchange between steps holds the gate with no write in flight.
        let sem = {
            let mut current = lock(&self.bind_semaphore);
            match *current {
                Some(sem) if sem != sem_id => current.take(),
                _ => None,
            }
        };
        if let Some(sem) = sem {
            self.gate.release(sem);
        }
        let gate_id = self.gate.acquire(sem_id);
        // requests registered while the gate was awaited
        self.fail_outstanding(&fault);
        if self.is_bound() {
            if let Err(e) = self.write_request(&request::unbind_request()) {
                warn!("unbind during shutdown of {}: {}", self.endpoint_name(), e);
            }
        }
        self.set_bind_properties(None);
        {
            let mut slot = lock(&self.reader);
            if slot.thread.is_some() {
                slot.mode = ReaderMode::StopReading;
            }
        }
        self.close_streams();
        self.wait_for_reader();
        self.gate.release(gate_id);
        true
    }

    fn fail_outstanding(&self, fault: &Option<Fault>) {
        let states: Vec<_> = lock(&self.messages).values().cloned().collect();
        for state in states {
            state.abandon(fault.clone());
        }
    }

    // Writing

    fn write_request(&self, req: &LdapRequest) -> io::Result<()> {
        let output = lock(&self.io)
            .output
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "not connected"))?;
        let mut buf = BytesMut::new();
        LdapCodec.encode(req, &mut buf)?;
        let mut out = output.lock().expect("output stream lock");
        out.write_all(&buf)?;
        out.flush()?;
        trace!("sent message {} to {}", req.id(), self.endpoint_name());
        Ok(())
    }

    /// Write the request of `state` to the server.
    ///
    /// A Bind on a connection which was shut down reconnects to the last known
    /// server first, unless the shutdown is still under way. Other requests
    /// fail with `NotConnected` on a connection which isn't live once the gate
    /// is held.
    pub(crate) fn write_message(self: &Arc<Self>, state: &MessageState) -> Result<()> {
        let is_bind = state.request().is_bind();
        if is_bind && !self.is_connected() {
            if self.reader_running() {
                return Err(LdapError::NotConnected);
            }
            if let Some((host, port)) = lock(&self.endpoint).clone() {
                debug!("reconnecting to {}:{} for bind", host, port);
                self.connect(&host, port, state.gate_id())?;
            }
        }
        let was_tls = self.is_tls();
        let gate_id = self.gate.acquire(state.gate_id());
        if !self.is_connected() {
            self.gate.release(gate_id);
            return Err(LdapError::NotConnected);
        }
        let res = self
            .write_request(state.request())
            .map_err(|e| self.write_fault(e, is_bind && was_tls));
        self.gate.release(gate_id);
        lock(&self.handshake_problems).clear();
        res
    }

    fn write_fault(&self, source: io::Error, tls_bind: bool) -> LdapError {
        let (host, port) = self.endpoint();
        if tls_bind {
            LdapError::TlsHandshake {
                host,
                port,
                problems: lock(&self.handshake_problems).clone(),
            }
        } else if self.server_shutdown.load(Ordering::SeqCst) {
            LdapError::ServerShutdown { host, port }
        } else if self.is_connected() {
            LdapError::ConnectionIo { host, port, source }
        } else {
            LdapError::NotConnected
        }
    }

    /// Abandon message `id`, whichever agent tracks it.
    ///
    /// Returns false if the message isn't in the registry. The agent sees the
    /// request as finished.
    pub fn abandon_message(&self, id: RequestId) -> bool {
        let Some(state) = lock(&self.messages).get(&id).cloned() else {
            return false;
        };
        if state.abandon(None) {
            self.send_abandon(id);
        }
        self.remove_message(&state);
        true
    }

    /// Tell the server to abandon message `id`. Failures are only logged.
    pub(crate) fn send_abandon(&self, id: RequestId) {
        if !self.is_connected() {
            return;
        }
        let req = request::abandon_request(id);
        let gate_id = self.gate.acquire(req.id());
        if let Err(e) = self.write_request(&req) {
            debug!("abandon of message {} not sent: {}", id, e);
        }
        self.gate.release(gate_id);
    }

    // TLS

    /// Negotiate TLS over the current socket.
    ///
    /// The caller must hold the gate through `lease`, have no operations outstanding,
    /// and have stopped the reader. The plain transport is kept for
    /// [`stop_tls()`](#method.stop_tls). The reader isn't restarted.
    pub fn start_tls(&self, lease: &WriteLease<'_>) -> Result<()> {
        assert!(lease.is_for(&self.gate), "lease taken on another connection");
        self.wait_for_reader();
        let (host, port) = lock(&self.endpoint).clone().ok_or(LdapError::NotConnected)?;
        let plain = lock(&self.io)
            .transport
            .clone()
            .ok_or(LdapError::NotConnected)?;
        let tls = match plain.start_tls(&host, &self.settings) {
            Ok(tls) => tls,
            Err(e) => {
                self.record_handshake_problem(e.to_string());
                return Err(LdapError::TlsHandshake {
                    host,
                    port,
                    problems: lock(&self.handshake_problems).clone(),
                });
            }
        };
        let (input, output) = tls.split()?;
        *lock(&self.tls_backup) = Some(plain);
        self.install(tls, input, output);
        debug!("TLS started on {}:{}", host, port);
        Ok(())
    }

    /// Drop the TLS layer and go back to the plain socket, restarting the reader.
    pub fn stop_tls(self: &Arc<Self>, lease: &WriteLease<'_>) -> Result<()> {
        assert!(lease.is_for(&self.gate), "lease taken on another connection");
        let tls = lock(&self.io)
            .transport
            .clone()
            .filter(|t| t.is_tls())
            .ok_or(LdapError::NoStartTls)?;
        // TLS from the start, as with ldaps, has no plain layer to go back to
        if lock(&self.tls_backup).is_none() {
            return Err(LdapError::NoStartTls);
        }
        self.set_reader_mode(ReaderMode::StopReading);
        if let Err(e) = tls.close() {
            debug!("closing TLS layer: {}", e);
        }
        self.wait_for_reader();
        let plain = lock(&self.tls_backup).take();
        let restored = match plain {
            Some(plain) => plain.split().map(|(input, output)| self.install(plain, input, output)),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "plain layer gone")),
        };
        if let Err(e) = restored {
            let (host, port) = self.endpoint();
            let fault = Fault::ConnectionLost {
                host,
                port,
                detail: e.to_string(),
            };
            self.shutdown("plain layer lost after TLS", lease.id(), Some(fault));
            return Err(LdapError::from(e));
        }
        debug!("TLS stopped on {}", self.endpoint_name());
        self.start_reader()
    }

    // Reader lifecycle

    fn set_reader_mode(&self, mode: ReaderMode) {
        lock(&self.reader).mode = mode;
    }

    /// Make the reader exit once it has delivered the reply to `id`.
    pub(crate) fn stop_reader_on_reply(&self, id: RequestId) {
        self.set_reader_mode(ReaderMode::StopOnId(id));
    }

    /// Undo [`stop_reader_on_reply()`](#method.stop_reader_on_reply), restarting
    /// the reader if it already exited.
    pub(crate) fn resume_reader(self: &Arc<Self>, id: RequestId) -> Result<()> {
        {
            let mut slot = lock(&self.reader);
            if slot.thread.is_some() && slot.mode == ReaderMode::StopOnId(id) {
                slot.mode = ReaderMode::Continue;
                return Ok(());
            }
        }
        self.wait_for_reader();
        if self.is_connected() {
            self.start_reader()
        } else {
            Ok(())
        }
    }

    pub(crate) fn reader_running(&self) -> bool {
        lock(&self.reader).thread.is_some()
    }

    fn start_reader(self: &Arc<Self>) -> Result<()> {
        let mut slot = lock(&self.reader);
        if slot.thread.is_some() {
            return Ok(());
        }
        slot.mode = ReaderMode::Continue;
        let handle = reader::spawn(self.clone())?;
        slot.thread = Some(handle.thread().id());
        slot.handle = Some(handle);
        Ok(())
    }

    /// Wait until the reader thread has exited. Does nothing on the reader itself.
    fn wait_for_reader(&self) {
        let handle = {
            let mut slot = lock(&self.reader);
            if slot.thread == Some(thread::current().id()) {
                return;
            }
            slot.handle.take()
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("reader thread of {} panicked", self.endpoint_name());
            }
        }
    }

    pub(crate) fn reader_exited(&self, me: thread::ThreadId) {
        let mut slot = lock(&self.reader);
        if slot.thread == Some(me) {
            slot.thread = None;
            // joined by nobody; the thread is finishing anyway
            slot.handle = None;
            slot.mode = ReaderMode::Stopped;
        }
        debug!("reader exited for {}", self.endpoint_name());
    }

    pub(crate) fn reader_should_stop(&self, delivered: RequestId) -> bool {
        let mut slot = lock(&self.reader);
        let stop = match slot.mode {
            ReaderMode::Continue => false,
            ReaderMode::StopOnId(id) => id == delivered,
            ReaderMode::StopReading | ReaderMode::Stopped => true,
        };
        if stop {
            slot.mode = ReaderMode::Stopped;
        }
        stop
    }

    pub(crate) fn current_input(&self) -> io::Result<SharedInput> {
        lock(&self.io)
            .input
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no input stream"))
    }

    /// Handle a read failure, tearing the connection down unless it was expected.
    pub(crate) fn reader_failed(&self, err: io::Error) {
        let mode = lock(&self.reader).mode;
        if mode == ReaderMode::StopReading || !self.is_connected() {
            debug!("reader of {} stopped: {}", self.endpoint_name(), err);
            return;
        }
        let (host, port) = self.endpoint();
        let fault = if self.server_shutdown.load(Ordering::SeqCst) {
            Fault::ServerShutdown { host, port }
        } else {
            Fault::ConnectionLost {
                host,
                port,
                detail: err.to_string(),
            }
        };
        warn!("connection to {} lost: {}", self.endpoint_name(), err);
        self.shutdown("reader failure", 0, Some(fault));
    }

    // Routing

    /// Hand an incoming frame to the request waiting for it.
    pub(crate) fn route(&self, msg: LdapMessage) {
        let state = lock(&self.messages).get(&msg.id).cloned();
        match state {
            Some(state) => {
                let id = msg.id;
                if !state.put_reply(msg) {
                    self.drop_frame(id);
                }
            }
            None if msg.id == UNSOLICITED_ID => self.notify_listeners(msg),
            None => self.drop_frame(msg.id),
        }
    }

    fn drop_frame(&self, id: RequestId) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        warn!("dropping reply to message {}, nobody is waiting", id);
    }

    fn notify_listeners(&self, msg: LdapMessage) {
        if msg.response_name().as_deref() == Some(NOTICE_OF_DISCONNECTION_OID) {
            self.server_shutdown.store(true, Ordering::SeqCst);
            debug!("notice of disconnection from {}", self.endpoint_name());
        }
        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            let msg = msg.clone();
            if let Err(e) = dispatch::spawn_detached(move || listener.notification(msg)) {
                warn!("unsolicited notification not dispatched: {}", e);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn server_shut_down(&self) -> bool {
        self.server_shutdown.load(Ordering::SeqCst)
    }
}
