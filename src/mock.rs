//! In-memory transport and directory server for tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::conn::Connection;
use crate::protocol::{
    LdapCodec, LdapMessage, BIND_RESPONSE, EXTENDED_RESPONSE, NOTICE_OF_DISCONNECTION_OID,
    SEARCH_RESULT_ENTRY, SEARCH_RESULT_REFERENCE,
};
use crate::result::Result;
use crate::transport::{Connector, LdapConnSettings, Transport};
use crate::RequestId;

use bytes::BytesMut;
use lber::common::TagClass;
use lber::structure::PL;
use lber::structures::{ASNTag, Enumerated, OctetString, Sequence, Set, Tag};
use tokio_util::codec::{Decoder, Encoder};

pub(crate) const HOST: &str = "ldap.test";

// Writes are cut into pieces this small, so that unserialized writers would garble frames.
const WRITE_CHUNK: usize = 5;
const PATIENCE: Duration = Duration::from_secs(5);

pub(crate) fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + PATIENCE;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

pub(crate) fn settings(connector: &Arc<MockConnector>) -> LdapConnSettings {
    LdapConnSettings::new().set_connector(connector.clone())
}

pub(crate) fn connected(connector: &Arc<MockConnector>) -> Arc<Connection> {
    let conn = Connection::new(settings(connector));
    conn.connect(HOST, 0, 0).expect("mock connect");
    conn
}

#[derive(Default)]
struct PipeState {
    data: VecDeque<u8>,
    closed: bool,
    failed: bool,
}

#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    cond: Condvar,
}

impl Pipe {
    fn push(&self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().expect("pipe");
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        state.data.extend(bytes);
        self.cond.notify_all();
        Ok(())
    }

    fn pull(
        &self,
        out: &mut [u8],
        abort: Option<&AtomicBool>,
        deadline: Option<Instant>,
    ) -> io::Result<usize> {
        let mut state = self.state.lock().expect("pipe");
        loop {
            if abort.is_some_and(|a| a.load(Ordering::SeqCst)) {
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "layer closed"));
            }
            if state.failed {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "forced failure"));
            }
            if !state.data.is_empty() {
                let n = out.len().min(state.data.len());
                for (slot, byte) in out.iter_mut().zip(state.data.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
            if deadline.is_some_and(|d| Instant::now() > d) {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "nothing to read"));
            }
            state = self
                .cond
                .wait_timeout(state, Duration::from_millis(10))
                .expect("pipe")
                .0;
        }
    }

    fn close(&self) {
        self.state.lock().expect("pipe").closed = true;
        self.cond.notify_all();
    }

    fn fail(&self) {
        self.state.lock().expect("pipe").failed = true;
        self.cond.notify_all();
    }
}

#[derive(Default)]
struct Wire {
    to_server: Pipe,
    to_client: Pipe,
    writes: AtomicUsize,
    broken: AtomicBool,
}

struct MockReader {
    wire: Arc<Wire>,
    abort: Arc<AtomicBool>,
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.wire.to_client.pull(buf, Some(&self.abort), None)
    }
}

struct MockWriter {
    wire: Arc<Wire>,
}

impl Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.wire.broken.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write side broken"));
        }
        let n = buf.len().min(WRITE_CHUNK);
        self.wire.to_server.push(&buf[..n])?;
        self.wire.writes.fetch_add(1, Ordering::SeqCst);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Client end of an in-memory connection. The TLS layer only flips a flag.
struct MockTransport {
    wire: Arc<Wire>,
    tls: bool,
    layer_closed: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
}

impl Transport for MockTransport {
    fn split(&self) -> io::Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
        let reader = MockReader {
            wire: self.wire.clone(),
            abort: self.layer_closed.clone(),
        };
        let writer = MockWriter {
            wire: self.wire.clone(),
        };
        Ok((Box::new(reader), Box::new(writer)))
    }

    fn close(&self) -> io::Result<()> {
        self.layer_closed.store(true, Ordering::SeqCst);
        if !self.tls {
            self.wire.to_client.close();
            self.wire.to_server.close();
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn start_tls(&self, _host: &str, _settings: &LdapConnSettings) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(MockTransport {
            wire: self.wire.clone(),
            tls: true,
            layer_closed: Arc::new(AtomicBool::new(false)),
            closes: self.closes.clone(),
        }))
    }

    fn is_tls(&self) -> bool {
        self.tls
    }
}

type Script = Arc<dyn Fn(&LdapMessage) -> Vec<Tag> + Send + Sync>;

/// Opens in-memory connections. Server ends are either handed to the test
/// through [`accept()`](#method.accept), or driven by a script.
#[derive(Default)]
pub(crate) struct MockConnector {
    pending: Mutex<VecDeque<ServerEnd>>,
    arrived: Condvar,
    script: Option<Script>,
    refused: Mutex<Vec<String>>,
    connects: Mutex<Vec<(String, u16)>>,
    closes: Arc<AtomicUsize>,
}

impl MockConnector {
    pub(crate) fn manual() -> Arc<MockConnector> {
        Arc::new(MockConnector::default())
    }

    /// Every request is answered with the replies `script` returns for it.
    pub(crate) fn scripted<F>(script: F) -> Arc<MockConnector>
    where
        F: Fn(&LdapMessage) -> Vec<Tag> + Send + Sync + 'static,
    {
        Arc::new(MockConnector {
            script: Some(Arc::new(script)),
            ..Default::default()
        })
    }

    pub(crate) fn accept(&self) -> ServerEnd {
        let deadline = Instant::now() + PATIENCE;
        let mut pending = self.pending.lock().expect("pending");
        loop {
            if let Some(server) = pending.pop_front() {
                return server;
            }
            assert!(Instant::now() < deadline, "no connection to accept");
            pending = self
                .arrived
                .wait_timeout(pending, Duration::from_millis(10))
                .expect("pending")
                .0;
        }
    }

    pub(crate) fn refuse(&self, host: &str) {
        self.refused.lock().expect("refused").push(host.to_owned());
    }

    /// Number of plain transports closed.
    pub(crate) fn closed(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn connects(&self) -> Vec<(String, u16)> {
        self.connects.lock().expect("connects").clone()
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        host: &str,
        port: u16,
        settings: &LdapConnSettings,
    ) -> io::Result<Arc<dyn Transport>> {
        self.connects
            .lock()
            .expect("connects")
            .push((host.to_owned(), port));
        if self.refused.lock().expect("refused").iter().any(|h| h == host) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        let wire = Arc::new(Wire::default());
        let server = ServerEnd {
            wire: wire.clone(),
            buf: BytesMut::new(),
        };
        match self.script {
            Some(ref script) => server.serve(script.clone()),
            None => {
                self.pending.lock().expect("pending").push_back(server);
                self.arrived.notify_all();
            }
        }
        Ok(Arc::new(MockTransport {
            wire,
            tls: settings.secure(),
            layer_closed: Arc::new(AtomicBool::new(false)),
            closes: self.closes.clone(),
        }))
    }
}

/// Server end of an in-memory connection.
pub(crate) struct ServerEnd {
    wire: Arc<Wire>,
    buf: BytesMut,
}

impl ServerEnd {
    fn try_recv(&mut self) -> Option<LdapMessage> {
        let mut chunk = [0u8; 512];
        loop {
            if let Some(msg) = LdapCodec.decode(&mut self.buf).expect("client frame") {
                return Some(msg);
            }
            let deadline = Instant::now() + PATIENCE;
            match self.wire.to_server.pull(&mut chunk, None, Some(deadline)) {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
            }
        }
    }

    /// Next request written by the client.
    pub(crate) fn recv(&mut self) -> LdapMessage {
        self.try_recv().expect("client request")
    }

    pub(crate) fn reply(&self, id: RequestId, op: Tag) {
        let mut buf = BytesMut::new();
        LdapCodec
            .encode((id, op.into_structure(), None), &mut buf)
            .expect("encode reply");
        // the client may be gone already
        let _ = self.wire.to_client.push(&buf);
    }

    pub(crate) fn notice_of_disconnection(&self) {
        self.reply(0, extended_result_op(52, Some(NOTICE_OF_DISCONNECTION_OID)));
    }

    /// Make the client's next read fail.
    pub(crate) fn fail_reads(&self) {
        self.wire.to_client.fail();
    }

    /// Make every write from the client fail, leaving reads alone.
    pub(crate) fn fail_writes(&self) {
        self.wire.broken.store(true, Ordering::SeqCst);
    }

    pub(crate) fn close(&self) {
        self.wire.to_client.close();
        self.wire.to_server.close();
    }

    /// Number of write calls the client made.
    pub(crate) fn writes(&self) -> usize {
        self.wire.writes.load(Ordering::SeqCst)
    }

    fn serve(mut self, script: Script) {
        thread::spawn(move || {
            while let Some(msg) = self.try_recv() {
                for op in script(&msg) {
                    self.reply(msg.id, op);
                }
            }
        });
    }
}

fn octet_string(s: &[u8]) -> Tag {
    Tag::OctetString(OctetString {
        inner: s.to_vec(),
        ..Default::default()
    })
}

fn result_components(rc: u32) -> Vec<Tag> {
    vec![
        Tag::Enumerated(Enumerated {
            inner: rc as i64,
            ..Default::default()
        }),
        octet_string(b""),
        octet_string(b""),
    ]
}

/// Result of protocol operation `op` with code `rc`.
pub(crate) fn result_op(op: u64, rc: u32) -> Tag {
    Tag::Sequence(Sequence {
        id: op,
        class: TagClass::Application,
        inner: result_components(rc),
    })
}

/// Referral result of protocol operation `op`.
pub(crate) fn referral_op(op: u64, urls: &[&str]) -> Tag {
    let mut inner = result_components(10);
    inner.push(Tag::Sequence(Sequence {
        id: 3,
        class: TagClass::Context,
        inner: urls.iter().map(|u| octet_string(u.as_bytes())).collect(),
    }));
    Tag::Sequence(Sequence {
        id: op,
        class: TagClass::Application,
        inner,
    })
}

/// Bind response carrying SASL credentials.
pub(crate) fn sasl_op(rc: u32, creds: &[u8]) -> Tag {
    let mut inner = result_components(rc);
    inner.push(Tag::OctetString(OctetString {
        id: 7,
        class: TagClass::Context,
        inner: creds.to_vec(),
    }));
    Tag::Sequence(Sequence {
        id: BIND_RESPONSE,
        class: TagClass::Application,
        inner,
    })
}

pub(crate) fn extended_result_op(rc: u32, name: Option<&str>) -> Tag {
    let mut inner = result_components(rc);
    if let Some(name) = name {
        inner.push(Tag::OctetString(OctetString {
            id: 10,
            class: TagClass::Context,
            inner: Vec::from(name),
        }));
    }
    Tag::Sequence(Sequence {
        id: EXTENDED_RESPONSE,
        class: TagClass::Application,
        inner,
    })
}

/// Search entry with a single `cn` value.
pub(crate) fn entry_op(dn: &str) -> Tag {
    Tag::Sequence(Sequence {
        id: SEARCH_RESULT_ENTRY,
        class: TagClass::Application,
        inner: vec![
            octet_string(dn.as_bytes()),
            Tag::Sequence(Sequence {
                inner: vec![Tag::Sequence(Sequence {
                    inner: vec![
                        octet_string(b"cn"),
                        Tag::Set(Set {
                            inner: vec![octet_string(b"x")],
                            ..Default::default()
                        }),
                    ],
                    ..Default::default()
                })],
                ..Default::default()
            }),
        ],
    })
}

pub(crate) fn reference_op(urls: &[&str]) -> Tag {
    Tag::Sequence(Sequence {
        id: SEARCH_RESULT_REFERENCE,
        class: TagClass::Application,
        inner: urls.iter().map(|u| octet_string(u.as_bytes())).collect(),
    })
}

/// Target of an Abandon request.
pub(crate) fn abandoned_id(msg: &LdapMessage) -> RequestId {
    let val = msg.op.clone().expect_primitive().expect("abandon payload");
    lber::parse::parse_uint(&val).expect("message id").1 as RequestId
}

/// First string component of a request: the DN of most operations, the base of
/// a Search, the name of a Bind.
pub(crate) fn request_dn(msg: &LdapMessage) -> String {
    let comps = match msg.op.payload {
        PL::C(ref comps) => comps,
        PL::P(ref dn) => return String::from_utf8_lossy(dn).into_owned(),
    };
    let idx = if msg.op.id == 0 { 1 } else { 0 };
    let dn = comps[idx].clone().expect_primitive().expect("dn");
    String::from_utf8(dn).expect("utf-8 dn")
}

/// Mechanism and credentials of a SASL Bind; `None` for other Binds.
pub(crate) fn sasl_creds(msg: &LdapMessage) -> Option<(String, Option<Vec<u8>>)> {
    let PL::C(ref comps) = msg.op.payload else {
        return None;
    };
    let auth = comps.get(2)?;
    match (auth.id, &auth.payload) {
        (3, PL::C(sasl)) => {
            let mech = sasl.first()?.clone().expect_primitive()?;
            let creds = sasl.get(1).and_then(|c| c.clone().expect_primitive());
            Some((String::from_utf8(mech).ok()?, creds))
        }
        _ => None,
    }
}
