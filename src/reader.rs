//! Background reader of a connection.
//!
//! One thread per live connection decodes frames from the inbound stream and
//! routes them to the waiting requests. The thread exits on an I/O failure,
//! or when its mode tells it to stop.

use std::io::{self, Read};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use crate::conn::Connection;
use crate::protocol::{LdapCodec, LdapMessage};
use crate::RequestId;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

const READ_CHUNK: usize = 8192;

/// What the reader does after routing a frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReaderMode {
    /// Keep reading.
    #[default]
    Continue,
    /// Exit after delivering the reply to the given message. StartTLS uses this
    /// so that nothing reads the socket while the handshake runs.
    StopOnId(RequestId),
    /// Exit at the next opportunity; the stream is being closed on purpose.
    StopReading,
    /// The reader has exited.
    Stopped,
}

/// Receiver of unsolicited notifications.
///
/// Each notification is delivered on a pooled worker thread, so a listener
/// may block without holding up the connection. Closures taking an
/// [`LdapMessage`](../struct.LdapMessage.html) implement the trait.
pub trait UnsolicitedListener: Send + Sync {
    fn notification(&self, msg: LdapMessage);
}

impl<F> UnsolicitedListener for F
where
    F: Fn(LdapMessage) + Send + Sync,
{
    fn notification(&self, msg: LdapMessage) {
        self(msg)
    }
}

/// Reader thread bookkeeping, kept by the connection.
#[derive(Debug, Default)]
pub(crate) struct ReaderSlot {
    pub(crate) handle: Option<JoinHandle<()>>,
    pub(crate) thread: Option<ThreadId>,
    pub(crate) mode: ReaderMode,
}

pub(crate) fn spawn(conn: Arc<Connection>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("ldapconn-reader".into())
        .spawn(move || run(conn))
}

struct ExitGuard(Arc<Connection>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.reader_exited(thread::current().id());
    }
}

fn run(conn: Arc<Connection>) {
    let guard = ExitGuard(conn);
    let conn = &guard.0;
    debug!("reader started for {}", conn.endpoint_name());
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut codec = LdapCodec;
    loop {
        let msg = match codec.decode(&mut buf) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                if let Err(e) = fill(conn, &mut buf) {
                    conn.reader_failed(e);
                    return;
                }
                continue;
            }
            Err(e) => {
                conn.reader_failed(e);
                return;
            }
        };
        let id = msg.id;
        trace!("frame for message {} on {}", id, conn.endpoint_name());
        conn.route(msg);
        if conn.reader_should_stop(id) {
            debug!("reader stopping after message {}", id);
            return;
        }
    }
}

fn fill(conn: &Connection, buf: &mut BytesMut) -> io::Result<()> {
    // captured once per read, the streams may be swapped between frames
    let input = conn.current_input()?;
    let mut chunk = [0u8; READ_CHUNK];
    let n = input.lock().expect("input stream lock").read(&mut chunk)?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by server",
        ));
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(())
}

pub(crate) type SharedInput = Arc<Mutex<Box<dyn Read + Send>>>;
