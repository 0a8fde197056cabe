use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
#[cfg(feature = "tls-native")]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "tls-native")]
use std::sync::Mutex;
use std::time::Duration;

use crate::result::{LdapError, Result};

#[cfg(feature = "tls-native")]
use native_tls::{HandshakeError, TlsConnector, TlsStream};

/// Default port for plain LDAP connections.
pub const DEFAULT_PORT: u16 = 389;
/// Default port for LDAP over TLS.
pub const DEFAULT_SSL_PORT: u16 = 636;

/// Byte stream to the server.
///
/// A transport hands out one reading and one writing half. The reading half is used
/// only by the connection's reader thread; the writing half only under the write gate.
pub trait Transport: Send + Sync {
    /// Produce the reading and the writing half of the stream.
    fn split(&self) -> io::Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)>;

    /// Close the stream, unblocking a reader waiting on it.
    ///
    /// Closing a TLS layer shuts down only that layer, so that the plain stream
    /// underneath stays usable.
    fn close(&self) -> io::Result<()>;

    /// Negotiate TLS over this stream, returning the secured transport.
    ///
    /// The original transport is left intact and can be used again once the
    /// TLS layer is closed.
    fn start_tls(&self, host: &str, settings: &LdapConnSettings) -> Result<Arc<dyn Transport>>;

    /// True if the stream is protected by TLS.
    fn is_tls(&self) -> bool {
        false
    }
}

/// Factory of transports, used to open the connection to a server.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        host: &str,
        port: u16,
        settings: &LdapConnSettings,
    ) -> io::Result<Arc<dyn Transport>>;
}

/// Connection settings.
///
/// Built from [`new()`](#method.new) with chained `set_*` calls. Settings are
/// copied into every connection made with them, referral connections included.
#[derive(Clone, Default)]
pub struct LdapConnSettings {
    conn_timeout: Option<Duration>,
    #[cfg(feature = "tls-native")]
    tls_connector: Option<TlsConnector>,
    #[cfg(feature = "tls-native")]
    no_tls_verify: bool,
    secure: bool,
    starttls: bool,
    connector: Option<Arc<dyn Connector>>,
}

impl LdapConnSettings {
    /// Plain TCP on the standard port, no timeout.
    pub fn new() -> LdapConnSettings {
        LdapConnSettings {
            ..Default::default()
        }
    }

    /// Give up on opening the socket after `timeout`. Without it, the
    /// operating system's timeout applies.
    pub fn set_conn_timeout(mut self, timeout: Duration) -> Self {
        self.conn_timeout = Some(timeout);
        self
    }

    pub fn conn_timeout(&self) -> Option<Duration> {
        self.conn_timeout
    }

    #[cfg(feature = "tls-native")]
    /// TLS connector to use instead of one built with default options.
    pub fn set_tls_connector(mut self, connector: TlsConnector) -> Self {
        self.tls_connector = Some(connector);
        self
    }

    #[cfg(feature = "tls-native")]
    /// Skip certificate and host name checks. Only for testing.
    pub fn set_no_tls_verify(mut self, no_tls_verify: bool) -> Self {
        self.no_tls_verify = no_tls_verify;
        self
    }

    /// If `true`, negotiate TLS as soon as the connection is opened, as for
    /// an `ldaps://` URL. Defaults to `false`.
    pub fn set_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    /// If `true`, use the StartTLS extended operation right after connecting.
    /// Defaults to `false`.
    pub fn set_starttls(mut self, starttls: bool) -> Self {
        self.starttls = starttls;
        self
    }

    pub fn starttls(&self) -> bool {
        self.starttls
    }

    /// Use a custom transport factory instead of plain TCP.
    pub fn set_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        match self.connector {
            Some(ref connector) => connector.clone(),
            None => Arc::new(TcpConnector),
        }
    }

    pub(crate) fn default_port(&self) -> u16 {
        if self.secure {
            DEFAULT_SSL_PORT
        } else {
            DEFAULT_PORT
        }
    }

    #[cfg(feature = "tls-native")]
    fn create_tls_connector(&self) -> Result<TlsConnector> {
        if let Some(ref connector) = self.tls_connector {
            return Ok(connector.clone());
        }
        let mut builder = TlsConnector::builder();
        if self.no_tls_verify {
            builder.danger_accept_invalid_certs(true);
        }
        Ok(builder.build()?)
    }
}

/// Plain TCP transport factory.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(
        &self,
        host: &str,
        port: u16,
        settings: &LdapConnSettings,
    ) -> io::Result<Arc<dyn Transport>> {
        let mut last_err = None;
        let mut stream = None;
        for addr in (host, port).to_socket_addrs()? {
            let res = match settings.conn_timeout() {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match res {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let stream = match stream {
            Some(stream) => stream,
            None => {
                return Err(last_err.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "no address for host")
                }))
            }
        };
        stream.set_nodelay(true)?;
        let transport = TcpTransport { stream };
        if settings.secure() {
            return transport.start_tls(host, settings).map_err(io::Error::from);
        }
        Ok(Arc::new(transport))
    }
}

#[derive(Debug)]
pub(crate) struct TcpTransport {
    stream: TcpStream,
}

impl Transport for TcpTransport {
    fn split(&self) -> io::Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
        let reader = self.stream.try_clone()?;
        // the socket may come back from a TLS layer, which polls with a timeout
        reader.set_read_timeout(None)?;
        let writer = self.stream.try_clone()?;
        Ok((Box::new(reader), Box::new(writer)))
    }

    fn close(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }

    #[cfg(feature = "tls-native")]
    fn start_tls(&self, host: &str, settings: &LdapConnSettings) -> Result<Arc<dyn Transport>> {
        let connector = settings.create_tls_connector()?;
        let stream = self.stream.try_clone()?;
        let tls = match connector.connect(host, stream) {
            Ok(tls) => tls,
            Err(HandshakeError::Failure(e)) => return Err(LdapError::from(e)),
            Err(HandshakeError::WouldBlock(_)) => {
                return Err(LdapError::from(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "TLS handshake interrupted",
                )))
            }
        };
        tls.get_ref().set_read_timeout(Some(TLS_POLL_INTERVAL))?;
        Ok(Arc::new(TlsTransport {
            stream: Arc::new(Mutex::new(tls)),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }

    #[cfg(not(feature = "tls-native"))]
    fn start_tls(&self, _host: &str, _settings: &LdapConnSettings) -> Result<Arc<dyn Transport>> {
        Err(LdapError::from(io::Error::new(
            io::ErrorKind::Unsupported,
            "TLS support not compiled in",
        )))
    }
}

#[cfg(feature = "tls-native")]
const TLS_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// TLS session shared by the reading and the writing half.
///
/// A TLS stream can't be split, so both halves lock the same session. The reader
/// holds the lock only for one read with a short socket timeout, letting writers in
/// between polls.
#[cfg(feature = "tls-native")]
pub(crate) struct TlsTransport {
    stream: Arc<Mutex<TlsStream<TcpStream>>>,
    closed: Arc<AtomicBool>,
}

#[cfg(feature = "tls-native")]
struct TlsReader {
    stream: Arc<Mutex<TlsStream<TcpStream>>>,
    closed: Arc<AtomicBool>,
}

#[cfg(feature = "tls-native")]
impl Read for TlsReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "TLS layer closed",
                ));
            }
            let res = self
                .stream
                .lock()
                .map_err(|_| io::Error::other("TLS stream lock poisoned"))?
                .read(buf);
            match res {
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    std::thread::yield_now();
                }
                res => return res,
            }
        }
    }
}

#[cfg(feature = "tls-native")]
struct TlsWriter {
    stream: Arc<Mutex<TlsStream<TcpStream>>>,
}

#[cfg(feature = "tls-native")]
impl Write for TlsWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream
            .lock()
            .map_err(|_| io::Error::other("TLS stream lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream
            .lock()
            .map_err(|_| io::Error::other("TLS stream lock poisoned"))?
            .flush()
    }
}

#[cfg(feature = "tls-native")]
impl Transport for TlsTransport {
    fn split(&self) -> io::Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
        let reader = TlsReader {
            stream: self.stream.clone(),
            closed: self.closed.clone(),
        };
        let writer = TlsWriter {
            stream: self.stream.clone(),
        };
        Ok((Box::new(reader), Box::new(writer)))
    }

    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        let mut stream = self
            .stream
            .lock()
            .map_err(|_| io::Error::other("TLS stream lock poisoned"))?;
        stream.shutdown()
    }

    fn start_tls(&self, _host: &str, _settings: &LdapConnSettings) -> Result<Arc<dyn Transport>> {
        Err(LdapError::from(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "TLS already active",
        )))
    }

    fn is_tls(&self) -> bool {
        true
    }
}
