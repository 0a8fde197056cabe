//! Operation result structures, errors and helpers.
//!
//! Most LDAP operations return an [`LdapResult`](struct.LdapResult.html). This module
//! contains its definition, the crate-wide [`LdapError`](enum.LdapError.html), and
//! the [`Fault`](enum.Fault.html) type used to tell a waiting caller why its request
//! will never get a server reply.

use std::error::Error;
use std::fmt;
use std::io;
use std::result::Result as StdResult;

use crate::controls::Control;
use crate::request::Exop;
use crate::RequestId;

use lber::common::TagClass;
use lber::parse::parse_uint;
use lber::structure::StructureTag;
use lber::universal::Types;

use thiserror::Error;

/// Type alias for the standard `Result` with the fixed `LdapError` error part.
pub type Result<T> = std::result::Result<T, LdapError>;

/// Reason why an outstanding request was cut off locally.
///
/// A fault is queued in place of a server reply, so that a caller blocked on
/// the request wakes up with a distinguishable error instead of hanging. Faults
/// local to one request (a timeout) reach only that request's waiter; faults
/// invalidating the whole connection are broadcast to every outstanding request.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Fault {
    /// The per-request time limit expired before the server replied.
    #[error("client timed out waiting for a reply to message {0}")]
    Timeout(RequestId),

    /// The reader failed on the transport; the connection is gone.
    #[error("connection to {host}:{port} lost: {detail}")]
    ConnectionLost {
        host: String,
        port: u16,
        detail: String,
    },

    /// The server announced its shutdown with a Notice of Disconnection.
    #[error("server {host}:{port} shut down the connection")]
    ServerShutdown { host: String, port: u16 },
}

/// Error variants recognized by the library.
#[derive(Debug, Error)]
pub enum LdapError {
    /// Encapsulated I/O error.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Opening the transport to the server failed.
    #[error("cannot connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        source: io::Error,
    },

    /// Writing a request on a live connection failed.
    #[error("I/O error communicating with {host}:{port}: {source}")]
    ConnectionIo {
        host: String,
        port: u16,
        source: io::Error,
    },

    /// A write failed after the server had sent a Notice of Disconnection.
    #[error("server {host}:{port} has shut down the connection")]
    ServerShutdown { host: String, port: u16 },

    /// A Bind over TLS failed at the transport level.
    #[error("TLS connection to {host}:{port} failed: {}", describe_problems(.problems))]
    TlsHandshake {
        host: String,
        port: u16,
        problems: Vec<String>,
    },

    /// The operation needs a connected handle.
    #[error("not connected")]
    NotConnected,

    /// The request was cut off before a server reply arrived.
    #[error("request interrupted: {fault}")]
    Interrupted {
        #[from]
        fault: Fault,
    },

    /// StartTLS or StopTLS was attempted with operations still outstanding.
    #[error("cannot change TLS state with outstanding operations")]
    OutstandingOperations,

    /// StopTLS was attempted on a connection without TLS.
    #[error("TLS is not active on the connection")]
    NoStartTls,

    /// A request was sent with the ID of a request still in flight.
    #[error("message id {0} already in use")]
    DuplicateMessageId(RequestId),

    /// A server message couldn't be parsed.
    #[error("decoding error: {0}")]
    Decoding(&'static str),

    /// Error converting an octet- or percent-decoded string to UTF-8.
    #[error("utf8 decoding error")]
    DecodingUTF8,

    /// The response stream of a request ended before its final result.
    #[error("premature end of response stream")]
    EndOfStream,

    /// URL parsing error.
    #[error("url parse error: {source}")]
    UrlParsing {
        #[from]
        source: url::ParseError,
    },

    /// Unknown LDAP URL scheme.
    #[error("unknown LDAP URL scheme: {0}")]
    UnknownScheme(String),

    /// Invalid scope string in LDAP URL.
    #[error("invalid scope string in LDAP URL: {0}")]
    InvalidScopeString(String),

    /// Unrecognized LDAP URL extension marked as critical.
    #[error("unrecognized critical LDAP URL extension: {0}")]
    UnrecognizedCriticalExtension(String),

    /// An attribute of an Add has no values.
    #[error("empty value set for Add")]
    AddNoValues,

    /// An empty host list was given to `connect()`.
    #[error("no host to connect to")]
    EmptyHostList,

    /// A `host:port` element of a host list has an unparseable port.
    #[error("invalid host specification: {0}")]
    InvalidHost(String),

    /// Referral following went beyond the configured hop limit.
    #[error("referral hop limit {0} exceeded")]
    ReferralLimit(u32),

    /// The request can't be resent to a referred server.
    #[error("improper referral for protocol operation {0}")]
    ImproperReferral(u64),

    /// None of the referral URLs could be followed.
    #[error("error following referral {failed}: {source}")]
    Referral {
        refs: Vec<String>,
        failed: String,
        source: Box<LdapError>,
    },

    #[cfg(feature = "tls-native")]
    /// Native TLS library error.
    #[error("native TLS error: {source}")]
    NativeTLS {
        #[from]
        source: native_tls::Error,
    },

    /// LDAP operation result with an error return code.
    #[error("LDAP operation result: {result}")]
    LdapResult {
        #[from]
        result: LdapResult,
    },
}

fn describe_problems(problems: &[String]) -> String {
    if problems.is_empty() {
        String::from("unknown certificate problem")
    } else {
        problems.join("; ")
    }
}

impl From<LdapError> for io::Error {
    fn from(le: LdapError) -> io::Error {
        match le {
            LdapError::Io { source, .. } => source,
            _ => io::Error::other(format!("{}", le)),
        }
    }
}

/// Server's verdict on an operation: the LDAPResult components and response controls.
///
/// Only the result code tells success from failure. [`success()`](#method.success)
/// and [`non_error()`](#method.non_error) convert it into a `Result` for `?` chains.
#[derive(Clone, Debug, Default)]
pub struct LdapResult {
    /// Result code, see [RFC 4511, A.1](https://tools.ietf.org/html/rfc4511#appendix-A.1).
    /// Zero is success; a few other codes aren't errors either.
    pub rc: u32,
    /// Matched DN.
    pub matched: String,
    /// Diagnostic message.
    pub text: String,
    /// Referral URLs; empty unless the code is 10.
    pub refs: Vec<String>,
    /// Response controls, possibly none.
    pub ctrls: Vec<Control>,
}

impl Error for LdapResult {}

impl fmt::Display for LdapResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> StdResult<(), fmt::Error> {
        write!(
            f,
            "rc={} ({}), dn: \"{}\", text: \"{}\"",
            self.rc,
            rc_name(self.rc),
            self.matched,
            self.text
        )
    }
}

/// Symbolic name of an LDAP result code.
pub fn rc_name(rc: u32) -> &'static str {
    match rc {
        0 => "success",
        1 => "operationsError",
        2 => "protocolError",
        3 => "timeLimitExceeded",
        4 => "sizeLimitExceeded",
        5 => "compareFalse",
        6 => "compareTrue",
        7 => "authMethodNotSupported",
        8 => "strongerAuthRequired",
        10 => "referral",
        11 => "adminLimitExceeded",
        12 => "unavailableCriticalExtension",
        13 => "confidentialityRequired",
        14 => "saslBindInProgress",
        16 => "noSuchAttribute",
        17 => "undefinedAttributeType",
        18 => "inappropriateMatching",
        19 => "constraintViolation",
        20 => "attributeOrValueExists",
        21 => "invalidAttributeSyntax",
        32 => "noSuchObject",
        33 => "aliasProblem",
        34 => "invalidDNSyntax",
        36 => "aliasDereferencingProblem",
        48 => "inappropriateAuthentication",
        49 => "invalidCredentials",
        50 => "insufficientAccessRights",
        51 => "busy",
        52 => "unavailable",
        53 => "unwillingToPerform",
        54 => "loopDetect",
        64 => "namingViolation",
        65 => "objectClassViolation",
        66 => "notAllowedOnNonLeaf",
        67 => "notAllowedOnRDN",
        68 => "entryAlreadyExists",
        69 => "objectClassModsProhibited",
        71 => "affectsMultipleDSAs",
        80 => "other",
        88 => "abandoned",
        122 => "assertionFailed",
        _ => "unknown",
    }
}

/// Result code of an intermediate SASL Bind response.
pub(crate) const SASL_BIND_IN_PROGRESS: u32 = 14;
/// Result code of a referral.
pub(crate) const REFERRAL: u32 = 10;

impl LdapResult {
    /// `Ok(self)` for result code 0, an `LdapError::LdapResult` otherwise.
    pub fn success(self) -> Result<Self> {
        if self.rc == 0 {
            Ok(self)
        } else {
            Err(LdapError::from(self))
        }
    }

    /// Like [`success()`](#method.success), but a referral (10) also passes.
    pub fn non_error(self) -> Result<Self> {
        if self.rc == 0 || self.rc == REFERRAL {
            Ok(self)
        } else {
            Err(LdapError::from(self))
        }
    }
}

/// Parsed LDAPResult together with the Extended and SASL Bind response parts.
#[derive(Clone, Debug)]
pub(crate) struct LdapResultExt(pub LdapResult, pub Exop, pub Option<Vec<u8>>);

fn octet_string(t: Option<StructureTag>) -> Result<String> {
    let bytes = t
        .and_then(|t| t.expect_primitive())
        .ok_or(LdapError::Decoding("octet string"))?;
    String::from_utf8(bytes).map_err(|_| LdapError::DecodingUTF8)
}

impl TryFrom<StructureTag> for LdapResultExt {
    type Error = LdapError;

    fn try_from(t: StructureTag) -> Result<LdapResultExt> {
        let mut tags = t
            .expect_constructed()
            .ok_or(LdapError::Decoding("result sequence"))?
            .into_iter();
        let rc = tags
            .next()
            .and_then(|t| t.match_class(TagClass::Universal))
            .and_then(|t| t.match_id(Types::Enumerated as u64))
            .and_then(|t| t.expect_primitive())
            .ok_or(LdapError::Decoding("result code"))?;
        let rc = match parse_uint(rc.as_slice()) {
            Ok((_, rc)) => rc as u32,
            _ => return Err(LdapError::Decoding("result code")),
        };
        let matched = octet_string(tags.next())?;
        let text = octet_string(tags.next())?;
        let mut refs = Vec::new();
        let mut exop_name = None;
        let mut exop_val = None;
        let mut sasl_creds = None;
        for comp in tags {
            match comp.id {
                3 => refs.extend(parse_refs(comp)?),
                7 => {
                    sasl_creds = Some(
                        comp.expect_primitive()
                            .ok_or(LdapError::Decoding("sasl credentials"))?,
                    )
                }
                10 => exop_name = Some(octet_string(Some(comp))?),
                11 => {
                    exop_val = Some(
                        comp.expect_primitive()
                            .ok_or(LdapError::Decoding("exop value"))?,
                    )
                }
                _ => (),
            }
        }
        Ok(LdapResultExt(
            LdapResult {
                rc,
                matched,
                text,
                refs,
                ctrls: vec![],
            },
            Exop {
                name: exop_name,
                val: exop_val,
            },
            sasl_creds,
        ))
    }
}

/// URLs of a referral sequence.
pub fn parse_refs(t: StructureTag) -> Result<Vec<String>> {
    t.expect_constructed()
        .ok_or(LdapError::Decoding("referrals"))?
        .into_iter()
        .map(|t| octet_string(Some(t)))
        .collect()
}

/// Result of a Compare.
///
/// A Compare that ran reports its answer with codes 5 (compareFalse) and
/// 6 (compareTrue) rather than 0.
#[derive(Clone, Debug)]
pub struct CompareResult(pub LdapResult);

impl CompareResult {
    /// The answer of the comparison, or the result as an error for any other code.
    pub fn equal(self) -> Result<bool> {
        match self.0.rc {
            5 => Ok(false),
            6 => Ok(true),
            _ => Err(LdapError::from(self.0)),
        }
    }

    /// The inner result for codes 5, 6 and 10, an error otherwise.
    pub fn non_error(self) -> Result<LdapResult> {
        if self.0.rc == 5 || self.0.rc == 6 || self.0.rc == REFERRAL {
            Ok(self.0)
        } else {
            Err(LdapError::from(self.0))
        }
    }
}

/// Result of an Extended operation, with the response name and value.
#[derive(Clone, Debug)]
pub struct ExopResult(pub Exop, pub LdapResult);

impl ExopResult {
    /// Both parts for result code 0, the result as an error otherwise.
    pub fn success(self) -> Result<(Exop, LdapResult)> {
        if self.1.rc == 0 {
            Ok((self.0, self.1))
        } else {
            Err(LdapError::from(self.1))
        }
    }
}
