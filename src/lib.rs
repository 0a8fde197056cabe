//! A pure-Rust LDAP client built around a shared, multiplexed connection.
//!
//! ## Usage
//!
//! In `Cargo.toml`:
//!
//! ```toml
//! [dependencies.ldapconn]
//! version = "0.1.0"
//! ```
//!
//! ## Summary
//!
//! A single physical connection to the directory server carries any number of concurrent
//! operations. Each request is identified by its protocol message ID; one background reader
//! thread per connection decodes incoming frames and hands each one to the caller waiting for
//! that ID. Writers take turns on the socket through a keyed write gate, which a Bind (simple
//! or multi-step SASL) holds for the whole exchange.
//!
//! [`LdapConnection`](struct.LdapConnection.html) is the starting point. It's a handle to the
//! shared connection: cloning the handle makes another user of the same socket, and the socket
//! is closed when the last handle is disconnected or dropped. Operations either block for their
//! result ([`simple_bind()`](struct.LdapConnection.html#method.simple_bind),
//! [`search()`](struct.LdapConnection.html#method.search), ...) or return a queue from which
//! the responses can be read later ([`send_request()`](struct.LdapConnection.html#method.send_request),
//! [`search_async()`](struct.LdapConnection.html#method.search_async)).
//!
//! The documentation is written for readers familiar with LDAP concepts and terminology,
//! which it won't attempt to explain.
//!
//! ## Compile-time features
//!
//! * __tls__ (enabled by default): TLS support, backed by the `native-tls` crate, which uses
//!   a platform-specific TLS backend. This is an alias for __tls-native__. Both `ldaps://`
//!   connections and the StartTLS/StopTLS operations depend on it.
//!
//! Without any features, only plain TCP connections are available.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ldapconn::{Filter, LdapConnection, Scope, SearchItem};
//! use ldapconn::result::Result;
//!
//! fn main() -> Result<()> {
//!     let mut ldap = LdapConnection::new();
//!     ldap.connect("localhost:2389 ldap.example.org", 0)?;
//!     ldap.simple_bind("cn=Manager,dc=example,dc=org", "secret")?.success()?;
//!     let mut results = ldap.search(
//!         "ou=Places,dc=example,dc=org",
//!         Scope::Subtree,
//!         Filter::eq("objectClass", "locality"),
//!         vec!["l"],
//!     )?;
//!     for item in results.by_ref() {
//!         if let SearchItem::Entry(entry) = item? {
//!             println!("{:?}", entry);
//!         }
//!     }
//!     results.finish()?.success()?;
//!     ldap.disconnect();
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

#[doc(hidden)]
#[macro_use]
pub extern crate log;

/// Type alias for the LDAP message ID.
pub type RequestId = i32;

mod agent;
pub mod asn1 {
    //! ASN.1 structure construction and parsing.
    //!
    //! Requests and responses travel through the crate as BER structures. These re-exports
    //! make it possible to build requests the library doesn't construct itself, and to pick
    //! apart responses it doesn't parse.
    pub use lber::common::TagClass;
    pub use lber::parse::{parse_tag, parse_uint};
    pub use lber::structure::{PL, StructureTag};
    pub use lber::structures::{
        ASNTag, Boolean, Enumerated, ExplicitTag, Integer, Null, OctetString, Sequence, Set, Tag,
    };
    pub use lber::universal::Types;
}
mod conn;
pub mod controls;
mod dispatch;
mod filter;
mod gate;
mod ldap;
mod message;
#[cfg(test)]
mod mock;
mod protocol;
mod queue;
mod reader;
mod referral;
pub mod request;
pub mod result;
mod transport;
mod util;

pub use agent::MessageAgent;
pub use conn::Connection;
pub use filter::Filter;
pub use gate::{WriteGate, WriteLease};
pub use ldap::{BindProperties, Constraints, LdapConnection};
pub use protocol::{LdapMessage, LdapRequest, next_message_id};
pub use queue::{
    ResponseQueue, SearchEntry, SearchItem, SearchQueue, SearchResponse, SearchResults,
};
pub use reader::{ReaderMode, UnsolicitedListener};
pub use referral::ReferralAuth;
pub use request::{DerefAliases, Exop, Mod, Scope, SearchOptions};
pub use result::{Fault, LdapError, LdapResult};
pub use transport::{Connector, LdapConnSettings, TcpConnector, Transport};
pub use util::{LdapUrlExt, LdapUrlParams, get_url_params, parse_host_list};
