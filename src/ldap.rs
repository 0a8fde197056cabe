use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use crate::agent::MessageAgent;
use crate::conn::Connection;
use crate::controls::{IntoRawControlVec, RawControl};
use crate::filter::Filter;
use crate::gate::WriteLease;
use crate::protocol::{LdapMessage, LdapRequest, BIND_REQUEST};
use crate::queue::{ResponseQueue, SearchQueue, SearchResults};
use crate::reader::UnsolicitedListener;
use crate::referral::{ReferralAuth, ReferralChase};
use crate::request::{self, Exop, Mod, Scope, SearchOptions, LDAP_V3};
use crate::result::{
    CompareResult, ExopResult, LdapError, LdapResult, LdapResultExt, Result, REFERRAL,
    SASL_BIND_IN_PROGRESS,
};
use crate::transport::LdapConnSettings;
use crate::util::{parse_host_list, url_endpoint};
use crate::RequestId;

use lber::structure::{StructureTag, PL};
use url::Url;

const DEFAULT_HOP_LIMIT: u32 = 10;

/// Identity established by a successful Bind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindProperties {
    pub protocol_version: i32,
    /// Bind DN; empty for anonymous and SASL binds.
    pub dn: String,
    /// `"simple"` or `"sasl"`.
    pub method: String,
    /// SASL mechanism, if the method is `"sasl"`.
    pub mechanism: Option<String>,
    pub anonymous: bool,
}

impl BindProperties {
    pub(crate) fn simple(dn: &str, anonymous: bool) -> BindProperties {
        BindProperties {
            protocol_version: LDAP_V3 as i32,
            dn: dn.to_owned(),
            method: "simple".into(),
            mechanism: None,
            anonymous,
        }
    }

    pub(crate) fn sasl(mech: &str) -> BindProperties {
        BindProperties {
            protocol_version: LDAP_V3 as i32,
            dn: String::new(),
            method: "sasl".into(),
            mechanism: Some(mech.to_owned()),
            anonymous: false,
        }
    }

    /// Properties of an arbitrary Bind request, if its layout is recognized.
    fn from_op(op: &StructureTag) -> Option<BindProperties> {
        let PL::C(ref comps) = op.payload else {
            return None;
        };
        let dn = comps.get(1)?.clone().expect_primitive()?;
        let dn = String::from_utf8(dn).ok()?;
        let auth = comps.get(2)?;
        match (auth.id, &auth.payload) {
            (0, PL::P(pw)) => Some(BindProperties::simple(&dn, pw.is_empty())),
            (3, PL::C(sasl)) => {
                let mech = sasl.first()?.clone().expect_primitive()?;
                let mut props = BindProperties::sasl(&String::from_utf8(mech).ok()?);
                props.dn = dn;
                Some(props)
            }
            _ => None,
        }
    }
}

/// Per-handle operation options.
///
/// Every operation started through an [`LdapConnection`](struct.LdapConnection.html)
/// uses its handle's constraints. A cloned handle starts with a copy.
#[derive(Clone)]
pub struct Constraints {
    time_limit_ms: u64,
    controls: Option<Vec<RawControl>>,
    referral_following: bool,
    hop_limit: u32,
    referral_auth: Option<Arc<dyn ReferralAuth>>,
    search_options: SearchOptions,
}

impl fmt::Debug for Constraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constraints")
            .field("time_limit_ms", &self.time_limit_ms)
            .field("controls", &self.controls)
            .field("referral_following", &self.referral_following)
            .field("hop_limit", &self.hop_limit)
            .field("referral_auth", &self.referral_auth.is_some())
            .field("search_options", &self.search_options)
            .finish()
    }
}

impl Default for Constraints {
    fn default() -> Self {
        Constraints {
            time_limit_ms: 0,
            controls: None,
            referral_following: false,
            hop_limit: DEFAULT_HOP_LIMIT,
            referral_auth: None,
            search_options: SearchOptions::new(),
        }
    }
}

impl Constraints {
    pub fn new() -> Self {
        Constraints::default()
    }

    /// Client-side time limit for each operation, in milliseconds. Zero,
    /// the default, means no limit.
    pub fn set_time_limit(mut self, ms: u64) -> Self {
        self.time_limit_ms = ms;
        self
    }

    pub fn time_limit(&self) -> u64 {
        self.time_limit_ms
    }

    /// Controls attached to every request.
    pub fn set_controls<V: IntoRawControlVec>(mut self, controls: V) -> Self {
        self.controls = Some(controls.into());
        self
    }

    pub fn controls(&self) -> Option<&[RawControl]> {
        self.controls.as_deref()
    }

    /// Follow referrals instead of returning them.
    pub fn set_referral_following(mut self, follow: bool) -> Self {
        self.referral_following = follow;
        self
    }

    pub fn referral_following(&self) -> bool {
        self.referral_following
    }

    /// Maximum number of referrals followed for one operation.
    pub fn set_hop_limit(mut self, limit: u32) -> Self {
        self.hop_limit = limit;
        self
    }

    pub fn hop_limit(&self) -> u32 {
        self.hop_limit
    }

    /// Credentials for binding to referred servers. Without a provider, the
    /// binds are anonymous.
    pub fn set_referral_auth(mut self, auth: Arc<dyn ReferralAuth>) -> Self {
        self.referral_auth = Some(auth);
        self
    }

    pub(crate) fn referral_auth(&self) -> Option<Arc<dyn ReferralAuth>> {
        self.referral_auth.clone()
    }

    pub fn set_search_options(mut self, opts: SearchOptions) -> Self {
        self.search_options = opts;
        self
    }

    pub fn search_options(&self) -> &SearchOptions {
        &self.search_options
    }
}

/// Handle to a shared LDAP connection.
///
/// Operations are blocking: each one sends its request and waits for the result.
/// Several threads may use clones of the same handle at the same time, their
/// operations are multiplexed on the same socket. For asynchronous use, requests
/// can be sent with [`send_request()`](#method.send_request) and
/// [`search_async()`](#method.search_async), and the responses read from the
/// returned queues.
///
/// Each clone counts as a user of the connection. The connection is closed when
/// the last handle is disconnected or dropped.
#[derive(Debug)]
pub struct LdapConnection {
    conn: Arc<Connection>,
    constraints: Constraints,
}

impl Clone for LdapConnection {
    fn clone(&self) -> Self {
        self.conn.add_clone();
        LdapConnection {
            conn: self.conn.clone(),
            constraints: self.constraints.clone(),
        }
    }
}

impl Drop for LdapConnection {
    fn drop(&mut self) {
        self.conn.destroy_clone(false);
    }
}

impl Default for LdapConnection {
    fn default() -> Self {
        LdapConnection::new()
    }
}

impl LdapConnection {
    /// Unconnected handle with default settings.
    pub fn new() -> LdapConnection {
        LdapConnection::with_settings(LdapConnSettings::new())
    }

    pub fn with_settings(settings: LdapConnSettings) -> LdapConnection {
        LdapConnection {
            conn: Connection::new(settings),
            constraints: Constraints::default(),
        }
    }

    /// Connect to the server named by an `ldap://` or `ldaps://` URL.
    pub fn from_url(url: &Url) -> Result<LdapConnection> {
        LdapConnection::from_url_with_settings(LdapConnSettings::new(), url)
    }

    pub fn from_url_with_settings(settings: LdapConnSettings, url: &Url) -> Result<LdapConnection> {
        let (host, port, secure) = url_endpoint(url)?;
        let settings = if secure {
            settings.set_secure(true)
        } else {
            settings
        };
        let ldap = LdapConnection::with_settings(settings);
        ldap.conn.connect(&host, port, 0)?;
        ldap.after_connect()?;
        Ok(ldap)
    }

    /// Connect to the first reachable server of a host list.
    ///
    /// `hosts` is a space-separated list of `host` or `host:port` elements, tried
    /// in order; `port` applies to the elements without one, and zero picks the
    /// standard port. If the settings ask for StartTLS, it's negotiated once
    /// connected. Connecting a handle which shares its connection reconnects it
    /// for every clone.
    pub fn connect(&self, hosts: &str, port: u16) -> Result<()> {
        let mut last_err = None;
        for (host, port) in parse_host_list(hosts, port)? {
            match self.conn.connect(&host, port, 0) {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    debug!("connecting to {}:{} failed: {}", host, port, e);
                    last_err = Some(e);
                }
            }
        }
        if let Some(e) = last_err {
            return Err(e);
        }
        self.after_connect()
    }

    fn after_connect(&self) -> Result<()> {
        if self.conn.settings().starttls() && !self.conn.is_tls() {
            self.start_tls()?;
        }
        Ok(())
    }

    /// Give up this handle's share of the connection.
    ///
    /// The connection is closed if no other handle uses it. Either way, this
    /// handle ends up unconnected, and may be connected again.
    pub fn disconnect(&mut self) {
        if let Some(conn) = self.conn.destroy_clone(true) {
            self.conn = conn;
        }
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    pub fn set_constraints(&mut self, constraints: Constraints) {
        self.constraints = constraints;
    }

    fn request(&self, op: lber::structures::Tag) -> LdapRequest {
        LdapRequest::new(op).set_controls(self.constraints.controls.clone())
    }

    fn timeout(&self) -> u64 {
        self.constraints.time_limit_ms
    }

    fn referral_chase(&self) -> Option<ReferralChase> {
        if self.constraints.referral_following {
            Some(ReferralChase::new(&self.conn, &self.constraints))
        } else {
            None
        }
    }

    /// Send a request with a single response and wait for it, following referrals
    /// if the constraints say so.
    fn single(&self, req: LdapRequest) -> Result<LdapMessage> {
        let agent = MessageAgent::new();
        let id = agent.send(&self.conn, req.clone(), self.timeout(), None)?;
        let mut msg = agent.get_message(Some(id))?.ok_or(LdapError::EndOfStream)?;
        let Some(mut chase) = self.referral_chase() else {
            return Ok(msg);
        };
        let mut req = req;
        let mut hops = 0;
        loop {
            let res = msg.result()?;
            if res.rc != REFERRAL {
                return Ok(msg);
            }
            hops += 1;
            let (id, resent) = chase.send(&res.refs, &req, hops, &agent)?;
            msg = agent.get_message(Some(id))?.ok_or(LdapError::EndOfStream)?;
            req = resent;
        }
    }

    // Binds

    /// Simple Bind. An empty password makes it an anonymous bind, whatever the DN.
    pub fn simple_bind(&self, dn: &str, pw: &str) -> Result<LdapResult> {
        let anonymous = pw.is_empty();
        let dn = if anonymous { "" } else { dn };
        let req = self.request(request::simple_bind_op(dn, pw.as_bytes()));
        let agent = MessageAgent::new();
        let props = BindProperties::simple(dn, anonymous);
        let id = agent.send(&self.conn, req, self.timeout(), Some(props))?;
        agent
            .get_message(Some(id))?
            .ok_or(LdapError::EndOfStream)?
            .result()
    }

    /// SASL Bind with mechanism `mech`.
    ///
    /// `creds` are the initial client credentials. While the server answers with
    /// saslBindInProgress, `step` is called with the server's challenge and must
    /// return the client's response. The write gate is held for the whole
    /// exchange, so no other request goes out in between.
    pub fn sasl_bind<F>(&self, mech: &str, creds: Option<&[u8]>, mut step: F) -> Result<LdapResult>
    where
        F: FnMut(&[u8]) -> Result<Vec<u8>>,
    {
        let sem = self.conn.begin_sasl_bind();
        let res = self.sasl_exchange(sem, mech, creds, &mut step);
        self.conn.end_sasl_bind(sem);
        res
    }

    fn sasl_exchange(
        &self,
        sem: RequestId,
        mech: &str,
        creds: Option<&[u8]>,
        step: &mut dyn FnMut(&[u8]) -> Result<Vec<u8>>,
    ) -> Result<LdapResult> {
        let agent = MessageAgent::new();
        let mut creds = creds.map(<[u8]>::to_vec);
        loop {
            let req = self.request(request::sasl_bind_op(mech, creds.as_deref()));
            let props = BindProperties::sasl(mech);
            let id = agent.send_held(&self.conn, req, self.timeout(), Some(props), sem)?;
            let msg = agent.get_message(Some(id))?.ok_or(LdapError::EndOfStream)?;
            let LdapResultExt(mut res, _, server_creds) = msg.result_ext()?;
            res.ctrls = msg.controls;
            if res.rc != SASL_BIND_IN_PROGRESS {
                return Ok(res);
            }
            creds = Some(step(server_creds.as_deref().unwrap_or_default())?);
            // A shutdown between steps takes the gate back; the exchange can't resume
            // on a new connection.
            if !self.conn.is_connected() || self.conn.bind_semaphore() != Some(sem) {
                return Err(LdapError::NotConnected);
            }
        }
    }

    /// SASL EXTERNAL Bind, using the identity established by the transport.
    pub fn sasl_external_bind(&self) -> Result<LdapResult> {
        self.sasl_bind("EXTERNAL", Some(b""), |_| Ok(vec![]))
    }

    // Operations

    /// Send any request, adding its responses to `queue`, or to a fresh queue.
    ///
    /// The handle's controls are attached if the request has none. A Bind request
    /// holds the write gate until its response arrives.
    pub fn send_request(&self, req: LdapRequest, queue: Option<&ResponseQueue>) -> Result<ResponseQueue> {
        let queue = queue.cloned().unwrap_or_default();
        let req = if req.controls.is_none() {
            req.set_controls(self.constraints.controls.clone())
        } else {
            req
        };
        let bind = if req.op_type() == BIND_REQUEST {
            BindProperties::from_op(&req.op)
        } else {
            None
        };
        queue.as_ref().send(&self.conn, req, self.timeout(), bind)?;
        Ok(queue)
    }

    fn search_request<S: AsRef<str>>(
        &self,
        base: &str,
        scope: Scope,
        filter: &Filter,
        attrs: impl IntoIterator<Item = S>,
    ) -> LdapRequest {
        let opts = &self.constraints.search_options;
        self.request(request::search_op(base, scope, opts, filter, attrs))
    }

    /// Search, iterating over the results as they arrive.
    pub fn search<S: AsRef<str>>(
        &self,
        base: &str,
        scope: Scope,
        filter: Filter,
        attrs: impl IntoIterator<Item = S>,
    ) -> Result<SearchResults> {
        let req = self.search_request(base, scope, &filter, attrs);
        let queue = SearchQueue::new();
        let id = queue.as_ref().send(&self.conn, req.clone(), self.timeout(), None)?;
        Ok(SearchResults::new(queue, req, id, self.referral_chase()))
    }

    /// Start a search, adding its responses to `queue`, or to a fresh queue.
    /// Referrals aren't followed.
    pub fn search_async<S: AsRef<str>>(
        &self,
        base: &str,
        scope: Scope,
        filter: Filter,
        attrs: impl IntoIterator<Item = S>,
        queue: Option<&SearchQueue>,
    ) -> Result<SearchQueue> {
        let queue = queue.cloned().unwrap_or_default();
        let req = self.search_request(base, scope, &filter, attrs);
        queue.as_ref().send(&self.conn, req, self.timeout(), None)?;
        Ok(queue)
    }

    /// Compare the value(s) of `attr` of the entry `dn` with `val`.
    pub fn compare<B: AsRef<[u8]>>(&self, dn: &str, attr: &str, val: B) -> Result<CompareResult> {
        let msg = self.single(self.request(request::compare_op(dn, attr, val.as_ref())))?;
        Ok(CompareResult(msg.result()?))
    }

    /// Add the entry `dn`. Every attribute must have at least one value.
    pub fn add<S: AsRef<[u8]> + Eq + Hash>(
        &self,
        dn: &str,
        attrs: Vec<(S, HashSet<S>)>,
    ) -> Result<LdapResult> {
        self.single(self.request(request::add_op(dn, attrs)?))?.result()
    }

    /// Modify the entry `dn`, applying `mods` in order as a single change.
    pub fn modify<S: AsRef<[u8]> + Eq + Hash>(&self, dn: &str, mods: Vec<Mod<S>>) -> Result<LdapResult> {
        self.single(self.request(request::modify_op(dn, mods)?))?.result()
    }

    /// Rename the entry `dn` to `rdn`, optionally moving it under `new_sup`.
    pub fn modify_dn(
        &self,
        dn: &str,
        rdn: &str,
        delete_old: bool,
        new_sup: Option<&str>,
    ) -> Result<LdapResult> {
        let op = request::modifydn_op(dn, rdn, delete_old, new_sup);
        self.single(self.request(op))?.result()
    }

    pub fn delete(&self, dn: &str) -> Result<LdapResult> {
        self.single(self.request(request::delete_op(dn)))?.result()
    }

    pub fn extended<E: Into<Exop>>(&self, exop: E) -> Result<ExopResult> {
        let msg = self.single(self.request(request::extended_op(exop.into())))?;
        let LdapResultExt(mut res, exop, _) = msg.result_ext()?;
        res.ctrls = msg.controls;
        Ok(ExopResult(exop, res))
    }

    /// Abandon message `id`, sent through any handle of this connection.
    ///
    /// Returns false if the message isn't outstanding.
    pub fn abandon(&self, id: RequestId) -> bool {
        self.conn.abandon_message(id)
    }

    /// Abandon every request of a queue.
    pub fn abandon_queue(&self, queue: &impl AsRef<MessageAgent>) {
        queue.as_ref().abandon_all()
    }

    // TLS

    /// Negotiate TLS with the StartTLS extended operation.
    ///
    /// Refused while operations are outstanding on the connection.
    pub fn start_tls(&self) -> Result<()> {
        let conn = &self.conn;
        if !conn.is_connected() {
            return Err(LdapError::NotConnected);
        }
        let lease = conn.gate().lease(0);
        if !conn.messages_complete() {
            return Err(LdapError::OutstandingOperations);
        }
        let req = LdapRequest::new(request::start_tls_op());
        let id = req.id();
        conn.stop_reader_on_reply(id);
        let res = self.negotiate_tls(&lease, req);
        let resumed = conn.resume_reader(id);
        drop(lease);
        res?;
        resumed
    }

    fn negotiate_tls(&self, lease: &WriteLease<'_>, req: LdapRequest) -> Result<()> {
        let agent = MessageAgent::new();
        let id = agent.send_held(&self.conn, req, self.timeout(), None, lease.id())?;
        agent
            .get_message(Some(id))?
            .ok_or(LdapError::EndOfStream)?
            .result()?
            .success()?;
        self.conn.start_tls(lease)
    }

    /// Drop TLS, continuing on the plain connection.
    pub fn stop_tls(&self) -> Result<()> {
        if !self.conn.is_tls() {
            return Err(LdapError::NoStartTls);
        }
        let lease = self.conn.gate().lease(0);
        if !self.conn.messages_complete() {
            return Err(LdapError::OutstandingOperations);
        }
        self.conn.stop_tls(&lease)
    }

    // Status

    pub fn is_tls(&self) -> bool {
        self.conn.is_tls()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    pub fn is_bound(&self) -> bool {
        self.conn.is_bound()
    }

    pub fn host(&self) -> Option<String> {
        self.conn.host()
    }

    pub fn port(&self) -> Option<u16> {
        self.conn.port()
    }

    pub fn bind_properties(&self) -> Option<BindProperties> {
        self.conn.bind_properties()
    }

    /// DN of the last successful Bind; `None` if not bound or bound anonymously.
    pub fn authentication_dn(&self) -> Option<String> {
        self.conn
            .bind_properties()
            .filter(|p| !p.anonymous && !p.dn.is_empty())
            .map(|p| p.dn)
    }

    /// `"simple"` or `"sasl"`; `"none"` if not bound.
    pub fn authentication_method(&self) -> String {
        self.conn
            .bind_properties()
            .map_or_else(|| "none".to_owned(), |p| p.method)
    }

    pub fn protocol_version(&self) -> i32 {
        self.conn
            .bind_properties()
            .map_or(LDAP_V3 as i32, |p| p.protocol_version)
    }

    pub fn add_unsolicited_listener(&self, listener: Arc<dyn UnsolicitedListener>) {
        self.conn.add_unsolicited_listener(listener)
    }

    pub fn remove_unsolicited_listener(&self, listener: &Arc<dyn UnsolicitedListener>) -> bool {
        self.conn.remove_unsolicited_listener(listener)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::{self, MockConnector};
    use crate::protocol::{
        ADD_REQUEST, ADD_RESPONSE, BIND_RESPONSE, COMPARE_RESPONSE, DEL_RESPONSE,
        EXTENDED_REQUEST, EXTENDED_RESPONSE, MODDN_REQUEST, MODDN_RESPONSE, MODIFY_REQUEST,
        MODIFY_RESPONSE, SEARCH_REQUEST, SEARCH_RESULT_DONE,
    };
    use crate::SearchItem;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    fn directory() -> Arc<MockConnector> {
        MockConnector::scripted(|msg| match msg.op_type() {
            BIND_REQUEST => match mock::sasl_creds(msg) {
                Some((_, None)) => vec![mock::sasl_op(14, b"nonce")],
                Some((_, Some(creds))) if creds == b"nonce-signed" => {
                    vec![mock::sasl_op(0, b"")]
                }
                Some(_) => vec![mock::result_op(BIND_RESPONSE, 49)],
                None if mock::request_dn(msg) == "cn=bad" => {
                    vec![mock::result_op(BIND_RESPONSE, 49)]
                }
                None => vec![mock::result_op(BIND_RESPONSE, 0)],
            },
            SEARCH_REQUEST => vec![
                mock::entry_op("cn=a,o=test"),
                mock::entry_op("cn=b,o=test"),
                mock::result_op(SEARCH_RESULT_DONE, 0),
            ],
            EXTENDED_REQUEST => vec![mock::extended_result_op(0, None)],
            crate::protocol::COMPARE_REQUEST => vec![mock::result_op(COMPARE_RESPONSE, 6)],
            crate::protocol::DEL_REQUEST => vec![mock::result_op(DEL_RESPONSE, 32)],
            ADD_REQUEST => vec![mock::result_op(ADD_RESPONSE, 68)],
            MODIFY_REQUEST => vec![mock::result_op(MODIFY_RESPONSE, 0)],
            MODDN_REQUEST if mock::request_dn(msg) == "cn=a,o=test" => {
                vec![mock::result_op(MODDN_RESPONSE, 0)]
            }
            MODDN_REQUEST => vec![mock::result_op(MODDN_RESPONSE, 32)],
            _ => vec![],
        })
    }

    fn connected(connector: &Arc<MockConnector>) -> LdapConnection {
        let ldap = LdapConnection::with_settings(mock::settings(connector));
        ldap.connect(mock::HOST, 0).expect("connect");
        ldap
    }

    #[test]
    fn simple_bind_records_identity() {
        let connector = directory();
        let ldap = connected(&connector);
        assert_eq!(ldap.authentication_method(), "none");
        ldap.simple_bind("cn=admin,o=test", "secret")
            .expect("bind")
            .success()
            .expect("success");
        assert!(ldap.is_bound());
        assert_eq!(ldap.authentication_dn().as_deref(), Some("cn=admin,o=test"));
        assert_eq!(ldap.authentication_method(), "simple");
        assert_eq!(ldap.protocol_version(), 3);
        let res = ldap.simple_bind("cn=bad", "wrong").expect("bind");
        assert_eq!(res.rc, 49);
        assert!(!ldap.is_bound());
        assert_eq!(ldap.connection().gate().owner(), 0);
    }

    #[test]
    fn empty_password_binds_anonymously() {
        let connector = directory();
        let ldap = connected(&connector);
        ldap.simple_bind("cn=admin,o=test", "").expect("bind");
        let props = ldap.bind_properties().expect("bound");
        assert!(props.anonymous);
        assert_eq!(props.dn, "");
        assert_eq!(ldap.authentication_dn(), None);
    }

    #[test]
    fn sasl_exchange_runs_every_step() {
        let connector = directory();
        let ldap = connected(&connector);
        let mut challenges = vec![];
        let res = ldap
            .sasl_bind("TEST", None, |challenge| {
                challenges.push(challenge.to_vec());
                Ok([challenge, b"-signed"].concat())
            })
            .expect("bind");
        assert_eq!(res.rc, 0);
        assert_eq!(challenges, vec![b"nonce".to_vec()]);
        let props = ldap.bind_properties().expect("bound");
        assert_eq!(props.mechanism.as_deref(), Some("TEST"));
        assert_eq!(ldap.authentication_method(), "sasl");
        assert_eq!(ldap.connection().bind_semaphore(), None);
        assert_eq!(ldap.connection().gate().owner(), 0);
    }

    #[test]
    fn failed_sasl_step_releases_the_gate() {
        let connector = directory();
        let ldap = connected(&connector);
        let res = ldap.sasl_bind("TEST", None, |_| {
            Err(LdapError::Decoding("bad challenge"))
        });
        assert!(matches!(res, Err(LdapError::Decoding(_))));
        assert_eq!(ldap.connection().bind_semaphore(), None);
        assert_eq!(ldap.connection().gate().owner(), 0);
        assert!(!ldap.is_bound());
        assert!(ldap.delete("cn=x,o=test").is_ok());
    }

    #[test]
    fn sasl_bind_keeps_other_writers_out() {
        let connector = MockConnector::manual();
        let ldap = LdapConnection::with_settings(mock::settings(&connector));
        ldap.connect(mock::HOST, 0).expect("connect");
        let mut server = connector.accept();
        let other = ldap.clone();
        let binder = thread::spawn(move || {
            other.sasl_bind("TEST", None, |_| Ok(b"response".to_vec()))
        });
        let first = server.recv();
        assert_eq!(first.op_type(), BIND_REQUEST);
        let deleter = {
            let ldap = ldap.clone();
            thread::spawn(move || ldap.delete("cn=x,o=test").map(|r| r.rc))
        };
        server.reply(first.id, mock::sasl_op(14, b"challenge"));
        let second = server.recv();
        assert_eq!(second.op_type(), BIND_REQUEST);
        assert_eq!(mock::sasl_creds(&second), Some(("TEST".into(), Some(b"response".to_vec()))));
        server.reply(second.id, mock::sasl_op(0, b""));
        let delete = server.recv();
        assert_eq!(delete.op_type(), crate::protocol::DEL_REQUEST);
        server.reply(delete.id, mock::result_op(DEL_RESPONSE, 0));
        assert_eq!(binder.join().expect("binder").expect("bind").rc, 0);
        assert_eq!(deleter.join().expect("deleter").expect("delete"), 0);
    }

    #[test]
    fn start_tls_and_back() {
        let connector = directory();
        let ldap = connected(&connector);
        ldap.simple_bind("cn=admin,o=test", "secret").expect("bind");
        ldap.start_tls().expect("start tls");
        assert!(ldap.is_tls());
        ldap.stop_tls().expect("stop tls");
        assert!(!ldap.is_tls());
        assert!(ldap.is_bound());
        let cmp = ldap.compare("cn=a,o=test", "cn", "a").expect("compare");
        assert!(cmp.equal().expect("equal"));
        assert!(matches!(ldap.stop_tls(), Err(LdapError::NoStartTls)));
    }

    #[test]
    fn starttls_setting_applies_on_connect() {
        let connector = directory();
        let settings = mock::settings(&connector).set_starttls(true);
        let ldap = LdapConnection::with_settings(settings);
        ldap.connect(mock::HOST, 0).expect("connect");
        assert!(ldap.is_tls());
    }

    #[test]
    fn tls_change_refused_with_outstanding_operations() {
        let connector = MockConnector::manual();
        let ldap = LdapConnection::with_settings(mock::settings(&connector));
        ldap.connect(mock::HOST, 0).expect("connect");
        let mut server = connector.accept();
        let queue = ldap
            .search_async("o=test", Scope::Subtree, Filter::present("cn"), ["cn"], None)
            .expect("search");
        let search = server.recv();
        assert!(matches!(ldap.start_tls(), Err(LdapError::OutstandingOperations)));
        assert_eq!(ldap.connection().gate().owner(), 0);
        server.reply(search.id, mock::result_op(SEARCH_RESULT_DONE, 0));
        mock::wait_until("search done", || queue.is_complete(search.id));
        let tls = thread::spawn(move || {
            let res = ldap.start_tls();
            (res, ldap)
        });
        let exop = server.recv();
        assert_eq!(exop.op_type(), EXTENDED_REQUEST);
        server.reply(exop.id, mock::extended_result_op(0, None));
        let (res, ldap) = tls.join().expect("start tls");
        res.expect("start tls");
        assert!(ldap.is_tls());
    }

    #[test]
    fn search_iterates_entries() {
        let connector = directory();
        let ldap = connected(&connector);
        let mut results = ldap
            .search("o=test", Scope::Subtree, Filter::present("objectClass"), ["cn"])
            .expect("search");
        let dns: Vec<_> = results
            .by_ref()
            .map(|item| match item.expect("item") {
                SearchItem::Entry(e) => e.dn,
                item => panic!("unexpected item: {:?}", item),
            })
            .collect();
        assert_eq!(dns, vec!["cn=a,o=test", "cn=b,o=test"]);
        assert_eq!(results.finish().expect("result").rc, 0);
    }

    #[test]
    fn operation_results_and_exops() {
        let connector = directory();
        let ldap = connected(&connector);
        let err = ldap.delete("cn=missing,o=test").expect("delete").success();
        assert!(matches!(err, Err(LdapError::LdapResult { ref result }) if result.rc == 32));
        let (exop, res) = ldap
            .extended(Exop::new("1.3.6.1.4.1.4203.1.11.3", None))
            .expect("exop")
            .success()
            .expect("success");
        assert_eq!(res.rc, 0);
        assert_eq!(exop.name, None);
    }

    #[test]
    fn host_list_falls_through_to_a_live_server() {
        let connector = MockConnector::manual();
        connector.refuse("down.test");
        let ldap = LdapConnection::with_settings(mock::settings(&connector));
        ldap.connect("down.test ldap.test:2389", 0).expect("connect");
        assert_eq!(
            connector.connects(),
            vec![("down.test".to_owned(), 389), ("ldap.test".to_owned(), 2389)]
        );
        assert_eq!(ldap.port(), Some(2389));
        let ldap = LdapConnection::with_settings(mock::settings(&connector));
        assert!(matches!(ldap.connect("down.test", 0), Err(LdapError::Connect { .. })));
    }

    #[test]
    fn clones_share_the_connection() {
        let connector = directory();
        let mut ldap = connected(&connector);
        let clone = ldap.clone();
        ldap.disconnect();
        assert!(!ldap.is_connected());
        assert_eq!(ldap.host().as_deref(), Some(mock::HOST));
        assert!(clone.is_connected());
        assert_eq!(connector.closed(), 0);
        drop(clone);
        assert_eq!(connector.closed(), 1);
        ldap.connect(mock::HOST, 0).expect("reconnect");
        assert!(ldap.is_connected());
    }

    #[test]
    fn abandon_by_message_id() {
        let connector = MockConnector::manual();
        let ldap = LdapConnection::with_settings(mock::settings(&connector));
        ldap.connect(mock::HOST, 0).expect("connect");
        let mut server = connector.accept();
        let queue = ldap
            .search_async("o=test", Scope::Subtree, Filter::present("cn"), ["cn"], None)
            .expect("search");
        let id = queue.message_ids()[0];
        server.recv();
        assert!(ldap.abandon(id));
        assert!(!ldap.abandon(id));
        assert_eq!(mock::abandoned_id(&server.recv()), id);
        assert!(queue.get_response().expect("abandoned").is_none());
    }

    #[test]
    fn listener_hears_disconnection_notice() {
        let connector = MockConnector::manual();
        let ldap = LdapConnection::with_settings(mock::settings(&connector));
        ldap.connect(mock::HOST, 0).expect("connect");
        let server = connector.accept();
        let heard = Arc::new(AtomicUsize::new(0));
        let count = heard.clone();
        let listener: Arc<dyn UnsolicitedListener> = Arc::new(move |msg: LdapMessage| {
            assert_eq!(msg.op_type(), EXTENDED_RESPONSE);
            count.fetch_add(1, Ordering::SeqCst);
        });
        ldap.add_unsolicited_listener(listener.clone());
        server.notice_of_disconnection();
        mock::wait_until("notice", || heard.load(Ordering::SeqCst) == 1);
        assert!(ldap.remove_unsolicited_listener(&listener));
    }

    #[test]
    fn update_operations() {
        let connector = directory();
        let ldap = connected(&connector);
        let attrs = vec![("objectClass", HashSet::from(["person"])), ("cn", HashSet::from(["a"]))];
        assert_eq!(ldap.add("cn=a,o=test", attrs).expect("add").rc, 68);
        let empty = vec![("cn", HashSet::new())];
        assert!(matches!(ldap.add("cn=b,o=test", empty), Err(LdapError::AddNoValues)));
        let mods = vec![
            Mod::Replace("sn", HashSet::from(["z"])),
            Mod::Delete("mail", HashSet::new()),
        ];
        ldap.modify("cn=a,o=test", mods)
            .expect("modify")
            .success()
            .expect("success");
        ldap.modify_dn("cn=a,o=test", "cn=c", true, Some("ou=moved,o=test"))
            .expect("moddn")
            .success()
            .expect("success");
        let res = ldap.modify_dn("cn=gone,o=test", "cn=c", false, None).expect("moddn");
        assert_eq!(res.rc, 32);
        assert_eq!(ldap.connection().outstanding(), 0);
    }

    #[test]
    fn stop_tls_on_ldaps_leaves_the_connection_alone() {
        let connector = directory();
        let ldap = LdapConnection::with_settings(mock::settings(&connector).set_secure(true));
        ldap.connect(mock::HOST, 0).expect("connect");
        assert!(ldap.is_tls());
        assert!(matches!(ldap.stop_tls(), Err(LdapError::NoStartTls)));
        assert!(ldap.is_tls());
        assert!(ldap.is_connected());
        assert!(ldap.connection().reader_running());
        assert_eq!(ldap.connection().gate().owner(), 0);
        assert_eq!(ldap.delete("cn=x,o=test").expect("delete").rc, 32);
    }

    #[test]
    fn connection_lost_between_sasl_steps() {
        let connector = MockConnector::manual();
        let ldap = LdapConnection::with_settings(mock::settings(&connector));
        ldap.connect(mock::HOST, 0).expect("connect");
        let mut server = connector.accept();
        let (stepped, step_seen) = mpsc::channel();
        let (resume, resumed) = mpsc::channel::<()>();
        let binder = {
            let ldap = ldap.clone();
            thread::spawn(move || {
                ldap.sasl_bind("TEST", None, |_| {
                    stepped.send(()).expect("stepped");
                    resumed.recv().expect("resume");
                    Ok(b"response".to_vec())
                })
            })
        };
        let first = server.recv();
        server.reply(first.id, mock::sasl_op(14, b"challenge"));
        step_seen.recv().expect("step");
        assert!(ldap.connection().bind_semaphore().is_some());
        server.fail_reads();
        mock::wait_until("reader exit", || !ldap.connection().reader_running());
        assert!(!ldap.is_connected());
        assert_eq!(ldap.connection().bind_semaphore(), None);
        resume.send(()).expect("resume");
        let res = binder.join().expect("binder");
        assert!(matches!(res, Err(LdapError::NotConnected)), "{:?}", res);
        assert_eq!(ldap.connection().gate().owner(), 0);
        assert!(!ldap.is_bound());
        assert_eq!(connector.connects().len(), 1);
    }
}
