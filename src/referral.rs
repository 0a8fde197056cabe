//! Referral chasing.
//!
//! A server which doesn't hold the target of an operation may answer with a
//! referral: a list of LDAP URLs of servers which might. Following one means
//! opening a connection to the referred server, binding, and resending the
//! request there, with the DN from the URL if it has one.

use std::fmt;
use std::sync::Arc;

use crate::agent::MessageAgent;
use crate::conn::Connection;
use crate::ldap::{BindProperties, Constraints};
use crate::protocol::{
    next_message_id, LdapRequest, ADD_REQUEST, COMPARE_REQUEST, DEL_REQUEST, EXTENDED_REQUEST,
    MODDN_REQUEST, MODIFY_REQUEST, SEARCH_REQUEST,
};
use crate::request;
use crate::result::{LdapError, Result};
use crate::transport::LdapConnSettings;
use crate::util::{get_url_params, url_endpoint};
use crate::RequestId;

use lber::structure::PL;
use url::Url;

/// Operations which can be resent to a referred server.
const FOLLOWABLE: [u64; 7] = [
    SEARCH_REQUEST,
    MODIFY_REQUEST,
    ADD_REQUEST,
    DEL_REQUEST,
    MODDN_REQUEST,
    COMPARE_REQUEST,
    EXTENDED_REQUEST,
];

/// Source of credentials for binding to referred servers.
///
/// Given the referral URL, returns the DN and password of a Simple Bind, or
/// `None` to bind anonymously. Closures with the same signature implement the
/// trait.
pub trait ReferralAuth: Send + Sync {
    fn credentials(&self, url: &str) -> Option<(String, Vec<u8>)>;
}

impl<F> ReferralAuth for F
where
    F: Fn(&str) -> Option<(String, Vec<u8>)> + Send + Sync,
{
    fn credentials(&self, url: &str) -> Option<(String, Vec<u8>)> {
        self(url)
    }
}

/// Connections opened while following the referrals of one operation.
///
/// They're shut down when the chase is dropped, so the chase must outlive the
/// reading of every reply sent through it.
pub(crate) struct ReferralChase {
    settings: LdapConnSettings,
    auth: Option<Arc<dyn ReferralAuth>>,
    hop_limit: u32,
    timeout_ms: u64,
    conns: Vec<Arc<Connection>>,
}

impl fmt::Debug for ReferralChase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferralChase")
            .field("hop_limit", &self.hop_limit)
            .field("conns", &self.conns)
            .finish()
    }
}

impl ReferralChase {
    pub(crate) fn new(conn: &Connection, constraints: &Constraints) -> ReferralChase {
        ReferralChase {
            settings: conn.settings().clone(),
            auth: constraints.referral_auth(),
            hop_limit: constraints.hop_limit(),
            timeout_ms: constraints.time_limit(),
            conns: vec![],
        }
    }

    /// Resend `request` to the first referred server which accepts it.
    ///
    /// `hops` counts the referrals followed so far, this one included. Returns
    /// the message ID of the resent request, tracked by `agent`, and the request
    /// as it was resent.
    pub(crate) fn send(
        &mut self,
        refs: &[String],
        request: &LdapRequest,
        hops: u32,
        agent: &MessageAgent,
    ) -> Result<(RequestId, LdapRequest)> {
        if hops > self.hop_limit {
            return Err(LdapError::ReferralLimit(self.hop_limit));
        }
        if !FOLLOWABLE.contains(&request.op_type()) {
            return Err(LdapError::ImproperReferral(request.op_type()));
        }
        let mut failure = None;
        for url in refs {
            match self.follow(url, request, agent) {
                Ok(sent) => {
                    debug!("referral {} followed, hop {}", url, hops);
                    return Ok(sent);
                }
                Err(e) => {
                    debug!("referral {} not followed: {}", url, e);
                    failure = Some((url.clone(), e));
                }
            }
        }
        let (failed, source) = failure.unwrap_or((String::new(), LdapError::EmptyHostList));
        Err(LdapError::Referral {
            refs: refs.to_vec(),
            failed,
            source: Box::new(source),
        })
    }

    fn follow(
        &mut self,
        url: &str,
        request: &LdapRequest,
        agent: &MessageAgent,
    ) -> Result<(RequestId, LdapRequest)> {
        let parsed = Url::parse(url)?;
        let (host, port, secure) = url_endpoint(&parsed)?;
        let params = get_url_params(&parsed)?;
        let conn = Connection::new(self.settings.clone().set_secure(secure));
        conn.set_active_referral(Some(url.to_owned()));
        conn.connect(&host, port, 0)?;
        self.conns.push(conn.clone());
        self.bind(&conn, url)?;
        let rebuilt = retarget(request, &params.base);
        let id = agent.send(&conn, rebuilt.clone(), self.timeout_ms, None)?;
        Ok((id, rebuilt))
    }

    fn bind(&self, conn: &Arc<Connection>, url: &str) -> Result<()> {
        let (dn, pw) = self
            .auth
            .as_ref()
            .and_then(|auth| auth.credentials(url))
            .unwrap_or_default();
        let anonymous = pw.is_empty();
        let dn = if anonymous { String::new() } else { dn };
        let agent = MessageAgent::new();
        let req = LdapRequest::new(request::simple_bind_op(&dn, &pw));
        let props = BindProperties::simple(&dn, anonymous);
        let id = agent.send(conn, req, self.timeout_ms, Some(props))?;
        agent
            .get_message(Some(id))?
            .ok_or(LdapError::EndOfStream)?
            .result()?
            .success()?;
        Ok(())
    }
}

impl Drop for ReferralChase {
    fn drop(&mut self) {
        for conn in self.conns.drain(..) {
            conn.set_active_referral(None);
            conn.shutdown("referral released", 0, None);
        }
    }
}

/// Copy of `request` under a fresh message ID, aimed at `dn` if it isn't empty.
fn retarget(request: &LdapRequest, dn: &str) -> LdapRequest {
    let mut op = request.op.clone();
    if !dn.is_empty() && op.id != EXTENDED_REQUEST {
        match op.payload {
            PL::P(ref mut name) => *name = Vec::from(dn),
            PL::C(ref mut comps) => {
                if let Some(first) = comps.first_mut() {
                    first.payload = PL::P(Vec::from(dn));
                }
            }
        }
    }
    LdapRequest {
        id: next_message_id(),
        op,
        controls: request.controls.clone(),
    }
}
