//! Host list and LDAP URL helpers.

use std::borrow::Cow;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use crate::request::Scope;
use crate::result::{LdapError, Result};
use crate::transport::{DEFAULT_PORT, DEFAULT_SSL_PORT};

use percent_encoding::percent_decode_str;
use url::Url;

/// Split a space-separated host list into `(host, port)` pairs.
///
/// Each element is `host` or `host:port`; an IPv6 address with a port must be
/// enclosed in brackets, as in `[::1]:2389`. Elements without a port get
/// `default_port`, which may be zero to let the connection pick the port
/// matching its security setting.
pub fn parse_host_list(hosts: &str, default_port: u16) -> Result<Vec<(String, u16)>> {
    let mut list = vec![];
    for spec in hosts.split_whitespace() {
        let (host, port) = if let Some(rest) = spec.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| LdapError::InvalidHost(spec.to_owned()))?;
            match tail {
                "" => (host, None),
                _ => match tail.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => return Err(LdapError::InvalidHost(spec.to_owned())),
                },
            }
        } else if spec.matches(':').count() > 1 {
            // bare IPv6 address
            (spec, None)
        } else {
            match spec.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (spec, None),
            }
        };
        if host.is_empty() {
            return Err(LdapError::InvalidHost(spec.to_owned()));
        }
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| LdapError::InvalidHost(spec.to_owned()))?,
            None => default_port,
        };
        list.push((host.to_owned(), port));
    }
    if list.is_empty() {
        return Err(LdapError::EmptyHostList);
    }
    Ok(list)
}

/// Host, port and TLS flag of an `ldap://` or `ldaps://` URL.
///
/// A URL without a host points to `localhost`.
pub(crate) fn url_endpoint(url: &Url) -> Result<(String, u16, bool)> {
    let (default_port, secure) = match url.scheme() {
        "ldap" => (DEFAULT_PORT, false),
        "ldaps" => (DEFAULT_SSL_PORT, true),
        s => return Err(LdapError::UnknownScheme(s.to_owned())),
    };
    let host = match url.host_str() {
        Some(h) if !h.is_empty() => h.trim_start_matches('[').trim_end_matches(']'),
        _ => "localhost",
    };
    let port = url.port().unwrap_or(default_port);
    Ok((host.to_owned(), port, secure))
}

/// LDAP URL extensions.
///
/// Only the extensions a client can act on when connecting are recognized:
/// the Simple Bind DN (__bindname__), the experimental SASL mechanism, and
/// StartTLS. Others are ignored unless marked critical.
#[derive(Clone, Debug)]
pub enum LdapUrlExt<'a> {
    /// __Bindname__, the DN for the Simple Bind operation.
    Bindname(Cow<'a, str>),

    /// __1.3.6.1.4.1.10094.1.5.2__, experimental.
    SaslMech(Cow<'a, str>),

    /// __1.3.6.1.4.1.1466.20037__, StartTLS extended operation. Has no value.
    StartTLS,
}

impl PartialEq for LdapUrlExt<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Eq for LdapUrlExt<'_> {}

impl Hash for LdapUrlExt<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state)
    }
}

/// Parameters of an LDAP URL.
///
/// Extension values are ignored in hashing and comparisons, so the set holds
/// at most one instance of each extension. Look a value-bearing extension up
/// with an empty value:
///
/// ```rust
/// # use ldapconn::{get_url_params, LdapUrlExt};
/// # use ldapconn::result::Result;
/// # use url::Url;
/// # fn main() -> Result<()> {
/// let url = Url::parse("ldap://ldap.example.org/????1.3.6.1.4.1.10094.1.5.2=EXTERNAL")?;
/// let params = get_url_params(&url)?;
/// let mech = match params.extensions.get(&LdapUrlExt::SaslMech("".into())) {
///     Some(LdapUrlExt::SaslMech(val)) => val.as_ref(),
///     _ => "",
/// };
/// assert_eq!(mech, "EXTERNAL");
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct LdapUrlParams<'a> {
    /// Base DN, percent-decoded. Referral URLs use it as the target DN.
    pub base: Cow<'a, str>,

    /// Attribute list, `*` if missing.
    pub attrs: Vec<&'a str>,

    /// Search scope, `Scope::Subtree` if missing.
    pub scope: Scope,

    /// Filter string, percent-decoded, `(objectClass=*)` if missing.
    pub filter: Cow<'a, str>,

    pub extensions: HashSet<LdapUrlExt<'a>>,
}

fn decode(s: &str) -> Result<Cow<'_, str>> {
    percent_decode_str(s)
        .decode_utf8()
        .map_err(|_| LdapError::DecodingUTF8)
}

/// Extract parameters from an LDAP URL.
pub fn get_url_params(url: &Url) -> Result<LdapUrlParams<'_>> {
    let base = decode(url.path().strip_prefix('/').unwrap_or(url.path()))?;
    let mut query = url.query().unwrap_or("").splitn(4, '?');
    let attrs = match query.next() {
        Some("") | None => vec!["*"],
        Some(alist) => alist.split(',').collect(),
    };
    let scope = match query.next() {
        Some("") | None => Scope::Subtree,
        Some("base") => Scope::Base,
        Some("one") => Scope::OneLevel,
        Some("sub") => Scope::Subtree,
        Some(any) => return Err(LdapError::InvalidScopeString(any.into())),
    };
    let filter = match query.next() {
        Some("") | None => Cow::Borrowed("(objectClass=*)"),
        Some(filter) => decode(filter)?,
    };
    let mut extensions = HashSet::new();
    for ext in query.next().unwrap_or("").split(',').filter(|e| !e.is_empty()) {
        let (id, val) = ext.split_once('=').unwrap_or((ext, ""));
        let (crit, id) = match id.strip_prefix('!') {
            Some(id) => (true, id),
            None => (false, id),
        };
        let val = decode(val)?;
        let ext = match id {
            "1.3.6.1.4.1.10094.1.5.2" => LdapUrlExt::SaslMech(val),
            "1.3.6.1.4.1.1466.20037" => LdapUrlExt::StartTLS,
            id if id.eq_ignore_ascii_case("bindname") => LdapUrlExt::Bindname(val),
            id if crit => return Err(LdapError::UnrecognizedCriticalExtension(id.to_owned())),
            _ => continue,
        };
        extensions.insert(ext);
    }
    Ok(LdapUrlParams {
        base,
        attrs,
        scope,
        filter,
        extensions,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn host_list_with_ports_and_brackets() {
        let list = parse_host_list("a.example  b.example:2389 [::1]:3389 [fe80::2] ::3", 0)
            .expect("hosts");
        assert_eq!(
            list,
            vec![
                ("a.example".to_owned(), 0),
                ("b.example".to_owned(), 2389),
                ("::1".to_owned(), 3389),
                ("fe80::2".to_owned(), 0),
                ("::3".to_owned(), 0),
            ]
        );
    }

    #[test]
    fn host_list_errors() {
        assert!(matches!(parse_host_list("  ", 389), Err(LdapError::EmptyHostList)));
        match parse_host_list("ok b.example:port", 389) {
            Err(LdapError::InvalidHost(spec)) => assert_eq!(spec, "b.example:port"),
            res => panic!("unexpected result: {:?}", res),
        }
        assert!(matches!(parse_host_list("[::1", 389), Err(LdapError::InvalidHost(_))));
    }

    #[test]
    fn url_endpoint_defaults() {
        let url = Url::parse("ldaps://ldap.example.org/o=test").expect("url");
        assert_eq!(
            url_endpoint(&url).expect("endpoint"),
            ("ldap.example.org".to_owned(), 636, true)
        );
        let url = Url::parse("ldap://[::1]:2389").expect("url");
        assert_eq!(url_endpoint(&url).expect("endpoint"), ("::1".to_owned(), 2389, false));
        let url = Url::parse("ftp://ldap.example.org").expect("url");
        assert!(matches!(url_endpoint(&url), Err(LdapError::UnknownScheme(_))));
    }

    #[test]
    fn url_params() {
        let url = Url::parse(
            "ldap://h/ou=People,o=test?cn,mail?one?(uid=j%2a)?bindname=cn%3Dx,!1.3.6.1.4.1.1466.20037",
        )
        .expect("url");
        let params = get_url_params(&url).expect("params");
        assert_eq!(params.base, "ou=People,o=test");
        assert_eq!(params.attrs, vec!["cn", "mail"]);
        assert_eq!(params.scope, Scope::OneLevel);
        assert_eq!(params.filter, "(uid=j*)");
        assert!(params.extensions.contains(&LdapUrlExt::StartTLS));
        match params.extensions.get(&LdapUrlExt::Bindname("".into())) {
            Some(LdapUrlExt::Bindname(dn)) => assert_eq!(dn, "cn=x"),
            ext => panic!("unexpected extension: {:?}", ext),
        }
        let url = Url::parse("ldap://h/??sub??!x-unknown").expect("url");
        assert!(matches!(
            get_url_params(&url),
            Err(LdapError::UnrecognizedCriticalExtension(_))
        ));
    }
}
