//! Protocol operation builders.
//!
//! Each function returns the BER structure of one protocol operation, ready to be
//! wrapped into an [`LdapRequest`](../struct.LdapRequest.html) and sent through a queue.

use std::collections::HashSet;
use std::hash::Hash;

use crate::filter::Filter;
use crate::protocol::{
    ABANDON_REQUEST, ADD_REQUEST, BIND_REQUEST, COMPARE_REQUEST, DEL_REQUEST, EXTENDED_REQUEST,
    MODDN_REQUEST, MODIFY_REQUEST, SEARCH_REQUEST, UNBIND_REQUEST,
};
use crate::protocol::LdapRequest;
use crate::result::{LdapError, Result};
use crate::RequestId;

use lber::common::TagClass;
use lber::structures::{Boolean, Enumerated, Integer, Null, OctetString, Sequence, Set, Tag};

/// OID of the StartTLS extended operation.
pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// Protocol version sent in Bind requests.
pub const LDAP_V3: i64 = 3;

/// Search scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// The base entry alone.
    Base = 0,
    /// Direct children of the base entry.
    OneLevel = 1,
    /// The base entry and all its descendants.
    Subtree = 2,
}

/// When the server dereferences aliases.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DerefAliases {
    /// Never dereference.
    #[default]
    Never = 0,
    /// Below the base entry only.
    Searching = 1,
    /// While locating the base entry only.
    Finding = 2,
    /// Always dereference.
    Always = 3,
}

/// Search request fields other than base, scope, filter and attributes.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct SearchOptions {
    pub deref: DerefAliases,
    pub typesonly: bool,
    pub timelimit: i32,
    pub sizelimit: i32,
}

impl SearchOptions {
    /// No aliases dereferenced, no limits.
    pub fn new() -> Self {
        SearchOptions {
            ..Default::default()
        }
    }

    pub fn deref(mut self, d: DerefAliases) -> Self {
        self.deref = d;
        self
    }

    /// Ask for attribute types without their values.
    pub fn typesonly(mut self, typesonly: bool) -> Self {
        self.typesonly = typesonly;
        self
    }

    /// Server-side time limit in seconds.
    ///
    /// This is not a client timeout for the replies; that's given by
    /// [`Constraints`](../struct.Constraints.html).
    pub fn timelimit(mut self, timelimit: i32) -> Self {
        self.timelimit = timelimit;
        self
    }

    /// Maximum number of entries returned.
    pub fn sizelimit(mut self, sizelimit: i32) -> Self {
        self.sizelimit = sizelimit;
        self
    }
}

/// Generic extended operation.
///
/// Both the name and the value are optional, since an extended response
/// may carry neither.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Exop {
    /// OID of the operation.
    pub name: Option<String>,
    /// Request or response value.
    pub val: Option<Vec<u8>>,
}

impl Exop {
    pub fn new(name: &str, val: Option<Vec<u8>>) -> Exop {
        Exop {
            name: Some(name.to_owned()),
            val,
        }
    }
}

fn octet_string(s: impl Into<Vec<u8>>) -> Tag {
    Tag::OctetString(OctetString {
        inner: s.into(),
        ..Default::default()
    })
}

pub(crate) fn construct_exop(exop: Exop) -> Vec<Tag> {
    let mut seq = vec![];
    if let Some(name) = exop.name {
        seq.push(Tag::OctetString(OctetString {
            id: 0,
            class: TagClass::Context,
            inner: name.into_bytes(),
        }));
    }
    if let Some(val) = exop.val {
        seq.push(Tag::OctetString(OctetString {
            id: 1,
            class: TagClass::Context,
            inner: val,
        }));
    }
    seq
}

/// Simple Bind with `dn` and `pw`. An empty password makes an anonymous Bind.
pub fn simple_bind_op(dn: &str, pw: &[u8]) -> Tag {
    Tag::Sequence(Sequence {
        id: BIND_REQUEST,
        class: TagClass::Application,
        inner: vec![
            Tag::Integer(Integer {
                inner: LDAP_V3,
                ..Default::default()
            }),
            octet_string(dn),
            Tag::OctetString(OctetString {
                id: 0,
                class: TagClass::Context,
                inner: pw.to_vec(),
            }),
        ],
    })
}

/// One step of a SASL Bind with mechanism `mech`.
pub fn sasl_bind_op(mech: &str, creds: Option<&[u8]>) -> Tag {
    let mut inner_vec = vec![octet_string(mech)];
    if let Some(creds) = creds {
        inner_vec.push(octet_string(creds));
    }
    Tag::Sequence(Sequence {
        id: BIND_REQUEST,
        class: TagClass::Application,
        inner: vec![
            Tag::Integer(Integer {
                inner: LDAP_V3,
                ..Default::default()
            }),
            octet_string(""),
            Tag::Sequence(Sequence {
                id: 3,
                class: TagClass::Context,
                inner: inner_vec,
            }),
        ],
    })
}

/// Search request.
pub fn search_op<S: AsRef<str>>(
    base: &str,
    scope: Scope,
    opts: &SearchOptions,
    filter: &Filter,
    attrs: impl IntoIterator<Item = S>,
) -> Tag {
    Tag::Sequence(Sequence {
        id: SEARCH_REQUEST,
        class: TagClass::Application,
        inner: vec![
            octet_string(base),
            Tag::Enumerated(Enumerated {
                inner: scope as i64,
                ..Default::default()
            }),
            Tag::Enumerated(Enumerated {
                inner: opts.deref as i64,
                ..Default::default()
            }),
            Tag::Integer(Integer {
                inner: opts.sizelimit as i64,
                ..Default::default()
            }),
            Tag::Integer(Integer {
                inner: opts.timelimit as i64,
                ..Default::default()
            }),
            Tag::Boolean(Boolean {
                inner: opts.typesonly,
                ..Default::default()
            }),
            filter.to_tag(),
            Tag::Sequence(Sequence {
                inner: attrs
                    .into_iter()
                    .map(|s| octet_string(s.as_ref()))
                    .collect(),
                ..Default::default()
            }),
        ],
    })
}

/// Compare `attr` of the entry `dn` with `val`.
pub fn compare_op(dn: &str, attr: &str, val: &[u8]) -> Tag {
    Tag::Sequence(Sequence {
        id: COMPARE_REQUEST,
        class: TagClass::Application,
        inner: vec![
            octet_string(dn),
            Tag::Sequence(Sequence {
                inner: vec![octet_string(attr), octet_string(val)],
                ..Default::default()
            }),
        ],
    })
}

/// Modification of one attribute, for [`modify_op()`](fn.modify_op.html).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mod<S: AsRef<[u8]> + Eq + Hash> {
    /// Add values to an attribute. The set must not be empty.
    Add(S, HashSet<S>),
    /// Delete the given values, or the whole attribute if the set is empty.
    Delete(S, HashSet<S>),
    /// Set the values of an attribute, deleting it if the set is empty.
    Replace(S, HashSet<S>),
    /// Increment a numeric attribute by the given value.
    Increment(S, S),
}

fn attribute<S: AsRef<[u8]>>(name: S, vals: impl IntoIterator<Item = S>) -> Tag {
    Tag::Sequence(Sequence {
        inner: vec![
            octet_string(name.as_ref()),
            Tag::Set(Set {
                inner: vals.into_iter().map(|v| octet_string(v.as_ref())).collect(),
                ..Default::default()
            }),
        ],
        ..Default::default()
    })
}

/// Add the entry `dn` with the attributes `attrs`.
///
/// Every attribute needs at least one value.
pub fn add_op<S: AsRef<[u8]> + Eq + Hash>(dn: &str, attrs: Vec<(S, HashSet<S>)>) -> Result<Tag> {
    if attrs.iter().any(|(_, vals)| vals.is_empty()) {
        return Err(LdapError::AddNoValues);
    }
    Ok(Tag::Sequence(Sequence {
        id: ADD_REQUEST,
        class: TagClass::Application,
        inner: vec![
            octet_string(dn),
            Tag::Sequence(Sequence {
                inner: attrs
                    .into_iter()
                    .map(|(name, vals)| attribute(name, vals))
                    .collect(),
                ..Default::default()
            }),
        ],
    }))
}

/// Apply the modifications `mods` to the entry `dn`, in order.
pub fn modify_op<S: AsRef<[u8]> + Eq + Hash>(dn: &str, mods: Vec<Mod<S>>) -> Result<Tag> {
    let mut changes = Vec::with_capacity(mods.len());
    for m in mods {
        let (num, attr, vals) = match m {
            Mod::Add(_, ref set) if set.is_empty() => return Err(LdapError::AddNoValues),
            Mod::Add(attr, set) => (0, attr, set),
            Mod::Delete(attr, set) => (1, attr, set),
            Mod::Replace(attr, set) => (2, attr, set),
            Mod::Increment(attr, val) => (3, attr, HashSet::from([val])),
        };
        changes.push(Tag::Sequence(Sequence {
            inner: vec![
                Tag::Enumerated(Enumerated {
                    inner: num,
                    ..Default::default()
                }),
                attribute(attr, vals),
            ],
            ..Default::default()
        }));
    }
    Ok(Tag::Sequence(Sequence {
        id: MODIFY_REQUEST,
        class: TagClass::Application,
        inner: vec![
            octet_string(dn),
            Tag::Sequence(Sequence {
                inner: changes,
                ..Default::default()
            }),
        ],
    }))
}

/// Rename the entry `dn` to `rdn`, moving it under `new_sup` if given.
///
/// With `delete_old`, the values of the old RDN are removed from the entry.
pub fn modifydn_op(dn: &str, rdn: &str, delete_old: bool, new_sup: Option<&str>) -> Tag {
    let mut params = vec![
        octet_string(dn),
        octet_string(rdn),
        Tag::Boolean(Boolean {
            inner: delete_old,
            ..Default::default()
        }),
    ];
    if let Some(new_sup) = new_sup {
        params.push(Tag::OctetString(OctetString {
            id: 0,
            class: TagClass::Context,
            inner: Vec::from(new_sup),
        }));
    }
    Tag::Sequence(Sequence {
        id: MODDN_REQUEST,
        class: TagClass::Application,
        inner: params,
    })
}

/// Delete the entry named by `dn`.
pub fn delete_op(dn: &str) -> Tag {
    Tag::OctetString(OctetString {
        id: DEL_REQUEST,
        class: TagClass::Application,
        inner: Vec::from(dn),
    })
}

/// Extended operation.
pub fn extended_op(exop: Exop) -> Tag {
    Tag::Sequence(Sequence {
        id: EXTENDED_REQUEST,
        class: TagClass::Application,
        inner: construct_exop(exop),
    })
}

pub(crate) fn start_tls_op() -> Tag {
    extended_op(Exop::new(START_TLS_OID, None))
}

/// Abandon request for `msgid`, under a fresh message ID.
pub(crate) fn abandon_request(msgid: RequestId) -> LdapRequest {
    LdapRequest::new(Tag::Integer(Integer {
        id: ABANDON_REQUEST,
        class: TagClass::Application,
        inner: msgid as i64,
    }))
}

pub(crate) fn unbind_request() -> LdapRequest {
    LdapRequest::new(Tag::Null(Null {
        id: UNBIND_REQUEST,
        class: TagClass::Application,
        inner: (),
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use lber::structure::PL;
    use lber::structures::ASNTag;

    #[test]
    fn anonymous_simple_bind_has_empty_credentials() {
        let op = simple_bind_op("", b"").into_structure();
        assert_eq!(op.id, BIND_REQUEST);
        let comps = op.expect_constructed().expect("bind components");
        assert_eq!(comps.len(), 3);
        assert_eq!(comps[2].class, TagClass::Context);
        assert_eq!(comps[2].clone().expect_primitive(), Some(vec![]));
    }

    #[test]
    fn exop_omits_missing_parts() {
        let op = start_tls_op().into_structure();
        match op.payload {
            PL::C(ref comps) => {
                assert_eq!(comps.len(), 1);
                assert_eq!(comps[0].id, 0);
            }
            PL::P(_) => panic!("primitive exop"),
        }
    }

    #[test]
    fn abandon_names_the_target() {
        let req = abandon_request(42);
        assert!(!req.expects_reply());
        assert_ne!(req.id(), 42);
        let val = req.op.clone().expect_primitive().expect("integer");
        assert_eq!(lber::parse::parse_uint(&val).expect("uint").1, 42);
    }

    #[test]
    fn add_needs_values_for_every_attribute() {
        let attrs = vec![
            ("objectClass", HashSet::from(["person"])),
            ("cn", HashSet::new()),
        ];
        assert!(matches!(add_op("cn=x,o=test", attrs), Err(LdapError::AddNoValues)));
        let attrs = vec![("cn", HashSet::from(["x"])), ("sn", HashSet::from(["y"]))];
        let op = add_op("cn=x,o=test", attrs).expect("add").into_structure();
        assert_eq!(op.id, ADD_REQUEST);
        let comps = op.expect_constructed().expect("add components");
        assert_eq!(comps[0].clone().expect_primitive(), Some(b"cn=x,o=test".to_vec()));
        assert_eq!(comps[1].clone().expect_constructed().expect("attributes").len(), 2);
    }

    #[test]
    fn modify_encodes_operation_codes() {
        let empty = vec![Mod::Add("mail", HashSet::new())];
        assert!(matches!(modify_op("cn=x", empty), Err(LdapError::AddNoValues)));
        let mods = vec![
            Mod::Delete("mail", HashSet::new()),
            Mod::Replace("sn", HashSet::from(["z"])),
            Mod::Increment("uidNumber", "1"),
        ];
        let op = modify_op("cn=x", mods).expect("modify").into_structure();
        assert_eq!(op.id, MODIFY_REQUEST);
        let comps = op.expect_constructed().expect("modify components");
        let codes: Vec<_> = comps[1]
            .clone()
            .expect_constructed()
            .expect("changes")
            .into_iter()
            .map(|change| {
                let parts = change.expect_constructed().expect("change");
                parts[0].clone().expect_primitive().expect("code")
            })
            .collect();
        assert_eq!(codes, vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn modifydn_new_superior_is_context_tagged() {
        let comps = modifydn_op("cn=x,o=a", "cn=y", true, None)
            .into_structure()
            .expect_constructed()
            .expect("moddn components");
        assert_eq!(comps.len(), 3);
        let op = modifydn_op("cn=x,o=a", "cn=y", false, Some("o=b")).into_structure();
        assert_eq!(op.id, MODDN_REQUEST);
        let comps = op.expect_constructed().expect("moddn components");
        assert_eq!(comps.len(), 4);
        assert_eq!((comps[3].id, comps[3].class), (0, TagClass::Context));
        assert_eq!(comps[3].clone().expect_primitive(), Some(b"o=b".to_vec()));
    }
}
