//! Control construction and parsing.
//!
//! A control can be associated with a request or a response. Request controls are
//! attached to operations through [`Constraints`](../struct.Constraints.html); response
//! controls end up in the `ctrls` vector of an [`LdapResult`](../result/struct.LdapResult.html).
//!
//! A third-party control must implement the conversion from an instance of itself to
//! [`RawControl`](struct.RawControl.html), the general form of a control.

use crate::result::{LdapError, Result};

use lber::structure::{PL, StructureTag};
use lber::structures::{ASNTag, Boolean, OctetString, Sequence, Tag};
use lber::universal::Types;

/// Controls known by OID.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlType {
    ManageDsaIt,
}

pub const MANAGE_DSA_IT_OID: &str = "2.16.840.1.113730.3.4.2";

/// ManageDsaIT control ([RFC 3296](https://tools.ietf.org/html/rfc3296)).
///
/// With this control, the server treats referral objects as ordinary entries
/// instead of returning referrals for them.
#[derive(Clone, Copy, Debug, Default)]
pub struct ManageDsaIt;

impl From<ManageDsaIt> for RawControl {
    fn from(_mdi: ManageDsaIt) -> RawControl {
        RawControl {
            ctype: MANAGE_DSA_IT_OID.to_owned(),
            crit: true,
            val: None,
        }
    }
}

/// Anything usable where a list of request controls is expected: a vector of raw
/// controls, or a single control convertible into a `RawControl`.
pub trait IntoRawControlVec {
    fn into(self) -> Vec<RawControl>;
}

impl IntoRawControlVec for Vec<RawControl> {
    fn into(self) -> Vec<RawControl> {
        self
    }
}

impl<R> IntoRawControlVec for R
where
    RawControl: From<R>,
{
    fn into(self) -> Vec<RawControl> {
        vec![std::convert::Into::into(self)]
    }
}

/// Response control, with its type if the OID is one the crate knows.
#[derive(Clone, Debug, PartialEq)]
pub struct Control(pub Option<ControlType>, pub RawControl);

/// Generic control, used both for requests and responses.
#[derive(Clone, Debug, PartialEq)]
pub struct RawControl {
    /// OID of the control.
    pub ctype: String,
    /// Criticality; ignored in responses.
    pub crit: bool,
    /// BER-encoded value.
    pub val: Option<Vec<u8>>,
}

pub(crate) fn build_tag(rc: RawControl) -> StructureTag {
    let mut seq = vec![Tag::OctetString(OctetString {
        inner: Vec::from(rc.ctype.as_bytes()),
        ..Default::default()
    })];
    if rc.crit {
        seq.push(Tag::Boolean(Boolean {
            inner: true,
            ..Default::default()
        }));
    }
    if let Some(val) = rc.val {
        seq.push(Tag::OctetString(OctetString {
            inner: val,
            ..Default::default()
        }));
    }
    Tag::Sequence(Sequence {
        inner: seq,
        ..Default::default()
    })
    .into_structure()
}

pub(crate) fn parse_controls(t: StructureTag) -> Result<Vec<Control>> {
    let tags = t
        .expect_constructed()
        .ok_or(LdapError::Decoding("control sequence"))?;
    let mut ctrls = Vec::with_capacity(tags.len());
    for ctrl in tags {
        let mut components = ctrl
            .expect_constructed()
            .ok_or(LdapError::Decoding("control"))?
            .into_iter();
        let ctype = components
            .next()
            .and_then(|t| t.expect_primitive())
            .ok_or(LdapError::Decoding("control type"))?;
        let ctype = String::from_utf8(ctype).map_err(|_| LdapError::DecodingUTF8)?;
        let (crit, maybe_val) = match components.next() {
            None => (false, None),
            Some(c) => match c {
                StructureTag {
                    id, ref payload, ..
                } if id == Types::Boolean as u64 => match *payload {
                    PL::P(ref v) => (v.first().is_some_and(|&b| b != 0), components.next()),
                    PL::C(_) => return Err(LdapError::Decoding("control criticality")),
                },
                StructureTag { id, .. } if id == Types::OctetString as u64 => (false, Some(c)),
                _ => return Err(LdapError::Decoding("control")),
            },
        };
        let val = match maybe_val {
            Some(v) => Some(
                v.expect_primitive()
                    .ok_or(LdapError::Decoding("control value"))?,
            ),
            None => None,
        };
        let known_type = match ctype.as_str() {
            MANAGE_DSA_IT_OID => Some(ControlType::ManageDsaIt),
            _ => None,
        };
        ctrls.push(Control(known_type, RawControl { ctype, crit, val }));
    }
    Ok(ctrls)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn control_tag_roundtrip_keeps_criticality() {
        let raw: Vec<RawControl> = IntoRawControlVec::into(ManageDsaIt);
        let seq = StructureTag {
            class: lber::common::TagClass::Context,
            id: 0,
            payload: PL::C(raw.into_iter().map(build_tag).collect()),
        };
        let parsed = parse_controls(seq).expect("controls");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, Some(ControlType::ManageDsaIt));
        assert!(parsed[0].1.crit);
        assert_eq!(parsed[0].1.val, None);
    }
}
