use std::io;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::controls::{Control, RawControl, build_tag, parse_controls};
use crate::result::{LdapResult, LdapResultExt, Result};
use crate::RequestId;

use lber::common::TagClass;
use lber::parse::parse_uint;
use lber::structure::{PL, StructureTag};
use lber::structures::{ASNTag, Integer, Sequence, Tag};
use lber::universal::Types;
use lber::write;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub(crate) type MaybeControls = Option<Vec<RawControl>>;

pub(crate) const BIND_REQUEST: u64 = 0;
pub(crate) const BIND_RESPONSE: u64 = 1;
pub(crate) const UNBIND_REQUEST: u64 = 2;
pub(crate) const SEARCH_REQUEST: u64 = 3;
pub(crate) const SEARCH_RESULT_ENTRY: u64 = 4;
pub(crate) const SEARCH_RESULT_DONE: u64 = 5;
pub(crate) const MODIFY_REQUEST: u64 = 6;
pub(crate) const MODIFY_RESPONSE: u64 = 7;
pub(crate) const ADD_REQUEST: u64 = 8;
pub(crate) const ADD_RESPONSE: u64 = 9;
pub(crate) const DEL_REQUEST: u64 = 10;
pub(crate) const DEL_RESPONSE: u64 = 11;
pub(crate) const MODDN_REQUEST: u64 = 12;
pub(crate) const MODDN_RESPONSE: u64 = 13;
pub(crate) const COMPARE_REQUEST: u64 = 14;
pub(crate) const COMPARE_RESPONSE: u64 = 15;
pub(crate) const ABANDON_REQUEST: u64 = 16;
pub(crate) const SEARCH_RESULT_REFERENCE: u64 = 19;
pub(crate) const EXTENDED_REQUEST: u64 = 23;
pub(crate) const EXTENDED_RESPONSE: u64 = 24;
pub(crate) const INTERMEDIATE_RESPONSE: u64 = 25;

/// OID of the Notice of Disconnection unsolicited notification.
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

/// Message ID reserved for unsolicited notifications.
pub(crate) const UNSOLICITED_ID: RequestId = 0;

static LAST_ID: AtomicI32 = AtomicI32::new(0);

/// Allocate a fresh message ID.
///
/// IDs are unique process-wide until the counter wraps around at `i32::MAX`,
/// after which it restarts at 1. Zero is never returned.
pub fn next_message_id() -> RequestId {
    let prev = LAST_ID
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
            Some(if id == i32::MAX { 1 } else { id + 1 })
        })
        .unwrap_or(0);
    if prev == i32::MAX {
        1
    } else {
        prev + 1
    }
}

/// Outbound protocol message.
///
/// The protocol operation is kept as a BER structure, so that the request can be
/// re-encoded under a different message ID, or with a different DN when a referral
/// is being followed.
#[derive(Clone, Debug, PartialEq)]
pub struct LdapRequest {
    pub(crate) id: RequestId,
    pub(crate) op: StructureTag,
    pub(crate) controls: MaybeControls,
}

impl LdapRequest {
    /// Wrap a protocol operation into a request with a freshly allocated message ID.
    pub fn new(op: Tag) -> LdapRequest {
        LdapRequest::with_id(next_message_id(), op)
    }

    /// Wrap a protocol operation into a request with an explicit message ID.
    pub fn with_id(id: RequestId, op: Tag) -> LdapRequest {
        LdapRequest {
            id,
            op: op.into_structure(),
            controls: None,
        }
    }

    /// Attach request controls.
    pub fn set_controls(mut self, controls: MaybeControls) -> Self {
        self.controls = controls;
        self
    }

    /// Message ID of the request.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Application tag number of the protocol operation.
    pub fn op_type(&self) -> u64 {
        self.op.id
    }

    pub(crate) fn is_bind(&self) -> bool {
        self.op.id == BIND_REQUEST
    }

    /// Abandon and Unbind have no response.
    pub(crate) fn expects_reply(&self) -> bool {
        self.op.id != ABANDON_REQUEST && self.op.id != UNBIND_REQUEST
    }
}

/// Decoded protocol message received from the server.
#[derive(Clone, Debug, PartialEq)]
pub struct LdapMessage {
    /// Message ID; zero for unsolicited notifications.
    pub id: RequestId,
    /// Protocol operation.
    pub op: StructureTag,
    /// Response controls.
    pub controls: Vec<Control>,
}

impl LdapMessage {
    /// Application tag number of the protocol operation.
    pub fn op_type(&self) -> u64 {
        self.op.id
    }

    /// True if more messages will follow for the same request.
    ///
    /// Search entries, search references and intermediate responses don't
    /// complete a request; any other response does.
    pub fn is_intermediate(&self) -> bool {
        matches!(
            self.op.id,
            SEARCH_RESULT_ENTRY | SEARCH_RESULT_REFERENCE | INTERMEDIATE_RESPONSE
        )
    }

    /// Parse the message as an operation result.
    pub fn result(&self) -> Result<LdapResult> {
        let mut res = self.result_ext()?.0;
        res.ctrls = self.controls.clone();
        Ok(res)
    }

    pub(crate) fn result_ext(&self) -> Result<LdapResultExt> {
        LdapResultExt::try_from(self.op.clone())
    }

    /// Response name of an Extended response, if present.
    pub fn response_name(&self) -> Option<String> {
        if self.op.class != TagClass::Application || self.op.id != EXTENDED_RESPONSE {
            return None;
        }
        self.result_ext().ok().and_then(|ext| ext.1.name)
    }
}

pub(crate) struct LdapCodec;

fn decoding_error(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("decoding error: {}", what))
}

fn decode_inner(buf: &mut BytesMut) -> io::Result<Option<LdapMessage>> {
    let mut parser = lber::Parser::new();
    let (consumed, tag) = match parser.parse(&buf[..]) {
        Err(e) if e.is_incomplete() => return Ok(None),
        Err(_e) => return Err(decoding_error("malformed frame")),
        Ok((i, tag)) => (buf.len() - i.len(), tag),
    };
    buf.advance(consumed);
    let mut tags = tag
        .match_id(Types::Sequence as u64)
        .and_then(|t| t.expect_constructed())
        .ok_or_else(|| decoding_error("message envelope"))?;
    if tags.len() < 2 {
        return Err(decoding_error("message envelope"));
    }
    let mut last = tags.pop().ok_or_else(|| decoding_error("element"))?;
    let mut name_outside = None;
    if last.class == TagClass::Context && last.id == 10 {
        // Active Directory puts the responseName of a Notice of Disconnection
        // after the protocol op, where the controls belong.
        name_outside = Some(last);
        last = tags.pop().ok_or_else(|| decoding_error("element"))?;
    }
    let (mut protoop, controls) = match last {
        StructureTag {
            class: TagClass::Context,
            id: 0,
            ref payload,
        } => match *payload {
            PL::C(_) => (
                tags.pop().ok_or_else(|| decoding_error("protocol op"))?,
                Some(last),
            ),
            PL::P(_) => return Err(decoding_error("controls")),
        },
        _ => (last, None),
    };
    if let Some(name) = name_outside {
        if protoop.id == EXTENDED_RESPONSE {
            if let PL::C(ref mut comps) = protoop.payload {
                comps.push(name);
            }
        }
    }
    let controls = match controls {
        Some(controls) => parse_controls(controls).map_err(|_| decoding_error("controls"))?,
        None => vec![],
    };
    let msgid = tags
        .pop()
        .and_then(|t| t.match_class(TagClass::Universal))
        .and_then(|t| t.match_id(Types::Integer as u64))
        .and_then(|t| t.expect_primitive())
        .ok_or_else(|| decoding_error("message id"))?;
    let id = match parse_uint(msgid.as_slice()) {
        Ok((_, id)) => id as RequestId,
        _ => return Err(decoding_error("message id")),
    };
    Ok(Some(LdapMessage {
        id,
        op: protoop,
        controls,
    }))
}

impl Decoder for LdapCodec {
    type Item = LdapMessage;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        decode_inner(buf)
    }
}

impl Encoder<(RequestId, StructureTag, MaybeControls)> for LdapCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        msg: (RequestId, StructureTag, MaybeControls),
        into: &mut BytesMut,
    ) -> io::Result<()> {
        let (id, op, controls) = msg;
        let mut msg = vec![
            Tag::Integer(Integer {
                inner: id as i64,
                ..Default::default()
            }),
            Tag::StructureTag(op),
        ];
        if let Some(controls) = controls {
            msg.push(Tag::StructureTag(StructureTag {
                id: 0,
                class: TagClass::Context,
                payload: PL::C(controls.into_iter().map(build_tag).collect()),
            }));
        }
        let outstruct = Tag::Sequence(Sequence {
            inner: msg,
            ..Default::default()
        })
        .into_structure();
        write::encode_into(into, outstruct)?;
        Ok(())
    }
}

impl Encoder<&LdapRequest> for LdapCodec {
    type Error = io::Error;

    fn encode(&mut self, req: &LdapRequest, into: &mut BytesMut) -> io::Result<()> {
        self.encode((req.id, req.op.clone(), req.controls.clone()), into)
    }
}
