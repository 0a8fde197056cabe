//! Response queues and search result iteration.

use std::collections::HashMap;

use crate::agent::MessageAgent;
use crate::protocol::{LdapMessage, INTERMEDIATE_RESPONSE, SEARCH_RESULT_ENTRY, SEARCH_RESULT_REFERENCE};
use crate::referral::ReferralChase;
use crate::result::{parse_refs, LdapError, LdapResult, Result, REFERRAL};
use crate::{LdapRequest, RequestId};

use lber::structure::StructureTag;

/// Queue of responses to any number of requests.
///
/// A thin wrapper around a [`MessageAgent`](struct.MessageAgent.html). Clones share
/// the same requests, so one thread can send through a queue while another reads
/// from it.
#[derive(Clone, Debug, Default)]
pub struct ResponseQueue {
    agent: MessageAgent,
}

impl AsRef<MessageAgent> for ResponseQueue {
    fn as_ref(&self) -> &MessageAgent {
        &self.agent
    }
}

impl ResponseQueue {
    pub fn new() -> ResponseQueue {
        ResponseQueue::default()
    }

    /// Next response to any request of the queue, visiting requests in turn.
    ///
    /// `Ok(None)` means that the queue has no requests left.
    pub fn get_response(&self) -> Result<Option<LdapMessage>> {
        self.agent.get_message(None)
    }

    /// Next response to message `id`; `Ok(None)` once the message is finished.
    pub fn get_response_for(&self, id: RequestId) -> Result<Option<LdapMessage>> {
        self.agent.get_message(Some(id))
    }

    pub fn message_ids(&self) -> Vec<RequestId> {
        self.agent.message_ids()
    }

    pub fn is_response_received(&self, id: Option<RequestId>) -> bool {
        self.agent.is_response_received(id)
    }

    pub fn is_complete(&self, id: RequestId) -> bool {
        self.agent.is_complete(id)
    }

    /// Move the requests of `other` into this queue.
    pub fn merge(&self, other: &impl AsRef<MessageAgent>) {
        self.agent.merge(other.as_ref())
    }
}

/// Parsed Search result entry.
///
/// Every attribute value is converted into a `String` if possible. Attributes with
/// a value which isn't valid UTF-8 end up in `bin_attrs`, with all of their values.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchEntry {
    pub dn: String,
    pub attrs: HashMap<String, Vec<String>>,
    pub bin_attrs: HashMap<String, Vec<Vec<u8>>>,
}

fn utf8(tag: Option<StructureTag>, what: &'static str) -> Result<String> {
    let bytes = tag
        .and_then(|t| t.expect_primitive())
        .ok_or(LdapError::Decoding(what))?;
    String::from_utf8(bytes).map_err(|_| LdapError::DecodingUTF8)
}

impl SearchEntry {
    /// Parse the protocol operation of a Search result entry.
    pub fn parse(op: StructureTag) -> Result<SearchEntry> {
        let mut tags = op
            .match_id(SEARCH_RESULT_ENTRY)
            .and_then(|t| t.expect_constructed())
            .ok_or(LdapError::Decoding("search entry"))?
            .into_iter();
        let dn = utf8(tags.next(), "entry dn")?;
        let attrs = tags
            .next()
            .and_then(|t| t.expect_constructed())
            .ok_or(LdapError::Decoding("attribute list"))?;
        let mut entry = SearchEntry {
            dn,
            attrs: HashMap::new(),
            bin_attrs: HashMap::new(),
        };
        for attr in attrs {
            let mut parts = attr
                .expect_constructed()
                .ok_or(LdapError::Decoding("partial attribute"))?
                .into_iter();
            let name = utf8(parts.next(), "attribute type")?;
            let values = parts
                .next()
                .and_then(|t| t.expect_constructed())
                .ok_or(LdapError::Decoding("attribute values"))?
                .into_iter()
                .map(|t| t.expect_primitive().ok_or(LdapError::Decoding("attribute value")))
                .collect::<Result<Vec<_>>>()?;
            if values.iter().all(|v| std::str::from_utf8(v).is_ok()) {
                let values = values
                    .into_iter()
                    .map(|v| String::from_utf8(v).map_err(|_| LdapError::DecodingUTF8))
                    .collect::<Result<_>>()?;
                entry.attrs.insert(name, values);
            } else {
                entry.bin_attrs.insert(name, values);
            }
        }
        Ok(entry)
    }
}

/// Non-final Search response.
#[derive(Clone, Debug)]
pub enum SearchItem {
    Entry(SearchEntry),
    /// Continuation reference, with its URLs.
    Reference(Vec<String>),
    /// Intermediate response, left unparsed.
    Intermediate(LdapMessage),
}

impl SearchItem {
    fn from_message(msg: LdapMessage) -> Result<Option<SearchItem>> {
        Ok(Some(match msg.op.id {
            SEARCH_RESULT_ENTRY => SearchItem::Entry(SearchEntry::parse(msg.op)?),
            SEARCH_RESULT_REFERENCE => SearchItem::Reference(parse_refs(msg.op)?),
            INTERMEDIATE_RESPONSE => SearchItem::Intermediate(msg),
            _ => return Ok(None),
        }))
    }
}

/// Response read from a [`SearchQueue`](struct.SearchQueue.html).
#[derive(Clone, Debug)]
pub enum SearchResponse {
    Item(RequestId, SearchItem),
    /// Final result of a search.
    Done(RequestId, LdapResult),
}

/// Queue of responses to asynchronously started searches.
#[derive(Clone, Debug, Default)]
pub struct SearchQueue {
    agent: MessageAgent,
}

impl AsRef<MessageAgent> for SearchQueue {
    fn as_ref(&self) -> &MessageAgent {
        &self.agent
    }
}

impl SearchQueue {
    pub fn new() -> SearchQueue {
        SearchQueue::default()
    }

    /// Next response of any search in the queue.
    pub fn get_response(&self) -> Result<Option<SearchResponse>> {
        self.agent
            .get_message(None)?
            .map(SearchResponse::from_message)
            .transpose()
    }

    /// Next response of the search with message ID `id`.
    pub fn get_response_for(&self, id: RequestId) -> Result<Option<SearchResponse>> {
        self.agent
            .get_message(Some(id))?
            .map(SearchResponse::from_message)
            .transpose()
    }

    pub fn message_ids(&self) -> Vec<RequestId> {
        self.agent.message_ids()
    }

    pub fn is_response_received(&self, id: Option<RequestId>) -> bool {
        self.agent.is_response_received(id)
    }

    pub fn is_complete(&self, id: RequestId) -> bool {
        self.agent.is_complete(id)
    }

    pub fn merge(&self, other: &impl AsRef<MessageAgent>) {
        self.agent.merge(other.as_ref())
    }
}

impl SearchResponse {
    fn from_message(msg: LdapMessage) -> Result<SearchResponse> {
        let id = msg.id;
        if msg.is_intermediate() {
            if let Some(item) = SearchItem::from_message(msg)? {
                return Ok(SearchResponse::Item(id, item));
            }
            return Err(LdapError::Decoding("intermediate search response"));
        }
        Ok(SearchResponse::Done(id, msg.result()?))
    }
}

/// One search sent to a server; the original, or one following a referral.
#[derive(Debug)]
struct Source {
    id: RequestId,
    hops: u32,
    primary: bool,
}

/// Blocking iterator over the results of a Search.
///
/// Items are entries, continuation references and intermediate responses. When
/// the handle follows referrals, references are chased instead of returned, and
/// their entries come through the same iterator; a referred search which fails
/// produces an `Err` item, but doesn't end the iteration. The final result of the
/// original search is returned by [`finish()`](#method.finish).
///
/// A fault which cuts the search off ends the iteration; `finish()` returns it.
/// Dropping the iterator before the end abandons the outstanding searches.
#[derive(Debug)]
pub struct SearchResults {
    queue: SearchQueue,
    request: LdapRequest,
    sources: Vec<Source>,
    chase: Option<ReferralChase>,
    result: Option<Result<LdapResult>>,
}

impl SearchResults {
    pub(crate) fn new(
        queue: SearchQueue,
        request: LdapRequest,
        id: RequestId,
        chase: Option<ReferralChase>,
    ) -> SearchResults {
        SearchResults {
            queue,
            request,
            sources: vec![Source {
                id,
                hops: 0,
                primary: true,
            }],
            chase,
            result: None,
        }
    }

    /// Message IDs of the searches still running.
    pub fn message_ids(&self) -> Vec<RequestId> {
        self.sources.iter().map(|s| s.id).collect()
    }

    /// Drain the remaining items and return the result of the search.
    pub fn finish(mut self) -> Result<LdapResult> {
        for _ in self.by_ref() {}
        self.result.take().unwrap_or(Err(LdapError::EndOfStream))
    }

    fn follow(&mut self, refs: &[String], hops: u32, primary: bool) -> Result<()> {
        let Some(ref mut chase) = self.chase else {
            return Ok(());
        };
        let (id, _) = chase.send(refs, &self.request, hops, self.queue.as_ref())?;
        self.sources.push(Source { id, hops, primary });
        Ok(())
    }

    fn handle_done(&mut self, msg: LdapMessage) -> Option<Result<SearchItem>> {
        let idx = self.sources.iter().position(|s| s.id == msg.id)?;
        let source = self.sources.remove(idx);
        let res = match msg.result() {
            Ok(res) => res,
            Err(e) if source.primary => {
                self.result = Some(Err(e));
                return None;
            }
            Err(e) => return Some(Err(e)),
        };
        if res.rc == REFERRAL && self.chase.is_some() {
            return match self.follow(&res.refs, source.hops + 1, source.primary) {
                Ok(()) => None,
                Err(e) if source.primary => {
                    self.result = Some(Err(e));
                    None
                }
                Err(e) => Some(Err(e)),
            };
        }
        if source.primary {
            self.result = Some(Ok(res));
            None
        } else if res.rc != 0 {
            Some(Err(LdapError::from(res)))
        } else {
            None
        }
    }
}

impl Iterator for SearchResults {
    type Item = Result<SearchItem>;

    fn next(&mut self) -> Option<Result<SearchItem>> {
        while !self.sources.is_empty() {
            let msg = match self.queue.as_ref().get_message(None) {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    self.sources.clear();
                    break;
                }
                Err(e) => {
                    self.sources.clear();
                    self.queue.as_ref().abandon_all();
                    self.result = Some(Err(e));
                    break;
                }
            };
            if !msg.is_intermediate() {
                if let Some(item) = self.handle_done(msg) {
                    return Some(item);
                }
                continue;
            }
            let hops = self
                .sources
                .iter()
                .find(|s| s.id == msg.id)
                .map_or(0, |s| s.hops);
            match SearchItem::from_message(msg) {
                Ok(Some(SearchItem::Reference(refs))) if self.chase.is_some() => {
                    if let Err(e) = self.follow(&refs, hops + 1, false) {
                        return Some(Err(e));
                    }
                }
                Ok(Some(item)) => return Some(Ok(item)),
                Ok(None) => (),
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

impl Drop for SearchResults {
    fn drop(&mut self) {
        if !self.sources.is_empty() {
            self.queue.as_ref().abandon_all();
        }
    }
}
