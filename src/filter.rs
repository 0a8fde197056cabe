use std::fmt;

use lber::common::TagClass;
use lber::structures::{Boolean, ExplicitTag, OctetString, Sequence, Set, Tag};

const AND_FILT: u64 = 0;
const OR_FILT: u64 = 1;
const NOT_FILT: u64 = 2;

const EQ_MATCH: u64 = 3;
const SUBSTR_MATCH: u64 = 4;
const GTE_MATCH: u64 = 5;
const LTE_MATCH: u64 = 6;
const PRES_MATCH: u64 = 7;
const APPROX_MATCH: u64 = 8;
const EXT_MATCH: u64 = 9;

const SUB_INITIAL: u64 = 0;
const SUB_ANY: u64 = 1;
const SUB_FINAL: u64 = 2;

/// Search filter.
///
/// Filters are built from their parts rather than parsed from the string
/// representation, so an invalid filter can't reach the server. `Display`
/// produces the RFC 4515 form, with assertion values escaped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality(String, Vec<u8>),
    Substrings {
        attr: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        fin: Option<Vec<u8>>,
    },
    GreaterOrEqual(String, Vec<u8>),
    LessOrEqual(String, Vec<u8>),
    Present(String),
    Approx(String, Vec<u8>),
    Extensible {
        rule: Option<String>,
        attr: Option<String>,
        value: Vec<u8>,
        dn_attrs: bool,
    },
}

impl Filter {
    pub fn eq(attr: &str, val: impl AsRef<[u8]>) -> Filter {
        Filter::Equality(attr.to_owned(), val.as_ref().to_vec())
    }

    pub fn present(attr: &str) -> Filter {
        Filter::Present(attr.to_owned())
    }

    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Filter {
        Filter::And(filters.into_iter().collect())
    }

    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Filter {
        Filter::Or(filters.into_iter().collect())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Filter {
        Filter::Not(Box::new(filter))
    }

    pub fn ge(attr: &str, val: impl AsRef<[u8]>) -> Filter {
        Filter::GreaterOrEqual(attr.to_owned(), val.as_ref().to_vec())
    }

    pub fn le(attr: &str, val: impl AsRef<[u8]>) -> Filter {
        Filter::LessOrEqual(attr.to_owned(), val.as_ref().to_vec())
    }

    pub fn approx(attr: &str, val: impl AsRef<[u8]>) -> Filter {
        Filter::Approx(attr.to_owned(), val.as_ref().to_vec())
    }

    /// Substring match from the pieces of a pattern split at asterisks.
    ///
    /// `Filter::substrings("cn", &["J", "n", ""])` is `(cn=J*n*)`. Empty pieces
    /// in the middle are skipped.
    pub fn substrings<S: AsRef<[u8]>>(attr: &str, pieces: &[S]) -> Filter {
        let n = pieces.len();
        let mut initial = None;
        let mut any = vec![];
        let mut fin = None;
        for (i, piece) in pieces.iter().map(AsRef::as_ref).enumerate() {
            if piece.is_empty() {
                continue;
            }
            if i == 0 {
                initial = Some(piece.to_vec());
            } else if i + 1 == n {
                fin = Some(piece.to_vec());
            } else {
                any.push(piece.to_vec());
            }
        }
        Filter::Substrings {
            attr: attr.to_owned(),
            initial,
            any,
            fin,
        }
    }

    /// BER encoding of the filter.
    pub fn to_tag(&self) -> Tag {
        match *self {
            Filter::And(ref filters) => Tag::Set(Set {
                class: TagClass::Context,
                id: AND_FILT,
                inner: filters.iter().map(Filter::to_tag).collect(),
            }),
            Filter::Or(ref filters) => Tag::Set(Set {
                class: TagClass::Context,
                id: OR_FILT,
                inner: filters.iter().map(Filter::to_tag).collect(),
            }),
            Filter::Not(ref filter) => Tag::ExplicitTag(ExplicitTag {
                class: TagClass::Context,
                id: NOT_FILT,
                inner: Box::new(filter.to_tag()),
            }),
            Filter::Equality(ref attr, ref val) => ava(EQ_MATCH, attr, val),
            Filter::GreaterOrEqual(ref attr, ref val) => ava(GTE_MATCH, attr, val),
            Filter::LessOrEqual(ref attr, ref val) => ava(LTE_MATCH, attr, val),
            Filter::Approx(ref attr, ref val) => ava(APPROX_MATCH, attr, val),
            Filter::Present(ref attr) => Tag::OctetString(OctetString {
                class: TagClass::Context,
                id: PRES_MATCH,
                inner: Vec::from(attr.as_bytes()),
            }),
            Filter::Substrings {
                ref attr,
                ref initial,
                ref any,
                ref fin,
            } => {
                let mut inner = vec![];
                let pieces = initial
                    .iter()
                    .map(|p| (SUB_INITIAL, p))
                    .chain(any.iter().map(|p| (SUB_ANY, p)))
                    .chain(fin.iter().map(|p| (SUB_FINAL, p)));
                for (id, piece) in pieces {
                    inner.push(Tag::OctetString(OctetString {
                        class: TagClass::Context,
                        id,
                        inner: piece.clone(),
                    }));
                }
                Tag::Sequence(Sequence {
                    class: TagClass::Context,
                    id: SUBSTR_MATCH,
                    inner: vec![
                        Tag::OctetString(OctetString {
                            inner: Vec::from(attr.as_bytes()),
                            ..Default::default()
                        }),
                        Tag::Sequence(Sequence {
                            inner,
                            ..Default::default()
                        }),
                    ],
                })
            }
            Filter::Extensible {
                ref rule,
                ref attr,
                ref value,
                dn_attrs,
            } => {
                let mut inner = vec![];
                if let Some(rule) = rule {
                    inner.push(Tag::OctetString(OctetString {
                        class: TagClass::Context,
                        id: 1,
                        inner: Vec::from(rule.as_bytes()),
                    }));
                }
                if let Some(attr) = attr {
                    inner.push(Tag::OctetString(OctetString {
                        class: TagClass::Context,
                        id: 2,
                        inner: Vec::from(attr.as_bytes()),
                    }));
                }
                inner.push(Tag::OctetString(OctetString {
                    class: TagClass::Context,
                    id: 3,
                    inner: value.clone(),
                }));
                if dn_attrs {
                    inner.push(Tag::Boolean(Boolean {
                        class: TagClass::Context,
                        id: 4,
                        inner: true,
                    }));
                }
                Tag::Sequence(Sequence {
                    class: TagClass::Context,
                    id: EXT_MATCH,
                    inner,
                })
            }
        }
    }
}

fn ava(id: u64, attr: &str, val: &[u8]) -> Tag {
    Tag::Sequence(Sequence {
        class: TagClass::Context,
        id,
        inner: vec![
            Tag::OctetString(OctetString {
                inner: Vec::from(attr.as_bytes()),
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: val.to_vec(),
                ..Default::default()
            }),
        ],
    })
}

struct Escaped<'a>(&'a [u8]);

impl fmt::Display for Escaped<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &c in self.0 {
            if c == b'*' || c == b'(' || c == b')' || c == b'\\' || !(0x20..0x7f).contains(&c) {
                write!(f, "\\{:02x}", c)?;
            } else {
                write!(f, "{}", c as char)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Filter::And(ref filters) | Filter::Or(ref filters) => {
                let op = if matches!(self, Filter::And(_)) { '&' } else { '|' };
                write!(f, "({}", op)?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                write!(f, ")")
            }
            Filter::Not(ref filter) => write!(f, "(!{})", filter),
            Filter::Equality(ref attr, ref val) => write!(f, "({}={})", attr, Escaped(val)),
            Filter::GreaterOrEqual(ref attr, ref val) => {
                write!(f, "({}>={})", attr, Escaped(val))
            }
            Filter::LessOrEqual(ref attr, ref val) => write!(f, "({}<={})", attr, Escaped(val)),
            Filter::Approx(ref attr, ref val) => write!(f, "({}~={})", attr, Escaped(val)),
            Filter::Present(ref attr) => write!(f, "({}=*)", attr),
            Filter::Substrings {
                ref attr,
                ref initial,
                ref any,
                ref fin,
            } => {
                write!(f, "({}=", attr)?;
                if let Some(initial) = initial {
                    write!(f, "{}", Escaped(initial))?;
                }
                write!(f, "*")?;
                for piece in any {
                    write!(f, "{}*", Escaped(piece))?;
                }
                if let Some(fin) = fin {
                    write!(f, "{}", Escaped(fin))?;
                }
                write!(f, ")")
            }
            Filter::Extensible {
                ref rule,
                ref attr,
                ref value,
                dn_attrs,
            } => {
                write!(f, "(")?;
                if let Some(attr) = attr {
                    write!(f, "{}", attr)?;
                }
                if dn_attrs {
                    write!(f, ":dn")?;
                }
                if let Some(rule) = rule {
                    write!(f, ":{}", rule)?;
                }
                write!(f, ":={})", Escaped(value))
            }
        }
    }
}
