//! UXD pages: the local-socket framing between processes on one host.
//!
//! Each datagram is one page:
//!
//! ```text
//! RAET\n<kind>\n\n<body>
//! ```
//!
//! where `<kind>` is `json` or `msgpack` and `<body>` is a [`Leaf`]: the
//! sender and receiver channel names, a message id, the page number and
//! count, and a hex section of the serialized message. A message that fits
//! travels as a single leaf; larger ones are paginated and rebuilt by a
//! [`Binder`] once every page has arrived.

use crate::segment::{segment, Reassembly, SegmentError};
use raet_types::RaetError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Magic prefix of every page.
pub const PAGE_MAGIC: &[u8] = b"RAET\n";

/// Separator between the kind line and the body.
pub const PAGE_SEPARATOR: &[u8] = b"\n\n";

/// Most partially received messages a [`Binder`] holds at once.
pub const MAX_OPEN_BOOKS: usize = 256;

/// Errors from the page codec.
#[derive(Debug, Error)]
pub enum PageError {
    #[error("Malformed page: {0}")]
    Malformed(String),
    #[error("Page too large: {size} bytes (max {max})")]
    Oversize { size: usize, max: usize },
    #[error("Segmentation error: {0}")]
    Segment(#[from] SegmentError),
}

impl From<PageError> for RaetError {
    fn from(e: PageError) -> Self {
        match e {
            PageError::Oversize { size, max } => RaetError::Oversize { size, max },
            PageError::Segment(s) => s.into(),
            PageError::Malformed(m) => RaetError::MalformedPacket(m),
        }
    }
}

fn malformed(e: impl std::fmt::Display) -> PageError {
    PageError::Malformed(e.to_string())
}

/// Serialization of a page body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    #[default]
    Json,
    Msgpack,
}

impl PageKind {
    fn name(self) -> &'static [u8] {
        match self {
            PageKind::Json => b"json",
            PageKind::Msgpack => b"msgpack",
        }
    }

    fn from_name(name: &[u8]) -> Result<Self, PageError> {
        match name {
            b"json" => Ok(PageKind::Json),
            b"msgpack" => Ok(PageKind::Msgpack),
            other => Err(PageError::Malformed(format!(
                "unknown page kind {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    fn to_vec<T: Serialize>(self, value: &T) -> Result<Vec<u8>, PageError> {
        match self {
            PageKind::Json => serde_json::to_vec(value).map_err(malformed),
            PageKind::Msgpack => rmp_serde::to_vec_named(value).map_err(malformed),
        }
    }

    fn from_slice<T: for<'de> Deserialize<'de>>(self, bytes: &[u8]) -> Result<T, PageError> {
        match self {
            PageKind::Json => serde_json::from_slice(bytes).map_err(malformed),
            PageKind::Msgpack => rmp_serde::from_slice(bytes).map_err(malformed),
        }
    }
}

/// One page of a (possibly paginated) message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leaf {
    /// Sender channel.
    #[serde(rename = "sc")]
    pub sender: String,
    /// Receiver channel.
    #[serde(rename = "dc")]
    pub receiver: String,
    /// Message id, constant across all pages of one message.
    #[serde(rename = "mi")]
    pub message_id: u64,
    /// Page number.
    #[serde(rename = "pn")]
    pub index: u32,
    /// Page count.
    #[serde(rename = "pc")]
    pub count: u32,
    /// Hex-encoded section of the serialized message.
    pub section: String,
}

/// A framed page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Body serialization.
    pub kind: PageKind,
    /// Page body.
    pub leaf: Leaf,
}

impl Page {
    /// Frame the page into bytes.
    pub fn pack(&self) -> Result<Vec<u8>, PageError> {
        let body = self.kind.to_vec(&self.leaf)?;
        let mut out = Vec::with_capacity(PAGE_MAGIC.len() + 16 + body.len());
        out.extend_from_slice(PAGE_MAGIC);
        out.extend_from_slice(self.kind.name());
        out.extend_from_slice(PAGE_SEPARATOR);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse a framed page.
    pub fn parse(bytes: &[u8]) -> Result<Self, PageError> {
        let rest = bytes
            .strip_prefix(PAGE_MAGIC)
            .ok_or_else(|| malformed("missing page magic"))?;
        let sep = rest
            .windows(PAGE_SEPARATOR.len())
            .position(|w| w == PAGE_SEPARATOR)
            .ok_or_else(|| malformed("missing page separator"))?;
        let kind = PageKind::from_name(&rest[..sep])?;
        let leaf: Leaf = kind.from_slice(&rest[sep + PAGE_SEPARATOR.len()..])?;
        if leaf.count == 0 || leaf.index >= leaf.count {
            return Err(malformed("page number out of range"));
        }
        Ok(Self { kind, leaf })
    }
}

/// Splits outgoing messages into pages for one sender channel.
#[derive(Debug, Clone)]
pub struct Paginator {
    sender: String,
    kind: PageKind,
    page_size: usize,
    next_id: u64,
}

impl Paginator {
    /// New paginator for `sender` with the given page ceiling.
    pub fn new(sender: impl Into<String>, kind: PageKind, page_size: usize) -> Self {
        Self {
            sender: sender.into(),
            kind,
            page_size,
            next_id: 0,
        }
    }

    fn next_message_id(&mut self) -> u64 {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }

    /// Serialize `msg` and split it into framed pages addressed to `receiver`.
    ///
    /// Returns one page when the message fits; every page of a message shares
    /// one message id.
    pub fn paginate(&mut self, receiver: &str, msg: &Value) -> Result<Vec<Vec<u8>>, PageError> {
        let data = self.kind.to_vec(msg)?;
        let message_id = self.next_message_id();

        let frame = Page {
            kind: self.kind,
            leaf: Leaf {
                sender: self.sender.clone(),
                receiver: receiver.to_string(),
                message_id: u64::MAX,
                index: u32::MAX,
                count: u32::MAX,
                section: String::new(),
            },
        }
        .pack()?;
        if frame.len() >= self.page_size {
            return Err(PageError::Oversize {
                size: frame.len(),
                max: self.page_size,
            });
        }
        // hex doubles every byte
        let section_size = (self.page_size - frame.len()) / 2;
        let sections = segment(&data, section_size.max(1))?;
        let count = sections.len() as u32;

        let mut pages = Vec::with_capacity(sections.len());
        for (index, section) in sections.into_iter().enumerate() {
            let page = Page {
                kind: self.kind,
                leaf: Leaf {
                    sender: self.sender.clone(),
                    receiver: receiver.to_string(),
                    message_id,
                    index: index as u32,
                    count,
                    section: hex::encode(section),
                },
            }
            .pack()?;
            if page.len() > self.page_size {
                return Err(PageError::Oversize {
                    size: page.len(),
                    max: self.page_size,
                });
            }
            pages.push(page);
        }
        Ok(pages)
    }
}

/// One partially received message.
#[derive(Debug)]
struct Book {
    kind: PageKind,
    opened: Instant,
    pages: Reassembly,
}

/// Collects pages into whole messages, one book per
/// (sender channel, receiver channel, message id).
///
/// Books whose remaining pages never arrive are dropped by
/// [`Binder::evict_stale`]; past [`MAX_OPEN_BOOKS`] the oldest book is
/// dropped to make room.
#[derive(Debug, Default)]
pub struct Binder {
    books: HashMap<(String, String, u64), Book>,
}

impl Binder {
    /// New, empty binder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of partially received messages.
    pub fn open_books(&self) -> usize {
        self.books.len()
    }

    /// Drop books opened more than `max_age` before `now`.
    /// Returns how many were dropped.
    pub fn evict_stale(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.books.len();
        self.books
            .retain(|_, book| now.saturating_duration_since(book.opened) <= max_age);
        before - self.books.len()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .books
            .iter()
            .min_by_key(|(_, book)| book.opened)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.books.remove(&key);
        }
    }

    /// Feed one framed page. Returns `(sender, message)` once complete.
    pub fn parse(&mut self, bytes: &[u8]) -> Result<Option<(String, Value)>, PageError> {
        self.parse_at(bytes, Instant::now())
    }

    /// [`Binder::parse`] with an explicit arrival time.
    pub fn parse_at(
        &mut self,
        bytes: &[u8],
        now: Instant,
    ) -> Result<Option<(String, Value)>, PageError> {
        let page = Page::parse(bytes)?;
        let leaf = page.leaf;
        let section = hex::decode(&leaf.section).map_err(malformed)?;

        if leaf.count == 1 {
            let msg = page.kind.from_slice(&section)?;
            return Ok(Some((leaf.sender, msg)));
        }

        let key = (leaf.sender.clone(), leaf.receiver.clone(), leaf.message_id);
        if !self.books.contains_key(&key) && self.books.len() >= MAX_OPEN_BOOKS {
            self.evict_oldest();
        }
        let book = match self.books.entry(key.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(Book {
                kind: page.kind,
                opened: now,
                pages: Reassembly::new(leaf.count as usize, None)?,
            }),
        };
        if book.kind != page.kind {
            return Err(malformed("page kind changed within one message"));
        }
        let kind = book.kind;
        let whole = match book
            .pages
            .accept(leaf.index as usize, leaf.count as usize, &section)
        {
            Ok(whole) => whole,
            Err(e) => {
                self.books.remove(&key);
                return Err(e.into());
            }
        };
        match whole {
            Some(data) => {
                self.books.remove(&key);
                let msg = kind.from_slice(&data)?;
                Ok(Some((leaf.sender, msg)))
            }
            None => Ok(None),
        }
    }
}
