//! Packet codec: one datagram made of head, neck, body and tail.
//!
//! ```text
//! +------+------+------+------+
//! | head | neck | body | tail |
//! +------+------+------+------+
//! ```
//!
//! - **head**: routing and control fields. Every field equal to its default is
//!   left off the wire. The head is either a JSON object terminated by
//!   `\r\n\r\n` or a MessagePack map; in both forms `hl` holds the head's own
//!   length as exactly two hex digits.
//! - **neck**: empty, or `nonce || tag` authenticating (and decrypting) the
//!   body under the session key with the head bytes as associated data.
//! - **body**: empty, a JSON/MessagePack document, or raw bytes. Segments of a
//!   split message are always raw slices; `bk` then names the serialization of
//!   the reassembled whole.
//! - **tail**: empty, or an Ed25519 signature over head, neck and body.
//!
//! Decoding fails closed: a packet is either fully understood or rejected
//! with [`PacketError::Malformed`].

use crate::crypto::{CryptoError, SessionKey, Signer, Verifier};
use raet_types::kinds::{
    BodyKind, HeadKind, NeckKind, PacketKind, TailKind, TrnsKind, PROTOCOL_VERSION,
};
use raet_types::RaetError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Terminator of a JSON head.
pub const HEAD_SEPARATOR: &[u8; 4] = b"\r\n\r\n";

/// Largest possible head (the `hl` slot holds two hex digits).
pub const MAX_HEAD_SIZE: usize = 0xff;

/// Errors from the packet codec.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("Malformed packet: {0}")]
    Malformed(String),
    #[error("Packet too large: {size} bytes (max {max})")]
    Oversize { size: usize, max: usize },
    #[error("Packet is not signed")]
    Unsigned,
    #[error("Packet body is sealed but no session key is available")]
    Unsealed,
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl From<PacketError> for RaetError {
    fn from(e: PacketError) -> Self {
        match e {
            PacketError::Oversize { size, max } => RaetError::Oversize { size, max },
            other => RaetError::MalformedPacket(other.to_string()),
        }
    }
}

fn malformed(e: impl std::fmt::Display) -> PacketError {
    PacketError::Malformed(e.to_string())
}

fn is_default<T: Default + PartialEq>(v: &T) -> bool {
    *v == T::default()
}

fn one() -> u16 {
    1
}

fn is_one(v: &u16) -> bool {
    *v == 1
}

/// `hl` is always present and always two lowercase hex digits.
mod hex_len {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u8, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{v:02x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u8, D::Error> {
        let s = String::deserialize(d)?;
        if s.len() != 2 {
            return Err(serde::de::Error::custom("hl must be two hex digits"));
        }
        u8::from_str_radix(&s, 16).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Head
// ---------------------------------------------------------------------------

/// Packet head fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Head {
    /// Protocol version.
    #[serde(rename = "vn", default, skip_serializing_if = "is_default")]
    pub version: u8,
    /// Packet kind.
    #[serde(rename = "pk", default, skip_serializing_if = "is_default")]
    pub packet_kind: PacketKind,
    /// Head encoding.
    #[serde(rename = "hk", default, skip_serializing_if = "is_default")]
    pub head_kind: HeadKind,
    /// Head length in bytes, separator included.
    #[serde(rename = "hl", with = "hex_len")]
    pub head_len: u8,
    /// Neck kind.
    #[serde(rename = "nk", default, skip_serializing_if = "is_default")]
    pub neck_kind: NeckKind,
    /// Neck length in bytes.
    #[serde(rename = "nl", default, skip_serializing_if = "is_default")]
    pub neck_len: u32,
    /// Body serialization.
    #[serde(rename = "bk", default, skip_serializing_if = "is_default")]
    pub body_kind: BodyKind,
    /// Body length in bytes.
    #[serde(rename = "bl", default, skip_serializing_if = "is_default")]
    pub body_len: u32,
    /// Tail kind.
    #[serde(rename = "tk", default, skip_serializing_if = "is_default")]
    pub tail_kind: TailKind,
    /// Tail length in bytes.
    #[serde(rename = "tl", default, skip_serializing_if = "is_default")]
    pub tail_len: u32,
    /// Sender's id for the receiver.
    #[serde(rename = "se", default, skip_serializing_if = "is_default")]
    pub source: u32,
    /// Receiver's id for the sender, 0 when not yet known.
    #[serde(rename = "de", default, skip_serializing_if = "is_default")]
    pub destination: u32,
    /// Set when the sender is the correspondent of the transaction.
    #[serde(rename = "cf", default, skip_serializing_if = "is_default")]
    pub correspondent: bool,
    /// Broadcast flag.
    #[serde(rename = "bf", default, skip_serializing_if = "is_default")]
    pub broadcast: bool,
    /// Session id of the transaction initiator.
    #[serde(rename = "si", default, skip_serializing_if = "is_default")]
    pub sid: u32,
    /// Transaction id.
    #[serde(rename = "ti", default, skip_serializing_if = "is_default")]
    pub tid: u32,
    /// Transaction kind.
    #[serde(rename = "xk", default, skip_serializing_if = "is_default")]
    pub trns_kind: TrnsKind,
    /// Sender waits for an ack.
    #[serde(rename = "wf", default, skip_serializing_if = "is_default")]
    pub wait: bool,
    /// Length of the whole (unsegmented) message body.
    #[serde(rename = "ml", default, skip_serializing_if = "is_default")]
    pub message_len: u32,
    /// Segment number.
    #[serde(rename = "sn", default, skip_serializing_if = "is_default")]
    pub segment: u16,
    /// Segment count.
    #[serde(rename = "sc", default = "one", skip_serializing_if = "is_one")]
    pub segment_count: u16,
    /// Set on whole-message retransmissions.
    #[serde(rename = "af", default, skip_serializing_if = "is_default")]
    pub resend_all: bool,
}

impl Default for Head {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_kind: PacketKind::default(),
            head_kind: HeadKind::default(),
            head_len: 0,
            neck_kind: NeckKind::default(),
            neck_len: 0,
            body_kind: BodyKind::default(),
            body_len: 0,
            tail_kind: TailKind::default(),
            tail_len: 0,
            source: 0,
            destination: 0,
            correspondent: false,
            broadcast: false,
            sid: 0,
            tid: 0,
            trns_kind: TrnsKind::default(),
            wait: false,
            message_len: 0,
            segment: 0,
            segment_count: 1,
            resend_all: false,
        }
    }
}

impl Head {
    /// Whether this packet is one segment of a split message.
    pub fn is_segmented(&self) -> bool {
        self.segment_count > 1
    }

    fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        match self.head_kind {
            HeadKind::Json => {
                let mut bytes = serde_json::to_vec(self).map_err(malformed)?;
                bytes.extend_from_slice(HEAD_SEPARATOR);
                Ok(bytes)
            }
            HeadKind::Binary => rmp_serde::to_vec_named(self).map_err(malformed),
        }
    }

    /// Encode the head, fixing up `hl` to the true length.
    pub fn encode(&mut self) -> Result<Vec<u8>, PacketError> {
        self.head_len = 0;
        let sized = Head::serialize(self)?;
        if sized.len() > MAX_HEAD_SIZE {
            return Err(PacketError::Malformed(format!(
                "head length {} exceeds {}",
                sized.len(),
                MAX_HEAD_SIZE
            )));
        }
        self.head_len = sized.len() as u8;
        let bytes = Head::serialize(self)?;
        if bytes.len() != sized.len() {
            return Err(malformed("head length changed while encoding"));
        }
        Ok(bytes)
    }

    /// Decode a head from the front of `bytes`, returning it with its length.
    pub fn decode(bytes: &[u8]) -> Result<(Head, usize), PacketError> {
        let first = *bytes.first().ok_or_else(|| malformed("empty packet"))?;
        let (head, consumed, kind) = if first == b'{' {
            let end = bytes
                .windows(HEAD_SEPARATOR.len())
                .position(|w| w == HEAD_SEPARATOR)
                .ok_or_else(|| malformed("head separator missing"))?;
            let head: Head = serde_json::from_slice(&bytes[..end]).map_err(malformed)?;
            (head, end + HEAD_SEPARATOR.len(), HeadKind::Json)
        } else if (0x80..=0x8f).contains(&first) || first == 0xde || first == 0xdf {
            let mut rest = bytes;
            let head: Head = rmp_serde::from_read(&mut rest).map_err(malformed)?;
            (head, bytes.len() - rest.len(), HeadKind::Binary)
        } else {
            return Err(malformed(format!("unknown head marker 0x{first:02x}")));
        };

        if head.head_kind != kind {
            return Err(malformed("head kind does not match encoding"));
        }
        if head.head_len as usize != consumed {
            return Err(PacketError::Malformed(format!(
                "head length mismatch: hl={} actual={}",
                head.head_len, consumed
            )));
        }
        if head.version != PROTOCOL_VERSION {
            return Err(PacketError::Malformed(format!(
                "unsupported version {}",
                head.version
            )));
        }
        Ok((head, consumed))
    }
}

// ---------------------------------------------------------------------------
// Body
// ---------------------------------------------------------------------------

/// Structured packet payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// No payload.
    Nada,
    /// A document serialized per the head's `bk`.
    Data(Value),
    /// Opaque bytes.
    Raw(Vec<u8>),
}

/// Serialize a document with the given body kind.
pub fn serialize_body(kind: BodyKind, value: &Value) -> Result<Vec<u8>, PacketError> {
    match kind {
        BodyKind::Json => serde_json::to_vec(value).map_err(malformed),
        BodyKind::Msgpack => rmp_serde::to_vec_named(value).map_err(malformed),
        BodyKind::Nada | BodyKind::Raw => Err(PacketError::Malformed(format!(
            "body kind {kind:?} cannot carry a document"
        ))),
    }
}

/// Parse a document with the given body kind.
pub fn deserialize_body(kind: BodyKind, bytes: &[u8]) -> Result<Value, PacketError> {
    match kind {
        BodyKind::Json => serde_json::from_slice(bytes).map_err(malformed),
        BodyKind::Msgpack => rmp_serde::from_slice(bytes).map_err(malformed),
        BodyKind::Nada | BodyKind::Raw => Err(PacketError::Malformed(format!(
            "body kind {kind:?} cannot carry a document"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Outbound packet
// ---------------------------------------------------------------------------

/// Keys applied when packing.
#[derive(Default, Clone, Copy)]
pub struct Sealing<'a> {
    /// Seal the body under this session key.
    pub session: Option<&'a SessionKey>,
    /// Sign the packet with this key.
    pub signer: Option<&'a Signer>,
}

/// A packet ready to be packed.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Head fields; lengths and part kinds are filled in by `pack`.
    pub head: Head,
    /// Payload.
    pub body: Body,
}

impl Packet {
    /// New packet with the given head and body.
    pub fn new(head: Head, body: Body) -> Self {
        Self { head, body }
    }

    /// Pack into wire bytes. Fails with `Oversize` above `max_size`.
    pub fn pack(&mut self, sealing: Sealing<'_>, max_size: usize) -> Result<Vec<u8>, PacketError> {
        let mut body = match &self.body {
            Body::Nada => {
                self.head.body_kind = BodyKind::Nada;
                Vec::new()
            }
            Body::Data(value) => serialize_body(self.head.body_kind, value)?,
            Body::Raw(bytes) => {
                if !self.head.is_segmented() {
                    self.head.body_kind = BodyKind::Raw;
                }
                bytes.clone()
            }
        };

        self.head.neck_kind = if sealing.session.is_some() {
            NeckKind::Aead
        } else {
            NeckKind::Nada
        };
        self.head.tail_kind = if sealing.signer.is_some() {
            TailKind::Ed25519
        } else {
            TailKind::Nada
        };
        self.head.neck_len = self.head.neck_kind.size() as u32;
        self.head.body_len = body.len() as u32;
        self.head.tail_len = self.head.tail_kind.size() as u32;

        let head = self.head.encode()?;
        let neck = match sealing.session {
            Some(key) => key.seal_detached(&head, &mut body)?.to_vec(),
            None => Vec::new(),
        };

        let size = head.len() + neck.len() + body.len() + self.head.tail_len as usize;
        if size > max_size {
            return Err(PacketError::Oversize {
                size,
                max: max_size,
            });
        }

        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(&head);
        out.extend_from_slice(&neck);
        out.extend_from_slice(&body);
        if let Some(signer) = sealing.signer {
            let signature = signer.sign(&out);
            out.extend_from_slice(&signature);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Inbound packet
// ---------------------------------------------------------------------------

/// A received packet whose head has been parsed and whose part lengths
/// check out. Neck and tail are verified on demand.
#[derive(Debug, Clone)]
pub struct RxPacket {
    /// Parsed head.
    pub head: Head,
    raw: Vec<u8>,
    head_end: usize,
    neck_end: usize,
    body_end: usize,
}

impl RxPacket {
    /// Parse the head and validate part lengths (enough to route).
    pub fn parse_outer(raw: Vec<u8>) -> Result<Self, PacketError> {
        let (head, head_end) = Head::decode(&raw)?;
        if head.neck_len as usize != head.neck_kind.size() {
            return Err(malformed("neck length does not match neck kind"));
        }
        if head.tail_len as usize != head.tail_kind.size() {
            return Err(malformed("tail length does not match tail kind"));
        }
        if head.segment_count == 0 || head.segment >= head.segment_count {
            return Err(malformed("segment number out of range"));
        }
        let neck_end = head_end + head.neck_len as usize;
        let body_end = neck_end + head.body_len as usize;
        let total = body_end + head.tail_len as usize;
        if total != raw.len() {
            return Err(PacketError::Malformed(format!(
                "packet length mismatch: declared={} actual={}",
                total,
                raw.len()
            )));
        }
        if head.body_kind == BodyKind::Nada && head.body_len != 0 {
            return Err(malformed("nada body with nonzero length"));
        }
        Ok(Self {
            head,
            raw,
            head_end,
            neck_end,
            body_end,
        })
    }

    /// The whole packet as received.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Whether the tail carries a signature.
    pub fn is_signed(&self) -> bool {
        self.head.tail_kind != TailKind::Nada
    }

    /// Whether the body is sealed under a session key.
    pub fn is_sealed(&self) -> bool {
        self.head.neck_kind != NeckKind::Nada
    }

    /// Verify the tail signature over head, neck and body.
    pub fn verify(&self, verifier: &Verifier) -> Result<(), PacketError> {
        match self.head.tail_kind {
            TailKind::Nada => Err(PacketError::Unsigned),
            TailKind::Ed25519 => {
                verifier.verify(&self.raw[self.body_end..], &self.raw[..self.body_end])?;
                Ok(())
            }
        }
    }

    /// Open the neck (if sealed) and return the plaintext body bytes.
    pub fn body_bytes(&self, session: Option<&SessionKey>) -> Result<Vec<u8>, PacketError> {
        let mut body = self.raw[self.neck_end..self.body_end].to_vec();
        match self.head.neck_kind {
            NeckKind::Nada => {}
            NeckKind::Aead => {
                let key = session.ok_or(PacketError::Unsealed)?;
                key.open_detached(
                    &self.raw[..self.head_end],
                    &self.raw[self.head_end..self.neck_end],
                    &mut body,
                )?;
            }
        }
        Ok(body)
    }

    /// Open the neck and parse the body.
    pub fn body(&self, session: Option<&SessionKey>) -> Result<Body, PacketError> {
        let bytes = self.body_bytes(session)?;
        if self.head.is_segmented() {
            return Ok(Body::Raw(bytes));
        }
        match self.head.body_kind {
            BodyKind::Nada => Ok(Body::Nada),
            BodyKind::Raw => Ok(Body::Raw(bytes)),
            kind => Ok(Body::Data(deserialize_body(kind, &bytes)?)),
        }
    }
}
