//! Protocol kind enums and constants.
//!
//! Every kind serializes as a short lowercase name. Decoding an unknown name
//! fails, which the packet codec turns into a malformed-packet error.

use serde::{Deserialize, Serialize};

/// Current protocol version carried in the `vn` head field.
pub const PROTOCOL_VERSION: u8 = 0;

/// Default UDP port for a road stack.
pub const RAET_PORT: u16 = 7530;

/// Default UDP port used by test stacks.
pub const RAET_TEST_PORT: u16 = 7531;

/// Default ceiling for one UDP datagram, head and all.
pub const UDP_MAX_PACKET_SIZE: usize = 1400;

/// Hard ceiling for one UXD page.
pub const UXD_MAX_PACKET_SIZE: usize = 8192;

/// Largest number of segments a single message may be split into.
pub const MAX_SEGMENT_COUNT: usize = 0xffff;

/// Kind of a single packet within a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    /// Join request carrying the joiner's identity.
    Request,
    /// Join response carrying the correspondent's identity.
    Response,
    /// Terminal acknowledgement.
    Ack,
    /// Generic refusal, also used for stale sessions.
    Nack,
    /// Join is waiting on an acceptance decision.
    Pend,
    /// Allow step one.
    Hello,
    /// Allow step two.
    Cookie,
    /// Allow step three.
    Initiate,
    /// Application payload (or one segment of it).
    #[default]
    Message,
    /// Correspondent does not recognise the far id; rejoin vacuously.
    Renew,
    /// Correspondent refuses the exchange for now.
    Refuse,
    /// Correspondent rejected the identity.
    Reject,
    /// Sender is not joined.
    Unjoined,
    /// Sender is not allowed.
    Unallowed,
}

impl PacketKind {
    /// Kinds that terminate an exchange with a refusal.
    pub fn is_nack(self) -> bool {
        matches!(
            self,
            PacketKind::Nack
                | PacketKind::Renew
                | PacketKind::Refuse
                | PacketKind::Reject
                | PacketKind::Unjoined
                | PacketKind::Unallowed
        )
    }

    /// Kinds that must never be answered with a stale-nack.
    pub fn is_terminal(self) -> bool {
        self == PacketKind::Ack || self.is_nack()
    }
}

/// Kind of exchange a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrnsKind {
    /// Identity join.
    Join,
    /// Session key handshake.
    Allow,
    /// Application message delivery.
    #[default]
    Message,
}

/// Encoding of the packet head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadKind {
    /// JSON object terminated by `\r\n\r\n`.
    #[default]
    Json,
    /// MessagePack map.
    Binary,
}

/// Kind of the neck (authentication) part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeckKind {
    /// No authentication; body is plaintext.
    #[default]
    Nada,
    /// XChaCha20-Poly1305 nonce and tag; body is ciphertext.
    Aead,
}

impl NeckKind {
    /// Wire length of a neck of this kind.
    pub fn size(self) -> usize {
        match self {
            NeckKind::Nada => 0,
            NeckKind::Aead => 24 + 16,
        }
    }
}

/// Serialization of the body part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyKind {
    /// Empty body.
    #[default]
    Nada,
    /// JSON document.
    Json,
    /// MessagePack document.
    Msgpack,
    /// Opaque bytes (segments, handshake blobs).
    Raw,
}

/// Kind of the tail (verification) part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TailKind {
    /// No signature.
    #[default]
    Nada,
    /// Ed25519 signature over head, neck and body.
    Ed25519,
}

impl TailKind {
    /// Wire length of a tail of this kind.
    pub fn size(self) -> usize {
        match self {
            TailKind::Nada => 0,
            TailKind::Ed25519 => 64,
        }
    }
}

/// Trust status of a remote identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acceptance {
    /// Awaiting an accept/reject decision.
    #[default]
    Pending,
    /// Trusted.
    Accepted,
    /// Explicitly distrusted.
    Rejected,
}

/// How unseen or changed identities are treated by the keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoMode {
    /// Every unseen identity is pending until decided.
    #[default]
    Never,
    /// Unseen identities are accepted, then their keys are pinned.
    Once,
    /// Open mode: any identity is accepted and its keys replace stored ones.
    Always,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(
            serde_json::to_string(&PacketKind::Unallowed).unwrap(),
            "\"unallowed\""
        );
        assert_eq!(serde_json::to_string(&TrnsKind::Join).unwrap(), "\"join\"");
        assert_eq!(serde_json::to_string(&AutoMode::Once).unwrap(), "\"once\"");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(serde_json::from_str::<PacketKind>("\"bogus\"").is_err());
        assert!(serde_json::from_str::<TailKind>("\"rsa\"").is_err());
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(PacketKind::Ack.is_terminal());
        assert!(PacketKind::Reject.is_terminal());
        assert!(!PacketKind::Ack.is_nack());
        assert!(!PacketKind::Message.is_terminal());
        assert!(!PacketKind::Hello.is_terminal());
    }

    #[test]
    fn test_part_sizes() {
        assert_eq!(NeckKind::Nada.size(), 0);
        assert_eq!(NeckKind::Aead.size(), 40);
        assert_eq!(TailKind::Ed25519.size(), 64);
    }
}
