//! RAET wire format: everything that turns protocol state into bytes.
//!
//! ## Architecture
//!
//! - **crypto**: Ed25519 signing plus X25519 box encryption and session keys
//! - **packet**: head/neck/body/tail datagram codec
//! - **segment**: splitting oversized messages and all-or-nothing reassembly
//! - **page**: the local-socket (UXD) page format and its paginated books

pub mod crypto;
pub mod packet;
pub mod page;
pub mod segment;

pub use crypto::{CryptoError, Privateer, Publican, SessionKey, Signer, Verifier};
pub use packet::{Body, Head, Packet, PacketError};
pub use page::{Binder, Page, PageError, PageKind, Paginator};
pub use segment::{Reassembly, SegmentError};
