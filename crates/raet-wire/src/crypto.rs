//! Crypto provider: signing, box encryption and session keys.
//!
//! Long-term identity is two keypairs per estate:
//! 1. An Ed25519 [`Signer`]/[`Verifier`] pair (via `ed25519-dalek`) used to
//!    sign packet tails and Join bodies.
//! 2. An X25519 [`Privateer`]/[`Publican`] pair (via `x25519-dalek`) used for
//!    box encryption during the Allow handshake.
//!
//! A box is `XChaCha20-Poly1305(HKDF-SHA256(X25519(ours, theirs)))` with a
//! random 24-byte nonce, so either side of a key pair derives the same key.
//! Once Allow completes both sides hold the same [`SessionKey`], derived from
//! the two ephemeral keys, and use it to seal packet bodies.

use chacha20poly1305::aead::{Aead, AeadInPlace, KeyInit};
use chacha20poly1305::{Key, Tag, XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use raet_types::RaetError;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of a box/AEAD nonce.
pub const NONCE_SIZE: usize = 24;

/// Length of a Poly1305 tag.
pub const TAG_SIZE: usize = 16;

/// Length of an Ed25519 signature.
pub const SIGNATURE_SIZE: usize = 64;

/// Length of every public and secret key used here.
pub const KEY_SIZE: usize = 32;

const BOX_INFO: &[u8] = b"raet-box-v1";
const SESSION_INFO: &[u8] = b"raet-session-v1";

/// Errors from the crypto provider.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Invalid length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("Signature verification failed")]
    BadSignature,
    #[error("Decryption failed")]
    DecryptFailed,
    #[error("Encryption failed")]
    EncryptFailed,
    #[error("Non-contributory key exchange")]
    WeakKey,
}

impl From<CryptoError> for RaetError {
    fn from(e: CryptoError) -> Self {
        RaetError::Crypto(e.to_string())
    }
}

fn to_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N], CryptoError> {
    bytes.try_into().map_err(|_| CryptoError::InvalidLength {
        expected: N,
        actual: bytes.len(),
    })
}

fn decode_hex<const N: usize>(s: &str) -> Result<[u8; N], CryptoError> {
    let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    to_array(&bytes)
}

/// Generate a fresh random nonce from OS entropy.
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(info, &mut okm)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(okm)
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Long-term Ed25519 signing key.
#[derive(Clone)]
pub struct Signer {
    key: SigningKey,
}

impl Signer {
    /// Generate a new random signing key.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Load from a hex-encoded 32-byte seed.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let seed: [u8; KEY_SIZE] = decode_hex(s)?;
        Ok(Self {
            key: SigningKey::from_bytes(&seed),
        })
    }

    /// Hex-encoded seed, for the safe keep.
    pub fn keyhex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    /// Hex-encoded verify key.
    pub fn verhex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    /// The matching verifier.
    pub fn verifier(&self) -> Verifier {
        Verifier {
            key: self.key.verifying_key(),
        }
    }

    /// Sign `msg`, returning the raw 64-byte signature.
    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.key.sign(msg).to_bytes()
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signer(verhex={})", self.verhex())
    }
}

/// Ed25519 verify key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Verifier {
    key: VerifyingKey,
}

impl Verifier {
    /// Load from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; KEY_SIZE] = to_array(bytes)?;
        let key =
            VerifyingKey::from_bytes(&raw).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    /// Load from hex.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let raw: [u8; KEY_SIZE] = decode_hex(s)?;
        Self::from_bytes(&raw)
    }

    /// Hex-encoded key.
    pub fn hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    /// Verify a detached signature over `msg`.
    pub fn verify(&self, signature: &[u8], msg: &[u8]) -> Result<(), CryptoError> {
        let raw: [u8; SIGNATURE_SIZE] = to_array(signature)?;
        let signature = Signature::from_bytes(&raw);
        self.key
            .verify(msg, &signature)
            .map_err(|_| CryptoError::BadSignature)
    }
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Verifier({})", self.hex())
    }
}

// ---------------------------------------------------------------------------
// Box encryption
// ---------------------------------------------------------------------------

/// X25519 private key, long-term or ephemeral.
#[derive(Clone)]
pub struct Privateer {
    secret: StaticSecret,
}

impl Privateer {
    /// Generate a new random private key.
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Load from hex.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let raw: [u8; KEY_SIZE] = decode_hex(s)?;
        Ok(Self {
            secret: StaticSecret::from(raw),
        })
    }

    /// Hex-encoded private key, for the safe keep.
    pub fn keyhex(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }

    /// Hex-encoded public key.
    pub fn pubhex(&self) -> String {
        self.publican().hex()
    }

    /// The matching public key.
    pub fn publican(&self) -> Publican {
        Publican {
            key: PublicKey::from(&self.secret),
        }
    }

    fn shared(&self, theirs: &Publican) -> Result<[u8; KEY_SIZE], CryptoError> {
        let shared = self.secret.diffie_hellman(&theirs.key);
        if !shared.was_contributory() {
            return Err(CryptoError::WeakKey);
        }
        Ok(*shared.as_bytes())
    }

    fn box_cipher(&self, theirs: &Publican) -> Result<XChaCha20Poly1305, CryptoError> {
        let mut shared = self.shared(theirs)?;
        let mut key = derive_key(&shared, &[], BOX_INFO)?;
        shared.zeroize();
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        key.zeroize();
        Ok(cipher)
    }

    /// Box-encrypt `msg` to `theirs` with a fresh nonce.
    pub fn encrypt(
        &self,
        msg: &[u8],
        theirs: &Publican,
    ) -> Result<(Vec<u8>, [u8; NONCE_SIZE]), CryptoError> {
        let nonce = random_nonce();
        let cipher = self.box_cipher(theirs)?;
        let sealed = cipher
            .encrypt(XNonce::from_slice(&nonce), msg)
            .map_err(|_| CryptoError::EncryptFailed)?;
        Ok((sealed, nonce))
    }

    /// Open a box sealed by `theirs` to us.
    pub fn decrypt(
        &self,
        sealed: &[u8],
        nonce: &[u8],
        theirs: &Publican,
    ) -> Result<Vec<u8>, CryptoError> {
        let nonce: [u8; NONCE_SIZE] = to_array(nonce)?;
        let cipher = self.box_cipher(theirs)?;
        cipher
            .decrypt(XNonce::from_slice(&nonce), sealed)
            .map_err(|_| CryptoError::DecryptFailed)
    }

    /// Derive the session key shared with `theirs`.
    ///
    /// `salt` must be identical on both sides; the Allow handshake uses the
    /// initiator's ephemeral public key followed by the correspondent's.
    pub fn session_key(&self, theirs: &Publican, salt: &[u8]) -> Result<SessionKey, CryptoError> {
        let mut shared = self.shared(theirs)?;
        let key = derive_key(&shared, salt, SESSION_INFO)?;
        shared.zeroize();
        Ok(SessionKey { key })
    }
}

impl std::fmt::Debug for Privateer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Privateer(pubhex={})", self.pubhex())
    }
}

/// X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Publican {
    key: PublicKey,
}

impl Publican {
    /// Load from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; KEY_SIZE] = to_array(bytes)?;
        Ok(Self {
            key: PublicKey::from(raw),
        })
    }

    /// Load from hex.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let raw: [u8; KEY_SIZE] = decode_hex(s)?;
        Ok(Self {
            key: PublicKey::from(raw),
        })
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        self.key.as_bytes()
    }

    /// Hex-encoded key.
    pub fn hex(&self) -> String {
        hex::encode(self.key.as_bytes())
    }
}

impl std::fmt::Debug for Publican {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Publican({})", self.hex())
    }
}

// ---------------------------------------------------------------------------
// Session key
// ---------------------------------------------------------------------------

/// Symmetric key established by a completed Allow.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    key: [u8; KEY_SIZE],
}

impl SessionKey {
    /// Build from raw key material (cookie keys, tests).
    pub fn from_bytes(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Generate a random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.key))
    }

    /// Encrypt `buf` in place, returning `nonce || tag`.
    pub fn seal_detached(
        &self,
        aad: &[u8],
        buf: &mut [u8],
    ) -> Result<[u8; NONCE_SIZE + TAG_SIZE], CryptoError> {
        let nonce = random_nonce();
        let tag = self
            .cipher()
            .encrypt_in_place_detached(XNonce::from_slice(&nonce), aad, buf)
            .map_err(|_| CryptoError::EncryptFailed)?;
        let mut neck = [0u8; NONCE_SIZE + TAG_SIZE];
        neck[..NONCE_SIZE].copy_from_slice(&nonce);
        neck[NONCE_SIZE..].copy_from_slice(tag.as_slice());
        Ok(neck)
    }

    /// Authenticate and decrypt `buf` in place using a `nonce || tag` neck.
    pub fn open_detached(&self, aad: &[u8], neck: &[u8], buf: &mut [u8]) -> Result<(), CryptoError> {
        if neck.len() != NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::InvalidLength {
                expected: NONCE_SIZE + TAG_SIZE,
                actual: neck.len(),
            });
        }
        let (nonce, tag) = neck.split_at(NONCE_SIZE);
        self.cipher()
            .decrypt_in_place_detached(XNonce::from_slice(nonce), aad, buf, Tag::from_slice(tag))
            .map_err(|_| CryptoError::DecryptFailed)
    }

    /// Seal a whole message, returning `nonce || ciphertext`.
    pub fn seal(&self, msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = random_nonce();
        let sealed = self
            .cipher()
            .encrypt(XNonce::from_slice(&nonce), msg)
            .map_err(|_| CryptoError::EncryptFailed)?;
        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open a message produced by [`SessionKey::seal`].
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptFailed);
        }
        let (nonce, body) = sealed.split_at(NONCE_SIZE);
        self.cipher()
            .decrypt(XNonce::from_slice(nonce), body)
            .map_err(|_| CryptoError::DecryptFailed)
    }

    /// Short hex fingerprint; equal fingerprints mean equal keys.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.key);
        hex::encode(&digest[..8])
    }

    /// Constant-time equality.
    pub fn ct_eq(&self, other: &SessionKey) -> bool {
        subtle::ConstantTimeEq::ct_eq(&self.key[..], &other.key[..]).into()
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey({})", self.fingerprint())
    }
}
