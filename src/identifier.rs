//! # Identifiers and Prefixes
//!
//! This module defines the addressing primitives used throughout flowmesh:
//!
//! - [`EventId`]: 256-bit message identifier with internal field structure
//! - [`Prefix`]: a leading bit-substring of an identifier, the subscription key
//! - [`IdentifierCodec`]: composes topic prefixes with cached per-topic nonces
//!
//! Fresh identifiers come from [`Prefix::generate_id`], which appends the
//! per-message random suffix.
//!
//! ## Identifier Layout
//!
//! An identifier is 256 bits of ordered fields:
//!
//! | Field | Bits | Source |
//! |-------|------|--------|
//! | `org_id` | 64 | random, drawn once per organization |
//! | `topic_hash` | 32 | BLAKE3 of the topic path, scoped to the org |
//! | `topic_nonce` | 32 | random, drawn once per (org, topic) pair |
//! | `random` | 128 | fresh CSPRNG draw per message |
//!
//! The leading 128 bits (`org_id + topic_hash + topic_nonce`) are stable for
//! every message on one topic within one org: this is the **shareable prefix**,
//! safe to disclose to grant topic-level access. The trailing 128 random bits
//! are never shared, so no party can predict future identifiers even for a
//! topic it can read.
//!
//! Nothing in matching or routing inspects the field boundaries, so a fully
//! random identifier (the flat addressing scheme) works unchanged: it is the
//! degenerate case where the org/topic fields happen to be random too.
//!
//! ## Security Invariants
//!
//! - Prefixes shorter than [`MIN_PREFIX_BITS`] are rejected at every boundary;
//!   a short prefix is guessable and would enable scanning the id space.
//! - Random suffixes come from the OS CSPRNG; 128 bits of suffix entropy makes
//!   collisions negligible under any realistic volume.
//! - `Prefix` is kept in canonical form: every bit past `bit_len` is zero.

use std::num::NonZeroUsize;

use lru::LruCache;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Width of a full identifier in bits.
pub const ID_BITS: u16 = 256;

/// Width of a full identifier in bytes.
pub const ID_BYTES: usize = 32;

/// Minimum subscribable prefix length in bits.
///
/// Shorter prefixes are rejected with [`PrefixError::TooShort`] regardless of
/// proof validity: 63 bits or fewer is within scanning reach.
pub const MIN_PREFIX_BITS: u16 = 64;

/// Length of the stable org+topic portion of a structured identifier.
pub const SHAREABLE_PREFIX_BITS: u16 = 128;

/// Domain separation prefix for topic hashing.
/// Prevents cross-protocol hash reuse.
const TOPIC_HASH_DOMAIN: &[u8] = b"flowmesh-topic-v1:";

/// Maximum (org, topic) nonce pairs cached by the codec.
/// The identity collaborator persists nonces; this cache only avoids
/// re-deriving hot topics.
const MAX_CACHED_TOPIC_NONCES: usize = 10_000;

/// XOR two 32-byte coordinates. The routing metric of the identifier space.
#[inline]
pub(crate) fn xor32(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

/// Compare two XOR distances lexicographically.
///
/// Used to determine which of two coordinates is closer to a target in the
/// XOR metric space.
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    for i in 0..32 {
        if a[i] < b[i] {
            return std::cmp::Ordering::Less;
        } else if a[i] > b[i] {
            return std::cmp::Ordering::Greater;
        }
    }
    std::cmp::Ordering::Equal
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId([u8; 32]);

impl EventId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Draw a fully random identifier (flat addressing scheme).
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Value of bit `i`, counting from the most significant bit of byte 0.
    #[inline]
    pub(crate) fn bit(&self, i: u16) -> bool {
        debug_assert!(i < ID_BITS);
        let byte = self.0[(i / 8) as usize];
        byte & (0x80 >> (i % 8)) != 0
    }

    #[inline]
    pub fn xor_distance(&self, other: &EventId) -> [u8; 32] {
        xor32(&self.0, &other.0)
    }

    /// The stable org+topic portion of this identifier: the leading
    /// [`SHAREABLE_PREFIX_BITS`] bits with the random suffix stripped.
    pub fn shareable_prefix(&self) -> Prefix {
        Prefix::from_id_bits(self, SHAREABLE_PREFIX_BITS)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ID_BYTES {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for EventId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Reasons a prefix fails boundary validation.
///
/// These are rejected synchronously at the boundary and never enter the
/// subscription index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixError {
    /// Fewer than [`MIN_PREFIX_BITS`] significant bits.
    TooShort { bits: u16 },
    /// More than [`ID_BITS`] significant bits.
    TooLong { bits: u16 },
    /// Input could not be decoded as prefix bytes.
    Malformed,
}

impl std::fmt::Display for PrefixError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrefixError::TooShort { bits } => {
                write!(f, "prefix too short: {bits} bits (minimum {MIN_PREFIX_BITS})")
            }
            PrefixError::TooLong { bits } => {
                write!(f, "prefix too long: {bits} bits (maximum {ID_BITS})")
            }
            PrefixError::Malformed => write!(f, "malformed prefix"),
        }
    }
}

impl std::error::Error for PrefixError {}

/// Input encoding of a prefix supplied over the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrefixFormat {
    /// Raw UTF-8 bytes of the input string.
    Utf8,
    /// Hex digits, whitespace/`-`/`:` separators tolerated. The canonical form.
    Hex,
    /// Standard base64.
    Base64,
}

/// A leading bit-substring of an identifier, used as a subscription key.
///
/// Canonical form: the first `bit_len` bits of `bytes` are significant and
/// every later bit is zero. Construction enforces this, so equality and
/// hashing over the raw fields are sound.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Prefix {
    bytes: [u8; 32],
    bit_len: u16,
}

impl Prefix {
    /// Build a prefix from leading bytes and an explicit bit length.
    /// Bits past `bit_len` are masked to zero.
    pub fn new(bytes: &[u8], bit_len: u16) -> Result<Self, PrefixError> {
        if bit_len < MIN_PREFIX_BITS {
            return Err(PrefixError::TooShort { bits: bit_len });
        }
        if bit_len > ID_BITS {
            return Err(PrefixError::TooLong { bits: bit_len });
        }
        if bytes.len() > ID_BYTES || (bytes.len() as u16) * 8 < bit_len {
            return Err(PrefixError::Malformed);
        }
        let mut arr = [0u8; 32];
        arr[..bytes.len()].copy_from_slice(bytes);
        mask_tail(&mut arr, bit_len);
        Ok(Self { bytes: arr, bit_len })
    }

    /// The leading `bit_len` bits of an identifier.
    pub(crate) fn from_id_bits(id: &EventId, bit_len: u16) -> Self {
        debug_assert!((MIN_PREFIX_BITS..=ID_BITS).contains(&bit_len));
        let mut bytes = *id.as_bytes();
        mask_tail(&mut bytes, bit_len);
        Self { bytes, bit_len }
    }

    /// Decode a wire prefix in the given input format.
    ///
    /// Whole bytes only: the effective bit length is `decoded_len * 8`.
    /// The minimum-length check runs after decoding, so a short input cannot
    /// be laundered through any encoding.
    pub fn parse(input: &str, format: PrefixFormat) -> Result<Self, PrefixError> {
        let bytes = match format {
            PrefixFormat::Utf8 => input.as_bytes().to_vec(),
            PrefixFormat::Hex => {
                let clean: String = input
                    .chars()
                    .filter(|c| !matches!(c, ' ' | '-' | ':'))
                    .collect();
                hex::decode(&clean).map_err(|_| PrefixError::Malformed)?
            }
            PrefixFormat::Base64 => {
                use base64::Engine as _;
                base64::engine::general_purpose::STANDARD
                    .decode(input)
                    .map_err(|_| PrefixError::Malformed)?
            }
        };
        if bytes.len() > ID_BYTES {
            return Err(PrefixError::TooLong {
                bits: (bytes.len() as u16).saturating_mul(8),
            });
        }
        Self::new(&bytes, (bytes.len() as u16) * 8)
    }

    #[inline]
    pub fn bit_len(&self) -> u16 {
        self.bit_len
    }

    /// Value of bit `i` of the prefix. Caller guarantees `i < bit_len`.
    #[inline]
    pub(crate) fn bit(&self, i: u16) -> bool {
        debug_assert!(i < self.bit_len);
        let byte = self.bytes[(i / 8) as usize];
        byte & (0x80 >> (i % 8)) != 0
    }

    /// Does `id` begin with this prefix, bit for bit?
    pub fn matches(&self, id: &EventId) -> bool {
        let full_bytes = (self.bit_len / 8) as usize;
        let rem_bits = self.bit_len % 8;
        if self.bytes[..full_bytes] != id.as_bytes()[..full_bytes] {
            return false;
        }
        if rem_bits == 0 {
            return true;
        }
        let mask = 0xFFu8 << (8 - rem_bits);
        (self.bytes[full_bytes] ^ id.as_bytes()[full_bytes]) & mask == 0
    }

    /// Is `other` an ancestor of (or equal to) this prefix?
    pub fn starts_with(&self, other: &Prefix) -> bool {
        if other.bit_len > self.bit_len {
            return false;
        }
        let full_bytes = (other.bit_len / 8) as usize;
        let rem_bits = other.bit_len % 8;
        if self.bytes[..full_bytes] != other.bytes[..full_bytes] {
            return false;
        }
        if rem_bits == 0 {
            return true;
        }
        let mask = 0xFFu8 << (8 - rem_bits);
        (self.bytes[full_bytes] ^ other.bytes[full_bytes]) & mask == 0
    }

    /// The prefix as a full-width coordinate, zero-padded to 32 bytes.
    /// This is how prefixes enter the XOR distance metric.
    #[inline]
    pub fn as_padded_bytes(&self) -> &[u8; 32] {
        // Canonical form guarantees the tail is already zero.
        &self.bytes
    }

    /// Hex of the significant whole bytes (canonical wire form).
    pub fn to_hex(&self) -> String {
        let nbytes = self.bit_len.div_ceil(8) as usize;
        hex::encode(&self.bytes[..nbytes])
    }

    /// The significant bytes of this prefix (bit length rounded up).
    pub fn significant_bytes(&self) -> &[u8] {
        let nbytes = self.bit_len.div_ceil(8) as usize;
        &self.bytes[..nbytes]
    }

    /// Append a fresh random suffix to this prefix, producing a full
    /// identifier.
    ///
    /// The suffix comes from the OS CSPRNG; for the structured scheme this is
    /// the 128-bit per-message randomness that makes ids unguessable.
    pub fn generate_id(&self) -> EventId {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);

        let full_bytes = (self.bit_len / 8) as usize;
        let rem_bits = self.bit_len % 8;
        bytes[..full_bytes].copy_from_slice(&self.bytes[..full_bytes]);
        if rem_bits != 0 {
            let mask = 0xFFu8 << (8 - rem_bits);
            bytes[full_bytes] = (self.bytes[full_bytes] & mask) | (bytes[full_bytes] & !mask);
        }
        EventId::from_bytes(bytes)
    }
}

impl std::fmt::Debug for Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Prefix({}/{})", self.to_hex(), self.bit_len)
    }
}

impl std::fmt::Display for Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.to_hex(), self.bit_len)
    }
}

/// Zero every bit of `bytes` at or past position `bit_len`.
fn mask_tail(bytes: &mut [u8; 32], bit_len: u16) {
    let full_bytes = (bit_len / 8) as usize;
    let rem_bits = bit_len % 8;
    if rem_bits != 0 {
        bytes[full_bytes] &= 0xFFu8 << (8 - rem_bits);
        for b in bytes.iter_mut().skip(full_bytes + 1) {
            *b = 0;
        }
    } else {
        for b in bytes.iter_mut().skip(full_bytes) {
            *b = 0;
        }
    }
}

/// Composes topic prefixes for the structured addressing scheme.
///
/// Topic nonces are one-time random draws persisted by the identity
/// collaborator; the codec caches them so hot topics don't re-draw. A nonce
/// already persisted elsewhere can be installed with
/// [`IdentifierCodec::install_topic_nonce`].
pub struct IdentifierCodec {
    nonces: LruCache<(u64, u32), u32>,
}

impl IdentifierCodec {
    pub fn new() -> Self {
        Self {
            nonces: LruCache::new(
                NonZeroUsize::new(MAX_CACHED_TOPIC_NONCES).expect("cache capacity is non-zero"),
            ),
        }
    }

    /// Deterministic 32-bit topic hash, scoped to the organization.
    fn topic_hash(org_id: u64, topic_path: &str) -> u32 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(TOPIC_HASH_DOMAIN);
        hasher.update(&org_id.to_be_bytes());
        hasher.update(topic_path.as_bytes());
        let digest = hasher.finalize();
        u32::from_be_bytes(digest.as_bytes()[..4].try_into().expect("digest >= 4 bytes"))
    }

    /// Seed the nonce cache with a previously persisted (org, topic) nonce.
    pub fn install_topic_nonce(&mut self, org_id: u64, topic_path: &str, nonce: u32) {
        let th = Self::topic_hash(org_id, topic_path);
        self.nonces.put((org_id, th), nonce);
    }

    /// Compose the 128-bit shareable prefix for a topic within an org:
    /// `org_id(64) || topic_hash(32) || topic_nonce(32)`.
    ///
    /// The nonce is looked up in the cache or lazily drawn from the CSPRNG.
    pub fn compose_topic_prefix(&mut self, org_id: u64, topic_path: &str) -> Prefix {
        let th = Self::topic_hash(org_id, topic_path);
        let nonce = *self.nonces.get_or_insert_mut((org_id, th), || OsRng.next_u32());

        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&org_id.to_be_bytes());
        bytes[8..12].copy_from_slice(&th.to_be_bytes());
        bytes[12..16].copy_from_slice(&nonce.to_be_bytes());
        Prefix::new(&bytes, SHAREABLE_PREFIX_BITS)
            .expect("128-bit topic prefix is always within bounds")
    }
}

impl Default for IdentifierCodec {
    fn default() -> Self {
        Self::new()
    }
}
