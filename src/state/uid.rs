//! Opaque user and topic identifiers.
//!
//! A `Uid` is an unsigned 64-bit record id. Its textual form is 11 characters
//! of unpadded URL-safe base64 over the 8 little-endian bytes. Prefixed forms
//! name topics: `usr<11>` for users, `grp<11>` for group topics, `fnd<11>`
//! for search, and `p2p<22>` for the derived two-party topic whose 16 bytes
//! are the two user ids concatenated smaller-first.

use crate::error::StoreError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Length of the unpadded base64 form of a single id.
const UID_TEXT_LEN: usize = 11;
/// Length of the unpadded base64 form of a p2p id pair.
const P2P_TEXT_LEN: usize = 22;

/// Database-level record id. Zero is the "unset" sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(u64);

impl Uid {
    /// Uninitialized id.
    pub const ZERO: Uid = Uid(0);

    pub fn new(v: u64) -> Self {
        Uid(v)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Little-endian byte form, the basis of every textual encoding.
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn from_bytes(b: [u8; 8]) -> Self {
        Uid(u64::from_le_bytes(b))
    }

    /// Parse the bare 11-character form. Rejects any string whose decoded
    /// length is not exactly 8 bytes.
    pub fn parse(s: &str) -> Result<Uid, StoreError> {
        if s.len() != UID_TEXT_LEN {
            return Err(StoreError::Malformed);
        }
        let dec = URL_SAFE_NO_PAD
            .decode(s.as_bytes())
            .map_err(|_| StoreError::Malformed)?;
        let bytes: [u8; 8] = dec.as_slice().try_into().map_err(|_| StoreError::Malformed)?;
        Ok(Uid::from_bytes(bytes))
    }

    /// Parse a `usr`-prefixed user id. Returns `None` when the prefix or the
    /// payload is invalid.
    pub fn parse_user_id(s: &str) -> Option<Uid> {
        let bare = s.strip_prefix("usr")?;
        Uid::parse(bare).ok()
    }

    /// `usr<11>` form, empty for the zero sentinel.
    pub fn user_id(&self) -> String {
        self.prefix_id("usr")
    }

    /// `fnd<11>` search-topic name for this user.
    pub fn fnd_name(&self) -> String {
        self.prefix_id("fnd")
    }

    fn prefix_id(&self, prefix: &str) -> String {
        if self.is_zero() {
            return String::new();
        }
        format!("{}{}", prefix, self)
    }

    /// Derive the p2p topic name for this user and `other`. The smaller id by
    /// numeric comparison goes first, so the derivation is commutative.
    /// Self-p2p is forbidden and yields `None`, as does either id being zero.
    pub fn p2p_name(self, other: Uid) -> Option<String> {
        if self.is_zero() || other.is_zero() || self == other {
            return None;
        }
        let (lo, hi) = if self.0 < other.0 { (self, other) } else { (other, self) };
        let mut joined = [0u8; 16];
        joined[..8].copy_from_slice(&lo.to_bytes());
        joined[8..].copy_from_slice(&hi.to_bytes());
        Some(format!("p2p{}", URL_SAFE_NO_PAD.encode(joined)))
    }
}

impl fmt::Display for Uid {
    /// Bare 11-character form. The zero sentinel prints as the empty string.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return Ok(());
        }
        f.write_str(&URL_SAFE_NO_PAD.encode(self.to_bytes()))
    }
}

impl Serialize for Uid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Uid::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Extract the unordered id pair from a `p2p<22>` topic name.
pub fn parse_p2p(name: &str) -> Result<(Uid, Uid), StoreError> {
    let bare = name.strip_prefix("p2p").ok_or(StoreError::Malformed)?;
    if bare.len() != P2P_TEXT_LEN {
        return Err(StoreError::Malformed);
    }
    let dec = URL_SAFE_NO_PAD
        .decode(bare.as_bytes())
        .map_err(|_| StoreError::Malformed)?;
    if dec.len() != 16 {
        return Err(StoreError::Malformed);
    }
    let mut a = [0u8; 8];
    let mut b = [0u8; 8];
    a.copy_from_slice(&dec[..8]);
    b.copy_from_slice(&dec[8..]);
    Ok((Uid::from_bytes(a), Uid::from_bytes(b)))
}

/// Generates unique record ids.
///
/// Ids are time-seeded and strictly increasing within a process. The seed
/// leaves room for 2^20 allocations per millisecond before colliding with a
/// later restart's range.
pub struct UidGenerator {
    counter: std::sync::atomic::AtomicU64,
}

impl UidGenerator {
    pub fn new() -> UidGenerator {
        let seed = (chrono::Utc::now().timestamp_millis() as u64) << 20;
        UidGenerator {
            counter: std::sync::atomic::AtomicU64::new(seed | 1),
        }
    }

    /// Generate the next unique id.
    pub fn next(&self) -> Uid {
        Uid::new(self.counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }
}

impl Default for UidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Topic category, determined by the 3-character name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicCat {
    /// The user's own `usr` topic.
    Me,
    /// Search topic.
    Fnd,
    /// Two-party conversation.
    P2P,
    /// Group topic.
    Grp,
}

impl TopicCat {
    /// Category from a topic name. Unknown prefixes are a malformed-input
    /// error rather than a panic: topic names arrive from clients.
    pub fn from_name(name: &str) -> Result<TopicCat, StoreError> {
        match name.get(..3) {
            Some("usr") => Ok(TopicCat::Me),
            Some("fnd") => Ok(TopicCat::Fnd),
            Some("p2p") => Ok(TopicCat::P2P),
            Some("grp") => Ok(TopicCat::Grp),
            _ => Err(StoreError::Malformed),
        }
    }
}
