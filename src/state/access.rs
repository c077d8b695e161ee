//! Access-mode bitfield algebra.
//!
//! An `AccessMode` is the 8-bit permission set applied per (user, topic)
//! pair. The textual form is the subset of `JRWPASDO` letters whose bits are
//! set, `N` for the explicit empty mode. A separate `UNSET` sentinel outside
//! the 8-bit range distinguishes "not provided" from "explicitly none".

use crate::error::StoreError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// Canonical letter order of the mode bits.
const MODE_LETTERS: [char; 8] = ['J', 'R', 'W', 'P', 'A', 'S', 'D', 'O'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessMode(u16);

impl AccessMode {
    /// No access. Serializes as `N`.
    pub const NONE: AccessMode = AccessMode(0);
    /// Join: subscribe to the topic.
    pub const JOIN: AccessMode = AccessMode(0x01);
    /// Read: receive `{data}` and `{info}` broadcasts.
    pub const READ: AccessMode = AccessMode(0x02);
    /// Write: publish.
    pub const WRITE: AccessMode = AccessMode(0x04);
    /// Pres: receive presence updates.
    pub const PRES: AccessMode = AccessMode(0x08);
    /// Approve: admit or evict members.
    pub const APPROVE: AccessMode = AccessMode(0x10);
    /// Share: invite new members.
    pub const SHARE: AccessMode = AccessMode(0x20);
    /// Delete: hard-delete messages.
    pub const DELETE: AccessMode = AccessMode(0x40);
    /// Owner: full control.
    pub const OWNER: AccessMode = AccessMode(0x80);
    /// "Not provided" sentinel, deliberately outside the 8-bit range.
    pub const UNSET: AccessMode = AccessMode(0x100);

    /// Default subscriber mode for a public group topic.
    pub const C_PUBLIC: AccessMode =
        AccessMode(Self::JOIN.0 | Self::READ.0 | Self::WRITE.0 | Self::PRES.0 | Self::SHARE.0);
    /// Default mode for a p2p topic.
    pub const C_P2P: AccessMode =
        AccessMode(Self::JOIN.0 | Self::READ.0 | Self::WRITE.0 | Self::PRES.0 | Self::APPROVE.0);
    /// Read-only access.
    pub const C_READONLY: AccessMode = AccessMode(Self::JOIN.0 | Self::READ.0);
    /// Owner's mode on a group topic.
    pub const C_FULL: AccessMode = AccessMode(Self::C_PUBLIC.0 | Self::APPROVE.0 | Self::DELETE.0 | Self::OWNER.0);
    /// Users who can change access modes.
    pub const C_ADMIN: AccessMode = AccessMode(Self::OWNER.0 | Self::APPROVE.0);
    /// Users notified of access-mode changes.
    pub const C_SHARER: AccessMode = AccessMode(Self::C_ADMIN.0 | Self::SHARE.0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_unset(&self) -> bool {
        *self == Self::UNSET
    }

    pub fn is_defined(&self) -> bool {
        !self.is_unset()
    }

    pub fn is_joiner(&self) -> bool {
        self.0 & Self::JOIN.0 != 0
    }

    pub fn is_reader(&self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub fn is_writer(&self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    pub fn is_presencer(&self) -> bool {
        self.0 & Self::PRES.0 != 0
    }

    pub fn is_approver(&self) -> bool {
        self.0 & Self::APPROVE.0 != 0
    }

    pub fn is_owner(&self) -> bool {
        self.0 & Self::OWNER.0 != 0
    }

    pub fn is_admin(&self) -> bool {
        self.is_owner() || self.is_approver()
    }

    pub fn is_sharer(&self) -> bool {
        self.is_admin() || self.0 & Self::SHARE.0 != 0
    }

    pub fn is_deleter(&self) -> bool {
        self.0 & Self::DELETE.0 != 0
    }

    /// True when this grant allows everything `want` asks for.
    pub fn better_equal(&self, want: AccessMode) -> bool {
        self.0 & want.0 == want.0
    }

    /// Parse a mode string. Any case and order is accepted; `N` clears all
    /// bits. An empty or all-invalid string yields `UNSET` ("no change").
    pub fn parse(s: &str) -> Result<AccessMode, StoreError> {
        let mut m = Self::UNSET;
        for c in s.chars() {
            match c.to_ascii_uppercase() {
                'J' => m |= Self::JOIN,
                'R' => m |= Self::READ,
                'W' => m |= Self::WRITE,
                'P' => m |= Self::PRES,
                'A' => m |= Self::APPROVE,
                'S' => m |= Self::SHARE,
                'D' => m |= Self::DELETE,
                'O' => m |= Self::OWNER,
                'N' => m = Self::NONE,
                _ => return Err(StoreError::Malformed),
            }
        }
        if m != Self::UNSET {
            // Strip the sentinel picked up before the first letter.
            m.0 &= 0xff;
        }
        Ok(m)
    }

    /// Textual delta from `self` to `new`: `+<added>-<removed>`, added bits
    /// first, empty when the modes are equal.
    pub fn delta(&self, new: AccessMode) -> String {
        let added = AccessMode(new.0 & !self.0 & 0xff);
        let removed = AccessMode(self.0 & !new.0 & 0xff);
        let mut out = String::new();
        if !added.is_zero() {
            out.push('+');
            out.push_str(&added.letters());
        }
        if !removed.is_zero() {
            out.push('-');
            out.push_str(&removed.letters());
        }
        out
    }

    /// Apply a `+XYZ-ABC` delta produced by [`AccessMode::delta`].
    pub fn apply_delta(&self, delta: &str) -> Result<AccessMode, StoreError> {
        let mut m = *self;
        let mut grant = true;
        for c in delta.chars() {
            match c {
                '+' => grant = true,
                '-' => grant = false,
                _ => {
                    let bit = AccessMode::parse(&c.to_string())?;
                    if bit.is_unset() {
                        return Err(StoreError::Malformed);
                    }
                    if grant {
                        m |= bit;
                    } else {
                        m.0 &= !bit.0;
                    }
                }
            }
        }
        Ok(m)
    }

    fn letters(&self) -> String {
        let mut out = String::new();
        for (i, letter) in MODE_LETTERS.iter().enumerate() {
            if self.0 & (1 << i) != 0 {
                out.push(*letter);
            }
        }
        out
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unset() {
            return Ok(());
        }
        if self.is_zero() {
            return f.write_str("N");
        }
        f.write_str(&self.letters())
    }
}

impl BitOr for AccessMode {
    type Output = AccessMode;
    fn bitor(self, rhs: AccessMode) -> AccessMode {
        AccessMode(self.0 | rhs.0)
    }
}

impl BitOrAssign for AccessMode {
    fn bitor_assign(&mut self, rhs: AccessMode) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for AccessMode {
    type Output = AccessMode;
    fn bitand(self, rhs: AccessMode) -> AccessMode {
        AccessMode(self.0 & rhs.0)
    }
}

impl BitAndAssign for AccessMode {
    fn bitand_assign(&mut self, rhs: AccessMode) {
        self.0 &= rhs.0;
    }
}

impl Not for AccessMode {
    type Output = AccessMode;
    fn not(self) -> AccessMode {
        AccessMode(!self.0 & 0x1ff)
    }
}

impl Serialize for AccessMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AccessMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        AccessMode::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Per-topic default access, split by auth level of the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultAccess {
    pub auth: AccessMode,
    pub anon: AccessMode,
}

impl Default for DefaultAccess {
    fn default() -> Self {
        DefaultAccess {
            auth: AccessMode::NONE,
            anon: AccessMode::NONE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trip() {
        for s in ["N", "JR", "JRWPA", "JRWPASDO", "O"] {
            let m = AccessMode::parse(s).unwrap();
            assert_eq!(m.to_string(), s);
            assert_eq!(AccessMode::parse(&m.to_string()).unwrap(), m);
        }
    }

    #[test]
    fn parse_any_case_and_order() {
        assert_eq!(
            AccessMode::parse("wrj").unwrap(),
            AccessMode::JOIN | AccessMode::READ | AccessMode::WRITE
        );
        assert_eq!(AccessMode::parse("n").unwrap(), AccessMode::NONE);
        // N clears bits collected before it.
        assert_eq!(AccessMode::parse("JRN").unwrap(), AccessMode::NONE);
    }

    #[test]
    fn empty_string_is_unset() {
        assert!(AccessMode::parse("").unwrap().is_unset());
    }

    #[test]
    fn invalid_letter_is_rejected() {
        assert!(AccessMode::parse("JRX").is_err());
    }

    #[test]
    fn better_equal() {
        let grant = AccessMode::C_P2P;
        assert!(grant.better_equal(AccessMode::C_READONLY));
        assert!(grant.better_equal(grant));
        assert!(!AccessMode::C_READONLY.better_equal(grant));
        assert!(grant.better_equal(AccessMode::NONE));
    }

    #[test]
    fn delta_examples() {
        let jrws = AccessMode::parse("JRWS").unwrap();
        let jrw = AccessMode::parse("JRW").unwrap();
        let jrwp = AccessMode::parse("JRWP").unwrap();
        assert_eq!(jrws.delta(jrw), "-S");
        assert_eq!(jrws.delta(jrwp), "+P-S");
        assert_eq!(jrws.delta(jrws), "");
    }

    #[test]
    fn delta_round_trips() {
        let modes: Vec<AccessMode> = (0u16..=0xff).map(AccessMode).collect();
        for &m1 in &modes {
            for &m2 in &modes {
                let d = m1.delta(m2);
                assert_eq!(m1.apply_delta(&d).unwrap(), m2, "{m1} -> {m2} via {d:?}");
            }
        }
    }

    #[test]
    fn predefined_combinations() {
        assert_eq!(AccessMode::C_P2P.to_string(), "JRWPA");
        assert_eq!(AccessMode::C_SHARER.to_string(), "ASO");
        assert_eq!(AccessMode::C_FULL.to_string(), "JRWPASDO");
    }
}
