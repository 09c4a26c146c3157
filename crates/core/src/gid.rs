//! Sharded 64-bit global identifiers.
//!
//! ```text
//! | 8 bits: group | 8 bits: object type | 16 bits: shard | 32 bits: local row id |
//! ```
//!
//! The high 32 bits route a row to its shard; the low 32 bits come from the
//! shard's own sequence. Group 0 holds the registry, group 1 holds data.
//! Externally an id is written as `:` followed by lowercase hex.

use std::fmt::{Debug, Display, Formatter};
use std::ops::RangeInclusive;
use std::str::FromStr;

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::CoreError;

pub const GROUP_REGISTRY: u8 = 0;
pub const GROUP_DATA: u8 = 1;

const GROUP_SHIFT: u32 = 56;
const TYPE_SHIFT: u32 = 48;
const SHARD_SHIFT: u32 = 32;
const BYTE_MASK: u64 = 0xFF;
const SHARD_MASK: u64 = 0xFFFF;
const LOCAL_MASK: u64 = 0xFFFF_FFFF;

/// Closed set of object types that can own a global id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ObjectType {
    User = 1,
    Org = 2,
    Store = 3,
    Key = 4,
    Invitation = 5,
    Entry = 6,
}

impl ObjectType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Org => "org",
            Self::Store => "store",
            Self::Key => "key",
            Self::Invitation => "invitation",
            Self::Entry => "entry",
        }
    }
}

impl TryFrom<u8> for ObjectType {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::User),
            2 => Ok(Self::Org),
            3 => Ok(Self::Store),
            4 => Ok(Self::Key),
            5 => Ok(Self::Invitation),
            6 => Ok(Self::Entry),
            _ => Err(CoreError::UnknownObjectType(value)),
        }
    }
}

impl Display for ObjectType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Gid(u64);

impl Gid {
    /// The zero id. Never allocated by a shard sequence; used as the root entry.
    pub const NIL: Gid = Gid(0);

    #[must_use]
    pub const fn pack(group: u8, object_type: ObjectType, shard: u16, local: u32) -> Self {
        Self::from_fields(group, object_type as u8, shard, local)
    }

    #[must_use]
    pub const fn from_fields(group: u8, type_tag: u8, shard: u16, local: u32) -> Self {
        Self(
            ((group as u64) << GROUP_SHIFT)
                | ((type_tag as u64) << TYPE_SHIFT)
                | ((shard as u64) << SHARD_SHIFT)
                | local as u64,
        )
    }

    /// Raw field split; total over every `u64`.
    #[must_use]
    pub const fn fields(self) -> (u8, u8, u16, u32) {
        (
            ((self.0 >> GROUP_SHIFT) & BYTE_MASK) as u8,
            ((self.0 >> TYPE_SHIFT) & BYTE_MASK) as u8,
            ((self.0 >> SHARD_SHIFT) & SHARD_MASK) as u16,
            (self.0 & LOCAL_MASK) as u32,
        )
    }

    pub fn unpack(self) -> Result<(u8, ObjectType, u16, u32), CoreError> {
        let (group, tag, shard, local) = self.fields();
        Ok((group, ObjectType::try_from(tag)?, shard, local))
    }

    #[must_use]
    pub const fn group(self) -> u8 {
        self.fields().0
    }

    pub fn object_type(self) -> Result<ObjectType, CoreError> {
        ObjectType::try_from(self.fields().1)
    }

    #[must_use]
    pub fn is_type(self, expected: ObjectType) -> bool {
        self.fields().1 == expected as u8
    }

    #[must_use]
    pub const fn shard(self) -> u16 {
        self.fields().2
    }

    #[must_use]
    pub const fn local(self) -> u32 {
        self.fields().3
    }

    #[must_use]
    pub const fn is_nil(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Bit-identical reinterpretation for `BIGINT` columns.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0 as i64
    }

    #[must_use]
    pub const fn from_i64(value: i64) -> Self {
        Self(value as u64)
    }
}

impl Display for Gid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, ":{:x}", self.0)
    }
}

impl Debug for Gid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let (group, tag, shard, local) = self.fields();
        write!(f, "Gid({self} g{group} t{tag} s{shard} #{local})")
    }
}

impl FromStr for Gid {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(hex) = s.strip_prefix(':') {
            if hex.is_empty()
                || hex.len() > 16
                || !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
            {
                return Err(CoreError::InvalidIdentifier);
            }
            return u64::from_str_radix(hex, 16)
                .map(Self)
                .map_err(|_| CoreError::InvalidIdentifier);
        }
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            return s.parse::<u64>().map(Self).map_err(|_| CoreError::InvalidIdentifier);
        }
        Err(CoreError::InvalidIdentifier)
    }
}

impl Serialize for Gid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Gid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Inclusive range of data shards new rows may be placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRange {
    pub first: u16,
    pub last: u16,
}

impl ShardRange {
    pub fn new(first: u16, last: u16) -> Result<Self, CoreError> {
        if first > last {
            return Err(CoreError::InvalidShardRange { first, last });
        }
        Ok(Self { first, last })
    }

    #[must_use]
    pub fn single(shard: u16) -> Self {
        Self {
            first: shard,
            last: shard,
        }
    }

    #[must_use]
    pub fn contains(&self, shard: u16) -> bool {
        (self.first..=self.last).contains(&shard)
    }

    #[must_use]
    pub fn as_range(&self) -> RangeInclusive<u16> {
        self.first..=self.last
    }

    #[must_use]
    pub fn random_shard(&self) -> u16 {
        random_shard(self.as_range())
    }
}

/// Uniformly-ish picks a shard from `range` using the OS RNG.
#[must_use]
pub fn random_shard(range: RangeInclusive<u16>) -> u16 {
    let (first, last) = (*range.start(), *range.end());
    if first >= last {
        return first;
    }
    let span = u32::from(last - first) + 1;
    let offset = OsRng.next_u32() % span;
    // offset < span <= u16::MAX + 1, so it fits after adding to first
    first + offset as u16
}

/// A route parameter naming an object either by id or by alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectRef {
    Id(Gid),
    Alias(String),
}

impl ObjectRef {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CoreError::InvalidIdentifier);
        }
        if raw.starts_with(':') || raw.bytes().all(|b| b.is_ascii_digit()) {
            return raw.parse().map(Self::Id);
        }
        Ok(Self::Alias(raw.to_owned()))
    }
}
