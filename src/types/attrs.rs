//! Attribute tags, tagged values, and the sparse-table key.
//!
//! The full tag space is partitioned by group parity: even groups are dense
//! (standard) attributes stored as one structured map per instance, odd
//! groups are sparse (private/vendor) attributes stored one row per tag.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A group/element attribute tag, rendered as `"GGGG,EEEE"` in hex so dense
/// maps stay readable when exported as JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag {
    pub group: u16,
    pub element: u16,
}

impl Tag {
    #[must_use]
    pub const fn new(group: u16, element: u16) -> Self {
        Self { group, element }
    }

    /// Even groups belong to the dense per-instance map.
    #[must_use]
    pub const fn is_core(self) -> bool {
        self.group % 2 == 0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x},{:04x}", self.group, self.element)
    }
}

#[derive(Debug, Error)]
#[error("invalid tag literal {0:?}; expected \"GGGG,EEEE\"")]
pub struct ParseTagError(String);

impl FromStr for Tag {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (group, element) = s.split_once(',').ok_or_else(|| ParseTagError(s.into()))?;
        let group = u16::from_str_radix(group.trim(), 16).map_err(|_| ParseTagError(s.into()))?;
        let element =
            u16::from_str_radix(element.trim(), 16).map_err(|_| ParseTagError(s.into()))?;
        Ok(Self { group, element })
    }
}

impl Serialize for Tag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct TagVisitor;

impl Visitor<'_> for TagVisitor {
    type Value = Tag;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a tag literal of the form \"GGGG,EEEE\"")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Tag, E> {
        value.parse().map_err(de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for Tag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(TagVisitor)
    }
}

/// A tagged attribute value. Raw bytes round-trip exactly; there is no text
/// coercion anywhere in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Date(NaiveDate),
    Bytes(Vec<u8>),
}

impl AttrValue {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<Vec<u8>> for AttrValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// Composite key of the sparse table. Ordering groups one instance's rows
/// into a contiguous range.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeKey {
    pub instance_uid: String,
    pub group: u16,
    pub element: u16,
}

impl AttributeKey {
    #[must_use]
    pub fn new(instance_uid: impl Into<String>, tag: Tag) -> Self {
        Self {
            instance_uid: instance_uid.into(),
            group: tag.group,
            element: tag.element,
        }
    }

    #[must_use]
    pub fn tag(&self) -> Tag {
        Tag::new(self.group, self.element)
    }

    /// Lowest key of an instance's sparse range.
    #[must_use]
    pub fn range_start(instance_uid: &str) -> Self {
        Self {
            instance_uid: instance_uid.to_string(),
            group: 0,
            element: 0,
        }
    }

    /// Highest key of an instance's sparse range.
    #[must_use]
    pub fn range_end(instance_uid: &str) -> Self {
        Self {
            instance_uid: instance_uid.to_string(),
            group: u16::MAX,
            element: u16::MAX,
        }
    }
}
