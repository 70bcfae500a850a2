//! Data Types Module
//!
//! Typed values layered over the sorted map through derived storage keys.
//!
//! ## Responsibilities
//! - Storage key encoding shared by every type (`key`)
//! - Lists: header record plus an external chain of segments (`list`)
//! - Strings: plain records with lazy expiry (`strings`)
//! - Composite handler registry used by snapshot, delete and dispose
//!
//! A composite record holds a small header as its value and marks itself
//! with the custom-type flag; the structure it points at lives outside the
//! blocks and is reached through `CustomType`.

pub mod key;
pub mod list;
pub mod strings;
pub mod varint;

use crate::block::BlockContext;
use crate::error::Result;

/// Types whose values own external structures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomType {
    List,
}

impl CustomType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            key::TYPE_LIST => Some(CustomType::List),
            _ => None,
        }
    }

    /// Handler for a storage key, resolved from its type tag
    pub fn from_key(storage_key: &[u8]) -> Option<Self> {
        key::type_tag(storage_key).and_then(Self::from_tag)
    }

    pub fn tag(self) -> u8 {
        match self {
            CustomType::List => key::TYPE_LIST,
        }
    }

    /// Flatten the structure behind `value` into a snapshot payload
    pub fn serialize(self, ctx: &BlockContext, value: &[u8]) -> Result<Vec<u8>> {
        match self {
            CustomType::List => list::serialize(ctx, value),
        }
    }

    /// Rebuild the structure from a snapshot payload, returning the new header value
    pub fn deserialize(self, ctx: &BlockContext, payload: &[u8]) -> Result<Vec<u8>> {
        match self {
            CustomType::List => list::deserialize(ctx, payload),
        }
    }

    /// Free the structure behind `value`
    pub fn release(self, ctx: &BlockContext, value: &[u8]) -> Result<()> {
        match self {
            CustomType::List => list::release(ctx, value),
        }
    }
}
