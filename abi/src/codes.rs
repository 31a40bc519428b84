//! Status codes, wake flags, value tags, and payload encodings
//!
//! Status codes live in `core_types::error` and are re-exported there;
//! this module holds the remaining wire-level discriminants.

use crate::AbiError;

/// Wake bit: first weave after `init`; `user_data` is zero.
pub const WAKE_INIT: u64 = 1 << 0;
/// Wake bit: a timer registered via `filament/time/set` fired.
pub const WAKE_TIMER: u64 = 1 << 1;
/// Wake bit: an asynchronous I/O reply (fs, http) arrived.
pub const WAKE_IO: u64 = 1 << 2;
/// Wake bit: a kv result arrived.
pub const WAKE_KV: u64 = 1 << 3;
/// Wake bit: a hardware notification arrived.
pub const WAKE_HW: u64 = 1 << 4;
/// Wake bit: a lifecycle command arrived.
pub const WAKE_LIFECYCLE: u64 = 1 << 5;

/// Tag of a serialized value envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ValueTag {
    Unit = 0,
    Bool = 1,
    I64 = 2,
    U64 = 3,
    F64 = 4,
    String = 5,
    BlobRef = 6,
    Map = 7,
    List = 8,
    Bytes = 9,
}

impl ValueTag {
    /// Decodes a raw tag; unknown tags are a hard error.
    pub fn from_u32(raw: u32) -> Result<Self, AbiError> {
        match raw {
            0 => Ok(ValueTag::Unit),
            1 => Ok(ValueTag::Bool),
            2 => Ok(ValueTag::I64),
            3 => Ok(ValueTag::U64),
            4 => Ok(ValueTag::F64),
            5 => Ok(ValueTag::String),
            6 => Ok(ValueTag::BlobRef),
            7 => Ok(ValueTag::Map),
            8 => Ok(ValueTag::List),
            9 => Ok(ValueTag::Bytes),
            other => Err(AbiError::UnknownDiscriminant { field: "value tag", value: other as u64 }),
        }
    }

    pub fn as_u32(&self) -> u32 {
        *self as u32
    }
}

/// Encoding of an event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Encoding {
    /// A serialized value envelope with relocated inner pointers.
    Value = 0,
    /// Uninterpreted bytes.
    Raw = 1,
}

impl Encoding {
    pub fn from_u16(raw: u16) -> Result<Self, AbiError> {
        match raw {
            0 => Ok(Encoding::Value),
            1 => Ok(Encoding::Raw),
            other => Err(AbiError::UnknownDiscriminant { field: "encoding", value: other as u64 }),
        }
    }

    pub fn as_u16(&self) -> u16 {
        *self as u16
    }
}
