//! # Value
//!
//! The tagged-union value model and its wire codec.
//!
//! ## Model
//!
//! A value is a 32-byte envelope (tag, flags, 16-byte discriminated
//! payload) whose nested storage (string bytes, map pairs, list
//! entries, byte runs) lives in the same arena as the envelope and is
//! referenced by offset. The owned `Value` enum is the kernel-side
//! representation; `codec` converts between it and arena buffers.
//!
//! ## Validation
//!
//! Parsing rejects unknown tags, non-UTF-8 strings, nesting deeper than
//! `MAX_RECURSION`, and any inner offset that escapes the source arena.
//! Emission performs pointer relocation: every inner offset is written
//! relative to the destination memory space, so the recipient can
//! dereference without translation.

pub mod codec;

pub use codec::{emit_value, parse_value, relocate_payload};

use core_types::{BlobId, KernelError};
use thiserror::Error;

use abi::ValueTag;

/// Reference to a kernel blob carried inside a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobRefValue {
    pub id: BlobId,
    pub size: u64,
}

/// Owned tagged-union value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    String(String),
    BlobRef(BlobRefValue),
    /// Ordered key-value pairs; duplicate keys are preserved as written.
    Map(Vec<(String, Value)>),
    List(Vec<Value>),
    Bytes(Vec<u8>),
}

impl Value {
    /// Returns the wire tag of this value.
    pub fn tag(&self) -> ValueTag {
        match self {
            Value::Unit => ValueTag::Unit,
            Value::Bool(_) => ValueTag::Bool,
            Value::I64(_) => ValueTag::I64,
            Value::U64(_) => ValueTag::U64,
            Value::F64(_) => ValueTag::F64,
            Value::String(_) => ValueTag::String,
            Value::BlobRef(_) => ValueTag::BlobRef,
            Value::Map(_) => ValueTag::Map,
            Value::List(_) => ValueTag::List,
            Value::Bytes(_) => ValueTag::Bytes,
        }
    }

    /// Collects every blob handle referenced anywhere in this value.
    pub fn blob_refs(&self) -> Vec<BlobId> {
        let mut out = Vec::new();
        self.collect_blob_refs(&mut out);
        out
    }

    fn collect_blob_refs(&self, out: &mut Vec<BlobId>) {
        match self {
            Value::BlobRef(blob) => out.push(blob.id),
            Value::Map(pairs) => {
                for (_, v) in pairs {
                    v.collect_blob_refs(out);
                }
            }
            Value::List(items) => {
                for v in items {
                    v.collect_blob_refs(out);
                }
            }
            _ => {}
        }
    }

    /// Checks the root tag against a declared schema root type.
    pub fn expect_root(&self, expected: ValueTag) -> Result<(), KernelError> {
        if self.tag() != expected {
            return Err(KernelError::Type(format!(
                "root value tag {:?} does not match declared {:?}",
                self.tag(),
                expected
            )));
        }
        Ok(())
    }
}

/// Errors raised by the value codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("invalid tag {0}")]
    InvalidTag(u32),

    #[error("invalid bool payload {0}")]
    InvalidBool(u8),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("nesting depth exceeds {0}")]
    DepthExceeded(usize),

    #[error("inner pointer escapes arena: offset {offset} len {len} arena {arena}")]
    OutOfBounds { offset: u64, len: u64, arena: u64 },

    #[error("arena truncated at offset {0}")]
    Truncated(u64),
}

impl From<ValueError> for KernelError {
    fn from(err: ValueError) -> Self {
        KernelError::Invalid(err.to_string())
    }
}
