//! Kernel error types and the stable ABI status codes
//!
//! Every fallible kernel operation surfaces a `KernelError`; the same
//! seven kinds cross the module boundary as negative i64 codes. The
//! mapping is closed and stable: new failure modes must fold into one of
//! the existing kinds.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Module asks to sleep until new input or a timer arrives.
pub const PARK: i64 = 0;
/// Module asks to be rescheduled immediately.
pub const YIELD: i64 = 1;
/// Outbound event on an ungranted capability, or mapping with excess permissions.
pub const ERR_PERM: i64 = -1;
/// Channel destroyed, blob missing, kv key absent, pruned cursor segment.
pub const ERR_NOT_FOUND: i64 = -2;
/// Channel full, or physical I/O failure during flush.
pub const ERR_IO: i64 = -3;
/// Quota exceeded, or DMA unavailable when required.
pub const ERR_OOM: i64 = -4;
/// Malformed value, bad URI, bad arguments.
pub const ERR_INVALID: i64 = -5;
/// Compute or time budget exceeded.
pub const ERR_TIMEOUT: i64 = -6;
/// Schema mismatch at a channel boundary or in a payload.
pub const ERR_TYPE: i64 = -7;

/// Errors surfaced by kernel operations.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum KernelError {
    /// Capability or permission check failed; the weave aborts.
    #[error("permission denied: {0}")]
    Permission(String),

    /// The referenced object does not exist (any more).
    #[error("not found: {0}")]
    NotFound(String),

    /// A channel is full or a flush failed.
    #[error("i/o failure: {0}")]
    Io(String),

    /// A memory quota was exceeded or a required pool is exhausted.
    #[error("out of memory: {0}")]
    Oom(String),

    /// Malformed value, URI, or argument block.
    #[error("invalid: {0}")]
    Invalid(String),

    /// A compute or time budget was exceeded; the weave is discarded.
    #[error("budget exceeded: {0}")]
    Timeout(String),

    /// Declared and observed schemas disagree.
    #[error("type mismatch: {0}")]
    Type(String),
}

impl KernelError {
    /// Returns the negative ABI code for this error kind.
    pub fn code(&self) -> i64 {
        match self {
            KernelError::Permission(_) => ERR_PERM,
            KernelError::NotFound(_) => ERR_NOT_FOUND,
            KernelError::Io(_) => ERR_IO,
            KernelError::Oom(_) => ERR_OOM,
            KernelError::Invalid(_) => ERR_INVALID,
            KernelError::Timeout(_) => ERR_TIMEOUT,
            KernelError::Type(_) => ERR_TYPE,
        }
    }

    /// Reconstructs an error from an ABI code. Non-error codes yield `None`.
    pub fn from_code(code: i64, detail: impl Into<String>) -> Option<Self> {
        let detail = detail.into();
        match code {
            ERR_PERM => Some(KernelError::Permission(detail)),
            ERR_NOT_FOUND => Some(KernelError::NotFound(detail)),
            ERR_IO => Some(KernelError::Io(detail)),
            ERR_OOM => Some(KernelError::Oom(detail)),
            ERR_INVALID => Some(KernelError::Invalid(detail)),
            ERR_TIMEOUT => Some(KernelError::Timeout(detail)),
            ERR_TYPE => Some(KernelError::Type(detail)),
            _ => None,
        }
    }
}

/// Outcome of a module's `weave` entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeaveVerdict {
    /// Commit and sleep until woken.
    Park,
    /// Commit and reschedule immediately.
    Yield,
    /// Abort the weave; all tentative state is discarded.
    Abort(KernelError),
}

impl WeaveVerdict {
    /// Interprets a raw i64 return from a module entry point.
    ///
    /// Unknown positive codes are treated as `Yield`; unknown negative
    /// codes fold into `Invalid`.
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            PARK => WeaveVerdict::Park,
            code if code > 0 => WeaveVerdict::Yield,
            code => WeaveVerdict::Abort(
                KernelError::from_code(code, "module abort")
                    .unwrap_or_else(|| KernelError::Invalid(format!("unknown module status {}", code))),
            ),
        }
    }

    /// Returns true for `Park` or `Yield`.
    pub fn is_commit(&self) -> bool {
        !matches!(self, WeaveVerdict::Abort(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(KernelError::Permission("x".into()).code(), -1);
        assert_eq!(KernelError::NotFound("x".into()).code(), -2);
        assert_eq!(KernelError::Io("x".into()).code(), -3);
        assert_eq!(KernelError::Oom("x".into()).code(), -4);
        assert_eq!(KernelError::Invalid("x".into()).code(), -5);
        assert_eq!(KernelError::Timeout("x".into()).code(), -6);
        assert_eq!(KernelError::Type("x".into()).code(), -7);
    }

    #[test]
    fn test_code_roundtrip() {
        for code in [-7i64, -6, -5, -4, -3, -2, -1] {
            let err = KernelError::from_code(code, "detail").unwrap();
            assert_eq!(err.code(), code);
        }
        assert!(KernelError::from_code(0, "park").is_none());
        assert!(KernelError::from_code(1, "yield").is_none());
    }

    #[test]
    fn test_verdict_from_raw() {
        assert_eq!(WeaveVerdict::from_raw(PARK), WeaveVerdict::Park);
        assert_eq!(WeaveVerdict::from_raw(YIELD), WeaveVerdict::Yield);
        assert_eq!(WeaveVerdict::from_raw(7), WeaveVerdict::Yield);
        assert!(matches!(
            WeaveVerdict::from_raw(ERR_OOM),
            WeaveVerdict::Abort(KernelError::Oom(_))
        ));
        assert!(matches!(
            WeaveVerdict::from_raw(-99),
            WeaveVerdict::Abort(KernelError::Invalid(_))
        ));
    }
}
