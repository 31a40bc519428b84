//! Distributed trace context
//!
//! W3C-shaped trace propagation metadata carried in every event header:
//! a 16-byte trace id, an 8-byte parent span id, and flags. The kernel
//! forwards it verbatim; only the host assigns new ids.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 32-byte trace record embedded in event headers and weave arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TraceContext {
    /// Trace id; all-zero means "not sampled, not traced".
    pub trace_id: [u8; 16],
    /// Parent span id.
    pub span_id: [u8; 8],
    /// W3C trace flags (bit 0: sampled).
    pub flags: u32,
}

impl TraceContext {
    /// The empty, untraced context.
    pub const fn none() -> Self {
        Self { trace_id: [0; 16], span_id: [0; 8], flags: 0 }
    }

    /// Creates a fresh sampled root context (host side only).
    pub fn new_root() -> Self {
        let trace = Uuid::new_v4();
        let span = Uuid::new_v4();
        let mut span_id = [0u8; 8];
        span_id.copy_from_slice(&span.as_bytes()[..8]);
        Self { trace_id: *trace.as_bytes(), span_id, flags: 1 }
    }

    /// Returns true when no trace is attached.
    pub fn is_none(&self) -> bool {
        self.trace_id == [0; 16]
    }

    /// Returns true when the sampled flag is set.
    pub fn is_sampled(&self) -> bool {
        self.flags & 1 != 0
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return write!(f, "trace:none");
        }
        for byte in &self.trace_id {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "/")?;
        for byte in &self.span_id {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
