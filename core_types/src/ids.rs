//! Unique identifiers for kernel entities
//!
//! Kernel-assigned ids are plain monotonic `u64` handles; they index
//! tables and are never dereferenced by modules. Host-assigned identity
//! (the agent or user an event originated from) is a UUID supplied at
//! ingress.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! handle_id {
    ($(#[$doc:meta])* $name:ident, $display:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Creates an id from its raw table handle.
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// Returns the raw table handle.
            pub const fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($display, "({})"), self.0)
            }
        }
    };
}

handle_id!(
    /// Identifier of a process. Assigned monotonically at spawn and never
    /// reused within a kernel lifetime.
    ProcessId, "Process"
);

handle_id!(
    /// Handle of a kernel-managed blob.
    BlobId, "Blob"
);

handle_id!(
    /// Handle of a dynamic channel.
    ChannelId, "Channel"
);

handle_id!(
    /// Handle of a pending one-shot timer.
    TimerId, "Timer"
);

handle_id!(
    /// Handle of an open timeline cursor.
    CursorId, "Cursor"
);

handle_id!(
    /// Correlation id for asynchronous host requests (fs, http).
    RequestId, "Request"
);

/// Alias of a module instance within its process pipeline.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModuleAlias(String);

impl ModuleAlias {
    /// Creates an alias. Aliases are free-form but non-empty.
    pub fn new(alias: impl Into<String>) -> Self {
        Self(alias.into())
    }

    /// Returns the alias string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host-assigned identity of the agent or user behind an event.
///
/// The kernel treats this as opaque metadata; it is stamped into event
/// headers at ingress and preserved through commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(Uuid);

impl AgentId {
    /// Creates a new random agent id (host side only).
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an agent id from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Creates an agent id from its 16 raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the 16 raw bytes.
    pub fn as_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    /// The all-zero identity used when no agent is attached.
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::nil()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Agent({})", self.0)
    }
}
