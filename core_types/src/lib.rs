//! # Core Types
//!
//! Shared vocabulary for the Filament kernel.
//!
//! ## Philosophy
//!
//! - **Handles, not pointers**: every kernel object is addressed by an
//!   opaque 64-bit id in a table; nothing hands out raw references across
//!   the process boundary.
//! - **Virtual time is the truth**: the kernel never consults a wall
//!   clock. `VirtualTime` is injected by the host; `Tick` is the logical
//!   step index assigned at commit.
//! - **Explicit budgets**: resources are finite, accounted, and enforced.
//!
//! ## Non-Goals
//!
//! This crate carries no behavior beyond validation and arithmetic. The
//! weave machinery lives in `kernel`.

pub mod context;
pub mod error;
pub mod ids;
pub mod limits;
pub mod resource;
pub mod time;
pub mod trace;
pub mod uri;

pub use context::{ExecutionContext, PoolingMode, SchedulingPolicy};
pub use error::{KernelError, WeaveVerdict, ERR_INVALID, ERR_IO, ERR_NOT_FOUND, ERR_OOM, ERR_PERM, ERR_TIMEOUT, ERR_TYPE, PARK, YIELD};
pub use ids::{AgentId, BlobId, ChannelId, CursorId, ModuleAlias, ProcessId, RequestId, TimerId};
pub use limits::{MAGIC, MAX_RECURSION, MAX_URI_LEN, MIN_BLOB_BYTES, MIN_BUS_BYTES};
pub use resource::{ComputeUnits, MemoryBytes, ResourceLimits, ResourceUsage};
pub use time::{Tick, TimeDelta, VirtualTime};
pub use trace::TraceContext;
pub use uri::{validate_uri, Topic};
