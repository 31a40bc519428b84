//! # Kernel
//!
//! The Filament runtime core: a deterministic, event-sourced
//! partitioning kernel hosting sandboxed computational modules.
//!
//! ## Philosophy
//!
//! - **Virtual time is the truth**: nothing here reads a wall clock;
//!   the host injects time and the kernel assigns logical ticks.
//! - **Everything is a transaction**: a weave either commits all of its
//!   effects (timeline appends, kv writes, channel publishes, blob
//!   retention, hardware flushes) or none of them.
//! - **Capabilities, not ambient authority**: every outbound event and
//!   every host function is checked against the grants a process was
//!   spawned with.
//! - **Testability first**: audit logs on the router, supervisor, and
//!   scheduler make every decision observable under `cargo test`.
//!
//! ## Non-Goals
//!
//! General-purpose file I/O, multi-tenant identity, device drivers, and
//! wall-clock synchronization stay outside; fs/http and hardware leave
//! through host bridges at commit time only.

pub mod blob;
pub mod bridge;
pub mod channel;
pub mod event;
pub mod kernel;
pub mod kv;
pub mod manifest;
pub mod module;
pub mod process;
pub mod router;
pub mod scheduler;
pub mod spawn;
pub mod staging;
pub mod supervisor;
pub mod telemetry;
pub mod timeline;
pub mod timer;
pub mod weave;

pub use blob::{BlobTable, DMA_OPTIONAL, DMA_REQUIRED, PERM_EXEC, PERM_READ, PERM_WRITE};
pub use bridge::{
    HardwareBridge, HostIoBridge, HwCommand, IoRequest, NullHardwareBridge, NullIoBridge,
    RecordingHardwareBridge, RecordingIoBridge,
};
pub use channel::{Channel, ChannelMessage, ChannelRegistry, CHANNEL_NAMESPACE};
pub use event::{schema_hash, CommittedEvent, EventMeta, EventRecord};
pub use kernel::{Kernel, KernelMetrics, TimelinePolicy, WeaveOutcome};
pub use kv::{KvStore, KvWriteBuffer};
pub use manifest::Manifest;
pub use process::{InboundEvent, Process, ProcessState, ReservedPool};
pub use router::{OutboundRoute, RouterAuditLog, RouterEvent};
pub use scheduler::{CycleEvent, Scheduler};
pub use spawn::{
    decode_spawn_args, encode_spawn_args, Binding, BindingRole, ChannelSpec, ModuleSpec,
    SpawnCapabilities, SpawnRequest,
};
pub use staging::{StagedOrigin, StagingArea};
pub use supervisor::{SupervisorAuditLog, SupervisorEvent};
pub use telemetry::{LogLevel, LogRecord, TelemetrySink, TestSink, TracingSink};
pub use timeline::{
    CursorBounds, CursorSpec, CursorTable, MutableLog, Prunable, RetentionPolicy, Strict, Timeline,
};
pub use timer::{FiredTimer, TimerWheel};
pub use weave::{WeaveHost, WeaveJournal};
