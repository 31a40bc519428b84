//! Host bridges
//!
//! Asynchronous I/O (fs, http) and hardware side-effects leave the
//! deterministic core through these seams. Requests are buffered by the
//! weave transaction and handed over only at commit; a discarded weave
//! performs no physical actuation.

use std::sync::{Arc, Mutex};

use core_types::{ProcessId, RequestId};

/// An asynchronous host request dispatched at commit.
#[derive(Debug, Clone, PartialEq)]
pub struct IoRequest {
    pub pid: ProcessId,
    pub topic: String,
    /// Correlates the eventual reply injected in a future weave.
    pub req_id: RequestId,
    pub payload: Vec<u8>,
}

/// A hardware command flushed at commit.
#[derive(Debug, Clone, PartialEq)]
pub struct HwCommand {
    pub pid: ProcessId,
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Dispatches committed I/O requests onto host threads.
pub trait HostIoBridge: Send {
    fn dispatch(&mut self, request: IoRequest);

    /// Cancels outstanding requests of a terminating process; any
    /// pending reply is dropped.
    fn cancel(&mut self, pid: ProcessId);
}

/// Receives committed hardware commands.
pub trait HardwareBridge: Send {
    fn flush(&mut self, command: HwCommand);
}

/// Bridge that drops everything (hosts without fs/http support).
#[derive(Debug, Default)]
pub struct NullIoBridge;

impl HostIoBridge for NullIoBridge {
    fn dispatch(&mut self, _request: IoRequest) {}
    fn cancel(&mut self, _pid: ProcessId) {}
}

/// Recording bridge for tests; the log handle outlives the kernel.
#[derive(Debug, Default)]
pub struct RecordingIoBridge {
    log: Arc<Mutex<Vec<IoRequest>>>,
    cancelled: Arc<Mutex<Vec<ProcessId>>>,
}

impl RecordingIoBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_handle(&self) -> Arc<Mutex<Vec<IoRequest>>> {
        Arc::clone(&self.log)
    }

    pub fn cancelled_handle(&self) -> Arc<Mutex<Vec<ProcessId>>> {
        Arc::clone(&self.cancelled)
    }
}

impl HostIoBridge for RecordingIoBridge {
    fn dispatch(&mut self, request: IoRequest) {
        self.log.lock().expect("bridge lock poisoned").push(request);
    }

    fn cancel(&mut self, pid: ProcessId) {
        self.cancelled.lock().expect("bridge lock poisoned").push(pid);
    }
}

/// Hardware bridge that drops everything.
#[derive(Debug, Default)]
pub struct NullHardwareBridge;

impl HardwareBridge for NullHardwareBridge {
    fn flush(&mut self, _command: HwCommand) {}
}

/// Recording hardware bridge for tests.
#[derive(Debug, Default)]
pub struct RecordingHardwareBridge {
    log: Arc<Mutex<Vec<HwCommand>>>,
}

impl RecordingHardwareBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_handle(&self) -> Arc<Mutex<Vec<HwCommand>>> {
        Arc::clone(&self.log)
    }
}

impl HardwareBridge for RecordingHardwareBridge {
    fn flush(&mut self, command: HwCommand) {
        self.log.lock().expect("bridge lock poisoned").push(command);
    }
}
