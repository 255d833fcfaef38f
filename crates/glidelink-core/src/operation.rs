//! Operation environment
//!
//! Long-running device operations report progress, sleep between protocol
//! steps, and poll for cooperative cancellation through this trait. The
//! surrounding application supplies an implementation wired to its dialogs;
//! the core only ever talks to the trait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Coarse phase of the running device operation, for progress dialogs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Phase {
    /// Waiting for the device to answer the connect probe
    Connecting,
    /// Sending a command packet and waiting for its acknowledgement
    SendingCommand,
    /// Waiting for the device to finish a slow internal step
    AwaitingDevice,
    /// Bulk data transfer in progress
    Transferring,
    /// Writing the database/declaration block back to the device
    WritingDatabase,
}

/// Environment a device session runs in
pub trait OperationEnv {
    /// Block the calling thread; sessions are fully synchronous
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    /// Report the current phase; default implementation discards it
    fn set_phase(&self, _phase: Phase) {}

    /// Report transfer progress in percent, when known
    fn set_progress(&self, _percent: u8) {}

    /// Cooperative cancellation check, polled on every iteration of the
    /// bulk-transfer and ack-wait loops
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Environment that sleeps for real and can never be cancelled
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEnv;

impl OperationEnv for NullEnv {}

/// Environment backed by an atomic cancellation flag
///
/// Suitable for wiring a "Cancel" button to a session running on a worker
/// thread.
#[derive(Debug, Default)]
pub struct CancelFlagEnv {
    cancelled: AtomicBool,
}

impl CancelFlagEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

impl OperationEnv for CancelFlagEnv {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Test environment that skips the protocol pacing delays
#[cfg(test)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct InstantEnv;

#[cfg(test)]
impl OperationEnv for InstantEnv {
    fn sleep(&self, _duration: Duration) {}
}
