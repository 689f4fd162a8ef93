//! Target signal line edge latch.
//!
//! The session state machine arms and disarms the rising-edge interrupt on the
//! signal line through the board; the latch records that intent so the edge
//! watcher task only forwards edges while a handshake is pending. The latch is
//! single-fire: the first accepted edge masks it until the session re-arms.

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use portable_atomic::{AtomicBool, AtomicU32, Ordering};

#[cfg(not(target_os = "none"))]
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
#[cfg(target_os = "none")]
use embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;

#[cfg(target_os = "none")]
type SignalMutex = ThreadModeRawMutex;
#[cfg(not(target_os = "none"))]
type SignalMutex = NoopRawMutex;

/// Depth of the queue carrying asynchronous events to the control task.
pub const CONTROL_EVENT_DEPTH: usize = 4;

/// Asynchronous events delivered to the control task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlEvent {
    /// Rising edge observed on the signal line while armed.
    TargetSignal,
}

pub type ControlEventQueue = Channel<SignalMutex, ControlEvent, CONTROL_EVENT_DEPTH>;

/// Arm/disarm state for the signal line edge interrupt.
pub struct SignalLatch {
    armed: AtomicBool,
    ignored: AtomicU32,
    wake: Signal<SignalMutex, ()>,
}

impl SignalLatch {
    pub const fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            ignored: AtomicU32::new(0),
            wake: Signal::new(),
        }
    }

    /// Enables edge delivery and wakes a watcher parked in [`Self::wait_armed`].
    pub fn arm(&self) {
        self.armed.store(true, Ordering::Release);
        self.wake.signal(());
    }

    /// Disables edge delivery, returning whether the latch was armed.
    pub fn disarm(&self) -> bool {
        self.armed.swap(false, Ordering::AcqRel)
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Accepts an observed edge. Returns `true` when it should be forwarded.
    ///
    /// Forwarding disarms the latch, so later edges are counted as ignored
    /// until the next [`Self::arm`].
    pub fn accept_edge(&self) -> bool {
        if self.armed.swap(false, Ordering::AcqRel) {
            true
        } else {
            self.ignored.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Edges seen while disarmed.
    #[must_use]
    pub fn ignored_edges(&self) -> u32 {
        self.ignored.load(Ordering::Relaxed)
    }

    /// Waits until the latch is armed.
    pub async fn wait_armed(&self) {
        while !self.is_armed() {
            self.wake.wait().await;
        }
    }
}

impl Default for SignalLatch {
    fn default() -> Self {
        Self::new()
    }
}
