//! Outgoing message staging and the bounded channels between link tasks.
//!
//! The control task runs core operations synchronously, so replies are staged
//! in an [`Outbox`] that implements the core [`Transport`] trait. After each
//! operation the control task drains the outbox into the per-link channels,
//! which the USB and UART tasks forward to the wire.

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

use edb_core::hal::{Link, Transport, TransportError, TxPolicy};
use edb_core::protocol::{FrameBytes, encode_frame};
use embassy_sync::channel::{Channel, Receiver, Sender};
use heapless::{Deque, Vec};

#[cfg(not(target_os = "none"))]
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
#[cfg(target_os = "none")]
use embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;

#[cfg(target_os = "none")]
type LinkMutex = ThreadModeRawMutex;
#[cfg(not(target_os = "none"))]
type LinkMutex = NoopRawMutex;

/// Number of messages the outbox holds between drains.
pub const OUTBOX_DEPTH: usize = 16;

/// Depth for each bounded link channel.
pub const LINK_QUEUE_DEPTH: usize = 8;

/// Maximum size of a raw chunk received from the host.
pub const HOST_CHUNK_SIZE: usize = 64;

/// Raw bytes read from the USB host link.
pub type HostChunk = Vec<u8, HOST_CHUNK_SIZE>;

/// Channel of encoded frames waiting for a link task.
pub type FrameChannel = Channel<LinkMutex, FrameBytes, LINK_QUEUE_DEPTH>;
pub type FrameSender<'a> = Sender<'a, LinkMutex, FrameBytes, LINK_QUEUE_DEPTH>;
pub type FrameReceiver<'a> = Receiver<'a, LinkMutex, FrameBytes, LINK_QUEUE_DEPTH>;

/// Channel of raw host bytes waiting for the frame assembler.
pub type HostRxChannel = Channel<LinkMutex, HostChunk, LINK_QUEUE_DEPTH>;
pub type HostRxSender<'a> = Sender<'a, LinkMutex, HostChunk, LINK_QUEUE_DEPTH>;
pub type HostRxReceiver<'a> = Receiver<'a, LinkMutex, HostChunk, LINK_QUEUE_DEPTH>;

/// Encoded message waiting in the outbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub link: Link,
    pub policy: TxPolicy,
    pub bytes: FrameBytes,
}

/// Bounded staging queue shared by both links.
///
/// When full, a [`TxPolicy::Force`] message evicts the oldest
/// [`TxPolicy::DropIfBusy`] message; a droppable message is refused.
pub struct Outbox<const N: usize = OUTBOX_DEPTH> {
    queue: Deque<OutboundMessage, N>,
    dropped: u32,
}

impl<const N: usize> Outbox<N> {
    /// Creates an empty outbox.
    pub const fn new() -> Self {
        Self {
            queue: Deque::new(),
            dropped: 0,
        }
    }

    /// Removes the oldest queued message.
    pub fn pop(&mut self) -> Option<OutboundMessage> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of messages refused or evicted since the last call.
    pub fn take_dropped(&mut self) -> u32 {
        core::mem::take(&mut self.dropped)
    }

    fn evict_droppable(&mut self) -> bool {
        let mut evicted = false;
        for _ in 0..self.queue.len() {
            let Some(message) = self.queue.pop_front() else {
                break;
            };
            if !evicted && message.policy == TxPolicy::DropIfBusy {
                evicted = true;
                continue;
            }
            // Room was just made by the pop above.
            let _ = self.queue.push_back(message);
        }
        evicted
    }
}

impl<const N: usize> Default for Outbox<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Transport for Outbox<N> {
    fn send(
        &mut self,
        link: Link,
        descriptor: u8,
        payload: &[u8],
        policy: TxPolicy,
    ) -> Result<(), TransportError> {
        let mut bytes = FrameBytes::new();
        encode_frame(descriptor, payload, &mut bytes).map_err(|_| TransportError::PayloadTooLong)?;

        if self.queue.is_full() {
            let room = match policy {
                TxPolicy::Force => self.evict_droppable(),
                TxPolicy::DropIfBusy => false,
            };
            self.dropped = self.dropped.saturating_add(1);
            if !room {
                return Err(TransportError::QueueFull);
            }
        }

        self.queue
            .push_back(OutboundMessage {
                link,
                policy,
                bytes,
            })
            .map_err(|_| TransportError::QueueFull)
    }
}

/// Bundles the link channels so tasks can share a single instance.
pub struct LinkQueues {
    pub host_rx: HostRxChannel,
    pub host_tx: FrameChannel,
    pub target_tx: FrameChannel,
}

impl LinkQueues {
    /// Creates the queue bundle with every channel empty.
    pub const fn new() -> Self {
        Self {
            host_rx: Channel::new(),
            host_tx: Channel::new(),
            target_tx: Channel::new(),
        }
    }

    pub fn host_rx_sender(&self) -> HostRxSender<'_> {
        self.host_rx.sender()
    }

    pub fn host_rx_receiver(&self) -> HostRxReceiver<'_> {
        self.host_rx.receiver()
    }

    pub fn host_tx_sender(&self) -> FrameSender<'_> {
        self.host_tx.sender()
    }

    pub fn host_tx_receiver(&self) -> FrameReceiver<'_> {
        self.host_tx.receiver()
    }

    pub fn target_tx_sender(&self) -> FrameSender<'_> {
        self.target_tx.sender()
    }

    pub fn target_tx_receiver(&self) -> FrameReceiver<'_> {
        self.target_tx.receiver()
    }

    /// Sender for the channel that serves `link`.
    pub fn sender_for(&self, link: Link) -> FrameSender<'_> {
        match link {
            Link::Host => self.host_tx_sender(),
            Link::Target => self.target_tx_sender(),
        }
    }
}
