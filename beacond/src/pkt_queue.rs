//! Bounded queue of datagrams between the engine and the UDP sockets.
//!
//! A fixed-capacity ring guarded by a single mutex. There is no condition
//! variable: the send/receive threads already poll, so an empty dequeue just
//! returns `None` and the caller sleeps briefly.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;

use bytes::Bytes;
use thiserror::Error;

use crate::wire::MESSAGE_LENGTH;

/// Capacity of every packet queue, in datagrams.
pub const MAX_QUEUE_LENGTH: usize = 512;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("packet queue is full")]
    Full,
    #[error("payload of {0} bytes exceeds the {MESSAGE_LENGTH}-byte limit")]
    Oversize(usize),
    #[error("packet queue has been released")]
    Closed,
}

/// One datagram plus its peer address. On the inbound queue the address is
/// the sender; on the outbound queue it is the destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub addr: SocketAddr,
    pub payload: Bytes,
}

struct Ring {
    slots: VecDeque<Packet>,
    closed: bool,
}

pub struct PacketQueue {
    ring: Mutex<Ring>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(Ring {
                slots: VecDeque::with_capacity(MAX_QUEUE_LENGTH),
                closed: false,
            }),
        }
    }

    /// Copy one datagram into the next rear slot.
    pub fn enqueue(&self, addr: SocketAddr, payload: Bytes) -> Result<(), QueueError> {
        if payload.len() > MESSAGE_LENGTH {
            return Err(QueueError::Oversize(payload.len()));
        }

        let mut ring = self.ring.lock().unwrap();
        if ring.closed {
            return Err(QueueError::Closed);
        }
        if ring.slots.len() >= MAX_QUEUE_LENGTH {
            return Err(QueueError::Full);
        }
        ring.slots.push_back(Packet { addr, payload });
        Ok(())
    }

    /// Take the front datagram, or `None` when the queue is empty.
    pub fn dequeue(&self) -> Option<Packet> {
        self.ring.lock().unwrap().slots.pop_front()
    }

    /// Close the queue and drain whatever is still in it. Subsequent
    /// enqueues fail with [`QueueError::Closed`].
    pub fn release(&self) {
        let mut ring = self.ring.lock().unwrap();
        ring.closed = true;
        ring.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}
