//! Event publishing/subscription abstraction (mechanics only).
//!
//! A lightweight pub/sub contract used to distribute scheduler notifications
//! to consumers (notification fan-out, chaining, dashboards).
//!
//! Design assumptions:
//!
//! - **Transport-agnostic**: works with in-memory channels or a broker.
//! - **At-least-once delivery**: consumers must be idempotent. Job and step
//!   state lives in the stores, not on the bus, so redelivery is safe.
//! - **Broadcast semantics**: every subscriber gets a copy of every message.
//! - **No persistence**: the bus distributes, the stores are the record.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to a notification stream.
///
/// Designed for single-threaded consumption; hand the subscription to one
/// worker loop and poll it with `recv_timeout` so shutdown checks can run.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<M> {
        let mut out = Vec::new();
        while let Ok(m) = self.try_recv() {
            out.push(m);
        }
        out
    }
}

/// Message-agnostic event bus (pub/sub abstraction).
///
/// `publish()` can fail (bus full, transport error); failures are surfaced
/// to the caller, which may retry — job state is already persisted, so
/// republication is safe.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
