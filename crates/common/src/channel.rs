//! Completion queue between device worker threads and the reactor
//!
//! Workers push [`UrbCompletion`]s tagged with the [`SessionId`] that
//! submitted them, then wake the reactor so it drains the queue on its next
//! iteration. The queue is unbounded: its depth is limited by the number of
//! URBs in flight, and a worker must never block on a busy reactor.

use crate::usb_types::UrbCompletion;
use async_channel::{Receiver, Sender, unbounded};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Process-unique identifier of a session
///
/// Slots in the reactor are reused; completions carry this id so they never
/// reach a newer connection occupying the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Wakes the consumer of the completion queue
pub trait Wake: Send + Sync {
    fn wake(&self) -> std::io::Result<()>;
}

impl<F> Wake for F
where
    F: Fn() -> std::io::Result<()> + Send + Sync,
{
    fn wake(&self) -> std::io::Result<()> {
        self()
    }
}

/// A completion as delivered to the reactor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    pub session: SessionId,
    pub completion: UrbCompletion,
}

/// Producer side, shared by all devices; hands out per-session senders
#[derive(Clone)]
pub struct CompletionQueue {
    tx: Sender<CompletionEvent>,
    waker: Arc<dyn Wake>,
}

impl CompletionQueue {
    /// Sender that tags every completion with `session`
    pub fn sender(&self, session: SessionId) -> CompletionSender {
        CompletionSender {
            session,
            tx: self.tx.clone(),
            waker: Arc::clone(&self.waker),
        }
    }
}

/// Handle a device backend uses to report completions for one session
#[derive(Clone)]
pub struct CompletionSender {
    session: SessionId,
    tx: Sender<CompletionEvent>,
    waker: Arc<dyn Wake>,
}

impl fmt::Debug for CompletionSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSender")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl CompletionSender {
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Queue a completion and wake the consumer (non-blocking)
    pub fn send(&self, completion: UrbCompletion) -> crate::Result<()> {
        self.tx
            .try_send(CompletionEvent {
                session: self.session,
                completion,
            })
            .map_err(|e| {
                debug!("{}: dropping completion: {}", self.session, e);
                crate::Error::Channel(e.to_string())
            })?;
        self.waker.wake()?;
        Ok(())
    }
}

/// Consumer side, owned by the reactor
pub struct CompletionReceiver {
    rx: Receiver<CompletionEvent>,
}

impl CompletionReceiver {
    /// Take one queued completion without blocking
    pub fn try_recv(&self) -> Option<CompletionEvent> {
        self.rx.try_recv().ok()
    }

    /// Take everything currently queued
    pub fn drain(&self) -> impl Iterator<Item = CompletionEvent> + '_ {
        std::iter::from_fn(move || self.try_recv())
    }

    /// Wait for the next completion (async)
    pub async fn recv(&self) -> crate::Result<CompletionEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create the completion queue
///
/// Returns (CompletionQueue for device backends, CompletionReceiver for the reactor)
pub fn completion_queue(waker: Arc<dyn Wake>) -> (CompletionQueue, CompletionReceiver) {
    let (tx, rx) = unbounded();
    (CompletionQueue { tx, waker }, CompletionReceiver { rx })
}
