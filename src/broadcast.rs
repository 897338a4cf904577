//! # Outbound frames and the process-wide queue
//!
//! Everything a session writes to its client travels as an [`Outbound`]: the
//! text plus the cancellation scope that produced it. Send loops drop frames
//! whose scope has been cancelled, so output from a stopped query never
//! reaches the wire after the stop.
//!
//! [`BroadcastChannel`] is the bounded, process-wide queue used only in
//! broadcast mode. Every session's send loop competes for its items: each frame
//! is delivered once, to whichever session takes it first, which is not
//! necessarily the session that produced it. By default sessions deliver
//! through their own queues and this type is not constructed.

use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::{RagError, Result};

/// A text frame bound for a client, tagged with its producing scope.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub text: String,
    pub scope: CancellationToken,
}

impl Outbound {
    pub fn new(text: impl Into<String>, scope: CancellationToken) -> Self {
        Self {
            text: text.into(),
            scope,
        }
    }

    /// True once the producing scope was cancelled; such frames are not sent.
    pub fn is_stale(&self) -> bool {
        self.scope.is_cancelled()
    }
}

/// Bounded multi-producer, multi-consumer queue of outbound frames.
#[derive(Debug, Clone)]
pub struct BroadcastChannel {
    tx: mpsc::Sender<Outbound>,
    rx: Arc<Mutex<mpsc::Receiver<Outbound>>>,
}

impl BroadcastChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Enqueue a frame, waiting while the queue is full.
    pub async fn publish(&self, frame: Outbound) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| RagError::Transport("broadcast queue closed".to_string()))
    }

    /// Take the next frame. Cancel-safe: dropping the future loses nothing.
    pub async fn recv(&self) -> Option<Outbound> {
        self.rx.lock().await.recv().await
    }
}
