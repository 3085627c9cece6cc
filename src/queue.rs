//! Bounded work queue of accepted client sockets.
//!
//! Grounded in the bounded-channel-plus-semaphore worker pool pattern used
//! elsewhere in the retrieved corpus: a `tokio::sync::mpsc` bounded channel
//! gives the enqueue-suspends-when-full / dequeue-suspends-when-empty
//! discipline the spec describes as a mutex-plus-two-condvars FIFO, without
//! hand-rolling either the lock or the wait queues.

use crate::admission::AdmissionPermit;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

pub struct WorkItem {
    pub client_socket: TcpStream,
    pub client_addr: std::net::SocketAddr,
    /// Held until the worker finishes handling this client; dropping it is
    /// the admission controller's release step (see `admission`).
    pub permit: AdmissionPermit,
}

/// Producer handle. `send` suspends while the queue is full.
#[derive(Clone)]
pub struct QueueSender {
    inner: mpsc::Sender<WorkItem>,
}

impl QueueSender {
    /// Enqueue `item`, suspending if the queue is at capacity. Fails only
    /// once every receiver has been dropped (shutdown in progress).
    pub async fn send(&self, item: WorkItem) -> Result<(), WorkItem> {
        self.inner.send(item).await.map_err(|e| e.0)
    }
}

/// Consumer handle, shared across all workers; each `recv` call competes for
/// the next queued item, giving strict FIFO dispatch across the pool.
pub struct QueueReceiver {
    inner: mpsc::Receiver<WorkItem>,
}

impl QueueReceiver {
    /// Dequeue the next item, suspending if the queue is empty. Returns
    /// `None` once the sender side is dropped and the queue is drained —
    /// the shutdown sentinel.
    pub async fn recv(&mut self) -> Option<WorkItem> {
        self.inner.recv().await
    }
}

pub fn bounded(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (QueueSender { inner: tx }, QueueReceiver { inner: rx })
}
