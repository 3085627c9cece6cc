//! Fixed pool of long-lived workers draining the work queue.

use crate::queue::QueueReceiver;
use crate::server::handler::{handle_client, HandlerContext};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Spawn `count` worker tasks sharing one receiver. Each worker dequeues a
/// `WorkItem`, runs the handler to completion, then loops; it exits when
/// `recv` returns `None` (producer side closed and queue drained).
pub fn spawn_workers(
    count: usize,
    receiver: QueueReceiver,
    ctx: Arc<HandlerContext>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let receiver = Arc::new(Mutex::new(receiver));
    (0..count)
        .map(|id| {
            let receiver = receiver.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { worker_loop(id, receiver, ctx).await })
        })
        .collect()
}

async fn worker_loop(id: usize, receiver: Arc<Mutex<QueueReceiver>>, ctx: Arc<HandlerContext>) {
    loop {
        let item = {
            let mut guard = receiver.lock().await;
            guard.recv().await
        };

        let Some(item) = item else {
            info!(worker = id, "worker exiting: queue closed");
            return;
        };

        handle_client(item.client_socket, item.client_addr, ctx.clone()).await;
    }
}
