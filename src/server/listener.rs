use crate::admission::AdmissionController;
use crate::cache::LruCache;
use crate::config::Config;
use crate::http::response::{status_for_error, write_error};
use crate::pool::ConnectionPool;
use crate::queue::{self, WorkItem};
use crate::server::handler::HandlerContext;
use crate::server::stats::Stats;
use crate::server::worker::spawn_workers;
use crate::utils::error::Result;
use crate::ProxyError;
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Owns the listening socket, the admission gate, the work queue, and the
/// worker pool. `run` accepts connections until `shutdown` is cancelled.
pub struct CacheProxyServer {
    config: Arc<Config>,
    admission: Arc<AdmissionController>,
    cache: Arc<LruCache>,
    pool: Arc<ConnectionPool>,
    stats: Arc<Stats>,
}

impl CacheProxyServer {
    pub fn new(config: Config) -> Self {
        let limits = config.limits;
        Self {
            cache: Arc::new(LruCache::new(
                limits.cache_max_total_bytes,
                limits.cache_max_entry_bytes,
            )),
            pool: Arc::new(ConnectionPool::new(
                limits.pool_capacity,
                limits.pool_idle_max_age(),
            )),
            admission: Arc::new(AdmissionController::new(limits.max_clients)),
            stats: Arc::new(Stats::default()),
            config: Arc::new(config),
        }
    }

    pub fn cache(&self) -> Arc<LruCache> {
        self.cache.clone()
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Bind the listening socket with `SO_REUSEADDR`/`SO_KEEPALIVE` and a
    /// backlog equal to `QUEUE_CAPACITY`, mirroring the teacher's low-level
    /// socket setup for the client-facing listener.
    fn bind(&self) -> Result<TcpListener> {
        let addr: SocketAddr = format!(
            "{}:{}",
            self.config.server.bind_address, self.config.server.bind_port
        )
        .parse()
        .map_err(|e| ProxyError::Config(format!("invalid bind address/port: {e}")))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_keepalive(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(self.config.limits.queue_capacity as i32)?;

        Ok(TcpListener::from_std(socket.into())?)
    }

    /// Accept connections and run the worker pool until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = self.bind()?;
        info!(
            "cacheproxy listening on {}:{}",
            self.config.server.bind_address, self.config.server.bind_port
        );

        self.serve(listener, shutdown).await
    }

    /// Accept loop over an already-bound listener, shared by `run` and the
    /// in-process tests below (which bind their own ephemeral-port listener
    /// rather than going through `bind`'s socket2/config path).
    async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let (sender, receiver) = queue::bounded(self.config.limits.queue_capacity);
        let handler_ctx = Arc::new(HandlerContext {
            cache: self.cache.clone(),
            pool: self.pool.clone(),
            stats: self.stats.clone(),
            limits: self.config.limits,
        });

        let workers = spawn_workers(self.config.limits.workers, receiver, handler_ctx);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (mut stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(error = %e, "failed to set TCP_NODELAY");
                    }

                    let Some(permit) = self.admission.try_admit() else {
                        let status = status_for_error(&ProxyError::AdmissionRejection);
                        let _ = write_error(&mut stream, status).await;
                        continue;
                    };

                    let item = WorkItem {
                        client_socket: stream,
                        client_addr: addr,
                        permit,
                    };
                    // Enqueue inline, in the accept loop's own task: a client
                    // accepted earlier must be dispatched no later than one
                    // accepted later, and independently spawned tasks give no
                    // such ordering guarantee. It's fine for the acceptor to
                    // suspend here when the queue is full.
                    if sender.send(item).await.is_err() {
                        break;
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("shutdown requested: no longer accepting connections");
                    break;
                }
            }
        }

        drop(sender);
        for worker in workers {
            let _ = worker.await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Limits, ServerConfig};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    fn test_config(max_clients: usize) -> Config {
        Config {
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                bind_port: 0,
            },
            logging: Default::default(),
            limits: Limits {
                max_clients,
                workers: 1,
                queue_capacity: 8,
                ..Limits::default()
            },
        }
    }

    /// S4: with `max_clients=2`, a third concurrent connection is rejected
    /// with a literal `HTTP/1.1 503` off the wire, over a real accept loop.
    #[tokio::test]
    async fn third_concurrent_connection_is_rejected_with_503() {
        let server = CacheProxyServer::new(test_config(2));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();

        let server_shutdown = shutdown.clone();
        let run_handle = tokio::spawn(async move {
            server.serve(listener, server_shutdown).await.unwrap();
        });

        // Two clients connect and hold their sockets open without sending a
        // request, occupying both admission slots.
        let _client1 = TcpStream::connect(addr).await.unwrap();
        let _client2 = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut client3 = TcpStream::connect(addr).await.unwrap();
        let mut resp = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match client3.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => resp.extend_from_slice(&buf[..n]),
            }
        }
        assert!(String::from_utf8_lossy(&resp).starts_with("HTTP/1.1 503"));

        shutdown.cancel();
        let _ = run_handle.await;
    }
}

/// Periodic statistics interval, not currently part of `config::Limits`
/// since it has no correctness impact — only observability cadence.
pub const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(60);
