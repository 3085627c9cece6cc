//! Fixed-capacity pool of idle upstream sockets keyed by `(host, port)`.
//!
//! Mirrors the teacher's `server::pool` design (a `DashMap` keyed per
//! destination, with a shared atomic tracking total idle connections) but
//! keyed by the unresolved `(host, port)` pair rather than a `SocketAddr`,
//! since the host in a forwarded request is a name, not yet an address.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

type DestKey = (String, u16);

struct Idle {
    stream: TcpStream,
    returned_at: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub stale_evictions: u64,
    pub drops_full: u64,
}

struct Counters {
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
    stale_evictions: std::sync::atomic::AtomicU64,
    drops_full: std::sync::atomic::AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            hits: std::sync::atomic::AtomicU64::new(0),
            misses: std::sync::atomic::AtomicU64::new(0),
            stale_evictions: std::sync::atomic::AtomicU64::new(0),
            drops_full: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

/// Global pool of idle upstream connections.
///
/// `acquire`/`release` never perform I/O or block on contention beyond an
/// uncontended map access; a miss means the caller must dial a fresh
/// connection itself.
pub struct ConnectionPool {
    idle: DashMap<DestKey, Vec<Idle>>,
    total_idle: AtomicUsize,
    capacity: usize,
    max_age: Duration,
    counters: Counters,
}

impl ConnectionPool {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            idle: DashMap::new(),
            total_idle: AtomicUsize::new(0),
            capacity,
            max_age,
            counters: Counters::default(),
        }
    }

    /// Return a reusable socket for `(host, port)`, or `None` if none is
    /// fresh. Stale entries encountered along the way are dropped.
    pub fn acquire(&self, host: &str, port: u16) -> Option<TcpStream> {
        let key = (host.to_string(), port);
        let Some(mut slot) = self.idle.get_mut(&key) else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        while let Some(candidate) = slot.pop() {
            self.total_idle.fetch_sub(1, Ordering::Relaxed);
            if candidate.returned_at.elapsed() < self.max_age {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(candidate.stream);
            }
            // Stale: drop the socket (closed on drop) and keep scanning.
            self.counters.stale_evictions.fetch_add(1, Ordering::Relaxed);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Hand an idle socket back to the pool. Closed (dropped) instead if the
    /// pool is already at `capacity`.
    pub fn release(&self, host: &str, port: u16, stream: TcpStream) {
        if self.total_idle.load(Ordering::Relaxed) >= self.capacity {
            self.counters.drops_full.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let key = (host.to_string(), port);
        self.idle.entry(key).or_default().push(Idle {
            stream,
            returned_at: Instant::now(),
        });
        self.total_idle.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_idle(&self) -> usize {
        self.total_idle.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stale_evictions: self.counters.stale_evictions.load(Ordering::Relaxed),
            drops_full: self.counters.drops_full.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accepted, (connected, _)) = tokio::join!(
            async { listener.accept().await.unwrap() },
            async { (connect.await.unwrap(), ()) }
        );
        (accepted.0, connected)
    }

    #[tokio::test]
    async fn miss_when_empty() {
        let pool = ConnectionPool::new(4, Duration::from_secs(60));
        assert!(pool.acquire("example.com", 80).is_none());
        assert_eq!(pool.stats().misses, 1);
    }

    #[tokio::test]
    async fn release_then_acquire_hits() {
        let pool = ConnectionPool::new(4, Duration::from_secs(60));
        let (a, _b) = loopback_pair().await;
        pool.release("example.com", 80, a);
        assert_eq!(pool.total_idle(), 1);

        let got = pool.acquire("example.com", 80);
        assert!(got.is_some());
        assert_eq!(pool.total_idle(), 0);
        assert_eq!(pool.stats().hits, 1);
    }

    #[tokio::test]
    async fn acquire_does_not_cross_destinations() {
        let pool = ConnectionPool::new(4, Duration::from_secs(60));
        let (a, _b) = loopback_pair().await;
        pool.release("example.com", 80, a);

        assert!(pool.acquire("other.com", 80).is_none());
        assert!(pool.acquire("example.com", 443).is_none());
        assert!(pool.acquire("example.com", 80).is_some());
    }

    #[tokio::test]
    async fn stale_connections_are_not_returned() {
        let pool = ConnectionPool::new(4, Duration::from_millis(10));
        let (a, _b) = loopback_pair().await;
        pool.release("example.com", 80, a);

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(pool.acquire("example.com", 80).is_none());
        assert_eq!(pool.stats().stale_evictions, 1);
        assert_eq!(pool.total_idle(), 0);
    }

    #[tokio::test]
    async fn respects_global_capacity() {
        let pool = ConnectionPool::new(1, Duration::from_secs(60));
        let (a, _ka) = loopback_pair().await;
        let (b, _kb) = loopback_pair().await;

        pool.release("example.com", 80, a);
        pool.release("example.com", 81, b);

        assert_eq!(pool.total_idle(), 1);
        assert_eq!(pool.stats().drops_full, 1);
    }
}
