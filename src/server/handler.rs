//! Per-request state machine: read, parse, cache lookup, and either stream
//! the cached body or fetch from upstream while teeing the response to both
//! the client and a capture buffer destined for the cache.

use crate::config::Limits;
use crate::http::parser::{self, ParsedRequest};
use crate::http::response::{status_for_error, write_error};
use crate::pool::ConnectionPool;
use crate::server::resolver::resolve_host;
use crate::server::stats::Stats;
use crate::ProxyError;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

pub struct HandlerContext {
    pub cache: Arc<crate::cache::LruCache>,
    pub pool: Arc<ConnectionPool>,
    pub stats: Arc<Stats>,
    pub limits: Limits,
}

const PROXY_USER_AGENT: &str = "cacheproxy/0.1";

/// Drive one client connection to completion. Every failure path either
/// writes an error response or aborts the stream silently, per the
/// handler's failure policy; nothing unwinds past this function.
pub async fn handle_client(
    mut client: TcpStream,
    client_addr: SocketAddr,
    ctx: Arc<HandlerContext>,
) {
    let started = Instant::now();

    let raw = match read_request(&mut client, ctx.limits.io_buffer_bytes).await {
        Ok(raw) => raw,
        Err(err) => {
            debug!(%client_addr, error = %err, "failed to read request");
            fail(&mut client, &ctx, started, err).await;
            return;
        }
    };

    if let Some(snapshot) = ctx.cache.lookup(&raw) {
        trace!(%client_addr, "cache hit");
        let bytes_sent =
            stream_from_cache(&mut client, &snapshot.body, ctx.limits.io_buffer_bytes)
                .await
                .unwrap_or(0);
        ctx.stats.record_hit(bytes_sent as u64, started.elapsed());
        return;
    }

    let parsed = match parser::parse_request(&raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            let err = ProxyError::ClientProtocol(e.to_string());
            debug!(%client_addr, error = %err, "malformed request");
            fail(&mut client, &ctx, started, err).await;
            return;
        }
    };

    if parsed.method != "GET" || parsed.host.is_empty() || parsed.path.is_empty() {
        let err = ProxyError::UnsupportedRequest(format!("method={}", parsed.method));
        debug!(%client_addr, error = %err, "unsupported request");
        fail(&mut client, &ctx, started, err).await;
        return;
    }

    let port: u16 = parsed
        .port
        .as_deref()
        .and_then(|p| p.parse().ok())
        .unwrap_or(80);

    let mut upstream = match connect_upstream(&ctx, &parsed.host, port).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%client_addr, host = %parsed.host, error = %err, "upstream connect failed");
            fail(&mut client, &ctx, started, err).await;
            return;
        }
    };

    if let Err(err) = forward_request(&mut upstream, &parsed).await {
        warn!(%client_addr, error = %err, "failed to forward request upstream");
        fail(&mut client, &ctx, started, err).await;
        return;
    }

    let (bytes_sent, captured, clean) = tee_response(
        &mut upstream,
        &mut client,
        ctx.limits.io_buffer_bytes,
        ctx.limits.cache_max_entry_bytes,
    )
    .await;

    if let Some(body) = captured {
        if !body.is_empty() {
            ctx.cache.insert(Bytes::from(raw), body);
        }
    }

    if clean {
        ctx.pool.release(&parsed.host, port, upstream);
    }

    ctx.stats.record_miss(bytes_sent as u64, started.elapsed());
}

/// Write the error response for `err` and record the request as completed
/// with an error, so `total_requests` and mean latency cover every exit path,
/// not just hits and misses.
async fn fail(client: &mut TcpStream, ctx: &HandlerContext, started: Instant, err: ProxyError) {
    let _ = write_error(client, status_for_error(&err)).await;
    ctx.stats.record_error(started.elapsed());
}

/// Accumulate reads from `client` until the `\r\n\r\n` header terminator
/// appears. The returned buffer contains the header block only (GET
/// requests carry no body under this contract) and doubles as the cache key.
async fn read_request(client: &mut TcpStream, io_buffer_bytes: usize) -> crate::Result<Vec<u8>> {
    let limit = io_buffer_bytes.saturating_sub(1);
    let mut buf = BytesMut::with_capacity(512.min(limit.max(1)));
    let mut chunk = vec![0u8; 4096.min(limit.max(1))];

    loop {
        if let Some(end) = parser::find_header_end(&buf) {
            buf.truncate(end);
            return Ok(buf.to_vec());
        }

        if buf.len() >= limit {
            return Err(ProxyError::ClientProtocol("request too large".to_string()));
        }

        let n = client
            .read(&mut chunk)
            .await
            .map_err(|e| ProxyError::ClientProtocol(format!("read failed: {e}")))?;
        if n == 0 {
            return Err(ProxyError::ClientProtocol(
                "connection closed before request completed".to_string(),
            ));
        }

        let remaining = limit - buf.len();
        let take = n.min(remaining);
        buf.extend_from_slice(&chunk[..take]);
        if take < n {
            return Err(ProxyError::ClientProtocol("request too large".to_string()));
        }
    }
}

async fn stream_from_cache(
    client: &mut TcpStream,
    body: &Bytes,
    io_buffer_bytes: usize,
) -> std::io::Result<usize> {
    let mut sent = 0;
    for chunk in body.chunks(io_buffer_bytes.max(1)) {
        client.write_all(chunk).await?;
        sent += chunk.len();
    }
    Ok(sent)
}

async fn connect_upstream(
    ctx: &HandlerContext,
    host: &str,
    port: u16,
) -> crate::Result<TcpStream> {
    if let Some(stream) = ctx.pool.acquire(host, port) {
        return Ok(stream);
    }

    let addrs = resolve_host(host, port).await?;
    let connect_timeout = ctx.limits.upstream_connect_timeout();

    let mut last_err = None;
    for addr in addrs {
        match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last_err = Some(e.to_string()),
            Err(_) => last_err = Some("connect timed out".to_string()),
        }
    }

    Err(crate::ProxyError::UpstreamConnect(
        last_err.unwrap_or_else(|| "no addresses available".to_string()),
    ))
}

async fn forward_request(upstream: &mut TcpStream, parsed: &ParsedRequest) -> crate::Result<()> {
    let mut out = Vec::new();
    out.extend_from_slice(b"GET ");
    out.extend_from_slice(parsed.path.as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(parsed.version.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(format!("Host: {}\r\n", parsed.host).as_bytes());
    out.extend_from_slice(b"Connection: keep-alive\r\n");
    out.extend_from_slice(format!("User-Agent: {}\r\n", PROXY_USER_AGENT).as_bytes());

    let remaining: Vec<_> = parsed
        .headers
        .iter()
        .filter(|h| {
            !h.name.eq_ignore_ascii_case("host")
                && !h.name.eq_ignore_ascii_case("connection")
                && !h.name.eq_ignore_ascii_case("user-agent")
        })
        .cloned()
        .collect();
    out.extend_from_slice(&parser::unparse_headers(&remaining));
    out.extend_from_slice(b"\r\n");

    upstream
        .write_all(&out)
        .await
        .map_err(|e| ProxyError::UpstreamIo(e.to_string()))
}

/// Read the upstream response, forwarding each chunk to the client
/// immediately and appending it to a capture buffer capped at
/// `cache_max_entry_bytes`. Returns `(bytes_forwarded, captured_body,
/// clean_completion)`; `captured_body` is `None` once the cap is exceeded or
/// the exchange failed partway through.
async fn tee_response(
    upstream: &mut TcpStream,
    client: &mut TcpStream,
    io_buffer_bytes: usize,
    cache_max_entry_bytes: u64,
) -> (usize, Option<Bytes>, bool) {
    let mut chunk = vec![0u8; io_buffer_bytes.max(1)];
    let mut capture = BytesMut::new();
    let mut truncated = false;
    let mut forwarded = 0usize;

    loop {
        let n = match upstream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => return (forwarded, None, false),
        };

        if client.write_all(&chunk[..n]).await.is_err() {
            return (forwarded, None, false);
        }
        forwarded += n;

        if !truncated {
            if capture.len() as u64 + n as u64 > cache_max_entry_bytes {
                truncated = true;
                capture.clear();
            } else {
                capture.extend_from_slice(&chunk[..n]);
            }
        }
    }

    let captured = if truncated {
        None
    } else {
        Some(capture.freeze())
    };
    (forwarded, captured, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LruCache;
    use tokio::net::TcpListener;

    fn test_limits() -> Limits {
        Limits {
            io_buffer_bytes: 65536,
            cache_max_entry_bytes: 1024 * 1024,
            ..Limits::default()
        }
    }

    fn test_ctx() -> Arc<HandlerContext> {
        Arc::new(HandlerContext {
            cache: Arc::new(LruCache::new(10 * 1024 * 1024, 1024 * 1024)),
            pool: Arc::new(ConnectionPool::new(10, std::time::Duration::from_secs(60))),
            stats: Arc::new(Stats::default()),
            limits: test_limits(),
        })
    }

    async fn spawn_upstream_echo_200(body: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = sock.write_all(response.as_bytes()).await;
        });
        addr
    }

    async fn connected_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accepted, connected) =
            tokio::join!(async { listener.accept().await.unwrap() }, connect);
        (accepted.0, connected.unwrap(), accepted.1)
    }

    #[tokio::test]
    async fn miss_then_hit_end_to_end() {
        let upstream_addr = spawn_upstream_echo_200("HELLO").await;
        let ctx = test_ctx();

        let (server_side, mut client_side, client_addr) = connected_pair().await;
        let request = format!(
            "GET http://{}/ HTTP/1.1\r\nHost: {}\r\n\r\n",
            upstream_addr, upstream_addr
        );
        client_side.write_all(request.as_bytes()).await.unwrap();

        let ctx2 = ctx.clone();
        let handle = tokio::spawn(async move {
            handle_client(server_side, client_addr, ctx2).await;
        });

        let mut resp = vec![0u8; 4096];
        let n = client_side.read(&mut resp).await.unwrap();
        let text = String::from_utf8_lossy(&resp[..n]);
        assert!(text.starts_with("HTTP/1.1 200"));
        assert!(text.ends_with("HELLO"));
        handle.await.unwrap();

        assert_eq!(ctx.stats.snapshot().misses, 1);
        assert_eq!(ctx.cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn unsupported_method_gets_501() {
        let ctx = test_ctx();
        let (server_side, mut client_side, client_addr) = connected_pair().await;
        client_side
            .write_all(b"POST http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let ctx2 = ctx.clone();
        let handle = tokio::spawn(async move {
            handle_client(server_side, client_addr, ctx2).await;
        });

        let mut resp = vec![0u8; 256];
        let n = client_side.read(&mut resp).await.unwrap();
        assert!(String::from_utf8_lossy(&resp[..n]).starts_with("HTTP/1.1 501"));
        handle.await.unwrap();

        let snap = ctx.stats.snapshot();
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.hits, 0);
        assert_eq!(snap.misses, 0);
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let ctx = test_ctx();
        let (server_side, mut client_side, client_addr) = connected_pair().await;
        client_side.write_all(b"GET\r\n\r\n").await.unwrap();

        let ctx2 = ctx.clone();
        let handle = tokio::spawn(async move {
            handle_client(server_side, client_addr, ctx2).await;
        });

        let mut resp = vec![0u8; 256];
        let n = client_side.read(&mut resp).await.unwrap();
        assert!(String::from_utf8_lossy(&resp[..n]).starts_with("HTTP/1.1 400"));
        handle.await.unwrap();

        assert_eq!(ctx.stats.snapshot().total_requests, 1);
    }
}
