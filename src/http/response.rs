//! Minimal error-response emitter.
//!
//! Covers exactly the status codes the handler can produce (§4.6): a status
//! line, `Content-Length`, `Content-Type`, `Connection: keep-alive`, an RFC
//! 1123 `Date`, a `Server` identifier, and a tiny HTML body.

use crate::ProxyError;
use tokio::io::AsyncWriteExt;

pub const PROXY_IDENT: &str = "cacheproxy/0.1";

/// Map a `ProxyError` arising while serving a request to the status code the
/// handler writes back to the client. `Io` and `Config` never reach a client
/// socket (the former is swallowed into the more specific upstream/client
/// variants before it gets here, the latter only occurs at startup), so they
/// fall back to 500 rather than being reachable in practice.
pub fn status_for_error(err: &ProxyError) -> u16 {
    match err {
        ProxyError::ClientProtocol(_) => 400,
        ProxyError::UnsupportedRequest(_) => 501,
        ProxyError::UpstreamResolution(_) => 500,
        ProxyError::UpstreamConnect(_) => 500,
        ProxyError::UpstreamIo(_) => 500,
        ProxyError::AdmissionRejection => 503,
        ProxyError::Io(_) | ProxyError::Config(_) => 500,
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "Error",
    }
}

fn rfc1123_now() -> String {
    chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn render(status: u16) -> Vec<u8> {
    let reason = reason_phrase(status);
    let body = format!(
        "<html><head><title>{status} {reason}</title></head>\
         <body><h1>{status} {reason}</h1></body></html>"
    );
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Length: {len}\r\n\
         Content-Type: text/html\r\n\
         Connection: keep-alive\r\n\
         Date: {date}\r\n\
         Server: {ident}\r\n\
         \r\n\
         {body}",
        status = status,
        reason = reason,
        len = body.len(),
        date = rfc1123_now(),
        ident = PROXY_IDENT,
        body = body,
    )
    .into_bytes()
}

/// Write a complete error response for `status` to `writer`. Write failures
/// are swallowed by the caller (logged at `debug`, never propagated) since
/// the client socket is closed immediately after regardless.
pub async fn write_error<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    status: u16,
) -> std::io::Result<()> {
    writer.write_all(&render(status)).await
}
