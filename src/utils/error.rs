use thiserror::Error;

/// Error taxonomy for the proxy core.
///
/// Every variant that can arise while serving a request maps to exactly one
/// client-facing status code via `http::response::status_for_error`. `Config`
/// only ever surfaces at startup, before any client socket exists.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed request: {0}")]
    ClientProtocol(String),

    #[error("unsupported request: {0}")]
    UnsupportedRequest(String),

    #[error("upstream resolution failed: {0}")]
    UpstreamResolution(String),

    #[error("upstream connect failed: {0}")]
    UpstreamConnect(String),

    #[error("upstream I/O failed: {0}")]
    UpstreamIo(String),

    #[error("admission rejected: active clients at capacity")]
    AdmissionRejection,

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
