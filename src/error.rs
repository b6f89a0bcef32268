use http::StatusCode;
use std::fmt;

/// Error taxonomy for the request path. Every failure the core can hit is an
/// explicit value — there is no panic-based control flow anywhere in the
/// request lifecycle.
#[derive(Debug)]
pub enum ProxyError {
    /// Rejected at startup; the process exits with code 1.
    Config(String),
    /// Malformed downstream request.
    ClientBad(String),
    /// Request body exceeded `client_max_body_size`.
    ClientTooLarge,
    /// Downstream idle/read deadline fired.
    ClientTimeout,
    /// Downstream peer closed or reset mid-request.
    ClientGone,
    /// Could not establish a connection to any upstream peer.
    UpstreamConnect(String),
    /// An upstream I/O deadline fired.
    UpstreamTimeout,
    /// Upstream sent something the adapter could not parse.
    UpstreamBadResponse(String),
    /// Upstream answered with a status the failover mask treats as an error.
    UpstreamStatus(StatusCode),
    /// Cache file I/O failed; the request falls back to a direct fetch.
    CacheIo(std::io::Error),
    /// Invariant violation; finalized as 500.
    Internal(String),
}

impl ProxyError {
    /// The downstream status a finalized request reports for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::ClientBad(_) => StatusCode::BAD_REQUEST,
            ProxyError::ClientTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::ClientTimeout => StatusCode::REQUEST_TIMEOUT,
            ProxyError::ClientGone => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            ProxyError::UpstreamConnect(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamBadResponse(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamStatus(code) => *code,
            ProxyError::CacheIo(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Config(msg) => write!(f, "config error: {}", msg),
            ProxyError::ClientBad(msg) => write!(f, "bad request: {}", msg),
            ProxyError::ClientTooLarge => write!(f, "request body too large"),
            ProxyError::ClientTimeout => write!(f, "client timed out"),
            ProxyError::ClientGone => write!(f, "client closed request"),
            ProxyError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            ProxyError::UpstreamTimeout => write!(f, "upstream timed out"),
            ProxyError::UpstreamBadResponse(msg) => {
                write!(f, "upstream sent invalid response: {}", msg)
            }
            ProxyError::UpstreamStatus(code) => write!(f, "upstream returned {}", code),
            ProxyError::CacheIo(e) => write!(f, "cache i/o error: {}", e),
            ProxyError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => ProxyError::UpstreamTimeout,
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
                ProxyError::ClientGone
            }
            _ => ProxyError::Internal(e.to_string()),
        }
    }
}
