pub mod body;
pub mod vars;

pub use body::ClientBody;

use crate::cache::CacheStatus;
use crate::location::Location;
use http::{HeaderMap, Method, StatusCode, Version};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Internal-redirect budget. Each rewrite cycle or internal redirect spends
/// one unit; exhausting it is a configuration loop and fails the request.
pub const MAX_URI_CHANGES: u8 = 10;

/// Nesting bound for the subrequest tree.
pub const MAX_SUBREQUEST_DEPTH: u16 = 200;

/// Response head under construction: status plus the outgoing header
/// collection the filter chain serializes.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
}

impl Default for ResponseHead {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            content_length: None,
        }
    }
}

type Finalizer = Box<dyn FnOnce() + Send>;

/// Per-request state driven through the phase engine.
///
/// The request owns every per-request resource; the cleanup chain releases
/// them in LIFO order exactly once, either at `finalize` or on drop.
pub struct Request {
    pub method: Method,
    pub version: Version,
    /// Decoded path component.
    pub uri: String,
    /// Raw query string, no leading `?`.
    pub args: String,
    pub host: String,
    pub headers_in: HeaderMap,
    pub client_addr: SocketAddr,
    pub body: Option<ClientBody>,

    pub headers_out: ResponseHead,

    /// Location bound at FIND_CONFIG.
    pub location: Option<Arc<Location>>,
    /// Remaining internal-redirect budget.
    pub uri_changes: u8,
    /// URI was rewritten since the last FIND_CONFIG pass.
    pub uri_changed: bool,
    /// Entered via internal redirect; may enter `internal` locations.
    pub internal: bool,
    pub subrequest_depth: u16,

    /// Tentative ACCESS denial under `satisfy any`, resolved at POST_ACCESS.
    pub tentative_denial: Option<StatusCode>,

    /// Set while serving an `error_page` target: the status the response
    /// must carry regardless of what the target handler would use.
    pub error_status: Option<StatusCode>,

    pub cache_status: Option<CacheStatus>,
    /// Peer that served (or last failed) this request, for the access log.
    pub upstream_addr: Option<SocketAddr>,

    /// Body bytes already emitted downstream. Non-zero disables failover.
    pub out_bytes: u64,
    pub start: Instant,

    cleanup: Vec<Finalizer>,
    finalized: bool,
}

impl Request {
    pub fn new(
        method: Method,
        version: Version,
        uri: String,
        args: String,
        host: String,
        headers_in: HeaderMap,
        client_addr: SocketAddr,
    ) -> Self {
        Self {
            method,
            version,
            uri,
            args,
            host,
            headers_in,
            client_addr,
            body: None,
            headers_out: ResponseHead::default(),
            location: None,
            uri_changes: MAX_URI_CHANGES,
            uri_changed: false,
            internal: false,
            subrequest_depth: 0,
            tentative_denial: None,
            error_status: None,
            cache_status: None,
            upstream_addr: None,
            out_bytes: 0,
            start: Instant::now(),
            cleanup: Vec::new(),
            finalized: false,
        }
    }

    /// Register a finalizer; finalizers run in LIFO order.
    pub fn add_cleanup(&mut self, f: impl FnOnce() + Send + 'static) {
        self.cleanup.push(Box::new(f));
    }

    /// Point the request at a new URI. Returns `false` when the redirect
    /// budget is exhausted.
    pub fn set_uri(&mut self, uri: String, args: String) -> bool {
        if self.uri_changes == 0 {
            return false;
        }
        self.uri_changes -= 1;
        self.uri = uri;
        self.args = args;
        self.uri_changed = true;
        true
    }

    /// Reset per-location response state for an internal redirect. Response
    /// headers captured so far (e.g. by an `X-Accel-Redirect` exchange) are
    /// kept; status and framing are re-derived by the new content handler.
    pub fn reset_for_redirect(&mut self) {
        self.location = None;
        let headers = std::mem::take(&mut self.headers_out.headers);
        self.headers_out = ResponseHead {
            status: StatusCode::OK,
            headers,
            content_length: None,
        };
        self.tentative_denial = None;
        self.internal = true;
    }

    /// Run the cleanup chain. Idempotent.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        while let Some(f) = self.cleanup.pop() {
            f();
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    fn request() -> Request {
        Request::new(
            Method::GET,
            Version::HTTP_11,
            "/x".to_string(),
            String::new(),
            "h".to_string(),
            HeaderMap::new(),
            "127.0.0.1:1234".parse().unwrap(),
        )
    }

    #[test]
    fn cleanup_runs_lifo_once() {
        let order = StdArc::new(std::sync::Mutex::new(Vec::new()));
        let mut r = request();
        for i in 0..3 {
            let order = order.clone();
            r.add_cleanup(move || order.lock().unwrap().push(i));
        }
        r.finalize();
        r.finalize();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn drop_is_a_finalize_backstop() {
        let count = StdArc::new(AtomicUsize::new(0));
        {
            let mut r = request();
            let count = count.clone();
            r.add_cleanup(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn uri_changes_is_a_decreasing_budget() {
        let mut r = request();
        for _ in 0..MAX_URI_CHANGES {
            assert!(r.set_uri("/y".to_string(), String::new()));
        }
        assert!(!r.set_uri("/z".to_string(), String::new()));
        assert_eq!(r.uri, "/y");
    }
}
