use crate::location::ProxyOptions;
use crate::request::ResponseHead;
use anyhow::Result;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use std::collections::HashSet;
use std::time::{Duration, SystemTime};

/// Headers the proxy never forwards downstream unless explicitly passed.
/// `Date` and `Server` are re-emitted by the serializer; the `X-Accel-*`
/// family is an internal control channel.
const DEFAULT_HIDE: &[&str] = &[
    "date",
    "server",
    "x-pad",
    "x-accel-expires",
    "x-accel-redirect",
    "x-accel-limit-rate",
    "x-accel-buffering",
    "x-accel-charset",
];

/// Hop-by-hop headers, dropped in both directions.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Compute the hide set at config time: built-in defaults, plus
/// `hide_headers`, minus `pass_headers`, hashed for O(1) lookups.
pub fn build_hide_set(hide: &[String], pass: &[String]) -> Result<HashSet<HeaderName>> {
    let mut set = HashSet::new();
    for name in DEFAULT_HIDE.iter().map(|s| s.to_string()).chain(hide.iter().cloned()) {
        set.insert(HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())?);
    }
    for name in pass {
        let name = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())?;
        set.remove(&name);
    }
    Ok(set)
}

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Semantic facts extracted from an upstream response head. This is the
/// "process" side of the disposition table; the "copy" side is
/// [`copy_response_headers`].
#[derive(Debug)]
pub struct UpstreamInfo {
    pub status: StatusCode,
    /// `None` means length unknown (chunked or connection-close framing).
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub connection_close: bool,
    pub last_modified: Option<SystemTime>,
    pub etag: Option<String>,
    pub x_accel_redirect: Option<String>,
    /// Validity window from `X-Accel-Expires` > `Cache-Control: max-age` >
    /// `Expires`, when any of them is present.
    pub cache_ttl: Option<Duration>,
    /// `Cache-Control: no-cache | no-store | private` or `X-Accel-Expires: 0`.
    pub no_cache: bool,
    /// `Vary: *` or an overlong `Vary` disables caching for this response.
    pub vary_uncacheable: bool,
}

pub fn process_response_headers(status: StatusCode, headers: &HeaderMap) -> UpstreamInfo {
    let mut info = UpstreamInfo {
        status,
        content_length: None,
        chunked: false,
        connection_close: false,
        last_modified: None,
        etag: None,
        x_accel_redirect: None,
        cache_ttl: None,
        no_cache: false,
        vary_uncacheable: false,
    };

    if let Some(v) = header_str(headers, "transfer-encoding") {
        info.chunked = v.to_ascii_lowercase().contains("chunked");
    }
    if !info.chunked {
        info.content_length = header_str(headers, "content-length").and_then(|v| v.parse().ok());
    }
    if let Some(v) = header_str(headers, "connection") {
        info.connection_close = v.to_ascii_lowercase().contains("close");
    }
    info.last_modified =
        header_str(headers, "last-modified").and_then(|v| httpdate::parse_http_date(v).ok());
    info.etag = header_str(headers, "etag").map(|v| v.to_string());
    info.x_accel_redirect = header_str(headers, "x-accel-redirect").map(|v| v.to_string());

    // Validity precedence: X-Accel-Expires, then Cache-Control, then Expires.
    if let Some(v) = header_str(headers, "x-accel-expires") {
        match v.trim().parse::<u64>() {
            Ok(0) => info.no_cache = true,
            Ok(secs) => info.cache_ttl = Some(Duration::from_secs(secs)),
            Err(_) => {}
        }
    } else if let Some(v) = header_str(headers, "cache-control") {
        let v = v.to_ascii_lowercase();
        if v.contains("no-cache") || v.contains("no-store") || v.contains("private") {
            info.no_cache = true;
        } else if let Some(age) = parse_max_age(&v) {
            info.cache_ttl = Some(Duration::from_secs(age));
        }
    } else if let Some(v) = header_str(headers, "expires") {
        if let Ok(when) = httpdate::parse_http_date(v) {
            match when.duration_since(SystemTime::now()) {
                Ok(ttl) => info.cache_ttl = Some(ttl),
                Err(_) => info.no_cache = true,
            }
        }
    }

    if let Some(v) = header_str(headers, "vary") {
        if v == "*" || v.len() > 64 {
            info.vary_uncacheable = true;
        }
    }

    info
}

/// Copy upstream response headers into the downstream head, applying the
/// hide set, dropping hop-by-hop headers, and rewriting 3xx `Location`
/// values that point back at the upstream peer.
pub fn copy_response_headers(
    upstream_headers: &HeaderMap,
    info: &UpstreamInfo,
    opts: &ProxyOptions,
    upstream_authority: &str,
    out: &mut ResponseHead,
) {
    out.status = info.status;
    out.content_length = info.content_length;

    for (name, value) in upstream_headers {
        if is_hop_by_hop(name) || opts.hide_headers.contains(name) {
            continue;
        }
        if *name == http::header::CONTENT_LENGTH {
            continue;
        }
        if *name == http::header::LOCATION
            && info.status.is_redirection()
            && opts.redirect_rewrite
        {
            if let Some(rewritten) = rewrite_location(value, upstream_authority) {
                out.headers.append(http::header::LOCATION, rewritten);
                continue;
            }
        }
        out.headers.append(name.clone(), value.clone());
    }
}

/// `http://<peer><path>` → `<path>` so the client retries through the proxy.
fn rewrite_location(value: &HeaderValue, upstream_authority: &str) -> Option<HeaderValue> {
    let v = value.to_str().ok()?;
    let rest = v.strip_prefix("http://")?;
    let path = rest.strip_prefix(upstream_authority)?;
    if path.is_empty() {
        return HeaderValue::from_str("/").ok();
    }
    if !path.starts_with('/') {
        return None;
    }
    HeaderValue::from_str(path).ok()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_max_age(cache_control: &str) -> Option<u64> {
    for part in cache_control.split(',') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("max-age=") {
            return v.trim().parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    fn default_opts() -> ProxyOptions {
        ProxyOptions {
            upstream: "backend".to_string(),
            buffering: true,
            buffer_size: 8192,
            bufs_num: 8,
            max_temp_file_size: 1 << 30,
            connect_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            next_upstream: Default::default(),
            next_upstream_tries: 0,
            next_upstream_timeout: None,
            ignore_client_abort: false,
            redirect_rewrite: true,
            hide_headers: build_hide_set(&[], &[]).unwrap(),
            cache: None,
        }
    }

    #[test]
    fn content_length_and_chunked_are_mutually_exclusive() {
        let info = process_response_headers(
            StatusCode::OK,
            &headers(&[("content-length", "10"), ("transfer-encoding", "chunked")]),
        );
        assert!(info.chunked);
        assert_eq!(info.content_length, None);
    }

    #[test]
    fn cache_control_max_age() {
        let info =
            process_response_headers(StatusCode::OK, &headers(&[("cache-control", "max-age=60")]));
        assert_eq!(info.cache_ttl, Some(Duration::from_secs(60)));
        assert!(!info.no_cache);
    }

    #[test]
    fn x_accel_expires_beats_cache_control() {
        let info = process_response_headers(
            StatusCode::OK,
            &headers(&[("x-accel-expires", "5"), ("cache-control", "max-age=60")]),
        );
        assert_eq!(info.cache_ttl, Some(Duration::from_secs(5)));
    }

    #[test]
    fn no_store_disables_caching() {
        let info = process_response_headers(
            StatusCode::OK,
            &headers(&[("cache-control", "no-store")]),
        );
        assert!(info.no_cache);
    }

    #[test]
    fn vary_star_is_uncacheable() {
        let info = process_response_headers(StatusCode::OK, &headers(&[("vary", "*")]));
        assert!(info.vary_uncacheable);
    }

    #[test]
    fn copy_hides_internal_and_hop_headers() {
        let up = headers(&[
            ("content-type", "text/plain"),
            ("x-accel-expires", "30"),
            ("connection", "keep-alive"),
            ("set-cookie", "a=1"),
            ("set-cookie", "b=2"),
        ]);
        let info = process_response_headers(StatusCode::OK, &up);
        let mut out = ResponseHead::default();
        copy_response_headers(&up, &info, &default_opts(), "127.0.0.1:9000", &mut out);

        assert!(out.headers.contains_key("content-type"));
        assert!(!out.headers.contains_key("x-accel-expires"));
        assert!(!out.headers.contains_key("connection"));
        assert_eq!(out.headers.get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn redirect_location_is_rewritten_to_downstream_form() {
        let up = headers(&[("location", "http://127.0.0.1:9000/new/place")]);
        let info = process_response_headers(StatusCode::MOVED_PERMANENTLY, &up);
        let mut out = ResponseHead::default();
        copy_response_headers(&up, &info, &default_opts(), "127.0.0.1:9000", &mut out);
        assert_eq!(out.headers.get("location").unwrap(), "/new/place");
    }

    #[test]
    fn foreign_location_passes_untouched() {
        let up = headers(&[("location", "http://other.example/x")]);
        let info = process_response_headers(StatusCode::FOUND, &up);
        let mut out = ResponseHead::default();
        copy_response_headers(&up, &info, &default_opts(), "127.0.0.1:9000", &mut out);
        assert_eq!(out.headers.get("location").unwrap(), "http://other.example/x");
    }

    #[test]
    fn hide_set_respects_pass_list() {
        let set = build_hide_set(&["x-internal".to_string()], &["server".to_string()]).unwrap();
        assert!(set.contains(&HeaderName::from_static("x-internal")));
        assert!(set.contains(&HeaderName::from_static("x-accel-redirect")));
        assert!(!set.contains(&HeaderName::from_static("server")));
    }
}
