use crate::error::ProxyError;
use crate::location::Location;
use crate::request::Request;
use crate::server::output::OutputChain;
use bytes::Bytes;
use http::{HeaderValue, Method, StatusCode};
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncReadExt;

const READ_CHUNK: usize = 64 * 1024;

/// What the static handler decided for a URI.
#[derive(Debug)]
pub enum StaticOutcome {
    /// Response fully sent.
    Served,
    /// The mapped path is a directory.
    Forbidden,
    NotFound,
}

/// Map a URI onto the location's document root, refusing traversal.
pub fn map_path(loc: &Location, uri: &str) -> Option<PathBuf> {
    let rel = uri.trim_start_matches('/');
    let candidate = loc.root.join(rel);
    for part in Path::new(rel).components() {
        if matches!(part, Component::ParentDir) {
            return None;
        }
    }
    Some(candidate)
}

/// Serve a regular file from the location's root: content type from the
/// extension, `Last-Modified` from the filesystem, `304` on a matching
/// `If-Modified-Since`.
pub async fn serve(
    r: &mut Request,
    loc: &Location,
    out: &mut dyn OutputChain,
) -> Result<StaticOutcome, ProxyError> {
    let Some(path) = map_path(loc, &r.uri) else {
        return Ok(StaticOutcome::NotFound);
    };

    let meta = match tokio::fs::metadata(&path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StaticOutcome::NotFound),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Ok(StaticOutcome::Forbidden)
        }
        Err(e) => return Err(ProxyError::CacheIo(e)),
    };
    if meta.is_dir() {
        return Ok(StaticOutcome::Forbidden);
    }

    let modified = meta.modified().ok();

    // If-Modified-Since: timestamps have second granularity.
    if let (Some(modified), Some(since)) = (
        modified,
        r.headers_in
            .get("if-modified-since")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok()),
    ) {
        let m = modified
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let s = since
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if m <= s {
            r.headers_out.status = StatusCode::NOT_MODIFIED;
            r.headers_out.content_length = None;
            out.send_head(&r.headers_out)
                .await
                .map_err(|_| ProxyError::ClientGone)?;
            out.finish().await.map_err(|_| ProxyError::ClientGone)?;
            return Ok(StaticOutcome::Served);
        }
    }

    r.headers_out.status = r.error_status.unwrap_or(StatusCode::OK);
    r.headers_out.content_length = Some(meta.len());
    r.headers_out.headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static(super::mime_type(&path)),
    );
    if let Some(modified) = modified {
        if let Ok(v) = HeaderValue::from_str(&httpdate::fmt_http_date(modified)) {
            r.headers_out.headers.insert(http::header::LAST_MODIFIED, v);
        }
    }

    out.send_head(&r.headers_out)
        .await
        .map_err(|_| ProxyError::ClientGone)?;

    if r.method != Method::HEAD {
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(ProxyError::CacheIo)?;
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = file.read(&mut buf).await.map_err(ProxyError::CacheIo)?;
            if n == 0 {
                break;
            }
            out.send_data(Bytes::copy_from_slice(&buf[..n]))
                .await
                .map_err(|_| ProxyError::ClientGone)?;
        }
    }
    out.finish().await.map_err(|_| ProxyError::ClientGone)?;
    Ok(StaticOutcome::Served)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LocationConfig, LocationModifier, ServerConfig};
    use crate::server::output::BufferedOutput;
    use http::{HeaderMap, Version};
    use std::sync::Arc;

    fn location(root: &Path) -> Arc<Location> {
        let config: LocationConfig = toml::from_str(&format!(
            "pattern = '/'\nroot = '{}'",
            root.display()
        ))
        .unwrap();
        assert_eq!(config.modifier, LocationModifier::Prefix);
        Location::compile(&config, &ServerConfig::default()).unwrap()
    }

    fn request(uri: &str) -> Request {
        Request::new(
            Method::GET,
            Version::HTTP_11,
            uri.to_string(),
            String::new(),
            "h".to_string(),
            HeaderMap::new(),
            "127.0.0.1:9".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn serves_a_file_with_headers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hi there").unwrap();
        let loc = location(dir.path());
        let mut r = request("/hello.txt");
        let mut out = BufferedOutput::new();

        let outcome = serve(&mut r, &loc, &mut out).await.unwrap();
        assert!(matches!(outcome, StaticOutcome::Served));
        assert_eq!(out.status, Some(StatusCode::OK));
        assert_eq!(out.body(), b"hi there");
        assert_eq!(
            r.headers_out.headers.get("content-type").unwrap(),
            "text/plain; charset=utf-8"
        );
        assert!(r.headers_out.headers.contains_key("last-modified"));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let loc = location(dir.path());
        let mut r = request("/nope.txt");
        let mut out = BufferedOutput::new();
        assert!(matches!(
            serve(&mut r, &loc, &mut out).await.unwrap(),
            StaticOutcome::NotFound
        ));
    }

    #[tokio::test]
    async fn directory_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let loc = location(dir.path());
        let mut r = request("/sub");
        let mut out = BufferedOutput::new();
        assert!(matches!(
            serve(&mut r, &loc, &mut out).await.unwrap(),
            StaticOutcome::Forbidden
        ));
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let loc = location(dir.path());
        let mut r = request("/../etc/passwd");
        let mut out = BufferedOutput::new();
        assert!(matches!(
            serve(&mut r, &loc, &mut out).await.unwrap(),
            StaticOutcome::NotFound
        ));
    }

    #[tokio::test]
    async fn if_modified_since_yields_304() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let loc = location(dir.path());
        let mut r = request("/a.txt");
        r.headers_in.insert(
            "if-modified-since",
            HeaderValue::from_str(&httpdate::fmt_http_date(
                std::time::SystemTime::now() + std::time::Duration::from_secs(60),
            ))
            .unwrap(),
        );
        let mut out = BufferedOutput::new();
        serve(&mut r, &loc, &mut out).await.unwrap();
        assert_eq!(out.status, Some(StatusCode::NOT_MODIFIED));
        assert!(out.body().is_empty());
    }

    #[tokio::test]
    async fn head_sends_no_body() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"body").unwrap();
        let loc = location(dir.path());
        let mut r = request("/a.txt");
        r.method = Method::HEAD;
        let mut out = BufferedOutput::new();
        serve(&mut r, &loc, &mut out).await.unwrap();
        assert_eq!(out.status, Some(StatusCode::OK));
        assert!(out.body().is_empty());
        assert_eq!(r.headers_out.content_length, Some(4));
    }
}
