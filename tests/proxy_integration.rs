//! End-to-end scenarios over real sockets: a scripted origin server behind
//! the proxy, raw TCP clients in front of it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use talaria::config::Config;
use talaria::server::{self, ServerContext};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Start the proxy on an ephemeral port with the given TOML config.
async fn start_proxy(config_toml: &str) -> SocketAddr {
    let config: Config = toml::from_str(config_toml).expect("test config should parse");
    config.validate().expect("test config should validate");
    let ctx = ServerContext::build(&config).expect("context should build");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                break;
            };
            let ctx = ctx.clone();
            tokio::spawn(server::handle_connection(ctx, stream, peer));
        }
    });
    addr
}

/// A scripted origin: answers every connection with the same response
/// bytes after consuming the request head (and any body it announces).
fn start_origin(response: &'static [u8]) -> (SocketAddr, Arc<AtomicUsize>) {
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let listener = TcpListener::from_std(listener).unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) => return,
                        Ok(n) => {
                            buf.extend_from_slice(&chunk[..n]);
                            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        Err(_) => return,
                    }
                }
                let _ = stream.write_all(response).await;
                let _ = stream.flush().await;
                // Give the proxy a moment to drain before close.
                tokio::time::sleep(Duration::from_millis(50)).await;
            });
        }
    });

    (addr, connections)
}

/// Send one request and read the whole response (connection: close style).
async fn roundtrip(addr: SocketAddr, request: &str) -> (u16, String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => response.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) => break,
            Err(_) => panic!("response read timed out"),
        }
    }
    split_response(&response)
}

fn split_response(raw: &[u8]) -> (u16, String, Vec<u8>) {
    let head_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response should have a head")
        + 4;
    let head = String::from_utf8_lossy(&raw[..head_end]).into_owned();
    let status: u16 = head
        .split(' ')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code");
    (status, head, raw[head_end..].to_vec())
}

fn get(path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: test.local\r\nConnection: close\r\n\r\n")
}

/// Decode a chunked body back into plain bytes.
fn dechunk(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    loop {
        let line_end = raw[i..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .expect("chunk size line")
            + i;
        let size_text = std::str::from_utf8(&raw[i..line_end]).expect("chunk size utf8");
        let size = usize::from_str_radix(size_text.trim(), 16).expect("chunk size hex");
        i = line_end + 2;
        if size == 0 {
            break;
        }
        out.extend_from_slice(&raw[i..i + size]);
        i += size + 2;
    }
    out
}

// Plain proxying: one peer, one GET, body and headers relayed.
#[tokio::test]
async fn proxies_a_simple_get() {
    let (origin, _) =
        start_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Type: text/plain\r\n\r\nhello");
    let proxy = start_proxy(&format!(
        r#"
        [[upstream]]
        name = "backend"
        [[upstream.server]]
        addr = "{origin}"

        [[location]]
        pattern = "/"
        proxy_pass = "backend"
        "#
    ))
    .await;

    let (status, head, body) = roundtrip(proxy, &get("/x")).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"hello");
    assert!(head.contains("Content-Length: 5"), "head: {head}");
    assert!(head.to_lowercase().contains("content-type: text/plain"), "head: {head}");
}

// HTTP/1.0 downstream gets no keep-alive.
#[tokio::test]
async fn http10_response_is_close_delimited() {
    let (origin, _) = start_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
    let proxy = start_proxy(&format!(
        r#"
        [[upstream]]
        name = "backend"
        [[upstream.server]]
        addr = "{origin}"

        [[location]]
        pattern = "/"
        proxy_pass = "backend"
        "#
    ))
    .await;

    let (status, head, body) =
        roundtrip(proxy, "GET /x HTTP/1.0\r\nHost: test.local\r\n\r\n").await;
    assert_eq!(status, 200);
    assert_eq!(body, b"ok");
    assert!(!head.to_lowercase().contains("keep-alive"), "head: {head}");
}

// Connect refusal on the first peer fails over to the second.
#[tokio::test]
async fn fails_over_on_connect_refused() {
    // A port that was just freed refuses connections.
    let dead = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    };
    let (origin, origin_conns) = start_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nlive");

    let proxy = start_proxy(&format!(
        r#"
        [[upstream]]
        name = "backend"
        [[upstream.server]]
        addr = "{dead}"
        [[upstream.server]]
        addr = "{origin}"

        [[location]]
        pattern = "/"
        proxy_pass = "backend"
        "#
    ))
    .await;

    let (status, _, body) = roundtrip(proxy, &get("/a")).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"live");

    // The dead peer is inside its fail window now; the next request goes
    // straight to the live one.
    let (status, _, body) = roundtrip(proxy, &get("/b")).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"live");
    assert_eq!(origin_conns.load(Ordering::SeqCst), 2);
}

// All peers down: 502.
#[tokio::test]
async fn bad_gateway_when_no_peer_answers() {
    let dead = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    };
    let proxy = start_proxy(&format!(
        r#"
        [[upstream]]
        name = "backend"
        [[upstream.server]]
        addr = "{dead}"

        [[location]]
        pattern = "/"
        proxy_pass = "backend"
        "#
    ))
    .await;

    let (status, _, _) = roundtrip(proxy, &get("/x")).await;
    assert_eq!(status, 502);
}

// A cacheable response is stored; the repeat request never reaches the origin.
#[tokio::test]
async fn caches_and_serves_hits() {
    let (origin, origin_conns) = start_origin(
        b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nCache-Control: max-age=60\r\n\r\nabc",
    );
    let cache_dir = tempfile::tempdir().unwrap();
    let temp_dir = tempfile::tempdir().unwrap();

    let proxy = start_proxy(&format!(
        r#"
        [server]
        temp_path = "{temp}"

        [[upstream]]
        name = "backend"
        [[upstream.server]]
        addr = "{origin}"

        [[cache_path]]
        name = "zone1"
        path = "{cache}"

        [[location]]
        pattern = "/"
        proxy_pass = "backend"
        proxy_cache = "zone1"
        "#,
        temp = temp_dir.path().display(),
        cache = cache_dir.path().display(),
        origin = origin,
    ))
    .await;

    let (status, _, body) = roundtrip(proxy, &get("/item")).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"abc");

    tokio::time::sleep(Duration::from_millis(300)).await;

    let (status, head, body) = roundtrip(proxy, &get("/item")).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"abc");
    assert!(head.contains("Content-Length: 3"), "head: {head}");
    assert_eq!(
        origin_conns.load(Ordering::SeqCst),
        1,
        "cache hit must not contact the origin"
    );
}

// A self-referential error_page terminates at the redirect budget.
#[tokio::test]
async fn error_page_loop_is_bounded() {
    let proxy = start_proxy(
        r#"
        [[location]]
        pattern = "/err"
        return = 500
        recursive_error_pages = true
        error_page = [{ codes = [500], uri = "/err" }]
        "#,
    )
    .await;

    let (status, _, body) = roundtrip(proxy, &get("/err")).await;
    assert_eq!(status, 500);
    assert!(String::from_utf8_lossy(&body).contains("500"));
}

// X-Accel-Redirect swaps in the static file; the upstream body is discarded.
#[tokio::test]
async fn x_accel_redirect_serves_internal_file() {
    let docs = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(docs.path().join("static")).unwrap();
    std::fs::write(docs.path().join("static/f.txt"), b"the real payload").unwrap();

    let (origin, _) = start_origin(
        b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\nX-Accel-Redirect: /static/f.txt\r\n\r\nIGNORED",
    );

    let proxy = start_proxy(&format!(
        r#"
        [[upstream]]
        name = "backend"
        [[upstream.server]]
        addr = "{origin}"

        [[location]]
        pattern = "/files/"
        proxy_pass = "backend"

        [[location]]
        pattern = "/static/"
        internal = true
        root = "{root}"
        "#,
        origin = origin,
        root = docs.path().display(),
    ))
    .await;

    let (status, _, body) = roundtrip(proxy, &get("/files/whatever")).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"the real payload");

    // The internal location is not reachable from outside.
    let (status, _, _) = roundtrip(proxy, &get("/static/f.txt")).await;
    assert_eq!(status, 404);
}

// With ignore_client_abort the fetch completes and populates the
// cache even though the client disappeared mid-transfer.
#[tokio::test]
async fn client_abort_still_populates_cache_when_ignored() {
    // Slow origin: head, half the body, pause, the rest.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let origin = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let listener = TcpListener::from_std(listener).unwrap();
    let origin_conns = Arc::new(AtomicUsize::new(0));
    let counter = origin_conns.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\nCache-Control: max-age=60\r\n\r\nslow")
                    .await;
                tokio::time::sleep(Duration::from_millis(400)).await;
                let _ = stream.write_all(b"body").await;
            });
        }
    });

    let cache_dir = tempfile::tempdir().unwrap();
    let temp_dir = tempfile::tempdir().unwrap();
    let proxy = start_proxy(&format!(
        r#"
        [server]
        temp_path = "{temp}"

        [[upstream]]
        name = "backend"
        [[upstream.server]]
        addr = "{origin}"

        [[cache_path]]
        name = "zone1"
        path = "{cache}"

        [[location]]
        pattern = "/"
        proxy_pass = "backend"
        proxy_cache = "zone1"
        proxy_ignore_client_abort = true
        "#,
        temp = temp_dir.path().display(),
        cache = cache_dir.path().display(),
        origin = origin,
    ))
    .await;

    // Client reads the head then vanishes.
    {
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream.write_all(get("/slow").as_bytes()).await.unwrap();
        let mut chunk = [0u8; 256];
        let _ = stream.read(&mut chunk).await;
    }

    // Let the abandoned fetch run to completion.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let (status, _, body) = roundtrip(proxy, &get("/slow")).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"slowbody");
    assert_eq!(
        origin_conns.load(Ordering::SeqCst),
        1,
        "second request must be a cache hit"
    );
}

// use_stale=error: an expired entry is served when every peer is down.
#[tokio::test]
async fn stale_entry_served_when_upstream_dies() {
    // Origin that accepts exactly one connection, then goes away.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let origin = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let listener = TcpListener::from_std(listener).unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nCache-Control: max-age=1\r\n\r\nabc",
                )
                .await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        // Listener drops here; later connects are refused.
    });

    let cache_dir = tempfile::tempdir().unwrap();
    let temp_dir = tempfile::tempdir().unwrap();
    let proxy = start_proxy(&format!(
        r#"
        [server]
        temp_path = "{temp}"

        [[upstream]]
        name = "backend"
        [[upstream.server]]
        addr = "{origin}"

        [[cache_path]]
        name = "zone1"
        path = "{cache}"

        [[location]]
        pattern = "/"
        proxy_pass = "backend"
        proxy_cache = "zone1"
        proxy_cache_use_stale = ["error"]
        "#,
        temp = temp_dir.path().display(),
        cache = cache_dir.path().display(),
        origin = origin,
    ))
    .await;

    let (status, _, body) = roundtrip(proxy, &get("/stale")).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"abc");

    // Entry expires; origin is gone.
    tokio::time::sleep(Duration::from_millis(2200)).await;

    let (status, _, body) = roundtrip(proxy, &get("/stale")).await;
    assert_eq!(status, 200, "stale entry should mask the upstream failure");
    assert_eq!(body, b"abc");
}

// Keepalive: two requests on one downstream connection.
#[tokio::test]
async fn downstream_keepalive_serves_sequential_requests() {
    let (origin, _) = start_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
    let proxy = start_proxy(&format!(
        r#"
        [[upstream]]
        name = "backend"
        [[upstream.server]]
        addr = "{origin}"

        [[location]]
        pattern = "/"
        proxy_pass = "backend"
        "#
    ))
    .await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    for _ in 0..2 {
        stream
            .write_all(b"GET /k HTTP/1.1\r\nHost: test.local\r\n\r\n")
            .await
            .unwrap();
        // Read exactly one response: head + 2 body bytes.
        let mut collected = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
                .await
                .expect("keepalive read timed out")
                .unwrap();
            assert!(n > 0, "connection closed unexpectedly");
            collected.extend_from_slice(&chunk[..n]);
            if let Some(head_end) = collected.windows(4).position(|w| w == b"\r\n\r\n") {
                if collected.len() >= head_end + 4 + 2 {
                    break;
                }
            }
        }
        let (status, _, body) = split_response(&collected);
        assert_eq!(status, 200);
        assert_eq!(body, b"ok");
    }
}

// ACCESS phase: deny all.
#[tokio::test]
async fn deny_all_yields_403() {
    let proxy = start_proxy(
        r#"
        [[location]]
        pattern = "/admin/"
        deny = ["all"]
        "#,
    )
    .await;

    let (status, _, _) = roundtrip(proxy, &get("/admin/panel")).await;
    assert_eq!(status, 403);
}

// try_files picks the first existing path, falls back otherwise.
#[tokio::test]
async fn try_files_serves_existing_and_falls_back() {
    let docs = tempfile::tempdir().unwrap();
    std::fs::write(docs.path().join("present.txt"), b"found").unwrap();
    std::fs::write(docs.path().join("fallback.html"), b"fb").unwrap();

    let proxy = start_proxy(&format!(
        r#"
        [[location]]
        pattern = "/"
        root = "{root}"
        try_files = ["$uri", "/fallback.html"]
        "#,
        root = docs.path().display(),
    ))
    .await;

    let (status, _, body) = roundtrip(proxy, &get("/present.txt")).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"found");

    let (status, _, body) = roundtrip(proxy, &get("/missing.txt")).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"fb");
}

// add_before_body/add_after_body: subrequest output wraps the main body
// in strict preorder, and the composed response switches to chunked.
#[tokio::test]
async fn body_additions_wrap_the_main_response() {
    let docs = tempfile::tempdir().unwrap();
    std::fs::write(docs.path().join("header.html"), b"<<").unwrap();
    std::fs::write(docs.path().join("main.txt"), b"MAIN").unwrap();
    std::fs::write(docs.path().join("footer.html"), b">>").unwrap();

    let proxy = start_proxy(&format!(
        r#"
        [[location]]
        pattern = "/"
        root = "{root}"
        add_before_body = "/header.html"
        add_after_body = "/footer.html"
        "#,
        root = docs.path().display(),
    ))
    .await;

    let (status, head, body) = roundtrip(proxy, &get("/main.txt")).await;
    assert_eq!(status, 200);
    assert!(head.contains("Transfer-Encoding: chunked"), "head: {head}");
    assert!(!head.contains("Content-Length"), "head: {head}");
    assert_eq!(dechunk(&body), b"<<MAIN>>");

    // Asking for an addition source directly is a main request too, so it
    // gets wrapped like anything else under this location — while the
    // subrequests it spawns are served plain (no recursive composition).
    let (status, _, body) = roundtrip(proxy, &get("/header.html")).await;
    assert_eq!(status, 200);
    assert_eq!(dechunk(&body), b"<<<<>>");
}

// Unknown URIs produce the built-in 404 page.
#[tokio::test]
async fn missing_file_is_404() {
    let docs = tempfile::tempdir().unwrap();
    let proxy = start_proxy(&format!(
        r#"
        [[location]]
        pattern = "/"
        root = "{root}"
        "#,
        root = docs.path().display(),
    ))
    .await;

    let (status, head, body) = roundtrip(proxy, &get("/nothing")).await;
    assert_eq!(status, 404);
    assert!(String::from_utf8_lossy(&body).contains("404"));
    assert!(head.contains("Content-Length"), "head: {head}");
}

// Oversized request bodies are rejected with 413.
#[tokio::test]
async fn oversized_body_is_rejected() {
    let proxy = start_proxy(
        r#"
        [server]
        client_max_body_size = 16
        "#,
    )
    .await;

    let request = format!(
        "POST /up HTTP/1.1\r\nHost: t\r\nContent-Length: 64\r\nConnection: close\r\n\r\n{}",
        "x".repeat(64)
    );
    let (status, _, _) = roundtrip(proxy, &request).await;
    assert_eq!(status, 413);
}
