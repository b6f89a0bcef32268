use super::output::{AbortProbe, OutputChain};
use crate::error::ProxyError;
use crate::request::ResponseHead;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Upper bound on a request head; anything larger is a 400.
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// A parsed downstream request head.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub version: Version,
    pub uri: String,
    pub args: String,
    pub host: String,
    pub headers: HeaderMap,
    pub content_length: u64,
    pub wants_keepalive: bool,
}

/// What a head read produced.
#[derive(Debug)]
pub enum ReadHead {
    Request(RequestHead),
    /// Clean close between requests.
    Closed,
}

/// One downstream connection: the HTTP/1 framing layer and the head of the
/// output-filter chain.
pub struct Downstream {
    stream: TcpStream,
    pub peer: SocketAddr,
    read_buf: BytesMut,
    /// Downstream write idle timeout.
    send_timeout: Duration,

    // Per-response state.
    version: Version,
    keepalive: bool,
    head_is_head_method: bool,
    chunked: bool,
    head_sent: bool,
    finished: bool,
    body_bytes: u64,
    /// Frame overhead (chunk headers/trailers) awaiting a readiness write.
    pending: BytesMut,
    /// Payload bytes left in the chunk currently on the wire.
    chunk_remaining: usize,
}

impl Downstream {
    pub fn new(stream: TcpStream, peer: SocketAddr, send_timeout: Duration) -> Self {
        Self {
            stream,
            peer,
            read_buf: BytesMut::with_capacity(4096),
            send_timeout,
            version: Version::HTTP_11,
            keepalive: false,
            head_is_head_method: false,
            chunked: false,
            head_sent: false,
            finished: false,
            body_bytes: 0,
            pending: BytesMut::new(),
            chunk_remaining: 0,
        }
    }

    /// Read and parse the next request head. `idle_timeout` bounds the wait
    /// for the first byte.
    pub async fn read_request_head(
        &mut self,
        idle_timeout: Duration,
    ) -> Result<ReadHead, ProxyError> {
        loop {
            if let Some(head_len) = find_crlfcrlf(&self.read_buf) {
                let head = self.read_buf.split_to(head_len);
                return parse_request_head(&head).map(ReadHead::Request);
            }
            if self.read_buf.len() > MAX_HEAD_SIZE {
                return Err(ProxyError::ClientBad("request head too large".into()));
            }

            let idle = self.read_buf.is_empty();
            let stream = &mut self.stream;
            let read_buf = &mut self.read_buf;
            let read = tokio::time::timeout(idle_timeout, async {
                loop {
                    stream.readable().await?;
                    match stream.try_read_buf(read_buf) {
                        Ok(n) => return Ok::<usize, std::io::Error>(n),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                        Err(e) => return Err(e),
                    }
                }
            })
            .await;

            match read {
                Ok(Ok(0)) => {
                    if idle {
                        return Ok(ReadHead::Closed);
                    }
                    return Err(ProxyError::ClientBad("connection closed mid-head".into()));
                }
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => return Err(ProxyError::ClientGone),
                Err(_) => {
                    // An idle keepalive connection timing out is a clean
                    // close; only a half-received head is an error.
                    if idle {
                        return Ok(ReadHead::Closed);
                    }
                    return Err(ProxyError::ClientTimeout);
                }
            }
        }
    }

    /// Read `len` request-body bytes using the connection's buffer as the
    /// prefix source.
    pub async fn read_body(
        &mut self,
        opts: &crate::request::body::BodyReadOptions,
    ) -> Result<crate::request::ClientBody, ProxyError> {
        let mut prefix = std::mem::take(&mut self.read_buf);
        let result =
            crate::request::body::read_client_body(&mut self.stream, &mut prefix, opts).await;
        self.read_buf = prefix;
        result
    }

    /// Reset per-response framing state before running a request.
    pub fn begin_response(&mut self, version: Version, head_method: bool, keepalive: bool) {
        self.version = version;
        self.head_is_head_method = head_method;
        self.keepalive = keepalive;
        self.chunked = false;
        self.head_sent = false;
        self.finished = false;
        self.body_bytes = 0;
        self.pending.clear();
        self.chunk_remaining = 0;
    }

    /// Whether the connection survives into another request.
    pub fn will_keepalive(&self) -> bool {
        self.keepalive && self.finished
    }

    /// Lingering close: consume what the client already sent so the final
    /// response is not clobbered by a reset when we close with unread data.
    pub async fn drain_before_close(&mut self) {
        let deadline = Duration::from_millis(500);
        let _ = tokio::time::timeout(deadline, async {
            let mut sink = [0u8; 4096];
            loop {
                self.stream.readable().await?;
                match self.stream.try_read(&mut sink) {
                    Ok(0) => return Ok::<(), std::io::Error>(()),
                    Ok(_) => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            }
        })
        .await;
    }

    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match tokio::time::timeout(self.send_timeout, self.stream.write_all(data)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::ErrorKind::TimedOut.into()),
        }
    }
}

#[async_trait]
impl OutputChain for Downstream {
    async fn send_head(&mut self, head: &ResponseHead) -> std::io::Result<()> {
        debug_assert!(!self.head_sent);
        let status = head.status;
        let bodyless = status_is_bodyless(status);

        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(match self.version {
            Version::HTTP_10 => b"HTTP/1.0 ",
            _ => b"HTTP/1.1 ",
        });
        buf.put_slice(status.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(status.canonical_reason().unwrap_or("").as_bytes());
        buf.put_slice(b"\r\n");

        buf.put_slice(b"Server: talaria\r\nDate: ");
        buf.put_slice(httpdate::fmt_http_date(std::time::SystemTime::now()).as_bytes());
        buf.put_slice(b"\r\n");

        if bodyless {
            self.finished = true;
        } else {
            match head.content_length {
                Some(len) => {
                    buf.put_slice(b"Content-Length: ");
                    buf.put_slice(len.to_string().as_bytes());
                    buf.put_slice(b"\r\n");
                }
                None => {
                    if self.version == Version::HTTP_10 {
                        // No chunked framing on 1.0: close delimits the body.
                        self.keepalive = false;
                    } else {
                        self.chunked = true;
                        buf.put_slice(b"Transfer-Encoding: chunked\r\n");
                    }
                }
            }
        }

        if self.keepalive {
            if self.version == Version::HTTP_10 {
                buf.put_slice(b"Connection: keep-alive\r\n");
            }
        } else {
            buf.put_slice(b"Connection: close\r\n");
        }

        for (name, value) in &head.headers {
            buf.put_slice(name.as_str().as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");

        self.write_all(&buf).await?;
        self.head_sent = true;
        if self.head_is_head_method {
            // No body follows a HEAD response regardless of framing.
            self.finished = true;
        }
        Ok(())
    }

    async fn send_data(&mut self, data: Bytes) -> std::io::Result<()> {
        if data.is_empty() || self.finished {
            return Ok(());
        }
        if self.chunked {
            let header = format!("{:x}\r\n", data.len());
            self.write_all(header.as_bytes()).await?;
            self.write_all(&data).await?;
            self.write_all(b"\r\n").await?;
        } else {
            self.write_all(&data).await?;
        }
        self.body_bytes += data.len() as u64;
        Ok(())
    }

    async fn finish(&mut self) -> std::io::Result<()> {
        if self.finished {
            return Ok(());
        }
        if self.chunked {
            self.write_all(b"0\r\n\r\n").await?;
        }
        self.stream.flush().await?;
        self.finished = true;
        Ok(())
    }

    async fn ready(&mut self) -> std::io::Result<()> {
        self.stream.writable().await
    }

    fn try_send(&mut self, data: &[u8]) -> std::io::Result<usize> {
        if self.finished {
            return Ok(data.len());
        }

        // Frame overhead goes out before any payload.
        while !self.pending.is_empty() {
            match self.stream.try_write(&self.pending) {
                Ok(n) => {
                    let _ = self.pending.split_to(n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(0),
                Err(e) => return Err(e),
            }
        }
        if data.is_empty() {
            return Ok(0);
        }

        if self.chunked && self.chunk_remaining == 0 {
            self.pending
                .extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
            self.chunk_remaining = data.len();
            // Try again to push the header through immediately.
            while !self.pending.is_empty() {
                match self.stream.try_write(&self.pending) {
                    Ok(n) => {
                        let _ = self.pending.split_to(n);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(0),
                    Err(e) => return Err(e),
                }
            }
        }

        let limit = if self.chunked {
            data.len().min(self.chunk_remaining)
        } else {
            data.len()
        };
        match self.stream.try_write(&data[..limit]) {
            Ok(n) => {
                self.body_bytes += n as u64;
                if self.chunked {
                    self.chunk_remaining -= n;
                    if self.chunk_remaining == 0 {
                        self.pending.extend_from_slice(b"\r\n");
                    }
                }
                Ok(n)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn probe_abort(&mut self) -> AbortProbe {
        // A zero-byte-style probe: reading appends to the connection buffer
        // so pipelined bytes are preserved for the next request.
        match self.stream.try_read_buf(&mut self.read_buf) {
            Ok(0) => AbortProbe::Closed,
            Ok(_) => AbortProbe::Alive,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => AbortProbe::Alive,
            Err(_) => AbortProbe::Closed,
        }
    }

    fn bytes_sent(&self) -> u64 {
        self.body_bytes
    }

    fn head_sent(&self) -> bool {
        self.head_sent
    }
}

/// Responses that never carry a body.
fn status_is_bodyless(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

fn find_crlfcrlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn parse_request_head(head: &[u8]) -> Result<RequestHead, ProxyError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| ProxyError::ClientBad("non-utf8 request head".into()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split(' ');
    let method: Method = parts
        .next()
        .unwrap_or("")
        .parse()
        .map_err(|_| ProxyError::ClientBad("bad method".into()))?;
    let target = parts
        .next()
        .ok_or_else(|| ProxyError::ClientBad("missing request target".into()))?;
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::HTTP_11,
        Some("HTTP/1.0") => Version::HTTP_10,
        Some(other) => {
            return Err(ProxyError::ClientBad(format!(
                "unsupported version '{other}'"
            )))
        }
        None => return Err(ProxyError::ClientBad("missing version".into())),
    };
    if parts.next().is_some() {
        return Err(ProxyError::ClientBad("malformed request line".into()));
    }

    if !target.starts_with('/') {
        return Err(ProxyError::ClientBad("request target must be absolute path".into()));
    }
    let (raw_uri, args) = match target.split_once('?') {
        Some((u, a)) => (u, a.to_string()),
        None => (target, String::new()),
    };
    let uri = percent_decode_path(raw_uri)
        .ok_or_else(|| ProxyError::ClientBad("bad percent-encoding in path".into()))?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::ClientBad(format!("bad header line '{line}'")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| ProxyError::ClientBad("bad header name".into()))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| ProxyError::ClientBad("bad header value".into()))?;
        headers.append(name, value);
    }

    if headers
        .get("transfer-encoding")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
    {
        // Chunked request bodies are not supported by this framing layer.
        return Err(ProxyError::ClientBad("chunked request body".into()));
    }

    let content_length = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.parse::<u64>()
                .map_err(|_| ProxyError::ClientBad("bad content-length".into()))
        })
        .transpose()?
        .unwrap_or(0);

    let host = headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if host.is_empty() && version == Version::HTTP_11 {
        return Err(ProxyError::ClientBad("missing Host header".into()));
    }

    let wants_keepalive = match headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase())
    {
        Some(v) if v.contains("close") => false,
        Some(v) if v.contains("keep-alive") => true,
        _ => version == Version::HTTP_11,
    };

    Ok(RequestHead {
        method,
        version,
        uri,
        args,
        host,
        headers,
        content_length,
        wants_keepalive,
    })
}

/// Decode `%XX` escapes in a path. Rejects escaped NUL. `+` is left as-is
/// (it only means space in query strings).
fn percent_decode_path(raw: &str) -> Option<String> {
    if !raw.contains('%') {
        return Some(raw.to_string());
    }
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = hex_val(*bytes.get(i + 1)?)?;
            let lo = hex_val(*bytes.get(i + 2)?)?;
            let b = hi * 16 + lo;
            if b == 0 {
                return None;
            }
            out.push(b);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
