use crate::request::Request;
use bytes::{BufMut, Bytes, BytesMut};
use http::header::HeaderName;
use http::{HeaderMap, HeaderValue, StatusCode};

use super::headers::is_hop_by_hop;

/// Conditional-request headers derived from a stale cache entry.
#[derive(Debug, Default, Clone)]
pub struct ConditionalHeaders {
    pub if_modified_since: Option<String>,
    pub if_none_match: Option<String>,
}

/// Result of one `process_header` call over the bytes received so far.
#[derive(Debug)]
pub enum HeaderParse {
    /// Head complete: parsed status/headers plus the byte length of the head
    /// (the remainder of the buffer is body).
    Ok(ParsedHead),
    /// Need more bytes.
    Again,
    /// The peer sent something that is not an HTTP response head.
    Invalid(String),
}

#[derive(Debug)]
pub struct ParsedHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub head_len: usize,
}

/// Resumable parse state for one response. `reinit_request` resets it
/// before a failover retry.
#[derive(Debug, Default)]
pub struct ResponseParser {
    /// How far the CRLFCRLF scan has progressed, so partial reads do not
    /// rescan from the start.
    scanned: usize,
}

/// The upstream-protocol seam. The core drives connect/send/receive and
/// buffering; the adapter owns the wire format of one protocol.
pub trait UpstreamAdapter: Send + Sync {
    /// Serialize the outgoing request into a buffer chain. The body (if
    /// any) is appended by the caller as its own buffer.
    fn create_request(
        &self,
        r: &Request,
        body_len: Option<u64>,
        conditional: Option<&ConditionalHeaders>,
    ) -> Bytes;

    /// Reset per-attempt state before a retry.
    fn reinit_request(&self, parser: &mut ResponseParser);

    /// Parse the bytes received so far. Must be resumable across partial
    /// reads.
    fn process_header(&self, parser: &mut ResponseParser, buf: &[u8]) -> HeaderParse;

    /// The request is being abandoned before a response completed.
    fn abort_request(&self, r: &Request);

    /// The upstream exchange finished with the given status.
    fn finalize_request(&self, r: &Request, status: StatusCode);
}

/// HTTP/1.1 reverse-proxy adapter.
pub struct HttpProxyAdapter;

impl UpstreamAdapter for HttpProxyAdapter {
    fn create_request(
        &self,
        r: &Request,
        body_len: Option<u64>,
        conditional: Option<&ConditionalHeaders>,
    ) -> Bytes {
        let mut buf = BytesMut::with_capacity(512);

        buf.put_slice(r.method.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(r.uri.as_bytes());
        if !r.args.is_empty() {
            buf.put_u8(b'?');
            buf.put_slice(r.args.as_bytes());
        }
        buf.put_slice(b" HTTP/1.1\r\nHost: ");
        buf.put_slice(r.host.as_bytes());
        buf.put_slice(b"\r\nConnection: keep-alive\r\n");

        // X-Forwarded-For: append the peer address to any inbound list.
        let peer_ip = r.client_addr.ip().to_string();
        match r
            .headers_in
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) => {
                buf.put_slice(b"X-Forwarded-For: ");
                buf.put_slice(existing.as_bytes());
                buf.put_slice(b", ");
                buf.put_slice(peer_ip.as_bytes());
                buf.put_slice(b"\r\n");
            }
            None => {
                buf.put_slice(b"X-Forwarded-For: ");
                buf.put_slice(peer_ip.as_bytes());
                buf.put_slice(b"\r\n");
            }
        }
        buf.put_slice(b"X-Real-IP: ");
        buf.put_slice(peer_ip.as_bytes());
        buf.put_slice(b"\r\n");

        if let Some(len) = body_len {
            buf.put_slice(b"Content-Length: ");
            buf.put_slice(len.to_string().as_bytes());
            buf.put_slice(b"\r\n");
        }

        if let Some(cond) = conditional {
            if let Some(ref v) = cond.if_modified_since {
                buf.put_slice(b"If-Modified-Since: ");
                buf.put_slice(v.as_bytes());
                buf.put_slice(b"\r\n");
            }
            if let Some(ref v) = cond.if_none_match {
                buf.put_slice(b"If-None-Match: ");
                buf.put_slice(v.as_bytes());
                buf.put_slice(b"\r\n");
            }
        }

        for (name, value) in &r.headers_in {
            if is_hop_by_hop(name) || skip_forwarding(name, conditional.is_some()) {
                continue;
            }
            buf.put_slice(name.as_str().as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }

        buf.put_slice(b"\r\n");
        buf.freeze()
    }

    fn reinit_request(&self, parser: &mut ResponseParser) {
        *parser = ResponseParser::default();
    }

    fn process_header(&self, parser: &mut ResponseParser, buf: &[u8]) -> HeaderParse {
        let head_len = match find_head_end(buf, &mut parser.scanned) {
            Some(n) => n,
            None => return HeaderParse::Again,
        };

        let head = &buf[..head_len];
        let text = match std::str::from_utf8(head) {
            Ok(t) => t,
            Err(_) => return HeaderParse::Invalid("non-utf8 response head".into()),
        };
        let mut lines = text.split("\r\n");

        let status_line = lines.next().unwrap_or("");
        let status = match parse_status_line(status_line) {
            Some(s) => s,
            None => {
                return HeaderParse::Invalid(format!("bad status line '{status_line}'"));
            }
        };

        let mut headers = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                return HeaderParse::Invalid(format!("bad header line '{line}'"));
            };
            let Ok(name) = HeaderName::from_bytes(name.trim().as_bytes()) else {
                return HeaderParse::Invalid(format!("bad header name '{name}'"));
            };
            let Ok(value) = HeaderValue::from_str(value.trim()) else {
                return HeaderParse::Invalid(format!("bad value for '{name}'"));
            };
            headers.append(name, value);
        }

        HeaderParse::Ok(ParsedHead {
            status,
            headers,
            head_len,
        })
    }

    fn abort_request(&self, r: &Request) {
        tracing::debug!("upstream: aborting request, uri={}", r.uri);
    }

    fn finalize_request(&self, r: &Request, status: StatusCode) {
        tracing::debug!("upstream: finalized, uri={}, status={}", r.uri, status);
    }
}

/// Headers the adapter synthesizes itself and must not copy from the client.
fn skip_forwarding(name: &HeaderName, conditional: bool) -> bool {
    matches!(
        name.as_str(),
        "host" | "x-forwarded-for" | "x-real-ip" | "content-length"
    ) || (conditional && matches!(name.as_str(), "if-modified-since" | "if-none-match"))
}

/// Incremental CRLFCRLF scan; `scanned` persists progress between calls.
fn find_head_end(buf: &[u8], scanned: &mut usize) -> Option<usize> {
    let start = scanned.saturating_sub(3);
    for i in start..buf.len().saturating_sub(3) {
        if &buf[i..i + 4] == b"\r\n\r\n" {
            *scanned = i + 4;
            return Some(i + 4);
        }
    }
    *scanned = buf.len();
    None
}

fn parse_status_line(line: &str) -> Option<StatusCode> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") {
        return None;
    }
    StatusCode::from_bytes(parts.next()?.as_bytes()).ok()
}

/// Incremental decoder for chunked transfer encoding. Feeding it bytes
/// yields decoded data slices; `done` flips once the terminal chunk and its
/// trailing CRLF have been consumed.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    remaining: u64,
    pub done: bool,
}

#[derive(Debug, PartialEq)]
enum ChunkState {
    Size,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    TrailerCr,
    TrailerLf,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self {
            state: ChunkState::Size,
            remaining: 0,
            done: false,
        }
    }
}

impl ChunkedDecoder {
    /// Consume `input`, appending decoded body bytes to `out`. Returns an
    /// error on malformed framing.
    pub fn decode(&mut self, input: &mut BytesMut, out: &mut Vec<Bytes>) -> Result<(), String> {
        while !input.is_empty() && !self.done {
            match self.state {
                ChunkState::Size => {
                    let b = input[0];
                    match b {
                        b'0'..=b'9' => {
                            self.remaining = self.remaining * 16 + u64::from(b - b'0');
                        }
                        b'a'..=b'f' => {
                            self.remaining = self.remaining * 16 + u64::from(b - b'a' + 10);
                        }
                        b'A'..=b'F' => {
                            self.remaining = self.remaining * 16 + u64::from(b - b'A' + 10);
                        }
                        b'\r' => self.state = ChunkState::SizeLf,
                        b';' => {
                            // Chunk extensions are skipped up to CR.
                            if let Some(pos) = input.iter().position(|&c| c == b'\r') {
                                let _ = input.split_to(pos);
                                continue;
                            }
                            return Ok(());
                        }
                        _ => return Err(format!("bad chunk size byte 0x{b:02x}")),
                    }
                    let _ = input.split_to(1);
                }
                ChunkState::SizeLf => {
                    if input[0] != b'\n' {
                        return Err("missing LF after chunk size".into());
                    }
                    let _ = input.split_to(1);
                    if self.remaining == 0 {
                        self.state = ChunkState::TrailerCr;
                    } else {
                        self.state = ChunkState::Data;
                    }
                }
                ChunkState::Data => {
                    let take = (input.len() as u64).min(self.remaining) as usize;
                    out.push(input.split_to(take).freeze());
                    self.remaining -= take as u64;
                    if self.remaining == 0 {
                        self.state = ChunkState::DataCr;
                    }
                }
                ChunkState::DataCr => {
                    if input[0] != b'\r' {
                        return Err("missing CR after chunk data".into());
                    }
                    let _ = input.split_to(1);
                    self.state = ChunkState::DataLf;
                }
                ChunkState::DataLf => {
                    if input[0] != b'\n' {
                        return Err("missing LF after chunk data".into());
                    }
                    let _ = input.split_to(1);
                    self.state = ChunkState::Size;
                }
                ChunkState::TrailerCr => {
                    // Trailer fields are tolerated and discarded.
                    if input[0] == b'\r' {
                        let _ = input.split_to(1);
                        self.state = ChunkState::TrailerLf;
                    } else if let Some(pos) = input.iter().position(|&c| c == b'\n') {
                        let _ = input.split_to(pos + 1);
                    } else {
                        input.clear();
                    }
                }
                ChunkState::TrailerLf => {
                    if input[0] != b'\n' {
                        return Err("missing final LF".into());
                    }
                    let _ = input.split_to(1);
                    self.done = true;
                }
            }
        }
        Ok(())
    }
}

/// Echo-style check used by tests and the loopback round-trip: parse a
/// serialized request head back into (method, uri, headers).
#[cfg(test)]
pub fn parse_request_head(head: &[u8]) -> Option<(String, String, HeaderMap)> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.split("\r\n");
    let mut request_line = lines.next()?.splitn(3, ' ');
    let method = request_line.next()?.to_string();
    let uri = request_line.next()?.to_string();
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        headers.append(
            HeaderName::from_bytes(name.trim().as_bytes()).ok()?,
            HeaderValue::from_str(value.trim()).ok()?,
        );
    }
    Some((method, uri, headers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, Version};

    fn request(uri: &str) -> Request {
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("*/*"));
        headers.insert("host", HeaderValue::from_static("downstream.test"));
        Request::new(
            Method::GET,
            Version::HTTP_11,
            uri.to_string(),
            "a=1".to_string(),
            "downstream.test".to_string(),
            headers,
            "192.0.2.7:1000".parse().unwrap(),
        )
    }

    #[test]
    fn serialized_request_parses_back() {
        let adapter = HttpProxyAdapter;
        let head = adapter.create_request(&request("/path"), Some(3), None);
        let (method, uri, headers) = parse_request_head(&head).expect("head should parse");

        assert_eq!(method, "GET");
        assert_eq!(uri, "/path?a=1");
        assert_eq!(headers.get("host").unwrap(), "downstream.test");
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "192.0.2.7");
        assert_eq!(headers.get("content-length").unwrap(), "3");
        assert_eq!(headers.get("accept").unwrap(), "*/*");
        // Host appears exactly once even though the client sent one.
        assert_eq!(headers.get_all("host").iter().count(), 1);
    }

    #[test]
    fn conditional_headers_replace_client_ones() {
        let adapter = HttpProxyAdapter;
        let mut r = request("/c");
        r.headers_in.insert(
            "if-modified-since",
            HeaderValue::from_static("Mon, 01 Jan 1990 00:00:00 GMT"),
        );
        let cond = ConditionalHeaders {
            if_modified_since: Some("Tue, 02 Jan 2024 00:00:00 GMT".to_string()),
            if_none_match: Some("\"abc\"".to_string()),
        };
        let head = adapter.create_request(&r, None, Some(&cond));
        let (_, _, headers) = parse_request_head(&head).unwrap();
        assert_eq!(
            headers.get("if-modified-since").unwrap(),
            "Tue, 02 Jan 2024 00:00:00 GMT"
        );
        assert_eq!(headers.get("if-none-match").unwrap(), "\"abc\"");
        assert_eq!(headers.get_all("if-modified-since").iter().count(), 1);
    }

    #[test]
    fn header_parse_resumes_across_partial_reads() {
        let adapter = HttpProxyAdapter;
        let mut parser = ResponseParser::default();
        let full = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

        for split in [4, 17, 30] {
            assert!(matches!(
                adapter.process_header(&mut parser, &full[..split]),
                HeaderParse::Again
            ));
        }
        match adapter.process_header(&mut parser, full) {
            HeaderParse::Ok(head) => {
                assert_eq!(head.status, StatusCode::OK);
                assert_eq!(head.headers.get("content-length").unwrap(), "5");
                assert_eq!(&full[head.head_len..], b"hello");
            }
            other => panic!("expected parsed head, got {other:?}"),
        }
    }

    #[test]
    fn garbage_head_is_invalid() {
        let adapter = HttpProxyAdapter;
        let mut parser = ResponseParser::default();
        assert!(matches!(
            adapter.process_header(&mut parser, b"SMTP READY\r\n\r\n"),
            HeaderParse::Invalid(_)
        ));
    }

    #[test]
    fn chunked_decoder_handles_split_input() {
        let mut decoder = ChunkedDecoder::default();
        let wire = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut out = Vec::new();
        // Feed one byte at a time to exercise every state transition.
        let mut pending = BytesMut::new();
        for &b in wire.iter() {
            pending.extend_from_slice(&[b]);
            decoder.decode(&mut pending, &mut out).expect("valid framing");
        }
        assert!(decoder.done);
        let joined: Vec<u8> = out.iter().flat_map(|b| b.iter().copied()).collect();
        assert_eq!(&joined, b"hello world");
    }

    #[test]
    fn chunked_decoder_rejects_garbage() {
        let mut decoder = ChunkedDecoder::default();
        let mut input = BytesMut::from(&b"zz\r\n"[..]);
        assert!(decoder.decode(&mut input, &mut Vec::new()).is_err());
    }
}
