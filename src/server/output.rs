use crate::request::ResponseHead;
use async_trait::async_trait;
use bytes::Bytes;

/// Downstream liveness as seen by a zero-byte read probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortProbe {
    Alive,
    Closed,
}

/// Head of the response output-filter chain.
///
/// The core treats serialization, chunked framing, and the socket as one
/// opaque sink. Two call styles coexist: the awaiting style
/// (`send_data`) used by content handlers, and the readiness style
/// (`ready` + `try_send`) used by the streaming pipe so it can interleave
/// upstream reads with downstream writes.
#[async_trait]
pub trait OutputChain: Send {
    /// Serialize and send the response head. Must be called exactly once
    /// before any body data.
    async fn send_head(&mut self, head: &ResponseHead) -> std::io::Result<()>;

    /// Write one body chunk, waiting for the socket as needed.
    async fn send_data(&mut self, data: Bytes) -> std::io::Result<()>;

    /// Terminate the body (writes the last-chunk marker when chunked).
    async fn finish(&mut self) -> std::io::Result<()>;

    /// Wait until [`OutputChain::try_send`] can make progress.
    async fn ready(&mut self) -> std::io::Result<()>;

    /// Attempt to write body bytes without waiting. Returns the number of
    /// payload bytes consumed; `Ok(0)` means the socket is not ready.
    fn try_send(&mut self, data: &[u8]) -> std::io::Result<usize>;

    /// Zero-byte read probe for client-disconnect detection.
    fn probe_abort(&mut self) -> AbortProbe {
        AbortProbe::Alive
    }

    /// Body bytes emitted so far. Non-zero disables upstream failover.
    fn bytes_sent(&self) -> u64;

    /// Whether `send_head` has already run — error handling can only
    /// replace the response before this point.
    fn head_sent(&self) -> bool;
}

/// An in-memory sink: used by subrequests (whose output is postponed) and
/// by tests. The head is recorded but not serialized.
#[derive(Default)]
pub struct BufferedOutput {
    pub status: Option<http::StatusCode>,
    pub chunks: Vec<Bytes>,
    pub finished: bool,
    bytes: u64,
}

impl BufferedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn body(&self) -> Vec<u8> {
        self.chunks.iter().flat_map(|c| c.iter().copied()).collect()
    }
}

#[async_trait]
impl OutputChain for BufferedOutput {
    async fn send_head(&mut self, head: &ResponseHead) -> std::io::Result<()> {
        self.status = Some(head.status);
        Ok(())
    }

    async fn send_data(&mut self, data: Bytes) -> std::io::Result<()> {
        self.bytes += data.len() as u64;
        self.chunks.push(data);
        Ok(())
    }

    async fn finish(&mut self) -> std::io::Result<()> {
        self.finished = true;
        Ok(())
    }

    async fn ready(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn try_send(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.bytes += data.len() as u64;
        self.chunks.push(Bytes::copy_from_slice(data));
        Ok(data.len())
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes
    }

    fn head_sent(&self) -> bool {
        self.status.is_some()
    }
}
