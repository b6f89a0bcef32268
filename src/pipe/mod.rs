use crate::error::ProxyError;
use crate::server::output::{AbortProbe, OutputChain};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// One non-blocking read attempt from the upstream body source.
#[derive(Debug)]
pub enum SourceRead {
    /// Decoded body bytes (possibly several slices from one socket read).
    Data(Vec<Bytes>),
    WouldBlock,
    Eof,
}

/// Upstream side of the pipe: a readiness-driven, already-de-framed byte
/// source (the upstream client layers chunked/length decoding under this).
#[async_trait::async_trait]
pub trait PipeSource: Send {
    fn try_next(&mut self) -> std::io::Result<SourceRead>;
    async fn ready(&mut self) -> std::io::Result<()>;
}

/// What to do when the downstream client goes away mid-transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortPolicy {
    /// Fail the transfer with `ClientGone` (finalized as 499).
    Fail,
    /// Keep reading upstream and discard downstream output — used when a
    /// cache entry is being populated under `ignore_client_abort`.
    Continue,
}

pub struct PipeConfig {
    /// In-memory staging budget: `bufs_num` buffers of `buf_size` bytes.
    pub buf_size: usize,
    pub bufs_num: usize,
    pub max_temp_file_size: u64,
    pub temp_dir: PathBuf,
    pub read_timeout: Duration,
    pub send_timeout: Duration,
    pub abort_policy: AbortPolicy,
}

/// Spill/record file state. In record mode (cache population) every body
/// byte is appended; in spill mode only overflow is written.
struct TempFile {
    file: File,
    path: PathBuf,
    record_all: bool,
    /// File length == next append offset.
    write_off: u64,
    /// Spilled ranges not yet emitted downstream, in arrival order.
    pending: VecDeque<(u64, u64)>,
}

/// A partially emitted buffer at the head of the output queue.
struct BusyBuf {
    data: Bytes,
    pos: usize,
}

/// Bounded-memory staging between the upstream receive side and the
/// downstream output chain, with temp-file spill.
///
/// Arrival order is emission order. In-memory staging is accounted as a
/// byte budget of `bufs_num * buf_size`; once the budget is exhausted (and
/// the downstream is not draining) arrivals spill to the temp file, and
/// keep spilling until the file backlog has drained so ordering holds.
/// When the spill cap is reached the upstream read side pauses entirely —
/// backpressure, never loss.
pub struct Pipe {
    conf: PipeConfig,
    mem: VecDeque<Bytes>,
    mem_bytes: usize,
    busy: Option<BusyBuf>,
    temp: Option<TempFile>,
    read_eof: bool,
    /// Downstream went away under `AbortPolicy::Continue`; output is
    /// discarded but upstream reading and recording proceed.
    discarding: bool,
    pub bytes_received: u64,
}

impl Pipe {
    pub fn new(conf: PipeConfig) -> Self {
        Self {
            conf,
            mem: VecDeque::new(),
            mem_bytes: 0,
            busy: None,
            temp: None,
            read_eof: false,
            discarding: false,
            bytes_received: 0,
        }
    }

    /// Attach a pre-opened record file (cache temp file); `start_off` is
    /// the body offset after the entry header block.
    pub fn record_into(&mut self, file: File, path: PathBuf, start_off: u64) {
        self.temp = Some(TempFile {
            file,
            path,
            record_all: true,
            write_off: start_off,
            pending: VecDeque::new(),
        });
    }

    /// Detach the record file after a successful transfer so the cache can
    /// finish and adopt it. Returns `None` when recording was not enabled.
    pub fn take_recorded(&mut self) -> Option<(File, PathBuf, u64)> {
        if !self.temp.as_ref().map(|t| t.record_all).unwrap_or(false) {
            return None;
        }
        let TempFile {
            file,
            path,
            write_off,
            ..
        } = self.temp.take().unwrap();
        Some((file, path, write_off))
    }

    /// Drive the transfer until upstream EOF is fully flushed downstream.
    /// The single loop alternates read-if-ready and write-if-ready steps,
    /// then waits on whichever side is outstanding.
    pub async fn process(
        &mut self,
        src: &mut dyn PipeSource,
        out: &mut dyn OutputChain,
    ) -> Result<(), ProxyError> {
        loop {
            let mut progressed = false;

            while !self.read_eof && self.room_to_read() {
                match src.try_next().map_err(io_to_upstream)? {
                    SourceRead::Data(slices) => {
                        for data in slices {
                            self.stage(data).await?;
                        }
                        progressed = true;
                    }
                    SourceRead::WouldBlock => break,
                    SourceRead::Eof => {
                        self.read_eof = true;
                        progressed = true;
                    }
                }
            }

            while self.has_output() {
                match self.emit_step(out).await {
                    Ok(0) => break,
                    Ok(_) => progressed = true,
                    Err(ProxyError::ClientGone)
                        if self.conf.abort_policy == AbortPolicy::Continue =>
                    {
                        self.discarding = true;
                        self.busy = None;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }

            if self.read_eof && !self.has_output() {
                return Ok(());
            }

            if !self.discarding && out.probe_abort() == AbortProbe::Closed {
                match self.conf.abort_policy {
                    AbortPolicy::Fail => return Err(ProxyError::ClientGone),
                    AbortPolicy::Continue => {
                        tracing::debug!("pipe: client gone, continuing for cache population");
                        self.discarding = true;
                        continue;
                    }
                }
            }

            if progressed {
                continue;
            }

            let want_read = !self.read_eof && self.room_to_read();
            let want_write = self.has_output() && !self.discarding;
            tokio::select! {
                res = tokio::time::timeout(self.conf.read_timeout, src.ready()),
                    if want_read =>
                {
                    match res {
                        Ok(r) => r.map_err(io_to_upstream)?,
                        Err(_) => return Err(ProxyError::UpstreamTimeout),
                    }
                }
                res = tokio::time::timeout(self.conf.send_timeout, out.ready()),
                    if want_write =>
                {
                    match res {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) | Err(_) => match self.conf.abort_policy {
                            AbortPolicy::Fail => return Err(ProxyError::ClientGone),
                            AbortPolicy::Continue => self.discarding = true,
                        },
                    }
                }
            }
        }
    }

    fn mem_budget(&self) -> usize {
        self.conf.buf_size * self.conf.bufs_num
    }

    /// More upstream data may be accepted: either staging memory is free or
    /// the spill file has headroom.
    fn room_to_read(&self) -> bool {
        if self.discarding {
            // Downstream is gone; memory drains into the record file only.
            return true;
        }
        if !self.must_spill() && self.mem_bytes < self.mem_budget() {
            return true;
        }
        self.spilled_bytes() < self.conf.max_temp_file_size
    }

    fn must_spill(&self) -> bool {
        self.temp
            .as_ref()
            .map(|t| !t.pending.is_empty())
            .unwrap_or(false)
    }

    fn spilled_bytes(&self) -> u64 {
        self.temp
            .as_ref()
            .and_then(|t| t.pending.iter().map(|(s, e)| e - s).reduce(|a, b| a + b))
            .unwrap_or(0)
    }

    fn has_output(&self) -> bool {
        if self.discarding {
            return false;
        }
        self.busy.is_some() || !self.mem.is_empty() || self.must_spill()
    }

    async fn stage(&mut self, data: Bytes) -> Result<(), ProxyError> {
        self.bytes_received += data.len() as u64;

        // Record mode: every byte goes to the file regardless of route.
        let mem_budget = self.mem_budget();
        let mem_bytes = self.mem_bytes;
        if let Some(temp) = self.temp.as_mut() {
            if temp.record_all {
                // Emit-side reads move the cursor; always append at the tail.
                temp.file
                    .seek(SeekFrom::Start(temp.write_off))
                    .await
                    .map_err(ProxyError::CacheIo)?;
                temp.file
                    .write_all(&data)
                    .await
                    .map_err(ProxyError::CacheIo)?;
                let start = temp.write_off;
                temp.write_off += data.len() as u64;
                if self.discarding {
                    return Ok(());
                }
                // Memory full or already spilling: emit this range from the
                // file later instead of keeping the bytes in memory.
                if !temp.pending.is_empty() || mem_bytes + data.len() > mem_budget {
                    temp.pending.push_back((start, temp.write_off));
                    return Ok(());
                }
                self.mem_bytes += data.len();
                self.mem.push_back(data);
                return Ok(());
            }
        }

        if self.discarding {
            return Ok(());
        }

        if !self.must_spill() && self.mem_bytes + data.len() <= self.mem_budget() {
            self.mem_bytes += data.len();
            self.mem.push_back(data);
            return Ok(());
        }

        // Spill path (plain buffering without cache recording).
        if self.temp.is_none() {
            self.temp = Some(self.open_spill_file().await?);
        }
        let temp = self.temp.as_mut().unwrap();
        temp.file
            .seek(SeekFrom::Start(temp.write_off))
            .await
            .map_err(ProxyError::CacheIo)?;
        temp.file
            .write_all(&data)
            .await
            .map_err(ProxyError::CacheIo)?;
        let start = temp.write_off;
        temp.write_off += data.len() as u64;
        temp.pending.push_back((start, temp.write_off));
        Ok(())
    }

    /// One downstream write attempt. Returns payload bytes accepted.
    async fn emit_step(&mut self, out: &mut dyn OutputChain) -> Result<usize, ProxyError> {
        if self.busy.is_none() {
            if let Some(data) = self.mem.pop_front() {
                self.mem_bytes -= data.len();
                self.busy = Some(BusyBuf { data, pos: 0 });
            } else if self.must_spill() && self.mem.is_empty() {
                // Memory drained: pull the next spilled range back in.
                let temp = self.temp.as_mut().unwrap();
                let (start, end) = *temp.pending.front().unwrap();
                let take = ((end - start) as usize).min(self.conf.buf_size);
                let mut buf = BytesMut::zeroed(take);
                temp.file
                    .seek(SeekFrom::Start(start))
                    .await
                    .map_err(ProxyError::CacheIo)?;
                temp.file
                    .read_exact(&mut buf)
                    .await
                    .map_err(ProxyError::CacheIo)?;
                if start + take as u64 == end {
                    temp.pending.pop_front();
                } else {
                    temp.pending.front_mut().unwrap().0 = start + take as u64;
                }
                self.busy = Some(BusyBuf {
                    data: buf.freeze(),
                    pos: 0,
                });
            } else {
                return Ok(0);
            }
        }

        let busy = self.busy.as_mut().unwrap();
        let n = out
            .try_send(&busy.data[busy.pos..])
            .map_err(|_| ProxyError::ClientGone)?;
        busy.pos += n;
        if busy.pos == busy.data.len() {
            self.busy = None;
        }
        Ok(n)
    }

    async fn open_spill_file(&self) -> Result<TempFile, ProxyError> {
        tokio::fs::create_dir_all(&self.conf.temp_dir)
            .await
            .map_err(ProxyError::CacheIo)?;
        let path = self.conf.temp_dir.join(format!(
            "pipe-{:08x}{:08x}",
            rand::random::<u32>(),
            rand::random::<u32>()
        ));
        let file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .await
            .map_err(ProxyError::CacheIo)?;
        Ok(TempFile {
            file,
            path,
            record_all: false,
            write_off: 0,
            pending: VecDeque::new(),
        })
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        // A leftover temp file means the transfer did not complete (or the
        // cache never adopted the record file); remove it.
        if let Some(t) = &self.temp {
            let _ = std::fs::remove_file(&t.path);
        }
    }
}

fn io_to_upstream(e: std::io::Error) -> ProxyError {
    match e.kind() {
        std::io::ErrorKind::TimedOut => ProxyError::UpstreamTimeout,
        _ => ProxyError::UpstreamBadResponse(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::output::BufferedOutput;

    /// Scripted source: a list of reads interleaved with WouldBlock.
    struct ScriptedSource {
        steps: VecDeque<SourceRead>,
    }

    #[async_trait::async_trait]
    impl PipeSource for ScriptedSource {
        fn try_next(&mut self) -> std::io::Result<SourceRead> {
            Ok(self.steps.pop_front().unwrap_or(SourceRead::Eof))
        }

        async fn ready(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn source(chunks: &[&[u8]]) -> ScriptedSource {
        let mut steps: VecDeque<SourceRead> = chunks
            .iter()
            .map(|c| SourceRead::Data(vec![Bytes::copy_from_slice(c)]))
            .collect();
        steps.push_back(SourceRead::Eof);
        ScriptedSource { steps }
    }

    fn config(dir: &std::path::Path, bufs: usize, size: usize) -> PipeConfig {
        PipeConfig {
            buf_size: size,
            bufs_num: bufs,
            max_temp_file_size: 1 << 20,
            temp_dir: dir.to_path_buf(),
            read_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(5),
            abort_policy: AbortPolicy::Fail,
        }
    }

    #[tokio::test]
    async fn passes_bytes_in_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipe = Pipe::new(config(dir.path(), 4, 1024));
        let mut src = source(&[b"hello ", b"world"]);
        let mut out = BufferedOutput::new();
        pipe.process(&mut src, &mut out).await.unwrap();
        assert_eq!(out.body(), b"hello world");
        assert_eq!(pipe.bytes_received, 11);
    }

    /// A sink that refuses bytes for a while, forcing the pipe to spill.
    struct StickySink {
        inner: BufferedOutput,
        refusals: usize,
    }

    #[async_trait::async_trait]
    impl OutputChain for StickySink {
        async fn send_head(
            &mut self,
            head: &crate::request::ResponseHead,
        ) -> std::io::Result<()> {
            self.inner.send_head(head).await
        }

        async fn send_data(&mut self, data: Bytes) -> std::io::Result<()> {
            self.inner.send_data(data).await
        }

        async fn finish(&mut self) -> std::io::Result<()> {
            self.inner.finish().await
        }

        async fn ready(&mut self) -> std::io::Result<()> {
            if self.refusals > 0 {
                self.refusals -= 1;
            }
            Ok(())
        }

        fn try_send(&mut self, data: &[u8]) -> std::io::Result<usize> {
            if self.refusals > 0 {
                self.refusals -= 1;
                return Ok(0);
            }
            self.inner.try_send(data)
        }

        fn bytes_sent(&self) -> u64 {
            self.inner.bytes_sent()
        }

        fn head_sent(&self) -> bool {
            self.inner.head_sent()
        }
    }

    #[tokio::test]
    async fn spills_when_memory_budget_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny budget: 2 buffers of 8 bytes.
        let mut pipe = Pipe::new(config(dir.path(), 2, 8));
        let chunks: Vec<Vec<u8>> = (0..8).map(|i| vec![b'a' + i as u8; 8]).collect();
        let refs: Vec<&[u8]> = chunks.iter().map(|c| c.as_slice()).collect();
        let mut src = source(&refs);
        let mut out = StickySink {
            inner: BufferedOutput::new(),
            refusals: 6,
        };
        pipe.process(&mut src, &mut out).await.unwrap();

        let expected: Vec<u8> = chunks.concat();
        assert_eq!(out.inner.body(), expected, "order preserved across spill");
    }

    #[tokio::test]
    async fn record_mode_captures_full_body() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipe = Pipe::new(config(dir.path(), 4, 1024));

        let record_path = dir.path().join("record");
        let file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&record_path)
            .await
            .unwrap();
        pipe.record_into(file, record_path.clone(), 0);

        let mut src = source(&[b"abc", b"def"]);
        let mut out = BufferedOutput::new();
        pipe.process(&mut src, &mut out).await.unwrap();

        assert_eq!(out.body(), b"abcdef");
        let (_, path, len) = pipe.take_recorded().expect("record file");
        assert_eq!(len, 6);
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
        std::fs::remove_file(path).unwrap();
    }

    /// Sink that reports the client as gone.
    struct GoneSink;

    #[async_trait::async_trait]
    impl OutputChain for GoneSink {
        async fn send_head(
            &mut self,
            _head: &crate::request::ResponseHead,
        ) -> std::io::Result<()> {
            Ok(())
        }

        async fn send_data(&mut self, _data: Bytes) -> std::io::Result<()> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        async fn finish(&mut self) -> std::io::Result<()> {
            Ok(())
        }

        async fn ready(&mut self) -> std::io::Result<()> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn try_send(&mut self, _data: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn probe_abort(&mut self) -> AbortProbe {
            AbortProbe::Closed
        }

        fn bytes_sent(&self) -> u64 {
            0
        }

        fn head_sent(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn client_abort_fails_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipe = Pipe::new(config(dir.path(), 2, 8));
        let mut src = ScriptedSource {
            steps: VecDeque::from([SourceRead::WouldBlock]),
        };
        let mut out = GoneSink;
        let err = pipe.process(&mut src, &mut out).await.unwrap_err();
        assert!(matches!(err, ProxyError::ClientGone));
    }

    #[tokio::test]
    async fn client_abort_continues_when_populating_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = config(dir.path(), 2, 8);
        conf.abort_policy = AbortPolicy::Continue;
        let mut pipe = Pipe::new(conf);

        let record_path = dir.path().join("record");
        let file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&record_path)
            .await
            .unwrap();
        pipe.record_into(file, record_path.clone(), 0);

        let mut src = source(&[b"keep ", b"going"]);
        let mut out = GoneSink;
        pipe.process(&mut src, &mut out).await.unwrap();

        let (_, path, len) = pipe.take_recorded().unwrap();
        assert_eq!(len, 10);
        assert_eq!(std::fs::read(&path).unwrap(), b"keep going");
        std::fs::remove_file(path).unwrap();
    }
}
