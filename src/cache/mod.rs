pub mod manager;

use crate::config::{parse_levels, CachePathConfig};
use crate::error::ProxyError;
use crate::upstream::adapter::{HeaderParse, HttpProxyAdapter, ResponseParser, UpstreamAdapter};
use anyhow::Result;
use bytes::{BufMut, BytesMut};
use dashmap::DashMap;
use http::{HeaderMap, StatusCode};
use md5::{Digest, Md5};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Notify;

/// Outcome of a cache lookup, logged as `$upstream_cache_status` would be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Miss,
    Bypass,
    Hit,
    Stale,
    Updating,
    Expired,
    Revalidated,
    /// Below the `min_uses` threshold; served from upstream, not stored.
    Scarce,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
            CacheStatus::Hit => "HIT",
            CacheStatus::Stale => "STALE",
            CacheStatus::Updating => "UPDATING",
            CacheStatus::Expired => "EXPIRED",
            CacheStatus::Revalidated => "REVALIDATED",
            CacheStatus::Scarce => "SCARCE",
        }
    }
}

/// Entry fingerprint: MD5 of the evaluated key expression is the primary
/// key, crc32 of the literal is the collision check.
#[derive(Debug, Clone)]
pub struct CacheKey {
    pub literal: String,
    pub hash: [u8; 16],
    pub crc: u32,
}

impl CacheKey {
    pub fn new(literal: String) -> Self {
        let mut md5 = Md5::new();
        md5.update(literal.as_bytes());
        let hash: [u8; 16] = md5.finalize().into();
        let crc = crc32fast::hash(literal.as_bytes());
        Self { literal, hash, crc }
    }

    pub fn hex(&self) -> String {
        let mut s = String::with_capacity(32);
        for b in self.hash {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }
}

pub const ENTRY_META_SIZE: usize = 16 + 4 + 8 + 8 + 8 + 1 + 32 + 2 + 2;

/// Fixed-size on-disk entry header.
///
/// Layout (little-endian):
/// `key_hash[16] crc32[4] valid_sec[8] last_modified[8] date[8]
///  etag_len[1] etag[32] body_start[2] header_start[2]`
#[derive(Debug, Clone, PartialEq)]
pub struct EntryMeta {
    pub key_hash: [u8; 16],
    pub crc32: u32,
    /// Unix deadline after which the entry is stale.
    pub valid_sec: i64,
    /// Unix time from the upstream `Last-Modified`, 0 if absent.
    pub last_modified: i64,
    /// Unix time the entry was stored or last revalidated.
    pub date: i64,
    pub etag: String,
    pub body_start: u16,
    pub header_start: u16,
}

impl EntryMeta {
    pub fn encode(&self) -> [u8; ENTRY_META_SIZE] {
        let mut buf = [0u8; ENTRY_META_SIZE];
        let mut w = &mut buf[..];
        w.put_slice(&self.key_hash);
        w.put_u32_le(self.crc32);
        w.put_i64_le(self.valid_sec);
        w.put_i64_le(self.last_modified);
        w.put_i64_le(self.date);
        let etag = self.etag.as_bytes();
        debug_assert!(etag.len() <= 32);
        w.put_u8(etag.len() as u8);
        w.put_slice(etag);
        w.put_bytes(0, 32 - etag.len());
        w.put_u16_le(self.body_start);
        w.put_u16_le(self.header_start);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProxyError> {
        if buf.len() < ENTRY_META_SIZE {
            return Err(ProxyError::CacheIo(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "cache entry header truncated",
            )));
        }
        let mut key_hash = [0u8; 16];
        key_hash.copy_from_slice(&buf[0..16]);
        let crc32 = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let valid_sec = i64::from_le_bytes(buf[20..28].try_into().unwrap());
        let last_modified = i64::from_le_bytes(buf[28..36].try_into().unwrap());
        let date = i64::from_le_bytes(buf[36..44].try_into().unwrap());
        let etag_len = buf[44] as usize;
        if etag_len > 32 {
            return Err(ProxyError::CacheIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "cache entry etag length out of range",
            )));
        }
        let etag = String::from_utf8_lossy(&buf[45..45 + etag_len]).into_owned();
        let body_start = u16::from_le_bytes(buf[77..79].try_into().unwrap());
        let header_start = u16::from_le_bytes(buf[79..81].try_into().unwrap());
        Ok(Self {
            key_hash,
            crc32,
            valid_sec,
            last_modified,
            date,
            etag,
            body_start,
            header_start,
        })
    }
}

/// An opened, validated cache entry.
#[derive(Debug)]
pub struct CacheEntry {
    pub meta: EntryMeta,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub path: PathBuf,
    pub body_len: u64,
    file: File,
}

/// Result of [`CacheZone::open`].
#[derive(Debug)]
pub enum Lookup {
    Miss,
    Scarce,
    Hit(CacheEntry),
    /// Past its validity window; the entry is still usable for
    /// stale-serving and conditional revalidation.
    Expired(CacheEntry),
}

/// Guard for the at-most-one-concurrent-refresh lock on a key.
pub struct CacheLockGuard {
    inflight: Arc<DashMap<[u8; 16], Arc<Notify>>>,
    hash: [u8; 16],
}

impl Drop for CacheLockGuard {
    fn drop(&mut self) {
        if let Some((_, notify)) = self.inflight.remove(&self.hash) {
            notify.notify_waiters();
        }
    }
}

#[derive(Debug)]
pub enum LockOutcome {
    Acquired(CacheLockGuard),
    /// Another fetch completed while we waited; re-run the lookup.
    Waited,
    /// Waited past `cache_lock_timeout`; fetch independently.
    TimedOut,
}

impl std::fmt::Debug for CacheLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLockGuard").finish()
    }
}

/// One `cache_path` zone: a directory hierarchy of entries plus the
/// in-memory refresh-lock and hit-counter tables shared by all requests.
pub struct CacheZone {
    pub name: String,
    pub root: PathBuf,
    levels: Vec<usize>,
    pub inactive: Duration,
    pub max_size: u64,
    temp_dir: PathBuf,
    inflight: Arc<DashMap<[u8; 16], Arc<Notify>>>,
    uses: DashMap<[u8; 16], u32>,
}

impl CacheZone {
    pub fn build(config: &CachePathConfig, global_temp: &std::path::Path) -> Result<Arc<Self>> {
        let root = PathBuf::from(&config.path);
        let temp_dir = if config.use_temp_path {
            // Same filesystem as the entries, so the final rename is atomic.
            root.join("temp")
        } else {
            global_temp.join(format!("cache-{}", config.name))
        };
        Ok(Arc::new(Self {
            name: config.name.clone(),
            root,
            levels: parse_levels(&config.levels)?,
            inactive: config.inactive,
            max_size: config.max_size,
            temp_dir,
            inflight: Arc::new(DashMap::new()),
            uses: DashMap::new(),
        }))
    }

    /// `<root>/<level dirs from the hash tail>/<full hash hex>`.
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let hex = key.hex();
        let mut path = self.root.clone();
        let mut consumed = 0;
        for &width in &self.levels {
            let start = hex.len() - consumed - width * 2;
            // Each level takes `width` bytes = width*2 hex chars off the tail.
            path.push(&hex[start..start + width * 2]);
            consumed += width * 2;
        }
        path.push(&hex);
        path
    }

    pub fn temp_dir(&self) -> &std::path::Path {
        &self.temp_dir
    }

    /// Whether another request is currently fetching this key.
    pub fn is_updating(&self, key: &CacheKey) -> bool {
        self.inflight.contains_key(&key.hash)
    }

    /// Open and validate the entry for `key`.
    pub async fn open(&self, key: &CacheKey, min_uses: u32) -> Result<Lookup, ProxyError> {
        // min_uses gate: the counter tracks lookups per key; entries are
        // cached only once a key has been asked for often enough.
        if min_uses > 1 {
            let mut seen = self.uses.entry(key.hash).or_insert(0);
            *seen += 1;
            if *seen < min_uses {
                return Ok(Lookup::Scarce);
            }
        }

        let path = self.entry_path(key);
        let mut file = match File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Lookup::Miss),
            Err(e) => return Err(ProxyError::CacheIo(e)),
        };

        let mut head = vec![0u8; ENTRY_META_SIZE];
        if file.read_exact(&mut head).await.is_err() {
            return Ok(Lookup::Miss);
        }
        let meta = match EntryMeta::decode(&head) {
            Ok(m) => m,
            Err(_) => return Ok(Lookup::Miss),
        };

        // Collision check: hash, crc, then the stored literal key.
        if meta.key_hash != key.hash || meta.crc32 != key.crc {
            return Ok(Lookup::Miss);
        }
        let key_len = meta.header_start as usize - ENTRY_META_SIZE;
        if key_len != key.literal.len() {
            return Ok(Lookup::Miss);
        }
        let mut stored_key = vec![0u8; key_len];
        if file.read_exact(&mut stored_key).await.is_err() {
            return Ok(Lookup::Miss);
        }
        if stored_key != key.literal.as_bytes() {
            return Ok(Lookup::Miss);
        }

        // Parse the stored response head.
        let header_len = meta.body_start as usize - meta.header_start as usize;
        let mut header_block = vec![0u8; header_len];
        file.read_exact(&mut header_block)
            .await
            .map_err(ProxyError::CacheIo)?;
        let adapter = HttpProxyAdapter;
        let mut parser = ResponseParser::default();
        let (status, headers) = match adapter.process_header(&mut parser, &header_block) {
            HeaderParse::Ok(parsed) => (parsed.status, parsed.headers),
            _ => return Ok(Lookup::Miss),
        };

        let file_len = file
            .metadata()
            .await
            .map_err(ProxyError::CacheIo)?
            .len();
        let entry = CacheEntry {
            status,
            headers,
            path,
            body_len: file_len.saturating_sub(u64::from(meta.body_start)),
            file,
            meta,
        };

        if entry.meta.valid_sec >= unix_now() {
            Ok(Lookup::Hit(entry))
        } else {
            Ok(Lookup::Expired(entry))
        }
    }

    /// Acquire the per-key refresh lock, waiting up to `timeout` when
    /// another request holds it.
    pub async fn lock(&self, key: &CacheKey, timeout: Duration) -> LockOutcome {
        let notify = match self.inflight.entry(key.hash) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(Notify::new()));
                return LockOutcome::Acquired(CacheLockGuard {
                    inflight: self.inflight.clone(),
                    hash: key.hash,
                });
            }
            dashmap::mapref::entry::Entry::Occupied(slot) => slot.get().clone(),
        };
        match tokio::time::timeout(timeout, notify.notified()).await {
            Ok(()) => LockOutcome::Waited,
            Err(_) => LockOutcome::TimedOut,
        }
    }

    /// Create the temp file for a new entry and write the header block.
    /// Returns the open file, its path, and the body offset, ready to hand
    /// to the pipe's record mode.
    pub async fn start_store(
        &self,
        key: &CacheKey,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> Result<(File, PathBuf, u64), ProxyError> {
        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(ProxyError::CacheIo)?;
        let path = self.temp_dir.join(format!(
            "{}-{:08x}",
            key.hex(),
            rand::random::<u32>()
        ));

        let header_block = serialize_head(status, headers);
        let header_start = ENTRY_META_SIZE + key.literal.len();
        let body_start = header_start + header_block.len();
        if body_start > u16::MAX as usize {
            return Err(ProxyError::CacheIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upstream header block too large to cache",
            )));
        }

        // Placeholder meta with valid_sec == 0; commit_store rewrites it.
        let meta = EntryMeta {
            key_hash: key.hash,
            crc32: key.crc,
            valid_sec: 0,
            last_modified: 0,
            date: unix_now(),
            etag: String::new(),
            body_start: body_start as u16,
            header_start: header_start as u16,
        };

        let mut file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .await
            .map_err(ProxyError::CacheIo)?;
        file.write_all(&meta.encode())
            .await
            .map_err(ProxyError::CacheIo)?;
        file.write_all(key.literal.as_bytes())
            .await
            .map_err(ProxyError::CacheIo)?;
        file.write_all(&header_block)
            .await
            .map_err(ProxyError::CacheIo)?;

        Ok((file, path, body_start as u64))
    }

    /// Finalize a populated temp file: write the real meta, sync, and
    /// atomically rename it into the entry hierarchy.
    pub async fn commit_store(
        &self,
        key: &CacheKey,
        mut file: File,
        temp_path: PathBuf,
        ttl: Duration,
        last_modified: Option<SystemTime>,
        etag: Option<&str>,
    ) -> Result<(), ProxyError> {
        let mut head = vec![0u8; ENTRY_META_SIZE];
        file.seek(SeekFrom::Start(0))
            .await
            .map_err(ProxyError::CacheIo)?;
        file.read_exact(&mut head).await.map_err(ProxyError::CacheIo)?;
        let mut meta = EntryMeta::decode(&head)?;

        meta.valid_sec = unix_now() + ttl.as_secs() as i64;
        meta.date = unix_now();
        meta.last_modified = last_modified.map(unix_secs).unwrap_or(0);
        // ETags longer than the fixed field are dropped, not truncated.
        meta.etag = match etag {
            Some(e) if e.len() <= 32 => e.to_string(),
            _ => String::new(),
        };
        debug_assert_eq!(meta.key_hash, key.hash);

        file.seek(SeekFrom::Start(0))
            .await
            .map_err(ProxyError::CacheIo)?;
        file.write_all(&meta.encode())
            .await
            .map_err(ProxyError::CacheIo)?;
        file.sync_data().await.map_err(ProxyError::CacheIo)?;
        drop(file);

        let final_path = self.entry_path(key);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(ProxyError::CacheIo)?;
        }
        tokio::fs::rename(&temp_path, &final_path)
            .await
            .map_err(ProxyError::CacheIo)?;
        tracing::debug!("cache: stored entry, zone={}, key={}", self.name, key.hex());
        Ok(())
    }

    /// A `304 Not Modified` revalidation: bump the validity window of the
    /// existing entry in place.
    pub async fn revalidate(&self, entry: &CacheEntry, ttl: Duration) -> Result<(), ProxyError> {
        let mut meta = entry.meta.clone();
        meta.valid_sec = unix_now() + ttl.as_secs() as i64;
        meta.date = unix_now();

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&entry.path)
            .await
            .map_err(ProxyError::CacheIo)?;
        file.write_all(&meta.encode())
            .await
            .map_err(ProxyError::CacheIo)?;
        file.sync_data().await.map_err(ProxyError::CacheIo)?;
        tracing::debug!("cache: revalidated entry, zone={}, path={:?}", self.name, entry.path);
        Ok(())
    }

    /// Shed hit-counter state so the table cannot grow without bound.
    pub fn shed_counters(&self) {
        if self.uses.len() > 65536 {
            self.uses.clear();
        }
    }
}

impl CacheEntry {
    /// Read the stored body in chunks, invoking `sink` for each.
    pub async fn stream_body(
        &mut self,
        buf_size: usize,
        out: &mut dyn crate::server::output::OutputChain,
    ) -> Result<(), ProxyError> {
        self.file
            .seek(SeekFrom::Start(u64::from(self.meta.body_start)))
            .await
            .map_err(ProxyError::CacheIo)?;
        let mut remaining = self.body_len;
        let mut buf = vec![0u8; buf_size.max(4096)];
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = self
                .file
                .read(&mut buf[..want])
                .await
                .map_err(ProxyError::CacheIo)?;
            if n == 0 {
                break;
            }
            remaining -= n as u64;
            out.send_data(bytes::Bytes::copy_from_slice(&buf[..n]))
                .await
                .map_err(|_| ProxyError::ClientGone)?;
        }
        Ok(())
    }

    /// Conditional-request headers for refreshing this entry.
    pub fn conditional_headers(&self) -> crate::upstream::adapter::ConditionalHeaders {
        crate::upstream::adapter::ConditionalHeaders {
            if_modified_since: (self.meta.last_modified != 0).then(|| {
                httpdate::fmt_http_date(
                    UNIX_EPOCH + Duration::from_secs(self.meta.last_modified as u64),
                )
            }),
            if_none_match: (!self.meta.etag.is_empty()).then(|| self.meta.etag.clone()),
        }
    }
}

fn serialize_head(status: StatusCode, headers: &HeaderMap) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(b"HTTP/1.1 ");
    buf.put_slice(status.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(status.canonical_reason().unwrap_or("").as_bytes());
    buf.put_slice(b"\r\n");
    for (name, value) in headers {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf.to_vec()
}

pub fn unix_now() -> i64 {
    unix_secs(SystemTime::now())
}

fn unix_secs(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn zone(dir: &std::path::Path) -> Arc<CacheZone> {
        CacheZone::build(
            &CachePathConfig {
                name: "z".to_string(),
                path: dir.join("cache").to_string_lossy().into_owned(),
                levels: "1:2".to_string(),
                inactive: Duration::from_secs(600),
                max_size: 0,
                use_temp_path: true,
            },
            dir,
        )
        .unwrap()
    }

    fn response_headers() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("content-type", HeaderValue::from_static("text/plain"));
        h.insert("x-origin", HeaderValue::from_static("test"));
        h
    }

    async fn store(
        zone: &CacheZone,
        key: &CacheKey,
        body: &[u8],
        ttl: Duration,
    ) {
        let (mut file, path, _body_start) = zone
            .start_store(key, StatusCode::OK, &response_headers())
            .await
            .unwrap();
        file.write_all(body).await.unwrap();
        zone.commit_store(key, file, path, ttl, None, Some("\"tag1\""))
            .await
            .unwrap();
    }

    #[test]
    fn meta_codec_round_trips() {
        let meta = EntryMeta {
            key_hash: [7u8; 16],
            crc32: 0xdeadbeef,
            valid_sec: 1_900_000_000,
            last_modified: 1_700_000_000,
            date: 1_800_000_000,
            etag: "\"abc123\"".to_string(),
            body_start: 300,
            header_start: 120,
        };
        let encoded = meta.encode();
        assert_eq!(encoded.len(), ENTRY_META_SIZE);
        assert_eq!(EntryMeta::decode(&encoded).unwrap(), meta);
    }

    #[test]
    fn entry_path_uses_hash_tail_levels() {
        let dir = tempfile::tempdir().unwrap();
        let zone = zone(dir.path());
        let key = CacheKey::new("example.test/x".to_string());
        let hex = key.hex();
        let path = zone.entry_path(&key);
        let parts: Vec<String> = path
            .components()
            .rev()
            .take(3)
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        // parts = [hash, level2 (2 bytes = 4 chars), level1 (1 byte = 2 chars)]
        assert_eq!(parts[0], hex);
        assert_eq!(parts[1], hex[hex.len() - 6..hex.len() - 2]);
        assert_eq!(parts[2], hex[hex.len() - 2..]);
    }

    #[tokio::test]
    async fn store_then_open_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let zone = zone(dir.path());
        let key = CacheKey::new("example.test/abc".to_string());

        assert!(matches!(zone.open(&key, 1).await.unwrap(), Lookup::Miss));
        store(&zone, &key, b"hello body", Duration::from_secs(60)).await;

        match zone.open(&key, 1).await.unwrap() {
            Lookup::Hit(mut entry) => {
                assert_eq!(entry.status, StatusCode::OK);
                assert_eq!(entry.headers.get("x-origin").unwrap(), "test");
                assert_eq!(entry.meta.etag, "\"tag1\"");
                assert_eq!(entry.body_len, 10);

                let mut out = crate::server::output::BufferedOutput::new();
                entry.stream_body(4096, &mut out).await.unwrap();
                assert_eq!(out.body(), b"hello body");
            }
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_entry_reports_expired_and_revalidates() {
        let dir = tempfile::tempdir().unwrap();
        let zone = zone(dir.path());
        let key = CacheKey::new("example.test/exp".to_string());
        store(&zone, &key, b"old", Duration::from_secs(0)).await;

        // valid_sec == now is still a hit boundary; sleep past it.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let entry = match zone.open(&key, 1).await.unwrap() {
            Lookup::Expired(e) => e,
            other => panic!("expected expired, got {other:?}"),
        };

        zone.revalidate(&entry, Duration::from_secs(60)).await.unwrap();
        assert!(matches!(zone.open(&key, 1).await.unwrap(), Lookup::Hit(_)));
    }

    #[tokio::test]
    async fn key_collision_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let zone = zone(dir.path());
        let key = CacheKey::new("example.test/one".to_string());
        store(&zone, &key, b"body", Duration::from_secs(60)).await;

        // Forge a key with the same path but different literal by writing
        // the entry under the other key's path.
        let other = CacheKey::new("example.test/two".to_string());
        let from = zone.entry_path(&key);
        let to = zone.entry_path(&other);
        tokio::fs::create_dir_all(to.parent().unwrap()).await.unwrap();
        tokio::fs::copy(&from, &to).await.unwrap();

        assert!(matches!(zone.open(&other, 1).await.unwrap(), Lookup::Miss));
    }

    #[tokio::test]
    async fn min_uses_gates_caching() {
        let dir = tempfile::tempdir().unwrap();
        let zone = zone(dir.path());
        let key = CacheKey::new("example.test/scarce".to_string());

        assert!(matches!(zone.open(&key, 3).await.unwrap(), Lookup::Scarce));
        assert!(matches!(zone.open(&key, 3).await.unwrap(), Lookup::Scarce));
        // Third lookup crosses the threshold.
        assert!(matches!(zone.open(&key, 3).await.unwrap(), Lookup::Miss));
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let zone = zone(dir.path());
        let key = CacheKey::new("k".to_string());

        let guard = match zone.lock(&key, Duration::from_millis(50)).await {
            LockOutcome::Acquired(g) => g,
            other => panic!("expected acquire, got {other:?}"),
        };
        assert!(zone.is_updating(&key));

        // Second locker times out while the first holds the lock.
        assert!(matches!(
            zone.lock(&key, Duration::from_millis(50)).await,
            LockOutcome::TimedOut
        ));

        drop(guard);
        assert!(!zone.is_updating(&key));
        assert!(matches!(
            zone.lock(&key, Duration::from_millis(50)).await,
            LockOutcome::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn waiter_wakes_when_lock_released() {
        let dir = tempfile::tempdir().unwrap();
        let zone = zone(dir.path());
        let key = CacheKey::new("w".to_string());

        let guard = match zone.lock(&key, Duration::from_secs(1)).await {
            LockOutcome::Acquired(g) => g,
            other => panic!("unexpected {other:?}"),
        };

        let zone2 = zone.clone();
        let key2 = key.clone();
        let waiter =
            tokio::spawn(async move { zone2.lock(&key2, Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        assert!(matches!(waiter.await.unwrap(), LockOutcome::Waited));
    }
}
