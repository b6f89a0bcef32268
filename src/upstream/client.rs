use crate::cache::{
    CacheEntry, CacheKey, CacheLockGuard, CacheStatus, CacheZone, LockOutcome, Lookup,
};
use crate::error::ProxyError;
use crate::location::{CacheOptions, ProxyOptions};
use crate::pipe::{AbortPolicy, Pipe, PipeConfig, PipeSource, SourceRead};
use crate::request::{vars, Request};
use crate::server::output::OutputChain;
use crate::server::ServerContext;
use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode};
use std::io::IoSlice;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use super::adapter::{
    ChunkedDecoder, ConditionalHeaders, HeaderParse, HttpProxyAdapter, ParsedHead,
    ResponseParser, UpstreamAdapter,
};
use super::headers::{copy_response_headers, process_response_headers, UpstreamInfo};
use super::peer::{PeerFreeState, SelectError};

/// How the proxied exchange ended, as seen by the phase engine.
#[derive(Debug)]
pub enum ProxyOutcome {
    /// The response (from upstream or cache) was fully sent downstream.
    Done,
    /// The upstream asked for an internal redirect; its body was discarded
    /// and the captured response headers kept.
    AccelRedirect(String),
}

/// Failure classes an attempt can end with; drives the failover decision.
#[derive(Debug)]
enum AttemptError {
    Connect(String),
    Timeout,
    Io(String),
    BadHeader(String),
    Status(StatusCode),
    /// Downstream client went away; never a reason to try another peer.
    ClientGone,
}

impl AttemptError {
    fn into_proxy_error(self) -> ProxyError {
        match self {
            AttemptError::Connect(m) => ProxyError::UpstreamConnect(m),
            AttemptError::Timeout => ProxyError::UpstreamTimeout,
            AttemptError::Io(m) => ProxyError::UpstreamBadResponse(m),
            AttemptError::BadHeader(m) => ProxyError::UpstreamBadResponse(m),
            AttemptError::Status(code) => ProxyError::UpstreamStatus(code),
            AttemptError::ClientGone => ProxyError::ClientGone,
        }
    }
}

/// What the cache lookup decided before any upstream work.
enum CachePlan {
    /// No caching for this request.
    Skip,
    /// Fetch from upstream, possibly recording into the cache.
    Fetch(Box<FetchCache>),
}

struct FetchCache {
    zone: Arc<CacheZone>,
    key: CacheKey,
    opts: CacheOptions,
    /// The expired entry backing a conditional refresh.
    stale: Option<CacheEntry>,
    /// Held refresh lock, released when the fetch ends.
    _lock: Option<CacheLockGuard>,
    /// Response may be stored (BYPASS still stores; SCARCE does not).
    may_store: bool,
}

/// Content handler for `proxy_pass` locations: consult the cache, then
/// connect/send/receive against the upstream group with failover, streaming
/// the response downstream through the pipe.
pub async fn proxy_pass(
    ctx: &ServerContext,
    r: &mut Request,
    opts: &ProxyOptions,
    out: &mut dyn OutputChain,
) -> Result<ProxyOutcome, ProxyError> {
    let adapter = HttpProxyAdapter;

    let plan = match cache_lookup(ctx, r, opts, out).await? {
        CacheLookupResult::Served => return Ok(ProxyOutcome::Done),
        CacheLookupResult::Plan(plan) => plan,
    };

    let peers = ctx
        .upstreams
        .get(&opts.upstream)
        .cloned()
        .ok_or_else(|| ProxyError::Internal(format!("unknown upstream '{}'", opts.upstream)))?;
    let pool = ctx.pools.get(&opts.upstream).cloned();

    let body = match &r.body {
        Some(b) => Some(b.to_bytes().await.map_err(ProxyError::CacheIo)?),
        None => None,
    };

    let mut fetch = match plan {
        CachePlan::Skip => None,
        CachePlan::Fetch(f) => Some(*f),
    };
    let conditional = fetch
        .as_ref()
        .and_then(|f| f.stale.as_ref())
        .map(|e| e.conditional_headers());

    let request_head = adapter.create_request(r, body.as_ref().map(|b| b.len() as u64), conditional.as_ref());

    let started = Instant::now();
    let mut pctx = peers.init();
    let max_tries = if opts.next_upstream_tries > 0 {
        opts.next_upstream_tries
    } else {
        peers.peer_count() as u32
    };
    let mut last_error: Option<AttemptError> = None;

    let final_error = loop {
        if pctx.attempts >= max_tries {
            break last_error
                .unwrap_or_else(|| AttemptError::Connect("no live upstreams".into()));
        }
        if let Some(limit) = opts.next_upstream_timeout {
            if started.elapsed() >= limit {
                tracing::warn!(
                    "upstream: failover time budget exhausted, group={}",
                    opts.upstream
                );
                break last_error.unwrap_or(AttemptError::Timeout);
            }
        }

        let sel = match peers.get(&mut pctx) {
            Ok(sel) => sel,
            Err(SelectError::NoLive) => {
                break last_error
                    .unwrap_or_else(|| AttemptError::Connect("no live upstreams".into()));
            }
        };
        r.upstream_addr = Some(sel.addr);

        let attempt = attempt_exchange(
            ctx,
            r,
            opts,
            &adapter,
            &request_head,
            body.as_ref(),
            sel.addr,
            pool.as_deref(),
            &mut fetch,
            out,
        )
        .await;

        match attempt {
            Ok(outcome) => {
                peers.free(&mut pctx, sel.index, PeerFreeState::Ok);
                return Ok(outcome);
            }
            Err(err) => {
                let failover = may_fail_over(opts, &err, out.bytes_sent());
                peers.free(&mut pctx, sel.index, peer_free_state(&err));
                tracing::warn!(
                    "upstream: attempt failed, group={}, peer={}, error={:?}, failover={}",
                    opts.upstream,
                    sel.addr,
                    err,
                    failover
                );
                if !failover {
                    break err;
                }
                last_error = Some(err);
            }
        }
    };

    // Stale-on-error: a configured `use_stale` serves the expired entry
    // instead of the failure, provided nothing has reached the client yet.
    if out.bytes_sent() == 0 && !matches!(final_error, AttemptError::ClientGone) {
        if let Some(f) = fetch.as_mut() {
            if f.opts.use_stale_error {
                if let Some(mut stale) = f.stale.take() {
                    tracing::debug!(
                        "upstream: serving stale entry after failure, group={}",
                        opts.upstream
                    );
                    r.cache_status = Some(CacheStatus::Stale);
                    r.headers_out = crate::request::ResponseHead::default();
                    serve_entry(r, &mut stale, opts, out).await?;
                    return Ok(ProxyOutcome::Done);
                }
            }
        }
    }

    Err(final_error.into_proxy_error())
}

/// How the peer is released after a failed attempt. Intercepted 403/404
/// responses rotate to the next peer without charging `max_fails` — the
/// exchange itself worked; every other failure counts against the window.
fn peer_free_state(err: &AttemptError) -> PeerFreeState {
    match err {
        AttemptError::Status(code)
            if *code == StatusCode::NOT_FOUND || *code == StatusCode::FORBIDDEN =>
        {
            PeerFreeState::NextPreferred
        }
        _ => PeerFreeState::Failed,
    }
}

/// Whether the failover mask and the output state allow trying another peer.
fn may_fail_over(opts: &ProxyOptions, err: &AttemptError, bytes_sent: u64) -> bool {
    // Bytes already on the wire cannot be unsent.
    if bytes_sent > 0 {
        return false;
    }
    let mask = &opts.next_upstream;
    match err {
        AttemptError::Connect(_) | AttemptError::Io(_) => mask.error,
        AttemptError::Timeout => mask.timeout,
        AttemptError::BadHeader(_) => mask.invalid_header,
        AttemptError::Status(code) => mask.covers_status(*code),
        AttemptError::ClientGone => false,
    }
}

enum CacheLookupResult {
    /// Response was served from the cache; nothing else to do.
    Served,
    Plan(CachePlan),
}

async fn cache_lookup(
    ctx: &ServerContext,
    r: &mut Request,
    opts: &ProxyOptions,
    out: &mut dyn OutputChain,
) -> Result<CacheLookupResult, ProxyError> {
    let Some(cache_opts) = opts.cache.clone() else {
        return Ok(CacheLookupResult::Plan(CachePlan::Skip));
    };
    // Caching needs the response spooled; non-buffered mode goes direct.
    if !opts.buffering || !matches!(r.method, Method::GET | Method::HEAD) {
        return Ok(CacheLookupResult::Plan(CachePlan::Skip));
    }
    let Some(zone) = ctx.caches.get(&cache_opts.zone).cloned() else {
        return Ok(CacheLookupResult::Plan(CachePlan::Skip));
    };

    let key = CacheKey::new(vars::eval(r, &cache_opts.key_expr));

    if vars::any_set(r, &cache_opts.bypass) {
        r.cache_status = Some(CacheStatus::Bypass);
        return Ok(CacheLookupResult::Plan(CachePlan::Fetch(Box::new(FetchCache {
            zone,
            key,
            opts: cache_opts,
            stale: None,
            _lock: None,
            may_store: true,
        }))));
    }

    loop {
        match zone.open(&key, cache_opts.min_uses).await? {
            Lookup::Hit(mut entry) => {
                r.cache_status = Some(CacheStatus::Hit);
                serve_entry(r, &mut entry, opts, out).await?;
                return Ok(CacheLookupResult::Served);
            }
            Lookup::Expired(mut entry) => {
                if cache_opts.use_stale_updating && zone.is_updating(&key) {
                    r.cache_status = Some(CacheStatus::Updating);
                    serve_entry(r, &mut entry, opts, out).await?;
                    return Ok(CacheLookupResult::Served);
                }
                let lock = match acquire_lock(&zone, &key, &cache_opts).await {
                    LockStep::Acquired(g) => g,
                    LockStep::Retry => continue,
                };
                r.cache_status = Some(CacheStatus::Expired);
                return Ok(CacheLookupResult::Plan(CachePlan::Fetch(Box::new(FetchCache {
                    zone,
                    key,
                    opts: cache_opts,
                    stale: Some(entry),
                    _lock: lock,
                    may_store: true,
                }))));
            }
            Lookup::Miss => {
                let lock = match acquire_lock(&zone, &key, &cache_opts).await {
                    LockStep::Acquired(g) => g,
                    LockStep::Retry => continue,
                };
                r.cache_status = Some(CacheStatus::Miss);
                return Ok(CacheLookupResult::Plan(CachePlan::Fetch(Box::new(FetchCache {
                    zone,
                    key,
                    opts: cache_opts,
                    stale: None,
                    _lock: lock,
                    may_store: true,
                }))));
            }
            Lookup::Scarce => {
                r.cache_status = Some(CacheStatus::Scarce);
                return Ok(CacheLookupResult::Plan(CachePlan::Fetch(Box::new(FetchCache {
                    zone,
                    key,
                    opts: cache_opts,
                    stale: None,
                    _lock: None,
                    may_store: false,
                }))));
            }
        }
    }
}

enum LockStep {
    Acquired(Option<CacheLockGuard>),
    /// Another fetch finished while waiting; look the entry up again.
    Retry,
}

async fn acquire_lock(zone: &CacheZone, key: &CacheKey, opts: &CacheOptions) -> LockStep {
    if !opts.lock {
        return LockStep::Acquired(None);
    }
    match zone.lock(key, opts.lock_timeout).await {
        LockOutcome::Acquired(guard) => LockStep::Acquired(Some(guard)),
        LockOutcome::Waited => LockStep::Retry,
        LockOutcome::TimedOut => {
            tracing::debug!("cache: lock wait timed out, fetching independently");
            LockStep::Acquired(None)
        }
    }
}

/// Send a validated cache entry downstream.
async fn serve_entry(
    r: &mut Request,
    entry: &mut CacheEntry,
    opts: &ProxyOptions,
    out: &mut dyn OutputChain,
) -> Result<(), ProxyError> {
    let info = process_response_headers(entry.status, &entry.headers);
    copy_response_headers(&entry.headers, &info, opts, "", &mut r.headers_out);
    r.headers_out.content_length = Some(entry.body_len);
    out.send_head(&r.headers_out)
        .await
        .map_err(|_| ProxyError::ClientGone)?;
    if r.method != Method::HEAD {
        entry.stream_body(opts.buffer_size, out).await?;
    }
    out.finish().await.map_err(|_| ProxyError::ClientGone)?;
    Ok(())
}

/// One attempt against one peer: connect (or reuse), send, receive head,
/// then relay or intercept. A stale pooled connection that dies before any
/// response byte is silently retried once on a fresh socket.
#[allow(clippy::too_many_arguments)]
async fn attempt_exchange(
    ctx: &ServerContext,
    r: &mut Request,
    opts: &ProxyOptions,
    adapter: &HttpProxyAdapter,
    request_head: &Bytes,
    body: Option<&Bytes>,
    addr: SocketAddr,
    pool: Option<&super::KeepalivePool>,
    fetch: &mut Option<FetchCache>,
    out: &mut dyn OutputChain,
) -> Result<ProxyOutcome, AttemptError> {
    let pooled = pool.and_then(|p| p.get(addr));
    let reused = pooled.is_some();

    let stream = match pooled {
        Some(s) => s,
        None => connect(addr, opts.connect_timeout).await?,
    };

    match exchange(ctx, r, opts, adapter, request_head, body, addr, pool, stream, fetch, out).await
    {
        Err(ExchangeError {
            kind,
            received_any: false,
        }) if reused && matches!(kind, AttemptError::Connect(_) | AttemptError::Io(_)) => {
            tracing::debug!("upstream: pooled connection was stale, retrying fresh, peer={}", addr);
            let stream = connect(addr, opts.connect_timeout).await?;
            exchange(ctx, r, opts, adapter, request_head, body, addr, pool, stream, fetch, out)
                .await
                .map_err(|e| e.kind)
        }
        other => other.map_err(|e| e.kind),
    }
}

async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, AttemptError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(AttemptError::Connect(e.to_string())),
        Err(_) => Err(AttemptError::Timeout),
    }
}

struct ExchangeError {
    kind: AttemptError,
    /// Any response bytes were seen before the failure (stale-connection
    /// retry is only safe when this is false).
    received_any: bool,
}

fn early(kind: AttemptError) -> ExchangeError {
    ExchangeError {
        kind,
        received_any: false,
    }
}

#[allow(clippy::too_many_arguments)]
async fn exchange(
    ctx: &ServerContext,
    r: &mut Request,
    opts: &ProxyOptions,
    adapter: &HttpProxyAdapter,
    request_head: &Bytes,
    body: Option<&Bytes>,
    addr: SocketAddr,
    pool: Option<&super::KeepalivePool>,
    stream: TcpStream,
    fetch: &mut Option<FetchCache>,
    out: &mut dyn OutputChain,
) -> Result<ProxyOutcome, ExchangeError> {
    // ---- send request ----
    let mut chain: Vec<&[u8]> = vec![request_head.as_ref()];
    if let Some(b) = body {
        chain.push(b.as_ref());
    }
    send_vectored(&stream, &chain, opts.send_timeout)
        .await
        .map_err(early)?;

    // ---- receive response head ----
    let mut parser = ResponseParser::default();
    adapter.reinit_request(&mut parser);
    let (head, leftover) = match read_response_head(&stream, adapter, &mut parser, opts).await {
        Ok(v) => v,
        Err((kind, received_any)) => {
            return Err(ExchangeError {
                kind,
                received_any,
            })
        }
    };

    let info = process_response_headers(head.status, &head.headers);

    // ---- 304 revalidation of an expired entry ----
    if head.status == StatusCode::NOT_MODIFIED {
        if let Some(f) = fetch.as_mut() {
            if let Some(mut stale) = f.stale.take() {
                let ttl = info
                    .cache_ttl
                    .or_else(|| f.opts.valid_for(stale.status))
                    .unwrap_or(Duration::from_secs(60));
                f.zone
                    .revalidate(&stale, ttl)
                    .await
                    .map_err(|e| ExchangeError {
                        kind: AttemptError::Io(e.to_string()),
                        received_any: true,
                    })?;
                r.cache_status = Some(CacheStatus::Revalidated);
                serve_entry(r, &mut stale, opts, out)
                    .await
                    .map_err(|e| ExchangeError {
                        kind: AttemptError::Io(e.to_string()),
                        received_any: true,
                    })?;
                maybe_return_to_pool(pool, addr, stream, &info, true);
                adapter.finalize_request(r, head.status);
                return Ok(ProxyOutcome::Done);
            }
        }
    }

    // ---- status interception for failover ----
    if opts.next_upstream.covers_status(head.status) && out.bytes_sent() == 0 {
        return Err(ExchangeError {
            kind: AttemptError::Status(head.status),
            received_any: true,
        });
    }

    // ---- header disposition toward downstream ----
    // A previous failed attempt may have copied headers already.
    r.headers_out = crate::request::ResponseHead::default();
    copy_response_headers(&head.headers, &info, opts, &addr.to_string(), &mut r.headers_out);

    // ---- X-Accel-Redirect interception ----
    if let Some(target) = info.x_accel_redirect.clone() {
        // The connection is released immediately; the body is discarded.
        drop(stream);
        adapter.finalize_request(r, head.status);
        tracing::debug!("upstream: x-accel-redirect to {}", target);
        return Ok(ProxyOutcome::AccelRedirect(target));
    }

    let head_only = r.method == Method::HEAD
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
        || head.status.is_informational();

    let framing = if head_only {
        Framing::Length(0)
    } else if info.chunked {
        Framing::Chunked(ChunkedDecoder::default())
    } else {
        match info.content_length {
            Some(len) => Framing::Length(len),
            // Content-length unknown: body runs to connection close.
            None => Framing::Close,
        }
    };
    let reusable_framing = !matches!(framing, Framing::Close);

    let mut source = BodyReader {
        stream,
        wire: leftover,
        framing,
        done: false,
    };

    // ---- decide whether this response populates the cache ----
    let store = match fetch.as_mut() {
        Some(f) if f.may_store && !head_only => {
            let ttl = info
                .cache_ttl
                .or_else(|| f.opts.valid_for(head.status));
            let storable = ttl.is_some()
                && !info.no_cache
                && !info.vary_uncacheable
                && !vars::any_set(r, &f.opts.no_cache);
            if storable {
                Some((f, ttl.unwrap()))
            } else {
                None
            }
        }
        _ => None,
    };

    if !opts.buffering {
        // Non-buffered relay: one buffer in flight, downstream-paced.
        out.send_head(&r.headers_out)
            .await
            .map_err(|e| ExchangeError {
                kind: AttemptError::Io(e.to_string()),
                received_any: true,
            })?;
        relay_unbuffered(&mut source, opts, out)
            .await
            .map_err(|kind| ExchangeError {
                kind,
                received_any: true,
            })?;
        let _ = out.finish().await;
        maybe_return_to_pool(pool, addr, source.stream, &info, reusable_framing && source.done);
        adapter.finalize_request(r, head.status);
        return Ok(ProxyOutcome::Done);
    }

    // ---- buffered relay through the pipe ----
    let mut pipe = Pipe::new(PipeConfig {
        buf_size: opts.buffer_size,
        bufs_num: opts.bufs_num,
        max_temp_file_size: opts.max_temp_file_size,
        temp_dir: ctx.temp_dir.clone(),
        read_timeout: opts.read_timeout,
        send_timeout: ctx.server.send_timeout,
        abort_policy: if store.is_some() && opts.ignore_client_abort {
            AbortPolicy::Continue
        } else {
            AbortPolicy::Fail
        },
    });

    let store = if let Some((f, ttl)) = store {
        match f.zone.start_store(&f.key, head.status, &head.headers).await {
            Ok((file, path, body_start)) => {
                pipe.record_into(file, path, body_start);
                Some((f, ttl))
            }
            Err(e) => {
                // Cache I/O must not fail the fetch.
                tracing::warn!("cache: store setup failed, serving direct: {}", e);
                None
            }
        }
    } else {
        None
    };

    out.send_head(&r.headers_out)
        .await
        .map_err(|e| ExchangeError {
            kind: AttemptError::Io(e.to_string()),
            received_any: true,
        })?;

    match pipe.process(&mut source, out).await {
        Ok(()) => {}
        Err(e) => {
            // The partial temp file is unlinked by the pipe's drop.
            adapter.abort_request(r);
            return Err(ExchangeError {
                kind: match e {
                    ProxyError::UpstreamTimeout => AttemptError::Timeout,
                    ProxyError::ClientGone => AttemptError::ClientGone,
                    other => AttemptError::Io(other.to_string()),
                },
                received_any: true,
            });
        }
    }
    let _ = out.finish().await;

    if let Some((f, ttl)) = store {
        if let Some((file, path, _len)) = pipe.take_recorded() {
            let commit = f
                .zone
                .commit_store(
                    &f.key,
                    file,
                    path,
                    ttl,
                    info.last_modified,
                    info.etag.as_deref(),
                )
                .await;
            if let Err(e) = commit {
                tracing::warn!("cache: commit failed, zone={}, error={}", f.zone.name, e);
            }
        }
    }

    maybe_return_to_pool(pool, addr, source.stream, &info, reusable_framing && source.done);
    adapter.finalize_request(r, head.status);
    Ok(ProxyOutcome::Done)
}

fn maybe_return_to_pool(
    pool: Option<&super::KeepalivePool>,
    addr: SocketAddr,
    stream: TcpStream,
    info: &UpstreamInfo,
    body_fully_consumed: bool,
) {
    if let Some(pool) = pool {
        if body_fully_consumed && !info.connection_close {
            pool.put(addr, stream);
        }
    }
}

/// Non-buffered relay: read one chunk, send it, repeat. Backpressure comes
/// from awaiting the downstream write before the next upstream read.
async fn relay_unbuffered(
    source: &mut BodyReader,
    opts: &ProxyOptions,
    out: &mut dyn OutputChain,
) -> Result<(), AttemptError> {
    loop {
        match source.try_next().map_err(|e| AttemptError::Io(e.to_string()))? {
            SourceRead::Data(slices) => {
                for data in slices {
                    out.send_data(data)
                        .await
                        .map_err(|e| AttemptError::Io(e.to_string()))?;
                }
            }
            SourceRead::Eof => return Ok(()),
            SourceRead::WouldBlock => {
                match tokio::time::timeout(opts.read_timeout, source.ready()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(AttemptError::Io(e.to_string())),
                    Err(_) => return Err(AttemptError::Timeout),
                }
            }
        }
    }
}

/// Scatter-write the request buffers with a send timeout armed whenever the
/// socket is not ready.
async fn send_vectored(
    stream: &TcpStream,
    chain: &[&[u8]],
    timeout: Duration,
) -> Result<(), AttemptError> {
    let total: usize = chain.iter().map(|b| b.len()).sum();
    let mut written = 0usize;

    while written < total {
        match tokio::time::timeout(timeout, stream.writable()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(AttemptError::Connect(e.to_string())),
            Err(_) => return Err(AttemptError::Timeout),
        }

        // Rebuild the slice list from the current offset.
        let mut slices: Vec<IoSlice> = Vec::with_capacity(chain.len());
        let mut skip = written;
        for buf in chain {
            if skip >= buf.len() {
                skip -= buf.len();
                continue;
            }
            slices.push(IoSlice::new(&buf[skip..]));
            skip = 0;
        }

        match stream.try_write_vectored(&slices) {
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(AttemptError::Connect(e.to_string())),
        }
    }
    Ok(())
}

type HeadReadError = (AttemptError, bool);

/// Receive loop for the response head: bounded buffer, resumable parse.
async fn read_response_head(
    stream: &TcpStream,
    adapter: &HttpProxyAdapter,
    parser: &mut ResponseParser,
    opts: &ProxyOptions,
) -> Result<(ParsedHead, BytesMut), HeadReadError> {
    let mut buf = BytesMut::with_capacity(opts.buffer_size);
    loop {
        match tokio::time::timeout(opts.read_timeout, stream.readable()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err((AttemptError::Io(e.to_string()), !buf.is_empty())),
            Err(_) => return Err((AttemptError::Timeout, !buf.is_empty())),
        }

        match stream.try_read_buf(&mut buf) {
            Ok(0) => {
                return Err((
                    AttemptError::Io("upstream closed before response head".into()),
                    !buf.is_empty(),
                ));
            }
            Ok(_) => match adapter.process_header(parser, &buf) {
                HeaderParse::Ok(head) => {
                    let leftover = buf.split_off(head.head_len);
                    return Ok((head, leftover));
                }
                HeaderParse::Again => {
                    if buf.len() >= opts.buffer_size {
                        return Err((
                            AttemptError::BadHeader("upstream sent too big header".into()),
                            true,
                        ));
                    }
                }
                HeaderParse::Invalid(msg) => {
                    return Err((AttemptError::BadHeader(msg), true));
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err((AttemptError::Io(e.to_string()), !buf.is_empty())),
        }
    }
}

/// Response body framing.
enum Framing {
    Length(u64),
    Chunked(ChunkedDecoder),
    /// Delimited by connection close (`length == -1` in pipe terms).
    Close,
}

/// De-framed upstream body source feeding the pipe (readiness style).
struct BodyReader {
    stream: TcpStream,
    /// Raw undecoded bytes (seeded with whatever followed the head).
    wire: BytesMut,
    framing: Framing,
    done: bool,
}

#[async_trait::async_trait]
impl PipeSource for BodyReader {
    fn try_next(&mut self) -> std::io::Result<SourceRead> {
        loop {
            if self.done {
                return Ok(SourceRead::Eof);
            }

            match &mut self.framing {
                Framing::Length(remaining) => {
                    if *remaining == 0 {
                        self.done = true;
                        self.wire.clear();
                        return Ok(SourceRead::Eof);
                    }
                    if !self.wire.is_empty() {
                        let take = (self.wire.len() as u64).min(*remaining) as usize;
                        *remaining -= take as u64;
                        let data = self.wire.split_to(take).freeze();
                        if *remaining == 0 {
                            self.done = true;
                        }
                        return Ok(SourceRead::Data(vec![data]));
                    }
                }
                Framing::Chunked(decoder) => {
                    if !self.wire.is_empty() {
                        let mut slices = Vec::new();
                        decoder
                            .decode(&mut self.wire, &mut slices)
                            .map_err(|m| std::io::Error::new(std::io::ErrorKind::InvalidData, m))?;
                        if decoder.done {
                            self.done = true;
                        }
                        if !slices.is_empty() {
                            return Ok(SourceRead::Data(slices));
                        }
                        if self.done {
                            return Ok(SourceRead::Eof);
                        }
                    }
                }
                Framing::Close => {
                    if !self.wire.is_empty() {
                        let data = self.wire.split().freeze();
                        return Ok(SourceRead::Data(vec![data]));
                    }
                }
            }

            match self.stream.try_read_buf(&mut self.wire) {
                Ok(0) => match &self.framing {
                    Framing::Close => {
                        self.done = true;
                        return Ok(SourceRead::Eof);
                    }
                    _ => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "upstream closed mid-body",
                        ));
                    }
                },
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return Ok(SourceRead::WouldBlock);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn ready(&mut self) -> std::io::Result<()> {
        self.stream.readable().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::NextUpstreamMask;

    fn opts_with_mask(classes: &[crate::config::NextUpstreamOn]) -> ProxyOptions {
        ProxyOptions {
            upstream: "u".to_string(),
            buffering: true,
            buffer_size: 4096,
            bufs_num: 8,
            max_temp_file_size: 1 << 20,
            connect_timeout: Duration::from_secs(1),
            send_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            next_upstream: NextUpstreamMask::from_config(classes),
            next_upstream_tries: 0,
            next_upstream_timeout: None,
            ignore_client_abort: false,
            redirect_rewrite: true,
            hide_headers: crate::upstream::headers::build_hide_set(&[], &[]).unwrap(),
            cache: None,
        }
    }

    #[test]
    fn failover_masks_are_honored() {
        use crate::config::NextUpstreamOn::*;
        let opts = opts_with_mask(&[Error, Http502]);

        assert!(may_fail_over(&opts, &AttemptError::Connect("x".into()), 0));
        assert!(may_fail_over(
            &opts,
            &AttemptError::Status(StatusCode::BAD_GATEWAY),
            0
        ));
        assert!(!may_fail_over(&opts, &AttemptError::Timeout, 0));
        assert!(!may_fail_over(
            &opts,
            &AttemptError::Status(StatusCode::NOT_FOUND),
            0
        ));
    }

    #[test]
    fn no_failover_after_downstream_bytes() {
        use crate::config::NextUpstreamOn::*;
        let opts = opts_with_mask(&[Error, Timeout]);
        assert!(may_fail_over(&opts, &AttemptError::Timeout, 0));
        assert!(!may_fail_over(&opts, &AttemptError::Timeout, 1));
    }

    #[test]
    fn default_mask_is_error_and_timeout() {
        let opts = opts_with_mask(&[]);
        assert!(may_fail_over(&opts, &AttemptError::Connect("x".into()), 0));
        assert!(may_fail_over(&opts, &AttemptError::Timeout, 0));
        assert!(!may_fail_over(
            &opts,
            &AttemptError::Status(StatusCode::INTERNAL_SERVER_ERROR),
            0
        ));
    }

    #[test]
    fn intercepted_403_and_404_rotate_without_charging_the_peer() {
        assert_eq!(
            peer_free_state(&AttemptError::Status(StatusCode::FORBIDDEN)),
            PeerFreeState::NextPreferred
        );
        assert_eq!(
            peer_free_state(&AttemptError::Status(StatusCode::NOT_FOUND)),
            PeerFreeState::NextPreferred
        );
        // Server-error interceptions and transport failures are charged.
        assert_eq!(
            peer_free_state(&AttemptError::Status(StatusCode::BAD_GATEWAY)),
            PeerFreeState::Failed
        );
        assert_eq!(
            peer_free_state(&AttemptError::Connect("refused".into())),
            PeerFreeState::Failed
        );
        assert_eq!(peer_free_state(&AttemptError::Timeout), PeerFreeState::Failed);
    }
}
