pub mod bootstrap;
pub mod conn;
pub mod output;

use crate::cache::CacheZone;
use crate::config::{BodyFileMode, Config, ServerConfig};
use crate::location::LocationTree;
use crate::phase::PhaseEngine;
use crate::request::body::BodyReadOptions;
use crate::request::Request;
use crate::upstream::{KeepalivePool, PeerSet};
use anyhow::Result;
use conn::{Downstream, ReadHead};
use output::OutputChain;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpStream;

/// Process-wide state shared by every connection: compiled configuration
/// plus the registries that would live in shared memory in a multi-process
/// design (peer failure counters, cache lock tables).
pub struct ServerContext {
    pub server: ServerConfig,
    pub locations: LocationTree,
    pub upstreams: HashMap<String, Arc<PeerSet>>,
    pub pools: HashMap<String, Arc<KeepalivePool>>,
    pub caches: HashMap<String, Arc<CacheZone>>,
    pub temp_dir: PathBuf,
    pub engine: PhaseEngine,
}

impl ServerContext {
    pub fn build(config: &Config) -> Result<Arc<Self>> {
        let locations = LocationTree::build(&config.location, &config.server)?;

        let mut upstreams = HashMap::new();
        let mut pools = HashMap::new();
        for group in &config.upstream {
            upstreams.insert(group.name.clone(), Arc::new(PeerSet::build(group)?));
            pools.insert(
                group.name.clone(),
                Arc::new(KeepalivePool::new(group.keepalive)),
            );
        }

        let temp_dir = PathBuf::from(&config.server.temp_path);
        let mut caches = HashMap::new();
        for zone in &config.cache_path {
            caches.insert(zone.name.clone(), CacheZone::build(zone, &temp_dir)?);
        }

        Ok(Arc::new(Self {
            server: config.server.clone(),
            locations,
            upstreams,
            pools,
            caches,
            temp_dir,
            engine: PhaseEngine::new(),
        }))
    }
}

/// Serve one downstream connection: parse request heads, run each request
/// through the phase engine, and keep the connection alive within the
/// configured budget.
pub async fn handle_connection(ctx: Arc<ServerContext>, stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let mut down = Downstream::new(stream, peer, ctx.server.send_timeout);
    let mut served: u32 = 0;

    loop {
        let head = match down.read_request_head(ctx.server.keepalive_timeout).await {
            Ok(ReadHead::Request(head)) => head,
            Ok(ReadHead::Closed) => return,
            Err(e) => {
                tracing::debug!("conn: head read failed, peer={}, error={}", peer, e);
                respond_early_error(&mut down, &e).await;
                return;
            }
        };
        served += 1;

        let keepalive = head.wants_keepalive
            && served < ctx.server.keepalive_requests
            && ctx.server.keepalive_timeout > std::time::Duration::ZERO;
        let head_method = head.method == http::Method::HEAD;
        down.begin_response(head.version, head_method, keepalive);

        let mut r = Request::new(
            head.method,
            head.version,
            head.uri,
            head.args,
            head.host,
            head.headers,
            peer,
        );

        // Request body intake: the server-wide cap rejects early; location
        // overrides are enforced again at FIND_CONFIG.
        if head.content_length > 0 {
            let opts = BodyReadOptions {
                content_length: head.content_length,
                max_body_size: ctx.server.client_max_body_size,
                buffer_size: ctx.server.client_body_buffer_size,
                file_mode: ctx.server.client_body_in_file_only,
                temp_dir: ctx.temp_dir.clone(),
            };
            match down.read_body(&opts).await {
                Ok(body) => {
                    if let crate::request::ClientBody::File { path, .. } = &body {
                        if ctx.server.client_body_in_file_only != BodyFileMode::On {
                            let path = path.clone();
                            r.add_cleanup(move || {
                                let _ = std::fs::remove_file(&path);
                            });
                        }
                    }
                    r.body = Some(body);
                }
                Err(e) => {
                    tracing::debug!("conn: body read failed, peer={}, error={}", peer, e);
                    respond_early_error(&mut down, &e).await;
                    return;
                }
            }
        }

        ctx.engine.run(&ctx, &mut r, &mut down).await;

        if !down.will_keepalive() {
            return;
        }
    }
}

/// Errors before the engine takes over (parse failures, body rejections)
/// get a minimal direct response.
async fn respond_early_error(down: &mut Downstream, e: &crate::error::ProxyError) {
    use crate::request::ResponseHead;

    let status = e.status();
    // 499 has no meaningful response; the client is gone.
    if status.as_u16() == 499 || down.head_sent() {
        return;
    }
    let head = ResponseHead {
        status,
        headers: http::HeaderMap::new(),
        content_length: Some(0),
    };
    let _ = down.send_head(&head).await;
    let _ = down.finish().await;
    down.drain_before_close().await;
}
