use super::{PhaseHandler, PhaseResult};
use crate::config::RewriteFlag;
use crate::content::static_files::{self, StaticOutcome};
use crate::error::ProxyError;
use crate::location::Location;
use crate::request::Request;
use crate::server::output::OutputChain;
use crate::server::ServerContext;
use crate::subrequest::{self, SubrequestTree};
use crate::upstream::{proxy_pass, ProxyOutcome};
use async_trait::async_trait;
use http::StatusCode;
use std::sync::Arc;

/// REWRITE phase: apply the location's `rewrite` rules, then `return`.
pub struct RewriteHandler;

#[async_trait]
impl PhaseHandler for RewriteHandler {
    async fn handle(
        &self,
        _ctx: &Arc<ServerContext>,
        r: &mut Request,
        _out: &mut dyn OutputChain,
    ) -> PhaseResult {
        let Some(loc) = r.location.clone() else {
            return PhaseResult::Declined;
        };

        for rule in &loc.rewrites {
            let Some(caps) = rule.regex.captures(&r.uri) else {
                continue;
            };
            let mut rewritten = String::new();
            caps.expand(&rule.replacement, &mut rewritten);
            let (uri, args) = match rewritten.split_once('?') {
                Some((u, a)) => (u.to_string(), a.to_string()),
                None => (rewritten, r.args.clone()),
            };
            tracing::debug!("rewrite: {} -> {}", r.uri, uri);
            match rule.flag {
                RewriteFlag::Last => {
                    if !r.set_uri(uri, args) {
                        tracing::error!("rewrite cycle limit reached, uri={}", r.uri);
                        return PhaseResult::Error(StatusCode::INTERNAL_SERVER_ERROR);
                    }
                    // POST_REWRITE sends the request back to FIND_CONFIG.
                    return PhaseResult::Declined;
                }
                RewriteFlag::Break => {
                    // Stay in the current location with the new URI.
                    r.uri = uri;
                    r.args = args;
                }
            }
        }

        if let Some(code) = loc.return_code {
            return PhaseResult::Error(code);
        }

        PhaseResult::Declined
    }
}

/// ACCESS phase: CIDR allow/deny rules. Allow rules are consulted first;
/// an address matching neither list is allowed.
pub struct AccessHandler;

#[async_trait]
impl PhaseHandler for AccessHandler {
    async fn handle(
        &self,
        _ctx: &Arc<ServerContext>,
        r: &mut Request,
        _out: &mut dyn OutputChain,
    ) -> PhaseResult {
        let Some(loc) = r.location.clone() else {
            return PhaseResult::Declined;
        };
        if loc.access.is_empty() {
            return PhaseResult::Declined;
        }

        let addr = r.client_addr.ip();
        for rule in &loc.access {
            if rule.covers(addr) {
                return if rule.allow {
                    PhaseResult::Ok
                } else {
                    tracing::debug!("access: denied {} by rule", addr);
                    PhaseResult::Error(StatusCode::FORBIDDEN)
                };
            }
        }
        PhaseResult::Ok
    }
}

/// CONTENT phase: the location's bound content handler — the upstream
/// client for `proxy_pass` locations, the static file handler otherwise.
/// `add_before_body`/`add_after_body` compose the body with subrequest
/// output (main requests only).
pub struct ContentHandler;

#[async_trait]
impl PhaseHandler for ContentHandler {
    async fn handle(
        &self,
        ctx: &Arc<ServerContext>,
        r: &mut Request,
        out: &mut dyn OutputChain,
    ) -> PhaseResult {
        let Some(loc) = r.location.clone() else {
            return PhaseResult::Declined;
        };

        let compose = r.subrequest_depth == 0
            && (loc.add_before_body.is_some() || loc.add_after_body.is_some());
        if compose {
            return serve_with_additions(ctx, r, &loc, out).await;
        }

        serve_content(ctx, r, &loc, out).await
    }
}

/// Run the location's content handler into `out`.
async fn serve_content(
    ctx: &Arc<ServerContext>,
    r: &mut Request,
    loc: &Arc<Location>,
    out: &mut dyn OutputChain,
) -> PhaseResult {
    if let Some(proxy_opts) = &loc.proxy {
        return match proxy_pass(ctx, r, proxy_opts, out).await {
            Ok(ProxyOutcome::Done) => PhaseResult::Done,
            Ok(ProxyOutcome::AccelRedirect(target)) => accel_redirect_result(target),
            Err(ProxyError::ClientGone) => {
                tracing::info!("proxy: client closed request, uri={}", r.uri);
                PhaseResult::Error(ProxyError::ClientGone.status())
            }
            Err(e) => {
                tracing::warn!("proxy: upstream failed, uri={}, error={}", r.uri, e);
                PhaseResult::Error(e.status())
            }
        };
    }

    match static_files::serve(r, loc, out).await {
        Ok(StaticOutcome::Served) => PhaseResult::Done,
        Ok(StaticOutcome::Forbidden) => PhaseResult::Error(StatusCode::FORBIDDEN),
        Ok(StaticOutcome::NotFound) => PhaseResult::Declined,
        Err(ProxyError::ClientGone) => PhaseResult::Error(ProxyError::ClientGone.status()),
        Err(e) => {
            tracing::warn!("static: serving failed, uri={}, error={}", r.uri, e);
            PhaseResult::Error(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Compose the response body out of the postpone tree: the before
/// subrequest's output, then the main content, then the after
/// subrequest's. The children run concurrently; emission order is the
/// tree's preorder regardless of who finishes first.
async fn serve_with_additions(
    ctx: &Arc<ServerContext>,
    r: &mut Request,
    loc: &Arc<Location>,
    out: &mut dyn OutputChain,
) -> PhaseResult {
    let tree = SubrequestTree::new();
    let root = tree.root();

    if let Some(uri) = &loc.add_before_body {
        if let Err(e) =
            subrequest::spawn(ctx.clone(), &tree, r, &root, uri.clone(), String::new())
        {
            tracing::warn!("addition: before-subrequest failed to spawn: {}", e);
            return PhaseResult::Error(e.status());
        }
    }

    // The main body is captured into the root slot; the head is deferred
    // until composition is known to happen.
    let mut sink = tree.sink(&root);
    let main = serve_content(ctx, r, loc, &mut sink).await;
    if !matches!(main, PhaseResult::Done) {
        return main;
    }

    if let Some(uri) = &loc.add_after_body {
        if let Err(e) =
            subrequest::spawn(ctx.clone(), &tree, r, &root, uri.clone(), String::new())
        {
            tracing::warn!("addition: after-subrequest failed to spawn: {}", e);
            return PhaseResult::Error(e.status());
        }
    }
    root.finish();

    // The combined length is unknown once additions wrap the body.
    r.headers_out.content_length = None;
    if out.send_head(&r.headers_out).await.is_err() {
        return PhaseResult::Error(ProxyError::ClientGone.status());
    }
    if tree.emit_all(out).await.is_err() {
        return PhaseResult::Error(ProxyError::ClientGone.status());
    }
    let _ = out.finish().await;
    PhaseResult::Done
}

fn accel_redirect_result(target: String) -> PhaseResult {
    if target.starts_with('@') {
        PhaseResult::NamedRedirect(target)
    } else {
        let (uri, args) = match target.split_once('?') {
            Some((u, a)) => (u.to_string(), a.to_string()),
            None => (target, String::new()),
        };
        PhaseResult::Redirect { uri, args }
    }
}

/// LOG phase: one structured access line per request.
pub struct LogHandler;

#[async_trait]
impl PhaseHandler for LogHandler {
    async fn handle(
        &self,
        _ctx: &Arc<ServerContext>,
        r: &mut Request,
        out: &mut dyn OutputChain,
    ) -> PhaseResult {
        let latency_ms = r.start.elapsed().as_millis();
        tracing::info!(
            client_ip = %r.client_addr.ip(),
            method = %r.method,
            host = %r.host,
            path = %r.uri,
            status = r.headers_out.status.as_u16(),
            upstream = r.upstream_addr.map(|a| a.to_string()).unwrap_or_default(),
            cache_status = r.cache_status.map(|s| s.as_str()).unwrap_or(""),
            bytes = out.bytes_sent(),
            latency_ms = %latency_ms,
            "access"
        );
        PhaseResult::Ok
    }
}
