use super::handlers::{AccessHandler, ContentHandler, LogHandler, RewriteHandler};
use super::{Phase, PhaseHandler, PhaseResult};
use crate::config::Satisfy;
use crate::location::Match;
use crate::request::{vars, Request};
use crate::server::output::OutputChain;
use crate::server::ServerContext;
use bytes::Bytes;
use http::{HeaderValue, StatusCode};
use std::sync::Arc;

/// One slot in the flattened handler array. Checker phases (FIND_CONFIG,
/// POST_REWRITE, POST_ACCESS, TRY_FILES) are engine-internal and carry no
/// handler.
struct Slot {
    phase: Phase,
    handler: Option<Arc<dyn PhaseHandler>>,
    /// Index of the first slot of the next phase.
    next_phase: usize,
}

/// The request lifecycle driver: dispatches a request through the fixed
/// phase order with per-phase checker semantics, internal redirects, and
/// `error_page` handling.
pub struct PhaseEngine {
    slots: Vec<Slot>,
    server_rewrite_index: usize,
    find_config_index: usize,
    rewrite_index: usize,
    log_index: usize,
}

impl Default for PhaseEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseEngine {
    pub fn new() -> Self {
        let registrations: Vec<(Phase, Option<Arc<dyn PhaseHandler>>)> = vec![
            (Phase::FindConfig, None),
            (Phase::Rewrite, Some(Arc::new(RewriteHandler))),
            (Phase::PostRewrite, None),
            (Phase::Access, Some(Arc::new(AccessHandler))),
            (Phase::PostAccess, None),
            (Phase::TryFiles, None),
            (Phase::Content, Some(Arc::new(ContentHandler))),
            (Phase::Log, Some(Arc::new(LogHandler))),
        ];

        let mut slots: Vec<Slot> = registrations
            .into_iter()
            .map(|(phase, handler)| Slot {
                phase,
                handler,
                next_phase: 0,
            })
            .collect();

        let nexts: Vec<usize> = slots
            .iter()
            .map(|slot| {
                slots
                    .iter()
                    .position(|s| s.phase > slot.phase)
                    .unwrap_or(slots.len())
            })
            .collect();
        for (slot, next) in slots.iter_mut().zip(nexts) {
            slot.next_phase = next;
        }

        let index_of = |phase: Phase, slots: &[Slot]| {
            slots
                .iter()
                .position(|s| s.phase >= phase)
                .unwrap_or(slots.len())
        };

        Self {
            server_rewrite_index: index_of(Phase::ServerRewrite, &slots),
            find_config_index: index_of(Phase::FindConfig, &slots),
            rewrite_index: index_of(Phase::Rewrite, &slots),
            log_index: index_of(Phase::Log, &slots),
            slots,
        }
    }

    /// Run a request to completion. The downstream response (success or
    /// error) is fully written when this returns.
    pub async fn run(&self, ctx: &Arc<ServerContext>, r: &mut Request, out: &mut dyn OutputChain) {
        let mut i = 0;

        while i < self.slots.len() {
            let slot = &self.slots[i];
            let step = match slot.phase {
                Phase::FindConfig => self.check_find_config(ctx, r),
                Phase::PostRewrite => self.check_post_rewrite(r),
                Phase::PostAccess => check_post_access(r),
                Phase::TryFiles => self.check_try_files(ctx, r).await,
                Phase::Access => {
                    let handler = slot.handler.as_ref().unwrap();
                    let result = handler.handle(ctx, r, out).await;
                    check_access(r, result, slot.next_phase)
                }
                Phase::ServerRewrite | Phase::Rewrite => {
                    let handler = slot.handler.as_ref().unwrap();
                    let result = handler.handle(ctx, r, out).await;
                    check_rewrite(result)
                }
                Phase::Content => {
                    let handler = slot.handler.as_ref().unwrap();
                    let result = handler.handle(ctx, r, out).await;
                    check_content(r, result)
                }
                // Generic checker: POST_READ, PREACCESS, LOG.
                _ => {
                    let handler = slot.handler.as_ref().unwrap();
                    let result = handler.handle(ctx, r, out).await;
                    check_generic(result, slot.next_phase)
                }
            };

            match step {
                Step::NextHandler => i += 1,
                Step::Jump(to) => i = to,
                Step::Finalize(status) => {
                    i = self.finalize(ctx, r, out, status).await;
                }
                Step::Redirect { uri, args } => {
                    i = self.internal_redirect(r, out, uri, args).await;
                }
                Step::NamedRedirect(name) => {
                    i = self.named_redirect(ctx, r, out, name).await;
                }
                Step::Done => {
                    i = self.log_index.max(i + 1);
                }
            }
        }

        r.finalize();
    }

    /// FIND_CONFIG: rebind the request to the matched location, enforce the
    /// `internal` flag and the body-size cap, emit auto-redirects.
    fn check_find_config(&self, ctx: &ServerContext, r: &mut Request) -> Step {
        r.uri_changed = false;

        let loc = match ctx.locations.find(&r.uri) {
            Match::Config(loc) => loc,
            Match::AutoRedirect => {
                let target = format!("{}/", r.uri);
                tracing::debug!("find_config: auto redirect to {}", target);
                r.headers_out.status = StatusCode::MOVED_PERMANENTLY;
                if let Ok(v) = HeaderValue::from_str(&target) {
                    r.headers_out.headers.insert(http::header::LOCATION, v);
                }
                return Step::Finalize(StatusCode::MOVED_PERMANENTLY);
            }
        };

        if loc.internal && !r.internal {
            return Step::Finalize(StatusCode::NOT_FOUND);
        }

        if loc.client_max_body_size > 0 {
            if let Some(body) = &r.body {
                if body.len() > loc.client_max_body_size {
                    return Step::Finalize(StatusCode::PAYLOAD_TOO_LARGE);
                }
            }
        }

        tracing::debug!("find_config: uri={} location={}", r.uri, loc.name);
        r.location = Some(loc);
        Step::NextHandler
    }

    /// POST_REWRITE: a changed URI loops back to FIND_CONFIG. The budget
    /// was already spent by `set_uri`; hitting zero is caught there.
    fn check_post_rewrite(&self, r: &mut Request) -> Step {
        if r.uri_changed {
            Step::Jump(self.find_config_index)
        } else {
            Step::NextHandler
        }
    }

    /// TRY_FILES: first existing path wins; the last entry is a fallback
    /// that re-enters FIND_CONFIG or a named location.
    async fn check_try_files(&self, ctx: &ServerContext, r: &mut Request) -> Step {
        let Some(loc) = r.location.clone() else {
            return Step::NextHandler;
        };
        if loc.try_files.is_empty() {
            return Step::NextHandler;
        }

        let (fallback, candidates) = loc.try_files.split_last().unwrap();
        for entry in candidates {
            let uri = vars::eval(r, entry);
            let Some(path) = crate::content::static_files::map_path(&loc, &uri) else {
                continue;
            };
            if tokio::fs::metadata(&path).await.is_ok() {
                tracing::debug!("try_files: using {}", uri);
                r.uri = uri;
                return Step::NextHandler;
            }
        }

        let fallback = vars::eval(r, fallback);
        if let Some(name) = fallback.strip_prefix('@') {
            return Step::NamedRedirect(format!("@{name}"));
        }
        tracing::debug!("try_files: falling back to {}", fallback);
        let (uri, args) = split_uri_args(&fallback, &r.args);
        if !r.set_uri(uri, args) {
            tracing::error!("try_files: rewrite cycle limit reached, uri={}", r.uri);
            return Step::Finalize(StatusCode::INTERNAL_SERVER_ERROR);
        }
        Step::Jump(self.find_config_index)
    }

    /// Finalize with a status: try the location's `error_page` first, then
    /// fall back to the built-in error response. Returns the next slot
    /// index (the error page redirects re-enter the engine).
    async fn finalize(
        &self,
        ctx: &ServerContext,
        r: &mut Request,
        out: &mut dyn OutputChain,
        status: StatusCode,
    ) -> usize {
        if status.as_u16() >= 300 && !out.head_sent() {
            let page = r
                .location
                .as_ref()
                .and_then(|loc| loc.error_page_for(status).cloned());
            if let Some(page) = page {
                let recursing = r.error_status.is_some();
                let allowed = !recursing
                    || r.location
                        .as_ref()
                        .map(|l| l.recursive_error_pages)
                        .unwrap_or(false);
                if allowed {
                    r.error_status = Some(page.response.unwrap_or(status));
                    if page.uri.starts_with('@') {
                        tracing::debug!("error_page: {} -> {}", status, page.uri);
                        return self.named_redirect(ctx, r, out, page.uri.clone()).await;
                    }
                    tracing::debug!("error_page: {} -> {}", status, page.uri);
                    let (uri, args) = split_uri_args(&page.uri, "");
                    if r.set_uri(uri, args) {
                        r.reset_for_redirect();
                        return self.server_rewrite_index;
                    }
                    tracing::error!(
                        "error_page: redirection cycle limit reached, status={}",
                        status
                    );
                    // Budget exhausted: fall through to the default page.
                }
            }
        }

        send_default_error(r, out, status).await;
        self.log_index
    }

    async fn internal_redirect(
        &self,
        r: &mut Request,
        out: &mut dyn OutputChain,
        uri: String,
        args: String,
    ) -> usize {
        if !r.set_uri(uri, args) {
            tracing::error!("internal redirect cycle limit reached, uri={}", r.uri);
            send_default_error(r, out, StatusCode::INTERNAL_SERVER_ERROR).await;
            return self.log_index;
        }
        r.reset_for_redirect();
        self.server_rewrite_index
    }

    async fn named_redirect(
        &self,
        ctx: &ServerContext,
        r: &mut Request,
        out: &mut dyn OutputChain,
        name: String,
    ) -> usize {
        match ctx.locations.named(&name) {
            Some(loc) => {
                if r.uri_changes == 0 {
                    tracing::error!("named redirect cycle limit reached, location={}", name);
                    send_default_error(r, out, StatusCode::INTERNAL_SERVER_ERROR).await;
                    return self.log_index;
                }
                r.uri_changes -= 1;
                r.internal = true;
                r.tentative_denial = None;
                r.location = Some(loc);
                r.uri_changed = false;
                self.rewrite_index
            }
            None => {
                tracing::error!("named location {} is not defined", name);
                send_default_error(r, out, StatusCode::INTERNAL_SERVER_ERROR).await;
                self.log_index
            }
        }
    }

}

/// Where the engine goes after a checker decision.
enum Step {
    NextHandler,
    Jump(usize),
    Finalize(StatusCode),
    Redirect { uri: String, args: String },
    NamedRedirect(String),
    Done,
}

/// POST_READ / PREACCESS / LOG.
fn check_generic(result: PhaseResult, next_phase: usize) -> Step {
    match result {
        PhaseResult::Ok => Step::Jump(next_phase),
        PhaseResult::Declined => Step::NextHandler,
        PhaseResult::Done => Step::Done,
        PhaseResult::Error(status) => Step::Finalize(status),
        PhaseResult::Redirect { uri, args } => Step::Redirect { uri, args },
        PhaseResult::NamedRedirect(name) => Step::NamedRedirect(name),
    }
}

/// SERVER_REWRITE / REWRITE: all handlers run in sequence; success never
/// skips the rest of the phase.
fn check_rewrite(result: PhaseResult) -> Step {
    match result {
        PhaseResult::Ok | PhaseResult::Declined => Step::NextHandler,
        PhaseResult::Done => Step::Done,
        PhaseResult::Error(status) => Step::Finalize(status),
        PhaseResult::Redirect { uri, args } => Step::Redirect { uri, args },
        PhaseResult::NamedRedirect(name) => Step::NamedRedirect(name),
    }
}

/// ACCESS with `satisfy` aggregation.
fn check_access(r: &mut Request, result: PhaseResult, next_phase: usize) -> Step {
    let satisfy = r
        .location
        .as_ref()
        .map(|l| l.satisfy)
        .unwrap_or(Satisfy::All);
    match result {
        PhaseResult::Ok => match satisfy {
            Satisfy::All => Step::NextHandler,
            Satisfy::Any => {
                // A grant overrides any tentative denial, including its
                // challenge header.
                r.tentative_denial = None;
                r.headers_out.headers.remove(http::header::WWW_AUTHENTICATE);
                Step::Jump(next_phase)
            }
        },
        PhaseResult::Declined => Step::NextHandler,
        PhaseResult::Error(status)
            if status == StatusCode::FORBIDDEN || status == StatusCode::UNAUTHORIZED =>
        {
            match satisfy {
                Satisfy::All => Step::Finalize(status),
                Satisfy::Any => {
                    if r.tentative_denial.is_none() {
                        r.tentative_denial = Some(status);
                    }
                    Step::NextHandler
                }
            }
        }
        PhaseResult::Error(status) => Step::Finalize(status),
        PhaseResult::Done => Step::Done,
        PhaseResult::Redirect { uri, args } => Step::Redirect { uri, args },
        PhaseResult::NamedRedirect(name) => Step::NamedRedirect(name),
    }
}

/// POST_ACCESS: a tentative denial no later handler cleared becomes final.
fn check_post_access(r: &mut Request) -> Step {
    match r.tentative_denial.take() {
        Some(status) => Step::Finalize(status),
        None => Step::NextHandler,
    }
}

/// CONTENT: the bound content handler runs exclusively; its completion
/// finalizes the request.
fn check_content(r: &mut Request, result: PhaseResult) -> Step {
    match result {
        PhaseResult::Ok | PhaseResult::Done => Step::Done,
        PhaseResult::Declined => {
            // Fallthrough: no handler produced content.
            let status = if r.uri.ends_with('/') {
                StatusCode::FORBIDDEN
            } else {
                StatusCode::NOT_FOUND
            };
            Step::Finalize(status)
        }
        PhaseResult::Error(status) => Step::Finalize(status),
        PhaseResult::Redirect { uri, args } => Step::Redirect { uri, args },
        PhaseResult::NamedRedirect(name) => Step::NamedRedirect(name),
    }
}

fn split_uri_args(target: &str, current_args: &str) -> (String, String) {
    match target.split_once('?') {
        Some((uri, args)) => (uri.to_string(), args.to_string()),
        None => (target.to_string(), current_args.to_string()),
    }
}

/// The built-in error response, used when no `error_page` applies.
async fn send_default_error(r: &mut Request, out: &mut dyn OutputChain, status: StatusCode) {
    r.headers_out.status = status;
    if out.head_sent() {
        // Too late to change the response; drop the connection state as-is.
        tracing::debug!("finalize: head already sent, status={} recorded for log", status);
        return;
    }

    let body = if status.as_u16() >= 400 {
        let reason = status.canonical_reason().unwrap_or("error");
        format!(
            "<html>\r\n<head><title>{code} {reason}</title></head>\r\n\
             <body>\r\n<center><h1>{code} {reason}</h1></center>\r\n\
             <hr><center>talaria</center>\r\n</body>\r\n</html>\r\n",
            code = status.as_u16(),
            reason = reason
        )
    } else {
        String::new()
    };

    r.headers_out.content_length = Some(body.len() as u64);
    if !body.is_empty() {
        r.headers_out.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/html"),
        );
    }
    if out.send_head(&r.headers_out).await.is_err() {
        return;
    }
    if !body.is_empty() && r.method != http::Method::HEAD {
        let _ = out.send_data(Bytes::from(body)).await;
    }
    let _ = out.finish().await;
}
