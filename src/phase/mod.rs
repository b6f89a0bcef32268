mod engine;
mod handlers;

pub use engine::PhaseEngine;
pub use handlers::{AccessHandler, ContentHandler, LogHandler, RewriteHandler};

use crate::request::Request;
use crate::server::output::OutputChain;
use crate::server::ServerContext;
use async_trait::async_trait;
use http::StatusCode;
use std::sync::Arc;

/// The fixed processing stages every request traverses, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    PostRead,
    ServerRewrite,
    FindConfig,
    Rewrite,
    PostRewrite,
    Preaccess,
    Access,
    PostAccess,
    TryFiles,
    Content,
    Log,
}

impl Phase {
    pub const ALL: [Phase; 11] = [
        Phase::PostRead,
        Phase::ServerRewrite,
        Phase::FindConfig,
        Phase::Rewrite,
        Phase::PostRewrite,
        Phase::Preaccess,
        Phase::Access,
        Phase::PostAccess,
        Phase::TryFiles,
        Phase::Content,
        Phase::Log,
    ];
}

/// What a phase handler tells its checker.
#[derive(Debug)]
pub enum PhaseResult {
    /// Phase satisfied; the checker decides whether to jump to the next
    /// phase or the next handler (phase-kind dependent).
    Ok,
    /// Not my request; next handler in this phase.
    Declined,
    /// The response is complete; nothing left but logging.
    Done,
    /// Finalize with this status (`error_page` may still rewrite it).
    Error(StatusCode),
    /// Internal redirect: new URI/args, engine restarts at SERVER_REWRITE.
    Redirect { uri: String, args: String },
    /// Redirect into a named (`@`) location, entering at the rewrite index.
    NamedRedirect(String),
}

/// A module-contributed handler participating in one phase. The context
/// arrives as `&Arc` so handlers that spawn subrequests can hand the
/// spawned task its own reference.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &Arc<ServerContext>,
        r: &mut Request,
        out: &mut dyn OutputChain,
    ) -> PhaseResult;
}
