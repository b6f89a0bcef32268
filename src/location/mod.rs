mod tree;

pub use tree::{LocationTree, Match};

use crate::config::{
    BodyFileMode, CacheValidConfig, LocationConfig, LocationModifier, NextUpstreamOn, RewriteFlag,
    Satisfy, ServerConfig, UseStaleOn,
};
use crate::upstream::headers::build_hide_set;
use anyhow::{Context, Result};
use http::{HeaderName, StatusCode};
use ipnetwork::IpNetwork;
use regex::Regex;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// One compiled access rule. `net == None` means "all".
#[derive(Debug, Clone)]
pub struct AccessRule {
    pub net: Option<IpNetwork>,
    pub allow: bool,
}

impl AccessRule {
    pub fn covers(&self, addr: IpAddr) -> bool {
        match self.net {
            Some(net) => net.contains(addr),
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RewriteRule {
    pub regex: Regex,
    pub replacement: String,
    pub flag: RewriteFlag,
}

#[derive(Debug, Clone)]
pub struct ErrorPage {
    pub codes: Vec<StatusCode>,
    pub response: Option<StatusCode>,
    pub uri: String,
}

/// Cache options attached to a proxy location.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub zone: String,
    pub key_expr: String,
    pub valid: Vec<CacheValidConfig>,
    pub min_uses: u32,
    pub bypass: Vec<String>,
    pub no_cache: Vec<String>,
    pub use_stale_updating: bool,
    pub use_stale_error: bool,
    pub lock: bool,
    pub lock_timeout: Duration,
}

impl CacheOptions {
    /// Validity window for a response status, if one is configured.
    pub fn valid_for(&self, status: StatusCode) -> Option<Duration> {
        let code = status.as_u16();
        self.valid
            .iter()
            .find(|v| v.codes.is_empty() && code == 200 || v.codes.contains(&code))
            .map(|v| v.ttl)
    }
}

/// Failure classes allowed to trigger failover, collapsed into flags so the
/// upstream client tests membership without scanning a list.
#[derive(Debug, Clone, Copy, Default)]
pub struct NextUpstreamMask {
    pub error: bool,
    pub timeout: bool,
    pub invalid_header: bool,
    pub statuses: [bool; 6], // 403, 404, 500, 502, 503, 504
}

impl NextUpstreamMask {
    const STATUS_CODES: [u16; 6] = [403, 404, 500, 502, 503, 504];

    pub fn from_config(classes: &[NextUpstreamOn]) -> Self {
        let mut mask = Self {
            // `error` and `timeout` are the built-in default set.
            error: classes.is_empty(),
            timeout: classes.is_empty(),
            ..Self::default()
        };
        for class in classes {
            match class {
                NextUpstreamOn::Error => mask.error = true,
                NextUpstreamOn::Timeout => mask.timeout = true,
                NextUpstreamOn::InvalidHeader => mask.invalid_header = true,
                NextUpstreamOn::Http403 => mask.statuses[0] = true,
                NextUpstreamOn::Http404 => mask.statuses[1] = true,
                NextUpstreamOn::Http500 => mask.statuses[2] = true,
                NextUpstreamOn::Http502 => mask.statuses[3] = true,
                NextUpstreamOn::Http503 => mask.statuses[4] = true,
                NextUpstreamOn::Http504 => mask.statuses[5] = true,
            }
        }
        mask
    }

    pub fn covers_status(&self, status: StatusCode) -> bool {
        Self::STATUS_CODES
            .iter()
            .position(|&c| c == status.as_u16())
            .map(|i| self.statuses[i])
            .unwrap_or(false)
    }
}

/// Proxy options attached to a location with `proxy_pass`.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub upstream: String,
    pub buffering: bool,
    pub buffer_size: usize,
    pub bufs_num: usize,
    pub max_temp_file_size: u64,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub read_timeout: Duration,
    pub next_upstream: NextUpstreamMask,
    pub next_upstream_tries: u32,
    pub next_upstream_timeout: Option<Duration>,
    pub ignore_client_abort: bool,
    pub redirect_rewrite: bool,
    pub hide_headers: HashSet<HeaderName>,
    pub cache: Option<CacheOptions>,
}

/// A compiled location block — the runtime payload the tree hands back.
#[derive(Debug)]
pub struct Location {
    pub name: String,
    pub modifier: LocationModifier,
    pub internal: bool,
    /// Emit a `301` with a trailing slash when the URI matches this location
    /// name minus its final `/`.
    pub auto_redirect: bool,
    pub root: PathBuf,
    pub return_code: Option<StatusCode>,
    pub rewrites: Vec<RewriteRule>,
    pub try_files: Vec<String>,
    pub error_pages: Vec<ErrorPage>,
    pub recursive_error_pages: bool,
    pub satisfy: Satisfy,
    pub access: Vec<AccessRule>,
    pub client_max_body_size: u64,
    pub client_body_buffer_size: usize,
    pub client_body_in_file_only: BodyFileMode,
    /// Subrequest URIs whose bodies wrap the main response body.
    pub add_before_body: Option<String>,
    pub add_after_body: Option<String>,
    pub proxy: Option<ProxyOptions>,
}

impl Location {
    pub fn compile(config: &LocationConfig, server: &ServerConfig) -> Result<Arc<Self>> {
        let rewrites = config
            .rewrite
            .iter()
            .map(|r| {
                Ok(RewriteRule {
                    regex: Regex::new(&r.regex)
                        .with_context(|| format!("rewrite regex '{}'", r.regex))?,
                    replacement: r.replacement.clone(),
                    flag: r.flag,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let error_pages = config
            .error_page
            .iter()
            .map(|p| {
                Ok(ErrorPage {
                    codes: p
                        .codes
                        .iter()
                        .map(|&c| StatusCode::from_u16(c).context("bad error_page code"))
                        .collect::<Result<Vec<_>>>()?,
                    response: p
                        .response
                        .map(|c| StatusCode::from_u16(c).context("bad error_page override"))
                        .transpose()?,
                    uri: p.uri.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // Allow rules are checked before deny rules; an address matching
        // neither list is allowed.
        let mut access = Vec::new();
        for (list, allow) in [(&config.allow, true), (&config.deny, false)] {
            for net in list {
                let net = if net == "all" {
                    None
                } else {
                    Some(net.parse::<IpNetwork>()?)
                };
                access.push(AccessRule { net, allow });
            }
        }

        let proxy = match config.proxy_pass {
            Some(ref upstream) => Some(ProxyOptions {
                upstream: upstream.clone(),
                buffering: config.proxy_buffering,
                buffer_size: config.proxy_buffer_size,
                bufs_num: config.proxy_buffers,
                max_temp_file_size: config
                    .proxy_max_temp_file_size
                    .unwrap_or(1024 * 1024 * 1024),
                connect_timeout: config.proxy_connect_timeout,
                send_timeout: config.proxy_send_timeout,
                read_timeout: config.proxy_read_timeout,
                next_upstream: NextUpstreamMask::from_config(&config.proxy_next_upstream),
                next_upstream_tries: config.proxy_next_upstream_tries,
                next_upstream_timeout: config.proxy_next_upstream_timeout,
                ignore_client_abort: config.proxy_ignore_client_abort,
                redirect_rewrite: config.proxy_redirect,
                hide_headers: build_hide_set(&config.proxy_hide_header, &config.proxy_pass_header)?,
                cache: config.proxy_cache.as_ref().map(|zone| CacheOptions {
                    zone: zone.clone(),
                    key_expr: config.proxy_cache_key.clone(),
                    valid: config.proxy_cache_valid.clone(),
                    min_uses: config.proxy_cache_min_uses,
                    bypass: config.proxy_cache_bypass.clone(),
                    no_cache: config.proxy_no_cache.clone(),
                    use_stale_updating: config
                        .proxy_cache_use_stale
                        .contains(&UseStaleOn::Updating),
                    use_stale_error: config.proxy_cache_use_stale.contains(&UseStaleOn::Error)
                        || config.proxy_cache_use_stale.contains(&UseStaleOn::Timeout),
                    lock: config.proxy_cache_lock,
                    lock_timeout: config.proxy_cache_lock_timeout,
                }),
            }),
            None => None,
        };

        let auto_redirect = matches!(
            config.modifier,
            LocationModifier::Prefix | LocationModifier::PrefixNoRegex
        ) && config.pattern.len() > 1
            && config.pattern.ends_with('/')
            && proxy.is_some();

        Ok(Arc::new(Location {
            name: config.pattern.clone(),
            modifier: config.modifier,
            internal: config.internal,
            auto_redirect,
            root: PathBuf::from(config.root.as_deref().unwrap_or("html")),
            return_code: config
                .return_code
                .map(|c| StatusCode::from_u16(c).context("bad return code"))
                .transpose()?,
            rewrites,
            try_files: config.try_files.clone(),
            error_pages,
            recursive_error_pages: config.recursive_error_pages,
            satisfy: config.satisfy,
            access,
            client_max_body_size: config
                .client_max_body_size
                .unwrap_or(server.client_max_body_size),
            client_body_buffer_size: server.client_body_buffer_size,
            client_body_in_file_only: server.client_body_in_file_only,
            add_before_body: config.add_before_body.clone(),
            add_after_body: config.add_after_body.clone(),
            proxy,
        }))
    }

    /// Look up the `error_page` mapping for a status, if any.
    pub fn error_page_for(&self, status: StatusCode) -> Option<&ErrorPage> {
        self.error_pages.iter().find(|p| p.codes.contains(&status))
    }
}
