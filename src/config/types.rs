use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Deserialize a `T` that implements `Default` — treats JSON `null` the same
/// as a missing field (returns `T::default()`).
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Durations are written as humantime strings in the config file ("30s",
/// "10m", "1h 30m").
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*d).to_string())
    }
}

/// Same as [`duration_str`] but for `Option<Duration>`.
pub mod opt_duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => humantime::parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }

    pub fn serialize<S>(d: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match d {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }
}

/// Top-level proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub upstream: Vec<UpstreamConfig>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub cache_path: Vec<CachePathConfig>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub location: Vec<LocationConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            server: ServerConfig::default(),
            upstream: Vec::new(),
            cache_path: Vec::new(),
            location: Vec::new(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

/// Downstream-facing server options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Reject request bodies larger than this (413). 0 disables the check.
    #[serde(default = "default_max_body")]
    pub client_max_body_size: u64,

    /// In-memory ceiling before the request body spills to disk.
    #[serde(default = "default_body_buffer")]
    pub client_body_buffer_size: usize,

    /// off | on | clean — always spill the body; `clean` unlinks at finalize.
    #[serde(default)]
    pub client_body_in_file_only: BodyFileMode,

    /// Directory for request-body and response spill files.
    #[serde(default = "default_temp_dir")]
    pub temp_path: String,

    /// Downstream write idle timeout.
    #[serde(with = "duration_str", default = "default_send_timeout")]
    pub send_timeout: Duration,

    /// Downstream idle keepalive timeout. Zero disables keepalive.
    #[serde(with = "duration_str", default = "default_keepalive_timeout")]
    pub keepalive_timeout: Duration,

    /// Max requests served on one downstream connection.
    #[serde(default = "default_keepalive_requests")]
    pub keepalive_requests: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            client_max_body_size: default_max_body(),
            client_body_buffer_size: default_body_buffer(),
            client_body_in_file_only: BodyFileMode::Off,
            temp_path: default_temp_dir(),
            send_timeout: default_send_timeout(),
            keepalive_timeout: default_keepalive_timeout(),
            keepalive_requests: default_keepalive_requests(),
        }
    }
}

fn default_max_body() -> u64 {
    1024 * 1024
}

fn default_body_buffer() -> usize {
    16 * 1024
}

fn default_temp_dir() -> String {
    "/tmp/talaria".to_string()
}

fn default_send_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_keepalive_timeout() -> Duration {
    Duration::from_secs(75)
}

fn default_keepalive_requests() -> u32 {
    1000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyFileMode {
    #[default]
    Off,
    On,
    Clean,
}

/// One upstream group: an ordered list of peers plus group-level options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub server: Vec<PeerConfig>,

    /// Size of the idle-connection pool kept per group. 0 disables pooling.
    #[serde(default)]
    pub keepalive: usize,
}

/// One `server addr [weight=N] [max_fails=N] [fail_timeout=T] [down] [backup]`
/// entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub addr: String,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default = "default_max_fails")]
    pub max_fails: u32,

    #[serde(with = "duration_str", default = "default_fail_timeout")]
    pub fail_timeout: Duration,

    #[serde(default)]
    pub down: bool,

    #[serde(default)]
    pub backup: bool,
}

fn default_weight() -> u32 {
    1
}

fn default_max_fails() -> u32 {
    1
}

fn default_fail_timeout() -> Duration {
    Duration::from_secs(10)
}

/// One cache instantiation:
/// `path levels=L keys_zone=name inactive=T max_size=S [use_temp_path=off]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePathConfig {
    /// Zone name locations refer to via `proxy_cache`.
    pub name: String,

    pub path: String,

    /// Hash-prefix directory levels, e.g. "1:2" for `<c>/<ab>/<hash>`.
    #[serde(default = "default_levels")]
    pub levels: String,

    /// Entries not touched for this long are removed by the manager.
    #[serde(with = "duration_str", default = "default_inactive")]
    pub inactive: Duration,

    /// Total on-disk budget; the manager evicts LRU past it. 0 = unbounded.
    #[serde(default)]
    pub max_size: u64,

    /// When false, temp files live under `temp_path` and population falls
    /// back to a copy if the cache root is on another filesystem. When true
    /// (the default here) temp files live under `<path>/temp` so the final
    /// rename is always within one filesystem.
    #[serde(default = "default_true")]
    pub use_temp_path: bool,
}

fn default_levels() -> String {
    "1:2".to_string()
}

fn default_inactive() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_true() -> bool {
    true
}

/// Location selector modifier: `location [= | ^~ | ~ | ~* | @] pattern`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationModifier {
    /// Plain longest-prefix match.
    #[default]
    Prefix,
    /// `=` full-string equality.
    Exact,
    /// `^~` prefix match that suppresses the regex pass.
    PrefixNoRegex,
    /// `~` case-sensitive regex.
    Regex,
    /// `~*` case-insensitive regex.
    RegexInsensitive,
    /// `@` named location, reachable only via internal redirects.
    Named,
}

/// `satisfy all | any` for the ACCESS phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Satisfy {
    #[default]
    All,
    Any,
}

/// `error_page code... [=override] uri`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPageConfig {
    pub codes: Vec<u16>,

    /// Replacement status (`=CODE`); `None` keeps the original.
    #[serde(default)]
    pub response: Option<u16>,

    /// Internal redirect target; `@name` targets a named location.
    pub uri: String,
}

/// `rewrite regex replacement [last|break]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteRuleConfig {
    pub regex: String,
    pub replacement: String,

    #[serde(default)]
    pub flag: RewriteFlag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewriteFlag {
    /// Re-enter location matching with the rewritten URI.
    #[default]
    Last,
    /// Stop rewriting but stay in the current location.
    Break,
}

/// Validity window per status class: `cache_valid codes ttl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheValidConfig {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub codes: Vec<u16>,

    #[serde(with = "duration_str")]
    pub ttl: Duration,
}

/// Failure classes that may trigger `next_upstream` failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextUpstreamOn {
    Error,
    Timeout,
    InvalidHeader,
    Http403,
    Http404,
    Http500,
    Http502,
    Http503,
    Http504,
}

/// `proxy_cache_use_stale` classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseStaleOn {
    /// Serve stale while another request refreshes the entry.
    Updating,
    Error,
    Timeout,
}

/// One location block. Compiled into `location::Location` at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    #[serde(default)]
    pub modifier: LocationModifier,

    pub pattern: String,

    /// Restrict to internal-redirect entry only.
    #[serde(default)]
    pub internal: bool,

    /// Document root for static serving and try_files checks.
    #[serde(default)]
    pub root: Option<String>,

    /// Respond with this status from the rewrite phase.
    #[serde(rename = "return", default)]
    pub return_code: Option<u16>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub rewrite: Vec<RewriteRuleConfig>,

    /// `try_files path... fallback` — entries may use `$uri`.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub try_files: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub error_page: Vec<ErrorPageConfig>,

    #[serde(default)]
    pub recursive_error_pages: bool,

    #[serde(default)]
    pub satisfy: Satisfy,

    /// CIDR allow list for the ACCESS phase; "all" is accepted.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub allow: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub deny: Vec<String>,

    /// Per-location override of the body-size cap.
    #[serde(default)]
    pub client_max_body_size: Option<u64>,

    /// Subrequest whose body is emitted before the main response body.
    /// Applies to main requests only; the combined length becomes unknown.
    #[serde(default)]
    pub add_before_body: Option<String>,

    /// Subrequest whose body is emitted after the main response body.
    #[serde(default)]
    pub add_after_body: Option<String>,

    // ---- proxy options ----
    /// Name of the upstream group to proxy to. Presence makes this location
    /// a proxy location (its content handler is the upstream client).
    #[serde(default)]
    pub proxy_pass: Option<String>,

    #[serde(default = "default_true")]
    pub proxy_buffering: bool,

    /// Header receive buffer; also the single relay buffer when
    /// `proxy_buffering = false`.
    #[serde(default = "default_proxy_buffer_size")]
    pub proxy_buffer_size: usize,

    /// Number of streaming-pipe buffers.
    #[serde(default = "default_proxy_buffers_num")]
    pub proxy_buffers: usize,

    #[serde(default)]
    pub proxy_max_temp_file_size: Option<u64>,

    #[serde(with = "duration_str", default = "default_connect_timeout")]
    pub proxy_connect_timeout: Duration,

    #[serde(with = "duration_str", default = "default_rw_timeout")]
    pub proxy_send_timeout: Duration,

    #[serde(with = "duration_str", default = "default_rw_timeout")]
    pub proxy_read_timeout: Duration,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub proxy_next_upstream: Vec<NextUpstreamOn>,

    /// 0 means "bounded only by the number of peers".
    #[serde(default)]
    pub proxy_next_upstream_tries: u32,

    #[serde(with = "opt_duration_str", default)]
    pub proxy_next_upstream_timeout: Option<Duration>,

    /// Continue an upstream fetch after the client goes away.
    #[serde(default)]
    pub proxy_ignore_client_abort: bool,

    /// Rewrite 3xx `Location` values that point at the upstream itself.
    #[serde(default = "default_true")]
    pub proxy_redirect: bool,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub proxy_hide_header: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub proxy_pass_header: Vec<String>,

    // ---- cache options ----
    /// Cache zone name; presence opts the location into caching.
    #[serde(default)]
    pub proxy_cache: Option<String>,

    /// Key expression, e.g. "$host$uri$is_args$args".
    #[serde(default = "default_cache_key")]
    pub proxy_cache_key: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub proxy_cache_valid: Vec<CacheValidConfig>,

    /// Entries are stored only after this many lookups of the same key.
    #[serde(default = "default_min_uses")]
    pub proxy_cache_min_uses: u32,

    /// Skip the cache lookup when any of these variables is non-empty.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub proxy_cache_bypass: Vec<String>,

    /// Skip the cache store when any of these variables is non-empty.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub proxy_no_cache: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub proxy_cache_use_stale: Vec<UseStaleOn>,

    /// At-most-one concurrent fetch per key.
    #[serde(default)]
    pub proxy_cache_lock: bool,

    #[serde(with = "duration_str", default = "default_cache_lock_timeout")]
    pub proxy_cache_lock_timeout: Duration,
}

fn default_proxy_buffer_size() -> usize {
    8 * 1024
}

fn default_proxy_buffers_num() -> usize {
    8
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_rw_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_cache_key() -> String {
    "$host$uri$is_args$args".to_string()
}

fn default_min_uses() -> u32 {
    1
}

fn default_cache_lock_timeout() -> Duration {
    Duration::from_secs(5)
}
