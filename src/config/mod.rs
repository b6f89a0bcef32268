pub mod types;


pub use types::*;

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;

impl Config {
    /// Load configuration from a file. `.toml` and `.json` are accepted;
    /// a missing file yields the built-in defaults so the proxy can start
    /// with zero configuration for local development.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            Config::default()
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.listen
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("invalid listen address '{}'", self.listen))?;

        let mut upstream_names = HashSet::new();
        for up in &self.upstream {
            if up.name.is_empty() {
                anyhow::bail!("upstream group without a name");
            }
            if !upstream_names.insert(up.name.as_str()) {
                anyhow::bail!("duplicate upstream group '{}'", up.name);
            }
            if up.server.is_empty() {
                anyhow::bail!("upstream '{}' has no servers", up.name);
            }
            if up.server.iter().all(|s| s.down || s.backup) {
                anyhow::bail!("upstream '{}' has no usable primary server", up.name);
            }
            for server in &up.server {
                server
                    .addr
                    .parse::<std::net::SocketAddr>()
                    .with_context(|| {
                        format!("upstream '{}': invalid address '{}'", up.name, server.addr)
                    })?;
                if server.weight == 0 {
                    anyhow::bail!("upstream '{}': weight must be positive", up.name);
                }
            }
        }

        let mut zone_names = HashSet::new();
        for zone in &self.cache_path {
            if zone.name.is_empty() || zone.path.is_empty() {
                anyhow::bail!("cache_path requires both name and path");
            }
            if !zone_names.insert(zone.name.as_str()) {
                anyhow::bail!("duplicate cache zone '{}'", zone.name);
            }
            parse_levels(&zone.levels)
                .with_context(|| format!("cache zone '{}': bad levels '{}'", zone.name, zone.levels))?;
        }

        let mut seen_named = HashSet::new();
        for loc in &self.location {
            if loc.pattern.is_empty() {
                anyhow::bail!("location with empty pattern");
            }
            match loc.modifier {
                LocationModifier::Named => {
                    if !loc.pattern.starts_with('@') {
                        anyhow::bail!("named location '{}' must start with '@'", loc.pattern);
                    }
                    if !seen_named.insert(loc.pattern.as_str()) {
                        anyhow::bail!("duplicate named location '{}'", loc.pattern);
                    }
                }
                LocationModifier::Regex | LocationModifier::RegexInsensitive => {
                    regex::Regex::new(&loc.pattern).with_context(|| {
                        format!("location regex '{}' does not compile", loc.pattern)
                    })?;
                }
                _ => {
                    if !loc.pattern.starts_with('/') {
                        anyhow::bail!("location '{}' must start with '/'", loc.pattern);
                    }
                }
            }
            for rule in &loc.rewrite {
                regex::Regex::new(&rule.regex).with_context(|| {
                    format!("rewrite regex '{}' does not compile", rule.regex)
                })?;
            }
            if let Some(ref name) = loc.proxy_pass {
                if !upstream_names.contains(name.as_str()) {
                    anyhow::bail!(
                        "location '{}': proxy_pass references unknown upstream '{}'",
                        loc.pattern,
                        name
                    );
                }
            }
            if let Some(ref zone) = loc.proxy_cache {
                if !zone_names.contains(zone.as_str()) {
                    anyhow::bail!(
                        "location '{}': proxy_cache references unknown zone '{}'",
                        loc.pattern,
                        zone
                    );
                }
                if loc.proxy_pass.is_none() {
                    anyhow::bail!(
                        "location '{}': proxy_cache without proxy_pass",
                        loc.pattern
                    );
                }
            }
            for net in loc.allow.iter().chain(loc.deny.iter()) {
                if net != "all" {
                    net.parse::<ipnetwork::IpNetwork>().with_context(|| {
                        format!("location '{}': bad network '{}'", loc.pattern, net)
                    })?;
                }
            }
            if loc.proxy_buffers < 2 {
                anyhow::bail!(
                    "location '{}': proxy_buffers must be at least 2",
                    loc.pattern
                );
            }
            for page in &loc.error_page {
                if page.codes.is_empty() {
                    anyhow::bail!("location '{}': error_page without codes", loc.pattern);
                }
                for code in &page.codes {
                    if !(300..=599).contains(code) {
                        anyhow::bail!(
                            "location '{}': error_page code {} out of range",
                            loc.pattern,
                            code
                        );
                    }
                }
            }
        }

        Ok(())
    }
}

/// Parse a `levels` spec like "1:2" into per-level hex widths. Each level
/// takes 1 or 2 hex characters from the tail of the key hash; at most 3
/// levels are allowed.
pub fn parse_levels(spec: &str) -> Result<Vec<usize>> {
    let mut levels = Vec::new();
    for part in spec.split(':') {
        let n: usize = part
            .parse()
            .map_err(|_| anyhow::anyhow!("level component '{}' is not a number", part))?;
        if n == 0 || n > 2 {
            anyhow::bail!("level width must be 1 or 2, got {}", n);
        }
        levels.push(n);
    }
    if levels.is_empty() || levels.len() > 3 {
        anyhow::bail!("levels must have 1..=3 components");
    }
    Ok(levels)
}
