use super::Location;
use crate::config::{LocationConfig, LocationModifier, ServerConfig};
use anyhow::Result;
use regex::{Regex, RegexBuilder};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Result of a location lookup.
#[derive(Debug, Clone)]
pub enum Match {
    Config(Arc<Location>),
    /// The URI equals a `dir/` location minus its trailing slash; the caller
    /// should answer with a `301` to `uri + "/"`.
    AutoRedirect,
}

/// A node in the ternary prefix tree. `left`/`right` order lexicographic
/// siblings; `tree` holds nested locations whose names extend this prefix.
#[derive(Debug)]
struct Node {
    prefix: Box<[u8]>,
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
    tree: Option<Box<Node>>,
    exact: Option<Arc<Location>>,
    inclusive: Option<Arc<Location>>,
    /// The inclusive payload suppresses the regex pass (`^~`).
    noregex: bool,
    auto_redirect: bool,
}

/// One literal pattern with up to two payloads (`=` and prefix forms of the
/// same pattern collapse into a single tree entry).
struct LiteralEntry {
    name: String,
    exact: Option<Arc<Location>>,
    inclusive: Option<Arc<Location>>,
    noregex: bool,
    auto_redirect: bool,
}

/// Immutable location matcher, built once at configuration time.
///
/// Precedence (highest first): exact match, longest `^~` prefix, first
/// matching regex in configuration order, longest plain prefix. Named
/// (`@`) locations are reachable only through [`LocationTree::named`].
pub struct LocationTree {
    root: Option<Box<Node>>,
    regexes: Vec<(Regex, Arc<Location>)>,
    named: HashMap<String, Arc<Location>>,
    fallback: Arc<Location>,
}

impl LocationTree {
    pub fn build(configs: &[LocationConfig], server: &ServerConfig) -> Result<Self> {
        let mut literals: Vec<LiteralEntry> = Vec::new();
        let mut regexes = Vec::new();
        let mut named = HashMap::new();
        let mut fallback = None;

        for config in configs {
            let location = Location::compile(config, server)?;
            match config.modifier {
                LocationModifier::Named => {
                    named.insert(config.pattern.clone(), location);
                }
                LocationModifier::Regex | LocationModifier::RegexInsensitive => {
                    let re = RegexBuilder::new(&config.pattern)
                        .case_insensitive(config.modifier == LocationModifier::RegexInsensitive)
                        .build()?;
                    regexes.push((re, location));
                }
                _ => {
                    if config.pattern == "/"
                        && config.modifier != LocationModifier::Exact
                    {
                        fallback = Some(location.clone());
                    }
                    merge_literal(&mut literals, config.modifier, location);
                }
            }
        }

        // "/" is the guaranteed fallback; synthesize one when absent.
        let fallback = match fallback {
            Some(loc) => loc,
            None => {
                let root_config = LocationConfig {
                    modifier: LocationModifier::Prefix,
                    pattern: "/".to_string(),
                    ..default_location()
                };
                let loc = Location::compile(&root_config, server)?;
                merge_literal(&mut literals, LocationModifier::Prefix, loc.clone());
                loc
            }
        };

        literals.sort_by(|a, b| a.name.cmp(&b.name));
        let root = build_tree(&literals, 0);

        Ok(Self {
            root,
            regexes,
            named,
            fallback,
        })
    }

    /// Select the location governing `uri` (path component only, no query).
    pub fn find(&self, uri: &str) -> Match {
        let walk = self.walk_literals(uri.as_bytes());

        if let Some(loc) = walk.exact {
            return Match::Config(loc);
        }
        if walk.noregex {
            if let Some(loc) = walk.inclusive {
                return Match::Config(loc);
            }
        }
        for (re, loc) in &self.regexes {
            if re.is_match(uri) {
                return Match::Config(loc.clone());
            }
        }
        if let Some(loc) = walk.inclusive {
            return Match::Config(loc);
        }
        if walk.auto_redirect {
            return Match::AutoRedirect;
        }
        Match::Config(self.fallback.clone())
    }

    /// Resolve a named (`@`) location.
    pub fn named(&self, name: &str) -> Option<Arc<Location>> {
        self.named.get(name).cloned()
    }

    fn walk_literals(&self, uri: &[u8]) -> LiteralWalk {
        let mut walk = LiteralWalk::default();
        let mut node = self.root.as_deref();
        let mut offset = 0;

        while let Some(n) = node {
            let rest = &uri[offset..];
            let common = rest.len().min(n.prefix.len());
            match rest[..common].cmp(&n.prefix[..common]) {
                Ordering::Less => {
                    node = n.left.as_deref();
                }
                Ordering::Greater => {
                    node = n.right.as_deref();
                }
                Ordering::Equal => match rest.len().cmp(&n.prefix.len()) {
                    Ordering::Greater => {
                        if n.inclusive.is_some() {
                            // Record the candidate and descend into nested
                            // longer prefixes.
                            walk.inclusive = n.inclusive.clone();
                            walk.noregex = n.noregex;
                            offset += n.prefix.len();
                            node = n.tree.as_deref();
                        } else {
                            // Exact-only entry; longer URIs sort after it.
                            node = n.right.as_deref();
                        }
                    }
                    Ordering::Equal => {
                        if n.exact.is_some() {
                            walk.exact = n.exact.clone();
                        } else {
                            walk.inclusive = n.inclusive.clone();
                            walk.noregex = n.noregex;
                        }
                        break;
                    }
                    Ordering::Less => {
                        // URI is a proper prefix of this node; a `dir/`
                        // location one byte longer asks for a redirect.
                        if n.auto_redirect && n.prefix.len() == rest.len() + 1 {
                            walk.auto_redirect = true;
                        }
                        node = n.left.as_deref();
                    }
                },
            }
        }

        walk
    }
}

#[derive(Default)]
struct LiteralWalk {
    exact: Option<Arc<Location>>,
    inclusive: Option<Arc<Location>>,
    noregex: bool,
    auto_redirect: bool,
}

fn merge_literal(
    literals: &mut Vec<LiteralEntry>,
    modifier: LocationModifier,
    location: Arc<Location>,
) {
    let idx = match literals.iter().position(|e| e.name == location.name) {
        Some(idx) => idx,
        None => {
            literals.push(LiteralEntry {
                name: location.name.clone(),
                exact: None,
                inclusive: None,
                noregex: false,
                auto_redirect: false,
            });
            literals.len() - 1
        }
    };
    let entry = &mut literals[idx];
    if modifier == LocationModifier::Exact {
        entry.exact = Some(location);
    } else {
        entry.noregex = modifier == LocationModifier::PrefixNoRegex;
        entry.auto_redirect = location.auto_redirect;
        entry.inclusive = Some(location);
    }
}

/// Recursive balanced build: sorted input, split at the median; entries that
/// extend the median's name become its nested `tree` child.
fn build_tree(entries: &[LiteralEntry], skip: usize) -> Option<Box<Node>> {
    if entries.is_empty() {
        return None;
    }
    let mid = entries.len() / 2;
    let entry = &entries[mid];

    let rest = &entries[mid + 1..];
    let nested = rest
        .iter()
        .take_while(|e| e.name.as_bytes().starts_with(entry.name.as_bytes()))
        .count();

    Some(Box::new(Node {
        prefix: entry.name.as_bytes()[skip..].to_vec().into_boxed_slice(),
        left: build_tree(&entries[..mid], skip),
        tree: build_tree(&rest[..nested], entry.name.len()),
        right: build_tree(&rest[nested..], skip),
        exact: entry.exact.clone(),
        inclusive: entry.inclusive.clone(),
        noregex: entry.noregex,
        auto_redirect: entry.auto_redirect,
    }))
}

fn default_location() -> LocationConfig {
    // serde defaults; the empty TOML table is every-field-default.
    toml::from_str::<LocationConfig>("pattern = '/'").expect("default location")
}
