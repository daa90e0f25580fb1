//! Mirrored site descriptors and the domain registry

use crate::config::{Config, ReplacePair, SiteConfig};
use crate::error::ConfigError;
use crate::page::html_entities;
use aho_corasick::{AhoCorasick, MatchKind};
use dashmap::DashMap;
use std::borrow::Cow;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// A validated, immutable mirror site. Replaced wholesale on update.
#[derive(Debug)]
pub struct Site {
    pub domain: String,
    pub origin: Url,
    origin_host: String,
    /// HTML-entity encoded replacement values, indexed like the find list
    replaces: Vec<String>,
    finds: Vec<String>,
    matcher: Option<AhoCorasick>,
    /// Matcher pattern id -> index into `finds`
    pattern_index: Vec<usize>,
    pub index_title: String,
    pub index_keywords: String,
    pub index_description: String,
    pub h1_replace: String,
    pub need_js: bool,
    pub s2t: bool,
    pub title_replace: bool,
    pub cache_enable: bool,
    pub cache_ttl: Duration,
}

impl Site {
    /// Build a site from its configuration record, appending the global pairs.
    pub fn from_config(
        domain: &str,
        config: &SiteConfig,
        global_replace: &[ReplacePair],
    ) -> Result<Self, ConfigError> {
        let origin = config.validate(domain)?;
        let host = origin.host_str().unwrap_or_default();
        let origin_host = match origin.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let mut finds = config.finds.clone();
        let mut replaces = config.replaces.clone();
        for pair in global_replace {
            finds.push(pair.find.clone());
            replaces.push(pair.replace.clone());
        }
        let replaces: Vec<String> = replaces.iter().map(|r| html_entities(r)).collect();

        let (patterns, pattern_index): (Vec<&str>, Vec<usize>) = finds
            .iter()
            .enumerate()
            .filter(|(_, find)| !find.is_empty())
            .map(|(i, find)| (find.as_str(), i))
            .unzip();

        let matcher = if patterns.is_empty() {
            None
        } else {
            let matcher = AhoCorasick::builder()
                .match_kind(MatchKind::LeftmostFirst)
                .build(&patterns)
                .map_err(|e| ConfigError::Matcher {
                    domain: domain.to_string(),
                    reason: e.to_string(),
                })?;
            Some(matcher)
        };

        Ok(Self {
            domain: domain.to_lowercase(),
            origin,
            origin_host,
            replaces,
            finds,
            matcher,
            pattern_index,
            index_title: html_entities(&config.index_title),
            index_keywords: html_entities(&config.index_keywords),
            index_description: html_entities(&config.index_description),
            h1_replace: config.h1_replace.clone(),
            need_js: config.need_js,
            s2t: config.s2t,
            title_replace: config.title_replace,
            cache_enable: config.cache_enable,
            cache_ttl: config.cache_ttl(),
        })
    }

    /// Origin `host[:port]` as it appears in absolute URLs
    pub fn origin_host(&self) -> &str {
        &self.origin_host
    }

    pub fn finds(&self) -> &[String] {
        &self.finds
    }

    pub fn replacement(&self, index: usize) -> Option<&str> {
        self.replaces.get(index).map(String::as_str)
    }

    /// Swap every find string for a `{{replace:N}}` tag.
    ///
    /// Single left-to-right scan: text produced by one match is never
    /// matched again.
    pub fn defer_replacements<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let Some(matcher) = &self.matcher else {
            return Cow::Borrowed(text);
        };
        if !matcher.is_match(text) {
            return Cow::Borrowed(text);
        }
        let mut out = String::with_capacity(text.len() + 16);
        matcher.replace_all_with(text, &mut out, |m, _, dst| {
            let index = self.pattern_index[m.pattern().as_usize()];
            let _ = write!(dst, "{{{{replace:{}}}}}", index);
            true
        });
        Cow::Owned(out)
    }
}

/// Provides the full list of site configuration records
pub trait SiteSource {
    fn list_all_sites(&self) -> Vec<(String, SiteConfig)>;
}

impl SiteSource for Config {
    fn list_all_sites(&self) -> Vec<(String, SiteConfig)> {
        let mut sites: Vec<_> = self
            .sites
            .iter()
            .map(|(domain, site)| (domain.to_lowercase(), site.clone()))
            .collect();
        sites.sort_by(|a, b| a.0.cmp(&b.0));
        sites
    }
}

/// Result of applying a new set of site records
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReloadResult {
    /// Newly registered domains
    pub added: Vec<String>,
    /// Domains no longer configured
    pub removed: Vec<String>,
    /// Domains whose record changed
    pub updated: Vec<String>,
    /// Records that failed validation, with the reason
    pub rejected: Vec<(String, String)>,
}

/// Concurrent domain -> site map with longest-suffix resolution
#[derive(Default)]
pub struct SiteRegistry {
    sites: DashMap<String, Arc<Site>>,
    /// Records currently registered with the global pairs they were built
    /// with, for change detection on reload
    records: DashMap<String, (SiteConfig, Vec<ReplacePair>)>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a request host to its site.
    ///
    /// `www.a.com` falls back to `a.com`, then to `com`; a single label
    /// never matches.
    pub fn resolve(&self, host: &str) -> Option<Arc<Site>> {
        let mut candidate = host;
        loop {
            let (_, rest) = candidate.split_once('.')?;
            if let Some(site) = self.sites.get(candidate) {
                return Some(Arc::clone(site.value()));
            }
            candidate = rest;
        }
    }

    /// Register or replace a site
    pub fn add(&self, site: Site) -> Arc<Site> {
        let site = Arc::new(site);
        self.sites.insert(site.domain.clone(), Arc::clone(&site));
        site
    }

    pub fn remove(&self, domain: &str) -> Option<Arc<Site>> {
        self.records.remove(domain);
        self.sites.remove(domain).map(|(_, site)| site)
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.sites.iter().map(|e| e.key().clone()).collect();
        domains.sort();
        domains
    }

    /// Bring the registry in line with a full list of records.
    ///
    /// Invalid records are rejected and leave any previous version of the
    /// site in place.
    pub fn apply(&self, source: &dyn SiteSource, global_replace: &[ReplacePair]) -> ReloadResult {
        let mut result = ReloadResult::default();
        let records = source.list_all_sites();

        for (domain, record) in &records {
            let previous = self.records.get(domain).map(|r| r.value().clone());
            if let Some((prev_record, prev_global)) = &previous {
                if prev_record == record && prev_global.as_slice() == global_replace {
                    continue;
                }
            }
            match Site::from_config(domain, record, global_replace) {
                Ok(site) => {
                    self.add(site);
                    self.records
                        .insert(domain.clone(), (record.clone(), global_replace.to_vec()));
                    if previous.is_some() {
                        result.updated.push(domain.clone());
                    } else {
                        result.added.push(domain.clone());
                    }
                }
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Rejected site configuration");
                    result.rejected.push((domain.clone(), e.to_string()));
                }
            }
        }

        for domain in self.domains() {
            if !records.iter().any(|(d, _)| *d == domain) {
                self.remove(&domain);
                result.removed.push(domain);
            }
        }

        info!(
            sites = self.len(),
            added = result.added.len(),
            updated = result.updated.len(),
            removed = result.removed.len(),
            rejected = result.rejected.len(),
            "Site registry updated"
        );
        result
    }
}
