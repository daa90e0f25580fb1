//! Global mirror content: keywords, friend links, ad domains, the injected
//! script and filler templates.
//!
//! Loaded once from flat files and swapped wholesale on reload.

use crate::config::ContentConfig;
use crate::convert::{DictionaryConverter, ScriptConverter};
use crate::page::{html_entities, rand_str};
use anyhow::Context;
use parking_lot::RwLock;
use rand::Rng;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info};

static KEYWORD_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{keyword:(\d+)\}\}").expect("KEYWORD_TAG: hardcoded regex is valid")
});

/// Name of the fallback template in each filler directory
const COMMON_TEMPLATE: &str = "common";

/// One hidden outbound link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendLink {
    pub url: String,
    pub name: String,
}

/// Per-domain templates with a `common` fallback
#[derive(Debug, Clone, Default)]
struct TemplateSet {
    templates: HashMap<String, String>,
}

impl TemplateSet {
    fn load(dir: &Path) -> Self {
        let mut templates = HashMap::new();
        let Ok(entries) = std::fs::read_dir(dir) else {
            debug!(dir = %dir.display(), "Filler template directory not found");
            return Self { templates };
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("html") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(body) = std::fs::read_to_string(&path) {
                templates.insert(stem.to_string(), body);
            }
        }
        Self { templates }
    }

    fn for_domain(&self, domain: &str) -> Option<&str> {
        self.templates
            .get(domain)
            .or_else(|| self.templates.get(COMMON_TEMPLATE))
            .map(String::as_str)
    }
}

/// Everything the template pass needs that is not per-site
#[derive(Default)]
pub struct MirrorContent {
    /// HTML-entity encoded keywords
    pub keywords: Vec<String>,
    pub friend_links: HashMap<String, Vec<FriendLink>>,
    pub ad_domains: HashSet<String>,
    /// Payload served at the per-host inject path
    pub inject_js: String,
    keyword_lists: TemplateSet,
    article_lists: TemplateSet,
    converter: Option<Arc<dyn ScriptConverter>>,
}

impl MirrorContent {
    /// Load content files. Missing keyword, link, ad and script files yield
    /// empty content; a configured but unreadable dictionary is an error.
    pub fn load(config: &ContentConfig) -> anyhow::Result<Self> {
        let keywords = read_optional(&config.keywords_file)
            .map(|data| parse_keywords(&data))
            .unwrap_or_default();
        let friend_links = read_optional(&config.links_file)
            .map(|data| parse_friend_links(&data))
            .unwrap_or_default();
        let ad_domains = read_optional(&config.ad_domains_file)
            .map(|data| parse_ad_domains(&data))
            .unwrap_or_default();
        let inject_js = read_optional(&config.inject_js_file).unwrap_or_default();

        let converter: Option<Arc<dyn ScriptConverter>> = match &config.s2t_dictionary {
            Some(path) => {
                let dictionary = DictionaryConverter::load(path).with_context(|| {
                    format!("Failed to load s2t dictionary {}", path.display())
                })?;
                info!(path = %path.display(), entries = dictionary.len(), "s2t dictionary loaded");
                Some(Arc::new(dictionary))
            }
            None => None,
        };

        let content = Self {
            keywords,
            friend_links,
            ad_domains,
            inject_js,
            keyword_lists: TemplateSet::load(&config.keyword_list_dir),
            article_lists: TemplateSet::load(&config.article_list_dir),
            converter,
        };

        info!(
            keywords = content.keywords.len(),
            friend_link_domains = content.friend_links.len(),
            ad_domains = content.ad_domains.len(),
            inject_js_bytes = content.inject_js.len(),
            "Mirror content loaded"
        );
        Ok(content)
    }

    /// Set the keyword list, entity-encoding each entry (builder pattern)
    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| html_entities(k)).collect();
        self
    }

    /// Set the script converter (builder pattern)
    pub fn with_converter(mut self, converter: Arc<dyn ScriptConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Add a keyword-list filler template (builder pattern)
    pub fn with_keyword_list(mut self, name: &str, template: &str) -> Self {
        self.keyword_lists
            .templates
            .insert(name.to_string(), template.to_string());
        self
    }

    /// Add an article-list filler template (builder pattern)
    pub fn with_article_list(mut self, name: &str, template: &str) -> Self {
        self.article_lists
            .templates
            .insert(name.to_string(), template.to_string());
        self
    }

    pub fn converter(&self) -> Option<&dyn ScriptConverter> {
        self.converter.as_deref()
    }

    pub fn keyword(&self, index: usize) -> Option<&str> {
        self.keywords.get(index).map(String::as_str)
    }

    pub fn random_keyword_index(&self) -> Option<usize> {
        if self.keywords.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..self.keywords.len()))
    }

    pub fn is_ad_domain(&self, domain: &str) -> bool {
        self.ad_domains.contains(domain)
    }

    /// Hidden friend-link block for a domain, empty when none configured
    pub fn friend_links_html(&self, domain: &str) -> String {
        let Some(links) = self.friend_links.get(domain).filter(|l| !l.is_empty()) else {
            return String::new();
        };
        let mut html = String::from("<div style='display:none'>");
        for link in links {
            let _ = write!(
                html,
                "<a href='{}' target='_blank'>{}</a>",
                link.url, link.name
            );
        }
        html.push_str("</div>");
        html
    }

    /// Render the hidden filler block stored alongside each cached page.
    ///
    /// `{{scheme}}` is left in place; the template pass fills it per request.
    pub fn filler_html(&self, domain: &str) -> String {
        let mut html = String::from("<div style=\"display:none\">");
        if let Some(template) = self.keyword_lists.for_domain(domain) {
            html.push_str(&self.fill_keyword_list(template));
        }
        if let Some(template) = self.article_lists.for_domain(domain) {
            html.push_str(&self.fill_article_list(template, domain));
        }
        html.push_str("</div>");
        html
    }

    fn fill_keywords(&self, template: &str) -> String {
        KEYWORD_TAG
            .replace_all(template, |caps: &regex::Captures<'_>| {
                if self.keywords.is_empty() {
                    return String::new();
                }
                let index: usize = caps[1].parse().unwrap_or(0);
                self.keywords[index % self.keywords.len()].clone()
            })
            .into_owned()
    }

    fn fill_keyword_list(&self, template: &str) -> String {
        let filled = self.fill_keywords(template);
        replace_each(&filled, "{{rand_str}}", || rand_str(4, 8))
    }

    fn fill_article_list(&self, template: &str, domain: &str) -> String {
        let filled = self.fill_keywords(template);
        let filled = replace_each(&filled, "{{article_url}}", || {
            format!("{{{{scheme}}}}://{}/__news__/{}", domain, rand_str(4, 8))
        });
        replace_each(&filled, "{{article_title}}", || {
            self.random_keyword_index()
                .map(|i| self.keywords[i].clone())
                .unwrap_or_default()
        })
    }
}

/// Shared handle to the current content, swapped atomically on reload
#[derive(Clone, Default)]
pub struct ContentHandle {
    inner: Arc<RwLock<Arc<MirrorContent>>>,
}

impl ContentHandle {
    pub fn new(content: MirrorContent) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(content))),
        }
    }

    /// Snapshot used for the whole lifetime of one request
    pub fn current(&self) -> Arc<MirrorContent> {
        Arc::clone(&self.inner.read())
    }

    pub fn replace(&self, content: MirrorContent) {
        *self.inner.write() = Arc::new(content);
    }
}

/// Replace every occurrence of `needle`, generating a fresh value for each.
fn replace_each(haystack: &str, needle: &str, mut value: impl FnMut() -> String) -> String {
    let mut out = String::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(pos) = rest.find(needle) {
        out.push_str(&rest[..pos]);
        out.push_str(&value());
        rest = &rest[pos + needle.len()..];
    }
    out.push_str(rest);
    out
}

fn read_optional(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(data) => Some(data),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Content file not loaded");
            None
        }
    }
}

fn non_empty_lines(data: &str) -> impl Iterator<Item = &str> {
    data.lines()
        .map(|line| line.trim_end_matches('\r').trim())
        .filter(|line| !line.is_empty())
}

pub fn parse_keywords(data: &str) -> Vec<String> {
    non_empty_lines(data).map(html_entities).collect()
}

/// Lines of `domain||url,name||url,name`
pub fn parse_friend_links(data: &str) -> HashMap<String, Vec<FriendLink>> {
    let mut result = HashMap::new();
    for line in non_empty_lines(data) {
        let mut parts = line.split("||");
        let Some(domain) = parts.next() else {
            continue;
        };
        let links: Vec<FriendLink> = parts
            .filter_map(|item| {
                let (url, name) = item.split_once(',')?;
                if name.contains(',') {
                    return None;
                }
                Some(FriendLink {
                    url: url.to_string(),
                    name: name.to_string(),
                })
            })
            .collect();
        if !links.is_empty() {
            result.insert(domain.to_string(), links);
        }
    }
    result
}

pub fn parse_ad_domains(data: &str) -> HashSet<String> {
    non_empty_lines(data).map(str::to_lowercase).collect()
}
