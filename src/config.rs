use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Global configuration for the mirror
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Disk cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Outbound (origin) connection settings
    #[serde(default)]
    pub origin: OriginConfig,

    /// Search crawler lists
    #[serde(default)]
    pub crawler: CrawlerConfig,

    /// Keyword, friend-link, ad and filler content sources
    #[serde(default)]
    pub content: ContentConfig,

    /// License payload location
    #[serde(default)]
    pub license: LicenseConfig,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Mirrored sites, keyed by mirror domain
    #[serde(default)]
    pub sites: HashMap<String, SiteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 80)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Header set by the fronting web server carrying the original scheme
    #[serde(default = "default_scheme_header")]
    pub scheme_header: String,

    /// Maximum concurrently served connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            scheme_header: default_scheme_header(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Root directory of the response cache
    #[serde(default = "default_cache_root")]
    pub root: PathBuf,

    /// Buffers larger than this are dropped instead of returned to the pool
    #[serde(default = "default_max_pooled_bytes")]
    pub max_pooled_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            max_pooled_bytes: default_max_pooled_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OriginConfig {
    /// Replaces the client User-Agent on origin requests when set
    pub user_agent: Option<String>,

    /// Connect timeout in seconds (default: 30)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// TCP keep-alive in seconds (default: 30)
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    /// Maximum idle connections per origin host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Source addresses for origin connections.
    /// Empty means: detect public IPv4 addresses of the local interfaces.
    #[serde(default)]
    pub egress_addresses: Vec<IpAddr>,
}

impl OriginConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            user_agent: None,
            connect_timeout_secs: default_connect_timeout(),
            keepalive_secs: default_keepalive(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            egress_addresses: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CrawlerConfig {
    /// User-agent fragments identifying any search crawler
    #[serde(default)]
    pub spiders: Vec<String>,

    /// User-agent fragments of crawlers that may see mirrored content
    #[serde(default)]
    pub good_spiders: Vec<String>,
}

/// A find/replace pair applied to every site
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ReplacePair {
    pub find: String,
    pub replace: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContentConfig {
    /// One keyword per line
    #[serde(default = "default_keywords_file")]
    pub keywords_file: PathBuf,

    /// Lines of `domain||url,name||url,name`
    #[serde(default = "default_links_file")]
    pub links_file: PathBuf,

    /// Domains that get the ad script, one per line
    #[serde(default = "default_ad_domains_file")]
    pub ad_domains_file: PathBuf,

    /// Script served at the per-host inject path
    #[serde(default = "default_inject_js_file")]
    pub inject_js_file: PathBuf,

    /// Directory of keyword-list filler templates
    #[serde(default = "default_keyword_list_dir")]
    pub keyword_list_dir: PathBuf,

    /// Directory of article-list filler templates
    #[serde(default = "default_article_list_dir")]
    pub article_list_dir: PathBuf,

    /// OpenCC-style simplified to traditional character table
    pub s2t_dictionary: Option<PathBuf>,

    /// Pairs appended to every site's find/replace list
    #[serde(default)]
    pub global_replace: Vec<ReplacePair>,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            keywords_file: default_keywords_file(),
            links_file: default_links_file(),
            ad_domains_file: default_ad_domains_file(),
            inject_js_file: default_inject_js_file(),
            keyword_list_dir: default_keyword_list_dir(),
            article_list_dir: default_article_list_dir(),
            s2t_dictionary: None,
            global_replace: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LicenseConfig {
    /// Decrypted license payload (`{"ip_list": [...], "date": "YYYY-MM-DD"}`).
    /// Without it every request is allowed.
    pub file: Option<PathBuf>,
}

/// Log line format
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

/// Configuration record for a single mirrored site
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SiteConfig {
    /// Origin URL content is fetched from
    pub url: String,

    #[serde(default)]
    pub index_title: String,

    #[serde(default)]
    pub index_keywords: String,

    #[serde(default)]
    pub index_description: String,

    /// Literal strings to replace, paired by index with `replaces`
    #[serde(default)]
    pub finds: Vec<String>,

    #[serde(default)]
    pub replaces: Vec<String>,

    /// Text forced into the first `<h1>` (empty: untouched)
    #[serde(default)]
    pub h1_replace: String,

    /// Keep origin scripts
    #[serde(default)]
    pub need_js: bool,

    /// Convert simplified Chinese to traditional
    #[serde(default)]
    pub s2t: bool,

    /// Splice a random keyword into non-index titles
    #[serde(default)]
    pub title_replace: bool,

    #[serde(default = "default_cache_enable")]
    pub cache_enable: bool,

    /// Cache lifetime in seconds (0 falls back to the default)
    #[serde(default = "default_cache_time")]
    pub cache_time_secs: u64,
}

impl SiteConfig {
    /// Create a site record with defaults for the given origin
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            index_title: String::new(),
            index_keywords: String::new(),
            index_description: String::new(),
            finds: Vec::new(),
            replaces: Vec::new(),
            h1_replace: String::new(),
            need_js: false,
            s2t: false,
            title_replace: false,
            cache_enable: default_cache_enable(),
            cache_time_secs: default_cache_time(),
        }
    }

    /// Set find/replace pairs (builder pattern)
    pub fn with_replacements(mut self, pairs: &[(&str, &str)]) -> Self {
        self.finds = pairs.iter().map(|(f, _)| f.to_string()).collect();
        self.replaces = pairs.iter().map(|(_, r)| r.to_string()).collect();
        self
    }

    /// Set index page title, keywords and description (builder pattern)
    pub fn with_index_meta(mut self, title: &str, keywords: &str, description: &str) -> Self {
        self.index_title = title.to_string();
        self.index_keywords = keywords.to_string();
        self.index_description = description.to_string();
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        if self.cache_time_secs == 0 {
            Duration::from_secs(default_cache_time())
        } else {
            Duration::from_secs(self.cache_time_secs)
        }
    }

    /// Validate the record and return the parsed origin URL
    pub fn validate(&self, domain: &str) -> Result<Url, ConfigError> {
        if !is_valid_domain(domain) {
            return Err(ConfigError::InvalidDomain {
                domain: domain.to_string(),
            });
        }

        let url = Url::parse(&self.url).map_err(|e| ConfigError::InvalidOriginUrl {
            domain: domain.to_string(),
            url: self.url.clone(),
            reason: e.to_string(),
        })?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::InvalidOriginUrl {
                domain: domain.to_string(),
                url: self.url.clone(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        if url.host_str().is_none() {
            return Err(ConfigError::InvalidOriginUrl {
                domain: domain.to_string(),
                url: self.url.clone(),
                reason: "missing host".to_string(),
            });
        }

        if self.finds.len() != self.replaces.len() {
            return Err(ConfigError::MismatchedReplacePairs {
                domain: domain.to_string(),
                finds: self.finds.len(),
                replaces: self.replaces.len(),
            });
        }

        Ok(url)
    }
}

/// Maximum hostname length (RFC 1035)
const MAX_DOMAIN_LEN: usize = 253;

fn is_valid_domain(domain: &str) -> bool {
    !domain.is_empty()
        && domain.len() <= MAX_DOMAIN_LEN
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

// Default value functions
fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_scheme_header() -> String {
    "x-forwarded-proto".to_string()
}

fn default_max_connections() -> usize {
    256 * 2048
}

fn default_cache_root() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_max_pooled_bytes() -> usize {
    1 << 20 // 1 MiB
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_keepalive() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_keywords_file() -> PathBuf {
    PathBuf::from("config/keywords.txt")
}

fn default_links_file() -> PathBuf {
    PathBuf::from("config/links.txt")
}

fn default_ad_domains_file() -> PathBuf {
    PathBuf::from("config/ad_domains.txt")
}

fn default_inject_js_file() -> PathBuf {
    PathBuf::from("config/inject.js")
}

fn default_keyword_list_dir() -> PathBuf {
    PathBuf::from("keyword_list")
}

fn default_article_list_dir() -> PathBuf {
    PathBuf::from("article_list")
}

fn default_cache_enable() -> bool {
    true
}

fn default_cache_time() -> u64 {
    88_888_888
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the process-wide settings.
    ///
    /// Site records are checked one by one when they are registered, so a
    /// bad record only rejects its own site.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.max_connections == 0 {
            errors.push("server.max_connections must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            errors.sort();
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
