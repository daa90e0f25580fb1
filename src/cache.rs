//! Content-addressed disk cache of rewritten origin responses
//!
//! Layout: `<root>/<domain>/<hash[0:2]>/<hash>` where `hash` is the
//! sha256 of the cache key. The file modification time is the fetch time.

use crate::error::CacheError;
use hyper::header::{HeaderMap, CONTENT_TYPE};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

static CHARSET_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)charset\s*=\s*[^;\s]+").expect("CHARSET_PARAM: hardcoded regex is valid")
});

/// Response headers never stored: the body is kept decoded and policy-free,
/// and framing is recomputed when served.
const DROPPED_HEADERS: &[&str] = &[
    "content-encoding",
    "content-security-policy",
    "content-length",
    "transfer-encoding",
    "connection",
];

/// One cached response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Hidden filler block rendered when the page was fetched
    pub filler_html: String,
}

impl CacheEntry {
    /// Build an entry from an origin response. Encoding and security policy
    /// headers are dropped and any charset is rewritten to utf-8, since the
    /// stored body is always decoded.
    pub fn new(status: u16, headers: &HeaderMap, body: Vec<u8>, filler_html: String) -> Self {
        Self {
            status,
            headers: normalize_headers(headers),
            body,
            filler_html,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> &str {
        self.header("content-type").unwrap_or_default()
    }
}

/// Cache key for a request: domain, path and query concatenated
pub fn cache_key(domain: &str, path: &str, query: &str) -> String {
    let mut key = String::with_capacity(domain.len() + path.len() + query.len() + 1);
    key.push_str(domain);
    key.push_str(path);
    if !query.is_empty() {
        key.push('?');
        key.push_str(query);
    }
    key
}

pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sharded file path of a key
    pub fn entry_path(&self, domain: &str, key: &str) -> PathBuf {
        let hash = hex::encode(Sha256::digest(key.as_bytes()));
        self.root.join(domain).join(&hash[..2]).join(&hash)
    }

    /// Look up an entry. Expired entries are a miss unless `force` is set.
    pub fn get(&self, domain: &str, key: &str, ttl: Duration, force: bool) -> Option<CacheEntry> {
        self.get_at(domain, key, ttl, force, SystemTime::now())
    }

    /// [`DiskCache::get`] evaluated at a given instant
    pub fn get_at(
        &self,
        domain: &str,
        key: &str,
        ttl: Duration,
        force: bool,
        now: SystemTime,
    ) -> Option<CacheEntry> {
        let path = self.entry_path(domain, key);
        let metadata = std::fs::metadata(&path).ok()?;

        if !force {
            let fetched_at = metadata.modified().ok()?;
            // A ttl past the end of representable time never expires
            let expired = fetched_at.checked_add(ttl).is_some_and(|expires| now > expires);
            if expired {
                debug!(domain, key, "Cache entry expired");
                return None;
            }
        }

        match read_entry(&path) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(domain, key, error = %e, "Unreadable cache entry treated as miss");
                None
            }
        }
    }

    /// Store a response. Readers only ever see complete files: the entry is
    /// written to a temp file in the shard directory and renamed into place.
    pub fn put(
        &self,
        domain: &str,
        key: &str,
        status: u16,
        headers: &HeaderMap,
        body: &[u8],
        filler_html: &str,
    ) -> Result<CacheEntry, CacheError> {
        let entry = CacheEntry::new(status, headers, body.to_vec(), filler_html.to_string());
        self.store(domain, key, &entry)?;
        Ok(entry)
    }

    pub fn store(&self, domain: &str, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        let path = self.entry_path(domain, key);
        let dir = path.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(dir)?;

        let encoded = bincode::serialize(entry)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&encoded)?;
        tmp.persist(&path)?;

        debug!(domain, key, bytes = encoded.len(), "Cache entry stored");
        Ok(())
    }

    /// Remove every entry of a domain
    pub fn purge(&self, domain: &str) -> Result<(), CacheError> {
        let dir = self.root.join(domain);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn read_entry(path: &Path) -> Result<CacheEntry, CacheError> {
    let data = std::fs::read(path)?;
    Ok(bincode::deserialize(&data)?)
}

fn normalize_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !DROPPED_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            let value = value.to_str().ok()?;
            if *name == CONTENT_TYPE {
                let value = CHARSET_PARAM.replace(value, "charset=utf-8");
                return Some((name.as_str().to_string(), value.into_owned()));
            }
            Some((name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;
    use std::fs::File;

    fn headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=GBK"));
        headers.insert("content-encoding", HeaderValue::from_static("gzip"));
        headers.insert("content-security-policy", HeaderValue::from_static("default-src 'self'"));
        headers.insert("x-origin", HeaderValue::from_static("1"));
        headers
    }

    fn set_fetched_at(path: &Path, at: SystemTime) {
        File::options().write(true).open(path).unwrap().set_modified(at).unwrap();
    }

    #[test]
    fn test_cache_key() {
        assert_eq!(cache_key("a.com", "/x", ""), "a.com/x");
        assert_eq!(cache_key("a.com", "/x", "p=1"), "a.com/x?p=1");
    }

    #[test]
    fn test_entry_path_is_sharded() {
        let cache = DiskCache::new("/var/cache/mirror");
        let path = cache.entry_path("a.com", "a.com/");
        let hash = path.file_name().unwrap().to_str().unwrap().to_string();
        assert_eq!(hash.len(), 64);
        assert_eq!(
            path,
            PathBuf::from("/var/cache/mirror/a.com").join(&hash[..2]).join(&hash)
        );
    }

    #[test]
    fn test_put_normalizes_headers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());

        let entry = cache
            .put("a.com", "a.com/", 200, &headers(), b"<html></html>", "<div></div>")
            .unwrap();
        assert_eq!(entry.content_type(), "text/html; charset=utf-8");
        assert!(entry.header("content-encoding").is_none());
        assert!(entry.header("Content-Security-Policy").is_none());
        assert_eq!(entry.header("x-origin"), Some("1"));

        let stored = cache.get("a.com", "a.com/", Duration::from_secs(60), false).unwrap();
        assert_eq!(stored, entry);
    }

    #[test]
    fn test_miss_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        assert!(cache.get("a.com", "a.com/", Duration::from_secs(60), true).is_none());
    }

    #[test]
    fn test_ttl_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.put("a.com", "a.com/", 200, &HeaderMap::new(), b"body", "").unwrap();

        let written = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        set_fetched_at(&cache.entry_path("a.com", "a.com/"), written);

        let ttl = Duration::from_secs(100);
        let before = written + Duration::from_secs(99);
        let after = written + Duration::from_secs(101);

        assert!(cache.get_at("a.com", "a.com/", ttl, false, before).is_some());
        assert!(cache.get_at("a.com", "a.com/", ttl, false, after).is_none());
        assert!(cache.get_at("a.com", "a.com/", ttl, true, after).is_some());
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.put("a.com", "a.com/", 200, &HeaderMap::new(), b"body", "").unwrap();

        let written = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        set_fetched_at(&cache.entry_path("a.com", "a.com/"), written);

        let ttl = Duration::from_secs(u64::MAX);
        let later = written + Duration::from_secs(10 * 365 * 24 * 3600);
        assert!(cache.get_at("a.com", "a.com/", ttl, false, later).is_some());
    }

    #[test]
    fn test_corrupt_entry_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        let path = cache.entry_path("a.com", "a.com/");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"\xff\xff\xff\xff\xff\xff\xff\xff\xff").unwrap();

        assert!(cache.get("a.com", "a.com/", Duration::from_secs(60), true).is_none());
    }

    #[test]
    fn test_overwrite_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.put("a.com", "a.com/", 200, &HeaderMap::new(), b"one", "").unwrap();
        cache.put("a.com", "a.com/", 200, &HeaderMap::new(), b"two", "").unwrap();

        let path = cache.entry_path("a.com", "a.com/");
        let files = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(files, 1);

        let entry = cache.get("a.com", "a.com/", Duration::from_secs(60), false).unwrap();
        assert_eq!(entry.body, b"two");
    }

    #[test]
    fn test_purge_domain() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.put("a.com", "a.com/", 200, &HeaderMap::new(), b"a", "").unwrap();
        cache.put("b.com", "b.com/", 200, &HeaderMap::new(), b"b", "").unwrap();

        cache.purge("a.com").unwrap();
        cache.purge("never-cached.com").unwrap();

        let ttl = Duration::from_secs(60);
        assert!(cache.get("a.com", "a.com/", ttl, true).is_none());
        assert!(cache.get("b.com", "b.com/", ttl, true).is_some());
    }
}
