//! Per-request state threaded through the rewrite and template passes

use crate::buffer::PooledBuffer;
use crate::cache::cache_key;
use crate::content::MirrorContent;
use crate::page::is_index_page;
use crate::site::Site;
use parking_lot::Mutex;
use std::sync::Arc;
use url::Url;

pub struct RequestContext {
    pub site: Arc<Site>,
    /// Content snapshot taken when the request arrived
    pub content: Arc<MirrorContent>,
    /// `http` or `https`, as seen by the client
    pub scheme: String,
    /// Request host without port
    pub host: String,
    pub path: String,
    pub query: String,
    /// Origin URL this request is forwarded to
    pub target_url: Url,
    pub is_index: bool,
    /// Requester is an allow-listed search crawler
    pub allowed_crawler: bool,
    pub request_id: String,
    buffer: Mutex<PooledBuffer>,
}

impl RequestContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        site: Arc<Site>,
        content: Arc<MirrorContent>,
        scheme: &str,
        host: &str,
        path: &str,
        query: &str,
        allowed_crawler: bool,
        request_id: String,
        buffer: PooledBuffer,
    ) -> Self {
        let target_url = target_url(&site.origin, path, query);
        Self {
            is_index: is_index_page(path, query),
            scheme: if scheme.eq_ignore_ascii_case("https") {
                "https".to_string()
            } else {
                "http".to_string()
            },
            host: host.to_string(),
            path: path.to_string(),
            query: query.to_string(),
            target_url,
            allowed_crawler,
            request_id,
            site,
            content,
            buffer: Mutex::new(buffer),
        }
    }

    pub fn cache_key(&self) -> String {
        cache_key(&self.site.domain, &self.path, &self.query)
    }

    /// Run `f` with the cleared scratch buffer
    pub fn with_buffer<R>(&self, f: impl FnOnce(&mut String) -> R) -> R {
        let mut buffer = self.buffer.lock();
        buffer.clear();
        f(&mut buffer)
    }
}

/// Join the request path onto the origin URL's path
pub fn target_url(origin: &Url, path: &str, query: &str) -> Url {
    let mut url = origin.clone();
    let base = origin.path().trim_end_matches('/');
    let path = if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    };
    url.set_path(&path);
    url.set_query(if query.is_empty() { None } else { Some(query) });
    url.set_fragment(None);
    url
}
