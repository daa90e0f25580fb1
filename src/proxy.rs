//! Mirror front end
//!
//! Accepts plain HTTP connections, resolves the mirrored site from the Host
//! header and drives each request through auth, crawler gating, cache lookup,
//! origin fetch, rewriting and template substitution.

use crate::auth::Authorizer;
use crate::buffer::BufferPool;
use crate::cache::{CacheEntry, DiskCache};
use crate::config::Config;
use crate::content::{ContentHandle, MirrorContent};
use crate::context::RequestContext;
use crate::crawler::CrawlerClassifier;
use crate::error::{text_error_response, AuthError, MirrorErrorCode};
use crate::page::inject_js_path;
use crate::pool::{OriginPool, OriginRequest, OriginResponse, PoolConfig};
use crate::rewrite::{decode_body, rewrite_asset, rewrite_html, ContentKind};
use crate::site::{ReloadResult, SiteRegistry};
use crate::template::{render_asset, render_page};
use anyhow::anyhow;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST,
    IF_MODIFIED_SINCE, IF_NONE_MATCH, LOCATION, REFERER, USER_AGENT,
};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::RwLock;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use url::{Position, Url};

const X_REQUEST_ID: &str = "x-request-id";

/// Body sent in place of an origin client error
const PAGE_NOT_FOUND_BODY: &str = "page not found";

/// Headers that only apply to a single connection
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Settings swapped as a whole on reload
#[derive(Debug, Clone)]
pub struct MirrorSettings {
    pub crawlers: CrawlerClassifier,
    /// Header carrying the client-facing scheme
    pub scheme_header: String,
    /// Replaces the client User-Agent on origin requests
    pub user_agent: Option<String>,
}

impl MirrorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            crawlers: CrawlerClassifier::new(&config.crawler),
            scheme_header: config.server.scheme_header.to_ascii_lowercase(),
            user_agent: config.origin.user_agent.clone().filter(|ua| !ua.is_empty()),
        }
    }
}

/// State shared by every connection
pub struct Mirror {
    registry: Arc<SiteRegistry>,
    content: ContentHandle,
    cache: Arc<DiskCache>,
    origins: OriginPool,
    authorizer: RwLock<Arc<dyn Authorizer>>,
    settings: RwLock<Arc<MirrorSettings>>,
    buffers: BufferPool,
    /// Addresses presented to the authorizer
    host_addresses: Vec<IpAddr>,
}

impl Mirror {
    pub fn new(
        config: &Config,
        content: MirrorContent,
        pool_config: PoolConfig,
        authorizer: Arc<dyn Authorizer>,
    ) -> anyhow::Result<Self> {
        let registry = Arc::new(SiteRegistry::new());
        let loaded = registry.apply(config, &config.content.global_replace);
        for (domain, reason) in &loaded.rejected {
            warn!(domain = %domain, reason = %reason, "Site rejected");
        }

        let host_addresses = pool_config.egress_addresses.clone();
        let origins = OriginPool::new(pool_config)?;

        Ok(Self {
            registry,
            content: ContentHandle::new(content),
            cache: Arc::new(DiskCache::new(config.cache.root.clone())),
            origins,
            authorizer: RwLock::new(authorizer),
            settings: RwLock::new(Arc::new(MirrorSettings::from_config(config))),
            buffers: BufferPool::new(config.cache.max_pooled_bytes),
            host_addresses,
        })
    }

    /// Build every component from the configuration file contents
    pub fn from_config(config: &Config, authorizer: Arc<dyn Authorizer>) -> anyhow::Result<Self> {
        let content = MirrorContent::load(&config.content)?;
        let pool_config = PoolConfig::from_origin_config(&config.origin);
        Self::new(config, content, pool_config, authorizer)
    }

    pub fn registry(&self) -> &Arc<SiteRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<DiskCache> {
        &self.cache
    }

    pub fn content(&self) -> &ContentHandle {
        &self.content
    }

    pub fn settings(&self) -> Arc<MirrorSettings> {
        Arc::clone(&self.settings.read())
    }

    /// Swap the license check, e.g. after a renewed license file is loaded
    pub fn set_authorizer(&self, authorizer: Arc<dyn Authorizer>) {
        *self.authorizer.write() = authorizer;
    }

    /// Run the license check against this host's addresses
    pub fn authorize(&self) -> Result<(), AuthError> {
        let authorizer = Arc::clone(&self.authorizer.read());
        authorizer.authorize(&self.host_addresses)
    }

    /// Apply a reloaded configuration. Sites are replaced whole, content and
    /// settings are swapped, and cached pages of removed or changed sites
    /// are purged.
    pub fn reload(&self, config: &Config, content: MirrorContent) -> ReloadResult {
        let result = self.registry.apply(config, &config.content.global_replace);
        self.content.replace(content);
        *self.settings.write() = Arc::new(MirrorSettings::from_config(config));

        for domain in result.removed.iter().chain(result.updated.iter()) {
            match self.cache.purge(domain) {
                Ok(()) => debug!(domain = %domain, "Cache purged"),
                Err(e) => warn!(domain = %domain, error = %e, "Cache purge failed"),
            }
        }
        for (domain, reason) in &result.rejected {
            warn!(domain = %domain, reason = %reason, "Site rejected, keeping previous version");
        }
        result
    }
}

/// The mirror server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    mirror: Arc<Mirror>,
    connection_limit: Arc<Semaphore>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        mirror: Arc<Mirror>,
        max_connections: usize,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            mirror,
            connection_limit: Arc::new(Semaphore::new(max_connections.max(1))),
            shutdown_rx,
        }
    }

    /// Run until the shutdown channel flips
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(mut self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Mirror listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let permit = match Arc::clone(&self.connection_limit).try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    warn!(client = %addr, "Connection limit reached, dropping connection");
                                    continue;
                                }
                            };
                            let mirror = Arc::clone(&self.mirror);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, mirror).await {
                                    debug!(error = %e, client = %addr, "Connection error");
                                }
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Mirror shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, mirror: Arc<Mirror>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req| {
        let mirror = Arc::clone(&mirror);
        async move { handle_request(req, addr, mirror).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow!("Connection error: {}", e))
}

async fn handle_request(
    req: Request<Incoming>,
    client_addr: SocketAddr,
    mirror: Arc<Mirror>,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    if let Err(e) = mirror.authorize() {
        warn!(error = %e, request_id = %request_id, "Request refused by license check");
        return Ok(with_request_id(
            text_error_response(MirrorErrorCode::Unauthorized, e.to_string()),
            &request_id,
        ));
    }

    let hostname = match extract_hostname(&req) {
        Some(h) => h,
        None => {
            return Ok(with_request_id(
                text_error_response(MirrorErrorCode::MissingHostHeader, "Missing Host header"),
                &request_id,
            ));
        }
    };

    debug!(
        hostname = %hostname,
        method = %req.method(),
        uri = %req.uri(),
        client = %client_addr,
        request_id = %request_id,
        "Incoming request"
    );

    let content = mirror.content.current();
    if req.uri().path() == inject_js_path(&hostname) {
        return Ok(inject_js_response(&content, &request_id));
    }

    let site = match mirror.registry.resolve(&hostname) {
        Some(site) => site,
        None => {
            debug!(hostname = %hostname, request_id = %request_id, "No site configured");
            return Ok(with_request_id(
                text_error_response(MirrorErrorCode::UnknownSite, "site not configured"),
                &request_id,
            ));
        }
    };

    let settings = mirror.settings();
    let user_agent = req
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let verdict = settings.crawlers.classify(user_agent);
    if verdict.is_blocked() {
        debug!(hostname = %hostname, user_agent, request_id = %request_id, "Crawler blocked");
        return Ok(with_request_id(
            text_error_response(MirrorErrorCode::CrawlerBlocked, PAGE_NOT_FOUND_BODY),
            &request_id,
        ));
    }

    let scheme = req
        .headers()
        .get(settings.scheme_header.as_str())
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http")
        .to_string();

    let ctx = RequestContext::new(
        site,
        content,
        &scheme,
        &hostname,
        req.uri().path(),
        req.uri().query().unwrap_or(""),
        verdict.is_allowed,
        request_id,
        mirror.buffers.acquire(),
    );

    let cacheable = req.method() == hyper::Method::GET;
    if cacheable && ctx.site.cache_enable {
        if let Some(entry) = cache_lookup(&mirror, &ctx, false).await {
            debug!(key = %ctx.cache_key(), request_id = %ctx.request_id, "Cache hit");
            return Ok(render_entry(&ctx, &entry));
        }
    }

    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    let request = OriginRequest {
        method: parts.method,
        url: ctx.target_url.clone(),
        headers: origin_headers(&parts.headers, &ctx, &settings),
        body,
    };

    match mirror.origins.send(request).await {
        Ok(response) if response.status.is_server_error() => {
            warn!(
                status = response.status.as_u16(),
                url = %ctx.target_url,
                request_id = %ctx.request_id,
                "Origin server error"
            );
            Ok(fallback(&mirror, &ctx).await)
        }
        Ok(response) => Ok(handle_origin_response(&mirror, &ctx, response, cacheable).await),
        Err(e) => {
            error!(error = %e, url = %ctx.target_url, request_id = %ctx.request_id, "Origin unreachable");
            Ok(fallback(&mirror, &ctx).await)
        }
    }
}

async fn handle_origin_response(
    mirror: &Mirror,
    ctx: &RequestContext,
    response: OriginResponse,
    cacheable: bool,
) -> Response<ProxyBody> {
    let status = response.status;

    if status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND {
        let mut headers = response.headers;
        let location = headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(location) = location {
            if let Some(rewritten) = rewrite_location(ctx, &location) {
                debug!(from = %location, to = %rewritten, request_id = %ctx.request_id, "Redirect rewritten");
                if let Ok(value) = HeaderValue::from_str(&rewritten) {
                    headers.insert(LOCATION, value);
                }
            }
        }
        return passthrough(status, &headers, response.body, &ctx.request_id);
    }

    let entry = if status == StatusCode::OK {
        let content_type = response
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let kind = ContentKind::from_content_type(content_type);
        let body = match kind {
            ContentKind::Html | ContentKind::Asset => {
                decode_body(&response.body, content_type).into_owned().into_bytes()
            }
            ContentKind::Other => response.body.to_vec(),
        };
        let filler = if kind == ContentKind::Html {
            ctx.content.filler_html(&ctx.site.domain)
        } else {
            String::new()
        };
        CacheEntry::new(status.as_u16(), &response.headers, body, filler)
    } else if status.as_u16() > 400 && status.is_client_error() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        CacheEntry::new(
            status.as_u16(),
            &headers,
            PAGE_NOT_FOUND_BODY.as_bytes().to_vec(),
            String::new(),
        )
    } else {
        return passthrough(status, &response.headers, response.body, &ctx.request_id);
    };

    let entry = Arc::new(entry);
    if cacheable {
        cache_store(mirror, ctx, Arc::clone(&entry)).await;
    }
    render_entry(ctx, &entry)
}

/// Serve a stale entry when the origin failed, else a plain 404
async fn fallback(mirror: &Mirror, ctx: &RequestContext) -> Response<ProxyBody> {
    match cache_lookup(mirror, ctx, true).await {
        Some(entry) => {
            warn!(key = %ctx.cache_key(), request_id = %ctx.request_id, "Serving stale cache entry");
            render_entry(ctx, &entry)
        }
        None => with_request_id(
            text_error_response(MirrorErrorCode::OriginUnavailable, "origin error"),
            &ctx.request_id,
        ),
    }
}

async fn cache_lookup(mirror: &Mirror, ctx: &RequestContext, force: bool) -> Option<CacheEntry> {
    let cache = Arc::clone(&mirror.cache);
    let domain = ctx.site.domain.clone();
    let key = ctx.cache_key();
    let ttl = ctx.site.cache_ttl;

    match tokio::task::spawn_blocking(move || cache.get(&domain, &key, ttl, force)).await {
        Ok(entry) => entry,
        Err(e) => {
            warn!(error = %e, request_id = %ctx.request_id, "Cache lookup task failed");
            None
        }
    }
}

async fn cache_store(mirror: &Mirror, ctx: &RequestContext, entry: Arc<CacheEntry>) {
    let cache = Arc::clone(&mirror.cache);
    let domain = ctx.site.domain.clone();
    let key = ctx.cache_key();

    match tokio::task::spawn_blocking(move || cache.store(&domain, &key, &entry)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, request_id = %ctx.request_id, "Cache write failed"),
        Err(e) => warn!(error = %e, request_id = %ctx.request_id, "Cache write task failed"),
    }
}

/// Rewrite and substitute a stored entry into the client response
fn render_entry(ctx: &RequestContext, entry: &CacheEntry) -> Response<ProxyBody> {
    let body = match ContentKind::from_content_type(entry.content_type()) {
        ContentKind::Html => {
            let text = String::from_utf8_lossy(&entry.body);
            let rewritten = rewrite_html(ctx, &text);
            ctx.with_buffer(|buf| {
                render_page(ctx, &rewritten, &entry.filler_html, buf);
                Bytes::copy_from_slice(buf.as_bytes())
            })
        }
        ContentKind::Asset => {
            let text = String::from_utf8_lossy(&entry.body);
            let rewritten = rewrite_asset(ctx, &text);
            ctx.with_buffer(|buf| {
                render_asset(ctx, &rewritten, buf);
                Bytes::copy_from_slice(buf.as_bytes())
            })
        }
        ContentKind::Other => Bytes::from(entry.body.clone()),
    };

    let status = StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK);
    let length = body.len();
    let mut response = Response::new(full_body(body));
    *response.status_mut() = if entry.status == 0 { StatusCode::OK } else { status };

    let headers = response.headers_mut();
    for (name, value) in &entry.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            if name != CONTENT_LENGTH {
                headers.append(name, value);
            }
        }
    }
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    with_request_id(response, &ctx.request_id)
}

/// Forward an origin response without touching the body
fn passthrough(
    status: StatusCode,
    origin_headers: &HeaderMap,
    body: Bytes,
    request_id: &str,
) -> Response<ProxyBody> {
    let length = body.len();
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in origin_headers {
        if is_hop_by_hop(name) || *name == CONTENT_LENGTH || name.as_str() == "content-encoding" {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    with_request_id(response, request_id)
}

fn inject_js_response(content: &MirrorContent, request_id: &str) -> Response<ProxyBody> {
    let body = Bytes::from(content.inject_js.clone());
    let length = body.len();
    let mut response = Response::new(full_body(body));
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/javascript; charset=utf-8"),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    with_request_id(response, request_id)
}

fn full_body(body: Bytes) -> ProxyBody {
    Full::new(body).map_err(|never| match never {}).boxed()
}

fn with_request_id(mut response: Response<ProxyBody>, request_id: &str) -> Response<ProxyBody> {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Shape client headers for the origin request
fn origin_headers(incoming: &HeaderMap, ctx: &RequestContext, settings: &MirrorSettings) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(incoming.len() + 2);
    for (name, value) in incoming {
        if is_hop_by_hop(name)
            || *name == HOST
            || *name == CONTENT_LENGTH
            || *name == IF_MODIFIED_SINCE
            || *name == IF_NONE_MATCH
            || *name == ACCEPT_ENCODING
            || name.as_str() == settings.scheme_header
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let referer = format!("{}://{}", ctx.site.origin.scheme(), ctx.site.origin_host());
    if let Ok(value) = HeaderValue::from_str(&referer) {
        headers.insert(REFERER, value);
    }
    if let Some(ua) = &settings.user_agent {
        if let Ok(value) = HeaderValue::from_str(ua) {
            headers.insert(USER_AGENT, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    headers
}

/// Point a redirect at the mirror when it targets the origin host
fn rewrite_location(ctx: &RequestContext, location: &str) -> Option<String> {
    let resolved: Url = ctx.target_url.join(location).ok()?;
    let host = resolved.host_str()?;
    let authority = match resolved.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    if !authority.eq_ignore_ascii_case(ctx.site.origin_host()) {
        return None;
    }
    Some(format!(
        "{}://{}{}",
        ctx.scheme,
        ctx.host,
        &resolved[Position::BeforePath..]
    ))
}

/// Extract and validate the hostname from the Host header or URI authority
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;

    let hostname = if host.starts_with('[') {
        host.split(']').next().map(|h| h.trim_start_matches('['))?
    } else {
        host.split(':').next()?
    };

    if hostname.is_empty() || hostname.len() > 253 {
        return None;
    }

    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_lowercase())
}
