//! Integration tests for Mirrorgate

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use mirrorgate::auth::{AllowAll, Authorizer, License, LicenseAuthorizer};
use mirrorgate::config::{Config, SiteConfig};
use mirrorgate::content::MirrorContent;
use mirrorgate::page::inject_js_path;
use mirrorgate::pool::PoolConfig;
use mirrorgate::proxy::{Mirror, ProxyServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const INDEX_HTML: &str = r#"<html><head><title>Origin Home</title></head>
<body><h1>Welcome</h1>
<a href="/news/1.html">News</a>
<a href="http://other.com/x">text</a>
<img src="http://ORIGIN/logo.png" alt="logo">
</body></html>"#;

/// Behaviour switches of the mock origin
#[derive(Default)]
struct OriginState {
    failing: AtomicBool,
    hits: AtomicUsize,
}

/// Start an in-process origin on an ephemeral port
async fn start_origin(state: Arc<OriginState>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { Ok::<_, Infallible>(origin_response(req, port, &state)) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    port
}

fn origin_response(req: Request<Incoming>, port: u16, state: &OriginState) -> Response<Full<Bytes>> {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let origin = format!("localhost:{}", port);

    if state.failing.load(Ordering::SeqCst) {
        return Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(Full::new(Bytes::from("down")))
            .unwrap();
    }

    match req.uri().path() {
        "/" => Response::builder()
            .header("Content-Type", "text/html; charset=utf-8")
            .body(Full::new(Bytes::from(INDEX_HTML.replace("ORIGIN", &origin))))
            .unwrap(),
        "/page.html" => Response::builder()
            .header("Content-Type", "text/html")
            .body(Full::new(Bytes::from(format!(
                "<html><head><title>Page</title></head><body><p>stable body</p>\
                 <a href=\"http://{}/next.html\">next</a></body></html>",
                origin
            ))))
            .unwrap(),
        "/style.css" => Response::builder()
            .header("Content-Type", "text/css")
            .body(Full::new(Bytes::from(format!(
                "body {{ background: url(http://{}/bg.png); }}",
                origin
            ))))
            .unwrap(),
        "/moved" => Response::builder()
            .status(StatusCode::FOUND)
            .header("Location", format!("http://{}/target", origin))
            .body(Full::new(Bytes::new()))
            .unwrap(),
        "/elsewhere" => Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header("Location", "http://other.com/target")
            .body(Full::new(Bytes::new()))
            .unwrap(),
        "/echo-headers" => {
            let referer = req
                .headers()
                .get("referer")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("none")
                .to_string();
            let inm = req.headers().contains_key("if-none-match");
            Response::builder()
                .header("Content-Type", "application/octet-stream")
                .body(Full::new(Bytes::from(format!("referer={} inm={}", referer, inm))))
                .unwrap()
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header("Content-Type", "text/html")
            .body(Full::new(Bytes::from("<h1>origin 404</h1>")))
            .unwrap(),
    }
}

/// Mirror test harness: a running proxy in front of the mock origin
struct Harness {
    proxy_port: u16,
    origin: Arc<OriginState>,
    mirror: Arc<Mirror>,
    shutdown_tx: watch::Sender<bool>,
    _cache_dir: tempfile::TempDir,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(Arc::new(AllowAll), |_| {}).await
    }

    async fn start_with(authorizer: Arc<dyn Authorizer>, customize: impl FnOnce(&mut Config)) -> Self {
        let origin = Arc::new(OriginState::default());
        let origin_port = start_origin(Arc::clone(&origin)).await;

        let cache_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cache.root = cache_dir.path().to_path_buf();
        config.crawler.spiders = vec!["spider".to_string(), "bot".to_string()];
        config.crawler.good_spiders = vec!["Baiduspider".to_string()];

        let mut site = SiteConfig::new(&format!("http://localhost:{}", origin_port))
            .with_index_meta("Mirror Title", "mirror,keywords", "Mirror description");
        site.cache_time_secs = 1;
        config.sites.insert("a.com".to_string(), site);
        customize(&mut config);

        let mut content = MirrorContent::default();
        content.keywords = vec!["alpha".to_string(), "beta".to_string()];
        content.inject_js = "console.log('mirror');".to_string();

        let mirror = Arc::new(
            Mirror::new(&config, content, PoolConfig::default(), authorizer).unwrap(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_port = listener.local_addr().unwrap().port();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let bind: SocketAddr = format!("127.0.0.1:{}", proxy_port).parse().unwrap();
        let server = ProxyServer::new(bind, Arc::clone(&mirror), 64, shutdown_rx);
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        assert!(wait_for_port(proxy_port, Duration::from_secs(5)).await);

        Self {
            proxy_port,
            origin,
            mirror,
            shutdown_tx,
            _cache_dir: cache_dir,
        }
    }

    async fn get(&self, path: &str, host: &str) -> String {
        http_get_with_host(self.proxy_port, path, host, &[]).await.unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send HTTP request with custom Host header and extra headers
async fn http_get_with_host(
    port: u16,
    path: &str,
    host: &str,
    headers: &[(&str, &str)],
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let extra: String = headers
        .iter()
        .map(|(name, value)| format!("{}: {}\r\n", name, value))
        .collect();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\n{}Connection: close\r\n\r\n",
        path, host, extra
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

fn status_line(response: &str) -> &str {
    response.lines().next().unwrap_or("")
}

fn body(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
}

fn header<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    let head = response.split("\r\n\r\n").next()?;
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

// ============================================================================
// Page rewriting
// ============================================================================

#[tokio::test]
async fn test_index_page_rewritten() {
    let harness = Harness::start().await;
    let response = http_get_with_host(
        harness.proxy_port,
        "/",
        "a.com",
        &[("X-Forwarded-Proto", "https")],
    )
    .await
    .unwrap();

    assert!(status_line(&response).contains("200"), "{}", response);
    let page = body(&response);
    assert!(page.contains("<title>Mirror Title</title>"), "{}", page);
    assert!(!page.contains("Origin Home"));
    assert!(!page.contains("localhost"));
    assert!(page.contains(r#"<div style="display:none">"#));
    assert!(page.contains("https://a.com/logo.png"));
    assert!(page.contains("upgrade-insecure-requests"));
    assert!(!page.contains("{{"), "placeholder leaked: {}", page);
    assert_eq!(header(&response, "content-length"), Some(page.len().to_string().as_str()));
}

#[tokio::test]
async fn test_subdomain_resolves_site() {
    let harness = Harness::start().await;
    let response = harness.get("/page.html", "www.a.com").await;

    assert!(status_line(&response).contains("200"));
    let page = body(&response);
    assert!(page.contains("stable body"));
    assert!(page.contains("http://www.a.com/next.html"), "{}", page);
}

#[tokio::test]
async fn test_foreign_anchor_neutralized() {
    let harness = Harness::start().await;
    let response = harness.get("/", "a.com").await;

    let page = body(&response);
    assert!(page.contains(r##"<a href="#">text</a>"##), "{}", page);
    assert!(page.contains(r#"<a href="http://a.com/news/1.html">News</a>"#));
    assert!(!page.contains("other.com"));
}

#[tokio::test]
async fn test_stylesheet_hosts_rewritten() {
    let harness = Harness::start().await;
    let response = harness.get("/style.css", "a.com").await;

    assert!(status_line(&response).contains("200"));
    assert_eq!(body(&response), "body { background: url(http://a.com/bg.png); }");
}

// ============================================================================
// Special paths and gating
// ============================================================================

#[tokio::test]
async fn test_inject_js_path_served_for_any_host() {
    let harness = Harness::start().await;
    let path = inject_js_path("unregistered.org");
    let response = harness.get(&path, "unregistered.org").await;

    assert!(status_line(&response).contains("200"), "{}", response);
    assert_eq!(
        header(&response, "content-type"),
        Some("text/javascript; charset=utf-8")
    );
    assert_eq!(body(&response), "console.log('mirror');");
    assert_eq!(harness.origin.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_site() {
    let harness = Harness::start().await;
    let response = harness.get("/", "b.org").await;

    assert!(status_line(&response).contains("404"));
    assert_eq!(header(&response, "x-mirror-error"), Some("UNKNOWN_SITE"));
}

#[tokio::test]
async fn test_crawler_gate() {
    let harness = Harness::start().await;

    let blocked = http_get_with_host(
        harness.proxy_port,
        "/",
        "a.com",
        &[("User-Agent", "EvilSpider/2.0")],
    )
    .await
    .unwrap();
    assert!(status_line(&blocked).contains("404"));
    assert_eq!(header(&blocked, "x-mirror-error"), Some("CRAWLER_BLOCKED"));
    assert_eq!(harness.origin.hits.load(Ordering::SeqCst), 0);

    let allowed = http_get_with_host(
        harness.proxy_port,
        "/",
        "a.com",
        &[("User-Agent", "Mozilla/5.0 (compatible; Baiduspider/2.0)")],
    )
    .await
    .unwrap();
    assert!(status_line(&allowed).contains("200"));
}

#[tokio::test]
async fn test_unlicensed_host_refused() {
    let authorizer = LicenseAuthorizer::new(License {
        ip_list: vec!["203.0.113.7".to_string()],
        date: "2099-12-31".to_string(),
    });
    let harness = Harness::start_with(Arc::new(authorizer), |_| {}).await;
    let response = harness.get("/", "a.com").await;

    assert!(status_line(&response).contains("403"));
    assert_eq!(header(&response, "x-mirror-error"), Some("UNAUTHORIZED"));
    assert_eq!(harness.origin.hits.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Origin responses
// ============================================================================

#[tokio::test]
async fn test_redirect_to_origin_rewritten() {
    let harness = Harness::start().await;

    let response = harness.get("/moved", "www.a.com").await;
    assert!(status_line(&response).contains("302"));
    assert_eq!(header(&response, "location"), Some("http://www.a.com/target"));

    let response = harness.get("/elsewhere", "www.a.com").await;
    assert!(status_line(&response).contains("301"));
    assert_eq!(header(&response, "location"), Some("http://other.com/target"));
}

#[tokio::test]
async fn test_client_error_gets_synthetic_body() {
    let harness = Harness::start().await;
    let response = harness.get("/missing", "a.com").await;

    assert!(status_line(&response).contains("404"));
    assert_eq!(header(&response, "content-type"), Some("text/plain"));
    assert_eq!(body(&response), "page not found");
}

#[tokio::test]
async fn test_origin_request_shaping() {
    let harness = Harness::start().await;
    let response = http_get_with_host(
        harness.proxy_port,
        "/echo-headers",
        "a.com",
        &[("If-None-Match", "\"v1\"")],
    )
    .await
    .unwrap();

    let body = body(&response);
    assert!(body.starts_with("referer=http://localhost:"), "{}", body);
    assert!(body.ends_with("inm=false"));
}

// ============================================================================
// Cache
// ============================================================================

#[tokio::test]
async fn test_cache_hit_skips_origin() {
    let harness = Harness::start_with(Arc::new(AllowAll), |config| {
        if let Some(site) = config.sites.get_mut("a.com") {
            site.cache_time_secs = 3600;
        }
    })
    .await;

    let first = harness.get("/page.html", "a.com").await;
    assert!(status_line(&first).contains("200"));
    assert_eq!(harness.origin.hits.load(Ordering::SeqCst), 1);

    let second = harness.get("/page.html", "a.com").await;
    assert_eq!(body(&first), body(&second));
    assert_eq!(harness.origin.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stale_entry_served_when_origin_down() {
    let harness = Harness::start().await;

    let fresh = harness.get("/page.html", "a.com").await;
    assert!(status_line(&fresh).contains("200"));

    tokio::time::sleep(Duration::from_millis(2100)).await;
    harness.origin.failing.store(true, Ordering::SeqCst);

    let stale = harness.get("/page.html", "a.com").await;
    assert!(status_line(&stale).contains("200"), "{}", stale);
    assert_eq!(body(&stale), body(&fresh));
    assert_eq!(harness.origin.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_origin_down_without_cache() {
    let harness = Harness::start().await;
    harness.origin.failing.store(true, Ordering::SeqCst);

    let response = harness.get("/page.html", "a.com").await;
    assert!(status_line(&response).contains("404"));
    assert_eq!(header(&response, "x-mirror-error"), Some("ORIGIN_UNAVAILABLE"));
}

#[tokio::test]
async fn test_reload_removes_site() {
    let harness = Harness::start().await;
    assert!(status_line(&harness.get("/page.html", "a.com").await).contains("200"));

    let config = Config::default();
    let result = harness.mirror.reload(&config, MirrorContent::default());
    assert_eq!(result.removed, vec!["a.com".to_string()]);

    let response = harness.get("/page.html", "a.com").await;
    assert!(status_line(&response).contains("404"));
    assert_eq!(header(&response, "x-mirror-error"), Some("UNKNOWN_SITE"));
}
