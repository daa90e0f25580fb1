//! Small page-level helpers shared by the rewrite and proxy layers

use rand::Rng;
use std::fmt::Write;

const RAND_STR_CHARS: &[u8] = b"ABCDEFGHIJKLNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Whether a request path addresses the site's home page.
///
/// Script-style index pages only count when there is no query string,
/// since `index.php?id=3` is usually an article.
pub fn is_index_page(path: &str, query: &str) -> bool {
    let path = path.to_ascii_lowercase();
    match path.as_str() {
        "" | "/" | "/index.htm" | "/index.html" | "/index.shtml" => true,
        "/index.php" | "/index.asp" | "/index.jsp" => query.is_empty(),
        _ => false,
    }
}

/// Per-host path of the injected ad script.
pub fn inject_js_path(host: &str) -> String {
    let name = format!("{:x}", md5::compute(host.as_bytes()));
    if host.len() >= 6 {
        if let Some(last_dot) = host.rfind('.') {
            let dir = format!("{:x}", md5::compute(host[..last_dot].as_bytes()));
            return format!("/{}/{}.js", dir, name);
        }
    }
    format!("/{}.js", name)
}

/// Encode every non-ASCII character as a decimal HTML entity.
pub fn html_entities(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let _ = write!(out, "&#{};", c as u32);
        }
    }
    out
}

/// Random ASCII letters, length in `min..max`.
pub fn rand_str(min: usize, max: usize) -> String {
    let mut rng = rand::thread_rng();
    let len = if max > min { rng.gen_range(min..max) } else { min };
    (0..len)
        .map(|_| RAND_STR_CHARS[rng.gen_range(0..RAND_STR_CHARS.len())] as char)
        .collect()
}
