//! Content rewriting: DOM transformation of HTML pages, find tagging of
//! CSS/JS assets, host rewriting and charset normalisation.
//!
//! Output still carries placeholder tags; [`crate::template`] resolves them.

use crate::context::RequestContext;
use crate::convert::convert_han_runs;
use crate::site::Site;
use ego_tree::NodeId;
use encoding_rs::{Encoding, GBK};
use rand::Rng;
use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use scraper::node::{Element, Text};
use scraper::{Html, Node};
use std::borrow::Cow;
use std::sync::LazyLock;
use url::{Position, Url};

pub const INJECT_JS_TAG: &str = "{{inject_js}}";
pub const RANDOM_HTML_TAG: &str = "{{random_html}}";
pub const H1_TAG: &str = "{{h1_tag}}";
pub const FRIEND_LINKS_TAG: &str = "{{friend_links}}";
pub const INDEX_TITLE_TAG: &str = "{{index_title}}";
pub const INDEX_KEYWORDS_TAG: &str = "{{index_keywords}}";
pub const INDEX_DESCRIPTION_TAG: &str = "{{index_description}}";

/// Elements that get a synthetic `id` when they have none
const NEED_ID_TAGS: &[&str] = &[
    "address", "th", "tfoot", "tbody", "pre", "legend", "form", "h5", "h6", "h4", "h3", "h2", "h1",
    "dd", "dl", "dt", "fieldset", "caption", "div", "ol", "ul", "li", "p", "table", "tr", "td",
    "article", "aside", "nav", "header", "main", "section", "footer", "hgroup",
];

/// Attributes whose values are visible text
const TEXT_ATTRS: &[&str] = &["title", "alt", "value", "placeholder", "content"];

/// Only the head of a document is sniffed for a `<meta>` charset
const CHARSET_SNIFF_BYTES: usize = 1024;

static CONTENT_TYPE_CHARSET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)charset\s*=\s*"?([a-z0-9_\-:.]+)"#)
        .expect("CONTENT_TYPE_CHARSET: hardcoded regex is valid")
});

static META_CHARSET: LazyLock<BytesRegex> = LazyLock::new(|| {
    BytesRegex::new(r#"(?i)<meta[^>]+charset\s*=\s*["']?([a-z0-9_\-:.]+)"#)
        .expect("META_CHARSET: hardcoded regex is valid")
});

/// Response content classes the mirror treats differently
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    /// CSS or JavaScript
    Asset,
    Other,
}

impl ContentKind {
    pub fn from_content_type(content_type: &str) -> Self {
        let content_type = content_type.to_ascii_lowercase();
        if content_type.contains("text/html") {
            ContentKind::Html
        } else if content_type.contains("css") || content_type.contains("javascript") {
            ContentKind::Asset
        } else {
            ContentKind::Other
        }
    }
}

/// Decode a body to UTF-8. Uses the `Content-Type` charset, then a
/// `<meta>` charset near the top of the document, then GBK.
pub fn decode_body<'a>(body: &'a [u8], content_type: &str) -> Cow<'a, str> {
    if let Ok(text) = std::str::from_utf8(body) {
        return Cow::Borrowed(text);
    }

    let label = CONTENT_TYPE_CHARSET
        .captures(content_type)
        .map(|caps| caps[1].as_bytes().to_vec())
        .or_else(|| {
            let head = &body[..body.len().min(CHARSET_SNIFF_BYTES)];
            META_CHARSET.captures(head).map(|caps| caps[1].to_vec())
        });

    let encoding = label
        .and_then(|label| Encoding::for_label(&label))
        .unwrap_or(GBK);
    let (text, _, _) = encoding.decode(body);
    text
}

/// Replace the origin host with the request host and collapse references to
/// the origin's parent domain.
pub fn replace_host(site: &Site, content: &str, scheme: &str, host: &str) -> String {
    let origin_host = site.origin_host();
    let mut out = content.replace(origin_host, host);

    let (from, to) = if scheme == "https" {
        ("http://", "https://")
    } else {
        ("https://", "http://")
    };
    out = out.replace(&format!("{}{}", from, host), &format!("{}{}", to, host));

    let labels: Vec<&str> = origin_host.split('.').collect();
    let parent = if labels.len() >= 3 {
        labels[1..].join(".")
    } else {
        origin_host.to_string()
    };
    let dotted = format!(".{}", parent);
    if out.contains(&dotted) {
        out = out.replace(&dotted, "");
    }
    out.replace(&parent, &site.domain)
}

/// Tag find strings in a CSS/JS body and rewrite hosts
pub fn rewrite_asset(ctx: &RequestContext, body: &str) -> String {
    let tagged = ctx.site.defer_replacements(body);
    replace_host(&ctx.site, &tagged, &ctx.scheme, &ctx.host)
}

/// Transform an HTML document and serialize it with hosts rewritten.
pub fn rewrite_html(ctx: &RequestContext, html: &str) -> String {
    let mut doc = Html::parse_document(html);
    let ids: Vec<NodeId> = doc.tree.root().descendants().map(|node| node.id()).collect();

    // Text tagging runs before any placeholder is inserted so inserted tags
    // are never matched by a find string.
    for id in &ids {
        scrub_node(ctx, &mut doc, *id);
    }
    for id in &ids {
        transform_element(ctx, &mut doc, *id);
    }

    replace_host(&ctx.site, &doc.html(), &ctx.scheme, &ctx.host)
}

fn text_node(text: &str) -> Node {
    Node::Text(Text { text: text.into() })
}

/// Find tagging and script conversion for visible text
fn scrub_text<'a>(ctx: &RequestContext, text: &'a str) -> Cow<'a, str> {
    let tagged = ctx.site.defer_replacements(text);
    let converter = match ctx.content.converter() {
        Some(converter) if ctx.site.s2t => converter,
        _ => return tagged,
    };
    let converted = match convert_han_runs(converter, &tagged) {
        Cow::Owned(converted) => Some(converted),
        Cow::Borrowed(_) => None,
    };
    match converted {
        Some(converted) => Cow::Owned(converted),
        None => tagged,
    }
}

/// Splice a keyword tag into a title at a random character offset.
///
/// The title is scrubbed whole first so finds are tagged wherever the
/// keyword lands, and the keyword never lands inside an existing tag.
fn splice_title_keyword(ctx: &RequestContext, title: &str, keyword: usize) -> String {
    let scrubbed = scrub_text(ctx, title);
    let offsets = splice_offsets(&scrubbed);
    let split = offsets[rand::thread_rng().gen_range(0..offsets.len())];
    let (left, right) = scrubbed.split_at(split);
    format!("{}{{{{keyword:{}}}}}{}", left, keyword, right)
}

/// Char boundaries of `text` that fall outside any `{{...}}` tag.
/// Always contains 0.
fn splice_offsets(text: &str) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut in_tag = false;
    let boundaries = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()));
    for i in boundaries {
        if in_tag && text[..i].ends_with("}}") {
            in_tag = false;
        }
        if !in_tag {
            offsets.push(i);
            in_tag = text[i..].starts_with("{{");
        }
    }
    offsets
}

fn is_first_title_text(doc: &Html, id: NodeId) -> bool {
    let Some(node) = doc.tree.get(id) else {
        return false;
    };
    let Some(parent) = node.parent() else {
        return false;
    };
    let is_title = parent
        .value()
        .as_element()
        .map(|el| el.name() == "title")
        .unwrap_or(false);
    is_title && parent.first_child().map(|c| c.id()) == Some(id)
}

fn scrub_node(ctx: &RequestContext, doc: &mut Html, id: NodeId) {
    let title_keyword = if !ctx.is_index && ctx.site.title_replace && is_first_title_text(doc, id) {
        ctx.content.random_keyword_index()
    } else {
        None
    };

    let Some(mut node) = doc.tree.get_mut(id) else {
        return;
    };
    match node.value() {
        Node::Text(text) => {
            let rewritten = match title_keyword {
                Some(keyword) => Cow::Owned(splice_title_keyword(ctx, &text.text, keyword)),
                None => scrub_text(ctx, &text.text),
            };
            if let Cow::Owned(rewritten) = rewritten {
                text.text = rewritten.into();
            }
        }
        Node::Comment(comment) => {
            if let Cow::Owned(rewritten) = scrub_text(ctx, &comment.comment) {
                comment.comment = rewritten.into();
            }
        }
        Node::Element(el) => scrub_element(ctx, el),
        _ => {}
    }
}

/// Tag text-bearing attributes and add a synthetic id where needed
fn scrub_element(ctx: &RequestContext, el: &mut Element) {
    let needs_id = NEED_ID_TAGS.contains(&el.name());
    let mut fingerprint = String::from(el.name());
    let mut has_id = false;

    for (name, value) in el.attrs.iter_mut() {
        let key: &str = &name.local;
        fingerprint.push_str(key);
        fingerprint.push_str(value);
        if key.eq_ignore_ascii_case("id") {
            has_id = true;
        }
        if TEXT_ATTRS.iter().any(|attr| key.eq_ignore_ascii_case(attr)) {
            if let Cow::Owned(rewritten) = scrub_text(ctx, value) {
                *value = rewritten.into();
            }
        }
    }

    if needs_id && !has_id {
        let hash = format!("{:x}", md5::compute(fingerprint.as_bytes()));
        let len = if ctx.site.domain.len() > 16 { 8 } else { 6 };
        let mut attr_name = el.name.clone();
        attr_name.prefix = None;
        attr_name.ns = "".into();
        attr_name.local = "id".into();
        el.attrs.push((attr_name, hash[..len].into()));
    }
}

fn with_element(doc: &mut Html, id: NodeId, f: impl FnOnce(&mut Element)) {
    if let Some(mut node) = doc.tree.get_mut(id) {
        if let Node::Element(el) = node.value() {
            f(el);
        }
    }
}

fn child_ids(doc: &Html, id: NodeId) -> Vec<NodeId> {
    doc.tree
        .get(id)
        .map(|node| node.children().map(|c| c.id()).collect())
        .unwrap_or_default()
}

fn set_text(doc: &mut Html, id: NodeId, value: &str) {
    if let Some(mut node) = doc.tree.get_mut(id) {
        if let Node::Text(text) = node.value() {
            text.text = value.into();
        }
    }
}

fn transform_element(ctx: &RequestContext, doc: &mut Html, id: NodeId) {
    let Some(name) = doc
        .tree
        .get(id)
        .and_then(|node| node.value().as_element().map(|el| el.name().to_string()))
    else {
        return;
    };

    match name.as_str() {
        "a" => with_element(doc, id, |el| rewrite_anchor(ctx, el)),
        "link" => with_element(doc, id, |el| rewrite_alternate(ctx, el)),
        "title" if ctx.is_index => {
            for child in child_ids(doc, id) {
                if let Some(mut node) = doc.tree.get_mut(child) {
                    node.detach();
                }
            }
            if let Some(mut node) = doc.tree.get_mut(id) {
                node.append(text_node(INDEX_TITLE_TAG));
            }
        }
        "script" if !ctx.site.need_js => {
            for child in child_ids(doc, id) {
                set_text(doc, child, "");
            }
            with_element(doc, id, |el| {
                if let Some((_, value)) = el.attrs.iter_mut().find(|(n, _)| &*n.local == "src") {
                    *value = "".into();
                }
            });
        }
        "meta" => with_element(doc, id, |el| rewrite_meta(ctx, el)),
        "body" => {
            let leading = if ctx.site.h1_replace.is_empty() {
                RANDOM_HTML_TAG.to_string()
            } else {
                format!("{}{}", H1_TAG, RANDOM_HTML_TAG)
            };
            if let Some(mut node) = doc.tree.get_mut(id) {
                node.prepend(text_node(&leading));
                if ctx.is_index {
                    node.append(text_node(FRIEND_LINKS_TAG));
                }
            }
        }
        "head" => {
            if let Some(mut node) = doc.tree.get_mut(id) {
                node.append(text_node(INJECT_JS_TAG));
            }
        }
        "h1" if !ctx.site.h1_replace.is_empty() => {
            if let Some(first) = child_ids(doc, id).first() {
                set_text(doc, *first, &ctx.site.h1_replace);
            }
        }
        _ => {}
    }
}

/// Same-origin links follow the mirror; every other link is neutralised
/// while its text stays.
fn rewrite_anchor(ctx: &RequestContext, el: &mut Element) {
    let Some((_, value)) = el
        .attrs
        .iter_mut()
        .find(|(name, value)| &*name.local == "href" && !value.is_empty())
    else {
        return;
    };

    let mut base = ctx.site.origin.clone();
    base.set_path(&ctx.path);
    let Ok(resolved) = base.join(value) else {
        return;
    };

    if host_with_port(&resolved) == ctx.site.origin_host() {
        let rewritten = format!("{}://{}{}", ctx.scheme, ctx.host, &resolved[Position::BeforePath..]);
        *value = rewritten.into();
    } else {
        *value = "#".into();
    }
}

fn host_with_port(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

fn rewrite_alternate(ctx: &RequestContext, el: &mut Element) {
    let is_alternate = el
        .attrs
        .iter()
        .any(|(name, value)| &*name.local == "rel" && value.eq_ignore_ascii_case("alternate"));
    if !is_alternate {
        return;
    }
    if let Some((_, value)) = el.attrs.iter_mut().find(|(name, _)| &*name.local == "href") {
        *value = format!("//{}", ctx.host).into();
    }
}

fn rewrite_meta(ctx: &RequestContext, el: &mut Element) {
    let mut content = None;
    for (name, value) in el.attrs.iter_mut() {
        let key: &str = &name.local;
        if key == "name" && ctx.is_index {
            if value.eq_ignore_ascii_case("keywords") {
                content = Some(INDEX_KEYWORDS_TAG);
                break;
            }
            if value.eq_ignore_ascii_case("description") {
                content = Some(INDEX_DESCRIPTION_TAG);
                break;
            }
        }
        if key == "http-equiv" {
            if value.eq_ignore_ascii_case("content-type") {
                content = Some("text/html; charset=UTF-8");
                break;
            }
            if value.eq_ignore_ascii_case("content-security-policy") {
                content = Some("*");
                break;
            }
        }
        if key == "charset" {
            *value = "UTF-8".into();
        }
    }

    let Some(content) = content else {
        return;
    };
    for (name, value) in el.attrs.iter_mut() {
        if &*name.local == "content" {
            *value = content.into();
        }
    }
}
