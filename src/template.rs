//! Placeholder substitution over rewritten output
//!
//! A single left-to-right scan resolves every known `{{name}}` and
//! `{{name:N}}` tag. Inserted values are never scanned again, so a value
//! that itself looks like a tag reaches the client verbatim. Unknown tags
//! (client-side template syntax, for instance) pass through untouched.

use crate::context::RequestContext;
use crate::page::inject_js_path;
use crate::rewrite::{INDEX_DESCRIPTION_TAG, INDEX_KEYWORDS_TAG};
use std::borrow::Cow;
use std::fmt::Write;
use tracing::warn;

const UPGRADE_INSECURE_META: &str =
    r#"<meta http-equiv="Content-Security-Policy" content="upgrade-insecure-requests">"#;

/// Which tags a pass resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagScope {
    /// Every page tag
    Page,
    /// Only `{{replace:N}}`, for CSS/JS bodies
    ReplaceOnly,
}

struct Resolver<'a> {
    ctx: &'a RequestContext,
    filler: &'a str,
    scope: TagScope,
    has_h1: bool,
}

impl Resolver<'_> {
    /// Write the value of `name` to `out`; false leaves the tag literal.
    fn resolve(&self, name: &str, out: &mut String) -> bool {
        if let Some(index) = name.strip_prefix("replace:") {
            return self.resolve_indexed(name, index, out, |i| self.ctx.site.replacement(i));
        }
        if self.scope == TagScope::ReplaceOnly {
            return false;
        }
        if let Some(index) = name.strip_prefix("keyword:") {
            return self.resolve_indexed(name, index, out, |i| self.ctx.content.keyword(i));
        }

        let ctx = self.ctx;
        let site = &ctx.site;
        match name {
            "inject_js" => out.push_str(&inject_js_html(ctx)),
            "index_title" if ctx.is_index => out.push_str(&site.index_title),
            "index_keywords" if ctx.is_index => out.push_str(&site.index_keywords),
            "index_description" if ctx.is_index => out.push_str(&site.index_description),
            "friend_links" if ctx.is_index => {
                out.push_str(&ctx.content.friend_links_html(&site.domain))
            }
            // Index-only tags on other pages resolve to nothing
            "index_title" | "index_keywords" | "index_description" | "friend_links" => {}
            "random_html" => out.push_str(&self.filler.replace("{{scheme}}", &ctx.scheme)),
            "h1_tag" => {
                if !self.has_h1 && !site.h1_replace.is_empty() {
                    let _ = write!(out, "<h1>{}</h1>", site.h1_replace);
                }
            }
            "h1_replace" => out.push_str(&site.h1_replace),
            _ => return false,
        }
        true
    }

    fn resolve_indexed<'v>(
        &self,
        name: &str,
        index: &str,
        out: &mut String,
        lookup: impl Fn(usize) -> Option<&'v str>,
    ) -> bool {
        match index.parse::<usize>().ok().and_then(lookup) {
            Some(value) => {
                out.push_str(value);
                true
            }
            None => {
                warn!(
                    request_id = %self.ctx.request_id,
                    domain = %self.ctx.site.domain,
                    tag = name,
                    "Unresolvable placeholder left in place"
                );
                false
            }
        }
    }
}

/// Ad script and https upgrade markup for `{{inject_js}}`
fn inject_js_html(ctx: &RequestContext) -> String {
    let mut html = String::new();
    if ctx.scheme == "https" {
        html.push_str(UPGRADE_INSECURE_META);
    }
    if ctx.content.is_ad_domain(&ctx.site.domain) && !ctx.allowed_crawler {
        let _ = write!(
            html,
            r#"<script type="text/javascript" src="{}"></script>"#,
            inject_js_path(&ctx.host)
        );
    }
    html
}

/// On index pages, give documents without description/keywords meta a
/// placeholder-carrying one right after the title.
fn with_index_meta_fallback(input: &str) -> Cow<'_, str> {
    let mut extra = String::new();
    if !input.contains(INDEX_DESCRIPTION_TAG) {
        let _ = write!(extra, r#"<meta name="description" content="{}">"#, INDEX_DESCRIPTION_TAG);
    }
    if !input.contains(INDEX_KEYWORDS_TAG) {
        let _ = write!(extra, r#"<meta name="keywords" content="{}">"#, INDEX_KEYWORDS_TAG);
    }
    if extra.is_empty() {
        return Cow::Borrowed(input);
    }
    match input.find("</title>") {
        Some(pos) => {
            let end = pos + "</title>".len();
            Cow::Owned(format!("{}{}{}", &input[..end], extra, &input[end..]))
        }
        None => Cow::Borrowed(input),
    }
}

fn substitute(resolver: &Resolver<'_>, input: &str, out: &mut String) {
    out.reserve(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return;
        };
        if resolver.resolve(&after[..end], out) {
            rest = &after[end + 2..];
        } else {
            out.push_str("{{");
            rest = after;
        }
    }
    out.push_str(rest);
}

/// Resolve page tags in rewritten HTML into `out`.
pub fn render_page(ctx: &RequestContext, rewritten: &str, filler: &str, out: &mut String) {
    let input = if ctx.is_index {
        with_index_meta_fallback(rewritten)
    } else {
        Cow::Borrowed(rewritten)
    };
    let resolver = Resolver {
        ctx,
        filler,
        scope: TagScope::Page,
        has_h1: input.contains("<h1"),
    };
    substitute(&resolver, &input, out);
}

/// Resolve replacement tags in a rewritten CSS/JS body into `out`.
pub fn render_asset(ctx: &RequestContext, rewritten: &str, out: &mut String) {
    let resolver = Resolver {
        ctx,
        filler: "",
        scope: TagScope::ReplaceOnly,
        has_h1: false,
    };
    substitute(&resolver, rewritten, out);
}
