//! Renders placeholder-annotated Markdown to HTML.
//!
//! The annotated source from `markup-annotation-rs` is run through
//! pulldown-cmark with raw HTML passed through. Event-level hooks keep
//! placeholder tokens out of emitted attribute values (image `src`, link
//! `href`/`title`, raw HTML `src`/`alt`/`title`) and rewrite relative image
//! paths against a host-supplied base. After rendering, the surviving tokens
//! are substituted with nested `<mark>` wrappers in first-occurrence order.

use markup_annotation_rs::PLACEHOLDER_RE;
use napi_derive::napi;
use once_cell::sync::Lazy;
use pulldown_cmark::{Event, Options, Parser, Tag, html};
use regex::{Captures, Regex};
use tracing::warn;

static ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(src|href|alt|title)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
        .expect("valid attribute regex")
});

/// Per-thread data needed to materialize markers: the persistent thread id
/// and a plain-text preview for the marker tooltip (escaped here).
#[derive(Clone, Debug)]
pub struct ThreadMarkup {
    pub thread_id: String,
    pub preview: String,
}

#[napi(object)]
#[derive(Clone)]
pub struct ThreadMarkupInput {
    #[napi(js_name = "threadId")]
    pub thread_id: String,
    pub preview: String,
}

#[napi(object)]
#[derive(Clone, Default)]
pub struct RenderOptions {
    /// Base URI that relative image paths are resolved against, e.g. a
    /// webview resource root. Absent: image paths pass through untouched.
    #[napi(js_name = "resourceBase")]
    pub resource_base: Option<String>,
}

#[napi(js_name = "renderAnnotatedMarkdown")]
pub fn render_annotated_markdown(
    content: String,
    threads: Vec<ThreadMarkupInput>,
    options: Option<RenderOptions>,
) -> String {
    let markups: Vec<ThreadMarkup> = threads
        .into_iter()
        .map(|thread| ThreadMarkup {
            thread_id: thread.thread_id,
            preview: thread.preview,
        })
        .collect();
    let options = options.unwrap_or_default();
    render_annotated(&content, &markups, options.resource_base.as_deref())
}

/// Render annotated Markdown to final HTML with comment markers.
pub fn render_annotated(
    content: &str,
    threads: &[ThreadMarkup],
    resource_base: Option<&str>,
) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_SMART_PUNCTUATION);

    let parser =
        Parser::new_ext(content, options).map(|event| sanitize_event(event, resource_base));

    let mut rendered = String::with_capacity(content.len() * 2);
    html::push_html(&mut rendered, parser);

    // Safety net: attribute values assembled by the renderer itself (e.g. an
    // image alt built from inline text) can still carry tokens.
    let rendered = scrub_attribute_placeholders(&rendered);
    substitute_placeholders(&rendered, threads)
}

fn sanitize_event<'a>(event: Event<'a>, resource_base: Option<&str>) -> Event<'a> {
    match event {
        Event::Start(Tag::Image {
            link_type,
            dest_url,
            title,
            id,
        }) => {
            let dest = resolve_image_src(strip_placeholders(&dest_url), resource_base);
            Event::Start(Tag::Image {
                link_type,
                dest_url: dest.into(),
                title: strip_placeholders(&title).into(),
                id,
            })
        }
        Event::Start(Tag::Link {
            link_type,
            dest_url,
            title,
            id,
        }) => Event::Start(Tag::Link {
            link_type,
            dest_url: strip_placeholders(&dest_url).into(),
            title: strip_placeholders(&title).into(),
            id,
        }),
        Event::Html(raw) => Event::Html(scrub_attribute_placeholders(&raw).into()),
        Event::InlineHtml(raw) => Event::InlineHtml(scrub_attribute_placeholders(&raw).into()),
        other => other,
    }
}

fn strip_placeholders(value: &str) -> String {
    if !PLACEHOLDER_RE.is_match(value) {
        return value.to_string();
    }
    warn!("placeholder token leaked into an attribute value, stripping");
    PLACEHOLDER_RE.replace_all(value, "").into_owned()
}

/// Remove placeholder tokens from `src`/`href`/`alt`/`title` attribute values
/// inside already-rendered or raw HTML.
fn scrub_attribute_placeholders(html: &str) -> String {
    ATTR_RE
        .replace_all(html, |caps: &Captures| {
            let name = &caps[1];
            if let Some(value) = caps.get(2) {
                format!(r#"{name}="{}""#, strip_placeholders(value.as_str()))
            } else if let Some(value) = caps.get(3) {
                format!("{name}='{}'", strip_placeholders(value.as_str()))
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Map relative image paths onto the host's resource base. Anything with a
/// scheme, a fragment, or no base configured passes through unchanged.
fn resolve_image_src(src: String, resource_base: Option<&str>) -> String {
    let Some(base) = resource_base else {
        return src;
    };
    if src.is_empty() || src.starts_with('#') || has_uri_scheme(&src) {
        return src;
    }
    let trimmed = src.trim_start_matches("./").trim_start_matches('/');
    format!("{}/{}", base.trim_end_matches('/'), trimmed)
}

fn has_uri_scheme(src: &str) -> bool {
    src.split_once(':').is_some_and(|(scheme, _)| {
        !scheme.is_empty()
            && scheme
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.'))
    })
}

/// Replace placeholder tokens with `<mark>` open/close markup in
/// first-occurrence order. Tokens with no matching thread are dropped.
fn substitute_placeholders(html: &str, threads: &[ThreadMarkup]) -> String {
    PLACEHOLDER_RE
        .replace_all(html, |caps: &Captures| {
            if let Some(index) = caps.get(1) {
                let first = &caps[2] == "first";
                match thread_for(index.as_str(), threads) {
                    Some(thread) => open_marker(thread, first),
                    None => String::new(),
                }
            } else if let Some(index) = caps.get(3) {
                match thread_for(index.as_str(), threads) {
                    Some(_) => "</mark>".to_string(),
                    None => String::new(),
                }
            } else {
                String::new()
            }
        })
        .into_owned()
}

fn thread_for<'a>(index: &str, threads: &'a [ThreadMarkup]) -> Option<&'a ThreadMarkup> {
    let index: usize = index.parse().ok()?;
    let thread = threads.get(index);
    if thread.is_none() {
        warn!(index, "placeholder token without a matching thread, dropping");
    }
    thread
}

fn open_marker(thread: &ThreadMarkup, first: bool) -> String {
    let class = if first {
        "comment-highlight comment-highlight-first"
    } else {
        "comment-highlight"
    };
    format!(
        r#"<mark class="{class}" data-comment-id="{}" title="{}">"#,
        escape_attr(&thread.thread_id),
        escape_attr(&thread.preview)
    )
}

fn escape_attr(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
