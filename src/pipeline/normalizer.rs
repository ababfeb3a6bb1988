//! Content normalizer: raw email body → clean text plus links.
//!
//! HTML bodies are parsed with `scraper` and walked once, dropping
//! non-content subtrees (scripts, styles, `<head>`, footer/header/social
//! regions) and collecting links in document order. Plain-text bodies skip
//! the tree walk. Both paths then go through the same line filter:
//! quoted-reply chrome, boilerplate lines, and lines too short to carry
//! content are removed.
//!
//! `clean` never fails. When every line is filtered out the normalizer falls
//! back to a coarser cleaning so that non-empty input yields non-empty text.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Node};
use tracing::{debug, warn};
use url::Url;

use crate::channels::email_types::strip_quoted_text;
use crate::pipeline::types::{CleanedContent, RawMessage};

/// Default boilerplate marker patterns (case-insensitive regexes).
pub const DEFAULT_MARKER_PATTERNS: &[&str] = &[
    // unsubscribe blocks
    r"click here to unsubscribe",
    r"unsubscribe",
    r"opt.?out",
    r"to stop receiving",
    r"manage your preferences",
    r"update your preferences",
    r"email preferences",
    r"preferences center",
    // legal footers
    r"©\s*\d{4}",
    r"all rights reserved",
    r"powered by",
    r"this email was sent to",
    r"you received this email because",
    r"add us to your address book",
    // header chrome
    r"view this email in your browser",
    r"email not displaying correctly",
    r"view online",
    r"web version",
    // social clusters
    r"follow us on",
    r"connect with us",
    r"find us on",
];

/// Boilerplate lines longer than this keep their content; only the marker
/// phrase itself is removed.
const BOILERPLATE_LINE_MAX: usize = 160;

/// Tags whose whole subtree is dropped.
const SKIPPED_TAGS: &[&str] = &["script", "style", "head", "noscript", "template", "svg"];

/// `class`/`id` fragments that mark non-content regions.
const SKIPPED_REGIONS: &[&str] = &["footer", "header", "unsubscribe", "social", "share"];

/// Tags that start a new line in the extracted text.
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "br", "li", "tr", "h1", "h2", "h3", "h4", "h5", "h6", "table", "section",
    "article", "blockquote", "ul", "ol", "hr", "pre", "center",
];

static MARKUP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<\s*(html|body|div|p|table|a|br|span|td|head)\b").expect("valid regex")
});

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

static NON_TEXT_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|head|noscript)\b.*?</(script|style|head|noscript)\s*>")
        .expect("valid regex")
});

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"'`]+"#).expect("valid regex"));

static UNSUBSCRIBE_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(unsubscribe|opt[-_]?out|/preferences|email[-_]?preferences|manage[-_]?(subscription|preferences))",
    )
    .expect("valid regex")
});

/// Normalizer settings.
#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    /// Boilerplate marker patterns, as case-insensitive regexes.
    pub marker_patterns: Vec<String>,
    /// Lines shorter than this (in chars) are dropped unless they hold a link.
    pub min_line_chars: usize,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            marker_patterns: DEFAULT_MARKER_PATTERNS.iter().map(|s| s.to_string()).collect(),
            min_line_chars: 20,
        }
    }
}

/// Turns raw email bodies into `CleanedContent`.
pub struct ContentNormalizer {
    markers: Option<Regex>,
    min_line_chars: usize,
}

impl ContentNormalizer {
    /// Build a normalizer. Fails only on an invalid marker pattern.
    pub fn new(config: NormalizerConfig) -> Result<Self, regex::Error> {
        let patterns: Vec<&str> = config
            .marker_patterns
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();
        let markers = if patterns.is_empty() {
            None
        } else {
            Some(Regex::new(&format!("(?i)(?:{})", patterns.join("|")))?)
        };
        Ok(Self {
            markers,
            min_line_chars: config.min_line_chars,
        })
    }

    /// Clean one message body.
    pub fn clean(&self, message: &RawMessage) -> CleanedContent {
        let (extracted, raw_links) = if looks_like_markup(&message.body) {
            let (text, links) = walk_html(&message.body);
            if text.trim().is_empty() {
                debug!(id = %message.id, "Markup yielded no text, falling back to tag strip");
                (strip_markup_lines(&message.body), links)
            } else {
                (text, links)
            }
        } else {
            let links = urls_in_text(&message.body);
            (message.body.clone(), links)
        };

        let unquoted = strip_quoted_text(&extracted);
        let mut text = self.filter_lines(&unquoted);

        if text.is_empty() {
            // Under-cleaned but non-empty: keep the marker guarantee only.
            let coarse = self.remove_markers(&collapse_whitespace(&unquoted));
            text = if coarse.is_empty() {
                self.remove_markers(&strip_markup(&message.body))
            } else {
                coarse
            };
            if !text.is_empty() {
                warn!(
                    id = %message.id,
                    "Normalization degraded: line filter removed everything"
                );
            }
        }

        let links = dedup_links(raw_links);
        debug!(
            id = %message.id,
            text_chars = text.chars().count(),
            links = links.len(),
            "Content normalized"
        );
        CleanedContent { text, links }
    }

    fn filter_lines(&self, text: &str) -> String {
        let mut kept = Vec::new();
        for line in text.lines() {
            let line = collapse_whitespace(line);
            if line.is_empty() {
                continue;
            }
            let is_marker = self.markers.as_ref().is_some_and(|m| m.is_match(&line));
            if is_marker && line.chars().count() <= BOILERPLATE_LINE_MAX {
                continue;
            }
            let line = self.remove_markers(&line);
            let has_link = URL_RE.is_match(&line);
            if line.chars().count() < self.min_line_chars && !has_link {
                continue;
            }
            kept.push(line);
        }
        self.remove_markers_across_lines(&kept.join("\n"))
    }

    /// Markers may span a line break once lines are joined (`©` ending one
    /// line, the year starting the next). A match keeps only its line break.
    fn remove_markers_across_lines(&self, text: &str) -> String {
        let Some(markers) = &self.markers else {
            return text.to_string();
        };
        if !markers.is_match(text) {
            return text.to_string();
        }
        let mut current = text.to_string();
        while markers.is_match(&current) {
            current = markers
                .replace_all(&current, |caps: &regex::Captures<'_>| {
                    let matched = &caps[0];
                    if matched.contains('\n') && matched.len() > 1 {
                        "\n".to_string()
                    } else {
                        " ".to_string()
                    }
                })
                .into_owned();
        }
        current
            .lines()
            .map(collapse_whitespace)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Remove every marker occurrence, repeating until none is left.
    fn remove_markers(&self, text: &str) -> String {
        let Some(markers) = &self.markers else {
            return text.to_string();
        };
        let mut current = text.to_string();
        // Each pass strictly shortens the string, so this terminates.
        while markers.is_match(&current) {
            current = markers.replace_all(&current, " ").into_owned();
        }
        collapse_whitespace(&current)
    }
}

/// Whether a body should go through the HTML path.
pub fn looks_like_markup(body: &str) -> bool {
    MARKUP_RE.is_match(body)
}

/// Visible text of a body on a single line, via a regex tag strip.
///
/// Cheap enough for the relevance filter's length check.
pub fn strip_markup(body: &str) -> String {
    if !looks_like_markup(body) {
        return collapse_whitespace(body);
    }
    collapse_whitespace(&decode_entities(
        &TAG_RE.replace_all(&NON_TEXT_BLOCK_RE.replace_all(body, " "), " "),
    ))
}

/// Like `strip_markup` but keeps line breaks.
fn strip_markup_lines(body: &str) -> String {
    let without_blocks = NON_TEXT_BLOCK_RE.replace_all(body, "\n");
    decode_entities(&TAG_RE.replace_all(&without_blocks, "\n"))
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── HTML walk ───────────────────────────────────────────────────────

fn walk_html(body: &str) -> (String, Vec<String>) {
    let document = Html::parse_document(body);
    let mut text = String::new();
    let mut links = Vec::new();
    walk_element(document.root_element(), &mut text, &mut links);
    (text, links)
}

fn walk_element(element: ElementRef<'_>, text: &mut String, links: &mut Vec<String>) {
    let value = element.value();
    let name = value.name();
    if SKIPPED_TAGS.contains(&name) || is_skipped_region(value.attr("class"), value.id()) {
        return;
    }

    let is_block = BLOCK_TAGS.contains(&name);
    if is_block {
        text.push('\n');
    }
    if name == "a"
        && let Some(href) = value.attr("href")
    {
        links.push(href.trim().to_string());
    }

    for child in element.children() {
        match child.value() {
            Node::Text(t) => {
                let s: &str = t;
                links.extend(urls_in_text(s));
                text.push_str(s);
            }
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    walk_element(child_el, text, links);
                }
            }
            _ => {}
        }
    }

    if is_block {
        text.push('\n');
    } else if name == "td" || name == "th" {
        text.push(' ');
    }
}

fn is_skipped_region(class: Option<&str>, id: Option<&str>) -> bool {
    [class, id].into_iter().flatten().any(|attr| {
        let attr = attr.to_ascii_lowercase();
        SKIPPED_REGIONS.iter().any(|region| attr.contains(region))
    })
}

// ── Links ───────────────────────────────────────────────────────────

fn urls_in_text(text: &str) -> Vec<String> {
    URL_RE
        .find_iter(text)
        .map(|m| {
            m.as_str()
                .trim_end_matches(['.', ',', ';', ':', '!', '?', ')', ']', '}', '\'', '"'])
                .to_string()
        })
        .collect()
}

fn is_absolute_http(candidate: &str) -> bool {
    Url::parse(candidate).is_ok_and(|u| matches!(u.scheme(), "http" | "https"))
}

/// Keep absolute http(s) links, drop unsubscribe targets, dedup by exact
/// string preserving first-seen order.
fn dedup_links(candidates: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|l| is_absolute_http(l) && !UNSUBSCRIBE_LINK_RE.is_match(l))
        .filter(|l| seen.insert(l.clone()))
        .collect()
}
