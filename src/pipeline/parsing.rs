//! Parsers for free-text model responses.
//!
//! Strict on shape, lenient on noise: surrounding whitespace, quotes,
//! markdown emphasis and label prefixes are ignored, but an answer that
//! does not contain the expected shape is a parse failure (`None`), which
//! the gateway treats like a provider failure.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::pipeline::types::{Category, Summary};

static INTEGER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid regex"));

static NUMBERED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,2}[.)]\s+(.*)$").expect("valid regex"));

static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s,<>()\[\]"'`]+"#).expect("valid regex"));

/// First integer in the response, accepted only if it is in `1..=5`.
pub fn parse_score(response: &str) -> Option<u8> {
    let first = INTEGER_RE.find(response.trim())?;
    match first.as_str().parse::<u8>() {
        Ok(score @ 1..=5) => Some(score),
        _ => None,
    }
}

/// A single category token, optionally prefixed with `Category:` and
/// wrapped in quotes or punctuation.
pub fn parse_category(response: &str) -> Option<Category> {
    let token = strip_label(response.trim(), "category:").unwrap_or(response.trim());
    let token = token.trim_matches(|c: char| !c.is_alphanumeric());
    Category::from_token(token)
}

/// Bullets plus optional `Category:` and `Links:` lines.
///
/// Zero bullets is a parse failure. Fewer than three bullets are padded with
/// empty strings; extra bullets are dropped.
pub fn parse_summary(response: &str) -> Option<Summary> {
    let mut bullets: Vec<String> = Vec::new();
    let mut category: Option<String> = None;
    let mut links: Vec<String> = Vec::new();
    let mut in_links = false;

    for raw in response.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(value) = strip_label(line, "category:") {
            in_links = false;
            let value = value.trim_matches(|c: char| c.is_whitespace() || c == '*' || c == '_');
            if !value.is_empty() {
                category = Some(
                    Category::from_token(value.trim_matches(|c: char| !c.is_alphanumeric()))
                        .map(|c| c.as_str().to_string())
                        .unwrap_or_else(|| value.to_string()),
                );
            }
            continue;
        }

        if let Some(value) = strip_label(line, "links:") {
            in_links = true;
            links.extend(links_in(value));
            continue;
        }

        if let Some(text) = bullet_text(line) {
            if in_links && LINK_RE.is_match(text) {
                links.extend(links_in(text));
            } else if !text.is_empty() {
                in_links = false;
                bullets.push(text.to_string());
            }
            continue;
        }

        if in_links && LINK_RE.is_match(line) {
            links.extend(links_in(line));
        }
    }

    if bullets.is_empty() {
        return None;
    }

    bullets.truncate(3);
    let mut iter = bullets.into_iter();
    let mut next = || iter.next().unwrap_or_default();
    let bullets = [next(), next(), next()];

    Some(Summary {
        bullets,
        category: category.unwrap_or_else(|| Category::News.as_str().to_string()),
        links: dedup(links),
    })
}

/// If `line` starts with `label` (case-insensitive, emphasis allowed),
/// return the rest.
fn strip_label<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let unemphasized = line.trim_start_matches(['*', '_', '#', ' ']);
    let head = unemphasized.get(..label.len())?;
    if head.eq_ignore_ascii_case(label) {
        Some(unemphasized[label.len()..].trim_start_matches(['*', '_']).trim())
    } else {
        None
    }
}

/// Text of a bullet line (`•`, `-`, `*`, `1.`, `1)`), or `None`.
fn bullet_text(line: &str) -> Option<&str> {
    if let Some(rest) = line.strip_prefix('•') {
        return Some(rest.trim());
    }
    for marker in ['-', '*'] {
        if let Some(rest) = line.strip_prefix(marker)
            && rest.starts_with(char::is_whitespace)
        {
            return Some(rest.trim());
        }
    }
    NUMBERED_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
}

fn links_in(text: &str) -> Vec<String> {
    LINK_RE
        .find_iter(text)
        .map(|m| {
            m.as_str()
                .trim_end_matches(['.', ';', ':', '!', '?'])
                .to_string()
        })
        .filter(|l| Url::parse(l).is_ok_and(|u| matches!(u.scheme(), "http" | "https")))
        .collect()
}

fn dedup(links: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    links.into_iter().filter(|l| seen.insert(l.clone())).collect()
}
