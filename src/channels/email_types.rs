//! Email parsing helpers: quote stripping and RFC 5322 → `RawMessage`.

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders, PartType};
use uuid::Uuid;

use crate::pipeline::types::RawMessage;

/// Strip quoted text from an email body.
///
/// Removes:
/// - Lines starting with `>` (quoted reply lines)
/// - Everything after an "On ... wrote:" attribution line
/// - Everything after a "--- Original Message ---" or "Forwarded message"
///   separator
pub fn strip_quoted_text(body: &str) -> String {
    let mut result = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with('>') {
            continue;
        }

        // "On Mon, Jan 1, 2026 at 10:00 AM Alice <alice@ex.com> wrote:"
        if trimmed.starts_with("On ") && trimmed.ends_with("wrote:") {
            break;
        }

        if trimmed.starts_with("---")
            && (trimmed.contains("Original Message") || trimmed.contains("Forwarded message"))
        {
            break;
        }

        result.push(line);
    }

    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }

    result.join("\n")
}

/// Sender address from the `From` header, lowercased.
pub fn sender_address(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".into())
}

/// Body to hand to the normalizer: the HTML part when present (links live
/// there), else the plain-text part, else any inline text part.
pub fn preferred_body(parsed: &mail_parser::Message) -> String {
    if has_html_part(parsed)
        && let Some(html) = parsed.body_html(0)
        && !html.trim().is_empty()
    {
        return html.into_owned();
    }
    if let Some(text) = parsed.body_text(0) {
        return text.into_owned();
    }
    for part in parsed.attachments() {
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.to_string();
        }
    }
    String::new()
}

/// `body_html` synthesizes HTML from a text part, so check for a real one.
fn has_html_part(parsed: &mail_parser::Message) -> bool {
    parsed.html_body.iter().any(|&id| {
        parsed
            .part(id)
            .is_some_and(|p| matches!(p.body, PartType::Html(_)))
    })
}

fn received_at(parsed: &mail_parser::Message) -> DateTime<Utc> {
    parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now)
}

/// Parse a raw RFC 5322 message.
///
/// The id is the `Message-ID` header, falling back to a generated one.
/// Returns `None` if the bytes are not a parseable message.
pub fn parse_raw_message(raw: &[u8]) -> Option<RawMessage> {
    let parsed = MessageParser::default().parse(raw)?;
    let id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));

    Some(RawMessage {
        id,
        subject: parsed.subject().unwrap_or("(no subject)").to_string(),
        sender: sender_address(&parsed),
        received_at: received_at(&parsed),
        body: preferred_body(&parsed),
    })
}
