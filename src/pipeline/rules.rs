//! Relevance filter: the pre-LLM rules that decide whether an email is a
//! newsletter worth summarizing.
//!
//! Runs before any network call. Policy, first match wins:
//! - no extractable body text → `too-short`
//! - transactional sender/subject (receipts, password resets, ...) → `transactional`
//! - sender on the domain block-list → `blocked-domain`
//! - body at or below the minimum length → `too-short`
//! - sender on a known newsletter platform → accept
//! - newsletter keyword in subject or body → accept
//! - otherwise → `no-keyword-match`

use regex::Regex;
use tracing::debug;

use crate::pipeline::normalizer::strip_markup;
use crate::pipeline::types::{FilterReason, FilterVerdict, RawMessage};

/// Default newsletter keywords, matched case-insensitively on word boundaries.
pub const DEFAULT_NEWSLETTER_KEYWORDS: &[&str] = &[
    "newsletter",
    "digest",
    "weekly",
    "daily",
    "update",
    "news",
    "insights",
    "roundup",
    "summary",
    "report",
    "briefing",
    "alert",
    "insight",
    "analysis",
    "review",
    "trends",
    "market",
    "industry",
    "tech",
    "startup",
    "funding",
    "acquisition",
    "launch",
    "release",
];

/// Default newsletter platforms and publishers.
pub const DEFAULT_NEWSLETTER_DOMAINS: &[&str] = &[
    "substack.com",
    "revue.co",
    "beehiiv.com",
    "convertkit.com",
    "mailchimp.com",
    "constantcontact.com",
    "medium.com",
    "techcrunch.com",
    "wired.com",
    "theverge.com",
    "arstechnica.com",
    "hackernews.com",
    "producthunt.com",
    "indiehackers.com",
];

/// Default transactional phrases, matched in sender or subject.
pub const DEFAULT_TRANSACTIONAL_PHRASES: &[&str] = &[
    "receipt",
    "invoice",
    "order confirmation",
    "shipping",
    "password reset",
    "account verification",
    "unsubscribe",
    "confirm your email",
    "verify your account",
    "welcome to",
    "your order",
    "payment received",
    "shipping confirmation",
];

/// Which field a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    Sender,
    Subject,
    Body,
}

/// A single transactional rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct TransactionalRule {
    /// Human-readable pattern description.
    pub pattern: String,
    pub regex: Regex,
    pub field: RuleField,
}

/// Filter lists and thresholds.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub newsletter_keywords: Vec<String>,
    pub newsletter_domains: Vec<String>,
    pub transactional_phrases: Vec<String>,
    /// Regexes matched against the plain-text body; a hit is transactional.
    pub transactional_body_patterns: Vec<String>,
    pub blocked_domains: Vec<String>,
    /// A body must be strictly longer than this many plain-text chars.
    pub min_body_chars: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        let owned = |list: &[&str]| list.iter().map(|s| s.to_string()).collect();
        Self {
            newsletter_keywords: owned(DEFAULT_NEWSLETTER_KEYWORDS),
            newsletter_domains: owned(DEFAULT_NEWSLETTER_DOMAINS),
            transactional_phrases: owned(DEFAULT_TRANSACTIONAL_PHRASES),
            transactional_body_patterns: Vec::new(),
            blocked_domains: Vec::new(),
            min_body_chars: 500,
        }
    }
}

/// Deterministic newsletter classifier.
pub struct RelevanceFilter {
    keywords: Option<Regex>,
    transactional_rules: Vec<TransactionalRule>,
    newsletter_domains: Vec<String>,
    blocked_domains: Vec<String>,
    min_body_chars: usize,
}

/// Case-insensitive, word-bounded alternation of literal phrases.
fn phrase_regex(phrases: &[String]) -> Result<Option<Regex>, regex::Error> {
    let escaped: Vec<String> = phrases
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(regex::escape)
        .collect();
    if escaped.is_empty() {
        return Ok(None);
    }
    Regex::new(&format!(r"(?i)\b(?:{})\b", escaped.join("|"))).map(Some)
}

fn normalize_domains(domains: &[String]) -> Vec<String> {
    domains
        .iter()
        .map(|d| d.trim().trim_start_matches('@').to_lowercase())
        .filter(|d| !d.is_empty())
        .collect()
}

/// Whether `domain` equals an entry or is a subdomain of one.
pub fn domain_matches(list: &[String], domain: &str) -> bool {
    list.iter()
        .any(|d| domain == d || domain.ends_with(&format!(".{d}")))
}

impl RelevanceFilter {
    /// Build a filter. Fails only if a custom phrase or body pattern is not a
    /// valid regex.
    pub fn new(config: FilterConfig) -> Result<Self, regex::Error> {
        let mut transactional_rules = Vec::new();
        if let Some(regex) = phrase_regex(&config.transactional_phrases)? {
            for field in [RuleField::Sender, RuleField::Subject] {
                transactional_rules.push(TransactionalRule {
                    pattern: "transactional phrase".into(),
                    regex: regex.clone(),
                    field,
                });
            }
        }
        // Bulk-billing and bounce senders, e.g. receipts@, billing@, mailer-daemon@.
        transactional_rules.push(TransactionalRule {
            pattern: "billing sender".into(),
            regex: Regex::new(
                r"(?i)^<?(receipts?|billing|invoices?|orders?|payments?|mailer[\-_]?daemon|postmaster)@",
            )?,
            field: RuleField::Sender,
        });
        for pattern in &config.transactional_body_patterns {
            let pattern = pattern.trim();
            if pattern.is_empty() {
                continue;
            }
            transactional_rules.push(TransactionalRule {
                pattern: pattern.to_string(),
                regex: Regex::new(&format!("(?i){pattern}"))?,
                field: RuleField::Body,
            });
        }

        Ok(Self {
            keywords: phrase_regex(&config.newsletter_keywords)?,
            transactional_rules,
            newsletter_domains: normalize_domains(&config.newsletter_domains),
            blocked_domains: normalize_domains(&config.blocked_domains),
            min_body_chars: config.min_body_chars,
        })
    }

    /// Classify a message. No I/O, never panics.
    pub fn classify(&self, message: &RawMessage) -> FilterVerdict {
        let body_text = strip_markup(&message.body);
        let body_chars = body_text.chars().count();

        if body_chars == 0 {
            debug!(id = %message.id, "Empty body");
            return FilterVerdict::reject(FilterReason::TooShort);
        }

        for rule in &self.transactional_rules {
            let value = match rule.field {
                RuleField::Sender => message.sender.as_str(),
                RuleField::Subject => message.subject.as_str(),
                RuleField::Body => body_text.as_str(),
            };
            if rule.regex.is_match(value) {
                debug!(
                    id = %message.id,
                    sender = %message.sender,
                    rule = %rule.pattern,
                    field = ?rule.field,
                    "Message matched transactional rule"
                );
                return FilterVerdict::reject(FilterReason::Transactional);
            }
        }

        let domain = message.sender_domain();
        if let Some(domain) = &domain
            && domain_matches(&self.blocked_domains, domain)
        {
            debug!(id = %message.id, domain = %domain, "Sender domain is blocked");
            return FilterVerdict::reject(FilterReason::BlockedDomain);
        }

        if body_chars <= self.min_body_chars {
            debug!(
                id = %message.id,
                body_chars,
                min = self.min_body_chars,
                "Body at or below minimum length"
            );
            return FilterVerdict::reject(FilterReason::TooShort);
        }

        if let Some(domain) = &domain
            && domain_matches(&self.newsletter_domains, domain)
        {
            debug!(id = %message.id, domain = %domain, "Known newsletter platform");
            return FilterVerdict::accept();
        }

        if let Some(keywords) = &self.keywords {
            let hit = keywords
                .find(&message.subject)
                .or_else(|| keywords.find(&body_text));
            if let Some(m) = hit {
                debug!(id = %message.id, keyword = m.as_str(), "Newsletter keyword matched");
                return FilterVerdict::accept();
            }
        }

        FilterVerdict::reject(FilterReason::NoKeywordMatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_message(sender: &str, subject: &str, body: &str) -> RawMessage {
        RawMessage {
            id: "test-1".into(),
            subject: subject.into(),
            sender: sender.into(),
            received_at: Utc::now(),
            body: body.into(),
        }
    }

    fn filter() -> RelevanceFilter {
        RelevanceFilter::new(FilterConfig::default()).unwrap()
    }

    /// Filler prose with no newsletter keyword.
    fn filler(chars: usize) -> String {
        "lorem ipsum dolor sit amet ".repeat(chars / 27 + 1)[..chars].to_string()
    }

    // ── Accept paths ────────────────────────────────────────────────

    #[test]
    fn accepts_known_platform_without_keyword() {
        let msg = make_message("writer@substack.com", "Thoughts", &filler(800));
        assert_eq!(filter().classify(&msg), FilterVerdict::accept());
    }

    #[test]
    fn accepts_platform_subdomain() {
        let msg = make_message("hello@mail.beehiiv.com", "Thoughts", &filler(800));
        assert!(filter().classify(&msg).accepted);
    }

    #[test]
    fn accepts_keyword_in_subject() {
        let msg = make_message("editor@example.org", "The Weekly Roundup", &filler(800));
        assert!(filter().classify(&msg).accepted);
    }

    #[test]
    fn accepts_keyword_in_body() {
        let body = format!("{} this newsletter is great", filler(800));
        let msg = make_message("editor@example.org", "Hello", &body);
        assert!(filter().classify(&msg).accepted);
    }

    #[test]
    fn keyword_in_html_body_counts() {
        let body = format!("<html><body><p>{}</p><p>Industry insights</p></body></html>", filler(700));
        let msg = make_message("editor@example.org", "Hello", &body);
        assert!(filter().classify(&msg).accepted);
    }

    // ── Reject paths ────────────────────────────────────────────────

    #[test]
    fn keyword_matching_is_word_bounded() {
        // "newsy" and "technology" do not contain "news"/"tech" as words.
        let body = format!("{} newsy technology", filler(800));
        let msg = make_message("editor@example.org", "Hello", &body);
        assert_eq!(
            filter().classify(&msg),
            FilterVerdict::reject(FilterReason::NoKeywordMatch)
        );
    }

    #[test]
    fn rejects_receipt_subject_as_transactional() {
        let msg = make_message("billing@acme.com", "Your receipt from Acme", &filler(800));
        assert_eq!(
            filter().classify(&msg),
            FilterVerdict::reject(FilterReason::Transactional)
        );
    }

    #[test]
    fn transactional_wins_over_platform() {
        let msg = make_message("team@substack.com", "Welcome to Substack", &filler(800));
        assert_eq!(filter().classify(&msg).reason, FilterReason::Transactional);
    }

    #[test]
    fn rejects_billing_sender() {
        let msg = make_message("receipts@shop.example", "Thanks!", &filler(800));
        assert_eq!(filter().classify(&msg).reason, FilterReason::Transactional);
    }

    #[test]
    fn rejects_blocked_domain() {
        let config = FilterConfig {
            blocked_domains: vec!["spammy.io".into()],
            ..FilterConfig::default()
        };
        let filter = RelevanceFilter::new(config).unwrap();
        let msg = make_message("news@list.spammy.io", "Weekly digest", &filler(800));
        assert_eq!(
            filter.classify(&msg),
            FilterVerdict::reject(FilterReason::BlockedDomain)
        );
    }

    #[test]
    fn blocked_domain_checked_before_length() {
        let config = FilterConfig {
            blocked_domains: vec!["spammy.io".into()],
            ..FilterConfig::default()
        };
        let filter = RelevanceFilter::new(config).unwrap();
        let msg = make_message("news@spammy.io", "Receipt", &filler(100));
        assert_eq!(filter.classify(&msg).reason, FilterReason::Transactional);
        let msg = make_message("news@spammy.io", "Weekly digest", &filler(100));
        assert_eq!(filter.classify(&msg).reason, FilterReason::BlockedDomain);
    }

    #[test]
    fn empty_body_is_too_short_even_with_keywords() {
        let msg = make_message("news@substack.com", "Weekly newsletter", "");
        assert_eq!(filter().classify(&msg).reason, FilterReason::TooShort);
    }

    #[test]
    fn markup_only_body_is_too_short() {
        let msg = make_message(
            "news@substack.com",
            "Weekly newsletter",
            "<html><body><img src=\"x.png\"></body></html>",
        );
        assert_eq!(filter().classify(&msg).reason, FilterReason::TooShort);
    }

    #[test]
    fn short_body_with_keyword_is_too_short() {
        let msg = make_message("editor@example.org", "Daily news", &filler(100));
        assert_eq!(filter().classify(&msg).reason, FilterReason::TooShort);
    }

    #[test]
    fn body_exactly_at_threshold_is_too_short() {
        let msg = make_message("editor@example.org", "Daily news", &filler(500));
        assert_eq!(filter().classify(&msg).reason, FilterReason::TooShort);
        let msg = make_message("editor@example.org", "Daily news", &filler(501));
        assert!(filter().classify(&msg).accepted);
    }

    #[test]
    fn below_threshold_never_accepted() {
        let subjects = ["Weekly newsletter digest", "Tech news roundup", "hello"];
        let senders = ["a@substack.com", "b@example.org"];
        for len in [1, 50, 250, 499, 500] {
            for subject in subjects {
                for sender in senders {
                    let body = format!("newsletter {}", filler(len))[..len].to_string();
                    let msg = make_message(sender, subject, &body);
                    assert!(
                        !filter().classify(&msg).accepted,
                        "accepted {len}-char body from {sender}"
                    );
                }
            }
        }
    }

    #[test]
    fn rejects_without_keyword_or_platform() {
        let msg = make_message("friend@example.org", "Dinner plans", &filler(800));
        assert_eq!(filter().classify(&msg).reason, FilterReason::NoKeywordMatch);
    }

    // ── Custom rules ────────────────────────────────────────────────

    #[test]
    fn configured_body_pattern_rejects() {
        let config = FilterConfig {
            transactional_body_patterns: vec![r"tracking number:?\s*\d+".into()],
            ..FilterConfig::default()
        };
        let filter = RelevanceFilter::new(config).unwrap();
        let body = format!("{} your Tracking Number 123", filler(800));
        let msg = make_message("news@substack.com", "Update", &body);
        assert_eq!(filter.classify(&msg).reason, FilterReason::Transactional);

        let clean = make_message("news@substack.com", "Update", &filler(800));
        assert!(filter.classify(&clean).accepted);
    }

    #[test]
    fn invalid_body_pattern_is_an_error() {
        let config = FilterConfig {
            transactional_body_patterns: vec!["(unclosed".into()],
            ..FilterConfig::default()
        };
        assert!(RelevanceFilter::new(config).is_err());
    }

    #[test]
    fn empty_keyword_list_never_matches() {
        let config = FilterConfig {
            newsletter_keywords: vec![],
            ..FilterConfig::default()
        };
        let filter = RelevanceFilter::new(config).unwrap();
        let msg = make_message("editor@example.org", "Weekly newsletter", &filler(800));
        assert_eq!(filter.classify(&msg).reason, FilterReason::NoKeywordMatch);
    }

    #[test]
    fn domain_matching_rules() {
        let list = vec!["substack.com".to_string()];
        assert!(domain_matches(&list, "substack.com"));
        assert!(domain_matches(&list, "mail.substack.com"));
        assert!(!domain_matches(&list, "notsubstack.com"));
    }
}
