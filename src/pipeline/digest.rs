//! Digest composer: ranks a batch of processed newsletters and renders a
//! markdown digest with summary statistics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::pipeline::types::ProcessedNewsletter;

/// Rendered when there is nothing to report.
pub const EMPTY_DIGEST: &str = "No newsletters found for today.";

/// Links shown per entry.
const MAX_ENTRY_LINKS: usize = 3;

/// Importance band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    /// Score 4-5.
    High,
    /// Score 3.
    Medium,
    /// Score 1-2.
    Low,
}

impl Band {
    pub fn for_score(score: u8) -> Self {
        match score {
            4.. => Self::High,
            3 => Self::Medium,
            _ => Self::Low,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestStats {
    pub total: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    /// Newsletter count per category name.
    pub categories: BTreeMap<String, usize>,
    /// Mean importance, two decimal places.
    pub average_score: Decimal,
}

/// A composed digest, ready to hand to a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub title: String,
    pub generated_at: DateTime<Utc>,
    pub markdown: String,
    pub stats: DigestStats,
}

impl Digest {
    pub fn is_empty(&self) -> bool {
        self.stats.total == 0
    }
}

#[derive(Debug, Default)]
pub struct DigestComposer;

impl DigestComposer {
    pub fn new() -> Self {
        Self
    }

    pub fn compose(&self, newsletters: &[ProcessedNewsletter], generated_at: DateTime<Utc>) -> Digest {
        let title = format!("Newsletter Digest - {}", generated_at.format("%B %d, %Y"));
        let stats = self.stats(newsletters);

        if newsletters.is_empty() {
            return Digest {
                title,
                generated_at,
                markdown: EMPTY_DIGEST.to_string(),
                stats,
            };
        }

        let mut sorted: Vec<&ProcessedNewsletter> = newsletters.iter().collect();
        // Stable: equal scores keep processing order.
        sorted.sort_by(|a, b| b.importance_score.cmp(&a.importance_score));

        let section = |band: Band| {
            let entries: Vec<String> = sorted
                .iter()
                .filter(|n| Band::for_score(n.importance_score) == band)
                .map(|n| format_entry(n))
                .collect();
            if entries.is_empty() {
                "*No newsletters in this category*".to_string()
            } else {
                entries.join("\n")
            }
        };

        let markdown = format!(
            "# {title}\n\n\
             ## Summary\n\
             - Total newsletters processed: {total}\n\
             - High importance (4-5): {high}\n\
             - Medium importance (3): {medium}\n\
             - Low importance (1-2): {low}\n\n\
             ## Top Stories (Score 4-5)\n\n{high_section}\n\n\
             ## Medium Priority (Score 3)\n\n{medium_section}\n\n\
             ## Lower Priority (Score 1-2)\n\n{low_section}\n",
            total = stats.total,
            high = stats.high,
            medium = stats.medium,
            low = stats.low,
            high_section = section(Band::High),
            medium_section = section(Band::Medium),
            low_section = section(Band::Low),
        );

        info!(
            total = stats.total,
            high = stats.high,
            average_score = %stats.average_score,
            "Composed digest"
        );

        Digest {
            title,
            generated_at,
            markdown,
            stats,
        }
    }

    pub fn stats(&self, newsletters: &[ProcessedNewsletter]) -> DigestStats {
        let mut stats = DigestStats {
            total: newsletters.len(),
            ..DigestStats::default()
        };
        let mut score_sum: u64 = 0;
        for n in newsletters {
            match Band::for_score(n.importance_score) {
                Band::High => stats.high += 1,
                Band::Medium => stats.medium += 1,
                Band::Low => stats.low += 1,
            }
            *stats
                .categories
                .entry(n.category.as_str().to_string())
                .or_insert(0) += 1;
            score_sum += u64::from(n.importance_score);
        }
        if stats.total > 0 {
            stats.average_score =
                (Decimal::from(score_sum) / Decimal::from(stats.total as u64)).round_dp(2);
        }
        stats
    }
}

fn format_entry(n: &ProcessedNewsletter) -> String {
    let mut entry = format!(
        "### {} (Score: {}/5)\n**From:** {} | **Category:** {}\n\n",
        n.subject, n.importance_score, n.sender, n.category
    );
    for bullet in n.summary_bullets.iter().filter(|b| !b.trim().is_empty()) {
        entry.push_str(&format!("• {bullet}\n"));
    }
    let links = if n.key_links.is_empty() {
        &n.links
    } else {
        &n.key_links
    };
    if !links.is_empty() {
        entry.push_str("\n**Links:**\n");
        for link in links.iter().take(MAX_ENTRY_LINKS) {
            entry.push_str(&format!("- {link}\n"));
        }
    }
    entry
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::pipeline::types::{Category, InferenceSource, InferenceSources};

    fn make_newsletter(subject: &str, score: u8, category: Category) -> ProcessedNewsletter {
        ProcessedNewsletter {
            subject: subject.into(),
            sender: "news@substack.com".into(),
            cleaned_text: "text".into(),
            links: vec![
                "https://a.io/1".into(),
                "https://a.io/2".into(),
                "https://a.io/3".into(),
                "https://a.io/4".into(),
            ],
            key_links: vec![],
            summary_bullets: ["first".into(), "second".into(), String::new()],
            category,
            importance_score: score,
            source_message_id: subject.into(),
            processed_at: Utc::now(),
            sources: InferenceSources {
                summary: InferenceSource::Primary,
                category: InferenceSource::Primary,
                score: InferenceSource::Primary,
            },
        }
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 7, 8, 0, 0).unwrap()
    }

    #[test]
    fn empty_input_renders_placeholder() {
        let digest = DigestComposer::new().compose(&[], at());
        assert_eq!(digest.markdown, EMPTY_DIGEST);
        assert!(digest.is_empty());
        assert_eq!(digest.stats.average_score, Decimal::ZERO);
    }

    #[test]
    fn bands_by_score() {
        assert_eq!(Band::for_score(5), Band::High);
        assert_eq!(Band::for_score(4), Band::High);
        assert_eq!(Band::for_score(3), Band::Medium);
        assert_eq!(Band::for_score(2), Band::Low);
        assert_eq!(Band::for_score(1), Band::Low);
    }

    #[test]
    fn entries_sorted_by_score_descending() {
        let items = vec![
            make_newsletter("Low one", 1, Category::News),
            make_newsletter("Top one", 5, Category::Tool),
            make_newsletter("Mid one", 3, Category::Opinion),
            make_newsletter("Top two", 4, Category::News),
        ];
        let digest = DigestComposer::new().compose(&items, at());
        let md = &digest.markdown;
        let pos = |s: &str| md.find(s).unwrap();
        assert!(pos("Top one") < pos("Top two"));
        assert!(pos("Top two") < pos("Mid one"));
        assert!(pos("Mid one") < pos("Low one"));
        assert!(md.starts_with("# Newsletter Digest - March 07, 2025"));
    }

    #[test]
    fn empty_band_has_placeholder() {
        let items = vec![make_newsletter("Only", 5, Category::News)];
        let md = DigestComposer::new().compose(&items, at()).markdown;
        assert_eq!(md.matches("*No newsletters in this category*").count(), 2);
    }

    #[test]
    fn entry_skips_empty_bullets_and_caps_links() {
        let items = vec![make_newsletter("Entry", 4, Category::Tool)];
        let md = DigestComposer::new().compose(&items, at()).markdown;
        assert!(md.contains("### Entry (Score: 4/5)"));
        assert!(md.contains("**From:** news@substack.com | **Category:** Tool"));
        assert!(md.contains("• first\n• second\n"));
        assert!(!md.contains("• \n"));
        assert!(md.contains("- https://a.io/3"));
        assert!(!md.contains("https://a.io/4"));
    }

    #[test]
    fn key_links_take_precedence() {
        let mut n = make_newsletter("Entry", 4, Category::Tool);
        n.key_links = vec!["https://key.io".into()];
        let md = DigestComposer::new().compose(&[n], at()).markdown;
        assert!(md.contains("- https://key.io"));
        assert!(!md.contains("https://a.io/1"));
    }

    #[test]
    fn stats_count_bands_and_categories() {
        let items = vec![
            make_newsletter("a", 5, Category::News),
            make_newsletter("b", 3, Category::News),
            make_newsletter("c", 2, Category::Tool),
        ];
        let stats = DigestComposer::new().stats(&items);
        assert_eq!((stats.total, stats.high, stats.medium, stats.low), (3, 1, 1, 1));
        assert_eq!(stats.categories.get("News"), Some(&2));
        assert_eq!(stats.categories.get("Tool"), Some(&1));
        assert_eq!(stats.average_score, dec!(3.33));
    }
}
