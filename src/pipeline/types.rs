//! Shared types for the newsletter processing pipeline.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, PipelineError};

// ── Inbound message ─────────────────────────────────────────────────

/// An unread email as delivered by a mailbox.
///
/// Mailbox adapters convert their native format into this struct. The body
/// is kept raw (HTML or plain text); cleaning is the normalizer's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    /// Mailbox-unique identifier (IMAP UID, Message-ID, ...).
    pub id: String,
    pub subject: String,
    /// Sender address, e.g. `news@substack.com`.
    pub sender: String,
    pub received_at: DateTime<Utc>,
    pub body: String,
}

impl RawMessage {
    /// Domain part of the sender address, lowercased.
    pub fn sender_domain(&self) -> Option<String> {
        let addr = self.sender.trim().trim_end_matches('>');
        let (_, domain) = addr.rsplit_once('@')?;
        let domain = domain.trim().to_lowercase();
        if domain.is_empty() { None } else { Some(domain) }
    }
}

// ── Filter verdict ──────────────────────────────────────────────────

/// Why the relevance filter accepted or rejected a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterReason {
    Ok,
    NoKeywordMatch,
    Transactional,
    TooShort,
    BlockedDomain,
}

impl FilterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::NoKeywordMatch => "no-keyword-match",
            Self::Transactional => "transactional",
            Self::TooShort => "too-short",
            Self::BlockedDomain => "blocked-domain",
        }
    }
}

impl fmt::Display for FilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the relevance filter. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterVerdict {
    pub accepted: bool,
    pub reason: FilterReason,
}

impl FilterVerdict {
    pub fn accept() -> Self {
        Self {
            accepted: true,
            reason: FilterReason::Ok,
        }
    }

    pub fn reject(reason: FilterReason) -> Self {
        Self {
            accepted: false,
            reason,
        }
    }
}

// ── Cleaned content ─────────────────────────────────────────────────

/// Normalized email text plus the links found in it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanedContent {
    pub text: String,
    /// Absolute URLs, unique, in order of first appearance.
    pub links: Vec<String>,
}

// ── Inference ───────────────────────────────────────────────────────

/// The three questions asked of the model for every newsletter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InferenceKind {
    Summarize,
    Classify,
    Score,
}

impl InferenceKind {
    pub const ALL: [InferenceKind; 3] = [Self::Summarize, Self::Classify, Self::Score];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summarize => "summarize",
            Self::Classify => "classify",
            Self::Score => "score",
        }
    }
}

impl fmt::Display for InferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Newsletter category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Category {
    #[default]
    News,
    Tool,
    Opinion,
}

impl Category {
    pub const ALL: [Category; 3] = [Self::News, Self::Tool, Self::Opinion];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::News => "News",
            Self::Tool => "Tool",
            Self::Opinion => "Opinion",
        }
    }

    /// Exact token match, ignoring case.
    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(token.trim()))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an inference result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceSource {
    Primary,
    Fallback,
    Degraded,
}

impl InferenceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
            Self::Degraded => "degraded",
        }
    }
}

impl fmt::Display for InferenceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed summarization response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Always exactly three; missing bullets are empty strings.
    pub bullets: [String; 3],
    /// Free-text category token from the summary response.
    pub category: String,
    pub links: Vec<String>,
}

/// A typed answer from the inference gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InferenceResult {
    Summary {
        summary: Summary,
        source: InferenceSource,
    },
    Category {
        category: Category,
        source: InferenceSource,
    },
    Score {
        score: u8,
        source: InferenceSource,
    },
}

impl InferenceResult {
    pub fn source(&self) -> InferenceSource {
        match self {
            Self::Summary { source, .. }
            | Self::Category { source, .. }
            | Self::Score { source, .. } => *source,
        }
    }

    pub fn kind(&self) -> InferenceKind {
        match self {
            Self::Summary { .. } => InferenceKind::Summarize,
            Self::Category { .. } => InferenceKind::Classify,
            Self::Score { .. } => InferenceKind::Score,
        }
    }
}

/// Per-call provenance of a processed newsletter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceSources {
    pub summary: InferenceSource,
    pub category: InferenceSource,
    pub score: InferenceSource,
}

impl InferenceSources {
    pub fn all_degraded(&self) -> bool {
        [self.summary, self.category, self.score]
            .iter()
            .all(|s| *s == InferenceSource::Degraded)
    }

    pub fn any_degraded(&self) -> bool {
        [self.summary, self.category, self.score]
            .iter()
            .any(|s| *s == InferenceSource::Degraded)
    }
}

// ── Processed newsletter ────────────────────────────────────────────

/// The record handed to persistence once all three inference calls finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedNewsletter {
    pub subject: String,
    pub sender: String,
    pub cleaned_text: String,
    /// Every link the normalizer found.
    pub links: Vec<String>,
    /// Links the summary singled out as most relevant.
    pub key_links: Vec<String>,
    pub summary_bullets: [String; 3],
    pub category: Category,
    pub importance_score: u8,
    pub source_message_id: String,
    pub processed_at: DateTime<Utc>,
    pub sources: InferenceSources,
}

// ── Outcomes ────────────────────────────────────────────────────────

/// Why a message was not persisted, without being an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    Filter(FilterReason),
    LowImportance { score: u8 },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filter(reason) => write!(f, "{reason}"),
            Self::LowImportance { score } => write!(f, "low-importance({score})"),
        }
    }
}

/// Pipeline stage at which a message failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedStage {
    Inference,
    Persist,
}

impl FailedStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inference => "inference",
            Self::Persist => "persist",
        }
    }
}

/// Terminal state of one message.
#[derive(Debug)]
pub enum ProcessedOutcome {
    Persisted(Box<ProcessedNewsletter>),
    Rejected(RejectionReason),
    Failed {
        stage: FailedStage,
        cause: PipelineError,
    },
}

impl ProcessedOutcome {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Persisted(_) => "persisted",
            Self::Rejected(_) => "rejected",
            Self::Failed { .. } => "failed",
        }
    }
}

/// A message id paired with how it ended.
#[derive(Debug)]
pub struct MessageOutcome {
    pub message_id: String,
    pub subject: String,
    pub outcome: ProcessedOutcome,
}

/// Aggregate result of one `run_batch` call.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub fetched: usize,
    pub persisted: usize,
    pub rejected: usize,
    pub failed: usize,
    /// The mailbox fetch itself failed; nothing was processed.
    pub fetch_failed: bool,
    pub outcomes: Vec<MessageOutcome>,
}

impl BatchReport {
    /// Record one message outcome and bump the matching counter.
    pub fn record(&mut self, message_id: String, subject: String, outcome: ProcessedOutcome) {
        match &outcome {
            ProcessedOutcome::Persisted(_) => self.persisted += 1,
            ProcessedOutcome::Rejected(_) => self.rejected += 1,
            ProcessedOutcome::Failed { .. } => self.failed += 1,
        }
        self.outcomes.push(MessageOutcome {
            message_id,
            subject,
            outcome,
        });
    }

    /// Newsletters persisted during this batch, in processing order.
    pub fn persisted_newsletters(&self) -> Vec<ProcessedNewsletter> {
        self.outcomes
            .iter()
            .filter_map(|o| match &o.outcome {
                ProcessedOutcome::Persisted(n) => Some(n.as_ref().clone()),
                _ => None,
            })
            .collect()
    }
}

// ── Mailbox trait ───────────────────────────────────────────────────

/// Source of unread newsletters. Pure I/O, no filtering.
///
/// `fetch_unread` must not change read state; only `mark_processed` does.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Mailbox name for logs (e.g. "imap").
    fn name(&self) -> &str;

    async fn fetch_unread(&self) -> Result<Vec<RawMessage>, ChannelError>;

    /// Mark a message read so the next run skips it.
    async fn mark_processed(&self, id: &str) -> Result<(), ChannelError>;
}
