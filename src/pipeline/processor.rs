//! Item processor: drives one message through the whole pipeline.
//!
//! Flow per message:
//! 1. Relevance filter (no network) → may reject
//! 2. Content normalizer
//! 3. Gateway summarize → classify → score, one request in flight at a time
//! 4. Persist the artifact
//! 5. Mark the message read, only after the write succeeded
//!
//! **Core invariant: a message is marked read iff its artifact was durably
//! persisted.** Anything else leaves it unread for the next run.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::pipeline::gateway::{InferenceGateway, InferenceInput};
use crate::pipeline::normalizer::ContentNormalizer;
use crate::pipeline::rules::RelevanceFilter;
use crate::pipeline::types::{
    BatchReport, FailedStage, InferenceKind, InferenceSources, Mailbox, ProcessedNewsletter,
    ProcessedOutcome, RawMessage, RejectionReason,
};
use crate::store::NewsletterStore;

/// What to do with an artifact whose three inference results are all degraded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DegradedPolicy {
    /// Persist the placeholder artifact and mark the message read.
    #[default]
    Persist,
    /// Fail the message so it stays unread and is retried next run.
    Retry,
}

impl DegradedPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Persist => "persist",
            Self::Retry => "retry",
        }
    }
}

impl fmt::Display for DegradedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DegradedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "persist" => Ok(Self::Persist),
            "retry" => Ok(Self::Retry),
            other => Err(format!("unknown degraded policy '{other}' (expected persist|retry)")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessorConfig {
    /// Scores below this are rejected without persisting. 1 disables the check.
    pub min_importance: u8,
    pub degraded_policy: DegradedPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            min_importance: 1,
            degraded_policy: DegradedPolicy::Persist,
        }
    }
}

pub struct NewsletterProcessor {
    filter: RelevanceFilter,
    normalizer: ContentNormalizer,
    gateway: InferenceGateway,
    mailbox: Arc<dyn Mailbox>,
    store: Arc<dyn NewsletterStore>,
    config: ProcessorConfig,
}

impl NewsletterProcessor {
    pub fn new(
        filter: RelevanceFilter,
        normalizer: ContentNormalizer,
        gateway: InferenceGateway,
        mailbox: Arc<dyn Mailbox>,
        store: Arc<dyn NewsletterStore>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            filter,
            normalizer,
            gateway,
            mailbox,
            store,
            config,
        }
    }

    /// Process a single message. Never panics and never returns an error:
    /// every failure is captured in the outcome.
    pub async fn process(&self, message: &RawMessage) -> ProcessedOutcome {
        let verdict = self.filter.classify(message);
        if !verdict.accepted {
            debug!(
                id = %message.id,
                sender = %message.sender,
                reason = %verdict.reason,
                "Message rejected by relevance filter"
            );
            return ProcessedOutcome::Rejected(RejectionReason::Filter(verdict.reason));
        }

        let content = self.normalizer.clean(message);
        debug!(
            id = %message.id,
            chars = content.text.chars().count(),
            links = content.links.len(),
            "Normalized content"
        );

        let mut input = InferenceInput {
            subject: &message.subject,
            sender: &message.sender,
            content: &content,
            summary: None,
        };
        let (summary, summary_source) = self.gateway.summarize(&input).await;
        input.summary = Some(&summary);
        let (category, category_source) = self.gateway.classify(&input).await;
        let (score, score_source) = self.gateway.score(&input).await;

        let sources = InferenceSources {
            summary: summary_source,
            category: category_source,
            score: score_source,
        };

        if sources.all_degraded() {
            warn!(
                id = %message.id,
                policy = %self.config.degraded_policy,
                "Every inference call degraded"
            );
            if self.config.degraded_policy == DegradedPolicy::Retry {
                let kinds = InferenceKind::ALL
                    .iter()
                    .map(|k| k.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                return ProcessedOutcome::Failed {
                    stage: FailedStage::Inference,
                    cause: PipelineError::AllProvidersExhausted { kinds },
                };
            }
        }

        if score < self.config.min_importance {
            info!(
                id = %message.id,
                score,
                min_importance = self.config.min_importance,
                "Below importance threshold, not persisting"
            );
            return ProcessedOutcome::Rejected(RejectionReason::LowImportance { score });
        }

        let newsletter = ProcessedNewsletter {
            subject: message.subject.clone(),
            sender: message.sender.clone(),
            cleaned_text: content.text.clone(),
            links: content.links.clone(),
            key_links: summary.links.clone(),
            summary_bullets: summary.bullets.clone(),
            category,
            importance_score: score,
            source_message_id: message.id.clone(),
            processed_at: Utc::now(),
            sources,
        };

        if let Err(e) = self.store.write(&newsletter).await {
            error!(
                id = %message.id,
                stage = FailedStage::Persist.as_str(),
                store = self.store.name(),
                error = %e,
                "Failed to persist newsletter, leaving message unread"
            );
            return ProcessedOutcome::Failed {
                stage: FailedStage::Persist,
                cause: e.into(),
            };
        }

        if let Err(e) = self.mailbox.mark_processed(&message.id).await {
            // The upsert makes a re-run safe; the artifact is already durable.
            warn!(
                id = %message.id,
                mailbox = self.mailbox.name(),
                error = %e,
                "Persisted but failed to mark message read"
            );
        }

        info!(
            id = %message.id,
            subject = %message.subject,
            score,
            category = %category,
            degraded = sources.any_degraded(),
            "Newsletter persisted"
        );
        ProcessedOutcome::Persisted(Box::new(newsletter))
    }

    /// Fetch unread mail and process every message in order.
    ///
    /// A fetch failure yields an empty report with `fetch_failed` set. No
    /// single message failure aborts the batch.
    pub async fn run_batch(&self) -> BatchReport {
        let mut report = BatchReport::default();

        let messages = match self.mailbox.fetch_unread().await {
            Ok(messages) => messages,
            Err(e) => {
                error!(mailbox = self.mailbox.name(), error = %e, "Mailbox fetch failed");
                report.fetch_failed = true;
                return report;
            }
        };

        report.fetched = messages.len();
        info!(count = report.fetched, mailbox = self.mailbox.name(), "Processing batch");

        for message in messages {
            let outcome = self.process(&message).await;
            debug!(id = %message.id, outcome = outcome.label(), "Message done");
            report.record(message.id, message.subject, outcome);
        }

        info!(
            fetched = report.fetched,
            persisted = report.persisted,
            rejected = report.rejected,
            failed = report.failed,
            "Batch processing complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;
    use crate::error::{ChannelError, DatabaseError, LlmError};
    use crate::llm::provider::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
    use crate::llm::retry::RetryConfig;
    use crate::pipeline::normalizer::NormalizerConfig;
    use crate::pipeline::prompts::PromptSet;
    use crate::pipeline::rules::FilterConfig;
    use crate::pipeline::types::{Category, FilterReason, InferenceSource};

    // ── Mocks ───────────────────────────────────────────────────────

    /// Answers by prompt kind, or fails every call.
    struct MockLlm {
        name: &'static str,
        fail_with: Option<fn() -> LlmError>,
        score: &'static str,
        calls: AtomicU32,
    }

    impl MockLlm {
        fn healthy(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail_with: None,
                score: "4",
                calls: AtomicU32::new(0),
            })
        }

        fn scoring(name: &'static str, score: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail_with: None,
                score,
                calls: AtomicU32::new(0),
            })
        }

        fn failing(name: &'static str, err: fn() -> LlmError) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail_with: Some(err),
                score: "4",
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmProvider for MockLlm {
        fn model_name(&self) -> &str {
            "mock-model"
        }

        fn provider_name(&self) -> &str {
            self.name
        }

        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.fail_with {
                return Err(err());
            }
            let system = request.system_prompt().unwrap_or_default().to_lowercase();
            let content = if system.contains("summarizes") {
                "• Point one\n• Point two\n• Point three\nCategory: Tool\nLinks: https://key.example.com".to_string()
            } else if system.contains("classify") {
                "Tool".to_string()
            } else {
                self.score.to_string()
            };
            Ok(CompletionResponse {
                content,
                input_tokens: 100,
                output_tokens: 20,
                finish_reason: FinishReason::Stop,
                response_id: None,
            })
        }
    }

    fn rate_limited() -> LlmError {
        LlmError::RateLimited {
            provider: "primary".into(),
            retry_after: None,
        }
    }

    fn auth_failed() -> LlmError {
        LlmError::AuthFailed {
            provider: "secondary".into(),
        }
    }

    #[derive(Default)]
    struct MockMailbox {
        messages: Vec<RawMessage>,
        fetch_fails: bool,
        mark_fails: bool,
        marked: Mutex<Vec<String>>,
    }

    impl MockMailbox {
        fn marked(&self) -> Vec<String> {
            self.marked.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Mailbox for MockMailbox {
        fn name(&self) -> &str {
            "mock"
        }

        async fn fetch_unread(&self) -> Result<Vec<RawMessage>, ChannelError> {
            if self.fetch_fails {
                return Err(ChannelError::FetchFailed {
                    name: "mock".into(),
                    reason: "connection reset".into(),
                });
            }
            Ok(self.messages.clone())
        }

        async fn mark_processed(&self, id: &str) -> Result<(), ChannelError> {
            if self.mark_fails {
                return Err(ChannelError::MarkFailed {
                    name: "mock".into(),
                    id: id.into(),
                    reason: "read-only mailbox".into(),
                });
            }
            self.marked.lock().unwrap().push(id.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockStore {
        fails: bool,
        written: Mutex<Vec<ProcessedNewsletter>>,
    }

    #[async_trait]
    impl NewsletterStore for MockStore {
        fn name(&self) -> &str {
            "mock"
        }

        async fn write(&self, newsletter: &ProcessedNewsletter) -> Result<(), DatabaseError> {
            if self.fails {
                return Err(DatabaseError::Query("disk full".into()));
            }
            self.written.lock().unwrap().push(newsletter.clone());
            Ok(())
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn make_message(id: &str, subject: &str, sender: &str) -> RawMessage {
        let mut body = String::from(
            "This week in our newsletter: the biggest AI launches and what they mean.\n\
             Read more at https://example.com/story-one and https://example.com/story-two\n",
        );
        while body.len() < 2000 {
            body.push_str("Analysis of the latest developments in machine learning tooling.\n");
        }
        RawMessage {
            id: id.into(),
            subject: subject.into(),
            sender: sender.into(),
            received_at: Utc::now(),
            body,
        }
    }

    fn newsletter_message(id: &str) -> RawMessage {
        make_message(id, "Weekly AI Roundup", "news@substack.com")
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 1,
            base_backoff: std::time::Duration::ZERO,
            max_backoff: std::time::Duration::ZERO,
            jitter: false,
        }
    }

    fn processor(
        primary: Arc<dyn LlmProvider>,
        secondary: Option<Arc<dyn LlmProvider>>,
        mailbox: Arc<MockMailbox>,
        store: Arc<MockStore>,
        config: ProcessorConfig,
    ) -> NewsletterProcessor {
        NewsletterProcessor::new(
            RelevanceFilter::new(FilterConfig::default()).unwrap(),
            ContentNormalizer::new(NormalizerConfig::default()).unwrap(),
            InferenceGateway::new(primary, secondary, PromptSet::builtin(), fast_retry()),
            mailbox,
            store,
            config,
        )
    }

    // ── Degraded policy ─────────────────────────────────────────────

    #[test]
    fn degraded_policy_parses() {
        assert_eq!("persist".parse::<DegradedPolicy>().unwrap(), DegradedPolicy::Persist);
        assert_eq!(" RETRY ".parse::<DegradedPolicy>().unwrap(), DegradedPolicy::Retry);
        assert!("drop".parse::<DegradedPolicy>().is_err());
        assert_eq!(DegradedPolicy::default(), DegradedPolicy::Persist);
    }

    // ── process ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn newsletter_is_persisted_then_marked() {
        let mailbox = Arc::new(MockMailbox::default());
        let store = Arc::new(MockStore::default());
        let p = processor(
            MockLlm::healthy("primary"),
            None,
            mailbox.clone(),
            store.clone(),
            ProcessorConfig::default(),
        );

        let outcome = p.process(&newsletter_message("m1")).await;
        match outcome {
            ProcessedOutcome::Persisted(n) => {
                assert_eq!(n.source_message_id, "m1");
                assert_eq!(n.importance_score, 4);
                assert_eq!(n.category, Category::Tool);
                assert_eq!(n.summary_bullets[0], "Point one");
                assert_eq!(n.links.len(), 2);
                assert_eq!(n.key_links, vec!["https://key.example.com"]);
                assert!(!n.cleaned_text.is_empty());
                assert_eq!(n.sources.summary, InferenceSource::Primary);
            }
            other => panic!("Expected Persisted, got {:?}", other),
        }
        assert_eq!(store.written.lock().unwrap().len(), 1);
        assert_eq!(mailbox.marked(), vec!["m1"]);
    }

    #[tokio::test]
    async fn rejected_message_makes_no_calls_and_stays_unread() {
        let llm = MockLlm::healthy("primary");
        let mailbox = Arc::new(MockMailbox::default());
        let store = Arc::new(MockStore::default());
        let p = processor(
            llm.clone(),
            None,
            mailbox.clone(),
            store.clone(),
            ProcessorConfig::default(),
        );

        let msg = make_message("r1", "Your receipt from Acme", "receipts@acme.com");
        match p.process(&msg).await {
            ProcessedOutcome::Rejected(RejectionReason::Filter(FilterReason::Transactional)) => {}
            other => panic!("Expected Rejected(transactional), got {:?}", other),
        }
        assert_eq!(llm.calls(), 0);
        assert!(mailbox.marked().is_empty());
        assert!(store.written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn persistence_failure_never_marks_read() {
        let mailbox = Arc::new(MockMailbox::default());
        let store = Arc::new(MockStore {
            fails: true,
            ..MockStore::default()
        });
        let p = processor(
            MockLlm::healthy("primary"),
            None,
            mailbox.clone(),
            store,
            ProcessorConfig::default(),
        );

        for id in ["a", "b", "c"] {
            match p.process(&newsletter_message(id)).await {
                ProcessedOutcome::Failed {
                    stage: FailedStage::Persist,
                    cause: PipelineError::Persistence(_),
                } => {}
                other => panic!("Expected Failed(persist), got {:?}", other),
            }
        }
        assert!(mailbox.marked().is_empty());
    }

    #[tokio::test]
    async fn mark_failure_keeps_persisted_outcome() {
        let mailbox = Arc::new(MockMailbox {
            mark_fails: true,
            ..MockMailbox::default()
        });
        let store = Arc::new(MockStore::default());
        let p = processor(
            MockLlm::healthy("primary"),
            None,
            mailbox,
            store.clone(),
            ProcessorConfig::default(),
        );

        let outcome = p.process(&newsletter_message("m1")).await;
        assert!(matches!(outcome, ProcessedOutcome::Persisted(_)));
        assert_eq!(store.written.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rate_limited_primary_uses_fallback_for_every_kind() {
        let primary = MockLlm::failing("primary", rate_limited);
        let secondary = MockLlm::healthy("secondary");
        let p = processor(
            primary.clone(),
            Some(secondary.clone()),
            Arc::new(MockMailbox::default()),
            Arc::new(MockStore::default()),
            ProcessorConfig::default(),
        );

        match p.process(&newsletter_message("m1")).await {
            ProcessedOutcome::Persisted(n) => {
                assert_eq!(n.sources.summary, InferenceSource::Fallback);
                assert_eq!(n.sources.category, InferenceSource::Fallback);
                assert_eq!(n.sources.score, InferenceSource::Fallback);
            }
            other => panic!("Expected Persisted, got {:?}", other),
        }
        // Rate limits are not retried: one primary call per kind.
        assert_eq!(primary.calls(), 3);
        assert_eq!(secondary.calls(), 3);
    }

    #[tokio::test]
    async fn all_degraded_is_persisted_by_default() {
        let mailbox = Arc::new(MockMailbox::default());
        let p = processor(
            MockLlm::failing("primary", rate_limited),
            Some(MockLlm::failing("secondary", auth_failed)),
            mailbox.clone(),
            Arc::new(MockStore::default()),
            ProcessorConfig::default(),
        );

        match p.process(&newsletter_message("m1")).await {
            ProcessedOutcome::Persisted(n) => {
                assert!(n.sources.all_degraded());
                assert_eq!(n.importance_score, 3);
                assert_eq!(n.category, Category::News);
            }
            other => panic!("Expected Persisted, got {:?}", other),
        }
        assert_eq!(mailbox.marked(), vec!["m1"]);
    }

    #[tokio::test]
    async fn all_degraded_under_retry_policy_fails_and_stays_unread() {
        let mailbox = Arc::new(MockMailbox::default());
        let store = Arc::new(MockStore::default());
        let p = processor(
            MockLlm::failing("primary", rate_limited),
            None,
            mailbox.clone(),
            store.clone(),
            ProcessorConfig {
                degraded_policy: DegradedPolicy::Retry,
                ..ProcessorConfig::default()
            },
        );

        match p.process(&newsletter_message("m1")).await {
            ProcessedOutcome::Failed {
                stage: FailedStage::Inference,
                cause: PipelineError::AllProvidersExhausted { kinds },
            } => assert!(kinds.contains("summarize")),
            other => panic!("Expected Failed(inference), got {:?}", other),
        }
        assert!(mailbox.marked().is_empty());
        assert!(store.written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn low_importance_is_rejected_without_write() {
        let mailbox = Arc::new(MockMailbox::default());
        let store = Arc::new(MockStore::default());
        let p = processor(
            MockLlm::scoring("primary", "2"),
            None,
            mailbox.clone(),
            store.clone(),
            ProcessorConfig {
                min_importance: 3,
                ..ProcessorConfig::default()
            },
        );

        match p.process(&newsletter_message("m1")).await {
            ProcessedOutcome::Rejected(RejectionReason::LowImportance { score: 2 }) => {}
            other => panic!("Expected Rejected(low-importance), got {:?}", other),
        }
        assert!(store.written.lock().unwrap().is_empty());
        assert!(mailbox.marked().is_empty());
    }

    // ── run_batch ───────────────────────────────────────────────────

    #[tokio::test]
    async fn batch_aggregates_outcomes() {
        let mailbox = Arc::new(MockMailbox {
            messages: vec![
                newsletter_message("n1"),
                make_message("t1", "Password reset requested", "no-reply@bank.com"),
                newsletter_message("n2"),
            ],
            ..MockMailbox::default()
        });
        let store = Arc::new(MockStore::default());
        let p = processor(
            MockLlm::healthy("primary"),
            None,
            mailbox.clone(),
            store.clone(),
            ProcessorConfig::default(),
        );

        let report = p.run_batch().await;
        assert!(!report.fetch_failed);
        assert_eq!(report.fetched, 3);
        assert_eq!(report.persisted, 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.outcomes[1].message_id, "t1");
        assert_eq!(report.persisted_newsletters().len(), 2);
        assert_eq!(mailbox.marked(), vec!["n1", "n2"]);
    }

    #[tokio::test]
    async fn batch_fetch_failure_yields_flagged_empty_report() {
        let llm = MockLlm::healthy("primary");
        let mailbox = Arc::new(MockMailbox {
            fetch_fails: true,
            ..MockMailbox::default()
        });
        let p = processor(
            llm.clone(),
            None,
            mailbox,
            Arc::new(MockStore::default()),
            ProcessorConfig::default(),
        );

        let report = p.run_batch().await;
        assert!(report.fetch_failed);
        assert_eq!(report.fetched, 0);
        assert!(report.outcomes.is_empty());
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn batch_continues_after_persist_failures() {
        let mailbox = Arc::new(MockMailbox {
            messages: vec![newsletter_message("n1"), newsletter_message("n2")],
            ..MockMailbox::default()
        });
        let p = processor(
            MockLlm::healthy("primary"),
            None,
            mailbox.clone(),
            Arc::new(MockStore {
                fails: true,
                ..MockStore::default()
            }),
            ProcessorConfig::default(),
        );

        let report = p.run_batch().await;
        assert_eq!(report.failed, 2);
        assert!(mailbox.marked().is_empty());
    }
}
