//! Batch runner and cron scheduling.
//!
//! One run = process every unread message, then compose a digest from what
//! was persisted and hand it to the store.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::channels::ImapMailbox;
use crate::config::{PipelineConfig, StoreConfig};
use crate::error::ConfigError;
use crate::llm::create_provider;
use crate::pipeline::{
    BatchReport, ContentNormalizer, Digest, DigestComposer, InferenceGateway, NewsletterProcessor,
    PromptSet, RelevanceFilter,
};
use crate::store::{LibSqlStore, NewsletterStore, NotionStore};

const NOTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of one scheduled run.
#[derive(Debug)]
pub struct RunSummary {
    pub report: BatchReport,
    pub digest: Digest,
    /// False when the digest was empty or the store rejected it.
    pub digest_written: bool,
}

pub struct DigestRunner {
    processor: NewsletterProcessor,
    store: Arc<dyn NewsletterStore>,
    composer: DigestComposer,
}

impl DigestRunner {
    pub fn new(processor: NewsletterProcessor, store: Arc<dyn NewsletterStore>) -> Self {
        Self {
            processor,
            store,
            composer: DigestComposer::new(),
        }
    }

    pub async fn run_once(&self) -> RunSummary {
        let report = self.processor.run_batch().await;
        let digest = self
            .composer
            .compose(&report.persisted_newsletters(), Utc::now());
        if digest.is_empty() {
            info!(fetched = report.fetched, "No newsletters persisted, skipping digest");
            return RunSummary {
                report,
                digest,
                digest_written: false,
            };
        }

        let digest_written = match self.store.write_digest(&digest).await {
            Ok(()) => {
                info!(
                    store = self.store.name(),
                    title = %digest.title,
                    total = digest.stats.total,
                    "Digest written"
                );
                true
            }
            Err(e) => {
                error!(store = self.store.name(), error = %e, "Digest write failed");
                false
            }
        };

        RunSummary {
            report,
            digest,
            digest_written,
        }
    }
}

/// Assemble the runner from configuration: filter, normalizer, providers,
/// prompts, store and mailbox. Opens the store (and checks the Notion
/// connection) but does not touch the mailbox.
pub async fn build_runner(config: &PipelineConfig) -> crate::error::Result<DigestRunner> {
    let email = config.email.clone().ok_or_else(|| ConfigError::MissingRequired {
        key: "EMAIL_IMAP_HOST".into(),
        hint: "set EMAIL_IMAP_HOST, EMAIL_USERNAME and EMAIL_PASSWORD".into(),
    })?;

    let filter = RelevanceFilter::new(config.filter.clone()).map_err(|e| {
        ConfigError::InvalidValue {
            key: "FILTER_*".into(),
            message: e.to_string(),
        }
    })?;
    let normalizer = ContentNormalizer::new(config.normalizer.clone()).map_err(|e| {
        ConfigError::InvalidValue {
            key: "NORMALIZER_MARKERS".into(),
            message: e.to_string(),
        }
    })?;

    let primary = create_provider(&config.primary)?;
    let secondary = config.secondary.as_ref().map(create_provider).transpose()?;
    let prompts = match &config.prompt_dir {
        Some(dir) => PromptSet::load(dir)?,
        None => PromptSet::builtin(),
    };
    let gateway = InferenceGateway::new(primary, secondary, prompts, config.retry.clone());

    let store: Arc<dyn NewsletterStore> = match &config.store {
        StoreConfig::Notion { token, database_id } => {
            let notion = NotionStore::new(token.clone(), database_id.clone(), NOTION_TIMEOUT);
            notion.test_connection().await?;
            Arc::new(notion)
        }
        StoreConfig::LibSql { path } => Arc::new(LibSqlStore::new_local(path).await?),
    };
    info!(store = store.name(), mailbox = %email.imap_host, "Pipeline assembled");

    let processor = NewsletterProcessor::new(
        filter,
        normalizer,
        gateway,
        Arc::new(ImapMailbox::new(email)),
        Arc::clone(&store),
        config.processor,
    );
    Ok(DigestRunner::new(processor, store))
}

/// Parse a cron expression (seconds field first).
pub fn parse_schedule(expr: &str) -> Result<cron::Schedule, String> {
    cron::Schedule::from_str(expr).map_err(|e| format!("invalid cron: {e}"))
}

/// Next fire time strictly after `after`.
pub fn next_fire(schedule: &cron::Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Spawn the scheduler loop. Runs never overlap: the next fire time is
/// computed only after the previous run finishes.
pub fn spawn_scheduler(
    runner: Arc<DigestRunner>,
    schedule: cron::Schedule,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let Some(next) = next_fire(&schedule, now) else {
                warn!("Schedule has no upcoming fire times, stopping");
                return;
            };
            info!(next_run = %next.to_rfc3339(), "Next digest run scheduled");

            let wait = (next - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            let summary = runner.run_once().await;
            info!(
                persisted = summary.report.persisted,
                rejected = summary.report.rejected,
                failed = summary.report.failed,
                digest_written = summary.digest_written,
                "Scheduled run finished"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::TimeZone;
    use secrecy::SecretString;

    use super::*;
    use crate::channels::EmailConfig;
    use crate::error::Error;

    fn config_with(pairs: &[(&str, &str)]) -> PipelineConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = PipelineConfig::from_lookup(|key| map.get(key).cloned()).unwrap();
        config.email = Some(EmailConfig {
            imap_host: "imap.example.com".into(),
            imap_port: 993,
            username: "reader@example.com".into(),
            password: SecretString::from("app-password"),
            folder: "INBOX".into(),
            max_messages: 0,
            timeout: Duration::from_secs(30),
        });
        config
    }

    #[tokio::test]
    async fn build_requires_mailbox() {
        let mut config = config_with(&[("CEREBRAS_API_KEY", "k")]);
        config.email = None;
        match build_runner(&config).await {
            Err(Error::Config(ConfigError::MissingRequired { key, .. })) => {
                assert_eq!(key, "EMAIL_IMAP_HOST")
            }
            Err(other) => panic!("Expected MissingRequired, got {other}"),
            Ok(_) => panic!("Expected MissingRequired, got a runner"),
        }
    }

    #[tokio::test]
    async fn build_rejects_invalid_body_pattern() {
        let config = config_with(&[
            ("CEREBRAS_API_KEY", "k"),
            ("FILTER_TRANSACTIONAL_BODY_PATTERNS", "(unclosed"),
        ]);
        assert!(matches!(
            build_runner(&config).await,
            Err(Error::Config(ConfigError::InvalidValue { .. }))
        ));
    }

    #[tokio::test]
    async fn build_with_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("nested").join("newsletters.db");
        let config = config_with(&[
            ("CEREBRAS_API_KEY", "k"),
            ("NEWSLETTER_DB_PATH", db.to_str().unwrap()),
        ]);
        assert!(build_runner(&config).await.is_ok());
        assert!(db.exists());
    }

    #[test]
    fn daily_schedule_fires_at_nine() {
        let schedule = parse_schedule("0 0 9 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2025, 3, 7, 10, 30, 0).unwrap();
        let next = next_fire(&schedule, after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 8, 9, 0, 0).unwrap());
    }

    #[test]
    fn next_fire_is_strictly_after() {
        let schedule = parse_schedule("0 0 9 * * *").unwrap();
        let at_nine = Utc.with_ymd_and_hms(2025, 3, 7, 9, 0, 0).unwrap();
        let next = next_fire(&schedule, at_nine).unwrap();
        assert!(next > at_nine);
    }

    #[test]
    fn invalid_schedule_rejected() {
        assert!(parse_schedule("not a cron").is_err());
    }
}
