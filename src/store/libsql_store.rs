//! libSQL store: local knowledge base for newsletters and digests.
//!
//! Supports local file and in-memory databases. Writes upsert on
//! `source_message_id`, so replaying a message after a crash between
//! persisting and marking read is harmless.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Row, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::digest::{Digest, DigestStats};
use crate::pipeline::types::{Category, InferenceSource, InferenceSources, ProcessedNewsletter};
use crate::store::migrations;
use crate::store::traits::NewsletterStore;

const NEWSLETTER_COLUMNS: &str = "source_message_id, subject, sender, cleaned_text, links, \
     key_links, summary_bullets, category, importance_score, summary_source, category_source, \
     score_source, processed_at";

pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests and dry runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Fetch one newsletter by its source message id.
    pub async fn get(&self, source_message_id: &str) -> Result<Option<ProcessedNewsletter>, DatabaseError> {
        let sql = format!("SELECT {NEWSLETTER_COLUMNS} FROM newsletters WHERE source_message_id = ?1");
        let mut rows = self
            .conn()
            .query(&sql, params![source_message_id])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_newsletter: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_newsletter: {e}")))?
        {
            Some(row) => Ok(Some(row_to_newsletter(&row)?)),
            None => Ok(None),
        }
    }

    /// Newsletters processed at or after `since`, highest score first.
    pub async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<ProcessedNewsletter>, DatabaseError> {
        let sql = format!(
            "SELECT {NEWSLETTER_COLUMNS} FROM newsletters WHERE processed_at >= ?1
             ORDER BY importance_score DESC, processed_at ASC"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![timestamp(&since)])
            .await
            .map_err(|e| DatabaseError::Query(format!("list_newsletters: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_newsletters: {e}")))?
        {
            out.push(row_to_newsletter(&row)?);
        }
        Ok(out)
    }

    pub async fn count(&self) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM newsletters", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_newsletters: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("count_newsletters: {e}")))?;
        match row {
            Some(row) => {
                let n: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count_newsletters: {e}")))?;
                Ok(n.max(0) as u64)
            }
            None => Ok(0),
        }
    }

    /// Most recently generated digest.
    pub async fn latest_digest(&self) -> Result<Option<Digest>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT title, markdown, stats, generated_at FROM digests
                 ORDER BY generated_at DESC LIMIT 1",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_digest: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_digest: {e}")))?
        else {
            return Ok(None);
        };

        let title = get_text(&row, 0, "title")?;
        let markdown = get_text(&row, 1, "markdown")?;
        let stats = get_text(&row, 2, "stats")?;
        let generated_at = get_text(&row, 3, "generated_at")?;
        let stats: DigestStats = serde_json::from_str(&stats)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        Ok(Some(Digest {
            title,
            generated_at: parse_datetime(&generated_at),
            markdown,
            stats,
        }))
    }
}

#[async_trait]
impl NewsletterStore for LibSqlStore {
    fn name(&self) -> &str {
        "libsql"
    }

    async fn write(&self, newsletter: &ProcessedNewsletter) -> Result<(), DatabaseError> {
        let links = to_json(&newsletter.links)?;
        let key_links = to_json(&newsletter.key_links)?;
        let bullets = to_json(&newsletter.summary_bullets)?;
        let now = timestamp(&Utc::now());

        self.conn()
            .execute(
                "INSERT INTO newsletters (source_message_id, subject, sender, cleaned_text, links,
                    key_links, summary_bullets, category, importance_score, summary_source,
                    category_source, score_source, processed_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT (source_message_id) DO UPDATE SET
                    subject = ?2, sender = ?3, cleaned_text = ?4, links = ?5, key_links = ?6,
                    summary_bullets = ?7, category = ?8, importance_score = ?9,
                    summary_source = ?10, category_source = ?11, score_source = ?12,
                    processed_at = ?13, updated_at = ?14",
                params![
                    newsletter.source_message_id.as_str(),
                    newsletter.subject.as_str(),
                    newsletter.sender.as_str(),
                    newsletter.cleaned_text.as_str(),
                    links,
                    key_links,
                    bullets,
                    newsletter.category.as_str(),
                    i64::from(newsletter.importance_score),
                    newsletter.sources.summary.as_str(),
                    newsletter.sources.category.as_str(),
                    newsletter.sources.score.as_str(),
                    timestamp(&newsletter.processed_at),
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("write_newsletter: {e}")))?;

        debug!(id = %newsletter.source_message_id, "Newsletter upserted");
        Ok(())
    }

    async fn write_digest(&self, digest: &Digest) -> Result<(), DatabaseError> {
        let stats = to_json(&digest.stats)?;
        self.conn()
            .execute(
                "INSERT INTO digests (id, title, markdown, stats, generated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    digest.title.as_str(),
                    digest.markdown.as_str(),
                    stats,
                    timestamp(&digest.generated_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("write_digest: {e}")))?;

        info!(title = %digest.title, total = digest.stats.total, "Digest stored");
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn get_text(row: &Row, idx: i32, name: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {name}: {e}")))
}

fn get_int(row: &Row, idx: i32, name: &str) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {name}: {e}")))
}

/// Fixed-width UTC timestamps so text comparison matches time order.
fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn str_to_source(s: &str) -> InferenceSource {
    match s {
        "fallback" => InferenceSource::Fallback,
        "degraded" => InferenceSource::Degraded,
        _ => InferenceSource::Primary,
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn row_to_newsletter(row: &Row) -> Result<ProcessedNewsletter, DatabaseError> {
    let links = get_text(row, 4, "links")?;
    let key_links = get_text(row, 5, "key_links")?;
    let bullets = get_text(row, 6, "summary_bullets")?;
    let category = get_text(row, 7, "category")?;
    let score = get_int(row, 8, "importance_score")?;
    let summary_source = get_text(row, 9, "summary_source")?;
    let category_source = get_text(row, 10, "category_source")?;
    let score_source = get_text(row, 11, "score_source")?;
    let processed_at = get_text(row, 12, "processed_at")?;

    let parse = |s: &str| -> Result<Vec<String>, DatabaseError> {
        serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(e.to_string()))
    };
    let summary_bullets: [String; 3] = serde_json::from_str(&bullets)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    Ok(ProcessedNewsletter {
        source_message_id: get_text(row, 0, "source_message_id")?,
        subject: get_text(row, 1, "subject")?,
        sender: get_text(row, 2, "sender")?,
        cleaned_text: get_text(row, 3, "cleaned_text")?,
        links: parse(&links)?,
        key_links: parse(&key_links)?,
        summary_bullets,
        category: Category::from_token(&category).unwrap_or_default(),
        importance_score: u8::try_from(score).unwrap_or(0),
        processed_at: parse_datetime(&processed_at),
        sources: InferenceSources {
            summary: str_to_source(&summary_source),
            category: str_to_source(&category_source),
            score: str_to_source(&score_source),
        },
    })
}
