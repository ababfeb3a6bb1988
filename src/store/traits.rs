//! `NewsletterStore` trait: the persistence boundary of the pipeline.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::pipeline::digest::Digest;
use crate::pipeline::types::ProcessedNewsletter;

/// Backend-agnostic knowledge-base writer.
///
/// `write` must be idempotent on `source_message_id`: the pipeline is
/// at-least-once, so the same newsletter may arrive again after a crash
/// between persisting and marking read.
#[async_trait]
pub trait NewsletterStore: Send + Sync {
    /// Store name for logs (e.g. "notion", "libsql").
    fn name(&self) -> &str;

    /// Insert or update one newsletter.
    async fn write(&self, newsletter: &ProcessedNewsletter) -> Result<(), DatabaseError>;

    /// Persist a composed digest. Stores without a digest concept ignore it.
    async fn write_digest(&self, _digest: &Digest) -> Result<(), DatabaseError> {
        Ok(())
    }
}
