//! Notion knowledge-base store over the Notion REST API.
//!
//! One database page per newsletter. `write` looks the page up by its
//! `Message ID` property and patches it when found, so re-delivered
//! messages update in place instead of duplicating.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use rust_decimal::prelude::ToPrimitive;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::pipeline::digest::Digest;
use crate::pipeline::types::{Category, ProcessedNewsletter};
use crate::store::traits::NewsletterStore;

pub const NOTION_API_BASE: &str = "https://api.notion.com/v1";
const NOTION_VERSION: &str = "2022-06-28";

/// Notion rejects rich-text objects longer than this.
const RICH_TEXT_LIMIT: usize = 2000;

/// Notion accepts at most this many children per request.
const MAX_CHILDREN: usize = 100;

const STORE_NAME: &str = "notion";

pub struct NotionStore {
    base_url: String,
    database_id: String,
    token: SecretString,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    results: Vec<PageRef>,
}

#[derive(Debug, Deserialize)]
struct PageRef {
    id: String,
}

impl NotionStore {
    pub fn new(token: SecretString, database_id: impl Into<String>, timeout: Duration) -> Self {
        Self::with_base_url(NOTION_API_BASE, token, database_id, timeout)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        token: SecretString,
        database_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            database_id: database_id.into(),
            token,
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    async fn send(&self, method: Method, path: &str, body: &Value) -> Result<Value, DatabaseError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .request(method, &url)
            .bearer_auth(self.token.expose_secret())
            .header("Notion-Version", NOTION_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| remote_error(format!("{path}: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| remote_error(format!("{path}: reading body: {e}")))?;
        if !status.is_success() {
            let snippet: String = text.chars().take(300).collect();
            return Err(remote_error(format!("{path}: HTTP {status}: {snippet}")));
        }
        serde_json::from_str(&text).map_err(|e| DatabaseError::Serialization(e.to_string()))
    }

    /// Page id of an existing entry for this message, if any.
    async fn find_page(&self, message_id: &str) -> Result<Option<String>, DatabaseError> {
        let body = json!({
            "filter": {
                "property": "Message ID",
                "rich_text": { "equals": message_id }
            },
            "page_size": 1
        });
        let value = self
            .send(
                Method::POST,
                &format!("/databases/{}/query", self.database_id),
                &body,
            )
            .await?;
        let parsed: QueryResponse =
            serde_json::from_value(value).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        Ok(parsed.results.into_iter().next().map(|p| p.id))
    }

    /// Check the token and database id by fetching the database.
    pub async fn test_connection(&self) -> Result<(), DatabaseError> {
        let url = format!("{}/databases/{}", self.base_url, self.database_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.token.expose_secret())
            .header("Notion-Version", NOTION_VERSION)
            .send()
            .await
            .map_err(|e| remote_error(e.to_string()))?;
        if response.status().is_success() {
            info!(database = %self.database_id, "Connected to Notion");
            Ok(())
        } else {
            Err(remote_error(format!("database lookup: HTTP {}", response.status())))
        }
    }
}

#[async_trait]
impl NewsletterStore for NotionStore {
    fn name(&self) -> &str {
        STORE_NAME
    }

    async fn write(&self, newsletter: &ProcessedNewsletter) -> Result<(), DatabaseError> {
        let properties = newsletter_properties(newsletter);

        match self.find_page(&newsletter.source_message_id).await? {
            Some(page_id) => {
                self.send(
                    Method::PATCH,
                    &format!("/pages/{page_id}"),
                    &json!({ "properties": properties }),
                )
                .await?;
                debug!(id = %newsletter.source_message_id, page = %page_id, "Updated Notion page");
            }
            None => {
                let body = json!({
                    "parent": { "database_id": self.database_id },
                    "properties": properties,
                    "children": newsletter_blocks(newsletter),
                });
                self.send(Method::POST, "/pages", &body).await?;
                debug!(id = %newsletter.source_message_id, "Created Notion page");
            }
        }
        Ok(())
    }

    async fn write_digest(&self, digest: &Digest) -> Result<(), DatabaseError> {
        let summary = format!(
            "Total: {} | High: {} | Medium: {} | Low: {}",
            digest.stats.total, digest.stats.high, digest.stats.medium, digest.stats.low
        );
        let importance = digest
            .stats
            .average_score
            .round()
            .to_u8()
            .unwrap_or(3)
            .clamp(1, 5);
        let properties = json!({
            "Title": rich_text(&digest.title),
            "Summary": rich_text(&summary),
            "Importance": { "number": importance },
            "Category": { "select": { "name": Category::News.as_str() } },
            "Date": { "date": { "start": digest.generated_at.to_rfc3339() } },
        });

        let body = json!({
            "parent": { "database_id": self.database_id },
            "properties": properties,
            "children": paragraph_blocks(&digest.markdown),
        });

        if let Err(e) = self.send(Method::POST, "/pages", &body).await {
            warn!(error = %e, "Digest page with content rejected, retrying without content");
            let simple = json!({
                "parent": { "database_id": self.database_id },
                "properties": body["properties"].clone(),
            });
            self.send(Method::POST, "/pages", &simple).await?;
        }
        info!(title = %digest.title, "Created Notion digest page");
        Ok(())
    }
}

fn remote_error(reason: String) -> DatabaseError {
    DatabaseError::Remote {
        store: STORE_NAME.into(),
        reason,
    }
}

/// Split text into chunks of at most `RICH_TEXT_LIMIT` chars.
fn chunk_chars(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(RICH_TEXT_LIMIT)
        .map(|c| c.iter().collect())
        .collect()
}

fn rich_text(text: &str) -> Value {
    let parts: Vec<Value> = chunk_chars(text)
        .into_iter()
        .map(|content| json!({ "type": "text", "text": { "content": content } }))
        .collect();
    json!({ "rich_text": parts })
}

fn paragraph(text: &str) -> Value {
    json!({
        "object": "block",
        "type": "paragraph",
        "paragraph": {
            "rich_text": [{ "type": "text", "text": { "content": text } }]
        }
    })
}

/// One paragraph block per non-empty line, long lines split at the limit.
fn paragraph_blocks(text: &str) -> Vec<Value> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .flat_map(chunk_chars)
        .take(MAX_CHILDREN)
        .map(|chunk| paragraph(&chunk))
        .collect()
}

fn bullets(newsletter: &ProcessedNewsletter) -> String {
    newsletter
        .summary_bullets
        .iter()
        .filter(|b| !b.trim().is_empty())
        .map(|b| format!("• {b}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn primary_link(newsletter: &ProcessedNewsletter) -> Option<&str> {
    newsletter
        .key_links
        .first()
        .or_else(|| newsletter.links.first())
        .map(String::as_str)
}

fn newsletter_properties(newsletter: &ProcessedNewsletter) -> Value {
    let mut properties = json!({
        "Title": rich_text(&newsletter.subject),
        "Message ID": rich_text(&newsletter.source_message_id),
        "Summary": rich_text(&bullets(newsletter)),
        "Importance": { "number": newsletter.importance_score },
        "Category": { "select": { "name": newsletter.category.as_str() } },
        "Date": { "date": { "start": newsletter.processed_at.to_rfc3339() } },
    });
    if let Some(link) = primary_link(newsletter) {
        properties["Link"] = json!({ "url": link });
    }
    properties
}

fn newsletter_blocks(newsletter: &ProcessedNewsletter) -> Vec<Value> {
    let mut text = format!("From: {}\n{}", newsletter.sender, bullets(newsletter));
    let links = if newsletter.key_links.is_empty() {
        &newsletter.links
    } else {
        &newsletter.key_links
    };
    for link in links {
        text.push_str(&format!("\nLink: {link}"));
    }
    paragraph_blocks(&text)
}
