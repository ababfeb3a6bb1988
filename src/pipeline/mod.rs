//! Newsletter processing pipeline.
//!
//! Every unread message flows through:
//! 1. `RelevanceFilter::classify()`: deterministic newsletter detection (no LLM)
//! 2. `ContentNormalizer::clean()`: boilerplate-free text plus links
//! 3. `InferenceGateway`: summarize, classify, score with provider fallback
//! 4. `NewsletterStore::write()`, then `Mailbox::mark_processed()`
//!
//! `DigestComposer` turns a batch of persisted newsletters into a ranked
//! markdown digest.

pub mod digest;
pub mod gateway;
pub mod normalizer;
pub mod parsing;
pub mod processor;
pub mod prompts;
pub mod rules;
pub mod types;

pub use digest::{Digest, DigestComposer, DigestStats};
pub use gateway::{InferenceGateway, InferenceInput};
pub use normalizer::{ContentNormalizer, NormalizerConfig};
pub use processor::{DegradedPolicy, NewsletterProcessor, ProcessorConfig};
pub use prompts::PromptSet;
pub use rules::{FilterConfig, RelevanceFilter};
pub use types::*;
