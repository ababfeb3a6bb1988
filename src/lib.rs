//! Newsletter Digest: unread mail in, summarized and scored knowledge-base
//! entries out.

pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod scheduler;
pub mod store;
