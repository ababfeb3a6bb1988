//! Persistence layer: the `NewsletterStore` boundary and its backends.

pub mod libsql_store;
pub mod migrations;
pub mod notion;
pub mod traits;

pub use libsql_store::LibSqlStore;
pub use notion::NotionStore;
pub use traits::NewsletterStore;
