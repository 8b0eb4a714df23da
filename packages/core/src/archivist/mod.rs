//! Archivist: drains the events stream into a search index.

pub mod consumer;
pub mod opensearch;

pub use consumer::{Consumer, ConsumerPool, ConsumerPoolConfig, StreamAcker};
pub use opensearch::OpenSearchArchivist;
