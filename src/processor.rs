//! Crawl driver seam
//!
//! Fetching an entity and deciding which edges to enqueue next belong to
//! the traversal layer, not to flow control. The worker loop only needs
//! to know how the unit of work ended.

use crate::error::Result;
use crate::request::{Disposition, Request};

/// Executes one unit of crawl work with a borrowed credential
#[async_trait::async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, request: &Request, token: &str) -> Result<Disposition>;
}

/// Processor that completes everything without touching the network.
/// Used by tests and dry runs.
pub struct NullProcessor;

#[async_trait::async_trait]
impl Processor for NullProcessor {
    async fn process(&self, request: &Request, _token: &str) -> Result<Disposition> {
        tracing::debug!(key = %request.identity(), "processed (null)");
        Ok(Disposition::Completed)
    }
}
