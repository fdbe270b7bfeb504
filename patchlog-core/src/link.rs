//! Transport seam between replicas and the patch log server
//!
//! `PatchLogLink` is the logical operation surface a replica speaks; the
//! in-process implementation wraps a `PatchLogServer` directly, and remote
//! implementations carry the same operations over a transport.

use crate::error::Result;
use crate::record::PatchRecord;
use crate::server::{PatchLogServer, SourceDescription};
use async_trait::async_trait;
use std::sync::Arc;

/// Logical operations a replica performs against a patch log server
#[async_trait]
pub trait PatchLogLink: Send + Sync {
    /// Create a new, empty source
    async fn create_source(&self, source_id: &str) -> Result<SourceDescription>;

    /// Append a payload on top of `base_version`, returning the accepted version
    async fn append(&self, source_id: &str, base_version: u64, payload: Vec<u8>) -> Result<u64>;

    /// Fetch records `[from, to]` in ascending order; `None` means to head
    async fn fetch_range(
        &self,
        source_id: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<PatchRecord>>;

    /// Current head version of a source
    async fn head_version(&self, source_id: &str) -> Result<u64>;

    /// Describe a source (head, state, latest chain hash)
    async fn describe_source(&self, source_id: &str) -> Result<SourceDescription>;
}

/// In-process link: replica and server share one address space
pub struct LocalLink {
    server: Arc<PatchLogServer>,
}

impl LocalLink {
    pub fn new(server: Arc<PatchLogServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl PatchLogLink for LocalLink {
    async fn create_source(&self, source_id: &str) -> Result<SourceDescription> {
        self.server.create_source(source_id).await
    }

    async fn append(&self, source_id: &str, base_version: u64, payload: Vec<u8>) -> Result<u64> {
        self.server.append(source_id, base_version, payload).await
    }

    async fn fetch_range(
        &self,
        source_id: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<PatchRecord>> {
        self.server.fetch_range(source_id, from, to).await
    }

    async fn head_version(&self, source_id: &str) -> Result<u64> {
        self.server.head_version(source_id).await
    }

    async fn describe_source(&self, source_id: &str) -> Result<SourceDescription> {
        self.server.describe_source(source_id).await
    }
}
