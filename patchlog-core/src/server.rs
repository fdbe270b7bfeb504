//! Patch log server
//!
//! Orchestrates append and range-fetch operations against the registry. The
//! correctness-critical piece is the append admission gate: a per-source
//! critical section held only across the read-compare-write, so that exactly
//! one caller is assigned any given version while unrelated sources progress
//! in parallel.

use crate::error::{PatchLogError, Result};
use crate::record::{PatchId, PatchRecord};
use crate::registry::{Source, SourceRegistry, SourceState};
use std::path::Path;
use std::sync::Arc;

/// Description of one source's log as seen by clients
#[derive(Debug, Clone)]
pub struct SourceDescription {
    pub source_id: String,
    pub head_version: u64,
    pub state: SourceState,
    /// Hash of the record at head (`PatchId::ZERO` when empty)
    pub latest_hash: PatchId,
}

/// Server-side entry point for all log operations
pub struct PatchLogServer {
    registry: Arc<SourceRegistry>,
}

impl PatchLogServer {
    /// Open a server over a registry rooted at the given directory
    pub fn open(root: &Path) -> Result<Self> {
        let registry = Arc::new(SourceRegistry::open(root)?);
        Ok(Self { registry })
    }

    /// Build a server over an already-open registry
    pub fn new(registry: Arc<SourceRegistry>) -> Self {
        Self { registry }
    }

    /// The underlying registry
    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    /// Create a new, empty source
    pub async fn create_source(&self, source_id: &str) -> Result<SourceDescription> {
        let source = self.registry.create_source(source_id).await?;
        Ok(describe(&source).await)
    }

    /// Mark a source deleted (idempotent; records retained)
    pub async fn delete_source(&self, source_id: &str) -> Result<()> {
        self.registry.delete_source(source_id).await
    }

    /// Identifiers of all active sources
    pub async fn list_sources(&self) -> Vec<String> {
        self.registry.list_sources().await
    }

    /// Describe one source (head, state, latest chain hash)
    pub async fn describe_source(&self, source_id: &str) -> Result<SourceDescription> {
        let source = self.registry.get_source_any(source_id).await?;
        Ok(describe(&source).await)
    }

    /// Append a payload on top of `base_version`.
    ///
    /// Guarantees at-most-one accepted append per version: the check of
    /// `base_version` against the current head and the durable write happen
    /// inside an exclusive per-source admission section. A stale base fails
    /// immediately with `VersionConflict` carrying the actual head so the
    /// caller can rebase and retry.
    pub async fn append(
        &self,
        source_id: &str,
        base_version: u64,
        payload: Vec<u8>,
    ) -> Result<u64> {
        let source = self.registry.get_source_any(source_id).await?;
        if source.state().await == SourceState::Deleted {
            return Err(PatchLogError::SourceDeleted(source_id.to_string()));
        }
        if source.is_poisoned() {
            return Err(PatchLogError::ChainCorruption {
                version: source.store().head_version(),
            });
        }

        // Admission section: held across read-compare-write only, never
        // across any exchange with the caller.
        let _admission = source.admission().lock().await;

        let head = source.store().head_version();
        if base_version != head {
            return Err(PatchLogError::VersionConflict { current_head: head });
        }

        let record = PatchRecord::new(
            head + 1,
            source.store().tail_hash(),
            payload,
            chrono::Utc::now().timestamp(),
        );

        match source.store().append(head, &record) {
            Ok(version) => {
                tracing::info!(source = source_id, version, "accepted patch");
                Ok(version)
            }
            Err(e @ PatchLogError::VersionConflict { .. }) => Err(e),
            Err(e) => {
                // Integrity or storage failure inside the admission section:
                // fail closed until an operator verifies the chain.
                source.poison();
                Err(e)
            }
        }
    }

    /// Read records `[from, to]`; `to = None` means up to the current head.
    /// Reads run concurrently with appends and with each other; deleted
    /// sources remain readable for audit.
    pub async fn fetch_range(
        &self,
        source_id: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<PatchRecord>> {
        let source = self.registry.get_source_any(source_id).await?;
        source.store().read_range(from, to)
    }

    /// Current head version of a source; cheap enough to poll
    pub async fn head_version(&self, source_id: &str) -> Result<u64> {
        let source = self.registry.get_source_any(source_id).await?;
        Ok(source.store().head_version())
    }

    /// Replay a source's full chain; a clean result clears the poison flag
    pub async fn verify_source(&self, source_id: &str) -> Result<()> {
        let source = self.registry.get_source_any(source_id).await?;
        match source.store().verify_chain() {
            Ok(()) => {
                source.clear_poison();
                Ok(())
            }
            Err(e) => {
                source.poison();
                Err(e)
            }
        }
    }
}

async fn describe(source: &Arc<Source>) -> SourceDescription {
    SourceDescription {
        source_id: source.id().to_string(),
        head_version: source.store().head_version(),
        state: source.state().await,
        latest_hash: source.store().tail_hash(),
    }
}
