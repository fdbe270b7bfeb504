//! Local mirror of one source's patch log.
//!
//! A mirror directory holds a full copy of the log (same on-disk layout as
//! the server side) plus `sync-state.json` recording where the mirror stands
//! relative to its server. The log copy itself is the replica watermark:
//! state is rebuilt from the store on open, never trusted from the JSON
//! alone.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use patchlog_core::{
    PatchLogError, PatchLogLink, PatchRecord, PatchSink, PatchStore, ReplicaClient,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const STATE_FILE: &str = "sync-state.json";
const LOG_DIR: &str = "log";

/// Mirror metadata persisted at `mirror/sync-state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorState {
    /// Base URL of the server this mirror pulls from.
    pub server_url: String,
    /// Registry identity of the server, pinned at init.
    pub registry_id: String,
    /// The mirrored source.
    pub source_id: String,
    /// Server head as of the last pull.
    pub remote_head: u64,
    /// Timestamp of the last successful pull (Unix seconds).
    pub last_sync_timestamp: i64,
    /// Records pulled over the lifetime of the mirror.
    pub total_pulled: u64,
    /// Protocol version the server advertised.
    pub protocol_version: u32,
}

impl MirrorState {
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path)
            .with_context(|| format!("failed to read sync state from {:?}", path))?;
        let state = serde_json::from_str(&data).context("failed to parse sync state JSON")?;
        Ok(Some(state))
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(STATE_FILE);
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Refuse to pull from a server other than the one pinned at init.
    pub fn verify_registry(&self, registry_id: &str) -> Result<()> {
        if self.registry_id != registry_id {
            return Err(anyhow!(
                "server identity mismatch: mirror pinned to {}, server reports {}",
                self.registry_id,
                registry_id
            ));
        }
        Ok(())
    }
}

/// Sink that lands fetched records in the mirror's own patch store.
struct StoreSink {
    store: Arc<PatchStore>,
}

#[async_trait]
impl PatchSink for StoreSink {
    async fn apply(&self, record: &PatchRecord) -> patchlog_core::Result<()> {
        self.store.append(record.version - 1, record)?;
        Ok(())
    }
}

/// A mirror directory: local log copy plus sync state.
pub struct Mirror {
    dir: PathBuf,
    store: Arc<PatchStore>,
    state: MirrorState,
}

impl Mirror {
    /// Create a new mirror directory pinned to one server and source.
    pub fn init(
        dir: &Path,
        server_url: &str,
        registry_id: &str,
        protocol_version: u32,
        source_id: &str,
    ) -> Result<Self> {
        if MirrorState::load(dir)?.is_some() {
            return Err(anyhow!(
                "directory {:?} is already a mirror; remove it first",
                dir
            ));
        }
        fs::create_dir_all(dir)?;
        let store = Arc::new(PatchStore::open(&dir.join(LOG_DIR))?);
        let state = MirrorState {
            server_url: server_url.trim_end_matches('/').to_string(),
            registry_id: registry_id.to_string(),
            source_id: source_id.to_string(),
            remote_head: 0,
            last_sync_timestamp: 0,
            total_pulled: 0,
            protocol_version,
        };
        state.save(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            store,
            state,
        })
    }

    /// Open an existing mirror, recovering and verifying the local log tail.
    pub fn open(dir: &Path) -> Result<Self> {
        let state = MirrorState::load(dir)?
            .ok_or_else(|| anyhow!("{:?} is not a mirror (no {})", dir, STATE_FILE))?;
        let store = Arc::new(PatchStore::open(&dir.join(LOG_DIR))?);
        Ok(Self {
            dir: dir.to_path_buf(),
            store,
            state,
        })
    }

    pub fn state(&self) -> &MirrorState {
        &self.state
    }

    /// Highest version held locally.
    pub fn local_version(&self) -> u64 {
        self.store.head_version()
    }

    fn replica(&self, link: Arc<dyn PatchLogLink>) -> ReplicaClient {
        let sink = Arc::new(StoreSink {
            store: self.store.clone(),
        });
        ReplicaClient::with_watermark(
            link,
            sink,
            &self.state.source_id,
            self.store.head_version(),
            self.store.tail_hash(),
        )
    }

    /// Pull everything past the local log into the mirror.
    pub async fn pull(&mut self, link: Arc<dyn PatchLogLink>) -> Result<usize> {
        let pulled = self.replica(link).sync().await?;
        if pulled > 0 {
            self.state.total_pulled += pulled as u64;
        }
        self.state.remote_head = self.store.head_version();
        self.state.last_sync_timestamp = chrono::Utc::now().timestamp();
        self.state.save(&self.dir)?;
        Ok(pulled)
    }

    /// Submit a locally created patch on top of this mirror's log.
    ///
    /// Pulls first so the submission bases on the freshest head, then retries
    /// through version conflicts up to `max_attempts`. The accepted record is
    /// pulled back into the mirror before returning, so the local log always
    /// contains what the server acknowledged.
    pub async fn submit(
        &mut self,
        link: Arc<dyn PatchLogLink>,
        payload: Vec<u8>,
        max_attempts: u32,
    ) -> Result<u64> {
        let max_attempts = max_attempts.max(1);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            self.pull(link.clone()).await?;
            let base = self.store.head_version();

            match link
                .append(&self.state.source_id, base, payload.clone())
                .await
            {
                Ok(version) => {
                    self.pull(link).await?;
                    return Ok(version);
                }
                Err(PatchLogError::VersionConflict { current_head }) => {
                    if attempts >= max_attempts {
                        return Err(PatchLogError::SubmissionExhausted { attempts }.into());
                    }
                    tracing::debug!(
                        source = %self.state.source_id,
                        base,
                        current_head,
                        attempts,
                        "submission conflicted; rebasing mirror"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Replay the local log and verify every record and link.
    pub fn verify(&self) -> Result<()> {
        self.store.verify_chain()?;
        Ok(())
    }

    /// Read records from the local log without touching the server.
    pub fn read_range(&self, from: u64, to: Option<u64>) -> Result<Vec<PatchRecord>> {
        Ok(self.store.read_range(from, to)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchlog_core::{DEFAULT_MAX_SUBMIT_ATTEMPTS, LocalLink, PatchLogServer};
    use tempfile::TempDir;

    async fn setup(source: &str) -> (TempDir, Arc<PatchLogServer>, Arc<LocalLink>) {
        let tmp = TempDir::new().unwrap();
        let server = Arc::new(PatchLogServer::open(&tmp.path().join("server")).unwrap());
        server.create_source(source).await.unwrap();
        let link = Arc::new(LocalLink::new(server.clone()));
        (tmp, server, link)
    }

    fn init_mirror(tmp: &TempDir, source: &str) -> Mirror {
        Mirror::init(&tmp.path().join("mirror"), "http://test", "registry-a", 1, source).unwrap()
    }

    #[tokio::test]
    async fn test_pull_copies_the_log() {
        let (tmp, server, link) = setup("s").await;
        server.append("s", 0, b"p1".to_vec()).await.unwrap();
        server.append("s", 1, b"p2".to_vec()).await.unwrap();

        let mut mirror = init_mirror(&tmp, "s");
        assert_eq!(mirror.pull(link.clone()).await.unwrap(), 2);
        assert_eq!(mirror.local_version(), 2);
        mirror.verify().unwrap();

        let records = mirror.read_range(1, None).unwrap();
        assert_eq!(records[0].payload, b"p1");
        assert_eq!(records[1].payload, b"p2");

        // Nothing new: pull is a no-op
        assert_eq!(mirror.pull(link).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reopen_resumes_from_local_log() {
        let (tmp, server, link) = setup("s").await;
        server.append("s", 0, b"p1".to_vec()).await.unwrap();

        let mirror_dir = tmp.path().join("mirror");
        {
            let mut mirror =
                Mirror::init(&mirror_dir, "http://test", "registry-a", 1, "s").unwrap();
            mirror.pull(link.clone()).await.unwrap();
        }

        server.append("s", 1, b"p2".to_vec()).await.unwrap();

        let mut mirror = Mirror::open(&mirror_dir).unwrap();
        assert_eq!(mirror.local_version(), 1);
        assert_eq!(mirror.pull(link).await.unwrap(), 1);
        assert_eq!(mirror.local_version(), 2);
        assert_eq!(mirror.state().total_pulled, 2);
    }

    #[tokio::test]
    async fn test_submit_rebases_over_other_writers() {
        let (tmp, server, link) = setup("s").await;
        let mut mirror = init_mirror(&tmp, "s");
        mirror.pull(link.clone()).await.unwrap();

        // Another writer lands while the mirror is stale
        server.append("s", 0, b"other".to_vec()).await.unwrap();

        let version = mirror
            .submit(link, b"ours".to_vec(), DEFAULT_MAX_SUBMIT_ATTEMPTS)
            .await
            .unwrap();
        assert_eq!(version, 2);
        // The mirror log contains both records afterwards
        assert_eq!(mirror.local_version(), 2);
        let records = mirror.read_range(1, None).unwrap();
        assert_eq!(records[0].payload, b"other");
        assert_eq!(records[1].payload, b"ours");
        mirror.verify().unwrap();
    }

    #[tokio::test]
    async fn test_init_refuses_existing_mirror() {
        let (tmp, _server, _link) = setup("s").await;
        init_mirror(&tmp, "s");
        assert!(
            Mirror::init(&tmp.path().join("mirror"), "http://test", "registry-a", 1, "s").is_err()
        );
    }

    #[test]
    fn test_registry_pinning() {
        let state = MirrorState {
            server_url: "http://test".into(),
            registry_id: "registry-a".into(),
            source_id: "s".into(),
            remote_head: 0,
            last_sync_timestamp: 0,
            total_pulled: 0,
            protocol_version: 1,
        };
        assert!(state.verify_registry("registry-a").is_ok());
        assert!(state.verify_registry("registry-b").is_err());
    }
}
