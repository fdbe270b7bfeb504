//! Source registry
//!
//! Process-wide catalogue of the sources managed by a server instance. Each
//! source owns one `PatchStore` under `{root}/{source_id}/` next to a
//! `source.json` descriptor. On startup the registry rehydrates by scanning
//! the root directory and re-opening every store, so head versions always
//! come from the log itself and never from a cached value that could drift.

use crate::error::{PatchLogError, Result};
use crate::store::PatchStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};

/// Lifecycle state of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceState {
    Active,
    /// Logically removed; records are retained for audit, appends refused
    Deleted,
}

/// Descriptor persisted as `source.json` in each source directory
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SourceMeta {
    source_id: String,
    state: SourceState,
    created_at: i64,
}

/// One registered source: its store plus the server-side coordination state
pub struct Source {
    id: String,
    dir: PathBuf,
    store: PatchStore,
    created_at: i64,
    state: RwLock<SourceState>,
    /// Admission critical section for appends, scoped to this source
    admission: Mutex<()>,
    /// Set after an integrity or storage failure; appends fail closed
    /// until the chain is verified clean again
    poisoned: AtomicBool,
}

impl Source {
    /// Source identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The underlying patch store
    pub fn store(&self) -> &PatchStore {
        &self.store
    }

    /// The per-source admission lock for appends
    pub fn admission(&self) -> &Mutex<()> {
        &self.admission
    }

    /// Current lifecycle state
    pub async fn state(&self) -> SourceState {
        *self.state.read().await
    }

    /// Whether appends are currently refused due to an integrity failure
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Mark the source as failed; subsequent appends are refused
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
        tracing::error!(source = %self.id, "source poisoned; appends refused until verified");
    }

    /// Clear the poison flag after a clean verification
    pub fn clear_poison(&self) {
        self.poisoned.store(false, Ordering::Release);
    }

    async fn mark_deleted(&self) -> Result<()> {
        let mut state = self.state.write().await;
        *state = SourceState::Deleted;
        let meta = SourceMeta {
            source_id: self.id.clone(),
            state: SourceState::Deleted,
            created_at: self.created_at,
        };
        save_meta(&self.dir, &meta)
    }
}

/// Registry of all sources under a server instance
pub struct SourceRegistry {
    root: PathBuf,
    /// Stable identity of this registry instance, persisted on first open
    registry_id: String,
    sources: RwLock<HashMap<String, Arc<Source>>>,
}

impl SourceRegistry {
    /// Open or create a registry rooted at the given directory, rehydrating
    /// every source found on disk. A source whose tail fails verification
    /// aborts the open; corrupt logs require operator intervention.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;

        let id_path = root.join("registry-id");
        let registry_id = if id_path.exists() {
            fs::read_to_string(&id_path)?.trim().to_string()
        } else {
            let id = uuid::Uuid::new_v4().to_string();
            fs::write(&id_path, &id)?;
            id
        };

        let mut sources = HashMap::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let meta_path = dir.join("source.json");
            if !meta_path.exists() {
                continue;
            }
            let data = fs::read_to_string(&meta_path)?;
            let meta: SourceMeta = serde_json::from_str(&data)
                .map_err(|e| PatchLogError::Storage(format!("bad source.json in {:?}: {}", dir, e)))?;

            let store = PatchStore::open(&dir)?;
            tracing::info!(
                source = %meta.source_id,
                head = store.head_version(),
                state = ?meta.state,
                "rehydrated source"
            );
            sources.insert(
                meta.source_id.clone(),
                Arc::new(Source {
                    id: meta.source_id,
                    dir,
                    store,
                    created_at: meta.created_at,
                    state: RwLock::new(meta.state),
                    admission: Mutex::new(()),
                    poisoned: AtomicBool::new(false),
                }),
            );
        }

        Ok(Self {
            root: root.to_path_buf(),
            registry_id,
            sources: RwLock::new(sources),
        })
    }

    /// Stable identity of this registry instance
    pub fn registry_id(&self) -> &str {
        &self.registry_id
    }

    /// Create a new source with an empty log at version 0.
    ///
    /// Identifiers are case-sensitive; a deleted source still occupies its
    /// identifier because its records are retained.
    pub async fn create_source(&self, source_id: &str) -> Result<Arc<Source>> {
        validate_source_id(source_id)?;

        let mut sources = self.sources.write().await;
        if sources.contains_key(source_id) {
            return Err(PatchLogError::DuplicateSource(source_id.to_string()));
        }

        let dir = self.root.join(source_id);
        fs::create_dir_all(&dir)?;
        let meta = SourceMeta {
            source_id: source_id.to_string(),
            state: SourceState::Active,
            created_at: chrono::Utc::now().timestamp(),
        };
        save_meta(&dir, &meta)?;
        let store = PatchStore::open(&dir)?;

        let source = Arc::new(Source {
            id: source_id.to_string(),
            dir,
            store,
            created_at: meta.created_at,
            state: RwLock::new(SourceState::Active),
            admission: Mutex::new(()),
            poisoned: AtomicBool::new(false),
        });
        sources.insert(source_id.to_string(), source.clone());
        tracing::info!(source = source_id, "created source");
        Ok(source)
    }

    /// Look up an active source; deleted or absent sources are unknown
    pub async fn get_source(&self, source_id: &str) -> Result<Arc<Source>> {
        let sources = self.sources.read().await;
        let source = sources
            .get(source_id)
            .ok_or_else(|| PatchLogError::UnknownSource(source_id.to_string()))?;
        match source.state().await {
            SourceState::Active => Ok(source.clone()),
            SourceState::Deleted => Err(PatchLogError::UnknownSource(source_id.to_string())),
        }
    }

    /// Look up a source regardless of state (used for audit reads)
    pub async fn get_source_any(&self, source_id: &str) -> Result<Arc<Source>> {
        let sources = self.sources.read().await;
        sources
            .get(source_id)
            .cloned()
            .ok_or_else(|| PatchLogError::UnknownSource(source_id.to_string()))
    }

    /// Identifiers of all active sources
    pub async fn list_sources(&self) -> Vec<String> {
        let sources = self.sources.read().await;
        let mut ids = Vec::new();
        for source in sources.values() {
            if source.state().await == SourceState::Active {
                ids.push(source.id.clone());
            }
        }
        ids.sort();
        ids
    }

    /// Mark a source deleted. Idempotent: deleting an already-deleted source
    /// succeeds. Records are retained on disk; appends fail from now on.
    pub async fn delete_source(&self, source_id: &str) -> Result<()> {
        let sources = self.sources.read().await;
        let source = sources
            .get(source_id)
            .ok_or_else(|| PatchLogError::UnknownSource(source_id.to_string()))?;
        if source.state().await == SourceState::Deleted {
            return Ok(());
        }
        source.mark_deleted().await?;
        tracing::info!(source = source_id, "deleted source (records retained)");
        Ok(())
    }
}

fn save_meta(dir: &Path, meta: &SourceMeta) -> Result<()> {
    let path = dir.join("source.json");
    let tmp_path = path.with_extension("tmp");
    let data = serde_json::to_string_pretty(meta)
        .map_err(|e| PatchLogError::Encoding(e.to_string()))?;
    fs::write(&tmp_path, &data)?;
    fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// Source identifiers become directory names, so they must be plain
fn validate_source_id(source_id: &str) -> Result<()> {
    let ok = !source_id.is_empty()
        && source_id.len() <= 128
        && source_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && source_id != "."
        && source_id != ".."
        && !source_id.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(PatchLogError::Storage(format!(
            "invalid source id: {:?}",
            source_id
        )))
    }
}
