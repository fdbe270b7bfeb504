//! Patchlog Core Library
//!
//! Core functionality for Patchlog including:
//! - Patch record model (hash-chained, append-only)
//! - Durable per-source patch storage with tail recovery
//! - Source registry (lifecycle, lookup, rehydration)
//! - Patch log server with per-source append admission
//! - Replica synchronization client (poll, fetch, apply, rebase)
//! - Wire protocol types and range framing

pub mod error;
pub mod link;
pub mod protocol;
pub mod record;
pub mod registry;
pub mod replica;
pub mod server;
pub mod store;

pub use error::{PatchLogError, Result};
pub use link::{LocalLink, PatchLogLink};
pub use record::{PatchId, PatchRecord};
pub use registry::{Source, SourceRegistry, SourceState};
pub use replica::{
    DEFAULT_MAX_SUBMIT_ATTEMPTS, PatchSink, PendingResolution, ReplicaClient, SubmissionPhase,
};
pub use server::{PatchLogServer, SourceDescription};
pub use store::PatchStore;
