//! Wire protocol for the HTTP transport
//!
//! JSON DTOs for the control surface plus a compact binary framing for patch
//! range transfers: zstd-compressed bincode behind a magic/flags header, with
//! a hard size cap.

use crate::error::{PatchLogError, Result};
use crate::record::PatchRecord;
use crate::registry::SourceState;
use crate::server::SourceDescription;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Protocol version constant.
pub const PROTOCOL_VERSION: u32 = 1;

/// Magic bytes for the patch range framing.
pub const PROTOCOL_MAGIC: &[u8; 4] = b"PLOG";

/// Maximum single frame size (256 MB).
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Identity and catalogue of a server, for `GET /info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Registry instance identity.
    pub registry_id: String,
    /// Protocol version for the sync API.
    pub protocol_version: u32,
    /// Identifiers of all active sources.
    pub sources: Vec<String>,
}

/// One source's log as described to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceInfo {
    pub source_id: String,
    pub head_version: u64,
    /// "active" or "deleted".
    pub state: String,
    /// Hex hash of the record at head (all zeros when empty).
    pub latest_hash: String,
}

impl From<SourceDescription> for SourceInfo {
    fn from(d: SourceDescription) -> Self {
        Self {
            source_id: d.source_id,
            head_version: d.head_version,
            state: match d.state {
                SourceState::Active => "active".to_string(),
                SourceState::Deleted => "deleted".to_string(),
            },
            latest_hash: d.latest_hash.to_hex(),
        }
    }
}

impl TryFrom<SourceInfo> for SourceDescription {
    type Error = PatchLogError;

    fn try_from(info: SourceInfo) -> Result<Self> {
        let state = match info.state.as_str() {
            "active" => SourceState::Active,
            "deleted" => SourceState::Deleted,
            other => {
                return Err(PatchLogError::Encoding(format!(
                    "unknown source state: {}",
                    other
                )));
            }
        };
        let latest_hash = crate::record::PatchId::from_hex(&info.latest_hash)
            .map_err(|e| PatchLogError::Encoding(format!("bad latest_hash: {}", e)))?;
        Ok(Self {
            source_id: info.source_id,
            head_version: info.head_version,
            state,
            latest_hash,
        })
    }
}

/// Body of `POST /sources`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSourceRequest {
    pub source_id: String,
}

/// Response to an accepted append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResponse {
    pub version: u64,
}

/// Response to `GET /{id}/head`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadResponse {
    pub head_version: u64,
}

/// Error payload carried on every failure response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable kind, e.g. "version-conflict".
    pub kind: String,
    pub message: String,
    /// Actual head version, present for version conflicts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_head: Option<u64>,
}

impl ErrorBody {
    /// Map an engine error to its wire form.
    pub fn from_error(e: &PatchLogError) -> Self {
        let kind = match e {
            PatchLogError::VersionConflict { .. } => "version-conflict",
            PatchLogError::UnknownSource(_) => "unknown-source",
            PatchLogError::DuplicateSource(_) => "duplicate-source",
            PatchLogError::SourceDeleted(_) => "source-deleted",
            PatchLogError::ChainCorruption { .. } => "chain-corruption",
            PatchLogError::RangeNotFound { .. } => "range-not-found",
            PatchLogError::SubmissionInProgress => "submission-in-progress",
            PatchLogError::SubmissionExhausted { .. } => "submission-exhausted",
            PatchLogError::Io(_) | PatchLogError::Storage(_) => "storage-failure",
            PatchLogError::Encoding(_) => "encoding-failure",
            PatchLogError::Transport(_) => "transport-failure",
        };
        Self {
            kind: kind.to_string(),
            message: e.to_string(),
            current_head: e.conflict_head(),
        }
    }

    /// Reconstruct an engine error on the client side.
    pub fn into_error(self) -> PatchLogError {
        match (self.kind.as_str(), self.current_head) {
            ("version-conflict", Some(current_head)) => {
                PatchLogError::VersionConflict { current_head }
            }
            ("unknown-source", _) => PatchLogError::UnknownSource(self.message),
            ("duplicate-source", _) => PatchLogError::DuplicateSource(self.message),
            ("source-deleted", _) => PatchLogError::SourceDeleted(self.message),
            ("chain-corruption", _) => PatchLogError::ChainCorruption { version: 0 },
            ("range-not-found", _) => PatchLogError::RangeNotFound { from: 0, head: 0 },
            _ => PatchLogError::Transport(self.message),
        }
    }
}

/// Encode a patch range as a binary frame.
///
/// Layout: `[magic(4)] [flags(1)] [uncompressed_len(4)] [compressed_len(4)] [data]`
/// with flag 0x01 marking zstd compression.
pub fn encode_range(records: &[PatchRecord]) -> Result<Vec<u8>> {
    let payload = bincode::serialize(records)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(PatchLogError::Encoding(format!(
            "frame too large: {} bytes (max {})",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }
    let compressed = zstd::encode_all(&payload[..], 3)
        .map_err(|e| PatchLogError::Encoding(format!("compression failed: {}", e)))?;
    let mut buf = Vec::with_capacity(13 + compressed.len());
    buf.extend_from_slice(PROTOCOL_MAGIC);
    buf.push(0x01);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    buf.extend_from_slice(&compressed);
    Ok(buf)
}

/// Decode a binary patch range frame.
pub fn decode_range(data: &[u8]) -> Result<Vec<PatchRecord>> {
    if data.len() < 13 {
        return Err(PatchLogError::Encoding("frame too short for header".into()));
    }
    if &data[0..4] != PROTOCOL_MAGIC {
        return Err(PatchLogError::Encoding("invalid protocol magic".into()));
    }
    let flags = data[4];
    let uncompressed_len =
        u32::from_le_bytes(data[5..9].try_into().expect("slice length checked")) as usize;
    let compressed_len =
        u32::from_le_bytes(data[9..13].try_into().expect("slice length checked")) as usize;

    if uncompressed_len > MAX_FRAME_SIZE {
        return Err(PatchLogError::Encoding("frame exceeds size cap".into()));
    }
    if data.len() < 13 + compressed_len {
        return Err(PatchLogError::Encoding("frame truncated".into()));
    }

    let payload = if flags & 0x01 != 0 {
        // Decompress through a bounded reader: the declared length caps what
        // gets materialized, and the result must match the declaration.
        let decoder = zstd::stream::read::Decoder::new(&data[13..13 + compressed_len])
            .map_err(|e| PatchLogError::Encoding(format!("decompression failed: {}", e)))?;
        let mut payload = Vec::new();
        decoder
            .take(uncompressed_len as u64 + 1)
            .read_to_end(&mut payload)
            .map_err(|e| PatchLogError::Encoding(format!("decompression failed: {}", e)))?;
        if payload.len() != uncompressed_len {
            return Err(PatchLogError::Encoding(
                "frame does not match its declared uncompressed length".into(),
            ));
        }
        payload
    } else {
        if compressed_len != uncompressed_len {
            return Err(PatchLogError::Encoding(
                "frame does not match its declared uncompressed length".into(),
            ));
        }
        data[13..13 + compressed_len].to_vec()
    };

    Ok(bincode::deserialize(&payload)?)
}
