//! Patch record value types
//!
//! A `PatchRecord` is the immutable unit stored in a source's log: an opaque
//! change payload plus the metadata that links it into the hash chain. The
//! payload is never inspected here; integrity is tracked through its digest.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 32-byte SHA-256 digest identifying a patch or linking it to its predecessor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatchId([u8; 32]);

impl PatchId {
    /// Sentinel predecessor hash for the first record of a log
    pub const ZERO: PatchId = PatchId([0u8; 32]);

    /// Create a new PatchId from raw bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute a PatchId as the SHA-256 of arbitrary data
    pub fn from_data(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(hash.into())
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for PatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Canonical hashed fields of a record.
///
/// The payload is covered indirectly: `content_digest` is part of the header,
/// so tampering with either the payload or any header field changes the
/// record hash and breaks the chain at every subsequent record.
#[derive(Serialize)]
struct RecordHeader<'a> {
    version: u64,
    previous_hash: &'a PatchId,
    content_digest: &'a PatchId,
    created_at: i64,
}

/// A single accepted change in a source's log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRecord {
    /// Version number, contiguous from 1 within a source
    pub version: u64,
    /// Hash of the preceding record (`PatchId::ZERO` for version 1)
    pub previous_hash: PatchId,
    /// SHA-256 of the payload
    pub content_digest: PatchId,
    /// Opaque change description; never inspected by the log engine
    pub payload: Vec<u8>,
    /// Server-assigned timestamp (Unix seconds) at append time
    pub created_at: i64,
}

impl PatchRecord {
    /// Build a record from an opaque payload, computing its content digest
    pub fn new(version: u64, previous_hash: PatchId, payload: Vec<u8>, created_at: i64) -> Self {
        let content_digest = PatchId::from_data(&payload);
        Self {
            version,
            previous_hash,
            content_digest,
            payload,
            created_at,
        }
    }

    /// Compute the chain hash of this record over its canonical header encoding
    pub fn hash(&self) -> PatchId {
        let header = RecordHeader {
            version: self.version,
            previous_hash: &self.previous_hash,
            content_digest: &self.content_digest,
            created_at: self.created_at,
        };
        // bincode of a fixed-field struct is canonical for our purposes,
        // and encoding plain integers and arrays cannot fail
        let encoded =
            bincode::serialize(&header).expect("record header encoding is infallible");
        PatchId::from_data(&encoded)
    }

    /// Check the payload against the stored content digest
    pub fn verify_digest(&self) -> bool {
        PatchId::from_data(&self.payload) == self.content_digest
    }

    /// Check that this record chains correctly onto `previous`
    pub fn chains_onto(&self, previous: &PatchRecord) -> bool {
        self.version == previous.version + 1 && self.previous_hash == previous.hash()
    }

    /// Serialize to binary format
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary format
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_id_roundtrip() {
        let bytes = [42u8; 32];
        let id = PatchId::new(bytes);
        let hex = id.to_hex();
        let id2 = PatchId::from_hex(&hex).unwrap();
        assert_eq!(id, id2);
    }

    #[test]
    fn test_patch_id_from_bad_hex() {
        assert!(PatchId::from_hex("abcd").is_err());
        assert!(PatchId::from_hex("not hex at all").is_err());
    }

    #[test]
    fn test_record_digest() {
        let record = PatchRecord::new(1, PatchId::ZERO, b"some change".to_vec(), 1000);
        assert!(record.verify_digest());

        let mut tampered = record.clone();
        tampered.payload = b"other change".to_vec();
        assert!(!tampered.verify_digest());
    }

    #[test]
    fn test_record_hash_covers_all_header_fields() {
        let base = PatchRecord::new(1, PatchId::ZERO, b"payload".to_vec(), 1000);
        let h = base.hash();

        let mut v = base.clone();
        v.version = 2;
        assert_ne!(v.hash(), h);

        let mut t = base.clone();
        t.created_at = 2000;
        assert_ne!(t.hash(), h);

        let mut p = base.clone();
        p.previous_hash = PatchId::new([1u8; 32]);
        assert_ne!(p.hash(), h);
    }

    #[test]
    fn test_record_hash_is_never_the_empty_hash() {
        // The hash must always cover the encoded header, never degenerate
        // to the digest of an empty byte string.
        let record = PatchRecord::new(1, PatchId::ZERO, b"payload".to_vec(), 1000);
        assert_ne!(record.hash(), PatchId::from_data(&[]));
    }

    #[test]
    fn test_chains_onto() {
        let first = PatchRecord::new(1, PatchId::ZERO, b"a".to_vec(), 100);
        let second = PatchRecord::new(2, first.hash(), b"b".to_vec(), 200);
        assert!(second.chains_onto(&first));

        let skewed = PatchRecord::new(3, first.hash(), b"c".to_vec(), 300);
        assert!(!skewed.chains_onto(&first));
    }

    #[test]
    fn test_record_serialization() {
        let record = PatchRecord::new(7, PatchId::new([9u8; 32]), b"bytes".to_vec(), 1234567890);
        let bytes = record.to_bytes().unwrap();
        let record2 = PatchRecord::from_bytes(&bytes).unwrap();
        assert_eq!(record, record2);
        assert_eq!(record.hash(), record2.hash());
    }
}
