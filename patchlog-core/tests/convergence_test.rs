//! End-to-end convergence tests across the server, link, and replica layers

use async_trait::async_trait;
use patchlog_core::{
    LocalLink, PatchLogError, PatchLogServer, PatchRecord, PatchSink, ReplicaClient, Result,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;

/// Sink that records applied payloads, standing in for the dataset engine
struct VecSink {
    applied: Mutex<Vec<Vec<u8>>>,
}

impl VecSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            applied: Mutex::new(Vec::new()),
        })
    }

    async fn applied(&self) -> Vec<Vec<u8>> {
        self.applied.lock().await.clone()
    }
}

#[async_trait]
impl PatchSink for VecSink {
    async fn apply(&self, record: &PatchRecord) -> Result<()> {
        self.applied.lock().await.push(record.payload.clone());
        Ok(())
    }
}

async fn setup(source: &str) -> (TempDir, Arc<PatchLogServer>, Arc<LocalLink>) {
    let tmp = TempDir::new().unwrap();
    let server = Arc::new(PatchLogServer::open(tmp.path()).unwrap());
    server.create_source(source).await.unwrap();
    let link = Arc::new(LocalLink::new(server.clone()));
    (tmp, server, link)
}

/// The canonical two-writer scenario: A lands p1 at version 1, a stale B
/// conflicts, rebases over p1, and lands p2 at version 2; the resulting
/// range is [p1, p2] with a valid hash chain.
#[tokio::test]
async fn test_stale_writer_rebases_and_lands_second() {
    let (_tmp, server, link) = setup("scenario").await;

    let sink_a = VecSink::new();
    let sink_b = VecSink::new();
    let a = ReplicaClient::new(link.clone(), sink_a.clone(), "scenario");
    let b = ReplicaClient::new(link.clone(), sink_b.clone(), "scenario");

    let v1 = a.submit(b"p1".to_vec()).await.unwrap();
    assert_eq!(v1, 1);

    // B is stale at 0: a direct append with base 0 must conflict and carry
    // the actual head.
    let err = server.append("scenario", 0, b"p2".to_vec()).await.unwrap_err();
    assert_eq!(err.conflict_head(), Some(1));

    // B's submit does the rebase internally: sync absorbs p1, then p2 lands.
    let v2 = b.submit(b"p2".to_vec()).await.unwrap();
    assert_eq!(v2, 2);
    assert_eq!(b.local_version().await, 2);
    assert_eq!(sink_b.applied().await, vec![b"p1".to_vec()]);

    // The stored range is [p1, p2] in order with a verifiable chain.
    let records = server.fetch_range("scenario", 1, Some(2)).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].payload, b"p1");
    assert_eq!(records[1].payload, b"p2");
    assert!(records[1].chains_onto(&records[0]));
    server.verify_source("scenario").await.unwrap();
}

/// Many replicas submitting concurrently all converge on one total order.
#[tokio::test]
async fn test_concurrent_submitters_converge() {
    let (_tmp, server, link) = setup("busy").await;

    let mut handles = Vec::new();
    let mut replicas = Vec::new();
    for i in 0..4 {
        let sink = VecSink::new();
        let replica = Arc::new(
            ReplicaClient::new(link.clone(), sink.clone(), "busy").with_max_submit_attempts(16),
        );
        replicas.push((replica.clone(), sink));
        handles.push(tokio::spawn(async move {
            replica.submit(format!("patch from {}", i).into_bytes()).await
        }));
    }

    let mut accepted = Vec::new();
    for handle in handles {
        accepted.push(handle.await.unwrap().unwrap());
    }
    accepted.sort_unstable();
    assert_eq!(accepted, vec![1, 2, 3, 4]);

    let head = server.head_version("busy").await.unwrap();
    assert_eq!(head, 4);

    // After a final sync every replica sits at the head and the union of
    // (applied + own) covers the full log in server order.
    let full: Vec<Vec<u8>> = server
        .fetch_range("busy", 1, None)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.payload)
        .collect();

    for (replica, sink) in &replicas {
        replica.sync().await.unwrap();
        assert_eq!(replica.local_version().await, head);
        let applied = sink.applied().await;
        // Applied patches appear in server order
        let mut cursor = full.iter();
        for p in &applied {
            assert!(cursor.any(|f| f == p), "out of order or missing: {:?}", p);
        }
        assert_eq!(applied.len(), 3);
    }

    server.verify_source("busy").await.unwrap();
}

/// A replica that detaches and reattaches with its watermark resumes cleanly.
#[tokio::test]
async fn test_reattach_with_watermark() {
    let (_tmp, server, link) = setup("s").await;

    let sink = VecSink::new();
    let replica = ReplicaClient::new(link.clone(), sink.clone(), "s");
    server.append("s", 0, b"p1".to_vec()).await.unwrap();
    server.append("s", 1, b"p2".to_vec()).await.unwrap();
    replica.sync().await.unwrap();

    let watermark = replica.local_version().await;
    let records = server.fetch_range("s", watermark, Some(watermark)).await.unwrap();
    let last_hash = records[0].hash();
    drop(replica);

    server.append("s", 2, b"p3".to_vec()).await.unwrap();

    let sink2 = VecSink::new();
    let reattached =
        ReplicaClient::with_watermark(link, sink2.clone(), "s", watermark, last_hash);
    assert_eq!(reattached.sync().await.unwrap(), 1);
    assert_eq!(sink2.applied().await, vec![b"p3".to_vec()]);
}

/// Submissions against a deleted source surface the identity error.
#[tokio::test]
async fn test_submit_to_deleted_source() {
    let (_tmp, server, link) = setup("doomed").await;
    server.delete_source("doomed").await.unwrap();

    let sink = VecSink::new();
    let replica = ReplicaClient::new(link, sink, "doomed");
    assert!(matches!(
        replica.submit(b"p".to_vec()).await,
        Err(PatchLogError::SourceDeleted(_))
    ));
}
