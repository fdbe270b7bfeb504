//! HTTP client link to a remote patch log server.
//!
//! Speaks the server's JSON control endpoints and the binary range framing,
//! mapping error response bodies back to engine errors so callers (including
//! the shared replica client) see the same errors a local link would produce.

use async_trait::async_trait;
use patchlog_core::protocol::{
    self, AppendResponse, CreateSourceRequest, ErrorBody, HeadResponse, ServerInfo, SourceInfo,
};
use patchlog_core::{PatchLogError, PatchLogLink, PatchRecord, Result, SourceDescription};

/// Records requested per range fetch; the server caps range size.
const RANGE_BATCH: u64 = 500;

/// `PatchLogLink` over HTTP against a patch log server.
pub struct RemoteLink {
    base_url: String,
    http: reqwest::Client,
}

impl RemoteLink {
    /// Create a link targeting `base_url` (e.g. `http://server:1066`).
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| PatchLogError::Transport(format!("failed to build client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET /info
    pub async fn server_info(&self) -> Result<ServerInfo> {
        let url = format!("{}/info", self.base_url);
        let resp = self.send(self.http.get(&url)).await?;
        parse_json(resp).await
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = req
            .send()
            .await
            .map_err(|e| PatchLogError::Transport(format!("request failed: {}", e)))?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        Err(read_error(resp).await)
    }

    async fn fetch_batch(&self, source_id: &str, from: u64, to: u64) -> Result<Vec<PatchRecord>> {
        let url = format!(
            "{}/{}/patches?from={}&to={}",
            self.base_url, source_id, from, to
        );
        let resp = self.send(self.http.get(&url)).await?;
        let frame = resp
            .bytes()
            .await
            .map_err(|e| PatchLogError::Transport(format!("failed to read frame: {}", e)))?;
        protocol::decode_range(&frame)
    }
}

/// Turn a failure response into the engine error it carries.
async fn read_error(resp: reqwest::Response) -> PatchLogError {
    let status = resp.status();
    let body = resp.bytes().await.unwrap_or_default();
    match serde_json::from_slice::<ErrorBody>(&body) {
        Ok(err) => err.into_error(),
        Err(_) => PatchLogError::Transport(format!(
            "server returned {}: {}",
            status,
            String::from_utf8_lossy(&body)
        )),
    }
}

async fn parse_json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    resp.json()
        .await
        .map_err(|e| PatchLogError::Transport(format!("failed to parse response: {}", e)))
}

#[async_trait]
impl PatchLogLink for RemoteLink {
    async fn create_source(&self, source_id: &str) -> Result<SourceDescription> {
        let url = format!("{}/sources", self.base_url);
        let body = CreateSourceRequest {
            source_id: source_id.to_string(),
        };
        let resp = self.send(self.http.post(&url).json(&body)).await?;
        let info: SourceInfo = parse_json(resp).await?;
        info.try_into()
    }

    async fn append(&self, source_id: &str, base_version: u64, payload: Vec<u8>) -> Result<u64> {
        let url = format!(
            "{}/{}/append?base={}",
            self.base_url, source_id, base_version
        );
        let resp = self.send(self.http.post(&url).body(payload)).await?;
        let ack: AppendResponse = parse_json(resp).await?;
        Ok(ack.version)
    }

    async fn fetch_range(
        &self,
        source_id: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<PatchRecord>> {
        // Resolve an open end against the head first, so the walk below has
        // a definite bound and never asks past the log.
        let to = match to {
            Some(to) => to,
            None => self.head_version(source_id).await?,
        };
        if to < from {
            return Ok(Vec::new());
        }
        // The server bounds a single response, so walk the range in batches
        // until the requested end is reached.
        let mut records = Vec::new();
        let mut next = from;
        while next <= to {
            let batch_to = (next + RANGE_BATCH - 1).min(to);
            let batch = self.fetch_batch(source_id, next, batch_to).await?;
            let got = batch.len() as u64;
            records.extend(batch);
            // A short batch means the server holds less than requested
            if got < batch_to - next + 1 {
                break;
            }
            next = batch_to + 1;
        }
        Ok(records)
    }

    async fn head_version(&self, source_id: &str) -> Result<u64> {
        let url = format!("{}/{}/head", self.base_url, source_id);
        let resp = self.send(self.http.get(&url)).await?;
        let head: HeadResponse = parse_json(resp).await?;
        Ok(head.head_version)
    }

    async fn describe_source(&self, source_id: &str) -> Result<SourceDescription> {
        let url = format!("{}/sources/{}", self.base_url, source_id);
        let resp = self.send(self.http.get(&url)).await?;
        let info: SourceInfo = parse_json(resp).await?;
        info.try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use patchlog_core::PatchId;
    use std::sync::Arc;

    fn chained_records(n: u64) -> Vec<PatchRecord> {
        let mut records = Vec::new();
        let mut prev = PatchId::ZERO;
        for v in 1..=n {
            let record = PatchRecord::new(v, prev, format!("payload {}", v).into_bytes(), v as i64);
            prev = record.hash();
            records.push(record);
        }
        records
    }

    fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(serde_json::to_vec(value).unwrap())))
            .unwrap()
    }

    /// Minimal head/patches surface over an in-memory log, answering the way
    /// the real server does (including 416 on a range past the head).
    fn route(records: &[PatchRecord], req: &Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
        let head = records.len() as u64;
        if req.uri().path().ends_with("/head") {
            return json_response(StatusCode::OK, &HeadResponse { head_version: head });
        }

        let mut from = 1u64;
        let mut to = head;
        for pair in req.uri().query().unwrap_or("").split('&') {
            match pair.split_once('=') {
                Some(("from", v)) => from = v.parse().unwrap(),
                Some(("to", v)) => to = v.parse().unwrap(),
                _ => {}
            }
        }
        if from < 1 || from > head {
            let body = ErrorBody::from_error(&PatchLogError::RangeNotFound { from, head });
            return json_response(StatusCode::RANGE_NOT_SATISFIABLE, &body);
        }
        let to = to.min(head);
        let frame = protocol::encode_range(&records[(from - 1) as usize..to as usize]).unwrap();
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/octet-stream")
            .body(Full::new(Bytes::from(frame)))
            .unwrap()
    }

    async fn serve(records: Arc<Vec<PatchRecord>>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let records = records.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let records = records.clone();
                        async move { Ok::<_, hyper::Error>(route(&records, &req)) }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_open_ended_fetch_on_exact_batch_multiple() {
        // Log length an exact multiple of the batch size: every window comes
        // back full, and the walk must still stop at the head instead of
        // asking for records past it.
        let records = Arc::new(chained_records(RANGE_BATCH * 2));
        let url = serve(records.clone()).await;
        let link = RemoteLink::new(&url).unwrap();

        let fetched = link.fetch_range("s", 1, None).await.unwrap();
        assert_eq!(fetched.len(), records.len());
        assert_eq!(fetched.last().unwrap().version, RANGE_BATCH * 2);
    }

    #[tokio::test]
    async fn test_open_ended_fetch_of_empty_log() {
        let url = serve(Arc::new(Vec::new())).await;
        let link = RemoteLink::new(&url).unwrap();
        assert!(link.fetch_range("s", 1, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_past_head_maps_to_range_not_found() {
        let url = serve(Arc::new(chained_records(3))).await;
        let link = RemoteLink::new(&url).unwrap();

        assert!(matches!(
            link.fetch_range("s", 9, Some(9)).await,
            Err(PatchLogError::RangeNotFound { .. })
        ));
    }
}
