//! HTTP chunk transport.
//!
//! `PUT {base}/uploads/{key}/chunks/{index}` with the chunk bytes streamed
//! in fixed ranges, and `POST {base}/uploads/{key}/finalize` with a JSON
//! body.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use paperdrop_protocol::{CHUNK_DIGEST_HEADER, FinalizeRequest, FinalizeResponse, chunk_path, finalize_path};
use reqwest::header::CONTENT_TYPE;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transport::{ChunkPayload, ChunkTransport, ProgressFn, TransportError};

/// Size of the byte ranges a chunk body is streamed in. Progress and
/// cancellation are checked between ranges.
pub const BODY_RANGE_SIZE: usize = 64 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest error body kept in a `TransportError::Status` message.
const MAX_ERROR_BODY: usize = 256;

/// [`ChunkTransport`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpTransport {
    /// Creates a transport for `base_url` (e.g. `https://host/api`).
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self::with_client(client, base_url, auth_token))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str, auth_token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: auth_token.filter(|t| !t.is_empty()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl ChunkTransport for HttpTransport {
    fn put_chunk(
        &self,
        chunk: ChunkPayload,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            let url = self.url(&chunk_path(&chunk.session_key, chunk.index));
            let total = chunk.data.len() as u64;
            let body = reqwest::Body::wrap_stream(byte_ranges(
                chunk.data,
                progress.clone(),
                cancel.clone(),
            ));
            let request = self
                .authorize(self.client.put(&url))
                .header(CHUNK_DIGEST_HEADER, &chunk.digest)
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(body);

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                result = request.send() => result.map_err(map_reqwest_error)?,
            };
            check_status(response).await?;

            progress(total);
            debug!(index = chunk.index, bytes = total, "chunk accepted");
            Ok(())
        })
    }

    fn finalize(
        &self,
        session_key: String,
        request: FinalizeRequest,
    ) -> Pin<Box<dyn Future<Output = Result<FinalizeResponse, TransportError>> + Send + '_>> {
        Box::pin(async move {
            let url = self.url(&finalize_path(&session_key));
            let response = self
                .authorize(self.client.post(&url))
                .json(&request)
                .send()
                .await
                .map_err(map_reqwest_error)?;
            let response = check_status(response).await?;

            let body = response.bytes().await.map_err(map_reqwest_error)?;
            if body.is_empty() {
                return Ok(FinalizeResponse::default());
            }
            serde_json::from_slice(&body).map_err(|e| TransportError::InvalidResponse(e.to_string()))
        })
    }
}

/// Streams `data` in [`BODY_RANGE_SIZE`] pieces, reporting the cumulative
/// count after each piece and failing the body once `cancel` fires.
fn byte_ranges(
    data: Bytes,
    progress: ProgressFn,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    futures_util::stream::unfold(0usize, move |offset| {
        let data = data.clone();
        let progress = progress.clone();
        let cancel = cancel.clone();
        async move {
            if offset >= data.len() {
                return None;
            }
            if cancel.is_cancelled() {
                let err = std::io::Error::new(std::io::ErrorKind::Interrupted, "chunk upload cancelled");
                return Some((Err(err), data.len()));
            }
            let end = (offset + BODY_RANGE_SIZE).min(data.len());
            let piece = data.slice(offset..end);
            progress(end as u64);
            Some((Ok(piece), end))
        }
    })
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut message = response.text().await.unwrap_or_default();
    if message.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    if message.is_empty() {
        message = status.canonical_reason().unwrap_or("").to_string();
    }
    Err(TransportError::status(status.as_u16(), message))
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_decode() {
        TransportError::InvalidResponse(e.to_string())
    } else {
        TransportError::Connection(e.to_string())
    }
}
