//! Streaming ingestion calls.
//!
//! Each call hands the service an ordered list of files and returns a stream
//! of progress events. Events correlate back to files by `file_index` into
//! the submitted list: the service assigns document ids lazily, so the index
//! is the only correlation key guaranteed to exist from the first event on.

use std::collections::VecDeque;
use std::pin::Pin;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::accounts::AccountHandle;
use crate::backend::client::BackendClient;
use crate::error::AppError;
use crate::upload::types::PipelineStage;

// ─────────────────────────────────────────────────────────────────────────────
// Public Types
// ─────────────────────────────────────────────────────────────────────────────

/// One progress event emitted by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Index of the file within the submitted list.
    pub file_index: usize,
    pub filename: String,
    /// Server document id; absent until the server starts tracking the file.
    #[serde(default)]
    pub document_id: Option<String>,
    pub stage: PipelineStage,
    /// Human-readable current-activity text.
    #[serde(default)]
    pub message: Option<String>,
    /// 0–100 within the current stage; may reset at stage transitions.
    #[serde(default)]
    pub progress_percent: u8,
    /// Server-side event time, unix seconds.
    #[serde(default)]
    pub timestamp: f64,
    /// Failure detail, present only on `stage: failed` events.
    #[serde(default)]
    pub error: Option<String>,
}

/// An ordered stream of pipeline progress events for one submitted list.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<ProgressEvent, AppError>> + Send>>;

/// A local file prepared for upload.
#[derive(Clone)]
pub struct UploadFile {
    pub filename: String,
    pub bytes: Vec<u8>,
    /// Hex sha256 of `bytes`, checked server-side on receipt.
    pub sha256: String,
}

impl std::fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Raw file contents are never logged
        f.debug_struct("UploadFile")
            .field("filename", &self.filename)
            .field("len", &self.bytes.len())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct UploadFileBody<'a> {
    filename: &'a str,
    content_base64: String,
    sha256: &'a str,
}

#[derive(Serialize)]
struct UploadRequestBody<'a> {
    files: Vec<UploadFileBody<'a>>,
}

/// Drive ingestion request. No `Debug` derive: carries the account token.
#[derive(Serialize)]
struct DriveIngestBody<'a> {
    account_id: &'a str,
    access_token: &'a str,
    file_ids: &'a [String],
}

// ─────────────────────────────────────────────────────────────────────────────
// Ingestion calls
// ─────────────────────────────────────────────────────────────────────────────

impl BackendClient {
    /// Submits local file payloads and returns the pipeline's event stream.
    pub async fn upload_local_files(&self, files: &[UploadFile]) -> Result<EventStream, AppError> {
        let url = self.endpoint("api/ingest/upload")?;
        let body = UploadRequestBody {
            files: files
                .iter()
                .map(|f| UploadFileBody {
                    filename: &f.filename,
                    content_base64: BASE64.encode(&f.bytes),
                    sha256: &f.sha256,
                })
                .collect(),
        };

        let response = self
            .http()
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::ConnectionFailed(format!("Upload request failed: {e}")))?;

        let status = response.status();
        info!(
            "[PIPELINE] POST /api/ingest/upload ({} files) -> {}",
            files.len(),
            status.as_u16()
        );

        if !status.is_success() {
            return Err(Self::parse_error_response(response, status).await);
        }

        Ok(ndjson_events(response))
    }

    /// Submits drive file references for one account and returns the
    /// pipeline's event stream. The handle authorizes the service to fetch
    /// the files from the provider on the account's behalf.
    pub async fn ingest_drive_files(
        &self,
        account_id: &str,
        handle: &AccountHandle,
        file_ids: &[String],
    ) -> Result<EventStream, AppError> {
        let url = self.endpoint("api/ingest/drive")?;
        let body = DriveIngestBody {
            account_id,
            access_token: handle.expose(),
            file_ids,
        };

        let response = self
            .http()
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::ConnectionFailed(format!("Drive ingest request failed: {e}")))?;

        let status = response.status();
        info!(
            "[PIPELINE] POST /api/ingest/drive ({} files) -> {}",
            file_ids.len(),
            status.as_u16()
        );

        if !status.is_success() {
            return Err(Self::parse_error_response(response, status).await);
        }

        Ok(ndjson_events(response))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// NDJSON decoding
// ─────────────────────────────────────────────────────────────────────────────

/// Raw body chunks with the transport error already stringified, so tests
/// can inject failures without fabricating `reqwest` errors.
type BodyStream = BoxStream<'static, Result<Vec<u8>, String>>;

fn ndjson_events(response: reqwest::Response) -> EventStream {
    let body: BodyStream = response
        .bytes_stream()
        .map(|chunk| chunk.map(|b| b.to_vec()).map_err(|e| e.to_string()))
        .boxed();
    events_from_chunks(body)
}

struct DecodeState {
    body: BodyStream,
    buffer: Vec<u8>,
    pending: VecDeque<Result<ProgressEvent, AppError>>,
    finished: bool,
}

/// Reassembles NDJSON lines from arbitrarily split chunks and decodes each
/// line into a `ProgressEvent`. A transport error ends the stream with one
/// final `Err` item.
fn events_from_chunks(body: BodyStream) -> EventStream {
    let state = DecodeState {
        body,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((event, st));
            }
            if st.finished {
                // Flush a trailing line without a newline terminator
                if !st.buffer.is_empty() {
                    let line = String::from_utf8_lossy(&st.buffer).trim().to_string();
                    st.buffer.clear();
                    if !line.is_empty() {
                        st.pending.push_back(parse_event_line(&line));
                    }
                    continue;
                }
                return None;
            }
            match st.body.next().await {
                Some(Ok(chunk)) => {
                    st.buffer.extend_from_slice(&chunk);
                    while let Some(pos) = st.buffer.iter().position(|&b| b == b'\n') {
                        let raw: Vec<u8> = st.buffer.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&raw).trim().to_string();
                        if !line.is_empty() {
                            st.pending.push_back(parse_event_line(&line));
                        }
                    }
                }
                Some(Err(e)) => {
                    st.finished = true;
                    st.pending.push_back(Err(AppError::StreamInterrupted(format!(
                        "Progress stream broke mid-read: {e}"
                    ))));
                }
                None => st.finished = true,
            }
        }
    }))
}

fn parse_event_line(line: &str) -> Result<ProgressEvent, AppError> {
    serde_json::from_str(line).map_err(|e| {
        AppError::StreamInterrupted(format!("Malformed progress event from service: {e}"))
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
