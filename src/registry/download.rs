//! Download worker: streams a model artifact from its source URL to
//! disk, updating a `ProgressRecord` as bytes arrive and verifying a
//! SHA-256 checksum if one is recorded in the catalogue. Streams to a
//! `.part` file, hashes incrementally, and renames into place on
//! success.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};

use crate::error::{JarvisError, Result};

use super::bus::{BusEvent, ProgressBus};
use super::progress::{DownloadStatus, ProgressRecord};

/// Per-chunk connect/read timeout.
const CONNECT_READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Handle used to ask a running download to stop early.
#[derive(Clone)]
pub struct CancelToken {
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.notify.notify_waiters();
    }

    async fn cancelled(&self) {
        self.notify.notified().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Download `model_id` from `url` into `dest_dir/filename`, publishing
/// progress through `bus` and writing the final record into `progress`.
///
/// On success, `dest_dir/filename` contains the verified artifact and
/// the returned path points at it. On failure or cancellation the
/// partial `.part` file is removed and an error is recorded.
pub async fn run_download(
    client: reqwest::Client,
    model_id: String,
    url: String,
    hf_token: Option<String>,
    dest_dir: PathBuf,
    filename: String,
    expected_checksum: Option<String>,
    progress: Arc<Mutex<ProgressRecord>>,
    bus: ProgressBus,
    cancel: CancelToken,
) -> Result<(PathBuf, String)> {
    let final_path = dest_dir.join(&filename);
    let part_path = dest_dir.join(format!("{filename}.part"));

    tokio::fs::create_dir_all(&dest_dir)
        .await
        .map_err(|e| JarvisError::Internal(format!("failed to create {}: {e}", dest_dir.display())))?;

    let result = do_download(
        &client,
        &url,
        hf_token.as_deref(),
        &part_path,
        expected_checksum.as_deref(),
        progress.clone(),
        bus.clone(),
        &model_id,
        cancel.clone(),
    )
    .await;

    match result {
        Ok(digest) => {
            tokio::fs::rename(&part_path, &final_path)
                .await
                .map_err(|e| JarvisError::Internal(format!("failed to finalize download: {e}")))?;
            let mut record = progress.lock().await;
            record.set_status(DownloadStatus::Completed);
            record.set_downloaded(record.total.unwrap_or(record.downloaded));
            bus.publish(BusEvent::progress(model_id.clone(), record.clone()))
                .await;
            Ok((final_path, digest))
        }
        Err(err) => {
            let _ = tokio::fs::remove_file(&part_path).await;
            let mut record = progress.lock().await;
            let status = if matches!(err, JarvisError::Cancelled(_)) {
                DownloadStatus::Cancelled
            } else {
                DownloadStatus::Error
            };
            record.set_status(status);
            record.set_error(err.to_string(), err.error_code());
            bus.publish(BusEvent::progress(model_id.clone(), record.clone()))
                .await;
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn do_download(
    client: &reqwest::Client,
    url: &str,
    hf_token: Option<&str>,
    part_path: &Path,
    expected_checksum: Option<&str>,
    progress: Arc<Mutex<ProgressRecord>>,
    bus: ProgressBus,
    model_id: &str,
    cancel: CancelToken,
) -> Result<String> {
    let mut request = client.get(url);
    if let Some(token) = hf_token {
        request = request.bearer_auth(token);
    }
    let response = tokio::time::timeout(CONNECT_READ_TIMEOUT, request.send())
        .await
        .map_err(|_| JarvisError::UpstreamFailure(format!("connect timed out for {url}")))?
        .map_err(|e| JarvisError::UpstreamFailure(format!("failed to reach {url}: {e}")))?;

    match response.status() {
        status if status.is_success() => {}
        status if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN => {
            return Err(JarvisError::Authorization(format!("upstream denied access to {url}")));
        }
        status if status == reqwest::StatusCode::NOT_FOUND => {
            return Err(JarvisError::NotFound(format!("upstream has no artifact at {url}")));
        }
        status => {
            return Err(JarvisError::UpstreamFailure(format!("upstream returned {status} for {url}")));
        }
    }

    let total = response.content_length();
    {
        let mut record = progress.lock().await;
        record.set_total(total);
        record.set_status(DownloadStatus::Downloading);
        bus.publish(BusEvent::progress(model_id, record.clone())).await;
    }

    let mut file = tokio::fs::File::create(part_path)
        .await
        .map_err(|e| JarvisError::Internal(format!("failed to create {}: {e}", part_path.display())))?;

    let mut hasher = Sha256::new();
    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(JarvisError::Cancelled(format!("download of {model_id} was cancelled")));
            }
            chunk = tokio::time::timeout(CONNECT_READ_TIMEOUT, stream.next()) => {
                let Ok(chunk) = chunk else {
                    return Err(JarvisError::UpstreamFailure(format!("read timed out for {url}")));
                };
                let Some(chunk) = chunk else { break };
                let chunk = chunk.map_err(|e| JarvisError::UpstreamFailure(format!("stream error: {e}")))?;
                hasher.update(&chunk);
                downloaded += chunk.len() as u64;
                file.write_all(&chunk)
                    .await
                    .map_err(|e| JarvisError::Internal(format!("write error: {e}")))?;

                let mut record = progress.lock().await;
                record.set_downloaded(downloaded);
                bus.publish(BusEvent::progress(model_id, record.clone())).await;
            }
        }
    }

    file.flush()
        .await
        .map_err(|e| JarvisError::Internal(format!("flush error: {e}")))?;
    drop(file);

    let digest = hex::encode(hasher.finalize());
    if let Some(expected) = expected_checksum {
        if !digest.eq_ignore_ascii_case(expected) {
            return Err(JarvisError::Conflict(format!(
                "checksum mismatch for {model_id}: expected {expected}, got {digest}"
            )));
        }
    }

    Ok(digest)
}
