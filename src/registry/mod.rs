//! Model registry: the catalogue of known models, their on-disk
//! artifacts, and the download/activation lifecycle that moves them
//! between states.

pub mod bus;
pub mod download;
pub mod metadata;
pub mod progress;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{JarvisError, Result};

use bus::{BusEvent, ProgressBus, Subscription};
use download::CancelToken;
use metadata::{ModelMetadata, ModelState};
use progress::ProgressRecord;

const CATALOGUE_FILE: &str = "models.json";

/// Abstraction over "ask the remote model hub for an artifact's size",
/// so `start_download`'s pre-flight check can be exercised without a
/// live network call in tests.
#[async_trait]
pub trait HubClient: Send + Sync {
    async fn probe(&self, repo_id: &str, filename: &str, hf_token: Option<&str>) -> Result<Option<u64>>;
}

/// Production `HubClient`: a HEAD request against the Hugging Face
/// resolve URL convention.
pub struct ReqwestHubClient {
    http: reqwest::Client,
}

impl ReqwestHubClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl HubClient for ReqwestHubClient {
    async fn probe(&self, repo_id: &str, filename: &str, hf_token: Option<&str>) -> Result<Option<u64>> {
        let mut request = self.http.head(hub_url(repo_id, filename));
        if let Some(token) = hf_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| JarvisError::UpstreamFailure(format!("failed to reach model hub: {e}")))?;

        match response.status() {
            status if status.is_success() => Ok(response.content_length()),
            status if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN => {
                Err(JarvisError::Authorization(format!("hub denied access to {repo_id}/{filename}")))
            }
            status if status == reqwest::StatusCode::NOT_FOUND => {
                Err(JarvisError::NotFound(format!("{repo_id}/{filename} was not found on the hub")))
            }
            _ => Ok(None),
        }
    }
}

/// On-disk shape of `models.json`. A plain `Vec` (rather than a map)
/// preserves insertion order across save/load, mirroring the ordering
/// guarantee Python's `dict` gives `ModelRegistry.list_models()`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogueFile {
    models: Vec<ModelMetadata>,
}

struct Inner {
    base_dir: PathBuf,
    /// Insertion-ordered catalogue; order is part of the persisted contract.
    order: Vec<String>,
    entries: HashMap<String, ModelMetadata>,
    /// Live workers only — present while a download is actually running,
    /// so `start_download` can reject a duplicate and `shutdown`/
    /// `remove_model` can cancel it.
    downloads: HashMap<String, CancelToken>,
    /// One record per model that has ever started a download, retained
    /// until `remove_model` — unlike `downloads`, this outlives the
    /// worker so a terminal (error/cancelled/completed) record stays
    /// readable via `get_progress` instead of reverting to a synthetic
    /// "queued" snapshot once the worker task exits.
    progress: HashMap<String, Arc<Mutex<ProgressRecord>>>,
}

/// Shared handle to the model catalogue, its progress bus, and the
/// download worker pool. Cheap to clone; state lives behind an `Arc`.
#[derive(Clone)]
pub struct ModelRegistry {
    inner: Arc<Mutex<Inner>>,
    bus: ProgressBus,
    http: reqwest::Client,
    hub: Arc<dyn HubClient>,
}

impl ModelRegistry {
    /// Load (or initialize) the catalogue rooted at `base_dir`.
    pub async fn load(base_dir: PathBuf) -> Result<Self> {
        let http = reqwest::Client::new();
        let hub = Arc::new(ReqwestHubClient::new(http.clone()));
        Self::load_with_hub(base_dir, hub).await
    }

    /// As `load`, but with an injectable `HubClient` for the pre-flight
    /// probe — used by tests to avoid live network calls.
    pub async fn load_with_hub(base_dir: PathBuf, hub: Arc<dyn HubClient>) -> Result<Self> {
        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| JarvisError::Internal(format!("failed to create {}: {e}", base_dir.display())))?;

        let catalogue_path = base_dir.join(CATALOGUE_FILE);
        let file = if catalogue_path.exists() {
            let contents = tokio::fs::read_to_string(&catalogue_path)
                .await
                .map_err(|e| JarvisError::Internal(format!("failed to read catalogue: {e}")))?;
            serde_json::from_str::<CatalogueFile>(&contents)
                .map_err(|e| JarvisError::Internal(format!("corrupt catalogue: {e}")))?
        } else {
            CatalogueFile::default()
        };

        let mut order = Vec::with_capacity(file.models.len());
        let mut entries = HashMap::with_capacity(file.models.len());
        for model in file.models {
            order.push(model.model_id.clone());
            entries.insert(model.model_id.clone(), model);
        }

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                base_dir,
                order,
                entries,
                downloads: HashMap::new(),
                progress: HashMap::new(),
            })),
            bus: ProgressBus::new(),
            http: reqwest::Client::new(),
            hub,
        })
    }

    async fn persist(&self, inner: &Inner) -> Result<()> {
        let file = CatalogueFile {
            models: inner
                .order
                .iter()
                .filter_map(|id| inner.entries.get(id).cloned())
                .collect(),
        };
        let serialized = serde_json::to_string_pretty(&file)
            .map_err(|e| JarvisError::Internal(format!("failed to serialize catalogue: {e}")))?;

        let tmp_path = inner.base_dir.join(format!("{CATALOGUE_FILE}.tmp"));
        tokio::fs::write(&tmp_path, serialized)
            .await
            .map_err(|e| JarvisError::Internal(format!("failed to write catalogue: {e}")))?;
        tokio::fs::rename(&tmp_path, inner.base_dir.join(CATALOGUE_FILE))
            .await
            .map_err(|e| JarvisError::Internal(format!("failed to finalize catalogue: {e}")))?;
        Ok(())
    }

    /// Catalogue entries in insertion order.
    pub async fn list_models(&self) -> Vec<ModelMetadata> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id).cloned())
            .collect()
    }

    pub async fn get_metadata(&self, model_id: &str) -> Result<ModelMetadata> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .get(model_id)
            .cloned()
            .ok_or_else(|| JarvisError::NotFound(format!("unknown model '{model_id}'")))
    }
}

fn hub_url(repo_id: &str, filename: &str) -> String {
    format!("https://huggingface.co/{repo_id}/resolve/main/{filename}")
}

/// A `ProgressRecord` for an entry that has no in-memory record (loaded
/// from the catalogue file in a prior process). Ready/Active entries
/// read as completed; anything else reads as queued.
fn synthesize_progress(metadata: &ModelMetadata) -> ProgressRecord {
    match metadata.state {
        ModelState::Ready | ModelState::Active => {
            let mut record = ProgressRecord::queued(None);
            record.set_status(progress::DownloadStatus::Completed);
            record
        }
        _ => ProgressRecord::queued(None),
    }
}

impl ModelRegistry {
    /// Register (or re-register) a catalogue entry and kick off a
    /// download from `repo_id`/`filename`, resolved to the Hugging Face
    /// URL convention.
    #[allow(clippy::too_many_arguments)]
    pub async fn start_download(
        &self,
        model_id: String,
        repo_id: String,
        filename: String,
        hf_token: Option<String>,
        checksum: Option<String>,
        tags: std::collections::BTreeSet<String>,
    ) -> Result<ModelMetadata> {
        let probed_total = self.hub.probe(&repo_id, &filename, hf_token.as_deref()).await?;

        let mut inner = self.inner.lock().await;

        if inner.downloads.contains_key(&model_id) {
            return Err(JarvisError::Conflict(format!(
                "a download for '{model_id}' is already in progress"
            )));
        }
        if let Some(existing) = inner.entries.get(&model_id) {
            if existing.state == ModelState::Downloading {
                return Err(JarvisError::Conflict(format!(
                    "model '{model_id}' is already downloading"
                )));
            }
        }

        let mut metadata = inner
            .entries
            .get(&model_id)
            .cloned()
            .unwrap_or_else(|| ModelMetadata::new(model_id.clone()));
        metadata.repo_id = Some(repo_id.clone());
        metadata.filename = Some(filename.clone());
        metadata.checksum = checksum.clone();
        metadata.tags = tags;
        metadata.state = ModelState::Downloading;

        if !inner.entries.contains_key(&model_id) {
            inner.order.push(model_id.clone());
        }
        inner.entries.insert(model_id.clone(), metadata.clone());
        self.persist(&inner).await?;

        let progress = Arc::new(Mutex::new(ProgressRecord::queued(probed_total)));
        let cancel = CancelToken::new();
        inner.downloads.insert(model_id.clone(), cancel.clone());
        inner.progress.insert(model_id.clone(), progress.clone());

        self.bus
            .publish(BusEvent::progress(model_id.clone(), progress.lock().await.clone()))
            .await;
        self.bus
            .publish(BusEvent::metadata(model_id.clone(), metadata.clone()))
            .await;

        let url = hub_url(&repo_id, &filename);
        let dest_dir = inner.base_dir.join(&model_id);
        let registry = self.clone();
        let spawned_model_id = model_id.clone();

        tokio::spawn(async move {
            let result = download::run_download(
                registry.http.clone(),
                spawned_model_id.clone(),
                url,
                hf_token,
                dest_dir,
                filename,
                checksum,
                progress,
                registry.bus.clone(),
                cancel,
            )
            .await;

            let mut inner = registry.inner.lock().await;
            inner.downloads.remove(&spawned_model_id);
            // `inner.progress` deliberately keeps the terminal record —
            // it is retained until `remove_model`, not until the worker exits.
            if let Some(entry) = inner.entries.get_mut(&spawned_model_id) {
                match result {
                    Ok((path, digest)) => {
                        entry.local_path = Some(path);
                        entry.checksum = Some(digest);
                        if entry.state != ModelState::Active {
                            entry.state = ModelState::Ready;
                        }
                    }
                    Err(_) => {
                        entry.state = ModelState::NotInstalled;
                        entry.local_path = None;
                        entry.active_path = None;
                    }
                }
                let updated = entry.clone();
                let _ = registry.persist(&inner).await;
                registry
                    .bus
                    .publish(BusEvent::metadata(spawned_model_id, updated))
                    .await;
            }
        });

        Ok(metadata)
    }

    pub async fn cancel_download(&self, model_id: &str) -> Result<()> {
        let inner = self.inner.lock().await;
        let cancel = inner
            .downloads
            .get(model_id)
            .ok_or_else(|| JarvisError::NotFound(format!("no active download for '{model_id}'")))?;
        cancel.cancel();
        Ok(())
    }

    /// The retained `ProgressRecord` for `model_id`, kept alive from
    /// `start_download` until `remove_model` regardless of whether a
    /// worker is still running — a terminal error/cancelled record must
    /// stay readable after the worker task exits. Falls back to a
    /// synthesized snapshot only for entries that predate this process
    /// (loaded from the catalogue file with no in-memory record yet).
    pub async fn get_progress(&self, model_id: &str) -> Result<ProgressRecord> {
        let inner = self.inner.lock().await;
        if let Some(record) = inner.progress.get(model_id) {
            return Ok(record.lock().await.clone());
        }
        let metadata = inner
            .entries
            .get(model_id)
            .ok_or_else(|| JarvisError::NotFound(format!("unknown model '{model_id}'")))?;
        Ok(synthesize_progress(metadata))
    }

    /// All known progress, keyed by `model_id` — the `progress` map an
    /// SSE subscriber receives in its opening snapshot.
    pub async fn progress_snapshot(&self) -> HashMap<String, ProgressRecord> {
        let inner = self.inner.lock().await;
        let mut snapshot = HashMap::with_capacity(inner.entries.len());
        for model_id in inner.entries.keys() {
            let record = match inner.progress.get(model_id) {
                Some(record) => record.lock().await.clone(),
                None => {
                    let metadata = inner.entries.get(model_id).expect("iterating entries");
                    match metadata.state {
                        ModelState::Ready | ModelState::Active => synthesize_progress(metadata),
                        _ => continue,
                    }
                }
            };
            snapshot.insert(model_id.clone(), record);
        }
        snapshot
    }

    /// Mark `model_id` as the active model. The caller (generation
    /// manager) is responsible for actually loading weights; this only
    /// updates catalogue bookkeeping once that succeeds, per the
    /// "activation flips state only after a successful load" decision.
    pub async fn activate_model(&self, model_id: &str) -> Result<ModelMetadata> {
        let mut inner = self.inner.lock().await;
        {
            let metadata = inner
                .entries
                .get(model_id)
                .ok_or_else(|| JarvisError::NotFound(format!("unknown model '{model_id}'")))?;
            if metadata.state != ModelState::Ready && metadata.state != ModelState::Active {
                return Err(JarvisError::Conflict(format!(
                    "model '{model_id}' is not ready to activate (state: {:?})",
                    metadata.state
                )));
            }
            let exists = match &metadata.local_path {
                Some(path) => path.exists(),
                None => false,
            };
            if !exists {
                return Err(JarvisError::Conflict(format!(
                    "model '{model_id}' has no artifact on disk"
                )));
            }
        }

        for (id, entry) in inner.entries.iter_mut() {
            if id == model_id {
                continue;
            }
            if entry.state == ModelState::Active {
                entry.state = ModelState::Ready;
            }
        }
        let entry = inner.entries.get_mut(model_id).expect("checked above");
        entry.state = ModelState::Active;
        entry.active_path = entry.local_path.clone();
        let updated = entry.clone();
        self.persist(&inner).await?;
        self.bus
            .publish(BusEvent::metadata(model_id.to_string(), updated.clone()))
            .await;
        Ok(updated)
    }

    /// Removes `model_id` entirely: cancels any in-flight worker, deletes
    /// the artifact directory (best-effort), and drops the catalogue
    /// entry. Returns the removed snapshot so the caller can tell
    /// whether it was ACTIVE and needs to unload the generation manager.
    pub async fn remove_model(&self, model_id: &str) -> Result<ModelMetadata> {
        let mut inner = self.inner.lock().await;
        if let Some(cancel) = inner.downloads.remove(model_id) {
            cancel.cancel();
        }
        inner.progress.remove(model_id);
        let metadata = inner
            .entries
            .remove(model_id)
            .ok_or_else(|| JarvisError::NotFound(format!("unknown model '{model_id}'")))?;
        inner.order.retain(|id| id != model_id);

        if let Some(path) = metadata.local_path.clone() {
            if let Some(dir) = path.parent() {
                if let Err(err) = tokio::fs::remove_dir_all(dir).await {
                    tracing::warn!(model_id, error = %err, "failed to remove model directory");
                }
            }
        }
        self.persist(&inner).await?;
        Ok(metadata)
    }

    pub async fn subscribe_progress(&self) -> Subscription {
        self.bus.subscribe().await
    }

    pub async fn unsubscribe_progress(&self, id: Uuid) {
        self.bus.unsubscribe(id).await;
    }

    /// Cancel all in-flight downloads; called during graceful shutdown.
    pub async fn shutdown(&self) {
        let inner = self.inner.lock().await;
        for cancel in inner.downloads.values() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Never touches the network: reports no known size and never
    /// rejects, so registry-level tests can exercise `start_download`
    /// without a live hub.
    struct StubHubClient;

    #[async_trait]
    impl HubClient for StubHubClient {
        async fn probe(&self, _repo_id: &str, _filename: &str, _hf_token: Option<&str>) -> Result<Option<u64>> {
            Ok(None)
        }
    }

    struct DenyingHubClient;

    #[async_trait]
    impl HubClient for DenyingHubClient {
        async fn probe(&self, _repo_id: &str, _filename: &str, _hf_token: Option<&str>) -> Result<Option<u64>> {
            Err(JarvisError::NotFound("no such repo".into()))
        }
    }

    async fn stub_registry(dir: &std::path::Path) -> ModelRegistry {
        ModelRegistry::load_with_hub(dir.to_path_buf(), Arc::new(StubHubClient))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_model_metadata_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = stub_registry(dir.path()).await;
        let err = registry.get_metadata("missing").await.unwrap_err();
        assert!(matches!(err, JarvisError::NotFound(_)));
    }

    #[tokio::test]
    async fn activate_requires_ready_state() {
        let dir = tempfile::tempdir().unwrap();
        let registry = stub_registry(dir.path()).await;
        registry
            .start_download(
                "demo".into(),
                "org/demo".into(),
                "model.bin".into(),
                None,
                None,
                Default::default(),
            )
            .await
            .unwrap();
        let err = registry.activate_model("demo").await.unwrap_err();
        assert!(matches!(err, JarvisError::Conflict(_)));
    }

    #[tokio::test]
    async fn catalogue_persists_across_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let registry = stub_registry(dir.path()).await;
        registry
            .start_download(
                "demo".into(),
                "org/demo".into(),
                "model.bin".into(),
                None,
                None,
                Default::default(),
            )
            .await
            .unwrap();

        let reloaded = stub_registry(dir.path()).await;
        let models = reloaded.list_models().await;
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].model_id, "demo");
    }

    #[tokio::test]
    async fn duplicate_download_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = stub_registry(dir.path()).await;
        registry
            .start_download(
                "demo".into(),
                "org/demo".into(),
                "model.bin".into(),
                None,
                None,
                Default::default(),
            )
            .await
            .unwrap();
        let err = registry
            .start_download(
                "demo".into(),
                "org/demo".into(),
                "model.bin".into(),
                None,
                None,
                Default::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JarvisError::Conflict(_)));
    }

    #[tokio::test]
    async fn probe_failure_rejects_before_any_state_change() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::load_with_hub(dir.path().to_path_buf(), Arc::new(DenyingHubClient))
            .await
            .unwrap();
        let err = registry
            .start_download(
                "demo".into(),
                "org/missing".into(),
                "model.bin".into(),
                None,
                None,
                Default::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JarvisError::NotFound(_)));
        assert!(registry.get_metadata("demo").await.is_err());
    }

    /// Regression for the "progress disappears after a failed download"
    /// bug: once the worker's `downloads` entry is gone, `get_progress`
    /// must still return the retained terminal record from `progress`,
    /// not a freshly synthesized `queued` snapshot (spec §3, §8 scenario 2).
    #[tokio::test]
    async fn get_progress_retains_terminal_record_after_worker_exits() {
        let dir = tempfile::tempdir().unwrap();
        let registry = stub_registry(dir.path()).await;
        registry
            .start_download(
                "demo".into(),
                "org/demo".into(),
                "model.bin".into(),
                None,
                None,
                Default::default(),
            )
            .await
            .unwrap();

        // Mirror what the spawned worker task does on a terminal result:
        // drop the live-worker entry but keep the progress record.
        {
            let mut inner = registry.inner.lock().await;
            inner.downloads.remove("demo");
            let record = inner.progress.get("demo").unwrap().clone();
            let mut record = record.lock().await;
            record.set_status(progress::DownloadStatus::Error);
            record.set_error("checksum mismatch".into(), 409);
        }

        let progress = registry.get_progress("demo").await.unwrap();
        assert_eq!(progress.status, progress::DownloadStatus::Error);
        assert_eq!(progress.error_code, Some(409));
    }

    #[tokio::test]
    async fn remove_unknown_model_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = stub_registry(dir.path()).await;
        let err = registry.remove_model("missing").await.unwrap_err();
        assert!(matches!(err, JarvisError::NotFound(_)));
    }
}
