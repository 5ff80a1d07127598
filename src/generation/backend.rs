//! Backend capability trait: the discriminant between TRANSFORMERS and
//! GGUF is a pure function of filename extension and tag set,
//! dispatching to a small trait boundary so the actual inference
//! runtime can be swapped in behind it.
//!
//! The inference kernels themselves are out of scope here; both
//! implementations below are deterministic stand-ins that transform
//! the prompt rather than running a real model.

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackendKind {
    Transformers,
    Gguf,
}

impl BackendKind {
    /// `.gguf` extension or a `"gguf"` tag selects the GGUF loader;
    /// everything else uses the transformers loader.
    pub fn resolve(filename: &Path, tags: &BTreeSet<String>) -> Self {
        let has_gguf_extension = filename
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("gguf"))
            .unwrap_or(false);
        if has_gguf_extension || tags.contains("gguf") {
            BackendKind::Gguf
        } else {
            BackendKind::Transformers
        }
    }
}

/// A forward-only async sequence of text chunks, terminated by the
/// channel closing.
pub type ChunkStream = mpsc::Receiver<String>;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Load the artifact at `path`. Runs on a worker thread by the
    /// caller; implementations should treat this as blocking.
    async fn load(&mut self, path: &Path) -> crate::error::Result<()>;

    /// Release any resources held by a previously loaded model.
    /// Idempotent.
    async fn unload(&mut self);

    /// Blocking completion: returns the full generated text for `prompt`.
    async fn complete(&self, prompt: &str, max_new_tokens: usize) -> crate::error::Result<String>;

    /// Streaming completion: spawns production of chunks onto the
    /// returned channel.
    async fn stream(&self, prompt: &str, max_new_tokens: usize) -> crate::error::Result<ChunkStream>;
}

/// Deterministic stand-in for a HF-transformers-style backend: echoes
/// the prompt's last line back, word-wrapped into streaming chunks.
#[derive(Default)]
pub struct TransformersBackend {
    loaded: bool,
}

#[async_trait]
impl Backend for TransformersBackend {
    async fn load(&mut self, _path: &Path) -> crate::error::Result<()> {
        self.loaded = true;
        Ok(())
    }

    async fn unload(&mut self) {
        self.loaded = false;
    }

    async fn complete(&self, prompt: &str, max_new_tokens: usize) -> crate::error::Result<String> {
        Ok(stand_in_response(prompt, max_new_tokens))
    }

    async fn stream(&self, prompt: &str, max_new_tokens: usize) -> crate::error::Result<ChunkStream> {
        spawn_word_stream(stand_in_response(prompt, max_new_tokens))
    }
}

/// Deterministic stand-in for a quantised GGUF backend. Differs from
/// `TransformersBackend` only in its response prefix, so tests can
/// assert the correct loader was selected.
#[derive(Default)]
pub struct GgufBackend {
    loaded: bool,
}

#[async_trait]
impl Backend for GgufBackend {
    async fn load(&mut self, _path: &Path) -> crate::error::Result<()> {
        self.loaded = true;
        Ok(())
    }

    async fn unload(&mut self) {
        self.loaded = false;
    }

    async fn complete(&self, prompt: &str, max_new_tokens: usize) -> crate::error::Result<String> {
        Ok(format!("[gguf] {}", stand_in_response(prompt, max_new_tokens)))
    }

    async fn stream(&self, prompt: &str, max_new_tokens: usize) -> crate::error::Result<ChunkStream> {
        spawn_word_stream(format!("[gguf] {}", stand_in_response(prompt, max_new_tokens)))
    }
}

fn stand_in_response(prompt: &str, max_new_tokens: usize) -> String {
    let last_line = prompt.lines().last().unwrap_or(prompt);
    let truncated: String = last_line.chars().take(max_new_tokens.max(1) * 8).collect();
    format!("Acknowledged: {truncated}")
}

fn spawn_word_stream(text: String) -> crate::error::Result<ChunkStream> {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        for word in text.split_inclusive(' ') {
            if tx.send(word.to_string()).await.is_err() {
                return;
            }
        }
    });
    Ok(rx)
}

pub fn make_backend(kind: BackendKind) -> Box<dyn Backend> {
    match kind {
        BackendKind::Transformers => Box::new(TransformersBackend::default()),
        BackendKind::Gguf => Box::new(GgufBackend::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gguf_extension_selects_gguf_backend() {
        let kind = BackendKind::resolve(Path::new("model.gguf"), &BTreeSet::new());
        assert_eq!(kind, BackendKind::Gguf);
    }

    #[test]
    fn gguf_tag_selects_gguf_backend() {
        let mut tags = BTreeSet::new();
        tags.insert("gguf".to_string());
        let kind = BackendKind::resolve(Path::new("model.bin"), &tags);
        assert_eq!(kind, BackendKind::Gguf);
    }

    #[test]
    fn default_is_transformers() {
        let kind = BackendKind::resolve(Path::new("model.safetensors"), &BTreeSet::new());
        assert_eq!(kind, BackendKind::Transformers);
    }

    #[tokio::test]
    async fn stream_yields_chunks_terminated_by_close() {
        let backend = TransformersBackend::default();
        let mut stream = backend.stream("hello world", 16).await.unwrap();
        let mut collected = String::new();
        while let Some(chunk) = stream.recv().await {
            collected.push_str(&chunk);
        }
        assert!(collected.starts_with("Acknowledged:"));
    }
}
