//! Sandboxed action surface: resolves caller-supplied paths against an
//! allow-list of roots under symlink-safe canonicalisation, and runs
//! bounded subprocesses.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::error::{JarvisError, Result};

const MAX_DIR_ENTRIES: usize = 200;
const DEFAULT_MAX_READ_BYTES: usize = 65_536;
const MAX_OUTPUT_BYTES: usize = 65_536;
const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(60);

/// The canonical directories within which sandboxed operations are
/// permitted, computed once at startup.
#[derive(Debug, Clone)]
pub struct Sandbox {
    roots: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DirEntryKind {
    Directory,
    File,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub kind: DirEntryKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub size: u64,
    pub modified: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OpenResult {
    Directory { entries: Vec<DirEntryInfo> },
    File(FileInfo),
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadResult {
    pub content: String,
    pub encoding: String,
    pub offset: u64,
    pub length: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub command: String,
    pub cwd: PathBuf,
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Either an argv list or a shell string, as accepted by `POST /actions/run`.
pub enum CommandSpec {
    Argv(Vec<String>),
    Shell(String),
}

pub struct ReadOptions {
    pub encoding: String,
    pub offset: u64,
    pub length: Option<usize>,
    pub max_bytes: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            encoding: "utf-8".to_string(),
            offset: 0,
            length: None,
            max_bytes: DEFAULT_MAX_READ_BYTES,
        }
    }
}

pub struct RunOptions {
    pub cwd: Option<String>,
    pub timeout: Duration,
    pub shell: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            timeout: DEFAULT_RUN_TIMEOUT,
            shell: false,
        }
    }
}

impl Sandbox {
    /// Roots are canonicalised eagerly; a root that does not exist is
    /// dropped rather than causing startup to fail.
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        let roots = roots
            .into_iter()
            .filter_map(|root| std::fs::canonicalize(&root).ok())
            .collect();
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Resolves `path` against the allow-list: relative paths are
    /// joined onto each root in order; the first candidate whose
    /// canonical form lies within that root wins. Absolute paths are
    /// canonicalised directly and must still lie within some root.
    ///
    /// A relative path never falls through to a bare canonicalisation
    /// against the process's working directory — that would resolve
    /// against a directory that may not be a root at all (or silently
    /// re-admit a candidate this loop already rejected, if it is). If
    /// any root's candidate canonicalises to somewhere outside that
    /// root (a symlink escaping the sandbox), the whole lookup fails
    /// `Authorization`; only when no root produces a candidate at all
    /// (the path truly doesn't exist anywhere) does it fail `NotFound`.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let requested = Path::new(path);

        if requested.is_relative() {
            let mut escaped = false;
            for root in &self.roots {
                let candidate = root.join(requested);
                match std::fs::canonicalize(&candidate) {
                    Ok(canonical) if canonical.starts_with(root) => return Ok(canonical),
                    Ok(_) => escaped = true,
                    Err(_) => {}
                }
            }
            return Err(if escaped {
                JarvisError::Authorization(format!("path '{path}' is outside the sandboxed roots"))
            } else {
                JarvisError::NotFound(format!("path not found: {path}"))
            });
        }

        let canonical = std::fs::canonicalize(requested)
            .map_err(|_| JarvisError::NotFound(format!("path not found: {path}")))?;
        if self.roots.iter().any(|root| canonical.starts_with(root)) {
            return Ok(canonical);
        }

        Err(JarvisError::Authorization(format!(
            "path '{path}' is outside the sandboxed roots"
        )))
    }

    pub async fn open(&self, path: &str) -> Result<OpenResult> {
        let resolved = self.resolve(path)?;
        let metadata = tokio::fs::metadata(&resolved)
            .await
            .map_err(|_| JarvisError::NotFound(format!("path not found: {path}")))?;

        if metadata.is_dir() {
            let mut entries = Vec::new();
            let mut reader = tokio::fs::read_dir(&resolved)
                .await
                .map_err(|e| JarvisError::Validation(format!("failed to list directory: {e}")))?;
            while let Some(entry) = reader
                .next_entry()
                .await
                .map_err(|e| JarvisError::Validation(format!("failed to read entry: {e}")))?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| JarvisError::Validation(format!("failed to stat entry: {e}")))?;
                entries.push(DirEntryInfo {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    path: entry.path(),
                    kind: if file_type.is_dir() {
                        DirEntryKind::Directory
                    } else {
                        DirEntryKind::File
                    },
                });
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            entries.truncate(MAX_DIR_ENTRIES);
            Ok(OpenResult::Directory { entries })
        } else {
            let modified = metadata
                .modified()
                .ok()
                .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|duration| chrono::DateTime::from_timestamp(duration.as_secs() as i64, 0))
                .flatten()
                .map(|dt| dt.to_rfc3339());
            Ok(OpenResult::File(FileInfo {
                size: metadata.len(),
                modified,
            }))
        }
    }

    pub async fn read(&self, path: &str, options: ReadOptions) -> Result<ReadResult> {
        if !options.encoding.eq_ignore_ascii_case("utf-8") {
            return Err(JarvisError::Validation(format!(
                "unsupported encoding '{}'",
                options.encoding
            )));
        }

        let resolved = self.resolve(path)?;
        let metadata = tokio::fs::metadata(&resolved)
            .await
            .map_err(|_| JarvisError::NotFound(format!("path not found: {path}")))?;
        if metadata.is_dir() {
            return Err(JarvisError::Validation(format!("'{path}' is a directory")));
        }

        let mut file = tokio::fs::File::open(&resolved)
            .await
            .map_err(|e| JarvisError::Validation(format!("failed to open {path}: {e}")))?;
        file.seek_to(options.offset)
            .await
            .map_err(|e| JarvisError::Validation(format!("failed to seek: {e}")))?;

        let want = options.length.unwrap_or(options.max_bytes).min(options.max_bytes);
        let mut buffer = vec![0u8; want];
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|e| JarvisError::Validation(format!("read error: {e}")))?;
        buffer.truncate(read);

        Ok(ReadResult {
            content: String::from_utf8_lossy(&buffer).into_owned(),
            encoding: "utf-8".to_string(),
            offset: options.offset,
            length: read,
        })
    }

    pub async fn run(&self, command: CommandSpec, options: RunOptions) -> Result<RunResult> {
        let cwd = match &options.cwd {
            Some(path) => self.resolve(path)?,
            None => self
                .roots
                .first()
                .cloned()
                .ok_or_else(|| JarvisError::Internal("sandbox has no configured roots".to_string()))?,
        };

        let (mut child_command, display) = match &command {
            CommandSpec::Argv(parts) => {
                if parts.is_empty() || parts.iter().any(|p| p.is_empty()) {
                    return Err(JarvisError::Validation("command list must be non-empty strings".to_string()));
                }
                if options.shell {
                    let quoted = shell_words::join(parts.iter().map(String::as_str));
                    (shell_command(&quoted), quoted)
                } else {
                    let mut cmd = Command::new(&parts[0]);
                    cmd.args(&parts[1..]);
                    (cmd, parts.join(" "))
                }
            }
            CommandSpec::Shell(text) => {
                if text.trim().is_empty() {
                    return Err(JarvisError::Validation("command string must be non-empty".to_string()));
                }
                (shell_command(text), text.clone())
            }
        };

        child_command
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Make the child its own process group leader so a timeout can
        // reap the whole tree, not just the direct child — matters for
        // the shell path (`sh -c "<cmd>"`), where the actual command is
        // a grandchild of the killed shell.
        #[cfg(unix)]
        child_command.process_group(0);

        let mut child = child_command
            .spawn()
            .map_err(|e| JarvisError::Validation(format!("failed to spawn command: {e}")))?;

        let mut stdout_pipe = child.stdout.take().expect("stdout piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr piped");

        let wait = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let (_, _, status) = tokio::join!(
                stdout_pipe.read_to_end(&mut stdout),
                stderr_pipe.read_to_end(&mut stderr),
                child.wait(),
            );
            (stdout, stderr, status)
        };

        match tokio::time::timeout(options.timeout, wait).await {
            Ok((stdout, stderr, status)) => {
                let status = status.map_err(|e| JarvisError::Internal(format!("wait failed: {e}")))?;
                Ok(RunResult {
                    command: display,
                    cwd,
                    returncode: status.code().unwrap_or(-1),
                    stdout: truncate_utf8_lossy(&stdout, MAX_OUTPUT_BYTES),
                    stderr: truncate_utf8_lossy(&stderr, MAX_OUTPUT_BYTES),
                })
            }
            Err(_) => {
                kill_process_tree(&mut child);
                let _ = child.wait().await;
                Err(JarvisError::Timeout)
            }
        }
    }
}

/// Kills a timed-out child. On Unix the child was spawned as the leader
/// of its own process group (see `process_group(0)` above), so signalling
/// the negated pid reaches the whole group — the shell and whatever it
/// exec'd — instead of leaving the grandchild running after the shell
/// dies. Falls back to killing just the direct child elsewhere.
#[cfg(unix)]
fn kill_process_tree(child: &mut tokio::process::Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    } else {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut tokio::process::Child) {
    let _ = child.start_kill();
}

fn shell_command(text: &str) -> Command {
    if cfg!(target_os = "windows") {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", text]);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", text]);
        cmd
    }
}

fn truncate_utf8_lossy(bytes: &[u8], max: usize) -> String {
    let slice = if bytes.len() > max { &bytes[..max] } else { bytes };
    String::from_utf8_lossy(slice).into_owned()
}

trait SeekExt {
    fn seek_to(&mut self, offset: u64) -> impl std::future::Future<Output = std::io::Result<u64>> + Send;
}

impl SeekExt for tokio::fs::File {
    async fn seek_to(&mut self, offset: u64) -> std::io::Result<u64> {
        use tokio::io::AsyncSeekExt;
        self.seek(std::io::SeekFrom::Start(offset)).await
    }
}
