//! Per-session credential directories and their teardown.
//!
//! Each session owns `<root>/<agent>/`. Credentials live in `creds.json`.
//! Wiping a directory is retried because the protocol library may still hold
//! file handles for a short while after logout.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::client::Credentials;
use crate::error::SessionError;

const CREDS_FILE: &str = "creds.json";
const MAX_AGENT_ID_LEN: usize = 64;

/// Filesystem operations used by [`AuthStore::wipe`].
#[async_trait]
pub trait DirOps: Send + Sync {
    async fn exists(&self, path: &Path) -> bool;
    async fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()>;
    async fn remove_dir_all(&self, path: &Path) -> std::io::Result<()>;
    /// Entries of `path` with an is-directory flag.
    async fn read_dir(&self, path: &Path) -> std::io::Result<Vec<(PathBuf, bool)>>;
    async fn remove_file(&self, path: &Path) -> std::io::Result<()>;
    async fn remove_dir(&self, path: &Path) -> std::io::Result<()>;
}

pub struct TokioFs;

#[async_trait]
impl DirOps for TokioFs {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn remove_dir_all(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::remove_dir_all(path).await
    }

    async fn read_dir(&self, path: &Path) -> std::io::Result<Vec<(PathBuf, bool)>> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            out.push((entry.path(), is_dir));
        }
        Ok(out)
    }

    async fn remove_file(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn remove_dir(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::remove_dir(path).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WipeTimings {
    /// Attempt `n` (0-based) waits `retry_base * (n + 1)` after failing.
    pub retry_base: Duration,
    pub attempts: u32,
}

impl Default for WipeTimings {
    fn default() -> Self {
        Self {
            retry_base: Duration::from_millis(200),
            attempts: 6,
        }
    }
}

/// How a wipe got rid of the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WipeStrategy {
    #[serde(rename = "skip")]
    Skipped,
    #[serde(rename = "rm-renamed")]
    RenamedRemoved,
    #[serde(rename = "rm-renamed-fallback")]
    RenamedEntryByEntry,
    #[serde(rename = "rm-direct")]
    DirectRemoved,
    #[serde(rename = "rm-direct-fallback")]
    DirectEntryByEntry,
}

impl WipeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            WipeStrategy::Skipped => "skip",
            WipeStrategy::RenamedRemoved => "rm-renamed",
            WipeStrategy::RenamedEntryByEntry => "rm-renamed-fallback",
            WipeStrategy::DirectRemoved => "rm-direct",
            WipeStrategy::DirectEntryByEntry => "rm-direct-fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WipeOutcome {
    pub strategy: WipeStrategy,
    pub path: PathBuf,
}

/// Diagnostic view of a session's credential directory.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthDirInfo {
    pub agent: String,
    pub auth_dir: PathBuf,
    pub exists: bool,
    pub files: Vec<String>,
}

/// Session ids become directory names, so keep them boring.
pub fn validate_agent_id(agent: &str) -> Result<(), SessionError> {
    let ok = !agent.is_empty()
        && agent.len() <= MAX_AGENT_ID_LEN
        && agent
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(SessionError::InvalidAgentId(agent.to_string()))
    }
}

#[derive(Clone)]
pub struct AuthStore {
    root: PathBuf,
    ops: Arc<dyn DirOps>,
    timings: WipeTimings,
}

impl AuthStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_ops(root, Arc::new(TokioFs), WipeTimings::default())
    }

    pub fn with_ops(root: impl Into<PathBuf>, ops: Arc<dyn DirOps>, timings: WipeTimings) -> Self {
        Self {
            root: root.into(),
            ops,
            timings,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, agent: &str) -> PathBuf {
        self.root.join(agent)
    }

    pub async fn ensure(&self, agent: &str) -> Result<PathBuf, SessionError> {
        let dir = self.dir(agent);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Stored credentials, or `None` when absent or unreadable.
    pub async fn load(&self, agent: &str) -> Option<Credentials> {
        let path = self.dir(agent).join(CREDS_FILE);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Could not read {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(creds) => Some(creds),
            Err(e) => {
                warn!("Ignoring corrupt credentials at {}: {}", path.display(), e);
                None
            }
        }
    }

    pub async fn save(&self, agent: &str, creds: &Credentials) -> Result<(), SessionError> {
        let dir = self.ensure(agent).await?;
        let tmp = dir.join(format!("{}.tmp", CREDS_FILE));
        let bytes = serde_json::to_vec_pretty(creds)
            .map_err(|e| SessionError::Io(std::io::Error::other(e)))?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, dir.join(CREDS_FILE)).await?;
        debug!("Saved credentials for {}", agent);
        Ok(())
    }

    pub async fn describe(&self, agent: &str) -> AuthDirInfo {
        let auth_dir = self.dir(agent);
        let exists = self.ops.exists(&auth_dir).await;
        let mut files: Vec<String> = if exists {
            self.ops
                .read_dir(&auth_dir)
                .await
                .unwrap_or_default()
                .into_iter()
                .filter_map(|(p, _)| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .collect()
        } else {
            Vec::new()
        };
        files.sort();
        AuthDirInfo {
            agent: agent.to_string(),
            auth_dir,
            exists,
            files,
        }
    }

    /// Remove the agent's directory entirely.
    ///
    /// The directory is first renamed aside so a fresh one can be created
    /// immediately, then removed with retries. If everything fails the
    /// directory is left in place and an error naming the last step returned.
    pub async fn wipe(&self, agent: &str) -> Result<WipeOutcome, SessionError> {
        let dir = self.dir(agent);
        if !self.ops.exists(&dir).await {
            debug!("No auth dir for {}, nothing to wipe", agent);
            return Ok(WipeOutcome {
                strategy: WipeStrategy::Skipped,
                path: dir,
            });
        }

        let tomb = tombstone_path(&dir);
        let outcome = match self.ops.rename(&dir, &tomb).await {
            Ok(()) => {
                if self.remove_with_retries(&tomb).await {
                    WipeStrategy::RenamedRemoved
                } else if self.remove_entries(&tomb).await {
                    WipeStrategy::RenamedEntryByEntry
                } else {
                    return Err(SessionError::AuthTeardown {
                        step: WipeStrategy::RenamedEntryByEntry.as_str(),
                    });
                }
            }
            Err(e) => {
                warn!("Could not rename {} aside: {}", dir.display(), e);
                if self.remove_with_retries(&dir).await {
                    WipeStrategy::DirectRemoved
                } else if self.remove_entries(&dir).await {
                    WipeStrategy::DirectEntryByEntry
                } else {
                    return Err(SessionError::AuthTeardown {
                        step: WipeStrategy::DirectEntryByEntry.as_str(),
                    });
                }
            }
        };

        info!("Wiped auth dir for {} ({})", agent, outcome.as_str());
        Ok(WipeOutcome {
            strategy: outcome,
            path: dir,
        })
    }

    async fn remove_with_retries(&self, path: &Path) -> bool {
        for attempt in 0..self.timings.attempts {
            match self.ops.remove_dir_all(path).await {
                Ok(()) => return true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
                Err(e) => {
                    debug!(
                        "Remove of {} failed (attempt {}): {}",
                        path.display(),
                        attempt + 1,
                        e
                    );
                    tokio::time::sleep(self.timings.retry_base * (attempt + 1)).await;
                }
            }
        }
        false
    }

    /// Delete every entry, then the directory itself.
    async fn remove_entries(&self, path: &Path) -> bool {
        let entries = match self.ops.read_dir(path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
            Err(e) => {
                warn!("Could not list {}: {}", path.display(), e);
                return false;
            }
        };
        for (entry, is_dir) in entries {
            let result = if is_dir {
                self.ops.remove_dir_all(&entry).await
            } else {
                self.ops.remove_file(&entry).await
            };
            if let Err(e) = result {
                warn!("Could not remove {}: {}", entry.display(), e);
            }
        }
        match self.ops.remove_dir(path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!("Could not remove {}: {}", path.display(), e);
                false
            }
        }
    }
}

fn tombstone_path(dir: &Path) -> PathBuf {
    let mut name = dir.as_os_str().to_owned();
    name.push(format!(".old-{}", chrono::Utc::now().timestamp_millis()));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> WipeTimings {
        WipeTimings {
            retry_base: Duration::from_millis(1),
            attempts: 6,
        }
    }

    /// Real filesystem, but `remove_dir_all` fails the first `failures` times.
    struct FlakyFs {
        failures: AtomicU32,
    }

    #[async_trait]
    impl DirOps for FlakyFs {
        async fn exists(&self, path: &Path) -> bool {
            TokioFs.exists(path).await
        }
        async fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()> {
            TokioFs.rename(from, to).await
        }
        async fn remove_dir_all(&self, path: &Path) -> std::io::Result<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(std::io::Error::other("busy"));
            }
            TokioFs.remove_dir_all(path).await
        }
        async fn read_dir(&self, path: &Path) -> std::io::Result<Vec<(PathBuf, bool)>> {
            TokioFs.read_dir(path).await
        }
        async fn remove_file(&self, path: &Path) -> std::io::Result<()> {
            TokioFs.remove_file(path).await
        }
        async fn remove_dir(&self, path: &Path) -> std::io::Result<()> {
            TokioFs.remove_dir(path).await
        }
    }

    /// Every mutating operation fails.
    struct StuckFs;

    #[async_trait]
    impl DirOps for StuckFs {
        async fn exists(&self, _path: &Path) -> bool {
            true
        }
        async fn rename(&self, _from: &Path, _to: &Path) -> std::io::Result<()> {
            Err(std::io::Error::other("locked"))
        }
        async fn remove_dir_all(&self, _path: &Path) -> std::io::Result<()> {
            Err(std::io::Error::other("locked"))
        }
        async fn read_dir(&self, _path: &Path) -> std::io::Result<Vec<(PathBuf, bool)>> {
            Err(std::io::Error::other("locked"))
        }
        async fn remove_file(&self, _path: &Path) -> std::io::Result<()> {
            Err(std::io::Error::other("locked"))
        }
        async fn remove_dir(&self, _path: &Path) -> std::io::Result<()> {
            Err(std::io::Error::other("locked"))
        }
    }

    async fn seeded(store: &AuthStore) -> PathBuf {
        let dir = store.ensure("default").await.unwrap();
        tokio::fs::write(dir.join("creds.json"), "{}").await.unwrap();
        tokio::fs::create_dir_all(dir.join("keys")).await.unwrap();
        tokio::fs::write(dir.join("keys/k1.json"), "{}").await.unwrap();
        dir
    }

    fn leftovers(root: &Path) -> Vec<String> {
        std::fs::read_dir(root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_wipe_missing_dir_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AuthStore::with_ops(tmp.path(), Arc::new(TokioFs), fast());
        let outcome = store.wipe("default").await.unwrap();
        assert_eq!(outcome.strategy, WipeStrategy::Skipped);
    }

    #[tokio::test]
    async fn test_wipe_removes_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AuthStore::with_ops(tmp.path(), Arc::new(TokioFs), fast());
        let dir = seeded(&store).await;
        let outcome = store.wipe("default").await.unwrap();
        assert_eq!(outcome.strategy, WipeStrategy::RenamedRemoved);
        assert!(!dir.exists());
        assert!(leftovers(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_wipe_retries_transient_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let ops = Arc::new(FlakyFs {
            failures: AtomicU32::new(3),
        });
        let store = AuthStore::with_ops(tmp.path(), ops, fast());
        let dir = seeded(&store).await;
        let outcome = store.wipe("default").await.unwrap();
        assert_eq!(outcome.strategy, WipeStrategy::RenamedRemoved);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_wipe_falls_back_to_entry_by_entry() {
        let tmp = tempfile::tempdir().unwrap();
        // Every bulk removal attempt fails; the per-entry pass then succeeds.
        let ops = Arc::new(FlakyFs {
            failures: AtomicU32::new(6),
        });
        let store = AuthStore::with_ops(tmp.path(), ops, fast());
        let dir = seeded(&store).await;
        let outcome = store.wipe("default").await.unwrap();
        assert_eq!(outcome.strategy, WipeStrategy::RenamedEntryByEntry);
        assert!(!dir.exists());
        assert!(leftovers(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_wipe_reports_failure_without_panicking() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AuthStore::with_ops(tmp.path(), Arc::new(StuckFs), fast());
        let err = store.wipe("default").await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::AuthTeardown {
                step: "rm-direct-fallback"
            }
        ));
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AuthStore::new(tmp.path());
        assert!(store.load("a").await.is_none());
        store
            .save("a", &serde_json::json!({"me": {"id": "1"}}))
            .await
            .unwrap();
        let creds = store.load("a").await.unwrap();
        assert_eq!(creds["me"]["id"], "1");
    }

    #[tokio::test]
    async fn test_load_corrupt_credentials_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AuthStore::new(tmp.path());
        let dir = store.ensure("a").await.unwrap();
        tokio::fs::write(dir.join("creds.json"), "{nope").await.unwrap();
        assert!(store.load("a").await.is_none());
    }

    #[tokio::test]
    async fn test_describe_lists_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AuthStore::new(tmp.path());
        let info = store.describe("default").await;
        assert!(!info.exists);
        seeded(&store).await;
        let info = store.describe("default").await;
        assert!(info.exists);
        assert_eq!(info.files, vec!["creds.json", "keys"]);
    }

    #[test]
    fn test_validate_agent_id() {
        assert!(validate_agent_id("default").is_ok());
        assert!(validate_agent_id("sales_team-2").is_ok());
        assert!(validate_agent_id("").is_err());
        assert!(validate_agent_id("../etc").is_err());
        assert!(validate_agent_id("a b").is_err());
        assert!(validate_agent_id(&"x".repeat(65)).is_err());
    }
}
