//! Session repositories and session name helpers.
//!
//! `MemorySessionRepo` lives as long as the process. `FileSessionRepo` keeps
//! the same entries in a JSON file so a restart can restore them.

use crate::{SessionError, SessionRepo};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use ticker_core::{pair_key, split_pair_key};
use tokio::sync::Mutex;
use tracing::{debug, info};

const WS_PREFIX: &str = "WS";

/// Session name of a streaming subscription: `WS:FROM:TO`.
pub fn ws_session_name(from: &str, to: &str) -> String {
    format!("{}:{}", WS_PREFIX, pair_key(from, to))
}

/// Session name of a poll task: `FROM:TO`.
pub fn task_session_name(from: &str, to: &str) -> String {
    pair_key(from, to)
}

/// Parse a `WS:FROM:TO` name.
pub fn parse_ws_session_name(name: &str) -> Option<(String, String)> {
    name.strip_prefix(WS_PREFIX)
        .and_then(|rest| rest.strip_prefix(':'))
        .and_then(split_pair_key)
}

/// Parse a `FROM:TO` name. `WS:` entries are rejected.
pub fn parse_task_session_name(name: &str) -> Option<(String, String)> {
    split_pair_key(name)
}

/// Session repository kept in process memory.
#[derive(Debug, Default)]
pub struct MemorySessionRepo {
    entries: DashMap<String, u64>,
}

impl MemorySessionRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepo for MemorySessionRepo {
    async fn add_task(&self, name: &str, interval_secs: u64) -> Result<(), SessionError> {
        self.entries.insert(name.to_string(), interval_secs);
        Ok(())
    }

    async fn update_task(&self, name: &str, interval_secs: u64) -> Result<(), SessionError> {
        match self.entries.get_mut(name) {
            Some(mut entry) => {
                *entry = interval_secs;
                Ok(())
            }
            None => Err(SessionError::NotFound(name.to_string())),
        }
    }

    async fn remove_task(&self, name: &str) -> Result<(), SessionError> {
        self.entries.remove(name);
        Ok(())
    }

    async fn get_session(&self) -> Result<HashMap<String, u64>, SessionError> {
        Ok(self
            .entries
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect())
    }
}

/// Session repository backed by a JSON object of `name -> interval_secs`.
///
/// Every change rewrites the file through a temporary sibling and a rename.
#[derive(Debug)]
pub struct FileSessionRepo {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, u64>>,
}

impl FileSessionRepo {
    /// Open the file at `path`. A missing file is an empty session.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                SessionError::Backend(format!("{}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No session file at {}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(e) => return Err(SessionError::Backend(format!("{}: {}", path.display(), e))),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self, entries: &BTreeMap<String, u64>) -> Result<(), SessionError> {
        let backend = |e: &dyn std::fmt::Display| {
            SessionError::Backend(format!("{}: {}", self.path.display(), e))
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| backend(&e))?;
        }
        let json = serde_json::to_string_pretty(entries).map_err(|e| backend(&e))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await.map_err(|e| backend(&e))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| backend(&e))?;

        debug!("Saved {} session entries to {}", entries.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl SessionRepo for FileSessionRepo {
    async fn add_task(&self, name: &str, interval_secs: u64) -> Result<(), SessionError> {
        let mut entries = self.entries.lock().await;
        if entries.get(name) == Some(&interval_secs) {
            return Ok(());
        }
        entries.insert(name.to_string(), interval_secs);
        self.save(&entries).await
    }

    async fn update_task(&self, name: &str, interval_secs: u64) -> Result<(), SessionError> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(name) {
            Some(entry) => *entry = interval_secs,
            None => return Err(SessionError::NotFound(name.to_string())),
        }
        self.save(&entries).await
    }

    async fn remove_task(&self, name: &str) -> Result<(), SessionError> {
        let mut entries = self.entries.lock().await;
        if entries.remove(name).is_none() {
            return Ok(());
        }
        self.save(&entries).await
    }

    async fn get_session(&self) -> Result<HashMap<String, u64>, SessionError> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .map(|(name, interval)| (name.clone(), *interval))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_session_names() {
        assert_eq!(ws_session_name("btc", "usd"), "WS:BTC:USD");
        assert_eq!(task_session_name("eth", "eur"), "ETH:EUR");

        assert_eq!(
            parse_ws_session_name("WS:BTC:USD"),
            Some(("BTC".to_string(), "USD".to_string()))
        );
        assert_eq!(parse_ws_session_name("BTC:USD"), None);
        assert_eq!(parse_task_session_name("WS:BTC:USD"), None);
        assert_eq!(
            parse_task_session_name("ETH:EUR"),
            Some(("ETH".to_string(), "EUR".to_string()))
        );
    }

    #[tokio::test]
    async fn test_memory_session_repo() {
        let repo = MemorySessionRepo::new();
        repo.add_task("BTC:USD", 60).await.unwrap();
        repo.add_task("WS:ETH:USD", 0).await.unwrap();
        repo.update_task("BTC:USD", 15).await.unwrap();
        assert!(repo.update_task("XRP:USD", 15).await.is_err());

        let session = repo.get_session().await.unwrap();
        assert_eq!(session.get("BTC:USD"), Some(&15));
        assert_eq!(session.len(), 2);

        repo.remove_task("WS:ETH:USD").await.unwrap();
        assert_eq!(repo.get_session().await.unwrap().len(), 1);
    }

    fn temp_session_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("ticker-session-{}", std::process::id()))
            .join(format!("{}.json", name))
    }

    #[tokio::test]
    async fn test_file_session_repo_survives_reopen() {
        let path = temp_session_path("reopen");
        let _ = tokio::fs::remove_file(&path).await;

        let repo = FileSessionRepo::open(&path).await.unwrap();
        assert!(repo.get_session().await.unwrap().is_empty());
        repo.add_task("BTC:USD", 60).await.unwrap();
        repo.add_task("WS:ETH:USD", 0).await.unwrap();
        repo.add_task("XRP:EUR", 5).await.unwrap();
        repo.update_task("BTC:USD", 15).await.unwrap();
        repo.remove_task("XRP:EUR").await.unwrap();
        assert!(matches!(
            repo.update_task("LTC:USD", 1).await,
            Err(SessionError::NotFound(name)) if name == "LTC:USD"
        ));
        drop(repo);

        let reopened = FileSessionRepo::open(&path).await.unwrap();
        let session = reopened.get_session().await.unwrap();
        assert_eq!(session.len(), 2);
        assert_eq!(session.get("BTC:USD"), Some(&15));
        assert_eq!(session.get("WS:ETH:USD"), Some(&0));

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_file_session_repo_rejects_corrupt_file() {
        let path = temp_session_path("corrupt");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, "not json").await.unwrap();

        let err = FileSessionRepo::open(&path).await.unwrap_err();
        assert!(matches!(err, SessionError::Backend(_)));

        let _ = tokio::fs::remove_file(&path).await;
    }
}
