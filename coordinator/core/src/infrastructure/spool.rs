// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Filesystem Spool
//!
//! Write-ahead log of action and command transitions. Every item is one JSON
//! document and its lifecycle stage is the directory it sits in:
//!
//! ```text
//! <spool>/action/{new,inflight,done,invalid}/<action id>.json
//! <spool>/command/{inflight,returned}/<action id>-<command id>.json
//! ```
//!
//! **Delivery contract:**
//! The spool is at-least-once. A crash between writing the destination and
//! removing the origin leaves the item in both places; reprocessing is safe
//! because every store write is an idempotent upsert keyed by id.
//!
//! **Atomicity:**
//! Writes land in a scratch file first and are renamed into place, so a
//! watcher never observes a partially written document. A document still
//! empty after a few polls is treated as corrupt and deleted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::domain::action::Action;
use crate::domain::command::Command;
use crate::domain::id::IdGenerator;

/// Suffix given to documents that could not be parsed.
pub const FAIL_SUFFIX: &str = ".fail";

const EMPTY_FILE_RETRIES: u32 = 3;
const EMPTY_FILE_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpoolDir {
    ActionNew,
    ActionInflight,
    ActionDone,
    ActionInvalid,
    CommandInflight,
    CommandReturned,
}

impl SpoolDir {
    pub const ALL: [SpoolDir; 6] = [
        SpoolDir::ActionNew,
        SpoolDir::ActionInflight,
        SpoolDir::ActionDone,
        SpoolDir::ActionInvalid,
        SpoolDir::CommandInflight,
        SpoolDir::CommandReturned,
    ];

    fn relative(&self) -> &'static str {
        match self {
            SpoolDir::ActionNew => "action/new",
            SpoolDir::ActionInflight => "action/inflight",
            SpoolDir::ActionDone => "action/done",
            SpoolDir::ActionInvalid => "action/invalid",
            SpoolDir::CommandInflight => "command/inflight",
            SpoolDir::CommandReturned => "command/returned",
        }
    }
}

/// A document found while listing a spool directory.
#[derive(Debug, Clone)]
pub struct SpoolEntry {
    pub path: PathBuf,
    pub modified: SystemTime,
}

pub struct Spool {
    root: PathBuf,
    tmp: PathBuf,
    ids: Arc<dyn IdGenerator>,
}

impl Spool {
    /// Opens the spool, creating every stage directory.
    pub async fn open(
        root: impl Into<PathBuf>,
        tmp: impl Into<PathBuf>,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<Self, SpoolError> {
        let spool = Self {
            root: root.into(),
            tmp: tmp.into(),
            ids,
        };
        for dir in SpoolDir::ALL {
            let path = spool.dir(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| SpoolError::io(&path, e))?;
        }
        tokio::fs::create_dir_all(&spool.tmp)
            .await
            .map_err(|e| SpoolError::io(&spool.tmp, e))?;
        Ok(spool)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, dir: SpoolDir) -> PathBuf {
        self.root.join(dir.relative())
    }

    pub fn action_path(&self, dir: SpoolDir, action: &Action) -> PathBuf {
        self.dir(dir).join(format!("{}.json", action.id))
    }

    pub fn command_path(&self, dir: SpoolDir, command: &Command) -> PathBuf {
        self.dir(dir).join(command.file_name())
    }

    /// Writes `data` to `dest` through a scratch file and an atomic rename.
    pub async fn safe_write(&self, dest: &Path, data: &[u8]) -> Result<(), SpoolError> {
        if data.is_empty() {
            return Err(SpoolError::EmptyData(dest.to_path_buf()));
        }
        let scratch = self.tmp.join(format!("{}", self.ids.next_id()));
        tokio::fs::write(&scratch, data)
            .await
            .map_err(|e| SpoolError::io(&scratch, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&scratch, std::fs::Permissions::from_mode(0o640))
                .await
                .map_err(|e| SpoolError::io(&scratch, e))?;
        }
        if let Err(e) = tokio::fs::rename(&scratch, dest).await {
            let _ = tokio::fs::remove_file(&scratch).await;
            return Err(SpoolError::io(dest, e));
        }
        Ok(())
    }

    pub async fn write_action(&self, dir: SpoolDir, action: &Action) -> Result<PathBuf, SpoolError> {
        let data = serde_json::to_vec(action)?;
        let dest = self.action_path(dir, action);
        self.safe_write(&dest, &data).await?;
        Ok(dest)
    }

    pub async fn write_command(&self, dir: SpoolDir, command: &Command) -> Result<PathBuf, SpoolError> {
        let data = serde_json::to_vec(command)?;
        let dest = self.command_path(dir, command);
        self.safe_write(&dest, &data).await?;
        Ok(dest)
    }

    /// Reads a document, giving a writer that is still mid-flight a few
    /// polls to finish. A file that stays empty is deleted.
    pub async fn read(&self, path: &Path) -> Result<Vec<u8>, SpoolError> {
        for attempt in 0..EMPTY_FILE_RETRIES {
            let data = tokio::fs::read(path)
                .await
                .map_err(|e| SpoolError::io(path, e))?;
            if !data.is_empty() {
                return Ok(data);
            }
            debug!(path = %path.display(), attempt, "spool file is empty, waiting");
            tokio::time::sleep(EMPTY_FILE_POLL).await;
        }
        warn!(path = %path.display(), "spool file stayed empty, deleting it");
        self.remove(path).await?;
        Err(SpoolError::Corrupt(path.to_path_buf()))
    }

    /// Lists the documents of a stage, oldest first. Quarantined documents
    /// are skipped.
    pub async fn list(&self, dir: SpoolDir) -> Result<Vec<SpoolEntry>, SpoolError> {
        let path = self.dir(dir);
        let mut reader = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| SpoolError::io(&path, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| SpoolError::io(&path, e))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(FAIL_SUFFIX) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            entries.push(SpoolEntry {
                path: entry.path(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        entries.sort_by_key(|e| e.modified);
        Ok(entries)
    }

    pub async fn remove(&self, path: &Path) -> Result<(), SpoolError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SpoolError::io(path, e)),
        }
    }

    /// Renames an unparseable document with the failure suffix so it is
    /// kept for inspection but never picked up again.
    pub async fn quarantine(&self, path: &Path) -> Result<PathBuf, SpoolError> {
        let mut failed = path.as_os_str().to_owned();
        failed.push(FAIL_SUFFIX);
        let failed = PathBuf::from(failed);
        tokio::fs::rename(path, &failed)
            .await
            .map_err(|e| SpoolError::io(path, e))?;
        Ok(failed)
    }

    /// Moves a raw document that could not be turned into an action into
    /// `action/invalid/<nanos>.json`.
    pub async fn move_raw_to_invalid(&self, path: &Path, now: DateTime<Utc>) -> Result<PathBuf, SpoolError> {
        let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros() * 1000);
        let dest = self.dir(SpoolDir::ActionInvalid).join(format!("{}.json", nanos));
        tokio::fs::rename(path, &dest)
            .await
            .map_err(|e| SpoolError::io(path, e))?;
        Ok(dest)
    }

    /// Deletes documents of `dir` last modified more than `older_than` ago.
    pub async fn clean_dir(&self, dir: SpoolDir, older_than: Duration) -> Result<usize, SpoolError> {
        let cutoff = SystemTime::now()
            .checked_sub(older_than)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut deleted = 0;
        for entry in self.list(dir).await? {
            if entry.modified < cutoff {
                self.remove(&entry.path).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpoolError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("refusing to write empty document to {0}")]
    EmptyData(PathBuf),

    #[error("spool file {0} stayed empty and was deleted")]
    Corrupt(PathBuf),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SpoolError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        SpoolError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// The document was already moved away, usually by a previous pass.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SpoolError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::action::{ActionId, Operation};
    use crate::domain::agent::Agent;
    use crate::domain::command::CommandId;
    use crate::domain::id::SequentialIdGenerator;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use tempfile::TempDir;

    async fn spool(dir: &TempDir) -> Spool {
        Spool::open(
            dir.path().join("spool"),
            dir.path().join("spool/tmp"),
            Arc::new(SequentialIdGenerator::starting_at(1)),
        )
        .await
        .unwrap()
    }

    fn action() -> Action {
        let now = Utc::now();
        Action::new(
            ActionId(77),
            "test",
            "name='x'",
            now,
            now + ChronoDuration::hours(1),
            vec![Operation::new("file", json!({}))],
        )
    }

    #[test]
    fn test_open_creates_layout() {
        let dir = TempDir::new().unwrap();
        let spool = tokio_test::block_on(spool(&dir));
        for stage in SpoolDir::ALL {
            assert!(spool.dir(stage).is_dir());
        }
        assert!(spool.root().join("action/new").is_dir());
        assert!(spool.root().join("command/returned").is_dir());
    }

    #[tokio::test]
    async fn test_write_and_read_action() {
        let dir = TempDir::new().unwrap();
        let spool = spool(&dir).await;
        let a = action();
        let path = spool.write_action(SpoolDir::ActionNew, &a).await.unwrap();
        assert_eq!(path.file_name().unwrap(), "77.json");
        let data = spool.read(&path).await.unwrap();
        assert_eq!(Action::from_json(&data).unwrap(), a);
        // scratch file was renamed away
        assert_eq!(std::fs::read_dir(dir.path().join("spool/tmp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_empty_write_is_rejected() {
        let dir = TempDir::new().unwrap();
        let spool = spool(&dir).await;
        let dest = spool.dir(SpoolDir::ActionNew).join("1.json");
        assert!(matches!(
            spool.safe_write(&dest, b"").await,
            Err(SpoolError::EmptyData(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_file_is_deleted_after_retries() {
        let dir = TempDir::new().unwrap();
        let spool = spool(&dir).await;
        let path = spool.dir(SpoolDir::CommandReturned).join("1-2.json");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(spool.read(&path).await, Err(SpoolError::Corrupt(_))));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_quarantined_files_are_not_listed() {
        let dir = TempDir::new().unwrap();
        let spool = spool(&dir).await;
        let now = Utc::now();
        let a = action();
        let cmd = Command::new(CommandId(5), a.clone(), Agent::new("h", "q", 1, now), now);
        let path = spool.write_command(SpoolDir::CommandReturned, &cmd).await.unwrap();
        assert_eq!(spool.list(SpoolDir::CommandReturned).await.unwrap().len(), 1);

        let failed = spool.quarantine(&path).await.unwrap();
        assert!(failed.to_string_lossy().ends_with("77-5.json.fail"));
        assert!(failed.exists());
        assert!(spool.list(SpoolDir::CommandReturned).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clean_dir_only_removes_old_files() {
        let dir = TempDir::new().unwrap();
        let spool = spool(&dir).await;
        spool.write_action(SpoolDir::ActionDone, &action()).await.unwrap();
        assert_eq!(
            spool.clean_dir(SpoolDir::ActionDone, Duration::from_secs(3600)).await.unwrap(),
            0
        );
        assert_eq!(spool.clean_dir(SpoolDir::ActionDone, Duration::ZERO).await.unwrap(), 1);
        assert!(spool.list(SpoolDir::ActionDone).await.unwrap().is_empty());
    }
}
