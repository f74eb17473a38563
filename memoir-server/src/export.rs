// Copyright 2025 Memoir (https://github.com/memoir-mem/memoir)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Export and replication.
//!
//! Snapshots of the vector database (and optionally the relational
//! database) are committed into a git-managed replication directory for
//! cross-machine sharing. The directory is initialized once: `git init`, a
//! `.gitattributes` tracking `*.db` as large binaries, and a README.
//! Every snapshot writes a `metadata.json` and commits with a timestamp
//! message; pushes happen when a remote is configured and auto-push is on.

use memoir_core::settings::ReplicationSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },

    #[error("nothing to export: {0}")]
    MissingSource(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Snapshot metadata written next to the replicated files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub exported_at: String,
    pub source: String,
    pub size_bytes: u64,
    pub hostname: String,
    pub platform: String,
}

/// Result of one snapshot run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportReport {
    pub export_dir: PathBuf,
    pub files: Vec<String>,
    pub committed: bool,
    pub pushed: bool,
}

/// Replication status for the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub initialized: bool,
    pub pending_changes: bool,
    pub remote_url: Option<String>,
    pub last_commit: Option<String>,
}

/// Pure auto-push policy: enabled, with pending changes, and idle long
/// enough.
pub fn auto_push_due(
    auto_push_enabled: bool,
    pending_changes: bool,
    idle_push_secs: u64,
    last_activity_epoch_ms: i64,
    now_epoch_ms: i64,
) -> bool {
    auto_push_enabled
        && pending_changes
        && now_epoch_ms - last_activity_epoch_ms >= (idle_push_secs as i64) * 1000
}

/// Manages the replication workspace.
pub struct ReplicationExporter {
    export_dir: PathBuf,
    settings: ReplicationSettings,
}

impl ReplicationExporter {
    pub fn new(export_dir: PathBuf, settings: ReplicationSettings) -> Self {
        Self { export_dir, settings }
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    /// Initialize the workspace once: directory, git repo, large-binary
    /// attributes, README, and the configured remote.
    pub fn ensure_initialized(&self) -> Result<(), ExportError> {
        std::fs::create_dir_all(&self.export_dir)?;

        if !self.export_dir.join(".git").exists() {
            self.git(&["init"])?;
            info!(dir = %self.export_dir.display(), "replication workspace initialized");
        }

        let attributes = self.export_dir.join(".gitattributes");
        if !attributes.exists() {
            std::fs::write(&attributes, "*.db filter=lfs diff=lfs merge=lfs -text\n")?;
        }

        let readme = self.export_dir.join("README.md");
        if !readme.exists() {
            std::fs::write(
                &readme,
                "# Memoir replication workspace\n\nVersioned snapshots of the vector database. \
                 Managed by the worker; do not edit by hand.\n",
            )?;
        }

        if let Some(url) = &self.settings.remote_url {
            // Adding an existing remote fails; tolerate it.
            if self.git(&["remote", "add", &self.settings.remote_name, url]).is_err() {
                let _ = self.git(&["remote", "set-url", &self.settings.remote_name, url]);
            }
        }

        Ok(())
    }

    /// Copy the databases in, write metadata, commit, and optionally push.
    pub fn export_snapshot(
        &self,
        vectors_db: Option<&Path>,
        full_db: Option<&Path>,
    ) -> Result<ExportReport, ExportError> {
        self.ensure_initialized()?;

        let mut files = Vec::new();
        let mut total_bytes = 0u64;
        let mut source = String::new();

        if let Some(vectors) = vectors_db {
            if !vectors.exists() {
                return Err(ExportError::MissingSource(vectors.display().to_string()));
            }
            let target = self.export_dir.join("vectors.db");
            std::fs::copy(vectors, &target)?;
            total_bytes += target.metadata()?.len();
            source = vectors.display().to_string();
            files.push("vectors.db".to_string());
        }

        if let Some(full) = full_db {
            if !full.exists() {
                return Err(ExportError::MissingSource(full.display().to_string()));
            }
            let target = self.export_dir.join("full-export.db");
            std::fs::copy(full, &target)?;
            total_bytes += target.metadata()?.len();
            if source.is_empty() {
                source = full.display().to_string();
            }
            files.push("full-export.db".to_string());
        }

        if files.is_empty() {
            return Err(ExportError::MissingSource("no databases selected".into()));
        }

        let metadata = ExportMetadata {
            exported_at: chrono::Utc::now().to_rfc3339(),
            source,
            size_bytes: total_bytes,
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            platform: std::env::consts::OS.to_string(),
        };
        std::fs::write(
            self.export_dir.join("metadata.json"),
            serde_json::to_string_pretty(&metadata)?,
        )?;
        files.push("metadata.json".to_string());

        self.git(&["add", "-A"])?;
        // The identity flags keep commits working on machines with no
        // global git config.
        let committed = match self.git(&[
            "-c",
            "user.name=memoir",
            "-c",
            "user.email=memoir@localhost",
            "commit",
            "-m",
            &format!("snapshot {}", metadata.exported_at),
        ]) {
            Ok(_) => true,
            // An unchanged tree is a no-op, not a failure.
            Err(ExportError::Git { message, .. }) if message.contains("nothing to commit") => {
                false
            }
            Err(e) => return Err(e),
        };

        let mut pushed = false;
        if committed && self.settings.remote_url.is_some() && self.settings.auto_push {
            match self.push() {
                Ok(()) => pushed = true,
                Err(e) => warn!(error = %e, "auto-push failed; snapshot is committed locally"),
            }
        }

        info!(files = files.len(), committed, pushed, "snapshot exported");
        Ok(ExportReport { export_dir: self.export_dir.clone(), files, committed, pushed })
    }

    /// Uncommitted changes in the workspace?
    pub fn has_pending_changes(&self) -> bool {
        self.git(&["status", "--porcelain"])
            .map(|out| !out.trim().is_empty())
            .unwrap_or(false)
    }

    /// Auto-push decision for the idle loop.
    pub fn should_auto_push(&self, last_activity_epoch_ms: i64) -> bool {
        auto_push_due(
            self.settings.auto_push,
            self.has_pending_changes(),
            self.settings.idle_push_secs,
            last_activity_epoch_ms,
            memoir_core::epoch_ms(),
        )
    }

    pub fn push(&self) -> Result<(), ExportError> {
        self.git(&["push", &self.settings.remote_name, "HEAD"])?;
        Ok(())
    }

    pub fn pull(&self) -> Result<(), ExportError> {
        self.git(&["pull", &self.settings.remote_name, "HEAD"])?;
        Ok(())
    }

    pub fn status(&self) -> SyncStatus {
        let initialized = self.export_dir.join(".git").exists();
        SyncStatus {
            initialized,
            pending_changes: initialized && self.has_pending_changes(),
            remote_url: self.settings.remote_url.clone(),
            last_commit: self
                .git(&["log", "-1", "--format=%H %cI"])
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        }
    }

    fn git(&self, args: &[&str]) -> Result<String, ExportError> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(&self.export_dir)
            .output()?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ExportError::Git {
                command: args.first().copied().unwrap_or("").to_string(),
                message: format!("{stdout}{stderr}").trim().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_push_policy() {
        // Enabled, pending, idle long enough.
        assert!(auto_push_due(true, true, 300, 0, 300_000));
        // Not idle long enough.
        assert!(!auto_push_due(true, true, 300, 0, 299_999));
        // Disabled.
        assert!(!auto_push_due(false, true, 300, 0, 500_000));
        // No pending changes.
        assert!(!auto_push_due(true, false, 300, 0, 500_000));
    }

    #[test]
    fn test_metadata_serialization() {
        let metadata = ExportMetadata {
            exported_at: "2025-06-01T00:00:00Z".into(),
            source: "/data/vectors.db".into(),
            size_bytes: 4096,
            hostname: "dev-box".into(),
            platform: "linux".into(),
        };
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["size_bytes"], 4096);
        assert_eq!(value["platform"], "linux");
    }

    #[test]
    fn test_initialize_writes_attributes_and_readme() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = ReplicationExporter::new(
            dir.path().join("export"),
            ReplicationSettings::default(),
        );

        exporter.ensure_initialized().unwrap();
        let attributes =
            std::fs::read_to_string(dir.path().join("export/.gitattributes")).unwrap();
        assert!(attributes.contains("*.db"));
        assert!(dir.path().join("export/README.md").exists());

        // Idempotent.
        exporter.ensure_initialized().unwrap();
    }

    #[test]
    fn test_snapshot_requires_existing_source() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = ReplicationExporter::new(
            dir.path().join("export"),
            ReplicationSettings::default(),
        );
        let missing = dir.path().join("nope.db");
        assert!(matches!(
            exporter.export_snapshot(Some(&missing), None),
            Err(ExportError::MissingSource(_))
        ));
    }
}
