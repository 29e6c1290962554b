use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use uuid::Uuid;

use crate::error::WorkspaceError;

/// File name prefix shared by every input/output slot
pub const WORKSPACE_PREFIX: &str = "vnote-";

const SLOT_EXTENSION: &str = "mp4";

/// Input and output slots owned by exactly one in-flight conversion.
///
/// Both paths embed a fresh v4 UUID, so concurrent workspaces in the same
/// directory never overlap. Neither file exists when `acquire` returns.
/// Dropping a workspace that was never released removes both files.
#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    input: PathBuf,
    output: PathBuf,
    released: bool,
}

impl Workspace {
    pub async fn acquire(work_dir: &Path) -> Result<Self, WorkspaceError> {
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|source| WorkspaceError::Create {
                path: work_dir.to_path_buf(),
                source,
            })?;

        loop {
            let id = Uuid::new_v4();
            let input = work_dir.join(format!("{WORKSPACE_PREFIX}{id}-in.{SLOT_EXTENSION}"));
            let output = work_dir.join(format!("{WORKSPACE_PREFIX}{id}-out.{SLOT_EXTENSION}"));
            if slot_taken(&input).await || slot_taken(&output).await {
                continue;
            }
            debug!("Workspace {}: acquired in {}", id, work_dir.display());
            return Ok(Self {
                id,
                input,
                output,
                released: false,
            });
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn input_path(&self) -> &Path {
        &self.input
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    /// Remove both slots. Files that are already gone are not an error, so
    /// calling this more than once is fine. Both removals are attempted even
    /// if the first one fails; the first failure is returned.
    pub fn release(&mut self) -> Result<(), WorkspaceError> {
        self.released = true;
        let input = remove_if_present(&self.input);
        let output = remove_if_present(&self.output);
        debug!("Workspace {}: released", self.id);
        input.and(output)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.release() {
                warn!("Workspace {}: cleanup on drop failed: {}", self.id, e);
            }
        }
    }
}

fn remove_if_present(path: &Path) -> Result<(), WorkspaceError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(WorkspaceError::CleanupFailed {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn slot_taken(path: &Path) -> bool {
    // Unreadable counts as taken
    tokio::fs::try_exists(path).await.unwrap_or(true)
}

fn is_slot_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.starts_with(WORKSPACE_PREFIX)
        && (name.ends_with(&format!("-in.{SLOT_EXTENSION}"))
            || name.ends_with(&format!("-out.{SLOT_EXTENSION}")))
}

/// Remove slot files left behind by a process that died mid-conversion.
/// Only files last modified at least `min_age` ago are touched, so slots of a
/// concurrently running converter sharing the directory survive.
/// Returns the number of files removed.
pub async fn sweep_orphans(work_dir: &Path, min_age: Duration) -> Result<usize> {
    if !work_dir.exists() {
        return Ok(0);
    }

    let stale = tokio::task::spawn_blocking({
        let work_dir = work_dir.to_path_buf();
        move || {
            let now = SystemTime::now();
            let mut stale = Vec::new();
            for entry in walkdir::WalkDir::new(&work_dir)
                .max_depth(1)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if !entry.file_type().is_file() || !is_slot_file(path) {
                    continue;
                }
                let age = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|modified| now.duration_since(modified).ok())
                    .unwrap_or_default();
                if age >= min_age {
                    stale.push(path.to_path_buf());
                }
            }
            stale
        }
    })
    .await
    .context("Failed to scan work dir for orphaned slots")?;

    let mut removed = 0;
    for path in stale {
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("🗑️  Deleted orphaned slot: {}", path.display());
                removed += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to delete orphaned slot: {}", path.display()));
            }
        }
    }

    if removed > 0 {
        info!("Cleaned up {} orphaned slot file(s) in {}", removed, work_dir.display());
    } else {
        debug!("No orphaned slot files in {}", work_dir.display());
    }
    Ok(removed)
}
