use crate::store::{ArchiveStore, FetchError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

const ARCHIVE_NAME: &str = "archive.zip";
const ARCHIVE_DIR: &str = "archive";

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("archive fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("invalid archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("archive entry escapes unpack directory: {0}")]
    UnsafePath(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unpack task failed: {0}")]
    Unpack(String),
    #[error("image build failed: {0}")]
    Build(String),
    #[error("teardown of previous archive failed: {0}")]
    Teardown(#[from] CleanupError),
}

#[derive(Debug, Error)]
#[error("cleanup incomplete: {}", .failures.join("; "))]
pub struct CleanupError {
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    Fetching,
    Unpacking,
    Building,
    Ready,
    TornDown,
}

/// Owns the lifecycle of one computation archive: fetch, unpack, image
/// build, and teardown. At most one image exists per content hash; a
/// new hash tears the previous build down first.
pub struct ArchiveManager {
    store: ArchiveStore,
    archive_path: PathBuf,
    unpack_dir: PathBuf,
    image: String,
    runtime: String,
    state: State,
    built_hash: Option<String>,
}

impl ArchiveManager {
    pub fn new(store: ArchiveStore, work_dir: &Path, image: &str, runtime: &str) -> Self {
        Self {
            store,
            archive_path: work_dir.join(ARCHIVE_NAME),
            unpack_dir: work_dir.join(ARCHIVE_DIR),
            image: image.to_string(),
            runtime: runtime.to_string(),
            state: State::Uninitialized,
            built_hash: None,
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Brings the archive to `Ready`. Skips fetch and unpack when the
    /// unpack directory is already present from an earlier run.
    pub async fn setup(&mut self, content_hash: &str) -> Result<(), SetupError> {
        if self.state == State::Ready {
            if self.built_hash.as_deref() == Some(content_hash) {
                return Ok(());
            }
            // Single live version: a new hash replaces the old build.
            self.cleanup().await?;
        }

        if !self.unpack_dir.exists() {
            self.state = State::Fetching;
            info!("Retrieving archive with hash {}...", content_hash);
            self.store.fetch(content_hash, &self.archive_path).await?;

            self.state = State::Unpacking;
            info!("Unpacking archive...");
            self.unpack().await?;
        } else {
            info!("Already have archive locally");
        }

        self.state = State::Building;
        info!("Building execution image from archive...");
        self.build_image().await?;

        self.state = State::Ready;
        self.built_hash = Some(content_hash.to_string());

        Ok(())
    }

    async fn unpack(&self) -> Result<(), SetupError> {
        let archive_path = self.archive_path.clone();
        let unpack_dir = self.unpack_dir.clone();

        tokio::task::spawn_blocking(move || unpack_zip(&archive_path, &unpack_dir))
            .await
            .map_err(|e| SetupError::Unpack(e.to_string()))?
    }

    async fn build_image(&self) -> Result<(), SetupError> {
        let output = Command::new(&self.runtime)
            .arg("build")
            .arg("-t")
            .arg(&self.image)
            .arg(&self.unpack_dir)
            .output()
            .await?;

        if !output.status.success() {
            // A failed build must not leave a stale tag usable by later
            // executions.
            let _ = self.remove_image().await;
            return Err(SetupError::Build(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(())
    }

    async fn remove_image(&self) -> std::io::Result<bool> {
        let output = Command::new(&self.runtime)
            .args(["rmi", "-f"])
            .arg(&self.image)
            .output()
            .await?;

        Ok(output.status.success())
    }

    /// Best-effort teardown: every removal is attempted regardless of
    /// the others' failure, and failures are reported together. No-op
    /// once torn down.
    pub async fn cleanup(&mut self) -> Result<(), CleanupError> {
        if self.state == State::TornDown {
            return Ok(());
        }

        let mut failures = Vec::new();

        if self.archive_path.exists() {
            if let Err(e) = tokio::fs::remove_file(&self.archive_path).await {
                failures.push(format!("remove {}: {}", self.archive_path.display(), e));
            }
        }

        if self.unpack_dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&self.unpack_dir).await {
                failures.push(format!("remove {}: {}", self.unpack_dir.display(), e));
            }
        }

        match self.remove_image().await {
            Ok(true) => {}
            Ok(false) => warn!("Image {} was not removed (may not exist)", self.image),
            Err(e) => failures.push(format!("remove image {}: {}", self.image, e)),
        }

        self.state = State::TornDown;
        self.built_hash = None;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupError { failures })
        }
    }
}

fn unpack_zip(archive_path: &Path, dest: &Path) -> Result<(), SetupError> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let relative = match entry.enclosed_name() {
            Some(name) => name.to_owned(),
            None => return Err(SetupError::UnsafePath(entry.name().to_string())),
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))?;
        }
    }

    Ok(())
}
