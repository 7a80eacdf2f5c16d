//! Per-job artifact storage.
//!
//! Every job owns one directory under `<root>/jobs/<job_id>/`:
//!
//! ```text
//! input/            original upload, kept until the job is purged
//! stages/<stage>/   scratch output of the current attempt of each stage
//! output/           sealed final result
//! ```
//!
//! Uploads are streamed into `<root>/staging/` first and moved into place by
//! [`ArtifactStore::import_input`] once admission accepts them. The store is
//! the only component that creates or deletes these paths.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use mf_core::{ArtifactRef, Error, InputFormat, JobId, Result};

const JOBS_DIR: &str = "jobs";
const STAGING_DIR: &str = "staging";
const INPUT_DIR: &str = "input";
const STAGES_DIR: &str = "stages";
const OUTPUT_DIR: &str = "output";

fn storage_err(action: &str, path: &Path, e: std::io::Error) -> Error {
    Error::storage(format!("failed to {action} {}: {e}", path.display()))
}

/// Move `from` to `to`, falling back to copy + remove across filesystems.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if std::fs::rename(from, to).is_err() {
        std::fs::copy(from, to).map_err(|e| storage_err("copy", from, e))?;
        let _ = std::fs::remove_file(from);
    }
    Ok(())
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(storage_err("remove", path, e)),
    }
}

/// Filesystem-backed artifact store rooted at a single directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if needed) a store at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [root.join(JOBS_DIR), root.join(STAGING_DIR)] {
            std::fs::create_dir_all(&dir).map_err(|e| storage_err("create", &dir, e))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for uploads that have not been admitted yet.
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// The job's working directory (whether or not it exists).
    pub fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join(JOBS_DIR).join(job_id.to_string())
    }

    /// Create a fresh working directory for `job_id`.
    ///
    /// Fails if the directory already exists, so no two jobs ever share one.
    pub fn allocate(&self, job_id: JobId) -> Result<PathBuf> {
        let dir = self.job_dir(job_id);
        std::fs::create_dir(&dir).map_err(|e| storage_err("allocate", &dir, e))?;
        for sub in [INPUT_DIR, STAGES_DIR, OUTPUT_DIR] {
            let p = dir.join(sub);
            std::fs::create_dir(&p).map_err(|e| storage_err("create", &p, e))?;
        }
        tracing::debug!(job_id = %job_id, dir = %dir.display(), "Allocated job directory");
        Ok(dir)
    }

    /// Move a staged upload into the job's `input/` directory.
    pub fn import_input(
        &self,
        job_id: JobId,
        upload: &Path,
        format: InputFormat,
    ) -> Result<ArtifactRef> {
        let dest = self
            .job_dir(job_id)
            .join(INPUT_DIR)
            .join(format!("input.{}", format.extension()));
        move_file(upload, &dest)?;
        Ok(ArtifactRef::new(dest))
    }

    /// Return an empty scratch directory for `stage_name`.
    ///
    /// Anything left by a previous attempt of the same stage is removed, so
    /// each attempt starts clean.
    pub fn stage_output_path(&self, job_id: JobId, stage_name: &str) -> Result<PathBuf> {
        if stage_name.is_empty()
            || stage_name.contains(&['/', '\\'][..])
            || stage_name == "."
            || stage_name == ".."
        {
            return Err(Error::storage(format!("invalid stage name: {stage_name:?}")));
        }
        let job_dir = self.job_dir(job_id);
        if !job_dir.is_dir() {
            return Err(Error::storage(format!(
                "job directory {} does not exist",
                job_dir.display()
            )));
        }
        let dir = job_dir.join(STAGES_DIR).join(stage_name);
        remove_dir_if_exists(&dir)?;
        std::fs::create_dir_all(&dir).map_err(|e| storage_err("create", &dir, e))?;
        Ok(dir)
    }

    /// Seal `path` as the job's final output and return its reference.
    ///
    /// Sealing again after a successful seal returns the same reference,
    /// even once the source has been moved away.
    pub fn finalize(&self, job_id: JobId, path: &Path) -> Result<ArtifactRef> {
        let file_name = path
            .file_name()
            .ok_or_else(|| Error::storage(format!("cannot seal {}", path.display())))?;
        let out_dir = self.job_dir(job_id).join(OUTPUT_DIR);
        let dest = out_dir.join(file_name);

        if path.exists() {
            std::fs::create_dir_all(&out_dir).map_err(|e| storage_err("create", &out_dir, e))?;
            move_file(path, &dest)?;
        } else if !dest.exists() {
            return Err(Error::storage(format!(
                "output {} does not exist",
                path.display()
            )));
        }

        tracing::debug!(job_id = %job_id, output = %dest.display(), "Sealed output");
        Ok(ArtifactRef::new(dest))
    }

    /// Remove stage scratch directories, keeping input and sealed output.
    pub fn purge_intermediates(&self, job_id: JobId) -> Result<()> {
        remove_dir_if_exists(&self.job_dir(job_id).join(STAGES_DIR))
    }

    /// Remove everything the job owns. Safe to call repeatedly and on
    /// partially allocated directories.
    pub fn purge(&self, job_id: JobId) -> Result<()> {
        remove_dir_if_exists(&self.job_dir(job_id))
    }

    /// Whether the referenced file is still present.
    pub fn exists(&self, artifact: &ArtifactRef) -> bool {
        artifact.path().is_file()
    }
}
