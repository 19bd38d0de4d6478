//! DT-013: Staged, atomically promoted per-row artifacts.
//!
//! Artifacts are written under `<root>/.staging/<job_id>/` and renamed into
//! `<root>/<job_id>/` once complete, so a promoted file is never partial.
//! Anything left in staging belongs to a row whose outcome was not recorded.

use crate::tripwire::eventlog::is_valid_job_id;
use std::path::{Path, PathBuf};

const STAGING_DIR: &str = ".staging";

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact io {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid job id '{0}'")]
    InvalidJobId(String),
}

fn io(path: &Path) -> impl FnOnce(std::io::Error) -> ArtifactError + '_ {
    move |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Keep reference characters that are safe in a file name.
fn sanitize(reference: &str) -> String {
    reference
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// `<job prefix>_row<NNN>_<reference>.<ext>`; unique per row even when a
/// gateway hands out repeated references.
pub fn artifact_file_name(job_id: &str, row_number: u64, reference: &str, extension: &str) -> String {
    let prefix: String = job_id.chars().take(8).collect();
    format!(
        "{}_row{:03}_{}.{}",
        sanitize(&prefix),
        row_number,
        sanitize(reference),
        extension
    )
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    extension: String,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: "pdf".to_string(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_segment(job_id: &str) -> Result<&str, ArtifactError> {
        if is_valid_job_id(job_id) {
            Ok(job_id)
        } else {
            Err(ArtifactError::InvalidJobId(job_id.to_string()))
        }
    }

    fn staging_dir(&self, job_id: &str) -> Result<PathBuf, ArtifactError> {
        Ok(self.root.join(STAGING_DIR).join(Self::job_segment(job_id)?))
    }

    fn final_dir(&self, job_id: &str) -> Result<PathBuf, ArtifactError> {
        Ok(self.root.join(Self::job_segment(job_id)?))
    }

    /// Write the artifact to staging and sync it.
    pub fn stage(
        &self,
        job_id: &str,
        row_number: u64,
        reference: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, ArtifactError> {
        use std::io::Write;
        let dir = self.staging_dir(job_id)?;
        std::fs::create_dir_all(&dir).map_err(io(&dir))?;
        let path = dir.join(artifact_file_name(job_id, row_number, reference, &self.extension));
        let mut file = std::fs::File::create(&path).map_err(io(&path))?;
        file.write_all(bytes).map_err(io(&path))?;
        file.sync_all().map_err(io(&path))?;
        Ok(path)
    }

    /// Rename a staged artifact into the job's final directory.
    pub fn promote(&self, job_id: &str, staged: &Path) -> Result<PathBuf, ArtifactError> {
        let dir = self.final_dir(job_id)?;
        std::fs::create_dir_all(&dir).map_err(io(&dir))?;
        let name = staged.file_name().ok_or_else(|| ArtifactError::Io {
            path: staged.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"),
        })?;
        let dest = dir.join(name);
        std::fs::rename(staged, &dest).map_err(io(staged))?;
        Ok(dest)
    }

    pub fn exists(&self, path: &str) -> bool {
        Path::new(path).is_file()
    }

    /// Files currently staged for a job.
    pub fn staged(&self, job_id: &str) -> Result<Vec<PathBuf>, ArtifactError> {
        let dir = self.staging_dir(job_id)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(io(&dir))? {
            let entry = entry.map_err(io(&dir))?;
            files.push(entry.path());
        }
        files.sort();
        Ok(files)
    }

    /// Job ids with a staging directory.
    pub fn staged_jobs(&self) -> Result<Vec<String>, ArtifactError> {
        let dir = self.root.join(STAGING_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut jobs = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(io(&dir))? {
            let entry = entry.map_err(io(&dir))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_dir() && is_valid_job_id(&name) {
                jobs.push(name);
            }
        }
        jobs.sort();
        Ok(jobs)
    }

    /// Remove a job's staging directory. Returns the number of files removed.
    pub fn clear_staging(&self, job_id: &str) -> Result<usize, ArtifactError> {
        let files = self.staged(job_id)?;
        let dir = self.staging_dir(job_id)?;
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(io(&dir))?;
        }
        Ok(files.len())
    }
}
