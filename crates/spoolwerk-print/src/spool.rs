// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// On-disk payload spool.
//
// Each job's payload is written to `job-<id>-<file name>` under the spool
// directory.  Payloads are staged under a temporary name before the job row
// exists and renamed into place once it does, so a spool path recorded in
// the database always names a complete file.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use spoolwerk_core::error::{Result, SpoolwerkError};
use spoolwerk_core::types::{Device, Job, JobId};

/// Longest file-name component kept in a spool path.
const MAX_NAME_LEN: usize = 96;

/// A payload written to the spool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpooledPayload {
    pub path: PathBuf,
    /// Lowercase hex SHA-256 of the bytes on disk.
    pub sha256: String,
    pub len: u64,
}

/// The spool directory.
#[derive(Debug, Clone)]
pub struct Spool {
    dir: PathBuf,
}

impl Spool {
    /// Use `dir` as the spool, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| SpoolwerkError::Spool(format!("create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a job's payload is stored under.
    pub fn path_for(&self, id: JobId, file_name: &str) -> PathBuf {
        self.dir
            .join(format!("job-{id}-{}", sanitize_file_name(file_name)))
    }

    /// Write `data` for job `id` and return where it landed.
    pub fn write(&self, id: JobId, file_name: &str, data: &[u8]) -> Result<SpooledPayload> {
        let staged = self.stage(file_name, data)?;
        staged.place(id).inspect_err(|_| staged.discard())
    }

    /// Write `data` under a temporary name before the job id is known.
    ///
    /// The slow part of spooling (write and sync) happens here, so binding
    /// the file to a job afterwards is a single rename.
    pub fn stage(&self, file_name: &str, data: &[u8]) -> Result<StagedPayload> {
        let tmp = self.dir.join(format!("staging-{}.partial", Uuid::new_v4()));
        let written = std::fs::File::create(&tmp).and_then(|mut file| {
            file.write_all(data)?;
            file.sync_all()
        });
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(SpoolwerkError::Spool(format!("write {}: {e}", tmp.display())));
        }
        Ok(StagedPayload {
            spool: self.clone(),
            tmp,
            file_name: file_name.to_string(),
            sha256: hash_bytes(data),
            len: data.len() as u64,
        })
    }

    /// Read a job's spooled payload. `None` when the file is gone.
    pub async fn read(&self, job: &Job) -> Result<Option<Vec<u8>>> {
        let Some(path) = job.spool_path.as_ref() else {
            return Ok(None);
        };
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SpoolwerkError::Spool(format!("read {}: {e}", path.display()))),
        }
    }

    /// Delete a job's spool file. Missing files are not an error.
    pub fn remove(&self, job: &Job) -> Result<()> {
        let Some(path) = job.spool_path.as_ref() else {
            return Ok(());
        };
        match std::fs::remove_file(path) {
            Ok(()) => {
                debug!(job_id = %job.id, path = %path.display(), "spool file removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "spool file could not be removed");
                Err(SpoolwerkError::Spool(format!("remove {}: {e}", path.display())))
            }
        }
    }
}

/// A payload on disk that no job owns yet.
#[derive(Debug)]
pub struct StagedPayload {
    spool: Spool,
    tmp: PathBuf,
    file_name: String,
    sha256: String,
    len: u64,
}

impl StagedPayload {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Rename the staged file to job `id`'s spool path.
    pub fn place(&self, id: JobId) -> Result<SpooledPayload> {
        let path = self.spool.path_for(id, &self.file_name);
        std::fs::rename(&self.tmp, &path)
            .map_err(|e| SpoolwerkError::Spool(format!("rename into {}: {e}", path.display())))?;
        debug!(job_id = %id, path = %path.display(), bytes = self.len, "payload spooled");
        Ok(SpooledPayload {
            path,
            sha256: self.sha256.clone(),
            len: self.len,
        })
    }

    /// Remove the staged file if it was never placed.
    pub fn discard(&self) {
        match std::fs::remove_file(&self.tmp) {
            Ok(()) => debug!(path = %self.tmp.display(), "staged payload discarded"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.tmp.display(), error = %e, "staged payload left behind"),
        }
    }
}

/// Reduce a client-supplied name to one safe path component.
///
/// Directory parts are dropped and anything outside `[A-Za-z0-9._-]`
/// becomes `_`.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .find(|part| !part.is_empty())
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LEN)
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "document.dat".into()
    } else {
        cleaned
    }
}

/// Compute the SHA-256 hash of `data` as a lowercase hex string.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Whether `data` still hashes to `expected_hex`.
pub fn verify_hash(data: &[u8], expected_hex: &str) -> bool {
    hash_bytes(data).eq_ignore_ascii_case(expected_hex)
}

/// Plain-text stand-in for a job whose spool file has disappeared.
pub fn placeholder_document(job: &Job, device: &Device) -> Vec<u8> {
    let rule = "========================================";
    format!(
        "\n\n{rule}\n           PRINT JOB NOTICE\n{rule}\n\n\
         Job id:   {}\n\
         File:     {}\n\
         Owner:    {}\n\
         Printer:  {}\n\
         Date:     {}\n\n\
         The original document for this job could not be found\n\
         in the spool, so this notice was printed instead.\n\n\
         {rule}\n",
        job.id,
        job.file_name,
        job.owner,
        device.alias,
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
    )
    .into_bytes()
}
