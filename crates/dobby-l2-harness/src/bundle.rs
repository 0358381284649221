//! Scoped bundle extraction.
//!
//! A bundle archive `<bundle_dir>/<id>_bundle.tar.gz` unpacks to
//! `<bundle_dir>/<id>_bundle`. The [`ScopedBundle`] guard owns that
//! directory and removes it exactly once, on every exit path, including a
//! failed or partial extraction. Archives are unpacked into a sibling
//! `<id>_bundle.unpack` staging directory first, so entries outside
//! `<id>_bundle` never reach `<bundle_dir>`.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};

#[derive(Debug)]
pub struct ScopedBundle {
    path: PathBuf,
    released: bool,
}

impl ScopedBundle {
    /// Extract the archive for `container_id`.
    pub fn acquire(config: &HarnessConfig, container_id: &str) -> Result<Self> {
        let path = config.bundle_path(container_id);
        let archive = archive_path(&path);
        if !archive.is_file() {
            return Err(HarnessError::MissingArchive(archive));
        }
        tracing::debug!(archive = %archive.display(), "untar'ing bundle");

        // Owned before extraction starts so a partial unpack is still removed.
        let guard = Self {
            path,
            released: false,
        };
        let staging = with_suffix(&guard.path, ".unpack");
        let staged = unpack_staged(&archive, &staging, &guard.path);
        if let Err(err) = remove(&staging) {
            tracing::warn!(path = %staging.display(), error = %err, "failed to remove staging directory");
        }
        staged?;
        Ok(guard)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory now, reporting any failure.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        remove(&self.path).map_err(HarnessError::from)
    }
}

impl Drop for ScopedBundle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = remove(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to remove bundle");
        }
    }
}

/// Run `body` with an extracted bundle; the directory is gone when this
/// returns, whatever `body` did.
pub fn with_bundle<T>(
    config: &HarnessConfig,
    container_id: &str,
    body: impl FnOnce(&Path) -> T,
) -> Result<T> {
    let bundle = ScopedBundle::acquire(config, container_id)?;
    let value = body(bundle.path());
    bundle.release()?;
    Ok(value)
}

fn archive_path(bundle_path: &Path) -> PathBuf {
    with_suffix(bundle_path, ".tar.gz")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Unpack into `staging` and move only the expected top-level directory to
/// `dest`. Anything else the archive holds stays in `staging`.
fn unpack_staged(archive: &Path, staging: &Path, dest: &Path) -> Result<()> {
    let extract_error = |source: io::Error| HarnessError::Extract {
        archive: archive.to_path_buf(),
        source,
    };
    remove(staging)?;
    fs::create_dir_all(staging)?;
    unpack(archive, staging).map_err(extract_error)?;

    let name = dest.file_name().unwrap_or_default();
    let extracted = staging.join(name);
    if !extracted.is_dir() {
        return Err(extract_error(io::Error::new(
            io::ErrorKind::NotFound,
            format!("archive did not contain {}", name.to_string_lossy()),
        )));
    }
    remove(dest)?;
    fs::rename(&extracted, dest).map_err(extract_error)
}

fn unpack(archive: &Path, destination: &Path) -> io::Result<()> {
    let file = File::open(archive)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);
    archive.unpack(destination)
}

fn remove(path: &Path) -> io::Result<()> {
    tracing::debug!(path = %path.display(), "deleting bundle");
    match fs::remove_dir_all(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
