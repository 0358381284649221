//! Checkpoint evidence on disk.
//!
//! The checkpoint helper writes `pages-<pid>.img` for every process it has
//! frozen and deletes the file on restore. The set of checkpointed pids is
//! derived from a directory listing on every call and never cached, since
//! the helper changes the directory behind the harness's back.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;

const PAGES_PREFIX: &str = "pages-";
const PAGES_SUFFIX: &str = ".img";

/// Pid encoded in a `pages-<pid>.img` file name.
#[must_use]
pub fn parse_pages_file_name(name: &str) -> Option<i32> {
    let digits = name.strip_prefix(PAGES_PREFIX)?.strip_suffix(PAGES_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Pids currently checkpointed in `dump_dir`. A missing directory holds no
/// checkpoints.
pub fn checkpointed_pids(dump_dir: &Path) -> io::Result<BTreeSet<i32>> {
    let entries = match fs::read_dir(dump_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(err) => return Err(err),
    };
    let mut pids = BTreeSet::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(pid) = entry.file_name().to_str().and_then(parse_pages_file_name) {
            pids.insert(pid);
        }
    }
    tracing::debug!(dir = %dump_dir.display(), ?pids, "checkpointed pids");
    Ok(pids)
}

/// Every pid in `pids` has a checkpoint file.
pub fn all_checkpointed(dump_dir: &Path, pids: &[i32]) -> io::Result<bool> {
    let checkpointed = checkpointed_pids(dump_dir)?;
    Ok(pids.iter().all(|pid| checkpointed.contains(pid)))
}

/// No pid in `pids` has a checkpoint file.
pub fn all_restored(dump_dir: &Path, pids: &[i32]) -> io::Result<bool> {
    let checkpointed = checkpointed_pids(dump_dir)?;
    Ok(pids.iter().all(|pid| !checkpointed.contains(pid)))
}
