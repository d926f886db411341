//! Atomic JSON persistence shared by every document the kernel writes to the
//! state root: tmp-write, fsync, rename, best-effort fsync of the parent
//! directory. Grounded on `state.rs`'s `atomic_write_json`/`fsync_parent_dir`.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Serialize, de::DeserializeOwned};

/// Best-effort fsync of the parent directory after a rename, so the
/// directory entry update survives a crash. Ignored where unsupported
/// (e.g. Windows cannot open a directory for sync).
pub(crate) fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;

    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        f.write_all(&data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path).with_context(|| {
        format!("failed to rename tmp file {} to {}", tmp.display(), path.display())
    })?;

    fsync_parent_dir(path);
    Ok(())
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse JSON {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Doc {
        n: u32,
    }

    #[test]
    fn round_trips_through_atomic_write_and_load() {
        let td = tempdir().unwrap();
        let path = td.path().join("sub").join("doc.json");
        atomic_write_json(&path, &Doc { n: 7 }).unwrap();
        let loaded: Option<Doc> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(Doc { n: 7 }));
    }

    #[test]
    fn missing_file_loads_as_none() {
        let td = tempdir().unwrap();
        let loaded: Option<Doc> = load_json(&td.path().join("missing.json")).unwrap();
        assert_eq!(loaded, None);
    }

    #[test]
    fn no_tmp_file_left_behind_after_write() {
        let td = tempdir().unwrap();
        let path = td.path().join("doc.json");
        atomic_write_json(&path, &Doc { n: 1 }).unwrap();
        assert!(!path.with_extension("tmp").exists());
    }
}
