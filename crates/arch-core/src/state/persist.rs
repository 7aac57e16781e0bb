//! Atomic partition persistence: serialize a partition to JSON and
//! replace its file via a temp-file-plus-rename sequence, so a reader
//! (or a crash mid-write) never observes a half-written file.

use std::path::Path;

use serde::Serialize;
use uuid::Uuid;

use crate::error::StateError;

/// Serialize `value` and atomically replace the file at `path`.
///
/// The temp file is written alongside the target (same directory, same
/// filesystem) so the final rename is atomic on POSIX and NTFS alike.
pub fn write_atomic<T: Serialize>(path: &Path, partition: &str, value: &T) -> Result<(), StateError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|source| StateError::Persist {
        partition: partition.to_string(),
        source,
    })?;

    let tmp_name = format!(".{partition}-{}.tmp", Uuid::new_v4());
    let tmp_path = dir.join(tmp_name);

    let json = serde_json::to_vec_pretty(value).map_err(|source| StateError::Decode {
        partition: partition.to_string(),
        source,
    })?;

    std::fs::write(&tmp_path, &json).map_err(|source| StateError::Persist {
        partition: partition.to_string(),
        source,
    })?;

    std::fs::rename(&tmp_path, path).map_err(|source| StateError::Persist {
        partition: partition.to_string(),
        source,
    })?;

    Ok(())
}

/// Load a partition from disk. A missing file yields `default`. A file
/// that fails to parse is treated as `StateCorruption`: log a warning at
/// the call site and reinitialize the partition empty -- the run is
/// recoverable, not fatal. This function itself just reports which
/// happened so the caller can log consistently.
pub enum LoadOutcome<T> {
    Loaded(T),
    Missing(T),
    Corrupt(T),
}

pub fn load_or_default<T>(path: &Path, default: T) -> LoadOutcome<T>
where
    T: serde::de::DeserializeOwned,
{
    let Ok(text) = std::fs::read_to_string(path) else {
        return LoadOutcome::Missing(default);
    };
    match serde_json::from_str::<T>(&text) {
        Ok(value) => LoadOutcome::Loaded(value),
        Err(_) => LoadOutcome::Corrupt(default),
    }
}
