//! Small JSON side files (namespace state, session environment).
//!
//! Files are written through a temp file in the same directory and renamed
//! into place, so a reader never sees a half-written record.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Mode for side files: readable by the unprivileged user after a root write.
const SIDE_FILE_MODE: u32 = 0o644;

/// Failure reading or writing a JSON side file.
#[derive(Debug)]
pub(crate) enum JsonFileError {
    Io(io::Error),
    Json(serde_json::Error),
}

/// Read a JSON file; `Ok(None)` when it does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, JsonFileError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(JsonFileError::Io(e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(JsonFileError::Json)
}

/// Atomically replace `path` with the JSON encoding of `value`.
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), JsonFileError> {
    let json = serde_json::to_vec_pretty(value).map_err(JsonFileError::Json)?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(JsonFileError::Io)?;

    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(JsonFileError::Io)?;
    file.write_all(&json).map_err(JsonFileError::Io)?;
    file.write_all(b"\n").map_err(JsonFileError::Io)?;
    file.as_file()
        .set_permissions(fs::Permissions::from_mode(SIDE_FILE_MODE))
        .map_err(JsonFileError::Io)?;
    file.persist(path).map_err(|e| JsonFileError::Io(e.error))?;
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let value: Option<BTreeMap<String, u32>> =
            read_json(&dir.path().join("absent.json")).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_write_creates_parent_and_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("value.json");
        let mut value = BTreeMap::new();
        value.insert("pid".to_string(), 31337u32);

        write_json(&path, &value).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, SIDE_FILE_MODE);
        let back: BTreeMap<String, u32> = read_json(&path).unwrap().unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.json");
        fs::write(&path, "{}").unwrap();
        remove(&path).unwrap();
        remove(&path).unwrap();
        assert!(!path.exists());
    }
}
