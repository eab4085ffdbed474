//! File I/O primitives with consistent error handling.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Read file contents, mapping failures to `internal.io_error`.
pub fn read_file(path: &Path, operation: &str) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::internal_io(e.to_string(), Some(operation.to_string())))
}

/// Write content to file atomically (write to .tmp, then rename).
///
/// Readers of the target path see either the previous content or the new
/// content, never a partial write.
pub fn write_file_atomic(path: &Path, content: &str, operation: &str) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        Error::internal_io(
            format!("Invalid path: {}", path.display()),
            Some(operation.to_string()),
        )
    })?;

    let filename = path.file_name().ok_or_else(|| {
        Error::internal_io(
            format!("Invalid path: {}", path.display()),
            Some(operation.to_string()),
        )
    })?;

    let tmp_path = parent.join(format!("{}.tmp", filename.to_string_lossy()));

    fs::write(&tmp_path, content).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("{} (write temp)", operation)))
    })?;

    fs::rename(&tmp_path, path)
        .map_err(|e| Error::internal_io(e.to_string(), Some(format!("{} (rename)", operation))))?;

    Ok(())
}

/// Create a directory and all of its parents.
pub fn ensure_dir(path: &Path, operation: &str) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| Error::internal_io(e.to_string(), Some(operation.to_string())))
}

pub fn read_json<T: DeserializeOwned>(path: &Path, operation: &str) -> Result<T> {
    let content = read_file(path, operation)?;
    serde_json::from_str(&content)
        .map_err(|e| Error::internal_json(e.to_string(), Some(operation.to_string())))
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json<T: Serialize>(path: &Path, value: &T, operation: &str) -> Result<()> {
    let content = serde_json::to_string_pretty(value)
        .map_err(|e| Error::internal_json(e.to_string(), Some(operation.to_string())))?;
    write_file_atomic(path, &content, operation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn read_file_succeeds_for_existing_file() {
        let mut temp = NamedTempFile::new().unwrap();
        writeln!(temp, "sample manifest").unwrap();

        let content = read_file(temp.path(), "read manifest").unwrap();
        assert!(content.contains("sample manifest"));
    }

    #[test]
    fn read_file_returns_error_for_missing_file() {
        let err = read_file(Path::new("/nonexistent/path.txt"), "read manifest").unwrap_err();
        assert_eq!(err.code.as_str(), "internal.io_error");
    }

    #[test]
    fn write_json_returns_error_for_invalid_path() {
        let err = write_json(
            Path::new("/nonexistent/dir/file.json"),
            &BTreeMap::<String, String>::new(),
            "store checkpoint",
        )
        .unwrap_err();
        assert_eq!(err.code.as_str(), "internal.io_error");
    }

    #[test]
    fn json_round_trip_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".checkpoints.main.json");
        let mut map = BTreeMap::new();
        map.insert("a.txt".to_string(), "abc".to_string());

        write_json(&path, &map, "store checkpoint").unwrap();
        let back: BTreeMap<String, String> = read_json(&path, "load checkpoint").unwrap();

        assert_eq!(back, map);
        assert!(!dir.path().join(".checkpoints.main.json.tmp").exists());
    }

    #[test]
    fn read_json_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{not json").unwrap();

        let err = read_json::<BTreeMap<String, String>>(&path, "load").unwrap_err();
        assert_eq!(err.code.as_str(), "internal.json_error");
    }
}
