//! Path and environment helpers for tests.

use std::path::{Path, PathBuf};

/// Connection URL of a disposable test database, from `TEST_DATABASE_URL`.
pub fn test_database_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL")
        .ok()
        .filter(|url| !url.trim().is_empty())
}

/// Creates a temporary directory for test input files.
///
/// The directory is automatically cleaned up when the returned `TempDir` is dropped.
pub fn temp_test_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temporary test directory")
}

/// Writes `contents` to `dir/relative`, creating parent directories.
///
/// # Returns
///
/// The full path of the written file.
pub fn write_test_file(dir: &Path, relative: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create test subdirectory");
    }
    std::fs::write(&path, contents).expect("Failed to write test file");
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_test_file_creates_parents() {
        let dir = temp_test_dir();
        let path = write_test_file(dir.path(), "nested/deeper/a.csv", b"x");
        assert!(path.exists());
        assert_eq!(std::fs::read(path).unwrap(), b"x");
    }
}
