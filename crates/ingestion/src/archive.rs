//! Decomposition of archive sources into their member files.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use tempfile::TempDir;
use tracing::{debug, instrument};
use walkdir::WalkDir;

use ts_common::{DataDisposition, DataSource};

use crate::error::{IngestionError, Result};

/// Files unpacked from an archive.
///
/// The temporary directory is removed when the last clone of `dir` drops, so
/// every task ingesting a child should hold one.
#[derive(Debug, Clone)]
pub struct Decomposed {
    pub dir: Arc<TempDir>,
    pub children: Vec<PathBuf>,
}

/// Unpack a `Gzip` or `Tarball` source into a fresh temporary directory.
#[instrument(skip(source), fields(uri = %source.uri()))]
pub async fn decompose(source: &DataSource) -> Result<Decomposed> {
    let path = source.path().ok_or_else(|| {
        IngestionError::InvalidSource(format!("archive {} is not a local file", source.uri()))
    })?;
    let disposition = source.disposition();

    let decomposed = tokio::task::spawn_blocking(move || -> Result<Decomposed> {
        let dir = tempfile::Builder::new().prefix("ts-ingest-").tempdir()?;
        let children = match disposition {
            DataDisposition::Gzip => vec![inflate_gzip(&path, dir.path())?],
            DataDisposition::Tarball => unpack_tar(&path, dir.path())?,
            other => {
                return Err(IngestionError::InvalidSource(format!(
                    "{} is not an archive disposition",
                    other
                )))
            }
        };
        Ok(Decomposed {
            dir: Arc::new(dir),
            children,
        })
    })
    .await
    .map_err(|e| IngestionError::Decompression(format!("decompression task failed: {}", e)))??;

    debug!(children = decomposed.children.len(), "Decomposed archive");
    Ok(decomposed)
}

/// Inflate a gzip file into `dir`, naming the output after the input without
/// its compression suffix (`.tgz` becomes `.tar`).
pub fn inflate_gzip(path: &Path, dir: &Path) -> Result<PathBuf> {
    let target = dir.join(inflated_name(path));

    let mut decoder = GzDecoder::new(File::open(path)?);
    let mut output = File::create(&target)?;
    io::copy(&mut decoder, &mut output)
        .map_err(|e| IngestionError::Decompression(format!("{}: {}", path.display(), e)))?;

    Ok(target)
}

/// Unpack a tar file into `dir` and list the regular files it contained.
pub fn unpack_tar(path: &Path, dir: &Path) -> Result<Vec<PathBuf>> {
    let mut archive = tar::Archive::new(File::open(path)?);
    archive
        .unpack(dir)
        .map_err(|e| IngestionError::Decompression(format!("{}: {}", path.display(), e)))?;

    let mut children: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    children.sort();
    Ok(children)
}

fn inflated_name(path: &Path) -> String {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("inflated");
    let lower = name.to_lowercase();

    if lower.ends_with(".tgz") {
        format!("{}.tar", &name[..name.len() - 4])
    } else if lower.ends_with(".gz") {
        name[..name.len() - 3].to_string()
    } else if lower.ends_with(".gzip") {
        name[..name.len() - 5].to_string()
    } else {
        format!("{}.inflated", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::{data_source, temp_test_dir, write_gzip_file, write_tar_file};

    #[test]
    fn test_inflated_name() {
        assert_eq!(inflated_name(Path::new("/a/obs.csv.gz")), "obs.csv");
        assert_eq!(inflated_name(Path::new("/a/all.tgz")), "all.tar");
        assert_eq!(inflated_name(Path::new("/a/blob")), "blob.inflated");
    }

    #[test]
    fn test_inflate_gzip_round_trip() {
        let input = temp_test_dir();
        let output = temp_test_dir();
        let archive = input.path().join("obs.csv.gz");
        write_gzip_file(&archive, b"value_date,value\n");

        let inflated = inflate_gzip(&archive, output.path()).unwrap();
        assert_eq!(inflated.file_name().unwrap(), "obs.csv");
        assert_eq!(std::fs::read(inflated).unwrap(), b"value_date,value\n");
    }

    #[test]
    fn test_corrupt_gzip_is_decompression_error() {
        let input = temp_test_dir();
        let output = temp_test_dir();
        let archive = input.path().join("bad.gz");
        std::fs::write(&archive, [0x1f, 0x8b, 0x00, 0x01, 0x02]).unwrap();

        let err = inflate_gzip(&archive, output.path()).unwrap_err();
        assert!(matches!(err, IngestionError::Decompression(_)));
    }

    #[tokio::test]
    async fn test_decompose_tarball_lists_members() {
        let input = temp_test_dir();
        let archive = input.path().join("bundle.tar");
        write_tar_file(&archive, &[("a.csv", &b"a"[..]), ("nested/b.csv", &b"b"[..])]);

        let source = data_source(archive.to_str().unwrap(), DataDisposition::Tarball);
        let decomposed = decompose(&source).await.unwrap();

        let names: Vec<String> = decomposed
            .children
            .iter()
            .map(|p| p.strip_prefix(decomposed.dir.path()).unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["a.csv", "nested/b.csv"]);
    }

    #[tokio::test]
    async fn test_temp_dir_removed_with_last_handle() {
        let input = temp_test_dir();
        let archive = input.path().join("obs.csv.gz");
        write_gzip_file(&archive, b"x");

        let source = data_source(archive.to_str().unwrap(), DataDisposition::Gzip);
        let decomposed = decompose(&source).await.unwrap();
        let dir = decomposed.dir.path().to_path_buf();
        assert!(dir.exists());

        drop(decomposed);
        assert!(!dir.exists());
    }
}
