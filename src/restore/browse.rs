// restore/browse.rs
//
// Read-only filesystem walking within a mounted backup.

use crate::restore::error::RestoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// One directory entry of a mounted backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size_bytes: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Resolves a caller-supplied path against the mount root, refusing
/// anything that would escape it.
pub fn resolve_path(root: &Path, requested: &str) -> Result<PathBuf, RestoreError> {
    let requested = requested.trim_start_matches('/');
    let mut resolved = root.to_path_buf();
    for component in Path::new(requested).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return Err(RestoreError::InvalidPath(requested.to_string())),
        }
    }
    Ok(resolved)
}

/// Lists one directory of a mounted backup.
pub async fn list_dir(root: &Path, requested: &str) -> Result<Vec<FileEntry>, RestoreError> {
    let dir = resolve_path(root, requested)?;
    let mut entries = Vec::new();
    let mut reader = tokio::fs::read_dir(&dir).await?;
    while let Some(entry) = reader.next_entry().await? {
        let metadata = entry.metadata().await?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let relative = match entry.path().strip_prefix(root) {
            Ok(relative) => format!("/{}", relative.display()),
            Err(_) => continue,
        };
        entries.push(FileEntry {
            name,
            path: relative,
            is_dir: metadata.is_dir(),
            size_bytes: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Opens one file of a mounted backup for download.
pub async fn open_file(root: &Path, requested: &str) -> Result<tokio::fs::File, RestoreError> {
    let path = resolve_path(root, requested)?;
    let file = tokio::fs::File::open(&path).await?;
    let metadata = file.metadata().await?;
    if metadata.is_dir() {
        return Err(RestoreError::InvalidPath(format!(
            "{} is a directory",
            requested
        )));
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn traversal_is_rejected() {
        let root = Path::new("/mnt/restore-1");
        assert!(resolve_path(root, "../etc/passwd").is_err());
        assert!(resolve_path(root, "a/../../b").is_err());
        assert_eq!(
            resolve_path(root, "/var/log/syslog").unwrap(),
            root.join("var/log/syslog")
        );
        assert_eq!(resolve_path(root, "./a/b").unwrap(), root.join("a/b"));
    }

    #[tokio::test]
    async fn list_and_download_round_trip() {
        let dir = TempDir::new().unwrap();
        tokio::fs::create_dir(dir.path().join("etc")).await.unwrap();
        tokio::fs::write(dir.path().join("etc/hostname"), b"vm42\n")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("README"), b"hello")
            .await
            .unwrap();

        let entries = list_dir(dir.path(), "/").await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["README", "etc"]);
        assert!(entries.iter().any(|e| e.is_dir && e.name == "etc"));

        let nested = list_dir(dir.path(), "/etc").await.unwrap();
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].path, "/etc/hostname");
        assert_eq!(nested[0].size_bytes, 5);

        let mut file = open_file(dir.path(), "/etc/hostname").await.unwrap();
        let mut content = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut file, &mut content)
            .await
            .unwrap();
        assert_eq!(content, "vm42\n");

        assert!(open_file(dir.path(), "/etc").await.is_err());
    }
}
