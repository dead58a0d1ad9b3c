// export/include.rs
//
// Include-file format: one file per export under the include directory,
// nbd-server conf.d style. The size is always explicit, taken from the
// image metadata, never from stat.
//
//   [backup-vm42-disk0-full-20260801T123045]
//   exportname = /srv/backups/vm42-disk0/bk-1.vvc
//   readonly = true
//   size = 10737418240

use crate::export::error::ExportError;
use std::path::{Path, PathBuf};

/// One export as described by its include file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub name: String,
    pub backing_path: PathBuf,
    pub read_only: bool,
    pub size_bytes: u64,
}

impl ExportEntry {
    /// Renders the include-file content for this entry.
    pub fn render(&self) -> String {
        format!(
            "[{}]\nexportname = {}\nreadonly = {}\nsize = {}\n",
            self.name,
            self.backing_path.display(),
            self.read_only,
            self.size_bytes
        )
    }

    /// Parses an include file's content.
    pub fn parse(content: &str) -> Result<ExportEntry, ExportError> {
        let mut name = None;
        let mut backing_path = None;
        let mut read_only = None;
        let mut size_bytes = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                if name.is_some() {
                    return Err(ExportError::IncludeFormat(
                        "multiple sections in one include file".into(),
                    ));
                }
                name = Some(section.to_string());
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ExportError::IncludeFormat(format!(
                    "unparseable line '{}'",
                    line
                )));
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "exportname" => backing_path = Some(PathBuf::from(value)),
                "readonly" => {
                    read_only = Some(value.parse::<bool>().map_err(|_| {
                        ExportError::IncludeFormat(format!("bad readonly value '{}'", value))
                    })?)
                }
                "size" => {
                    size_bytes = Some(value.parse::<u64>().map_err(|_| {
                        ExportError::IncludeFormat(format!("bad size value '{}'", value))
                    })?)
                }
                other => {
                    return Err(ExportError::IncludeFormat(format!(
                        "unknown key '{}'",
                        other
                    )))
                }
            }
        }

        let name = name.ok_or_else(|| ExportError::IncludeFormat("missing section".into()))?;
        let backing_path = backing_path
            .ok_or_else(|| ExportError::IncludeFormat("missing exportname".into()))?;
        if !backing_path.is_absolute() {
            return Err(ExportError::IncludeFormat(format!(
                "backing path {} is not absolute",
                backing_path.display()
            )));
        }
        let read_only =
            read_only.ok_or_else(|| ExportError::IncludeFormat("missing readonly".into()))?;
        let size_bytes =
            size_bytes.ok_or_else(|| ExportError::IncludeFormat("missing size".into()))?;

        Ok(ExportEntry {
            name,
            backing_path,
            read_only,
            size_bytes,
        })
    }
}

/// Path of the include file for an export name.
pub fn include_file_path(include_dir: &Path, name: &str) -> PathBuf {
    include_dir.join(format!("{}.conf", name))
}

/// Atomically writes an include file: write to a dotfile sibling, fsync,
/// rename into place.
pub async fn write_include_file(
    include_dir: &Path,
    entry: &ExportEntry,
) -> Result<(), ExportError> {
    let final_path = include_file_path(include_dir, &entry.name);
    let temp_path = include_dir.join(format!(".{}.conf.tmp", entry.name));

    let mut file = tokio::fs::File::create(&temp_path).await?;
    tokio::io::AsyncWriteExt::write_all(&mut file, entry.render().as_bytes()).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&temp_path, &final_path).await?;
    Ok(())
}

/// Reads every include file in the directory. Unparseable files are
/// skipped with a warning so one bad file cannot take down the reload.
pub async fn read_include_dir(include_dir: &Path) -> Result<Vec<ExportEntry>, ExportError> {
    let mut entries = Vec::new();
    let mut dir = tokio::fs::read_dir(include_dir).await?;
    while let Some(dirent) = dir.next_entry().await? {
        let path = dirent.path();
        if path.extension().and_then(|e| e.to_str()) != Some("conf") {
            continue;
        }
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if file_name.starts_with('.') {
            continue; // in-flight temp file
        }
        let content = tokio::fs::read_to_string(&path).await?;
        match ExportEntry::parse(&content) {
            Ok(entry) => entries.push(entry),
            Err(e) => log::warn!("skipping include file {}: {}", path.display(), e),
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry() -> ExportEntry {
        ExportEntry {
            name: "backup-vm42-disk0-full-20260801T123045".to_string(),
            backing_path: PathBuf::from("/srv/backups/vm42-disk0/bk-1.vvc"),
            read_only: false,
            size_bytes: 10_737_418_240,
        }
    }

    #[test]
    fn render_parse_round_trip() {
        let original = entry();
        let parsed = ExportEntry::parse(&original.render()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn parse_rejects_relative_backing_path() {
        let content = "[e]\nexportname = relative/path\nreadonly = true\nsize = 1\n";
        assert!(ExportEntry::parse(content).is_err());
    }

    #[test]
    fn parse_rejects_missing_size() {
        let content = "[e]\nexportname = /abs/path\nreadonly = true\n";
        assert!(matches!(
            ExportEntry::parse(content),
            Err(ExportError::IncludeFormat(_))
        ));
    }

    #[tokio::test]
    async fn write_and_read_include_dir() {
        let dir = TempDir::new().unwrap();
        let first = entry();
        let second = ExportEntry {
            name: "backup-vm7-disk1-incr-20260801T130000".to_string(),
            backing_path: PathBuf::from("/srv/backups/vm7-disk1/bk-2.vvc"),
            read_only: true,
            size_bytes: 512,
        };

        write_include_file(dir.path(), &first).await.unwrap();
        write_include_file(dir.path(), &second).await.unwrap();

        let entries = read_include_dir(dir.path()).await.unwrap();
        assert_eq!(entries.len(), 2);
        // Sorted by name: "vm42" orders before "vm7".
        assert_eq!(entries[0], first);
        assert_eq!(entries[1], second);
    }
}
