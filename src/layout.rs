use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::ResolvedTarget;
use crate::error::SyncError;
use crate::naming;

/// The local mirror: `base/<species>/<file>`.
#[derive(Debug, Clone)]
pub struct MirrorLayout {
    base: Utf8PathBuf,
}

impl MirrorLayout {
    pub fn new(base: impl Into<Utf8PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Utf8Path {
        &self.base
    }

    pub fn species_dir(&self, species: &str) -> Utf8PathBuf {
        self.base.join(species)
    }

    pub fn target_path(&self, target: &ResolvedTarget) -> Utf8PathBuf {
        self.base.join(target.relative_path())
    }

    /// Create the base directory if needed and check that files can be written in it.
    pub fn ensure_base_dir(&self) -> Result<(), SyncError> {
        ensure_writable_dir(self.base.as_std_path())
    }

    /// Create `base/<species>`. Safe to call repeatedly.
    pub fn ensure_species_dir(&self, species: &str) -> Result<Utf8PathBuf, SyncError> {
        let dir = self.species_dir(species);
        if dir.as_std_path().is_dir() {
            return Ok(dir);
        }
        fs::create_dir_all(dir.as_std_path()).map_err(|err| permission(dir.as_std_path(), err))?;
        Ok(dir)
    }

    /// Every CDS file already in the mirror, sorted.
    ///
    /// A plain `.fa` sitting next to its own `.fa.gz` is the decompressed
    /// conversion input, not a separate dataset, and is left out.
    pub fn discover_cds_files(&self) -> Result<Vec<Utf8PathBuf>, SyncError> {
        if !self.base.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for path in walk_files(self.base.as_std_path())? {
            let Ok(path) = Utf8PathBuf::from_path_buf(path) else {
                continue;
            };
            let Some(name) = path.file_name() else {
                continue;
            };
            if !naming::is_cds_filename(name) {
                continue;
            }
            let compressed_sibling = path.with_file_name(format!("{name}.gz"));
            if compressed_sibling.as_std_path().is_file() {
                continue;
            }
            files.push(path);
        }
        files.sort();
        Ok(files)
    }
}

fn ensure_writable_dir(dir: &Path) -> Result<(), SyncError> {
    fs::create_dir_all(dir).map_err(|err| permission(dir, err))?;
    if !dir.is_dir() {
        return Err(SyncError::Permission {
            path: dir.to_path_buf(),
            message: "not a directory".to_string(),
        });
    }
    tempfile::Builder::new()
        .prefix(".cds-sync-probe")
        .tempfile_in(dir)
        .map_err(|err| permission(dir, err))?;
    Ok(())
}

fn permission(path: &Path, err: io::Error) -> SyncError {
    SyncError::Permission {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn walk_files(root: &Path) -> Result<Vec<PathBuf>, SyncError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path)
            .map_err(|err| SyncError::Filesystem(format!("read {}: {err}", path.display())))?;
        for entry in entries {
            let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                items.push(path);
            }
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn layout_in(temp: &tempfile::TempDir) -> MirrorLayout {
        MirrorLayout::new(Utf8PathBuf::from_path_buf(temp.path().join("mirror")).unwrap())
    }

    #[test]
    fn ensure_base_dir_creates_missing_dir() {
        let temp = tempfile::tempdir().unwrap();
        let layout = layout_in(&temp);
        layout.ensure_base_dir().unwrap();
        assert!(layout.base().as_std_path().is_dir());
        assert_eq!(fs::read_dir(layout.base().as_std_path()).unwrap().count(), 0);
    }

    #[test]
    fn ensure_base_dir_rejects_file() {
        let temp = tempfile::tempdir().unwrap();
        let layout = layout_in(&temp);
        fs::write(layout.base().as_std_path(), b"not a dir").unwrap();
        assert_matches!(layout.ensure_base_dir(), Err(SyncError::Permission { .. }));
    }

    #[test]
    fn ensure_species_dir_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let layout = layout_in(&temp);
        layout.ensure_base_dir().unwrap();

        let first = layout.ensure_species_dir("Athaliana").unwrap();
        let second = layout.ensure_species_dir("Athaliana").unwrap();
        assert_eq!(first, second);
        assert!(first.ends_with("mirror/Athaliana"));
        assert_eq!(fs::read_dir(layout.base().as_std_path()).unwrap().count(), 1);
    }

    #[test]
    fn target_path_layout() {
        let layout = MirrorLayout::new("/data/mirror");
        let target = ResolvedTarget {
            local_filename: "Athaliana.cds.fa.gz".to_string(),
            species_name: "Athaliana".to_string(),
        };
        assert_eq!(
            layout.target_path(&target).as_str(),
            "/data/mirror/Athaliana/Athaliana.cds.fa.gz"
        );
    }

    #[test]
    fn discover_finds_cds_files_only() {
        let temp = tempfile::tempdir().unwrap();
        let layout = layout_in(&temp);
        let a = layout.ensure_species_dir("Athaliana").unwrap();
        let b = layout.ensure_species_dir("Osativa").unwrap();
        fs::write(a.join("Athaliana.cds.fa.gz"), b"x").unwrap();
        fs::write(a.join("Athaliana.cds.fa"), b"x").unwrap();
        fs::write(a.join("Athaliana.cds.nhr"), b"x").unwrap();
        fs::write(b.join("Osativa.cds.fa"), b"x").unwrap();

        let files = layout.discover_cds_files().unwrap();
        assert_eq!(
            files,
            vec![a.join("Athaliana.cds.fa.gz"), b.join("Osativa.cds.fa")]
        );
    }

    #[test]
    fn discover_on_missing_base_is_empty() {
        let temp = tempfile::tempdir().unwrap();
        let layout = layout_in(&temp);
        assert!(layout.discover_cds_files().unwrap().is_empty());
    }
}
