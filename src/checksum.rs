//! MD5 digests of mirrored files.
//!
//! The portal declares an MD5 for every file it serves. Nothing is cached on
//! disk: the local digest is recomputed from file contents on every run.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use md5::{Digest, Md5};
use serde::Serialize;

use crate::error::SyncError;

const BUFFER_SIZE: usize = 64 * 1024;

/// MD5 digest, compared as trimmed lowercase text.
///
/// Declared digests are kept even when they are not 32 hex digits; such a
/// value can never equal a computed digest, so the entry fails verification
/// instead of vanishing from the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Md5Digest(String);

impl Md5Digest {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_well_formed(&self) -> bool {
        self.0.len() == 32 && self.0.chars().all(|ch| ch.is_ascii_hexdigit())
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(format!("{:x}", Md5::digest(bytes)))
    }
}

impl fmt::Display for Md5Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Md5Digest {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        if normalized.is_empty() || normalized.chars().any(char::is_whitespace) {
            return Err(SyncError::InvalidChecksum(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// Stream a file through MD5.
pub fn file_md5(path: &Path) -> Result<Md5Digest, SyncError> {
    let file = File::open(path)
        .map_err(|err| SyncError::Filesystem(format!("open {}: {err}", path.display())))?;
    reader_md5(file)
        .map_err(|err| SyncError::Filesystem(format!("read {}: {err}", path.display())))
}

fn reader_md5<R: Read>(mut reader: R) -> io::Result<Md5Digest> {
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(Md5Digest(format!("{:x}", hasher.finalize())))
}

/// MD5 of the file at `path`, or `None` when there is no such file.
pub fn local_md5(path: &Path) -> Result<Option<Md5Digest>, SyncError> {
    if !path.is_file() {
        return Ok(None);
    }
    file_md5(path).map(Some)
}
