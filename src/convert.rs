use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::MultiGzDecoder;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::SyncError;
use crate::layout::MirrorLayout;
use crate::sync::worker_pool;

/// Turns one verified CDS file into a searchable database.
pub trait Converter: Send + Sync {
    /// Exit code of the conversion tool, or `None` if it was killed by a signal.
    fn convert(&self, file: &Utf8Path) -> Result<Option<i32>, SyncError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionOutcome {
    pub file: Utf8PathBuf,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl ConversionOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// NCBI `makeblastdb`, building a nucleotide database next to each file.
#[derive(Debug, Clone)]
pub struct MakeBlastDb {
    program: Option<PathBuf>,
}

impl MakeBlastDb {
    /// Use `program` if given, otherwise look `makeblastdb` up on `PATH`.
    pub fn new(program: Option<PathBuf>) -> Self {
        Self {
            program: program.or_else(|| find_in_path("makeblastdb")),
        }
    }

    pub fn program(&self) -> Option<&PathBuf> {
        self.program.as_ref()
    }

    fn require_program(&self) -> Result<&PathBuf, SyncError> {
        self.program
            .as_ref()
            .ok_or_else(|| SyncError::MissingTool("makeblastdb".to_string()))
    }
}

impl Converter for MakeBlastDb {
    fn convert(&self, file: &Utf8Path) -> Result<Option<i32>, SyncError> {
        let program = self.require_program()?;
        let fasta = plain_fasta(file)?;
        let out = database_prefix(&fasta);
        let output = Command::new(program)
            .args(["-in", fasta.as_str(), "-dbtype", "nucl", "-out", out.as_str()])
            .output()
            .map_err(|err| SyncError::MissingTool(format!("{}: {err}", program.display())))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(file = %file, stderr = %stderr.trim(), "makeblastdb failed");
        }
        if let Err(err) = remove_plain_copy(file) {
            warn!(file = %file, "could not remove decompressed copy: {err}");
        }
        Ok(output.status.code())
    }
}

/// Path of an uncompressed copy of `file`, decompressing `*.gz` next to it.
pub fn plain_fasta(file: &Utf8Path) -> Result<Utf8PathBuf, SyncError> {
    let Some(stem) = file.as_str().strip_suffix(".gz") else {
        return Ok(file.to_path_buf());
    };
    let target = Utf8PathBuf::from(stem);
    let parent = target
        .parent()
        .ok_or_else(|| SyncError::Filesystem(format!("no parent directory for {target}")))?;

    let source = File::open(file.as_std_path())
        .map_err(|err| SyncError::Filesystem(format!("open {file}: {err}")))?;
    let mut decoder = MultiGzDecoder::new(source);
    let mut temp = tempfile::Builder::new()
        .prefix(".cds-sync-")
        .suffix(".fa")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    io::copy(&mut decoder, temp.as_file_mut())
        .map_err(|err| SyncError::Filesystem(format!("decompress {file}: {err}")))?;
    temp.persist(target.as_std_path())
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    Ok(target)
}

fn database_prefix(fasta: &Utf8Path) -> Utf8PathBuf {
    match fasta.extension() {
        Some("fa" | "fasta" | "fna") => fasta.with_extension(""),
        _ => fasta.to_path_buf(),
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.is_file() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.is_file() {
            return Some(plain);
        }
    }
    None
}

/// Runs a [`Converter`] over a batch. One file failing never stops the others.
pub struct ConversionDispatcher<C: Converter> {
    converter: C,
    threads: usize,
    cancel: CancelToken,
}

impl<C: Converter> ConversionDispatcher<C> {
    pub fn new(converter: C, threads: usize, cancel: CancelToken) -> Self {
        Self {
            converter,
            threads: threads.max(1),
            cancel,
        }
    }

    /// Convert `paths`, or every CDS file in the mirror when `paths` is empty.
    /// Outcomes come back in input order, one per file.
    pub fn convert(
        &self,
        layout: &MirrorLayout,
        paths: Vec<Utf8PathBuf>,
    ) -> Result<Vec<ConversionOutcome>, SyncError> {
        let paths = if paths.is_empty() {
            let found = layout.discover_cds_files()?;
            info!(count = found.len(), base = %layout.base(), "rediscovered local CDS files");
            found
        } else {
            paths
        };
        if paths.is_empty() {
            return Ok(Vec::new());
        }

        let pool = worker_pool(self.threads)?;
        Ok(pool.install(|| paths.par_iter().map(|path| self.convert_one(path)).collect()))
    }

    fn convert_one(&self, file: &Utf8Path) -> ConversionOutcome {
        if self.cancel.is_cancelled() {
            return ConversionOutcome {
                file: file.to_path_buf(),
                exit_code: None,
                error: Some(SyncError::Cancelled.to_string()),
            };
        }
        info!(file = %file, "converting");
        match self.converter.convert(file) {
            Ok(Some(0)) => ConversionOutcome {
                file: file.to_path_buf(),
                exit_code: Some(0),
                error: None,
            },
            Ok(Some(code)) => {
                let err = SyncError::Conversion {
                    file: file.to_string(),
                    code,
                };
                warn!("{err}");
                ConversionOutcome {
                    file: file.to_path_buf(),
                    exit_code: Some(code),
                    error: Some(err.to_string()),
                }
            }
            Ok(None) => {
                warn!(file = %file, "conversion tool terminated by signal");
                ConversionOutcome {
                    file: file.to_path_buf(),
                    exit_code: None,
                    error: Some("terminated by signal".to_string()),
                }
            }
            Err(err) => {
                warn!(file = %file, "conversion failed: {err}");
                ConversionOutcome {
                    file: file.to_path_buf(),
                    exit_code: None,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}

/// Remove a decompressed sibling left behind by [`plain_fasta`].
fn remove_plain_copy(file: &Utf8Path) -> Result<(), SyncError> {
    if let Some(stem) = file.as_str().strip_suffix(".gz") {
        let plain = Utf8Path::new(stem);
        if plain.as_std_path().is_file() {
            fs::remove_file(plain.as_std_path())
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        }
    }
    Ok(())
}
