use std::sync::LazyLock;

use regex::Regex;

use crate::domain::ResolvedTarget;
use crate::error::SyncError;

static CDS_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\.cds(_primaryTranscriptOnly)?\.(fa|fasta|fna)(\.gz)?$").unwrap()
});

/// Map a remote resource URL onto its place in the local mirror.
///
/// The file name is the last path segment of the URL (query and fragment
/// ignored); the species name is that file name without its CDS suffix.
pub fn resolve(url: &str) -> Result<ResolvedTarget, SyncError> {
    let local_filename = local_filename(url)?;
    let species_name = species_from_filename(&local_filename)
        .ok_or_else(|| SyncError::InvalidUrl(url.to_string()))?;
    Ok(ResolvedTarget {
        local_filename,
        species_name,
    })
}

/// Last path segment of `url`. Percent-escapes are not decoded, so an
/// encoded `%2F` or `%2E%2E` stays part of a single file name and can never
/// step outside the species directory.
pub fn local_filename(url: &str) -> Result<String, SyncError> {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .trim_end_matches('/');
    let name = path.rsplit('/').next().unwrap_or_default();
    if name.is_empty() || name.contains(':') || name == "." || name == ".." {
        return Err(SyncError::InvalidUrl(url.to_string()));
    }
    Ok(name.to_string())
}

/// Species name for a CDS file name, or `None` if the name is not a CDS file.
pub fn species_from_filename(filename: &str) -> Option<String> {
    let suffix = CDS_SUFFIX.find(filename)?;
    let species = &filename[..suffix.start()];
    if species.is_empty() {
        return None;
    }
    Some(species.to_string())
}

pub fn is_cds_filename(filename: &str) -> bool {
    species_from_filename(filename).is_some()
}

pub fn is_cds_url(url: &str) -> bool {
    local_filename(url)
        .map(|name| is_cds_filename(&name))
        .unwrap_or(false)
}
