//! Remote manifest extraction.
//!
//! The portal lists its downloads as an XML tree in which every file is a
//! `<file .../>` element carrying `url` and `md5` attributes. Only the
//! attributes are needed, so elements are picked out with regexes rather than
//! a full XML parser.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::checksum::Md5Digest;
use crate::domain::ManifestEntry;
use crate::error::SyncError;
use crate::naming;
use crate::portal::PortalSession;

static FILE_ELEMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<file\b[^>]*>").unwrap());
static ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([A-Za-z_][\w.-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap());

/// A listing row before CDS selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawEntry {
    pub url: String,
    pub md5: Option<String>,
}

/// Retrieve every file entry visible to `session`. Not retried.
pub fn list_entries<S: PortalSession + ?Sized>(session: &S) -> Result<Vec<RawEntry>, SyncError> {
    let listing = session.fetch_listing()?;
    let entries = parse_listing(&listing, session.base_url());
    debug!(count = entries.len(), "parsed portal listing");
    Ok(entries)
}

pub fn parse_listing(listing: &str, base_url: &str) -> Vec<RawEntry> {
    FILE_ELEMENT
        .find_iter(listing)
        .filter_map(|element| {
            let mut url = None;
            let mut md5 = None;
            for caps in ATTRIBUTE.captures_iter(element.as_str()) {
                let value = caps
                    .get(2)
                    .or_else(|| caps.get(3))
                    .map(|value| decode_entities(value.as_str()));
                match &caps[1] {
                    "url" => url = value,
                    "md5" => md5 = value.filter(|value| !value.trim().is_empty()),
                    _ => {}
                }
            }
            url.filter(|url| !url.is_empty()).map(|url| RawEntry {
                url: absolute_url(base_url, &url),
                md5,
            })
        })
        .collect()
}

/// Keep CDS files, each paired with its declared checksum. Non-CDS files
/// are dropped silently. A CDS file listed without any checksum cannot be
/// verified and is dropped with a warning; a malformed checksum is kept and
/// left to fail verification.
pub fn filter_cds(entries: Vec<RawEntry>) -> Vec<ManifestEntry> {
    entries
        .into_iter()
        .filter(|entry| naming::is_cds_url(&entry.url))
        .filter_map(|entry| {
            let checksum = entry.md5.as_deref().and_then(|md5| md5.parse::<Md5Digest>().ok());
            let Some(checksum) = checksum else {
                warn!(url = %entry.url, "CDS entry has no checksum, skipping");
                return None;
            };
            if !checksum.is_well_formed() {
                warn!(url = %entry.url, %checksum, "declared checksum is not an md5 digest");
            }
            Some(ManifestEntry {
                url: entry.url,
                checksum,
            })
        })
        .collect()
}

pub fn absolute_url(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    let base = base_url.trim_end_matches('/');
    if href.starts_with('/') {
        format!("{base}{href}")
    } else {
        format!("{base}/{href}")
    }
}

fn decode_entities(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<organismDownloads name="PhytozomeV10">
  <folder name="Athaliana">
    <folder name="annotation">
      <file label="Athaliana" filename="Athaliana_167_TAIR10.cds.fa.gz" size="12 MB"
            url="/PhytozomeV10/download/_JAMO/53112a/Athaliana_167_TAIR10.cds.fa.gz"
            md5="9E107D9D372BB6826BD81D3542A419D6" />
      <file filename="Athaliana_167_TAIR10.gene.gff3.gz"
            url="/PhytozomeV10/download/_JAMO/53112b/Athaliana_167_TAIR10.gene.gff3.gz"
            md5="e4d909c290d0fb1ca068ffaddf22cbd0"/>
    </folder>
  </folder>
  <folder name="Osativa">
    <file url="https://mirror.example.org/x/Osativa_204.cds.fa.gz?a=1&amp;b=2" md5="" />
    <file url='/dl/Osativa_204.cds_primaryTranscriptOnly.fa.gz' md5='d41d8cd98f00b204e9800998ecf8427e'/>
  </folder>
</organismDownloads>"#;

    #[test]
    fn parse_listing_extracts_every_file() {
        let entries = parse_listing(LISTING, "https://genome.jgi.doe.gov/");
        assert_eq!(entries.len(), 4);
        assert_eq!(
            entries[0].url,
            "https://genome.jgi.doe.gov/PhytozomeV10/download/_JAMO/53112a/Athaliana_167_TAIR10.cds.fa.gz"
        );
        assert_eq!(
            entries[0].md5.as_deref(),
            Some("9E107D9D372BB6826BD81D3542A419D6")
        );
        assert_eq!(
            entries[2].url,
            "https://mirror.example.org/x/Osativa_204.cds.fa.gz?a=1&b=2"
        );
        assert_eq!(entries[2].md5, None);
    }

    #[test]
    fn filter_keeps_cds_with_checksums() {
        let entries = filter_cds(parse_listing(LISTING, "https://genome.jgi.doe.gov"));
        assert_eq!(entries.len(), 2);
        assert!(entries[0].url.ends_with("Athaliana_167_TAIR10.cds.fa.gz"));
        assert_eq!(
            entries[0].checksum.as_str(),
            "9e107d9d372bb6826bd81d3542a419d6"
        );
        assert!(entries[1].url.ends_with("Osativa_204.cds_primaryTranscriptOnly.fa.gz"));
    }

    #[test]
    fn filter_keeps_malformed_checksums() {
        let entries = vec![
            RawEntry {
                url: "https://x.org/Athaliana.cds.fa.gz".to_string(),
                md5: Some("ABC123".to_string()),
            },
            RawEntry {
                url: "https://x.org/Osativa.cds.fa.gz".to_string(),
                md5: None,
            },
        ];
        let filtered = filter_cds(entries);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].url, "https://x.org/Athaliana.cds.fa.gz");
        assert_eq!(filtered[0].checksum.as_str(), "abc123");
    }

    #[test]
    fn absolute_url_joins() {
        assert_eq!(absolute_url("https://a.org/", "/x/y"), "https://a.org/x/y");
        assert_eq!(absolute_url("https://a.org", "x/y"), "https://a.org/x/y");
        assert_eq!(absolute_url("https://a.org", "http://b.org/z"), "http://b.org/z");
    }

    #[test]
    fn empty_listing() {
        assert!(parse_listing("<organismDownloads/>", "https://a.org").is_empty());
    }
}
