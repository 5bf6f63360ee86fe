//! Reconciliation of one manifest entry against the local mirror.
//!
//! ```text
//! ABSENT ───────────────────────────┐
//! PRESENT ── md5 equal ──> CHECKSUM_MATCH
//!    └────── md5 differs ──> DOWNLOADING ── md5 equal ──> CHECKSUM_VERIFIED
//!                               ^   │
//!                               └───┘ mismatch / transport error (bounded, backoff)
//! ```
//!
//! Every attempt downloads into a temporary file next to the target and only
//! replaces the target once the new content has the declared checksum.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::checksum;
use crate::domain::ManifestEntry;
use crate::error::SyncError;
use crate::portal::PortalSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Absent,
    Present,
    ChecksumMatch,
    Downloading,
    ChecksumVerified,
}

impl EntryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, EntryState::ChecksumMatch | EntryState::ChecksumVerified)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Wait after the `attempt`-th (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500), Duration::from_secs(30))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub path: Utf8PathBuf,
    pub state: EntryState,
    pub attempts: u32,
    pub bytes: u64,
}

impl Reconciliation {
    /// Whether this run wrote new content to the mirror.
    pub fn updated(&self) -> bool {
        self.state == EntryState::ChecksumVerified
    }
}

#[derive(Debug, Clone)]
pub struct DownloadVerifier {
    policy: RetryPolicy,
    cancel: CancelToken,
}

impl DownloadVerifier {
    pub fn new(policy: RetryPolicy, cancel: CancelToken) -> Self {
        Self { policy, cancel }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Bring `target` in line with `entry`, downloading only when the local
    /// file is missing or its MD5 differs from the declared one.
    pub fn reconcile<S: PortalSession + ?Sized>(
        &self,
        session: &S,
        entry: &ManifestEntry,
        target: &Utf8Path,
    ) -> Result<Reconciliation, SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let local = checksum::local_md5(target.as_std_path())?;
        let initial = if local.is_some() {
            EntryState::Present
        } else {
            EntryState::Absent
        };
        debug!(file = %target, state = ?initial, "reconciling");

        if let Some(local) = local {
            if local == entry.checksum {
                debug!(file = %target, "md5 matches, skipping download");
                return Ok(Reconciliation {
                    path: target.to_path_buf(),
                    state: EntryState::ChecksumMatch,
                    attempts: 0,
                    bytes: 0,
                });
            }
            debug!(file = %target, expected = %entry.checksum, actual = %local, "md5 differs");
        }

        if !entry.checksum.is_well_formed() {
            return Err(SyncError::InvalidChecksum(entry.checksum.to_string()));
        }

        let mut last_error = String::new();
        for attempt in 1..=self.policy.max_attempts {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            debug!(file = %target, attempt, state = ?EntryState::Downloading, "downloading");
            match self.download_once(session, entry, target) {
                Ok(bytes) => {
                    return Ok(Reconciliation {
                        path: target.to_path_buf(),
                        state: EntryState::ChecksumVerified,
                        attempts: attempt,
                        bytes,
                    });
                }
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(err) if err.is_retryable() => {
                    warn!(url = %entry.url, attempt, max = self.policy.max_attempts, "{err}");
                    last_error = err.to_string();
                    if attempt < self.policy.max_attempts
                        && !self.cancel.sleep(self.policy.delay_for(attempt))
                    {
                        return Err(SyncError::Cancelled);
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(SyncError::RetriesExhausted {
            url: entry.url.clone(),
            attempts: self.policy.max_attempts,
            last_error,
        })
    }

    fn download_once<S: PortalSession + ?Sized>(
        &self,
        session: &S,
        entry: &ManifestEntry,
        target: &Utf8Path,
    ) -> Result<u64, SyncError> {
        let parent = target
            .parent()
            .ok_or_else(|| SyncError::Filesystem(format!("no parent directory for {target}")))?;
        let mut temp = tempfile::Builder::new()
            .prefix(".cds-sync-")
            .suffix(".part")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;

        let bytes = session.download(&entry.url, temp.as_file_mut(), &self.cancel)?;
        temp.as_file()
            .sync_all()
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;

        let actual = checksum::file_md5(temp.path())?;
        if actual != entry.checksum {
            return Err(SyncError::ChecksumMismatch {
                file: target.to_string(),
                expected: entry.checksum.to_string(),
                actual: actual.to_string(),
            });
        }

        temp.persist(target.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Ok(bytes)
    }
}
