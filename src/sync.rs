use std::collections::HashSet;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::convert::{ConversionDispatcher, ConversionOutcome, Converter};
use crate::domain::{Credentials, ManifestEntry, ResolvedTarget, SyncMode};
use crate::error::SyncError;
use crate::layout::MirrorLayout;
use crate::manifest;
use crate::naming;
use crate::output::{ProgressEvent, ProgressSink};
use crate::portal::PortalClient;
use crate::verify::{DownloadVerifier, EntryState, RetryPolicy};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub mode: SyncMode,
    pub threads: usize,
    pub retry: RetryPolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            mode: SyncMode::FetchAndConvert,
            threads: 4,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    UpToDate,
    Updated,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryReport {
    pub url: String,
    pub species: String,
    pub path: Utf8PathBuf,
    pub status: EntryStatus,
    pub attempts: u32,
    pub bytes: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub mode: SyncMode,
    pub base: Utf8PathBuf,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub entries: Vec<EntryReport>,
    pub conversions: Vec<ConversionOutcome>,
    pub cancelled: bool,
}

impl SyncReport {
    fn new(mode: SyncMode, base: Utf8PathBuf) -> Self {
        Self {
            mode,
            base,
            started_at: iso_timestamp(),
            finished_at: None,
            entries: Vec::new(),
            conversions: Vec::new(),
            cancelled: false,
        }
    }

    /// Files this run downloaded and verified, ready for conversion.
    pub fn updated_paths(&self) -> Vec<Utf8PathBuf> {
        self.entries
            .iter()
            .filter(|entry| entry.status == EntryStatus::Updated)
            .map(|entry| entry.path.clone())
            .collect()
    }

    pub fn count(&self, status: EntryStatus) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.status == status)
            .count()
    }

    pub fn failed_conversions(&self) -> impl Iterator<Item = &ConversionOutcome> {
        self.conversions.iter().filter(|outcome| !outcome.succeeded())
    }

    pub fn has_failures(&self) -> bool {
        self.count(EntryStatus::Failed) > 0 || self.failed_conversions().next().is_some()
    }
}

struct PlannedEntry {
    entry: ManifestEntry,
    target: ResolvedTarget,
    path: Utf8PathBuf,
}

/// Fetch-verify-convert over one mirror, with explicit collaborators.
pub struct Syncer<P: PortalClient, C: Converter> {
    layout: MirrorLayout,
    portal: P,
    dispatcher: ConversionDispatcher<C>,
    verifier: DownloadVerifier,
    options: SyncOptions,
    cancel: CancelToken,
}

impl<P: PortalClient, C: Converter> Syncer<P, C> {
    pub fn new(
        layout: MirrorLayout,
        portal: P,
        converter: C,
        options: SyncOptions,
        cancel: CancelToken,
    ) -> Self {
        let options = SyncOptions {
            threads: options.threads.max(1),
            ..options
        };
        Self {
            dispatcher: ConversionDispatcher::new(converter, options.threads, cancel.clone()),
            verifier: DownloadVerifier::new(options.retry, cancel.clone()),
            layout,
            portal,
            options,
            cancel,
        }
    }

    pub fn layout(&self) -> &MirrorLayout {
        &self.layout
    }

    /// Run whatever `options.mode` asks for. Credentials are only needed to fetch.
    pub fn run(
        &self,
        credentials: Option<&Credentials>,
        sink: &dyn ProgressSink,
    ) -> Result<SyncReport, SyncError> {
        let mode = self.options.mode;
        let mut report = SyncReport::new(mode, self.layout.base().to_path_buf());

        if mode.fetches() {
            let credentials = credentials.ok_or(SyncError::MissingCredentials)?;
            report.entries = self.fetch(credentials, sink)?;
        }

        if mode.converts() && !self.cancel.is_cancelled() {
            match self.conversion_batch(&report)? {
                Some(batch) => report.conversions = self.convert(batch, sink)?,
                None => info!("no verified files to convert"),
            }
        }

        report.cancelled = self.cancel.is_cancelled();
        report.finished_at = Some(iso_timestamp());
        Ok(report)
    }

    /// Authenticate, list, and reconcile every CDS entry in the manifest.
    pub fn fetch(
        &self,
        credentials: &Credentials,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<EntryReport>, SyncError> {
        self.layout.ensure_base_dir()?;

        emit(sink, "phase=Auth; signing on to portal", None);
        let session = self.portal.authenticate(credentials)?;
        info!(user = %credentials.user, "signed on");

        emit(sink, "phase=Resolve; fetching portal listing", None);
        let start = Instant::now();
        let entries = manifest::filter_cds(manifest::list_entries(&session)?);
        info!(count = entries.len(), "CDS entries in manifest");
        emit(
            sink,
            &format!("phase=Resolve; {} CDS files listed", entries.len()),
            Some(start.elapsed()),
        );

        let plan = self.plan(entries)?;
        let pool = worker_pool(self.options.threads)?;
        let reports = pool.install(|| {
            plan.par_iter()
                .map(|planned| self.reconcile(&session, planned, sink))
                .collect::<Vec<_>>()
        });
        Ok(reports)
    }

    /// Convert `paths`, or everything already in the mirror when empty.
    pub fn convert(
        &self,
        paths: Vec<Utf8PathBuf>,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<ConversionOutcome>, SyncError> {
        emit(
            sink,
            &format!("phase=Convert; {} files queued", paths.len()),
            None,
        );
        let outcomes = self.dispatcher.convert(&self.layout, paths)?;
        for outcome in &outcomes {
            let message = match (outcome.succeeded(), &outcome.error) {
                (true, _) => format!("converted {}", outcome.file),
                (false, Some(error)) => format!("conversion failed: {error}"),
                (false, None) => format!("conversion failed: {}", outcome.file),
            };
            emit(sink, &message, None);
        }
        Ok(outcomes)
    }

    /// Files fetched this run, or the whole mirror when nothing changed.
    /// A file whose checksum failed to match during this run is never
    /// included; `None` means no file qualifies.
    fn conversion_batch(
        &self,
        report: &SyncReport,
    ) -> Result<Option<Vec<Utf8PathBuf>>, SyncError> {
        let updated = report.updated_paths();
        if !updated.is_empty() {
            return Ok(Some(updated));
        }
        let unverified: HashSet<&Utf8PathBuf> = report
            .entries
            .iter()
            .filter(|entry| entry.status != EntryStatus::UpToDate)
            .map(|entry| &entry.path)
            .collect();
        if unverified.is_empty() {
            return Ok(Some(Vec::new()));
        }
        let batch: Vec<Utf8PathBuf> = self
            .layout
            .discover_cds_files()?
            .into_iter()
            .filter(|path| !unverified.contains(path))
            .collect();
        for path in &unverified {
            warn!(file = %path, "not converting unverified file");
        }
        Ok((!batch.is_empty()).then_some(batch))
    }

    /// Resolve targets and create species directories before any download
    /// starts, so a permission problem aborts the run with nothing half-done.
    fn plan(&self, entries: Vec<ManifestEntry>) -> Result<Vec<PlannedEntry>, SyncError> {
        let mut seen = HashSet::new();
        let mut plan = Vec::with_capacity(entries.len());
        for entry in entries {
            let target = match naming::resolve(&entry.url) {
                Ok(target) => target,
                Err(err) => {
                    warn!("{err}");
                    continue;
                }
            };
            let path = self.layout.target_path(&target);
            if !seen.insert(path.clone()) {
                warn!(url = %entry.url, %path, "another manifest entry already maps to this file, skipping");
                continue;
            }
            self.layout.ensure_species_dir(&target.species_name)?;
            plan.push(PlannedEntry {
                entry,
                target,
                path,
            });
        }
        Ok(plan)
    }

    fn reconcile(
        &self,
        session: &P::Session,
        planned: &PlannedEntry,
        sink: &dyn ProgressSink,
    ) -> EntryReport {
        let species = &planned.target.species_name;
        let mut report = EntryReport {
            url: planned.entry.url.clone(),
            species: species.clone(),
            path: planned.path.clone(),
            status: EntryStatus::Cancelled,
            attempts: 0,
            bytes: 0,
            error: None,
        };
        if self.cancel.is_cancelled() {
            report.error = Some(SyncError::Cancelled.to_string());
            return report;
        }

        emit(sink, &format!("Fetching {species} ..."), None);
        let start = Instant::now();
        match self.verifier.reconcile(session, &planned.entry, &planned.path) {
            Ok(done) => {
                report.attempts = done.attempts;
                report.bytes = done.bytes;
                report.status = match done.state {
                    EntryState::ChecksumMatch => {
                        emit(
                            sink,
                            &format!(
                                "{} already exists and MD5s are identical, skipping",
                                planned.target.local_filename
                            ),
                            None,
                        );
                        EntryStatus::UpToDate
                    }
                    _ => {
                        info!(file = %planned.path, attempts = done.attempts, bytes = done.bytes, "updated");
                        emit(
                            sink,
                            &format!("{} updated", planned.target.local_filename),
                            Some(start.elapsed()),
                        );
                        EntryStatus::Updated
                    }
                };
            }
            Err(SyncError::Cancelled) => {
                report.error = Some(SyncError::Cancelled.to_string());
            }
            Err(err) => {
                warn!(url = %planned.entry.url, "{err}");
                emit(sink, &format!("{species} failed: {err}"), None);
                if let SyncError::RetriesExhausted { attempts, .. } = &err {
                    report.attempts = *attempts;
                }
                report.status = EntryStatus::Failed;
                report.error = Some(err.to_string());
            }
        }
        report
    }
}

fn emit(sink: &dyn ProgressSink, message: &str, elapsed: Option<Duration>) {
    sink.event(ProgressEvent {
        message: message.to_string(),
        elapsed,
    });
}

pub(crate) fn worker_pool(threads: usize) -> Result<ThreadPool, SyncError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(|index| format!("cds-sync-{index}"))
        .build()
        .map_err(|err| SyncError::WorkerPool(err.to_string()))
}

fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
