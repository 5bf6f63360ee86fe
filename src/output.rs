use std::io::{self, Write};
use std::time::Duration;

use serde::Serialize;

use crate::sync::{EntryStatus, SyncReport};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

/// Receives progress from worker threads, hence `Sync`.
pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &SyncReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Human-readable progress on stderr and a summary on stdout.
pub struct TextOutput;

impl TextOutput {
    pub fn print_summary(report: &SyncReport) {
        let green = "\x1b[32m";
        let yellow = "\x1b[33m";
        let cyan = "\x1b[36m";
        let red = "\x1b[31m";
        let reset = "\x1b[0m";

        println!("{cyan}cds-sync summary ({}){reset}", report.mode);
        if report.mode.fetches() {
            println!(
                "{green}updated: {}{reset}  up to date: {}  {red}failed: {}{reset}",
                report.count(EntryStatus::Updated),
                report.count(EntryStatus::UpToDate),
                report.count(EntryStatus::Failed),
            );
            for entry in &report.entries {
                if entry.status == EntryStatus::Failed {
                    let reason = entry.error.as_deref().unwrap_or("unknown error");
                    println!("{red}  {} ({}): {reason}{reset}", entry.species, entry.url);
                }
            }
        }
        if report.mode.converts() {
            let failed = report.failed_conversions().count();
            println!(
                "{green}converted: {}{reset}  {red}conversion failures: {failed}{reset}",
                report.conversions.len() - failed,
            );
            for outcome in report.failed_conversions() {
                match outcome.exit_code {
                    Some(code) => println!("{red}  {} returned {code}{reset}", outcome.file),
                    None => println!(
                        "{red}  {}: {}{reset}",
                        outcome.file,
                        outcome.error.as_deref().unwrap_or("did not run")
                    ),
                }
            }
        }
        if report.cancelled {
            println!("{yellow}interrupted before completion{reset}");
        }
    }
}

impl ProgressSink for TextOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({} ms)", event.message, elapsed.as_millis()),
            None => eprintln!("{}", event.message),
        }
    }
}
