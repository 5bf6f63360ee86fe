#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};

use cds_sync::cancel::CancelToken;
use cds_sync::checksum::Md5Digest;
use cds_sync::convert::Converter;
use cds_sync::domain::{Credentials, ManifestEntry};
use cds_sync::error::SyncError;
use cds_sync::portal::{PortalClient, PortalSession, copy_cancellable};

pub const BASE_URL: &str = "https://portal.example.org";
pub const PASSWORD: &str = "correct horse";

#[derive(Debug, Clone)]
pub enum Reply {
    Body(Vec<u8>),
    Drop,
    Status(u16),
    /// Streams the first half, then trips the cancel token.
    CancelMidway(Vec<u8>),
}

#[derive(Default)]
pub struct PortalState {
    pub listing: String,
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub scripted: Mutex<HashMap<String, VecDeque<Reply>>>,
    pub auth_calls: AtomicUsize,
    pub listing_calls: AtomicUsize,
    pub downloads: AtomicUsize,
}

impl PortalState {
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn auth_calls(&self) -> usize {
        self.auth_calls.load(Ordering::SeqCst)
    }

    pub fn listing_calls(&self) -> usize {
        self.listing_calls.load(Ordering::SeqCst)
    }

    /// Replies served for `url` before falling back to its regular content.
    pub fn script(&self, url: &str, replies: Vec<Reply>) {
        self.scripted
            .lock()
            .unwrap()
            .insert(url.to_string(), replies.into());
    }
}

#[derive(Clone)]
pub struct MockSession {
    pub state: Arc<PortalState>,
}

impl MockSession {
    pub fn new() -> Self {
        Self {
            state: Arc::new(PortalState::default()),
        }
    }

    pub fn with_files(files: &[(&str, &[u8])]) -> Self {
        let session = Self::new();
        let mut map = session.state.files.lock().unwrap();
        for (url, content) in files {
            map.insert(url.to_string(), content.to_vec());
        }
        drop(map);
        session
    }
}

impl PortalSession for MockSession {
    fn base_url(&self) -> &str {
        BASE_URL
    }

    fn fetch_listing(&self) -> Result<String, SyncError> {
        self.state.listing_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.listing.clone())
    }

    fn download(
        &self,
        url: &str,
        destination: &mut dyn Write,
        cancel: &CancelToken,
    ) -> Result<u64, SyncError> {
        self.state.downloads.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .state
            .scripted
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|queue| queue.pop_front());
        let reply = match scripted {
            Some(reply) => reply,
            None => match self.state.files.lock().unwrap().get(url) {
                Some(content) => Reply::Body(content.clone()),
                None => Reply::Status(404),
            },
        };
        match reply {
            Reply::Body(content) => copy_cancellable(&mut content.as_slice(), destination, cancel),
            Reply::Drop => Err(SyncError::Network("connection reset by peer".to_string())),
            Reply::Status(status) => Err(SyncError::PortalStatus {
                status,
                message: "mock".to_string(),
            }),
            Reply::CancelMidway(content) => {
                let (head, tail) = content.split_at(content.len() / 2);
                destination.write_all(head).unwrap();
                cancel.cancel();
                copy_cancellable(&mut &tail[..], destination, cancel)
            }
        }
    }
}

#[derive(Clone)]
pub struct MockPortal {
    pub session: MockSession,
}

impl MockPortal {
    /// A portal listing `files` as `<file url md5/>` elements plus one non-CDS file.
    pub fn serving(files: &[(&str, &[u8])]) -> Self {
        let declared: Vec<_> = files
            .iter()
            .map(|(url, content)| (*url, Md5Digest::of_bytes(content).to_string(), *content))
            .collect();
        Self::declaring(
            &declared
                .iter()
                .map(|(url, md5, content)| (*url, md5.as_str(), *content))
                .collect::<Vec<_>>(),
        )
    }

    /// Like [`MockPortal::serving`], but each listing row carries the given md5 text.
    pub fn declaring(files: &[(&str, &str, &[u8])]) -> Self {
        let mut listing = String::from("<organismDownloads name=\"Mock\">\n");
        for (url, md5, _) in files {
            listing.push_str(&format!("  <file url=\"{url}\" md5=\"{md5}\"/>\n"));
        }
        listing.push_str(
            "  <file url=\"/dl/Athaliana.gene.gff3.gz\" md5=\"e4d909c290d0fb1ca068ffaddf22cbd0\"/>\n",
        );
        listing.push_str("</organismDownloads>\n");

        let state = PortalState {
            listing,
            files: Mutex::new(
                files
                    .iter()
                    .map(|(url, _, content)| (url.to_string(), content.to_vec()))
                    .collect(),
            ),
            ..PortalState::default()
        };
        Self {
            session: MockSession {
                state: Arc::new(state),
            },
        }
    }

    pub fn state(&self) -> &PortalState {
        &self.session.state
    }
}

impl PortalClient for MockPortal {
    type Session = MockSession;

    fn authenticate(&self, credentials: &Credentials) -> Result<MockSession, SyncError> {
        self.session.state.auth_calls.fetch_add(1, Ordering::SeqCst);
        if credentials.password != PASSWORD {
            return Err(SyncError::Auth("credentials rejected".to_string()));
        }
        Ok(self.session.clone())
    }
}

/// Exit codes by file name; anything unlisted exits 0.
#[derive(Default)]
pub struct MockConverter {
    pub codes: HashMap<String, Result<Option<i32>, String>>,
    pub calls: Mutex<Vec<Utf8PathBuf>>,
}

impl MockConverter {
    pub fn with_code(mut self, file_name: &str, code: i32) -> Self {
        self.codes.insert(file_name.to_string(), Ok(Some(code)));
        self
    }

    pub fn with_error(mut self, file_name: &str, message: &str) -> Self {
        self.codes
            .insert(file_name.to_string(), Err(message.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<Utf8PathBuf> {
        let mut calls = self.calls.lock().unwrap().clone();
        calls.sort();
        calls
    }
}

impl Converter for MockConverter {
    fn convert(&self, file: &Utf8Path) -> Result<Option<i32>, SyncError> {
        self.calls.lock().unwrap().push(file.to_path_buf());
        match self.codes.get(file.file_name().unwrap_or_default()) {
            Some(Ok(code)) => Ok(*code),
            Some(Err(message)) => Err(SyncError::MissingTool(message.clone())),
            None => Ok(Some(0)),
        }
    }
}

pub fn credentials(password: &str) -> Credentials {
    Credentials::new("someone@example.org".parse().unwrap(), password)
}

pub fn entry(url: &str, content: &[u8]) -> ManifestEntry {
    ManifestEntry {
        url: url.to_string(),
        checksum: Md5Digest::of_bytes(content),
    }
}

pub fn utf8_temp(temp: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap()
}
