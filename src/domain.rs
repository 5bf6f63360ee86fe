use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::checksum::Md5Digest;
use crate::error::SyncError;

/// A remote CDS resource paired with the checksum the portal declares for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub url: String,
    pub checksum: Md5Digest,
}

/// Where a manifest entry lives in the local mirror.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ResolvedTarget {
    pub local_filename: String,
    pub species_name: String,
}

impl ResolvedTarget {
    /// Path of the target relative to the mirror base: `<species>/<filename>`.
    pub fn relative_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.species_name).join(&self.local_filename)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    FetchOnly,
    #[default]
    FetchAndConvert,
    ConvertOnly,
}

impl SyncMode {
    pub fn fetches(self) -> bool {
        !matches!(self, SyncMode::ConvertOnly)
    }

    pub fn converts(self) -> bool {
        !matches!(self, SyncMode::FetchOnly)
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::FetchOnly => write!(f, "fetch-only"),
            SyncMode::FetchAndConvert => write!(f, "fetch-and-convert"),
            SyncMode::ConvertOnly => write!(f, "convert-only"),
        }
    }
}

/// Portal account name. The portal signs users on by e-mail address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Username(String);

impl Username {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Username {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let is_valid = match normalized.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && !domain.contains('@')
                    && domain.contains('.')
                    && !domain.starts_with('.')
                    && !domain.ends_with('.')
                    && !normalized.chars().any(char::is_whitespace)
            }
            None => false,
        };
        if !is_valid {
            return Err(SyncError::InvalidUsername(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub user: Username,
    pub password: String,
}

impl Credentials {
    pub fn new(user: Username, password: impl Into<String>) -> Self {
        Self {
            user,
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_username_valid() {
        let user: Username = " someone@example.org ".parse().unwrap();
        assert_eq!(user.as_str(), "someone@example.org");
    }

    #[test]
    fn parse_username_invalid() {
        for value in ["someone", "@example.org", "a@b", "a@@b.org", "a b@c.org", "a@.org"] {
            let err = value.parse::<Username>().unwrap_err();
            assert_matches!(err, SyncError::InvalidUsername(_));
        }
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials::new("someone@example.org".parse().unwrap(), "hunter2");
        let printed = format!("{creds:?}");
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn sync_mode_flags() {
        assert!(SyncMode::FetchOnly.fetches());
        assert!(!SyncMode::FetchOnly.converts());
        assert!(!SyncMode::ConvertOnly.fetches());
        assert!(SyncMode::FetchAndConvert.fetches() && SyncMode::FetchAndConvert.converts());
    }
}
