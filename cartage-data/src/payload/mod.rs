//! Binary payload resolution for texture images.
//!
//! A payload location is either a remote `http`/`https` URL or a local file.
//! Loading rejects empty payloads; stores write each payload as its own
//! unit so a failing item never leaves partial output behind.

use std::io::{Read, Write};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cartage_core::{InternalKey, PayloadError, PayloadFetcher, PayloadStore};
use log::debug;
use tempfile::NamedTempFile;
use url::Url;

/// Where a payload is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadLocation {
    /// `http` or `https` URL.
    Remote(Url),
    /// Local file.
    Local(Utf8PathBuf),
}

impl PayloadLocation {
    /// Classify `uri`.
    ///
    /// Backslashes are treated as path separators and relative paths are
    /// resolved against `base_path` when one is given. `file:` URLs are
    /// local.
    ///
    /// # Examples
    /// ```
    /// use camino::Utf8Path;
    /// use cartage_data::payload::PayloadLocation;
    ///
    /// let local = PayloadLocation::parse(r"tex\roof.png", Some(Utf8Path::new("/data"))).unwrap();
    /// assert_eq!(local, PayloadLocation::Local("/data/tex/roof.png".into()));
    /// let remote = PayloadLocation::parse("https://example.org/a.png", None).unwrap();
    /// assert!(matches!(remote, PayloadLocation::Remote(_)));
    /// ```
    ///
    /// # Errors
    /// Returns [`PayloadError::InvalidLocation`] for blank input, unsupported
    /// URL schemes and `file:` URLs without a UTF-8 path.
    pub fn parse(uri: &str, base_path: Option<&Utf8Path>) -> Result<Self, PayloadError> {
        let trimmed = uri.trim();
        let invalid = |message: &str| PayloadError::InvalidLocation {
            location: uri.to_owned(),
            message: message.to_owned(),
        };
        if trimmed.is_empty() {
            return Err(invalid("location is blank"));
        }
        // Single-letter schemes are Windows drive letters, not URLs.
        if let Some(url) = Url::parse(trimmed)
            .ok()
            .filter(|url| url.scheme().len() > 1)
        {
            return match url.scheme() {
                "http" | "https" => Ok(Self::Remote(url)),
                "file" => url
                    .to_file_path()
                    .ok()
                    .and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
                    .map(Self::Local)
                    .ok_or_else(|| invalid("file URL has no usable path")),
                other => Err(invalid(&format!("unsupported scheme {other}"))),
            };
        }
        let normalised = Utf8PathBuf::from(trimmed.replace('\\', "/"));
        let resolved = match base_path {
            Some(base) if normalised.is_relative() && !looks_like_drive(&normalised) => {
                base.join(normalised)
            }
            _ => normalised,
        };
        Ok(Self::Local(resolved))
    }

    /// File name of the payload, used as its stored name.
    #[must_use]
    pub fn file_name(&self) -> Option<String> {
        match self {
            Self::Remote(url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|name| !name.is_empty())
                .map(str::to_owned),
            Self::Local(path) => path.file_name().map(str::to_owned),
        }
    }
}

impl std::fmt::Display for PayloadLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(url) => write!(f, "{url}"),
            Self::Local(path) => write!(f, "{path}"),
        }
    }
}

fn looks_like_drive(path: &Utf8Path) -> bool {
    let mut chars = path.as_str().chars();
    matches!(
        (chars.next(), chars.next(), chars.next()),
        (Some(letter), Some(':'), Some('/')) if letter.is_ascii_alphabetic()
    )
}

/// Read the payload at `location`.
///
/// # Errors
/// Returns [`PayloadError::Read`] for unreadable files,
/// [`PayloadError::Remote`] for failed downloads and
/// [`PayloadError::Empty`] when the source has no content.
pub fn load_payload(
    location: &PayloadLocation,
    fetcher: &dyn PayloadFetcher,
) -> Result<Vec<u8>, PayloadError> {
    let bytes = match location {
        PayloadLocation::Remote(url) => fetcher.fetch_remote(url.as_str())?,
        PayloadLocation::Local(path) => {
            let read_error = |source| PayloadError::Read {
                location: path.to_string(),
                source,
            };
            let mut file = cartage_fs::open_utf8_file(path).map_err(read_error)?;
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes).map_err(read_error)?;
            bytes
        }
    };
    if bytes.is_empty() {
        return Err(PayloadError::Empty {
            location: location.to_string(),
        });
    }
    debug!("loaded {} bytes from {location}", bytes.len());
    Ok(bytes)
}

/// Downloads payloads with a blocking `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpPayloadFetcher {
    client: reqwest::blocking::Client,
}

impl HttpPayloadFetcher {
    /// Build a fetcher whose requests time out after `timeout`.
    ///
    /// # Errors
    /// Returns [`PayloadError::Remote`] when the client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, PayloadError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| PayloadError::Remote {
                url: String::new(),
                message: err.to_string(),
            })?;
        Ok(Self { client })
    }
}

impl PayloadFetcher for HttpPayloadFetcher {
    fn fetch_remote(&self, url: &str) -> Result<Vec<u8>, PayloadError> {
        let remote = |err: reqwest::Error| PayloadError::Remote {
            url: url.to_owned(),
            message: err.to_string(),
        };
        let response = self
            .client
            .get(url)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .map_err(remote)?;
        let bytes = response.bytes().map_err(remote)?;
        Ok(bytes.to_vec())
    }
}

/// Fetcher for sessions that must not touch the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineFetcher;

impl PayloadFetcher for OfflineFetcher {
    fn fetch_remote(&self, url: &str) -> Result<Vec<u8>, PayloadError> {
        Err(PayloadError::Remote {
            url: url.to_owned(),
            message: "remote payloads are disabled".to_owned(),
        })
    }
}

/// Stores payloads as files in one folder.
///
/// Each payload is written to a temporary file in the target folder and
/// renamed into place, so readers never see a partial file.
#[derive(Debug, Clone)]
pub struct DirectoryPayloadStore {
    folder: Utf8PathBuf,
}

impl DirectoryPayloadStore {
    /// Store payloads in `folder`, created on first use.
    #[must_use]
    pub fn new(folder: impl Into<Utf8PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }

    /// Target folder.
    #[must_use]
    pub fn folder(&self) -> &Utf8Path {
        &self.folder
    }

    fn write(&self, name: &str, bytes: &[u8]) -> std::io::Result<()> {
        cartage_fs::ensure_dir(&self.folder)?;
        let mut staged = NamedTempFile::new_in(&self.folder)?;
        staged.write_all(bytes)?;
        staged.flush()?;
        staged
            .persist(self.folder.join(name))
            .map_err(|err| err.error)?;
        Ok(())
    }
}

impl PayloadStore for DirectoryPayloadStore {
    fn store(&self, owner: InternalKey, name: &str, bytes: &[u8]) -> Result<(), PayloadError> {
        let file_name = Utf8Path::new(name)
            .file_name()
            .filter(|file_name| *file_name != "..")
            .ok_or_else(|| PayloadError::InvalidLocation {
                location: name.to_owned(),
                message: "payload name has no file name".to_owned(),
            })?;
        self.write(file_name, bytes)
            .map_err(|source| PayloadError::Store {
                name: name.to_owned(),
                source: Box::new(source),
            })?;
        debug!("stored payload {file_name} for feature {}", owner.get());
        Ok(())
    }
}
