//! Marker file recording the address of the live dev server
//!
//! The file holds a single line with the dev server URL. Writes go through a
//! temp file in the same directory followed by a rename, so concurrent readers
//! see either the old record or the new one and never a partial line.

use crate::error::HotFileError;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Durable store for the dev server URL
#[derive(Debug, Clone)]
pub struct HotFileStore {
    path: PathBuf,
    probe_timeout: Duration,
}

impl HotFileStore {
    pub fn new(path: impl Into<PathBuf>, probe_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            probe_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the record with `url`
    pub fn write(&self, url: &str) -> Result<(), HotFileError> {
        let io_err = |source| HotFileError::Io {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(io_err)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".hot")
            .tempfile_in(&dir)
            .map_err(io_err)?;
        writeln!(tmp, "{}", url).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;

        debug!(path = %self.path.display(), url, "Hotfile written");
        Ok(())
    }

    /// Read the recorded URL, if any
    pub fn read(&self) -> Result<Option<String>, HotFileError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let url = content.lines().next().unwrap_or("").trim();
                if url.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(url.to_string()))
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(HotFileError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Remove the record. Removing a missing file is not an error.
    pub fn clear(&self) -> Result<(), HotFileError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Hotfile cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(HotFileError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Check whether something accepts connections at `url`
    pub async fn probe(&self, url: &str) -> bool {
        probe_url(url, self.probe_timeout).await
    }

    /// Read the record and verify the server behind it is alive.
    ///
    /// A stale record is cleared and reported as absent.
    pub async fn read_live(&self) -> Result<Option<String>, HotFileError> {
        let Some(url) = self.read()? else {
            return Ok(None);
        };

        match self.check_record(url).await {
            Ok(url) => Ok(Some(url)),
            Err(HotFileError::Stale { url }) => {
                warn!(path = %self.path.display(), url, "Clearing stale hotfile");
                self.clear()?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn check_record(&self, url: String) -> Result<String, HotFileError> {
        if self.probe(&url).await {
            Ok(url)
        } else {
            Err(HotFileError::Stale { url })
        }
    }
}

/// Extract `host:port` from an http(s) URL, defaulting the port by scheme
pub fn socket_addr_of(url: &str) -> Option<String> {
    let (rest, default_port) = if let Some(rest) = url.strip_prefix("http://") {
        (rest, 80)
    } else if let Some(rest) = url.strip_prefix("https://") {
        (rest, 443)
    } else if let Some(rest) = url.strip_prefix("ws://") {
        (rest, 80)
    } else {
        return None;
    };

    let authority = rest.split(['/', '?', '#']).next()?;
    if authority.is_empty() {
        return None;
    }

    // Bracketed IPv6 literal
    if authority.starts_with('[') {
        let end = authority.find(']')?;
        let host = &authority[..=end];
        let port = match &authority[end + 1..] {
            "" => default_port,
            p => p.strip_prefix(':')?.parse().ok()?,
        };
        return Some(format!("{}:{}", host, port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().ok()?;
            Some(format!("{}:{}", host, port))
        }
        None => Some(format!("{}:{}", authority, default_port)),
    }
}

/// Short-timeout TCP connect used as a liveness check
pub async fn probe_url(url: &str, timeout: Duration) -> bool {
    let Some(addr) = socket_addr_of(url) else {
        return false;
    };
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}
