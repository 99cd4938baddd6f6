//! Persistence of completed uploads.
//!
//! The engine hands the reassembled bytes of a finished session to a
//! [`FileStore`].  [`DiskStore`] is the production implementation; tests
//! substitute their own store to observe writes or inject failures.
//!
//! # Where files land
//!
//! | Policy                      | Target path                                  |
//! |-----------------------------|----------------------------------------------|
//! | [`OutputPolicy::Verbatim`]  | the sender's filename exactly as received    |
//! | [`OutputPolicy::Confined`]  | `<dir>/<last path component of filename>`    |
//!
//! `Verbatim` lets a sender write anywhere the server process can (for
//! example `../../etc/passwd`).  It stays the default so existing senders keep
//! working; pass an output directory to switch to `Confined`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors raised while writing a completed file.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("filename {0:?} does not name a file inside the output directory")]
    RejectedName(String),
    #[error("cannot write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Destination for reassembled files.
pub trait FileStore: Send {
    /// Write `contents` under `filename`, replacing any existing file.
    /// Returns the path actually written.
    fn persist(&mut self, filename: &str, contents: &[u8]) -> Result<PathBuf, StoreError>;
}

/// How sender-supplied filenames map onto the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputPolicy {
    /// Use the filename as a path, unmodified.
    #[default]
    Verbatim,
    /// Keep only the final component and place it under this directory.
    Confined(PathBuf),
}

impl OutputPolicy {
    /// Resolve the on-disk path for `filename`.
    pub fn resolve(&self, filename: &str) -> Result<PathBuf, StoreError> {
        match self {
            OutputPolicy::Verbatim => {
                if filename.is_empty() {
                    return Err(StoreError::RejectedName(filename.to_owned()));
                }
                Ok(PathBuf::from(filename))
            }
            OutputPolicy::Confined(dir) => {
                // Senders may use either separator regardless of the host OS.
                let last = filename.rsplit(['/', '\\']).next().unwrap_or_default();
                match Path::new(last).file_name() {
                    Some(name) if name == last => Ok(dir.join(name)),
                    _ => Err(StoreError::RejectedName(filename.to_owned())),
                }
            }
        }
    }
}

/// Writes completed files to the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct DiskStore {
    policy: OutputPolicy,
}

impl DiskStore {
    pub fn new(policy: OutputPolicy) -> Self {
        Self { policy }
    }
}

impl FileStore for DiskStore {
    fn persist(&mut self, filename: &str, contents: &[u8]) -> Result<PathBuf, StoreError> {
        let path = self.policy.resolve(filename)?;
        if let OutputPolicy::Confined(dir) = &self.policy {
            fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        fs::write(&path, contents).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}
