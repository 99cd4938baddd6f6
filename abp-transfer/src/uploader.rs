//! Stop-and-wait sender for the upload protocol.
//!
//! [`Uploader`] is the reference client: it opens a session with a Start
//! message, then sends the file one segment at a time, waiting for the
//! matching acknowledgment before moving on.
//!
//! # Stop-and-wait contract
//! - At most **one** message is in flight at any moment.
//! - A message carrying bit `b` is acknowledged by `a|b'` where `b' = b + 1 mod 2`.
//!   The acknowledged bit is also the bit of the next message.
//! - Replies whose bit is not `b'` are stale (answers to an earlier
//!   retransmission) and are ignored.
//! - On timeout the same message is resent unchanged; after
//!   [`TimerConfig::max_retries`] consecutive timeouts the upload fails.
//! - `n|b'` means the server refused the message; the upload fails.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Instant;

use thiserror::Error;
use tokio::time::timeout_at;

use crate::packet::{Bit, Message, MAX_SEGMENT_SIZE};
use crate::socket::{Socket, SocketError};
use crate::timer::{RetransmitTimer, TimerConfig};

/// Errors that end an upload.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no acknowledgment for {message} after {attempts} attempt(s)")]
    Timeout { message: String, attempts: u32 },
    #[error("server refused {0}")]
    Refused(String),
}

/// Sender-side parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadConfig {
    /// Payload bytes per Data message; must match the server.
    pub segment_size: usize,
    pub timer: TimerConfig,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            segment_size: MAX_SEGMENT_SIZE,
            timer: TimerConfig::default(),
        }
    }
}

/// What a finished upload cost.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Data messages acknowledged (the handshake is not counted).
    pub segments: u64,
    /// Payload bytes delivered.
    pub bytes: u64,
    /// Messages (handshake included) sent again after a timeout.
    pub retransmissions: u64,
}

/// One sender talking to one server.
pub struct Uploader {
    socket: Socket,
    server: SocketAddr,
    config: UploadConfig,
    timer: RetransmitTimer,
}

impl Uploader {
    pub fn new(socket: Socket, server: SocketAddr, config: UploadConfig) -> Self {
        Self {
            socket,
            server,
            timer: RetransmitTimer::new(config.timer),
            config,
        }
    }

    /// Read `path` and upload it.  The remote name defaults to the file name
    /// component of `path`.
    pub async fn upload_file(
        &mut self,
        path: &Path,
        remote_name: Option<&str>,
    ) -> Result<UploadReport, UploadError> {
        let contents = tokio::fs::read(path)
            .await
            .map_err(|source| UploadError::Read {
                path: path.display().to_string(),
                source,
            })?;
        let name = match remote_name {
            Some(name) => name.to_owned(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
        };
        self.upload(&name, &contents).await
    }

    /// Upload `contents` to be stored as `filename`, starting from a random bit.
    pub async fn upload(
        &mut self,
        filename: &str,
        contents: &[u8],
    ) -> Result<UploadReport, UploadError> {
        self.upload_from(Bit::from(rand::random::<bool>()), filename, contents)
            .await
    }

    /// Upload starting the handshake with `first_bit`.
    pub async fn upload_from(
        &mut self,
        first_bit: Bit,
        filename: &str,
        contents: &[u8],
    ) -> Result<UploadReport, UploadError> {
        let mut report = UploadReport::default();
        let start = Message::Start {
            bit: first_bit,
            filename: filename.to_owned(),
            file_size: contents.len() as u64,
        };
        log::info!(
            "[upload] {}: sending {filename} ({} bytes)",
            self.server,
            contents.len()
        );
        let mut bit = self.exchange(start, &mut report).await?;

        for chunk in contents.chunks(self.config.segment_size.max(1)) {
            let data = Message::Data {
                bit,
                payload: chunk.to_vec(),
            };
            bit = self.exchange(data, &mut report).await?;
            report.segments += 1;
            report.bytes += chunk.len() as u64;
        }

        log::info!(
            "[upload] {}: {filename} delivered in {} segment(s), {} retransmission(s)",
            self.server,
            report.segments,
            report.retransmissions
        );
        Ok(report)
    }

    /// Send `message` and wait for its acknowledgment, retransmitting on
    /// timeout.  Returns the bit to use for the next message.
    async fn exchange(
        &mut self,
        message: Message,
        report: &mut UploadReport,
    ) -> Result<Bit, UploadError> {
        let expected = message.bit().toggled();
        let mut attempts = 0u32;

        loop {
            self.socket.send_to(&message, self.server).await?;
            attempts += 1;
            let sent_at = Instant::now();
            let deadline = tokio::time::Instant::from_std(sent_at + self.timer.rto());
            log::debug!("[upload] -> {message} (attempt {attempts})");

            // Keep reading until the matching reply or the deadline.
            loop {
                let (reply, from) = match timeout_at(deadline, self.socket.recv_from()).await {
                    Err(_elapsed) => break,
                    Ok(Ok(pair)) => pair,
                    Ok(Err(SocketError::Malformed { from, source })) => {
                        log::debug!("[upload] {from}: ignoring malformed reply: {source}");
                        continue;
                    }
                    Ok(Err(e)) => return Err(e.into()),
                };
                if from != self.server {
                    continue;
                }
                match reply {
                    Message::Ack { bit } if bit == expected => {
                        let sample = (attempts == 1).then(|| sent_at.elapsed());
                        self.timer.on_ack(sample);
                        return Ok(expected);
                    }
                    Message::Nack { bit } if bit == expected => {
                        return Err(UploadError::Refused(message.to_string()));
                    }
                    stale => log::debug!("[upload] <- {stale} (stale, waiting for bit {expected})"),
                }
            }

            if !self.timer.on_timeout() {
                return Err(UploadError::Timeout {
                    message: message.to_string(),
                    attempts,
                });
            }
            report.retransmissions += 1;
            log::debug!(
                "[upload] timeout; retransmitting with rto={:?}",
                self.timer.rto()
            );
        }
    }
}
