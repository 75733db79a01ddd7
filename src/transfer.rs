//! Host boundary to the file-sharing transport
//!
//! The core never opens network connections itself: the hosting client
//! supplies a [`TransferClient`] and the core drives it. The transport only
//! knows full-file transfers, so byte ranges are emulated with a
//! [`BoundedWriter`] that cancels its producer once the requested span has
//! arrived.

use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Opaque network-unique peer identifier.
pub type PeerId = String;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer timed out")]
    Timeout,

    #[error("remote rejected the request: {0}")]
    RemoteRejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transfer cancelled")]
    Cancelled,
}

/// One file offered by a peer in a search response.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub path: String,
    pub size: u64,
    pub codec_hints: Option<String>,
}

/// A single peer's answer to a search.
#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub peer: PeerId,
    pub files: Vec<RemoteFile>,
    pub free_slot: bool,
    pub queue_length: u32,
    pub upload_speed_bps: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub timeout: Option<Duration>,
    pub max_responses: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// How long to sit in the remote queue before giving up.
    pub queue_timeout: Option<Duration>,
}

/// Basic attributes the transport knows about a peer.
#[derive(Debug, Clone, Default)]
pub struct PeerAttributes {
    pub free_slot: bool,
    pub queue_length: u32,
    pub upload_speed_bps: u64,
}

/// Receives transfer payload bytes. One sink per download attempt.
#[async_trait]
pub trait ChunkSink: Send {
    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The file-sharing transport, supplied by the host.
#[async_trait]
pub trait TransferClient: Send + Sync {
    /// Run a search and collect responses.
    async fn search(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<SearchResponse>, TransferError>;

    /// Download `remote_path` from `peer` into `sink`, starting at
    /// `start_offset`. Returns the number of bytes delivered to the sink.
    ///
    /// Implementations may reject `start_offset > 0` with
    /// [`TransferError::RemoteRejected`]. Cancelling `cancel` must tear the
    /// transfer down promptly; bytes already written stay written.
    async fn download(
        &self,
        peer: &str,
        remote_path: &str,
        sink: &mut dyn ChunkSink,
        size: u64,
        start_offset: u64,
        options: DownloadOptions,
        cancel: CancellationToken,
    ) -> Result<u64, TransferError>;

    async fn peer_attributes(&self, peer: &str) -> Result<PeerAttributes, TransferError>;
}

/// Sink collecting into memory; used for bounded-prefix probes.
#[derive(Default)]
pub struct VecSink {
    buf: Vec<u8>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

#[async_trait]
impl ChunkSink for VecSink {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }
}

/// Sink writing to an open file; used for chunk downloads.
pub struct FileSink {
    file: tokio::fs::File,
}

impl FileSink {
    pub fn new(file: tokio::fs::File) -> Self {
        Self { file }
    }
}

#[async_trait]
impl ChunkSink for FileSink {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.file.flush().await
    }
}

/// Write sink that accepts at most `limit` bytes and then cancels its
/// producing transfer.
///
/// This is how byte-range chunk fetches are emulated on a transport that
/// insists on sending whole files: the transfer starts at the chunk offset
/// and the bounded writer cuts it off after `limit` bytes. The final write
/// crossing the bound is truncated, never refused, so the last accepted
/// byte count is exact.
pub struct BoundedWriter<S> {
    inner: S,
    limit: u64,
    written: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl<S: ChunkSink> BoundedWriter<S> {
    pub fn new(inner: S, limit: u64, cancel: CancellationToken) -> Self {
        Self {
            inner,
            limit,
            written: Arc::new(AtomicU64::new(0)),
            cancel,
        }
    }

    /// Shared counter of accepted bytes; samplers use this for throughput
    /// measurement while the transfer runs.
    pub fn progress(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.written)
    }

    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// True once the full `limit` bytes have been accepted.
    pub fn bound_reached(&self) -> bool {
        self.bytes_written() >= self.limit
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: ChunkSink> ChunkSink for BoundedWriter<S> {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let written = self.written.load(Ordering::Relaxed);
        if written >= self.limit {
            // Bound already met; the transfer is being torn down.
            return Ok(());
        }
        let remaining = (self.limit - written) as usize;
        let take = remaining.min(data.len());
        self.inner.write(&data[..take]).await?;
        let now = written + take as u64;
        self.written.store(now, Ordering::Relaxed);
        if now >= self.limit {
            self.cancel.cancel();
        }
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }
}
