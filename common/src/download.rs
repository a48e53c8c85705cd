//! An intent to fetch a resource from a specific peer.

use std::path::PathBuf;

use crate::peer::PeerId;
use crate::tth::Tth;

/// What to fetch from the peer.
#[derive(Debug, Clone)]
pub enum Resource {
    /// The peer's compressed file-list XML (`files.xml.bz2`).
    FileList,
    /// A specific file, addressed by its Tiger-Tree-Hash.
    Tth {
        /// Expected hash; the transfer fails if the downloaded bytes don't match.
        tth: Tth,
        /// Expected size in bytes, if known ahead of time (e.g. from a search result).
        size: Option<u64>,
    },
    /// A file addressed by its path inside the peer's share, relative to the
    /// file list (used once a `FileList` has already been parsed).
    Path(String),
}

/// Where a download's bytes are written.
#[derive(Debug, Clone)]
pub enum Destination {
    /// Buffered in memory and handed back via `Download::content`.
    Memory,
    /// Streamed to a file on disk.
    File(PathBuf),
}

/// Caller-specified parameters for an outbound download.
#[derive(Debug, Clone)]
pub struct DownloadConf {
    /// The peer to download from.
    pub peer: PeerId,
    /// What to fetch.
    pub resource: Resource,
    /// Where to write it.
    pub destination: Destination,
}

/// Lifecycle state of a [`Download`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    /// Waiting for a peer connection slot.
    Queued,
    /// A peer connection is being established.
    Connecting,
    /// Bytes are being transferred.
    Transferring,
    /// Completed and verified.
    Succeeded,
    /// Failed; see the error delivered via `OnDownloadError`.
    Failed,
}

/// An intent to fetch a resource from a specific peer, and its progress.
#[derive(Debug, Clone)]
pub struct Download {
    /// The parameters this download was created with.
    pub conf_peer: PeerId,
    /// What is being fetched.
    pub resource: Resource,
    /// Where the bytes end up.
    pub destination: Destination,
    /// Current lifecycle state.
    pub state: DownloadState,
    /// Bytes transferred so far.
    pub transferred: u64,
    /// Total expected bytes, once known (after the peer's `ADCSND`/`$ADCSND`).
    pub total: Option<u64>,
    /// In-memory content, once `Succeeded` and `Destination::Memory` was requested.
    pub content: Option<Vec<u8>>,
}

impl Download {
    /// Create a freshly queued download from its configuration.
    pub fn new(conf: &DownloadConf) -> Self {
        Self {
            conf_peer: conf.peer.clone(),
            resource: conf.resource.clone(),
            destination: conf.destination.clone(),
            state: DownloadState::Queued,
            transferred: 0,
            total: None,
            content: None,
        }
    }
}
