//! User-visible events, fired synchronously on the event loop thread. The
//! `client` crate turns each of these into a callback invocation.

use std::path::PathBuf;

use tigerhub_common::download::DownloadState;
use tigerhub_common::peer::{Peer, PeerId};
use tigerhub_common::search::{Search, SearchResult};

use crate::error::Error;

/// One user-visible occurrence.
#[derive(Debug, Clone)]
pub enum Event {
    /// The hub login handshake completed; the client is now `LoggedIn`.
    HubConnected,
    /// The hub session ended, for any reason.
    HubDisconnected(String),
    /// A peer joined the roster, or an existing peer connection finished
    /// its handshake.
    PeerConnected(Peer),
    /// An existing peer's `$MyINFO`/`BINF` changed.
    PeerUpdated(Peer),
    /// A peer left the roster (`$Quit`/`IQUI`) or its connection dropped.
    PeerDisconnected(PeerId),
    /// A download finished successfully.
    DownloadSucceeded {
        /// Peer the download was served by.
        peer: PeerId,
        /// Where the result was written, if to a file.
        path: Option<PathBuf>,
    },
    /// A download failed; the partial output, if any, was removed.
    DownloadError {
        /// Peer the download was attempted against.
        peer: PeerId,
        /// Why it failed.
        reason: String,
    },
    /// A download's state changed without completing (queued → connecting →
    /// transferring), for progress reporting.
    DownloadProgress {
        /// Peer the download is in progress against.
        peer: PeerId,
        /// Current lifecycle state.
        state: DownloadState,
        /// Bytes transferred so far.
        transferred: u64,
    },
    /// A search result was received and matched to an outstanding [`Search`].
    SearchResult {
        /// The search this result answers.
        search: Search,
        /// The result itself.
        result: SearchResult,
    },
    /// The external share indexer finished indexing an alias.
    ShareIndexed {
        /// The alias that was (re)indexed.
        alias: String,
        /// Total bytes now shared under that alias.
        total_size: u64,
    },
    /// The client finished constructing and validating its configuration.
    Initialized,
    /// A recoverable error occurred; nothing else is implied about the
    /// state of the client.
    Error(Error),
}
