//! Typed callback slots, one per [`tigerhub_fsm::Event`] variant.
//!
//! Each slot is optional; an event fired with no registered callback is
//! simply dropped (after being logged at debug level).

use tigerhub_common::download::DownloadState;
use tigerhub_common::peer::{Peer, PeerId};
use tigerhub_common::search::{Search, SearchResult};
use tigerhub_fsm::{Error, Event};

type Callback<A> = Box<dyn Fn(A) + Send + Sync>;

/// Registered callbacks for a [`crate::Client`]. Built up via the `Client::on_*`
/// setters before [`crate::Client::run`] is called.
#[derive(Default)]
pub struct Callbacks {
    hub_connected: Option<Callback<()>>,
    hub_disconnected: Option<Callback<String>>,
    peer_connected: Option<Callback<Peer>>,
    peer_updated: Option<Callback<Peer>>,
    peer_disconnected: Option<Callback<PeerId>>,
    download_succeeded: Option<Callback<(PeerId, Option<std::path::PathBuf>)>>,
    download_error: Option<Callback<(PeerId, String)>>,
    download_progress: Option<Callback<(PeerId, DownloadState, u64)>>,
    search_result: Option<Callback<(Search, SearchResult)>>,
    share_indexed: Option<Callback<(String, u64)>>,
    initialized: Option<Callback<()>>,
    error: Option<Callback<Error>>,
}

macro_rules! setter {
    ($name:ident, $field:ident, $arg:ty) => {
        /// Register a callback, replacing any previously registered one.
        pub fn $name(&mut self, f: impl Fn($arg) + Send + Sync + 'static) {
            self.$field = Some(Box::new(f));
        }
    };
}

impl Callbacks {
    setter!(on_hub_connected, hub_connected, ());
    setter!(on_hub_disconnected, hub_disconnected, String);
    setter!(on_peer_connected, peer_connected, Peer);
    setter!(on_peer_updated, peer_updated, Peer);
    setter!(on_peer_disconnected, peer_disconnected, PeerId);
    setter!(on_download_succeeded, download_succeeded, (PeerId, Option<std::path::PathBuf>));
    setter!(on_download_error, download_error, (PeerId, String));
    setter!(on_download_progress, download_progress, (PeerId, DownloadState, u64));
    setter!(on_search_result, search_result, (Search, SearchResult));
    setter!(on_share_indexed, share_indexed, (String, u64));
    setter!(on_initialized, initialized, ());
    setter!(on_error, error, Error);

    /// Dispatch one engine event to its registered callback, if any.
    pub fn dispatch(&self, event: Event) {
        match event {
            Event::HubConnected => call(&self.hub_connected, ()),
            Event::HubDisconnected(reason) => call(&self.hub_disconnected, reason),
            Event::PeerConnected(peer) => call(&self.peer_connected, peer),
            Event::PeerUpdated(peer) => call(&self.peer_updated, peer),
            Event::PeerDisconnected(peer) => call(&self.peer_disconnected, peer),
            Event::DownloadSucceeded { peer, path } => call(&self.download_succeeded, (peer, path)),
            Event::DownloadError { peer, reason } => call(&self.download_error, (peer, reason)),
            Event::DownloadProgress { peer, state, transferred } => {
                call(&self.download_progress, (peer, state, transferred))
            }
            Event::SearchResult { search, result } => call(&self.search_result, (search, result)),
            Event::ShareIndexed { alias, total_size } => call(&self.share_indexed, (alias, total_size)),
            Event::Initialized => call(&self.initialized, ()),
            Event::Error(err) => call(&self.error, err),
        }
    }
}

fn call<A>(slot: &Option<Callback<A>>, arg: A) {
    if let Some(f) = slot {
        f(arg);
    }
}
