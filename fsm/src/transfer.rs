//! Transfer engine (component E): file-list fetch, TTH-verified downloads,
//! and upload serving against a [`ShareIndex`].

use std::collections::HashMap;

use bzip2::read::{BzDecoder, BzEncoder};
use bzip2::Compression;
use log::warn;

use tigerhub_common::download::{Destination, Download, DownloadState, Resource};
use tigerhub_common::filelist::FileList;
use tigerhub_common::peer::PeerId;
use tigerhub_common::share::ShareIndex;
use tigerhub_common::tth::{TigerTreeHasher, Tth};
use tigerhub_net::ConnId;
use tigerhub_proto::adc::AdcMessage;
use tigerhub_proto::message::Dialect;
use tigerhub_proto::nmdc::NmdcMessage;
use tigerhub_proto::Message;

use crate::error::DisconnectReason;
use crate::event::Event;
use crate::outbox::Outbox;
use crate::peerconn::Purpose;

type EngineOutbox = Outbox<Message, Event, DisconnectReason>;

/// Virtual path NMDC/ADC both use to request the compressed file list.
const FILE_LIST_PATH: &str = "files.xml.bz2";

/// The file-list virtual-path alias ADC uses for `CGET`/`CSND`.
const ADC_FILE_KIND: &str = "file";
const ADC_TTH_KIND: &str = "TTH";

/// One transfer in progress on a connection.
enum TransferKind {
    FileListDownload { hasher: Vec<u8> },
    FileDownload { expected_tth: Option<Tth>, hasher: TigerTreeHasher, bytes: Vec<u8>, destination: Destination, expected_len: Option<u64> },
    Upload { remaining: u64 },
}

struct ActiveTransfer {
    peer: PeerId,
    kind: TransferKind,
}

/// Tracks every in-flight transfer by connection id, plus the caller's
/// outstanding [`Download`] records by peer.
#[derive(Default)]
pub struct TransferManager {
    active: HashMap<ConnId, ActiveTransfer>,
    downloads: HashMap<PeerId, Download>,
}

impl TransferManager {
    /// An empty transfer manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a caller-initiated download, to be started once the peer
    /// connection identified by `purpose` completes its handshake.
    pub fn queue_download(&mut self, peer: PeerId, download: Download) {
        self.downloads.insert(peer, download);
    }

    /// A peer connection finished its handshake; start the transfer its
    /// `purpose` describes.
    pub fn on_peer_ready(&mut self, conn: ConnId, peer: PeerId, dialect: Dialect, purpose: Purpose, outbox: &mut EngineOutbox) {
        match purpose {
            Purpose::FileList => self.start_file_list_download(conn, peer, dialect, outbox),
            Purpose::Download(path) => self.start_file_download(conn, peer, dialect, path, outbox),
            Purpose::Serve => {
                // Wait for the remote side's own `$ADCGET`/`CGET` request.
            }
        }
    }

    fn start_file_list_download(&mut self, conn: ConnId, peer: PeerId, dialect: Dialect, outbox: &mut EngineOutbox) {
        if let Some(d) = self.downloads.get_mut(&peer) {
            d.state = DownloadState::Transferring;
        }
        let msg = match dialect {
            Dialect::Nmdc => Message::Nmdc(NmdcMessage::AdcGet {
                kind: "file".into(),
                path: FILE_LIST_PATH.into(),
                start: 0,
                length: -1,
            }),
            Dialect::Adc => Message::Adc(AdcMessage::ClientGet {
                kind: ADC_FILE_KIND.into(),
                path: FILE_LIST_PATH.into(),
                start: 0,
                length: -1,
            }),
        };
        outbox.write(conn, msg);
        self.active.insert(conn, ActiveTransfer { peer, kind: TransferKind::FileListDownload { hasher: Vec::new() } });
    }

    fn start_file_download(&mut self, conn: ConnId, peer: PeerId, dialect: Dialect, path: String, outbox: &mut EngineOutbox) {
        let (expected_tth, destination) = self
            .downloads
            .get(&peer)
            .map(|d| {
                let tth = match &d.resource {
                    Resource::Tth { tth, .. } => Some(*tth),
                    _ => None,
                };
                (tth, d.destination.clone())
            })
            .unwrap_or((None, Destination::Memory));
        if let Some(d) = self.downloads.get_mut(&peer) {
            d.state = DownloadState::Transferring;
        }
        let (kind, wire_path) = match expected_tth {
            Some(tth) => (ADC_TTH_KIND, format!("TTH/{}", tth.to_base32())),
            None => (ADC_FILE_KIND, path),
        };
        let msg = match dialect {
            Dialect::Nmdc => Message::Nmdc(NmdcMessage::AdcGet { kind: kind.into(), path: wire_path, start: 0, length: -1 }),
            Dialect::Adc => Message::Adc(AdcMessage::ClientGet { kind: kind.into(), path: wire_path, start: 0, length: -1 }),
        };
        outbox.write(conn, msg);
        self.active.insert(
            conn,
            ActiveTransfer {
                peer,
                kind: TransferKind::FileDownload {
                    expected_tth,
                    hasher: TigerTreeHasher::new(),
                    bytes: Vec::new(),
                    destination,
                    expected_len: None,
                },
            },
        );
    }

    /// An `$ADCSND`/`CSND` announced the byte range about to follow.
    pub fn on_send_announced(&mut self, conn: ConnId, length: i64) {
        if let Some(ActiveTransfer { kind: TransferKind::FileDownload { expected_len, .. }, .. }) = self.active.get_mut(&conn) {
            if length >= 0 {
                *expected_len = Some(length as u64);
            }
        }
    }

    /// A chunk of binary payload arrived on a connection with an active
    /// transfer. Returns `true` once the transfer reached its announced
    /// length and `on_transfer_complete` should be called; for a file list
    /// (whose compressed length isn't announced up front) the reactor's
    /// `Disconnected`/next-frame signal is still what ends it.
    pub fn on_binary_chunk(&mut self, conn: ConnId, chunk: &[u8], outbox: &mut EngineOutbox) -> bool {
        let Some(active) = self.active.get_mut(&conn) else {
            warn!("binary chunk on connection {conn} with no active transfer");
            return false;
        };
        let peer = active.peer.clone();
        let reached_end = match &mut active.kind {
            TransferKind::FileListDownload { hasher } => {
                hasher.extend_from_slice(chunk);
                false
            }
            TransferKind::FileDownload { hasher, bytes, expected_len, .. } => {
                hasher.update(chunk);
                bytes.extend_from_slice(chunk);
                matches!(expected_len, Some(len) if bytes.len() as u64 >= *len)
            }
            TransferKind::Upload { .. } => {
                warn!("unexpected binary chunk while uploading to {peer}");
                false
            }
        };
        if let Some(d) = self.downloads.get_mut(&peer) {
            d.transferred += chunk.len() as u64;
            outbox.event(Event::DownloadProgress { peer: peer.clone(), state: d.state, transferred: d.transferred });
        }
        reached_end
    }

    /// The connection's reactor reported the remote side is done sending
    /// (or we reached the expected length ourselves); finish the transfer.
    pub fn on_transfer_complete(&mut self, conn: ConnId, outbox: &mut EngineOutbox) {
        let Some(active) = self.active.remove(&conn) else { return };
        let peer = active.peer;
        match active.kind {
            TransferKind::FileListDownload { hasher } => {
                self.finish_file_list(peer, hasher, outbox);
            }
            TransferKind::FileDownload { expected_tth, hasher, bytes, destination, .. } => {
                self.finish_file_download(peer, expected_tth, hasher, bytes, destination, outbox);
            }
            TransferKind::Upload { .. } => {}
        }
    }

    fn finish_file_list(&mut self, peer: PeerId, compressed: Vec<u8>, outbox: &mut EngineOutbox) {
        let mut xml_bytes = Vec::new();
        let mut decoder = BzDecoder::new(compressed.as_slice());
        let decompress_result = std::io::copy(&mut decoder, &mut xml_bytes);
        let Some(download) = self.downloads.get_mut(&peer) else { return };
        if let Err(err) = decompress_result {
            download.state = DownloadState::Failed;
            outbox.event(Event::DownloadError { peer, reason: format!("bzip2 decompression failed: {err}") });
            return;
        }
        let xml = match String::from_utf8(xml_bytes.clone()) {
            Ok(xml) => xml,
            Err(err) => {
                download.state = DownloadState::Failed;
                outbox.event(Event::DownloadError { peer, reason: format!("file list is not utf-8: {err}") });
                return;
            }
        };
        match FileList::parse(&xml) {
            Ok(_list) => {
                download.state = DownloadState::Succeeded;
                match &download.destination {
                    Destination::Memory => download.content = Some(xml_bytes),
                    Destination::File(path) => {
                        if let Err(err) = std::fs::write(path, &xml_bytes) {
                            download.state = DownloadState::Failed;
                            outbox.event(Event::DownloadError { peer, reason: format!("writing file list: {err}") });
                            return;
                        }
                    }
                }
                outbox.event(Event::DownloadSucceeded {
                    peer,
                    path: match &download.destination {
                        Destination::File(path) => Some(path.clone()),
                        Destination::Memory => None,
                    },
                });
            }
            Err(err) => {
                download.state = DownloadState::Failed;
                outbox.event(Event::DownloadError { peer, reason: format!("parsing file list: {err}") });
            }
        }
    }

    fn finish_file_download(
        &mut self,
        peer: PeerId,
        expected_tth: Option<Tth>,
        hasher: TigerTreeHasher,
        bytes: Vec<u8>,
        destination: Destination,
        outbox: &mut EngineOutbox,
    ) {
        let computed = hasher.finalize();
        let Some(download) = self.downloads.get_mut(&peer) else { return };
        if let Some(expected) = expected_tth {
            if expected != computed {
                download.state = DownloadState::Failed;
                if let Destination::File(path) = &destination {
                    let _ = std::fs::remove_file(path);
                }
                outbox.event(Event::DownloadError {
                    peer,
                    reason: format!("TTH mismatch: expected {expected}, computed {computed}"),
                });
                return;
            }
        }
        match &destination {
            Destination::Memory => download.content = Some(bytes),
            Destination::File(path) => {
                if let Err(err) = std::fs::write(path, &bytes) {
                    download.state = DownloadState::Failed;
                    outbox.event(Event::DownloadError { peer, reason: format!("writing download: {err}") });
                    return;
                }
            }
        }
        download.state = DownloadState::Succeeded;
        outbox.event(Event::DownloadSucceeded {
            peer,
            path: match &destination {
                Destination::File(path) => Some(path.clone()),
                Destination::Memory => None,
            },
        });
    }

    /// The remote side requested a file (`$ADCGET`/`CGET`); serve it from
    /// `share`, or report it missing/maxed-out.
    pub fn serve_get(
        &mut self,
        conn: ConnId,
        peer: PeerId,
        dialect: Dialect,
        kind: &str,
        path: &str,
        start: i64,
        length: i64,
        share: &dyn ShareIndex,
        free_slots: usize,
        outbox: &mut EngineOutbox,
    ) {
        if free_slots == 0 {
            let msg = match dialect {
                Dialect::Nmdc => Message::Nmdc(NmdcMessage::MaxedOut),
                Dialect::Adc => Message::Adc(AdcMessage::ClientStatus { severity: 1, code: 53, message: "no free slots".into() }),
            };
            outbox.write(conn, msg);
            return;
        }

        if kind == ADC_FILE_KIND && path == FILE_LIST_PATH {
            let Ok(xml) = FileList::from_share(share, "/").to_xml() else {
                self.send_file_not_available(conn, dialect, outbox);
                return;
            };
            let mut compressed = Vec::new();
            let ok = std::io::copy(&mut BzEncoder::new(xml.as_bytes(), Compression::best()), &mut compressed).is_ok();
            if !ok {
                self.send_file_not_available(conn, dialect, outbox);
                return;
            }
            self.send_and_stream(conn, peer, dialect, compressed, outbox);
            return;
        }

        let entry = if kind == ADC_TTH_KIND {
            path.strip_prefix("TTH/").and_then(Tth::parse).and_then(|tth| share.by_tth(&tth))
        } else {
            share.by_path(path)
        };
        let Some(entry) = entry else {
            self.send_file_not_available(conn, dialect, outbox);
            return;
        };
        let data = match std::fs::read(&entry.local_path) {
            Ok(data) => data,
            Err(err) => {
                warn!("failed to read shared file {:?}: {err}", entry.local_path);
                self.send_file_not_available(conn, dialect, outbox);
                return;
            }
        };
        let start = start.max(0) as usize;
        let end = if length < 0 { data.len() } else { (start + length as usize).min(data.len()) };
        let slice = data.get(start..end).unwrap_or(&[]).to_vec();
        self.send_and_stream(conn, peer, dialect, slice, outbox);
    }

    fn send_file_not_available(&self, conn: ConnId, dialect: Dialect, outbox: &mut EngineOutbox) {
        let msg = match dialect {
            Dialect::Nmdc => Message::Nmdc(NmdcMessage::Error { message: "File Not Available".into() }),
            Dialect::Adc => Message::Adc(AdcMessage::ClientStatus { severity: 1, code: 40, message: "file not available".into() }),
        };
        outbox.write(conn, msg);
    }

    fn send_and_stream(&mut self, conn: ConnId, peer: PeerId, dialect: Dialect, data: Vec<u8>, outbox: &mut EngineOutbox) {
        let len = data.len() as i64;
        let announce = match dialect {
            Dialect::Nmdc => Message::Nmdc(NmdcMessage::AdcSnd { kind: "file".into(), path: String::new(), start: 0, length: len }),
            Dialect::Adc => Message::Adc(AdcMessage::ClientSend { kind: "file".into(), path: String::new(), start: 0, length: len }),
        };
        outbox.write(conn, announce);
        self.active.insert(conn, ActiveTransfer { peer, kind: TransferKind::Upload { remaining: len as u64 } });
        outbox.write_bytes(conn, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tigerhub_common::share::{InMemoryShareIndex, ShareEntry};
    use tigerhub_net::Io;

    fn tmp_file(name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("tigerhub-transfer-test-{}-{name}", std::process::id()));
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn serve_get_with_no_free_slots_sends_maxed_out() {
        let mut mgr = TransferManager::new();
        let mut outbox: EngineOutbox = Outbox::new();
        let share = InMemoryShareIndex::new();
        mgr.serve_get(2, "bob".into(), Dialect::Nmdc, "file", "whatever", 0, -1, &share, 0, &mut outbox);
        let ios: Vec<_> = outbox.drain().collect();
        assert!(matches!(&ios[..], [Io::Write(2, Message::Nmdc(NmdcMessage::MaxedOut))]));
    }

    #[test]
    fn serve_get_announces_and_streams_a_shared_file() {
        let mut mgr = TransferManager::new();
        let mut outbox: EngineOutbox = Outbox::new();
        let data = b"hello tigerhub".to_vec();
        let path = tmp_file("serve", &data);
        let mut share = InMemoryShareIndex::new();
        share.insert("/hello.txt", ShareEntry { size: data.len() as u64, tth: Tth::of(&data), local_path: path.clone() });

        mgr.serve_get(2, "bob".into(), Dialect::Nmdc, "file", "/hello.txt", 0, -1, &share, 3, &mut outbox);
        let ios: Vec<_> = outbox.drain().collect();
        assert!(matches!(&ios[0], Io::Write(2, Message::Nmdc(NmdcMessage::AdcSnd { length, .. })) if *length == data.len() as i64));
        assert!(matches!(&ios[1], Io::WriteBytes(2, bytes) if *bytes == data));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn serve_get_reports_missing_file() {
        let mut mgr = TransferManager::new();
        let mut outbox: EngineOutbox = Outbox::new();
        let share = InMemoryShareIndex::new();
        mgr.serve_get(2, "bob".into(), Dialect::Adc, "file", "/nope.txt", 0, -1, &share, 3, &mut outbox);
        let ios: Vec<_> = outbox.drain().collect();
        assert!(matches!(&ios[..], [Io::Write(2, Message::Adc(AdcMessage::ClientStatus { code: 40, .. }))]));
    }

    #[test]
    fn file_download_succeeds_when_tth_matches() {
        let mut mgr = TransferManager::new();
        let mut outbox: EngineOutbox = Outbox::new();
        let data = b"the quick brown fox".to_vec();
        let tth = Tth::of(&data);

        let conf = DownloadConf { peer: "bob".into(), resource: Resource::Tth { tth, size: Some(data.len() as u64) }, destination: Destination::Memory };
        mgr.queue_download("bob".into(), Download::new(&conf));
        mgr.on_peer_ready(2, "bob".into(), Dialect::Nmdc, Purpose::Download(String::new()), &mut outbox);
        outbox.drain().for_each(drop);

        mgr.on_send_announced(2, data.len() as i64);
        let done = mgr.on_binary_chunk(2, &data, &mut outbox);
        assert!(done, "chunk reaching the announced length should signal completion");
        outbox.drain().for_each(drop);

        mgr.on_transfer_complete(2, &mut outbox);
        let events: Vec<_> = outbox.drain().collect();
        assert!(events.iter().any(|io| matches!(io, Io::Event(Event::DownloadSucceeded { .. }))));
    }

    #[test]
    fn file_download_fails_on_tth_mismatch() {
        let mut mgr = TransferManager::new();
        let mut outbox: EngineOutbox = Outbox::new();
        let data = b"actual bytes".to_vec();
        let wrong_tth = Tth::of(b"different bytes");

        let conf = DownloadConf { peer: "bob".into(), resource: Resource::Tth { tth: wrong_tth, size: None }, destination: Destination::Memory };
        mgr.queue_download("bob".into(), Download::new(&conf));
        mgr.on_peer_ready(2, "bob".into(), Dialect::Adc, Purpose::Download(String::new()), &mut outbox);
        outbox.drain().for_each(drop);

        mgr.on_send_announced(2, data.len() as i64);
        mgr.on_binary_chunk(2, &data, &mut outbox);
        outbox.drain().for_each(drop);

        mgr.on_transfer_complete(2, &mut outbox);
        let events: Vec<_> = outbox.drain().collect();
        assert!(events.iter().any(|io| matches!(io, Io::Event(Event::DownloadError { .. }))));
    }
}
