//! The six seed end-to-end scenarios, each driven against an in-process
//! mock hub (and, where a peer connection is needed, a mock peer script)
//! over real TCP loopback.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use bzip2::read::BzEncoder;
use bzip2::Compression;

use tigerhub_client::Client;
use tigerhub_common::config::ClientConfig;
use tigerhub_common::download::Destination;
use tigerhub_common::filelist::FileList;
use tigerhub_common::peer::Sid;
use tigerhub_common::search::{SearchConf, SearchKind};
use tigerhub_common::share::{InMemoryShareIndex, ShareEntry};
use tigerhub_common::tth::Tth;
use tigerhub_proto::adc::{AdcInfoFields, AdcMessage, AdcResultFields};
use tigerhub_proto::message::{decode, encode, Dialect, Message};
use tigerhub_proto::nmdc::{Direction, NmdcMessage, NmdcSearchResult};
use tigerhub_test::{adc_login, nmdc_login, MockConn, MockHub};

const TEST_FILE_BYTES: usize = 10_000;
const TEST_FILE_TTH: &str = "UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY";

/// Reserve an ephemeral loopback port for a listener `Client::run` will
/// bind, since the real bind address is never handed back to the caller.
fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").expect("reserve a free port").local_addr().unwrap().port()
}

// 1. Active file download: client2 (active) downloads a TTH-identified file
// from a mock peer "alice" who dials into client2's own listener, mirroring
// how an active downloader always offers its own port via DCTM.
#[test]
fn active_client_downloads_a_file_from_an_active_peer() {
    let hub = MockHub::bind(Dialect::Adc);
    let hub_addr = hub.addr();
    let peer_port = free_port();

    let hub_thread = std::thread::spawn(move || {
        let mut conn = hub.accept();
        let our_sid = adc_login(&mut conn, Sid(*b"CLI2"));
        conn.send(Message::Adc(AdcMessage::BroadcastInfo {
            author: Sid(*b"ALIC"),
            fields: AdcInfoFields {
                nick: Some("alice".into()),
                share_size: Some(TEST_FILE_BYTES as u64),
                supports: vec!["TCP4".into()],
                ..Default::default()
            },
        }));

        let token = match conn.recv() {
            Message::Adc(AdcMessage::DirectConnectToMe { author, target, port, token, .. }) => {
                assert_eq!(author, our_sid);
                assert_eq!(target, Sid(*b"ALIC"));
                assert_eq!(port, peer_port);
                token
            }
            other => panic!("expected DCTM, got {other:?}"),
        };

        let mut peer_conn = MockConn::dial(format!("127.0.0.1:{peer_port}").parse().unwrap(), Dialect::Adc);
        peer_conn.send(Message::Adc(AdcMessage::ClientSupports(vec!["BASE".into(), "TIGR".into()])));
        match peer_conn.recv() {
            Message::Adc(AdcMessage::ClientSupports(_)) => {}
            other => panic!("expected CSUP, got {other:?}"),
        }
        match peer_conn.recv() {
            Message::Adc(AdcMessage::ClientInfo { .. }) => {}
            other => panic!("expected CINF, got {other:?}"),
        }
        let mut fields = AdcInfoFields { nick: Some("alice".into()), ..Default::default() };
        fields.extra.insert("TO".into(), token);
        peer_conn.send(Message::Adc(AdcMessage::ClientInfo { fields }));

        match peer_conn.recv() {
            Message::Adc(AdcMessage::ClientGet { kind, path, .. }) => {
                assert_eq!(kind, "TTH");
                assert_eq!(path, format!("TTH/{TEST_FILE_TTH}"));
            }
            other => panic!("expected CGET, got {other:?}"),
        }
        peer_conn.send(Message::Adc(AdcMessage::ClientSend {
            kind: "file".into(),
            path: String::new(),
            start: 0,
            length: TEST_FILE_BYTES as i64,
        }));
        peer_conn.send_raw(&vec![b'A'; TEST_FILE_BYTES]);
    });

    let mut config = ClientConfig::new(&format!("adc://{hub_addr}"), "client2").unwrap();
    config.is_passive = false;
    config.tcp_port = peer_port;
    let mut client = Client::new(config).unwrap();

    let (peer_tx, peer_rx) = crossbeam_channel::unbounded();
    client.on_peer_connected(move |peer| {
        let _ = peer_tx.send(peer.nick);
    });
    let (done_tx, done_rx) = crossbeam_channel::unbounded();
    client.on_download_successful(move |_peer, path| {
        let _ = done_tx.send(path);
    });
    client.on_download_error(|peer, reason| panic!("download from {peer} failed: {reason}"));

    client.run().unwrap();
    let nick = peer_rx.recv_timeout(Duration::from_secs(5)).expect("peer_connected should fire");
    assert_eq!(nick, "alice");

    let dest_path = std::env::temp_dir().join("tigerhub-seed-scenario-1.bin");
    let tth = Tth::parse(TEST_FILE_TTH).expect("valid tth constant");
    client.download_file("alice", tth, Some(TEST_FILE_BYTES as u64), Destination::File(dest_path.clone())).unwrap();

    let result_path = done_rx.recv_timeout(Duration::from_secs(5)).expect("download_successful should fire");
    assert_eq!(result_path, Some(dest_path.clone()));
    let bytes = std::fs::read(&dest_path).unwrap();
    assert_eq!(bytes.len(), TEST_FILE_BYTES);
    assert!(bytes.iter().all(|&b| b == b'A'));
    assert_eq!(Tth::of(&bytes).to_base32(), TEST_FILE_TTH);
    let _ = std::fs::remove_file(&dest_path);

    client.terminate().unwrap();
    hub_thread.join().unwrap();
}

// 2. Passive search, ADC hub: three searches (directory, file, TTH) against
// an active responder, all routed back through the hub (DRES) since the
// searcher is passive.
#[test]
fn passive_adc_search_returns_directory_file_and_tth_results() {
    let hub = MockHub::bind(Dialect::Adc);
    let hub_addr = hub.addr();
    let alice_sid = Sid(*b"ALIC");

    let hub_thread = std::thread::spawn(move || {
        let mut conn = hub.accept();
        let our_sid = adc_login(&mut conn, Sid(*b"CLI2"));

        for (path, size, tth) in [
            ("/alias/inner folder", None, None),
            ("/alias/inner folder/test file.txt", Some(10_000u64), Some(TEST_FILE_TTH)),
            ("/alias/inner folder/test file.txt", Some(10_000u64), Some(TEST_FILE_TTH)),
        ] {
            let token = match conn.recv() {
                Message::Adc(AdcMessage::BroadcastSearch { author, fields }) => {
                    assert_eq!(author, our_sid);
                    fields.token
                }
                other => panic!("expected BSCH, got {other:?}"),
            };
            conn.send(Message::Adc(AdcMessage::DirectResult {
                author: alice_sid,
                target: our_sid,
                fields: AdcResultFields {
                    file_name: Some(path.to_string()),
                    size,
                    tth: tth.map(str::to_string),
                    slots: Some(3),
                    token,
                },
            }));
        }
    });

    let mut config = ClientConfig::new(&format!("adc://{hub_addr}"), "client2").unwrap();
    config.is_passive = true;
    let mut client = Client::new(config).unwrap();

    let (tx, rx) = crossbeam_channel::unbounded();
    client.on_search_result(move |search, result| {
        let _ = tx.send((search.token, result));
    });

    client.run().unwrap();

    let dir_token = client.search(SearchConf { kind: SearchKind::Directory, query: "ner fo".into(), ..Default::default() });
    let (token, dir_result) = rx.recv_timeout(Duration::from_secs(5)).expect("directory result should arrive");
    assert_eq!(token, dir_token);
    assert_eq!(dir_result.path, "/alias/inner folder");
    assert!(dir_result.is_dir);
    assert!(dir_result.tth.is_none());
    assert!(!dir_result.is_active);

    let file_token = client.search(SearchConf { kind: SearchKind::File, query: "test file.txt".into(), ..Default::default() });
    let (token, file_result) = rx.recv_timeout(Duration::from_secs(5)).expect("file result should arrive");
    assert_eq!(token, file_token);
    assert_eq!(file_result.path, "/alias/inner folder/test file.txt");
    assert_eq!(file_result.size, 10_000);
    assert_eq!(file_result.tth.map(|t| t.to_base32()), Some(TEST_FILE_TTH.to_string()));
    assert!(!file_result.is_active);

    let tth = Tth::parse(TEST_FILE_TTH).unwrap();
    let tth_token = client.search(SearchConf { kind: SearchKind::Tth, tth: Some(tth), ..Default::default() });
    let (token, tth_result) = rx.recv_timeout(Duration::from_secs(5)).expect("tth result should arrive");
    assert_eq!(token, tth_token);
    assert_eq!(tth_result.path, "/alias/inner folder/test file.txt");
    assert_eq!(tth_result.size, 10_000);
    assert!(!tth_result.is_active);

    client.terminate().unwrap();
    hub_thread.join().unwrap();
}

// 3. Passive search, NMDC hub: same shape as (2), but a directory result's
// `Size` is 0 since NMDC's `$SR` carries no directory size field. Each kind
// gets its own client since NMDC serializes outbound searches one at a time.
#[test]
fn passive_nmdc_search_reports_zero_size_for_directory_results() {
    for (pattern, data_type, sr_path, sr_size, sr_tth, expect_dir, expect_size) in [
        ("ner fo", 2u8, "/alias/inner folder", 0u64, None, true, 0u64),
        ("test file.txt", 1u8, "/alias/inner folder/test file.txt", 10_000u64, Some(TEST_FILE_TTH), false, 10_000u64),
    ] {
        let hub = MockHub::bind(Dialect::Nmdc);
        let hub_addr = hub.addr();

        let hub_thread = std::thread::spawn(move || {
            let mut conn = hub.accept();
            nmdc_login(&mut conn, "client2");

            match conn.recv() {
                Message::Nmdc(NmdcMessage::Search(search)) => {
                    assert_eq!(search.data_type, data_type);
                }
                other => panic!("expected $Search, got {other:?}"),
            }
            conn.send(Message::Nmdc(NmdcMessage::SearchResult(NmdcSearchResult {
                nick: "alice".into(),
                path: sr_path.to_string(),
                size: sr_size,
                free_slots: 3,
                total_slots: 5,
                hub_name: "MockHub".into(),
                hub_address: Some(hub_addr.to_string()),
                tth: sr_tth.map(str::to_string),
                target_nick: Some("client2".into()),
            })));
        });

        let mut config = ClientConfig::new(&format!("nmdc://{hub_addr}"), "client2").unwrap();
        config.is_passive = true;
        let mut client = Client::new(config).unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        client.on_search_result(move |_search, result| {
            let _ = tx.send(result);
        });

        client.run().unwrap();
        client.search(SearchConf { kind: SearchKind::Any, query: pattern.into(), ..Default::default() });

        let result = rx.recv_timeout(Duration::from_secs(5)).expect("search result should arrive");
        assert_eq!(result.path, sr_path);
        assert_eq!(result.is_dir, expect_dir);
        assert_eq!(result.size, expect_size);
        assert!(result.is_active);

        client.terminate().unwrap();
        hub_thread.join().unwrap();
    }
}

// 4. File-list download: client2 downloads and parses a peer's bz2-compressed
// file-list XML, built with the same production `FileList`/`bzip2` code the
// real uploader uses to serve one.
#[test]
fn client_downloads_and_parses_a_peers_file_list() {
    let hub = MockHub::bind(Dialect::Nmdc);
    let hub_addr = hub.addr();
    let peer_port = free_port();

    let file_data = vec![b'B'; TEST_FILE_BYTES];
    let file_tth = Tth::of(&file_data);
    let mut share = InMemoryShareIndex::new();
    share.insert("/share/file.txt", ShareEntry { size: file_data.len() as u64, tth: file_tth, local_path: "/dev/null".into() });
    let xml = FileList::from_share(&share, "/").to_xml().expect("file list serializes");
    let mut compressed = Vec::new();
    BzEncoder::new(xml.as_bytes(), Compression::best()).read_to_end(&mut compressed).unwrap();

    let hub_thread = std::thread::spawn(move || {
        let mut conn = hub.accept();
        nmdc_login(&mut conn, "client2");
        tigerhub_test::nmdc_announce_peer(&mut conn, "client1", file_data.len() as u64, true);

        match conn.recv() {
            Message::Nmdc(NmdcMessage::ConnectToMe { target_nick, port, .. }) => {
                assert_eq!(target_nick, "client1");
                assert_eq!(port, peer_port);
            }
            other => panic!("expected $ConnectToMe, got {other:?}"),
        }

        let mut peer_conn = MockConn::dial(format!("127.0.0.1:{peer_port}").parse().unwrap(), Dialect::Nmdc);
        peer_conn.send(Message::Nmdc(NmdcMessage::MyNick { nick: "client1".into() }));
        match peer_conn.recv() {
            Message::Nmdc(NmdcMessage::MyNick { nick }) => assert_eq!(nick, "client2"),
            other => panic!("expected $MyNick, got {other:?}"),
        }
        match peer_conn.recv() {
            Message::Nmdc(NmdcMessage::Lock { .. }) => {}
            other => panic!("expected $Lock, got {other:?}"),
        }
        match peer_conn.recv() {
            Message::Nmdc(NmdcMessage::Supports { .. }) => {}
            other => panic!("expected $Supports, got {other:?}"),
        }
        peer_conn.send(Message::Nmdc(NmdcMessage::Lock { lock: "EXTENDEDPROTOCOL_mockpeer".into(), pk: "mockpeer".into() }));
        match peer_conn.recv() {
            Message::Nmdc(NmdcMessage::Key { .. }) => {}
            other => panic!("expected $Key, got {other:?}"),
        }
        match peer_conn.recv() {
            Message::Nmdc(NmdcMessage::Direction { direction, .. }) => assert_eq!(direction, Direction::Download),
            other => panic!("expected $Direction, got {other:?}"),
        }
        // Maximum direction number: client2's own (randomly chosen) number
        // can never exceed it, so it never outranks ours and stays the
        // downloader regardless of the random draw.
        peer_conn.send(Message::Nmdc(NmdcMessage::Direction { direction: Direction::Upload, number: 0x7fff_ffff }));

        match peer_conn.recv() {
            Message::Nmdc(NmdcMessage::AdcGet { kind, path, .. }) => {
                assert_eq!(kind, "file");
                assert_eq!(path, "files.xml.bz2");
            }
            other => panic!("expected $ADCGET, got {other:?}"),
        }
        peer_conn.send(Message::Nmdc(NmdcMessage::AdcSnd { kind: "file".into(), path: String::new(), start: 0, length: compressed.len() as i64 }));
        peer_conn.send_raw(&compressed);
    });

    let mut config = ClientConfig::new(&format!("nmdc://{hub_addr}"), "client2").unwrap();
    config.is_passive = false;
    config.tcp_port = peer_port;
    let mut client = Client::new(config).unwrap();

    let (peer_tx, peer_rx) = crossbeam_channel::unbounded();
    client.on_peer_connected(move |peer| {
        let _ = peer_tx.send(peer.nick);
    });
    let (done_tx, done_rx) = crossbeam_channel::unbounded();
    client.on_download_successful(move |_peer, path| {
        let _ = done_tx.send(path);
    });
    client.on_download_error(|peer, reason| panic!("file list download from {peer} failed: {reason}"));

    client.run().unwrap();
    let nick = peer_rx.recv_timeout(Duration::from_secs(5)).expect("peer_connected should fire");
    assert_eq!(nick, "client1");

    let dest_path = std::env::temp_dir().join("tigerhub-seed-scenario-4.xml");
    client.download_file_list("client1", Destination::File(dest_path.clone())).unwrap();

    let result_path = done_rx.recv_timeout(Duration::from_secs(5)).expect("download_successful should fire");
    assert_eq!(result_path, Some(dest_path.clone()));
    let xml = std::fs::read_to_string(&dest_path).unwrap();
    let list = FileList::parse(&xml).expect("downloaded file list parses");
    let entry = list.get_file("/share/file.txt").expect("file.txt present in list");
    assert_eq!(entry.size, TEST_FILE_BYTES as u64);
    assert_eq!(entry.tth, Some(file_tth));
    let _ = std::fs::remove_file(&dest_path);

    client.terminate().unwrap();
    hub_thread.join().unwrap();
}

// 5. Encryption negotiation: both peers advertise ADCS support, so
// `PreferEncryption` picks the TLS port and the `ADCS/0.10` protocol
// string, completing a real TLS handshake with `tigerhub-net-threaded`'s
// own client TLS config.
#[test]
fn encryption_negotiation_completes_a_real_tls_peer_handshake() {
    let hub = MockHub::bind(Dialect::Adc);
    let hub_addr = hub.addr();
    let peer_tls_port = free_port();

    let hub_thread = std::thread::spawn(move || {
        let mut conn = hub.accept();
        let our_sid = adc_login(&mut conn, Sid(*b"CLI2"));
        conn.send(Message::Adc(AdcMessage::BroadcastInfo {
            author: Sid(*b"ALIC"),
            fields: AdcInfoFields {
                nick: Some("alice".into()),
                share_size: Some(TEST_FILE_BYTES as u64),
                supports: vec!["TCP4".into(), "ADCS".into()],
                ..Default::default()
            },
        }));

        let (token, port, protocol) = match conn.recv() {
            Message::Adc(AdcMessage::DirectConnectToMe { author, target, port, token, protocol }) => {
                assert_eq!(author, our_sid);
                assert_eq!(target, Sid(*b"ALIC"));
                (token, port, protocol)
            }
            other => panic!("expected DCTM, got {other:?}"),
        };
        assert_eq!(protocol, "ADCS/0.10");
        assert_eq!(port, peer_tls_port);

        let stream = TcpStream::connect(format!("127.0.0.1:{port}")).expect("dial client2's tls listener");
        let config = tigerhub_net_threaded::tls::client_config();
        let server_name = rustls::ServerName::try_from("tigerhub-peer").unwrap();
        let session = rustls::ClientConnection::new(config, server_name).unwrap();
        let mut tls = rustls::StreamOwned::new(session, stream);

        write_frame(&mut tls, Message::Adc(AdcMessage::ClientSupports(vec!["BASE".into(), "TIGR".into()])));
        match read_frame(&mut tls) {
            Message::Adc(AdcMessage::ClientSupports(_)) => {}
            other => panic!("expected CSUP, got {other:?}"),
        }
        match read_frame(&mut tls) {
            Message::Adc(AdcMessage::ClientInfo { .. }) => {}
            other => panic!("expected CINF, got {other:?}"),
        }
        let mut fields = AdcInfoFields { nick: Some("alice".into()), ..Default::default() };
        fields.extra.insert("TO".into(), token);
        write_frame(&mut tls, Message::Adc(AdcMessage::ClientInfo { fields }));

        match read_frame(&mut tls) {
            Message::Adc(AdcMessage::ClientGet { kind, path, .. }) => {
                assert_eq!(kind, "TTH");
                assert_eq!(path, format!("TTH/{TEST_FILE_TTH}"));
            }
            other => panic!("expected CGET, got {other:?}"),
        }
        write_frame(
            &mut tls,
            Message::Adc(AdcMessage::ClientSend { kind: "file".into(), path: String::new(), start: 0, length: TEST_FILE_BYTES as i64 }),
        );
        tls.write_all(&vec![b'A'; TEST_FILE_BYTES]).unwrap();
    });

    let mut config = ClientConfig::new(&format!("adc://{hub_addr}"), "client2").unwrap();
    config.is_passive = false;
    config.tcp_port = free_port();
    config.tcp_tls_port = peer_tls_port;
    let mut client = Client::new(config).unwrap();

    let (peer_tx, peer_rx) = crossbeam_channel::unbounded();
    client.on_peer_connected(move |peer| {
        let _ = peer_tx.send(peer.nick);
    });
    let (done_tx, done_rx) = crossbeam_channel::unbounded();
    client.on_download_successful(move |_peer, path| {
        let _ = done_tx.send(path);
    });
    client.on_download_error(|peer, reason| panic!("download from {peer} failed: {reason}"));

    client.run().unwrap();
    let nick = peer_rx.recv_timeout(Duration::from_secs(5)).expect("peer_connected should fire");
    assert_eq!(nick, "alice");

    let dest_path = std::env::temp_dir().join("tigerhub-seed-scenario-5.bin");
    let tth = Tth::parse(TEST_FILE_TTH).unwrap();
    client.download_file("alice", tth, Some(TEST_FILE_BYTES as u64), Destination::File(dest_path.clone())).unwrap();

    let result_path = done_rx.recv_timeout(Duration::from_secs(5)).expect("download_successful should fire");
    assert_eq!(result_path, Some(dest_path.clone()));
    let bytes = std::fs::read(&dest_path).unwrap();
    assert_eq!(bytes.len(), TEST_FILE_BYTES);
    let _ = std::fs::remove_file(&dest_path);

    client.terminate().unwrap();
    hub_thread.join().unwrap();
}

fn write_frame(stream: &mut rustls::StreamOwned<rustls::ClientConnection, TcpStream>, msg: Message) {
    stream.write_all(&encode(&msg)).expect("write tls frame");
}

fn read_frame(stream: &mut rustls::StreamOwned<rustls::ClientConnection, TcpStream>) -> Message {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).expect("read tls frame");
        if byte[0] == Dialect::Adc.terminator() {
            break;
        }
        buf.push(byte[0]);
    }
    decode(Dialect::Adc, &buf).unwrap_or_else(|err| panic!("decode tls frame {buf:?}: {err}"))
}

// 6. Rev-connect fallback, both directions:
// (a) our passive client receives a hub-forwarded `$ConnectToMe` and dials
//     out to the requesting peer's listener itself.
// (b) our active client receives `$RevConnectToMe` and answers with its own
//     `$ConnectToMe`, which the peer then dials.
// Both land our client in the `Serve` role, so both are driven to a real
// upload over a file shared via `Client::share_add`.
#[test]
fn passive_client_dials_out_after_a_hub_forwarded_connect_to_me() {
    let hub = MockHub::bind(Dialect::Nmdc);
    let hub_addr = hub.addr();

    let share_dir = std::env::temp_dir().join("tigerhub-seed-scenario-6a-share");
    std::fs::create_dir_all(&share_dir).unwrap();
    let file_data = vec![b'Z'; 500];
    std::fs::write(share_dir.join("upload.txt"), &file_data).unwrap();

    let peer_listener = MockHub::bind(Dialect::Nmdc);
    let peer_addr = peer_listener.addr();

    let hub_thread = std::thread::spawn(move || {
        let mut conn = hub.accept();
        nmdc_login(&mut conn, "client2");
        conn.send(Message::Nmdc(NmdcMessage::ConnectToMe {
            target_nick: "client2".into(),
            address: peer_addr.ip().to_string(),
            port: peer_addr.port(),
            secure: false,
        }));

        let mut peer_conn = peer_listener.accept();
        peer_conn.send(Message::Nmdc(NmdcMessage::Lock { lock: "EXTENDEDPROTOCOL_mockpeer".into(), pk: "mockpeer".into() }));
        match peer_conn.recv() {
            Message::Nmdc(NmdcMessage::Key { .. }) => {}
            other => panic!("expected $Key, got {other:?}"),
        }
        match peer_conn.recv() {
            Message::Nmdc(NmdcMessage::MyNick { nick }) => assert_eq!(nick, "client2"),
            other => panic!("expected $MyNick, got {other:?}"),
        }
        match peer_conn.recv() {
            Message::Nmdc(NmdcMessage::Supports { .. }) => {}
            other => panic!("expected $Supports, got {other:?}"),
        }
        match peer_conn.recv() {
            Message::Nmdc(NmdcMessage::Direction { direction, .. }) => assert_eq!(direction, Direction::Upload),
            other => panic!("expected $Direction, got {other:?}"),
        }
        peer_conn.send(Message::Nmdc(NmdcMessage::Direction { direction: Direction::Download, number: 1 }));

        peer_conn.send(Message::Nmdc(NmdcMessage::AdcGet { kind: "file".into(), path: "/share/upload.txt".into(), start: 0, length: -1 }));
        match peer_conn.recv() {
            Message::Nmdc(NmdcMessage::AdcSnd { length, .. }) => assert_eq!(length, file_data.len() as i64),
            other => panic!("expected $ADCSND, got {other:?}"),
        }
        let received = peer_conn.recv_exact(file_data.len());
        assert_eq!(received, file_data);
    });

    let mut config = ClientConfig::new(&format!("nmdc://{hub_addr}"), "client2").unwrap();
    config.is_passive = true;
    let client = Client::new(config).unwrap();
    client.share_add("share", &share_dir);

    client.run().unwrap();

    hub_thread.join().unwrap();
    client.terminate().unwrap();
    let _ = std::fs::remove_dir_all(&share_dir);
}

#[test]
fn active_client_answers_rev_connect_to_me_with_its_own_connect_to_me() {
    let hub = MockHub::bind(Dialect::Nmdc);
    let hub_addr = hub.addr();
    let peer_port = free_port();

    let share_dir = std::env::temp_dir().join("tigerhub-seed-scenario-6b-share");
    std::fs::create_dir_all(&share_dir).unwrap();
    let file_data = vec![b'Y'; 500];
    std::fs::write(share_dir.join("upload2.txt"), &file_data).unwrap();

    let hub_thread = std::thread::spawn(move || {
        let mut conn = hub.accept();
        nmdc_login(&mut conn, "client2");
        tigerhub_test::nmdc_announce_peer(&mut conn, "alice", 0, false);
        conn.send(Message::Nmdc(NmdcMessage::RevConnectToMe { from_nick: "alice".into(), to_nick: "client2".into() }));

        match conn.recv() {
            Message::Nmdc(NmdcMessage::ConnectToMe { target_nick, port, secure, .. }) => {
                assert_eq!(target_nick, "alice");
                assert_eq!(port, peer_port);
                assert!(!secure);
            }
            other => panic!("expected $ConnectToMe, got {other:?}"),
        }

        let mut peer_conn = MockConn::dial(format!("127.0.0.1:{peer_port}").parse().unwrap(), Dialect::Nmdc);
        peer_conn.send(Message::Nmdc(NmdcMessage::MyNick { nick: "alice".into() }));
        match peer_conn.recv() {
            Message::Nmdc(NmdcMessage::MyNick { nick }) => assert_eq!(nick, "client2"),
            other => panic!("expected $MyNick, got {other:?}"),
        }
        match peer_conn.recv() {
            Message::Nmdc(NmdcMessage::Lock { .. }) => {}
            other => panic!("expected $Lock, got {other:?}"),
        }
        match peer_conn.recv() {
            Message::Nmdc(NmdcMessage::Supports { .. }) => {}
            other => panic!("expected $Supports, got {other:?}"),
        }
        peer_conn.send(Message::Nmdc(NmdcMessage::Lock { lock: "EXTENDEDPROTOCOL_alice".into(), pk: "alice".into() }));
        match peer_conn.recv() {
            Message::Nmdc(NmdcMessage::Key { .. }) => {}
            other => panic!("expected $Key, got {other:?}"),
        }
        match peer_conn.recv() {
            Message::Nmdc(NmdcMessage::Direction { direction, .. }) => assert_eq!(direction, Direction::Upload),
            other => panic!("expected $Direction, got {other:?}"),
        }
        peer_conn.send(Message::Nmdc(NmdcMessage::Direction { direction: Direction::Download, number: 1 }));

        peer_conn.send(Message::Nmdc(NmdcMessage::AdcGet { kind: "file".into(), path: "/share/upload2.txt".into(), start: 0, length: -1 }));
        match peer_conn.recv() {
            Message::Nmdc(NmdcMessage::AdcSnd { length, .. }) => assert_eq!(length, file_data.len() as i64),
            other => panic!("expected $ADCSND, got {other:?}"),
        }
        let received = peer_conn.recv_exact(file_data.len());
        assert_eq!(received, file_data);
    });

    let mut config = ClientConfig::new(&format!("nmdc://{hub_addr}"), "client2").unwrap();
    config.is_passive = false;
    config.tcp_port = peer_port;
    let client = Client::new(config).unwrap();
    client.share_add("share", &share_dir);

    client.run().unwrap();

    hub_thread.join().unwrap();
    client.terminate().unwrap();
    let _ = std::fs::remove_dir_all(&share_dir);
}
