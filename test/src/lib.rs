//! In-process mock hub and peer connections for exercising `tigerhub-fsm`
//! and `tigerhub-client` without a real external hub.
//!
//! Everything here talks real TCP on loopback: a [`MockHub`] binds an
//! ephemeral port and hands out [`MockConn`]s as they're accepted, and
//! [`MockConn::recv`]/[`MockConn::send`] decode and encode with the same
//! `tigerhub_proto` codec the engine itself uses, so a scripted hub is
//! exercising the real wire format, not a shortcut around it.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};

use tigerhub_common::peer::Sid;
use tigerhub_proto::adc::{AdcInfoFields, AdcMessage};
use tigerhub_proto::message::{decode, encode, Dialect, Message};
use tigerhub_proto::nmdc::{NmdcMessage, NmdcUserInfo};

/// A listening mock hub (or peer listener). Bind once, `accept` as many
/// connections as the test needs.
pub struct MockHub {
    listener: TcpListener,
    dialect: Dialect,
}

impl MockHub {
    /// Bind an ephemeral loopback port speaking `dialect`.
    pub fn bind(dialect: Dialect) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock hub listener");
        Self { listener, dialect }
    }

    /// The address a client should dial to reach this hub.
    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("mock hub local address")
    }

    /// Block until a connection arrives, wrapping it as a [`MockConn`].
    pub fn accept(&self) -> MockConn {
        let (stream, _) = self.listener.accept().expect("accept mock connection");
        MockConn::new(stream, self.dialect)
    }
}

/// One accepted TCP connection, framed in `dialect`.
pub struct MockConn {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    dialect: Dialect,
}

impl MockConn {
    fn new(stream: TcpStream, dialect: Dialect) -> Self {
        let writer = stream.try_clone().expect("clone mock connection");
        Self { reader: BufReader::new(stream), writer, dialect }
    }

    /// Dial out to a listening peer, the mirror of [`MockHub::accept`] for
    /// scripts that play the connecting side of a peer connection (e.g. a
    /// mock peer answering a real client's `$ConnectToMe`/`DCTM`).
    pub fn dial(addr: SocketAddr, dialect: Dialect) -> Self {
        let stream = TcpStream::connect(addr).expect("dial mock peer connection");
        Self::new(stream, dialect)
    }

    /// Read and decode the next frame.
    ///
    /// Panics if the connection closes before a complete frame arrives or
    /// the frame fails to decode — a test driving a scripted conversation
    /// should never see either.
    pub fn recv(&mut self) -> Message {
        let terminator = self.dialect.terminator();
        let mut buf = Vec::new();
        let n = self.reader.read_until(terminator, &mut buf).expect("read mock frame");
        assert!(n > 0, "mock connection closed before a frame arrived");
        if buf.last() == Some(&terminator) {
            buf.pop();
        }
        decode(self.dialect, &buf).unwrap_or_else(|err| panic!("decode mock frame {buf:?}: {err}"))
    }

    /// Encode and write one frame.
    pub fn send(&mut self, msg: Message) {
        self.writer.write_all(&encode(&msg)).expect("write mock frame");
    }

    /// Write already-framed bytes verbatim, for injecting malformed frames
    /// or raw binary transfer payloads.
    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).expect("write mock raw bytes");
    }

    /// Read exactly `len` bytes with no framing, for consuming the raw
    /// payload a transfer sends after a `$ADCSND`/`CSND` announcement.
    pub fn recv_exact(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).expect("read mock binary payload");
        buf
    }
}

/// Drive the NMDC login handshake as the hub would: send the lock, accept
/// `$Key`/`$ValidateNick`/`$Version`, approve the nick, and log the client
/// in. Returns once `$MyINFO` for `nick` has been read off the wire.
pub fn nmdc_login(conn: &mut MockConn, nick: &str) {
    conn.send(Message::Nmdc(NmdcMessage::Lock { lock: "EXTENDEDPROTOCOL_mockhub".into(), pk: "mockhub".into() }));

    loop {
        match conn.recv() {
            Message::Nmdc(NmdcMessage::Key { .. }) => {}
            Message::Nmdc(NmdcMessage::Supports { .. }) => {}
            Message::Nmdc(NmdcMessage::ValidateNick { nick: got }) => {
                assert_eq!(got, nick, "client validated an unexpected nick");
            }
            Message::Nmdc(NmdcMessage::Version { .. }) => {
                conn.send(Message::Nmdc(NmdcMessage::Hello { nick: nick.to_string() }));
                break;
            }
            other => panic!("unexpected message during nmdc login: {other:?}"),
        }
    }

    // `Hello` above triggers a second `$Version`, `$GetNickList`, and `$MyINFO`.
    for _ in 0..3 {
        conn.recv();
    }
}

/// Drive the ADC login handshake: announce hub features, assign a session
/// id, and wait for the client's `BINF`. Returns the assigned [`Sid`].
pub fn adc_login(conn: &mut MockConn, sid: Sid) -> Sid {
    conn.send(Message::Adc(AdcMessage::InfoSupports(vec!["BASE".into(), "TIGR".into()])));
    match conn.recv() {
        Message::Adc(AdcMessage::HubSupports(_)) => {}
        other => panic!("expected HSUP, got {other:?}"),
    }
    conn.send(Message::Adc(AdcMessage::InfoSid(sid)));
    match conn.recv() {
        Message::Adc(AdcMessage::BroadcastInfo { author, .. }) => assert_eq!(author, sid),
        other => panic!("expected BINF, got {other:?}"),
    }
    sid
}

/// Announce a peer joining an NMDC hub (a `$MyINFO` line for `nick`).
pub fn nmdc_announce_peer(conn: &mut MockConn, nick: &str, share_size: u64, active: bool) {
    conn.send(Message::Nmdc(NmdcMessage::MyInfo(NmdcUserInfo {
        nick: nick.to_string(),
        description: String::new(),
        client_tag: "<mock V:1.0,M:A,H:1/0/0,S:1>".into(),
        connection: "LAN(T1)".into(),
        flag: if active { 0x01 } else { 0x00 },
        email: String::new(),
        share_size,
    })));
}

/// Announce a peer joining an ADC hub (a `BINF` for a freshly assigned sid).
pub fn adc_announce_peer(conn: &mut MockConn, sid: Sid, nick: &str, share_size: u64, active: bool) {
    conn.send(Message::Adc(AdcMessage::BroadcastInfo {
        author: sid,
        fields: AdcInfoFields {
            nick: Some(nick.to_string()),
            share_size: Some(share_size),
            supports: if active { vec!["TCP4".into()] } else { vec![] },
            ..Default::default()
        },
    }));
}
