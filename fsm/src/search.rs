//! Search engine (component F): outbound query construction, inbound result
//! correlation, and the serialized NMDC search queue.
//!
//! NMDC has no correlation token, so at most one NMDC search may be
//! outstanding at a time; a second `Client::search` call while one is
//! in flight is queued and issued once the first one's lifetime window
//! expires (see the resolved open question in the design notes).

use std::collections::{HashMap, VecDeque};

use tigerhub_common::peer::Sid;
use tigerhub_common::search::{Search, SearchConf, SearchKind, SearchResult, SearchToken};
use tigerhub_common::time::{LocalDuration, LocalTime};
use tigerhub_common::tth::Tth;
use tigerhub_proto::adc::{AdcMessage, AdcSearchFields};
use tigerhub_proto::message::Dialect;
use tigerhub_proto::nmdc::{NmdcMessage, NmdcSearch, NmdcSearchResult, SizeRestrict};
use tigerhub_proto::Message;

use crate::error::DisconnectReason;
use crate::event::Event;
use crate::hub::HUB_CONN;
use crate::outbox::Outbox;

type EngineOutbox = Outbox<Message, Event, DisconnectReason>;

/// How long an outstanding search stays eligible for result correlation.
pub const SEARCH_LIFETIME: LocalDuration = LocalDuration::from_secs(60);

/// Tracks outstanding searches and, for NMDC, the one-at-a-time queue.
#[derive(Default)]
pub struct SearchEngine {
    outstanding: HashMap<SearchToken, Search>,
    nmdc_active: Option<SearchToken>,
    nmdc_queue: VecDeque<(SearchToken, SearchConf)>,
    next_token: u32,
}

impl SearchEngine {
    /// An empty search engine.
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_token(&mut self) -> SearchToken {
        self.next_token = self.next_token.wrapping_add(1);
        SearchToken(self.next_token)
    }

    /// Issue a new search, either immediately or queued behind an
    /// in-flight NMDC search.
    pub fn search(
        &mut self,
        dialect: Dialect,
        our_sid: Option<Sid>,
        our_nick: &str,
        is_passive: bool,
        udp_port: u16,
        conf: SearchConf,
        now: LocalTime,
        outbox: &mut EngineOutbox,
    ) -> SearchToken {
        let token = self.allocate_token();
        if dialect == Dialect::Nmdc && self.nmdc_active.is_some() {
            self.nmdc_queue.push_back((token, conf));
            return token;
        }
        self.start(dialect, our_sid, our_nick, is_passive, udp_port, token, conf, now, outbox);
        token
    }

    fn start(
        &mut self,
        dialect: Dialect,
        our_sid: Option<Sid>,
        our_nick: &str,
        is_passive: bool,
        udp_port: u16,
        token: SearchToken,
        conf: SearchConf,
        now: LocalTime,
        outbox: &mut EngineOutbox,
    ) {
        let msg = match dialect {
            Dialect::Nmdc => {
                self.nmdc_active = Some(token);
                Message::Nmdc(NmdcMessage::Search(to_nmdc_search(our_nick, is_passive, udp_port, &conf)))
            }
            Dialect::Adc => {
                let Some(sid) = our_sid else { return };
                Message::Adc(AdcMessage::BroadcastSearch { author: sid, fields: to_adc_search(&conf, token) })
            }
        };
        outbox.write(HUB_CONN, msg);
        self.outstanding.insert(token, Search { conf, token, issued_at: now });
        outbox.set_timer(SEARCH_LIFETIME);
    }

    /// Called on every event-loop tick to expire stale searches and advance
    /// the NMDC queue.
    pub fn tick(
        &mut self,
        dialect: Dialect,
        our_sid: Option<Sid>,
        our_nick: &str,
        is_passive: bool,
        udp_port: u16,
        now: LocalTime,
        outbox: &mut EngineOutbox,
    ) {
        let expired: Vec<SearchToken> = self
            .outstanding
            .iter()
            .filter(|(_, s)| now.duration_since(s.issued_at) >= SEARCH_LIFETIME)
            .map(|(t, _)| *t)
            .collect();
        for token in expired {
            self.outstanding.remove(&token);
            if self.nmdc_active == Some(token) {
                self.nmdc_active = None;
            }
        }
        if self.nmdc_active.is_none() {
            if let Some((token, conf)) = self.nmdc_queue.pop_front() {
                self.start(dialect, our_sid, our_nick, is_passive, udp_port, token, conf, now, outbox);
            }
        }
    }

    /// Correlate an NMDC `$SR` result against the one active NMDC search.
    pub fn on_nmdc_result(&self, result: NmdcSearchResult) -> Option<(Search, SearchResult)> {
        let token = self.nmdc_active?;
        let search = self.outstanding.get(&token)?.clone();
        Some((
            search,
            SearchResult {
                peer: result.nick,
                path: result.path,
                size: result.size,
                tth: result.tth.as_deref().and_then(Tth::parse),
                is_dir: result.tth.is_none() && result.size == 0,
                slots_avail: result.free_slots,
                is_active: result.hub_address.is_none(),
            },
        ))
    }

    /// Correlate an ADC `DRES`/`URES` result by its echoed token. `is_active`
    /// reflects how the result reached us: `URES` travels over UDP straight
    /// to an active searcher, `DRES` is routed back through the hub for a
    /// passive one — the same distinction NMDC signals via `hub_address`.
    pub fn on_adc_result(&self, peer: String, fields: tigerhub_proto::adc::AdcResultFields, is_active: bool) -> Option<(Search, SearchResult)> {
        let token = self.outstanding.keys().find(|t| t.0.to_string() == fields.token)?;
        let search = self.outstanding.get(token)?.clone();
        Some((
            search,
            SearchResult {
                peer,
                path: fields.file_name.unwrap_or_default(),
                size: fields.size.unwrap_or(0),
                tth: fields.tth.as_deref().and_then(Tth::parse),
                is_dir: fields.tth.is_none(),
                slots_avail: fields.slots.unwrap_or(0),
                is_active,
            },
        ))
    }
}

fn to_nmdc_search(nick: &str, is_passive: bool, udp_port: u16, conf: &SearchConf) -> NmdcSearch {
    let requester = if is_passive { format!("Hub:{nick}") } else { format!("0.0.0.0:{udp_port}") };
    let (data_type, pattern) = match conf.kind {
        SearchKind::Tth => (9, format!("TTH:{}", conf.tth.map(|t| t.to_base32()).unwrap_or_default())),
        SearchKind::Directory => (2, conf.query.clone()),
        SearchKind::File | SearchKind::Any => (1, conf.query.clone()),
    };
    let (size_restrict, size) = match (conf.min_size, conf.max_size) {
        (Some(min), _) => (SizeRestrict::AtLeast, min),
        (None, Some(max)) => (SizeRestrict::AtMost, max),
        (None, None) => (SizeRestrict::None, 0),
    };
    NmdcSearch { requester, size_restrict, size, data_type, pattern }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tigerhub_common::time::{Clock, SystemClock};

    fn conf(query: &str) -> SearchConf {
        SearchConf { kind: SearchKind::File, query: query.into(), tth: None, min_size: None, max_size: None, extension: None }
    }

    #[test]
    fn second_nmdc_search_is_queued_not_sent() {
        let now = SystemClock::new().local_time();
        let mut engine = SearchEngine::new();
        let mut outbox: EngineOutbox = Outbox::new();

        engine.search(Dialect::Nmdc, None, "me", false, 412, conf("a"), now, &mut outbox);
        let first_writes = outbox.drain().count();
        assert_eq!(first_writes, 1, "first search should send immediately");

        engine.search(Dialect::Nmdc, None, "me", false, 412, conf("b"), now, &mut outbox);
        assert!(outbox.is_empty(), "second nmdc search should be queued, not sent");
    }

    #[test]
    fn queued_nmdc_search_starts_once_active_one_expires() {
        let now = SystemClock::new().local_time();
        let mut engine = SearchEngine::new();
        let mut outbox: EngineOutbox = Outbox::new();

        engine.search(Dialect::Nmdc, None, "me", false, 412, conf("a"), now, &mut outbox);
        outbox.drain().for_each(drop);
        engine.search(Dialect::Nmdc, None, "me", false, 412, conf("b"), now, &mut outbox);
        outbox.drain().for_each(drop);

        let later = now + SEARCH_LIFETIME + LocalDuration::from_secs(1);
        engine.tick(Dialect::Nmdc, None, "me", false, 412, later, &mut outbox);
        let wrote = outbox.drain().any(|io| matches!(io, tigerhub_net::Io::Write(_, Message::Nmdc(NmdcMessage::Search(_)))));
        assert!(wrote, "queued search should start once the active one expires");
    }

    #[test]
    fn adc_search_is_sent_immediately_even_while_nmdc_would_queue() {
        let now = SystemClock::new().local_time();
        let mut engine = SearchEngine::new();
        let mut outbox: EngineOutbox = Outbox::new();
        let sid = Sid(*b"ABCD");

        engine.search(Dialect::Adc, Some(sid), "me", false, 0, conf("a"), now, &mut outbox);
        engine.search(Dialect::Adc, Some(sid), "me", false, 0, conf("b"), now, &mut outbox);
        let writes = outbox.drain().filter(|io| matches!(io, tigerhub_net::Io::Write(..))).count();
        assert_eq!(writes, 2, "adc has a correlation token so searches never queue");
    }

    #[test]
    fn nmdc_result_correlates_to_the_active_search() {
        let now = SystemClock::new().local_time();
        let mut engine = SearchEngine::new();
        let mut outbox: EngineOutbox = Outbox::new();
        let token = engine.search(Dialect::Nmdc, None, "me", false, 412, conf("a"), now, &mut outbox);
        outbox.drain().for_each(drop);

        let result = NmdcSearchResult {
            nick: "bob".into(),
            path: "/music/song.mp3".into(),
            size: 1024,
            free_slots: 3,
            total_slots: 5,
            hub_name: "MockHub".into(),
            hub_address: None,
            tth: None,
            target_nick: None,
        };
        let (search, result) = engine.on_nmdc_result(result).expect("active search should correlate");
        assert_eq!(search.token, token);
        assert_eq!(result.peer, "bob");
        assert!(result.is_active);
    }

    #[test]
    fn adc_result_correlates_by_echoed_token() {
        let now = SystemClock::new().local_time();
        let mut engine = SearchEngine::new();
        let mut outbox: EngineOutbox = Outbox::new();
        let sid = Sid(*b"ABCD");
        let token = engine.search(Dialect::Adc, Some(sid), "me", false, 0, conf("a"), now, &mut outbox);

        let fields = tigerhub_proto::adc::AdcResultFields { token: token.0.to_string(), ..Default::default() };
        let (search, result) = engine.on_adc_result("bob".into(), fields, true).expect("token should correlate");
        assert_eq!(search.token, token);
        assert!(result.is_active);
    }
}

fn to_adc_search(conf: &SearchConf, token: SearchToken) -> AdcSearchFields {
    AdcSearchFields {
        and_patterns: if conf.query.is_empty() { vec![] } else { conf.query.split_whitespace().map(str::to_string).collect() },
        file_name: None,
        size: None,
        tth: if conf.kind == SearchKind::Tth { conf.tth.map(|t| t.to_base32()) } else { None },
        file_type: match conf.kind {
            SearchKind::File => Some(1),
            SearchKind::Directory => Some(2),
            _ => None,
        },
        size_ge: conf.min_size,
        size_le: conf.max_size,
        extensions: conf.extension.clone().into_iter().collect(),
        token: token.0.to_string(),
    }
}
