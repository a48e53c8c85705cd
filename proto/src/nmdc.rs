//! NMDC message parsing and encoding.
//!
//! NMDC commands take the form `$Command arg1 arg2...`, or are a bare chat
//! line with no leading `$`. Arguments inside a command are usually space
//! separated, but several (`$MyINFO`, `$Search`) pack several logical fields
//! into one `$`-separated token for historical reasons; each is parsed ad
//! hoc below to match the real wire format rather than a clean grammar.

use crate::escape::{nmdc_escape, nmdc_unescape};
use crate::ProtoError;

/// Which side of a peer connection wants to push data, decided by comparing
/// `$Direction` random numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// This side wants to upload.
    Upload,
    /// This side wants to download.
    Download,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Upload => "Upload",
            Direction::Download => "Download",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "Upload" => Some(Direction::Upload),
            "Download" => Some(Direction::Download),
            _ => None,
        }
    }
}

/// The decoded fields of a `$MyINFO` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NmdcUserInfo {
    pub nick: String,
    pub description: String,
    pub client_tag: String,
    pub connection: String,
    pub flag: u8,
    pub email: String,
    pub share_size: u64,
}

/// How a `$Search` restricts result size; `None` (no restriction) is the
/// common case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeRestrict {
    None,
    AtLeast,
    AtMost,
}

/// The decoded fields of a `$Search` line. `pattern` is already
/// `$`-unescaped (NMDC search patterns join words with literal `$`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NmdcSearch {
    /// `Hub:<nick>` for a passive searcher, `<ip>:<port>` for an active one.
    pub requester: String,
    pub size_restrict: SizeRestrict,
    pub size: u64,
    /// `9` selects a TTH search, in which case `pattern` holds `TTH:<hash>`.
    pub data_type: u8,
    pub pattern: String,
}

/// The decoded fields of an `$SR` search result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NmdcSearchResult {
    pub nick: String,
    pub path: String,
    pub size: u64,
    pub free_slots: u32,
    pub total_slots: u32,
    pub hub_name: String,
    pub hub_address: Option<String>,
    pub tth: Option<String>,
    /// Set when the result is routed back through the hub to a passive
    /// searcher, naming who it's for.
    pub target_nick: Option<String>,
}

/// One decoded NMDC protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NmdcMessage {
    Lock { lock: String, pk: String },
    Key { key: String },
    Hello { nick: String },
    HubName { name: String },
    GetPass,
    MyPass { password: String },
    ValidateNick { nick: String },
    Version { version: String },
    GetNickList,
    MyInfo(NmdcUserInfo),
    OpList { nicks: Vec<String> },
    BotList { nicks: Vec<String> },
    UserIp { pairs: Vec<(String, String)> },
    Quit { nick: String },
    Search(NmdcSearch),
    SearchResult(NmdcSearchResult),
    ConnectToMe { target_nick: String, address: String, port: u16, secure: bool },
    RevConnectToMe { from_nick: String, to_nick: String },
    To { to: String, from: String, text: String },
    MyNick { nick: String },
    Direction { direction: Direction, number: u32 },
    Supports { features: Vec<String> },
    AdcGet { kind: String, path: String, start: i64, length: i64 },
    AdcSnd { kind: String, path: String, start: i64, length: i64 },
    Error { message: String },
    MaxedOut,
    ZOn,
    ZOff,
    /// A bare chat line, or any unrecognized `$Command` we pass through unparsed.
    Chat { nick: Option<String>, text: String },
}

fn split_command(line: &str) -> (&str, &str) {
    match line.find(' ') {
        Some(idx) => (&line[..idx], line[idx + 1..].trim_start()),
        None => (line, ""),
    }
}

/// Parse one NMDC line (without its trailing `|`).
pub fn parse(line: &str) -> Result<NmdcMessage, ProtoError> {
    if !line.starts_with('$') {
        return Ok(parse_chat(line));
    }
    let (cmd, rest) = split_command(line);
    match cmd {
        "$Lock" => {
            let mut parts = rest.splitn(2, ' ');
            let lock = parts.next().unwrap_or_default().to_string();
            let pk = parts
                .next()
                .and_then(|s| s.strip_prefix("Pk="))
                .unwrap_or_default()
                .to_string();
            Ok(NmdcMessage::Lock { lock, pk })
        }
        "$Key" => Ok(NmdcMessage::Key { key: rest.to_string() }),
        "$Hello" => Ok(NmdcMessage::Hello { nick: rest.to_string() }),
        "$HubName" => Ok(NmdcMessage::HubName { name: nmdc_unescape(rest) }),
        "$GetPass" => Ok(NmdcMessage::GetPass),
        "$MyPass" => Ok(NmdcMessage::MyPass { password: nmdc_unescape(rest) }),
        "$ValidateNick" => Ok(NmdcMessage::ValidateNick { nick: rest.to_string() }),
        "$Version" => Ok(NmdcMessage::Version { version: rest.to_string() }),
        "$GetNickList" => Ok(NmdcMessage::GetNickList),
        "$MyINFO" => parse_my_info(rest),
        "$OpList" => Ok(NmdcMessage::OpList { nicks: split_dollar_list(rest) }),
        "$BotList" => Ok(NmdcMessage::BotList { nicks: split_dollar_list(rest) }),
        "$UserIP" => Ok(NmdcMessage::UserIp { pairs: parse_user_ip(rest) }),
        "$Quit" => Ok(NmdcMessage::Quit { nick: rest.to_string() }),
        "$Search" => parse_search(rest),
        "$SR" => parse_search_result(rest),
        "$ConnectToMe" => parse_connect_to_me(rest),
        "$RevConnectToMe" => {
            let mut parts = rest.split(' ');
            let from_nick = parts.next().unwrap_or_default().to_string();
            let to_nick = parts.next().unwrap_or_default().to_string();
            Ok(NmdcMessage::RevConnectToMe { from_nick, to_nick })
        }
        "$To:" => parse_to(rest),
        "$MyNick" => Ok(NmdcMessage::MyNick { nick: rest.to_string() }),
        "$Direction" => {
            let mut parts = rest.split(' ');
            let direction = parts
                .next()
                .and_then(Direction::parse)
                .ok_or_else(|| ProtoError::Malformed(format!("bad $Direction: {rest:?}")))?;
            let number = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| ProtoError::Malformed(format!("bad $Direction number: {rest:?}")))?;
            Ok(NmdcMessage::Direction { direction, number })
        }
        "$Supports" => Ok(NmdcMessage::Supports {
            features: rest.split(' ').filter(|s| !s.is_empty()).map(str::to_string).collect(),
        }),
        "$ADCGET" => parse_adc_get_snd(rest).map(|(kind, path, start, length)| NmdcMessage::AdcGet { kind, path, start, length }),
        "$ADCSND" => parse_adc_get_snd(rest).map(|(kind, path, start, length)| NmdcMessage::AdcSnd { kind, path, start, length }),
        "$Error" => Ok(NmdcMessage::Error { message: nmdc_unescape(rest) }),
        "$MaxedOut" => Ok(NmdcMessage::MaxedOut),
        "$ZOn" => Ok(NmdcMessage::ZOn),
        "$ZOff" => Ok(NmdcMessage::ZOff),
        _ => Ok(NmdcMessage::Chat { nick: None, text: nmdc_unescape(line) }),
    }
}

fn parse_chat(line: &str) -> NmdcMessage {
    // Chat lines conventionally look like `<nick> text`.
    if let Some(rest) = line.strip_prefix('<') {
        if let Some(end) = rest.find('>') {
            let nick = rest[..end].to_string();
            let text = rest[end + 1..].trim_start().to_string();
            return NmdcMessage::Chat { nick: Some(nick), text: nmdc_unescape(&text) };
        }
    }
    NmdcMessage::Chat { nick: None, text: nmdc_unescape(line) }
}

fn split_dollar_list(rest: &str) -> Vec<String> {
    rest.split("$$").filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn parse_user_ip(rest: &str) -> Vec<(String, String)> {
    split_dollar_list(rest)
        .into_iter()
        .filter_map(|entry| {
            let mut parts = entry.splitn(2, ' ');
            let nick = parts.next()?.to_string();
            let ip = parts.next().unwrap_or_default().to_string();
            Some((nick, ip))
        })
        .collect()
}

fn parse_my_info(rest: &str) -> Result<NmdcMessage, ProtoError> {
    // $ALL <nick> <description><client_tag>$ $<connection><flag>$<email>$<share_size>$
    let rest = rest.strip_prefix("$ALL ").unwrap_or(rest);
    let mut fields = rest.splitn(2, ' ');
    let nick = fields.next().unwrap_or_default().to_string();
    let remainder = fields.next().unwrap_or_default();
    let segments: Vec<&str> = remainder.split('$').collect();
    if segments.len() < 6 {
        return Err(ProtoError::Malformed(format!("malformed $MyINFO: {rest:?}")));
    }
    let description_and_tag = segments[0];
    let (description, client_tag) = match description_and_tag.find('<') {
        Some(idx) => (
            nmdc_unescape(&description_and_tag[..idx]),
            description_and_tag[idx..].to_string(),
        ),
        None => (nmdc_unescape(description_and_tag), String::new()),
    };
    let connection_and_flag = segments[2];
    let (connection, flag) = match connection_and_flag.chars().last() {
        Some(last) if !connection_and_flag.is_empty() => {
            (connection_and_flag[..connection_and_flag.len() - last.len_utf8()].to_string(), last as u8)
        }
        _ => (String::new(), 0),
    };
    let email = nmdc_unescape(segments[3]);
    let share_size: u64 = segments[5].parse().unwrap_or(0);
    Ok(NmdcMessage::MyInfo(NmdcUserInfo {
        nick,
        description,
        client_tag,
        connection,
        flag,
        email,
        share_size,
    }))
}

fn parse_search(rest: &str) -> Result<NmdcMessage, ProtoError> {
    // `<requester> <restricted:T|F>?<isMax:T|F>?<size>?<type>?<pattern>`.
    let mut parts = rest.splitn(2, ' ');
    let requester = parts.next().unwrap_or_default().to_string();
    let rest = parts.next().unwrap_or_default();
    let mut fields = rest.splitn(5, '?');
    let restricted = fields.next().unwrap_or("F");
    let is_max = fields.next().unwrap_or("F");
    let size: u64 = fields.next().unwrap_or("0").parse().unwrap_or(0);
    let data_type: u8 = fields.next().unwrap_or("1").parse().unwrap_or(1);
    let pattern = fields.next().unwrap_or_default().replace('$', " ");
    let size_restrict = if restricted != "T" {
        SizeRestrict::None
    } else if is_max == "T" {
        SizeRestrict::AtMost
    } else {
        SizeRestrict::AtLeast
    };
    Ok(NmdcMessage::Search(NmdcSearch {
        requester,
        size_restrict,
        size,
        data_type,
        pattern,
    }))
}

fn parse_search_result(rest: &str) -> Result<NmdcMessage, ProtoError> {
    let (body, target_nick) = match rest.split_once('\u{5}') {
        Some((body, to)) => (body, Some(to.to_string())),
        None => (rest, None),
    };
    let mut parts = body.splitn(2, ' ');
    let nick = parts.next().unwrap_or_default().to_string();
    let rest = parts.next().unwrap_or_default();
    let (path_and_size, hub_part) = rest
        .rsplit_once('\u{5}')
        .ok_or_else(|| ProtoError::Malformed(format!("malformed $SR: {rest:?}")))?;
    let (path, size_and_slots) = path_and_size
        .rsplit_once('\u{5}')
        .ok_or_else(|| ProtoError::Malformed(format!("malformed $SR path: {path_and_size:?}")))?;
    let (size_str, slots) = size_and_slots
        .split_once(' ')
        .unwrap_or((size_and_slots, "0/0"));
    let (free_slots, total_slots) = slots
        .split_once('/')
        .map(|(a, b)| (a.parse().unwrap_or(0), b.parse().unwrap_or(0)))
        .unwrap_or((0, 0));
    let (hub_name, hub_address) = hub_part
        .split_once(" (")
        .map(|(name, addr)| (name.to_string(), Some(addr.trim_end_matches(')').to_string())))
        .unwrap_or((hub_part.to_string(), None));
    let tth = path.strip_prefix("TTH:").map(str::to_string);
    Ok(NmdcMessage::SearchResult(NmdcSearchResult {
        nick,
        path: nmdc_unescape(path),
        size: size_str.parse().unwrap_or(0),
        free_slots,
        total_slots,
        hub_name: nmdc_unescape(&hub_name),
        hub_address,
        tth,
        target_nick,
    }))
}

fn parse_connect_to_me(rest: &str) -> Result<NmdcMessage, ProtoError> {
    let mut parts = rest.split(' ');
    let target_nick = parts.next().unwrap_or_default().to_string();
    let address_part = parts.next().unwrap_or_default();
    let secure = address_part.ends_with('S');
    let address_part = address_part.trim_end_matches('S');
    let (address, port) = address_part
        .rsplit_once(':')
        .ok_or_else(|| ProtoError::Malformed(format!("malformed $ConnectToMe address: {address_part:?}")))?;
    Ok(NmdcMessage::ConnectToMe {
        target_nick,
        address: address.to_string(),
        port: port.parse().map_err(|_| ProtoError::Malformed("bad $ConnectToMe port".into()))?,
        secure,
    })
}

fn parse_to(rest: &str) -> Result<NmdcMessage, ProtoError> {
    // `<to> From: <from> $<text>`
    let (to, rest) = rest
        .split_once(' ')
        .ok_or_else(|| ProtoError::Malformed(format!("malformed $To: {rest:?}")))?;
    let rest = rest.strip_prefix("From: ").unwrap_or(rest);
    let (from, text) = rest
        .split_once(" $")
        .ok_or_else(|| ProtoError::Malformed(format!("malformed $To: body: {rest:?}")))?;
    Ok(NmdcMessage::To {
        to: to.to_string(),
        from: from.to_string(),
        text: nmdc_unescape(text),
    })
}

fn parse_adc_get_snd(rest: &str) -> Result<(String, String, i64, i64), ProtoError> {
    let parts: Vec<&str> = rest.split(' ').collect();
    if parts.len() < 4 {
        return Err(ProtoError::Malformed(format!("malformed $ADCGET/$ADCSND: {rest:?}")));
    }
    let start = parts[2].parse().map_err(|_| ProtoError::Malformed("bad start offset".into()))?;
    let length = parts[3].parse().map_err(|_| ProtoError::Malformed("bad length".into()))?;
    Ok((parts[0].to_string(), nmdc_unescape(parts[1]), start, length))
}

/// Encode one NMDC message, without a trailing terminator.
pub fn encode(msg: &NmdcMessage) -> String {
    match msg {
        NmdcMessage::Lock { lock, pk } => format!("$Lock {lock} Pk={pk}"),
        NmdcMessage::Key { key } => format!("$Key {key}"),
        NmdcMessage::Hello { nick } => format!("$Hello {nick}"),
        NmdcMessage::HubName { name } => format!("$HubName {}", nmdc_escape(name)),
        NmdcMessage::GetPass => "$GetPass".to_string(),
        NmdcMessage::MyPass { password } => format!("$MyPass {}", nmdc_escape(password)),
        NmdcMessage::ValidateNick { nick } => format!("$ValidateNick {nick}"),
        NmdcMessage::Version { version } => format!("$Version {version}"),
        NmdcMessage::GetNickList => "$GetNickList".to_string(),
        NmdcMessage::MyInfo(info) => encode_my_info(info),
        NmdcMessage::OpList { nicks } => format!("$OpList {}$$", nicks.join("$$")),
        NmdcMessage::BotList { nicks } => format!("$BotList {}$$", nicks.join("$$")),
        NmdcMessage::UserIp { pairs } => {
            let body: Vec<String> = pairs.iter().map(|(nick, ip)| format!("{nick} {ip}")).collect();
            format!("$UserIP {}$$", body.join("$$"))
        }
        NmdcMessage::Quit { nick } => format!("$Quit {nick}"),
        NmdcMessage::Search(search) => encode_search(search),
        NmdcMessage::SearchResult(result) => encode_search_result(result),
        NmdcMessage::ConnectToMe { target_nick, address, port, secure } => {
            let suffix = if *secure { "S" } else { "" };
            format!("$ConnectToMe {target_nick} {address}:{port}{suffix}")
        }
        NmdcMessage::RevConnectToMe { from_nick, to_nick } => format!("$RevConnectToMe {from_nick} {to_nick}"),
        NmdcMessage::To { to, from, text } => format!("$To: {to} From: {from} ${}", nmdc_escape(text)),
        NmdcMessage::MyNick { nick } => format!("$MyNick {nick}"),
        NmdcMessage::Direction { direction, number } => format!("$Direction {} {number}", direction.as_str()),
        NmdcMessage::Supports { features } => format!("$Supports {}", features.join(" ")),
        NmdcMessage::AdcGet { kind, path, start, length } => {
            format!("$ADCGET {kind} {} {start} {length}", nmdc_escape(path))
        }
        NmdcMessage::AdcSnd { kind, path, start, length } => {
            format!("$ADCSND {kind} {} {start} {length}", nmdc_escape(path))
        }
        NmdcMessage::Error { message } => format!("$Error {}", nmdc_escape(message)),
        NmdcMessage::MaxedOut => "$MaxedOut".to_string(),
        NmdcMessage::ZOn => "$ZOn".to_string(),
        NmdcMessage::ZOff => "$ZOff".to_string(),
        NmdcMessage::Chat { nick: Some(nick), text } => format!("<{nick}> {}", nmdc_escape(text)),
        NmdcMessage::Chat { nick: None, text } => nmdc_escape(text),
    }
}

fn encode_my_info(info: &NmdcUserInfo) -> String {
    format!(
        "$MyINFO $ALL {} {}{}$ ${}{}${}$${}$",
        info.nick,
        nmdc_escape(&info.description),
        info.client_tag,
        info.connection,
        info.flag as char,
        nmdc_escape(&info.email),
        info.share_size,
    )
}

fn encode_search(search: &NmdcSearch) -> String {
    let restricted = if search.size_restrict == SizeRestrict::None { "F" } else { "T" };
    let is_max = if search.size_restrict == SizeRestrict::AtMost { "T" } else { "F" };
    let pattern = search.pattern.replace(' ', "$");
    format!(
        "$Search {} {restricted}?{is_max}?{}?{}?{pattern}",
        search.requester, search.size, search.data_type
    )
}

fn encode_search_result(result: &NmdcSearchResult) -> String {
    let path = match &result.tth {
        Some(tth) => format!("TTH:{tth}"),
        None => nmdc_escape(&result.path),
    };
    let hub = match &result.hub_address {
        Some(addr) => format!("{} ({addr})", nmdc_escape(&result.hub_name)),
        None => nmdc_escape(&result.hub_name),
    };
    let base = format!(
        "$SR {} {path}\u{5}{}\u{5}{}/{}\u{5}{hub}",
        result.nick, result.size, result.free_slots, result.total_slots
    );
    match &result.target_nick {
        Some(target) => format!("{base}\u{5}{target}"),
        None => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_lock_key() {
        let msg = NmdcMessage::Lock { lock: "EXTENDEDPROTOCOL_test".into(), pk: "tigerhub".into() };
        let line = encode(&msg);
        assert_eq!(parse(&line).unwrap(), msg);
    }

    #[test]
    fn round_trips_my_info() {
        let msg = NmdcMessage::MyInfo(NmdcUserInfo {
            nick: "alice".into(),
            description: "a test peer".into(),
            client_tag: "<tigerhub V:0.1.0,M:A,H:1/0/0,S:1>".into(),
            connection: "LAN(T1)".into(),
            flag: 0x01,
            email: "a@example.com".into(),
            share_size: 10_000,
        });
        let line = encode(&msg);
        assert_eq!(parse(&line).unwrap(), msg);
    }

    #[test]
    fn round_trips_search_pattern_with_spaces() {
        let msg = NmdcMessage::Search(NmdcSearch {
            requester: "Hub:alice".into(),
            size_restrict: SizeRestrict::None,
            size: 0,
            data_type: 1,
            pattern: "inner folder".into(),
        });
        let line = encode(&msg);
        assert!(line.contains("inner$folder"));
        assert_eq!(parse(&line).unwrap(), msg);
    }

    #[test]
    fn round_trips_search_result_with_tth() {
        let msg = NmdcMessage::SearchResult(NmdcSearchResult {
            nick: "bob".into(),
            path: "/inner folder/test file.txt".into(),
            size: 10_000,
            free_slots: 2,
            total_slots: 3,
            hub_name: "TestHub".into(),
            hub_address: Some("hub.example.com:411".into()),
            tth: Some("UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY".into()),
            target_nick: Some("alice".into()),
        });
        let line = encode(&msg);
        assert_eq!(parse(&line).unwrap(), msg);
    }

    #[test]
    fn escapes_reserved_characters_in_chat() {
        let line = encode(&NmdcMessage::Chat { nick: Some("bob".into()), text: "cost is $5 | cheap".into() });
        assert!(!line.contains('|'));
        assert_eq!(
            parse(&line).unwrap(),
            NmdcMessage::Chat { nick: Some("bob".into()), text: "cost is $5 | cheap".into() }
        );
    }
}
