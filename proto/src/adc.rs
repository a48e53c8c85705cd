//! ADC message parsing and encoding.
//!
//! An ADC line is `<Type><Cmd> <args...>`, where `Type` is a single routing
//! letter and `Cmd` is three uppercase letters. Broadcast/directed/echo
//! variants (`B`/`D`/`E`/`F`) carry a leading session id; `U` carries a
//! client id instead. Everything after the header is a run of
//! space-separated tokens: either bare positional tokens or `<key><value>`
//! fields, both escaped per [`crate::escape::adc_escape`].

use std::collections::HashMap;

use tigerhub_common::peer::{Cid, Sid};

use crate::escape::{adc_escape, adc_unescape};
use crate::ProtoError;

/// The `ID`/`NI`/`DE`/... field set carried by `BINF`/`CINF`/`IINF`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdcInfoFields {
    /// `ID` — client id, base32.
    pub client_id: Option<String>,
    /// `PD` — private id, sent by the hub to its own client once, never broadcast.
    pub private_id: Option<String>,
    /// `NI` — nick.
    pub nick: Option<String>,
    /// `DE` — free-text description.
    pub description: Option<String>,
    /// `SS` — total shared bytes.
    pub share_size: Option<u64>,
    /// `SF` — shared file count.
    pub share_count: Option<u64>,
    /// `I4` — IPv4 address.
    pub ip4: Option<String>,
    /// `U4` — UDP port for passive search results.
    pub udp4: Option<u16>,
    /// `SU` — comma-separated supported feature list.
    pub supports: Vec<String>,
    /// `SL` — free upload slots.
    pub slots: Option<u32>,
    /// `KP` — TLS certificate fingerprint, `<algorithm>/<hex>`.
    pub fingerprint: Option<String>,
    /// Any other field, preserved for round-tripping.
    pub extra: HashMap<String, String>,
}

/// The field set carried by `BSCH`/`FSCH` search requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdcSearchFields {
    /// `AN` — one pattern per token; all must match (AND semantics).
    pub and_patterns: Vec<String>,
    /// `FN` — an exact virtual path to match, bypassing pattern matching.
    pub file_name: Option<String>,
    /// `SI` — exact size match.
    pub size: Option<u64>,
    /// `TR` — Tiger-Tree-Hash to match exactly.
    pub tth: Option<String>,
    /// `TY` — `1` file-only, `2` directory-only, absent or `0` either.
    pub file_type: Option<u8>,
    /// `GE` — minimum size.
    pub size_ge: Option<u64>,
    /// `LE` — maximum size.
    pub size_le: Option<u64>,
    /// `EX` — comma-separated extension filter.
    pub extensions: Vec<String>,
    /// `TO` — correlation token, echoed back on every result.
    pub token: String,
}

/// The field set carried by `DRES`/`URES` search results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdcResultFields {
    /// `FN` — the matched virtual path.
    pub file_name: Option<String>,
    /// `SI` — size in bytes; absent for directories.
    pub size: Option<u64>,
    /// `TR` — Tiger-Tree-Hash; absent for directories.
    pub tth: Option<String>,
    /// `SL` — free upload slots on the responder.
    pub slots: Option<u32>,
    /// `TO` — the token from the originating search.
    pub token: String,
}

/// One decoded ADC protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdcMessage {
    /// `HSUP` — this client announcing its features to the hub.
    HubSupports(Vec<String>),
    /// `ISUP` — the hub announcing its features.
    InfoSupports(Vec<String>),
    /// `CSUP` — feature announcement on a peer connection.
    ClientSupports(Vec<String>),
    /// `ISID` — the hub assigning this client's session id.
    InfoSid(Sid),
    /// `BINF` — a client's full self-description, broadcast to the hub.
    BroadcastInfo { author: Sid, fields: AdcInfoFields },
    /// `CINF` — a peer connection's self-description.
    ClientInfo { fields: AdcInfoFields },
    /// `IGPA` — the hub challenging for a password (carries a salt).
    InfoGetPass { salt: String },
    /// `HPAS` — this client's password response (Tiger-hash of salt+password, base32).
    HubPass { hash: String },
    /// `IQUI` — a session left the hub.
    InfoQuit { sid: Sid, reason: Option<String> },
    /// `DCTM` — request the target open a connection to the author.
    DirectConnectToMe {
        author: Sid,
        target: Sid,
        protocol: String,
        port: u16,
        token: String,
    },
    /// `DRCM` — ask the target to send a `DCTM` back (the author cannot accept inbound).
    DirectRevConnectToMe {
        author: Sid,
        target: Sid,
        protocol: String,
        token: String,
    },
    /// `CGET` — request a file (or file list) over a peer connection.
    ClientGet {
        kind: String,
        path: String,
        start: i64,
        length: i64,
    },
    /// `CSND` — response to `CGET` announcing the byte range about to follow.
    ClientSend {
        kind: String,
        path: String,
        start: i64,
        length: i64,
    },
    /// `BSCH` — a search broadcast to every peer on the hub.
    BroadcastSearch { author: Sid, fields: AdcSearchFields },
    /// `FSCH` — a search broadcast restricted to peers matching a feature filter.
    FeatureSearch {
        author: Sid,
        feature_filter: Vec<String>,
        fields: AdcSearchFields,
    },
    /// `DRES` — a search result routed back through the hub.
    DirectResult {
        author: Sid,
        target: Sid,
        fields: AdcResultFields,
    },
    /// `URES` — a search result sent directly over UDP.
    UdpResult { cid: Cid, fields: AdcResultFields },
    /// `ISTA`/`HSTA` — a status/error line from the hub.
    Status {
        sid: Option<Sid>,
        severity: u8,
        code: u8,
        message: String,
    },
    /// `CSTA` — a status/error line on a peer connection.
    ClientStatus { severity: u8, code: u8, message: String },
}

fn tokenize(rest: &str) -> Vec<String> {
    rest.split(' ')
        .filter(|tok| !tok.is_empty())
        .map(adc_unescape)
        .collect()
}

fn parse_fields(tokens: &[String]) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for tok in tokens {
        if tok.len() >= 2 {
            let (key, value) = tok.split_at(2);
            fields.insert(key.to_string(), value.to_string());
        }
    }
    fields
}

fn encode_fields(fields: &HashMap<String, String>) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{k}{}", adc_escape(v)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn info_fields_to_map(info: &AdcInfoFields) -> Vec<(String, String)> {
    let mut out = Vec::new();
    if let Some(v) = &info.client_id {
        out.push(("ID".into(), v.clone()));
    }
    if let Some(v) = &info.private_id {
        out.push(("PD".into(), v.clone()));
    }
    if let Some(v) = &info.nick {
        out.push(("NI".into(), v.clone()));
    }
    if let Some(v) = &info.description {
        out.push(("DE".into(), v.clone()));
    }
    if let Some(v) = info.share_size {
        out.push(("SS".into(), v.to_string()));
    }
    if let Some(v) = info.share_count {
        out.push(("SF".into(), v.to_string()));
    }
    if let Some(v) = &info.ip4 {
        out.push(("I4".into(), v.clone()));
    }
    if let Some(v) = info.udp4 {
        out.push(("U4".into(), v.to_string()));
    }
    if !info.supports.is_empty() {
        out.push(("SU".into(), info.supports.join(",")));
    }
    if let Some(v) = info.slots {
        out.push(("SL".into(), v.to_string()));
    }
    if let Some(v) = &info.fingerprint {
        out.push(("KP".into(), v.clone()));
    }
    for (k, v) in &info.extra {
        out.push((k.clone(), v.clone()));
    }
    out
}

fn map_to_info_fields(map: HashMap<String, String>) -> AdcInfoFields {
    let mut info = AdcInfoFields::default();
    let mut map = map;
    info.client_id = map.remove("ID");
    info.private_id = map.remove("PD");
    info.nick = map.remove("NI");
    info.description = map.remove("DE");
    info.share_size = map.remove("SS").and_then(|v| v.parse().ok());
    info.share_count = map.remove("SF").and_then(|v| v.parse().ok());
    info.ip4 = map.remove("I4");
    info.udp4 = map.remove("U4").and_then(|v| v.parse().ok());
    info.supports = map
        .remove("SU")
        .map(|v| v.split(',').map(str::to_string).collect())
        .unwrap_or_default();
    info.slots = map.remove("SL").and_then(|v| v.parse().ok());
    info.fingerprint = map.remove("KP");
    info.extra = map;
    info
}

fn search_fields_to_map(search: &AdcSearchFields) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = search
        .and_patterns
        .iter()
        .map(|p| ("AN".to_string(), p.clone()))
        .collect();
    if let Some(v) = &search.file_name {
        out.push(("FN".into(), v.clone()));
    }
    if let Some(v) = search.size {
        out.push(("SI".into(), v.to_string()));
    }
    if let Some(v) = &search.tth {
        out.push(("TR".into(), v.clone()));
    }
    if let Some(v) = search.file_type {
        out.push(("TY".into(), v.to_string()));
    }
    if let Some(v) = search.size_ge {
        out.push(("GE".into(), v.to_string()));
    }
    if let Some(v) = search.size_le {
        out.push(("LE".into(), v.to_string()));
    }
    if !search.extensions.is_empty() {
        out.push(("EX".into(), search.extensions.join(",")));
    }
    out.push(("TO".into(), search.token.clone()));
    out
}

fn map_to_search_fields(tokens: &[String]) -> AdcSearchFields {
    let mut search = AdcSearchFields::default();
    for tok in tokens {
        if tok.len() < 2 {
            continue;
        }
        let (key, value) = tok.split_at(2);
        match key {
            "AN" => search.and_patterns.push(value.to_string()),
            "FN" => search.file_name = Some(value.to_string()),
            "SI" => search.size = value.parse().ok(),
            "TR" => search.tth = Some(value.to_string()),
            "TY" => search.file_type = value.parse().ok(),
            "GE" => search.size_ge = value.parse().ok(),
            "LE" => search.size_le = value.parse().ok(),
            "EX" => search.extensions = value.split(',').map(str::to_string).collect(),
            "TO" => search.token = value.to_string(),
            _ => {}
        }
    }
    search
}

fn result_fields_to_map(result: &AdcResultFields) -> Vec<(String, String)> {
    let mut out = Vec::new();
    if let Some(v) = &result.file_name {
        out.push(("FN".into(), v.clone()));
    }
    if let Some(v) = result.size {
        out.push(("SI".into(), v.to_string()));
    }
    if let Some(v) = &result.tth {
        out.push(("TR".into(), v.clone()));
    }
    if let Some(v) = result.slots {
        out.push(("SL".into(), v.to_string()));
    }
    out.push(("TO".into(), result.token.clone()));
    out
}

fn map_to_result_fields(tokens: &[String]) -> AdcResultFields {
    let mut result = AdcResultFields::default();
    for tok in tokens {
        if tok.len() < 2 {
            continue;
        }
        let (key, value) = tok.split_at(2);
        match key {
            "FN" => result.file_name = Some(value.to_string()),
            "SI" => result.size = value.parse().ok(),
            "TR" => result.tth = Some(value.to_string()),
            "SL" => result.slots = value.parse().ok(),
            "TO" => result.token = value.to_string(),
            _ => {}
        }
    }
    result
}

fn fields_line(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}{}", adc_escape(v)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse one ADC line (without its trailing `\n`).
pub fn parse(line: &str) -> Result<AdcMessage, ProtoError> {
    if line.len() < 4 {
        return Err(ProtoError::Malformed(format!("ADC line too short: {line:?}")));
    }
    let (header, rest) = line.split_at(4);
    let (type_letter, cmd) = header.split_at(1);
    let rest = rest.trim_start();

    match (type_letter, cmd) {
        ("H", "SUP") => Ok(AdcMessage::HubSupports(parse_feature_list(rest))),
        ("I", "SUP") => Ok(AdcMessage::InfoSupports(parse_feature_list(rest))),
        ("C", "SUP") => Ok(AdcMessage::ClientSupports(parse_feature_list(rest))),
        ("I", "SID") => {
            let tokens = tokenize(rest);
            let sid = tokens.first().ok_or_else(|| ProtoError::Malformed("ISID missing sid".into()))?;
            Ok(AdcMessage::InfoSid(parse_sid(sid)?))
        }
        ("B", "INF") => {
            let tokens = tokenize(rest);
            let (sid_tok, field_toks) = tokens.split_first().ok_or_else(|| ProtoError::Malformed("BINF missing author".into()))?;
            Ok(AdcMessage::BroadcastInfo {
                author: parse_sid(sid_tok)?,
                fields: map_to_info_fields(parse_fields(field_toks)),
            })
        }
        ("C", "INF") => {
            let tokens = tokenize(rest);
            Ok(AdcMessage::ClientInfo {
                fields: map_to_info_fields(parse_fields(&tokens)),
            })
        }
        ("I", "GPA") => {
            let tokens = tokenize(rest);
            let salt = tokens.first().cloned().unwrap_or_default();
            Ok(AdcMessage::InfoGetPass { salt })
        }
        ("H", "PAS") => {
            let tokens = tokenize(rest);
            let hash = tokens.first().cloned().unwrap_or_default();
            Ok(AdcMessage::HubPass { hash })
        }
        ("I", "QUI") => {
            let tokens = tokenize(rest);
            let (sid_tok, field_toks) = tokens.split_first().ok_or_else(|| ProtoError::Malformed("IQUI missing sid".into()))?;
            let fields = parse_fields(field_toks);
            Ok(AdcMessage::InfoQuit {
                sid: parse_sid(sid_tok)?,
                reason: fields.get("MS").cloned(),
            })
        }
        ("D", "CTM") => {
            let tokens = tokenize(rest);
            if tokens.len() < 5 {
                return Err(ProtoError::Malformed("DCTM missing fields".into()));
            }
            Ok(AdcMessage::DirectConnectToMe {
                author: parse_sid(&tokens[0])?,
                target: parse_sid(&tokens[1])?,
                protocol: tokens[2].clone(),
                port: tokens[3].parse().map_err(|_| ProtoError::Malformed("DCTM bad port".into()))?,
                token: tokens[4].clone(),
            })
        }
        ("D", "RCM") => {
            let tokens = tokenize(rest);
            if tokens.len() < 4 {
                return Err(ProtoError::Malformed("DRCM missing fields".into()));
            }
            Ok(AdcMessage::DirectRevConnectToMe {
                author: parse_sid(&tokens[0])?,
                target: parse_sid(&tokens[1])?,
                protocol: tokens[2].clone(),
                token: tokens[3].clone(),
            })
        }
        ("C", "GET") => parse_get_send(rest).map(|(kind, path, start, length)| AdcMessage::ClientGet { kind, path, start, length }),
        ("C", "SND") => parse_get_send(rest).map(|(kind, path, start, length)| AdcMessage::ClientSend { kind, path, start, length }),
        ("B", "SCH") => {
            let tokens = tokenize(rest);
            let (sid_tok, field_toks) = tokens.split_first().ok_or_else(|| ProtoError::Malformed("BSCH missing author".into()))?;
            Ok(AdcMessage::BroadcastSearch {
                author: parse_sid(sid_tok)?,
                fields: map_to_search_fields(field_toks),
            })
        }
        ("F", "SCH") => {
            let tokens = tokenize(rest);
            let (sid_tok, field_toks) = tokens.split_first().ok_or_else(|| ProtoError::Malformed("FSCH missing author".into()))?;
            let (filter_toks, search_toks): (Vec<_>, Vec<_>) =
                field_toks.iter().cloned().partition(|t| t.starts_with('+') || t.starts_with('-'));
            Ok(AdcMessage::FeatureSearch {
                author: parse_sid(sid_tok)?,
                feature_filter: filter_toks,
                fields: map_to_search_fields(&search_toks),
            })
        }
        ("D", "RES") => {
            let tokens = tokenize(rest);
            if tokens.len() < 2 {
                return Err(ProtoError::Malformed("DRES missing fields".into()));
            }
            Ok(AdcMessage::DirectResult {
                author: parse_sid(&tokens[0])?,
                target: parse_sid(&tokens[1])?,
                fields: map_to_result_fields(&tokens[2..]),
            })
        }
        ("U", "RES") => {
            let tokens = tokenize(rest);
            let (cid_tok, field_toks) = tokens.split_first().ok_or_else(|| ProtoError::Malformed("URES missing cid".into()))?;
            Ok(AdcMessage::UdpResult {
                cid: Cid(cid_tok.clone()),
                fields: map_to_result_fields(field_toks),
            })
        }
        ("I", "STA") | ("H", "STA") => {
            let (severity, code, message) = parse_sta_code(rest)?;
            Ok(AdcMessage::Status { sid: None, severity, code, message })
        }
        ("C", "STA") => {
            let (severity, code, message) = parse_sta_code(rest)?;
            Ok(AdcMessage::ClientStatus { severity, code, message })
        }
        _ => Err(ProtoError::Malformed(format!("unrecognized ADC header {header:?}"))),
    }
}

fn parse_sta_code(rest: &str) -> Result<(u8, u8, String), ProtoError> {
    let tokens = tokenize(rest);
    let code_tok = tokens.first().ok_or_else(|| ProtoError::Malformed("STA missing code".into()))?;
    if code_tok.len() != 3 {
        return Err(ProtoError::Malformed(format!("STA code malformed: {code_tok}")));
    }
    let severity: u8 = code_tok[0..1].parse().map_err(|_| ProtoError::Malformed("STA bad severity".into()))?;
    let code: u8 = code_tok[1..3].parse().map_err(|_| ProtoError::Malformed("STA bad code".into()))?;
    let message = tokens.get(1).cloned().unwrap_or_default();
    Ok((severity, code, message))
}

fn parse_get_send(rest: &str) -> Result<(String, String, i64, i64), ProtoError> {
    let tokens = tokenize(rest);
    if tokens.len() < 4 {
        return Err(ProtoError::Malformed(format!("GET/SND missing fields: {rest:?}")));
    }
    let start = tokens[2].parse().map_err(|_| ProtoError::Malformed("bad start offset".into()))?;
    let length = tokens[3].parse().map_err(|_| ProtoError::Malformed("bad length".into()))?;
    Ok((tokens[0].clone(), tokens[1].clone(), start, length))
}

fn parse_feature_list(rest: &str) -> Vec<String> {
    tokenize(rest)
        .into_iter()
        .filter_map(|tok| tok.get(2..).map(str::to_string).or(Some(tok)))
        .collect()
}

fn encode_feature_list(prefix: &str, features: &[String]) -> String {
    features.iter().map(|f| format!("{prefix}{f}")).collect::<Vec<_>>().join(" ")
}

fn parse_sid(token: &str) -> Result<Sid, ProtoError> {
    let bytes = token.as_bytes();
    if bytes.len() != 4 {
        return Err(ProtoError::Malformed(format!("invalid session id: {token:?}")));
    }
    let mut arr = [0u8; 4];
    arr.copy_from_slice(bytes);
    Ok(Sid(arr))
}

fn sid_str(sid: &Sid) -> String {
    String::from_utf8_lossy(&sid.0).into_owned()
}

/// Encode one ADC message, without a trailing terminator.
pub fn encode(msg: &AdcMessage) -> String {
    match msg {
        AdcMessage::HubSupports(features) => format!("HSUP {}", encode_feature_list("AD", features)),
        AdcMessage::InfoSupports(features) => format!("ISUP {}", encode_feature_list("AD", features)),
        AdcMessage::ClientSupports(features) => format!("CSUP {}", encode_feature_list("AD", features)),
        AdcMessage::InfoSid(sid) => format!("ISID {}", sid_str(sid)),
        AdcMessage::BroadcastInfo { author, fields } => {
            format!("BINF {} {}", sid_str(author), fields_line(&info_fields_to_map(fields)))
        }
        AdcMessage::ClientInfo { fields } => format!("CINF {}", fields_line(&info_fields_to_map(fields))),
        AdcMessage::InfoGetPass { salt } => format!("IGPA {salt}"),
        AdcMessage::HubPass { hash } => format!("HPAS {hash}"),
        AdcMessage::InfoQuit { sid, reason } => match reason {
            Some(reason) => format!("IQUI {} MS{}", sid_str(sid), adc_escape(reason)),
            None => format!("IQUI {}", sid_str(sid)),
        },
        AdcMessage::DirectConnectToMe { author, target, protocol, port, token } => {
            format!("DCTM {} {} {protocol} {port} {token}", sid_str(author), sid_str(target))
        }
        AdcMessage::DirectRevConnectToMe { author, target, protocol, token } => {
            format!("DRCM {} {} {protocol} {token}", sid_str(author), sid_str(target))
        }
        AdcMessage::ClientGet { kind, path, start, length } => {
            format!("CGET {kind} {} {start} {length}", adc_escape(path))
        }
        AdcMessage::ClientSend { kind, path, start, length } => {
            format!("CSND {kind} {} {start} {length}", adc_escape(path))
        }
        AdcMessage::BroadcastSearch { author, fields } => {
            format!("BSCH {} {}", sid_str(author), fields_line(&search_fields_to_map(fields)))
        }
        AdcMessage::FeatureSearch { author, feature_filter, fields } => {
            let mut parts = vec![format!("FSCH {}", sid_str(author))];
            parts.extend(feature_filter.iter().cloned());
            parts.push(fields_line(&search_fields_to_map(fields)));
            parts.join(" ")
        }
        AdcMessage::DirectResult { author, target, fields } => {
            format!("DRES {} {} {}", sid_str(author), sid_str(target), fields_line(&result_fields_to_map(fields)))
        }
        AdcMessage::UdpResult { cid, fields } => {
            format!("URES {} {}", cid.0, fields_line(&result_fields_to_map(fields)))
        }
        AdcMessage::Status { sid, severity, code, message } => {
            let header = sid.as_ref().map(|s| format!(" {}", sid_str(s))).unwrap_or_default();
            format!("ISTA{header} {severity}{code:02} {}", adc_escape(message))
        }
        AdcMessage::ClientStatus { severity, code, message } => {
            format!("CSTA {severity}{code:02} {}", adc_escape(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> Sid {
        let bytes: [u8; 4] = s.as_bytes().try_into().unwrap();
        Sid(bytes)
    }

    #[test]
    fn round_trips_binf() {
        let msg = AdcMessage::BroadcastInfo {
            author: sid("ABCD"),
            fields: AdcInfoFields {
                nick: Some("tester".into()),
                description: Some("a test peer".into()),
                share_size: Some(10_000),
                supports: vec!["TCP4".into(), "ADC0".into()],
                ..Default::default()
            },
        };
        let line = encode(&msg);
        assert!(line.starts_with("BINF ABCD "));
        let parsed = parse(&line).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn round_trips_search_with_and_patterns() {
        let msg = AdcMessage::BroadcastSearch {
            author: sid("ABCD"),
            fields: AdcSearchFields {
                and_patterns: vec!["ner".into(), "fo".into()],
                file_type: Some(2),
                token: "tok1".into(),
                ..Default::default()
            },
        };
        let line = encode(&msg);
        let parsed = parse(&line).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn escapes_spaces_in_directed_result() {
        let msg = AdcMessage::DirectResult {
            author: sid("AAAA"),
            target: sid("BBBB"),
            fields: AdcResultFields {
                file_name: Some("/inner folder/test file.txt".into()),
                size: Some(10_000),
                tth: Some("UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY".into()),
                slots: Some(3),
                token: "tok1".into(),
            },
        };
        let line = encode(&msg);
        assert!(!line.contains("test file.txt"));
        let parsed = parse(&line).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn rejects_malformed_header() {
        assert!(parse("X").is_err());
    }
}
