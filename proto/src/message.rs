//! The dialect-unified message type the rest of the codec operates on.

use crate::adc::{self, AdcMessage};
use crate::nmdc::{self, NmdcMessage};
use crate::ProtoError;

/// Which dialect a hub session (and therefore all its peer connections) speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Legacy text protocol, `|`-terminated.
    Nmdc,
    /// Modern protocol, `\n`-terminated.
    Adc,
}

impl Dialect {
    /// The byte that terminates a frame in this dialect.
    pub fn terminator(self) -> u8 {
        match self {
            Dialect::Nmdc => b'|',
            Dialect::Adc => b'\n',
        }
    }
}

/// A decoded protocol message, tagged by dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// An NMDC message.
    Nmdc(NmdcMessage),
    /// An ADC message.
    Adc(AdcMessage),
}

/// Decode one delimiter-stripped frame according to `dialect`.
pub fn decode(dialect: Dialect, frame: &[u8]) -> Result<Message, ProtoError> {
    let line = std::str::from_utf8(frame).map_err(|err| ProtoError::Malformed(format!("non-utf8 frame: {err}")))?;
    match dialect {
        Dialect::Nmdc => nmdc::parse(line).map(Message::Nmdc),
        Dialect::Adc => adc::parse(line).map(Message::Adc),
    }
}

/// Encode a message into a complete frame, including its trailing terminator,
/// ready to be handed to the transport's `write`.
pub fn encode(msg: &Message) -> Vec<u8> {
    let (mut body, terminator) = match msg {
        Message::Nmdc(inner) => (nmdc::encode(inner).into_bytes(), Dialect::Nmdc.terminator()),
        Message::Adc(inner) => (adc::encode(inner).into_bytes(), Dialect::Adc.terminator()),
    };
    body.push(terminator);
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmdc::NmdcMessage;

    #[test]
    fn nmdc_round_trips_through_the_unified_message() {
        let msg = Message::Nmdc(NmdcMessage::MyNick { nick: "alice".into() });
        let frame = encode(&msg);
        assert_eq!(*frame.last().unwrap(), b'|');
        let decoded = decode(Dialect::Nmdc, &frame[..frame.len() - 1]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn adc_round_trips_through_the_unified_message() {
        let msg = Message::Adc(AdcMessage::InfoSid(tigerhub_common::peer::Sid(*b"ABCD")));
        let frame = encode(&msg);
        assert_eq!(*frame.last().unwrap(), b'\n');
        let decoded = decode(Dialect::Adc, &frame[..frame.len() - 1]).unwrap();
        assert_eq!(decoded, msg);
    }
}
