//! Base32 encoding as used on the wire: RFC 4648 alphabet, no padding,
//! upper-case. Used for client IDs, TTH roots and `HPAS`/`IGPA` password
//! exchange.

const ALPHABET: base32::Alphabet = base32::Alphabet::Rfc4648 { padding: false };

/// Encode raw bytes to upper-case, unpadded base32.
pub fn encode(input: &[u8]) -> String {
    base32::encode(ALPHABET, input)
}

/// Decode upper-case, unpadded base32 into raw bytes.
///
/// Returns `None` if `input` contains characters outside the RFC 4648
/// alphabet.
pub fn decode(input: &str) -> Option<Vec<u8>> {
    base32::decode(ALPHABET, input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_bytes() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let encoded = encode(data);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn is_upper_case_and_unpadded() {
        let encoded = encode(b"x");
        assert!(!encoded.contains('='));
        assert_eq!(encoded, encoded.to_uppercase());
    }
}
