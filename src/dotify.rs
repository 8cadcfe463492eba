//! Octets ⇄ dotted-DNS-label codec ("dotify").
//!
//! Arbitrary bytes are base32-encoded (RFC 4648, standard alphabet, no
//! padding) and the resulting string is chopped into 60-character labels,
//! each terminated by a dot, so the whole thing is a legal FQDN. The
//! payload of one reliable-layer segment travels entirely inside the name;
//! the rest of the DNS message is camouflage.

use base32::Alphabet;

/// Longest base32 expansion we will chop into one name.
/// DNS caps an FQDN at 253 characters, so 241 before the dots go in;
/// that works out to ⌊241·5/8⌋ = 150 raw bytes, the tunnel MTU.
pub const MAX_ENCODED_LEN: usize = 241;

/// Label chunk length. Kept under the 63-byte DNS label limit to leave
/// headroom for resolvers that normalize or reject maximum-length labels.
const CHUNK_LEN: usize = 60;

const B32: Alphabet = Alphabet::RFC4648 { padding: false };

/// Label codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Input encodes to more characters than fit in one DNS name.
    #[error("input encodes to {0} characters, over the {MAX_ENCODED_LEN}-character name budget")]
    LabelTooLong(usize),

    /// The name does not strip down to valid no-padding base32.
    #[error("name is not valid base32 label data")]
    BadEncoding,
}

/// Encode raw bytes into a dotted label string.
///
/// Every chunk, including the final short one, carries a trailing dot.
/// Empty input encodes to the empty string.
pub fn dotify(data: &[u8]) -> Result<String, CodecError> {
    let b32 = base32::encode(B32, data);
    if b32.len() > MAX_ENCODED_LEN {
        return Err(CodecError::LabelTooLong(b32.len()));
    }

    let mut output = String::with_capacity(b32.len() + b32.len() / CHUNK_LEN + 1);
    let mut rest = b32.as_str();
    while !rest.is_empty() {
        let take = rest.len().min(CHUNK_LEN);
        let (head, tail) = rest.split_at(take);
        output.push_str(head);
        output.push('.');
        rest = tail;
    }
    Ok(output)
}

/// Decode a dotted label string back into raw bytes.
///
/// Dots are stripped wherever they appear, so this accepts both our own
/// chunking and whatever label boundaries a resolver re-imposed.
pub fn undotify(name: &str) -> Result<Vec<u8>, CodecError> {
    let stripped: String = name.chars().filter(|&c| c != '.').collect();
    base32::decode(B32, &stripped).ok_or(CodecError::BadEncoding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MTU;

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        // xorshift, deterministic across runs
        let mut state = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state & 0xFF) as u8
            })
            .collect()
    }

    #[test]
    fn round_trip_all_segment_sizes() {
        for n in 0..=MTU {
            let data = pseudo_random(n, n as u64);
            let name = dotify(&data).unwrap();
            assert_eq!(undotify(&name).unwrap(), data, "length {n}");
        }
    }

    #[test]
    fn rejects_oversize_input() {
        // an MTU-sized segment is the largest input inside the budget
        assert!(dotify(&vec![0u8; MTU]).is_ok());
        for n in [MTU + 1, 200, 241, 300] {
            let data = pseudo_random(n, n as u64);
            assert!(
                matches!(dotify(&data), Err(CodecError::LabelTooLong(_))),
                "length {n} should not encode"
            );
        }
    }

    #[test]
    fn label_shape() {
        for n in 0..=MTU {
            let data = pseudo_random(n, n as u64);
            let name = dotify(&data).unwrap();
            assert!(name.len() <= 253, "length {n} gives a {}-char name", name.len());
            if !name.is_empty() {
                assert!(name.ends_with('.'));
            }
            for run in name.split('.') {
                assert!(run.len() <= CHUNK_LEN, "label run {} too long", run.len());
            }
        }
    }

    #[test]
    fn empty_input_is_empty_name() {
        assert_eq!(dotify(&[]).unwrap(), "");
        assert_eq!(undotify("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn captured_segment_round_trips() {
        // A reliable-layer segment captured off the wire, header included.
        let segment: &[u8] = &[
            68, 51, 34, 17, 81, 0, 32, 0, 3, 29, 94, 234, 3, 0, 0, 0, 4, 0, 0, 0, 42, 0, 0, 0, 79,
            90, 112, 80, 53, 122, 57, 105, 85, 74, 114, 56, 83, 80, 75, 83, 98, 68, 76, 81, 114,
            48, 110, 76, 98, 102, 75, 115, 72, 71, 106, 48, 118, 72, 110, 68, 72, 113, 103, 69,
            61, 0,
        ];
        let name = dotify(segment).unwrap();
        assert_eq!(undotify(&name).unwrap(), segment);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(undotify("not!base32?."), Err(CodecError::BadEncoding));
        // 0, 1, 8, 9 are outside the standard alphabet
        assert_eq!(undotify("ABC1."), Err(CodecError::BadEncoding));
    }
}
