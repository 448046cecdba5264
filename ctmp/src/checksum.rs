use crate::header::CtmpHeader;

/// The value each byte of the checksum field is replaced with while summing
const CHECKSUM_FIELD_FILL: u8 = 0xCC;

/// Internet-style checksum: the one's complement of the one's complement sum of all 16 bit
///  big-endian words, with a trailing odd byte padded with 0.
pub fn checksum(bytes: &[u8]) -> u16 {
    finish(sum_words(0, bytes))
}

/// Verifies a frame's checksum. Frames without the 'sensitive' flag carry no meaningful checksum
///  and always pass.
///
/// `header` and `payload` are summed as a single buffer, with the checksum field counted as
///  `0xCC 0xCC`. Since the header has an even length, summing the two parts separately gives the
///  same result.
pub fn verify_checksum(header: &[u8; CtmpHeader::SERIALIZED_LEN], payload: &[u8]) -> bool {
    if !CtmpHeader::raw_is_sensitive(header) {
        return true;
    }

    calc_frame_checksum(header, payload) == CtmpHeader::raw_checksum(header)
}

/// Writes the checksum of a complete frame (header and payload) into its checksum field. This
///  works regardless of the 'sensitive' flag, though receivers only check it for sensitive
///  frames.
pub fn seal(frame: &mut [u8]) {
    let (header, payload) = frame.split_at_mut(CtmpHeader::SERIALIZED_LEN);
    let header: &mut [u8; CtmpHeader::SERIALIZED_LEN] = header
        .try_into()
        .expect("this is a bug: split_at_mut returns exactly the header length");

    let checksum = calc_frame_checksum(header, payload);
    header[CtmpHeader::OFFS_CHECKSUM..CtmpHeader::OFFS_CHECKSUM + 2]
        .copy_from_slice(&checksum.to_be_bytes());
}

fn calc_frame_checksum(header: &[u8; CtmpHeader::SERIALIZED_LEN], payload: &[u8]) -> u16 {
    let mut patched = *header;
    patched[CtmpHeader::OFFS_CHECKSUM] = CHECKSUM_FIELD_FILL;
    patched[CtmpHeader::OFFS_CHECKSUM + 1] = CHECKSUM_FIELD_FILL;

    let sum = sum_words(0, &patched);
    finish(sum_words(sum, payload))
}

fn sum_words(initial: u64, bytes: &[u8]) -> u64 {
    let mut sum = initial;

    let mut chunks = bytes.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u64;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u64) << 8;
    }
    sum
}

fn finish(mut sum: u64) -> u16 {
    // for frames of up to 64k, two folds are always enough: the first one can produce at most
    //  a single carry bit
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;
    use crate::header::CtmpOptions;
    use rstest::rstest;

    #[rstest]
    #[case::empty(b"", 0xffff)]
    #[case::single_byte(b"\x01", !0x0100)]
    #[case::single_word(b"\x12\x34", !0x1234)]
    #[case::odd(b"\x12\x34\x56", !(0x1234 + 0x5600))]
    #[case::carry(b"\xff\xff\x00\x01", !0x0001)]
    #[case::rfc1071(b"\x00\x01\xf2\x03\xf4\xf5\xf6\xf7", !0xddf2)]
    fn test_checksum(#[case] bytes: &[u8], #[case] expected: u16) {
        assert_eq!(checksum(bytes), expected);
    }

    #[test]
    fn test_checksum_all_ones() {
        // a sum of 0xffff words folds to 0xffff, complemented to 0
        assert_eq!(checksum(&[0xff; 64]), 0);
    }

    #[test]
    fn test_checksum_double_fold() {
        // 0x10001 words of 0xffff sum to 0xffff_ffff: the first fold gives 0x1fffe, the
        //  second one 0xffff
        let mut bytes = Vec::new();
        for _ in 0..0x10001 {
            bytes.extend_from_slice(&[0xff, 0xff]);
        }
        assert_eq!(checksum(&bytes), 0);
    }

    #[test]
    fn test_verify_ignores_non_sensitive() {
        let mut frame = encode_frame(CtmpOptions::empty(), b"hello").unwrap().to_vec();
        frame[4] = 0x12;
        frame[5] = 0x34;

        let (header, payload) = frame.split_at(CtmpHeader::SERIALIZED_LEN);
        assert!(verify_checksum(CtmpHeader::raw(header), payload));
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::odd(b"hello")]
    #[case::even(b"hello world!")]
    #[case::binary(b"\xff\xff\xff\xff\x00\x00\xcc\xcc")]
    fn test_seal_then_verify(#[case] payload: &[u8]) {
        let frame = encode_frame(CtmpOptions::SENSITIVE, payload).unwrap();
        let (header, payload) = frame.split_at(CtmpHeader::SERIALIZED_LEN);
        assert!(verify_checksum(CtmpHeader::raw(header), payload));
    }

    #[test]
    fn test_checksum_field_does_not_cover_itself() {
        let mut frame = encode_frame(CtmpOptions::SENSITIVE, b"some payload").unwrap().to_vec();
        let sealed = CtmpHeader::raw_checksum(CtmpHeader::raw(&frame));

        // re-sealing with a different value in the field yields the same checksum
        frame[4] = 0x00;
        frame[5] = 0x00;
        seal(&mut frame);
        assert_eq!(CtmpHeader::raw_checksum(CtmpHeader::raw(&frame)), sealed);

        // and it is the plain checksum of the buffer with the field filled with 0xCC
        let mut filled = frame.clone();
        filled[4] = 0xCC;
        filled[5] = 0xCC;
        assert_eq!(checksum(&filled), sealed);
    }

    #[test]
    fn test_verify_detects_flipped_byte() {
        let original = encode_frame(CtmpOptions::SENSITIVE, b"0123456789abcdef").unwrap().to_vec();

        for i in CtmpHeader::SERIALIZED_LEN..original.len() {
            let mut corrupted = original.clone();
            corrupted[i] ^= 0x01;

            let (header, payload) = corrupted.split_at(CtmpHeader::SERIALIZED_LEN);
            assert!(!verify_checksum(CtmpHeader::raw(header), payload), "flipped byte {}", i);
        }
    }

    #[test]
    fn test_verify_detects_wrong_checksum_field() {
        let mut frame = encode_frame(CtmpOptions::SENSITIVE, b"abc").unwrap().to_vec();
        frame[5] ^= 0x80;

        let (header, payload) = frame.split_at(CtmpHeader::SERIALIZED_LEN);
        assert!(!verify_checksum(CtmpHeader::raw(header), payload));
    }
}
