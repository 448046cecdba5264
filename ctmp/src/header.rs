use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut};

bitflags! {
    /// The options byte. Any bit outside the defined flags makes a header invalid.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct CtmpOptions: u8 {
        /// The frame carries a checksum that receivers must verify before passing it on
        const SENSITIVE = 0b0100_0000;
    }
}

/// Decoded form of a frame header. `magic` and the reserved bytes are not represented since they
///  have exactly one valid value each.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CtmpHeader {
    pub options: CtmpOptions,
    pub length: u16,
    pub checksum: u16,
}

impl CtmpHeader {
    pub const MAGIC: u8 = 0xCC;
    pub const SERIALIZED_LEN: usize = 8;
    pub const MAX_FRAME_LEN: usize = Self::SERIALIZED_LEN + u16::MAX as usize;

    pub const OFFS_OPTIONS: usize = 1;
    pub const OFFS_LENGTH: usize = 2;
    pub const OFFS_CHECKSUM: usize = 4;
    pub const OFFS_RESERVED: usize = 6;

    pub fn new(options: CtmpOptions, length: u16) -> CtmpHeader {
        CtmpHeader {
            options,
            length,
            checksum: 0,
        }
    }

    pub fn is_sensitive(&self) -> bool {
        self.options.contains(CtmpOptions::SENSITIVE)
    }

    /// total length of the frame including the header
    pub fn frame_len(&self) -> usize {
        Self::SERIALIZED_LEN + self.length as usize
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(Self::MAGIC);
        buf.put_u8(self.options.bits());
        buf.put_u16(self.length);
        buf.put_u16(self.checksum);
        buf.put_u16(0);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<CtmpHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("buffer too short for a CTMP header: {} bytes", buf.remaining());
        }

        let magic = buf.get_u8();
        let raw_options = buf.get_u8();
        let length = buf.get_u16();
        let checksum = buf.get_u16();
        let reserved = buf.get_u16();

        if magic != Self::MAGIC {
            bail!("invalid magic byte {:#04x}", magic);
        }
        let Some(options) = CtmpOptions::from_bits(raw_options) else {
            bail!("invalid options {:#010b}", raw_options);
        };
        if reserved != 0 {
            bail!("reserved header bytes are not zero: {:#06x}", reserved);
        }

        Ok(CtmpHeader {
            options,
            length,
            checksum,
        })
    }

    /// Reads the header at the start of a buffer that is known to hold at least a full header,
    ///  *without* validating it.
    pub fn raw(buf: &[u8]) -> &[u8; Self::SERIALIZED_LEN] {
        buf[..Self::SERIALIZED_LEN]
            .try_into()
            .expect("this is a bug: caller should have checked for a full header")
    }

    pub fn raw_length(header: &[u8; Self::SERIALIZED_LEN]) -> u16 {
        u16::from_be_bytes([header[Self::OFFS_LENGTH], header[Self::OFFS_LENGTH + 1]])
    }

    pub fn raw_checksum(header: &[u8; Self::SERIALIZED_LEN]) -> u16 {
        u16::from_be_bytes([header[Self::OFFS_CHECKSUM], header[Self::OFFS_CHECKSUM + 1]])
    }

    pub fn raw_is_sensitive(header: &[u8; Self::SERIALIZED_LEN]) -> bool {
        CtmpOptions::from_bits_retain(header[Self::OFFS_OPTIONS]).contains(CtmpOptions::SENSITIVE)
    }
}

/// Checks the parts of a header that have fixed valid values: the magic byte, the options byte
///  (only defined flags, i.e. either no flag or exactly 'sensitive') and the reserved bytes.
///
/// The length is not checked: every value from 0 to 65535 is valid, and whether the payload is
///  available is the reader's business.
pub fn validate_header(header: &[u8; CtmpHeader::SERIALIZED_LEN]) -> bool {
    header[0] == CtmpHeader::MAGIC
        && CtmpOptions::from_bits(header[CtmpHeader::OFFS_OPTIONS]).is_some()
        && header[CtmpHeader::OFFS_RESERVED] == 0
        && header[CtmpHeader::OFFS_RESERVED + 1] == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    fn raw_header(options: u8, length: u16, checksum: u16, reserved: u16) -> [u8; 8] {
        let mut result = [0u8; 8];
        result[0] = CtmpHeader::MAGIC;
        result[1] = options;
        result[2..4].copy_from_slice(&length.to_be_bytes());
        result[4..6].copy_from_slice(&checksum.to_be_bytes());
        result[6..8].copy_from_slice(&reserved.to_be_bytes());
        result
    }

    #[rstest]
    #[case::plain_empty(0, 0, 0)]
    #[case::plain_short(0, 5, 0x1234)]
    #[case::plain_max(0, u16::MAX, 0xffff)]
    #[case::sensitive_empty(0x40, 0, 0)]
    #[case::sensitive_max(0x40, u16::MAX, 0xabcd)]
    fn test_validate_header_valid(#[case] options: u8, #[case] length: u16, #[case] checksum: u16) {
        assert!(validate_header(&raw_header(options, length, checksum, 0)));
    }

    #[rstest]
    #[case::bit_0(0x01)]
    #[case::bit_1(0x02)]
    #[case::bit_7(0x80)]
    #[case::sensitive_plus_other(0x41)]
    #[case::all(0xff)]
    fn test_validate_header_invalid_options(#[case] options: u8) {
        assert!(!validate_header(&raw_header(options, 10, 0, 0)));
    }

    #[rstest]
    #[case::low(0x0001)]
    #[case::high(0x0100)]
    #[case::both(0xffff)]
    fn test_validate_header_invalid_reserved(#[case] reserved: u16) {
        assert!(!validate_header(&raw_header(0, 10, 0, reserved)));
        assert!(!validate_header(&raw_header(0x40, 10, 0, reserved)));
    }

    #[rstest]
    #[case(0x00)]
    #[case(0xcd)]
    #[case(0x4c)]
    fn test_validate_header_invalid_magic(#[case] magic: u8) {
        let mut header = raw_header(0, 10, 0, 0);
        header[0] = magic;
        assert!(!validate_header(&header));
    }

    #[test]
    fn test_length_never_affects_validity() {
        for length in [0u16, 1, 2, 7, 8, 255, 256, 1000, 32767, 32768, 65534, 65535] {
            assert!(validate_header(&raw_header(0, length, 0, 0)));
            assert!(validate_header(&raw_header(0x40, length, 0, 0)));
            assert!(!validate_header(&raw_header(0x02, length, 0, 0)));
        }
    }

    #[rstest]
    #[case(CtmpOptions::empty(), 0)]
    #[case(CtmpOptions::empty(), 1234)]
    #[case(CtmpOptions::SENSITIVE, 0)]
    #[case(CtmpOptions::SENSITIVE, u16::MAX)]
    fn test_ser_deser(#[case] options: CtmpOptions, #[case] length: u16) {
        let original = CtmpHeader {
            options,
            length,
            checksum: 0x9876,
        };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), CtmpHeader::SERIALIZED_LEN);
        assert!(validate_header(CtmpHeader::raw(&buf)));

        let mut b: &[u8] = &buf;
        let deser = CtmpHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
        assert_eq!(deser.frame_len(), 8 + length as usize);
    }

    #[test]
    fn test_deser_rejects_invalid() {
        assert!(CtmpHeader::deser(&mut &raw_header(0x02, 1, 0, 0)[..]).is_err());
        assert!(CtmpHeader::deser(&mut &raw_header(0, 1, 0, 1)[..]).is_err());
        assert!(CtmpHeader::deser(&mut &raw_header(0, 1, 0, 0)[..7]).is_err());

        let mut bad_magic = raw_header(0, 1, 0, 0);
        bad_magic[0] = 0xcb;
        assert!(CtmpHeader::deser(&mut &bad_magic[..]).is_err());
    }

    #[test]
    fn test_raw_accessors() {
        let header = raw_header(0x40, 0x0102, 0xbeef, 0);
        assert_eq!(CtmpHeader::raw_length(&header), 0x0102);
        assert_eq!(CtmpHeader::raw_checksum(&header), 0xbeef);
        assert!(CtmpHeader::raw_is_sensitive(&header));
        assert!(!CtmpHeader::raw_is_sensitive(&raw_header(0, 0x0102, 0xbeef, 0)));
    }
}
