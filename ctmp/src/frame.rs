use std::fmt::{Display, Formatter};

use anyhow::bail;
use bytes::{BufMut, BytesMut};

use crate::checksum::{seal, verify_checksum};
use crate::header::{validate_header, CtmpHeader, CtmpOptions};

/// Result of looking at the start of a receive buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// More data is needed before a decision is possible - either the header or the payload is
    ///  not fully buffered yet
    Incomplete,
    /// A valid frame of the given total length (header included) is at the start of the buffer
    Complete(usize),
}

/// A frame that can never be relayed. Since the protocol has no way to resynchronize, this
///  invalidates the entire stream it was read from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameViolation {
    MalformedHeader([u8; CtmpHeader::SERIALIZED_LEN]),
    ChecksumMismatch { transmitted: u16, length: u16 },
}

impl Display for FrameViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameViolation::MalformedHeader(raw) => write!(f, "malformed header {:02x?}", raw),
            FrameViolation::ChecksumMismatch { transmitted, length } => write!(
                f,
                "checksum mismatch for sensitive frame with {} byte payload (transmitted {:#06x})",
                length, transmitted
            ),
        }
    }
}

impl std::error::Error for FrameViolation {}

/// Classifies the start of `buf`. The header is validated as soon as it is complete, the
///  checksum (for sensitive frames) only after the payload is fully buffered.
pub fn scan_frame(buf: &[u8]) -> Result<FrameStatus, FrameViolation> {
    if buf.len() < CtmpHeader::SERIALIZED_LEN {
        return Ok(FrameStatus::Incomplete);
    }

    let header = CtmpHeader::raw(buf);
    if !validate_header(header) {
        return Err(FrameViolation::MalformedHeader(*header));
    }

    let length = CtmpHeader::raw_length(header);
    let frame_len = CtmpHeader::SERIALIZED_LEN + length as usize;
    if buf.len() < frame_len {
        return Ok(FrameStatus::Incomplete);
    }

    if !verify_checksum(header, &buf[CtmpHeader::SERIALIZED_LEN..frame_len]) {
        return Err(FrameViolation::ChecksumMismatch {
            transmitted: CtmpHeader::raw_checksum(header),
            length,
        });
    }

    Ok(FrameStatus::Complete(frame_len))
}

/// Builds a complete frame for a payload. Sensitive frames are sealed with their checksum,
///  other frames have a zero checksum field.
pub fn encode_frame(options: CtmpOptions, payload: &[u8]) -> anyhow::Result<BytesMut> {
    let Ok(length) = u16::try_from(payload.len()) else {
        bail!("payload of {} bytes exceeds the maximum CTMP payload length of {}", payload.len(), u16::MAX);
    };

    let mut buf = BytesMut::with_capacity(CtmpHeader::SERIALIZED_LEN + payload.len());
    CtmpHeader::new(options, length).ser(&mut buf);
    buf.put_slice(payload);

    if options.contains(CtmpOptions::SENSITIVE) {
        seal(&mut buf);
    }
    Ok(buf)
}
