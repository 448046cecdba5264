//! CTMP is a minimal framing protocol for relaying opaque messages over a byte stream. A frame
//!  is an 8 byte header followed by the payload; there is no in-band resynchronization marker,
//!  so a receiver that encounters a malformed header cannot recover the stream and must drop it.
//!
//! ## Header
//!
//! All numbers in network byte order (BE):
//!
//! ```ascii
//! 0: magic (u8) - always 0xCC
//! 1: options (u8):
//!    * bit 6 (0x40): 'sensitive' - the checksum field is meaningful and must be verified
//!    * all other bits must be 0
//! 2: payload length (u16) - any value is valid, including 0
//! 4: checksum (u16) - see below, ignored unless 'sensitive' is set
//! 6: reserved (u16) - must be 0
//! 8: payload (`length` bytes, opaque)
//! ```
//!
//! NB: An older revision of the protocol description shows the 'sensitive' flag at bit 1. The
//!  flag value that senders actually use (and that is checked here) is 0x40, i.e. bit 6.
//!
//! ## Checksum
//!
//! The checksum is the 16 bit one's complement of the one's complement sum of all 16 bit words
//!  of header and payload (a trailing odd byte is padded with 0), the same algorithm that is
//!  used for IP and TCP headers. The checksum field does not cover itself: its two bytes are
//!  summed as `0xCC 0xCC` regardless of the transmitted value.

pub mod checksum;
pub mod frame;
pub mod header;

pub use checksum::{checksum, seal, verify_checksum};
pub use frame::{encode_frame, scan_frame, FrameStatus, FrameViolation};
pub use header::{validate_header, CtmpHeader, CtmpOptions};
