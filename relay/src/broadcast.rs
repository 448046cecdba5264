use ctmp::{scan_frame, FrameStatus, FrameViolation};
use tracing::{debug, trace};

use crate::buffers::{InboundBuffer, OutboundBuffer};

#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// number of frames that were moved from the source buffer to the destination buffers
    pub frames: usize,
    pub bytes: usize,
    /// the next frame is complete but does not fit into at least one destination's buffer
    pub backpressure: bool,
    /// the source sent a frame that can not be relayed; the source must be disconnected
    pub violation: Option<FrameViolation>,
}

/// Moves all complete frames from the start of the source buffer to every destination buffer.
///
/// A frame is copied to all destinations or to none of them: if any destination lacks the space
///  for the next frame, the pass stops with `backpressure` set and leaves that frame (and
///  everything after it) in the source buffer. This way all destinations see the same sequence of
///  frames, at the price of the slowest destination setting the pace for all others.
///
/// Frames are dropped if there are no destinations at all.
pub fn broadcast_frames(source: &mut InboundBuffer, destinations: &mut [&mut OutboundBuffer]) -> BroadcastReport {
    let mut report = BroadcastReport::default();

    loop {
        let frame_len = match scan_frame(source.as_ref()) {
            Ok(FrameStatus::Complete(frame_len)) => frame_len,
            Ok(FrameStatus::Incomplete) => break,
            Err(violation) => {
                debug!("invalid frame after {} relayed frames: {}", report.frames, violation);
                report.violation = Some(violation);
                break;
            }
        };

        if let Some(blocking) = destinations.iter().position(|d| d.free() < frame_len) {
            trace!("backpressure: frame of {} bytes does not fit into destination #{} ({} bytes free)", frame_len, blocking, destinations[blocking].free());
            report.backpressure = true;
            break;
        }

        let frame = &source.as_ref()[..frame_len];
        for destination in destinations.iter_mut() {
            destination.enqueue(frame);
        }
        source.consume(frame_len);

        report.frames += 1;
        report.bytes += frame_len;
    }

    report
}
