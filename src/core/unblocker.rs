//! Recovery of a log blocked by a stalled or dead publisher.
//!
//! A publisher reserves a slot by advancing the term tail, writes its frame
//! with the length negated, then commits the positive length. If it dies or
//! stalls between reservation and commit, every consumer waits forever at
//! that offset. The unblocker rewrites the stuck region as a padding frame
//! so consumers can advance past it. This is the only mechanism allowed to
//! move the consumer view past a frame it did not author.

use std::sync::atomic::Ordering;

use crate::core::frame::{self, FRAME_ALIGNMENT};
use crate::core::layout::{self, MappedRawLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnblockStatus {
    NoAction,
    Unblocked,
    UnblockedToEnd,
}

/// Attempt to unblock the log at `blocked_position`. Returns true when a
/// stalled producer was advanced past.
pub fn unblock(raw_log: &MappedRawLog, blocked_position: i64) -> bool {
    let meta = raw_log.meta();
    let term_length = raw_log.term_length() as i64;
    let position_bits_to_shift = (raw_log.term_length() as u64).trailing_zeros();

    let index = layout::index_by_position(blocked_position, position_bits_to_shift);
    let blocked_offset = (blocked_position & (term_length - 1)) as i32;
    let raw_tail = meta.term_tail_counters[index].load(Ordering::Acquire);
    let term_id = layout::term_id(raw_tail);
    let tail_offset = layout::term_offset(raw_tail, term_length);
    let term = raw_log.term(index);

    match unblock_term(
        term,
        &meta.default_frame_header,
        term_length as i32,
        blocked_offset,
        tail_offset,
        term_id,
    ) {
        UnblockStatus::Unblocked => true,
        UnblockStatus::UnblockedToEnd => {
            let term_count = (blocked_position >> position_bits_to_shift) as i32;
            layout::rotate_log(meta, term_count, term_id);
            true
        }
        UnblockStatus::NoAction => false,
    }
}

fn unblock_term(
    term: *mut u8,
    default_header: &[u8],
    term_length: i32,
    blocked_offset: i32,
    tail_offset: i32,
    term_id: i32,
) -> UnblockStatus {
    let mut status = UnblockStatus::NoAction;
    // SAFETY: offsets below are bounded by term_length and frame aligned.
    let frame = unsafe { term.add(blocked_offset as usize) };
    let frame_length = frame::frame_length_volatile(frame);

    if frame_length < 0 {
        // Reservation taken, never committed. Pad over the claimed bytes.
        frame::write_padding_frame(frame, default_header, blocked_offset, term_id, -frame_length);
        status = UnblockStatus::Unblocked;
    } else if frame_length == 0 {
        let mut current_offset = blocked_offset + FRAME_ALIGNMENT as i32;

        while current_offset < tail_offset {
            let current = unsafe { term.add(current_offset as usize) };
            if frame::frame_length_volatile(current) != 0 {
                if scan_back_to_confirm_still_zeroed(term, blocked_offset, current_offset) {
                    frame::write_padding_frame(
                        frame,
                        default_header,
                        blocked_offset,
                        term_id,
                        current_offset - blocked_offset,
                    );
                    status = UnblockStatus::Unblocked;
                }
                break;
            }
            current_offset += FRAME_ALIGNMENT as i32;
        }

        if current_offset == term_length && frame::frame_length_volatile(frame) == 0 {
            frame::write_padding_frame(
                frame,
                default_header,
                blocked_offset,
                term_id,
                term_length - blocked_offset,
            );
            status = UnblockStatus::UnblockedToEnd;
        }
    }

    status
}

/// Re-scan the gap after finding a committed frame beyond it. A concurrent
/// publisher may have committed into the gap between the forward scan and
/// the padding write; in that case back off.
fn scan_back_to_confirm_still_zeroed(term: *mut u8, from_offset: i32, to_offset: i32) -> bool {
    let mut offset = to_offset - FRAME_ALIGNMENT as i32;
    while offset >= from_offset {
        let frame = unsafe { term.add(offset as usize) };
        if frame::frame_length_volatile(frame) != 0 {
            return false;
        }
        offset -= FRAME_ALIGNMENT as i32;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::{frame_type, DATA_HEADER_LENGTH, HDR_TYPE_PAD};
    use crate::core::layout::{init_log_meta, pack_tail, MappedRawLog, TERM_MIN_LENGTH};
    use tempfile::tempdir;

    fn new_log() -> (tempfile::TempDir, MappedRawLog) {
        let dir = tempdir().expect("tempdir");
        let mut raw_log = MappedRawLog::create(
            &dir.path().join("unblock.logbuffer"),
            true,
            TERM_MIN_LENGTH,
            4096,
        )
        .expect("map raw log");
        init_log_meta(
            raw_log.meta_mut(),
            0,
            TERM_MIN_LENGTH,
            1408,
            4096,
            1,
            7,
            1001,
            None,
        );
        (dir, raw_log)
    }

    fn set_tail(raw_log: &MappedRawLog, index: usize, term_id: i32, offset: i32) {
        raw_log.meta().term_tail_counters[index]
            .store(pack_tail(term_id, offset), Ordering::Release);
    }

    fn commit_frame(raw_log: &MappedRawLog, index: usize, offset: usize, length: i32) {
        let frame = unsafe { raw_log.term(index).add(offset) };
        frame::frame_length_ordered(frame, length);
    }

    #[test]
    fn no_action_on_committed_frame() {
        let (_dir, raw_log) = new_log();
        set_tail(&raw_log, 0, 0, 256);
        commit_frame(&raw_log, 0, 0, 256);
        assert!(!unblock(&raw_log, 0));
    }

    #[test]
    fn pads_over_uncommitted_claim() {
        let (_dir, raw_log) = new_log();
        set_tail(&raw_log, 0, 0, 2048 + 1024);
        // Claimed but never committed: negative length.
        commit_frame(&raw_log, 0, 2048, -1024);

        assert!(unblock(&raw_log, 2048));
        let frame = unsafe { raw_log.term(0).add(2048) };
        assert_eq!(frame::frame_length_volatile(frame), 1024);
        assert_eq!(frame_type(frame), HDR_TYPE_PAD);
    }

    #[test]
    fn pads_gap_before_committed_frame() {
        let (_dir, raw_log) = new_log();
        // Gap of 128 bytes at offset 0, a committed frame at 128.
        set_tail(&raw_log, 0, 0, 256);
        commit_frame(&raw_log, 0, 128, 128);

        assert!(unblock(&raw_log, 0));
        let frame = raw_log.term(0);
        assert_eq!(frame::frame_length_volatile(frame), 128);
        assert_eq!(frame_type(frame), HDR_TYPE_PAD);
    }

    #[test]
    fn pads_only_to_first_committed_frame() {
        let (_dir, raw_log) = new_log();
        set_tail(&raw_log, 0, 0, 256);
        commit_frame(&raw_log, 0, 128, 128);
        commit_frame(&raw_log, 0, 64, 64);

        // Offset 0 still zero and the nearest committed frame is at 64, so
        // only the first 64 bytes are padded.
        assert!(unblock(&raw_log, 0));
        let frame = raw_log.term(0);
        assert_eq!(frame::frame_length_volatile(frame), 64);
    }

    #[test]
    fn unblocks_to_end_of_term_and_rotates() {
        let (_dir, raw_log) = new_log();
        let term_length = raw_log.term_length();
        let offset = term_length - 3 * DATA_HEADER_LENGTH;
        // Tail pushed to the end of term 0, nothing committed after offset.
        set_tail(&raw_log, 0, 0, term_length as i32);

        assert!(unblock(&raw_log, offset as i64));

        let frame = unsafe { raw_log.term(0).add(offset) };
        assert_eq!(
            frame::frame_length_volatile(frame),
            (term_length - offset) as i32
        );
        assert_eq!(frame_type(frame), HDR_TYPE_PAD);

        let meta = raw_log.meta();
        assert_eq!(meta.active_term_count.load(Ordering::Acquire), 1);
        assert_eq!(
            meta.term_tail_counters[1].load(Ordering::Acquire),
            pack_tail(1, 0)
        );
    }

    #[test]
    fn no_action_when_nothing_committed_and_tail_not_at_end() {
        let (_dir, raw_log) = new_log();
        set_tail(&raw_log, 0, 0, 512);
        // Whole region zero, tail mid-term: publisher may still be writing.
        assert!(!unblock(&raw_log, 0));
    }
}
