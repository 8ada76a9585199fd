//! On-disk layout of a publication log.
//!
//! A log is one file: `PARTITION_COUNT` fixed-length term partitions followed
//! by a metadata block. Publishers reserve space by advancing the tail
//! counter of the active partition; the position of any byte in the stream is
//! `((term_id - initial_term_id) << log2(term_length)) + term_offset`.
//!
//! ```text
//! +-----------+-----------+-----------+----------+
//! |  term 0   |  term 1   |  term 2   | metadata |
//! +-----------+-----------+-----------+----------+
//! ```
//!
//! The layout is fixed for wire compatibility with external readers and
//! tooling that map the same file.

use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use crate::core::frame::{self, DATA_HEADER_LENGTH};
use crate::core::mmap::MmapFile;
use crate::core::{Error, Result};

pub const PARTITION_COUNT: usize = 3;

pub const TERM_MIN_LENGTH: usize = 64 * 1024;
pub const TERM_MAX_LENGTH: usize = 1024 * 1024 * 1024;

pub const PAGE_MIN_SIZE: usize = 4 * 1024;
pub const PAGE_MAX_SIZE: usize = 1024 * 1024 * 1024;

pub const MTU_MIN_LENGTH: usize = 32;

/// Metadata block length reserved at the tail of the log file.
pub const LOG_META_DATA_LENGTH: usize = 4096;

/// Log metadata shared between publisher, subscribers and the conductor.
///
/// Field groups are cache-line separated so the publisher-hot tail counters
/// never share a line with the low-frequency fields. Mutable fields are
/// atomics accessed through the mapping; the rest are written once before the
/// log is published to any other process.
#[repr(C, align(128))]
pub struct LogMeta {
    // Publisher-hot.
    pub term_tail_counters: [AtomicI64; PARTITION_COUNT],
    pub active_term_count: AtomicI32,
    pub _pad0: [u8; 100],

    // Reader-visible, rarely written.
    pub end_of_stream_position: AtomicI64,
    pub is_connected: AtomicI32,
    pub active_transport_count: AtomicI32,
    pub _pad1: [u8; 112],

    // Immutable after init.
    pub correlation_id: i64,
    pub initial_term_id: i32,
    pub mtu_length: i32,
    pub term_length: i32,
    pub page_size: i32,
    pub _pad2: [u8; 104],

    pub default_frame_header: [u8; DATA_HEADER_LENGTH],
}

/// Packed tail counter: `(term_id << 32) | term_offset`.
pub fn pack_tail(term_id: i32, term_offset: i32) -> i64 {
    ((term_id as i64) << 32) | (term_offset as u32 as i64)
}

pub fn term_id(raw_tail: i64) -> i32 {
    (raw_tail >> 32) as i32
}

/// Tail offset clamped to the term length: a reservation may push the raw
/// offset past the end of the partition.
pub fn term_offset(raw_tail: i64, term_length: i64) -> i32 {
    let tail = raw_tail & 0xFFFF_FFFF;
    tail.min(term_length) as i32
}

pub fn index_by_term_count(term_count: i32) -> usize {
    term_count.rem_euclid(PARTITION_COUNT as i32) as usize
}

pub fn index_by_position(position: i64, position_bits_to_shift: u32) -> usize {
    ((position >> position_bits_to_shift).rem_euclid(PARTITION_COUNT as i64)) as usize
}

pub fn compute_position(
    term_id: i32,
    term_offset: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    let term_count = (term_id as i64) - (initial_term_id as i64);
    (term_count << position_bits_to_shift) + term_offset as i64
}

pub fn compute_term_begin_position(
    term_id: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    let term_count = (term_id as i64) - (initial_term_id as i64);
    term_count << position_bits_to_shift
}

/// Total file length for a log with the given term length, rounded up to the
/// page size.
pub fn compute_log_length(term_length: usize, page_size: usize) -> u64 {
    let raw = (PARTITION_COUNT * term_length + LOG_META_DATA_LENGTH) as u64;
    let page = page_size as u64;
    (raw + (page - 1)) & !(page - 1)
}

pub fn check_term_length(term_length: usize) -> Result<()> {
    if !term_length.is_power_of_two() {
        return Err(Error::InvalidParams("term length not a power of 2"));
    }
    if !(TERM_MIN_LENGTH..=TERM_MAX_LENGTH).contains(&term_length) {
        return Err(Error::InvalidParams("term length out of range"));
    }
    Ok(())
}

pub fn check_page_size(page_size: usize) -> Result<()> {
    if !page_size.is_power_of_two() {
        return Err(Error::InvalidParams("page size not a power of 2"));
    }
    if !(PAGE_MIN_SIZE..=PAGE_MAX_SIZE).contains(&page_size) {
        return Err(Error::InvalidParams("page size out of range"));
    }
    Ok(())
}

pub fn check_mtu_length(mtu_length: usize, term_length: usize) -> Result<()> {
    if mtu_length < MTU_MIN_LENGTH {
        return Err(Error::InvalidParams("mtu length below minimum"));
    }
    if mtu_length % 8 != 0 {
        return Err(Error::InvalidParams("mtu length not 8-byte aligned"));
    }
    if mtu_length > term_length / 2 {
        return Err(Error::InvalidParams("mtu length exceeds half the term length"));
    }
    Ok(())
}

/// Starting point for a log created from an in-progress recording, so a
/// publication can resume mid-stream instead of at term zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayInit {
    pub term_id: i32,
    pub term_offset: i32,
}

/// Initialize metadata for a fresh log.
///
/// Without `replay` the active partition is index 0 at `initial_term_id`;
/// the other partitions get the tail of the term they will hold one rotation
/// cycle later. With `replay` the active partition is derived from the replay
/// term id and the walk forward assigns the remaining partitions, so the
/// tail counters are exactly what a publisher would have left behind at that
/// point in the stream.
#[allow(clippy::too_many_arguments)]
pub fn init_log_meta(
    meta: &mut LogMeta,
    initial_term_id: i32,
    term_length: usize,
    mtu_length: usize,
    page_size: usize,
    correlation_id: i64,
    session_id: i32,
    stream_id: i32,
    replay: Option<ReplayInit>,
) {
    match replay {
        Some(ReplayInit { term_id, term_offset }) => {
            let term_count = term_id - initial_term_id;
            let mut index = index_by_term_count(term_count);

            meta.term_tail_counters[index] = AtomicI64::new(pack_tail(term_id, term_offset));
            for i in 1..PARTITION_COUNT as i32 {
                let expected_term_id = (term_id + i) - PARTITION_COUNT as i32;
                index = (index + 1) % PARTITION_COUNT;
                meta.term_tail_counters[index] = AtomicI64::new(pack_tail(expected_term_id, 0));
            }

            meta.active_term_count = AtomicI32::new(term_count);
        }
        None => {
            meta.term_tail_counters[0] = AtomicI64::new(pack_tail(initial_term_id, 0));
            for i in 1..PARTITION_COUNT as i32 {
                let expected_term_id = (initial_term_id + i) - PARTITION_COUNT as i32;
                meta.term_tail_counters[i as usize] =
                    AtomicI64::new(pack_tail(expected_term_id, 0));
            }

            meta.active_term_count = AtomicI32::new(0);
        }
    }

    meta.correlation_id = correlation_id;
    meta.initial_term_id = initial_term_id;
    meta.mtu_length = mtu_length as i32;
    meta.term_length = term_length as i32;
    meta.page_size = page_size as i32;
    meta.is_connected = AtomicI32::new(0);
    meta.active_transport_count = AtomicI32::new(0);
    meta.end_of_stream_position = AtomicI64::new(i64::MAX);
    frame::fill_default_header(
        &mut meta.default_frame_header,
        session_id,
        stream_id,
        initial_term_id,
    );
}

/// Rotate the log forward one term: prime the tail of the next partition and
/// advance the active term count. Both steps are CAS so concurrent publishers
/// and the unblocker cannot double-rotate.
pub fn rotate_log(meta: &LogMeta, current_term_count: i32, current_term_id: i32) -> bool {
    let next_term_id = current_term_id + 1;
    let next_term_count = current_term_count + 1;
    let next_index = index_by_term_count(next_term_count);

    let expected_raw_tail = pack_tail(next_term_id - PARTITION_COUNT as i32, 0);
    let new_raw_tail = pack_tail(next_term_id, 0);
    let _ = meta.term_tail_counters[next_index].compare_exchange(
        expected_raw_tail,
        new_raw_tail,
        Ordering::AcqRel,
        Ordering::Acquire,
    );

    meta.active_term_count
        .compare_exchange(
            current_term_count,
            next_term_count,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok()
}

/// A publication log mapped into this process.
pub struct MappedRawLog {
    _mmap: MmapFile,
    base: *mut u8,
    term_length: usize,
}

// SAFETY: the mapping and base pointer are owned by this value; the conductor
// is the only thread that touches it and all cross-process fields are
// accessed through atomics.
unsafe impl Send for MappedRawLog {}

impl MappedRawLog {
    /// Create and map a fresh log file. The mapper's error is preserved.
    pub fn create(
        path: &Path,
        is_sparse: bool,
        term_length: usize,
        page_size: usize,
    ) -> Result<Self> {
        let length = compute_log_length(term_length, page_size) as usize;
        let mmap = if is_sparse {
            MmapFile::create_sparse(path, length)
        } else {
            MmapFile::create(path, length)
        }
        .map_err(Error::MapFailed)?;

        let base = mmap.as_slice().as_ptr() as *mut u8;
        Ok(Self {
            _mmap: mmap,
            base,
            term_length,
        })
    }

    pub fn term_length(&self) -> usize {
        self.term_length
    }

    /// Base of the term partition at `index`.
    pub fn term(&self, index: usize) -> *mut u8 {
        debug_assert!(index < PARTITION_COUNT);
        // SAFETY: partitions are laid out back to back from the mapping base.
        unsafe { self.base.add(index * self.term_length) }
    }

    pub fn meta(&self) -> &LogMeta {
        // SAFETY: the metadata block starts right after the partitions, is
        // 128-byte aligned (partitions are page multiples) and lives as long
        // as the mapping.
        unsafe { &*(self.base.add(PARTITION_COUNT * self.term_length) as *const LogMeta) }
    }

    /// Exclusive metadata access for initialization, before the log is
    /// visible to any other process.
    pub fn meta_mut(&mut self) -> &mut LogMeta {
        // SAFETY: as for meta(), plus &mut self guarantees exclusivity.
        unsafe { &mut *(self.base.add(PARTITION_COUNT * self.term_length) as *mut LogMeta) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};
    use tempfile::tempdir;

    #[test]
    fn meta_size_and_alignment() {
        assert_eq!(size_of::<LogMeta>(), 512);
        assert_eq!(align_of::<LogMeta>(), 128);
        assert!(size_of::<LogMeta>() <= LOG_META_DATA_LENGTH);
    }

    #[test]
    fn tail_packing_round_trip() {
        let raw = pack_tail(19, 4096);
        assert_eq!(term_id(raw), 19);
        assert_eq!(term_offset(raw, 64 * 1024), 4096);
    }

    #[test]
    fn tail_offset_clamped_to_term_length() {
        let raw = pack_tail(3, 70_000);
        assert_eq!(term_offset(raw, 64 * 1024), 64 * 1024);
    }

    #[test]
    fn position_arithmetic() {
        let bits = (64 * 1024u32).trailing_zeros();
        assert_eq!(compute_position(5, 0, bits, 5), 0);
        assert_eq!(compute_position(6, 128, bits, 5), 64 * 1024 + 128);
        assert_eq!(compute_term_begin_position(7, bits, 5), 2 * 64 * 1024);
        assert_eq!(index_by_position(64 * 1024 + 1, bits), 1);
    }

    #[test]
    fn log_length_is_page_aligned() {
        let length = compute_log_length(TERM_MIN_LENGTH, 4096);
        assert_eq!(length % 4096, 0);
        assert_eq!(length, (3 * TERM_MIN_LENGTH + LOG_META_DATA_LENGTH) as u64);
    }

    #[test]
    fn param_checks() {
        assert!(check_term_length(TERM_MIN_LENGTH).is_ok());
        assert!(check_term_length(TERM_MIN_LENGTH - 1).is_err());
        assert!(check_term_length(TERM_MIN_LENGTH / 2).is_err());
        assert!(check_page_size(4096).is_ok());
        assert!(check_page_size(5000).is_err());
        assert!(check_mtu_length(TERM_MIN_LENGTH / 2, TERM_MIN_LENGTH).is_ok());
        assert!(check_mtu_length(TERM_MIN_LENGTH / 2 + 8, TERM_MIN_LENGTH).is_err());
        assert!(check_mtu_length(12, TERM_MIN_LENGTH).is_err());
    }

    fn mapped_log(dir: &Path) -> MappedRawLog {
        MappedRawLog::create(&dir.join("test.logbuffer"), true, TERM_MIN_LENGTH, 4096)
            .expect("map raw log")
    }

    #[test]
    fn fresh_init_tail_counters() {
        let dir = tempdir().expect("tempdir");
        let mut raw_log = mapped_log(dir.path());
        init_log_meta(
            raw_log.meta_mut(),
            10,
            TERM_MIN_LENGTH,
            1408,
            4096,
            42,
            7,
            1001,
            None,
        );

        let meta = raw_log.meta();
        assert_eq!(meta.term_tail_counters[0].load(Ordering::Relaxed), pack_tail(10, 0));
        assert_eq!(meta.term_tail_counters[1].load(Ordering::Relaxed), pack_tail(8, 0));
        assert_eq!(meta.term_tail_counters[2].load(Ordering::Relaxed), pack_tail(9, 0));
        assert_eq!(meta.active_term_count.load(Ordering::Relaxed), 0);
        assert_eq!(meta.end_of_stream_position.load(Ordering::Relaxed), i64::MAX);
        assert_eq!(meta.initial_term_id, 10);
        assert_eq!(meta.correlation_id, 42);
    }

    #[test]
    fn replay_init_tail_counters() {
        let dir = tempdir().expect("tempdir");
        let mut raw_log = mapped_log(dir.path());
        init_log_meta(
            raw_log.meta_mut(),
            10,
            TERM_MIN_LENGTH,
            1408,
            4096,
            42,
            7,
            1001,
            Some(ReplayInit {
                term_id: 14,
                term_offset: 2048,
            }),
        );

        // term_count = 4, active index = 1.
        let meta = raw_log.meta();
        assert_eq!(meta.active_term_count.load(Ordering::Relaxed), 4);
        assert_eq!(
            meta.term_tail_counters[1].load(Ordering::Relaxed),
            pack_tail(14, 2048)
        );
        assert_eq!(meta.term_tail_counters[2].load(Ordering::Relaxed), pack_tail(12, 0));
        assert_eq!(meta.term_tail_counters[0].load(Ordering::Relaxed), pack_tail(13, 0));
    }

    #[test]
    fn rotation_primes_next_partition() {
        let dir = tempdir().expect("tempdir");
        let mut raw_log = mapped_log(dir.path());
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

        let meta = raw_log.meta();
        assert!(rotate_log(meta, 0, 0));
        assert_eq!(meta.active_term_count.load(Ordering::Relaxed), 1);
        assert_eq!(meta.term_tail_counters[1].load(Ordering::Relaxed), pack_tail(1, 0));

        // A second rotation attempt for the same term count fails.
        assert!(!rotate_log(meta, 0, 0));
    }
}
