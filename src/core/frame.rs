//! Fragment frame header over the shared term buffers.
//!
//! Every fragment starts with a 32-byte header whose first word is the frame
//! length. Writers claim a slot by storing the negated length, copy payload,
//! then commit with a release store of the positive length. A zero word means
//! the slot has never been claimed. Readers and the unblocker load the word
//! with acquire ordering.

use std::sync::atomic::{AtomicI32, Ordering};

pub const DATA_HEADER_LENGTH: usize = 32;
pub const FRAME_ALIGNMENT: usize = 32;

pub const FRAME_VERSION: u8 = 1;
pub const UNFRAGMENTED_FLAGS: u8 = 0xC0;

pub const HDR_TYPE_PAD: u16 = 0x00;
pub const HDR_TYPE_DATA: u16 = 0x01;

pub const LENGTH_OFFSET: usize = 0;
pub const VERSION_OFFSET: usize = 4;
pub const FLAGS_OFFSET: usize = 5;
pub const TYPE_OFFSET: usize = 6;
pub const TERM_OFFSET_OFFSET: usize = 8;
pub const SESSION_ID_OFFSET: usize = 12;
pub const STREAM_ID_OFFSET: usize = 16;
pub const TERM_ID_OFFSET: usize = 20;
pub const RESERVED_OFFSET: usize = 24;

pub fn frame_length_volatile(frame: *const u8) -> i32 {
    // SAFETY: the length word is at offset 0 and frames are 32-byte aligned.
    let atomic = unsafe { &*(frame as *const AtomicI32) };
    atomic.load(Ordering::Acquire)
}

pub fn frame_length_ordered(frame: *mut u8, length: i32) {
    // SAFETY: the length word is at offset 0 and frames are 32-byte aligned.
    let atomic = unsafe { &*(frame as *const AtomicI32) };
    atomic.store(length, Ordering::Release);
}

pub fn frame_type(frame: *const u8) -> u16 {
    let mut bytes = [0u8; 2];
    // SAFETY: caller hands a pointer to at least DATA_HEADER_LENGTH bytes.
    unsafe {
        std::ptr::copy_nonoverlapping(frame.add(TYPE_OFFSET), bytes.as_mut_ptr(), 2);
    }
    u16::from_le_bytes(bytes)
}

pub fn frame_term_id(frame: *const u8) -> i32 {
    let mut bytes = [0u8; 4];
    // SAFETY: caller hands a pointer to at least DATA_HEADER_LENGTH bytes.
    unsafe {
        std::ptr::copy_nonoverlapping(frame.add(TERM_ID_OFFSET), bytes.as_mut_ptr(), 4);
    }
    i32::from_le_bytes(bytes)
}

/// Seed the default header template for a log: the bytes every writer copies
/// before filling in per-frame fields.
pub fn fill_default_header(header: &mut [u8], session_id: i32, stream_id: i32, term_id: i32) {
    header[..DATA_HEADER_LENGTH].fill(0);
    header[VERSION_OFFSET] = FRAME_VERSION;
    header[FLAGS_OFFSET] = UNFRAGMENTED_FLAGS;
    header[TYPE_OFFSET..TYPE_OFFSET + 2].copy_from_slice(&HDR_TYPE_DATA.to_le_bytes());
    header[SESSION_ID_OFFSET..SESSION_ID_OFFSET + 4].copy_from_slice(&session_id.to_le_bytes());
    header[STREAM_ID_OFFSET..STREAM_ID_OFFSET + 4].copy_from_slice(&stream_id.to_le_bytes());
    header[TERM_ID_OFFSET..TERM_ID_OFFSET + 4].copy_from_slice(&term_id.to_le_bytes());
}

/// Overwrite the frame at `frame` with a padding header of `frame_length`
/// bytes. The length word is released last so a concurrent reader never sees
/// the padding length before the rest of the header.
pub fn write_padding_frame(
    frame: *mut u8,
    default_header: &[u8],
    term_offset: i32,
    term_id: i32,
    frame_length: i32,
) {
    // SAFETY: caller guarantees frame points at DATA_HEADER_LENGTH writable
    // bytes inside a term buffer.
    unsafe {
        std::ptr::copy_nonoverlapping(default_header.as_ptr(), frame, DATA_HEADER_LENGTH);
        std::ptr::copy_nonoverlapping(
            HDR_TYPE_PAD.to_le_bytes().as_ptr(),
            frame.add(TYPE_OFFSET),
            2,
        );
        std::ptr::copy_nonoverlapping(
            term_offset.to_le_bytes().as_ptr(),
            frame.add(TERM_OFFSET_OFFSET),
            4,
        );
        std::ptr::copy_nonoverlapping(term_id.to_le_bytes().as_ptr(), frame.add(TERM_ID_OFFSET), 4);
    }
    frame_length_ordered(frame, frame_length);
}
