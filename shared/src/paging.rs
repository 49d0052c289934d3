// https://wiki.osdev.org/Paging

// Frame numbers are bounded by the 20-bit field below, so the casts in this
// file cannot truncate for any frame table we build.
#![allow(clippy::cast_possible_truncation)]

use arbitrary_int::u20;
use bitbybit::bitfield;

/// Largest frame number a page table entry can refer to.
pub const MAX_FRAME_NUMBER: usize = (1 << 20) - 1;

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    pub present: bool,
    #[bit(1, rw)]
    pub read_write: bool,
    #[bit(2, rw)]
    pub user_supervisor: bool,
    #[bit(5, rw)]
    pub accessed: bool,
    #[bit(6, rw)]
    pub dirty: bool,
    #[bits(12..=31, rw)]
    pub page_frame_address: u20,
}

impl PageTableEntry {
    /// A present user mapping of frame number `frame`.
    pub fn user_mapping(frame: usize, writable: bool) -> Self {
        assert!(frame <= MAX_FRAME_NUMBER, "frame {frame} does not fit in a PTE");
        Self::DEFAULT
            .with_present(true)
            .with_read_write(writable)
            .with_user_supervisor(true)
            .with_page_frame_address(u20::new(frame as u32))
    }

    pub fn frame_number(&self) -> usize {
        self.page_frame_address().value() as usize
    }
}
