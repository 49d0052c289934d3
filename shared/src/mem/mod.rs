use crate::sizes::{MB, SECTOR_SIZE};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4096;

/// Number of device sectors needed to hold one page.
pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / SECTOR_SIZE as usize;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

/// User stacks grow down from the kernel boundary.
pub const USER_STACK_TOP: usize = OFFSET;

/// Stack growth is refused below `USER_STACK_TOP - MAX_STACK_SIZE`.
pub const MAX_STACK_SIZE: usize = 8 * MB;

/// `pusha` touches memory up to 32 bytes below the stack pointer before it moves.
pub const STACK_SLACK: usize = 32;

#[inline]
pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn pg_round_up(addr: usize) -> usize {
    pg_round_down(addr + PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn pg_ofs(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rounding() {
        assert_eq!(pg_round_down(0x1234), 0x1000);
        assert_eq!(pg_round_down(0x1000), 0x1000);
        assert_eq!(pg_round_up(0x1001), 0x2000);
        assert_eq!(pg_round_up(0x2000), 0x2000);
        assert_eq!(pg_ofs(0x1234), 0x234);
    }

    #[test]
    fn test_user_boundary() {
        assert!(is_user_vaddr(OFFSET - 1));
        assert!(!is_user_vaddr(OFFSET));
        assert_eq!(SECTORS_PER_PAGE, 8);
    }
}
