#![cfg_attr(target_os = "none", no_std)]

pub mod block;
pub mod drivers;
pub mod mem;
pub mod paging;
pub mod swapping;
pub mod sync;
pub mod system;
pub mod threading;

#[cfg(test)]
mod test_util;

extern crate alloc;
