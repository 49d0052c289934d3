//! Swap space and the replacement policy that decides what goes there.

pub mod page_replacement;
pub mod swapping_utils;

pub use self::page_replacement::{PageReplacementPolicy, ReferenceBits, SecondChance};
pub use self::swapping_utils::{SwapSlotId, SwapSpace};
