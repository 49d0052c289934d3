//! Locks used by the memory subsystem.
//!
//! The kernel protects short critical sections (frame list, clock hand, swap
//! bitmap, page directories) with spinning locks instead of disabling
//! interrupts, so every structure here is usable from any preemptible thread.

pub mod mutex;
