use crate::mem::frame_table::{FrameEntry, PageKey};

/// How many times the clock hand may go around before giving up.
pub const MAX_SWEEPS: usize = 3;

/// Access to the hardware accessed/dirty bits of the page behind a frame.
pub trait ReferenceBits {
    /// Returns `(accessed, dirty)` for the page and clears both.
    ///
    /// A page whose owner is gone reports `(false, false)`.
    fn test_and_clear(&mut self, key: &PageKey) -> (bool, bool);
}

pub trait PageReplacementPolicy {
    /// Picks a frame to evict, or `None` if nothing is eligible.
    ///
    /// Called with the core map locked. The policy may update per-frame state
    /// (for example `pending_write`) but must not pin or free frames itself.
    fn select_victim(
        &mut self,
        frames: &mut [FrameEntry],
        bits: &mut dyn ReferenceBits,
    ) -> Option<usize>;
}

/// Enhanced second-chance clock.
///
/// Every visited frame loses its accessed bit. A dirty bit is moved into the
/// frame's `pending_write` flag so the write-out is not forgotten once the
/// hardware bit is cleared. Pinned frames are never chosen.
///
/// - sweep 0 takes a free frame, a read-only frame, or one that is neither
///   accessed nor dirty
/// - sweep 1 drops the accessed requirement
/// - sweep 2 takes anything unpinned
#[derive(Debug, Default)]
pub struct SecondChance {
    hand: usize,
}

impl SecondChance {
    pub const fn new() -> Self {
        Self { hand: 0 }
    }

    pub fn hand(&self) -> usize {
        self.hand
    }
}

impl PageReplacementPolicy for SecondChance {
    fn select_victim(
        &mut self,
        frames: &mut [FrameEntry],
        bits: &mut dyn ReferenceBits,
    ) -> Option<usize> {
        let total = frames.len();
        if total == 0 {
            return None;
        }

        for sweep in 0..MAX_SWEEPS {
            for _ in 0..total {
                let idx = self.hand % total;
                self.hand = (idx + 1) % total;

                let entry = &mut frames[idx];
                if entry.state.pinned() {
                    continue;
                }
                let Some(owner) = entry.owner.filter(|_| entry.state.allocated()) else {
                    return Some(idx);
                };

                let (accessed, dirty) = bits.test_and_clear(&owner);
                let dirty = dirty || entry.state.pending_write();
                if dirty {
                    entry.state = entry.state.with_pending_write(true);
                }

                let eligible = match sweep {
                    0 => !entry.state.writable() || (!accessed && !dirty),
                    1 => !entry.state.writable() || !dirty,
                    _ => true,
                };
                if eligible {
                    return Some(idx);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::frame_table::CoreMapEntry;
    use alloc::collections::BTreeMap;
    use alloc::vec::Vec;
    use proptest::prelude::*;

    /// Reference bits kept in a plain map, counting every probe.
    #[derive(Default)]
    struct FakeBits {
        bits: BTreeMap<usize, (bool, bool)>,
        probes: usize,
    }

    impl ReferenceBits for FakeBits {
        fn test_and_clear(&mut self, key: &PageKey) -> (bool, bool) {
            self.probes += 1;
            self.bits.remove(&key.upage).unwrap_or((false, false))
        }
    }

    fn owned(idx: usize, writable: bool) -> FrameEntry {
        FrameEntry {
            state: CoreMapEntry::DEFAULT
                .with_allocated(true)
                .with_writable(writable),
            owner: Some(PageKey {
                tid: 1,
                upage: idx,
            }),
        }
    }

    #[test]
    fn test_untouched_frame_chosen_first() {
        let mut frames: Vec<_> = (0..3).map(|i| owned(i, true)).collect();
        let mut bits = FakeBits::default();
        bits.bits.insert(0, (true, false));
        bits.bits.insert(1, (true, false));

        let mut clock = SecondChance::new();
        assert_eq!(clock.select_victim(&mut frames, &mut bits), Some(2));
        assert_eq!(clock.hand(), 0);
    }

    #[test]
    fn test_accessed_frames_get_a_second_chance() {
        let mut frames: Vec<_> = (0..2).map(|i| owned(i, true)).collect();
        let mut bits = FakeBits::default();
        bits.bits.insert(0, (true, false));
        bits.bits.insert(1, (true, false));

        let mut clock = SecondChance::new();
        // Both accessed bits are cleared on the first sweep; frame 0 goes next.
        assert_eq!(clock.select_victim(&mut frames, &mut bits), Some(0));
        assert!(bits.bits.is_empty());
    }

    #[test]
    fn test_dirty_frame_deferred_to_second_sweep() {
        let mut frames: Vec<_> = (0..2).map(|i| owned(i, true)).collect();
        let mut bits = FakeBits::default();
        bits.bits.insert(0, (false, true));
        bits.bits.insert(1, (true, true));

        let mut clock = SecondChance::new();
        // Nothing is clean, so the third sweep takes the first frame.
        assert_eq!(clock.select_victim(&mut frames, &mut bits), Some(0));
        assert!(frames[0].state.pending_write());
        assert!(frames[1].state.pending_write());
    }

    #[test]
    fn test_read_only_frame_accepted_immediately() {
        let mut frames = alloc::vec![owned(0, true), owned(1, false)];
        let mut bits = FakeBits::default();
        bits.bits.insert(0, (true, false));
        bits.bits.insert(1, (true, false));

        let mut clock = SecondChance::new();
        assert_eq!(clock.select_victim(&mut frames, &mut bits), Some(1));
    }

    #[test]
    fn test_free_frame_preferred_over_owned() {
        let mut frames = alloc::vec![owned(0, true), FrameEntry::default()];
        let mut bits = FakeBits::default();
        bits.bits.insert(0, (true, true));

        let mut clock = SecondChance::new();
        assert_eq!(clock.select_victim(&mut frames, &mut bits), Some(1));
    }

    #[test]
    fn test_pinned_frames_never_chosen() {
        let mut frames: Vec<_> = (0..4)
            .map(|i| {
                let mut entry = owned(i, true);
                entry.state = entry.state.with_pinned(true);
                entry
            })
            .collect();
        let mut bits = FakeBits::default();

        let mut clock = SecondChance::new();
        assert_eq!(clock.select_victim(&mut frames, &mut bits), None);
        assert_eq!(bits.probes, 0);

        frames[2].state = frames[2].state.with_pinned(false);
        assert_eq!(clock.select_victim(&mut frames, &mut bits), Some(2));
    }

    proptest! {
        #[test]
        fn victim_is_unpinned_and_found_within_three_sweeps(
            layout in prop::collection::vec(
                (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()),
                1..32,
            ),
            hand in 0usize..64,
        ) {
            let mut frames = Vec::new();
            let mut bits = FakeBits::default();
            for (i, &(pinned, writable, accessed, dirty)) in layout.iter().enumerate() {
                let mut entry = owned(i, writable);
                entry.state = entry.state.with_pinned(pinned);
                frames.push(entry);
                bits.bits.insert(i, (accessed, dirty));
            }

            let mut clock = SecondChance { hand };
            let victim = clock.select_victim(&mut frames, &mut bits);

            prop_assert!(bits.probes <= MAX_SWEEPS * layout.len());
            let any_unpinned = layout.iter().any(|&(pinned, ..)| !pinned);
            match victim {
                Some(idx) => prop_assert!(!layout[idx].0),
                None => prop_assert!(!any_unpinned),
            }
        }
    }
}
