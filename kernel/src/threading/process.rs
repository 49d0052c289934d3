use super::thread_control_block::ProcessControlBlock;
use crate::sync::mutex::Mutex;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU16, Ordering};

pub type Tid = u16;
pub type AtomicTid = AtomicU16;

/// Registry of live processes, used to get from a frame's owner back to its
/// address space.
///
/// The lock is only held for the map operation itself; callers work on the
/// returned `Arc`.
pub struct ProcessTable {
    content: Mutex<BTreeMap<Tid, Arc<ProcessControlBlock>>>,
    next_tid: AtomicTid,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            content: Mutex::new(BTreeMap::new()),
            next_tid: AtomicTid::new(1),
        }
    }

    pub fn allocate_tid(&self) -> Tid {
        let tid = self.next_tid.fetch_add(1, Ordering::SeqCst);
        if tid == 0 {
            panic!("TID overflow");
        }
        tid
    }

    pub fn add(&self, pcb: ProcessControlBlock) -> Arc<ProcessControlBlock> {
        let pcb = Arc::new(pcb);
        let mut content = self.content.lock();
        assert!(
            !content.contains_key(&pcb.tid),
            "PCB with tid {} already added to process table.",
            pcb.tid
        );
        content.insert(pcb.tid, pcb.clone());
        pcb
    }

    pub fn remove(&self, tid: Tid) -> Option<Arc<ProcessControlBlock>> {
        self.content.lock().remove(&tid)
    }

    pub fn get(&self, tid: Tid) -> Option<Arc<ProcessControlBlock>> {
        self.content.lock().get(&tid).cloned()
    }

    pub fn len(&self) -> usize {
        self.content.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tids(&self) -> alloc::vec::Vec<Tid> {
        self.content.lock().keys().copied().collect()
    }
}
