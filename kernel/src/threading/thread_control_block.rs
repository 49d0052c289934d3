use super::process::Tid;
use crate::mem::supplemental::SupplementalPageTable;
use crate::paging::{PageDirectory, SoftPageDirectory};
use crate::sync::mutex::Mutex;
use alloc::boxed::Box;
use core::sync::atomic::{AtomicUsize, Ordering};
use vmkernel_shared::mem::USER_STACK_TOP;

/// Per-process state the virtual memory code needs.
///
/// Processes are single threaded, so a tid names both the thread and its
/// address space.
pub struct ProcessControlBlock {
    pub tid: Tid,
    pagedir: Box<dyn PageDirectory>,
    pub(crate) pages: Mutex<SupplementalPageTable>,
    /// Lowest user page currently belonging to the stack.
    stack_bottom: AtomicUsize,
    exit_code: Mutex<Option<i32>>,
}

impl ProcessControlBlock {
    pub fn new(tid: Tid) -> Self {
        Self::with_page_directory(tid, Box::new(SoftPageDirectory::new()))
    }

    pub fn with_page_directory(tid: Tid, pagedir: Box<dyn PageDirectory>) -> Self {
        Self {
            tid,
            pagedir,
            pages: Mutex::new(SupplementalPageTable::new()),
            stack_bottom: AtomicUsize::new(USER_STACK_TOP),
            exit_code: Mutex::new(None),
        }
    }

    pub fn pagedir(&self) -> &dyn PageDirectory {
        &*self.pagedir
    }

    pub fn stack_bottom(&self) -> usize {
        self.stack_bottom.load(Ordering::Acquire)
    }

    pub(crate) fn set_stack_bottom(&self, upage: usize) {
        self.stack_bottom.fetch_min(upage, Ordering::AcqRel);
    }

    /// Number of pages tracked for this process, resident or not.
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    pub(crate) fn set_exit_code(&self, status: i32) {
        self.exit_code.lock().get_or_insert(status);
    }
}
