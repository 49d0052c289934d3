use super::VirtualMemory;
use crate::paging::PageFaultErrorCode;
use crate::threading::Tid;
use alloc::vec::Vec;
use vmkernel_shared::mem::{
    is_user_vaddr, pg_ofs, pg_round_down, PAGE_FRAME_SIZE, STACK_SLACK, USER_STACK_TOP,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultResolution {
    /// The page is mapped now; the faulting access should be retried.
    Resolved,
    /// The process was killed with exit status -1.
    Terminated,
}

impl VirtualMemory {
    /// Resolves a page fault at `fault_addr` raised by `tid` with its stack
    /// pointer at `esp`.
    ///
    /// A fault on a not-present user page is served from the page's entry, or
    /// by growing the stack if the address is plausibly a push. Protection
    /// faults and everything else kill the process.
    pub fn handle_page_fault(
        &self,
        tid: Tid,
        fault_addr: usize,
        code: PageFaultErrorCode,
        esp: usize,
    ) -> FaultResolution {
        log::trace!(
            "page fault: tid {} addr {:#x} {} {} esp {:#x}",
            tid,
            fault_addr,
            if code.not_present() { "not-present" } else { "protection" },
            if code.write() { "write" } else { "read" },
            esp
        );

        let resolved = code.not_present()
            && is_user_vaddr(fault_addr)
            && (self.load_page(tid, fault_addr) || self.grow_stack(tid, fault_addr, esp));
        if resolved {
            return FaultResolution::Resolved;
        }
        self.terminate(tid);
        FaultResolution::Terminated
    }

    /// Whether an access to `addr` with the stack pointer at `esp` should
    /// extend the stack.
    pub fn is_stack_access(&self, addr: usize, esp: usize) -> bool {
        let limit = USER_STACK_TOP - self.config.max_stack_size;
        (limit..USER_STACK_TOP).contains(&addr) && addr + STACK_SLACK >= esp
    }

    /// Extends the stack of `tid` down to the page containing `addr`.
    ///
    /// Every untracked page between `addr` and the current stack bottom is
    /// allocated. If any allocation fails the pages created here are released
    /// again and `false` is returned.
    #[must_use]
    pub fn grow_stack(&self, tid: Tid, addr: usize, esp: usize) -> bool {
        if !self.is_stack_access(addr, esp) {
            return false;
        }
        let Some(pcb) = self.processes.get(tid) else {
            return false;
        };

        let _extend = self.extend_lock.lock();
        let target = pg_round_down(addr);
        // A tracked page that could not be loaded is not a stack access.
        if pcb.pages.lock().get_page_entry(target).is_some() {
            return false;
        }
        let bottom = pcb.stack_bottom();
        let end = if target < bottom {
            bottom
        } else {
            target + PAGE_FRAME_SIZE
        };

        let mut created = Vec::new();
        for upage in (target..end).step_by(PAGE_FRAME_SIZE) {
            if pcb.pages.lock().get_page_entry(upage).is_some() {
                continue;
            }
            let ok = self.allocate_page(tid, upage).is_ok() && self.install_page(tid, upage, true);
            if !ok {
                log::warn!("tid {}: stack growth to {:#x} failed", tid, target);
                for upage in created {
                    if let Err(err) = self.free_page(tid, upage) {
                        log::warn!("tid {}: rollback of stack page {:#x}: {}", tid, upage, err);
                    }
                }
                return false;
            }
            created.push(upage);
        }

        pcb.set_stack_bottom(target);
        log::debug!(
            "tid {}: stack grown by {} pages to {:#x}",
            tid,
            created.len(),
            target
        );
        true
    }

    /// Gives `tid` its first, zeroed stack page just below `USER_STACK_TOP`.
    #[must_use]
    pub fn setup_stack(&self, tid: Tid) -> bool {
        let upage = USER_STACK_TOP - PAGE_FRAME_SIZE;
        if self.allocate_page(tid, upage).is_err() || !self.install_page(tid, upage, true) {
            return false;
        }
        if let Some(pcb) = self.processes.get(tid) {
            pcb.set_stack_bottom(upage);
        }
        true
    }

    /// Copies `buf.len()` bytes out of the user memory of `tid` at `uaddr`,
    /// faulting pages in as the CPU would.
    ///
    /// Returns `false` if the process was killed along the way.
    #[must_use]
    pub fn user_read(&self, tid: Tid, uaddr: usize, buf: &mut [u8], esp: usize) -> bool {
        let mut done = 0;
        while done < buf.len() {
            let addr = uaddr + done;
            let chunk = (PAGE_FRAME_SIZE - pg_ofs(addr)).min(buf.len() - done);
            let dst = &mut buf[done..done + chunk];
            let ok = self.user_access(tid, addr, false, esp, &mut |page: &mut [u8]| {
                dst.copy_from_slice(&page[pg_ofs(addr)..pg_ofs(addr) + chunk]);
            });
            if !ok {
                return false;
            }
            done += chunk;
        }
        true
    }

    /// Copies `data` into the user memory of `tid` at `uaddr`, faulting pages
    /// in as the CPU would.
    ///
    /// Returns `false` if the process was killed along the way.
    #[must_use]
    pub fn user_write(&self, tid: Tid, uaddr: usize, data: &[u8], esp: usize) -> bool {
        let mut done = 0;
        while done < data.len() {
            let addr = uaddr + done;
            let chunk = (PAGE_FRAME_SIZE - pg_ofs(addr)).min(data.len() - done);
            let src = &data[done..done + chunk];
            let ok = self.user_access(tid, addr, true, esp, &mut |page: &mut [u8]| {
                page[pg_ofs(addr)..pg_ofs(addr) + chunk].copy_from_slice(src);
            });
            if !ok {
                return false;
            }
            done += chunk;
        }
        true
    }

    /// One access within a single page, retried after every resolved fault.
    fn user_access(
        &self,
        tid: Tid,
        addr: usize,
        write: bool,
        esp: usize,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> bool {
        loop {
            let Some(pcb) = self.processes.get(tid) else {
                return false;
            };
            if !is_user_vaddr(addr) {
                self.terminate(tid);
                return false;
            }

            let access = pcb.pagedir().access(pg_round_down(addr), write, &mut |frame| {
                self.frames.with_page(frame, |page| f(&mut page.0[..]));
            });
            let Err(code) = access else {
                return true;
            };
            if self.handle_page_fault(tid, addr, code, esp) == FaultResolution::Terminated {
                return false;
            }
        }
    }
}
