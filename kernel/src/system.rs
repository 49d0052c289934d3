use crate::block::block_core::Block;
use crate::mem::page_fault::FaultResolution;
use crate::mem::{VirtualMemory, VmConfig};
use crate::paging::PageFaultErrorCode;
use crate::threading::Tid;
use alloc::boxed::Box;
use once_cell::race::OnceBox;

pub struct SystemState {
    pub vm: VirtualMemory,
}

static SYSTEM: OnceBox<SystemState> = OnceBox::new();

/// Brings up virtual memory with `swap` as the swap partition.
///
/// # Panics
///
/// Panics if called twice.
pub fn init_system(config: VmConfig, swap: Block) -> &'static SystemState {
    let state = Box::new(SystemState {
        vm: VirtualMemory::new(config, swap),
    });
    assert!(SYSTEM.set(state).is_ok(), "System initialized twice.");
    unwrap_system()
}

pub fn unwrap_system() -> &'static SystemState {
    SYSTEM.get().expect("System not initialized.")
}

/// Called from the page fault trap with the faulting address (CR2), the
/// error code pushed by the CPU and the user stack pointer.
pub fn page_fault_entry(tid: Tid, fault_addr: usize, error_code: u32, esp: usize) -> FaultResolution {
    let code = PageFaultErrorCode::new_with_raw_value(error_code);
    unwrap_system().vm.handle_page_fault(tid, fault_addr, code, esp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::swap_block;
    use vmkernel_shared::mem::{PAGE_FRAME_SIZE, USER_STACK_TOP};

    #[test]
    fn test_fault_entry_reaches_global_vm() {
        let config = VmConfig {
            frames: 4,
            ..VmConfig::default()
        };
        let system = init_system(config, swap_block(8));
        let tid = system.vm.create_process().tid;
        assert!(system.vm.setup_stack(tid));

        // Not-present write from user mode just below the stack.
        let addr = USER_STACK_TOP - PAGE_FRAME_SIZE - 4;
        assert_eq!(page_fault_entry(tid, addr, 0b110, addr), FaultResolution::Resolved);
        assert_eq!(system.vm.process(tid).map(|pcb| pcb.page_count()), Some(2));

        // Present write fault: protection violation.
        assert_eq!(page_fault_entry(tid, addr, 0b111, addr), FaultResolution::Terminated);
        assert!(system.vm.process(tid).is_none());
    }
}
