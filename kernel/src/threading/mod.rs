pub mod process;
pub mod thread_control_block;

pub use self::process::{ProcessTable, Tid};
pub use self::thread_control_block::ProcessControlBlock;
