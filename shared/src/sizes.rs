pub const KB: usize = 1024;
pub const MB: usize = KB * KB;
pub const GB: usize = MB * KB;

/// Size of one sector on every block device we drive.
pub const SECTOR_SIZE: u32 = 512;

/// Default size of the swap partition, in sectors.
pub const SWAP_SECTORS: u32 = 8192;
pub const SWAP_SIZE: u32 = SECTOR_SIZE * SWAP_SECTORS;

/// Number of user frames handed to the frame table when no size is configured.
pub const DEFAULT_USER_FRAMES: usize = 256;
