//! SPI flash opcodes used when reprogramming a board.
//!
//! Only the subset of the JEDEC command set the provisioning sequence needs.

/// Read JEDEC ID (manufacturer + device ID)
pub const RDID: u8 = 0x9F;

/// Read Status Register 1
pub const RDSR: u8 = 0x05;

/// Write Enable - required before any write/erase operation
pub const WREN: u8 = 0x06;

/// Chip Erase (entire chip)
pub const CE_60: u8 = 0x60;

/// Page Program with 4-byte address
pub const PP_4B: u8 = 0x12;

/// Read Data with 4-byte address
pub const READ_4B: u8 = 0x13;

/// Write In Progress bit of status register 1
pub const SR1_WIP: u8 = 1 << 0;

/// Program granularity of the flash chip
pub const PAGE_SIZE: usize = 256;

/// Capacity of the flash chip fitted to supported boards (256 Mbit).
pub const FLASH_SIZE: usize = 32 * 1024 * 1024;

/// JEDEC ID answered by the flash chip fitted to supported boards
/// (manufacturer 0x01, device 0x0219).
pub const EXPECTED_JEDEC_ID: [u8; 3] = [0x01, 0x02, 0x19];
