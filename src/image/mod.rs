//! Reference disk-image filesystem: a flat root directory over a chained
//! block allocation table, persisted in one image file.
//!
//! ```text
//! | superblock | allocation table | root directory | data blocks ... |
//!   block 0      table_blocks       directory_blocks
//! ```

pub mod fs;
pub mod mkfs;
pub mod types;

use std::time::{self, SystemTime};

pub use fs::ImageFs;

const IMAGE_MAGIC: u32 = 0x7465_7366;
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
pub const MIN_BLOCK_SIZE: u32 = 512;
/// 8 MiB
pub const DEFAULT_IMAGE_SIZE: u64 = 8 * 1024 * 1024;
pub const MAX_FILES: usize = 128;
pub const MAX_NAME_LEN: usize = 63;
pub const MAX_OPEN_FILES: usize = 32;
/// Serialized bytes reserved per directory entry: name length prefix and
/// bytes, size, first block.
const DIRECTORY_ENTRY_BUDGET: u64 = 8 + MAX_NAME_LEN as u64 + 8 + 5;

#[inline]
pub fn calculate_checksum<S>(s: &S) -> bincode::Result<u32>
where
    S: serde::Serialize,
{
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bincode::serialize(&s)?);
    Ok(hasher.finalize())
}

#[inline]
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Blocks reserved for the root directory at `block_size`.
pub fn directory_blocks(block_size: u32) -> u32 {
    // map length prefix + entries + checksum
    let bytes = 8 + MAX_FILES as u64 * DIRECTORY_ENTRY_BUDGET + 4;
    bytes.div_ceil(block_size as u64) as u32
}

/// Blocks needed by an allocation table covering `block_count` blocks.
pub fn table_blocks(block_size: u32, block_count: u32) -> u32 {
    (block_count as u64 * 4).div_ceil(block_size as u64) as u32
}

pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_NAME_LEN && !name.contains(['/', '\0'])
}
