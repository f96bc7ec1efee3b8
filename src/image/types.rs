use super::{MIN_BLOCK_SIZE, IMAGE_MAGIC};
use crate::error::{FsError, FsResult};
use anyhow::{anyhow, bail};
use bytemuck::PodCastError;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io::{Read, Write},
    ops::Range,
};
use tracing::debug;

pub const FREE: u32 = 0;
pub const END_OF_CHAIN: u32 = u32::MAX;
pub const RESERVED: u32 = u32::MAX - 1;

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u32,
    pub block_size: u32,
    pub block_count: u32,
    pub table_blocks: u32,
    pub directory_blocks: u32,
    pub data_start: u32,
    pub created_at: u64,
    pub modified_at: Option<u64>,
    pub last_mounted_at: Option<u64>,
    pub mount_count: u64,
    pub uid: u32,
    pub gid: u32,
    pub checksum: u32,
}

impl Superblock {
    pub fn new(block_size: u32, block_count: u32, uid: u32, gid: u32) -> Self {
        let table_blocks = super::table_blocks(block_size, block_count);
        let directory_blocks = super::directory_blocks(block_size);
        Self {
            magic: IMAGE_MAGIC,
            block_size,
            block_count,
            table_blocks,
            directory_blocks,
            data_start: 1 + table_blocks + directory_blocks,
            created_at: super::now(),
            modified_at: None,
            last_mounted_at: None,
            mount_count: 0,
            uid,
            gid,
            checksum: 0,
        }
    }

    pub fn update_last_mounted_at(&mut self) {
        self.last_mounted_at = Some(super::now());
        self.mount_count += 1;
    }

    pub fn update_modified_at(&mut self) {
        self.modified_at = Some(super::now());
    }

    #[inline]
    pub fn table_start(&self) -> u32 {
        1
    }

    #[inline]
    pub fn directory_start(&self) -> u32 {
        1 + self.table_blocks
    }

    #[inline]
    pub fn data_blocks(&self) -> u32 {
        self.block_count.saturating_sub(self.data_start)
    }

    #[inline]
    pub fn block_offset(&self, block: u32) -> u64 {
        block as u64 * self.block_size as u64
    }

    pub fn image_size(&self) -> u64 {
        self.block_offset(self.block_count)
    }

    /// Byte range of the allocation table entries within the image.
    pub fn table_range(&self) -> Range<usize> {
        let start = self.block_offset(self.table_start()) as usize;
        start..start + self.block_count as usize * 4
    }

    pub fn directory_range(&self) -> Range<usize> {
        let start = self.block_offset(self.directory_start()) as usize;
        start..start + self.directory_blocks as usize * self.block_size as usize
    }

    pub fn block_range(&self, block: u32) -> Range<usize> {
        let start = self.block_offset(block) as usize;
        start..start + self.block_size as usize
    }

    pub fn serialize(&mut self) -> anyhow::Result<Vec<u8>> {
        self.checksum()?;
        bincode::serialize(self).map_err(|e| e.into())
    }

    pub fn serialize_into<W>(&mut self, w: W) -> anyhow::Result<()>
    where
        W: Write,
    {
        self.checksum()?;
        bincode::serialize_into(w, self).map_err(|e| e.into())
    }

    pub fn deserialize_from<R>(r: R) -> anyhow::Result<Self>
    where
        R: Read,
    {
        let mut sb: Self = bincode::deserialize_from(r)?;
        if sb.magic != IMAGE_MAGIC {
            bail!("bad magic {:#x}", sb.magic);
        }
        if !sb.verify_checksum()? {
            bail!("Superblock checksum verification failed");
        }
        sb.verify_geometry()?;

        Ok(sb)
    }

    fn verify_geometry(&self) -> anyhow::Result<()> {
        if !self.block_size.is_power_of_two() || self.block_size < MIN_BLOCK_SIZE {
            bail!("invalid block size {}", self.block_size);
        }
        if self.table_blocks != super::table_blocks(self.block_size, self.block_count)
            || self.directory_blocks != super::directory_blocks(self.block_size)
            || self.data_start != 1 + self.table_blocks + self.directory_blocks
            || self.data_start >= self.block_count
        {
            bail!("inconsistent layout in superblock");
        }
        Ok(())
    }

    fn checksum(&mut self) -> bincode::Result<()> {
        self.checksum = 0;
        self.checksum = super::calculate_checksum(&self)?;
        Ok(())
    }

    fn verify_checksum(&mut self) -> bincode::Result<bool> {
        let checksum = self.checksum;
        self.checksum = 0;
        let ok = checksum == super::calculate_checksum(&self)?;
        self.checksum = checksum;

        Ok(ok)
    }
}

/// One `u32` per image block: [`FREE`], [`RESERVED`] for metadata,
/// [`END_OF_CHAIN`], or the next block of the same file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationTable {
    entries: Vec<u32>,
}

impl AllocationTable {
    pub fn new(sb: &Superblock) -> Self {
        let entries = (0..sb.block_count)
            .map(|block| if block < sb.data_start { RESERVED } else { FREE })
            .collect();
        Self { entries }
    }

    pub fn from_bytes(bytes: &[u8], data_start: u32) -> anyhow::Result<Self> {
        let entries = match bytemuck::try_cast_slice::<u8, u32>(bytes) {
            Ok(entries) => entries.to_vec(),
            Err(PodCastError::TargetAlignmentGreaterAndInputNotAligned) => bytes
                .chunks_exact(4)
                .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Err(e) => return Err(anyhow!("malformed allocation table: {e:?}")),
        };

        let table = Self { entries };
        table.verify(data_start)?;
        Ok(table)
    }

    fn verify(&self, data_start: u32) -> anyhow::Result<()> {
        let len = self.entries.len() as u32;
        for (block, &entry) in self.entries.iter().enumerate() {
            let metadata = (block as u32) < data_start;
            let ok = match entry {
                RESERVED => metadata,
                FREE | END_OF_CHAIN => !metadata,
                next => !metadata && next >= data_start && next < len,
            };
            if !ok {
                bail!("bad allocation entry {entry:#x} for block {block}");
            }
        }
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.entries)
    }

    pub fn free_blocks(&self) -> u32 {
        self.entries.iter().filter(|&&e| e == FREE).count() as u32
    }

    pub fn allocate(&mut self) -> Option<u32> {
        let block = self.entries.iter().position(|&e| e == FREE)?;
        self.entries[block] = END_OF_CHAIN;
        debug!(block, "allocated data block");
        Some(block as u32)
    }

    pub fn next(&self, block: u32) -> FsResult<Option<u32>> {
        match self.entries.get(block as usize) {
            Some(&END_OF_CHAIN) => Ok(None),
            Some(&FREE) | Some(&RESERVED) | None => Err(FsError::Corrupt(format!(
                "block {block} is not part of a chain"
            ))),
            Some(&next) => Ok(Some(next)),
        }
    }

    /// The `index`-th block of the chain starting at `first`, if the chain
    /// is that long.
    pub fn block_at(&self, first: Option<u32>, index: u64) -> FsResult<Option<u32>> {
        let mut current = first;
        for _ in 0..index {
            current = match current {
                Some(block) => self.next(block)?,
                None => return Ok(None),
            };
        }
        Ok(current)
    }

    /// Like [`AllocationTable::block_at`], but extends the chain when it is
    /// too short. `None` means the image is full.
    pub fn block_for_write(&mut self, first: &mut Option<u32>, index: u64) -> FsResult<Option<u32>> {
        let mut current = match *first {
            Some(block) => block,
            None => match self.allocate() {
                Some(block) => {
                    *first = Some(block);
                    block
                }
                None => return Ok(None),
            },
        };

        for _ in 0..index {
            current = match self.next(current)? {
                Some(next) => next,
                None => match self.allocate() {
                    Some(block) => {
                        self.entries[current as usize] = block;
                        block
                    }
                    None => return Ok(None),
                },
            };
        }

        Ok(Some(current))
    }

    /// Frees every block of the chain, returning how many were released.
    pub fn release_chain(&mut self, first: Option<u32>) -> FsResult<u32> {
        let mut released = 0;
        let mut current = first;
        while let Some(block) = current {
            if released as usize >= self.entries.len() {
                return Err(FsError::Corrupt(format!("cycle in chain at block {block}")));
            }
            current = self.next(block)?;
            self.entries[block as usize] = FREE;
            released += 1;
        }
        Ok(released)
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub size: u64,
    pub first_block: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Directory {
    pub entries: BTreeMap<String, FileEntry>,
    checksum: u32,
}

impl Directory {
    pub fn serialize_into<W>(&mut self, w: W) -> anyhow::Result<()>
    where
        W: Write,
    {
        self.checksum()?;
        bincode::serialize_into(w, self).map_err(|e| e.into())
    }

    pub fn deserialize_from<R>(r: R) -> anyhow::Result<Self>
    where
        R: Read,
    {
        let mut dir: Self = bincode::deserialize_from(r)?;
        if !dir.verify_checksum()? {
            return Err(anyhow!("Directory checksum verification failed"));
        }

        Ok(dir)
    }

    /// Every non-empty file must start on a data block that is in use.
    pub fn verify(&self, sb: &Superblock, table: &AllocationTable) -> anyhow::Result<()> {
        for (name, entry) in &self.entries {
            let Some(first) = entry.first_block else {
                if entry.size > 0 {
                    bail!("'{name}' has {} bytes but no data block", entry.size);
                }
                continue;
            };
            if first < sb.data_start || first >= sb.block_count {
                bail!("'{name}' starts at block {first}, outside the data region");
            }
            if table.next(first).is_err() {
                bail!("'{name}' starts at unallocated block {first}");
            }
        }
        Ok(())
    }

    pub fn serialized_size(&self) -> bincode::Result<u64> {
        bincode::serialized_size(self)
    }

    pub fn entry(&self, name: &str) -> FsResult<&FileEntry> {
        self.entries.get(name).ok_or(FsError::NotFound)
    }

    pub fn entry_mut(&mut self, name: &str) -> FsResult<&mut FileEntry> {
        self.entries.get_mut(name).ok_or(FsError::NotFound)
    }

    fn checksum(&mut self) -> bincode::Result<()> {
        self.checksum = 0;
        self.checksum = super::calculate_checksum(&self)?;
        Ok(())
    }

    fn verify_checksum(&mut self) -> bincode::Result<bool> {
        let checksum = self.checksum;
        self.checksum = 0;
        let ok = checksum == super::calculate_checksum(&self)?;
        self.checksum = checksum;

        Ok(ok)
    }
}
