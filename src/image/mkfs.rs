use anyhow::{bail, Context};
use std::{
    io::{BufWriter, Seek, SeekFrom, Write},
    path::Path,
};
use tracing::info;

use super::{
    types::{AllocationTable, Directory, Superblock},
    MIN_BLOCK_SIZE,
};
use crate::vdisk::VDisk;

/// Formats a new, empty image of at most `image_size` bytes at `path`.
pub fn make<P>(path: P, image_size: u64, blk_size: u32) -> anyhow::Result<Superblock>
where
    P: AsRef<Path>,
{
    if !blk_size.is_power_of_two() || blk_size < MIN_BLOCK_SIZE {
        bail!("block size must be a power of two of at least {MIN_BLOCK_SIZE} bytes");
    }

    let block_count = u32::try_from(image_size / blk_size as u64)
        .context("image size needs more than u32::MAX blocks")?;
    let uid = nix::unistd::geteuid().as_raw();
    let gid = nix::unistd::getegid().as_raw();
    let mut sb = Superblock::new(blk_size, block_count, uid, gid);
    if sb.data_start >= block_count {
        bail!("image size too small: {image_size} bytes leaves no data blocks");
    }

    let vdisk = VDisk::create(path.as_ref(), sb.image_size())
        .with_context(|| format!("cannot create {}", path.as_ref().display()))?;
    let mut buf = BufWriter::new(&*vdisk);

    sb.serialize_into(&mut buf)?;

    buf.seek(SeekFrom::Start(sb.block_offset(sb.table_start())))?;
    buf.write_all(AllocationTable::new(&sb).as_bytes())?;

    buf.seek(SeekFrom::Start(sb.block_offset(sb.directory_start())))?;
    Directory::default().serialize_into(&mut buf)?;

    buf.flush()?;
    drop(buf);
    vdisk.sync_all()?;

    info!(
        path = %path.as_ref().display(),
        block_size = blk_size,
        blocks = block_count,
        data_blocks = sb.data_blocks(),
        "formatted image"
    );

    Ok(sb)
}
