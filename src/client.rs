use std::{
    fmt,
    path::{Path, PathBuf},
};

use byte_unit::{Byte, UnitType};
use tracing::debug;

use crate::error::FsResult;

/// Opaque identifier of a file opened within one mount session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub u32);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub size: u64,
    pub first_block: Option<u32>,
}

/// Geometry and occupancy of a mounted image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsInfo {
    pub block_size: u32,
    pub total_blocks: u32,
    pub table_blocks: u32,
    pub directory_blocks: u32,
    pub data_start: u32,
    pub data_blocks: u32,
    pub free_data_blocks: u32,
    pub files: usize,
    pub max_files: usize,
    pub mount_count: u64,
}

impl fmt::Display for FsInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let image_size = self.block_size as u64 * self.total_blocks as u64;
        writeln!(f, "FS Info:")?;
        writeln!(
            f,
            "image_size={}",
            Byte::from_u64(image_size).get_appropriate_unit(UnitType::Binary)
        )?;
        writeln!(f, "block_size={}", self.block_size)?;
        writeln!(f, "total_blk_count={}", self.total_blocks)?;
        writeln!(f, "table_blk_count={}", self.table_blocks)?;
        writeln!(f, "rdir_blk_count={}", self.directory_blocks)?;
        writeln!(f, "data_blk={}", self.data_start)?;
        writeln!(f, "data_blk_count={}", self.data_blocks)?;
        writeln!(
            f,
            "table_free_ratio={}/{}",
            self.free_data_blocks, self.data_blocks
        )?;
        writeln!(
            f,
            "rdir_free_ratio={}/{}",
            self.max_files.saturating_sub(self.files),
            self.max_files
        )?;
        writeln!(f, "mount_count={}", self.mount_count)
    }
}

/// Calls offered by a filesystem service. One client holds at most one
/// mounted image at a time.
pub trait FsClient {
    fn mount(&mut self, disk: &Path) -> FsResult<()>;
    fn unmount(&mut self) -> FsResult<()>;
    fn open(&mut self, name: &str) -> FsResult<Handle>;
    fn close(&mut self, handle: Handle) -> FsResult<()>;
    /// Size in bytes of the file behind `handle`. Zero means empty.
    fn stat(&mut self, handle: Handle) -> FsResult<u64>;
    /// Reads from the handle's offset into `buf`, returning the bytes read.
    fn read(&mut self, handle: Handle, buf: &mut [u8]) -> FsResult<usize>;
    /// Writes `buf` at the handle's offset, returning the bytes written. A
    /// short count means the image ran out of space.
    fn write(&mut self, handle: Handle, buf: &[u8]) -> FsResult<usize>;
    fn create(&mut self, name: &str) -> FsResult<()>;
    fn delete(&mut self, name: &str) -> FsResult<()>;
    fn list(&mut self) -> FsResult<Vec<DirEntry>>;
    fn info(&mut self) -> FsResult<FsInfo>;
}

/// Hands out a fresh client for every session.
pub trait Connector: Sync {
    fn connect(&self) -> Box<dyn FsClient + Send>;
}

impl<F> Connector for F
where
    F: Fn() -> Box<dyn FsClient + Send> + Sync,
{
    fn connect(&self) -> Box<dyn FsClient + Send> {
        self()
    }
}

/// A mounted image. Dropping the guard unmounts it if [`MountGuard::unmount`]
/// was never reached.
pub struct MountGuard<'c, C: FsClient + ?Sized> {
    client: &'c mut C,
    disk: PathBuf,
    mounted: bool,
}

impl<'c, C: FsClient + ?Sized> MountGuard<'c, C> {
    pub fn mount(client: &'c mut C, disk: &Path) -> FsResult<Self> {
        client.mount(disk)?;
        debug!(disk = %disk.display(), "session started");
        Ok(Self {
            client,
            disk: disk.to_path_buf(),
            mounted: true,
        })
    }

    pub fn disk(&self) -> &Path {
        &self.disk
    }

    /// Opens `name`. The returned handle borrows the session, so the session
    /// cannot be torn down while it is alive.
    pub fn open(&mut self, name: &str) -> FsResult<OpenFile<'_, C>> {
        let handle = self.client.open(name)?;
        debug!(name, %handle, "opened");
        Ok(OpenFile {
            client: &mut *self.client,
            handle,
            name: name.to_owned(),
            open: true,
        })
    }

    pub fn create(&mut self, name: &str) -> FsResult<()> {
        self.client.create(name)
    }

    pub fn delete(&mut self, name: &str) -> FsResult<()> {
        self.client.delete(name)
    }

    pub fn list(&mut self) -> FsResult<Vec<DirEntry>> {
        self.client.list()
    }

    pub fn info(&mut self) -> FsResult<FsInfo> {
        self.client.info()
    }

    /// Ends the session. A failed unmount is not retried on drop.
    pub fn unmount(mut self) -> FsResult<()> {
        self.mounted = false;
        self.client.unmount()?;
        debug!(disk = %self.disk.display(), "session ended");
        Ok(())
    }
}

impl<C: FsClient + ?Sized> Drop for MountGuard<'_, C> {
    fn drop(&mut self) {
        if !self.mounted {
            return;
        }
        debug!(disk = %self.disk.display(), "releasing mount on early exit");
        if let Err(e) = self.client.unmount() {
            debug!(disk = %self.disk.display(), "fallback unmount failed: {e}");
        }
    }
}

/// An open file within a [`MountGuard`] session. Dropping it closes the
/// handle if [`OpenFile::close`] was never reached.
pub struct OpenFile<'s, C: FsClient + ?Sized> {
    client: &'s mut C,
    handle: Handle,
    name: String,
    open: bool,
}

impl<C: FsClient + ?Sized> OpenFile<'_, C> {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn stat(&mut self) -> FsResult<u64> {
        self.client.stat(self.handle)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        self.client.read(self.handle, buf)
    }

    pub fn write(&mut self, buf: &[u8]) -> FsResult<usize> {
        self.client.write(self.handle, buf)
    }

    pub fn close(mut self) -> FsResult<()> {
        self.open = false;
        self.client.close(self.handle)
    }
}

impl<C: FsClient + ?Sized> Drop for OpenFile<'_, C> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        debug!(name = %self.name, handle = %self.handle, "closing handle on early exit");
        if let Err(e) = self.client.close(self.handle) {
            debug!(name = %self.name, "fallback close failed: {e}");
        }
    }
}
