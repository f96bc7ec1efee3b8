use std::{
    fs::{File, OpenOptions},
    io,
    ops::Deref,
    path::{Path, PathBuf},
};

use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

pub type VDiskResult<T> = io::Result<T>;

pub type VDiskSize = u64;

/// A disk image file held under an exclusive advisory lock. Every session on
/// the same image, in this process or another, waits for the lock.
pub struct VDisk {
    pub size: VDiskSize,
    path: PathBuf,
    disk: Flock<File>,
}

impl VDisk {
    /// Creates a new image of `size` zeroed bytes. Fails if `path` exists.
    pub fn create<P>(path: P, size: VDiskSize) -> VDiskResult<Self>
    where
        P: AsRef<Path>,
    {
        let disk = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;

        allocate(&disk, size)?;

        Self::lock(path.as_ref().to_path_buf(), disk)
    }

    /// Opens an existing image, blocking until no other session holds it.
    pub fn open<P>(path: P) -> VDiskResult<Self>
    where
        P: AsRef<Path>,
    {
        let disk = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;

        Self::lock(path.as_ref().to_path_buf(), disk)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(path: PathBuf, disk: File) -> VDiskResult<Self> {
        debug!(path = %path.display(), "waiting for image lock");
        let disk = Flock::lock(disk, FlockArg::LockExclusive)
            .map_err(|(_, errno)| io::Error::from(errno))?;
        let size = disk.metadata()?.len();
        debug!(path = %path.display(), size, "image locked");

        Ok(Self { size, path, disk })
    }
}

impl Deref for VDisk {
    type Target = File;

    fn deref(&self) -> &File {
        &self.disk
    }
}

#[cfg(target_os = "linux")]
fn allocate(disk: &File, size: VDiskSize) -> VDiskResult<()> {
    use nix::fcntl::{fallocate, FallocateFlags};
    use std::os::fd::AsRawFd;

    let len = i64::try_from(size).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    if let Err(errno) = fallocate(disk.as_raw_fd(), FallocateFlags::empty(), 0, len) {
        debug!("fallocate unavailable ({errno}), extending with set_len");
        disk.set_len(size)?;
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn allocate(disk: &File, size: VDiskSize) -> VDiskResult<()> {
    disk.set_len(size)
}
