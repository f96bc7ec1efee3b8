use super::{
    is_valid_name,
    types::{AllocationTable, Directory, FileEntry, Superblock},
    MAX_FILES, MAX_OPEN_FILES,
};
use crate::{
    client::{DirEntry, FsClient, FsInfo, Handle},
    error::{FsError, FsResult},
    vdisk::VDisk,
};
use memmap::MmapMut;
use std::{
    io::Cursor,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

fn corrupt(e: anyhow::Error) -> FsError {
    FsError::Corrupt(format!("{e:#}"))
}

#[derive(Debug, Clone)]
struct OpenState {
    name: String,
    offset: u64,
}

/// Everything a live session owns. Metadata is edited in memory and written
/// back on unmount; file data goes straight into the mapping.
struct Mounted {
    vdisk: VDisk,
    mmap: MmapMut,
    sb: Superblock,
    table: AllocationTable,
    dir: Directory,
    handles: Vec<Option<OpenState>>,
}

impl Mounted {
    fn load(disk: &Path) -> FsResult<Self> {
        let vdisk = VDisk::open(disk)?;
        if vdisk.size < super::MIN_BLOCK_SIZE as u64 {
            return Err(FsError::Corrupt(format!("image is only {} bytes", vdisk.size)));
        }

        let mmap = unsafe { MmapMut::map_mut(&*vdisk)? };
        let mut sb = Superblock::deserialize_from(Cursor::new(&mmap[..])).map_err(corrupt)?;
        if (mmap.len() as u64) < sb.image_size() {
            return Err(FsError::Corrupt(format!(
                "image is {} bytes, superblock expects {}",
                mmap.len(),
                sb.image_size()
            )));
        }

        let table =
            AllocationTable::from_bytes(&mmap[sb.table_range()], sb.data_start).map_err(corrupt)?;
        let dir = Directory::deserialize_from(&mmap[sb.directory_range()]).map_err(corrupt)?;
        dir.verify(&sb, &table).map_err(corrupt)?;
        sb.update_last_mounted_at();

        Ok(Self {
            vdisk,
            mmap,
            sb,
            table,
            dir,
            handles: vec![None; MAX_OPEN_FILES],
        })
    }

    fn open_handles(&self) -> usize {
        self.handles.iter().flatten().count()
    }

    fn state(&self, handle: Handle) -> FsResult<&OpenState> {
        self.handles
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(FsError::BadHandle(handle))
    }

    fn state_mut(&mut self, handle: Handle) -> FsResult<&mut OpenState> {
        self.handles
            .get_mut(handle.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(FsError::BadHandle(handle))
    }

    /// Writes table, directory and superblock back and flushes the mapping.
    fn sync(&mut self) -> FsResult<()> {
        let table = self.table.as_bytes();
        self.mmap[self.sb.table_range()].copy_from_slice(table);

        let mut cursor = Cursor::new(&mut self.mmap[self.sb.directory_range()]);
        self.dir.serialize_into(&mut cursor).map_err(corrupt)?;

        self.sb.update_modified_at();
        let block = self.sb.block_range(0);
        let mut cursor = Cursor::new(&mut self.mmap[block]);
        self.sb.serialize_into(&mut cursor).map_err(corrupt)?;

        self.mmap.flush()?;
        debug!(disk = %self.vdisk.path().display(), "metadata synced");
        Ok(())
    }
}

/// [`FsClient`] over an image formatted by [`super::mkfs::make`].
///
/// Each instance mounts at most one image. Sessions on the same image are
/// serialized by the image lock taken in [`VDisk::open`], so concurrent
/// clients see each other's changes in mount order.
#[derive(Default)]
pub struct ImageFs {
    mounted: Option<Mounted>,
}

impl ImageFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disk(&self) -> Option<PathBuf> {
        self.mounted
            .as_ref()
            .map(|m| m.vdisk.path().to_path_buf())
    }

    fn session(&self) -> FsResult<&Mounted> {
        self.mounted.as_ref().ok_or(FsError::NotMounted)
    }

    fn session_mut(&mut self) -> FsResult<&mut Mounted> {
        self.mounted.as_mut().ok_or(FsError::NotMounted)
    }
}

impl FsClient for ImageFs {
    fn mount(&mut self, disk: &Path) -> FsResult<()> {
        if self.mounted.is_some() {
            return Err(FsError::AlreadyMounted);
        }

        let mounted = Mounted::load(disk)?;
        info!(
            disk = %disk.display(),
            files = mounted.dir.entries.len(),
            mount_count = mounted.sb.mount_count,
            "mounted"
        );
        self.mounted = Some(mounted);
        Ok(())
    }

    fn unmount(&mut self) -> FsResult<()> {
        let open = self.session()?.open_handles();
        if open > 0 {
            return Err(FsError::HandlesOpen(open));
        }

        if let Some(mut mounted) = self.mounted.take() {
            mounted.sync()?;
            info!(disk = %mounted.vdisk.path().display(), "unmounted");
        }
        Ok(())
    }

    fn open(&mut self, name: &str) -> FsResult<Handle> {
        let session = self.session_mut()?;
        session.dir.entry(name)?;

        let slot = session
            .handles
            .iter()
            .position(Option::is_none)
            .ok_or(FsError::TooManyOpenFiles)?;
        session.handles[slot] = Some(OpenState {
            name: name.to_owned(),
            offset: 0,
        });

        Ok(Handle(slot as u32))
    }

    fn close(&mut self, handle: Handle) -> FsResult<()> {
        let session = self.session_mut()?;
        session.state(handle)?;
        session.handles[handle.0 as usize] = None;
        Ok(())
    }

    fn stat(&mut self, handle: Handle) -> FsResult<u64> {
        let session = self.session()?;
        let state = session.state(handle)?;
        Ok(session.dir.entry(&state.name)?.size)
    }

    fn read(&mut self, handle: Handle, buf: &mut [u8]) -> FsResult<usize> {
        let session = self.session_mut()?;
        let OpenState { name, offset } = session.state(handle)?.clone();
        let entry = session.dir.entry(&name)?;
        let block_size = session.sb.block_size as u64;

        let wanted = (buf.len() as u64).min(entry.size.saturating_sub(offset)) as usize;
        let mut done = 0;
        while done < wanted {
            let position = offset + done as u64;
            let block = session
                .table
                .block_at(entry.first_block, position / block_size)?
                .ok_or_else(|| FsError::Corrupt(format!("'{name}' is shorter than its size")))?;
            let within = (position % block_size) as usize;
            let len = (block_size as usize - within).min(wanted - done);

            let start = session.sb.block_range(block).start + within;
            buf[done..done + len].copy_from_slice(&session.mmap[start..start + len]);
            done += len;
        }

        session.state_mut(handle)?.offset += done as u64;
        debug!(name, offset, read = done, "read");
        Ok(done)
    }

    fn write(&mut self, handle: Handle, buf: &[u8]) -> FsResult<usize> {
        let session = self.session_mut()?;
        let OpenState { name, offset } = session.state(handle)?.clone();
        let block_size = session.sb.block_size as u64;
        let mut entry = session.dir.entry(&name)?.clone();

        let mut done = 0;
        while done < buf.len() {
            let position = offset + done as u64;
            let Some(block) = session
                .table
                .block_for_write(&mut entry.first_block, position / block_size)?
            else {
                warn!(name, written = done, requested = buf.len(), "image full");
                break;
            };
            let within = (position % block_size) as usize;
            let len = (block_size as usize - within).min(buf.len() - done);

            let start = session.sb.block_range(block).start + within;
            session.mmap[start..start + len].copy_from_slice(&buf[done..done + len]);
            done += len;
        }

        entry.size = entry.size.max(offset + done as u64);
        *session.dir.entry_mut(&name)? = entry;
        session.state_mut(handle)?.offset += done as u64;

        if done == 0 && !buf.is_empty() {
            return Err(FsError::NoSpace);
        }
        debug!(name, offset, written = done, "write");
        Ok(done)
    }

    fn create(&mut self, name: &str) -> FsResult<()> {
        let session = self.session_mut()?;
        if !is_valid_name(name) {
            return Err(FsError::InvalidName(name.to_owned()));
        }
        if session.dir.entries.contains_key(name) {
            return Err(FsError::Exists);
        }
        if session.dir.entries.len() >= MAX_FILES {
            return Err(FsError::DirectoryFull);
        }

        session
            .dir
            .entries
            .insert(name.to_owned(), FileEntry::default());

        let region = session.sb.directory_range().len() as u64;
        let needed = session
            .dir
            .serialized_size()
            .map_err(|e| corrupt(e.into()))?;
        if needed > region {
            session.dir.entries.remove(name);
            return Err(FsError::DirectoryFull);
        }

        debug!(name, "created");
        Ok(())
    }

    fn delete(&mut self, name: &str) -> FsResult<()> {
        let session = self.session_mut()?;
        let first_block = session.dir.entry(name)?.first_block;
        if session.handles.iter().flatten().any(|h| h.name == name) {
            return Err(FsError::Busy);
        }

        let released = session.table.release_chain(first_block)?;
        session.dir.entries.remove(name);
        debug!(name, released, "deleted");
        Ok(())
    }

    fn list(&mut self) -> FsResult<Vec<DirEntry>> {
        let session = self.session()?;
        Ok(session
            .dir
            .entries
            .iter()
            .map(|(name, entry)| DirEntry {
                name: name.clone(),
                size: entry.size,
                first_block: entry.first_block,
            })
            .collect())
    }

    fn info(&mut self) -> FsResult<FsInfo> {
        let session = self.session()?;
        let sb = &session.sb;
        Ok(FsInfo {
            block_size: sb.block_size,
            total_blocks: sb.block_count,
            table_blocks: sb.table_blocks,
            directory_blocks: sb.directory_blocks,
            data_start: sb.data_start,
            data_blocks: sb.data_blocks(),
            free_data_blocks: session.table.free_blocks(),
            files: session.dir.entries.len(),
            max_files: MAX_FILES,
            mount_count: sb.mount_count,
        })
    }
}

impl Drop for ImageFs {
    fn drop(&mut self) {
        if let Some(mut mounted) = self.mounted.take() {
            warn!(disk = %mounted.vdisk.path().display(), "dropped while mounted, syncing");
            if let Err(e) = mounted.sync() {
                warn!("sync on drop failed: {e}");
            }
        }
    }
}
