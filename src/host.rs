use std::{
    fs::{self, File},
    io,
    ops::Deref,
    path::{Path, PathBuf},
};

use memmap::Mmap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("{}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("not a regular file: {}", path.display())]
    NotRegularFile { path: PathBuf },
    #[error("no file name in {}", path.display())]
    NoFileName { path: PathBuf },
}

/// Read-only view over the full contents of a regular file on the host.
#[derive(Debug)]
pub struct HostBuffer {
    path: PathBuf,
    map: Option<Mmap>,
}

impl HostBuffer {
    /// Maps `path` read-only. Anything that does not resolve to a regular
    /// file is rejected before it is opened.
    pub fn snapshot<P>(path: P) -> Result<Self, HostError>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| HostError::Io {
            path: path.clone(),
            source,
        };

        if !fs::metadata(&path).map_err(io_err)?.is_file() {
            return Err(HostError::NotRegularFile { path: path.clone() });
        }

        let file = File::open(&path).map_err(io_err)?;
        let metadata = file.metadata().map_err(io_err)?;
        if !metadata.is_file() {
            return Err(HostError::NotRegularFile { path: path.clone() });
        }

        // A zero-length file cannot be mapped.
        let map = match metadata.len() {
            0 => None,
            _ => Some(unsafe { Mmap::map(&file) }.map_err(io_err)?),
        };
        debug!(path = %path.display(), len = metadata.len(), "host file mapped");

        Ok(Self { path, map })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Final component of the host path, used as the name inside the image.
    pub fn file_name(&self) -> Result<&str, HostError> {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| HostError::NoFileName {
                path: self.path.clone(),
            })
    }
}

impl Deref for HostBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.map.as_deref().unwrap_or_default()
    }
}
