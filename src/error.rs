use std::{fmt, io};

use thiserror::Error;

use crate::client::Handle;
use crate::host::HostError;

pub type FsResult<T> = Result<T, FsError>;

/// Errors reported by a filesystem client.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no disk image is mounted")]
    NotMounted,
    #[error("a disk image is already mounted by this client")]
    AlreadyMounted,
    #[error("no such file")]
    NotFound,
    #[error("file already exists")]
    Exists,
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error("root directory is full")]
    DirectoryFull,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("bad file handle {0}")]
    BadHandle(Handle),
    #[error("file is still open")]
    Busy,
    #[error("{0} file handle(s) still open")]
    HandlesOpen(usize),
    #[error("no space left on disk image")]
    NoSpace,
    #[error("corrupt disk image: {0}")]
    Corrupt(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<nix::errno::Errno> for FsError {
    fn from(errno: nix::errno::Errno) -> Self {
        Self::Io(errno.into())
    }
}

/// A call into the filesystem client contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Mount,
    Unmount,
    Open,
    Close,
    Stat,
    Read,
    Write,
    Create,
    Delete,
    List,
    Info,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Self::Mount => "mount",
            Self::Unmount => "unmount",
            Self::Open => "open",
            Self::Close => "close",
            Self::Stat => "stat",
            Self::Read => "read",
            Self::Write => "write",
            Self::Create => "create",
            Self::Delete => "delete",
            Self::List => "list",
            Self::Info => "info",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A fatal failure of a command. Rendered as one line prefixed by the step
/// that failed.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Usage: test-fs <command> [<arg>]")]
    MissingCommand,

    #[error("invalid command '{0}'")]
    UnknownCommand(String),

    #[error("{command}: usage: test-fs {command} {expected}")]
    Usage {
        command: &'static str,
        expected: String,
    },

    #[error("{op}: cannot {op} '{target}': {source}")]
    Fs {
        op: Operation,
        target: String,
        source: FsError,
    },

    #[error("snapshot: {0}")]
    Host(#[from] HostError),

    #[error("output: {0}")]
    Output(#[source] io::Error),

    #[error("runtime: cannot start task thread: {0}")]
    Runtime(#[source] io::Error),

    #[error("multiuseradd: cannot stage client sources: {0}")]
    Staging(#[source] io::Error),

    #[error("multiuseradd: invalid client list: {0}")]
    InvalidClients(String),

    #[error("multiuseradd: {failed} of {total} clients failed, first: {first}")]
    Harness {
        failed: usize,
        total: usize,
        first: Box<CommandError>,
    },
}

impl CommandError {
    /// Wraps a client error raised while performing `op` on `target`.
    pub fn fs(op: Operation, target: impl fmt::Display) -> impl FnOnce(FsError) -> Self {
        let target = target.to_string();
        move |source| Self::Fs { op, target, source }
    }

    /// Whether the command list should follow the message.
    pub fn wants_usage(&self) -> bool {
        matches!(self, Self::MissingCommand | Self::UnknownCommand(_))
    }
}
