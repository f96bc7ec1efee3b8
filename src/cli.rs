use std::path::PathBuf;

use clap::Parser;
use tracing::Level;

use crate::{
    image::{DEFAULT_BLOCK_SIZE, DEFAULT_IMAGE_SIZE},
    runtime::RuntimeKind,
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct TestFsCLI {
    /// Most verbose level of the logs written to stderr
    #[arg(short, long, default_value = "warn")]
    pub log_level: Level,

    /// How each command is scheduled
    #[arg(short, long, value_enum, default_value_t)]
    pub runtime: RuntimeKind,

    /// One of: info, ls, add, rm, cat, stat, multiuseradd
    pub command: Option<String>,

    /// Arguments of the command, usually <disk-image> [<path>]
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Formats a new disk image.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct MkfsCLI {
    /// The path to the disk image to create
    pub disk: PathBuf,

    /// Size of the disk image in bytes
    #[arg(short, long, default_value_t = DEFAULT_IMAGE_SIZE)]
    pub size_in_bytes: u64,

    /// Size of a block in bytes
    #[arg(short, long, default_value_t = DEFAULT_BLOCK_SIZE)]
    pub block_size: u32,
}
