use clap::Parser;
use miette::{miette, Result};
use test_fs::{cli::MkfsCLI, image::mkfs};
use tracing::Level;

fn main() -> Result<()> {
    let cli = MkfsCLI::parse();

    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let sb = mkfs::make(&cli.disk, cli.size_in_bytes, cli.block_size)
        .map_err(|e| miette!("{e:#}"))?;

    println!(
        "Formatted {}: {} blocks of {} bytes, {} for data",
        cli.disk.display(),
        sb.block_count,
        sb.block_size,
        sb.data_blocks()
    );

    Ok(())
}
