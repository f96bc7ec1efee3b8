//! One handler per command. Each runs a full session:
//! mount, open, operate, close, unmount, then report.
//!
//! Sessions and handles are guards, so any `?` between acquiring and
//! releasing them still closes the handle before unmounting.

use std::path::Path;

use tabled::{settings::Style, Table, Tabled};
use tracing::{info, warn};

use crate::{
    client::MountGuard,
    command::{ArgumentPacket, Env},
    error::{CommandError, Operation},
    host::HostBuffer,
};

const DISK: &str = "<disk-image>";

#[derive(Tabled)]
struct ListRow {
    name: String,
    size: u64,
    #[tabled(rename = "first block")]
    first_block: String,
}

pub fn info(env: &mut Env<'_>, args: &ArgumentPacket) -> Result<(), CommandError> {
    let [disk] = args.require("info", [DISK])?;
    let disk = Path::new(disk);

    let mut client = env.connector.connect();
    let mut session = MountGuard::mount(client.as_mut(), disk)
        .map_err(CommandError::fs(Operation::Mount, disk.display()))?;
    let info = session
        .info()
        .map_err(CommandError::fs(Operation::Info, disk.display()))?;
    session
        .unmount()
        .map_err(CommandError::fs(Operation::Unmount, disk.display()))?;

    write!(env.out, "{info}").map_err(CommandError::Output)
}

pub fn list(env: &mut Env<'_>, args: &ArgumentPacket) -> Result<(), CommandError> {
    let [disk] = args.require("ls", [DISK])?;
    let disk = Path::new(disk);

    let mut client = env.connector.connect();
    let mut session = MountGuard::mount(client.as_mut(), disk)
        .map_err(CommandError::fs(Operation::Mount, disk.display()))?;
    let entries = session
        .list()
        .map_err(CommandError::fs(Operation::List, disk.display()))?;
    session
        .unmount()
        .map_err(CommandError::fs(Operation::Unmount, disk.display()))?;

    let rows = entries.into_iter().map(|entry| ListRow {
        name: entry.name,
        size: entry.size,
        first_block: entry
            .first_block
            .map_or_else(|| "-".to_owned(), |block| block.to_string()),
    });
    let mut table = Table::new(rows);
    table.with(Style::psql());

    writeln!(env.out, "FS Ls:\n{table}").map_err(CommandError::Output)
}

pub fn stat(env: &mut Env<'_>, args: &ArgumentPacket) -> Result<(), CommandError> {
    let [disk, name] = args.require("stat", [DISK, "<path>"])?;
    let disk = Path::new(disk);

    let mut client = env.connector.connect();
    let mut session = MountGuard::mount(client.as_mut(), disk)
        .map_err(CommandError::fs(Operation::Mount, disk.display()))?;
    let mut file = session
        .open(name)
        .map_err(CommandError::fs(Operation::Open, name))?;
    let size = file
        .stat()
        .map_err(CommandError::fs(Operation::Stat, name))?;
    file.close()
        .map_err(CommandError::fs(Operation::Close, name))?;
    session
        .unmount()
        .map_err(CommandError::fs(Operation::Unmount, disk.display()))?;

    let report = match size {
        0 => writeln!(env.out, "Empty file"),
        size => writeln!(env.out, "Size of file '{name}' is {size} bytes"),
    };
    report.map_err(CommandError::Output)
}

pub fn cat(env: &mut Env<'_>, args: &ArgumentPacket) -> Result<(), CommandError> {
    let [disk, name] = args.require("cat", [DISK, "<path>"])?;
    let disk = Path::new(disk);

    let mut client = env.connector.connect();
    let mut session = MountGuard::mount(client.as_mut(), disk)
        .map_err(CommandError::fs(Operation::Mount, disk.display()))?;
    let mut file = session
        .open(name)
        .map_err(CommandError::fs(Operation::Open, name))?;
    let size = file
        .stat()
        .map_err(CommandError::fs(Operation::Stat, name))?;

    let mut buf = vec![0; size as usize];
    let read = match size {
        0 => 0,
        _ => file
            .read(&mut buf)
            .map_err(CommandError::fs(Operation::Read, name))?,
    };

    file.close()
        .map_err(CommandError::fs(Operation::Close, name))?;
    session
        .unmount()
        .map_err(CommandError::fs(Operation::Unmount, disk.display()))?;

    if size == 0 {
        return writeln!(env.out, "Empty file").map_err(CommandError::Output);
    }
    if read as u64 != size {
        warn!(name, read, size, "short read");
    }
    writeln!(env.out, "Read file '{name}' ({read}/{size} bytes)").map_err(CommandError::Output)?;
    writeln!(env.out, "Content of the file:").map_err(CommandError::Output)?;
    env.out
        .write_all(&buf[..read])
        .map_err(CommandError::Output)
}

pub fn remove(env: &mut Env<'_>, args: &ArgumentPacket) -> Result<(), CommandError> {
    let [disk, name] = args.require("rm", [DISK, "<path>"])?;
    let disk = Path::new(disk);

    let mut client = env.connector.connect();
    let mut session = MountGuard::mount(client.as_mut(), disk)
        .map_err(CommandError::fs(Operation::Mount, disk.display()))?;
    session
        .delete(name)
        .map_err(CommandError::fs(Operation::Delete, name))?;
    session
        .unmount()
        .map_err(CommandError::fs(Operation::Unmount, disk.display()))?;

    writeln!(env.out, "Removed file '{name}'").map_err(CommandError::Output)
}

pub fn add(env: &mut Env<'_>, args: &ArgumentPacket) -> Result<(), CommandError> {
    let [disk, source] = args.require("add", [DISK, "<host-path>"])?;
    let disk = Path::new(disk);

    // The snapshot outlives the session and is released when the handler
    // returns, whatever the outcome of the write.
    let snapshot = HostBuffer::snapshot(source)?;
    let name = snapshot.file_name()?;

    let mut client = env.connector.connect();
    let mut session = MountGuard::mount(client.as_mut(), disk)
        .map_err(CommandError::fs(Operation::Mount, disk.display()))?;
    session
        .create(name)
        .map_err(CommandError::fs(Operation::Create, name))?;
    let mut file = session
        .open(name)
        .map_err(CommandError::fs(Operation::Open, name))?;
    let written = file
        .write(&snapshot)
        .map_err(CommandError::fs(Operation::Write, name))?;
    file.close()
        .map_err(CommandError::fs(Operation::Close, name))?;
    session
        .unmount()
        .map_err(CommandError::fs(Operation::Unmount, disk.display()))?;

    if written != snapshot.len() {
        warn!(name, written, len = snapshot.len(), "short write");
    }
    info!(
        disk = %disk.display(),
        source = %snapshot.path().display(),
        name,
        written,
        "added"
    );
    writeln!(
        env.out,
        "Wrote file '{name}' ({written}/{} bytes)",
        snapshot.len()
    )
    .map_err(CommandError::Output)
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::{
        client::FsClient,
        error::FsError,
        image::{mkfs, ImageFs},
        testing::Ledger,
    };

    type HandlerFn = fn(&mut Env<'_>, &ArgumentPacket) -> Result<(), CommandError>;

    fn run_with(
        connector: &dyn crate::client::Connector,
        handler: HandlerFn,
        args: &[&str],
    ) -> (Result<(), CommandError>, String) {
        let mut out = Vec::new();
        let result = handler(
            &mut Env::new(connector, &mut out),
            &ArgumentPacket::new(args.iter().copied()),
        );
        (result, String::from_utf8_lossy(&out).into_owned())
    }

    fn run(
        ledger: &Ledger,
        handler: HandlerFn,
        args: &[&str],
    ) -> (Result<(), CommandError>, String) {
        run_with(&ledger.connector(), handler, args)
    }

    fn assert_released(ledger: &Ledger) {
        assert_eq!(
            ledger.succeeded(Operation::Mount),
            ledger.count(Operation::Unmount),
            "mount/unmount pairing"
        );
        assert_eq!(
            ledger.succeeded(Operation::Open),
            ledger.count(Operation::Close),
            "open/close pairing"
        );
    }

    fn image_fs() -> Box<dyn FsClient + Send> {
        Box::new(ImageFs::default())
    }

    fn make_image() -> anyhow::Result<(TempDir, PathBuf)> {
        let dir = tempdir()?;
        let disk = dir.path().join("disk.img");
        mkfs::make(&disk, 256 * 1024, 512)?;
        Ok((dir, disk))
    }

    #[test]
    fn arity_checked_before_mount() {
        let ledger = Ledger::new();
        let cases: [(HandlerFn, &[&str]); 6] = [
            (info, &[]),
            (list, &[]),
            (stat, &["disk.img"]),
            (cat, &["disk.img"]),
            (remove, &["disk.img"]),
            (add, &["disk.img"]),
        ];

        for (handler, args) in cases {
            let (result, out) = run(&ledger, handler, args);
            assert!(matches!(result, Err(CommandError::Usage { .. })));
            assert!(out.is_empty());
        }
        assert_eq!(ledger.total_calls(), 0);
    }

    #[test]
    fn stat_reports_size() -> anyhow::Result<()> {
        let ledger = Ledger::new();
        ledger.insert("a.txt", b"hello");

        let (result, out) = run(&ledger, stat, &["disk.img", "a.txt"]);
        result?;

        assert_eq!(out, "Size of file 'a.txt' is 5 bytes\n");
        assert_eq!(ledger.count(Operation::Mount), 1);
        assert_released(&ledger);
        Ok(())
    }

    #[test]
    fn empty_file_still_releases() -> anyhow::Result<()> {
        let ledger = Ledger::new();
        ledger.insert("empty", b"");

        for handler in [stat as HandlerFn, cat] {
            let (result, out) = run(&ledger, handler, &["disk.img", "empty"]);
            result?;
            assert_eq!(out, "Empty file\n");
        }

        assert_eq!(ledger.count(Operation::Read), 0);
        assert_eq!(ledger.count(Operation::Close), 2);
        assert_eq!(ledger.count(Operation::Unmount), 2);
        assert_released(&ledger);
        Ok(())
    }

    #[test]
    fn cat_prints_content() -> anyhow::Result<()> {
        let ledger = Ledger::new();
        ledger.insert("a.txt", b"hello\n");

        let (result, out) = run(&ledger, cat, &["disk.img", "a.txt"]);
        result?;

        assert_eq!(
            out,
            "Read file 'a.txt' (6/6 bytes)\nContent of the file:\nhello\n"
        );
        assert_released(&ledger);
        Ok(())
    }

    #[test]
    fn cat_short_read_is_reported() -> anyhow::Result<()> {
        let ledger = Ledger::new();
        ledger.insert("a.txt", b"hello");
        ledger.read_limit(2);

        let (result, out) = run(&ledger, cat, &["disk.img", "a.txt"]);
        result?;

        assert_eq!(out, "Read file 'a.txt' (2/5 bytes)\nContent of the file:\nhe");
        assert_released(&ledger);
        Ok(())
    }

    #[test]
    fn every_failure_releases_what_was_acquired() {
        let steps = [
            Operation::Mount,
            Operation::Open,
            Operation::Stat,
            Operation::Read,
            Operation::Close,
            Operation::Unmount,
        ];

        for step in steps {
            let ledger = Ledger::new();
            ledger.insert("a.txt", b"hello");
            ledger.fail_on(step);

            let (result, out) = run(&ledger, cat, &["disk.img", "a.txt"]);

            match result {
                Err(CommandError::Fs { op, .. }) => assert_eq!(op, step),
                other => panic!("{step}: unexpected {other:?}"),
            }
            assert!(out.is_empty(), "{step}: printed {out:?}");
            assert_released(&ledger);
        }
    }

    #[test]
    fn open_failure_names_the_step() {
        let ledger = Ledger::new();

        let (result, _) = run(&ledger, stat, &["disk.img", "missing"]);

        let err = result.unwrap_err();
        assert_eq!(
            err.to_string(),
            "open: cannot open 'missing': no such file"
        );
        assert_eq!(ledger.count(Operation::Unmount), 1);
        assert_released(&ledger);
    }

    #[test]
    fn add_write_failure_releases() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let source = dir.path().join("f.txt");
        fs::write(&source, b"data")?;

        let ledger = Ledger::new();
        ledger.fail_on(Operation::Write);
        let (result, _) = run(&ledger, add, &["disk.img", source.to_str().unwrap()]);

        assert!(matches!(
            result,
            Err(CommandError::Fs {
                op: Operation::Write,
                ..
            })
        ));
        assert_eq!(ledger.count(Operation::Close), 1);
        assert_eq!(ledger.count(Operation::Unmount), 1);
        assert_released(&ledger);
        Ok(())
    }

    #[test]
    fn add_rejects_non_regular_source() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let ledger = Ledger::new();

        let (result, _) = run(&ledger, add, &["disk.img", dir.path().to_str().unwrap()]);
        assert!(matches!(result, Err(CommandError::Host(_))));

        let missing = dir.path().join("missing");
        let (result, _) = run(&ledger, add, &["disk.img", missing.to_str().unwrap()]);
        assert!(matches!(result, Err(CommandError::Host(_))));

        assert_eq!(ledger.total_calls(), 0);
        Ok(())
    }

    #[test]
    fn add_stores_under_basename() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let source = dir.path().join("notes.txt");
        fs::write(&source, b"abc")?;

        let ledger = Ledger::new();
        let (result, out) = run(&ledger, add, &["disk.img", source.to_str().unwrap()]);
        result?;

        assert_eq!(out, "Wrote file 'notes.txt' (3/3 bytes)\n");
        assert_eq!(ledger.names(), ["notes.txt"]);
        assert_eq!(ledger.file("notes.txt").as_deref(), Some(&b"abc"[..]));
        assert_released(&ledger);
        Ok(())
    }

    #[test]
    fn info_and_ls_report() -> anyhow::Result<()> {
        let ledger = Ledger::new();
        ledger.insert("a.txt", b"abc");
        ledger.insert("b.txt", b"");

        let (result, out) = run(&ledger, info, &["disk.img"]);
        result?;
        assert!(out.starts_with("FS Info:\n"));
        assert!(out.contains("rdir_free_ratio=126/128\n"));

        let (result, out) = run(&ledger, list, &["disk.img"]);
        result?;
        assert!(out.starts_with("FS Ls:\n"));
        assert!(out.contains("a.txt"));
        assert!(out.contains("b.txt"));

        assert_eq!(ledger.count(Operation::Mount), 2);
        assert_released(&ledger);
        Ok(())
    }

    #[test]
    fn add_then_cat_round_trips_on_image() -> anyhow::Result<()> {
        let (dir, disk) = make_image()?;
        let disk = disk.to_str().unwrap();
        let source = dir.path().join("payload.bin");
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&source, &payload)?;

        let (result, out) = run_with(&image_fs, add, &[disk, source.to_str().unwrap()]);
        result?;
        assert_eq!(out, "Wrote file 'payload.bin' (3000/3000 bytes)\n");

        let mut out = Vec::new();
        cat(
            &mut Env::new(&image_fs, &mut out),
            &ArgumentPacket::new([disk, "payload.bin"]),
        )?;
        let header = "Read file 'payload.bin' (3000/3000 bytes)\nContent of the file:\n";
        assert_eq!(&out[..header.len()], header.as_bytes());
        assert_eq!(&out[header.len()..], &payload[..]);

        let (result, out) = run_with(&image_fs, stat, &[disk, "payload.bin"]);
        result?;
        assert_eq!(out, "Size of file 'payload.bin' is 3000 bytes\n");
        Ok(())
    }

    #[test]
    fn rm_missing_leaves_image_unchanged() -> anyhow::Result<()> {
        let (dir, disk) = make_image()?;
        let disk = disk.to_str().unwrap();
        let source = dir.path().join("keep.txt");
        fs::write(&source, b"keep")?;
        run_with(&image_fs, add, &[disk, source.to_str().unwrap()]).0?;

        let (result, before) = run_with(&image_fs, list, &[disk]);
        result?;

        let (result, out) = run_with(&image_fs, remove, &[disk, "ghost"]);
        assert!(matches!(
            result,
            Err(CommandError::Fs {
                op: Operation::Delete,
                source: FsError::NotFound,
                ..
            })
        ));
        assert!(out.is_empty());

        let (result, after) = run_with(&image_fs, list, &[disk]);
        result?;
        assert_eq!(before, after);

        let (result, out) = run_with(&image_fs, remove, &[disk, "keep.txt"]);
        result?;
        assert_eq!(out, "Removed file 'keep.txt'\n");
        Ok(())
    }
}
