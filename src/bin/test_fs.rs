use std::{
    io::{self, Write},
    process,
};

use clap::Parser;
use test_fs::{
    cli::TestFsCLI,
    client::FsClient,
    command::{self, ArgumentPacket, Env},
    error::CommandError,
    image::ImageFs,
    runtime::{Inline, NativeThread, RuntimeKind},
};

fn connect() -> Box<dyn FsClient + Send> {
    Box::new(ImageFs::default())
}

fn run(cli: TestFsCLI, out: &mut (dyn Write + Send)) -> Result<(), CommandError> {
    let mut env = Env::new(&connect, out);
    let args = ArgumentPacket::new(cli.args);
    let name = cli.command.as_deref();

    match cli.runtime {
        RuntimeKind::Inline => command::dispatch(&Inline, &mut env, name, args),
        RuntimeKind::Thread => {
            command::dispatch(&NativeThread::new("test-fs-task"), &mut env, name, args)
        }
    }
}

fn main() {
    let cli = TestFsCLI::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_writer(io::stderr)
        .init();

    let mut stdout = io::stdout();
    let result = run(cli, &mut stdout);
    let flushed = stdout.flush();

    if let Err(error) = result {
        // Nothing more can be reported if stderr itself fails.
        let _ = command::report(&error, &mut io::stderr().lock());
        process::exit(1);
    }
    if let Err(error) = flushed {
        eprintln!("output: {error}");
        process::exit(1);
    }
}
