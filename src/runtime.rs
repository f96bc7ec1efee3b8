use std::{io, panic, thread};

use clap::ValueEnum;
use tracing::debug;

/// Runs one unit of work to completion. The caller blocks until it is done.
pub trait TaskRuntime {
    fn run<F, T>(&self, task: F) -> io::Result<T>
    where
        F: FnOnce() -> T + Send,
        T: Send;
}

/// Runs the unit on the caller's thread: a single logical thread of control.
#[derive(Debug, Default, Clone, Copy)]
pub struct Inline;

impl TaskRuntime for Inline {
    fn run<F, T>(&self, task: F) -> io::Result<T>
    where
        F: FnOnce() -> T + Send,
        T: Send,
    {
        Ok(task())
    }
}

/// Runs the unit on a dedicated OS thread and joins it. A panic inside the
/// unit resumes on the caller.
#[derive(Debug, Clone)]
pub struct NativeThread {
    name: String,
}

impl NativeThread {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl TaskRuntime for NativeThread {
    fn run<F, T>(&self, task: F) -> io::Result<T>
    where
        F: FnOnce() -> T + Send,
        T: Send,
    {
        thread::scope(|scope| {
            let handle = thread::Builder::new()
                .name(self.name.clone())
                .spawn_scoped(scope, task)?;
            debug!(thread = %self.name, "task started");
            match handle.join() {
                Ok(value) => Ok(value),
                Err(payload) => panic::resume_unwind(payload),
            }
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RuntimeKind {
    /// Run each command on the calling thread
    #[default]
    Inline,
    /// Run each command on its own OS thread
    Thread,
}
