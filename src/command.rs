use std::io::{self, Write};

use tracing::debug;

use crate::{
    client::Connector,
    error::CommandError,
    handlers, stress,
    runtime::TaskRuntime,
};

/// The command-line arguments that follow the command name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgumentPacket {
    values: Vec<String>,
}

impl ArgumentPacket {
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn count(&self) -> usize {
        self.values.len()
    }

    /// The first `N` values, or a usage error naming `names` when fewer were
    /// given. Extra values are ignored.
    pub fn require<const N: usize>(
        &self,
        command: &'static str,
        names: [&'static str; N],
    ) -> Result<[&str; N], CommandError> {
        if self.values.len() < N {
            return Err(CommandError::Usage {
                command,
                expected: names.join(" "),
            });
        }
        Ok(std::array::from_fn(|i| self.values[i].as_str()))
    }
}

/// What a handler may touch: a source of filesystem clients and the stream
/// that receives its report.
pub struct Env<'a> {
    pub connector: &'a dyn Connector,
    pub out: &'a mut (dyn Write + Send),
}

impl<'a> Env<'a> {
    pub fn new(connector: &'a dyn Connector, out: &'a mut (dyn Write + Send)) -> Self {
        Self { connector, out }
    }
}

pub type Handler = fn(&mut Env<'_>, &ArgumentPacket) -> Result<(), CommandError>;

/// How the dispatcher runs a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduling {
    /// As one unit on the task runtime.
    Task,
    /// On the caller's thread; the handler manages its own threads.
    Direct,
}

pub struct Command {
    pub name: &'static str,
    pub handler: Handler,
    pub scheduling: Scheduling,
}

pub static COMMANDS: [Command; 7] = [
    Command {
        name: "info",
        handler: handlers::info,
        scheduling: Scheduling::Task,
    },
    Command {
        name: "ls",
        handler: handlers::list,
        scheduling: Scheduling::Task,
    },
    Command {
        name: "add",
        handler: handlers::add,
        scheduling: Scheduling::Task,
    },
    Command {
        name: "rm",
        handler: handlers::remove,
        scheduling: Scheduling::Task,
    },
    Command {
        name: "cat",
        handler: handlers::cat,
        scheduling: Scheduling::Task,
    },
    Command {
        name: "stat",
        handler: handlers::stat,
        scheduling: Scheduling::Task,
    },
    Command {
        name: "multiuseradd",
        handler: stress::multiuseradd,
        scheduling: Scheduling::Direct,
    },
];

pub fn lookup(name: &str) -> Option<&'static Command> {
    COMMANDS.iter().find(|command| command.name == name)
}

pub fn usage() -> String {
    let mut usage = String::from("Usage: test-fs <command> [<arg>]\nPossible commands are:\n");
    for command in &COMMANDS {
        usage.push('\t');
        usage.push_str(command.name);
        usage.push('\n');
    }
    usage
}

/// Writes the diagnostic of a failed command: one line, followed by the
/// command list when the command itself was missing or unknown.
pub fn report(error: &CommandError, out: &mut dyn Write) -> io::Result<()> {
    // The usage text already starts with the missing-command line.
    if !matches!(error, CommandError::MissingCommand) {
        writeln!(out, "{error}")?;
    }
    if error.wants_usage() {
        out.write_all(usage().as_bytes())?;
    }
    Ok(())
}

/// Looks up `name` and runs its handler exactly once, returning when the
/// handler and any threads it started are done.
pub fn dispatch<R>(
    runtime: &R,
    env: &mut Env<'_>,
    name: Option<&str>,
    args: ArgumentPacket,
) -> Result<(), CommandError>
where
    R: TaskRuntime,
{
    let name = name.ok_or(CommandError::MissingCommand)?;
    let command = lookup(name).ok_or_else(|| CommandError::UnknownCommand(name.to_owned()))?;
    debug!(command = command.name, args = args.count(), "dispatching");

    match command.scheduling {
        Scheduling::Task => runtime
            .run(|| (command.handler)(env, &args))
            .map_err(CommandError::Runtime)?,
        Scheduling::Direct => (command.handler)(env, &args),
    }
}
