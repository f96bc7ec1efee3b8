//! Concurrent `add` clients racing against one image.

use std::{
    collections::HashSet,
    fs, io, panic,
    path::{Path, PathBuf},
    thread,
};

use tracing::{info, warn};

use crate::{
    client::Connector,
    command::{ArgumentPacket, Env},
    error::CommandError,
    handlers,
    host::HostBuffer,
};

pub const CLIENT_COUNT: usize = 5;

/// Arguments of one `add` client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDescriptor {
    pub disk: String,
    pub source: String,
}

/// A validated, non-empty list of clients that share one image and each add
/// a file under a distinct name.
#[derive(Debug, Clone)]
pub struct ClientPlan {
    clients: Vec<ClientDescriptor>,
}

impl ClientPlan {
    pub fn new(clients: Vec<ClientDescriptor>) -> Result<Self, CommandError> {
        let first = clients
            .first()
            .ok_or_else(|| CommandError::InvalidClients("no clients".to_owned()))?;
        if let Some(other) = clients.iter().find(|c| c.disk != first.disk) {
            return Err(CommandError::InvalidClients(format!(
                "clients target both '{}' and '{}'",
                first.disk, other.disk
            )));
        }

        let mut names = HashSet::new();
        for client in &clients {
            let name = Path::new(&client.source)
                .file_name()
                .ok_or_else(|| {
                    CommandError::InvalidClients(format!("'{}' has no file name", client.source))
                })?;
            if !names.insert(name.to_owned()) {
                return Err(CommandError::InvalidClients(format!(
                    "two clients add '{}'",
                    name.to_string_lossy()
                )));
            }
        }

        Ok(Self { clients })
    }

    /// One client per source, all against `disk`.
    pub fn for_sources(disk: &str, sources: &[PathBuf]) -> Result<Self, CommandError> {
        let clients = sources
            .iter()
            .map(|source| {
                let source = source.to_str().ok_or_else(|| {
                    CommandError::InvalidClients(format!(
                        "non UTF-8 source path {}",
                        source.display()
                    ))
                })?;
                Ok(ClientDescriptor {
                    disk: disk.to_owned(),
                    source: source.to_owned(),
                })
            })
            .collect::<Result<Vec<_>, CommandError>>()?;
        Self::new(clients)
    }

    pub fn clients(&self) -> &[ClientDescriptor] {
        &self.clients
    }
}

/// Outcome of one client, with what it printed.
#[derive(Debug)]
pub struct ClientReport {
    pub index: usize,
    pub output: Vec<u8>,
    pub result: Result<(), CommandError>,
}

/// Writes `file1.txt` .. `file<count>.txt` into `dir`, each holding
/// `template` followed by a line naming its client.
pub fn stage_sources(dir: &Path, template: &[u8], count: usize) -> io::Result<Vec<PathBuf>> {
    (1..=count)
        .map(|n| {
            let path = dir.join(format!("file{n}.txt"));
            let mut content = template.to_vec();
            content.extend_from_slice(format!("client {n}\n").as_bytes());
            fs::write(&path, content)?;
            Ok(path)
        })
        .collect()
}

/// Runs every client of `plan` on its own OS thread and waits for all of
/// them. Clients are not ordered with respect to each other.
pub fn launch(
    plan: &ClientPlan,
    connector: &dyn Connector,
) -> Result<Vec<ClientReport>, CommandError> {
    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(plan.clients().len());
        for (index, client) in plan.clients().iter().enumerate() {
            let args = ArgumentPacket::new([client.disk.as_str(), client.source.as_str()]);
            let handle = thread::Builder::new()
                .name(format!("client-{}", index + 1))
                .spawn_scoped(scope, move || {
                    let mut output = Vec::new();
                    let result = handlers::add(&mut Env::new(connector, &mut output), &args);
                    ClientReport {
                        index,
                        output,
                        result,
                    }
                })
                .map_err(CommandError::Runtime)?;
            handles.push(handle);
        }

        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(report) => Ok(report),
                Err(payload) => panic::resume_unwind(payload),
            })
            .collect()
    })
}

pub fn multiuseradd(env: &mut Env<'_>, args: &ArgumentPacket) -> Result<(), CommandError> {
    let [disk, source] = args.require("multiuseradd", ["<disk-image>", "<host-path>"])?;

    let template = HostBuffer::snapshot(source)?;
    let staging = tempfile::Builder::new()
        .prefix("test-fs-clients")
        .tempdir()
        .map_err(CommandError::Staging)?;
    let sources =
        stage_sources(staging.path(), &template, CLIENT_COUNT).map_err(CommandError::Staging)?;
    let plan = ClientPlan::for_sources(disk, &sources)?;

    let reports = launch(&plan, env.connector)?;

    let total = reports.len();
    let mut failures = Vec::new();
    for report in reports {
        env.out
            .write_all(&report.output)
            .map_err(CommandError::Output)?;
        match report.result {
            Ok(()) => {}
            Err(e) => {
                warn!(client = report.index + 1, "client failed: {e}");
                failures.push(e);
            }
        }
    }

    let failed = failures.len();
    match failures.into_iter().next() {
        None => {
            info!(disk, clients = total, "all clients finished");
            Ok(())
        }
        Some(first) => Err(CommandError::Harness {
            failed,
            total,
            first: Box::new(first),
        }),
    }
}
