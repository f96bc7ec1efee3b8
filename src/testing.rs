//! In-memory `FsClient` that records every call, for exercising the
//! handlers without a disk image.

use std::{
    collections::{BTreeMap, HashMap},
    io,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    client::{Connector, DirEntry, FsClient, FsInfo, Handle},
    error::{FsError, FsResult, Operation},
};

#[derive(Debug, Default)]
struct State {
    files: BTreeMap<String, Vec<u8>>,
    calls: Vec<(Operation, bool)>,
    fail_on: Option<Operation>,
    read_limit: Option<usize>,
}

/// Storage and call log shared by every client it hands out.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    state: Arc<Mutex<State>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn insert(&self, name: &str, data: &[u8]) {
        self.lock().files.insert(name.to_owned(), data.to_vec());
    }

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.lock().files.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    /// Every later call of `op` fails.
    pub fn fail_on(&self, op: Operation) {
        self.lock().fail_on = Some(op);
    }

    /// Reads return at most `limit` bytes.
    pub fn read_limit(&self, limit: usize) {
        self.lock().read_limit = Some(limit);
    }

    /// Calls of `op`, failed ones included.
    pub fn count(&self, op: Operation) -> usize {
        self.lock().calls.iter().filter(|(o, _)| *o == op).count()
    }

    pub fn succeeded(&self, op: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|(o, ok)| *o == op && *ok)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn client(&self) -> RecordingClient {
        RecordingClient {
            ledger: self.clone(),
            mounted: false,
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    pub fn connector(&self) -> impl Connector {
        let ledger = self.clone();
        move || Box::new(ledger.client()) as Box<dyn FsClient + Send>
    }

    /// Logs `op` and decides whether it is injected to fail.
    fn record(&self, op: Operation) -> FsResult<()> {
        let mut state = self.lock();
        let fail = state.fail_on == Some(op);
        state.calls.push((op, !fail));
        if fail {
            return Err(FsError::Io(io::Error::other(format!("injected {op} failure"))));
        }
        Ok(())
    }

    /// Marks the last logged call as failed.
    fn reject(&self, e: FsError) -> FsError {
        if let Some(last) = self.lock().calls.last_mut() {
            last.1 = false;
        }
        e
    }
}

pub struct RecordingClient {
    ledger: Ledger,
    mounted: bool,
    handles: HashMap<Handle, (String, usize)>,
    next_handle: u32,
}

impl RecordingClient {
    fn check(&mut self, op: Operation) -> FsResult<()> {
        self.ledger.record(op)?;
        if !self.mounted {
            return Err(self.ledger.reject(FsError::NotMounted));
        }
        Ok(())
    }

    fn handle(&mut self, handle: Handle) -> FsResult<&mut (String, usize)> {
        match self.handles.get_mut(&handle) {
            Some(state) => Ok(state),
            None => Err(self.ledger.reject(FsError::BadHandle(handle))),
        }
    }
}

impl FsClient for RecordingClient {
    fn mount(&mut self, _disk: &Path) -> FsResult<()> {
        self.ledger.record(Operation::Mount)?;
        if self.mounted {
            return Err(self.ledger.reject(FsError::AlreadyMounted));
        }
        self.mounted = true;
        Ok(())
    }

    fn unmount(&mut self) -> FsResult<()> {
        self.check(Operation::Unmount)?;
        if !self.handles.is_empty() {
            return Err(self.ledger.reject(FsError::HandlesOpen(self.handles.len())));
        }
        self.mounted = false;
        Ok(())
    }

    fn open(&mut self, name: &str) -> FsResult<Handle> {
        self.check(Operation::Open)?;
        if !self.ledger.lock().files.contains_key(name) {
            return Err(self.ledger.reject(FsError::NotFound));
        }
        let handle = Handle(self.next_handle);
        self.next_handle += 1;
        self.handles.insert(handle, (name.to_owned(), 0));
        Ok(handle)
    }

    fn close(&mut self, handle: Handle) -> FsResult<()> {
        self.check(Operation::Close)?;
        match self.handles.remove(&handle) {
            Some(_) => Ok(()),
            None => Err(self.ledger.reject(FsError::BadHandle(handle))),
        }
    }

    fn stat(&mut self, handle: Handle) -> FsResult<u64> {
        self.check(Operation::Stat)?;
        let name = self.handle(handle)?.0.clone();
        let size = self.ledger.lock().files.get(&name).map_or(0, Vec::len);
        Ok(size as u64)
    }

    fn read(&mut self, handle: Handle, buf: &mut [u8]) -> FsResult<usize> {
        self.check(Operation::Read)?;
        let ledger = self.ledger.clone();
        let (name, offset) = self.handle(handle)?;
        let state = ledger.lock();
        let data = state.files.get(name.as_str()).map_or(&[][..], Vec::as_slice);
        let available = data.len().saturating_sub(*offset);
        let n = buf
            .len()
            .min(available)
            .min(state.read_limit.unwrap_or(usize::MAX));
        buf[..n].copy_from_slice(&data[*offset..*offset + n]);
        *offset += n;
        Ok(n)
    }

    fn write(&mut self, handle: Handle, buf: &[u8]) -> FsResult<usize> {
        self.check(Operation::Write)?;
        let ledger = self.ledger.clone();
        let (name, offset) = self.handle(handle)?;
        let mut state = ledger.lock();
        let data = state.files.entry(name.clone()).or_default();
        let end = *offset + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[*offset..end].copy_from_slice(buf);
        *offset = end;
        Ok(buf.len())
    }

    fn create(&mut self, name: &str) -> FsResult<()> {
        self.check(Operation::Create)?;
        let mut state = self.ledger.lock();
        if state.files.contains_key(name) {
            drop(state);
            return Err(self.ledger.reject(FsError::Exists));
        }
        state.files.insert(name.to_owned(), Vec::new());
        Ok(())
    }

    fn delete(&mut self, name: &str) -> FsResult<()> {
        self.check(Operation::Delete)?;
        let removed = self.ledger.lock().files.remove(name);
        match removed {
            Some(_) => Ok(()),
            None => Err(self.ledger.reject(FsError::NotFound)),
        }
    }

    fn list(&mut self) -> FsResult<Vec<DirEntry>> {
        self.check(Operation::List)?;
        let state = self.ledger.lock();
        Ok(state
            .files
            .iter()
            .map(|(name, data)| DirEntry {
                name: name.clone(),
                size: data.len() as u64,
                first_block: (!data.is_empty()).then_some(0),
            })
            .collect())
    }

    fn info(&mut self) -> FsResult<FsInfo> {
        self.check(Operation::Info)?;
        let files = self.ledger.lock().files.len();
        Ok(FsInfo {
            block_size: 512,
            total_blocks: 64,
            table_blocks: 1,
            directory_blocks: 22,
            data_start: 24,
            data_blocks: 40,
            free_data_blocks: 40,
            files,
            max_files: 128,
            mount_count: 1,
        })
    }
}
