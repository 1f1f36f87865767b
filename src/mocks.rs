//! In-memory transport for tests and simulation.
//!
//! [Memory] behaves like a device that lives in a `HashMap`: offset-addressed
//! partial reads and writes, short reads at end of file, growth on write.
//! On top of that it records served operations, injects failures per path,
//! and can park calls on a gate so tests can interleave tasks
//! deterministically. Hosts can use it to run a whole mount against no
//! hardware.

use crate::{transport::Transport, Error};
use bytes::Bytes;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::Semaphore;

/// One served transport operation, in call order. Failed or parked calls
/// leave no trace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Read { path: String, offset: u64, len: usize },
    Write { path: String, offset: u64, len: usize },
}

#[derive(Default)]
struct Inner {
    files: HashMap<String, Vec<u8>>,
    ops: Vec<Op>,
    reads: usize,
    writes: usize,
    fail_reads: HashMap<String, Error>,
    fail_writes: HashMap<String, Error>,
    read_gates: HashMap<String, Arc<Semaphore>>,
    write_gates: HashMap<String, Arc<Semaphore>>,
}

/// In-memory [Transport]. Clones share the same files and instrumentation.
#[derive(Clone, Default)]
pub struct Memory {
    inner: Arc<Mutex<Inner>>,
}

impl Memory {
    /// Create or replace the file at `path`.
    pub fn insert(&self, path: &str, contents: Vec<u8>) {
        self.inner
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), contents);
    }

    /// Current contents of the file at `path`.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().files.get(path).cloned()
    }

    /// Number of reads served so far.
    pub fn read_count(&self) -> usize {
        self.inner.lock().unwrap().reads
    }

    /// Number of writes served so far.
    pub fn write_count(&self) -> usize {
        self.inner.lock().unwrap().writes
    }

    /// Every operation served so far, in order.
    pub fn ops(&self) -> Vec<Op> {
        self.inner.lock().unwrap().ops.clone()
    }

    /// Fail all subsequent reads of `path` with `err`.
    pub fn fail_reads(&self, path: &str, err: Error) {
        self.inner
            .lock()
            .unwrap()
            .fail_reads
            .insert(path.to_string(), err);
    }

    /// Fail all subsequent writes of `path` with `err`.
    pub fn fail_writes(&self, path: &str, err: Error) {
        self.inner
            .lock()
            .unwrap()
            .fail_writes
            .insert(path.to_string(), err);
    }

    /// Stop failing operations on `path`.
    pub fn heal(&self, path: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_reads.remove(path);
        inner.fail_writes.remove(path);
    }

    /// Park subsequent reads of `path` until [Self::open_reads].
    pub fn hold_reads(&self, path: &str) {
        self.inner
            .lock()
            .unwrap()
            .read_gates
            .insert(path.to_string(), Arc::new(Semaphore::new(0)));
    }

    /// Release parked reads of `path` and stop parking new ones.
    pub fn open_reads(&self, path: &str) {
        if let Some(gate) = self.inner.lock().unwrap().read_gates.remove(path) {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// Park subsequent writes of `path` until [Self::open_writes].
    pub fn hold_writes(&self, path: &str) {
        self.inner
            .lock()
            .unwrap()
            .write_gates
            .insert(path.to_string(), Arc::new(Semaphore::new(0)));
    }

    /// Release parked writes of `path` and stop parking new ones.
    pub fn open_writes(&self, path: &str) {
        if let Some(gate) = self.inner.lock().unwrap().write_gates.remove(path) {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }
}

impl Transport for Memory {
    async fn read(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>, Error> {
        // Model the wire: a transfer always suspends at least once.
        tokio::task::yield_now().await;
        let gate = self.inner.lock().unwrap().read_gates.get(path).cloned();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.fail_reads.get(path) {
            return Err(err.clone());
        }
        let Some(file) = inner.files.get(path) else {
            return Err(Error::NotFound);
        };
        let at = (offset as usize).min(file.len());
        let end = (at + len).min(file.len());
        let data = file[at..end].to_vec();
        inner.reads += 1;
        inner.ops.push(Op::Read {
            path: path.to_string(),
            offset,
            len,
        });
        Ok(data)
    }

    async fn write(&self, path: &str, data: Bytes, offset: u64) -> Result<usize, Error> {
        tokio::task::yield_now().await;
        let gate = self.inner.lock().unwrap().write_gates.get(path).cloned();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.fail_writes.get(path) {
            return Err(err.clone());
        }
        {
            let file = inner.files.entry(path.to_string()).or_default();
            let end = offset as usize + data.len();
            if file.len() < end {
                file.resize(end, 0);
            }
            file[offset as usize..end].copy_from_slice(&data);
        }
        inner.writes += 1;
        inner.ops.push(Op::Write {
            path: path.to_string(),
            offset,
            len: data.len(),
        });
        Ok(data.len())
    }
}
