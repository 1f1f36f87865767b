//! Remote-I/O boundary: how cached pages reach the device.
//!
//! A [Transport] moves byte ranges between host and device by path. The
//! cache itself never sees paths: [RemoteFile] binds a transport to one path
//! and hands the cache the narrow per-file capability it consumes, so the
//! `(id -> path)` mapping stays wherever the directory layer keeps it.

pub mod adb;

use crate::{cache::Remote, Error};
use bytes::Bytes;
use std::future::Future;

/// Offset-addressable partial I/O against device paths.
///
/// Implementations: [adb::Adb] drives the `adb` binary, one subprocess per
/// call; [Memory](crate::mocks::Memory) lives in a `HashMap` for tests and
/// simulation. Clones share the underlying device connection.
pub trait Transport: Clone + Send + Sync + 'static {
    /// Read up to `len` bytes of `path` starting at `offset`. A short result
    /// means the file ended inside the requested range.
    fn read(
        &self,
        path: &str,
        offset: u64,
        len: usize,
    ) -> impl Future<Output = Result<Vec<u8>, Error>> + Send;

    /// Write `data` into `path` at `offset` without truncating, returning
    /// the number of bytes written.
    fn write(
        &self,
        path: &str,
        data: Bytes,
        offset: u64,
    ) -> impl Future<Output = Result<usize, Error>> + Send;
}

/// A [Transport] bound to one device path: the per-file capability handed to
/// [Cache::read](crate::cache::Cache::read) and
/// [Cache::flush](crate::cache::Cache::flush).
#[derive(Clone)]
pub struct RemoteFile<T: Transport> {
    transport: T,
    path: String,
}

impl<T: Transport> RemoteFile<T> {
    pub fn new(transport: T, path: impl Into<String>) -> Self {
        Self {
            transport,
            path: path.into(),
        }
    }

    /// The device path this capability is bound to.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl<T: Transport> Remote for RemoteFile<T> {
    async fn fetch(&self, offset: u64, len: usize) -> Result<Vec<u8>, Error> {
        self.transport.read(&self.path, offset, len).await
    }

    async fn flush(&self, data: Bytes, offset: u64) -> Result<usize, Error> {
        self.transport.write(&self.path, data, offset).await
    }
}
