//! Stream an Android device's filesystem over the Android Debug Bridge.
//!
//! `droidfs` is the data plane for mounting a device as local storage.
//! Instead of the pull-whole-file, push-whole-file round trips of MTP-style
//! tools, it moves data in fixed power-of-two pages: a write-back
//! [cache](crate::cache::Cache) with concurrent miss coalescing sits between
//! the filesystem operations layer and a pluggable
//! [transport](crate::transport::Transport), so partial reads stream only
//! the pages they touch, repeated I/O is served from memory, and writes are
//! deferred until a flush. A [control socket](crate::control::Control) lets
//! running mounts resize the cache without remounting.
//!
//! The mount layer itself (FUSE binding, directory tree, argument parsing)
//! lives above this crate: it mints the opaque file ids the cache is keyed
//! by, binds each id to a device path with
//! [RemoteFile](crate::transport::RemoteFile), and drains
//! [orphans](crate::cache::Cache::take_orphans) on its own schedule.
//!
//! # Example
//!
//! ```
//! use droidfs::{cache::Cache, mocks::Memory, transport::RemoteFile};
//!
//! let runtime = tokio::runtime::Builder::new_current_thread()
//!     .enable_all()
//!     .build()
//!     .unwrap();
//! runtime.block_on(async {
//!     // A fake device with one file on it.
//!     let device = Memory::default();
//!     device.insert("/sdcard/notes.txt", b"remember the milk".to_vec());
//!
//!     // 64 KiB pages, 512 of them.
//!     let cache = Cache::new(64 * 1024, 512);
//!     let notes = RemoteFile::new(device.clone(), "/sdcard/notes.txt");
//!
//!     // Reads fetch whole pages once, then are served from memory.
//!     let mut buf = [0u8; 8];
//!     cache.read(1, &mut buf, 9, &notes).await.unwrap();
//!     assert_eq!(&buf, b"the milk");
//!
//!     // Writes land in the cache and reach the device on flush.
//!     cache.write(1, b"REMEMBER", 0).await.unwrap();
//!     cache.flush(1, 17, &notes).await.unwrap();
//!     assert_eq!(
//!         device.contents("/sdcard/notes.txt").unwrap(),
//!         b"REMEMBER the milk"
//!     );
//! });
//! ```

pub mod cache;
pub mod control;
pub mod mocks;
pub mod transport;

mod error;
pub use error::Error;
