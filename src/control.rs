//! Runtime reconfiguration over a Unix-domain control socket.
//!
//! Hosts bind one socket per mounted device (named after its serial) and
//! drive it with any client that can frame JSON: each connection carries one
//! request and one response, both as a 4-byte big-endian length followed by
//! UTF-8 JSON. Requests look like `{"op": "set_page_size", "value": {"kib":
//! 128}}`; responses are `{"status": "success", "value": …}` or `{"status":
//! "error", "message": …}`.
//!
//! Reconfiguration is destructive to cached state (see
//! [Cache::set_page_size](crate::cache::Cache::set_page_size)); callers are
//! expected to flush before resizing.

use crate::cache::Cache;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
};
use tracing::{info, warn};

/// Largest accepted request frame.
const MAX_FRAME: u32 = 4 * 1024;

/// Smallest page the transport is worth driving: below this the per-request
/// overhead of an adb round trip dominates the transfer.
const MIN_PAGE_SIZE: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
enum Request {
    Help,
    InvalidateCache,
    SetPageSize { kib: u64 },
    GetPageSize,
    SetCacheSize { mib: u64 },
    GetCacheSize,
}

/// Listener half of the control socket. The socket file is unlinked when
/// this is dropped.
pub struct Control {
    listener: UnixListener,
    path: PathBuf,
}

impl Control {
    /// Bind the control socket for device `serial` under `$XDG_RUNTIME_DIR`
    /// (falling back to `/tmp`), e.g. `/run/user/1000/droidfs@SERIAL.sock`.
    pub fn bind(serial: &str) -> io::Result<Self> {
        let dir = std::env::var_os("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        Self::bind_at(dir.join(format!("droidfs@{serial}.sock")))
    }

    /// Bind the control socket at an explicit path.
    pub fn bind_at(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "control socket bound");
        Ok(Self { listener, path })
    }

    /// Where the socket is bound.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve requests against `cache` forever. Each connection is handled in
    /// its own task; accept errors are logged and the loop keeps going.
    pub async fn run(self, cache: Cache) {
        loop {
            let stream = match self.listener.accept().await {
                Ok((stream, _)) => stream,
                Err(err) => {
                    warn!(%err, "control accept failed");
                    continue;
                }
            };
            let cache = cache.clone();
            tokio::spawn(async move {
                if let Err(err) = serve(stream, cache).await {
                    warn!(%err, "control request failed");
                }
            });
        }
    }
}

impl Drop for Control {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn serve(mut stream: UnixStream, cache: Cache) -> io::Result<()> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len);
    if len > MAX_FRAME {
        let response = json!({"status": "error", "message": "request too large"});
        return send(&mut stream, &response).await;
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;

    let response = match serde_json::from_slice::<Request>(&payload) {
        Ok(request) => {
            info!(?request, "control request");
            json!({"status": "success", "value": apply(request, &cache).await})
        }
        Err(err) => json!({"status": "error", "message": err.to_string()}),
    };
    send(&mut stream, &response).await
}

async fn apply(request: Request, cache: &Cache) -> Value {
    match request {
        Request::Help => json!([
            "help",
            "invalidate_cache",
            "set_page_size",
            "get_page_size",
            "set_cache_size",
            "get_cache_size",
        ]),
        Request::InvalidateCache => {
            cache.invalidate().await;
            Value::Null
        }
        Request::SetPageSize { kib } => {
            let page_size = ((kib as usize) << 10).max(MIN_PAGE_SIZE);
            cache.set_page_size(page_size).await;
            json!({"kib": cache.page_size().await >> 10})
        }
        Request::GetPageSize => json!({"kib": cache.page_size().await >> 10}),
        Request::SetCacheSize { mib } => {
            let page_size = cache.page_size().await;
            let budget = ((mib as usize) << 20).max(page_size);
            cache.set_max_pages(budget / page_size).await;
            json!({"mib": (cache.max_pages().await * page_size) >> 20})
        }
        Request::GetCacheSize => {
            json!({"mib": (cache.max_pages().await * cache.page_size().await) >> 20})
        }
    }
}

async fn send(stream: &mut UnixStream, response: &Value) -> io::Result<()> {
    let payload = serde_json::to_vec(response)?;
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await?;
    stream.write_all(&payload).await?;
    Ok(())
}
