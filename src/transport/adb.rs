//! [Transport] over the `adb` binary.
//!
//! Every call spawns one `adb` subprocess. Reads stream through
//! `adb exec-out dd` with byte-precise `skip`/`count` so only the requested
//! range crosses the wire; writes stream the payload into `adb shell dd`
//! with `conv=notrunc` so a page flush never truncates the file. Failures
//! are classified from adb's and the device shell's stderr diagnostics.

use super::Transport;
use crate::Error;
use bytes::Bytes;
use std::process::Stdio;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, trace};

const NO_DEVICE: &str = "adb: no devices/emulators found";
const DEVICE_OFFLINE: &str = "adb: device offline";

/// State of a device as reported by `adb devices`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Device,
    Offline,
    Unauthorized,
    Unknown,
}

/// One row of `adb devices`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    pub serial: String,
    pub state: DeviceState,
}

/// [Transport] implementation that drives the `adb` binary on the host.
#[derive(Clone, Debug, Default)]
pub struct Adb {
    serial: Option<String>,
}

impl Adb {
    /// Target whichever device adb resolves by default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Target the device with the given serial (`adb -s`).
    pub fn with_serial(serial: impl Into<String>) -> Self {
        Self {
            serial: Some(serial.into()),
        }
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    /// Make sure the adb server is running on the host.
    pub async fn start_server(&self) -> Result<(), Error> {
        self.exec(vec!["start-server".to_string()], None).await?;
        Ok(())
    }

    /// List devices attached to the bridge, so hosts can pick a serial
    /// before mounting.
    pub async fn devices(&self) -> Result<Vec<Device>, Error> {
        let out = self.exec(vec!["devices".to_string()], None).await?;
        Ok(parse_devices(&String::from_utf8_lossy(&out)))
    }

    /// Run one adb command, feeding `stdin` if given, and return its stdout.
    /// A non-zero exit classifies stderr into the error taxonomy.
    async fn exec(&self, args: Vec<String>, stdin: Option<Bytes>) -> Result<Vec<u8>, Error> {
        trace!(?args, "spawning adb");
        let mut command = Command::new("adb");
        if let Some(serial) = &self.serial {
            command.arg("-s").arg(serial);
        }
        command
            .args(&args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| Error::Io(err.to_string()))?;
        if let Some(payload) = stdin {
            let mut pipe = child.stdin.take().expect("stdin piped");
            pipe.write_all(&payload)
                .await
                .map_err(|err| Error::Io(err.to_string()))?;
            // Dropping the pipe closes the stream so dd sees end of input.
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| Error::Io(err.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let err = classify_stderr(&stderr);
            debug!(?args, %err, "adb failed");
            return Err(err);
        }
        Ok(output.stdout)
    }
}

impl Transport for Adb {
    async fn read(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>, Error> {
        let args = vec![
            "exec-out".to_string(),
            "dd".to_string(),
            "iflag=skip_bytes,count_bytes".to_string(),
            format!("skip={offset}"),
            format!("count={len}"),
            format!("if=\"{path}\""),
        ];
        let mut data = self.exec(args, None).await?;
        data.truncate(len);
        Ok(data)
    }

    async fn write(&self, path: &str, data: Bytes, offset: u64) -> Result<usize, Error> {
        let args = vec![
            "shell".to_string(),
            "dd".to_string(),
            "oflag=seek_bytes".to_string(),
            "conv=notrunc".to_string(),
            format!("seek={offset}"),
            format!("of=\"{path}\""),
        ];
        let written = data.len();
        // dd reports records, not bytes; everything fed to stdin is on the
        // device once it exits cleanly.
        self.exec(args, Some(data)).await?;
        Ok(written)
    }
}

fn parse_devices(out: &str) -> Vec<Device> {
    // First line is the "List of devices attached" banner.
    out.lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            let state = match fields.next()? {
                "device" => DeviceState::Device,
                "offline" => DeviceState::Offline,
                "unauthorized" => DeviceState::Unauthorized,
                _ => DeviceState::Unknown,
            };
            Some(Device {
                serial: serial.to_string(),
                state,
            })
        })
        .collect()
}

/// Map adb's stderr to the error taxonomy.
///
/// adb's own complaints (device gone) arrive as whole lines; the device
/// shell's diagnostics end with `<subject>: <reason>`, so the reason suffix
/// of the first such line decides.
fn classify_stderr(stderr: &str) -> Error {
    for line in stderr.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if line == NO_DEVICE
            || line == DEVICE_OFFLINE
            || (line.starts_with("adb: device '") && line.ends_with("' not found"))
        {
            return Error::Disconnected;
        }
        let Some((_, reason)) = line.rsplit_once(": ") else {
            continue;
        };
        return match reason {
            "No such file or directory" => Error::NotFound,
            "Permission denied" => Error::PermissionDenied,
            "Not a directory" => Error::NotADirectory,
            "Is a directory" => Error::IsADirectory,
            "File exists" => Error::AlreadyExists,
            "Directory not empty" => Error::DirectoryNotEmpty,
            "Invalid argument" => Error::InvalidArgument,
            _ => Error::Io(line.to_string()),
        };
    }
    Error::Io(stderr.trim().to_string())
}
