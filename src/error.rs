use thiserror::Error;

/// Errors surfaced by the cache and the transports it drains to.
///
/// Transport errors are forwarded unchanged: the cache neither retries nor
/// marks pages dead. A failed page fetch resolves every caller waiting on
/// that page with the same error, while pages of other keys are unaffected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("no such file or directory")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("file exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    /// The device dropped off the bridge (unplugged, offline, adb server
    /// restarted). Transient: a later call may succeed without any cache
    /// state having been torn down.
    #[error("device disconnected")]
    Disconnected,
    /// Anything the transport could not classify, carrying its diagnostic.
    #[error("i/o error: {0}")]
    Io(String),
}
