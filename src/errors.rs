//! Error types for profiler operations

use std::io;

use nix::errno::Errno;
use thiserror::Error;

/// Result type for profiler operations
pub type Result<T> = std::result::Result<T, ProfileError>;

/// Errors that can occur while profiling or interposing on I/O
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("syscall error: {0}")]
    Syscall(Errno),

    #[error("buffer pool exhausted")]
    PoolExhausted,

    #[error("environment too large for exec ({0} entries)")]
    EnvTooLarge(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("target module not found: {0}")]
    ModuleNotFound(String),

    #[error("sample collector not initialized")]
    NotInitialized,

    #[error("sample collector already initialized")]
    AlreadyInitialized,
}

impl From<Errno> for ProfileError {
    fn from(errno: Errno) -> Self {
        ProfileError::Syscall(errno)
    }
}

impl ProfileError {
    /// Capture the current `errno` as a syscall error.
    pub fn last_os() -> Self {
        ProfileError::Syscall(Errno::last())
    }

    /// The raw `errno` value to report at a C ABI boundary.
    pub fn raw_os_error(&self) -> i32 {
        match self {
            ProfileError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            ProfileError::Syscall(errno) => *errno as i32,
            ProfileError::PoolExhausted => libc::ENOMEM,
            ProfileError::EnvTooLarge(_) => libc::E2BIG,
            _ => libc::EINVAL,
        }
    }
}
