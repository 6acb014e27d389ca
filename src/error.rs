//! Error type for engine setup and configuration.
//!
//! Nothing in here is produced on the trap path: once a filter is attached,
//! failures of reissued syscalls are plain negative return values handed back
//! to the interrupted caller.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid rule for syscall {nr}: {reason}")]
    InvalidRule { nr: u32, reason: &'static str },

    #[error("filter needs {len} instructions, kernel limit is {max}")]
    FilterTooLarge { len: usize, max: usize },

    #[error("unknown syscall name: {0}")]
    UnknownSyscall(String),

    #[error("prctl(PR_SET_NO_NEW_PRIVS) failed: {0}")]
    NoNewPrivs(#[source] io::Error),

    #[error("prctl(PR_SET_SECCOMP) failed: {0}")]
    Attach(#[source] io::Error),

    #[error("failed to register SIGSYS handler: {0}")]
    Signal(#[from] nix::Error),

    #[error("config {}: {source}", path.display())]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("config {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("config {}: file exceeds {max} bytes", path.display())]
    ConfigTooLarge { path: PathBuf, max: usize },

    #[error("config: {0}")]
    Config(String),
}
