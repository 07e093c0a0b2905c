//! Sandboxed filesystem for guest computers.
//!
//! ```text
//!  guest path ──normalize──► segments ──MountTable::resolve──► Resolved
//!                                          │   longest mount prefix,
//!                                          │   ties most-recent first
//!                                          ▼
//!                            Location::Real(PathBuf) | Location::Virtual{image, path}
//! ```
//!
//! Submodules:
//! - `path`: segment normalization and wildcard patterns
//! - `mount`: the per-computer mount table and resolution
//! - `virtual_fs`: in-memory read-only images
//! - `ops`: file operations layered on resolution (`SandboxFs`)

pub mod mount;
pub mod ops;
pub mod path;
pub mod virtual_fs;

pub use mount::{Backing, Location, MountInfo, MountTable, ResolveOptions, Resolved};
pub use ops::SandboxFs;
pub use path::{combine, normalize};
pub use virtual_fs::{VirtualEntry, VirtualId, VirtualRegistry};

/// Filesystem failures reported back to the guest.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("{0}: No such file")]
    NotFound(String),
    #[error("{0}: Access denied")]
    ReadOnly(String),
    #[error("{0}: Not a directory")]
    NotADirectory(String),
    #[error("{0}: Is a directory")]
    IsADirectory(String),
    #[error("{0}: File exists")]
    AlreadyExists(String),
    #[error("{0}: Cannot modify a mount point")]
    MountPoint(String),
    #[error("cannot mount at {path}: {reason}")]
    MountRejected { path: String, reason: String },
    #[error("{0}: Already mounted")]
    DuplicateMount(String),
    #[error("{0}: Not mounted")]
    NotMounted(String),
    #[error("{0}: Mount cannot be removed")]
    ProtectedMount(String),
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    /// Sandbox violations are always rejected locally and never fatal.
    pub fn is_sandbox_violation(&self) -> bool {
        matches!(
            self,
            FsError::ReadOnly(_) | FsError::MountPoint(_) | FsError::ProtectedMount(_)
        )
    }

    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        FsError::Io { path: path.into(), source }
    }
}
