use core::fmt::{Display, Formatter, Result};

/// Result kind of every public operation, generic over the block
/// device's own error type.
#[derive(Debug)]
pub enum Error<E> {
    /// The block device reported an error; the device error is attached.
    Io(E),
    /// The device reported an error earlier and the handle has latched it.
    Disk,
    /// A structural invariant of the volume is violated (reserved
    /// cluster inside a chain, corrupted directory).
    IntErr,
    /// The device failed to initialize.
    NotReady,
    /// The terminal name of the path does not exist.
    NoFile,
    /// An intermediate name of the path does not exist.
    NoPath,
    /// The path is rejected by the name-syntax rules.
    InvalidName,
    /// Forbidden by attributes, a non-empty directory, or too many
    /// short-name collisions.
    Denied,
    /// The name already exists.
    Exist,
    /// The handle outlived its volume.
    InvalidObject,
    /// The device is write protected.
    WriteProtected,
    /// Unknown drive prefix.
    InvalidDrive,
    /// The drive number is not bound to a volume.
    NotEnabled,
    /// No FAT volume boot record was found.
    NoFilesystem,
    /// Formatting parameters are inconsistent with the volume.
    MkfsAborted,
    /// The volume lock was not granted in time.
    Timeout,
    /// Blocked by the open-file registry.
    Locked,
    /// A transient working buffer could not be provided.
    NotEnoughCore,
    /// The open-file registry is full.
    TooManyOpenFiles,
    InvalidParameter,
    NoSpaceLeft,
    NotPermitted,
    IsDirectory,
    NotDirectory,
    DirectoryNotEmpty,
}

impl<E: Display> Display for Error<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            Self::Io(e) => write!(f, "device error: {}", e),
            Self::Disk => write!(f, "device error latched on handle"),
            Self::IntErr => write!(f, "volume structure corrupted"),
            Self::NotReady => write!(f, "device not ready"),
            Self::NoFile => write!(f, "no such file"),
            Self::NoPath => write!(f, "no such path"),
            Self::InvalidName => write!(f, "invalid name"),
            Self::Denied => write!(f, "access denied"),
            Self::Exist => write!(f, "name already exists"),
            Self::InvalidObject => write!(f, "stale handle"),
            Self::WriteProtected => write!(f, "device write protected"),
            Self::InvalidDrive => write!(f, "invalid drive"),
            Self::NotEnabled => write!(f, "drive not bound"),
            Self::NoFilesystem => write!(f, "no FAT filesystem found"),
            Self::MkfsAborted => write!(f, "format aborted"),
            Self::Timeout => write!(f, "volume lock timeout"),
            Self::Locked => write!(f, "object locked by open handles"),
            Self::NotEnoughCore => write!(f, "working buffer too small"),
            Self::TooManyOpenFiles => write!(f, "open-file table full"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NoSpaceLeft => write!(f, "no space left on volume"),
            Self::NotPermitted => write!(f, "operation not permitted"),
            Self::IsDirectory => write!(f, "is a directory"),
            Self::NotDirectory => write!(f, "not a directory"),
            Self::DirectoryNotEmpty => write!(f, "directory not empty"),
        }
    }
}

#[cfg(feature = "std")]
impl<E: core::fmt::Debug + Display> std::error::Error for Error<E> {}

/// Fault class a file handle latches after a failed transfer. Every
/// later operation on the handle short-circuits with the same kind
/// until the handle is closed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Fault {
    Disk,
    Internal,
}

impl<E> From<Fault> for Error<E> {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::Disk => Error::Disk,
            Fault::Internal => Error::IntErr,
        }
    }
}
