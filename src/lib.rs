#![doc = include_str!("../README.md")]
#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[cfg(all(feature = "async", feature = "std", not(any(feature = "smol", feature = "tokio"))))]
compile_error!("Either smol or tokio must be selected");

extern crate alloc;

#[macro_use]
extern crate log;

mod clock;
mod codec;
pub mod codepage;
mod dir;
mod drives;
pub mod error;
mod fat;
mod file;
mod format;
mod fsops;
pub mod io;
mod path;
mod region;
mod registry;
mod sync;
mod types;
mod volume;

use core::fmt::Debug;

pub use clock::{ClockFn, Timestamp};
pub use dir::{Dir, FileInfo};
use dir::{DirCursor, NSFLAG, NS_NONAME};
use error::Error;
pub use file::{File, OpenMode, SeekFrom};
pub use format::{fdisk, mkfs, FormatKind, FormatOptions};
pub use region::dir::Attributes;
pub use drives::Drives;
use registry::Grant;
use sync::{acquire, shared, Shared};
pub use types::{FatType, SectorID};
use volume::Volume;
pub use volume::MountOptions;

/// A mounted FAT volume. All file, directory and volume operations
/// go through this handle; open [`File`] and [`Dir`] objects share
/// the volume record behind its mutex and survive until `unmount`
/// invalidates them.
pub struct FatFs<D: io::IO> {
    volume: Shared<Volume<D>>,
}

#[cfg_attr(not(feature = "async"), deasync::deasync)]
impl<E: Debug, D: io::IO<Error = E>> FatFs<D> {
    /// Mount a volume: locate the FAT boot record on the device,
    /// validate its geometry and load FSInfo when present.
    pub async fn mount(device: D, options: MountOptions) -> Result<Self, Error<E>> {
        let volume = Volume::mount(device, options).await?;
        Ok(Self { volume: shared(volume) })
    }

    /// Flush everything and invalidate all outstanding handles.
    /// The `FatFs` handle itself becomes inert.
    pub async fn unmount(&mut self) -> Result<(), Error<E>> {
        let mut volume = acquire!(self.volume);
        volume.sync_fs().await?;
        volume.registry.clear();
        volume.id = 0;
        Ok(())
    }

    /// Reclaim the block device. Fails with the handle unchanged
    /// while any file or directory handle is still alive.
    pub fn try_eject(self) -> Result<D, Self> {
        match Shared::try_unwrap(self.volume) {
            Ok(inner) => {
                let volume = match () {
                    #[cfg(all(feature = "sync", feature = "std", not(feature = "async")))]
                    () => inner.into_inner().unwrap(),
                    #[cfg(all(feature = "sync", any(not(feature = "std"), feature = "async")))]
                    () => inner.into_inner(),
                    #[cfg(not(feature = "sync"))]
                    () => inner.into_inner(),
                };
                Ok(volume.io.into_inner())
            }
            Err(volume) => Err(Self { volume }),
        }
    }

    fn check_mounted(volume: &Volume<D>) -> Result<(), Error<E>> {
        match volume.id {
            0 => Err(Error::InvalidObject),
            _ => Ok(()),
        }
    }

    /// Open a file. See [`OpenMode`] for the create/truncate/append
    /// variants.
    pub async fn open(&self, path: &str, mode: OpenMode) -> Result<File<E, D>, Error<E>> {
        {
            let volume = acquire!(self.volume);
            Self::check_mounted(&volume)?;
        }
        let path = Self::local_path(path)?;
        File::open(Shared::clone(&self.volume), path, mode).await
    }

    /// Open a directory for enumeration.
    pub async fn open_dir(&self, path: &str) -> Result<Dir<E, D>, Error<E>> {
        self.open_dir_filtered(path, None).await
    }

    /// Open a directory and return its first entry matching the
    /// glob `pattern` (`*` and `?`). Further matches come from
    /// [`Dir::read_entry`].
    pub async fn find_first(
        &self,
        path: &str,
        pattern: &str,
    ) -> Result<(Dir<E, D>, Option<FileInfo>), Error<E>> {
        let mut dir = self
            .open_dir_filtered(path, Some(alloc::string::String::from(pattern)))
            .await?;
        let first = dir.read_entry().await?;
        Ok((dir, first))
    }

    async fn open_dir_filtered(
        &self,
        path: &str,
        pattern: Option<alloc::string::String>,
    ) -> Result<Dir<E, D>, Error<E>> {
        let mut volume = acquire!(self.volume);
        Self::check_mounted(&volume)?;
        let path = Self::local_path(path)?;
        let mut dj = DirCursor::new(0);
        match volume.follow_path(&mut dj, path).await {
            Ok(()) => (),
            Err(Error::NoFile) => return Err(Error::NoPath),
            Err(e) => return Err(e),
        }
        let mut lock_slot = None;
        if dj.fname[NSFLAG] & NS_NONAME != 0 {
            // The path names a directory origin (e.g. the root).
        } else if dj.attr & 0x10 == 0 {
            return Err(Error::NotDirectory);
        } else {
            let sect = match dj.sect {
                Some(sect) => sect,
                None => return Err(Error::IntErr),
            };
            volume.move_window(sect).await?;
            let offset = dj.entry_offset(volume.ssize());
            let cluster = {
                let entry = &volume.win()[offset..offset + 32];
                region::dir::load_cluster(entry, volume.fs_type)
            };
            match volume.registry.open(dj.sclust, dj.dptr, false) {
                Grant::Opened(slot) => lock_slot = Some(slot),
                Grant::Locked => return Err(Error::Locked),
                Grant::Full => return Err(Error::TooManyOpenFiles),
            }
            dj.sclust = cluster;
        }
        let mut cursor = DirCursor::new(dj.sclust);
        volume.dir_sdi(&mut cursor, 0).await?;
        Ok(Dir {
            volume: Shared::clone(&self.volume),
            id: volume.id,
            cursor,
            pattern,
            lock_slot,
            closed: false,
        })
    }

    /// Accepts plain paths and the `0:` drive prefix; any other
    /// drive digit belongs to a [`Drives`] set, not a single volume.
    fn local_path(path: &str) -> Result<&str, Error<E>> {
        match path::split_drive(path) {
            (None, rest) | (Some(0), rest) => Ok(rest),
            (Some(_), _) => Err(Error::InvalidDrive),
        }
    }

    /// FAT sub-type the mount classified.
    pub async fn fat_type(&self) -> FatType {
        let volume = acquire!(self.volume);
        volume.fs_type
    }

    /// Volume serial number recorded in the boot record.
    pub async fn serial_number(&self) -> u32 {
        let volume = acquire!(self.volume);
        volume.vsn
    }
}
