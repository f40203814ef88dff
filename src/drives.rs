//! A small set of mounted volumes addressed by `<digit>:` path
//! prefixes, with a current-drive default for prefix-less paths.

use core::fmt::Debug;

use crate::error::Error;
use crate::io::IO;
use crate::path::split_drive;
use crate::FatFs;

const MAX_DRIVES: usize = 4;

/// Drive table for hosts juggling several volumes of the same
/// device type. Single-volume users talk to [`FatFs`] directly.
pub struct Drives<D: IO> {
    slots: [Option<FatFs<D>>; MAX_DRIVES],
    current: usize,
}

impl<D: IO> Default for Drives<D> {
    fn default() -> Self {
        Self { slots: [None, None, None, None], current: 0 }
    }
}

impl<E: Debug, D: IO<Error = E>> Drives<D> {
    /// Bind a mounted volume to drive `index`.
    pub fn attach(&mut self, index: usize, fs: FatFs<D>) -> Result<(), Error<E>> {
        let slot = self.slots.get_mut(index).ok_or(Error::InvalidDrive)?;
        *slot = Some(fs);
        Ok(())
    }

    /// Unbind and return the volume at `index`.
    pub fn detach(&mut self, index: usize) -> Result<FatFs<D>, Error<E>> {
        let slot = self.slots.get_mut(index).ok_or(Error::InvalidDrive)?;
        slot.take().ok_or(Error::NotEnabled)
    }

    /// Make `index` the default for prefix-less paths.
    pub fn change_drive(&mut self, index: usize) -> Result<(), Error<E>> {
        match self.slots.get(index) {
            Some(Some(_)) => {
                self.current = index;
                Ok(())
            }
            Some(None) => Err(Error::NotEnabled),
            None => Err(Error::InvalidDrive),
        }
    }

    pub fn current_drive(&self) -> usize {
        self.current
    }

    /// Resolve a possibly prefixed path to its volume and the
    /// volume-local remainder.
    pub fn resolve<'a>(&self, path: &'a str) -> Result<(&FatFs<D>, &'a str), Error<E>> {
        let (drive, rest) = split_drive(path);
        let index = match drive {
            Some(digit) => digit as usize,
            None => self.current,
        };
        let slot = self.slots.get(index).ok_or(Error::InvalidDrive)?;
        match slot {
            Some(fs) => Ok((fs, rest)),
            None => Err(Error::NotEnabled),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::format::{mkfs, FormatOptions};
    use crate::io::mem::RamDisk;
    use crate::volume::MountOptions;
    use crate::OpenMode;

    fn mounted_fs() -> FatFs<RamDisk> {
        let mut disk = RamDisk::new(65536, 512);
        mkfs(&mut disk, &FormatOptions::default()).unwrap();
        FatFs::mount(disk, MountOptions::default()).unwrap()
    }

    #[test]
    fn prefixes_route_to_slots() {
        let mut drives = Drives::default();
        drives.attach(0, mounted_fs()).unwrap();
        drives.attach(1, mounted_fs()).unwrap();

        let (fs, rest) = drives.resolve("1:/on-one.txt").unwrap();
        assert_eq!(rest, "/on-one.txt");
        fs.open(rest, OpenMode::CREATE_NEW | OpenMode::WRITE).unwrap().close().unwrap();
        // Drive 0 does not see drive 1's file.
        let (fs, rest) = drives.resolve("0:/on-one.txt").unwrap();
        assert!(fs.stat(rest).is_err());

        drives.change_drive(1).unwrap();
        let (fs, rest) = drives.resolve("/on-one.txt").unwrap();
        assert!(fs.stat(rest).is_ok());
    }

    #[test]
    fn unbound_drives_are_reported() {
        let mut drives: Drives<RamDisk> = Drives::default();
        match drives.resolve("2:/x") {
            Err(Error::NotEnabled) => (),
            other => panic!("expected NotEnabled, got {:?}", other.map(|_| ())),
        }
        match drives.change_drive(9) {
            Err(Error::InvalidDrive) => (),
            other => panic!("expected InvalidDrive, got {:?}", other),
        }
        drives.attach(2, mounted_fs()).unwrap();
        assert!(drives.resolve("2:/x").is_ok());
        drives.detach(2).unwrap();
    }
}
