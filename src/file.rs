//! The file engine: open contract, buffered read/write with a
//! direct multi-sector fast path, seek with on-the-fly chain
//! extension, truncate, contiguous preallocation and sync.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt::Debug;

use log::{debug, trace};

use crate::codec::store_u32;
use crate::dir::{DirCursor, NSFLAG, NS_NONAME};
use crate::error::{Error, Fault};
use crate::fat::clmt_cluster;
use crate::io::IO;
use crate::region::dir::{
    load_cluster, load_file_size, store_cluster, store_file_size, DIR_ATTR, DIR_CRT_TIME,
    DIR_LST_ACC_DATE, DIR_MOD_TIME,
};
use crate::registry::Grant;
use crate::sync::{acquire, Shared};
use crate::types::SectorID;
use crate::volume::Volume;

/// Access and behavior bits for [`File`] opening.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct OpenMode(u8);

impl OpenMode {
    pub const READ: Self = Self(0x01);
    pub const WRITE: Self = Self(0x02);
    /// Fail with `Exist` when the file already exists.
    pub const CREATE_NEW: Self = Self(0x04);
    /// Truncate an existing file, create a missing one.
    pub const CREATE_ALWAYS: Self = Self(0x08);
    /// Create the file when missing, open it otherwise.
    pub const OPEN_ALWAYS: Self = Self(0x10);
    /// Position the file pointer at the end after opening.
    pub const SEEK_TO_END: Self = Self(0x20);
    /// Open or create and continue at the end.
    pub const OPEN_APPEND: Self = Self(0x30);

    fn contains(self, bits: Self) -> bool {
        self.0 & bits.0 != 0
    }
}

impl core::ops::BitOr for OpenMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SeekFrom {
    Start(u32),
    End(i64),
    Current(i64),
}

// Internal state bits sharing the flag byte with the mode.
const FLAG_MODIFIED: u8 = 0x40;
const FLAG_DIRTY: u8 = 0x80;

fn fault_of<E>(error: &Error<E>) -> Option<Fault> {
    match error {
        Error::Io(_) | Error::Disk => Some(Fault::Disk),
        Error::IntErr => Some(Fault::Internal),
        _ => None,
    }
}

/// Classify and latch an error before propagating it.
macro_rules! latch {
    ($self:ident, $expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(e) => {
                if let Some(fault) = fault_of(&e) {
                    $self.err = Some(fault);
                }
                return Err(e);
            }
        }
    };
}

/// An open file. The handle owns a private sector buffer; all
/// volume-shared state is reached through the mutex-protected
/// volume record.
pub struct File<E: Debug, D: IO<Error = E>> {
    pub(crate) volume: Shared<Volume<D>>,
    pub(crate) id: u32,
    flag: u8,
    err: Option<Fault>,
    fptr: u32,
    clust: u32,
    sect: Option<SectorID>,
    buf: Vec<u8>,
    dir_sect: SectorID,
    dir_ofs: usize,
    sclust: u32,
    objsize: u32,
    clmt: Option<Vec<u32>>,
    lock_slot: Option<usize>,
    closed: bool,
}

#[cfg_attr(not(feature = "async"), deasync::deasync)]
impl<E: Debug, D: IO<Error = E>> File<E, D> {
    pub(crate) async fn open(
        shared: Shared<Volume<D>>,
        path: &str,
        mode: OpenMode,
    ) -> Result<Self, Error<E>> {
        let write = mode.contains(
            OpenMode::WRITE | OpenMode::CREATE_ALWAYS | OpenMode::CREATE_NEW | OpenMode::OPEN_ALWAYS,
        );
        let mut volume = acquire!(shared);
        if write && volume.io.write_protected() {
            return Err(Error::WriteProtected);
        }
        let mut dj = DirCursor::new(0);
        let mut found = volume.follow_path(&mut dj, path).await;
        if found.is_ok() {
            if dj.fname[NSFLAG] & NS_NONAME != 0 {
                return Err(Error::InvalidName);
            }
            if !volume.registry.openable(dj.sclust, dj.dptr, write) {
                return Err(Error::Locked);
            }
        }
        let mut created = false;
        if mode.contains(OpenMode::CREATE_ALWAYS | OpenMode::CREATE_NEW | OpenMode::OPEN_ALWAYS) {
            match found {
                Err(Error::NoFile) => {
                    volume.dir_register(&mut dj).await?;
                    created = true;
                    found = Ok(());
                }
                Err(e) => return Err(e),
                Ok(()) => {
                    if dj.attr & 0x10 != 0 {
                        return Err(Error::IsDirectory);
                    }
                    if dj.attr & 0x01 != 0 {
                        return Err(Error::Denied);
                    }
                    if mode.contains(OpenMode::CREATE_NEW) {
                        return Err(Error::Exist);
                    }
                }
            }
            if !created && mode.contains(OpenMode::CREATE_ALWAYS) {
                // Overwrite: reset the entry and release the chain.
                let stamp = volume.now().raw();
                let sect = match dj.sect {
                    Some(sect) => sect,
                    None => return Err(Error::IntErr),
                };
                volume.move_window(sect).await?;
                let offset = dj.entry_offset(volume.ssize());
                let fs_type = volume.fs_type;
                let window = volume.win_mut();
                let entry = &mut window[offset..offset + 32];
                store_u32(&mut entry[DIR_CRT_TIME..], stamp);
                store_u32(&mut entry[DIR_MOD_TIME..], stamp);
                entry[DIR_ATTR] = 0x20;
                let cluster = load_cluster(entry, fs_type);
                store_cluster(entry, 0);
                store_file_size(entry, 0);
                if cluster != 0 {
                    volume.remove_chain(cluster, 0).await?;
                    volume.move_window(sect).await?;
                    // Reuse the hole for the next allocation scan.
                    volume.last_clst = cluster - 1;
                }
                created = true;
            }
        } else {
            found?;
            if dj.fname[NSFLAG] & NS_NONAME != 0 {
                return Err(Error::InvalidName);
            }
            if dj.attr & 0x10 != 0 {
                return Err(Error::IsDirectory);
            }
            if mode.contains(OpenMode::WRITE) && dj.attr & 0x01 != 0 {
                return Err(Error::Denied);
            }
        }
        if created {
            let stamp = volume.now().raw();
            let sect = match dj.sect {
                Some(sect) => sect,
                None => return Err(Error::IntErr),
            };
            volume.move_window(sect).await?;
            let offset = dj.entry_offset(volume.ssize());
            let entry = &mut volume.win_mut()[offset..offset + 32];
            if entry[DIR_ATTR] == 0 {
                entry[DIR_ATTR] = 0x20;
                store_u32(&mut entry[DIR_CRT_TIME..], stamp);
                store_u32(&mut entry[DIR_MOD_TIME..], stamp);
            }
        }
        let sect = match dj.sect {
            Some(sect) => sect,
            None => return Err(Error::IntErr),
        };
        volume.move_window(sect).await?;
        let offset = dj.entry_offset(volume.ssize());
        let entry = &volume.win()[offset..offset + 32];
        let sclust = load_cluster(entry, volume.fs_type);
        let objsize = load_file_size(entry);
        let slot = match volume.registry.open(dj.sclust, dj.dptr, write) {
            Grant::Opened(slot) => slot,
            Grant::Locked => return Err(Error::Locked),
            Grant::Full => return Err(Error::TooManyOpenFiles),
        };
        let mut file = Self {
            id: volume.id,
            flag: mode.0 | if created { FLAG_MODIFIED } else { 0 },
            err: None,
            fptr: 0,
            clust: 0,
            sect: None,
            buf: vec![0u8; volume.ssize()],
            dir_sect: sect,
            dir_ofs: offset,
            sclust,
            objsize,
            clmt: None,
            lock_slot: Some(slot),
            closed: false,
            volume: Shared::clone(&shared),
        };
        if mode.contains(OpenMode::SEEK_TO_END) && file.objsize > 0 {
            file.fptr = file.objsize;
            let cluster_bytes = volume.cluster_bytes();
            let mut cluster = file.sclust;
            let mut remaining = file.objsize;
            while remaining > cluster_bytes {
                cluster = match volume.get_fat(cluster).await {
                    Ok(next) if volume.valid_cluster(next) => next,
                    Ok(_) => {
                        volume.registry.close(slot);
                        return Err(Error::IntErr);
                    }
                    Err(e) => {
                        volume.registry.close(slot);
                        return Err(e);
                    }
                };
                remaining -= cluster_bytes;
            }
            file.clust = cluster;
            if remaining % volume.ss as u32 != 0 {
                let sect = volume.clst2sect(cluster) + remaining as u64 / volume.ss as u64;
                if let Err(e) = volume.io.read(sect, &mut file.buf).await {
                    volume.registry.close(slot);
                    return Err(e);
                }
                file.sect = Some(sect);
            }
        }
        trace!("opened {:?}: cluster {}, {} bytes", path, sclust, objsize);
        Ok(file)
    }

    fn check(&self, volume: &Volume<D>) -> Result<(), Error<E>> {
        if volume.id != self.id {
            return Err(Error::InvalidObject);
        }
        match self.err {
            Some(fault) => Err(fault.into()),
            None => Ok(()),
        }
    }

    pub fn size(&self) -> u32 {
        self.objsize
    }

    pub fn tell(&self) -> u32 {
        self.fptr
    }

    pub fn eof(&self) -> bool {
        self.fptr >= self.objsize
    }

    /// Read into `buf`, returning the number of bytes read; 0 means
    /// end of file.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error<E>> {
        let mut volume = acquire!(self.volume);
        self.check(&volume)?;
        if !OpenMode(self.flag).contains(OpenMode::READ) {
            return Err(Error::Denied);
        }
        let remain = (self.objsize - self.fptr) as usize;
        let mut btr = core::cmp::min(buf.len(), remain);
        let total = btr;
        let ss = volume.ssize();
        let mut out = 0usize;
        while btr > 0 {
            if self.fptr as usize % ss == 0 {
                let csect = (self.fptr / volume.ss as u32) & (volume.csize as u32 - 1);
                if csect == 0 {
                    // Cluster boundary: follow the chain or the map.
                    let cluster = if self.fptr == 0 {
                        self.sclust
                    } else {
                        match &self.clmt {
                            Some(map) => {
                                match clmt_cluster(map, volume.cluster_bytes(), self.fptr) {
                                    Some(cluster) => cluster,
                                    None => {
                                        self.err = Some(Fault::Internal);
                                        return Err(Error::IntErr);
                                    }
                                }
                            }
                            None => {
                                let fat = volume.get_fat(self.clust).await;
                                latch!(self, fat)
                            }
                        }
                    };
                    if !volume.valid_cluster(cluster) {
                        self.err = Some(Fault::Internal);
                        return Err(Error::IntErr);
                    }
                    self.clust = cluster;
                }
                let sect = volume.clst2sect(self.clust) + csect as u64;
                let mut cc = btr / ss;
                if cc > 0 {
                    // Whole sectors go straight to the caller buffer.
                    if csect as usize + cc > volume.csize as usize {
                        cc = volume.csize as usize - csect as usize;
                    }
                    let res = volume.io.read(sect, &mut buf[out..out + cc * ss]).await;
                    latch!(self, res);
                    // A dirty cached copy wins over what the device
                    // returned, preserving read-your-writes.
                    if volume.window_dirty() {
                        if let Some(winsect) = volume.window_sector() {
                            if winsect >= sect && winsect - sect < cc as u64 {
                                let at = out + (winsect - sect) as usize * ss;
                                buf[at..at + ss].copy_from_slice(volume.win());
                            }
                        }
                    }
                    if self.flag & FLAG_DIRTY != 0 {
                        if let Some(own) = self.sect {
                            if own >= sect && own - sect < cc as u64 {
                                let at = out + (own - sect) as usize * ss;
                                buf[at..at + ss].copy_from_slice(&self.buf);
                            }
                        }
                    }
                    let count = cc * ss;
                    self.fptr += count as u32;
                    btr -= count;
                    out += count;
                    continue;
                }
                if self.sect != Some(sect) {
                    if self.flag & FLAG_DIRTY != 0 {
                        let own = match self.sect {
                            Some(own) => own,
                            None => return Err(Error::IntErr),
                        };
                        let res = volume.io.write(own, &self.buf).await;
                        latch!(self, res);
                        self.flag &= !FLAG_DIRTY;
                    }
                    let res = volume.io.read(sect, &mut self.buf).await;
                    latch!(self, res);
                }
                self.sect = Some(sect);
            }
            let offset = self.fptr as usize % ss;
            let count = core::cmp::min(ss - offset, btr);
            buf[out..out + count].copy_from_slice(&self.buf[offset..offset + count]);
            self.fptr += count as u32;
            btr -= count;
            out += count;
        }
        Ok(total)
    }

    /// Write from `buf`, returning the number of bytes written. A
    /// full volume yields a short count; writing at the 4 GiB file
    /// size limit clips.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, Error<E>> {
        let mut volume = acquire!(self.volume);
        self.check(&volume)?;
        if !OpenMode(self.flag).contains(OpenMode::WRITE) {
            return Err(Error::Denied);
        }
        // FAT caps a file at 4 GiB - 1.
        let mut btw = core::cmp::min(buf.len() as u64, (u32::MAX - self.fptr) as u64) as usize;
        let ss = volume.ssize();
        let mut consumed = 0usize;
        while btw > 0 {
            if self.fptr as usize % ss == 0 {
                let csect = (self.fptr / volume.ss as u32) & (volume.csize as u32 - 1);
                if csect == 0 {
                    let cluster = if self.fptr == 0 {
                        match self.sclust {
                            0 => match volume.create_chain(0).await {
                                Ok(cluster) => cluster,
                                Err(Error::NoSpaceLeft) => break,
                                Err(e) => latch!(self, Err(e)),
                            },
                            cluster => cluster,
                        }
                    } else {
                        match &self.clmt {
                            Some(map) => {
                                match clmt_cluster(map, volume.cluster_bytes(), self.fptr) {
                                    Some(cluster) => cluster,
                                    None => {
                                        self.err = Some(Fault::Internal);
                                        return Err(Error::IntErr);
                                    }
                                }
                            }
                            None => match volume.create_chain(self.clust).await {
                                Ok(cluster) => cluster,
                                Err(Error::NoSpaceLeft) => break,
                                Err(e) => latch!(self, Err(e)),
                            },
                        }
                    };
                    if !volume.valid_cluster(cluster) {
                        self.err = Some(Fault::Internal);
                        return Err(Error::IntErr);
                    }
                    self.clust = cluster;
                    if self.sclust == 0 {
                        self.sclust = cluster;
                    }
                }
                if self.flag & FLAG_DIRTY != 0 {
                    let own = match self.sect {
                        Some(own) => own,
                        None => return Err(Error::IntErr),
                    };
                    let res = volume.io.write(own, &self.buf).await;
                    latch!(self, res);
                    self.flag &= !FLAG_DIRTY;
                }
                let sect = volume.clst2sect(self.clust) + csect as u64;
                let mut cc = btw / ss;
                if cc > 0 {
                    if csect as usize + cc > volume.csize as usize {
                        cc = volume.csize as usize - csect as usize;
                    }
                    let span = &buf[consumed..consumed + cc * ss];
                    let res = volume.io.write(sect, span).await;
                    latch!(self, res);
                    if let Some(winsect) = volume.window_sector() {
                        if winsect >= sect && winsect - sect < cc as u64 {
                            // The window now mirrors freshly written
                            // data; it is clean by definition.
                            let at = (winsect - sect) as usize * ss;
                            volume.overlay_window(&span[at..at + ss]);
                        }
                    }
                    if let Some(own) = self.sect {
                        if own >= sect && own - sect < cc as u64 {
                            let at = (own - sect) as usize * ss;
                            self.buf.copy_from_slice(&span[at..at + ss]);
                            self.flag &= !FLAG_DIRTY;
                        }
                    }
                    let count = cc * ss;
                    self.fptr += count as u32;
                    btw -= count;
                    consumed += count;
                    self.flag |= FLAG_MODIFIED;
                    if self.fptr > self.objsize {
                        self.objsize = self.fptr;
                    }
                    continue;
                }
                if self.sect != Some(sect) && self.fptr < self.objsize {
                    // Partial write over existing content: fetch the
                    // sector first so untouched bytes survive.
                    let res = volume.io.read(sect, &mut self.buf).await;
                    latch!(self, res);
                }
                self.sect = Some(sect);
            }
            let offset = self.fptr as usize % ss;
            let count = core::cmp::min(ss - offset, btw);
            self.buf[offset..offset + count].copy_from_slice(&buf[consumed..consumed + count]);
            self.flag |= FLAG_DIRTY | FLAG_MODIFIED;
            self.fptr += count as u32;
            btw -= count;
            consumed += count;
            if self.fptr > self.objsize {
                self.objsize = self.fptr;
            }
        }
        if consumed == 0 && !buf.is_empty() {
            return Err(Error::NoSpaceLeft);
        }
        Ok(consumed)
    }

    pub async fn write_all(&mut self, mut buf: &[u8]) -> Result<(), Error<E>> {
        while !buf.is_empty() {
            let written = self.write(buf).await?;
            buf = &buf[written..];
        }
        Ok(())
    }

    /// Move the file pointer. In write mode seeking past the end
    /// extends the chain; in read mode the target clips to the file
    /// size. With a link map attached the seek is O(runs) and never
    /// extends.
    pub async fn seek(&mut self, from: SeekFrom) -> Result<u32, Error<E>> {
        let target = match from {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => u32::try_from(self.objsize as i64 + delta).ok(),
            SeekFrom::Current(delta) => u32::try_from(self.fptr as i64 + delta).ok(),
        };
        let mut ofs = match target {
            Some(ofs) => ofs,
            None => return Err(Error::InvalidParameter),
        };
        let mut volume = acquire!(self.volume);
        self.check(&volume)?;
        let ss = volume.ssize();
        if let Some(map) = &self.clmt {
            // Fast mode: table lookup, no chain walking.
            if ofs > self.objsize {
                ofs = self.objsize;
            }
            self.fptr = ofs;
            if ofs > 0 {
                let cluster = match clmt_cluster(map, volume.cluster_bytes(), ofs - 1) {
                    Some(cluster) => cluster,
                    None => {
                        self.err = Some(Fault::Internal);
                        return Err(Error::IntErr);
                    }
                };
                self.clust = cluster;
                if ofs as usize % ss != 0 {
                    let sect = volume.clst2sect(cluster)
                        + ((ofs - 1) as u64 % volume.cluster_bytes() as u64) / ss as u64;
                    if self.sect != Some(sect) {
                        if self.flag & FLAG_DIRTY != 0 {
                            let own = match self.sect {
                                Some(own) => own,
                                None => return Err(Error::IntErr),
                            };
                            let res = volume.io.write(own, &self.buf).await;
                            latch!(self, res);
                            self.flag &= !FLAG_DIRTY;
                        }
                        let res = volume.io.read(sect, &mut self.buf).await;
                        latch!(self, res);
                        self.sect = Some(sect);
                    }
                }
            }
            return Ok(self.fptr);
        }
        let writable = OpenMode(self.flag).contains(OpenMode::WRITE);
        if ofs > self.objsize && !writable {
            ofs = self.objsize;
        }
        let was = self.fptr;
        self.fptr = 0;
        if ofs > 0 {
            let cluster_bytes = volume.cluster_bytes();
            let mut cluster;
            if was > 0 && (ofs - 1) / cluster_bytes >= (was - 1) / cluster_bytes {
                // Forward seek inside or past the current cluster:
                // resume from where the handle already is.
                self.fptr = (was - 1) & !(cluster_bytes - 1);
                ofs -= self.fptr;
                cluster = self.clust;
            } else {
                cluster = self.sclust;
                if cluster == 0 {
                    if !writable {
                        self.fptr = 0;
                        return Ok(0);
                    }
                    let created = volume.create_chain(0).await;
                    cluster = latch!(self, created);
                    self.sclust = cluster;
                }
                self.clust = cluster;
            }
            if cluster != 0 {
                while ofs > cluster_bytes {
                    ofs -= cluster_bytes;
                    self.fptr += cluster_bytes;
                    if writable {
                        // Stretch the chain to cover the seek target.
                        cluster = match volume.create_chain(cluster).await {
                            Ok(next) => next,
                            Err(Error::NoSpaceLeft) => {
                                ofs = 0;
                                break;
                            }
                            Err(e) => latch!(self, Err(e)),
                        };
                    } else {
                        let fat = volume.get_fat(cluster).await;
                        cluster = latch!(self, fat);
                        if !volume.valid_cluster(cluster) {
                            self.err = Some(Fault::Internal);
                            return Err(Error::IntErr);
                        }
                    }
                    self.clust = cluster;
                }
                self.fptr += ofs;
                if ofs as usize % ss != 0 {
                    let sect = volume.clst2sect(self.clust) + ofs as u64 / ss as u64;
                    if self.sect != Some(sect) {
                        if self.flag & FLAG_DIRTY != 0 {
                            let own = match self.sect {
                                Some(own) => own,
                                None => return Err(Error::IntErr),
                            };
                            let res = volume.io.write(own, &self.buf).await;
                            latch!(self, res);
                            self.flag &= !FLAG_DIRTY;
                        }
                        let res = volume.io.read(sect, &mut self.buf).await;
                        latch!(self, res);
                        self.sect = Some(sect);
                    }
                }
            }
        }
        if self.fptr > self.objsize {
            self.objsize = self.fptr;
            self.flag |= FLAG_MODIFIED;
        }
        Ok(self.fptr)
    }

    /// Shrink the file to `size` bytes.
    pub async fn truncate(&mut self, size: u32) -> Result<(), Error<E>> {
        let mut volume = acquire!(self.volume);
        self.check(&volume)?;
        if !OpenMode(self.flag).contains(OpenMode::WRITE) {
            return Err(Error::Denied);
        }
        if size > self.objsize {
            return Err(Error::InvalidParameter);
        }
        if size == self.objsize {
            return Ok(());
        }
        if self.flag & FLAG_DIRTY != 0 {
            let own = match self.sect {
                Some(own) => own,
                None => return Err(Error::IntErr),
            };
            let res = volume.io.write(own, &self.buf).await;
            latch!(self, res);
            self.flag &= !FLAG_DIRTY;
        }
        if size == 0 {
            if self.sclust != 0 {
                let res = volume.remove_chain(self.sclust, 0).await;
                latch!(self, res);
                self.sclust = 0;
            }
            self.clust = 0;
            self.fptr = 0;
            self.sect = None;
        } else {
            let cluster_bytes = volume.cluster_bytes();
            let mut last = self.sclust;
            let mut walked = cluster_bytes;
            while walked < size {
                let fat = volume.get_fat(last).await;
                last = latch!(self, fat);
                if !volume.valid_cluster(last) {
                    self.err = Some(Fault::Internal);
                    return Err(Error::IntErr);
                }
                walked += cluster_bytes;
            }
            let fat = volume.get_fat(last).await;
            let next = latch!(self, fat);
            if volume.valid_cluster(next) {
                // Stamp EOC at the covering cluster, free the tail.
                let res = volume.remove_chain(next, last).await;
                latch!(self, res);
            }
            if self.fptr > size {
                self.fptr = size;
                self.clust = last;
                self.sect = None;
            }
        }
        self.objsize = size;
        self.flag |= FLAG_MODIFIED;
        debug!("truncated to {} bytes", size);
        Ok(())
    }

    /// Preallocate `size` bytes as one contiguous run. The file must
    /// be empty and writable. With `commit` false the run is only
    /// located and recorded as the next-allocation hint.
    pub async fn expand(&mut self, size: u32, commit: bool) -> Result<(), Error<E>> {
        let mut volume = acquire!(self.volume);
        self.check(&volume)?;
        if size == 0 || self.objsize != 0 || !OpenMode(self.flag).contains(OpenMode::WRITE) {
            return Err(Error::Denied);
        }
        let cluster_bytes = volume.cluster_bytes();
        let needed = (size as u64 + cluster_bytes as u64 - 1) / cluster_bytes as u64;
        let needed = u32::try_from(needed).map_err(|_| Error::InvalidParameter)?;
        let start = match volume.last_clst {
            c if volume.valid_cluster(c) => c,
            _ => 2,
        };
        let mut scl = start;
        let mut ncl = 0u32;
        let mut clst = start;
        let run = loop {
            let fat = volume.get_fat(clst).await;
            let cell = latch!(self, fat);
            if cell == 0 {
                ncl += 1;
                if ncl == needed {
                    break scl;
                }
            } else {
                if cell == 1 {
                    self.err = Some(Fault::Internal);
                    return Err(Error::IntErr);
                }
                scl = clst + 1;
                ncl = 0;
            }
            let probed = clst;
            clst += 1;
            if clst >= volume.n_fatent {
                // A run cannot span the wrap back to cluster 2.
                clst = 2;
                scl = 2;
                ncl = 0;
            }
            if probed != start && clst == start {
                return Err(Error::NoSpaceLeft);
            }
        };
        if commit {
            for (index, cluster) in (run..run + needed).enumerate() {
                let value = match index as u32 == needed - 1 {
                    true => volume.fs_type.eoc(),
                    false => cluster + 1,
                };
                let res = volume.put_fat(cluster, value).await;
                latch!(self, res);
            }
            self.sclust = run;
            self.objsize = size;
            self.flag |= FLAG_MODIFIED;
            volume.last_clst = run + needed - 1;
            if volume.free_clst != crate::region::boot::FREE_COUNT_UNKNOWN {
                volume.free_clst -= needed;
            }
            volume.touch_fsinfo();
        } else {
            // Park the allocation hint just before the found run.
            volume.last_clst = run - 1;
        }
        debug!("expand: run of {} clusters at {}", needed, run);
        Ok(())
    }

    /// Build a cluster link map into the caller's table and attach
    /// it, enabling O(runs) seeks. See [`Volume::build_link_map`]
    /// for the table layout and sizing contract.
    pub async fn create_link_map(&mut self, table: &mut [u32]) -> Result<(), Error<E>> {
        let mut volume = acquire!(self.volume);
        self.check(&volume)?;
        volume.build_link_map(self.sclust, table).await?;
        self.clmt = Some(table.to_vec());
        Ok(())
    }

    /// Build and attach a link map sized automatically.
    pub async fn fast_seek(&mut self) -> Result<(), Error<E>> {
        let mut volume = acquire!(self.volume);
        self.check(&volume)?;
        let mut table = vec![0u32; 16];
        loop {
            match volume.build_link_map(self.sclust, &mut table).await {
                Ok(()) => break,
                Err(Error::NotEnoughCore) => {
                    let required = table[0] as usize;
                    table = vec![0u32; required];
                }
                Err(e) => return Err(e),
            }
        }
        self.clmt = Some(table);
        Ok(())
    }

    pub fn disable_fast_seek(&mut self) {
        self.clmt = None;
    }

    /// Flush the handle's cache and write the directory entry back:
    /// archive bit, start cluster, size and modified stamp.
    pub async fn sync(&mut self) -> Result<(), Error<E>> {
        let mut volume = acquire!(self.volume);
        self.check(&volume)?;
        if self.flag & FLAG_MODIFIED == 0 {
            return Ok(());
        }
        if self.flag & FLAG_DIRTY != 0 {
            let own = match self.sect {
                Some(own) => own,
                None => return Err(Error::IntErr),
            };
            let res = volume.io.write(own, &self.buf).await;
            latch!(self, res);
            self.flag &= !FLAG_DIRTY;
        }
        let stamp = volume.now().raw();
        volume.move_window(self.dir_sect).await?;
        let offset = self.dir_ofs;
        let (sclust, objsize) = (self.sclust, self.objsize);
        let entry = &mut volume.win_mut()[offset..offset + 32];
        entry[DIR_ATTR] |= 0x20;
        store_cluster(entry, sclust);
        store_file_size(entry, objsize);
        store_u32(&mut entry[DIR_MOD_TIME..], stamp);
        crate::codec::store_u16(&mut entry[DIR_LST_ACC_DATE..], 0);
        self.flag &= !FLAG_MODIFIED;
        volume.sync_fs().await
    }

    /// Sync and release the handle. Errors only surface here, never
    /// in `Drop`.
    pub async fn close(mut self) -> Result<(), Error<E>> {
        self.closed = true;
        let result = match OpenMode(self.flag).contains(OpenMode::WRITE) {
            true => self.sync().await,
            false => Ok(()),
        };
        let mut volume = acquire!(self.volume);
        if volume.id == self.id {
            if let Some(slot) = self.lock_slot.take() {
                volume.registry.close(slot);
            }
        }
        result
    }

    /// Read one line, up to and including `\n`. The content is an
    /// opaque byte stream; the collected line is decoded as UTF-8
    /// once, lossily.
    pub async fn read_line(&mut self, line: &mut String) -> Result<usize, Error<E>> {
        let mut raw: Vec<u8> = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if self.read(&mut byte).await? == 0 {
                break;
            }
            raw.push(byte[0]);
            if byte[0] == b'\n' {
                break;
            }
        }
        line.push_str(&String::from_utf8_lossy(&raw));
        Ok(raw.len())
    }

    pub async fn write_str(&mut self, s: &str) -> Result<(), Error<E>> {
        self.write_all(s.as_bytes()).await
    }

    pub async fn write_char(&mut self, ch: char) -> Result<(), Error<E>> {
        let mut encoded = [0u8; 4];
        self.write_all(ch.encode_utf8(&mut encoded).as_bytes()).await
    }
}

impl<E: Debug, D: IO<Error = E>> Drop for File<E, D> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        match () {
            #[cfg(feature = "async")]
            () => log::warn!("file handle dropped without close"),
            #[cfg(not(feature = "async"))]
            () => {
                if OpenMode(self.flag).contains(OpenMode::WRITE) && self.err.is_none() {
                    self.sync().ok();
                }
                let mut volume = acquire!(self.volume);
                if volume.id == self.id {
                    if let Some(slot) = self.lock_slot.take() {
                        volume.registry.close(slot);
                    }
                }
            }
        }
    }
}

#[cfg(all(feature = "std", not(feature = "async")))]
impl<E: Debug, D: IO<Error = E>> std::io::Read for File<E, D> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        File::read(self, buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, alloc::format!("{:?}", e)))
    }
}

#[cfg(all(feature = "std", not(feature = "async")))]
impl<E: Debug, D: IO<Error = E>> std::io::Write for File<E, D> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        File::write(self, buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, alloc::format!("{:?}", e)))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.sync().map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, alloc::format!("{:?}", e)))
    }
}

#[cfg(all(feature = "std", not(feature = "async")))]
impl<E: Debug, D: IO<Error = E>> std::io::Seek for File<E, D> {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        let from = match pos {
            std::io::SeekFrom::Start(ofs) => SeekFrom::Start(ofs as u32),
            std::io::SeekFrom::End(delta) => SeekFrom::End(delta),
            std::io::SeekFrom::Current(delta) => SeekFrom::Current(delta),
        };
        File::seek(self, from)
            .map(|ofs| ofs as u64)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, alloc::format!("{:?}", e)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::format::{mkfs, FormatOptions};
    use crate::io::mem::RamDisk;
    use crate::sync::shared;
    use crate::volume::MountOptions;

    fn fresh_volume(sectors: u64) -> Shared<Volume<RamDisk>> {
        let mut disk = RamDisk::new(sectors, 512);
        mkfs(&mut disk, &FormatOptions::default()).unwrap();
        shared(Volume::mount(disk, MountOptions::default()).unwrap())
    }

    fn fat32_volume() -> Shared<Volume<RamDisk>> {
        let mut disk = RamDisk::new(70000, 512);
        let options = FormatOptions {
            kind: crate::format::FormatKind::Fat32,
            cluster_size: 512,
            ..Default::default()
        };
        mkfs(&mut disk, &options).unwrap();
        shared(Volume::mount(disk, MountOptions::default()).unwrap())
    }

    #[test]
    fn create_write_read_back() {
        let volume = fat32_volume();
        let mut file = File::open(
            Shared::clone(&volume),
            "/a.txt",
            OpenMode::CREATE_NEW | OpenMode::WRITE,
        )
        .unwrap();
        let data = vec![0xA5u8; 5000];
        file.write_all(&data).unwrap();
        assert_eq!(file.size(), 5000);
        file.close().unwrap();

        let mut file = File::open(Shared::clone(&volume), "/a.txt", OpenMode::READ).unwrap();
        let mut back = vec![0u8; 5000];
        assert_eq!(file.read(&mut back).unwrap(), 5000);
        assert!(back.iter().all(|&b| b == 0xA5));
        // At EOF reads return zero bytes.
        assert_eq!(file.read(&mut back).unwrap(), 0);
        file.close().unwrap();

        // The chain covers the size exactly, rounded up to clusters.
        let mut guard = acquire!(volume);
        assert_eq!(guard.fs_type, crate::types::FatType::Fat32);
        let cluster_bytes = guard.cluster_bytes();
        let expected = (5000 + cluster_bytes - 1) / cluster_bytes;
        let mut table = [0u32; 8];
        let mut dj = crate::dir::DirCursor::new(0);
        guard.follow_path(&mut dj, "/a.txt").unwrap();
        let info = guard.fileinfo(&dj).unwrap();
        guard.build_link_map(info.sclust, &mut table).unwrap();
        let chained: u32 = (1..table.len()).step_by(2).map(|i| table[i]).sum();
        assert_eq!(chained, expected);
    }

    #[test]
    fn open_contract_errors() {
        let volume = fresh_volume(65536);
        match File::open(Shared::clone(&volume), "/absent.txt", OpenMode::READ) {
            Err(Error::NoFile) => (),
            other => panic!("expected NoFile, got {:?}", other.map(|_| ())),
        }
        let file = File::open(
            Shared::clone(&volume),
            "/x.bin",
            OpenMode::CREATE_NEW | OpenMode::WRITE,
        )
        .unwrap();
        file.close().unwrap();
        match File::open(
            Shared::clone(&volume),
            "/x.bin",
            OpenMode::CREATE_NEW | OpenMode::WRITE,
        ) {
            Err(Error::Exist) => (),
            other => panic!("expected Exist, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn create_always_truncates() {
        let volume = fresh_volume(65536);
        let mut file = File::open(
            Shared::clone(&volume),
            "/t.bin",
            OpenMode::CREATE_ALWAYS | OpenMode::WRITE,
        )
        .unwrap();
        file.write_all(&[1u8; 9000]).unwrap();
        file.close().unwrap();
        let free_after_first = acquire!(volume).free_clst;
        let file = File::open(
            Shared::clone(&volume),
            "/t.bin",
            OpenMode::CREATE_ALWAYS | OpenMode::WRITE,
        )
        .unwrap();
        assert_eq!(file.size(), 0);
        file.close().unwrap();
        assert!(acquire!(volume).free_clst > free_after_first);
    }

    #[test]
    fn partial_sector_overwrite_preserves_neighbors() {
        let volume = fresh_volume(65536);
        let mut file = File::open(
            Shared::clone(&volume),
            "/p.bin",
            OpenMode::CREATE_NEW | OpenMode::WRITE,
        )
        .unwrap();
        file.write_all(&[0x11u8; 1024]).unwrap();
        file.seek(SeekFrom::Start(100)).unwrap();
        file.write_all(&[0x22u8; 16]).unwrap();
        file.close().unwrap();

        let mut file = File::open(Shared::clone(&volume), "/p.bin", OpenMode::READ).unwrap();
        let mut back = vec![0u8; 1024];
        file.read(&mut back).unwrap();
        assert!(back[..100].iter().all(|&b| b == 0x11));
        assert!(back[100..116].iter().all(|&b| b == 0x22));
        assert!(back[116..].iter().all(|&b| b == 0x11));
        file.close().unwrap();
    }

    #[test]
    fn truncate_mid_cluster() {
        // 512-byte sectors, 8-sector clusters on a small FAT16 volume.
        let mut options = FormatOptions::default();
        options.cluster_size = 4096;
        let mut disk = RamDisk::new(65536, 512);
        mkfs(&mut disk, &options).unwrap();
        let volume = shared(Volume::mount(disk, MountOptions::default()).unwrap());
        let mut file = File::open(
            Shared::clone(&volume),
            "/big.bin",
            OpenMode::CREATE_NEW | OpenMode::WRITE,
        )
        .unwrap();
        file.write_all(&[7u8; 10000]).unwrap();
        file.truncate(5000).unwrap();
        assert_eq!(file.size(), 5000);
        file.close().unwrap();

        let mut file = File::open(Shared::clone(&volume), "/big.bin", OpenMode::READ).unwrap();
        file.seek(SeekFrom::Start(5000)).unwrap();
        let mut past = [0u8; 16];
        assert_eq!(file.read(&mut past).unwrap(), 0);
        file.close().unwrap();

        let mut guard = acquire!(volume);
        let mut dj = crate::dir::DirCursor::new(0);
        guard.follow_path(&mut dj, "/big.bin").unwrap();
        let info = guard.fileinfo(&dj).unwrap();
        assert_eq!(info.size, 5000);
        let mut table = [0u32; 8];
        guard.build_link_map(info.sclust, &mut table).unwrap();
        let clusters: u32 = (1..table.len()).step_by(2).map(|i| table[i]).sum();
        assert_eq!(clusters, 2);
    }

    #[test]
    fn seek_past_end_in_write_mode_extends() {
        let volume = fresh_volume(65536);
        let mut file = File::open(
            Shared::clone(&volume),
            "/s.bin",
            OpenMode::CREATE_NEW | OpenMode::WRITE,
        )
        .unwrap();
        file.seek(SeekFrom::Start(6000)).unwrap();
        assert_eq!(file.size(), 6000);
        file.write_all(&[9u8; 10]).unwrap();
        file.close().unwrap();
        let mut file = File::open(Shared::clone(&volume), "/s.bin", OpenMode::READ).unwrap();
        assert_eq!(file.size(), 6010);
        file.seek(SeekFrom::End(-10)).unwrap();
        let mut tail = [0u8; 10];
        file.read(&mut tail).unwrap();
        assert_eq!(tail, [9u8; 10]);
        file.close().unwrap();
    }

    #[test]
    fn append_mode_continues_at_end() {
        let volume = fresh_volume(65536);
        let mut file = File::open(
            Shared::clone(&volume),
            "/log.txt",
            OpenMode::CREATE_NEW | OpenMode::WRITE,
        )
        .unwrap();
        file.write_str("first\n").unwrap();
        file.close().unwrap();
        let mut file = File::open(
            Shared::clone(&volume),
            "/log.txt",
            OpenMode::OPEN_APPEND | OpenMode::WRITE,
        )
        .unwrap();
        assert_eq!(file.tell(), 6);
        file.write_str("second\n").unwrap();
        file.close().unwrap();
        let mut file = File::open(Shared::clone(&volume), "/log.txt", OpenMode::READ).unwrap();
        let mut line = String::new();
        file.read_line(&mut line).unwrap();
        assert_eq!(line, "first\n");
        line.clear();
        file.read_line(&mut line).unwrap();
        assert_eq!(line, "second\n");
        file.close().unwrap();
    }

    #[test]
    fn read_line_reassembles_utf8() {
        let volume = fresh_volume(65536);
        let mut file = File::open(
            Shared::clone(&volume),
            "/text.txt",
            OpenMode::CREATE_NEW | OpenMode::WRITE,
        )
        .unwrap();
        file.write_str("café\nnaïve\n").unwrap();
        file.close().unwrap();
        let mut file = File::open(Shared::clone(&volume), "/text.txt", OpenMode::READ).unwrap();
        let mut line = String::new();
        let count = file.read_line(&mut line).unwrap();
        // Multi-byte sequences survive the byte-wise read.
        assert_eq!(line, "café\n");
        assert_eq!(count, "café\n".len());
        line.clear();
        file.read_line(&mut line).unwrap();
        assert_eq!(line, "naïve\n");
        file.close().unwrap();
    }

    #[test]
    fn expand_preallocates_contiguously() {
        let volume = fresh_volume(65536);
        let mut file = File::open(
            Shared::clone(&volume),
            "/pre.bin",
            OpenMode::CREATE_NEW | OpenMode::WRITE,
        )
        .unwrap();
        file.expand(40000, true).unwrap();
        assert_eq!(file.size(), 40000);
        file.fast_seek().unwrap();
        file.close().unwrap();
        let mut guard = acquire!(volume);
        let mut dj = crate::dir::DirCursor::new(0);
        guard.follow_path(&mut dj, "/pre.bin").unwrap();
        let info = guard.fileinfo(&dj).unwrap();
        let mut table = [0u32; 8];
        guard.build_link_map(info.sclust, &mut table).unwrap();
        // A single contiguous run covers the whole preallocation.
        assert_eq!(table[0], 4);
        assert_eq!(table[3], 0);
    }

    #[test]
    fn fast_seek_reads_fragmented_file() {
        let volume = fresh_volume(65536);
        let mut file = File::open(
            Shared::clone(&volume),
            "/frag.bin",
            OpenMode::CREATE_NEW | OpenMode::WRITE,
        )
        .unwrap();
        let mut data = vec![0u8; 3000];
        for (index, byte) in data.iter_mut().enumerate() {
            *byte = index as u8;
        }
        file.write_all(&data).unwrap();
        file.sync().unwrap();
        file.fast_seek().unwrap();
        file.seek(SeekFrom::Start(2500)).unwrap();
        let mut back = [0u8; 100];
        assert_eq!(file.read(&mut back).unwrap(), 100);
        for (index, &byte) in back.iter().enumerate() {
            assert_eq!(byte, (2500 + index) as u8);
        }
        file.close().unwrap();
    }
}
