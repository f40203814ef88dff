//! Directory engine: cursor movement over 32-byte entries (fixed
//! root table or cluster chain), entry lookup with long-name
//! reconstruction, block allocation, registration and removal.

pub(crate) mod lfn;

use alloc::string::String;
use core::fmt::Debug;

use log::{debug, trace};

use crate::clock::Timestamp;
use crate::error::Error;
use crate::io::IO;
use crate::region::dir::{
    load_cluster, load_file_size, Attributes, DELETED, DIR_ATTR, DIR_CRT_DATE, DIR_CRT_TIME,
    DIR_MOD_DATE, DIR_MOD_TIME, DIR_NAME, DIR_NTRES, KANJI_E5, LAST_LONG_ENTRY, LDIR_CHKSUM,
    MAX_DIR, NT_BODY_LOWER, NT_EXT_LOWER, SZDIRE,
};
use crate::sync::{acquire, Shared};
use crate::types::{FatType, SectorID};
use crate::volume::Volume;

// Staged-name status flags, kept in `fname[11]`.
pub(crate) const NSFLAG: usize = 11;
/// The 8.3 rendition lost information; a numbered tail is required.
pub(crate) const NS_LOSS: u8 = 0x01;
/// An LFN entry block must accompany the short entry.
pub(crate) const NS_LFN: u8 = 0x02;
/// This segment is the last one of the path.
pub(crate) const NS_LAST: u8 = 0x04;
/// The name body is lower case only.
pub(crate) const NS_BODY: u8 = 0x08;
/// The extension is lower case only.
pub(crate) const NS_EXT: u8 = 0x10;
/// `.` or `..` entry.
pub(crate) const NS_DOT: u8 = 0x20;
/// Match the short name only.
pub(crate) const NS_NOLFN: u8 = 0x40;
/// The segment names the directory itself.
pub(crate) const NS_NONAME: u8 = 0x80;

/// Position inside a directory plus the staged name being matched
/// or created. Entry access always re-resolves through the sector
/// window, so cursors survive window movement.
#[derive(Clone)]
pub(crate) struct DirCursor {
    /// Start cluster of the directory, 0 for the root.
    pub sclust: u32,
    /// Cluster holding the current entry (0 inside a fixed root).
    pub clust: u32,
    /// Sector holding the current entry; `None` past the end.
    pub sect: Option<SectorID>,
    /// Byte offset of the current entry from the directory start.
    pub dptr: u32,
    /// Offset of the first LFN entry of the current block.
    pub blk_ofs: Option<u32>,
    /// Staged 8.3 name in directory form + status flags.
    pub fname: [u8; 12],
    /// Attribute byte of the entry the cursor stopped on.
    pub attr: u8,
}

impl DirCursor {
    pub fn new(sclust: u32) -> Self {
        Self {
            sclust,
            clust: 0,
            sect: None,
            dptr: 0,
            blk_ofs: None,
            fname: [0; 12],
            attr: 0,
        }
    }

    pub fn entry_offset(&self, ss: usize) -> usize {
        self.dptr as usize % ss
    }
}

/// One enumerated directory entry.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// Primary name: the long name when one exists, otherwise the
    /// short name with NT case hints applied.
    pub name: String,
    /// The 8.3 name in `NAME.EXT` form.
    pub short_name: String,
    pub size: u32,
    pub attributes: Attributes,
    pub modified: Timestamp,
    pub created: Timestamp,
    pub(crate) sclust: u32,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.attributes.directory()
    }
}

#[cfg_attr(not(feature = "async"), deasync::deasync)]
impl<E: Debug, D: IO<Error = E>> Volume<D> {
    /// Seek the cursor to byte offset `ofs`, walking the chain for
    /// chained directories.
    pub(crate) async fn dir_sdi(&mut self, dp: &mut DirCursor, ofs: u32) -> Result<(), Error<E>> {
        if ofs >= MAX_DIR || ofs % SZDIRE != 0 {
            return Err(Error::IntErr);
        }
        dp.dptr = ofs;
        let mut cluster = dp.sclust;
        if cluster == 0 && self.fs_type == FatType::Fat32 {
            cluster = self.root_clst;
        }
        let sect;
        if cluster == 0 {
            // Fixed table: the FAT12/16 root directory.
            if ofs / SZDIRE >= self.n_rootdir as u32 {
                return Err(Error::IntErr);
            }
            sect = self.dirbase + ofs as u64 / self.ss as u64;
        } else {
            let cluster_bytes = self.cluster_bytes();
            let mut remaining = ofs;
            while remaining >= cluster_bytes {
                cluster = self.get_fat(cluster).await?;
                if !self.valid_cluster(cluster) {
                    return Err(Error::IntErr);
                }
                remaining -= cluster_bytes;
            }
            sect = self.clst2sect(cluster) + remaining as u64 / self.ss as u64;
        }
        dp.clust = cluster;
        dp.sect = Some(sect);
        Ok(())
    }

    /// Advance to the next entry. `stretch` appends and clears a new
    /// cluster when the chain runs out. `NoFile` reports end of table.
    pub(crate) async fn dir_next(&mut self, dp: &mut DirCursor, stretch: bool) -> Result<(), Error<E>> {
        let ofs = dp.dptr + SZDIRE;
        if ofs >= MAX_DIR {
            dp.sect = None;
        }
        let sect = match dp.sect {
            Some(sect) => sect,
            None => return Err(Error::NoFile),
        };
        if ofs % self.ss as u32 == 0 {
            if dp.clust == 0 {
                if ofs / SZDIRE >= self.n_rootdir as u32 {
                    dp.sect = None;
                    return Err(Error::NoFile);
                }
                dp.sect = Some(sect + 1u32);
            } else if (ofs / self.ss as u32) & (self.csize as u32 - 1) == 0 {
                // Cluster boundary: follow or extend the chain.
                let next = self.get_fat(dp.clust).await?;
                if next <= 1 {
                    return Err(Error::IntErr);
                }
                let cluster = if next >= self.n_fatent {
                    if !stretch {
                        dp.sect = None;
                        return Err(Error::NoFile);
                    }
                    let fresh = self.create_chain(dp.clust).await?;
                    self.dir_clear(fresh).await?;
                    fresh
                } else {
                    next
                };
                dp.clust = cluster;
                dp.sect = Some(self.clst2sect(cluster));
            } else {
                dp.sect = Some(sect + 1u32);
            }
        }
        dp.dptr = ofs;
        Ok(())
    }

    /// Zero-fill a freshly allocated directory cluster.
    pub(crate) async fn dir_clear(&mut self, cluster: u32) -> Result<(), Error<E>> {
        self.sync_window().await?;
        let first = self.clst2sect(cluster);
        let zero = alloc::vec![0u8; self.ssize()];
        for index in 0..self.csize {
            self.io.write(first + index, &zero).await?;
        }
        if let Some(winsect) = self.window_sector() {
            if winsect >= first && winsect - first < self.csize as u64 {
                self.invalidate_window();
            }
        }
        Ok(())
    }

    fn entry_copy(&self, offset: usize) -> [u8; SZDIRE as usize] {
        let mut entry = [0u8; SZDIRE as usize];
        entry.copy_from_slice(&self.win()[offset..offset + SZDIRE as usize]);
        entry
    }

    /// Read the entry the cursor points at or the next valid one.
    /// `label` filters for the volume-label entry instead of files
    /// and directories. Dot entries are skipped. On success the
    /// cursor rests on the short entry, with any long name
    /// reconstructed in the volume's working buffer.
    pub(crate) async fn dir_read(&mut self, dp: &mut DirCursor, label: bool) -> Result<(), Error<E>> {
        let mut ord = 0xFFu8;
        let mut sum = 0xFFu8;
        loop {
            let sect = match dp.sect {
                Some(sect) => sect,
                None => return Err(Error::NoFile),
            };
            self.move_window(sect).await?;
            let offset = dp.entry_offset(self.ssize());
            let leading = self.win()[offset + DIR_NAME];
            if leading == 0 {
                dp.sect = None;
                return Err(Error::NoFile);
            }
            let attr = self.win()[offset + DIR_ATTR] & 0x3F;
            dp.attr = attr;
            let is_label = attr & !0x20 == 0x08;
            if leading == DELETED || leading == b'.' || is_label != label {
                ord = 0xFF;
            } else if attr & 0x0F == 0x0F {
                let entry = self.entry_copy(offset);
                let mut order = entry[0];
                if order & LAST_LONG_ENTRY != 0 {
                    sum = entry[LDIR_CHKSUM];
                    order &= !LAST_LONG_ENTRY;
                    ord = order;
                    dp.blk_ofs = Some(dp.dptr);
                }
                ord = if order == ord && sum == entry[LDIR_CHKSUM] && lfn::pick(&mut self.lfnbuf, &entry)
                {
                    ord - 1
                } else {
                    0xFF
                };
            } else {
                let entry = self.entry_copy(offset);
                if ord != 0 || sum != lfn::checksum(&entry) {
                    // No valid long name precedes this entry.
                    dp.blk_ofs = None;
                }
                return Ok(());
            }
            self.dir_next(dp, false).await?;
        }
    }

    /// Find the staged name in the directory. The cursor rests on
    /// the matching short entry; `NoFile` means no match.
    pub(crate) async fn dir_find(&mut self, dp: &mut DirCursor) -> Result<(), Error<E>> {
        self.dir_sdi(dp, 0).await?;
        let mut ord = 0xFFu8;
        let mut sum = 0xFFu8;
        dp.blk_ofs = None;
        loop {
            let sect = match dp.sect {
                Some(sect) => sect,
                None => return Err(Error::NoFile),
            };
            self.move_window(sect).await?;
            let offset = dp.entry_offset(self.ssize());
            let leading = self.win()[offset + DIR_NAME];
            if leading == 0 {
                dp.sect = None;
                return Err(Error::NoFile);
            }
            let attr = self.win()[offset + DIR_ATTR] & 0x3F;
            dp.attr = attr;
            if leading == DELETED || (attr & 0x08 != 0 && attr & 0x0F != 0x0F) {
                // Deleted entry or volume label: reset the sequence.
                ord = 0xFF;
                dp.blk_ofs = None;
            } else if attr & 0x0F == 0x0F {
                if dp.fname[NSFLAG] & NS_NOLFN == 0 {
                    let entry = self.entry_copy(offset);
                    let mut order = entry[0];
                    if order & LAST_LONG_ENTRY != 0 {
                        sum = entry[LDIR_CHKSUM];
                        order &= !LAST_LONG_ENTRY;
                        ord = order;
                        dp.blk_ofs = Some(dp.dptr);
                    }
                    ord = if order == ord
                        && sum == entry[LDIR_CHKSUM]
                        && lfn::compare(&self.lfnbuf, &entry)
                    {
                        ord - 1
                    } else {
                        0xFF
                    };
                }
            } else {
                let entry = self.entry_copy(offset);
                if ord == 0 && sum == lfn::checksum(&entry) {
                    return Ok(()); // long name matched
                }
                if dp.fname[NSFLAG] & NS_LOSS == 0 && entry[..11] == dp.fname[..11] {
                    return Ok(()); // short name matched
                }
                ord = 0xFF;
                dp.blk_ofs = None;
            }
            self.dir_next(dp, false).await?;
        }
    }

    /// Reserve `n_ent` contiguous free entries, stretching the
    /// directory as needed. The cursor rests on the last reserved
    /// entry.
    pub(crate) async fn dir_alloc(&mut self, dp: &mut DirCursor, n_ent: u32) -> Result<(), Error<E>> {
        self.dir_sdi(dp, 0).await?;
        let mut run = 0u32;
        loop {
            let sect = match dp.sect {
                Some(sect) => sect,
                None => return Err(Error::Denied),
            };
            self.move_window(sect).await?;
            let offset = dp.entry_offset(self.ssize());
            let leading = self.win()[offset + DIR_NAME];
            if leading == DELETED || leading == 0 {
                run += 1;
                if run == n_ent {
                    return Ok(());
                }
            } else {
                run = 0;
            }
            match self.dir_next(dp, true).await {
                Ok(()) => (),
                Err(Error::NoFile) => return Err(Error::Denied),
                Err(e) => return Err(e),
            }
        }
    }

    /// Register the staged name: resolve short-name collisions with
    /// a numbered tail, then emit the LFN block and a cleared short
    /// entry. The cursor rests on the short entry.
    pub(crate) async fn dir_register(&mut self, dp: &mut DirCursor) -> Result<(), Error<E>> {
        if dp.fname[NSFLAG] & (NS_DOT | NS_NONAME) != 0 {
            return Err(Error::InvalidName);
        }
        let len = lfn::length(&self.lfnbuf);
        let staged = dp.fname;
        if staged[NSFLAG] & NS_LOSS != 0 {
            // The long name does not fit 8.3: probe numbered names.
            dp.fname[NSFLAG] = NS_NOLFN;
            let mut seq = 1u32;
            loop {
                let mut numbered = dp.fname;
                lfn::generate_numbered(&mut numbered, &staged, &self.lfnbuf, seq);
                dp.fname = numbered;
                match self.dir_find(dp).await {
                    Ok(()) => {
                        seq += 1;
                        if seq >= 100 {
                            debug!("gave up numbering after 99 collisions");
                            return Err(Error::Denied);
                        }
                    }
                    Err(Error::NoFile) => break,
                    Err(e) => return Err(e),
                }
            }
            dp.fname[NSFLAG] = staged[NSFLAG];
        }
        let n_ent = match staged[NSFLAG] & NS_LFN != 0 {
            true => (len as u32 + 12) / 13 + 1,
            false => 1,
        };
        self.dir_alloc(dp, n_ent).await?;
        if n_ent > 1 {
            let mut remaining = n_ent - 1;
            self.dir_sdi(dp, dp.dptr - remaining * SZDIRE).await?;
            let sum = lfn::checksum(&dp.fname);
            loop {
                let sect = match dp.sect {
                    Some(sect) => sect,
                    None => return Err(Error::IntErr),
                };
                self.move_window(sect).await?;
                let offset = dp.entry_offset(self.ssize());
                let mut entry = [0u8; SZDIRE as usize];
                lfn::put(&self.lfnbuf, &mut entry, remaining as u8, sum);
                self.win_mut()[offset..offset + SZDIRE as usize].copy_from_slice(&entry);
                remaining -= 1;
                if remaining == 0 {
                    break;
                }
                self.dir_next(dp, false).await?;
            }
            self.dir_next(dp, false).await?;
        }
        // The short entry itself, zeroed except name and case hints.
        let sect = match dp.sect {
            Some(sect) => sect,
            None => return Err(Error::IntErr),
        };
        self.move_window(sect).await?;
        let offset = dp.entry_offset(self.ssize());
        let ntres = dp.fname[NSFLAG] & (NS_BODY | NS_EXT);
        let fname = dp.fname;
        let window = self.win_mut();
        window[offset..offset + SZDIRE as usize].fill(0);
        window[offset..offset + 11].copy_from_slice(&fname[..11]);
        window[offset + DIR_NTRES] = ntres;
        trace!("registered entry at offset {}", dp.dptr);
        Ok(())
    }

    /// Mark the whole entry block deleted, long-name entries first.
    pub(crate) async fn dir_remove(&mut self, dp: &mut DirCursor) -> Result<(), Error<E>> {
        let last = dp.dptr;
        if let Some(blk_ofs) = dp.blk_ofs {
            self.dir_sdi(dp, blk_ofs).await?;
        }
        loop {
            let sect = match dp.sect {
                Some(sect) => sect,
                None => return Err(Error::IntErr),
            };
            self.move_window(sect).await?;
            let offset = dp.entry_offset(self.ssize());
            self.win_mut()[offset + DIR_NAME] = DELETED;
            if dp.dptr >= last {
                return Ok(());
            }
            match self.dir_next(dp, false).await {
                Ok(()) => (),
                Err(Error::NoFile) => return Err(Error::IntErr),
                Err(e) => return Err(e),
            }
        }
    }

    /// Describe the entry the cursor rests on.
    pub(crate) async fn fileinfo(&mut self, dp: &DirCursor) -> Result<FileInfo, Error<E>> {
        let sect = match dp.sect {
            Some(sect) => sect,
            None => return Err(Error::IntErr),
        };
        self.move_window(sect).await?;
        let entry = self.entry_copy(dp.entry_offset(self.ssize()));
        let ntres = entry[DIR_NTRES];
        let mut short_name = String::new();
        let mut cased = String::new();
        for (index, &raw) in entry[..11].iter().enumerate() {
            let byte = match (index, raw) {
                (0, KANJI_E5) => DELETED,
                _ => raw,
            };
            if byte == b' ' {
                continue;
            }
            if index == 8 && !short_name.is_empty() {
                // First extension character follows the implied dot.
                short_name.push('.');
                cased.push('.');
            }
            let unicode = self
                .codepage
                .oem_to_unicode(byte)
                .and_then(|wc| char::from_u32(wc as u32))
                .unwrap_or('\u{FFFD}');
            short_name.push(unicode);
            let lower = match index < 8 {
                true => ntres & NT_BODY_LOWER != 0,
                false => ntres & NT_EXT_LOWER != 0,
            };
            cased.push(match lower {
                true => unicode.to_ascii_lowercase(),
                false => unicode,
            });
        }
        let name = match dp.blk_ofs {
            Some(_) => {
                let units = &self.lfnbuf[..lfn::length(&self.lfnbuf)];
                char::decode_utf16(units.iter().copied())
                    .map(|ch| ch.unwrap_or('\u{FFFD}'))
                    .collect()
            }
            None => cased,
        };
        Ok(FileInfo {
            name,
            short_name,
            size: load_file_size(&entry),
            attributes: Attributes::from(entry[DIR_ATTR]),
            modified: Timestamp::from_words(
                crate::codec::load_u16(&entry[DIR_MOD_DATE..]),
                crate::codec::load_u16(&entry[DIR_MOD_TIME..]),
            ),
            created: Timestamp::from_words(
                crate::codec::load_u16(&entry[DIR_CRT_DATE..]),
                crate::codec::load_u16(&entry[DIR_CRT_TIME..]),
            ),
            sclust: load_cluster(&entry, self.fs_type),
        })
    }
}

/// An open directory, enumerating entries one `read_entry` at a time
/// and optionally filtering them against a glob pattern.
pub struct Dir<E: Debug, D: IO<Error = E>> {
    pub(crate) volume: Shared<Volume<D>>,
    pub(crate) id: u32,
    pub(crate) cursor: DirCursor,
    pub(crate) pattern: Option<String>,
    pub(crate) lock_slot: Option<usize>,
    pub(crate) closed: bool,
}

#[cfg_attr(not(feature = "async"), deasync::deasync)]
impl<E: Debug, D: IO<Error = E>> Dir<E, D> {
    /// Next directory entry, or `None` at the end. With a pattern
    /// attached (via `find_first`) only matching entries surface.
    pub async fn read_entry(&mut self) -> Result<Option<FileInfo>, Error<E>> {
        let mut volume = acquire!(self.volume);
        if volume.id != self.id {
            return Err(Error::InvalidObject);
        }
        loop {
            match volume.dir_read(&mut self.cursor, false).await {
                Ok(()) => (),
                Err(Error::NoFile) => return Ok(None),
                Err(e) => return Err(e),
            }
            let info = volume.fileinfo(&self.cursor).await?;
            // Position for the next call before handing the entry out.
            match volume.dir_next(&mut self.cursor, false).await {
                Ok(()) | Err(Error::NoFile) => (),
                Err(e) => return Err(e),
            }
            let matched = match &self.pattern {
                Some(pattern) => {
                    crate::path::pattern_match(pattern, &info.name, 0, crate::path::FIND_RECURSION)
                        || crate::path::pattern_match(
                            pattern,
                            &info.short_name,
                            0,
                            crate::path::FIND_RECURSION,
                        )
                }
                None => true,
            };
            if matched {
                return Ok(Some(info));
            }
        }
    }

    /// Restart enumeration from the first entry.
    pub async fn rewind(&mut self) -> Result<(), Error<E>> {
        let mut volume = acquire!(self.volume);
        if volume.id != self.id {
            return Err(Error::InvalidObject);
        }
        let mut cursor = self.cursor.clone();
        volume.dir_sdi(&mut cursor, 0).await?;
        self.cursor = cursor;
        Ok(())
    }

    /// Release the handle. Errors only surface here, not in `Drop`.
    pub async fn close(mut self) -> Result<(), Error<E>> {
        self.closed = true;
        let mut volume = acquire!(self.volume);
        if volume.id != self.id {
            return Ok(()); // already invalidated by unmount
        }
        if let Some(slot) = self.lock_slot.take() {
            volume.registry.close(slot);
        }
        Ok(())
    }
}

impl<E: Debug, D: IO<Error = E>> Drop for Dir<E, D> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        match () {
            #[cfg(feature = "async")]
            () => log::warn!("directory handle dropped without close"),
            #[cfg(not(feature = "async"))]
            () => {
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

#[cfg(test)]
mod test {
    use super::*;
    use crate::format::{mkfs, FormatOptions};
    use crate::io::mem::RamDisk;
    use crate::volume::MountOptions;

    fn mounted(sectors: u64) -> Volume<RamDisk> {
        let mut disk = RamDisk::new(sectors, 512);
        mkfs(&mut disk, &FormatOptions::default()).unwrap();
        Volume::mount(disk, MountOptions::default()).unwrap()
    }

    fn stage_sfn(volume: &mut Volume<RamDisk>, dp: &mut DirCursor, name11: &[u8; 11]) {
        dp.fname[..11].copy_from_slice(name11);
        dp.fname[NSFLAG] = NS_LAST;
        volume.lfnbuf[0] = 0;
    }

    #[test]
    fn register_find_remove_short_entry() {
        let mut volume = mounted(65536);
        let mut dp = DirCursor::new(0);
        stage_sfn(&mut volume, &mut dp, b"HELLO   TXT");
        volume.dir_register(&mut dp).unwrap();
        let mut probe = DirCursor::new(0);
        stage_sfn(&mut volume, &mut probe, b"HELLO   TXT");
        volume.dir_find(&mut probe).unwrap();
        assert_eq!(probe.dptr, dp.dptr);
        volume.dir_remove(&mut probe).unwrap();
        let mut gone = DirCursor::new(0);
        stage_sfn(&mut volume, &mut gone, b"HELLO   TXT");
        match volume.dir_find(&mut gone) {
            Err(Error::NoFile) => (),
            other => panic!("expected NoFile, got {:?}", other),
        }
    }

    #[test]
    fn deleted_slot_is_reused() {
        let mut volume = mounted(65536);
        let mut first = DirCursor::new(0);
        stage_sfn(&mut volume, &mut first, b"AAAAAAAATXT");
        volume.dir_register(&mut first).unwrap();
        let slot = first.dptr;
        volume.dir_remove(&mut first).unwrap();
        let mut second = DirCursor::new(0);
        stage_sfn(&mut volume, &mut second, b"BBBBBBBBTXT");
        volume.dir_register(&mut second).unwrap();
        assert_eq!(second.dptr, slot);
    }

    #[test]
    fn read_skips_deleted_and_reports_eot() {
        let mut volume = mounted(65536);
        let mut dp = DirCursor::new(0);
        stage_sfn(&mut volume, &mut dp, b"KEEP    TXT");
        volume.dir_register(&mut dp).unwrap();
        let mut doomed = DirCursor::new(0);
        stage_sfn(&mut volume, &mut doomed, b"DOOMED  TXT");
        volume.dir_register(&mut doomed).unwrap();
        volume.dir_remove(&mut doomed).unwrap();

        let mut iter = DirCursor::new(0);
        volume.dir_sdi(&mut iter, 0).unwrap();
        volume.dir_read(&mut iter, false).unwrap();
        let info = volume.fileinfo(&iter).unwrap();
        assert_eq!(info.short_name, "KEEP.TXT");
        volume.dir_next(&mut iter, false).unwrap();
        match volume.dir_read(&mut iter, false) {
            Err(Error::NoFile) => (),
            other => panic!("expected end of table, got {:?}", other),
        }
    }
}
