//! Path-level operations on a mounted volume: stat, directory
//! creation and removal, rename, attribute and timestamp edits,
//! the current directory, volume label and free-space query.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Debug;

use crate::clock::Timestamp;
use crate::codec::store_u32;
use crate::dir::{DirCursor, FileInfo, NSFLAG, NS_DOT, NS_NONAME};
use crate::error::Error;
use crate::io::IO;
use crate::region::dir::{
    load_cluster, store_cluster, Attributes, DELETED, DIR_ATTR, DIR_MOD_TIME, SZDIRE,
};
use crate::sync::acquire;
use crate::FatFs;

#[cfg_attr(not(feature = "async"), deasync::deasync)]
impl<E: Debug, D: IO<Error = E>> FatFs<D> {
    /// Describe the object at `path`.
    pub async fn stat(&self, path: &str) -> Result<FileInfo, Error<E>> {
        let mut volume = acquire!(self.volume);
        Self::check_mounted(&volume)?;
        let path = Self::local_path(path)?;
        let mut dj = DirCursor::new(0);
        volume.follow_path(&mut dj, path).await?;
        if dj.fname[NSFLAG] & (NS_NONAME | NS_DOT) != 0 {
            return Err(Error::InvalidName);
        }
        volume.fileinfo(&dj).await
    }

    /// Create a directory with its `.` and `..` entries.
    pub async fn create_dir(&self, path: &str) -> Result<(), Error<E>> {
        let mut volume = acquire!(self.volume);
        Self::check_mounted(&volume)?;
        if volume.io.write_protected() {
            return Err(Error::WriteProtected);
        }
        let path = Self::local_path(path)?;
        let mut dj = DirCursor::new(0);
        match volume.follow_path(&mut dj, path).await {
            Ok(()) => {
                return Err(match dj.fname[NSFLAG] & (NS_NONAME | NS_DOT) {
                    0 => Error::Exist,
                    _ => Error::InvalidName,
                })
            }
            Err(Error::NoFile) => (),
            Err(e) => return Err(e),
        }
        let dcl = volume.create_chain(0).await?;
        let parent = dj.sclust;
        let stamp = volume.now().raw();
        volume.dir_clear(dcl).await?;
        // Seed the canonical dot entries in the first sector.
        let first = volume.clst2sect(dcl);
        volume.move_window(first).await?;
        {
            let window = volume.win_mut();
            window[..11].fill(b' ');
            window[0] = b'.';
            window[DIR_ATTR] = 0x10;
            store_u32(&mut window[DIR_MOD_TIME..], stamp);
            store_cluster(&mut window[..SZDIRE as usize], dcl);
            window.copy_within(0..SZDIRE as usize, SZDIRE as usize);
            window[SZDIRE as usize + 1] = b'.';
            // The root parent is recorded as 0, also on FAT32.
            store_cluster(&mut window[SZDIRE as usize..2 * SZDIRE as usize], parent);
        }
        if let Err(e) = volume.dir_register(&mut dj).await {
            volume.remove_chain(dcl, 0).await.ok();
            return Err(e);
        }
        let sect = match dj.sect {
            Some(sect) => sect,
            None => return Err(Error::IntErr),
        };
        volume.move_window(sect).await?;
        let offset = dj.entry_offset(volume.ssize());
        let entry = &mut volume.win_mut()[offset..offset + SZDIRE as usize];
        entry[DIR_ATTR] = 0x10;
        store_u32(&mut entry[DIR_MOD_TIME..], stamp);
        store_cluster(entry, dcl);
        debug!("created directory at cluster {}", dcl);
        volume.sync_fs().await
    }

    /// Remove a file or an empty directory.
    pub async fn remove(&self, path: &str) -> Result<(), Error<E>> {
        let mut volume = acquire!(self.volume);
        Self::check_mounted(&volume)?;
        if volume.io.write_protected() {
            return Err(Error::WriteProtected);
        }
        let path = Self::local_path(path)?;
        let mut dj = DirCursor::new(0);
        volume.follow_path(&mut dj, path).await?;
        if dj.fname[NSFLAG] & (NS_NONAME | NS_DOT) != 0 {
            return Err(Error::InvalidName);
        }
        if !volume.registry.removable(dj.sclust, dj.dptr) {
            return Err(Error::Locked);
        }
        if dj.attr & 0x01 != 0 {
            return Err(Error::Denied);
        }
        let sect = match dj.sect {
            Some(sect) => sect,
            None => return Err(Error::IntErr),
        };
        volume.move_window(sect).await?;
        let offset = dj.entry_offset(volume.ssize());
        let object_cluster = {
            let entry = &volume.win()[offset..offset + SZDIRE as usize];
            load_cluster(entry, volume.fs_type)
        };
        if dj.attr & 0x10 != 0 {
            if object_cluster == volume.cdir {
                // The current directory cannot remove itself.
                return Err(Error::NotPermitted);
            }
            let mut sub = DirCursor::new(object_cluster);
            volume.dir_sdi(&mut sub, 0).await?;
            match volume.dir_read(&mut sub, false).await {
                Ok(()) => return Err(Error::DirectoryNotEmpty),
                Err(Error::NoFile) => (),
                Err(e) => return Err(e),
            }
        }
        volume.dir_remove(&mut dj).await?;
        if object_cluster != 0 {
            volume.remove_chain(object_cluster, 0).await?;
        }
        volume.sync_fs().await
    }

    /// Rename or move a file or directory. The target must not
    /// exist; a moved directory gets its `..` entry repointed.
    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), Error<E>> {
        let mut volume = acquire!(self.volume);
        Self::check_mounted(&volume)?;
        if volume.io.write_protected() {
            return Err(Error::WriteProtected);
        }
        let old_path = Self::local_path(old_path)?;
        let new_path = Self::local_path(new_path)?;
        let mut djo = DirCursor::new(0);
        volume.follow_path(&mut djo, old_path).await?;
        if djo.fname[NSFLAG] & (NS_NONAME | NS_DOT) != 0 {
            return Err(Error::InvalidName);
        }
        if !volume.registry.removable(djo.sclust, djo.dptr) {
            return Err(Error::Locked);
        }
        let sect = match djo.sect {
            Some(sect) => sect,
            None => return Err(Error::IntErr),
        };
        volume.move_window(sect).await?;
        let offset = djo.entry_offset(volume.ssize());
        let mut saved = [0u8; SZDIRE as usize];
        saved.copy_from_slice(&volume.win()[offset..offset + SZDIRE as usize]);
        let mut djn = DirCursor::new(0);
        match volume.follow_path(&mut djn, new_path).await {
            Ok(()) => return Err(Error::Exist),
            Err(Error::NoFile) => (),
            Err(e) => return Err(e),
        }
        volume.dir_register(&mut djn).await?;
        let sect = match djn.sect {
            Some(sect) => sect,
            None => return Err(Error::IntErr),
        };
        volume.move_window(sect).await?;
        let offset = djn.entry_offset(volume.ssize());
        {
            let entry = &mut volume.win_mut()[offset..offset + SZDIRE as usize];
            entry[13..].copy_from_slice(&saved[13..]);
            entry[DIR_ATTR] = saved[DIR_ATTR];
        }
        if saved[DIR_ATTR] & 0x10 != 0 && djo.sclust != djn.sclust {
            // A moved directory carries its parent link with it.
            let moved = load_cluster(&saved, volume.fs_type);
            let dotdot = volume.clst2sect(moved);
            volume.move_window(dotdot).await?;
            if volume.win()[SZDIRE as usize + 1] == b'.' {
                let parent = djn.sclust;
                let entry =
                    &mut volume.win_mut()[SZDIRE as usize..2 * SZDIRE as usize];
                store_cluster(entry, parent);
            }
        }
        volume.dir_remove(&mut djo).await?;
        trace!("renamed {:?} to {:?}", old_path, new_path);
        volume.sync_fs().await
    }

    /// Change attribute bits selected by `mask` to the values in
    /// `attributes`. Only the read-only, hidden, system and archive
    /// bits are settable.
    pub async fn chmod(
        &self,
        path: &str,
        attributes: Attributes,
        mask: Attributes,
    ) -> Result<(), Error<E>> {
        let mut volume = acquire!(self.volume);
        Self::check_mounted(&volume)?;
        let path = Self::local_path(path)?;
        let mut dj = DirCursor::new(0);
        volume.follow_path(&mut dj, path).await?;
        if dj.fname[NSFLAG] & (NS_NONAME | NS_DOT) != 0 {
            return Err(Error::InvalidName);
        }
        let sect = match dj.sect {
            Some(sect) => sect,
            None => return Err(Error::IntErr),
        };
        volume.move_window(sect).await?;
        let offset = dj.entry_offset(volume.ssize());
        let mask = mask.raw() & Attributes::SETTABLE;
        let entry = &mut volume.win_mut()[offset..offset + SZDIRE as usize];
        entry[DIR_ATTR] = (attributes.raw() & mask) | (entry[DIR_ATTR] & !mask);
        volume.sync_fs().await
    }

    /// Set the modified timestamp.
    pub async fn set_times(&self, path: &str, modified: Timestamp) -> Result<(), Error<E>> {
        let mut volume = acquire!(self.volume);
        Self::check_mounted(&volume)?;
        let path = Self::local_path(path)?;
        let mut dj = DirCursor::new(0);
        volume.follow_path(&mut dj, path).await?;
        if dj.fname[NSFLAG] & (NS_NONAME | NS_DOT) != 0 {
            return Err(Error::InvalidName);
        }
        let sect = match dj.sect {
            Some(sect) => sect,
            None => return Err(Error::IntErr),
        };
        volume.move_window(sect).await?;
        let offset = dj.entry_offset(volume.ssize());
        let entry = &mut volume.win_mut()[offset..offset + SZDIRE as usize];
        store_u32(&mut entry[DIR_MOD_TIME..], modified.raw());
        volume.sync_fs().await
    }

    /// Change the current directory of the volume.
    pub async fn change_dir(&self, path: &str) -> Result<(), Error<E>> {
        let mut volume = acquire!(self.volume);
        Self::check_mounted(&volume)?;
        let path = Self::local_path(path)?;
        let mut dj = DirCursor::new(0);
        volume.follow_path(&mut dj, path).await?;
        if dj.fname[NSFLAG] & NS_NONAME != 0 {
            volume.cdir = dj.sclust;
            return Ok(());
        }
        if dj.attr & 0x10 == 0 {
            return Err(Error::NotDirectory);
        }
        let sect = match dj.sect {
            Some(sect) => sect,
            None => return Err(Error::IntErr),
        };
        volume.move_window(sect).await?;
        let offset = dj.entry_offset(volume.ssize());
        let cluster = {
            let entry = &volume.win()[offset..offset + SZDIRE as usize];
            load_cluster(entry, volume.fs_type)
        };
        volume.cdir = cluster;
        Ok(())
    }

    /// Absolute path of the current directory, rebuilt by following
    /// `..` upward and matching each child in its parent.
    pub async fn current_dir(&self) -> Result<String, Error<E>> {
        let mut volume = acquire!(self.volume);
        Self::check_mounted(&volume)?;
        let mut names: Vec<String> = Vec::new();
        let mut child = volume.cdir;
        while child != 0 {
            let mut dj = DirCursor::new(child);
            volume.dir_sdi(&mut dj, SZDIRE).await?;
            let sect = match dj.sect {
                Some(sect) => sect,
                None => return Err(Error::IntErr),
            };
            volume.move_window(sect).await?;
            let offset = dj.entry_offset(volume.ssize());
            if volume.win()[offset + 1] != b'.' {
                return Err(Error::IntErr);
            }
            let parent = {
                let entry = &volume.win()[offset..offset + SZDIRE as usize];
                load_cluster(entry, volume.fs_type)
            };
            let mut pj = DirCursor::new(parent);
            volume.dir_sdi(&mut pj, 0).await?;
            loop {
                match volume.dir_read(&mut pj, false).await {
                    Ok(()) => (),
                    Err(Error::NoFile) => return Err(Error::IntErr),
                    Err(e) => return Err(e),
                }
                let info = volume.fileinfo(&pj).await?;
                if info.sclust == child {
                    names.push(info.name);
                    break;
                }
                volume.dir_next(&mut pj, false).await?;
            }
            child = parent;
        }
        let mut path = String::new();
        for name in names.iter().rev() {
            path.push('/');
            path.push_str(name);
        }
        if path.is_empty() {
            path.push('/');
        }
        Ok(path)
    }

    /// Free and total clusters. The free count comes from the cache
    /// when valid, otherwise from a full FAT scan.
    pub async fn free_clusters(&self) -> Result<(u32, u32), Error<E>> {
        let mut volume = acquire!(self.volume);
        Self::check_mounted(&volume)?;
        let free = volume.count_free().await?;
        Ok((free, volume.n_fatent - 2))
    }

    /// Volume label and serial number. A label-less volume yields
    /// an empty string.
    pub async fn label(&self) -> Result<(String, u32), Error<E>> {
        let mut volume = acquire!(self.volume);
        Self::check_mounted(&volume)?;
        let serial = volume.vsn;
        let mut dj = DirCursor::new(0);
        volume.dir_sdi(&mut dj, 0).await?;
        match volume.dir_read(&mut dj, true).await {
            Ok(()) => (),
            Err(Error::NoFile) => return Ok((String::new(), serial)),
            Err(e) => return Err(e),
        }
        let sect = match dj.sect {
            Some(sect) => sect,
            None => return Err(Error::IntErr),
        };
        volume.move_window(sect).await?;
        let offset = dj.entry_offset(volume.ssize());
        let mut label = String::new();
        for &byte in &volume.win()[offset..offset + 11] {
            let unicode = volume
                .codepage
                .oem_to_unicode(byte)
                .and_then(|wc| char::from_u32(wc as u32))
                .unwrap_or('\u{FFFD}');
            label.push(unicode);
        }
        while label.ends_with(' ') {
            label.pop();
        }
        Ok((label, serial))
    }

    /// Write, replace or (with an empty string) remove the volume
    /// label.
    pub async fn set_label(&self, label: &str) -> Result<(), Error<E>> {
        let mut volume = acquire!(self.volume);
        Self::check_mounted(&volume)?;
        if volume.io.write_protected() {
            return Err(Error::WriteProtected);
        }
        let mut name = [b' '; 11];
        let mut length = 0usize;
        for ch in label.trim_end_matches(' ').chars() {
            let wc = ch as u32;
            if wc < 0x20 || "*:<>|\"?\x7F+.,;=[]/\\".contains(ch) {
                return Err(Error::InvalidName);
            }
            let upper = crate::codepage::to_upper(wc.min(0xFFFF) as u16);
            let oem = match volume.codepage.unicode_to_oem(upper) {
                Some(byte) => byte,
                None => return Err(Error::InvalidName),
            };
            if length >= 11 {
                return Err(Error::InvalidName);
            }
            name[length] = oem;
            length += 1;
        }
        if name[0] == DELETED {
            return Err(Error::InvalidName);
        }
        let stamp = volume.now().raw();
        let mut dj = DirCursor::new(0);
        volume.dir_sdi(&mut dj, 0).await?;
        match volume.dir_read(&mut dj, true).await {
            Ok(()) => {
                let sect = match dj.sect {
                    Some(sect) => sect,
                    None => return Err(Error::IntErr),
                };
                volume.move_window(sect).await?;
                let offset = dj.entry_offset(volume.ssize());
                let entry = &mut volume.win_mut()[offset..offset + SZDIRE as usize];
                match length {
                    0 => entry[0] = DELETED,
                    _ => {
                        entry[..11].copy_from_slice(&name);
                        store_u32(&mut entry[DIR_MOD_TIME..], stamp);
                    }
                }
            }
            Err(Error::NoFile) if length > 0 => {
                volume.dir_alloc(&mut dj, 1).await?;
                let sect = match dj.sect {
                    Some(sect) => sect,
                    None => return Err(Error::IntErr),
                };
                volume.move_window(sect).await?;
                let offset = dj.entry_offset(volume.ssize());
                let entry = &mut volume.win_mut()[offset..offset + SZDIRE as usize];
                entry.fill(0);
                entry[..11].copy_from_slice(&name);
                entry[DIR_ATTR] = 0x08;
                store_u32(&mut entry[DIR_MOD_TIME..], stamp);
            }
            Err(Error::NoFile) => return Ok(()),
            Err(e) => return Err(e),
        }
        volume.sync_fs().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::format::{mkfs, FormatOptions};
    use crate::io::mem::RamDisk;
    use crate::volume::MountOptions;
    use crate::{FatFs, OpenMode};

    fn mounted_fs(sectors: u64) -> FatFs<RamDisk> {
        let mut disk = RamDisk::new(sectors, 512);
        mkfs(&mut disk, &FormatOptions::default()).unwrap();
        FatFs::mount(disk, MountOptions::default()).unwrap()
    }

    #[test]
    fn mkdir_rmdir_mkdir_again() {
        let fs = mounted_fs(65536);
        fs.create_dir("/work").unwrap();
        match fs.create_dir("/work") {
            Err(Error::Exist) => (),
            other => panic!("expected Exist, got {:?}", other),
        }
        fs.remove("/work").unwrap();
        fs.create_dir("/work").unwrap();
    }

    #[test]
    fn rmdir_refuses_non_empty() {
        let fs = mounted_fs(65536);
        fs.create_dir("/d").unwrap();
        let file = fs
            .open("/d/inner.txt", OpenMode::CREATE_NEW | OpenMode::WRITE)
            .unwrap();
        file.close().unwrap();
        match fs.remove("/d") {
            Err(Error::DirectoryNotEmpty) => (),
            other => panic!("expected DirectoryNotEmpty, got {:?}", other),
        }
        fs.remove("/d/inner.txt").unwrap();
        fs.remove("/d").unwrap();
    }

    #[test]
    fn unlink_while_open_is_locked() {
        let fs = mounted_fs(65536);
        let file = fs
            .open("/x", OpenMode::CREATE_NEW | OpenMode::WRITE)
            .unwrap();
        match fs.remove("/x") {
            Err(Error::Locked) => (),
            other => panic!("expected Locked, got {:?}", other),
        }
        file.close().unwrap();
        fs.remove("/x").unwrap();
    }

    #[test]
    fn rename_round_trip() {
        let fs = mounted_fs(65536);
        let mut file = fs
            .open("/orig.txt", OpenMode::CREATE_NEW | OpenMode::WRITE)
            .unwrap();
        file.write_all(b"payload").unwrap();
        file.close().unwrap();
        fs.rename("/orig.txt", "/moved.txt").unwrap();
        match fs.stat("/orig.txt") {
            Err(Error::NoFile) => (),
            other => panic!("expected NoFile, got {:?}", other.map(|_| ())),
        }
        let info = fs.stat("/moved.txt").unwrap();
        assert_eq!(info.size, 7);
        fs.rename("/moved.txt", "/orig.txt").unwrap();
        let info = fs.stat("/orig.txt").unwrap();
        assert_eq!(info.size, 7);
    }

    #[test]
    fn rename_into_subdirectory_updates_parent_link() {
        let fs = mounted_fs(65536);
        fs.create_dir("/a").unwrap();
        fs.create_dir("/a/b").unwrap();
        fs.rename("/a/b", "/b").unwrap();
        // The moved directory enumerates cleanly from its new home.
        let file = fs
            .open("/b/c.txt", OpenMode::CREATE_NEW | OpenMode::WRITE)
            .unwrap();
        file.close().unwrap();
        fs.change_dir("/b").unwrap();
        assert_eq!(fs.current_dir().unwrap(), "/b");
        fs.change_dir("/").unwrap();
    }

    #[test]
    fn rename_target_exists() {
        let fs = mounted_fs(65536);
        fs.open("/a.txt", OpenMode::CREATE_NEW | OpenMode::WRITE).unwrap().close().unwrap();
        fs.open("/b.txt", OpenMode::CREATE_NEW | OpenMode::WRITE).unwrap().close().unwrap();
        match fs.rename("/a.txt", "/b.txt") {
            Err(Error::Exist) => (),
            other => panic!("expected Exist, got {:?}", other),
        }
    }

    #[test]
    fn numbered_short_names_ladder() {
        let fs = mounted_fs(65536);
        for name in ["/Long Name A.txt", "/Long Name B.txt", "/Long Name C.txt"] {
            fs.open(name, OpenMode::CREATE_NEW | OpenMode::WRITE)
                .unwrap()
                .close()
                .unwrap();
        }
        let a = fs.stat("/Long Name A.txt").unwrap();
        let b = fs.stat("/Long Name B.txt").unwrap();
        let c = fs.stat("/Long Name C.txt").unwrap();
        assert_eq!(a.name, "Long Name A.txt");
        assert_eq!(a.short_name, "LONGNA~1.TXT");
        assert_eq!(b.short_name, "LONGNA~2.TXT");
        assert_eq!(c.short_name, "LONGNA~3.TXT");
        // Short names resolve too.
        assert_eq!(fs.stat("/LONGNA~2.TXT").unwrap().name, "Long Name B.txt");
    }

    #[test]
    fn case_insensitive_lookup_and_exist() {
        let fs = mounted_fs(65536);
        fs.open("/MixedCase.txt", OpenMode::CREATE_NEW | OpenMode::WRITE)
            .unwrap()
            .close()
            .unwrap();
        assert!(fs.stat("/mixedcase.TXT").is_ok());
        match fs.open("/MIXEDCASE.txt", OpenMode::CREATE_NEW | OpenMode::WRITE) {
            Err(Error::Exist) => (),
            other => panic!("expected Exist, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn zero_byte_files_on_fat12() {
        let fs = mounted_fs(2048); // 1 MiB image formats as FAT12
        let (free_before, _) = fs.free_clusters().unwrap();
        for index in 0..64 {
            let name = alloc::format!("/f{:02}", index);
            fs.open(&name, OpenMode::CREATE_NEW | OpenMode::WRITE)
                .unwrap()
                .close()
                .unwrap();
        }
        for index in 0..64 {
            let name = alloc::format!("/f{:02}", index);
            let info = fs.stat(&name).unwrap();
            assert_eq!(info.size, 0);
            assert_eq!(info.sclust, 0);
        }
        let (free_after, _) = fs.free_clusters().unwrap();
        assert_eq!(free_before, free_after);
    }

    #[test]
    fn chmod_read_only_blocks_writes() {
        let fs = mounted_fs(65536);
        fs.open("/ro.txt", OpenMode::CREATE_NEW | OpenMode::WRITE).unwrap().close().unwrap();
        let mut read_only = Attributes::default();
        read_only.set_read_only(true);
        fs.chmod("/ro.txt", read_only, read_only).unwrap();
        match fs.open("/ro.txt", OpenMode::WRITE) {
            Err(Error::Denied) => (),
            other => panic!("expected Denied, got {:?}", other.map(|_| ())),
        }
        match fs.remove("/ro.txt") {
            Err(Error::Denied) => (),
            other => panic!("expected Denied, got {:?}", other),
        }
        fs.chmod("/ro.txt", Attributes::default(), read_only).unwrap();
        fs.remove("/ro.txt").unwrap();
    }

    #[test]
    fn utime_round_trip() {
        let fs = mounted_fs(65536);
        fs.open("/t.txt", OpenMode::CREATE_NEW | OpenMode::WRITE).unwrap().close().unwrap();
        let stamp = Timestamp::new(2001, 2, 3, 4, 5, 6);
        fs.set_times("/t.txt", stamp).unwrap();
        assert_eq!(fs.stat("/t.txt").unwrap().modified, stamp);
    }

    #[test]
    fn chdir_and_getcwd() {
        let fs = mounted_fs(65536);
        fs.create_dir("/deep").unwrap();
        fs.create_dir("/deep/nest").unwrap();
        assert_eq!(fs.current_dir().unwrap(), "/");
        fs.change_dir("/deep/nest").unwrap();
        assert_eq!(fs.current_dir().unwrap(), "/deep/nest");
        // Relative resolution from the current directory.
        fs.open("rel.txt", OpenMode::CREATE_NEW | OpenMode::WRITE).unwrap().close().unwrap();
        assert!(fs.stat("/deep/nest/rel.txt").is_ok());
        fs.change_dir("..").unwrap();
        assert_eq!(fs.current_dir().unwrap(), "/deep");
        fs.change_dir("/").unwrap();
    }

    #[test]
    fn label_round_trip() {
        let fs = mounted_fs(65536);
        let (label, _serial) = fs.label().unwrap();
        assert_eq!(label, "");
        fs.set_label("MYVOLUME").unwrap();
        let (label, _) = fs.label().unwrap();
        assert_eq!(label, "MYVOLUME");
        fs.set_label("").unwrap();
        assert_eq!(fs.label().unwrap().0, "");
    }

    #[test]
    fn readdir_enumerates_and_globs() {
        let fs = mounted_fs(65536);
        fs.create_dir("/dir").unwrap();
        for name in ["/one.txt", "/two.txt", "/three.md"] {
            fs.open(name, OpenMode::CREATE_NEW | OpenMode::WRITE).unwrap().close().unwrap();
        }
        let mut dir = fs.open_dir("/").unwrap();
        let mut seen = Vec::new();
        while let Some(info) = dir.read_entry().unwrap() {
            seen.push(info.name);
        }
        dir.close().unwrap();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().any(|n| n == "dir"));

        let (mut dir, first) = fs.find_first("/", "*.txt").unwrap();
        let mut matches = vec![first.unwrap().name];
        while let Some(info) = dir.read_entry().unwrap() {
            matches.push(info.name);
        }
        dir.close().unwrap();
        matches.sort();
        assert_eq!(matches, ["one.txt", "two.txt"]);
    }

    #[test]
    fn unmount_invalidates_handles() {
        let mut fs = mounted_fs(65536);
        let mut file = fs
            .open("/live.txt", OpenMode::CREATE_NEW | OpenMode::WRITE)
            .unwrap();
        file.write_all(b"data").unwrap();
        file.sync().unwrap();
        fs.unmount().unwrap();
        match file.write(b"more") {
            Err(Error::InvalidObject) => (),
            other => panic!("expected InvalidObject, got {:?}", other),
        }
        match fs.stat("/live.txt") {
            Err(Error::InvalidObject) => (),
            other => panic!("expected InvalidObject, got {:?}", other.map(|_| ())),
        }
        match file.close() {
            Err(Error::InvalidObject) => (),
            other => panic!("expected InvalidObject, got {:?}", other),
        }
    }

    #[test]
    fn eject_returns_device_when_idle() {
        let fs = mounted_fs(65536);
        let file = fs.open("/f", OpenMode::CREATE_NEW | OpenMode::WRITE).unwrap();
        let fs = match fs.try_eject() {
            Err(fs) => fs,
            Ok(_) => panic!("eject must fail while a file is open"),
        };
        file.close().unwrap();
        assert!(fs.try_eject().is_ok());
    }
}
