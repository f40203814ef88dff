//! The mounted-volume record: geometry, the sector window, FSInfo
//! bookkeeping and the mount pipeline (partition discovery, BPB
//! validation, sub-type inference).

use alloc::vec;
use alloc::vec::Vec;
use core::fmt::Debug;
use core::sync::atomic::{AtomicU32, Ordering};

use log::{debug, trace, warn};

use crate::clock::{ClockFn, Timestamp};
use crate::codec::load_u32;
use crate::codepage::{Codepage, CP437};
use crate::dir::lfn::LFN_BUF;
use crate::error::Error;
use crate::io::{Wrapper, IO};
use crate::region::boot::{self, BootKind, RawBpb, FREE_COUNT_UNKNOWN};
use crate::region::partition::{self, MbrEntry};
use crate::registry::Registry;
use crate::types::{FatType, SectorID, MAX_FAT12, MAX_FAT16};

/// Mount generation counter; handles capture the value at open and
/// go stale when the volume is remounted.
static FSID: AtomicU32 = AtomicU32::new(0);

#[derive(Copy, Clone)]
pub struct MountOptions {
    /// Partition to mount: 0 scans (super-floppy first, then the
    /// partition table), 1..=4 force a primary partition, larger
    /// values walk the EBR chain to a logical partition.
    pub partition: u8,
    pub codepage: &'static Codepage,
    /// Timestamp source; `None` records zero timestamps.
    pub clock: Option<ClockFn>,
    /// Emit TRIM hints when cluster chains are freed.
    pub trim: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self { partition: 0, codepage: &CP437, clock: None, trim: false }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum FsInfoState {
    /// Not a FAT32 volume, or FSInfo not usable.
    Disabled,
    Clean,
    Dirty,
}

pub(crate) struct Volume<D> {
    pub io: Wrapper<D>,
    pub id: u32,
    pub fs_type: FatType,
    /// Bytes per sector.
    pub ss: u16,
    /// Sectors per cluster.
    pub csize: u16,
    pub n_fats: u8,
    /// Fixed root-directory entry count; 0 on FAT32.
    pub n_rootdir: u16,
    /// Total FAT entries, usable clusters + 2.
    pub n_fatent: u32,
    /// Sectors per FAT.
    pub fsize: u32,
    pub volbase: SectorID,
    pub fatbase: SectorID,
    /// First sector of the fixed root directory (FAT12/16); for
    /// FAT32 the sector of the root cluster.
    pub dirbase: SectorID,
    /// Root directory start cluster, 0 on FAT12/16.
    pub root_clst: u32,
    pub database: SectorID,
    /// Hint where the next allocation scan starts.
    pub last_clst: u32,
    /// Cached free-cluster count, [`FREE_COUNT_UNKNOWN`] until known.
    pub free_clst: u32,
    pub fsi_state: FsInfoState,
    /// Volume serial number from the VBR.
    pub vsn: u32,
    win: Vec<u8>,
    winsect: Option<SectorID>,
    wflag: bool,
    /// Long-name working buffer, one reconstruction at a time.
    pub lfnbuf: [u16; LFN_BUF],
    /// Current directory start cluster, 0 is the root.
    pub cdir: u32,
    pub codepage: &'static Codepage,
    pub clock: Option<ClockFn>,
    pub trim: bool,
    pub registry: Registry,
}

impl<D> Volume<D> {
    pub fn win(&self) -> &[u8] {
        &self.win
    }

    /// Mutable view of the window; the window becomes dirty.
    pub fn win_mut(&mut self) -> &mut [u8] {
        self.wflag = true;
        &mut self.win
    }

    pub fn window_sector(&self) -> Option<SectorID> {
        self.winsect
    }

    /// Refresh the window from data that just went to the device;
    /// the copy is clean by definition.
    pub fn overlay_window(&mut self, data: &[u8]) {
        self.win.copy_from_slice(data);
        self.wflag = false;
    }

    pub fn window_dirty(&self) -> bool {
        self.wflag
    }

    pub fn ssize(&self) -> usize {
        self.ss as usize
    }

    /// Bytes per cluster.
    pub fn cluster_bytes(&self) -> u32 {
        self.csize as u32 * self.ss as u32
    }

    /// First sector of a data cluster.
    pub fn clst2sect(&self, cluster: u32) -> SectorID {
        self.database + (cluster as u64 - 2) * self.csize as u64
    }

    pub fn now(&self) -> Timestamp {
        match self.clock {
            Some(clock) => clock(),
            None => Timestamp::default(),
        }
    }

    /// Highest valid cluster number plus one.
    pub fn valid_cluster(&self, cluster: u32) -> bool {
        (2..self.n_fatent).contains(&cluster)
    }
}

#[cfg_attr(not(feature = "async"), deasync::deasync)]
impl<E: Debug, D: IO<Error = E>> Volume<D> {
    /// Bring `sector` into the window, flushing previous content if
    /// dirty. A failed read invalidates the window.
    pub async fn move_window(&mut self, sector: SectorID) -> Result<(), Error<E>> {
        if self.winsect == Some(sector) {
            return Ok(());
        }
        self.sync_window().await?;
        if let Err(e) = self.io.read(sector, &mut self.win).await {
            self.winsect = None;
            return Err(e);
        }
        self.winsect = Some(sector);
        self.wflag = false;
        Ok(())
    }

    /// Write the window back if dirty. A window inside FAT #1 is
    /// mirrored to FAT #2 here and nowhere else.
    pub async fn sync_window(&mut self) -> Result<(), Error<E>> {
        let sector = match (self.wflag, self.winsect) {
            (true, Some(sector)) => sector,
            _ => return Ok(()),
        };
        self.io.write(sector, &self.win).await?;
        self.wflag = false;
        let in_fat = sector >= self.fatbase && sector - self.fatbase < self.fsize as u64;
        if in_fat && self.n_fats == 2 {
            let mirror = sector + self.fsize;
            if self.io.write(mirror, &self.win).await.is_err() {
                warn!("FAT mirror write failed at sector {}", mirror);
            }
        }
        Ok(())
    }

    pub fn invalidate_window(&mut self) {
        self.winsect = None;
        self.wflag = false;
    }

    /// Flush everything the volume caches: the window, FSInfo when
    /// dirty, then the device itself.
    pub async fn sync_fs(&mut self) -> Result<(), Error<E>> {
        self.sync_window().await?;
        if self.fsi_state == FsInfoState::Dirty && self.fs_type == FatType::Fat32 {
            // Rebuild the FSInfo sector in the window and let
            // sync_window carry it out.
            self.winsect = Some(self.volbase + 1u32);
            let (free, last) = (self.free_clst, self.last_clst);
            boot::fsinfo_store(self.win_mut(), free, last);
            self.sync_window().await?;
            self.fsi_state = FsInfoState::Clean;
        }
        self.io.flush().await
    }

    /// Load and classify one sector as a boot record.
    async fn check_fs(&mut self, sector: SectorID) -> Result<BootKind, Error<E>> {
        self.invalidate_window();
        self.move_window(sector).await?;
        Ok(boot::classify(&self.win))
    }

    /// Locate the FAT VBR: super-floppy, MBR primary, EBR logical or
    /// GPT partition, per the requested partition number.
    async fn find_volume(&mut self, partition: u8) -> Result<SectorID, Error<E>> {
        let kind = self.check_fs(SectorID::MBR).await?;
        if kind == BootKind::FatVbr && partition == 0 {
            return Ok(SectorID::MBR);
        }
        if kind == BootKind::Invalid {
            return Err(Error::NoFilesystem);
        }
        // Sector 0 is a boot sector but not a FAT VBR: read it as a
        // partition table.
        let first = MbrEntry::load(&self.win, 0);
        let base = if first.system == partition::SYSTEM_GPT_PROTECTIVE {
            self.find_gpt_partition(partition).await?
        } else if partition > 4 {
            self.find_logical_partition(partition - 4).await?
        } else {
            let mut base = None;
            for index in 0..4 {
                let entry = MbrEntry::load(&self.win, index);
                match partition {
                    0 if entry.present() => {
                        // Auto scan probes each primary in order.
                        if self.check_fs(SectorID::from(entry.start as u64)).await? == BootKind::FatVbr {
                            return Ok(SectorID::from(entry.start as u64));
                        }
                        self.check_fs(SectorID::MBR).await?;
                    }
                    p if p as usize == index + 1 => {
                        base = Some(entry);
                        break;
                    }
                    _ => (),
                }
            }
            let entry = base.ok_or(Error::NoFilesystem)?;
            if !entry.present() {
                return Err(Error::NoFilesystem);
            }
            SectorID::from(entry.start as u64)
        };
        match self.check_fs(base).await? {
            BootKind::FatVbr => Ok(base),
            _ => Err(Error::NoFilesystem),
        }
    }

    /// Walk the EBR chain to the `hops`-th logical partition.
    async fn find_logical_partition(&mut self, mut hops: u8) -> Result<SectorID, Error<E>> {
        let extended = (0..4)
            .map(|i| MbrEntry::load(&self.win, i))
            .find(|e| e.present() && e.is_extended())
            .ok_or(Error::NoFilesystem)?;
        let ext_base = SectorID::from(extended.start as u64);
        let mut ebr = ext_base;
        loop {
            self.check_fs(ebr).await?;
            let logical = MbrEntry::load(&self.win, 0);
            if !logical.present() {
                return Err(Error::NoFilesystem);
            }
            hops -= 1;
            if hops == 0 {
                return Ok(ebr + logical.start);
            }
            let link = MbrEntry::load(&self.win, 1);
            if !link.present() || !link.is_extended() {
                return Err(Error::NoFilesystem);
            }
            ebr = ext_base + link.start;
        }
    }

    /// Pick a partition out of the GPT entry array. `partition` 0
    /// takes the first FAT VBR found.
    async fn find_gpt_partition(&mut self, partition: u8) -> Result<SectorID, Error<E>> {
        self.move_window(SectorID::from(1u64)).await?;
        if !partition::is_gpt_header(&self.win) {
            return Err(Error::NoFilesystem);
        }
        let entries_lba = crate::codec::load_u64(&self.win[partition::GPT_ENTRIES_LBA..]);
        let num_entries = load_u32(&self.win[partition::GPT_NUM_ENTRIES..]).min(128);
        let entry_size = load_u32(&self.win[partition::GPT_ENTRY_SIZE..]) as usize;
        if entry_size == 0 || entry_size % 8 != 0 || entry_size > self.ssize() {
            return Err(Error::NoFilesystem);
        }
        let mut candidates: heapless::Vec<u64, 128> = heapless::Vec::new();
        let per_sector = self.ssize() / entry_size;
        let mut index = 0;
        while index < num_entries as usize {
            let sector = SectorID::from(entries_lba + (index / per_sector) as u64);
            self.move_window(sector).await?;
            for slot in 0..per_sector {
                if index >= num_entries as usize {
                    break;
                }
                let entry = &self.win[slot * entry_size..(slot + 1) * entry_size];
                if let Some(start) = partition::gpt_entry_start(entry) {
                    candidates.push(start).ok();
                }
                index += 1;
            }
        }
        match partition {
            0 => {
                for &start in candidates.iter() {
                    if self.check_fs(SectorID::from(start)).await? == BootKind::FatVbr {
                        return Ok(SectorID::from(start));
                    }
                }
                Err(Error::NoFilesystem)
            }
            p => {
                let start = *candidates.get(p as usize - 1).ok_or(Error::NoFilesystem)?;
                Ok(SectorID::from(start))
            }
        }
    }

    /// Mount pipeline: locate the VBR, validate the BPB, derive
    /// geometry, classify the sub-type and load FSInfo.
    pub async fn mount(device: D, options: MountOptions) -> Result<Self, Error<E>> {
        let ss = device.sector_size();
        if !ss.is_power_of_two() || !(512..=4096).contains(&ss) {
            return Err(Error::InvalidParameter);
        }
        let mut volume = Self {
            io: Wrapper::new(device),
            id: 0,
            fs_type: FatType::Fat12,
            ss,
            csize: 0,
            n_fats: 0,
            n_rootdir: 0,
            n_fatent: 0,
            fsize: 0,
            volbase: SectorID::MBR,
            fatbase: SectorID::MBR,
            dirbase: SectorID::MBR,
            root_clst: 0,
            database: SectorID::MBR,
            last_clst: FREE_COUNT_UNKNOWN,
            free_clst: FREE_COUNT_UNKNOWN,
            fsi_state: FsInfoState::Disabled,
            vsn: 0,
            win: vec![0u8; ss as usize],
            winsect: None,
            wflag: false,
            lfnbuf: [0; LFN_BUF],
            cdir: 0,
            codepage: options.codepage,
            clock: options.clock,
            trim: options.trim,
            registry: Registry::default(),
        };
        let bsect = volume.find_volume(options.partition).await?;
        volume.init_from_vbr(bsect)?;
        if volume.fs_type == FatType::Fat32 {
            volume.load_fsinfo(bsect).await?;
        }
        volume.id = FSID.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            "mounted {} volume at sector {}: {} clusters of {} bytes",
            volume.fs_type,
            bsect,
            volume.n_fatent - 2,
            volume.cluster_bytes()
        );
        Ok(volume)
    }

    fn init_from_vbr(&mut self, bsect: SectorID) -> Result<(), Error<E>> {
        let bpb = RawBpb::load(&self.win);
        if bpb.bytes_per_sector != self.ss {
            return Err(Error::NoFilesystem);
        }
        let fasize = bpb.fat_size();
        if fasize == 0 {
            return Err(Error::NoFilesystem);
        }
        self.fsize = fasize;
        self.n_fats = bpb.n_fats;
        if self.n_fats != 1 && self.n_fats != 2 {
            return Err(Error::NoFilesystem);
        }
        let fat_area = fasize * self.n_fats as u32;
        if bpb.sectors_per_cluster == 0 || !bpb.sectors_per_cluster.is_power_of_two() {
            return Err(Error::NoFilesystem);
        }
        self.csize = bpb.sectors_per_cluster as u16;
        self.n_rootdir = bpb.root_entries;
        let entries_per_sector = self.ss as u32 / 32;
        if self.n_rootdir as u32 % entries_per_sector != 0 {
            return Err(Error::NoFilesystem);
        }
        let tsect = bpb.total_sectors();
        let nrsv = bpb.reserved_sectors as u32;
        if nrsv == 0 {
            return Err(Error::NoFilesystem);
        }
        let sysect = nrsv + fat_area + self.n_rootdir as u32 / entries_per_sector;
        if tsect < sysect {
            return Err(Error::NoFilesystem);
        }
        let nclst = (tsect - sysect) / self.csize as u32;
        if nclst == 0 {
            return Err(Error::NoFilesystem);
        }
        self.fs_type = match nclst {
            n if n <= MAX_FAT12 => FatType::Fat12,
            n if n <= MAX_FAT16 => FatType::Fat16,
            _ => FatType::Fat32,
        };
        self.n_fatent = nclst + 2;
        self.volbase = bsect;
        self.fatbase = bsect + nrsv;
        self.database = bsect + sysect;
        let needed_fat_bytes = match self.fs_type {
            FatType::Fat32 => {
                if bpb.fs_version != 0 || self.n_rootdir != 0 {
                    return Err(Error::NoFilesystem);
                }
                self.root_clst = bpb.root_cluster;
                if !self.valid_cluster(self.root_clst) {
                    return Err(Error::NoFilesystem);
                }
                self.dirbase = self.clst2sect(self.root_clst);
                self.n_fatent * 4
            }
            FatType::Fat16 => {
                if self.n_rootdir == 0 {
                    return Err(Error::NoFilesystem);
                }
                self.dirbase = self.fatbase + fat_area;
                self.n_fatent * 2
            }
            FatType::Fat12 => {
                if self.n_rootdir == 0 {
                    return Err(Error::NoFilesystem);
                }
                self.dirbase = self.fatbase + fat_area;
                self.n_fatent * 3 / 2 + (self.n_fatent & 1)
            }
        };
        if self.fsize < (needed_fat_bytes + self.ss as u32 - 1) / self.ss as u32 {
            return Err(Error::NoFilesystem);
        }
        self.vsn = match self.fs_type {
            FatType::Fat32 => load_u32(&self.win[boot::BS_VOL_ID_32..]),
            _ => load_u32(&self.win[boot::BS_VOL_ID..]),
        };
        self.last_clst = FREE_COUNT_UNKNOWN;
        self.free_clst = FREE_COUNT_UNKNOWN;
        self.fsi_state = FsInfoState::Disabled;
        Ok(())
    }

    async fn load_fsinfo(&mut self, bsect: SectorID) -> Result<(), Error<E>> {
        let bpb = RawBpb::load(&self.win);
        if bpb.fsinfo_sector != 1 {
            return Ok(());
        }
        self.move_window(bsect + 1u32).await?;
        self.fsi_state = FsInfoState::Clean;
        if boot::fsinfo_valid(&self.win) {
            let free = load_u32(&self.win[boot::FSI_FREE_COUNT..]);
            let last = load_u32(&self.win[boot::FSI_NXT_FREE..]);
            if free <= self.n_fatent - 2 {
                self.free_clst = free;
            }
            if self.valid_cluster(last) {
                self.last_clst = last;
            }
            trace!("FSInfo: {} free, next {}", free, last);
        }
        Ok(())
    }

    /// Note a change in cluster accounting so sync rewrites FSInfo.
    pub fn touch_fsinfo(&mut self) {
        if self.fsi_state != FsInfoState::Disabled {
            self.fsi_state = FsInfoState::Dirty;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::format::{fdisk, mkfs, FormatOptions};
    use crate::io::mem::RamDisk;
    use crate::types::FatType;

    fn formatted(sectors: u64) -> RamDisk {
        let mut disk = RamDisk::new(sectors, 512);
        mkfs(&mut disk, &FormatOptions::default()).unwrap();
        disk
    }

    #[test]
    fn mounts_fat12_on_tiny_volume() {
        let disk = formatted(2048); // 1 MiB
        let volume = Volume::mount(disk, MountOptions::default()).unwrap();
        assert_eq!(volume.fs_type, FatType::Fat12);
        assert!(volume.n_fatent - 2 <= MAX_FAT12);
    }

    #[test]
    fn mounts_fat16_on_mid_volume() {
        let disk = formatted(65536); // 32 MiB
        let volume = Volume::mount(disk, MountOptions::default()).unwrap();
        assert_eq!(volume.fs_type, FatType::Fat16);
    }

    #[test]
    fn mounts_fat32_on_large_volume() {
        // FAT32 starts above 65524 clusters; 512-byte clusters keep
        // the image small.
        let mut disk = RamDisk::new(70000, 512);
        let options = FormatOptions {
            kind: crate::format::FormatKind::Fat32,
            cluster_size: 512,
            ..Default::default()
        };
        mkfs(&mut disk, &options).unwrap();
        let volume = Volume::mount(disk, MountOptions::default()).unwrap();
        assert_eq!(volume.fs_type, FatType::Fat32);
        assert!(volume.root_clst >= 2);
        // FSInfo supplies the allocation hints on a fresh volume.
        assert_ne!(volume.free_clst, FREE_COUNT_UNKNOWN);
    }

    #[test]
    fn rejects_blank_media() {
        let disk = RamDisk::new(2048, 512);
        match Volume::mount(disk, MountOptions::default()) {
            Err(Error::NoFilesystem) => (),
            other => panic!("expected NoFilesystem, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn mounts_partitioned_media() {
        let mut disk = RamDisk::new(131072, 512);
        fdisk(&mut disk, &[100]).unwrap();
        let mut options = FormatOptions::default();
        options.partition = 1;
        mkfs(&mut disk, &options).unwrap();
        let mount = MountOptions { partition: 1, ..Default::default() };
        let volume = Volume::mount(disk, mount).unwrap();
        assert!(u64::from(volume.volbase) > 0);
    }

    #[test]
    fn geometry_invariants() {
        let disk = formatted(131072);
        let volume = Volume::mount(disk, MountOptions::default()).unwrap();
        let fat_area = volume.fsize as u64 * volume.n_fats as u64;
        assert!(volume.database - volume.fatbase >= fat_area);
        assert_eq!(volume.clst2sect(2), volume.database);
    }
}
