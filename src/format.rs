//! Media formatting: FAT sub-type and cluster-size selection, volume
//! layout (reserved area, FATs, root directory), boot record and
//! FSInfo emission, and MBR partitioning.

use alloc::vec;
use core::fmt::Debug;

use crate::codec::{store_u16, store_u32};
use crate::error::Error;
use crate::io::IO;
use crate::region::boot::{
    fsinfo_store, BOOT_SIGNATURE, BPB_BK_BOOT_SEC_32, BPB_BYTS_PER_SEC, BPB_FAT_SZ_16,
    BPB_FAT_SZ_32, BPB_FS_INFO_32, BPB_HIDD_SEC, BPB_MEDIA, BPB_NUM_FATS, BPB_NUM_HEADS,
    BPB_ROOT_CLUS_32, BPB_ROOT_ENT_CNT, BPB_RSVD_SEC_CNT, BPB_SEC_PER_CLUS, BPB_SEC_PER_TRK,
    BPB_TOT_SEC_16, BPB_TOT_SEC_32, BS_55AA, BS_BOOT_SIG, BS_BOOT_SIG_32, BS_DRV_NUM,
    BS_DRV_NUM_32, BS_JMP_BOOT, BS_VOL_ID, BS_VOL_ID_32,
};
use crate::region::partition::{store_mbr_entry, MbrEntry, PTE_SYSTEM, MBR_TABLE, PTE_SIZE};
use crate::types::{SectorID, MAX_FAT12, MAX_FAT16, MAX_FAT32};

/// Cluster-size calibration for FAT12/16, volume size in 4K-sector
/// units against doubling cluster sizes.
const CST: [u32; 6] = [1, 4, 16, 64, 256, 512];
/// The FAT32 calibration, in 128K-sector units.
const CST32: [u32; 6] = [1, 2, 4, 8, 16, 32];

/// Sectors per track assumed for the LBA-only CHS fields.
const SECTORS_PER_TRACK: u32 = 63;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FormatKind {
    /// Pick FAT12/16 or FAT32 from the cluster count.
    Any,
    /// FAT12 or FAT16 only.
    Fat,
    /// FAT32 only.
    Fat32,
}

#[derive(Copy, Clone, Debug)]
pub struct FormatOptions {
    pub kind: FormatKind,
    /// 0 formats the whole device; 1..=4 formats that partition of
    /// an existing MBR.
    pub partition: u8,
    /// With `partition` 0: place the volume at sector 0 without a
    /// partition table (true), or write an MBR with one spanning
    /// partition (false).
    pub super_floppy: bool,
    pub n_fats: u8,
    /// Data-area alignment in sectors; 0 takes the device's erase
    /// block size.
    pub align: u32,
    /// FAT12/16 root directory entries; 0 means 512.
    pub root_entries: u16,
    /// Bytes per cluster; 0 selects from the calibration tables.
    pub cluster_size: u32,
    /// Volume serial number; 0 derives one from the geometry.
    pub serial: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            kind: FormatKind::Any,
            partition: 0,
            super_floppy: true,
            n_fats: 2,
            align: 0,
            root_entries: 0,
            cluster_size: 0,
            serial: 0,
        }
    }
}

#[derive(Copy, Clone, PartialEq)]
enum Layout {
    Fat12,
    Fat16,
    Fat32,
}

/// Format a FAT volume onto `device` per `options`.
#[cfg_attr(not(feature = "async"), deasync::deasync)]
pub async fn mkfs<E: Debug, D: IO<Error = E>>(
    device: &mut D,
    options: &FormatOptions,
) -> Result<(), Error<E>> {
    let ss = device.sector_size();
    if !ss.is_power_of_two() || !(512..=4096).contains(&ss) {
        return Err(Error::InvalidParameter);
    }
    if device.write_protected() {
        return Err(Error::WriteProtected);
    }
    let ss = ss as usize;
    if options.n_fats != 1 && options.n_fats != 2 {
        return Err(Error::InvalidParameter);
    }
    let n_fat = options.n_fats as u32;
    let n_root = match options.root_entries {
        0 => 512,
        n if n as usize % (ss / 32) == 0 => n,
        _ => return Err(Error::InvalidParameter),
    };
    let sz_au = match options.cluster_size {
        0 => 0u32,
        bytes if bytes as usize % ss == 0 && (bytes as usize / ss).is_power_of_two() => {
            bytes / ss as u32
        }
        _ => return Err(Error::InvalidParameter),
    };
    let sz_blk = match options.align {
        0 => match device.block_size() {
            n if n.is_power_of_two() => n,
            _ => 1,
        },
        n if n.is_power_of_two() => n,
        _ => return Err(Error::InvalidParameter),
    };
    let mut buf = vec![0u8; ss];

    // Locate the area being formatted.
    let (b_vol, sz_vol) = match options.partition {
        0 => {
            let total = device.sector_count();
            let base = if options.super_floppy { 0u64 } else { SECTORS_PER_TRACK as u64 };
            if total <= base {
                return Err(Error::MkfsAborted);
            }
            (base, total - base)
        }
        p @ 1..=4 => {
            device.read(SectorID::MBR, &mut buf).await.map_err(Error::Io)?;
            if buf[BS_55AA..BS_55AA + 2] != BOOT_SIGNATURE {
                return Err(Error::MkfsAborted);
            }
            let entry = MbrEntry::load(&buf, p as usize - 1);
            if !entry.present() {
                return Err(Error::MkfsAborted);
            }
            (entry.start as u64, entry.size as u64)
        }
        _ => return Err(Error::InvalidParameter),
    };
    if sz_vol < 128 {
        return Err(Error::MkfsAborted);
    }
    if sz_au > 128 {
        return Err(Error::InvalidParameter);
    }

    let mut layout = match options.kind {
        FormatKind::Fat32 => Layout::Fat32,
        _ => Layout::Fat16,
    };
    let mut sz_au = sz_au;
    let (pau, n_clst, sz_rsv, sz_fat, sz_dir, b_fat);
    loop {
        let mut au = sz_au;
        let mut rsv;
        let mut fat;
        let dir;
        if layout == Layout::Fat32 {
            if au == 0 {
                let n = (sz_vol / 0x20000) as u32;
                au = 1;
                for &bound in CST32.iter() {
                    if bound > n {
                        break;
                    }
                    au <<= 1;
                }
            }
            let pre_clst = (sz_vol / au as u64) as u32;
            fat = (pre_clst * 4 + 8 + ss as u32 - 1) / ss as u32;
            rsv = 32;
            dir = 0;
            if pre_clst <= MAX_FAT16 || pre_clst > MAX_FAT32 {
                return Err(Error::MkfsAborted);
            }
        } else {
            if au == 0 {
                let n = (sz_vol / 0x1000) as u32;
                au = 1;
                for &bound in CST.iter() {
                    if bound > n {
                        break;
                    }
                    au <<= 1;
                }
            }
            let pre_clst = (sz_vol / au as u64) as u32;
            let fat_bytes = if pre_clst > MAX_FAT12 {
                layout = Layout::Fat16;
                pre_clst * 2 + 4
            } else {
                layout = Layout::Fat12;
                (pre_clst * 3 + 1) / 2 + 3
            };
            fat = (fat_bytes + ss as u32 - 1) / ss as u32;
            rsv = 1;
            dir = n_root as u32 * 32 / ss as u32;
        }
        let mut fat_base = b_vol + rsv as u64;
        let data_base = fat_base + (fat * n_fat + dir) as u64;

        // Pull the data area onto an erase-block boundary.
        let blk = sz_blk as u64;
        let mut slack = ((data_base + blk - 1) & !(blk - 1)) - data_base;
        if layout == Layout::Fat32 {
            rsv += slack as u32;
            fat_base += slack;
        } else {
            if slack % n_fat as u64 != 0 {
                slack -= 1;
                rsv += 1;
                fat_base += 1;
            }
            fat += (slack / n_fat as u64) as u32;
        }
        let data_base = fat_base + (fat * n_fat + dir) as u64;

        if sz_vol < data_base - b_vol + au as u64 * 16 {
            return Err(Error::MkfsAborted);
        }
        let clst = ((sz_vol - rsv as u64 - (fat * n_fat) as u64 - dir as u64) / au as u64) as u32;
        match layout {
            Layout::Fat32 => {
                if clst <= MAX_FAT16 {
                    if sz_au == 0 && au / 2 != 0 {
                        sz_au = au / 2;
                        continue;
                    }
                    return Err(Error::MkfsAborted);
                }
            }
            Layout::Fat16 => {
                if clst > MAX_FAT16 {
                    if sz_au == 0 && au * 2 <= 64 {
                        sz_au = au * 2;
                        continue;
                    }
                    if options.kind == FormatKind::Any {
                        layout = Layout::Fat32;
                        continue;
                    }
                    if sz_au == 0 && au * 2 <= 128 {
                        sz_au = au * 2;
                        continue;
                    }
                    return Err(Error::MkfsAborted);
                }
                if clst <= MAX_FAT12 {
                    if sz_au == 0 && au * 2 <= 128 {
                        sz_au = au * 2;
                        continue;
                    }
                    return Err(Error::MkfsAborted);
                }
            }
            Layout::Fat12 => {
                if clst > MAX_FAT12 {
                    return Err(Error::MkfsAborted);
                }
            }
        }
        pau = au;
        n_clst = clst;
        sz_rsv = rsv;
        sz_fat = fat;
        sz_dir = dir;
        b_fat = fat_base;
        break;
    }
    let serial = match options.serial {
        0 => (sz_vol as u32) ^ n_clst.rotate_left(16) ^ 0x4D53_4654,
        n => n,
    };
    device
        .trim(SectorID::from(b_vol), SectorID::from(b_vol + sz_vol - 1))
        .await
        .map_err(Error::Io)?;

    // Volume boot record.
    buf.fill(0);
    buf[BS_JMP_BOOT..BS_JMP_BOOT + 11].copy_from_slice(b"\xEB\xFE\x90MSDOS5.0");
    store_u16(&mut buf[BPB_BYTS_PER_SEC..], ss as u16);
    buf[BPB_SEC_PER_CLUS] = pau as u8;
    store_u16(&mut buf[BPB_RSVD_SEC_CNT..], sz_rsv as u16);
    buf[BPB_NUM_FATS] = n_fat as u8;
    let root_entries = match layout {
        Layout::Fat32 => 0,
        _ => n_root,
    };
    store_u16(&mut buf[BPB_ROOT_ENT_CNT..], root_entries);
    if sz_vol < 0x10000 {
        store_u16(&mut buf[BPB_TOT_SEC_16..], sz_vol as u16);
    } else {
        store_u32(&mut buf[BPB_TOT_SEC_32..], sz_vol as u32);
    }
    buf[BPB_MEDIA] = 0xF8;
    store_u16(&mut buf[BPB_SEC_PER_TRK..], SECTORS_PER_TRACK as u16);
    store_u16(&mut buf[BPB_NUM_HEADS..], 255);
    store_u32(&mut buf[BPB_HIDD_SEC..], b_vol as u32);
    if layout == Layout::Fat32 {
        store_u32(&mut buf[BS_VOL_ID_32..], serial);
        store_u32(&mut buf[BPB_FAT_SZ_32..], sz_fat);
        store_u32(&mut buf[BPB_ROOT_CLUS_32..], 2);
        store_u16(&mut buf[BPB_FS_INFO_32..], 1);
        store_u16(&mut buf[BPB_BK_BOOT_SEC_32..], 6);
        buf[BS_DRV_NUM_32] = 0x80;
        buf[BS_BOOT_SIG_32] = 0x29;
        buf[BS_VOL_ID_32 + 4..BS_VOL_ID_32 + 23].copy_from_slice(b"NO NAME    FAT32   ");
    } else {
        store_u32(&mut buf[BS_VOL_ID..], serial);
        store_u16(&mut buf[BPB_FAT_SZ_16..], sz_fat as u16);
        buf[BS_DRV_NUM] = 0x80;
        buf[BS_BOOT_SIG] = 0x29;
        buf[BS_VOL_ID + 4..BS_VOL_ID + 23].copy_from_slice(b"NO NAME    FAT     ");
    }
    buf[BS_55AA..BS_55AA + 2].copy_from_slice(&BOOT_SIGNATURE);
    device.write(SectorID::from(b_vol), &buf).await.map_err(Error::Io)?;

    if layout == Layout::Fat32 {
        // Backup boot record and both FSInfo copies.
        device.write(SectorID::from(b_vol + 6), &buf).await.map_err(Error::Io)?;
        fsinfo_store(&mut buf, n_clst - 1, 2);
        device.write(SectorID::from(b_vol + 7), &buf).await.map_err(Error::Io)?;
        device.write(SectorID::from(b_vol + 1), &buf).await.map_err(Error::Io)?;
    }

    // FATs, seeded with the media descriptor entries.
    let mut sect = b_fat;
    for _ in 0..n_fat {
        buf.fill(0);
        match layout {
            Layout::Fat32 => {
                store_u32(&mut buf[0..], 0xFFFF_FFF8);
                store_u32(&mut buf[4..], 0xFFFF_FFFF);
                store_u32(&mut buf[8..], 0x0FFF_FFFF); // root directory
            }
            Layout::Fat16 => store_u32(&mut buf[0..], 0xFFFF_FFF8),
            Layout::Fat12 => store_u32(&mut buf[0..], 0x00FF_FFF8),
        }
        for index in 0..sz_fat {
            device.write(SectorID::from(sect + index as u64), &buf).await.map_err(Error::Io)?;
            buf.fill(0);
        }
        sect += sz_fat as u64;
    }

    // Root directory: the fixed table, or cluster 2 on FAT32.
    let root_sectors = match layout {
        Layout::Fat32 => pau,
        _ => sz_dir,
    };
    buf.fill(0);
    for index in 0..root_sectors {
        device.write(SectorID::from(sect + index as u64), &buf).await.map_err(Error::Io)?;
    }

    let system_id = match layout {
        Layout::Fat32 => 0x0C,
        _ if sz_vol >= 0x10000 => 0x06,
        Layout::Fat16 => 0x04,
        Layout::Fat12 => 0x01,
    };
    if options.partition >= 1 {
        // Refresh the system ID of the formatted partition.
        device.read(SectorID::MBR, &mut buf).await.map_err(Error::Io)?;
        let offset = MBR_TABLE + (options.partition as usize - 1) * PTE_SIZE;
        buf[offset + PTE_SYSTEM] = system_id;
        device.write(SectorID::MBR, &buf).await.map_err(Error::Io)?;
    } else if !options.super_floppy {
        create_partition(device, &mut buf, &[sz_vol], system_id).await?;
    }
    device.flush().await.map_err(Error::Io)?;
    debug!(
        "formatted {} sectors at {}: {} clusters of {} sectors",
        sz_vol, b_vol, n_clst, pau
    );
    Ok(())
}

/// Write an MBR with up to four primary partitions. Entries of
/// `sizes` at or below 100 are percentages of the drive, larger
/// values are absolute sector counts.
#[cfg_attr(not(feature = "async"), deasync::deasync)]
pub async fn fdisk<E: Debug, D: IO<Error = E>>(
    device: &mut D,
    sizes: &[u64],
) -> Result<(), Error<E>> {
    let ss = device.sector_size() as usize;
    if device.write_protected() {
        return Err(Error::WriteProtected);
    }
    let mut buf = vec![0u8; ss];
    // System ID is provisional; mkfs on the partition refines it.
    create_partition(device, &mut buf, sizes, 0x07).await
}

#[cfg_attr(not(feature = "async"), deasync::deasync)]
async fn create_partition<E: Debug, D: IO<Error = E>>(
    device: &mut D,
    buf: &mut [u8],
    sizes: &[u64],
    system_id: u8,
) -> Result<(), Error<E>> {
    let sz_drv = device.sector_count();
    // CHS fields are synthesized for LBA-only use.
    let mut n_hd = 8u32;
    while n_hd != 0 && sz_drv / n_hd as u64 / SECTORS_PER_TRACK as u64 > 1024 {
        n_hd = n_hd.wrapping_mul(2) & 0xFF;
    }
    if n_hd == 0 {
        n_hd = 255;
    }
    buf.fill(0);
    let mut start = SECTORS_PER_TRACK as u64;
    for (index, &requested) in sizes.iter().take(4).enumerate() {
        if start == 0 || start >= sz_drv {
            break;
        }
        let mut count = match requested {
            0 => break,
            100 => sz_drv,
            p if p < 100 => sz_drv / 100 * p,
            n => n,
        };
        if start + count > sz_drv || start + count < start {
            count = sz_drv - start;
        }
        if count == 0 {
            break;
        }
        store_mbr_entry(buf, index, system_id, start as u32, count as u32);
        start += count;
    }
    buf[BS_55AA..BS_55AA + 2].copy_from_slice(&BOOT_SIGNATURE);
    device.write(SectorID::MBR, buf).await.map_err(Error::Io)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::load_u16;
    use crate::io::mem::RamDisk;

    #[test]
    fn fdisk_lays_out_entries() {
        let mut disk = RamDisk::new(131072, 512);
        fdisk(&mut disk, &[50, 50]).unwrap();
        let sector = &disk.as_bytes()[..512];
        assert_eq!(sector[BS_55AA..BS_55AA + 2], BOOT_SIGNATURE);
        let first = MbrEntry::load(sector, 0);
        let second = MbrEntry::load(sector, 1);
        assert!(first.present() && second.present());
        assert_eq!(first.start, SECTORS_PER_TRACK);
        assert_eq!(second.start, first.start + first.size);
    }

    #[test]
    fn mkfs_rejects_tiny_media() {
        let mut disk = RamDisk::new(64, 512);
        match mkfs(&mut disk, &FormatOptions::default()) {
            Err(Error::MkfsAborted) => (),
            other => panic!("expected MkfsAborted, got {:?}", other),
        }
    }

    #[test]
    fn forced_fat32_needs_enough_clusters() {
        let mut disk = RamDisk::new(2048, 512);
        let options = FormatOptions { kind: FormatKind::Fat32, ..Default::default() };
        match mkfs(&mut disk, &options) {
            Err(Error::MkfsAborted) => (),
            other => panic!("expected MkfsAborted, got {:?}", other),
        }
    }

    #[test]
    fn mkfs_with_partition_table() {
        let mut disk = RamDisk::new(131072, 512);
        let options = FormatOptions { super_floppy: false, ..Default::default() };
        mkfs(&mut disk, &options).unwrap();
        let sector = &disk.as_bytes()[..512];
        let entry = MbrEntry::load(sector, 0);
        assert!(entry.present());
        assert_eq!(entry.start, SECTORS_PER_TRACK);
        // Volume boot record sits at the partition start.
        let vbr_at = entry.start as usize * 512;
        let vbr = &disk.as_bytes()[vbr_at..vbr_at + 512];
        assert_eq!(vbr[BS_55AA..BS_55AA + 2], BOOT_SIGNATURE);
        assert_eq!(load_u16(&vbr[BPB_BYTS_PER_SEC..]), 512);
    }
}
