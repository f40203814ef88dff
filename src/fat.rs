//! FAT access layer: reading and writing allocation-table cells
//! across the FAT12/16/32 bit layouts, chain removal and extension,
//! the cluster-linkage map and the free-count scan.
//!
//! FAT12 cells are 12 bits wide and may straddle a sector boundary;
//! the two halves are always assembled through the sector window so
//! no caller ever special-cases the split.

use core::fmt::Debug;

use log::{debug, trace};

use crate::codec::{load_u16, load_u32, store_u16, store_u32};
use crate::error::Error;
use crate::io::IO;
use crate::region::boot::FREE_COUNT_UNKNOWN;
use crate::types::FatType;
use crate::volume::Volume;

#[cfg_attr(not(feature = "async"), deasync::deasync)]
impl<E: Debug, D: IO<Error = E>> Volume<D> {
    /// Read the FAT cell of `cluster`: the next link, 0 when free,
    /// or a value at or beyond `n_fatent` marking end of chain.
    pub(crate) async fn get_fat(&mut self, cluster: u32) -> Result<u32, Error<E>> {
        if !self.valid_cluster(cluster) {
            return Err(Error::IntErr);
        }
        let ss = self.ssize() as u32;
        match self.fs_type {
            FatType::Fat12 => {
                let mut bc = cluster + cluster / 2;
                self.move_window(self.fatbase + bc / ss).await?;
                let mut cell = self.win()[(bc % ss) as usize] as u16;
                bc += 1;
                self.move_window(self.fatbase + bc / ss).await?;
                cell |= (self.win()[(bc % ss) as usize] as u16) << 8;
                let value = match cluster & 1 {
                    0 => cell & 0xFFF,
                    _ => cell >> 4,
                };
                Ok(value as u32)
            }
            FatType::Fat16 => {
                self.move_window(self.fatbase + cluster / (ss / 2)).await?;
                let offset = (cluster * 2 % ss) as usize;
                Ok(load_u16(&self.win()[offset..]) as u32)
            }
            FatType::Fat32 => {
                self.move_window(self.fatbase + cluster / (ss / 4)).await?;
                let offset = (cluster * 4 % ss) as usize;
                Ok(load_u32(&self.win()[offset..]) & 0x0FFF_FFFF)
            }
        }
    }

    /// Write the FAT cell of `cluster`. On FAT32 the reserved top
    /// nibble of the existing cell is preserved.
    pub(crate) async fn put_fat(&mut self, cluster: u32, value: u32) -> Result<(), Error<E>> {
        if !self.valid_cluster(cluster) {
            return Err(Error::IntErr);
        }
        let ss = self.ssize() as u32;
        match self.fs_type {
            FatType::Fat12 => {
                let mut bc = cluster + cluster / 2;
                self.move_window(self.fatbase + bc / ss).await?;
                let odd = cluster & 1 != 0;
                let offset = (bc % ss) as usize;
                let byte = self.win()[offset];
                self.win_mut()[offset] = match odd {
                    false => value as u8,
                    true => (byte & 0x0F) | (value << 4) as u8,
                };
                bc += 1;
                self.move_window(self.fatbase + bc / ss).await?;
                let offset = (bc % ss) as usize;
                let byte = self.win()[offset];
                self.win_mut()[offset] = match odd {
                    false => (byte & 0xF0) | ((value >> 8) & 0x0F) as u8,
                    true => (value >> 4) as u8,
                };
                Ok(())
            }
            FatType::Fat16 => {
                self.move_window(self.fatbase + cluster / (ss / 2)).await?;
                let offset = (cluster * 2 % ss) as usize;
                store_u16(&mut self.win_mut()[offset..], value as u16);
                Ok(())
            }
            FatType::Fat32 => {
                self.move_window(self.fatbase + cluster / (ss / 4)).await?;
                let offset = (cluster * 4 % ss) as usize;
                let preserved = load_u32(&self.win()[offset..]) & 0xF000_0000;
                store_u32(&mut self.win_mut()[offset..], (value & 0x0FFF_FFFF) | preserved);
                Ok(())
            }
        }
    }

    /// Free the chain starting at `cluster`. When `previous` is not
    /// zero the chain is cut there first: `previous` gets an EOC
    /// stamp and only the tail is released.
    pub(crate) async fn remove_chain(&mut self, cluster: u32, previous: u32) -> Result<(), Error<E>> {
        if !self.valid_cluster(cluster) {
            return Err(Error::IntErr);
        }
        if previous != 0 {
            self.put_fat(previous, self.fs_type.eoc()).await?;
        }
        let mut current = cluster;
        let mut run_start = cluster;
        let mut run_end = cluster;
        loop {
            let next = self.get_fat(current).await?;
            if next == 0 {
                break;
            }
            if next == 1 {
                return Err(Error::IntErr);
            }
            self.put_fat(current, 0).await?;
            if self.free_clst != FREE_COUNT_UNKNOWN {
                self.free_clst += 1;
                self.touch_fsinfo();
            }
            if self.trim {
                if next == run_end + 1 {
                    run_end = next;
                } else {
                    let first = self.clst2sect(run_start);
                    let last = self.clst2sect(run_end) + (self.csize - 1);
                    trace!("trim sectors {}..{}", first, last);
                    self.io.trim(first, last).await?;
                    run_start = next;
                    run_end = next;
                }
            }
            if next >= self.n_fatent {
                break;
            }
            current = next;
        }
        Ok(())
    }

    /// Extend or start a chain. `previous` 0 allocates the first
    /// cluster of a new chain; otherwise the cluster after
    /// `previous` is probed first so growing files stay contiguous.
    /// Returns the allocated cluster.
    pub(crate) async fn create_chain(&mut self, previous: u32) -> Result<u32, Error<E>> {
        let start = if previous == 0 {
            match self.last_clst {
                c if self.valid_cluster(c) => c,
                _ => 1,
            }
        } else {
            let next = self.get_fat(previous).await?;
            if next < 2 {
                return Err(Error::IntErr);
            }
            if next < self.n_fatent {
                // Already linked; following the chain is not an
                // allocation.
                return Ok(next);
            }
            previous
        };
        if self.free_clst == 0 {
            return Err(Error::NoSpaceLeft);
        }
        let mut candidate = start;
        let allocated = loop {
            candidate += 1;
            if candidate >= self.n_fatent {
                candidate = 2;
                if candidate > start {
                    return Err(Error::NoSpaceLeft);
                }
            }
            let cell = self.get_fat(candidate).await?;
            if cell == 0 {
                break candidate;
            }
            if cell == 1 {
                return Err(Error::IntErr);
            }
            if candidate == start {
                return Err(Error::NoSpaceLeft);
            }
        };
        self.put_fat(allocated, self.fs_type.eoc()).await?;
        if previous != 0 {
            self.put_fat(previous, allocated).await?;
        }
        self.last_clst = allocated;
        if self.free_clst != FREE_COUNT_UNKNOWN {
            self.free_clst -= 1;
        }
        self.touch_fsinfo();
        trace!("allocated cluster {} after {}", allocated, previous);
        Ok(allocated)
    }

    /// Count free clusters, serving the cached value when known and
    /// scanning the whole FAT otherwise.
    pub(crate) async fn count_free(&mut self) -> Result<u32, Error<E>> {
        if self.free_clst != FREE_COUNT_UNKNOWN && self.free_clst <= self.n_fatent - 2 {
            return Ok(self.free_clst);
        }
        let mut free = 0u32;
        match self.fs_type {
            FatType::Fat12 => {
                for cluster in 2..self.n_fatent {
                    if self.get_fat(cluster).await? == 0 {
                        free += 1;
                    }
                }
            }
            _ => {
                // Entries 0 and 1 carry the media seed and are never
                // zero, so scanning from the FAT base is safe.
                let wide = self.fs_type == FatType::Fat32;
                let mut remaining = self.n_fatent;
                let mut sector = self.fatbase;
                let mut offset = 0usize;
                while remaining > 0 {
                    if offset == 0 {
                        self.move_window(sector).await?;
                        sector += 1u32;
                    }
                    let zero = match wide {
                        true => load_u32(&self.win()[offset..]) & 0x0FFF_FFFF == 0,
                        false => load_u16(&self.win()[offset..]) == 0,
                    };
                    if zero {
                        free += 1;
                    }
                    offset = (offset + if wide { 4 } else { 2 }) % self.ssize();
                    remaining -= 1;
                }
            }
        }
        debug!("free-cluster scan: {} of {}", free, self.n_fatent - 2);
        self.free_clst = free;
        self.touch_fsinfo();
        Ok(free)
    }

    /// Build a cluster-linkage map of the chain starting at
    /// `cluster` into `table`, laid out `[len, n0, c0, n1, c1, .., 0]`
    /// with each pair describing a contiguous run. When the table is
    /// too small the required length is still reported in slot 0.
    pub(crate) async fn build_link_map(
        &mut self,
        cluster: u32,
        table: &mut [u32],
    ) -> Result<(), Error<E>> {
        if table.is_empty() {
            return Err(Error::InvalidParameter);
        }
        let mut used = 2usize; // slot 0 and the terminator
        let mut cursor = 1usize;
        let mut current = cluster;
        if current != 0 {
            loop {
                let run_start = current;
                let mut run_len = 0u32;
                let next = loop {
                    let previous = current;
                    run_len += 1;
                    current = self.get_fat(current).await?;
                    if current <= 1 {
                        return Err(Error::IntErr);
                    }
                    if current != previous + 1 {
                        break current;
                    }
                };
                used += 2;
                if used <= table.len() {
                    table[cursor] = run_len;
                    table[cursor + 1] = run_start;
                    cursor += 2;
                }
                if next >= self.n_fatent {
                    break;
                }
            }
        }
        table[0] = used as u32;
        if used > table.len() {
            return Err(Error::NotEnoughCore);
        }
        table[cursor] = 0;
        Ok(())
    }
}

/// Resolve a byte offset to an absolute cluster through a linkage
/// map built by [`Volume::build_link_map`].
pub(crate) fn clmt_cluster(table: &[u32], cluster_bytes: u32, offset: u32) -> Option<u32> {
    let mut index = offset / cluster_bytes;
    let mut cursor = 1usize;
    loop {
        let run_len = *table.get(cursor)?;
        if run_len == 0 {
            return None;
        }
        let run_start = *table.get(cursor + 1)?;
        if index < run_len {
            return Some(run_start + index);
        }
        index -= run_len;
        cursor += 2;
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

    fn mounted_fat32() -> Volume<RamDisk> {
        let mut disk = RamDisk::new(70000, 512);
        let options = FormatOptions {
            kind: crate::format::FormatKind::Fat32,
            cluster_size: 512,
            ..Default::default()
        };
        mkfs(&mut disk, &options).unwrap();
        Volume::mount(disk, MountOptions::default()).unwrap()
    }

    #[test]
    fn fat12_cell_round_trip() {
        let mut volume = mounted(2048);
        assert_eq!(volume.fs_type, FatType::Fat12);
        for (cluster, value) in [(2u32, 0xABC_u32), (3, 0x123), (4, 0xFFF)] {
            volume.put_fat(cluster, value).unwrap();
            assert_eq!(volume.get_fat(cluster).unwrap(), value);
        }
        // Neighbours must be unharmed by the shared middle byte.
        assert_eq!(volume.get_fat(2).unwrap(), 0xABC);
        assert_eq!(volume.get_fat(3).unwrap(), 0x123);
    }

    #[test]
    fn fat12_cell_straddling_sector_boundary() {
        let mut volume = mounted(2048);
        // Cluster 341: byte offset 341 * 3 / 2 = 511, so the cell
        // spans the last byte of FAT sector 0 and the first of
        // sector 1.
        let cluster = 341;
        assert_eq!((cluster + cluster / 2) % 512, 511);
        volume.put_fat(cluster, 0x345).unwrap();
        volume.put_fat(cluster - 1, 0x678).unwrap();
        volume.put_fat(cluster + 1, 0x9AB).unwrap();
        assert_eq!(volume.get_fat(cluster).unwrap(), 0x345);
        assert_eq!(volume.get_fat(cluster - 1).unwrap(), 0x678);
        assert_eq!(volume.get_fat(cluster + 1).unwrap(), 0x9AB);
    }

    #[test]
    fn fat32_preserves_reserved_nibble() {
        let mut volume = mounted_fat32();
        assert_eq!(volume.fs_type, FatType::Fat32);
        let cluster = volume.n_fatent - 2;
        // Plant a reserved-nibble pattern, then overwrite the cell.
        volume.put_fat(cluster, 0).unwrap();
        let ss = volume.ssize() as u32;
        let offset = (cluster * 4 % ss) as usize;
        let sector = volume.fatbase + cluster / (ss / 4);
        volume.move_window(sector).unwrap();
        let raw = load_u32(&volume.win()[offset..]);
        store_u32(&mut volume.win_mut()[offset..], raw | 0xA000_0000);
        volume.put_fat(cluster, 0x0012_3456).unwrap();
        volume.move_window(sector).unwrap();
        assert_eq!(load_u32(&volume.win()[offset..]), 0xA012_3456);
    }

    #[test]
    fn chain_create_and_remove_balance_free_count() {
        let mut volume = mounted(131072);
        let initial = volume.count_free().unwrap();
        let first = volume.create_chain(0).unwrap();
        let second = volume.create_chain(first).unwrap();
        let third = volume.create_chain(second).unwrap();
        // Contiguous extension is preferred.
        assert_eq!(second, first + 1);
        assert_eq!(third, second + 1);
        assert_eq!(volume.count_free().unwrap(), initial - 3);
        volume.remove_chain(first, 0).unwrap();
        assert_eq!(volume.count_free().unwrap(), initial);
        for cluster in [first, second, third] {
            assert_eq!(volume.get_fat(cluster).unwrap(), 0);
        }
    }

    #[test]
    fn chain_cut_keeps_head() {
        let mut volume = mounted(131072);
        let first = volume.create_chain(0).unwrap();
        let second = volume.create_chain(first).unwrap();
        let third = volume.create_chain(second).unwrap();
        volume.remove_chain(third, second).unwrap();
        assert!(volume.get_fat(second).unwrap() >= volume.n_fatent);
        assert_eq!(volume.get_fat(third).unwrap(), 0);
        assert!(volume.get_fat(first).unwrap() == second);
    }

    #[test]
    fn link_map_groups_runs() {
        let mut volume = mounted(131072);
        let a = volume.create_chain(0).unwrap();
        let b = volume.create_chain(a).unwrap();
        let c = volume.create_chain(b).unwrap();
        let mut table = [0u32; 8];
        volume.build_link_map(a, &mut table).unwrap();
        // One contiguous run of three clusters.
        assert_eq!(table[0], 4);
        assert_eq!(table[1], 3);
        assert_eq!(table[2], a);
        assert_eq!(table[3], 0);
        let bytes = volume.cluster_bytes();
        assert_eq!(clmt_cluster(&table, bytes, 0), Some(a));
        assert_eq!(clmt_cluster(&table, bytes, bytes), Some(b));
        assert_eq!(clmt_cluster(&table, bytes, 2 * bytes + 1), Some(c));
        assert_eq!(clmt_cluster(&table, bytes, 3 * bytes), None);
    }

    #[test]
    fn link_map_reports_required_length() {
        let mut volume = mounted(131072);
        let a = volume.create_chain(0).unwrap();
        volume.create_chain(a).unwrap();
        let mut table = [0u32; 2];
        match volume.build_link_map(a, &mut table) {
            Err(Error::NotEnoughCore) => (),
            other => panic!("expected NotEnoughCore, got {:?}", other),
        }
        assert_eq!(table[0], 4);
    }
}
