//! 32-byte directory entry layout, shared by the short-name and
//! long-name forms.

use bitfield::bitfield;

use crate::codec::{load_u16, load_u32, store_u16, store_u32};
use crate::types::FatType;

/// Size of one directory entry.
pub(crate) const SZDIRE: u32 = 32;
/// Upper bound of a directory in bytes (FAT caps directories at 2 MiB).
pub(crate) const MAX_DIR: u32 = 0x20_0000;

// Short-name entry fields.
pub(crate) const DIR_NAME: usize = 0;
pub(crate) const DIR_ATTR: usize = 11;
pub(crate) const DIR_NTRES: usize = 12;
pub(crate) const DIR_CRT_TIME10: usize = 13;
pub(crate) const DIR_CRT_TIME: usize = 14;
pub(crate) const DIR_CRT_DATE: usize = 16;
pub(crate) const DIR_LST_ACC_DATE: usize = 18;
pub(crate) const DIR_FST_CLUS_HI: usize = 20;
pub(crate) const DIR_MOD_TIME: usize = 22;
pub(crate) const DIR_MOD_DATE: usize = 24;
pub(crate) const DIR_FST_CLUS_LO: usize = 26;
pub(crate) const DIR_FILE_SIZE: usize = 28;

// Long-name entry fields.
pub(crate) const LDIR_ORD: usize = 0;
pub(crate) const LDIR_ATTR: usize = 11;
pub(crate) const LDIR_TYPE: usize = 12;
pub(crate) const LDIR_CHKSUM: usize = 13;
pub(crate) const LDIR_FST_CLUS_LO: usize = 26;
/// Byte offsets of the 13 UTF-16 units inside an LFN entry.
pub(crate) const LDIR_CHARS: [usize; 13] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];
/// Ordinal flag on the first LFN entry met on a linear scan.
pub(crate) const LAST_LONG_ENTRY: u8 = 0x40;

/// First name byte of a deleted entry.
pub(crate) const DELETED: u8 = 0xE5;
/// First name byte substituted when the real initial byte is 0xE5.
pub(crate) const KANJI_E5: u8 = 0x05;

/// On-disk NTres case hints.
pub(crate) const NT_BODY_LOWER: u8 = 0x08;
pub(crate) const NT_EXT_LOWER: u8 = 0x10;

bitfield! {
    /// Directory entry attribute byte.
    #[derive(Copy, Clone, Default, Eq, PartialEq)]
    pub struct Attributes(u8);
    impl Debug;
    pub read_only, set_read_only: 0;
    pub hidden, set_hidden: 1;
    pub system, set_system: 2;
    pub volume_label, set_volume_label: 3;
    pub directory, set_directory: 4;
    pub archive, set_archive: 5;
}

impl Attributes {
    /// All four low bits set marks a long-name entry.
    pub(crate) const LFN_MASK: u8 = 0x0F;
    /// Bits that survive a `chmod`.
    pub(crate) const SETTABLE: u8 = 0x27;

    pub(crate) fn raw(self) -> u8 {
        self.0
    }

    pub(crate) fn is_lfn(self) -> bool {
        self.0 & Self::LFN_MASK == Self::LFN_MASK
    }
}

impl From<u8> for Attributes {
    fn from(raw: u8) -> Self {
        Self(raw)
    }
}

/// Start cluster recorded in a short-name entry. The high word is
/// meaningful only on FAT32 volumes.
pub(crate) fn load_cluster(entry: &[u8], fs_type: FatType) -> u32 {
    let low = load_u16(&entry[DIR_FST_CLUS_LO..]) as u32;
    match fs_type {
        FatType::Fat32 => (load_u16(&entry[DIR_FST_CLUS_HI..]) as u32) << 16 | low,
        _ => low,
    }
}

pub(crate) fn store_cluster(entry: &mut [u8], cluster: u32) {
    store_u16(&mut entry[DIR_FST_CLUS_LO..], cluster as u16);
    store_u16(&mut entry[DIR_FST_CLUS_HI..], (cluster >> 16) as u16);
}

pub(crate) fn load_file_size(entry: &[u8]) -> u32 {
    load_u32(&entry[DIR_FILE_SIZE..])
}

pub(crate) fn store_file_size(entry: &mut [u8], size: u32) {
    store_u32(&mut entry[DIR_FILE_SIZE..], size);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn attribute_bits() {
        let mut attr = Attributes::default();
        attr.set_directory(true);
        attr.set_read_only(true);
        assert_eq!(attr.raw(), 0x11);
        assert!(!attr.is_lfn());
        assert!(Attributes::from(0x0F).is_lfn());
    }

    #[test]
    fn cluster_words() {
        let mut entry = [0u8; 32];
        store_cluster(&mut entry, 0x0012_3456);
        assert_eq!(load_cluster(&entry, FatType::Fat32), 0x0012_3456);
        // FAT16 ignores the high word
        assert_eq!(load_cluster(&entry, FatType::Fat16), 0x3456);
    }
}
