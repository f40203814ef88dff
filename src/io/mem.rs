//! RAM-backed block device, used by the test suite and for staging
//! images in memory before writing them out.

#[cfg(all(feature = "async", not(feature = "std")))]
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt::{Display, Formatter};

#[cfg(feature = "async")]
use async_trait::async_trait;

use crate::types::SectorID;

#[derive(Debug)]
pub enum RamDiskError {
    OutOfRange,
    WriteProtected,
}

impl Display for RamDiskError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfRange => write!(f, "sector out of range"),
            Self::WriteProtected => write!(f, "ram disk write protected"),
        }
    }
}

pub struct RamDisk {
    data: Vec<u8>,
    sector_size: u16,
    write_protected: bool,
}

impl RamDisk {
    pub fn new(sector_count: u64, sector_size: u16) -> Self {
        let data = vec![0u8; sector_count as usize * sector_size as usize];
        Self { data, sector_size, write_protected: false }
    }

    pub fn set_write_protected(&mut self, protected: bool) {
        self.write_protected = protected;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn range(&self, sector: SectorID, len: usize) -> Result<core::ops::Range<usize>, RamDiskError> {
        let start = u64::from(sector) as usize * self.sector_size as usize;
        let end = start + len;
        if len % self.sector_size as usize != 0 || end > self.data.len() {
            return Err(RamDiskError::OutOfRange);
        }
        Ok(start..end)
    }
}

#[cfg_attr(feature = "async", async_trait)]
#[cfg_attr(not(feature = "async"), deasync::deasync)]
impl super::IO for RamDisk {
    type Error = RamDiskError;

    fn sector_size(&self) -> u16 {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        self.data.len() as u64 / self.sector_size as u64
    }

    fn write_protected(&self) -> bool {
        self.write_protected
    }

    async fn read(&mut self, sector: SectorID, buf: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.range(sector, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    async fn write(&mut self, sector: SectorID, buf: &[u8]) -> Result<(), Self::Error> {
        if self.write_protected {
            return Err(RamDiskError::WriteProtected);
        }
        let range = self.range(sector, buf.len())?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
