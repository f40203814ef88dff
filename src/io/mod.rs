pub mod mem;
#[cfg(feature = "std")]
pub mod std;

#[cfg(all(feature = "async", not(feature = "std")))]
use alloc::boxed::Box;
use core::fmt::Debug;

#[cfg(feature = "async")]
use async_trait::async_trait;

use crate::error::Error;
use crate::types::SectorID;

/// Abstract block device under a volume.
///
/// Transfers always cover whole sectors: the buffer length is a
/// multiple of `sector_size()` and the transfer starts at `sector`.
/// The driver never interprets device error values, it only carries
/// them out through `Error::Io`.
#[cfg_attr(feature = "async", async_trait)]
#[cfg_attr(not(feature = "async"), deasync::deasync)]
pub trait IO {
    type Error: Debug;

    /// Bytes per sector, a power of two in 512..=4096.
    fn sector_size(&self) -> u16;
    /// Total addressable sectors.
    fn sector_count(&self) -> u64;
    /// Erase block size in sectors, 1 when unknown. Used by the
    /// formatter to align the data area.
    fn block_size(&self) -> u32 {
        1
    }
    fn write_protected(&self) -> bool {
        false
    }
    async fn read(&mut self, sector: SectorID, buf: &mut [u8]) -> Result<(), Self::Error>;
    async fn write(&mut self, sector: SectorID, buf: &[u8]) -> Result<(), Self::Error>;
    async fn flush(&mut self) -> Result<(), Self::Error>;
    /// Hint that the sector range `first..=last` no longer holds
    /// live data. Devices without TRIM ignore it.
    async fn trim(&mut self, first: SectorID, last: SectorID) -> Result<(), Self::Error> {
        let _ = (first, last);
        Ok(())
    }
}

/// Owns the device inside a volume and lifts its errors into `Error`.
pub(crate) struct Wrapper<D>(D);

impl<D> Wrapper<D> {
    pub fn new(device: D) -> Self {
        Self(device)
    }

    pub fn into_inner(self) -> D {
        self.0
    }
}

#[cfg_attr(not(feature = "async"), deasync::deasync)]
impl<E: Debug, D: IO<Error = E>> Wrapper<D> {
    pub fn sector_size(&self) -> u16 {
        self.0.sector_size()
    }

    pub fn sector_count(&self) -> u64 {
        self.0.sector_count()
    }

    pub fn block_size(&self) -> u32 {
        self.0.block_size()
    }

    pub fn write_protected(&self) -> bool {
        self.0.write_protected()
    }

    pub async fn read(&mut self, sector: SectorID, buf: &mut [u8]) -> Result<(), Error<E>> {
        self.0.read(sector, buf).await.map_err(|e| Error::Io(e))
    }

    pub async fn write(&mut self, sector: SectorID, buf: &[u8]) -> Result<(), Error<E>> {
        self.0.write(sector, buf).await.map_err(|e| Error::Io(e))
    }

    pub async fn flush(&mut self) -> Result<(), Error<E>> {
        self.0.flush().await.map_err(|e| Error::Io(e))
    }

    pub async fn trim(&mut self, first: SectorID, last: SectorID) -> Result<(), Error<E>> {
        self.0.trim(first, last).await.map_err(|e| Error::Io(e))
    }
}
