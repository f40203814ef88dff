use std::io::SeekFrom;
use std::path::Path;
#[cfg(not(feature = "async"))]
use std::{fs, io::prelude::*};

#[cfg(all(feature = "async", feature = "smol", not(feature = "tokio")))]
use smol::fs;
#[cfg(all(feature = "async", feature = "smol", not(feature = "tokio")))]
use smol::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
#[cfg(all(feature = "async", feature = "tokio"))]
use tokio::fs;
#[cfg(all(feature = "async", feature = "tokio"))]
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

#[cfg(feature = "async")]
use async_trait::async_trait;

use crate::types::SectorID;

/// Block device over a host file or raw device node.
#[derive(Debug)]
pub struct FileIO {
    file: fs::File,
    sector_size: u16,
    sector_count: u64,
}

#[cfg_attr(not(feature = "async"), deasync::deasync)]
impl FileIO {
    /// Open an image with conventional 512-byte sectors.
    pub async fn open<P: AsRef<Path>>(filepath: P) -> std::io::Result<Self> {
        Self::open_with_sector_size(filepath, 512).await
    }

    pub async fn open_with_sector_size<P: AsRef<Path>>(
        filepath: P,
        sector_size: u16,
    ) -> std::io::Result<Self> {
        let mut options = match () {
            #[cfg(feature = "async")]
            () => fs::OpenOptions::new(),
            #[cfg(not(feature = "async"))]
            () => fs::File::options(),
        };
        let file = options.read(true).write(true).open(filepath).await?;
        let length = file.metadata().await?.len();
        let sector_count = length / sector_size as u64;
        Ok(Self { file, sector_size, sector_count })
    }
}

#[cfg_attr(feature = "async", async_trait)]
#[cfg_attr(not(feature = "async"), deasync::deasync)]
impl super::IO for FileIO {
    type Error = std::io::Error;

    fn sector_size(&self) -> u16 {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    async fn read(&mut self, sector: SectorID, buf: &mut [u8]) -> Result<(), Self::Error> {
        let seek = SeekFrom::Start(u64::from(sector) * self.sector_size as u64);
        self.file.seek(seek).await?;
        self.file.read_exact(buf).await.map(|_| ())
    }

    async fn write(&mut self, sector: SectorID, buf: &[u8]) -> Result<(), Self::Error> {
        let seek = SeekFrom::Start(u64::from(sector) * self.sector_size as u64);
        self.file.seek(seek).await?;
        self.file.write_all(buf).await
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.file.flush().await
    }
}
