use std::fmt::Debug;

use fatfs::error::Error;
use fatfs::{FatFs, OpenMode, Timestamp};

pub fn touch<E, D>(fs: &FatFs<D>, path: &str, now: Timestamp) -> Result<(), Error<E>>
where
    E: Debug,
    D: fatfs::io::IO<Error = E>,
{
    fs.open(path, OpenMode::OPEN_ALWAYS | OpenMode::WRITE)?.close()?;
    fs.set_times(path, now)
}
