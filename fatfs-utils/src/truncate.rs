use std::fmt::Debug;

use fatfs::error::Error;
use fatfs::{FatFs, OpenMode};

pub fn truncate<E, D>(fs: &FatFs<D>, path: &str, size: u32) -> Result<(), Error<E>>
where
    E: Debug,
    D: fatfs::io::IO<Error = E>,
{
    let mut file = fs.open(path, OpenMode::WRITE)?;
    file.truncate(size)?;
    file.close()
}
