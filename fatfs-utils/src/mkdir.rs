use std::fmt::Debug;

use fatfs::error::Error;
use fatfs::FatFs;

pub fn mkdir<E, D>(fs: &FatFs<D>, path: &str) -> Result<(), Error<E>>
where
    E: Debug,
    D: fatfs::io::IO<Error = E>,
{
    fs.create_dir(path)
}
