use std::fmt::Debug;

use fatfs::error::Error;
use fatfs::FatFs;

pub fn rename<E, D>(fs: &FatFs<D>, old: &str, new: &str) -> Result<(), Error<E>>
where
    E: Debug,
    D: fatfs::io::IO<Error = E>,
{
    fs.rename(old, new)
}
