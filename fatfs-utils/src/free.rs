use std::fmt::Debug;

use fatfs::error::Error;
use fatfs::FatFs;

pub fn free<E, D>(fs: &FatFs<D>) -> Result<(), Error<E>>
where
    E: Debug,
    D: fatfs::io::IO<Error = E>,
{
    let (free, total) = fs.free_clusters()?;
    println!("{} of {} clusters free ({} type)", free, total, fs.fat_type());
    Ok(())
}
