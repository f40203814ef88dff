use std::fmt::Debug;

use fatfs::error::Error;
use fatfs::FatFs;

pub fn stat<E, D>(fs: &FatFs<D>, path: &str) -> Result<(), Error<E>>
where
    E: Debug,
    D: fatfs::io::IO<Error = E>,
{
    let info = fs.stat(path)?;
    println!("name:      {}", info.name);
    println!("short:     {}", info.short_name);
    println!("size:      {}", info.size);
    println!("kind:      {}", if info.is_dir() { "directory" } else { "file" });
    println!("modified:  {}", info.modified);
    println!("created:   {}", info.created);
    println!("read-only: {}", info.attributes.read_only());
    Ok(())
}
