use std::fmt::Debug;

use fatfs::error::Error;
use fatfs::FatFs;

pub fn label<E, D>(fs: &FatFs<D>, new: Option<&str>) -> Result<(), Error<E>>
where
    E: Debug,
    D: fatfs::io::IO<Error = E>,
{
    match new {
        Some(label) => fs.set_label(label),
        None => {
            let (label, serial) = fs.label()?;
            match label.is_empty() {
                true => println!("no label, serial {:04X}-{:04X}", serial >> 16, serial & 0xFFFF),
                false => {
                    println!("{} (serial {:04X}-{:04X})", label, serial >> 16, serial & 0xFFFF)
                }
            }
            Ok(())
        }
    }
}
