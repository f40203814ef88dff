use std::fmt::Debug;
use std::fs::File;
use std::io::Write;

use fatfs::error::Error;
use fatfs::{FatFs, OpenMode};

pub fn get<E, D>(fs: &FatFs<D>, path: &str, destination: &str) -> Result<(), Error<E>>
where
    E: Debug,
    D: fatfs::io::IO<Error = E>,
{
    let mut file = fs.open(path, OpenMode::READ)?;
    let mut out = File::create(destination).expect("Unable to create destination");
    let mut buffer = [0u8; 4096];
    loop {
        let count = file.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        out.write_all(&buffer[..count]).expect("Unable to write");
    }
    file.close()
}
