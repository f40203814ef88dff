use std::fmt::Debug;
use std::fs::File;
use std::io::Read;

use fatfs::error::Error;
use fatfs::{FatFs, OpenMode};

pub fn append<E, D>(fs: &FatFs<D>, path: &str, source: &str) -> Result<(), Error<E>>
where
    E: Debug,
    D: fatfs::io::IO<Error = E>,
{
    let mut source_file = File::open(source).expect("No such file");
    let mut file = fs.open(path, OpenMode::OPEN_APPEND | OpenMode::WRITE)?;
    let mut buffer = [0u8; 4096];
    loop {
        let count = source_file.read(&mut buffer).expect("Unable to read");
        if count == 0 {
            break;
        }
        file.write_all(&buffer[..count])?;
    }
    file.close()
}
