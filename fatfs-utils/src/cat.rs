use std::fmt::Debug;
use std::io::Write;

use fatfs::error::Error;
use fatfs::{FatFs, OpenMode};

pub fn cat<E, D>(fs: &FatFs<D>, path: &str) -> Result<(), Error<E>>
where
    E: Debug,
    D: fatfs::io::IO<Error = E>,
{
    let mut file = fs.open(path, OpenMode::READ)?;
    let mut stdout = std::io::stdout();
    let mut buffer = [0u8; 4096];
    loop {
        let count = file.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        stdout.write_all(&buffer[..count]).expect("Unable to write to stdout");
    }
    file.close()
}
