use std::fmt::Debug;

use fatfs::error::Error;
use fatfs::{FatFs, FileInfo};

fn print_entry(info: &FileInfo) {
    let kind = if info.is_dir() { 'd' } else { '-' };
    let ro = if info.attributes.read_only() { 'r' } else { 'w' };
    println!("{}{} {:>10} {} {}", kind, ro, info.size, info.modified, info.name);
}

pub fn list<E, D>(fs: &FatFs<D>, path: &str, pattern: Option<&str>) -> Result<(), Error<E>>
where
    E: Debug,
    D: fatfs::io::IO<Error = E>,
{
    let mut dir = match pattern {
        Some(pattern) => {
            let (dir, first) = fs.find_first(path, pattern)?;
            if let Some(info) = first {
                print_entry(&info);
            }
            dir
        }
        None => fs.open_dir(path)?,
    };
    while let Some(info) = dir.read_entry()? {
        print_entry(&info);
    }
    dir.close()
}
