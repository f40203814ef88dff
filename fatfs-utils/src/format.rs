use fatfs::error::Error;
use fatfs::io::std::FileIO;
use fatfs::{FormatKind, FormatOptions};

pub fn mkfs(
    mut io: FileIO,
    fat32: bool,
    cluster_size: Option<u32>,
    mbr: bool,
) -> Result<(), Error<std::io::Error>> {
    let options = FormatOptions {
        kind: if fat32 { FormatKind::Fat32 } else { FormatKind::Any },
        cluster_size: cluster_size.unwrap_or(0),
        super_floppy: !mbr,
        ..Default::default()
    };
    fatfs::mkfs(&mut io, &options)?;
    log::info!("volume formatted");
    Ok(())
}
