mod append;
mod cat;
mod format;
mod free;
mod get;
mod label;
mod list;
mod mkdir;
mod mv;
mod put;
mod remove;
mod stat;
mod touch;
mod truncate;

use chrono::{Datelike, Timelike};
use clap::Parser;
use fatfs::io::std::FileIO;
use fatfs::{FatFs, MountOptions, Timestamp};

#[derive(Debug, clap::Args)]
struct List {
    /// Specify path to list, default to the root directory
    #[clap(default_value = "/")]
    path: String,
    /// Glob pattern applied to the entries
    #[clap(short, long)]
    pattern: Option<String>,
}

#[derive(Debug, clap::Args)]
struct Cat {
    /// Specify path to concatenate
    path: String,
}

#[derive(Debug, clap::Args)]
struct Stat {
    /// Specify path to describe
    path: String,
}

#[derive(Debug, clap::Args)]
struct Touch {
    /// Specify path to touch
    path: String,
}

#[derive(Debug, clap::Args)]
struct Append {
    /// Specify path to append to
    path: String,
    /// Specify source file to append
    source: String,
}

#[derive(Debug, clap::Args)]
struct Truncate {
    /// Specify path to truncate
    path: String,
    /// Specify size to truncate to
    size: u32,
}

#[derive(Debug, clap::Args)]
struct Put {
    path: String,
    source: String,
}

#[derive(Debug, clap::Args)]
struct Get {
    path: String,
    destination: String,
}

#[derive(Debug, clap::Args)]
struct Remove {
    /// Specify path to delete
    path: String,
}

#[derive(Debug, clap::Args)]
struct Mkdir {
    /// Specify directory to create
    path: String,
}

#[derive(Debug, clap::Args)]
struct Move {
    old: String,
    new: String,
}

#[derive(Debug, clap::Args)]
struct Label {
    /// New label; omit to print the current one
    label: Option<String>,
}

#[derive(Debug, clap::Args)]
struct Mkfs {
    /// Force FAT32 instead of auto selection
    #[clap(long)]
    fat32: bool,
    /// Cluster size in bytes
    #[clap(short, long)]
    cluster_size: Option<u32>,
    /// Write an MBR with one spanning partition instead of a
    /// super-floppy layout
    #[clap(long)]
    mbr: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Action {
    /// List files and directories in the specified path
    #[clap(name = "ls")]
    List(List),
    /// Concatenate a file and print it on the standard output
    Cat(Cat),
    /// Describe a file or directory
    Stat(Stat),
    /// Create a file or update its timestamp
    Touch(Touch),
    /// Append a host file to a file on the volume
    Append(Append),
    /// Truncate a file
    Truncate(Truncate),
    /// Put a host file onto the volume
    Put(Put),
    /// Copy a file from the volume to the host
    Get(Get),
    /// Remove a file or an empty directory
    #[clap(name = "rm")]
    Remove(Remove),
    /// Create a directory
    Mkdir(Mkdir),
    /// Rename or move a file or directory
    #[clap(name = "mv")]
    Move(Move),
    /// Print or set the volume label
    Label(Label),
    /// Print free space
    Free,
    /// Format the image
    Mkfs(Mkfs),
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(short, long)]
    quiet: bool,
    #[clap(short, action = clap::ArgAction::Count)]
    verbosity: u8,
    /// Block device or image file holding a FAT volume
    #[clap(short, long)]
    device: String,
    /// Partition to mount (0 scans, 1-4 primary, above 4 logical)
    #[clap(short, long, default_value = "0")]
    partition: u8,
    #[clap(subcommand)]
    action: Action,
}

fn fat_now() -> Timestamp {
    let now = chrono::Local::now();
    Timestamp::new(
        now.year().clamp(1980, 2107) as u16,
        now.month() as u8,
        now.day() as u8,
        now.hour() as u8,
        now.minute() as u8,
        now.second() as u8,
    )
}

fn main() {
    let args = Args::parse();
    let level = match (args.quiet, args.verbosity) {
        (true, _) => log::LevelFilter::Off,
        (_, 0) => log::LevelFilter::Info,
        (_, 1) => log::LevelFilter::Debug,
        (_, _) => log::LevelFilter::Trace,
    };
    log::set_max_level(level);
    env_logger::builder().filter(None, level).target(env_logger::Target::Stdout).init();

    let result = run(&args);
    if let Some(error) = result.err() {
        eprintln!("{}", error);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), fatfs::error::Error<std::io::Error>> {
    let io = FileIO::open(&args.device).map_err(fatfs::error::Error::Io)?;

    if let Action::Mkfs(options) = &args.action {
        return format::mkfs(io, options.fat32, options.cluster_size, options.mbr);
    }

    let options = MountOptions {
        partition: args.partition,
        clock: Some(fat_now as fn() -> Timestamp),
        ..Default::default()
    };
    let fs = FatFs::mount(io, options)?;
    match &args.action {
        Action::List(args) => list::list(&fs, &args.path, args.pattern.as_deref()),
        Action::Cat(args) => cat::cat(&fs, &args.path),
        Action::Stat(args) => stat::stat(&fs, &args.path),
        Action::Touch(args) => touch::touch(&fs, &args.path, fat_now()),
        Action::Append(args) => append::append(&fs, &args.path, &args.source),
        Action::Truncate(args) => truncate::truncate(&fs, &args.path, args.size),
        Action::Put(args) => put::put(&fs, &args.path, &args.source),
        Action::Get(args) => get::get(&fs, &args.path, &args.destination),
        Action::Remove(args) => remove::remove(&fs, &args.path),
        Action::Mkdir(args) => mkdir::mkdir(&fs, &args.path),
        Action::Move(args) => mv::rename(&fs, &args.old, &args.new),
        Action::Label(args) => label::label(&fs, args.label.as_deref()),
        Action::Free => free::free(&fs),
        Action::Mkfs(_) => unreachable!(),
    }
}
