mod cli;

use std::fs::{self, OpenOptions};
use std::io;
use std::sync::Arc;

use clap::Parser;
use sector_fs::{Error, FileSystem, WorkingDir};
use sector_fs_fuse::BlockFile;
use typed_bytesize::ByteSizeIec;

use self::cli::Cli;

fn main() -> io::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    log::info!("source={:?} out={:?} dest={:?}", cli.source, cli.out, cli.dest);

    let disk_size = ByteSizeIec::mib(cli.size_mib).0;
    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&cli.out)?;
    fd.set_len(disk_size)?;

    let fs = FileSystem::format(Arc::new(BlockFile::new(fd)?)).map_err(fs_error)?;
    let cwd = WorkingDir::root();
    mkdir_all(&fs, &cwd, &cli.dest)?;

    for entry in fs::read_dir(&cli.source)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            log::warn!("skip non UTF-8 name {:?}", entry.file_name());
            continue;
        };

        let data = fs::read(entry.path())?;
        let path = format!("{}/{name}", cli.dest.trim_end_matches('/'));
        fs.create(&cwd, &path, 0).map_err(fs_error)?;
        let mut file = fs.open(&cwd, &path).map_err(fs_error)?;
        if file.write(&data) != data.len() {
            return Err(fs_error(Error::NoSpace));
        }
        log::info!("file={path:?} size={}", data.len());
    }

    fs.sync();
    let report = fs.check();
    log::info!(
        "{} inodes, {} sectors free, clean={}",
        report.inodes,
        fs.free_sectors(),
        report.is_clean()
    );

    Ok(())
}

/// 逐级创建目录，已存在的跳过
fn mkdir_all(fs: &FileSystem, cwd: &WorkingDir, dest: &str) -> io::Result<()> {
    let mut path = String::new();
    for component in dest.split('/').filter(|c| !c.is_empty()) {
        path.push('/');
        path.push_str(component);
        match fs.mkdir(cwd, &path) {
            Ok(()) | Err(Error::AlreadyExists) => (),
            Err(err) => return Err(fs_error(err)),
        }
    }
    Ok(())
}

fn fs_error(err: Error) -> io::Error {
    io::Error::other(err.to_string())
}
