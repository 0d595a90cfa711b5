use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
pub struct Cli {
    /// Directory whose regular files are copied into the image
    #[arg(long, short)]
    pub source: PathBuf,

    /// Image file to create
    #[arg(long, short)]
    pub out: PathBuf,

    /// Image size in MiB
    #[arg(long, default_value_t = 32)]
    pub size_mib: u64,

    /// Directory inside the image receiving the files, created when missing
    #[arg(long, short, default_value = "/")]
    pub dest: String,
}
