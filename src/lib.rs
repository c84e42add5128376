use std::path::PathBuf;

use clap::Args;

pub mod commands;
pub mod errors;
pub mod formats;
pub mod points;
pub mod shared;

use crate::errors::ConvertError;
use crate::shared::progress::Reporter;

#[derive(Debug, Args)]
pub struct ConvertArgs {
    /// Point cloud file to convert
    ///
    /// Supported formats: [LAS, LAZ, PLY, E57, PTS, PCD]
    #[arg(required = true)]
    pub origin: PathBuf,

    /// Destination file or directory. A path ending in a supported extension is used as the
    /// output file, anything else as the directory to write into.
    #[arg(short, long, visible_alias = "dest")]
    pub destination: Option<PathBuf>,

    /// Output extension, or `potree` for a Potree directory. Ignored when the destination
    /// already names a file. Defaults to .las
    #[arg(short, long, visible_alias = "ext")]
    pub extension: Option<String>,

    /// Allow overwriting an existing output file and writing into an existing directory
    #[arg(short = 'u', long = "unsafe", visible_alias = "overwrite")]
    pub unlocked: bool,

    /// Output level: 0 silent, 1 milestones, 2 colors and progress bars, 3 raw percentages
    #[arg(short, long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=3))]
    pub verbose: u8,

    /// Write the text variants of PLY and PCD instead of binary
    #[arg(long)]
    pub ascii: bool,

    /// PotreeConverter executable, or a directory to search for it
    #[arg(long)]
    pub potree_converter: Option<PathBuf>,
}

/// Reports `e` and returns the exit code for it.
pub fn handle_error(e: &ConvertError, reporter: &mut Reporter) -> i32 {
    reporter.error(e);
    e.exit_code()
}
