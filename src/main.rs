use clap::Parser;
use pcconvert::shared::config::Settings;
use pcconvert::shared::progress::{Reporter, Verbosity};
use pcconvert::ConvertArgs;

const EXIT_CODES: &str = "Exit codes:
  0  success
  2  invalid destination or extension
  3  origin file not found
  4  overwrite refused (see --unsafe)
  5  origin could not be read
  6  destination could not be written
  7  PotreeConverter failed
  8  I/O error";

/// Convert point clouds between LAS, LAZ, PLY, E57, PTS, PCD and Potree
#[derive(Debug, Parser)]
#[clap(name = "pcconvert", version, author, about, after_help = EXIT_CODES)]
pub struct RootArgs {
    #[clap(flatten)]
    convert: ConvertArgs,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = RootArgs::parse().convert;
    let settings = Settings::load();
    let mut reporter = Reporter::new(Verbosity::from_level(args.verbose));

    if let Err(e) = pcconvert::commands::pointcloud::convert::execute(args, settings, &mut reporter)
    {
        std::process::exit(pcconvert::handle_error(&e, &mut reporter));
    }
}
