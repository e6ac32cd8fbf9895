use anyhow::{Context, Result};
use std::path::PathBuf;
use structopt::StructOpt;
use yolo_detect::config::Config;

#[derive(Debug, Clone, StructOpt)]
/// Detect objects in images with a darknet model
struct Args {
    #[structopt(long, default_value = "detect.json5")]
    /// configuration file
    pub config_file: PathBuf,
}

pub fn main() -> Result<()> {
    pretty_env_logger::init();

    // parse arguments
    let Args { config_file } = Args::from_args();
    let config = Config::open(&config_file)
        .with_context(|| format!("failed to load config file '{}'", config_file.display()))?;

    // start detection
    yolo_detect::start(&config)?;

    Ok(())
}
