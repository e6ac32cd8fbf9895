use anyhow::{Context, Result};
use darknet_config::{DarknetModel, LayerGraph};
use itertools::Itertools;
use prettytable::{cell, row, Table};
use std::path::{Path, PathBuf};
use structopt::StructOpt;

#[derive(Debug, Clone, StructOpt)]
/// Load darknet config and weights files and produce summary.
enum Args {
    Info {
        /// configuration file
        config_file: PathBuf,
    },
    TestWeights {
        /// configuration file
        config_file: PathBuf,
        /// weights file
        weights_file: PathBuf,
    },
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    match Args::from_args() {
        Args::Info { config_file } => info(config_file)?,
        Args::TestWeights {
            config_file,
            weights_file,
        } => test_weights(config_file, weights_file)?,
    }

    Ok(())
}

fn info(config_file: impl AsRef<Path>) -> Result<()> {
    let graph = LayerGraph::from_config_file(config_file)?;
    let net = &graph.net;

    println!(
        "input: {}x{}x{}, batch {}",
        net.height, net.width, net.channels, net.batch
    );

    // print layer information
    {
        let mut table = Table::new();
        table.add_row(row!["index", "kind", "from indexes", "output channels"]);

        graph.layers.iter().for_each(|layer| {
            table.add_row(row![
                layer.index(),
                layer.kind(),
                layer.from_indexes().iter().join(","),
                layer.output_channels()
            ]);
        });

        table.printstd();
    }

    Ok(())
}

fn test_weights(config_file: impl AsRef<Path>, weights_file: impl AsRef<Path>) -> Result<()> {
    let weights_file = weights_file.as_ref();
    let mut darknet_model = DarknetModel::from_config_file(config_file)?;
    println!("loading weights file {} ...", weights_file.display());
    darknet_model
        .load_weights(weights_file)
        .with_context(|| "failed to load weights file")?;
    println!(
        "weights file is loaded successfully! ({} parameters)",
        darknet_model.num_parameters()
    );
    Ok(())
}
