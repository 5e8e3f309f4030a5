use clap::{Parser, Subcommand};

use act_core::initialize_logging;

mod predict;
mod train;
mod util;

/// Train and run Action Chunking Transformer policies.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a policy on a directory of recorded episodes.
    Train(train::TrainArgs),
    /// Predict the action chunk for one timestep of an episode.
    Predict(predict::PredictArgs),
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    initialize_logging();

    match args.command {
        Command::Train(args) => train::run(args),
        Command::Predict(args) => predict::run(args),
    }
}
