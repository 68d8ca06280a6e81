use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use bbitrack::utils::cli::bbiinfo::{bbiinfo, BBIInfoArgs};
use bbitrack::utils::cli::bbiintervals::{bbiintervals, BBIIntervalsArgs};
use bbitrack::utils::cli::bigwigstats::{bigwigstats, BigWigStatsArgs};

#[derive(Clone, Debug, PartialEq, Subcommand)]
enum SubCommands {
    /// Gets information about a bigWig or bigBed.
    Info {
        #[command(flatten)]
        args: BBIInfoArgs,
    },
    /// Computes binned statistics over a region of a bigWig.
    Stats {
        #[command(flatten)]
        args: BigWigStatsArgs,
    },
    /// Prints the bedGraph or BED rows of a region.
    Intervals {
        #[command(flatten)]
        args: BBIIntervalsArgs,
    },
}

#[derive(Debug, Parser)]
#[command(name = "bbitrack", about = "Reads bigWig and bigBed files.", version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: SubCommands,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        SubCommands::Info { args } => bbiinfo(args),
        SubCommands::Stats { args } => bigwigstats(args),
        SubCommands::Intervals { args } => bbiintervals(args),
    }
}

#[test]
fn verify_cli_bbitrack() {
    use clap::CommandFactory;
    Cli::command().debug_assert()
}
