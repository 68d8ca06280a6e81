use anyhow::Context;
use clap::Parser;

use crate::{BigWigRead, StatType};

#[derive(Clone, Debug, PartialEq, Parser)]
#[command(about = "Computes binned statistics over a region of a bigWig.", long_about = None)]
pub struct BigWigStatsArgs {
    /// The bigWig to read.
    pub bigwig: String,

    /// The chromosome to compute statistics on.
    pub chrom: String,

    /// Start of the region. Defaults to the start of the chromosome.
    #[arg(long)]
    pub start: Option<u32>,

    /// End of the region. Defaults to the end of the chromosome.
    #[arg(long)]
    pub end: Option<u32>,

    /// One of mean, min, max, sum, coverage or std.
    #[arg(long = "type")]
    #[arg(default_value = "mean")]
    pub stat: String,

    /// Number of equal-width bins to split the region into.
    #[arg(long)]
    #[arg(default_value_t = 1)]
    pub bins: u32,

    /// Always compute from the raw data, never from zoom levels.
    #[arg(long)]
    #[arg(default_value_t = false)]
    pub exact: bool,
}

pub fn bigwigstats(args: BigWigStatsArgs) -> anyhow::Result<()> {
    let stat: StatType = args.stat.parse()?;
    let mut bigwig = BigWigRead::open_file(&args.bigwig)
        .with_context(|| format!("Unable to open {}", args.bigwig))?;
    let stats = if args.exact {
        bigwig.stats_exact(&args.chrom, args.start, args.end, stat, args.bins)?
    } else {
        bigwig.stats(&args.chrom, args.start, args.end, stat, args.bins)?
    };
    for value in stats {
        match value {
            Some(v) => println!("{}", v),
            None => println!("n/a"),
        }
    }
    Ok(())
}
