use std::io::{self, BufWriter, Write};

use anyhow::Context;
use clap::Parser;

use crate::GenericBBIRead;

#[derive(Clone, Debug, PartialEq, Parser)]
#[command(about = "Prints the bedGraph or BED rows of a region.", long_about = None)]
pub struct BBIIntervalsArgs {
    /// The bigWig or bigBed to read.
    pub file: String,

    /// The chromosome to read.
    pub chrom: String,

    /// Start of the region. Defaults to the start of the chromosome.
    #[arg(long)]
    pub start: Option<u32>,

    /// End of the region. Defaults to the end of the chromosome.
    #[arg(long)]
    pub end: Option<u32>,
}

pub fn bbiintervals(args: BBIIntervalsArgs) -> anyhow::Result<()> {
    let bbi = GenericBBIRead::open_file(&args.file)
        .with_context(|| format!("Unable to open {}", args.file))?;
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let chrom = &args.chrom;
    match bbi {
        GenericBBIRead::BigWig(mut bigwig) => {
            for value in bigwig
                .intervals(chrom, args.start, args.end)?
                .unwrap_or_default()
            {
                writeln!(out, "{}\t{}\t{}\t{}", chrom, value.start, value.end, value.value)?;
            }
        }
        GenericBBIRead::BigBed(mut bigbed) => {
            for entry in bigbed
                .entries(chrom, args.start, args.end)?
                .unwrap_or_default()
            {
                if entry.rest.is_empty() {
                    writeln!(out, "{}\t{}\t{}", chrom, entry.start, entry.end)?;
                } else {
                    writeln!(
                        out,
                        "{}\t{}\t{}\t{}",
                        chrom, entry.start, entry.end, entry.rest
                    )?;
                }
            }
        }
    }
    out.flush()?;
    Ok(())
}
