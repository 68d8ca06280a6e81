use anyhow::Context;
use byteordered::Endianness;
use clap::Parser;

use crate::utils::cli::num_with_commas;
use crate::{BBIFile, BBIRead, GenericBBIRead};

#[derive(Clone, Debug, PartialEq, Parser)]
#[command(about = "Gets information about a bigWig or bigBed.", long_about = None)]
pub struct BBIInfoArgs {
    /// The bigWig or bigBed to get info for.
    pub file: String,

    /// If set, will print out the list of chromosomes in the file and their sizes.
    #[arg(long)]
    #[arg(default_value_t = false)]
    pub chroms: bool,

    /// If set, will print out the list of all zoom levels.
    #[arg(long)]
    #[arg(default_value_t = false)]
    pub zooms: bool,

    /// If set, will print out the minimum and maximum on a single line.
    #[arg(long)]
    #[arg(default_value_t = false)]
    pub minmax: bool,
}

pub fn bbiinfo(args: BBIInfoArgs) -> anyhow::Result<()> {
    let mut bbi = GenericBBIRead::open_file(&args.file)
        .with_context(|| format!("Unable to open {}", args.file))?;
    let totals = bbi.header()?;
    if args.minmax {
        println!("{:.6} {:.6}", totals.min_val, totals.max_val);
        return Ok(());
    }

    let info = bbi.info();
    let header = info.header;
    println!(
        "type: {}",
        match info.filetype {
            BBIFile::BigWig => "bigWig",
            BBIFile::BigBed => "bigBed",
        }
    );
    println!("version: {}", header.version);
    println!(
        "isCompressed: {}",
        if header.is_compressed() { "yes" } else { "no" }
    );
    println!(
        "isSwapped: {}",
        if matches!(header.endianness, Endianness::Big) {
            "1"
        } else {
            "0"
        }
    );
    if info.filetype == BBIFile::BigBed {
        println!("fieldCount: {}", header.field_count);
        println!("definedFieldCount: {}", header.defined_field_count);
    }
    println!("zoomLevels: {}", info.zoom_headers.len());
    if args.zooms {
        for zoom in info.zoom_headers.iter() {
            println!(
                "\t{}\t{}",
                zoom.reduction_level,
                zoom.index_offset - zoom.data_offset
            );
        }
    }
    println!("chromCount: {}", info.chrom_info.len());
    if args.chroms {
        for chrom in info.chrom_info.iter() {
            println!("\t{} {} {}", chrom.name, chrom.id, chrom.length);
        }
    }

    let bases = totals.bases_covered as f64;
    println!("basesCovered: {}", num_with_commas(totals.bases_covered));
    println!("mean: {:.6}", totals.sum_data / bases);
    println!("min: {:.6}", totals.min_val);
    println!("max: {:.6}", totals.max_val);
    let var = (totals.sum_squares - (totals.sum_data * totals.sum_data) / bases) / (bases - 1.0);
    println!("std: {:.6}", var.max(0.0).sqrt());

    Ok(())
}
