/*!
Provides the interface for reading bigWig files.

## Example
```rust,no_run
# use std::error::Error;
# fn main() -> Result<(), Box<dyn Error>> {
use bbitrack::{BBIRead, BigWigRead, StatType};

// First, we open a bigWig using a file name.
let mut bwread = BigWigRead::open_file("in.bigWig")?;

// Then, we could get the chromosomes and lengths
let chroms = bwread.chroms()?;
println!("{} has {} bases", chroms[0].name, chroms[0].length);

// We can get summary data
let header = bwread.header()?;
println!("{} bases covered", header.bases_covered);

// Or we can read data from an interval
let intervals = bwread.intervals("chr1", Some(0), Some(1000))?;
let mean = bwread.stats("chr1", None, None, StatType::Mean, 10)?;
bwread.close();
# Ok(())
# }
```
*/
use std::io;
use std::path::Path;

use byteordered::{ByteOrdered, Endianness};
use tracing::debug;

use crate::bbi::{BBIError, BBIFile, Value, ZoomRecord};
use crate::bbiread::{
    read_info, search_cir_tree, zoom_records, BBIFileInfo, BBIFileRead, BBIRead,
    CachedBBIFileRead,
};
use crate::internal::BBIReadInternal;
use crate::utils::misc::{stat_bins, zoom_for_bin, BinStats};
use crate::utils::reopen::{Reopen, ReopenableFile, SeekableRead};

pub use crate::utils::misc::{StatType, UnknownStatError};

const SECTION_HEADER_SIZE: usize = 24;

/// The struct used to read a bigWig file
pub struct BigWigRead<R> {
    pub(super) info: BBIFileInfo,
    pub(super) read: Option<R>,
}

impl<R: Reopen> Reopen for BigWigRead<R> {
    fn reopen(&self) -> io::Result<Self> {
        let read = self
            .read
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, BBIError::ClosedHandle))?;
        Ok(BigWigRead {
            info: self.info.clone(),
            read: Some(read.reopen()?),
        })
    }
}

impl<R: BBIFileRead> BBIRead for BigWigRead<R> {
    fn info(&self) -> &BBIFileInfo {
        &self.info
    }

    fn is_closed(&self) -> bool {
        self.read.is_none()
    }
}

impl<R: BBIFileRead> BBIReadInternal for BigWigRead<R> {
    type Read = R;

    fn reader_and_info(&mut self) -> Result<(&mut Self::Read, &mut BBIFileInfo), BBIError> {
        match self.read.as_mut() {
            Some(read) => Ok((read, &mut self.info)),
            None => Err(BBIError::ClosedHandle),
        }
    }
}

impl BigWigRead<ReopenableFile> {
    /// Opens a new `BigWigRead` from a given path as a file.
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self, BBIError> {
        BigWigRead::open(ReopenableFile::open(path)?)
    }
}

impl<R> BigWigRead<R>
where
    R: SeekableRead,
{
    /// Converts this `BigWigRead` to where the `BBIFileRead` caches index
    /// access and block data
    pub fn cached(self) -> Result<BigWigRead<CachedBBIFileRead<R>>, BBIError> {
        let read = self.read.ok_or(BBIError::ClosedHandle)?;
        Ok(BigWigRead {
            read: Some(CachedBBIFileRead::new(read)),
            info: self.info,
        })
    }
}

impl<R> BigWigRead<R>
where
    R: BBIFileRead,
{
    /// Opens a new `BigWigRead` for a given type that implements both `Read` and `Seek`
    pub fn open(mut read: R) -> Result<Self, BBIError> {
        let info = read_info(&mut read)?;
        match info.filetype {
            BBIFile::BigWig => {}
            BBIFile::BigBed => {
                return Err(BBIError::MalformedFile("Not a bigWig file.".to_owned()))
            }
        }

        Ok(BigWigRead {
            info,
            read: Some(read),
        })
    }

    /// Does *not* check if the passed `R` matches the provided info (including if the `R` is a bigWig at all!)
    pub fn with_info(info: BBIFileInfo, read: R) -> Self {
        BigWigRead {
            info,
            read: Some(read),
        }
    }

    /// Releases the source and any caches. All later queries, including
    /// [`BBIRead::chroms`], return [`BBIError::ClosedHandle`].
    pub fn close(&mut self) {
        self.read = None;
        self.info.chrom_info.clear();
        self.info.zoom_headers.clear();
    }

    /// All values overlapping `[start, end)` on `chrom_name`, with their stored
    /// bounds. Missing bounds default to the whole chromosome.
    ///
    /// Returns `None` if there is no data in the range.
    pub fn intervals(
        &mut self,
        chrom_name: &str,
        start: Option<u32>,
        end: Option<u32>,
    ) -> Result<Option<Vec<Value>>, BBIError> {
        self.reader_and_info()?;
        let (chrom, start, end) = self.info.resolve_range(chrom_name, start, end)?;
        let values = self.raw_values(chrom, start, end)?;
        Ok(if values.is_empty() { None } else { Some(values) })
    }

    /// Returns the values between `start` and `end` as a `Vec<f32>`. Any
    /// positions with no data in the bigWig will be `f32::NAN`.
    pub fn values(&mut self, chrom_name: &str, start: u32, end: u32) -> Result<Vec<f32>, BBIError> {
        self.reader_and_info()?;
        let (chrom, start, end) = self.info.resolve_range(chrom_name, Some(start), Some(end))?;
        let mut values = vec![f32::NAN; (end - start) as usize];

        let root_offset = self.full_data_cir_tree()?;
        let (reader, info) = self.reader_and_info()?;
        let endianness = info.header.endianness;
        let blocks = search_cir_tree(endianness, reader, root_offset, chrom, start, end)?;

        // Filled one block at a time
        let mut block_values = vec![];
        for block in blocks {
            let data = reader.get_block_data(info, &block)?;
            block_values.clear();
            get_block_values(endianness, &data, chrom, start, end, &mut block_values)?;
            for value in block_values.iter() {
                let value_start = (value.start.max(start) - start) as usize;
                let value_end = (value.end.min(end) - start) as usize;
                values[value_start..value_end].fill(value.value);
            }
        }
        Ok(values)
    }

    /// Computes `stat` over `n_bins` equal parts of `[start, end)`.
    ///
    /// Bins that line up with a zoom level are computed from its records;
    /// others from the raw data. Each bin reports `None` when it has no data
    /// (except for `Sum` and `Coverage`, which report zero).
    pub fn stats(
        &mut self,
        chrom_name: &str,
        start: Option<u32>,
        end: Option<u32>,
        stat: StatType,
        n_bins: u32,
    ) -> Result<Vec<Option<f64>>, BBIError> {
        self.binned_stats(chrom_name, start, end, stat, n_bins, false)
    }

    /// Like [`BigWigRead::stats`], but always computed from the raw data.
    pub fn stats_exact(
        &mut self,
        chrom_name: &str,
        start: Option<u32>,
        end: Option<u32>,
        stat: StatType,
        n_bins: u32,
    ) -> Result<Vec<Option<f64>>, BBIError> {
        self.binned_stats(chrom_name, start, end, stat, n_bins, true)
    }

    /// The zoom records of the level `reduction_level` overlapping `[start, end)`.
    pub fn zoom_values(
        &mut self,
        chrom_name: &str,
        start: u32,
        end: u32,
        reduction_level: u32,
    ) -> Result<Vec<ZoomRecord>, BBIError> {
        self.reader_and_info()?;
        let (chrom, start, end) = self.info.resolve_range(chrom_name, Some(start), Some(end))?;
        zoom_records(self, reduction_level, chrom, start, end)
    }

    fn binned_stats(
        &mut self,
        chrom_name: &str,
        start: Option<u32>,
        end: Option<u32>,
        stat: StatType,
        n_bins: u32,
        exact: bool,
    ) -> Result<Vec<Option<f64>>, BBIError> {
        self.reader_and_info()?;
        let (chrom, start, end) = self.info.resolve_range(chrom_name, start, end)?;
        let length = self.info.chrom(chrom_name)?.length;
        let n_bins = n_bins.max(1);
        if n_bins > end - start {
            return Err(BBIError::InvalidQueryRange { start, end, length });
        }

        let mut resolutions: Vec<u32> = if exact {
            vec![]
        } else {
            self.info
                .zoom_headers
                .iter()
                .map(|z| z.reduction_level)
                .collect()
        };
        resolutions.sort_unstable();

        let bins = stat_bins(start, end, n_bins);
        let mut raw: Option<Vec<Value>> = None;
        let mut zooms: Vec<(u32, Vec<ZoomRecord>)> = vec![];
        let mut out = Vec::with_capacity(bins.len());
        for (bin_start, bin_end) in bins {
            let mut bin = BinStats::new();
            match zoom_for_bin(&resolutions, bin_start, bin_end, length) {
                Some(level) => {
                    let records = match zooms.iter().position(|(l, _)| *l == level) {
                        Some(i) => &zooms[i].1,
                        None => {
                            debug!(level, chrom_name, "using zoom level for stats");
                            let records = zoom_records(self, level, chrom, start, end)?;
                            zooms.push((level, records));
                            &zooms[zooms.len() - 1].1
                        }
                    };
                    // Zoom records are sorted and never overlap each other
                    let first = records.partition_point(|r| r.end <= bin_start);
                    for record in records[first..].iter().take_while(|r| r.start < bin_end) {
                        bin.add_summary(&record.summary);
                    }
                }
                None => {
                    if raw.is_none() {
                        raw = Some(self.raw_values(chrom, start, end)?);
                    }
                    let values = raw.as_deref().unwrap_or_default();
                    let first = values.partition_point(|v| v.end <= bin_start);
                    for value in values[first..].iter().take_while(|v| v.start < bin_end) {
                        let bases = value
                            .end
                            .min(bin_end)
                            .saturating_sub(value.start.max(bin_start));
                        bin.add_value(bases, value.value);
                    }
                }
            }
            out.push(bin.get(stat, bin_end - bin_start));
        }
        Ok(out)
    }

    /// The values overlapping `[start, end)`, in order.
    fn raw_values(&mut self, chrom: u32, start: u32, end: u32) -> Result<Vec<Value>, BBIError> {
        let root_offset = self.full_data_cir_tree()?;
        let (reader, info) = self.reader_and_info()?;
        let endianness = info.header.endianness;
        let blocks = search_cir_tree(endianness, reader, root_offset, chrom, start, end)?;

        let mut values = vec![];
        for block in blocks {
            let data = reader.get_block_data(info, &block)?;
            get_block_values(endianness, &data, chrom, start, end, &mut values)?;
        }
        Ok(values)
    }
}

/// Parses a bigWig data section, keeping the values on `chrom` that overlap `[start, end)`.
fn get_block_values(
    endianness: Endianness,
    data: &[u8],
    chrom: u32,
    start: u32,
    end: u32,
    values: &mut Vec<Value>,
) -> Result<(), BBIError> {
    if data.len() < SECTION_HEADER_SIZE {
        return Err(BBIError::MalformedFile(format!(
            "Data section too short ({} bytes)",
            data.len()
        )));
    }
    let mut bytes = ByteOrdered::runtime(data, endianness);
    let chrom_id = bytes.read_u32()?;
    let chrom_start = bytes.read_u32()?;
    let _chrom_end = bytes.read_u32()?;
    let item_step = bytes.read_u32()?;
    let item_span = bytes.read_u32()?;
    let section_type = bytes.read_u8()?;
    let _reserved = bytes.read_u8()?;
    let item_count = bytes.read_u16()?;

    if chrom_id != chrom {
        return Ok(());
    }

    let mut push = |value: Value| {
        if value.end > start && value.start < end {
            values.push(value);
        }
    };
    match section_type {
        // bedGraph
        1 => {
            for _ in 0..item_count {
                let item_start = bytes.read_u32()?;
                let item_end = bytes.read_u32()?;
                let value = bytes.read_f32()?;
                if item_end < item_start {
                    return Err(BBIError::MalformedFile(format!(
                        "Interval ends before it starts: {}-{}",
                        item_start, item_end
                    )));
                }
                push(Value {
                    start: item_start,
                    end: item_end,
                    value,
                });
            }
        }
        // variable step
        2 => {
            for _ in 0..item_count {
                let item_start = bytes.read_u32()?;
                let value = bytes.read_f32()?;
                push(Value {
                    start: item_start,
                    end: item_start.saturating_add(item_span),
                    value,
                });
            }
        }
        // fixed step
        3 => {
            let mut curr_start = chrom_start;
            for _ in 0..item_count {
                let value = bytes.read_f32()?;
                push(Value {
                    start: curr_start,
                    end: curr_start.saturating_add(item_span),
                    value,
                });
                curr_start = curr_start.saturating_add(item_step);
            }
        }
        _ => {
            return Err(BBIError::MalformedFile(format!(
                "Unknown bigwig section type: {}",
                section_type
            )))
        }
    }
    Ok(())
}
