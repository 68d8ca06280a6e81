/*!
Provides the interface for writing bigWig files.

## Example
```rust,no_run
# use std::error::Error;
# fn main() -> Result<(), Box<dyn Error>> {
use bbitrack::{BigWigWrite, Entries};

let chrom_sizes = vec![("chr1".to_string(), 1_000_000), ("chr2".to_string(), 1_500_000)];
let mut out = BigWigWrite::create_file("out.bigWig", chrom_sizes)?;
out.options.max_zooms = 4;

out.add_entries(Entries::Intervals {
    chroms: vec!["chr1".to_string(), "chr1".to_string()],
    starts: vec![0, 100],
    ends: vec![5, 120],
    values: vec![0.5, 1.0],
})?;
out.add_entries(Entries::Steps {
    chrom: "chr2".to_string(),
    start: 900,
    span: 20,
    step: 30,
    values: vec![-5.0, -20.0, 25.0],
})?;
out.close()?;
# Ok(())
# }
```
*/
use std::path::{Path, PathBuf};

use byteorder::{NativeEndian, WriteBytesExt};
use itertools::Itertools;
use tracing::{debug, warn};

use crate::bbi::bbiwrite::{
    check_entry_bounds, chunk_by_chrom, compress_section, useful_zooms, write_bbi_file,
    zoom_resolutions, BBIContents, ChromCatalog, EncodedSection, OrderRule, SectionData,
    WriteOrder, ZoomAccumulator,
};
use crate::bbi::{BBIError, Summary, Value, BIGWIG_MAGIC};
use crate::BBIWriteOptions;

/// A batch of values to add to a bigWig, in one of three shapes.
#[derive(Clone, Debug, PartialEq)]
pub enum Entries {
    /// Explicit intervals: `chroms`, `starts`, `ends` and `values` are parallel
    /// and must have the same length. Stored as bedGraph sections.
    Intervals {
        chroms: Vec<String>,
        starts: Vec<u32>,
        ends: Vec<u32>,
        values: Vec<f32>,
    },
    /// Intervals of `span` bases at each of `starts` on one chromosome.
    /// Stored as variable step sections.
    Spans {
        chrom: String,
        starts: Vec<u32>,
        span: u32,
        values: Vec<f32>,
    },
    /// The i-th value covers `[start + i * step, start + i * step + span)`.
    /// Stored as fixed step sections.
    Steps {
        chrom: String,
        start: u32,
        span: u32,
        step: u32,
        values: Vec<f32>,
    },
}

/// How a run of values is laid out on disk, kept from the call that added it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Encoding {
    BedGraph,
    VarStep { span: u32 },
    FixedStep { span: u32, step: u32 },
}

impl Encoding {
    fn section_type(&self) -> u8 {
        match self {
            Encoding::BedGraph => 1,
            Encoding::VarStep { .. } => 2,
            Encoding::FixedStep { .. } => 3,
        }
    }
}

/// Values from one call on one chromosome.
#[derive(Debug)]
struct Run {
    chrom_id: u32,
    encoding: Encoding,
    values: Vec<Value>,
}

/// A validated, not yet committed, part of a call.
struct PendingRun<'a> {
    chrom: &'a str,
    chrom_id: u32,
    length: u32,
    encoding: Encoding,
    values: Vec<Value>,
}

/// The struct used to write a bigWig file
pub struct BigWigWrite {
    pub path: PathBuf,
    pub options: BBIWriteOptions,
    chroms: ChromCatalog,
    // Indexed by chromosome id
    runs: Option<Vec<Vec<Run>>>,
    order: WriteOrder,
    summary: Summary,
}

impl BigWigWrite {
    /// Declares the chromosomes of a new bigWig at `path`.
    ///
    /// Chromosome ids follow the order of `chrom_sizes`. Nothing is written
    /// to `path` until [`BigWigWrite::close`].
    pub fn create_file(
        path: impl AsRef<Path>,
        chrom_sizes: Vec<(String, u32)>,
    ) -> Result<Self, BBIError> {
        let chroms = ChromCatalog::new(chrom_sizes)?;
        let runs = (0..chroms.len()).map(|_| vec![]).collect();
        Ok(BigWigWrite {
            path: path.as_ref().to_path_buf(),
            options: BBIWriteOptions::default(),
            chroms,
            runs: Some(runs),
            order: WriteOrder::new(OrderRule::NonOverlapping),
            summary: Summary::empty(),
        })
    }

    /// Adds a batch of values.
    ///
    /// The whole batch is checked before anything is recorded: on error, the
    /// writer is left exactly as it was.
    pub fn add_entries(&mut self, entries: Entries) -> Result<(), BBIError> {
        self.add(entries, true)
    }

    /// Like [`BigWigWrite::add_entries`], but skips the checks of each
    /// individual entry (bounds, and ordering within the batch). The
    /// chromosome must still exist and the batch must still follow what was
    /// written before.
    pub fn add_entries_unchecked(&mut self, entries: Entries) -> Result<(), BBIError> {
        self.add(entries, false)
    }

    fn add(&mut self, entries: Entries, checked: bool) -> Result<(), BBIError> {
        if self.runs.is_none() {
            return Err(BBIError::ClosedHandle);
        }
        let pending = split_runs(&self.chroms, entries, checked)?;

        let mut order = self.order.clone();
        for run in pending.iter() {
            let (Some(first), Some(last)) = (run.values.first(), run.values.last()) else {
                continue;
            };
            if checked {
                for value in run.values.iter() {
                    check_entry_bounds(run.chrom, run.length, value.start, value.end)?;
                    order.advance(run.chrom, run.chrom_id, value.start, value.end)?;
                }
            } else {
                order.advance(run.chrom, run.chrom_id, first.start, first.end)?;
                if run.values.len() > 1 {
                    order.advance(run.chrom, run.chrom_id, last.start, last.end)?;
                }
            }
        }

        // Everything checks out; commit.
        self.order = order;
        let Some(runs) = self.runs.as_mut() else {
            return Err(BBIError::ClosedHandle);
        };
        for run in pending {
            if run.values.is_empty() {
                continue;
            }
            for value in run.values.iter() {
                self.summary.add(
                    value.end.saturating_sub(value.start),
                    f64::from(value.value),
                );
            }
            runs[run.chrom_id as usize].push(Run {
                chrom_id: run.chrom_id,
                encoding: run.encoding,
                values: run.values,
            });
        }
        Ok(())
    }

    /// Writes out the file: data sections, zoom levels, and indices.
    ///
    /// Afterwards, every call to the writer returns [`BBIError::ClosedHandle`].
    pub fn close(&mut self) -> Result<(), BBIError> {
        let runs = self.runs.take().ok_or(BBIError::ClosedHandle)?;
        let options = self.options;

        let resolutions = zoom_resolutions(&options, &self.summary);
        let mut zooms: Vec<ZoomAccumulator> =
            resolutions.into_iter().map(ZoomAccumulator::new).collect();
        for run in runs.iter().flatten() {
            for value in run.values.iter() {
                for zoom in zooms.iter_mut() {
                    zoom.add(run.chrom_id, value.start, value.end, f64::from(value.value));
                }
            }
        }
        zooms.iter_mut().for_each(ZoomAccumulator::finish);
        let zooms = useful_zooms(zooms, self.summary.total_items);
        debug!(
            resolutions = ?zooms.iter().map(|z| z.resolution).collect::<Vec<_>>(),
            "chose zoom levels"
        );

        let max_items = options.items_per_slot.clamp(1, u32::from(u16::MAX));
        let compress = options.compress;
        let sections = runs
            .into_iter()
            .flatten()
            .flat_map(move |run| {
                let Run {
                    chrom_id,
                    encoding,
                    values,
                } = run;
                chunk_by_chrom(values, max_items, |_| chrom_id)
                    .into_iter()
                    .map(move |items| encode_section(compress, items, chrom_id, encoding))
            });

        write_bbi_file(
            &self.path,
            &self.chroms,
            &options,
            BBIContents {
                magic: BIGWIG_MAGIC,
                field_count: 0,
                defined_field_count: 0,
                autosql: None,
                summary: self.summary,
                item_count: None,
                sections,
                zooms,
            },
        )
    }
}

impl Drop for BigWigWrite {
    fn drop(&mut self) {
        if self.runs.is_some() {
            warn!(
                path = %self.path.display(),
                "bigWig writer dropped without close; buffered data discarded"
            );
        }
    }
}

/// Expands a batch into runs of values per chromosome, resolving chromosomes.
fn split_runs(
    chroms_catalog: &ChromCatalog,
    entries: Entries,
    checked: bool,
) -> Result<Vec<PendingRun>, BBIError> {
    match entries {
        Entries::Intervals {
            chroms,
            starts,
            ends,
            values,
        } => {
            let len = chroms.len();
            if starts.len() != len || ends.len() != len || values.len() != len {
                return Err(BBIError::InvalidEntry(format!(
                    "Mismatched lengths: {} chroms, {} starts, {} ends, {} values.",
                    len,
                    starts.len(),
                    ends.len(),
                    values.len()
                )));
            }
            let mut pending: Vec<PendingRun> = vec![];
            for (chrom, indices) in &(0..len).chunk_by(|&i| chroms[i].as_str()) {
                let mut run = resolve(chroms_catalog, chrom)?;
                run.values = indices
                    .map(|i| Value {
                        start: starts[i],
                        end: ends[i],
                        value: values[i],
                    })
                    .collect();
                pending.push(run);
            }
            Ok(pending)
        }
        Entries::Spans {
            chrom,
            starts,
            span,
            values,
        } => {
            if starts.len() != values.len() {
                return Err(BBIError::InvalidEntry(format!(
                    "Mismatched lengths: {} starts, {} values.",
                    starts.len(),
                    values.len()
                )));
            }
            if checked && span == 0 {
                return Err(BBIError::InvalidEntry("Span must be positive.".to_owned()));
            }
            let mut run = resolve(chroms_catalog, &chrom)?;
            run.encoding = Encoding::VarStep { span };
            run.values = starts
                .into_iter()
                .zip(values)
                .map(|(start, value)| {
                    let end = start.checked_add(span).ok_or_else(|| overflow(&chrom))?;
                    Ok(Value { start, end, value })
                })
                .collect::<Result<_, BBIError>>()?;
            Ok(vec![run])
        }
        Entries::Steps {
            chrom,
            start,
            span,
            step,
            values,
        } => {
            if checked && (span == 0 || step == 0) {
                return Err(BBIError::InvalidEntry(
                    "Span and step must be positive.".to_owned(),
                ));
            }
            let mut run = resolve(chroms_catalog, &chrom)?;
            run.encoding = Encoding::FixedStep { span, step };
            run.values = values
                .into_iter()
                .enumerate()
                .map(|(i, value)| {
                    let start = u64::from(start) + i as u64 * u64::from(step);
                    let end = start + u64::from(span);
                    if end > u64::from(u32::MAX) {
                        return Err(overflow(&chrom));
                    }
                    Ok(Value {
                        start: start as u32,
                        end: end as u32,
                        value,
                    })
                })
                .collect::<Result<_, BBIError>>()?;
            Ok(vec![run])
        }
    }
}

fn resolve<'a>(chroms_catalog: &'a ChromCatalog, chrom: &str) -> Result<PendingRun<'a>, BBIError> {
    let (chrom_id, length) = chroms_catalog.get(chrom)?;
    let chrom = chroms_catalog.sizes()[chrom_id as usize].0.as_str();
    Ok(PendingRun {
        chrom,
        chrom_id,
        length,
        encoding: Encoding::BedGraph,
        values: vec![],
    })
}

fn overflow(chrom: &str) -> BBIError {
    BBIError::InvalidEntry(format!("Positions on {} overflow a u32.", chrom))
}

async fn encode_section(
    compress: bool,
    items_in_section: Vec<Value>,
    chrom_id: u32,
    encoding: Encoding,
) -> EncodedSection {
    let mut bytes = Vec::with_capacity(24 + (items_in_section.len() * 12));

    let start = items_in_section[0].start;
    let end = items_in_section[items_in_section.len() - 1].end;
    let (item_step, item_span) = match encoding {
        Encoding::BedGraph => (0, 0),
        Encoding::VarStep { span } => (0, span),
        Encoding::FixedStep { span, step } => (step, span),
    };
    bytes.write_u32::<NativeEndian>(chrom_id)?;
    bytes.write_u32::<NativeEndian>(start)?;
    bytes.write_u32::<NativeEndian>(end)?;
    bytes.write_u32::<NativeEndian>(item_step)?;
    bytes.write_u32::<NativeEndian>(item_span)?;
    bytes.write_u8(encoding.section_type())?;
    bytes.write_u8(0)?;
    bytes.write_u16::<NativeEndian>(items_in_section.len() as u16)?;

    for item in items_in_section.iter() {
        match encoding {
            Encoding::BedGraph => {
                bytes.write_u32::<NativeEndian>(item.start)?;
                bytes.write_u32::<NativeEndian>(item.end)?;
            }
            Encoding::VarStep { .. } => {
                bytes.write_u32::<NativeEndian>(item.start)?;
            }
            Encoding::FixedStep { .. } => {}
        }
        bytes.write_f32::<NativeEndian>(item.value)?;
    }

    let (data, uncompress_buf_size) = compress_section(compress, bytes)?;
    Ok((
        SectionData {
            chrom: chrom_id,
            start,
            end,
            data,
        },
        uncompress_buf_size,
    ))
}
