use std::path::{Path, PathBuf};

use byteorder::{NativeEndian, WriteBytesExt};
use index_list::IndexList;
use tracing::warn;

use crate::bbi::bbiwrite::{
    check_entry_bounds, chunk_by_chrom, compress_section, write_bbi_file, BBIContents,
    ChromCatalog, EncodedSection, OrderRule, SectionData, WriteOrder,
};
use crate::bbi::{BBIError, BedEntry, Summary, Value, BIGBED_MAGIC};
use crate::BBIWriteOptions;

const BED_FIELDS: &[(&str, &str, &str)] = &[
    ("string", "name", "Name of item."),
    ("uint", "score", "Score (0-1000)"),
    ("char[1]", "strand", "+ or - for strand"),
    ("uint", "thickStart", "Start of where display should be thick (start codon)"),
    ("uint", "thickEnd", "End of where display should be thick (stop codon)"),
    ("uint", "reserved", "Used as itemRgb as of 2004-11-22"),
    ("int", "blockCount", "Number of blocks"),
    ("int[blockCount]", "blockSizes", "Comma separated list of block sizes"),
    ("int[blockCount]", "chromStarts", "Start positions relative to chromStart"),
    ("int", "expCount", "Experiment count"),
    ("int[expCount]", "expIds", "Comma separated list of experiment ids. Always 0,1,2,3...."),
    ("float[expCount]", "expScores", "Comma separated list of experiment scores."),
];

/// The number of tab-separated columns in the `rest` of a bed entry.
fn rest_columns(rest: &str) -> usize {
    if rest.is_empty() {
        0
    } else {
        rest.split('\t').count()
    }
}

/// Generates the autoSql schema of a standard BED file with as many extra
/// columns as `rest` has. Columns past BED12+3 are undocumented `lstring`s.
pub fn bed_autosql(rest: &str) -> String {
    let extra_fields = rest_columns(rest);
    let mut def = String::from(
        "table bed\n\"Browser Extensible Data\"\n(\n\
         \x20   string chrom;       \"Reference sequence chromosome or scaffold\"\n\
         \x20   uint   chromStart;  \"Start position in chromosome\"\n\
         \x20   uint   chromEnd;    \"End position in chromosome\"\n",
    );
    for i in 0..extra_fields {
        match BED_FIELDS.get(i) {
            Some((ty, name, desc)) => {
                def.push_str(&format!("    {} {}; \"{}\"\n", ty, name, desc));
            }
            None => {
                def.push_str(&format!(
                    "    lstring field{}; \"Undocumented field\"\n",
                    i + 4
                ));
            }
        }
    }
    def.push(')');
    def
}

/// The struct used to write a bigBed file
pub struct BigBedWrite {
    pub path: PathBuf,
    pub options: BBIWriteOptions,
    /// The schema stored in the file. If unset, one is generated by
    /// [`bed_autosql`] from the first entry.
    pub autosql: Option<String>,
    chroms: ChromCatalog,
    // Indexed by chromosome id
    entries: Option<Vec<Vec<BedEntry>>>,
    order: WriteOrder,
    first_rest: Option<String>,
    item_count: u64,
}

impl BigBedWrite {
    /// Declares the chromosomes of a new bigBed at `path`.
    pub fn create_file(
        path: impl AsRef<Path>,
        chrom_sizes: Vec<(String, u32)>,
    ) -> Result<Self, BBIError> {
        let chroms = ChromCatalog::new(chrom_sizes)?;
        let entries = (0..chroms.len()).map(|_| vec![]).collect();
        Ok(BigBedWrite {
            path: path.as_ref().to_path_buf(),
            options: BBIWriteOptions::default(),
            autosql: None,
            chroms,
            entries: Some(entries),
            order: WriteOrder::new(OrderRule::SortedStarts),
            first_rest: None,
            item_count: 0,
        })
    }

    /// Adds entries on `chrom`, sorted by start. Entries may overlap.
    ///
    /// Either all entries are added, or (on error) none are.
    pub fn add_entries(&mut self, chrom: &str, entries: Vec<BedEntry>) -> Result<(), BBIError> {
        if self.entries.is_none() {
            return Err(BBIError::ClosedHandle);
        }
        let (chrom_id, length) = self.chroms.get(chrom)?;

        let mut order = self.order.clone();
        for entry in entries.iter() {
            check_entry_bounds(chrom, length, entry.start, entry.end)?;
            if entry.rest.contains('\0') {
                return Err(BBIError::InvalidEntry(format!(
                    "{}:{}-{} contains a NUL byte.",
                    chrom, entry.start, entry.end
                )));
            }
            order.advance(chrom, chrom_id, entry.start, entry.end)?;
        }

        self.order = order;
        let Some(all_entries) = self.entries.as_mut() else {
            return Err(BBIError::ClosedHandle);
        };
        if self.first_rest.is_none() {
            self.first_rest = entries.first().map(|e| e.rest.clone());
        }
        self.item_count += entries.len() as u64;
        all_entries[chrom_id as usize].extend(entries);
        Ok(())
    }

    /// Writes out the file. Afterwards, every call to the writer returns
    /// [`BBIError::ClosedHandle`].
    pub fn close(&mut self) -> Result<(), BBIError> {
        let entries = self.entries.take().ok_or(BBIError::ClosedHandle)?;
        let options = self.options;

        let first_rest = self.first_rest.as_deref().unwrap_or("");
        let field_count = (3 + rest_columns(first_rest)) as u16;
        let autosql = self
            .autosql
            .clone()
            .unwrap_or_else(|| bed_autosql(first_rest));

        let mut summary = Summary::empty();
        for chrom_entries in entries.iter() {
            add_depth(chrom_entries, &mut summary);
        }

        let max_items = options.items_per_slot.max(1);
        let compress = options.compress;
        let sections = entries
            .into_iter()
            .enumerate()
            .flat_map(move |(chrom_id, chrom_entries)| {
                let chrom_id = chrom_id as u32;
                chunk_by_chrom(chrom_entries, max_items, |_| chrom_id)
                    .into_iter()
                    .map(move |items| encode_section(compress, items, chrom_id))
            });

        write_bbi_file(
            &self.path,
            &self.chroms,
            &options,
            BBIContents {
                magic: BIGBED_MAGIC,
                field_count,
                defined_field_count: field_count,
                autosql: Some(autosql),
                summary,
                item_count: Some(self.item_count),
                sections,
                zooms: vec![],
            },
        )
    }
}

impl Drop for BigBedWrite {
    fn drop(&mut self) {
        if self.entries.is_some() {
            warn!(
                path = %self.path.display(),
                "bigBed writer dropped without close; buffered entries discarded"
            );
        }
    }
}

/// Adds the coverage depth of one chromosome's entries (sorted by start) to `summary`.
///
/// Each run of bases with the same, non-zero, number of overlapping entries
/// counts as one value of that depth.
fn add_depth(entries: &[BedEntry], summary: &mut Summary) {
    // Runs of constant depth from the current start onwards, in order.
    let mut overlap: IndexList<Value> = IndexList::new();
    for (i, entry) in entries.iter().enumerate() {
        let next_start = entries.get(i + 1).map(|e| e.start);
        add_interval_to_depth(&mut overlap, summary, entry.start, entry.end, next_start);
    }
}

fn add_interval_to_depth(
    overlap: &mut IndexList<Value>,
    summary: &mut Summary,
    item_start: u32,
    item_end: u32,
    next_start: Option<u32>,
) {
    // Anything left in `overlap` was already cut at this start.
    debug_assert!(overlap
        .get_first()
        .map(|f| f.start == item_start)
        .unwrap_or(true));

    let mut index = overlap.first_index();
    while index.is_some() {
        let Some(o) = overlap.get_mut(index) else {
            break;
        };
        o.value += 1.0;
        if item_end < o.end {
            let value = o.value - 1.0;
            let end = o.end;
            o.end = item_end;
            overlap.insert_after(
                index,
                Value {
                    start: item_end,
                    end,
                    value,
                },
            );
            break;
        }
        index = overlap.next_index(index);
    }

    let covered_to = overlap.get_last().map(|o| o.end).unwrap_or(item_start);
    if covered_to < item_end {
        overlap.insert_last(Value {
            start: covered_to,
            end: item_end,
            value: 1.0,
        });
    }

    // Everything before the next start can no longer change.
    let next_start = next_start.unwrap_or(u32::MAX);
    while let Some(mut removed) = overlap.remove_first() {
        if removed.start >= next_start {
            overlap.insert_first(removed);
            break;
        }
        if removed.end <= next_start {
            if removed.end > removed.start {
                summary.add(removed.end - removed.start, f64::from(removed.value));
            }
        } else {
            summary.add(next_start - removed.start, f64::from(removed.value));
            removed.start = next_start;
            overlap.insert_first(removed);
            break;
        }
    }
}

async fn encode_section(
    compress: bool,
    items_in_section: Vec<BedEntry>,
    chrom_id: u32,
) -> EncodedSection {
    let mut bytes: Vec<u8> = vec![];

    let start = items_in_section[0].start;
    let end = items_in_section
        .iter()
        .map(|e| e.end)
        .max()
        .unwrap_or(start);
    for item in items_in_section.iter() {
        bytes.write_u32::<NativeEndian>(chrom_id)?;
        bytes.write_u32::<NativeEndian>(item.start)?;
        bytes.write_u32::<NativeEndian>(item.end)?;
        bytes.extend_from_slice(item.rest.as_bytes());
        bytes.write_u8(b'\0')?;
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
