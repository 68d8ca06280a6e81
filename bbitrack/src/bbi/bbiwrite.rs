use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::Path;

use byteorder::{NativeEndian, WriteBytesExt};
use futures::channel::mpsc as futures_mpsc;
use futures::future::FutureExt;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use libdeflater::{CompressionLvl, Compressor};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bbi::{
    BBIError, CirTreeState, Summary, ZoomHeader, ZoomRecord, BBI_VERSION, CHROM_TREE_MAGIC,
    CIR_TREE_MAGIC,
};
use crate::utils::tell::Tell;

/// The default block size used when writing a bbi file
pub const DEFAULT_BLOCK_SIZE: u32 = 256;
/// The default items per slot used when writing a bbi file
pub const DEFAULT_ITEMS_PER_SLOT: u32 = 1024;
/// The most zoom levels a bbi file written by this crate will have
pub const MAX_ZOOM_LEVELS: usize = 10;

/// Options for writing to a bbi file
#[derive(Copy, Clone, Debug)]
pub struct BBIWriteOptions {
    /// Compress data and zoom blocks with zlib
    pub compress: bool,
    /// Number of items bundled in one data block
    pub items_per_slot: u32,
    /// Number of children per node of the indices
    pub block_size: u32,
    /// Maximum number of zoom levels. `0` picks as many as are useful, up to
    /// `MAX_ZOOM_LEVELS`.
    pub max_zooms: u32,
    /// Bases covered by a record of the first zoom level. `0` derives it from
    /// the average width of the written intervals.
    pub initial_zoom_size: u32,
    /// Factor between successive zoom levels
    pub zoom_increment: u32,
    /// Worker threads used to compress blocks
    pub nthreads: usize,
    /// Blocks being compressed ahead of the writer
    pub channel_size: usize,
}

impl Default for BBIWriteOptions {
    fn default() -> Self {
        BBIWriteOptions {
            compress: true,
            items_per_slot: DEFAULT_ITEMS_PER_SLOT,
            block_size: DEFAULT_BLOCK_SIZE,
            max_zooms: 0,
            initial_zoom_size: 0,
            zoom_increment: 4,
            nthreads: 6,
            channel_size: 100,
        }
    }
}

impl BBIWriteOptions {
    /// Children per index node. Node headers store the count as a u16.
    pub(crate) fn index_block_size(&self) -> u32 {
        self.block_size.clamp(2, u32::from(u16::MAX))
    }
}

#[derive(Debug)]
pub(crate) struct SectionData {
    pub(crate) chrom: u32,
    pub(crate) start: u32,
    pub(crate) end: u32,
    pub(crate) data: Vec<u8>,
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Section {
    pub(crate) chrom: u32,
    pub(crate) start: u32,
    pub(crate) end: u32,
    pub(crate) offset: u64,
    pub(crate) size: u64,
}

pub(crate) type EncodedSection = io::Result<(SectionData, usize)>;

/// The chromosomes of a file being written, fixed at creation.
#[derive(Debug)]
pub(crate) struct ChromCatalog {
    chroms: Vec<(String, u32)>,
    ids: HashMap<String, u32>,
}

impl ChromCatalog {
    pub(crate) fn new(chrom_sizes: Vec<(String, u32)>) -> Result<Self, BBIError> {
        let mut ids = HashMap::with_capacity(chrom_sizes.len());
        for (id, (name, length)) in chrom_sizes.iter().enumerate() {
            if name.is_empty() {
                return Err(BBIError::InvalidEntry(
                    "Chromosome names must not be empty.".to_owned(),
                ));
            }
            if *length == 0 {
                return Err(BBIError::InvalidEntry(format!(
                    "Chromosome {} has a length of zero.",
                    name
                )));
            }
            if ids.insert(name.clone(), id as u32).is_some() {
                return Err(BBIError::InvalidEntry(format!(
                    "Chromosome {} was declared twice.",
                    name
                )));
            }
        }
        Ok(ChromCatalog {
            chroms: chrom_sizes,
            ids,
        })
    }

    /// The id and length of a chromosome
    pub(crate) fn get(&self, name: &str) -> Result<(u32, u32), BBIError> {
        match self.ids.get(name) {
            Some(&id) => Ok((id, self.chroms[id as usize].1)),
            None => Err(BBIError::UnknownChromosome(name.to_owned())),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.chroms.len()
    }

    pub(crate) fn sizes(&self) -> &[(String, u32)] {
        &self.chroms
    }
}

/// What counts as "going backwards" within a chromosome.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum OrderRule {
    /// Each entry must start at or after the end of the previous one (bigWig).
    NonOverlapping,
    /// Each entry must start at or after the start of the previous one (bigBed).
    SortedStarts,
}

/// Tracks the write position across calls so entries reach the file sorted.
///
/// Chromosomes must be written contiguously: once another chromosome has been
/// written to, a chromosome is closed for good.
#[derive(Clone, Debug)]
pub(crate) struct WriteOrder {
    rule: OrderRule,
    current: Option<(u32, u32)>,
    closed: HashSet<u32>,
}

impl WriteOrder {
    pub(crate) fn new(rule: OrderRule) -> Self {
        WriteOrder {
            rule,
            current: None,
            closed: HashSet::new(),
        }
    }

    /// Records the entry `[start, end)` on `chrom_id`, or fails if it would be out of order.
    pub(crate) fn advance(
        &mut self,
        chrom: &str,
        chrom_id: u32,
        start: u32,
        end: u32,
    ) -> Result<(), BBIError> {
        match self.current {
            Some((current_chrom, last)) if current_chrom == chrom_id => {
                if start < last {
                    let what = match self.rule {
                        OrderRule::NonOverlapping => "the end of the previous entry",
                        OrderRule::SortedStarts => "the start of the previous entry",
                    };
                    return Err(BBIError::OutOfOrderEntry(format!(
                        "{}:{}-{} starts before {} ({}).",
                        chrom, start, end, what, last
                    )));
                }
            }
            Some((current_chrom, _)) => {
                if self.closed.contains(&chrom_id) {
                    return Err(BBIError::OutOfOrderEntry(format!(
                        "Chromosome {} was already written and closed.",
                        chrom
                    )));
                }
                self.closed.insert(current_chrom);
            }
            None => {}
        }
        let last = match self.rule {
            OrderRule::NonOverlapping => end,
            OrderRule::SortedStarts => start,
        };
        self.current = Some((chrom_id, last));
        Ok(())
    }
}

/// Checks the bounds of a single entry against its chromosome.
pub(crate) fn check_entry_bounds(
    chrom: &str,
    length: u32,
    start: u32,
    end: u32,
) -> Result<(), BBIError> {
    if start >= end {
        return Err(BBIError::InvalidEntry(format!(
            "{}:{}-{} is empty or inverted.",
            chrom, start, end
        )));
    }
    if end > length {
        return Err(BBIError::InvalidEntry(format!(
            "{}:{}-{} ends past the chromosome length ({}).",
            chrom, start, end, length
        )));
    }
    Ok(())
}

/// Accumulates zoom records of one resolution.
///
/// Windows are aligned to multiples of the resolution. A record covers the
/// bases with data inside its window, so values spanning several windows are
/// split between records.
pub(crate) struct ZoomAccumulator {
    pub(crate) resolution: u32,
    live: Option<ZoomRecord>,
    pub(crate) records: Vec<ZoomRecord>,
}

impl ZoomAccumulator {
    pub(crate) fn new(resolution: u32) -> Self {
        ZoomAccumulator {
            resolution,
            live: None,
            records: vec![],
        }
    }

    pub(crate) fn add(&mut self, chrom: u32, start: u32, end: u32, value: f64) {
        let resolution = u64::from(self.resolution);
        let mut add_start = start;
        while add_start < end {
            let window = u64::from(add_start) / resolution;
            let window_end = (window + 1) * resolution;
            let add_end = window_end.min(u64::from(end)) as u32;

            let in_live_window = matches!(
                &self.live,
                Some(live) if live.chrom == chrom && u64::from(live.start) / resolution == window
            );
            if !in_live_window {
                let fresh = ZoomRecord {
                    chrom,
                    start: add_start,
                    end: add_start,
                    summary: Summary::empty(),
                };
                if let Some(done) = self.live.replace(fresh) {
                    self.records.push(done);
                }
            }
            if let Some(live) = self.live.as_mut() {
                live.end = add_end;
                live.summary.add(add_end - add_start, value);
            }
            add_start = add_end;
        }
    }

    pub(crate) fn finish(&mut self) {
        if let Some(done) = self.live.take() {
            self.records.push(done);
        }
    }
}

/// The resolutions to accumulate zoom records for.
pub(crate) fn zoom_resolutions(options: &BBIWriteOptions, summary: &Summary) -> Vec<u32> {
    if summary.total_items == 0 {
        return vec![];
    }
    let max_zooms = match options.max_zooms as usize {
        0 => MAX_ZOOM_LEVELS,
        n => n.min(MAX_ZOOM_LEVELS),
    };
    let initial = match options.initial_zoom_size {
        0 => {
            let average = (summary.bases_covered / summary.total_items).max(10);
            average.saturating_mul(4).min(u64::from(u32::MAX)) as u32
        }
        size => size,
    };
    let increment = options.zoom_increment.max(2);
    std::iter::successors(Some(initial), |z| z.checked_mul(increment))
        .take(max_zooms)
        .collect()
}

/// Drops the zoom levels that don't reduce the data enough to be worth storing.
pub(crate) fn useful_zooms(
    zooms: Vec<ZoomAccumulator>,
    total_items: u64,
) -> Vec<ZoomAccumulator> {
    let mut kept = vec![];
    let mut last_count = total_items;
    for zoom in zooms {
        let count = zoom.records.len() as u64;
        if count == 0 || count >= last_count || count > total_items / 2 {
            break;
        }
        last_count = count;
        kept.push(zoom);
    }
    kept
}

pub(crate) fn compress_section(compress: bool, bytes: Vec<u8>) -> io::Result<(Vec<u8>, usize)> {
    if !compress {
        return Ok((bytes, 0));
    }
    let mut compressor = Compressor::new(CompressionLvl::default());
    let max_sz = compressor.zlib_compress_bound(bytes.len());
    let mut compressed_data = vec![0; max_sz];
    let actual_sz = compressor
        .zlib_compress(&bytes, &mut compressed_data)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{:?}", e)))?;
    compressed_data.truncate(actual_sz);
    Ok((compressed_data, bytes.len()))
}

pub(crate) async fn encode_zoom_section(
    compress: bool,
    items_in_section: Vec<ZoomRecord>,
) -> EncodedSection {
    let mut bytes = Vec::with_capacity(items_in_section.len() * 32);

    let chrom = items_in_section[0].chrom;
    let start = items_in_section[0].start;
    let end = items_in_section[items_in_section.len() - 1].end;

    for item in items_in_section.iter() {
        bytes.write_u32::<NativeEndian>(item.chrom)?;
        bytes.write_u32::<NativeEndian>(item.start)?;
        bytes.write_u32::<NativeEndian>(item.end)?;
        bytes.write_u32::<NativeEndian>(item.summary.bases_covered as u32)?;
        bytes.write_f32::<NativeEndian>(item.summary.min_val as f32)?;
        bytes.write_f32::<NativeEndian>(item.summary.max_val as f32)?;
        bytes.write_f32::<NativeEndian>(item.summary.sum as f32)?;
        bytes.write_f32::<NativeEndian>(item.summary.sum_squares as f32)?;
    }

    let (data, uncompress_buf_size) = compress_section(compress, bytes)?;
    Ok((
        SectionData {
            chrom,
            start,
            end,
            data,
        },
        uncompress_buf_size,
    ))
}

pub(crate) fn write_blank_headers<W: Write + Seek>(file: &mut W) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    // Common header
    file.write_all(&[0; 64])?;
    // Zoom levels
    file.write_all(&[0; MAX_ZOOM_LEVELS * 24])?;

    Ok(())
}

/// Where things ended up in the file; written into the header last.
pub(crate) struct FileLayout {
    pub(crate) magic: u32,
    pub(crate) chrom_index_start: u64,
    pub(crate) full_data_offset: u64,
    pub(crate) index_start: u64,
    pub(crate) field_count: u16,
    pub(crate) defined_field_count: u16,
    pub(crate) auto_sql_offset: u64,
    pub(crate) total_summary_offset: u64,
    pub(crate) uncompress_buf_size: usize,
}

pub(crate) fn write_info<W: Write + Seek>(
    file: &mut W,
    layout: &FileLayout,
    zoom_entries: &[ZoomHeader],
    mut summary: Summary,
    data_count: u64,
) -> io::Result<()> {
    if summary.bases_covered == 0 {
        summary.min_val = 0.0;
        summary.max_val = 0.0;
    }

    file.seek(SeekFrom::Start(0))?;
    file.write_u32::<NativeEndian>(layout.magic)?;
    file.write_u16::<NativeEndian>(BBI_VERSION)?;
    file.write_u16::<NativeEndian>(zoom_entries.len() as u16)?;
    file.write_u64::<NativeEndian>(layout.chrom_index_start)?;
    file.write_u64::<NativeEndian>(layout.full_data_offset)?;
    file.write_u64::<NativeEndian>(layout.index_start)?;
    file.write_u16::<NativeEndian>(layout.field_count)?;
    file.write_u16::<NativeEndian>(layout.defined_field_count)?;
    file.write_u64::<NativeEndian>(layout.auto_sql_offset)?;
    file.write_u64::<NativeEndian>(layout.total_summary_offset)?;
    file.write_u32::<NativeEndian>(layout.uncompress_buf_size as u32)?;
    file.write_u64::<NativeEndian>(0)?; // reserved

    debug_assert!(file.tell()? == 64);

    for zoom_entry in zoom_entries {
        file.write_u32::<NativeEndian>(zoom_entry.reduction_level)?;
        file.write_u32::<NativeEndian>(0)?;
        file.write_u64::<NativeEndian>(zoom_entry.data_offset)?;
        file.write_u64::<NativeEndian>(zoom_entry.index_offset)?;
    }

    file.seek(SeekFrom::Start(layout.total_summary_offset))?;
    file.write_u64::<NativeEndian>(summary.bases_covered)?;
    file.write_f64::<NativeEndian>(summary.min_val)?;
    file.write_f64::<NativeEndian>(summary.max_val)?;
    file.write_f64::<NativeEndian>(summary.sum)?;
    file.write_f64::<NativeEndian>(summary.sum_squares)?;

    file.seek(SeekFrom::Start(layout.full_data_offset))?;
    file.write_u64::<NativeEndian>(data_count)?;

    file.seek(SeekFrom::End(0))?;
    file.write_u32::<NativeEndian>(layout.magic)?;

    Ok(())
}

/// Writes the chromosome catalog as a B+ tree keyed by name.
///
/// Every node is padded to `block_size` items, so the offset of any node can be
/// computed from its level and position alone.
pub(crate) fn write_chrom_tree<W: Write + Seek>(
    file: &mut W,
    chroms: &[(String, u32)],
    block_size: u32,
) -> io::Result<()> {
    let mut items: Vec<(&[u8], u32, u32)> = chroms
        .iter()
        .enumerate()
        .map(|(id, (name, length))| (name.as_bytes(), id as u32, *length))
        .collect();
    items.sort_by(|a, b| a.0.cmp(b.0));

    let item_count = items.len() as u64;
    let key_size = items.iter().map(|i| i.0.len()).max().unwrap_or(1).max(1);
    let block_size = u64::from(block_size)
        .min(item_count)
        .max(if item_count > 1 { 2 } else { 1 });

    file.write_u32::<NativeEndian>(CHROM_TREE_MAGIC)?;
    file.write_u32::<NativeEndian>(block_size as u32)?;
    file.write_u32::<NativeEndian>(key_size as u32)?;
    file.write_u32::<NativeEndian>(8)?; // size of Id (u32) + Size (u32)
    file.write_u64::<NativeEndian>(item_count)?;
    file.write_u64::<NativeEndian>(0)?; // Reserved

    let item_size = key_size as u64 + 8;
    let node_size = 4 + block_size * item_size;

    // Node counts per level, root first
    let mut level_counts = vec![item_count.div_ceil(block_size).max(1)];
    while let Some(&count) = level_counts.last() {
        if count <= 1 {
            break;
        }
        level_counts.push(count.div_ceil(block_size));
    }
    level_counts.reverse();
    let levels = level_counts.len();

    let mut level_offset = file.tell()?;
    let mut key = vec![0u8; key_size];
    for (depth, &count) in level_counts.iter().enumerate() {
        let next_level_offset = level_offset + count * node_size;
        let is_leaf = depth == levels - 1;
        // Items under each child of a node on this level
        let items_per_child = block_size.pow((levels - 1 - depth) as u32);
        for node in 0..count {
            let first = node * block_size;
            let written = if is_leaf {
                let end = (first + block_size).min(item_count);
                file.write_u8(1)?;
                file.write_u8(0)?;
                file.write_u16::<NativeEndian>((end - first) as u16)?;
                for &(name, id, length) in &items[first as usize..end as usize] {
                    key.fill(0);
                    key[..name.len()].copy_from_slice(name);
                    file.write_all(&key)?;
                    file.write_u32::<NativeEndian>(id)?;
                    file.write_u32::<NativeEndian>(length)?;
                }
                end - first
            } else {
                let end = (first + block_size).min(level_counts[depth + 1]);
                file.write_u8(0)?;
                file.write_u8(0)?;
                file.write_u16::<NativeEndian>((end - first) as u16)?;
                for child in first..end {
                    let name = items[(child * items_per_child) as usize].0;
                    key.fill(0);
                    key[..name.len()].copy_from_slice(name);
                    file.write_all(&key)?;
                    file.write_u64::<NativeEndian>(next_level_offset + child * node_size)?;
                }
                end - first
            };
            let padding = (block_size - written) * item_size;
            file.write_all(&vec![0u8; padding as usize])?;
        }
        level_offset = next_level_offset;
    }
    Ok(())
}

#[derive(Debug)]
pub(crate) struct RTreeNode {
    start_chrom_idx: u32,
    start_base: u32,
    end_chrom_idx: u32,
    end_base: u32,
    /// Indices into the level below (or into the sections, for leaves)
    children: Range<usize>,
}

/// A cir tree stored as an arena: one `Vec` of nodes per level, leaves first.
/// Nodes refer to their children by index into the level below.
#[derive(Debug)]
pub(crate) struct RTreeIndex {
    sections: Vec<Section>,
    levels: Vec<Vec<RTreeNode>>,
}

impl RTreeIndex {
    pub(crate) fn section_count(&self) -> u64 {
        self.sections.len() as u64
    }

    fn root(&self) -> Option<&RTreeNode> {
        self.levels.last().and_then(|l| l.first())
    }
}

fn bounds(mut items: impl Iterator<Item = (u32, u32, u32, u32)>) -> (u32, u32, u32, u32) {
    let Some(first) = items.next() else {
        return (0, 0, 0, 0);
    };
    items.fold(first, |acc, i| {
        let start = (acc.0, acc.1).min((i.0, i.1));
        let end = (acc.2, acc.3).max((i.2, i.3));
        (start.0, start.1, end.0, end.1)
    })
}

/// Groups `len` children into nodes of at most `block_size`, with their bounds.
fn group_nodes<F>(len: usize, block_size: usize, child_bounds: F) -> Vec<RTreeNode>
where
    F: Fn(Range<usize>) -> (u32, u32, u32, u32),
{
    (0..len)
        .step_by(block_size)
        .map(|first| {
            let children = first..(first + block_size).min(len);
            let (start_chrom_idx, start_base, end_chrom_idx, end_base) =
                child_bounds(children.clone());
            RTreeNode {
                start_chrom_idx,
                start_base,
                end_chrom_idx,
                end_base,
                children,
            }
        })
        .collect()
}

/// Builds the cir tree over the given sections, bottom up.
pub(crate) fn get_rtreeindex<S>(sections_stream: S, options: &BBIWriteOptions) -> RTreeIndex
where
    S: Iterator<Item = Section>,
{
    let block_size = options.index_block_size() as usize;
    let sections: Vec<Section> = sections_stream.collect();

    let mut leaves = group_nodes(sections.len(), block_size, |children| {
        bounds(
            sections[children]
                .iter()
                .map(|s| (s.chrom, s.start, s.chrom, s.end)),
        )
    });
    if leaves.is_empty() {
        leaves.push(RTreeNode {
            start_chrom_idx: 0,
            start_base: 0,
            end_chrom_idx: 0,
            end_base: 0,
            children: 0..0,
        });
    }

    let mut levels = vec![leaves];
    while let Some(below) = levels.last().filter(|l| l.len() > 1) {
        let level = group_nodes(below.len(), block_size, |children| {
            bounds(
                below[children]
                    .iter()
                    .map(|n| (n.start_chrom_idx, n.start_base, n.end_chrom_idx, n.end_base)),
            )
        });
        levels.push(level);
    }

    RTreeIndex { sections, levels }
}

const NODEHEADER_SIZE: u64 = 1 + 1 + 2;
const NON_LEAFNODE_SIZE: u64 = 4 + 4 + 4 + 4 + 8;
const LEAFNODE_SIZE: u64 = 4 + 4 + 4 + 4 + 8 + 8;

pub(crate) fn write_rtreeindex<W: Write + Seek>(
    file: &mut W,
    index: &RTreeIndex,
    options: &BBIWriteOptions,
) -> io::Result<()> {
    let end_of_data = file.tell()?;
    let (start_chrom, start_base, end_chrom, end_base) = index
        .root()
        .map(|r| (r.start_chrom_idx, r.start_base, r.end_chrom_idx, r.end_base))
        .unwrap_or_default();

    file.write_u32::<NativeEndian>(CIR_TREE_MAGIC)?;
    file.write_u32::<NativeEndian>(options.index_block_size())?;
    file.write_u64::<NativeEndian>(index.section_count())?;
    file.write_u32::<NativeEndian>(start_chrom)?;
    file.write_u32::<NativeEndian>(start_base)?;
    file.write_u32::<NativeEndian>(end_chrom)?;
    file.write_u32::<NativeEndian>(end_base)?;
    file.write_u64::<NativeEndian>(end_of_data)?;
    file.write_u32::<NativeEndian>(options.items_per_slot)?;
    file.write_u32::<NativeEndian>(0)?;

    // Offsets of every node, root level first, nodes packed without padding
    let mut node_offsets: Vec<Vec<u64>> = vec![vec![]; index.levels.len()];
    let mut offset = file.tell()?;
    for (level, nodes) in index.levels.iter().enumerate().rev() {
        let item_size = if level == 0 {
            LEAFNODE_SIZE
        } else {
            NON_LEAFNODE_SIZE
        };
        for node in nodes {
            node_offsets[level].push(offset);
            offset += NODEHEADER_SIZE + item_size * node.children.len() as u64;
        }
    }

    for (level, nodes) in index.levels.iter().enumerate().rev() {
        for node in nodes {
            let isleaf = level == 0;
            file.write_u8(isleaf as u8)?;
            file.write_u8(0)?;
            file.write_u16::<NativeEndian>(node.children.len() as u16)?;
            if isleaf {
                for section in &index.sections[node.children.clone()] {
                    file.write_u32::<NativeEndian>(section.chrom)?;
                    file.write_u32::<NativeEndian>(section.start)?;
                    file.write_u32::<NativeEndian>(section.chrom)?;
                    file.write_u32::<NativeEndian>(section.end)?;
                    file.write_u64::<NativeEndian>(section.offset)?;
                    file.write_u64::<NativeEndian>(section.size)?;
                }
            } else {
                let below = &index.levels[level - 1];
                for child in node.children.clone() {
                    let child_node = &below[child];
                    file.write_u32::<NativeEndian>(child_node.start_chrom_idx)?;
                    file.write_u32::<NativeEndian>(child_node.start_base)?;
                    file.write_u32::<NativeEndian>(child_node.end_chrom_idx)?;
                    file.write_u32::<NativeEndian>(child_node.end_base)?;
                    file.write_u64::<NativeEndian>(node_offsets[level - 1][child])?;
                }
            }
        }
    }
    debug_assert_eq!(file.tell()?, offset);

    Ok(())
}

/// Receives encoding sections in order and writes them out, reporting where
/// each landed.
async fn write_data<W: Write>(
    mut data_file: W,
    mut current_offset: u64,
    section_sender: crossbeam_channel::Sender<Section>,
    mut frx: futures_mpsc::Receiver<JoinHandle<EncodedSection>>,
) -> io::Result<(W, usize)> {
    let mut max_uncompressed_buf_size = 0;
    while let Some(section_raw) = frx.next().await {
        let (section, uncompressed_buf_size) = section_raw
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        max_uncompressed_buf_size = max_uncompressed_buf_size.max(uncompressed_buf_size);
        let size = section.data.len() as u64;
        data_file.write_all(&section.data)?;
        // The receiver outlives this task
        let _ = section_sender.send(Section {
            chrom: section.chrom,
            start: section.start,
            end: section.end,
            offset: current_offset,
            size,
        });
        current_offset += size;
    }
    Ok((data_file, max_uncompressed_buf_size))
}

/// Encodes the given sections on `runtime`, writing them to `file` in order.
///
/// Returns the file, the written sections, and the largest uncompressed section size.
pub(crate) fn write_sections<W, I, F>(
    runtime: &Runtime,
    mut file: W,
    options: &BBIWriteOptions,
    sections: I,
) -> io::Result<(W, Vec<Section>, usize)>
where
    W: Write + Seek + Send + 'static,
    I: Iterator<Item = F>,
    F: Future<Output = EncodedSection> + Send + 'static,
{
    let start_offset = file.tell()?;
    let (mut ftx, frx) = futures_mpsc::channel(options.channel_size);
    let (section_sender, section_receiver) = crossbeam_channel::unbounded();

    let (remote, handle) = write_data(file, start_offset, section_sender, frx).remote_handle();
    runtime.spawn(remote);

    let (file, max_uncompressed_buf_size) = runtime.block_on(async move {
        for encode in sections {
            // If the writer stopped early, its error is reported by the handle
            if ftx.send(runtime.spawn(encode)).await.is_err() {
                break;
            }
        }
        drop(ftx);
        handle.await
    })?;

    let sections: Vec<Section> = section_receiver.into_iter().collect();
    Ok((file, sections, max_uncompressed_buf_size))
}

/// Splits records into sections of at most `items_per_slot`, never crossing chromosomes.
pub(crate) fn chunk_by_chrom<T, F: Fn(&T) -> u32>(
    items: Vec<T>,
    items_per_slot: u32,
    chrom_of: F,
) -> Vec<Vec<T>> {
    let items_per_slot = (items_per_slot as usize).max(1);
    let mut chunks: Vec<Vec<T>> = vec![];
    for item in items {
        let chrom = chrom_of(&item);
        match chunks.last_mut() {
            Some(last) if last.len() < items_per_slot && chrom_of(&last[0]) == chrom => {
                last.push(item)
            }
            _ => chunks.push(vec![item]),
        }
    }
    chunks
}

pub(crate) fn write_zooms<W: Write + Seek + Send + 'static>(
    runtime: &Runtime,
    mut file: W,
    zooms: Vec<ZoomAccumulator>,
    options: &BBIWriteOptions,
) -> io::Result<(W, Vec<ZoomHeader>, usize)> {
    let mut zoom_entries: Vec<ZoomHeader> = vec![];
    let mut max_uncompressed_buf_size = 0;
    for zoom in zooms {
        let data_offset = file.tell()?;
        let compress = options.compress;
        let encodes = chunk_by_chrom(zoom.records, options.items_per_slot, |r| r.chrom)
            .into_iter()
            .map(move |records| encode_zoom_section(compress, records));
        let (mut zoom_file, sections, uncompress_buf_size) =
            write_sections(runtime, file, options, encodes)?;
        max_uncompressed_buf_size = max_uncompressed_buf_size.max(uncompress_buf_size);

        let index_offset = zoom_file.tell()?;
        let index = get_rtreeindex(sections.into_iter(), options);
        write_rtreeindex(&mut zoom_file, &index, options)?;
        debug!(
            resolution = zoom.resolution,
            sections = index.section_count(),
            "wrote zoom level"
        );

        zoom_entries.push(ZoomHeader {
            reduction_level: zoom.resolution,
            data_offset,
            index_offset,
            index: CirTreeState::Unloaded,
        });
        file = zoom_file;
    }
    Ok((file, zoom_entries, max_uncompressed_buf_size))
}

pub(crate) fn build_runtime(options: &BBIWriteOptions) -> io::Result<Runtime> {
    if options.nthreads <= 1 {
        Builder::new_current_thread().build()
    } else {
        Builder::new_multi_thread()
            .worker_threads(options.nthreads)
            .build()
    }
}

/// Everything a finished bbi file is made of, other than where it goes.
pub(crate) struct BBIContents<I> {
    pub(crate) magic: u32,
    pub(crate) field_count: u16,
    pub(crate) defined_field_count: u16,
    pub(crate) autosql: Option<String>,
    pub(crate) summary: Summary,
    /// The header's data count for bigBeds is the item count; bigWigs store the section count.
    pub(crate) item_count: Option<u64>,
    pub(crate) sections: I,
    pub(crate) zooms: Vec<ZoomAccumulator>,
}

/// Writes a complete bbi file to a temporary file next to `path`, and only
/// replaces `path` once everything has been written.
pub(crate) fn write_bbi_file<I, F>(
    path: &Path,
    chroms: &ChromCatalog,
    options: &BBIWriteOptions,
    contents: BBIContents<I>,
) -> Result<(), BBIError>
where
    I: Iterator<Item = F>,
    F: Future<Output = EncodedSection> + Send + 'static,
{
    let runtime = build_runtime(options)?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut file = BufWriter::new(NamedTempFile::new_in(dir)?);

    write_blank_headers(&mut file)?;

    let auto_sql_offset = match &contents.autosql {
        Some(autosql) => {
            let offset = file.tell()?;
            file.write_all(autosql.as_bytes())?;
            file.write_u8(0)?;
            offset
        }
        None => 0,
    };

    let total_summary_offset = file.tell()?;
    file.write_all(&[0; 40])?;

    let full_data_offset = file.tell()?;
    // Filled in by `write_info`
    file.write_u64::<NativeEndian>(0)?;

    let (mut file, sections, data_uncompress_buf_size) =
        write_sections(&runtime, file, options, contents.sections)?;

    // The chrom tree comes after the data, which is compatible: readers find it by offset.
    let chrom_index_start = file.tell()?;
    write_chrom_tree(&mut file, chroms.sizes(), options.index_block_size())?;

    let index_start = file.tell()?;
    let index = get_rtreeindex(sections.into_iter(), options);
    write_rtreeindex(&mut file, &index, options)?;

    let (mut file, zoom_entries, zoom_uncompress_buf_size) =
        write_zooms(&runtime, file, contents.zooms, options)?;

    let layout = FileLayout {
        magic: contents.magic,
        chrom_index_start,
        full_data_offset,
        index_start,
        field_count: contents.field_count,
        defined_field_count: contents.defined_field_count,
        auto_sql_offset,
        total_summary_offset,
        uncompress_buf_size: data_uncompress_buf_size.max(zoom_uncompress_buf_size),
    };
    let data_count = contents.item_count.unwrap_or(index.section_count());
    write_info(
        &mut file,
        &layout,
        &zoom_entries,
        contents.summary,
        data_count,
    )?;

    let temp = file.into_inner().map_err(|e| e.into_error())?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    info!(
        path = %path.display(),
        sections = index.section_count(),
        zoom_levels = zoom_entries.len(),
        "finalized bbi file"
    );
    Ok(())
}
