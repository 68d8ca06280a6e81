use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read, Seek, SeekFrom};

use byteordered::{ByteOrdered, Endianness};
use bytes::{Buf, BytesMut};
use libdeflater::Decompressor;
use serde::Serialize;
use smallvec::{smallvec, SmallVec};
use tracing::debug;

use crate::bbi::{
    BBIError, BBIFile, CirTreeState, Summary, ZoomHeader, ZoomRecord, BBI_VERSION, BIGBED_MAGIC,
    BIGWIG_MAGIC, CHROM_TREE_MAGIC, CIR_TREE_MAGIC,
};
use crate::utils::reopen::{Reopen, ReopenableFile, SeekableRead};
use crate::{BigBedRead, BigWigRead};

use self::internal::BBIReadInternal;

pub(crate) const CIR_TREE_HEADER_SIZE: u64 = 48;
const NODE_HEADER_SIZE: usize = 4;
const LEAF_ITEM_SIZE: usize = 32;
const NON_LEAF_ITEM_SIZE: usize = 24;
pub(crate) const ZOOM_RECORD_SIZE: usize = 32;
// Even with two children per node, this is far more chromosomes than fit in a file.
const MAX_CHROM_TREE_DEPTH: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Block {
    pub(crate) offset: u64,
    pub(crate) size: u64,
}

impl Block {
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Header info for a bbi file
///
/// Note that info on internal properties like file offsets are not public.
/// Reading data is available through higher-level functions.
#[derive(Copy, Clone, Debug)]
pub struct BBIHeader {
    pub endianness: Endianness,
    pub version: u16,
    pub field_count: u16,
    pub defined_field_count: u16,

    pub(crate) zoom_levels: u16,
    pub(crate) chromosome_tree_offset: u64,
    pub(crate) full_data_offset: u64,
    pub(crate) full_index_offset: u64,
    pub(crate) full_index: CirTreeState,
    pub(crate) auto_sql_offset: u64,
    pub(crate) total_summary_offset: u64,
    pub(crate) uncompress_buf_size: u32,
}

impl BBIHeader {
    pub fn is_compressed(&self) -> bool {
        self.uncompress_buf_size > 0
    }
}

/// Information on a chromosome in a bbi file
#[derive(Clone, Debug)]
pub struct ChromInfo {
    pub name: String,
    pub length: u32,
    pub id: u32,
}

impl PartialEq for ChromInfo {
    fn eq(&self, other: &ChromInfo) -> bool {
        self.name == other.name
    }
}

/// Info on a bbi file
#[derive(Clone, Debug)]
pub struct BBIFileInfo {
    /// The type of the bbi file - either a bigBed or a bigWig
    pub filetype: BBIFile,
    /// Header info
    pub header: BBIHeader,
    /// Info on zooms in the bbi file
    pub zoom_headers: Vec<ZoomHeader>,
    /// The chromosome info the bbi file is based on, ordered by id
    pub chrom_info: Vec<ChromInfo>,
}

impl BBIFileInfo {
    pub(crate) fn chrom(&self, chrom_name: &str) -> Result<&ChromInfo, BBIError> {
        self.chrom_info
            .iter()
            .find(|c| c.name == chrom_name)
            .ok_or_else(|| BBIError::UnknownChromosome(chrom_name.to_owned()))
    }

    /// Resolves optional query bounds against a chromosome, rejecting empty or
    /// out-of-bounds ranges before any data is read.
    pub(crate) fn resolve_range(
        &self,
        chrom_name: &str,
        start: Option<u32>,
        end: Option<u32>,
    ) -> Result<(u32, u32, u32), BBIError> {
        let chrom = self.chrom(chrom_name)?;
        let start = start.unwrap_or(0);
        let end = end.unwrap_or(chrom.length);
        if start >= end || end > chrom.length {
            return Err(BBIError::InvalidQueryRange {
                start,
                end,
                length: chrom.length,
            });
        }
        Ok((chrom.id, start, end))
    }
}

/// The totals stored in a bbi file, as written when the file was finalized.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct Header {
    pub version: u16,
    pub zoom_levels: u16,
    pub bases_covered: u64,
    pub min_val: f64,
    pub max_val: f64,
    pub sum_data: f64,
    pub sum_squares: f64,
}

pub(crate) mod internal {
    use super::*;

    pub trait BBIReadInternal {
        type Read: BBIFileRead;

        /// Gets the underlying reader and the info, or `ClosedHandle` if the handle was closed.
        fn reader_and_info(&mut self) -> Result<(&mut Self::Read, &mut BBIFileInfo), BBIError>;

        /// Offset of the root node of the full data index. The index header is
        /// read and checked on the first call only.
        fn full_data_cir_tree(&mut self) -> Result<u64, BBIError> {
            let (reader, info) = self.reader_and_info()?;
            if let CirTreeState::Loaded { root_offset } = info.header.full_index {
                return Ok(root_offset);
            }
            let index_offset = info.header.full_index_offset;
            let raw = reader.raw_reader();
            raw.seek(SeekFrom::Start(index_offset))?;
            read_cir_tree_header(info.header.endianness, raw)?;

            let root_offset = index_offset + CIR_TREE_HEADER_SIZE;
            info.header.full_index = CirTreeState::Loaded { root_offset };
            debug!(root_offset, "loaded full data index");
            Ok(root_offset)
        }

        /// Offset of the root node of a zoom level's index.
        fn zoom_cir_tree(&mut self, reduction_level: u32) -> Result<u64, BBIError> {
            let (reader, info) = self.reader_and_info()?;
            let endianness = info.header.endianness;
            let zoom_header = info
                .zoom_headers
                .iter_mut()
                .find(|h| h.reduction_level == reduction_level)
                .ok_or(BBIError::ReductionLevelNotFound(reduction_level))?;

            if let CirTreeState::Loaded { root_offset } = zoom_header.index {
                return Ok(root_offset);
            }
            let raw = reader.raw_reader();
            raw.seek(SeekFrom::Start(zoom_header.index_offset))?;
            read_cir_tree_header(endianness, raw)?;

            let root_offset = zoom_header.index_offset + CIR_TREE_HEADER_SIZE;
            zoom_header.index = CirTreeState::Loaded { root_offset };
            debug!(reduction_level, root_offset, "loaded zoom index");
            Ok(root_offset)
        }
    }
}

/// Generic methods for reading a bbi file
pub trait BBIRead: BBIReadInternal {
    /// Get basic info about the bbi file
    fn info(&self) -> &BBIFileInfo;

    /// Whether `close` was called on this handle
    fn is_closed(&self) -> bool;

    /// All chromosomes, ordered by id
    fn chroms(&self) -> Result<&[ChromInfo], BBIError> {
        if self.is_closed() {
            return Err(BBIError::ClosedHandle);
        }
        Ok(&self.info().chrom_info)
    }

    /// A single chromosome by name
    fn chrom(&self, name: &str) -> Result<&ChromInfo, BBIError> {
        if self.is_closed() {
            return Err(BBIError::ClosedHandle);
        }
        self.info().chrom(name)
    }

    /// Reads the summary totals of the file.
    ///
    /// Version 1 files don't store a summary; all totals are then zero.
    fn header(&mut self) -> Result<Header, BBIError> {
        let (reader, info) = self.reader_and_info()?;
        let summary = read_summary(reader, &info.header)?;
        Ok(Header {
            version: info.header.version,
            zoom_levels: info.header.zoom_levels,
            bases_covered: summary.bases_covered,
            min_val: summary.min_val,
            max_val: summary.max_val,
            sum_data: summary.sum,
            sum_squares: summary.sum_squares,
        })
    }
}

pub(crate) fn read_summary<R: BBIFileRead>(
    reader: &mut R,
    header: &BBIHeader,
) -> Result<Summary, BBIError> {
    let mut reader = ByteOrdered::runtime(reader.raw_reader(), header.endianness);
    let (bases_covered, min_val, max_val, sum, sum_squares) = if header.total_summary_offset != 0
    {
        reader.seek(SeekFrom::Start(header.total_summary_offset))?;
        (
            reader.read_u64()?,
            reader.read_f64()?,
            reader.read_f64()?,
            reader.read_f64()?,
            reader.read_f64()?,
        )
    } else {
        (0, 0.0, 0.0, 0.0, 0.0)
    };
    reader.seek(SeekFrom::Start(header.full_data_offset))?;
    let total_items = reader.read_u64()?;
    Ok(Summary {
        total_items,
        bases_covered,
        min_val,
        max_val,
        sum,
        sum_squares,
    })
}

pub(crate) fn read_cir_tree_header<R: Read>(
    endianness: Endianness,
    file: &mut R,
) -> Result<(), BBIError> {
    let mut header_data = BytesMut::zeroed(CIR_TREE_HEADER_SIZE as usize);
    file.read_exact(&mut header_data)?;

    let mut header = ByteOrdered::runtime(&header_data[..], endianness);
    let magic = header.read_u32()?;
    if magic != CIR_TREE_MAGIC {
        return Err(BBIError::MalformedFile(format!(
            "Invalid cir tree magic: {:#x}",
            magic
        )));
    }
    // The rest (block size, item count, bounds, items per slot) isn't needed to search.
    Ok(())
}

/// Finds all data blocks overlapping `[start, end)` on `chrom_ix`, in file order.
pub(crate) fn search_cir_tree<R: BBIFileRead>(
    endianness: Endianness,
    file: &mut R,
    root_offset: u64,
    chrom_ix: u32,
    start: u32,
    end: u32,
) -> Result<Vec<Block>, BBIError> {
    let mut blocks = vec![];

    let mut remaining_childblocks = VecDeque::with_capacity(2048);
    remaining_childblocks.push_front(root_offset);
    let iter = CirTreeBlockSearchIter {
        remaining_childblocks,
        file,
        endianness,
        chrom_ix,
        start,
        end,
    };

    for i in iter {
        blocks.extend(i?);
    }

    Ok(blocks)
}

pub enum GenericBBIRead<R: BBIFileRead> {
    BigWig(BigWigRead<R>),
    BigBed(BigBedRead<R>),
}

impl<R: BBIFileRead> BBIRead for GenericBBIRead<R> {
    fn info(&self) -> &BBIFileInfo {
        match self {
            GenericBBIRead::BigWig(b) => b.info(),
            GenericBBIRead::BigBed(b) => b.info(),
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            GenericBBIRead::BigWig(b) => b.is_closed(),
            GenericBBIRead::BigBed(b) => b.is_closed(),
        }
    }
}

impl<R: BBIFileRead> BBIReadInternal for GenericBBIRead<R> {
    type Read = R;

    fn reader_and_info(&mut self) -> Result<(&mut Self::Read, &mut BBIFileInfo), BBIError> {
        match self {
            GenericBBIRead::BigWig(b) => b.reader_and_info(),
            GenericBBIRead::BigBed(b) => b.reader_and_info(),
        }
    }
}

impl<R: BBIFileRead> GenericBBIRead<R> {
    /// Opens a bbi file of either type from a given type that implements both `Read` and `Seek`
    pub fn open(mut read: R) -> Result<Self, BBIError> {
        let info = read_info(&mut read)?;
        match info.filetype {
            BBIFile::BigWig => Ok(GenericBBIRead::BigWig(BigWigRead::with_info(info, read))),
            BBIFile::BigBed => Ok(GenericBBIRead::BigBed(BigBedRead::with_info(info, read))),
        }
    }

    pub fn bigwig(self) -> Option<BigWigRead<R>> {
        match self {
            GenericBBIRead::BigWig(b) => Some(b),
            GenericBBIRead::BigBed(_) => None,
        }
    }

    pub fn bigbed(self) -> Option<BigBedRead<R>> {
        match self {
            GenericBBIRead::BigBed(b) => Some(b),
            GenericBBIRead::BigWig(_) => None,
        }
    }
}

impl GenericBBIRead<ReopenableFile> {
    /// Opens a bbi file of either type
    pub fn open_file(path: &str) -> Result<Self, BBIError> {
        GenericBBIRead::open(ReopenableFile::open(path)?)
    }
}

/// The byte source of a bbi reader, plus block and node access on top of it.
pub trait BBIFileRead {
    type Reader: Read + Seek;

    /// Reads `length` bytes starting at `offset`.
    fn fetch(&mut self, offset: u64, length: usize) -> io::Result<Vec<u8>> {
        let reader = self.raw_reader();
        reader.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0u8; length];
        reader.read_exact(&mut data)?;
        Ok(data)
    }

    /// Gets the data (uncompressed, if applicable) of a block
    fn get_block_data(&mut self, info: &BBIFileInfo, block: &Block) -> Result<Vec<u8>, BBIError>;

    fn blocks_for_cir_tree_node(
        &mut self,
        endianness: Endianness,
        node_offset: u64,
        chrom_ix: u32,
        start: u32,
        end: u32,
    ) -> Result<(SmallVec<[u64; 4]>, SmallVec<[Block; 4]>), BBIError>;

    fn raw_reader(&mut self) -> &mut Self::Reader;
}

impl<S: SeekableRead> BBIFileRead for S {
    type Reader = Self;

    fn get_block_data(&mut self, info: &BBIFileInfo, block: &Block) -> Result<Vec<u8>, BBIError> {
        read_block_data(info, self, block)
    }

    fn blocks_for_cir_tree_node(
        &mut self,
        endianness: Endianness,
        node_offset: u64,
        chrom_ix: u32,
        start: u32,
        end: u32,
    ) -> Result<(SmallVec<[u64; 4]>, SmallVec<[Block; 4]>), BBIError> {
        let node = read_node(self, node_offset, endianness)?;
        Ok(nodes_overlapping(&node, chrom_ix, start, end))
    }

    fn raw_reader(&mut self) -> &mut Self::Reader {
        self
    }
}

/// Keeps decompressed blocks and parsed index nodes in memory. Useful when the
/// same regions are queried repeatedly, or when the source is slow.
pub struct CachedBBIFileRead<S: SeekableRead> {
    read: S,
    cir_tree_node_map: HashMap<u64, CirTreeNode>,
    block_data: HashMap<Block, Vec<u8>>,
}

impl<S: SeekableRead> CachedBBIFileRead<S> {
    pub fn new(read: S) -> Self {
        CachedBBIFileRead {
            read,
            cir_tree_node_map: HashMap::new(),
            block_data: HashMap::new(),
        }
    }
}

impl<S: SeekableRead> BBIFileRead for CachedBBIFileRead<S> {
    type Reader = S;

    fn get_block_data(&mut self, info: &BBIFileInfo, block: &Block) -> Result<Vec<u8>, BBIError> {
        if let Some(data) = self.block_data.get(block) {
            return Ok(data.clone());
        }
        if self.block_data.len() >= 5000 {
            self.block_data.clear();
        }
        let data = read_block_data(info, &mut self.read, block)?;
        self.block_data.insert(*block, data.clone());
        Ok(data)
    }

    fn blocks_for_cir_tree_node(
        &mut self,
        endianness: Endianness,
        node_offset: u64,
        chrom_ix: u32,
        start: u32,
        end: u32,
    ) -> Result<(SmallVec<[u64; 4]>, SmallVec<[Block; 4]>), BBIError> {
        let node = match self.cir_tree_node_map.entry(node_offset) {
            Entry::Occupied(node) => node.into_mut(),
            Entry::Vacant(e) => e.insert(read_node(&mut self.read, node_offset, endianness)?),
        };
        Ok(nodes_overlapping(node, chrom_ix, start, end))
    }

    fn raw_reader(&mut self) -> &mut Self::Reader {
        &mut self.read
    }
}

impl<R: Reopen + SeekableRead> Reopen for CachedBBIFileRead<R> {
    fn reopen(&self) -> io::Result<Self> {
        Ok(Self {
            read: self.read.reopen()?,
            cir_tree_node_map: self.cir_tree_node_map.clone(),
            block_data: self.block_data.clone(),
        })
    }
}

pub(crate) fn read_info<R: BBIFileRead>(file: &mut R) -> Result<BBIFileInfo, BBIError> {
    let file = file.raw_reader();
    file.seek(SeekFrom::Start(0))?;

    let mut header_data = BytesMut::zeroed(64);
    file.read_exact(&mut header_data)?;

    // Read as big endian; a little endian file shows the magic byte-swapped.
    let magic = header_data.get_u32();
    let (filetype, endianness) = match magic {
        _ if magic == BIGWIG_MAGIC => (BBIFile::BigWig, Endianness::Big),
        _ if magic == BIGWIG_MAGIC.swap_bytes() => (BBIFile::BigWig, Endianness::Little),
        _ if magic == BIGBED_MAGIC => (BBIFile::BigBed, Endianness::Big),
        _ if magic == BIGBED_MAGIC.swap_bytes() => (BBIFile::BigBed, Endianness::Little),
        _ => {
            return Err(BBIError::MalformedFile(
                "Invalid magic (likely not a bigWig or bigBed file)".to_owned(),
            ))
        }
    };

    let mut fields = ByteOrdered::runtime(&header_data[..], endianness);
    let version = fields.read_u16()?;
    if version == 0 || version > BBI_VERSION {
        return Err(BBIError::UnsupportedFormatVersion(version));
    }
    let zoom_levels = fields.read_u16()?;
    let chromosome_tree_offset = fields.read_u64()?;
    let full_data_offset = fields.read_u64()?;
    let full_index_offset = fields.read_u64()?;
    let field_count = fields.read_u16()?;
    let defined_field_count = fields.read_u16()?;
    let auto_sql_offset = fields.read_u64()?;
    let total_summary_offset = fields.read_u64()?;
    let uncompress_buf_size = fields.read_u32()?;
    let _reserved = fields.read_u64()?;

    let header = BBIHeader {
        endianness,
        version,
        zoom_levels,
        chromosome_tree_offset,
        full_data_offset,
        full_index_offset,
        full_index: CirTreeState::Unloaded,
        field_count,
        defined_field_count,
        auto_sql_offset,
        total_summary_offset,
        uncompress_buf_size,
    };

    let zoom_headers = read_zoom_headers(file, &header)?;

    file.seek(SeekFrom::Start(header.chromosome_tree_offset))?;

    let mut header_data = BytesMut::zeroed(32);
    file.read_exact(&mut header_data)?;
    let mut tree_header = ByteOrdered::runtime(&header_data[..], endianness);

    let magic = tree_header.read_u32()?;
    if magic != CHROM_TREE_MAGIC {
        return Err(BBIError::MalformedFile(format!(
            "Invalid chromosome tree magic: {:#x}",
            magic
        )));
    }
    let _block_size = tree_header.read_u32()?;
    let key_size = tree_header.read_u32()?;
    let val_size = tree_header.read_u32()?;
    let item_count = tree_header.read_u64()?;
    let _reserved = tree_header.read_u64()?;

    if val_size != 8 {
        return Err(BBIError::MalformedFile(format!(
            "Invalid chromosome tree value size: {}",
            val_size
        )));
    }

    let mut chrom_info = Vec::with_capacity(item_count.min(1 << 16) as usize);
    read_chrom_tree_block(file, endianness, &mut chrom_info, key_size)?;
    chrom_info.sort_by_key(|c| c.id);

    Ok(BBIFileInfo {
        filetype,
        header,
        zoom_headers,
        chrom_info,
    })
}

fn read_zoom_headers<R: Read>(
    file: &mut R,
    header: &BBIHeader,
) -> Result<Vec<ZoomHeader>, BBIError> {
    let mut header_data = BytesMut::zeroed((header.zoom_levels as usize) * 24);
    file.read_exact(&mut header_data)?;
    let mut data = ByteOrdered::runtime(&header_data[..], header.endianness);

    let mut zoom_headers = Vec::with_capacity(header.zoom_levels as usize);
    for _ in 0..header.zoom_levels {
        let reduction_level = data.read_u32()?;
        let _reserved = data.read_u32()?;
        let data_offset = data.read_u64()?;
        let index_offset = data.read_u64()?;
        if reduction_level == 0 {
            return Err(BBIError::MalformedFile(
                "Zoom level with a reduction level of 0".to_owned(),
            ));
        }

        zoom_headers.push(ZoomHeader {
            reduction_level,
            data_offset,
            index_offset,
            index: CirTreeState::Unloaded,
        });
    }

    Ok(zoom_headers)
}

/// Reads the chromosome tree node at the current position and everything below it.
pub(crate) fn read_chrom_tree_block<R: Read + Seek>(
    f: &mut R,
    endianness: Endianness,
    chroms: &mut Vec<ChromInfo>,
    key_size: u32,
) -> Result<(), BBIError> {
    let mut visited = HashSet::new();
    read_chrom_tree_node(f, endianness, chroms, key_size, 0, &mut visited)
}

fn read_chrom_tree_node<R: Read + Seek>(
    f: &mut R,
    endianness: Endianness,
    chroms: &mut Vec<ChromInfo>,
    key_size: u32,
    depth: usize,
    visited: &mut HashSet<u64>,
) -> Result<(), BBIError> {
    if depth > MAX_CHROM_TREE_DEPTH {
        return Err(BBIError::MalformedFile(
            "Chromosome tree is too deep".to_owned(),
        ));
    }
    let mut header_data = BytesMut::zeroed(NODE_HEADER_SIZE);
    f.read_exact(&mut header_data)?;

    let isleaf = header_data.get_u8();
    let _reserved = header_data.get_u8();
    let count = match endianness {
        Endianness::Big => header_data.get_u16(),
        Endianness::Little => header_data.get_u16_le(),
    };

    let key_size = key_size as usize;
    let mut bytes = BytesMut::zeroed((key_size + 8) * (count as usize));
    f.read_exact(&mut bytes)?;

    if isleaf == 1 {
        for _ in 0..count {
            let key = bytes.split_to(key_size);
            let name = std::str::from_utf8(&key)
                .map_err(|_| {
                    BBIError::MalformedFile("Invalid utf-8 chromosome name.".to_owned())
                })?
                .trim_end_matches(char::from(0))
                .to_owned();

            let (id, length) = match endianness {
                Endianness::Big => (bytes.get_u32(), bytes.get_u32()),
                Endianness::Little => (bytes.get_u32_le(), bytes.get_u32_le()),
            };
            chroms.push(ChromInfo { name, id, length });
        }
    } else {
        let mut children: Vec<u64> = Vec::with_capacity(count as usize);
        for _ in 0..count {
            bytes.advance(key_size);
            let child_offset = match endianness {
                Endianness::Big => bytes.get_u64(),
                Endianness::Little => bytes.get_u64_le(),
            };
            children.push(child_offset);
        }
        for child in children {
            if !visited.insert(child) {
                return Err(BBIError::MalformedFile(format!(
                    "Chromosome tree node at {} is referenced twice",
                    child
                )));
            }
            f.seek(SeekFrom::Start(child))?;
            read_chrom_tree_node(f, endianness, chroms, key_size as u32, depth + 1, visited)?;
        }
    }
    Ok(())
}

#[inline]
fn compare_position(chrom1: u32, chrom1_base: u32, chrom2: u32, chrom2_base: u32) -> i8 {
    if chrom1 < chrom2 {
        -1
    } else if chrom1 > chrom2 {
        1
    } else if chrom1_base < chrom2_base {
        -1
    } else if chrom1_base > chrom2_base {
        1
    } else {
        0
    }
}

/// Whether the half-open query `[chromq_start, chromq_end)` on `chromq` overlaps
/// the range spanning from `(chromb1, chromb1_start)` up to `(chromb2, chromb2_end)`.
#[inline]
fn overlaps(
    chromq: u32,
    chromq_start: u32,
    chromq_end: u32,
    chromb1: u32,
    chromb1_start: u32,
    chromb2: u32,
    chromb2_end: u32,
) -> bool {
    compare_position(chromq, chromq_start, chromb2, chromb2_end) < 0
        && compare_position(chromq, chromq_end, chromb1, chromb1_start) > 0
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct CirTreeNodeLeaf {
    start_chrom_ix: u32,
    start_base: u32,
    end_chrom_ix: u32,
    end_base: u32,
    data_offset: u64,
    data_size: u64,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct CirTreeNodeNonLeaf {
    start_chrom_ix: u32,
    start_base: u32,
    end_chrom_ix: u32,
    end_base: u32,
    node_offset: u64,
}

#[derive(Clone, Debug)]
pub(crate) enum CirTreeNode {
    Leaf(Vec<CirTreeNodeLeaf>),
    NonLeaf(Vec<CirTreeNodeNonLeaf>),
}

pub(crate) fn read_node<R: Read + Seek>(
    file: &mut R,
    node_offset: u64,
    endianness: Endianness,
) -> Result<CirTreeNode, BBIError> {
    file.seek(SeekFrom::Start(node_offset))?;

    let mut header_data = BytesMut::zeroed(NODE_HEADER_SIZE);
    file.read_exact(&mut header_data)?;

    let isleaf = header_data.get_u8();
    let _reserved = header_data.get_u8();
    let count = match endianness {
        Endianness::Big => header_data.get_u16(),
        Endianness::Little => header_data.get_u16_le(),
    } as usize;

    match isleaf {
        1 => {
            let mut bytes = vec![0u8; count * LEAF_ITEM_SIZE];
            file.read_exact(&mut bytes)?;
            let mut items = ByteOrdered::runtime(&bytes[..], endianness);
            let mut leaves = Vec::with_capacity(count);
            for _ in 0..count {
                leaves.push(CirTreeNodeLeaf {
                    start_chrom_ix: items.read_u32()?,
                    start_base: items.read_u32()?,
                    end_chrom_ix: items.read_u32()?,
                    end_base: items.read_u32()?,
                    data_offset: items.read_u64()?,
                    data_size: items.read_u64()?,
                });
            }
            Ok(CirTreeNode::Leaf(leaves))
        }
        0 => {
            let mut bytes = vec![0u8; count * NON_LEAF_ITEM_SIZE];
            file.read_exact(&mut bytes)?;
            let mut items = ByteOrdered::runtime(&bytes[..], endianness);
            let mut children = Vec::with_capacity(count);
            for _ in 0..count {
                children.push(CirTreeNodeNonLeaf {
                    start_chrom_ix: items.read_u32()?,
                    start_base: items.read_u32()?,
                    end_chrom_ix: items.read_u32()?,
                    end_base: items.read_u32()?,
                    node_offset: items.read_u64()?,
                });
            }
            Ok(CirTreeNode::NonLeaf(children))
        }
        _ => Err(BBIError::MalformedFile(format!(
            "Unexpected isleaf value in index node: {}",
            isleaf
        ))),
    }
}

fn nodes_overlapping(
    node: &CirTreeNode,
    chrom_ix: u32,
    start: u32,
    end: u32,
) -> (SmallVec<[u64; 4]>, SmallVec<[Block; 4]>) {
    match node {
        CirTreeNode::Leaf(leaves) => {
            let blocks = leaves
                .iter()
                .filter(|child| {
                    overlaps(
                        chrom_ix,
                        start,
                        end,
                        child.start_chrom_ix,
                        child.start_base,
                        child.end_chrom_ix,
                        child.end_base,
                    )
                })
                .map(|child| Block {
                    offset: child.data_offset,
                    size: child.data_size,
                })
                .collect();
            (smallvec![], blocks)
        }
        CirTreeNode::NonLeaf(children) => {
            let childblocks = children
                .iter()
                .filter(|child| {
                    overlaps(
                        chrom_ix,
                        start,
                        end,
                        child.start_chrom_ix,
                        child.start_base,
                        child.end_chrom_ix,
                        child.end_base,
                    )
                })
                .map(|child| child.node_offset)
                .collect();
            (childblocks, smallvec![])
        }
    }
}

pub(crate) struct CirTreeBlockSearchIter<'a, R: BBIFileRead> {
    remaining_childblocks: VecDeque<u64>,

    file: &'a mut R,
    endianness: Endianness,
    chrom_ix: u32,
    start: u32,
    end: u32,
}

impl<'a, R: BBIFileRead> Iterator for CirTreeBlockSearchIter<'a, R> {
    type Item = Result<SmallVec<[Block; 4]>, BBIError>;

    fn next(&mut self) -> Option<Self::Item> {
        let node_offset = self.remaining_childblocks.pop_front()?;

        let (new_childblocks, blocks) = match self.file.blocks_for_cir_tree_node(
            self.endianness,
            node_offset,
            self.chrom_ix,
            self.start,
            self.end,
        ) {
            Ok(d) => d,
            Err(e) => return Some(Err(e)),
        };

        // Depth first, so blocks come out in file order
        for child in new_childblocks.into_iter().rev() {
            self.remaining_childblocks.push_front(child);
        }

        Some(Ok(blocks))
    }
}

fn read_block_data<R: BBIFileRead>(
    info: &BBIFileInfo,
    read: &mut R,
    block: &Block,
) -> Result<Vec<u8>, BBIError> {
    let raw_data = read.fetch(block.offset, block.size as usize)?;
    let uncompress_buf_size = info.header.uncompress_buf_size as usize;
    if uncompress_buf_size == 0 {
        return Ok(raw_data);
    }

    let mut decompressor = Decompressor::new();
    let mut outbuf = vec![0; uncompress_buf_size];
    let decompressed = decompressor
        .zlib_decompress(&raw_data, &mut outbuf)
        .map_err(|e| {
            BBIError::MalformedFile(format!(
                "Unable to decompress block at {} ({:?})",
                block.offset, e
            ))
        })?;
    outbuf.truncate(decompressed);
    Ok(outbuf)
}

/// Parses the zoom records of one block that overlap `[start, end)` on `chrom`.
pub(crate) fn get_zoom_block_values(
    endianness: Endianness,
    data: &[u8],
    chrom: u32,
    start: u32,
    end: u32,
) -> Result<Vec<ZoomRecord>, BBIError> {
    if data.len() % ZOOM_RECORD_SIZE != 0 {
        return Err(BBIError::MalformedFile(format!(
            "Zoom block length ({}) is not a multiple of the record size",
            data.len()
        )));
    }
    let itemcount = data.len() / ZOOM_RECORD_SIZE;
    let mut records = Vec::with_capacity(itemcount);
    let mut bytes = ByteOrdered::runtime(data, endianness);
    for _ in 0..itemcount {
        let chrom_id = bytes.read_u32()?;
        let chrom_start = bytes.read_u32()?;
        let chrom_end = bytes.read_u32()?;
        let bases_covered = u64::from(bytes.read_u32()?);
        let min_val = f64::from(bytes.read_f32()?);
        let max_val = f64::from(bytes.read_f32()?);
        let sum = f64::from(bytes.read_f32()?);
        let sum_squares = f64::from(bytes.read_f32()?);
        if chrom_id == chrom && chrom_end > start && chrom_start < end {
            records.push(ZoomRecord {
                chrom: chrom_id,
                start: chrom_start,
                end: chrom_end,
                summary: Summary {
                    total_items: 0,
                    bases_covered,
                    min_val,
                    max_val,
                    sum,
                    sum_squares,
                },
            });
        }
    }
    Ok(records)
}

/// All zoom records of a zoom level overlapping `[start, end)` on `chrom_ix`.
pub(crate) fn zoom_records<B: BBIRead>(
    bbifile: &mut B,
    reduction_level: u32,
    chrom_ix: u32,
    start: u32,
    end: u32,
) -> Result<Vec<ZoomRecord>, BBIError> {
    let root_offset = bbifile.zoom_cir_tree(reduction_level)?;
    let (reader, info) = bbifile.reader_and_info()?;
    let endianness = info.header.endianness;
    let blocks = search_cir_tree(endianness, reader, root_offset, chrom_ix, start, end)?;

    let mut records = vec![];
    for block in blocks {
        let data = reader.get_block_data(info, &block)?;
        records.extend(get_zoom_block_values(
            endianness, &data, chrom_ix, start, end,
        )?);
    }
    Ok(records)
}
