use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "read")]
pub(crate) mod bbiread;
#[cfg(feature = "write")]
pub(crate) mod bbiwrite;
#[cfg(feature = "read")]
pub(crate) mod bigbedread;
#[cfg(feature = "write")]
pub(crate) mod bigbedwrite;
#[cfg(feature = "read")]
pub(crate) mod bigwigread;
#[cfg(feature = "write")]
pub(crate) mod bigwigwrite;

pub(crate) const BIGWIG_MAGIC: u32 = 0x888F_FC26;
pub(crate) const BIGBED_MAGIC: u32 = 0x8789_F2EB;

pub(crate) const CIR_TREE_MAGIC: u32 = 0x2468_ACE0;
pub(crate) const CHROM_TREE_MAGIC: u32 = 0x78CA_8C91;

/// The bbi version written by this crate. Files with versions up to this are readable.
pub const BBI_VERSION: u16 = 4;

/// Whether the header of a cir tree index has been read yet.
///
/// Indices are only touched the first time a query needs them. After that, the
/// location of the root node is kept for the lifetime of the handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum CirTreeState {
    Unloaded,
    Loaded { root_offset: u64 },
}

/// Info on a specific zoom level in a bbi file
#[derive(Copy, Clone, Debug)]
pub struct ZoomHeader {
    pub reduction_level: u32,
    pub(crate) data_offset: u64,
    pub(crate) index_offset: u64,
    pub(crate) index: CirTreeState,
}

/// A single zoom item
#[derive(Copy, Clone, Debug)]
pub struct ZoomRecord {
    pub(crate) chrom: u32,
    pub start: u32,
    pub end: u32,
    pub summary: Summary,
}

/// A summary of a section of data (may be an entire file)
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct Summary {
    pub total_items: u64,
    pub bases_covered: u64,
    pub min_val: f64,
    pub max_val: f64,
    pub sum: f64,
    pub sum_squares: f64,
}

impl Summary {
    pub(crate) fn empty() -> Self {
        Summary {
            total_items: 0,
            bases_covered: 0,
            min_val: f64::MAX,
            max_val: f64::MIN,
            sum: 0.0,
            sum_squares: 0.0,
        }
    }

    /// Adds `bases` bases of `value`.
    pub(crate) fn add(&mut self, bases: u32, value: f64) {
        let bases_f = f64::from(bases);
        self.total_items += 1;
        self.bases_covered += u64::from(bases);
        self.min_val = self.min_val.min(value);
        self.max_val = self.max_val.max(value);
        self.sum += bases_f * value;
        self.sum_squares += bases_f * value * value;
    }

    /// Merges another (already aggregated) summary into this one.
    pub(crate) fn merge(&mut self, other: &Summary) {
        if other.bases_covered == 0 {
            return;
        }
        self.total_items += other.total_items;
        self.bases_covered += other.bases_covered;
        self.min_val = self.min_val.min(other.min_val);
        self.max_val = self.max_val.max(other.max_val);
        self.sum += other.sum;
        self.sum_squares += other.sum_squares;
    }
}

/// Represents a single value in a bigWig file
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub start: u32,
    pub end: u32,
    pub value: f32,
}

/// Represents a single entry in a bigBed file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BedEntry {
    pub start: u32,
    pub end: u32,
    pub rest: String,
}

/// The type of bbi file
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BBIFile {
    BigWig,
    BigBed,
}

/// Errors from reading, querying or writing a bbi file
#[derive(Error, Debug)]
pub enum BBIError {
    #[error("The chromosome ({}) is not in the chromosome list.", .0)]
    UnknownChromosome(String),
    #[error("Entries out of order: {}", .0)]
    OutOfOrderEntry(String),
    #[error("The handle has already been closed.")]
    ClosedHandle,
    #[error("The file was invalid: {}", .0)]
    MalformedFile(String),
    #[error("Unsupported bbi version: {} (at most {} is supported)", .0, BBI_VERSION)]
    UnsupportedFormatVersion(u16),
    #[error("Invalid query range {}-{} (chromosome length {})", start, end, length)]
    InvalidQueryRange { start: u32, end: u32, length: u32 },
    #[error("The zoom level ({}) was not found.", .0)]
    ReductionLevelNotFound(u32),
    #[error("Invalid entry: {}", .0)]
    InvalidEntry(String),
    #[error("Error occurred: {}", .0)]
    IoError(io::Error),
}

impl From<io::Error> for BBIError {
    fn from(e: io::Error) -> Self {
        // Running off the end of a structure means the file is truncated.
        match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                BBIError::MalformedFile(format!("Unexpected end of file ({})", e))
            }
            _ => BBIError::IoError(e),
        }
    }
}

#[cfg(feature = "read")]
pub use bbiread::*;
#[cfg(feature = "write")]
pub use bbiwrite::{BBIWriteOptions, DEFAULT_BLOCK_SIZE, DEFAULT_ITEMS_PER_SLOT, MAX_ZOOM_LEVELS};
#[cfg(feature = "read")]
pub use bigbedread::*;
#[cfg(feature = "write")]
pub use bigbedwrite::*;
#[cfg(feature = "read")]
pub use bigwigread::*;
#[cfg(feature = "write")]
pub use bigwigwrite::*;
