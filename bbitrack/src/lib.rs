/*!
bbitrack provides random-access storage and retrieval of genomic signal tracks
(bigWig) and feature annotations (bigBed).

The file format specification for bigWig and bigBed files is defined in this paper: <https://doi.org/10.1093/bioinformatics/btq351>

## Reading

The entrypoints to reading are [`BigWigRead::open`] and [`BigBedRead::open`].
These take any type that implements both [`Read`][std::io::Read] and
[`Seek`][std::io::Seek], which is the only thing this crate needs from a transport.
There are also [`BigWigRead::open_file`] and [`BigBedRead::open_file`], which take a
path and open a [`ReopenableFile`][crate::utils::file::reopen::ReopenableFile].

A [`BigWigRead`] answers three kinds of questions about a range of a chromosome:
- [`BigWigRead::intervals`]: the stored `(start, end, value)` triples
- [`BigWigRead::values`]: one value per base, with `NaN` for missing bases
- [`BigWigRead::stats`]: binned statistics, using zoom levels when they can answer exactly

Indices are loaded lazily on first use, and all resources are released on
[`BigWigRead::close`] (or drop).

## Writing

A [`BigWigWrite`] is created from a path and the full set of chromosomes
([`BigWigWrite::create_file`]). Entries are then added in any of three shapes
(see [`Entries`]), chromosome by chromosome, in increasing position. Nothing
is written to the target path until [`BigWigWrite::close`], which builds the
data blocks, zoom levels and indices in one pass and moves the finished file
into place.

[`BigBedWrite`] works the same way for [`BedEntry`] records.
*/

mod bbi;
pub mod utils;

pub use bbi::*;
