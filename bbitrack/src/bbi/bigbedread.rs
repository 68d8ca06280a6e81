use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use byteordered::{ByteOrdered, Endianness};

use crate::bbi::{BBIError, BBIFile, BedEntry};
use crate::bbiread::{
    read_info, search_cir_tree, BBIFileInfo, BBIFileRead, BBIRead, CachedBBIFileRead,
};
use crate::internal::BBIReadInternal;
use crate::utils::reopen::{Reopen, ReopenableFile, SeekableRead};

/// The struct used to read a bigBed file
pub struct BigBedRead<R> {
    pub(super) info: BBIFileInfo,
    pub(super) read: Option<R>,
}

impl<R: Reopen> Reopen for BigBedRead<R> {
    fn reopen(&self) -> io::Result<Self> {
        let read = self
            .read
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, BBIError::ClosedHandle))?;
        Ok(BigBedRead {
            info: self.info.clone(),
            read: Some(read.reopen()?),
        })
    }
}

impl<R: BBIFileRead> BBIRead for BigBedRead<R> {
    fn info(&self) -> &BBIFileInfo {
        &self.info
    }

    fn is_closed(&self) -> bool {
        self.read.is_none()
    }
}

impl<R: BBIFileRead> BBIReadInternal for BigBedRead<R> {
    type Read = R;

    fn reader_and_info(&mut self) -> Result<(&mut Self::Read, &mut BBIFileInfo), BBIError> {
        match self.read.as_mut() {
            Some(read) => Ok((read, &mut self.info)),
            None => Err(BBIError::ClosedHandle),
        }
    }
}

impl BigBedRead<ReopenableFile> {
    /// Opens a new `BigBedRead` from a given path as a file.
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self, BBIError> {
        BigBedRead::open(ReopenableFile::open(path)?)
    }
}

impl<R> BigBedRead<R>
where
    R: SeekableRead,
{
    /// Converts this `BigBedRead` to where the `BBIFileRead` caches index
    /// access and block data
    pub fn cached(self) -> Result<BigBedRead<CachedBBIFileRead<R>>, BBIError> {
        let read = self.read.ok_or(BBIError::ClosedHandle)?;
        Ok(BigBedRead {
            read: Some(CachedBBIFileRead::new(read)),
            info: self.info,
        })
    }
}

impl<R: BBIFileRead> BigBedRead<R> {
    /// Opens a new `BigBedRead` for a given type that implements both `Read` and `Seek`
    pub fn open(mut read: R) -> Result<Self, BBIError> {
        let info = read_info(&mut read)?;
        match info.filetype {
            BBIFile::BigBed => {}
            BBIFile::BigWig => {
                return Err(BBIError::MalformedFile("Not a bigBed file.".to_owned()))
            }
        }

        Ok(BigBedRead {
            info,
            read: Some(read),
        })
    }

    /// Does *not* check if the passed `R` matches the provided info (including if the `R` is a bigBed at all!)
    pub fn with_info(info: BBIFileInfo, read: R) -> Self {
        BigBedRead {
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

    /// The autoSql schema describing the extra columns, or an empty string if
    /// the file has none.
    pub fn autosql(&mut self) -> Result<String, BBIError> {
        let (reader, info) = self.reader_and_info()?;
        let auto_sql_offset = info.header.auto_sql_offset;
        if auto_sql_offset == 0 {
            return Ok(String::new());
        }
        let mut reader = BufReader::new(reader.raw_reader());
        reader.seek(SeekFrom::Start(auto_sql_offset))?;
        let mut buffer = Vec::new();
        reader.read_until(b'\0', &mut buffer)?;
        if buffer.last() == Some(&b'\0') {
            buffer.pop();
        }
        String::from_utf8(buffer)
            .map_err(|_| BBIError::MalformedFile("Invalid autosql: not UTF-8".to_owned()))
    }

    /// All entries overlapping `[start, end)` on `chrom_name`. Missing bounds
    /// default to the whole chromosome.
    ///
    /// Returns `None` if there are no entries in the range.
    pub fn entries(
        &mut self,
        chrom_name: &str,
        start: Option<u32>,
        end: Option<u32>,
    ) -> Result<Option<Vec<BedEntry>>, BBIError> {
        self.reader_and_info()?;
        let (chrom, start, end) = self.info.resolve_range(chrom_name, start, end)?;

        let root_offset = self.full_data_cir_tree()?;
        let (reader, info) = self.reader_and_info()?;
        let endianness = info.header.endianness;
        let blocks = search_cir_tree(endianness, reader, root_offset, chrom, start, end)?;

        let mut entries = vec![];
        for block in blocks {
            let data = reader.get_block_data(info, &block)?;
            get_block_entries(endianness, &data, chrom, start, end, &mut entries)?;
        }
        Ok(if entries.is_empty() {
            None
        } else {
            Some(entries)
        })
    }
}

fn get_block_entries(
    endianness: Endianness,
    mut data: &[u8],
    chrom: u32,
    start: u32,
    end: u32,
    entries: &mut Vec<BedEntry>,
) -> Result<(), BBIError> {
    while !data.is_empty() {
        let mut fields = ByteOrdered::runtime(&mut data, endianness);
        let chrom_id = fields.read_u32()?;
        let chrom_start = fields.read_u32()?;
        let chrom_end = fields.read_u32()?;

        let rest_len = data
            .iter()
            .position(|c| *c == b'\0')
            .ok_or_else(|| BBIError::MalformedFile("Unterminated bigBed entry.".to_owned()))?;
        let rest = std::str::from_utf8(&data[..rest_len])
            .map_err(|_| BBIError::MalformedFile("Invalid bigBed entry: not UTF-8".to_owned()))?
            .to_owned();
        data = &data[rest_len + 1..];

        if chrom_id == chrom && chrom_end > start && chrom_start < end {
            entries.push(BedEntry {
                start: chrom_start,
                end: chrom_end,
                rest,
            });
        }
    }
    Ok(())
}
