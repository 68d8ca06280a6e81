use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// A helper trait that for things that implement `Read`, `Seek`, and `Send`.
///
/// This is the whole of what a bbi reader needs from its byte source, local or remote.
pub trait SeekableRead: Seek + Read + Send {}
impl<T> SeekableRead for T where T: Seek + Read + Send {}

/// Indicates something that can be *reopened*. Importantly, reopening should be independent
/// with respect to seeks and reads from the original object.
pub trait Reopen: Sized {
    fn reopen(&self) -> io::Result<Self>;
}

/// A `File` that remembers where it came from, so independent handles can be opened.
pub struct ReopenableFile {
    pub path: PathBuf,
    pub file: File,
}

impl ReopenableFile {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(ReopenableFile { path, file })
    }
}

impl Reopen for ReopenableFile {
    fn reopen(&self) -> io::Result<Self> {
        Ok(ReopenableFile {
            path: self.path.clone(),
            file: File::open(&self.path)?,
        })
    }
}

impl Seek for ReopenableFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl Read for ReopenableFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}
