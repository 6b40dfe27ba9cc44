use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::sync::Arc;

/// A `Read` adapter over one byte range of a shared file, using positional
/// reads (pread/read_at).
///
/// Several readers can share the same descriptor without affecting its file
/// position or each other; each tracks its own offset and stops at the end of
/// its range.
#[derive(Debug)]
pub(crate) struct ReadAtReader {
    file: Arc<File>,
    offset: u64,
    end: u64,
}

impl ReadAtReader {
    /// Create a reader for `length` bytes of `file` starting at `offset`.
    pub(crate) fn new(file: Arc<File>, offset: u64, length: u64) -> Self {
        Self {
            file,
            offset,
            end: offset.saturating_add(length),
        }
    }
}

impl Read for ReadAtReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.end.saturating_sub(self.offset);
        if remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = self.file.read_at(&mut buf[..want], self.offset)?;
        self.offset += n as u64;
        Ok(n)
    }
}
