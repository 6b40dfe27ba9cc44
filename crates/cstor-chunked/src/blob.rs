//! Range access to compressed layer blobs.
//!
//! A [`BlobChunkAccessor`] returns one readable stream per requested byte
//! range, in request order. Registries implement it with HTTP range requests;
//! [`SeekableFile`] implements it over a local file and [`MemoryBlob`] over
//! an in-memory buffer.
//!
//! Consumers must fully read (or drop) each stream before pulling the next
//! one from the iterator, which bounds memory to one stream at a time.

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;

use crate::error::{ChunkedError, Result};
use crate::readatreader::ReadAtReader;

/// HTTP status reported for a range that lies outside the blob.
const RANGE_NOT_SATISFIABLE: u16 = 416;

/// One byte range of a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSourceChunk {
    /// Start of the range.
    pub offset: u64,
    /// Number of bytes.
    pub length: u64,
}

impl ImageSourceChunk {
    /// Create a new range.
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }
}

/// A stream carrying the bytes of one requested range.
pub type BlobStream = Box<dyn Read + Send>;

/// Streams for a batch of ranges, in request order.
pub type BlobStreams<'a> = Box<dyn Iterator<Item = Result<BlobStream>> + 'a>;

/// Source of byte ranges of a single blob.
pub trait BlobChunkAccessor {
    /// Request `chunks` in one batch.
    ///
    /// An error returned directly means the request as a whole failed;
    /// a transport that rejects range requests reports
    /// [`ChunkedError::BadRangeRequest`]. Per-range failures are delivered as
    /// `Err` items of the iterator.
    fn get_blob_at(&self, chunks: &[ImageSourceChunk]) -> Result<BlobStreams<'_>>;
}

/// Request `chunks` from `accessor` and enforce the one-stream-per-range
/// contract.
///
/// At most `chunks.len()` streams are yielded. If the accessor produces more,
/// the extras are dropped and a single error is reported in their place; if it
/// produces fewer, the shortfall is reported as an error.
pub fn get_blob_at<'a, A: BlobChunkAccessor + ?Sized>(
    accessor: &'a A,
    chunks: &[ImageSourceChunk],
) -> Result<BlobStreams<'a>> {
    let inner = accessor.get_blob_at(chunks)?;
    Ok(Box::new(Bounded {
        inner,
        expected: chunks.len(),
        seen: 0,
        done: false,
    }))
}

struct Bounded<'a> {
    inner: BlobStreams<'a>,
    expected: usize,
    seen: usize,
    done: bool,
}

impl Iterator for Bounded<'_> {
    type Item = Result<BlobStream>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.inner.next() {
            Some(item) if self.seen < self.expected => {
                self.seen += 1;
                Some(item)
            }
            Some(_) => {
                self.done = true;
                self.inner.by_ref().for_each(drop);
                Some(Err(ChunkedError::Format(format!(
                    "too many streams returned, got more than {}",
                    self.expected
                ))))
            }
            None if self.seen < self.expected => {
                self.done = true;
                Some(Err(ChunkedError::Format(format!(
                    "blob accessor returned {} streams for {} ranges",
                    self.seen, self.expected
                ))))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

/// Drain every remaining stream, returning the first error seen.
pub fn ensure_all_blobs_done(streams: BlobStreams<'_>) -> Result<()> {
    let mut first_err = None;
    for item in streams {
        match item {
            Ok(mut stream) => {
                if let Err(e) = std::io::copy(&mut stream, &mut std::io::sink())
                    && first_err.is_none()
                {
                    first_err = Some(ChunkedError::Io(e));
                }
            }
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Take the next stream of a batch, failing if the batch ended early.
pub(crate) fn next_stream(streams: &mut BlobStreams<'_>, what: &str) -> Result<BlobStream> {
    streams
        .next()
        .ok_or_else(|| ChunkedError::Format(format!("missing stream for {what}")))?
}

/// Local blob file with random access.
#[derive(Debug, Clone)]
pub struct SeekableFile {
    file: Arc<File>,
    size: u64,
}

impl SeekableFile {
    /// Wrap an open file.
    pub fn new(file: File) -> Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            size,
        })
    }

    /// Open a blob by path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(File::open(path)?)
    }

    /// Total size of the blob.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl BlobChunkAccessor for SeekableFile {
    fn get_blob_at(&self, chunks: &[ImageSourceChunk]) -> Result<BlobStreams<'_>> {
        check_ranges(chunks, self.size)?;
        let file = Arc::clone(&self.file);
        let chunks = chunks.to_vec();
        Ok(Box::new(chunks.into_iter().map(move |c| {
            Ok(Box::new(ReadAtReader::new(Arc::clone(&file), c.offset, c.length)) as BlobStream)
        })))
    }
}

/// Blob held in memory.
#[derive(Debug, Clone)]
pub struct MemoryBlob(Arc<[u8]>);

impl MemoryBlob {
    /// Wrap a buffer.
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self(data.into())
    }

    /// Total size of the blob.
    pub fn size(&self) -> u64 {
        self.0.len() as u64
    }
}

impl BlobChunkAccessor for MemoryBlob {
    fn get_blob_at(&self, chunks: &[ImageSourceChunk]) -> Result<BlobStreams<'_>> {
        check_ranges(chunks, self.size())?;
        let chunks = chunks.to_vec();
        Ok(Box::new(chunks.into_iter().map(move |c| {
            let start = c.offset as usize;
            let end = start + c.length as usize;
            Ok(Box::new(Cursor::new(self.0[start..end].to_vec())) as BlobStream)
        })))
    }
}

fn check_ranges(chunks: &[ImageSourceChunk], size: u64) -> Result<()> {
    for c in chunks {
        match c.offset.checked_add(c.length) {
            Some(end) if end <= size => {}
            _ => {
                return Err(ChunkedError::BadRangeRequest {
                    status: RANGE_NOT_SATISFIABLE,
                });
            }
        }
    }
    Ok(())
}
