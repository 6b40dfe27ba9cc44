//! Tar-split metadata generation.
//!
//! This is the inverse of [`TarSplitReader`](crate::tar_split::TarSplitReader):
//! [`disassemble`] walks a tarball, hands every entry's content to a callback
//! and records everything else (headers, padding, trailer) as segments so the
//! tarball can be reassembled bit for bit.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::rc::Rc;

use base64::prelude::*;
use serde::Serialize;

use crate::error::{ChunkedError, Result};
use crate::tar_split::CRC64_ISO;
use crate::toc::FileMetadata;

/// A tar-split entry for serialization.
#[derive(Debug, Serialize)]
struct TarSplitEntry<'a> {
    /// Entry type: 1 for File, 2 for Segment.
    #[serde(rename = "type")]
    type_id: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name_raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    position: u64,
}

/// Writer for generating tar-split NDJSON.
#[derive(Debug)]
pub struct TarSplitWriter<W> {
    out: W,
    position: u64,
}

impl<W: Write> TarSplitWriter<W> {
    /// Write tar-split entries to `out`.
    pub fn new(out: W) -> Self {
        Self { out, position: 0 }
    }

    fn write_entry(&mut self, entry: &TarSplitEntry<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.out, entry)?;
        self.out.write_all(b"\n")?;
        self.position += 1;
        Ok(())
    }

    /// Add a segment entry (raw tar bytes). Empty segments are dropped.
    pub fn add_segment(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.write_entry(&TarSplitEntry {
            type_id: 2,
            name: None,
            name_raw: None,
            size: None,
            payload: Some(BASE64_STANDARD.encode(bytes)),
            position: self.position,
        })
    }

    /// Add a file entry. Names that are not UTF-8 are stored base64-encoded.
    pub fn add_file_entry(&mut self, name: &[u8], size: u64, crc64: Option<u64>) -> Result<()> {
        let (name, name_raw) = match std::str::from_utf8(name) {
            Ok(s) => (Some(s), None),
            Err(_) => (None, Some(BASE64_STANDARD.encode(name))),
        };
        self.write_entry(&TarSplitEntry {
            type_id: 1,
            name,
            name_raw,
            size: Some(size),
            payload: crc64.map(|c| BASE64_STANDARD.encode(c.to_be_bytes())),
            position: self.position,
        })
    }

    /// Number of entries written so far.
    pub fn entry_count(&self) -> u64 {
        self.position
    }

    /// Flush and return the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Raw bytes consumed by the tar parser that are not file content.
#[derive(Debug, Default)]
struct Tape {
    data: Vec<u8>,
    paused: bool,
}

/// Reader recording what passes through it onto a shared [`Tape`].
pub struct TapeReader<R> {
    inner: R,
    tape: Rc<RefCell<Tape>>,
}

impl<R: Read> Read for TapeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        let mut tape = self.tape.borrow_mut();
        if !tape.paused {
            tape.data.extend_from_slice(&buf[..n]);
        }
        Ok(n)
    }
}

/// Reader computing the CRC64-ISO of the bytes passing through it.
struct CrcReader<R> {
    inner: R,
    digest: crc::Digest<'static, u64>,
}

impl<R: Read> Read for CrcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}

/// A piece of a tarball seen by [`disassemble`].
pub enum TarEvent<'a> {
    /// Raw tar bytes that are not file content (headers, padding, trailer).
    Segment(&'a [u8]),
    /// An entry with a reader over its content.
    Entry(FileMetadata, &'a mut dyn Read),
}

/// Split a tarball into tar-split metadata and file contents.
///
/// `visit` sees the tarball in order: every non-empty segment, and every
/// entry (PAX global headers are kept inside the segments) with a reader
/// over its content. Content the callback leaves unread is drained. Returns
/// the number of bytes of the input tarball.
pub fn disassemble<R: Read, W: Write>(
    input: R,
    writer: &mut TarSplitWriter<W>,
    mut visit: impl FnMut(TarEvent<'_>) -> Result<()>,
) -> Result<u64> {
    let tape = Rc::new(RefCell::new(Tape::default()));
    let mut archive = tar::Archive::new(TapeReader {
        inner: input,
        tape: Rc::clone(&tape),
    });
    let mut total = 0u64;
    let tar_err = |e: io::Error| ChunkedError::Format(format!("reading tar stream: {e}"));

    let flush = |writer: &mut TarSplitWriter<W>,
                     visit: &mut dyn FnMut(TarEvent<'_>) -> Result<()>|
     -> Result<u64> {
        let segment = std::mem::take(&mut tape.borrow_mut().data);
        if segment.is_empty() {
            return Ok(0);
        }
        writer.add_segment(&segment)?;
        visit(TarEvent::Segment(&segment))?;
        Ok(segment.len() as u64)
    };

    for entry in archive.entries().map_err(tar_err)? {
        let mut entry = entry.map_err(tar_err)?;
        let name = entry.path_bytes().into_owned();

        if entry.header().entry_type() == tar::EntryType::XGlobalHeader {
            // Stays on the tape; the file entry carries no content.
            io::copy(&mut entry, &mut io::sink()).map_err(tar_err)?;
            total += flush(writer, &mut visit)?;
            writer.add_file_entry(&name, 0, None)?;
            continue;
        }

        total += flush(writer, &mut visit)?;
        let size = entry.size();
        let md = FileMetadata::from_tar_entry(&mut entry)?;

        tape.borrow_mut().paused = true;
        let mut content = CrcReader {
            inner: &mut entry,
            digest: CRC64_ISO.digest(),
        };
        let visited = visit(TarEvent::Entry(md, &mut content));
        let drained = visited.and_then(|()| {
            io::copy(&mut content, &mut io::sink())
                .map(drop)
                .map_err(tar_err)
        });
        tape.borrow_mut().paused = false;
        drained?;
        let crc64 = content.digest.finalize();

        total += size;
        writer.add_file_entry(&name, size, (size > 0).then_some(crc64))?;
    }

    let mut rest = archive.into_inner();
    io::copy(&mut rest, &mut io::sink())?;
    total += flush(writer, &mut visit)?;
    Ok(total)
}

/// Produce the (uncompressed) tar-split NDJSON for a tarball.
pub fn tar_split_from_tar<R: Read>(input: R) -> Result<Vec<u8>> {
    let mut writer = TarSplitWriter::new(Vec::new());
    disassemble(input, &mut writer, |_| Ok(()))?;
    writer.finish()
}
