//! Converting a plain tar stream into a zstd:chunked blob.
//!
//! Every piece of the tarball becomes its own zstd frame: header segments as
//! they come, and the content of regular files split into chunks of at most
//! [`CompressorOptions::chunk_size`] bytes. A generic zstd decoder therefore
//! still sees the original tarball, while the TOC records where each file's
//! frames live so they can be fetched individually. The tar-split and the TOC
//! follow as skippable frames, then the footer.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use crate::digest::{Algorithm, Digest, Digester};
use crate::error::Result;
use crate::footer::{TarSplitData, write_zstd_chunked_manifest};
use crate::tar_split_writer::{TarEvent, TarSplitWriter, disassemble};
use crate::toc::{ChunkType, EntryType, FileMetadata};

/// Default zstd compression level.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Default upper bound for the size of a file chunk.
pub const DEFAULT_CHUNK_SIZE: u64 = 1 << 20;

/// Knobs for [`compress_tar`].
#[derive(Debug, Clone)]
pub struct CompressorOptions {
    /// zstd compression level.
    pub level: i32,
    /// Upper bound for the uncompressed size of a file chunk.
    pub chunk_size: u64,
}

impl Default for CompressorOptions {
    fn default() -> Self {
        Self {
            level: DEFAULT_COMPRESSION_LEVEL,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Result of a conversion.
#[derive(Debug, Clone)]
pub struct ConvertedLayer {
    /// Layer annotations locating the TOC and tar-split.
    pub annotations: BTreeMap<String, String>,
    /// Digest of the compressed TOC, needed to authenticate partial pulls.
    pub toc_digest: Digest,
    /// Digest of the uncompressed tarball.
    pub diff_id: Digest,
    /// Size of the uncompressed tarball.
    pub uncompressed_size: u64,
    /// Size of the blob written.
    pub compressed_size: u64,
}

struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct DigestingReader<R> {
    inner: R,
    digester: Digester,
}

impl<R: Read> Read for DigestingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }
}

impl<W: Write> CountingWriter<W> {
    /// Write `data` as one zstd frame, returning its extent.
    fn frame(&mut self, data: &[u8], level: i32) -> Result<(u64, u64)> {
        let start = self.count;
        let compressed = zstd::encode_all(data, level)?;
        self.write_all(&compressed)?;
        Ok((start, self.count))
    }
}

/// Split `content` into frames and fill in the chunk fields of `md`.
///
/// Returns the entries to append to the TOC: `md` itself, then one chunk
/// entry for every chunk after the first.
fn write_file_chunks<W: Write>(
    out: &mut CountingWriter<W>,
    mut md: FileMetadata,
    content: &mut dyn Read,
    opts: &CompressorOptions,
) -> Result<Vec<FileMetadata>> {
    let mut file_digest = Algorithm::Sha256.digester();
    let mut chunks: Vec<FileMetadata> = Vec::new();
    let mut buf = Vec::new();
    let mut chunk_offset = 0u64;
    loop {
        buf.clear();
        (&mut *content).take(opts.chunk_size).read_to_end(&mut buf)?;
        if buf.is_empty() {
            break;
        }
        file_digest.update(&buf);
        let (offset, end_offset) = out.frame(&buf, opts.level)?;
        let chunk_type = if buf.iter().all(|&b| b == 0) {
            ChunkType::Zeros
        } else {
            ChunkType::Data
        };
        chunks.push(FileMetadata {
            entry_type: EntryType::Chunk,
            name: md.name.clone(),
            offset,
            end_offset,
            chunk_size: buf.len() as u64,
            chunk_offset,
            chunk_digest: Digest::sha256(&buf).to_string(),
            chunk_type,
            ..Default::default()
        });
        chunk_offset += buf.len() as u64;
    }

    md.digest = file_digest.finish().to_string();
    let mut rest = chunks.into_iter();
    if let Some(first) = rest.next() {
        md.offset = first.offset;
        md.end_offset = first.end_offset;
        md.chunk_size = first.chunk_size;
        md.chunk_digest = first.chunk_digest;
        md.chunk_type = first.chunk_type;
    }
    let mut entries = vec![md];
    entries.extend(rest);
    Ok(entries)
}

/// Convert the tarball `input` into a zstd:chunked blob written to `out`.
pub fn compress_tar<R: Read, W: Write>(
    input: R,
    out: W,
    opts: &CompressorOptions,
) -> Result<ConvertedLayer> {
    let mut input = DigestingReader {
        inner: input,
        digester: Algorithm::Sha256.digester(),
    };
    let mut out = CountingWriter {
        inner: out,
        count: 0,
    };
    let mut tar_split = TarSplitWriter::new(Vec::new());
    let mut entries: Vec<FileMetadata> = Vec::new();

    let uncompressed_size = disassemble(&mut input, &mut tar_split, |ev| {
        match ev {
            TarEvent::Segment(bytes) => {
                out.frame(bytes, opts.level)?;
            }
            TarEvent::Entry(md, content) if md.entry_type == EntryType::Reg && md.size > 0 => {
                entries.extend(write_file_chunks(&mut out, md, content, opts)?);
            }
            TarEvent::Entry(md, _) => entries.push(md),
        }
        Ok(())
    })?;
    let diff_id = input.digester.finish();
    tracing::debug!(
        "converted {} TOC entries, {} tar-split entries",
        entries.len(),
        tar_split.entry_count()
    );

    let ndjson = tar_split.finish()?;
    let data = zstd::encode_all(&ndjson[..], opts.level)?;
    let tar_split = TarSplitData {
        digest: Digest::sha256(&data),
        data,
        uncompressed_size: ndjson.len() as u64,
    };

    let mut annotations = BTreeMap::new();
    let offset = out.count;
    let toc_digest = write_zstd_chunked_manifest(
        &mut out,
        &mut annotations,
        offset,
        &tar_split,
        entries,
        opts.level,
    )?;
    out.flush()?;

    Ok(ConvertedLayer {
        annotations,
        toc_digest,
        diff_id,
        uncompressed_size,
        compressed_size: out.count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlob;
    use crate::extract::{ExtractionOptions, extract_blob};
    use crate::manifest::{LayerFormat, ManifestOptions, read_manifest};
    use cap_std::ambient_authority;
    use cap_std::fs::Dir;

    fn header(entry_type: tar::EntryType, size: u64, mode: u32) -> tar::Header {
        let mut h = tar::Header::new_gnu();
        h.set_entry_type(entry_type);
        h.set_size(size);
        h.set_mode(mode);
        h.set_uid(rustix::process::getuid().as_raw().into());
        h.set_gid(rustix::process::getgid().as_raw().into());
        h.set_mtime(1_700_000_000);
        h
    }

    fn sample_tar(sparse: &[u8]) -> Vec<u8> {
        let mut b = tar::Builder::new(Vec::new());
        let mut h = header(tar::EntryType::Directory, 0, 0o755);
        b.append_data(&mut h, "usr/", io::empty()).unwrap();
        let mut h = header(tar::EntryType::Regular, 6, 0o644);
        b.append_data(&mut h, "usr/hello", &b"hello\n"[..]).unwrap();
        let mut h = header(tar::EntryType::Regular, sparse.len() as u64, 0o600);
        b.append_data(&mut h, "usr/sparse", sparse).unwrap();
        let mut h = header(tar::EntryType::Regular, 0, 0o644);
        b.append_data(&mut h, "usr/empty", io::empty()).unwrap();
        let mut h = header(tar::EntryType::Symlink, 0, 0o777);
        b.append_link(&mut h, "usr/hello.lnk", "hello").unwrap();
        let mut h = header(tar::EntryType::Link, 0, 0o644);
        b.append_link(&mut h, "usr/hello.hard", "usr/hello").unwrap();
        b.into_inner().unwrap()
    }

    fn sparse_content() -> Vec<u8> {
        let mut v = vec![b'x'; 4096];
        v.extend(std::iter::repeat_n(0u8, 8192));
        v.extend_from_slice(b"tail");
        v
    }

    fn opts() -> CompressorOptions {
        CompressorOptions {
            level: 1,
            chunk_size: 4096,
        }
    }

    #[test]
    fn test_blob_decompresses_to_tar() {
        let tar = sample_tar(&sparse_content());
        let mut blob = Vec::new();
        let layer = compress_tar(&tar[..], &mut blob, &opts()).unwrap();
        assert_eq!(layer.compressed_size, blob.len() as u64);
        assert_eq!(layer.uncompressed_size, tar.len() as u64);
        assert_eq!(layer.diff_id, Digest::sha256(&tar));
        // Skippable frames are invisible to a plain decoder.
        assert_eq!(zstd::decode_all(&blob[..]).unwrap(), tar);
    }

    #[test]
    fn test_manifest_describes_chunks() {
        let tar = sample_tar(&sparse_content());
        let mut blob = Vec::new();
        let layer = compress_tar(&tar[..], &mut blob, &opts()).unwrap();
        let blob = MemoryBlob::new(blob);
        let manifest = read_manifest(
            &blob,
            blob.size(),
            &layer.annotations,
            &ManifestOptions::default(),
        )
        .unwrap();
        assert_eq!(manifest.format, LayerFormat::ZstdChunked);

        let sparse: Vec<_> = manifest
            .toc
            .entries
            .iter()
            .filter(|e| e.name == "usr/sparse")
            .collect();
        // 4096 data, 4096 + 4096 zeros, 4 data.
        assert_eq!(sparse.len(), 4);
        assert_eq!(sparse[0].entry_type, EntryType::Reg);
        assert_eq!(sparse[0].digest, Digest::sha256(&sparse_content()).to_string());
        let types: Vec<_> = sparse.iter().map(|e| e.chunk_type).collect();
        assert_eq!(
            types,
            [ChunkType::Data, ChunkType::Zeros, ChunkType::Zeros, ChunkType::Data]
        );
        assert_eq!(sparse[3].chunk_offset, 12288);
        assert_eq!(sparse[3].chunk_size, 4);
        assert_eq!(manifest.toc.primary_entries().count(), 6);
    }

    #[test]
    fn test_convert_then_extract() {
        let sparse = sparse_content();
        let tar = sample_tar(&sparse);
        let mut blob = Vec::new();
        let layer = compress_tar(&tar[..], &mut blob, &opts()).unwrap();
        let blob = MemoryBlob::new(blob);

        let tmp = tempfile::tempdir().unwrap();
        let dir = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        let out = extract_blob(
            &blob,
            blob.size(),
            &layer.annotations,
            &dir,
            &ManifestOptions::default(),
            &ExtractionOptions::default(),
        )
        .unwrap();

        assert_eq!(dir.read("usr/hello").unwrap(), b"hello\n");
        assert_eq!(dir.read("usr/sparse").unwrap(), sparse);
        assert_eq!(dir.read("usr/hello.hard").unwrap(), b"hello\n");
        assert_eq!(out.stats.bytes_sparse, 8192);
        assert_eq!(out.uncompressed_digest, Some(layer.diff_id));
        assert_eq!(out.uncompressed_size, Some(tar.len() as u64));
    }

    #[test]
    fn test_garbage_input() {
        let mut blob = Vec::new();
        assert!(compress_tar(&[0x55u8; 1024][..], &mut blob, &opts()).is_err());
    }
}
