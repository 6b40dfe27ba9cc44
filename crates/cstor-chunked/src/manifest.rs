//! Locating, fetching and authenticating the TOC of a chunked layer.
//!
//! Two layouts are supported:
//!
//! - **zstd:chunked**: the manifest and tar-split positions come from layer
//!   annotations; both are fetched in one batched range request.
//! - **estargz**: a 51-byte gzip footer carries the TOC offset; the TOC is a
//!   gzip-compressed single-entry tar.
//!
//! Every fetched metadata blob is checked against the digest supplied by the
//! caller before it is decompressed or parsed. Nothing in the blob is trusted
//! until that check passes.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use flate2::read::MultiGzDecoder;

use crate::blob::{
    BlobChunkAccessor, BlobStreams, ImageSourceChunk, ensure_all_blobs_done, get_blob_at,
    next_stream,
};
use crate::digest::Digest;
use crate::error::{ChunkedError, Result};
use crate::footer::{
    MANIFEST_CHECKSUM_KEY, MANIFEST_INFO_KEY, MANIFEST_TYPE_CRFS, TAR_SPLIT_INFO_KEY,
    ZstdChunkedFooterData,
};
use crate::tar_split::ensure_toc_matches_tar_split;
use crate::toc::Toc;

/// Default limit for the size of a TOC or tar-split blob.
pub const DEFAULT_MAX_TOC_SIZE: u64 = 150 << 20;

/// Size of the estargz footer.
pub const ESTARGZ_FOOTER_SIZE: u64 = 51;

/// Name of the TOC entry in an estargz blob.
pub const ESTARGZ_TOC_TAR_NAME: &str = "stargz.index.json";

/// estargz landmark: files before it should be prefetched.
pub const ESTARGZ_PREFETCH_LANDMARK: &str = ".prefetch.landmark";

/// estargz landmark: nothing should be prefetched.
pub const ESTARGZ_NO_PREFETCH_LANDMARK: &str = ".no.prefetch.landmark";

/// Annotation carrying the TOC digest of an estargz layer.
pub const ESTARGZ_TOC_DIGEST_KEY: &str = "containerd.io/snapshot/stargz/toc.digest";

/// Compression of the per-file payloads of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerFormat {
    /// Each chunk is a zstd frame.
    ZstdChunked,
    /// Each chunk is a gzip member.
    Estargz,
    /// Chunks are stored uncompressed (locally converted layers).
    Uncompressed,
}

impl LayerFormat {
    /// Wrap a raw chunk stream in the matching decoder.
    pub fn decoder<'a, R: Read + 'a>(self, raw: R) -> Result<Box<dyn Read + 'a>> {
        Ok(match self {
            LayerFormat::ZstdChunked => Box::new(zstd::stream::read::Decoder::new(raw)?),
            LayerFormat::Estargz => Box::new(MultiGzDecoder::new(raw)),
            LayerFormat::Uncompressed => Box::new(raw),
        })
    }

    /// Whether an entry is layout metadata rather than layer content.
    pub fn must_skip(self, name: &str) -> bool {
        self == LayerFormat::Estargz
            && matches!(
                name,
                ESTARGZ_PREFETCH_LANDMARK | ESTARGZ_NO_PREFETCH_LANDMARK | ESTARGZ_TOC_TAR_NAME
            )
    }
}

impl std::fmt::Display for LayerFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LayerFormat::ZstdChunked => "zstd:chunked",
            LayerFormat::Estargz => "estargz",
            LayerFormat::Uncompressed => "uncompressed",
        })
    }
}

/// Determine the layout and TOC digest of a layer from its annotations.
///
/// Returns `None` for ordinary layers. Annotations claiming both layouts are
/// rejected.
pub fn toc_digest_from_annotations(
    annotations: &BTreeMap<String, String>,
) -> Result<Option<(LayerFormat, Digest)>> {
    match (
        annotations.get(ESTARGZ_TOC_DIGEST_KEY),
        annotations.get(MANIFEST_CHECKSUM_KEY),
    ) {
        (Some(_), Some(_)) => Err(ChunkedError::Format(
            "both zstd:chunked and eStargz TOC found".to_string(),
        )),
        (Some(d), None) => Ok(Some((LayerFormat::Estargz, d.parse()?))),
        (None, Some(d)) => Ok(Some((LayerFormat::ZstdChunked, d.parse()?))),
        (None, None) => Ok(None),
    }
}

/// Knobs for reading a manifest.
#[derive(Debug, Clone)]
pub struct ManifestOptions {
    /// Upper bound for the TOC and tar-split sizes.
    pub max_toc_size: u64,
    /// Directory for the tar-split spill file; the system temporary
    /// directory when unset.
    pub tmp_dir: Option<PathBuf>,
    /// Whether the metadata blobs are zstd-compressed. Only locally
    /// converted layers store them uncompressed.
    pub compressed: bool,
}

impl Default for ManifestOptions {
    fn default() -> Self {
        Self {
            max_toc_size: DEFAULT_MAX_TOC_SIZE,
            tmp_dir: None,
            compressed: true,
        }
    }
}

/// An authenticated TOC.
#[derive(Debug)]
pub struct ChunkedManifest {
    /// Layout of the layer.
    pub format: LayerFormat,
    /// Uncompressed TOC JSON.
    pub manifest: Vec<u8>,
    /// Parsed TOC.
    pub toc: Toc,
    /// Decompressed tar-split NDJSON, already checked against the TOC. The
    /// file position is unspecified.
    pub tar_split: Option<File>,
    /// Offset of the TOC in the blob; the compressed content of the last
    /// entry ends here.
    pub toc_offset: u64,
}

/// Read the manifest of a layer, choosing the layout from its annotations.
pub fn read_manifest<A: BlobChunkAccessor + ?Sized>(
    accessor: &A,
    blob_size: u64,
    annotations: &BTreeMap<String, String>,
    opts: &ManifestOptions,
) -> Result<ChunkedManifest> {
    match toc_digest_from_annotations(annotations)? {
        Some((LayerFormat::Estargz, digest)) => {
            read_estargz_manifest(accessor, blob_size, &digest, opts)
        }
        Some((_, digest)) => read_zstd_chunked_manifest(accessor, &digest, annotations, opts),
        None => Err(ChunkedError::Format(
            "layer has no zstd:chunked or estargz TOC annotation".to_string(),
        )),
    }
}

fn fetch<'a, A: BlobChunkAccessor + ?Sized>(
    accessor: &'a A,
    chunks: &[ImageSourceChunk],
) -> Result<BlobStreams<'a>> {
    let streams = get_blob_at(accessor, chunks)?;
    tracing::trace!("requested {} metadata ranges", chunks.len());
    Ok(streams)
}

fn read_blob(streams: &mut BlobStreams<'_>, len: u64, what: &str) -> Result<Vec<u8>> {
    let mut stream = next_stream(streams, what)?;
    let len = usize::try_from(len).map_err(|_| ChunkedError::TooBig {
        what: what.to_string(),
        size: len,
        limit: usize::MAX as u64,
    })?;
    let mut blob = vec![0u8; len];
    stream.read_exact(&mut blob)?;
    Ok(blob)
}

fn check_size(what: &str, size: u64, limit: u64) -> Result<()> {
    if size > limit {
        return Err(ChunkedError::TooBig {
            what: what.to_string(),
            size,
            limit,
        });
    }
    Ok(())
}

/// Read and authenticate the TOC (and tar-split, if the TOC references one)
/// of a zstd:chunked layer.
///
/// `toc_digest` must come from a trusted source (the image manifest). Sizes
/// over `opts.max_toc_size` and rejected range requests are reported as
/// fallback errors.
pub fn read_zstd_chunked_manifest<A: BlobChunkAccessor + ?Sized>(
    accessor: &A,
    toc_digest: &Digest,
    annotations: &BTreeMap<String, String>,
    opts: &ManifestOptions,
) -> Result<ChunkedManifest> {
    let footer = ZstdChunkedFooterData::from_annotations(annotations)?;
    if footer.manifest_type != MANIFEST_TYPE_CRFS {
        return Err(ChunkedError::Format(format!(
            "invalid manifest type {}",
            footer.manifest_type
        )));
    }
    check_size(
        "zstd:chunked manifest (compressed)",
        footer.length_compressed,
        opts.max_toc_size,
    )?;
    check_size(
        "zstd:chunked manifest (uncompressed)",
        footer.length_uncompressed,
        opts.max_toc_size,
    )?;

    let manifest_chunk = ImageSourceChunk::new(footer.offset, footer.length_compressed);
    let mut chunks = vec![manifest_chunk];
    let has_tar_split = footer.offset_tar_split > 0;
    if has_tar_split {
        check_size(
            "zstd:chunked tar-split (compressed)",
            footer.length_compressed_tar_split,
            opts.max_toc_size,
        )?;
        chunks.push(ImageSourceChunk::new(
            footer.offset_tar_split,
            footer.length_compressed_tar_split,
        ));
    }

    let mut streams = fetch(accessor, &chunks)?;
    let res = read_zstd_chunked_blobs(&mut streams, toc_digest, &footer, has_tar_split, opts);
    let drained = ensure_all_blobs_done(streams);
    let (manifest, toc, tar_split) = res?;
    drained?;

    Ok(ChunkedManifest {
        format: if opts.compressed {
            LayerFormat::ZstdChunked
        } else {
            LayerFormat::Uncompressed
        },
        manifest,
        toc,
        tar_split,
        toc_offset: footer.offset,
    })
}

fn read_zstd_chunked_blobs(
    streams: &mut BlobStreams<'_>,
    toc_digest: &Digest,
    footer: &ZstdChunkedFooterData,
    has_tar_split: bool,
    opts: &ManifestOptions,
) -> Result<(Vec<u8>, Toc, Option<File>)> {
    let manifest = read_blob(streams, footer.length_compressed, "manifest")?;
    let manifest = decode_and_validate_blob(
        manifest,
        footer.length_uncompressed,
        toc_digest,
        opts.compressed,
        &mut zstd_decode_all,
    )?;
    let toc = Toc::from_slice(&manifest)?;

    let mut tar_split = None;
    if let Some(expected) = &toc.tar_split_digest {
        if !has_tar_split {
            return Err(ChunkedError::Format(format!(
                "TOC requires a tar-split, but the {TAR_SPLIT_INFO_KEY} annotation \
                 does not describe a position"
            )));
        }
        let blob = read_blob(streams, footer.length_compressed_tar_split, "tar-split")?;
        let mut file = match &opts.tmp_dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        decode_and_validate_blob_to_stream(&blob, &mut file, expected, opts.compressed)?;
        ensure_toc_matches_tar_split(&toc, &mut file)?;
        tar_split = Some(file);
    } else if has_tar_split {
        // Unauthenticated: consume and ignore.
        tracing::debug!("ignoring tar-split not referenced by the TOC");
        read_blob(streams, footer.length_compressed_tar_split, "tar-split")?;
    }
    Ok((manifest, toc, tar_split))
}

fn zstd_decode_all(blob: &[u8]) -> io::Result<Vec<u8>> {
    zstd::decode_all(blob)
}

/// Check `blob` against `expected` and only then decompress it.
fn decode_and_validate_blob(
    blob: Vec<u8>,
    length_uncompressed: u64,
    expected: &Digest,
    compressed: bool,
    decode: &mut dyn FnMut(&[u8]) -> io::Result<Vec<u8>>,
) -> Result<Vec<u8>> {
    expected.verify("manifest", &blob)?;
    if !compressed {
        return Ok(blob);
    }
    let decoded = decode(&blob)?;
    if decoded.len() as u64 != length_uncompressed {
        tracing::debug!(
            "manifest decompressed to {} bytes, annotation says {}",
            decoded.len(),
            length_uncompressed
        );
    }
    Ok(decoded)
}

fn decode_and_validate_blob_to_stream(
    blob: &[u8],
    out: &mut File,
    expected: &Digest,
    compressed: bool,
) -> Result<()> {
    expected.verify("tar-split", blob)?;
    if compressed {
        zstd::stream::copy_decode(blob, &mut *out)?;
    } else {
        out.write_all(blob)?;
    }
    out.flush()?;
    out.seek(SeekFrom::Start(0))?;
    Ok(())
}

/// Read and authenticate the TOC of an estargz layer of `blob_size` bytes.
///
/// The digest is computed over the uncompressed TOC JSON.
pub fn read_estargz_manifest<A: BlobChunkAccessor + ?Sized>(
    accessor: &A,
    blob_size: u64,
    toc_digest: &Digest,
    opts: &ManifestOptions,
) -> Result<ChunkedManifest> {
    if blob_size <= ESTARGZ_FOOTER_SIZE {
        return Err(ChunkedError::Format("blob too small".to_string()));
    }
    let mut streams = fetch(
        accessor,
        &[ImageSourceChunk::new(
            blob_size - ESTARGZ_FOOTER_SIZE,
            ESTARGZ_FOOTER_SIZE,
        )],
    )?;
    let footer = read_blob(&mut streams, ESTARGZ_FOOTER_SIZE, "estargz footer");
    ensure_all_blobs_done(streams)?;
    let footer = footer?;
    let toc_offset = parse_estargz_footer(&footer)?;

    let size = (blob_size - ESTARGZ_FOOTER_SIZE)
        .checked_sub(toc_offset)
        .ok_or_else(|| {
            ChunkedError::Format(format!("ToC offset {toc_offset} is past the footer"))
        })?;
    check_size("estargz manifest", size, opts.max_toc_size)?;

    let mut streams = fetch(accessor, &[ImageSourceChunk::new(toc_offset, size)])?;
    let res = next_stream(&mut streams, "estargz manifest")
        .and_then(|s| read_estargz_toc_entry(s, opts.max_toc_size));
    let drained = ensure_all_blobs_done(streams);
    let manifest = res?;
    drained?;

    Digest::sha256(&manifest).ensure_eq("estargz manifest", toc_digest)?;
    let toc = Toc::from_slice(&manifest)?;
    Ok(ChunkedManifest {
        format: LayerFormat::Estargz,
        manifest,
        toc,
        tar_split: None,
        toc_offset,
    })
}

/// Extract the TOC offset from an estargz footer.
///
/// The footer is an empty gzip member whose extra field holds the offset as
/// 16 hex digits followed by `STARGZ`, starting at byte 16.
pub fn parse_estargz_footer(footer: &[u8]) -> Result<u64> {
    let hex = footer
        .get(16..32)
        .and_then(|b| std::str::from_utf8(b).ok())
        .ok_or_else(|| ChunkedError::Format("invalid estargz footer".to_string()))?;
    u64::from_str_radix(hex, 16)
        .map_err(|e| ChunkedError::Format(format!("parse ToC offset: {e}")))
}

fn read_estargz_toc_entry(stream: impl Read, limit: u64) -> Result<Vec<u8>> {
    let mut archive = tar::Archive::new(MultiGzDecoder::new(stream));
    let mut entries = archive.entries()?;
    let mut entry = entries
        .next()
        .ok_or_else(|| ChunkedError::Format("manifest not found".to_string()))??;
    let size = entry.header().size()?;
    if size > limit {
        return Err(ChunkedError::Format("manifest too big".to_string()));
    }
    let mut manifest = Vec::with_capacity(size as usize);
    entry.read_to_end(&mut manifest)?;
    Ok(manifest)
}
