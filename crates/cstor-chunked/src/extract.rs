//! Materializing a chunked layer into a directory.
//!
//! The TOC of an authenticated [`ChunkedManifest`] drives the extraction:
//! directories, symlinks and devices are created right away, while the
//! content of regular files is fetched from the blob with as few range
//! requests as possible and decompressed chunk by chunk into place.
//!
//! # Overview
//!
//! 1. [`merge_toc_entries`] pairs every regular file with its chunk entries
//!    and computes the compressed extent of every chunk.
//! 2. Each data chunk becomes a range to fetch; `zeros` chunks become holes
//!    that are never fetched. Files whose digest was already queued are
//!    deduplicated instead of fetched again, and content found in a
//!    [`LayerCache`] is copied from local disk.
//! 3. Adjacent ranges are coalesced until at most
//!    [`MAX_NUMBER_MISSING_CHUNKS`] remain; a transport that rejects the
//!    request gets a coarser plan.
//! 4. Every file is digested while it is written and checked against the
//!    TOC before its attributes are applied.
//!
//! # Example
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use cap_std::ambient_authority;
//! use cap_std::fs::Dir;
//! use cstor_chunked::blob::SeekableFile;
//! use cstor_chunked::extract::{extract_blob, ExtractionOptions};
//! use cstor_chunked::manifest::ManifestOptions;
//!
//! let blob = SeekableFile::open("layer.zst")?;
//! let annotations: BTreeMap<String, String> = BTreeMap::new();
//! let dest = Dir::open_ambient_dir("/tmp/extract", ambient_authority())?;
//! let out = extract_blob(
//!     &blob,
//!     blob.size(),
//!     &annotations,
//!     &dest,
//!     &ManifestOptions::default(),
//!     &ExtractionOptions::default(),
//! )?;
//! println!("{} files, {} bytes fetched", out.stats.files_extracted, out.stats.bytes_fetched);
//! # Ok::<(), cstor_chunked::ChunkedError>(())
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::os::fd::AsFd;
use std::sync::Arc;

use cap_std::fs::Dir;
use rustix::fs::{Mode, OFlags};

use crate::blob::{
    BlobChunkAccessor, BlobStreams, ImageSourceChunk, ensure_all_blobs_done, get_blob_at,
    next_stream,
};
use crate::cache::{ChunkOrigin, FoundFile, LayerCache};
use crate::digest::{Algorithm, Digest, Digester};
use crate::error::{ChunkedError, Result};
use crate::fs::{
    AttrOptions, CopyOutcome, NEW_FILE_FLAGS, WhiteoutFormat, append_hole,
    can_dedup_metadata_with_hard_link, convert_whiteout, copy_file_content, create_empty_file,
    open_file_under_root, safe_link, safe_mkdir, safe_mknod, safe_symlink, set_file_attrs,
};
use crate::manifest::{ChunkedManifest, LayerFormat, ManifestOptions, read_manifest};
use crate::path::clean_abs_path;
use crate::tar_split::{tar_size_from_tar_split, write_output_tar_stream};
use crate::toc::{ChunkType, EntryType, FileMetadata};

/// Upper bound on the number of ranges requested in one batch.
pub const MAX_NUMBER_MISSING_CHUNKS: usize = 1024;

/// How deduplicated file content is duplicated when it cannot be hard linked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkMode {
    /// Try reflink (copy-on-write) first, fall back to copy.
    ///
    /// On btrfs and XFS with reflink=1 the duplicate shares the data blocks
    /// of the first copy.
    #[default]
    Reflink,

    /// Always copy file data.
    Copy,
}

/// Statistics from an extraction.
#[derive(Debug, Default, Clone)]
pub struct ExtractionStats {
    /// Number of regular files written (including empty and deduplicated ones).
    pub files_extracted: usize,
    /// Number of directories created.
    pub directories_created: usize,
    /// Number of symlinks created.
    pub symlinks_created: usize,
    /// Number of hardlinks created (from TOC entries).
    pub hardlinks_created: usize,
    /// Number of device nodes and FIFOs created.
    pub devices_created: usize,
    /// Number of whiteouts converted.
    pub whiteouts_processed: usize,
    /// Number of files satisfied from another file of the same layer.
    pub files_deduplicated: usize,
    /// Number of files satisfied from the layer cache.
    pub files_reused: usize,
    /// Number of chunks copied from the layer cache.
    pub chunks_reused: usize,
    /// Uncompressed bytes taken from the layer cache instead of the blob.
    pub bytes_reused: u64,
    /// Compressed bytes requested from the blob.
    pub bytes_fetched: u64,
    /// Bytes left as holes.
    pub bytes_sparse: u64,
    /// Bytes reflinked (zero-copy via FICLONE).
    pub bytes_reflinked: u64,
    /// Bytes hardlinked (zero-copy via hardlink to the first copy).
    pub bytes_hardlinked: u64,
    /// Bytes copied (fallback when reflink/hardlink is not possible).
    pub bytes_copied: u64,
}

/// Options for extraction.
#[derive(Debug, Clone, Default)]
pub struct ExtractionOptions {
    /// How deduplicated content is duplicated.
    pub link_mode: LinkMode,
    /// Hard link files with identical content and metadata.
    pub use_hard_links: bool,
    /// Ignore chown failures.
    pub ignore_chown_errors: bool,
    /// Do not verify file digests while writing.
    pub skip_validation: bool,
    /// How whiteouts are written.
    pub whiteout_format: WhiteoutFormat,
    /// Do not rebuild the tar stream to compute the uncompressed digest.
    pub insecure_allow_unpredictable_image_contents: bool,
    /// Local content to reuse before fetching from the blob.
    pub layer_cache: Option<Arc<LayerCache>>,
}

impl ExtractionOptions {
    /// Create options with reflink mode (default).
    pub fn with_reflinks() -> Self {
        Self {
            link_mode: LinkMode::Reflink,
            ..Default::default()
        }
    }

    /// Create options that hard link duplicate files when their metadata
    /// matches.
    pub fn with_hardlinks() -> Self {
        Self {
            use_hard_links: true,
            ..Default::default()
        }
    }

    /// Create options with copy mode (no linking).
    pub fn with_copy() -> Self {
        Self {
            link_mode: LinkMode::Copy,
            ..Default::default()
        }
    }

    fn attr_options(&self) -> AttrOptions {
        AttrOptions {
            ignore_chown_errors: self.ignore_chown_errors,
        }
    }
}

/// The compressed extent of one chunk of a regular file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRef {
    /// Start of the chunk in the blob.
    pub offset: u64,
    /// End of the chunk in the blob.
    pub end_offset: u64,
    /// Uncompressed size, or 0 for "the rest of the file".
    pub chunk_size: u64,
    /// Offset of the chunk within the file.
    pub chunk_offset: u64,
    /// Digest of the uncompressed chunk.
    pub chunk_digest: String,
    /// Data or hole.
    pub chunk_type: ChunkType,
}

impl ChunkRef {
    fn from_entry(e: &FileMetadata) -> Self {
        Self {
            offset: e.offset,
            end_offset: e.end_offset,
            chunk_size: e.chunk_size,
            chunk_offset: e.chunk_offset,
            chunk_digest: e.chunk_digest.clone(),
            chunk_type: e.chunk_type,
        }
    }

    /// Bytes of the blob holding this chunk.
    pub fn compressed_size(&self) -> u64 {
        self.end_offset.saturating_sub(self.offset)
    }
}

/// A primary TOC entry with the chunks of its content.
#[derive(Debug, Clone)]
pub struct MergedEntry {
    /// The primary entry; `end_offset` covers all its chunks.
    pub metadata: FileMetadata,
    /// Chunks of a regular file, the entry itself first. Empty for other types.
    pub chunks: Vec<ChunkRef>,
    /// Attributes must not be applied (the file is a hard link to another).
    pub skip_set_attrs: bool,
}

/// Pair every regular file with its chunk entries.
///
/// Layout entries of estargz blobs are dropped. Entries without an
/// `end_offset` (estargz never stores it) end where the next entry with an
/// offset starts; the last one ends at `toc_offset`.
pub fn merge_toc_entries(
    format: LayerFormat,
    entries: &[FileMetadata],
    toc_offset: u64,
) -> Result<Vec<MergedEntry>> {
    let mut merged: Vec<MergedEntry> = Vec::new();
    let mut i = 0;
    while i < entries.len() {
        let e = &entries[i];
        i += 1;
        if format.must_skip(&e.name) {
            continue;
        }
        match e.entry_type {
            EntryType::Chunk => {
                return Err(ChunkedError::Format(format!(
                    "chunk entry {:?} without a regular file",
                    e.name
                )));
            }
            EntryType::Reg => {
                let mut metadata = e.clone();
                let mut chunks = vec![ChunkRef::from_entry(e)];
                while let Some(c) = entries.get(i).filter(|c| c.entry_type == EntryType::Chunk) {
                    chunks.push(ChunkRef::from_entry(c));
                    metadata.end_offset = c.end_offset;
                    i += 1;
                }
                merged.push(MergedEntry {
                    metadata,
                    chunks,
                    skip_set_attrs: false,
                });
            }
            _ => merged.push(MergedEntry {
                metadata: e.clone(),
                chunks: Vec::new(),
                skip_set_attrs: false,
            }),
        }
    }

    let mut last_offset = toc_offset;
    for entry in merged.iter_mut().rev() {
        if entry.metadata.end_offset == 0 {
            entry.metadata.end_offset = last_offset;
        }
        if entry.metadata.offset != 0 {
            last_offset = entry.metadata.offset;
        }
        let mut last_chunk_offset = entry.metadata.end_offset;
        for chunk in entry.chunks.iter_mut().rev() {
            chunk.end_offset = last_chunk_offset;
            last_chunk_offset = chunk.offset;
        }
    }
    Ok(merged)
}

/// One piece of a planned range.
#[derive(Debug, Clone, PartialEq, Eq)]
enum MissingFileChunk {
    /// Bytes of the range that belong to nothing and are skipped.
    Gap(u64),
    /// Compressed data for the file at index `file`.
    Data {
        file: usize,
        compressed: u64,
        uncompressed: u64,
    },
    /// A hole in the file at index `file`; consumes nothing from the range.
    Hole { file: usize, size: u64 },
    /// Bytes of the file at index `file` copied from another layer; consumes
    /// nothing from the range.
    Origin {
        file: usize,
        origin: ChunkOrigin,
        size: u64,
    },
}

/// A range of the blob to fetch, or content that needs no fetching.
#[derive(Debug, Clone)]
struct MissingPart {
    source: ImageSourceChunk,
    /// A hole or a chunk found locally.
    local: bool,
    chunks: Vec<MissingFileChunk>,
}

impl MissingPart {
    fn end(&self) -> u64 {
        self.source.offset + self.source.length
    }

    fn single_data_file(&self) -> Option<usize> {
        match self.chunks.as_slice() {
            [MissingFileChunk::Data { file, .. }] if !self.local => Some(*file),
            _ => None,
        }
    }
}

/// Coalesce `parts` into at most `target` ranges.
///
/// Contiguous pieces of the same file are joined first. Then the smallest
/// gaps between fetched ranges are merged away; local parts between two
/// merged ranges travel along in the merged range.
fn merge_missing_chunks(parts: Vec<MissingPart>, target: usize) -> Vec<MissingPart> {
    let mut joined: Vec<MissingPart> = Vec::with_capacity(parts.len());
    for part in parts {
        if let Some(prev) = joined.last_mut()
            && let (Some(a), Some(b)) = (prev.single_data_file(), part.single_data_file())
            && a == b
            && prev.end() == part.source.offset
            && let (
                MissingFileChunk::Data {
                    compressed,
                    uncompressed,
                    ..
                },
                MissingFileChunk::Data {
                    compressed: c2,
                    uncompressed: u2,
                    ..
                },
            ) = (&mut prev.chunks[0], &part.chunks[0])
        {
            *compressed += c2;
            *uncompressed += u2;
            prev.source.length += part.source.length;
            continue;
        }
        joined.push(part);
    }

    struct Gap {
        to: usize,
        cost: u64,
    }
    let mut gaps = Vec::new();
    let mut last: Option<usize> = None;
    let mut fetched = 0usize;
    for (i, p) in joined.iter().enumerate() {
        if p.local {
            continue;
        }
        fetched += 1;
        if let Some(l) = last
            && let Some(cost) = p.source.offset.checked_sub(joined[l].end())
        {
            gaps.push((l, Gap { to: i, cost }));
        }
        last = Some(i);
    }
    gaps.sort_by_key(|(_, g)| g.cost);

    let mut to_merge = vec![false; joined.len()];
    for (from, g) in gaps.iter().take(fetched.saturating_sub(target)) {
        for m in &mut to_merge[from + 1..=g.to] {
            *m = true;
        }
    }

    let mut out: Vec<MissingPart> = Vec::new();
    for (i, part) in joined.into_iter().enumerate() {
        match out.last_mut() {
            Some(prev) if to_merge[i] => {
                if !part.local {
                    let gap = part.source.offset - prev.end();
                    prev.source.length += gap + part.source.length;
                    if gap > 0 {
                        prev.chunks.push(MissingFileChunk::Gap(gap));
                    }
                }
                prev.chunks.extend(part.chunks);
            }
            _ => out.push(part),
        }
    }
    out
}

/// The file currently being written from fetched chunks.
struct DestinationFile {
    index: usize,
    file: File,
    digester: Option<(Digester, Digest)>,
}

impl DestinationFile {
    fn open(root: &Dir, index: usize, entry: &MergedEntry, skip_validation: bool) -> Result<Self> {
        let name = clean_abs_path(&entry.metadata.name);
        let file = File::from(open_file_under_root(root, &name, NEW_FILE_FLAGS, Mode::empty())?);
        let digester = if skip_validation {
            None
        } else {
            let expected = entry.metadata.parsed_digest()?.ok_or_else(|| {
                ChunkedError::Format(format!("missing digest for regular file {name:?}"))
            })?;
            Some((expected.algorithm_kind().digester(), expected))
        };
        Ok(Self {
            index,
            file,
            digester,
        })
    }

    fn write_chunk(
        &mut self,
        format: LayerFormat,
        stream: &mut dyn Read,
        compressed: u64,
        uncompressed: u64,
    ) -> Result<()> {
        let mut raw = stream.take(compressed);
        {
            let mut decoder = format.decoder(&mut raw)?;
            self.write_from(&mut decoder, uncompressed)?;
        }
        // Frame epilogues the decoder did not need.
        io::copy(&mut raw, &mut io::sink())?;
        Ok(())
    }

    /// Copy exactly `size` bytes of `src` into the file.
    fn write_from(&mut self, src: &mut dyn Read, size: u64) -> Result<()> {
        let mut src = src.take(size);
        let mut buf = vec![0u8; 128 * 1024];
        let mut written = 0u64;
        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.file.write_all(&buf[..n])?;
            if let Some((d, _)) = self.digester.as_mut() {
                d.update(&buf[..n]);
            }
            written += n as u64;
        }
        if written != size {
            return Err(ChunkedError::Format(format!(
                "short chunk: expected {size} bytes, got {written}"
            )));
        }
        Ok(())
    }

    fn append_hole(&mut self, size: u64) -> Result<()> {
        append_hole(&mut self.file, size)?;
        if let Some((d, _)) = self.digester.as_mut() {
            io::copy(&mut io::repeat(0).take(size), d)?;
        }
        Ok(())
    }

    fn close(self, root: &Dir, entry: &MergedEntry, attrs: &AttrOptions) -> Result<()> {
        if let Some((d, expected)) = self.digester {
            d.finish().ensure_eq(&format!("checksum of {:?}", entry.metadata.name), &expected)?;
        }
        if entry.skip_set_attrs {
            return Ok(());
        }
        set_file_attrs(
            root,
            Some(self.file.as_fd()),
            entry.metadata.mode,
            &entry.metadata,
            attrs,
            false,
        )
    }
}

/// Write the chunks of `parts` into their files, reading fetched ranges from
/// `streams`.
fn store_missing_files(
    mut streams: BlobStreams<'_>,
    root: &Dir,
    format: LayerFormat,
    entries: &[MergedEntry],
    parts: &[MissingPart],
    options: &ExtractionOptions,
    stats: &mut ExtractionStats,
) -> Result<()> {
    let attrs = options.attr_options();
    let mut dest: Option<DestinationFile> = None;

    let switch_to = |dest: &mut Option<DestinationFile>,
                         file: usize,
                         stats: &mut ExtractionStats|
     -> Result<()> {
        if dest.as_ref().is_some_and(|d| d.index == file) {
            return Ok(());
        }
        if let Some(prev) = dest.take() {
            let index = prev.index;
            prev.close(root, &entries[index], &attrs)?;
            stats.files_extracted += 1;
        }
        *dest = Some(DestinationFile::open(
            root,
            file,
            &entries[file],
            options.skip_validation,
        )?);
        Ok(())
    };

    for part in parts {
        let mut stream = if part.local {
            None
        } else {
            Some(next_stream(&mut streams, "missing chunk")?)
        };
        for chunk in &part.chunks {
            match *chunk {
                MissingFileChunk::Gap(n) => {
                    if let Some(s) = stream.as_mut() {
                        io::copy(&mut s.take(n), &mut io::sink())?;
                    }
                }
                MissingFileChunk::Hole { file, size } => {
                    switch_to(&mut dest, file, stats)?;
                    if let Some(d) = dest.as_mut() {
                        d.append_hole(size)?;
                    }
                    stats.bytes_sparse += size;
                }
                MissingFileChunk::Origin {
                    file,
                    ref origin,
                    size,
                } => {
                    let cache = options.layer_cache.as_deref().ok_or_else(|| {
                        ChunkedError::Inconsistency("chunk planned without a layer cache".into())
                    })?;
                    switch_to(&mut dest, file, stats)?;
                    if let Some(d) = dest.as_mut() {
                        d.write_from(&mut cache.open_chunk(origin)?, size)?;
                    }
                    stats.chunks_reused += 1;
                    stats.bytes_reused += size;
                }
                MissingFileChunk::Data {
                    file,
                    compressed,
                    uncompressed,
                } => {
                    let Some(s) = stream.as_mut() else {
                        return Err(ChunkedError::Format(
                            "data chunk planned without a range".to_string(),
                        ));
                    };
                    switch_to(&mut dest, file, stats)?;
                    if let Some(d) = dest.as_mut() {
                        d.write_chunk(format, s, compressed, uncompressed)
                            .map_err(|e| match e {
                                ChunkedError::Format(msg) => ChunkedError::Format(format!(
                                    "{msg} for {:?}",
                                    entries[file].metadata.name
                                )),
                                other => other,
                            })?;
                    }
                }
            }
        }
    }
    if let Some(last) = dest.take() {
        let index = last.index;
        last.close(root, &entries[index], &attrs)?;
        stats.files_extracted += 1;
    }
    ensure_all_blobs_done(streams)
}

/// Fetch and write every part, coarsening the plan when the transport
/// rejects the request.
fn retrieve_missing_files<A: BlobChunkAccessor + ?Sized>(
    accessor: &A,
    root: &Dir,
    format: LayerFormat,
    entries: &[MergedEntry],
    parts: Vec<MissingPart>,
    options: &ExtractionOptions,
    stats: &mut ExtractionStats,
) -> Result<()> {
    let mut parts = merge_missing_chunks(parts, MAX_NUMBER_MISSING_CHUNKS);
    loop {
        let chunks: Vec<ImageSourceChunk> = parts
            .iter()
            .filter(|p| !p.local)
            .map(|p| p.source)
            .collect();
        let streams: BlobStreams<'_> = if chunks.is_empty() {
            Box::new(std::iter::empty())
        } else {
            match get_blob_at(accessor, &chunks) {
                Ok(s) => s,
                Err(ChunkedError::BadRangeRequest { status }) if chunks.len() > 1 => {
                    let target = chunks.len() / 2;
                    tracing::debug!(
                        "range request with {} ranges rejected (status {status}), \
                         retrying with {target}",
                        chunks.len()
                    );
                    parts = merge_missing_chunks(parts, target);
                    continue;
                }
                Err(e) => return Err(e),
            }
        };
        stats.bytes_fetched += chunks.iter().map(|c| c.length).sum::<u64>();
        return store_missing_files(streams, root, format, entries, &parts, options, stats);
    }
}

/// Plan the fetches for the content of a regular file.
///
/// Returns the number of bytes that need no fetching because a chunk with
/// the same digest was found in `cache`.
fn plan_file_chunks(
    index: usize,
    entry: &MergedEntry,
    cache: Option<&LayerCache>,
    parts: &mut Vec<MissingPart>,
) -> u64 {
    let mut reused = 0;
    let mut remaining = entry.metadata.size;
    for chunk in &entry.chunks {
        if remaining == 0 {
            break;
        }
        let size = if chunk.chunk_size > 0 {
            chunk.chunk_size.min(remaining)
        } else {
            remaining
        };
        remaining -= size;
        let source = ImageSourceChunk::new(chunk.offset, chunk.compressed_size());
        let part = match chunk.chunk_type {
            ChunkType::Zeros => MissingPart {
                source,
                local: true,
                chunks: vec![MissingFileChunk::Hole { file: index, size }],
            },
            ChunkType::Data => match cache.and_then(|c| c.find_chunk(&chunk.chunk_digest, size)) {
                Some(origin) => {
                    reused += size;
                    MissingPart {
                        source,
                        local: true,
                        chunks: vec![MissingFileChunk::Origin {
                            file: index,
                            origin,
                            size,
                        }],
                    }
                }
                None => MissingPart {
                    source,
                    local: false,
                    chunks: vec![MissingFileChunk::Data {
                        file: index,
                        compressed: chunk.compressed_size(),
                        uncompressed: size,
                    }],
                },
            },
        };
        parts.push(part);
    }
    reused
}

/// Result of applying a layer.
#[derive(Debug, Clone)]
pub struct DiffOutput {
    /// Extraction counters.
    pub stats: ExtractionStats,
    /// Digest of the original tar stream, when it could be rebuilt.
    pub uncompressed_digest: Option<Digest>,
    /// Size of the original tar stream, when a tar-split is available.
    pub uncompressed_size: Option<u64>,
}

/// Materialize the layer described by `manifest` under `root`.
///
/// A failure leaves a partially extracted tree behind; cleanup is up to the
/// caller.
pub fn apply_diff<A: BlobChunkAccessor + ?Sized>(
    accessor: &A,
    manifest: &mut ChunkedManifest,
    root: &Dir,
    options: &ExtractionOptions,
) -> Result<DiffOutput> {
    let mut entries = merge_toc_entries(
        manifest.format,
        &manifest.toc.entries,
        manifest.toc_offset,
    )?;
    let attrs = options.attr_options();
    let cache = options.layer_cache.as_deref();
    let mut stats = ExtractionStats::default();

    let mut parts = Vec::new();
    let mut first_by_digest: HashMap<&str, usize> = HashMap::new();
    let mut duplicates = Vec::new();
    let mut hard_links = Vec::new();
    let mut dirs = Vec::new();
    let mut total_size = 0u64;
    let mut missing_size = 0u64;

    for (i, entry) in entries.iter().enumerate() {
        let md = &entry.metadata;
        if !convert_whiteout(root, options.whiteout_format, md, &attrs)? {
            stats.whiteouts_processed += 1;
            continue;
        }
        match md.entry_type {
            EntryType::Dir => {
                safe_mkdir(root, md, &attrs)?;
                stats.directories_created += 1;
                dirs.push(i);
            }
            EntryType::Symlink => {
                safe_symlink(root, md, &attrs)?;
                stats.symlinks_created += 1;
            }
            // The target may not have been written yet.
            EntryType::Hardlink => hard_links.push(i),
            EntryType::Char | EntryType::Block | EntryType::Fifo => {
                safe_mknod(root, md, &attrs)?;
                stats.devices_created += 1;
            }
            EntryType::Reg if md.size == 0 => {
                create_empty_file(root, md, &attrs)?;
                stats.files_extracted += 1;
            }
            EntryType::Reg => {
                total_size += md.size;
                if !md.digest.is_empty() {
                    if let Some(&first) = first_by_digest.get(md.digest.as_str()) {
                        let first_name = &entries[first].metadata.name;
                        tracing::trace!("{:?} duplicates {first_name:?}", md.name);
                        duplicates.push((i, first));
                        continue;
                    }
                    first_by_digest.insert(&md.digest, i);
                }
                if let Some(found) = cache.and_then(|c| c.find_file(md, options.use_hard_links)) {
                    copy_from_cache(root, entry, found, options, &mut stats)?;
                    continue;
                }
                missing_size += md.size;
                missing_size -= plan_file_chunks(i, entry, cache, &mut parts);
            }
            EntryType::Chunk => unreachable!("chunks are merged into their file"),
        }
    }

    if total_size > 0 {
        tracing::debug!(
            "Missing {missing_size} bytes out of {total_size} ({:.2} %)",
            missing_size as f64 * 100.0 / total_size as f64
        );
    }

    if !parts.is_empty() {
        retrieve_missing_files(
            accessor,
            root,
            manifest.format,
            &entries,
            parts,
            options,
            &mut stats,
        )?;
    }

    for (dup, first) in duplicates {
        copy_from_first(root, &mut entries, dup, first, options, &mut stats)?;
    }

    for i in hard_links {
        safe_link(root, &entries[i].metadata, &attrs)?;
        stats.hardlinks_created += 1;
    }

    // Writing into a directory bumps its mtime; put the recorded one back.
    for &i in dirs.iter().rev() {
        safe_mkdir(root, &entries[i].metadata, &attrs)?;
    }

    let (uncompressed_digest, uncompressed_size) = match manifest.tar_split.as_mut() {
        Some(ts) => {
            ts.seek(SeekFrom::Start(0))?;
            let size = tar_size_from_tar_split(BufReader::new(&mut *ts))?;
            let digest = if options.insecure_allow_unpredictable_image_contents {
                None
            } else {
                ts.seek(SeekFrom::Start(0))?;
                let mut digester = Algorithm::Sha256.digester();
                write_output_tar_stream(BufReader::new(&mut *ts), root, &mut digester)?;
                Some(digester.finish())
            };
            (digest, Some(size))
        }
        None => (None, None),
    };

    Ok(DiffOutput {
        stats,
        uncompressed_digest,
        uncompressed_size,
    })
}

/// Satisfy `dup` from the already written `first`.
fn copy_from_first(
    root: &Dir,
    entries: &mut [MergedEntry],
    dup: usize,
    first: usize,
    options: &ExtractionOptions,
    stats: &mut ExtractionStats,
) -> Result<()> {
    let src = File::from(open_file_under_root(
        root,
        &clean_abs_path(&entries[first].metadata.name),
        OFlags::RDONLY | OFlags::NOFOLLOW,
        Mode::empty(),
    )?);
    let hard_link = options.use_hard_links
        && can_dedup_metadata_with_hard_link(&entries[first].metadata, &entries[dup].metadata);
    let (dest, outcome) = copy_file_content(
        root,
        &src,
        &entries[dup].metadata.name,
        hard_link,
        options.link_mode == LinkMode::Reflink,
    )?;
    if matches!(outcome, CopyOutcome::Hardlinked(_)) {
        entries[dup].skip_set_attrs = true;
    }
    record_copy(stats, outcome);
    stats.files_deduplicated += 1;
    stats.files_extracted += 1;

    let entry = &entries[dup];
    if let Some(dest) = dest
        && !entry.skip_set_attrs
    {
        set_file_attrs(
            root,
            Some(dest.as_fd()),
            entry.metadata.mode,
            &entry.metadata,
            &options.attr_options(),
            false,
        )?;
    }
    Ok(())
}

/// Materialize `entry` from content found in the layer cache.
fn copy_from_cache(
    root: &Dir,
    entry: &MergedEntry,
    found: FoundFile,
    options: &ExtractionOptions,
    stats: &mut ExtractionStats,
) -> Result<()> {
    tracing::trace!("{:?} reused from {}", entry.metadata.name, found.location);
    let (dest, outcome) = copy_file_content(
        root,
        &found.file,
        &entry.metadata.name,
        found.hard_link,
        options.link_mode == LinkMode::Reflink,
    )?;
    record_copy(stats, outcome);
    stats.files_reused += 1;
    stats.files_extracted += 1;
    stats.bytes_reused += entry.metadata.size;

    // A hard link keeps the attributes of its source, which already match.
    if let Some(dest) = dest {
        set_file_attrs(
            root,
            Some(dest.as_fd()),
            entry.metadata.mode,
            &entry.metadata,
            &options.attr_options(),
            false,
        )?;
    }
    Ok(())
}

fn record_copy(stats: &mut ExtractionStats, outcome: CopyOutcome) {
    match outcome {
        CopyOutcome::Hardlinked(n) => stats.bytes_hardlinked += n,
        CopyOutcome::Reflinked(n) => stats.bytes_reflinked += n,
        CopyOutcome::Copied(n) => stats.bytes_copied += n,
    }
}

/// Read the manifest of a blob and materialize it under `root`.
pub fn extract_blob<A: BlobChunkAccessor + ?Sized>(
    accessor: &A,
    blob_size: u64,
    annotations: &BTreeMap<String, String>,
    root: &Dir,
    manifest_options: &ManifestOptions,
    options: &ExtractionOptions,
) -> Result<DiffOutput> {
    let mut manifest = read_manifest(accessor, blob_size, annotations, manifest_options)?;
    apply_diff(accessor, &mut manifest, root, options)
}
