#![forbid(unsafe_code)]
//! Partial pulls of zstd:chunked and estargz container layers.
//!
//! Both formats embed a Table of Contents (TOC) in an otherwise ordinary
//! compressed tarball. The TOC lists every file with its metadata and the
//! compressed range holding its content, so a layer can be materialized by
//! fetching only the byte ranges that are not already available locally.
//!
//! # Overview
//!
//! The pieces of a partial pull are:
//!
//! - [`manifest`] locates the TOC (from layer annotations or the footer),
//!   fetches it together with the tar-split through a [`BlobChunkAccessor`]
//!   and authenticates it against the digest the caller trusts.
//! - [`tar_split`] cross-checks the TOC against the tar-split, which records
//!   the exact bytes of the original tarball.
//! - [`extract`] merges chunk entries, plans the ranges to fetch and writes
//!   the tree below a `cap_std::fs::Dir` using the sandboxed helpers of
//!   [`fs`]. Content already on the host, in other layers or OSTree
//!   repositories, is reused through a [`cache::LayerCache`].
//!
//! Errors that mean "use a regular full download instead" are classified by
//! [`ChunkedError::is_fallback`].
//!
//! # Example
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use cap_std::{ambient_authority, fs::Dir};
//! use cstor_chunked::blob::SeekableFile;
//! use cstor_chunked::config::PullOptions;
//! use cstor_chunked::extract::extract_blob;
//!
//! # fn example(annotations: BTreeMap<String, String>) -> cstor_chunked::Result<()> {
//! let opts = PullOptions::load()?;
//! let blob = SeekableFile::open("layer.tar.zst")?;
//! let root = Dir::open_ambient_dir("rootfs", ambient_authority())?;
//! let out = extract_blob(
//!     &blob,
//!     blob.size(),
//!     &annotations,
//!     &root,
//!     &opts.manifest_options(),
//!     &opts.extraction_options(),
//! )?;
//! println!("fetched {} bytes", out.stats.bytes_fetched);
//! # Ok(())
//! # }
//! ```
//!
//! # Producing layers
//!
//! [`compressor::compress_tar`] converts a plain tarball into a zstd:chunked
//! blob, and [`dump::generate_dump`] renders a TOC in the composefs dump
//! format.

// Formats
pub mod digest;
pub mod footer;
pub mod toc;

// Fetching and validation
pub mod blob;
pub mod manifest;
mod readatreader;

// Tar-split
pub mod tar_split;
pub mod tar_split_writer;

// Materialization
pub mod cache;
pub mod extract;
pub mod fs;
pub mod path;

// Producers
pub mod compressor;
pub mod dump;

pub mod config;
pub mod error;

/// Prefix of whiteout file names.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Name of the entry marking its directory as opaque.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

// Re-export commonly used types
pub use blob::{BlobChunkAccessor, ImageSourceChunk, MemoryBlob, SeekableFile};
pub use cache::LayerCache;
pub use config::PullOptions;
pub use digest::Digest;
pub use error::{ChunkedError, Result};
pub use extract::{
    DiffOutput, ExtractionOptions, ExtractionStats, LinkMode, apply_diff, extract_blob,
};
pub use manifest::{ChunkedManifest, LayerFormat, ManifestOptions, read_manifest};
pub use toc::{ChunkType, EntryType, FileMetadata, Toc};
