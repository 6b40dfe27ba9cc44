//! Local content that a pull can reuse instead of fetching it.
//!
//! A [`LayerCache`] indexes layers already materialized on this host, either
//! from their TOC or by hashing an extracted tree, plus OSTree repositories
//! whose objects carry a `.payload-link` named after the content digest.
//! Extraction consults it before a file or a chunk is added to the ranges
//! requested from the blob.
//!
//! Whole files are looked up by their content digest. Chunks are looked up
//! by their chunk digest and re-hashed from disk before use, since the
//! other layer may have been modified after it was indexed.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cap_std::ambient_authority;
//! use cap_std::fs::Dir;
//! use cstor_chunked::cache::LayerCache;
//! use cstor_chunked::extract::ExtractionOptions;
//!
//! let mut cache = LayerCache::new();
//! cache.add_tree("base", Dir::open_ambient_dir("/var/lib/layers/base", ambient_authority())?)?;
//! let opts = ExtractionOptions {
//!     layer_cache: Some(Arc::new(cache)),
//!     ..Default::default()
//! };
//! # Ok::<(), cstor_chunked::ChunkedError>(())
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use cap_std::fs::MetadataExt;

use cap_std::fs::Dir;
use chrono::DateTime;
use rustix::fs::{Mode, OFlags};

use crate::digest::{Algorithm, Digest};
use crate::error::{ChunkedError, Result};
use crate::fs::{can_dedup_metadata_with_hard_link, open_file_under_root};
use crate::path::clean_abs_path;
use crate::toc::{ChunkType, EntryType, FileMetadata, Toc};

/// Where a chunk lives inside a cached layer.
#[derive(Debug, Clone)]
struct ChunkLocation {
    path: String,
    offset: u64,
    size: u64,
}

#[derive(Debug)]
struct CachedLayer {
    id: String,
    root: Dir,
    /// Content digest to the regular files holding it.
    files: HashMap<String, Vec<FileMetadata>>,
    /// Chunk digest to its first occurrence.
    chunks: HashMap<String, ChunkLocation>,
}

/// A validated chunk of another layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOrigin {
    layer: usize,
    path: String,
    offset: u64,
}

/// An existing file holding the content of an entry.
#[derive(Debug)]
pub struct FoundFile {
    /// The source, open for reading.
    pub file: File,
    /// Where the content was found.
    pub location: String,
    /// The source's attributes match the entry, so it may be hard linked.
    pub hard_link: bool,
}

/// Index of locally available content.
#[derive(Debug, Default)]
pub struct LayerCache {
    layers: Vec<CachedLayer>,
    ostree_repos: Vec<Dir>,
}

impl LayerCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether nothing has been indexed.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty() && self.ostree_repos.is_empty()
    }

    /// Index a layer extracted under `root` from its TOC.
    pub fn add_layer(&mut self, id: impl Into<String>, root: Dir, toc: &Toc) {
        let mut files: HashMap<String, Vec<FileMetadata>> = HashMap::new();
        let mut chunks = HashMap::new();
        let mut current: Option<&FileMetadata> = None;
        for e in &toc.entries {
            let file = match e.entry_type {
                EntryType::Reg => {
                    current = Some(e);
                    if e.size > 0 && !e.digest.is_empty() {
                        files.entry(e.digest.clone()).or_default().push(e.clone());
                    }
                    e
                }
                EntryType::Chunk => match current {
                    Some(f) => f,
                    None => continue,
                },
                _ => {
                    current = None;
                    continue;
                }
            };
            if e.chunk_digest.is_empty() || e.chunk_type != ChunkType::Data {
                continue;
            }
            let size = if e.chunk_size > 0 {
                e.chunk_size
            } else {
                file.size.saturating_sub(e.chunk_offset)
            };
            if size == 0 {
                continue;
            }
            chunks
                .entry(e.chunk_digest.clone())
                .or_insert_with(|| ChunkLocation {
                    path: file.name.clone(),
                    offset: e.chunk_offset,
                    size,
                });
        }
        let id = id.into();
        tracing::debug!(
            "layer cache: {id} has {} files and {} chunks",
            files.len(),
            chunks.len()
        );
        self.layers.push(CachedLayer {
            id,
            root,
            files,
            chunks,
        });
    }

    /// Index an extracted tree that has no TOC by hashing its regular files.
    ///
    /// Only whole files can be reused from such a tree.
    pub fn add_tree(&mut self, id: impl Into<String>, root: Dir) -> Result<()> {
        let mut files: HashMap<String, Vec<FileMetadata>> = HashMap::new();
        let mut pending = vec![String::new()];
        while let Some(dir_path) = pending.pop() {
            let dir = if dir_path.is_empty() {
                root.try_clone()?
            } else {
                root.open_dir(&dir_path)?
            };
            for entry in dir.entries()? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                let path = if dir_path.is_empty() {
                    name.to_string()
                } else {
                    format!("{dir_path}/{name}")
                };
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }
                let meta = entry.metadata()?;
                if meta.len() == 0 {
                    continue;
                }
                let mut digester = Algorithm::Sha256.digester();
                io::copy(&mut entry.open()?.into_std(), &mut digester)?;
                let md = FileMetadata {
                    entry_type: EntryType::Reg,
                    name: path,
                    mode: meta.mode() & 0o7777,
                    size: meta.len(),
                    uid: meta.uid(),
                    gid: meta.gid(),
                    modtime: DateTime::from_timestamp(meta.mtime(), meta.mtime_nsec() as u32),
                    digest: digester.finish().to_string(),
                    ..Default::default()
                };
                files.entry(md.digest.clone()).or_default().push(md);
            }
        }
        let id = id.into();
        tracing::debug!("layer cache: hashed {} distinct files in {id}", files.len());
        self.layers.push(CachedLayer {
            id,
            root,
            files,
            chunks: HashMap::new(),
        });
        Ok(())
    }

    /// Add an OSTree repository to look up whole files in.
    pub fn add_ostree_repo(&mut self, repo: Dir) {
        self.ostree_repos.push(repo);
    }

    /// Find an existing file with the content of `md`.
    ///
    /// With `use_hard_links`, a source whose attributes match `md` is
    /// preferred and reported as linkable. OSTree objects are never linked.
    pub fn find_file(&self, md: &FileMetadata, use_hard_links: bool) -> Option<FoundFile> {
        if md.digest.is_empty() || md.size == 0 {
            return None;
        }
        for layer in &self.layers {
            let Some(candidates) = layer.files.get(&md.digest) else {
                continue;
            };
            let linkable =
                |c: &FileMetadata| use_hard_links && can_dedup_metadata_with_hard_link(md, c);
            let Some(c) = candidates
                .iter()
                .filter(|c| c.size == md.size)
                .find(|c| linkable(*c))
                .or_else(|| candidates.iter().find(|c| c.size == md.size))
            else {
                continue;
            };
            let file = match open_file_under_root(
                &layer.root,
                &clean_abs_path(&c.name),
                OFlags::RDONLY | OFlags::NOFOLLOW,
                Mode::empty(),
            ) {
                Ok(fd) => File::from(fd),
                Err(e) => {
                    tracing::debug!("layer cache: cannot open {:?} in {}: {e}", c.name, layer.id);
                    continue;
                }
            };
            // The layer may have changed since it was indexed.
            if file.metadata().ok().map(|m| m.len()) != Some(md.size) {
                continue;
            }
            return Some(FoundFile {
                file,
                location: format!("{}:{}", layer.id, c.name),
                hard_link: linkable(c),
            });
        }
        self.find_in_ostree_repos(md)
    }

    fn find_in_ostree_repos(&self, md: &FileMetadata) -> Option<FoundFile> {
        if self.ostree_repos.is_empty() {
            return None;
        }
        let digest: Digest = md.digest.parse().ok()?;
        let encoded = digest.encoded();
        if encoded.len() < 2 {
            return None;
        }
        let link = format!("objects/{}/{}.payload-link", &encoded[..2], &encoded[2..]);
        for repo in &self.ostree_repos {
            let Ok(meta) = repo.metadata(&link) else {
                continue;
            };
            if !meta.is_file() || meta.len() != md.size {
                continue;
            }
            match repo.open(&link) {
                Ok(f) => {
                    return Some(FoundFile {
                        file: f.into_std(),
                        location: format!("OSTree {link}"),
                        hard_link: false,
                    });
                }
                Err(e) => tracing::debug!("layer cache: cannot open {link}: {e}"),
            }
        }
        None
    }

    /// Find a chunk of `size` bytes with digest `chunk_digest` whose content
    /// on disk still matches.
    pub fn find_chunk(&self, chunk_digest: &str, size: u64) -> Option<ChunkOrigin> {
        if chunk_digest.is_empty() {
            return None;
        }
        let expected: Digest = chunk_digest.parse().ok()?;
        for (i, layer) in self.layers.iter().enumerate() {
            let Some(loc) = layer.chunks.get(chunk_digest) else {
                continue;
            };
            if loc.size != size {
                continue;
            }
            let origin = ChunkOrigin {
                layer: i,
                path: loc.path.clone(),
                offset: loc.offset,
            };
            match self.validate_chunk(&origin, size, &expected) {
                Ok(true) => return Some(origin),
                Ok(false) => {
                    tracing::debug!("layer cache: stale chunk {chunk_digest} in {}", layer.id);
                }
                Err(e) => tracing::debug!("layer cache: cannot read {:?}: {e}", loc.path),
            }
        }
        None
    }

    fn validate_chunk(&self, origin: &ChunkOrigin, size: u64, expected: &Digest) -> Result<bool> {
        let mut digester = expected.algorithm_kind().digester();
        let n = io::copy(&mut self.open_chunk(origin)?.take(size), &mut digester)?;
        Ok(n == size && digester.finish() == *expected)
    }

    /// Open the file holding `origin`, positioned at the chunk.
    pub fn open_chunk(&self, origin: &ChunkOrigin) -> Result<File> {
        let layer = self.layers.get(origin.layer).ok_or_else(|| {
            ChunkedError::Inconsistency(format!("no cached layer {}", origin.layer))
        })?;
        let mut file = File::from(open_file_under_root(
            &layer.root,
            &clean_abs_path(&origin.path),
            OFlags::RDONLY | OFlags::NOFOLLOW,
            Mode::empty(),
        )?);
        file.seek(SeekFrom::Start(origin.offset))?;
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std::ambient_authority;

    fn root() -> (tempfile::TempDir, Dir) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        (tmp, dir)
    }

    fn reg(name: &str, content: &[u8]) -> FileMetadata {
        FileMetadata {
            entry_type: EntryType::Reg,
            name: name.into(),
            mode: 0o644,
            size: content.len() as u64,
            uid: rustix::process::getuid().as_raw(),
            gid: rustix::process::getgid().as_raw(),
            digest: Digest::sha256(content).to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_find_file_from_toc() {
        let (_tmp, dir) = root();
        dir.create_dir("usr").unwrap();
        dir.write("usr/data", b"shared bytes").unwrap();
        let mut toc = Toc::new();
        toc.entries.push(reg("usr/data", b"shared bytes"));

        let mut cache = LayerCache::new();
        assert!(cache.is_empty());
        cache.add_layer("base", dir, &toc);

        let mut wanted = reg("other/name", b"shared bytes");
        let mut found = cache.find_file(&wanted, true).unwrap();
        assert!(found.hard_link);
        assert_eq!(found.location, "base:usr/data");
        let mut content = Vec::new();
        found.file.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"shared bytes");

        wanted.mode = 0o755;
        assert!(!cache.find_file(&wanted, true).unwrap().hard_link);
        assert!(cache.find_file(&reg("x", b"other"), false).is_none());
    }

    #[test]
    fn test_find_file_skips_modified_source() {
        let (_tmp, dir) = root();
        dir.write("f", b"changed since").unwrap();
        let mut toc = Toc::new();
        toc.entries.push(reg("f", b"indexed"));
        let mut cache = LayerCache::new();
        cache.add_layer("base", dir, &toc);
        assert!(cache.find_file(&reg("g", b"indexed"), false).is_none());
    }

    #[test]
    fn test_add_tree_hashes_files() {
        let (_tmp, dir) = root();
        dir.create_dir_all("a/b").unwrap();
        dir.write("a/b/c", b"deep content").unwrap();
        dir.write("top", b"top content").unwrap();
        dir.write("empty", b"").unwrap();
        let mut cache = LayerCache::new();
        cache.add_tree("tree", dir).unwrap();

        let found = cache.find_file(&reg("z", b"deep content"), false).unwrap();
        assert_eq!(found.location, "tree:a/b/c");
        assert!(cache.find_file(&reg("z", b"top content"), false).is_some());
    }

    #[test]
    fn test_find_chunk_validates_content() {
        let (_tmp, dir) = root();
        let content = [vec![b'a'; 100], vec![b'b'; 50]].concat();
        dir.write("f", &content).unwrap();
        let mut first = reg("f", &content);
        first.chunk_size = 100;
        first.chunk_digest = Digest::sha256(&content[..100]).to_string();
        let second = FileMetadata {
            entry_type: EntryType::Chunk,
            name: "f".into(),
            chunk_offset: 100,
            chunk_digest: Digest::sha256(&content[100..]).to_string(),
            ..Default::default()
        };
        let mut toc = Toc::new();
        toc.entries.push(first);
        toc.entries.push(second);

        let mut cache = LayerCache::new();
        let (_tmp2, stale) = root();
        stale.write("f", vec![b'x'; 150]).unwrap();
        cache.add_layer("stale", stale, &toc);
        cache.add_layer("base", dir, &toc);

        let digest = Digest::sha256(&[b'b'; 50]).to_string();
        let origin = cache.find_chunk(&digest, 50).unwrap();
        assert_eq!(origin.layer, 1);
        assert_eq!(origin.offset, 100);
        let mut chunk = Vec::new();
        cache.open_chunk(&origin).unwrap().take(50).read_to_end(&mut chunk).unwrap();
        assert_eq!(chunk, vec![b'b'; 50]);

        assert!(cache.find_chunk(&digest, 49).is_none());
        assert!(cache.find_chunk("", 50).is_none());
    }

    #[test]
    fn test_ostree_payload_link() {
        let (_tmp, repo) = root();
        let content = b"ostree object";
        let digest = Digest::sha256(content);
        let encoded = digest.encoded();
        repo.create_dir_all(format!("objects/{}", &encoded[..2])).unwrap();
        repo.write(
            format!("objects/{}/{}.payload-link", &encoded[..2], &encoded[2..]),
            content,
        )
        .unwrap();

        let mut cache = LayerCache::new();
        cache.add_ostree_repo(repo);
        let found = cache.find_file(&reg("f", content), true).unwrap();
        assert!(!found.hard_link);
        assert!(found.location.starts_with("OSTree objects/"));
        assert!(cache.find_file(&reg("f", b"ostree objecT"), false).is_none());
    }
}
