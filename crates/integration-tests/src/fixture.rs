//! Test fixtures: tarballs converted into zstd:chunked blobs on disk.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use cap_std::ambient_authority;
use cap_std::fs::Dir;
use tempfile::TempDir;

use cstor_chunked::SeekableFile;
use cstor_chunked::compressor::{CompressorOptions, ConvertedLayer, compress_tar};

/// Modification time stamped on every fixture entry.
pub const FIXTURE_MTIME: u64 = 1_700_000_000;

/// Builds an in-memory tarball owned by the current user, so extraction
/// works without privileges.
pub struct TarBuilder {
    builder: tar::Builder<Vec<u8>>,
    uid: u64,
    gid: u64,
}

impl Default for TarBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TarBuilder {
    pub fn new() -> Self {
        Self {
            builder: tar::Builder::new(Vec::new()),
            uid: rustix::process::getuid().as_raw().into(),
            gid: rustix::process::getgid().as_raw().into(),
        }
    }

    fn header(&self, entry_type: tar::EntryType, size: u64, mode: u32) -> tar::Header {
        let mut h = tar::Header::new_gnu();
        h.set_entry_type(entry_type);
        h.set_size(size);
        h.set_mode(mode);
        h.set_uid(self.uid);
        h.set_gid(self.gid);
        h.set_mtime(FIXTURE_MTIME);
        h
    }

    pub fn dir(mut self, path: &str, mode: u32) -> io::Result<Self> {
        let mut h = self.header(tar::EntryType::Directory, 0, mode);
        self.builder.append_data(&mut h, path, io::empty())?;
        Ok(self)
    }

    pub fn file(mut self, path: &str, mode: u32, content: &[u8]) -> io::Result<Self> {
        let mut h = self.header(tar::EntryType::Regular, content.len() as u64, mode);
        self.builder.append_data(&mut h, path, content)?;
        Ok(self)
    }

    pub fn symlink(mut self, path: &str, target: &str) -> io::Result<Self> {
        let mut h = self.header(tar::EntryType::Symlink, 0, 0o777);
        self.builder.append_link(&mut h, path, target)?;
        Ok(self)
    }

    pub fn hardlink(mut self, path: &str, target: &str) -> io::Result<Self> {
        let mut h = self.header(tar::EntryType::Link, 0, 0o644);
        self.builder.append_link(&mut h, path, target)?;
        Ok(self)
    }

    pub fn finish(self) -> io::Result<Vec<u8>> {
        self.builder.into_inner()
    }
}

/// A converted layer stored in a temporary directory.
///
/// The directory holds `layer.tar`, `layer.zst` and `annotations.json`, and
/// is removed when dropped.
pub struct TestLayer {
    temp_dir: TempDir,
    /// The original tarball.
    pub tar: Vec<u8>,
    /// What the converter reported.
    pub converted: ConvertedLayer,
}

impl TestLayer {
    /// Convert `tar` with small chunks so multi-chunk files are cheap to
    /// produce.
    pub fn from_tar(tar: Vec<u8>) -> color_eyre::Result<Self> {
        Self::from_tar_with(
            tar,
            &CompressorOptions {
                level: 1,
                chunk_size: 4096,
            },
        )
    }

    pub fn from_tar_with(tar: Vec<u8>, opts: &CompressorOptions) -> color_eyre::Result<Self> {
        let temp_dir = create_real_tmpdir()?;
        let mut blob = Vec::new();
        let converted = compress_tar(&tar[..], &mut blob, opts)?;
        std::fs::write(temp_dir.path().join("layer.tar"), &tar)?;
        std::fs::write(temp_dir.path().join("layer.zst"), &blob)?;
        std::fs::write(
            temp_dir.path().join("annotations.json"),
            serde_json::to_vec(&converted.annotations)?,
        )?;
        Ok(Self {
            temp_dir,
            tar,
            converted,
        })
    }

    /// A small tree covering every entry type extraction supports without
    /// privileges.
    pub fn sample() -> color_eyre::Result<Self> {
        let mut sparse = vec![b'a'; 4096];
        sparse.extend(std::iter::repeat_n(0u8, 3 * 4096));
        sparse.extend_from_slice(b"end");

        let tar = TarBuilder::new()
            .dir("usr/", 0o755)?
            .dir("usr/bin/", 0o755)?
            .file("usr/bin/hello", 0o755, b"#!/bin/sh\necho hello\n")?
            .file("usr/bin/hello-copy", 0o755, b"#!/bin/sh\necho hello\n")?
            .file("usr/empty", 0o600, b"")?
            .file("usr/sparse", 0o644, &sparse)?
            .symlink("usr/bin/hi", "hello")?
            .hardlink("usr/bin/hello-link", "usr/bin/hello")?
            .dir("etc/", 0o700)?
            .file("etc/config", 0o640, b"key=value\n")?
            .finish()?;
        Self::from_tar(tar)
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn tar_path(&self) -> PathBuf {
        self.path().join("layer.tar")
    }

    pub fn blob_path(&self) -> PathBuf {
        self.path().join("layer.zst")
    }

    pub fn annotations_path(&self) -> PathBuf {
        self.path().join("annotations.json")
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.converted.annotations
    }

    pub fn blob(&self) -> color_eyre::Result<SeekableFile> {
        Ok(SeekableFile::open(self.blob_path())?)
    }

    /// Rewrite the blob on disk.
    pub fn replace_blob(&self, data: &[u8]) -> color_eyre::Result<()> {
        std::fs::write(self.blob_path(), data)?;
        Ok(())
    }

    /// Create an empty extraction target next to the blob.
    pub fn output_dir(&self, name: &str) -> color_eyre::Result<(PathBuf, Dir)> {
        let path = self.path().join(name);
        std::fs::create_dir(&path)?;
        let dir = Dir::open_ambient_dir(&path, ambient_authority())?;
        Ok((path, dir))
    }
}

impl std::fmt::Debug for TestLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestLayer")
            .field("path", &self.path())
            .field("toc_digest", &self.converted.toc_digest)
            .finish()
    }
}

/// Create a temporary directory on a real filesystem (not tmpfs).
///
/// Uses TMPDIR if set, otherwise creates in the workspace target directory,
/// which is more likely to support reflinks and sparse files.
pub fn create_real_tmpdir() -> color_eyre::Result<TempDir> {
    if let Ok(tmpdir) = std::env::var("TMPDIR") {
        let path = Path::new(&tmpdir);
        if path.exists() {
            return Ok(TempDir::new_in(path)?);
        }
    }

    let target_dir = workspace_root().join("target").join("test-tmp");
    std::fs::create_dir_all(&target_dir)?;
    Ok(TempDir::new_in(target_dir)?)
}

/// Root of the cargo workspace.
pub fn workspace_root() -> PathBuf {
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .ancestors()
        .nth(2)
        .unwrap_or(manifest_dir)
        .to_path_buf()
}
