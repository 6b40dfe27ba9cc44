//! Reading tar-split metadata.
//!
//! A tar-split stream records a tarball minus its file contents, so the exact
//! original bytes can be reassembled later from the extracted files. The
//! stream is NDJSON with two kinds of entries:
//!
//! - Type 1 (File): a tar entry, with its name, content size and the
//!   CRC64-ISO checksum of the content (base64, big-endian) in `payload`
//! - Type 2 (Segment): raw tar bytes (headers, padding, trailer) in base64
//!
//! ```json
//! {"type":2,"payload":"<512-byte header>","position":0}
//! {"type":1,"name":"./etc/hosts","size":123,"payload":"<crc64>","position":1}
//! {"type":2,"payload":"<padding + next header>","position":2}
//! ```
//!
//! Inside a zstd:chunked blob the stream is zstd-compressed; the manifest
//! reader stores it decompressed, so everything here consumes plain NDJSON.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};

use base64::prelude::*;
use cap_std::fs::Dir;
use crc::{CRC_64_GO_ISO, Crc};
use serde::Deserialize;

use crate::error::{ChunkedError, Result};
use crate::path::{clean_abs_path, relative};
use crate::toc::{EntryType, FileMetadata, Toc, opt_time};

/// CRC64-ISO implementation for file checksums.
pub(crate) static CRC64_ISO: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

/// Item of a tar-split stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TarSplitItem {
    /// Raw tar bytes to write out unchanged.
    Segment(Vec<u8>),
    /// A tar entry whose `size` content bytes follow the preceding segment.
    File {
        /// Entry name as recorded in the tar header.
        name: String,
        /// Content size.
        size: u64,
        /// CRC64-ISO of the content; absent for empty entries.
        crc64: Option<u64>,
    },
}

/// Raw tar-split entry from NDJSON format before validation.
#[derive(Debug, Deserialize)]
struct TarSplitEntryRaw {
    /// Entry type discriminant: 1 for File, 2 for Segment.
    #[serde(rename = "type")]
    type_id: u8,
    #[serde(default)]
    name: Option<String>,
    /// Base64 name, used when the name is not valid UTF-8.
    #[serde(default)]
    name_raw: Option<String>,
    #[serde(default)]
    size: Option<i64>,
    /// Segment bytes, or the checksum of a file entry.
    #[serde(default)]
    payload: Option<String>,
    /// Older writers stored file checksums here.
    #[serde(default)]
    crc64: Option<String>,
}

fn decode_b64(what: &str, s: &str) -> Result<Vec<u8>> {
    BASE64_STANDARD
        .decode(s)
        .map_err(|e| ChunkedError::TarSplit(format!("decode base64 {what}: {e}")))
}

impl TarSplitItem {
    fn from_raw(raw: TarSplitEntryRaw) -> Result<Self> {
        match raw.type_id {
            1 => {
                let name = match (raw.name, raw.name_raw) {
                    (Some(name), _) => name,
                    (None, Some(b64)) => {
                        String::from_utf8_lossy(&decode_b64("name", &b64)?).into_owned()
                    }
                    (None, None) => String::new(),
                };
                let size = raw.size.unwrap_or(0);
                let size = u64::try_from(size).map_err(|_| {
                    ChunkedError::TarSplit(format!("invalid size {size} for {name:?}"))
                })?;
                let crc64 = match raw.payload.or(raw.crc64) {
                    Some(b64) if !b64.is_empty() => {
                        let bytes: [u8; 8] =
                            decode_b64("checksum", &b64)?.try_into().map_err(|b: Vec<u8>| {
                                ChunkedError::TarSplit(format!(
                                    "invalid CRC64 length: {} bytes",
                                    b.len()
                                ))
                            })?;
                        Some(u64::from_be_bytes(bytes))
                    }
                    _ => None,
                };
                Ok(TarSplitItem::File { name, size, crc64 })
            }
            2 => {
                let payload = match raw.payload {
                    Some(b64) => decode_b64("payload", &b64)?,
                    None => Vec::new(),
                };
                Ok(TarSplitItem::Segment(payload))
            }
            other => Err(ChunkedError::TarSplit(format!(
                "Invalid tar-split entry type: {other}"
            ))),
        }
    }
}

/// Streaming reader of tar-split NDJSON.
#[derive(Debug)]
pub struct TarSplitReader<R> {
    reader: R,
    line: String,
    entry_count: usize,
}

impl<R: BufRead> TarSplitReader<R> {
    /// Read tar-split entries from `reader`.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            entry_count: 0,
        }
    }

    /// Read the next item; `Ok(None)` at the end of the stream.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<TarSplitItem>> {
        loop {
            self.line.clear();
            let n = self
                .reader
                .read_line(&mut self.line)
                .map_err(|e| ChunkedError::TarSplit(format!("read tar-split line: {e}")))?;
            if n == 0 {
                return Ok(None);
            }
            if self.line.trim().is_empty() {
                continue;
            }
            let raw: TarSplitEntryRaw = serde_json::from_str(&self.line).map_err(|e| {
                ChunkedError::TarSplit(format!("Failed to parse tar-split entry: {e}"))
            })?;
            let item = TarSplitItem::from_raw(raw)?;
            if matches!(item, TarSplitItem::File { .. }) {
                self.entry_count += 1;
            }
            return Ok(Some(item));
        }
    }

    /// Number of file entries read so far.
    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

/// A tar stream made of the recorded segments, with zeros in place of the
/// file contents. Enough to parse every header with [`tar::Archive`].
struct HeaderStream<R> {
    items: TarSplitReader<R>,
    buf: Vec<u8>,
    pos: usize,
    zeros: u64,
}

impl<R: BufRead> Read for HeaderStream<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.buf.len() {
                let n = out.len().min(self.buf.len() - self.pos);
                out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.zeros > 0 {
                let n = out.len().min(usize::try_from(self.zeros).unwrap_or(usize::MAX));
                out[..n].fill(0);
                self.zeros -= n as u64;
                return Ok(n);
            }
            match self.items.next().map_err(io::Error::other)? {
                Some(TarSplitItem::Segment(b)) => {
                    self.buf = b;
                    self.pos = 0;
                }
                Some(TarSplitItem::File { size, .. }) => self.zeros = size,
                None => return Ok(0),
            }
        }
    }
}

/// Call `f` with the metadata of every tar header recorded in a tar-split
/// stream, in order. PAX global headers are skipped.
pub fn iterate_headers<R: BufRead>(
    reader: R,
    mut f: impl FnMut(FileMetadata) -> Result<()>,
) -> Result<()> {
    let stream = HeaderStream {
        items: TarSplitReader::new(reader),
        buf: Vec::new(),
        pos: 0,
        zeros: 0,
    };
    let mut archive = tar::Archive::new(stream);
    let entries = archive
        .entries()
        .map_err(|e| ChunkedError::TarSplit(format!("reading tar-split headers: {e}")))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| ChunkedError::TarSplit(format!("reading tar-split headers: {e}")))?;
        if entry.header().entry_type() == tar::EntryType::XGlobalHeader {
            continue;
        }
        f(FileMetadata::from_tar_entry(&mut entry)?)?;
    }
    Ok(())
}

fn same_time(
    a: &Option<chrono::DateTime<chrono::Utc>>,
    b: &Option<chrono::DateTime<chrono::Utc>>,
) -> bool {
    // The zero time and the Unix epoch both mean "unset".
    let norm = |t: &Option<chrono::DateTime<chrono::Utc>>| {
        t.filter(|t| !opt_time::is_zero(t) && (t.timestamp(), t.timestamp_subsec_nanos()) != (0, 0))
    };
    norm(a) == norm(b)
}

fn ensure_metadata_matches(
    toc: &FileMetadata,
    ts: &FileMetadata,
) -> std::result::Result<(), String> {
    macro_rules! check {
        ($field:ident) => {
            if toc.$field != ts.$field {
                return Err(format!(
                    "mismatch of {} for {:?}: TOC {:?}, tar-split {:?}",
                    stringify!($field),
                    toc.name,
                    toc.$field,
                    ts.$field
                ));
            }
        };
    }
    check!(entry_type);
    check!(name);
    check!(linkname);
    check!(mode);
    check!(size);
    check!(uid);
    check!(gid);
    for (field, a, b) in [
        ("modtime", &toc.modtime, &ts.modtime),
        ("accesstime", &toc.accesstime, &ts.accesstime),
        ("changetime", &toc.changetime, &ts.changetime),
    ] {
        if !same_time(a, b) {
            return Err(format!(
                "mismatch of {field} for {:?}: TOC {a:?}, tar-split {b:?}",
                toc.name
            ));
        }
    }
    check!(devmajor);
    check!(devminor);
    check!(xattrs);
    Ok(())
}

/// Check that the TOC describes exactly the entries recorded in the
/// tar-split, with the same metadata.
///
/// Without this an image could show different contents depending on
/// whether it is pulled partially (TOC) or fully (tar-split).
pub fn ensure_toc_matches_tar_split(toc: &Toc, tar_split: &mut File) -> Result<()> {
    let mut pending: BTreeMap<&str, &FileMetadata> = BTreeMap::new();
    for e in toc.primary_entries() {
        if pending.insert(e.name.as_str(), e).is_some() {
            return Err(ChunkedError::Inconsistency(format!(
                "TOC contains duplicate entries for path {:?}",
                e.name
            )));
        }
    }

    tar_split.seek(SeekFrom::Start(0))?;
    iterate_headers(BufReader::new(&mut *tar_split), |ts| {
        let e = pending.remove(ts.name.as_str()).ok_or_else(|| {
            ChunkedError::Inconsistency(format!(
                "tar-split contains an entry for {:?} missing in TOC",
                ts.name
            ))
        })?;
        ensure_metadata_matches(e, &ts).map_err(|m| {
            ChunkedError::Inconsistency(format!("TOC and tar-split metadata doesn't match: {m}"))
        })
    })?;

    if !pending.is_empty() {
        let remaining: Vec<&str> = pending.keys().take(5).copied().collect();
        return Err(ChunkedError::Inconsistency(format!(
            "TOC contains entries not present in tar-split, incl. {remaining:?}"
        )));
    }
    Ok(())
}

/// Size of the tarball a tar-split stream reassembles to.
pub fn tar_size_from_tar_split<R: BufRead>(reader: R) -> Result<u64> {
    let mut items = TarSplitReader::new(reader);
    let mut size = 0u64;
    while let Some(item) = items.next()? {
        size += match item {
            TarSplitItem::Segment(b) => b.len() as u64,
            TarSplitItem::File { size, .. } => size,
        };
    }
    Ok(size)
}

/// Reassemble the original tarball from a tar-split stream and the files
/// extracted under `root`, verifying each file against its CRC64.
pub fn write_output_tar_stream<R: BufRead, W: Write>(
    reader: R,
    root: &Dir,
    out: &mut W,
) -> Result<()> {
    let mut items = TarSplitReader::new(reader);
    let mut buffer = vec![0u8; 64 * 1024];
    while let Some(item) = items.next()? {
        match item {
            TarSplitItem::Segment(b) => out.write_all(&b)?,
            TarSplitItem::File { size: 0, .. } => {}
            TarSplitItem::File { name, size, crc64 } => {
                let path = clean_abs_path(&name);
                let mut file = root.open(relative(&path)).map_err(|e| {
                    ChunkedError::TarSplit(format!("open {path:?} for tar reassembly: {e}"))
                })?;
                let mut digest = CRC64_ISO.digest();
                let mut remaining = size;
                while remaining > 0 {
                    let want = buffer
                        .len()
                        .min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    let n = file.read(&mut buffer[..want])?;
                    if n == 0 {
                        return Err(ChunkedError::TarSplit(format!(
                            "File size mismatch for {path:?}: expected {size}, got {}",
                            size - remaining
                        )));
                    }
                    digest.update(&buffer[..n]);
                    out.write_all(&buffer[..n])?;
                    remaining -= n as u64;
                }
                let computed = digest.finalize();
                if let Some(expected) = crc64
                    && computed != expected
                {
                    return Err(ChunkedError::TarSplit(format!(
                        "CRC64 mismatch for {path:?}: expected {expected:016x}, got {computed:016x}"
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::tar_split_writer::tar_split_from_tar;
    use cap_std::ambient_authority;
    use std::io::Cursor;

    fn sample_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut h = tar::Header::new_gnu();
        h.set_entry_type(tar::EntryType::Directory);
        h.set_size(0);
        h.set_mode(0o755);
        h.set_mtime(1_700_000_000);
        builder.append_data(&mut h, "etc/", io::empty()).unwrap();

        let data = b"127.0.0.1 localhost\n";
        let mut h = tar::Header::new_gnu();
        h.set_size(data.len() as u64);
        h.set_mode(0o644);
        h.set_mtime(1_700_000_000);
        builder.append_data(&mut h, "etc/hosts", &data[..]).unwrap();

        let mut h = tar::Header::new_gnu();
        h.set_entry_type(tar::EntryType::Symlink);
        h.set_size(0);
        h.set_mode(0o777);
        h.set_mtime(1_700_000_000);
        builder
            .append_link(&mut h, "etc/localhost", "hosts")
            .unwrap();
        builder.into_inner().unwrap()
    }

    fn toc_for(tar: &[u8]) -> Toc {
        let mut toc = Toc::new();
        let mut archive = tar::Archive::new(tar);
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let mut md = FileMetadata::from_tar_entry(&mut entry).unwrap();
            if md.entry_type == EntryType::Reg {
                let mut content = Vec::new();
                entry.read_to_end(&mut content).unwrap();
                md.digest = Digest::sha256(&content).to_string();
            }
            toc.entries.push(md);
        }
        toc
    }

    fn spill(data: &[u8]) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(data).unwrap();
        f
    }

    #[test]
    fn test_tar_split_entry_deserialization() {
        let ndjson = concat!(
            r#"{"type":2,"payload":"aGVsbG8=","position":0}"#,
            "\n",
            r#"{"type":1,"name":"./a","size":5,"payload":"AAAAAAAAAAE=","position":1}"#,
            "\n",
            r#"{"type":1,"name_raw":"Yg==","size":0,"position":2}"#,
            "\n",
            r#"{"type":1,"name":"c","size":1,"crc64":"AAAAAAAAAAI="}"#,
            "\n",
        );
        let mut r = TarSplitReader::new(ndjson.as_bytes());
        assert_eq!(r.next().unwrap(), Some(TarSplitItem::Segment(b"hello".to_vec())));
        assert_eq!(
            r.next().unwrap(),
            Some(TarSplitItem::File {
                name: "./a".into(),
                size: 5,
                crc64: Some(1)
            })
        );
        assert_eq!(
            r.next().unwrap(),
            Some(TarSplitItem::File {
                name: "b".into(),
                size: 0,
                crc64: None
            })
        );
        assert!(matches!(
            r.next().unwrap(),
            Some(TarSplitItem::File { crc64: Some(2), .. })
        ));
        assert_eq!(r.next().unwrap(), None);
        assert_eq!(r.entry_count(), 3);
    }

    #[test]
    fn test_invalid_entries() {
        let mut r = TarSplitReader::new(&br#"{"type":3}"#[..]);
        assert!(matches!(r.next(), Err(ChunkedError::TarSplit(_))));
        let mut r = TarSplitReader::new(&br#"{"type":1,"name":"a","size":-1}"#[..]);
        assert!(r.next().is_err());
        let mut r = TarSplitReader::new(&br#"{"type":1,"name":"a","size":1,"payload":"AA=="}"#[..]);
        assert!(r.next().is_err());
        let mut r = TarSplitReader::new(&b"not json\n"[..]);
        assert!(r.next().is_err());
    }

    #[test]
    fn test_tar_size_from_tar_split() {
        let tar = sample_tar();
        let ts = tar_split_from_tar(&tar[..]).unwrap();
        assert_eq!(tar_size_from_tar_split(&ts[..]).unwrap(), tar.len() as u64);
    }

    #[test]
    fn test_iterate_headers() {
        let tar = sample_tar();
        let ts = tar_split_from_tar(&tar[..]).unwrap();
        let mut seen = Vec::new();
        iterate_headers(&ts[..], |md| {
            seen.push(md);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].entry_type, EntryType::Dir);
        assert!(seen[0].name.starts_with("etc"));
        assert_eq!(seen[1].name, "etc/hosts");
        assert_eq!(seen[1].size, 20);
        assert_eq!(seen[2].entry_type, EntryType::Symlink);
        assert_eq!(seen[2].linkname, "hosts");
        assert_eq!(seen[2].modtime, chrono::DateTime::from_timestamp(1_700_000_000, 0));
    }

    #[test]
    fn test_toc_matches_tar_split() {
        let tar = sample_tar();
        let toc = toc_for(&tar);
        let ts = tar_split_from_tar(&tar[..]).unwrap();
        ensure_toc_matches_tar_split(&toc, &mut spill(&ts)).unwrap();
    }

    #[test]
    fn test_toc_tar_split_mismatches() {
        let tar = sample_tar();
        let ts = tar_split_from_tar(&tar[..]).unwrap();

        let mut toc = toc_for(&tar);
        toc.entries[1].mode = 0o4755;
        let err = ensure_toc_matches_tar_split(&toc, &mut spill(&ts)).unwrap_err();
        assert!(matches!(err, ChunkedError::Inconsistency(_)));
        assert!(err.to_string().contains("mismatch of mode"), "{err}");

        let mut toc = toc_for(&tar);
        toc.entries.pop();
        let err = ensure_toc_matches_tar_split(&toc, &mut spill(&ts)).unwrap_err();
        assert!(err.to_string().contains("missing in TOC"), "{err}");

        let mut toc = toc_for(&tar);
        let mut extra = toc.entries[0].clone();
        extra.name = "var/".into();
        toc.entries.push(extra);
        let err = ensure_toc_matches_tar_split(&toc, &mut spill(&ts)).unwrap_err();
        assert!(err.to_string().contains("not present in tar-split"), "{err}");

        let mut toc = toc_for(&tar);
        let dup = toc.entries[2].clone();
        toc.entries.push(dup);
        let err = ensure_toc_matches_tar_split(&toc, &mut spill(&ts)).unwrap_err();
        assert!(err.to_string().contains("duplicate entries"), "{err}");
    }

    #[test]
    fn test_unset_toc_time_matches_zero_mtime() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut h = tar::Header::new_gnu();
        h.set_size(2);
        h.set_mode(0o644);
        h.set_mtime(0);
        builder.append_data(&mut h, "stamp", &b"ok"[..]).unwrap();
        let tar = builder.into_inner().unwrap();
        let ts = tar_split_from_tar(&tar[..]).unwrap();

        let mut toc = toc_for(&tar);
        toc.entries[0].modtime = None;
        ensure_toc_matches_tar_split(&toc, &mut spill(&ts)).unwrap();

        toc.entries[0].modtime = chrono::DateTime::from_timestamp(1, 0);
        let err = ensure_toc_matches_tar_split(&toc, &mut spill(&ts)).unwrap_err();
        assert!(matches!(err, ChunkedError::Inconsistency(_)), "{err}");
    }

    #[test]
    fn test_zero_and_epoch_times_are_unset() {
        let epoch = chrono::DateTime::from_timestamp(0, 0);
        assert!(same_time(&None, &epoch));
        assert!(!same_time(&None, &chrono::DateTime::from_timestamp(1, 0)));
    }

    #[test]
    fn test_write_output_tar_stream() {
        let tar = sample_tar();
        let ts = tar_split_from_tar(&tar[..]).unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        root.create_dir("etc").unwrap();
        root.write("etc/hosts", b"127.0.0.1 localhost\n").unwrap();

        let mut out = Vec::new();
        write_output_tar_stream(Cursor::new(&ts), &root, &mut out).unwrap();
        assert_eq!(out, tar);

        root.write("etc/hosts", b"127.0.0.2 localhost\n").unwrap();
        let err = write_output_tar_stream(Cursor::new(&ts), &root, &mut Vec::new()).unwrap_err();
        assert!(err.to_string().contains("CRC64 mismatch"), "{err}");

        root.write("etc/hosts", b"short").unwrap();
        let err = write_output_tar_stream(Cursor::new(&ts), &root, &mut Vec::new()).unwrap_err();
        assert!(err.to_string().contains("size mismatch"), "{err}");
    }
}
