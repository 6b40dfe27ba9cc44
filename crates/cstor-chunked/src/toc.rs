//! Table of Contents (TOC) document model.
//!
//! The TOC is the JSON index embedded in zstd:chunked and estargz layers. It
//! lists every entry of the layer tarball with its metadata and the location
//! of its (individually compressed) content inside the blob.
//!
//! Regular files may be split into chunks. Such a file is represented by a
//! `reg` entry carrying the metadata of the whole file, immediately followed
//! by zero or more `chunk` entries with the same name. When chunk entries are
//! present the `chunk*` fields of the `reg` entry describe its first chunk.
//!
//! # Example
//!
//! ```
//! use cstor_chunked::toc::{EntryType, Toc};
//!
//! let json = br#"{"version":1,"entries":[{"type":"dir","name":"etc/","mode":493}]}"#;
//! let toc = Toc::from_slice(json)?;
//! assert_eq!(toc.entries[0].entry_type, EntryType::Dir);
//! # Ok::<(), cstor_chunked::ChunkedError>(())
//! ```

use std::collections::BTreeMap;
use std::io::Read;

use base64::prelude::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::{Digest, SHA256_EMPTY};
use crate::error::{ChunkedError, Result};

/// PAX record prefix for extended attributes.
const PAX_SCHILY_XATTR: &str = "SCHILY.xattr.";

/// Table of Contents of a chunked layer.
///
/// Keys are matched case-insensitively when parsing; when a document spells
/// the same key twice, the later value wins.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Toc {
    /// Version of the TOC format, must be 1.
    pub version: u32,

    /// File metadata, normally in the order of the original tar stream.
    pub entries: Vec<FileMetadata>,

    /// Digest of the compressed tar-split frame, if the layer has one.
    #[serde(rename = "tarSplitDigest", skip_serializing_if = "Option::is_none")]
    pub tar_split_digest: Option<Digest>,
}

impl Default for Toc {
    fn default() -> Self {
        Self::new()
    }
}

/// Type of a TOC entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    /// Regular file
    #[default]
    Reg,
    /// Hard link to another entry of the layer
    Hardlink,
    /// Character device
    Char,
    /// Block device
    Block,
    /// Directory
    Dir,
    /// FIFO (named pipe)
    Fifo,
    /// Symbolic link
    Symlink,
    /// Continuation chunk of the preceding regular file
    Chunk,
}

impl EntryType {
    /// Map a tar entry type to a TOC type.
    ///
    /// Fails for tar types that cannot appear in a TOC (GNU sparse files,
    /// PAX headers, ...).
    pub fn from_tar(t: tar::EntryType) -> Result<Self> {
        Ok(match t {
            tar::EntryType::Regular => EntryType::Reg,
            tar::EntryType::Link => EntryType::Hardlink,
            tar::EntryType::Char => EntryType::Char,
            tar::EntryType::Block => EntryType::Block,
            tar::EntryType::Directory => EntryType::Dir,
            tar::EntryType::Fifo => EntryType::Fifo,
            tar::EntryType::Symlink => EntryType::Symlink,
            other => {
                return Err(ChunkedError::Format(format!(
                    "unknown tarball type: {:?}",
                    other.as_byte() as char
                )));
            }
        })
    }

    /// Map a TOC type back to a tar entry type.
    pub fn to_tar(self) -> Result<tar::EntryType> {
        Ok(match self {
            EntryType::Reg => tar::EntryType::Regular,
            EntryType::Hardlink => tar::EntryType::Link,
            EntryType::Char => tar::EntryType::Char,
            EntryType::Block => tar::EntryType::Block,
            EntryType::Dir => tar::EntryType::Directory,
            EntryType::Fifo => tar::EntryType::Fifo,
            EntryType::Symlink => tar::EntryType::Symlink,
            EntryType::Chunk => {
                return Err(ChunkedError::Format(
                    "chunk entries have no tar type".to_string(),
                ));
            }
        })
    }

    /// `S_IF*` file type bits for this entry type. Hard links report the bits
    /// of a regular file.
    pub fn st_mode_bits(self) -> Result<u32> {
        Ok(match self {
            EntryType::Reg | EntryType::Hardlink => libc::S_IFREG,
            EntryType::Char => libc::S_IFCHR,
            EntryType::Block => libc::S_IFBLK,
            EntryType::Dir => libc::S_IFDIR,
            EntryType::Fifo => libc::S_IFIFO,
            EntryType::Symlink => libc::S_IFLNK,
            EntryType::Chunk => {
                return Err(ChunkedError::Format("unknown type chunk".to_string()));
            }
        })
    }
}

/// Kind of a file chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkType {
    /// Compressed data stored in the blob.
    #[default]
    #[serde(rename = "")]
    Data,
    /// A run of zero bytes that is never fetched; materialized as a hole.
    #[serde(rename = "zeros")]
    Zeros,
}

impl ChunkType {
    fn is_data(&self) -> bool {
        *self == ChunkType::Data
    }
}

/// One entry of the TOC.
///
/// The generic metadata duplicates what the tar header carries (and must
/// match the tar-split, see [`crate::tar_split::ensure_toc_matches_tar_split`]).
/// `digest`, `offset`, `end_offset` and the `chunk_*` fields locate and
/// authenticate content.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FileMetadata {
    /// Type of this entry.
    #[serde(rename = "type")]
    pub entry_type: EntryType,

    /// Path in the layer, as it appears in the tar header.
    pub name: String,

    /// Link target for symlinks and hardlinks.
    #[serde(rename = "linkName", skip_serializing_if = "String::is_empty")]
    pub linkname: String,

    /// Permission bits (including setuid/setgid/sticky).
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub mode: u32,

    /// Uncompressed size of a regular file.
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub size: u64,

    /// Owner.
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub uid: u32,

    /// Group.
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub gid: u32,

    /// Modification time; absent and the zero time are the same thing.
    #[serde(with = "opt_time", skip_serializing_if = "Option::is_none")]
    pub modtime: Option<DateTime<Utc>>,

    /// Access time.
    #[serde(with = "opt_time", skip_serializing_if = "Option::is_none")]
    pub accesstime: Option<DateTime<Utc>>,

    /// Status change time.
    #[serde(with = "opt_time", skip_serializing_if = "Option::is_none")]
    pub changetime: Option<DateTime<Utc>>,

    /// Major device number.
    #[serde(rename = "devMajor", skip_serializing_if = "is_zero_u32")]
    pub devmajor: u32,

    /// Minor device number.
    #[serde(rename = "devMinor", skip_serializing_if = "is_zero_u32")]
    pub devminor: u32,

    /// Extended attributes, values base64-encoded.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub xattrs: BTreeMap<String, String>,

    /// Digest of the whole file content; empty for non-regular entries.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub digest: String,

    /// Offset of the compressed content in the blob.
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub offset: u64,

    /// End of the compressed content in the blob.
    #[serde(rename = "endOffset", skip_serializing_if = "is_zero_u64")]
    pub end_offset: u64,

    /// Uncompressed size of this chunk.
    #[serde(rename = "chunkSize", skip_serializing_if = "is_zero_u64")]
    pub chunk_size: u64,

    /// Offset of this chunk inside the uncompressed file.
    #[serde(rename = "chunkOffset", skip_serializing_if = "is_zero_u64")]
    pub chunk_offset: u64,

    /// Digest of the uncompressed chunk.
    #[serde(rename = "chunkDigest", skip_serializing_if = "String::is_empty")]
    pub chunk_digest: String,

    /// Data or hole.
    #[serde(rename = "chunkType", skip_serializing_if = "ChunkType::is_data")]
    pub chunk_type: ChunkType,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

/// Optional RFC 3339 timestamps where the zero time (`0001-01-01T00:00:00Z`)
/// reads back as `None`.
pub(crate) mod opt_time {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Seconds from the Unix epoch to 0001-01-01T00:00:00Z.
    const ZERO_TIME_SECS: i64 = -62_135_596_800;

    pub(crate) fn is_zero(t: &DateTime<Utc>) -> bool {
        t.timestamp() == ZERO_TIME_SECS && t.timestamp_subsec_nanos() == 0
    }

    pub(super) fn serialize<S: Serializer>(
        t: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match t {
            Some(t) => serializer.serialize_str(&t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let Some(s) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let t = DateTime::parse_from_rfc3339(&s)
            .map_err(serde::de::Error::custom)?
            .with_timezone(&Utc);
        Ok((!is_zero(&t)).then_some(t))
    }
}

/// Case-insensitive key matching, the way Go's `encoding/json` reads TOCs
/// written by other tools.
mod de {
    use std::fmt;

    use chrono::{DateTime, Utc};
    use serde::de::{Error, IgnoredAny, MapAccess, Visitor};
    use serde::{Deserialize, Deserializer};

    use super::{FileMetadata, Toc, opt_time};

    struct OptTime(Option<DateTime<Utc>>);

    impl<'de> Deserialize<'de> for OptTime {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            opt_time::deserialize(deserializer).map(OptTime)
        }
    }

    impl<'de> Deserialize<'de> for Toc {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserializer.deserialize_map(TocVisitor)
        }
    }

    struct TocVisitor;

    impl<'de> Visitor<'de> for TocVisitor {
        type Value = Toc;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a TOC object")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Toc, A::Error> {
            let mut version = None;
            let mut toc = Toc::new();
            while let Some(key) = map.next_key::<String>()? {
                match key.to_ascii_lowercase().as_str() {
                    "version" => version = Some(map.next_value()?),
                    "entries" => toc.entries = map.next_value()?,
                    "tarsplitdigest" => toc.tar_split_digest = map.next_value()?,
                    _ => {
                        map.next_value::<IgnoredAny>()?;
                    }
                }
            }
            toc.version = version.ok_or_else(|| A::Error::missing_field("version"))?;
            Ok(toc)
        }
    }

    impl<'de> Deserialize<'de> for FileMetadata {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserializer.deserialize_map(EntryVisitor)
        }
    }

    struct EntryVisitor;

    impl<'de> Visitor<'de> for EntryVisitor {
        type Value = FileMetadata;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a TOC entry object")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<FileMetadata, A::Error> {
            let mut md = FileMetadata::default();
            let (mut has_type, mut has_name) = (false, false);
            while let Some(key) = map.next_key::<String>()? {
                match key.to_ascii_lowercase().as_str() {
                    "type" => {
                        md.entry_type = map.next_value()?;
                        has_type = true;
                    }
                    "name" => {
                        md.name = map.next_value()?;
                        has_name = true;
                    }
                    "linkname" => md.linkname = map.next_value()?,
                    "mode" => md.mode = map.next_value()?,
                    "size" => md.size = map.next_value()?,
                    "uid" => md.uid = map.next_value()?,
                    "gid" => md.gid = map.next_value()?,
                    "modtime" => md.modtime = map.next_value::<OptTime>()?.0,
                    "accesstime" => md.accesstime = map.next_value::<OptTime>()?.0,
                    "changetime" => md.changetime = map.next_value::<OptTime>()?.0,
                    "devmajor" => md.devmajor = map.next_value()?,
                    "devminor" => md.devminor = map.next_value()?,
                    "xattrs" => md.xattrs = map.next_value()?,
                    "digest" => md.digest = map.next_value()?,
                    "offset" => md.offset = map.next_value()?,
                    "endoffset" => md.end_offset = map.next_value()?,
                    "chunksize" => md.chunk_size = map.next_value()?,
                    "chunkoffset" => md.chunk_offset = map.next_value()?,
                    "chunkdigest" => md.chunk_digest = map.next_value()?,
                    "chunktype" => md.chunk_type = map.next_value()?,
                    _ => {
                        map.next_value::<IgnoredAny>()?;
                    }
                }
            }
            if !has_type {
                return Err(A::Error::missing_field("type"));
            }
            if !has_name {
                return Err(A::Error::missing_field("name"));
            }
            Ok(md)
        }
    }
}

impl Toc {
    /// Create an empty version 1 TOC.
    pub fn new() -> Self {
        Self {
            version: 1,
            entries: Vec::new(),
            tar_split_digest: None,
        }
    }

    /// Parse a TOC document.
    ///
    /// Rejects any data after the JSON document and any version other
    /// than 1. Empty regular files without a digest get the digest of the
    /// empty string.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let mut toc: Toc = serde_json::from_slice(data)
            .map_err(|e| ChunkedError::Format(format!("unmarshaling TOC: {e}")))?;
        if toc.version != 1 {
            return Err(ChunkedError::Format(format!(
                "unsupported TOC version {}",
                toc.version
            )));
        }
        for e in &mut toc.entries {
            if e.entry_type == EntryType::Reg && e.size == 0 && e.digest.is_empty() {
                e.digest = SHA256_EMPTY.to_string();
            }
        }
        Ok(toc)
    }

    /// Serialize to compact JSON.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Iterate over the primary (non-chunk) entries.
    pub fn primary_entries(&self) -> impl Iterator<Item = &FileMetadata> {
        self.entries
            .iter()
            .filter(|e| e.entry_type != EntryType::Chunk)
    }
}

impl FileMetadata {
    /// Build the metadata a tar entry implies.
    ///
    /// Extended attributes come from `SCHILY.xattr.*` PAX records and are
    /// base64-encoded; timestamps come from PAX records when present and from
    /// the header otherwise. The caller fills in digests, offsets and chunk
    /// information.
    pub fn from_tar_entry<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<Self> {
        let header = entry.header();
        let entry_type = EntryType::from_tar(header.entry_type())?;

        let mut xattrs = BTreeMap::new();
        let mut pax_mtime = None;
        let mut pax_atime = None;
        let mut pax_ctime = None;
        let mut pax_uid = None;
        let mut pax_gid = None;
        if let Some(exts) = entry.pax_extensions()? {
            for ext in exts {
                let ext = ext?;
                let Ok(key) = ext.key() else { continue };
                if let Some(name) = key.strip_prefix(PAX_SCHILY_XATTR) {
                    xattrs.insert(name.to_string(), BASE64_STANDARD.encode(ext.value_bytes()));
                    continue;
                }
                let value = String::from_utf8_lossy(ext.value_bytes()).into_owned();
                match key {
                    "mtime" => pax_mtime = Some(parse_pax_time(&value)?),
                    "atime" => pax_atime = Some(parse_pax_time(&value)?),
                    "ctime" => pax_ctime = Some(parse_pax_time(&value)?),
                    "uid" => pax_uid = value.parse::<u32>().ok(),
                    "gid" => pax_gid = value.parse::<u32>().ok(),
                    _ => {}
                }
            }
        }

        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let header = entry.header();
        let old = header.as_old();
        let field = |raw: &[u8], what: &str| {
            numeric_field(raw).ok_or_else(|| {
                ChunkedError::Format(format!("invalid {what} in tar header for {name:?}"))
            })
        };
        let narrow = |v: u64, what: &str| {
            u32::try_from(v).map_err(|_| {
                ChunkedError::Format(format!("{what} {v} out of range for {name:?}"))
            })
        };
        let mode = narrow(field(&old.mode, "mode")?, "mode")?;
        let uid = pax_uid.map_or_else(|| narrow(field(&old.uid, "uid")?, "uid"), Ok)?;
        let gid = pax_gid.map_or_else(|| narrow(field(&old.gid, "gid")?, "gid"), Ok)?;
        let modtime = match pax_mtime {
            Some(t) => Some(t),
            None => i64::try_from(field(&old.mtime, "mtime")?)
                .ok()
                .and_then(|s| DateTime::from_timestamp(s, 0)),
        };
        let gnu = header.as_gnu();
        let accesstime = pax_atime.or_else(|| {
            gnu.and_then(|g| gnu_time(&g.atime, g.atime()))
        });
        let changetime = pax_ctime.or_else(|| {
            gnu.and_then(|g| gnu_time(&g.ctime, g.ctime()))
        });

        let linkname = entry
            .link_name_bytes()
            .map(|l| String::from_utf8_lossy(&l).into_owned())
            .unwrap_or_default();
        let header = entry.header();

        Ok(FileMetadata {
            entry_type,
            name,
            linkname,
            mode,
            size: entry.size(),
            uid,
            gid,
            modtime: modtime.filter(|t| !opt_time::is_zero(t)),
            accesstime: accesstime.filter(|t| !opt_time::is_zero(t)),
            changetime: changetime.filter(|t| !opt_time::is_zero(t)),
            devmajor: header.device_major().ok().flatten().unwrap_or(0),
            devminor: header.device_minor().ok().flatten().unwrap_or(0),
            xattrs,
            ..Default::default()
        })
    }

    /// Parsed content digest, if the entry has one.
    pub fn parsed_digest(&self) -> Result<Option<Digest>> {
        if self.digest.is_empty() {
            return Ok(None);
        }
        self.digest.parse().map(Some).map_err(|e| {
            ChunkedError::Format(format!(
                "invalid digest {:?} for {:?}: {e}",
                self.digest, self.name
            ))
        })
    }

    /// Decoded extended attributes.
    pub fn decoded_xattrs(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        self.xattrs
            .iter()
            .map(|(k, v)| {
                let data = BASE64_STANDARD
                    .decode(v)
                    .map_err(|e| ChunkedError::Format(format!("decode xattr {k:?}: {e}")))?;
                Ok((k.clone(), data))
            })
            .collect()
    }

    /// Check if this entry is an overlay whiteout (`.wh.<name>`), returning
    /// the whited-out path.
    pub fn whiteout_target(&self) -> Option<String> {
        let (parent, filename) = match self.name.trim_end_matches('/').rsplit_once('/') {
            Some((p, f)) => (Some(p), f),
            None => (None, self.name.as_str()),
        };
        let target = filename.strip_prefix(crate::WHITEOUT_PREFIX)?;
        if filename == crate::OPAQUE_WHITEOUT {
            return None;
        }
        match parent {
            Some(p) => Some(format!("{p}/{target}")),
            None => Some(target.to_string()),
        }
    }

    /// Directory made opaque by this entry, if it is `.wh..wh..opq`.
    pub fn opaque_dir(&self) -> Option<&str> {
        match self.name.rsplit_once('/') {
            Some((parent, f)) if f == crate::OPAQUE_WHITEOUT => Some(parent),
            None if self.name == crate::OPAQUE_WHITEOUT => Some(""),
            _ => None,
        }
    }
}

/// GNU headers carry atime/ctime only when the raw field is populated.
fn gnu_time(raw: &[u8; 12], parsed: std::io::Result<u64>) -> Option<DateTime<Utc>> {
    if raw[0] == 0 {
        return None;
    }
    parsed
        .ok()
        .and_then(|s| DateTime::from_timestamp(s as i64, 0))
}

/// Parse a numeric tar header field.
///
/// A field holding only NULs and spaces reads as 0, as GNU tar and Go's
/// `archive/tar` accept. Base-256 (high bit set) values are decoded; negative
/// ones are rejected.
fn numeric_field(raw: &[u8]) -> Option<u64> {
    let (&first, rest) = raw.split_first()?;
    if first & 0x80 != 0 {
        if first & 0x40 != 0 {
            return None;
        }
        return rest.iter().try_fold(u64::from(first & 0x3f), |acc, &b| {
            acc.checked_mul(256).map(|v| v | u64::from(b))
        });
    }
    let trimmed = std::str::from_utf8(raw)
        .ok()?
        .trim_matches(&[' ', '\0'][..]);
    if trimmed.is_empty() {
        return Some(0);
    }
    u64::from_str_radix(trimmed, 8).ok()
}

/// Parse a PAX time value (`secs[.frac]`, possibly negative).
fn parse_pax_time(s: &str) -> Result<DateTime<Utc>> {
    let bad = || ChunkedError::Format(format!("invalid PAX time {s:?}"));
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (secs, frac) = digits.split_once('.').unwrap_or((digits, ""));
    let secs: i64 = secs.parse().map_err(|_| bad())?;
    let mut nanos: i64 = 0;
    for (i, c) in frac.bytes().take(9).enumerate() {
        if !c.is_ascii_digit() {
            return Err(bad());
        }
        nanos += (c - b'0') as i64 * 10i64.pow(8 - i as u32);
    }
    let (secs, nanos) = if neg {
        if nanos > 0 {
            (-secs - 1, 1_000_000_000 - nanos)
        } else {
            (-secs, 0)
        }
    } else {
        (secs, nanos)
    };
    DateTime::from_timestamp(secs, nanos as u32).ok_or_else(bad)
}
