//! Rendering a TOC in the composefs dump format.
//!
//! Each line describes one inode, the way `composefs-info dump` prints it:
//!
//! ```text
//! PATH SIZE [@]MODE NLINK UID GID RDEV MTIME PAYLOAD CONTENT DIGEST [XATTR=VALUE...]
//! ```
//!
//! Regular files point at their content-addressed object (`ab/cdef...`) as
//! payload, so the dump can be fed to `mkcomposefs --from-file` against an
//! object store populated from the layer.

use std::collections::BTreeMap;
use std::io::{BufWriter, Write};

use crate::error::{ChunkedError, Result};
use crate::path::{clean_abs_path, regular_file_path_for_digest};
use crate::toc::{EntryType, FileMetadata, Toc};

/// Leave spaces as they are.
const NOESCAPE_SPACE: u8 = 1 << 0;
/// Escape `=` (xattr names and values).
const ESCAPE_EQUAL: u8 = 1 << 1;
/// Escape a value consisting of a single `-`, which would read as "none".
const ESCAPE_LONE_DASH: u8 = 1 << 2;

fn escaped(val: &[u8], escape: u8) -> String {
    if escape & ESCAPE_LONE_DASH != 0 && val == b"-" {
        return "\\x2d".to_string();
    }
    let mut out = String::with_capacity(val.len());
    for &c in val {
        match c {
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b'=' if escape & ESCAPE_EQUAL != 0 => out.push_str("\\x3d"),
            b' ' if escape & NOESCAPE_SPACE != 0 => out.push(' '),
            c if c.is_ascii_graphic() => out.push(c as char),
            c => out.push_str(&format!("\\x{c:02x}")),
        }
    }
    out
}

fn escaped_optional(val: &[u8], escape: u8) -> String {
    if val.is_empty() {
        return "-".to_string();
    }
    escaped(val, escape)
}

struct Dumper<'a, W> {
    out: W,
    added: BTreeMap<String, FileMetadata>,
    links: BTreeMap<String, u32>,
    verity_digests: &'a BTreeMap<String, String>,
}

impl<W: Write> Dumper<'_, W> {
    fn payload(entry: &FileMetadata) -> Result<String> {
        if !entry.linkname.is_empty() {
            return Ok(if entry.entry_type == EntryType::Symlink {
                entry.linkname.clone()
            } else {
                clean_abs_path(&entry.linkname)
            });
        }
        match entry.parsed_digest()? {
            Some(d) => regular_file_path_for_digest(&d),
            None => Ok(String::new()),
        }
    }

    fn node(&mut self, entry: &FileMetadata) -> Result<()> {
        let path = clean_abs_path(&entry.name);
        if path != "/" {
            let parent = match path.rsplit_once('/') {
                Some(("", _)) | None => "/".to_string(),
                Some((p, _)) => p.to_string(),
            };
            if !self.added.contains_key(&parent) {
                self.node(&FileMetadata {
                    entry_type: EntryType::Dir,
                    name: parent,
                    mode: 0o755,
                    ..Default::default()
                })?;
            }
        }
        if let Some(prev) = self.added.get(&path) {
            if prev != entry {
                return Err(ChunkedError::Format(format!(
                    "entry {path:?} already added with different data"
                )));
            }
            return Ok(());
        }
        self.added.insert(path.clone(), entry.clone());

        let nlinks = 1
            + self.links.get(&path).copied().unwrap_or(0)
            + if entry.linkname.is_empty() {
                0
            } else {
                self.links
                    .get(&clean_abs_path(&entry.linkname))
                    .copied()
                    .unwrap_or(0)
            };
        let at = if entry.entry_type == EntryType::Hardlink {
            "@"
        } else {
            ""
        };
        let mode = entry.mode | entry.entry_type.st_mode_bits()?;
        let rdev = rustix::fs::makedev(entry.devmajor, entry.devminor);
        let (secs, nanos) = entry
            .modtime
            .map(|t| (t.timestamp(), t.timestamp_subsec_nanos()))
            .unwrap_or((0, 0));
        let payload = Self::payload(entry)?;
        let digest = self
            .verity_digests
            .get(&payload)
            .map(String::as_str)
            .unwrap_or("");

        write!(
            self.out,
            "{} {} {at}{mode:o} {nlinks} {} {} {rdev} {secs}.{nanos} {} - {}",
            escaped(path.as_bytes(), 0),
            entry.size,
            entry.uid,
            entry.gid,
            escaped_optional(payload.as_bytes(), ESCAPE_LONE_DASH),
            escaped_optional(digest.as_bytes(), ESCAPE_LONE_DASH),
        )?;
        for (k, v) in entry.decoded_xattrs()? {
            write!(
                self.out,
                " {}={}",
                escaped(k.as_bytes(), ESCAPE_EQUAL),
                escaped(&v, ESCAPE_EQUAL)
            )?;
        }
        writeln!(self.out)?;
        Ok(())
    }
}

/// Write the composefs dump of `toc` to `out`.
///
/// `verity_digests` maps payload paths to their fs-verity digests; files
/// without one get `-`. Parent directories missing from the TOC are emitted
/// with mode 0755.
pub fn generate_dump<W: Write>(
    toc: &Toc,
    verity_digests: &BTreeMap<String, String>,
    out: W,
) -> Result<()> {
    let mut links: BTreeMap<String, u32> = BTreeMap::new();
    for e in &toc.entries {
        if e.linkname.is_empty() || e.entry_type == EntryType::Symlink {
            continue;
        }
        *links.entry(clean_abs_path(&e.linkname)).or_default() += 1;
    }

    let mut dumper = Dumper {
        out: BufWriter::new(out),
        added: BTreeMap::new(),
        links,
        verity_digests,
    };
    if toc.entries.is_empty() {
        dumper.node(&FileMetadata {
            entry_type: EntryType::Dir,
            name: "/".to_string(),
            mode: 0o755,
            ..Default::default()
        })?;
    }
    for e in toc.entries.iter().filter(|e| e.entry_type != EntryType::Chunk) {
        dumper.node(e)?;
    }
    dumper.out.flush()?;
    Ok(())
}
