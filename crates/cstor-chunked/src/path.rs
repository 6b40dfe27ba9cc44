//! Lexical path normalization for TOC entry names.
//!
//! Names coming from a TOC or tar-split are attacker controlled. Every name is
//! turned into an absolute, traversal-free form before it is used with any
//! `*at` syscall: `../../etc/passwd` becomes `/etc/passwd`, which is then
//! interpreted relative to the extraction root.

use crate::digest::Digest;
use crate::error::{ChunkedError, Result};

/// Clean `path` as if it were rooted at `/`.
///
/// `.` components and repeated slashes are dropped, `..` removes the previous
/// component and is discarded at the root. The result always starts with `/`
/// and never ends with one (except for the root itself).
pub fn clean_abs_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    let mut out = String::with_capacity(path.len() + 1);
    for p in &parts {
        out.push('/');
        out.push_str(p);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Split a cleaned path into its parent directory and final component.
///
/// The parent of a top-level entry is `/`. The returned base is never empty,
/// never contains a slash and is never `..`; the root itself splits into
/// `("/", ".")`.
pub fn split_path(path: &str) -> Result<(String, String)> {
    let path = clean_abs_path(path);
    let (dir, base) = match path.rsplit_once('/') {
        Some((dir, base)) => (dir, base),
        None => ("", path.as_str()),
    };
    let base = if base.is_empty() { "." } else { base };
    let dir = if dir.is_empty() { "/" } else { dir };
    if base.contains('/') || base == ".." {
        return Err(ChunkedError::Format(format!(
            "internal error: split_path({path:?}) produced invalid base {base:?}"
        )));
    }
    Ok((dir.to_string(), base.to_string()))
}

/// Strip the leading slash of a cleaned path so it can be passed to `*at`
/// syscalls relative to a directory descriptor. The root maps to `.`.
pub(crate) fn relative(clean: &str) -> &str {
    match clean.trim_start_matches('/') {
        "" => ".",
        rel => rel,
    }
}

/// Path of a content-addressed object for a validated digest: the first two
/// hex characters form a directory, the remainder the file name.
pub fn regular_file_path_for_digest(digest: &Digest) -> Result<String> {
    if digest.algorithm() != "sha256" {
        return Err(ChunkedError::Format(format!(
            "unexpected digest algorithm {:?}, only sha256 is supported for content paths",
            digest.algorithm()
        )));
    }
    let encoded = digest.encoded();
    Ok(format!("{}/{}", &encoded[..2], &encoded[2..]))
}
