//! Sandboxed filesystem primitives for materializing TOC entries.
//!
//! Every path is resolved relative to a root directory descriptor and may
//! never escape it, even through symlinks planted by earlier entries of the
//! same layer. Resolution uses `openat2(RESOLVE_IN_ROOT)` when the kernel has
//! it, and otherwise walks the path in userspace and verifies the opened
//! descriptor through `/proc/self/fd`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};

use rustix::fs::{
    AtFlags, FileType, Gid, Mode, OFlags, ResolveFlags, Timespec, Timestamps, UTIME_OMIT, Uid,
    XattrFlags,
};
use rustix::io::Errno;

use crate::error::{ChunkedError, Result};
use crate::path::{clean_abs_path, relative, split_path};
use crate::toc::{EntryType, FileMetadata};

/// Flags used to create the destination of a regular file.
pub(crate) const NEW_FILE_FLAGS: OFlags = OFlags::CREATE
    .union(OFlags::TRUNC)
    .union(OFlags::EXCL)
    .union(OFlags::WRONLY)
    .union(OFlags::CLOEXEC);

/// Mode of parent directories created implicitly.
const IMPLICIT_DIR_MODE: u32 = 0o755;

/// Extended attributes that are never applied from a layer.
const XATTRS_TO_IGNORE: &[&str] = &["security.selinux"];

/// Upper bound on symlinks followed while resolving one path without openat2.
const MAX_SYMLINKS: usize = 255;

/// Sticky flag, cleared the first time openat2 reports ENOSYS.
static USE_OPENAT2: AtomicBool = AtomicBool::new(true);

/// How overlay whiteouts found in a layer are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WhiteoutFormat {
    /// Keep `.wh.*` entries as ordinary files.
    #[default]
    Aufs,
    /// Turn `.wh.<name>` into a 0:0 character device and `.wh..wh..opq` into
    /// the `trusted.overlay.opaque` xattr on the parent.
    Overlay,
}

/// Ownership and error policy for attribute application.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttrOptions {
    /// Ignore chown failures (rootless extraction without enough IDs).
    pub ignore_chown_errors: bool,
}

fn proc_fd_path(fd: BorrowedFd<'_>) -> String {
    format!("/proc/self/fd/{}", fd.as_raw_fd())
}

fn can_ignore(err: Errno) -> bool {
    err == Errno::NOSYS || err == Errno::OPNOTSUPP
}

/// Open `name` under `dirfd` with a kernel-confined resolution, falling back
/// to the userspace walk if openat2 is missing.
fn open_under_root_raw(
    dirfd: BorrowedFd<'_>,
    name: &str,
    flags: OFlags,
    mode: Mode,
) -> std::result::Result<OwnedFd, Errno> {
    if USE_OPENAT2.load(Ordering::Relaxed) {
        match rustix::fs::openat2(
            dirfd,
            name,
            flags | OFlags::CLOEXEC,
            mode,
            ResolveFlags::IN_ROOT,
        ) {
            Err(Errno::NOSYS) => {
                tracing::debug!("openat2 not supported, resolving paths in userspace");
                USE_OPENAT2.store(false, Ordering::Relaxed);
            }
            res => return res,
        }
    }
    open_under_root_fallback(dirfd, name, flags, mode)
}

/// Resolve `name` lexically under `dirfd`, expanding symlinks as if `dirfd`
/// were `/`. The result is a relative path with no symlink components left
/// (the final component may be missing).
fn secure_join(dirfd: BorrowedFd<'_>, name: &str) -> std::result::Result<String, Errno> {
    let mut resolved: Vec<String> = Vec::new();
    let mut pending: Vec<String> = name.split('/').rev().map(str::to_string).collect();
    let mut links = 0;
    while let Some(comp) = pending.pop() {
        match comp.as_str() {
            "" | "." => continue,
            ".." => {
                resolved.pop();
                continue;
            }
            _ => {}
        }
        let mut candidate = resolved.join("/");
        if !candidate.is_empty() {
            candidate.push('/');
        }
        candidate.push_str(&comp);
        match rustix::fs::readlinkat(dirfd, candidate.as_str(), Vec::new()) {
            Ok(target) => {
                links += 1;
                if links > MAX_SYMLINKS {
                    return Err(Errno::LOOP);
                }
                let target = target.to_string_lossy().into_owned();
                if target.starts_with('/') {
                    resolved.clear();
                }
                pending.extend(target.split('/').rev().map(str::to_string));
            }
            Err(Errno::INVAL) | Err(Errno::NOENT) | Err(Errno::NOTDIR) => resolved.push(comp),
            Err(e) => return Err(e),
        }
    }
    if resolved.is_empty() {
        return Ok(".".to_string());
    }
    Ok(resolved.join("/"))
}

fn open_under_root_fallback(
    dirfd: BorrowedFd<'_>,
    name: &str,
    flags: OFlags,
    mode: Mode,
) -> std::result::Result<OwnedFd, Errno> {
    let root_target = rustix::fs::readlinkat(rustix::fs::CWD, proc_fd_path(dirfd), Vec::new())?
        .to_string_lossy()
        .into_owned();

    let fd = if flags.contains(OFlags::NOFOLLOW) {
        // Only the parent is resolved; the last component is opened as is.
        let clean = clean_abs_path(name);
        let (parent, base) = split_path(&clean).map_err(|_| Errno::INVAL)?;
        if parent == "/" {
            rustix::fs::openat(dirfd, base.as_str(), flags | OFlags::CLOEXEC, mode)?
        } else {
            let parent = secure_join(dirfd, &parent)?;
            let parent_fd = rustix::fs::openat(
                dirfd,
                parent.as_str(),
                OFlags::DIRECTORY | OFlags::RDONLY | OFlags::CLOEXEC,
                Mode::empty(),
            )?;
            rustix::fs::openat(&parent_fd, base.as_str(), flags | OFlags::CLOEXEC, mode)?
        }
    } else {
        let path = secure_join(dirfd, name)?;
        rustix::fs::openat(dirfd, path.as_str(), flags | OFlags::CLOEXEC, mode)?
    };

    let target = rustix::fs::readlinkat(rustix::fs::CWD, proc_fd_path(fd.as_fd()), Vec::new())?
        .to_string_lossy()
        .into_owned();
    let inside = root_target == "/"
        || target == root_target
        || target
            .strip_prefix(root_target.as_str())
            .is_some_and(|rest| rest.starts_with('/'));
    if !inside {
        tracing::warn!("{name:?} resolves outside the root directory ({target:?})");
        return Err(Errno::XDEV);
    }
    Ok(fd)
}

/// Open `name` under the root `dirfd`. With `O_CREAT`, missing parent
/// directories are created.
pub fn open_file_under_root(
    dirfd: impl AsFd,
    name: &str,
    flags: OFlags,
    mode: Mode,
) -> Result<OwnedFd> {
    let dirfd = dirfd.as_fd();
    if name.is_empty() {
        return rustix::io::fcntl_dupfd_cloexec(dirfd, 0)
            .map_err(|e| ChunkedError::fs("dup", "/", e));
    }
    match open_under_root_raw(dirfd, name, flags, mode) {
        Ok(fd) => Ok(fd),
        Err(Errno::NOENT) if flags.contains(OFlags::CREATE) => {
            let (parent, base) = split_path(name)?;
            let parent_fd = open_or_create_dir_under_root(dirfd, &parent)?;
            open_under_root_raw(parent_fd.as_fd(), &base, flags, mode)
                .map_err(|e| ChunkedError::fs("open", name, e))
        }
        Err(e) => Err(ChunkedError::fs("open", name, e)),
    }
}

/// Open the directory `name` under the root, creating it and any missing
/// parents.
pub fn open_or_create_dir_under_root(dirfd: impl AsFd, name: &str) -> Result<OwnedFd> {
    let dirfd = dirfd.as_fd();
    let dir_flags = OFlags::DIRECTORY | OFlags::RDONLY;
    match open_under_root_raw(dirfd, name, dir_flags, Mode::empty()) {
        Ok(fd) => Ok(fd),
        Err(Errno::NOENT) => {
            let clean = clean_abs_path(name);
            if clean == "/" {
                return Err(ChunkedError::fs("open", name, Errno::NOENT));
            }
            let (parent, base) = split_path(&clean)?;
            let parent_fd = open_or_create_dir_under_root(dirfd, &parent)?;
            let mode = Mode::from_raw_mode(IMPLICIT_DIR_MODE);
            match rustix::fs::mkdirat(&parent_fd, base.as_str(), mode) {
                Ok(()) | Err(Errno::EXIST) => {}
                Err(e) => return Err(ChunkedError::fs("mkdirat", clean, e)),
            }
            open_under_root_raw(parent_fd.as_fd(), &base, dir_flags, Mode::empty())
                .map_err(|e| ChunkedError::fs("open", clean, e))
        }
        Err(e) => Err(ChunkedError::fs("open", name, e)),
    }
}

/// Open the parent directory of `name` (creating it if needed) and return it
/// with the final component.
fn open_parent(dirfd: BorrowedFd<'_>, name: &str) -> Result<(Option<OwnedFd>, String)> {
    let (parent, base) = split_path(name)?;
    if parent == "/" {
        return Ok((None, base));
    }
    Ok((Some(open_or_create_dir_under_root(dirfd, &parent)?), base))
}

fn to_timespec(t: &Option<chrono::DateTime<chrono::Utc>>) -> Timespec {
    match t {
        Some(t) if !crate::toc::opt_time::is_zero(t) => Timespec {
            tv_sec: t.timestamp(),
            tv_nsec: t.timestamp_subsec_nanos() as _,
        },
        _ => Timespec {
            tv_sec: 0,
            tv_nsec: UTIME_OMIT,
        },
    }
}

/// Turn a chown result into the error to report.
///
/// EINVAL means the owner is not mapped in the current user namespace.
fn check_chown(
    res: rustix::io::Result<()>,
    name: &str,
    metadata: &FileMetadata,
    opts: &AttrOptions,
) -> Result<()> {
    let Err(e) = res else {
        return Ok(());
    };
    if opts.ignore_chown_errors {
        tracing::debug!(
            "ignoring chown {name:?} to {}:{}: {e}",
            metadata.uid,
            metadata.gid
        );
        Ok(())
    } else if e == Errno::INVAL {
        Err(ChunkedError::IdMapping {
            uid: metadata.uid,
            gid: metadata.gid,
            path: name.into(),
            source: e,
        })
    } else {
        Err(ChunkedError::fs("chown", name, e))
    }
}

/// Apply ownership, xattrs, timestamps and mode to an entry.
///
/// With `use_path` the attributes are applied through the parent directory
/// without following the final component; that is the only correct mode for
/// symlinks and the only possible one for device nodes. Otherwise `file`
/// must be an open descriptor of the entry.
pub fn set_file_attrs(
    dirfd: impl AsFd,
    file: Option<BorrowedFd<'_>>,
    mode: u32,
    metadata: &FileMetadata,
    opts: &AttrOptions,
    use_path: bool,
) -> Result<()> {
    let dirfd = dirfd.as_fd();
    let name = clean_abs_path(&metadata.name);
    let mode = Mode::from_raw_mode(mode & 0o7777);

    enum Target<'a> {
        Path(OwnedFd, String),
        Fd(BorrowedFd<'a>),
    }
    let target = match (use_path, file) {
        (false, Some(fd)) => Target::Fd(fd),
        _ => {
            let (parent, base) = split_path(&name)?;
            let parent_fd = open_file_under_root(
                dirfd,
                &parent,
                OFlags::PATH | OFlags::DIRECTORY,
                Mode::empty(),
            )?;
            Target::Path(parent_fd, base)
        }
    };

    let uid = Some(Uid::from_raw(metadata.uid));
    let gid = Some(Gid::from_raw(metadata.gid));
    let chown = match &target {
        Target::Path(parent, base) => {
            rustix::fs::chownat(parent, base.as_str(), uid, gid, AtFlags::SYMLINK_NOFOLLOW)
        }
        Target::Fd(fd) => rustix::fs::chownat(fd, "", uid, gid, AtFlags::EMPTY_PATH),
    };
    check_chown(chown, &name, metadata, opts)?;

    for (k, v) in metadata.decoded_xattrs()? {
        if XATTRS_TO_IGNORE.contains(&k.as_str()) {
            continue;
        }
        let res = match &target {
            Target::Path(parent, base) => rustix::fs::lsetxattr(
                format!("{}/{base}", proc_fd_path(parent.as_fd())),
                k.as_str(),
                &v,
                XattrFlags::empty(),
            ),
            Target::Fd(fd) => rustix::fs::fsetxattr(fd, k.as_str(), &v, XattrFlags::empty()),
        };
        match res {
            Ok(()) => {}
            Err(e) if can_ignore(e) => {
                tracing::debug!("ignoring xattr {k} on {name:?}: {e}");
            }
            Err(e) => return Err(ChunkedError::fs("setxattr", name, e)),
        }
    }

    let times = Timestamps {
        last_access: to_timespec(&metadata.accesstime),
        last_modification: to_timespec(&metadata.modtime),
    };
    let res = match &target {
        Target::Path(parent, base) => {
            rustix::fs::utimensat(parent, base.as_str(), &times, AtFlags::SYMLINK_NOFOLLOW)
        }
        Target::Fd(fd) => rustix::fs::futimens(fd, &times),
    };
    match res {
        Ok(()) => {}
        Err(e) if can_ignore(e) => {}
        Err(e) => return Err(ChunkedError::fs("utimensat", name, e)),
    }

    let res = match &target {
        Target::Path(parent, base) => {
            rustix::fs::chmodat(parent, base.as_str(), mode, AtFlags::SYMLINK_NOFOLLOW)
        }
        Target::Fd(fd) => rustix::fs::fchmod(fd, mode),
    };
    match res {
        Ok(()) => Ok(()),
        Err(e) if can_ignore(e) => Ok(()),
        Err(e) => Err(ChunkedError::fs("chmod", name, e)),
    }
}

/// Create a directory (an existing one is fine) and apply its attributes.
pub fn safe_mkdir(dirfd: impl AsFd, metadata: &FileMetadata, opts: &AttrOptions) -> Result<()> {
    let dirfd = dirfd.as_fd();
    let name = clean_abs_path(&metadata.name);
    let (parent, base) = open_parent(dirfd, &name)?;
    let parent_fd = parent.as_ref().map(|f| f.as_fd()).unwrap_or(dirfd);
    let mode = Mode::from_raw_mode(metadata.mode & 0o7777);
    match rustix::fs::mkdirat(parent_fd, base.as_str(), mode) {
        Ok(()) | Err(Errno::EXIST) => {}
        Err(e) => return Err(ChunkedError::fs("mkdirat", name, e)),
    }
    let dir = open_file_under_root(
        parent_fd,
        &base,
        OFlags::DIRECTORY | OFlags::RDONLY,
        Mode::empty(),
    )?;
    set_file_attrs(dirfd, Some(dir.as_fd()), metadata.mode, metadata, opts, false)
}

/// Hard link `src` to `dest_base` in `dest_dir`, replacing an existing entry.
///
/// Goes through `/proc/self/fd` so it works without CAP_DAC_READ_SEARCH.
pub(crate) fn do_hard_link(
    src: BorrowedFd<'_>,
    dest_dir: BorrowedFd<'_>,
    dest_base: &str,
) -> std::result::Result<(), Errno> {
    let link = || {
        rustix::fs::linkat(
            rustix::fs::CWD,
            proc_fd_path(src),
            dest_dir,
            dest_base,
            AtFlags::SYMLINK_FOLLOW,
        )
    };
    match link() {
        Err(Errno::EXIST) => {
            rustix::fs::unlinkat(dest_dir, dest_base, AtFlags::empty())?;
            link()
        }
        res => res,
    }
}

/// Create a hard link entry pointing at an entry of the same layer.
pub fn safe_link(dirfd: impl AsFd, metadata: &FileMetadata, opts: &AttrOptions) -> Result<()> {
    let dirfd = dirfd.as_fd();
    let name = clean_abs_path(&metadata.name);
    let target = clean_abs_path(&metadata.linkname);
    let source = open_file_under_root(
        dirfd,
        &target,
        OFlags::PATH | OFlags::RDONLY | OFlags::NOFOLLOW,
        Mode::empty(),
    )?;
    let (parent, base) = open_parent(dirfd, &name)?;
    let parent_fd = parent.as_ref().map(|f| f.as_fd()).unwrap_or(dirfd);
    do_hard_link(source.as_fd(), parent_fd, &base).map_err(|e| {
        ChunkedError::fs("link", format!("{name} -> {target}"), e)
    })?;

    // Only regular files are reopened; anything else (symlinks, FIFOs) is
    // handled by path.
    let is_reg = rustix::fs::fstat(&source)
        .map(|st| FileType::from_raw_mode(st.st_mode) == FileType::RegularFile)
        .map_err(|e| ChunkedError::fs("stat", &target, e))?;
    if is_reg {
        match open_under_root_raw(dirfd, &name, OFlags::WRONLY | OFlags::NOFOLLOW, Mode::empty()) {
            Ok(f) => {
                return set_file_attrs(dirfd, Some(f.as_fd()), metadata.mode, metadata, opts, false);
            }
            Err(Errno::LOOP) | Err(Errno::ACCESS) => {}
            Err(e) => return Err(ChunkedError::fs("open", name, e)),
        }
    }
    set_file_attrs(dirfd, None, metadata.mode, metadata, opts, true)
}

/// Create a symlink and apply its attributes by path.
pub fn safe_symlink(dirfd: impl AsFd, metadata: &FileMetadata, opts: &AttrOptions) -> Result<()> {
    let dirfd = dirfd.as_fd();
    let name = clean_abs_path(&metadata.name);
    let (parent, base) = open_parent(dirfd, &name)?;
    let parent_fd = parent.as_ref().map(|f| f.as_fd()).unwrap_or(dirfd);
    rustix::fs::symlinkat(metadata.linkname.as_str(), parent_fd, base.as_str())
        .map_err(|e| ChunkedError::fs("symlinkat", &name, e))?;
    set_file_attrs(dirfd, None, metadata.mode, metadata, opts, true)
}

/// Create a character device, block device or FIFO.
pub fn safe_mknod(dirfd: impl AsFd, metadata: &FileMetadata, opts: &AttrOptions) -> Result<()> {
    let dirfd = dirfd.as_fd();
    let name = clean_abs_path(&metadata.name);
    let file_type = match metadata.entry_type {
        EntryType::Char => FileType::CharacterDevice,
        EntryType::Block => FileType::BlockDevice,
        EntryType::Fifo => FileType::Fifo,
        other => {
            return Err(ChunkedError::Format(format!(
                "cannot create {other:?} entry {name:?} as a device"
            )));
        }
    };
    let (parent, base) = open_parent(dirfd, &name)?;
    let parent_fd = parent.as_ref().map(|f| f.as_fd()).unwrap_or(dirfd);
    rustix::fs::mknodat(
        parent_fd,
        base.as_str(),
        file_type,
        Mode::from_raw_mode(metadata.mode & 0o7777),
        rustix::fs::makedev(metadata.devmajor, metadata.devminor),
    )
    .map_err(|e| ChunkedError::fs("mknodat", &name, e))?;
    set_file_attrs(dirfd, None, metadata.mode, metadata, opts, true)
}

/// Create an empty regular file and apply its attributes.
pub fn create_empty_file(
    dirfd: impl AsFd,
    metadata: &FileMetadata,
    opts: &AttrOptions,
) -> Result<()> {
    let dirfd = dirfd.as_fd();
    let name = clean_abs_path(&metadata.name);
    let file = open_file_under_root(dirfd, &name, NEW_FILE_FLAGS, Mode::empty())?;
    set_file_attrs(dirfd, Some(file.as_fd()), metadata.mode, metadata, opts, false)
}

/// Apply the overlay whiteout conversion to `metadata`.
///
/// Returns whether the entry must still be written as is.
pub fn convert_whiteout(
    dirfd: impl AsFd,
    format: WhiteoutFormat,
    metadata: &FileMetadata,
    opts: &AttrOptions,
) -> Result<bool> {
    if format != WhiteoutFormat::Overlay {
        return Ok(true);
    }
    let dirfd = dirfd.as_fd();
    if let Some(dir) = metadata.opaque_dir() {
        let dir_fd = open_or_create_dir_under_root(dirfd, &clean_abs_path(dir))?;
        rustix::fs::fsetxattr(&dir_fd, "trusted.overlay.opaque", b"y", XattrFlags::empty())
            .map_err(|e| ChunkedError::fs("setxattr", clean_abs_path(dir), e))?;
        return Ok(false);
    }
    if let Some(target) = metadata.whiteout_target() {
        let target = clean_abs_path(&target);
        let (parent, base) = open_parent(dirfd, &target)?;
        let parent_fd = parent.as_ref().map(|f| f.as_fd()).unwrap_or(dirfd);
        rustix::fs::mknodat(
            parent_fd,
            base.as_str(),
            FileType::CharacterDevice,
            Mode::empty(),
            rustix::fs::makedev(0, 0),
        )
        .map_err(|e| ChunkedError::fs("mknod", &target, e))?;
        let fd = open_file_under_root(dirfd, &target, OFlags::PATH, Mode::empty())?;
        let chown = rustix::fs::chownat(
            &fd,
            "",
            Some(Uid::from_raw(metadata.uid)),
            Some(Gid::from_raw(metadata.gid)),
            AtFlags::EMPTY_PATH,
        );
        check_chown(chown, &target, metadata, opts)?;
        return Ok(false);
    }
    Ok(true)
}

/// Extend `file` by a hole of `size` bytes at the current position.
pub fn append_hole(file: &mut File, size: u64) -> io::Result<()> {
    let delta = i64::try_from(size).map_err(io::Error::other)?;
    let off = file.seek(SeekFrom::Current(delta))?;
    // Needed when the hole is the last thing written to the file.
    file.set_len(off)
}

/// How the content of a duplicate file was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// Hard link to the source; attributes must not be applied again.
    Hardlinked(u64),
    /// FICLONE shared the extents of the source.
    Reflinked(u64),
    /// Data was copied.
    Copied(u64),
}

/// Check if an error indicates reflink is not supported on this filesystem.
fn is_reflink_unavailable(errno: Errno) -> bool {
    errno == Errno::OPNOTSUPP || errno == Errno::XDEV || errno == Errno::INVAL
}

/// Check if an error indicates hardlink is not supported/allowed.
fn is_hardlink_unavailable(errno: Errno) -> bool {
    errno == Errno::XDEV || errno == Errno::PERM || errno == Errno::OPNOTSUPP
}

/// Materialize `name` with the content of the already extracted `src`.
///
/// With `hard_link` a link is tried first. Otherwise (or when linking is not
/// possible) a new file is created and filled by reflink when `reflink` is
/// set, then `copy_file_range`, then plain read/write. The returned file is
/// the new destination, open for writing, if one was created.
pub fn copy_file_content(
    dirfd: impl AsFd,
    src: &File,
    name: &str,
    hard_link: bool,
    reflink: bool,
) -> Result<(Option<File>, CopyOutcome)> {
    let dirfd = dirfd.as_fd();
    let name = clean_abs_path(name);
    let size = src.metadata()?.len();

    if hard_link {
        let (parent, base) = open_parent(dirfd, &name)?;
        let parent_fd = parent.as_ref().map(|f| f.as_fd()).unwrap_or(dirfd);
        match do_hard_link(src.as_fd(), parent_fd, &base) {
            Ok(()) => return Ok((None, CopyOutcome::Hardlinked(size))),
            Err(e) if is_hardlink_unavailable(e) => {
                tracing::debug!("hardlink not available ({e}), falling back to copy for {name:?}");
            }
            Err(e) => return Err(ChunkedError::fs("link", name, e)),
        }
    }

    let mut dest = File::from(open_file_under_root(
        dirfd,
        &name,
        NEW_FILE_FLAGS,
        Mode::empty(),
    )?);

    if reflink {
        match rustix::fs::ioctl_ficlone(&dest, src) {
            Ok(()) => return Ok((Some(dest), CopyOutcome::Reflinked(size))),
            Err(e) if is_reflink_unavailable(e) => {
                tracing::debug!("reflink not available ({e}), falling back to copy for {name:?}");
            }
            Err(e) => return Err(ChunkedError::fs("ficlone", name, e)),
        }
    }

    let mut copied = 0u64;
    let mut use_range = true;
    while copied < size {
        let want = usize::try_from(size - copied).unwrap_or(usize::MAX);
        let mut off_in = copied;
        match rustix::fs::copy_file_range(src, Some(&mut off_in), &dest, None, want) {
            Ok(0) => {
                tracing::debug!("copy_file_range stopped at {copied} of {size} bytes for {name:?}");
                use_range = false;
                break;
            }
            Ok(n) => copied += n as u64,
            Err(e) => {
                tracing::debug!("copy_file_range failed ({e}), copying {name:?} by hand");
                use_range = false;
                break;
            }
        }
    }
    if !use_range {
        copied = copy_by_hand(src, &mut dest, size, &name)?;
    }
    Ok((Some(dest), CopyOutcome::Copied(copied)))
}

/// Copy `size` bytes of `src` into `dest` from the start of both, discarding
/// whatever `dest` held.
fn copy_by_hand(src: &File, dest: &mut File, size: u64, name: &str) -> Result<u64> {
    dest.set_len(0)?;
    dest.seek(SeekFrom::Start(0))?;
    let mut reader = src.try_clone()?;
    reader.seek(SeekFrom::Start(0))?;
    let copied = io::copy(&mut reader.by_ref().take(size), dest)?;
    if copied != size {
        return Err(ChunkedError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short copy for {name:?}: {copied} of {size} bytes"),
        )));
    }
    Ok(copied)
}

/// Two entries can share an inode only if every attribute the link would
/// carry is identical.
pub fn can_dedup_metadata_with_hard_link(a: &FileMetadata, b: &FileMetadata) -> bool {
    a.uid == b.uid
        && a.gid == b.gid
        && a.mode == b.mode
        && a.modtime == b.modtime
        && a.xattrs == b.xattrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std::ambient_authority;
    use cap_std::fs::Dir;
    use std::io::Write;
    use cap_std::fs::{FileTypeExt, MetadataExt};

    fn root() -> (tempfile::TempDir, Dir) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        (tmp, dir)
    }

    /// cap-std refuses absolute and escaping targets, so go through rustix.
    fn symlink(dir: &Dir, target: &str, name: &str) {
        rustix::fs::symlinkat(target, dir, name).unwrap();
    }

    fn opts() -> AttrOptions {
        AttrOptions {
            ignore_chown_errors: true,
        }
    }

    fn md(entry_type: EntryType, name: &str, mode: u32) -> FileMetadata {
        FileMetadata {
            entry_type,
            name: name.into(),
            mode,
            uid: rustix::process::getuid().as_raw(),
            gid: rustix::process::getgid().as_raw(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_and_open_under_root() {
        let (_tmp, dir) = root();
        let fd = open_file_under_root(&dir, "/a/b/c", NEW_FILE_FLAGS, Mode::from_raw_mode(0o600))
            .unwrap();
        File::from(fd).write_all(b"x").unwrap();
        assert_eq!(dir.read("a/b/c").unwrap(), b"x");
        assert!(dir.metadata("a/b").unwrap().is_dir());
    }

    #[test]
    fn test_traversal_stays_in_root() {
        let (tmp, dir) = root();
        let fd = open_file_under_root(
            &dir,
            "../../etc/passwd-test",
            NEW_FILE_FLAGS,
            Mode::from_raw_mode(0o600),
        )
        .unwrap();
        let target = rustix::fs::readlinkat(rustix::fs::CWD, proc_fd_path(fd.as_fd()), Vec::new())
            .unwrap()
            .to_string_lossy()
            .into_owned();
        let root = tmp.path().canonicalize().unwrap();
        assert!(target.starts_with(root.to_str().unwrap()), "{target}");
        assert!(dir.exists("etc/passwd-test"));
    }

    #[test]
    fn test_symlink_escape_is_confined() {
        let (tmp, dir) = root();
        symlink(&dir, "/", "escape");
        let fd = open_file_under_root(&dir, "escape/x", NEW_FILE_FLAGS, Mode::from_raw_mode(0o600))
            .unwrap();
        drop(fd);
        assert!(tmp.path().join("x").exists());
    }

    #[test]
    fn test_secure_join() {
        let (_tmp, dir) = root();
        dir.create_dir_all("a/b").unwrap();
        symlink(&dir, "../..", "a/b/up");
        symlink(&dir, "/a", "abs");
        assert_eq!(secure_join(dir.as_fd(), "a/b/up/../../x").unwrap(), "x");
        assert_eq!(secure_join(dir.as_fd(), "abs/b").unwrap(), "a/b");
        assert_eq!(secure_join(dir.as_fd(), "..").unwrap(), ".");
        symlink(&dir, "loop", "loop");
        assert_eq!(secure_join(dir.as_fd(), "loop"), Err(Errno::LOOP));
    }

    #[test]
    fn test_fallback_open_checks_prefix() {
        let (_tmp, dir) = root();
        dir.create_dir("d").unwrap();
        let fd = open_under_root_fallback(
            dir.as_fd(),
            "/d/../d/new",
            NEW_FILE_FLAGS,
            Mode::from_raw_mode(0o644),
        )
        .unwrap();
        drop(fd);
        assert!(dir.exists("d/new"));
    }

    #[test]
    fn test_safe_mkdir_is_idempotent() {
        let (_tmp, dir) = root();
        let m = md(EntryType::Dir, "x/y", 0o750);
        safe_mkdir(&dir, &m, &opts()).unwrap();
        safe_mkdir(&dir, &m, &opts()).unwrap();
        assert_eq!(dir.metadata("x/y").unwrap().mode() & 0o7777, 0o750);
    }

    #[test]
    fn test_symlink_attrs_by_path() {
        let (_tmp, dir) = root();
        let mut m = md(EntryType::Symlink, "lnk", 0o777);
        m.linkname = "/nonexistent".into();
        m.modtime = chrono::DateTime::from_timestamp(1_000_000, 0);
        safe_symlink(&dir, &m, &opts()).unwrap();
        let meta = dir.symlink_metadata("lnk").unwrap();
        assert!(meta.file_type().is_symlink());
        assert_eq!(meta.mtime(), 1_000_000);
        assert_eq!(dir.read_link_contents("lnk").unwrap().to_str(), Some("/nonexistent"));
    }

    #[test]
    fn test_safe_link_replaces_existing() {
        let (_tmp, dir) = root();
        dir.write("a", b"content").unwrap();
        dir.write("b", b"old").unwrap();
        let mut m = md(EntryType::Hardlink, "b", 0o644);
        m.linkname = "a".into();
        safe_link(&dir, &m, &opts()).unwrap();
        assert_eq!(dir.read("b").unwrap(), b"content");
        assert_eq!(
            dir.metadata("a").unwrap().ino(),
            dir.metadata("b").unwrap().ino()
        );
    }

    #[test]
    fn test_fifo() {
        let (_tmp, dir) = root();
        let m = md(EntryType::Fifo, "dev/pipe", 0o600);
        safe_mknod(&dir, &m, &opts()).unwrap();
        assert!(dir.symlink_metadata("dev/pipe").unwrap().file_type().is_fifo());
    }

    #[test]
    fn test_file_attrs() {
        let (_tmp, dir) = root();
        let mut m = md(EntryType::Reg, "f", 0o640);
        m.modtime = chrono::DateTime::from_timestamp(1_234_567_890, 500);
        create_empty_file(&dir, &m, &opts()).unwrap();
        let meta = dir.metadata("f").unwrap();
        assert_eq!(meta.mode() & 0o7777, 0o640);
        assert_eq!(meta.mtime(), 1_234_567_890);
        assert_eq!(meta.mtime_nsec(), 500);
        // O_EXCL: a second create fails.
        assert!(create_empty_file(&dir, &m, &opts()).is_err());
    }

    #[test]
    fn test_append_hole() {
        let (_tmp, dir) = root();
        let mut f = File::from(
            open_file_under_root(&dir, "sparse", NEW_FILE_FLAGS, Mode::from_raw_mode(0o644))
                .unwrap(),
        );
        f.write_all(b"a").unwrap();
        append_hole(&mut f, 1 << 20).unwrap();
        assert_eq!(dir.metadata("sparse").unwrap().len(), 1 + (1 << 20));
    }

    #[test]
    fn test_copy_file_content() {
        let (_tmp, dir) = root();
        dir.write("src", b"payload").unwrap();
        let src = dir.open("src").unwrap().into_std();

        let (dest, outcome) = copy_file_content(&dir, &src, "/copy", false, true).unwrap();
        assert!(dest.is_some());
        assert!(matches!(
            outcome,
            CopyOutcome::Copied(7) | CopyOutcome::Reflinked(7)
        ));
        assert_eq!(dir.read("copy").unwrap(), b"payload");

        let (dest, outcome) = copy_file_content(&dir, &src, "/linked", true, false).unwrap();
        assert!(dest.is_none());
        assert_eq!(outcome, CopyOutcome::Hardlinked(7));
        assert_eq!(dir.metadata("linked").unwrap().nlink(), 2);
    }

    #[test]
    fn test_copy_by_hand() {
        let (_tmp, dir) = root();
        dir.write("src", b"payload").unwrap();
        dir.write("dest", b"stale content here").unwrap();
        let src = dir.open("src").unwrap().into_std();
        let mut dest = dir
            .open_with("dest", cap_std::fs::OpenOptions::new().read(true).write(true))
            .unwrap()
            .into_std();

        assert_eq!(copy_by_hand(&src, &mut dest, 7, "/dest").unwrap(), 7);
        assert_eq!(dir.read("dest").unwrap(), b"payload");

        // The source is shorter than expected.
        let err = copy_by_hand(&src, &mut dest, 10, "/dest").unwrap_err();
        match err {
            ChunkedError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            e => panic!("unexpected error {e:?}"),
        }
    }

    #[test]
    fn test_dedup_metadata() {
        let a = md(EntryType::Reg, "a", 0o644);
        let mut b = md(EntryType::Reg, "b", 0o644);
        assert!(can_dedup_metadata_with_hard_link(&a, &b));
        b.mode = 0o755;
        assert!(!can_dedup_metadata_with_hard_link(&a, &b));
    }

    #[test]
    fn test_aufs_whiteouts_are_kept() {
        let (_tmp, dir) = root();
        let m = md(EntryType::Reg, "etc/.wh.hosts", 0o644);
        assert!(convert_whiteout(&dir, WhiteoutFormat::Aufs, &m, &opts()).unwrap());
        let m = md(EntryType::Reg, "etc/hosts", 0o644);
        assert!(convert_whiteout(&dir, WhiteoutFormat::Overlay, &m, &opts()).unwrap());
    }

    #[test]
    fn test_check_chown() {
        let m = md(EntryType::Reg, "etc/shadow", 0o600);
        let strict = AttrOptions {
            ignore_chown_errors: false,
        };
        check_chown(Ok(()), "/etc/shadow", &m, &strict).unwrap();
        check_chown(Err(Errno::PERM), "/etc/shadow", &m, &opts()).unwrap();
        check_chown(Err(Errno::INVAL), "/etc/shadow", &m, &opts()).unwrap();
        assert!(matches!(
            check_chown(Err(Errno::INVAL), "/etc/shadow", &m, &strict),
            Err(ChunkedError::IdMapping { .. })
        ));
        assert!(matches!(
            check_chown(Err(Errno::PERM), "/etc/shadow", &m, &strict),
            Err(ChunkedError::Fs { op: "chown", .. })
        ));
    }

    #[test]
    fn test_overlay_whiteout_ignores_chown_errors() {
        let (_tmp, dir) = root();
        let mut m = md(EntryType::Reg, "etc/.wh.hosts", 0o644);
        // An owner the caller cannot give away to, unless running as root.
        m.uid = m.uid.wrapping_add(1);
        match convert_whiteout(&dir, WhiteoutFormat::Overlay, &m, &opts()) {
            Ok(keep) => {
                assert!(!keep);
                assert!(dir.symlink_metadata("etc/hosts").unwrap().file_type().is_char_device());
            }
            // Creating whiteout devices needs privileges.
            Err(ChunkedError::Fs { op: "mknod", .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
