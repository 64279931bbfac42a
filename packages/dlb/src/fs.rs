//! Filesystem values and operations of the runtime.
//!
//! [`path`] holds the portable path model, [`memo`] the filesystem-object
//! memos recorded as evidence of past runs. The helpers here are the few
//! primitive mutations the runtime performs on filesystem objects it owns.
//!
//! Inside this module, `std::fs` and `tokio::fs` are referred to by their
//! fully qualified paths to make it maximally clear what is being used.

use std::io;
use std::path::PathBuf;

use tracing::trace;

pub mod memo;
pub mod path;

pub use memo::{FilesystemObjectMemo, MemoEncodingError, StatSummary, read_memo};
pub use path::{
    AbsolutePath, ItemFilter, NativePath, NoSpacePath, Path, PathClass, PathError,
    PortablePath, PortablePosixPath, PortableWindowsPath, PosixPath, RelativePath,
    Restriction, Root, Stem, Unrestricted, WindowsPath,
};

/// Removes a filesystem object of any kind, including a non-empty directory
/// tree. A dangling symlink is removed, not followed.
///
/// With `ignore_non_existent`, a missing object is not an error.
pub fn remove_filesystem_object(
    abs: impl Into<PathBuf>,
    ignore_non_existent: bool,
) -> io::Result<()> {
    let abs = abs.into();
    let metadata = match std::fs::symlink_metadata(&abs) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound && ignore_non_existent => return Ok(()),
        Err(e) => return Err(e),
    };
    trace!(path = ?abs, "remove filesystem object");
    if metadata.is_dir() {
        std::fs::remove_dir_all(&abs)
    } else {
        std::fs::remove_file(&abs)
    }
}

/// Propagates modification times upwards through a directory subtree.
///
/// Visits the children of `root_abs` selected by `name_filter`, recursing
/// into directories selected by `recurse_filter`, and sets each visited
/// directory's mtime to the maximum of its considered children's mtimes
/// where that is newer. Returns the new mtime of `root_abs` in nanoseconds
/// if anything changed.
pub fn propagate_mtime(
    root_abs: impl AsRef<std::path::Path>,
    name_filter: &ItemFilter,
    recurse_filter: &ItemFilter,
) -> io::Result<Option<i64>> {
    fn mtime_ns(metadata: &std::fs::Metadata) -> i64 {
        let t = filetime::FileTime::from_last_modification_time(metadata);
        t.unix_seconds() * 1_000_000_000 + i64::from(t.nanoseconds())
    }

    fn visit(
        dir: &std::path::Path,
        name_filter: &ItemFilter,
        recurse_filter: &ItemFilter,
        changed: &mut bool,
    ) -> io::Result<i64> {
        let own = mtime_ns(&std::fs::symlink_metadata(dir)?);
        let mut latest: Option<i64> = None;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue; // not representable, cannot be matched
            };
            let metadata = std::fs::symlink_metadata(entry.path())?;
            let child = if metadata.is_dir() && recurse_filter.matches(name) {
                visit(&entry.path(), name_filter, recurse_filter, changed)?
            } else if name_filter.matches(name) {
                mtime_ns(&metadata)
            } else {
                continue;
            };
            latest = Some(latest.map_or(child, |l| l.max(child)));
        }
        match latest {
            Some(latest) if latest > own => {
                let t = filetime::FileTime::from_unix_time(
                    latest.div_euclid(1_000_000_000),
                    latest.rem_euclid(1_000_000_000) as u32,
                );
                filetime::set_file_mtime(dir, t)?;
                *changed = true;
                Ok(latest)
            }
            _ => Ok(own),
        }
    }

    let mut changed = false;
    let new = visit(root_abs.as_ref(), name_filter, recurse_filter, &mut changed)?;
    Ok(changed.then_some(new))
}
