//! Filesystem-object memos.
//!
//! A memo is the portable evidence of a filesystem object's state at some
//! moment: a stat summary and, for symlinks, the link target. Memos are
//! compared through their encoded form so platform-specific stat fields
//! (inode numbers, block counts) can never affect a redo decision.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Format tag of the encoded form; bump on any change to the layout.
const ENCODING_TAG: u8 = 1;

#[derive(Debug, Error)]
pub enum MemoEncodingError {
    #[error("memo of a symlink must carry a target")]
    SymlinkWithoutTarget,

    #[error("memo of a non-symlink must not carry a target")]
    TargetWithoutSymlink,

    #[error("not an encoded memo: {reason}")]
    Malformed { reason: String },
}

/// Subset of `stat` that participates in redo decisions.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct StatSummary {
    pub mode: u32,
    pub size: u64,
    pub mtime_ns: i64,
    pub uid: u32,
    pub gid: u32,
}

/// Portable summary of a filesystem object.
///
/// Invariants: `symlink_target` is present iff `stat` describes a symlink;
/// a non-existing object has neither field.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct FilesystemObjectMemo {
    pub stat: Option<StatSummary>,
    pub symlink_target: Option<String>,
}

impl FilesystemObjectMemo {
    /// True iff the object existed when the memo was taken.
    pub fn exists(&self) -> bool {
        self.stat.is_some()
    }

    pub fn is_symlink(&self) -> bool {
        self.stat
            .map(|s| s.mode & libc::S_IFMT == libc::S_IFLNK)
            .unwrap_or(false)
    }

    pub fn is_regular_file(&self) -> bool {
        self.stat
            .map(|s| s.mode & libc::S_IFMT == libc::S_IFREG)
            .unwrap_or(false)
    }

    pub fn is_directory(&self) -> bool {
        self.stat
            .map(|s| s.mode & libc::S_IFMT == libc::S_IFDIR)
            .unwrap_or(false)
    }

    fn check_consistency(&self) -> Result<(), MemoEncodingError> {
        if self.is_symlink() != self.symlink_target.is_some() {
            return Err(if self.is_symlink() {
                MemoEncodingError::SymlinkWithoutTarget
            } else {
                MemoEncodingError::TargetWithoutSymlink
            });
        }
        Ok(())
    }

    /// The stable binary form.
    ///
    /// The encoding is deterministic on every platform (fixed-width
    /// little-endian integers behind a format tag), so encoded memos can be
    /// compared bytewise.
    pub fn encode(&self) -> Result<Vec<u8>, MemoEncodingError> {
        self.check_consistency()?;
        let mut bytes = vec![ENCODING_TAG];
        let body = bincode::serialize(self).map_err(|e| MemoEncodingError::Malformed {
            reason: e.to_string(),
        })?;
        bytes.extend(body);
        Ok(bytes)
    }

    /// Decodes [`FilesystemObjectMemo::encode`] output; anything else is
    /// rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, MemoEncodingError> {
        let Some((&tag, body)) = bytes.split_first() else {
            return Err(MemoEncodingError::Malformed {
                reason: "empty".into(),
            });
        };
        if tag != ENCODING_TAG {
            return Err(MemoEncodingError::Malformed {
                reason: format!("unknown format tag {tag}"),
            });
        }
        use bincode::Options;
        let options = bincode::config::DefaultOptions::new()
            .with_fixint_encoding()
            .with_limit(4096);
        // bincode stops at the structural end of the value; anything left
        // over is not an encoded memo
        let mut reader = std::io::Cursor::new(body);
        let memo: FilesystemObjectMemo = options
            .deserialize_from(&mut reader)
            .map_err(|e| MemoEncodingError::Malformed {
                reason: e.to_string(),
            })?;
        if reader.position() != body.len() as u64 {
            return Err(MemoEncodingError::Malformed {
                reason: format!(
                    "{} trailing bytes",
                    body.len() as u64 - reader.position()
                ),
            });
        }
        memo.check_consistency()?;
        Ok(memo)
    }
}

/// Reads the memo of the filesystem object at `abs` without following a
/// final symlink. A missing object yields the empty memo.
pub fn read_memo(abs: impl AsRef<Path>) -> io::Result<FilesystemObjectMemo> {
    let metadata = match std::fs::symlink_metadata(abs.as_ref()) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(FilesystemObjectMemo::default());
        }
        Err(e) => return Err(e),
    };
    let stat = StatSummary {
        mode: metadata.mode(),
        size: metadata.size(),
        mtime_ns: metadata.mtime() * 1_000_000_000 + metadata.mtime_nsec(),
        uid: metadata.uid(),
        gid: metadata.gid(),
    };
    let symlink_target = if metadata.file_type().is_symlink() {
        let target = std::fs::read_link(abs.as_ref())?;
        Some(target.to_string_lossy().into_owned())
    } else {
        None
    };
    Ok(FilesystemObjectMemo {
        stat: Some(stat),
        symlink_target,
    })
}
