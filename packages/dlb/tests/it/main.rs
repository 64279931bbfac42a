use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use tempfile::TempDir;

pub mod context;
pub mod redo_context;
pub mod tool_run;

/// The working tree root is the process working directory, so tests that
/// open a context serialise on this lock and restore the previous
/// directory when done.
fn working_directory_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A fresh working tree (a temporary directory containing `.dlbroot/`)
/// entered as the process working directory.
pub struct Worktree {
    _dir: TempDir,
    previous: PathBuf,
    _guard: MutexGuard<'static, ()>,
}

impl Worktree {
    #[track_caller]
    pub fn enter() -> Worktree {
        let guard = working_directory_lock();
        let dir = TempDir::new().expect("create temporary directory");
        std::fs::create_dir(dir.path().join(".dlbroot")).expect("create management tree");
        let previous = std::env::current_dir().expect("read working directory");
        std::env::set_current_dir(dir.path()).expect("enter working tree");
        Worktree {
            _dir: dir,
            previous,
            _guard: guard,
        }
    }

    /// The working tree root (the current working directory).
    pub fn root(&self) -> PathBuf {
        std::env::current_dir().expect("read working directory")
    }

    #[track_caller]
    pub fn write(&self, path: impl AsRef<Path>, content: impl AsRef<[u8]>) {
        let path = self.root().join(path.as_ref());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent directories");
        }
        std::fs::write(&path, content.as_ref()).expect("write file");
    }

    #[track_caller]
    pub fn read(&self, path: impl AsRef<Path>) -> Vec<u8> {
        std::fs::read(self.root().join(path.as_ref())).expect("read file")
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.root().join(path.as_ref()).try_exists().unwrap_or(false)
    }
}

impl Drop for Worktree {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.previous);
    }
}
