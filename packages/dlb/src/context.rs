//! Working-tree contexts.
//!
//! A root [`Context`] owns a working tree for its lifetime: it acquires
//! the lock directory, opens the run-database, recreates the temporary
//! area and starts the redo sequencer. Nested scopes stack environment
//! variable and helper dictionaries on top of it.
//!
//! There is no process-global active context; the handle is passed
//! explicitly to every API that needs one. The lock directory is what
//! enforces "one live root context per working tree", across processes
//! and within one.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path as StdPath, PathBuf};
use std::rc::Rc;

use tracing::{debug, info, instrument};

use crate::error::{Error, RedoError, WorkingTreeError};
use crate::fs::path::{AbsoluteOnly, PathClass, RelativePath, Restriction, Root};
use crate::rundb::{RunDatabase, database_file_name};
use crate::sequencer::Sequencer;

pub mod env;
pub mod helper;

use env::EnvVarDict;
use helper::HelperDict;

/// Name of the management tree directory below the working tree root.
pub const MANAGEMENT_TREE_DIRECTORY: &str = ".dlbroot";

/// The lock directory; its existence is the held lock.
pub const LOCK_DIRECTORY: &str = ".dlbroot/lock";

/// The temporary area, recreated empty at root entry and removed at exit.
const TEMPORARY_DIRECTORY: &str = ".dlbroot/t";

/// The working-tree time probe file.
const PROBE_FILE: &str = ".dlbroot/o";

/// Options of the root context.
#[derive(Clone, Debug)]
pub struct ContextOptions {
    /// Restriction the root path and temporary paths must satisfy.
    pub path_class: PathClass,
    /// Concurrency cap of the redo sequencer.
    pub max_parallel_redo_count: usize,
    /// Permit implicit helper lookup on the process binary search path.
    pub find_helpers: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        ContextOptions {
            path_class: PathClass::Unrestricted,
            max_parallel_redo_count: 1,
            find_helpers: false,
        }
    }
}

/// Options of a nested scope; `None` inherits from the enclosing frame.
#[derive(Clone, Debug, Default)]
pub struct ScopeOptions {
    pub find_helpers: Option<bool>,
    pub max_parallel_redo_count: Option<usize>,
}

struct ScopeFrame {
    find_helpers: bool,
    previous_max_parallel: usize,
}

struct WorktreeClock {
    probe: PathBuf,
    last: Option<i64>,
}

impl WorktreeClock {
    /// Advances the probe's mtime and returns it. Never moves backwards
    /// within a context; a regression is unrecoverable.
    fn read(&mut self) -> Result<i64, WorkingTreeError> {
        let unusable = |reason: String| WorkingTreeError::ProbeUnusable {
            probe: PROBE_FILE,
            reason,
        };
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&self.probe)
            .map_err(|e| unusable(e.to_string()))?;
        file.write_all(b"o").map_err(|e| unusable(e.to_string()))?;
        drop(file);
        let metadata =
            std::fs::symlink_metadata(&self.probe).map_err(|e| unusable(e.to_string()))?;
        use std::os::unix::fs::MetadataExt;
        let observed = metadata.mtime() * 1_000_000_000 + metadata.mtime_nsec();
        if let Some(last) = self.last {
            if observed < last {
                return Err(WorkingTreeError::ClockRegression {
                    probe: PROBE_FILE,
                    last,
                    observed,
                });
            }
        }
        self.last = Some(observed);
        Ok(observed)
    }
}

pub(crate) struct ContextInner {
    /// Absolute path of the working tree root (the process working
    /// directory at entry).
    root: PathBuf,
    root_value: crate::fs::Path<AbsoluteOnly>,
    path_class: PathClass,
    db: tokio::sync::Mutex<Option<RunDatabase>>,
    sequencer: Sequencer<crate::run::RedoTaskResult>,
    env: RefCell<EnvVarDict>,
    helpers: RefCell<HelperDict>,
    scopes: RefCell<Vec<ScopeFrame>>,
    clock: RefCell<WorktreeClock>,
    temp_counter: Cell<u64>,
    /// Uncompleted runs keyed by `(tool id, fingerprint)`, for redo
    /// coalescing.
    pub(crate) active_runs: RefCell<HashMap<(Vec<u8>, Vec<u8>), crate::run::RunResult>>,
    closed: Cell<bool>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if !self.closed.get() {
            // crash recovery convenience; a clean close removed it already
            let _ = std::fs::remove_dir(self.root.join(LOCK_DIRECTORY));
        }
    }
}

/// Handle to an open working-tree context; cheap to clone.
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

impl Context {
    /// Enters the root context for the working tree at the process working
    /// directory, which must contain `.dlbroot`.
    #[instrument(name = "Context::open", skip_all)]
    pub async fn open(options: ContextOptions) -> Result<Context, Error> {
        let root = std::env::current_dir().map_err(|source| WorkingTreeError::Io {
            path: PathBuf::from("."),
            source,
        })?;
        let management = root.join(MANAGEMENT_TREE_DIRECTORY);
        match std::fs::symlink_metadata(&management) {
            Ok(m) if m.is_dir() => {}
            _ => return Err(WorkingTreeError::NoManagementTree { cwd: root }.into()),
        }

        let root_text = root.to_str().ok_or_else(|| {
            Error::from(WorkingTreeError::RootPathRestricted {
                restriction: "Path",
                reason: "root path is not valid UTF-8".into(),
            })
        })?;
        let root_value = crate::fs::Path::<AbsoluteOnly>::new_with_dir_flag(root_text, true)
            .map_err(WorkingTreeError::Path)?;
        options.path_class.check(&root_value).map_err(|e| {
            WorkingTreeError::RootPathRestricted {
                restriction: options.path_class.name(),
                reason: e.to_string(),
            }
        })?;

        // the lock directory's existence is the held lock
        let lock_dir = root.join(LOCK_DIRECTORY);
        match std::fs::create_dir(&lock_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(WorkingTreeError::LockHeld { lock_dir }.into());
            }
            Err(source) => {
                return Err(WorkingTreeError::Io {
                    path: lock_dir,
                    source,
                }
                .into());
            }
        }

        let locked = LockRelease {
            lock_dir: lock_dir.clone(),
            armed: true,
        };

        let temp_dir = root.join(TEMPORARY_DIRECTORY);
        crate::fs::remove_filesystem_object(&temp_dir, true)
            .and_then(|_| std::fs::create_dir(&temp_dir))
            .map_err(|source| WorkingTreeError::Io {
                path: temp_dir.clone(),
                source,
            })?;

        let probe = root.join(PROBE_FILE);
        crate::fs::remove_filesystem_object(&probe, true)
            .and_then(|_| std::fs::write(&probe, b"o"))
            .map_err(|source| WorkingTreeError::Io {
                path: probe.clone(),
                source,
            })?;

        let db = RunDatabase::open(management.join(database_file_name())).await?;

        let snapshot: HashMap<String, String> = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        let search_path = snapshot
            .get("PATH")
            .map(|p| std::env::split_paths(p).collect())
            .unwrap_or_default();

        let mut locked = locked;
        locked.armed = false; // the context owns the lock from here on

        info!(root = %root.display(), "working tree context opened");
        Ok(Context {
            inner: Rc::new(ContextInner {
                root,
                root_value,
                path_class: options.path_class,
                db: tokio::sync::Mutex::new(Some(db)),
                sequencer: Sequencer::new(options.max_parallel_redo_count),
                env: RefCell::new(EnvVarDict::new(snapshot)),
                helpers: RefCell::new(HelperDict::new(search_path)),
                scopes: RefCell::new(vec![ScopeFrame {
                    find_helpers: options.find_helpers,
                    previous_max_parallel: options.max_parallel_redo_count,
                }]),
                clock: RefCell::new(WorktreeClock { probe, last: None }),
                temp_counter: Cell::new(0),
                active_runs: RefCell::new(HashMap::new()),
                closed: Cell::new(false),
            }),
        })
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.inner.closed.get() {
            return Err(WorkingTreeError::NotRunning.into());
        }
        Ok(())
    }

    pub(crate) fn assert_open(&self) -> Result<(), Error> {
        self.ensure_open()
    }

    /// Completes all pending redos; forbidden from inside a redo body.
    async fn barrier(&self, operation: &'static str) -> Result<(), Error> {
        if self.inner.sequencer.is_driving() {
            return Err(RedoError::ForbiddenInRedo { operation }.into());
        }
        self.inner.sequencer.complete_all(None).await?;
        Ok(())
    }

    /// Exits the root context: completes all pending redos, garbage
    /// collects and closes the run-database, removes the temporary area,
    /// waits until the working-tree time strictly advances past the last
    /// observed value, and releases the lock.
    ///
    /// The first error of an unconsumed redo resurfaces here.
    #[instrument(name = "Context::close", skip_all)]
    pub async fn close(self) -> Result<(), Error> {
        self.ensure_open()?;
        if self.inner.scopes.borrow().len() > 1 {
            return Err(WorkingTreeError::NestingRestricted {
                reason: "nested scopes are still active".into(),
            }
            .into());
        }
        self.barrier("closing the context").await?;

        // move finished task results into their proxies; an error no proxy
        // consumed yet resurfaces from close()
        let mut first_error: Option<Error> = None;
        let runs: Vec<crate::run::RunResult> = {
            let mut active = self.inner.active_runs.borrow_mut();
            active.drain().map(|(_, run)| run).collect()
        };
        for run in runs {
            if let Some(e) = run.finish_at_exit() {
                first_error.get_or_insert(e);
            }
        }
        for (_, outcome) in self.inner.sequencer.consume_all()? {
            match outcome {
                Some(Err(e)) if first_error.is_none() => first_error = Some(e),
                _ => {}
            }
        }

        if let Some(mut db) = self.inner.db.lock().await.take() {
            db.cleanup().await?;
            db.close().await?;
        }

        crate::fs::remove_filesystem_object(self.inner.root.join(TEMPORARY_DIRECTORY), true)
            .map_err(|source| WorkingTreeError::Io {
                path: self.inner.root.join(TEMPORARY_DIRECTORY),
                source,
            })?;

        // a future context must be able to distinguish "written during this
        // run" from "written later"
        let boundary = self.inner.clock.borrow().last;
        if let Some(boundary) = boundary {
            loop {
                if self.inner.clock.borrow_mut().read()? > boundary {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        }

        std::fs::remove_dir(self.inner.root.join(LOCK_DIRECTORY)).map_err(|source| {
            WorkingTreeError::Io {
                path: self.inner.root.join(LOCK_DIRECTORY),
                source,
            }
        })?;
        self.inner.closed.set(true);
        info!(root = %self.inner.root.display(), "working tree context closed");

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// The working tree root as a host path.
    pub fn root_path(&self) -> &StdPath {
        &self.inner.root
    }

    /// The working tree root as a path value.
    pub fn root_path_value(&self) -> &crate::fs::Path<AbsoluteOnly> {
        &self.inner.root_value
    }

    /// The working-tree time: a monotonically non-decreasing integer
    /// derived from the probe file's mtime.
    pub fn worktree_time(&self) -> Result<i64, Error> {
        self.ensure_open()?;
        Ok(self.inner.clock.borrow_mut().read()?)
    }

    pub fn max_parallel_redo_count(&self) -> usize {
        self.inner.sequencer.max_parallel()
    }

    // ------------------------------------------------------------------
    // scopes

    /// Pushes a nested scope; completes all pending redos first so the new
    /// frame observes a consistent world.
    pub async fn push_scope(&self, options: ScopeOptions) -> Result<(), Error> {
        self.ensure_open()?;
        self.barrier("entering a nested scope").await?;

        let mut scopes = self.inner.scopes.borrow_mut();
        let all_outer_find = scopes.iter().all(|s| s.find_helpers);
        let find_helpers = options.find_helpers.unwrap_or(all_outer_find);
        if find_helpers && !all_outer_find {
            return Err(WorkingTreeError::NestingRestricted {
                reason: "helper search must be permitted by every enclosing scope".into(),
            }
            .into());
        }
        let previous_max_parallel = self.inner.sequencer.max_parallel();
        if let Some(max) = options.max_parallel_redo_count {
            self.inner.sequencer.set_max_parallel(max);
        }
        scopes.push(ScopeFrame {
            find_helpers,
            previous_max_parallel,
        });
        self.inner.env.borrow_mut().push_frame();
        self.inner.helpers.borrow_mut().push_frame();
        debug!(depth = scopes.len(), "scope pushed");
        Ok(())
    }

    /// Pops the innermost scope; completes all redos enqueued inside it
    /// first.
    pub async fn pop_scope(&self) -> Result<(), Error> {
        self.ensure_open()?;
        self.barrier("leaving a nested scope").await?;

        let mut scopes = self.inner.scopes.borrow_mut();
        if scopes.len() <= 1 {
            return Err(WorkingTreeError::NestingRestricted {
                reason: "no nested scope is active".into(),
            }
            .into());
        }
        let frame = scopes.pop().expect("checked above");
        self.inner
            .sequencer
            .set_max_parallel(frame.previous_max_parallel);
        self.inner.env.borrow_mut().pop_frame();
        self.inner.helpers.borrow_mut().pop_frame();
        debug!(depth = scopes.len(), "scope popped");
        Ok(())
    }

    // ------------------------------------------------------------------
    // environment variables

    /// See [`EnvVarDict::import_from_outer`].
    pub async fn import_env_var(
        &self,
        name: &str,
        restriction: &str,
        example: &str,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        self.barrier("modifying the environment dictionary").await?;
        self.inner
            .env
            .borrow_mut()
            .import_from_outer(name, restriction, example)
            .map_err(Error::from)
    }

    /// The visible value of an imported variable.
    pub fn env_var(&self, name: &str) -> Option<String> {
        self.inner.env.borrow().get(name).map(str::to_owned)
    }

    pub fn is_env_var_imported(&self, name: &str) -> bool {
        self.inner.env.borrow().is_imported(name)
    }

    pub async fn set_env_var(&self, name: &str, value: &str) -> Result<(), Error> {
        self.ensure_open()?;
        self.barrier("modifying the environment dictionary").await?;
        self.inner
            .env
            .borrow_mut()
            .set(name, value)
            .map_err(Error::from)
    }

    pub async fn remove_env_var(&self, name: &str) -> Result<(), Error> {
        self.ensure_open()?;
        self.barrier("modifying the environment dictionary").await?;
        self.inner
            .env
            .borrow_mut()
            .remove(name)
            .map_err(Error::from)
    }

    /// The merged view of all defined environment variables.
    pub fn env_vars(&self) -> std::collections::BTreeMap<String, String> {
        self.inner.env.borrow().defined()
    }

    // ------------------------------------------------------------------
    // helpers

    /// Explicitly assigns a helper in the active frame.
    pub async fn set_helper(
        &self,
        name: &RelativePath,
        path: &crate::fs::Path<AbsoluteOnly>,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        self.barrier("modifying the helper dictionary").await?;
        self.inner
            .helpers
            .borrow_mut()
            .set(name, path)
            .map_err(|e| WorkingTreeError::Path(e).into())
    }

    /// Resolves a helper name to an absolute path, searching the process
    /// binary search path when the root context permits it.
    pub fn helper(&self, name: &RelativePath) -> Result<crate::fs::Path<AbsoluteOnly>, Error> {
        let find = self.inner.scopes.borrow().iter().all(|s| s.find_helpers);
        let found = if find {
            self.inner.helpers.borrow_mut().get_or_find(name)
        } else {
            self.inner.helpers.borrow().get(name).cloned()
        };
        found.ok_or_else(|| {
            crate::error::HelperExecutionError::UnknownHelper {
                helper: name.as_string(),
            }
            .into()
        })
    }

    // ------------------------------------------------------------------
    // temporaries

    /// Creates a fresh filesystem object below the temporary area and
    /// returns its working-tree path.
    pub fn create_temporary(
        &self,
        is_dir: bool,
        prefix: &str,
        suffix: &str,
    ) -> Result<RelativePath, Error> {
        self.ensure_open()?;
        for part in [prefix, suffix] {
            if part.contains('/') || part.contains('\0') {
                return Err(WorkingTreeError::Path(crate::fs::PathError::Invalid {
                    reason: format!("invalid temporary affix: {part:?}"),
                })
                .into());
            }
        }
        let prefix = if prefix.is_empty() { "t" } else { prefix };
        let n = self.inner.temp_counter.get();
        self.inner.temp_counter.set(n + 1);
        let name = format!("{prefix}{n}{suffix}");
        let leaf: crate::fs::Path =
            crate::fs::Path::new_with_dir_flag(&name, is_dir).map_err(WorkingTreeError::Path)?;
        let rel = RelativePath::new(TEMPORARY_DIRECTORY)
            .and_then(|t| t.join(&leaf))
            .map_err(WorkingTreeError::Path)?;
        self.inner
            .path_class
            .check(&rel)
            .map_err(WorkingTreeError::Path)?;
        let abs = self.native_of(&rel);
        let created = if is_dir {
            std::fs::create_dir(&abs)
        } else {
            std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&abs)
                .map(drop)
        };
        created.map_err(|source| WorkingTreeError::Io { path: abs, source })?;
        Ok(rel)
    }

    // ------------------------------------------------------------------
    // managed-tree path resolution

    /// The host path of a working-tree path.
    pub fn native_of(&self, rel: &RelativePath) -> PathBuf {
        match rel.native() {
            Ok(native) => self.inner.root.join(native.as_path()),
            Err(_) => self.inner.root.clone(), // unreachable: rel was validated
        }
    }

    /// Converts an arbitrary path to a working-tree path.
    ///
    /// The input is absolutised against the process working directory and
    /// must lie below the working tree root (byte-exact, case-sensitive).
    /// Without `collapsable`, a `..` component crossing a symbolic link is
    /// an error; with `existing`, the final target must exist.
    pub fn working_tree_path_of<R: Restriction>(
        &self,
        path: &crate::fs::Path<R>,
        existing: bool,
        collapsable: bool,
    ) -> Result<RelativePath, Error> {
        let original = path.as_string();
        let outside = || WorkingTreeError::OutsideTree {
            path: PathBuf::from(&original),
        };

        let mut absolute: Vec<String> = Vec::new();
        if !path.is_absolute() {
            let cwd = std::env::current_dir().map_err(|source| WorkingTreeError::Io {
                path: PathBuf::from("."),
                source,
            })?;
            let cwd = cwd.to_str().ok_or_else(outside)?;
            absolute.extend(cwd.split('/').filter(|c| !c.is_empty()).map(str::to_owned));
        } else if path.root() != Root::Rooted {
            return Err(outside().into());
        }

        for component in path.components() {
            if component == ".." {
                if !collapsable {
                    let prefix: PathBuf =
                        PathBuf::from(format!("/{}", absolute.join("/")));
                    match std::fs::symlink_metadata(&prefix) {
                        Ok(m) if m.file_type().is_symlink() => {
                            return Err(WorkingTreeError::Uncollapsable { path: prefix }.into());
                        }
                        _ => {}
                    }
                }
                if absolute.pop().is_none() {
                    return Err(outside().into());
                }
            } else {
                absolute.push(component.to_owned());
            }
        }

        let root: Vec<&str> = self
            .inner
            .root
            .to_str()
            .unwrap_or_default()
            .split('/')
            .filter(|c| !c.is_empty())
            .collect();
        if absolute.len() < root.len()
            || !absolute[..root.len()]
                .iter()
                .map(String::as_str)
                .eq(root.iter().copied())
        {
            return Err(outside().into());
        }

        let remainder = &absolute[root.len()..];
        let rel = if remainder.is_empty() {
            RelativePath::new(".").map_err(WorkingTreeError::Path)?
        } else {
            RelativePath::from_components(
                Root::Relative,
                remainder.iter().map(String::as_str),
                path.is_dir(),
            )
            .map_err(WorkingTreeError::Path)?
        };

        if existing {
            let abs = self.native_of(&rel);
            if std::fs::symlink_metadata(&abs).is_err() {
                return Err(WorkingTreeError::DoesNotExist { path: abs }.into());
            }
        }
        Ok(rel)
    }

    /// Like [`Context::working_tree_path_of`] for a string input.
    pub fn working_tree_path_of_str(
        &self,
        path: &str,
        existing: bool,
        collapsable: bool,
    ) -> Result<RelativePath, Error> {
        let value: crate::fs::Path = crate::fs::Path::new(path).map_err(WorkingTreeError::Path)?;
        self.working_tree_path_of(&value, existing, collapsable)
    }

    // ------------------------------------------------------------------
    // engine access

    pub(crate) fn db(&self) -> &tokio::sync::Mutex<Option<RunDatabase>> {
        &self.inner.db
    }

    pub(crate) fn sequencer(&self) -> &Sequencer<crate::run::RedoTaskResult> {
        &self.inner.sequencer
    }

    pub(crate) fn inner(&self) -> &Rc<ContextInner> {
        &self.inner
    }
}

/// Releases the lock directory when context construction fails after
/// acquisition.
struct LockRelease {
    lock_dir: PathBuf,
    armed: bool,
}

impl Drop for LockRelease {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_dir(&self.lock_dir);
        }
    }
}
