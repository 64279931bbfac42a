//! The per-redo facade handed to a tool's redo body.
//!
//! A [`Redo`] handle lets the body read the context (root path, imported
//! environment, helpers), create temporaries, run helper processes with
//! working-tree-aware argument rewriting, publish outputs through
//! [`Redo::replace_output`] and assign non-explicit dependency results.
//! After the body returns the handle is terminated and every method
//! fails.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::rc::Rc;

use tokio::io::AsyncReadExt;
use tracing::{debug, instrument, trace};

use crate::context::Context;
use crate::error::{DependencyError, Error, HelperExecutionError, RedoError, WorkingTreeError};
use crate::fs::path::{AbsoluteOnly, RelativePath, Restriction, Unrestricted};
use crate::tool::dependency::{Dependency, DependencyValue};
use crate::tool::ToolDefinition;

/// Kind of a declared output path.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum OutputKind {
    RegularFile,
    NonRegularFile,
    Directory,
}

impl OutputKind {
    fn describes(self, metadata: &std::fs::Metadata) -> bool {
        match self {
            OutputKind::RegularFile => metadata.is_file(),
            OutputKind::Directory => metadata.is_dir(),
            OutputKind::NonRegularFile => !metadata.is_file() && !metadata.is_dir(),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct OutputSpec {
    pub(crate) dependency_name: String,
    pub(crate) kind: OutputKind,
    pub(crate) replace_by_same_content: bool,
}

/// An argument of a helper invocation; paths are rewritten to be correct
/// relative to the helper's working directory.
#[derive(Clone, Debug)]
pub enum HelperArg {
    Str(String),
    Path(crate::fs::Path<Unrestricted>),
}

impl From<&str> for HelperArg {
    fn from(v: &str) -> Self {
        HelperArg::Str(v.to_owned())
    }
}

impl From<String> for HelperArg {
    fn from(v: String) -> Self {
        HelperArg::Str(v)
    }
}

impl From<i64> for HelperArg {
    fn from(v: i64) -> Self {
        HelperArg::Str(v.to_string())
    }
}

impl<R: Restriction> From<&crate::fs::Path<R>> for HelperArg {
    fn from(v: &crate::fs::Path<R>) -> Self {
        HelperArg::Path(v.unrestricted())
    }
}

/// Where a helper's stdout or stderr goes.
#[derive(Clone, Debug, Default)]
pub enum OutputRedirection {
    /// Inherit the runtime's own stream.
    #[default]
    Inherit,
    /// Discard.
    Discard,
    /// Write to a working-tree file (created, truncated).
    File(RelativePath),
}

/// Options of [`Redo::execute_helper`].
#[derive(Clone, Debug)]
pub struct ExecuteHelperOptions {
    /// Working directory of the helper, a working-tree directory path.
    pub cwd: Option<RelativePath>,
    /// Extra environment on top of the context's imported variables.
    pub forced_env: BTreeMap<String, String>,
    pub stdout: OutputRedirection,
    pub stderr: OutputRedirection,
    /// Exit codes that are not an error.
    pub expected_returncodes: Vec<i32>,
}

impl Default for ExecuteHelperOptions {
    fn default() -> Self {
        ExecuteHelperOptions {
            cwd: None,
            forced_env: BTreeMap::new(),
            stdout: OutputRedirection::Inherit,
            stderr: OutputRedirection::Inherit,
            expected_returncodes: vec![0],
        }
    }
}

pub(crate) struct RedoInner {
    ctx: Context,
    definition: ToolDefinition,
    /// Realised dependency values visible to the body: explicit values
    /// and engine-realised environment values.
    values: BTreeMap<String, DependencyValue>,
    /// Declared explicit output paths.
    outputs: BTreeMap<RelativePath, OutputSpec>,
    /// Non-explicit dependency values assigned by the redo body.
    assigned: RefCell<BTreeMap<String, DependencyValue>>,
    /// Outputs replaced during this redo.
    modified_outputs: RefCell<BTreeSet<RelativePath>>,
    /// Working-tree helper binaries executed by this redo.
    helper_inputs: RefCell<BTreeSet<RelativePath>>,
    terminated: Cell<bool>,
}

/// Redo facade handle; cheap to clone into the redo body's future.
#[derive(Clone)]
pub struct Redo {
    inner: Rc<RedoInner>,
}

impl std::fmt::Debug for Redo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redo")
            .field("tool", &self.inner.definition.name())
            .field("terminated", &self.inner.terminated.get())
            .finish()
    }
}

impl Redo {
    pub(crate) fn new(
        ctx: Context,
        definition: ToolDefinition,
        values: BTreeMap<String, DependencyValue>,
        outputs: BTreeMap<RelativePath, OutputSpec>,
    ) -> Redo {
        Redo {
            inner: Rc::new(RedoInner {
                ctx,
                definition,
                values,
                outputs,
                assigned: RefCell::new(BTreeMap::new()),
                modified_outputs: RefCell::new(BTreeSet::new()),
                helper_inputs: RefCell::new(BTreeSet::new()),
                terminated: Cell::new(false),
            }),
        }
    }

    fn ensure_running(&self) -> Result<(), Error> {
        if self.inner.terminated.get() {
            return Err(RedoError::Terminated.into());
        }
        Ok(())
    }

    /// The working tree root.
    pub fn root_path(&self) -> &std::path::Path {
        self.inner.ctx.root_path()
    }

    /// The realised value of a dependency as visible to this redo:
    /// explicit values and engine-realised environment values.
    pub fn dependency_value(&self, name: &str) -> Option<DependencyValue> {
        self.inner.values.get(name).cloned()
    }

    /// Shorthand for the single path value of a dependency.
    pub fn path_value(&self, name: &str) -> Option<crate::fs::Path<Unrestricted>> {
        self.inner.values.get(name)?.as_path().cloned()
    }

    /// The visible value of an environment variable imported into the
    /// context.
    pub fn env_var(&self, name: &str) -> Option<String> {
        self.inner.ctx.env_var(name)
    }

    /// Resolves a helper name; see [`Context::helper`].
    pub fn helper(&self, name: &RelativePath) -> Result<crate::fs::Path<AbsoluteOnly>, Error> {
        self.inner.ctx.helper(name)
    }

    /// See [`Context::working_tree_path_of`].
    pub fn working_tree_path_of<R: Restriction>(
        &self,
        path: &crate::fs::Path<R>,
        existing: bool,
        collapsable: bool,
    ) -> Result<RelativePath, Error> {
        self.inner.ctx.working_tree_path_of(path, existing, collapsable)
    }

    /// Creates a temporary file (or directory) below the managed temporary
    /// area.
    pub fn temporary(&self, is_dir: bool) -> Result<RelativePath, Error> {
        self.ensure_running()?;
        self.inner.ctx.create_temporary(is_dir, "t", "")
    }

    /// The declared outputs replaced so far.
    pub fn modified_outputs(&self) -> Vec<RelativePath> {
        self.inner.modified_outputs.borrow().iter().cloned().collect()
    }

    /// Assigns a non-explicit dependency result, validated against its
    /// descriptor; write-once.
    pub fn set(&self, name: &str, value: DependencyValue) -> Result<(), Error> {
        self.ensure_running()?;
        let Some(dependency) = self.inner.definition.dependency(name) else {
            return Err(DependencyError::Unknown {
                name: name.to_owned(),
            }
            .into());
        };
        if dependency.is_explicit() {
            return Err(RedoError::AssignedExplicit {
                name: name.to_owned(),
            }
            .into());
        }
        let validated = dependency
            .validate_value(name, Some(&value))?
            .expect("a provided value validates to a value");
        let mut assigned = self.inner.assigned.borrow_mut();
        if assigned.contains_key(name) {
            return Err(RedoError::AssignedTwice {
                name: name.to_owned(),
            }
            .into());
        }
        assigned.insert(name.to_owned(), validated);
        Ok(())
    }

    /// Publishes `source` (an existing working-tree path) as the declared
    /// output `declared`.
    ///
    /// A regular-file output declared with `replace_by_same_content =
    /// false` keeps the old file (and its mtime) when the new content is
    /// identical; the source is discarded and the path is not declared
    /// modified. Directory outputs are replaced as a whole tree; other
    /// outputs verbatim. Missing parent directories of `declared` are
    /// created.
    #[instrument(name = "Redo::replace_output", skip_all, fields(declared = %declared))]
    pub async fn replace_output<R1: Restriction, R2: Restriction>(
        &self,
        declared: &crate::fs::Path<R1>,
        source: &crate::fs::Path<R2>,
    ) -> Result<(), Error> {
        self.ensure_running()?;
        let declared = self.inner.ctx.working_tree_path_of(declared, false, false)?;
        let Some(spec) = self.inner.outputs.get(&declared) else {
            // a path differing only in the directory flag is a mismatch too
            let flipped = declared.as_string();
            let is_known = self
                .inner
                .outputs
                .keys()
                .any(|k| k.as_string().trim_end_matches('/') == flipped.trim_end_matches('/'));
            let reason = if is_known {
                "directory flag does not match the declared output".to_owned()
            } else {
                "not an explicit output dependency of this redo".to_owned()
            };
            return Err(DependencyError::InvalidValue {
                name: declared.as_string(),
                reason,
            }
            .into());
        };

        let source = self.inner.ctx.working_tree_path_of(source, true, false)?;
        if source == declared {
            return Err(DependencyError::InvalidValue {
                name: declared.as_string(),
                reason: "source must not be the declared output itself".into(),
            }
            .into());
        }

        let declared_abs = self.inner.ctx.native_of(&declared);
        let source_abs = self.inner.ctx.native_of(&source);

        if spec.kind == OutputKind::RegularFile
            && !spec.replace_by_same_content
            && same_regular_file_content(&declared_abs, &source_abs).await?
        {
            trace!(path = %declared, "output kept, content unchanged");
            crate::fs::remove_filesystem_object(&source_abs, false)
                .map_err(|source| WorkingTreeError::Io {
                    path: source_abs,
                    source,
                })?;
            return Ok(());
        }

        if let Some(parent) = declared_abs.parent() {
            std::fs::create_dir_all(parent).map_err(|source| WorkingTreeError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        match spec.kind {
            OutputKind::RegularFile => {}
            OutputKind::Directory | OutputKind::NonRegularFile => {
                // rename does not replace directories, and a symlink is
                // replaced explicitly rather than through it
                crate::fs::remove_filesystem_object(&declared_abs, true).map_err(|source| {
                    WorkingTreeError::Io {
                        path: declared_abs.clone(),
                        source,
                    }
                })?;
            }
        }
        std::fs::rename(&source_abs, &declared_abs).map_err(|source| WorkingTreeError::Io {
            path: declared_abs.clone(),
            source,
        })?;
        debug!(path = %declared, "output replaced");

        self.inner
            .modified_outputs
            .borrow_mut()
            .insert(declared.clone());
        let encoded = crate::rundb::encode_path(&declared).map_err(WorkingTreeError::Path)?;
        let mut db = self.inner.ctx.db().lock().await;
        let db = db.as_mut().ok_or(WorkingTreeError::NotRunning)?;
        db.declare_fsobject_input_as_modified(&encoded).await?;
        Ok(())
    }

    /// Runs a helper to completion; an exit code outside
    /// `expected_returncodes` is an error.
    #[instrument(name = "Redo::execute_helper", skip_all, fields(helper = %helper_name))]
    pub async fn execute_helper(
        &self,
        helper_name: &RelativePath,
        args: impl IntoIterator<Item = HelperArg>,
        options: ExecuteHelperOptions,
    ) -> Result<i32, Error> {
        self.ensure_running()?;
        let mut command = self.prepare_command(helper_name, args, &options)?;
        command.stdout(self.redirection(&options.stdout)?);
        command.stderr(self.redirection(&options.stderr)?);
        let status = command
            .status()
            .await
            .map_err(|source| HelperExecutionError::Spawn {
                helper: helper_name.as_string(),
                source,
            })?;
        self.expect_returncode(helper_name, status, &options.expected_returncodes)
    }

    /// Like [`Redo::execute_helper`], capturing one stream and returning
    /// its bytes (`capture_stderr` selects which; the other stream follows
    /// its redirection option).
    pub async fn execute_helper_with_output(
        &self,
        helper_name: &RelativePath,
        args: impl IntoIterator<Item = HelperArg>,
        options: ExecuteHelperOptions,
        capture_stderr: bool,
    ) -> Result<(i32, Vec<u8>), Error> {
        self.ensure_running()?;
        let mut command = self.prepare_command(helper_name, args, &options)?;
        if capture_stderr {
            command.stdout(self.redirection(&options.stdout)?);
            command.stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::piped());
            command.stderr(self.redirection(&options.stderr)?);
        }
        let mut child = command
            .spawn()
            .map_err(|source| HelperExecutionError::Spawn {
                helper: helper_name.as_string(),
                source,
            })?;
        let mut captured = Vec::new();
        if capture_stderr {
            let mut stream = child.stderr.take().expect("stderr was piped");
            stream.read_to_end(&mut captured).await.map_err(|source| {
                HelperExecutionError::Spawn {
                    helper: helper_name.as_string(),
                    source,
                }
            })?;
        } else {
            let mut stream = child.stdout.take().expect("stdout was piped");
            stream.read_to_end(&mut captured).await.map_err(|source| {
                HelperExecutionError::Spawn {
                    helper: helper_name.as_string(),
                    source,
                }
            })?;
        }
        let status = child
            .wait()
            .await
            .map_err(|source| HelperExecutionError::Spawn {
                helper: helper_name.as_string(),
                source,
            })?;
        let code = self.expect_returncode(helper_name, status, &options.expected_returncodes)?;
        Ok((code, captured))
    }

    /// Like [`Redo::execute_helper_with_output`], streaming the captured
    /// output through `process_chunk` per `separator`-delimited chunk. A
    /// chunk longer than `max_chunk_size` aborts the helper.
    pub async fn execute_helper_with_chunks(
        &self,
        helper_name: &RelativePath,
        args: impl IntoIterator<Item = HelperArg>,
        options: ExecuteHelperOptions,
        capture_stderr: bool,
        separator: u8,
        max_chunk_size: usize,
        mut process_chunk: impl FnMut(&[u8]) -> Result<(), Error>,
    ) -> Result<i32, Error> {
        self.ensure_running()?;
        let mut command = self.prepare_command(helper_name, args, &options)?;
        if capture_stderr {
            command.stdout(self.redirection(&options.stdout)?);
            command.stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::piped());
            command.stderr(self.redirection(&options.stderr)?);
        }
        let mut child = command
            .spawn()
            .map_err(|source| HelperExecutionError::Spawn {
                helper: helper_name.as_string(),
                source,
            })?;

        let spawn_error = |source| HelperExecutionError::Spawn {
            helper: helper_name.as_string(),
            source,
        };
        let mut buffer: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        let result = async {
            loop {
                let read = if capture_stderr {
                    let stream = child.stderr.as_mut().expect("stderr was piped");
                    stream.read(&mut chunk).await.map_err(spawn_error)?
                } else {
                    let stream = child.stdout.as_mut().expect("stdout was piped");
                    stream.read(&mut chunk).await.map_err(spawn_error)?
                };
                if read == 0 {
                    break;
                }
                buffer.extend(&chunk[..read]);
                while let Some(at) = buffer.iter().position(|b| *b == separator) {
                    if at > max_chunk_size {
                        return Err(Error::from(HelperExecutionError::ChunkTooLarge {
                            helper: helper_name.as_string(),
                            max_size: max_chunk_size,
                        }));
                    }
                    process_chunk(&buffer[..at])?;
                    buffer.drain(..=at);
                }
                if buffer.len() > max_chunk_size {
                    return Err(Error::from(HelperExecutionError::ChunkTooLarge {
                        helper: helper_name.as_string(),
                        max_size: max_chunk_size,
                    }));
                }
            }
            if !buffer.is_empty() {
                process_chunk(&buffer)?;
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            let _ = child.kill().await;
            return Err(e);
        }
        let status = child.wait().await.map_err(spawn_error)?;
        self.expect_returncode(helper_name, status, &options.expected_returncodes)
    }

    /// Low-level variant: the spawned child is handed to the caller (both
    /// streams piped, stdin piped as well).
    pub async fn execute_helper_raw(
        &self,
        helper_name: &RelativePath,
        args: impl IntoIterator<Item = HelperArg>,
        options: ExecuteHelperOptions,
    ) -> Result<tokio::process::Child, Error> {
        self.ensure_running()?;
        let mut command = self.prepare_command(helper_name, args, &options)?;
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command
            .spawn()
            .map_err(|source| HelperExecutionError::Spawn {
                helper: helper_name.as_string(),
                source,
            })
            .map_err(Error::from)
    }

    fn expect_returncode(
        &self,
        helper_name: &RelativePath,
        status: std::process::ExitStatus,
        expected: &[i32],
    ) -> Result<i32, Error> {
        let Some(code) = status.code() else {
            return Err(HelperExecutionError::TerminatedBySignal {
                helper: helper_name.as_string(),
            }
            .into());
        };
        if !expected.contains(&code) {
            return Err(HelperExecutionError::UnexpectedReturnCode {
                helper: helper_name.as_string(),
                returncode: code,
            }
            .into());
        }
        Ok(code)
    }

    fn redirection(&self, redirection: &OutputRedirection) -> Result<Stdio, Error> {
        match redirection {
            OutputRedirection::Inherit => Ok(Stdio::inherit()),
            OutputRedirection::Discard => Ok(Stdio::null()),
            OutputRedirection::File(path) => {
                let abs = self.inner.ctx.native_of(path);
                if let Some(parent) = abs.parent() {
                    std::fs::create_dir_all(parent).map_err(|source| WorkingTreeError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }
                let file = std::fs::File::create(&abs)
                    .map_err(|source| WorkingTreeError::Io { path: abs, source })?;
                Ok(Stdio::from(file))
            }
        }
    }

    fn prepare_command(
        &self,
        helper_name: &RelativePath,
        args: impl IntoIterator<Item = HelperArg>,
        options: &ExecuteHelperOptions,
    ) -> Result<tokio::process::Command, Error> {
        let helper = self.inner.ctx.helper(helper_name)?;
        if helper.is_dir() {
            return Err(DependencyError::InvalidValue {
                name: helper_name.as_string(),
                reason: "a helper must not be a directory".into(),
            }
            .into());
        }
        // a helper inside the working tree is an input of this redo
        if let Ok(rel) = self.inner.ctx.working_tree_path_of(&helper, true, false) {
            self.inner.helper_inputs.borrow_mut().insert(rel);
        }

        let cwd_rel = match &options.cwd {
            None => RelativePath::new(".").map_err(WorkingTreeError::Path)?,
            Some(cwd) => {
                let cwd = self.inner.ctx.working_tree_path_of(cwd, true, false)?;
                let abs = self.inner.ctx.native_of(&cwd);
                let metadata = std::fs::symlink_metadata(&abs)
                    .map_err(|_| WorkingTreeError::DoesNotExist { path: abs.clone() })?;
                if !metadata.is_dir() {
                    return Err(WorkingTreeError::Io {
                        path: abs,
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotADirectory,
                            "helper cwd must be a directory",
                        ),
                    }
                    .into());
                }
                cwd
            }
        };

        let mut prepared: Vec<std::ffi::OsString> = Vec::new();
        for arg in args {
            match arg {
                HelperArg::Str(s) => prepared.push(s.into()),
                HelperArg::Path(p) => {
                    prepared.push(self.argument_path(&p, &cwd_rel)?);
                }
            }
        }

        let helper_native = helper.native().map_err(WorkingTreeError::Path)?;
        let mut command = tokio::process::Command::new(helper_native.as_path());
        command.args(&prepared);
        command.current_dir(self.inner.ctx.native_of(&cwd_rel));
        command.env_clear();
        command.envs(self.inner.ctx.env_vars());
        command.envs(&options.forced_env);
        command.kill_on_drop(true);
        Ok(command)
    }

    /// Rewrites a path argument to be correct from the helper's working
    /// directory: absolute paths stay absolute, working-tree paths become
    /// relative to `cwd` (a `..` that would cross a symlink is an error).
    fn argument_path(
        &self,
        path: &crate::fs::Path<Unrestricted>,
        cwd: &RelativePath,
    ) -> Result<std::ffi::OsString, Error> {
        if path.is_absolute() {
            return Ok(path
                .native()
                .map_err(WorkingTreeError::Path)?
                .as_os_string());
        }
        let tree_path = self.inner.ctx.working_tree_path_of(path, false, false)?;
        let relative = tree_path
            .relative_to(cwd, true)
            .map_err(WorkingTreeError::Path)?;
        // emitted ".." components must not cross a symlink below cwd
        let ascents = relative.components().take_while(|c| *c == "..").count();
        let mut probe: PathBuf = self.inner.ctx.native_of(cwd);
        for _ in 0..ascents {
            match std::fs::symlink_metadata(&probe) {
                Ok(m) if m.file_type().is_symlink() => {
                    return Err(WorkingTreeError::Uncollapsable { path: probe }.into());
                }
                _ => {}
            }
            probe.pop();
        }
        Ok(relative
            .native()
            .map_err(WorkingTreeError::Path)?
            .as_os_string())
    }

    /// Terminates the facade and yields what the redo produced; called by
    /// the engine after the body returned.
    pub(crate) fn finish(
        &self,
    ) -> (
        BTreeMap<String, DependencyValue>,
        BTreeSet<RelativePath>,
        BTreeSet<RelativePath>,
    ) {
        self.inner.terminated.set(true);
        (
            self.inner.assigned.borrow().clone(),
            self.inner.modified_outputs.borrow().clone(),
            self.inner.helper_inputs.borrow().clone(),
        )
    }

}

/// Compares two regular files by content, cheaply rejecting on size.
async fn same_regular_file_content(a: &std::path::Path, b: &std::path::Path) -> Result<bool, Error> {
    let (meta_a, meta_b) = (std::fs::symlink_metadata(a), std::fs::symlink_metadata(b));
    let (Ok(meta_a), Ok(meta_b)) = (meta_a, meta_b) else {
        return Ok(false);
    };
    if !meta_a.is_file() || !meta_b.is_file() || meta_a.len() != meta_b.len() {
        return Ok(false);
    }
    Ok(hash_file(a).await? == hash_file(b).await?)
}

async fn hash_file(path: &std::path::Path) -> Result<blake3::Hash, Error> {
    let io_error = |source| {
        Error::from(WorkingTreeError::Io {
            path: path.to_path_buf(),
            source,
        })
    };
    let mut file = tokio::fs::File::open(path).await.map_err(io_error)?;
    let mut hasher = blake3::Hasher::new();
    let mut data = vec![0; 64 * 1024];
    loop {
        let len = file.read(&mut data).await.map_err(io_error)?;
        if len == 0 {
            break;
        }
        hasher.update(&data[..len]);
    }
    Ok(hasher.finalize())
}

impl Dependency {
    /// The output kind of a path output descriptor, if it is one.
    pub(crate) fn output_kind(&self) -> Option<OutputKind> {
        use crate::tool::dependency::DependencyKind;
        match self.kind() {
            DependencyKind::RegularFile { .. } => Some(OutputKind::RegularFile),
            DependencyKind::NonRegularFile { .. } => Some(OutputKind::NonRegularFile),
            DependencyKind::Directory { .. } => Some(OutputKind::Directory),
            _ => None,
        }
    }
}

pub(crate) fn output_obstruction_is_wrong_kind(
    metadata: &std::fs::Metadata,
    kind: OutputKind,
) -> bool {
    !kind.describes(metadata)
}
