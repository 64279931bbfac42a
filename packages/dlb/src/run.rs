//! The redo engine: run requests, the redo decision, redo tasks and
//! result proxies.
//!
//! [`ToolInstance::start`] validates the instance against the working
//! tree, consults the run-database for evidence of the last redo and
//! either returns a completed non-redo proxy or enqueues a redo task on
//! the context's sequencer. A redo task builds the [`crate::redo::Redo`]
//! facade, awaits the user's redo body, and commits fresh evidence in one
//! transaction; a failed redo leaves the instance's evidence untouched so
//! the next run redoes again.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use futures::FutureExt;
use tracing::{debug, info, instrument};

use crate::context::Context;
use crate::error::{DependencyError, Error, RedoError, WorkingTreeError};
use crate::fs::path::RelativePath;
use crate::redo::{OutputKind, OutputSpec, Redo};
use crate::rundb::encode_path;
use crate::sequencer::TaskId;
use crate::tool::dependency::{DependencyKind, DependencyRole, DependencyValue};
use crate::tool::ToolInstance;

/// What a completed redo produced.
pub(crate) struct RedoOutcome {
    /// The redo body's return value; `true` requests a redo on the next
    /// run regardless of evidence.
    pub(crate) returned: bool,
    /// Realised dependency values: explicit, engine-realised environment
    /// values and values assigned by the redo body.
    pub(crate) values: BTreeMap<String, DependencyValue>,
}

pub(crate) type RedoTaskResult = Result<RedoOutcome, Error>;

fn kind_description(kind: OutputKind) -> &'static str {
    match kind {
        OutputKind::RegularFile => "a regular file",
        OutputKind::NonRegularFile => "a non-regular file",
        OutputKind::Directory => "a directory",
    }
}

/// Per-instance data resolved by the validation step.
struct ResolvedRun {
    tool_id: Vec<u8>,
    fingerprint: Vec<u8>,
    /// Explicit in-tree input paths with the kind they must have.
    explicit_inputs: Vec<(String, RelativePath, OutputKind)>,
    /// Explicit input paths outside the working tree (readable, never
    /// recorded as evidence).
    external_inputs: Vec<(String, std::path::PathBuf, OutputKind)>,
    /// Definition source files inside the working tree.
    definition_files: Vec<RelativePath>,
    /// Declared explicit outputs.
    outputs: BTreeMap<RelativePath, OutputSpec>,
    /// Values of non-explicit environment variable dependencies, by
    /// dependency name.
    realized_env: BTreeMap<String, String>,
}

impl ToolInstance {
    /// Requests a run of this instance: decides whether a redo is
    /// required and, if so, enqueues it. Validation errors surface here;
    /// errors of the redo itself surface through the returned proxy.
    #[instrument(name = "ToolInstance::start", skip_all, fields(tool = self.definition().name()))]
    pub async fn start(&self, ctx: &Context, force_redo: bool) -> Result<RunResult, Error> {
        ctx.assert_open()?;
        if ctx.sequencer().is_driving() {
            return Err(RedoError::ForbiddenInRedo {
                operation: "starting a tool instance",
            }
            .into());
        }

        let resolved = self.resolve(ctx)?;

        // redo coalescing: a run for the same effective configuration is
        // already under way
        let key = (resolved.tool_id.clone(), resolved.fingerprint.clone());
        let coalesced = ctx.inner().active_runs.borrow().get(&key).cloned();
        if let Some(existing) = coalesced {
            if !existing.is_complete() {
                debug!("coalesced with a pending run");
                return Ok(existing);
            }
            ctx.inner().active_runs.borrow_mut().remove(&key);
        }

        // pending redos that write below this instance's inputs must
        // complete first so the decision sees their evidence
        let mut input_encoded: Vec<String> = Vec::new();
        for (_, rel, _) in &resolved.explicit_inputs {
            input_encoded.push(encode_path(rel).map_err(WorkingTreeError::Path)?);
        }
        for rel in &resolved.definition_files {
            input_encoded.push(encode_path(rel).map_err(WorkingTreeError::Path)?);
        }
        let conflicting: Vec<RunResult> = ctx
            .inner()
            .active_runs
            .borrow()
            .values()
            .filter(|run| !run.is_complete() && run.outputs_intersect(&input_encoded))
            .cloned()
            .collect();
        for run in conflicting {
            // its own error stays with its own proxy
            let _ = run.complete().await;
        }

        // explicit inputs must exist with the declared kind, once every
        // pending producer had its chance to create them
        for (name, rel, expected) in &resolved.explicit_inputs {
            let abs = ctx.native_of(rel);
            check_object_kind(name, &abs, *expected)?;
        }
        for (name, abs, expected) in &resolved.external_inputs {
            check_object_kind(name, abs, *expected)?;
        }

        let (dbid, redo_reason) = {
            let mut guard = ctx.db().lock().await;
            let db = guard.as_mut().ok_or(WorkingTreeError::NotRunning)?;
            let dbid = db
                .register_tool_instance(&resolved.tool_id, &resolved.fingerprint)
                .await?;
            let reason = redo_decision(ctx, db, dbid, &resolved, force_redo).await?;
            (dbid, reason)
        };

        let Some(reason) = redo_reason else {
            debug!("no redo necessary");
            return Ok(RunResult::no_redo(ctx.clone(), self.result_values(&resolved)));
        };
        info!(%reason, "redo");

        let output_encoded: Vec<String> = resolved
            .outputs
            .keys()
            .map(|rel| encode_path(rel).map_err(WorkingTreeError::Path))
            .collect::<Result<_, _>>()?;

        let task = redo_task(ctx.clone(), self.clone(), dbid, resolved).boxed_local();
        let tid = ctx.sequencer().submit(task, None).await?;
        let proxy = RunResult::pending(ctx.clone(), key.clone(), tid, output_encoded);
        ctx.inner()
            .active_runs
            .borrow_mut()
            .insert(key, proxy.clone());
        Ok(proxy)
    }

    /// Validates the instance against the context and working tree and
    /// resolves everything the decision and the redo task need.
    fn resolve(&self, ctx: &Context) -> Result<ResolvedRun, Error> {
        let mut explicit_inputs: Vec<(String, RelativePath, OutputKind)> = Vec::new();
        let mut external_inputs: Vec<(String, std::path::PathBuf, OutputKind)> = Vec::new();
        let mut outputs: BTreeMap<RelativePath, OutputSpec> = BTreeMap::new();
        let mut output_names: BTreeMap<RelativePath, String> = BTreeMap::new();
        let mut realized_env: BTreeMap<String, String> = BTreeMap::new();

        for (name, dep) in self.definition().dependencies() {
            match (dep.role(), dep.kind()) {
                (DependencyRole::Input, DependencyKind::EnvVar { var, .. }) => {
                    if dep.is_explicit() {
                        continue; // realised at instantiation, part of the fingerprint
                    }
                    match ctx.env_var(var) {
                        Some(value) => {
                            let checked = dep
                                .validate_value(name, Some(&DependencyValue::Str(value)))?
                                .expect("a provided value validates to a value");
                            let DependencyValue::Str(value) = checked else {
                                unreachable!("environment values are strings");
                            };
                            realized_env.insert(name.to_owned(), value);
                        }
                        None if dep.is_required() => {
                            return Err(DependencyError::EnvVarUndefined {
                                name: name.to_owned(),
                                var: var.clone(),
                            }
                            .into());
                        }
                        None => {}
                    }
                }
                (DependencyRole::Input, kind) if kind.is_path() => {
                    let expected = dep.output_kind().expect("path kinds have an object kind");
                    let Some(value) = self.value(name) else {
                        continue;
                    };
                    for path in value.each_path() {
                        match ctx.working_tree_path_of(path, false, false) {
                            Ok(rel) => {
                                explicit_inputs.push((name.to_owned(), rel, expected));
                            }
                            Err(Error::WorkingTree(WorkingTreeError::OutsideTree { .. }))
                                if path.is_absolute() =>
                            {
                                // inputs may be read from outside the tree
                                let native =
                                    path.native().map_err(WorkingTreeError::Path)?;
                                external_inputs.push((
                                    name.to_owned(),
                                    native.into_path_buf(),
                                    expected,
                                ));
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                (DependencyRole::Output, kind) if kind.is_path() => {
                    let output_kind = dep.output_kind().expect("path kinds have an object kind");
                    let Some(value) = self.value(name) else {
                        continue;
                    };
                    for path in value.each_path() {
                        let rel = ctx
                            .working_tree_path_of(path, false, false)
                            .map_err(|e| match e {
                                Error::WorkingTree(WorkingTreeError::OutsideTree { .. }) => {
                                    DependencyError::InvalidValue {
                                        name: name.to_owned(),
                                        reason: format!(
                                            "output path is outside the working tree: {path:?}"
                                        ),
                                    }
                                    .into()
                                }
                                other => other,
                            })?;
                        if let Some(first) = output_names.get(&rel) {
                            return Err(DependencyError::DuplicateOutput {
                                first: first.clone(),
                                second: name.to_owned(),
                                path: rel.as_string(),
                            }
                            .into());
                        }
                        output_names.insert(rel.clone(), name.to_owned());
                        outputs.insert(
                            rel,
                            OutputSpec {
                                dependency_name: name.to_owned(),
                                kind: output_kind,
                                replace_by_same_content: match dep.kind() {
                                    DependencyKind::RegularFile {
                                        replace_by_same_content,
                                        ..
                                    } => *replace_by_same_content,
                                    _ => true,
                                },
                            },
                        );
                    }
                }
                _ => {}
            }
        }

        for (_, rel, _) in &explicit_inputs {
            if outputs.contains_key(rel) {
                return Err(DependencyError::InputIsOutput {
                    path: rel.as_string(),
                }
                .into());
            }
        }

        // definition source files inside the working tree are implicit
        // inputs and participate in the tool identity
        let mut definition_files: Vec<RelativePath> = Vec::new();
        let mut in_tree_contents: Vec<(String, Vec<u8>)> = Vec::new();
        for file in self.definition().definition_files() {
            let Ok(rel) = ctx.working_tree_path_of_str(file, true, true) else {
                continue;
            };
            let abs = ctx.native_of(&rel);
            let content = std::fs::read(&abs).map_err(|source| WorkingTreeError::Io {
                path: abs,
                source,
            })?;
            in_tree_contents.push((rel.as_string(), content));
            definition_files.push(rel);
        }
        let contents_refs: Vec<(&str, &[u8])> = in_tree_contents
            .iter()
            .map(|(name, content)| (name.as_str(), content.as_slice()))
            .collect();
        let tool_id = self.definition().permanent_local_tool_id(&contents_refs);
        let fingerprint = self.fingerprint(&realized_env);

        Ok(ResolvedRun {
            tool_id,
            fingerprint,
            explicit_inputs,
            external_inputs,
            definition_files,
            outputs,
            realized_env,
        })
    }

    /// The values a result proxy exposes before any redo body ran.
    fn result_values(&self, resolved: &ResolvedRun) -> BTreeMap<String, DependencyValue> {
        let mut values = self.values().clone();
        for (name, value) in &resolved.realized_env {
            values.insert(name.clone(), DependencyValue::Str(value.clone()));
        }
        values
    }
}

fn check_object_kind(
    name: &str,
    abs: &std::path::Path,
    expected: OutputKind,
) -> Result<(), Error> {
    let matches = std::fs::symlink_metadata(abs)
        .map(|metadata| match expected {
            OutputKind::RegularFile => metadata.is_file(),
            OutputKind::Directory => metadata.is_dir(),
            OutputKind::NonRegularFile => !metadata.is_file() && !metadata.is_dir(),
        })
        .unwrap_or(false);
    if !matches {
        return Err(DependencyError::WrongFilesystemObject {
            name: name.to_owned(),
            path: abs.display().to_string(),
            expected: kind_description(expected),
        }
        .into());
    }
    Ok(())
}

/// Why a redo is required, for the build log.
#[derive(Debug, derive_more::Display)]
enum RedoReason {
    #[display("explicitly forced")]
    Forced,
    #[display("tool instance was never run with this configuration")]
    NeverRan,
    #[display("last redo requested another run")]
    RequestedByLastRedo,
    #[display("state of input {_0:?} before the last redo is unknown")]
    InputInvalidated(String),
    #[display("input {_0:?} has changed")]
    InputChanged(String),
    #[display("output {_0:?} is missing or not {_1}")]
    OutputNotAsExpected(String, &'static str),
}

async fn redo_decision(
    ctx: &Context,
    db: &mut crate::rundb::RunDatabase,
    dbid: i64,
    resolved: &ResolvedRun,
    force_redo: bool,
) -> Result<Option<RedoReason>, Error> {
    if force_redo {
        return Ok(Some(RedoReason::Forced));
    }
    let Some((returned, _at)) = db.get_redo_state(dbid).await? else {
        return Ok(Some(RedoReason::NeverRan));
    };
    if returned {
        return Ok(Some(RedoReason::RequestedByLastRedo));
    }

    for (encoded, (_is_explicit, memo)) in db.get_fsobject_inputs(dbid, None).await? {
        let Some(recorded) = memo else {
            return Ok(Some(RedoReason::InputInvalidated(encoded)));
        };
        let rel = crate::rundb::decode_path(&encoded, true).map_err(WorkingTreeError::Path)?;
        let abs = ctx.native_of(&rel);
        let fresh = crate::fs::read_memo(&abs)
            .map_err(|source| WorkingTreeError::Io {
                path: abs.clone(),
                source,
            })?
            .encode()
            .map_err(|e| crate::error::DatabaseError::new(e.to_string()))?;
        if fresh != recorded {
            return Ok(Some(RedoReason::InputChanged(encoded)));
        }
    }

    for (rel, spec) in &resolved.outputs {
        let abs = ctx.native_of(rel);
        let as_expected = std::fs::symlink_metadata(&abs)
            .map(|metadata| !crate::redo::output_obstruction_is_wrong_kind(&metadata, spec.kind))
            .unwrap_or(false);
        if !as_expected {
            return Ok(Some(RedoReason::OutputNotAsExpected(
                rel.as_string(),
                kind_description(spec.kind),
            )));
        }
    }

    Ok(None)
}

/// The enqueued redo task.
async fn redo_task(
    ctx: Context,
    instance: ToolInstance,
    dbid: i64,
    resolved: ResolvedRun,
) -> RedoTaskResult {
    // obstructing explicit outputs of the wrong kind are removed; objects
    // of the right kind are kept for in-place overwriting
    for (rel, spec) in &resolved.outputs {
        let abs = ctx.native_of(rel);
        if let Ok(metadata) = std::fs::symlink_metadata(&abs) {
            if crate::redo::output_obstruction_is_wrong_kind(&metadata, spec.kind) {
                debug!(path = %rel, dependency = %spec.dependency_name, "removing obstructing output");
                crate::fs::remove_filesystem_object(&abs, true).map_err(|source| {
                    WorkingTreeError::Io { path: abs, source }
                })?;
            }
        }
    }

    let mut visible_values = instance.values().clone();
    for (name, value) in &resolved.realized_env {
        visible_values.insert(name.clone(), DependencyValue::Str(value.clone()));
    }
    let redo = Redo::new(
        ctx.clone(),
        instance.definition().clone(),
        visible_values,
        resolved.outputs.clone(),
    );
    let body = instance.definition().redo_body();
    let body_result = body(redo.clone()).await;
    let (assigned, _modified_outputs, helper_inputs) = redo.finish();
    let returned = body_result?;

    // every required non-explicit dependency must have been populated
    for (name, dep) in instance.definition().dependencies() {
        if dep.is_explicit() || !dep.is_required() {
            continue;
        }
        if assigned.contains_key(name) || resolved.realized_env.contains_key(name) {
            continue;
        }
        return Err(RedoError::UnassignedRequired {
            name: name.to_owned(),
        }
        .into());
    }

    // fresh evidence: explicit inputs, implicit inputs (definition files,
    // helpers, redo-reported inputs), and the declared outputs
    let mut observed: Vec<(RelativePath, bool)> = Vec::new();
    for (_, rel, _) in &resolved.explicit_inputs {
        observed.push((rel.clone(), true));
    }
    for rel in &resolved.definition_files {
        observed.push((rel.clone(), false));
    }
    for rel in &helper_inputs {
        observed.push((rel.clone(), false));
    }

    let mut assigned_output_paths: Vec<RelativePath> = Vec::new();
    for (name, value) in &assigned {
        let dep = instance
            .definition()
            .dependency(name)
            .expect("assignment was validated against the definition");
        if !dep.kind().is_path() {
            continue;
        }
        for path in value.each_path() {
            match ctx.working_tree_path_of(path, false, false) {
                Ok(rel) => {
                    if dep.role() == DependencyRole::Output {
                        assigned_output_paths.push(rel.clone());
                    }
                    observed.push((rel, false));
                }
                // inputs outside the working tree leave no evidence
                Err(Error::WorkingTree(WorkingTreeError::OutsideTree { .. }))
                    if path.is_absolute() && dep.role() == DependencyRole::Input => {}
                Err(e) => return Err(e),
            }
        }
    }

    for rel in resolved.outputs.keys() {
        observed.push((rel.clone(), true));
    }

    let mut memos: Vec<(String, bool, crate::fs::FilesystemObjectMemo)> = Vec::new();
    for (rel, is_explicit) in &observed {
        let abs = ctx.native_of(rel);
        let memo = crate::fs::read_memo(&abs).map_err(|source| WorkingTreeError::Io {
            path: abs,
            source,
        })?;
        let encoded = encode_path(rel).map_err(WorkingTreeError::Path)?;
        memos.push((encoded, *is_explicit, memo));
    }

    // a memo is usable evidence only when its mtime is strictly older
    // than the working-tree time sampled after the redo; dwell briefly so
    // objects just written by this redo end up usable
    let newest = memos
        .iter()
        .filter_map(|(_, _, memo)| memo.stat.map(|s| s.mtime_ns))
        .max();
    let mut worktree_time_after = ctx.worktree_time()?;
    if let Some(newest) = newest {
        let mut tries = 0;
        while worktree_time_after <= newest && tries < 500 {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            worktree_time_after = ctx.worktree_time()?;
            tries += 1;
        }
    }

    let mut rows: BTreeMap<String, (bool, Option<Vec<u8>>)> = BTreeMap::new();
    for (encoded, is_explicit, memo) in memos {
        let fresh_enough = memo
            .stat
            .map(|s| s.mtime_ns < worktree_time_after)
            .unwrap_or(true);
        let blob = if fresh_enough {
            Some(
                memo.encode()
                    .map_err(|e| crate::error::DatabaseError::new(e.to_string()))?,
            )
        } else {
            None // modified during or after this redo: state unknown
        };
        rows.insert(encoded, (is_explicit, blob));
    }

    {
        let mut guard = ctx.db().lock().await;
        let db = guard.as_mut().ok_or(WorkingTreeError::NotRunning)?;
        // writes of this redo invalidate every other instance's evidence
        // below the outputs, before this instance's own fresh rows land
        for rel in resolved.outputs.keys().chain(&assigned_output_paths) {
            let encoded = encode_path(rel).map_err(WorkingTreeError::Path)?;
            db.declare_fsobject_input_as_modified(&encoded).await?;
        }
        db.replace_fsobject_inputs(dbid, &rows).await?;
        db.set_redo_state(dbid, returned, worktree_time_after).await?;
    }

    let mut values = instance.values().clone();
    for (name, value) in &resolved.realized_env {
        values.insert(name.clone(), DependencyValue::Str(value.clone()));
    }
    values.extend(assigned);

    Ok(RedoOutcome { returned, values })
}

enum RunState {
    NoRedo {
        values: BTreeMap<String, DependencyValue>,
    },
    Pending {
        tid: TaskId,
    },
    Done {
        returned: bool,
        values: BTreeMap<String, DependencyValue>,
    },
    Failed {
        error: Option<Error>,
        headline: String,
    },
}

struct RunShared {
    ctx: Context,
    key: Option<(Vec<u8>, Vec<u8>)>,
    output_encoded: Vec<String>,
    state: RefCell<RunState>,
}

/// Result proxy of one run request.
///
/// A proxy for a skipped run is complete immediately; a proxy for an
/// enqueued redo completes when the task is driven to completion.
/// [`RunResult::did_redo`] inspects without driving;
/// [`RunResult::complete`] and [`RunResult::dependency_value`] drive the
/// sequencer and re-raise the redo's error.
#[derive(Clone)]
pub struct RunResult {
    shared: Rc<RunShared>,
}

impl std::fmt::Debug for RunResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.shared.state.borrow() {
            RunState::NoRedo { .. } => "no-redo",
            RunState::Pending { .. } => "pending",
            RunState::Done { .. } => "redone",
            RunState::Failed { .. } => "failed",
        };
        write!(f, "RunResult({state})")
    }
}

impl RunResult {
    fn no_redo(ctx: Context, values: BTreeMap<String, DependencyValue>) -> RunResult {
        RunResult {
            shared: Rc::new(RunShared {
                ctx,
                key: None,
                output_encoded: Vec::new(),
                state: RefCell::new(RunState::NoRedo { values }),
            }),
        }
    }

    fn pending(
        ctx: Context,
        key: (Vec<u8>, Vec<u8>),
        tid: TaskId,
        output_encoded: Vec<String>,
    ) -> RunResult {
        RunResult {
            shared: Rc::new(RunShared {
                ctx,
                key: Some(key),
                output_encoded,
                state: RefCell::new(RunState::Pending { tid }),
            }),
        }
    }

    /// True iff the run has reached a terminal state (including "no redo
    /// was necessary").
    pub fn is_complete(&self) -> bool {
        !matches!(&*self.shared.state.borrow(), RunState::Pending { .. })
    }

    /// `Some(false)` iff no redo was necessary, `Some(true)` iff a redo
    /// ran (successfully or not), `None` while the task is pending.
    pub fn did_redo(&self) -> Option<bool> {
        match &*self.shared.state.borrow() {
            RunState::NoRedo { .. } => Some(false),
            RunState::Pending { .. } => None,
            RunState::Done { .. } | RunState::Failed { .. } => Some(true),
        }
    }

    /// Drives the sequencer until this run completes. Returns whether a
    /// redo was performed; a failed redo's error is returned on the first
    /// call and summarised on later ones.
    pub async fn complete(&self) -> Result<bool, Error> {
        enum Step {
            NoRedo,
            Done,
            Failed,
            Pending(TaskId),
        }
        let step = match &*self.shared.state.borrow() {
            RunState::NoRedo { .. } => Step::NoRedo,
            RunState::Done { .. } => Step::Done,
            RunState::Failed { .. } => Step::Failed,
            RunState::Pending { tid } => Step::Pending(*tid),
        };
        let tid = match step {
            Step::NoRedo => return Ok(false),
            Step::Done => return Ok(true),
            Step::Failed => return Err(self.take_failure()),
            Step::Pending(tid) => tid,
        };

        self.shared.ctx.sequencer().complete(tid).await?;
        self.absorb(tid);
        let failed = matches!(&*self.shared.state.borrow(), RunState::Failed { .. });
        if failed {
            return Err(self.take_failure());
        }
        Ok(true)
    }

    /// Forces completion, then returns the realised value of a dependency
    /// (explicit, or assigned by the redo body); `None` when absent.
    pub async fn dependency_value(&self, name: &str) -> Result<Option<DependencyValue>, Error> {
        self.complete().await?;
        match &*self.shared.state.borrow() {
            RunState::NoRedo { values } | RunState::Done { values, .. } => {
                Ok(values.get(name).cloned())
            }
            _ => unreachable!("complete() returned successfully"),
        }
    }

    /// The redo body's returned flag, once complete.
    pub async fn redo_requested_again(&self) -> Result<bool, Error> {
        self.complete().await?;
        match &*self.shared.state.borrow() {
            RunState::Done { returned, .. } => Ok(*returned),
            RunState::NoRedo { .. } => Ok(false),
            _ => unreachable!("complete() returned successfully"),
        }
    }

    fn take_failure(&self) -> Error {
        let mut state = self.shared.state.borrow_mut();
        let RunState::Failed { error, headline } = &mut *state else {
            unreachable!("caller checked the state");
        };
        error.take().unwrap_or_else(|| {
            RedoError::PreviouslyFailed {
                headline: headline.clone(),
            }
            .into()
        })
    }

    /// Moves a finished task's result into the proxy (consuming it from
    /// the sequencer) without driving; called after the sequencer has
    /// completed the task.
    pub(crate) fn absorb(&self, tid: TaskId) {
        if !self.shared.ctx.sequencer().is_finished(tid) {
            return;
        }
        let next = match self.shared.ctx.sequencer().consume(tid) {
            Ok(Ok(outcome)) => RunState::Done {
                returned: outcome.returned,
                values: outcome.values,
            },
            Ok(Err(error)) => RunState::Failed {
                headline: error.to_string(),
                error: Some(error),
            },
            Err(consume_error) => RunState::Failed {
                headline: consume_error.to_string(),
                error: Some(consume_error.into()),
            },
        };
        *self.shared.state.borrow_mut() = next;
        if let Some(key) = &self.shared.key {
            self.shared.ctx.inner().active_runs.borrow_mut().remove(key);
        }
    }

    /// Absorbs the result if the task already finished; used at context
    /// exit. Returns the stored failure, if any and not yet taken.
    pub(crate) fn finish_at_exit(&self) -> Option<Error> {
        let tid = match &*self.shared.state.borrow() {
            RunState::Pending { tid } => Some(*tid),
            _ => None,
        };
        if let Some(tid) = tid {
            self.absorb(tid);
        }
        let mut state = self.shared.state.borrow_mut();
        match &mut *state {
            RunState::Failed { error, .. } => error.take(),
            _ => None,
        }
    }

    /// True iff any of this run's declared outputs lies at, below or
    /// above one of `encoded` (encoded-path prefix relation).
    pub(crate) fn outputs_intersect(&self, encoded: &[String]) -> bool {
        self.shared.output_encoded.iter().any(|out| {
            encoded
                .iter()
                .any(|input| out == input || out.starts_with(input.as_str()) || input.starts_with(out.as_str()))
        })
    }
}
