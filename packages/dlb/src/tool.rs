//! Tool definitions and tool instances.
//!
//! A [`ToolDefinition`] is the static description of a parameterised unit
//! of work: named dependency descriptors, execution parameters and the
//! redo body. Definitions are built by an explicit builder and registered
//! by their definition location (source file and line); two definitions
//! at the same location are forbidden, which rules out generating
//! distinct tools dynamically from one line.
//!
//! A [`ToolInstance`] freezes a definition together with validated
//! explicit dependency values. Its fingerprint identifies the effective
//! configuration; together with the *permanent local tool ID* it keys the
//! run-database evidence.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;
use std::sync::{Mutex, OnceLock};

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use regex::Regex;

use crate::error::{DefinitionError, DependencyError, Error, ExecutionParameterError};

pub mod dependency;
pub mod param;

pub use dependency::{
    Dependency, DependencyKind, DependencyRole, DependencyValue, MultiplicityRange,
};
pub use param::ParamValue;

/// The user-supplied redo body: a closure from the redo handle to a
/// future; its `Ok` value requests another redo on the next run when true.
pub type RedoBody =
    Rc<dyn Fn(crate::redo::Redo) -> LocalBoxFuture<'static, Result<bool, Error>>>;

/// Where a tool definition was written.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, derive_more::Display)]
#[display("{file}:{line}")]
pub struct DefinitionLocation {
    pub file: &'static str,
    pub line: u32,
}

fn definition_registry() -> &'static Mutex<HashMap<DefinitionLocation, String>> {
    static REGISTRY: OnceLock<Mutex<HashMap<DefinitionLocation, String>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn parameter_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[A-Z][A-Z0-9]*(_[A-Z0-9]+)*$").expect("valid expression"))
}

fn dependency_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[a-z][a-z0-9]*(_[a-z0-9]+)*$").expect("valid expression"))
}

struct DefinitionInner {
    name: String,
    dependencies: BTreeMap<String, Dependency>,
    params: BTreeMap<String, ParamValue>,
    redo: RedoBody,
    location: DefinitionLocation,
    /// Source files participating in the definition, base chain first.
    definition_files: Vec<&'static str>,
}

/// See the module documentation.
#[derive(Clone)]
pub struct ToolDefinition {
    inner: Rc<DefinitionInner>,
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.inner.name)
            .field("location", &self.inner.location)
            .field("dependencies", &self.inner.dependencies.keys())
            .field("params", &self.inner.params.keys())
            .finish()
    }
}

impl ToolDefinition {
    pub fn builder(name: impl Into<String>) -> ToolDefinitionBuilder {
        ToolDefinitionBuilder {
            name: name.into(),
            base: None,
            dependencies: Vec::new(),
            params: Vec::new(),
            redo: None,
        }
    }

    /// Derives a new definition from `self`; redefined attributes must be
    /// at least as restrictive (dependencies) or of the same value type
    /// (execution parameters).
    pub fn extend(&self, name: impl Into<String>) -> ToolDefinitionBuilder {
        ToolDefinitionBuilder {
            name: name.into(),
            base: Some(self.clone()),
            dependencies: Vec::new(),
            params: Vec::new(),
            redo: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn location(&self) -> DefinitionLocation {
        self.inner.location
    }

    pub fn dependency(&self, name: &str) -> Option<&Dependency> {
        self.inner.dependencies.get(name)
    }

    /// Dependencies in canonical (name) order.
    pub fn dependencies(&self) -> impl Iterator<Item = (&str, &Dependency)> {
        self.inner
            .dependencies
            .iter()
            .map(|(n, d)| (n.as_str(), d))
    }

    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.inner.params.get(name)
    }

    pub(crate) fn redo_body(&self) -> RedoBody {
        Rc::clone(&self.inner.redo)
    }

    pub(crate) fn definition_files(&self) -> &[&'static str] {
        &self.inner.definition_files
    }

    /// The *permanent local tool ID*: a content hash over the declared
    /// dependency shape and the bytes of every definition source file that
    /// lies inside the working tree (`in_tree_files`, resolved by the
    /// caller).
    pub(crate) fn permanent_local_tool_id(&self, in_tree_files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.inner.name.as_bytes());
        for (name, dep) in &self.inner.dependencies {
            hasher.update(&(name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update(&dep.identity());
        }
        for (file, content) in in_tree_files {
            hasher.update(&(file.len() as u64).to_le_bytes());
            hasher.update(file.as_bytes());
            hasher.update(&(content.len() as u64).to_le_bytes());
            hasher.update(content);
        }
        hasher.finalize().as_bytes().to_vec()
    }

    /// Creates a tool instance from explicit dependency values.
    pub fn instance<'a>(
        &self,
        values: impl IntoIterator<Item = (&'a str, DependencyValue)>,
    ) -> Result<ToolInstance, Error> {
        let mut provided: BTreeMap<String, DependencyValue> = BTreeMap::new();
        for (name, value) in values {
            let Some(dep) = self.inner.dependencies.get(name) else {
                return Err(DependencyError::Unknown {
                    name: name.to_owned(),
                }
                .into());
            };
            if !dep.is_explicit() {
                return Err(DependencyError::NotExplicit {
                    name: name.to_owned(),
                }
                .into());
            }
            provided.insert(name.to_owned(), value);
        }

        let mut validated: BTreeMap<String, DependencyValue> = BTreeMap::new();
        for (name, dep) in &self.inner.dependencies {
            if !dep.is_explicit() {
                continue;
            }
            if let Some(value) = dep.validate_value(name, provided.get(name.as_str()))? {
                validated.insert(name.clone(), value);
            }
        }
        Ok(ToolInstance {
            definition: self.clone(),
            values: validated,
        })
    }
}

/// Builder for [`ToolDefinition`]; validation happens in
/// [`ToolDefinitionBuilder::build`].
pub struct ToolDefinitionBuilder {
    name: String,
    base: Option<ToolDefinition>,
    dependencies: Vec<(String, Dependency)>,
    params: Vec<(String, ParamValue)>,
    redo: Option<RedoBody>,
}

impl ToolDefinitionBuilder {
    /// Declares an input dependency.
    pub fn input(mut self, name: impl Into<String>, dependency: Dependency) -> Self {
        self.dependencies.push((name.into(), dependency.input()));
        self
    }

    /// Declares an output dependency.
    pub fn output(mut self, name: impl Into<String>, dependency: Dependency) -> Self {
        self.dependencies.push((name.into(), dependency.output()));
        self
    }

    /// Declares an execution parameter.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Declares the redo body.
    pub fn redo<F, Fut>(mut self, redo: F) -> Self
    where
        F: Fn(crate::redo::Redo) -> Fut + 'static,
        Fut: Future<Output = Result<bool, Error>> + 'static,
    {
        self.redo = Some(Rc::new(move |handle| redo(handle).boxed_local()));
        self
    }

    /// Validates and registers the definition. The caller's source
    /// location becomes the definition location; a second definition at
    /// the same location is an error.
    #[track_caller]
    pub fn build(self) -> Result<ToolDefinition, Error> {
        let caller = std::panic::Location::caller();
        let location = DefinitionLocation {
            file: caller.file(),
            line: caller.line(),
        };

        let (mut dependencies, mut params, mut definition_files) = match &self.base {
            Some(base) => (
                base.inner.dependencies.clone(),
                base.inner.params.clone(),
                base.inner.definition_files.to_vec(),
            ),
            None => (BTreeMap::new(), BTreeMap::new(), Vec::new()),
        };

        let mut own_names: Vec<&str> = Vec::new();
        for (name, dep) in &self.dependencies {
            if !dependency_name_regex().is_match(name) {
                return Err(DefinitionError::InvalidDependencyName(name.clone()).into());
            }
            if own_names.contains(&name.as_str()) {
                return Err(DefinitionError::InvalidDependencyName(format!(
                    "{name} (declared twice)"
                ))
                .into());
            }
            own_names.push(name);
            if matches!(
                (dep.role(), dep.kind()),
                (
                    dependency::DependencyRole::Output,
                    DependencyKind::EnvVar { .. }
                )
            ) {
                return Err(DefinitionError::InvalidDependencyName(format!(
                    "{name} (an environment variable cannot be an output)"
                ))
                .into());
            }
            if let Some(inherited) = dependencies.get(name) {
                dep.check_overrides(name, inherited)?;
            }
            dependencies.insert(name.clone(), dep.clone());
        }

        let mut own_params: Vec<&str> = Vec::new();
        for (name, value) in &self.params {
            if !parameter_name_regex().is_match(name) {
                return Err(DefinitionError::InvalidParameterName(name.clone()).into());
            }
            if own_params.contains(&name.as_str()) {
                return Err(DefinitionError::InvalidParameterName(format!(
                    "{name} (declared twice)"
                ))
                .into());
            }
            own_params.push(name);
            if let Some(reason) = value.find_non_fundamental() {
                return Err(ExecutionParameterError::NotFundamental {
                    name: name.clone(),
                    reason,
                }
                .into());
            }
            if let Some(inherited) = params.get(name) {
                if inherited.kind() != value.kind() {
                    return Err(DefinitionError::ParameterTypeChanged { name: name.clone() }.into());
                }
            }
            params.insert(name.clone(), value.clone());
        }

        // two descriptors must not observe the same environment variable
        let env_vars: Vec<(&String, &String)> = dependencies
            .iter()
            .filter_map(|(name, dep)| match dep.kind() {
                DependencyKind::EnvVar { var, .. } => Some((name, var)),
                _ => None,
            })
            .collect();
        for (i, (first, var)) in env_vars.iter().enumerate() {
            if let Some((second, _)) = env_vars[i + 1..].iter().find(|(_, v)| v == var) {
                return Err(DependencyError::EnvVarConflict {
                    first: (*first).clone(),
                    second: (*second).clone(),
                    var: (*var).clone(),
                }
                .into());
            }
        }

        let redo = match (self.redo, &self.base) {
            (Some(redo), _) => redo,
            (None, Some(base)) => base.redo_body(),
            (None, None) => {
                return Err(DefinitionError::MissingRedo {
                    name: self.name.clone(),
                }
                .into());
            }
        };

        if !definition_files.contains(&location.file) {
            definition_files.push(location.file);
        }

        {
            let mut registry = definition_registry().lock().expect("registry poisoned");
            if let Some(existing) = registry.get(&location) {
                return Err(DefinitionError::AmbiguousLocation {
                    file: location.file,
                    line: location.line,
                    existing: existing.clone(),
                }
                .into());
            }
            registry.insert(location, self.name.clone());
        }

        Ok(ToolDefinition {
            inner: Rc::new(DefinitionInner {
                name: self.name,
                dependencies,
                params,
                redo,
                location,
                definition_files,
            }),
        })
    }
}

/// A frozen binding of explicit dependency values to a definition.
#[derive(Clone)]
pub struct ToolInstance {
    definition: ToolDefinition,
    values: BTreeMap<String, DependencyValue>,
}

impl fmt::Debug for ToolInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolInstance")
            .field("tool", &self.definition.name())
            .field("values", &self.values)
            .finish()
    }
}

impl ToolInstance {
    pub fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    /// The validated explicit value bound to a dependency, if any.
    pub fn value(&self, name: &str) -> Option<&DependencyValue> {
        self.values.get(name)
    }

    pub(crate) fn values(&self) -> &BTreeMap<String, DependencyValue> {
        &self.values
    }

    /// The instance fingerprint: a content hash over the canonical
    /// dependency order with each value reduced to its identity, the
    /// realised values of non-explicit environment variable dependencies
    /// (`realized_env`, keyed by dependency name), and the marshalled
    /// execution parameters.
    pub(crate) fn fingerprint(&self, realized_env: &BTreeMap<String, String>) -> Vec<u8> {
        let mut hasher = blake3::Hasher::new();
        for (name, dep) in self.definition.dependencies() {
            hasher.update(&(name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update(&dep.identity());
            match self.values.get(name) {
                Some(value) => {
                    hasher.update(b"v");
                    hasher.update(&value.identity());
                }
                None => match realized_env.get(name) {
                    Some(value) => {
                        hasher.update(b"e");
                        hasher.update(&(value.len() as u64).to_le_bytes());
                        hasher.update(value.as_bytes());
                    }
                    None => {
                        hasher.update(b"-");
                    }
                },
            }
        }
        for (name, value) in &self.definition.inner.params {
            hasher.update(&(name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update(&value.marshal());
        }
        hasher.finalize().as_bytes().to_vec()
    }
}
