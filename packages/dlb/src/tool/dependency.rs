//! Dependency descriptors.
//!
//! A descriptor declares one named role of a tool: what kind of value it
//! binds (file, directory, environment variable, plain object), whether it
//! is an input or an output, whether it is required, whether it is bound
//! explicitly at instantiation or computed by the redo, and an optional
//! multiplicity that turns the value into an element-wise validated tuple.

use std::fmt;

use regex::Regex;

use crate::error::{DefinitionError, DependencyError};
use crate::fs::path::{PathClass, Unrestricted};
use crate::tool::param::ParamValue;

/// Multiplicity of a dependency value, like a slice of the non-negative
/// integers: `lo..hi` with a step.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct MultiplicityRange {
    lo: usize,
    hi: Option<usize>,
    step: usize,
}

impl MultiplicityRange {
    /// Builds a normalized range: an empty range becomes `0..0`, a range
    /// with one possible member becomes `lo..lo + 1` with step 1.
    pub fn new(lo: usize, hi: Option<usize>, step: usize) -> Result<Self, DefinitionError> {
        if step == 0 {
            return Err(DefinitionError::InvalidMultiplicity {
                reason: "step must be positive".into(),
            });
        }
        let normalized = match hi {
            Some(hi) if hi <= lo => MultiplicityRange {
                lo: 0,
                hi: Some(0),
                step: 1,
            },
            Some(hi) => {
                let last = lo + (hi - 1 - lo) / step * step;
                if last == lo {
                    MultiplicityRange {
                        lo,
                        hi: Some(lo + 1),
                        step: 1,
                    }
                } else {
                    MultiplicityRange {
                        lo,
                        hi: Some(last + 1),
                        step,
                    }
                }
            }
            None => MultiplicityRange { lo, hi: None, step },
        };
        Ok(normalized)
    }

    /// The range containing exactly `count`.
    pub fn exactly(count: usize) -> Self {
        MultiplicityRange {
            lo: count,
            hi: Some(count + 1),
            step: 1,
        }
    }

    pub fn contains(&self, count: usize) -> bool {
        count >= self.lo
            && self.hi.is_none_or(|hi| count < hi)
            && (count - self.lo) % self.step == 0
    }

    /// True iff every count valid for `self` is also valid for `other`.
    pub fn is_within(&self, other: &MultiplicityRange) -> bool {
        if self.hi == Some(0) {
            return true; // empty range fits everywhere
        }
        self.lo >= other.lo
            && other.hi.is_none_or(|oh| self.hi.is_some_and(|sh| sh <= oh))
            && self.step % other.step == 0
            && (self.lo - other.lo) % other.step == 0
    }
}

impl fmt::Display for MultiplicityRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.lo, self.hi, self.step) {
            (lo, Some(hi), _) if hi == lo + 1 => write!(f, "[{lo}]"),
            (0, None, 1) => write!(f, "[:]"),
            (lo, None, 1) => write!(f, "[{lo}:]"),
            (0, Some(hi), 1) => write!(f, "[:{hi}]"),
            (lo, Some(hi), 1) => write!(f, "[{lo}:{hi}]"),
            (lo, None, step) => write!(f, "[{lo}::{step}]"),
            (lo, Some(hi), step) => write!(f, "[{lo}:{hi}:{step}]"),
        }
    }
}

/// Direction of a dependency.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum DependencyRole {
    Input,
    Output,
}

/// Value kind of a dependency with its kind-specific options.
#[derive(Clone, Debug)]
pub enum DependencyKind {
    RegularFile {
        path_class: PathClass,
        /// For outputs: replace the destination even if the new content is
        /// identical (`true`), or keep the old file and its mtime
        /// (`false`).
        replace_by_same_content: bool,
    },
    NonRegularFile {
        path_class: PathClass,
    },
    Directory {
        path_class: PathClass,
    },
    EnvVar {
        var: String,
        restriction: String,
        example: String,
    },
    Object,
}

impl DependencyKind {
    fn tag(&self) -> &'static str {
        match self {
            DependencyKind::RegularFile { .. } => "regular-file",
            DependencyKind::NonRegularFile { .. } => "non-regular-file",
            DependencyKind::Directory { .. } => "directory",
            DependencyKind::EnvVar { .. } => "env-var",
            DependencyKind::Object => "object",
        }
    }

    pub(crate) fn path_class(&self) -> Option<PathClass> {
        match self {
            DependencyKind::RegularFile { path_class, .. }
            | DependencyKind::NonRegularFile { path_class }
            | DependencyKind::Directory { path_class } => Some(*path_class),
            _ => None,
        }
    }

    pub(crate) fn is_path(&self) -> bool {
        self.path_class().is_some()
    }
}

/// One realised dependency value.
#[derive(Clone, Debug, PartialEq)]
pub enum DependencyValue {
    Path(crate::fs::Path<Unrestricted>),
    Str(String),
    Object(ParamValue),
    Tuple(Vec<DependencyValue>),
}

impl DependencyValue {
    pub fn path(text: &str) -> Result<Self, crate::fs::PathError> {
        Ok(DependencyValue::Path(crate::fs::Path::new(text)?))
    }

    pub fn paths<'a>(
        texts: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, crate::fs::PathError> {
        Ok(DependencyValue::Tuple(
            texts
                .into_iter()
                .map(|t| Self::path(t))
                .collect::<Result<_, _>>()?,
        ))
    }

    pub fn as_path(&self) -> Option<&crate::fs::Path<Unrestricted>> {
        match self {
            DependencyValue::Path(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DependencyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Every path in the value, element-wise for tuples.
    pub fn each_path(&self) -> Vec<&crate::fs::Path<Unrestricted>> {
        match self {
            DependencyValue::Path(p) => vec![p],
            DependencyValue::Tuple(items) => items.iter().flat_map(|i| i.each_path()).collect(),
            _ => Vec::new(),
        }
    }

    /// The canonical bytes identifying the value (the *permanent local
    /// value ID*).
    pub(crate) fn identity(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.identity_into(&mut out);
        out
    }

    fn identity_into(&self, out: &mut Vec<u8>) {
        match self {
            DependencyValue::Path(p) => {
                out.push(b'p');
                let s = p.as_string();
                out.extend((s.len() as u64).to_le_bytes());
                out.extend(s.as_bytes());
            }
            DependencyValue::Str(s) => {
                out.push(b's');
                out.extend((s.len() as u64).to_le_bytes());
                out.extend(s.as_bytes());
            }
            DependencyValue::Object(v) => {
                out.push(b'o');
                let m = v.marshal();
                out.extend((m.len() as u64).to_le_bytes());
                out.extend(m);
            }
            DependencyValue::Tuple(items) => {
                out.push(b't');
                out.extend((items.len() as u64).to_le_bytes());
                for item in items {
                    item.identity_into(out);
                }
            }
        }
    }
}

impl From<&str> for DependencyValue {
    fn from(v: &str) -> Self {
        DependencyValue::Str(v.to_owned())
    }
}

impl<R: crate::fs::Restriction> From<crate::fs::Path<R>> for DependencyValue {
    fn from(v: crate::fs::Path<R>) -> Self {
        DependencyValue::Path(v.unrestricted())
    }
}

impl<R: crate::fs::Restriction> From<&crate::fs::Path<R>> for DependencyValue {
    fn from(v: &crate::fs::Path<R>) -> Self {
        DependencyValue::Path(v.unrestricted())
    }
}

/// A dependency descriptor; see the module documentation.
#[derive(Clone, Debug)]
pub struct Dependency {
    pub(crate) role: DependencyRole,
    pub(crate) kind: DependencyKind,
    pub(crate) required: bool,
    pub(crate) explicit: bool,
    pub(crate) multiplicity: Option<MultiplicityRange>,
}

impl Dependency {
    fn new(kind: DependencyKind) -> Self {
        Dependency {
            role: DependencyRole::Input,
            kind,
            required: true,
            explicit: true,
            multiplicity: None,
        }
    }

    pub fn regular_file() -> Self {
        Self::new(DependencyKind::RegularFile {
            path_class: PathClass::Unrestricted,
            replace_by_same_content: true,
        })
    }

    pub fn non_regular_file() -> Self {
        Self::new(DependencyKind::NonRegularFile {
            path_class: PathClass::Unrestricted,
        })
    }

    pub fn directory() -> Self {
        Self::new(DependencyKind::Directory {
            path_class: PathClass::Unrestricted,
        })
    }

    pub fn env_var(var: &str, restriction: &str, example: &str) -> Self {
        Self::new(DependencyKind::EnvVar {
            var: var.to_owned(),
            restriction: restriction.to_owned(),
            example: example.to_owned(),
        })
    }

    pub fn object() -> Self {
        Self::new(DependencyKind::Object)
    }

    pub fn input(mut self) -> Self {
        self.role = DependencyRole::Input;
        self
    }

    pub fn output(mut self) -> Self {
        self.role = DependencyRole::Output;
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn explicit(mut self, explicit: bool) -> Self {
        self.explicit = explicit;
        self
    }

    pub fn multiplicity(mut self, multiplicity: MultiplicityRange) -> Self {
        self.multiplicity = Some(multiplicity);
        self
    }

    pub fn path_class(mut self, class: PathClass) -> Self {
        match &mut self.kind {
            DependencyKind::RegularFile { path_class, .. }
            | DependencyKind::NonRegularFile { path_class }
            | DependencyKind::Directory { path_class } => *path_class = class,
            other => panic!("path class is not applicable to a {} dependency", other.tag()),
        }
        self
    }

    pub fn replace_by_same_content(mut self, replace: bool) -> Self {
        match &mut self.kind {
            DependencyKind::RegularFile {
                replace_by_same_content,
                ..
            } => *replace_by_same_content = replace,
            other => panic!(
                "replace_by_same_content is not applicable to a {} dependency",
                other.tag()
            ),
        }
        self
    }

    pub fn role(&self) -> DependencyRole {
        self.role
    }

    pub fn kind(&self) -> &DependencyKind {
        &self.kind
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    /// Validates and coerces one element of the value (or the single value
    /// for descriptors without multiplicity).
    fn validate_element(
        &self,
        name: &str,
        value: &DependencyValue,
    ) -> Result<DependencyValue, DependencyError> {
        let invalid = |reason: String| DependencyError::InvalidValue {
            name: name.to_owned(),
            reason,
        };
        match &self.kind {
            DependencyKind::RegularFile { path_class, .. }
            | DependencyKind::NonRegularFile { path_class } => {
                let path = value
                    .as_path()
                    .ok_or_else(|| invalid("a path is required".into()))?;
                if path.is_dir() {
                    return Err(invalid(format!(
                        "directory path where a file path is required: {path:?}"
                    )));
                }
                path_class.check(path).map_err(|e| invalid(e.to_string()))?;
                Ok(value.clone())
            }
            DependencyKind::Directory { path_class } => {
                let path = value
                    .as_path()
                    .ok_or_else(|| invalid("a path is required".into()))?;
                if !path.is_dir() {
                    return Err(invalid(format!(
                        "file path where a directory path is required: {path:?}"
                    )));
                }
                path_class.check(path).map_err(|e| invalid(e.to_string()))?;
                Ok(value.clone())
            }
            DependencyKind::EnvVar {
                var, restriction, ..
            } => {
                let text = value
                    .as_str()
                    .ok_or_else(|| invalid("a string is required".into()))?;
                let regex = Regex::new(&format!("^(?:{restriction})$"))
                    .map_err(|e| invalid(e.to_string()))?;
                if !regex.is_match(text) {
                    return Err(DependencyError::EnvVarMismatch {
                        var: var.clone(),
                        restriction: restriction.clone(),
                        value: text.to_owned(),
                    });
                }
                Ok(value.clone())
            }
            DependencyKind::Object => match value {
                DependencyValue::Object(_) => Ok(value.clone()),
                DependencyValue::Str(s) => Ok(DependencyValue::Object(ParamValue::Str(s.clone()))),
                other => Err(invalid(format!("not a fundamental value: {other:?}"))),
            },
        }
    }

    /// Validates a full dependency value against the descriptor.
    pub fn validate_value(
        &self,
        name: &str,
        value: Option<&DependencyValue>,
    ) -> Result<Option<DependencyValue>, DependencyError> {
        let Some(value) = value else {
            if self.required && self.explicit {
                return Err(DependencyError::MissingRequired {
                    name: name.to_owned(),
                });
            }
            return Ok(None);
        };
        match &self.multiplicity {
            None => Ok(Some(self.validate_element(name, value)?)),
            Some(range) => {
                let DependencyValue::Tuple(items) = value else {
                    return Err(DependencyError::InvalidValue {
                        name: name.to_owned(),
                        reason: "a tuple of values is required".into(),
                    });
                };
                if !range.contains(items.len()) {
                    return Err(DependencyError::Multiplicity {
                        name: name.to_owned(),
                        count: items.len(),
                        range: range.to_string(),
                    });
                }
                let validated = items
                    .iter()
                    .map(|item| self.validate_element(name, item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some(DependencyValue::Tuple(validated)))
            }
        }
    }

    /// The canonical bytes of the descriptor's cache-relevant settings
    /// (the *permanent local instance ID* of the descriptor). `required`
    /// is irrelevant to caching and not part of it.
    pub(crate) fn identity(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(match self.role {
            DependencyRole::Input => b"i",
            DependencyRole::Output => b"o",
        });
        out.push(self.explicit as u8);
        match &self.multiplicity {
            None => out.push(0),
            Some(m) => {
                out.push(1);
                out.extend((m.lo as u64).to_le_bytes());
                out.extend(m.hi.map(|h| h as u64).unwrap_or(u64::MAX).to_le_bytes());
                out.extend((m.step as u64).to_le_bytes());
            }
        }
        out.extend(self.kind.tag().as_bytes());
        match &self.kind {
            DependencyKind::RegularFile {
                path_class,
                replace_by_same_content,
            } => {
                out.push(*replace_by_same_content as u8);
                out.extend(path_class.name().as_bytes());
            }
            DependencyKind::NonRegularFile { path_class }
            | DependencyKind::Directory { path_class } => {
                out.extend(path_class.name().as_bytes());
            }
            DependencyKind::EnvVar {
                var, restriction, ..
            } => {
                out.extend((var.len() as u64).to_le_bytes());
                out.extend(var.as_bytes());
                out.extend(restriction.as_bytes());
            }
            DependencyKind::Object => {}
        }
        out
    }

    /// Whether `self` may override `base` in a derived tool definition.
    pub(crate) fn check_overrides(
        &self,
        name: &str,
        base: &Dependency,
    ) -> Result<(), DefinitionError> {
        if self.kind.tag() != base.kind.tag() || self.role != base.role {
            return Err(DefinitionError::DependencyKindChanged {
                name: name.to_owned(),
            });
        }
        if self.explicit != base.explicit {
            return Err(DefinitionError::DependencyNotMoreRestrictive {
                name: name.to_owned(),
                reason: "explicitness must not change".into(),
            });
        }
        if base.required && !self.required {
            return Err(DefinitionError::DependencyNotMoreRestrictive {
                name: name.to_owned(),
                reason: "a required dependency must stay required".into(),
            });
        }
        if let (Some(own), Some(base_class)) = (self.kind.path_class(), base.kind.path_class()) {
            if !own.is_at_least_as_restrictive_as(base_class) {
                return Err(DefinitionError::DependencyNotMoreRestrictive {
                    name: name.to_owned(),
                    reason: format!(
                        "path restriction {} is weaker than {}",
                        own.name(),
                        base_class.name()
                    ),
                });
            }
        }
        match (&self.multiplicity, &base.multiplicity) {
            (None, None) => {}
            (Some(own), Some(base_range)) if own.is_within(base_range) => {}
            _ => {
                return Err(DefinitionError::DependencyNotMoreRestrictive {
                    name: name.to_owned(),
                    reason: "incompatible multiplicity".into(),
                });
            }
        }
        Ok(())
    }
}
