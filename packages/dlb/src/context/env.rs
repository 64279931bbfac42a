//! Frame-stacked environment variable dictionary.
//!
//! The runtime never reads the process environment directly; a snapshot is
//! taken when the root context opens, and only variables imported through
//! [`EnvVarDict::import_from_outer`] become visible. Inner frames may
//! narrow a variable's restriction but never widen it; assignments are
//! validated against every restriction in the chain.

use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvVarError {
    #[error("'name' must not be empty")]
    EmptyName,

    #[error("invalid 'restriction': {0}")]
    InvalidRestriction(#[from] regex::Error),

    #[error("'example' is invalid with respect to 'restriction': {example:?}")]
    ExampleMismatch { example: String },

    #[error("current value invalid with respect to 'restriction': {value:?}")]
    CurrentValueMismatch { value: String },

    #[error("'value' invalid with respect to active or an outer context: {value:?}")]
    ValueMismatch { value: String },

    #[error("environment variable not imported into context: {name:?} (import it first)")]
    NotImported { name: String },

    #[error("not a defined environment variable in the context: {name:?}")]
    NotDefined { name: String },
}

#[derive(Default)]
struct EnvFrame {
    /// Variables defined (or explicitly undefined) at this frame.
    entries: HashMap<String, Option<String>>,
    /// Restrictions added at this frame; they accumulate downwards.
    restrictions: HashMap<String, Vec<Regex>>,
}

/// See the module documentation.
pub struct EnvVarDict {
    snapshot: HashMap<String, String>,
    frames: Vec<EnvFrame>,
}

fn full_match_regex(restriction: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{restriction})$"))
}

impl EnvVarDict {
    pub(crate) fn new(snapshot: HashMap<String, String>) -> Self {
        EnvVarDict {
            snapshot,
            frames: vec![EnvFrame::default()],
        }
    }

    pub(crate) fn push_frame(&mut self) {
        self.frames.push(EnvFrame::default());
    }

    pub(crate) fn pop_frame(&mut self) {
        assert!(self.frames.len() > 1, "root frame must remain");
        self.frames.pop();
    }

    /// Imports a variable from the enclosing frames (or the snapshot taken
    /// at root entry), restricted by a regular expression that must fully
    /// match both `example` and the variable's current value (if any).
    /// Importing an already imported variable narrows its restriction.
    pub fn import_from_outer(
        &mut self,
        name: &str,
        restriction: &str,
        example: &str,
    ) -> Result<(), EnvVarError> {
        if name.is_empty() {
            return Err(EnvVarError::EmptyName);
        }
        let regex = full_match_regex(restriction)?;
        if !regex.is_match(example) {
            return Err(EnvVarError::ExampleMismatch {
                example: example.to_owned(),
            });
        }
        let current = self.lookup(name).map(str::to_owned);
        if let Some(value) = &current {
            if !regex.is_match(value) {
                return Err(EnvVarError::CurrentValueMismatch {
                    value: value.clone(),
                });
            }
        }
        let frame = self.frames.last_mut().expect("at least the root frame");
        frame.entries.entry(name.to_owned()).or_insert(current);
        frame
            .restrictions
            .entry(name.to_owned())
            .or_default()
            .push(regex);
        Ok(())
    }

    /// The value currently visible for `name`, or `None` when the variable
    /// is undefined or was never imported.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.lookup(name)
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        for frame in self.frames.iter().rev() {
            if let Some(entry) = frame.entries.get(name) {
                return entry.as_deref();
            }
        }
        None
    }

    /// True iff the variable was imported by this or an enclosing frame.
    pub fn is_imported(&self, name: &str) -> bool {
        self.frames
            .iter()
            .any(|f| f.restrictions.contains_key(name))
    }

    /// Assigns a value; the variable must have been imported, and the value
    /// must satisfy the restrictions of the active and all outer frames.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), EnvVarError> {
        if !self.is_imported(name) {
            return Err(EnvVarError::NotImported {
                name: name.to_owned(),
            });
        }
        let satisfied = self
            .frames
            .iter()
            .flat_map(|f| f.restrictions.get(name))
            .flatten()
            .all(|r| r.is_match(value));
        if !satisfied {
            return Err(EnvVarError::ValueMismatch {
                value: value.to_owned(),
            });
        }
        self.frames
            .last_mut()
            .expect("at least the root frame")
            .entries
            .insert(name.to_owned(), Some(value.to_owned()));
        Ok(())
    }

    /// Undefines a variable in the active frame only; enclosing frames keep
    /// their value.
    pub fn remove(&mut self, name: &str) -> Result<(), EnvVarError> {
        if self.lookup(name).is_none() {
            return Err(EnvVarError::NotDefined {
                name: name.to_owned(),
            });
        }
        self.frames
            .last_mut()
            .expect("at least the root frame")
            .entries
            .insert(name.to_owned(), None);
        Ok(())
    }

    /// The merged view of all defined variables, outermost first.
    pub fn defined(&self) -> BTreeMap<String, String> {
        let mut merged: BTreeMap<String, Option<&str>> = BTreeMap::new();
        for frame in &self.frames {
            for (name, entry) in &frame.entries {
                merged.insert(name.clone(), entry.as_deref());
            }
        }
        merged
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| (name, v.to_owned())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.defined().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for EnvVarDict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EnvVarDict({:?})", self.defined())
    }
}
