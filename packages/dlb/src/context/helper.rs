//! Frame-stacked helper dictionary.
//!
//! A helper is a logical name for an external executable (e.g. `gcc/`
//! would be wrong, `gcc` right: the name is a relative path whose
//! directory flag must match the filesystem object it names). Explicit
//! assignments live in the frame that made them; implicit lookup searches
//! the process binary search path once per name and memoises the result in
//! the root frame.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::debug;

use crate::fs::path::{AbsoluteOnly, PathError, RelativeOnly};

type HelperName = crate::fs::Path<RelativeOnly>;
type HelperPath = crate::fs::Path<AbsoluteOnly>;

/// See the module documentation.
pub struct HelperDict {
    search_path: Vec<PathBuf>,
    frames: Vec<HashMap<HelperName, HelperPath>>,
}

impl HelperDict {
    pub(crate) fn new(search_path: Vec<PathBuf>) -> Self {
        HelperDict {
            search_path,
            frames: vec![HashMap::new()],
        }
    }

    pub(crate) fn push_frame(&mut self) {
        self.frames.push(HashMap::new());
    }

    pub(crate) fn pop_frame(&mut self) {
        assert!(self.frames.len() > 1, "root frame must remain");
        self.frames.pop();
    }

    /// Explicitly assigns an absolute path to a helper name in the active
    /// frame, overriding any implicit lookup for it.
    pub fn set(&mut self, name: &HelperName, path: &HelperPath) -> Result<(), PathError> {
        if name.is_dir() != path.is_dir() {
            return Err(PathError::Invalid {
                reason: format!(
                    "directory flag of helper path {path:?} does not match the helper name {name:?}"
                ),
            });
        }
        self.frames
            .last_mut()
            .expect("at least the root frame")
            .insert(name.clone(), path.clone());
        Ok(())
    }

    /// The explicitly assigned path visible for `name`, if any.
    pub fn get(&self, name: &HelperName) -> Option<&HelperPath> {
        self.frames.iter().rev().find_map(|f| f.get(name))
    }

    /// Like [`HelperDict::get`], but searches the process binary search
    /// path for unknown non-directory names and memoises a hit in the root
    /// frame.
    pub fn get_or_find(&mut self, name: &HelperName) -> Option<HelperPath> {
        if let Some(found) = self.get(name) {
            return Some(found.clone());
        }
        if name.is_dir() {
            return None;
        }
        let relative = name.native().ok()?;
        for dir in &self.search_path {
            let candidate = dir.join(relative.as_path());
            if is_executable::is_executable(&candidate) {
                let found = HelperPath::new_with_dir_flag(candidate.to_str()?, false).ok()?;
                debug!(name = %name, path = %found, "found helper on the search path");
                self.frames[0].insert(name.clone(), found.clone());
                return Some(found);
            }
        }
        None
    }

    /// The merged view of all assigned helpers.
    pub fn assigned(&self) -> HashMap<HelperName, HelperPath> {
        let mut merged = HashMap::new();
        for frame in &self.frames {
            for (name, path) in frame {
                merged.insert(name.clone(), path.clone());
            }
        }
        merged
    }
}

impl std::fmt::Debug for HelperDict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut entries: Vec<(String, String)> = self
            .assigned()
            .into_iter()
            .map(|(n, p)| (n.as_string(), p.as_string()))
            .collect();
        entries.sort();
        write!(f, "HelperDict({entries:?})")
    }
}
