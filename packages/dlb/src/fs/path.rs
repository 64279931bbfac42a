//! Portable, typed path values.
//!
//! A [`Path`] is a normalized sequence of components plus a directory flag
//! and a root classification; it never touches the filesystem at
//! construction. The restriction marker type is checked when the value is
//! built and re-checked when a [`NativePath`] is produced for the OS
//! boundary, so a value of type `Path<Portable>` is known portable for its
//! whole lifetime.
//!
//! Comparison is on `(anchor, components, is_dir)` and is case-sensitive on
//! every host.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::rc::Rc;

use tap::Tap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("invalid path: {reason}")]
    Invalid { reason: String },

    #[error("invalid path for {restriction}: {path:?} ({reason})")]
    Restricted {
        restriction: &'static str,
        path: String,
        reason: String,
    },

    #[error("cannot append to non-directory path: {path:?}")]
    AppendToNonDirectory { path: String },

    #[error("cannot append absolute path: {path:?}")]
    AppendAbsolute { path: String },

    #[error("{path:?} is not relative to {prefix:?}")]
    NotRelativeTo { path: String, prefix: String },

    #[error("cannot modify the suffix of {path:?} ({reason})")]
    SuffixNotApplicable { path: String, reason: String },

    #[error("invalid suffix: {reason}")]
    InvalidSuffix { reason: String },

    #[error("slice of absolute path must not be empty")]
    EmptyAbsoluteSlice,

    #[error("slice step must be positive")]
    NonPositiveStep,

    #[error("cannot list non-directory path: {path:?}")]
    ListNonDirectory { path: String },

    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Absoluteness classification of a path.
///
/// Two leading separators are kept distinct from one (POSIX allows an
/// implementation-defined meaning for exactly two); three or more collapse
/// to one.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum Root {
    Relative,
    Rooted,
    UncLike,
}

impl Root {
    pub fn anchor(self) -> &'static str {
        match self {
            Root::Relative => "",
            Root::Rooted => "/",
            Root::UncLike => "//",
        }
    }

    fn is_absolute(self) -> bool {
        !matches!(self, Root::Relative)
    }
}

/// The restriction-independent value of a path, handed to
/// [`Restriction::check`] implementations.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Stem {
    root: Root,
    components: Vec<String>,
    is_dir: bool,
}

impl Stem {
    pub fn root(&self) -> Root {
        self.root
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.components.iter().map(String::as_str)
    }

    fn parse(text: &str) -> Result<Stem, PathError> {
        if text.is_empty() {
            return Err(PathError::Invalid {
                reason: "must not be empty".into(),
            });
        }

        let leading = text.len() - text.trim_start_matches('/').len();
        let root = match leading {
            0 => Root::Relative,
            2 => Root::UncLike,
            _ => Root::Rooted,
        };

        let components: Vec<String> = text
            .split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .map(str::to_owned)
            .collect();

        let is_dir = text.ends_with('/')
            || text.ends_with("/.")
            || components.is_empty()
            || components.last().is_some_and(|c| c == "..");

        Ok(Stem {
            root,
            components,
            is_dir,
        })
    }

    fn with_dir_flag(mut self, is_dir: bool) -> Result<Stem, PathError> {
        if !is_dir && (self.components.is_empty() || self.components.last().is_some_and(|c| c == ".."))
        {
            return Err(PathError::Invalid {
                reason: format!("cannot be the path of a non-directory: {:?}", self.as_string()),
            });
        }
        self.is_dir = is_dir;
        Ok(self)
    }

    /// The portable string form; directories end in `/`, the relative
    /// root is `./`.
    pub fn as_string(&self) -> String {
        let mut s = String::from(self.root.anchor());
        s.push_str(&self.components.join("/"));
        if self.components.is_empty() && self.root == Root::Relative {
            s.push('.');
        }
        if self.is_dir && !s.ends_with('/') {
            s.push('/');
        }
        s
    }

    fn is_normalized(&self) -> bool {
        !self.components.iter().any(|c| c == "..")
    }
}

/// Restriction checked at construction and again at the native boundary.
///
/// A restriction builds on its base by calling the base's check first, so
/// the conjunction is explicit in each implementation.
pub trait Restriction: Copy + Clone + Eq + Ord + Hash + fmt::Debug + 'static {
    const NAME: &'static str;

    fn check(stem: &Stem) -> Result<(), String>;
}

/// No restriction at all.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Unrestricted;

/// Must be relative.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct RelativeOnly;

/// Must be absolute.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct AbsoluteOnly;

/// Must not contain a space character.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct NoSpace;

/// Valid on POSIX systems (no NUL).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Posix;

/// Portable across POSIX systems (IEEE Std 1003.1-2008 limits and
/// portable filename character set).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PortablePosix;

/// Valid on Windows systems.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Windows;

/// Portable across Windows systems.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PortableWindows;

/// Portable across POSIX and Windows systems, and relative.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Portable;

impl Restriction for Unrestricted {
    const NAME: &'static str = "Path";

    fn check(_: &Stem) -> Result<(), String> {
        Ok(())
    }
}

impl Restriction for RelativeOnly {
    const NAME: &'static str = "RelativePath";

    fn check(stem: &Stem) -> Result<(), String> {
        if stem.root.is_absolute() {
            return Err("must be relative".into());
        }
        Ok(())
    }
}

impl Restriction for AbsoluteOnly {
    const NAME: &'static str = "AbsolutePath";

    fn check(stem: &Stem) -> Result<(), String> {
        if !stem.root.is_absolute() {
            return Err("must be absolute".into());
        }
        Ok(())
    }
}

impl Restriction for NoSpace {
    const NAME: &'static str = "NoSpacePath";

    fn check(stem: &Stem) -> Result<(), String> {
        if stem.components.iter().any(|c| c.contains(' ')) {
            return Err("must not contain space".into());
        }
        Ok(())
    }
}

impl Restriction for Posix {
    const NAME: &'static str = "PosixPath";

    fn check(stem: &Stem) -> Result<(), String> {
        if stem.components.iter().any(|c| c.contains('\0')) {
            return Err("must not contain NUL".into());
        }
        Ok(())
    }
}

const POSIX_MAX_COMPONENT_LENGTH: usize = 14; // _POSIX_NAME_MAX
const POSIX_MAX_PATH_LENGTH: usize = 255; // _POSIX_PATH_MAX - 1

fn is_posix_portable_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

impl Restriction for PortablePosix {
    const NAME: &'static str = "PortablePosixPath";

    fn check(stem: &Stem) -> Result<(), String> {
        Posix::check(stem)?;

        if stem.root == Root::UncLike {
            return Err("non-standardized component starting with '//' not allowed".into());
        }
        for c in &stem.components {
            if c == ".." {
                continue;
            }
            if c.chars().count() > POSIX_MAX_COMPONENT_LENGTH {
                return Err(format!(
                    "component must not contain more than {POSIX_MAX_COMPONENT_LENGTH} characters"
                ));
            }
            // IEEE Std 1003.1-2008, section 4.7 Filename Portability
            if c.starts_with('-') {
                return Err("component must not start with '-'".into());
            }
            // IEEE Std 1003.1-2008, section 3.278 Portable Filename Character Set
            if let Some(invalid) = c.chars().find(|c| !is_posix_portable_char(*c)) {
                return Err(format!("must not contain the character {invalid:?}"));
            }
        }

        if stem.as_string().chars().count() > POSIX_MAX_PATH_LENGTH {
            return Err(format!(
                "must not contain more than {POSIX_MAX_PATH_LENGTH} characters"
            ));
        }
        Ok(())
    }
}

const WINDOWS_RESERVED_CHARACTERS: &[char] = &['\\', '"', '|', '?', '*', '<', '>', ':'];

fn is_windows_reserved_name(component: &str) -> bool {
    let base = component
        .split_once('.')
        .map_or(component, |(base, _)| base);
    let base = base.to_ascii_uppercase();
    matches!(base.as_str(), "CON" | "PRN" | "AUX" | "NUL")
        || (base.len() == 4
            && (base.starts_with("COM") || base.starts_with("LPT"))
            && base.as_bytes()[3].is_ascii_digit())
}

impl Restriction for Windows {
    const NAME: &'static str = "WindowsPath";

    fn check(stem: &Stem) -> Result<(), String> {
        for c in &stem.components {
            if let Some(r) = c.chars().find(|c| WINDOWS_RESERVED_CHARACTERS.contains(c)) {
                return Err(format!("must not contain reserved character {r:?}"));
            }
            if let Some(low) = c.chars().find(|c| (*c as u32) < 0x20) {
                return Err(format!(
                    "must not contain characters with codepoint lower than U+0020: U+{:04X}",
                    low as u32
                ));
            }
            if let Some(high) = c.chars().find(|c| (*c as u32) > 0xFFFF) {
                return Err(format!(
                    "must not contain characters with codepoint higher than U+FFFF: U+{:04X}",
                    high as u32
                ));
            }
        }
        if !stem.is_dir && stem.components.last().is_some_and(|c| is_windows_reserved_name(c)) {
            return Err("file path is reserved".into());
        }
        Ok(())
    }
}

const WINDOWS_MAX_COMPONENT_LENGTH: usize = 255; // lpMaximumComponentLength
const WINDOWS_MAX_PATH_LENGTH: usize = 259; // MAX_PATH - 1

impl Restriction for PortableWindows {
    const NAME: &'static str = "PortableWindowsPath";

    fn check(stem: &Stem) -> Result<(), String> {
        Windows::check(stem)?;

        for c in &stem.components {
            if c.chars().count() > WINDOWS_MAX_COMPONENT_LENGTH {
                return Err(format!(
                    "component must not contain more than {WINDOWS_MAX_COMPONENT_LENGTH} characters"
                ));
            }
            if c != ".." && (c.ends_with(' ') || c.ends_with('.')) {
                return Err("component must not end with ' ' or '.'".into());
            }
        }

        if stem.as_string().chars().count() > WINDOWS_MAX_PATH_LENGTH {
            return Err(format!(
                "must not contain more than {WINDOWS_MAX_PATH_LENGTH} characters"
            ));
        }
        Ok(())
    }
}

impl Restriction for Portable {
    const NAME: &'static str = "PortablePath";

    fn check(stem: &Stem) -> Result<(), String> {
        PortablePosix::check(stem)?;
        PortableWindows::check(stem)?;
        RelativeOnly::check(stem)?;
        Ok(())
    }
}

pub type RelativePath = Path<RelativeOnly>;
pub type AbsolutePath = Path<AbsoluteOnly>;
pub type NoSpacePath = Path<NoSpace>;
pub type PosixPath = Path<Posix>;
pub type PortablePosixPath = Path<PortablePosix>;
pub type WindowsPath = Path<Windows>;
pub type PortableWindowsPath = Path<PortableWindows>;
pub type PortablePath = Path<Portable>;

/// A platform-independent path value with a restriction marker.
///
/// Normalisation at construction collapses separator runs and removes `.`
/// components; literal `..` components are preserved (resolving them would
/// require filesystem access).
pub struct Path<R: Restriction = Unrestricted> {
    restriction: PhantomData<R>,
    stem: Rc<Stem>,
}

impl<R: Restriction> Clone for Path<R> {
    fn clone(&self) -> Self {
        Path {
            restriction: PhantomData,
            stem: Rc::clone(&self.stem),
        }
    }
}

impl<R: Restriction> Path<R> {
    fn from_stem(stem: Stem) -> Result<Self, PathError> {
        R::check(&stem).map_err(|reason| PathError::Restricted {
            restriction: R::NAME,
            path: stem.as_string(),
            reason,
        })?;
        Ok(Path {
            restriction: PhantomData,
            stem: Rc::new(stem),
        })
    }

    /// Builds a path from a `/`-separated string.
    pub fn new(text: impl AsRef<str>) -> Result<Self, PathError> {
        Self::from_stem(Stem::parse(text.as_ref())?)
    }

    /// Builds a path from a `/`-separated string with an explicit directory
    /// flag. Forcing `is_dir = false` on `.` or a path ending in `..` is an
    /// error.
    pub fn new_with_dir_flag(text: impl AsRef<str>, is_dir: bool) -> Result<Self, PathError> {
        Self::from_stem(Stem::parse(text.as_ref())?.with_dir_flag(is_dir)?)
    }

    /// Builds a path from individual components.
    pub fn from_components<'a>(
        root: Root,
        components: impl IntoIterator<Item = &'a str>,
        is_dir: bool,
    ) -> Result<Self, PathError> {
        let components: Vec<String> = components
            .into_iter()
            .flat_map(|c| c.split('/'))
            .filter(|c| !c.is_empty() && *c != ".")
            .map(str::to_owned)
            .collect();
        let stem = Stem {
            root,
            components,
            is_dir,
        };
        let stem = if !is_dir {
            // re-derive validity of the flag
            Stem {
                is_dir: true,
                ..stem
            }
            .with_dir_flag(false)?
        } else {
            stem
        };
        Self::from_stem(stem)
    }

    /// Re-checks the value under another restriction.
    pub fn restricted_as<S: Restriction>(&self) -> Result<Path<S>, PathError> {
        Path::<S>::from_stem((*self.stem).clone())
    }

    /// Drops the restriction (always possible).
    pub fn unrestricted(&self) -> Path<Unrestricted> {
        Path {
            restriction: PhantomData,
            stem: Rc::clone(&self.stem),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.stem.is_dir
    }

    pub fn is_absolute(&self) -> bool {
        self.stem.root.is_absolute()
    }

    pub fn root(&self) -> Root {
        self.stem.root
    }

    /// True iff the path contains no `..` component.
    pub fn is_normalized(&self) -> bool {
        self.stem.is_normalized()
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.stem.components.iter().map(String::as_str)
    }

    pub fn component_count(&self) -> usize {
        self.stem.components.len()
    }

    /// The components of the path; the anchor is the first part of an
    /// absolute path, a relative path has no anchor part.
    pub fn parts(&self) -> Vec<&str> {
        let mut parts = Vec::with_capacity(self.stem.components.len() + 1);
        if self.stem.root.is_absolute() {
            parts.push(self.stem.root.anchor());
        }
        parts.extend(self.components());
        parts
    }

    /// The portable string form; directories end in `/`, the relative root
    /// is `./`.
    pub fn as_string(&self) -> String {
        self.stem.as_string()
    }

    /// Appends a relative path; `self` must be a directory.
    pub fn join<S: Restriction>(&self, other: &Path<S>) -> Result<Path<R>, PathError> {
        if !self.stem.is_dir {
            return Err(PathError::AppendToNonDirectory {
                path: self.as_string(),
            });
        }
        if other.is_absolute() {
            return Err(PathError::AppendAbsolute {
                path: other.as_string(),
            });
        }
        let mut components = self.stem.components.clone();
        components.extend(other.stem.components.iter().cloned());
        Self::from_stem(Stem {
            root: self.stem.root,
            components,
            is_dir: other.stem.is_dir,
        })
    }

    /// Like [`Path::join`] for a string operand.
    pub fn join_str(&self, other: impl AsRef<str>) -> Result<Path<R>, PathError> {
        self.join(&Path::<Unrestricted>::new(other)?)
    }

    /// True iff `prefix` is a directory prefix of `self` (or equal to it).
    pub fn starts_with<S: Restriction>(&self, prefix: &Path<S>) -> bool {
        self.stem.root == prefix.stem.root
            && self.stem.components.len() >= prefix.stem.components.len()
            && self.stem.components[..prefix.stem.components.len()] == prefix.stem.components[..]
    }

    /// Removes the directory prefix `other`.
    ///
    /// With `collapsable`, a path outside `other` is expressed with leading
    /// `..` components (permitted only when neither side contains `..`).
    pub fn relative_to<S: Restriction>(
        &self,
        other: &Path<S>,
        collapsable: bool,
    ) -> Result<Path<R>, PathError> {
        if !other.stem.is_dir {
            return Err(PathError::AppendToNonDirectory {
                path: other.as_string(),
            });
        }
        if self.starts_with(other) {
            let stripped = Stem {
                root: Root::Relative,
                components: self.stem.components[other.stem.components.len()..].to_vec(),
                is_dir: true,
            };
            return Self::from_stem(stripped.with_dir_flag(self.stem.is_dir)?);
        }
        if !collapsable || self.stem.root != other.stem.root {
            return Err(PathError::NotRelativeTo {
                path: self.as_string(),
                prefix: other.as_string(),
            });
        }
        if !self.stem.is_normalized() || !other.stem.is_normalized() {
            return Err(PathError::NotRelativeTo {
                path: self.as_string(),
                prefix: other.as_string(),
            });
        }
        let common = self
            .stem
            .components
            .iter()
            .zip(&other.stem.components)
            .take_while(|(a, b)| a == b)
            .count();
        let mut components: Vec<String> = std::iter::repeat_n(
            String::from(".."),
            other.stem.components.len() - common,
        )
        .collect();
        components.extend(self.stem.components[common..].iter().cloned());
        let collapsed = Stem {
            root: Root::Relative,
            components,
            is_dir: true,
        };
        Self::from_stem(collapsed.with_dir_flag(self.stem.is_dir)?)
    }

    fn final_component_for_suffix(&self) -> Result<&str, PathError> {
        match self.stem.components.last() {
            None => Err(PathError::SuffixNotApplicable {
                path: self.as_string(),
                reason: "path has no component".into(),
            }),
            Some(c) if c == ".." => Err(PathError::SuffixNotApplicable {
                path: self.as_string(),
                reason: "final component must not be '..'".into(),
            }),
            Some(c) => Ok(c),
        }
    }

    fn checked_suffix(suffix: &str) -> Result<&str, PathError> {
        if suffix.is_empty() {
            return Err(PathError::InvalidSuffix {
                reason: "must not be empty".into(),
            });
        }
        if suffix.contains('/') || suffix.contains('\0') {
            return Err(PathError::InvalidSuffix {
                reason: "must not contain '/' or NUL".into(),
            });
        }
        Ok(suffix)
    }

    /// Appends `suffix` to the final component.
    pub fn with_appended_suffix(&self, suffix: &str) -> Result<Path<R>, PathError> {
        let last = self.final_component_for_suffix()?;
        let suffix = Self::checked_suffix(suffix)?;
        let mut components = self.stem.components.clone();
        *components.last_mut().expect("checked non-empty") = format!("{last}{suffix}");
        Self::from_stem(Stem {
            root: self.stem.root,
            components,
            is_dir: self.stem.is_dir,
        })
    }

    /// Replaces the extension of the final component (everything from its
    /// last `.`, which must not be its first character) with `suffix`.
    pub fn with_replacing_suffix(&self, suffix: &str) -> Result<Path<R>, PathError> {
        let last = self.final_component_for_suffix()?;
        let suffix = Self::checked_suffix(suffix)?;
        let dot = match last.rfind('.') {
            Some(0) | None => {
                return Err(PathError::SuffixNotApplicable {
                    path: self.as_string(),
                    reason: "final component has no replaceable suffix".into(),
                });
            }
            Some(i) => i,
        };
        let mut components = self.stem.components.clone();
        *components.last_mut().expect("checked non-empty") = format!("{}{}", &last[..dot], suffix);
        Self::from_stem(Stem {
            root: self.stem.root,
            components,
            is_dir: self.stem.is_dir,
        })
    }

    /// A new path from the component range `start..stop` with the given
    /// step. The anchor of an absolute path is preserved when and only when
    /// `start == 0`; an absolute path sliced to no components is an error.
    pub fn slice(&self, start: usize, stop: usize, step: usize) -> Result<Path<R>, PathError> {
        if step == 0 {
            return Err(PathError::NonPositiveStep);
        }
        let n = self.stem.components.len();
        let stop = stop.min(n);
        if start == 0 && stop >= n && step == 1 {
            return Ok(self.clone());
        }
        let components: Vec<String> = self
            .stem
            .components
            .iter()
            .take(stop)
            .skip(start)
            .step_by(step)
            .cloned()
            .collect();
        let root = if start == 0 { self.stem.root } else { Root::Relative };
        if root.is_absolute() && components.is_empty() {
            return Err(PathError::EmptyAbsoluteSlice);
        }
        Self::from_stem(Stem {
            root,
            components,
            is_dir: stop < n || self.stem.is_dir,
        })
    }

    /// The parent directory path, if there is one.
    pub fn parent(&self) -> Option<Path<R>> {
        if self.stem.components.is_empty() {
            return None;
        }
        Self::from_stem(Stem {
            root: self.stem.root,
            components: self.stem.components[..self.stem.components.len() - 1].to_vec(),
            is_dir: true,
        })
        .ok()
    }

    /// Re-checks all restrictions and produces the host form.
    ///
    /// The string of a relative native path always starts with `./` or
    /// `../` so it can never be mistaken for a flag by a child process.
    pub fn native(&self) -> Result<NativePath, PathError> {
        R::check(&self.stem).map_err(|reason| PathError::Restricted {
            restriction: R::NAME,
            path: self.as_string(),
            reason,
        })?;
        let mut s = String::from(self.stem.root.anchor());
        if self.stem.root == Root::Relative
            && self.stem.components.first().is_none_or(|c| c != "..")
        {
            s.push_str("./");
        }
        s.push_str(&self.stem.components.join("/"));
        if self.stem.components.is_empty() {
            // "./" or "/"
            if self.stem.root == Root::Relative {
                s.truncate(1);
            }
        }
        Ok(NativePath(PathBuf::from(s)))
    }

    /// Iterates over the directory `self` refers to, resolved against the
    /// process working directory.
    ///
    /// Names matched by `name_filter` are produced in sorted order per
    /// directory; directories matched by `recurse_filter` are descended
    /// into, in sorted order. Symlinks to directories are treated as
    /// directories only with `follow_symlinks`.
    pub fn iter_dir(
        &self,
        name_filter: ItemFilter,
        recurse_filter: ItemFilter,
        follow_symlinks: bool,
    ) -> Result<IterDir<R>, PathError> {
        if !self.stem.is_dir {
            return Err(PathError::ListNonDirectory {
                path: self.as_string(),
            });
        }
        Ok(IterDir {
            name_filter,
            recurse_filter,
            follow_symlinks,
            pending_dirs: VecDeque::from([self.clone()]),
            current: Vec::new().into_iter(),
        })
    }

    /// Collects [`Path::iter_dir`] results (already sorted per directory).
    pub fn list(
        &self,
        name_filter: ItemFilter,
        recurse_filter: ItemFilter,
        follow_symlinks: bool,
    ) -> Result<Vec<Path<R>>, PathError> {
        Ok(self
            .iter_dir(name_filter, recurse_filter, follow_symlinks)?
            .collect::<Result<Vec<_>, _>>()?
            .tap_mut(|paths| paths.sort()))
    }

    /// Like [`Path::list`], with results relative to `self`.
    pub fn list_relative(
        &self,
        name_filter: ItemFilter,
        recurse_filter: ItemFilter,
        follow_symlinks: bool,
    ) -> Result<Vec<Path<R>>, PathError> {
        self.list(name_filter, recurse_filter, follow_symlinks)?
            .iter()
            .map(|p| p.relative_to(self, false))
            .collect()
    }
}

impl<R: Restriction> PartialEq for Path<R> {
    fn eq(&self, other: &Self) -> bool {
        self.stem == other.stem
    }
}

impl<R: Restriction> Eq for Path<R> {}

impl<R: Restriction> PartialOrd for Path<R> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<R: Restriction> Ord for Path<R> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.stem.cmp(&other.stem)
    }
}

impl<R: Restriction> Hash for Path<R> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.stem.hash(state);
    }
}

impl<R: Restriction> fmt::Display for Path<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl<R: Restriction> fmt::Debug for Path<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", R::NAME, self.as_string())
    }
}

impl<R: Restriction> TryFrom<&str> for Path<R> {
    type Error = PathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// The host form of a path, produced only at the OS boundary.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NativePath(PathBuf);

impl NativePath {
    pub fn as_path(&self) -> &std::path::Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }

    pub fn as_os_string(&self) -> std::ffi::OsString {
        self.0.clone().into_os_string()
    }
}

impl fmt::Display for NativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.display().to_string())
    }
}

impl AsRef<std::path::Path> for NativePath {
    fn as_ref(&self) -> &std::path::Path {
        &self.0
    }
}

/// Name filter for directory iteration.
#[derive(Clone)]
pub enum ItemFilter {
    /// Matches nothing.
    Nothing,
    /// Matches every name.
    Everything,
    /// Matches iff the whole name matches the expression.
    Regex(regex::Regex),
    /// Matches iff the predicate returns true.
    Predicate(Rc<dyn Fn(&str) -> bool>),
}

impl ItemFilter {
    pub fn nothing() -> Self {
        ItemFilter::Nothing
    }

    pub fn everything() -> Self {
        ItemFilter::Everything
    }

    /// Full-match regular expression filter; the empty expression matches
    /// everything.
    pub fn regex(expression: &str) -> Result<Self, regex::Error> {
        if expression.is_empty() {
            return Ok(ItemFilter::Everything);
        }
        Ok(ItemFilter::Regex(regex::Regex::new(&format!(
            "^(?:{expression})$"
        ))?))
    }

    pub fn predicate(f: impl Fn(&str) -> bool + 'static) -> Self {
        ItemFilter::Predicate(Rc::new(f))
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            ItemFilter::Nothing => false,
            ItemFilter::Everything => true,
            ItemFilter::Regex(r) => r.is_match(name),
            ItemFilter::Predicate(f) => f(name),
        }
    }
}

impl fmt::Debug for ItemFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemFilter::Nothing => f.write_str("ItemFilter::Nothing"),
            ItemFilter::Everything => f.write_str("ItemFilter::Everything"),
            ItemFilter::Regex(r) => write!(f, "ItemFilter::Regex({:?})", r.as_str()),
            ItemFilter::Predicate(_) => f.write_str("ItemFilter::Predicate(..)"),
        }
    }
}

/// Lazy, restartable directory walk; see [`Path::iter_dir`].
pub struct IterDir<R: Restriction> {
    name_filter: ItemFilter,
    recurse_filter: ItemFilter,
    follow_symlinks: bool,
    pending_dirs: VecDeque<Path<R>>,
    current: std::vec::IntoIter<Path<R>>,
}

impl<R: Restriction> IterDir<R> {
    fn scan_next_dir(&mut self) -> Option<Result<(), PathError>> {
        let dir = self.pending_dirs.pop_front()?;
        let native = match dir.native() {
            Ok(n) => n,
            Err(e) => return Some(Err(e)),
        };
        let mut matched = Vec::new();
        let mut recurse = Vec::new();
        let entries = match std::fs::read_dir(native.as_path()) {
            Ok(entries) => entries,
            Err(source) => {
                return Some(Err(PathError::Io {
                    path: dir.as_string(),
                    source,
                }));
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(source) => {
                    return Some(Err(PathError::Io {
                        path: dir.as_string(),
                        source,
                    }));
                }
            };
            let Ok(name) = entry.file_name().into_string() else {
                continue; // not matchable by any filter
            };
            let is_dir = if self.follow_symlinks {
                entry.path().is_dir()
            } else {
                entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
            };
            let does_name_match = self.name_filter.matches(&name);
            let do_recurse = is_dir && self.recurse_filter.matches(&name);
            if does_name_match || do_recurse {
                let p = match Path::<Unrestricted>::new_with_dir_flag(&name, is_dir)
                    .and_then(|p| dir.join(&p))
                {
                    Ok(p) => p,
                    Err(e) => return Some(Err(e)),
                };
                if does_name_match {
                    matched.push(p.clone());
                }
                if do_recurse {
                    recurse.push(p);
                }
            }
        }
        matched.sort();
        self.current = matched.into_iter();
        self.pending_dirs.extend(recurse);
        self.pending_dirs.make_contiguous().sort();
        Some(Ok(()))
    }
}

impl<R: Restriction> Iterator for IterDir<R> {
    type Item = Result<Path<R>, PathError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(p) = self.current.next() {
                return Some(Ok(p));
            }
            match self.scan_next_dir() {
                None => return None,
                Some(Err(e)) => return Some(Err(e)),
                Some(Ok(())) => continue,
            }
        }
    }
}

/// Runtime-selected restriction, for dependency descriptors that carry
/// their path class as a value.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub enum PathClass {
    #[default]
    Unrestricted,
    RelativeOnly,
    AbsoluteOnly,
    NoSpace,
    Posix,
    PortablePosix,
    Windows,
    PortableWindows,
    Portable,
}

impl PathClass {
    pub fn name(self) -> &'static str {
        match self {
            PathClass::Unrestricted => Unrestricted::NAME,
            PathClass::RelativeOnly => RelativeOnly::NAME,
            PathClass::AbsoluteOnly => AbsoluteOnly::NAME,
            PathClass::NoSpace => NoSpace::NAME,
            PathClass::Posix => Posix::NAME,
            PathClass::PortablePosix => PortablePosix::NAME,
            PathClass::Windows => Windows::NAME,
            PathClass::PortableWindows => PortableWindows::NAME,
            PathClass::Portable => Portable::NAME,
        }
    }

    /// Applies the class's check to a path value.
    pub fn check<R: Restriction>(self, path: &Path<R>) -> Result<(), PathError> {
        let check = match self {
            PathClass::Unrestricted => Unrestricted::check,
            PathClass::RelativeOnly => RelativeOnly::check,
            PathClass::AbsoluteOnly => AbsoluteOnly::check,
            PathClass::NoSpace => NoSpace::check,
            PathClass::Posix => Posix::check,
            PathClass::PortablePosix => PortablePosix::check,
            PathClass::Windows => Windows::check,
            PathClass::PortableWindows => PortableWindows::check,
            PathClass::Portable => Portable::check,
        };
        check(&path.stem).map_err(|reason| PathError::Restricted {
            restriction: self.name(),
            path: path.as_string(),
            reason,
        })
    }

    /// The atomic checks the class implies, used to compare restrictivity.
    fn implied_checks(self) -> u16 {
        const REL: u16 = 1 << 0;
        const ABS: u16 = 1 << 1;
        const NOSPACE: u16 = 1 << 2;
        const POSIX: u16 = 1 << 3;
        const PPOSIX: u16 = 1 << 4;
        const WIN: u16 = 1 << 5;
        const PWIN: u16 = 1 << 6;
        match self {
            PathClass::Unrestricted => 0,
            PathClass::RelativeOnly => REL,
            PathClass::AbsoluteOnly => ABS,
            PathClass::NoSpace => NOSPACE,
            PathClass::Posix => POSIX,
            PathClass::PortablePosix => POSIX | PPOSIX,
            PathClass::Windows => WIN,
            PathClass::PortableWindows => WIN | PWIN,
            PathClass::Portable => REL | POSIX | PPOSIX | WIN | PWIN,
        }
    }

    /// True iff every path accepted by `self` is also accepted by `other`.
    pub fn is_at_least_as_restrictive_as(self, other: PathClass) -> bool {
        let s = self.implied_checks();
        let o = other.implied_checks();
        s & o == o
    }
}
