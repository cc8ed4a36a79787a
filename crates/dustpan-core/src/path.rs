//! Normalized path keys.
//!
//! A [`PathKey`] is the identity of a path for caching and lookup. Two
//! spellings of the same location (`/a/./b`, `/a/c/../b`, NFD vs NFC names,
//! different case on case-insensitive systems) produce equal keys.
//!
//! Symlinks are deliberately not resolved: the key names the path the user
//! navigated, not where it leads.

use std::cmp::Ordering;
use std::ffi::OsStr;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Component, Path, PathBuf};

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::error::ScanError;

/// Longest path accepted, in bytes of the OS string.
#[cfg(windows)]
pub const MAX_PATH_LEN: usize = 32_767;

/// Longest path accepted, in bytes of the OS string.
#[cfg(not(windows))]
pub const MAX_PATH_LEN: usize = 4096;

/// Separator used inside key strings on every platform.
pub const KEY_SEPARATOR: char = '/';

const CASE_INSENSITIVE: bool = cfg!(any(windows, target_os = "macos"));

/// A canonical, absolute, OS-normalized path.
///
/// Equality, hashing and ordering use the normalized key string only; the
/// original absolute path is kept for display and filesystem access.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "PathBuf", into = "PathBuf")]
pub struct PathKey {
    path: PathBuf,
    key: CompactString,
}

impl PathKey {
    /// Normalize a raw path into a key.
    ///
    /// Fails with [`ScanError::InvalidPath`] on empty input, embedded NUL
    /// bytes, or paths longer than [`MAX_PATH_LEN`].
    pub fn normalize(raw: impl AsRef<Path>) -> Result<Self, ScanError> {
        let raw = raw.as_ref();
        let os = raw.as_os_str();

        if os.is_empty() {
            return Err(ScanError::invalid_path(raw, "path is empty"));
        }
        if os.to_string_lossy().contains('\0') {
            return Err(ScanError::invalid_path(raw, "path contains a NUL byte"));
        }
        if os.len() > MAX_PATH_LEN {
            return Err(ScanError::invalid_path(
                raw,
                format!("path exceeds {MAX_PATH_LEN} bytes"),
            ));
        }

        let absolute = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            let cwd = std::env::current_dir().map_err(|e| {
                ScanError::invalid_path(raw, format!("cannot resolve relative path: {e}"))
            })?;
            cwd.join(raw)
        };

        let path = lexical_normalize(&absolute);
        if path.as_os_str().len() > MAX_PATH_LEN {
            return Err(ScanError::invalid_path(
                raw,
                format!("path exceeds {MAX_PATH_LEN} bytes once made absolute"),
            ));
        }

        let key = key_for(&path);
        Ok(Self { path, key })
    }

    /// The absolute path, with its original spelling.
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// The normalized key string.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Consume the key, returning the absolute path.
    pub fn into_path_buf(self) -> PathBuf {
        self.path
    }

    /// Key of a direct child named `name`.
    ///
    /// `name` must be a single path component, as yielded by `read_dir`.
    pub fn join(&self, name: impl AsRef<OsStr>) -> Self {
        let name = name.as_ref();
        let mut key = String::with_capacity(self.key.len() + name.len() + 1);
        key.push_str(&self.nested_prefix());
        key.push_str(&component_key(name));

        Self {
            path: self.path.join(name),
            key: key.into(),
        }
    }

    /// Key of the parent directory, or `None` for a root.
    pub fn parent(&self) -> Option<Self> {
        self.path.parent().map(|parent| Self {
            path: parent.to_path_buf(),
            key: key_for(parent),
        })
    }

    /// Final component of the path, if any.
    pub fn file_name(&self) -> Option<&OsStr> {
        self.path.file_name()
    }

    /// Display name: the final component, or the whole path for a root.
    pub fn name(&self) -> CompactString {
        match self.path.file_name() {
            Some(name) => CompactString::new(name.to_string_lossy()),
            None => CompactString::new(self.path.to_string_lossy()),
        }
    }

    /// Whether this key is a filesystem root.
    pub fn is_root(&self) -> bool {
        self.path.parent().is_none()
    }

    /// The prefix every nested key starts with (the key plus a separator).
    pub fn nested_prefix(&self) -> CompactString {
        if self.key.ends_with(KEY_SEPARATOR) {
            self.key.clone()
        } else {
            let mut prefix = self.key.clone();
            prefix.push(KEY_SEPARATOR);
            prefix
        }
    }

    /// Whether `other` is this key or nested anywhere below it.
    pub fn contains(&self, other: &PathKey) -> bool {
        other.key == self.key || other.key.starts_with(self.nested_prefix().as_str())
    }
}

/// Resolve `.` and `..` without touching the filesystem.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                // Popping a root is a no-op, which keeps `/..` at `/`.
                out.pop();
            }
            Component::Normal(name) => out.push(name),
        }
    }
    out
}

fn key_for(path: &Path) -> CompactString {
    let mut key: String = escape_os(path.as_os_str()).nfc().collect();
    if std::path::MAIN_SEPARATOR != KEY_SEPARATOR {
        key = key.replace(std::path::MAIN_SEPARATOR, "/");
    }
    if CASE_INSENSITIVE {
        key = key.to_lowercase();
    }
    key.into()
}

fn component_key(name: &OsStr) -> String {
    let name: String = escape_os(name).nfc().collect();
    if CASE_INSENSITIVE {
        name.to_lowercase()
    } else {
        name
    }
}

/// Text form of an OS string that keeps distinct byte sequences distinct.
///
/// Bytes that are not valid UTF-8 become `%XX`, and a literal `%` becomes
/// `%25` so an escape can never collide with a real name.
#[cfg(unix)]
fn escape_os(os: &OsStr) -> String {
    use std::fmt::Write;
    use std::os::unix::ffi::OsStrExt;

    let bytes = os.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        for c in chunk.valid().chars() {
            if c == '%' {
                out.push_str("%25");
            } else {
                out.push(c);
            }
        }
        for byte in chunk.invalid() {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

// Windows names are UTF-16; unpaired surrogates are the only lossy case.
#[cfg(not(unix))]
fn escape_os(os: &OsStr) -> String {
    os.to_string_lossy().replace('%', "%25")
}

impl PartialEq for PathKey {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for PathKey {}

impl Hash for PathKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for PathKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PathKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl fmt::Debug for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PathKey").field(&self.key).finish()
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl AsRef<Path> for PathKey {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl TryFrom<PathBuf> for PathKey {
    type Error = ScanError;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        Self::normalize(path)
    }
}

impl From<PathKey> for PathBuf {
    fn from(key: PathKey) -> Self {
        key.path
    }
}
