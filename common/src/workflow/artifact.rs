// Local artifact discovery
// Everything here runs before any network activity so a missing artifact fails fast

use crate::errors::DeployError;
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Semantic version parsed from a package file name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(format!("Invalid version: {}", s));
        }
        let parse = |part: &str| {
            part.parse::<u64>()
                .map_err(|_| format!("Invalid version: {}", s))
        };
        Ok(Version {
            major: parse(parts[0])?,
            minor: parse(parts[1])?,
            patch: parse(parts[2])?,
        })
    }
}

/// A versioned installer package found on the local filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageArtifact {
    pub path: PathBuf,
    pub file_name: String,
    pub version: Version,
}

/// Find `<prefix>_<major>.<minor>.<patch>.deb` in `dir`
///
/// When several files match, the highest version wins.
pub fn find_versioned_package(dir: &Path, prefix: &str) -> Result<PackageArtifact, DeployError> {
    let pattern = Regex::new(&format!(r"^{}_(\d+\.\d+\.\d+)\.deb$", regex::escape(prefix)))
        .map_err(|e| DeployError::Config(e.to_string()))?;

    let entries = fs::read_dir(dir).map_err(|_| {
        DeployError::NotFound(format!("{}_<version>.deb in {}", prefix, dir.display()))
    })?;

    let mut best: Option<PackageArtifact> = None;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let Some(captures) = pattern.captures(&file_name) else {
            continue;
        };
        let Ok(version) = captures[1].parse::<Version>() else {
            continue;
        };
        debug!(file_name = %file_name, version = %version, "Package candidate found");

        if best.as_ref().map_or(true, |current| version > current.version) {
            best = Some(PackageArtifact {
                path: entry.path(),
                file_name,
                version,
            });
        }
    }

    best.ok_or_else(|| {
        DeployError::NotFound(format!("{}_<version>.deb in {}", prefix, dir.display()))
    })
}

/// Require `path` to be an existing, non-empty directory
pub fn require_directory(path: &Path) -> Result<(), DeployError> {
    let missing = || DeployError::NotFound(format!("directory {}", path.display()));
    if !path.is_dir() {
        return Err(missing());
    }
    let mut entries = fs::read_dir(path)?;
    if entries.next().is_none() {
        return Err(missing());
    }
    Ok(())
}

/// Find the first file in `dir` (by name) whose name matches `pattern`
pub fn find_matching(dir: &Path, pattern: &str) -> Result<PathBuf, DeployError> {
    let regex = Regex::new(pattern).map_err(|e| DeployError::Config(e.to_string()))?;
    let mut names: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| regex.is_match(name))
        })
        .collect();
    names.sort();
    names
        .into_iter()
        .next()
        .ok_or_else(|| DeployError::NotFound(format!("{} in {}", pattern, dir.display())))
}

/// Parse a `key=value` overrides file
///
/// Blank lines and `#` comments are skipped. Keys are restricted to
/// `[A-Za-z0-9_.-]`; values may not contain quotes or newlines since they
/// end up inside a remote `sed` expression.
pub fn parse_overrides(path: &Path) -> Result<Vec<(String, String)>, DeployError> {
    let content = fs::read_to_string(path)
        .map_err(|_| DeployError::NotFound(format!("overrides file {}", path.display())))?;

    let mut overrides = Vec::new();
    for (number, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            DeployError::Config(format!(
                "{}:{}: expected key=value",
                path.display(),
                number + 1
            ))
        })?;
        let key = key.trim();
        let value = value.trim();
        let key_ok = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if !key_ok || value.contains('\'') || value.contains('"') {
            return Err(DeployError::Config(format!(
                "{}:{}: unsupported override `{}`",
                path.display(),
                number + 1,
                line
            )));
        }
        overrides.push((key.to_string(), value.to_string()));
    }

    if overrides.is_empty() {
        return Err(DeployError::NotFound(format!(
            "overrides in {}",
            path.display()
        )));
    }
    Ok(overrides)
}
