//! Release versioning
//!
//! CI builds stamp the patch component with the pipeline's run number. The
//! version lives in two places: the `[package]` version in `Cargo.toml` and the
//! `VERSION` constant in `src/lib.rs`. Both are rewritten together.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use regex::Regex;
use tracing::{info, warn};

use crate::error::OpenmuxError;

pub const MANIFEST_PATH: &str = "Cargo.toml";
pub const SOURCE_PATH: &str = "src/lib.rs";

/// `MAJOR.MINOR.PATCH[-suffix]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub suffix: Option<String>,
}

impl Version {
    /// Same major and minor, `patch` replaced, suffix dropped.
    pub fn with_patch(&self, patch: u64) -> Self {
        Self {
            major: self.major,
            minor: self.minor,
            patch,
            suffix: None,
        }
    }

    /// `MAJOR.MINOR.PATCH` without the suffix.
    pub fn base(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base())?;
        if let Some(suffix) = &self.suffix {
            write!(f, "-{suffix}")?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = OpenmuxError;

    fn from_str(s: &str) -> Result<Self, OpenmuxError> {
        let invalid = || OpenmuxError::Release(format!("invalid version format: {s}"));

        let (base, suffix) = match s.split_once('-') {
            Some((base, suffix)) if !suffix.is_empty() => (base, Some(suffix.to_owned())),
            Some(_) => return Err(invalid()),
            None => (s, None),
        };

        let parts = base
            .split('.')
            .map(|p| p.parse::<u64>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;

        match parts[..] {
            [major, minor, patch] => Ok(Self {
                major,
                minor,
                patch,
                suffix,
            }),
            _ => Err(invalid()),
        }
    }
}

/// Read the first `version = "..."` line of a manifest.
pub fn current_version(manifest: &str) -> Result<Version, OpenmuxError> {
    let re = Regex::new(r#"(?m)^\s*version\s*=\s*["']([^"']+)["']"#)
        .map_err(|e| OpenmuxError::Release(e.to_string()))?;
    let captures = re
        .captures(manifest)
        .ok_or_else(|| OpenmuxError::Release("could not find version in manifest".to_owned()))?;
    captures[1].parse()
}

/// Replace the exact old version in the manifest's first `version = ` entry.
/// `None` when the pattern is absent.
pub fn rewrite_manifest(content: &str, old: &Version, new: &Version) -> Option<String> {
    let pattern = format!(
        r#"(version\s*=\s*["']){}(["'])"#,
        regex::escape(&old.to_string())
    );
    replace_first(content, &pattern, new)
}

/// Replace the `VERSION` constant, matching the old base version with any suffix.
pub fn rewrite_source(content: &str, old: &Version, new: &Version) -> Option<String> {
    let pattern = format!(
        r#"(VERSION\s*:\s*&str\s*=\s*"){}(?:-[A-Za-z0-9.]+)?(")"#,
        regex::escape(&old.base())
    );
    replace_first(content, &pattern, new)
}

fn replace_first(content: &str, pattern: &str, new: &Version) -> Option<String> {
    let re = Regex::new(pattern).ok()?;
    let captures = re.captures(content)?;
    let (whole, open, close) = (captures.get(0)?, captures.get(1)?, captures.get(2)?);

    let mut out = String::with_capacity(content.len());
    out.push_str(&content[..whole.start()]);
    out.push_str(open.as_str());
    out.push_str(&new.to_string());
    out.push_str(close.as_str());
    out.push_str(&content[whole.end()..]);
    Some(out)
}

#[derive(Debug)]
pub struct BumpOutcome {
    pub previous: Version,
    pub bumped: Version,
    pub updated: Vec<PathBuf>,
}

/// Stamp `run_number` as the patch version in both files under `root`.
///
/// Each file is attempted even if the other fails; any file without a match
/// makes the whole bump an error.
pub fn bump(root: &Path, run_number: u64) -> Result<BumpOutcome, OpenmuxError> {
    let manifest_path = root.join(MANIFEST_PATH);
    let source_path = root.join(SOURCE_PATH);

    let manifest = read(&manifest_path)?;
    let previous = current_version(&manifest)?;
    let bumped = previous.with_patch(run_number);
    info!(%previous, %bumped, "bumping version");

    let mut updated = Vec::new();
    let mut missing = Vec::new();

    let rewrites: [(&Path, fn(&str, &Version, &Version) -> Option<String>); 2] = [
        (manifest_path.as_path(), rewrite_manifest),
        (source_path.as_path(), rewrite_source),
    ];
    for (path, rewrite) in rewrites {
        let content = read(path)?;
        match rewrite(&content, &previous, &bumped) {
            Some(new_content) => {
                std::fs::write(path, new_content).map_err(|e| {
                    OpenmuxError::Release(format!("cannot write {}: {e}", path.display()))
                })?;
                info!(path = %path.display(), "updated");
                updated.push(path.to_path_buf());
            }
            None => {
                warn!(path = %path.display(), "no version pattern found");
                missing.push(path.display().to_string());
            }
        }
    }

    if !missing.is_empty() {
        return Err(OpenmuxError::Release(format!(
            "no version pattern found in {}",
            missing.join(", ")
        )));
    }

    Ok(BumpOutcome {
        previous,
        bumped,
        updated,
    })
}

fn read(path: &Path) -> Result<String, OpenmuxError> {
    std::fs::read_to_string(path)
        .map_err(|e| OpenmuxError::Release(format!("cannot read {}: {e}", path.display())))
}
