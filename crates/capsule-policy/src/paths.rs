//! Filesystem rules: canonicalization, hidden components, glob matching,
//! and symlink-escape containment.
//!
//! Matching always happens on canonical absolute paths — a raw argument
//! path never reaches the glob step. Relative allow/deny patterns are
//! anchored to the canonical workspace root.

use std::io;
use std::path::{Component, Path, PathBuf};

use capsule_protocol::PolicyDecision;
use capsule_protocol::policy::FsPolicy;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde_json::Value;

use crate::PolicyEvalError;

/// Whether the call reads or writes the target path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

pub(crate) fn evaluate(
    rules: &FsPolicy,
    working_dir: &Path,
    args: &Value,
    access: Access,
) -> Result<PolicyDecision, PolicyEvalError> {
    let Some(path) = args.get("path").and_then(Value::as_str) else {
        return Ok(PolicyDecision::deny(
            "path argument is missing or not a string",
            "fs.args",
        ));
    };

    // Lexical hidden check first: a dotfile request is refused without
    // touching the filesystem at all.
    if !rules.allow_hidden
        && let Some(component) = hidden_component(Path::new(path))
    {
        return Ok(PolicyDecision::deny(
            format!("hidden path component {component:?} is not allowed"),
            "fs.allow_hidden",
        ));
    }

    if access == Access::Write
        && let Some(content) = args.get("content").and_then(Value::as_str)
        && content.len() as u64 > rules.max_size_bytes
    {
        return Ok(PolicyDecision::deny(
            format!(
                "content length {} exceeds max_size_bytes {}",
                content.len(),
                rules.max_size_bytes
            ),
            "fs.max_size_bytes",
        ));
    }

    let root = match working_dir.canonicalize() {
        Ok(root) => root,
        Err(err) => {
            return Ok(PolicyDecision::deny(
                format!("cannot resolve working directory: {err}"),
                "fs.canonicalize",
            ));
        }
    };

    let candidate = root.join(path);
    let canonical = match canonicalize_for(&candidate, access) {
        Ok(canonical) => canonical,
        Err(err) => {
            return Ok(PolicyDecision::deny(
                format!("cannot resolve path {path:?}: {err}"),
                "fs.canonicalize",
            ));
        }
    };

    // Hidden again, post-resolution: a symlink may point at a dotfile.
    // Scoped to components below the root — a path that resolved outside
    // the workspace is denied by the containment checks instead.
    if !rules.allow_hidden
        && let Ok(scoped) = canonical.strip_prefix(&root)
        && let Some(component) = hidden_component(scoped)
    {
        return Ok(PolicyDecision::deny(
            format!("hidden path component {component:?} is not allowed"),
            "fs.allow_hidden",
        ));
    }

    let allow = compile(&rules.allow_paths, &root)?;
    let deny = compile(&rules.deny_paths, &root)?;

    if !allow.is_match(&canonical) {
        // Distinguish a plain miss from a symlink/traversal escape so the
        // audit log names what actually happened.
        let literal = lexical_resolve(&root, path);
        let reason = if allow.is_match(&literal) {
            format!(
                "path {path:?} resolves to {} which escapes the allowed paths (symlink or traversal)",
                canonical.display()
            )
        } else {
            format!("no allow_paths pattern matches {}", canonical.display())
        };
        return Ok(PolicyDecision::deny(reason, "fs.allow_paths"));
    }

    if deny.is_match(&canonical) {
        return Ok(PolicyDecision::deny(
            format!("deny_paths pattern matches {}", canonical.display()),
            "fs.deny_paths",
        ));
    }

    // Containment: the target must sit under a resolved allow base that is
    // itself inside the workspace root. An allow-listed directory that is
    // really a symlink out of the workspace contributes no base.
    let bases = resolved_allow_bases(&rules.allow_paths, &root);
    if !bases.iter().any(|base| canonical.starts_with(base)) {
        return Ok(PolicyDecision::deny(
            format!(
                "{} escapes every resolved allow base within the workspace",
                canonical.display()
            ),
            "fs.symlink_escape",
        ));
    }

    Ok(PolicyDecision::allow(
        "all filesystem rules passed",
        "fs.allow_paths",
    ))
}

/// Mechanical re-check used by `fs.write` before creating missing parent
/// directories: the resolved target must match the allow set.
pub fn write_target_allowed(rules: &FsPolicy, working_dir: &Path, path: &str) -> bool {
    let Ok(root) = working_dir.canonicalize() else {
        return false;
    };
    let Ok(canonical) = resolve_with_ancestors(&root.join(path)) else {
        return false;
    };
    let Ok(allow) = compile(&rules.allow_paths, &root) else {
        return false;
    };
    allow.is_match(&canonical)
}

fn canonicalize_for(candidate: &Path, access: Access) -> io::Result<PathBuf> {
    match access {
        Access::Read => candidate.canonicalize(),
        Access::Write => resolve_with_ancestors(candidate),
    }
}

/// Canonicalize the deepest existing ancestor and re-append the missing
/// suffix. The suffix cannot contain `..` (a path ending in `..` has no
/// file name) and cannot hide a symlink, because none of it exists yet.
fn resolve_with_ancestors(candidate: &Path) -> io::Result<PathBuf> {
    match candidate.canonicalize() {
        Ok(canonical) => Ok(canonical),
        Err(_) => {
            let parent = candidate.parent().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "path has no existing ancestor")
            })?;
            let file = candidate.file_name().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "path traverses a missing directory with '..'",
                )
            })?;
            Ok(resolve_with_ancestors(parent)?.join(file))
        }
    }
}

/// Resolve `..` and `.` lexically, without consulting the filesystem.
fn lexical_resolve(root: &Path, path: &str) -> PathBuf {
    let mut resolved = root.to_path_buf();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::ParentDir => {
                resolved.pop();
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => resolved = PathBuf::from("/"),
        }
    }
    resolved
}

fn hidden_component(path: &Path) -> Option<String> {
    path.components().find_map(|component| match component {
        Component::Normal(part) => {
            let part = part.to_string_lossy();
            (part.starts_with('.')).then(|| part.into_owned())
        }
        _ => None,
    })
}

fn compile(patterns: &[String], root: &Path) -> Result<GlobSet, PolicyEvalError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let anchored = anchor(root, pattern);
        let glob = GlobBuilder::new(&anchored)
            .literal_separator(true)
            .build()
            .map_err(|err| PolicyEvalError::BadPattern {
                pattern: pattern.clone(),
                message: err.to_string(),
            })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|err| PolicyEvalError::Internal(err.to_string()))
}

fn anchor(root: &Path, pattern: &str) -> String {
    if pattern.starts_with('/') {
        return pattern.to_string();
    }
    let trimmed = pattern.strip_prefix("./").unwrap_or(pattern);
    format!("{}/{}", root.display(), trimmed)
}

/// The literal prefix of each allow pattern (up to the first wildcard),
/// resolved through symlinks, kept only when it stays inside the root.
fn resolved_allow_bases(patterns: &[String], root: &Path) -> Vec<PathBuf> {
    patterns
        .iter()
        .filter_map(|pattern| {
            let base = pattern_base(&anchor(root, pattern));
            let resolved = resolve_with_ancestors(&base).ok()?;
            resolved.starts_with(root).then_some(resolved)
        })
        .collect()
}

fn pattern_base(pattern: &str) -> PathBuf {
    match pattern.find(['*', '?', '[', '{']) {
        None => PathBuf::from(pattern),
        Some(idx) => match pattern[..idx].rfind('/') {
            Some(slash) if slash > 0 => PathBuf::from(&pattern[..slash]),
            _ => PathBuf::from("/"),
        },
    }
}
