// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Component, Path, PathBuf};

/// Outcome of a path policy check.
#[derive(Debug, Clone)]
pub struct PathDecision {
    pub allowed: bool,
    /// Fully resolved (symlink-followed) form of the target
    pub resolved: PathBuf,
    /// Human-readable refusal reason; empty when allowed
    pub reason: String,
}

impl PathDecision {
    fn deny(resolved: PathBuf, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            resolved,
            reason: reason.into(),
        }
    }

    fn allow(resolved: PathBuf) -> Self {
        Self {
            allowed: true,
            resolved,
            reason: String::new(),
        }
    }
}

/// Filesystem containment policy.
///
/// Targets and boundaries are canonicalized before the containment check so
/// a symlink inside an allowed root cannot escape it. Denied boundaries win
/// over allowed ones.
#[derive(Debug, Clone, Default)]
pub struct PathPolicy {
    allowed: Vec<PathBuf>,
    denied: Vec<PathBuf>,
}

impl PathPolicy {
    pub fn new(allowed: &[String], denied: &[String]) -> Self {
        Self {
            allowed: allowed.iter().map(|p| PathBuf::from(expand_home(p))).collect(),
            denied: denied.iter().map(|p| PathBuf::from(expand_home(p))).collect(),
        }
    }

    /// Validate `target` against the policy.
    ///
    /// The target is `~`-expanded and canonicalized (following symlinks; for
    /// a path that does not exist yet, the nearest existing ancestor is
    /// canonicalized and the unresolved tail re-appended). Each boundary is
    /// canonicalized the same way before the `starts_with` containment test.
    pub fn validate(&self, target: &str) -> PathDecision {
        let expanded = expand_home(target);
        let resolved = canonicalize_lenient(Path::new(&expanded));

        for boundary in &self.denied {
            let denied = canonicalize_lenient(boundary);
            if resolved.starts_with(&denied) {
                return PathDecision::deny(
                    resolved,
                    format!("path is inside denied boundary {}", denied.display()),
                );
            }
        }

        for boundary in &self.allowed {
            let allowed = canonicalize_lenient(boundary);
            if resolved.starts_with(&allowed) {
                return PathDecision::allow(resolved);
            }
        }

        PathDecision::deny(resolved, "path is outside all allowed boundaries")
    }
}

fn expand_home(p: &str) -> String {
    shellexpand::tilde(p).into_owned()
}

/// Canonicalize `path`, tolerating non-existent tails.
///
/// `std::fs::canonicalize` fails on paths that do not exist, but tools must
/// be able to validate a file they are about to create. Walk up to the
/// nearest existing ancestor, canonicalize that (resolving every symlink on
/// the way), then re-append the unresolved remainder with `.`/`..`
/// components normalized out lexically.
fn canonicalize_lenient(path: &Path) -> PathBuf {
    if let Ok(c) = std::fs::canonicalize(path) {
        return c;
    }

    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }

    let mut base = std::fs::canonicalize(&existing).unwrap_or(existing);
    for name in tail.iter().rev() {
        match Path::new(name).components().next() {
            Some(Component::ParentDir) => {
                base.pop();
            }
            Some(Component::CurDir) | None => {}
            _ => base.push(name),
        }
    }
    base
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(allowed: &[&str], denied: &[&str]) -> PathPolicy {
        PathPolicy::new(
            &allowed.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &denied.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
    }

    #[test]
    fn inside_allowed_root_is_accepted() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_str().unwrap().to_string();
        std::fs::write(tmp.path().join("ok.txt"), "x").unwrap();
        let p = policy(&[&root], &[]);
        let d = p.validate(&format!("{root}/ok.txt"));
        assert!(d.allowed, "{}", d.reason);
    }

    #[test]
    fn outside_all_roots_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let p = policy(&[tmp.path().to_str().unwrap()], &[]);
        let d = p.validate("/etc/passwd");
        assert!(!d.allowed);
        assert!(d.reason.contains("outside"));
    }

    #[test]
    fn deny_wins_over_allow() {
        let tmp = tempfile::tempdir().unwrap();
        let secret = tmp.path().join("secret");
        std::fs::create_dir_all(&secret).unwrap();
        std::fs::write(secret.join("k.txt"), "x").unwrap();
        let p = policy(
            &[tmp.path().to_str().unwrap()],
            &[secret.to_str().unwrap()],
        );
        let d = p.validate(secret.join("k.txt").to_str().unwrap());
        assert!(!d.allowed);
        assert!(d.reason.contains("denied"));

        std::fs::write(tmp.path().join("ok.txt"), "x").unwrap();
        let ok = p.validate(tmp.path().join("ok.txt").to_str().unwrap());
        assert!(ok.allowed, "{}", ok.reason);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink("/etc/passwd", &link).unwrap();
        let p = policy(&[tmp.path().to_str().unwrap()], &[]);
        let d = p.validate(link.to_str().unwrap());
        assert!(!d.allowed, "symlink to /etc/passwd must not be allowed");
        assert!(d.reason.contains("outside"));
    }

    #[test]
    fn nonexistent_target_resolves_through_existing_ancestor() {
        let tmp = tempfile::tempdir().unwrap();
        let p = policy(&[tmp.path().to_str().unwrap()], &[]);
        let d = p.validate(tmp.path().join("new/dir/file.txt").to_str().unwrap());
        assert!(d.allowed, "{}", d.reason);
    }

    #[test]
    fn dotdot_cannot_escape_lexically() {
        let tmp = tempfile::tempdir().unwrap();
        let p = policy(&[tmp.path().to_str().unwrap()], &[]);
        let sneaky = format!("{}/missing/../../../../etc/passwd", tmp.path().display());
        let d = p.validate(&sneaky);
        assert!(!d.allowed);
    }

    #[test]
    fn canonical_allowed_path_is_a_fixed_point() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "x").unwrap();
        let p = policy(&[tmp.path().to_str().unwrap()], &[]);
        let first = p.validate(tmp.path().join("a.txt").to_str().unwrap());
        assert!(first.allowed);
        let second = p.validate(first.resolved.to_str().unwrap());
        assert!(second.allowed);
        assert_eq!(first.resolved, second.resolved);
    }

    #[test]
    fn empty_policy_refuses_everything() {
        let p = policy(&[], &[]);
        assert!(!p.validate("/tmp").allowed);
    }
}
