//! Path Gate: the mandatory pre-flight every reading or mutating operation
//! runs through. Pins a user-supplied path inside one of the configured
//! base directories, resolves symlinks and re-checks containment on the
//! resolved path.
//!
//! The order matters: base matching happens on the lexically normalized
//! input, parent creation happens before symlink resolution, and the
//! containment re-check happens after it. The re-check is the security
//! invariant that catches symlink escapes.

use crate::config::Config;
use crate::owner::Ownership;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("path not allowed")]
    NotAllowed,

    #[error("cannot operate on base path")]
    BasePath,

    #[error("symlink escape not allowed")]
    SymlinkEscape,

    #[error("paths must be in the same base")]
    DifferentBase,

    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Ownership(String),

    #[error("{0}")]
    Io(String),
}

/// A configured base directory with its symlink-resolved form. Resolved
/// once at startup; bases never change at runtime.
#[derive(Debug, Clone)]
pub struct BasePath {
    pub path: PathBuf,
    pub real: PathBuf,
}

/// Outcome of a successful validation.
#[derive(Debug, Clone)]
pub struct Resolved {
    /// Symlink-resolved absolute path; for a not-yet-existing target this
    /// is `realpath(parent)/basename`.
    pub real_path: PathBuf,
    /// The normalized request path, kept for user-facing payloads.
    pub path: PathBuf,
    pub base: Arc<BasePath>,
}

#[derive(Debug, Default, Clone)]
pub struct ValidateOptions {
    /// Permit operating on the base directory itself.
    pub allow_base_path: bool,
    /// Create missing parent directories before resolution.
    pub create_parents: bool,
    /// Ownership applied to directories created by `create_parents`.
    pub ownership: Option<Ownership>,
}

pub struct PathGate {
    bases: Vec<Arc<BasePath>>,
    dev_override: Option<(u32, u32)>,
}

/// Collapse `.` and `..` without touching the filesystem. `..` above the
/// root stays clamped at `/`.
pub fn normalize_lexical(input: &str) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in Path::new(input).components() {
        match comp {
            Component::RootDir => out.push("/"),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
                if out.as_os_str().is_empty() {
                    out.push("/");
                }
            }
            Component::Normal(c) => out.push(c),
            Component::Prefix(_) => {}
        }
    }
    if out.as_os_str().is_empty() {
        out.push("/");
    }
    out
}

impl PathGate {
    /// Resolve every configured base once. A missing or non-directory base
    /// is a startup error.
    pub async fn new(cfg: &Config) -> anyhow::Result<Self> {
        let mut bases = Vec::with_capacity(cfg.base_paths.len());
        for raw in &cfg.base_paths {
            let path = normalize_lexical(&raw.to_string_lossy());
            let real = fs::canonicalize(&path)
                .await
                .map_err(|e| anyhow::anyhow!("base path {}: {e}", path.display()))?;
            let meta = fs::metadata(&real).await?;
            if !meta.is_dir() {
                anyhow::bail!("base path is not a directory: {}", path.display());
            }
            bases.push(Arc::new(BasePath { path, real }));
        }
        Ok(Self {
            bases,
            dev_override: cfg.dev_override,
        })
    }

    pub fn bases(&self) -> &[Arc<BasePath>] {
        &self.bases
    }

    pub async fn validate(&self, input: &str, opts: &ValidateOptions) -> Result<Resolved, GateError> {
        let normalized = normalize_lexical(input);

        let base = self
            .bases
            .iter()
            .find(|b| normalized.starts_with(&b.path))
            .cloned()
            .ok_or(GateError::NotAllowed)?;
        if normalized == base.path && !opts.allow_base_path {
            return Err(GateError::BasePath);
        }

        if opts.create_parents {
            self.prepare_parents(&normalized, &base, opts.ownership.as_ref())
                .await?;
        }

        let real_path = match fs::canonicalize(&normalized).await {
            Ok(real) => real,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let parent = normalized.parent().ok_or(GateError::NotFound)?;
                let name = normalized
                    .file_name()
                    .ok_or_else(|| GateError::Invalid("invalid path".to_string()))?;
                match fs::canonicalize(parent).await {
                    Ok(real_parent) => real_parent.join(name),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(GateError::NotFound)
                    }
                    Err(_) => return Err(GateError::NotFound),
                }
            }
            Err(e) => return Err(GateError::Invalid(format!("invalid path: {e}"))),
        };

        if !real_path.starts_with(&base.real) {
            return Err(GateError::SymlinkEscape);
        }

        Ok(Resolved {
            real_path,
            path: normalized,
            base,
        })
    }

    /// Validate both endpoints of a move/intra-base copy and require them
    /// to land in the same base.
    pub async fn validate_same_base(
        &self,
        from: &str,
        to: &str,
    ) -> Result<(Resolved, Resolved), GateError> {
        let opts = ValidateOptions::default();
        let from = self.validate(from, &opts).await?;
        let to = self.validate(to, &opts).await?;
        if !Arc::ptr_eq(&from.base, &to.base) {
            return Err(GateError::DifferentBase);
        }
        Ok((from, to))
    }

    /// Create missing parents of `normalized` (before symlink resolution),
    /// then walk from the leaf parent upward applying directory ownership,
    /// stopping strictly before the base.
    async fn prepare_parents(
        &self,
        normalized: &Path,
        base: &BasePath,
        ownership: Option<&Ownership>,
    ) -> Result<(), GateError> {
        let Some(parent) = normalized.parent() else {
            return Ok(());
        };
        fs::create_dir_all(parent)
            .await
            .map_err(|e| GateError::Io(format!("mkdir {}: {e}", parent.display())))?;

        if let Some(own) = ownership {
            let mut cur = parent.to_path_buf();
            while cur.starts_with(&base.path) && cur != base.path && cur != base.real {
                own.apply_dir(&cur, self.dev_override)
                    .map_err(|e| GateError::Ownership(e.to_string()))?;
                match cur.parent() {
                    Some(p) => cur = p.to_path_buf(),
                    None => break,
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Args, Config};
    use clap::Parser;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn config_for(bases: &[&Path]) -> Config {
        let joined = bases
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(",");
        Config::from_args(Args::parse_from([
            "filegate",
            "--token",
            "t",
            "--allowed-base-paths",
            &joined,
        ]))
        .unwrap()
    }

    async fn gate_for(bases: &[&Path]) -> PathGate {
        PathGate::new(&config_for(bases)).await.unwrap()
    }

    #[test]
    fn normalization_collapses_dots() {
        assert_eq!(normalize_lexical("/a/b/../c/./d"), PathBuf::from("/a/c/d"));
        assert_eq!(normalize_lexical("/a//b///c"), PathBuf::from("/a/b/c"));
        assert_eq!(normalize_lexical("/../../x"), PathBuf::from("/x"));
        assert_eq!(normalize_lexical("/"), PathBuf::from("/"));
    }

    #[tokio::test]
    async fn rejects_path_outside_any_base() {
        let dir = TempDir::new().unwrap();
        let gate = gate_for(&[dir.path()]).await;
        let err = gate
            .validate("/etc/passwd", &ValidateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::NotAllowed));
    }

    #[tokio::test]
    async fn dot_dot_cannot_break_out() {
        let dir = TempDir::new().unwrap();
        let gate = gate_for(&[dir.path()]).await;
        let sneaky = format!("{}/sub/../../../../etc", dir.path().display());
        let err = gate
            .validate(&sneaky, &ValidateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::NotAllowed));
    }

    #[tokio::test]
    async fn base_itself_needs_opt_in() {
        let dir = TempDir::new().unwrap();
        let gate = gate_for(&[dir.path()]).await;
        let raw = dir.path().to_string_lossy();

        let err = gate
            .validate(&raw, &ValidateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::BasePath));

        let ok = gate
            .validate(
                &raw,
                &ValidateOptions {
                    allow_base_path: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(ok.real_path, dir.path().canonicalize().unwrap());
    }

    #[tokio::test]
    async fn missing_target_resolves_through_parent() {
        let dir = TempDir::new().unwrap();
        let gate = gate_for(&[dir.path()]).await;
        let target = format!("{}/fresh.txt", dir.path().display());
        let resolved = gate
            .validate(&target, &ValidateOptions::default())
            .await
            .unwrap();
        assert_eq!(
            resolved.real_path,
            dir.path().canonicalize().unwrap().join("fresh.txt")
        );
    }

    #[tokio::test]
    async fn missing_parent_is_not_found() {
        let dir = TempDir::new().unwrap();
        let gate = gate_for(&[dir.path()]).await;
        let target = format!("{}/no/such/file.txt", dir.path().display());
        let err = gate
            .validate(&target, &ValidateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::NotFound));
    }

    #[tokio::test]
    async fn symlink_escape_is_refused() {
        let base = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        symlink(outside.path(), base.path().join("link")).unwrap();

        let gate = gate_for(&[base.path()]).await;
        let target = format!("{}/link", base.path().display());
        let err = gate
            .validate(&target, &ValidateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::SymlinkEscape));

        // A file behind the escaping link is just as forbidden.
        std::fs::write(outside.path().join("secret"), b"x").unwrap();
        let target = format!("{}/link/secret", base.path().display());
        let err = gate
            .validate(&target, &ValidateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::SymlinkEscape));
    }

    #[tokio::test]
    async fn symlink_within_base_is_fine() {
        let base = TempDir::new().unwrap();
        std::fs::create_dir(base.path().join("real")).unwrap();
        symlink(base.path().join("real"), base.path().join("alias")).unwrap();

        let gate = gate_for(&[base.path()]).await;
        let target = format!("{}/alias", base.path().display());
        let resolved = gate
            .validate(&target, &ValidateOptions::default())
            .await
            .unwrap();
        assert_eq!(
            resolved.real_path,
            base.path().canonicalize().unwrap().join("real")
        );
    }

    #[tokio::test]
    async fn create_parents_builds_the_chain() {
        let base = TempDir::new().unwrap();
        let gate = gate_for(&[base.path()]).await;
        let target = format!("{}/a/b/c/file.bin", base.path().display());
        let resolved = gate
            .validate(
                &target,
                &ValidateOptions {
                    create_parents: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(base.path().join("a/b/c").is_dir());
        assert!(resolved.real_path.ends_with("a/b/c/file.bin"));
    }

    #[tokio::test]
    async fn create_parents_applies_directory_ownership() {
        use nix::unistd::{getgid, getuid};
        use std::os::unix::fs::PermissionsExt;

        let base = TempDir::new().unwrap();
        let gate = gate_for(&[base.path()]).await;
        let own = crate::owner::Ownership {
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
            file_mode: 0o640,
            dir_mode: None,
        };

        let target = format!("{}/x/y/file.bin", base.path().display());
        gate.validate(
            &target,
            &ValidateOptions {
                create_parents: true,
                ownership: Some(own),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // Every created level below the base carries the derived dir mode;
        // the base itself is left alone.
        for level in ["x", "x/y"] {
            let mode = std::fs::metadata(base.path().join(level))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(mode, 0o750, "level {level}");
        }
    }

    #[tokio::test]
    async fn same_base_requires_identical_base() {
        let b1 = TempDir::new().unwrap();
        let b2 = TempDir::new().unwrap();
        std::fs::write(b1.path().join("x"), b"x").unwrap();
        let gate = gate_for(&[b1.path(), b2.path()]).await;

        let from = format!("{}/x", b1.path().display());
        let to_same = format!("{}/y", b1.path().display());
        let to_other = format!("{}/y", b2.path().display());

        assert!(gate.validate_same_base(&from, &to_same).await.is_ok());
        assert!(matches!(
            gate.validate_same_base(&from, &to_other).await.unwrap_err(),
            GateError::DifferentBase
        ));
    }
}
