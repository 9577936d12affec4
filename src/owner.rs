//! Ownership parsing and application: uid/gid/mode triples, directory-mode
//! derivation, chown+chmod, and the development-mode override.

use nix::errno::Errno;
use nix::unistd::{chown, Gid, Uid};
use serde::{Deserialize, Serialize};
use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum OwnerError {
    #[error("invalid mode: {0}")]
    InvalidMode(String),

    #[error("invalid uid/gid")]
    InvalidIds,

    #[error("permission denied (not root?)")]
    PermissionDenied,

    #[error("{0}")]
    Io(String),
}

/// `(uid, gid, fileMode, dirMode?)` as supplied by the upstream. Modes are
/// 9-bit permission triples; `dir_mode` falls back to a derivation from
/// `file_mode` when absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
    pub file_mode: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir_mode: Option<u32>,
}

/// Parse a 3- or 4-digit octal mode string ("644", "0755").
pub fn parse_mode(s: &str) -> Result<u32, OwnerError> {
    if !(3..=4).contains(&s.len()) || !s.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
        return Err(OwnerError::InvalidMode(s.to_string()));
    }
    u32::from_str_radix(s, 8).map_err(|_| OwnerError::InvalidMode(s.to_string()))
}

/// For each of owner/group/other with the read bit set, also set the
/// execute bit; no bit of `mode` is ever cleared. 0o644→0o755, 0o600→0o700.
pub fn derive_dir_mode(mode: u32) -> u32 {
    mode | ((mode & 0o444) >> 2)
}

impl Ownership {
    pub fn from_parts(
        uid: u32,
        gid: u32,
        file_mode: &str,
        dir_mode: Option<&str>,
    ) -> Result<Self, OwnerError> {
        Ok(Self {
            uid,
            gid,
            file_mode: parse_mode(file_mode)?,
            dir_mode: dir_mode.map(parse_mode).transpose()?,
        })
    }

    pub fn dir_mode(&self) -> u32 {
        self.dir_mode.unwrap_or_else(|| derive_dir_mode(self.file_mode))
    }

    pub fn apply_file(
        &self,
        path: &Path,
        dev_override: Option<(u32, u32)>,
    ) -> Result<(), OwnerError> {
        apply(path, self.uid, self.gid, self.file_mode, dev_override)
    }

    pub fn apply_dir(
        &self,
        path: &Path,
        dev_override: Option<(u32, u32)>,
    ) -> Result<(), OwnerError> {
        apply(path, self.uid, self.gid, self.dir_mode(), dev_override)
    }

    /// Depth-first application over a tree: directory mode before descent,
    /// file mode on files. Aborts on the first error; the caller decides
    /// what to do with partially written trees.
    pub fn apply_recursive(
        &self,
        path: &Path,
        dev_override: Option<(u32, u32)>,
    ) -> Result<(), OwnerError> {
        let meta = std::fs::symlink_metadata(path).map_err(|e| OwnerError::Io(e.to_string()))?;
        if meta.is_dir() {
            self.apply_dir(path, dev_override)?;
            let entries = std::fs::read_dir(path).map_err(|e| OwnerError::Io(e.to_string()))?;
            for entry in entries {
                let entry = entry.map_err(|e| OwnerError::Io(e.to_string()))?;
                self.apply_recursive(&entry.path(), dev_override)?;
            }
            Ok(())
        } else {
            self.apply_file(path, dev_override)
        }
    }
}

fn apply(
    path: &Path,
    uid: u32,
    gid: u32,
    mode: u32,
    dev_override: Option<(u32, u32)>,
) -> Result<(), OwnerError> {
    let (uid, gid) = match dev_override {
        Some((u, g)) => {
            info!(
                path = %path.display(),
                uid = u,
                gid = g,
                "development override active, forcing uid/gid"
            );
            (u, g)
        }
        None => (uid, gid),
    };

    chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))).map_err(|e| match e {
        Errno::EPERM => OwnerError::PermissionDenied,
        Errno::EINVAL => OwnerError::InvalidIds,
        other => OwnerError::Io(other.to_string()),
    })?;
    std::fs::set_permissions(path, Permissions::from_mode(mode))
        .map_err(|e| OwnerError::Io(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{getgid, getuid};
    use tempfile::TempDir;

    #[test]
    fn parses_three_and_four_digit_octal() {
        assert_eq!(parse_mode("644").unwrap(), 0o644);
        assert_eq!(parse_mode("0755").unwrap(), 0o755);
        assert!(parse_mode("8aa").is_err());
        assert!(parse_mode("77").is_err());
        assert!(parse_mode("07777").is_err());
        assert!(parse_mode("rwx").is_err());
    }

    #[test]
    fn dir_mode_derivation_adds_exec_for_readable_principals() {
        assert_eq!(derive_dir_mode(0o644), 0o755);
        assert_eq!(derive_dir_mode(0o600), 0o700);
        assert_eq!(derive_dir_mode(0o640), 0o750);
        assert_eq!(derive_dir_mode(0o444), 0o555);
        // Never clears a bit.
        for m in [0o644, 0o600, 0o640, 0o751, 0o222] {
            assert_eq!(derive_dir_mode(m) & m, m);
        }
    }

    #[test]
    fn explicit_dir_mode_wins_over_derivation() {
        let own = Ownership::from_parts(1, 1, "644", Some("700")).unwrap();
        assert_eq!(own.dir_mode(), 0o700);
        let own = Ownership::from_parts(1, 1, "644", None).unwrap();
        assert_eq!(own.dir_mode(), 0o755);
    }

    #[test]
    fn applies_mode_recursively() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("f.txt"), b"x").unwrap();

        // chown to ourselves so the test runs unprivileged.
        let own = Ownership {
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
            file_mode: 0o600,
            dir_mode: None,
        };
        own.apply_recursive(dir.path(), None).unwrap();

        let dir_mode = std::fs::metadata(&sub).unwrap().permissions().mode() & 0o777;
        let file_mode = std::fs::metadata(sub.join("f.txt")).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        assert_eq!(file_mode, 0o600);
    }

    #[test]
    fn dev_override_replaces_ids_but_keeps_mode() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();

        let own = Ownership {
            uid: 0,
            gid: 0,
            file_mode: 0o640,
            dir_mode: None,
        };
        // Override to our own ids: the chown succeeds unprivileged and the
        // requested root ownership never lands.
        own.apply_file(&file, Some((getuid().as_raw(), getgid().as_raw())))
            .unwrap();
        let mode = std::fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }
}
