#![forbid(unsafe_code)]

//! Security helpers shared by the xTap binaries: a root-user guard and the
//! pre-shared secret used to authenticate HTTP requests.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use nix::unistd::Uid;
use tracing::warn;

/// Fails fast when a binary is started as root. Both binaries write into the
/// invoking user's home directory, so running them privileged is always a
/// configuration mistake.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; run it as the browser user");
    }
    Ok(())
}

/// Reads the shared secret provisioned by the installer. The token is a
/// single line; surrounding whitespace is stripped.
pub fn load_token(secret_path: &Path) -> Result<String> {
    let raw = fs::read_to_string(secret_path).with_context(|| {
        format!(
            "shared secret {} not found; run the installer first",
            secret_path.display()
        )
    })?;
    let token = raw.trim().to_string();
    if token.is_empty() {
        bail!("shared secret {} is empty", secret_path.display());
    }
    warn_on_loose_permissions(secret_path);
    Ok(token)
}

#[cfg(unix)]
fn warn_on_loose_permissions(secret_path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(metadata) = fs::metadata(secret_path) {
        let mode = metadata.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(
                path = %secret_path.display(),
                mode = format!("{:o}", mode & 0o777),
                "shared secret is readable by other users"
            );
        }
    }
}

#[cfg(not(unix))]
fn warn_on_loose_permissions(_secret_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Uid;

    #[test]
    fn ensure_not_root_allows_unprivileged_uid() {
        let uid = Uid::from_raw(1000);
        assert!(ensure_not_root_for(uid, "tester").is_ok());
    }

    #[test]
    fn ensure_not_root_rejects_root_uid() {
        let uid = Uid::from_raw(0);
        let err = ensure_not_root_for(uid, "tester").unwrap_err();
        assert!(err.to_string().contains("must not be run as root"));
    }

    #[test]
    fn load_token_trims_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        fs::write(&path, "  s3cret-token\n").unwrap();
        assert_eq!(load_token(&path).unwrap(), "s3cret-token");
    }

    #[test]
    fn load_token_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_token(&dir.path().join("secret")).unwrap_err();
        assert!(err.to_string().contains("run the installer"));
    }

    #[test]
    fn load_token_rejects_empty_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        fs::write(&path, "\n").unwrap();
        assert!(load_token(&path).is_err());
    }
}
