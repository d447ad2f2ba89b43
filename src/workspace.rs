use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const WORKSPACE_DIRNAME: &str = ".bunnyshell";
const REMOTE_DEV_DIRNAME: &str = "remote-dev";

/// Local per-user directory for keys, the sync tool binary, and per-session
/// config files. All other components request paths through this module;
/// nothing else decides file locations.
///
/// Grounded on `util/workspace.go`'s `GetWorkspaceDir`/`GetRemoteDevWorkspaceDir`.
pub fn workspace_dir() -> Result<PathBuf> {
    let home = dirs::home_dir();

    let base = match home {
        Some(home) if home != Path::new("/") => home.join(WORKSPACE_DIRNAME),
        _ => PathBuf::from("/bunnyshell"),
    };

    let dir = base.join(REMOTE_DEV_DIRNAME);
    ensure_dir(&dir)?;
    Ok(dir)
}

#[cfg(unix)]
fn ensure_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if !dir.exists() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create workspace dir {}", dir.display()))?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
            .with_context(|| format!("failed to chmod workspace dir {}", dir.display()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create workspace dir {}", dir.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_dir_is_idempotent() {
        let first = workspace_dir().expect("first call should succeed");
        let second = workspace_dir().expect("second call should be idempotent");
        assert_eq!(first, second);
        assert!(first.exists());
    }
}
