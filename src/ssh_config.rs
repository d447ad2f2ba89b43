use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Writes (or rewrites) the `~/.ssh/config` stanza for a workload's SSH
/// host alias, per spec.md §6. Any prior entry with the same host pattern
/// is removed before the new one is inserted, so repeated bring-ups with a
/// different forwarded port don't accumulate stale stanzas.
///
/// Grounded on `pkg/ssh/config.go`'s `addHostToSSHConfig`.
pub fn upsert_host_entry(
    ssh_config_path: &Path,
    host: &str,
    local_forwarded_port: u16,
    identity_file: &Path,
) -> Result<()> {
    let existing = std::fs::read_to_string(ssh_config_path).unwrap_or_default();
    let stripped = remove_host_block(&existing, host);

    let mut block = String::new();
    block.push_str(&format!("Host {host}\n"));
    block.push_str("    ForwardAgent yes\n");
    block.push_str("    HostName 127.0.0.1\n");
    block.push_str(&format!("    Port {local_forwarded_port}\n"));
    block.push_str("    StrictHostKeyChecking no\n");
    block.push_str("    UserKnownHostsFile /dev/null\n");
    block.push_str(&format!("    IdentityFile {}\n", identity_file.display()));
    block.push_str("    IdentitiesOnly yes\n");

    let mut updated = stripped;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(&block);

    if let Some(parent) = ssh_config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    atomic_write(ssh_config_path, updated.as_bytes())
        .with_context(|| format!("failed to write {}", ssh_config_path.display()))?;

    Ok(())
}

/// Removes a previously-written `Host <host>` block (from the `Host` line
/// up to, but not including, the next top-level `Host` line or EOF), so
/// re-running bring-up never leaves duplicate stanzas behind.
fn remove_host_block(contents: &str, host: &str) -> String {
    let target = format!("Host {host}");
    let mut out = Vec::new();
    let mut skipping = false;

    for line in contents.lines() {
        let trimmed = line.trim_start();
        if trimmed == target {
            skipping = true;
            continue;
        }
        if skipping && trimmed.starts_with("Host ") {
            skipping = false;
        }
        if !skipping {
            out.push(line);
        }
    }

    let mut joined = out.join("\n");
    if !contents.is_empty() && !joined.is_empty() {
        joined.push('\n');
    }
    joined
}

fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp_path: PathBuf = path.with_extension("podwire-tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(data)?;
    }
    std::fs::rename(&tmp_path, path)
}

/// Default path consulted/modified: `~/.ssh/config`.
pub fn default_ssh_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".ssh").join("config"))
}

/// The host pattern used for a given workload: `<workload>.<namespace>.bunnyshell`.
pub fn host_for(workload_name: &str, namespace: &str) -> String {
    format!("{workload_name}.{namespace}.bunnyshell")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn inserts_new_host_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config");

        upsert_host_entry(&path, "api.team-a.bunnyshell", 54321, Path::new("/id_rsa")).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("Host api.team-a.bunnyshell"));
        assert!(contents.contains("Port 54321"));
        assert!(contents.contains("IdentityFile /id_rsa"));
    }

    #[test]
    fn replaces_prior_entry_for_same_host_without_duplicating() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config");

        upsert_host_entry(&path, "api.team-a.bunnyshell", 11111, Path::new("/id_rsa")).unwrap();
        upsert_host_entry(&path, "api.team-a.bunnyshell", 22222, Path::new("/id_rsa")).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.matches("Host api.team-a.bunnyshell").count(), 1);
        assert!(contents.contains("Port 22222"));
        assert!(!contents.contains("Port 11111"));
    }

    #[test]
    fn preserves_unrelated_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "Host other.example\n    HostName example.com\n").unwrap();

        upsert_host_entry(&path, "api.team-a.bunnyshell", 54321, Path::new("/id_rsa")).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("Host other.example"));
        assert!(contents.contains("Host api.team-a.bunnyshell"));
    }
}
