use crate::errors::{PodwireError, Result};
use crate::k8s::patch::sync_session_name;
use crate::session::types::Session;
use crate::workspace;
use anyhow::Context;
use flate2::read::GzDecoder;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tar::Archive;
use tokio::process::Command;
use tracing::{info, warn};

const BIN_FILENAME: &str = "mutagen";
const DOWNLOAD_VERSION: &str = "v0.18.1";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const IGNORE_FILE: &str = ".rdignore";

/// Mirrors the Go source's `mutagen/config` YAML schema. Only the `sync`
/// top-level key is ever populated; everything else is omitted, matching
/// the `omitempty` tags on the upstream structs.
#[derive(Debug, Serialize)]
struct MutagenConfig {
    sync: SyncSection,
}

#[derive(Debug, Serialize)]
struct SyncSection {
    defaults: SyncDefaults,
}

#[derive(Debug, Serialize)]
struct SyncDefaults {
    mode: String,
    ignore: IgnoreSection,
}

#[derive(Debug, Serialize)]
struct IgnoreSection {
    vcs: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    paths: Vec<String>,
}

fn download_filename() -> String {
    let os = std::env::consts::OS;
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    format!("mutagen_{os}_{arch}_{DOWNLOAD_VERSION}.tar.gz")
}

fn download_url(filename: &str) -> String {
    format!("https://github.com/mutagen-io/mutagen/releases/download/{DOWNLOAD_VERSION}/{filename}")
}

pub fn bin_path() -> Result<PathBuf> {
    Ok(workspace::workspace_dir()
        .map_err(|_| PodwireError::DownloadFailed("workspace unavailable".to_string()))?
        .join(BIN_FILENAME))
}

fn config_path(session_key: &str) -> Result<PathBuf> {
    Ok(workspace::workspace_dir()
        .map_err(|_| PodwireError::DownloadFailed("workspace unavailable".to_string()))?
        .join(format!("mutagen.{session_key}.yaml")))
}

/// Ensures the sync engine binary is present, downloading and extracting it
/// on first use. Grounded on `pkg/remote/mutagen.go`'s `ensureMutagenBin`.
pub async fn ensure_binary() -> Result<PathBuf> {
    let path = bin_path()?;

    if let Ok(meta) = tokio::fs::metadata(&path).await {
        if meta.is_file() && meta.len() > 0 {
            return Ok(path);
        }
    }

    let filename = download_filename();
    let archive_path = path.with_file_name(&filename);
    let url = download_url(&filename);

    info!(url, "downloading sync engine binary");
    download_archive(&url, &archive_path).await?;
    extract_binary(&archive_path, &path)?;
    let _ = tokio::fs::remove_file(&archive_path).await;

    Ok(path)
}

async fn download_archive(url: &str, destination: &Path) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|e| PodwireError::DownloadFailed(e.to_string()))?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| PodwireError::DownloadFailed(e.to_string()))?
        .error_for_status()
        .map_err(|e| PodwireError::DownloadFailed(e.to_string()))?;

    let bytes = response
        .bytes()
        .await
        .map_err(|e| PodwireError::DownloadFailed(e.to_string()))?;

    tokio::fs::write(destination, &bytes)
        .await
        .map_err(|e| PodwireError::DownloadFailed(e.to_string()))?;

    Ok(())
}

/// Extracts the single entry named `mutagen` from the downloaded
/// `tar.gz`, preserving the tar header's file mode (so the extracted
/// binary is already executable on unix).
fn extract_binary(archive_path: &Path, destination: &Path) -> Result<()> {
    let file = std::fs::File::open(archive_path)
        .map_err(|e| PodwireError::DownloadFailed(e.to_string()))?;
    let mut archive = Archive::new(GzDecoder::new(file));

    let entries = archive
        .entries()
        .map_err(|e| PodwireError::DownloadFailed(e.to_string()))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| PodwireError::DownloadFailed(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| PodwireError::DownloadFailed(e.to_string()))?;
        if path.as_os_str() == BIN_FILENAME {
            entry
                .unpack(destination)
                .map_err(|e| PodwireError::DownloadFailed(e.to_string()))?;
            return Ok(());
        }
    }

    Err(PodwireError::DownloadFailed(format!(
        "archive did not contain an entry named {BIN_FILENAME:?}"
    )))
}

/// Parses `<localSyncPath>/.rdignore`, skipping blank lines and
/// `#`-comments. Returns `None` if the file is absent so the caller can
/// emit a one-time informational message and omit the paths list.
fn read_ignore_paths(local_sync_path: &str) -> Option<Vec<String>> {
    let ignore_file = Path::new(local_sync_path).join(IGNORE_FILE);
    let contents = std::fs::read_to_string(ignore_file).ok()?;
    Some(
        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect(),
    )
}

/// Writes the per-session YAML config, rewritten on every bring-up.
/// Grounded on `pkg/remote/mutagen.go`'s `ensureMutagenConfigFile` and the
/// `mutagen/config` package's schema.
pub fn write_session_config(session: &Session) -> Result<PathBuf> {
    let remote_sync_path = session
        .remote_sync_path
        .as_deref()
        .ok_or(PodwireError::NoResourceSelected)?;
    let local_sync_path = session
        .local_sync_path
        .as_deref()
        .ok_or(PodwireError::NoResourceSelected)?;

    let session_key = sync_session_name(remote_sync_path, &session.workload.name, &session.namespace);
    let path = config_path(&session_key)?;

    let paths = match read_ignore_paths(local_sync_path) {
        Some(paths) => paths,
        None => {
            info!("no .rdignore found under {local_sync_path}, syncing without extra ignores");
            Vec::new()
        }
    };

    let config = MutagenConfig {
        sync: SyncSection {
            defaults: SyncDefaults {
                mode: session.sync_mode.as_mutagen_str().to_string(),
                ignore: IgnoreSection { vcs: true, paths },
            },
        },
    };

    let yaml = serde_yaml_ng::to_string(&config).context("failed to marshal sync engine config")?;
    std::fs::write(&path, yaml).context("failed to write sync engine config")?;

    Ok(path)
}

fn session_name(session: &Session) -> Result<String> {
    let remote_sync_path = session
        .remote_sync_path
        .as_deref()
        .ok_or(PodwireError::NoResourceSelected)?;
    let key = sync_session_name(remote_sync_path, &session.workload.name, &session.namespace);
    Ok(format!("rd-{key}"))
}

/// Spawns `sync create` for the session. Grounded on
/// `pkg/remote/mutagen.go`'s `startMutagenSession`.
pub async fn start(session: &Session, ssh_hostname: &str) -> Result<()> {
    let bin = ensure_binary().await?;
    let config = write_session_config(session)?;
    let name = session_name(session)?;
    let local_sync_path = session
        .local_sync_path
        .as_deref()
        .ok_or(PodwireError::NoResourceSelected)?;
    let remote_sync_path = session
        .remote_sync_path
        .as_deref()
        .ok_or(PodwireError::NoResourceSelected)?;

    let output = Command::new(&bin)
        .args([
            "sync",
            "create",
            "-n",
            &name,
            "--no-global-configuration",
            "-c",
        ])
        .arg(&config)
        .arg(local_sync_path)
        .arg(format!("{ssh_hostname}:{remote_sync_path}"))
        .output()
        .await
        .map_err(|e| PodwireError::SyncEngineError {
            exit: -1,
            output: e.to_string(),
        })?;

    if !output.status.success() {
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        return Err(PodwireError::SyncEngineError {
            exit: output.status.code().unwrap_or(-1),
            output: combined,
        });
    }

    Ok(())
}

/// `sync terminate <name>` — never fatal if the binary is absent.
pub async fn stop(session: &Session) -> Result<()> {
    let Ok(bin) = bin_path() else { return Ok(()) };
    if !bin.is_file() {
        return Ok(());
    }
    let Ok(name) = session_name(session) else {
        return Ok(());
    };

    if let Err(err) = Command::new(&bin).args(["sync", "terminate", &name]).status().await {
        warn!(%err, "failed to terminate sync session, continuing teardown");
    }
    Ok(())
}

/// `daemon stop` — never fatal if the binary is absent.
pub async fn shutdown() -> Result<()> {
    let Ok(bin) = bin_path() else { return Ok(()) };
    if !bin.is_file() {
        return Ok(());
    }

    if let Err(err) = Command::new(&bin).args(["daemon", "stop"]).status().await {
        warn!(%err, "failed to stop sync daemon, continuing teardown");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_filename_maps_rust_arch_names_to_mutagen_names() {
        let filename = download_filename();
        assert!(filename.starts_with("mutagen_"));
        assert!(filename.ends_with(".tar.gz"));
    }

    #[test]
    fn ignore_paths_skip_blank_lines_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".rdignore"),
            "node_modules\n# a comment\n\nvendor\n",
        )
        .unwrap();

        let paths = read_ignore_paths(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(paths, vec!["node_modules".to_string(), "vendor".to_string()]);
    }

    #[test]
    fn missing_ignore_file_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_ignore_paths(dir.path().to_str().unwrap()).is_none());
    }
}
